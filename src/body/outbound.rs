//! Outbound body transformation, applied when a composer receives an HTML
//! body and before anything reaches the provider.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;

use crate::collab::{MediaResolver, PlaceholderResolver};
use crate::error::MailError;

/// Suffix identifying an app-served inline-image preview URL.
pub const PREVIEW_SUFFIX: &str = "/preview";

/// Marker comment guarding against duplicate tracker injection.
pub const TRACKER_MARKER: &str = "<!-- mailcrm:trackers -->";

static EMPTY_PARAGRAPH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<p[^>]*>(\s|&nbsp;|<br\s*/?>)*</p>").unwrap()
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

static IMG_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(<img[^>]*\bsrc\s*=\s*")([^"]+)("[^>]*>)"#).unwrap());

/// Collapse editor-residual empty paragraphs (empty, whitespace-only,
/// `&nbsp;`-only, or lone `<br>`) into plain newlines.
pub fn normalize_editor_paragraphs(html: &str) -> String {
    EMPTY_PARAGRAPH.replace_all(html, "\n").into_owned()
}

/// Resolve `{{ merge_field }}` placeholders. Unresolvable placeholders are
/// left as-is for the sender to notice.
pub fn resolve_placeholders(html: &str, resolver: &dyn PlaceholderResolver) -> String {
    PLACEHOLDER
        .replace_all(html, |caps: &regex::Captures<'_>| {
            resolver
                .resolve(&caps[1])
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Rewrite inline images served from the application's own media path into
/// base64 data URIs.
///
/// Outgoing messages must stay renderable even if the installation's
/// public URL later changes, so the bytes travel with the message. URLs
/// are recognized by the configured media path prefix plus the preview
/// suffix; the token between them resolves through the media collaborator.
pub async fn embed_inline_images(
    html: &str,
    media_path_prefix: &str,
    media: &dyn MediaResolver,
) -> Result<String, MailError> {
    let mut out = String::with_capacity(html.len());
    let mut last = 0usize;

    for caps in IMG_SRC.captures_iter(html) {
        let whole = caps.get(0).unwrap();
        let src = &caps[2];
        let Some(token) = media_token(src, media_path_prefix) else {
            continue;
        };
        let (bytes, mime) = media.resolve_by_token(token).await?;
        let data_uri = format!("data:{mime};base64,{}", STANDARD.encode(&bytes));

        out.push_str(&html[last..whole.start()]);
        out.push_str(&caps[1]);
        out.push_str(&data_uri);
        out.push_str(&caps[3]);
        last = whole.end();
    }
    out.push_str(&html[last..]);
    Ok(out)
}

/// Extract the media token from an app-served preview URL, or `None` when
/// the URL is foreign.
fn media_token<'a>(src: &'a str, media_path_prefix: &str) -> Option<&'a str> {
    let start = src.find(media_path_prefix)?;
    let token_with_suffix = &src[start + media_path_prefix.len()..];
    let token = token_with_suffix.strip_suffix(PREVIEW_SUFFIX)?;
    if token.is_empty() || token.contains('/') {
        return None;
    }
    Some(token)
}

/// Append the analytics tracker snippet. Idempotent: a body already
/// carrying the marker is returned unchanged.
pub fn inject_trackers(html: &str, snippet: &str) -> String {
    if html.contains(TRACKER_MARKER) {
        return html.to_string();
    }
    format!("{html}\n{TRACKER_MARKER}\n{snippet}")
}
