//! HTML formatting passes shared by the inbound preview pipeline and the
//! visible/hidden rendering.
//!
//! Email HTML is hostile input: authored by dozens of editors, styled by
//! stylesheets the host UI must not inherit, and littered with hidden
//! tracking markup. These passes normalize it for safe inline display.

use std::sync::LazyLock;

use regex::Regex;

/// Namespace prefix applied to every class attribute so email-authored
/// utility classes cannot collide with the host UI's CSS framework.
pub const CLASS_PREFIX: &str = "c_";

static CLASS_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class\s*=\s*"([^"]*)""#).unwrap());

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"')]+"#).unwrap());

static STYLE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"style\s*=\s*"([^"]*)""#).unwrap());

static EXTERNAL_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a\s([^>]*href\s*=\s*"https?://[^"]*"[^>]*)>"#).unwrap());

/// Inline stylesheet rules into per-element `style` attributes.
///
/// Remote stylesheets are never fetched; a malformed document falls back
/// to the unmodified input rather than failing the whole preview.
pub fn inline_css(html: &str) -> String {
    static INLINER: LazyLock<css_inline::CSSInliner<'static>> = LazyLock::new(|| {
        css_inline::CSSInliner::options()
            .load_remote_stylesheets(false)
            .build()
    });
    INLINER.inline(html).unwrap_or_else(|_| html.to_string())
}

/// Remove every element whose inline style declares `display:none`.
///
/// Senders hide tracking pixels and quote markers this way; hidden markup
/// must not leak into previews. Works on inlined HTML (after
/// [`inline_css`]), scanning for the opening tag and skipping to the
/// matching close tag with same-name nesting.
pub fn prune_hidden_elements(html: &str) -> String {
    static HIDDEN_OPEN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?is)<([a-z][a-z0-9]*)\b[^>]*style\s*=\s*"[^"]*display\s*:\s*none[^"]*"[^>]*>"#)
            .unwrap()
    });

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(m) = HIDDEN_OPEN.find(rest) {
        out.push_str(&rest[..m.start()]);
        let tag = HIDDEN_OPEN
            .captures(&rest[m.start()..])
            .and_then(|c| c.get(1).map(|g| g.as_str().to_lowercase()))
            .unwrap_or_default();
        let after_open = &rest[m.end()..];
        if m.as_str().ends_with("/>") || is_void_element(&tag) {
            rest = after_open;
            continue;
        }
        rest = skip_to_closing_tag(after_open, &tag);
    }
    out.push_str(rest);
    out
}

fn is_void_element(tag: &str) -> bool {
    matches!(
        tag,
        "img" | "br" | "hr" | "input" | "meta" | "link" | "area" | "base" | "col" | "embed"
            | "source" | "track" | "wbr"
    )
}

/// Skip past the close tag matching an already-consumed open tag,
/// accounting for nested elements of the same name.
fn skip_to_closing_tag<'a>(html: &'a str, tag: &str) -> &'a str {
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    // ASCII-only lowercasing keeps byte offsets aligned with the input;
    // Unicode case mapping can change byte lengths.
    let lower = html.to_ascii_lowercase();
    let mut depth = 1usize;
    let mut pos = 0usize;
    while depth > 0 {
        let next_open = lower[pos..].find(&open).map(|i| pos + i);
        let next_close = lower[pos..].find(&close).map(|i| pos + i);
        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                pos = o + open.len();
            }
            (_, Some(c)) => {
                depth -= 1;
                pos = lower[c..]
                    .find('>')
                    .map(|i| c + i + 1)
                    .unwrap_or(html.len());
            }
            // Unbalanced markup: drop the remainder rather than leaking
            // hidden content.
            _ => return "",
        }
    }
    &html[pos..]
}

/// Downgrade surviving visual styles to legacy presentational attributes
/// for constrained renderers: `text-align` → `align`, `background-color`
/// → `bgcolor`, `width` → `width`.
pub fn presentational_attributes(html: &str) -> String {
    static ELEMENT_WITH_STYLE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"(?is)<([a-z][a-z0-9]*)([^>]*?)(/?)>"#).unwrap());

    ELEMENT_WITH_STYLE
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let tag = &caps[1];
            let attrs = &caps[2];
            let slash = &caps[3];
            let Some(style) = STYLE_ATTR.captures(attrs).map(|c| c[1].to_string()) else {
                return caps[0].to_string();
            };
            let mut extra = String::new();
            if !attrs.contains("align=")
                && let Some(align) = style_property(&style, "text-align")
            {
                extra.push_str(&format!(" align=\"{align}\""));
            }
            if !attrs.contains("bgcolor=")
                && let Some(color) = style_property(&style, "background-color")
            {
                extra.push_str(&format!(" bgcolor=\"{color}\""));
            }
            if !attrs.contains("width=")
                && let Some(width) = style_property(&style, "width")
                && let Some(px) = width.strip_suffix("px")
            {
                extra.push_str(&format!(" width=\"{}\"", px.trim()));
            }
            format!("<{tag}{attrs}{extra}{slash}>")
        })
        .into_owned()
}

fn style_property(style: &str, name: &str) -> Option<String> {
    style.split(';').find_map(|decl| {
        let (key, value) = decl.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Wrap bare URLs in text nodes with anchors. Text inside tags or inside
/// an existing `<a>` element is left untouched.
pub fn auto_link(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut text_start = 0usize;
    let mut in_anchor = false;
    let bytes = html.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            let text = &html[text_start..i];
            out.push_str(&link_text(text, in_anchor));
            let tag_end = html[i..].find('>').map(|p| i + p + 1).unwrap_or(html.len());
            let tag = &html[i..tag_end];
            let tag_lower = tag.to_lowercase();
            if tag_lower.starts_with("<a ") || tag_lower == "<a>" {
                in_anchor = true;
            } else if tag_lower.starts_with("</a") {
                in_anchor = false;
            }
            out.push_str(tag);
            i = tag_end;
            text_start = tag_end;
        } else {
            i += 1;
        }
    }
    out.push_str(&link_text(&html[text_start..], in_anchor));
    out
}

fn link_text(text: &str, in_anchor: bool) -> String {
    if in_anchor || text.is_empty() {
        return text.to_string();
    }
    BARE_URL
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let url = &caps[0];
            format!("<a href=\"{url}\">{url}</a>")
        })
        .into_owned()
}

/// Prefix every class name with [`CLASS_PREFIX`] unless already prefixed.
pub fn prefix_classes(html: &str) -> String {
    CLASS_ATTR
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let prefixed: Vec<String> = caps[1]
                .split_whitespace()
                .map(|class| {
                    if class.starts_with(CLASS_PREFIX) {
                        class.to_string()
                    } else {
                        format!("{CLASS_PREFIX}{class}")
                    }
                })
                .collect();
            format!("class=\"{}\"", prefixed.join(" "))
        })
        .into_owned()
}

/// Rewrite absolute external anchors to open in a new browsing context.
pub fn externalize_anchors(html: &str) -> String {
    EXTERNAL_ANCHOR
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let attrs = &caps[1];
            if attrs.contains("target=") {
                caps[0].to_string()
            } else {
                format!("<a {attrs} target=\"_blank\" rel=\"noopener noreferrer\">")
            }
        })
        .into_owned()
}

/// Wrap plain text in paragraph markup: blank-line-separated blocks become
/// `<p>` elements, single newlines become `<br />`.
pub fn auto_paragraph(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());
    BLANK_LINES
        .split(trimmed)
        .filter(|block| !block.trim().is_empty())
        .map(|block| format!("<p>{}</p>", block.trim().replace('\n', "<br />")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The full inbound preview pipeline over an HTML body.
pub fn format_html(html: &str) -> String {
    let inlined = inline_css(html);
    let pruned = prune_hidden_elements(&inlined);
    let downgraded = presentational_attributes(&pruned);
    let linked = auto_link(&downgraded);
    let externalized = externalize_anchors(&linked);
    prefix_classes(&externalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_paragraph_wraps_blocks() {
        let out = auto_paragraph("first block\nstill first\n\nsecond block");
        assert_eq!(
            out,
            "<p>first block<br />still first</p>\n<p>second block</p>"
        );
    }

    #[test]
    fn auto_paragraph_empty_input() {
        assert_eq!(auto_paragraph("   \n\n  "), "");
    }

    #[test]
    fn prune_removes_hidden_span_and_contents() {
        let html = r#"<p>visible</p><span style="display:none">tracker <b>x</b></span><p>after</p>"#;
        let out = prune_hidden_elements(html);
        assert_eq!(out, "<p>visible</p><p>after</p>");
    }

    #[test]
    fn prune_handles_nested_same_tag() {
        let html = r#"<div style="display: none"><div>inner</div></div><div>kept</div>"#;
        let out = prune_hidden_elements(html);
        assert_eq!(out, "<div>kept</div>");
    }

    #[test]
    fn prune_handles_hidden_img() {
        let html = r#"before<img src="p.gif" style="display:none">after"#;
        assert_eq!(prune_hidden_elements(html), "beforeafter");
    }

    #[test]
    fn prune_keeps_visible_styles() {
        let html = r#"<p style="display:block">shown</p>"#;
        assert_eq!(prune_hidden_elements(html), html);
    }

    #[test]
    fn prefix_classes_adds_namespace() {
        let out = prefix_classes(r#"<div class="btn primary"><span class="c_done">x</span></div>"#);
        assert_eq!(
            out,
            r#"<div class="c_btn c_primary"><span class="c_done">x</span></div>"#
        );
    }

    #[test]
    fn auto_link_wraps_bare_urls_only_in_text() {
        let html = r#"<p>see https://example.com/x for details</p>"#;
        let out = auto_link(html);
        assert_eq!(
            out,
            r#"<p>see <a href="https://example.com/x">https://example.com/x</a> for details</p>"#
        );
    }

    #[test]
    fn auto_link_skips_existing_anchors() {
        let html = r#"<a href="https://example.com">https://example.com</a>"#;
        assert_eq!(auto_link(html), html);
    }

    #[test]
    fn auto_link_skips_urls_in_attributes() {
        let html = r#"<img src="https://example.com/pixel.gif">"#;
        assert_eq!(auto_link(html), html);
    }

    #[test]
    fn presentational_attrs_from_style() {
        let html = r#"<td style="text-align: center; background-color: #fff; width: 120px">x</td>"#;
        let out = presentational_attributes(html);
        assert!(out.contains(r#"align="center""#));
        assert!(out.contains(r##"bgcolor="#fff""##));
        assert!(out.contains(r#"width="120""#));
    }

    #[test]
    fn presentational_attrs_respects_existing() {
        let html = r#"<td align="left" style="text-align: center">x</td>"#;
        let out = presentational_attributes(html);
        assert!(out.contains(r#"align="left""#));
        assert!(!out.contains(r#"align="center""#));
    }

    #[test]
    fn externalize_adds_target_and_rel() {
        let html = r#"<a href="https://example.com">out</a><a href="/local">in</a>"#;
        let out = externalize_anchors(html);
        assert!(out.contains(r#"target="_blank" rel="noopener noreferrer""#));
        assert!(out.contains(r#"<a href="/local">in</a>"#));
    }

    #[test]
    fn externalize_is_idempotent() {
        let html = r#"<a href="https://example.com">out</a>"#;
        let once = externalize_anchors(html);
        assert_eq!(externalize_anchors(&once), once);
    }

    #[test]
    fn format_html_end_to_end() {
        let html = concat!(
            r#"<style>.big { text-align: center; }</style>"#,
            r#"<p class="big">hello https://example.com</p>"#,
            r#"<span style="display:none">hidden</span>"#,
        );
        let out = format_html(html);
        assert!(!out.contains("hidden"));
        assert!(!out.contains("display:none"));
        assert!(out.contains("c_big"));
        assert!(out.contains(
            r#"<a href="https://example.com" target="_blank" rel="noopener noreferrer">"#
        ));
    }

    #[test]
    fn prune_survives_multibyte_case_mapping() {
        // U+0130 lowercases to a longer byte sequence; offsets must stay
        // relative to the original input.
        let html = "<div style=\"display:none\">İ</div>é x";
        assert_eq!(prune_hidden_elements(html), "é x");
    }
}
