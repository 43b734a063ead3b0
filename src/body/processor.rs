//! Inbound interpretation of a synced message body.
//!
//! Constructed per message; each output is computed once per instance and
//! memoized. Instances are pure functions of their constructor input, so
//! distinct messages can be processed in parallel.

use std::cell::OnceCell;
use std::sync::LazyLock;

use regex::Regex;

use crate::body::format::{auto_link, auto_paragraph, externalize_anchors, format_html};
use crate::body::quote;
use crate::model::EmailAccountMessage;

/// Attribution-wrapper markers this application inserts into replies it
/// composes. Two variants are matched for backward compatibility with
/// messages generated by older releases. Matched against preview text,
/// i.e. after class prefixing.
pub const ATTRIBUTION_MARKERS: [&str; 2] = [
    r#"<div class="c_mailcrm-attribution">"#,
    r#"<blockquote class="c_mailcrm-quote">"#,
];

/// Message body processor: preview, visible, and hidden text.
pub struct MessageBodyProcessor {
    html_body: Option<String>,
    text_body: Option<String>,
    is_sent_via_app: bool,
    is_reply: bool,
    preview: OnceCell<String>,
    visible: OnceCell<String>,
    hidden: OnceCell<String>,
}

impl MessageBodyProcessor {
    pub fn new(
        html_body: Option<String>,
        text_body: Option<String>,
        is_sent_via_app: bool,
        is_reply: bool,
    ) -> Self {
        Self {
            html_body,
            text_body,
            is_sent_via_app,
            is_reply,
            preview: OnceCell::new(),
            visible: OnceCell::new(),
            hidden: OnceCell::new(),
        }
    }

    pub fn for_message(message: &EmailAccountMessage) -> Self {
        Self::new(
            message.html_body.clone(),
            message.text_body.clone(),
            message.is_sent_via_app,
            message.is_reply(),
        )
    }

    /// Full body prepared for inline display.
    pub fn preview_text(&self) -> &str {
        self.preview.get_or_init(|| match &self.html_body {
            Some(html) => format_html(html),
            None => auto_paragraph(self.text_body.as_deref().unwrap_or("")),
        })
    }

    /// The authored part of the body.
    pub fn visible_text(&self) -> &str {
        self.visible.get_or_init(|| self.split().0)
    }

    /// The quoted-history/signature part of the body.
    pub fn hidden_text(&self) -> &str {
        self.hidden.get_or_init(|| self.split().1)
    }

    fn split(&self) -> (String, String) {
        let preview = self.preview_text();

        // Replies this application sent carry a known attribution wrapper;
        // splitting at the marker is exact, no heuristic needed. The split
        // partitions the preview: visible + hidden == preview.
        if self.is_sent_via_app && self.is_reply {
            for marker in ATTRIBUTION_MARKERS {
                if let Some(idx) = preview.find(marker) {
                    return (preview[..idx].to_string(), preview[idx..].to_string());
                }
            }
        }

        // Heuristic path: classify fragments over the text rendering of
        // the normalized body, then re-apply HTML formatting.
        let source = match &self.html_body {
            Some(html) => html_to_text(html),
            None => self.text_body.clone().unwrap_or_default(),
        };
        let fragments = quote::parse_fragments(&source);
        let visible = quote::visible_text(&fragments);
        let hidden = quote::hidden_text(&fragments);

        let render = |text: &str| externalize_anchors(&auto_link(&auto_paragraph(text)));
        let visible_html = if visible.is_empty() {
            // Empty visible segmentation falls back to the full preview.
            preview.to_string()
        } else {
            render(&visible)
        };
        let hidden_html = if hidden.is_empty() {
            String::new()
        } else {
            render(&hidden)
        };
        (visible_html, hidden_html)
    }
}

/// Render HTML into line-oriented text for the quote heuristic. Block
/// boundaries become newlines so the classifier sees one logical line per
/// rendered line.
fn html_to_text(html: &str) -> String {
    static BLOCK_BREAK: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</blockquote>|</tr>").unwrap());
    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

    let with_breaks = BLOCK_BREAK.replace_all(html, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    // `&amp;` last, otherwise `&amp;lt;` decodes twice into `<`.
    stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &str) -> MessageBodyProcessor {
        MessageBodyProcessor::new(None, Some(text.to_string()), false, false)
    }

    #[test]
    fn plain_text_preview_is_auto_paragraphed() {
        let processor = plain("hello\n\nworld");
        assert_eq!(processor.preview_text(), auto_paragraph("hello\n\nworld"));
        assert_eq!(processor.preview_text(), "<p>hello</p>\n<p>world</p>");
    }

    #[test]
    fn preview_is_memoized_and_idempotent() {
        let processor = plain("once");
        let first = processor.preview_text().to_string();
        assert_eq!(processor.preview_text(), first);
        assert_eq!(processor.visible_text(), processor.visible_text());
        assert_eq!(processor.hidden_text(), processor.hidden_text());
    }

    #[test]
    fn html_preview_prunes_hidden_and_prefixes_classes() {
        let processor = MessageBodyProcessor::new(
            Some(r#"<p class="intro">hi</p><span style="display:none">pixel</span>"#.into()),
            None,
            false,
            false,
        );
        let preview = processor.preview_text();
        assert!(!preview.contains("pixel"));
        assert!(!preview.contains("display:none"));
        assert!(preview.contains("c_intro"));
    }

    #[test]
    fn app_sent_reply_splits_at_marker() {
        let marker = ATTRIBUTION_MARKERS[0];
        // Pre-prefixed class so the preview pipeline leaves it untouched.
        let html = format!(
            r#"<p>new answer</p>{marker}<p>older thread</p></div>"#
        );
        let processor = MessageBodyProcessor::new(Some(html), None, true, true);
        let preview = processor.preview_text().to_string();
        let visible = processor.visible_text().to_string();
        let hidden = processor.hidden_text().to_string();
        assert!(visible.contains("new answer"));
        assert!(!visible.contains(marker));
        assert!(hidden.starts_with(marker));
        assert_eq!(format!("{visible}{hidden}"), preview);
    }

    #[test]
    fn legacy_marker_variant_also_splits() {
        let marker = ATTRIBUTION_MARKERS[1];
        let html = format!(r#"<p>reply</p>{marker}<p>history</p></blockquote>"#);
        let processor = MessageBodyProcessor::new(Some(html), None, true, true);
        let visible = processor.visible_text().to_string();
        let hidden = processor.hidden_text().to_string();
        assert!(visible.contains("reply"));
        assert!(hidden.contains("history"));
        assert_eq!(
            format!("{visible}{hidden}"),
            processor.preview_text().to_string()
        );
    }

    #[test]
    fn marker_in_foreign_message_is_ignored() {
        // Not sent via app: the marker must not trigger the exact split.
        let html = format!(r#"<p>hello</p>{}"#, ATTRIBUTION_MARKERS[0]);
        let processor = MessageBodyProcessor::new(Some(html), None, false, true);
        assert!(processor.visible_text().contains("hello"));
    }

    #[test]
    fn heuristic_split_for_plain_reply() {
        let text = "Works for me.\n\nOn Fri, Mar 1, 2024 at 2:00 PM Sam wrote:\n> does Tuesday work?";
        let processor = plain(text);
        assert_eq!(processor.visible_text(), "<p>Works for me.</p>");
        let hidden = processor.hidden_text();
        assert!(hidden.contains("does Tuesday work?"));
    }

    #[test]
    fn heuristic_split_over_html_body() {
        let html = "<div>Great, thanks!</div><div><br></div><div>On Mon, Jun 3, 2024 at 1:15 PM Lee wrote:</div><blockquote>&gt; original question</blockquote>";
        let processor = MessageBodyProcessor::new(Some(html.into()), None, false, true);
        let visible = processor.visible_text();
        assert!(visible.contains("Great, thanks!"));
        assert!(!visible.contains("original question"));
        assert!(processor.hidden_text().contains("original question"));
    }

    #[test]
    fn empty_visible_falls_back_to_preview() {
        let processor = plain("> fully quoted\n> nothing authored");
        assert_eq!(processor.visible_text(), processor.preview_text());
    }

    #[test]
    fn visible_anchors_open_externally() {
        let processor = plain("Check https://example.com/report\n\nOn Tue, Apr 2, 2024 at 9:00 AM Kim wrote:\n> see report");
        let visible = processor.visible_text();
        assert!(visible.contains(r#"<a href="https://example.com/report" target="_blank" rel="noopener noreferrer">"#));
        assert!(!visible.contains("see report"));
    }

    #[test]
    fn html_to_text_breaks_blocks() {
        let text = html_to_text("<div>a</div><div>b<br>c</div>");
        assert_eq!(text, "a\nb\nc");
    }

    #[test]
    fn html_to_text_decodes_entities_once() {
        assert_eq!(html_to_text("<p>a &amp;lt; b &amp; c</p>"), "a &lt; b & c");
    }

    #[test]
    fn marker_split_keeps_external_anchors_rewritten() {
        let marker = ATTRIBUTION_MARKERS[0];
        let html = format!(
            r#"<p>see <a href="https://example.com/doc">doc</a></p>{marker}<p>quoted</p></div>"#
        );
        let processor = MessageBodyProcessor::new(Some(html), None, true, true);
        let visible = processor.visible_text().to_string();
        let hidden = processor.hidden_text().to_string();
        assert!(visible.contains(r#"target="_blank" rel="noopener noreferrer""#));
        assert_eq!(
            format!("{visible}{hidden}"),
            processor.preview_text().to_string()
        );
    }
}
