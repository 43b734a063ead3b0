//! Reply/quote/signature detection over normalized message text.
//!
//! A line-oriented port of the classic reply-parser heuristic: the body is
//! segmented into fragments classified as authored (visible) or
//! quoted/signature (hidden). The heuristic is inherently approximate;
//! its fragment-classification behavior is preserved as-is rather than
//! tuned per edge case.

use std::sync::LazyLock;

use regex::Regex;

/// "On <date>, <author> wrote:" headers and the classic original/forwarded
/// message banners. Everything from the first match onward is quoted
/// history.
static QUOTE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(On\s.{1,200}\swrote:\s*$|-{2,}\s*Original Message\s*-{2,}|-{2,}\s*Forwarded message\s*-{2,})",
    )
    .unwrap()
});

static QUOTED_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*>").unwrap());

static SIGNATURE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(--\s*$|__\s*$|Sent from my\s.+|Best regards,?\s*$|Kind regards,?\s*$)")
        .unwrap()
});

/// A classified segment of the message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub content: String,
    pub hidden: bool,
}

/// Segment `text` into visible and hidden fragments, in document order.
///
/// Classification:
/// - the first quote-header line and everything after it is hidden;
/// - `>`-prefixed runs are hidden;
/// - a trailing signature (a signature delimiter whose suffix contains no
///   blank line, i.e. no further authored paragraph) is hidden.
pub fn parse_fragments(text: &str) -> Vec<Fragment> {
    let normalized = text.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.lines().collect();

    let quote_start = lines.iter().position(|l| QUOTE_HEADER.is_match(l));
    let signature_start = find_trailing_signature(&lines, quote_start.unwrap_or(lines.len()));

    let mut fragments: Vec<Fragment> = Vec::new();
    let mut current = String::new();
    let mut current_hidden = false;

    for (idx, line) in lines.iter().enumerate() {
        let hidden = quote_start.is_some_and(|q| idx >= q)
            || signature_start.is_some_and(|s| idx >= s)
            || QUOTED_LINE.is_match(line);

        if hidden != current_hidden && !current.is_empty() {
            fragments.push(Fragment {
                content: std::mem::take(&mut current),
                hidden: current_hidden,
            });
        }
        current_hidden = hidden;
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        fragments.push(Fragment {
            content: current,
            hidden: current_hidden,
        });
    }
    fragments
}

/// Find the line index where a trailing signature begins, looking only at
/// authored text above `limit`. A delimiter only counts when no blank line
/// (i.e. no further authored paragraph) follows it.
fn find_trailing_signature(lines: &[&str], limit: usize) -> Option<usize> {
    let region = &lines[..limit.min(lines.len())];
    let mut end = region.len();
    // Ignore trailing blank lines between body and quoted history.
    while end > 0 && region[end - 1].trim().is_empty() {
        end -= 1;
    }
    for idx in (0..end).rev() {
        let line = region[idx];
        if line.trim().is_empty() {
            // A paragraph break below any candidate means the candidate
            // was mid-body, not a trailing signature.
            return None;
        }
        if SIGNATURE_START.is_match(line) {
            return Some(idx);
        }
    }
    None
}

/// Concatenated visible fragments, trimmed of surrounding blanks.
pub fn visible_text(fragments: &[Fragment]) -> String {
    join(fragments, false)
}

/// Concatenated hidden fragments.
pub fn hidden_text(fragments: &[Fragment]) -> String {
    join(fragments, true)
}

fn join(fragments: &[Fragment], hidden: bool) -> String {
    fragments
        .iter()
        .filter(|f| f.hidden == hidden)
        .map(|f| f.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
