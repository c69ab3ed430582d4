//! Text cleaning for the clean stage.
//!
//! Order matters: markup is stripped first so tag-only lines become blank,
//! then running page-number headers and footers are dropped, then characters
//! outside the allow list, and finally whitespace is collapsed.
//!
//! A line holding only a number is ambiguous. It is treated as a page number
//! only when it is the first or last line of a page, which requires page
//! breaks in the text. Elsewhere it is data and kept.

use std::sync::LazyLock;

use regex::Regex;

use super::extract::PAGE_BREAK;

static MARKUP_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--.*?-->|</?[A-Za-z!?][^<>]*>").expect("markup pattern is valid")
});

static PAGE_NUMBER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^(?:
            (?:page|pg\.?|p\.)\s*\d+(?:\s*(?:of|/)\s*\d+)?
          | \d+\s*(?:of|/)\s*\d+
          | [-–—]+\s*\d+\s*[-–—]+
          | 第\s*\d+\s*页(?:\s*[/,，]?\s*共\s*\d+\s*页)?
          | 共\s*\d+\s*页\s*[/,，]?\s*第\s*\d+\s*页
        )$",
    )
    .expect("page number pattern is valid")
});

static BARE_NUMBER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,4}$").expect("bare number pattern is valid"));

/// Replace markup tags with spaces and decode common entities.
pub fn strip_markup(text: &str) -> String {
    let stripped = MARKUP_TAG.replace_all(text, " ");
    stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Whether a whole line is only a page number marker such as `Page 3 of 10`.
pub fn is_page_number_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && PAGE_NUMBER_LINE.is_match(trimmed)
}

fn is_bare_number_line(line: &str) -> bool {
    BARE_NUMBER_LINE.is_match(line.trim())
}

/// Indices of the first and last non-blank lines of a page.
fn page_edges(lines: &[&str]) -> (Option<usize>, Option<usize>) {
    let blank = |line: &&str| line.trim().is_empty();
    (
        lines.iter().position(|l| !blank(l)),
        lines.iter().rposition(|l| !blank(l)),
    )
}

fn is_allowed_char(c: char) -> bool {
    c.is_alphabetic()
        || c.is_numeric()
        || c.is_whitespace()
        || c.is_ascii_punctuation()
        || matches!(c,
            // CJK symbols and punctuation, fullwidth forms
            '\u{3000}'..='\u{303F}' | '\u{FF01}'..='\u{FF65}'
            // Typographic quotes, dashes, ellipsis, middle dot
            | '\u{2010}'..='\u{2027}' | '\u{00B7}')
}

/// Run the full cleaning pipeline. The result may be empty.
pub fn clean_text(raw: &str) -> String {
    let stripped = strip_markup(raw);
    let paged = stripped.contains(PAGE_BREAK);

    let mut out = String::with_capacity(stripped.len());
    let mut pending_blank = false;

    for page in stripped.split(PAGE_BREAK) {
        let lines: Vec<&str> = page.lines().collect();
        let (first, last) = page_edges(&lines);

        for (index, line) in lines.into_iter().enumerate() {
            let at_edge = paged && (Some(index) == first || Some(index) == last);
            if is_page_number_line(line) || (at_edge && is_bare_number_line(line)) {
                continue;
            }

            let cleaned = collapse_line(line);
            if cleaned.is_empty() {
                pending_blank = !out.is_empty();
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
                if pending_blank {
                    out.push('\n');
                }
            }
            pending_blank = false;
            out.push_str(&cleaned);
        }
    }

    out
}

/// Drop disallowed characters and collapse runs of whitespace to one space.
fn collapse_line(line: &str) -> String {
    let mut cleaned = String::with_capacity(line.len());
    let mut last_was_space = true;
    for c in line.chars().filter(|c| is_allowed_char(*c)) {
        if c.is_whitespace() {
            if !last_was_space {
                cleaned.push(' ');
                last_was_space = true;
            }
        } else {
            cleaned.push(c);
            last_was_space = false;
        }
    }
    cleaned.truncate(cleaned.trim_end().len());
    cleaned
}
