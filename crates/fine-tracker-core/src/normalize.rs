//! Pure field normalizers: raw cell text to typed values.
//!
//! Every function here is total over arbitrary input. Unparseable text maps
//! to `None` (or an empty list) so one malformed cell never takes down the
//! row it belongs to.

use std::sync::OnceLock;

use regex::Regex;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

static NUMERIC_TOKEN: OnceLock<Regex> = OnceLock::new();
static CITATION_SPLIT: OnceLock<Regex> = OnceLock::new();

/// Date shapes the source has used over time, day-first where ambiguous.
static DATE_FORMATS: &[&[FormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]"),
    format_description!("[day padding:none].[month padding:none].[year]"),
    format_description!("[day padding:none]/[month padding:none]/[year]"),
    format_description!("[day padding:none] [month repr:long case_sensitive:false] [year]"),
    format_description!("[day padding:none] [month repr:short case_sensitive:false] [year]"),
];

fn compiled(pattern: &'static str, slot: &'static OnceLock<Regex>) -> &'static Regex {
    slot.get_or_init(|| match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid built-in pattern {pattern:?}: {err}"),
    })
}

/// Parses a monetary amount in euros from free text.
///
/// Accepts `€ 1.200.000`, `1,200,000`, `1 200 000`, `50.000,5`, `9000` and
/// similar. Separators before three-digit groups are treated as thousands
/// marks and dropped; a remaining comma is a decimal comma. Text without a
/// numeric token (`"N/A"`, `"unknown"`) yields `None`.
#[must_use]
pub fn amount_eur(raw: &str) -> Option<f64> {
    // The source also groups digits with plain or non-breaking spaces;
    // drop those so the numeric token spans the whole amount.
    let compact: String = raw
        .chars()
        .filter(|ch| !matches!(ch, ' ' | '\u{a0}' | '\u{202f}'))
        .collect();
    let token = compiled(r"\d[\d.,]*", &NUMERIC_TOKEN).find(&compact)?.as_str();
    let normalized = strip_thousands_separators(token).replace(',', ".");
    normalized.parse::<f64>().ok()
}

// A '.' or ',' between a digit and a group of exactly three digits (with no
// fourth digit following) is a thousands separator. The check runs on bytes;
// the token regex guarantees ASCII input.
fn strip_thousands_separators(token: &str) -> String {
    let bytes = token.as_bytes();
    let mut out = String::with_capacity(token.len());
    for (index, &byte) in bytes.iter().enumerate() {
        if byte == b'.' || byte == b',' {
            let preceded = index > 0 && bytes[index - 1].is_ascii_digit();
            let rest = &bytes[index + 1..];
            let grouped = rest.len() >= 3
                && rest[..3].iter().all(u8::is_ascii_digit)
                && rest.get(3).map_or(true, |next| !next.is_ascii_digit());
            if preceded && grouped {
                continue;
            }
        }
        out.push(char::from(byte));
    }
    out
}

/// Parses a decision date from the shapes the source emits.
#[must_use]
pub fn decision_date(raw: &str) -> Option<Date> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| Date::parse(trimmed, *format).ok())
}

/// Splits a quoted-articles cell into individual citations.
///
/// Delimiters are `;`, `,` and the word `and`; entries are trimmed and
/// deduplicated preserving first-seen order.
#[must_use]
pub fn cited_articles(raw: &str) -> Vec<String> {
    let splitter = compiled(r"(?i)\s*(?:[;,]|\band\b)\s*", &CITATION_SPLIT);
    let mut seen = Vec::new();
    for part in splitter.split(raw) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        if !seen.iter().any(|existing: &String| existing == entry) {
            seen.push(entry.to_string());
        }
    }
    seen
}

/// Trims free text; whitespace-only input becomes `None`.
#[must_use]
pub fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Resolves a possibly-relative href against the listing base URL.
///
/// Handles absolute URLs, scheme-relative (`//host/p`), root-relative
/// (`/p`) and bare-relative (`p`) hrefs. Empty hrefs yield `None`.
#[must_use]
pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if href.contains("://") {
        return Some(href.to_string());
    }
    let (scheme, remainder) = base.split_once("://")?;
    let host = remainder.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    if let Some(rest) = href.strip_prefix("//") {
        return Some(format!("{scheme}://{rest}"));
    }
    if href.starts_with('/') {
        return Some(format!("{scheme}://{host}{href}"));
    }
    let directory = base
        .rfind('/')
        .filter(|&index| index > scheme.len() + 2)
        .map_or_else(|| format!("{base}/"), |index| base[..=index].to_string());
    Some(format!("{directory}{href}"))
}
