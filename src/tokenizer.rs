//! MIME message parsing and keyword extraction.
//!
//! Walks a message's MIME tree with `mailparse`, pulls text out of
//! `text/plain` and `text/html` parts (and filenames out of
//! attachments), then splits that text into lowercase, field-suffixed
//! keywords ready to post into the index.

use std::collections::BTreeSet;

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{MailsieveError, Result};

/// Word-boundary regex: runs of 2+ characters outside the punctuation/
/// whitespace set listed in the tokenization rule, Unicode-aware.
fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[^\s!@#$%\^&*()_+=\{\}\[\]:"|;'\\<>?,./-]{2,}"#).expect("static regex is valid")
    })
}

/// Small, closed stopword list. Not an attempt at language analysis.
const STOPWORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "by", "for", "from", "has", "in", "is", "og", "or", "re",
    "so", "the", "to", "was",
];

/// Whether `word` (already lowercased) is in the fixed stopword list.
pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

/// A message's headers and extracted text, prior to keyword derivation.
#[derive(Debug, Default, Clone)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub references: Vec<String>,
    pub date_header: Option<String>,
    pub from: String,
    pub to: String,
    pub list_id: String,
    pub subject: String,
    pub body_text: String,
    pub attachment_names: Vec<String>,
}

/// Parse an RFC 2822 message's MIME tree into headers and flattened text.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(raw)
        .map_err(|e| MailsieveError::MalformedMessage(format!("failed to parse message: {e}")))?;

    let headers = &mail.headers;
    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut references = Vec::new();
    for key in ["References", "In-Reply-To"] {
        if let Some(value) = headers.get_first_value(key) {
            references.extend(split_message_id_list(&value));
        }
    }

    let mut out = ParsedMessage {
        message_id,
        references,
        date_header: headers.get_first_value("Date"),
        from: headers.get_first_value("From").unwrap_or_default(),
        to: headers.get_first_value("To").unwrap_or_default(),
        list_id: headers
            .get_first_value("List-Id")
            .or_else(|| headers.get_first_value("List-ID"))
            .unwrap_or_default(),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        body_text: String::new(),
        attachment_names: Vec::new(),
    };

    walk_parts(&mail, &mut out.body_text, &mut out.attachment_names);
    Ok(out)
}

/// References/In-Reply-To headers hold Message-IDs separated by
/// whitespace and/or commas.
fn split_message_id_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn walk_parts(part: &ParsedMail<'_>, body_text: &mut String, attachment_names: &mut Vec<String>) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned());
        let is_attachment = disposition.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            if let Some(name) = filename {
                attachment_names.push(name);
            }
            return;
        }

        match ctype.as_str() {
            "text/plain" => {
                if let Some(text) = decode_text_part(part) {
                    if !body_text.is_empty() {
                        body_text.push(' ');
                    }
                    body_text.push_str(&text);
                }
            }
            "text/html" => {
                if let Some(html) = decode_text_part(part) {
                    let width = 120;
                    let text = html2text::from_read(html.as_bytes(), width);
                    if !body_text.is_empty() {
                        body_text.push(' ');
                    }
                    body_text.push_str(&text);
                }
            }
            _ => {}
        }
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, attachment_names);
    }
}

/// Decode a leaf part's text using its declared charset, falling back to
/// an ISO-8859-1 (Latin-1, a lossless 1:1 byte->codepoint mapping).
fn decode_text_part(part: &ParsedMail<'_>) -> Option<String> {
    if let Ok(text) = part.get_body() {
        return Some(text);
    }
    let raw = part.get_body_raw().ok()?;
    Some(raw.iter().map(|&b| b as char).collect())
}

/// Split `text` into lowercase words of 2+ characters at the tokenizer's
/// word boundary, dropping stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    word_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| !is_stopword(w))
        .collect()
}

/// Derive the full, field-suffixed keyword set for a parsed message,
/// given the date already resolved by the caller (§4.8: parse or fall
/// back to `last_used_date + 1`).
pub fn extract_keywords(parsed: &ParsedMessage, resolved_date_unix: i64) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();

    for word in tokenize(&parsed.body_text) {
        keywords.insert(word);
    }
    for word in tokenize(&parsed.subject) {
        keywords.insert(format!("{word}:subject"));
    }
    for word in tokenize(&parsed.from) {
        keywords.insert(format!("{word}:from"));
    }
    for word in tokenize(&parsed.to) {
        keywords.insert(format!("{word}:to"));
    }
    for word in tokenize(&parsed.list_id) {
        keywords.insert(format!("{word}:list"));
    }

    if !parsed.attachment_names.is_empty() {
        keywords.insert("attachment:has".to_string());
        for name in &parsed.attachment_names {
            for word in tokenize(name) {
                keywords.insert(format!("{word}:att"));
            }
        }
    }

    for keyword in date_keywords(resolved_date_unix) {
        keywords.insert(keyword);
    }

    keywords
}

fn date_keywords(unix_secs: i64) -> Vec<String> {
    use chrono::{DateTime, Datelike, Utc};
    let Some(dt) = DateTime::<Utc>::from_timestamp(unix_secs, 0) else {
        return Vec::new();
    };
    vec![
        format!("{}:year", dt.year()),
        format!("{}:month", dt.month()),
        format!("{}:day", dt.day()),
        format!("{}-{}-{}:date", dt.year(), dt.month(), dt.day()),
    ]
}

/// Parse an RFC 2822 `Date` header into Unix seconds. Returns `None` on
/// any unparseable input; callers fall back to `last_used_date + 1`.
pub fn parse_date_header(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_lowercases_and_drops_stopwords() {
        let words = tokenize("The Report, from Alice.");
        assert_eq!(words, vec!["report", "alice"]);
    }

    #[test]
    fn tokenize_drops_single_character_tokens() {
        let words = tokenize("a bb c dd");
        assert_eq!(words, vec!["bb", "dd"]);
    }

    #[test]
    fn parse_extracts_headers_and_plain_body() {
        let raw = b"From: Alice <alice@example.com>\r\nTo: bob@example.com\r\nSubject: Hi there\r\nMessage-ID: <1@example.com>\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello world";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.subject, "Hi there");
        assert_eq!(parsed.message_id.as_deref(), Some("<1@example.com>"));
        assert!(parsed.body_text.contains("Hello world"));
    }

    #[test]
    fn parse_collects_references_and_in_reply_to() {
        let raw = b"From: a@b\r\nTo: c@d\r\nSubject: re\r\nReferences: <1@x> <2@x>\r\nIn-Reply-To: <2@x>\r\n\r\nbody";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.references, vec!["<1@x>", "<2@x>", "<2@x>"]);
    }

    #[test]
    fn extract_keywords_suffixes_subject_and_from() {
        let mut parsed = ParsedMessage::default();
        parsed.subject = "Budget Report".to_string();
        parsed.from = "alice@example.com".to_string();
        let keywords = extract_keywords(&parsed, 0);
        assert!(keywords.contains("budget:subject"));
        assert!(keywords.contains("report:subject"));
        assert!(keywords.contains("example:from"));
    }

    #[test]
    fn extract_keywords_adds_attachment_markers() {
        let mut parsed = ParsedMessage::default();
        parsed.attachment_names.push("invoice.pdf".to_string());
        let keywords = extract_keywords(&parsed, 0);
        assert!(keywords.contains("attachment:has"));
        assert!(keywords.contains("invoice:att"));
    }

    #[test]
    fn extract_keywords_adds_date_fields() {
        let parsed = ParsedMessage::default();
        let unix = chrono::DateTime::parse_from_rfc3339("2024-06-07T00:00:00Z").unwrap().timestamp();
        let keywords = extract_keywords(&parsed, unix);
        assert!(keywords.contains("2024:year"));
        assert!(keywords.contains("6:month"));
        assert!(keywords.contains("7:day"));
        assert!(keywords.contains("2024-6-7:date"));
    }

    #[test]
    fn parse_date_header_falls_back_on_garbage() {
        assert_eq!(parse_date_header("not a date"), None);
        assert!(parse_date_header("Wed, 1 Jan 2025 00:00:00 +0000").is_some());
    }
}
