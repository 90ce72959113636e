//! `.eml` uploads, parsed with `mail-parser`.
//!
//! Produces a short header block (Subject, From, To, Date) followed by the
//! readable body parts. `mail-parser` undoes transfer encodings and RFC 2047
//! words, decodes declared charsets, prefers `text/plain` inside
//! `multipart/alternative` and renders HTML-only bodies as text. Attachments
//! are not part of the text body and are skipped.

use mail_parser::{Address, MessageParser};

use super::ParseError;

pub(super) fn extract(bytes: &[u8]) -> Result<String, ParseError> {
    let message = MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| ParseError::Email("not an RFC 822 message".to_string()))?;
    if message.headers().is_empty() {
        return Err(ParseError::Email("no message headers found".to_string()));
    }

    let mut out = String::new();
    if let Some(subject) = message.subject() {
        out.push_str(&format!("Subject: {}\n", subject));
    }
    if let Some(from) = message.from().map(mailboxes).filter(|s| !s.is_empty()) {
        out.push_str(&format!("From: {}\n", from));
    }
    if let Some(to) = message.to().map(mailboxes).filter(|s| !s.is_empty()) {
        out.push_str(&format!("To: {}\n", to));
    }
    if let Some(date) = message.date() {
        out.push_str(&format!("Date: {}\n", date.to_rfc3339()));
    }

    let bodies: Vec<String> = (0..message.text_body_count())
        .filter_map(|i| message.body_text(i))
        .map(|text| text.trim_end().to_string())
        .filter(|text| !text.is_empty())
        .collect();
    if !bodies.is_empty() {
        out.push('\n');
        out.push_str(&bodies.join("\n\n"));
    }
    Ok(out)
}

/// `Name <addr>` entries joined with commas.
fn mailboxes(address: &Address<'_>) -> String {
    address
        .iter()
        .filter_map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
            (None, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        })
        .collect::<Vec<_>>()
        .join(", ")
}
