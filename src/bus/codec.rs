//! Wire record codec.
//!
//! One event per message body, UTF-8, four labelled lines in fixed order:
//!
//! ```text
//! name:<string>
//! emitter:<string>
//! receiver:<string>
//! payload:<string>
//! ```
//!
//! The payload is the last field and is written verbatim, newlines
//! included. In the other three fields a backslash is written as `\\` and
//! a newline as `\n`; any other backslash sequence decodes literally.

use std::borrow::Cow;

use super::{NetworkError, Result};
use crate::event::Event;

const FIELD_NAME: &str = "name:";
const FIELD_EMITTER: &str = "emitter:";
const FIELD_RECEIVER: &str = "receiver:";
const FIELD_PAYLOAD: &str = "payload:";

/// Content type attached to published messages.
pub const CONTENT_TYPE: &str = "text/plain";

/// Encode an event as a wire record.
pub fn encode(event: &Event) -> Vec<u8> {
    let name = escape(event.name());
    let emitter = escape(event.emitter());
    let receiver = escape(event.receiver());

    let mut out = String::with_capacity(
        FIELD_NAME.len()
            + FIELD_EMITTER.len()
            + FIELD_RECEIVER.len()
            + FIELD_PAYLOAD.len()
            + name.len()
            + emitter.len()
            + receiver.len()
            + event.payload().len()
            + 3,
    );
    out.push_str(FIELD_NAME);
    out.push_str(&name);
    out.push('\n');
    out.push_str(FIELD_EMITTER);
    out.push_str(&emitter);
    out.push('\n');
    out.push_str(FIELD_RECEIVER);
    out.push_str(&receiver);
    out.push('\n');
    out.push_str(FIELD_PAYLOAD);
    out.push_str(event.payload());

    out.into_bytes()
}

/// Decode a wire record into an event.
pub fn decode(body: &[u8]) -> Result<Event> {
    let text = std::str::from_utf8(body)
        .map_err(|e| NetworkError::Serialization(format!("record is not UTF-8: {}", e)))?;

    let mut lines = text.splitn(4, '\n');
    let name = field(lines.next(), FIELD_NAME)?;
    let emitter = field(lines.next(), FIELD_EMITTER)?;
    let receiver = field(lines.next(), FIELD_RECEIVER)?;
    let payload = field(lines.next(), FIELD_PAYLOAD)?;

    Ok(Event::new(
        unescape(name),
        unescape(emitter),
        unescape(receiver),
        payload,
    ))
}

fn field<'a>(line: Option<&'a str>, label: &str) -> Result<&'a str> {
    let line = line.ok_or_else(|| {
        NetworkError::Serialization(format!("record is missing field '{}'", label))
    })?;
    line.strip_prefix(label).ok_or_else(|| {
        NetworkError::Serialization(format!("expected field '{}', found '{}'", label, truncate(line)))
    })
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(&['\\', '\n'][..]) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(value: &str) -> Cow<'_, str> {
    if !value.contains('\\') {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Cow::Owned(out)
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(16) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
