//! Wire codec for the inbound/outbound chat envelope.
//!
//! The wire format is the JSON webhook envelope of the upstream messaging
//! platform. Decoding is deliberately lenient: only an unparseable outer
//! envelope is a hard [`DecodeError`]. A parseable envelope with no
//! extractable text (empty `messages` array, missing `text.body`, blank
//! body) decodes successfully with [`InboundMessage::text`]` = None`.
//!
//! Encoding merges the reply into a copy of the inbound envelope under
//! `content.text.body` instead of building a fresh schema, so downstream
//! consumers keep every field they already understand.

use serde_json::{Value, json};
use tracing_error::SpanTrace;

use crate::message::{ConversationKey, InboundMessage, OutboundMessage};

/// Decode a raw inbound payload into an [`InboundMessage`].
///
/// `attempt` is the delivery attempt count the source derived from broker
/// metadata; it is carried through unchanged.
pub fn decode(raw: &[u8], attempt: u32) -> Result<InboundMessage, DecodeError> {
    let envelope: Value = serde_json::from_slice(raw).map_err(DecodeError::malformed)?;

    let conversation_key = ConversationKey::resolve(&envelope);
    let text = extract_text(&envelope);
    let sender_name = extract_sender_name(&envelope);

    Ok(InboundMessage {
        conversation_key,
        raw: envelope,
        text,
        sender_name,
        attempt,
    })
}

/// Encode an [`OutboundMessage`] into wire bytes.
///
/// The reply is merged into a copy of the original envelope:
///
/// ```json
/// { ...original envelope..., "content": { "text": { "body": "<reply>" } } }
/// ```
///
/// An empty reply is emitted as an explicit empty string. Encoding cannot
/// fail on values produced by [`decode`]: if the original envelope was not a
/// JSON object (e.g. a bare string), the reply is wrapped alongside it under
/// an `"original"` field instead of silently dropping it.
pub fn encode(outbound: &OutboundMessage) -> Vec<u8> {
    let content = json!({ "text": { "body": outbound.reply_text } });

    let merged = match &outbound.original_envelope {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("content".to_owned(), content);
            Value::Object(fields)
        }
        other => json!({ "original": other, "content": content }),
    };

    // In-memory JSON values always serialize.
    serde_json::to_vec(&merged).unwrap_or_default()
}

/// Extract `entry[0].changes[0].value.messages[0].text.body`, treating a
/// blank body the same as a missing one.
fn extract_text(envelope: &Value) -> Option<String> {
    let body = envelope
        .get("entry")?
        .get(0)?
        .get("changes")?
        .get(0)?
        .get("value")?
        .get("messages")?
        .get(0)?
        .get("text")?
        .get("body")?
        .as_str()?;

    if body.trim().is_empty() {
        None
    } else {
        Some(body.to_owned())
    }
}

fn extract_sender_name(envelope: &Value) -> Option<String> {
    envelope
        .get("entry")?
        .get(0)?
        .get("changes")?
        .get(0)?
        .get("value")?
        .get("contacts")?
        .get(0)?
        .get("profile")?
        .get("name")?
        .as_str()
        .map(str::to_owned)
}

/// Error returned when the outer envelope cannot be parsed.
///
/// Decode errors are always permanent: malformed input cannot be retried
/// into validity, so the pipeline dead-letters the delivery immediately.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    source: serde_json::Error,
}

impl DecodeError {
    fn malformed(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }

    /// Compact reason attached to dead-letter entries, without the span
    /// trace the `Display` impl appends.
    pub fn reason(&self) -> String {
        format!("Malformed envelope: {}", self.source)
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Malformed envelope: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
