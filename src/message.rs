//! Message values and conversation-key resolution.
//!
//! The pipeline works on two immutable values:
//!
//! - [`InboundMessage`]: the decoded inbound envelope, carrying the resolved
//!   [`ConversationKey`], the extracted user text (if any), and the delivery
//!   attempt count
//! - [`OutboundMessage`]: the reply, which keeps a copy of the inbound
//!   envelope so the encoder can merge the reply into it rather than build a
//!   fresh schema
//!
//! The broker delivery tag is deliberately *not* part of [`InboundMessage`];
//! it stays inside the pipeline's [`Delivery`](crate::source::Delivery) so
//! business logic can never ack or reject on its own.

use std::fmt;

use serde_json::Value;

/// Stable partition identity grouping all messages of one logical dialogue.
///
/// For the chat-envelope wire format this is
/// `"{display_phone_number}.{wa_id}"`; any component missing from the
/// envelope is replaced by the literal `"unknown"`, so resolution never
/// fails and the worst case is `"unknown.unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Resolve the conversation key from a parsed inbound envelope.
    ///
    /// Walks `entry[0].changes[0].value`, taking the channel address from
    /// `metadata.display_phone_number` and the participant identity from
    /// `contacts[0].wa_id`. Every level of the walk tolerates missing or
    /// mistyped structure; this function cannot fail.
    pub fn resolve(envelope: &Value) -> Self {
        let value = change_value(envelope);

        let channel = value
            .get("metadata")
            .and_then(|m| m.get("display_phone_number"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown");

        let participant = value
            .get("contacts")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("wa_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown");

        ConversationKey(format!("{channel}.{participant}"))
    }

    /// Build a key from an already-known identity (tests, fixtures).
    pub fn from_parts(channel: &str, participant: &str) -> Self {
        ConversationKey(format!("{channel}.{participant}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Navigate to `entry[0].changes[0].value`, defaulting every missing level
/// to an empty object.
fn change_value(envelope: &Value) -> &Value {
    static EMPTY: Value = Value::Null;
    envelope
        .get("entry")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("changes"))
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("value"))
        .unwrap_or(&EMPTY)
}

/// Immutable value decoded from the inbound wire envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Partition identity for ordering and concurrency control.
    pub conversation_key: ConversationKey,
    /// The parsed original envelope, preserved for the merge-back reply.
    pub raw: Value,
    /// Extracted user text. `None` is a valid, non-fatal state (e.g. an
    /// envelope with an empty `messages` array).
    pub text: Option<String>,
    /// Sender display name from `contacts[0].profile.name`, when present.
    pub sender_name: Option<String>,
    /// Number of prior delivery attempts.
    pub attempt: u32,
}

/// Immutable reply value produced after successful processing.
///
/// Carries the inbound envelope it correlates with; the codec merges
/// `reply_text` into a copy of that envelope (merge-not-replace).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Key of the conversation this reply belongs to.
    pub correlates_with: ConversationKey,
    /// Reply body. An empty string is emitted explicitly, never omitted.
    pub reply_text: String,
    /// The original inbound envelope the reply is merged into.
    pub original_envelope: Value,
}

impl OutboundMessage {
    /// Build a reply for an inbound message.
    pub fn reply_to(inbound: &InboundMessage, reply_text: impl Into<String>) -> Self {
        Self {
            correlates_with: inbound.conversation_key.clone(),
            reply_text: reply_text.into(),
            original_envelope: inbound.raw.clone(),
        }
    }
}
