//! Chat message extraction from decoded sync trees.
//!
//! Decoded records use numeric string keys. The chat payload lives under `"1"`:
//!
//! | path                     | meaning                                  |
//! |--------------------------|------------------------------------------|
//! | `1.2`                    | conversation id, `<sid>@goofish`         |
//! | `1.3`                    | pnm id (remote message identity)         |
//! | `1.5`                    | message time, epoch millis               |
//! | `1.6.3.4`                | content type discriminator               |
//! | `1.10.reminderContent`   | display text                             |
//! | `1.10.senderUserId`      | author                                   |
//! | `1.10.receiverUserId`    | addressee, when present                  |
//! | `1.10.reminderTitle`     | author display name                      |
//! | `1.10.reminderUrl`       | link carrying `itemId` / `orderId`       |
//!
//! Read receipts carry a root-level `"2"` marker equal to `2`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation ids on the wire carry this suffix.
pub const CONVERSATION_SUFFIX: &str = "@goofish";

/// Plain text chat message.
pub const CONTENT_TYPE_TEXT: i64 = 1;
/// System card (order state changes, payment notices).
pub const CONTENT_TYPE_SYSTEM_CARD: i64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Sent,
    Received,
    ReadReceipt,
    Unknown,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
            Self::ReadReceipt => "read_receipt",
            Self::Unknown => "unknown",
        }
    }
}

/// A chat event pulled out of a decoded sync payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub pnm_id: String,
    /// Conversation id without the `@goofish` suffix.
    pub s_id: String,
    pub content_type: i64,
    pub msg_content: String,
    pub sender_user_id: String,
    pub sender_name: String,
    pub receiver_user_id: Option<String>,
    pub xy_goods_id: Option<String>,
    pub order_id: Option<String>,
    pub message_time: i64,
    pub direction: MessageDirection,
}

impl DecryptedMessage {
    /// Build a message from a decoded tree. Returns `None` for trees that are
    /// not chat messages (typing indicators, read receipts, sync bookkeeping).
    pub fn from_tree(tree: &Value, local_user_id: &str) -> Option<Self> {
        let body = tree.get("1")?.as_object()?;
        let reminder = body.get("10")?.as_object()?;

        let pnm_id = scalar_string(body.get("3")?)?;
        let conversation = body.get("2").and_then(scalar_string).unwrap_or_default();
        let s_id = conversation
            .strip_suffix(CONVERSATION_SUFFIX)
            .unwrap_or(&conversation)
            .to_string();

        let content_type = tree
            .pointer("/1/6/3/4")
            .and_then(scalar_i64)
            .unwrap_or_default();

        let field = |key: &str| reminder.get(key).and_then(scalar_string);
        let url = field("reminderUrl").unwrap_or_default();

        Some(Self {
            pnm_id,
            s_id,
            content_type,
            msg_content: field("reminderContent").unwrap_or_default(),
            sender_user_id: field("senderUserId").unwrap_or_default(),
            sender_name: field("reminderTitle").unwrap_or_default(),
            receiver_user_id: field("receiverUserId"),
            xy_goods_id: crate::util::query_param(&url, "itemId"),
            order_id: crate::util::query_param(&url, "orderId"),
            message_time: body.get("5").and_then(scalar_i64).unwrap_or_default(),
            direction: classify_direction(tree, local_user_id),
        })
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        !user_id.is_empty() && self.sender_user_id == user_id
    }

    /// Wire form of the conversation id.
    pub fn conversation_id(&self) -> String {
        format!("{}{CONVERSATION_SUFFIX}", self.s_id)
    }
}

/// Classify a decoded tree relative to the local account.
pub fn classify_direction(tree: &Value, local_user_id: &str) -> MessageDirection {
    if tree.get("2").and_then(scalar_string).as_deref() == Some("2") {
        return MessageDirection::ReadReceipt;
    }
    if local_user_id.is_empty() {
        return MessageDirection::Unknown;
    }

    let sender = tree.pointer("/1/10/senderUserId").and_then(scalar_string);
    let receiver = tree.pointer("/1/10/receiverUserId").and_then(scalar_string);

    if sender.as_deref() == Some(local_user_id) {
        MessageDirection::Sent
    } else if receiver.as_deref() == Some(local_user_id) {
        MessageDirection::Received
    } else {
        MessageDirection::Unknown
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
