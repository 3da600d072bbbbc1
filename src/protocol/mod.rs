//! Wire envelopes for the IM gateway.
//!
//! Every frame is a JSON object `{"lwp": path, "headers": {...}, "body": ...}`.
//! Responses drop `lwp` and carry a numeric `code` instead.

pub mod ids;
pub mod sign;

pub use ids::{generate_device_id, generate_mid, generate_send_uuid};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const PATH_REGISTER: &str = "/reg";
pub const PATH_SYNC_ACK: &str = "/r/SyncStatus/ackDiff";
pub const PATH_HEARTBEAT: &str = "/!";
pub const PATH_SEND_MESSAGE: &str = "/r/MessageSend/sendByReceiverScope";
pub const PATH_SYNC_PUSH: &str = "/s/para";
pub const PATH_SYNC_PUSH_ALT: &str = "/s/sync";

/// App key sent in the registration headers.
pub const IM_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";

/// Headers copied from an inbound frame into its ack when present.
const ACK_ECHO_HEADERS: &[&str] = &["app-key", "ua", "dt"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "lwp", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_headers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl Envelope {
    pub fn request(path: &str, headers: BTreeMap<String, String>, body: Option<Value>) -> Self {
        Self {
            path: Some(path.to_string()),
            headers,
            body,
            code: None,
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn mid(&self) -> Option<&str> {
        self.header("mid")
    }

    pub fn sid(&self) -> Option<&str> {
        self.header("sid")
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    /// Path-less frame carrying a status code.
    pub fn is_response(&self) -> bool {
        self.path.is_none() && self.code.is_some()
    }
}

/// Header values are strings on the wire, but some server frames send numbers
/// or booleans. Scalars are stringified, nested values dropped.
fn lenient_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Number(n) => Some((k, n.to_string())),
            Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect())
}

fn headers<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Registration frame sent right after the transport opens.
pub fn registration(credential: &str, device_id: &str, user_agent: &str, now_ms: i64) -> Envelope {
    Envelope::request(
        PATH_REGISTER,
        headers([
            ("cache-header", "app-key token ua wv".to_string()),
            ("app-key", IM_APP_KEY.to_string()),
            ("token", credential.to_string()),
            ("ua", user_agent.to_string()),
            ("dt", "j".to_string()),
            ("wv", "im:3,au:3,sy:6".to_string()),
            ("sync", "0,0;0;0;".to_string()),
            ("did", device_id.to_string()),
            ("mid", generate_mid(now_ms)),
        ]),
        None,
    )
}

/// Sync acknowledgement declaring sequence zero so the server replays pending events.
pub fn sync_ack(now_ms: i64) -> Envelope {
    Envelope::request(
        PATH_SYNC_ACK,
        headers([("mid", generate_mid(now_ms))]),
        Some(json!([{
            "pipeline": "sync",
            "tooLong2Tag": "PNM,1",
            "channel": "sync",
            "topic": "sync",
            "highPts": 0,
            "pts": now_ms * 1000,
            "seq": 0,
            "timestamp": now_ms,
        }])),
    )
}

pub fn heartbeat(now_ms: i64) -> Envelope {
    Envelope::request(PATH_HEARTBEAT, headers([("mid", generate_mid(now_ms))]), None)
}

/// Ack for an inbound frame: echoes its `mid` and `sid` (falling back to the
/// session id assigned at registration) plus the client identity headers.
pub fn ack_for(inbound: &Envelope, session_sid: Option<&str>) -> Envelope {
    let mut echoed = BTreeMap::new();
    if let Some(mid) = inbound.mid() {
        echoed.insert("mid".to_string(), mid.to_string());
    }
    if let Some(sid) = inbound.sid().or(session_sid) {
        echoed.insert("sid".to_string(), sid.to_string());
    }
    for key in ACK_ECHO_HEADERS {
        if let Some(value) = inbound.header(key) {
            echoed.insert((*key).to_string(), value.to_string());
        }
    }
    Envelope {
        path: None,
        headers: echoed,
        body: None,
        code: Some(200),
    }
}

/// Outbound text message to one conversation.
pub fn send_text(
    conversation_id: &str,
    recipient_id: &str,
    local_user_id: &str,
    text: &str,
    now_ms: i64,
) -> Envelope {
    let custom = json!({"contentType": 1, "text": {"text": text}});
    let cid = if conversation_id.ends_with(crate::codec::message::CONVERSATION_SUFFIX) {
        conversation_id.to_string()
    } else {
        format!("{conversation_id}{}", crate::codec::message::CONVERSATION_SUFFIX)
    };
    Envelope::request(
        PATH_SEND_MESSAGE,
        headers([("mid", generate_mid(now_ms))]),
        Some(json!([
            {
                "uuid": generate_send_uuid(now_ms),
                "cid": cid,
                "conversationType": 1,
                "content": {
                    "contentType": 101,
                    "custom": {
                        "type": 1,
                        "data": STANDARD.encode(custom.to_string()),
                    }
                },
                "redPointPolicy": 0,
                "extension": {"extJson": "{}"},
                "ctx": {"appVersion": "1.0", "platform": "web"},
                "mtags": {},
                "msgReadStatusSetting": 1,
            },
            {
                "actualReceivers": [
                    format!("{recipient_id}@goofish"),
                    format!("{local_user_id}@goofish"),
                ]
            }
        ])),
    )
}

/// Encoded payloads carried by a sync push frame (`body.syncPushPackage.data[].data`).
pub fn sync_push_payloads(envelope: &Envelope) -> Vec<String> {
    envelope
        .body
        .as_ref()
        .and_then(|body| body.pointer("/syncPushPackage/data"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("data").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
