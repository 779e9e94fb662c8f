//! Messages persisted in a session's transcript, and the content-block
//! wire shape shared between north-side requests/responses and the raw
//! south-side JSON-RPC payloads.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// A single piece of message content.
///
/// `Other` is a deliberate catch-all: any block whose `type` this bridge
/// doesn't recognize round-trips through it verbatim, byte-for-byte, so a
/// south-side agent that emits a block shape we've never seen doesn't lose
/// data on the way back out.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
    Other(Value),
}

impl ContentBlock {
    fn to_value(&self) -> Value {
        match self {
            Self::Text { text } => serde_json::json!({ "type": "text", "text": text }),
            Self::Image { data, mime_type } => {
                serde_json::json!({ "type": "image", "data": data, "mime_type": mime_type })
            }
            Self::Other(value) => value.clone(),
        }
    }

    fn from_value(value: Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some("text") => match value.get("text").and_then(Value::as_str) {
                Some(text) => Self::Text { text: text.to_string() },
                None => Self::Other(value),
            },
            Some("image") => {
                let data = value.get("data").and_then(Value::as_str);
                let mime_type = value.get("mime_type").and_then(Value::as_str);
                match (data, mime_type) {
                    (Some(data), Some(mime_type)) => Self::Image {
                        data: data.to_string(),
                        mime_type: mime_type.to_string(),
                    },
                    _ => Self::Other(value),
                }
            }
            _ => Self::Other(value),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if !value.is_object() {
            return Err(D::Error::custom("content block must be a JSON object"));
        }
        Ok(Self::from_value(value))
    }
}

/// A single turn in a session's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub session_id: String,
    pub sequence: i64,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: i64,
    /// Raw south-side JSON-RPC content blocks, kept independent of how
    /// `content` is modeled so unknown shapes never get lossily mapped.
    pub south_blocks: Vec<Value>,
}
