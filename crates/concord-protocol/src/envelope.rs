//! Wire envelope

use serde::{Deserialize, Serialize};

/// `{type, payload, timestamp}` wrapper around every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Sender wall clock in milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, timestamp: i64) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp,
        }
    }
}
