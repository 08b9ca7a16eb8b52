//! Push message envelope.

use serde::{Deserialize, Serialize};

/// Envelope for every server-to-client push.
///
/// Clients dispatch on `type`; the payload shape is type-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

impl PushMessage {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let message = PushMessage::new(
            "WEATHER_JOB_UPDATE",
            serde_json::json!({ "jobId": 1, "weathers": [] }),
        );
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"type":"WEATHER_JOB_UPDATE","payload":{"jobId":1,"weathers":[]}}"#
        );
    }
}
