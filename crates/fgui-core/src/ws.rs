use crate::api::{RecordEvent, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote service methods a client may invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMethod {
    Find,
    Get,
    Create,
    Update,
    Patch,
    Remove,
}

/// Frames sent from the client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientFrame {
    /// Request/response call; answered by `ServerFrame::Result` or
    /// `ServerFrame::Error` carrying the same `id`.
    Call {
        id: u64,
        method: CallMethod,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// Start forwarding `event` notifications for `path`.
    Listen { path: String, event: RecordEvent },
    /// Stop forwarding `event` notifications for `path`.
    Unlisten { path: String, event: RecordEvent },
}

/// Frames sent from the server to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Result {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: u64,
        error: ServiceError,
    },
    /// Change notification for a collection.
    Event {
        path: String,
        event: RecordEvent,
        data: Value,
    },
}

impl ClientFrame {
    pub fn to_text(&self) -> String {
        // Serializing these enums cannot fail: all keys are strings.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_omits_absent_fields() {
        let frame = ClientFrame::Call {
            id: 3,
            method: CallMethod::Find,
            path: "items".into(),
            record_id: None,
            data: None,
            params: Some(json!({"query": {}})),
        };
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["type"], json!("call"));
        assert_eq!(value["method"], json!("find"));
        assert!(value.get("record_id").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn listen_frame_shape() {
        let frame = ClientFrame::Listen {
            path: "items".into(),
            event: RecordEvent::Patched,
        };
        assert_eq!(
            frame.to_text(),
            r#"{"type":"listen","path":"items","event":"patched"}"#
        );
    }

    #[test]
    fn parse_server_frames() {
        let event = ServerFrame::parse(
            r#"{"type":"event","path":"items","event":"removed","data":{"_id":"a"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerFrame::Event {
                path: "items".into(),
                event: RecordEvent::Removed,
                data: json!({"_id": "a"}),
            }
        );

        let error = ServerFrame::parse(
            r#"{"type":"error","id":9,
                "error":{"name":"NotFound","message":"No record","code":404}}"#,
        )
        .unwrap();
        match error {
            ServerFrame::Error { id, error } => {
                assert_eq!(id, 9);
                assert_eq!(error.code, 404);
                assert_eq!(error.name, "NotFound");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert!(ServerFrame::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(ServerFrame::parse(r#"{"type":"pong"}"#).is_err());
    }
}
