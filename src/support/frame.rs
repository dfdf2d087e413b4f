//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) transport wraps every message in a small
//! array envelope:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    /// Build a Call frame.
    pub fn call(
        unique_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::Call {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Build a CallResult frame answering `unique_id`.
    pub fn result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Build a CallError frame answering `unique_id`.
    pub fn error(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }

    /// Parse raw JSON text into a frame.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> = serde_json::from_str(text)
            .map_err(|e| OcppFrameError::InvalidJson(e.to_string()))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(OcppFrameError::InvalidMessageType)?;

        let unique_id = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or(OcppFrameError::FieldTypeMismatch("uniqueId must be a string"))?
            .to_string();

        match msg_type {
            MSG_TYPE_CALL => {
                if arr.len() < 4 {
                    return Err(OcppFrameError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                let action = arr[2]
                    .as_str()
                    .ok_or(OcppFrameError::FieldTypeMismatch("action must be a string"))?
                    .to_string();
                Ok(Self::Call {
                    unique_id,
                    action,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                if arr.len() < 3 {
                    return Err(OcppFrameError::MissingFields {
                        expected: 3,
                        got: arr.len(),
                    });
                }
                Ok(Self::CallResult {
                    unique_id,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                if arr.len() < 4 {
                    return Err(OcppFrameError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                Ok(Self::CallError {
                    unique_id,
                    error_code: arr[2].as_str().unwrap_or("InternalError").to_string(),
                    error_description: arr
                        .get(3)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    error_details: arr
                        .get(4)
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                })
            }
            other => Err(OcppFrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize this frame to a JSON string.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    /// Unique message ID of this frame.
    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Returns `true` if this is a `Call` frame.
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

/// Errors that can occur when parsing an OCPP-J frame.
#[derive(Debug, Error)]
pub enum OcppFrameError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message type is missing or not a number")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","RemoteStartTransaction",{"idTag":"TAG01"}]"#;
        let frame = OcppFrame::parse(text).unwrap();
        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "RemoteStartTransaction");
                assert_eq!(payload["idTag"], "TAG01");
            }
            _ => panic!("Expected Call frame"),
        }
    }

    #[test]
    fn parse_call_result() {
        let text = r#"[3,"id-7",{"idTagInfo":{"status":"Accepted"}}]"#;
        let frame = OcppFrame::parse(text).unwrap();
        match frame {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "id-7");
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            _ => panic!("Expected CallResult frame"),
        }
    }

    #[test]
    fn parse_call_error() {
        let text = r#"[4,"id-9","NotImplemented","Action not supported",{}]"#;
        let frame = OcppFrame::parse(text).unwrap();
        match frame {
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                assert_eq!(unique_id, "id-9");
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_description, "Action not supported");
            }
            _ => panic!("Expected CallError frame"),
        }
    }

    #[test]
    fn reject_garbage() {
        assert!(OcppFrame::parse("not json").is_err());
        assert!(OcppFrame::parse("[]").is_err());
        assert!(OcppFrame::parse(r#"[9,"id",{}]"#).is_err());
        assert!(OcppFrame::parse(r#"[2,"id"]"#).is_err());
    }

    #[test]
    fn roundtrip_call() {
        let frame = OcppFrame::call("id1", "Heartbeat", serde_json::json!({}));
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert!(parsed.is_call());
        assert_eq!(parsed.unique_id(), "id1");
    }

    #[test]
    fn roundtrip_call_error() {
        let frame = OcppFrame::error("id3", "GenericError", "Something went wrong");
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.unique_id(), "id3");
        assert!(matches!(parsed, OcppFrame::CallError { .. }));
    }
}
