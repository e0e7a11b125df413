//! Request/response envelopes.
//!
//! `{protocol: "2.0", method, params, id?}` in, `{protocol: "2.0",
//! result|error, id}` out. A request without an `id` is a notification and
//! produces no response. Batches are arrays of envelopes; an empty batch is
//! itself INVALID_REQUEST. Malformed JSON is PARSE_ERROR; a structurally
//! valid document that is not a proper envelope is INVALID_REQUEST.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcCode, RpcErrorObject};

/// Protocol version accepted and emitted.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Request id: string or integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

/// One parsed request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub protocol: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<RequestId>,
}

impl RequestEnvelope {
    /// Structural validation beyond deserialization.
    pub fn validate(&self) -> Result<(), RpcErrorObject> {
        if self.protocol != PROTOCOL_VERSION {
            return Err(RpcErrorObject::new(
                RpcCode::InvalidRequest,
                format!("unsupported protocol version: {}", self.protocol),
            ));
        }
        if self.method.is_empty() {
            return Err(RpcErrorObject::new(
                RpcCode::InvalidRequest,
                "method must not be empty",
            ));
        }
        Ok(())
    }

    /// Notifications omit `id` and get no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// One response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<RequestId>,
}

impl ResponseEnvelope {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcErrorObject) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// A request document: one envelope or a batch.
#[derive(Debug)]
pub enum RequestDocument {
    Single(Result<RequestEnvelope, RpcErrorObject>),
    Batch(Vec<Result<RequestEnvelope, RpcErrorObject>>),
}

/// Parse a raw request body into envelopes, distinguishing PARSE_ERROR
/// (not JSON) from INVALID_REQUEST (JSON, wrong shape).
pub fn parse_request(body: &[u8]) -> Result<RequestDocument, RpcErrorObject> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RpcErrorObject::new(RpcCode::ParseError, format!("invalid JSON: {e}")))?;

    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(RpcErrorObject::new(
                    RpcCode::InvalidRequest,
                    "empty batch",
                ));
            }
            Ok(RequestDocument::Batch(
                items.into_iter().map(parse_envelope).collect(),
            ))
        }
        other => Ok(RequestDocument::Single(parse_envelope(other))),
    }
}

fn parse_envelope(value: Value) -> Result<RequestEnvelope, RpcErrorObject> {
    let envelope: RequestEnvelope = serde_json::from_value(value).map_err(|e| {
        RpcErrorObject::new(RpcCode::InvalidRequest, format!("malformed envelope: {e}"))
    })?;
    envelope.validate()?;
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_request() {
        let body = br#"{"protocol":"2.0","method":"task.create","params":{"text":"x"},"id":1}"#;
        match parse_request(body).unwrap() {
            RequestDocument::Single(Ok(envelope)) => {
                assert_eq!(envelope.method, "task.create");
                assert_eq!(envelope.id, Some(RequestId::Int(1)));
                assert!(!envelope.is_notification());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn string_ids_are_accepted() {
        let body = br#"{"protocol":"2.0","method":"system.health","id":"req-7"}"#;
        match parse_request(body).unwrap() {
            RequestDocument::Single(Ok(envelope)) => {
                assert_eq!(envelope.id, Some(RequestId::Str("req-7".into())));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = parse_request(b"{not json").unwrap_err();
        assert_eq!(err.code, RpcCode::ParseError.code());
    }

    #[test]
    fn wrong_shape_is_invalid_request() {
        let body = br#"{"protocol":"2.0"}"#;
        match parse_request(body).unwrap() {
            RequestDocument::Single(Err(err)) => {
                assert_eq!(err.code, RpcCode::InvalidRequest.code());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_protocol_is_invalid_request() {
        let body = br#"{"protocol":"1.0","method":"x"}"#;
        match parse_request(body).unwrap() {
            RequestDocument::Single(Err(err)) => {
                assert_eq!(err.code, RpcCode::InvalidRequest.code());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_batch_rejected() {
        let err = parse_request(b"[]").unwrap_err();
        assert_eq!(err.code, RpcCode::InvalidRequest.code());
    }

    #[test]
    fn batch_mixes_good_and_bad_entries() {
        let body = br#"[
            {"protocol":"2.0","method":"system.health","id":1},
            {"protocol":"2.0"},
            {"protocol":"2.0","method":"system.metrics"}
        ]"#;
        match parse_request(body).unwrap() {
            RequestDocument::Batch(entries) => {
                assert_eq!(entries.len(), 3);
                assert!(entries[0].is_ok());
                assert!(entries[1].is_err());
                // Third is a notification.
                assert!(entries[2].as_ref().unwrap().is_notification());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_serialization_omits_absent_members() {
        let ok = ResponseEnvelope::success(Some(RequestId::Int(1)), json!({"x": 1}));
        let wire = serde_json::to_value(&ok).unwrap();
        assert!(wire.get("error").is_none());
        assert_eq!(wire["protocol"], "2.0");

        let err = ResponseEnvelope::failure(
            None,
            RpcErrorObject::new(RpcCode::MethodNotFound, "nope"),
        );
        let wire = serde_json::to_value(&err).unwrap();
        assert!(wire.get("result").is_none());
        assert_eq!(wire["error"]["code"], -32601);
        assert_eq!(wire["id"], Value::Null);
    }
}
