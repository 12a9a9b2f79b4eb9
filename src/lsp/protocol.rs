//! JSON-RPC 2.0 envelope types used on the language server pipes.
//!
//! Outbound requests always carry a [`RequestId`] issued by the client.
//! Inbound bodies are classified with [`classify`] before anything tries to
//! match them against the correlation table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only protocol version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier of a client-issued request.
pub type RequestId = u64;

/// JSON-RPC and LSP reserved error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const UNKNOWN_ERROR_CODE: i64 = -32001;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const CONTENT_MODIFIED: i64 = -32801;
}

/// A request expecting a correlated [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message; carries no identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to a [`Request`], carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the envelope into its payload. A missing or `null` result is
    /// returned as [`Value::Null`].
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// The error object of a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code: {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// An inbound message after classification.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Reply to one of our requests.
    Response(Response),
    /// Request initiated by the server. Not serviced.
    ServerRequest { id: Value, method: String },
    /// Notification from the server. Not forwarded.
    Notification { method: String },
}

/// Parses and classifies an inbound frame body.
///
/// A body with a non-null `id` and a `method` is a server request; with an
/// `id` and no `method` it must decode as a [`Response`] with an integer id.
pub(crate) fn classify(body: &[u8]) -> Result<Incoming, serde_json::Error> {
    let value: Value = serde_json::from_slice(body)?;
    let id = value.get("id").filter(|id| !id.is_null()).cloned();
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Ok(Incoming::ServerRequest { id, method }),
        (Some(_), None) => Ok(Incoming::Response(serde_json::from_value(value)?)),
        (None, Some(method)) => Ok(Incoming::Notification { method }),
        (None, None) => Ok(Incoming::Notification {
            method: String::new(),
        }),
    }
}
