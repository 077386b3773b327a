use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::error::{RpcError, RpcResult};
use super::id::CorrelationId;

/// Protocol tag carried by every envelope on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 notification (no id, no reply expected)
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 request
///
/// Inbound requests keep the peer's id verbatim; outbound requests always carry
/// a [`CorrelationId`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 success response
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Response {
    pub id: Value,
    pub result: Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub id: Value,
    pub error: ErrorObject,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error type indicator (must be integer)
    pub code: i64,

    /// Short error description
    pub message: String,

    /// Additional error information (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Pre-defined JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        *self as i64
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
        }
    }
}

impl ErrorObject {
    /// Create an error object from a predefined code
    pub fn new(code: ErrorCode, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data,
        }
    }

    /// Create a custom error
    pub fn custom(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.filter(|value| !value.is_null()),
        }
    }
}

/// The four message shapes of JSON-RPC 2.0.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Notify(Notification),
    Request(Request),
    Result(Response),
    Error(ErrorResponse),
}

/// Kind of a classified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Notify,
    Request,
    Result,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Notify => "notify",
            MessageKind::Request => "request",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer value of a JSON number, whether it was written as `1` or `1.0`.
pub(crate) fn integer_value(value: &Value) -> Option<i64> {
    if let Some(integer) = value.as_i64() {
        return Some(integer);
    }
    // i64::MIN and 2^63 are exact as f64
    let float = value.as_f64()?;
    let in_range = float >= i64::MIN as f64 && float < -(i64::MIN as f64);
    (float.fract() == 0.0 && in_range).then(|| float as i64)
}

/// Rewrite an integral float such as `1.0` as the integer `1`.
fn normalize_integer(slot: Option<&mut Value>) {
    if let Some(slot) = slot {
        if slot.is_f64() {
            if let Some(integer) = integer_value(slot) {
                *slot = Value::from(integer);
            }
        }
    }
}

fn check_params(params: Option<Value>) -> RpcResult<Option<Value>> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(value @ (Value::Object(_) | Value::Array(_))) => Ok(Some(value)),
        Some(_) => Err(RpcError::InvalidArgument(
            "optional \"params\" must be an object or an array".to_string(),
        )),
    }
}

impl Envelope {
    /// Build a notification.
    pub fn notify(method: impl Into<String>, params: Option<Value>) -> RpcResult<Self> {
        Ok(Envelope::Notify(Notification {
            method: method.into(),
            params: check_params(params)?,
        }))
    }

    /// Build a request carrying `id`.
    pub fn request(
        id: CorrelationId,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> RpcResult<Self> {
        Ok(Envelope::Request(Request {
            id: id.into(),
            method: method.into(),
            params: check_params(params)?,
        }))
    }

    /// Build a success response. A `null` result is kept and written out.
    pub fn result(id: CorrelationId, result: Value) -> Self {
        Envelope::Result(Response {
            id: id.into(),
            result,
        })
    }

    /// Build an error response.
    pub fn error(
        id: CorrelationId,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Envelope::Error(ErrorResponse {
            id: id.into(),
            error: ErrorObject::custom(code, message, data),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Notify(_) => MessageKind::Notify,
            Envelope::Request(_) => MessageKind::Request,
            Envelope::Result(_) => MessageKind::Result,
            Envelope::Error(_) => MessageKind::Error,
        }
    }

    /// Correlation id, if any. Notifications have none.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Envelope::Notify(_) => None,
            Envelope::Request(request) => Some(&request.id),
            Envelope::Result(response) => Some(&response.id),
            Envelope::Error(response) => Some(&response.id),
        }
    }

    /// Convert an already classified message into its typed form.
    ///
    /// Integral float ids and error codes are rewritten as integers first.
    pub fn from_classified(kind: MessageKind, mut value: Value) -> RpcResult<Self> {
        normalize_integer(value.get_mut("id"));
        if kind == MessageKind::Error {
            normalize_integer(value.get_mut("error").and_then(|error| error.get_mut("code")));
        }
        Ok(match kind {
            MessageKind::Notify => Envelope::Notify(serde_json::from_value(value)?),
            MessageKind::Request => Envelope::Request(serde_json::from_value(value)?),
            MessageKind::Result => Envelope::Result(serde_json::from_value(value)?),
            MessageKind::Error => Envelope::Error(serde_json::from_value(value)?),
        })
    }

    /// Serialize to a single newline-terminated line.
    pub fn to_line(&self) -> RpcResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Envelope::Notify(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Envelope::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Envelope::Result(response) => {
                map.serialize_entry("id", &response.id)?;
                map.serialize_entry("result", &response.result)?;
            }
            Envelope::Error(response) => {
                map.serialize_entry("id", &response.id)?;
                map.serialize_entry("error", &response.error)?;
            }
        }
        map.end()
    }
}
