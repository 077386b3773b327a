//! Classification of decoded JSON into one of the four JSON-RPC 2.0 shapes.
//!
//! The order of checks matters: version first, then the keyword count, then
//! the notify/request split on the presence of `id`, and only then the
//! per-kind validation. A malformed message is reported with the most
//! specific reason available.

use serde_json::Value;

use super::types::{integer_value, MessageKind, JSONRPC_VERSION};

/// Top-level members that survive sanitisation.
const KEPT_MEMBERS: [&str; 6] = ["jsonrpc", "id", "method", "params", "result", "error"];

/// Members whose presence decides the message kind. Exactly one is allowed.
const KEYWORDS: [&str; 3] = ["method", "result", "error"];

/// Reason a decoded value is not a valid JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("required member \"jsonrpc\" missing or invalid")]
    InvalidVersion,
    #[error("ambiguous JSON-RPC message")]
    Ambiguous,
    #[error("invalid JSON-RPC message: no keyword")]
    NoKeyword,
    #[error("\"method\" must be a string")]
    MethodNotString,
    #[error("\"params\" can not be null")]
    NullParams,
    #[error("required \"id\" missing")]
    MissingId,
    #[error("\"id\" can not be null")]
    NullId,
    #[error("\"result\" can not be null")]
    NullResult,
    #[error("\"error\" must be an object")]
    ErrorNotObject,
    #[error("\"error.code\" must be an integer")]
    ErrorCodeNotInteger,
    #[error("\"error.message\" must be a string")]
    ErrorMessageNotString,
    #[error("optional \"error.data\" can not be null")]
    NullErrorData,
}

/// Classify a decoded message.
///
/// With `sanitize`, every top-level member outside the keep-list is removed
/// from `message` in place. The keyword count is taken over the original
/// members either way.
pub fn classify(message: &mut Value, sanitize: bool) -> Result<MessageKind, Rejection> {
    let object = message.as_object_mut().ok_or(Rejection::NotAnObject)?;

    let keywords = KEYWORDS
        .iter()
        .filter(|keyword| object.contains_key(**keyword))
        .count();
    if sanitize {
        object.retain(|key, _| KEPT_MEMBERS.contains(&key.as_str()));
    }

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(Rejection::InvalidVersion);
    }
    match keywords {
        0 => return Err(Rejection::NoKeyword),
        1 => {}
        _ => return Err(Rejection::Ambiguous),
    }

    if let Some(method) = object.get("method") {
        if !method.is_string() {
            return Err(Rejection::MethodNotString);
        }
        if matches!(object.get("params"), Some(Value::Null)) {
            return Err(Rejection::NullParams);
        }
        match object.get("id") {
            None => return Ok(MessageKind::Notify),
            Some(Value::Null) => return Err(Rejection::NullId),
            Some(_) => return Ok(MessageKind::Request),
        }
    }

    match object.get("id") {
        None => return Err(Rejection::MissingId),
        Some(Value::Null) => return Err(Rejection::NullId),
        Some(_) => {}
    }

    if let Some(result) = object.get("result") {
        if result.is_null() {
            return Err(Rejection::NullResult);
        }
        return Ok(MessageKind::Result);
    }

    let error = object
        .get("error")
        .and_then(Value::as_object)
        .ok_or(Rejection::ErrorNotObject)?;
    if error.get("code").and_then(integer_value).is_none() {
        return Err(Rejection::ErrorCodeNotInteger);
    }
    if !error.get("message").map_or(false, Value::is_string) {
        return Err(Rejection::ErrorMessageNotString);
    }
    if matches!(error.get("data"), Some(Value::Null)) {
        return Err(Rejection::NullErrorData);
    }
    Ok(MessageKind::Error)
}
