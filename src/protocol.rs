//! Wire message serde types, frame classification and parameter builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::WatchedChange;

pub(crate) const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

/// Outbound request frame.
#[derive(Debug, Serialize)]
pub(crate) struct RequestFrame {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Outbound notification frame. No id, no response.
#[derive(Debug, Serialize)]
pub(crate) struct NotificationFrame {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationFrame {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// Error object carried in a response frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub(crate) fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

/// Response frame for an inbound server request.
pub(crate) fn response_frame(id: &Value, outcome: Result<Value, ResponseError>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error }),
    }
}

pub(crate) fn cancel_params(id: u64) -> Value {
    json!({ "id": id })
}

/// An inbound frame, classified.
pub(crate) enum Inbound {
    /// Response to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, ResponseError>,
    },
    /// Server-initiated request; `id` is echoed back verbatim.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Classify a raw frame. Returns `None` for frames that fit no shape.
pub(crate) fn classify(frame: &Value) -> Option<Inbound> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let params = frame.get("params").cloned();

    match (id, method) {
        (Some(id), None) => {
            let outcome = if let Some(error) = frame.get("error") {
                let error = serde_json::from_value(error.clone())
                    .unwrap_or_else(|_| ResponseError::new(-32603, "malformed error object"));
                Err(error)
            } else if let Some(result) = frame.get("result") {
                Ok(result.clone())
            } else {
                return None;
            };
            Some(Inbound::Response {
                id: id.as_u64()?,
                outcome,
            })
        }
        (Some(id), Some(method)) => Some(Inbound::Request {
            id: id.clone(),
            method,
            params,
        }),
        (None, Some(method)) => Some(Inbound::Notification { method, params }),
        (None, None) => None,
    }
}

// ── parameter builders ─────────────────────────────────────────────────

pub(crate) fn initialize_params(root_uri: &str, initialization_options: Option<Value>) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": true,
                    "didSave": true
                }
            },
            "workspace": {
                "didChangeWatchedFiles": { "dynamicRegistration": false }
            }
        },
        "workspaceFolders": [{ "uri": root_uri, "name": "workspace" }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options;
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn will_save_params(uri: &str, reason: u8) -> Value {
    json!({ "textDocument": { "uri": uri }, "reason": reason })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    match text {
        Some(text) => json!({ "textDocument": { "uri": uri }, "text": text }),
        None => json!({ "textDocument": { "uri": uri } }),
    }
}

pub(crate) fn watched_changes_params(changes: &[WatchedChange]) -> Value {
    let changes: Vec<Value> = changes
        .iter()
        .map(|change| {
            let uri = path_to_file_uri(&change.path)
                .map(|uri| uri.to_string())
                .unwrap_or_else(|_| change.path.display().to_string());
            json!({ "uri": uri, "type": change.kind.code() })
        })
        .collect();
    json!({ "changes": changes })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|uri| uri.to_file_path().ok())
}
