use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::session::ViewerEvent;

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// Incoming WebSocket request (JSON-RPC-ish).
#[derive(Debug, Deserialize)]
pub struct WsRequest {
    /// Optional request id, echoed back in the response.
    pub id: Option<serde_json::Value>,
    /// Method name (e.g. "create_session", "attach_session").
    pub method: String,
    /// Method-specific parameters.
    pub params: Option<serde_json::Value>,
}

/// Outgoing WebSocket response.
#[derive(Debug, Serialize)]
pub struct WsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl WsResponse {
    /// Build a successful response.
    pub fn success(id: Option<serde_json::Value>, method: &str, result: serde_json::Value) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response tied to a particular request.
    pub fn error(id: Option<serde_json::Value>, method: &str, code: &str, message: &str) -> Self {
        Self {
            id,
            method: Some(method.to_owned()),
            result: None,
            error: Some(WsError {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        }
    }

    /// Build an error response from an [`ApiError`].
    pub fn from_api_error(id: Option<serde_json::Value>, method: &str, err: &ApiError) -> Self {
        Self::error(id, method, err.code(), &err.message())
    }

    /// Build a protocol-level error (no method or id available).
    pub fn protocol_error(code: &str, message: &str) -> Self {
        Self {
            id: None,
            method: None,
            result: None,
            error: Some(WsError {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        }
    }
}

/// Error payload inside a [`WsResponse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

/// Server-pushed event, tagged by `event`.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WsEvent {
    /// Scrollback at attach time, base64.
    Replay { session_id: String, data: String },
    /// Live output, base64.
    Output { session_id: String, data: String },
    Exited { session_id: String },
    /// The attached session went away.
    Detached { session_id: String },
}

impl From<ViewerEvent> for WsEvent {
    fn from(event: ViewerEvent) -> Self {
        let encode = |data: &Bytes| base64::engine::general_purpose::STANDARD.encode(data);
        match event {
            ViewerEvent::Replay { session_id, data } => WsEvent::Replay {
                session_id,
                data: encode(&data),
            },
            ViewerEvent::Output { session_id, data } => WsEvent::Output {
                session_id,
                data: encode(&data),
            },
            ViewerEvent::Exited { session_id } => WsEvent::Exited { session_id },
            ViewerEvent::Closed { session_id } => WsEvent::Detached { session_id },
        }
    }
}

// ---------------------------------------------------------------------------
// Method-specific param types
// ---------------------------------------------------------------------------

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_true() -> bool {
    true
}

/// Parameters for `create_session`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionParams {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    pub title: Option<String>,
    pub project: Option<String>,
}

/// Parameters for `attach_session`.
#[derive(Debug, Deserialize)]
pub struct AttachSessionParams {
    pub id: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    #[serde(default = "default_true")]
    pub replay: bool,
}

/// Parameters for `input`.
#[derive(Debug, Deserialize)]
pub struct InputParams {
    pub data: String,
    #[serde(default)]
    pub encoding: InputEncoding,
}

/// Encoding used for [`InputParams::data`].
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputEncoding {
    #[default]
    Utf8,
    Base64,
}

impl InputParams {
    /// Decode the payload into raw bytes.
    pub fn decode(self) -> Result<Bytes, ApiError> {
        match self.encoding {
            InputEncoding::Utf8 => Ok(Bytes::from(self.data)),
            InputEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(&self.data)
                .map(Bytes::from)
                .map_err(|e| ApiError::InvalidRequest(format!("invalid base64: {e}"))),
        }
    }
}

/// Parameters for `resize`.
#[derive(Debug, Deserialize)]
pub struct ResizeParams {
    pub cols: u16,
    pub rows: u16,
}

/// Parameters for `rename_session`.
#[derive(Debug, Deserialize)]
pub struct RenameSessionParams {
    pub id: String,
    pub title: String,
}

/// Parameters that identify a session by id.
#[derive(Debug, Deserialize)]
pub struct SessionIdParams {
    pub id: String,
}

/// Parse params from a WsRequest, returning a WsResponse error on failure.
pub fn parse_params<T: serde::de::DeserializeOwned>(req: &WsRequest) -> Result<T, WsResponse> {
    let params = req
        .params
        .as_ref()
        .cloned()
        .unwrap_or(serde_json::Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| {
        WsResponse::error(
            req.id.clone(),
            &req.method,
            "invalid_request",
            &format!("Invalid params: {}.", e),
        )
    })
}
