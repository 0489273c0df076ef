//! Per-viewer connection state.
//!
//! A [`Connection`] is attached to at most one session at a time. It turns
//! protocol requests into registry and session calls and hands the
//! transport the events of whatever session it is attached to.

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::auth::{can_access, Identity};
use crate::api::error::ApiError;
use crate::api::ws_methods::{
    parse_params, AttachSessionParams, CreateSessionParams, InputParams, RenameSessionParams,
    ResizeParams, SessionIdParams, WsRequest, WsResponse,
};
use crate::registry::{CreateSession, SessionRegistry};
use crate::session::{ConnectionId, Session, ViewerEvent};

struct Attachment {
    session: Session,
    events: mpsc::UnboundedReceiver<ViewerEvent>,
}

pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    registry: SessionRegistry,
    attached: Option<Attachment>,
}

impl Connection {
    pub fn new(identity: Identity, registry: SessionRegistry) -> Self {
        Self {
            id: ConnectionId::next(),
            identity,
            registry,
            attached: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn attached_session_id(&self) -> Option<&str> {
        self.attached.as_ref().map(|a| a.session.id())
    }

    /// Handle one request. `input` and `resize` produce no response unless
    /// their params are malformed.
    pub async fn handle(&mut self, req: &WsRequest) -> Option<WsResponse> {
        let id = req.id.clone();
        let method = req.method.as_str();

        let result = match method {
            "list_sessions" => Ok(self.list_sessions()),
            "create_session" => match parse_params(req) {
                Ok(params) => self.create_session(params).await,
                Err(resp) => return Some(resp),
            },
            "attach_session" => match parse_params(req) {
                Ok(params) => self.attach_session(params),
                Err(resp) => return Some(resp),
            },
            "input" => {
                let params: InputParams = match parse_params(req) {
                    Ok(p) => p,
                    Err(resp) => return Some(resp),
                };
                return match params.decode() {
                    Ok(data) => {
                        self.input(data);
                        None
                    }
                    Err(e) => Some(WsResponse::from_api_error(id, method, &e)),
                };
            }
            "resize" => {
                let params: ResizeParams = match parse_params(req) {
                    Ok(p) => p,
                    Err(resp) => return Some(resp),
                };
                self.resize(params.cols, params.rows);
                return None;
            }
            "rename_session" => match parse_params(req) {
                Ok(params) => self.rename_session(params),
                Err(resp) => return Some(resp),
            },
            "kill_session" => match parse_params(req) {
                Ok(params) => self.kill_session(params),
                Err(resp) => return Some(resp),
            },
            "detach_session" => Ok(json!({ "detached": self.detach() })),
            _ => {
                return Some(WsResponse::error(
                    id,
                    method,
                    "unknown_method",
                    &format!("Unknown method '{}'.", method),
                ))
            }
        };

        Some(match result {
            Ok(value) => WsResponse::success(id, method, value),
            Err(e) => WsResponse::from_api_error(id, method, &e),
        })
    }

    fn list_sessions(&self) -> serde_json::Value {
        let owner = (!self.identity.admin).then_some(self.identity.id.as_str());
        json!({ "sessions": self.registry.list(owner) })
    }

    async fn create_session(
        &mut self,
        params: CreateSessionParams,
    ) -> Result<serde_json::Value, ApiError> {
        let session = self
            .registry
            .create(CreateSession {
                cols: params.cols,
                rows: params.rows,
                title: params.title,
                project: params.project,
                owner: self.identity.id.clone(),
            })
            .await?;
        to_value(session.summary())
    }

    fn attach_session(&mut self, params: AttachSessionParams) -> Result<serde_json::Value, ApiError> {
        let session = self.accessible_session(&params.id)?;
        self.detach();
        let size = params.cols.zip(params.rows);
        let (summary, events) = session
            .attach(self.id, size, params.replay)
            .ok_or_else(|| ApiError::SessionNotFound(params.id.clone()))?;
        self.attached = Some(Attachment { session, events });
        to_value(summary)
    }

    fn rename_session(&self, params: RenameSessionParams) -> Result<serde_json::Value, ApiError> {
        self.accessible_session(&params.id)?;
        to_value(self.registry.rename(&params.id, &params.title)?)
    }

    fn kill_session(&mut self, params: SessionIdParams) -> Result<serde_json::Value, ApiError> {
        self.accessible_session(&params.id)?;
        if self.attached_session_id() == Some(params.id.as_str()) {
            self.detach();
        }
        self.registry.destroy(&params.id);
        Ok(json!({ "killed": params.id }))
    }

    fn accessible_session(&self, id: &str) -> Result<Session, ApiError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
        if !can_access(&session, &self.identity) {
            return Err(ApiError::AccessDenied);
        }
        Ok(session)
    }

    /// Forward raw input to the attached session; no-op when unattached.
    pub fn input(&self, data: Bytes) {
        if let Some(attachment) = &self.attached {
            attachment.session.write(data);
        }
    }

    /// Resize the attached session; no-op when unattached.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(attachment) = &self.attached {
            attachment.session.resize(cols, rows);
        }
    }

    /// Leave the current session, if any. Returns its id.
    pub fn detach(&mut self) -> Option<String> {
        let attachment = self.attached.take()?;
        attachment.session.detach(self.id);
        Some(attachment.session.id().to_string())
    }

    /// Next event from the attached session. Pending forever while
    /// unattached, so it can sit in a `select!` alongside the socket.
    ///
    /// When the session goes away the attachment is cleared and a
    /// [`ViewerEvent::Closed`] is returned.
    pub async fn next_event(&mut self) -> ViewerEvent {
        let Some(attachment) = self.attached.as_mut() else {
            return std::future::pending().await;
        };
        match attachment.events.recv().await {
            Some(ViewerEvent::Closed { session_id }) => {
                self.attached = None;
                ViewerEvent::Closed { session_id }
            }
            Some(event) => event,
            None => {
                let session_id = attachment.session.id().to_string();
                self.attached = None;
                ViewerEvent::Closed { session_id }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.detach();
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::InternalError(e.to_string()))
}
