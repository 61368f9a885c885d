//! Message boundary between a foreground UI and the negotiation process
//!
//! Requests arrive as JSON objects tagged by `type`; every request yields a
//! structured response or `{"error": "..."}`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::orchestrator::{ConnectionStatus, RoleOrchestrator};
use crate::records::{Candidate, Description, PeerRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostRequest {
    GetPeers,
    #[serde(rename_all = "camelCase")]
    SendOffer { offer: Description, peer_id: String },
    #[serde(rename_all = "camelCase")]
    SendAnswer {
        answer: Description,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendIceCandidate {
        candidate: Candidate,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CleanupSession { session_id: String },
    GetConnectionStatus,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostResponse {
    Peers {
        peers: Vec<PeerRecord>,
    },
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Success {
        success: bool,
    },
    Status(ConnectionStatus),
    Error {
        error: String,
    },
}

impl HostResponse {
    pub fn error(message: impl ToString) -> Self {
        HostResponse::Error {
            error: message.to_string(),
        }
    }

    fn ok() -> Self {
        HostResponse::Success { success: true }
    }
}

/// Serves foreground requests against one orchestrator.
#[derive(Clone)]
pub struct HostBridge {
    orchestrator: Arc<RoleOrchestrator>,
}

impl HostBridge {
    pub fn new(orchestrator: Arc<RoleOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn handle(&self, request: HostRequest) -> HostResponse {
        let negotiator = self.orchestrator.negotiator();
        let self_peer = self.orchestrator.peer_id();

        match request {
            HostRequest::GetPeers => HostResponse::Peers {
                peers: self.orchestrator.peers().await,
            },
            HostRequest::SendOffer { offer, peer_id } => {
                match negotiator.initiate(self_peer, &peer_id, offer).await {
                    Ok(session_id) => HostResponse::Session { session_id },
                    Err(e) => HostResponse::error(e),
                }
            }
            HostRequest::SendAnswer { answer, session_id } => {
                match negotiator.respond(&session_id, answer).await {
                    Ok(()) => HostResponse::ok(),
                    Err(e) => HostResponse::error(e),
                }
            }
            HostRequest::SendIceCandidate {
                candidate,
                session_id,
            } => match negotiator.send_candidate(&session_id, candidate, self_peer).await {
                Ok(_) => HostResponse::ok(),
                Err(e) => {
                    log::warn!("{}", e);
                    HostResponse::error(e)
                }
            },
            HostRequest::CleanupSession { session_id } => {
                match negotiator.cleanup(&session_id).await {
                    Ok(()) => HostResponse::ok(),
                    Err(e) => HostResponse::error(e),
                }
            }
            HostRequest::GetConnectionStatus => {
                HostResponse::Status(self.orchestrator.current_status())
            }
            HostRequest::Reconnect => {
                self.orchestrator.reconnect();
                HostResponse::ok()
            }
        }
    }

    /// Decode a JSON request, handle it and encode the response.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match serde_json::from_str::<HostRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => HostResponse::error(format!("invalid request: {}", e)),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            serde_json::json!({ "error": format!("unencodable response: {}", e) }).to_string()
        })
    }
}
