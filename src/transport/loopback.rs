//! In-process loopback transport
//!
//! Two transports created from the same `LoopbackNetwork` connect once each
//! has installed the other's description. Used by tests and the demo CLI;
//! fault hooks reproduce rejected descriptions, dropped links and transport
//! errors.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent, TransportFactory};
use crate::records::{Candidate, Description};

const SDP_PREFIX: &str = "loopback ";

struct Endpoint {
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    remote_token: Option<String>,
    local_set: bool,
    remote_set: bool,
    open: bool,
    candidates_applied: usize,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, Endpoint>,
    next_token: u64,
    reject_remote_descriptions: bool,
}

/// Hub connecting loopback transports; also their factory.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_transport(&self, label: &str) -> LoopbackTransport {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_token += 1;
        let token = format!("lb{}", inner.next_token);
        inner.endpoints.insert(
            token.clone(),
            Endpoint {
                label: label.to_string(),
                events: sender,
                remote_token: None,
                local_set: false,
                remote_set: false,
                open: false,
                candidates_applied: 0,
            },
        );
        LoopbackTransport {
            token,
            network: self.clone(),
            events: Mutex::new(Some(receiver)),
        }
    }

    /// Make every subsequent `set_remote_description` fail.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.lock().reject_remote_descriptions = reject;
    }

    /// Tokens of transports that have not been closed.
    pub fn active_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.lock().endpoints.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().endpoints.values().filter(|e| e.open).count()
    }

    pub fn candidates_applied(&self, token: &str) -> usize {
        self.lock()
            .endpoints
            .get(token)
            .map_or(0, |e| e.candidates_applied)
    }

    /// Drop connectivity of every open channel; both ends see `Disconnected`.
    pub fn sever_all(&self) {
        let mut inner = self.lock();
        for endpoint in inner.endpoints.values_mut() {
            if endpoint.open {
                endpoint.open = false;
                endpoint.emit(TransportEvent::Disconnected);
            }
        }
    }

    /// Report an unrecoverable error on one transport.
    pub fn fail(&self, token: &str, message: &str) {
        if let Some(endpoint) = self.lock().endpoints.get(token) {
            endpoint.emit(TransportEvent::Error(message.to_string()));
        }
    }

    fn local_description(&self, token: &str, kind: &str) -> Result<Description, TransportError> {
        let mut inner = self.lock();
        let endpoint = inner
            .endpoints
            .get_mut(token)
            .ok_or_else(|| TransportError::new("transport is closed"))?;
        if kind == "answer" && !endpoint.remote_set {
            return Err(TransportError::new("cannot answer without a remote offer"));
        }
        endpoint.local_set = true;
        endpoint.emit(TransportEvent::LocalCandidate(Candidate(json!({
            "candidate": format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", token),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        }))));
        let description = Description(json!({
            "type": kind,
            "sdp": format!("{}{}", SDP_PREFIX, token),
        }));
        Self::try_open(&mut inner, token);
        Ok(description)
    }

    fn remote_description(&self, token: &str, description: &Description) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.reject_remote_descriptions {
            return Err(TransportError::new("remote description rejected"));
        }
        let remote_token = description
            .0
            .get("sdp")
            .and_then(|sdp| sdp.as_str())
            .and_then(|sdp| sdp.strip_prefix(SDP_PREFIX))
            .ok_or_else(|| TransportError::new("not a loopback description"))?
            .to_string();
        let endpoint = inner
            .endpoints
            .get_mut(token)
            .ok_or_else(|| TransportError::new("transport is closed"))?;
        endpoint.remote_token = Some(remote_token);
        endpoint.remote_set = true;
        Self::try_open(&mut inner, token);
        Ok(())
    }

    fn try_open(inner: &mut NetworkInner, token: &str) {
        let Some(remote_token) = inner.endpoints.get(token).and_then(|e| {
            (e.local_set && e.remote_set && !e.open)
                .then(|| e.remote_token.clone())
                .flatten()
        }) else {
            return;
        };
        let linked = inner.endpoints.get(&remote_token).map_or(false, |r| {
            r.local_set && r.remote_set && !r.open && r.remote_token.as_deref() == Some(token)
        });
        if !linked {
            return;
        }
        for t in [token, remote_token.as_str()] {
            if let Some(endpoint) = inner.endpoints.get_mut(t) {
                endpoint.open = true;
                endpoint.emit(TransportEvent::ChannelOpen);
                log::debug!("loopback channel '{}' open on {}", endpoint.label, t);
            }
        }
    }

    fn add_candidate(&self, token: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let endpoint = inner
            .endpoints
            .get_mut(token)
            .ok_or_else(|| TransportError::new("transport is closed"))?;
        if !endpoint.remote_set {
            return Err(TransportError::new("remote description not set"));
        }
        endpoint.candidates_applied += 1;
        Ok(())
    }

    fn close(&self, token: &str) {
        let mut inner = self.lock();
        let Some(endpoint) = inner.endpoints.remove(token) else {
            return;
        };
        endpoint.emit(TransportEvent::ChannelClosed);
        if let Some(remote) = endpoint
            .remote_token
            .as_ref()
            .and_then(|t| inner.endpoints.get_mut(t))
        {
            if remote.open {
                remote.open = false;
                remote.emit(TransportEvent::ChannelClosed);
            }
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, label: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.open_transport(label)))
    }
}

pub struct LoopbackTransport {
    token: String,
    network: LoopbackNetwork,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> Result<Description, TransportError> {
        self.network.local_description(&self.token, "offer")
    }

    async fn create_answer(&self) -> Result<Description, TransportError> {
        self.network.local_description(&self.token, "answer")
    }

    async fn set_remote_description(&self, description: Description) -> Result<(), TransportError> {
        self.network.remote_description(&self.token, &description)
    }

    async fn add_remote_candidate(&self, _candidate: Candidate) -> Result<(), TransportError> {
        self.network.add_candidate(&self.token)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        self.network.close(&self.token);
    }
}
