//! Connection state machine
//!
//! Drives one peer-to-peer channel through a single negotiation attempt:
//! `new → offering | answering → connecting → connected`, ending in
//! `disconnected`, `failed` or `closed`. The machine never recovers on its
//! own; the orchestrator tears it down, resets it and starts a fresh attempt.
//!
//! Every attempt gets a number. Transport events and async results belonging
//! to an older attempt are dropped, so a late callback can never move a
//! reset machine.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::SignalError;
use crate::negotiator::{NegotiationEvent, SessionNegotiator};
use crate::observer::{EventReceiver, Observers};
use crate::records::{Candidate, Description};
use crate::transport::{Transport, TransportEvent, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Offering,
    Answering,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// The user-facing name; offering and answering both read as
    /// `connecting`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Offering
            | ConnectionState::Answering
            | ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Terminal for the current attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    fn can_move_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Disconnected, _) => false,
            (New, Offering | Answering) => true,
            (Offering | Answering, Connecting) => true,
            (Offering | Answering | Connecting, Connected) => true,
            (Offering | Answering | Connecting | Connected, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Delivered to observers on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub connected: bool,
    pub state: ConnectionState,
}

struct MachineState {
    state: ConnectionState,
    attempt: u64,
    session_id: Option<String>,
    remote_peer: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    remote_description_set: bool,
    pending_remote: Vec<Candidate>,
    pending_local: Vec<Candidate>,
    early_events: Vec<NegotiationEvent>,
}

impl MachineState {
    fn clear_attempt(&mut self) -> Option<Arc<dyn Transport>> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.attempt += 1;
        self.remote_description_set = false;
        self.pending_remote.clear();
        self.pending_local.clear();
        self.early_events.clear();
        self.transport.take()
    }
}

pub struct ConnectionStateMachine {
    local_peer_id: String,
    channel_label: String,
    negotiator: Arc<SessionNegotiator>,
    factory: Arc<dyn TransportFactory>,
    observers: Observers<ConnectionUpdate>,
    inner: Mutex<MachineState>,
}

impl ConnectionStateMachine {
    pub fn new(
        local_peer_id: &str,
        channel_label: &str,
        negotiator: Arc<SessionNegotiator>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer_id: local_peer_id.to_string(),
            channel_label: channel_label.to_string(),
            negotiator,
            factory,
            observers: Observers::new(),
            inner: Mutex::new(MachineState {
                state: ConnectionState::New,
                attempt: 0,
                session_id: None,
                remote_peer: None,
                transport: None,
                pump: None,
                remote_description_set: false,
                pending_remote: Vec::new(),
                pending_local: Vec::new(),
                early_events: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe(&self) -> EventReceiver<ConnectionUpdate> {
        self.observers.register()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn remote_peer_id(&self) -> Option<String> {
        self.lock().remote_peer.clone()
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    fn set_state(&self, st: &mut MachineState, next: ConnectionState) -> bool {
        if !st.state.can_move_to(next) {
            log::debug!("Ignoring transition {} -> {}", st.state, next);
            return false;
        }
        log::info!("Connection {}: {} -> {}", self.local_peer_id, st.state, next);
        st.state = next;
        self.observers.notify(ConnectionUpdate {
            connected: next.is_connected(),
            state: next,
        });
        true
    }

    fn transition(&self, attempt: u64, next: ConnectionState) -> bool {
        let mut st = self.lock();
        if st.attempt != attempt {
            return false;
        }
        self.set_state(&mut st, next)
    }

    fn fail(&self, attempt: u64, reason: String) -> SignalError {
        log::error!("Connection {} failed: {}", self.local_peer_id, reason);
        self.transition(attempt, ConnectionState::Failed);
        SignalError::NegotiationFailed(reason)
    }

    fn begin_attempt(
        &self,
        initial: ConnectionState,
        session_id: Option<&str>,
        remote_peer: &str,
    ) -> Result<u64, SignalError> {
        let mut st = self.lock();
        if st.state != ConnectionState::New {
            return Err(SignalError::NegotiationFailed(format!(
                "connection is {}, not new",
                st.state
            )));
        }
        st.attempt += 1;
        st.session_id = session_id.map(str::to_string);
        st.remote_peer = Some(remote_peer.to_string());
        self.set_state(&mut st, initial);
        Ok(st.attempt)
    }

    async fn install_transport(
        self: &Arc<Self>,
        attempt: u64,
    ) -> Result<Arc<dyn Transport>, SignalError> {
        let transport = self
            .factory
            .create(&self.channel_label)
            .await
            .map_err(|e| self.fail(attempt, format!("transport setup: {}", e)))?;

        let events = transport.take_events();
        let installed = {
            let mut st = self.lock();
            if st.attempt == attempt {
                st.transport = Some(transport.clone());
                if let Some(events) = events {
                    st.pump = Some(self.spawn_pump(attempt, events));
                }
                true
            } else {
                false
            }
        };
        if !installed {
            transport.close().await;
            return Err(SignalError::NegotiationFailed("attempt superseded".to_string()));
        }
        Ok(transport)
    }

    fn spawn_pump(
        self: &Arc<Self>,
        attempt: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let machine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                machine.on_transport_event(attempt, event).await;
            }
        })
    }

    /// Start an attempt as the initiator: create an offer and publish it as
    /// a new session targeting `target_peer`.
    pub async fn connect(self: &Arc<Self>, target_peer: &str) -> Result<String, SignalError> {
        let attempt = self.begin_attempt(ConnectionState::Offering, None, target_peer)?;
        let transport = self.install_transport(attempt).await?;

        let offer = transport
            .create_offer()
            .await
            .map_err(|e| self.fail(attempt, format!("create offer: {}", e)))?;

        let session_id = match self
            .negotiator
            .initiate(&self.local_peer_id, target_peer, offer)
            .await
        {
            Ok(session_id) => session_id,
            Err(e) => {
                self.fail(attempt, format!("initiate: {}", e));
                return Err(e);
            }
        };

        let (pending, early) = {
            let mut st = self.lock();
            if st.attempt != attempt {
                None
            } else {
                st.session_id = Some(session_id.clone());
                Some((
                    std::mem::take(&mut st.pending_local),
                    std::mem::take(&mut st.early_events),
                ))
            }
        }
        .unzip();

        let Some(pending) = pending else {
            log::warn!("Session {} outlived its attempt, removing it", session_id);
            if let Err(e) = self.negotiator.cleanup(&session_id).await {
                log::warn!("Failed to remove session {}: {}", session_id, e);
            }
            return Err(SignalError::NegotiationFailed("attempt superseded".to_string()));
        };
        for candidate in pending {
            self.send_local_candidate(&session_id, candidate).await;
        }
        for event in early.into_iter().flatten() {
            self.handle_negotiation_event(event).await;
        }
        Ok(session_id)
    }

    /// Answer an inbound offer. Ignored unless the machine is `new`.
    pub async fn accept_offer(
        self: &Arc<Self>,
        session_id: &str,
        from_peer: &str,
        offer: Description,
    ) -> Result<(), SignalError> {
        let attempt =
            match self.begin_attempt(ConnectionState::Answering, Some(session_id), from_peer) {
                Ok(attempt) => attempt,
                Err(_) => {
                    log::info!(
                        "Ignoring offer {} from {} while {}",
                        session_id,
                        from_peer,
                        self.state()
                    );
                    return Ok(());
                }
            };
        let transport = self.install_transport(attempt).await?;

        self.apply_remote_description(attempt, &transport, offer)
            .await?;
        let answer = transport
            .create_answer()
            .await
            .map_err(|e| self.fail(attempt, format!("create answer: {}", e)))?;

        if let Err(e) = self.negotiator.respond(session_id, answer).await {
            if e.is_conflict() {
                log::warn!("Abandoning session {}: {}", session_id, e);
            }
            self.fail(attempt, format!("respond: {}", e));
            return Err(e);
        }

        self.transition(attempt, ConnectionState::Connecting);
        Ok(())
    }

    async fn apply_remote_description(
        &self,
        attempt: u64,
        transport: &Arc<dyn Transport>,
        description: Description,
    ) -> Result<(), SignalError> {
        transport
            .set_remote_description(description)
            .await
            .map_err(|e| self.fail(attempt, format!("set remote description: {}", e)))?;

        let pending = {
            let mut st = self.lock();
            if st.attempt != attempt {
                return Err(SignalError::NegotiationFailed("attempt superseded".to_string()));
            }
            st.remote_description_set = true;
            std::mem::take(&mut st.pending_remote)
        };
        for candidate in pending {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                log::warn!("Buffered candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    async fn send_local_candidate(&self, session_id: &str, candidate: Candidate) {
        if let Err(e) = self
            .negotiator
            .send_candidate(session_id, candidate, &self.local_peer_id)
            .await
        {
            log::warn!("{}", e);
        }
    }

    /// Feed one negotiator event into the machine.
    pub async fn handle_negotiation_event(self: &Arc<Self>, event: NegotiationEvent) {
        if let NegotiationEvent::OfferReceived {
            session_id,
            from_peer,
            offer,
        } = event
        {
            if let Err(e) = self.accept_offer(&session_id, &from_peer, offer).await {
                log::warn!("Offer {} not accepted: {}", session_id, e);
            }
            return;
        }

        let attempt = {
            let mut st = self.lock();
            if st.session_id.as_deref() == Some(event.session_id()) {
                Some(st.attempt)
            } else {
                if st.state == ConnectionState::Offering && st.session_id.is_none() {
                    st.early_events.push(event.clone());
                }
                None
            }
        };
        let Some(attempt) = attempt else {
            log::debug!("Ignoring event for session {}", event.session_id());
            return;
        };

        match event {
            NegotiationEvent::AnswerReceived { answer, .. } => self.on_answer(attempt, answer).await,
            NegotiationEvent::CandidateReceived { candidate, .. } => {
                self.on_remote_candidate(attempt, candidate).await
            }
            NegotiationEvent::SessionRemoved { session_id } => {
                if self.is_connected() {
                    log::debug!("Session {} removed after connecting", session_id);
                } else {
                    self.transition(attempt, ConnectionState::Disconnected);
                }
            }
            NegotiationEvent::OfferReceived { .. } => {}
        }
    }

    async fn on_answer(&self, attempt: u64, answer: Description) {
        let transport = {
            let st = self.lock();
            if st.attempt != attempt || st.state != ConnectionState::Offering {
                return;
            }
            st.transport.clone()
        };
        let Some(transport) = transport else {
            return;
        };
        if self
            .apply_remote_description(attempt, &transport, answer)
            .await
            .is_ok()
        {
            self.transition(attempt, ConnectionState::Connecting);
        }
    }

    async fn on_remote_candidate(&self, attempt: u64, candidate: Candidate) {
        let transport = {
            let mut st = self.lock();
            if st.attempt != attempt {
                return;
            }
            if !st.remote_description_set {
                st.pending_remote.push(candidate);
                return;
            }
            st.transport.clone()
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                log::warn!("Remote candidate rejected: {}", e);
            }
        }
    }

    async fn on_transport_event(&self, attempt: u64, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let session_id = {
                    let mut st = self.lock();
                    if st.attempt != attempt {
                        return;
                    }
                    match st.session_id.clone() {
                        Some(session_id) => session_id,
                        None => {
                            st.pending_local.push(candidate);
                            return;
                        }
                    }
                };
                self.send_local_candidate(&session_id, candidate).await;
            }
            TransportEvent::ChannelOpen => {
                self.transition(attempt, ConnectionState::Connected);
            }
            TransportEvent::ChannelClosed | TransportEvent::Disconnected => {
                self.transition(attempt, ConnectionState::Disconnected);
            }
            TransportEvent::Error(message) => {
                self.fail(attempt, format!("transport: {}", message));
            }
        }
    }

    /// Process negotiator events until the receiver ends.
    pub async fn drive(self: Arc<Self>, mut events: EventReceiver<NegotiationEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_negotiation_event(event).await;
        }
    }

    /// Close the attempt: stop reacting to its events, release its session
    /// watch and close the transport. Returns the attempt's session id.
    pub async fn teardown(&self) -> Option<String> {
        let (transport, session_id) = {
            let mut st = self.lock();
            let transport = st.clear_attempt();
            self.set_state(&mut st, ConnectionState::Closed);
            (transport, st.session_id.clone())
        };
        if let Some(session_id) = &session_id {
            self.negotiator.forget(session_id);
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        session_id
    }

    /// Return to `new` for a fresh attempt.
    pub fn reset(&self) {
        let mut st = self.lock();
        let transport = st.clear_attempt();
        drop(transport);
        st.session_id = None;
        st.remote_peer = None;
        if st.state != ConnectionState::New {
            log::info!("Connection {}: {} -> New", self.local_peer_id, st.state);
            st.state = ConnectionState::New;
            self.observers.notify(ConnectionUpdate {
                connected: false,
                state: ConnectionState::New,
            });
        }
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        let mut st = self.lock();
        let _ = st.clear_attempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairlinkConfig;
    use crate::context::SignalContext;
    use crate::store::{MemoryStore, PresenceStore};
    use crate::transport::LoopbackNetwork;
    use serde_json::json;
    use std::time::Duration;

    struct Pair {
        store: Arc<MemoryStore>,
        network: LoopbackNetwork,
        nav: Arc<ConnectionStateMachine>,
        iface: Arc<ConnectionStateMachine>,
        nav_negotiator: Arc<SessionNegotiator>,
        iface_negotiator: Arc<SessionNegotiator>,
        drivers: Vec<JoinHandle<()>>,
    }

    impl Drop for Pair {
        fn drop(&mut self) {
            for driver in &self.drivers {
                driver.abort();
            }
        }
    }

    async fn pair() -> Pair {
        let store = Arc::new(MemoryStore::new());
        let ctx = SignalContext::new(store.clone(), PairlinkConfig::default());
        let network = LoopbackNetwork::new();
        let factory: Arc<dyn TransportFactory> = Arc::new(network.clone());

        let nav_negotiator = Arc::new(SessionNegotiator::new(ctx.clone()));
        let iface_negotiator = Arc::new(SessionNegotiator::new(ctx));
        let nav = ConnectionStateMachine::new("nav_1", "chan", nav_negotiator.clone(), factory.clone());
        let iface = ConnectionStateMachine::new("if_1", "chan", iface_negotiator.clone(), factory);

        iface_negotiator.listen_for_offers("if_1").await.unwrap();
        let drivers = vec![
            tokio::spawn(nav.clone().drive(nav_negotiator.observe())),
            tokio::spawn(iface.clone().drive(iface_negotiator.observe())),
        ];
        Pair {
            store,
            network,
            nav,
            iface,
            nav_negotiator,
            iface_negotiator,
            drivers,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn states(rx: &mut EventReceiver<ConnectionUpdate>) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        while let Some(update) = rx.try_recv() {
            assert_eq!(update.connected, update.state.is_connected());
            seen.push(update.state);
        }
        seen
    }

    #[test]
    fn test_user_facing_state_names() {
        assert_eq!(ConnectionState::Offering.as_str(), "connecting");
        assert_eq!(ConnectionState::Answering.as_str(), "connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_closed_is_final() {
        assert!(!ConnectionState::Closed.can_move_to(ConnectionState::Connected));
        assert!(!ConnectionState::Failed.can_move_to(ConnectionState::Connecting));
        assert!(ConnectionState::Failed.can_move_to(ConnectionState::Closed));
        assert!(!ConnectionState::Connected.can_move_to(ConnectionState::Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_answer_reaches_connected() {
        let p = pair().await;
        let mut nav_updates = p.nav.observe();
        let mut iface_updates = p.iface.observe();

        let session_id = p.nav.connect("if_1").await.unwrap();
        settle().await;

        assert_eq!(
            states(&mut nav_updates),
            vec![
                ConnectionState::Offering,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(
            states(&mut iface_updates),
            vec![
                ConnectionState::Answering,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(p.iface.session_id(), Some(session_id));
        assert_eq!(p.iface.remote_peer_id().as_deref(), Some("nav_1"));

        let applied: usize = p
            .network
            .active_tokens()
            .iter()
            .map(|t| p.network.candidates_applied(t))
            .sum();
        assert_eq!(applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_description_fails_responder() {
        let p = pair().await;
        p.network.reject_remote_descriptions(true);

        p.nav.connect("if_1").await.unwrap();
        settle().await;

        assert_eq!(p.iface.state(), ConnectionState::Failed);
        assert_eq!(p.nav.state(), ConnectionState::Offering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_offer_is_ignored() {
        let p = pair().await;
        p.nav.connect("if_1").await.unwrap();
        settle().await;
        let first = p.iface.session_id();

        let other = p
            .nav_negotiator
            .initiate("nav_2", "if_1", Description(json!({"type": "offer", "sdp": "x"})))
            .await
            .unwrap();
        settle().await;

        assert_eq!(p.iface.state(), ConnectionState::Connected);
        assert_eq!(p.iface.session_id(), first);
        let doc = p.store.get(crate::records::SESSIONS, &other).await.unwrap().unwrap();
        assert!(doc.field("answer").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_new_state() {
        let p = pair().await;
        p.nav.connect("if_1").await.unwrap();
        assert!(p.nav.connect("if_1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_disconnects_counterpart() {
        let p = pair().await;
        let session_id = p.nav.connect("if_1").await.unwrap();
        settle().await;

        assert_eq!(p.nav.teardown().await, Some(session_id));
        settle().await;

        assert_eq!(p.nav.state(), ConnectionState::Closed);
        assert_eq!(p.iface.state(), ConnectionState::Disconnected);
        assert!(p.nav_negotiator.watched_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_fails_and_reset_allows_retry() {
        let p = pair().await;
        p.nav.connect("if_1").await.unwrap();
        settle().await;

        for token in p.network.active_tokens() {
            p.network.fail(&token, "boom");
        }
        settle().await;
        assert_eq!(p.nav.state(), ConnectionState::Failed);

        p.nav.teardown().await;
        p.nav.reset();
        assert_eq!(p.nav.state(), ConnectionState::New);
        assert!(p.nav.session_id().is_none());
        assert!(p.nav.connect("if_2").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_removed_before_connect_is_disconnect() {
        let p = pair().await;
        let session_id = p.nav.connect("if_nobody").await.unwrap();
        settle().await;

        p.iface_negotiator.cleanup(&session_id).await.unwrap();
        settle().await;
        assert_eq!(p.nav.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_wait_for_session() {
        let p = pair().await;
        let session_id = p.nav.connect("if_nobody").await.unwrap();
        settle().await;

        let collection = crate::records::candidates_collection(&session_id);
        assert_eq!(p.store.document_count(&collection), 1);
    }
}
