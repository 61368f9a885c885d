//! Role orchestrator
//!
//! Wires registry, negotiator and connection state machine together for one
//! process role. The navigator initiates: it polls discovery until a live
//! interface shows up, then offers. The interface responds: it listens for
//! offers and answers the first one it gets while idle.
//!
//! Any attempt that ends (failure, disconnect, negotiation timeout or a
//! manual reconnect) is torn down completely; the next attempt starts from
//! a fresh session.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{ConnectionState, ConnectionStateMachine, ConnectionUpdate};
use crate::context::SignalContext;
use crate::errors::SignalError;
use crate::identity::{resolve_identity, IdentitySource};
use crate::negotiator::SessionNegotiator;
use crate::observer::EventReceiver;
use crate::records::{PeerRecord, Role};
use crate::registry::PeerRegistry;
use crate::schedule::ScheduledTask;
use crate::transport::TransportFactory;

/// Snapshot reported to the foreground UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub role: Role,
    pub peer_id: String,
    pub network_identity: Option<String>,
    pub connected: bool,
    pub state: String,
    pub remote_peer_id: Option<String>,
    pub session_id: Option<String>,
}

/// Resolve once `delay` has passed. Dropping the future cancels the timer.
async fn backoff(name: &str, delay: Duration) {
    let (fired_tx, fired_rx) = oneshot::channel();
    let _timer = ScheduledTask::after(name, delay, async move {
        let _ = fired_tx.send(());
    });
    let _ = fired_rx.await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Ended(ConnectionState),
    TimedOut,
    Reconnect,
}

#[derive(Default)]
struct OrchestratorState {
    network_identity: Option<String>,
    runner: Option<JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
}

pub struct RoleOrchestrator {
    ctx: SignalContext,
    role: Role,
    peer_id: String,
    identity: Arc<dyn IdentitySource>,
    registry: Arc<PeerRegistry>,
    negotiator: Arc<SessionNegotiator>,
    machine: Arc<ConnectionStateMachine>,
    reconnect: Notify,
    state: Mutex<OrchestratorState>,
}

impl RoleOrchestrator {
    pub fn new(
        ctx: SignalContext,
        role: Role,
        peer_id: &str,
        identity: Arc<dyn IdentitySource>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let registry = Arc::new(PeerRegistry::new(ctx.clone()));
        let negotiator = Arc::new(SessionNegotiator::new(ctx.clone()));
        let machine = ConnectionStateMachine::new(
            peer_id,
            &ctx.config.transport.channel_label,
            negotiator.clone(),
            factory,
        );
        Arc::new(Self {
            ctx,
            role,
            peer_id: peer_id.to_string(),
            identity,
            registry,
            negotiator,
            machine,
            reconnect: Notify::new(),
            state: Mutex::new(OrchestratorState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn negotiator(&self) -> &Arc<SessionNegotiator> {
        &self.negotiator
    }

    pub fn machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.machine
    }

    pub fn network_identity(&self) -> Option<String> {
        self.lock().network_identity.clone()
    }

    pub fn observe_connection(&self) -> EventReceiver<ConnectionUpdate> {
        self.machine.observe()
    }

    fn is_initiator(&self) -> bool {
        self.role == Role::Navigator
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .runner
            .as_ref()
            .map_or(false, |runner| !runner.is_finished())
    }

    /// Spawn the role loop. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.runner.as_ref().map_or(false, |r| !r.is_finished()) {
            return;
        }
        state.runner = Some(tokio::spawn(self.clone().run()));
        log::info!("Started {} orchestrator {}", self.role, self.peer_id);
    }

    pub fn current_status(&self) -> ConnectionStatus {
        let state = self.machine.state();
        ConnectionStatus {
            role: self.role,
            peer_id: self.peer_id.clone(),
            network_identity: self.network_identity(),
            connected: state.is_connected(),
            state: state.as_str().to_string(),
            remote_peer_id: self.machine.remote_peer_id(),
            session_id: self.machine.session_id(),
        }
    }

    /// Abandon the current attempt (or wait) and start over immediately.
    pub fn reconnect(&self) {
        log::info!("Manual reconnect requested by {}", self.peer_id);
        self.reconnect.notify_one();
    }

    /// Peers the local role could connect to right now.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        match self.network_identity() {
            Some(identity) => self.registry.discover(self.role, &identity).await,
            None => Vec::new(),
        }
    }

    async fn run(self: Arc<Self>) {
        let identity =
            resolve_identity(self.identity.as_ref(), &self.ctx.config.identity.fallback).await;
        self.lock().network_identity = Some(identity.clone());

        self.register_until_done(&identity).await;

        let driver = tokio::spawn(self.machine.clone().drive(self.negotiator.observe()));
        let previous = self.lock().driver.replace(driver);
        if let Some(previous) = previous {
            previous.abort();
        }

        let mut updates = self.machine.observe();
        if self.is_initiator() {
            self.run_initiator(&identity, &mut updates).await;
        } else {
            self.run_responder(&mut updates).await;
        }
    }

    async fn register_until_done(&self, identity: &str) {
        let retry = self.ctx.config.retry.registration_retry();
        loop {
            match self.registry.register(&self.peer_id, self.role, identity).await {
                Ok(_) => return,
                Err(e) => {
                    log::error!("{}; retrying in {:?}", e, retry);
                    backoff("registration retry", retry).await;
                }
            }
        }
    }

    /// Sleep for `delay`; true when a reconnect request cut it short.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = backoff("orchestrator pause", delay) => false,
            _ = self.reconnect.notified() => true,
        }
    }

    async fn run_initiator(&self, identity: &str, updates: &mut EventReceiver<ConnectionUpdate>) {
        let poll = self.ctx.config.retry.discovery_poll();
        let cooldown = self.ctx.config.retry.reconnect_backoff();
        loop {
            let target = loop {
                let peers = self.registry.discover(self.role, identity).await;
                if let Some(peer) = peers.into_iter().next() {
                    break peer.peer_id;
                }
                log::debug!("No {} peers yet, polling again in {:?}", self.role.complement(), poll);
                self.pause(poll).await;
            };

            let end = match self.machine.connect(&target).await {
                Ok(session_id) => {
                    log::info!("Offered session {} to {}", session_id, target);
                    self.watch_attempt(updates).await
                }
                Err(e) => {
                    log::warn!("Connecting to {} failed: {}", target, e);
                    AttemptEnd::Ended(self.machine.state())
                }
            };

            self.end_attempt(end).await;
            if end != AttemptEnd::Reconnect {
                self.pause(cooldown).await;
            }
            self.machine.reset();
        }
    }

    async fn run_responder(&self, updates: &mut EventReceiver<ConnectionUpdate>) {
        let retry = self.ctx.config.retry.registration_retry();
        while let Err(e) = self.negotiator.listen_for_offers(&self.peer_id).await {
            log::warn!("Cannot listen for offers: {}; retrying in {:?}", e, retry);
            backoff("offer listener retry", retry).await;
        }
        loop {
            let end = self.watch_attempt(updates).await;
            self.end_attempt(end).await;
            self.machine.reset();
        }
    }

    /// Wait until the current attempt is over.
    ///
    /// The negotiation timeout runs from the moment the machine leaves
    /// `new` until it reaches `connected`.
    async fn watch_attempt(&self, updates: &mut EventReceiver<ConnectionUpdate>) -> AttemptEnd {
        let timeout = self.ctx.config.retry.negotiation_timeout();
        let mut deadline: Option<Instant> = None;
        loop {
            let state = self.machine.state();
            match state {
                ConnectionState::Failed
                | ConnectionState::Closed
                | ConnectionState::Disconnected => return AttemptEnd::Ended(state),
                ConnectionState::Connected => deadline = None,
                ConnectionState::New => {}
                ConnectionState::Offering
                | ConnectionState::Answering
                | ConnectionState::Connecting => {
                    // Out of range means no deadline at all.
                    if deadline.is_none() {
                        deadline = Instant::now().checked_add(timeout);
                    }
                }
            }

            tokio::select! {
                update = updates.recv() => {
                    if update.is_none() {
                        return AttemptEnd::Ended(self.machine.state());
                    }
                }
                _ = self.reconnect.notified() => return AttemptEnd::Reconnect,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return AttemptEnd::TimedOut;
                }
            }
        }
    }

    async fn end_attempt(&self, end: AttemptEnd) {
        match end {
            AttemptEnd::TimedOut => log::warn!("Negotiation timed out for {}", self.peer_id),
            AttemptEnd::Ended(state) => log::info!("Attempt of {} ended: {}", self.peer_id, state),
            AttemptEnd::Reconnect => {}
        }
        if let Some(session_id) = self.machine.teardown().await {
            self.remove_session(&session_id).await;
        }
    }

    async fn remove_session(&self, session_id: &str) {
        match self.negotiator.cleanup(session_id).await {
            Ok(()) | Err(SignalError::SessionNotFound(_)) => {}
            Err(e) => log::warn!("Failed to clean up session {}: {}", session_id, e),
        }
    }

    /// Stop every loop, close the connection, remove the session and mark
    /// the peer offline.
    pub async fn shutdown(&self) {
        let (runner, driver) = {
            let mut state = self.lock();
            (state.runner.take(), state.driver.take())
        };
        if let Some(runner) = runner {
            runner.abort();
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        self.negotiator.shutdown();
        self.registry.stop();

        if let Some(session_id) = self.machine.teardown().await {
            self.remove_session(&session_id).await;
        }
        self.registry.deregister(&self.peer_id).await;
        log::info!("Orchestrator {} shut down", self.peer_id);
    }
}
