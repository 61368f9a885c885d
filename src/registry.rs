//! Peer registry: presence registration, heartbeat and discovery

use serde_json::json;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context::SignalContext;
use crate::errors::SignalError;
use crate::records::{self, PeerRecord, PeerStatus, Role, PEERS};
use crate::schedule::{FirstTick, ScheduledTask};
use crate::store::{Document, FilterOp, Query};

#[derive(Default)]
struct RegistryState {
    peer_id: Option<String>,
    heartbeat: Option<ScheduledTask>,
}

/// Owns the local peer's presence record for the life of the process.
pub struct PeerRegistry {
    ctx: SignalContext,
    state: Mutex<RegistryState>,
}

fn last_seen_update(millis: i64) -> Document {
    let mut doc = Document::new();
    doc.insert("lastSeen".to_string(), json!(millis));
    doc
}

impl PeerRegistry {
    pub fn new(ctx: SignalContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write an `available` presence record and start the heartbeat.
    ///
    /// The first heartbeat fires immediately. Only the initial write can
    /// fail registration; heartbeat failures are logged and retried on the
    /// next tick.
    pub async fn register(
        &self,
        peer_id: &str,
        role: Role,
        network_identity: &str,
    ) -> Result<PeerRecord, SignalError> {
        // A re-registration replaces the previous heartbeat.
        self.lock().heartbeat = None;

        let record = PeerRecord::new(peer_id, role, network_identity, self.ctx.clock.now());
        let doc = records::to_document(&record)
            .map_err(|e| SignalError::RegistrationError(e.to_string()))?;

        self.ctx
            .store
            .put(PEERS, peer_id, doc)
            .await
            .map_err(|e| SignalError::RegistrationError(format!("{}: {}", peer_id, e)))?;

        let heartbeat = self.spawn_heartbeat(peer_id);
        let mut state = self.lock();
        state.peer_id = Some(peer_id.to_string());
        state.heartbeat = Some(heartbeat);
        drop(state);

        log::info!(
            "Registered peer {} as {} on {}",
            peer_id,
            role,
            network_identity
        );
        Ok(record)
    }

    fn spawn_heartbeat(&self, peer_id: &str) -> ScheduledTask {
        let store = self.ctx.store.clone();
        let clock = self.ctx.clock.clone();
        let peer_id = peer_id.to_string();
        let period = self.ctx.config.presence.heartbeat_interval();

        ScheduledTask::every("heartbeat", period, FirstTick::Immediately, move || {
            let store = store.clone();
            let peer_id = peer_id.clone();
            let millis = clock.now_millis();
            async move {
                match store.update(PEERS, &peer_id, last_seen_update(millis)).await {
                    Ok(()) => log::debug!("Heartbeat for {} at {}", peer_id, millis),
                    Err(e) => log::warn!("Heartbeat for {} failed: {}", peer_id, e),
                }
            }
        })
    }

    pub fn is_heartbeat_active(&self) -> bool {
        self.lock()
            .heartbeat
            .as_ref()
            .map_or(false, ScheduledTask::is_active)
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.lock().peer_id.clone()
    }

    /// Live peers with the complementary role on the same network identity.
    ///
    /// Never fails: an unreachable store or no match both yield an empty
    /// list, which callers treat as "poll again".
    pub async fn discover(&self, self_role: Role, network_identity: &str) -> Vec<PeerRecord> {
        let now = self.ctx.clock.now();
        let window = self.ctx.config.presence.liveness_window();
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());

        let query = Query::collection(PEERS)
            .where_eq("networkIdentity", network_identity)
            .where_eq("role", self_role.complement().as_str())
            .where_eq("status", PeerStatus::Available.as_str())
            .filter("lastSeen", FilterOp::Gt, cutoff.timestamp_millis());

        let documents = match self.ctx.store.query(&query).await {
            Ok(documents) => documents,
            Err(e) => {
                log::warn!("Discovery query failed: {}", e);
                return Vec::new();
            }
        };

        let peers: Vec<PeerRecord> = documents
            .iter()
            .filter_map(|doc| match records::from_document::<PeerRecord>(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("Skipping unreadable peer record: {}", e);
                    None
                }
            })
            .filter(|record| record.is_live(now, window))
            .collect();

        log::info!(
            "Found {} available {} peers on {}",
            peers.len(),
            self_role.complement(),
            network_identity
        );
        peers
    }

    /// Stop the heartbeat.
    pub fn stop(&self) {
        if let Some(mut heartbeat) = self.lock().heartbeat.take() {
            heartbeat.cancel();
        }
    }

    /// Stop the heartbeat, then mark the record `offline`.
    ///
    /// The timer is gone before the write is issued. Only `status` changes;
    /// `lastSeen` stays the heartbeat's. The write is best-effort: a failure
    /// is logged, never returned.
    pub async fn deregister(&self, peer_id: &str) {
        self.stop();
        self.lock().peer_id = None;

        let mut update = Document::new();
        update.insert(
            "status".to_string(),
            json!(PeerStatus::Offline.as_str()),
        );
        match self.ctx.store.update(PEERS, peer_id, update).await {
            Ok(()) => log::info!("Peer {} marked offline", peer_id),
            Err(e) => log::warn!("Failed to mark {} offline: {}", peer_id, e),
        }
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}
