//! Session negotiator
//!
//! Exchanges offer, answer and network candidates between exactly two peers
//! through session documents in the presence store. Everything the store
//! pushes back is turned into a [`NegotiationEvent`] and delivered to every
//! registered observer.
//!
//! Each watched session owns two subscriptions: the session document (for
//! the answer and for removal) and its candidate sub-collection, filtered so
//! a peer never sees its own candidates. The watch task drains the session
//! stream before the candidate stream, so an answer is always delivered
//! ahead of candidates written after it.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::SignalContext;
use crate::errors::{SignalError, StoreError};
use crate::observer::{EventReceiver, ObserverId, Observers};
use crate::records::{
    self, candidates_collection, Candidate, Description, IceCandidateRecord, SessionKind,
    SessionRecord, SESSIONS,
};
use crate::store::{
    ChangeKind, Document, DocumentChange, FilterOp, Query, StoredDocument, SubscriptionGuard,
};

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// A new session targeting this peer.
    OfferReceived {
        session_id: String,
        from_peer: String,
        offer: Description,
    },
    /// The counterpart answered a session this peer initiated.
    AnswerReceived {
        session_id: String,
        answer: Description,
    },
    /// A candidate written by the counterpart.
    CandidateReceived {
        session_id: String,
        candidate: Candidate,
    },
    /// The watched session document was deleted.
    SessionRemoved { session_id: String },
}

impl NegotiationEvent {
    pub fn session_id(&self) -> &str {
        match self {
            NegotiationEvent::OfferReceived { session_id, .. }
            | NegotiationEvent::AnswerReceived { session_id, .. }
            | NegotiationEvent::CandidateReceived { session_id, .. }
            | NegotiationEvent::SessionRemoved { session_id } => session_id,
        }
    }
}

/// Subscriptions plus the task draining them. Cancelling unregisters the
/// subscriptions before returning and silences the task.
struct Watch {
    active: Arc<AtomicBool>,
    guards: Vec<SubscriptionGuard>,
    task: Option<JoinHandle<()>>,
}

impl Watch {
    fn cancel(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        for guard in &mut self.guards {
            guard.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Default)]
struct NegotiatorState {
    offer_listener: Option<Watch>,
    sessions: HashMap<String, Watch>,
    seen_offers: HashSet<String>,
}

struct Shared {
    ctx: SignalContext,
    observers: Observers<NegotiationEvent>,
    state: Mutex<NegotiatorState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn candidate_query(session_id: &str, self_peer_id: &str) -> Query {
        Query::collection(candidates_collection(session_id)).filter(
            "originPeer",
            FilterOp::Ne,
            self_peer_id,
        )
    }

    async fn watch_session(
        self: &Arc<Self>,
        session_id: &str,
        self_peer_id: &str,
        deliver_answer: bool,
    ) -> Result<(), SignalError> {
        let store = &self.ctx.store;
        let candidate_query = Self::candidate_query(session_id, self_peer_id);

        let (session_rx, session_guard) = store
            .subscribe(Query::document(SESSIONS, session_id))
            .await?
            .into_parts();
        let (candidate_rx, candidate_guard) =
            store.subscribe(candidate_query.clone()).await?.into_parts();

        let active = Arc::new(AtomicBool::new(true));
        let mut task = SessionWatchTask {
            session_id: session_id.to_string(),
            deliver_answer,
            answer_delivered: false,
            seen_candidates: HashSet::new(),
            observers: self.observers.clone(),
            active: active.clone(),
        };

        // Catch up on writes that landed before the subscriptions existed.
        // Candidates are read before the session, so none of them can
        // postdate an answer the session read misses.
        let candidates = match store.query(&candidate_query).await {
            Ok(documents) => documents,
            Err(e) => {
                log::warn!("Could not read candidates of {}: {}", session_id, e);
                Vec::new()
            }
        };
        if deliver_answer {
            match store.get(SESSIONS, session_id).await {
                Ok(Some(document)) => {
                    task.on_session_change(DocumentChange {
                        kind: ChangeKind::Modified,
                        document,
                    });
                }
                Ok(None) => {}
                Err(e) => log::warn!("Could not read session {}: {}", session_id, e),
            }
        }
        for document in candidates {
            task.on_candidate_change(DocumentChange {
                kind: ChangeKind::Added,
                document,
            });
        }

        let handle = tokio::spawn(task.run(session_rx, candidate_rx, Arc::downgrade(self)));
        let watch = Watch {
            active,
            guards: vec![session_guard, candidate_guard],
            task: Some(handle),
        };
        let previous = self.lock().sessions.insert(session_id.to_string(), watch);
        drop(previous);
        log::debug!("Watching session {}", session_id);
        Ok(())
    }

    /// Drop the watch of `session_id` if it is still the one owning `active`.
    fn forget_watch(&self, session_id: &str, active: &Arc<AtomicBool>) {
        let mut state = self.lock();
        let owned = state
            .sessions
            .get(session_id)
            .map_or(false, |watch| Arc::ptr_eq(&watch.active, active));
        if owned {
            let watch = state.sessions.remove(session_id);
            state.seen_offers.remove(session_id);
            drop(state);
            drop(watch);
        }
    }
}

struct SessionWatchTask {
    session_id: String,
    deliver_answer: bool,
    answer_delivered: bool,
    seen_candidates: HashSet<String>,
    observers: Observers<NegotiationEvent>,
    active: Arc<AtomicBool>,
}

impl SessionWatchTask {
    fn emit(&self, event: NegotiationEvent) {
        if self.active.load(Ordering::SeqCst) {
            self.observers.notify(event);
        }
    }

    /// Returns false once the session is gone.
    fn on_session_change(&mut self, change: DocumentChange) -> bool {
        if change.kind == ChangeKind::Removed {
            log::info!("Session {} removed", self.session_id);
            self.emit(NegotiationEvent::SessionRemoved {
                session_id: self.session_id.clone(),
            });
            return false;
        }
        if !self.deliver_answer || self.answer_delivered {
            return true;
        }
        match records::session_from_document(&change.document) {
            Ok(SessionRecord {
                answer: Some(answer),
                ..
            }) => {
                self.answer_delivered = true;
                log::info!("Answer received for session {}", self.session_id);
                self.emit(NegotiationEvent::AnswerReceived {
                    session_id: self.session_id.clone(),
                    answer,
                });
            }
            Ok(_) => {}
            Err(e) => log::warn!("Unreadable session document: {}", e),
        }
        true
    }

    fn on_candidate_change(&mut self, change: DocumentChange) {
        if change.kind == ChangeKind::Removed
            || !self.seen_candidates.insert(change.document.id.clone())
        {
            return;
        }
        match records::from_document::<IceCandidateRecord>(&change.document) {
            Ok(record) => {
                log::debug!(
                    "Candidate {} from {} for session {}",
                    change.document.id,
                    record.origin_peer,
                    self.session_id
                );
                self.emit(NegotiationEvent::CandidateReceived {
                    session_id: self.session_id.clone(),
                    candidate: record.candidate,
                });
            }
            Err(e) => log::warn!("Unreadable candidate document: {}", e),
        }
    }

    async fn run(
        mut self,
        mut session_rx: mpsc::UnboundedReceiver<DocumentChange>,
        mut candidate_rx: mpsc::UnboundedReceiver<DocumentChange>,
        shared: Weak<Shared>,
    ) {
        let mut session_open = true;
        let mut candidates_open = true;
        let mut removed = false;

        while session_open || candidates_open {
            tokio::select! {
                biased;
                change = session_rx.recv(), if session_open => match change {
                    Some(change) => {
                        if !self.on_session_change(change) {
                            removed = true;
                            break;
                        }
                    }
                    None => session_open = false,
                },
                change = candidate_rx.recv(), if candidates_open => match change {
                    Some(change) => self.on_candidate_change(change),
                    None => candidates_open = false,
                },
            }
        }

        if removed {
            if let Some(shared) = shared.upgrade() {
                shared.forget_watch(&self.session_id, &self.active);
            }
        }
    }
}

async fn run_offer_listener(
    shared: Weak<Shared>,
    mut changes: mpsc::UnboundedReceiver<DocumentChange>,
    self_peer_id: String,
    active: Arc<AtomicBool>,
) {
    while let Some(change) = changes.recv().await {
        if change.kind != ChangeKind::Added {
            continue;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !active.load(Ordering::SeqCst) {
            break;
        }
        // Offers are delivered once per negotiator, across re-subscriptions.
        if !shared.lock().seen_offers.insert(change.document.id.clone()) {
            continue;
        }
        let session = match records::session_from_document(&change.document) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Ignoring unreadable offer: {}", e);
                continue;
            }
        };
        if session.answer.is_some() {
            log::debug!("Ignoring already answered session {}", session.session_id);
            continue;
        }

        log::info!(
            "Offer received from {} (session {})",
            session.from_peer,
            session.session_id
        );
        shared.observers.notify(NegotiationEvent::OfferReceived {
            session_id: session.session_id.clone(),
            from_peer: session.from_peer.clone(),
            offer: session.offer.clone(),
        });
        if let Err(e) = shared
            .watch_session(&session.session_id, &self_peer_id, false)
            .await
        {
            log::warn!("Cannot watch session {}: {}", session.session_id, e);
        }
    }
}

/// Creates, answers, feeds and removes session documents.
pub struct SessionNegotiator {
    shared: Arc<Shared>,
}

impl SessionNegotiator {
    pub fn new(ctx: SignalContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                observers: Observers::new(),
                state: Mutex::new(NegotiatorState::default()),
            }),
        }
    }

    pub fn observe(&self) -> EventReceiver<NegotiationEvent> {
        self.shared.observers.register()
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.shared.observers.unregister(id);
    }

    /// Write a new session carrying `offer`, then watch it for the answer and
    /// for the counterpart's candidates.
    pub async fn initiate(
        &self,
        from_peer: &str,
        target_peer: &str,
        offer: Description,
    ) -> Result<String, SignalError> {
        let record = SessionRecord::new(from_peer, target_peer, offer, self.shared.ctx.clock.now());
        let doc = records::to_document(&record)
            .map_err(|e| SignalError::NegotiationFailed(e.to_string()))?;
        let session_id = self.shared.ctx.store.add(SESSIONS, doc).await?;

        if let Err(e) = self.shared.watch_session(&session_id, from_peer, true).await {
            log::warn!("Abandoning unwatched session {}: {}", session_id, e);
            if let Err(e) = self.shared.ctx.store.delete(SESSIONS, &session_id).await {
                log::warn!("Failed to remove session {}: {}", session_id, e);
            }
            return Err(e);
        }

        log::info!(
            "Session {} initiated: {} -> {}",
            session_id,
            from_peer,
            target_peer
        );
        Ok(session_id)
    }

    /// Set the answer of `session_id`.
    ///
    /// Re-sending the stored answer is accepted; any other answer fails with
    /// `AlreadyAnswered`.
    pub async fn respond(&self, session_id: &str, answer: Description) -> Result<(), SignalError> {
        let store = &self.shared.ctx.store;
        let document = store
            .get(SESSIONS, session_id)
            .await?
            .ok_or_else(|| SignalError::SessionNotFound(session_id.to_string()))?;
        let session = records::session_from_document(&document)
            .map_err(|e| SignalError::NegotiationFailed(e.to_string()))?;

        match session.answer {
            Some(existing) if existing == answer => {
                log::debug!("Session {} already carries this answer", session_id);
                return Ok(());
            }
            Some(_) => return Err(SignalError::AlreadyAnswered(session_id.to_string())),
            None => {}
        }

        let mut update = Document::new();
        update.insert("answer".to_string(), answer.0);
        update.insert(
            "answeredAt".to_string(),
            json!(self.shared.ctx.clock.now_millis()),
        );
        store
            .update(SESSIONS, session_id, update)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => SignalError::SessionNotFound(session_id.to_string()),
                other => other.into(),
            })?;

        log::info!("Answered session {}", session_id);
        Ok(())
    }

    /// Append a candidate to the session's candidate sub-collection.
    pub async fn send_candidate(
        &self,
        session_id: &str,
        candidate: Candidate,
        origin_peer: &str,
    ) -> Result<String, SignalError> {
        let record = IceCandidateRecord {
            candidate,
            origin_peer: origin_peer.to_string(),
            created_at: self.shared.ctx.clock.now(),
        };
        let doc = records::to_document(&record)
            .map_err(|e| SignalError::CandidateSendFailed(e.to_string()))?;
        self.shared
            .ctx
            .store
            .add(&candidates_collection(session_id), doc)
            .await
            .map_err(|e| SignalError::CandidateSendFailed(format!("{}: {}", session_id, e)))
    }

    /// Deliver every new offer targeting `self_peer_id` once, and watch the
    /// candidates of each offered session.
    pub async fn listen_for_offers(&self, self_peer_id: &str) -> Result<(), SignalError> {
        let query = Query::collection(SESSIONS)
            .where_eq("targetPeer", self_peer_id)
            .where_eq("type", SessionKind::Offer.as_str());
        let (changes, guard) = self.shared.ctx.store.subscribe(query).await?.into_parts();

        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_offer_listener(
            Arc::downgrade(&self.shared),
            changes,
            self_peer_id.to_string(),
            active.clone(),
        ));
        let previous = self.shared.lock().offer_listener.replace(Watch {
            active,
            guards: vec![guard],
            task: Some(task),
        });
        drop(previous);

        log::info!("Listening for offers to {}", self_peer_id);
        Ok(())
    }

    /// Watch candidates written to `session_id` by anyone but `self_peer_id`.
    pub async fn listen_for_ice_candidates(
        &self,
        session_id: &str,
        self_peer_id: &str,
    ) -> Result<(), SignalError> {
        self.shared.watch_session(session_id, self_peer_id, false).await
    }

    pub fn is_listening_for_offers(&self) -> bool {
        self.shared.lock().offer_listener.is_some()
    }

    pub fn watched_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.shared.lock().sessions.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Stop watching one session without touching the store.
    pub fn forget(&self, session_id: &str) {
        let mut state = self.shared.lock();
        let watch = state.sessions.remove(session_id);
        state.seen_offers.remove(session_id);
        drop(state);
        drop(watch);
    }

    /// Offers delivered and not yet forgotten.
    pub fn pending_offer_count(&self) -> usize {
        self.shared.lock().seen_offers.len()
    }

    /// Delete the session and all its candidates in one batch.
    ///
    /// Local watches end before the store is touched. A second call fails with
    /// `SessionNotFound`.
    pub async fn cleanup(&self, session_id: &str) -> Result<(), SignalError> {
        self.forget(session_id);

        let store = &self.shared.ctx.store;
        if store.get(SESSIONS, session_id).await?.is_none() {
            return Err(SignalError::SessionNotFound(session_id.to_string()));
        }

        let collection = candidates_collection(session_id);
        let candidates: Vec<StoredDocument> = store.query(&Query::collection(&collection)).await?;
        let mut targets = vec![(SESSIONS.to_string(), session_id.to_string())];
        targets.extend(
            candidates
                .into_iter()
                .map(|doc| (collection.clone(), doc.id)),
        );
        store.delete_batch(&targets).await?;

        log::info!(
            "Cleaned up session {} ({} candidates)",
            session_id,
            targets.len() - 1
        );
        Ok(())
    }

    /// Cancel the offer listener and every session watch.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        let listener = state.offer_listener.take();
        let sessions: Vec<Watch> = state.sessions.drain().map(|(_, watch)| watch).collect();
        drop(state);
        drop(listener);
        drop(sessions);
    }
}

impl Drop for SessionNegotiator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
