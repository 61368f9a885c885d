//! Session negotiator guarantees observable through the store.

use futures::future::join_all;
use pairlink::negotiator::NegotiationEvent;
use pairlink::records::{candidates_collection, SESSIONS};
use pairlink::{
    Candidate, Description, MemoryStore, PairlinkConfig, PresenceStore, SessionNegotiator,
    SignalContext, SignalError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn negotiators() -> (Arc<MemoryStore>, SessionNegotiator, SessionNegotiator) {
    let store = Arc::new(MemoryStore::new());
    let ctx = SignalContext::new(store.clone(), PairlinkConfig::default());
    (store, SessionNegotiator::new(ctx.clone()), SessionNegotiator::new(ctx))
}

fn offer() -> Description {
    Description(json!({"type": "offer", "sdp": "o"}))
}

fn answer(sdp: &str) -> Description {
    Description(json!({"type": "answer", "sdp": sdp}))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_competing_answers_store_exactly_one() {
    let (store, nav, iface) = negotiators();
    let session_id = nav.initiate("nav_1", "if_1", offer()).await.unwrap();

    let results = join_all(
        ["a", "b", "c"]
            .iter()
            .map(|sdp| iface.respond(&session_id, answer(sdp))),
    )
    .await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, SignalError::AlreadyAnswered(_))));

    let doc = store.get(SESSIONS, &session_id).await.unwrap().unwrap();
    let stored = Description(doc.field("answer").cloned().unwrap());
    assert_ok!(iface.respond(&session_id, stored).await);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_is_complete_and_second_call_reports_missing() {
    let (store, nav, iface) = negotiators();
    let session_id = nav.initiate("nav_1", "if_1", offer()).await.unwrap();
    for i in 0..4 {
        let origin = if i % 2 == 0 { "nav_1" } else { "if_1" };
        let negotiator = if i % 2 == 0 { &nav } else { &iface };
        assert_ok!(
            negotiator
                .send_candidate(&session_id, Candidate(json!({ "n": i })), origin)
                .await
        );
    }

    assert_ok!(iface.cleanup(&session_id).await);
    assert_eq!(store.document_count(SESSIONS), 0);
    assert_eq!(store.document_count(&candidates_collection(&session_id)), 0);

    let second = assert_err!(nav.cleanup(&session_id).await);
    assert!(matches!(second, SignalError::SessionNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_answer_precedes_candidates_written_after_it() {
    let (_store, nav, iface) = negotiators();
    let mut events = nav.observe();
    let session_id = nav.initiate("nav_1", "if_1", offer()).await.unwrap();

    iface.respond(&session_id, answer("a")).await.unwrap();
    for i in 0..3 {
        iface
            .send_candidate(&session_id, Candidate(json!(i)), "if_1")
            .await
            .unwrap();
    }
    settle().await;

    let mut received = Vec::new();
    while let Some(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 4);
    assert!(matches!(received[0], NegotiationEvent::AnswerReceived { .. }));
    assert!(received[1..]
        .iter()
        .all(|e| matches!(e, NegotiationEvent::CandidateReceived { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_candidates_only_reach_the_counterpart() {
    let (_store, nav, iface) = negotiators();
    let mut nav_events = nav.observe();
    let mut if_events = iface.observe();

    iface.listen_for_offers("if_1").await.unwrap();
    let session_id = nav.initiate("nav_1", "if_1", offer()).await.unwrap();
    settle().await;

    for i in 0..5 {
        nav.send_candidate(&session_id, Candidate(json!({"nav": i})), "nav_1")
            .await
            .unwrap();
        iface
            .send_candidate(&session_id, Candidate(json!({"if": i})), "if_1")
            .await
            .unwrap();
    }
    settle().await;

    let candidates_from = |events: Vec<NegotiationEvent>, key: &str| {
        events
            .into_iter()
            .filter_map(|e| match e {
                NegotiationEvent::CandidateReceived { candidate, .. } => Some(candidate),
                _ => None,
            })
            .filter(|c| c.0.get(key).is_some())
            .count()
    };

    let mut nav_seen = Vec::new();
    while let Some(event) = nav_events.try_recv() {
        nav_seen.push(event);
    }
    let mut if_seen = Vec::new();
    while let Some(event) = if_events.try_recv() {
        if_seen.push(event);
    }

    assert_eq!(candidates_from(nav_seen.clone(), "nav"), 0);
    assert_eq!(candidates_from(nav_seen, "if"), 5);
    assert_eq!(candidates_from(if_seen.clone(), "if"), 0);
    assert_eq!(candidates_from(if_seen, "nav"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_surfaces_as_store_unavailable() {
    let (store, nav, _iface) = negotiators();
    store.set_available(false);
    let error = assert_err!(nav.initiate("nav_1", "if_1", offer()).await);
    assert!(matches!(error, SignalError::StoreUnavailable(_)));
    assert!(!error.is_conflict());
}
