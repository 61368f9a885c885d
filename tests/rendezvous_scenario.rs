//! End-to-end rendezvous scenarios over the in-memory store.

use pairlink::negotiator::NegotiationEvent;
use pairlink::observer::EventReceiver;
use pairlink::records::PEERS;
use pairlink::{
    ConnectionState, ConnectionStateMachine, ConnectionUpdate, Description, LoopbackNetwork,
    MemoryStore, PairlinkConfig, PeerRegistry, PresenceStore, Role, SessionNegotiator,
    SignalContext, TransportFactory,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const NAV: &str = "nav_1000_abc";
const IFACE: &str = "if_1000_xyz";
const IDENTITY: &str = "1.2.3.4";

fn context() -> (Arc<MemoryStore>, SignalContext) {
    let store = Arc::new(MemoryStore::new());
    let ctx = SignalContext::new(store.clone(), PairlinkConfig::default());
    (store, ctx)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn drain<T: Clone + Send + 'static>(rx: &mut EventReceiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Some(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn peer_ids(peers: &[pairlink::PeerRecord]) -> Vec<&str> {
    peers.iter().map(|p| p.peer_id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_discover_then_offer_answer() {
    let (_store, ctx) = context();
    let nav_registry = PeerRegistry::new(ctx.clone());
    let if_registry = PeerRegistry::new(ctx.clone());

    nav_registry.register(NAV, Role::Navigator, IDENTITY).await.unwrap();
    if_registry.register(IFACE, Role::Interface, IDENTITY).await.unwrap();

    let found = if_registry.discover(Role::Interface, IDENTITY).await;
    assert_eq!(peer_ids(&found), vec![NAV]);

    let nav = SessionNegotiator::new(ctx.clone());
    let iface = SessionNegotiator::new(ctx);
    let mut nav_events = nav.observe();
    let mut if_events = iface.observe();
    iface.listen_for_offers(IFACE).await.unwrap();

    let offer = Description(json!({"type": "offer", "sdp": "offerBlob"}));
    let s1 = nav.initiate(NAV, IFACE, offer.clone()).await.unwrap();
    settle().await;

    assert_eq!(
        drain(&mut if_events),
        vec![NegotiationEvent::OfferReceived {
            session_id: s1.clone(),
            from_peer: NAV.to_string(),
            offer,
        }]
    );

    let answer = Description(json!({"type": "answer", "sdp": "answerBlob"}));
    iface.respond(&s1, answer.clone()).await.unwrap();
    settle().await;

    assert_eq!(
        drain(&mut nav_events),
        vec![NegotiationEvent::AnswerReceived {
            session_id: s1,
            answer,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_state_machines_pass_through_connecting() {
    let (_store, ctx) = context();
    let network = LoopbackNetwork::new();
    let factory: Arc<dyn TransportFactory> = Arc::new(network.clone());

    let nav_negotiator = Arc::new(SessionNegotiator::new(ctx.clone()));
    let if_negotiator = Arc::new(SessionNegotiator::new(ctx));
    let nav = ConnectionStateMachine::new(NAV, "vibration-control", nav_negotiator.clone(), factory.clone());
    let iface = ConnectionStateMachine::new(IFACE, "vibration-control", if_negotiator.clone(), factory);
    let mut nav_updates = nav.observe();
    let mut if_updates = iface.observe();

    if_negotiator.listen_for_offers(IFACE).await.unwrap();
    let nav_driver = tokio::spawn(nav.clone().drive(nav_negotiator.observe()));
    let if_driver = tokio::spawn(iface.clone().drive(if_negotiator.observe()));

    let session_id = nav.connect(IFACE).await.unwrap();
    settle().await;

    let states = |updates: Vec<ConnectionUpdate>| -> Vec<ConnectionState> {
        updates.into_iter().map(|u| u.state).collect()
    };
    let nav_states = states(drain(&mut nav_updates));
    let if_states = states(drain(&mut if_updates));
    assert!(nav_states.contains(&ConnectionState::Connecting));
    assert!(if_states.contains(&ConnectionState::Connecting));
    assert_eq!(nav.state(), ConnectionState::Connected);
    assert_eq!(iface.state(), ConnectionState::Connected);
    assert_eq!(iface.session_id(), Some(session_id));
    assert_eq!(network.open_channel_count(), 2);

    nav_driver.abort();
    if_driver.abort();
}

#[tokio::test(start_paused = true)]
async fn test_discover_without_peers_is_empty() {
    let (_store, ctx) = context();
    let registry = PeerRegistry::new(ctx);
    registry.register(IFACE, Role::Interface, IDENTITY).await.unwrap();

    let found = tokio::time::timeout(
        Duration::from_millis(100),
        registry.discover(Role::Interface, IDENTITY),
    )
    .await
    .expect("discovery should answer within one round-trip");
    assert!(found.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_heartbeat_leaves_discovery() {
    let (store, ctx) = context();
    let nav_registry = PeerRegistry::new(ctx.clone());
    let if_registry = PeerRegistry::new(ctx);

    nav_registry.register(NAV, Role::Navigator, IDENTITY).await.unwrap();
    if_registry.register(IFACE, Role::Interface, IDENTITY).await.unwrap();
    // Let the immediate first heartbeats run before injecting failures.
    tokio::time::sleep(Duration::from_millis(1)).await;

    let last_seen = |doc: pairlink::store::StoredDocument| doc.field("lastSeen").and_then(|v| v.as_i64());
    let stalled_at = last_seen(store.get(PEERS, NAV).await.unwrap().unwrap());

    // The heartbeats at 30 s, 60 s and 90 s fail.
    store.fail_writes(PEERS, NAV, 3);

    tokio::time::sleep(Duration::from_millis(30_001)).await;
    assert_eq!(last_seen(store.get(PEERS, NAV).await.unwrap().unwrap()), stalled_at);
    assert_eq!(peer_ids(&if_registry.discover(Role::Interface, IDENTITY).await), vec![NAV]);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(last_seen(store.get(PEERS, NAV).await.unwrap().unwrap()), stalled_at);
    assert!(if_registry.discover(Role::Interface, IDENTITY).await.is_empty());

    // The heartbeat at 120 s succeeds again.
    tokio::time::sleep(Duration::from_millis(59_100)).await;
    assert!(last_seen(store.get(PEERS, NAV).await.unwrap().unwrap()) > stalled_at);
    assert_eq!(peer_ids(&if_registry.discover(Role::Interface, IDENTITY).await), vec![NAV]);
}
