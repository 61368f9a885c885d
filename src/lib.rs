//! Pairlink: rendezvous and session negotiation for two-peer data channels
//!
//! A *navigator* and an *interface* that share a network identity find each
//! other through a presence store, then exchange offer, answer and network
//! candidates through session documents until a direct channel opens.
//!
//! # Components
//! - [`store`]: presence store contract and the in-memory backend
//! - [`registry`]: registration, heartbeat and discovery
//! - [`negotiator`]: session creation, answers, candidates and cleanup
//! - [`connection`]: the per-attempt connection state machine
//! - [`orchestrator`]: per-role driver with retry and reconnect
//! - [`host`]: JSON request bridge for a foreground UI
//!
//! # Usage
//! ```rust,ignore
//! use pairlink::{RoleOrchestrator, Role, SignalContext, StaticIdentity, LoopbackNetwork};
//! use std::sync::Arc;
//!
//! let ctx = SignalContext::in_memory();
//! let peer_id = pairlink::records::generate_peer_id(Role::Navigator);
//! let navigator = RoleOrchestrator::new(
//!     ctx,
//!     Role::Navigator,
//!     &peer_id,
//!     Arc::new(StaticIdentity::new("1.2.3.4")),
//!     Arc::new(LoopbackNetwork::new()),
//! );
//! navigator.start();
//! ```
pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod host;
pub mod identity;
pub mod negotiator;
pub mod observer;
pub mod orchestrator;
pub mod records;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::PairlinkConfig;
pub use connection::{ConnectionState, ConnectionStateMachine, ConnectionUpdate};
pub use context::SignalContext;
pub use errors::{SignalError, StoreError};
pub use host::{HostBridge, HostRequest, HostResponse};
pub use identity::{IdentitySource, PublicIpLookup, StaticIdentity, FALLBACK_IDENTITY};
pub use negotiator::{NegotiationEvent, SessionNegotiator};
pub use orchestrator::{ConnectionStatus, RoleOrchestrator};
pub use records::{Candidate, Description, PeerRecord, PeerStatus, Role, SessionRecord};
pub use registry::PeerRegistry;
pub use store::{MemoryStore, PresenceStore};
pub use transport::{LoopbackNetwork, Transport, TransportEvent, TransportFactory};

/// Initialize logging for the signaling stack
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "pairlink=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        webrtc: cfg!(feature = "webrtc"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Whether the real WebRTC transport is compiled in.
    pub webrtc: bool,
}
