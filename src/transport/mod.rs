//! Peer-to-peer transport seam
//!
//! The connection state machine needs four capabilities from the transport:
//! produce a local offer/answer, accept a remote description, accept a remote
//! candidate, and report local candidates plus channel open/close/error
//! events. Descriptions and candidates stay opaque here.

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::records::{Candidate, Description};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Signals emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local network candidate to forward to the remote peer.
    LocalCandidate(Candidate),
    /// The data channel is open.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// Transient loss of connectivity.
    Disconnected,
    /// Unrecoverable transport failure.
    Error(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Produce an offer and install it as the local description.
    async fn create_offer(&self) -> Result<Description, TransportError>;

    /// Produce an answer to the installed remote offer and install it locally.
    async fn create_answer(&self) -> Result<Description, TransportError>;

    async fn set_remote_description(&self, description: Description) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), TransportError>;

    /// The transport's event stream; yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self);
}

/// Creates one fresh transport per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, label: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
