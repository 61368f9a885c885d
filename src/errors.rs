use thiserror::Error;

use crate::transport::TransportError;

/// Failures reported by a presence store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors surfaced by the rendezvous and negotiation layers.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Registration error: {0}")]
    RegistrationError(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session {0} already answered")]
    AlreadyAnswered(String),
    #[error("Candidate send failed: {0}")]
    CandidateSendFailed(String),
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Identity lookup failed: {0}")]
    IdentityLookup(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SignalError {
    /// Protocol-level conflicts are abandoned rather than retried.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SignalError::SessionNotFound(_) | SignalError::AlreadyAnswered(_)
        )
    }
}

impl From<StoreError> for SignalError {
    fn from(error: StoreError) -> Self {
        SignalError::StoreUnavailable(error.to_string())
    }
}
