//! Per-process context shared by every component.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::PairlinkConfig;
use crate::store::{MemoryStore, PresenceStore};

/// Built once per process and handed to each component that needs the
/// store, the clock or configuration.
#[derive(Clone)]
pub struct SignalContext {
    pub store: Arc<dyn PresenceStore>,
    pub clock: Clock,
    pub config: Arc<PairlinkConfig>,
}

impl SignalContext {
    pub fn new(store: Arc<dyn PresenceStore>, config: PairlinkConfig) -> Self {
        Self {
            store,
            clock: Clock::new(),
            config: Arc::new(config),
        }
    }

    /// Context over a fresh in-memory store with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), PairlinkConfig::default())
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}
