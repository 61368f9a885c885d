//! Observer registration lists
//!
//! Each event type gets its own `Observers<T>`; every registered observer
//! receives every event on its own queue until it unregisters or drops its
//! receiver. Registering never displaces an earlier observer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub type ObserverId = u64;

struct Registry<T> {
    next_id: ObserverId,
    senders: Vec<(ObserverId, mpsc::UnboundedSender<T>)>,
}

pub struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> EventReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.senders.push((id, sender));
        EventReceiver { id, receiver }
    }

    pub fn unregister(&self, id: ObserverId) {
        self.lock().senders.retain(|(observer, _)| *observer != id);
    }

    /// Deliver `event` to every live observer, pruning closed ones.
    pub fn notify(&self, event: T) {
        self.lock()
            .senders
            .retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every observer; their receivers end after draining.
    pub fn clear(&self) {
        self.lock().senders.clear();
    }
}

/// Receiving side of one observer registration.
#[derive(Debug)]
pub struct EventReceiver<T> {
    id: ObserverId,
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> EventReceiver<T> {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}
