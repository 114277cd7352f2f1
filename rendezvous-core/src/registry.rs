//! Pairing registry: at most one parked exchange per channel name.
//!
//! The first local arrival parks its payload together with a resolver; the
//! second arrival takes the entry, resolves the first with its own payload and
//! walks away with the first's payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Parked exchange, owned by the registry entry for its channel name.
struct PendingExchange {
    ticket: u64,
    payload: Vec<u8>,
    resolver: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    next_ticket: u64,
    entries: HashMap<String, PendingExchange>,
}

/// Outcome of [`PairingRegistry::join`].
pub enum Join {
    /// A waiter was parked under the name; this is its payload.
    Fulfilled(Vec<u8>),
    /// Nobody was waiting; the caller is now the waiter.
    Waiting(Pending),
}

/// Process-local pairing table. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct PairingRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `payload` under `name`. Fails if the name already has a waiter.
    pub fn register(&self, name: &str, payload: Vec<u8>) -> Result<Pending, RegistryError> {
        let mut inner = self.lock();
        if inner.entries.contains_key(name) {
            return Err(RegistryError::Occupied(name.to_string()));
        }
        Ok(self.park(&mut inner, name, payload))
    }

    /// If a waiter is parked under `name`, remove it, hand it `payload` and return its payload.
    pub fn try_fulfill(&self, name: &str, payload: Vec<u8>) -> Option<Vec<u8>> {
        Self::take(&mut self.lock(), name, payload).ok()
    }

    /// `try_fulfill`, falling back to `register`, under a single lock.
    pub fn join(&self, name: &str, payload: Vec<u8>) -> Join {
        let mut inner = self.lock();
        match Self::take(&mut inner, name, payload) {
            Ok(theirs) => Join::Fulfilled(theirs),
            Err(payload) => Join::Waiting(self.park(&mut inner, name, payload)),
        }
    }

    /// Remove the entry for `name` if it is still the one identified by `ticket`.
    /// The resolver is dropped without being invoked.
    pub fn cancel(&self, name: &str, ticket: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get(name) {
            Some(entry) if entry.ticket == ticket => {
                inner.entries.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    /// Number of parked exchanges across all names.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn park(&self, inner: &mut Inner, name: &str, payload: Vec<u8>) -> Pending {
        let (resolver, rx) = oneshot::channel();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.entries.insert(
            name.to_string(),
            PendingExchange {
                ticket,
                payload,
                resolver,
            },
        );
        Pending {
            registry: self.clone(),
            name: name.to_string(),
            ticket,
            rx,
        }
    }

    /// Hands `payload` back in `Err` when there is nobody to take it.
    fn take(inner: &mut Inner, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, Vec<u8>> {
        let Some(entry) = inner.entries.remove(name) else {
            return Err(payload);
        };
        // A waiter whose receiver is gone already concluded; its entry is stale.
        match entry.resolver.send(payload) {
            Ok(()) => Ok(entry.payload),
            Err(payload) => Err(payload),
        }
    }
}

/// Handle held by the waiter. Dropping it withdraws the registration if no counterpart took it.
pub struct Pending {
    registry: PairingRegistry,
    name: String,
    ticket: u64,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl Pending {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Wait for a counterpart. Never resolves if the entry was canceled.
    pub async fn recv(&mut self) -> Vec<u8> {
        match (&mut self.rx).await {
            Ok(payload) => payload,
            Err(_) => std::future::pending().await,
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.registry.cancel(&self.name, self.ticket);
    }
}

/// Error from the pairing registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel {0:?} already has a pending exchange")]
    Occupied(String),
}
