//! Exchange coordinator: pairs one incoming request with its counterpart.
//!
//! A request that finds a parked waiter completes inline. Otherwise it becomes
//! the waiter and races the local registration, the cross-instance bridge, the
//! peer hanging up and an optional deadline. The first branch to finish wins;
//! the others are released before returning.

use std::time::Duration;

use log::debug;
use tokio::io::AsyncRead;

use crate::bridge::Bridge;
use crate::registry::{Join, PairingRegistry};
use crate::watcher;

/// Which branch settled an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Via {
    /// Found a parked waiter on arrival.
    Immediate,
    /// Parked, then taken by a later local arrival.
    Local,
    Bridge,
    Canceled,
    TimedOut,
}

pub struct Coordinator {
    registry: PairingRegistry,
    bridge: Bridge,
    timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(registry: PairingRegistry, bridge: Bridge) -> Self {
        Self {
            registry,
            bridge,
            timeout: None,
        }
    }

    /// Give up on exchanges that find no counterpart within `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &PairingRegistry {
        &self.registry
    }

    /// Exchange `payload` with the next peer under `name`. An empty result means the peer gave up.
    pub async fn exchange<R>(&self, name: &str, payload: Vec<u8>, conn: &mut R) -> Vec<u8>
    where
        R: AsyncRead + Unpin,
    {
        self.exchange_via(name, payload, conn).await.0
    }

    /// Like [`Coordinator::exchange`], also reporting which branch won.
    pub(crate) async fn exchange_via<R>(
        &self,
        name: &str,
        payload: Vec<u8>,
        conn: &mut R,
    ) -> (Vec<u8>, Via)
    where
        R: AsyncRead + Unpin,
    {
        let mut pending = match self.registry.join(name, payload.clone()) {
            Join::Fulfilled(theirs) => {
                debug!("exchange on {:?} settled via {:?}", name, Via::Immediate);
                return (theirs, Via::Immediate);
            }
            Join::Waiting(pending) => pending,
        };

        let (theirs, via) = tokio::select! {
            theirs = pending.recv() => (theirs, Via::Local),
            theirs = self.bridge.exchange(name, &payload) => (theirs, Via::Bridge),
            _ = watcher::client_closed(conn) => (Vec::new(), Via::Canceled),
            _ = deadline(self.timeout) => (Vec::new(), Via::TimedOut),
        };

        // The bridge subscription went away with its future. The local entry
        // is ours to withdraw unless a counterpart already took it.
        if via != Via::Local {
            self.registry.cancel(name, pending.ticket());
        }
        debug!("exchange on {:?} settled via {:?}", name, via);
        (theirs, via)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}
