//! Rendezvous service: the two request protocols on top of the coordinator and auxiliary registry.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::AsyncRead;

use crate::auxiliary::AuxRegistry;
use crate::bridge::{Bridge, PubSub};
use crate::coordinator::Coordinator;
use crate::protocol::{legacy_payload, AddrPair, ClientInfo, LegacyRequest, ProtocolError, ReplyInfo};
use crate::registry::PairingRegistry;

pub struct Rendezvous {
    coordinator: Coordinator,
    aux: AuxRegistry,
}

impl Rendezvous {
    /// Fresh registries; cross-instance exchanges go through `bus`.
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self {
            coordinator: Coordinator::new(PairingRegistry::new(), Bridge::new(bus)),
            aux: AuxRegistry::new(),
        }
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.coordinator = self.coordinator.with_timeout(timeout);
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn auxiliary(&self) -> &AuxRegistry {
        &self.aux
    }

    pub async fn exchange<R>(&self, name: &str, payload: Vec<u8>, conn: &mut R) -> Vec<u8>
    where
        R: AsyncRead + Unpin,
    {
        self.coordinator.exchange(name, payload, conn).await
    }

    pub fn register_auxiliary(&self, name: &str, pair: AddrPair) {
        debug!("aux port registered on {:?}: {:?}", name, pair);
        self.aux.register(name, pair);
    }

    /// `privateAddr|channelName` in, counterpart's `publicAddr|privateAddr` out.
    /// Returns an empty payload if the peer gave up.
    pub async fn exchange_legacy<R>(
        &self,
        pub_addr: &str,
        packet: &[u8],
        conn: &mut R,
    ) -> Result<Vec<u8>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let req = LegacyRequest::parse(packet)?;
        let own = legacy_payload(&AddrPair::new(pub_addr, req.pri_addr));
        Ok(self.exchange(&req.chan_name, own, conn).await)
    }

    /// JSON [`ClientInfo`] in, counterpart's JSON [`ReplyInfo`] out. Auxiliary
    /// registrations return immediately with an empty payload.
    pub async fn exchange_structured<R>(
        &self,
        pub_addr: &str,
        packet: &[u8],
        conn: &mut R,
    ) -> Result<Vec<u8>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let info = ClientInfo::parse(packet)?;
        let pair = AddrPair::new(pub_addr, info.pri_addr);
        if info.is_aux_port {
            self.register_auxiliary(&info.chan_name, pair);
            return Ok(Vec::new());
        }
        let mut peer_addrs = vec![pair];
        peer_addrs.extend(self.aux.list(&info.chan_name));
        let own = serde_json::to_vec(&ReplyInfo { peer_addrs })?;
        Ok(self.exchange(&info.chan_name, own, conn).await)
    }
}
