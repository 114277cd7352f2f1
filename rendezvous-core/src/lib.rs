//! Rendezvous core: pairs two peers under a shared channel name and hands each
//! the other's addresses.
//! Transport-agnostic: the host supplies the request packet, the observed
//! address and the peer's inbound stream.

pub mod auxiliary;
pub mod bridge;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod watcher;
pub mod wire;

pub use auxiliary::AuxRegistry;
pub use bridge::{Bridge, LocalHub, PubSub, SubscriberId, Subscription};
pub use coordinator::Coordinator;
pub use protocol::{join_host_port, AddrPair, ClientInfo, LegacyRequest, ProtocolError, ReplyInfo};
pub use registry::{Join, PairingRegistry, Pending, RegistryError};
pub use service::Rendezvous;
pub use wire::{decode_packet, encode_packet, read_packet, FrameDecodeError, FrameEncodeError};
