//! Cross-instance bridge over UDP multicast: every publication is delivered
//! locally and broadcast to the group; datagrams from other instances are fed
//! to local subscribers of the topic.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, warn};
use rendezvous_core::bridge::{LocalHub, PubSub, SubscriberId};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

const MAX_DATAGRAM: usize = 65536;

/// One publication on the wire (bincode).
#[derive(Debug, Serialize, Deserialize)]
struct BridgeFrame {
    instance: Uuid,
    topic: String,
    payload: Vec<u8>,
}

pub struct MulticastHub {
    local: LocalHub,
    socket: UdpSocket,
    dest: SocketAddr,
    instance: Uuid,
}

impl MulticastHub {
    /// Join `group` on `port` and send publications to it.
    pub fn bind(group: Ipv4Addr, port: u16, ttl: u32) -> std::io::Result<Arc<Self>> {
        let socket = make_multicast_socket(group, port, ttl)?;
        Ok(Self::from_socket(socket, SocketAddr::from((group, port))))
    }

    /// Use an already bound socket, sending publications to `dest`.
    pub fn from_socket(socket: UdpSocket, dest: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local: LocalHub::new(),
            socket,
            dest,
            instance: Uuid::new_v4(),
        })
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Receive datagrams from other instances until the socket fails.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let delivered = self.handle_datagram(&buf[..n]);
            debug!("bridge datagram from {}: {} local subscriber(s)", from, delivered);
        }
    }

    /// Deliver one datagram locally. Own datagrams (multicast loopback) and garbage are dropped.
    fn handle_datagram(&self, buf: &[u8]) -> usize {
        let frame: BridgeFrame = match bincode::deserialize(buf) {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping undecodable bridge datagram: {}", e);
                return 0;
            }
        };
        if frame.instance == self.instance {
            return 0;
        }
        self.local.deliver(&frame.topic, &frame.payload)
    }

    fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&BridgeFrame {
            instance: self.instance,
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }
}

impl PubSub for MulticastHub {
    fn subscribe(&self, topic: &str) -> (SubscriberId, mpsc::UnboundedReceiver<Vec<u8>>) {
        self.local.subscribe(topic)
    }

    fn publish(&self, topic: &str, from: SubscriberId, payload: &[u8]) {
        self.local.publish(topic, from, payload);
        let frame = match self.encode(topic, payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot encode bridge datagram for {:?}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = self.socket.try_send_to(&frame, self.dest) {
            warn!("bridge send to {} failed: {}", self.dest, e);
        }
    }

    fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        self.local.unsubscribe(topic, id);
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16, ttl: u32) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(ttl)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
