//! Request and reply records for the two exchange protocols.
//!
//! Legacy: the request packet is `privateAddr|channelName` and the exchanged
//! payload is `publicAddr|privateAddr`.
//! Structured: JSON records, see [`ClientInfo`] and [`ReplyInfo`].

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

const LEGACY_SEP: char = '|';

/// An endpoint as the service saw it (`pub_addr`) and as the peer reported it (`pri_addr`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPair {
    #[serde(rename = "pubAddr")]
    pub pub_addr: String,
    #[serde(rename = "priAddr")]
    pub pri_addr: String,
}

impl AddrPair {
    pub fn new(pub_addr: impl Into<String>, pri_addr: impl Into<String>) -> Self {
        Self {
            pub_addr: pub_addr.into(),
            pri_addr: pri_addr.into(),
        }
    }
}

/// Structured request packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub pri_addr: String,
    pub chan_name: String,
    #[serde(default)]
    pub is_aux_port: bool,
}

/// Structured exchange payload, delivered verbatim to the counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyInfo {
    /// The sender's own pair, then any auxiliary pairs on the channel.
    pub peer_addrs: Vec<AddrPair>,
}

/// Legacy request packet, already split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRequest {
    pub pri_addr: String,
    pub chan_name: String,
}

impl LegacyRequest {
    /// Parse `privateAddr|channelName`. Fields past the second are ignored.
    pub fn parse(packet: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(packet).map_err(|_| ProtocolError::Malformed)?;
        let mut fields = text.split(LEGACY_SEP);
        let pri_addr = fields.next().ok_or(ProtocolError::Malformed)?;
        let chan_name = fields.next().ok_or(ProtocolError::Malformed)?;
        if chan_name.is_empty() {
            return Err(ProtocolError::EmptyChannel);
        }
        Ok(Self {
            pri_addr: pri_addr.to_string(),
            chan_name: chan_name.to_string(),
        })
    }
}

impl ClientInfo {
    pub fn parse(packet: &[u8]) -> Result<Self, ProtocolError> {
        let info: ClientInfo = serde_json::from_slice(packet)?;
        if info.chan_name.is_empty() {
            return Err(ProtocolError::EmptyChannel);
        }
        Ok(info)
    }
}

/// Legacy exchange payload: `publicAddr|privateAddr`.
pub fn legacy_payload(pair: &AddrPair) -> Vec<u8> {
    format!("{}{}{}", pair.pub_addr, LEGACY_SEP, pair.pri_addr).into_bytes()
}

/// Format an observed socket address as `host:port`, bracketing IPv6 hosts.
pub fn join_host_port(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(a) => format!("{}:{}", a.ip(), a.port()),
        SocketAddr::V6(a) => format!("[{}]:{}", a.ip(), a.port()),
    }
}

/// Error parsing a request packet.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed request packet")]
    Malformed,
    #[error("invalid request record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty channel name")]
    EmptyChannel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_parse_and_payload() {
        let req = LegacyRequest::parse(b"10.0.0.5:9|chanX").unwrap();
        assert_eq!(req.pri_addr, "10.0.0.5:9");
        assert_eq!(req.chan_name, "chanX");
        let payload = legacy_payload(&AddrPair::new("203.0.113.1:4000", req.pri_addr));
        assert_eq!(payload, b"203.0.113.1:4000|10.0.0.5:9");
    }

    #[test]
    fn legacy_parse_rejects_missing_channel() {
        assert!(matches!(
            LegacyRequest::parse(b"10.0.0.5:9"),
            Err(ProtocolError::Malformed)
        ));
        assert!(matches!(
            LegacyRequest::parse(b"10.0.0.5:9|"),
            Err(ProtocolError::EmptyChannel)
        ));
        assert!(matches!(
            LegacyRequest::parse(&[0xff, b'|', b'a']),
            Err(ProtocolError::Malformed)
        ));
    }

    #[test]
    fn legacy_parse_ignores_extra_fields() {
        let req = LegacyRequest::parse(b"a|b|c").unwrap();
        assert_eq!(req.chan_name, "b");
    }

    #[test]
    fn client_info_wire_names() {
        let info = ClientInfo::parse(br#"{"priAddr":"10.0.0.5:9","chanName":"c"}"#).unwrap();
        assert_eq!(info.pri_addr, "10.0.0.5:9");
        assert!(!info.is_aux_port);

        let aux =
            ClientInfo::parse(br#"{"priAddr":"1.2.3.4:5","chanName":"c","isAuxPort":true}"#)
                .unwrap();
        assert!(aux.is_aux_port);

        assert!(matches!(
            ClientInfo::parse(br#"{"priAddr":"x","chanName":""}"#),
            Err(ProtocolError::EmptyChannel)
        ));
        assert!(matches!(
            ClientInfo::parse(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn reply_info_wire_names() {
        let reply = ReplyInfo {
            peer_addrs: vec![AddrPair::new("203.0.113.1:4000", "10.0.0.5:9")],
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(
            json,
            r#"{"peerAddrs":[{"pubAddr":"203.0.113.1:4000","priAddr":"10.0.0.5:9"}]}"#
        );
    }

    #[test]
    fn join_host_port_brackets_v6() {
        let v4: SocketAddr = "203.0.113.1:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        assert_eq!(join_host_port(&v4), "203.0.113.1:4000");
        assert_eq!(join_host_port(&v6), "[2001:db8::1]:5000");
    }
}
