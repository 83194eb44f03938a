//! Bitcoin P2P protocol messages.
//!
//! Wire encoding: little-endian integers, big-endian port numbers, and
//! CompactSize var-ints for counts and strings.

use crate::{NetworkError, NetworkResult, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum addresses accepted in a single `addr` message.
pub const MAX_ADDRESSES_PER_MESSAGE: usize = 1000;

/// Maximum accepted user agent length.
const MAX_USER_AGENT_LEN: usize = 256;

/// Service flag advertising a full network node.
pub const NODE_NETWORK: u64 = 1;

fn ensure(buf: &Bytes, needed: usize) -> NetworkResult<()> {
    if buf.remaining() < needed {
        return Err(NetworkError::InvalidMessage("Truncated message".into()));
    }
    Ok(())
}

/// Decode a CompactSize var-int.
pub(crate) fn get_var_int(buf: &mut Bytes) -> NetworkResult<u64> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        0xfd => {
            ensure(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        0xfe => {
            ensure(buf, 4)?;
            Ok(buf.get_u32_le() as u64)
        }
        0xff => {
            ensure(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        n => Ok(n as u64),
    }
}

/// Encode a CompactSize var-int.
pub(crate) fn put_var_int(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

fn get_var_str(buf: &mut Bytes) -> NetworkResult<String> {
    let len = get_var_int(buf)? as usize;
    if len > MAX_USER_AGENT_LEN {
        return Err(NetworkError::InvalidMessage(format!(
            "String too long: {} bytes",
            len
        )));
    }
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| NetworkError::InvalidMessage("Invalid UTF-8 string".into()))
}

fn put_var_str(buf: &mut BytesMut, value: &str) {
    put_var_int(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// A peer endpoint as carried in `addr` and `version` messages.
///
/// The 16-byte IP field uses the IPv4-mapped IPv6 layout: IPv4 octets sit at
/// bytes 12-15 behind a `::ffff:` prefix. Two addresses refer to the same
/// peer when their `(ip, port)` pairs match; `services` and `timestamp` are
/// advisory metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Last-seen time (seconds since epoch). Absent in `version` messages.
    pub timestamp: Option<u32>,
    /// Advertised service flags.
    pub services: u64,
    /// 16-byte IP, IPv4-mapped layout.
    pub ip: [u8; 16],
    /// TCP port.
    pub port: u16,
}

impl NetworkAddress {
    /// Build from a socket address, stamping the current time.
    pub fn from_socket_addr(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            timestamp: Some(unix_time() as u32),
            services,
            ip,
            port: addr.port(),
        }
    }

    /// The `(ip, port)` identity used for duplicate detection.
    pub fn endpoint(&self) -> ([u8; 16], u16) {
        (self.ip, self.port)
    }

    /// Whether the IP field carries an IPv4-mapped address.
    pub fn is_ipv4(&self) -> bool {
        self.ip[..10] == [0u8; 10] && self.ip[10] == 0xff && self.ip[11] == 0xff
    }

    /// Convert to a socket address, unmapping IPv4 where applicable.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = if self.is_ipv4() {
            IpAddr::V4(Ipv4Addr::new(
                self.ip[12],
                self.ip[13],
                self.ip[14],
                self.ip[15],
            ))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.ip))
        };
        SocketAddr::new(ip, self.port)
    }

    /// The IP rendered as a host string (dotted quad for IPv4).
    pub fn ip_string(&self) -> String {
        self.socket_addr().ip().to_string()
    }

    fn encode(&self, buf: &mut BytesMut, with_timestamp: bool) {
        if with_timestamp {
            buf.put_u32_le(self.timestamp.unwrap_or(0));
        }
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip);
        // Port is the one big-endian field in the protocol.
        buf.put_u16(self.port);
    }

    fn decode(buf: &mut Bytes, with_timestamp: bool) -> NetworkResult<Self> {
        let timestamp = if with_timestamp {
            ensure(buf, 4)?;
            Some(buf.get_u32_le())
        } else {
            None
        };
        ensure(buf, 26)?;
        let services = buf.get_u64_le();
        let mut ip = [0u8; 16];
        buf.copy_to_slice(&mut ip);
        let port = buf.get_u16();
        Ok(Self {
            timestamp,
            services,
            ip,
            port,
        })
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Payload of an `addr` message.
#[derive(Debug, Clone, Default)]
pub struct AddressPacket {
    /// Advertised peer addresses.
    pub addresses: Vec<NetworkAddress>,
}

impl AddressPacket {
    /// Wrap a list of addresses.
    pub fn new(addresses: Vec<NetworkAddress>) -> Self {
        Self { addresses }
    }
}

/// Payload of a `version` message.
#[derive(Debug, Clone)]
pub struct VersionMessage {
    /// Protocol version.
    pub version: i32,
    /// Our service flags.
    pub services: u64,
    /// Sender time (seconds since epoch).
    pub timestamp: i64,
    /// Address of the node receiving this message.
    pub receiver: NetworkAddress,
    /// Address of the node sending this message.
    pub sender: NetworkAddress,
    /// Random session nonce, used for self-connection detection.
    pub nonce: u64,
    /// User agent string.
    pub user_agent: String,
    /// Best block height known to the sender.
    pub start_height: i32,
}

impl VersionMessage {
    /// Build a version message for a session identified by `nonce`.
    pub fn new(receiver: NetworkAddress, sender: NetworkAddress, nonce: u64, user_agent: String) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: unix_time() as i64,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height: 0,
        }
    }
}

/// A framed P2P message.
#[derive(Debug, Clone)]
pub enum Message {
    /// `version` - handshake opener.
    Version(VersionMessage),
    /// `verack` - handshake acknowledgement.
    Verack,
    /// `getaddr` - request for known peer addresses.
    GetAddress,
    /// `addr` - peer address gossip.
    Address(AddressPacket),
    /// `ping` keepalive.
    Ping(u64),
    /// `pong` keepalive reply.
    Pong(u64),
    /// Any command this node does not interpret.
    Unknown {
        /// Raw command name from the frame header.
        command: String,
        /// Undecoded payload.
        payload: Bytes,
    },
}

impl Message {
    /// Wire command name.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::GetAddress => "getaddr",
            Message::Address(_) => "addr",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Encode the message payload (frame header excluded).
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => {
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                v.receiver.encode(&mut buf, false);
                v.sender.encode(&mut buf, false);
                buf.put_u64_le(v.nonce);
                put_var_str(&mut buf, &v.user_agent);
                buf.put_i32_le(v.start_height);
            }
            Message::Verack | Message::GetAddress => {}
            Message::Address(packet) => {
                put_var_int(&mut buf, packet.addresses.len() as u64);
                for addr in &packet.addresses {
                    addr.encode(&mut buf, true);
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => {
                buf.put_u64_le(*nonce);
            }
            Message::Unknown { payload, .. } => {
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decode a message payload for `command`.
    ///
    /// Unrecognized commands decode to [`Message::Unknown`]; trailing payload
    /// bytes on known commands are tolerated.
    pub fn decode(command: &str, mut payload: Bytes) -> NetworkResult<Message> {
        match command {
            "version" => {
                ensure(&payload, 20)?;
                let version = payload.get_i32_le();
                let services = payload.get_u64_le();
                let timestamp = payload.get_i64_le();
                let receiver = NetworkAddress::decode(&mut payload, false)?;
                let sender = NetworkAddress::decode(&mut payload, false)?;
                ensure(&payload, 8)?;
                let nonce = payload.get_u64_le();
                let user_agent = get_var_str(&mut payload)?;
                ensure(&payload, 4)?;
                let start_height = payload.get_i32_le();
                Ok(Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    receiver,
                    sender,
                    nonce,
                    user_agent,
                    start_height,
                }))
            }
            "verack" => Ok(Message::Verack),
            "getaddr" => Ok(Message::GetAddress),
            "addr" => {
                let count = get_var_int(&mut payload)? as usize;
                if count > MAX_ADDRESSES_PER_MESSAGE {
                    return Err(NetworkError::InvalidMessage(format!(
                        "addr carries {} entries, max {}",
                        count, MAX_ADDRESSES_PER_MESSAGE
                    )));
                }
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(NetworkAddress::decode(&mut payload, true)?);
                }
                Ok(Message::Address(AddressPacket::new(addresses)))
            }
            "ping" => {
                ensure(&payload, 8)?;
                Ok(Message::Ping(payload.get_u64_le()))
            }
            "pong" => {
                ensure(&payload, 8)?;
                Ok(Message::Pong(payload.get_u64_le()))
            }
            _ => Ok(Message::Unknown {
                command: command.to_string(),
                payload,
            }),
        }
    }
}

/// Current time as seconds since the epoch.
pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: [u8; 4], port: u16) -> NetworkAddress {
        NetworkAddress::from_socket_addr(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port),
            NODE_NETWORK,
        )
    }

    #[test]
    fn test_var_int_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = BytesMut::new();
            put_var_int(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(get_var_int(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_ipv4_mapping() {
        let a = addr([1, 2, 3, 4], 8333);
        assert!(a.is_ipv4());
        assert_eq!(&a.ip[12..], &[1, 2, 3, 4]);
        assert_eq!(a.ip_string(), "1.2.3.4");
        assert_eq!(a.socket_addr().to_string(), "1.2.3.4:8333");
    }

    #[test]
    fn test_endpoint_identity_ignores_metadata() {
        let mut a = addr([1, 2, 3, 4], 8333);
        let mut b = addr([1, 2, 3, 4], 8333);
        a.timestamp = Some(1);
        b.timestamp = Some(2);
        b.services = 0;
        assert_eq!(a.endpoint(), b.endpoint());
    }

    #[test]
    fn test_addr_message_roundtrip() {
        let packet = AddressPacket::new(vec![addr([1, 2, 3, 4], 8333), addr([5, 6, 7, 8], 18333)]);
        let msg = Message::Address(packet);
        let payload = msg.encode_payload();
        match Message::decode("addr", payload).unwrap() {
            Message::Address(decoded) => {
                assert_eq!(decoded.addresses.len(), 2);
                assert_eq!(decoded.addresses[1].port, 18333);
                assert_eq!(decoded.addresses[0].ip_string(), "1.2.3.4");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_addr_count_limit() {
        let mut buf = BytesMut::new();
        put_var_int(&mut buf, (MAX_ADDRESSES_PER_MESSAGE + 1) as u64);
        assert!(Message::decode("addr", buf.freeze()).is_err());
    }

    #[test]
    fn test_version_roundtrip() {
        let receiver = addr([10, 0, 0, 1], 8333);
        let sender = addr([10, 0, 0, 2], 8333);
        let msg = Message::Version(VersionMessage::new(
            receiver,
            sender,
            0xdead_beef,
            "/bitcoin-rust-node:0.1.0/".to_string(),
        ));
        let payload = msg.encode_payload();
        match Message::decode("version", payload).unwrap() {
            Message::Version(v) => {
                assert_eq!(v.version, PROTOCOL_VERSION);
                assert_eq!(v.nonce, 0xdead_beef);
                assert_eq!(v.user_agent, "/bitcoin-rust-node:0.1.0/");
                // Timestamps are not carried on version-message addresses.
                assert_eq!(v.receiver.timestamp, None);
                assert_eq!(v.receiver.endpoint(), receiver.endpoint());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_version_rejected() {
        let payload = Bytes::from_static(&[0u8; 10]);
        assert!(Message::decode("version", payload).is_err());
    }

    #[test]
    fn test_unknown_command_passthrough() {
        let payload = Bytes::from_static(b"\x01\x02\x03");
        match Message::decode("inv", payload.clone()).unwrap() {
            Message::Unknown { command, payload: p } => {
                assert_eq!(command, "inv");
                assert_eq!(p, payload);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
