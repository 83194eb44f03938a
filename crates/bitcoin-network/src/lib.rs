//! # bitcoin-network
//!
//! Peer discovery and outbound connection management for a Bitcoin-style
//! P2P daemon.
//!
//! This crate provides:
//! - Bitcoin wire messages and frame codec
//! - Version/verack handshake over TCP
//! - A persistent, capacity-bounded host directory
//! - DNS seeding for cold-start bootstrap
//! - The protocol manager maintaining a target population of outbound
//!   peers and accepting inbound ones

mod channel;
mod codec;
pub mod discovery;
mod error;
mod handshake;
mod hosts;
mod message;
mod network;
mod protocol;

pub use channel::Channel;
pub use codec::MessageCodec;
pub use discovery::{SeedLoader, DNS_SEEDS};
pub use error::{NetworkError, NetworkResult};
pub use handshake::{connect, Handshake, HandshakeConfig};
pub use hosts::{Hosts, DEFAULT_HOST_CAPACITY};
pub use message::{
    AddressPacket, Message, NetworkAddress, VersionMessage, MAX_ADDRESSES_PER_MESSAGE,
    NODE_NETWORK,
};
pub use network::{Acceptor, Network, NetworkConfig};
pub use protocol::{Protocol, ProtocolConfig};

/// Default P2P service port.
pub const DEFAULT_PORT: u16 = 8333;

/// Mainnet network magic.
pub const MAINNET_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Maximum message payload size.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // 4 MB

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: i32 = 60002;
