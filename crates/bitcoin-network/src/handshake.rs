//! Version/verack handshake.
//!
//! Both directions exchange `version` and `verack` before a connection is
//! usable. The initiator sends its `version` first; the acceptor answers
//! with its own `version` followed by `verack`, and the initiator closes the
//! exchange with its `verack`. Only then is the [`Channel`] handed out.

use crate::channel::Channel;
use crate::codec::MessageCodec;
use crate::message::{Message, NetworkAddress, VersionMessage, NODE_NETWORK};
use crate::network::Network;
use crate::{NetworkError, NetworkResult};
use futures::{SinkExt, StreamExt};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// Handshake configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// User agent advertised in `version` messages.
    pub user_agent: String,
    /// Service flags advertised in `version` messages.
    pub services: u64,
    /// Best block height advertised in `version` messages.
    pub start_height: i32,
    /// Time budget for a complete version/verack exchange.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("/bitcoin-rust-node:{}/", env!("CARGO_PKG_VERSION")),
            services: NODE_NETWORK,
            start_height: 0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Handshake service.
///
/// Holds the per-session nonce used for self-connection detection. `start`
/// is idempotent and may be called from any startup path without
/// coordination; a connection racing ahead of it stamps the nonce itself.
pub struct Handshake {
    config: HandshakeConfig,
    /// Session nonce; zero until first stamped.
    nonce: AtomicU64,
}

impl Handshake {
    /// Create a handshake service.
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            nonce: AtomicU64::new(0),
        }
    }

    /// Start the service. Safe to call more than once; only the first
    /// stamping of the session nonce wins.
    pub async fn start(&self) -> NetworkResult<()> {
        self.session_nonce();
        Ok(())
    }

    fn session_nonce(&self) -> u64 {
        loop {
            let current = self.nonce.load(Ordering::SeqCst);
            if current != 0 {
                return current;
            }
            let candidate: u64 = rand::random();
            if candidate == 0 {
                continue;
            }
            if self
                .nonce
                .compare_exchange(0, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Run the initiator side of the handshake on a fresh outbound stream.
    pub(crate) async fn outbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> NetworkResult<Channel> {
        tokio::time::timeout(self.config.timeout, self.exchange(stream, addr, true))
            .await
            .map_err(|_| NetworkError::Timeout("Handshake timeout".into()))?
    }

    /// Run the acceptor side of the handshake on a fresh inbound stream.
    pub(crate) async fn inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> NetworkResult<Channel> {
        tokio::time::timeout(self.config.timeout, self.exchange(stream, addr, false))
            .await
            .map_err(|_| NetworkError::Timeout("Handshake timeout".into()))?
    }

    async fn exchange(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        initiate: bool,
    ) -> NetworkResult<Channel> {
        let nonce = self.session_nonce();
        let mut framed = Framed::new(stream, MessageCodec::new());

        let receiver = NetworkAddress::from_socket_addr(addr, 0);
        let sender = NetworkAddress::from_socket_addr(
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            self.config.services,
        );
        let mut version = VersionMessage::new(receiver, sender, nonce, self.config.user_agent.clone());
        version.services = self.config.services;
        version.start_height = self.config.start_height;

        let theirs = if initiate {
            framed.send(Message::Version(version)).await?;
            let theirs = expect_version(&mut framed).await?;
            if theirs.nonce == nonce {
                return Err(NetworkError::SelfConnection);
            }
            framed.send(Message::Verack).await?;
            expect_verack(&mut framed).await?;
            theirs
        } else {
            let theirs = expect_version(&mut framed).await?;
            if theirs.nonce == nonce {
                return Err(NetworkError::SelfConnection);
            }
            framed.send(Message::Version(version)).await?;
            framed.send(Message::Verack).await?;
            expect_verack(&mut framed).await?;
            theirs
        };

        debug!(
            peer = %addr,
            agent = %theirs.user_agent,
            version = theirs.version,
            height = theirs.start_height,
            "Handshake complete"
        );

        Ok(Channel::spawn(framed, addr))
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(HandshakeConfig::default())
    }
}

/// Resolve, connect and handshake in one step.
///
/// Combines DNS resolution, TCP connect and the version exchange; the
/// returned [`Channel`] is ready for application messages.
pub async fn connect(
    handshake: &Handshake,
    network: &Network,
    host: &str,
    port: u16,
) -> NetworkResult<Channel> {
    let (stream, addr) = network.dial(host, port).await?;
    handshake.outbound(stream, addr).await
}

async fn next_message(framed: &mut Framed<TcpStream, MessageCodec>) -> NetworkResult<Message> {
    match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e),
        None => Err(NetworkError::ConnectionClosed),
    }
}

async fn expect_version(
    framed: &mut Framed<TcpStream, MessageCodec>,
) -> NetworkResult<VersionMessage> {
    match next_message(framed).await? {
        Message::Version(version) => Ok(version),
        other => Err(NetworkError::HandshakeFailed(format!(
            "Expected version, got {}",
            other.command()
        ))),
    }
}

async fn expect_verack(framed: &mut Framed<TcpStream, MessageCodec>) -> NetworkResult<()> {
    match next_message(framed).await? {
        Message::Verack => Ok(()),
        other => Err(NetworkError::HandshakeFailed(format!(
            "Expected verack, got {}",
            other.command()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let handshake = Handshake::default();
        handshake.start().await.unwrap();
        let first = handshake.session_nonce();
        assert_ne!(first, 0);

        handshake.start().await.unwrap();
        assert_eq!(handshake.session_nonce(), first);
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let handshake_a = Handshake::default();
        let handshake_b = Handshake::default();
        handshake_a.start().await.unwrap();
        handshake_b.start().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_side = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handshake_b.inbound(stream, peer).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let outbound = handshake_a.outbound(stream, addr).await.unwrap();
        let inbound = accept_side.await.unwrap().unwrap();

        assert_eq!(outbound.addr(), addr);
        assert_ne!(inbound.id(), outbound.id());
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let handshake = std::sync::Arc::new(Handshake::default());
        handshake.start().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_handshake = handshake.clone();
        let accept_side = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            accept_handshake.inbound(stream, peer).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let outbound = handshake.outbound(stream, addr).await;

        // One side (or both) must notice the shared nonce.
        let inbound = accept_side.await.unwrap();
        assert!(outbound.is_err() || inbound.is_err());
    }
}
