//! TCP transport: dialing peers and accepting inbound connections.

use crate::channel::Channel;
use crate::handshake::Handshake;
use crate::{NetworkError, NetworkResult};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect timeout per resolved address.
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Network facility providing `dial` and `listen`.
pub struct Network {
    config: NetworkConfig,
    handshake: Arc<Handshake>,
}

impl Network {
    /// Create a network facility sharing `handshake` with its acceptors.
    pub fn new(config: NetworkConfig, handshake: Arc<Handshake>) -> Self {
        Self { config, handshake }
    }

    /// Resolve `host` and open a TCP connection to the first address that
    /// answers.
    pub async fn dial(&self, host: &str, port: u16) -> NetworkResult<(TcpStream, SocketAddr)> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| NetworkError::Resolve(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(NetworkError::Resolve(host.to_string()));
        }

        let mut last_error = None;
        for addr in addrs {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => {
                    debug!(host, %addr, "Connected");
                    return Ok((stream, addr));
                }
                Ok(Err(e)) => last_error = Some(NetworkError::Io(e)),
                Err(_) => last_error = Some(NetworkError::Timeout(format!("Connect to {}", addr))),
            }
        }
        Err(last_error.unwrap_or(NetworkError::ConnectionFailed(host.to_string())))
    }

    /// Bind the service port and return an acceptor for inbound peers.
    pub async fn listen(&self, port: u16) -> NetworkResult<Acceptor> {
        let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)).await?;
        Ok(Acceptor {
            listener,
            handshake: self.handshake.clone(),
        })
    }
}

/// Accepts inbound connections and handshakes them into channels.
pub struct Acceptor {
    listener: TcpListener,
    handshake: Arc<Handshake>,
}

impl Acceptor {
    /// Wait for the next inbound connection and complete its handshake.
    pub async fn accept(&self) -> NetworkResult<Channel> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(peer = %addr, "Inbound connection");
        self.handshake.inbound(stream, addr).await
    }

    /// The locally bound address; useful when listening on an ephemeral
    /// port.
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{connect, HandshakeConfig};

    #[tokio::test]
    async fn test_dial_unresolvable_host_errors() {
        let network = Network::new(NetworkConfig::default(), Arc::new(Handshake::default()));
        // RFC 2606 reserves .invalid; it never resolves.
        let result = network.dial("seed.invalid", 8333).await;
        assert!(matches!(result, Err(NetworkError::Resolve(_))));
    }

    #[tokio::test]
    async fn test_listen_connect_accept() {
        let handshake = Arc::new(Handshake::new(HandshakeConfig::default()));
        handshake.start().await.unwrap();
        let network = Arc::new(Network::new(NetworkConfig::default(), handshake.clone()));

        let acceptor = network.listen(0).await.unwrap();
        let port = acceptor.local_addr().unwrap().port();

        let accept_side = tokio::spawn(async move { acceptor.accept().await });

        // A second service plays the remote peer.
        let remote_handshake = Arc::new(Handshake::default());
        remote_handshake.start().await.unwrap();
        let remote_network = Network::new(NetworkConfig::default(), remote_handshake.clone());
        let outbound = connect(&remote_handshake, &remote_network, "127.0.0.1", port)
            .await
            .unwrap();

        let inbound = accept_side.await.unwrap().unwrap();
        assert_eq!(outbound.addr().port(), port);
        assert_ne!(inbound.id(), outbound.id());
    }
}
