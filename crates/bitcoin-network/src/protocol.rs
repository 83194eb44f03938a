//! Protocol manager: peer discovery and connection maintenance.
//!
//! One long-lived actor owns the outbound and accepted connection sets.
//! Every mutation flows through its mailbox, so the sets need no locks and
//! observe a consistent order of events: connect results, accepted peers,
//! channel stops and public queries are all serialized here.
//!
//! Steady-state data flow:
//!
//! ```text
//! Hosts --fetch_address--> outbound attempts --handshake--> Channel
//!   ^                                                          |
//!   +------------------store <----- addr gossip <--------------+
//! ```

use crate::channel::Channel;
use crate::discovery::{SeedLoader, DNS_SEEDS};
use crate::handshake::{connect, Handshake};
use crate::hosts::Hosts;
use crate::message::{Message, NetworkAddress};
use crate::network::Network;
use crate::{NetworkError, NetworkResult, DEFAULT_PORT};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Delay before a replacement attempt after a duplicate address or a failed
/// connect. Bounds the retry rate when the host directory is small.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Protocol manager configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Path of the persisted host directory.
    pub hosts_file: PathBuf,
    /// Outbound connection target.
    pub max_outbound: usize,
    /// Service port, used for listening and for the DNS seeds.
    pub port: u16,
    /// DNS seed hostnames for cold-start bootstrap.
    pub seeds: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hosts_file: PathBuf::from("hosts"),
            max_outbound: 8,
            port: DEFAULT_PORT,
            seeds: DNS_SEEDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

enum Command {
    ConnectionCount(oneshot::Sender<usize>),
    SubscribeChannel(oneshot::Sender<Channel>),
}

enum Event {
    Connected {
        address: NetworkAddress,
        result: NetworkResult<Channel>,
    },
    Accepted(Channel),
    Stopped(u64),
    Retry,
}

/// Handle to the protocol manager.
///
/// `start` boots the manager; afterwards the handle answers queries and
/// registers channel subscribers. Dropping every handle shuts the manager
/// down.
pub struct Protocol {
    config: ProtocolConfig,
    hosts: Arc<Hosts>,
    handshake: Arc<Handshake>,
    network: Arc<Network>,
    commands: mpsc::Sender<Command>,
    pending_commands: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl Protocol {
    /// Create a protocol manager over shared services.
    pub fn new(
        config: ProtocolConfig,
        hosts: Arc<Hosts>,
        handshake: Arc<Handshake>,
        network: Arc<Network>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        Self {
            config,
            hosts,
            handshake,
            network,
            commands,
            pending_commands: Mutex::new(Some(command_rx)),
        }
    }

    /// Bootstrap the host directory and start the handshake service, in
    /// parallel; on success transition into the running state (outbound
    /// fill plus inbound listener).
    ///
    /// Returns exactly once: `Ok` after both paths succeed, or the first
    /// failure from either path. No outbound attempt is made before this
    /// resolves.
    pub async fn start(&self) -> NetworkResult<()> {
        let commands = self
            .pending_commands
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyStarted)?;

        if let Err(e) = tokio::try_join!(self.bootstrap(), self.start_handshake_service()) {
            // Leave the manager startable again once the cause is fixed.
            *self.pending_commands.lock() = Some(commands);
            return Err(e);
        }

        Runner::spawn(
            self.config.clone(),
            self.hosts.clone(),
            self.handshake.clone(),
            self.network.clone(),
            commands,
        );
        Ok(())
    }

    /// Persist the host directory, returning the save result verbatim.
    ///
    /// Channels are not torn down here; the transport closes them when the
    /// process exits.
    pub async fn stop(&self) -> NetworkResult<()> {
        if let Err(e) = self.hosts.save(&self.config.hosts_file).await {
            error!(
                file = %self.config.hosts_file.display(),
                error = %e,
                "Failed to save hosts"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Current size of the outbound set, observed as a consistent snapshot
    /// on the manager's event order.
    pub async fn connection_count(&self) -> NetworkResult<usize> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::ConnectionCount(reply))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        answer.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Register for the next installed channel, outbound or inbound.
    ///
    /// Each subscription is delivered at most once and consumed; re-subscribe
    /// for subsequent channels.
    pub async fn subscribe_channel(&self) -> NetworkResult<oneshot::Receiver<Channel>> {
        let (reply, subscription) = oneshot::channel();
        self.commands
            .send(Command::SubscribeChannel(reply))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        Ok(subscription)
    }

    async fn bootstrap(&self) -> NetworkResult<()> {
        if let Err(e) = self.hosts.load(&self.config.hosts_file).await {
            error!(error = %e, "Could not load hosts file");
            return Err(e);
        }

        let known = self.hosts.count();
        if known > 0 {
            debug!(known, "Host directory populated, skipping DNS seeds");
            return Ok(());
        }

        let loader = SeedLoader::new(
            self.hosts.clone(),
            self.handshake.clone(),
            self.network.clone(),
            self.config.seeds.clone(),
            self.config.port,
        );
        loader.run().await.map_err(|e| {
            error!(error = %e, "Failed to bootstrap");
            e
        })
    }

    async fn start_handshake_service(&self) -> NetworkResult<()> {
        self.handshake.start().await.map_err(|e| {
            error!(error = %e, "Failed to start handshake service");
            e
        })
    }
}

/// An outbound peer: the sampled address and its live channel.
struct ConnectionInfo {
    address: NetworkAddress,
    channel: Channel,
}

/// Insertion-ordered outbound connections, deduplicated on `(ip, port)`.
#[derive(Default)]
struct OutboundSet {
    entries: Vec<ConnectionInfo>,
}

impl OutboundSet {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, address: &NetworkAddress) -> bool {
        self.entries
            .iter()
            .any(|c| c.address.endpoint() == address.endpoint())
    }

    fn insert(&mut self, address: NetworkAddress, channel: Channel) {
        self.entries.push(ConnectionInfo { address, channel });
    }

    fn remove(&mut self, channel_id: u64) -> Option<NetworkAddress> {
        let at = self
            .entries
            .iter()
            .position(|c| c.channel.id() == channel_id)?;
        Some(self.entries.remove(at).address)
    }
}

/// The actor driving the manager. Owns all mutable state.
struct Runner {
    config: ProtocolConfig,
    hosts: Arc<Hosts>,
    handshake: Arc<Handshake>,
    network: Arc<Network>,
    outbound: OutboundSet,
    accepted: Vec<Channel>,
    subscribers: Vec<oneshot::Sender<Channel>>,
    /// Connect attempts in flight; counted against `max_outbound` so
    /// concurrent refills never overshoot the target.
    pending_connects: usize,
    events: mpsc::Sender<Event>,
}

impl Runner {
    fn spawn(
        config: ProtocolConfig,
        hosts: Arc<Hosts>,
        handshake: Arc<Handshake>,
        network: Arc<Network>,
        commands: mpsc::Receiver<Command>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let runner = Self {
            config,
            hosts,
            handshake,
            network,
            outbound: OutboundSet::default(),
            accepted: Vec::new(),
            subscribers: Vec::new(),
            pending_connects: 0,
            events: events_tx,
        };
        tokio::spawn(runner.run(commands, events_rx));
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        self.spawn_listener();
        self.try_connect();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every public handle is gone.
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        debug!("Protocol manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectionCount(reply) => {
                let _ = reply.send(self.outbound.len());
            }
            Command::SubscribeChannel(reply) => self.subscribers.push(reply),
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { address, result } => self.handle_connect(address, result).await,
            Event::Accepted(channel) => self.handle_accept(channel).await,
            Event::Stopped(channel_id) => self.channel_stopped(channel_id),
            Event::Retry => self.try_connect(),
        }
    }

    /// Issue one address fetch per free outbound slot.
    fn try_connect(&mut self) {
        let active = self.outbound.len() + self.pending_connects;
        if active >= self.config.max_outbound {
            return;
        }
        for _ in active..self.config.max_outbound {
            match self.hosts.fetch_address() {
                Ok(address) => self.attempt_connect(address),
                Err(e) => warn!(error = %e, "Problem fetching random address"),
            }
        }
    }

    fn attempt_connect(&mut self, address: NetworkAddress) {
        if self.outbound.contains(&address) {
            info!(peer = %address, "Already connected");
            // Retry another connection.
            self.schedule_retry();
            return;
        }

        info!(peer = %address, "Trying peer");
        self.pending_connects += 1;
        let handshake = self.handshake.clone();
        let network = self.network.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connect(&handshake, &network, &address.ip_string(), address.port).await;
            let _ = events.send(Event::Connected { address, result }).await;
        });
    }

    async fn handle_connect(&mut self, address: NetworkAddress, result: NetworkResult<Channel>) {
        self.pending_connects = self.pending_connects.saturating_sub(1);
        match result {
            Ok(channel) => {
                if self.outbound.contains(&address) {
                    // Two in-flight attempts raced to the same peer; keep
                    // the first, replace this one elsewhere.
                    debug!(peer = %address, "Duplicate connection discarded");
                    self.schedule_retry();
                    return;
                }
                self.outbound.insert(address, channel.clone());
                info!(
                    peer = %address,
                    connections = self.outbound.len(),
                    "Connected to peer"
                );
                self.setup_new_channel(channel).await;
            }
            Err(e) => {
                info!(peer = %address, error = %e, "Unable to connect");
                self.schedule_retry();
            }
        }
    }

    async fn handle_accept(&mut self, channel: Channel) {
        self.accepted.push(channel.clone());
        info!(
            peer = %channel.addr(),
            accepted = self.accepted.len(),
            "Accepted connection"
        );
        self.setup_new_channel(channel).await;
    }

    /// Remove a dead channel from whichever set holds it. A lost outbound
    /// slot is refilled immediately.
    fn channel_stopped(&mut self, channel_id: u64) {
        if let Some(address) = self.outbound.remove(channel_id) {
            info!(
                peer = %address,
                connections = self.outbound.len(),
                "Outbound channel stopped"
            );
            self.try_connect();
        }
        self.accepted.retain(|c| c.id() != channel_id);
    }

    /// Hook a freshly installed channel into the manager: stop watch,
    /// address gossip, an initial `getaddr`, and subscriber relay.
    async fn setup_new_channel(&mut self, channel: Channel) {
        let events = self.events.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            watched.stopped().await;
            let _ = events.send(Event::Stopped(watched.id())).await;
        });

        let hosts = self.hosts.clone();
        let mut addresses = channel.subscribe_address();
        tokio::spawn(async move {
            loop {
                match addresses.recv().await {
                    Ok(packet) => {
                        info!("Storing addresses.");
                        for address in packet.addresses {
                            hosts.store(address);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Address gossip lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Err(e) = channel.send(Message::GetAddress).await {
            warn!(peer = %channel.addr(), error = %e, "Sending error");
        }

        // One-shot relay; the registry drains on every new channel.
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.send(channel.clone());
        }
    }

    fn schedule_retry(&self) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            let _ = events.send(Event::Retry).await;
        });
    }

    fn spawn_listener(&self) {
        let network = self.network.clone();
        let port = self.config.port;
        let events = self.events.clone();
        tokio::spawn(async move {
            let acceptor = match network.listen(port).await {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!(port, error = %e, "Error while listening");
                    return;
                }
            };
            if let Ok(local) = acceptor.local_addr() {
                info!(addr = %local, "Listening for inbound peers");
            }
            // Re-arm after every admission; a failed handshake or accept
            // never stops the listener.
            loop {
                match acceptor.accept().await {
                    Ok(channel) => {
                        if events.send(Event::Accepted(channel)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Problem accepting connection"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageCodec;
    use crate::message::NODE_NETWORK;
    use futures::StreamExt;
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    fn test_address(last_octet: u8, port: u16) -> NetworkAddress {
        let addr: SocketAddr = format!("10.0.0.{}:{}", last_octet, port).parse().unwrap();
        NetworkAddress::from_socket_addr(addr, NODE_NETWORK)
    }

    async fn dummy_channel() -> Channel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // The detached task keeps the remote end alive for the test.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, MessageCodec::new());
            while framed.next().await.is_some() {}
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        Channel::spawn(Framed::new(stream, MessageCodec::new()), addr)
    }

    #[tokio::test]
    async fn test_outbound_set_dedupes_on_endpoint() {
        let mut set = OutboundSet::default();
        let address = test_address(1, 8333);
        set.insert(address, dummy_channel().await);

        assert_eq!(set.len(), 1);
        assert!(set.contains(&address));

        // Metadata differences do not make a new peer.
        let mut same_peer = test_address(1, 8333);
        same_peer.services = 0;
        same_peer.timestamp = Some(7);
        assert!(set.contains(&same_peer));

        // A different port does.
        assert!(!set.contains(&test_address(1, 18333)));
    }

    #[tokio::test]
    async fn test_outbound_set_removes_by_channel_id() {
        let mut set = OutboundSet::default();
        let first = dummy_channel().await;
        let second = dummy_channel().await;
        set.insert(test_address(1, 8333), first.clone());
        set.insert(test_address(2, 8333), second.clone());

        let removed = set.remove(first.id()).unwrap();
        assert_eq!(removed.endpoint(), test_address(1, 8333).endpoint());
        assert_eq!(set.len(), 1);
        assert!(set.remove(first.id()).is_none());
        assert!(set.remove(second.id()).is_some());
    }

    #[test]
    fn test_default_config() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_outbound, 8);
        assert_eq!(config.port, 8333);
        assert_eq!(config.hosts_file, PathBuf::from("hosts"));
        assert_eq!(config.seeds.len(), 4);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let hosts = Arc::new(Hosts::new());
        hosts.store(test_address(1, 8333));
        let handshake = Arc::new(Handshake::default());
        let network = Arc::new(Network::new(Default::default(), handshake.clone()));

        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            hosts_file: dir.path().join("hosts"),
            max_outbound: 0,
            port: 0,
            seeds: Vec::new(),
        };
        let protocol = Protocol::new(config, hosts, handshake, network);

        protocol.start().await.unwrap();
        assert!(matches!(
            protocol.start().await,
            Err(NetworkError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_file = dir.path().join("hosts");
        tokio::fs::write(&hosts_file, b"corrupt").await.unwrap();

        let hosts = Arc::new(Hosts::new());
        let handshake = Arc::new(Handshake::default());
        let network = Arc::new(Network::new(Default::default(), handshake.clone()));
        let config = ProtocolConfig {
            hosts_file: hosts_file.clone(),
            max_outbound: 0,
            port: 0,
            seeds: Vec::new(),
        };
        let protocol = Protocol::new(config, hosts.clone(), handshake, network);

        assert!(matches!(
            protocol.start().await,
            Err(NetworkError::HostsFile(_))
        ));

        // Replace the corrupt file and try again.
        hosts.store(test_address(1, 8333));
        tokio::fs::remove_file(&hosts_file).await.unwrap();
        protocol.start().await.unwrap();
        assert_eq!(protocol.connection_count().await.unwrap(), 0);
    }
}
