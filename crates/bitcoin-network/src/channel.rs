//! Peer channel: a handle over one handshake-completed connection.

use crate::codec::MessageCodec;
use crate::message::{AddressPacket, Message};
use crate::{NetworkError, NetworkResult};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Outgoing message queue depth per channel.
const SEND_QUEUE_DEPTH: usize = 64;

/// Buffered `addr` packets per subscriber before old ones are dropped.
const ADDRESS_QUEUE_DEPTH: usize = 32;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct ChannelInner {
    id: u64,
    addr: SocketAddr,
    outgoing: mpsc::Sender<Message>,
    addresses: broadcast::Sender<AddressPacket>,
    stopped: watch::Receiver<bool>,
}

/// A live connection to a peer, produced by the handshake.
///
/// The handle is cheap to clone and shared between the connection's owner
/// and its subscribers. It dies with the underlying socket: once the socket
/// closes, every [`Channel::stopped`] waiter resolves exactly once.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Take ownership of a framed stream and drive it from a background task.
    pub(crate) fn spawn(framed: Framed<TcpStream, MessageCodec>, addr: SocketAddr) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (address_tx, _) = broadcast::channel(ADDRESS_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(run_channel(
            id,
            addr,
            framed,
            outgoing_rx,
            address_tx.clone(),
            stop_tx,
        ));

        Self {
            inner: Arc::new(ChannelInner {
                id,
                addr,
                outgoing: outgoing_tx,
                addresses: address_tx,
                stopped: stop_rx,
            }),
        }
    }

    /// Unique channel id for this process lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote socket address.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Queue a message for delivery to the peer.
    pub async fn send(&self, message: Message) -> NetworkResult<()> {
        self.inner
            .outgoing
            .send(message)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Subscribe to `addr` messages received from this peer.
    pub fn subscribe_address(&self) -> broadcast::Receiver<AddressPacket> {
        self.inner.addresses.subscribe()
    }

    /// Resolve once the connection has died.
    pub async fn stopped(&self) {
        let mut stopped = self.inner.stopped.clone();
        while !*stopped.borrow() {
            // A dropped sender means the channel task is gone, which is a
            // stop as well.
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Channel {}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .finish()
    }
}

async fn run_channel(
    id: u64,
    addr: SocketAddr,
    framed: Framed<TcpStream, MessageCodec>,
    mut outgoing: mpsc::Receiver<Message>,
    addresses: broadcast::Sender<AddressPacket>,
    stop: watch::Sender<bool>,
) {
    let (mut sink, mut stream) = framed.split();

    loop {
        tokio::select! {
            queued = outgoing.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!(channel = id, peer = %addr, error = %e, "Send error");
                            break;
                        }
                    }
                    // Every handle dropped; tear the connection down.
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Address(packet))) => {
                        debug!(channel = id, peer = %addr, count = packet.addresses.len(), "addr received");
                        // No subscribers is fine; gossip is best-effort.
                        let _ = addresses.send(packet);
                    }
                    Some(Ok(Message::Ping(nonce))) => {
                        if let Err(e) = sink.send(Message::Pong(nonce)).await {
                            warn!(channel = id, peer = %addr, error = %e, "Send error");
                            break;
                        }
                    }
                    Some(Ok(message)) => {
                        debug!(channel = id, peer = %addr, command = message.command(), "Ignoring message");
                    }
                    Some(Err(e)) => {
                        warn!(channel = id, peer = %addr, error = %e, "Receive error");
                        break;
                    }
                    None => {
                        debug!(channel = id, peer = %addr, "Connection closed by peer");
                        break;
                    }
                }
            }
        }
    }

    let _ = stop.send(true);
}
