//! DNS seeding: bootstrap the host directory from zero knowledge.
//!
//! Each well-known seed hostname is connected and asked for addresses in
//! parallel. The first seed to answer completes the bootstrap; slower seeds
//! keep enriching the host directory in the background. Seeding fails only
//! when every seed path fails.

use crate::handshake::{connect, Handshake};
use crate::hosts::Hosts;
use crate::message::{AddressPacket, Message};
use crate::network::Network;
use crate::{NetworkError, NetworkResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Well-known mainnet DNS seeds.
pub const DNS_SEEDS: &[&str] = &[
    "bitseed.xf2.org",
    "dnsseed.bluematt.me",
    "seed.bitcoin.sipa.be",
    "dnsseed.bitcoin.dashjr.org",
];

/// How long to wait for a seed's `addr` response after `getaddr`.
const SEED_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// One-shot loader that fills the host directory from the DNS seeds.
pub struct SeedLoader {
    hosts: Arc<Hosts>,
    handshake: Arc<Handshake>,
    network: Arc<Network>,
    seeds: Vec<String>,
    port: u16,
}

impl SeedLoader {
    /// Create a loader for the given seed hostnames and service port.
    pub fn new(
        hosts: Arc<Hosts>,
        handshake: Arc<Handshake>,
        network: Arc<Network>,
        seeds: Vec<String>,
        port: u16,
    ) -> Self {
        Self {
            hosts,
            handshake,
            network,
            seeds,
            port,
        }
    }

    /// Query every seed concurrently.
    ///
    /// Resolves `Ok` on the first seed that delivers addresses; resolves
    /// `Err` with the last failure once every path has failed. Either way
    /// the result is delivered exactly once. Seeds that answer after the
    /// winner still store their addresses.
    pub async fn run(&self) -> NetworkResult<()> {
        if self.seeds.is_empty() {
            return Err(NetworkError::SeedsExhausted);
        }

        let (results_tx, mut results) = mpsc::channel(self.seeds.len());
        for hostname in &self.seeds {
            let hostname = hostname.clone();
            let hosts = self.hosts.clone();
            let handshake = self.handshake.clone();
            let network = self.network.clone();
            let port = self.port;
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let result = query_seed(hosts, handshake, network, &hostname, port).await;
                // The loader may already have a winner; addresses were
                // stored inside query_seed, so a dropped receiver loses
                // nothing.
                let _ = results_tx.send((hostname, result)).await;
            });
        }
        drop(results_tx);

        let mut last_error = NetworkError::SeedsExhausted;
        while let Some((hostname, result)) = results.recv().await {
            match result {
                Ok(count) => {
                    info!(seed = %hostname, count, "Seeded address pool");
                    return Ok(());
                }
                Err(e) => {
                    warn!(seed = %hostname, error = %e, "Seed path failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Connect to one seed, request addresses and store the first batch.
async fn query_seed(
    hosts: Arc<Hosts>,
    handshake: Arc<Handshake>,
    network: Arc<Network>,
    hostname: &str,
    port: u16,
) -> NetworkResult<usize> {
    let channel = connect(&handshake, &network, hostname, port).await?;
    let mut addresses = channel.subscribe_address();
    channel.send(Message::GetAddress).await?;

    let packet = tokio::time::timeout(SEED_RESPONSE_TIMEOUT, next_packet(&mut addresses))
        .await
        .map_err(|_| NetworkError::Timeout(format!("addr response from {}", hostname)))??;

    info!("Storing seeded addresses.");
    for address in &packet.addresses {
        hosts.store(*address);
    }
    Ok(packet.addresses.len())
}

async fn next_packet(
    addresses: &mut broadcast::Receiver<AddressPacket>,
) -> NetworkResult<AddressPacket> {
    loop {
        match addresses.recv().await {
            Ok(packet) => return Ok(packet),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(NetworkError::ConnectionClosed),
        }
    }
}
