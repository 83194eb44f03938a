//! Host directory: the persistent set of known peer addresses.
//!
//! Addresses arrive from DNS seeding and `addr` gossip, are sampled at
//! random to pick outbound connection targets, and are persisted across
//! restarts so a warm node never has to touch the DNS seeds again.

use crate::{NetworkAddress, NetworkError, NetworkResult};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use tracing::debug;

/// Default capacity of the in-memory address pool.
pub const DEFAULT_HOST_CAPACITY: usize = 1000;

struct HostPool {
    /// Insertion-ordered entries; oldest at the front.
    entries: VecDeque<NetworkAddress>,
    /// `(ip, port)` index for duplicate detection.
    index: HashSet<([u8; 16], u16)>,
}

/// Capacity-bounded directory of known peers.
///
/// All operations serialize on an internal lock, so callers may pipeline
/// `store` and `fetch_address` freely from concurrent tasks.
pub struct Hosts {
    capacity: usize,
    pool: Mutex<HostPool>,
}

impl Hosts {
    /// Create an empty directory with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HOST_CAPACITY)
    }

    /// Create an empty directory holding at most `capacity` addresses.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            pool: Mutex::new(HostPool {
                entries: VecDeque::with_capacity(capacity),
                index: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Load persisted addresses from `path`.
    ///
    /// A missing file is an empty directory, not an error; a file that
    /// exists but cannot be parsed is. Returns the number of loaded entries.
    pub async fn load(&self, path: &Path) -> NetworkResult<usize> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No hosts file, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(NetworkError::Io(e)),
        };

        let addresses: Vec<NetworkAddress> = serde_json::from_slice(&raw)
            .map_err(|e| NetworkError::HostsFile(e.to_string()))?;

        let mut pool = self.pool.lock();
        for address in addresses {
            Self::insert(&mut pool, self.capacity, address);
        }
        Ok(pool.entries.len())
    }

    /// Persist the current addresses to `path`.
    ///
    /// Writes a temp file and renames it into place so a crash mid-write
    /// never corrupts the previous file.
    pub async fn save(&self, path: &Path) -> NetworkResult<()> {
        let snapshot: Vec<NetworkAddress> = {
            let pool = self.pool.lock();
            pool.entries.iter().copied().collect()
        };

        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| NetworkError::HostsFile(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Number of known addresses.
    pub fn count(&self) -> usize {
        self.pool.lock().entries.len()
    }

    /// Sample a uniformly random address.
    ///
    /// Repeated calls may return the same address; the caller is expected
    /// to handle duplicates.
    pub fn fetch_address(&self) -> NetworkResult<NetworkAddress> {
        let pool = self.pool.lock();
        if pool.entries.is_empty() {
            return Err(NetworkError::AddressPoolEmpty);
        }
        let at = rand::thread_rng().gen_range(0..pool.entries.len());
        Ok(pool.entries[at])
    }

    /// Insert a new address or refresh the metadata of a known one.
    pub fn store(&self, address: NetworkAddress) {
        let mut pool = self.pool.lock();
        Self::insert(&mut pool, self.capacity, address);
    }

    fn insert(pool: &mut HostPool, capacity: usize, address: NetworkAddress) {
        if capacity == 0 {
            return;
        }
        let key = address.endpoint();
        if pool.index.contains(&key) {
            if let Some(existing) = pool.entries.iter_mut().find(|a| a.endpoint() == key) {
                existing.services = address.services;
                if address.timestamp > existing.timestamp {
                    existing.timestamp = address.timestamp;
                }
            }
            return;
        }
        if pool.entries.len() == capacity {
            if let Some(evicted) = pool.entries.pop_front() {
                pool.index.remove(&evicted.endpoint());
            }
        }
        pool.index.insert(key);
        pool.entries.push_back(address);
    }
}

impl Default for Hosts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NODE_NETWORK;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(last_octet: u8, port: u16) -> NetworkAddress {
        NetworkAddress::from_socket_addr(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port),
            NODE_NETWORK,
        )
    }

    #[test]
    fn test_store_and_count() {
        let hosts = Hosts::new();
        hosts.store(addr(1, 8333));
        hosts.store(addr(2, 8333));
        assert_eq!(hosts.count(), 2);
    }

    #[test]
    fn test_store_dedupes_on_endpoint() {
        let hosts = Hosts::new();
        let mut first = addr(1, 8333);
        first.timestamp = Some(100);
        let mut second = addr(1, 8333);
        second.timestamp = Some(200);

        hosts.store(first);
        hosts.store(second);
        assert_eq!(hosts.count(), 1);

        // Same IP on a different port is a distinct peer.
        hosts.store(addr(1, 18333));
        assert_eq!(hosts.count(), 2);

        let fetched = hosts.fetch_address().unwrap();
        if fetched.port == 8333 {
            assert_eq!(fetched.timestamp, Some(200));
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let hosts = Hosts::with_capacity(3);
        for i in 1..=4 {
            hosts.store(addr(i, 8333));
        }
        assert_eq!(hosts.count(), 3);

        // The first entry is gone; the newest three remain.
        for _ in 0..64 {
            let fetched = hosts.fetch_address().unwrap();
            assert_ne!(fetched.ip[15], 1);
        }
    }

    #[test]
    fn test_fetch_empty_pool_errors() {
        let hosts = Hosts::new();
        assert!(matches!(
            hosts.fetch_address(),
            Err(NetworkError::AddressPoolEmpty)
        ));
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        let hosts = Hosts::new();
        hosts.store(addr(1, 8333));
        hosts.store(addr(2, 8333));
        hosts.save(&path).await.unwrap();

        let reloaded = Hosts::new();
        assert_eq!(reloaded.load(&path).await.unwrap(), 2);
        assert_eq!(reloaded.count(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = Hosts::new();
        assert_eq!(hosts.load(&dir.path().join("hosts")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let hosts = Hosts::new();
        assert!(matches!(
            hosts.load(&path).await,
            Err(NetworkError::HostsFile(_))
        ));
    }
}
