// Parfetch Parallel Download Accelerator for S3 Compatible Object Storage
// Copyright 2025 Parfetch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide DNS record cache with TTL and round-robin address selection

use crate::s3::error::{Error, NetworkErrorKind, TimeoutKind};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Upper bound on cached records per hostname.
pub const MAX_RECORDS_PER_HOST: usize = 1000;

/// Record TTLs are clamped into this window. The floor protects against
/// flapping authoritative answers, the ceiling keeps failover times bounded.
pub const MIN_RECORD_TTL: Duration = Duration::from_secs(5);
pub const MAX_RECORD_TTL: Duration = Duration::from_secs(30);

// The system resolver does not report TTLs, so fresh records get the ceiling.
const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30);

/// Clamps an advertised record TTL into `[MIN_RECORD_TTL, MAX_RECORD_TTL]`.
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_RECORD_TTL, MAX_RECORD_TTL)
}

/// One cached address record.
#[derive(Clone, Debug)]
pub struct DnsRecord {
    pub addr: IpAddr,
    pub expires_at: Instant,
}

impl DnsRecord {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Per-hostname record cache shared by every download in the process.
///
/// Lookups consume cached records round-robin, one per call; a resolve that
/// yields multiple records retains the surplus for subsequent lookups. IPv4
/// records are preferred when the resolver returns both families.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: DashMap<String, Mutex<VecDeque<DnsRecord>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache instance.
    pub fn shared() -> &'static DnsCache {
        static SHARED: OnceLock<DnsCache> = OnceLock::new();
        SHARED.get_or_init(DnsCache::new)
    }

    /// Returns one address for `hostname`, consulting the cache first.
    ///
    /// `timeout` bounds a fresh resolution; `Duration::ZERO` disables the
    /// deadline. Cancellation is propagated by dropping the returned future.
    pub async fn lookup(&self, hostname: &str, timeout: Duration) -> Result<IpAddr, Error> {
        let key = hostname.to_lowercase();
        if let Some(addr) = self.pop_fresh(&key) {
            return Ok(addr);
        }

        let records = self.resolve(&key, timeout).await?;
        let mut iter = records.into_iter();
        let first = iter
            .next()
            .ok_or(Error::Network(NetworkErrorKind::NoRecords))?;

        let surplus: VecDeque<DnsRecord> = iter.take(MAX_RECORDS_PER_HOST).collect();
        if !surplus.is_empty() {
            self.entries.insert(key, Mutex::new(surplus));
        }
        Ok(first.addr)
    }

    /// Pops the front record for `key`, discarding expired entries.
    fn pop_fresh(&self, key: &str) -> Option<IpAddr> {
        let entry = self.entries.get(key)?;
        let mut queue = entry.lock().expect("dns cache lock poisoned");
        let now = Instant::now();
        while let Some(record) = queue.pop_front() {
            if record.is_fresh(now) {
                return Some(record.addr);
            }
        }
        None
    }

    async fn resolve(&self, hostname: &str, timeout: Duration) -> Result<Vec<DnsRecord>, Error> {
        let lookup = tokio::net::lookup_host((hostname, 0u16));
        let addrs: Vec<SocketAddr> = if timeout.is_zero() {
            lookup.await
        } else {
            tokio::time::timeout(timeout, lookup)
                .await
                .map_err(|_| Error::Timeout(TimeoutKind::Resolve))?
        }
        .map_err(|e| {
            log::debug!("resolution of {hostname} failed: {e}");
            Error::Network(NetworkErrorKind::NameNotFound)
        })?
        .collect();

        if addrs.is_empty() {
            return Err(Error::Network(NetworkErrorKind::NoRecords));
        }

        let expires_at = Instant::now() + clamp_ttl(DEFAULT_RECORD_TTL);
        // v4 before v6 keeps the default selection policy on dual-stack hosts
        let (v4, v6): (Vec<&SocketAddr>, Vec<&SocketAddr>) =
            addrs.iter().partition(|a| a.is_ipv4());
        Ok(v4
            .into_iter()
            .chain(v6)
            .map(|a| DnsRecord {
                addr: a.ip(),
                expires_at,
            })
            .collect())
    }

    /// Seeds records for a hostname. Records past `MAX_RECORDS_PER_HOST` are
    /// dropped.
    pub fn insert(&self, hostname: &str, records: impl IntoIterator<Item = DnsRecord>) {
        let queue: VecDeque<DnsRecord> =
            records.into_iter().take(MAX_RECORDS_PER_HOST).collect();
        self.entries
            .insert(hostname.to_lowercase(), Mutex::new(queue));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Drops every cached record in the process-wide cache.
pub fn clear_dns_cache() {
    DnsCache::shared().clear();
}

/// Adapter that routes a `reqwest` client's hostname resolution through the
/// shared cache.
#[derive(Debug, Clone)]
pub struct CachingResolver {
    cache: &'static DnsCache,
    timeout: Duration,
}

impl CachingResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: DnsCache::shared(),
            timeout,
        }
    }
}

impl reqwest::dns::Resolve for CachingResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let cache = self.cache;
        let timeout = self.timeout;
        Box::pin(async move {
            match cache.lookup(name.as_str(), timeout).await {
                Ok(addr) => {
                    // the connector substitutes the real port
                    let addrs: reqwest::dns::Addrs =
                        Box::new(std::iter::once(SocketAddr::new(addr, 0)));
                    Ok(addrs)
                }
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        })
    }
}
