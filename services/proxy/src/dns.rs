// Short-TTL DNS cache so backend rotations are picked up quickly.
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Both positive and negative answers are held for this long. Kept short on
/// purpose: broker sets rotate and stale answers would mis-route splices.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver behind a bounded-TTL cache. One instance is shared by the
/// whole worker group.
pub struct CachingResolver {
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

#[derive(Clone)]
struct CacheEntry {
    // Negative answers cache the error message.
    result: Result<Vec<IpAddr>, String>,
    expires_at: Instant,
}

impl CachingResolver {
    pub fn new() -> Self {
        Self::with_ttl(DNS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    fn cached(&self, host: &str) -> Option<CacheEntry> {
        let entry = self.cache.get(host)?;
        if entry.expires_at > Instant::now() {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn store(&self, host: &str, result: Result<Vec<IpAddr>, String>) {
        self.cache.insert(
            host.to_string(),
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for CachingResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // Literal addresses never touch the cache or the system resolver.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(entry) = self.cached(host) {
            return entry
                .result
                .map_err(|message| io::Error::new(io::ErrorKind::NotFound, message));
        }
        match tokio::net::lookup_host((host, 0u16)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
                ips.dedup();
                if ips.is_empty() {
                    let message = format!("no addresses for {host}");
                    self.store(host, Err(message.clone()));
                    return Err(io::Error::new(io::ErrorKind::NotFound, message));
                }
                self.store(host, Ok(ips.clone()));
                Ok(ips)
            }
            Err(err) => {
                self.store(host, Err(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_bypass_lookup() {
        let resolver = CachingResolver::new();
        let ips = resolver.resolve("192.168.1.9").await.expect("resolve");
        assert_eq!(ips, vec!["192.168.1.9".parse::<IpAddr>().unwrap()]);
        let ips = resolver.resolve("::1").await.expect("resolve");
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let resolver = CachingResolver::new();
        let ips = resolver.resolve("localhost").await.expect("resolve");
        assert!(ips.iter().all(|ip| ip.is_loopback()));
    }

    #[tokio::test]
    async fn negative_answers_are_cached() {
        let resolver = CachingResolver::with_ttl(Duration::from_secs(60));
        let host = "does-not-exist.invalid";
        assert!(resolver.resolve(host).await.is_err());
        // The failure is now served from cache.
        assert!(resolver.cached(host).is_some());
        assert!(resolver.resolve(host).await.is_err());
    }

    #[tokio::test]
    async fn entries_expire() {
        let resolver = CachingResolver::with_ttl(Duration::from_millis(10));
        resolver.store("broker-a", Ok(vec!["10.0.0.1".parse().unwrap()]));
        assert!(resolver.cached("broker-a").is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(resolver.cached("broker-a").is_none());
    }
}
