use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::DnsResolver;

/// DNS 缓存配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsCacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// 单次查询上限，超时后直接把主机名交给 dialer
    pub lookup_timeout_ms: u64,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1000,
            lookup_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DnsCacheEntry {
    pub ip: Ipv4Addr,
    pub resolved_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 进程级 DNS 缓存：主机名 -> IPv4，带 TTL 与容量上限
pub struct DnsCache {
    resolver: Arc<dyn DnsResolver>,
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    lookup_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn DnsResolver>, config: &DnsCacheConfig) -> Self {
        Self {
            resolver,
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve `host` to an IPv4 literal, using the cache.
    ///
    /// IPv4 literals come back untouched without a lookup. On lookup failure or timeout the
    /// hostname itself is returned so the caller's connect attempt surfaces the real error.
    pub async fn resolve(&self, host: &str) -> String {
        if host.parse::<Ipv4Addr>().is_ok() {
            return host.to_string();
        }

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(host) {
                if entry.resolved_at.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(host = host, ip = %entry.ip, "DNS cache hit");
                    return entry.ip.to_string();
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.lookup_and_store(host).await
    }

    /// Uncached lookup for first-connection timing. The cache is primed only after the lookup
    /// has completed, so the caller measures the real resolver cost.
    pub async fn resolve_fresh(&self, host: &str) -> String {
        if host.parse::<Ipv4Addr>().is_ok() {
            return host.to_string();
        }
        self.lookup_and_store(host).await
    }

    /// `resolve` narrowed to an address; `None` when the host could not be resolved.
    pub async fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr> {
        self.resolve(host).await.parse().ok()
    }

    async fn lookup_and_store(&self, host: &str) -> String {
        let lookup = tokio::time::timeout(self.lookup_timeout, self.resolver.resolve(host)).await;
        let ip = match lookup {
            Ok(Ok(addrs)) => addrs.into_iter().find_map(|a| match a {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            }),
            Ok(Err(e)) => {
                warn!(host = host, error = %e, "DNS lookup failed");
                None
            }
            Err(_) => {
                warn!(host = host, timeout_ms = self.lookup_timeout.as_millis() as u64, "DNS lookup timed out");
                None
            }
        };

        let Some(ip) = ip else {
            return host.to_string();
        };

        let mut entries = self.entries.write().await;
        entries.insert(
            host.to_string(),
            DnsCacheEntry {
                ip,
                resolved_at: Instant::now(),
            },
        );
        if entries.len() > self.max_entries {
            evict_oldest_half(&mut entries);
        }
        ip.to_string()
    }

    /// 清理过期条目；仍超出容量时淘汰最旧的一半
    pub async fn prune(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.resolved_at.elapsed() < self.ttl);
        if entries.len() > self.max_entries {
            evict_oldest_half(&mut entries);
        }
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, remaining = entries.len(), "DNS cache pruned");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> DnsCacheStats {
        DnsCacheStats {
            entries: self.len().await,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn evict_oldest_half(entries: &mut HashMap<String, DnsCacheEntry>) {
    let mut by_age: Vec<(String, Instant)> = entries
        .iter()
        .map(|(k, e)| (k.clone(), e.resolved_at))
        .collect();
    by_age.sort_by_key(|(_, at)| *at);
    let evict = by_age.len() / 2;
    for (host, _) in by_age.into_iter().take(evict) {
        entries.remove(&host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DnsResolver for CountingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) as u8;
            Ok(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, n + 1))])
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl DnsResolver for FailingResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            anyhow::bail!("NXDOMAIN {}", host)
        }
    }

    struct StallingResolver;

    #[async_trait]
    impl DnsResolver for StallingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    fn counting(max_entries: usize) -> (DnsCache, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cache = DnsCache::new(
            Arc::new(CountingResolver {
                count: count.clone(),
            }),
            &DnsCacheConfig {
                ttl_secs: 300,
                max_entries,
                lookup_timeout_ms: 3000,
            },
        );
        (cache, count)
    }

    #[tokio::test]
    async fn ipv4_literal_skips_lookup() {
        let (cache, count) = counting(16);
        assert_eq!(cache.resolve("192.168.1.10").await, "192.168.1.10");
        assert_eq!(cache.resolve_fresh("192.168.1.10").await, "192.168.1.10");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_within_ttl_then_expiry() {
        let (cache, count) = counting(16);

        assert_eq!(cache.resolve("example.com").await, "10.0.0.1");
        assert_eq!(cache.resolve("example.com").await, "10.0.0.1");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.resolve("example.com").await, "10.0.0.2");
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn fresh_lookup_always_queries_and_primes() {
        let (cache, count) = counting(16);
        cache.resolve_fresh("a.com").await;
        cache.resolve_fresh("a.com").await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cache.resolve("a.com").await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_falls_back_to_hostname() {
        let cache = DnsCache::new(Arc::new(FailingResolver), &DnsCacheConfig::default());
        assert_eq!(cache.resolve("nope.invalid").await, "nope.invalid");
        assert!(cache.resolve_ipv4("nope.invalid").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_timeout_falls_back_to_hostname() {
        let cache = DnsCache::new(Arc::new(StallingResolver), &DnsCacheConfig::default());
        let started = Instant::now();
        assert_eq!(cache.resolve("slow.example").await, "slow.example");
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn over_capacity_evicts_oldest_half() {
        let (cache, _count) = counting(4);
        for i in 0..4 {
            cache.resolve(&format!("host{}.com", i)).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(cache.len().await, 4);

        cache.resolve("overflow.com").await;
        // 5 条超限 -> 淘汰最旧的 2 条
        assert_eq!(cache.len().await, 3);
        let entries = cache.entries.read().await;
        assert!(!entries.contains_key("host0.com"));
        assert!(!entries.contains_key("host1.com"));
        assert!(entries.contains_key("overflow.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_expired() {
        let (cache, _count) = counting(16);
        cache.resolve("old.com").await;
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.resolve("new.com").await;
        tokio::time::advance(Duration::from_secs(150)).await;

        cache.prune().await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.entries.read().await.contains_key("new.com"));
    }
}
