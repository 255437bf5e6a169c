use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use super::DnsResolver;

/// 系统 DNS 解析器（使用 tokio::net::lookup_host），只保留 IPv4
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", host))
            .await?
            .map(|a| a.ip())
            .filter(IpAddr::is_ipv4)
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no A records for {}", host);
        }
        debug!(host = host, count = addrs.len(), "system DNS resolved");
        Ok(addrs)
    }
}

/// 基于 hickory-resolver 的 A 记录解析器（系统配置的上游）
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()?;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;
        // 缓存由 DnsCache 负责，这里关掉以便首连能测到真实耗时
        opts.cache_size = 0;
        let resolver = TokioAsyncResolver::tokio(config, opts);
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let response = self.resolver.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = response.iter().filter(IpAddr::is_ipv4).collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no A records for {}", host);
        }
        debug!(host = host, count = addrs.len(), "hickory DNS resolved");
        Ok(addrs)
    }
}

/// Hickory with the system configuration, or the system resolver when that configuration
/// cannot be read.
pub fn build_resolver() -> Arc<dyn DnsResolver> {
    match HickoryResolver::from_system_conf() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            warn!(error = %e, "system resolver config unavailable, using getaddrinfo");
            Arc::new(SystemResolver)
        }
    }
}
