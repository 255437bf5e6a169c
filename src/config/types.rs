use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::common::DialerConfig;
use crate::dns::DnsCacheConfig;
use crate::proxy::SessionPoolConfig;

pub const DEFAULT_IP_LOOKUP_URL: &str =
    "http://ip-api.com/json/?fields=status,query,country,countryCode,regionName,city,isp,org,as";
pub const DEFAULT_USER_AGENT: &str = concat!("proxyprobe/", env!("CARGO_PKG_VERSION"));

/// 引擎配置，所有字段都有默认值
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log: LogConfig,
    pub dns: DnsCacheConfig,
    pub session: SessionPoolConfig,
    pub probe: ProbeTuning,
    pub dialer: DialerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dns.max_entries == 0 {
            anyhow::bail!("dns.max_entries must be greater than 0");
        }
        if self.session.max_entries == 0 {
            anyhow::bail!("session.max_entries must be greater than 0");
        }
        if self.probe.max_timeout_ms == 0 {
            anyhow::bail!("probe.max_timeout_ms must be greater than 0");
        }
        if self.probe.max_timeout_ms < self.probe.detection_timeout_ms {
            anyhow::bail!(
                "probe.max_timeout_ms ({}) is below probe.detection_timeout_ms ({})",
                self.probe.max_timeout_ms,
                self.probe.detection_timeout_ms
            );
        }
        let url = &self.probe.ip_lookup_url;
        if crate::common::TargetUrl::parse(url).is_none() {
            anyhow::bail!("probe.ip_lookup_url '{}' is not an http(s) URL", url);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 探测相关的超时与常量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeTuning {
    /// 整次探测的绝对上限
    pub max_timeout_ms: u64,
    /// 协议探测阶段单次尝试的超时上限
    pub detection_timeout_ms: u64,
    /// HTTP CONNECT 等待首个响应块的时间（撞上 SOCKS 服务端时快速失败）
    pub wrong_protocol_timeout_ms: u64,
    pub connect_fallback_ms: u64,
    pub response_fallback_ms: u64,
    pub ip_lookup_url: String,
    pub user_agent: String,
}

impl Default for ProbeTuning {
    fn default() -> Self {
        Self {
            max_timeout_ms: 30_000,
            detection_timeout_ms: 5_000,
            wrong_protocol_timeout_ms: 3_000,
            connect_fallback_ms: 1_000,
            response_fallback_ms: 3_000,
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ProbeTuning {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn wrong_protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.wrong_protocol_timeout_ms)
    }
}
