use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::common::ParsedProxy;
use crate::proxy::Protocol;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_CONNECTIONS_PER_PROXY: u32 = 10;

/// 单次探测的调用参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeOptions {
    /// 单个连接尝试的超时（毫秒）
    pub timeout: u64,
    pub connections_per_proxy: u32,
    /// 结果里附带每个连接的明细
    pub test_all_connections: bool,
    pub session_reuse: bool,
    pub ip_lookup: bool,
    /// 已知协议时跳过探测
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_MS,
            connections_per_proxy: 1,
            test_all_connections: false,
            session_reuse: false,
            ip_lookup: false,
            protocol: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ProbeOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.max(1))
    }

    /// Number of sequential attempts, clamped to `1..=10`.
    pub fn connections(&self) -> u32 {
        self.connections_per_proxy.clamp(1, MAX_CONNECTIONS_PER_PROXY)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
}

/// 代理输入：原始字符串或已解析的结构
#[derive(Debug, Clone)]
pub enum ProxyInput {
    Raw(String),
    Parsed(ParsedProxy),
}

impl ProxyInput {
    pub fn parse(&self) -> Option<ParsedProxy> {
        match self {
            ProxyInput::Raw(s) => ParsedProxy::parse(s),
            ProxyInput::Parsed(p) => (p.port != 0).then(|| p.clone()),
        }
    }

    /// Display form for results; raw input is echoed back as given.
    pub fn label(&self) -> String {
        match self {
            ProxyInput::Raw(s) => s.trim().to_string(),
            ProxyInput::Parsed(p) => p.to_string(),
        }
    }
}

impl From<&str> for ProxyInput {
    fn from(s: &str) -> Self {
        ProxyInput::Raw(s.to_string())
    }
}

impl From<String> for ProxyInput {
    fn from(s: String) -> Self {
        ProxyInput::Raw(s)
    }
}

impl From<ParsedProxy> for ProxyInput {
    fn from(p: ParsedProxy) -> Self {
        ProxyInput::Parsed(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_json() {
        let opts: ProbeOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.timeout, 10_000);
        assert_eq!(opts.connections(), 1);
        assert!(!opts.session_reuse);
        assert!(opts.protocol.is_none());
    }

    #[test]
    fn camel_case_fields_and_clamp() {
        let opts: ProbeOptions = serde_json::from_str(
            r#"{"timeout":2500,"connectionsPerProxy":50,"sessionReuse":true,"protocol":"socks5"}"#,
        )
        .unwrap();
        assert_eq!(opts.timeout(), Duration::from_millis(2500));
        assert_eq!(opts.connections(), 10);
        assert!(opts.session_reuse);
        assert_eq!(opts.protocol, Some(Protocol::Socks5));

        let zero = ProbeOptions {
            connections_per_proxy: 0,
            ..Default::default()
        };
        assert_eq!(zero.connections(), 1);
    }

    #[test]
    fn proxy_input_conversions() {
        let raw: ProxyInput = "user:pass@1.2.3.4:1080".into();
        let parsed = raw.parse().unwrap();
        assert_eq!(parsed.port, 1080);
        assert!(parsed.has_credentials());

        let bad: ProxyInput = "not a proxy".into();
        assert!(bad.parse().is_none());

        let direct: ProxyInput = ParsedProxy::new("1.2.3.4", 0).into();
        assert!(direct.parse().is_none());
    }
}
