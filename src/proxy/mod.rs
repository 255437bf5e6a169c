pub mod order;
pub mod outbound;
pub mod session_pool;
pub mod tls;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::{ParsedProxy, ProbeError, ProxyStream, TargetUrl};
use crate::dns::DnsCache;

pub use order::protocol_order;
pub use session_pool::{ManagedSession, SessionPool, SessionPoolConfig, SessionPoolStats};

/// 代理协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP proxy: absolute-URI forwarding for `http://` targets, CONNECT for `https://`.
    Http,
    /// HTTP proxy driven only through CONNECT, whatever the target scheme.
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::Socks4,
        Protocol::Socks5,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn is_http_family(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    pub fn is_socks(self) -> bool {
        matches!(self, Protocol::Socks4 | Protocol::Socks5)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks4" | "socks4a" => Ok(Protocol::Socks4),
            "socks5" | "socks" | "socks5h" => Ok(Protocol::Socks5),
            other => anyhow::bail!("unknown proxy protocol: {}", other),
        }
    }
}

/// 握手所需的上下文，一次连接尝试一份
pub struct HandshakeContext<'a> {
    pub proxy: &'a ParsedProxy,
    pub target: &'a TargetUrl,
    /// 本次尝试的绝对截止时间
    pub deadline: Instant,
    /// 探测阶段：HTTP CONNECT 的首字节等待使用 `wrong_protocol_timeout`
    pub fast_fail: bool,
    pub wrong_protocol_timeout: Duration,
    /// SOCKS4 只能携带 IPv4，需要先解析目标
    pub dns: &'a DnsCache,
}

/// 握手完成后的通道
pub struct Handshake {
    pub stream: ProxyStream,
    /// Plain HTTP forwarding: the request line must use the absolute URI and carry
    /// `Proxy-Authorization` itself.
    pub forwarding: bool,
    /// Measured credential sub-negotiation, when the protocol exposes one.
    pub auth_span: Option<(Instant, Instant)>,
}

impl Handshake {
    pub fn tunnel(stream: ProxyStream) -> Self {
        Self {
            stream,
            forwarding: false,
            auth_span: None,
        }
    }
}

/// 协议握手状态机：输入已连上代理的裸 TCP 流，输出可直接发请求的通道
#[async_trait]
pub trait Handshaker: Send + Sync {
    fn protocol(&self) -> Protocol;
    async fn handshake(
        &self,
        stream: ProxyStream,
        ctx: &HandshakeContext<'_>,
    ) -> Result<Handshake, ProbeError>;
}

pub fn handshaker_for(protocol: Protocol) -> &'static dyn Handshaker {
    use outbound::{HttpHandshaker, Socks4Handshaker, Socks5Handshaker};

    static HTTP: HttpHandshaker = HttpHandshaker { connect_only: false };
    static HTTPS: HttpHandshaker = HttpHandshaker { connect_only: true };
    static SOCKS4: Socks4Handshaker = Socks4Handshaker;
    static SOCKS5: Socks5Handshaker = Socks5Handshaker;

    match protocol {
        Protocol::Http => &HTTP,
        Protocol::Https => &HTTPS,
        Protocol::Socks4 => &SOCKS4,
        Protocol::Socks5 => &SOCKS5,
    }
}
