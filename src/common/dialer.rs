//! TCP dialer used for every proxy connection.
//!
//! Applies the socket options a probe wants before and after connecting:
//!
//! - Bind to a specific source address
//! - Connect timeout (capped by the caller's deadline)
//! - Keep-alive settings, so pooled sessions notice dead peers
//! - `TCP_NODELAY`, because probe requests are tiny and latency sensitive

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::error::ProbeError;

/// Dialer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Connect timeout in milliseconds. Default: 10000. The probe deadline still wins when shorter.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled. Default: 30.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(10_000))
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        match self.tcp_keep_alive_secs.unwrap_or(30) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Dialer that applies socket options and connects.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// Connect to `host:port`. `host` is normally an IP literal handed out by the DNS cache; a
    /// hostname that failed to resolve is passed through to the system resolver as a last try.
    pub async fn connect(&self, host: &str, port: u16, deadline: Instant) -> Result<TcpStream, ProbeError> {
        let deadline = deadline.min(Instant::now() + self.config.connect_timeout());
        let stream = match tokio::time::timeout_at(deadline, self.connect_inner(host, port)).await {
            Ok(res) => res?,
            Err(_) => return Err(ProbeError::Timeout("tcp connect")),
        };

        self.apply_post_connect(&stream)?;
        debug!(host = host, port = port, "dialer connected");
        Ok(stream)
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<TcpStream, ProbeError> {
        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("getaddrinfo ENOTFOUND {}", host),
                    )
                })?,
        };

        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };

        if let Some(ref bind_addr) = self.config.bind_address {
            let ip: IpAddr = bind_addr.parse().map_err(|e| {
                ProbeError::Protocol(format!("invalid bind address '{}': {}", bind_addr, e))
            })?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        Ok(socket.connect(addr).await?)
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<(), ProbeError> {
        if let Some(interval) = self.config.keep_alive() {
            let sock_ref = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            sock_ref.set_tcp_keepalive(&keepalive)?;
        }

        stream.set_nodelay(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialer_config_defaults() {
        let config = DialerConfig::default();
        assert!(config.bind_address.is_none());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn keep_alive_zero_disables() {
        let config = DialerConfig {
            tcp_keep_alive_secs: Some(0),
            ..Default::default()
        };
        assert!(config.keep_alive().is_none());
    }

    #[tokio::test]
    async fn dialer_connect_localhost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::default();
        let deadline = Instant::now() + Duration::from_secs(2);
        let stream = dialer.connect("127.0.0.1", addr.port(), deadline).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn dialer_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = Dialer::default();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = dialer.connect("127.0.0.1", port, deadline).await.unwrap_err();
        match err {
            ProbeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn dialer_config_deserialize() {
        let yaml = r#"
bind-address: "192.168.1.1"
connect-timeout: 4000
tcp-keep-alive: 60
"#;
        let config: DialerConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.bind_address.as_deref(), Some("192.168.1.1"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(4));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(60)));
    }
}
