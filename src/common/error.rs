use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单次连接尝试内部的失败原因
///
/// 每个握手/请求步骤都返回结构化错误，由 `probe::classify` 转成对外的 [`ErrorCode`]。
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("wrong protocol: {0}")]
    WrongProtocol(String),

    #[error("proxy authentication required (407)")]
    HttpAuthRequired,

    #[error("CONNECT failed with status {0}")]
    ConnectRejected(u16),

    #[error("proxy returned gateway error status {0}")]
    BadStatus(u16),

    #[error("proxy closed the connection during {0}")]
    ClosedDuringHandshake(&'static str),

    #[error("socks5: authentication failed (status: 0x{0:02x})")]
    Socks5AuthFailed(u8),

    #[error("socks5: server rejected all authentication methods")]
    Socks5NoAcceptableMethod,

    #[error("socks5: server requires username/password authentication")]
    Socks5AuthRequired,

    #[error("socks5: request failed: {} (0x{:02x})", reply_reason_5(.0), .0)]
    Socks5Reply(u8),

    #[error("socks4: request rejected: {} (0x{:02x})", reply_reason_4(.0), .0)]
    Socks4Reply(u8),

    #[error("socks4: cannot resolve {0} to an IPv4 address")]
    Socks4Resolve(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("connection closed before complete response")]
    ClosedBeforeResponse,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ProbeError {
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Io(_) => ProbeErrorKind::Io,
            ProbeError::Timeout(_) => ProbeErrorKind::Timeout,
            ProbeError::Cancelled => ProbeErrorKind::Cancelled,
            ProbeError::WrongProtocol(_) => ProbeErrorKind::WrongProtocol,
            ProbeError::HttpAuthRequired => ProbeErrorKind::HttpAuth,
            ProbeError::ConnectRejected(_) | ProbeError::BadStatus(_) => ProbeErrorKind::Tunnel,
            ProbeError::ClosedDuringHandshake(_) => ProbeErrorKind::Protocol,
            ProbeError::Socks5AuthFailed(_)
            | ProbeError::Socks5NoAcceptableMethod
            | ProbeError::Socks5AuthRequired => ProbeErrorKind::SocksAuth,
            ProbeError::Socks5Reply(0x02) => ProbeErrorKind::SocksAuth,
            ProbeError::Socks5Reply(_) => ProbeErrorKind::Socks,
            ProbeError::Socks4Reply(0x5b) => ProbeErrorKind::SocksAuth,
            ProbeError::Socks4Reply(_) | ProbeError::Socks4Resolve(_) => ProbeErrorKind::Socks,
            ProbeError::Tls(_) => ProbeErrorKind::Tls,
            ProbeError::ClosedBeforeResponse => ProbeErrorKind::ClosedBeforeResponse,
            ProbeError::InvalidResponse(_) | ProbeError::Protocol(_) => ProbeErrorKind::Protocol,
        }
    }

    /// Whether the failure points at credentials or proxy-side permissions rather than the
    /// protocol guess.
    pub fn is_credential_issue(&self) -> bool {
        matches!(
            self.kind(),
            ProbeErrorKind::HttpAuth | ProbeErrorKind::SocksAuth
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ProbeError::Timeout(_) => true,
            ProbeError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Io,
    Timeout,
    Cancelled,
    WrongProtocol,
    HttpAuth,
    SocksAuth,
    Socks,
    Tunnel,
    Tls,
    ClosedBeforeResponse,
    Protocol,
}

pub fn socks5_reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn reply_reason_5(code: &u8) -> &'static str {
    socks5_reply_reason(*code)
}

fn reply_reason_4(code: &u8) -> &'static str {
    socks4_reply_reason(*code)
}

pub fn socks4_reply_reason(code: u8) -> &'static str {
    match code {
        0x5b => "request rejected or failed",
        0x5c => "identd not reachable",
        0x5d => "identd user-id mismatch",
        _ => "unknown error",
    }
}

/// 对外暴露的错误码（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidFormat,
    Timeout,
    KnownProtocolFailed,
    AllProtocolsFailed,
    HttpAuthError,
    HttpInvalidCredentials,
    SocksInvalidCredentials,
    #[serde(rename = "SOCKS4_INVALID_CREDENTIALS")]
    Socks4InvalidCredentials,
    SocksAuthOrPermissionError,
    HttpProxyRequestError,
    HttpProxyConnectionError,
    HttpsProxyConnectionError,
    #[serde(rename = "SOCKS4_CONNECTION_ERROR")]
    Socks4ConnectionError,
    ProxyAuthFailed,
    ProxyNotFound,
    ProxyConnectionRefused,
    ProxyTimeout,
    ProxyConnectionReset,
    ProxyTunnelFailed,
    SocksConnectionFailed,
    ProxyError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::KnownProtocolFailed => "KNOWN_PROTOCOL_FAILED",
            ErrorCode::AllProtocolsFailed => "ALL_PROTOCOLS_FAILED",
            ErrorCode::HttpAuthError => "HTTP_AUTH_ERROR",
            ErrorCode::HttpInvalidCredentials => "HTTP_INVALID_CREDENTIALS",
            ErrorCode::SocksInvalidCredentials => "SOCKS_INVALID_CREDENTIALS",
            ErrorCode::Socks4InvalidCredentials => "SOCKS4_INVALID_CREDENTIALS",
            ErrorCode::SocksAuthOrPermissionError => "SOCKS_AUTH_OR_PERMISSION_ERROR",
            ErrorCode::HttpProxyRequestError => "HTTP_PROXY_REQUEST_ERROR",
            ErrorCode::HttpProxyConnectionError => "HTTP_PROXY_CONNECTION_ERROR",
            ErrorCode::HttpsProxyConnectionError => "HTTPS_PROXY_CONNECTION_ERROR",
            ErrorCode::Socks4ConnectionError => "SOCKS4_CONNECTION_ERROR",
            ErrorCode::ProxyAuthFailed => "PROXY_AUTH_FAILED",
            ErrorCode::ProxyNotFound => "PROXY_NOT_FOUND",
            ErrorCode::ProxyConnectionRefused => "PROXY_CONNECTION_REFUSED",
            ErrorCode::ProxyTimeout => "PROXY_TIMEOUT",
            ErrorCode::ProxyConnectionReset => "PROXY_CONNECTION_RESET",
            ErrorCode::ProxyTunnelFailed => "PROXY_TUNNEL_FAILED",
            ErrorCode::SocksConnectionFailed => "SOCKS_CONNECTION_FAILED",
            ErrorCode::ProxyError => "PROXY_ERROR",
        }
    }

    /// Fixed human-readable cause.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "Invalid proxy format",
            ErrorCode::Timeout => "Proxy test timed out",
            ErrorCode::KnownProtocolFailed => "Proxy did not work with the specified protocol",
            ErrorCode::AllProtocolsFailed => "Proxy did not respond to any supported protocol",
            ErrorCode::HttpAuthError => "HTTP proxy requires authentication",
            ErrorCode::HttpInvalidCredentials => "HTTP proxy rejected the supplied credentials",
            ErrorCode::SocksInvalidCredentials => "SOCKS proxy rejected the supplied credentials",
            ErrorCode::Socks4InvalidCredentials => "SOCKS4 proxy rejected the request",
            ErrorCode::SocksAuthOrPermissionError => {
                "SOCKS proxy refused the connection (authentication or ruleset)"
            }
            ErrorCode::HttpProxyRequestError => {
                "HTTP proxy accepted the connection but the request failed"
            }
            ErrorCode::HttpProxyConnectionError => "HTTP proxy connection failed",
            ErrorCode::HttpsProxyConnectionError => "HTTPS proxy connection failed",
            ErrorCode::Socks4ConnectionError => "SOCKS4 proxy connection failed",
            ErrorCode::ProxyAuthFailed => "Proxy authentication failed",
            ErrorCode::ProxyNotFound => "Proxy host not found",
            ErrorCode::ProxyConnectionRefused => "Proxy refused the connection",
            ErrorCode::ProxyTimeout => "Proxy connection timed out",
            ErrorCode::ProxyConnectionReset => "Proxy reset the connection",
            ErrorCode::ProxyTunnelFailed => "Proxy failed to establish the tunnel",
            ErrorCode::SocksConnectionFailed => "SOCKS proxy connection failed",
            ErrorCode::ProxyError => "Proxy error",
        }
    }

    /// Fixed remedy shown next to the message.
    pub fn suggestion(self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => {
                "Use host:port, host:port:user:pass, user:pass:host:port or user:pass@host:port"
            }
            ErrorCode::Timeout | ErrorCode::ProxyTimeout => {
                "The proxy is slow or unreachable; try a longer timeout"
            }
            ErrorCode::KnownProtocolFailed => {
                "Verify the protocol, or leave it unset so it can be detected"
            }
            ErrorCode::AllProtocolsFailed => {
                "Check that the proxy is online and the address and port are correct"
            }
            ErrorCode::HttpAuthError => "Add a username and password to the proxy string",
            ErrorCode::HttpInvalidCredentials
            | ErrorCode::SocksInvalidCredentials
            | ErrorCode::ProxyAuthFailed => "Check the username and password",
            ErrorCode::Socks4InvalidCredentials | ErrorCode::SocksAuthOrPermissionError => {
                "Check the credentials and whether your IP is allowed by the proxy"
            }
            ErrorCode::HttpProxyRequestError => {
                "The proxy may block the target site; try another target URL"
            }
            ErrorCode::HttpProxyConnectionError
            | ErrorCode::HttpsProxyConnectionError
            | ErrorCode::Socks4ConnectionError
            | ErrorCode::SocksConnectionFailed => {
                "The proxy speaks this protocol but could not reach the target"
            }
            ErrorCode::ProxyNotFound => "Check the proxy hostname",
            ErrorCode::ProxyConnectionRefused => "Check the port and whether the proxy is running",
            ErrorCode::ProxyConnectionReset => "The proxy dropped the connection; it may be overloaded",
            ErrorCode::ProxyTunnelFailed => "The proxy could not open a tunnel to the target",
            ErrorCode::ProxyError => "Check the proxy configuration",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProbeError> for std::io::Error {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Io(inner) => inner,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::Socks4InvalidCredentials).unwrap();
        assert_eq!(json, "\"SOCKS4_INVALID_CREDENTIALS\"");
        let json = serde_json::to_string(&ErrorCode::AllProtocolsFailed).unwrap();
        assert_eq!(json, "\"ALL_PROTOCOLS_FAILED\"");
        let json = serde_json::to_string(&ErrorCode::HttpsProxyConnectionError).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCode::HttpsProxyConnectionError.as_str()));
    }

    #[test]
    fn socks_reply_codes_map_to_auth_kind() {
        assert_eq!(ProbeError::Socks5Reply(0x02).kind(), ProbeErrorKind::SocksAuth);
        assert_eq!(ProbeError::Socks5Reply(0x05).kind(), ProbeErrorKind::Socks);
        assert_eq!(ProbeError::Socks4Reply(0x5b).kind(), ProbeErrorKind::SocksAuth);
        assert_eq!(ProbeError::Socks4Reply(0x5c).kind(), ProbeErrorKind::Socks);
        assert!(ProbeError::Socks5AuthFailed(1).is_credential_issue());
        assert!(!ProbeError::ClosedBeforeResponse.is_credential_issue());
    }

    #[test]
    fn reply_reason_in_message() {
        let msg = ProbeError::Socks5Reply(0x04).to_string();
        assert!(msg.contains("host unreachable"));
        let msg = ProbeError::Socks4Reply(0x5d).to_string();
        assert!(msg.contains("identd"));
    }

    #[test]
    fn io_timeout_counts_as_timeout() {
        let err = ProbeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        assert!(err.is_timeout());
        assert!(ProbeError::Timeout("tcp connect").is_timeout());
        assert!(!ProbeError::ClosedBeforeResponse.is_timeout());
    }
}
