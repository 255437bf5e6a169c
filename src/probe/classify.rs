//! 失败原因分类
//!
//! 先看结构化信息（错误变体、`io::ErrorKind`、SOCKS 回复码），
//! 只有在没有结构化信息时才按消息子串匹配。分类只影响诊断信息，不影响成败判定。

use std::io::ErrorKind;

use crate::common::{ErrorCode, ProbeError, ProbeErrorKind};
use crate::proxy::Protocol;

/// 按顺序匹配的消息子串（小写）
const PATTERNS: &[(&[&str], ErrorCode)] = &[
    (
        &["authentication", "407", "credentials", "unauthorized", "auth failed"],
        ErrorCode::ProxyAuthFailed,
    ),
    (
        &["enotfound", "getaddrinfo", "not found", "no such host", "name resolution", "failed to lookup"],
        ErrorCode::ProxyNotFound,
    ),
    (&["econnrefused", "connection refused", "refused"], ErrorCode::ProxyConnectionRefused),
    (&["etimedout", "timed out", "timeout"], ErrorCode::ProxyTimeout),
    (
        &["econnreset", "connection reset", "reset by peer", "socket hang up", "broken pipe", "aborted"],
        ErrorCode::ProxyConnectionReset,
    ),
    (&["tunnel", "connect failed", "bad gateway"], ErrorCode::ProxyTunnelFailed),
    (&["socks"], ErrorCode::SocksConnectionFailed),
];

/// Pattern-only classification of a free-form message.
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::ProxyError)
}

/// 通用分类
pub fn classify(err: &ProbeError) -> ErrorCode {
    match err.kind() {
        ProbeErrorKind::Timeout => return ErrorCode::ProxyTimeout,
        ProbeErrorKind::HttpAuth | ProbeErrorKind::SocksAuth => return ErrorCode::ProxyAuthFailed,
        ProbeErrorKind::Tunnel => return ErrorCode::ProxyTunnelFailed,
        ProbeErrorKind::Socks => return ErrorCode::SocksConnectionFailed,
        _ => {}
    }
    if let ProbeError::Io(e) = err {
        match e.kind() {
            ErrorKind::ConnectionRefused => return ErrorCode::ProxyConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                return ErrorCode::ProxyConnectionReset
            }
            ErrorKind::NotFound => return ErrorCode::ProxyNotFound,
            ErrorKind::TimedOut => return ErrorCode::ProxyTimeout,
            _ => {}
        }
    }
    classify_message(&err.to_string())
}

/// Credential/permission failures get dedicated codes regardless of phase.
pub fn credential_code(err: &ProbeError, has_credentials: bool) -> Option<ErrorCode> {
    let code = match err {
        ProbeError::HttpAuthRequired if has_credentials => ErrorCode::HttpInvalidCredentials,
        ProbeError::HttpAuthRequired => ErrorCode::HttpAuthError,
        ProbeError::Socks5AuthFailed(_) => ErrorCode::SocksInvalidCredentials,
        ProbeError::Socks5NoAcceptableMethod if has_credentials => ErrorCode::SocksInvalidCredentials,
        ProbeError::Socks5NoAcceptableMethod
        | ProbeError::Socks5AuthRequired
        | ProbeError::Socks5Reply(0x02) => ErrorCode::SocksAuthOrPermissionError,
        ProbeError::Socks4Reply(0x5b) => ErrorCode::Socks4InvalidCredentials,
        _ => return None,
    };
    Some(code)
}

/// 协议是如何确定的
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolSource {
    /// Supplied by the caller.
    Known,
    /// Detection confirmed the protocol.
    Detected,
    /// HTTP-family detection got a response-layer failure; the protocol is assumed
    /// and the full probe runs anyway.
    Promoted,
}

/// Final error code for a failed full probe.
pub fn failure_code(
    err: &ProbeError,
    protocol: Protocol,
    source: ProtocolSource,
    has_credentials: bool,
) -> ErrorCode {
    if matches!(err, ProbeError::Cancelled) {
        return ErrorCode::ProxyError;
    }
    if let Some(code) = credential_code(err, has_credentials) {
        return code;
    }
    if err.is_timeout() {
        return ErrorCode::Timeout;
    }

    match source {
        ProtocolSource::Known => match classify(err) {
            ErrorCode::ProxyError => ErrorCode::KnownProtocolFailed,
            code => code,
        },
        ProtocolSource::Detected | ProtocolSource::Promoted => match protocol {
            Protocol::Http if matches!(err, ProbeError::ClosedBeforeResponse) => {
                ErrorCode::HttpProxyRequestError
            }
            Protocol::Http => ErrorCode::HttpProxyConnectionError,
            Protocol::Https => ErrorCode::HttpsProxyConnectionError,
            Protocol::Socks4 => ErrorCode::Socks4ConnectionError,
            Protocol::Socks5 => classify(err),
        },
    }
}

/// 探测阶段某个候选协议失败后的走向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionVerdict {
    /// Try the next candidate.
    Next,
    /// Protocol is the right one but the request layer failed; run the full probe.
    Promote,
    /// Credentials or permissions are the problem; stop with this code.
    Terminal(ErrorCode),
}

pub fn detection_verdict(err: &ProbeError, protocol: Protocol, has_credentials: bool) -> DetectionVerdict {
    if protocol.is_http_family() {
        if matches!(err, ProbeError::HttpAuthRequired) {
            if let Some(code) = credential_code(err, has_credentials) {
                return DetectionVerdict::Terminal(code);
            }
        }
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("connection closed before complete response")
            && !message.contains("wrong protocol")
            && !message.contains("socks")
        {
            return DetectionVerdict::Promote;
        }
        return DetectionVerdict::Next;
    }

    if err.is_credential_issue() {
        if let Some(code) = credential_code(err, has_credentials) {
            return DetectionVerdict::Terminal(code);
        }
    }
    DetectionVerdict::Next
}
