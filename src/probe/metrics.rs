//! 连接阶段计时
//!
//! 每次连接尝试记录一组时间点（[`PhaseTimings`]），完成后换算成固定的阶段耗时
//! （[`ConnectionMetrics`]），多次尝试再汇总为 [`MetricsSummary`]。

use serde::Serialize;
use tokio::time::Instant;

/// 代理认证时间无法单独观测时，按代理握手时间的比例估算
const AUTH_SHARE_OF_PROXY_CONNECT: f64 = 0.3;

/// 单次连接尝试的原始时间点
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimings {
    pub started: Instant,
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub handshake_start: Option<Instant>,
    pub handshake_end: Option<Instant>,
    pub auth_start: Option<Instant>,
    pub auth_end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_end: Option<Instant>,
    pub request_start: Option<Instant>,
    pub request_end: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub last_byte: Option<Instant>,
}

impl PhaseTimings {
    pub fn begin() -> Self {
        Self {
            started: Instant::now(),
            dns_start: None,
            dns_end: None,
            connect_start: None,
            connect_end: None,
            handshake_start: None,
            handshake_end: None,
            auth_start: None,
            auth_end: None,
            tls_start: None,
            tls_end: None,
            request_start: None,
            request_end: None,
            first_byte: None,
            last_byte: None,
        }
    }
}

/// 两个时间点之间的毫秒数；任一缺失或逆序时为 0
fn span_ms(start: Option<Instant>, end: Option<Instant>) -> f64 {
    match (start, end) {
        (Some(s), Some(e)) => round2(e.saturating_duration_since(s).as_secs_f64() * 1000.0),
        _ => 0.0,
    }
}

/// Clamp to ≥0 and round to two decimals.
pub fn round2(ms: f64) -> f64 {
    if !ms.is_finite() || ms <= 0.0 {
        return 0.0;
    }
    (ms * 100.0).round() / 100.0
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        round2(sum / n as f64)
    }
}

/// 单次连接的阶段耗时（毫秒）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub dns_lookup_time: f64,
    pub tcp_connect_time: f64,
    pub tls_handshake_time: f64,
    pub proxy_connect_time: f64,
    pub proxy_auth_time: f64,
    pub request_send_time: f64,
    pub response_wait_time: f64,
    pub response_download_time: f64,
    pub total_time: f64,
    pub connection_number: u32,
    pub is_first_connection: bool,
    pub session_reused: bool,
}

impl ConnectionMetrics {
    pub fn from_timings(
        t: &PhaseTimings,
        connection_number: u32,
        session_reused: bool,
        has_credentials: bool,
    ) -> Self {
        let proxy_connect_time = span_ms(t.handshake_start, t.handshake_end);
        let proxy_auth_time = if t.auth_start.is_some() {
            span_ms(t.auth_start, t.auth_end)
        } else if has_credentials {
            round2(proxy_connect_time * AUTH_SHARE_OF_PROXY_CONNECT)
        } else {
            0.0
        };
        let end = t.last_byte.or(t.first_byte).or(t.request_end);

        Self {
            dns_lookup_time: span_ms(t.dns_start, t.dns_end),
            tcp_connect_time: span_ms(t.connect_start, t.connect_end),
            tls_handshake_time: span_ms(t.tls_start, t.tls_end),
            proxy_connect_time,
            proxy_auth_time,
            request_send_time: span_ms(t.request_start, t.request_end),
            response_wait_time: span_ms(t.request_end, t.first_byte),
            response_download_time: span_ms(t.first_byte, t.last_byte),
            total_time: span_ms(Some(t.started), end),
            connection_number,
            is_first_connection: connection_number == 1,
            session_reused,
        }
    }
}

/// N 次连接的汇总
///
/// 一次性开销（DNS、TCP、TLS、代理握手与认证）取第一次连接；
/// 每次请求都有的开销取全部连接的算术平均。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub dns_lookup_time: f64,
    pub tcp_connect_time: f64,
    pub tls_handshake_time: f64,
    pub proxy_connect_time: f64,
    pub proxy_auth_time: f64,
    pub request_send_time: f64,
    pub response_wait_time: f64,
    pub response_download_time: f64,
    pub total_time: f64,
    pub connection_count: usize,
    pub reused_connections: usize,
}

impl MetricsSummary {
    pub fn from_connections(connections: &[ConnectionMetrics]) -> Option<Self> {
        let first = connections.first()?;
        Some(Self {
            dns_lookup_time: first.dns_lookup_time,
            tcp_connect_time: first.tcp_connect_time,
            tls_handshake_time: first.tls_handshake_time,
            proxy_connect_time: first.proxy_connect_time,
            proxy_auth_time: first.proxy_auth_time,
            request_send_time: mean(connections.iter().map(|c| c.request_send_time)),
            response_wait_time: mean(connections.iter().map(|c| c.response_wait_time)),
            response_download_time: mean(connections.iter().map(|c| c.response_download_time)),
            total_time: mean(connections.iter().map(|c| c.total_time)),
            connection_count: connections.len(),
            reused_connections: connections.iter().filter(|c| c.session_reused).count(),
        })
    }
}

/// `totalTime` of the first attempt.
pub fn first_connection_time(connections: &[ConnectionMetrics]) -> Option<f64> {
    connections.first().map(|c| c.total_time)
}

/// Mean `totalTime` of attempts 2..N; `None` for a single attempt.
pub fn subsequent_connection_time(connections: &[ConnectionMetrics]) -> Option<f64> {
    if connections.len() < 2 {
        return None;
    }
    Some(mean(connections[1..].iter().map(|c| c.total_time)))
}
