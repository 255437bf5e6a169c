use serde::Serialize;

use crate::common::{ErrorCode, ProbeError};
use crate::proxy::Protocol;

use super::exit_ip::ExitIpInfo;
use super::metrics::{ConnectionMetrics, MetricsSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Fail,
}

/// 对外的失败描述
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyError {
    pub message: String,
    pub code: ErrorCode,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols_tried: Option<Vec<Protocol>>,
}

impl ProxyError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.message().to_string(),
            code,
            suggestion: code.suggestion().to_string(),
            protocols_tried: None,
        }
    }

    /// Fixed message for `code` followed by the underlying failure.
    pub fn from_probe_error(code: ErrorCode, err: &ProbeError) -> Self {
        let mut e = Self::new(code);
        e.message = format!("{}: {}", code.message(), err);
        e
    }

    pub fn with_protocols_tried(mut self, tried: Vec<Protocol>) -> Self {
        self.protocols_tried = Some(tried);
        self
    }
}

/// 一次 `probe` 调用的完整结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub proxy: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_connection_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsequent_connection_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<MetricsSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<ConnectionMetrics>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_ip: Option<ExitIpInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProxyError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocols_tried: Vec<Protocol>,
    pub elapsed_ms: f64,
}

impl ProbeResult {
    pub fn failed(proxy: impl Into<String>, target: impl Into<String>, error: ProxyError) -> Self {
        Self {
            status: ProbeStatus::Fail,
            proxy: proxy.into(),
            target: target.into(),
            protocol: None,
            status_code: None,
            first_connection_time: None,
            subsequent_connection_time: None,
            timings: None,
            connections: None,
            exit_ip: None,
            protocols_tried: error.protocols_tried.clone().unwrap_or_default(),
            error: Some(error),
            elapsed_ms: 0.0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}
