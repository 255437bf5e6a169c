//! 代理探测
//!
//! 对外入口是 [`ProbeEngine::probe`]：给定代理与目标 URL，识别协议、测量各阶段耗时并返回结构化结果。

pub mod classify;
pub mod engine;
pub mod exit_ip;
pub mod metrics;
pub mod options;
pub mod request;
pub mod result;

pub use engine::{EngineStats, ProbeEngine};
pub use exit_ip::ExitIpInfo;
pub use metrics::{ConnectionMetrics, MetricsSummary};
pub use options::{ProbeOptions, ProxyInput};
pub use result::{ProbeResult, ProbeStatus, ProxyError};
