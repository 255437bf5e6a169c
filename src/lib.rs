#![allow(
    clippy::collapsible_if,
    clippy::len_without_is_empty,
    clippy::new_without_default,
    clippy::too_many_arguments
)]

pub mod common;
pub mod config;
pub mod dns;
pub mod probe;
pub mod proxy;

pub use common::{ErrorCode, ParsedProxy, ProbeError, TargetUrl};
pub use config::EngineConfig;
pub use probe::{ProbeEngine, ProbeOptions, ProbeResult, ProbeStatus, ProxyInput};
pub use proxy::Protocol;
