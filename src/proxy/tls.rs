use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::time::Instant;
use tracing::debug;

use crate::common::{ProbeError, ProxyStream};

/// 在已建立的隧道上做 TLS 握手
///
/// SNI 取目标主机名；不校验证书（见 `common::tls::NoVerifier`），
/// 探测关心的是代理能否把流量送到目标，而不是目标证书。
pub async fn upgrade(
    stream: ProxyStream,
    host: &str,
    config: Arc<ClientConfig>,
    deadline: Instant,
) -> Result<ProxyStream, ProbeError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Tls(format!("invalid server name '{}': {}", host, e)))?;
    let connector = tokio_rustls::TlsConnector::from(config);

    let tls_stream = match tokio::time::timeout_at(deadline, connector.connect(server_name, stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ProbeError::Tls(e.to_string())),
        Err(_) => return Err(ProbeError::Timeout("tls handshake")),
    };

    debug!(sni = host, "TLS handshake completed");
    Ok(Box::new(tls_stream))
}
