use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::common::{with_deadline, ParsedProxy, PrefixedStream, ProbeError, ProxyStream};
use crate::proxy::{Handshake, HandshakeContext, Handshaker, Protocol};

const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// HTTP(S) 代理握手
///
/// - `connect_only = false`（http）：`http://` 目标直接透传，`https://` 目标走 CONNECT
/// - `connect_only = true`（https）：任何目标都走 CONNECT 隧道
pub struct HttpHandshaker {
    pub connect_only: bool,
}

/// `Proxy-Authorization` header value for the proxy's credentials, if any.
pub fn basic_auth(proxy: &ParsedProxy) -> Option<String> {
    use base64::Engine;
    let (user, pass) = proxy.credentials()?;
    let cred = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
    Some(format!("Basic {}", cred))
}

pub fn build_connect_request(authority: &str, proxy: &ParsedProxy) -> String {
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        authority, authority
    );
    if let Some(auth) = basic_auth(proxy) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("Proxy-Connection: keep-alive\r\n\r\n");
    request
}

/// Status code of an HTTP status line (`HTTP/1.x NNN reason`).
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse::<u16>().ok()
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[async_trait]
impl Handshaker for HttpHandshaker {
    fn protocol(&self) -> Protocol {
        if self.connect_only {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    async fn handshake(
        &self,
        mut stream: ProxyStream,
        ctx: &HandshakeContext<'_>,
    ) -> Result<Handshake, ProbeError> {
        if !self.connect_only && !ctx.target.secure {
            // 普通 HTTP 代理按字节流转发，无需握手
            return Ok(Handshake {
                stream,
                forwarding: true,
                auth_span: None,
            });
        }

        let authority = ctx.target.authority();
        debug!(dest = %authority, proxy = %ctx.proxy, "http CONNECT");
        let request = build_connect_request(&authority, ctx.proxy);
        with_deadline(ctx.deadline, "CONNECT request", stream.write_all(request.as_bytes())).await?;

        // 首个响应块单独限时：SOCKS 服务端会回二进制或直接沉默
        let first_deadline = if ctx.fast_fail {
            ctx.deadline.min(Instant::now() + ctx.wrong_protocol_timeout)
        } else {
            ctx.deadline
        };

        let mut buf = BytesMut::with_capacity(1024);
        let n = with_deadline(first_deadline, "CONNECT response", stream.read_buf(&mut buf)).await?;
        if n == 0 {
            return Err(ProbeError::ClosedDuringHandshake("CONNECT response"));
        }
        if matches!(buf[0], 0x05 | 0x00) {
            return Err(ProbeError::WrongProtocol(format!(
                "SOCKS responder answered HTTP CONNECT (first byte 0x{:02x})",
                buf[0]
            )));
        }
        if !buf.starts_with(b"HTTP/") && !b"HTTP/".starts_with(&buf[..buf.len().min(5)]) {
            return Err(ProbeError::WrongProtocol("non-HTTP reply to CONNECT".to_string()));
        }

        let header_end = loop {
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            if buf.len() > MAX_CONNECT_RESPONSE {
                return Err(ProbeError::InvalidResponse("CONNECT response headers too large".into()));
            }
            let n = with_deadline(ctx.deadline, "CONNECT response", stream.read_buf(&mut buf)).await?;
            if n == 0 {
                return Err(ProbeError::ClosedDuringHandshake("CONNECT response"));
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]);
        let status_line = head.lines().next().unwrap_or_default();
        let status = parse_status_line(status_line).ok_or_else(|| {
            ProbeError::InvalidResponse(format!("bad CONNECT status line: {}", status_line.trim()))
        })?;

        match status {
            200 => {}
            407 => return Err(ProbeError::HttpAuthRequired),
            code => return Err(ProbeError::ConnectRejected(code)),
        }

        debug!(dest = %authority, "http CONNECT tunnel established");
        let leftover: Bytes = buf.split_off(header_end).freeze();
        Ok(Handshake::tunnel(PrefixedStream::wrap(leftover, stream)))
    }
}
