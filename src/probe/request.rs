//! 探测请求：在已建立的通道上发一个 GET，并判断响应何时算完整

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::{with_deadline, ProbeError, ProxyStream, TargetUrl};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
/// 读循环的轮询粒度，用于在数据停滞时检查回退超时
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// 无长度信息时，至少这么多字节且以换行结尾才视为完整
const HEURISTIC_MIN_BODY: usize = 512;

pub struct RequestSpec<'a> {
    pub target: &'a TargetUrl,
    /// Absolute-URI request line (plain HTTP proxy forwarding).
    pub forwarding: bool,
    /// `Proxy-Authorization` value, sent only when forwarding.
    pub proxy_auth: Option<String>,
    pub user_agent: &'a str,
    pub keep_alive: bool,
}

pub fn build_request(spec: &RequestSpec<'_>) -> String {
    let request_target = if spec.forwarding {
        spec.target.absolute()
    } else {
        spec.target.path.clone()
    };

    let mut req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nAccept-Encoding: identity\r\n",
        request_target,
        spec.target.host_header(),
        spec.user_agent
    );
    if spec.forwarding {
        if let Some(ref auth) = spec.proxy_auth {
            req.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
    }
    let connection = if spec.keep_alive { "keep-alive" } else { "close" };
    req.push_str(&format!("Connection: {}\r\n\r\n", connection));
    req
}

/// 解析后的响应头
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    /// 头名统一小写
    pub headers: Vec<(String, String)>,
    /// 状态行 + 头部 + 空行的字节数
    pub header_len: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the server intends to close after this response.
    pub fn wants_close(&self) -> bool {
        match self.header("connection").map(|v| v.to_ascii_lowercase()) {
            Some(v) if v.contains("close") => true,
            Some(v) if v.contains("keep-alive") => false,
            _ => self.version == "HTTP/1.0",
        }
    }

    /// 1xx/204/304 没有响应体
    pub fn bodyless(&self) -> bool {
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

/// 首字节一到就判断：SOCKS 风格的二进制应答，或与 `HTTP/` 前缀不符
fn reject_non_http(buf: &[u8]) -> Result<(), ProbeError> {
    let Some(&first) = buf.first() else {
        return Ok(());
    };
    if matches!(first, 0x00 | 0x04 | 0x05) {
        return Err(ProbeError::WrongProtocol(format!(
            "binary reply to HTTP request (first byte 0x{:02x})",
            first
        )));
    }
    let n = buf.len().min(5);
    if buf[..n] != b"HTTP/"[..n] {
        return Err(ProbeError::InvalidResponse("response is not HTTP".into()));
    }
    Ok(())
}

/// Parse the status line and headers. `Ok(None)` while the head is still incomplete.
pub fn parse_head(buf: &[u8]) -> Result<Option<ResponseHead>, ProbeError> {
    reject_non_http(buf)?;

    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProbeError::InvalidResponse("response headers too large".into()));
        }
        return Ok(None);
    };
    let header_len = end + 4;
    let text = String::from_utf8_lossy(&buf[..end]);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().to_string();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProbeError::InvalidResponse(format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let headers = lines
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect();

    Ok(Some(ResponseHead {
        version,
        status,
        reason,
        headers,
        header_len,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    NoBody,
    ContentLength,
    Chunked,
    Heuristic,
}

/// 响应完整性判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Incomplete,
    Complete(CompletionReason),
    /// 回退超时到期且已收到 200，强制结束
    ForceComplete,
}

/// Decide whether the response is complete, in priority order:
/// bodyless status, Content-Length, chunked terminator, content heuristics, fallback timer.
pub fn assess(head: &ResponseHead, body: &[u8], waited: Duration, fallback: Duration) -> Completion {
    if head.bodyless() {
        return Completion::Complete(CompletionReason::NoBody);
    }

    let content_length = head.content_length();
    if let Some(len) = content_length {
        if body.len() >= len {
            return Completion::Complete(CompletionReason::ContentLength);
        }
    } else if head.is_chunked() {
        if body.ends_with(b"0\r\n\r\n") {
            return Completion::Complete(CompletionReason::Chunked);
        }
    } else if looks_complete(body) {
        return Completion::Complete(CompletionReason::Heuristic);
    }

    if waited >= fallback && head.status == 200 {
        return Completion::ForceComplete;
    }
    Completion::Incomplete
}

fn looks_complete(body: &[u8]) -> bool {
    let trimmed = body.trim_ascii_end();
    if trimmed.is_empty() {
        return false;
    }
    let lower_tail: Vec<u8> = trimmed[trimmed.len().saturating_sub(7)..].to_ascii_lowercase();
    if lower_tail.ends_with(b"</html>") {
        return true;
    }
    if matches!(trimmed.last(), Some(b'}') | Some(b']')) {
        return true;
    }
    body.len() >= HEURISTIC_MIN_BODY && body.ends_with(b"\n")
}

/// Strip chunked framing. Malformed framing returns what was decoded so far.
pub fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    loop {
        let Some(line_end) = body.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_str = String::from_utf8_lossy(&body[..line_end]);
        let size_str = size_str.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = (start + size).min(body.len());
        out.extend_from_slice(&body[start..end]);
        if end + 2 > body.len() {
            break;
        }
        body = &body[end + 2..];
    }
    out
}

/// 读取响应时的回退超时
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Fallback for `200 Connection established`-style replies.
    pub connect_fallback: Duration,
    pub response_fallback: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            connect_fallback: Duration::from_millis(1000),
            response_fallback: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug)]
pub struct ResponseOutcome {
    pub head: ResponseHead,
    /// Raw body bytes (still chunk-framed when chunked).
    pub body: Bytes,
    pub completion: Completion,
    pub first_byte: Instant,
    pub last_byte: Instant,
    /// The connection can carry another request.
    pub reusable: bool,
}

impl ResponseOutcome {
    /// Body with transfer framing removed.
    pub fn decoded_body(&self) -> Vec<u8> {
        if self.head.is_chunked() {
            dechunk(&self.body)
        } else {
            self.body.to_vec()
        }
    }
}

/// Write the request; returns (request start, request end).
pub async fn send_request(
    stream: &mut ProxyStream,
    request: &str,
    deadline: Instant,
) -> Result<(Instant, Instant), ProbeError> {
    let start = Instant::now();
    with_deadline(deadline, "request send", async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await
    })
    .await?;
    Ok((start, Instant::now()))
}

/// 累积读取响应直到判定完整
///
/// 407 立即以认证失败返回；尚未解析出状态行就被关闭时返回 `ClosedBeforeResponse`。
pub async fn read_response(
    stream: &mut ProxyStream,
    deadline: Instant,
    keep_alive: bool,
    opts: ReadOptions,
) -> Result<ResponseOutcome, ProbeError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut head: Option<ResponseHead> = None;
    let mut first_byte: Option<Instant> = None;
    let mut last_byte: Option<Instant> = None;
    let mut head_at: Option<Instant> = None;
    let mut eof = false;

    let completion = loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProbeError::Timeout("response"));
        }
        let poll_until = deadline.min(now + POLL_INTERVAL);
        match tokio::time::timeout_at(poll_until, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => eof = true,
            Ok(Ok(_)) => {
                let now = Instant::now();
                first_byte.get_or_insert(now);
                last_byte = Some(now);
            }
            Ok(Err(e)) => return Err(ProbeError::Io(e)),
            Err(_) => {}
        }

        if head.is_none() {
            head = parse_head(&buf)?;
            if let Some(ref h) = head {
                if h.status == 407 {
                    return Err(ProbeError::HttpAuthRequired);
                }
                head_at = Some(Instant::now());
                debug!(status = h.status, reason = %h.reason, "response head received");
            }
        }

        let Some(ref h) = head else {
            if eof {
                reject_non_http(&buf)?;
                return Err(ProbeError::ClosedBeforeResponse);
            }
            continue;
        };

        let fallback = if h.reason.to_ascii_lowercase().contains("connection established") {
            opts.connect_fallback
        } else {
            opts.response_fallback
        };
        let waited = head_at.map(|t| t.elapsed()).unwrap_or_default();
        match assess(h, &buf[h.header_len..], waited, fallback) {
            Completion::Incomplete if eof => break Completion::Complete(CompletionReason::Heuristic),
            Completion::Incomplete if buf.len() > MAX_RESPONSE_BYTES => {
                warn!(bytes = buf.len(), "response exceeds size limit, truncating");
                break Completion::ForceComplete;
            }
            Completion::Incomplete => continue,
            Completion::ForceComplete => {
                warn!(status = h.status, waited_ms = waited.as_millis() as u64, "response force-completed after fallback timeout");
                break Completion::ForceComplete;
            }
            done => break done,
        }
    };

    let Some(head) = head else {
        return Err(ProbeError::ClosedBeforeResponse);
    };
    let body = buf.split_off(head.header_len).freeze();
    let reusable = keep_alive
        && !eof
        && !head.wants_close()
        && match completion {
            Completion::Complete(CompletionReason::NoBody) => body.is_empty(),
            Completion::Complete(CompletionReason::ContentLength) => {
                head.content_length() == Some(body.len())
            }
            Completion::Complete(CompletionReason::Chunked) => true,
            _ => false,
        };

    let first_byte = first_byte.unwrap_or_else(Instant::now);
    Ok(ResponseOutcome {
        head,
        body,
        completion,
        first_byte,
        last_byte: last_byte.unwrap_or(first_byte),
        reusable,
    })
}
