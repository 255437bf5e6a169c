use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::error::ProbeError;

/// 代理流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
pub type ProxyStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Run one I/O step against an absolute deadline.
///
/// Elapsed deadline maps to [`ProbeError::Timeout`] carrying the stage name.
pub async fn with_deadline<T, F>(deadline: Instant, stage: &'static str, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProbeError::ClosedDuringHandshake(stage))
        }
        Ok(Err(e)) => Err(ProbeError::Io(e)),
        Err(_) => Err(ProbeError::Timeout(stage)),
    }
}

/// `read_exact` bounded by a deadline. EOF becomes [`ProbeError::ClosedDuringHandshake`].
pub async fn read_exact_by<S>(
    stream: &mut S,
    buf: &mut [u8],
    deadline: Instant,
    stage: &'static str,
) -> Result<(), ProbeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    with_deadline(deadline, stage, stream.read_exact(buf)).await?;
    Ok(())
}

/// 带前缀缓冲的流：先读取预读数据，然后读取底层流
///
/// CONNECT 响应头之后多读到的字节（例如 TLS ServerHello 的开头）由它回放。
pub struct PrefixedStream {
    prefix: Bytes,
    inner: ProxyStream,
}

impl PrefixedStream {
    pub fn new(prefix: impl Into<Bytes>, inner: ProxyStream) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Wrap only when there is something to replay.
    pub fn wrap(prefix: Bytes, inner: ProxyStream) -> ProxyStream {
        if prefix.is_empty() {
            inner
        } else {
            Box::new(Self::new(prefix, inner))
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let to_copy = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..to_copy]);
            self.prefix.advance(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
