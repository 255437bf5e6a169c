use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::common::stream::read_exact_by;
use crate::common::{with_deadline, ProbeError, ProxyStream};
use crate::proxy::{Handshake, HandshakeContext, Handshaker, Protocol};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const GRANTED: u8 = 0x5a;

/// SOCKS4 客户端握手
///
/// SOCKS4 只能携带 IPv4 地址，目标域名先经 DNS 缓存解析。不发送 userid。
pub struct Socks4Handshaker;

/// `[0x04, 0x01, port_hi, port_lo, ip4, 0x00]`
pub fn connect_request(ip: Ipv4Addr, port: u16) -> [u8; 9] {
    let [hi, lo] = port.to_be_bytes();
    let [a, b, c, d] = ip.octets();
    [VERSION, CMD_CONNECT, hi, lo, a, b, c, d, 0x00]
}

#[async_trait]
impl Handshaker for Socks4Handshaker {
    fn protocol(&self) -> Protocol {
        Protocol::Socks4
    }

    async fn handshake(
        &self,
        mut stream: ProxyStream,
        ctx: &HandshakeContext<'_>,
    ) -> Result<Handshake, ProbeError> {
        let ip = match ctx.target.ipv4_literal() {
            Some(ip) => ip,
            None => ctx
                .dns
                .resolve_ipv4(&ctx.target.host)
                .await
                .ok_or_else(|| ProbeError::Socks4Resolve(ctx.target.host.clone()))?,
        };

        let request = connect_request(ip, ctx.target.port);
        with_deadline(ctx.deadline, "socks4 connect", stream.write_all(&request)).await?;

        let mut reply = [0u8; 8];
        read_exact_by(&mut stream, &mut reply, ctx.deadline, "socks4 connect reply").await?;

        // 回复首字节按协议应为 0x00，部分实现回 0x04
        if reply[0] != 0x00 && reply[0] != VERSION {
            return Err(ProbeError::WrongProtocol(format!(
                "socks4: bad reply version 0x{:02x}",
                reply[0]
            )));
        }
        if reply[1] != GRANTED {
            return Err(ProbeError::Socks4Reply(reply[1]));
        }

        debug!(proxy = %ctx.proxy, dest = %ip, port = ctx.target.port, "socks4 tunnel established");
        Ok(Handshake::tunnel(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    use crate::common::{ParsedProxy, TargetUrl};
    use crate::dns::{DnsCache, DnsCacheConfig, DnsResolver};

    struct FixedResolver(Option<Ipv4Addr>);

    #[async_trait]
    impl DnsResolver for FixedResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            match self.0 {
                Some(ip) => Ok(vec![IpAddr::V4(ip)]),
                None => anyhow::bail!("NXDOMAIN {}", host),
            }
        }
    }

    async fn run(
        resolver: FixedResolver,
        target: &str,
        reply: [u8; 8],
    ) -> (Result<Handshake, ProbeError>, Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(1024);
        let proxy = ParsedProxy::new("127.0.0.1", 4145);
        let target = TargetUrl::parse(target).unwrap();
        let dns = DnsCache::new(Arc::new(resolver), &DnsCacheConfig::default());
        let ctx = HandshakeContext {
            proxy: &proxy,
            target: &target,
            deadline: Instant::now() + Duration::from_secs(2),
            fast_fail: false,
            wrong_protocol_timeout: Duration::from_secs(1),
            dns: &dns,
        };
        let task = tokio::spawn(async move {
            let mut req = [0u8; 9];
            if server.read_exact(&mut req).await.is_err() {
                return Vec::new();
            }
            server.write_all(&reply).await.unwrap();
            req.to_vec()
        });
        let result = Socks4Handshaker.handshake(Box::new(client), &ctx).await;
        (result, task.await.unwrap())
    }

    #[test]
    fn request_bytes() {
        assert_eq!(
            connect_request(Ipv4Addr::new(93, 184, 216, 34), 80),
            [0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34, 0x00]
        );
    }

    #[tokio::test]
    async fn granted_uses_resolved_address() {
        let (result, request) = run(
            FixedResolver(Some(Ipv4Addr::new(10, 1, 2, 3))),
            "http://example.com:8080/",
            [0x00, 0x5a, 0, 0, 0, 0, 0, 0],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(request, vec![0x04, 0x01, 0x1f, 0x90, 10, 1, 2, 3, 0x00]);
    }

    #[tokio::test]
    async fn version_four_reply_is_accepted() {
        let (result, _) = run(
            FixedResolver(None),
            "http://127.0.0.1/",
            [0x04, 0x5a, 0, 0, 0, 0, 0, 0],
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejected_0x5b_is_permission_issue() {
        let (result, _) = run(
            FixedResolver(Some(Ipv4Addr::LOCALHOST)),
            "http://example.com/",
            [0x00, 0x5b, 0, 0, 0, 0, 0, 0],
        )
        .await;
        let err = result.err().unwrap();
        assert!(matches!(err, ProbeError::Socks4Reply(0x5b)));
        assert!(err.is_credential_issue());
    }

    #[tokio::test]
    async fn identd_rejection_is_generic() {
        let (result, _) = run(
            FixedResolver(Some(Ipv4Addr::LOCALHOST)),
            "http://example.com/",
            [0x00, 0x5c, 0, 0, 0, 0, 0, 0],
        )
        .await;
        let err = result.err().unwrap();
        assert!(matches!(err, ProbeError::Socks4Reply(0x5c)));
        assert!(!err.is_credential_issue());
    }

    #[tokio::test]
    async fn unresolvable_target_fails_before_sending() {
        let (result, request) = run(FixedResolver(None), "http://nope.invalid/", [0; 8]).await;
        assert!(matches!(result, Err(ProbeError::Socks4Resolve(_))));
        assert!(request.is_empty());
    }

    #[tokio::test]
    async fn http_reply_is_wrong_protocol() {
        let (result, _) = run(
            FixedResolver(Some(Ipv4Addr::LOCALHOST)),
            "http://example.com/",
            *b"HTTP/1.1",
        )
        .await;
        assert!(matches!(result, Err(ProbeError::WrongProtocol(_))));
    }
}
