use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

use crate::common::stream::read_exact_by;
use crate::common::{with_deadline, ParsedProxy, ProbeError, ProxyStream};
use crate::proxy::{Handshake, HandshakeContext, Handshaker, Protocol};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 客户端握手（RFC 1928）
///
/// - 方法协商：只提供一种方法，有认证信息时为 USERNAME_PASSWORD(0x02)，否则 NO_AUTH(0x00)
/// - 用户名密码子协商（RFC 1929）
/// - CONNECT 命令，目标一律使用域名寻址
pub struct Socks5Handshaker;

pub fn greeting(has_credentials: bool) -> [u8; 3] {
    let method = if has_credentials {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    [VERSION, 0x01, method]
}

/// RFC 1929: `[0x01, ulen, user, plen, pass]`
pub fn auth_request(username: &str, password: &str) -> Result<Vec<u8>, ProbeError> {
    let user = username.as_bytes();
    let pass = password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(ProbeError::Protocol(
            "socks5 username/password longer than 255 bytes".into(),
        ));
    }
    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(0x01);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(pass.len() as u8);
    buf.extend_from_slice(pass);
    Ok(buf)
}

/// CONNECT 请求：`[0x05, 0x01, 0x00, 0x03, len, host, port_be]`
pub fn connect_request(host: &str, port: u16) -> Result<BytesMut, ProbeError> {
    let host = host.as_bytes();
    if host.is_empty() || host.len() > 255 {
        return Err(ProbeError::Protocol(format!(
            "socks5 domain length {} out of range",
            host.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(7 + host.len());
    buf.put_u8(VERSION);
    buf.put_u8(CMD_CONNECT);
    buf.put_u8(0x00);
    buf.put_u8(ATYP_DOMAIN);
    buf.put_u8(host.len() as u8);
    buf.put_slice(host);
    buf.put_u16(port);
    Ok(buf)
}

async fn authenticate(
    stream: &mut ProxyStream,
    proxy: &ParsedProxy,
    deadline: Instant,
) -> Result<(Instant, Instant), ProbeError> {
    let Some((user, pass)) = proxy.credentials() else {
        return Err(ProbeError::Socks5AuthRequired);
    };
    let request = auth_request(user, pass)?;

    let started = Instant::now();
    with_deadline(deadline, "socks5 auth", stream.write_all(&request)).await?;
    let mut reply = [0u8; 2];
    read_exact_by(stream, &mut reply, deadline, "socks5 auth").await?;
    let finished = Instant::now();

    if reply[1] != 0x00 {
        return Err(ProbeError::Socks5AuthFailed(reply[1]));
    }
    debug!(proxy = %proxy, "socks5 auth succeeded");
    Ok((started, finished))
}

/// 读掉 CONNECT 回复里的绑定地址，保证后续字节属于隧道
async fn skip_bound_address(
    stream: &mut ProxyStream,
    atyp: u8,
    deadline: Instant,
) -> Result<(), ProbeError> {
    let remaining = match atyp {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact_by(stream, &mut len, deadline, "socks5 connect reply").await?;
            len[0] as usize + 2
        }
        other => {
            return Err(ProbeError::Protocol(format!(
                "socks5: unknown bound address type 0x{:02x}",
                other
            )))
        }
    };
    let mut discard = vec![0u8; remaining];
    read_exact_by(stream, &mut discard, deadline, "socks5 connect reply").await
}

#[async_trait]
impl Handshaker for Socks5Handshaker {
    fn protocol(&self) -> Protocol {
        Protocol::Socks5
    }

    async fn handshake(
        &self,
        mut stream: ProxyStream,
        ctx: &HandshakeContext<'_>,
    ) -> Result<Handshake, ProbeError> {
        let has_credentials = ctx.proxy.has_credentials();

        // === 方法协商 ===
        with_deadline(ctx.deadline, "socks5 greeting", stream.write_all(&greeting(has_credentials))).await?;
        let mut choice = [0u8; 2];
        read_exact_by(&mut stream, &mut choice, ctx.deadline, "socks5 greeting").await?;
        if choice[0] != VERSION {
            return Err(ProbeError::WrongProtocol(format!(
                "socks5: bad version in method reply: 0x{:02x}",
                choice[0]
            )));
        }

        let auth_span = match choice[1] {
            METHOD_NO_AUTH => None,
            METHOD_USER_PASS => Some(authenticate(&mut stream, ctx.proxy, ctx.deadline).await?),
            METHOD_NO_ACCEPTABLE if has_credentials => {
                return Err(ProbeError::Socks5NoAcceptableMethod)
            }
            METHOD_NO_ACCEPTABLE => return Err(ProbeError::Socks5AuthRequired),
            other => {
                return Err(ProbeError::Protocol(format!(
                    "socks5: unsupported method selected: 0x{:02x}",
                    other
                )))
            }
        };

        // === CONNECT ===
        let request = connect_request(&ctx.target.host, ctx.target.port)?;
        with_deadline(ctx.deadline, "socks5 connect", stream.write_all(&request)).await?;

        let mut head = [0u8; 4];
        read_exact_by(&mut stream, &mut head, ctx.deadline, "socks5 connect reply").await?;
        if head[0] != VERSION {
            return Err(ProbeError::Protocol(format!(
                "socks5: bad version in connect reply: 0x{:02x}",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(ProbeError::Socks5Reply(head[1]));
        }
        skip_bound_address(&mut stream, head[3], ctx.deadline).await?;

        debug!(
            proxy = %ctx.proxy,
            dest = %ctx.target.authority(),
            authenticated = auth_span.is_some(),
            "socks5 tunnel established"
        );
        Ok(Handshake {
            stream,
            forwarding: false,
            auth_span,
        })
    }
}
