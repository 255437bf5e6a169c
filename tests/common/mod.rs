//! 本地 mock：源站（HTTP / HTTPS）与 HTTP、SOCKS4、SOCKS5 代理
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::Engine;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const EXIT_IP: &str = "203.0.113.7";

/// 一个正在监听的 mock 服务
pub struct Mock {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
}

impl Mock {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn spawn_listener<F, Fut>(handler: F) -> Mock
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let fut = handler(stream);
            tokio::spawn(async move {
                let _ = fut.await;
            });
        }
    });
    Mock { addr, accepted }
}

/// 读到 `\r\n\r\n` 为止，返回 (头部, 多读到的字节)
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((String::from_utf8_lossy(&buf).to_string(), rest));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn origin_response(path: &str) -> Vec<u8> {
    let (status, body) = match path {
        "/ip" => (
            "200 OK",
            format!(
                r#"{{"status":"success","country":"Testland","countryCode":"TL","city":"Probe City","isp":"Mock ISP","query":"{}"}}"#,
                EXIT_IP
            ),
        ),
        "/bad" => ("502 Bad Gateway", String::new()),
        "/missing" => ("404 Not Found", "nope".to_string()),
        _ => ("200 OK", "ok".to_string()),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// keep-alive 源站：按请求路径回应，直到对端关闭
async fn serve_origin<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> std::io::Result<()> {
    loop {
        let (head, _) = match read_head(&mut stream).await {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
        // 转发模式下请求行可能是绝对 URI
        let path = match target.strip_prefix("http://") {
            Some(rest) => rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".into()),
            None => target,
        };
        stream.write_all(&origin_response(&path)).await?;
        stream.flush().await?;
    }
}

pub async fn spawn_origin() -> Mock {
    spawn_listener(|s| serve_origin(s)).await
}

pub async fn spawn_tls_origin() -> Mock {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key)
    .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    spawn_listener(move |s| {
        let acceptor = acceptor.clone();
        async move {
            let tls = acceptor.accept(s).await?;
            serve_origin(tls).await
        }
    })
    .await
}

fn basic(user_pass: &str) -> String {
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(user_pass))
}

/// HTTP 代理：支持 CONNECT 与绝对 URI 转发；`auth` 形如 `user:pass`
pub async fn spawn_http_proxy(auth: Option<&str>) -> Mock {
    let expected = auth.map(basic);
    spawn_listener(move |s| handle_http_proxy(s, expected.clone())).await
}

async fn handle_http_proxy(mut client: TcpStream, expected: Option<String>) -> std::io::Result<()> {
    let (head, leftover) = read_head(&mut client).await?;
    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();

    if let Some(expected) = expected {
        let authorized = head.lines().any(|line| match line.split_once(':') {
            Some((name, value)) => {
                name.eq_ignore_ascii_case("proxy-authorization") && value.trim() == expected
            }
            None => false,
        });
        if !authorized {
            client
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"mock\"\r\nContent-Length: 0\r\n\r\n",
                )
                .await?;
            return Ok(());
        }
    }

    if method == "CONNECT" {
        let mut upstream = match TcpStream::connect(uri.as_str()).await {
            Ok(u) => u,
            Err(_) => {
                client.write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").await?;
                return Ok(());
            }
        };
        client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
        upstream.write_all(&leftover).await?;
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        return Ok(());
    }

    let Some(rest) = uri.strip_prefix("http://") else {
        client.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await?;
        return Ok(());
    };
    let authority = rest.split('/').next().unwrap_or_default().to_string();
    let mut upstream = TcpStream::connect(authority.as_str()).await?;
    upstream.write_all(head.as_bytes()).await?;
    upstream.write_all(&leftover).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// SOCKS5 代理；`auth` 为 `(user, pass)` 时要求用户名密码认证
pub async fn spawn_socks5_proxy(auth: Option<(&str, &str)>) -> Mock {
    let auth = auth.map(|(u, p)| (u.to_string(), p.to_string()));
    spawn_listener(move |s| handle_socks5(s, auth.clone())).await
}

async fn handle_socks5(mut client: TcpStream, auth: Option<(String, String)>) -> std::io::Result<()> {
    let mut hdr = [0u8; 2];
    client.read_exact(&mut hdr).await?;
    if hdr[0] != 0x05 {
        // 真实 SOCKS5 服务端对非 SOCKS 请求的回应
        client.write_all(&[0x05, 0xff]).await?;
        client.flush().await?;
        return Ok(());
    }
    let mut methods = vec![0u8; hdr[1] as usize];
    client.read_exact(&mut methods).await?;

    match &auth {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                client.write_all(&[0x05, 0xff]).await?;
                return Ok(());
            }
            client.write_all(&[0x05, 0x02]).await?;
            let mut ver_len = [0u8; 2];
            client.read_exact(&mut ver_len).await?;
            let mut got_user = vec![0u8; ver_len[1] as usize];
            client.read_exact(&mut got_user).await?;
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).await?;
            let mut got_pass = vec![0u8; plen[0] as usize];
            client.read_exact(&mut got_pass).await?;
            let ok = got_user == user.as_bytes() && got_pass == pass.as_bytes();
            client.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Ok(());
            }
        }
        None => {
            if !methods.contains(&0x00) {
                client.write_all(&[0x05, 0xff]).await?;
                return Ok(());
            }
            client.write_all(&[0x05, 0x00]).await?;
        }
    }

    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    let host = match req[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    match TcpStream::connect((host.as_str(), port)).await {
        Ok(mut upstream) => {
            client.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        Err(_) => {
            client.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        }
    }
    Ok(())
}

/// SOCKS4 代理；`reply` 非 0x5a 时拒绝请求
pub async fn spawn_socks4_proxy(reply: u8) -> Mock {
    spawn_listener(move |s| handle_socks4(s, reply)).await
}

async fn handle_socks4(mut client: TcpStream, reply: u8) -> std::io::Result<()> {
    let mut vn = [0u8; 1];
    client.read_exact(&mut vn).await?;
    if vn[0] != 0x04 {
        return Ok(());
    }
    let mut req = [0u8; 7];
    client.read_exact(&mut req).await?;
    // user id，以 0 结尾
    loop {
        let mut b = [0u8; 1];
        client.read_exact(&mut b).await?;
        if b[0] == 0 {
            break;
        }
    }

    let port = u16::from_be_bytes([req[1], req[2]]);
    let ip = std::net::Ipv4Addr::new(req[3], req[4], req[5], req[6]);
    if reply != 0x5a {
        client.write_all(&[0x00, reply, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    }
    let mut upstream = TcpStream::connect((ip, port)).await?;
    client.write_all(&[0x00, 0x5a, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// 接受连接但从不应答
pub async fn spawn_silent() -> Mock {
    spawn_listener(|s| async move {
        let _hold = s;
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(())
    })
    .await
}

/// 一个当前没有监听的本地端口
pub fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
