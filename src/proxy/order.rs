use super::Protocol;

const SOCKS5_PORTS: &[u16] = &[1080, 1081, 9050, 9051];
const SOCKS4_PORTS: &[u16] = &[4145, 4153, 5678];
const HTTPS_PORTS: &[u16] = &[443, 8443, 9443];
const HTTP_PORTS: &[u16] = &[8080, 3128, 8888, 8118, 808, 8000];

/// 未知协议时的尝试顺序
///
/// 纯函数，只用于缩短平均探测时间；结果永远要靠真实握手确认。
pub fn protocol_order(port: u16, has_credentials: bool) -> [Protocol; 4] {
    use Protocol::*;

    if SOCKS5_PORTS.contains(&port) {
        [Socks5, Http, Https, Socks4]
    } else if SOCKS4_PORTS.contains(&port) || (1082..=1089).contains(&port) {
        [Socks4, Socks5, Http, Https]
    } else if HTTPS_PORTS.contains(&port) {
        [Https, Http, Socks5, Socks4]
    } else if HTTP_PORTS.contains(&port) || has_credentials {
        // 只带认证的部署绝大多数是 HTTP
        [Http, Https, Socks5, Socks4]
    } else {
        [Http, Socks5, Https, Socks4]
    }
}
