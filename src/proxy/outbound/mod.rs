pub mod http;
pub mod socks4;
pub mod socks5;

pub use http::HttpHandshaker;
pub use socks4::Socks4Handshaker;
pub use socks5::Socks5Handshaker;
