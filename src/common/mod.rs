pub mod addr;
pub mod dialer;
pub mod error;
pub mod stream;
pub mod tls;

pub use addr::{ParsedProxy, TargetUrl};
pub use dialer::{Dialer, DialerConfig};
pub use error::{ErrorCode, ProbeError, ProbeErrorKind};
pub use stream::{with_deadline, PrefixedStream, ProxyStream};
