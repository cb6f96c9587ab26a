pub mod direct;
pub mod http;
pub mod link;
pub mod outbound;
pub mod registry;
pub mod shadowsocks;
pub mod shadowsocksr;
pub mod tls;
pub mod trojan;
pub mod vmess;
pub mod ws_wrapper;

pub use outbound::{AnyStream, Dialer, PacketConn};
pub use registry::Registry;
pub use tls::TlsSessionCache;
