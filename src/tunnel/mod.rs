//! Local relay: inbound listeners hand accepted connections to a worker
//! pool, which dials them through a [`Client`](client::Client) and pumps
//! bytes both ways.

pub mod client;
pub mod http;
pub mod inbound;
pub mod proxy;
pub mod relay;
pub mod socks5;
pub mod worker_pool;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::common::Metadata;
use crate::error::Result;
use crate::proxy::AnyStream;

pub use client::Client;
pub use inbound::InboundServer;
pub use proxy::{Proxy, Traffic};

/// A connection whose handshake is complete and whose target is known.
pub struct InboundConn {
    pub stream: AnyStream,
    pub metadata: Metadata,
    pub peer: Option<SocketAddr>,
}

#[async_trait]
pub trait Server: Send + Sync {
    /// Next ready connection. Fails once the server is closed.
    async fn accept_conn(&self) -> Result<InboundConn>;

    fn close(&self);
}
