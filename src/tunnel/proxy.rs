use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::relay::relay;
use super::worker_pool::{DEFAULT_MAX_IDLE, DEFAULT_MAX_WORKERS, WorkerPool};
use super::{Client, InboundConn, Server};
use crate::common::net::is_private_address;
use crate::common::pool::BufferPool;
use crate::download::Counter;
use crate::error::Result;
use crate::proxy::direct::DirectDialer;
use crate::proxy::{AnyStream, Dialer};

/// Forwards every connection accepted by `servers` through `client`.
/// Private IP destinations bypass the upstream and are dialed directly.
pub struct Proxy {
    servers: Vec<Arc<dyn Server>>,
    pool: WorkerPool<InboundConn>,
    cancel: CancellationToken,
    traffic: Arc<Traffic>,
}

/// Bytes moved by finished relays, `up` from the inbound side.
#[derive(Debug, Default)]
pub struct Traffic {
    up: Counter,
    down: Counter,
}

impl Traffic {
    fn record(&self, up: u64, down: u64) {
        self.up.add(up as i64);
        self.down.add(down as i64);
    }

    pub fn uplink(&self) -> i64 {
        self.up.value()
    }

    pub fn downlink(&self) -> i64 {
        self.down.value()
    }
}

impl Proxy {
    pub fn new(servers: Vec<Arc<dyn Server>>, client: Client) -> Self {
        let buffers = BufferPool::relay();
        let client = Arc::new(client);
        let traffic = Arc::new(Traffic::default());
        let stats = traffic.clone();
        let pool = WorkerPool::new(DEFAULT_MAX_WORKERS, DEFAULT_MAX_IDLE, move |conn| {
            handle(conn, client.clone(), buffers.clone(), stats.clone())
        });
        Proxy {
            servers,
            pool,
            cancel: CancellationToken::new(),
            traffic,
        }
    }

    pub fn traffic(&self) -> &Traffic {
        &self.traffic
    }

    /// Runs the accept loops and returns once [`close`](Self::close) is called.
    pub async fn run(&self) -> Result<()> {
        for server in &self.servers {
            tokio::spawn(accept_loop(
                server.clone(),
                self.pool.clone(),
                self.cancel.clone(),
            ));
        }
        self.cancel.cancelled().await;
        Ok(())
    }

    pub fn close(&self) {
        self.cancel.cancel();
        for server in &self.servers {
            server.close();
        }
        self.pool.stop();
    }
}

async fn accept_loop(server: Arc<dyn Server>, pool: WorkerPool<InboundConn>, cancel: CancellationToken) {
    loop {
        let conn = match server.accept_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                if cancel.is_cancelled() {
                    log::debug!("[Proxy] exiting");
                    return;
                }
                log::error!("[Proxy] failed to accept connection: {}", e);
                continue;
            }
        };
        if let Err(conn) = pool.serve(conn) {
            log::warn!(
                "[Proxy] no free worker, dropping {}",
                conn.metadata.remote_address()
            );
        }
    }
}

async fn handle(
    conn: InboundConn,
    client: Arc<Client>,
    buffers: Arc<BufferPool>,
    traffic: Arc<Traffic>,
) {
    let InboundConn {
        stream: inbound,
        metadata,
        ..
    } = conn;
    let start = Instant::now();
    let outbound: Result<AnyStream> = match metadata.address.ip() {
        Some(ip) if is_private_address(ip) => {
            DirectDialer
                .dial(&metadata.clone().with_timeout(client.timeout()))
                .await
        }
        _ => client.dial_conn(&metadata).await,
    };
    let outbound = match outbound {
        Ok(s) => s,
        Err(e) => {
            log::error!("[Proxy] failed to dial {}: {}", metadata.address, e);
            return;
        }
    };
    log::debug!(
        "[Proxy] connect to {} {}ms",
        metadata.address,
        start.elapsed().as_millis()
    );
    match relay(inbound, outbound, &buffers).await {
        Ok((up, down)) => {
            traffic.record(up, down);
            log::debug!(
                "[Proxy] {} closed, up {} down {}",
                metadata.address,
                up,
                down
            );
        }
        Err(e) => log::debug!("[Proxy] relay {} ended: {}", metadata.address, e),
    }
}
