use std::sync::Arc;
use std::time::Duration;

use crate::common::Metadata;
use crate::error::{Error, Result};
use crate::proxy::{AnyStream, Dialer};

/// A dialer plus the deadline applied to each connection it opens.
#[derive(Clone)]
pub struct Client {
    dialer: Arc<dyn Dialer>,
    timeout: Duration,
}

impl Client {
    pub fn new(dialer: Arc<dyn Dialer>, timeout: Duration) -> Self {
        Client { dialer, timeout }
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens a tunnel to `metadata`'s target. The whole dial, handshake
    /// included, must finish within the client timeout.
    pub async fn dial_conn(&self, metadata: &Metadata) -> Result<AnyStream> {
        let metadata = metadata.clone().with_timeout(self.timeout);
        match tokio::time::timeout(self.timeout, self.dialer.dial(&metadata)).await {
            Ok(conn) => conn,
            Err(_) => Err(Error::Timeout(format!(
                "dial {} via {} exceeded {:?}",
                metadata.remote_address(),
                self.dialer.addr(),
                self.timeout
            ))),
        }
    }
}
