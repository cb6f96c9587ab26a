use async_trait::async_trait;

use crate::common::Metadata;
use crate::error::{Error, Result};
use crate::proxy::outbound::{AnyStream, Dialer, connect_tcp};

/// Connects straight to the target. Used for private destinations.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    fn protocol(&self) -> &'static str {
        "direct"
    }

    fn addr(&self) -> String {
        "DIRECT".into()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<AnyStream> {
        let target = &metadata.address;
        log::debug!("[Direct] connecting to {}", target);
        let stream = connect_tcp(&target.host_string(), target.port, metadata.timeout)
            .await
            .map_err(|e| Error::dial(target.to_string(), e))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, ConnType, Network};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dials_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"hi").await.unwrap();
        });
        let target = Address::from_socket_addr(Network::Tcp, addr);
        let mut stream = DirectDialer
            .dial(&Metadata::new(target, ConnType::Tcp))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
