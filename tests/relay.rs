mod common;

use std::sync::Arc;
use std::time::Duration;

use lite_rs::proxy::Registry;
use lite_rs::tunnel::{Client, InboundServer, Proxy, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start_proxy(link: &str) -> (Arc<Proxy>, std::net::SocketAddr, tokio::task::JoinHandle<lite_rs::Result<()>>) {
    let registry = Registry::with_defaults();
    let client = Client::new(registry.create(link).unwrap(), Duration::from_secs(2));
    let inbound = InboundServer::bind("127.0.0.1:0").await.unwrap();
    let listen = inbound.local_addr();
    let proxy = Arc::new(Proxy::new(vec![inbound as Arc<dyn Server>], client));
    let runner = proxy.clone();
    let task = tokio::spawn(async move { runner.run().await });
    (proxy, listen, task)
}

#[tokio::test]
async fn socks5_through_shadowsocks() {
    let upstream = common::ss_server(|target, conn| async move {
        assert_eq!(target.to_string(), "echo.test:7");
        common::echo(conn).await
    })
    .await;
    let (proxy, listen, task) = start_proxy(&common::ss_link(upstream, "up")).await;

    let mut conn = common::socks_connect(listen, "echo.test", 7).await;
    conn.write_all(b"hello relay").await.unwrap();
    let mut buf = [0u8; 11];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello relay");
    drop(conn);

    tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.traffic().uplink() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(proxy.traffic().uplink(), 11);
    assert_eq!(proxy.traffic().downlink(), 11);

    proxy.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn http_connect_through_shadowsocks() {
    let upstream = common::ss_server(|_, conn| common::echo(conn)).await;
    let (proxy, listen, task) = start_proxy(&common::ss_link(upstream, "up")).await;

    let mut conn = TcpStream::connect(listen).await.unwrap();
    conn.write_all(b"CONNECT echo.test:443 HTTP/1.1\r\nHost: echo.test:443\r\n\r\n")
        .await
        .unwrap();
    let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut head = vec![0u8; expected.len()];
    conn.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, expected);

    conn.write_all(b"tunnel").await.unwrap();
    let mut buf = [0u8; 6];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel");

    proxy.close();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_upstream_closes_inbound() {
    let dead = common::closed_port().await;
    let (proxy, listen, task) = start_proxy(&common::ss_link(dead, "gone")).await;

    let mut conn = common::socks_connect(listen, "example.com", 80).await;
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    proxy.close();
    task.await.unwrap().unwrap();
}
