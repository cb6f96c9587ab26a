mod common;

use std::time::Duration;

use lite_rs::common::{Address, ConnType, Metadata, Network};
use lite_rs::proxy::shadowsocks::{ShadowsocksDialer, ShadowsocksOption};
use lite_rs::proxy::{Dialer, Registry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

#[tokio::test]
async fn aes_256_gcm_round_trip() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = std::sync::Mutex::new(Some(seen_tx));
    let server = common::ss_server(move |target, conn| {
        if let Some(tx) = seen_tx.lock().unwrap().take() {
            let _ = tx.send(target);
        }
        common::echo(conn)
    })
    .await;

    let dialer = ShadowsocksDialer::new(ShadowsocksOption {
        server: "127.0.0.1".into(),
        port: server.port(),
        cipher: "aes-256-gcm".into(),
        password: "test".into(),
        ..Default::default()
    })
    .unwrap();
    let target = Address::parse(Network::Tcp, "example.com", 80).unwrap();
    let metadata = Metadata::new(target.clone(), ConnType::Tcp).with_timeout(Duration::from_secs(2));
    let mut conn = dialer.dial(&metadata).await.unwrap();

    conn.write_all(b"ping").await.unwrap();
    conn.flush().await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(seen_rx.await.unwrap(), target);
}

#[tokio::test]
async fn large_writes_are_chunked() {
    let server = common::ss_server(|_, conn| common::echo(conn)).await;
    let registry = Registry::with_defaults();
    let dialer = registry.create(&common::ss_link(server, "bulk")).unwrap();
    let metadata = Metadata::new(
        Address::parse(Network::Tcp, "example.com", 443).unwrap(),
        ConnType::Tcp,
    );
    let mut conn = dialer.dial(&metadata).await.unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let (mut rd, mut wr) = tokio::io::split(conn.as_mut());
    let write = async {
        wr.write_all(&payload).await.unwrap();
        wr.flush().await.unwrap();
    };
    let read = async {
        let mut got = vec![0u8; expected.len()];
        rd.read_exact(&mut got).await.unwrap();
        got
    };
    let ((), got) = tokio::join!(write, read);
    assert_eq!(got, expected);
}

#[tokio::test]
async fn closed_port_is_a_dial_error() {
    let registry = Registry::with_defaults();
    let dialer = registry
        .create(&common::ss_link(common::closed_port().await, "gone"))
        .unwrap();
    let metadata = Metadata::new(
        Address::parse(Network::Tcp, "example.com", 80).unwrap(),
        ConnType::Tcp,
    );
    match dialer.dial(&metadata).await {
        Err(lite_rs::Error::Dial { addr, .. }) => assert!(addr.starts_with("127.0.0.1:")),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("dial to a closed port succeeded"),
    }
}
