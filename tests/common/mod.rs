#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use lite_rs::common::codec::{Codec, CodecStream};
use lite_rs::common::{Address, Network, encode_b64, find_bytes};
use lite_rs::proxy::shadowsocks::Cipher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub type SsConn = CodecStream<TcpStream, Box<dyn Codec>>;

pub const METHOD: &str = "aes-256-gcm";
pub const PASSWORD: &str = "test";

pub fn ss_link(addr: SocketAddr, name: &str) -> String {
    format!(
        "ss://{}@{}:{}#{}",
        encode_b64(format!("{}:{}", METHOD, PASSWORD).as_bytes()),
        addr.ip(),
        addr.port(),
        name
    )
}

/// A shadowsocks server that decodes the target address of each
/// connection and hands the rest of the stream to `handler`.
pub async fn ss_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Address, SsConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cipher = Cipher::new(METHOD, PASSWORD).unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let mut conn = CodecStream::new(tcp, cipher.stream_codec().unwrap());
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(target) = Address::read_socks(&mut conn, Network::Tcp).await {
                    handler(target, conn).await;
                }
            });
        }
    });
    addr
}

/// Echoes everything back until the client closes.
pub async fn echo(mut conn: SsConn) {
    let mut buf = vec![0u8; 4096];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if conn.write_all(&buf[..n]).await.is_err() || conn.flush().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Reads one HTTP request head.
pub async fn read_head(conn: &mut SsConn) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while find_bytes(&head, b"\r\n\r\n").is_none() {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    head
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn socks_connect(proxy: SocketAddr, host: &str, port: u16) -> TcpStream {
    let mut conn = TcpStream::connect(proxy).await.unwrap();
    conn.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    conn.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);
    let mut req = vec![5, 1, 0, 3, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&req).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);
    conn
}
