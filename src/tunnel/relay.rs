use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::common::pool::BufferPool;

/// Copies both directions until either side finishes. The first half to
/// finish cancels the other half's pending read, so the pairing unwinds
/// promptly. Returns the bytes moved `(left -> right, right -> left)`.
pub async fn relay<L, R>(left: L, right: R, pool: &Arc<BufferPool>) -> io::Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_read, mut left_write) = tokio::io::split(left);
    let (mut right_read, mut right_write) = tokio::io::split(right);
    let done = CancellationToken::new();

    let upload = copy_half(&mut left_read, &mut right_write, pool, &done);
    let download = copy_half(&mut right_read, &mut left_write, pool, &done);
    let (up, down) = tokio::join!(upload, download);

    match (up, down) {
        (Ok(up), Ok(down)) => Ok((up, down)),
        (Err(e), _) | (_, Err(e)) => {
            log::debug!("[Relay] {}", e);
            Err(e)
        }
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &Arc<BufferPool>,
    done: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;
    let result = loop {
        let n = tokio::select! {
            _ = done.cancelled() => break Ok(total),
            n = reader.read(&mut buf) => n,
        };
        match n {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                if let Err(e) = writer.flush().await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    done.cancel();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn copies_both_ways_and_unwinds() {
        let (client, mut client_peer) = duplex(64);
        let (server, mut server_peer) = duplex(64);
        let pool = BufferPool::new(16, 4);
        let task = tokio::spawn(async move { relay(client, server, &pool).await });

        client_peer.write_all(b"request").await.unwrap();
        let mut got = [0u8; 7];
        server_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"request");

        server_peer.write_all(b"response!").await.unwrap();
        let mut got = [0u8; 9];
        client_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"response!");

        // the server closing ends the relay even though the client stays open
        drop(server_peer);
        let (up, down) = task.await.unwrap().unwrap();
        assert_eq!((up, down), (7, 9));
    }
}
