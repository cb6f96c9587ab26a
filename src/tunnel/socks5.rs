use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Address, Network};

pub const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Server side of a no-auth SOCKS5 CONNECT. Success is answered before the
/// upstream dial, so the client starts sending right away.
pub async fn handshake<S>(client: &mut S) -> io::Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await?;
    if buf[0] != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("socks version {} not supported", buf[0]),
        ));
    }
    let mut methods = vec![0u8; buf[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "client requires authentication",
        ));
    }
    client.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 3];
    client.read_exact(&mut head).await?;
    if head[1] != CMD_CONNECT {
        reply(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("socks command {} not supported", head[1]),
        ));
    }
    let address = match Address::read_socks(client, Network::Tcp).await {
        Ok(address) => address,
        Err(e) => {
            reply(client, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(e.into());
        }
    };
    reply(client, REPLY_SUCCEEDED).await?;
    Ok(address)
}

async fn reply<S: AsyncWrite + Unpin>(client: &mut S, code: u8) -> io::Result<()> {
    client
        .write_all(&[VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    client.flush().await
}
