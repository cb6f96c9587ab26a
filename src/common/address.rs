use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const MAX_DOMAIN_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Ipv6(ip) => write!(f, "{}", ip),
            Host::Domain(d) => f.write_str(d),
        }
    }
}

/// Connection target. The host variant decides which of ip/domain is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: Host,
    pub port: u16,
    pub network: Network,
}

impl Address {
    /// Classifies `host`: IP literal first, domain otherwise.
    pub fn parse(network: Network, host: &str, port: u16) -> Result<Self> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        let host = match trimmed.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Host::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => Host::Ipv6(ip),
            Err(_) => {
                if host.is_empty() {
                    return Err(Error::AddressParse("empty host".into()));
                }
                if host.len() > MAX_DOMAIN_LEN {
                    return Err(Error::AddressParse(format!(
                        "domain name too long: {} bytes",
                        host.len()
                    )));
                }
                Host::Domain(host.to_string())
            }
        };
        Ok(Address {
            host,
            port,
            network,
        })
    }

    /// Parses `host:port` (`[v6]:port` for IPv6 literals).
    pub fn from_host_port(network: Network, addr: &str) -> Result<Self> {
        let (host, port) = split_host_port(addr)?;
        Self::parse(network, host, port)
    }

    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Address {
            host,
            port: addr.port(),
            network,
        }
    }

    pub fn atyp(&self) -> u8 {
        match self.host {
            Host::Ipv4(_) => ATYP_IPV4,
            Host::Domain(_) => ATYP_DOMAIN,
            Host::Ipv6(_) => ATYP_IPV6,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Host::Domain(_) => None,
        }
    }

    pub fn host_string(&self) -> String {
        self.host.to_string()
    }

    /// `ATYP | addr | port(be16)`
    pub fn write_socks(&self, buf: &mut BytesMut) {
        buf.put_u8(self.atyp());
        match &self.host {
            Host::Ipv4(ip) => buf.put_slice(&ip.octets()),
            Host::Ipv6(ip) => buf.put_slice(&ip.octets()),
            Host::Domain(d) => {
                buf.put_u8(d.len() as u8);
                buf.put_slice(d.as_bytes());
            }
        }
        buf.put_u16(self.port);
    }

    pub fn socks_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.socks_len());
        self.write_socks(&mut buf);
        buf
    }

    pub fn socks_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 1 + 4 + 2,
            Host::Ipv6(_) => 1 + 16 + 2,
            Host::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    /// Decodes a socks address from the head of `buf`, returning it and the bytes consumed.
    pub fn decode_socks(buf: &[u8], network: Network) -> Result<(Self, usize)> {
        let short = || Error::AddressParse("short socks address".into());
        let atyp = *buf.first().ok_or_else(short)?;
        let (host, offset) = match atyp {
            ATYP_IPV4 => {
                let b = buf.get(1..5).ok_or_else(short)?;
                (Host::Ipv4(Ipv4Addr::new(b[0], b[1], b[2], b[3])), 5)
            }
            ATYP_IPV6 => {
                let b = buf.get(1..17).ok_or_else(short)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                (Host::Ipv6(Ipv6Addr::from(octets)), 17)
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                if len == 0 {
                    return Err(Error::AddressParse("empty domain".into()));
                }
                let b = buf.get(2..2 + len).ok_or_else(short)?;
                let domain = String::from_utf8(b.to_vec())
                    .map_err(|_| Error::AddressParse("domain is not utf-8".into()))?;
                (Host::Domain(domain), 2 + len)
            }
            other => {
                return Err(Error::AddressParse(format!(
                    "unknown address type {}",
                    other
                )));
            }
        };
        let p = buf.get(offset..offset + 2).ok_or_else(short)?;
        let port = u16::from_be_bytes([p[0], p[1]]);
        Ok((
            Address {
                host,
                port,
                network,
            },
            offset + 2,
        ))
    }

    pub async fn read_socks<R: AsyncRead + Unpin>(reader: &mut R, network: Network) -> Result<Self> {
        let atyp = reader.read_u8().await?;
        let mut buf = vec![atyp];
        let rest = match atyp {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                buf.push(len);
                len as usize + 2
            }
            other => {
                return Err(Error::AddressParse(format!(
                    "unknown address type {}",
                    other
                )));
            }
        };
        let start = buf.len();
        buf.resize(start + rest, 0);
        reader.read_exact(&mut buf[start..]).await?;
        Self::decode_socks(&buf, network).map(|(addr, _)| addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            host => write!(f, "{}:{}", host, self.port),
        }
    }
}

pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let bad = || Error::AddressParse(format!("invalid host:port {:?}", addr));
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(bad)?;
        (&rest[..end], port)
    } else {
        let idx = addr.rfind(':').ok_or_else(bad)?;
        let host = &addr[..idx];
        if host.contains(':') {
            return Err(bad());
        }
        (host, &addr[idx + 1..])
    };
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host, port))
}

/// Who produced the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Tcp,
    Http,
    HttpConnect,
    Socks,
    Redir,
    Test,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnType::Tcp => "TCP",
            ConnType::Http => "HTTP",
            ConnType::HttpConnect => "HTTP Connect",
            ConnType::Socks => "Socks5",
            ConnType::Redir => "Redir",
            ConnType::Test => "Test",
        };
        f.write_str(s)
    }
}

/// Per-dial record of the ultimate target.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub address: Address,
    pub conn_type: ConnType,
    pub timeout: Option<Duration>,
}

impl Metadata {
    pub fn new(address: Address, conn_type: ConnType) -> Self {
        Metadata {
            address,
            conn_type,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn network(&self) -> Network {
        self.address.network
    }

    pub fn remote_address(&self) -> String {
        self.address.to_string()
    }

    pub fn encode_for_socks(&self) -> BytesMut {
        self.address.socks_bytes()
    }
}
