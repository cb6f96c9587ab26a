use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or incomplete descriptor / config file.
    #[error("config error: {0}")]
    Config(String),

    #[error("address parse error: {0}")]
    AddressParse(String),

    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    /// Connect, handshake or I/O failure while dialing through `addr`.
    #[error("{addr} connect error: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected answer from a probe target.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Error::Dial {
            addr: addr.into(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Dial { source, .. } | Error::Io(source) => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Dial { source, .. } => source,
            Error::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub(crate) fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
