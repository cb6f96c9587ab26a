use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper::client::conn;
use hyper::header::{HOST, RANGE, USER_AGENT};
use hyper::{Body, Request, Response};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::common::{Address, ConnType, Metadata, Network};
use crate::error::{Error, Result};
use crate::proxy::tls::{self, TlsSessionCache};
use crate::proxy::{AnyStream, Dialer};

const FETCH_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                                (KHTML, like Gecko) Chrome/85.0.4183.121 Safari/537.36";

pub(crate) fn hyper_error(e: hyper::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e))
}

/// Issues single HTTP/1.1 GETs whose connections come from a dialer.
#[derive(Clone)]
pub struct Fetcher {
    dialer: Arc<dyn Dialer>,
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl Fetcher {
    pub fn new(dialer: Arc<dyn Dialer>, sessions: &TlsSessionCache, handshake_timeout: Duration) -> Self {
        Fetcher {
            dialer,
            connector: sessions.connector(false, &["http/1.1"]),
            handshake_timeout,
        }
    }

    /// GET `url`, optionally with a `Range` header. Resolves once the
    /// response head arrives; the body streams afterwards.
    pub async fn get(&self, url: &str, range: Option<&str>) -> Result<Response<Body>> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("bad url {}: {}", url, e)))?;
        match tokio::time::timeout(self.handshake_timeout, self.request(&url, range)).await {
            Ok(resp) => resp,
            Err(_) => Err(Error::Timeout(format!(
                "GET {} via {} exceeded {:?}",
                url,
                self.dialer.addr(),
                self.handshake_timeout
            ))),
        }
    }

    async fn request(&self, url: &Url, range: Option<&str>) -> Result<Response<Body>> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("url {} has no host", url)))?;
        let https = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("url {} has no port", url)))?;
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let metadata = Metadata::new(Address::parse(Network::Tcp, bare, port)?, ConnType::Test)
            .with_timeout(self.handshake_timeout);

        let stream = self.dialer.dial(&metadata).await?;
        let stream: AnyStream = if https {
            Box::new(
                tls::handshake(&self.connector, bare, stream)
                    .await
                    .map_err(|e| Error::dial(self.dialer.addr(), e))?,
            )
        } else {
            stream
        };

        let (mut sender, connection) = conn::handshake(stream).await.map_err(hyper_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("[Download] connection closed: {}", e);
            }
        });

        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        let mut req = Request::get(path)
            .header(HOST, host_header)
            .header(USER_AGENT, FETCH_USER_AGENT);
        if let Some(range) = range {
            req = req.header(RANGE, range);
        }
        let req = req
            .body(Body::empty())
            .map_err(|e| Error::Config(format!("bad request for {}: {}", url, e)))?;

        let resp = sender.send_request(req).await.map_err(hyper_error)?;
        if !resp.status().is_success() {
            return Err(Error::Protocol(format!(
                "GET {} answered {}",
                url,
                resp.status()
            )));
        }
        Ok(resp)
    }
}
