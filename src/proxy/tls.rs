use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, Certificate, OwnedTrustAnchor, RootCertStore, ServerName,
        client::{ClientSessionMemoryCache, Resumption, ServerCertVerified, ServerCertVerifier},
    },
};
use webpki_roots::TLS_SERVER_ROOTS;

const SESSION_CACHE_SIZE: usize = 128;

/// Client session store shared by every TLS dialer created from one registry.
#[derive(Clone)]
pub struct TlsSessionCache {
    store: Arc<ClientSessionMemoryCache>,
}

impl Default for TlsSessionCache {
    fn default() -> Self {
        Self::new(SESSION_CACHE_SIZE)
    }
}

impl TlsSessionCache {
    pub fn new(size: usize) -> Self {
        TlsSessionCache {
            store: Arc::new(ClientSessionMemoryCache::new(size)),
        }
    }

    pub fn connector(&self, skip_cert_verify: bool, alpn: &[&str]) -> TlsConnector {
        let builder = rustls::ClientConfig::builder().with_safe_defaults();
        let mut config = if skip_cert_verify {
            builder
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(root_store())
                .with_no_client_auth()
        };
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        config.resumption = Resumption::store(self.store.clone());
        TlsConnector::from(Arc::new(config))
    }
}

pub async fn handshake<S>(connector: &TlsConnector, sni: &str, stream: S) -> io::Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(sni)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid sni {:?}", sni)))?;
    let stream = connector.connect(server_name, stream).await?;
    log::debug!("[TLS] handshake with {} done", sni);
    Ok(stream)
}

fn root_store() -> RootCertStore {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_cert_store
}

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
