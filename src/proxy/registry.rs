use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::proxy::http::HttpDialer;
use crate::proxy::link;
use crate::proxy::outbound::Dialer;
use crate::proxy::shadowsocks::ShadowsocksDialer;
use crate::proxy::shadowsocksr::ShadowsocksRDialer;
use crate::proxy::tls::TlsSessionCache;
use crate::proxy::trojan::TrojanDialer;
use crate::proxy::vmess::VmessDialer;

/// Builds a dialer from a full descriptor link.
pub type Constructor =
    Arc<dyn Fn(&str, &TlsSessionCache) -> Result<Arc<dyn Dialer>> + Send + Sync>;

/// Scheme -> dialer constructor table, plus the TLS session store every
/// dialer it builds shares.
pub struct Registry {
    constructors: RwLock<HashMap<String, Constructor>>,
    sessions: TlsSessionCache,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    /// An empty table.
    pub fn new() -> Self {
        Registry {
            constructors: RwLock::new(HashMap::new()),
            sessions: TlsSessionCache::default(),
        }
    }

    /// vmess, trojan, ss, ssr and http.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("vmess", |l, tls| {
            Ok(Arc::new(VmessDialer::new(link::parse_vmess(l)?, tls)?) as Arc<dyn Dialer>)
        });
        registry.register("trojan", |l, tls| {
            Ok(Arc::new(TrojanDialer::new(link::parse_trojan(l)?, tls)?) as Arc<dyn Dialer>)
        });
        registry.register("ss", |l, _| {
            Ok(Arc::new(ShadowsocksDialer::new(link::parse_ss(l)?)?) as Arc<dyn Dialer>)
        });
        registry.register("ssr", |l, _| {
            Ok(Arc::new(ShadowsocksRDialer::new(link::parse_ssr(l)?)?) as Arc<dyn Dialer>)
        });
        registry.register("http", |l, tls| {
            Ok(Arc::new(HttpDialer::new(link::parse_http(l)?, tls)?) as Arc<dyn Dialer>)
        });
        registry
    }

    /// Registers `constructor` for `scheme`. A later registration replaces an earlier one.
    pub fn register<F>(&self, scheme: &str, constructor: F)
    where
        F: Fn(&str, &TlsSessionCache) -> Result<Arc<dyn Dialer>> + Send + Sync + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        let mut table = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if table.insert(scheme.clone(), Arc::new(constructor)).is_some() {
            log::debug!("[Registry] constructor for {} replaced", scheme);
        }
    }

    pub fn resolve(&self, scheme: &str) -> Result<Constructor> {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))
    }

    /// Checks the link, looks up its scheme and builds the dialer.
    pub fn create(&self, link: &str) -> Result<Arc<dyn Dialer>> {
        let scheme = link::check_link(link)?;
        let constructor = self.resolve(&scheme)?;
        constructor(link.trim(), &self.sessions)
    }

    pub fn sessions(&self) -> &TlsSessionCache {
        &self.sessions
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::encode_b64;
    use crate::proxy::direct::DirectDialer;

    #[test]
    fn defaults_cover_every_protocol() {
        assert_eq!(
            Registry::with_defaults().schemes(),
            vec!["http", "ss", "ssr", "trojan", "vmess"]
        );
    }

    #[test]
    fn unknown_and_vless_fail() {
        let registry = Registry::with_defaults();
        assert!(matches!(registry.resolve("unknown"), Err(Error::UnknownScheme(_))));
        assert!(matches!(
            registry.create("vless://id@example.com:443"),
            Err(Error::UnknownScheme(_))
        ));
        assert!(matches!(registry.create("ftp://x"), Err(Error::UnknownScheme(_))));
    }

    #[test]
    fn builds_dialers_from_links() {
        let registry = Registry::with_defaults();
        let ss = format!("ss://{}@127.0.0.1:8388", encode_b64(b"aes-256-gcm:test"));
        let dialer = registry.create(&ss).unwrap();
        assert_eq!(dialer.protocol(), "ss");
        assert_eq!(dialer.addr(), "127.0.0.1:8388");

        let bad = format!("ss://{}@127.0.0.1:8388", encode_b64(b"rot13:test"));
        assert!(matches!(registry.create(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn second_registration_wins() {
        let registry = Registry::with_defaults();
        registry.register("ss", |_, _| Ok(Arc::new(DirectDialer) as Arc<dyn Dialer>));
        let ss = format!("ss://{}@127.0.0.1:8388", encode_b64(b"aes-256-gcm:test"));
        assert_eq!(registry.create(&ss).unwrap().protocol(), "direct");
        assert_eq!(registry.schemes().len(), 5);
    }
}
