//! TLS termination: an SNI-driven certificate resolver over the shared
//! certificate store.

use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use slipway_k8s_index::CertStore;
use std::sync::Arc;

/// Maps each client hello onto the best certificate the store can offer.
/// A hello without SNI still consults the default bucket.
#[derive(Debug)]
struct SniResolver {
    certs: Arc<CertStore>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = hello.server_name().unwrap_or_default().to_string();
        let schemes = hello.signature_schemes().to_vec();
        self.certs
            .resolve(&name, |cert| {
                cert.certified.key.choose_scheme(&schemes).is_some()
            })
            .map(|cert| cert.certified.clone())
    }
}

/// The server config for the HTTPS listener: certificates resolved per
/// hello, ALPN offering h2 then http/1.1.
pub fn server_config(certs: Arc<CertStore>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { certs }));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}
