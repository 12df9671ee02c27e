//! Upstream transport switch: a pooled HTTP/1.1(+TLS) client and an
//! HTTP/2 prior-knowledge client over plain TCP, selected per request by
//! the backend's upstream scheme.

use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy,
    client::legacy::connect::HttpConnector,
    rt::TokioExecutor,
};
use rustls::{client::ResolvesClientCert, sign::CertifiedKey, SignatureScheme};
use slipway_core::UpstreamScheme;
use slipway_k8s_index::CertStore;
use std::{fmt, sync::Arc, time::Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

pub struct Transports {
    http1: legacy::Client<HttpsConnector<HttpConnector>, Incoming>,
    h2c: legacy::Client<HttpConnector, Incoming>,
}

// === impl Transports ===

impl Transports {
    /// Builds the two upstream clients. HTTPS backends are dialed with a
    /// client config whose certificate resolver reads the configured
    /// client secret, so upstream mTLS follows secret rotation.
    pub fn new(certs: Arc<CertStore>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_cert_resolver(Arc::new(ClientCertResolver(certs)));

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let http1 = legacy::Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(https);

        let mut h2c_connector = HttpConnector::new();
        h2c_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let h2c = legacy::Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build(h2c_connector);

        Self { http1, h2c }
    }

    /// Rewrites the request URI onto the chosen endpoint and dispatches:
    /// `http2` dials cleartext and speaks HTTP/2 with prior knowledge,
    /// everything else rides the pooled HTTP/1.1 client (with TLS for
    /// `https`).
    pub async fn send(
        &self,
        scheme: UpstreamScheme,
        authority: &str,
        mut req: http::Request<Incoming>,
    ) -> anyhow::Result<http::Response<Incoming>> {
        let dial_scheme = match scheme {
            UpstreamScheme::Https => "https",
            UpstreamScheme::Http | UpstreamScheme::Http2 => "http",
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri = http::Uri::builder()
            .scheme(dial_scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()?;
        *req.uri_mut() = uri;

        let rsp = match scheme {
            UpstreamScheme::Http2 => self.h2c.request(req).await?,
            _ => self.http1.request(req).await?,
        };
        Ok(rsp)
    }
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}

/// Presents the configured client certificate to upstream backends; with
/// nothing configured the TLS stack proceeds without one.
#[derive(Debug)]
struct ClientCertResolver(Arc<CertStore>);

impl ResolvesClientCert for ClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.0.client_cert().map(|cert| cert.certified.clone())
    }

    fn has_certs(&self) -> bool {
        self.0.client_cert().is_some()
    }
}
