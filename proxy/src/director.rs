//! Per-request routing: one lookup across the ingress, service, and
//! endpoint indices, strictly CPU-bound against in-memory state.

use slipway_core::{ServiceRef, UpstreamScheme};
use slipway_k8s_index::{ClusterInfo, SharedEndpointIndex, SharedIngressIndex, SharedServiceIndex};
use std::sync::Arc;

/// Why a request could not be forwarded. The top-level handler maps these
/// onto responses; everything below it returns them as plain values.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Reject {
    #[error("no rule matches the request")]
    NotFound,

    #[error("no active endpoints for {0}")]
    NoEndpoints(ServiceRef),

    #[error("redirecting to {0}")]
    Redirect(String),
}

/// Where to send a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub scheme: UpstreamScheme,
    /// `host:port` of the chosen endpoint.
    pub authority: String,
}

/// Resolves requests against the shared indices.
#[derive(Clone, Debug)]
pub struct Director {
    cluster: Arc<ClusterInfo>,
    ingresses: SharedIngressIndex,
    services: SharedServiceIndex,
    endpoints: SharedEndpointIndex,
}

// === impl Director ===

impl Director {
    pub fn new(
        cluster: Arc<ClusterInfo>,
        ingresses: SharedIngressIndex,
        services: SharedServiceIndex,
        endpoints: SharedEndpointIndex,
    ) -> Self {
        Self {
            cluster,
            ingresses,
            services,
            endpoints,
        }
    }

    /// Maps a request onto a backend endpoint.
    ///
    /// `host` is the request host without any port; `authority` is the
    /// host exactly as the client sent it, used to build redirect
    /// destinations; `tls` says whether the request arrived encrypted.
    pub fn direct(
        &self,
        host: &str,
        authority: &str,
        path_and_query: &str,
        tls: bool,
    ) -> Result<Target, Reject> {
        let path = path_and_query
            .split_once('?')
            .map(|(p, _)| p)
            .unwrap_or(path_and_query);

        let backend = {
            let index = self.ingresses.read();
            match index.routes().lookup(host, path) {
                Some(m) => {
                    if m.record.redirect_http_to_https && !tls {
                        return Err(Reject::Redirect(format!("https://{authority}{path_and_query}")));
                    }
                    m.backend.clone()
                }
                // The cluster-wide default backend picks up requests no
                // rule claims.
                None => self
                    .cluster
                    .default_backend
                    .clone()
                    .ok_or(Reject::NotFound)?,
            }
        };

        let scheme = self.services.read().scheme_for(&backend);

        let endpoint = self
            .endpoints
            .read()
            .next_endpoint(&backend)
            .ok_or_else(|| Reject::NoEndpoints(backend.clone()))?;

        // A portless endpoint leaves the port to the scheme's default.
        let authority = if endpoint.port == 0 {
            if endpoint.addr.contains(':') {
                format!("[{}]", endpoint.addr)
            } else {
                endpoint.addr.clone()
            }
        } else {
            endpoint.authority()
        };

        Ok(Target { scheme, authority })
    }
}
