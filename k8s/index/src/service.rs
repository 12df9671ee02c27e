//! Service registry: observes Service objects to learn the upstream
//! application protocol for each named port.

use crate::processor::IndexResource;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::RwLock;
use slipway_core::{ServiceRef, UpstreamScheme};
use slipway_k8s_api::{self as k8s, ResourceExt};
use std::sync::Arc;

/// JSON object mapping port name → protocol token, e.g.
/// `{"grpc-port": "HTTP2"}`. Per-port `appProtocol` fields override it.
const APP_PROTOCOL_ANNOTATION: &str = "service.alpha.kubernetes.io/app-protocol";

pub type SharedServiceIndex = Arc<RwLock<ServiceIndex>>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct ServiceKey {
    namespace: String,
    name: String,
}

#[derive(Debug, Default)]
pub struct ServiceIndex {
    set: HashMap<ServiceKey, HashMap<String, UpstreamScheme>>,
}

// === impl ServiceIndex ===

impl ServiceIndex {
    pub fn shared() -> SharedServiceIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// The upstream scheme for a backend's port; unknown services and
    /// ports dial plain HTTP.
    pub fn scheme_for(&self, backend: &ServiceRef) -> UpstreamScheme {
        let key = ServiceKey {
            namespace: backend.namespace.clone(),
            name: backend.name.clone(),
        };
        self.set
            .get(&key)
            .and_then(|ports| ports.get(&backend.port))
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl IndexResource<k8s::Service> for ServiceIndex {
    fn apply(&mut self, svc: k8s::Service) -> Result<()> {
        let key = ServiceKey {
            namespace: svc.namespace().unwrap_or_default(),
            name: svc.name_any(),
        };
        tracing::debug!(namespace = %key.namespace, name = %key.name, "indexing service");

        let mut protos: HashMap<String, String> = HashMap::new();
        if let Some(raw) = svc.annotations().get(APP_PROTOCOL_ANNOTATION) {
            match serde_json::from_str::<HashMap<String, String>>(raw) {
                Ok(parsed) => protos = parsed,
                Err(error) => {
                    tracing::debug!(namespace = %key.namespace, name = %key.name, %error,
                        "ignoring unparseable app-protocol annotation");
                }
            }
        }

        let ports = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();
        for port in ports {
            if let Some(proto) = &port.app_protocol {
                protos.insert(port.name.clone().unwrap_or_default(), proto.clone());
            }
        }

        // Key schemes under both the port name and the port number so that
        // numeric ingress backends pick up the protocol too.
        let mut schemes: HashMap<String, UpstreamScheme> = HashMap::new();
        for port in ports {
            let name = port.name.clone().unwrap_or_default();
            let scheme = protos
                .get(&name)
                .map(|p| UpstreamScheme::from_app_protocol(p))
                .unwrap_or_default();
            if !name.is_empty() {
                schemes.insert(name, scheme);
            }
            schemes.insert(port.port.to_string(), scheme);
        }

        self.set.insert(key, schemes);
        Ok(())
    }

    fn delete(&mut self, namespace: String, name: String) -> Result<()> {
        tracing::debug!(%namespace, %name, "removing service");
        self.set.remove(&ServiceKey { namespace, name });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mk_service;

    #[test]
    fn annotation_sets_scheme() {
        let mut index = ServiceIndex::default();
        index
            .apply(mk_service(
                "default",
                "first",
                Some(r#"{"mysvc":"HTTP"}"#),
                &[("mysvc", 9000, None)],
            ))
            .expect("apply");

        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "mysvc")),
            UpstreamScheme::Http
        );
    }

    #[test]
    fn app_protocol_field_overrides_annotation() {
        let mut index = ServiceIndex::default();
        index
            .apply(mk_service(
                "default",
                "first",
                Some(r#"{"mysvc":"HTTP"}"#),
                &[("mysvc", 9000, Some("HTTP2"))],
            ))
            .expect("apply");

        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "mysvc")),
            UpstreamScheme::Http2
        );
    }

    #[test]
    fn unknown_tokens_and_services_default_to_http() {
        let mut index = ServiceIndex::default();
        index
            .apply(mk_service(
                "default",
                "first",
                None,
                &[("odd", 9000, Some("SPDY"))],
            ))
            .expect("apply");

        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "odd")),
            UpstreamScheme::Http
        );
        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "absent", "x")),
            UpstreamScheme::Http
        );
    }

    #[test]
    fn https_and_numeric_port_lookup() {
        let mut index = ServiceIndex::default();
        index
            .apply(mk_service(
                "default",
                "first",
                None,
                &[("tls", 8443, Some("HTTPS"))],
            ))
            .expect("apply");

        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "tls")),
            UpstreamScheme::Https
        );
        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "8443")),
            UpstreamScheme::Https
        );
    }

    #[test]
    fn delete_forgets_the_service() {
        let mut index = ServiceIndex::default();
        index
            .apply(mk_service(
                "default",
                "first",
                None,
                &[("http", 80, Some("HTTP2"))],
            ))
            .expect("apply");
        index
            .delete("default".to_string(), "first".to_string())
            .expect("delete");

        assert_eq!(
            index.scheme_for(&ServiceRef::new("default", "first", "http")),
            UpstreamScheme::Http
        );
        assert!(index.is_empty());
    }
}
