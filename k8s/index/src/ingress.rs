//! Translates Ingress resources into the routing table and registers
//! their TLS references with the certificate store.

use crate::{processor::IndexResource, CertStore, ClusterInfo};
use anyhow::Result;
use parking_lot::RwLock;
use slipway_core::{
    route::{IngressRecord, PathMatch, PathRule, RouteTable},
    IngressRef, SecretRef, ServiceRef,
};
use slipway_k8s_api::{self as k8s, ResourceExt};
use std::sync::Arc;

const CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const SSL_REDIRECT_ANNOTATION: &str = "ingress.kubernetes.io/ssl-redirect";
const PRIORITY_ANNOTATION: &str = "ingress.kubernetes.io/priority";

pub type SharedIngressIndex = Arc<RwLock<IngressIndex>>;

/// Host → rule-table index, maintained by the ingress reconciler.
#[derive(Debug)]
pub struct IngressIndex {
    cluster: Arc<ClusterInfo>,
    routes: RouteTable,
    certs: Arc<CertStore>,
}

// === impl IngressIndex ===

impl IngressIndex {
    pub fn shared(cluster: Arc<ClusterInfo>, certs: Arc<CertStore>) -> SharedIngressIndex {
        Arc::new(RwLock::new(Self {
            cluster,
            routes: RouteTable::default(),
            certs,
        }))
    }

    /// The live routing table; called under the index read lock on the
    /// request hot path.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn ours(&self, ing: &k8s::Ingress) -> bool {
        // The annotation takes precedence; the spec field is the fallback.
        let class = ing
            .annotations()
            .get(CLASS_ANNOTATION)
            .cloned()
            .or_else(|| ing.spec.as_ref()?.ingress_class_name.clone())
            .unwrap_or_default();
        self.cluster.matches_class(&class)
    }
}

impl IndexResource<k8s::Ingress> for IngressIndex {
    fn apply(&mut self, ing: k8s::Ingress) -> Result<()> {
        let ingress = IngressRef::new(ing.namespace().unwrap_or_default(), ing.name_any());

        if !self.ours(&ing) {
            // The class may have been changed away from us; drop whatever
            // we previously held for this ingress.
            self.routes.delete(&ingress);
            self.certs.remove_ingress(&ingress);
            return Ok(());
        }

        tracing::info!(%ingress, "indexing ingress");

        let priority = ing.annotations().get(PRIORITY_ANNOTATION).and_then(|v| {
            v.parse::<i32>()
                .map_err(|error| tracing::warn!(%ingress, %v, %error, "ignoring bad priority"))
                .ok()
        });

        let redirect = ing
            .annotations()
            .get(SSL_REDIRECT_ANNOTATION)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(self.cluster.redirect_http_to_https);

        let spec = ing.spec.unwrap_or_default();

        let default_backend = spec
            .default_backend
            .as_ref()
            .and_then(|b| backend_service_ref(&ingress.namespace, b));

        let mut records = Vec::new();
        for rule in spec.rules.iter().flatten() {
            let host = rule.host.clone().unwrap_or_default();
            let mut record = IngressRecord {
                ingress: ingress.clone(),
                priority,
                default_backend: default_backend.clone(),
                redirect_http_to_https: redirect,
                rules: Vec::new(),
            };

            let paths = rule.http.as_ref().map(|http| &http.paths[..]).unwrap_or(&[]);
            for (idx, p) in paths.iter().enumerate() {
                let Some(backend) = backend_service_ref(&ingress.namespace, &p.backend) else {
                    tracing::warn!(%ingress, rule = idx, "path has no service backend; dropping");
                    continue;
                };
                let path = match compile_path(p) {
                    Ok(path) => path,
                    Err(error) => {
                        tracing::warn!(%ingress, rule = idx, %error, "dropping rule");
                        continue;
                    }
                };
                record.rules.push(PathRule {
                    host: host.clone(),
                    path,
                    backend,
                });
            }

            records.push((host, record));
        }

        // Register TLS references, defaulting an entry's empty host list to
        // the union of the rule hosts. All of the ingress's (host, secret)
        // pairs go in one call so entries from one TLS block don't evict
        // another's.
        let rule_hosts: Vec<String> = records
            .iter()
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, _)| h.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut tls_hosts = Vec::new();
        for tls in spec.tls.iter().flatten() {
            let Some(name) = tls.secret_name.clone() else {
                continue;
            };
            let secret = SecretRef::new(&ingress.namespace, name);
            let hosts = match &tls.hosts {
                Some(hosts) if !hosts.is_empty() => hosts.clone(),
                _ => rule_hosts.clone(),
            };
            for host in hosts {
                tls_hosts.push((host, secret.clone()));
            }
        }
        self.certs.update_ingress(&ingress, tls_hosts);

        self.routes.apply(&ingress, records);
        Ok(())
    }

    fn delete(&mut self, namespace: String, name: String) -> Result<()> {
        let ingress = IngressRef::new(namespace, name);
        tracing::info!(%ingress, "removing ingress");
        self.routes.delete(&ingress);
        self.certs.remove_ingress(&ingress);
        Ok(())
    }
}

/// Resolves an ingress backend to a service reference. Numeric ports are
/// carried as their decimal string, under which the endpoint pool also
/// indexes each subset port.
fn backend_service_ref(namespace: &str, backend: &k8s::IngressBackend) -> Option<ServiceRef> {
    let svc = backend.service.as_ref()?;
    let port = match &svc.port {
        Some(p) => match (&p.name, p.number) {
            (Some(name), _) => name.clone(),
            (None, Some(number)) => number.to_string(),
            (None, None) => String::new(),
        },
        None => String::new(),
    };
    Some(ServiceRef::new(namespace, &svc.name, port))
}

/// Builds the matcher for one ingress path, per the declared path type.
fn compile_path(p: &k8s::HTTPIngressPath) -> Result<PathMatch> {
    let path = p.path.as_deref().unwrap_or_default();
    match p.path_type.as_str() {
        "Prefix" => Ok(PathMatch::prefix(path)),
        "Exact" => Ok(PathMatch::exact(path)),
        "ImplementationSpecific" | "re" => PathMatch::regex(path),
        // An unset path type predates pathType: an empty path is the root
        // prefix and anything else is a legacy glob.
        _ if path.is_empty() => Ok(PathMatch::prefix("/")),
        _ => Ok(PathMatch::glob(path)),
    }
}
