use slipway_core::ServiceRef;

/// Startup configuration shared by the reconcilers.
#[derive(Clone, Debug, Default)]
pub struct ClusterInfo {
    /// The ingress class this controller instance is responsible for. An
    /// empty class matches only ingresses that set no class at all.
    pub ingress_class: String,

    /// Cluster-wide fallback backend, used when no rule matches a request
    /// and the matched host group declares no default of its own.
    pub default_backend: Option<ServiceRef>,

    /// Process-wide default for HTTP→HTTPS redirection. Ingresses override
    /// it with the `ingress.kubernetes.io/ssl-redirect` annotation.
    pub redirect_http_to_https: bool,
}

impl ClusterInfo {
    /// Whether an ingress carrying `class` belongs to this controller.
    pub fn matches_class(&self, class: &str) -> bool {
        if self.ingress_class.is_empty() {
            class.is_empty()
        } else {
            class == self.ingress_class
        }
    }
}
