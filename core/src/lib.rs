#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod refs;
pub mod route;

pub use self::refs::{Endpoint, IngressRef, SecretRef, ServiceRef};
pub use self::route::{IngressRecord, PathMatch, PathRule, RouteMatch, RouteTable};

/// Upstream application protocol for a service port, as learned from the
/// service registry. Determines which transport the proxy dials with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Http,
    /// HTTP/2 over cleartext (prior knowledge).
    Http2,
    Https,
}

impl UpstreamScheme {
    /// Maps an `appProtocol` token to a scheme. Unrecognized tokens fall
    /// back to plain HTTP.
    pub fn from_app_protocol(proto: &str) -> Self {
        match proto {
            "HTTP" => UpstreamScheme::Http,
            "HTTP2" => UpstreamScheme::Http2,
            "HTTPS" => UpstreamScheme::Https,
            _ => UpstreamScheme::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Http2 => "http2",
            UpstreamScheme::Https => "https",
        }
    }
}

impl std::fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
