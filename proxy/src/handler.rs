//! The single entry point for every data-plane request: route, rewrite,
//! forward, and map failures onto 404/502/301 responses.

use crate::{
    director::{Director, Reject},
    metrics::ProxyMetrics,
    transport::Transports,
};
use bytes::Bytes;
use http::{
    header::{
        HeaderName, HeaderValue, ALT_SVC, CONNECTION, HOST, LOCATION, PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, USER_AGENT,
    },
    Request, Response, StatusCode,
};
use http_body_util::{combinators::BoxBody as BoxBodyCombinator, BodyExt, Empty};
use hyper::{body::Incoming, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use std::{net::SocketAddr, sync::Arc, time::Instant};

pub(crate) type BoxBody = BoxBodyCombinator<Bytes, hyper::Error>;

pub struct Proxy {
    director: Director,
    transports: Transports,
    metrics: ProxyMetrics,
    alt_svc: Option<HeaderValue>,
}

// === impl Proxy ===

impl Proxy {
    /// `http3_port`, when set, advertises HTTP/3 on that UDP port via
    /// `Alt-Svc` on every response.
    pub fn new(
        director: Director,
        transports: Transports,
        metrics: ProxyMetrics,
        http3_port: Option<u16>,
    ) -> Arc<Self> {
        let alt_svc = http3_port
            .and_then(|port| HeaderValue::from_str(&format!("h3=\":{port}\"; ma=2592000")).ok());
        Arc::new(Self {
            director,
            transports,
            metrics,
            alt_svc,
        })
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        tls: bool,
    ) -> Response<BoxBody> {
        let start = Instant::now();
        let method = req.method().clone();
        let authority = request_authority(&req);
        let host = strip_port(&authority).to_string();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut rsp = match self.director.direct(&host, &authority, &path_and_query, tls) {
            Ok(target) => self.forward(req, target, remote, tls).await,
            Err(Reject::Redirect(dest)) => redirect_response(&dest),
            Err(Reject::NotFound) => {
                tracing::debug!(%host, path = %path_and_query, "no rule matches");
                status_response(StatusCode::NOT_FOUND)
            }
            Err(reject @ Reject::NoEndpoints(_)) => {
                tracing::warn!(%reject, "refusing request");
                status_response(StatusCode::BAD_GATEWAY)
            }
        };

        if let Some(alt_svc) = &self.alt_svc {
            rsp.headers_mut().insert(ALT_SVC, alt_svc.clone());
        }

        let elapsed = start.elapsed();
        self.metrics.observe(rsp.status(), elapsed);
        tracing::debug!(
            %method,
            %host,
            path = %path_and_query,
            status = rsp.status().as_u16(),
            ?elapsed,
            "request"
        );
        rsp
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: crate::Target,
        remote: SocketAddr,
        tls: bool,
    ) -> Response<BoxBody> {
        let upgrading = prepare_upstream(&mut req, remote, tls);
        // The client-side upgrade handle must be taken before the request
        // moves into the transport.
        let client_upgrade = upgrading.as_ref().map(|_| hyper::upgrade::on(&mut req));

        match self.transports.send(target.scheme, &target.authority, req).await {
            Ok(mut rsp) => {
                if rsp.status() == StatusCode::SWITCHING_PROTOCOLS {
                    let Some(client_on) = client_upgrade else {
                        self.metrics.upstream_errors.inc();
                        tracing::warn!(authority = %target.authority, "unsolicited 101 from upstream");
                        return status_response(StatusCode::BAD_GATEWAY);
                    };
                    let server_on = hyper::upgrade::on(&mut rsp);
                    tokio::spawn(tunnel(client_on, server_on));
                }
                rsp.map(|body| body.boxed())
            }
            Err(error) => {
                // The client going away mid-request is not a backend
                // failure: no 502, no error count.
                if is_client_cancellation(&error) {
                    tracing::debug!(%error, authority = %target.authority, "client cancelled");
                    return status_response(client_closed_request());
                }
                self.metrics.upstream_errors.inc();
                tracing::warn!(%error, authority = %target.authority, "proxy backend error");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// Whether a failed upstream exchange traces back to the client going
/// away rather than the backend misbehaving.
fn is_client_cancellation(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<hyper::Error>() {
            if e.is_canceled() || e.is_body_write_aborted() {
                return true;
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
    }
    false
}

/// Nginx's non-standard 499: the client is gone, so the status is never
/// written to the wire; it only keeps the request out of the 502 counts.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY)
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").finish_non_exhaustive()
    }
}

/// Copies bytes between the two upgraded streams until either side
/// closes. Runs detached; the 101 response has already been relayed.
async fn tunnel(client_on: OnUpgrade, server_on: OnUpgrade) {
    match tokio::try_join!(client_on, server_on) {
        Ok((client_io, server_io)) => {
            let mut client_io = TokioIo::new(client_io);
            let mut server_io = TokioIo::new(server_io);
            if let Err(error) =
                tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await
            {
                tracing::debug!(%error, "upgraded tunnel closed");
            }
        }
        Err(error) => {
            tracing::warn!(%error, "upgrade failed");
        }
    }
}

/// Strips hop-by-hop headers, stamps forwarding headers, and suppresses
/// the default User-Agent. Returns the upgrade protocol when the client
/// asked to switch.
fn prepare_upstream(
    req: &mut Request<Incoming>,
    remote: SocketAddr,
    tls: bool,
) -> Option<HeaderValue> {
    let headers = req.headers_mut();

    let wants_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    let upgrading = if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    };

    // Headers named by Connection are connection-scoped, then the
    // standard hop-by-hop set.
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();
    for name in named {
        headers.remove(&name);
    }
    for name in [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(&name);
    }
    for name in ["keep-alive", "proxy-connection"] {
        headers.remove(name);
    }

    if let Some(protocol) = &upgrading {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, protocol.clone());
    }

    let client_ip = remote.ip().to_string();
    let xff = HeaderName::from_static("x-forwarded-for");
    let forwarded = match headers.get(&xff).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(xff, value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );

    if !headers.contains_key(USER_AGENT) {
        // Explicitly empty so the upstream client doesn't inject its own.
        headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }

    upgrading
}

fn request_authority<B>(req: &Request<B>) -> String {
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        return host.to_string();
    }
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default()
}

/// Drops a `:port` suffix, leaving bracketed IPv6 hosts intact.
fn strip_port(authority: &str) -> &str {
    if let Some(end) = authority.rfind(']') {
        return &authority[..=end];
    }
    authority
        .split_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}

pub(crate) fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn status_response(status: StatusCode) -> Response<BoxBody> {
    let mut rsp = Response::new(empty_body());
    *rsp.status_mut() = status;
    rsp
}

fn redirect_response(dest: &str) -> Response<BoxBody> {
    match HeaderValue::from_str(dest) {
        Ok(location) => {
            let mut rsp = status_response(StatusCode::MOVED_PERMANENTLY);
            rsp.headers_mut().insert(LOCATION, location);
            rsp
        }
        Err(error) => {
            tracing::warn!(%error, dest, "unusable redirect destination");
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}
