//! The admin plane: liveness, readiness gated on reconciler sync, the
//! metrics registry, and a JSON dump of the live indices.

use bytes::Bytes;
use http::{header::CONTENT_TYPE, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use prometheus_client::registry::Registry;
use slipway_k8s_index::{CertStore, SharedEndpointIndex, SharedIngressIndex};
use std::{convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, sync::watch};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub(crate) struct Admin {
    registry: Arc<Registry>,
    ready: Vec<watch::Receiver<bool>>,
    ingresses: SharedIngressIndex,
    endpoints: SharedEndpointIndex,
    certs: Arc<CertStore>,
}

// === impl Admin ===

impl Admin {
    pub(crate) fn new(
        registry: Arc<Registry>,
        ready: Vec<watch::Receiver<bool>>,
        ingresses: SharedIngressIndex,
        endpoints: SharedEndpointIndex,
        certs: Arc<CertStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ready,
            ingresses,
            endpoints,
            certs,
        })
    }

    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener, drain: drain::Watch) {
        loop {
            let (stream, _remote) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        tracing::warn!(%error, "admin accept failed");
                        continue;
                    }
                },
                _ = drain.clone().signaled() => break,
            };
            let admin = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let admin = admin.clone();
                    async move { Ok::<_, Infallible>(admin.handle(req)) }
                });
                if let Err(error) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(%error, "admin connection closed");
                }
            });
        }
    }

    fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/livez" => text_response(StatusCode::OK, "OK\n"),

            "/readyz" => {
                if self.ready.iter().all(|rx| *rx.borrow()) {
                    text_response(StatusCode::OK, "OK\n")
                } else {
                    text_response(StatusCode::INSUFFICIENT_STORAGE, "Not synced yet\n")
                }
            }

            "/metrics" => {
                let mut body = String::new();
                match prometheus_client::encoding::text::encode(&mut body, &self.registry) {
                    Ok(()) => {
                        let mut rsp = Response::new(Full::new(Bytes::from(body)));
                        rsp.headers_mut().insert(
                            CONTENT_TYPE,
                            http::HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE),
                        );
                        rsp
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to encode metrics");
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed\n")
                    }
                }
            }

            "/status" => self.status(),

            _ => text_response(StatusCode::NOT_FOUND, "not found\n"),
        }
    }

    /// The controller's view of the world: the flattened ingress table,
    /// the certificate index with defaults, and the endpoint sets.
    fn status(&self) -> Response<Full<Bytes>> {
        let ingresses = {
            let index = self.ingresses.read();
            serde_json::to_value(index.routes())
        };
        let ingresses = match ingresses {
            Ok(v) => v,
            Err(error) => {
                tracing::error!(%error, "error serving status");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "{\"error\": \"status failed, see logs\"}\n",
                );
            }
        };

        let status = serde_json::json!({
            "ingresses": ingresses,
            "certs": self.certs.to_status(),
            "endpoints": self.endpoints.read().to_status(),
        });

        let mut rsp = Response::new(Full::new(Bytes::from(status.to_string())));
        rsp.headers_mut().insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        rsp
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *rsp.status_mut() = status;
    rsp
}
