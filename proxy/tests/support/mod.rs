//! Shared scaffolding for the end-to-end proxy tests: throwaway backends,
//! index fixtures, and a proxy instance on an ephemeral port.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::service::service_fn;
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioIo},
};
use maplit::btreemap;
use slipway_k8s_api as k8s;
use slipway_k8s_index::{
    CertStore, ClusterInfo, EndpointIndex, IndexResource, IngressIndex, ServiceIndex,
};
use slipway_proxy::{serve_http, Director, Proxy, ProxyMetrics, Transports};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

/// An HTTP/1.1 backend that answers 200 with the request path as the
/// body and echoes X-Forwarded-For into `x-echo-xff`.
pub async fn spawn_http1_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo_path))
                    .await;
            });
        }
    });
    addr
}

/// An HTTP/2 prior-knowledge (cleartext) backend with the same behavior.
pub async fn spawn_h2c_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service_fn(echo_path))
                    .await;
            });
        }
    });
    addr
}

async fn echo_path(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let xff = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = req.uri().path().to_string();
    let rsp = Response::builder()
        .status(StatusCode::OK)
        .header("x-echo-xff", xff)
        .body(Full::new(Bytes::from(body)))
        .expect("response");
    Ok(rsp)
}

/// An HTTP/1.1 backend that accepts `Upgrade: echo` and echoes raw bytes
/// on the upgraded stream.
pub async fn spawn_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<hyper::body::Incoming>| async move {
                    if !req.headers().contains_key(http::header::UPGRADE) {
                        return Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .body(Empty::<Bytes>::new().boxed())
                                .expect("response"),
                        );
                    }
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let Ok(upgraded) = on_upgrade.await else {
                            return;
                        };
                        let mut io = TokioIo::new(upgraded);
                        let mut buf = [0u8; 1024];
                        loop {
                            use tokio::io::{AsyncReadExt, AsyncWriteExt};
                            match io.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => {
                                    if io.write_all(&buf[..n]).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    });
                    Ok(Response::builder()
                        .status(StatusCode::SWITCHING_PROTOCOLS)
                        .header(http::header::UPGRADE, "echo")
                        .header(http::header::CONNECTION, "Upgrade")
                        .body(Empty::<Bytes>::new().boxed())
                        .expect("response"))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

pub fn mk_ingress(host: &str, svc: &str, port: &str, ssl_redirect: bool) -> k8s::Ingress {
    let mut annotations = btreemap! {
        "kubernetes.io/ingress.class".to_string() => "slipway".to_string(),
    };
    if ssl_redirect {
        annotations.insert(
            "ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        );
    }
    k8s::Ingress {
        metadata: k8s::ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(format!("{svc}-ingress")),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(k8s::IngressSpec {
            rules: Some(vec![k8s::IngressRule {
                host: Some(host.to_string()),
                http: Some(k8s::HTTPIngressRuleValue {
                    paths: vec![k8s::HTTPIngressPath {
                        backend: k8s::IngressBackend {
                            service: Some(k8s::IngressServiceBackend {
                                name: svc.to_string(),
                                port: Some(k8s::ServiceBackendPort {
                                    name: Some(port.to_string()),
                                    number: None,
                                }),
                            }),
                            resource: None,
                        },
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_service(name: &str, port: &str, app_protocol: &str) -> k8s::Service {
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports: Some(vec![k8s::ServicePort {
                name: Some(port.to_string()),
                port: 80,
                app_protocol: Some(app_protocol.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_endpoints(name: &str, port: &str, backend: SocketAddr) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: k8s::ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(vec![k8s::EndpointAddress {
                ip: backend.ip().to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![k8s::EndpointPort {
                name: Some(port.to_string()),
                port: i32::from(backend.port()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// Builds the indices from the given objects and serves a plaintext proxy
/// on an ephemeral port. The returned signal keeps the listener alive.
pub async fn spawn_proxy(
    ingresses: Vec<k8s::Ingress>,
    services: Vec<k8s::Service>,
    endpoints: Vec<k8s::Endpoints>,
) -> (SocketAddr, drain::Signal) {
    let cluster = Arc::new(ClusterInfo {
        ingress_class: "slipway".to_string(),
        ..Default::default()
    });
    let certs = CertStore::new(vec![], None);
    let ingress_index = IngressIndex::shared(cluster.clone(), certs.clone());
    let service_index = ServiceIndex::shared();
    let endpoint_index = EndpointIndex::shared();

    for ing in ingresses {
        ingress_index.write().apply(ing).expect("apply ingress");
    }
    for svc in services {
        service_index.write().apply(svc).expect("apply service");
    }
    for eps in endpoints {
        endpoint_index.write().apply(eps).expect("apply endpoints");
    }

    let director = Director::new(cluster, ingress_index, service_index, endpoint_index);
    let proxy = Proxy::new(
        director,
        Transports::new(certs),
        ProxyMetrics::unregistered(),
        None,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (signal, watch) = drain::channel();
    tokio::spawn(serve_http(listener, proxy, watch));
    (addr, signal)
}

/// Issues one GET through the proxy with the given Host header.
pub async fn get(
    proxy: SocketAddr,
    host: &str,
    path: &str,
) -> (StatusCode, http::HeaderMap, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let req = Request::builder()
        .uri(format!("http://{proxy}{path}"))
        .header(http::header::HOST, host)
        .body(Empty::new())
        .expect("request");
    let rsp = client.request(req).await.expect("response");
    let (parts, body) = rsp.into_parts();
    let body = body.collect().await.expect("body").to_bytes();
    (
        parts.status,
        parts.headers,
        String::from_utf8_lossy(&body).to_string(),
    )
}
