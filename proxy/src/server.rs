//! Data-plane listeners: a plaintext accept loop and a TLS accept loop,
//! both serving HTTP/1.1 and HTTP/2 with per-connection graceful
//! shutdown on drain.

use crate::Proxy;
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use rustls::ServerConfig;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves cleartext HTTP/1.1 (and h2c prior knowledge) until drained.
pub async fn serve_http(listener: TcpListener, proxy: Arc<Proxy>, drain: drain::Watch) {
    loop {
        let (stream, remote) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    continue;
                }
            },
            _ = drain.clone().signaled() => break,
        };
        let proxy = proxy.clone();
        let drain = drain.clone();
        tokio::spawn(serve_connection(stream, proxy, remote, false, drain));
    }
    tracing::debug!("HTTP listener stopped");
}

/// Terminates TLS (ALPN h2 + http/1.1) and serves the handshaken
/// connections until drained.
pub async fn serve_https(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    proxy: Arc<Proxy>,
    drain: drain::Watch,
) {
    let acceptor = TlsAcceptor::from(config);
    loop {
        let (stream, remote) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    continue;
                }
            },
            _ = drain.clone().signaled() => break,
        };
        let acceptor = acceptor.clone();
        let proxy = proxy.clone();
        let drain = drain.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => serve_connection(tls, proxy, remote, true, drain).await,
                Err(error) => {
                    tracing::debug!(%error, %remote, "TLS handshake failed");
                }
            }
        });
    }
    tracing::debug!("HTTPS listener stopped");
}

async fn serve_connection<I>(
    io: I,
    proxy: Arc<Proxy>,
    remote: SocketAddr,
    tls: bool,
    drain: drain::Watch,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req, remote, tls).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    builder.http2().timer(TokioTimer::new());

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(error) = res {
                tracing::debug!(%error, %remote, "connection closed");
            }
        }
        _ = drain.signaled() => {
            // Stop taking new requests and let in-flight ones finish; the
            // runtime bounds the overall drain with a deadline.
            conn.as_mut().graceful_shutdown();
            if let Err(error) = conn.await {
                tracing::debug!(%error, %remote, "connection closed during drain");
            }
        }
    }
}
