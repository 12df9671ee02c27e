#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The data plane: terminates client connections (plaintext and TLS),
//! fuses the control-plane indices into one routing decision per request,
//! and streams the exchange through a pooled upstream transport.

mod director;
mod handler;
pub mod metrics;
mod server;
#[cfg(test)]
mod test_fixtures;
mod tls;
mod transport;

pub use self::{
    director::{Director, Reject, Target},
    handler::Proxy,
    metrics::ProxyMetrics,
    server::{serve_http, serve_https},
    tls::server_config,
    transport::Transports,
};
