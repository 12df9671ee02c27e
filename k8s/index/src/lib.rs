#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The control plane: four reconcilers translate Ingress, Service,
//! Endpoints, and Secret watches into reader-writer-locked in-memory
//! indices that the data plane consults on every request.

mod cluster_info;
pub mod endpoints;
pub mod ingress;
pub mod metrics;
pub mod processor;
pub mod secrets;
pub mod service;


pub use self::{
    cluster_info::ClusterInfo,
    endpoints::{EndpointIndex, SharedEndpointIndex},
    ingress::{IngressIndex, SharedIngressIndex},
    processor::IndexResource,
    secrets::{Cert, CertStore, SecretIndex},
    service::{ServiceIndex, SharedServiceIndex},
};
