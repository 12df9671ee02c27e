#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_openapi::{
    api::{
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service, ServicePort,
            ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString, NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ListParams, Resource, ResourceExt},
    runtime::{
        watcher,
        watcher::{Config as WatchConfig, Event as WatchEvent},
    },
    Client,
};
