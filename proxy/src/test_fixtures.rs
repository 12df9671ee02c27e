//! Kubernetes object fixtures for the director unit tests.

use maplit::btreemap;
use slipway_k8s_api as k8s;

fn mk_meta(ns: &str, name: &str) -> k8s::ObjectMeta {
    k8s::ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub(crate) fn mk_ingress(
    ns: &str,
    name: &str,
    host: &str,
    svc: &str,
    port: &str,
    ssl_redirect: bool,
) -> k8s::Ingress {
    let mut meta = mk_meta(ns, name);
    let mut annotations = btreemap! {
        "kubernetes.io/ingress.class".to_string() => "slipway".to_string(),
    };
    if ssl_redirect {
        annotations.insert(
            "ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        );
    }
    meta.annotations = Some(annotations);

    k8s::Ingress {
        metadata: meta,
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

pub(crate) fn mk_service(
    ns: &str,
    name: &str,
    port_name: &str,
    app_protocol: Option<&str>,
) -> k8s::Service {
    k8s::Service {
        metadata: mk_meta(ns, name),
        spec: Some(k8s::ServiceSpec {
            ports: Some(vec![k8s::ServicePort {
                name: Some(port_name.to_string()),
                port: 9000,
                app_protocol: app_protocol.map(|p| p.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_endpoints(
    ns: &str,
    name: &str,
    ips: &[&str],
    port_name: &str,
    port: i32,
) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: mk_meta(ns, name),
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| k8s::EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: (port != 0).then(|| {
                vec![k8s::EndpointPort {
                    name: (!port_name.is_empty()).then(|| port_name.to_string()),
                    port,
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }]),
    }
}
