//! Control-plane metrics: per-kind reconciler counters and gauges over
//! the live index sizes.

use crate::{CertStore, SharedEndpointIndex, SharedIngressIndex, SharedServiceIndex};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{counter::Counter, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{borrow::Cow, sync::Arc};

/// Counters owned by one reconciler loop.
#[derive(Clone, Debug, Default)]
pub struct ProcessorMetrics {
    pub events: Counter,
    pub errors: Counter,
    pub giveups: Counter,
}

// === impl ProcessorMetrics ===

impl ProcessorMetrics {
    pub fn register(reg: &mut Registry, kind: &'static str) -> Self {
        let metrics = Self::default();
        let reg = reg.sub_registry_with_label((Cow::Borrowed("kind"), Cow::Borrowed(kind)));
        reg.register(
            "events",
            "Watch events applied to the index",
            metrics.events.clone(),
        );
        reg.register(
            "errors",
            "Handler errors that were retried",
            metrics.errors.clone(),
        );
        reg.register(
            "giveups",
            "Handler errors dropped after the retry cap",
            metrics.giveups.clone(),
        );
        metrics
    }
}

#[derive(Debug)]
struct Instrumented {
    ingresses: SharedIngressIndex,
    endpoints: SharedEndpointIndex,
    services: SharedServiceIndex,
    certs: Arc<CertStore>,
}

pub fn register(
    reg: &mut Registry,
    ingresses: SharedIngressIndex,
    endpoints: SharedEndpointIndex,
    services: SharedServiceIndex,
    certs: Arc<CertStore>,
) {
    reg.register_collector(Box::new(Instrumented {
        ingresses,
        endpoints,
        services,
        certs,
    }));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let hosts = ConstGauge::new(self.ingresses.read().routes().len() as i64);
        hosts.encode(encoder.encode_descriptor(
            "ingress_index_hosts",
            "The number of host buckets in the ingress index",
            None,
            MetricType::Gauge,
        )?)?;

        let sets = ConstGauge::new(self.endpoints.read().len() as i64);
        sets.encode(encoder.encode_descriptor(
            "endpoint_index_sets",
            "The number of keyed endpoint sets",
            None,
            MetricType::Gauge,
        )?)?;

        let services = ConstGauge::new(self.services.read().len() as i64);
        services.encode(encoder.encode_descriptor(
            "service_index_size",
            "The number of services with known port protocols",
            None,
            MetricType::Gauge,
        )?)?;

        let certs = ConstGauge::new(self.certs.len() as i64);
        certs.encode(encoder.encode_descriptor(
            "cert_index_hosts",
            "The number of hosts with certificate entries",
            None,
            MetricType::Gauge,
        )?)?;

        Ok(())
    }
}
