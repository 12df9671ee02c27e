//! Service endpoint pool: service-key → addresses, with round-robin
//! selection on the request hot path.

use crate::processor::IndexResource;
use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::RwLock;
use slipway_core::{Endpoint, ServiceRef};
use slipway_k8s_api::{self as k8s, ResourceExt};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub type SharedEndpointIndex = Arc<RwLock<EndpointIndex>>;

/// One service's address list plus the shared round-robin cursor. The
/// cursor starts at zero whenever the set is replaced.
#[derive(Debug, Default)]
struct EndpointSet {
    addrs: Vec<Endpoint>,
    cursor: AtomicU64,
}

#[derive(Debug, Default)]
pub struct EndpointIndex {
    set: HashMap<ServiceRef, Arc<EndpointSet>>,
}

// === impl EndpointIndex ===

impl EndpointIndex {
    pub fn shared() -> SharedEndpointIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Round-robin selection. Concurrent callers may skip or repeat an
    /// address but stay bounded by the set.
    pub fn next_endpoint(&self, key: &ServiceRef) -> Option<Endpoint> {
        let set = self.set.get(key)?;
        if set.addrs.is_empty() {
            return None;
        }
        let n = set.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        Some(set.addrs[n % set.addrs.len()].clone())
    }

    /// Number of keyed endpoint sets.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// The `/status` view: service key → address strings.
    pub fn to_status(&self) -> BTreeMap<String, Vec<String>> {
        self.set
            .iter()
            .map(|(key, set)| {
                (
                    key.to_string(),
                    set.addrs.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }

    fn clear_service(&mut self, namespace: &str, name: &str) {
        self.set
            .retain(|key, _| !(key.namespace == namespace && key.name == name));
    }
}

impl IndexResource<k8s::Endpoints> for EndpointIndex {
    fn apply(&mut self, eps: k8s::Endpoints) -> Result<()> {
        let namespace = eps.namespace().unwrap_or_default();
        let name = eps.name_any();
        tracing::debug!(%namespace, %name, "indexing endpoints");

        // Both views of this object are rebuilt from scratch and swapped in
        // together: the portless union, and one (addr, port) list per named
        // port. Each named port is additionally indexed under its decimal
        // port number so numeric ingress backends resolve too.
        let mut fresh: HashMap<ServiceRef, Vec<Endpoint>> = HashMap::new();
        let portless = ServiceRef::new(&namespace, &name, "");

        for subset in eps.subsets.iter().flatten() {
            let addrs: Vec<&k8s::EndpointAddress> = subset.addresses.iter().flatten().collect();

            for addr in &addrs {
                fresh
                    .entry(portless.clone())
                    .or_default()
                    .push(Endpoint::new(&addr.ip, 0));
            }

            for port in subset.ports.iter().flatten() {
                let port_no = u16::try_from(port.port).unwrap_or_default();
                let mut keys = vec![ServiceRef::new(&namespace, &name, port_no.to_string())];
                if let Some(port_name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                    keys.push(ServiceRef::new(&namespace, &name, port_name));
                }
                for key in keys {
                    let list = fresh.entry(key).or_default();
                    for addr in &addrs {
                        list.push(Endpoint::new(&addr.ip, port_no));
                    }
                }
            }
        }

        self.clear_service(&namespace, &name);
        for (key, addrs) in fresh {
            self.set.insert(
                key,
                Arc::new(EndpointSet {
                    addrs,
                    cursor: AtomicU64::new(0),
                }),
            );
        }
        Ok(())
    }

    fn delete(&mut self, namespace: String, name: String) -> Result<()> {
        tracing::debug!(%namespace, %name, "removing endpoints");
        self.clear_service(&namespace, &name);
        Ok(())
    }
}
