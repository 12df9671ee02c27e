//! The reconciler loop: drives one watch stream into one index, applying
//! events for a resource kind strictly serially.

use crate::metrics::ProcessorMetrics;
use ahash::AHashSet;
use anyhow::Result;
use futures::prelude::*;
use parking_lot::RwLock;
use slipway_k8s_api::{watcher, Resource, ResourceExt};
use std::{pin::pin, sync::Arc, time::Duration};
use tokio::{sync::watch, time};

/// An index fed by a watch over resource kind `T`.
///
/// `apply` and `delete` are invoked serially per resource kind; handlers
/// must be idempotent because the watch re-lists after disconnects.
pub trait IndexResource<T> {
    fn apply(&mut self, obj: T) -> Result<()>;

    fn delete(&mut self, namespace: String, name: String) -> Result<()>;
}

/// Failed handler invocations are retried with exponential backoff this
/// many times before the event is logged and forgotten.
const MAX_RETRIES: u32 = 4;

const RETRY_BASE: Duration = Duration::from_millis(250);

/// Drives `events` into `index` until the stream ends (which, for a
/// `kube` watcher, is never under normal operation).
///
/// The initial list is applied before `ready` flips to `true`. On a
/// re-list, objects that vanished while the watch was disconnected are
/// synthesized as deletions so the index never retains them.
pub async fn run<T, I>(
    index: Arc<RwLock<I>>,
    events: impl Stream<Item = watcher::Result<watcher::Event<T>>>,
    ready: watch::Sender<bool>,
    metrics: ProcessorMetrics,
) where
    T: Resource + Clone,
    I: IndexResource<T>,
{
    let mut events = pin!(events);

    // Keys applied to the index, used to diff re-lists.
    let mut known = AHashSet::<(String, String)>::new();
    // Keys observed during an in-progress re-list.
    let mut relist: Option<AHashSet<(String, String)>> = None;

    while let Some(ev) = events.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(error) => {
                tracing::warn!(%error, "watch disconnected");
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        metrics.events.inc();
        match ev {
            watcher::Event::Init => {
                relist = Some(AHashSet::new());
            }

            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let key = obj_key(&obj);
                if let Some(seen) = relist.as_mut() {
                    seen.insert(key.clone());
                }
                known.insert(key.clone());
                apply_with_retry(&index, &key, obj, &metrics).await;
            }

            watcher::Event::InitDone => {
                if let Some(seen) = relist.take() {
                    for (namespace, name) in known.difference(&seen).cloned().collect::<Vec<_>>() {
                        delete_with_retry(&index, namespace, name, &metrics).await;
                    }
                    known = seen;
                }
                // Sync is reported once, after the first complete list.
                ready.send_replace(true);
            }

            watcher::Event::Delete(obj) => {
                let (namespace, name) = obj_key(&obj);
                known.remove(&(namespace.clone(), name.clone()));
                delete_with_retry(&index, namespace, name, &metrics).await;
            }
        }
    }

    tracing::warn!("watch stream ended");
}

fn obj_key<T: Resource>(obj: &T) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn apply_with_retry<T, I>(
    index: &Arc<RwLock<I>>,
    key: &(String, String),
    obj: T,
    metrics: &ProcessorMetrics,
) where
    T: Clone,
    I: IndexResource<T>,
{
    let mut delay = RETRY_BASE;
    for attempt in 0..=MAX_RETRIES {
        // The guard must drop before any backoff sleep.
        let result = index.write().apply(obj.clone());
        match result {
            Ok(()) => return,
            Err(error) if attempt == MAX_RETRIES => {
                metrics.giveups.inc();
                tracing::error!(namespace = %key.0, name = %key.1, %error, "giving up");
            }
            Err(error) => {
                metrics.errors.inc();
                tracing::warn!(namespace = %key.0, name = %key.1, %error, attempt, "will retry");
                time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

async fn delete_with_retry<T, I>(
    index: &Arc<RwLock<I>>,
    namespace: String,
    name: String,
    metrics: &ProcessorMetrics,
) where
    I: IndexResource<T>,
{
    let mut delay = RETRY_BASE;
    for attempt in 0..=MAX_RETRIES {
        let result = index.write().delete(namespace.clone(), name.clone());
        match result {
            Ok(()) => return,
            Err(error) if attempt == MAX_RETRIES => {
                metrics.giveups.inc();
                tracing::error!(%namespace, %name, %error, "giving up");
            }
            Err(error) => {
                metrics.errors.inc();
                tracing::warn!(%namespace, %name, %error, attempt, "will retry");
                time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
