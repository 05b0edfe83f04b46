//! Shared cache and event dispatch over one resource kind.
//!
//! A watcher drives a long-lived watch stream with backoff resync into an
//! indexed store and an optional event handler. Handler callbacks are
//! dispatched serially from the watch task, which preserves per-object
//! ordering; handlers spawn their own tasks for long-running work. A resync
//! replays the full set as add events, so handlers must be idempotent with
//! respect to object uid.
use std::{collections::HashSet, fmt::Debug, hash::Hash, sync::Arc};

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        reflector::{self, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Callbacks invoked as the watched set changes.
pub trait EventHandler<K>: Send + Sync + 'static {
    /// A new object appeared (or was replayed by a resync).
    fn on_add(&self, obj: &K);
    /// A known object changed.
    fn on_update(&self, obj: &K);
    /// A known object went away.
    fn on_delete(&self, obj: &K) {
        let _ = obj;
    }
}

/// A running watch over one resource kind.
pub struct Watcher<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash,
{
    store: Store<K>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl<K> Watcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Start watching `api` with the given config.
    pub fn start(
        api: Api<K>,
        config: watcher::Config,
        handler: Option<Arc<dyn EventHandler<K>>>,
    ) -> Self {
        Self::start_with(api, config, move |_| handler)
    }

    /// Start watching `api`, building the handler from the watcher's own
    /// store. Lets a handler consult the cache of the stream feeding it.
    pub fn start_with(
        api: Api<K>,
        config: watcher::Config,
        make_handler: impl FnOnce(&Store<K>) -> Option<Arc<dyn EventHandler<K>>>,
    ) -> Self {
        let (store, writer) = reflector::store();
        let handler = make_handler(&store);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(api, config, writer, handler, cancel.clone()));
        Self {
            store,
            cancel,
            task,
        }
    }

    /// The indexed cache backing this watch.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Stop the watch, draining the in-flight dispatch before returning.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(?err, "watch task failed");
        }
    }
}

async fn run_watch<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: reflector::store::Writer<K>,
    handler: Option<Arc<dyn EventHandler<K>>>,
    cancel: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let stream = reflector::reflector(writer, watcher(api, config).default_backoff());
    let mut stream = Box::pin(stream);
    let mut known = HashSet::new();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => dispatch(&event, handler.as_deref(), &mut known),
            Some(Err(err)) => warn!(%err, "watch stream error, backing off"),
            None => break,
        }
    }
}

fn dispatch<K>(
    event: &watcher::Event<K>,
    handler: Option<&dyn EventHandler<K>>,
    known: &mut HashSet<String>,
) where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Default + Clone,
{
    let Some(handler) = handler else { return };
    match event {
        watcher::Event::Applied(obj) => {
            if known.insert(obj.uid().unwrap_or_default()) {
                handler.on_add(obj);
            } else {
                handler.on_update(obj);
            }
        }
        watcher::Event::Deleted(obj) => {
            if let Some(uid) = obj.uid() {
                known.remove(&uid);
            }
            handler.on_delete(obj);
        }
        watcher::Event::Restarted(objs) => {
            for obj in objs {
                known.insert(obj.uid().unwrap_or_default());
                handler.on_add(obj);
            }
        }
    }
}
