//! The indexing controller: a rate-limited queue of observed objects,
//! drained by a fixed set of workers.

use crate::{generate, Action, ClusterContext, ObjectEvent, Result};
use graph::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use work_queue::RateLimitingQueue;

/// Workers draining the indexing queue. One, so object mutations observed
/// from the cluster are applied serially; scaling this out would need a
/// per-resource keyed serializer to keep intra-cluster ordering.
pub const MAX_CONCURRENT_INDEXERS: usize = 1;

/// Counters of indexing activity, for the metrics endpoint.
#[derive(Clone)]
pub struct Metrics {
    pub objects_indexed: prometheus::IntCounter,
    pub objects_deleted: prometheus::IntCounter,
    pub retries: prometheus::IntCounter,
    pub failures: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let counter = |name, help| {
            prometheus::IntCounter::new(name, help).expect("metric options are valid")
        };
        Self {
            objects_indexed: counter(
                "indexer_objects_indexed_total",
                "Objects translated and applied to the graph",
            ),
            objects_deleted: counter(
                "indexer_objects_deleted_total",
                "Objects deleted from the graph",
            ),
            retries: counter(
                "indexer_retries_total",
                "Indexing attempts re-queued after a retryable failure",
            ),
            failures: counter(
                "indexer_failures_total",
                "Indexing attempts abandoned after a terminal failure",
            ),
        }
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        for collector in [
            &self.objects_indexed,
            &self.objects_deleted,
            &self.retries,
            &self.failures,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }
        Ok(())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Controller {
    store: Store,
    cluster: ClusterContext,
    queue: RateLimitingQueue<ObjectEvent>,
    metrics: Metrics,
}

impl Controller {
    pub fn new(store: Store, cluster: ClusterContext, metrics: Metrics) -> Self {
        Self {
            store,
            cluster,
            queue: RateLimitingQueue::new(),
            metrics,
        }
    }

    /// Queue an observed object for indexing.
    pub fn enqueue(&self, event: ObjectEvent) {
        self.queue.add_rate_limited(Arc::new(event));
    }

    /// Drain the queue until `cancel` fires and outstanding items finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let drain = {
            let queue = self.queue.clone();
            async move {
                cancel.cancelled().await;
                queue.shut_down_with_drain().await;
            }
        };

        let workers = async {
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..MAX_CONCURRENT_INDEXERS {
                let worker = self.worker();
                set.spawn(worker);
            }
            while set.join_next().await.is_some() {}
        };

        let ((), ()) = tokio::join!(drain, workers);
    }

    fn worker(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let store = self.store.clone();
        let cluster = self.cluster.clone();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();

        async move {
            while let Some(event) = queue.get().await {
                match process(&store, &cluster, &event).await {
                    Ok(()) => {
                        match event.action {
                            Action::Applied => metrics.objects_indexed.inc(),
                            Action::Deleted => metrics.objects_deleted.inc(),
                        }
                        queue.forget(&event);
                    }
                    Err(error) if error.is_retryable() => {
                        tracing::debug!(%error, "re-queueing object after transient failure");
                        metrics.retries.inc();
                        queue.add_rate_limited(event.clone());
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to index object");
                        metrics.failures.inc();
                        queue.forget(&event);
                    }
                }
                queue.done(&event);
            }
        }
    }
}

async fn process(store: &Store, cluster: &ClusterContext, event: &ObjectEvent) -> Result<()> {
    match event.action {
        Action::Applied => {
            let (resource, relationships) = generate::generate(store, cluster, &event.object).await?;
            generate::apply(store, resource, relationships).await
        }
        Action::Deleted => {
            let object_ref = event.object.to_ref(cluster)?;
            store.delete_resource(&object_ref).await?;
            Ok(())
        }
    }
}
