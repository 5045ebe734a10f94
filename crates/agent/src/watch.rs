//! Kubernetes watch streams feeding the indexing controller.

use futures::StreamExt;
use indexer::{Action, Controller, ObjectEvent, TypedObject};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use kube::runtime::watcher;
use kube::Api;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Start one watch stream per observed object type, each enqueueing its
/// events onto the controller's work queue.
pub fn spawn(
    client: kube::Client,
    controller: Arc<Controller>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    macro_rules! watch {
        ($kind:ty, $wrap:expr) => {
            tokio::spawn(watch_type::<$kind>(
                Api::all(client.clone()),
                $wrap,
                controller.clone(),
                cancel.clone(),
            ))
        };
    }

    vec![
        watch!(Pod, TypedObject::Pod),
        watch!(Node, TypedObject::Node),
        watch!(PersistentVolume, TypedObject::PersistentVolume),
        watch!(PersistentVolumeClaim, TypedObject::PersistentVolumeClaim),
        watch!(Service, TypedObject::Service),
        watch!(Deployment, TypedObject::Deployment),
        watch!(ReplicaSet, TypedObject::ReplicaSet),
        watch!(StatefulSet, TypedObject::StatefulSet),
        watch!(DaemonSet, TypedObject::DaemonSet),
        watch!(Job, TypedObject::Job),
    ]
}

async fn watch_type<K>(
    api: Api<K>,
    wrap: fn(K) -> TypedObject,
    controller: Arc<Controller>,
    cancel: CancellationToken,
) where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object))) => {
                controller.enqueue(ObjectEvent {
                    action: Action::Applied,
                    object: wrap(object),
                });
            }
            Some(Ok(watcher::Event::Delete(object))) => {
                controller.enqueue(ObjectEvent {
                    action: Action::Deleted,
                    object: wrap(object),
                });
            }
            // Restart markers; the informer re-lists and re-applies.
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
            Some(Err(error)) => {
                // The watcher re-establishes itself; surface the hiccup.
                tracing::warn!(%error, "watch stream error");
            }
            None => break,
        }
    }
}
