//! Translation of observed Kubernetes objects into canonical graph
//! resources and relationships, and the single-worker controller that
//! applies them to the store.

mod controller;
mod generate;

pub use controller::{Controller, Metrics, MAX_CONCURRENT_INDEXERS};
pub use generate::{apply, cluster_resource, generate};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use proto_intake::{namespace, Namespace, ResourceRef};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transient failure: the item should be re-queued and retried.
    #[error("retryable: {0}")]
    Retryable(#[source] Box<Error>),
    #[error("object is missing required metadata: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] graph::Error),
    #[error("marshaling object spec")]
    Spec(#[from] serde_json::Error),
}

impl Error {
    /// Mark this error as transient, instructing the worker to re-queue
    /// the originating item.
    pub fn retryable(self) -> Error {
        Error::Retryable(Box::new(self))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity of the cluster this agent observes, as probed at startup.
#[derive(Clone, Debug)]
pub struct ClusterContext {
    pub provider: String,
    pub account: String,
    pub region: String,
    pub cluster_name: String,
}

impl ClusterContext {
    /// The reference of the cluster resource itself, addressed within its
    /// cloud account and region.
    pub fn cluster_ref(&self) -> ResourceRef {
        ResourceRef {
            r#type: generate::TYPE_CLUSTER.to_string(),
            name: self.cluster_name.clone(),
            namespace: Some(Namespace {
                value: Some(namespace::Value::Cloud(namespace::Cloud {
                    account: self.account.clone(),
                    region: self.region.clone(),
                    group: String::new(),
                })),
            }),
        }
    }

    /// The reference of an object within this cluster. Cluster-scoped
    /// objects carry an empty namespace slot.
    pub fn object_ref(&self, r#type: &str, name: &str, namespace: Option<&str>) -> ResourceRef {
        ResourceRef {
            r#type: r#type.to_string(),
            name: name.to_string(),
            namespace: Some(Namespace {
                value: Some(namespace::Value::Kubernetes(namespace::Kubernetes {
                    cluster: self.cluster_name.clone(),
                    namespace: namespace.unwrap_or_default().to_string(),
                })),
            }),
        }
    }
}

/// A watched object, in its typed form.
#[derive(Clone, Debug)]
pub enum TypedObject {
    Pod(Pod),
    Node(Node),
    PersistentVolume(PersistentVolume),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Service(Service),
    Deployment(Deployment),
    ReplicaSet(ReplicaSet),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Job(Job),
}

impl TypedObject {
    /// The canonical resource type of this object.
    pub fn type_name(&self) -> &'static str {
        match self {
            TypedObject::Pod(_) => "kubernetes/pod",
            TypedObject::Node(_) => "kubernetes/node",
            TypedObject::PersistentVolume(_) => "kubernetes/persistentvolume",
            TypedObject::PersistentVolumeClaim(_) => "kubernetes/persistentvolumeclaim",
            TypedObject::Service(_) => "kubernetes/service",
            TypedObject::Deployment(_) => "kubernetes/deployment",
            TypedObject::ReplicaSet(_) => "kubernetes/replicaset",
            TypedObject::StatefulSet(_) => "kubernetes/statefulset",
            TypedObject::DaemonSet(_) => "kubernetes/daemonset",
            TypedObject::Job(_) => "kubernetes/job",
        }
    }

    // The Kubernetes kind, used to tag the opaque spec payload.
    fn kind_name(&self) -> &'static str {
        match self {
            TypedObject::Pod(_) => "Pod",
            TypedObject::Node(_) => "Node",
            TypedObject::PersistentVolume(_) => "PersistentVolume",
            TypedObject::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            TypedObject::Service(_) => "Service",
            TypedObject::Deployment(_) => "Deployment",
            TypedObject::ReplicaSet(_) => "ReplicaSet",
            TypedObject::StatefulSet(_) => "StatefulSet",
            TypedObject::DaemonSet(_) => "DaemonSet",
            TypedObject::Job(_) => "Job",
        }
    }

    fn meta(&self) -> &ObjectMeta {
        match self {
            TypedObject::Pod(o) => &o.metadata,
            TypedObject::Node(o) => &o.metadata,
            TypedObject::PersistentVolume(o) => &o.metadata,
            TypedObject::PersistentVolumeClaim(o) => &o.metadata,
            TypedObject::Service(o) => &o.metadata,
            TypedObject::Deployment(o) => &o.metadata,
            TypedObject::ReplicaSet(o) => &o.metadata,
            TypedObject::StatefulSet(o) => &o.metadata,
            TypedObject::DaemonSet(o) => &o.metadata,
            TypedObject::Job(o) => &o.metadata,
        }
    }

    fn marshal_spec(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        match self {
            TypedObject::Pod(o) => serde_json::to_vec(o),
            TypedObject::Node(o) => serde_json::to_vec(o),
            TypedObject::PersistentVolume(o) => serde_json::to_vec(o),
            TypedObject::PersistentVolumeClaim(o) => serde_json::to_vec(o),
            TypedObject::Service(o) => serde_json::to_vec(o),
            TypedObject::Deployment(o) => serde_json::to_vec(o),
            TypedObject::ReplicaSet(o) => serde_json::to_vec(o),
            TypedObject::StatefulSet(o) => serde_json::to_vec(o),
            TypedObject::DaemonSet(o) => serde_json::to_vec(o),
            TypedObject::Job(o) => serde_json::to_vec(o),
        }
    }

    /// The object's name. Every indexed object must carry one.
    pub fn name(&self) -> Result<&str> {
        self.meta()
            .name
            .as_deref()
            .ok_or_else(|| Error::Invalid("object has no name".to_string()))
    }

    /// The reference addressing this object within `cluster`.
    pub fn to_ref(&self, cluster: &ClusterContext) -> Result<ResourceRef> {
        Ok(cluster.object_ref(
            self.type_name(),
            self.name()?,
            self.meta().namespace.as_deref(),
        ))
    }
}

/// What happened to a watched object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Applied,
    Deleted,
}

/// One unit of indexing work: an object plus what happened to it.
#[derive(Clone, Debug)]
pub struct ObjectEvent {
    pub action: Action,
    pub object: TypedObject,
}
