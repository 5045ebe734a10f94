//! Builds the canonical resource and relationship set implied by one
//! observed object.

use crate::{ClusterContext, Error, Result, TypedObject};
use graph::{Query, Store};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use proto_intake::{relation, Any, Relationship, Resource, ResourceMetadata, ResourceRef, TypeDescriptor};

pub(crate) const TYPE_CLUSTER: &str = "kubernetes/cluster";

const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";

/// Produce the resource and the relationships implied by `object`.
///
/// Every object gets containment edges with its cluster and ownership
/// edges with each of its owner references. Pods additionally join to
/// their mounted claims and copy placement from their node (a pod whose
/// node is not yet indexed is a retryable failure); claims join to their
/// bound volume; nodes and volumes read placement off their topology
/// labels.
pub async fn generate(
    store: &Store,
    cluster: &ClusterContext,
    object: &TypedObject,
) -> Result<(Resource, Vec<Relationship>)> {
    let object_ref = object.to_ref(cluster)?;
    let cluster_ref = cluster.cluster_ref();

    let mut relationships = vec![
        edge(&cluster_ref, &object_ref, Any::pack(&relation::Contains::default())),
        edge(&object_ref, &cluster_ref, Any::pack(&relation::ContainedBy::default())),
    ];
    for owner in owner_refs(cluster, object) {
        relationships.push(edge(&owner, &object_ref, Any::pack(&relation::Owns::default())));
        relationships.push(edge(&object_ref, &owner, Any::pack(&relation::OwnedBy::default())));
    }

    let (mut region, mut zone) = (String::new(), String::new());
    match object {
        TypedObject::Pod(pod) => {
            let spec = pod.spec.as_ref();
            for claim_name in spec
                .and_then(|s| s.volumes.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|src| src.claim_name.as_str())
            {
                let claim_ref = cluster.object_ref(
                    "kubernetes/persistentvolumeclaim",
                    claim_name,
                    pod.metadata.namespace.as_deref(),
                );
                relationships.push(edge(
                    &object_ref,
                    &claim_ref,
                    Any::pack(&relation::VolumeMount::default()),
                ));
                relationships.push(edge(
                    &claim_ref,
                    &object_ref,
                    Any::pack(&relation::AttachedTo::default()),
                ));
            }

            // Placement comes from the node the pod landed on. The node may
            // simply not have been indexed yet, in which case this item
            // comes back around after a retry.
            if let Some(node_name) = spec.and_then(|s| s.node_name.as_deref()) {
                let node_ref = cluster.object_ref("kubernetes/node", node_name, None);
                let node = match store.get_resource(&node_ref).await {
                    Ok(node) => node,
                    Err(graph::Error::ResourceNotFound) => {
                        return Err(Error::Store(graph::Error::ResourceNotFound).retryable())
                    }
                    Err(err) => return Err(err.into()),
                };
                if let Some(meta) = node.metadata {
                    region = meta.region;
                    zone = meta.zone;
                }
            }
        }
        TypedObject::Node(node) => {
            (region, zone) = topology_of(&node.metadata);
        }
        TypedObject::PersistentVolume(volume) => {
            (region, zone) = topology_of(&volume.metadata);
        }
        TypedObject::PersistentVolumeClaim(claim) => {
            if let Some(volume_name) = claim
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.as_deref())
            {
                let volume_ref =
                    cluster.object_ref("kubernetes/persistentvolume", volume_name, None);
                relationships.push(edge(
                    &object_ref,
                    &volume_ref,
                    Any::pack(&relation::ClaimsFrom::default()),
                ));
                relationships.push(edge(
                    &volume_ref,
                    &object_ref,
                    Any::pack(&relation::BoundBy::default()),
                ));
            }
        }
        // Workload and service objects carry only the base edges.
        TypedObject::Service(_)
        | TypedObject::Deployment(_)
        | TypedObject::ReplicaSet(_)
        | TypedObject::StatefulSet(_)
        | TypedObject::DaemonSet(_)
        | TypedObject::Job(_) => {}
    }

    let meta = object.meta();
    let resource = Resource {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RESOURCE.to_string(),
            r#type: object.type_name().to_string(),
        }),
        metadata: Some(ResourceMetadata {
            provider: cluster.provider.clone(),
            provider_id: meta.uid.clone().unwrap_or_default(),
            name: object_ref.name.clone(),
            namespace: object_ref.namespace.clone(),
            region,
            zone,
            tags: tags_of(meta),
            // Lifecycle stamps are owned by the store.
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }),
        spec: Some(Any {
            type_url: format!("kubernetes.io/{}", object.kind_name()),
            value: object.marshal_spec()?,
        }),
    };

    Ok((resource, relationships))
}

/// Index `object` into the store: upsert its resource and insert exactly
/// the relationships not already present, preserving existing edge
/// identities across updates.
pub async fn apply(
    store: &Store,
    resource: Resource,
    relationships: Vec<Relationship>,
) -> Result<()> {
    store.update_resource(resource).await?;

    let mut missing = Vec::new();
    for relationship in relationships {
        let query = Query {
            subject: relationship.subject.as_ref(),
            object: relationship.object.as_ref(),
            predicate: Some(relationship.predicate_full_name()),
        };
        match store.get_relationships(query).await {
            Ok(_) => {} // Already indexed; leave the stored edge untouched.
            Err(graph::Error::RelationshipsNotFound) => missing.push(relationship),
            Err(err) => return Err(err.into()),
        }
    }
    if !missing.is_empty() {
        store.add_relationships(missing).await?;
    }
    Ok(())
}

/// The cluster resource itself, indexed once at startup.
pub fn cluster_resource(cluster: &ClusterContext) -> Resource {
    let cluster_ref = cluster.cluster_ref();
    Resource {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RESOURCE.to_string(),
            r#type: cluster_ref.r#type.clone(),
        }),
        metadata: Some(ResourceMetadata {
            provider: cluster.provider.clone(),
            provider_id: format!("{}/{}", cluster.account, cluster.cluster_name),
            name: cluster_ref.name.clone(),
            namespace: cluster_ref.namespace.clone(),
            region: cluster.region.clone(),
            ..Default::default()
        }),
        spec: None,
    }
}

fn edge(subject: &ResourceRef, object: &ResourceRef, predicate: Any) -> Relationship {
    Relationship {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RELATIONSHIP.to_string(),
            r#type: predicate.full_name().to_string(),
        }),
        subject: Some(subject.clone()),
        object: Some(object.clone()),
        predicate: Some(predicate),
    }
}

fn owner_refs(cluster: &ClusterContext, object: &TypedObject) -> Vec<ResourceRef> {
    let meta = object.meta();
    meta.owner_references
        .iter()
        .flatten()
        .map(|owner| {
            cluster.object_ref(
                &format!("kubernetes/{}", owner.kind.to_lowercase()),
                &owner.name,
                meta.namespace.as_deref(),
            )
        })
        .collect()
}

fn topology_of(meta: &ObjectMeta) -> (String, String) {
    let label = |name: &str| {
        meta.labels
            .as_ref()
            .and_then(|labels| labels.get(name))
            .cloned()
            .unwrap_or_default()
    };
    (label(LABEL_TOPOLOGY_REGION), label(LABEL_TOPOLOGY_ZONE))
}

fn tags_of(meta: &ObjectMeta) -> Vec<String> {
    meta.labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}
