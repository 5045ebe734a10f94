use graph::{Query, Store};
use indexer::{Action, ClusterContext, Controller, Error, Metrics, ObjectEvent, TypedObject};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cluster() -> ClusterContext {
    ClusterContext {
        provider: "eks".to_string(),
        account: "123456789012".to_string(),
        region: "us-east-1".to_string(),
        cluster_name: "prod".to_string(),
    }
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        uid: Some(format!("uid-{name}")),
        ..Default::default()
    }
}

fn pod(name: &str, node_name: Option<&str>, claim: Option<&str>) -> Pod {
    Pod {
        metadata: meta(name, Some("default")),
        spec: Some(PodSpec {
            node_name: node_name.map(str::to_string),
            volumes: claim.map(|claim_name| {
                vec![Volume {
                    name: "data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node(name: &str, region: &str, zone: &str) -> Node {
    let mut labels = BTreeMap::new();
    labels.insert("topology.kubernetes.io/region".to_string(), region.to_string());
    labels.insert("topology.kubernetes.io/zone".to_string(), zone.to_string());
    Node {
        metadata: ObjectMeta {
            labels: Some(labels),
            ..meta(name, None)
        },
        ..Default::default()
    }
}

fn predicate_names(relationships: &[proto_intake::Relationship]) -> Vec<&str> {
    relationships
        .iter()
        .map(|r| r.predicate_full_name())
        .collect()
}

#[tokio::test]
async fn pods_generate_base_owner_and_mount_edges() {
    let store = Store::new();
    let cluster = cluster();

    let mut pod = pod("web-1", None, Some("data-claim"));
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        name: "web-abc".to_string(),
        uid: "uid-web-abc".to_string(),
        ..Default::default()
    }]);

    let (resource, relationships) =
        indexer::generate(&store, &cluster, &TypedObject::Pod(pod))
            .await
            .unwrap();

    let descriptor = resource.type_descriptor.as_ref().unwrap();
    assert_eq!(descriptor.r#type, "kubernetes/pod");
    let resource_meta = resource.metadata.as_ref().unwrap();
    assert_eq!(resource_meta.provider, "eks");
    assert_eq!(resource_meta.provider_id, "uid-web-1");
    assert!(resource.spec.is_some());
    assert_eq!(
        resource.spec.as_ref().unwrap().type_url,
        "kubernetes.io/Pod"
    );

    let names = predicate_names(&relationships);
    assert_eq!(
        names,
        vec![
            "intake.v1.relation.Contains",
            "intake.v1.relation.ContainedBy",
            "intake.v1.relation.Owns",
            "intake.v1.relation.OwnedBy",
            "intake.v1.relation.VolumeMount",
            "intake.v1.relation.AttachedTo",
        ]
    );

    // Paired edges point in opposite directions.
    let contains = &relationships[0];
    let contained_by = &relationships[1];
    assert_eq!(contains.subject, contained_by.object);
    assert_eq!(contains.object, contained_by.subject);
    assert_eq!(contains.subject.as_ref().unwrap().r#type, "kubernetes/cluster");

    let owns = &relationships[2];
    assert_eq!(owns.subject.as_ref().unwrap().name, "web-abc");
    assert_eq!(owns.subject.as_ref().unwrap().r#type, "kubernetes/replicaset");

    let mount = &relationships[4];
    assert_eq!(mount.object.as_ref().unwrap().name, "data-claim");
}

#[tokio::test]
async fn pod_placement_requires_an_indexed_node() {
    let store = Store::new();
    let cluster = cluster();

    // The pod names a node the store has never seen: retryable.
    let err = indexer::generate(
        &store,
        &cluster,
        &TypedObject::Pod(pod("web-1", Some("ip-10-0-0-1"), None)),
    )
    .await
    .unwrap_err();
    assert!(err.is_retryable(), "{err}");

    // Index the node, and the pod inherits its placement.
    let (node_resource, node_rels) = indexer::generate(
        &store,
        &cluster,
        &TypedObject::Node(node("ip-10-0-0-1", "us-east-1", "us-east-1a")),
    )
    .await
    .unwrap();
    indexer::apply(&store, node_resource, node_rels).await.unwrap();

    let (pod_resource, _) = indexer::generate(
        &store,
        &cluster,
        &TypedObject::Pod(pod("web-1", Some("ip-10-0-0-1"), None)),
    )
    .await
    .unwrap();
    let pod_meta = pod_resource.metadata.as_ref().unwrap();
    assert_eq!(pod_meta.region, "us-east-1");
    assert_eq!(pod_meta.zone, "us-east-1a");
}

#[tokio::test]
async fn claims_bind_to_their_volume() {
    let store = Store::new();
    let claim = PersistentVolumeClaim {
        metadata: meta("data-claim", Some("default")),
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some("vol-1".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let (_, relationships) = indexer::generate(
        &store,
        &cluster(),
        &TypedObject::PersistentVolumeClaim(claim),
    )
    .await
    .unwrap();

    let names = predicate_names(&relationships);
    assert!(names.contains(&"intake.v1.relation.ClaimsFrom"));
    assert!(names.contains(&"intake.v1.relation.BoundBy"));
}

#[tokio::test]
async fn workloads_generate_only_base_edges() {
    let store = Store::new();
    let replica_set = ReplicaSet {
        metadata: meta("web-abc", Some("default")),
        ..Default::default()
    };

    let (_, relationships) = indexer::generate(
        &store,
        &cluster(),
        &TypedObject::ReplicaSet(replica_set),
    )
    .await
    .unwrap();
    assert_eq!(
        predicate_names(&relationships),
        vec![
            "intake.v1.relation.Contains",
            "intake.v1.relation.ContainedBy",
        ]
    );
}

#[tokio::test]
async fn reapplying_an_object_preserves_edge_identities() {
    let store = Store::new();
    let cluster = cluster();
    let object = TypedObject::Node(node("ip-10-0-0-1", "us-east-1", "us-east-1a"));

    for _ in 0..2 {
        let (resource, relationships) =
            indexer::generate(&store, &cluster, &object).await.unwrap();
        indexer::apply(&store, resource, relationships).await.unwrap();
    }

    let node_ref = object.to_ref(&cluster).unwrap();
    let edges = store
        .get_relationships(Query {
            subject: Some(&node_ref),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(edges.len(), 1, "ContainedBy must not be duplicated");
}

#[tokio::test]
async fn objects_without_names_are_invalid() {
    let store = Store::new();
    let err = indexer::generate(
        &store,
        &cluster(),
        &TypedObject::Pod(Pod::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn controller_retries_pods_until_their_node_lands() {
    let store = Store::new();
    let cluster = cluster();
    let controller = Arc::new(Controller::new(store.clone(), cluster.clone(), Metrics::new()));
    let cancel = CancellationToken::new();
    let run = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    // The pod arrives before its node and keeps being re-queued.
    let pod_object = TypedObject::Pod(pod("web-1", Some("ip-10-0-0-1"), None));
    controller.enqueue(ObjectEvent {
        action: Action::Applied,
        object: pod_object.clone(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.enqueue(ObjectEvent {
        action: Action::Applied,
        object: TypedObject::Node(node("ip-10-0-0-1", "us-east-1", "us-east-1a")),
    });

    let pod_ref = pod_object.to_ref(&cluster).unwrap();
    let indexed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(resource) = store.get_resource(&pod_ref).await {
                let meta = resource.metadata.unwrap();
                if meta.region == "us-east-1" {
                    break meta;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("the pod was never indexed with its node's placement");
    assert_eq!(indexed.zone, "us-east-1a");

    cancel.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn deletes_cascade_through_the_controller() {
    let store = Store::new();
    let cluster = cluster();
    let object = TypedObject::Node(node("ip-10-0-0-1", "us-east-1", "us-east-1a"));

    let (resource, relationships) = indexer::generate(&store, &cluster, &object).await.unwrap();
    indexer::apply(&store, resource, relationships).await.unwrap();

    let controller = Arc::new(Controller::new(store.clone(), cluster.clone(), Metrics::new()));
    let cancel = CancellationToken::new();
    let run = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };
    controller.enqueue(ObjectEvent {
        action: Action::Deleted,
        object: object.clone(),
    });

    let node_ref = object.to_ref(&cluster).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if store.get_resource(&node_ref).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("the node was never deleted");

    assert!(matches!(
        store
            .get_relationships(Query {
                subject: Some(&node_ref),
                ..Default::default()
            })
            .await,
        Err(graph::Error::RelationshipsNotFound)
    ));

    cancel.cancel();
    run.await.unwrap();
}
