use graph::{Error, Query, Store};
use proto_intake::{
    namespace, relation, Any, Event, EventType, Namespace, Relationship, Resource,
    ResourceMetadata, ResourceRef, TypeDescriptor,
};
use std::time::Duration;

fn r#ref(name: &str) -> ResourceRef {
    ResourceRef {
        r#type: "kubernetes/pod".to_string(),
        name: name.to_string(),
        namespace: Some(Namespace {
            value: Some(namespace::Value::Kubernetes(namespace::Kubernetes {
                cluster: "test-cluster".to_string(),
                namespace: "default".to_string(),
            })),
        }),
    }
}

fn resource(name: &str) -> Resource {
    let r = r#ref(name);
    Resource {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RESOURCE.to_string(),
            r#type: r.r#type.clone(),
        }),
        metadata: Some(ResourceMetadata {
            provider: "test".to_string(),
            provider_id: format!("id-{name}"),
            name: r.name,
            namespace: r.namespace,
            ..Default::default()
        }),
        spec: None,
    }
}

fn relationship(subject: &str, object: &str, predicate: Any) -> Relationship {
    Relationship {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RELATIONSHIP.to_string(),
            r#type: predicate.full_name().to_string(),
        }),
        subject: Some(r#ref(subject)),
        object: Some(r#ref(object)),
        predicate: Some(predicate),
    }
}

fn contains() -> Any {
    Any::pack(&relation::Contains::default())
}

fn owns() -> Any {
    Any::pack(&relation::Owns::default())
}

async fn recv(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn resource_crud_and_timestamps() {
    let store = Store::new();

    assert!(matches!(
        store.get_resource(&r#ref("web")).await,
        Err(Error::ResourceNotFound)
    ));

    store.add_resource(resource("web")).await.unwrap();
    let added = store.get_resource(&r#ref("web")).await.unwrap();
    let added_meta = added.metadata.as_ref().unwrap();
    assert_eq!(added_meta.created_at, added_meta.updated_at);
    assert!(added_meta.created_at.is_some());

    // A second add of the same key is refused.
    assert!(matches!(
        store.add_resource(resource("web")).await,
        Err(Error::ResourceExists)
    ));

    // Updates preserve created_at and strictly advance updated_at.
    let mut current = added.clone();
    for _ in 0..3 {
        store.update_resource(resource("web")).await.unwrap();
        let updated = store.get_resource(&r#ref("web")).await.unwrap();
        let updated_meta = updated.metadata.as_ref().unwrap();
        let current_meta = current.metadata.as_ref().unwrap();

        assert_eq!(updated_meta.created_at, current_meta.created_at);
        let prev = current_meta.updated_at.as_ref().unwrap();
        let next = updated_meta.updated_at.as_ref().unwrap();
        assert!(
            (next.seconds, next.nanos) > (prev.seconds, prev.nanos),
            "updated_at must strictly advance"
        );
        current = updated;
    }

    // Updating a missing key behaves like an add.
    store.update_resource(resource("db")).await.unwrap();
    let db = store.get_resource(&r#ref("db")).await.unwrap();
    let db_meta = db.metadata.as_ref().unwrap();
    assert_eq!(db_meta.created_at, db_meta.updated_at);
}

#[tokio::test]
async fn relationship_facet_filters() {
    let store = Store::new();
    store
        .add_relationships(vec![
            relationship("test", "test2", contains()),
            relationship("test2", "test", owns()),
        ])
        .await
        .unwrap();
    store
        .add_relationships(vec![
            relationship("test", "test2", owns()),
            relationship("test2", "test3", contains()),
        ])
        .await
        .unwrap();

    let by_subject = store
        .get_relationships(Query {
            subject: Some(&r#ref("test")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_subject.len(), 2);

    let by_object = store
        .get_relationships(Query {
            object: Some(&r#ref("test2")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_object.len(), 2);

    let by_predicate = store
        .get_relationships(Query {
            predicate: Some("intake.v1.relation.Contains"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_predicate.len(), 2);

    let by_all = store
        .get_relationships(Query {
            subject: Some(&r#ref("test")),
            object: Some(&r#ref("test2")),
            predicate: Some("intake.v1.relation.Contains"),
        })
        .await
        .unwrap();
    assert_eq!(by_all.len(), 1);
    assert_eq!(by_all[0].subject, Some(r#ref("test")));
    assert_eq!(by_all[0].object, Some(r#ref("test2")));

    // A query without any facet is an error, not an unbounded scan.
    assert!(matches!(
        store.get_relationships(Query::default()).await,
        Err(Error::EmptyQuery)
    ));
}

#[tokio::test]
async fn identical_relationships_deduplicate() {
    let store = Store::new();
    let edge = relationship("a", "b", contains());
    store.add_relationships(vec![edge.clone()]).await.unwrap();
    store.add_relationships(vec![edge.clone()]).await.unwrap();

    // Content addressing: the second insert is the same digest everywhere.
    for query in [
        Query {
            subject: Some(&r#ref("a")),
            ..Default::default()
        },
        Query {
            object: Some(&r#ref("b")),
            ..Default::default()
        },
        Query {
            predicate: Some("intake.v1.relation.Contains"),
            ..Default::default()
        },
    ] {
        assert_eq!(store.get_relationships(query).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn invalid_relationships_are_rejected_whole() {
    let store = Store::new();

    // Self-edge.
    let err = store
        .add_relationships(vec![
            relationship("ok", "ok2", contains()),
            relationship("loop", "loop", contains()),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidEdge(_)));

    // Missing predicate.
    let mut missing = relationship("a", "b", contains());
    missing.predicate = None;
    assert!(matches!(
        store.add_relationships(vec![missing]).await,
        Err(Error::InvalidEdge(_))
    ));

    // The batch was all-or-nothing: the valid first edge did not land.
    assert!(matches!(
        store
            .get_relationships(Query {
                subject: Some(&r#ref("ok")),
                ..Default::default()
            })
            .await,
        Err(Error::RelationshipsNotFound)
    ));
}

#[tokio::test]
async fn cascade_delete_removes_incident_edges() {
    let store = Store::new();
    store.add_resource(resource("foo")).await.unwrap();
    store
        .add_relationships(vec![
            relationship("foo", "bar", contains()),
            relationship("bar", "foo", owns()),
        ])
        .await
        .unwrap();
    store
        .add_relationships(vec![relationship("bar", "baz", contains())])
        .await
        .unwrap();

    store.delete_resource(&r#ref("foo")).await.unwrap();

    assert!(matches!(
        store.get_resource(&r#ref("foo")).await,
        Err(Error::ResourceNotFound)
    ));
    for (subject, object) in [("foo", "bar"), ("bar", "foo")] {
        assert!(
            matches!(
                store
                    .get_relationships(Query {
                        subject: Some(&r#ref(subject)),
                        object: Some(&r#ref(object)),
                        ..Default::default()
                    })
                    .await,
                Err(Error::RelationshipsNotFound)
            ),
            "({subject}, {object}) must be gone"
        );
    }

    // The unrelated edge survives, including in the predicate index that
    // was swept.
    let survivors = store
        .get_relationships(Query {
            subject: Some(&r#ref("bar")),
            object: Some(&r#ref("baz")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(
        store
            .get_relationships(Query {
                predicate: Some("intake.v1.relation.Contains"),
                ..Default::default()
            })
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn events_fan_out_with_filters() {
    let store = Store::new();
    let mut all = store.subscribe(None);
    let mut resources_only = store.subscribe(Some(proto_intake::KIND_RESOURCE.to_string()));
    // Let the (empty) initial snapshots resolve before mutating.
    tokio::time::sleep(Duration::from_millis(10)).await;

    store.add_resource(resource("web")).await.unwrap();
    let event = recv(&mut all).await;
    assert_eq!(event.r#type, EventType::Add as i32);
    assert_eq!(event.objects.len(), 1);
    assert_eq!(recv(&mut resources_only).await.r#type, EventType::Add as i32);

    // One event per relationship, not one per batch.
    store
        .add_relationships(vec![
            relationship("web", "db", contains()),
            relationship("db", "web", owns()),
        ])
        .await
        .unwrap();
    for _ in 0..2 {
        let event = recv(&mut all).await;
        assert_eq!(event.r#type, EventType::Add as i32);
        let descriptor = event.objects[0].type_descriptor.as_ref().unwrap();
        assert_eq!(descriptor.kind, proto_intake::KIND_RELATIONSHIP);
    }

    store.update_resource(resource("web")).await.unwrap();
    assert_eq!(recv(&mut all).await.r#type, EventType::Update as i32);
    assert_eq!(
        recv(&mut resources_only).await.r#type,
        EventType::Update as i32
    );

    store.delete_resource(&r#ref("web")).await.unwrap();
    let event = recv(&mut all).await;
    assert_eq!(event.r#type, EventType::Delete as i32);
    let tombstone = recv(&mut resources_only).await;
    assert_eq!(tombstone.r#type, EventType::Delete as i32);

    // The relationship events were never delivered to the filtered
    // subscriber; its next event was the update, already consumed above.
    assert!(resources_only.try_recv().is_err());
}

#[tokio::test]
async fn delete_tombstone_carries_identity_and_deletion_time() {
    let store = Store::new();
    store.add_resource(resource("web")).await.unwrap();

    let mut events = store.subscribe(None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Drain the snapshot of the one live resource.
    assert_eq!(recv(&mut events).await.objects.len(), 1);

    store.delete_resource(&r#ref("web")).await.unwrap();
    let event = recv(&mut events).await;
    assert_eq!(event.r#type, EventType::Delete as i32);

    let payload = event.objects[0].payload.as_ref().unwrap();
    let tombstone = <Resource as prost::Message>::decode(payload.value.as_slice()).unwrap();
    let meta = tombstone.metadata.as_ref().unwrap();
    assert_eq!(meta.name, "web");
    assert_eq!(meta.namespace, r#ref("web").namespace);
    assert!(meta.deleted_at.is_some());
    assert!(meta.created_at.is_none());
    assert!(tombstone.spec.is_none());

    // A second delete is a no-op and emits nothing.
    store.delete_resource(&r#ref("web")).await.unwrap();
    store.add_resource(resource("other")).await.unwrap();
    let next = recv(&mut events).await;
    assert_eq!(next.r#type, EventType::Add as i32);
}

#[tokio::test]
async fn subscribe_delivers_initial_snapshot() {
    let store = Store::new();
    store.add_resource(resource("web")).await.unwrap();
    store.add_resource(resource("db")).await.unwrap();
    store
        .add_relationships(vec![relationship("web", "db", contains())])
        .await
        .unwrap();

    let mut events = store.subscribe(None);
    let snapshot = recv(&mut events).await;
    assert_eq!(snapshot.r#type, EventType::Add as i32);
    assert_eq!(snapshot.objects.len(), 3);

    // KV iteration order: relationships precede resources.
    let kinds: Vec<&str> = snapshot
        .objects
        .iter()
        .map(|o| o.type_descriptor.as_ref().unwrap().kind.as_str())
        .collect();
    assert_eq!(kinds, vec!["relationship", "resource", "resource"]);
}

#[tokio::test]
async fn close_is_idempotent_and_closes_subscribers() {
    let store = Store::new();
    store.add_resource(resource("web")).await.unwrap();

    let mut events = store.subscribe(None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(recv(&mut events).await.objects.len(), 1); // snapshot

    store.close().await;
    store.close().await;

    // The subscriber channel drains and then closes.
    assert!(
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .is_none()
    );

    // Subscriptions after close are born closed.
    let mut late = store.subscribe(None);
    assert!(late.recv().await.is_none());

    // Mutations still apply, but publish nothing.
    store.add_resource(resource("db")).await.unwrap();
    assert!(store.get_resource(&r#ref("db")).await.is_ok());
}
