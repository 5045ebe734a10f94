//! Transactional CRUD over resources and relationships, with cascade
//! deletes and publication of every committed mutation.

use crate::{index, keys, kv::Kv, router, Error, Result};
use prost::Message;
use proto_intake::{
    Event, EventType, Object, Relationship, Resource, ResourceMetadata, ResourceRef,
    TypeDescriptor,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// A relationship query. At least one facet must be set; results match
/// every set facet (refs byte-wise, predicates by full message name).
#[derive(Default, Clone, Copy)]
pub struct Query<'a> {
    pub subject: Option<&'a ResourceRef>,
    pub object: Option<&'a ResourceRef>,
    pub predicate: Option<&'a str>,
}

/// The in-memory resource graph.
///
/// Mutations take the store-wide writer lock and publish exactly one event
/// per committed change (per relationship, for batched relationship adds)
/// onto the change feed once the lock is released.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) kv: RwLock<Kv>,
    pub(crate) subscribers: Mutex<Vec<router::Subscriber>>,
    // The event pipe into the fan-out task. Taken (and thereby closed) by close().
    pub(crate) pipe: Mutex<Option<mpsc::Sender<Event>>>,
    pub(crate) ops: OpGauge,
    pub(crate) closed: AtomicBool,
}

impl Store {
    pub fn new() -> Store {
        let (pipe_tx, pipe_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            kv: RwLock::new(Kv::default()),
            subscribers: Mutex::new(Vec::new()),
            pipe: Mutex::new(Some(pipe_tx)),
            ops: OpGauge::default(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(router::fan_out(inner.clone(), pipe_rx));
        Store { inner }
    }

    /// Fetch the resource addressed by `r`.
    pub async fn get_resource(&self, r: &ResourceRef) -> Result<Resource> {
        let _op = self.inner.ops.enter();
        let key = keys::resource_key(r)?;

        let kv = self.inner.kv.read().unwrap();
        match kv.get(&key) {
            Some(value) => Ok(Resource::decode(value)?),
            None => Err(Error::ResourceNotFound),
        }
    }

    /// Insert a new resource, stamping its creation and update times.
    /// Fails with ResourceExists if the key is already present.
    pub async fn add_resource(&self, mut resource: Resource) -> Result<()> {
        let _op = self.inner.ops.enter();
        let r = ref_of(&resource)?;
        let key = keys::resource_key(&r)?;
        let now = proto_intake::as_timestamp(std::time::SystemTime::now());

        let event = {
            let mut kv = self.inner.kv.write().unwrap();
            if kv.get(&key).is_some() {
                return Err(Error::ResourceExists);
            }
            let meta = metadata_mut(&mut resource);
            meta.created_at = Some(now.clone());
            meta.updated_at = Some(now);
            meta.deleted_at = None;

            kv.put(key, resource.encode_to_vec());
            event(EventType::Add, vec![Object::from_resource(&resource)])
        };
        self.publish(event).await;
        Ok(())
    }

    /// Upsert a resource. An existing resource keeps its original
    /// created_at and has updated_at advanced; a missing key behaves
    /// exactly like add_resource.
    pub async fn update_resource(&self, mut resource: Resource) -> Result<()> {
        let _op = self.inner.ops.enter();
        let r = ref_of(&resource)?;
        let key = keys::resource_key(&r)?;
        let now = proto_intake::as_timestamp(std::time::SystemTime::now());

        let event = {
            let mut kv = self.inner.kv.write().unwrap();
            let current = match kv.get(&key) {
                Some(value) => Some(Resource::decode(value)?),
                None => None,
            };
            let event_type = match current {
                Some(current) => {
                    let current_meta = current.metadata.as_ref();
                    let meta = metadata_mut(&mut resource);
                    meta.created_at = current_meta.and_then(|m| m.created_at.clone());
                    meta.updated_at = Some(advance(
                        now,
                        current_meta.and_then(|m| m.updated_at.as_ref()),
                    ));
                    meta.deleted_at = None;
                    EventType::Update
                }
                None => {
                    let meta = metadata_mut(&mut resource);
                    meta.created_at = Some(now.clone());
                    meta.updated_at = Some(now);
                    meta.deleted_at = None;
                    EventType::Add
                }
            };
            kv.put(key, resource.encode_to_vec());
            event(event_type, vec![Object::from_resource(&resource)])
        };
        self.publish(event).await;
        Ok(())
    }

    /// Delete a resource and every relationship in which it participates,
    /// publishing a tombstone carrying the resource identity and deletion
    /// time. Deleting an absent resource succeeds without an event, so
    /// repeated deletes converge.
    pub async fn delete_resource(&self, r: &ResourceRef) -> Result<()> {
        let _op = self.inner.ops.enter();
        let resource_key = keys::resource_key(r)?;
        let subject_key = keys::index_subject_key(r)?;
        let object_key = keys::index_object_key(r)?;
        let now = proto_intake::as_timestamp(std::time::SystemTime::now());

        let existed = {
            let mut kv = self.inner.kv.write().unwrap();

            // Drop every edge reachable through the subject and object
            // indexes, then the index entries themselves.
            let mut deleted: HashSet<index::Digest> = HashSet::new();
            for key in [&subject_key, &object_key] {
                let digests: Vec<index::Digest> = match kv.get(key) {
                    Some(value) => index::chunks(value)
                        .map(|c| c.try_into().expect("index chunks are digest-sized"))
                        .collect(),
                    None => Vec::new(),
                };
                for digest in digests {
                    kv.delete(&keys::relationship_key(&digest));
                    deleted.insert(digest);
                }
                kv.delete(key);
            }

            // Sweep the deleted digests out of every predicate index.
            // Visits each predicate entry once per delete; fine while the
            // set of distinct predicates stays small.
            if !deleted.is_empty() {
                let entries: Vec<(Vec<u8>, Vec<u8>)> = kv
                    .scan_prefix(keys::INDEX_PREDICATE_PREFIX.as_bytes())
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .collect();
                for (key, mut value) in entries {
                    let mut changed = false;
                    for digest in &deleted {
                        changed |= index::remove(&mut value, digest);
                    }
                    if !changed {
                        continue;
                    }
                    if value.is_empty() {
                        kv.delete(&key);
                    } else {
                        kv.put(key, value);
                    }
                }
            }

            kv.delete(&resource_key) || !deleted.is_empty()
        };

        // Deleting an already-absent resource is a no-op and emits no
        // second tombstone.
        if existed {
            self.publish(event(
                EventType::Delete,
                vec![Object::from_resource(&tombstone(r, now))],
            ))
            .await;
        }
        Ok(())
    }

    /// Insert relationships, all-or-nothing. Identical triples are
    /// content-addressed and deduplicate; one event is published per
    /// relationship so subscribers can filter by edge type.
    pub async fn add_relationships(&self, relationships: Vec<Relationship>) -> Result<()> {
        let _op = self.inner.ops.enter();

        // Validate the entire batch before the first write.
        struct Prepared {
            marshaled: Vec<u8>,
            digest: index::Digest,
            subject_key: Vec<u8>,
            object_key: Vec<u8>,
            predicate_key: Vec<u8>,
        }
        let mut batch = Vec::with_capacity(relationships.len());
        for relationship in &relationships {
            let subject = relationship
                .subject
                .as_ref()
                .ok_or_else(|| Error::InvalidEdge("missing subject".to_string()))?;
            let object = relationship
                .object
                .as_ref()
                .ok_or_else(|| Error::InvalidEdge("missing object".to_string()))?;
            if keys::encode(subject)? == keys::encode(object)? {
                return Err(Error::InvalidEdge(
                    "subject and object are the same resource".to_string(),
                ));
            }
            if relationship.predicate.is_none() {
                return Err(Error::InvalidEdge("missing predicate".to_string()));
            }
            let predicate = relationship.predicate_full_name();
            if predicate.is_empty() {
                return Err(Error::InvalidEdge("predicate has no type URL".to_string()));
            }

            let marshaled = relationship.encode_to_vec();
            let digest = index::digest(&marshaled);
            batch.push(Prepared {
                marshaled,
                digest,
                subject_key: keys::index_subject_key(subject)?,
                object_key: keys::index_object_key(object)?,
                predicate_key: keys::index_predicate_key(predicate),
            });
        }

        {
            let mut kv = self.inner.kv.write().unwrap();
            for prepared in &batch {
                kv.put(
                    keys::relationship_key(&prepared.digest),
                    prepared.marshaled.clone(),
                );
                for key in [
                    &prepared.subject_key,
                    &prepared.object_key,
                    &prepared.predicate_key,
                ] {
                    let mut value = kv.get(key).map(|v| v.to_vec()).unwrap_or_default();
                    index::insert(&mut value, &prepared.digest);
                    kv.put(key.clone(), value);
                }
            }
        }

        for relationship in &relationships {
            self.publish(event(
                EventType::Add,
                vec![Object::from_relationship(relationship)],
            ))
            .await;
        }
        Ok(())
    }

    /// Fetch relationships matching every set facet of `query`.
    /// An empty result is the RelationshipsNotFound sentinel.
    pub async fn get_relationships(&self, query: Query<'_>) -> Result<Vec<Relationship>> {
        let _op = self.inner.ops.enter();

        let mut index_keys = Vec::new();
        if let Some(subject) = query.subject {
            index_keys.push(keys::index_subject_key(subject)?);
        }
        if let Some(object) = query.object {
            index_keys.push(keys::index_object_key(object)?);
        }
        if let Some(predicate) = query.predicate {
            index_keys.push(keys::index_predicate_key(predicate));
        }
        if index_keys.is_empty() {
            return Err(Error::EmptyQuery);
        }

        let kv = self.inner.kv.read().unwrap();
        let mut values = Vec::with_capacity(index_keys.len());
        for key in &index_keys {
            match kv.get(key) {
                Some(value) => values.push(value),
                None => return Err(Error::RelationshipsNotFound),
            }
        }

        let digests: Vec<&[u8]> = if values.len() == 1 {
            index::chunks(values[0]).collect()
        } else {
            index::intersect(&values)
        };

        let mut relationships = Vec::with_capacity(digests.len());
        for digest in digests {
            // A digest without its record would mean the index outlived the
            // relationship; the record is authoritative, so skip it.
            if let Some(value) = kv.get(&keys::relationship_key(digest)) {
                relationships.push(Relationship::decode(value)?);
            }
        }
        if relationships.is_empty() {
            return Err(Error::RelationshipsNotFound);
        }
        Ok(relationships)
    }

    async fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let pipe = self.inner.pipe.lock().unwrap().clone();
        if let Some(pipe) = pipe {
            // Fan-out applies backpressure: this send suspends while any
            // subscriber is slow to receive.
            let _ = pipe.send(event).await;
        }
    }

    pub(crate) fn snapshot_event(inner: &Inner) -> Event {
        let kv = inner.kv.read().unwrap();
        let mut objects = Vec::new();
        for (key, value) in kv.scan_prefix(keys::RELATIONSHIP_PREFIX.as_bytes()) {
            match Relationship::decode(value) {
                Ok(relationship) => objects.push(Object::from_relationship(&relationship)),
                Err(error) => tracing::error!(?key, %error, "skipping undecodable relationship"),
            }
        }
        for (key, value) in kv.scan_prefix(keys::RESOURCE_PREFIX.as_bytes()) {
            match Resource::decode(value) {
                Ok(resource) => objects.push(Object::from_resource(&resource)),
                Err(error) => tracing::error!(?key, %error, "skipping undecodable resource"),
            }
        }
        event(EventType::Add, objects)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn event(r#type: EventType, objects: Vec<Object>) -> Event {
    Event {
        r#type: r#type as i32,
        objects,
    }
}

fn ref_of(resource: &Resource) -> Result<ResourceRef> {
    resource.to_ref().ok_or_else(|| {
        Error::InvalidRef("resource is missing its type descriptor or metadata".to_string())
    })
}

fn metadata_mut(resource: &mut Resource) -> &mut ResourceMetadata {
    resource
        .metadata
        .as_mut()
        .expect("metadata presence is checked by ref_of")
}

// The update timestamp strictly advances even when the clock does not
// (rapid successive updates can observe the same wall time).
fn advance(
    now: pbjson_types::Timestamp,
    prev: Option<&pbjson_types::Timestamp>,
) -> pbjson_types::Timestamp {
    match prev {
        Some(prev) if (now.seconds, now.nanos) <= (prev.seconds, prev.nanos) => {
            if prev.nanos >= 999_999_999 {
                pbjson_types::Timestamp {
                    seconds: prev.seconds + 1,
                    nanos: 0,
                }
            } else {
                pbjson_types::Timestamp {
                    seconds: prev.seconds,
                    nanos: prev.nanos + 1,
                }
            }
        }
        _ => now,
    }
}

fn tombstone(r: &ResourceRef, deleted_at: pbjson_types::Timestamp) -> Resource {
    Resource {
        type_descriptor: Some(TypeDescriptor {
            kind: proto_intake::KIND_RESOURCE.to_string(),
            r#type: r.r#type.clone(),
        }),
        metadata: Some(ResourceMetadata {
            name: r.name.clone(),
            namespace: r.namespace.clone(),
            deleted_at: Some(deleted_at),
            ..Default::default()
        }),
        spec: None,
    }
}

#[derive(Default)]
pub(crate) struct OpGauge(AtomicI64);

impl OpGauge {
    pub fn enter(&self) -> OpGuard<'_> {
        self.0.fetch_add(1, Ordering::SeqCst);
        OpGuard(self)
    }

    pub fn read(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct OpGuard<'a>(&'a OpGauge);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}
