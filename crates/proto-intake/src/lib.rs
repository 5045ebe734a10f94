//! Wire model of the inventory graph and its intake protocol.
//!
//! Messages are maintained by hand in the layout `prost-build` emits, so that
//! the encoded bytes stay wire-compatible with the intake service's protobuf
//! definitions (`intake.v1`).

pub mod relation;

mod grpc;
pub use grpc::{intake_service_client, intake_service_server};

/// TypeDescriptor names the coarse kind and concrete type of a graph entity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypeDescriptor {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
}

/// Namespace is the tagged namespace variant of a ResourceRef.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Namespace {
    #[prost(oneof = "namespace::Value", tags = "1, 2")]
    pub value: Option<namespace::Value>,
}

pub mod namespace {
    /// A namespace within a cloud provider account.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Cloud {
        #[prost(string, tag = "1")]
        pub account: String,
        #[prost(string, tag = "2")]
        pub region: String,
        #[prost(string, tag = "3")]
        pub group: String,
    }

    /// A namespace within a Kubernetes cluster.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Kubernetes {
        #[prost(string, tag = "1")]
        pub cluster: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        Cloud(Cloud),
        #[prost(message, tag = "2")]
        Kubernetes(Kubernetes),
    }
}

/// ResourceRef addresses a single resource vertex.
/// Two refs are equal iff their byte encodings match exactly.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceRef {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, optional, tag = "3")]
    pub namespace: Option<Namespace>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceMetadata {
    #[prost(string, tag = "1")]
    pub provider: String,
    #[prost(string, tag = "2")]
    pub provider_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(message, optional, tag = "4")]
    pub namespace: Option<Namespace>,
    #[prost(string, tag = "5")]
    pub region: String,
    #[prost(string, tag = "6")]
    pub zone: String,
    #[prost(string, repeated, tag = "7")]
    pub tags: Vec<String>,
    #[prost(message, optional, tag = "8")]
    pub created_at: Option<::pbjson_types::Timestamp>,
    #[prost(message, optional, tag = "9")]
    pub updated_at: Option<::pbjson_types::Timestamp>,
    #[prost(message, optional, tag = "10")]
    pub deleted_at: Option<::pbjson_types::Timestamp>,
}

/// Resource is a typed vertex of the inventory graph.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(message, optional, tag = "1")]
    pub type_descriptor: Option<TypeDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<ResourceMetadata>,
    #[prost(message, optional, tag = "3")]
    pub spec: Option<Any>,
}

/// Relationship is a directed edge: a subject / predicate / object triple.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Relationship {
    #[prost(message, optional, tag = "1")]
    pub type_descriptor: Option<TypeDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub subject: Option<ResourceRef>,
    #[prost(message, optional, tag = "3")]
    pub object: Option<ResourceRef>,
    #[prost(message, optional, tag = "4")]
    pub predicate: Option<Any>,
}

/// Any is a `google.protobuf.Any`-compatible type-URL-tagged opaque payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Object is a type-descriptor plus tagged payload, carried by events and deltas.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Object {
    #[prost(message, optional, tag = "1")]
    pub type_descriptor: Option<TypeDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub payload: Option<Any>,
}

/// Event is a committed store mutation, fanned out to subscribers.
/// Events are immutable after publication.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(enumeration = "EventType", tag = "1")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "2")]
    pub objects: Vec<Object>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    InvalidEventType = 0,
    Add = 1,
    Update = 2,
    Delete = 3,
}

/// Delta is the wire representation of one create / update / delete.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Delta {
    #[prost(enumeration = "Operation", tag = "1")]
    pub op: i32,
    #[prost(message, repeated, tag = "2")]
    pub objects: Vec<Object>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Operation {
    InvalidOperation = 0,
    Create = 1,
    Update = 2,
    Delete = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaRequest {
    #[prost(message, repeated, tag = "1")]
    pub deltas: Vec<Delta>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct DeltaResponse {}

/// Type-URL prefix under which all `intake.v1` payloads are tagged.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Descriptor kind of resource objects.
pub const KIND_RESOURCE: &str = "resource";
/// Descriptor kind of relationship objects.
pub const KIND_RELATIONSHIP: &str = "relationship";

impl Any {
    /// Pack a message under its `intake.v1` type URL.
    pub fn pack<M: prost::Message + prost::Name>(msg: &M) -> Any {
        Any {
            type_url: format!("{}{}", TYPE_URL_PREFIX, M::full_name()),
            value: msg.encode_to_vec(),
        }
    }

    /// The full message name of the payload: its type URL without any
    /// leading `host/` prefix.
    pub fn full_name(&self) -> &str {
        match self.type_url.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.type_url,
        }
    }
}

impl prost::Name for Resource {
    const NAME: &'static str = "Resource";
    const PACKAGE: &'static str = "intake.v1";
}

impl prost::Name for Relationship {
    const NAME: &'static str = "Relationship";
    const PACKAGE: &'static str = "intake.v1";
}

impl Relationship {
    /// Full message name of this relationship's predicate, or "" if unset.
    pub fn predicate_full_name(&self) -> &str {
        self.predicate.as_ref().map(Any::full_name).unwrap_or("")
    }
}

impl Resource {
    /// The reference addressing this resource, drawn from its descriptor
    /// type and metadata name / namespace. None if either is unset.
    pub fn to_ref(&self) -> Option<ResourceRef> {
        let descriptor = self.type_descriptor.as_ref()?;
        let metadata = self.metadata.as_ref()?;
        Some(ResourceRef {
            r#type: descriptor.r#type.clone(),
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
        })
    }
}

impl Object {
    /// Wrap a Resource as an event / delta Object, deep-cloning its payload.
    pub fn from_resource(resource: &Resource) -> Object {
        Object {
            type_descriptor: resource.type_descriptor.clone(),
            payload: Some(Any::pack(resource)),
        }
    }

    /// Wrap a Relationship as an event / delta Object.
    pub fn from_relationship(relationship: &Relationship) -> Object {
        Object {
            type_descriptor: relationship.type_descriptor.clone(),
            payload: Some(Any::pack(relationship)),
        }
    }
}

/// Map a std::time::SystemTime into a protobuf Timestamp.
pub fn as_timestamp(t: std::time::SystemTime) -> ::pbjson_types::Timestamp {
    let dur = t
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time is after the unix epoch");
    ::pbjson_types::Timestamp {
        seconds: dur.as_secs() as i64,
        nanos: dur.subsec_nanos() as i32,
    }
}
