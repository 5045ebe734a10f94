//! An in-memory graph of inventory resources and their relationships.
//!
//! The store keeps two entity kinds: resources (vertices) and relationships
//! (subject / predicate / object edges), backed by a sorted key/value map
//! with secondary indexes over every edge facet. Committed mutations are
//! published to subscribers; the upstream intake service is the system of
//! record, so nothing here persists across restarts.

pub mod keys;

mod index;
mod kv;
mod router;
mod store;

pub use store::{Query, Store};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The addressed resource is not in the store. Expected; carried to
    /// callers unchanged.
    #[error("resource not found")]
    ResourceNotFound,
    /// No relationship matches the query. Expected; carried to callers
    /// unchanged.
    #[error("relationships not found")]
    RelationshipsNotFound,
    #[error("resource already exists")]
    ResourceExists,
    #[error("invalid resource reference: {0}")]
    InvalidRef(String),
    #[error("invalid store key: {0}")]
    InvalidKey(String),
    #[error("invalid relationship: {0}")]
    InvalidEdge(String),
    #[error("query requires at least one of subject, object, or predicate")]
    EmptyQuery,
    #[error("decoding stored value")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
