//! Canonical byte encoding of resource references and store keys.
//!
//! A reference encodes as `{type}/<url-safe-base64(path)>`, where `path` is
//! `kube/{cluster}/{namespace}/{name}`, `cloud/{account}/{region}/{group}/{name}`,
//! or a bare `{name}` for refs without a namespace. Empty namespace slots are
//! preserved as empty segments so the round trip is lossless. Two refs are
//! equal iff their encodings are byte-equal, which makes every index lookup a
//! byte compare.

use crate::{Error, Result};
use proto_intake::{namespace, Namespace, ResourceRef};

/// Key prefix of stored resources.
pub const RESOURCE_PREFIX: &str = "/rsrc/";
/// Key prefix of stored relationships.
pub const RELATIONSHIP_PREFIX: &str = "/rel/";
/// Key prefix of the relationship subject index.
pub const INDEX_SUBJECT_PREFIX: &str = "/idx/rel-subj/";
/// Key prefix of the relationship object index.
pub const INDEX_OBJECT_PREFIX: &str = "/idx/rel-obj/";
/// Key prefix of the relationship predicate index.
pub const INDEX_PREDICATE_PREFIX: &str = "/idx/rel-predicate/";

const KUBE_PREFIX: &str = "kube/";
const CLOUD_PREFIX: &str = "cloud/";

/// Encode a reference into its canonical string form.
pub fn encode(r: &ResourceRef) -> Result<String> {
    if r.r#type.is_empty() {
        return Err(Error::InvalidRef("reference type is empty".to_string()));
    }

    let path = match r.namespace.as_ref().map(|ns| ns.value.as_ref()) {
        None => r.name.clone(),
        Some(Some(namespace::Value::Kubernetes(k))) => {
            format!("{KUBE_PREFIX}{}/{}/{}", k.cluster, k.namespace, r.name)
        }
        Some(Some(namespace::Value::Cloud(c))) => format!(
            "{CLOUD_PREFIX}{}/{}/{}/{}",
            c.account, c.region, c.group, r.name
        ),
        Some(None) => {
            return Err(Error::InvalidRef(
                "namespace is set but carries no variant".to_string(),
            ))
        }
    };

    Ok(format!(
        "{}/{}",
        r.r#type,
        base64::encode_config(path, base64::URL_SAFE)
    ))
}

/// Decode a canonical reference encoding. Inverse of [`encode`].
pub fn decode(key: &str) -> Result<ResourceRef> {
    let (r#type, inner) = match key.split_once('/') {
        Some((t, rest)) if !t.is_empty() && !rest.is_empty() && !rest.contains('/') => (t, rest),
        _ => {
            return Err(Error::InvalidKey(format!(
                "'{key}' is not of the form type/base64-path"
            )))
        }
    };

    let path = base64::decode_config(inner, base64::URL_SAFE)
        .map_err(|err| Error::InvalidKey(format!("'{key}': {err}")))?;
    let path = String::from_utf8(path)
        .map_err(|err| Error::InvalidKey(format!("'{key}': {err}")))?;

    let (name, namespace) = if let Some(rest) = path.strip_prefix(KUBE_PREFIX) {
        let mut it = rest.splitn(3, '/');
        match (it.next(), it.next(), it.next()) {
            (Some(cluster), Some(namespace), Some(name)) => (
                name.to_string(),
                Some(Namespace {
                    value: Some(namespace::Value::Kubernetes(namespace::Kubernetes {
                        cluster: cluster.to_string(),
                        namespace: namespace.to_string(),
                    })),
                }),
            ),
            _ => {
                return Err(Error::InvalidKey(format!(
                    "'{key}' has a truncated kubernetes path"
                )))
            }
        }
    } else if let Some(rest) = path.strip_prefix(CLOUD_PREFIX) {
        let mut it = rest.splitn(4, '/');
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(account), Some(region), Some(group), Some(name)) => (
                name.to_string(),
                Some(Namespace {
                    value: Some(namespace::Value::Cloud(namespace::Cloud {
                        account: account.to_string(),
                        region: region.to_string(),
                        group: group.to_string(),
                    })),
                }),
            ),
            _ => {
                return Err(Error::InvalidKey(format!(
                    "'{key}' has a truncated cloud path"
                )))
            }
        }
    } else {
        (path, None)
    };

    Ok(ResourceRef {
        r#type: r#type.to_string(),
        name,
        namespace,
    })
}

/// Store key of the resource addressed by `r`.
pub fn resource_key(r: &ResourceRef) -> Result<Vec<u8>> {
    Ok([RESOURCE_PREFIX.as_bytes(), encode(r)?.as_bytes()].concat())
}

/// Store key of the relationship with content digest `digest`.
pub fn relationship_key(digest: &[u8]) -> Vec<u8> {
    [RELATIONSHIP_PREFIX.as_bytes(), digest].concat()
}

/// Subject-index key of the given reference.
pub fn index_subject_key(r: &ResourceRef) -> Result<Vec<u8>> {
    Ok([INDEX_SUBJECT_PREFIX.as_bytes(), encode(r)?.as_bytes()].concat())
}

/// Object-index key of the given reference.
pub fn index_object_key(r: &ResourceRef) -> Result<Vec<u8>> {
    Ok([INDEX_OBJECT_PREFIX.as_bytes(), encode(r)?.as_bytes()].concat())
}

/// Predicate-index key of the given predicate full name.
pub fn index_predicate_key(full_name: &str) -> Vec<u8> {
    [INDEX_PREDICATE_PREFIX.as_bytes(), full_name.as_bytes()].concat()
}
