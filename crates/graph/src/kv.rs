//! The sorted key/value map backing the store.
//!
//! Mutations run under the store-wide writer lock, which is what makes each
//! operation transactional: validation happens before the first write, and a
//! reader can never observe a partially-applied operation.

use std::collections::BTreeMap;

#[derive(Default)]
pub(crate) struct Kv(BTreeMap<Vec<u8>, Vec<u8>>);

impl Kv {
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.0.insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.0.remove(key).is_some()
    }

    /// Iterate entries whose key begins with `prefix`, in key order.
    pub fn scan_prefix<'s>(
        &'s self,
        prefix: &'s [u8],
    ) -> impl Iterator<Item = (&'s [u8], &'s [u8])> + 's {
        self.0
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}
