//! Secondary index values: concatenations of fixed-size content digests,
//! kept sorted ascending.
//!
//! Relationship identity is content-addressed, so identical edges dedupe
//! naturally and an index value is a compact fixed-stride byte string:
//! splitting is arithmetic, removal is a binary search and splice, and
//! intersecting many indexes is a single hash-counting pass.

use sha2::{Digest as _, Sha256};
use std::collections::HashMap;

/// Size of one relationship content digest (SHA-256).
pub(crate) const DIGEST_LEN: usize = 32;

pub(crate) type Digest = [u8; DIGEST_LEN];

/// Content digest of a marshaled relationship.
pub(crate) fn digest(marshaled: &[u8]) -> Digest {
    Sha256::digest(marshaled).into()
}

/// Iterate the digests of an index value.
pub(crate) fn chunks(value: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    debug_assert_eq!(value.len() % DIGEST_LEN, 0);
    value.chunks_exact(DIGEST_LEN)
}

// Binary search over the fixed-stride digests of `value`.
fn search(value: &[u8], digest: &Digest) -> Result<usize, usize> {
    let n = value.len() / DIGEST_LEN;
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match value[mid * DIGEST_LEN..(mid + 1) * DIGEST_LEN].cmp(digest.as_slice()) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Insert `digest` into the sorted value, unless already present.
/// Returns false if it was already indexed.
pub(crate) fn insert(value: &mut Vec<u8>, digest: &Digest) -> bool {
    match search(value, digest) {
        Ok(_) => false,
        Err(at) => {
            let at = at * DIGEST_LEN;
            value.splice(at..at, digest.iter().copied());
            true
        }
    }
}

/// Splice `digest` out of the sorted value. Returns false if absent.
pub(crate) fn remove(value: &mut Vec<u8>, digest: &Digest) -> bool {
    match search(value, digest) {
        Ok(at) => {
            let at = at * DIGEST_LEN;
            value.drain(at..at + DIGEST_LEN);
            true
        }
        Err(_) => false,
    }
}

/// Digests present in every one of `values`.
/// Digests are unique within a value, so a digest intersects iff its
/// occurrence count across all values equals the number of values.
pub(crate) fn intersect<'v>(values: &[&'v [u8]]) -> Vec<&'v [u8]> {
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for value in values {
        for chunk in chunks(value) {
            *counts.entry(chunk).or_default() += 1;
        }
    }
    // Iterate one value (rather than the map) to keep the output sorted.
    chunks(values[0])
        .filter(|chunk| counts.get(chunk) == Some(&values.len()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn d(fill: u8) -> Digest {
        [fill; DIGEST_LEN]
    }

    #[test]
    fn insert_keeps_value_sorted_and_deduped() {
        let mut value = Vec::new();
        assert!(insert(&mut value, &d(7)));
        assert!(insert(&mut value, &d(1)));
        assert!(insert(&mut value, &d(4)));
        assert!(!insert(&mut value, &d(4)));

        let got: Vec<_> = chunks(&value).collect();
        assert_eq!(got, vec![&d(1)[..], &d(4)[..], &d(7)[..]]);
    }

    #[test]
    fn remove_splices_in_place() {
        let mut value = Vec::new();
        for fill in [1, 4, 7] {
            insert(&mut value, &d(fill));
        }

        assert!(remove(&mut value, &d(4)));
        assert!(!remove(&mut value, &d(4)));
        assert_eq!(chunks(&value).count(), 2);

        assert!(remove(&mut value, &d(1)));
        assert!(remove(&mut value, &d(7)));
        assert!(value.is_empty());
    }

    #[test]
    fn intersection_of_many_values() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let mut c = Vec::new();
        for fill in [1, 2, 3] {
            insert(&mut a, &d(fill));
        }
        for fill in [2, 3, 4] {
            insert(&mut b, &d(fill));
        }
        for fill in [0, 3] {
            insert(&mut c, &d(fill));
        }

        let got = intersect(&[&a, &b, &c]);
        assert_eq!(got, vec![&d(3)[..]]);

        let got = intersect(&[&a, &b]);
        assert_eq!(got, vec![&d(2)[..], &d(3)[..]]);
    }

    #[test]
    fn digests_are_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"abc").len(), DIGEST_LEN);
    }
}
