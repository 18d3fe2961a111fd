//! Partitions a batch across writer streams. All ops against one namespace
//! land in the same stream, preserving their relative order; on doc-locking
//! engines, CRUD ops against ordinary collections are further dispersed by
//! the hash of the affected document's `_id`, so a single hot collection
//! still parallelizes.

use super::entry::{OpKind, OplogEntry};
use crate::storage::{CollectionProperties, Storage};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Computes the MurmurHash3 x86 32-bit hash of a byte string.
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k |= (byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^ (h >> 16)
}

/// Caches per-collection properties for the span of one batch, so they
/// aren't looked up repeatedly for every op against the same namespace.
pub struct CollectionPropertiesCache {
    cache: HashMap<String, CollectionProperties>,
}

impl CollectionPropertiesCache {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    pub fn get(&mut self, storage: &dyn Storage, ns: &str) -> CollectionProperties {
        if let Some(&properties) = self.cache.get(ns) {
            return properties;
        }
        let properties = storage.collection_properties(ns);
        self.cache.insert(ns.to_string(), properties);
        properties
    }
}

/// Hashes an op's `_id` with the simple value comparator semantics.
fn id_hash(id: Option<&crate::document::Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Routes every entry to exactly one of `num_writers` streams, returning the
/// entries' indexes per stream in producer order. Also marks inserts into
/// capped collections on the entries themselves, so the apply stage refuses
/// to group them.
pub fn fill_writer_streams(
    storage: &dyn Storage,
    ops: &mut [OplogEntry],
    num_writers: usize,
) -> Vec<Vec<usize>> {
    let supports_doc_locking = storage.supports_doc_locking();
    let mut cache = CollectionPropertiesCache::new();
    let mut streams: Vec<Vec<usize>> = vec![Vec::new(); num_writers];

    for (index, op) in ops.iter_mut().enumerate() {
        let mut hash = murmur3_x86_32(op.ns.as_bytes(), 0);

        if op.is_crud() {
            let properties = cache.get(storage, &op.ns);

            // For doc-locking engines, include the _id of the document in
            // the hash so we get parallelism even if all writes are to a
            // single collection. Illegal for capped collections, which must
            // preserve insertion order, and for collections with a
            // non-simple default collation, whose _id cannot be hashed with
            // respect to the collation.
            if supports_doc_locking && !properties.capped && !properties.has_nonsimple_collation {
                hash = murmur3_x86_32(&id_hash(op.id_value()).to_le_bytes(), hash);
            }

            if op.kind == OpKind::Insert && properties.capped {
                op.is_for_capped_collection = true;
            }
        }

        let stream = &mut streams[hash as usize % num_writers];
        if stream.is_empty() {
            stream.reserve(8); // skip a few growth rounds
        }
        stream.push(index);
    }

    streams
}
