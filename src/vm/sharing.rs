//! Global registry of read-only, file-backed pages shared across processes.
//!
//! Keyed by a *file identity* (the executable's name, truncated to its
//! first 14 bytes and hashed against a fixed prime vector) and, within that,
//! by page index. Only pages resolved as read-only and file-backed are
//! ever registered here; eviction of a shared frame removes every owner at
//! once and drops the registry entry (invariant 3 in the data model).

use alloc::collections::BTreeMap;
use alloc::string::String;

use super::FrameId;

const PRIMES: [u64; 14] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43];

/// The outer key of the sharing registry: a file name truncated to 14 bytes
/// and hashed against [`PRIMES`]. Two distinct file names can collide on
/// this hash; [`SharingRegistry::lookup`] guards against that by comparing
/// the full name before returning a hit.
fn file_identity_hash(name: &str) -> u64 {
    name.as_bytes()
        .iter()
        .take(14)
        .zip(PRIMES.iter())
        .map(|(&byte, &prime)| u64::from(byte) * prime)
        .sum()
}

/// A back-reference a frame entry holds into the sharing registry, so
/// eviction of a shared frame can remove its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareKey {
    hash: u64,
    page_index: u64,
}

struct Record {
    full_name: String,
    frame: FrameId,
}

/// Two-level map: file identity hash → page index → resident frame.
#[derive(Default)]
pub struct SharingRegistry {
    table: BTreeMap<u64, BTreeMap<u64, Record>>,
}

impl SharingRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an existing shared frame for `(file_name, page_index)`. A
    /// hash hit whose stored full name differs from `file_name` is treated
    /// as a miss rather than an alias, per the truncated-hash collision
    /// guard.
    #[must_use]
    pub fn lookup(&self, file_name: &str, page_index: u64) -> Option<FrameId> {
        let hash = file_identity_hash(file_name);
        let record = self.table.get(&hash)?.get(&page_index)?;
        if record.full_name == file_name {
            Some(record.frame)
        } else {
            None
        }
    }

    /// Registers a new shared frame for `(file_name, page_index)`, returning
    /// the back-reference handle to store on the frame entry.
    pub fn insert(&mut self, file_name: &str, page_index: u64, frame: FrameId) -> ShareKey {
        let hash = file_identity_hash(file_name);
        self.table.entry(hash).or_default().insert(
            page_index,
            Record {
                full_name: String::from(file_name),
                frame,
            },
        );
        ShareKey { hash, page_index }
    }

    /// Removes the mapping named by `key`. If the outer (hash-level) table
    /// becomes empty, the outer entry is dropped too.
    pub fn remove(&mut self, key: ShareKey) {
        if let Some(inner) = self.table.get_mut(&key.hash) {
            inner.remove(&key.page_index);
            if inner.is_empty() {
                self.table.remove(&key.hash);
            }
        }
    }
}
