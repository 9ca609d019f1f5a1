//! Connection-indexed verdict cache.
//!
//! A fixed power-of-two bucket array. Every bucket head is an atomically
//! swapped pointer to an immutable chain of slots, so readers walk chains
//! without taking any lock; writers serialize per bucket with a short
//! mutex and publish rebuilt chains. A record occupies two slots, one per
//! flow direction, so reply-direction lookups hit without recomputation.
//!
//! Records and chain nodes are reference-counted: a reader that obtained a
//! record keeps it (and the entities it references) alive after the writer
//! unlinks it. That is the whole deferred-reclamation story — a record's
//! storage can never be reused under a reader, so no key recheck after the
//! fact is needed.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::matcher::Verdict;
use crate::types::{FlowTuple, TenancyTag};

/// Default bucket count for [`VerdictCache::new`] callers that have no
/// better idea.
pub const DEFAULT_CACHE_BUCKETS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnKey {
    tuple: FlowTuple,
    tag: TenancyTag,
}

/// The classification pinned to one live connection.
#[derive(Debug)]
pub struct VerdictRecord {
    session_id: u64,
    generation: u64,
    started: SystemTime,
    tag: TenancyTag,
    tuples: [FlowTuple; 2],
    verdict: Verdict,
}

impl VerdictRecord {
    pub(crate) fn new(
        session_id: u64,
        generation: u64,
        tag: TenancyTag,
        original: FlowTuple,
        verdict: Verdict,
    ) -> Self {
        Self {
            session_id,
            generation,
            started: SystemTime::now(),
            tag,
            tuples: [original, original.reply()],
            verdict,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Snapshot generation the verdict was computed against.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    pub fn tag(&self) -> TenancyTag {
        self.tag
    }

    pub fn original_tuple(&self) -> FlowTuple {
        let [original, _] = self.tuples;
        original
    }

    pub fn reply_tuple(&self) -> FlowTuple {
        let [_, reply] = self.tuples;
        reply
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }
}

struct Slot {
    key: ConnKey,
    record: Arc<VerdictRecord>,
    next: Option<Arc<Slot>>,
}

struct Bucket {
    head: ArcSwapOption<Slot>,
    write_lock: Mutex<()>,
}

/// The connection-keyed verdict cache.
pub struct VerdictCache {
    buckets: Box<[Bucket]>,
    mask: usize,
    hasher: RandomState,
    records: AtomicUsize,
}

impl VerdictCache {
    /// Create a cache with at least `buckets` buckets (rounded up to a
    /// power of two).
    pub fn new(buckets: usize) -> Self {
        let count = buckets.max(1).next_power_of_two();
        let buckets: Vec<Bucket> = (0..count)
            .map(|_| Bucket {
                head: ArcSwapOption::from(None),
                write_lock: Mutex::new(()),
            })
            .collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: count - 1,
            hasher: RandomState::new(),
            records: AtomicUsize::new(0),
        }
    }

    /// Number of cached records (connections, not slots).
    pub fn len(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_of(&self, key: &ConnKey) -> Option<(usize, &Bucket)> {
        let index = (self.hasher.hash_one(key) as usize) & self.mask;
        self.buckets.get(index).map(|b| (index, b))
    }

    fn chain_find(head: Option<Arc<Slot>>, key: &ConnKey) -> Option<Arc<VerdictRecord>> {
        let mut node = head;
        while let Some(slot) = node {
            if slot.key == *key {
                return Some(slot.record.clone());
            }
            node = slot.next.clone();
        }
        None
    }

    /// Lock-free lookup by flow tuple (either direction) and tenancy tag.
    pub fn lookup(&self, tuple: &FlowTuple, tag: TenancyTag) -> Option<Arc<VerdictRecord>> {
        let key = ConnKey { tuple: *tuple, tag };
        let (_, bucket) = self.bucket_of(&key)?;
        Self::chain_find(bucket.head.load_full(), &key)
    }

    /// Install a record under both of its direction keys. If a record for
    /// the connection is already present, the existing one wins. Returns
    /// the effective record and whether this call inserted it.
    pub fn insert(&self, record: Arc<VerdictRecord>) -> (Arc<VerdictRecord>, bool) {
        let key0 = ConnKey {
            tuple: record.original_tuple(),
            tag: record.tag,
        };
        let key1 = ConnKey {
            tuple: record.reply_tuple(),
            tag: record.tag,
        };
        let Some((index0, bucket0)) = self.bucket_of(&key0) else {
            return (record, false);
        };
        let Some((index1, bucket1)) = self.bucket_of(&key1) else {
            return (record, false);
        };

        let (_low_guard, _high_guard) = lock_pair(index0, bucket0, index1, bucket1);

        // Re-check under the lock: only one record per connection.
        if let Some(existing) = Self::chain_find(bucket0.head.load_full(), &key0) {
            return (existing, false);
        }

        let slot0 = Arc::new(Slot {
            key: key0,
            record: record.clone(),
            next: bucket0.head.load_full(),
        });
        bucket0.head.store(Some(slot0));
        let slot1 = Arc::new(Slot {
            key: key1,
            record: record.clone(),
            next: bucket1.head.load_full(),
        });
        bucket1.head.store(Some(slot1));

        self.records.fetch_add(1, Ordering::Relaxed);
        (record, true)
    }

    /// Unlink the record for a connection, addressed by either direction's
    /// tuple. Readers already holding the record keep it alive.
    pub fn remove(&self, tuple: &FlowTuple, tag: TenancyTag) -> Option<Arc<VerdictRecord>> {
        let record = self.lookup(tuple, tag)?;
        let key0 = ConnKey {
            tuple: record.original_tuple(),
            tag: record.tag,
        };
        let key1 = ConnKey {
            tuple: record.reply_tuple(),
            tag: record.tag,
        };
        let (index0, bucket0) = self.bucket_of(&key0)?;
        let (index1, bucket1) = self.bucket_of(&key1)?;

        let (_low_guard, _high_guard) = lock_pair(index0, bucket0, index1, bucket1);

        let removed = unlink(&bucket0.head, &key0);
        unlink(&bucket1.head, &key1);

        if removed.is_some() {
            self.records.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }
}

/// Take both bucket write locks in index order; a single lock when the
/// keys landed in the same bucket.
fn lock_pair<'a>(
    index0: usize,
    bucket0: &'a Bucket,
    index1: usize,
    bucket1: &'a Bucket,
) -> (parking_lot::MutexGuard<'a, ()>, Option<parking_lot::MutexGuard<'a, ()>>) {
    if index0 == index1 {
        (bucket0.write_lock.lock(), None)
    } else if index0 < index1 {
        let low = bucket0.write_lock.lock();
        let high = bucket1.write_lock.lock();
        (low, Some(high))
    } else {
        let low = bucket1.write_lock.lock();
        let high = bucket0.write_lock.lock();
        (low, Some(high))
    }
}

/// Rebuild a chain without `key`, preserving order. Must run under the
/// bucket's write lock.
fn unlink(head: &ArcSwapOption<Slot>, key: &ConnKey) -> Option<Arc<VerdictRecord>> {
    let mut removed = None;
    let mut kept: Vec<(ConnKey, Arc<VerdictRecord>)> = Vec::new();
    let mut node = head.load_full();
    while let Some(slot) = node {
        if slot.key == *key && removed.is_none() {
            removed = Some(slot.record.clone());
        } else {
            kept.push((slot.key, slot.record.clone()));
        }
        node = slot.next.clone();
    }
    if removed.is_some() {
        let mut new_head: Option<Arc<Slot>> = None;
        for (key, record) in kept.into_iter().rev() {
            new_head = Some(Arc::new(Slot {
                key,
                record,
                next: new_head,
            }));
        }
        head.store(new_head);
    }
    removed
}
