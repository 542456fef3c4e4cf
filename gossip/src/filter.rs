// Copyright (c) 2024 Botho Foundation

//! Probabilistic deduplication filter for received topology messages.
//!
//! A cuckoo filter over message digests: each digest is reduced to a 16-bit
//! fingerprint stored in one of two candidate buckets. Memory is fixed at
//! construction. When both buckets are full, resident fingerprints are
//! relocated for a bounded number of kicks; if that fails the last displaced
//! fingerprint is dropped. Forgetting a digest only means a message may be
//! relayed one more time.
//!
//! Messages carry no hop count, so the filter is all that stops a snapshot
//! from circulating. Its capacity must exceed the number of distinct messages
//! the overlay produces while one message crosses it, or duplicates are
//! forgotten before they return and get flooded again.

use crate::messages::Digest;
use parking_lot::Mutex;
use rand::Rng;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Fingerprint slots per bucket.
const BUCKET_SIZE: usize = 4;

/// Relocation attempts before a fingerprint is dropped.
const MAX_KICKS: usize = 500;

/// Marks an empty slot.
const EMPTY: u16 = 0;

/// Default number of digests the filter is sized for.
pub const DEFAULT_FILTER_CAPACITY: usize = 1000;

/// Largest capacity a filter is built with; larger requests are clamped.
pub const MAX_FILTER_CAPACITY: usize = 1 << 20;

type Bucket = [u16; BUCKET_SIZE];

#[derive(Debug)]
struct Table {
    buckets: Vec<Bucket>,
    mask: usize,
    len: usize,
    evictions: u64,
}

impl Table {
    fn contains(&self, index: usize, fingerprint: u16) -> bool {
        self.buckets[index].contains(&fingerprint)
    }

    fn try_place(&mut self, index: usize, fingerprint: u16) -> bool {
        if let Some(slot) = self.buckets[index].iter_mut().find(|s| **s == EMPTY) {
            *slot = fingerprint;
            self.len += 1;
            return true;
        }
        false
    }
}

/// Thread-safe cuckoo filter over 32-byte digests.
#[derive(Debug)]
pub struct DedupFilter {
    table: Mutex<Table>,
    k0: u64,
    k1: u64,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_CAPACITY)
    }
}

impl DedupFilter {
    /// Create a filter sized for roughly `capacity` digests, at most
    /// [`MAX_FILTER_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        let num_buckets = capacity
            .min(MAX_FILTER_CAPACITY)
            .div_ceil(BUCKET_SIZE)
            .max(1)
            .next_power_of_two();
        let mut rng = rand::thread_rng();

        Self {
            table: Mutex::new(Table {
                buckets: vec![[EMPTY; BUCKET_SIZE]; num_buckets],
                mask: num_buckets - 1,
                len: 0,
                evictions: 0,
            }),
            k0: rng.gen(),
            k1: rng.gen(),
        }
    }

    /// Whether `digest` has (probably) been seen.
    pub fn lookup(&self, digest: &Digest) -> bool {
        let table = self.table.lock();
        let (fingerprint, i1) = self.locate(digest, table.mask);
        let i2 = self.alt_index(i1, fingerprint, table.mask);
        table.contains(i1, fingerprint) || table.contains(i2, fingerprint)
    }

    /// Record `digest`. Inserting a digest twice has no further effect.
    pub fn insert(&self, digest: &Digest) {
        self.insert_unique(digest);
    }

    /// Record `digest` unless it is already present.
    ///
    /// Returns `true` if the digest was new. The check and the insertion
    /// happen under one lock, so concurrent callers with the same digest see
    /// exactly one `true`.
    pub fn insert_unique(&self, digest: &Digest) -> bool {
        let mut table = self.table.lock();
        let mask = table.mask;
        let (fingerprint, i1) = self.locate(digest, mask);
        let i2 = self.alt_index(i1, fingerprint, mask);

        if table.contains(i1, fingerprint) || table.contains(i2, fingerprint) {
            return false;
        }
        if table.try_place(i1, fingerprint) || table.try_place(i2, fingerprint) {
            return true;
        }

        let mut rng = rand::thread_rng();
        let mut index = if rng.gen::<bool>() { i1 } else { i2 };
        let mut homeless = fingerprint;
        for _ in 0..MAX_KICKS {
            let slot = rng.gen_range(0..BUCKET_SIZE);
            std::mem::swap(&mut homeless, &mut table.buckets[index][slot]);
            index = self.alt_index(index, homeless, mask);
            if table.try_place(index, homeless) {
                return true;
            }
        }

        // The table is saturated; forget whichever fingerprint is left over.
        table.evictions += 1;
        true
    }

    /// Number of fingerprints currently stored.
    pub fn len(&self) -> usize {
        self.table.lock().len
    }

    /// Whether the filter holds no fingerprints.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total fingerprint slots; the filter never grows beyond this.
    pub fn slots(&self) -> usize {
        self.table.lock().buckets.len() * BUCKET_SIZE
    }

    /// Number of fingerprints dropped because the table was saturated.
    pub fn evictions(&self) -> u64 {
        self.table.lock().evictions
    }

    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(bytes);
        hasher.finish()
    }

    fn locate(&self, digest: &Digest, mask: usize) -> (u16, usize) {
        let hash = self.hash_bytes(digest);
        let fingerprint = match (hash >> 48) as u16 {
            EMPTY => 1,
            fp => fp,
        };
        (fingerprint, hash as usize & mask)
    }

    fn alt_index(&self, index: usize, fingerprint: u16, mask: usize) -> usize {
        (index ^ self.hash_bytes(&fingerprint.to_le_bytes()) as usize) & mask
    }
}
