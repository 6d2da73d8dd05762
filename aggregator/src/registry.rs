// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory batch registry.
//!
//! The aggregation service keys tasks by a `u32` index while everything
//! on chain is keyed by the batch identifier hash, so the registry maintains
//! the bijection between the two. Nothing here survives a restart: indices
//! restart at zero and the registry repopulates from fresh events plus the
//! historical scan.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Everything the aggregator keeps per batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchData {
    pub batch_merkle_root: [u8; 32],
    pub sender_address: [u8; 20],
    pub identifier_hash: [u8; 32],
    pub index: u32,
    pub created_block: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An insert carried the identifier of a known batch but different
    /// contents: a hash collision or a caller bug, never a retryable
    /// condition.
    #[error("batch data mismatch for identifier hash 0x{}", hex::encode(.0))]
    DataMismatch([u8; 32]),
}

/// Result of [`BatchRegistry::insert`]: either a fresh entry or the data
/// already stored for the identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inserted {
    New(BatchData),
    Existing(BatchData),
}

impl Inserted {
    pub fn data(&self) -> &BatchData {
        match self {
            Inserted::New(data) | Inserted::Existing(data) => data,
        }
    }

    pub fn into_data(self) -> BatchData {
        match self {
            Inserted::New(data) | Inserted::Existing(data) => data,
        }
    }
}

struct RegistryInner {
    by_identifier: HashMap<[u8; 32], BatchData>,
    identifier_by_index: HashMap<u32, [u8; 32]>,
    next_index: u32,
    last_deleted_index: u32,
}

/// Concurrent map of identifier → batch data with monotonically assigned
/// indices and a two-way lookup. One mutex guards all four fields; no
/// operation suspends while holding it.
pub struct BatchRegistry {
    inner: Mutex<RegistryInner>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                by_identifier: HashMap::new(),
                identifier_by_index: HashMap::new(),
                next_index: 0,
                // u32::MAX so the first garbage-collection sweep starts at
                // index 0; deletion ranges are `last + 1 ..= target`.
                last_deleted_index: u32::MAX,
            }),
        }
    }

    pub fn get_by_index(&self, index: u32) -> Option<BatchData> {
        let mut inner = self.inner.lock();
        let hash = *inner.identifier_by_index.get(&index)?;
        match inner.by_identifier.get(&hash) {
            Some(data) => Some(data.clone()),
            None => {
                tracing::warn!(
                    batch_index = index,
                    batch_identifier_hash = %hex::encode(hash),
                    "Dangling index in batch registry, removing"
                );
                inner.identifier_by_index.remove(&index);
                None
            }
        }
    }

    pub fn get_by_identifier(&self, identifier_hash: [u8; 32]) -> Option<BatchData> {
        let mut inner = self.inner.lock();
        let data = inner.by_identifier.get(&identifier_hash)?.clone();
        match inner.identifier_by_index.get(&data.index) {
            None => {
                tracing::warn!(
                    batch_index = data.index,
                    batch_identifier_hash = %hex::encode(identifier_hash),
                    "Missing index entry for known batch, reinserting"
                );
                inner
                    .identifier_by_index
                    .insert(data.index, identifier_hash);
            }
            Some(hash) if *hash != data.identifier_hash => {
                tracing::error!(
                    batch_index = data.index,
                    expected_identifier_hash = %hex::encode(data.identifier_hash),
                    found_identifier_hash = %hex::encode(hash),
                    "Inconsistent identifier-index link in batch registry"
                );
            }
            Some(_) => {}
        }
        Some(data)
    }

    /// Registers a batch, assigning the next free index.
    ///
    /// Re-inserting an identifier with identical contents is a no-op that
    /// returns the stored data; differing contents are rejected without
    /// mutating anything.
    pub fn insert(
        &self,
        batch_merkle_root: [u8; 32],
        sender_address: [u8; 20],
        identifier_hash: [u8; 32],
        created_block: u64,
    ) -> Result<Inserted, RegistryError> {
        let mut inner = self.inner.lock();

        let mut index = inner.next_index;
        while inner.identifier_by_index.contains_key(&index) {
            tracing::error!(batch_index = index, "Attempted to reuse batch index, bumping");
            index += 1;
        }
        // Even on an early return this is the first free index.
        inner.next_index = index;

        if let Some(existing) = inner.by_identifier.get(&identifier_hash) {
            let matches = existing.batch_merkle_root == batch_merkle_root
                && existing.sender_address == sender_address
                && existing.created_block == created_block;
            if !matches {
                tracing::error!(
                    batch_identifier_hash = %hex::encode(identifier_hash),
                    "Different batch data under a known identifier, hash collision or caller bug"
                );
                return Err(RegistryError::DataMismatch(identifier_hash));
            }
            tracing::warn!(
                batch_identifier_hash = %hex::encode(identifier_hash),
                "Duplicate insert into batch registry"
            );
            return Ok(Inserted::Existing(existing.clone()));
        }

        let data = BatchData {
            batch_merkle_root,
            sender_address,
            identifier_hash,
            index,
            created_block,
        };
        inner.by_identifier.insert(identifier_hash, data.clone());
        inner.identifier_by_index.insert(index, identifier_hash);
        inner.next_index = index + 1;
        tracing::info!(
            batch_index = index,
            batch_identifier_hash = %hex::encode(identifier_hash),
            "New batch added to registry"
        );
        Ok(Inserted::New(data))
    }

    /// Removes every index from the last deleted one (exclusive) through the
    /// index of `identifier_hash` (inclusive). Unknown identifiers are a
    /// no-op: the GC probe may race a restart.
    pub fn delete_up_to(&self, identifier_hash: [u8; 32]) {
        let mut inner = self.inner.lock();
        let Some(target) = inner.by_identifier.get(&identifier_hash).map(|data| data.index) else {
            return;
        };

        let mut index = inner.last_deleted_index.wrapping_add(1);
        while index <= target {
            match inner.identifier_by_index.remove(&index) {
                None => {
                    tracing::warn!(batch_index = index, "No batch at index during cleanup");
                }
                Some(hash) => {
                    if inner.by_identifier.remove(&hash).is_none() {
                        tracing::warn!(
                            batch_index = index,
                            batch_identifier_hash = %hex::encode(hash),
                            "No batch data for identifier during cleanup"
                        );
                    } else {
                        tracing::info!(
                            batch_index = index,
                            batch_identifier_hash = %hex::encode(hash),
                            "Batch deleted from registry"
                        );
                    }
                }
            }
            if index == target {
                break;
            }
            index += 1;
        }
        inner.last_deleted_index = target;
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock();
        for (index, hash) in &inner.identifier_by_index {
            let data = inner
                .by_identifier
                .get(hash)
                .unwrap_or_else(|| panic!("index {index} points at missing identifier"));
            assert_eq!(data.index, *index);
            assert_eq!(data.identifier_hash, *hash);
        }
        for (hash, data) in &inner.by_identifier {
            let linked = inner
                .identifier_by_index
                .get(&data.index)
                .unwrap_or_else(|| panic!("identifier {} has no index entry", hex::encode(hash)));
            assert_eq!(linked, hash);
        }
    }
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_ok, assert_some};
    use proptest::prelude::*;

    fn sample(seed: u8, created_block: u64) -> ([u8; 32], [u8; 20], [u8; 32], u64) {
        ([seed; 32], [seed; 20], [seed.wrapping_add(100); 32], created_block)
    }

    fn insert_sample(registry: &BatchRegistry, seed: u8) -> BatchData {
        let (root, sender, hash, block) = sample(seed, 100 + u64::from(seed));
        assert_ok!(registry.insert(root, sender, hash, block)).into_data()
    }

    #[test]
    fn indices_are_assigned_monotonically_from_zero() {
        let registry = BatchRegistry::new();
        for seed in 0..5u8 {
            let data = insert_sample(&registry, seed);
            assert_eq!(data.index, u32::from(seed));
        }
    }

    #[test]
    fn lookups_are_symmetric() {
        let registry = BatchRegistry::new();
        let data = insert_sample(&registry, 1);

        let by_index = assert_some!(registry.get_by_index(data.index));
        assert_eq!(by_index, data);
        let by_hash = assert_some!(registry.get_by_identifier(data.identifier_hash));
        assert_eq!(by_hash, data);

        assert_none!(registry.get_by_index(17));
        assert_none!(registry.get_by_identifier([9u8; 32]));
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let registry = BatchRegistry::new();
        let (root, sender, hash, block) = sample(1, 100);
        let first = assert_ok!(registry.insert(root, sender, hash, block));
        assert!(matches!(first, Inserted::New(_)));

        let second = assert_ok!(registry.insert(root, sender, hash, block));
        match second {
            Inserted::Existing(data) => assert_eq!(&data, first.data()),
            Inserted::New(_) => panic!("duplicate insert must not create a new entry"),
        }

        // The duplicate did not consume an index.
        let next = insert_sample(&registry, 2);
        assert_eq!(next.index, 1);
    }

    #[test]
    fn mismatched_insert_is_rejected_without_mutation() {
        let registry = BatchRegistry::new();
        let (root, sender, hash, block) = sample(1, 100);
        assert_ok!(registry.insert(root, sender, hash, block));

        let error = registry
            .insert([2u8; 32], sender, hash, block)
            .expect_err("different merkle root under the same identifier");
        assert!(matches!(error, RegistryError::DataMismatch(h) if h == hash));

        // The stored entry is untouched.
        let stored = assert_some!(registry.get_by_identifier(hash));
        assert_eq!(stored.batch_merkle_root, root);
        registry.assert_consistent();
    }

    #[test]
    fn delete_up_to_removes_a_contiguous_prefix() {
        let registry = BatchRegistry::new();
        let batches: Vec<_> = (0..6u8).map(|seed| insert_sample(&registry, seed)).collect();

        registry.delete_up_to(batches[2].identifier_hash);
        for deleted in &batches[..3] {
            assert_none!(registry.get_by_index(deleted.index));
            assert_none!(registry.get_by_identifier(deleted.identifier_hash));
        }
        for kept in &batches[3..] {
            assert_some!(registry.get_by_index(kept.index));
        }
        registry.assert_consistent();

        // A second sweep picks up where the first stopped.
        registry.delete_up_to(batches[4].identifier_hash);
        assert_none!(registry.get_by_index(3));
        assert_none!(registry.get_by_index(4));
        assert_some!(registry.get_by_index(5));
        registry.assert_consistent();
    }

    #[test]
    fn delete_up_to_unknown_identifier_is_a_noop() {
        let registry = BatchRegistry::new();
        insert_sample(&registry, 0);
        registry.delete_up_to([42u8; 32]);
        assert_some!(registry.get_by_index(0));
        registry.assert_consistent();
    }

    #[test]
    fn indices_are_not_reused_after_deletion() {
        let registry = BatchRegistry::new();
        let first = insert_sample(&registry, 0);
        registry.delete_up_to(first.identifier_hash);
        let second = insert_sample(&registry, 1);
        assert_eq!(second.index, 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(u8),
        ReInsert(u8),
        DeleteUpTo(u8),
        Lookup(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32).prop_map(Op::Insert),
            (0u8..32).prop_map(Op::ReInsert),
            (0u8..32).prop_map(Op::DeleteUpTo),
            (0u8..32).prop_map(Op::Lookup),
        ]
    }

    proptest! {
        /// Invariant: after any sequence of operations the two maps agree in
        /// both directions.
        #[test]
        fn maps_stay_consistent(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let registry = BatchRegistry::new();
            for op in ops {
                match op {
                    Op::Insert(seed) | Op::ReInsert(seed) => {
                        let (root, sender, hash, block) = sample(seed, 100);
                        // Identical contents per seed, so every insert is
                        // either fresh or a clean duplicate.
                        let _ = registry.insert(root, sender, hash, block);
                    }
                    Op::DeleteUpTo(seed) => {
                        let (_, _, hash, _) = sample(seed, 100);
                        registry.delete_up_to(hash);
                    }
                    Op::Lookup(seed) => {
                        let (_, _, hash, _) = sample(seed, 100);
                        let _ = registry.get_by_identifier(hash);
                    }
                }
                registry.assert_consistent();
            }
        }

        /// Deletion removes exactly the indices between the previous sweep's
        /// target (exclusive) and the new target (inclusive).
        #[test]
        fn deletion_is_contiguous(count in 2u8..24, split in 0u8..24) {
            let registry = BatchRegistry::new();
            let batches: Vec<_> =
                (0..count).map(|seed| insert_sample(&registry, seed)).collect();
            let split = usize::from(split.min(count - 1));

            registry.delete_up_to(batches[split].identifier_hash);
            for batch in &batches[..=split] {
                prop_assert!(registry.get_by_identifier(batch.identifier_hash).is_none());
            }
            for batch in &batches[split + 1..] {
                prop_assert!(registry.get_by_identifier(batch.identifier_hash).is_some());
            }
            registry.assert_consistent();
        }
    }
}
