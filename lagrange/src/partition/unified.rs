//! Range-partitioned index over a whole table.
//!
//! The key space is divided into an ordered list of [`Partition`]s, each
//! backed by its own [`BPlusTree`]. A partition that grows past
//! `max_partition_size` entries is split at its median key.
//!
//! # Invariants
//!
//! - Partitions are sorted, contiguous and non-overlapping
//! - The first partition starts at -∞ and the last ends at +∞
//! - Every stored key lies in exactly one partition, `[start_key, end_key)`
//! - After an insert returns, no partition holds more than
//!   `max(max_partition_size, 1)` entries

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::partition::bptree::{BPlusTree, IndexError, RangeEntry, RowPointer};
use crate::partition::encoder::{KeyEncoder, KeyValue};

/// A contiguous key range and the tree holding its entries.
#[derive(Debug)]
pub struct Partition {
    /// Inclusive lower bound. `None` is -∞.
    pub start_key: Option<Vec<u8>>,
    /// Exclusive upper bound. `None` is +∞.
    pub end_key: Option<Vec<u8>>,
    pub index: BPlusTree,
}

impl Partition {
    fn contains(&self, encoder: &dyn KeyEncoder, key: &[u8]) -> bool {
        let after_start = self
            .start_key
            .as_deref()
            .is_none_or(|start| encoder.compare_bytes(key, start) != Ordering::Less);
        let before_end = self
            .end_key
            .as_deref()
            .is_none_or(|end| encoder.compare_bytes(key, end) == Ordering::Less);
        after_start && before_end
    }

    /// Whether `[start, end]` (both inclusive) overlaps this partition.
    fn intersects(&self, encoder: &dyn KeyEncoder, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let starts_before_range_end = match (self.start_key.as_deref(), end) {
            (Some(own_start), Some(end)) => encoder.compare_bytes(own_start, end) != Ordering::Greater,
            _ => true,
        };
        let ends_after_range_start = match (self.end_key.as_deref(), start) {
            (Some(own_end), Some(start)) => encoder.compare_bytes(own_end, start) == Ordering::Greater,
            _ => true,
        };
        starts_before_range_end && ends_after_range_start
    }
}

/// A table index split into key-range partitions.
///
/// # Invariants
///
/// - `partitions` is never empty and covers the whole key space in order
/// - Each partition's `end_key` equals the next partition's `start_key`
/// - Every partition's tree uses `encoder` and `order`
#[derive(Debug)]
pub struct UnifiedPartitionIndex {
    encoder: Arc<dyn KeyEncoder>,
    order: usize,
    max_partition_size: usize,
    partitions: Vec<Partition>,
}

impl UnifiedPartitionIndex {
    /// Create an index with a single partition spanning the whole key space.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidOrder`] if `order` is too small.
    pub fn new(
        encoder: Arc<dyn KeyEncoder>,
        order: usize,
        max_partition_size: usize,
    ) -> Result<Self, IndexError> {
        let index = BPlusTree::new(Arc::clone(&encoder), order)?;
        Ok(Self {
            encoder,
            order,
            max_partition_size,
            partitions: vec![Partition {
                start_key: None,
                end_key: None,
                index,
            }],
        })
    }

    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub const fn max_partition_size(&self) -> usize {
        self.max_partition_size
    }

    /// Position of the partition owning `key`.
    pub fn partition_for(&self, key: &KeyValue) -> Result<usize, IndexError> {
        let encoded = self.encoder.encode(key)?;
        Ok(self.partition_for_encoded(&encoded))
    }

    fn partition_for_encoded(&self, key: &[u8]) -> usize {
        // Partitions are contiguous and cover the key space, so the owner is
        // the last one whose start is at or before the key.
        let encoder = self.encoder.as_ref();
        let position = self.partitions.partition_point(|partition| {
            partition
                .start_key
                .as_deref()
                .is_none_or(|start| encoder.compare_bytes(start, key) != Ordering::Greater)
        });
        debug_assert!(position == 0 || self.partitions[position - 1].contains(encoder, key));
        position.saturating_sub(1)
    }

    /// Store `row_pointer` under `key`, replacing any earlier pointer.
    ///
    /// # Pre-conditions
    ///
    /// - `key` has the type the encoder was built for
    ///
    /// # Post-conditions
    ///
    /// - `search(key)` returns `row_pointer`
    /// - The owning partition was split if it grew past `max_partition_size`
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if `key` cannot be encoded. The index is
    /// unchanged in that case.
    pub fn insert(&mut self, key: &KeyValue, row_pointer: RowPointer) -> Result<(), IndexError> {
        let encoded = self.encoder.encode(key)?;
        let position = self.partition_for_encoded(&encoded);
        let partition = &mut self.partitions[position];
        partition.index.insert_encoded(encoded, row_pointer);

        if partition.index.approx_size() > self.max_partition_size {
            self.split(position)?;
        }
        Ok(())
    }

    /// Only the partition owning `key` is consulted.
    pub fn search(&self, key: &KeyValue) -> Result<Option<RowPointer>, IndexError> {
        let encoded = self.encoder.encode(key)?;
        let position = self.partition_for_encoded(&encoded);
        Ok(self.partitions[position].index.search_encoded(&encoded))
    }

    /// Entries with `start <= key <= end` across all partitions, ascending.
    pub fn range_search(
        &self,
        start: Option<&KeyValue>,
        end: Option<&KeyValue>,
    ) -> Result<Vec<RangeEntry>, IndexError> {
        let start = start.map(|k| self.encoder.encode(k)).transpose()?;
        let end = end.map(|k| self.encoder.encode(k)).transpose()?;
        let (start, end) = (start.as_deref(), end.as_deref());

        let encoder = self.encoder.as_ref();
        Ok(self
            .partitions
            .iter()
            .filter(|partition| partition.intersects(encoder, start, end))
            .flat_map(|partition| partition.index.range_search_encoded(start, end))
            .collect())
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// # Post-conditions
    ///
    /// - `search(key)` returns `None`
    /// - The partition count is unchanged; partitions never merge
    pub fn remove(&mut self, key: &KeyValue) -> Result<bool, IndexError> {
        let encoded = self.encoder.encode(key)?;
        let position = self.partition_for_encoded(&encoded);
        Ok(self.partitions[position].index.remove_encoded(&encoded))
    }

    /// Split the partition at `position` around its median key.
    ///
    /// Keys at or above the median move to a new partition placed right
    /// after the old one. Partitions with fewer than two entries are left
    /// alone, since the lower half would be empty.
    fn split(&mut self, position: usize) -> Result<(), IndexError> {
        let entries = self.partitions[position]
            .index
            .range_search_encoded(None, None);
        if entries.len() < 2 {
            return Ok(());
        }

        let median_at = entries.len() / 2;
        let median = entries[median_at].key.clone();
        let mut upper = BPlusTree::new(Arc::clone(&self.encoder), self.order)?;

        let lower = &mut self.partitions[position];
        for entry in &entries[median_at..] {
            lower.index.remove_encoded(&entry.key);
            upper.insert_encoded(entry.key.clone(), entry.row_pointer);
        }
        let end_key = lower.end_key.replace(median.clone());

        debug!(
            partition = position,
            lower = lower.index.approx_size(),
            upper = upper.approx_size(),
            "split partition"
        );

        self.partitions.insert(
            position + 1,
            Partition {
                start_key: Some(median),
                end_key,
                index: upper,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::encoder::IntegerEncoder;
    use rand::Rng;

    fn index(order: usize, max_partition_size: usize) -> UnifiedPartitionIndex {
        UnifiedPartitionIndex::new(Arc::new(IntegerEncoder), order, max_partition_size)
            .expect("index")
    }

    fn assert_contiguous(index: &UnifiedPartitionIndex) {
        let partitions = index.partitions();
        assert!(partitions[0].start_key.is_none());
        assert!(partitions[partitions.len() - 1].end_key.is_none());
        for pair in partitions.windows(2) {
            assert!(pair[0].end_key.is_some());
            assert_eq!(pair[0].end_key, pair[1].start_key);
        }
        for partition in partitions {
            for entry in partition.index.range_search_encoded(None, None) {
                assert!(partition.contains(&IntegerEncoder, &entry.key));
            }
        }
    }

    #[test]
    fn test_split_into_two_partitions() {
        let mut index = index(4, 3);
        for (key, pointer) in [(50_i64, 1), (20, 2), (40, 3), (60, 4)] {
            index.insert(&key.into(), RowPointer(pointer)).expect("insert");
        }

        assert_eq!(index.partition_count(), 2);
        for (key, pointer) in [(50_i64, 1), (20, 2), (40, 3), (60, 4)] {
            assert_eq!(
                index.search(&key.into()).expect("search"),
                Some(RowPointer(pointer))
            );
        }
        assert_contiguous(&index);
    }

    #[test]
    fn test_ascending_inserts_split_repeatedly() {
        let mut index = index(4, 3);
        for key in 1_i64..=8 {
            index
                .insert(&key.into(), RowPointer(key.unsigned_abs()))
                .expect("insert");
        }

        assert!(index.partition_count() > 2);
        for key in 1_i64..=8 {
            assert_eq!(
                index.search(&key.into()).expect("search"),
                Some(RowPointer(key.unsigned_abs()))
            );
        }
        assert_contiguous(&index);
    }

    #[test]
    fn test_absent_key_is_none() {
        let mut index = index(4, 3);
        index.insert(&5_i64.into(), RowPointer(5)).expect("insert");
        assert_eq!(index.search(&6_i64.into()).expect("search"), None);
    }

    #[test]
    fn test_partition_size_bound() {
        let mut index = index(5, 10);
        let mut rng = rand::rng();
        for _ in 0..1_000 {
            let key: i64 = rng.random_range(-10_000..10_000);
            index.insert(&key.into(), RowPointer(0)).expect("insert");
        }
        for partition in index.partitions() {
            assert!(partition.index.approx_size() <= 10);
        }
        assert_contiguous(&index);
    }

    #[test]
    fn test_range_search_across_partitions() {
        let mut index = index(4, 3);
        for key in (0_i64..40).rev() {
            index
                .insert(&key.into(), RowPointer(key.unsigned_abs()))
                .expect("insert");
        }
        assert!(index.partition_count() > 3);

        let hits = index
            .range_search(Some(&5_i64.into()), Some(&25_i64.into()))
            .expect("range");
        let pointers: Vec<u64> = hits.iter().map(|e| e.row_pointer.0).collect();
        assert_eq!(pointers, (5..=25).collect::<Vec<_>>());

        let everything = index.range_search(None, None).expect("range");
        assert_eq!(everything.len(), 40);
    }

    #[test]
    fn test_range_end_on_partition_start_is_included() {
        let mut index = index(4, 3);
        for key in [20_i64, 40, 50, 60] {
            index.insert(&key.into(), RowPointer(0)).expect("insert");
        }
        // The second partition starts exactly at 50.
        let hits = index
            .range_search(Some(&30_i64.into()), Some(&50_i64.into()))
            .expect("range");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut index = index(4, 3);
        for key in 0_i64..10 {
            index.insert(&key.into(), RowPointer(0)).expect("insert");
        }
        let before = index.partition_count();
        assert!(index.remove(&7_i64.into()).expect("remove"));
        assert!(!index.remove(&7_i64.into()).expect("remove"));
        assert_eq!(index.search(&7_i64.into()).expect("search"), None);
        assert_eq!(index.partition_count(), before);
    }

    #[test]
    fn test_single_key_partition_does_not_split() {
        let mut index = index(3, 0);
        index.insert(&1_i64.into(), RowPointer(1)).expect("insert");
        assert_eq!(index.partition_count(), 1);
        index.insert(&2_i64.into(), RowPointer(2)).expect("insert");
        assert_eq!(index.partition_count(), 2);
        assert_eq!(index.search(&1_i64.into()).expect("search"), Some(RowPointer(1)));
        assert_eq!(index.search(&2_i64.into()).expect("search"), Some(RowPointer(2)));
    }
}
