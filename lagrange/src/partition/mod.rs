//! Key-range partitioning.
//!
//! - [`encoder`]: order-preserving byte encodings of typed keys
//! - [`bptree`]: the B+Tree backing a single partition
//! - [`unified`]: the ordered partition list for a table

pub mod bptree;
pub mod encoder;
pub mod unified;

pub use bptree::{BPlusTree, IndexError, RangeEntry, RowPointer};
pub use encoder::{
    BlobEncoder, CompoundEncoder, EncodingError, IntegerEncoder, KeyEncoder, KeyValue,
    NumericEncoder, RealEncoder, TextEncoder,
};
pub use unified::{Partition, UnifiedPartitionIndex};
