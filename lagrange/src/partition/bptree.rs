//! In-memory B+Tree mapping encoded keys to row pointers.
//!
//! # Structure
//!
//! - Internal nodes: sorted separators and `keys.len() + 1` children
//! - Leaf nodes: sorted keys with parallel row pointers, forward-linked for
//!   range scans
//!
//! Nodes live in an arena and refer to each other by [`NodeId`].
//!
//! # Invariants
//!
//! - No node holds more than `order - 1` keys once an insert returns
//! - All leaves are at the same depth; height only grows through a root split
//! - For a separator `k` at position `i`, every key in `children[i]` is `< k`
//!   and every key in `children[i + 1]` is `>= k`
//!
//! Removal does not rebalance. Underfull leaves are allowed.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::partition::encoder::{EncodingError, KeyEncoder, KeyValue};

/// Smallest supported branching factor.
pub const MIN_ORDER: usize = 3;

/// Opaque reference to a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowPointer(pub u64);

/// One result of a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub key: Vec<u8>,
    pub row_pointer: RowPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(usize);

#[derive(Debug)]
struct LeafNode {
    keys: Vec<Vec<u8>>,
    values: Vec<RowPointer>,
    next: Option<NodeId>,
}

#[derive(Debug)]
struct InternalNode {
    keys: Vec<Vec<u8>>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// A split that must be absorbed by the parent.
struct Split {
    separator: Vec<u8>,
    right: NodeId,
}

/// B+Tree over encoded keys.
#[derive(Debug)]
pub struct BPlusTree {
    encoder: Arc<dyn KeyEncoder>,
    order: usize,
    nodes: Vec<Node>,
    root: NodeId,
    len: usize,
}

impl BPlusTree {
    /// Create an empty tree.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidOrder`] if `order` is below [`MIN_ORDER`].
    pub fn new(encoder: Arc<dyn KeyEncoder>, order: usize) -> Result<Self, IndexError> {
        if order < MIN_ORDER {
            return Err(IndexError::InvalidOrder(order));
        }
        Ok(Self {
            encoder,
            order,
            nodes: vec![Node::Leaf(LeafNode {
                keys: Vec::new(),
                values: Vec::new(),
                next: None,
            })],
            root: NodeId(0),
            len: 0,
        })
    }

    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    /// Encoder used for all keys in this tree.
    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn KeyEncoder> {
        &self.encoder
    }

    /// Number of stored entries.
    #[must_use]
    pub const fn approx_size(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of levels, counting the leaf level.
    #[must_use]
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut current = self.root;
        while let Node::Internal(internal) = &self.nodes[current.0] {
            height += 1;
            current = internal.children[0];
        }
        height
    }

    /// Encode `key` and insert it.
    pub fn insert(&mut self, key: &KeyValue, row_pointer: RowPointer) -> Result<(), IndexError> {
        let encoded = self.encoder.encode(key)?;
        self.insert_encoded(encoded, row_pointer);
        Ok(())
    }

    /// Insert an already encoded key. An existing key has its row pointer
    /// replaced.
    pub fn insert_encoded(&mut self, key: Vec<u8>, row_pointer: RowPointer) {
        if let Some(split) = self.insert_into(self.root, key, row_pointer) {
            let new_root = self.push(Node::Internal(InternalNode {
                keys: vec![split.separator],
                children: vec![self.root, split.right],
            }));
            self.root = new_root;
        }
    }

    pub fn search(&self, key: &KeyValue) -> Result<Option<RowPointer>, IndexError> {
        let encoded = self.encoder.encode(key)?;
        Ok(self.search_encoded(&encoded))
    }

    #[must_use]
    pub fn search_encoded(&self, key: &[u8]) -> Option<RowPointer> {
        let Node::Leaf(leaf) = &self.nodes[self.find_leaf(key).0] else {
            return None;
        };
        self.position(&leaf.keys, key).ok().map(|i| leaf.values[i])
    }

    /// Entries with `start <= key <= end`, ascending. `None` bounds are open.
    pub fn range_search(
        &self,
        start: Option<&KeyValue>,
        end: Option<&KeyValue>,
    ) -> Result<Vec<RangeEntry>, IndexError> {
        let start = start.map(|k| self.encoder.encode(k)).transpose()?;
        let end = end.map(|k| self.encoder.encode(k)).transpose()?;
        Ok(self.range_search_encoded(start.as_deref(), end.as_deref()))
    }

    #[must_use]
    pub fn range_search_encoded(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<RangeEntry> {
        let mut results = Vec::new();
        let mut current = Some(start.map_or_else(|| self.leftmost_leaf(), |s| self.find_leaf(s)));

        while let Some(id) = current {
            let Node::Leaf(leaf) = &self.nodes[id.0] else {
                break;
            };
            for (key, value) in leaf.keys.iter().zip(&leaf.values) {
                if start.is_some_and(|s| self.compare(key, s) == Ordering::Less) {
                    continue;
                }
                if end.is_some_and(|e| self.compare(key, e) == Ordering::Greater) {
                    return results;
                }
                results.push(RangeEntry {
                    key: key.clone(),
                    row_pointer: *value,
                });
            }
            current = leaf.next;
        }

        results
    }

    /// Remove an encoded key. Returns whether it was present.
    pub fn remove_encoded(&mut self, key: &[u8]) -> bool {
        let leaf_id = self.find_leaf(key);
        let position = match &self.nodes[leaf_id.0] {
            Node::Leaf(leaf) => self.position(&leaf.keys, key).ok(),
            Node::Internal(_) => None,
        };
        let (Some(i), Node::Leaf(leaf)) = (position, &mut self.nodes[leaf_id.0]) else {
            return false;
        };
        leaf.keys.remove(i);
        leaf.values.remove(i);
        self.len -= 1;
        true
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.encoder.compare_bytes(a, b)
    }

    fn position(&self, keys: &[Vec<u8>], key: &[u8]) -> Result<usize, usize> {
        keys.binary_search_by(|probe| self.compare(probe, key))
    }

    /// Child slot for `key`: keys equal to a separator go right.
    fn child_index(&self, keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|separator| self.compare(separator, key) != Ordering::Greater)
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn find_leaf(&self, key: &[u8]) -> NodeId {
        let mut current = self.root;
        while let Node::Internal(internal) = &self.nodes[current.0] {
            current = internal.children[self.child_index(&internal.keys, key)];
        }
        current
    }

    fn leftmost_leaf(&self) -> NodeId {
        let mut current = self.root;
        while let Node::Internal(internal) = &self.nodes[current.0] {
            current = internal.children[0];
        }
        current
    }

    fn insert_into(&mut self, id: NodeId, key: Vec<u8>, row_pointer: RowPointer) -> Option<Split> {
        let child = match &self.nodes[id.0] {
            Node::Leaf(leaf) => {
                let position = self.position(&leaf.keys, &key);
                return self.insert_into_leaf(id, position, key, row_pointer);
            }
            Node::Internal(internal) => {
                let slot = self.child_index(&internal.keys, &key);
                (slot, internal.children[slot])
            }
        };

        let split = self.insert_into(child.1, key, row_pointer)?;
        let max_keys = self.order - 1;
        let Node::Internal(internal) = &mut self.nodes[id.0] else {
            return None;
        };
        internal.keys.insert(child.0, split.separator);
        internal.children.insert(child.0 + 1, split.right);
        if internal.keys.len() <= max_keys {
            return None;
        }

        // Internal split: the middle key moves up and is kept in neither half.
        let mid = internal.keys.len() / 2;
        let right_keys = internal.keys.split_off(mid + 1);
        let right_children = internal.children.split_off(mid + 1);
        let separator = internal.keys.pop()?;
        let right = self.push(Node::Internal(InternalNode {
            keys: right_keys,
            children: right_children,
        }));
        Some(Split { separator, right })
    }

    fn insert_into_leaf(
        &mut self,
        id: NodeId,
        position: Result<usize, usize>,
        key: Vec<u8>,
        row_pointer: RowPointer,
    ) -> Option<Split> {
        let max_keys = self.order - 1;
        let next_id = NodeId(self.nodes.len());
        let Node::Leaf(leaf) = &mut self.nodes[id.0] else {
            return None;
        };

        match position {
            Ok(i) => {
                leaf.values[i] = row_pointer;
                return None;
            }
            Err(i) => {
                leaf.keys.insert(i, key);
                leaf.values.insert(i, row_pointer);
                self.len += 1;
            }
        }
        if leaf.keys.len() <= max_keys {
            return None;
        }

        let mid = leaf.keys.len().div_ceil(2);
        let right_keys = leaf.keys.split_off(mid);
        let right_values = leaf.values.split_off(mid);
        let separator = right_keys[0].clone();
        let right = LeafNode {
            keys: right_keys,
            values: right_values,
            next: leaf.next.replace(next_id),
        };
        let right = self.push(Node::Leaf(right));
        Some(Split { separator, right })
    }

    /// Check structural invariants. Test-only.
    #[cfg(test)]
    fn assert_invariants(&self) {
        fn walk(tree: &BPlusTree, id: NodeId, depth: usize, leaf_depths: &mut Vec<usize>) {
            match &tree.nodes[id.0] {
                Node::Leaf(leaf) => {
                    assert!(leaf.keys.len() < tree.order);
                    leaf_depths.push(depth);
                }
                Node::Internal(internal) => {
                    assert!(internal.keys.len() < tree.order);
                    assert_eq!(internal.children.len(), internal.keys.len() + 1);
                    for child in &internal.children {
                        walk(tree, *child, depth + 1, leaf_depths);
                    }
                }
            }
        }

        let mut depths = Vec::new();
        walk(self, self.root, 1, &mut depths);
        assert!(depths.iter().all(|d| *d == self.height()));

        let all = self.range_search_encoded(None, None);
        assert_eq!(all.len(), self.len);
        for pair in all.windows(2) {
            assert_eq!(self.compare(&pair[0].key, &pair[1].key), Ordering::Less);
        }
    }
}

/// Errors returned by the partition index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The branching factor is too small.
    InvalidOrder(usize),
    /// A key could not be encoded.
    Encoding(EncodingError),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOrder(order) => {
                write!(f, "B+Tree order must be at least {MIN_ORDER}, got {order}")
            }
            Self::Encoding(e) => write!(f, "key encoding error: {e}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidOrder(_) => None,
            Self::Encoding(e) => Some(e),
        }
    }
}

impl From<EncodingError> for IndexError {
    fn from(e: EncodingError) -> Self {
        Self::Encoding(e)
    }
}
