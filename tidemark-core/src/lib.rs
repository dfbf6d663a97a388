//! Concurrent multi-level ordered index.
//!
//! Maps keys to values with duplicate-key support, point and range queries,
//! and lock-free progress on reads. Writers link and unlink nodes with
//! per-level compare-and-set; readers traverse without locks under an epoch
//! registration that keeps unlinked nodes alive until the last observer
//! leaves.
//!
//! ```ignore
//! use tidemark_core::OrderedIndex;
//!
//! let index: OrderedIndex<i64, &str> = OrderedIndex::new(false);
//! index.insert(1, "a");
//! index.insert(1, "b");
//! assert_eq!(index.get_value(&1).len(), 2);
//! ```

pub mod index;
pub mod ordering;

pub use index::{ConditionalOutcome, ForwardIterator, OrderedIndex, MAX_LEVEL};
pub use ordering::{KeyEquality, KeyOrdering, NaturalOrder, ValueEquality};
