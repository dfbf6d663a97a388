//! The ordered index.
//!
//! # Organization
//!
//! - [`node`] - tower nodes with inline forward-link arrays (pub(crate))
//! - [`skip_index`] - the link graph, traversal primitives, and mutators
//! - [`iterator`] - epoch-pinned forward cursor

pub(crate) mod node;

mod iterator;
mod skip_index;

pub use iterator::ForwardIterator;
pub use skip_index::{ConditionalOutcome, OrderedIndex, MAX_LEVEL};
