//! Epoch-based deferred reclamation.
//!
//! Readers register with the current epoch before touching shared nodes and
//! deregister when done. Writers enroll unlinked nodes as garbage against the
//! current epoch. An epoch's garbage is freed only once the epoch has been
//! retired and every reader that registered with it has left, so a reader
//! never dereferences freed memory.

pub mod epoch;

pub use epoch::{EpochGuard, EpochManager};
