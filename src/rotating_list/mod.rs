//! # Rotating List Module
//!
//! [`RotatingList`] is a copy-on-write list for data that is read on every
//! request but changed rarely, with one extra primitive:
//! [`rotate`](RotatingList::rotate) prepends an element and evicts the last
//! one in a single swap, which makes it a fixed-capacity recency buffer.
//!
//! ## Concurrency
//!
//! - Readers load the current snapshot (`Arc<Vec<T>>`) and never lock
//! - Writers serialize on one mutex, build a new vector and publish it
//!   atomically; a reader sees the complete old or the complete new state
//! - Iterators work on the snapshot they were created from
//! - A [`SubList`] remembers the snapshot it was created from and fails with
//!   [`ListError::ConcurrentModification`] once the parent changed underneath it

mod list;
mod sublist;

pub use list::{Iter, RotatingList};
pub use sublist::SubList;

use std::fmt;

/// Failure of a list operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    IndexOutOfBounds { index: usize, len: usize },
    /// The parent list changed after the sub-list view was taken
    ConcurrentModification,
}

impl fmt::Display for ListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListError::IndexOutOfBounds { index, len } => {
                write!(f, "Index: {index}, Size: {len}")
            }
            ListError::ConcurrentModification => f.write_str("list modified concurrently"),
        }
    }
}

impl std::error::Error for ListError {}

pub(crate) fn check_index(index: usize, len: usize) -> Result<(), ListError> {
    if index < len {
        Ok(())
    } else {
        Err(ListError::IndexOutOfBounds { index, len })
    }
}

pub(crate) fn check_position(index: usize, len: usize) -> Result<(), ListError> {
    if index <= len {
        Ok(())
    } else {
        Err(ListError::IndexOutOfBounds { index, len })
    }
}
