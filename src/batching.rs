//! Batch dispatcher for evaluation inputs.
//!
//! Splits an ordered sequence into contiguous fixed-size slices, preserving
//! order exactly. Batch size only affects how backend calls are grouped,
//! never the scores themselves.

use std::num::NonZeroUsize;

/// Default batch size for scorers.
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// Lazy iterator over contiguous batches of `items`.
///
/// The concatenation of the yielded slices reconstructs `items` exactly;
/// the last slice may be shorter. The zero batch size is unrepresentable
/// by construction.
pub fn batch_iter<T>(items: &[T], batch_size: NonZeroUsize) -> impl Iterator<Item = &[T]> {
    items.chunks(batch_size.get())
}

/// Parse a batch size, rejecting zero eagerly.
pub fn batch_size(n: usize) -> Option<NonZeroUsize> {
    NonZeroUsize::new(n)
}
