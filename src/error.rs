//! Errors returned by multiset operations.

use thiserror::Error;

/// The ways a multiset operation can be refused.
///
/// Both variants are raised before the structure is modified, so a caller that
/// receives one of them observes the multiset exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MultisetError {
    /// An argument was outside of the accepted domain, such as an occurrence
    /// count of zero.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Adding the requested occurrences would have grown the multiset beyond
    /// its configured capacity.
    #[error("cannot add {requested} occurrences, capacity is {capacity}")]
    CapacityExceeded {
        /// The number of occurrences the caller tried to add.
        requested: usize,
        /// The bound that was hit: the configured capacity, or the largest
        /// count the structure can represent when that is lower or there is
        /// no configured capacity.
        capacity: usize,
    },
}
