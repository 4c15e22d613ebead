use thiserror::Error;

use crate::ElementType;

/// Errors that can occur when allocating or accessing pooled grids and volumes.
///
/// Every fallible operation in this crate reports its failure through this type. Nothing is
/// retried internally; use [`Error::kind()`] to tell resource pressure apart from invalid
/// requests when deciding whether a retry makes sense.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A grid or volume was requested with a zero (or unrepresentably large) dimension.
    #[error("invalid dimensions {width}x{height}x{depth}: {problem}")]
    InvalidDimensions {
        /// Requested width in elements.
        width: usize,

        /// Requested height in elements.
        height: usize,

        /// Requested depth in slices. Two-dimensional requests report a depth of 1.
        depth: usize,

        /// A human-readable description of the problem.
        problem: &'static str,
    },

    /// A block supplied to a grid is shorter than the grid's element data.
    #[error("block of {available} bytes is too small for a grid of {required} bytes")]
    BufferTooSmall {
        /// Bytes needed by the grid.
        required: usize,

        /// Bytes available in the supplied block.
        available: usize,
    },

    /// A pool was asked for more bytes than any of its blocks can hold.
    #[error("requested {requested} bytes but pool blocks hold at most {capacity} bytes")]
    BufferTooLarge {
        /// Bytes requested by the caller.
        requested: usize,

        /// Capacity of every block in the pool.
        capacity: usize,
    },

    /// Every block of the pool is currently in use.
    #[error("all {buffer_count} blocks of the buffer pool are in use")]
    PoolExhausted {
        /// Number of blocks the pool was created with.
        buffer_count: usize,
    },

    /// An index lies outside the bounds of the container it was used on.
    #[error("{axis} index {index} is out of range (must be less than {bound})")]
    OutOfRange {
        /// Which index was out of range: `"column"`, `"row"` or `"slice"`.
        axis: &'static str,

        /// The offending index.
        index: usize,

        /// The exclusive upper bound of valid indexes.
        bound: usize,
    },

    /// A borrowing slice stack was asked for a slot that no grid has been bound to.
    #[error("slice {index} has not been bound to a grid")]
    UnboundSlice {
        /// Depth index of the unbound slot.
        index: usize,
    },

    /// An element type tag did not match any of the supported element types.
    #[error("unsupported element type '{tag}'")]
    UnsupportedElementType {
        /// The tag as provided by the caller.
        tag: String,
    },

    /// A volume was accessed as a different element type than it was allocated with.
    #[error("volume holds {actual} elements but was accessed as {requested}")]
    TypeMismatch {
        /// The element type the volume was allocated with.
        actual: ElementType,

        /// The element type the caller asked for.
        requested: ElementType,
    },

    /// A volume handle was queried before any storage was allocated for it.
    #[error("volume has not been allocated")]
    NotAllocated,

    /// The system could not provide the memory for a pool or a direct block.
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailure {
        /// Size of the allocation that failed.
        bytes: usize,
    },

    /// An operation that only applies to one ownership policy was used on a stack with the
    /// other policy, e.g. binding a borrowed grid into a stack that owns its slices.
    #[error("operation '{operation}' is not valid for a stack with policy {policy:?}")]
    WrongOwnershipPolicy {
        /// The rejected operation.
        operation: &'static str,

        /// The policy of the stack the operation was attempted on.
        policy: crate::OwnershipPolicy,
    },

    /// Bulk element data did not have the length of the grid it was copied into.
    #[error("expected {expected} elements but got {actual}")]
    LengthMismatch {
        /// Number of elements in the grid.
        expected: usize,

        /// Number of elements supplied.
        actual: usize,
    },
}

/// Broad classification of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request was valid but memory could not be provided right now. Retrying after
    /// other volumes have been released may succeed.
    ResourcePressure,

    /// The request itself was invalid. Retrying the same request will fail the same way.
    InvalidRequest,
}

impl Error {
    /// Classifies the error as either resource pressure or an invalid request.
    ///
    /// # Example
    ///
    /// ```
    /// use volume_store::{Error, ErrorKind};
    ///
    /// let error = Error::PoolExhausted { buffer_count: 4 };
    /// assert_eq!(error.kind(), ErrorKind::ResourcePressure);
    ///
    /// let error = Error::NotAllocated;
    /// assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    /// ```
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } | Self::AllocationFailure { .. } => {
                ErrorKind::ResourcePressure
            }
            _ => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the error indicates memory pressure rather than an invalid request.
    #[must_use]
    pub fn is_resource_pressure(&self) -> bool {
        self.kind() == ErrorKind::ResourcePressure
    }
}

/// A specialized `Result` type for volume store operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(ErrorKind: Send, Sync, Copy);

    #[test]
    fn resource_errors_are_pressure() {
        assert!(Error::PoolExhausted { buffer_count: 1 }.is_resource_pressure());
        assert!(Error::AllocationFailure { bytes: 1024 }.is_resource_pressure());
    }

    #[test]
    fn caller_errors_are_invalid_requests() {
        let errors = [
            Error::OutOfRange {
                axis: "row",
                index: 3,
                bound: 3,
            },
            Error::TypeMismatch {
                actual: ElementType::U8,
                requested: ElementType::U16,
            },
            Error::NotAllocated,
            Error::UnboundSlice { index: 0 },
            Error::BufferTooLarge {
                requested: 10,
                capacity: 5,
            },
        ];

        for error in errors {
            assert_eq!(error.kind(), ErrorKind::InvalidRequest, "{error}");
        }
    }

    #[test]
    fn messages_carry_context() {
        let error = Error::OutOfRange {
            axis: "column",
            index: 4,
            bound: 4,
        };
        assert_eq!(
            error.to_string(),
            "column index 4 is out of range (must be less than 4)"
        );

        let error = Error::TypeMismatch {
            actual: ElementType::U16,
            requested: ElementType::F32,
        };
        assert_eq!(
            error.to_string(),
            "volume holds u16 elements but was accessed as f32"
        );
    }
}
