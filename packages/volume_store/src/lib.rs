//! Pool-backed storage for large 2D scan images and 3D stacks of such images.
//!
//! Imaging pipelines repeatedly allocate and release buffers of the same size, one per scan
//! slice. This crate keeps those buffers in a fixed-size [`BufferPool`] and layers typed
//! views on top of the raw memory:
//!
//! - [`Block`] - a move-only byte buffer, either checked out of a pool or allocated directly.
//!   Dropping a pooled block returns it to its pool.
//! - [`Grid2D<T>`] - a row-major `width` x `height` image of [`Element`] values on top of a
//!   block.
//! - [`SliceStack<T>`] - an ordered stack of equally sized grids forming a volume. Whether the
//!   stack owns its slices or only borrows them from the caller is fixed by its
//!   [`OwnershipPolicy`].
//! - [`VolumeHandle`] - a volume whose element type is chosen at runtime from an
//!   [`ElementType`], with typed access recovered through [`VolumeHandle::as_stack()`].
//! - [`SliceCursor`] - a position in the depth sequence of a volume.
//!
//! # Pool semantics
//!
//! A pool reserves `buffer_count` blocks of `block_capacity` bytes when it is created and
//! never grows. Acquiring a block is constant time and fails with [`Error::PoolExhausted`]
//! when every block is in use. The pool handle is cheap to clone and may be shared between
//! threads. Blocks keep the pool memory alive, so dropping every pool handle while blocks are
//! still in use is safe: the memory is freed when the last block is returned.
//!
//! # Example
//!
//! ```
//! use new_zealand::nz;
//! use volume_store::{BufferPool, ElementType, SliceCursor, VolumeHandle};
//!
//! // Five slices of 4 x 3 16-bit samples.
//! let pool = BufferPool::builder()
//!     .block_capacity_for::<u16>(nz!(4), nz!(3))
//!     .buffer_count(nz!(5))
//!     .build()
//!     .unwrap();
//!
//! let mut volume = VolumeHandle::new();
//! volume
//!     .allocate(ElementType::U16, 4, 3, 5, Some(&pool))
//!     .unwrap();
//! assert_eq!(pool.available(), 0);
//!
//! volume
//!     .as_stack_mut::<u16>()
//!     .unwrap()
//!     .slice_mut(3)
//!     .unwrap()
//!     .set(2, 1, 1000)
//!     .unwrap();
//!
//! let cursor = SliceCursor::begin(&volume).unwrap().advance().advance().advance();
//! assert_eq!(cursor.current_slice::<u16>().unwrap().get(2, 1).unwrap(), 1000);
//!
//! drop(volume);
//! assert_eq!(pool.available(), 5);
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events: `debug` for pool creation and volume allocation,
//! `trace` for individual block traffic, `warn` when a pool runs dry and `error` when a block
//! is returned to its pool twice. Install any `tracing` subscriber to see them.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod builder;
mod cursor;
mod element;
mod error;
mod grid;
mod ownership_policy;
mod pool;
mod slice_stack;
mod volume;

pub use block::{BLOCK_ALIGNMENT, Block, BlockKind};
pub use builder::BufferPoolBuilder;
pub use cursor::{SliceCursor, Slices};
pub use element::{Element, ElementType, VolumeElement};
pub use error::{Error, ErrorKind, Result};
pub use grid::Grid2D;
pub use ownership_policy::OwnershipPolicy;
pub use pool::{BufferPool, PoolStats};
pub use slice_stack::SliceStack;
pub use volume::{VolumeData, VolumeHandle};
