use std::alloc::{self, Layout};
use std::any::type_name;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, slice};

use crate::pool::PoolInner;
use crate::{Error, Result};

/// Alignment of every block, pooled or direct.
///
/// Blocks are reinterpreted as slices of [`Element`][crate::Element] values, so this must be
/// at least the alignment of any element type. We align to a cache line, which also keeps
/// neighboring pool blocks from sharing one.
pub const BLOCK_ALIGNMENT: usize = 64;

/// Where the memory of a [`Block`] came from, which determines what happens to it when the
/// block is dropped.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BlockKind {
    /// The block belongs to a [`BufferPool`][crate::BufferPool] and is returned to it on drop.
    Pooled,

    /// The block was allocated on its own and is freed on drop.
    Direct,
}

/// A raw, fixed-length, zero-initialized memory region backing one grid.
///
/// A block is either lent out by a [`BufferPool`][crate::BufferPool] or allocated directly
/// from the global allocator. Either way, the block exclusively owns its memory for as long as
/// it lives: it cannot be cloned and dropping it releases the memory back to where it came
/// from. This makes it impossible for two live grids to reference the same pooled memory.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use volume_store::{Block, BlockKind};
///
/// let mut block = Block::direct(nz!(16)).unwrap();
///
/// assert_eq!(block.len(), 16);
/// assert_eq!(block.kind(), BlockKind::Direct);
/// assert!(block.as_bytes().iter().all(|b| *b == 0));
///
/// block.as_bytes_mut()[0] = 0xFF;
/// assert_eq!(block.as_bytes()[0], 0xFF);
/// ```
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
    origin: Origin,
}

enum Origin {
    Pooled { pool: Arc<PoolInner>, slot: usize },
    Direct { layout: Layout },
}

impl Block {
    /// Allocates a zero-initialized block of `len` bytes directly from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the memory cannot be allocated.
    pub fn direct(len: NonZero<usize>) -> Result<Self> {
        let layout = Layout::from_size_align(len.get(), BLOCK_ALIGNMENT)
            .map_err(|_layout_error| Error::AllocationFailure { bytes: len.get() })?;

        // SAFETY: The layout is not zero-sized because `len` is non-zero.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(Error::AllocationFailure { bytes: len.get() })?;

        Ok(Self {
            ptr,
            len: len.get(),
            origin: Origin::Direct { layout },
        })
    }

    /// Wraps one slot of a pool's memory region.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` points to `len` initialized bytes inside the
    /// memory region of `pool`, aligned to [`BLOCK_ALIGNMENT`], that `slot` has been marked
    /// in use and that no other block refers to the same slot.
    pub(crate) unsafe fn pooled(
        ptr: NonNull<u8>,
        len: usize,
        pool: Arc<PoolInner>,
        slot: usize,
    ) -> Self {
        Self {
            ptr,
            len,
            origin: Origin::Pooled { pool, slot },
        }
    }

    /// Length of the block in bytes.
    ///
    /// For pooled blocks this is the block capacity of the pool, which may exceed the number
    /// of bytes originally requested.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the block has a length of zero. Blocks are never empty in practice.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the block is lent out by a pool or was allocated directly.
    #[must_use]
    pub fn kind(&self) -> BlockKind {
        match self.origin {
            Origin::Pooled { .. } => BlockKind::Pooled,
            Origin::Direct { .. } => BlockKind::Direct,
        }
    }

    /// Pointer to the first byte of the block, aligned to [`BLOCK_ALIGNMENT`].
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The contents of the block.
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The block owns `len` initialized bytes at `ptr` (direct blocks are zeroed on
        // allocation, pool regions are zeroed on pool creation) and we hand out a shared
        // reference tied to a shared borrow of the block.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The contents of the block, for writing.
    #[must_use]
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: As in `as_bytes()`, plus the exclusive borrow of the block guarantees that
        // no other reference to the memory exists.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Whether this block was lent out by the pool with the given shared state.
    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner>) -> bool {
        match &self.origin {
            Origin::Pooled { pool: origin, .. } => Arc::ptr_eq(origin, pool),
            Origin::Direct { .. } => false,
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        match &self.origin {
            Origin::Pooled { pool, slot } => pool.return_slot(*slot),
            Origin::Direct { layout } => {
                // SAFETY: Direct blocks are allocated in `direct()` with exactly this layout
                // and nothing else frees them.
                unsafe {
                    alloc::dealloc(self.ptr.as_ptr(), *layout);
                }
            }
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct(type_name::<Self>());
        debug.field("len", &self.len).field("kind", &self.kind());

        if let Origin::Pooled { slot, .. } = &self.origin {
            debug.field("slot", slot);
        }

        debug.finish_non_exhaustive()
    }
}

// SAFETY: A block exclusively owns its memory region. Moving it to another thread moves that
// ownership; returning pooled memory goes through the pool's mutex.
unsafe impl Send for Block {}

// SAFETY: Shared references to a block only permit reading its bytes; writing requires `&mut`.
unsafe impl Sync for Block {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::BufferPool;

    assert_impl_all!(Block: Send, Sync, Debug);
    assert_not_impl_any!(Block: Clone);

    #[test]
    fn direct_block_is_zeroed_and_aligned() {
        let block = Block::direct(nz!(1000)).unwrap();

        assert_eq!(block.len(), 1000);
        assert!(!block.is_empty());
        assert_eq!(block.kind(), BlockKind::Direct);
        assert_eq!(block.as_ptr().as_ptr() as usize % BLOCK_ALIGNMENT, 0);
        assert!(block.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn direct_block_is_writable() {
        let mut block = Block::direct(nz!(4)).unwrap();

        block.as_bytes_mut().copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(block.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn impossible_direct_block_fails() {
        let result = Block::direct(NonZero::new(usize::MAX).unwrap());

        assert!(matches!(result, Err(Error::AllocationFailure { .. })));
    }

    #[test]
    fn pooled_block_reports_kind_and_owner() {
        let pool = BufferPool::new(nz!(32), nz!(1)).unwrap();
        let other_pool = BufferPool::new(nz!(32), nz!(1)).unwrap();

        let block = pool.acquire(8).unwrap();

        assert_eq!(block.kind(), BlockKind::Pooled);
        assert_eq!(block.len(), 32);
        assert!(block.belongs_to(pool.inner()));
        assert!(!block.belongs_to(other_pool.inner()));
    }

    #[test]
    fn dropping_pooled_block_returns_it() {
        let pool = BufferPool::new(nz!(32), nz!(2)).unwrap();

        let block = pool.acquire(32).unwrap();
        assert_eq!(pool.in_use(), 1);

        drop(block);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn debug_output_names_slot_for_pooled_blocks() {
        let pool = BufferPool::new(nz!(16), nz!(1)).unwrap();
        let block = pool.acquire(16).unwrap();

        let output = format!("{block:?}");
        assert!(output.contains("slot"));
        assert!(output.contains("Pooled"));

        let direct = Block::direct(nz!(16)).unwrap();
        assert!(!format!("{direct:?}").contains("slot"));
    }
}
