use std::alloc::{self, Layout};
use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{BLOCK_ALIGNMENT, Block, BufferPoolBuilder, Error, Result};

/// A fixed set of equally sized memory blocks that are lent out to grids and taken back when
/// the grids are dropped.
///
/// All memory is reserved up front in a single region when the pool is created. After that,
/// acquiring and releasing blocks never touches the global allocator, which keeps the cost of
/// allocating a volume with hundreds of slices predictable.
///
/// The pool never grows. The block capacity should be the largest slice size you intend to
/// store and the buffer count the number of slices you intend to keep alive at the same time.
///
/// # Lifetime of pool memory
///
/// `BufferPool` is a cheaply cloneable handle to shared pool state. Every lent-out
/// [`Block`] also holds on to that state, so the memory region is released only when the last
/// handle and the last block are gone. Dropping every `BufferPool` handle while volumes still
/// hold blocks is therefore safe; the memory lives until those volumes are dropped.
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). A single mutex guards the bookkeeping of
/// which blocks are in use; the block memory itself is never shared between live blocks.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use volume_store::{BufferPool, Error};
///
/// let pool = BufferPool::new(nz!(1024), nz!(2)).unwrap();
///
/// let first = pool.acquire(1000).unwrap();
/// let second = pool.acquire(512).unwrap();
/// assert_eq!(pool.available(), 0);
///
/// // A third block would exceed the buffer count.
/// assert!(matches!(pool.acquire(1), Err(Error::PoolExhausted { .. })));
///
/// // Blocks go back to the pool when dropped or explicitly released.
/// drop(first);
/// pool.release(second).unwrap();
/// assert_eq!(pool.available(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a builder for configuring and constructing a [`BufferPool`].
    ///
    /// # Example
    ///
    /// ```
    /// use new_zealand::nz;
    /// use volume_store::BufferPool;
    ///
    /// // Room for 60 slices of 512x512 16-bit pixels.
    /// let pool = BufferPool::builder()
    ///     .block_capacity_for::<u16>(nz!(512), nz!(512))
    ///     .buffer_count(nz!(60))
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(pool.block_capacity(), 512 * 512 * 2);
    /// ```
    #[inline]
    pub fn builder() -> BufferPoolBuilder {
        BufferPoolBuilder::new()
    }

    /// Creates a pool of `buffer_count` blocks of `block_capacity` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the total memory cannot be reserved.
    pub fn new(block_capacity: NonZero<usize>, buffer_count: NonZero<usize>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(PoolInner::new(block_capacity, buffer_count)?),
        })
    }

    /// Capacity of every block in bytes.
    #[must_use]
    #[inline]
    pub fn block_capacity(&self) -> usize {
        self.inner.block_capacity.get()
    }

    /// Total number of blocks in the pool, whether in use or not.
    #[must_use]
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.inner.buffer_count.get()
    }

    /// Number of blocks currently lent out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use_count()
    }

    /// Number of blocks currently available for acquisition.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().free_slots.len()
    }

    /// Takes a snapshot of the pool's usage counters.
    #[must_use]
    pub fn statistics(&self) -> PoolStats {
        let state = self.inner.state.lock();

        PoolStats {
            block_capacity: self.block_capacity(),
            buffer_count: self.buffer_count(),
            in_use: state.in_use_count(),
            available: state.free_slots.len(),
            peak_in_use: state.peak_in_use,
            failed_acquisitions: state.failed_acquisitions,
        }
    }

    /// Lends out a block with room for at least `requested_bytes` bytes.
    ///
    /// The first `requested_bytes` bytes of the block are zeroed. The block is returned to the
    /// pool when it is dropped or passed to [`release()`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooLarge`] if `requested_bytes` exceeds the block capacity and
    /// [`Error::PoolExhausted`] if every block is already in use.
    pub fn acquire(&self, requested_bytes: usize) -> Result<Block> {
        let capacity = self.block_capacity();

        if requested_bytes > capacity {
            return Err(Error::BufferTooLarge {
                requested: requested_bytes,
                capacity,
            });
        }

        let slot = {
            let mut state = self.inner.state.lock();
            let slot = state.take_free_slot();

            if slot.is_none() {
                state.failed_acquisitions = state.failed_acquisitions.wrapping_add(1);
            }

            slot
        };

        let Some(slot) = slot else {
            warn!(
                buffer_count = self.buffer_count(),
                requested_bytes, "buffer pool exhausted"
            );

            return Err(Error::PoolExhausted {
                buffer_count: self.buffer_count(),
            });
        };

        let ptr = self.inner.block_ptr(slot);

        // SAFETY: The slot was just marked in use, so we have exclusive access to its memory,
        // and `requested_bytes` is within the block capacity checked above.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, requested_bytes);
        }

        trace!(slot, requested_bytes, "acquired pooled block");

        // SAFETY: The pointer is the start of `slot` within our region, the region is
        // initialized (zeroed on creation), slots are aligned to BLOCK_ALIGNMENT and the slot
        // was handed out by `take_free_slot()` which guarantees no other block owns it.
        Ok(unsafe { Block::pooled(ptr, capacity, Arc::clone(&self.inner), slot) })
    }

    /// Returns a block to the pool ahead of it being dropped.
    ///
    /// # Errors
    ///
    /// Returns the block back to the caller if it was not lent out by this pool. Dropping the
    /// returned block releases it to wherever it actually came from.
    pub fn release(&self, block: Block) -> std::result::Result<(), Block> {
        if block.belongs_to(&self.inner) {
            // Dropping the block returns its slot to us.
            drop(block);
            Ok(())
        } else {
            Err(block)
        }
    }

    /// Whether `block` was lent out by this pool.
    #[must_use]
    pub fn owns(&self, block: &Block) -> bool {
        block.belongs_to(&self.inner)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

/// A point-in-time snapshot of [`BufferPool`] usage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Capacity of every block in bytes.
    pub block_capacity: usize,

    /// Total number of blocks in the pool.
    pub buffer_count: usize,

    /// Number of blocks lent out at the time of the snapshot.
    pub in_use: usize,

    /// Number of blocks available at the time of the snapshot.
    pub available: usize,

    /// Highest number of blocks that have been lent out at the same time.
    pub peak_in_use: usize,

    /// Number of acquisitions that failed because the pool was exhausted.
    pub failed_acquisitions: u64,
}

/// State shared between a pool and every block it has lent out.
pub(crate) struct PoolInner {
    /// Start of the single memory region that holds every block.
    region_ptr: NonNull<u8>,

    region_layout: Layout,

    block_capacity: NonZero<usize>,

    /// Distance between the starts of neighboring blocks: the capacity rounded up to
    /// `BLOCK_ALIGNMENT` so every block starts aligned.
    block_stride: usize,

    buffer_count: NonZero<usize>,

    state: Mutex<PoolState>,
}

struct PoolState {
    /// Stack of free slot indexes. Reserved to `buffer_count` up front, so pushing and popping
    /// never reallocates.
    free_slots: Vec<usize>,

    /// Per-slot in-use flag, used to detect a slot being returned twice.
    in_use: Vec<bool>,

    peak_in_use: usize,

    failed_acquisitions: u64,
}

impl PoolInner {
    fn new(block_capacity: NonZero<usize>, buffer_count: NonZero<usize>) -> Result<Self> {
        let requested_total = block_capacity.get().saturating_mul(buffer_count.get());

        let block_stride = block_capacity
            .get()
            .checked_next_multiple_of(BLOCK_ALIGNMENT)
            .ok_or_else(|| allocation_failure_of(requested_total))?;

        let region_size = block_stride
            .checked_mul(buffer_count.get())
            .ok_or_else(|| allocation_failure_of(requested_total))?;

        let region_layout = Layout::from_size_align(region_size, BLOCK_ALIGNMENT)
            .map_err(|_layout_error| allocation_failure_of(requested_total))?;

        // The bookkeeping is reserved before the region so that a failure here has nothing
        // to clean up.
        let mut free_slots = Vec::new();
        free_slots
            .try_reserve_exact(buffer_count.get())
            .map_err(|_reserve_error| allocation_failure_of(requested_total))?;

        let mut in_use = Vec::new();
        in_use
            .try_reserve_exact(buffer_count.get())
            .map_err(|_reserve_error| allocation_failure_of(requested_total))?;

        // Popping from the end hands out slot 0 first.
        free_slots.extend((0..buffer_count.get()).rev());
        in_use.resize(buffer_count.get(), false);

        // SAFETY: The layout is not zero-sized because both capacity and count are non-zero.
        // The region is zeroed so every byte of every block is initialized from the start.
        let region_ptr = NonNull::new(unsafe { alloc::alloc_zeroed(region_layout) })
            .ok_or_else(|| allocation_failure_of(requested_total))?;

        debug!(
            block_capacity = block_capacity.get(),
            buffer_count = buffer_count.get(),
            region_size,
            "buffer pool created"
        );

        Ok(Self {
            region_ptr,
            region_layout,
            block_capacity,
            block_stride,
            buffer_count,
            state: Mutex::new(PoolState {
                free_slots,
                in_use,
                peak_in_use: 0,
                failed_acquisitions: 0,
            }),
        })
    }

    fn block_ptr(&self, slot: usize) -> NonNull<u8> {
        assert!(
            slot < self.buffer_count.get(),
            "slot {slot} out of bounds in pool of {} blocks",
            self.buffer_count
        );

        // Cannot overflow: the product is within the region size we allocated.
        let offset = slot.wrapping_mul(self.block_stride);

        // SAFETY: The offset is within the allocated region as guaranteed by the bounds check.
        unsafe { self.region_ptr.add(offset) }
    }

    /// Marks `slot` as free again. Called when a pooled block is dropped.
    pub(crate) fn return_slot(&self, slot: usize) {
        let mut state = self.state.lock();

        if state.mark_free(slot) {
            drop(state);
            trace!(slot, "released pooled block");
        } else {
            drop(state);
            error!(slot, "pooled block released while already free; ignoring release");
        }
    }
}

impl PoolState {
    fn in_use_count(&self) -> usize {
        // Cannot underflow: free slots are a subset of all slots.
        self.in_use.len().wrapping_sub(self.free_slots.len())
    }

    fn take_free_slot(&mut self) -> Option<usize> {
        let slot = self.free_slots.pop()?;

        let flag = self
            .in_use
            .get_mut(slot)
            .expect("free list only ever contains valid slot indexes");
        debug_assert!(!*flag, "slot {slot} on the free list was marked in use");
        *flag = true;

        self.peak_in_use = self.peak_in_use.max(self.in_use_count());

        Some(slot)
    }

    /// Returns `false` if the slot was not in use, leaving the state unchanged.
    fn mark_free(&mut self, slot: usize) -> bool {
        match self.in_use.get_mut(slot) {
            Some(flag) if *flag => {
                *flag = false;
                self.free_slots.push(slot);
                true
            }
            _ => false,
        }
    }
}

fn allocation_failure_of(bytes: usize) -> Error {
    Error::AllocationFailure { bytes }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        debug!(
            block_capacity = self.block_capacity.get(),
            buffer_count = self.buffer_count.get(),
            "buffer pool released"
        );

        // SAFETY: The region was allocated in `new()` with this layout. We are dropped only
        // after every handle and every lent-out block is gone, so nothing references it.
        unsafe {
            alloc::dealloc(self.region_ptr.as_ptr(), self.region_layout);
        }
    }
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct(type_name::<Self>())
            .field("block_capacity", &self.block_capacity)
            .field("buffer_count", &self.buffer_count)
            .field("in_use", &state.in_use_count())
            .finish_non_exhaustive()
    }
}

// SAFETY: The region pointer is only dereferenced through blocks, each of which exclusively
// owns one slot. All mutable bookkeeping is behind the mutex.
unsafe impl Send for PoolInner {}

// SAFETY: See `Send`. Shared access only ever locks the mutex or computes slot addresses.
unsafe impl Sync for PoolInner {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::thread;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::BlockKind;

    assert_impl_all!(BufferPool: Send, Sync, Clone, fmt::Debug);
    assert_impl_all!(PoolStats: Send, Sync, Copy);

    #[test]
    fn new_pool_is_all_free() {
        let pool = BufferPool::new(nz!(100), nz!(4)).unwrap();

        assert_eq!(pool.block_capacity(), 100);
        assert_eq!(pool.buffer_count(), 4);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn never_lends_more_than_buffer_count() {
        let pool = BufferPool::new(nz!(64), nz!(3)).unwrap();

        let blocks: Vec<_> = (0..3).map(|_| pool.acquire(64).unwrap()).collect();
        assert_eq!(pool.in_use(), 3);

        let result = pool.acquire(1);
        assert!(matches!(result, Err(Error::PoolExhausted { buffer_count: 3 })));
        assert_eq!(pool.in_use(), 3);

        drop(blocks);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn reusable_after_release() {
        let pool = BufferPool::new(nz!(16), nz!(1)).unwrap();

        for _ in 0..10 {
            let block = pool.acquire(16).unwrap();
            assert!(pool.acquire(16).is_err());
            pool.release(block).unwrap();
        }

        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn too_large_request_fails() {
        let pool = BufferPool::new(nz!(16), nz!(1)).unwrap();

        let result = pool.acquire(17);

        assert!(matches!(
            result,
            Err(Error::BufferTooLarge {
                requested: 17,
                capacity: 16
            })
        ));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn acquired_blocks_are_distinct_and_aligned() {
        let pool = BufferPool::new(nz!(10), nz!(3)).unwrap();

        let a = pool.acquire(10).unwrap();
        let b = pool.acquire(10).unwrap();
        let c = pool.acquire(10).unwrap();

        let addresses = [a.as_ptr(), b.as_ptr(), c.as_ptr()].map(|p| p.as_ptr() as usize);

        for address in addresses {
            assert_eq!(address % BLOCK_ALIGNMENT, 0);
        }

        assert_ne!(addresses[0], addresses[1]);
        assert_ne!(addresses[1], addresses[2]);
        assert_ne!(addresses[0], addresses[2]);
    }

    #[test]
    fn reacquired_block_is_zeroed_over_requested_length() {
        let pool = BufferPool::new(nz!(8), nz!(1)).unwrap();

        let mut block = pool.acquire(8).unwrap();
        block.as_bytes_mut().fill(0xAB);
        drop(block);

        let block = pool.acquire(8).unwrap();
        assert!(block.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn release_of_foreign_block_hands_it_back() {
        let pool = BufferPool::new(nz!(8), nz!(1)).unwrap();
        let other = BufferPool::new(nz!(8), nz!(1)).unwrap();

        let foreign = other.acquire(8).unwrap();
        let foreign = pool.release(foreign).unwrap_err();
        assert_eq!(other.in_use(), 1);
        assert!(other.owns(&foreign));

        drop(foreign);
        assert_eq!(other.in_use(), 0);

        let direct = Block::direct(nz!(8)).unwrap();
        let direct = pool.release(direct).unwrap_err();
        assert_eq!(direct.kind(), BlockKind::Direct);
    }

    #[test]
    fn double_return_is_ignored_not_duplicated() {
        let pool = BufferPool::new(nz!(8), nz!(2)).unwrap();

        let block = pool.acquire(8).unwrap();
        drop(block);
        assert_eq!(pool.available(), 2);

        // Slot 0 is already free; returning it again must not put it on the free list twice.
        pool.inner().return_slot(0);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn statistics_track_peak_and_failures() {
        let pool = BufferPool::new(nz!(8), nz!(2)).unwrap();

        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(1).unwrap();
        _ = pool.acquire(1).unwrap_err();
        _ = pool.acquire(1).unwrap_err();
        drop(a);

        let stats = pool.statistics();
        assert_eq!(stats.block_capacity, 8);
        assert_eq!(stats.buffer_count, 2);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.peak_in_use, 2);
        assert_eq!(stats.failed_acquisitions, 2);

        drop(b);
    }

    #[test]
    fn blocks_outlive_pool_handle() {
        let pool = BufferPool::new(nz!(4), nz!(1)).unwrap();
        let mut block = pool.acquire(4).unwrap();

        drop(pool);

        block.as_bytes_mut().copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(block.as_bytes(), &[9, 8, 7, 6]);
    }

    #[test]
    fn impossible_pool_fails_to_allocate() {
        let result = BufferPool::new(NonZero::new(usize::MAX / 2).unwrap(), nz!(4));

        assert!(matches!(result, Err(Error::AllocationFailure { .. })));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shared_between_threads() {
        let pool = BufferPool::new(nz!(32), nz!(8)).unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let first = pool.acquire(32).unwrap();
                        let second = pool.acquire(32).unwrap();
                        drop(first);
                        drop(second);
                    }
                });
            }
        });

        let stats = pool.statistics();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 8);
        assert!(stats.peak_in_use <= 8);
    }
}
