use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{BufferPool, Element, Result};

/// Builder for creating an instance of [`BufferPool`].
///
/// Both the block capacity and the buffer count are mandatory. The block capacity can be given
/// in bytes via `.block_capacity()` or derived from slice dimensions via
/// `.block_capacity_for::<T>()`.
///
/// # Examples
///
/// Using an explicit capacity:
///
/// ```
/// use new_zealand::nz;
/// use volume_store::BufferPool;
///
/// let pool = BufferPool::builder()
///     .block_capacity(nz!(4096))
///     .buffer_count(nz!(16))
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.buffer_count(), 16);
/// ```
///
/// Sizing the blocks for a known slice shape:
///
/// ```
/// use new_zealand::nz;
/// use volume_store::BufferPool;
///
/// let pool = BufferPool::builder()
///     .block_capacity_for::<f32>(nz!(64), nz!(32))
///     .buffer_count(nz!(4))
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.block_capacity(), 64 * 32 * 4);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct BufferPoolBuilder {
    block_capacity: Option<NonZero<usize>>,
    buffer_count: Option<NonZero<usize>>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BufferPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            block_capacity: None,
            buffer_count: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the capacity of every block in bytes.
    #[inline]
    pub fn block_capacity(mut self, bytes: NonZero<usize>) -> Self {
        self.block_capacity = Some(bytes);
        self
    }

    /// Sets the block capacity to exactly fit one `width` x `height` grid of `T`.
    ///
    /// # Panics
    ///
    /// Panics if the size of such a grid overflows `usize`.
    #[inline]
    pub fn block_capacity_for<T: Element>(
        mut self,
        width: NonZero<usize>,
        height: NonZero<usize>,
    ) -> Self {
        let bytes = width
            .checked_mul(height)
            .and_then(|elements| elements.checked_mul(element_size::<T>()))
            .expect("grid size exceeds size of virtual memory");

        self.block_capacity = Some(bytes);
        self
    }

    /// Sets the number of blocks in the pool.
    #[inline]
    pub fn buffer_count(mut self, count: NonZero<usize>) -> Self {
        self.buffer_count = Some(count);
        self
    }

    /// Builds the pool, reserving all of its memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`][crate::Error::AllocationFailure] if the memory
    /// cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if the block capacity or the buffer count has not been set.
    pub fn build(self) -> Result<BufferPool> {
        let block_capacity = self.block_capacity.expect(
            "block capacity must be set using .block_capacity() or .block_capacity_for::<T>() before calling .build()",
        );
        let buffer_count = self
            .buffer_count
            .expect("buffer count must be set using .buffer_count() before calling .build()");

        BufferPool::new(block_capacity, buffer_count)
    }
}

fn element_size<T: Element>() -> NonZero<usize> {
    NonZero::new(size_of::<T>()).expect("Element types are never zero-sized")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BufferPoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(BufferPoolBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = BufferPoolBuilder::new();
        assert!(builder.block_capacity.is_none());
        assert!(builder.buffer_count.is_none());
    }

    #[test]
    fn block_capacity_for_multiplies_by_element_size() {
        let builder = BufferPoolBuilder::new().block_capacity_for::<u16>(nz!(4), nz!(3));
        assert_eq!(builder.block_capacity, Some(nz!(24)));

        let builder = BufferPoolBuilder::new().block_capacity_for::<f64>(nz!(4), nz!(3));
        assert_eq!(builder.block_capacity, Some(nz!(96)));
    }

    #[test]
    fn later_setting_wins() {
        let builder = BufferPoolBuilder::new()
            .block_capacity(nz!(10))
            .block_capacity_for::<u8>(nz!(2), nz!(2));
        assert_eq!(builder.block_capacity, Some(nz!(4)));
    }

    #[test]
    fn build_creates_configured_pool() {
        let pool = BufferPoolBuilder::new()
            .block_capacity(nz!(128))
            .buffer_count(nz!(5))
            .build()
            .unwrap();

        assert_eq!(pool.block_capacity(), 128);
        assert_eq!(pool.buffer_count(), 5);
        assert_eq!(pool.available(), 5);
    }

    #[test]
    #[should_panic]
    fn build_without_capacity_panics() {
        _ = BufferPoolBuilder::new().buffer_count(nz!(1)).build();
    }

    #[test]
    #[should_panic]
    fn build_without_count_panics() {
        _ = BufferPoolBuilder::new().block_capacity(nz!(1)).build();
    }

    #[test]
    #[should_panic]
    fn overflowing_slice_size_panics() {
        _ = BufferPoolBuilder::new().block_capacity_for::<u64>(
            NonZero::new(usize::MAX).unwrap(),
            nz!(2),
        );
    }
}
