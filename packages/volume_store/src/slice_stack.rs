use std::any::type_name;
use std::{fmt, iter};

use tracing::debug;

use crate::grid::required_bytes;
use crate::{BufferPool, Element, Error, Grid2D, OwnershipPolicy, Result};

/// A 3D volume stored as an ordered sequence of equally sized [`Grid2D`] slices.
///
/// Each slice is a separate block of memory, so a single slice can be read, modified or
/// transmitted without touching the rest of the volume. Slices keep their depth order for the
/// lifetime of the stack.
///
/// # Ownership
///
/// The stack follows one of two [`OwnershipPolicy`] values, fixed at creation:
///
/// * [`OwnsSlices`][OwnershipPolicy::OwnsSlices] - created by [`owning()`](Self::owning). The
///   stack allocates every slice up front, either from a [`BufferPool`] or directly, and
///   releases them all when dropped. If allocation fails part way through, the slices that were
///   already created are released before the error is returned.
/// * [`BorrowsSlices`][OwnershipPolicy::BorrowsSlices] - created by
///   [`borrowing()`](Self::borrowing). The stack starts with empty slots that the caller binds
///   to grids it owns elsewhere via [`bind_slice()`](Self::bind_slice). Dropping the stack
///   leaves those grids untouched. The lifetime `'a` ties the stack to the bound grids.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use volume_store::{BufferPool, SliceStack};
///
/// let pool = BufferPool::builder()
///     .block_capacity_for::<u16>(nz!(4), nz!(3))
///     .buffer_count(nz!(5))
///     .build()
///     .unwrap();
///
/// let mut stack = SliceStack::<u16>::owning(4, 3, 5, Some(&pool)).unwrap();
/// assert_eq!(pool.available(), 0);
///
/// stack.slice_mut(3).unwrap().set(2, 1, 1000).unwrap();
/// assert_eq!(stack.slice(3).unwrap().get(2, 1).unwrap(), 1000);
///
/// drop(stack);
/// assert_eq!(pool.available(), 5);
/// ```
pub struct SliceStack<'a, T: Element> {
    width: usize,
    height: usize,
    slots: Slots<'a, T>,
}

enum Slots<'a, T: Element> {
    Owned(Vec<Grid2D<T>>),
    Borrowed(Vec<Option<&'a mut Grid2D<T>>>),
}

impl<'a, T: Element> SliceStack<'a, T> {
    /// Creates a stack with the given ownership policy.
    ///
    /// Under [`OwnsSlices`][OwnershipPolicy::OwnsSlices] this is [`owning()`](Self::owning);
    /// under [`BorrowsSlices`][OwnershipPolicy::BorrowsSlices] this is
    /// [`borrowing()`](Self::borrowing) and `pool` is not used.
    ///
    /// # Errors
    ///
    /// Returns the errors of the constructor for the chosen policy.
    pub fn new(
        width: usize,
        height: usize,
        depth: usize,
        policy: OwnershipPolicy,
        pool: Option<&BufferPool>,
    ) -> Result<Self> {
        match policy {
            OwnershipPolicy::OwnsSlices => Self::owning(width, height, depth, pool),
            OwnershipPolicy::BorrowsSlices => Self::borrowing(width, height, depth),
        }
    }

    /// Creates a stack of `depth` zero-initialized slices that the stack owns.
    ///
    /// Every slice is allocated immediately: from `pool` if one is given, otherwise directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] if any dimension is zero, and otherwise any error
    /// from creating a slice (e.g. [`Error::PoolExhausted`] when the pool runs out of blocks),
    /// in which case every slice created so far has already been released again.
    pub fn owning(
        width: usize,
        height: usize,
        depth: usize,
        pool: Option<&BufferPool>,
    ) -> Result<Self> {
        validate_dimensions::<T>(width, height, depth)?;

        let mut slices = Vec::new();
        slices
            .try_reserve_exact(depth)
            .map_err(|_reserve_error| Error::AllocationFailure {
                bytes: depth.saturating_mul(size_of::<Grid2D<T>>()),
            })?;

        for index in 0..depth {
            let slice = match pool {
                Some(pool) => Grid2D::from_pool(width, height, pool),
                None => Grid2D::new(width, height),
            };

            match slice {
                Ok(slice) => slices.push(slice),
                Err(error) => {
                    debug!(
                        index,
                        depth,
                        %error,
                        "slice allocation failed; releasing already created slices"
                    );

                    // Dropping `slices` on return releases exactly the slices created so far.
                    return Err(error);
                }
            }
        }

        debug!(
            width,
            height,
            depth,
            pooled = pool.is_some(),
            element = type_name::<T>(),
            "allocated owning slice stack"
        );

        Ok(Self {
            width,
            height,
            slots: Slots::Owned(slices),
        })
    }

    /// Creates a stack of `depth` empty slots for grids owned elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] if any dimension is zero.
    pub fn borrowing(width: usize, height: usize, depth: usize) -> Result<Self> {
        validate_dimensions::<T>(width, height, depth)?;

        Ok(Self {
            width,
            height,
            slots: Slots::Borrowed(iter::repeat_with(|| None).take(depth).collect()),
        })
    }

    /// Width of every slice in elements.
    #[must_use]
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of every slice in elements.
    #[must_use]
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of slices.
    #[must_use]
    #[inline]
    pub fn depth(&self) -> usize {
        match &self.slots {
            Slots::Owned(slices) => slices.len(),
            Slots::Borrowed(slots) => slots.len(),
        }
    }

    /// The ownership policy the stack was created with.
    #[must_use]
    pub fn policy(&self) -> OwnershipPolicy {
        match self.slots {
            Slots::Owned(_) => OwnershipPolicy::OwnsSlices,
            Slots::Borrowed(_) => OwnershipPolicy::BorrowsSlices,
        }
    }

    /// Whether the slot at `index` holds a slice. Always `true` for valid indexes of an
    /// owning stack.
    #[must_use]
    pub fn is_bound(&self, index: usize) -> bool {
        match &self.slots {
            Slots::Owned(slices) => index < slices.len(),
            Slots::Borrowed(slots) => matches!(slots.get(index), Some(Some(_))),
        }
    }

    /// The slice at depth `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= depth()` and [`Error::UnboundSlice`] if the
    /// slot of a borrowing stack has not been bound.
    pub fn slice(&self, index: usize) -> Result<&Grid2D<T>> {
        let out_of_range = self.out_of_range(index);

        match &self.slots {
            Slots::Owned(slices) => slices.get(index).ok_or(out_of_range),
            Slots::Borrowed(slots) => match slots.get(index) {
                Some(Some(slice)) => Ok(&**slice),
                Some(None) => Err(Error::UnboundSlice { index }),
                None => Err(out_of_range),
            },
        }
    }

    /// The slice at depth `index`, for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `index >= depth()` and [`Error::UnboundSlice`] if the
    /// slot of a borrowing stack has not been bound.
    pub fn slice_mut(&mut self, index: usize) -> Result<&mut Grid2D<T>> {
        let out_of_range = self.out_of_range(index);

        match &mut self.slots {
            Slots::Owned(slices) => slices.get_mut(index).ok_or(out_of_range),
            Slots::Borrowed(slots) => match slots.get_mut(index) {
                Some(Some(slice)) => Ok(&mut **slice),
                Some(None) => Err(Error::UnboundSlice { index }),
                None => Err(out_of_range),
            },
        }
    }

    /// Binds the slot at depth `index` of a borrowing stack to `grid`.
    ///
    /// The stack does not take ownership of the grid. Any grid previously bound to the slot is
    /// handed back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongOwnershipPolicy`] for an owning stack, [`Error::OutOfRange`] if
    /// `index >= depth()` and [`Error::InvalidDimensions`] if the grid's width or height differ
    /// from the stack's.
    pub fn bind_slice(
        &mut self,
        index: usize,
        grid: &'a mut Grid2D<T>,
    ) -> Result<Option<&'a mut Grid2D<T>>> {
        let out_of_range = self.out_of_range(index);
        let (width, height, depth) = (self.width, self.height, self.depth());

        let Slots::Borrowed(slots) = &mut self.slots else {
            return Err(Error::WrongOwnershipPolicy {
                operation: "bind_slice",
                policy: OwnershipPolicy::OwnsSlices,
            });
        };

        let slot = slots.get_mut(index).ok_or(out_of_range)?;

        if grid.width() != width || grid.height() != height {
            return Err(Error::InvalidDimensions {
                width: grid.width(),
                height: grid.height(),
                depth,
                problem: "bound slice must match the width and height of the stack",
            });
        }

        Ok(slot.replace(grid))
    }

    /// Replaces the slice at depth `index` of an owning stack with `grid`, releasing the
    /// memory of the previous slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongOwnershipPolicy`] for a borrowing stack, [`Error::OutOfRange`] if
    /// `index >= depth()` and [`Error::InvalidDimensions`] if the grid's width or height differ
    /// from the stack's.
    pub fn replace_slice(&mut self, index: usize, grid: Grid2D<T>) -> Result<()> {
        let out_of_range = self.out_of_range(index);
        let (width, height, depth) = (self.width, self.height, self.depth());

        let Slots::Owned(slices) = &mut self.slots else {
            return Err(Error::WrongOwnershipPolicy {
                operation: "replace_slice",
                policy: OwnershipPolicy::BorrowsSlices,
            });
        };

        let slot = slices.get_mut(index).ok_or(out_of_range)?;

        if grid.width() != width || grid.height() != height {
            return Err(Error::InvalidDimensions {
                width: grid.width(),
                height: grid.height(),
                depth,
                problem: "replacement slice must match the width and height of the stack",
            });
        }

        // The previous slice is dropped here, releasing its block.
        *slot = grid;
        Ok(())
    }

    /// Iterates over the bound slices in depth order, skipping unbound slots of a borrowing
    /// stack.
    pub fn iter(&self) -> impl Iterator<Item = &Grid2D<T>> {
        let (owned, borrowed) = match &self.slots {
            Slots::Owned(slices) => (Some(slices.iter()), None),
            Slots::Borrowed(slots) => (None, Some(slots.iter().flatten().map(|slice| &**slice))),
        };

        owned.into_iter().flatten().chain(borrowed.into_iter().flatten())
    }

    /// The element data of the slice at depth `index` as bytes.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`slice()`](Self::slice).
    pub fn slice_bytes(&self, index: usize) -> Result<&[u8]> {
        self.slice(index).map(Grid2D::as_bytes)
    }

    /// The element data of the slice at depth `index` as bytes, for writing.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`slice_mut()`](Self::slice_mut).
    pub fn slice_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        self.slice_mut(index).map(Grid2D::as_bytes_mut)
    }

    fn out_of_range(&self, index: usize) -> Error {
        Error::OutOfRange {
            axis: "slice",
            index,
            bound: self.depth(),
        }
    }
}

fn validate_dimensions<T: Element>(width: usize, height: usize, depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(Error::InvalidDimensions {
            width,
            height,
            depth,
            problem: "depth must be non-zero",
        });
    }

    required_bytes::<T>(width, height)
        .map(|_| ())
        .map_err(|error| match error {
            Error::InvalidDimensions { problem, .. } => Error::InvalidDimensions {
                width,
                height,
                depth,
                problem,
            },
            other => other,
        })
}

impl<T: Element> fmt::Debug for SliceStack<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth())
            .field("policy", &self.policy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::BlockKind;

    assert_impl_all!(SliceStack<'static, u16>: Send, Sync, fmt::Debug);

    fn pool_for_slices(width: usize, height: usize, count: usize) -> BufferPool {
        BufferPool::builder()
            .block_capacity_for::<u16>(width.try_into().unwrap(), height.try_into().unwrap())
            .buffer_count(count.try_into().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn owning_direct_stack_has_zeroed_slices() {
        let stack = SliceStack::<u32>::owning(3, 2, 4, None).unwrap();

        assert_eq!(stack.width(), 3);
        assert_eq!(stack.height(), 2);
        assert_eq!(stack.depth(), 4);
        assert_eq!(stack.policy(), OwnershipPolicy::OwnsSlices);

        for index in 0..4 {
            let slice = stack.slice(index).unwrap();
            assert_eq!(slice.kind(), BlockKind::Direct);
            assert!(slice.as_slice().iter().all(|v| *v == 0));
        }
    }

    #[test]
    fn owning_pooled_stack_returns_every_block() {
        let pool = pool_for_slices(4, 3, 6);

        let stack = SliceStack::<u16>::owning(4, 3, 6, Some(&pool)).unwrap();
        assert_eq!(pool.in_use(), 6);
        assert_eq!(stack.slice(5).unwrap().kind(), BlockKind::Pooled);

        drop(stack);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 6);
    }

    #[test]
    fn partial_construction_releases_created_slices() {
        let pool = pool_for_slices(4, 3, 3);

        let result = SliceStack::<u16>::owning(4, 3, 5, Some(&pool));

        assert!(matches!(result, Err(Error::PoolExhausted { buffer_count: 3 })));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn slices_are_independent() {
        let mut stack = SliceStack::<u8>::owning(2, 2, 3, None).unwrap();

        stack.slice_mut(1).unwrap().fill(9);

        assert!(stack.slice(0).unwrap().as_slice().iter().all(|v| *v == 0));
        assert!(stack.slice(1).unwrap().as_slice().iter().all(|v| *v == 9));
        assert!(stack.slice(2).unwrap().as_slice().iter().all(|v| *v == 0));
    }

    #[test]
    fn slice_out_of_range_fails() {
        let mut stack = SliceStack::<u8>::owning(2, 2, 3, None).unwrap();

        assert!(matches!(
            stack.slice(3),
            Err(Error::OutOfRange {
                axis: "slice",
                index: 3,
                bound: 3
            })
        ));
        assert!(matches!(stack.slice_mut(3), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn zero_depth_is_invalid() {
        for policy in [OwnershipPolicy::OwnsSlices, OwnershipPolicy::BorrowsSlices] {
            let result = SliceStack::<u8>::new(2, 2, 0, policy, None);

            assert!(matches!(
                result,
                Err(Error::InvalidDimensions { depth: 0, .. })
            ));
        }
    }

    #[test]
    fn zero_width_reports_full_dimensions() {
        let result = SliceStack::<u8>::owning(0, 2, 5, None);

        assert!(matches!(
            result,
            Err(Error::InvalidDimensions {
                width: 0,
                height: 2,
                depth: 5,
                ..
            })
        ));
    }

    #[test]
    fn borrowing_stack_starts_unbound() {
        let stack = SliceStack::<u8>::borrowing(2, 2, 2).unwrap();

        assert_eq!(stack.policy(), OwnershipPolicy::BorrowsSlices);
        assert!(!stack.is_bound(0));
        assert!(matches!(stack.slice(0), Err(Error::UnboundSlice { index: 0 })));
        assert!(matches!(stack.slice(2), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn borrowing_stack_reads_and_writes_bound_grids() {
        let mut first = Grid2D::<u16>::new(2, 2).unwrap();
        let mut second = Grid2D::<u16>::new(2, 2).unwrap();

        {
            let mut stack = SliceStack::borrowing(2, 2, 2).unwrap();
            assert!(stack.bind_slice(0, &mut first).unwrap().is_none());
            assert!(stack.bind_slice(1, &mut second).unwrap().is_none());

            stack.slice_mut(1).unwrap().set(1, 1, 42).unwrap();
            assert_eq!(stack.slice(1).unwrap().get(1, 1).unwrap(), 42);
            assert!(stack.is_bound(0));
        }

        assert_eq!(second.get(1, 1).unwrap(), 42);
        assert_eq!(first.get(1, 1).unwrap(), 0);
    }

    #[test]
    fn borrowing_stack_leaves_pool_untouched_on_drop() {
        let pool = pool_for_slices(2, 2, 3);
        let mut grids: Vec<_> = (0..3)
            .map(|_| Grid2D::<u16>::from_pool(2, 2, &pool).unwrap())
            .collect();
        assert_eq!(pool.in_use(), 3);

        let mut stack = SliceStack::borrowing(2, 2, 3).unwrap();
        for (index, grid) in grids.iter_mut().enumerate() {
            stack.bind_slice(index, grid).unwrap();
        }
        stack.slice_mut(2).unwrap().set(0, 0, 77).unwrap();

        drop(stack);

        assert_eq!(pool.in_use(), 3);
        assert_eq!(grids[2].get(0, 0).unwrap(), 77);

        drop(grids);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn iter_skips_unbound_slots() {
        let mut first = Grid2D::<u8>::new(1, 1).unwrap();
        let mut third = Grid2D::<u8>::new(1, 1).unwrap();
        first.set(0, 0, 1).unwrap();
        third.set(0, 0, 3).unwrap();

        let mut stack = SliceStack::borrowing(1, 1, 3).unwrap();
        stack.bind_slice(0, &mut first).unwrap();
        stack.bind_slice(2, &mut third).unwrap();

        let values: Vec<u8> = stack.iter().map(|slice| slice.get(0, 0).unwrap()).collect();
        assert_eq!(values, [1, 3]);

        let owned = SliceStack::<u8>::owning(1, 1, 4, None).unwrap();
        assert_eq!(owned.iter().count(), 4);
    }

    #[test]
    fn rebinding_hands_back_previous_grid() {
        let mut first = Grid2D::<u8>::new(1, 1).unwrap();
        let mut second = Grid2D::<u8>::new(1, 1).unwrap();
        second.set(0, 0, 2).unwrap();

        let mut stack = SliceStack::borrowing(1, 1, 1).unwrap();
        stack.bind_slice(0, &mut first).unwrap();

        let previous = stack.bind_slice(0, &mut second).unwrap().unwrap();
        previous.set(0, 0, 1).unwrap();

        assert_eq!(stack.slice(0).unwrap().get(0, 0).unwrap(), 2);
    }

    #[test]
    fn bind_rejects_mismatched_grid() {
        let mut grid = Grid2D::<u8>::new(3, 2).unwrap();
        let mut stack = SliceStack::borrowing(2, 2, 1).unwrap();

        assert!(matches!(
            stack.bind_slice(0, &mut grid),
            Err(Error::InvalidDimensions { .. })
        ));
        assert!(!stack.is_bound(0));
    }

    #[test]
    fn bind_rejects_out_of_range_index() {
        let mut grid = Grid2D::<u8>::new(2, 2).unwrap();
        let mut stack = SliceStack::borrowing(2, 2, 1).unwrap();

        assert!(matches!(
            stack.bind_slice(1, &mut grid),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn bind_is_rejected_by_owning_stack() {
        let mut grid = Grid2D::<u8>::new(2, 2).unwrap();
        let mut stack = SliceStack::owning(2, 2, 1, None).unwrap();

        assert!(matches!(
            stack.bind_slice(0, &mut grid),
            Err(Error::WrongOwnershipPolicy {
                operation: "bind_slice",
                ..
            })
        ));
    }

    #[test]
    fn replace_releases_previous_slice() {
        let pool = pool_for_slices(2, 2, 3);
        let mut stack = SliceStack::<u16>::owning(2, 2, 2, Some(&pool)).unwrap();
        assert_eq!(pool.in_use(), 2);

        let mut replacement = Grid2D::<u16>::new(2, 2).unwrap();
        replacement.fill(5);
        stack.replace_slice(0, replacement).unwrap();

        assert_eq!(pool.in_use(), 1);
        assert_eq!(stack.slice(0).unwrap().get(1, 1).unwrap(), 5);
        assert_eq!(stack.slice(0).unwrap().kind(), BlockKind::Direct);
    }

    #[test]
    fn replace_is_rejected_by_borrowing_stack() {
        let mut stack = SliceStack::<u8>::borrowing(2, 2, 1).unwrap();

        let result = stack.replace_slice(0, Grid2D::new(2, 2).unwrap());

        assert!(matches!(
            result,
            Err(Error::WrongOwnershipPolicy {
                operation: "replace_slice",
                ..
            })
        ));
    }

    #[test]
    fn replace_rejects_mismatched_grid() {
        let mut stack = SliceStack::<u8>::owning(2, 2, 1, None).unwrap();

        let result = stack.replace_slice(0, Grid2D::new(2, 3).unwrap());

        assert!(matches!(result, Err(Error::InvalidDimensions { .. })));
    }

    #[test]
    fn slice_bytes_expose_native_layout() {
        let mut stack = SliceStack::<u16>::owning(2, 1, 2, None).unwrap();

        stack
            .slice_bytes_mut(1)
            .unwrap()
            .copy_from_slice(&[0x34, 0x12, 0, 0]);

        assert_eq!(
            stack.slice(1).unwrap().get(0, 0).unwrap(),
            u16::from_ne_bytes([0x34, 0x12])
        );
        assert_eq!(stack.slice_bytes(0).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn new_ignores_pool_for_borrowing_policy() {
        let pool = pool_for_slices(2, 2, 1);

        let stack =
            SliceStack::<u16>::new(2, 2, 4, OwnershipPolicy::BorrowsSlices, Some(&pool)).unwrap();

        assert_eq!(stack.depth(), 4);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn new_with_owning_policy_uses_pool() {
        let pool = pool_for_slices(2, 2, 2);

        let stack =
            SliceStack::<u16>::new(2, 2, 2, OwnershipPolicy::OwnsSlices, Some(&pool)).unwrap();

        assert_eq!(stack.depth(), 2);
        assert_eq!(pool.in_use(), 2);
    }
}
