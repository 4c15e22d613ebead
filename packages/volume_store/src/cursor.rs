use std::iter::FusedIterator;
use std::{fmt, ptr};

use crate::{Error, Grid2D, Result, VolumeElement, VolumeHandle};

/// A position in the depth sequence of a [`VolumeHandle`].
///
/// A cursor is either at one of the slices `0..depth` or at the end position `depth`.
/// Advancing an end cursor keeps it at the end. Cursors are plain values: copying one does
/// not copy any slice data and advancing returns a new cursor.
///
/// Two cursors are equal when they refer to the same volume and the same position.
///
/// # Example
///
/// ```
/// use volume_store::{ElementType, SliceCursor, VolumeHandle};
///
/// let mut volume = VolumeHandle::new();
/// volume.allocate(ElementType::U8, 2, 2, 3, None).unwrap();
///
/// let mut cursor = SliceCursor::begin(&volume).unwrap();
/// let end = SliceCursor::end(&volume).unwrap();
///
/// let mut visited = 0;
/// while cursor != end {
///     assert_eq!(cursor.current_slice::<u8>().unwrap().width(), 2);
///     cursor = cursor.advance();
///     visited += 1;
/// }
///
/// assert_eq!(visited, 3);
/// ```
#[derive(Clone, Copy)]
pub struct SliceCursor<'v, 'a> {
    volume: &'v VolumeHandle<'a>,
    index: usize,
    depth: usize,
}

impl<'v, 'a> SliceCursor<'v, 'a> {
    /// A cursor at the first slice of `volume`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn begin(volume: &'v VolumeHandle<'a>) -> Result<Self> {
        Self::at(volume, 0)
    }

    /// A cursor at the end position of `volume`, one past the last slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn end(volume: &'v VolumeHandle<'a>) -> Result<Self> {
        let depth = volume.depth()?;
        Self::at(volume, depth)
    }

    /// A cursor at slice `index` of `volume`. An `index` equal to the depth gives the end
    /// position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and [`Error::OutOfRange`] if
    /// `index` is beyond the end position.
    pub fn at(volume: &'v VolumeHandle<'a>, index: usize) -> Result<Self> {
        let depth = volume.depth()?;

        if index > depth {
            return Err(Error::OutOfRange {
                axis: "slice",
                index,
                bound: depth,
            });
        }

        Ok(Self {
            volume,
            index,
            depth,
        })
    }

    /// The cursor at the next position. The end position advances to itself.
    #[must_use]
    #[inline]
    pub fn advance(self) -> Self {
        Self {
            index: self.index.saturating_add(1).min(self.depth),
            ..self
        }
    }

    /// The depth index the cursor is at.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the cursor is at the end position.
    #[must_use]
    #[inline]
    pub fn is_end(&self) -> bool {
        self.index == self.depth
    }

    /// The slice at the cursor position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] at the end position, [`Error::TypeMismatch`] if the
    /// volume holds elements of another type and [`Error::UnboundSlice`] if the slice of a
    /// borrowing volume is not bound.
    pub fn current_slice<T: VolumeElement>(&self) -> Result<&'v Grid2D<T>> {
        self.check_not_end()?;
        self.volume.as_stack::<T>()?.slice(self.index)
    }

    /// The element data of the slice at the cursor position as bytes, whatever the element
    /// type.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`current_slice()`](Self::current_slice) except for the type
    /// mismatch.
    pub fn current_bytes(&self) -> Result<&'v [u8]> {
        self.check_not_end()?;
        self.volume.slice_bytes(self.index)
    }

    fn check_not_end(&self) -> Result<()> {
        if self.is_end() {
            return Err(Error::OutOfRange {
                axis: "slice",
                index: self.index,
                bound: self.depth,
            });
        }

        Ok(())
    }
}

impl PartialEq for SliceCursor<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.volume, other.volume) && self.index == other.index
    }
}

impl Eq for SliceCursor<'_, '_> {}

#[cfg_attr(test, mutants::skip)] // No API contract to test.
impl fmt::Debug for SliceCursor<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("volume", &ptr::from_ref(self.volume))
            .field("index", &self.index)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Iterator over the slices of a [`VolumeHandle`] in depth order.
///
/// Created by [`VolumeHandle::slices()`]. Every item is a `Result` because the slices of a
/// borrowing volume may be unbound.
#[derive(Debug)]
pub struct Slices<'v, 'a, T: VolumeElement> {
    cursor: SliceCursor<'v, 'a>,
    _element: std::marker::PhantomData<fn() -> T>,
}

impl<'v, T: VolumeElement> Iterator for Slices<'v, '_, T> {
    type Item = Result<&'v Grid2D<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_end() {
            return None;
        }

        let item = self.cursor.current_slice::<T>();
        self.cursor = self.cursor.advance();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cursor.depth - self.cursor.index;
        (remaining, Some(remaining))
    }
}

impl<T: VolumeElement> ExactSizeIterator for Slices<'_, '_, T> {}
impl<T: VolumeElement> FusedIterator for Slices<'_, '_, T> {}

impl<'a> VolumeHandle<'a> {
    /// A cursor at the first slice. Shorthand for [`SliceCursor::begin()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn cursor(&self) -> Result<SliceCursor<'_, 'a>> {
        SliceCursor::begin(self)
    }

    /// Iterates over the slices as grids of `T`, in depth order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and [`Error::TypeMismatch`] if
    /// the volume holds elements of another type.
    pub fn slices<T: VolumeElement>(&self) -> Result<Slices<'_, 'a, T>> {
        self.as_stack::<T>()?;

        Ok(Slices {
            cursor: SliceCursor::begin(self)?,
            _element: std::marker::PhantomData,
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{ElementType, SliceStack};

    assert_impl_all!(SliceCursor<'static, 'static>: Send, Sync, Copy, Eq, fmt::Debug);

    fn numbered_volume(depth: usize) -> VolumeHandle<'static> {
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::U16, 2, 2, depth, None).unwrap();

        let stack = volume.as_stack_mut::<u16>().unwrap();
        for index in 0..depth {
            stack
                .slice_mut(index)
                .unwrap()
                .fill(u16::try_from(index).unwrap());
        }

        volume
    }

    #[test]
    fn empty_handle_has_no_cursors() {
        let volume = VolumeHandle::new();

        assert!(matches!(SliceCursor::begin(&volume), Err(Error::NotAllocated)));
        assert!(matches!(SliceCursor::end(&volume), Err(Error::NotAllocated)));
        assert!(matches!(volume.slices::<u8>(), Err(Error::NotAllocated)));
    }

    #[test]
    fn visits_slices_in_depth_order() {
        let volume = numbered_volume(4);
        let end = SliceCursor::end(&volume).unwrap();

        let mut cursor = SliceCursor::begin(&volume).unwrap();
        let mut seen = Vec::new();
        while cursor != end {
            seen.push(cursor.current_slice::<u16>().unwrap().get(1, 1).unwrap());
            cursor = cursor.advance();
        }

        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[test]
    fn advancing_end_stays_at_end() {
        let volume = numbered_volume(1);
        let end = SliceCursor::end(&volume).unwrap();

        let cursor = SliceCursor::begin(&volume).unwrap().advance();
        assert_eq!(cursor, end);
        assert_eq!(cursor.advance(), end);
        assert!(cursor.advance().is_end());
    }

    #[test]
    fn advance_does_not_move_original() {
        let volume = numbered_volume(3);
        let begin = SliceCursor::begin(&volume).unwrap();

        let next = begin.advance();

        assert_eq!(begin.index(), 0);
        assert_eq!(next.index(), 1);
        assert_ne!(begin, next);
    }

    #[test]
    fn cursors_of_different_volumes_differ() {
        let first = numbered_volume(2);
        let second = numbered_volume(2);

        assert_ne!(
            SliceCursor::begin(&first).unwrap(),
            SliceCursor::begin(&second).unwrap()
        );
        assert_eq!(
            SliceCursor::begin(&first).unwrap(),
            SliceCursor::at(&first, 0).unwrap()
        );
    }

    #[test]
    fn end_cursor_has_no_slice() {
        let volume = numbered_volume(2);
        let end = SliceCursor::end(&volume).unwrap();

        assert!(matches!(
            end.current_slice::<u16>(),
            Err(Error::OutOfRange { index: 2, bound: 2, .. })
        ));
        assert!(matches!(end.current_bytes(), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn at_beyond_end_is_out_of_range() {
        let volume = numbered_volume(2);

        assert!(SliceCursor::at(&volume, 2).unwrap().is_end());
        assert!(matches!(
            SliceCursor::at(&volume, 3),
            Err(Error::OutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn current_slice_checks_element_type() {
        let volume = numbered_volume(1);
        let cursor = volume.cursor().unwrap();

        assert!(matches!(
            cursor.current_slice::<i16>(),
            Err(Error::TypeMismatch { .. })
        ));
        assert_eq!(cursor.current_bytes().unwrap().len(), 2 * 2 * 2);
    }

    #[test]
    fn slices_iterates_in_order() {
        let volume = numbered_volume(3);

        let iter = volume.slices::<u16>().unwrap();
        assert_eq!(iter.len(), 3);

        let firsts: Vec<u16> = iter.map(|slice| slice.unwrap().get(0, 0).unwrap()).collect();
        assert_eq!(firsts, [0, 1, 2]);

        assert!(matches!(
            volume.slices::<u32>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn slices_reports_unbound_slices() {
        let mut bound = Grid2D::<u8>::new(2, 2).unwrap();
        let mut stack = SliceStack::borrowing(2, 2, 2).unwrap();
        stack.bind_slice(1, &mut bound).unwrap();
        let volume = VolumeHandle::from_stack(stack);

        let items: Vec<_> = volume.slices::<u8>().unwrap().collect();

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(Error::UnboundSlice { index: 0 })));
        assert!(items[1].is_ok());
    }
}
