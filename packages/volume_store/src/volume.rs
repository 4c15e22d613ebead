use tracing::debug;

use crate::{BufferPool, ElementType, Error, OwnershipPolicy, Result, SliceStack, VolumeElement};

/// A [`SliceStack`] of one of the supported element types.
///
/// This is the closed set of stacks a [`VolumeHandle`] can hold. Match on it to run
/// element-type specific code without going through the typed accessors of the handle.
///
/// # Example
///
/// ```
/// use volume_store::{ElementType, VolumeData, VolumeHandle};
///
/// let mut volume = VolumeHandle::new();
/// volume.allocate(ElementType::U8, 2, 2, 2, None).unwrap();
///
/// match volume.data().unwrap() {
///     VolumeData::U8(stack) => assert_eq!(stack.depth(), 2),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Debug)]
#[non_exhaustive]
pub enum VolumeData<'a> {
    /// 8-bit unsigned elements.
    U8(SliceStack<'a, u8>),
    /// 16-bit unsigned elements.
    U16(SliceStack<'a, u16>),
    /// 32-bit unsigned elements.
    U32(SliceStack<'a, u32>),
    /// 64-bit unsigned elements.
    U64(SliceStack<'a, u64>),
    /// 8-bit signed elements.
    I8(SliceStack<'a, i8>),
    /// 16-bit signed elements.
    I16(SliceStack<'a, i16>),
    /// 32-bit signed elements.
    I32(SliceStack<'a, i32>),
    /// 64-bit signed elements.
    I64(SliceStack<'a, i64>),
    /// 32-bit floating point elements.
    F32(SliceStack<'a, f32>),
    /// 64-bit floating point elements.
    F64(SliceStack<'a, f64>),
}

/// Evaluates `$body` with `$stack` bound to the stack inside `$data`, whatever its element type.
macro_rules! with_stack {
    ($data:expr, $stack:ident => $body:expr) => {
        match $data {
            VolumeData::U8($stack) => $body,
            VolumeData::U16($stack) => $body,
            VolumeData::U32($stack) => $body,
            VolumeData::U64($stack) => $body,
            VolumeData::I8($stack) => $body,
            VolumeData::I16($stack) => $body,
            VolumeData::I32($stack) => $body,
            VolumeData::I64($stack) => $body,
            VolumeData::F32($stack) => $body,
            VolumeData::F64($stack) => $body,
        }
    };
}

impl<'a> VolumeData<'a> {
    fn allocate(
        element_type: ElementType,
        width: usize,
        height: usize,
        depth: usize,
        pool: Option<&BufferPool>,
    ) -> Result<Self> {
        Ok(match element_type {
            ElementType::U8 => Self::U8(SliceStack::owning(width, height, depth, pool)?),
            ElementType::U16 => Self::U16(SliceStack::owning(width, height, depth, pool)?),
            ElementType::U32 => Self::U32(SliceStack::owning(width, height, depth, pool)?),
            ElementType::U64 => Self::U64(SliceStack::owning(width, height, depth, pool)?),
            ElementType::I8 => Self::I8(SliceStack::owning(width, height, depth, pool)?),
            ElementType::I16 => Self::I16(SliceStack::owning(width, height, depth, pool)?),
            ElementType::I32 => Self::I32(SliceStack::owning(width, height, depth, pool)?),
            ElementType::I64 => Self::I64(SliceStack::owning(width, height, depth, pool)?),
            ElementType::F32 => Self::F32(SliceStack::owning(width, height, depth, pool)?),
            ElementType::F64 => Self::F64(SliceStack::owning(width, height, depth, pool)?),
        })
    }

    /// The element type of the stack.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::U8(_) => ElementType::U8,
            Self::U16(_) => ElementType::U16,
            Self::U32(_) => ElementType::U32,
            Self::U64(_) => ElementType::U64,
            Self::I8(_) => ElementType::I8,
            Self::I16(_) => ElementType::I16,
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
        }
    }

    /// Width of every slice in elements.
    #[must_use]
    pub fn width(&self) -> usize {
        with_stack!(self, stack => stack.width())
    }

    /// Height of every slice in elements.
    #[must_use]
    pub fn height(&self) -> usize {
        with_stack!(self, stack => stack.height())
    }

    /// Number of slices.
    #[must_use]
    pub fn depth(&self) -> usize {
        with_stack!(self, stack => stack.depth())
    }

    /// Ownership policy of the stack.
    #[must_use]
    pub fn policy(&self) -> OwnershipPolicy {
        with_stack!(self, stack => stack.policy())
    }

    /// The element data of the slice at depth `index` as bytes.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`SliceStack::slice()`].
    pub fn slice_bytes(&self, index: usize) -> Result<&[u8]> {
        with_stack!(self, stack => stack.slice_bytes(index))
    }

    /// The element data of the slice at depth `index` as bytes, for writing.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`SliceStack::slice_mut()`].
    pub fn slice_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        with_stack!(self, stack => stack.slice_bytes_mut(index))
    }
}

/// A 3D volume whose element type is chosen at runtime.
///
/// File readers and network receivers typically learn the element type of a scan from its
/// header. `VolumeHandle` lets them allocate a volume for that type without being generic
/// over it, while processing code recovers the typed [`SliceStack`] through
/// [`as_stack()`](Self::as_stack).
///
/// A handle starts out empty. [`allocate()`](Self::allocate) populates it; allocating again
/// releases the current volume first. Dropping the handle drops the stack, which releases
/// the slice memory it owns.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use volume_store::{BufferPool, ElementType, Error, VolumeHandle};
///
/// let pool = BufferPool::new(nz!(24), nz!(5)).unwrap();
///
/// let mut volume = VolumeHandle::new();
/// volume
///     .allocate(ElementType::U16, 4, 3, 5, Some(&pool))
///     .unwrap();
///
/// assert_eq!(volume.depth().unwrap(), 5);
///
/// let stack = volume.as_stack_mut::<u16>().unwrap();
/// stack.slice_mut(3).unwrap().set(2, 1, 1000).unwrap();
///
/// // Asking for the wrong element type fails.
/// assert!(matches!(
///     volume.as_stack::<u8>(),
///     Err(Error::TypeMismatch { .. })
/// ));
///
/// drop(volume);
/// assert_eq!(pool.available(), 5);
/// ```
#[derive(Debug, Default)]
pub struct VolumeHandle<'a> {
    data: Option<VolumeData<'a>>,
}

impl<'a> VolumeHandle<'a> {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle around an existing stack, for example a borrowing stack whose slices
    /// are owned by the caller.
    #[must_use]
    pub fn from_stack<T: VolumeElement>(stack: SliceStack<'a, T>) -> Self {
        Self {
            data: Some(T::into_data(stack)),
        }
    }

    /// Allocates an owning volume of `depth` slices of `width` x `height` elements.
    ///
    /// Slices come from `pool` if one is given and are allocated directly otherwise. Any
    /// volume the handle already holds is released before the new one is allocated, so its
    /// pooled blocks are available to the new volume. If allocation fails, the handle is left
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`SliceStack::owning()`] unchanged.
    pub fn allocate(
        &mut self,
        element_type: ElementType,
        width: usize,
        height: usize,
        depth: usize,
        pool: Option<&BufferPool>,
    ) -> Result<()> {
        if let Some(previous) = self.data.take() {
            debug!(
                element_type = %previous.element_type(),
                depth = previous.depth(),
                "releasing volume before reallocation"
            );
        }

        let data = VolumeData::allocate(element_type, width, height, depth, pool)?;

        debug!(%element_type, width, height, depth, "allocated volume");

        self.data = Some(data);
        Ok(())
    }

    /// Allocates a volume for an element type given as a tag from a file or message header,
    /// e.g. `"uint16"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedElementType`] if the tag names no supported type (leaving
    /// the handle unchanged) and otherwise the errors of [`allocate()`](Self::allocate).
    pub fn allocate_tagged(
        &mut self,
        element_tag: &str,
        width: usize,
        height: usize,
        depth: usize,
        pool: Option<&BufferPool>,
    ) -> Result<()> {
        let element_type = element_tag.parse::<ElementType>()?;
        self.allocate(element_type, width, height, depth, pool)
    }

    /// Releases the volume, leaving the handle empty.
    pub fn clear(&mut self) {
        self.data = None;
    }

    /// Whether the handle holds a volume.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// The type-erased stack, if allocated.
    #[must_use]
    pub fn data(&self) -> Option<&VolumeData<'a>> {
        self.data.as_ref()
    }

    /// The type-erased stack, if allocated, for writing.
    #[must_use]
    pub fn data_mut(&mut self) -> Option<&mut VolumeData<'a>> {
        self.data.as_mut()
    }

    /// Element type the volume was allocated with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn element_type(&self) -> Result<ElementType> {
        self.allocated().map(VolumeData::element_type)
    }

    /// Width of every slice in elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn width(&self) -> Result<usize> {
        self.allocated().map(VolumeData::width)
    }

    /// Height of every slice in elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn height(&self) -> Result<usize> {
        self.allocated().map(VolumeData::height)
    }

    /// Number of slices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty.
    pub fn depth(&self) -> Result<usize> {
        self.allocated().map(VolumeData::depth)
    }

    /// The volume as a stack of `T` elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and [`Error::TypeMismatch`] if
    /// the volume holds elements of a different type.
    pub fn as_stack<T: VolumeElement>(&self) -> Result<&SliceStack<'a, T>> {
        let data = self.allocated()?;

        T::stack_ref(data).ok_or(Error::TypeMismatch {
            actual: data.element_type(),
            requested: T::ELEMENT_TYPE,
        })
    }

    /// The volume as a stack of `T` elements, for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and [`Error::TypeMismatch`] if
    /// the volume holds elements of a different type.
    pub fn as_stack_mut<T: VolumeElement>(&mut self) -> Result<&mut SliceStack<'a, T>> {
        let data = self.data.as_mut().ok_or(Error::NotAllocated)?;
        let actual = data.element_type();

        T::stack_mut(data).ok_or(Error::TypeMismatch {
            actual,
            requested: T::ELEMENT_TYPE,
        })
    }

    /// The element data of the slice at depth `index` as bytes, whatever the element type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and otherwise the errors of
    /// [`SliceStack::slice()`].
    pub fn slice_bytes(&self, index: usize) -> Result<&[u8]> {
        self.allocated()?.slice_bytes(index)
    }

    /// The element data of the slice at depth `index` as bytes, for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllocated`] if the handle is empty and otherwise the errors of
    /// [`SliceStack::slice_mut()`].
    pub fn slice_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        self.data
            .as_mut()
            .ok_or(Error::NotAllocated)?
            .slice_bytes_mut(index)
    }

    fn allocated(&self) -> Result<&VolumeData<'a>> {
        self.data.as_ref().ok_or(Error::NotAllocated)
    }
}

impl<'a, T: VolumeElement> From<SliceStack<'a, T>> for VolumeHandle<'a> {
    fn from(stack: SliceStack<'a, T>) -> Self {
        Self::from_stack(stack)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Grid2D;

    assert_impl_all!(VolumeHandle<'static>: Send, Sync, Default, std::fmt::Debug);

    #[test]
    fn empty_handle_is_not_allocated() {
        let volume = VolumeHandle::new();

        assert!(!volume.is_allocated());
        assert!(volume.data().is_none());
        assert!(matches!(volume.width(), Err(Error::NotAllocated)));
        assert!(matches!(volume.height(), Err(Error::NotAllocated)));
        assert!(matches!(volume.depth(), Err(Error::NotAllocated)));
        assert!(matches!(volume.element_type(), Err(Error::NotAllocated)));
        assert!(matches!(volume.as_stack::<u8>(), Err(Error::NotAllocated)));
        assert!(matches!(volume.slice_bytes(0), Err(Error::NotAllocated)));
    }

    #[test]
    fn allocate_every_element_type() {
        for element_type in ElementType::ALL {
            let mut volume = VolumeHandle::new();
            volume.allocate(element_type, 3, 2, 4, None).unwrap();

            assert_eq!(volume.element_type().unwrap(), element_type);
            assert_eq!(volume.width().unwrap(), 3);
            assert_eq!(volume.height().unwrap(), 2);
            assert_eq!(volume.depth().unwrap(), 4);
            assert_eq!(
                volume.slice_bytes(0).unwrap().len(),
                3 * 2 * element_type.size_bytes()
            );
            assert_eq!(
                volume.data().unwrap().policy(),
                OwnershipPolicy::OwnsSlices
            );
        }
    }

    #[test]
    fn typed_access_checks_element_type() {
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::F32, 2, 2, 1, None).unwrap();

        assert!(volume.as_stack::<f32>().is_ok());
        assert!(matches!(
            volume.as_stack::<u32>(),
            Err(Error::TypeMismatch {
                actual: ElementType::F32,
                requested: ElementType::U32
            })
        ));
        assert!(matches!(
            volume.as_stack_mut::<f64>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn writes_through_typed_stack_are_visible_as_bytes() {
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::U32, 1, 1, 2, None).unwrap();

        volume
            .as_stack_mut::<u32>()
            .unwrap()
            .slice_mut(1)
            .unwrap()
            .set(0, 0, 0x0102_0304)
            .unwrap();

        assert_eq!(
            volume.slice_bytes(1).unwrap(),
            &0x0102_0304_u32.to_ne_bytes()
        );

        volume
            .slice_bytes_mut(0)
            .unwrap()
            .copy_from_slice(&7_u32.to_ne_bytes());
        assert_eq!(
            volume.as_stack::<u32>().unwrap().slice(0).unwrap().get(0, 0).unwrap(),
            7
        );
    }

    #[test]
    fn unsupported_tag_leaves_handle_unchanged() {
        let mut volume = VolumeHandle::new();
        volume.allocate_tagged("uint16", 2, 2, 2, None).unwrap();

        let result = volume.allocate_tagged("rgba", 2, 2, 2, None);

        assert!(matches!(result, Err(Error::UnsupportedElementType { .. })));
        assert_eq!(volume.element_type().unwrap(), ElementType::U16);
    }

    #[test]
    fn reallocation_releases_previous_volume_first() {
        let pool = BufferPool::new(nz!(16), nz!(4)).unwrap();
        let mut volume = VolumeHandle::new();

        volume.allocate(ElementType::U8, 4, 4, 4, Some(&pool)).unwrap();
        assert_eq!(pool.in_use(), 4);

        // This only fits because the first volume is released before the second is allocated.
        volume.allocate(ElementType::U16, 2, 4, 3, Some(&pool)).unwrap();
        assert_eq!(pool.in_use(), 3);
        assert_eq!(volume.element_type().unwrap(), ElementType::U16);
    }

    #[test]
    fn failed_allocation_leaves_handle_empty() {
        let pool = BufferPool::new(nz!(16), nz!(2)).unwrap();
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::U8, 4, 4, 2, Some(&pool)).unwrap();

        let result = volume.allocate(ElementType::U8, 4, 4, 3, Some(&pool));

        assert!(matches!(result, Err(Error::PoolExhausted { .. })));
        assert!(!volume.is_allocated());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn stack_errors_propagate_unchanged() {
        let mut volume = VolumeHandle::new();

        assert!(matches!(
            volume.allocate(ElementType::U8, 2, 2, 0, None),
            Err(Error::InvalidDimensions { depth: 0, .. })
        ));

        let pool = BufferPool::new(nz!(4), nz!(1)).unwrap();
        assert!(matches!(
            volume.allocate(ElementType::U64, 2, 2, 1, Some(&pool)),
            Err(Error::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn clear_releases_volume() {
        let pool = BufferPool::new(nz!(4), nz!(2)).unwrap();
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::I8, 2, 2, 2, Some(&pool)).unwrap();

        volume.clear();

        assert!(!volume.is_allocated());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn wraps_borrowing_stack_without_owning_slices() {
        let pool = BufferPool::new(nz!(8), nz!(2)).unwrap();
        let mut first = Grid2D::<u16>::from_pool(2, 2, &pool).unwrap();
        let mut second = Grid2D::<u16>::from_pool(2, 2, &pool).unwrap();

        {
            let mut stack = SliceStack::borrowing(2, 2, 2).unwrap();
            stack.bind_slice(0, &mut first).unwrap();
            stack.bind_slice(1, &mut second).unwrap();

            let mut volume = VolumeHandle::from(stack);
            assert_eq!(
                volume.data().unwrap().policy(),
                OwnershipPolicy::BorrowsSlices
            );

            volume
                .as_stack_mut::<u16>()
                .unwrap()
                .slice_mut(0)
                .unwrap()
                .set(1, 0, 11)
                .unwrap();
        }

        assert_eq!(pool.in_use(), 2);
        assert_eq!(first.get(1, 0).unwrap(), 11);
    }

    #[test]
    fn data_allows_matching_on_element_type() {
        let mut volume = VolumeHandle::new();
        volume.allocate(ElementType::I16, 2, 2, 2, None).unwrap();

        if let Some(VolumeData::I16(stack)) = volume.data_mut() {
            stack.slice_mut(0).unwrap().set(0, 0, -3).unwrap();
        } else {
            panic!("expected an i16 volume");
        }

        assert_eq!(
            volume.as_stack::<i16>().unwrap().slice(0).unwrap().get(0, 0).unwrap(),
            -3
        );
    }
}
