use std::any::type_name;
use std::marker::PhantomData;
use std::num::NonZero;
use std::{fmt, slice};

use crate::{BLOCK_ALIGNMENT, Block, BlockKind, BufferPool, Element, Error, Result};

/// A dense `width` x `height` plane of elements, such as one 2D projection image or one slice
/// of a 3D volume.
///
/// Elements are stored row-major in a single [`Block`], contiguous and without padding between
/// rows, so the raw views returned by [`as_slice()`](Self::as_slice) and
/// [`as_bytes()`](Self::as_bytes) can be filled or transmitted in bulk.
///
/// The grid owns its block. Whether dropping the grid frees the memory or returns it to a
/// [`BufferPool`] is decided by the block's [`BlockKind`] when the grid is created and cannot
/// change afterwards.
///
/// # Example
///
/// ```
/// use volume_store::Grid2D;
///
/// let mut grid = Grid2D::<u16>::new(4, 3).unwrap();
///
/// assert_eq!(grid.get(2, 1).unwrap(), 0);
/// grid.set(2, 1, 1000).unwrap();
/// assert_eq!(grid.get(2, 1).unwrap(), 1000);
///
/// // Row-major: (x, y) lives at y * width + x.
/// assert_eq!(grid.as_slice()[1 * 4 + 2], 1000);
///
/// assert!(grid.get(4, 0).is_err());
/// ```
pub struct Grid2D<T: Element> {
    width: usize,
    height: usize,
    block: Block,
    _element: PhantomData<T>,
}

impl<T: Element> Grid2D<T> {
    /// Creates a zero-initialized grid backed by a directly allocated block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] if `width` or `height` is zero or the grid would be
    /// too large to address, and [`Error::AllocationFailure`] if the memory cannot be allocated.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        let bytes = required_bytes::<T>(width, height)?;
        let block = Block::direct(bytes)?;

        Self::with_block(width, height, block)
    }

    /// Creates a zero-initialized grid backed by a block acquired from `pool`.
    ///
    /// # Errors
    ///
    /// In addition to the errors of [`new()`](Self::new), returns the errors of
    /// [`BufferPool::acquire()`].
    pub fn from_pool(width: usize, height: usize, pool: &BufferPool) -> Result<Self> {
        let bytes = required_bytes::<T>(width, height)?;
        let block = pool.acquire(bytes.get())?;

        Self::with_block(width, height, block)
    }

    /// Creates a grid over a caller-supplied block without modifying its contents.
    ///
    /// This is how a reader that has already decoded pixel data into a block hands that data
    /// over without copying it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimensions`] for zero or oversized dimensions and
    /// [`Error::BufferTooSmall`] if the block is shorter than the grid's element data.
    pub fn with_block(width: usize, height: usize, block: Block) -> Result<Self> {
        const {
            assert!(size_of::<T>() > 0, "grid elements must not be zero-sized");
            assert!(
                align_of::<T>() <= BLOCK_ALIGNMENT,
                "grid elements must not be aligned stricter than blocks"
            );
        }

        let bytes = required_bytes::<T>(width, height)?;

        if block.len() < bytes.get() {
            return Err(Error::BufferTooSmall {
                required: bytes.get(),
                available: block.len(),
            });
        }

        Ok(Self {
            width,
            height,
            block,
            _element: PhantomData,
        })
    }

    /// Width of the grid in elements.
    #[must_use]
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height of the grid in elements.
    #[must_use]
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of elements in the grid.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        // Cannot overflow: checked when the grid was created.
        self.width.wrapping_mul(self.height)
    }

    /// Always `false`, as grids have non-zero dimensions.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes occupied by the grid's elements.
    ///
    /// This may be less than the length of the backing block.
    #[must_use]
    #[inline]
    pub fn len_bytes(&self) -> usize {
        // Cannot overflow: checked when the grid was created.
        self.len().wrapping_mul(size_of::<T>())
    }

    /// Whether the backing block returns to a pool or is freed when the grid is dropped.
    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.block.kind()
    }

    /// Reads the element at column `x` of row `y`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `x >= width()` or `y >= height()`.
    pub fn get(&self, x: usize, y: usize) -> Result<T> {
        let offset = self.offset(x, y)?;

        Ok(*self
            .as_slice()
            .get(offset)
            .expect("offset is within bounds after the coordinate check"))
    }

    /// Overwrites the element at column `x` of row `y`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `x >= width()` or `y >= height()`.
    pub fn set(&mut self, x: usize, y: usize, value: T) -> Result<()> {
        let offset = self.offset(x, y)?;

        *self
            .as_mut_slice()
            .get_mut(offset)
            .expect("offset is within bounds after the coordinate check") = value;

        Ok(())
    }

    /// The elements of row `y`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `y >= height()`.
    pub fn row(&self, y: usize) -> Result<&[T]> {
        let start = self.offset(0, y)?;

        Ok(self
            .as_slice()
            .get(start..start.wrapping_add(self.width))
            .expect("row is within bounds after the coordinate check"))
    }

    /// The elements of row `y`, for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `y >= height()`.
    pub fn row_mut(&mut self, y: usize) -> Result<&mut [T]> {
        let start = self.offset(0, y)?;
        let width = self.width;

        Ok(self
            .as_mut_slice()
            .get_mut(start..start.wrapping_add(width))
            .expect("row is within bounds after the coordinate check"))
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }

    /// Overwrites every element with the elements of `source`, in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LengthMismatch`] if `source` does not have exactly
    /// [`len()`](Self::len) elements.
    pub fn copy_from_slice(&mut self, source: &[T]) -> Result<()> {
        if source.len() != self.len() {
            return Err(Error::LengthMismatch {
                expected: self.len(),
                actual: source.len(),
            });
        }

        self.as_mut_slice().copy_from_slice(source);
        Ok(())
    }

    /// All elements of the grid in row-major order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The block is aligned to BLOCK_ALIGNMENT, which is at least the alignment of
        // T, and holds at least len() * size_of::<T>() initialized bytes (checked in
        // with_block). Element guarantees any bit pattern is a valid T.
        unsafe { slice::from_raw_parts(self.block.as_ptr().as_ptr().cast::<T>(), self.len()) }
    }

    /// All elements of the grid in row-major order, for writing.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: As in as_slice(), and the exclusive borrow of self guarantees exclusive
        // access to the block memory.
        unsafe {
            slice::from_raw_parts_mut(self.block.as_ptr().as_ptr().cast::<T>(), self.len())
        }
    }

    /// The grid's element data as bytes in native byte order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.block
            .as_bytes()
            .get(..self.len_bytes())
            .expect("block holds at least len_bytes() bytes")
    }

    /// The grid's element data as bytes in native byte order, for writing.
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len_bytes = self.len_bytes();

        self.block
            .as_bytes_mut()
            .get_mut(..len_bytes)
            .expect("block holds at least len_bytes() bytes")
    }

    /// Dismantles the grid, handing back its block without releasing it.
    #[must_use]
    pub fn into_block(self) -> Block {
        self.block
    }

    fn offset(&self, x: usize, y: usize) -> Result<usize> {
        if x >= self.width {
            return Err(Error::OutOfRange {
                axis: "column",
                index: x,
                bound: self.width,
            });
        }

        if y >= self.height {
            return Err(Error::OutOfRange {
                axis: "row",
                index: y,
                bound: self.height,
            });
        }

        // Cannot overflow: both coordinates are within bounds and width * height fits usize.
        Ok(y.wrapping_mul(self.width).wrapping_add(x))
    }
}

/// Number of bytes needed by a `width` x `height` grid of `T`.
pub(crate) fn required_bytes<T: Element>(width: usize, height: usize) -> Result<NonZero<usize>> {
    let invalid = |problem| Error::InvalidDimensions {
        width,
        height,
        depth: 1,
        problem,
    };

    if width == 0 || height == 0 {
        return Err(invalid("width and height must be non-zero"));
    }

    let bytes = width
        .checked_mul(height)
        .and_then(|elements| elements.checked_mul(size_of::<T>()))
        .ok_or_else(|| invalid("grid size exceeds size of virtual memory"))?;

    NonZero::new(bytes).ok_or_else(|| invalid("grid elements must not be zero-sized"))
}

impl<T: Element> fmt::Debug for Grid2D<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("block", &self.block)
            .finish()
    }
}
