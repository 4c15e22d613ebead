use std::fmt;
use std::str::FromStr;

use crate::{Error, SliceStack, VolumeData};

/// A fixed-size scalar that can be stored in a [`Grid2D`][crate::Grid2D].
///
/// Grids reinterpret the bytes of their backing [`Block`][crate::Block] as a slice of
/// elements, so an element type must be plain data: every bit pattern (including all zeros)
/// must be a valid value and the type must not contain padding.
///
/// The crate implements this trait for all primitive integer and floating point types.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// 1. Every bit pattern of `size_of::<Self>()` bytes is a valid value of `Self`.
/// 2. `Self` has no padding bytes and no interior mutability.
/// 3. `Self` is not zero-sized and its alignment is at most [`BLOCK_ALIGNMENT`][crate::BLOCK_ALIGNMENT].
pub unsafe trait Element: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {}

mod sealed {
    pub trait Sealed {}
}

/// An [`Element`] that a type-erased [`VolumeHandle`][crate::VolumeHandle] can hold.
///
/// The set of volume element types is closed: it is exactly the set of [`ElementType`]
/// variants. This trait connects each variant to its Rust type so that typed accessors
/// such as [`VolumeHandle::as_stack()`][crate::VolumeHandle::as_stack] can project the
/// matching [`SliceStack`] out of a [`VolumeData`].
pub trait VolumeElement: Element + sealed::Sealed {
    /// The runtime tag for this element type.
    const ELEMENT_TYPE: ElementType;

    /// Returns the stack held by `data` if it holds elements of this type.
    fn stack_ref<'s, 'a>(data: &'s VolumeData<'a>) -> Option<&'s SliceStack<'a, Self>>;

    /// Returns the stack held by `data` if it holds elements of this type.
    fn stack_mut<'s, 'a>(data: &'s mut VolumeData<'a>) -> Option<&'s mut SliceStack<'a, Self>>;

    /// Wraps a stack of this element type into the type-erased volume data.
    fn into_data(stack: SliceStack<'_, Self>) -> VolumeData<'_>;
}

/// Runtime tag identifying the element type of a volume.
///
/// Collaborators that read scan files or network messages usually learn the element type
/// from the data itself, as a name or numeric code. Both can be parsed into an
/// [`ElementType`], failing with [`Error::UnsupportedElementType`] for unknown tags.
///
/// # Example
///
/// ```
/// use volume_store::ElementType;
///
/// let element_type: ElementType = "uint16".parse().unwrap();
/// assert_eq!(element_type, ElementType::U16);
/// assert_eq!(element_type.size_bytes(), 2);
///
/// assert!("complex64".parse::<ElementType>().is_err());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ElementType {
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer. The most common detector output format.
    U16,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit IEEE 754 floating point.
    F32,
    /// 64-bit IEEE 754 floating point.
    F64,
}

impl ElementType {
    /// Every supported element type, ordered by numeric [`code()`](Self::code).
    pub const ALL: [Self; 10] = [
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::F32,
        Self::F64,
    ];

    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Canonical name of the element type, matching the Rust type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Stable numeric code of the element type, for compact headers.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U32 => 2,
            Self::U64 => 3,
            Self::I8 => 4,
            Self::I16 => 5,
            Self::I32 => 6,
            Self::I64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = Error;

    /// Accepts the canonical names (`u16`) as well as the long forms common in scan file
    /// headers (`uint16`, `int16`, `float32`). Matching is case-insensitive.
    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let element_type = match tag.trim().to_ascii_lowercase().as_str() {
            "u8" | "uint8" | "byte" => Self::U8,
            "u16" | "uint16" => Self::U16,
            "u32" | "uint32" => Self::U32,
            "u64" | "uint64" => Self::U64,
            "i8" | "int8" => Self::I8,
            "i16" | "int16" => Self::I16,
            "i32" | "int32" => Self::I32,
            "i64" | "int64" => Self::I64,
            "f32" | "float32" | "float" => Self::F32,
            "f64" | "float64" | "double" => Self::F64,
            _ => {
                return Err(Error::UnsupportedElementType {
                    tag: tag.to_owned(),
                });
            }
        };

        Ok(element_type)
    }
}

impl TryFrom<u8> for ElementType {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|element_type| element_type.code() == code)
            .ok_or_else(|| Error::UnsupportedElementType {
                tag: code.to_string(),
            })
    }
}

macro_rules! volume_elements {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            // SAFETY: Primitive numeric types are valid for every bit pattern, have no padding,
            // are not zero-sized and are aligned to at most 8 bytes.
            unsafe impl Element for $ty {}

            impl sealed::Sealed for $ty {}

            impl VolumeElement for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$variant;

                fn stack_ref<'s, 'a>(data: &'s VolumeData<'a>) -> Option<&'s SliceStack<'a, Self>> {
                    match data {
                        VolumeData::$variant(stack) => Some(stack),
                        _ => None,
                    }
                }

                fn stack_mut<'s, 'a>(
                    data: &'s mut VolumeData<'a>,
                ) -> Option<&'s mut SliceStack<'a, Self>> {
                    match data {
                        VolumeData::$variant(stack) => Some(stack),
                        _ => None,
                    }
                }

                fn into_data(stack: SliceStack<'_, Self>) -> VolumeData<'_> {
                    VolumeData::$variant(stack)
                }
            }
        )*
    };
}

volume_elements! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn size_matches_rust_type() {
        fn size_of_tag<T: VolumeElement>() -> (usize, usize) {
            (T::ELEMENT_TYPE.size_bytes(), size_of::<T>())
        }

        for (tag_size, type_size) in [
            size_of_tag::<u8>(),
            size_of_tag::<u16>(),
            size_of_tag::<u32>(),
            size_of_tag::<u64>(),
            size_of_tag::<i8>(),
            size_of_tag::<i16>(),
            size_of_tag::<i32>(),
            size_of_tag::<i64>(),
            size_of_tag::<f32>(),
            size_of_tag::<f64>(),
        ] {
            assert_eq!(tag_size, type_size);
        }
    }

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("u16".parse::<ElementType>().unwrap(), ElementType::U16);
        assert_eq!("UINT16".parse::<ElementType>().unwrap(), ElementType::U16);
        assert_eq!(" float ".parse::<ElementType>().unwrap(), ElementType::F32);
        assert_eq!("double".parse::<ElementType>().unwrap(), ElementType::F64);
    }

    #[test]
    fn unknown_name_is_unsupported() {
        let error = "rgb24".parse::<ElementType>().unwrap_err();
        assert!(matches!(error, Error::UnsupportedElementType { tag } if tag == "rgb24"));
    }

    #[test]
    fn codes_round_trip_through_try_from() {
        for element_type in ElementType::ALL {
            assert_eq!(ElementType::try_from(element_type.code()).unwrap(), element_type);
        }

        assert!(matches!(
            ElementType::try_from(200),
            Err(Error::UnsupportedElementType { .. })
        ));
    }

    #[test]
    fn display_uses_canonical_name() {
        for element_type in ElementType::ALL {
            assert_eq!(element_type.to_string(), element_type.name());
            assert_eq!(
                element_type.name().parse::<ElementType>().unwrap(),
                element_type
            );
        }
    }
}
