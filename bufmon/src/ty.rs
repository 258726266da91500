//! Module with type layout helpers
//!
//! Sizes follow natural alignment: struct fields are placed at offsets aligned to
//! their own alignment and the struct size is rounded up to its largest alignment.

/// Size of a pointer on the instrumented target, in bytes.
pub const POINTER_SIZE: u64 = 8;

/// Types as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Integer with the given bit width
    Int(u32),
    /// Floating point with the given bit width
    Float(u32),
    Ptr,
    Array(Box<Type>, u64),
    Struct(Vec<Type>),
    /// Struct whose body is not visible in this module
    OpaqueStruct,
    Void,
}

impl Type {
    pub fn array(element: Type, len: u64) -> Self {
        Type::Array(Box::new(element), len)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(..))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_) | Type::OpaqueStruct)
    }

    /// Size of the type in bytes, `None` if it has no size.
    pub fn size(&self) -> Option<u64> {
        match self {
            Type::Int(bits) | Type::Float(bits) => Some(u64::from(bits.div_ceil(8))),
            Type::Ptr => Some(POINTER_SIZE),
            Type::Array(element, len) => element.stride()?.checked_mul(*len),
            Type::Struct(fields) => {
                let mut offset = 0u64;
                for field in fields {
                    offset = align_to(offset, field.alignment()?)?.checked_add(field.size()?)?;
                }
                align_to(offset, self.alignment()?)
            }
            Type::OpaqueStruct | Type::Void => None,
        }
    }

    /// Alignment of the type in bytes (always a power of two).
    pub fn alignment(&self) -> Option<u64> {
        match self {
            Type::Int(_) | Type::Float(_) | Type::Ptr => {
                let size = self.size()?;
                Some(size.next_power_of_two().min(16))
            }
            Type::Array(element, _) => element.alignment(),
            Type::Struct(fields) => fields
                .iter()
                .try_fold(1u64, |align, field| Some(align.max(field.alignment()?))),
            Type::OpaqueStruct | Type::Void => None,
        }
    }

    /// Distance between consecutive elements of this type in an array.
    fn stride(&self) -> Option<u64> {
        align_to(self.size()?, self.alignment()?)
    }
}

/// Rounds `offset` up to `alignment`, which must be a power of two.
///
/// `None` if the result does not fit in a `u64`.
fn align_to(offset: u64, alignment: u64) -> Option<u64> {
    Some(offset.checked_add(alignment - 1)? & !(alignment - 1))
}
