//! Typed access to [`Variant`] values.
//!
//! - [`FromVariant`]: extract a Rust value, failing with
//!   [`ConversionError::TypeMismatch`] when the variant holds another type
//! - [`ToVariant`]: wrap a Rust value
//!
//! Integers narrower than `i64` are range checked. Ints and floats never
//! convert into each other.

use super::{Color, Transform2D, Variant, Vector2, Vector2i, Vector3};
use crate::ConversionError;
use crate::handle::{Borrowed, ObjectRef, Shared};

/// Extract a value from a variant.
pub trait FromVariant: Sized {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError>;
}

/// Convert a value into a variant.
pub trait ToVariant {
    fn to_variant(&self) -> Variant;
}

fn mismatch(expected: &'static str, value: &Variant) -> ConversionError {
    ConversionError::TypeMismatch {
        expected,
        actual: value.type_name(),
    }
}

impl FromVariant for Variant {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

impl ToVariant for Variant {
    fn to_variant(&self) -> Variant {
        self.clone()
    }
}

impl FromVariant for () {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match value {
            Variant::Nil => Ok(()),
            other => Err(mismatch("Nil", other)),
        }
    }
}

impl ToVariant for () {
    fn to_variant(&self) -> Variant {
        Variant::Nil
    }
}

// ============================================================================
// Integers
// ============================================================================

macro_rules! impl_variant_int {
    ($($ty:ty),*) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
                    match value {
                        Variant::Int(v) => <$ty>::try_from(*v).map_err(|_| {
                            ConversionError::IntegerOverflow {
                                value: *v,
                                target_type: stringify!($ty),
                            }
                        }),
                        other => Err(mismatch("int", other)),
                    }
                }
            }

            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::Int(*self as i64)
                }
            }
        )*
    };
}

impl_variant_int!(i8, i16, i32, u8, u16, u32);

impl FromVariant for i64 {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match value {
            Variant::Int(v) => Ok(*v),
            other => Err(mismatch("int", other)),
        }
    }
}

impl ToVariant for i64 {
    fn to_variant(&self) -> Variant {
        Variant::Int(*self)
    }
}

// ============================================================================
// Scalars and math types
// ============================================================================

macro_rules! impl_variant_plain {
    ($($ty:ty => $variant:ident, $name:literal;)*) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
                    match value {
                        Variant::$variant(v) => Ok(v.clone()),
                        other => Err(mismatch($name, other)),
                    }
                }
            }

            impl ToVariant for $ty {
                fn to_variant(&self) -> Variant {
                    Variant::$variant(self.clone())
                }
            }
        )*
    };
}

impl_variant_plain! {
    bool => Bool, "bool";
    f64 => Float, "float";
    String => String, "String";
    Vector2 => Vector2, "Vector2";
    Vector2i => Vector2i, "Vector2i";
    Vector3 => Vector3, "Vector3";
    Transform2D => Transform2D, "Transform2D";
    Color => Color, "Color";
    Vec<Variant> => Array, "Array";
    Vec<u8> => PackedByteArray, "PackedByteArray";
    Vec<i32> => PackedInt32Array, "PackedInt32Array";
    Vec<i64> => PackedInt64Array, "PackedInt64Array";
    Vec<f32> => PackedFloat32Array, "PackedFloat32Array";
    Vec<f64> => PackedFloat64Array, "PackedFloat64Array";
    Vec<String> => PackedStringArray, "PackedStringArray";
}

impl ToVariant for &str {
    fn to_variant(&self) -> Variant {
        Variant::String((*self).to_string())
    }
}

// ============================================================================
// Objects
// ============================================================================

impl FromVariant for ObjectRef {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match value {
            Variant::Object(obj) => Ok(obj.clone()),
            Variant::Nil => Err(ConversionError::NullObject {
                target_type: "Object",
            }),
            other => Err(mismatch("Object", other)),
        }
    }
}

impl ToVariant for ObjectRef {
    fn to_variant(&self) -> Variant {
        Variant::Object(self.clone())
    }
}

impl FromVariant for Shared {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match ObjectRef::from_variant(value)? {
            ObjectRef::Shared(shared) => Ok(shared),
            ObjectRef::Borrowed(_) => Err(ConversionError::TypeMismatch {
                expected: "RefCounted",
                actual: "Object",
            }),
        }
    }
}

impl ToVariant for Shared {
    fn to_variant(&self) -> Variant {
        Variant::Object(ObjectRef::Shared(self.clone()))
    }
}

impl FromVariant for Borrowed {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match ObjectRef::from_variant(value)? {
            ObjectRef::Shared(shared) => Ok(shared.as_borrowed()),
            ObjectRef::Borrowed(borrowed) => Ok(borrowed),
        }
    }
}

impl ToVariant for Borrowed {
    fn to_variant(&self) -> Variant {
        Variant::Object(ObjectRef::Borrowed(*self))
    }
}

/// `Nil` maps to `None`; a null object decodes as `Nil`, so this is the
/// nullable object type.
impl<T: FromVariant> FromVariant for Option<T> {
    fn from_variant(value: &Variant) -> Result<Self, ConversionError> {
        match value {
            Variant::Nil => Ok(None),
            other => T::from_variant(other).map(Some),
        }
    }
}

impl<T: ToVariant> ToVariant for Option<T> {
    fn to_variant(&self) -> Variant {
        match self {
            Some(v) => v.to_variant(),
            None => Variant::Nil,
        }
    }
}
