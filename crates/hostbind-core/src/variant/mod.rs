//! The engine's dynamic value type.
//!
//! - [`Variant`]: the Rust-side value
//! - [`VariantBits`]: the three-word wire form
//! - [`encode`] / [`decode`]: conversion between the two, going through the
//!   handle registry for engine-owned storage
//! - [`FromVariant`] / [`ToVariant`]: typed access with type-mismatch errors

mod bits;
mod codec;
mod convert;
mod math;

pub use bits::{BufferKind, ObjectFlags, VariantBits, VariantType};
pub use codec::{EncodedVariant, MAX_ARRAY_DEPTH, decode, encode, release_bits};
pub use convert::{FromVariant, ToVariant};
pub use math::{Color, Transform2D, Vector2, Vector2i, Vector3};

pub(crate) use math::{pack_f32s, pack_pair, unpack_f32s, unpack_pair};

use crate::handle::ObjectRef;

/// A dynamically typed engine value.
///
/// Floats compare by bit pattern so that the codec round trip is exact for
/// every value, NaN included.
#[derive(Debug, Clone, Default)]
pub enum Variant {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Vector2(Vector2),
    Vector2i(Vector2i),
    Vector3(Vector3),
    Transform2D(Transform2D),
    Color(Color),
    /// A non-null object; null objects decode as [`Variant::Nil`].
    Object(ObjectRef),
    Array(Vec<Variant>),
    PackedByteArray(Vec<u8>),
    PackedInt32Array(Vec<i32>),
    PackedInt64Array(Vec<i64>),
    PackedFloat32Array(Vec<f32>),
    PackedFloat64Array(Vec<f64>),
    PackedStringArray(Vec<String>),
}

impl Variant {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Variant::Nil => VariantType::Nil,
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int(_) => VariantType::Int,
            Variant::Float(_) => VariantType::Float,
            Variant::String(_) => VariantType::String,
            Variant::Vector2(_) => VariantType::Vector2,
            Variant::Vector2i(_) => VariantType::Vector2i,
            Variant::Vector3(_) => VariantType::Vector3,
            Variant::Transform2D(_) => VariantType::Transform2D,
            Variant::Color(_) => VariantType::Color,
            Variant::Object(_) => VariantType::Object,
            Variant::Array(_) => VariantType::Array,
            Variant::PackedByteArray(_) => VariantType::PackedByteArray,
            Variant::PackedInt32Array(_) => VariantType::PackedInt32Array,
            Variant::PackedInt64Array(_) => VariantType::PackedInt64Array,
            Variant::PackedFloat32Array(_) => VariantType::PackedFloat32Array,
            Variant::PackedFloat64Array(_) => VariantType::PackedFloat64Array,
            Variant::PackedStringArray(_) => VariantType::PackedStringArray,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.variant_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    /// Typed extraction; see [`FromVariant`].
    pub fn try_to<T: FromVariant>(&self) -> Result<T, crate::ConversionError> {
        T::from_variant(self)
    }
}

fn f32s_eq(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Nil, Variant::Nil) => true,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Float(a), Variant::Float(b)) => a.to_bits() == b.to_bits(),
            (Variant::String(a), Variant::String(b)) => a == b,
            (Variant::Vector2(a), Variant::Vector2(b)) => f32s_eq(&[a.x, a.y], &[b.x, b.y]),
            (Variant::Vector2i(a), Variant::Vector2i(b)) => a == b,
            (Variant::Vector3(a), Variant::Vector3(b)) => {
                f32s_eq(&[a.x, a.y, a.z], &[b.x, b.y, b.z])
            }
            (Variant::Transform2D(a), Variant::Transform2D(b)) => {
                f32s_eq(&a.to_array(), &b.to_array())
            }
            (Variant::Color(a), Variant::Color(b)) => {
                f32s_eq(&[a.r, a.g, a.b, a.a], &[b.r, b.g, b.b, b.a])
            }
            (Variant::Object(a), Variant::Object(b)) => {
                a.raw() == b.raw() && a.is_ref_counted() == b.is_ref_counted()
            }
            (Variant::Array(a), Variant::Array(b)) => a == b,
            (Variant::PackedByteArray(a), Variant::PackedByteArray(b)) => a == b,
            (Variant::PackedInt32Array(a), Variant::PackedInt32Array(b)) => a == b,
            (Variant::PackedInt64Array(a), Variant::PackedInt64Array(b)) => a == b,
            (Variant::PackedFloat32Array(a), Variant::PackedFloat32Array(b)) => f32s_eq(a, b),
            (Variant::PackedFloat64Array(a), Variant::PackedFloat64Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Variant::PackedStringArray(a), Variant::PackedStringArray(b)) => a == b,
            _ => false,
        }
    }
}
