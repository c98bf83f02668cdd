//! Variant wire form.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::DecodeError;

/// Tag values of the variant wire form.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector2i = 6,
    Vector3 = 7,
    Transform2D = 8,
    Color = 9,
    Object = 10,
    Array = 11,
    PackedByteArray = 12,
    PackedInt32Array = 13,
    PackedInt64Array = 14,
    PackedFloat32Array = 15,
    PackedFloat64Array = 16,
    PackedStringArray = 17,
}

impl VariantType {
    pub fn name(self) -> &'static str {
        match self {
            VariantType::Nil => "Nil",
            VariantType::Bool => "bool",
            VariantType::Int => "int",
            VariantType::Float => "float",
            VariantType::String => "String",
            VariantType::Vector2 => "Vector2",
            VariantType::Vector2i => "Vector2i",
            VariantType::Vector3 => "Vector3",
            VariantType::Transform2D => "Transform2D",
            VariantType::Color => "Color",
            VariantType::Object => "Object",
            VariantType::Array => "Array",
            VariantType::PackedByteArray => "PackedByteArray",
            VariantType::PackedInt32Array => "PackedInt32Array",
            VariantType::PackedInt64Array => "PackedInt64Array",
            VariantType::PackedFloat32Array => "PackedFloat32Array",
            VariantType::PackedFloat64Array => "PackedFloat64Array",
            VariantType::PackedStringArray => "PackedStringArray",
        }
    }
}

/// Layout of an engine buffer created with `buffer_new`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum BufferKind {
    /// UTF-8 bytes.
    String = 0,
    Bytes = 1,
    /// Little-endian `i32` elements.
    Int32 = 2,
    /// Little-endian `i64` elements.
    Int64 = 3,
    /// Little-endian `f32` elements.
    Float32 = 4,
    /// Little-endian `f64` elements.
    Float64 = 5,
    /// Strings, each prefixed with its little-endian `u32` byte length.
    StringList = 6,
    /// Six little-endian `f32` components.
    Transform2D = 7,
}

bitflags! {
    /// Second payload word of an object variant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u64 {
        /// The object is released through reference counting.
        const REF_COUNTED = 1 << 0;
    }
}

/// A variant as it crosses the ABI: a tag word and two payload words.
///
/// Payloads wider than two words, and every variable-length payload, live in
/// engine buffers referenced from the first payload word.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VariantBits {
    pub tag: u64,
    pub payload: [u64; 2],
}

impl VariantBits {
    /// Call frame words taken by one variant.
    pub const WORDS: usize = 3;

    pub const NIL: VariantBits = VariantBits {
        tag: VariantType::Nil as u64,
        payload: [0, 0],
    };

    pub fn new(ty: VariantType, payload: [u64; 2]) -> Self {
        Self {
            tag: ty as u64,
            payload,
        }
    }

    pub fn variant_type(&self) -> Result<VariantType, DecodeError> {
        VariantType::try_from(self.tag).map_err(|_| DecodeError::UnknownTag(self.tag))
    }

    pub fn to_words(&self) -> [u64; Self::WORDS] {
        [self.tag, self.payload[0], self.payload[1]]
    }

    /// Read a variant from the first three words of `words`.
    pub fn from_words(words: &[u64]) -> Option<Self> {
        match words {
            [tag, a, b, ..] => Some(Self {
                tag: *tag,
                payload: [*a, *b],
            }),
            _ => None,
        }
    }
}
