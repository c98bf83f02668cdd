//! Encoding and decoding between [`Variant`] and [`VariantBits`].
//!
//! Strings, packed arrays, arrays and transforms are never inlined: encoding
//! allocates an engine buffer through the handle registry and stores its
//! pointer in the first payload word. The buffer is a [`Transient`] owned by
//! the [`EncodedVariant`], so it is released when the encoded value goes out
//! of scope unless it is handed to the host with
//! [`EncodedVariant::into_host`].
//!
//! Decoding copies engine data out and never takes over storage it was handed;
//! object payloads re-enter the registry instead of fabricating handles.

use super::{
    BufferKind, ObjectFlags, Variant, VariantBits, VariantType, pack_f32s, pack_pair,
    unpack_f32s, unpack_pair,
};
use super::{Color, Transform2D, Vector2, Vector2i, Vector3};
use crate::error::{DecodeError, HandleResult};
use crate::handle::{HandleKind, HandleRegistry, ObjectRef, Transient};
use crate::{RawPtr, handle::Handle};

/// Variant bits plus the engine storage they point into.
#[derive(Debug)]
pub struct EncodedVariant {
    bits: VariantBits,
    storage: Option<Transient>,
    /// Set when the payload is a ref-counted object the variant only borrows.
    shared_object: Option<RawPtr>,
}

impl EncodedVariant {
    fn inline(bits: VariantBits) -> Self {
        Self {
            bits,
            storage: None,
            shared_object: None,
        }
    }

    fn stored(ty: VariantType, storage: Transient) -> Self {
        Self {
            bits: VariantBits::new(ty, [storage.raw().to_word(), 0]),
            storage: Some(storage),
            shared_object: None,
        }
    }

    pub fn bits(&self) -> &VariantBits {
        &self.bits
    }

    /// Split into the bits and the buffer keeping them valid.
    pub(crate) fn into_parts(self) -> (VariantBits, Option<Transient>) {
        (self.bits, self.storage)
    }

    /// Give the host ownership of the encoded value.
    ///
    /// The buffer reference moves to the host, and a ref-counted object
    /// payload gets a reference of its own.
    pub fn into_host(self, registry: &HandleRegistry) -> HandleResult<VariantBits> {
        if let Some(storage) = self.storage {
            storage.into_raw()?;
        }
        if let Some(object) = self.shared_object {
            registry.host().ref_increment(object);
        }
        Ok(self.bits)
    }
}

// ============================================================================
// Encode
// ============================================================================

fn le_bytes<T: Copy, const N: usize>(items: &[T], to_le: impl Fn(T) -> [u8; N]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * N);
    for item in items {
        out.extend_from_slice(&to_le(*item));
    }
    out
}

/// Encode a variant, allocating engine storage where the payload needs it.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn encode(registry: &HandleRegistry, value: &Variant) -> HandleResult<EncodedVariant> {
    let ty = value.variant_type();
    let encoded = match value {
        Variant::Nil => EncodedVariant::inline(VariantBits::NIL),
        Variant::Bool(b) => EncodedVariant::inline(VariantBits::new(ty, [*b as u64, 0])),
        Variant::Int(i) => EncodedVariant::inline(VariantBits::new(ty, [*i as u64, 0])),
        Variant::Float(f) => EncodedVariant::inline(VariantBits::new(ty, [f.to_bits(), 0])),
        Variant::Vector2(v) => EncodedVariant::inline(VariantBits::new(ty, [pack_f32s(v.x, v.y), 0])),
        Variant::Vector2i(v) => {
            EncodedVariant::inline(VariantBits::new(ty, [pack_pair(v.x as u32, v.y as u32), 0]))
        }
        Variant::Vector3(v) => EncodedVariant::inline(VariantBits::new(
            ty,
            [pack_f32s(v.x, v.y), pack_f32s(v.z, 0.0)],
        )),
        Variant::Color(c) => EncodedVariant::inline(VariantBits::new(
            ty,
            [pack_f32s(c.r, c.g), pack_f32s(c.b, c.a)],
        )),
        Variant::Object(object) => {
            let mut flags = ObjectFlags::empty();
            if object.is_ref_counted() {
                flags |= ObjectFlags::REF_COUNTED;
            }
            EncodedVariant {
                bits: VariantBits::new(ty, [object.raw().to_word(), flags.bits()]),
                storage: None,
                shared_object: object.is_ref_counted().then(|| object.raw()),
            }
        }
        Variant::String(s) => {
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::String, s.as_bytes())?)
        }
        Variant::Transform2D(t) => {
            let bytes = le_bytes(&t.to_array(), f32::to_le_bytes);
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Transform2D, &bytes)?)
        }
        Variant::Array(items) => {
            let array = registry.new_array()?;
            for item in items {
                // The array takes its own references; the element's storage
                // is released when `element` drops.
                let element = encode(registry, item)?;
                registry.host().array_push(array.raw(), element.bits());
            }
            EncodedVariant::stored(ty, array)
        }
        Variant::PackedByteArray(bytes) => {
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Bytes, bytes)?)
        }
        Variant::PackedInt32Array(items) => {
            let bytes = le_bytes(items, i32::to_le_bytes);
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Int32, &bytes)?)
        }
        Variant::PackedInt64Array(items) => {
            let bytes = le_bytes(items, i64::to_le_bytes);
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Int64, &bytes)?)
        }
        Variant::PackedFloat32Array(items) => {
            let bytes = le_bytes(items, f32::to_le_bytes);
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Float32, &bytes)?)
        }
        Variant::PackedFloat64Array(items) => {
            let bytes = le_bytes(items, f64::to_le_bytes);
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::Float64, &bytes)?)
        }
        Variant::PackedStringArray(items) => {
            let mut bytes = Vec::new();
            for s in items {
                bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
                bytes.extend_from_slice(s.as_bytes());
            }
            EncodedVariant::stored(ty, registry.new_buffer(BufferKind::StringList, &bytes)?)
        }
    };
    Ok(encoded)
}

// ============================================================================
// Decode
// ============================================================================

fn storage(
    registry: &HandleRegistry,
    ty: VariantType,
    bits: &VariantBits,
) -> Result<RawPtr, DecodeError> {
    let raw = RawPtr::from_word(bits.payload[0]);
    if raw.is_null() {
        return Err(DecodeError::malformed(ty.name(), "null storage pointer"));
    }
    Ok(registry.borrowed(raw, HandleKind::Transient)?.raw())
}

fn read_bytes(
    registry: &HandleRegistry,
    ty: VariantType,
    bits: &VariantBits,
) -> Result<Vec<u8>, DecodeError> {
    let raw = storage(registry, ty, bits)?;
    Ok(registry.host().buffer_read(raw))
}

fn from_le<T, const N: usize>(
    ty: VariantType,
    bytes: &[u8],
    from_le: impl Fn([u8; N]) -> T,
) -> Result<Vec<T>, DecodeError> {
    if bytes.len() % N != 0 {
        return Err(DecodeError::malformed(
            ty.name(),
            format!("{} bytes is not a multiple of {N}", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut array = [0u8; N];
            array.copy_from_slice(chunk);
            from_le(array)
        })
        .collect())
}

fn utf8(ty: VariantType, bytes: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(bytes).map_err(|_| DecodeError::malformed(ty.name(), "invalid UTF-8"))
}

fn string_list(ty: VariantType, bytes: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let Some((len, tail)) = rest.split_first_chunk::<4>() else {
            return Err(DecodeError::malformed(ty.name(), "truncated length prefix"));
        };
        let len = u32::from_le_bytes(*len) as usize;
        if tail.len() < len {
            return Err(DecodeError::malformed(ty.name(), "truncated string"));
        }
        let (s, tail) = tail.split_at(len);
        out.push(utf8(ty, s.to_vec())?);
        rest = tail;
    }
    Ok(out)
}

fn decode_elements(
    registry: &HandleRegistry,
    array: RawPtr,
    enclosing: &mut Vec<usize>,
) -> Result<Vec<Variant>, DecodeError> {
    let len = registry.host().buffer_len(array);
    let mut items = Vec::with_capacity(len);
    for index in 0..len {
        let element = registry.host().array_get(array, index).map_err(|status| {
            DecodeError::malformed(VariantType::Array.name(), format!("element {index}: {status:?}"))
        })?;
        items.push(decode_nested(registry, &element, enclosing)?);
    }
    Ok(items)
}

/// Arrays nested deeper than this are refused.
pub const MAX_ARRAY_DEPTH: usize = 64;

/// Decode wire bits into an owned Rust value.
///
/// `bits` stays owned by whoever handed it over. Ref-counted objects get a
/// fresh extension reference; other objects are borrowed.
///
/// Host arrays may contain themselves. An array that appears inside itself,
/// or nesting past [`MAX_ARRAY_DEPTH`], is reported as malformed.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn decode(registry: &HandleRegistry, bits: &VariantBits) -> Result<Variant, DecodeError> {
    decode_nested(registry, bits, &mut Vec::new())
}

/// `enclosing` holds the addresses of the arrays being decoded around `bits`.
fn decode_nested(
    registry: &HandleRegistry,
    bits: &VariantBits,
    enclosing: &mut Vec<usize>,
) -> Result<Variant, DecodeError> {
    let ty = bits.variant_type()?;
    let [a, b] = bits.payload;
    let value = match ty {
        VariantType::Nil => Variant::Nil,
        VariantType::Bool => Variant::Bool(a != 0),
        VariantType::Int => Variant::Int(a as i64),
        VariantType::Float => Variant::Float(f64::from_bits(a)),
        VariantType::Vector2 => {
            let (x, y) = unpack_f32s(a);
            Variant::Vector2(Vector2::new(x, y))
        }
        VariantType::Vector2i => {
            let (x, y) = unpack_pair(a);
            Variant::Vector2i(Vector2i::new(x as i32, y as i32))
        }
        VariantType::Vector3 => {
            let (x, y) = unpack_f32s(a);
            let (z, _) = unpack_f32s(b);
            Variant::Vector3(Vector3::new(x, y, z))
        }
        VariantType::Color => {
            let (r, g) = unpack_f32s(a);
            let (bl, al) = unpack_f32s(b);
            Variant::Color(Color::rgba(r, g, bl, al))
        }
        VariantType::Object => {
            let raw = RawPtr::from_word(a);
            if raw.is_null() {
                return Ok(Variant::Nil);
            }
            let flags = ObjectFlags::from_bits_truncate(b);
            let object = if flags.contains(ObjectFlags::REF_COUNTED) {
                match registry.acquire(raw, HandleKind::RefCounted)? {
                    Handle::Shared(shared) => ObjectRef::Shared(shared),
                    other => ObjectRef::Borrowed(other.as_borrowed()),
                }
            } else {
                ObjectRef::Borrowed(registry.borrowed(raw, HandleKind::Manual)?)
            };
            Variant::Object(object)
        }
        VariantType::String => Variant::String(utf8(ty, read_bytes(registry, ty, bits)?)?),
        VariantType::Transform2D => {
            let floats = from_le(ty, &read_bytes(registry, ty, bits)?, f32::from_le_bytes)?;
            let components: [f32; 6] = floats
                .try_into()
                .map_err(|_| DecodeError::malformed(ty.name(), "expected 6 components"))?;
            Variant::Transform2D(Transform2D::from_array(components))
        }
        VariantType::Array => {
            let array = storage(registry, ty, bits)?;
            if enclosing.contains(&array.addr()) {
                return Err(DecodeError::malformed(ty.name(), "array contains itself"));
            }
            if enclosing.len() >= MAX_ARRAY_DEPTH {
                return Err(DecodeError::malformed(
                    ty.name(),
                    format!("nested deeper than {MAX_ARRAY_DEPTH} arrays"),
                ));
            }

            enclosing.push(array.addr());
            let items = decode_elements(registry, array, enclosing);
            enclosing.pop();
            Variant::Array(items?)
        }
        VariantType::PackedByteArray => Variant::PackedByteArray(read_bytes(registry, ty, bits)?),
        VariantType::PackedInt32Array => Variant::PackedInt32Array(from_le(
            ty,
            &read_bytes(registry, ty, bits)?,
            i32::from_le_bytes,
        )?),
        VariantType::PackedInt64Array => Variant::PackedInt64Array(from_le(
            ty,
            &read_bytes(registry, ty, bits)?,
            i64::from_le_bytes,
        )?),
        VariantType::PackedFloat32Array => Variant::PackedFloat32Array(from_le(
            ty,
            &read_bytes(registry, ty, bits)?,
            f32::from_le_bytes,
        )?),
        VariantType::PackedFloat64Array => Variant::PackedFloat64Array(from_le(
            ty,
            &read_bytes(registry, ty, bits)?,
            f64::from_le_bytes,
        )?),
        VariantType::PackedStringArray => {
            Variant::PackedStringArray(string_list(ty, &read_bytes(registry, ty, bits)?)?)
        }
    };
    Ok(value)
}

/// Release bits the host handed over as caller-owned (return values).
pub fn release_bits(registry: &HandleRegistry, bits: VariantBits) -> Result<(), DecodeError> {
    let ty = bits.variant_type()?;
    let raw = RawPtr::from_word(bits.payload[0]);
    if raw.is_null() {
        return Ok(());
    }
    match ty {
        VariantType::String
        | VariantType::Transform2D
        | VariantType::Array
        | VariantType::PackedByteArray
        | VariantType::PackedInt32Array
        | VariantType::PackedInt64Array
        | VariantType::PackedFloat32Array
        | VariantType::PackedFloat64Array
        | VariantType::PackedStringArray => {
            registry.adopt(raw, HandleKind::Transient)?.release()?;
        }
        VariantType::Object
            if ObjectFlags::from_bits_truncate(bits.payload[1]).contains(ObjectFlags::REF_COUNTED) =>
        {
            registry.adopt(raw, HandleKind::RefCounted)?.release()?;
        }
        _ => {}
    }
    Ok(())
}
