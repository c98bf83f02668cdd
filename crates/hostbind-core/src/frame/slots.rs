//! Per-type call frame encoding.
//!
//! Every type that crosses a call frame declares how many 8-byte words it
//! occupies and how it maps onto them:
//!
//! | Rust type                         | Words | Encoding                                  |
//! |-----------------------------------|-------|-------------------------------------------|
//! | `bool`                            | 1     | 0 or 1                                    |
//! | `i8`..`i64`, `u8`..`u64`          | 1     | bit pattern at native width, zero-extended|
//! | `f32`, `f64`                      | 1     | bit pattern at native width               |
//! | [`HostStatus`]                    | 1     | 32-bit status code                        |
//! | `Vector2`, `Vector2i`             | 1     | two 32-bit halves, low first              |
//! | `Vector3`, `Color`                | 2     | 32-bit components in pairs                |
//! | strings, packed arrays, `Transform2D`, `Vec<Variant>` | 1 | engine buffer pointer   |
//! | [`Variant`]                       | 3     | [`VariantBits`]                           |
//! | handles, [`RawPtr`]               | 1     | object pointer                            |
//!
//! No width is ever widened or narrowed on the way through: an `i32`
//! argument is written as a 32-bit pattern and an `f32` return is read back
//! from one.

use crate::error::{CallError, CallResult, ConversionError};
use crate::handle::{Borrowed, Handle, HandleKind, HandleRegistry, ObjectRef, Owned, Shared, Transient};
use crate::variant::{
    BufferKind, Color, Transform2D, Variant, VariantBits, VariantType, Vector2, Vector2i, Vector3,
    decode, encode, pack_f32s, pack_pair, release_bits, unpack_f32s, unpack_pair,
};
use crate::{HostStatus, RawPtr};

/// A value that can be written into call frame words.
pub trait ToSlots {
    /// Words this type occupies.
    const WORDS: usize;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()>;
}

/// A value that can be read out of call frame words.
pub trait FromSlots: Sized {
    /// Words this type occupies.
    const WORDS: usize;

    /// Read a value; `words` holds exactly [`WORDS`](Self::WORDS) words.
    ///
    /// Reading copies data out and never takes over storage the words
    /// point at.
    fn read_slots(words: &[u64], registry: &HandleRegistry) -> CallResult<Self>;

    /// Release what a caller-owned host return value carried.
    ///
    /// Called once after a return value was read.
    fn release_returned(_words: &[u64], _registry: &HandleRegistry) -> CallResult<()> {
        Ok(())
    }
}

/// What happens to engine storage written into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    /// The frame keeps the storage and releases it when it drops (arguments).
    Keep,
    /// The storage is handed to the host (values returned to the host).
    Transfer,
}

/// Storage a [`SlotMode::Transfer`] write handed to the host.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Handover {
    /// A buffer reference or an engine reference on an object.
    Handle(RawPtr, HandleKind),
    /// Whatever an encoded variant carried.
    Variant(VariantBits),
}

impl Handover {
    /// Take the allocation back from the host and release it.
    pub(crate) fn reclaim(self, registry: &HandleRegistry) -> CallResult<()> {
        match self {
            Handover::Handle(raw, kind) => registry.adopt(raw, kind)?.release()?,
            Handover::Variant(bits) => release_bits(registry, bits)?,
        }
        Ok(())
    }
}

/// Sequential writer over the words reserved for one value.
pub struct SlotWriter<'a> {
    registry: &'a HandleRegistry,
    words: &'a mut [u64],
    written: usize,
    storage: &'a mut Vec<Transient>,
    mode: SlotMode,
    handed: Vec<Handover>,
}

impl<'a> SlotWriter<'a> {
    pub(crate) fn new(
        registry: &'a HandleRegistry,
        words: &'a mut [u64],
        storage: &'a mut Vec<Transient>,
        mode: SlotMode,
    ) -> Self {
        Self {
            registry,
            words,
            written: 0,
            storage,
            mode,
            handed: Vec::new(),
        }
    }

    /// What this writer handed to the host so far.
    pub(crate) fn into_handed(self) -> Vec<Handover> {
        self.handed
    }

    pub fn registry(&self) -> &'a HandleRegistry {
        self.registry
    }

    pub fn mode(&self) -> SlotMode {
        self.mode
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Write the next word.
    pub fn word(&mut self, word: u64) -> CallResult<()> {
        let capacity = self.words.len();
        let needed = self.written + 1;
        let slot = self
            .words
            .get_mut(self.written)
            .ok_or(CallError::FrameOverflow { capacity, needed })?;
        *slot = word;
        self.written = needed;
        Ok(())
    }

    /// Write a buffer pointer and keep or transfer the buffer.
    pub fn buffer(&mut self, buffer: Transient) -> CallResult<()> {
        self.word(buffer.raw().to_word())?;
        match self.mode {
            SlotMode::Keep => self.storage.push(buffer),
            SlotMode::Transfer => {
                let raw = buffer.into_raw()?;
                self.handed.push(Handover::Handle(raw, HandleKind::Transient));
            }
        }
        Ok(())
    }

    /// Write an object pointer.
    ///
    /// Transferring a ref-counted object gives the host a reference of its
    /// own; manually-managed objects are passed as plain pointers.
    pub fn object(&mut self, raw: RawPtr, ref_counted: bool) -> CallResult<()> {
        self.word(raw.to_word())?;
        if self.mode == SlotMode::Transfer && ref_counted && !raw.is_null() {
            self.registry.host().ref_increment(raw);
            self.handed.push(Handover::Handle(raw, HandleKind::RefCounted));
        }
        Ok(())
    }

    /// Encode a variant into the next three words.
    pub fn variant(&mut self, value: &Variant) -> CallResult<()> {
        let encoded = encode(self.registry, value)?;
        let bits = match self.mode {
            SlotMode::Keep => {
                let (bits, storage) = encoded.into_parts();
                self.storage.extend(storage);
                bits
            }
            SlotMode::Transfer => {
                let bits = encoded.into_host(self.registry)?;
                self.handed.push(Handover::Variant(bits));
                bits
            }
        };
        for word in bits.to_words() {
            self.word(word)?;
        }
        Ok(())
    }
}

/// The first `N` words of `words`.
fn take<const N: usize>(words: &[u64]) -> CallResult<[u64; N]> {
    words
        .get(..N)
        .and_then(|head| <[u64; N]>::try_from(head).ok())
        .ok_or(CallError::ReturnTooWide {
            needed: N,
            available: words.len(),
        })
}

// ============================================================================
// Unit
// ============================================================================

impl ToSlots for () {
    const WORDS: usize = 0;

    fn write_slots(&self, _out: &mut SlotWriter<'_>) -> CallResult<()> {
        Ok(())
    }
}

impl FromSlots for () {
    const WORDS: usize = 0;

    fn read_slots(_words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        Ok(())
    }
}

// ============================================================================
// Scalars
// ============================================================================

macro_rules! impl_slots_int {
    ($($ty:ty => $bits:ty),*) => {
        $(
            impl ToSlots for $ty {
                const WORDS: usize = 1;

                fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
                    out.word(*self as $bits as u64)
                }
            }

            impl FromSlots for $ty {
                const WORDS: usize = 1;

                fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
                    let [word] = take::<1>(words)?;
                    Ok(word as $bits as $ty)
                }
            }
        )*
    };
}

impl_slots_int!(
    i8 => u8, i16 => u16, i32 => u32, i64 => u64,
    u8 => u8, u16 => u16, u32 => u32, u64 => u64
);

impl ToSlots for bool {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(*self as u64)
    }
}

impl FromSlots for bool {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        Ok(word != 0)
    }
}

impl ToSlots for f32 {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(self.to_bits() as u64)
    }
}

impl FromSlots for f32 {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        Ok(f32::from_bits(word as u32))
    }
}

impl ToSlots for f64 {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(self.to_bits())
    }
}

impl FromSlots for f64 {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        Ok(f64::from_bits(word))
    }
}

impl ToSlots for HostStatus {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(self.code() as u32 as u64)
    }
}

/// Status returns pass through unchanged; they are not turned into errors.
impl FromSlots for HostStatus {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        Ok(HostStatus::from_code(word as u32 as i32))
    }
}

// ============================================================================
// Math types
// ============================================================================

impl ToSlots for Vector2 {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(pack_f32s(self.x, self.y))
    }
}

impl FromSlots for Vector2 {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        let (x, y) = unpack_f32s(word);
        Ok(Vector2::new(x, y))
    }
}

impl ToSlots for Vector2i {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(pack_pair(self.x as u32, self.y as u32))
    }
}

impl FromSlots for Vector2i {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        let (x, y) = unpack_pair(word);
        Ok(Vector2i::new(x as i32, y as i32))
    }
}

impl ToSlots for Vector3 {
    const WORDS: usize = 2;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(pack_f32s(self.x, self.y))?;
        out.word(pack_f32s(self.z, 0.0))
    }
}

impl FromSlots for Vector3 {
    const WORDS: usize = 2;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [a, b] = take::<2>(words)?;
        let (x, y) = unpack_f32s(a);
        let (z, _) = unpack_f32s(b);
        Ok(Vector3::new(x, y, z))
    }
}

impl ToSlots for Color {
    const WORDS: usize = 2;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(pack_f32s(self.r, self.g))?;
        out.word(pack_f32s(self.b, self.a))
    }
}

impl FromSlots for Color {
    const WORDS: usize = 2;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [a, b] = take::<2>(words)?;
        let (r, g) = unpack_f32s(a);
        let (bl, al) = unpack_f32s(b);
        Ok(Color::rgba(r, g, bl, al))
    }
}

// ============================================================================
// Buffer-backed values
// ============================================================================

macro_rules! impl_slots_stored {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ToSlots for $ty {
                const WORDS: usize = 1;

                fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
                    let encoded = encode(out.registry(), &Variant::$variant(self.clone()))?;
                    match encoded.into_parts() {
                        (_, Some(buffer)) => out.buffer(buffer),
                        (bits, None) => out.word(bits.payload[0]),
                    }
                }
            }

            impl FromSlots for $ty {
                const WORDS: usize = 1;

                fn read_slots(words: &[u64], registry: &HandleRegistry) -> CallResult<Self> {
                    let [word] = take::<1>(words)?;
                    let bits = VariantBits::new(VariantType::$variant, [word, 0]);
                    match decode(registry, &bits)? {
                        Variant::$variant(value) => Ok(value),
                        other => Err(ConversionError::TypeMismatch {
                            expected: VariantType::$variant.name(),
                            actual: other.type_name(),
                        }
                        .into()),
                    }
                }

                fn release_returned(words: &[u64], registry: &HandleRegistry) -> CallResult<()> {
                    let [word] = take::<1>(words)?;
                    release_bits(registry, VariantBits::new(VariantType::$variant, [word, 0]))?;
                    Ok(())
                }
            }
        )*
    };
}

impl_slots_stored!(
    String => String,
    Transform2D => Transform2D,
    Vec<Variant> => Array,
    Vec<u8> => PackedByteArray,
    Vec<i32> => PackedInt32Array,
    Vec<i64> => PackedInt64Array,
    Vec<f32> => PackedFloat32Array,
    Vec<f64> => PackedFloat64Array,
    Vec<String> => PackedStringArray,
);

impl ToSlots for str {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        let buffer = out.registry().new_buffer(BufferKind::String, self.as_bytes())?;
        out.buffer(buffer)
    }
}

impl ToSlots for Variant {
    const WORDS: usize = VariantBits::WORDS;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.variant(self)
    }
}

impl FromSlots for Variant {
    const WORDS: usize = VariantBits::WORDS;

    fn read_slots(words: &[u64], registry: &HandleRegistry) -> CallResult<Self> {
        let bits = VariantBits::from_words(words).ok_or(CallError::ReturnTooWide {
            needed: VariantBits::WORDS,
            available: words.len(),
        })?;
        Ok(decode(registry, &bits)?)
    }

    fn release_returned(words: &[u64], registry: &HandleRegistry) -> CallResult<()> {
        if let Some(bits) = VariantBits::from_words(words) {
            release_bits(registry, bits)?;
        }
        Ok(())
    }
}

// ============================================================================
// Objects
// ============================================================================

impl ToSlots for RawPtr {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.word(self.to_word())
    }
}

impl FromSlots for RawPtr {
    const WORDS: usize = 1;

    fn read_slots(words: &[u64], _registry: &HandleRegistry) -> CallResult<Self> {
        let [word] = take::<1>(words)?;
        Ok(RawPtr::from_word(word))
    }
}

/// A borrow that outlived an extension-side release is refused.
impl ToSlots for Borrowed {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        let raw = out.registry().check_borrowed(self)?;
        out.object(raw, self.kind() == HandleKind::RefCounted)
    }
}

impl ToSlots for Shared {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.object(self.raw(), true)
    }
}

impl ToSlots for Owned {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.object(self.raw(), false)
    }
}

impl ToSlots for ObjectRef {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.object(self.raw(), self.is_ref_counted())
    }
}

impl ToSlots for Handle {
    const WORDS: usize = 1;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        out.object(self.raw(), self.kind() == HandleKind::RefCounted)
    }
}

// ============================================================================
// Wrappers
// ============================================================================

impl<T: ToSlots + ?Sized> ToSlots for &T {
    const WORDS: usize = T::WORDS;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        (**self).write_slots(out)
    }
}

/// `None` writes zero words, which is a null pointer for object types.
impl<T: ToSlots> ToSlots for Option<T> {
    const WORDS: usize = T::WORDS;

    fn write_slots(&self, out: &mut SlotWriter<'_>) -> CallResult<()> {
        match self {
            Some(value) => value.write_slots(out),
            None => {
                for _ in 0..T::WORDS {
                    out.word(0)?;
                }
                Ok(())
            }
        }
    }
}
