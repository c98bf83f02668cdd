//! Fixed-size engine math types.
//!
//! All components are 32-bit, matching the engine's single-precision build.

/// Two `f32` components.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

/// Two `i32` components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Vector2i {
    pub x: i32,
    pub y: i32,
}

/// Three `f32` components.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Linear RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

/// 2D affine transform: two basis columns and an origin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Transform2D {
    pub x: Vector2,
    pub y: Vector2,
    pub origin: Vector2,
}

impl Vector2 {
    pub const ZERO: Vector2 = Vector2::new(0.0, 0.0);

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Vector2i {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Color {
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::rgba(r, g, b, 1.0)
    }
}

impl Transform2D {
    pub const IDENTITY: Transform2D = Transform2D {
        x: Vector2::new(1.0, 0.0),
        y: Vector2::new(0.0, 1.0),
        origin: Vector2::ZERO,
    };

    pub const fn from_cols(x: Vector2, y: Vector2, origin: Vector2) -> Self {
        Self { x, y, origin }
    }

    /// Components in column order.
    pub fn to_array(&self) -> [f32; 6] {
        [
            self.x.x,
            self.x.y,
            self.y.x,
            self.y.y,
            self.origin.x,
            self.origin.y,
        ]
    }

    pub fn from_array(c: [f32; 6]) -> Self {
        Self::from_cols(
            Vector2::new(c[0], c[1]),
            Vector2::new(c[2], c[3]),
            Vector2::new(c[4], c[5]),
        )
    }
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Pack two 32-bit patterns into one word, low half first.
pub(crate) fn pack_pair(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

pub(crate) fn unpack_pair(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

pub(crate) fn pack_f32s(lo: f32, hi: f32) -> u64 {
    pack_pair(lo.to_bits(), hi.to_bits())
}

pub(crate) fn unpack_f32s(word: u64) -> (f32, f32) {
    let (lo, hi) = unpack_pair(word);
    (f32::from_bits(lo), f32::from_bits(hi))
}
