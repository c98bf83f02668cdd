//! Method bind identity.
//!
//! A [`MethodBind`] is the opaque host function pointer for one
//! `(class, method)` pair. Binds are resolved by the bind table in
//! `hostbind-registry`; this crate only needs to call through them.

use std::fmt;
use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use crate::RawPtr;

/// Domain markers for bind key computation.
mod key_constants {
    /// Mixed into every key so bind keys never collide with plain name hashes.
    pub const METHOD_BIND: u64 = 0x6b5a_f3c1_d2e4_0917;
    /// Separates the class and method components.
    pub const SEP: u64 = 0x4bc9_4d6b_d060_53ad;
}

/// Deterministic 64-bit key for a `(class, method)` pair.
///
/// Computed with xxh64, so the same pair always maps to the same key across
/// threads and runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BindKey(pub u64);

impl BindKey {
    #[inline]
    pub fn new(class: &str, method: &str) -> Self {
        let class_hash = xxh64(class.as_bytes(), 0);
        let method_hash = xxh64(method.as_bytes(), 0);
        BindKey(
            key_constants::METHOD_BIND
                ^ class_hash
                    .wrapping_mul(key_constants::SEP)
                    .wrapping_add(method_hash),
        )
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindKey({:#018x})", self.0)
    }
}

/// A resolved host method.
///
/// Cloning is cheap. Two binds are equal when they name the same pair and
/// point at the same host function.
#[derive(Clone, PartialEq, Eq)]
pub struct MethodBind {
    key: BindKey,
    raw: RawPtr,
    name: Arc<str>,
}

impl MethodBind {
    pub fn new(class: &str, method: &str, raw: RawPtr) -> Self {
        Self {
            key: BindKey::new(class, method),
            raw,
            name: format!("{class}::{method}").into(),
        }
    }

    pub fn key(&self) -> BindKey {
        self.key
    }

    pub fn raw(&self) -> RawPtr {
        self.raw
    }

    /// `Class::method`, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MethodBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodBind")
            .field("name", &self.name)
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(BindKey::new("Node", "get_name"), BindKey::new("Node", "get_name"));
    }

    #[test]
    fn class_and_method_do_not_commute() {
        assert_ne!(BindKey::new("Node", "Sprite"), BindKey::new("Sprite", "Node"));
        assert_ne!(BindKey::new("Node", "get_name"), BindKey::new("Node2D", "get_name"));
    }

    #[test]
    fn bind_name_is_qualified() {
        let bind = MethodBind::new("Image", "get_width", RawPtr::from_word(0x1000));
        assert_eq!(bind.name(), "Image::get_width");
        assert_eq!(bind.key(), BindKey::new("Image", "get_width"));
    }
}
