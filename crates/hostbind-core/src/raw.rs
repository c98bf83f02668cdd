//! Raw host pointers.

use std::ffi::c_void;
use std::fmt;

pub type Void = c_void;

/// An opaque pointer owned by the host.
///
/// The extension never dereferences these; they only travel back to the host
/// through the ABI table or through call frame words.
#[derive(Hash, PartialEq, Eq, Copy, Clone)]
#[repr(transparent)]
pub struct RawPtr(*mut Void);

impl RawPtr {
    pub const fn null() -> Self {
        RawPtr(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn from_mut(ptr: *mut Void) -> Self {
        RawPtr(ptr)
    }

    pub fn from_const(ptr: *const Void) -> Self {
        RawPtr(ptr as *mut Void)
    }

    /// Rebuild a pointer from a call frame word.
    pub fn from_word(word: u64) -> Self {
        RawPtr(word as usize as *mut Void)
    }

    /// The pointer as a call frame word.
    pub fn to_word(self) -> u64 {
        self.0 as usize as u64
    }

    /// Address used as a ledger key.
    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    pub fn as_ptr(&self) -> *const Void {
        self.0
    }

    pub fn as_mut_ptr(&self) -> *mut Void {
        self.0
    }
}

impl Default for RawPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPtr({:#x})", self.addr())
    }
}

// The extension only hands these back to the host, which owns thread-safety of the pointee.
unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip_keeps_address() {
        let raw = RawPtr::from_word(0xdead_beef);
        assert_eq!(raw.addr(), 0xdead_beef);
        assert_eq!(raw.to_word(), 0xdead_beef);
        assert!(!raw.is_null());
    }

    #[test]
    fn null_is_default() {
        assert!(RawPtr::default().is_null());
        assert_eq!(RawPtr::null().to_word(), 0);
    }
}
