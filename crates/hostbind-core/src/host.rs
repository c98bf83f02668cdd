//! The host ABI boundary.
//!
//! The host hands the extension a [`HostInterface`] at load time: a C table of
//! function pointers plus an opaque `host_data` pointer that is passed back as
//! the first argument of every entry point. [`HostApi::load`] validates the
//! table once (ABI revision and every required entry point) and afterwards
//! exposes safe wrappers.
//!
//! Everything past this module trusts the host to honor the contracts written
//! on each entry point. A host that violates them corrupts memory; the binding
//! layer cannot detect it.

use std::ffi::c_void;
use std::fmt;

use crate::error::ConfigError;
use crate::variant::VariantBits;
use crate::{HostStatus, RawPtr};

/// Opaque host state passed back to every entry point.
pub type HostData = *mut c_void;

/// `object_construct(host, class_name, class_name_len) -> object`
///
/// Returns a new object the caller is responsible for. Ref-counted objects
/// start with a count of one.
pub type ObjectConstructFn = unsafe extern "C" fn(HostData, *const u8, usize) -> *mut c_void;
/// `object_destroy(host, object)`
pub type ObjectDestroyFn = unsafe extern "C" fn(HostData, *mut c_void);
/// `ref_increment(host, object) -> new_count` / `ref_decrement(host, object) -> new_count`
///
/// The host frees the object when a decrement reaches zero.
pub type RefCountFn = unsafe extern "C" fn(HostData, *mut c_void) -> u32;
/// `method_bind_lookup(host, class, class_len, method, method_len) -> bind`
///
/// Returns null when the host has no such method.
pub type MethodBindLookupFn =
    unsafe extern "C" fn(HostData, *const u8, usize, *const u8, usize) -> *mut c_void;
/// `method_bind_call(host, bind, self, args, arg_words, ret, ret_words)`
pub type MethodBindCallFn =
    unsafe extern "C" fn(HostData, *mut c_void, *mut c_void, *const u64, usize, *mut u64, usize);
/// `buffer_new(host, kind, data, len) -> buffer` with a reference count of one.
pub type BufferNewFn = unsafe extern "C" fn(HostData, u32, *const u8, usize) -> *mut c_void;
/// `buffer_len(host, buffer) -> len` (bytes, or elements for variant arrays)
pub type BufferLenFn = unsafe extern "C" fn(HostData, *mut c_void) -> usize;
/// `buffer_read(host, buffer, out, out_len) -> bytes_written`
pub type BufferReadFn = unsafe extern "C" fn(HostData, *mut c_void, *mut u8, usize) -> usize;
/// `array_new(host) -> array` with a reference count of one.
pub type ArrayNewFn = unsafe extern "C" fn(HostData) -> *mut c_void;
/// `array_push(host, array, element)`; the array takes its own references.
pub type ArrayPushFn = unsafe extern "C" fn(HostData, *mut c_void, *const VariantBits);
/// `array_get(host, array, index, out) -> status`; `out` is borrowed from the array.
pub type ArrayGetFn = unsafe extern "C" fn(HostData, *mut c_void, usize, *mut VariantBits) -> i32;
/// `class_register(host, registration) -> status`
pub type ClassRegisterFn = unsafe extern "C" fn(HostData, *const ClassRegistration) -> i32;
/// `class_unregister(host, name, name_len) -> status`
pub type ClassUnregisterFn = unsafe extern "C" fn(HostData, *const u8, usize) -> i32;

/// ABI revision of the host table.
///
/// Hosts are compatible when the major revision matches and the minor
/// revision is at least the one the extension requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct AbiVersion {
    pub major: u16,
    pub minor: u16,
}

impl AbiVersion {
    /// The revision this crate is written against.
    pub const CURRENT: AbiVersion = AbiVersion::new(1, 0);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn satisfies(self, required: AbiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The table the host provides at load time.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostInterface {
    pub abi_version: AbiVersion,
    pub host_data: HostData,
    pub object_construct: Option<ObjectConstructFn>,
    pub object_destroy: Option<ObjectDestroyFn>,
    pub ref_increment: Option<RefCountFn>,
    pub ref_decrement: Option<RefCountFn>,
    pub method_bind_lookup: Option<MethodBindLookupFn>,
    pub method_bind_call: Option<MethodBindCallFn>,
    pub buffer_new: Option<BufferNewFn>,
    pub buffer_reference: Option<RefCountFn>,
    pub buffer_unreference: Option<RefCountFn>,
    pub buffer_len: Option<BufferLenFn>,
    pub buffer_read: Option<BufferReadFn>,
    pub array_new: Option<ArrayNewFn>,
    pub array_push: Option<ArrayPushFn>,
    pub array_get: Option<ArrayGetFn>,
    pub class_register: Option<ClassRegisterFn>,
    pub class_unregister: Option<ClassUnregisterFn>,
}

/// Entry points the extension hands to the host for each registered class.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExtensionCallbacks {
    /// `create_instance(class_data, host_object) -> instance_id` (0 on failure)
    pub create_instance: unsafe extern "C" fn(*mut c_void, *mut c_void) -> u64,
    /// `free_instance(class_data, instance_id)`
    pub free_instance: unsafe extern "C" fn(*mut c_void, u64),
    /// `call_virtual(class_data, instance_id, name, name_len, args, arg_words, ret, ret_words) -> status`
    pub call_virtual:
        unsafe extern "C" fn(*mut c_void, u64, *const u8, usize, *const u64, usize, *mut u64, usize) -> i32,
}

/// Class description passed to `class_register`.
///
/// The pointers only need to stay valid for the duration of the call, except
/// `class_data`, which must stay valid until the class is unregistered.
#[repr(C)]
pub struct ClassRegistration {
    pub name: *const u8,
    pub name_len: usize,
    pub base: *const u8,
    pub base_len: usize,
    pub flags: u32,
    pub class_data: *mut c_void,
    pub callbacks: ExtensionCallbacks,
}

/// Validated host table.
#[derive(Clone, Copy)]
pub struct HostApi {
    version: AbiVersion,
    host_data: RawPtr,
    object_construct: ObjectConstructFn,
    object_destroy: ObjectDestroyFn,
    ref_increment: RefCountFn,
    ref_decrement: RefCountFn,
    method_bind_lookup: MethodBindLookupFn,
    method_bind_call: MethodBindCallFn,
    buffer_new: BufferNewFn,
    buffer_reference: RefCountFn,
    buffer_unreference: RefCountFn,
    buffer_len: BufferLenFn,
    buffer_read: BufferReadFn,
    array_new: ArrayNewFn,
    array_push: ArrayPushFn,
    array_get: ArrayGetFn,
    class_register: ClassRegisterFn,
    class_unregister: ClassUnregisterFn,
}

macro_rules! require {
    ($table:ident . $field:ident) => {
        $table
            .$field
            .ok_or(ConfigError::MissingEntryPoint(stringify!($field)))?
    };
}

impl HostApi {
    /// Validate a host table.
    ///
    /// Fails when the ABI revision does not satisfy `required` or any entry
    /// point is missing.
    pub fn load(table: &HostInterface, required: AbiVersion) -> Result<Self, ConfigError> {
        if !table.abi_version.satisfies(required) {
            return Err(ConfigError::AbiMismatch {
                host: table.abi_version,
                required,
            });
        }

        let api = Self {
            version: table.abi_version,
            host_data: RawPtr::from_mut(table.host_data),
            object_construct: require!(table.object_construct),
            object_destroy: require!(table.object_destroy),
            ref_increment: require!(table.ref_increment),
            ref_decrement: require!(table.ref_decrement),
            method_bind_lookup: require!(table.method_bind_lookup),
            method_bind_call: require!(table.method_bind_call),
            buffer_new: require!(table.buffer_new),
            buffer_reference: require!(table.buffer_reference),
            buffer_unreference: require!(table.buffer_unreference),
            buffer_len: require!(table.buffer_len),
            buffer_read: require!(table.buffer_read),
            array_new: require!(table.array_new),
            array_push: require!(table.array_push),
            array_get: require!(table.array_get),
            class_register: require!(table.class_register),
            class_unregister: require!(table.class_unregister),
        };
        log::debug!("loaded host interface, ABI {}", api.version);
        Ok(api)
    }

    pub fn version(&self) -> AbiVersion {
        self.version
    }

    fn data(&self) -> HostData {
        self.host_data.as_mut_ptr()
    }

    // SAFETY (all wrappers below): the table was validated in `load`, and the
    // host contract says every entry point accepts any pointer it handed out.

    pub fn object_construct(&self, class: &str) -> RawPtr {
        RawPtr::from_mut(unsafe { (self.object_construct)(self.data(), class.as_ptr(), class.len()) })
    }

    pub fn object_destroy(&self, object: RawPtr) {
        unsafe { (self.object_destroy)(self.data(), object.as_mut_ptr()) }
    }

    pub fn ref_increment(&self, object: RawPtr) -> u32 {
        unsafe { (self.ref_increment)(self.data(), object.as_mut_ptr()) }
    }

    pub fn ref_decrement(&self, object: RawPtr) -> u32 {
        unsafe { (self.ref_decrement)(self.data(), object.as_mut_ptr()) }
    }

    pub fn method_bind_lookup(&self, class: &str, method: &str) -> RawPtr {
        RawPtr::from_mut(unsafe {
            (self.method_bind_lookup)(
                self.data(),
                class.as_ptr(),
                class.len(),
                method.as_ptr(),
                method.len(),
            )
        })
    }

    pub fn method_bind_call(&self, bind: RawPtr, this: RawPtr, args: &[u64], ret: &mut [u64]) {
        unsafe {
            (self.method_bind_call)(
                self.data(),
                bind.as_mut_ptr(),
                this.as_mut_ptr(),
                args.as_ptr(),
                args.len(),
                ret.as_mut_ptr(),
                ret.len(),
            )
        }
    }

    pub fn buffer_new(&self, kind: u32, data: &[u8]) -> RawPtr {
        RawPtr::from_mut(unsafe { (self.buffer_new)(self.data(), kind, data.as_ptr(), data.len()) })
    }

    pub fn buffer_reference(&self, buffer: RawPtr) -> u32 {
        unsafe { (self.buffer_reference)(self.data(), buffer.as_mut_ptr()) }
    }

    pub fn buffer_unreference(&self, buffer: RawPtr) -> u32 {
        unsafe { (self.buffer_unreference)(self.data(), buffer.as_mut_ptr()) }
    }

    pub fn buffer_len(&self, buffer: RawPtr) -> usize {
        unsafe { (self.buffer_len)(self.data(), buffer.as_mut_ptr()) }
    }

    /// Copy a buffer's bytes out of engine storage.
    pub fn buffer_read(&self, buffer: RawPtr) -> Vec<u8> {
        let len = self.buffer_len(buffer);
        let mut out = vec![0u8; len];
        let written =
            unsafe { (self.buffer_read)(self.data(), buffer.as_mut_ptr(), out.as_mut_ptr(), len) };
        out.truncate(written.min(len));
        out
    }

    pub fn array_new(&self) -> RawPtr {
        RawPtr::from_mut(unsafe { (self.array_new)(self.data()) })
    }

    pub fn array_push(&self, array: RawPtr, element: &VariantBits) {
        unsafe { (self.array_push)(self.data(), array.as_mut_ptr(), element as *const VariantBits) }
    }

    /// Read one element; the returned bits are borrowed from the array.
    pub fn array_get(&self, array: RawPtr, index: usize) -> Result<VariantBits, HostStatus> {
        let mut out = VariantBits::NIL;
        let code = unsafe { (self.array_get)(self.data(), array.as_mut_ptr(), index, &mut out) };
        match HostStatus::from_code(code) {
            HostStatus::Ok => Ok(out),
            status => Err(status),
        }
    }

    pub fn class_register(&self, registration: &ClassRegistration) -> HostStatus {
        HostStatus::from_code(unsafe { (self.class_register)(self.data(), registration) })
    }

    pub fn class_unregister(&self, class: &str) -> HostStatus {
        HostStatus::from_code(unsafe { (self.class_unregister)(self.data(), class.as_ptr(), class.len()) })
    }
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi")
            .field("version", &self.version)
            .field("host_data", &self.host_data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_compatibility_requires_same_major() {
        assert!(AbiVersion::new(1, 2).satisfies(AbiVersion::new(1, 0)));
        assert!(AbiVersion::new(1, 2).satisfies(AbiVersion::new(1, 2)));
        assert!(!AbiVersion::new(1, 1).satisfies(AbiVersion::new(1, 2)));
        assert!(!AbiVersion::new(2, 0).satisfies(AbiVersion::new(1, 0)));
    }

    #[test]
    fn empty_table_is_rejected_with_first_missing_entry() {
        let table = HostInterface {
            abi_version: AbiVersion::CURRENT,
            host_data: std::ptr::null_mut(),
            object_construct: None,
            object_destroy: None,
            ref_increment: None,
            ref_decrement: None,
            method_bind_lookup: None,
            method_bind_call: None,
            buffer_new: None,
            buffer_reference: None,
            buffer_unreference: None,
            buffer_len: None,
            buffer_read: None,
            array_new: None,
            array_push: None,
            array_get: None,
            class_register: None,
            class_unregister: None,
        };
        let err = HostApi::load(&table, AbiVersion::CURRENT).unwrap_err();
        assert_eq!(err, ConfigError::MissingEntryPoint("object_construct"));
    }

    #[test]
    fn abi_is_checked_before_entry_points() {
        let mut table = crate::stub::StubHost::new().interface();
        table.abi_version = AbiVersion::new(0, 9);
        let err = HostApi::load(&table, AbiVersion::CURRENT).unwrap_err();
        assert!(matches!(err, ConfigError::AbiMismatch { .. }));
    }
}
