//! In-process host for tests and benchmarks.
//!
//! [`StubHost`] implements every entry point of [`HostInterface`] behind the
//! real C ABI, so code under test goes through exactly the same function
//! pointers it would use against an engine. Everything it does is
//! observable: reference counts, destroy calls, live buffers, method lookups
//! and calls, class registrations.
//!
//! Addresses handed out are fake, non-null, unique and never reused, so a
//! stale pointer is always distinguishable from a live one.
//!
//! The stub must outlive every [`HostApi`] and [`HandleRegistry`] created
//! from it.

use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::handle::HandleRegistry;
use crate::host::{
    AbiVersion, ClassRegistration, ExtensionCallbacks, HostApi, HostData, HostInterface,
};
use crate::variant::{ObjectFlags, VariantBits, VariantType};
use crate::{HostStatus, RawPtr};

/// Handler run for a stub method: `(host, this, args, ret)`.
pub type StubMethod = dyn Fn(&StubHost, RawPtr, &[u64], &mut [u64]) + Send + Sync;

const FIRST_ADDR: usize = 0x1000;
const ADDR_STEP: usize = 0x40;

/// A class registered through `class_register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubClass {
    pub name: String,
    pub base: String,
    pub flags: u32,
}

struct RegisteredClass {
    info: StubClass,
    class_data: usize,
    callbacks: ExtensionCallbacks,
}

struct Object {
    class: String,
    ref_counted: bool,
    count: u32,
    alive: bool,
    destroy_calls: u32,
    instance: Option<u64>,
}

enum BufferData {
    Bytes(Vec<u8>),
    Array(Vec<VariantBits>),
}

struct Buffer {
    data: BufferData,
    count: u32,
}

struct Method {
    handler: Arc<StubMethod>,
    calls: u32,
}

/// An instance the host must tell the extension about once the lock is gone.
struct PendingFree {
    class_data: usize,
    free_instance: unsafe extern "C" fn(*mut c_void, u64),
    instance: u64,
}

#[derive(Default)]
struct State {
    next_addr: usize,
    objects: FxHashMap<usize, Object>,
    buffers: FxHashMap<usize, Buffer>,
    bind_addrs: FxHashMap<(String, String), usize>,
    methods: FxHashMap<usize, Method>,
    lookups: FxHashMap<(String, String), u32>,
    lookup_delay: Option<Duration>,
    ref_counted_classes: FxHashSet<String>,
    classes: FxHashMap<String, RegisteredClass>,
}

impl State {
    fn alloc(&mut self) -> usize {
        let addr = self.next_addr;
        self.next_addr += ADDR_STEP;
        addr
    }

    /// Whether `class` ends up on a ref-counted host class.
    fn is_ref_counted(&self, class: &str) -> bool {
        let mut current = class;
        loop {
            if self.ref_counted_classes.contains(current) {
                return true;
            }
            match self.classes.get(current) {
                Some(registered) => current = &registered.info.base,
                None => return false,
            }
        }
    }

    fn destroy(&mut self, addr: usize) -> Option<PendingFree> {
        let object = self.objects.get_mut(&addr)?;
        object.alive = false;
        object.count = 0;
        object.destroy_calls += 1;
        let instance = object.instance.take()?;
        let registered = self.classes.get(&object.class)?;
        Some(PendingFree {
            class_data: registered.class_data,
            free_instance: registered.callbacks.free_instance,
            instance,
        })
    }

    fn decrement(&mut self, addr: usize, pending: &mut Vec<PendingFree>) -> u32 {
        let Some(object) = self.objects.get_mut(&addr).filter(|o| o.alive) else {
            return 0;
        };
        object.count = object.count.saturating_sub(1);
        let count = object.count;
        if count == 0 {
            pending.extend(self.destroy(addr));
        }
        count
    }

    fn retain_element(&mut self, bits: &VariantBits) {
        let word = bits.payload[0] as usize;
        match bits.variant_type() {
            Ok(VariantType::Object) => {
                if ObjectFlags::from_bits_truncate(bits.payload[1]).contains(ObjectFlags::REF_COUNTED)
                    && let Some(object) = self.objects.get_mut(&word)
                {
                    object.count += 1;
                }
            }
            Ok(ty) if stored(ty) => {
                if let Some(buffer) = self.buffers.get_mut(&word) {
                    buffer.count += 1;
                }
            }
            _ => {}
        }
    }

    fn release_element(&mut self, bits: &VariantBits, pending: &mut Vec<PendingFree>) {
        let word = bits.payload[0] as usize;
        match bits.variant_type() {
            Ok(VariantType::Object) => {
                if ObjectFlags::from_bits_truncate(bits.payload[1]).contains(ObjectFlags::REF_COUNTED) {
                    self.decrement(word, pending);
                }
            }
            Ok(ty) if stored(ty) => {
                self.unreference(word, pending);
            }
            _ => {}
        }
    }

    fn unreference(&mut self, addr: usize, pending: &mut Vec<PendingFree>) -> u32 {
        let Some(buffer) = self.buffers.get_mut(&addr) else {
            return 0;
        };
        buffer.count = buffer.count.saturating_sub(1);
        let count = buffer.count;
        if count == 0
            && let Some(Buffer {
                data: BufferData::Array(elements),
                ..
            }) = self.buffers.remove(&addr)
        {
            for element in &elements {
                self.release_element(element, pending);
            }
        }
        count
    }
}

fn stored(ty: VariantType) -> bool {
    !matches!(
        ty,
        VariantType::Nil
            | VariantType::Bool
            | VariantType::Int
            | VariantType::Float
            | VariantType::Vector2
            | VariantType::Vector2i
            | VariantType::Vector3
            | VariantType::Color
            | VariantType::Object
    )
}

/// An in-process engine.
pub struct StubHost {
    state: Mutex<State>,
}

impl StubHost {
    /// A host where `RefCounted`, `Resource` and `Image` are ref-counted and
    /// every other class is manually managed.
    pub fn new() -> Arc<Self> {
        let state = State {
            next_addr: FIRST_ADDR,
            ref_counted_classes: ["RefCounted", "Resource", "Image"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..State::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The C table pointing at this host.
    pub fn interface(self: &Arc<Self>) -> HostInterface {
        HostInterface {
            abi_version: AbiVersion::CURRENT,
            host_data: Arc::as_ptr(self) as *mut c_void,
            object_construct: Some(ffi::object_construct),
            object_destroy: Some(ffi::object_destroy),
            ref_increment: Some(ffi::ref_increment),
            ref_decrement: Some(ffi::ref_decrement),
            method_bind_lookup: Some(ffi::method_bind_lookup),
            method_bind_call: Some(ffi::method_bind_call),
            buffer_new: Some(ffi::buffer_new),
            buffer_reference: Some(ffi::buffer_reference),
            buffer_unreference: Some(ffi::buffer_unreference),
            buffer_len: Some(ffi::buffer_len),
            buffer_read: Some(ffi::buffer_read),
            array_new: Some(ffi::array_new),
            array_push: Some(ffi::array_push),
            array_get: Some(ffi::array_get),
            class_register: Some(ffi::class_register),
            class_unregister: Some(ffi::class_unregister),
        }
    }

    pub fn api(self: &Arc<Self>) -> HostApi {
        HostApi::load(&self.interface(), AbiVersion::CURRENT)
            .expect("stub interface fills every entry point")
    }

    /// A registry with ownership checks on.
    pub fn registry(self: &Arc<Self>) -> HandleRegistry {
        HandleRegistry::with_ownership_checks(self.api(), true)
    }

    // ==========================================================================
    // Objects
    // ==========================================================================

    /// Make instances of `class` (and classes deriving from it) ref-counted.
    pub fn mark_ref_counted(&self, class: &str) {
        self.state().ref_counted_classes.insert(class.to_string());
    }

    fn spawn(&self, class: &str, ref_counted: bool) -> RawPtr {
        let mut state = self.state();
        let addr = state.alloc();
        state.objects.insert(
            addr,
            Object {
                class: class.to_string(),
                ref_counted,
                count: u32::from(ref_counted),
                alive: true,
                destroy_calls: 0,
                instance: None,
            },
        );
        RawPtr::from_word(addr as u64)
    }

    /// A ref-counted object with a count of one held by the caller.
    pub fn spawn_ref_counted(&self, class: &str) -> RawPtr {
        self.spawn(class, true)
    }

    /// A manually-managed object.
    pub fn spawn_manual(&self, class: &str) -> RawPtr {
        self.spawn(class, false)
    }

    /// Put a new manually-managed object of `class` at the address of a
    /// destroyed one, the way a host allocator recycles memory.
    ///
    /// Returns `raw` unchanged; panics if the object there is still alive.
    pub fn respawn_manual(&self, raw: RawPtr, class: &str) -> RawPtr {
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(&raw.addr())
            .filter(|o| !o.alive)
            .unwrap_or_else(|| panic!("{raw:?} is not a destroyed object"));
        object.class = class.to_string();
        object.ref_counted = false;
        object.count = 0;
        object.alive = true;
        object.instance = None;
        raw
    }

    /// Current count of a live ref-counted object.
    pub fn ref_count(&self, raw: RawPtr) -> Option<u32> {
        self.state()
            .objects
            .get(&raw.addr())
            .filter(|o| o.alive && o.ref_counted)
            .map(|o| o.count)
    }

    pub fn destroy_calls(&self, raw: RawPtr) -> u32 {
        self.state()
            .objects
            .get(&raw.addr())
            .map_or(0, |o| o.destroy_calls)
    }

    pub fn is_alive(&self, raw: RawPtr) -> bool {
        self.state().objects.get(&raw.addr()).is_some_and(|o| o.alive)
    }

    pub fn class_of(&self, raw: RawPtr) -> Option<String> {
        self.state().objects.get(&raw.addr()).map(|o| o.class.clone())
    }

    /// The extension instance bound to `raw`, if any.
    pub fn instance_of(&self, raw: RawPtr) -> Option<u64> {
        self.state().objects.get(&raw.addr()).and_then(|o| o.instance)
    }

    // ==========================================================================
    // Buffers
    // ==========================================================================

    /// Buffers and arrays currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    /// A string buffer with a count of one held by the caller.
    pub fn new_string(&self, s: &str) -> RawPtr {
        self.new_buffer(s.as_bytes().to_vec())
    }

    fn new_buffer(&self, bytes: Vec<u8>) -> RawPtr {
        let mut state = self.state();
        let addr = state.alloc();
        state.buffers.insert(
            addr,
            Buffer {
                data: BufferData::Bytes(bytes),
                count: 1,
            },
        );
        RawPtr::from_word(addr as u64)
    }

    /// Contents of a byte buffer; empty for unknown buffers and arrays.
    pub fn buffer_bytes(&self, raw: RawPtr) -> Vec<u8> {
        match self.state().buffers.get(&raw.addr()) {
            Some(Buffer {
                data: BufferData::Bytes(bytes),
                ..
            }) => bytes.clone(),
            _ => Vec::new(),
        }
    }

    pub fn buffer_count(&self, raw: RawPtr) -> Option<u32> {
        self.state().buffers.get(&raw.addr()).map(|b| b.count)
    }

    // ==========================================================================
    // Methods
    // ==========================================================================

    /// Expose `class::method`; lookups return a bind that runs `handler`.
    pub fn register_method<F>(&self, class: &str, method: &str, handler: F)
    where
        F: Fn(&StubHost, RawPtr, &[u64], &mut [u64]) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let addr = state.alloc();
        state
            .bind_addrs
            .insert((class.to_string(), method.to_string()), addr);
        state.methods.insert(
            addr,
            Method {
                handler: Arc::new(handler),
                calls: 0,
            },
        );
    }

    /// Slow down every lookup, to widen race windows in concurrency tests.
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.state().lookup_delay = Some(delay);
    }

    pub fn lookup_count(&self, class: &str, method: &str) -> u32 {
        self.state()
            .lookups
            .get(&(class.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn call_count(&self, class: &str, method: &str) -> u32 {
        let state = self.state();
        state
            .bind_addrs
            .get(&(class.to_string(), method.to_string()))
            .and_then(|addr| state.methods.get(addr))
            .map_or(0, |m| m.calls)
    }

    // ==========================================================================
    // Classes
    // ==========================================================================

    pub fn registered_class(&self, name: &str) -> Option<StubClass> {
        self.state().classes.get(name).map(|c| c.info.clone())
    }

    pub fn registered_class_count(&self) -> usize {
        self.state().classes.len()
    }

    /// Invoke a virtual method on the extension instance bound to `object`,
    /// the way the engine does.
    pub fn call_virtual(&self, object: RawPtr, name: &str, args: &[u64], ret: &mut [u64]) -> HostStatus {
        let target = {
            let state = self.state();
            state.objects.get(&object.addr()).and_then(|o| {
                let instance = o.instance?;
                let class = state.classes.get(&o.class)?;
                Some((class.class_data, class.callbacks.call_virtual, instance))
            })
        };
        let Some((class_data, call_virtual, instance)) = target else {
            return HostStatus::DoesNotExist;
        };
        // SAFETY: the extension registered these callbacks for this class.
        let code = unsafe {
            call_virtual(
                class_data as *mut c_void,
                instance,
                name.as_ptr(),
                name.len(),
                args.as_ptr(),
                args.len(),
                ret.as_mut_ptr(),
                ret.len(),
            )
        };
        HostStatus::from_code(code)
    }

    fn construct(&self, class: &str) -> RawPtr {
        let (raw, create) = {
            let mut state = self.state();
            let ref_counted = state.is_ref_counted(class);
            let create = state
                .classes
                .get(class)
                .map(|c| (c.class_data, c.callbacks.create_instance));
            let addr = state.alloc();
            state.objects.insert(
                addr,
                Object {
                    class: class.to_string(),
                    ref_counted,
                    count: u32::from(ref_counted),
                    alive: true,
                    destroy_calls: 0,
                    instance: None,
                },
            );
            (RawPtr::from_word(addr as u64), create)
        };

        if let Some((class_data, create_instance)) = create {
            // SAFETY: the extension registered these callbacks for this class.
            let instance = unsafe { create_instance(class_data as *mut c_void, raw.as_mut_ptr()) };
            if instance == 0 {
                log::warn!("extension failed to create an instance of {class}");
            } else if let Some(object) = self.state().objects.get_mut(&raw.addr()) {
                object.instance = Some(instance);
            }
        }
        raw
    }

    fn run_frees(pending: Vec<PendingFree>) {
        for free in pending {
            // SAFETY: the extension registered these callbacks for this class.
            unsafe { (free.free_instance)(free.class_data as *mut c_void, free.instance) }
        }
    }
}

/// The C entry points. Each recovers the [`StubHost`] from `host_data`.
mod ffi {
    use super::*;

    unsafe fn host<'a>(data: HostData) -> &'a StubHost {
        // SAFETY: `interface` stores a pointer to a live StubHost.
        unsafe { &*(data as *const StubHost) }
    }

    unsafe fn text<'a>(ptr: *const u8, len: usize) -> &'a str {
        if ptr.is_null() {
            return "";
        }
        // SAFETY: callers pass a pointer/length pair from a `&str`.
        std::str::from_utf8(unsafe { std::slice::from_raw_parts(ptr, len) }).unwrap_or("")
    }

    unsafe fn words<'a>(ptr: *const u64, len: usize) -> &'a [u64] {
        if ptr.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: callers pass a pointer/length pair from a slice.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    pub unsafe extern "C" fn object_construct(data: HostData, class: *const u8, len: usize) -> *mut c_void {
        let host = unsafe { host(data) };
        host.construct(unsafe { text(class, len) }).as_mut_ptr()
    }

    pub unsafe extern "C" fn object_destroy(data: HostData, object: *mut c_void) {
        let host = unsafe { host(data) };
        let pending = host.state().destroy(object as usize);
        StubHost::run_frees(pending.into_iter().collect());
    }

    pub unsafe extern "C" fn ref_increment(data: HostData, object: *mut c_void) -> u32 {
        let host = unsafe { host(data) };
        let mut state = host.state();
        match state.objects.get_mut(&(object as usize)).filter(|o| o.alive) {
            Some(object) => {
                object.count += 1;
                object.count
            }
            None => 0,
        }
    }

    pub unsafe extern "C" fn ref_decrement(data: HostData, object: *mut c_void) -> u32 {
        let host = unsafe { host(data) };
        let mut pending = Vec::new();
        let count = host.state().decrement(object as usize, &mut pending);
        StubHost::run_frees(pending);
        count
    }

    pub unsafe extern "C" fn method_bind_lookup(
        data: HostData,
        class: *const u8,
        class_len: usize,
        method: *const u8,
        method_len: usize,
    ) -> *mut c_void {
        let host = unsafe { host(data) };
        let key = unsafe { (text(class, class_len).to_string(), text(method, method_len).to_string()) };
        let delay = {
            let mut state = host.state();
            *state.lookups.entry(key.clone()).or_default() += 1;
            state.lookup_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        host.state()
            .bind_addrs
            .get(&key)
            .map_or(std::ptr::null_mut(), |addr| *addr as *mut c_void)
    }

    pub unsafe extern "C" fn method_bind_call(
        data: HostData,
        bind: *mut c_void,
        this: *mut c_void,
        args: *const u64,
        arg_words: usize,
        ret: *mut u64,
        ret_words: usize,
    ) {
        let host = unsafe { host(data) };
        let handler = {
            let mut state = host.state();
            state.methods.get_mut(&(bind as usize)).map(|m| {
                m.calls += 1;
                Arc::clone(&m.handler)
            })
        };
        let Some(handler) = handler else {
            log::warn!("stub host called with unknown bind {bind:p}");
            return;
        };
        let args = unsafe { words(args, arg_words) };
        let ret: &mut [u64] = if ret.is_null() || ret_words == 0 {
            &mut []
        } else {
            // SAFETY: the caller passes its return area.
            unsafe { std::slice::from_raw_parts_mut(ret, ret_words) }
        };
        handler(host, RawPtr::from_mut(this), args, ret);
    }

    pub unsafe extern "C" fn buffer_new(data: HostData, _kind: u32, bytes: *const u8, len: usize) -> *mut c_void {
        let host = unsafe { host(data) };
        let bytes = if bytes.is_null() || len == 0 {
            Vec::new()
        } else {
            // SAFETY: the caller passes a pointer/length pair from a slice.
            unsafe { std::slice::from_raw_parts(bytes, len) }.to_vec()
        };
        host.new_buffer(bytes).as_mut_ptr()
    }

    pub unsafe extern "C" fn buffer_reference(data: HostData, buffer: *mut c_void) -> u32 {
        let host = unsafe { host(data) };
        match host.state().buffers.get_mut(&(buffer as usize)) {
            Some(buffer) => {
                buffer.count += 1;
                buffer.count
            }
            None => 0,
        }
    }

    pub unsafe extern "C" fn buffer_unreference(data: HostData, buffer: *mut c_void) -> u32 {
        let host = unsafe { host(data) };
        let mut pending = Vec::new();
        let count = host.state().unreference(buffer as usize, &mut pending);
        StubHost::run_frees(pending);
        count
    }

    pub unsafe extern "C" fn buffer_len(data: HostData, buffer: *mut c_void) -> usize {
        let host = unsafe { host(data) };
        match host.state().buffers.get(&(buffer as usize)).map(|b| &b.data) {
            Some(BufferData::Bytes(bytes)) => bytes.len(),
            Some(BufferData::Array(elements)) => elements.len(),
            None => 0,
        }
    }

    pub unsafe extern "C" fn buffer_read(data: HostData, buffer: *mut c_void, out: *mut u8, out_len: usize) -> usize {
        let host = unsafe { host(data) };
        let state = host.state();
        let Some(BufferData::Bytes(bytes)) = state.buffers.get(&(buffer as usize)).map(|b| &b.data) else {
            return 0;
        };
        let n = bytes.len().min(out_len);
        if n > 0 {
            // SAFETY: `out` has room for `out_len` bytes.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, n) };
        }
        n
    }

    pub unsafe extern "C" fn array_new(data: HostData) -> *mut c_void {
        let host = unsafe { host(data) };
        let mut state = host.state();
        let addr = state.alloc();
        state.buffers.insert(
            addr,
            Buffer {
                data: BufferData::Array(Vec::new()),
                count: 1,
            },
        );
        addr as *mut c_void
    }

    pub unsafe extern "C" fn array_push(data: HostData, array: *mut c_void, element: *const VariantBits) {
        let host = unsafe { host(data) };
        if element.is_null() {
            return;
        }
        // SAFETY: the caller passes a live VariantBits.
        let element = unsafe { *element };
        let mut state = host.state();
        state.retain_element(&element);
        if let Some(Buffer {
            data: BufferData::Array(elements),
            ..
        }) = state.buffers.get_mut(&(array as usize))
        {
            elements.push(element);
        }
    }

    pub unsafe extern "C" fn array_get(data: HostData, array: *mut c_void, index: usize, out: *mut VariantBits) -> i32 {
        let host = unsafe { host(data) };
        let state = host.state();
        let element = match state.buffers.get(&(array as usize)).map(|b| &b.data) {
            Some(BufferData::Array(elements)) => elements.get(index).copied(),
            _ => return HostStatus::DoesNotExist.code(),
        };
        match element {
            Some(bits) if !out.is_null() => {
                // SAFETY: `out` points at writable VariantBits.
                unsafe { *out = bits };
                HostStatus::Ok.code()
            }
            _ => HostStatus::ParameterRangeError.code(),
        }
    }

    pub unsafe extern "C" fn class_register(data: HostData, registration: *const ClassRegistration) -> i32 {
        let host = unsafe { host(data) };
        if registration.is_null() {
            return HostStatus::InvalidParameter.code();
        }
        // SAFETY: the caller passes a live registration.
        let registration = unsafe { &*registration };
        let name = unsafe { text(registration.name, registration.name_len) }.to_string();
        let base = unsafe { text(registration.base, registration.base_len) }.to_string();
        let mut state = host.state();
        if state.classes.contains_key(&name) {
            return HostStatus::AlreadyExists.code();
        }
        state.classes.insert(
            name.clone(),
            RegisteredClass {
                info: StubClass {
                    name,
                    base,
                    flags: registration.flags,
                },
                class_data: registration.class_data as usize,
                callbacks: registration.callbacks,
            },
        );
        HostStatus::Ok.code()
    }

    pub unsafe extern "C" fn class_unregister(data: HostData, name: *const u8, len: usize) -> i32 {
        let host = unsafe { host(data) };
        let name = unsafe { text(name, len) };
        match host.state().classes.remove(name) {
            Some(_) => HostStatus::Ok.code(),
            None => HostStatus::DoesNotExist.code(),
        }
    }
}
