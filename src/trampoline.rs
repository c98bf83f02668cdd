//! Entry points handed to the host for every registered class.
//!
//! Each trampoline recovers its [`ClassData`] from the `class_data` pointer,
//! forwards to the class registry and converts the outcome into what the
//! host ABI expects. Panics never unwind into the host: they are caught
//! here, logged, and reported as a failed construction or a `Bug` status.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;

use hostbind_core::{CallContext, CallError, ExtensionCallbacks, HostStatus, RawPtr, panic_message};
use hostbind_registry::{DispatchError, InstanceId};

use crate::extension::ExtensionState;

/// Per-class state the host passes back to every trampoline.
///
/// Lives in a `Box` owned by the extension until the class is unregistered
/// from the host.
pub(crate) struct ClassData {
    pub(crate) state: Weak<ExtensionState>,
    pub(crate) class: String,
}

pub(crate) const CALLBACKS: ExtensionCallbacks = ExtensionCallbacks {
    create_instance,
    free_instance,
    call_virtual,
};

/// # Safety
///
/// `class_data` must be a pointer registered through `class_register` whose
/// class has not been unregistered yet.
unsafe fn class_data<'a>(class_data: *mut c_void) -> &'a ClassData {
    unsafe { &*(class_data as *const ClassData) }
}

fn report_panic(what: &str, class: &str, payload: &(dyn std::any::Any + Send)) {
    let err = CallError::Panicked {
        message: panic_message(payload),
    };
    log::error!("{what} of {class}: {err}");
}

unsafe extern "C" fn create_instance(class_data_ptr: *mut c_void, host_object: *mut c_void) -> u64 {
    // SAFETY: the host only calls back with the pointer we registered.
    let data = unsafe { class_data(class_data_ptr) };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(state) = data.state.upgrade() else {
            log::warn!("create_instance for {} after the extension was dropped", data.class);
            return 0;
        };
        match state.classes.construct(&data.class, RawPtr::from_mut(host_object)) {
            Ok(id) => id.0,
            Err(err) => {
                log::error!("cannot create instance of {}: {err}", data.class);
                0
            }
        }
    }));
    result.unwrap_or_else(|payload| {
        report_panic("constructor", &data.class, &*payload);
        0
    })
}

unsafe extern "C" fn free_instance(class_data_ptr: *mut c_void, instance: u64) {
    // SAFETY: see `create_instance`.
    let data = unsafe { class_data(class_data_ptr) };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(state) = data.state.upgrade() else {
            return;
        };
        if !state.classes.free_instance(InstanceId(instance)) {
            log::warn!("host freed unknown instance {instance} of {}", data.class);
        }
    }));
    if let Err(payload) = result {
        report_panic("destructor", &data.class, &*payload);
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn call_virtual(
    class_data_ptr: *mut c_void,
    instance: u64,
    name: *const u8,
    name_len: usize,
    args: *const u64,
    arg_words: usize,
    ret: *mut u64,
    ret_words: usize,
) -> i32 {
    // SAFETY: see `create_instance`.
    let data = unsafe { class_data(class_data_ptr) };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(state) = data.state.upgrade() else {
            return HostStatus::DoesNotExist;
        };
        // SAFETY: the host passes buffers valid for the duration of the call.
        let (name, args, ret) = unsafe {
            (
                raw_slice(name, name_len),
                raw_slice(args, arg_words),
                raw_slice_mut(ret, ret_words),
            )
        };
        let Ok(name) = std::str::from_utf8(name) else {
            log::error!("virtual call on {} with a non-UTF-8 method name", data.class);
            return HostStatus::InvalidParameter;
        };

        let mut ctx = CallContext::new(&state.handles, args, ret);
        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            state.classes.call_virtual(InstanceId(instance), name, &mut ctx)
        }));
        match dispatched {
            Ok(Ok(_)) => HostStatus::Ok,
            Ok(Err(err @ DispatchError::UnknownInstance(_))) => {
                log::warn!("virtual {}::{name}: {err}", data.class);
                err.status()
            }
            Ok(Err(err)) => {
                log::error!("virtual {}::{name} failed: {err}", data.class);
                err.status()
            }
            Err(payload) => {
                ctx.discard_return();
                report_panic("virtual call", &data.class, &*payload);
                HostStatus::Bug
            }
        }
    }));
    match result {
        Ok(status) => status.code(),
        Err(payload) => {
            report_panic("virtual call", &data.class, &*payload);
            HostStatus::Bug.code()
        }
    }
}

/// # Safety
///
/// A non-null `ptr` must be valid for `len` reads.
unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

/// # Safety
///
/// A non-null `ptr` must be valid for `len` writes and not aliased.
unsafe fn raw_slice_mut<'a, T>(ptr: *mut T, len: usize) -> &'a mut [T] {
    if ptr.is_null() || len == 0 {
        &mut []
    } else {
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}
