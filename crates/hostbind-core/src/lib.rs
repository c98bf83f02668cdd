//! Binding core for native engine extensions.
//!
//! This crate holds everything that touches the host ABI directly:
//!
//! ```text
//! host::HostApi      validated host function table
//! handle             ownership-aware handles over host pointers
//! frame              word-based call frames for host method calls
//! variant            the engine's dynamic value type and its wire codec
//! runtime            call context for host-invoked extension callbacks
//! ```
//!
//! Method bind caching, class registration and virtual dispatch live in
//! `hostbind-registry`, built on top of these types.

mod bind;
pub mod error;
pub mod frame;
pub mod handle;
pub mod host;
mod raw;
pub mod runtime;
mod status;
pub mod variant;

#[cfg(any(test, feature = "stub-host"))]
pub mod stub;

pub use bind::{BindKey, MethodBind};
pub use error::{
    CallError, CallResult, ConfigError, ConversionError, DecodeError, HandleError, HandleResult,
    NativeError, panic_message,
};
pub use frame::{
    CallArgs, CallFrame, CallReturn, FromSlots, RETURN_WORDS, ReturnConvention, SlotMode,
    SlotWriter, ToSlots, ptrcall, ptrcall_object,
};
pub use handle::{Borrowed, Handle, HandleKind, HandleRegistry, ObjectRef, Owned, Owner, Shared, Transient};
pub use host::{AbiVersion, ClassRegistration, ExtensionCallbacks, HostApi, HostInterface};
pub use raw::{RawPtr, Void};
pub use runtime::{CallContext, NativeCallable, NativeFn};
pub use status::HostStatus;
pub use variant::{FromVariant, ToVariant, Variant, VariantBits, VariantType};
