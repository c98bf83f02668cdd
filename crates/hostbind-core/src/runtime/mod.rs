//! Extension-side execution of host-invoked calls.
//!
//! ## Key Types
//!
//! - [`CallContext`]: typed argument reads and return writes over a host frame
//! - [`NativeFn`]: type-erased virtual method callback
//! - [`NativeCallable`]: the trait closures implement to become callbacks

mod call_context;
mod native_fn;

pub use call_context::CallContext;
pub use native_fn::{NativeCallable, NativeFn};
