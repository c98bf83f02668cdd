//! Extension binding layer for a native host engine.
//!
//! `hostbind` ties the pieces of the binding core together:
//!
//! - [`hostbind_core`] talks to the host ABI: handles, call frames and variants.
//! - [`hostbind_registry`] caches method binds and keeps extension classes.
//! - [`Extension`] loads both against a host table and drives class
//!   registration through the engine's init levels.
//!
//! ```ignore
//! let ext = Extension::load(&interface, ExtensionConfig::new())?;
//! ext.register_class(
//!     InitLevel::Scene,
//!     ClassBuilder::<Player>::new("Player")
//!         .host_base("Node2D")
//!         .default_constructor()
//!         .virtual_method("_ready", |player, _ctx| player.ready()),
//! )?;
//! ext.initialize(InitLevel::Scene)?;
//! ```

pub mod config;
pub mod error;
pub mod extension;
mod trampoline;

pub use config::{ExtensionConfig, InitLevel};
pub use error::{HostbindError, Result};
pub use extension::Extension;

pub mod prelude {
    pub use crate::config::{ExtensionConfig, InitLevel};
    pub use crate::error::{HostbindError, Result};
    pub use crate::extension::Extension;
    pub use hostbind_core::{
        Borrowed, CallContext, CallFrame, FromSlots, FromVariant, Handle, HandleKind,
        HandleRegistry, HostStatus, MethodBind, NativeError, ObjectRef, Owned, RawPtr,
        ReturnConvention, Shared, ToSlots, ToVariant, Variant, ptrcall, ptrcall_object,
    };
    pub use hostbind_registry::{
        ClassBase, ClassBuilder, ClassDef, ClassFlags, ClassRegistry, Dispatch, InstanceId,
        MethodBindTable, VirtualTable,
    };
}
