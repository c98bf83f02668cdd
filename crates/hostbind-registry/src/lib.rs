//! Method binds, extension classes and virtual dispatch.
//!
//! ```text
//! MethodBindTable   (class, method) -> host method bind, resolved once
//! ClassRegistry     extension classes, their instances and virtual tables
//! ClassBuilder      typed front end producing a ClassDef
//! ```
//!
//! Both tables are plain values owned by whoever loads the extension; none
//! of them is a process global.

pub mod bind_table;
pub mod builder;
pub mod class_registry;
pub mod dispatch;
pub mod error;

pub use bind_table::MethodBindTable;
pub use builder::ClassBuilder;
pub use class_registry::{
    ClassBase, ClassDef, ClassEntry, ClassFlags, ClassRegistry, Constructor, InstanceId, Upcast,
    VirtualTable, constructor, upcast,
};
pub use dispatch::Dispatch;
pub use error::{BindError, BindResult, DispatchError, RegistrationError, RegistrationResult};
