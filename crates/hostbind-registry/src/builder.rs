//! Typed class definitions.
//!
//! [`ClassBuilder`] produces a [`ClassDef`] from a Rust type, wrapping typed
//! constructors and virtual callbacks into their type-erased forms.
//!
//! ```ignore
//! let def = ClassBuilder::<Player>::new("Player")
//!     .host_base("CharacterBody2D")
//!     .default_constructor()
//!     .virtual_method("_process", |player, ctx| {
//!         let delta: f64 = ctx.next_arg()?;
//!         player.tick(delta);
//!         Ok(())
//!     })
//!     .build();
//! ```

use std::any::{Any, type_name};
use std::marker::PhantomData;

use hostbind_core::{CallContext, NativeError, NativeFn, RawPtr};

use crate::class_registry::{ClassBase, ClassDef, ClassFlags, VirtualTable, constructor, upcast};

/// Builder for the definition of an extension class backed by `T`.
pub struct ClassBuilder<T> {
    def: ClassDef,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send> ClassBuilder<T> {
    /// Start a class deriving from the engine's `Object`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: ClassDef {
                name: name.into(),
                base: ClassBase::Host("Object".to_string()),
                flags: ClassFlags::default(),
                constructor: None,
                virtuals: VirtualTable::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Derive from an engine class.
    pub fn host_base(mut self, name: impl Into<String>) -> Self {
        self.def.base = ClassBase::Host(name.into());
        self
    }

    /// Derive from another extension class whose Rust type `B` is embedded
    /// in `T`.
    pub fn extension_base<B: Any>(mut self, name: impl Into<String>, project: fn(&mut T) -> &mut B) -> Self {
        self.def.base = ClassBase::Extension {
            name: name.into(),
            upcast: upcast(move |any| any.downcast_mut::<T>().map(|this| project(this) as &mut dyn Any)),
        };
        self
    }

    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.def.flags = flags;
        self
    }

    pub fn constructor<F>(self, f: F) -> Self
    where
        F: Fn(RawPtr) -> T + Send + Sync + 'static,
    {
        self.try_constructor(move |host_object| Ok(f(host_object)))
    }

    pub fn try_constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(RawPtr) -> Result<T, NativeError> + Send + Sync + 'static,
    {
        self.def.constructor = Some(constructor(move |host_object| {
            f(host_object).map(|value| Box::new(value) as Box<dyn Any + Send>)
        }));
        self
    }

    pub fn default_constructor(self) -> Self
    where
        T: Default,
    {
        self.constructor(|_| T::default())
    }

    /// Override a virtual method.
    pub fn virtual_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut T, &mut CallContext<'_>) -> Result<(), NativeError> + Send + Sync + 'static,
    {
        let callback = NativeFn::new(name, move |this: &mut dyn Any, ctx: &mut CallContext<'_>| {
            let this = this.downcast_mut::<T>().ok_or_else(|| {
                NativeError::other(format!("instance is not a {}", type_name::<T>()))
            })?;
            f(this, ctx)
        });
        self.def.virtuals.insert(callback);
        self
    }

    pub fn build(self) -> ClassDef {
        self.def
    }
}
