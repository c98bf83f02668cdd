//! Extension callback storage and callable trait.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::NativeError;

use super::CallContext;

/// Type-erased extension callback for a host-invoked virtual method.
///
/// The callable receives the instance (already projected to the class that
/// declared the override) and a [`CallContext`] over the host's frame.
/// Cloning shares the callable.
#[derive(Clone)]
pub struct NativeFn {
    name: Arc<str>,
    inner: Arc<dyn NativeCallable>,
}

impl NativeFn {
    pub fn new<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&mut dyn Any, &mut CallContext<'_>) -> Result<(), NativeError> + Send + Sync + 'static,
    {
        Self::from_callable(name, f)
    }

    /// Wrap any [`NativeCallable`], not just a closure.
    pub fn from_callable<C>(name: impl Into<Arc<str>>, callable: C) -> Self
    where
        C: NativeCallable + 'static,
    {
        Self {
            name: name.into(),
            inner: Arc::new(callable),
        }
    }

    /// Name of the virtual method this callback overrides.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, instance: &mut dyn Any, ctx: &mut CallContext<'_>) -> Result<(), NativeError> {
        self.inner.call(instance, ctx)
    }

    /// Whether two values share the same callable.
    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Trait for extension callbacks.
///
/// Callbacks may run on any thread the host calls from.
pub trait NativeCallable: Send + Sync {
    fn call(&self, instance: &mut dyn Any, ctx: &mut CallContext<'_>) -> Result<(), NativeError>;
}

impl<F> NativeCallable for F
where
    F: Fn(&mut dyn Any, &mut CallContext<'_>) -> Result<(), NativeError> + Send + Sync,
{
    fn call(&self, instance: &mut dyn Any, ctx: &mut CallContext<'_>) -> Result<(), NativeError> {
        (self)(instance, ctx)
    }
}
