//! Handles to host objects and engine buffers.
//!
//! The host and the extension follow different lifetime rules for different
//! categories of object, so a handle always carries its kind explicitly:
//!
//! | Handle        | Kind          | Responsibility            | Released by            |
//! |---------------|---------------|---------------------------|------------------------|
//! | [`Shared`]    | ref-counted   | one engine reference      | `ref_decrement`        |
//! | [`Owned`]     | manual        | sole owner of the object  | `object_destroy`       |
//! | [`Borrowed`]  | any           | none                      | nothing                |
//! | [`Transient`] | engine buffer | one buffer reference      | `buffer_unreference`   |
//!
//! Owning handles release on drop. Each carries a consumed flag so the release
//! path runs at most once; [`HandleRegistry`] additionally keeps an ownership
//! ledger (when checks are enabled) that catches double releases coming from
//! raw pointers and borrows that outlived an extension-side release.

mod ledger;
mod registry;

use std::fmt;

pub use registry::HandleRegistry;

use crate::RawPtr;
use crate::error::{HandleError, HandleResult};

/// Lifetime category of a host-side allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Shared engine object released through decrements.
    RefCounted,
    /// Engine object with exactly one owner, released by an explicit destroy.
    Manual,
    /// Engine buffer backing a string, array or transform for one call.
    Transient,
}

/// The side responsible for releasing an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Extension,
    Host,
}

/// Report an ownership violation found on an implicit release path.
///
/// Drops cannot return errors, so violations are logged and, in debug builds,
/// turned into a panic unless the thread is already unwinding.
pub(crate) fn report_violation(err: &HandleError) {
    log::error!("ownership violation: {err}");
    if cfg!(debug_assertions) && !std::thread::panicking() {
        panic!("ownership violation: {err}");
    }
}

// ============================================================================
// Shared
// ============================================================================

/// One extension-held reference to a ref-counted engine object.
///
/// Cloning takes another engine reference.
pub struct Shared {
    raw: RawPtr,
    registry: HandleRegistry,
    epoch: u64,
    consumed: bool,
}

impl Shared {
    pub(crate) fn new(raw: RawPtr, registry: HandleRegistry) -> Self {
        Self {
            raw,
            epoch: registry.epoch(),
            registry,
            consumed: false,
        }
    }

    pub fn raw(&self) -> RawPtr {
        self.raw
    }

    /// Drop this reference now and report violations instead of panicking.
    pub fn release(mut self) -> HandleResult<()> {
        self.release_once()
    }

    pub fn as_borrowed(&self) -> Borrowed {
        Borrowed::new(self.raw, HandleKind::RefCounted, self.epoch)
    }

    /// Hand this reference to the host without decrementing.
    pub fn into_raw(mut self) -> HandleResult<RawPtr> {
        self.consumed = true;
        self.registry.forget(self.raw, HandleKind::RefCounted)?;
        Ok(self.raw)
    }

    fn release_once(&mut self) -> HandleResult<()> {
        if self.consumed {
            return Err(HandleError::DoubleRelease {
                addr: self.raw.addr(),
            });
        }
        self.consumed = true;
        self.registry.release_raw(self.raw, HandleKind::RefCounted)
    }
}

impl Clone for Shared {
    fn clone(&self) -> Self {
        if let Err(err) = self.registry.retain(self.raw, HandleKind::RefCounted) {
            report_violation(&err);
        }
        Shared::new(self.raw, self.registry.clone())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.consumed
            && let Err(err) = self.release_once()
        {
            report_violation(&err);
        }
    }
}

impl PartialEq for Shared {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&self.raw).finish()
    }
}

// ============================================================================
// Owned
// ============================================================================

/// Sole ownership of a manually-managed engine object.
pub struct Owned {
    raw: RawPtr,
    registry: HandleRegistry,
    epoch: u64,
    consumed: bool,
}

impl Owned {
    pub(crate) fn new(raw: RawPtr, registry: HandleRegistry) -> Self {
        Self {
            raw,
            epoch: registry.epoch(),
            registry,
            consumed: false,
        }
    }

    pub fn raw(&self) -> RawPtr {
        self.raw
    }

    /// Destroy the object now.
    pub fn release(mut self) -> HandleResult<()> {
        self.release_once()
    }

    /// Make the host responsible for destroying the object.
    pub fn transfer_to_host(mut self) -> HandleResult<RawPtr> {
        self.consumed = true;
        self.registry.forget(self.raw, HandleKind::Manual)?;
        log::trace!("ownership of {:?} moved to host", self.raw);
        Ok(self.raw)
    }

    /// A non-owning view for passing the object into a call.
    pub fn as_borrowed(&self) -> Borrowed {
        Borrowed::new(self.raw, HandleKind::Manual, self.epoch)
    }

    fn release_once(&mut self) -> HandleResult<()> {
        if self.consumed {
            return Err(HandleError::DoubleRelease {
                addr: self.raw.addr(),
            });
        }
        self.consumed = true;
        self.registry.release_raw(self.raw, HandleKind::Manual)
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        if !self.consumed
            && let Err(err) = self.release_once()
        {
            report_violation(&err);
        }
    }
}

impl fmt::Debug for Owned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.raw).finish()
    }
}

// ============================================================================
// Borrowed
// ============================================================================

/// A pointer the extension may use but never releases.
///
/// Remembers the ledger epoch it was created in, so a borrow that outlived an
/// extension-side release is caught even if the host reused the address.
/// Equality ignores the epoch.
#[derive(Debug, Clone, Copy)]
pub struct Borrowed {
    raw: RawPtr,
    kind: HandleKind,
    epoch: u64,
}

impl Borrowed {
    pub(crate) fn new(raw: RawPtr, kind: HandleKind, epoch: u64) -> Self {
        Self { raw, kind, epoch }
    }

    pub fn raw(&self) -> RawPtr {
        self.raw
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl PartialEq for Borrowed {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.kind == other.kind
    }
}

impl Eq for Borrowed {}

impl std::hash::Hash for Borrowed {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
        self.kind.hash(state);
    }
}

// ============================================================================
// Transient
// ============================================================================

/// One reference to an engine buffer (string, packed array, array, transform).
pub struct Transient {
    raw: RawPtr,
    registry: HandleRegistry,
    epoch: u64,
    consumed: bool,
}

impl Transient {
    pub(crate) fn new(raw: RawPtr, registry: HandleRegistry) -> Self {
        Self {
            raw,
            epoch: registry.epoch(),
            registry,
            consumed: false,
        }
    }

    pub fn raw(&self) -> RawPtr {
        self.raw
    }

    pub fn release(mut self) -> HandleResult<()> {
        self.release_once()
    }

    /// Give this buffer reference to the host.
    pub fn into_raw(mut self) -> HandleResult<RawPtr> {
        self.consumed = true;
        self.registry.forget(self.raw, HandleKind::Transient)?;
        Ok(self.raw)
    }

    fn release_once(&mut self) -> HandleResult<()> {
        if self.consumed {
            return Err(HandleError::DoubleRelease {
                addr: self.raw.addr(),
            });
        }
        self.consumed = true;
        self.registry.release_raw(self.raw, HandleKind::Transient)
    }
}

impl Clone for Transient {
    fn clone(&self) -> Self {
        if let Err(err) = self.registry.retain(self.raw, HandleKind::Transient) {
            report_violation(&err);
        }
        Transient::new(self.raw, self.registry.clone())
    }
}

impl Drop for Transient {
    fn drop(&mut self) {
        if !self.consumed
            && let Err(err) = self.release_once()
        {
            report_violation(&err);
        }
    }
}

impl fmt::Debug for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transient").field(&self.raw).finish()
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Any handle, tagged with its ownership category.
#[derive(Debug)]
pub enum Handle {
    Shared(Shared),
    Owned(Owned),
    Borrowed(Borrowed),
    Transient(Transient),
}

impl Handle {
    /// The raw pointer, without affecting any count.
    pub fn raw(&self) -> RawPtr {
        match self {
            Handle::Shared(h) => h.raw(),
            Handle::Owned(h) => h.raw(),
            Handle::Borrowed(h) => h.raw(),
            Handle::Transient(h) => h.raw(),
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            Handle::Shared(_) => HandleKind::RefCounted,
            Handle::Owned(_) => HandleKind::Manual,
            Handle::Borrowed(h) => h.kind(),
            Handle::Transient(_) => HandleKind::Transient,
        }
    }

    /// The side that must release the allocation behind this handle.
    pub fn owner(&self) -> Owner {
        match self {
            Handle::Borrowed(_) => Owner::Host,
            _ => Owner::Extension,
        }
    }

    /// Release whatever responsibility this handle carries.
    pub fn release(self) -> HandleResult<()> {
        match self {
            Handle::Shared(h) => h.release(),
            Handle::Owned(h) => h.release(),
            Handle::Borrowed(_) => Ok(()),
            Handle::Transient(h) => h.release(),
        }
    }

    pub fn as_borrowed(&self) -> Borrowed {
        Borrowed::new(self.raw(), self.kind(), self.epoch())
    }

    /// Ledger epoch the handle was created in.
    pub(crate) fn epoch(&self) -> u64 {
        match self {
            Handle::Shared(h) => h.epoch,
            Handle::Owned(h) => h.epoch,
            Handle::Borrowed(h) => h.epoch,
            Handle::Transient(h) => h.epoch,
        }
    }

    pub fn into_shared(self) -> HandleResult<Shared> {
        match self {
            Handle::Shared(h) => Ok(h),
            other => Err(HandleError::WrongKind {
                expected: HandleKind::RefCounted,
                actual: other.kind(),
            }),
        }
    }

    pub fn into_owned(self) -> HandleResult<Owned> {
        match self {
            Handle::Owned(h) => Ok(h),
            other => Err(HandleError::WrongKind {
                expected: HandleKind::Manual,
                actual: other.kind(),
            }),
        }
    }

    pub fn into_transient(self) -> HandleResult<Transient> {
        match self {
            Handle::Transient(h) => Ok(h),
            other => Err(HandleError::WrongKind {
                expected: HandleKind::Transient,
                actual: other.kind(),
            }),
        }
    }
}

impl From<Shared> for Handle {
    fn from(h: Shared) -> Self {
        Handle::Shared(h)
    }
}

impl From<Owned> for Handle {
    fn from(h: Owned) -> Self {
        Handle::Owned(h)
    }
}

impl From<Borrowed> for Handle {
    fn from(h: Borrowed) -> Self {
        Handle::Borrowed(h)
    }
}

impl From<Transient> for Handle {
    fn from(h: Transient) -> Self {
        Handle::Transient(h)
    }
}

// ============================================================================
// ObjectRef
// ============================================================================

/// An object reference that can sit inside a variant.
///
/// Variants never own manually-managed objects, so only shared references and
/// borrows are representable.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Shared(Shared),
    Borrowed(Borrowed),
}

impl ObjectRef {
    pub fn raw(&self) -> RawPtr {
        match self {
            ObjectRef::Shared(h) => h.raw(),
            ObjectRef::Borrowed(h) => h.raw(),
        }
    }

    pub fn is_ref_counted(&self) -> bool {
        match self {
            ObjectRef::Shared(_) => true,
            ObjectRef::Borrowed(h) => h.kind() == HandleKind::RefCounted,
        }
    }
}

impl From<ObjectRef> for Handle {
    fn from(obj: ObjectRef) -> Self {
        match obj {
            ObjectRef::Shared(h) => Handle::Shared(h),
            ObjectRef::Borrowed(h) => Handle::Borrowed(h),
        }
    }
}

impl From<Shared> for ObjectRef {
    fn from(h: Shared) -> Self {
        ObjectRef::Shared(h)
    }
}

impl From<Borrowed> for ObjectRef {
    fn from(h: Borrowed) -> Self {
        ObjectRef::Borrowed(h)
    }
}
