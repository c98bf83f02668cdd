//! The handle registry.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ledger::Ledger;
use super::{Borrowed, Handle, HandleKind, Owned, Shared, Transient};
use crate::RawPtr;
use crate::error::{HandleError, HandleResult};
use crate::host::HostApi;
use crate::variant::BufferKind;

/// Wraps raw host pointers into handles and routes releases to the host.
///
/// Cloning is cheap; every clone talks to the same host table and ledger.
/// Handles keep a clone so they can release themselves on drop.
#[derive(Clone)]
pub struct HandleRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    host: HostApi,
    ledger: Option<Mutex<Ledger>>,
}

impl HandleRegistry {
    /// Create a registry; ownership checks follow the build profile.
    ///
    /// Checks are on in debug builds and when the `ownership-checks` feature
    /// is enabled.
    pub fn new(host: HostApi) -> Self {
        Self::with_ownership_checks(
            host,
            cfg!(debug_assertions) || cfg!(feature = "ownership-checks"),
        )
    }

    pub fn with_ownership_checks(host: HostApi, enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                ledger: enabled.then(|| Mutex::new(Ledger::default())),
            }),
        }
    }

    pub fn host(&self) -> &HostApi {
        &self.inner.host
    }

    pub fn ownership_checks(&self) -> bool {
        self.inner.ledger.is_some()
    }

    fn ledger(&self) -> Option<MutexGuard<'_, Ledger>> {
        self.inner
            .ledger
            .as_ref()
            .map(|ledger| ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    // ==========================================================================
    // Acquisition
    // ==========================================================================

    /// Take new responsibility for `raw`.
    ///
    /// Ref-counted objects and buffers get an engine reference; a
    /// manually-managed object becomes owned by the extension.
    pub fn acquire(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<Handle> {
        if raw.is_null() {
            return Err(HandleError::Null { kind });
        }
        self.retain(raw, kind)?;
        Ok(self.wrap(raw, kind))
    }

    /// Like [`acquire`](Self::acquire) for call sites where null is legal.
    pub fn acquire_nullable(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<Option<Handle>> {
        if raw.is_null() {
            return Ok(None);
        }
        self.acquire(raw, kind).map(Some)
    }

    /// Accept responsibility the host already transferred, without taking a
    /// new engine reference.
    pub fn adopt(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<Handle> {
        if raw.is_null() {
            return Err(HandleError::Null { kind });
        }
        if let Some(mut ledger) = self.ledger() {
            ledger.take(raw.addr(), kind)?;
        }
        Ok(self.wrap(raw, kind))
    }

    /// A non-owning handle on a pointer the host just handed over.
    ///
    /// The host vouches for the pointer, so an address the extension saw
    /// freed earlier is accepted: hosts reuse addresses.
    pub fn borrowed(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<Borrowed> {
        if raw.is_null() {
            return Err(HandleError::Null { kind });
        }
        Ok(Borrowed::new(raw, kind, self.epoch()))
    }

    /// Construct a host object of `class`; the extension becomes responsible
    /// for the reference (or ownership) the host returns.
    pub fn construct(&self, class: &str, kind: HandleKind) -> HandleResult<Handle> {
        if kind == HandleKind::Transient {
            return Err(HandleError::WrongKind {
                expected: HandleKind::Manual,
                actual: kind,
            });
        }
        let raw = self.host().object_construct(class);
        log::trace!("constructed {class} at {raw:?}");
        self.adopt(raw, kind)
    }

    /// Allocate an engine buffer holding `data`.
    pub fn new_buffer(&self, kind: BufferKind, data: &[u8]) -> HandleResult<Transient> {
        let raw = self.host().buffer_new(kind as u32, data);
        self.adopt(raw, HandleKind::Transient)?.into_transient()
    }

    /// Allocate an empty engine variant array.
    pub fn new_array(&self) -> HandleResult<Transient> {
        let raw = self.host().array_new();
        self.adopt(raw, HandleKind::Transient)?.into_transient()
    }

    // ==========================================================================
    // Release / Borrow
    // ==========================================================================

    /// Release a handle. Equivalent to [`Handle::release`].
    pub fn release(&self, handle: Handle) -> HandleResult<()> {
        handle.release()
    }

    /// The raw pointer for a call frame. No count changes.
    pub fn borrow(&self, handle: &Handle) -> RawPtr {
        handle.raw()
    }

    /// Like [`borrow`](Self::borrow), but reports use after release: the
    /// extension freed the allocation after `handle` was created.
    pub fn checked_borrow(&self, handle: &Handle) -> HandleResult<RawPtr> {
        self.check_live(handle.raw(), handle.epoch())?;
        Ok(handle.raw())
    }

    /// [`checked_borrow`](Self::checked_borrow) for a bare borrow.
    pub fn check_borrowed(&self, borrowed: &Borrowed) -> HandleResult<RawPtr> {
        self.check_live(borrowed.raw(), borrowed.epoch())?;
        Ok(borrowed.raw())
    }

    /// References (or ownership) the extension holds on `raw`.
    ///
    /// `None` when ownership checks are disabled.
    pub fn held(&self, raw: RawPtr) -> Option<u32> {
        self.ledger().map(|ledger| ledger.held(raw.addr()))
    }

    // ==========================================================================
    // Internal
    // ==========================================================================

    /// Current ledger epoch; 0 when checks are off.
    pub(crate) fn epoch(&self) -> u64 {
        self.ledger().map_or(0, |ledger| ledger.epoch())
    }

    fn check_live(&self, raw: RawPtr, epoch: u64) -> HandleResult<()> {
        match self.ledger() {
            Some(ledger) => ledger.check_live(raw.addr(), epoch),
            None => Ok(()),
        }
    }

    fn wrap(&self, raw: RawPtr, kind: HandleKind) -> Handle {
        match kind {
            HandleKind::RefCounted => Handle::Shared(Shared::new(raw, self.clone())),
            HandleKind::Manual => Handle::Owned(Owned::new(raw, self.clone())),
            HandleKind::Transient => Handle::Transient(Transient::new(raw, self.clone())),
        }
    }

    /// Take one more unit of responsibility on a live pointer.
    pub(crate) fn retain(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<()> {
        if let Some(mut ledger) = self.ledger() {
            ledger.take(raw.addr(), kind)?;
        }
        match kind {
            HandleKind::RefCounted => {
                self.host().ref_increment(raw);
            }
            HandleKind::Transient => {
                self.host().buffer_reference(raw);
            }
            HandleKind::Manual => {}
        }
        Ok(())
    }

    /// Give up one unit of responsibility and tell the host.
    ///
    /// The ledger is consulted first so a violation never reaches the host.
    pub(crate) fn release_raw(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<()> {
        if let Some(mut ledger) = self.ledger() {
            ledger.give_up(raw.addr(), kind)?;
        }

        // The ledger lock is not held here: host releases can re-enter the
        // extension (instance teardown).
        let freed = match kind {
            HandleKind::RefCounted => self.host().ref_decrement(raw) == 0,
            HandleKind::Manual => {
                self.host().object_destroy(raw);
                true
            }
            HandleKind::Transient => self.host().buffer_unreference(raw) == 0,
        };

        if freed {
            log::trace!("{kind:?} allocation {raw:?} freed");
            if let Some(mut ledger) = self.ledger() {
                ledger.retire(raw.addr());
            }
        }
        Ok(())
    }

    /// Give up responsibility without telling the host (ownership transfer).
    pub(crate) fn forget(&self, raw: RawPtr, kind: HandleKind) -> HandleResult<()> {
        if let Some(mut ledger) = self.ledger() {
            ledger.give_up(raw.addr(), kind)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("host", &self.inner.host)
            .field("ownership_checks", &self.ownership_checks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubHost;

    #[test]
    fn acquire_then_release_is_net_zero_for_ref_counted() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_ref_counted("Resource");

        let handle = registry.acquire(obj, HandleKind::RefCounted).unwrap();
        assert_eq!(stub.ref_count(obj), Some(2));
        handle.release().unwrap();

        assert_eq!(stub.ref_count(obj), Some(1));
        assert_eq!(stub.destroy_calls(obj), 0);
    }

    #[test]
    fn acquire_then_release_destroys_manual_once() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_manual("Node");

        let handle = registry.acquire(obj, HandleKind::Manual).unwrap();
        assert_eq!(handle.owner(), super::super::Owner::Extension);
        handle.release().unwrap();

        assert_eq!(stub.destroy_calls(obj), 1);
        assert!(!stub.is_alive(obj));
    }

    #[test]
    fn null_is_rejected_unless_nullable() {
        let stub = StubHost::new();
        let registry = stub.registry();

        let err = registry.acquire(RawPtr::null(), HandleKind::Manual).unwrap_err();
        assert_eq!(err, HandleError::Null { kind: HandleKind::Manual });

        let none = registry
            .acquire_nullable(RawPtr::null(), HandleKind::RefCounted)
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn second_owner_of_manual_object_is_rejected() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_manual("Node");

        let first = registry.acquire(obj, HandleKind::Manual).unwrap();
        let err = registry.acquire(obj, HandleKind::Manual).unwrap_err();
        assert_eq!(err, HandleError::AlreadyOwned { addr: obj.addr() });

        first.release().unwrap();
        assert_eq!(stub.destroy_calls(obj), 1);
    }

    #[test]
    fn transfer_to_host_skips_destroy() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_manual("Node");

        let owned = registry.acquire(obj, HandleKind::Manual).unwrap().into_owned().unwrap();
        let raw = owned.transfer_to_host().unwrap();

        assert_eq!(raw, obj);
        assert_eq!(stub.destroy_calls(obj), 0);
        assert_eq!(registry.held(obj), Some(0));
    }

    #[test]
    fn borrow_outliving_a_destroy_is_use_after_release() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_manual("Node");

        let owned = registry.acquire(obj, HandleKind::Manual).unwrap();
        let stale = owned.as_borrowed();
        owned.release().unwrap();

        let err = registry.check_borrowed(&stale).unwrap_err();
        assert_eq!(err, HandleError::UseAfterRelease { addr: obj.addr() });
        let err = registry.checked_borrow(&Handle::Borrowed(stale)).unwrap_err();
        assert_eq!(err, HandleError::UseAfterRelease { addr: obj.addr() });
    }

    #[test]
    fn reused_address_is_a_live_object() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_manual("Node");

        registry.acquire(obj, HandleKind::Manual).unwrap().release().unwrap();
        let reused = stub.respawn_manual(obj, "Sprite2D");
        assert_eq!(reused, obj);

        let borrowed = registry.borrowed(obj, HandleKind::Manual).unwrap();
        assert_eq!(registry.check_borrowed(&borrowed), Ok(obj));

        let owned = registry.acquire(obj, HandleKind::Manual).unwrap();
        assert_eq!(registry.checked_borrow(&owned), Ok(obj));
        owned.release().unwrap();
        assert_eq!(stub.destroy_calls(obj), 2);
    }

    #[test]
    fn adopting_unowned_raw_then_releasing_twice_is_caught() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let obj = stub.spawn_ref_counted("Resource");

        let handle = registry.adopt(obj, HandleKind::RefCounted).unwrap();
        handle.release().unwrap();
        assert_eq!(stub.destroy_calls(obj), 1);

        // A second release through the raw path never reaches the host.
        let err = registry.release_raw(obj, HandleKind::RefCounted).unwrap_err();
        assert_eq!(err, HandleError::DoubleRelease { addr: obj.addr() });
        assert_eq!(stub.destroy_calls(obj), 1);
    }

    #[test]
    fn constructed_ref_counted_object_starts_owned_by_caller() {
        let stub = StubHost::new();
        let registry = stub.registry();

        let handle = registry.construct("Resource", HandleKind::RefCounted).unwrap();
        let raw = handle.raw();
        assert_eq!(stub.ref_count(raw), Some(1));

        drop(handle);
        assert_eq!(stub.destroy_calls(raw), 1);
    }

    #[test]
    fn checks_can_be_disabled() {
        let stub = StubHost::new();
        let registry = HandleRegistry::with_ownership_checks(stub.api(), false);
        assert!(!registry.ownership_checks());
        assert_eq!(registry.held(RawPtr::from_word(0x10)), None);
    }
}
