//! Routing host virtual calls to extension callbacks.
//!
//! The host calls a virtual method by name on an instance. The override is
//! looked up in the concrete class first, then in each declared extension
//! base class in turn; the instance is projected to the base part at every
//! step so a base override sees the type it was written for. A method no
//! class in the chain overrides is a successful no-op.

use std::any::Any;
use std::sync::{Arc, TryLockError};

use hostbind_core::{CallContext, NativeFn};

use crate::class_registry::{ClassBase, ClassEntry, ClassRegistry, InstanceId};
use crate::error::DispatchError;

/// Outcome of a virtual call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The override declared by `class` ran.
    Called { class: String },
    /// No class in the chain overrides the method.
    NotOverridden,
}

impl Dispatch {
    pub fn was_called(&self) -> bool {
        matches!(self, Dispatch::Called { .. })
    }
}

impl ClassRegistry {
    /// Find the override of `method` visible from `class`, and the class that
    /// declares it.
    pub fn resolve_virtual(&self, class: &str, method: &str) -> Option<(Arc<ClassEntry>, NativeFn)> {
        let mut entry = self.get(class)?;
        loop {
            if let Some(callback) = entry.virtuals().get(method) {
                let callback = callback.clone();
                return Some((entry, callback));
            }
            let base = match entry.base() {
                ClassBase::Extension { name, .. } => self.get(name)?,
                ClassBase::Host(_) => return None,
            };
            entry = base;
        }
    }

    /// Run the override of `method` on an instance.
    ///
    /// Fails with [`DispatchError::InstanceBusy`] when the callback would
    /// re-enter an instance that is already running a call.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_virtual(
        &self,
        id: InstanceId,
        method: &str,
        ctx: &mut CallContext<'_>,
    ) -> Result<Dispatch, DispatchError> {
        let instance = self
            .lock_instances()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DispatchError::UnknownInstance(id))?;

        let mut data = match instance.data.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(DispatchError::InstanceBusy(id)),
        };

        let mut entry = Arc::clone(&instance.class);
        let mut current: &mut dyn Any = &mut **data;
        loop {
            if let Some(callback) = entry.virtuals().get(method) {
                log::trace!("dispatching {}::{method} on {id:?}", entry.name());
                if let Err(err) = callback.call(current, ctx) {
                    // The host ignores the return area of a failed call.
                    ctx.discard_return();
                    return Err(err.into());
                }
                return Ok(Dispatch::Called {
                    class: entry.name().to_string(),
                });
            }

            let (base_name, upcast) = match entry.base() {
                ClassBase::Extension { name, upcast } => (name.clone(), Arc::clone(upcast)),
                ClassBase::Host(_) => break,
            };
            let base = match self.get(&base_name) {
                Some(base) => base,
                None => {
                    log::warn!("virtual {method} on {id:?}: base class {base_name} is gone");
                    return Err(DispatchError::UnknownClass(base_name));
                }
            };
            current = upcast(current).ok_or_else(|| DispatchError::Projection {
                class: entry.name().to_string(),
                base: base_name.clone(),
            })?;
            entry = base;
        }

        log::trace!("virtual {method} not overridden for {}", instance.class.name());
        Ok(Dispatch::NotOverridden)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::class_registry::{Constructor, Upcast, VirtualTable, constructor, upcast};
    use hostbind_core::stub::StubHost;
    use hostbind_core::{NativeError, RawPtr};

    #[derive(Default)]
    struct Enemy {
        health: i64,
    }

    #[derive(Default)]
    struct Boss {
        base: Enemy,
        phase: i64,
    }

    fn enemy_ctor() -> Constructor {
        constructor(|_| Ok(Box::new(Enemy { health: 10 })))
    }

    fn boss_ctor() -> Constructor {
        constructor(|_| {
            Ok(Box::new(Boss {
                base: Enemy { health: 100 },
                phase: 1,
            }))
        })
    }

    fn boss_upcast() -> Upcast {
        upcast(|any| {
            any.downcast_mut::<Boss>()
                .map(|boss| &mut boss.base as &mut dyn Any)
        })
    }

    fn take_damage() -> NativeFn {
        NativeFn::new("_take_damage", |this: &mut dyn Any, ctx: &mut CallContext<'_>| {
            let amount: i64 = ctx.next_arg()?;
            let enemy = this
                .downcast_mut::<Enemy>()
                .ok_or_else(|| NativeError::other("not an Enemy"))?;
            enemy.health -= amount;
            ctx.set_return(&enemy.health)?;
            Ok(())
        })
    }

    fn setup() -> ClassRegistry {
        let registry = ClassRegistry::new();
        registry
            .register_class(
                "Enemy",
                ClassBase::Host("Node".into()),
                Some(enemy_ctor()),
                VirtualTable::new().with(take_damage()),
            )
            .unwrap();
        registry
    }

    #[test]
    fn override_runs_once_and_unknown_method_is_noop() {
        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = setup();
        let id = registry.construct("Enemy", RawPtr::from_word(0x1000)).unwrap();

        let args = [3u64];
        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &args, &mut ret);
        let outcome = registry.call_virtual(id, "_take_damage", &mut ctx).unwrap();
        assert_eq!(outcome, Dispatch::Called { class: "Enemy".into() });
        assert_eq!(ret[0] as i64, 7);
        assert_eq!(registry.with_instance(id, |e: &mut Enemy| e.health), Some(7));

        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        let outcome = registry.call_virtual(id, "_process", &mut ctx).unwrap();
        assert_eq!(outcome, Dispatch::NotOverridden);
        assert_eq!(ret, [0; 3]);
        assert_eq!(registry.with_instance(id, |e: &mut Enemy| e.health), Some(7));
    }

    #[test]
    fn base_override_sees_projected_instance() {
        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = setup();
        let phase_calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&phase_calls);
        registry
            .register_class(
                "Boss",
                ClassBase::Extension {
                    name: "Enemy".into(),
                    upcast: boss_upcast(),
                },
                Some(boss_ctor()),
                VirtualTable::new().with(NativeFn::new(
                    "_enter_phase",
                    move |this: &mut dyn Any, _ctx: &mut CallContext<'_>| {
                        let boss = this
                            .downcast_mut::<Boss>()
                            .ok_or_else(|| NativeError::other("not a Boss"))?;
                        boss.phase += 1;
                        *counter.lock().unwrap() += 1;
                        Ok(())
                    },
                )),
            )
            .unwrap();
        let id = registry.construct("Boss", RawPtr::from_word(0x2000)).unwrap();

        let args = [25u64];
        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &args, &mut ret);
        let outcome = registry.call_virtual(id, "_take_damage", &mut ctx).unwrap();
        assert_eq!(outcome, Dispatch::Called { class: "Enemy".into() });
        assert_eq!(ret[0] as i64, 75);

        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        assert!(registry.call_virtual(id, "_enter_phase", &mut ctx).unwrap().was_called());
        assert_eq!(*phase_calls.lock().unwrap(), 1);
        assert_eq!(
            registry.with_instance(id, |b: &mut Boss| (b.base.health, b.phase)),
            Some((75, 2))
        );
    }

    #[test]
    fn resolve_virtual_walks_the_base_chain() {
        let registry = setup();
        registry
            .register_class(
                "Boss",
                ClassBase::Extension {
                    name: "Enemy".into(),
                    upcast: boss_upcast(),
                },
                Some(boss_ctor()),
                VirtualTable::new(),
            )
            .unwrap();
        let (declaring, callback) = registry.resolve_virtual("Boss", "_take_damage").unwrap();
        assert_eq!(declaring.name(), "Enemy");
        assert_eq!(callback.name(), "_take_damage");
        assert!(registry.resolve_virtual("Boss", "_ready").is_none());
    }

    #[test]
    fn callback_errors_and_unknown_instances_are_reported() {
        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = setup();
        let id = registry.construct("Enemy", RawPtr::from_word(0x3000)).unwrap();

        // No argument supplied for `amount`.
        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        let err = registry.call_virtual(id, "_take_damage", &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Native(NativeError::ArgumentsExhausted { index: 0, .. })
        ));

        registry.free_instance(id);
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        let err = registry.call_virtual(id, "_take_damage", &mut ctx).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownInstance(i) if i == id));
    }

    #[test]
    fn instances_dispatch_concurrently_from_many_threads() {
        const THREADS: usize = 8;
        const HITS: i64 = 50;

        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = setup();
        let ids: Vec<InstanceId> = (0..THREADS)
            .map(|i| {
                registry
                    .construct("Enemy", RawPtr::from_word(0x8000 + i as u64 * 0x10))
                    .unwrap()
            })
            .collect();

        std::thread::scope(|s| {
            for &id in &ids {
                let (registry, handles) = (&registry, &handles);
                s.spawn(move || {
                    for _ in 0..HITS {
                        let args = [1u64];
                        let mut ret = [0u64; 3];
                        let mut ctx = CallContext::new(handles, &args, &mut ret);
                        let outcome = registry.call_virtual(id, "_take_damage", &mut ctx).unwrap();
                        assert!(outcome.was_called());
                    }
                });
            }
        });

        for id in ids {
            assert_eq!(registry.with_instance(id, |e: &mut Enemy| e.health), Some(10 - HITS));
        }
    }

    #[test]
    fn failed_callback_takes_back_its_return_value() {
        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = ClassRegistry::new();
        registry
            .register_class(
                "Enemy",
                ClassBase::Host("Node".into()),
                Some(enemy_ctor()),
                VirtualTable::new().with(NativeFn::new(
                    "_describe",
                    |_this: &mut dyn Any, ctx: &mut CallContext<'_>| {
                        ctx.set_return("half written")?;
                        Err(NativeError::other("description failed"))
                    },
                )),
            )
            .unwrap();
        let id = registry.construct("Enemy", RawPtr::from_word(0x5000)).unwrap();

        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        let err = registry.call_virtual(id, "_describe", &mut ctx).unwrap_err();
        assert!(matches!(err, DispatchError::Native(NativeError::Other { .. })));
        assert!(!ctx.has_return());
        assert_eq!(ret, [0; 3]);
        assert_eq!(stub.live_buffers(), 0);
    }

    #[test]
    fn reentrant_call_on_same_instance_is_busy() {
        let stub = StubHost::new();
        let handles = stub.registry();
        let registry = Arc::new(ClassRegistry::new());
        let inner = Arc::downgrade(&registry);
        let seen = Arc::new(Mutex::new(None));
        let seen_inner = Arc::clone(&seen);
        let handles_inner = stub.registry();
        registry
            .register_class(
                "Looper",
                ClassBase::Host("Node".into()),
                Some(enemy_ctor()),
                VirtualTable::new().with(NativeFn::new(
                    "_process",
                    move |_this: &mut dyn Any, _ctx: &mut CallContext<'_>| {
                        let registry = inner.upgrade().ok_or_else(|| NativeError::other("gone"))?;
                        let id = registry
                            .instance_for(RawPtr::from_word(0x4000))
                            .ok_or_else(|| NativeError::other("unbound"))?;
                        let mut ret = [0u64; 3];
                        let mut nested = CallContext::new(&handles_inner, &[], &mut ret);
                        let result = registry.call_virtual(id, "_process", &mut nested);
                        *seen_inner.lock().unwrap() = Some(matches!(result, Err(DispatchError::InstanceBusy(_))));
                        Ok(())
                    },
                )),
            )
            .unwrap();
        let id = registry.construct("Looper", RawPtr::from_word(0x4000)).unwrap();

        let mut ret = [0u64; 3];
        let mut ctx = CallContext::new(&handles, &[], &mut ret);
        registry.call_virtual(id, "_process", &mut ctx).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
