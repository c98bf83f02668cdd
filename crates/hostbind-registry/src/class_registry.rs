//! Extension classes and their instances.
//!
//! A class goes through three states:
//!
//! ```text
//! Unregistered --register_class--> Registered --construct--> Instance-bound
//!      ^                              |   ^                        |
//!      +-------unregister_class-------+   +------free_instance-----+
//! ```
//!
//! Registration is once per name. Each construction binds one Rust instance
//! to one host object; the host refers to it by [`InstanceId`] afterwards.
//! The virtual table captured at registration is never mutated.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use hostbind_core::{NativeError, NativeFn, RawPtr};

use crate::error::{RegistrationError, RegistrationResult};

bitflags! {
    /// Class registration flags, passed to the host unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        /// Cannot be instantiated.
        const ABSTRACT = 1 << 0;
        /// Visible to the engine's editor and scripting.
        const EXPOSED = 1 << 1;
        /// Also runs inside the editor.
        const TOOL = 1 << 2;
        /// Only instantiated at runtime, never in the editor.
        const RUNTIME = 1 << 3;
    }
}

impl Default for ClassFlags {
    fn default() -> Self {
        ClassFlags::EXPOSED
    }
}

/// Identifier the host uses for an extension instance. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

/// Builds the Rust instance for a new host object.
pub type Constructor =
    Arc<dyn Fn(RawPtr) -> Result<Box<dyn Any + Send>, NativeError> + Send + Sync>;

/// Projects an instance onto its extension base class part.
pub type Upcast =
    Arc<dyn for<'a> Fn(&'a mut dyn Any) -> Option<&'a mut dyn Any> + Send + Sync>;

/// Wrap a constructor closure.
pub fn constructor<F>(f: F) -> Constructor
where
    F: Fn(RawPtr) -> Result<Box<dyn Any + Send>, NativeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a projection closure.
pub fn upcast<F>(f: F) -> Upcast
where
    F: for<'a> Fn(&'a mut dyn Any) -> Option<&'a mut dyn Any> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The class a registered class derives from.
#[derive(Clone)]
pub enum ClassBase {
    /// An engine class.
    Host(String),
    /// Another extension class, with the projection from the derived
    /// instance to the base instance.
    Extension { name: String, upcast: Upcast },
}

impl ClassBase {
    pub fn name(&self) -> &str {
        match self {
            ClassBase::Host(name) => name,
            ClassBase::Extension { name, .. } => name,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, ClassBase::Extension { .. })
    }
}

impl fmt::Debug for ClassBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassBase::Host(name) => f.debug_tuple("Host").field(name).finish(),
            ClassBase::Extension { name, .. } => f.debug_tuple("Extension").field(name).finish(),
        }
    }
}

/// Virtual method overrides of one class, by name.
#[derive(Debug, Clone, Default)]
pub struct VirtualTable {
    methods: FxHashMap<String, NativeFn>,
}

impl VirtualTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an override; a later insert of the same name replaces it.
    pub fn insert(&mut self, callback: NativeFn) {
        self.methods.insert(callback.name().to_string(), callback);
    }

    pub fn with(mut self, callback: NativeFn) -> Self {
        self.insert(callback);
        self
    }

    pub fn get(&self, name: &str) -> Option<&NativeFn> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Everything needed to register one class.
#[derive(Clone)]
pub struct ClassDef {
    pub name: String,
    pub base: ClassBase,
    pub flags: ClassFlags,
    pub constructor: Option<Constructor>,
    pub virtuals: VirtualTable,
}

/// A registered class.
pub struct ClassEntry {
    name: String,
    base: ClassBase,
    flags: ClassFlags,
    constructor: Option<Constructor>,
    virtuals: VirtualTable,
}

impl ClassEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &ClassBase {
        &self.base
    }

    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    pub fn virtuals(&self) -> &VirtualTable {
        &self.virtuals
    }

    pub fn is_instantiable(&self) -> bool {
        !self.flags.contains(ClassFlags::ABSTRACT) && self.constructor.is_some()
    }
}

impl fmt::Debug for ClassEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassEntry")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("flags", &self.flags)
            .field("virtuals", &self.virtuals.len())
            .finish()
    }
}

/// A live extension instance.
pub(crate) struct Instance {
    pub(crate) class: Arc<ClassEntry>,
    pub(crate) host_object: RawPtr,
    pub(crate) data: Mutex<Box<dyn Any + Send>>,
}

#[derive(Default)]
pub(crate) struct Instances {
    pub(crate) by_id: FxHashMap<InstanceId, Arc<Instance>>,
    by_object: FxHashMap<usize, InstanceId>,
}

/// Registered extension classes and their live instances.
///
/// Safe to share between threads; the host may construct and free
/// instances from any thread.
pub struct ClassRegistry {
    classes: RwLock<FxHashMap<String, Arc<ClassEntry>>>,
    instances: Mutex<Instances>,
    next_instance: AtomicU64,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(FxHashMap::default()),
            instances: Mutex::new(Instances::default()),
            next_instance: AtomicU64::new(1),
        }
    }

    pub(crate) fn lock_instances(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==========================================================================
    // Classes
    // ==========================================================================

    /// Register a class with default flags.
    pub fn register_class(
        &self,
        name: impl Into<String>,
        base: ClassBase,
        constructor: Option<Constructor>,
        virtuals: VirtualTable,
    ) -> RegistrationResult<Arc<ClassEntry>> {
        self.register(ClassDef {
            name: name.into(),
            base,
            flags: ClassFlags::default(),
            constructor,
            virtuals,
        })
    }

    /// Register a class from a full definition.
    pub fn register(&self, def: ClassDef) -> RegistrationResult<Arc<ClassEntry>> {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        if classes.contains_key(&def.name) {
            return Err(RegistrationError::DuplicateClass(def.name));
        }
        if let ClassBase::Extension { name: base, .. } = &def.base
            && !classes.contains_key(base)
        {
            return Err(RegistrationError::UnknownBase {
                class: def.name,
                base: base.clone(),
            });
        }

        let entry = Arc::new(ClassEntry {
            name: def.name,
            base: def.base,
            flags: def.flags,
            constructor: def.constructor,
            virtuals: def.virtuals,
        });
        log::debug!(
            "registered class {} (base {}, {} virtuals)",
            entry.name,
            entry.base.name(),
            entry.virtuals.len()
        );
        classes.insert(entry.name.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove a class.
    ///
    /// Refused while instances of it are alive or another registered class
    /// derives from it.
    pub fn unregister_class(&self, name: &str) -> RegistrationResult<()> {
        let mut classes = self.classes.write().unwrap_or_else(PoisonError::into_inner);
        if !classes.contains_key(name) {
            return Err(RegistrationError::UnknownClass(name.to_string()));
        }
        if let Some(subclass) = classes
            .values()
            .find(|entry| entry.base.is_extension() && entry.base.name() == name)
        {
            return Err(RegistrationError::HasSubclasses {
                class: name.to_string(),
                subclass: subclass.name.clone(),
            });
        }
        let count = self.instance_count_of(name);
        if count > 0 {
            return Err(RegistrationError::InstancesAlive {
                class: name.to_string(),
                count,
            });
        }

        classes.remove(name);
        log::debug!("unregistered class {name}");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassEntry>> {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // ==========================================================================
    // Instances
    // ==========================================================================

    /// Create the Rust instance for a new host object of `class`.
    pub fn construct(&self, class: &str, host_object: RawPtr) -> RegistrationResult<InstanceId> {
        let entry = self
            .get(class)
            .ok_or_else(|| RegistrationError::UnknownClass(class.to_string()))?;
        let constructor = match &entry.constructor {
            Some(ctor) if !entry.flags.contains(ClassFlags::ABSTRACT) => Arc::clone(ctor),
            _ => return Err(RegistrationError::NotInstantiable(class.to_string())),
        };
        if self.lock_instances().by_object.contains_key(&host_object.addr()) {
            return Err(RegistrationError::AlreadyBound {
                addr: host_object.addr(),
            });
        }

        // The constructor runs unlocked; it may call back into the host.
        let data = constructor(host_object).map_err(|source| RegistrationError::Constructor {
            class: class.to_string(),
            source,
        })?;

        let id = InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let mut instances = self.lock_instances();
        if instances.by_object.contains_key(&host_object.addr()) {
            return Err(RegistrationError::AlreadyBound {
                addr: host_object.addr(),
            });
        }
        instances.by_object.insert(host_object.addr(), id);
        instances.by_id.insert(
            id,
            Arc::new(Instance {
                class: entry,
                host_object,
                data: Mutex::new(data),
            }),
        );
        log::trace!("bound instance {id:?} of {class} to {host_object:?}");
        Ok(id)
    }

    /// Drop an instance. Returns `false` if it was not alive.
    ///
    /// A call running on the instance keeps it alive until it returns.
    pub fn free_instance(&self, id: InstanceId) -> bool {
        let removed = {
            let mut instances = self.lock_instances();
            let removed = instances.by_id.remove(&id);
            if let Some(instance) = &removed {
                instances.by_object.remove(&instance.host_object.addr());
            }
            removed
        };
        // Dropped outside the lock: instance destructors may re-enter.
        match removed {
            Some(instance) => {
                log::trace!("freed instance {id:?} of {}", instance.class.name);
                true
            }
            None => false,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.lock_instances().by_id.len()
    }

    fn instance_count_of(&self, class: &str) -> usize {
        self.lock_instances()
            .by_id
            .values()
            .filter(|instance| instance.class.name == class)
            .count()
    }

    /// Class of a live instance.
    pub fn instance_class(&self, id: InstanceId) -> Option<Arc<ClassEntry>> {
        self.lock_instances()
            .by_id
            .get(&id)
            .map(|instance| Arc::clone(&instance.class))
    }

    /// Host object a live instance is bound to.
    pub fn host_object(&self, id: InstanceId) -> Option<RawPtr> {
        self.lock_instances().by_id.get(&id).map(|instance| instance.host_object)
    }

    /// Instance bound to a host object.
    pub fn instance_for(&self, host_object: RawPtr) -> Option<InstanceId> {
        self.lock_instances().by_object.get(&host_object.addr()).copied()
    }

    /// Run `f` on an instance's Rust value, if it is a `T`.
    ///
    /// Returns `None` when the instance is gone or of another type. Blocks
    /// while a virtual call is running on the same instance.
    pub fn with_instance<T: Any, R>(&self, id: InstanceId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let instance = self.lock_instances().by_id.get(&id).cloned()?;
        let mut data = instance.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.downcast_mut::<T>().map(f)
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.len())
            .field("instances", &self.instance_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_ctor() -> Option<Constructor> {
        Some(constructor(|_| Ok(Box::new(0u32))))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ClassRegistry::new();
        registry
            .register_class("Player", ClassBase::Host("Node".into()), counter_ctor(), VirtualTable::new())
            .unwrap();
        let err = registry
            .register_class("Player", ClassBase::Host("Node".into()), counter_ctor(), VirtualTable::new())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateClass(name) if name == "Player"));
    }

    #[test]
    fn extension_base_must_exist() {
        let registry = ClassRegistry::new();
        let upcast = upcast(|any| Some(any));
        let err = registry
            .register_class(
                "Boss",
                ClassBase::Extension {
                    name: "Enemy".into(),
                    upcast,
                },
                counter_ctor(),
                VirtualTable::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownBase { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn instances_are_bound_one_to_one() {
        let registry = ClassRegistry::new();
        registry
            .register_class("Counter", ClassBase::Host("RefCounted".into()), counter_ctor(), VirtualTable::new())
            .unwrap();
        let object = RawPtr::from_word(0x2000);

        let id = registry.construct("Counter", object).unwrap();
        assert_ne!(id.0, 0);
        assert_eq!(registry.instance_for(object), Some(id));
        assert_eq!(registry.host_object(id), Some(object));
        assert!(matches!(
            registry.construct("Counter", object),
            Err(RegistrationError::AlreadyBound { addr: 0x2000 })
        ));

        assert_eq!(registry.with_instance(id, |n: &mut u32| { *n += 1; *n }), Some(1));
        assert!(registry.free_instance(id));
        assert!(!registry.free_instance(id));
        assert_eq!(registry.instance_for(object), None);
    }

    #[test]
    fn abstract_classes_cannot_be_constructed() {
        let registry = ClassRegistry::new();
        registry
            .register(ClassDef {
                name: "Shape".into(),
                base: ClassBase::Host("Node".into()),
                flags: ClassFlags::ABSTRACT | ClassFlags::EXPOSED,
                constructor: counter_ctor(),
                virtuals: VirtualTable::new(),
            })
            .unwrap();
        assert!(matches!(
            registry.construct("Shape", RawPtr::from_word(0x40)),
            Err(RegistrationError::NotInstantiable(_))
        ));
    }

    #[test]
    fn constructor_errors_are_reported() {
        let registry = ClassRegistry::new();
        let failing = constructor(|_| Err(NativeError::other("no resources")));
        registry
            .register_class("Broken", ClassBase::Host("Node".into()), Some(failing), VirtualTable::new())
            .unwrap();
        let err = registry.construct("Broken", RawPtr::from_word(0x80)).unwrap_err();
        assert!(matches!(err, RegistrationError::Constructor { .. }));
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn unregister_is_refused_while_in_use() {
        let registry = ClassRegistry::new();
        registry
            .register_class("Enemy", ClassBase::Host("Node".into()), counter_ctor(), VirtualTable::new())
            .unwrap();
        let upcast = upcast(|any| Some(any));
        registry
            .register_class(
                "Boss",
                ClassBase::Extension {
                    name: "Enemy".into(),
                    upcast,
                },
                counter_ctor(),
                VirtualTable::new(),
            )
            .unwrap();

        assert!(matches!(
            registry.unregister_class("Enemy"),
            Err(RegistrationError::HasSubclasses { .. })
        ));

        let id = registry.construct("Boss", RawPtr::from_word(0x100)).unwrap();
        assert!(matches!(
            registry.unregister_class("Boss"),
            Err(RegistrationError::InstancesAlive { count: 1, .. })
        ));

        registry.free_instance(id);
        registry.unregister_class("Boss").unwrap();
        registry.unregister_class("Enemy").unwrap();
        assert!(registry.is_empty());
    }
}
