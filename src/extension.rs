//! Loading an extension into a host.
//!
//! An [`Extension`] owns every table the binding layer needs: the validated
//! host API, the handle registry, the method bind table and the class
//! registry. Classes are queued at an [`InitLevel`] and handed to the host
//! when the engine initializes that level; deinitializing a level removes
//! its classes again, most recently registered first.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hostbind_core::{
    CallArgs, ClassRegistration, FromSlots, Handle, HandleKind, HandleRegistry, HostApi,
    HostInterface, RawPtr, ReturnConvention, ptrcall, ptrcall_object,
};
use hostbind_registry::{
    ClassBuilder, ClassDef, ClassRegistry, MethodBindTable, RegistrationError,
};

use crate::config::{ExtensionConfig, InitLevel};
use crate::error::Result;
use crate::trampoline::{CALLBACKS, ClassData};

/// A class waiting for its init level.
struct PendingClass {
    def: ClassDef,
    /// Host methods the class calls, by host class.
    binds: Vec<(String, Vec<String>)>,
}

/// A class the host knows about.
struct RegisteredClass {
    level: InitLevel,
    name: String,
    class_data: Box<ClassData>,
}

#[derive(Default)]
struct Levels {
    pending: BTreeMap<InitLevel, Vec<PendingClass>>,
    initialized: BTreeSet<InitLevel>,
    registered: Vec<RegisteredClass>,
}

pub(crate) struct ExtensionState {
    config: ExtensionConfig,
    host: HostApi,
    pub(crate) handles: HandleRegistry,
    binds: MethodBindTable,
    pub(crate) classes: ClassRegistry,
    levels: Mutex<Levels>,
}

impl ExtensionState {
    fn levels(&self) -> MutexGuard<'_, Levels> {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one class with the class registry and the host.
    fn install(self: &Arc<Self>, level: InitLevel, class: PendingClass) -> Result<()> {
        let PendingClass { def, binds } = class;
        if self.config.preload_binds {
            for (host_class, methods) in &binds {
                let methods: Vec<&str> = methods.iter().map(String::as_str).collect();
                self.binds.preload(host_class, &methods)?;
            }
        }

        let entry = self.classes.register(def)?;
        let name = entry.name().to_string();
        let class_data = Box::new(ClassData {
            state: Arc::downgrade(self),
            class: name.clone(),
        });
        let base = entry.base().name();
        let registration = ClassRegistration {
            name: name.as_ptr(),
            name_len: name.len(),
            base: base.as_ptr(),
            base_len: base.len(),
            flags: entry.flags().bits(),
            class_data: &*class_data as *const ClassData as *mut c_void,
            callbacks: CALLBACKS,
        };
        let status = self.host.class_register(&registration);
        if !status.is_ok() {
            if let Err(err) = self.classes.unregister_class(&name) {
                log::error!("rolling back class {name}: {err}");
            }
            return Err(RegistrationError::Host { class: name, status }.into());
        }

        log::debug!("registered class {name} with the host at {level:?}");
        self.levels().registered.push(RegisteredClass {
            level,
            name,
            class_data,
        });
        Ok(())
    }

    /// Remove one class from the class registry and the host.
    ///
    /// On failure the class stays registered everywhere and is handed back.
    fn uninstall(&self, class: RegisteredClass) -> std::result::Result<(), (RegisteredClass, RegistrationError)> {
        if let Err(err) = self.classes.unregister_class(&class.name) {
            return Err((class, err));
        }
        let status = self.host.class_unregister(&class.name);
        if !status.is_ok() {
            log::warn!("host refused to unregister class {}: {status:?}", class.name);
        }
        log::debug!("unregistered class {} at {:?}", class.name, class.level);
        // The host no longer calls back with this class data.
        drop(class.class_data);
        Ok(())
    }
}

/// A loaded extension.
pub struct Extension {
    state: Arc<ExtensionState>,
}

impl Extension {
    /// Validate the host table and build the extension's tables.
    pub fn load(interface: &HostInterface, config: ExtensionConfig) -> Result<Self> {
        let host = HostApi::load(interface, config.required_abi)?;
        let handles = HandleRegistry::with_ownership_checks(host, config.ownership_checks);
        log::debug!(
            "extension loaded (ABI {}, minimum level {:?}, ownership checks {})",
            host.version(),
            config.minimum_init_level,
            config.ownership_checks
        );
        Ok(Self {
            state: Arc::new(ExtensionState {
                config,
                host,
                handles,
                binds: MethodBindTable::new(host),
                classes: ClassRegistry::new(),
                levels: Mutex::new(Levels::default()),
            }),
        })
    }

    pub fn config(&self) -> &ExtensionConfig {
        &self.state.config
    }

    pub fn host(&self) -> &HostApi {
        &self.state.host
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.state.handles
    }

    pub fn binds(&self) -> &MethodBindTable {
        &self.state.binds
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.state.classes
    }

    // ==========================================================================
    // Classes
    // ==========================================================================

    /// Register a class built from the Rust type `T`.
    pub fn register_class<T: std::any::Any + Send>(
        &self,
        level: InitLevel,
        builder: ClassBuilder<T>,
    ) -> Result<()> {
        self.add_class(level, builder.build(), &[])
    }

    /// Register a class together with the host methods it calls.
    ///
    /// The class reaches the host when `level` is initialized, or right away
    /// if it already is. With `preload_binds` set, every listed bind is
    /// resolved first and the class is not registered if one is missing.
    pub fn add_class(&self, level: InitLevel, def: ClassDef, binds: &[(&str, &[&str])]) -> Result<()> {
        let level = level.max(self.state.config.minimum_init_level);
        let class = PendingClass {
            def,
            binds: binds
                .iter()
                .map(|(class, methods)| {
                    (class.to_string(), methods.iter().map(|m| m.to_string()).collect())
                })
                .collect(),
        };

        {
            let mut levels = self.state.levels();
            if !levels.initialized.contains(&level) {
                levels.pending.entry(level).or_default().push(class);
                return Ok(());
            }
        }
        self.state.install(level, class)
    }

    /// Register every class queued at `level`.
    ///
    /// Levels below the configured minimum are ignored. Every queued class is
    /// attempted; a class that fails is dropped and the first failure is
    /// returned once the rest are registered. The level counts as initialized
    /// either way, so classes added to it later register immediately.
    pub fn initialize(&self, level: InitLevel) -> Result<()> {
        if level < self.state.config.minimum_init_level {
            log::debug!("skipping init level {level:?}");
            return Ok(());
        }
        let pending = {
            let mut levels = self.state.levels();
            if !levels.initialized.insert(level) {
                return Ok(());
            }
            levels.pending.remove(&level).unwrap_or_default()
        };
        log::debug!("initializing level {level:?} with {} classes", pending.len());
        let mut first_error = None;
        for class in pending {
            let name = class.def.name.clone();
            if let Err(err) = self.state.install(level, class) {
                log::error!("class {name} not registered at {level:?}: {err}");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unregister every class registered at `level`, in reverse order.
    ///
    /// A class that still has live instances or subclasses stays registered;
    /// the first such refusal is returned after the rest were attempted.
    pub fn deinitialize(&self, level: InitLevel) -> Result<()> {
        let classes = {
            let mut levels = self.state.levels();
            if !levels.initialized.remove(&level) {
                return Ok(());
            }
            let (at_level, rest): (Vec<_>, Vec<_>) =
                levels.registered.drain(..).partition(|class| class.level == level);
            levels.registered = rest;
            at_level
        };

        let mut first_error = None;
        for class in classes.into_iter().rev() {
            if let Err((class, err)) = self.state.uninstall(class) {
                log::error!("cannot unregister class {}: {err}", class.name);
                let mut levels = self.state.levels();
                levels.initialized.insert(level);
                levels.registered.push(class);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn is_initialized(&self, level: InitLevel) -> bool {
        self.state.levels().initialized.contains(&level)
    }

    // ==========================================================================
    // Host calls
    // ==========================================================================

    /// Call a host method, resolving its bind on first use.
    pub fn call<A: CallArgs, R: FromSlots>(&self, class: &str, method: &str, this: RawPtr, args: A) -> Result<R> {
        let bind = self.state.binds.resolve(class, method)?;
        Ok(ptrcall(&self.state.handles, &bind, this, args)?)
    }

    /// Call a host method returning an object.
    pub fn call_object<A: CallArgs>(
        &self,
        class: &str,
        method: &str,
        this: RawPtr,
        args: A,
        kind: HandleKind,
        convention: ReturnConvention,
    ) -> Result<Option<Handle>> {
        let bind = self.state.binds.resolve(class, method)?;
        Ok(ptrcall_object(&self.state.handles, &bind, this, args, kind, convention)?)
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        for level in InitLevel::ALL.into_iter().rev() {
            if let Err(err) = self.deinitialize(level) {
                log::error!("deinitializing {level:?} on drop: {err}");
            }
        }
        // The host may still call into classes it could not let go of.
        for class in self.state.levels().registered.drain(..) {
            log::error!("leaking class data of {}, still registered with the host", class.name);
            std::mem::forget(class.class_data);
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("config", &self.state.config)
            .field("binds", &self.state.binds)
            .field("classes", &self.state.classes)
            .finish_non_exhaustive()
    }
}
