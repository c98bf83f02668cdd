//! The method bind table.
//!
//! Binds are resolved lazily, at most once per `(class, method)` pair, and
//! cached for the table's lifetime. Each pair owns a write-once cell; the map
//! lock is held only long enough to find or insert that cell, never across
//! the host lookup. Concurrent first uses of the same pair all wait on the
//! one cell, so the host sees exactly one lookup and every caller observes
//! the same bind (or the same error).
//!
//! Cells are found by [`BindKey`] and confirmed by name, so two pairs whose
//! keys collide get separate cells.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use hostbind_core::{BindKey, HostApi, MethodBind};

use crate::error::{BindError, BindResult};

type BindCell = Arc<OnceLock<BindResult<MethodBind>>>;

/// The cell of one `(class, method)` pair.
struct BindSlot {
    class: Box<str>,
    method: Box<str>,
    cell: BindCell,
}

impl BindSlot {
    fn is(&self, class: &str, method: &str) -> bool {
        &*self.class == class && &*self.method == method
    }
}

/// Cache of resolved host method binds.
pub struct MethodBindTable {
    host: HostApi,
    cells: RwLock<FxHashMap<BindKey, Vec<BindSlot>>>,
}

impl MethodBindTable {
    pub fn new(host: HostApi) -> Self {
        Self {
            host,
            cells: RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolve a bind, asking the host only on first use.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn resolve(&self, class: &str, method: &str) -> BindResult<MethodBind> {
        self.resolve_keyed(BindKey::new(class, method), class, method)
    }

    fn resolve_keyed(&self, key: BindKey, class: &str, method: &str) -> BindResult<MethodBind> {
        let cell = self.cell(key, class, method);
        cell.get_or_init(|| self.lookup(class, method)).clone()
    }

    /// Resolve every method of a class up front.
    ///
    /// Stops at the first method the host does not know.
    pub fn preload(&self, class: &str, methods: &[&str]) -> BindResult<Vec<MethodBind>> {
        let binds = methods
            .iter()
            .map(|method| self.resolve(class, method))
            .collect::<BindResult<Vec<_>>>()?;
        log::debug!("preloaded {} method binds for {class}", binds.len());
        Ok(binds)
    }

    /// A bind that was already resolved successfully; never asks the host.
    pub fn get(&self, class: &str, method: &str) -> Option<MethodBind> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells
            .get(&BindKey::new(class, method))
            .and_then(|slots| slots.iter().find(|slot| slot.is(class, method)))
            .and_then(|slot| slot.cell.get())
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    /// Pairs with a cached outcome, successful or not.
    pub fn len(&self) -> usize {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells
            .values()
            .flatten()
            .filter(|slot| slot.cell.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, key: BindKey, class: &str, method: &str) -> BindCell {
        {
            let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = cells
                .get(&key)
                .and_then(|slots| slots.iter().find(|slot| slot.is(class, method)))
            {
                return Arc::clone(&slot.cell);
            }
        }

        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        let slots = cells.entry(key).or_default();
        if let Some(slot) = slots.iter().find(|slot| slot.is(class, method)) {
            return Arc::clone(&slot.cell);
        }
        if let Some(other) = slots.first() {
            log::warn!(
                "{key:?} collides: {class}::{method} and {}::{}",
                other.class,
                other.method
            );
        }
        let cell = BindCell::default();
        slots.push(BindSlot {
            class: class.into(),
            method: method.into(),
            cell: Arc::clone(&cell),
        });
        cell
    }

    fn lookup(&self, class: &str, method: &str) -> BindResult<MethodBind> {
        let raw = self.host.method_bind_lookup(class, method);
        if raw.is_null() {
            log::error!("unresolved method bind {class}::{method}");
            return Err(BindError::Unresolved {
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        log::debug!("resolved method bind {class}::{method} at {raw:?}");
        Ok(MethodBind::new(class, method, raw))
    }
}

impl std::fmt::Debug for MethodBindTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodBindTable")
            .field("resolved", &self.len())
            .finish()
    }
}
