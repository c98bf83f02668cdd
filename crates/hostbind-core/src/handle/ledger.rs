//! Extension-side record of ownership responsibility.
//!
//! The host owns the authoritative reference counts. The ledger only tracks
//! what the extension is responsible for, so violations can be reported
//! before a bad release reaches the host.
//!
//! Use after release is tracked with epochs. Every free the extension causes
//! advances the epoch and stamps the freed address with it; handles remember
//! the epoch they were created in. A handle is stale when its address was
//! freed after it was created. Hosts reuse addresses, so a bare address is
//! never judged stale on its own.

use rustc_hash::FxHashMap;

use super::HandleKind;
use crate::error::{HandleError, HandleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// References the extension holds on a ref-counted object.
    Shared(u32),
    /// The extension is the sole owner.
    Owned,
    /// References the extension holds on an engine buffer.
    Buffer(u32),
}

#[derive(Debug, Default)]
pub(super) struct Ledger {
    entries: FxHashMap<usize, Entry>,
    /// Address -> epoch of the last free the extension caused there.
    retired: FxHashMap<usize, u64>,
    epoch: u64,
}

/// Retired addresses remembered before the oldest are forgotten.
const RETIRED_LIMIT: usize = 4096;

impl Ledger {
    /// Record new responsibility taken by the extension.
    pub fn take(&mut self, addr: usize, kind: HandleKind) -> HandleResult<()> {
        match (kind, self.entries.get_mut(&addr)) {
            (HandleKind::RefCounted, Some(Entry::Shared(refs)))
            | (HandleKind::Transient, Some(Entry::Buffer(refs))) => {
                *refs += 1;
            }
            (HandleKind::Manual, Some(Entry::Owned)) => {
                return Err(HandleError::AlreadyOwned { addr });
            }
            (_, Some(existing)) => {
                return Err(HandleError::WrongKind {
                    expected: existing.kind(),
                    actual: kind,
                });
            }
            (_, None) => {
                self.entries.insert(addr, Entry::fresh(kind));
            }
        }
        Ok(())
    }

    /// Record that the extension is giving up one unit of responsibility.
    ///
    /// Fails without touching the ledger when the extension holds nothing.
    pub fn give_up(&mut self, addr: usize, kind: HandleKind) -> HandleResult<()> {
        let Some(entry) = self.entries.get_mut(&addr) else {
            return Err(HandleError::DoubleRelease { addr });
        };

        if entry.kind() != kind {
            return Err(HandleError::WrongKind {
                expected: entry.kind(),
                actual: kind,
            });
        }

        let last = match entry {
            Entry::Shared(refs) | Entry::Buffer(refs) if *refs > 1 => {
                *refs -= 1;
                false
            }
            _ => true,
        };
        if last {
            self.entries.remove(&addr);
        }
        Ok(())
    }

    /// The host freed the allocation after the extension released it.
    pub fn retire(&mut self, addr: usize) {
        self.entries.remove(&addr);
        self.epoch += 1;
        self.retired.insert(addr, self.epoch);

        if self.retired.len() > RETIRED_LIMIT {
            let horizon = self.epoch.saturating_sub((RETIRED_LIMIT / 2) as u64);
            self.retired.retain(|_, freed| *freed > horizon);
        }
    }

    /// The epoch new handles are stamped with.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fails when `addr` was freed after a handle from `epoch` was created.
    pub fn check_live(&self, addr: usize, epoch: u64) -> HandleResult<()> {
        match self.retired.get(&addr) {
            Some(&freed) if freed > epoch => Err(HandleError::UseAfterRelease { addr }),
            _ => Ok(()),
        }
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// References or ownership the extension currently holds on `addr`.
    pub fn held(&self, addr: usize) -> u32 {
        match self.entries.get(&addr) {
            Some(Entry::Shared(refs)) | Some(Entry::Buffer(refs)) => *refs,
            Some(Entry::Owned) => 1,
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Entry {
    fn fresh(kind: HandleKind) -> Self {
        match kind {
            HandleKind::RefCounted => Entry::Shared(1),
            HandleKind::Manual => Entry::Owned,
            HandleKind::Transient => Entry::Buffer(1),
        }
    }

    fn kind(&self) -> HandleKind {
        match self {
            Entry::Shared(_) => HandleKind::RefCounted,
            Entry::Owned => HandleKind::Manual,
            Entry::Buffer(_) => HandleKind::Transient,
        }
    }
}
