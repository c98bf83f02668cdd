//! Call context bridging host virtual calls and extension callbacks.

use std::fmt;

use crate::RawPtr;
use crate::error::{CallError, NativeError};
use crate::frame::{FromSlots, Handover, SlotMode, SlotWriter, ToSlots};
use crate::handle::{Borrowed, HandleKind, HandleRegistry};

/// Context for a virtual call coming from the host.
///
/// Arguments are read in declaration order with [`next_arg`](Self::next_arg);
/// each read consumes as many words as the type declares. Argument words are
/// borrowed from the host, so reads copy data out and take over nothing.
///
/// ```ignore
/// let delta: f64 = ctx.next_arg()?;
/// let name: String = ctx.next_arg()?;
/// ctx.set_return(&true)?;
/// ```
pub struct CallContext<'a> {
    registry: &'a HandleRegistry,
    args: &'a [u64],
    cursor: usize,
    index: usize,
    ret: &'a mut [u64],
    returned: bool,
    /// What the return value handed to the host.
    handed: Vec<Handover>,
}

impl<'a> CallContext<'a> {
    /// Create a context over host-supplied argument and return words.
    pub fn new(registry: &'a HandleRegistry, args: &'a [u64], ret: &'a mut [u64]) -> Self {
        Self {
            registry,
            args,
            cursor: 0,
            index: 0,
            ret,
            returned: false,
            handed: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'a HandleRegistry {
        self.registry
    }

    /// Argument words the host supplied.
    pub fn arg_words(&self) -> usize {
        self.args.len()
    }

    /// Argument words not yet read.
    pub fn remaining(&self) -> usize {
        self.args.len() - self.cursor
    }

    fn next_words(&mut self, needed: usize) -> Result<&'a [u64], NativeError> {
        let remaining = self.remaining();
        let args: &'a [u64] = self.args;
        let words = args
            .get(self.cursor..self.cursor + needed)
            .ok_or(NativeError::ArgumentsExhausted {
                index: self.index,
                needed,
                remaining,
            })?;
        self.cursor += needed;
        self.index += 1;
        Ok(words)
    }

    /// Read the next argument.
    pub fn next_arg<T: FromSlots>(&mut self) -> Result<T, NativeError> {
        let words = self.next_words(T::WORDS)?;
        Ok(T::read_slots(words, self.registry)?)
    }

    /// Read the next argument as an object borrowed for this call.
    ///
    /// A null pointer is `None`.
    pub fn next_object(&mut self, kind: HandleKind) -> Result<Option<Borrowed>, NativeError> {
        let raw: RawPtr = self.next_arg()?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(self.registry.borrowed(raw, kind)?))
    }

    /// Write the return value; storage it needs is handed to the host.
    ///
    /// May be called once per call.
    pub fn set_return<T: ToSlots + ?Sized>(&mut self, value: &T) -> Result<(), NativeError> {
        if self.returned {
            return Err(NativeError::other("return value already set"));
        }
        let available = self.ret.len();
        let words = self.ret.get_mut(..T::WORDS).ok_or(CallError::ReturnTooWide {
            needed: T::WORDS,
            available,
        })?;
        let mut storage = Vec::new();
        let mut writer = SlotWriter::new(self.registry, words, &mut storage, SlotMode::Transfer);
        let written = value.write_slots(&mut writer);
        self.handed = writer.into_handed();
        match written {
            Ok(()) => {
                self.returned = true;
                Ok(())
            }
            Err(err) => {
                self.reclaim();
                Err(err.into())
            }
        }
    }

    pub fn has_return(&self) -> bool {
        self.returned
    }

    /// Undo [`set_return`](Self::set_return) for a call that failed.
    ///
    /// Storage the return value handed to the host is taken back and
    /// released, and the return words are cleared.
    pub fn discard_return(&mut self) {
        if self.returned {
            self.reclaim();
            self.returned = false;
        }
    }

    fn reclaim(&mut self) {
        for handover in self.handed.drain(..) {
            if let Err(err) = handover.reclaim(self.registry) {
                log::error!("reclaiming a discarded return value: {err}");
            }
        }
        self.ret.fill(0);
    }
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("arg_words", &self.args.len())
            .field("cursor", &self.cursor)
            .field("returned", &self.returned)
            .finish()
    }
}
