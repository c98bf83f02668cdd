//! Call frames for host method calls.
//!
//! A [`CallFrame`] is sized up front to the exact number of argument words
//! the static signature needs. Arguments are pushed in calling-convention
//! order, the frame is invoked against a [`MethodBind`], and the return area
//! is read back as a typed value:
//!
//! ```ignore
//! let mut frame = CallFrame::new(&registry, <(i32, &str) as CallArgs>::WORDS);
//! frame.push_arg(&7i32)?;
//! frame.push_arg("label")?;
//! let width: f32 = frame.invoke(&bind, this)?.read_ret()?;
//! ```
//!
//! Engine buffers allocated for arguments belong to the frame and are
//! released when the frame (or the [`CallReturn`] it turns into) drops, on
//! every exit path including unwinding.
//!
//! The frame cannot detect a signature that disagrees with the host's; only
//! word counts are checked.

mod slots;

pub(crate) use slots::Handover;
pub use slots::{FromSlots, SlotMode, SlotWriter, ToSlots};

use crate::bind::MethodBind;
use crate::error::{CallError, CallResult};
use crate::handle::{Handle, HandleKind, HandleRegistry, Transient};
use crate::RawPtr;

/// Words in the return area of every frame.
pub const RETURN_WORDS: usize = 3;

/// Who is responsible for an object a host method returns.
///
/// This is a per-method annotation the generated layer must supply; it cannot
/// be inferred from the return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnConvention {
    /// The host transferred a reference (or ownership) to the caller.
    CallerOwned,
    /// The host kept responsibility; the caller only borrows.
    Borrowed,
}

/// Argument words for one host call.
pub struct CallFrame<'r> {
    registry: &'r HandleRegistry,
    words: Vec<u64>,
    capacity: usize,
    storage: Vec<Transient>,
}

impl<'r> CallFrame<'r> {
    /// Create a frame holding exactly `capacity_words` argument words.
    pub fn new(registry: &'r HandleRegistry, capacity_words: usize) -> Self {
        Self {
            registry,
            words: Vec::with_capacity(capacity_words),
            capacity: capacity_words,
            storage: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words pushed so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Append one argument.
    ///
    /// Fails with [`CallError::FrameOverflow`] when the argument does not fit;
    /// the frame is left as it was.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn push_arg<T: ToSlots + ?Sized>(&mut self, value: &T) -> CallResult<()> {
        let start = self.words.len();
        let needed = start + T::WORDS;
        if needed > self.capacity {
            return Err(CallError::FrameOverflow {
                capacity: self.capacity,
                needed,
            });
        }

        self.words.resize(needed, 0);
        let mut writer = SlotWriter::new(
            self.registry,
            &mut self.words[start..needed],
            &mut self.storage,
            SlotMode::Keep,
        );
        let result = value.write_slots(&mut writer);
        if result.is_err() {
            self.words.truncate(start);
        }
        result
    }

    /// Call `bind` on `this` (null for static methods).
    ///
    /// Every argument word must have been pushed.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn invoke(self, bind: &MethodBind, this: RawPtr) -> CallResult<CallReturn<'r>> {
        if self.words.len() != self.capacity {
            return Err(CallError::ArgumentCount {
                expected: self.capacity,
                pushed: self.words.len(),
            });
        }

        let mut ret = [0u64; RETURN_WORDS];
        log::trace!("calling {} with {} words", bind.name(), self.words.len());
        self.registry
            .host()
            .method_bind_call(bind.raw(), this, &self.words, &mut ret);

        Ok(CallReturn {
            registry: self.registry,
            ret,
            _arguments: self.storage,
        })
    }
}

impl std::fmt::Debug for CallFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFrame")
            .field("capacity", &self.capacity)
            .field("pushed", &self.words.len())
            .field("buffers", &self.storage.len())
            .finish()
    }
}

/// The return area of an invoked frame.
///
/// Reading consumes it, so a caller-owned return is released exactly once.
/// Argument buffers stay alive until this is dropped.
pub struct CallReturn<'r> {
    registry: &'r HandleRegistry,
    ret: [u64; RETURN_WORDS],
    _arguments: Vec<Transient>,
}

impl std::fmt::Debug for CallReturn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallReturn")
            .field("ret", &self.ret)
            .field("buffers", &self._arguments.len())
            .finish()
    }
}

impl CallReturn<'_> {
    /// The raw return words.
    pub fn words(&self) -> &[u64; RETURN_WORDS] {
        &self.ret
    }

    /// Decode the return value.
    ///
    /// Host returns are caller-owned: buffers and ref-counted objects the
    /// value carried are released once it has been copied out.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn read_ret<T: FromSlots>(self) -> CallResult<T> {
        if T::WORDS > RETURN_WORDS {
            return Err(CallError::ReturnTooWide {
                needed: T::WORDS,
                available: RETURN_WORDS,
            });
        }
        let words = &self.ret[..T::WORDS];
        let value = T::read_slots(words, self.registry);
        let released = T::release_returned(words, self.registry);
        let value = value?;
        released?;
        Ok(value)
    }

    /// Take the returned object under the method's ownership convention.
    ///
    /// A null return is `None`.
    pub fn read_ret_object(
        self,
        kind: HandleKind,
        convention: ReturnConvention,
    ) -> CallResult<Option<Handle>> {
        let raw = RawPtr::from_word(self.ret[0]);
        if raw.is_null() {
            return Ok(None);
        }
        let handle = match convention {
            ReturnConvention::CallerOwned => self.registry.adopt(raw, kind)?,
            ReturnConvention::Borrowed => Handle::Borrowed(self.registry.borrowed(raw, kind)?),
        };
        Ok(Some(handle))
    }
}

// ============================================================================
// Typed calls
// ============================================================================

/// A tuple of call arguments.
pub trait CallArgs {
    /// Total words of every element.
    const WORDS: usize;

    fn push_all(&self, frame: &mut CallFrame<'_>) -> CallResult<()>;
}

impl CallArgs for () {
    const WORDS: usize = 0;

    fn push_all(&self, _frame: &mut CallFrame<'_>) -> CallResult<()> {
        Ok(())
    }
}

macro_rules! impl_call_args {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: ToSlots),+> CallArgs for ($($name,)+) {
            const WORDS: usize = 0 $(+ <$name as ToSlots>::WORDS)+;

            fn push_all(&self, frame: &mut CallFrame<'_>) -> CallResult<()> {
                $( frame.push_arg(&self.$idx)?; )+
                Ok(())
            }
        }
    };
}

impl_call_args!(A.0);
impl_call_args!(A.0, B.1);
impl_call_args!(A.0, B.1, C.2);
impl_call_args!(A.0, B.1, C.2, D.3);
impl_call_args!(A.0, B.1, C.2, D.3, E.4);
impl_call_args!(A.0, B.1, C.2, D.3, E.4, F.5);
impl_call_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6);
impl_call_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);

/// Call a host method with a typed argument tuple and read a typed return.
pub fn ptrcall<A: CallArgs, R: FromSlots>(
    registry: &HandleRegistry,
    bind: &MethodBind,
    this: RawPtr,
    args: A,
) -> CallResult<R> {
    let mut frame = CallFrame::new(registry, A::WORDS);
    args.push_all(&mut frame)?;
    frame.invoke(bind, this)?.read_ret()
}

/// Like [`ptrcall`] for methods returning an object.
pub fn ptrcall_object<A: CallArgs>(
    registry: &HandleRegistry,
    bind: &MethodBind,
    this: RawPtr,
    args: A,
    kind: HandleKind,
    convention: ReturnConvention,
) -> CallResult<Option<Handle>> {
    let mut frame = CallFrame::new(registry, A::WORDS);
    args.push_all(&mut frame)?;
    frame.invoke(bind, this)?.read_ret_object(kind, convention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubHost;
    use crate::variant::{Variant, Vector3};
    use std::sync::Arc;

    fn bind(stub: &Arc<StubHost>, class: &str, method: &str) -> MethodBind {
        let raw = stub.api().method_bind_lookup(class, method);
        assert!(!raw.is_null());
        MethodBind::new(class, method, raw)
    }

    #[test]
    fn overflow_is_reported_and_frame_is_unchanged() {
        let stub = StubHost::new();
        let registry = stub.registry();
        let mut frame = CallFrame::new(&registry, 1);
        frame.push_arg(&1i32).unwrap();

        let err = frame.push_arg(&2i32).unwrap_err();
        assert!(matches!(err, CallError::FrameOverflow { capacity: 1, needed: 2 }));
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn invoking_an_underfilled_frame_fails_before_the_host_sees_it() {
        let stub = StubHost::new();
        stub.register_method("Calc", "noop", |_, _, _, _| {});
        let registry = stub.registry();
        let noop = bind(&stub, "Calc", "noop");

        let frame = CallFrame::new(&registry, 2);
        let err = frame.invoke(&noop, RawPtr::null()).unwrap_err();
        assert!(matches!(err, CallError::ArgumentCount { expected: 2, pushed: 0 }));
        assert_eq!(stub.call_count("Calc", "noop"), 0);

        let ret = CallFrame::new(&registry, 0).invoke(&noop, RawPtr::null()).unwrap();
        assert_eq!(format!("{ret:?}"), "CallReturn { ret: [0, 0, 0], buffers: 0 }");
    }

    #[test]
    fn i32_return_keeps_width() {
        let stub = StubHost::new();
        stub.register_method("Calc", "add", |_, _, args, ret| {
            let sum = (args[0] as u32 as i32).wrapping_add(args[1] as u32 as i32);
            ret[0] = sum as u32 as u64;
        });
        let registry = stub.registry();
        let add = bind(&stub, "Calc", "add");

        let sum: i32 = ptrcall(&registry, &add, RawPtr::null(), (-5i32, 3i32)).unwrap();
        assert_eq!(sum, -2);
    }

    #[test]
    fn argument_buffers_are_released_after_the_call() {
        let stub = StubHost::new();
        stub.register_method("Label", "len", |host, _, args, ret| {
            ret[0] = host.buffer_bytes(RawPtr::from_word(args[0])).len() as u64;
        });
        let registry = stub.registry();
        let len = bind(&stub, "Label", "len");

        let n: u64 = ptrcall(&registry, &len, RawPtr::null(), ("hello",)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(stub.live_buffers(), 0);
    }

    #[test]
    fn caller_owned_string_return_is_released_after_reading() {
        let stub = StubHost::new();
        stub.register_method("Node", "get_name", |host, _, _, ret| {
            ret[0] = host.new_string("Player").to_word();
        });
        let registry = stub.registry();
        let get_name = bind(&stub, "Node", "get_name");

        let name: String = ptrcall(&registry, &get_name, RawPtr::null(), ()).unwrap();
        assert_eq!(name, "Player");
        assert_eq!(stub.live_buffers(), 0);
    }

    #[test]
    fn variant_and_vector_arguments_use_their_declared_width() {
        let stub = StubHost::new();
        stub.register_method("Probe", "count", |_, _, args, ret| {
            ret[0] = args.len() as u64;
        });
        let registry = stub.registry();
        let count = bind(&stub, "Probe", "count");

        let args = (Variant::Int(1), Vector3::new(1.0, 2.0, 3.0), 1u8);
        assert_eq!(<(Variant, Vector3, u8) as CallArgs>::WORDS, 6);
        let words: u64 = ptrcall(&registry, &count, RawPtr::null(), args).unwrap();
        assert_eq!(words, 6);
    }

    #[test]
    fn object_returns_follow_the_convention() {
        let stub = StubHost::new();
        let owned = stub.spawn_ref_counted("Resource");
        let kept = stub.spawn_ref_counted("Resource");
        stub.register_method("Loader", "load", move |_, _, _, ret| ret[0] = owned.to_word());
        stub.register_method("Loader", "peek", move |_, _, _, ret| ret[0] = kept.to_word());
        let registry = stub.registry();

        let load = bind(&stub, "Loader", "load");
        let handle = ptrcall_object(
            &registry,
            &load,
            RawPtr::null(),
            (),
            HandleKind::RefCounted,
            ReturnConvention::CallerOwned,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(handle, Handle::Shared(_)));
        drop(handle);
        assert_eq!(stub.destroy_calls(owned), 1);

        let peek = bind(&stub, "Loader", "peek");
        let handle = ptrcall_object(
            &registry,
            &peek,
            RawPtr::null(),
            (),
            HandleKind::RefCounted,
            ReturnConvention::Borrowed,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(handle, Handle::Borrowed(_)));
        drop(handle);
        assert_eq!(stub.ref_count(kept), Some(1));
    }

    #[test]
    fn null_object_return_is_none() {
        let stub = StubHost::new();
        stub.register_method("Node", "get_parent", |_, _, _, _| {});
        let registry = stub.registry();
        let get_parent = bind(&stub, "Node", "get_parent");

        let parent = ptrcall_object(
            &registry,
            &get_parent,
            RawPtr::null(),
            (),
            HandleKind::Manual,
            ReturnConvention::Borrowed,
        )
        .unwrap();
        assert!(parent.is_none());
    }
}
