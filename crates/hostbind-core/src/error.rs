//! Error types for the binding core.
//!
//! ```text
//! ConfigError      - fatal at load time (ABI mismatch, missing entry points, unresolved binds)
//! HandleError      - ownership violations (double release, use after release, ...)
//! DecodeError      - malformed variant wire data
//! ConversionError  - a value did not have the requested type
//! CallError        - call frame misuse and panics caught at the boundary
//! NativeError      - failures inside extension callbacks
//! ```
//!
//! Host-reported status codes are not errors of this crate; they travel as
//! [`HostStatus`](crate::HostStatus) values.

use thiserror::Error;

use crate::HostStatus;
use crate::handle::HandleKind;
use crate::host::AbiVersion;

/// Result alias for handle registry operations.
pub type HandleResult<T> = Result<T, HandleError>;

/// Result alias for call frame operations.
pub type CallResult<T> = Result<T, CallError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Load-time misconfiguration. The extension must not keep initializing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Host and extension were built against incompatible ABI revisions.
    #[error("host ABI {host} is incompatible with required ABI {required}")]
    AbiMismatch {
        host: AbiVersion,
        required: AbiVersion,
    },

    /// The host table left a required entry point empty.
    #[error("host interface is missing entry point '{0}'")]
    MissingEntryPoint(&'static str),

    /// The host reported no method with this name.
    #[error("unresolved method bind {class}::{method}")]
    UnresolvedBind { class: String, method: String },

    /// A class was referenced before it was registered.
    #[error("class '{0}' is not registered")]
    UnregisteredClass(String),
}

// ============================================================================
// Handle Errors
// ============================================================================

/// Ownership violations detected by the handle registry.
///
/// These are programmer errors. The registry reports them when ownership
/// checks are enabled; with checks disabled the behavior is unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// A null pointer was given where a live object is required.
    #[error("null pointer passed where a {kind:?} handle is required")]
    Null { kind: HandleKind },

    /// The extension released something it holds no responsibility for.
    #[error("double release of {addr:#x}")]
    DoubleRelease { addr: usize },

    /// A handle was used after the object behind it was destroyed.
    #[error("use after release of {addr:#x}")]
    UseAfterRelease { addr: usize },

    /// A manually-managed object already has the extension as its owner.
    #[error("object {addr:#x} is already owned by the extension")]
    AlreadyOwned { addr: usize },

    /// The operation is not legal for this handle kind.
    #[error("expected a {expected:?} handle, got {actual:?}")]
    WrongKind {
        expected: HandleKind,
        actual: HandleKind,
    },
}

// ============================================================================
// Conversion / Decode Errors
// ============================================================================

/// A value could not be converted to the requested Rust type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    /// The value carries a different type than requested.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A null object cannot become a non-nullable handle.
    #[error("null object cannot be converted to {target_type}")]
    NullObject { target_type: &'static str },

    /// Integer does not fit the requested width.
    #[error("integer overflow: value {value} does not fit in {target_type}")]
    IntegerOverflow { value: i64, target_type: &'static str },

    /// Engine string data was not UTF-8.
    #[error("invalid UTF-8 string data")]
    InvalidUtf8,
}

/// Malformed variant wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The tag word does not name a known variant type.
    #[error("unknown variant tag {0}")]
    UnknownTag(u64),

    /// The payload does not fit the tag.
    #[error("malformed {tag} payload: {reason}")]
    Malformed { tag: &'static str, reason: String },

    /// The payload references an object or buffer the registry rejected.
    #[error(transparent)]
    Handle(#[from] HandleError),
}

impl DecodeError {
    pub(crate) fn malformed(tag: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            tag,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Call Errors
// ============================================================================

/// Call frame failures that the binding layer can detect.
///
/// Signature mismatches with the host are undefined behavior and cannot be
/// detected here; only frame bookkeeping is checked.
#[derive(Debug, Error)]
pub enum CallError {
    /// More words were pushed than the frame was sized for.
    #[error("call frame overflow: capacity {capacity} words, needed {needed}")]
    FrameOverflow { capacity: usize, needed: usize },

    /// The frame was invoked before every argument word was written.
    #[error("call frame holds {pushed} of {expected} argument words")]
    ArgumentCount { expected: usize, pushed: usize },

    /// The return type needs more words than the return area holds.
    #[error("return type needs {needed} words, return area holds {available}")]
    ReturnTooWide { needed: usize, available: usize },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The host answered with a failure status.
    #[error("host reported {0:?}")]
    Host(HostStatus),

    /// Extension code panicked while the host was waiting on it.
    #[error("extension code panicked: {message}")]
    Panicked { message: String },
}

// ============================================================================
// Native Errors
// ============================================================================

/// Errors raised by extension callbacks invoked from the host.
#[derive(Debug, Error)]
pub enum NativeError {
    /// Error converting arguments or return values
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// The callback read past the argument words the host supplied.
    #[error("argument {index} needs {needed} words, {remaining} left in the frame")]
    ArgumentsExhausted {
        index: usize,
        needed: usize,
        remaining: usize,
    },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    /// Generic native error
    #[error("native error: {message}")]
    Other { message: String },
}

impl NativeError {
    /// Create a generic native error.
    pub fn other(message: impl Into<String>) -> Self {
        NativeError::Other {
            message: message.into(),
        }
    }
}

impl From<DecodeError> for NativeError {
    fn from(err: DecodeError) -> Self {
        NativeError::Call(CallError::Decode(err))
    }
}

/// Render a panic payload for error reporting.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_both_abi_versions() {
        let err = ConfigError::AbiMismatch {
            host: AbiVersion::new(2, 0),
            required: AbiVersion::new(3, 1),
        };
        let msg = err.to_string();
        assert!(msg.contains("2.0"));
        assert!(msg.contains("3.1"));
    }

    #[test]
    fn handle_error_formats_address_as_hex() {
        let err = HandleError::DoubleRelease { addr: 0x40 };
        assert!(err.to_string().contains("0x40"));
    }

    #[test]
    fn native_error_from_conversion() {
        let conv = ConversionError::InvalidUtf8;
        let native: NativeError = conv.into();
        assert!(matches!(native, NativeError::Conversion(_)));
    }

    #[test]
    fn native_error_from_decode_goes_through_call() {
        let native: NativeError = DecodeError::UnknownTag(99).into();
        assert!(matches!(native, NativeError::Call(CallError::Decode(_))));
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let a: Box<dyn std::any::Any + Send> = Box::new("boom");
        let b: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        let c: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(a.as_ref()), "boom");
        assert_eq!(panic_message(b.as_ref()), "bang");
        assert_eq!(panic_message(c.as_ref()), "non-string panic payload");
    }
}
