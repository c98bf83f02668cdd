//! The umbrella error type.

use thiserror::Error;

use hostbind_core::{CallError, ConfigError, ConversionError, DecodeError, HandleError};
use hostbind_registry::{BindError, DispatchError, RegistrationError};

pub type Result<T> = std::result::Result<T, HostbindError>;

/// Any error the binding layer can report.
#[derive(Debug, Error)]
pub enum HostbindError {
    /// Fatal load-time misconfiguration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl HostbindError {
    /// Whether the extension must stop initializing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostbindError::Config(_) | HostbindError::Bind(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbind_core::AbiVersion;

    #[test]
    fn config_and_bind_errors_are_fatal() {
        let abi: HostbindError = ConfigError::AbiMismatch {
            host: AbiVersion::new(2, 0),
            required: AbiVersion::CURRENT,
        }
        .into();
        assert!(abi.is_fatal());
        assert_eq!(abi.to_string(), "host ABI 2.0 is incompatible with required ABI 1.0");

        let bind: HostbindError = BindError::Unresolved {
            class: "Node".into(),
            method: "queue_free".into(),
        }
        .into();
        assert!(bind.is_fatal());

        let conversion: HostbindError = ConversionError::NullObject { target_type: "Node" }.into();
        assert!(!conversion.is_fatal());
    }
}
