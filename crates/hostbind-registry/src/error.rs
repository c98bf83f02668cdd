//! Error types for bind resolution, class registration and dispatch.

use thiserror::Error;

use hostbind_core::{ConfigError, HostStatus, NativeError};

use crate::InstanceId;

/// Result alias for bind table operations.
pub type BindResult<T> = Result<T, BindError>;

/// Result alias for class registry operations.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// A method bind could not be resolved.
///
/// Resolution failures are cached: every later resolve of the same pair
/// reports the same error without asking the host again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("host has no method {class}::{method}")]
    Unresolved { class: String, method: String },
}

impl From<BindError> for ConfigError {
    fn from(err: BindError) -> Self {
        match err {
            BindError::Unresolved { class, method } => ConfigError::UnresolvedBind { class, method },
        }
    }
}

/// Errors from class registration and instance management.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A class with this name is already registered.
    #[error("class '{0}' is already registered")]
    DuplicateClass(String),

    /// An extension base class must be registered before classes deriving from it.
    #[error("class '{class}' derives from unregistered extension class '{base}'")]
    UnknownBase { class: String, base: String },

    #[error("class '{0}' is not registered")]
    UnknownClass(String),

    /// The class is abstract or has no constructor.
    #[error("class '{0}' cannot be instantiated")]
    NotInstantiable(String),

    /// Unregistering while instances of the class are still alive.
    #[error("class '{class}' still has {count} live instance(s)")]
    InstancesAlive { class: String, count: usize },

    /// Unregistering a class another registered class derives from.
    #[error("class '{class}' is the base of registered class '{subclass}'")]
    HasSubclasses { class: String, subclass: String },

    /// The host object already has an extension instance bound to it.
    #[error("host object {addr:#x} already has an instance")]
    AlreadyBound { addr: usize },

    /// The class constructor failed.
    #[error("constructor of '{class}' failed: {source}")]
    Constructor {
        class: String,
        #[source]
        source: NativeError,
    },

    /// The host rejected a class registration or unregistration.
    #[error("host rejected class '{class}': {status:?}")]
    Host { class: String, status: HostStatus },
}

/// Errors from routing a virtual call to an extension callback.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no live instance {0:?}")]
    UnknownInstance(InstanceId),

    /// Another call is already running on this instance.
    #[error("instance {0:?} is busy")]
    InstanceBusy(InstanceId),

    /// An upcast to a declared base class did not match the instance type.
    #[error("instance of '{class}' could not be projected to base '{base}'")]
    Projection { class: String, base: String },

    #[error("class '{0}' is not registered")]
    UnknownClass(String),

    #[error(transparent)]
    Native(#[from] NativeError),
}

impl DispatchError {
    /// The status reported to the host for this failure.
    pub fn status(&self) -> HostStatus {
        match self {
            DispatchError::UnknownInstance(_) | DispatchError::UnknownClass(_) => {
                HostStatus::DoesNotExist
            }
            DispatchError::InstanceBusy(_) => HostStatus::Busy,
            DispatchError::Projection { .. } => HostStatus::Bug,
            DispatchError::Native(_) => HostStatus::Failed,
        }
    }
}
