//! Status codes reported by the host.
//!
//! Engine methods that report failure through an integer status return it
//! through the call frame like any other value. The binding layer passes the
//! code through as a [`HostStatus`] instead of folding it into a generic
//! error, so callers can match on the exact engine condition.

use crate::error::CallError;

macro_rules! host_status {
    ($( $(#[$meta:meta])* $name:ident = $code:literal, )*) => {
        /// An engine status code.
        ///
        /// Codes this crate does not know are preserved in [`HostStatus::Other`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HostStatus {
            $( $(#[$meta])* $name, )*
            /// A code without a named variant, carried unchanged.
            Other(i32),
        }

        impl HostStatus {
            /// Map a raw host code to a status.
            pub fn from_code(code: i32) -> Self {
                match code {
                    $( $code => HostStatus::$name, )*
                    other => HostStatus::Other(other),
                }
            }

            /// The raw host code.
            pub fn code(self) -> i32 {
                match self {
                    $( HostStatus::$name => $code, )*
                    HostStatus::Other(code) => code,
                }
            }
        }
    };
}

host_status! {
    /// The operation succeeded.
    Ok = 0,
    /// Generic failure.
    Failed = 1,
    Unavailable = 2,
    Unconfigured = 3,
    Unauthorized = 4,
    ParameterRangeError = 5,
    OutOfMemory = 6,
    FileNotFound = 7,
    FileBadDrive = 8,
    FileBadPath = 9,
    FileNoPermission = 10,
    FileAlreadyInUse = 11,
    FileCantOpen = 12,
    FileCantWrite = 13,
    FileCantRead = 14,
    FileUnrecognized = 15,
    FileCorrupt = 16,
    FileMissingDependencies = 17,
    FileEof = 18,
    CantOpen = 19,
    CantCreate = 20,
    QueryFailed = 21,
    AlreadyInUse = 22,
    Locked = 23,
    Timeout = 24,
    InvalidData = 30,
    InvalidParameter = 31,
    AlreadyExists = 32,
    DoesNotExist = 33,
    Busy = 44,
    Bug = 47,
}

impl HostStatus {
    pub fn is_ok(self) -> bool {
        self == HostStatus::Ok
    }

    /// Turn a status into a `Result`, keeping the exact code on failure.
    pub fn into_result(self) -> Result<(), CallError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(CallError::Host(self))
        }
    }
}

impl From<i32> for HostStatus {
    fn from(code: i32) -> Self {
        HostStatus::from_code(code)
    }
}

impl From<HostStatus> for i32 {
    fn from(status: HostStatus) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_named_variants() {
        assert_eq!(HostStatus::from_code(0), HostStatus::Ok);
        assert_eq!(HostStatus::from_code(7), HostStatus::FileNotFound);
        assert_eq!(HostStatus::from_code(44), HostStatus::Busy);
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let status = HostStatus::from_code(1234);
        assert_eq!(status, HostStatus::Other(1234));
        assert_eq!(status.code(), 1234);
    }

    #[test]
    fn codes_round_trip() {
        for code in -3..50 {
            assert_eq!(HostStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn into_result_keeps_failure_code() {
        assert!(HostStatus::Ok.into_result().is_ok());
        let err = HostStatus::FileCantRead.into_result().unwrap_err();
        assert!(matches!(err, CallError::Host(HostStatus::FileCantRead)));
    }
}
