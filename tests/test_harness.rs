// tests/test_harness.rs
//! Shared setup for the integration tests: an extension loaded into the
//! in-process stub host.

#![allow(dead_code)]

use std::sync::Arc;

use hostbind::prelude::*;
use hostbind_core::stub::StubHost;

/// An extension loaded into a fresh stub host.
///
/// The extension is declared first so it is dropped, and unregisters its
/// classes, while the host is still alive.
pub struct TestHost {
    pub ext: Extension,
    pub stub: Arc<StubHost>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(ExtensionConfig::new().ownership_checks(true))
    }

    pub fn with_config(config: ExtensionConfig) -> Self {
        let stub = StubHost::new();
        let ext = Extension::load(&stub.interface(), config)
            .unwrap_or_else(|e| panic!("stub host table should load: {e}"));
        Self { ext, stub }
    }

    /// Construct a host object the way the engine does, returning it with
    /// the extension instance bound to it.
    pub fn spawn(&self, class: &str) -> (RawPtr, InstanceId) {
        let object = self.stub.api().object_construct(class);
        assert!(!object.is_null(), "host failed to construct {class}");
        let instance = self
            .stub
            .instance_of(object)
            .unwrap_or_else(|| panic!("no extension instance bound to {class}"));
        (object, InstanceId(instance))
    }

    /// Invoke a virtual method through the host, returning the status and
    /// the return words.
    pub fn call_virtual(&self, object: RawPtr, name: &str, args: &[u64]) -> (HostStatus, [u64; 3]) {
        let mut ret = [0u64; 3];
        let status = self.stub.call_virtual(object, name, args, &mut ret);
        (status, ret)
    }
}
