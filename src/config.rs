//! Extension configuration.

use num_enum::TryFromPrimitive;

use hostbind_core::AbiVersion;

/// Engine startup phases at which classes become available.
///
/// The engine initializes levels in ascending order and deinitializes them
/// in reverse.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum InitLevel {
    Core = 0,
    Servers = 1,
    Scene = 2,
    Editor = 3,
}

impl InitLevel {
    pub const ALL: [InitLevel; 4] = [
        InitLevel::Core,
        InitLevel::Servers,
        InitLevel::Scene,
        InitLevel::Editor,
    ];
}

/// Settings for loading an extension.
///
/// ```ignore
/// let config = ExtensionConfig::new()
///     .minimum_init_level(InitLevel::Scene)
///     .ownership_checks(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    pub minimum_init_level: InitLevel,
    /// Track ownership responsibility for every handle and report misuse.
    pub ownership_checks: bool,
    pub required_abi: AbiVersion,
    /// Resolve the method binds a class declares when the class is
    /// registered, instead of on first call.
    pub preload_binds: bool,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            minimum_init_level: InitLevel::Scene,
            ownership_checks: cfg!(any(debug_assertions, feature = "ownership-checks")),
            required_abi: AbiVersion::CURRENT,
            preload_binds: true,
        }
    }
}

impl ExtensionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minimum_init_level(mut self, level: InitLevel) -> Self {
        self.minimum_init_level = level;
        self
    }

    pub fn ownership_checks(mut self, enabled: bool) -> Self {
        self.ownership_checks = enabled;
        self
    }

    pub fn required_abi(mut self, major: u16, minor: u16) -> Self {
        self.required_abi = AbiVersion::new(major, minor);
        self
    }

    pub fn preload_binds(mut self, enabled: bool) -> Self {
        self.preload_binds = enabled;
        self
    }
}
