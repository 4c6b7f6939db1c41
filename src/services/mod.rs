//! Closed catalog of RPC services exposed by each side of the bridge.
//!
//! Both catalogs are fixed at compile time; every entry has a stable wire
//! name and a direction. The host binds every [`MainService`] and the guest
//! binds every [`GuestService`].

pub mod host;
pub mod proxies;

use std::fmt::{Display, Formatter};

/// Version of the service catalog, sent in the init payload.
pub const CATALOG_VERSION: u32 = 1;

/// Which process implements a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Implemented by the host, called by the guest.
    Main,
    /// Implemented by the guest, called by the host.
    Guest,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Guest => "guest",
        })
    }
}

/// Services implemented by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainService {
    /// Guest log lines.
    Log,
    /// Activation lifecycle notifications.
    ExtensionService,
    /// Host-side command registry.
    Commands,
    /// User-facing messages.
    MessageService,
    /// Configuration reads and updates.
    Configuration,
    /// Workspace-scoped file access.
    FileSystem,
}

impl MainService {
    /// Every host service, in catalog order.
    pub const ALL: [Self; 6] = [
        Self::Log,
        Self::ExtensionService,
        Self::Commands,
        Self::MessageService,
        Self::Configuration,
        Self::FileSystem,
    ];

    /// Stable wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Log => "MainThreadLog",
            Self::ExtensionService => "MainThreadExtensionService",
            Self::Commands => "MainThreadCommands",
            Self::MessageService => "MainThreadMessageService",
            Self::Configuration => "MainThreadConfiguration",
            Self::FileSystem => "MainThreadFileSystem",
        }
    }

    /// Wire address of this service.
    #[must_use]
    pub const fn address(self) -> ServiceAddress {
        ServiceAddress {
            direction: Direction::Main,
            name: self.name(),
        }
    }
}

/// Services implemented by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestService {
    /// Extension activation and deactivation.
    ExtensionService,
    /// Guest-side command execution.
    Commands,
    /// Configuration change notifications.
    Configuration,
}

impl GuestService {
    /// Every guest service, in catalog order.
    pub const ALL: [Self; 3] = [Self::ExtensionService, Self::Commands, Self::Configuration];

    /// Stable wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ExtensionService => "ExtHostExtensionService",
            Self::Commands => "ExtHostCommands",
            Self::Configuration => "ExtHostConfiguration",
        }
    }

    /// Wire address of this service.
    #[must_use]
    pub const fn address(self) -> ServiceAddress {
        ServiceAddress {
            direction: Direction::Guest,
            name: self.name(),
        }
    }
}

/// Typed identifier of one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    direction: Direction,
    name: &'static str,
}

impl ServiceAddress {
    /// Side that implements the service.
    #[must_use]
    pub const fn direction(self) -> Direction {
        self.direction
    }

    /// Stable wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.name
    }

    /// Resolve a wire name against both catalogs.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        MainService::ALL
            .iter()
            .map(|s| s.address())
            .chain(GuestService::ALL.iter().map(|s| s.address()))
            .find(|addr| addr.name == name)
    }

    /// All addresses implemented by `direction`.
    #[must_use]
    pub fn catalog(direction: Direction) -> Vec<Self> {
        match direction {
            Direction::Main => MainService::ALL.iter().map(|s| s.address()).collect(),
            Direction::Guest => GuestService::ALL.iter().map(|s| s.address()).collect(),
        }
    }
}

impl Display for ServiceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.direction, self.name)
    }
}

impl From<MainService> for ServiceAddress {
    fn from(service: MainService) -> Self {
        service.address()
    }
}

impl From<GuestService> for ServiceAddress {
    fn from(service: GuestService) -> Self {
        service.address()
    }
}

/// Method names of every catalog entry.
pub mod methods {
    /// `MainThreadLog`.
    pub mod log {
        /// `(level: string, target: string, message: string)`.
        pub const LOG: &str = "$log";
    }

    /// `MainThreadExtensionService`.
    pub mod main_extension {
        /// `(id: string)`.
        pub const ON_WILL_ACTIVATE: &str = "$onWillActivateExtension";
        /// `(id: string, elapsed_ms: int)`.
        pub const ON_DID_ACTIVATE: &str = "$onDidActivateExtension";
        /// `(id: string, message: string)`.
        pub const ON_ACTIVATION_ERROR: &str = "$onExtensionActivationError";
    }

    /// `MainThreadCommands`.
    pub mod main_commands {
        /// `(id: string)`.
        pub const REGISTER: &str = "$registerCommand";
        /// `(id: string)`.
        pub const UNREGISTER: &str = "$unregisterCommand";
        /// `(id: string, args: list)`.
        pub const EXECUTE: &str = "$executeCommand";
        /// `()` returning `list<string>`.
        pub const GET_COMMANDS: &str = "$getCommands";
    }

    /// `MainThreadMessageService`.
    pub mod message {
        /// `(severity: string, message: string, actions: list<string>)`.
        pub const SHOW_MESSAGE: &str = "$showMessage";
    }

    /// `MainThreadConfiguration`.
    pub mod main_configuration {
        /// `(section: string | null)` returning the section value.
        pub const GET_CONFIGURATION: &str = "$getConfiguration";
        /// `(key: string, value: any)`.
        pub const UPDATE_OPTION: &str = "$updateConfigurationOption";
        /// `(key: string)`.
        pub const REMOVE_OPTION: &str = "$removeConfigurationOption";
    }

    /// `MainThreadFileSystem`.
    pub mod file_system {
        /// `(uri: uri)` returning `{type, size, mtime_ms}`.
        pub const STAT: &str = "$stat";
        /// `(uri: uri)` returning a buffer.
        pub const READ_FILE: &str = "$readFile";
        /// `(uri: uri)` returning `list<[name, type]>`.
        pub const READ_DIRECTORY: &str = "$readdir";
    }

    /// `ExtHostExtensionService`.
    pub mod guest_extension {
        /// `(id: string, reason: string)` returning `bool`.
        pub const ACTIVATE_BY_ID: &str = "$activateById";
        /// `()`.
        pub const DEACTIVATE_ALL: &str = "$deactivateAll";
        /// `()` returning `list<string>` of active extension ids.
        pub const ACTIVATED: &str = "$activatedExtensions";
    }

    /// `ExtHostCommands`.
    pub mod guest_commands {
        /// `(id: string, args: list)`.
        pub const EXECUTE_CONTRIBUTED: &str = "$executeContributedCommand";
        /// `()` returning `list<string>`.
        pub const GET_CONTRIBUTED: &str = "$getContributedCommands";
    }

    /// `ExtHostConfiguration`.
    pub mod guest_configuration {
        /// `(settings: map)`.
        pub const ACCEPT_CONFIGURATION_CHANGED: &str = "$acceptConfigurationChanged";
    }
}
