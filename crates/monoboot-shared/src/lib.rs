//! Shared types for monoboot
//!
//! Everything the payload and the CLI both need to reason about a host's
//! embedded Mono runtime without touching its control flow.
//!
//! # Architecture
//!
//! - [`locator`] - Finds the runtime folder and derives the [`PathSet`]
//! - [`loader`] - Opens shared libraries and looks up exports
//! - [`exports`] - Declarative export manifest and the [`SymbolTable`] it binds into
//! - [`host`] - Collaborators the host application provides

pub mod error;
pub mod exports;
pub mod host;
pub mod loader;
pub mod locator;
pub mod messages;
pub mod runtime;

pub use error::{Error, HookErrorKind, Result};
pub use exports::{Binding, BindPolicy, Export, ExportSlot, Requirement, SymbolTable};
pub use host::Host;
pub use loader::{Library, LibraryLoader, SymbolSource, SystemLoader};
pub use locator::PathSet;
pub use messages::LogLevel;
pub use runtime::RuntimeVariantFlags;

/// Runtime folder names, in the order they are tried
pub const FOLDER_NAMES: &[&str] = &[
    "Mono",
    "MonoBleedingEdge",
    "MonoBleedingEdge.x86",
    "MonoBleedingEdge.x64",
];

/// Runtime library base names, in the order they are tried.
///
/// The first entry is the legacy runtime; loading it selects the legacy ABI.
#[cfg(windows)]
pub const LIBRARY_NAMES: &[&str] = &["mono", "mono-2.0-bdwgc", "mono-2.0-sgen", "mono-2.0-boehm"];

/// Runtime library base names, in the order they are tried.
///
/// The legacy runtime is tried last here since distributions ship it under the
/// same prefix as the modern builds.
#[cfg(not(windows))]
pub const LIBRARY_NAMES: &[&str] = &["monobdwgc-2.0", "monosgen-2.0", "mono-2.0-bdwgc", "mono"];

/// Base name of the legacy runtime library
pub const LEGACY_LIBRARY_NAME: &str = "mono";

/// Companion helper library shipped next to modern runtimes
pub const POSIX_HELPER_NAME: &str = "MonoPosixHelper";

/// Subdirectory some runtime layouts keep the actual runtime binaries in
pub const EMBEDDED_RUNTIME_DIR: &str = "EmbedRuntime";

/// Method names that signal the host reached a steady point in its startup
pub const MARKER_METHODS: &[&str] = &[
    "Internal_ActiveSceneChanged",
    "UnityEngine.ISerializationCallbackReceiver.OnAfterDeserialize",
];
