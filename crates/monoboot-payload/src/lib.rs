//! Library loaded into the host process. On load it finds the embedded Mono
//! runtime, binds its exports and hooks domain creation so the managed loader
//! can be started at the right moment.

pub mod bootstrap;
pub mod context;
pub mod entry;
pub mod extension;
pub mod hooks;
pub mod relay;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use context::{BootstrapState, RuntimeBootstrapContext};
pub use entry::{BootstrapConfig, ProcessHost};
pub use extension::{Extension, ManagedEntryExtension};
pub use hooks::{HookManager, default_hooks};
pub use runtime::Runtime;
