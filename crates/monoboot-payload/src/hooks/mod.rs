//! Function hooking.
//!
//! Hooks are installed on the function an [`ExportSlot`] resolves to, by
//! rewriting that function's first instructions, so every caller in the
//! process is intercepted:
//!
//! - [`InlineHooks`] - through `retour` (x86/x86_64)
//! - [`PrologueHooks`] - an absolute branch patched in place (aarch64)
//!
//! The bootstrap only ever talks to `dyn HookManager`.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod inline;
#[cfg(any(target_arch = "aarch64", test))]
mod prologue;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use inline::InlineHooks;
#[cfg(target_arch = "aarch64")]
pub use prologue::PrologueHooks;

use monoboot_shared::{ExportSlot, HookErrorKind};
use std::ffi::c_void;

pub type HookResult = std::result::Result<(), HookErrorKind>;

/// Installs and removes detours on the functions behind export slots.
///
/// At most one hook may be active per function. Attaching an already hooked
/// slot fails with [`HookErrorKind::AlreadyAttached`]; detaching a slot that is
/// not hooked succeeds without doing anything, so a detour may detach itself
/// even if another thread got there first. Dropping a backend removes the
/// hooks it still holds.
pub trait HookManager: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Route every call to the function in `slot` to `detour`.
    fn attach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult;

    /// Remove the hook installed with `detour` and restore the original code.
    fn detach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult;

    /// Address that reaches the unhooked function while the hook is active.
    fn original(&self, slot: &ExportSlot) -> Option<*mut c_void>;

    fn is_attached(&self, slot: &ExportSlot) -> bool;
}

/// Backend for architectures no code patcher exists for. Every attach fails,
/// which the bootstrap reports as fatal.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
#[derive(Debug, Default)]
pub struct UnsupportedHooks;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
impl HookManager for UnsupportedHooks {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn attach(&self, _slot: &ExportSlot, _detour: *mut c_void) -> HookResult {
        Err(HookErrorKind::Backend(
            "no code-patching hook backend for this architecture".into(),
        ))
    }

    fn detach(&self, _slot: &ExportSlot, _detour: *mut c_void) -> HookResult {
        Ok(())
    }

    fn original(&self, _slot: &ExportSlot) -> Option<*mut c_void> {
        None
    }

    fn is_attached(&self, _slot: &ExportSlot) -> bool {
        false
    }
}

/// The code-patching backend for the target architecture.
pub fn default_hooks() -> Box<dyn HookManager> {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        Box::new(InlineHooks::new())
    }
    #[cfg(target_arch = "aarch64")]
    {
        Box::new(PrologueHooks::new())
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Box::new(UnsupportedHooks)
    }
}
