//! Code patching through `retour`.

use super::{HookManager, HookResult};
use monoboot_shared::{ExportSlot, HookErrorKind};
use retour::RawDetour;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, PoisonError};

struct Handle(RawDetour);

// The detour is only touched under the manager's locks
unsafe impl Send for Handle {}

struct InlineRecord {
    detour: usize,
    original: usize,
    handle: Handle,
}

/// Hooks the function a slot points to by rewriting its first instructions.
///
/// The slot itself keeps the real entry address, so every caller in the
/// process, including ones that never go through the slot, is intercepted.
/// Records are keyed by slot address and keep the detour handle plus the
/// trampoline that reaches the original code.
#[derive(Default)]
pub struct InlineHooks {
    active: Mutex<HashMap<usize, InlineRecord>>,
    // Disabled detours stay allocated: a caller that read the trampoline just
    // before detach may still be running through it.
    retired: Mutex<Vec<Handle>>,
}

impl InlineHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HookManager for InlineHooks {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn attach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult {
        if detour.is_null() {
            return Err(HookErrorKind::Backend("detour is null".into()));
        }
        let target = slot.get();
        if target.is_null() {
            return Err(HookErrorKind::NullTarget);
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&slot.address()) {
            return Err(HookErrorKind::AlreadyAttached);
        }

        let handle = unsafe { RawDetour::new(target as *const (), detour as *const ()) }
            .map_err(|e| HookErrorKind::Backend(e.to_string()))?;
        unsafe { handle.enable() }.map_err(|e| HookErrorKind::Backend(e.to_string()))?;

        let original = handle.trampoline() as *const () as usize;
        active.insert(
            slot.address(),
            InlineRecord {
                detour: detour as usize,
                original,
                handle: Handle(handle),
            },
        );
        Ok(())
    }

    fn detach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let record = match active.get(&slot.address()) {
            Some(record) if record.detour != detour as usize => {
                return Err(HookErrorKind::DetourMismatch);
            }
            Some(_) => active.remove(&slot.address()),
            // Already detached
            None => None,
        };

        if let Some(record) = record {
            if let Err(e) = unsafe { record.handle.0.disable() } {
                active.insert(slot.address(), record);
                return Err(HookErrorKind::Backend(e.to_string()));
            }
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.handle);
        }
        Ok(())
    }

    fn original(&self, slot: &ExportSlot) -> Option<*mut c_void> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active
            .get(&slot.address())
            .map(|record| record.original as *mut c_void)
    }

    fn is_attached(&self, slot: &ExportSlot) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.contains_key(&slot.address())
    }
}

impl Drop for InlineHooks {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (slot, record) in active.drain() {
            if let Err(e) = unsafe { record.handle.0.disable() } {
                log::warn!("Failed to remove hook on slot {:#x}: {}", slot, e);
            }
        }
    }
}
