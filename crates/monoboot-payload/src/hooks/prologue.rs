//! Code patching for aarch64.
//!
//! The first four instructions of the target are overwritten with an absolute
//! branch to the detour:
//!
//! ```text
//! ldr x17, #8
//! br  x17
//! .quad detour
//! ```
//!
//! The displaced instructions are copied into a trampoline that ends in the
//! same kind of branch back to `target + 16`. Targets that start with
//! PC-relative instructions are refused rather than relocated.

#![cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]

use monoboot_shared::HookErrorKind;

/// Bytes overwritten at the start of a hooked function.
pub(crate) const PATCH_LEN: usize = 16;
pub(crate) const TRAMPOLINE_LEN: usize = PATCH_LEN * 2;

const LDR_X17_LITERAL_8: u32 = 0x5800_0051;
const BR_X17: u32 = 0xD61F_0220;

/// Absolute branch to `to`, clobbering x17 (IP1).
pub(crate) fn branch_stub(to: usize) -> [u8; PATCH_LEN] {
    let mut stub = [0u8; PATCH_LEN];
    stub[..4].copy_from_slice(&LDR_X17_LITERAL_8.to_le_bytes());
    stub[4..8].copy_from_slice(&BR_X17.to_le_bytes());
    stub[8..].copy_from_slice(&(to as u64).to_le_bytes());
    stub
}

/// Displaced instructions followed by a branch to the rest of the function.
pub(crate) fn trampoline(saved: &[u8; PATCH_LEN], resume: usize) -> [u8; TRAMPOLINE_LEN] {
    let mut code = [0u8; TRAMPOLINE_LEN];
    code[..PATCH_LEN].copy_from_slice(saved);
    code[PATCH_LEN..].copy_from_slice(&branch_stub(resume));
    code
}

pub(crate) fn words(bytes: &[u8; PATCH_LEN]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Instructions whose meaning depends on the address they execute at.
pub(crate) fn is_pc_relative(insn: u32) -> bool {
    // ADR, ADRP
    (insn & 0x1F00_0000) == 0x1000_0000
        // B, BL
        || (insn & 0x7C00_0000) == 0x1400_0000
        // B.cond
        || (insn & 0xFF00_0010) == 0x5400_0000
        // CBZ, CBNZ
        || (insn & 0x7E00_0000) == 0x3400_0000
        // TBZ, TBNZ
        || (insn & 0x7E00_0000) == 0x3600_0000
        // LDR (literal), LDRSW (literal), PRFM (literal)
        || (insn & 0x3B00_0000) == 0x1800_0000
}

/// BR, BLR, RET and friends.
pub(crate) fn is_register_branch(insn: u32) -> bool {
    (insn & 0xFE00_0000) == 0xD600_0000
}

/// Check that the first [`PATCH_LEN`] bytes of a function can run from a
/// trampoline unchanged.
pub(crate) fn check_displaced(insns: &[u32; 4]) -> Result<(), HookErrorKind> {
    for (index, &insn) in insns.iter().enumerate() {
        if is_pc_relative(insn) {
            return Err(HookErrorKind::Backend(format!(
                "instruction {} ({:#010x}) is PC-relative",
                index, insn
            )));
        }
        // A branch away before the last displaced slot means the patch would
        // spill into whatever follows the function
        if index + 1 < insns.len() && is_register_branch(insn) {
            return Err(HookErrorKind::Backend(format!(
                "function returns after {} instructions",
                index + 1
            )));
        }
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
pub use patch::PrologueHooks;

#[cfg(target_arch = "aarch64")]
mod patch {
    use super::*;
    use crate::hooks::{HookManager, HookResult};
    use monoboot_shared::ExportSlot;
    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::sync::{Mutex, PoisonError};

    struct PatchRecord {
        detour: usize,
        saved: [u8; PATCH_LEN],
        trampoline: usize,
    }

    /// Hooks the function a slot points to by rewriting its prologue.
    ///
    /// Records are keyed by the target's entry address. Trampolines are never
    /// freed: a thread may still be running through one after detach.
    #[derive(Default)]
    pub struct PrologueHooks {
        active: Mutex<HashMap<usize, PatchRecord>>,
    }

    impl PrologueHooks {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl HookManager for PrologueHooks {
        fn name(&self) -> &'static str {
            "prologue"
        }

        fn attach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult {
            if detour.is_null() {
                return Err(HookErrorKind::Backend("detour is null".into()));
            }
            let target = slot.get() as usize;
            if target == 0 {
                return Err(HookErrorKind::NullTarget);
            }

            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(&target) {
                return Err(HookErrorKind::AlreadyAttached);
            }

            // SAFETY: the slot holds a resolved function entry, which is mapped
            // and at least readable
            let saved = unsafe { std::ptr::read_unaligned(target as *const [u8; PATCH_LEN]) };
            check_displaced(&words(&saved))?;

            let code = trampoline(&saved, target + PATCH_LEN);
            let trampoline = memory::alloc_code(&code)?;
            // SAFETY: the prologue was checked to be at least PATCH_LEN bytes
            unsafe { memory::write_code(target, &branch_stub(detour as usize)) }?;

            active.insert(
                target,
                PatchRecord {
                    detour: detour as usize,
                    saved,
                    trampoline,
                },
            );
            Ok(())
        }

        fn detach(&self, slot: &ExportSlot, detour: *mut c_void) -> HookResult {
            let target = slot.get() as usize;
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let record = match active.get(&target) {
                Some(record) if record.detour != detour as usize => {
                    return Err(HookErrorKind::DetourMismatch);
                }
                Some(_) => active.remove(&target),
                // Already detached
                None => None,
            };

            if let Some(record) = record {
                // SAFETY: restores the bytes read from the same address on attach
                if let Err(e) = unsafe { memory::write_code(target, &record.saved) } {
                    active.insert(target, record);
                    return Err(e);
                }
            }
            Ok(())
        }

        fn original(&self, slot: &ExportSlot) -> Option<*mut c_void> {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active
                .get(&(slot.get() as usize))
                .map(|record| record.trampoline as *mut c_void)
        }

        fn is_attached(&self, slot: &ExportSlot) -> bool {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.contains_key(&(slot.get() as usize))
        }
    }

    impl Drop for PrologueHooks {
        fn drop(&mut self) {
            let active = self.active.get_mut().unwrap_or_else(PoisonError::into_inner);
            for (target, record) in active.drain() {
                // SAFETY: as in detach
                if let Err(e) = unsafe { memory::write_code(target, &record.saved) } {
                    log::warn!("Failed to restore {:#x}: {}", target, e);
                }
            }
        }
    }

    mod memory {
        use super::*;

        fn backend(err: impl std::fmt::Display) -> HookErrorKind {
            HookErrorKind::Backend(err.to_string())
        }

        /// Copy `code` into a fresh executable block and return its address.
        #[cfg(unix)]
        pub(super) fn alloc_code(code: &[u8]) -> Result<usize, HookErrorKind> {
            use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

            // SAFETY: anonymous private mapping, written before it is made
            // executable
            unsafe {
                let block = libc::mmap(
                    std::ptr::null_mut(),
                    code.len(),
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if block == MAP_FAILED {
                    return Err(backend(std::io::Error::last_os_error()));
                }
                std::ptr::copy_nonoverlapping(code.as_ptr(), block.cast::<u8>(), code.len());
                if libc::mprotect(block, code.len(), PROT_READ | PROT_EXEC) != 0 {
                    return Err(backend(std::io::Error::last_os_error()));
                }
                flush_icache(block as usize, code.len());
                Ok(block as usize)
            }
        }

        #[cfg(windows)]
        pub(super) fn alloc_code(code: &[u8]) -> Result<usize, HookErrorKind> {
            use windows::Win32::System::Memory::{
                MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_PROTECTION_FLAGS,
                PAGE_READWRITE, VirtualAlloc, VirtualProtect,
            };

            // SAFETY: fresh committed block, written before it is made executable
            unsafe {
                let block = VirtualAlloc(None, code.len(), MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
                if block.is_null() {
                    return Err(backend(std::io::Error::last_os_error()));
                }
                std::ptr::copy_nonoverlapping(code.as_ptr(), block.cast::<u8>(), code.len());
                let mut old = PAGE_PROTECTION_FLAGS::default();
                VirtualProtect(block, code.len(), PAGE_EXECUTE_READ, &mut old).map_err(backend)?;
                flush_icache(block as usize, code.len())?;
                Ok(block as usize)
            }
        }

        /// Overwrite code at `addr` and leave it executable again.
        ///
        /// # Safety
        ///
        /// `addr..addr + bytes.len()` must lie inside one function's code.
        #[cfg(unix)]
        pub(super) unsafe fn write_code(addr: usize, bytes: &[u8]) -> Result<(), HookErrorKind> {
            use libc::{PROT_EXEC, PROT_READ, PROT_WRITE};

            let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                size if size > 0 => size as usize,
                _ => return Err(backend("page size unavailable")),
            };
            let start = addr & !(page - 1);
            let len = (addr + bytes.len() - start).next_multiple_of(page);

            unsafe {
                let region = start as *mut libc::c_void;
                if libc::mprotect(region, len, PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
                    return Err(backend(std::io::Error::last_os_error()));
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
                if libc::mprotect(region, len, PROT_READ | PROT_EXEC) != 0 {
                    return Err(backend(std::io::Error::last_os_error()));
                }
                flush_icache(addr, bytes.len());
            }
            Ok(())
        }

        #[cfg(windows)]
        pub(super) unsafe fn write_code(addr: usize, bytes: &[u8]) -> Result<(), HookErrorKind> {
            use windows::Win32::System::Memory::{
                PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
            };

            let region = addr as *const c_void;
            let mut old = PAGE_PROTECTION_FLAGS::default();
            unsafe {
                VirtualProtect(region, bytes.len(), PAGE_EXECUTE_READWRITE, &mut old)
                    .map_err(backend)?;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
                let mut unused = PAGE_PROTECTION_FLAGS::default();
                VirtualProtect(region, bytes.len(), old, &mut unused).map_err(backend)?;
            }
            flush_icache(addr, bytes.len())
        }

        #[cfg(windows)]
        fn flush_icache(addr: usize, len: usize) -> Result<(), HookErrorKind> {
            use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
            use windows::Win32::System::Threading::GetCurrentProcess;

            unsafe { FlushInstructionCache(GetCurrentProcess(), Some(addr as *const c_void), len) }
                .map_err(backend)
        }

        /// Clean the data cache and invalidate the instruction cache over
        /// `addr..addr + len`.
        #[cfg(unix)]
        unsafe fn flush_icache(addr: usize, len: usize) {
            use std::arch::asm;

            let ctr: u64;
            unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
            let dline = 4usize << ((ctr >> 16) & 0xF);
            let iline = 4usize << (ctr & 0xF);
            let end = addr + len;

            let mut line = addr & !(dline - 1);
            while line < end {
                unsafe { asm!("dc cvau, {}", in(reg) line, options(nostack)) };
                line += dline;
            }
            unsafe { asm!("dsb ish", options(nostack)) };

            let mut line = addr & !(iline - 1);
            while line < end {
                unsafe { asm!("ic ivau, {}", in(reg) line, options(nostack)) };
                line += iline;
            }
            unsafe { asm!("dsb ish", "isb", options(nostack)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STP_FP_LR: u32 = 0xA9BF_7BFD;
    const MOV_FP_SP: u32 = 0x9100_03FD;
    const SUB_SP: u32 = 0xD101_03FF;
    const RET: u32 = 0xD65F_03C0;

    fn bytes(insns: [u32; 4]) -> [u8; PATCH_LEN] {
        let mut out = [0u8; PATCH_LEN];
        for (chunk, insn) in out.chunks_exact_mut(4).zip(insns) {
            chunk.copy_from_slice(&insn.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_branch_stub_layout() {
        let stub = branch_stub(0x0000_7F12_3456_7890);
        assert_eq!(words(&stub)[..2], [LDR_X17_LITERAL_8, BR_X17]);
        assert_eq!(
            u64::from_le_bytes(stub[8..].try_into().unwrap()),
            0x0000_7F12_3456_7890
        );
    }

    #[test]
    fn test_trampoline_resumes_after_patch() {
        let saved = bytes([STP_FP_LR, MOV_FP_SP, SUB_SP, MOV_FP_SP]);
        let code = trampoline(&saved, 0x4000 + PATCH_LEN);
        assert_eq!(code[..PATCH_LEN], saved);
        assert_eq!(code[PATCH_LEN..], branch_stub(0x4010));
    }

    #[test]
    fn test_ordinary_prologue_is_displaceable() {
        assert_eq!(check_displaced(&[STP_FP_LR, MOV_FP_SP, SUB_SP, MOV_FP_SP]), Ok(()));
        // Returning as the fourth instruction still leaves room for the patch
        assert_eq!(check_displaced(&[STP_FP_LR, MOV_FP_SP, SUB_SP, RET]), Ok(()));
    }

    #[test]
    fn test_pc_relative_instructions_refused() {
        let relative = [
            0x9000_0000, // adrp x0, 0
            0x1000_0000, // adr x0, 0
            0x9400_0000, // bl 0
            0x1400_0000, // b 0
            0x5400_0000, // b.eq 0
            0xB400_0000, // cbz x0, 0
            0x3600_0000, // tbz w0, #0, 0
            0x5800_0000, // ldr x0, 0
            LDR_X17_LITERAL_8,
        ];
        for insn in relative {
            assert!(is_pc_relative(insn), "{:#010x}", insn);
            let err = check_displaced(&[STP_FP_LR, insn, MOV_FP_SP, SUB_SP]).unwrap_err();
            assert!(matches!(err, HookErrorKind::Backend(msg) if msg.contains("PC-relative")));
        }
        for insn in [STP_FP_LR, MOV_FP_SP, SUB_SP, RET, BR_X17] {
            assert!(!is_pc_relative(insn), "{:#010x}", insn);
        }
    }

    #[test]
    fn test_short_function_refused() {
        assert!(is_register_branch(RET));
        assert!(is_register_branch(BR_X17));
        let err = check_displaced(&[MOV_FP_SP, RET, STP_FP_LR, SUB_SP]).unwrap_err();
        assert_eq!(
            err,
            HookErrorKind::Backend("function returns after 2 instructions".into())
        );
    }

    #[test]
    fn test_patched_function_cannot_be_patched_again() {
        // A second backend reading an already patched prologue sees the stub
        let err = check_displaced(&words(&branch_stub(0x1000))).unwrap_err();
        assert!(matches!(err, HookErrorKind::Backend(_)));
    }

    #[cfg(target_arch = "aarch64")]
    mod native {
        use super::super::PrologueHooks;
        use crate::hooks::HookManager;
        use monoboot_shared::{ExportSlot, HookErrorKind};
        use std::ffi::c_void;
        use std::hint::black_box;

        #[inline(never)]
        extern "C" fn checksum(x: i32) -> i32 {
            let mut acc = black_box(x);
            for i in 0..4 {
                acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
            }
            acc
        }

        #[inline(never)]
        extern "C" fn replacement(x: i32) -> i32 {
            black_box(-x)
        }

        fn call(addr: *mut c_void, x: i32) -> i32 {
            let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(black_box(addr)) };
            f(x)
        }

        #[test]
        fn test_prologue_round_trip() {
            let _serial = crate::testing::serial();
            let hooks = PrologueHooks::new();
            let slot = ExportSlot::empty();
            slot.set(checksum as *mut c_void);
            let expected = call(slot.get(), 7);

            hooks.attach(&slot, replacement as *mut c_void).unwrap();
            assert_eq!(slot.get(), checksum as *mut c_void);
            assert_eq!(call(slot.get(), 7), -7);
            assert_eq!(call(hooks.original(&slot).unwrap(), 7), expected);
            assert_eq!(
                hooks.attach(&slot, replacement as *mut c_void),
                Err(HookErrorKind::AlreadyAttached)
            );

            hooks.detach(&slot, replacement as *mut c_void).unwrap();
            assert!(!hooks.is_attached(&slot));
            assert_eq!(call(slot.get(), 7), expected);
            hooks.detach(&slot, replacement as *mut c_void).unwrap();
        }

        #[test]
        fn test_drop_restores_code() {
            let _serial = crate::testing::serial();
            let slot = ExportSlot::empty();
            slot.set(checksum as *mut c_void);
            let expected = call(slot.get(), 3);
            {
                let hooks = PrologueHooks::new();
                hooks.attach(&slot, replacement as *mut c_void).unwrap();
                assert_eq!(call(slot.get(), 3), -3);
            }
            assert_eq!(call(slot.get(), 3), expected);
        }
    }
}
