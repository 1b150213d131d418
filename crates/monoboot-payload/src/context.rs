//! Process-wide bootstrap context.
//!
//! One [`RuntimeBootstrapContext`] exists per process. The entry point builds
//! it, installs it, and every component reaches the shared state through it.

use crate::extension::Extension;
use crate::hooks::{HookManager, default_hooks};
use crate::runtime::{MonoDomain, Runtime};
use monoboot_shared::{
    Error, Host, Library, LibraryLoader, PathSet, Result, RuntimeVariantFlags, SymbolTable,
    SystemLoader,
};
use std::ffi::CString;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

/// Bootstrap progress. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Unstarted = 0,
    LibraryLoaded = 1,
    ExportsResolved = 2,
    DomainHookArmed = 3,
    DomainCreated = 4,
    InvokeHookArmed = 5,
    InvokeHookFired = 6,
    Done = 7,
}

impl BootstrapState {
    pub const fn name(self) -> &'static str {
        match self {
            BootstrapState::Unstarted => "Unstarted",
            BootstrapState::LibraryLoaded => "LibraryLoaded",
            BootstrapState::ExportsResolved => "ExportsResolved",
            BootstrapState::DomainHookArmed => "DomainHookArmed",
            BootstrapState::DomainCreated => "DomainCreated",
            BootstrapState::InvokeHookArmed => "InvokeHookArmed",
            BootstrapState::InvokeHookFired => "InvokeHookFired",
            BootstrapState::Done => "Done",
        }
    }
}

impl From<u8> for BootstrapState {
    fn from(v: u8) -> Self {
        match v {
            0 => BootstrapState::Unstarted,
            1 => BootstrapState::LibraryLoaded,
            2 => BootstrapState::ExportsResolved,
            3 => BootstrapState::DomainHookArmed,
            4 => BootstrapState::DomainCreated,
            5 => BootstrapState::InvokeHookArmed,
            6 => BootstrapState::InvokeHookFired,
            _ => BootstrapState::Done,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static INSTALLED: AtomicPtr<RuntimeBootstrapContext> = AtomicPtr::new(std::ptr::null_mut());

/// Everything the bootstrap owns for the lifetime of the process.
pub struct RuntimeBootstrapContext {
    pub(crate) host: Box<dyn Host>,
    pub(crate) extension: Box<dyn Extension>,
    pub(crate) hooks: Box<dyn HookManager>,
    pub(crate) loader: Box<dyn LibraryLoader>,
    pub(crate) domain_name: CString,

    state: AtomicU8,
    pub(crate) paths: OnceLock<PathSet>,
    pub(crate) flags: OnceLock<RuntimeVariantFlags>,
    pub(crate) library: OnceLock<Library>,
    pub(crate) posix_helper: OnceLock<Option<Library>>,
    pub(crate) symbols: OnceLock<SymbolTable>,
    pub(crate) main_args: OnceLock<Vec<CString>>,
    pub(crate) domain: AtomicPtr<MonoDomain>,

    pub(crate) domain_hook_fired: AtomicBool,
    pub(crate) invoke_hook_fired: AtomicBool,
}

impl RuntimeBootstrapContext {
    /// A context using the platform's default hook backend and system loader.
    pub fn new(host: Box<dyn Host>, extension: Box<dyn Extension>) -> Self {
        Self {
            host,
            extension,
            hooks: default_hooks(),
            loader: Box::new(SystemLoader),
            domain_name: c"MelonLoader".to_owned(),
            state: AtomicU8::new(BootstrapState::Unstarted as u8),
            paths: OnceLock::new(),
            flags: OnceLock::new(),
            library: OnceLock::new(),
            posix_helper: OnceLock::new(),
            symbols: OnceLock::new(),
            main_args: OnceLock::new(),
            domain: AtomicPtr::new(std::ptr::null_mut()),
            domain_hook_fired: AtomicBool::new(false),
            invoke_hook_fired: AtomicBool::new(false),
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn HookManager>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_loader(mut self, loader: Box<dyn LibraryLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Name given to the domain when the bootstrap creates it itself.
    pub fn with_domain_name(mut self, name: &str) -> Result<Self> {
        self.domain_name = CString::new(name).map_err(|e| Error::Other(e.to_string()))?;
        Ok(self)
    }

    /// Leak the context and make it reachable from the detour entry points.
    pub fn install(self: Box<Self>) -> Result<&'static Self> {
        let ptr = Box::into_raw(self);
        if INSTALLED
            .compare_exchange(std::ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: `ptr` came from `Box::into_raw` above and was never shared
            drop(unsafe { Box::from_raw(ptr) });
            return Err(Error::Other("bootstrap context already installed".into()));
        }
        // SAFETY: installed contexts are never freed
        Ok(unsafe { &*ptr })
    }

    /// The context installed by the entry point, if any.
    pub fn installed() -> Option<&'static Self> {
        // SAFETY: only `install` stores a process-lifetime pointer, and scoped
        // installs are undone before their context goes away
        unsafe { INSTALLED.load(Ordering::Acquire).as_ref() }
    }

    /// Make this context the installed one until the guard drops.
    #[cfg(test)]
    pub(crate) fn install_scoped(&self) -> ScopedInstall<'_> {
        let ptr = self as *const Self as *mut Self;
        let previous = INSTALLED.swap(ptr, Ordering::AcqRel);
        ScopedInstall {
            previous,
            _ctx: std::marker::PhantomData,
        }
    }

    pub fn state(&self) -> BootstrapState {
        BootstrapState::from(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing if another transition got there first.
    pub(crate) fn transition(&self, from: BootstrapState, to: BootstrapState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| Error::InvalidState {
                expected: from.name(),
                actual: BootstrapState::from(actual).name(),
            })
    }

    pub(crate) fn expect_state(&self, expected: BootstrapState) -> Result<()> {
        let actual = self.state();
        if actual != expected {
            return Err(Error::InvalidState {
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }

    pub fn host(&self) -> &dyn Host {
        &*self.host
    }

    pub fn hooks(&self) -> &dyn HookManager {
        &*self.hooks
    }

    pub fn paths(&self) -> Option<&PathSet> {
        self.paths.get()
    }

    pub fn flags(&self) -> Option<RuntimeVariantFlags> {
        self.flags.get().copied()
    }

    pub fn symbols(&self) -> Option<&SymbolTable> {
        self.symbols.get()
    }

    /// Whether the helper library was absent on a legacy runtime.
    ///
    /// Tolerated, but reported: later behavior without it is unverified.
    pub fn posix_helper_missing(&self) -> bool {
        matches!(self.posix_helper.get(), Some(None))
    }

    pub fn domain(&self) -> *mut MonoDomain {
        self.domain.load(Ordering::Acquire)
    }

    /// Typed access to the bound exports, once binding has happened.
    pub fn runtime(&self) -> Option<Runtime<'_>> {
        let symbols = self.symbols.get()?;
        Some(Runtime::new(symbols, self.host(), self.domain()))
    }
}

#[cfg(test)]
pub(crate) struct ScopedInstall<'a> {
    previous: *mut RuntimeBootstrapContext,
    _ctx: std::marker::PhantomData<&'a RuntimeBootstrapContext>,
}

#[cfg(test)]
impl Drop for ScopedInstall<'_> {
    fn drop(&mut self) {
        INSTALLED.store(self.previous, Ordering::Release);
    }
}
