//! The one-shot bootstrap state machine.
//!
//! ```text
//! Unstarted -> LibraryLoaded -> ExportsResolved -> DomainHookArmed -> DomainCreated
//!           -> InvokeHookArmed -> InvokeHookFired -> Done
//! ```
//!
//! Interpreted hosts create the domain themselves through
//! `mono_jit_init_version`; the bootstrap hooks that call, does its work inside
//! the detour, and removes the hook before returning. Native-compiled hosts
//! never call into the runtime on their own, so the domain is created directly.
//! Either way, once the extension manifest has loaded, `mono_runtime_invoke` is
//! hooked until the host invokes one of the marker methods, at which point the
//! extension is started and that hook removes itself too.

use crate::context::{BootstrapState, RuntimeBootstrapContext};
use crate::runtime::{
    MonoDomain, MonoDomainSetConfigFn, MonoJitInitFn, MonoJitInitVersionFn, MonoMethod,
    MonoObject, MonoRuntimeInvokeFn, MonoRuntimeSetMainArgsFn, MonoSetPathFn,
    MonoThreadCurrentFn, MonoThreadSetMainFn, Runtime,
};
use monoboot_shared::exports::{self, BindPolicy};
use monoboot_shared::loader::{library_file_name, load_first};
use monoboot_shared::{
    Error, Export, LEGACY_LIBRARY_NAME, LIBRARY_NAMES, MARKER_METHODS, POSIX_HELPER_NAME,
    Result, RuntimeVariantFlags, locator,
};
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering;

impl RuntimeBootstrapContext {
    /// Run the bootstrap up to the point where the host takes over.
    ///
    /// Any failure is reported through [`Host::fatal`](monoboot_shared::Host::fatal).
    /// Returns whether the bootstrap is armed.
    pub fn bootstrap(&self) -> bool {
        match self.try_bootstrap() {
            Ok(()) => true,
            Err(e) => {
                self.host.fatal(&e);
                false
            }
        }
    }

    pub fn try_bootstrap(&self) -> Result<()> {
        self.load_library()?;
        self.bind_exports()?;
        self.arm_domain_hook()
    }

    /// Resolve the runtime paths, fix the variant flags and load the runtime
    /// and its helper library.
    pub fn load_library(&self) -> Result<()> {
        self.expect_state(BootstrapState::Unstarted)?;
        self.host.debug("Initializing Mono...");

        let native_compiled = self.host.native_compiled();
        let paths = locator::locate(self.host(), native_compiled)?;
        let mut legacy = locator::is_legacy_layout(self.host(), &paths);

        let (index, library) = load_first(&*self.loader, &paths.base_path, LIBRARY_NAMES)?;
        if LIBRARY_NAMES[index] == LEGACY_LIBRARY_NAME {
            legacy = true;
        }
        self.host
            .debug(&format!("Loaded Mono from {}", library.path().display()));

        let helper_path = paths.base_path.join(library_file_name(POSIX_HELPER_NAME));
        let helper = match self.loader.open(&helper_path) {
            Ok(helper) => Some(helper),
            Err(e) if !legacy => return Err(e),
            Err(e) => {
                self.host.warn(&format!(
                    "Mono Posix Helper not loaded on legacy runtime: {}",
                    e
                ));
                None
            }
        };

        let flags = RuntimeVariantFlags::new(legacy, native_compiled);
        self.host.debug(&format!("Mono variant: {:?}", flags));

        let _ = self.paths.set(paths);
        let _ = self.flags.set(flags);
        let _ = self.library.set(library);
        let _ = self.posix_helper.set(helper);
        self.transition(BootstrapState::Unstarted, BootstrapState::LibraryLoaded)
    }

    /// Bind every export the runtime variant requires.
    pub fn bind_exports(&self) -> Result<()> {
        self.expect_state(BootstrapState::LibraryLoaded)?;
        self.host.debug("Initializing Mono Exports...");

        let (Some(library), Some(flags)) = (self.library.get(), self.flags()) else {
            return Err(Error::Other("Mono library not loaded".into()));
        };
        let table = exports::resolve(library, flags, BindPolicy::Abort)?;
        let _ = self.symbols.set(table);
        self.transition(BootstrapState::LibraryLoaded, BootstrapState::ExportsResolved)
    }

    /// Hook domain creation, or create the domain right away on native-compiled
    /// hosts.
    pub fn arm_domain_hook(&self) -> Result<()> {
        self.expect_state(BootstrapState::ExportsResolved)?;
        let flags = self.bound_flags()?;

        if flags.native_compiled {
            return self.create_domain_directly();
        }

        self.host.debug("Attaching Hook to mono_jit_init_version...");
        self.attach(Export::JitInitVersion, domain_init_detour as *mut c_void)?;
        self.transition(BootstrapState::ExportsResolved, BootstrapState::DomainHookArmed)
    }

    /// Create the domain without waiting for the host. Calling it again once a
    /// domain exists does nothing.
    ///
    /// The domain lives in the bundled runtime, and so does the invoke hook
    /// armed afterwards. A native-compiled host's own code never calls into
    /// that runtime, so the marker methods only fire for callers that use it.
    pub fn create_domain_directly(&self) -> Result<()> {
        if !self.domain().is_null() {
            return Ok(());
        }
        let flags = self.bound_flags()?;
        let paths = self
            .paths
            .get()
            .ok_or_else(|| Error::Other("Mono paths not resolved".into()))?;
        let runtime = self.bound_runtime()?;

        self.host.debug("Creating Mono Domain...");
        let managed = path_cstring(&paths.managed_path)?;
        let config = path_cstring(&paths.config_path)?;
        let set_assemblies_path =
            self.required::<MonoSetPathFn>(&runtime, Export::SetAssembliesPath)?;
        let set_root_dir = self.required::<MonoSetPathFn>(&runtime, Export::AssemblySetRootDir)?;
        let set_config_dir = self.required::<MonoSetPathFn>(&runtime, Export::SetConfigDir)?;
        unsafe {
            set_assemblies_path(managed.as_ptr());
            set_root_dir(managed.as_ptr());
            set_config_dir(config.as_ptr());
        }

        let args = self.host.main_args();
        if !flags.legacy && !args.is_empty() {
            self.set_main_args(&runtime, &args)?;
        }

        let jit_init = self.required::<MonoJitInitFn>(&runtime, Export::JitInit)?;
        let domain = unsafe { jit_init(self.domain_name.as_ptr()) };
        if domain.is_null() {
            return Err(Error::Other("mono_jit_init returned no domain".into()));
        }
        self.domain.store(domain, Ordering::Release);
        self.transition(BootstrapState::ExportsResolved, BootstrapState::DomainCreated)?;

        self.on_domain_ready(domain, &self.domain_name)
    }

    /// Body of the `mono_jit_init_version` detour.
    ///
    /// Removes its own hook first, so every later call goes straight to the
    /// runtime, then creates the domain exactly as the host asked and finishes
    /// setting it up before the host sees it.
    ///
    /// # Safety
    /// Must only be called in place of `mono_jit_init_version`, with the host's
    /// arguments.
    pub unsafe fn on_domain_init(
        &self,
        name: *const c_char,
        version: *const c_char,
    ) -> *mut MonoDomain {
        let Some(symbols) = self.symbols.get() else {
            return ptr::null_mut();
        };
        let slot = symbols.slot(Export::JitInitVersion);

        let claimed = self
            .domain_hook_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            let real = self.hooks.original(slot).unwrap_or_else(|| slot.get());
            if real.is_null() || real == domain_init_detour as *mut c_void {
                return ptr::null_mut();
            }
            let real: MonoJitInitVersionFn = unsafe { std::mem::transmute(real) };
            return unsafe { real(name, version) };
        }

        self.host.debug("Detaching Hook from mono_jit_init_version...");
        if let Err(e) = self.detach(Export::JitInitVersion, domain_init_detour as *mut c_void) {
            self.host.fatal(&e);
        }

        // Detached: the slot now reaches the runtime directly
        let real: MonoJitInitVersionFn = unsafe { std::mem::transmute(slot.get()) };
        self.host.debug("Creating Mono Domain...");
        let domain = unsafe { real(name, version) };
        if domain.is_null() {
            self.host
                .warn("mono_jit_init_version returned no domain; skipping extension");
            return domain;
        }

        self.domain.store(domain, Ordering::Release);
        if let Err(e) =
            self.transition(BootstrapState::DomainHookArmed, BootstrapState::DomainCreated)
        {
            self.host.fatal(&e);
            return domain;
        }

        let name = if name.is_null() {
            self.domain_name.as_c_str()
        } else {
            unsafe { CStr::from_ptr(name) }
        };
        if let Err(e) = self.on_domain_ready(domain, name) {
            self.host.fatal(&e);
        }
        domain
    }

    /// Body of the `mono_runtime_invoke` detour.
    ///
    /// Transparent for every call: the arguments go to the real function and
    /// its result comes back untouched. The first marker call additionally
    /// removes the hook and starts the extension.
    ///
    /// # Safety
    /// Must only be called in place of `mono_runtime_invoke`, with the caller's
    /// arguments.
    pub unsafe fn on_runtime_invoke(
        &self,
        method: *mut MonoMethod,
        obj: *mut c_void,
        params: *mut *mut c_void,
        exc: *mut *mut MonoObject,
    ) -> *mut MonoObject {
        let Some(runtime) = self.runtime() else {
            return ptr::null_mut();
        };
        let slot = runtime.symbols().slot(Export::RuntimeInvoke);
        let real = self.hooks.original(slot).unwrap_or_else(|| slot.get());
        if real == runtime_invoke_detour as *mut c_void || real.is_null() {
            return ptr::null_mut();
        }
        let real: MonoRuntimeInvokeFn = unsafe { std::mem::transmute(real) };

        if unsafe { is_marker(&runtime, method) }
            && self
                .invoke_hook_fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.host.debug("Detaching Hook from mono_runtime_invoke...");
            match self.detach(Export::RuntimeInvoke, runtime_invoke_detour as *mut c_void) {
                Ok(()) => self.start_extension(&runtime),
                Err(e) => self.host.fatal(&e),
            }
        }

        unsafe { real(method, obj, params, exc) }
    }

    /// Shared tail of both domain creation paths.
    fn on_domain_ready(&self, domain: *mut MonoDomain, name: &CStr) -> Result<()> {
        let flags = self.bound_flags()?;
        let runtime = Runtime::new(self.bound_symbols()?, self.host(), domain);

        let thread_current = self.required::<MonoThreadCurrentFn>(&runtime, Export::ThreadCurrent)?;
        let thread_set_main = self.required::<MonoThreadSetMainFn>(&runtime, Export::ThreadSetMain)?;
        unsafe { thread_set_main(thread_current()) };

        if !flags.legacy {
            let set_config =
                self.required::<MonoDomainSetConfigFn>(&runtime, Export::DomainSetConfig)?;
            let base_dir = path_cstring(self.host.base_dir())?;
            unsafe { set_config(domain, base_dir.as_ptr(), name.as_ptr()) };
        }

        self.extension.register_internal_calls(&runtime);
        if !self.extension.load_manifest(&runtime) {
            self.host
                .warn("Extension manifest failed to load; mono_runtime_invoke stays unhooked");
            return self.transition(BootstrapState::DomainCreated, BootstrapState::Done);
        }

        self.host.debug("Attaching Hook to mono_runtime_invoke...");
        self.attach(Export::RuntimeInvoke, runtime_invoke_detour as *mut c_void)?;
        self.transition(BootstrapState::DomainCreated, BootstrapState::InvokeHookArmed)
    }

    fn start_extension(&self, runtime: &Runtime<'_>) {
        if let Err(e) =
            self.transition(BootstrapState::InvokeHookArmed, BootstrapState::InvokeHookFired)
        {
            self.host.fatal(&e);
            return;
        }
        self.extension.start(runtime);
        if let Err(e) = self.transition(BootstrapState::InvokeHookFired, BootstrapState::Done) {
            self.host.fatal(&e);
        }
    }

    fn set_main_args(&self, runtime: &Runtime<'_>, args: &[String]) -> Result<()> {
        let set_main_args =
            self.required::<MonoRuntimeSetMainArgsFn>(runtime, Export::RuntimeSetMainArgs)?;
        let owned = args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Other(e.to_string()))?;
        // The runtime keeps argv around; the strings live as long as the context
        let owned = self.main_args.get_or_init(|| owned);
        let mut argv: Vec<*mut c_char> = owned.iter().map(|a| a.as_ptr() as *mut c_char).collect();
        unsafe { set_main_args(argv.len() as c_int, argv.as_mut_ptr()) };
        Ok(())
    }

    fn attach(&self, export: Export, detour: *mut c_void) -> Result<()> {
        let symbols = self.bound_symbols()?;
        self.hooks
            .attach(symbols.slot(export), detour)
            .map_err(|kind| Error::hook(export.name(), kind))
    }

    fn detach(&self, export: Export, detour: *mut c_void) -> Result<()> {
        let symbols = self.bound_symbols()?;
        self.hooks
            .detach(symbols.slot(export), detour)
            .map_err(|kind| Error::hook(export.name(), kind))
    }

    fn required<F: Copy>(&self, runtime: &Runtime<'_>, export: Export) -> Result<F> {
        runtime.export::<F>(export).ok_or(Error::Bind {
            missing: vec![export.name()],
        })
    }

    fn bound_flags(&self) -> Result<RuntimeVariantFlags> {
        self.flags()
            .ok_or_else(|| Error::Other("runtime variant not determined".into()))
    }

    fn bound_symbols(&self) -> Result<&monoboot_shared::SymbolTable> {
        self.symbols
            .get()
            .ok_or_else(|| Error::Other("Mono exports not bound".into()))
    }

    fn bound_runtime(&self) -> Result<Runtime<'_>> {
        self.runtime()
            .ok_or_else(|| Error::Other("Mono exports not bound".into()))
    }
}

unsafe fn is_marker(runtime: &Runtime<'_>, method: *mut MonoMethod) -> bool {
    let Some(name) = (unsafe { runtime.method_name(method) }) else {
        return false;
    };
    let name = name.to_bytes();
    MARKER_METHODS
        .iter()
        .any(|marker| name.windows(marker.len()).any(|w| w == marker.as_bytes()))
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().into_owned()).map_err(|e| Error::Other(e.to_string()))
}

/// Installed in place of `mono_jit_init_version`.
pub unsafe extern "C" fn domain_init_detour(
    name: *const c_char,
    version: *const c_char,
) -> *mut MonoDomain {
    match RuntimeBootstrapContext::installed() {
        Some(ctx) => unsafe { ctx.on_domain_init(name, version) },
        None => ptr::null_mut(),
    }
}

/// Installed in place of `mono_runtime_invoke`.
pub unsafe extern "C" fn runtime_invoke_detour(
    method: *mut MonoMethod,
    obj: *mut c_void,
    params: *mut *mut c_void,
    exc: *mut *mut MonoObject,
) -> *mut MonoObject {
    match RuntimeBootstrapContext::installed() {
        Some(ctx) => unsafe { ctx.on_runtime_invoke(method, obj, params, exc) },
        None => ptr::null_mut(),
    }
}
