//! The extension subsystem the bootstrap starts.

use crate::context::RuntimeBootstrapContext;
use crate::relay;
use crate::runtime::{MonoMethod, MonoObject, MonoString, Runtime};
use monoboot_shared::LogLevel;
use std::ffi::{c_int, c_void};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// What the bootstrap calls into once the runtime is usable.
pub trait Extension: Send + Sync {
    /// Register native functions with the runtime before any managed extension
    /// code runs.
    fn register_internal_calls(&self, _runtime: &Runtime<'_>) {}

    /// Load the extension into the freshly created domain. Returning `false`
    /// leaves the host's invocations unhooked.
    fn load_manifest(&self, runtime: &Runtime<'_>) -> bool;

    /// Called once the host has reached a marker method.
    fn start(&self, runtime: &Runtime<'_>);
}

/// Runs a managed loader assembly: a static `Initialize()` when the manifest
/// loads and a static `Start()` when the extension starts.
pub struct ManagedEntryExtension {
    assembly: PathBuf,
    namespace: String,
    class: String,
    start: AtomicPtr<MonoMethod>,
}

impl ManagedEntryExtension {
    pub fn new(assembly: impl Into<PathBuf>, namespace: &str, class: &str) -> Self {
        Self {
            assembly: assembly.into(),
            namespace: namespace.to_string(),
            class: class.to_string(),
            start: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Invoke a parameterless static method, reporting any managed exception.
    fn call_static(&self, runtime: &Runtime<'_>, method: *mut MonoMethod) -> bool {
        let mut exception: *mut MonoObject = ptr::null_mut();
        let invoked = unsafe {
            runtime.invoke(
                method,
                ptr::null_mut::<c_void>(),
                ptr::null_mut(),
                &mut exception,
            )
        };
        if invoked.is_none() {
            return false;
        }
        if !exception.is_null() {
            unsafe { relay::report(runtime, exception) };
            return false;
        }
        true
    }
}

impl Extension for ManagedEntryExtension {
    fn register_internal_calls(&self, runtime: &Runtime<'_>) {
        let calls: [(&str, *const c_void); 3] = [
            ("NativeLog", native_log as *const c_void),
            ("IsNativeCompiled", is_native_compiled as *const c_void),
            ("GetBaseDirectory", base_directory as *const c_void),
        ];
        for (name, method) in calls {
            let name = format!("{}.{}::{}", self.namespace, self.class, name);
            if !runtime.add_internal_call(&name, method) {
                runtime.host().warn(&format!("Could not register {}", name));
            }
        }
    }

    fn load_manifest(&self, runtime: &Runtime<'_>) -> bool {
        let host = runtime.host();
        host.debug(&format!("Loading {}", self.assembly.display()));

        let assembly = runtime.assembly_open(&self.assembly.to_string_lossy());
        if assembly.is_null() {
            host.error(&format!("Failed to load {}", self.assembly.display()));
            return false;
        }

        let image = unsafe { runtime.assembly_image(assembly) };
        let class = unsafe { runtime.class_from_name(image, &self.namespace, &self.class) };
        if class.is_null() {
            host.error(&format!(
                "Failed to find {}.{}",
                self.namespace, self.class
            ));
            return false;
        }

        let initialize = unsafe { runtime.method_from_name(class, "Initialize", 0) };
        let start = unsafe { runtime.method_from_name(class, "Start", 0) };
        if initialize.is_null() || start.is_null() {
            host.error(&format!(
                "{}.{} is missing Initialize or Start",
                self.namespace, self.class
            ));
            return false;
        }
        self.start.store(start, Ordering::Release);

        self.call_static(runtime, initialize)
    }

    fn start(&self, runtime: &Runtime<'_>) {
        let start = self.start.load(Ordering::Acquire);
        if start.is_null() {
            runtime.host().warn("Extension start requested before it was loaded");
            return;
        }
        self.call_static(runtime, start);
    }
}

// Internal calls exposed to the managed loader. They reach the process state
// through the installed context.

extern "C" fn native_log(level: c_int, message: *mut MonoString) {
    let Some(ctx) = RuntimeBootstrapContext::installed() else {
        return;
    };
    let Some(runtime) = ctx.runtime() else {
        return;
    };
    let level = LogLevel::from(u8::try_from(level).unwrap_or(u8::MAX));
    if let Some(text) = unsafe { runtime.string_to_utf8(message) } {
        ctx.host().log(level, &text);
    }
}

extern "C" fn is_native_compiled() -> bool {
    RuntimeBootstrapContext::installed()
        .and_then(|ctx| ctx.flags())
        .is_some_and(|flags| flags.native_compiled)
}

extern "C" fn base_directory() -> *mut MonoString {
    let Some(ctx) = RuntimeBootstrapContext::installed() else {
        return ptr::null_mut();
    };
    match ctx.runtime() {
        Some(runtime) => runtime.string_new(&ctx.host().base_dir().to_string_lossy()),
        None => ptr::null_mut(),
    }
}
