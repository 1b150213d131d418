//! Mono embedding API surface.
//!
//! The runtime's types are opaque; only pointers to them ever cross the
//! boundary. [`Runtime`] wraps the bound [`SymbolTable`] with typed calls and
//! never calls through an export that did not resolve.

use monoboot_shared::{Export, Host, RuntimeVariantFlags, SymbolTable};
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::mem::size_of;
use std::ptr;

macro_rules! opaque {
    ($($name:ident),* $(,)?) => {
        $(
            #[repr(C)]
            pub struct $name {
                _private: [u8; 0],
            }
        )*
    };
}

opaque!(
    MonoDomain,
    MonoObject,
    MonoMethod,
    MonoClass,
    MonoProperty,
    MonoString,
    MonoAssembly,
    MonoImage,
    MonoThread,
);

pub type MonoJitInitFn = unsafe extern "C" fn(name: *const c_char) -> *mut MonoDomain;
pub type MonoJitInitVersionFn =
    unsafe extern "C" fn(name: *const c_char, version: *const c_char) -> *mut MonoDomain;
pub type MonoThreadCurrentFn = unsafe extern "C" fn() -> *mut MonoThread;
pub type MonoThreadSetMainFn = unsafe extern "C" fn(thread: *mut MonoThread);
pub type MonoDomainSetConfigFn =
    unsafe extern "C" fn(domain: *mut MonoDomain, base_dir: *const c_char, config: *const c_char);
pub type MonoSetPathFn = unsafe extern "C" fn(path: *const c_char);
pub type MonoRuntimeSetMainArgsFn = unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char) -> c_int;
pub type MonoRuntimeInvokeFn = unsafe extern "C" fn(
    method: *mut MonoMethod,
    obj: *mut c_void,
    params: *mut *mut c_void,
    exc: *mut *mut MonoObject,
) -> *mut MonoObject;
pub type MonoMethodGetNameFn = unsafe extern "C" fn(method: *mut MonoMethod) -> *const c_char;
pub type MonoObjectGetClassFn = unsafe extern "C" fn(obj: *mut MonoObject) -> *mut MonoClass;
pub type MonoClassGetPropertyFromNameFn =
    unsafe extern "C" fn(klass: *mut MonoClass, name: *const c_char) -> *mut MonoProperty;
pub type MonoPropertyGetGetMethodFn = unsafe extern "C" fn(prop: *mut MonoProperty) -> *mut MonoMethod;
pub type MonoStringToUtf8Fn = unsafe extern "C" fn(s: *mut MonoString) -> *mut c_char;
pub type MonoStringNewFn =
    unsafe extern "C" fn(domain: *mut MonoDomain, text: *const c_char) -> *mut MonoString;
pub type MonoFreeFn = unsafe extern "C" fn(ptr: *mut c_void);
pub type MonoAddInternalCallFn = unsafe extern "C" fn(name: *const c_char, method: *const c_void);
pub type MonoDomainAssemblyOpenFn =
    unsafe extern "C" fn(domain: *mut MonoDomain, path: *const c_char) -> *mut MonoAssembly;
pub type MonoAssemblyGetImageFn = unsafe extern "C" fn(assembly: *mut MonoAssembly) -> *mut MonoImage;
pub type MonoClassFromNameFn = unsafe extern "C" fn(
    image: *mut MonoImage,
    namespace: *const c_char,
    name: *const c_char,
) -> *mut MonoClass;
pub type MonoClassGetMethodFromNameFn = unsafe extern "C" fn(
    klass: *mut MonoClass,
    name: *const c_char,
    param_count: c_int,
) -> *mut MonoMethod;

/// Typed view over the bound exports.
#[derive(Clone, Copy)]
pub struct Runtime<'a> {
    table: &'a SymbolTable,
    host: &'a dyn Host,
    domain: *mut MonoDomain,
}

impl<'a> Runtime<'a> {
    pub fn new(table: &'a SymbolTable, host: &'a dyn Host, domain: *mut MonoDomain) -> Self {
        Self {
            table,
            host,
            domain,
        }
    }

    pub fn flags(&self) -> RuntimeVariantFlags {
        self.table.flags()
    }

    pub fn host(&self) -> &'a dyn Host {
        self.host
    }

    pub fn domain(&self) -> *mut MonoDomain {
        self.domain
    }

    pub fn symbols(&self) -> &'a SymbolTable {
        self.table
    }

    /// The export reinterpreted as the function pointer type `F`.
    ///
    /// `F` must be the `extern "C"` signature of `export`.
    pub fn export<F: Copy>(&self, export: Export) -> Option<F> {
        let addr = self.table.get(export)?;
        debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
        Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&addr) })
    }

    /// Release memory the runtime handed out, using whichever allocator the
    /// runtime build exports.
    ///
    /// # Safety
    /// `ptr` must have been allocated by the runtime.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let free = if self.flags().legacy {
            self.export::<MonoFreeFn>(Export::GFree)
        } else {
            self.export::<MonoFreeFn>(Export::Free)
        };
        if let Some(free) = free {
            unsafe { free(ptr) };
        }
    }

    /// Name of a managed method.
    ///
    /// # Safety
    /// `method` must be a live method handle.
    pub unsafe fn method_name(&self, method: *mut MonoMethod) -> Option<&'a CStr> {
        if method.is_null() {
            return None;
        }
        let get_name = self.export::<MonoMethodGetNameFn>(Export::MethodGetName)?;
        let name = unsafe { get_name(method) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) })
    }

    /// Invoke a managed method. Returns `None` only if the export is unbound.
    ///
    /// # Safety
    /// Arguments must match what the runtime expects for `method`.
    pub unsafe fn invoke(
        &self,
        method: *mut MonoMethod,
        obj: *mut c_void,
        params: *mut *mut c_void,
        exc: *mut *mut MonoObject,
    ) -> Option<*mut MonoObject> {
        let invoke = self.export::<MonoRuntimeInvokeFn>(Export::RuntimeInvoke)?;
        Some(unsafe { invoke(method, obj, params, exc) })
    }

    /// Convert a managed string to an owned Rust string, releasing the
    /// intermediate UTF-8 buffer.
    ///
    /// # Safety
    /// `s` must be a live managed string.
    pub unsafe fn string_to_utf8(&self, s: *mut MonoString) -> Option<String> {
        if s.is_null() {
            return None;
        }
        let to_utf8 = self.export::<MonoStringToUtf8Fn>(Export::StringToUtf8)?;
        let raw = unsafe { to_utf8(s) };
        if raw.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { self.free(raw as *mut c_void) };
        Some(text)
    }

    pub fn string_new(&self, text: &str) -> *mut MonoString {
        let (Some(new), Ok(text)) = (
            self.export::<MonoStringNewFn>(Export::StringNew),
            CString::new(text),
        ) else {
            return ptr::null_mut();
        };
        unsafe { new(self.domain, text.as_ptr()) }
    }

    /// Register a native function as the body of a managed `extern` method.
    pub fn add_internal_call(&self, name: &str, method: *const c_void) -> bool {
        let (Some(add), Ok(name)) = (
            self.export::<MonoAddInternalCallFn>(Export::AddInternalCall),
            CString::new(name),
        ) else {
            return false;
        };
        log::debug!("Registering internal call {:?}", name);
        unsafe { add(name.as_ptr(), method) };
        true
    }

    /// Load an assembly into the current domain.
    pub fn assembly_open(&self, path: &str) -> *mut MonoAssembly {
        let (Some(open), Ok(path)) = (
            self.export::<MonoDomainAssemblyOpenFn>(Export::DomainAssemblyOpen),
            CString::new(path),
        ) else {
            return ptr::null_mut();
        };
        if self.domain.is_null() {
            return ptr::null_mut();
        }
        unsafe { open(self.domain, path.as_ptr()) }
    }

    /// # Safety
    /// `assembly` must be a live assembly handle.
    pub unsafe fn assembly_image(&self, assembly: *mut MonoAssembly) -> *mut MonoImage {
        match self.export::<MonoAssemblyGetImageFn>(Export::AssemblyGetImage) {
            Some(get) if !assembly.is_null() => unsafe { get(assembly) },
            _ => ptr::null_mut(),
        }
    }

    /// # Safety
    /// `image` must be a live image handle.
    pub unsafe fn class_from_name(
        &self,
        image: *mut MonoImage,
        namespace: &str,
        name: &str,
    ) -> *mut MonoClass {
        let (Some(find), Ok(namespace), Ok(name)) = (
            self.export::<MonoClassFromNameFn>(Export::ClassFromName),
            CString::new(namespace),
            CString::new(name),
        ) else {
            return ptr::null_mut();
        };
        if image.is_null() {
            return ptr::null_mut();
        }
        unsafe { find(image, namespace.as_ptr(), name.as_ptr()) }
    }

    /// # Safety
    /// `klass` must be a live class handle.
    pub unsafe fn method_from_name(
        &self,
        klass: *mut MonoClass,
        name: &str,
        param_count: i32,
    ) -> *mut MonoMethod {
        let (Some(find), Ok(name)) = (
            self.export::<MonoClassGetMethodFromNameFn>(Export::ClassGetMethodFromName),
            CString::new(name),
        ) else {
            return ptr::null_mut();
        };
        if klass.is_null() {
            return ptr::null_mut();
        }
        unsafe { find(klass, name.as_ptr(), param_count) }
    }
}
