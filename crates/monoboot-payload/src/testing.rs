//! Test doubles for the host, the runtime library and the extension.

use crate::extension::Extension;
use crate::runtime::{MonoDomain, MonoMethod, MonoObject, MonoThread, Runtime};
use monoboot_shared::loader::library_file_name;
use monoboot_shared::{Error, Export, Host, Library, LibraryLoader, LogLevel, Result, SymbolSource};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const FAKE_DOMAIN: usize = 0xD0_0000;
pub const FAKE_THREAD: usize = 0x7E_0000;
pub const INVOKE_TAG: usize = 0x5A5A;

static SERIAL: Mutex<()> = Mutex::new(());

/// Held by every test that patches code shared across tests.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RecordingHost {
    pub base: PathBuf,
    pub data: PathBuf,
    pub native: bool,
    pub dirs: HashSet<PathBuf>,
    pub files: HashSet<PathBuf>,
    pub args: Vec<String>,
    pub logs: Mutex<Vec<(LogLevel, String)>>,
    pub fatals: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn fatals(&self) -> Vec<String> {
        self.fatals.lock().unwrap().clone()
    }
}

impl Host for RecordingHost {
    fn base_dir(&self) -> &Path {
        &self.base
    }

    fn data_dir(&self) -> &Path {
        &self.data
    }

    fn native_compiled(&self) -> bool {
        self.native
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    fn main_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.logs.lock().unwrap().push((level, msg.to_string()));
    }

    fn fatal(&self, error: &Error) {
        self.fatals.lock().unwrap().push(error.to_string());
    }
}

/// A host with no runtime folders.
pub fn host() -> RecordingHost {
    RecordingHost {
        base: PathBuf::from("/game"),
        data: PathBuf::from("/game/Game_Data"),
        native: false,
        dirs: HashSet::new(),
        files: HashSet::new(),
        args: Vec::new(),
        logs: Mutex::new(Vec::new()),
        fatals: Mutex::new(Vec::new()),
    }
}

/// Runtime folder used by [`interpreted_host`].
pub fn interpreted_runtime_dir() -> PathBuf {
    PathBuf::from("/game/Game_Data/MonoBleedingEdge")
}

/// Runtime folder used by [`native_host`].
pub fn native_runtime_dir() -> PathBuf {
    PathBuf::from("/game/MelonLoader/Dependencies/MonoBleedingEdge")
}

pub fn interpreted_host() -> RecordingHost {
    let mut host = host();
    host.dirs.insert(interpreted_runtime_dir());
    host
}

pub fn native_host() -> RecordingHost {
    let mut host = host();
    host.native = true;
    host.dirs.insert(native_runtime_dir());
    host
}

thread_local! {
    static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn record(call: String) {
    CALLS.with(|c| c.borrow_mut().push(call));
}

/// Calls made into the fake runtime on this thread.
pub fn calls() -> Vec<String> {
    CALLS.with(|c| c.borrow().clone())
}

pub fn reset_calls() {
    CALLS.with(|c| c.borrow_mut().clear());
}

fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

extern "C" fn jit_init(name: *const c_char) -> *mut MonoDomain {
    record(format!("jit_init:{}", text(name)));
    FAKE_DOMAIN as *mut MonoDomain
}

extern "C" fn jit_init_version(name: *const c_char, version: *const c_char) -> *mut MonoDomain {
    record(format!("jit_init_version:{}:{}", text(name), text(version)));
    FAKE_DOMAIN as *mut MonoDomain
}

extern "C" fn thread_current() -> *mut MonoThread {
    FAKE_THREAD as *mut MonoThread
}

extern "C" fn thread_set_main(thread: *mut MonoThread) {
    assert_eq!(thread as usize, FAKE_THREAD);
    record("thread_set_main".into());
}

extern "C" fn domain_set_config(domain: *mut MonoDomain, base: *const c_char, config: *const c_char) {
    assert_eq!(domain as usize, FAKE_DOMAIN);
    record(format!("domain_set_config:{}:{}", text(base), text(config)));
}

extern "C" fn set_assemblies_path(path: *const c_char) {
    record(format!("set_assemblies_path:{}", text(path)));
}

extern "C" fn assembly_setrootdir(path: *const c_char) {
    record(format!("assembly_setrootdir:{}", text(path)));
}

extern "C" fn set_config_dir(path: *const c_char) {
    record(format!("set_config_dir:{}", text(path)));
}

extern "C" fn runtime_set_main_args(argc: c_int, argv: *mut *mut c_char) -> c_int {
    let args: Vec<String> = (0..argc as usize)
        .map(|i| text(unsafe { *argv.add(i) }))
        .collect();
    record(format!("set_main_args:{}", args.join(" ")));
    0
}

/// Method handles in tests are C strings holding the method name.
extern "C" fn method_get_name(method: *mut MonoMethod) -> *const c_char {
    method as *const c_char
}

/// Returns a value derived from the method so pass-through can be checked.
pub extern "C" fn runtime_invoke(
    method: *mut MonoMethod,
    _obj: *mut c_void,
    _params: *mut *mut c_void,
    _exc: *mut *mut MonoObject,
) -> *mut MonoObject {
    record("runtime_invoke".into());
    (method as usize ^ INVOKE_TAG) as *mut MonoObject
}

extern "C" fn unused() {}

/// Runtime library exporting every manifest symbol.
pub struct FakeRuntime {
    symbols: HashMap<&'static str, usize>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let mut symbols: HashMap<&'static str, usize> = Export::ALL
            .iter()
            .map(|e| (e.name(), unused as usize))
            .collect();
        let specific: [(Export, usize); 11] = [
            (Export::JitInit, jit_init as usize),
            (Export::JitInitVersion, jit_init_version as usize),
            (Export::ThreadCurrent, thread_current as usize),
            (Export::ThreadSetMain, thread_set_main as usize),
            (Export::DomainSetConfig, domain_set_config as usize),
            (Export::SetAssembliesPath, set_assemblies_path as usize),
            (Export::AssemblySetRootDir, assembly_setrootdir as usize),
            (Export::SetConfigDir, set_config_dir as usize),
            (Export::RuntimeSetMainArgs, runtime_set_main_args as usize),
            (Export::MethodGetName, method_get_name as usize),
            (Export::RuntimeInvoke, runtime_invoke as usize),
        ];
        for (export, addr) in specific {
            symbols.insert(export.name(), addr);
        }
        Self { symbols }
    }

    pub fn without(mut self, name: &str) -> Self {
        self.symbols.remove(name);
        self
    }

    pub fn address(export: Export) -> usize {
        FakeRuntime::new().symbols[export.name()]
    }
}

impl SymbolSource for FakeRuntime {
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        self.symbols
            .get(name)
            .and_then(|addr| NonNull::new(*addr as *mut c_void))
    }
}

/// Loads [`FakeRuntime`] for the listed library base names in one directory.
pub struct FakeLoader {
    dir: PathBuf,
    available: HashSet<String>,
    missing_export: Option<&'static str>,
}

impl FakeLoader {
    pub fn new(dir: PathBuf, names: &[&str]) -> Self {
        Self {
            dir,
            available: names.iter().map(|n| library_file_name(n)).collect(),
            missing_export: None,
        }
    }

    pub fn without_export(mut self, name: &'static str) -> Self {
        self.missing_export = Some(name);
        self
    }
}

impl LibraryLoader for FakeLoader {
    fn open(&self, path: &Path) -> Result<Library> {
        let known = path.parent() == Some(self.dir.as_path())
            && path
                .file_name()
                .is_some_and(|f| self.available.contains(&*f.to_string_lossy()));
        if !known {
            return Err(Error::LibraryLoad {
                library: path.display().to_string(),
                reason: "not found".into(),
            });
        }

        let mut runtime = FakeRuntime::new();
        if let Some(name) = self.missing_export {
            runtime = runtime.without(name);
        }
        Ok(Library::new(path, Box::new(runtime)))
    }
}

/// Counts extension calls.
#[derive(Default)]
pub struct ExtensionCounts {
    pub registered: AtomicUsize,
    pub loaded: AtomicUsize,
    pub started: AtomicUsize,
    pub manifest_fails: bool,
}

pub struct RecordingExtension(pub Arc<ExtensionCounts>);

impl Extension for RecordingExtension {
    fn register_internal_calls(&self, _runtime: &Runtime<'_>) {
        self.0.registered.fetch_add(1, Ordering::SeqCst);
    }

    fn load_manifest(&self, runtime: &Runtime<'_>) -> bool {
        assert_eq!(runtime.domain() as usize, FAKE_DOMAIN);
        self.0.loaded.fetch_add(1, Ordering::SeqCst);
        !self.0.manifest_fails
    }

    fn start(&self, _runtime: &Runtime<'_>) {
        self.0.started.fetch_add(1, Ordering::SeqCst);
    }
}
