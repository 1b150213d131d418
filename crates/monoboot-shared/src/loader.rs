//! Shared library loading and export lookup.

use crate::{Error, Result};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Anything exports can be looked up in by name.
pub trait SymbolSource: Send + Sync {
    /// Address of the named export, or `None` if it isn't exported.
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>;
}

/// Opens shared libraries from disk.
pub trait LibraryLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Library>;
}

/// A loaded library. The process keeps it mapped for its whole lifetime.
pub struct Library {
    path: PathBuf,
    inner: Box<dyn SymbolSource>,
}

impl Library {
    pub fn new(path: impl Into<PathBuf>, inner: Box<dyn SymbolSource>) -> Self {
        Self {
            path: path.into(),
            inner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for Library {
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        self.inner.symbol(name)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").field("path", &self.path).finish()
    }
}

/// Platform file name for a library base name (`mono` -> `mono.dll` / `libmono.so`).
pub fn library_file_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.dll", name)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", name)
    } else {
        format!("lib{}.so", name)
    }
}

/// Try each base name in `dir` in order and return the index and library of the
/// first one that loads.
pub fn load_first(
    loader: &dyn LibraryLoader,
    dir: &Path,
    names: &[&str],
) -> Result<(usize, Library)> {
    let mut reasons = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let path = dir.join(library_file_name(name));
        log::debug!("Trying {}", path.display());
        match loader.open(&path) {
            Ok(library) => return Ok((index, library)),
            Err(e) => reasons.push(e.to_string()),
        }
    }

    Err(Error::LibraryLoad {
        library: names.join(", "),
        reason: if reasons.is_empty() {
            "no candidates".into()
        } else {
            reasons.join("; ")
        },
    })
}

/// Loads libraries with the operating system's dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

#[cfg(unix)]
mod platform {
    use super::*;
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    use std::ffi::c_int;

    /// Resolve everything up front, share symbols with later loads and keep the
    /// image mapped even if a handle is ever closed.
    pub(super) const OPEN_FLAGS: c_int = RTLD_NOW | RTLD_GLOBAL | libc::RTLD_NODELETE;

    struct UnixModule(UnixLibrary);

    impl SymbolSource for UnixModule {
        fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
            // SAFETY: the address is only read, never called through here
            let sym = unsafe { self.0.get::<*mut c_void>(name.as_bytes()) }.ok()?;
            NonNull::new(*sym)
        }
    }

    impl LibraryLoader for SystemLoader {
        fn open(&self, path: &Path) -> Result<Library> {
            let lib = unsafe { UnixLibrary::open(Some(path), OPEN_FLAGS) }.map_err(
                |e| Error::LibraryLoad {
                    library: path.display().to_string(),
                    reason: e.to_string(),
                },
            )?;
            Ok(Library::new(path, Box::new(UnixModule(lib))))
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
    use windows::core::{PCSTR, PCWSTR};

    struct WinModule(HMODULE);

    // Module handles are process-global and never freed
    unsafe impl Send for WinModule {}
    unsafe impl Sync for WinModule {}

    impl SymbolSource for WinModule {
        fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
            let name = std::ffi::CString::new(name).ok()?;
            let proc = unsafe { GetProcAddress(self.0, PCSTR(name.as_ptr() as *const u8)) }?;
            NonNull::new(proc as *mut c_void)
        }
    }

    impl LibraryLoader for SystemLoader {
        fn open(&self, path: &Path) -> Result<Library> {
            let wide_path: Vec<u16> = path
                .to_string_lossy()
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();

            let module = unsafe { LoadLibraryW(PCWSTR(wide_path.as_ptr())) }.map_err(|e| {
                Error::LibraryLoad {
                    library: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Library::new(path, Box::new(WinModule(module))))
        }
    }
}
