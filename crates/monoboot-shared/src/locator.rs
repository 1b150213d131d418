//! Runtime directory discovery.
//!
//! Hosts ship the runtime in one of several folder layouts. The locator searches
//! them in a fixed priority order and derives every path the bootstrap hands to
//! the runtime from the first folder that exists.

use crate::loader::library_file_name;
use crate::{EMBEDDED_RUNTIME_DIR, Error, FOLDER_NAMES, Host, LEGACY_LIBRARY_NAME, Result};
use std::path::{Path, PathBuf};

/// Paths resolved once per process for the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    /// The runtime folder that was found
    pub runtime_dir: PathBuf,
    /// Directory the runtime libraries are loaded from
    pub base_path: PathBuf,
    /// Directory holding the managed assemblies
    pub managed_path: PathBuf,
    /// Runtime configuration directory (`etc`)
    pub config_path: PathBuf,
}

/// Directories searched for a runtime folder, in priority order.
pub fn candidate_dirs(host: &dyn Host, native_compiled: bool) -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(FOLDER_NAMES.len() * 2);
    for name in FOLDER_NAMES {
        if native_compiled {
            // Native hosts carry no runtime; ours lives with the loader's dependencies
            dirs.push(dependencies_dir(host.base_dir()).join(name));
        } else {
            dirs.push(host.base_dir().join(name));
            dirs.push(host.data_dir().join(name));
        }
    }
    dirs
}

/// Find the runtime folder and derive the [`PathSet`] for the host's mode.
pub fn locate(host: &dyn Host, native_compiled: bool) -> Result<PathSet> {
    let searched = candidate_dirs(host, native_compiled);
    let runtime_dir = match searched.iter().find(|dir| host.dir_exists(dir)) {
        Some(dir) => dir.clone(),
        None => return Err(Error::PathResolution { searched }),
    };

    let paths = if native_compiled {
        PathSet {
            base_path: runtime_dir.clone(),
            managed_path: host.base_dir().join("MelonLoader").join("Managed"),
            config_path: host.data_dir().join("il2cpp_data").join("etc"),
            runtime_dir,
        }
    } else {
        let embedded = runtime_dir.join(EMBEDDED_RUNTIME_DIR);
        let base_path = if host.dir_exists(&embedded) {
            embedded
        } else {
            runtime_dir.clone()
        };
        PathSet {
            base_path,
            managed_path: host.data_dir().join("Managed"),
            config_path: runtime_dir.join("etc"),
            runtime_dir,
        }
    };

    log::debug!("Mono base path = {}", paths.base_path.display());
    log::debug!("Mono managed path = {}", paths.managed_path.display());
    log::debug!("Mono config path = {}", paths.config_path.display());
    Ok(paths)
}

/// Whether the legacy runtime library sits in the resolved base path.
pub fn is_legacy_layout(host: &dyn Host, paths: &PathSet) -> bool {
    host.file_exists(&paths.base_path.join(library_file_name(LEGACY_LIBRARY_NAME)))
}

fn dependencies_dir(base: &Path) -> PathBuf {
    base.join("MelonLoader").join("Dependencies")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogLevel;
    use std::collections::HashSet;

    struct FakeHost {
        base: PathBuf,
        data: PathBuf,
        dirs: HashSet<PathBuf>,
        files: HashSet<PathBuf>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                base: PathBuf::from("/games/Sample"),
                data: PathBuf::from("/games/Sample/Sample_Data"),
                dirs: HashSet::new(),
                files: HashSet::new(),
            }
        }

        fn with_dir(mut self, path: PathBuf) -> Self {
            self.dirs.insert(path);
            self
        }
    }

    impl Host for FakeHost {
        fn base_dir(&self) -> &Path {
            &self.base
        }

        fn data_dir(&self) -> &Path {
            &self.data
        }

        fn native_compiled(&self) -> bool {
            false
        }

        fn dir_exists(&self, path: &Path) -> bool {
            self.dirs.contains(path)
        }

        fn file_exists(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn log(&self, _level: LogLevel, _msg: &str) {}

        fn fatal(&self, _error: &Error) {}
    }

    #[test]
    fn test_second_candidate_in_data_dir() {
        let data = PathBuf::from("/games/Sample/Sample_Data");
        let host = FakeHost::new().with_dir(data.join("MonoBleedingEdge"));

        let paths = locate(&host, false).unwrap();
        assert_eq!(paths.runtime_dir, data.join("MonoBleedingEdge"));
        assert_eq!(paths.base_path, data.join("MonoBleedingEdge"));
        assert_eq!(paths.managed_path, data.join("Managed"));
        assert_eq!(paths.config_path, data.join("MonoBleedingEdge").join("etc"));
    }

    #[test]
    fn test_base_dir_wins_over_data_dir() {
        let host = FakeHost::new()
            .with_dir(PathBuf::from("/games/Sample/Mono"))
            .with_dir(PathBuf::from("/games/Sample/Sample_Data/Mono"));

        let paths = locate(&host, false).unwrap();
        assert_eq!(paths.runtime_dir, PathBuf::from("/games/Sample/Mono"));
    }

    #[test]
    fn test_embedded_runtime_preferred() {
        let dir = PathBuf::from("/games/Sample/MonoBleedingEdge");
        let host = FakeHost::new()
            .with_dir(dir.clone())
            .with_dir(dir.join("EmbedRuntime"));

        let paths = locate(&host, false).unwrap();
        assert_eq!(paths.base_path, dir.join("EmbedRuntime"));
        // Config stays next to the discovered folder, not the embedded one
        assert_eq!(paths.config_path, dir.join("etc"));
    }

    #[test]
    fn test_native_compiled_uses_dependencies() {
        let deps = PathBuf::from("/games/Sample/MelonLoader/Dependencies");
        let host = FakeHost::new()
            // Present but ignored in native-compiled mode
            .with_dir(PathBuf::from("/games/Sample/Mono"))
            .with_dir(deps.join("MonoBleedingEdge.x64"));

        let paths = locate(&host, true).unwrap();
        assert_eq!(paths.base_path, deps.join("MonoBleedingEdge.x64"));
        assert_eq!(
            paths.managed_path,
            PathBuf::from("/games/Sample/MelonLoader/Managed")
        );
        assert_eq!(
            paths.config_path,
            PathBuf::from("/games/Sample/Sample_Data/il2cpp_data/etc")
        );
    }

    #[test]
    fn test_missing_runtime_is_error() {
        let host = FakeHost::new();
        match locate(&host, false) {
            Err(Error::PathResolution { searched }) => {
                assert_eq!(searched.len(), FOLDER_NAMES.len() * 2);
            }
            other => panic!("expected PathResolution, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_layout_detection() {
        let dir = PathBuf::from("/games/Sample/Mono");
        let mut host = FakeHost::new().with_dir(dir.clone());
        let paths = locate(&host, false).unwrap();
        assert!(!is_legacy_layout(&host, &paths));

        host.files.insert(dir.join(library_file_name("mono")));
        assert!(is_legacy_layout(&host, &paths));
    }

    #[test]
    fn test_real_filesystem() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_path_buf();
        let data = base.join("Sample_Data");
        std::fs::create_dir_all(data.join("MonoBleedingEdge").join("EmbedRuntime")).unwrap();

        struct DiskHost(PathBuf, PathBuf);
        impl Host for DiskHost {
            fn base_dir(&self) -> &Path {
                &self.0
            }
            fn data_dir(&self) -> &Path {
                &self.1
            }
            fn native_compiled(&self) -> bool {
                false
            }
            fn log(&self, _level: LogLevel, _msg: &str) {}
            fn fatal(&self, _error: &Error) {}
        }

        let paths = locate(&DiskHost(base, data.clone()), false).unwrap();
        assert_eq!(
            paths.base_path,
            data.join("MonoBleedingEdge").join("EmbedRuntime")
        );
    }
}
