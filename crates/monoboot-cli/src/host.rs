//! Host description taken from the command line.

use monoboot_shared::{Error, Host, LogLevel};
use std::path::{Path, PathBuf};

pub struct CliHost {
    base: PathBuf,
    data: PathBuf,
    native: bool,
}

impl CliHost {
    /// Without `data`, the first `*_Data` directory under `base` is used.
    pub fn new(base: PathBuf, data: Option<PathBuf>, native: bool) -> Self {
        let data = data
            .or_else(|| find_data_dir(&base))
            .unwrap_or_else(|| base.clone());
        Self { base, data, native }
    }
}

fn find_data_dir(base: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(base)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with("_Data"))
        })
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

impl Host for CliHost {
    fn base_dir(&self) -> &Path {
        &self.base
    }

    fn data_dir(&self) -> &Path {
        &self.data
    }

    fn native_compiled(&self) -> bool {
        self.native
    }

    fn log(&self, level: LogLevel, msg: &str) {
        log::log!(log::Level::from(level), "{}", msg);
    }

    fn fatal(&self, error: &Error) {
        log::error!("{}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_discovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Game_Data")).unwrap();
        std::fs::create_dir(dir.path().join("MonoBleedingEdge")).unwrap();

        let host = CliHost::new(dir.path().to_path_buf(), None, false);
        assert_eq!(host.data_dir(), dir.path().join("Game_Data"));
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Game_Data")).unwrap();

        let host = CliHost::new(dir.path().to_path_buf(), Some("/elsewhere".into()), true);
        assert_eq!(host.data_dir(), Path::new("/elsewhere"));
        assert!(host.native_compiled());
    }

    #[test]
    fn test_falls_back_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let host = CliHost::new(dir.path().to_path_buf(), None, false);
        assert_eq!(host.data_dir(), dir.path());
    }
}
