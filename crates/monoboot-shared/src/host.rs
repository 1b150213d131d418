//! Collaborators provided by the host application.

use crate::{Error, LogLevel};
use std::path::Path;

/// What the bootstrap needs to know about, and report to, the host process.
pub trait Host: Send + Sync {
    /// Installation root of the host application.
    fn base_dir(&self) -> &Path;

    /// The host's data directory (`<game>_Data` for Unity players).
    fn data_dir(&self) -> &Path;

    /// Whether the host runs ahead-of-time compiled managed code.
    fn native_compiled(&self) -> bool;

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Arguments forwarded to the runtime when the domain is created directly.
    fn main_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Diagnostic message sink.
    fn log(&self, level: LogLevel, msg: &str);

    /// Report an unrecoverable bootstrap failure.
    ///
    /// Production hosts terminate here; the bootstrap never continues after
    /// calling this.
    fn fatal(&self, error: &Error);

    fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    fn warn(&self, msg: &str) {
        self.log(LogLevel::Warning, msg);
    }

    fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }
}

impl<T: Host + ?Sized> Host for std::sync::Arc<T> {
    fn base_dir(&self) -> &Path {
        (**self).base_dir()
    }

    fn data_dir(&self) -> &Path {
        (**self).data_dir()
    }

    fn native_compiled(&self) -> bool {
        (**self).native_compiled()
    }

    fn dir_exists(&self, path: &Path) -> bool {
        (**self).dir_exists(path)
    }

    fn file_exists(&self, path: &Path) -> bool {
        (**self).file_exists(path)
    }

    fn main_args(&self) -> Vec<String> {
        (**self).main_args()
    }

    fn log(&self, level: LogLevel, msg: &str) {
        (**self).log(level, msg)
    }

    fn fatal(&self, error: &Error) {
        (**self).fatal(error)
    }
}
