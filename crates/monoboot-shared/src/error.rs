//! Error types for monoboot.

use std::path::PathBuf;
use thiserror::Error;

/// Why a hook could not be installed or removed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookErrorKind {
    /// The target already carries an active hook
    #[error("already attached")]
    AlreadyAttached,
    /// The slot holds no function address
    #[error("target is null")]
    NullTarget,
    /// Detach was asked for a detour other than the one installed
    #[error("detour does not match the installed hook")]
    DetourMismatch,
    /// The hook backend refused the operation
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to find Mono directory (searched {} locations)", searched.len())]
    PathResolution { searched: Vec<PathBuf> },

    #[error("Failed to load {library}: {reason}")]
    LibraryLoad { library: String, reason: String },

    #[error("Missing required Mono exports: {}", missing.join(", "))]
    Bind { missing: Vec<&'static str> },

    #[error("Failed to hook {target}: {kind}")]
    Hook { target: String, kind: HookErrorKind },

    #[error("Bootstrap is in state {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a [`Error::Hook`] on a named target.
    pub fn hook(target: impl Into<String>, kind: HookErrorKind) -> Self {
        Error::Hook {
            target: target.into(),
            kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
