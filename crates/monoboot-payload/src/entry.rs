//! Process entry point.
//!
//! The constructor runs while the library is being loaded, before the host's
//! own startup code touches the runtime.

use crate::context::RuntimeBootstrapContext;
use crate::extension::ManagedEntryExtension;
use monoboot_shared::loader::library_file_name;
use monoboot_shared::{Error, Host, LogLevel, Result};
use std::path::{Path, PathBuf};

/// Library that marks a native-compiled host.
const NATIVE_ASSEMBLY_NAME: &str = "GameAssembly";

/// Startup settings, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub domain_name: String,
    /// Managed loader assembly, relative to the base directory.
    pub loader_assembly: PathBuf,
    pub base_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub native_compiled: Option<bool>,
    pub debug: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            domain_name: "MelonLoader".to_string(),
            loader_assembly: Path::new("MelonLoader").join("MelonLoader.dll"),
            base_dir: None,
            data_dir: None,
            native_compiled: None,
            debug: false,
        }
    }
}

impl BootstrapConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup; unset or empty variables keep the defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());
        Self {
            base_dir: var("MONOBOOT_BASE_DIR").map(PathBuf::from),
            data_dir: var("MONOBOOT_DATA_DIR").map(PathBuf::from),
            native_compiled: var("MONOBOOT_NATIVE").map(|v| is_truthy(&v)),
            debug: var("MONOBOOT_DEBUG").is_some_and(|v| is_truthy(&v)),
            ..Self::default()
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// [`Host`] backed by the running process and its files.
pub struct ProcessHost {
    base: PathBuf,
    data: PathBuf,
    native: bool,
}

impl ProcessHost {
    pub fn new(config: &BootstrapConfig) -> Result<Self> {
        let base = match &config.base_dir {
            Some(dir) => dir.clone(),
            None => {
                let exe = std::env::current_exe()?;
                exe.parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| Error::Other(format!("{} has no parent", exe.display())))?
            }
        };
        let data = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let exe = std::env::current_exe()?;
                let stem = exe
                    .file_stem()
                    .ok_or_else(|| Error::Other(format!("{} has no file name", exe.display())))?;
                base.join(format!("{}_Data", stem.to_string_lossy()))
            }
        };
        let native = config
            .native_compiled
            .unwrap_or_else(|| base.join(library_file_name(NATIVE_ASSEMBLY_NAME)).is_file());

        Ok(Self { base, data, native })
    }
}

impl Host for ProcessHost {
    fn base_dir(&self) -> &Path {
        &self.base
    }

    fn data_dir(&self) -> &Path {
        &self.data
    }

    fn native_compiled(&self) -> bool {
        self.native
    }

    fn main_args(&self) -> Vec<String> {
        std::env::args().collect()
    }

    fn log(&self, level: LogLevel, msg: &str) {
        log::log!(target: "monoboot", log::Level::from(level), "{}", msg);
    }

    fn fatal(&self, error: &Error) {
        log::error!(target: "monoboot", "{}", error);
        eprintln!("[monoboot] Fatal: {}", error);
        std::process::exit(1);
    }
}

fn init_logging(config: &BootstrapConfig) {
    let level = if config.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_module("monoboot", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_module_path(false)
        .try_init();
}

/// Build, install and run the process-wide bootstrap.
pub fn run(config: &BootstrapConfig) -> Result<()> {
    init_logging(config);

    let host = ProcessHost::new(config)?;
    let loader = ManagedEntryExtension::new(
        host.base_dir().join(&config.loader_assembly),
        "MelonLoader",
        "Core",
    );
    let context = RuntimeBootstrapContext::new(Box::new(host), Box::new(loader))
        .with_domain_name(&config.domain_name)?;
    log::debug!(
        target: "monoboot",
        "Using {} hooks",
        context.hooks().name()
    );

    let context = Box::new(context).install()?;
    context.bootstrap();
    Ok(())
}

#[cfg(not(test))]
#[ctor::ctor]
fn startup() {
    if let Err(e) = run(&BootstrapConfig::from_env()) {
        log::error!(target: "monoboot", "Failed to initialize: {}", e);
        eprintln!("[monoboot] Failed to initialize: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = BootstrapConfig::from_vars(vars(&[]));
        assert_eq!(config, BootstrapConfig::default());
        assert_eq!(config.domain_name, "MelonLoader");
        assert_eq!(
            config.loader_assembly,
            PathBuf::from("MelonLoader").join("MelonLoader.dll")
        );
    }

    #[test]
    fn test_config_overrides() {
        let config = BootstrapConfig::from_vars(vars(&[
            ("MONOBOOT_BASE_DIR", "/opt/game"),
            ("MONOBOOT_DATA_DIR", "/opt/game/Game_Data"),
            ("MONOBOOT_NATIVE", "TRUE"),
            ("MONOBOOT_DEBUG", "1"),
        ]));
        assert_eq!(config.base_dir, Some(PathBuf::from("/opt/game")));
        assert_eq!(config.data_dir, Some(PathBuf::from("/opt/game/Game_Data")));
        assert_eq!(config.native_compiled, Some(true));
        assert!(config.debug);

        let config = BootstrapConfig::from_vars(vars(&[
            ("MONOBOOT_NATIVE", "0"),
            ("MONOBOOT_DEBUG", ""),
            ("MONOBOOT_BASE_DIR", ""),
        ]));
        assert_eq!(config.native_compiled, Some(false));
        assert!(!config.debug);
        assert_eq!(config.base_dir, None);
    }

    #[test]
    fn test_process_host_detects_native_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BootstrapConfig {
            base_dir: Some(dir.path().to_path_buf()),
            data_dir: Some(dir.path().join("Game_Data")),
            ..Default::default()
        };

        let host = ProcessHost::new(&config).unwrap();
        assert_eq!(host.base_dir(), dir.path());
        assert_eq!(host.data_dir(), dir.path().join("Game_Data"));
        assert!(!host.native_compiled());

        std::fs::write(dir.path().join(library_file_name(NATIVE_ASSEMBLY_NAME)), b"").unwrap();
        assert!(ProcessHost::new(&config).unwrap().native_compiled());

        config.native_compiled = Some(false);
        assert!(!ProcessHost::new(&config).unwrap().native_compiled());
    }

    #[test]
    fn test_process_host_data_dir_from_exe() {
        let dir = tempfile::tempdir().unwrap();
        let config = BootstrapConfig {
            base_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let host = ProcessHost::new(&config).unwrap();
        let name = host.data_dir().file_name().unwrap().to_string_lossy();
        assert!(name.ends_with("_Data"));
        assert_eq!(host.data_dir().parent(), Some(dir.path()));
    }
}
