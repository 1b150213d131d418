mod host;

use clap::{Args, Parser, Subcommand};
use host::CliHost;
use monoboot_shared::exports::{self, Binding};
use monoboot_shared::loader::{library_file_name, load_first};
use monoboot_shared::{
    Host, LEGACY_LIBRARY_NAME, LIBRARY_NAMES, LibraryLoader, POSIX_HELPER_NAME, Result,
    RuntimeVariantFlags, SystemLoader, locator,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "monoboot")]
#[command(about = "Inspect how monoboot resolves and binds a host's embedded Mono runtime")]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Host installation directory
    #[arg(short, long)]
    base: PathBuf,
    /// Host data directory (default: the first *_Data directory under --base)
    #[arg(short, long)]
    data: Option<PathBuf>,
    /// Treat the host as native-compiled
    #[arg(long)]
    native: bool,
}

impl Target {
    fn host(&self) -> CliHost {
        CliHost::new(self.base.clone(), self.data.clone(), self.native)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show where the runtime would be loaded from
    Paths {
        #[command(flatten)]
        target: Target,
    },
    /// List the exports bound for a runtime variant
    Exports {
        /// Legacy runtime
        #[arg(long)]
        legacy: bool,
        /// Native-compiled host
        #[arg(long)]
        native: bool,
    },
    /// Load the runtime library and check its exports
    Check {
        #[command(flatten)]
        target: Target,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let result = match &cli.command {
        Commands::Paths { target } => paths(target),
        Commands::Exports { legacy, native } => {
            list_exports(RuntimeVariantFlags::new(*legacy, *native));
            Ok(())
        }
        Commands::Check { target } => check(target),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn paths(target: &Target) -> Result<()> {
    let host = target.host();
    let paths = locator::locate(&host, host.native_compiled())?;

    println!("\n=== Mono Paths ===\n");
    println!("  Runtime:  {}", paths.runtime_dir.display());
    println!("  Base:     {}", paths.base_path.display());
    println!("  Managed:  {}", paths.managed_path.display());
    println!("  Config:   {}", paths.config_path.display());
    println!(
        "  Legacy:   {}",
        if locator::is_legacy_layout(&host, &paths) {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}

fn list_exports(flags: RuntimeVariantFlags) {
    let requested: Vec<_> = exports::requested(flags).collect();
    println!("\n=== Exports for {:?} ({}) ===\n", flags, requested.len());
    for export in requested {
        println!("  {:<40} {:?}", export.name(), export.requirement());
    }
}

fn check(target: &Target) -> Result<()> {
    let host = target.host();
    let loader = SystemLoader;
    let paths = locator::locate(&host, host.native_compiled())?;
    let mut legacy = locator::is_legacy_layout(&host, &paths);

    let (index, library) = load_first(&loader, &paths.base_path, LIBRARY_NAMES)?;
    legacy |= LIBRARY_NAMES[index] == LEGACY_LIBRARY_NAME;
    println!("Loaded {}", library.path().display());

    let helper = paths.base_path.join(library_file_name(POSIX_HELPER_NAME));
    match loader.open(&helper) {
        Ok(_) => println!("Loaded {}", helper.display()),
        Err(e) if legacy => println!("Posix helper unavailable (legacy runtime): {}", e),
        Err(e) => return Err(e),
    }

    let flags = RuntimeVariantFlags::new(legacy, host.native_compiled());
    let Binding { table, missing } = exports::resolve_all(&library, flags);

    println!("\n=== Bind Results ({:?}) ===\n", flags);
    println!(
        "Total: {} exports, {} resolved, {} missing\n",
        table.resolved_count() + missing.len(),
        table.resolved_count(),
        missing.len()
    );
    for export in &missing {
        println!("  missing: {}", export.name());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(monoboot_shared::Error::Bind {
            missing: missing.iter().map(|e| e.name()).collect(),
        })
    }
}
