//! Mono export manifest and binding.
//!
//! Which exports the bootstrap needs depends on the runtime build (legacy or
//! modern ABI) and on how the host runs managed code. Instead of branching per
//! export, every export is declared once in [`MANIFEST`] together with the
//! [`Requirement`] that decides whether it is requested, and [`resolve`] binds
//! the requested subset in a single loop.

use crate::loader::SymbolSource;
use crate::{Error, Result, RuntimeVariantFlags};
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// When a manifest entry has to be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Always,
    /// Only on modern runtimes
    Modern,
    /// Only on legacy runtimes
    Legacy,
    /// Only when the host is ahead-of-time compiled
    NativeCompiled,
    /// Ahead-of-time compiled host with a modern runtime
    NativeCompiledModern,
    /// Only when the host is interpreted/JIT
    Interpreted,
}

impl Requirement {
    pub fn applies(self, flags: RuntimeVariantFlags) -> bool {
        match self {
            Requirement::Always => true,
            Requirement::Modern => !flags.legacy,
            Requirement::Legacy => flags.legacy,
            Requirement::NativeCompiled => flags.native_compiled,
            Requirement::NativeCompiledModern => flags.native_compiled && !flags.legacy,
            Requirement::Interpreted => !flags.native_compiled,
        }
    }
}

macro_rules! mono_exports {
    ($($variant:ident => $name:literal, $req:ident;)*) => {
        /// A Mono export the bootstrap may bind.
        #[repr(usize)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Export {
            $($variant,)*
        }

        impl Export {
            /// Every export, in manifest order.
            pub const ALL: &'static [Export] = &[$(Export::$variant,)*];

            /// Exported symbol name.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Export::$variant => $name,)*
                }
            }

            pub const fn requirement(self) -> Requirement {
                match self {
                    $(Export::$variant => Requirement::$req,)*
                }
            }
        }

        /// The export manifest.
        pub const MANIFEST: &[ExportDef] = &[
            $(ExportDef { export: Export::$variant, requirement: Requirement::$req },)*
        ];
    };
}

mono_exports! {
    JitInit => "mono_jit_init", Always;
    ThreadSetMain => "mono_thread_set_main", Always;
    ThreadCurrent => "mono_thread_current", Always;
    AddInternalCall => "mono_add_internal_call", Always;
    LookupInternalCall => "mono_lookup_internal_call", Always;
    RuntimeInvoke => "mono_runtime_invoke", Always;
    MethodGetName => "mono_method_get_name", Always;
    DomainAssemblyOpen => "mono_domain_assembly_open", Always;
    AssemblyGetImage => "mono_assembly_get_image", Always;
    ClassFromName => "mono_class_from_name", Always;
    ClassGetMethodFromName => "mono_class_get_method_from_name", Always;
    StringToUtf8 => "mono_string_to_utf8", Always;
    StringNew => "mono_string_new", Always;
    ObjectGetClass => "mono_object_get_class", Always;
    ClassGetPropertyFromName => "mono_class_get_property_from_name", Always;
    PropertyGetGetMethod => "mono_property_get_get_method", Always;

    DomainSetConfig => "mono_domain_set_config", Modern;
    UnityGetUnitytlsInterface => "mono_unity_get_unitytls_interface", Modern;
    Free => "mono_free", Modern;

    GFree => "g_free", Legacy;

    SetAssembliesPath => "mono_set_assemblies_path", NativeCompiled;
    AssemblySetRootDir => "mono_assembly_setrootdir", NativeCompiled;
    SetConfigDir => "mono_set_config_dir", NativeCompiled;
    RuntimeSetMainArgs => "mono_runtime_set_main_args", NativeCompiledModern;
    RaiseException => "mono_raise_exception", NativeCompiled;
    GetExceptionBadImageFormat => "mono_get_exception_bad_image_format", NativeCompiled;
    ImageOpenFull => "mono_image_open_full", NativeCompiled;
    ImageOpenFromDataFull => "mono_image_open_from_data_full", NativeCompiled;
    ImageClose => "mono_image_close", NativeCompiled;
    ImageGetTableRows => "mono_image_get_table_rows", NativeCompiled;
    MetadataDecodeTableRowCol => "mono_metadata_decode_table_row_col", NativeCompiled;
    ArrayAddrWithSize => "mono_array_addr_with_size", NativeCompiled;
    ArrayLength => "mono_array_length", NativeCompiled;
    MetadataStringHeap => "mono_metadata_string_heap", NativeCompiled;
    ClassGetName => "mono_class_get_name", NativeCompiled;

    JitInitVersion => "mono_jit_init_version", Interpreted;
}

/// One manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportDef {
    pub export: Export,
    pub requirement: Requirement,
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exports requested for the given runtime variant, in manifest order.
pub fn requested(flags: RuntimeVariantFlags) -> impl Iterator<Item = Export> {
    MANIFEST
        .iter()
        .filter(move |def| def.requirement.applies(flags))
        .map(|def| def.export)
}

/// A function pointer slot for one export.
///
/// Hooks operate on slots: the bootstrap calls exports through them and the
/// slot-patching hook backend rewrites them in place.
#[repr(transparent)]
#[derive(Debug)]
pub struct ExportSlot(AtomicPtr<c_void>);

impl ExportSlot {
    pub const fn empty() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub fn get(&self) -> *mut c_void {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: *mut c_void) {
        self.0.store(value, Ordering::Release);
    }

    pub fn is_resolved(&self) -> bool {
        !self.get().is_null()
    }

    /// Address of the slot itself, used to key hook records.
    pub fn address(&self) -> usize {
        self as *const ExportSlot as usize
    }
}

impl Default for ExportSlot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Resolved exports for one bootstrap run.
#[derive(Debug)]
pub struct SymbolTable {
    slots: Box<[ExportSlot]>,
    flags: RuntimeVariantFlags,
}

impl SymbolTable {
    /// An empty table for the given variant.
    pub fn new(flags: RuntimeVariantFlags) -> Self {
        Self {
            slots: Export::ALL.iter().map(|_| ExportSlot::empty()).collect(),
            flags,
        }
    }

    pub fn flags(&self) -> RuntimeVariantFlags {
        self.flags
    }

    pub fn slot(&self, export: Export) -> &ExportSlot {
        &self.slots[export as usize]
    }

    /// Resolved address, or `None` for unrequested or missing exports.
    pub fn get(&self, export: Export) -> Option<*mut c_void> {
        let ptr = self.slot(export).get();
        (!ptr.is_null()).then_some(ptr)
    }

    pub fn is_resolved(&self, export: Export) -> bool {
        self.slot(export).is_resolved()
    }

    /// Number of resolved exports.
    pub fn resolved_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_resolved()).count()
    }
}

/// What to do when requested exports are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindPolicy {
    /// Any missing export fails binding
    #[default]
    Abort,
    /// Keep the partial table; missing slots stay null
    Degraded,
}

/// Outcome of [`resolve_all`]: the table plus every requested export that was
/// not found.
#[derive(Debug)]
pub struct Binding {
    pub table: SymbolTable,
    pub missing: Vec<Export>,
}

/// Look up every requested export without deciding what a miss means.
pub fn resolve_all(lib: &dyn SymbolSource, flags: RuntimeVariantFlags) -> Binding {
    let table = SymbolTable::new(flags);
    let mut missing = Vec::new();

    for export in requested(flags) {
        match lib.symbol(export.name()) {
            Some(addr) => table.slot(export).set(addr.as_ptr()),
            None => missing.push(export),
        }
    }

    Binding { table, missing }
}

/// Bind the exports requested for `flags` from `lib`, applying `policy` to any
/// that are missing.
pub fn resolve(
    lib: &dyn SymbolSource,
    flags: RuntimeVariantFlags,
    policy: BindPolicy,
) -> Result<SymbolTable> {
    let Binding { table, missing } = resolve_all(lib, flags);
    if missing.is_empty() {
        return Ok(table);
    }

    for export in &missing {
        log::warn!("Missing Mono export: {}", export);
    }

    match policy {
        BindPolicy::Abort => Err(Error::Bind {
            missing: missing.iter().map(|e| e.name()).collect(),
        }),
        BindPolicy::Degraded => Ok(table),
    }
}
