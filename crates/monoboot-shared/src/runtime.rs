//! Runtime variant detection.

/// Which build of the runtime is loaded and how the host executes managed code.
///
/// Fixed once the runtime library has been loaded; every later decision about
/// exports and code paths reads from the same value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RuntimeVariantFlags {
    /// Old runtime ABI (`mono.dll` era): no `mono_free`, no domain config
    pub legacy: bool,
    /// Host code is ahead-of-time compiled (IL2CPP) and brings no runtime of its own
    pub native_compiled: bool,
}

impl RuntimeVariantFlags {
    pub const fn new(legacy: bool, native_compiled: bool) -> Self {
        Self {
            legacy,
            native_compiled,
        }
    }

    /// All four flag combinations.
    pub const ALL: [RuntimeVariantFlags; 4] = [
        RuntimeVariantFlags::new(false, false),
        RuntimeVariantFlags::new(false, true),
        RuntimeVariantFlags::new(true, false),
        RuntimeVariantFlags::new(true, true),
    ];
}
