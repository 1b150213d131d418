//! Reporting managed exceptions.
//!
//! The relay may run inside runtime callbacks, so it never fails loudly: any
//! missing link in the reflection chain just means there is nothing to report.

use crate::runtime::{
    MonoClassGetPropertyFromNameFn, MonoObject, MonoObjectGetClassFn, MonoPropertyGetGetMethodFn,
    MonoString, Runtime,
};
use monoboot_shared::Export;
use std::ffi::c_void;
use std::ptr;
use thiserror::Error;

/// Why no message could be extracted from an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayFailure {
    #[error("no exception object")]
    NoException,
    #[error("{0} is not bound")]
    Unbound(&'static str),
    #[error("exception has no class")]
    NoClass,
    #[error("exception class has no Message property")]
    NoMessageProperty,
    #[error("Message property has no getter")]
    NoGetter,
    #[error("Message getter returned null")]
    NoMessage,
    #[error("Message could not be converted to UTF-8")]
    NotConvertible,
}

/// Read `exception.Message`.
///
/// # Safety
/// `exception` must be null or a live managed object.
pub unsafe fn message(runtime: &Runtime<'_>, exception: *mut MonoObject) -> Result<String, RelayFailure> {
    if exception.is_null() {
        return Err(RelayFailure::NoException);
    }

    let get_class = bound::<MonoObjectGetClassFn>(runtime, Export::ObjectGetClass)?;
    let get_property =
        bound::<MonoClassGetPropertyFromNameFn>(runtime, Export::ClassGetPropertyFromName)?;
    let get_getter = bound::<MonoPropertyGetGetMethodFn>(runtime, Export::PropertyGetGetMethod)?;

    let klass = unsafe { get_class(exception) };
    if klass.is_null() {
        return Err(RelayFailure::NoClass);
    }

    let property = unsafe { get_property(klass, c"Message".as_ptr()) };
    if property.is_null() {
        return Err(RelayFailure::NoMessageProperty);
    }

    let getter = unsafe { get_getter(property) };
    if getter.is_null() {
        return Err(RelayFailure::NoGetter);
    }

    let text = unsafe {
        runtime.invoke(
            getter,
            exception as *mut c_void,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    }
    .ok_or(RelayFailure::Unbound(Export::RuntimeInvoke.name()))?;
    if text.is_null() {
        return Err(RelayFailure::NoMessage);
    }

    unsafe { runtime.string_to_utf8(text as *mut MonoString) }.ok_or(RelayFailure::NotConvertible)
}

/// Log `exception.Message` through the host, if there is one.
///
/// # Safety
/// `exception` must be null or a live managed object.
pub unsafe fn report(runtime: &Runtime<'_>, exception: *mut MonoObject) {
    match unsafe { message(runtime, exception) } {
        Ok(text) => runtime.host().error(&text),
        Err(e) => log::debug!("Managed exception not reported: {}", e),
    }
}

fn bound<F: Copy>(runtime: &Runtime<'_>, export: Export) -> Result<F, RelayFailure> {
    runtime
        .export::<F>(export)
        .ok_or(RelayFailure::Unbound(export.name()))
}
