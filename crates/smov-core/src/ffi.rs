//! C ABI
//!
//! Exposes the connection to C callers. Handles are opaque heap objects handed
//! out by [`smov_connect`] and released with [`smov_drop_communication`] /
//! [`smov_drop_handle`]. Errors come back as a tagged [`smov_error_t`].
//!
//! A typical C harness:
//!
//! ```c
//! char **devices = smov_list_devices();
//! smov_error_t err = smov_connect(devices[0], &sender, &handle);
//! while (!smov_set_speed(sender, 120)) sleep(1);
//! err = smov_get_error(handle);
//! smov_free_devices(devices);
//! smov_drop_communication(sender);
//! smov_drop_handle(handle);
//! ```

#![allow(non_camel_case_types)]

use libc::{c_char, c_int};
use std::ffi::{CStr, CString};
use std::ptr;

use crate::protocol::{self, ConnectionConfig, DevicePath, ErrorKind, FaultHandle, Sender};

/// Error tag
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum smov_error_type {
    /// No error, payload is 0
    OK,
    /// Transport failure, payload is an errno value
    COMMUNICATION,
    /// Unsupported protocol version, payload is the version
    UNSUPPORTED_VERSION,
    /// Device fault, payload is the device fault code
    DEVICE_FAULT,
}

/// Error value returned across the C boundary
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct smov_error_t {
    /// Kind of error
    pub tag: smov_error_type,
    /// Tag-dependent detail, 0 for `OK`
    pub payload: c_int,
}

impl From<ErrorKind> for smov_error_t {
    fn from(kind: ErrorKind) -> Self {
        let (tag, payload) = match kind {
            ErrorKind::Ok => (smov_error_type::OK, 0),
            ErrorKind::CommunicationFailure(code) => (smov_error_type::COMMUNICATION, code),
            ErrorKind::UnsupportedVersion(v) => {
                (smov_error_type::UNSUPPORTED_VERSION, c_int::from(v))
            }
            ErrorKind::DeviceFault(code) => (smov_error_type::DEVICE_FAULT, c_int::from(code)),
        };
        Self { tag, payload }
    }
}

impl From<smov_error_t> for ErrorKind {
    fn from(err: smov_error_t) -> Self {
        match err.tag {
            smov_error_type::OK => ErrorKind::Ok,
            smov_error_type::COMMUNICATION => ErrorKind::CommunicationFailure(err.payload),
            smov_error_type::UNSUPPORTED_VERSION => ErrorKind::UnsupportedVersion(err.payload as u16),
            smov_error_type::DEVICE_FAULT => ErrorKind::DeviceFault(err.payload as u16),
        }
    }
}

/// Opaque command handle
pub struct smov_sender_t(Sender);

/// Opaque fault-monitoring handle
pub struct smov_handle_t(FaultHandle);

/// List the devices that may be a motor controller
///
/// Returns a NULL-terminated array of NUL-terminated paths, each of which can be
/// handed to `smov_connect`. When nothing is plugged in the array only holds the
/// terminating NULL. Release it with `smov_free_devices`.
#[no_mangle]
pub extern "C" fn smov_list_devices() -> *mut *mut c_char {
    let entries: Box<[*mut c_char]> = protocol::list_devices()
        .into_iter()
        // Paths never contain NUL on supported platforms; skip any that do
        .filter_map(|path| CString::new(path.into_string()).ok())
        .map(CString::into_raw)
        .chain(std::iter::once(ptr::null_mut()))
        .collect();
    Box::into_raw(entries) as *mut *mut c_char
}

/// Free a device list returned by `smov_list_devices`
///
/// # Safety
///
/// `devices` must come from `smov_list_devices` and not have been freed yet.
/// NULL is ignored.
#[no_mangle]
pub unsafe extern "C" fn smov_free_devices(devices: *mut *mut c_char) {
    if devices.is_null() {
        return;
    }
    let mut count = 0;
    while !(*devices.add(count)).is_null() {
        drop(CString::from_raw(*devices.add(count)));
        count += 1;
    }
    // Include the terminating NULL in the slice we hand back to Box
    let entries = ptr::slice_from_raw_parts_mut(devices, count + 1);
    drop(Box::from_raw(entries));
}

/// Start communication with the device
///
/// Opens the serial device, runs the handshake and spawns the link thread.
///
/// Arguments:
///   serial: path of the serial device (ex: '/dev/ttyACM0' on linux), UTF-8 and
///     NUL-terminated
///   sender: receives the command handle
///   handle: receives the fault-monitoring handle
///
/// If this returns anything other than OK, nothing is written to `sender` or
/// `handle` and there is nothing to release.
///
/// # Safety
///
/// `serial` must be a valid C string; `sender` and `handle` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn smov_connect(
    serial: *const c_char,
    sender: *mut *mut smov_sender_t,
    handle: *mut *mut smov_handle_t,
) -> smov_error_t {
    if serial.is_null() || sender.is_null() || handle.is_null() {
        return ErrorKind::CommunicationFailure(libc::EINVAL).into();
    }
    let Ok(path) = CStr::from_ptr(serial).to_str() else {
        return ErrorKind::CommunicationFailure(libc::EINVAL).into();
    };

    match protocol::connect(&DevicePath::from(path), &ConnectionConfig::default()) {
        Ok((s, h)) => {
            *sender = Box::into_raw(Box::new(smov_sender_t(s)));
            *handle = Box::into_raw(Box::new(smov_handle_t(h)));
            ErrorKind::Ok.into()
        }
        Err(e) => {
            tracing::debug!("smov_connect({}) failed: {}", path, e);
            e.kind().into()
        }
    }
}

/// Send a speed command to the motor controller
///
/// Never blocks. Returns true when the command was sent, false when it was not
/// (previous command still unacknowledged, speed out of range, or the connection
/// is gone). Retry after a pause; use `smov_get_error` to tell a dead
/// connection from a busy one.
///
/// # Safety
///
/// `sender` must be NULL or a live pointer from `smov_connect`.
#[no_mangle]
pub unsafe extern "C" fn smov_set_speed(sender: *const smov_sender_t, val: i16) -> bool {
    match sender.as_ref() {
        Some(s) => s.0.submit_speed(val),
        None => false,
    }
}

/// Get the latest error reported on the connection
///
/// Non-blocking. Returns OK until the device or the transport fails.
///
/// # Safety
///
/// `handle` must be NULL or a live pointer from `smov_connect`.
#[no_mangle]
pub unsafe extern "C" fn smov_get_error(handle: *const smov_handle_t) -> smov_error_t {
    match handle.as_ref() {
        Some(h) => h.0.current_error().into(),
        None => ErrorKind::CommunicationFailure(libc::EINVAL).into(),
    }
}

/// Convert an error to a static, NUL-terminated description
///
/// For COMMUNICATION, pass the payload to `strerror` for the OS detail.
#[no_mangle]
pub extern "C" fn smov_strerror(error: smov_error_t) -> *const c_char {
    use smov_error_type::*;
    let text: &'static CStr = match error.tag {
        OK => c"Everything ok",
        COMMUNICATION => c"Communication failure",
        UNSUPPORTED_VERSION => c"The device has an unsupported version",
        DEVICE_FAULT => c"The device reported a fault",
    };
    text.as_ptr()
}

/// Stop communication and free the command handle
///
/// Closes the connection (the fault handle stays valid and reports the final
/// state) and releases `sender`, which must not be used again.
///
/// # Safety
///
/// `sender` must be NULL or a pointer from `smov_connect` not yet dropped.
#[no_mangle]
pub unsafe extern "C" fn smov_drop_communication(sender: *mut smov_sender_t) {
    if sender.is_null() {
        return;
    }
    let sender = Box::from_raw(sender);
    sender.0.teardown();
}

/// Stop communication and free the fault-monitoring handle
///
/// # Safety
///
/// `handle` must be NULL or a pointer from `smov_connect` not yet dropped.
#[no_mangle]
pub unsafe extern "C" fn smov_drop_handle(handle: *mut smov_handle_t) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    handle.0.teardown();
}
