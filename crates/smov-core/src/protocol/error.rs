//! Protocol errors

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connected to a device that does not speak the SMOV protocol")]
    WrongDevice,

    #[error("Device implements an unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Connection already torn down")]
    TornDown,

    #[error("Invalid frame from device")]
    InvalidFrame,

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Buffer overflow: packet too large")]
    BufferOverflow,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Flatten into the caller-facing error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::UnsupportedVersion(v) => ErrorKind::UnsupportedVersion(*v),
            ProtocolError::IoError(e) => ErrorKind::from_io(e),
            ProtocolError::SerialError(e) => ErrorKind::CommunicationFailure(serial_errno(e)),
            ProtocolError::Timeout => ErrorKind::CommunicationFailure(libc::ETIMEDOUT),
            ProtocolError::TornDown => ErrorKind::CommunicationFailure(libc::ENOTCONN),
            ProtocolError::WrongDevice
            | ProtocolError::InvalidFrame
            | ProtocolError::UnknownOpcode(_)
            | ProtocolError::CrcMismatch { .. }
            | ProtocolError::BufferOverflow => ErrorKind::CommunicationFailure(libc::EPROTO),
        }
    }
}

fn serial_errno(e: &serialport::Error) -> i32 {
    match e.kind() {
        serialport::ErrorKind::NoDevice => libc::ENODEV,
        serialport::ErrorKind::InvalidInput => libc::EINVAL,
        serialport::ErrorKind::Io(kind) => io_kind_errno(kind),
        _ => libc::EIO,
    }
}

/// Best errno for an I/O error that lost its raw OS code
fn io_kind_errno(kind: std::io::ErrorKind) -> i32 {
    use std::io::ErrorKind::*;
    match kind {
        NotFound => libc::ENOENT,
        PermissionDenied => libc::EACCES,
        ConnectionRefused => libc::ECONNREFUSED,
        ConnectionReset => libc::ECONNRESET,
        NotConnected => libc::ENOTCONN,
        AddrInUse => libc::EADDRINUSE,
        BrokenPipe => libc::EPIPE,
        AlreadyExists => libc::EEXIST,
        WouldBlock => libc::EAGAIN,
        InvalidInput => libc::EINVAL,
        TimedOut => libc::ETIMEDOUT,
        Interrupted => libc::EINTR,
        OutOfMemory => libc::ENOMEM,
        _ => libc::EIO,
    }
}

/// Error state reported to callers of the library.
///
/// `CommunicationFailure` carries an OS error code which callers can render with
/// the platform's `strerror` (or [`std::io::Error::from_raw_os_error`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No error
    #[default]
    Ok,
    /// Transport-level I/O failure
    CommunicationFailure(i32),
    /// The device answered the handshake with a version this build does not implement
    UnsupportedVersion(u16),
    /// The device reported a runtime fault
    DeviceFault(u16),
}

impl ErrorKind {
    pub(crate) fn from_io(e: &std::io::Error) -> Self {
        ErrorKind::CommunicationFailure(
            e.raw_os_error()
                .unwrap_or_else(|| io_kind_errno(e.kind())),
        )
    }

    /// Check for the `Ok` state
    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorKind::Ok)
    }

    /// Human readable description of the error tag
    pub fn describe(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "Everything ok",
            ErrorKind::CommunicationFailure(_) => "Communication failure",
            ErrorKind::UnsupportedVersion(_) => "The device has an unsupported version",
            ErrorKind::DeviceFault(_) => "The device reported a fault",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Ok => f.write_str(self.describe()),
            ErrorKind::CommunicationFailure(code) => write!(
                f,
                "{}: {}",
                self.describe(),
                std::io::Error::from_raw_os_error(*code)
            ),
            ErrorKind::UnsupportedVersion(v) => write!(f, "{} ({})", self.describe(), v),
            ErrorKind::DeviceFault(code) => write!(f, "{} (code {:#06x})", self.describe(), code),
        }
    }
}
