//! # SMOV Core Library
//!
//! Serial control of the Simple Machine's OpenCV Ventilator motor controller.

//!
//! This library provides:
//! - Discovery of candidate serial devices
//! - A versioned connection handshake
//! - Non-blocking speed commands through a [`Sender`](protocol::Sender)
//! - Asynchronous fault reporting through a [`FaultHandle`](protocol::FaultHandle)
//! - A C ABI for non-Rust harnesses (see [`ffi`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use smov_core::protocol::{connect, list_devices, ConnectionConfig, ErrorKind};
//! use std::time::Duration;
//!
//! let devices = list_devices();
//! let path = devices.first().expect("no device plugged in");
//! let (sender, faults) = connect(path, &ConnectionConfig::default())?;
//!
//! while !sender.submit_speed(120) {
//!     if faults.current_error() != ErrorKind::Ok {
//!         break;
//!     }
//!     std::thread::sleep(Duration::from_millis(50));
//! }
//! faults.teardown();
//! # Ok::<(), smov_core::protocol::ProtocolError>(())
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod ffi;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        connect, connect_transport, list_devices, ConnectionConfig, ConnectionState, DevicePath,
        ErrorKind, FaultHandle, ProtocolError, Sender, SpeedLimits,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
