//! Serial Protocol Communication
//!
//! Implements the SMOV framed serial protocol spoken by the motor controller.
//!
//! A connection is opened with [`connect`], which runs the version handshake and
//! hands back a [`Sender`] for commands and a [`FaultHandle`] for error reporting.

pub mod commands;
mod connection;
mod error;
mod handles;
mod handshake;
mod latch;
pub mod packet;
pub mod serial;
pub mod stream;

pub use commands::{Command, Response};
pub use connection::{connect, connect_transport, ConnectionConfig, ConnectionState, SpeedLimits};
pub use error::{ErrorKind, ProtocolError};
pub use handles::{FaultHandle, Sender};
pub use packet::{Packet, PacketBuilder, PacketDecoder};
pub use serial::{list_devices, list_ports, DevicePath, PortInfo};
pub use stream::{SerialChannel, Transport};

/// Default baud rate for the motor controller
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for the handshake reply in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// Default time to wait for a command acknowledgment in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;

/// Delay after opening the port before talking to the device.
/// Opening the port resets Arduino-based controllers, which then need time to boot.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;

/// Read poll interval of the background link thread in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Idle time after which the link thread pings the device
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Protocol versions implemented by this library
pub const SUPPORTED_VERSIONS: &[u16] = &[1, 2];

/// Signature exchanged during the handshake
pub const SIGNATURE: &[u8; 4] = b"smov";

/// Maximum packet payload size
pub const MAX_PACKET_SIZE: usize = 64;
