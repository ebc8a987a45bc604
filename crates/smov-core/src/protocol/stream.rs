//! Transport abstraction
//!
//! The connection only needs a byte stream with a read timeout that can be split
//! into a read half and a write half. Serial ports provide that through
//! [`SerialChannel`]; tests plug in their own simulated devices.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte stream to the motor controller
pub trait Transport: Read + Write + Send {
    /// Set timeout for read operations.
    ///
    /// A read that sees no data within the timeout fails with
    /// [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`].
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard anything received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Open a second handle on the same stream.
    ///
    /// The connection reads from one handle and writes through the other.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

/// Serial port wrapper implementing [`Transport`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Name of the underlying port, when known
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port_clone = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }
}

/// Check whether a read error only means "no data yet"
pub(crate) fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
