//! Serial port handling
//!
//! Device discovery and low-level port setup for the motor controller.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use super::ProtocolError;

/// Path of a serial endpoint, e.g. `/dev/ttyACM0` or `COM3`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePath(String);

impl DevicePath {
    /// Wrap a path string
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DevicePath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DevicePath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DevicePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for DevicePath {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether the port sits behind a USB serial bridge, which is how the
    /// controller board shows up on the host
    pub fn is_usb(&self) -> bool {
        if self.vid.is_some() {
            return true;
        }
        let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
        basename.starts_with("ttyACM") || basename.starts_with("ttyUSB")
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Scan a device directory for `ttyACM*` / `ttyUSB*` nodes.
///
/// A missing or unreadable directory yields an empty list.
pub fn scan_dev_dir(dir: &Path) -> Vec<PortInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let fname = entry.file_name().to_str()?.to_string();
            if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                Some(PortInfo::bare(dir.join(fname).to_string_lossy().into_owned()))
            } else {
                None
            }
        })
        .collect()
}

fn merge_sorted(ports: impl IntoIterator<Item = PortInfo>) -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for p in ports {
        map.entry(p.name.clone()).or_insert(p);
    }
    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let api_ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!("could not list serial ports: {}", e);
            Vec::new()
        }
    };
    let ports = api_ports.into_iter().map(PortInfo::from);

    // Linux-only: udev may not report every CDC-ACM node
    #[cfg(target_os = "linux")]
    let ports = ports.chain(scan_dev_dir(Path::new("/dev")));

    merge_sorted(ports)
}

/// Filter and order candidate ports down to the devices worth connecting to
pub fn candidate_devices(ports: impl IntoIterator<Item = PortInfo>) -> Vec<DevicePath> {
    merge_sorted(ports)
        .into_iter()
        .filter(PortInfo::is_usb)
        .map(|p| DevicePath(p.name))
        .collect()
}

/// List the serial devices that may be a motor controller.
///
/// Never fails: no candidates is an empty list. Whether a path really speaks
/// the protocol is only known once [`connect`](super::connect) has run.
pub fn list_devices() -> Vec<DevicePath> {
    let devices = candidate_devices(list_ports());
    tracing::debug!("found {} candidate device(s)", devices.len());
    devices
}

/// Open a serial port for the motor controller
pub fn open_port(
    path: &DevicePath,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let port = serialport::new(path.as_str(), baud_rate)
        .timeout(timeout)
        .open()?;
    Ok(port)
}

/// Configure a serial port for the motor controller
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    // Standard 8N1 configuration
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Keep DTR/RTS asserted; a DTR toggle resets Arduino-based boards
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}
