//! Serial port handling
//!
//! Port discovery and low-level serial port setup for the dispenser board.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::DispenserError;

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

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
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
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Where discovery looks for device nodes
///
/// The defaults point at the Linux device tree; tests aim them at a temporary
/// directory instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPaths {
    /// Directory of stable, descriptive symlinks (udev `by-id`)
    pub by_id_dir: PathBuf,
    /// Directory holding the generic `ttyACM*` / `ttyUSB*` nodes
    pub dev_dir: PathBuf,
}

impl Default for DiscoveryPaths {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/serial/by-id"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

/// Generic device-name prefixes, in preference order
const GENERIC_PREFIXES: [&str; 2] = ["ttyACM", "ttyUSB"];

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in GENERIC_PREFIXES.iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank as u8, num, basename.to_string());
        }
    }
    (GENERIC_PREFIXES.len() as u8, 0, basename.to_string())
}

fn sorted_entries(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_name().to_str().map(&keep).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// Resolve the dispenser endpoint
///
/// Prefers the first (sorted) stable `by-id` link, resolved to its target.
/// Falls back to the first generic `ttyACM*` / `ttyUSB*` node. Fails with
/// [`DispenserError::DeviceNotFound`] when neither exists.
///
/// Generic nodes are ordered by family (ACM before USB), then by numeric
/// suffix, so `ttyACM2` wins over `ttyACM10`. A plain string sort would pick
/// `ttyACM10` first.
pub fn find_port(paths: &DiscoveryPaths) -> Result<String, DispenserError> {
    if let Some(link) = sorted_entries(&paths.by_id_dir, |_| true).into_iter().next() {
        let resolved = fs::canonicalize(&link).unwrap_or_else(|e| {
            warn!("Could not resolve {}: {} (using link path)", link.display(), e);
            link.clone()
        });
        debug!("Discovered stable device link {}", link.display());
        return Ok(resolved.to_string_lossy().into_owned());
    }

    let mut generic = sorted_entries(&paths.dev_dir, |name| {
        GENERIC_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    });
    generic.sort_by_key(|p| port_sort_key(&p.to_string_lossy()));

    match generic.into_iter().next() {
        Some(port) => {
            debug!("Discovered generic serial device {}", port.display());
            Ok(port.to_string_lossy().into_owned())
        }
        None => Err(DispenserError::DeviceNotFound),
    }
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: Add /dev/ttyACM* and /dev/ttyUSB* entries if present but not found by API
    #[cfg(target_os = "linux")]
    for path in sorted_entries(Path::new("/dev"), |name| {
        GENERIC_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    }) {
        let full = path.to_string_lossy().into_owned();
        map.entry(full.clone()).or_insert_with(|| PortInfo::bare(full));
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with the given read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, DispenserError> {
    serialport::new(name, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(|e| DispenserError::open_failed(name, e))
}

/// Configure a serial port for the dispenser board (8N1, no flow control)
pub fn configure_port(name: &str, port: &mut dyn SerialPort) -> Result<(), DispenserError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| DispenserError::open_failed(name, e))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| DispenserError::open_failed(name, e))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| DispenserError::open_failed(name, e))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| DispenserError::open_failed(name, e))?;

    // Some USB bridges only forward data once DTR is asserted
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}
