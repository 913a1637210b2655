//! Serial device discovery and classification.
//!
//! Ports are classified by USB VID/PID so the CLI can pick a likely board
//! when no port is given, and so the connection layer knows when the chip's
//! own USB-JTAG-Serial peripheral is on the other end.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB bridge/device kinds found on Espressif boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// WCH CH34x bridge.
    Ch340,
    /// Silicon Labs CP210x bridge, common on DevKitC boards.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 bridge.
    Ftdi,
    /// Prolific PL2303 bridge.
    Prolific,
    /// Built-in USB-JTAG-Serial peripheral (ESP32-C3, ESP32-S3).
    EspressifUsbJtag,
    /// Built-in USB-OTG CDC console (ESP32-S2, ESP32-S3).
    EspressifUsb,
    /// Anything else, including on-board UARTs.
    Unknown,
}

/// Espressif USB vendor ID.
pub const ESPRESSIF_VID: u16 = 0x303A;

/// Product ID of the USB-JTAG-Serial peripheral.
pub const USB_JTAG_SERIAL_PID: u16 = 0x1001;

/// `(vid, pids, kind)`. An empty PID list matches the whole vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (ESPRESSIF_VID, &[USB_JTAG_SERIAL_PID], DeviceKind::EspressifUsbJtag),
    (ESPRESSIF_VID, &[], DeviceKind::EspressifUsb),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(v, pids, _)| *v == vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |&(_, _, kind)| kind)
    }

    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::EspressifUsbJtag => "USB-JTAG-Serial",
            Self::EspressifUsb => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the VID/PID matched a known bridge or peripheral.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges found on most Espressif dev boards.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            Self::EspressifUsbJtag | Self::EspressifUsb | Self::Ch340 | Self::Cp210x
        )
    }

    /// Whether this is the chip's own USB peripheral rather than a bridge.
    pub fn is_native_usb(&self) -> bool {
        matches!(self, Self::EspressifUsbJtag | Self::EspressifUsb)
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// OS name of the port, such as `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Bridge or peripheral behind the port.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

#[cfg(feature = "native")]
impl From<serialport::SerialPortInfo> for DetectedPort {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                trace!(
                    "{}: USB {:04X}:{:04X} ({})",
                    info.port_name,
                    usb.vid,
                    usb.pid,
                    device.name()
                );
                Self {
                    name: info.port_name,
                    device,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial: usb.serial_number,
                }
            },
            _ => Self {
                name: info.port_name,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
        }
    }
}

/// All serial ports on the host, classified.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(DetectedPort::from).collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available endpoints (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the port to use from `ports`.
///
/// The chip's own USB peripheral wins over bridges, then common bridges,
/// then any known bridge, then whatever port comes first.
pub fn select_port(ports: Vec<DetectedPort>) -> Option<DetectedPort> {
    let rank = |port: &DetectedPort| {
        if port.device.is_native_usb() {
            0
        } else if port.device.is_high_priority() {
            1
        } else if port.device.is_known() {
            2
        } else {
            3
        }
    };
    // min_by_key keeps the first of equal ranks
    ports.into_iter().min_by_key(rank)
}

/// Auto-detect a single Espressif endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports()).ok_or(Error::DeviceNotFound)?;
    if port.device.is_known() {
        info!("Auto-detected {}: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Auto-detect a single endpoint (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "Port auto-detection needs the `native` feature".to_string(),
    ))
}
