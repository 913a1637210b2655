//! Error types for romflash.
//!
//! Every failure the library can report maps to one variant of [`Error`].
//! Framing and image-format failures have their own enums so callers can
//! match on them without parsing strings.

use std::io;
use thiserror::Error;

/// Result type for romflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed SLIP byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A byte other than the delimiter arrived while waiting for a packet.
    #[error("Invalid head of packet (0x{0:02x}): Possible serial noise or corruption.")]
    InvalidHead(u8),

    /// An escape byte was followed by an unknown code.
    #[error("Invalid SLIP escape (0xdb, 0x{0:02x})")]
    InvalidEscape(u8),

    /// The link never produced a single byte.
    #[error("No serial data received.")]
    NoData,

    /// The link went quiet between packets.
    #[error("Serial data stream stopped: Possible serial noise or corruption.")]
    StreamStopped,

    /// The link went quiet in the middle of a packet.
    #[error("Packet content transfer stopped (received {0} bytes)")]
    TransferStopped(usize),
}

/// Malformed firmware image or ELF input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Unexpected magic byte at the start of an image.
    #[error("Invalid firmware image magic 0x{0:02x}")]
    BadMagic(u8),

    /// More than 16 segments.
    #[error(
        "Invalid segment count {0} (max 16). Usually this indicates a linker script problem."
    )]
    SegmentCount(usize),

    /// The input ended before a structure was complete.
    #[error("Image is truncated: {0}")]
    Truncated(String),

    /// Any other structural problem.
    #[error("Invalid image: {0}")]
    Invalid(String),

    /// ELF input could not be used.
    #[error("{path}: {reason}")]
    Elf {
        /// Source file name.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Two flash-mapped segments fall into the same MMU page.
    #[error(
        "Segment loaded at 0x{second:08x} lands in same 64KB flash mapping as segment loaded at 0x{first:08x}. Can't generate binary. Suggest changing linker script or ELF to merge sections."
    )]
    FlashMappingOverlap {
        /// Load address of the earlier segment.
        first: u32,
        /// Load address of the later segment.
        second: u32,
    },
}

/// Error type for romflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The SLIP byte stream was malformed.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The device answered, but not with what was asked for.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device rejected the opcode outright.
    #[error("{}", unsupported_command_message(.opcode, .secure_download_mode))]
    UnsupportedCommand {
        /// Rejected opcode.
        opcode: u8,
        /// Whether the session already knew it was in secure download mode.
        secure_download_mode: bool,
    },

    /// No chip profile matched the magic register value.
    #[error(
        "Unexpected chip magic value 0x{0:08x}. Failed to autodetect chip type."
    )]
    ChipDetectionFailed(u32),

    /// The connected chip is not the one that was requested.
    #[error("This chip is {detected} not {expected}. Wrong chip argument?")]
    ChipMismatch {
        /// Chip found on the wire.
        detected: String,
        /// Chip the caller asked for.
        expected: String,
    },

    /// The device returned a non-zero status.
    #[error("{}", command_failed_message(.description, .status))]
    CommandFailed {
        /// What the host was trying to do.
        description: String,
        /// Raw status bytes as returned by the device.
        status: Vec<u8>,
    },

    /// Data read back from flash did not match what was written.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The RAM loader did not start.
    #[error("Stub bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Could not establish a session with the bootloader.
    #[error("{0}")]
    ConnectionFailed(String),

    /// No serial device was found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation not available on this chip or loader.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Firmware image or ELF problem.
    #[error(transparent)]
    Image(#[from] ImageError),
}

impl Error {
    /// Whether this error means the device refused a command.
    pub fn is_unsupported_command(&self) -> bool {
        matches!(self, Self::UnsupportedCommand { .. })
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn unsupported_command_message(opcode: &u8, secure_download_mode: &bool) -> String {
    if *secure_download_mode {
        format!("This command (0x{opcode:x}) is not supported in Secure Download Mode")
    } else {
        format!("Invalid (unsupported) command 0x{opcode:x}")
    }
}

fn command_failed_message(description: &str, status: &[u8]) -> String {
    let hex: String = status
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    let reason = status_code(status)
        .and_then(status_description)
        .unwrap_or("Unknown result");
    format!("Failed to {description} (result was {hex}: {reason})")
}

/// Fold the first two status bytes into the big-endian code used by the
/// reason table.
pub fn status_code(status: &[u8]) -> Option<u16> {
    match status {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Human-readable meaning of a ROM or stub status code.
pub fn status_description(code: u16) -> Option<&'static str> {
    let text = match code {
        0x101 => "Out of memory",
        0x102 => "Invalid argument",
        0x103 => "Invalid state",
        0x104 => "Invalid size",
        0x105 => "Requested resource not found",
        0x106 => "Operation or feature not supported",
        0x107 => "Operation timed out",
        0x108 => "Received response was invalid",
        0x109 => "CRC or checksum was invalid",
        0x10A => "Version was invalid",
        0x10B => "MAC address was invalid",
        // Flasher stub codes
        0xC000 => "Bad data length",
        0xC100 => "Bad data checksum",
        0xC200 => "Bad blocksize",
        0xC300 => "Invalid command",
        0xC400 => "Failed SPI operation",
        0xC500 => "Failed SPI unlock",
        0xC600 => "Not in flash mode",
        0xC700 => "Inflate error",
        0xC800 => "Not enough data",
        0xC900 => "Too much data",
        0xFF00 => "Command not implemented",
        _ => return None,
    };
    Some(text)
}
