//! Serial link to the ROM bootloader.
//!
//! The protocol engine never touches a concrete serial driver. Everything it
//! needs from the link goes through [`Port`]: byte I/O with a read timeout,
//! the baud rate, and the DTR and RTS lines wired to EN and GPIO0 on most
//! boards.
//!
//! ```text
//!   Connection / CommandChannel
//!              |
//!          Port trait
//!          /        \
//!   NativePort    MockPort (tests)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use romflash::port::Port;
//!
//! fn pulse_reset<P: Port>(port: &mut P) -> romflash::Result<()> {
//!     port.set_rts(true)?;
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//!     port.set_rts(false)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default read timeout of a freshly opened port.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(3);

/// How to open a port. The bootloader always talks 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Initial baud rate.
    pub baud_rate: u32,
    /// Initial read timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_PORT_TIMEOUT,
        }
    }

    /// Set the initial timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A serial link to the bootloader.
///
/// Reads block until at least one byte is available or the timeout elapses.
/// A timeout may surface either as `Ok(0)` or as an `io::ErrorKind::TimedOut`
/// error; the framing layer treats both the same.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Current read timeout.
    fn timeout(&self) -> Duration;

    /// Switch the host side to `baud_rate`.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard everything received but not yet read.
    fn clear_input(&mut self) -> Result<()>;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Drive DTR. Asserted DTR pulls GPIO0 low on auto-reset circuits.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive RTS. Asserted RTS holds EN low on auto-reset circuits.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Number of bytes already received and waiting to be read.
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// USB product ID of the adapter behind this port, when known.
    fn usb_pid(&self) -> Option<u16> {
        None
    }

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, DEFAULT_PORT_TIMEOUT);

        let config = config.with_timeout(Duration::from_millis(100));
        assert_eq!(config.timeout, Duration::from_millis(100));
    }
}
