//! [`Port`] over the `serialport` crate.

use crate::error::Result;
use crate::port::{Port, SerialConfig};
use log::{debug, trace};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;

/// An opened OS serial port.
pub struct NativePort {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
    usb_pid: Option<u16>,
}

impl NativePort {
    /// Open the port in `config` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        let usb_pid = lookup_usb_pid(&config.port_name);
        debug!(
            "Opened {} at {} baud (USB PID: {usb_pid:04X?})",
            config.port_name, config.baud_rate
        );

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
            usb_pid,
        })
    }

    fn inner(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

/// USB product ID of an enumerated port.
fn lookup_usb_pid(port_name: &str) -> Option<u16> {
    serialport::available_ports()
        .ok()?
        .into_iter()
        .find(|p| p.port_name == port_name)
        .and_then(|p| match p.port_type {
            SerialPortType::UsbPort(info) => Some(info.pid),
            _ => None,
        })
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.timeout != timeout {
            self.inner()?.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.inner()?.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        self.inner()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("DTR={level}");
        self.inner()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("RTS={level}");
        self.inner()?.write_request_to_send(level)?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.inner()?.bytes_to_read()?)
    }

    fn usb_pid(&self) -> Option<u16> {
        self.usb_pid
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_missing_port_has_no_pid() {
        assert_eq!(lookup_usb_pid("/dev/romflash-does-not-exist"), None);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/romflash-does-not-exist", 115_200);
        assert!(NativePort::open(&config).is_err());
    }
}
