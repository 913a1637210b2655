//! Command/response channel over a SLIP-framed port.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::command::{Command, CommandOutput, DEFAULT_TIMEOUT, MAX_TIMEOUT, Response};
use crate::protocol::slip::{self, SlipReader, hex};
use log::trace;
use std::time::Duration;

/// Frames read while looking for the reply to one request.
const RESPONSE_READ_ATTEMPTS: usize = 100;

/// Blocking request/response channel.
///
/// Owns the port for the lifetime of a session. Exactly one command is in
/// flight at a time.
pub struct CommandChannel<P: Port> {
    port: P,
    reader: SlipReader,
    status_len: usize,
    secure_download_mode: bool,
}

impl<P: Port> CommandChannel<P> {
    /// Wrap an opened port. Status length starts at the 2-byte default.
    pub fn new(port: P) -> Self {
        Self {
            port,
            reader: SlipReader::new(),
            status_len: 2,
            secure_download_mode: false,
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Number of trailing status bytes in each response body.
    pub fn status_len(&self) -> usize {
        self.status_len
    }

    /// Change the status length (ROM vs stub, chip dependent).
    pub fn set_status_len(&mut self, len: usize) {
        self.status_len = len;
    }

    /// Whether the device is known to be in secure download mode.
    pub fn secure_download_mode(&self) -> bool {
        self.secure_download_mode
    }

    /// Record that the device is in secure download mode.
    pub fn set_secure_download_mode(&mut self, enabled: bool) {
        self.secure_download_mode = enabled;
    }

    /// Frame and write a raw payload.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let framed = slip::encode(payload);
        trace!("Write {} bytes: {}", framed.len(), hex(&framed));
        self.port
            .write_all_bytes(&framed)
    }

    /// Read the next raw frame with the port's current timeout.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.reader
            .read_frame(&mut self.port)
    }

    /// Drop everything buffered on the host side.
    pub fn flush_input(&mut self) -> Result<()> {
        self.port
            .clear_input()?;
        self.reader
            .reset();
        Ok(())
    }

    /// Run `f` with the port read timeout temporarily set to `timeout`.
    ///
    /// The previous timeout is restored on every exit path.
    pub fn with_timeout<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = self.port.timeout();
        let scoped = timeout.min(MAX_TIMEOUT);
        if scoped == saved {
            return f(self);
        }

        self.port
            .set_timeout(scoped)?;
        let result = f(self);
        let restored = self.port.set_timeout(saved);
        match (result, restored) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        }
    }

    /// Send a command and optionally wait for the matching response.
    ///
    /// Returns `None` when `wait_response` is false.
    pub fn send_command(
        &mut self,
        command: &Command,
        wait_response: bool,
        timeout: Duration,
    ) -> Result<Option<Response>> {
        self.with_timeout(timeout, |ch| {
            trace!(
                "Command {} data len={} wait_response={wait_response} timeout={:.3}s",
                command.opcode(),
                command
                    .data()
                    .len(),
                timeout.as_secs_f64()
            );
            ch.write_frame(&command.to_bytes()?)?;
            if !wait_response {
                return Ok(None);
            }
            ch.receive(Some(command.opcode().as_u8()))
                .map(Some)
        })
    }

    /// Send a command and wait for its response.
    pub fn command(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        self.send_command(command, true, timeout)?
            .ok_or_else(|| Error::Protocol("No response".into()))
    }

    /// Wait for a response without sending anything.
    ///
    /// With `opcode` set to `None` the first well-formed response wins.
    pub fn read_response(&mut self, opcode: Option<u8>, timeout: Duration) -> Result<Response> {
        self.with_timeout(timeout, |ch| ch.receive(opcode))
    }

    fn receive(&mut self, opcode: Option<u8>) -> Result<Response> {
        for _ in 0..RESPONSE_READ_ATTEMPTS {
            let frame = self.read_frame()?;
            let Some(response) = Response::parse(&frame) else {
                continue;
            };
            if response.direction != 1 {
                continue;
            }

            if opcode.is_none_or(|op| response.opcode == op) {
                return Ok(response);
            }
            if response.is_invalid_command() {
                // Unknown opcodes can produce more than one error reply
                self.flush_input()?;
                return Err(Error::UnsupportedCommand {
                    opcode: opcode.unwrap_or(response.opcode),
                    secure_download_mode: self.secure_download_mode,
                });
            }
        }
        Err(Error::Protocol("Response doesn't match request".into()))
    }

    /// Send a command and turn a failure status into an error.
    ///
    /// Returns the response data minus status bytes when there is any,
    /// otherwise the response value field.
    pub fn check_command(
        &mut self,
        description: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let response = self.command(command, timeout)?;
        let status_len = self.status_len;
        let Some(status) = response.status_bytes(status_len) else {
            return Err(Error::Protocol(format!(
                "Failed to {description}. Only got {} byte status response.",
                response
                    .body
                    .len()
            )));
        };
        if status[0] != 0 {
            return Err(Error::CommandFailed {
                description: description.to_string(),
                status: status.to_vec(),
            });
        }

        let data_len = response.body.len() - status_len;
        if data_len > 0 {
            let mut body = response.body;
            body.truncate(data_len);
            Ok(CommandOutput::Data(body))
        } else {
            Ok(CommandOutput::Value(response.value))
        }
    }

    /// Read a 32-bit register.
    ///
    /// Does not go through [`Self::check_command`]: the status length is
    /// not known yet while detecting the chip.
    pub fn read_reg(&mut self, address: u32, timeout: Duration) -> Result<u32> {
        let command = Command::read_reg(address);
        let response = self.command(&command, timeout)?;
        if response.is_invalid_command() {
            return Err(Error::UnsupportedCommand {
                opcode: command.opcode().as_u8(),
                secure_download_mode: self.secure_download_mode,
            });
        }
        if response.is_failure() {
            return Err(Error::CommandFailed {
                description: format!("read register address {address:08x}"),
                status: response.body,
            });
        }
        Ok(response.value)
    }

    /// Write a 32-bit register, touching only the bits in `mask`.
    pub fn write_reg_masked(&mut self, address: u32, value: u32, mask: u32) -> Result<()> {
        self.check_command(
            "write target memory",
            &Command::write_reg(address, value, mask, 0),
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// Write a full 32-bit register.
    pub fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
        self.write_reg_masked(address, value, 0xFFFF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramingError;
    use crate::port::mock::MockPort;
    use crate::protocol::command::Opcode;

    fn channel() -> CommandChannel<MockPort> {
        CommandChannel::new(MockPort::new())
    }

    #[test]
    fn test_command_skips_short_and_foreign_frames() {
        let mut ch = channel();
        ch.port_mut()
            .push_frame(&[0x01, 0x08]);
        ch.port_mut()
            .push_ok(0x08, 0, 2);
        ch.port_mut()
            .push_ok(0x0A, 0xDEAD_BEEF, 2);

        let resp = ch
            .command(&Command::read_reg(0x4000_1000), DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(resp.value, 0xDEAD_BEEF);
        assert_eq!(ch.port().sent_opcodes(), vec![0x0A]);
    }

    #[test]
    fn test_response_mismatch_after_retry_budget() {
        let mut ch = channel();
        for _ in 0..RESPONSE_READ_ATTEMPTS {
            ch.port_mut()
                .push_ok(0x08, 0, 2);
        }
        let err = ch
            .command(&Command::read_reg(0), DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "Response doesn't match request"));
    }

    #[test]
    fn test_unsupported_command() {
        let mut ch = channel();
        ch.set_secure_download_mode(true);
        ch.port_mut()
            .push_response(0x00, 0, &[0x01, 0x05]);
        let err = ch
            .command(&Command::spi_flash_md5(0, 16), DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedCommand {
                opcode: 0x13,
                secure_download_mode: true
            }
        ));
    }

    #[test]
    fn test_check_command_strips_status() {
        let mut ch = channel();
        ch.set_status_len(4);
        ch.port_mut()
            .push_response(0x13, 0, b"0123456789abcdef0123456789abcdef\0\0\0\0");
        let out = ch
            .check_command("calculate md5sum", &Command::spi_flash_md5(0, 16), DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(out.into_data(), b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_check_command_returns_value_without_data() {
        let mut ch = channel();
        ch.port_mut()
            .push_ok(0x09, 0x1234, 2);
        let out = ch
            .check_command("write target memory", &Command::write_reg(0, 0, !0, 0), DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(out, CommandOutput::Value(0x1234));
    }

    #[test]
    fn test_check_command_failure_maps_status() {
        let mut ch = channel();
        ch.port_mut()
            .push_response(0x02, 0, &[0x01, 0x06]);
        let err = ch
            .check_command(
                "enter Flash download mode",
                &Command::flash_begin(0, 0, 0x400, 0, None),
                DEFAULT_TIMEOUT,
            )
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref status, .. } if status == &[0x01, 0x06]));
        assert!(
            err.to_string()
                .contains("Operation or feature not supported")
        );
    }

    #[test]
    fn test_short_status_response() {
        let mut ch = channel();
        ch.set_status_len(4);
        ch.port_mut()
            .push_response(0x09, 0, &[0x00, 0x00]);
        let err = ch
            .check_command("write target memory", &Command::write_reg(0, 0, !0, 0), DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Only got 2 byte status response")
        );
    }

    #[test]
    fn test_read_reg_failure() {
        let mut ch = channel();
        ch.port_mut()
            .push_response(0x0A, 0, &[0x01, 0x00]);
        let err = ch
            .read_reg(0x6000_0078, DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Failed to read register address 60000078")
        );
    }

    #[test]
    fn test_read_reg_rejected_in_secure_mode() {
        let mut ch = channel();
        ch.port_mut()
            .push_response(0x0A, 0, &[0x01, 0x05, 0x00, 0x00]);
        let err = ch
            .read_reg(0x4000_1000, DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(err.is_unsupported_command());
    }

    #[test]
    fn test_timeout_restored_after_error() {
        let mut ch = channel();
        let before = ch.port().timeout();
        let err = ch
            .command(&Command::sync(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Framing(FramingError::NoData)));
        assert_eq!(ch.port().timeout(), before);
        assert_eq!(
            ch.port().timeouts,
            vec![Duration::from_millis(100), before]
        );
    }

    #[test]
    fn test_timeout_is_capped() {
        let mut ch = channel();
        ch.port_mut()
            .push_ok(Opcode::EraseFlash.as_u8(), 0, 2);
        ch.command(&Command::erase_flash(), Duration::from_secs(1000))
            .unwrap();
        assert_eq!(ch.port().timeouts[0], MAX_TIMEOUT);
    }

    #[test]
    fn test_no_wait_sends_only() {
        let mut ch = channel();
        let resp = ch
            .send_command(&Command::run_user_code(), false, DEFAULT_TIMEOUT)
            .unwrap();
        assert!(resp.is_none());
        assert_eq!(ch.port().sent_opcodes(), vec![0xD3]);
    }
}
