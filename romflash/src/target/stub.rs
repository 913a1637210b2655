//! RAM stub loader: container format and bootstrap.
//!
//! A stub container is a small little-endian file:
//!
//! ```text
//! "STUB" chip:u32 entry:u32
//! text_start:u32 text_len:u32 text[text_len]
//! data_start:u32 data_len:u32 data[data_len]
//! ```
//!
//! `chip` holds the image chip ID, or `0x10000` for ESP8266.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::command::{Command, DEFAULT_TIMEOUT, MEM_END_ROM_TIMEOUT};
use crate::protocol::slip::hex;
use crate::target::chip::{Chip, LoaderMode};
use crate::target::connection::{Connection, ConnectionState};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use std::io::{Cursor, Read};
use std::ops::Range;
use std::path::Path;

/// Container magic.
pub const STUB_MAGIC: &[u8; 4] = b"STUB";

/// `chip` field value for ESP8266 stubs.
pub const ESP8266_STUB_CHIP: u32 = 0x10000;

/// The stub's greeting after it starts.
pub const STUB_HANDSHAKE: &[u8; 4] = b"OHAI";

/// Parsed stub container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubImage {
    /// Raw chip field.
    pub chip: u32,
    /// Entry point.
    pub entry: u32,
    /// Load address of the code segment.
    pub text_start: u32,
    /// Code segment.
    pub text: Vec<u8>,
    /// Load address of the data segment.
    pub data_start: u32,
    /// Data segment.
    pub data: Vec<u8>,
}

impl StubImage {
    /// Parse a stub container.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let truncated = |_| Error::BootstrapFailed("Stub file is truncated".into());
        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cursor
            .read_exact(&mut magic)
            .map_err(truncated)?;
        if &magic != STUB_MAGIC {
            return Err(Error::BootstrapFailed(format!(
                "Not a stub file (magic {})",
                hex(&magic)
            )));
        }

        let chip = cursor
            .read_u32::<LittleEndian>()
            .map_err(truncated)?;
        let entry = cursor
            .read_u32::<LittleEndian>()
            .map_err(truncated)?;
        let (text_start, text) = read_segment(&mut cursor).map_err(truncated)?;
        let (data_start, data) = read_segment(&mut cursor).map_err(truncated)?;
        check_segment_fits("text", text_start, &text)?;
        check_segment_fits("data", data_start, &data)?;
        Ok(Self {
            chip,
            entry,
            text_start,
            text,
            data_start,
            data,
        })
    }

    /// Read a stub container from disk.
    pub fn from_file<Q: AsRef<Path>>(path: Q) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Serialize back into the container format.
    #[allow(clippy::cast_possible_truncation, clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = STUB_MAGIC.to_vec();
        buf.write_u32::<LittleEndian>(self.chip)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.entry)
            .unwrap();
        for (start, bytes) in [(self.text_start, &self.text), (self.data_start, &self.data)] {
            buf.write_u32::<LittleEndian>(start)
                .unwrap();
            buf.write_u32::<LittleEndian>(bytes.len() as u32)
                .unwrap();
            buf.extend_from_slice(bytes);
        }
        buf
    }

    /// Chip the stub was built for.
    pub fn target_chip(&self) -> Option<Chip> {
        match self.chip {
            ESP8266_STUB_CHIP => Some(Chip::Esp8266),
            id => u16::try_from(id)
                .ok()
                .and_then(Chip::from_image_chip_id),
        }
    }

    /// RAM occupied by the code segment.
    pub fn text_range(&self) -> Range<u32> {
        segment_range(self.text_start, &self.text)
    }

    /// RAM occupied by the data segment.
    pub fn data_range(&self) -> Range<u32> {
        segment_range(self.data_start, &self.data)
    }
}

/// `start..start + len`, clamped at the top of the address space.
fn segment_range(start: u32, data: &[u8]) -> Range<u32> {
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    start..start.saturating_add(len)
}

/// Reject a segment that runs past the top of the address space.
fn check_segment_fits(name: &str, start: u32, data: &[u8]) -> Result<()> {
    u32::try_from(data.len())
        .ok()
        .and_then(|len| start.checked_add(len))
        .map(|_| ())
        .ok_or_else(|| {
            Error::BootstrapFailed(format!(
                "Stub {name} segment at 0x{start:08x} ({} bytes) wraps the address space",
                data.len()
            ))
        })
}

fn read_segment(cursor: &mut Cursor<&[u8]>) -> std::io::Result<(u32, Vec<u8>)> {
    let start = cursor.read_u32::<LittleEndian>()?;
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok((start, bytes))
}

impl<P: Port> Connection<P> {
    /// Open a RAM download of `size` bytes at `offset`.
    ///
    /// Refuses ranges that overlap a running stub.
    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, offset: u32) -> Result<()> {
        let load = offset..offset.saturating_add(size);
        let Some(resident_ranges) = &self.resident_ranges else {
            return Err(Error::Unsupported(format!(
                "A software loader of unknown layout is already running. Can't load binary at 0x{:08x}-0x{:08x}. Reset the chip or use the no-stub option to load to RAM.",
                load.start, load.end
            )));
        };
        if let Some(resident) = resident_ranges
            .iter()
            .find(|r| load.start < r.end && r.start < load.end)
        {
            return Err(Error::Protocol(format!(
                "Software loader is resident at 0x{:08x}-0x{:08x}. Can't load binary at overlapping address range 0x{:08x}-0x{:08x}. Either change binary loading address, or use the no-stub option to disable the software loader.",
                resident.start, resident.end, load.start, load.end
            )));
        }
        self.channel
            .check_command(
                "enter RAM download mode",
                &Command::mem_begin(size, blocks, block_size, offset),
                DEFAULT_TIMEOUT,
            )?;
        Ok(())
    }

    /// Send one RAM block.
    pub fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<()> {
        self.channel
            .check_command(
                "write to target RAM",
                &Command::mem_data(data, sequence),
                DEFAULT_TIMEOUT,
            )?;
        Ok(())
    }

    /// Leave RAM download mode and jump to `entry` when it is non-zero.
    ///
    /// The ROM may start the new code before it answers, so a missing reply
    /// is only an error when talking to the stub.
    pub fn mem_finish(&mut self, entry: u32) -> Result<()> {
        let timeout = match self.mode() {
            LoaderMode::Stub => DEFAULT_TIMEOUT,
            LoaderMode::Rom => MEM_END_ROM_TIMEOUT,
        };
        match self.channel.check_command(
            "leave RAM download mode",
            &Command::mem_end(entry),
            timeout,
        ) {
            Ok(_) => Ok(()),
            Err(e) if self.mode() == LoaderMode::Rom => {
                debug!("Ignoring ROM reply to MEM_END: {e}");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Upload `data` to RAM at `address` in RAM-block sized pieces.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mem_upload(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let block_size = self.ram_block();
        let size = data.len() as u32;
        self.mem_begin(size, size.div_ceil(block_size), block_size, address)?;
        for (seq, block) in data
            .chunks(block_size as usize)
            .enumerate()
        {
            self.mem_block(block, seq as u32)?;
        }
        Ok(())
    }

    /// Start the stub loader and switch the session over to it.
    ///
    /// When the last sync was already answered by a stub nothing is
    /// uploaded and `stub` may be `None`.
    pub fn run_stub(&mut self, stub: Option<&StubImage>) -> Result<()> {
        if self.state == ConnectionState::StubRunning {
            return Ok(());
        }
        let profile = self.profile()?;

        if self.sync_stub_detected {
            info!("Stub is already running. No upload is necessary.");
        } else {
            let stub = stub.ok_or_else(|| {
                Error::BootstrapFailed(format!("No stub loader available for {}", profile.name))
            })?;
            if stub.target_chip() != Some(profile.chip) {
                return Err(Error::BootstrapFailed(format!(
                    "Stub was built for chip 0x{:x}, not {}",
                    stub.chip, profile.name
                )));
            }

            info!("Uploading stub...");
            for (start, bytes) in [(stub.text_start, &stub.text), (stub.data_start, &stub.data)] {
                if !bytes.is_empty() {
                    self.mem_upload(start, bytes)?;
                }
            }
            info!("Running stub...");
            self.mem_finish(stub.entry)?;

            let reply = self
                .channel
                .with_timeout(DEFAULT_TIMEOUT, |ch| ch.read_frame())
                .map_err(|e| Error::BootstrapFailed(format!("No reply from stub: {e}")))?;
            if reply != STUB_HANDSHAKE {
                return Err(Error::BootstrapFailed(format!(
                    "Failed to start stub. Unexpected response: {}",
                    hex(&reply)
                )));
            }
        }

        info!("Stub running...");
        self.state = ConnectionState::StubRunning;
        self.channel.set_status_len(2);
        self.resident_ranges = stub.map(|s| vec![s.text_range(), s.data_range()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::target::connection::{ConnectOptions, ResetMode};

    const ESP32_MAGIC: u32 = 0x00F0_1D83;

    fn esp32_stub() -> StubImage {
        StubImage {
            chip: 0,
            entry: 0x4008_0400,
            text_start: 0x4008_0000,
            text: vec![0xAA; 0x2000],
            data_start: 0x3FFB_0000,
            data: vec![0x55; 0x100],
        }
    }

    fn connected(stub_value: u32) -> Connection<MockPort> {
        let mut conn = Connection::new(MockPort::new());
        let port = conn.channel().port_mut();
        for _ in 0..8 {
            port.push_ok(0x08, stub_value, 2);
        }
        port.push_ok(0x0A, ESP32_MAGIC, 4);
        let options = ConnectOptions {
            reset: ResetMode::NoReset,
            ..ConnectOptions::default()
        };
        conn.connect(&options).unwrap();
        conn.channel().port_mut().written.clear();
        conn
    }

    #[test]
    fn test_container_parse() {
        let stub = esp32_stub();
        let parsed = StubImage::from_bytes(&stub.to_bytes()).unwrap();
        assert_eq!(parsed, stub);
        assert_eq!(parsed.target_chip(), Some(Chip::Esp32));
        assert_eq!(parsed.text_range(), 0x4008_0000..0x4008_2000);
    }

    #[test]
    fn test_container_rejects_bad_input() {
        assert!(StubImage::from_bytes(b"STUX\0\0\0\0").is_err());

        let mut bytes = esp32_stub().to_bytes();
        bytes.truncate(40);
        let err = StubImage::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::BootstrapFailed(_)));
    }

    #[test]
    fn test_container_rejects_wrapping_segment() {
        let stub = StubImage {
            text_start: 0xFFFF_FFF0,
            text: vec![0; 0x20],
            ..esp32_stub()
        };
        let err = StubImage::from_bytes(&stub.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::BootstrapFailed(_)));
        assert!(err.to_string().contains("0xfffffff0"));

        // Built in memory the range still stays well-formed.
        assert_eq!(stub.text_range(), 0xFFFF_FFF0..u32::MAX);

        let fits = StubImage {
            data_start: 0xFFFF_FE00,
            data: vec![0; 0x100],
            ..esp32_stub()
        };
        let parsed = StubImage::from_bytes(&fits.to_bytes()).unwrap();
        assert_eq!(parsed.data_range(), 0xFFFF_FE00..0xFFFF_FF00);
    }

    #[test]
    fn test_esp8266_chip_field() {
        let stub = StubImage {
            chip: ESP8266_STUB_CHIP,
            ..esp32_stub()
        };
        assert_eq!(stub.target_chip(), Some(Chip::Esp8266));
    }

    #[test]
    fn test_run_stub_uploads_and_handshakes() {
        let mut conn = connected(1);
        let port = conn.channel().port_mut();
        // text: begin + 2 blocks, data: begin + 1 block
        for op in [0x05, 0x07, 0x07, 0x05, 0x07] {
            port.push_ok(op, 0, 4);
        }
        port.push_ok(0x06, 0, 4);
        port.push_frame(STUB_HANDSHAKE);

        conn.run_stub(Some(&esp32_stub()))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::StubRunning);
        assert_eq!(conn.mode(), LoaderMode::Stub);
        assert_eq!(conn.channel().status_len(), 2);
        assert_eq!(
            conn.port().sent_opcodes(),
            vec![0x05, 0x07, 0x07, 0x05, 0x07, 0x06]
        );

        let frames = conn.port().sent_frames();
        // MEM_BEGIN size, blocks, block size, offset
        assert_eq!(&frames[0][8..12], &0x2000u32.to_le_bytes());
        assert_eq!(&frames[0][12..16], &2u32.to_le_bytes());
        // Second MEM_DATA carries sequence 1
        assert_eq!(&frames[2][12..16], &1u32.to_le_bytes());
    }

    #[test]
    fn test_run_stub_bad_handshake() {
        let mut conn = connected(1);
        let port = conn.channel().port_mut();
        for op in [0x05, 0x07, 0x07, 0x05, 0x07, 0x06] {
            port.push_ok(op, 0, 4);
        }
        port.push_frame(b"NOPE");

        let err = conn
            .run_stub(Some(&esp32_stub()))
            .unwrap_err();
        assert!(matches!(err, Error::BootstrapFailed(_)));
        assert!(
            err.to_string()
                .contains("Unexpected response: 4e4f5045")
        );
        assert_eq!(conn.state(), ConnectionState::Synced);
    }

    #[test]
    fn test_run_stub_wrong_chip() {
        let mut conn = connected(1);
        let stub = StubImage {
            chip: 5,
            ..esp32_stub()
        };
        let err = conn.run_stub(Some(&stub)).unwrap_err();
        assert!(matches!(err, Error::BootstrapFailed(_)));
        assert!(conn.port().written.is_empty());
    }

    #[test]
    fn test_resident_stub_skips_upload() {
        let mut conn = connected(0);
        conn.run_stub(None).unwrap();
        assert_eq!(conn.state(), ConnectionState::StubRunning);
        assert!(conn.port().written.is_empty());
    }

    #[test]
    fn test_mem_begin_refuses_unknown_resident_stub() {
        let mut conn = connected(0);
        conn.run_stub(None).unwrap();

        let err = conn
            .mem_begin(0x100, 1, 0x1800, 0x4008_1F00)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("unknown layout"));
        assert!(conn.port().written.is_empty());
    }

    #[test]
    fn test_mem_begin_rejects_overlap() {
        let mut conn = connected(0);
        conn.run_stub(Some(&esp32_stub()))
            .unwrap();

        let err = conn
            .mem_begin(0x100, 1, 0x1800, 0x4008_1F00)
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Software loader is resident at 0x40080000-0x40082000")
        );
        assert!(conn.port().written.is_empty());

        conn.channel()
            .port_mut()
            .push_ok(0x05, 0, 2);
        conn.mem_begin(0x100, 1, 0x1800, 0x4008_2000)
            .unwrap();
    }
}
