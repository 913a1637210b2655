//! Bootloader command packets.
//!
//! ## Request (inside a SLIP frame)
//!
//! | Offset | Size | Field     | Description                          |
//! |--------|------|-----------|--------------------------------------|
//! | 0      | 1    | Direction | Always 0x00 for requests             |
//! | 1      | 1    | Opcode    | [`Opcode`]                           |
//! | 2      | 2    | Length    | Payload length (LE)                  |
//! | 4      | 4    | Checksum  | XOR checksum of data blocks (LE)     |
//! | 8      | N    | Payload   | Command specific                     |
//!
//! ## Response
//!
//! | Offset | Size | Field     | Description                          |
//! |--------|------|-----------|--------------------------------------|
//! | 0      | 1    | Direction | Always 0x01 for responses            |
//! | 1      | 1    | Opcode    | Echo of the request opcode           |
//! | 2      | 2    | Length    | Body length (LE)                     |
//! | 4      | 4    | Value     | Register value for READ_REG          |
//! | 8      | N    | Body      | Data followed by 2 or 4 status bytes |

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use std::time::Duration;

/// Seed for the data-block XOR checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Second status byte sent by the ROM for an opcode it does not know.
pub const ROM_INVALID_RECV_MSG: u8 = 0x05;

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for a full chip erase.
pub const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound for any computed timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(240);

/// Timeout for a single SYNC exchange.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// MEM_END timeout in ROM mode; the ROM may jump away without replying.
pub const MEM_END_ROM_TIMEOUT: Duration = Duration::from_millis(50);

/// Seconds per megabyte for SPI_FLASH_MD5.
pub const MD5_TIMEOUT_PER_MB: f64 = 8.0;

/// Seconds per megabyte for erasing a region.
pub const ERASE_REGION_TIMEOUT_PER_MB: f64 = 30.0;

/// Seconds per megabyte for erase-then-write of a data block.
pub const ERASE_WRITE_TIMEOUT_PER_MB: f64 = 40.0;

/// Scale a per-megabyte timeout to `size` bytes, never below the default.
pub fn timeout_per_mb(seconds_per_mb: f64, size: u32) -> Duration {
    let secs = seconds_per_mb * f64::from(size) / 1e6;
    Duration::from_secs_f64(secs).max(DEFAULT_TIMEOUT)
}

/// XOR-fold `data` starting from `seed`.
pub fn checksum_from(seed: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(seed, |acc, b| acc ^ b)
}

/// Checksum carried in the header of data-block commands.
pub fn checksum(data: &[u8]) -> u32 {
    u32::from(checksum_from(CHECKSUM_SEED, data))
}

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Begin flash download.
    FlashBegin = 0x02,
    /// Flash data block.
    FlashData = 0x03,
    /// Finish flash download.
    FlashEnd = 0x04,
    /// Begin RAM download.
    MemBegin = 0x05,
    /// Finish RAM download and optionally jump.
    MemEnd = 0x06,
    /// RAM data block.
    MemData = 0x07,
    /// Autobaud sync.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    /// Configure SPI flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// ROM flash read, 64 bytes at a time.
    ReadFlashSlow = 0x0E,
    /// Switch UART baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin compressed flash download.
    FlashDeflBegin = 0x10,
    /// Compressed flash data block.
    FlashDeflData = 0x11,
    /// Finish compressed flash download.
    FlashDeflEnd = 0x12,
    /// MD5 of a flash region.
    SpiFlashMd5 = 0x13,
    /// Security information query.
    GetSecurityInfo = 0x14,
    /// Erase the whole chip (stub only).
    EraseFlash = 0xD0,
    /// Erase a region (stub only).
    EraseRegion = 0xD1,
    /// Streamed flash read (stub only).
    ReadFlash = 0xD2,
    /// Leave the loader and run the application (stub only).
    RunUserCode = 0xD3,
    /// Encrypted flash data block (stub only).
    FlashEncryptData = 0xD4,
}

impl Opcode {
    /// Raw opcode byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FlashBegin => "FLASH_BEGIN",
            Self::FlashData => "FLASH_DATA",
            Self::FlashEnd => "FLASH_END",
            Self::MemBegin => "MEM_BEGIN",
            Self::MemEnd => "MEM_END",
            Self::MemData => "MEM_DATA",
            Self::Sync => "SYNC",
            Self::WriteReg => "WRITE_REG",
            Self::ReadReg => "READ_REG",
            Self::SpiSetParams => "SPI_SET_PARAMS",
            Self::SpiAttach => "SPI_ATTACH",
            Self::ReadFlashSlow => "READ_FLASH_SLOW",
            Self::ChangeBaudrate => "CHANGE_BAUDRATE",
            Self::FlashDeflBegin => "FLASH_DEFL_BEGIN",
            Self::FlashDeflData => "FLASH_DEFL_DATA",
            Self::FlashDeflEnd => "FLASH_DEFL_END",
            Self::SpiFlashMd5 => "SPI_FLASH_MD5",
            Self::GetSecurityInfo => "GET_SECURITY_INFO",
            Self::EraseFlash => "ERASE_FLASH",
            Self::EraseRegion => "ERASE_REGION",
            Self::ReadFlash => "READ_FLASH",
            Self::RunUserCode => "RUN_USER_CODE",
            Self::FlashEncryptData => "FLASH_ENCRYPT_DATA",
        };
        write!(f, "{name} (0x{:02X})", self.as_u8())
    }
}

/// A request ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    data: Vec<u8>,
    checksum: u32,
}

/// Build a little-endian payload out of u32 words.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn words(values: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.write_u32::<LittleEndian>(*v)
            .unwrap();
    }
    buf
}

impl Command {
    /// Command without a checksum.
    pub fn new(opcode: Opcode, data: Vec<u8>) -> Self {
        Self {
            opcode,
            data,
            checksum: 0,
        }
    }

    /// Command whose checksum field is set explicitly.
    pub fn with_checksum(opcode: Opcode, data: Vec<u8>, checksum: u32) -> Self {
        Self {
            opcode,
            data,
            checksum,
        }
    }

    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Header checksum field.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Serialize header and payload (not yet SLIP framed).
    ///
    /// Fails when the payload does not fit the 16-bit length field.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.data.len()).map_err(|_| {
            Error::Protocol(format!(
                "{} payload of {} bytes does not fit a packet",
                self.opcode,
                self.data.len()
            ))
        })?;
        let mut buf = Vec::with_capacity(8 + self.data.len());
        buf.push(0x00);
        buf.push(self.opcode.as_u8());
        buf.write_u16::<LittleEndian>(len)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.checksum)
            .unwrap();
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// SYNC with the fixed autobaud pattern.
    pub fn sync() -> Self {
        let mut data = vec![0x07, 0x07, 0x12, 0x20];
        data.extend_from_slice(&[0x55; 32]);
        Self::new(Opcode::Sync, data)
    }

    /// READ_REG.
    pub fn read_reg(address: u32) -> Self {
        Self::new(Opcode::ReadReg, words(&[address]))
    }

    /// WRITE_REG with a bit mask and a delay applied before the write.
    pub fn write_reg(address: u32, value: u32, mask: u32, delay_us: u32) -> Self {
        Self::new(Opcode::WriteReg, words(&[address, value, mask, delay_us]))
    }

    /// MEM_BEGIN.
    pub fn mem_begin(size: u32, blocks: u32, block_size: u32, offset: u32) -> Self {
        Self::new(Opcode::MemBegin, words(&[size, blocks, block_size, offset]))
    }

    /// MEM_DATA for one block.
    pub fn mem_data(block: &[u8], sequence: u32) -> Self {
        Self::data_block(Opcode::MemData, block, sequence)
    }

    /// MEM_END, jumping to `entry` when it is non-zero.
    pub fn mem_end(entry: u32) -> Self {
        Self::new(Opcode::MemEnd, words(&[u32::from(entry == 0), entry]))
    }

    /// FLASH_BEGIN. `encrypted` adds the trailing flag word some ROMs expect.
    pub fn flash_begin(
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: Option<bool>,
    ) -> Self {
        let mut data = words(&[erase_size, blocks, block_size, offset]);
        if let Some(flag) = encrypted {
            data.extend(words(&[u32::from(flag)]));
        }
        Self::new(Opcode::FlashBegin, data)
    }

    /// FLASH_DATA for one block.
    pub fn flash_data(block: &[u8], sequence: u32) -> Self {
        Self::data_block(Opcode::FlashData, block, sequence)
    }

    /// FLASH_ENCRYPT_DATA for one block.
    pub fn flash_encrypt_data(block: &[u8], sequence: u32) -> Self {
        Self::data_block(Opcode::FlashEncryptData, block, sequence)
    }

    /// FLASH_END. The device stays in the loader unless `reboot` is set.
    pub fn flash_end(reboot: bool) -> Self {
        Self::new(Opcode::FlashEnd, words(&[u32::from(!reboot)]))
    }

    /// FLASH_DEFL_BEGIN. `extra_word` adds the trailing zero newer ROMs expect.
    pub fn flash_defl_begin(
        write_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        extra_word: bool,
    ) -> Self {
        let mut data = words(&[write_size, blocks, block_size, offset]);
        if extra_word {
            data.extend(words(&[0]));
        }
        Self::new(Opcode::FlashDeflBegin, data)
    }

    /// FLASH_DEFL_DATA for one compressed block.
    pub fn flash_defl_data(block: &[u8], sequence: u32) -> Self {
        Self::data_block(Opcode::FlashDeflData, block, sequence)
    }

    /// FLASH_DEFL_END.
    pub fn flash_defl_end(reboot: bool) -> Self {
        Self::new(Opcode::FlashDeflEnd, words(&[u32::from(!reboot)]))
    }

    /// SPI_FLASH_MD5 over `size` bytes at `address`.
    pub fn spi_flash_md5(address: u32, size: u32) -> Self {
        Self::new(Opcode::SpiFlashMd5, words(&[address, size, 0, 0]))
    }

    /// CHANGE_BAUDRATE. ROM loaders expect zero for the current rate.
    pub fn change_baudrate(new_baud: u32, current_baud: u32) -> Self {
        Self::new(Opcode::ChangeBaudrate, words(&[new_baud, current_baud]))
    }

    /// SPI_ATTACH. ROM loaders expect four extra zero bytes.
    pub fn spi_attach(hspi_arg: u32, rom_padding: bool) -> Self {
        let mut data = words(&[hspi_arg]);
        if rom_padding {
            data.extend_from_slice(&[0; 4]);
        }
        Self::new(Opcode::SpiAttach, data)
    }

    /// SPI_SET_PARAMS for a flash of `total_size` bytes.
    pub fn spi_set_params(total_size: u32) -> Self {
        // id, total size, block, sector, page, status mask
        Self::new(
            Opcode::SpiSetParams,
            words(&[0, total_size, 64 * 1024, 4 * 1024, 256, 0xFFFF]),
        )
    }

    /// GET_SECURITY_INFO.
    pub fn get_security_info() -> Self {
        Self::new(Opcode::GetSecurityInfo, Vec::new())
    }

    /// ERASE_FLASH.
    pub fn erase_flash() -> Self {
        Self::new(Opcode::EraseFlash, Vec::new())
    }

    /// ERASE_REGION.
    pub fn erase_region(offset: u32, size: u32) -> Self {
        Self::new(Opcode::EraseRegion, words(&[offset, size]))
    }

    /// READ_FLASH (stub streaming read).
    pub fn read_flash(offset: u32, length: u32, sector_size: u32, in_flight: u32) -> Self {
        Self::new(
            Opcode::ReadFlash,
            words(&[offset, length, sector_size, in_flight]),
        )
    }

    /// READ_FLASH_SLOW (ROM, at most 64 bytes).
    pub fn read_flash_slow(offset: u32, length: u32) -> Self {
        Self::new(Opcode::ReadFlashSlow, words(&[offset, length]))
    }

    /// RUN_USER_CODE.
    pub fn run_user_code() -> Self {
        Self::new(Opcode::RunUserCode, Vec::new())
    }

    fn data_block(opcode: Opcode, block: &[u8], sequence: u32) -> Self {
        let mut data = words(&[block.len() as u32, sequence, 0, 0]);
        data.extend_from_slice(block);
        Self::with_checksum(opcode, data, checksum(block))
    }
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Direction byte (1 for responses).
    pub direction: u8,
    /// Echoed opcode.
    pub opcode: u8,
    /// Declared body length.
    pub length: u16,
    /// Value field (register contents for READ_REG).
    pub value: u32,
    /// Body including trailing status bytes.
    pub body: Vec<u8>,
}

impl Response {
    /// Parse a frame. Returns `None` for frames shorter than the header.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 {
            return None;
        }
        let mut cursor = Cursor::new(frame);
        let direction = cursor
            .read_u8()
            .ok()?;
        let opcode = cursor
            .read_u8()
            .ok()?;
        let length = cursor
            .read_u16::<LittleEndian>()
            .ok()?;
        let value = cursor
            .read_u32::<LittleEndian>()
            .ok()?;
        Some(Self {
            direction,
            opcode,
            length,
            value,
            body: frame[8..].to_vec(),
        })
    }

    /// Whether the first body byte reports a failure.
    pub fn is_failure(&self) -> bool {
        self.body
            .first()
            .is_some_and(|&b| b != 0)
    }

    /// The ROM's "unknown opcode" reply.
    pub fn is_invalid_command(&self) -> bool {
        self.is_failure() && self.body.get(1) == Some(&ROM_INVALID_RECV_MSG)
    }

    /// The trailing status bytes, if the body is long enough.
    pub fn status_bytes(&self, status_len: usize) -> Option<&[u8]> {
        self.body
            .len()
            .checked_sub(status_len)
            .map(|start| &self.body[start..])
    }
}

/// Result of a checked command: either returned data or the header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// The response carried nothing but status; this is its value field.
    Value(u32),
    /// Response data with the status bytes stripped.
    Data(Vec<u8>),
}

impl CommandOutput {
    /// The value field, if this output carries one.
    pub fn value(&self) -> Option<u32> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Data(_) => None,
        }
    }

    /// Returned data, empty for value-only responses.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Self::Value(_) => Vec::new(),
            Self::Data(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_folds_back_to_seed() {
        let data = b"\x01\x02\xfe\x55 romflash";
        let once = checksum_from(CHECKSUM_SEED, data);
        assert_eq!(checksum_from(once, data), CHECKSUM_SEED);
        assert_eq!(checksum(&[]), u32::from(CHECKSUM_SEED));
        assert_eq!(checksum(&[0xEF]), 0);
    }

    #[test]
    fn test_oversized_payload_refused() {
        let largest = Command::new(Opcode::MemData, vec![0; usize::from(u16::MAX)]);
        let bytes = largest.to_bytes().unwrap();
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);

        let oversized = Command::new(Opcode::MemData, vec![0; usize::from(u16::MAX) + 1]);
        assert!(matches!(oversized.to_bytes(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_sync_packet_layout() {
        let bytes = Command::sync().to_bytes().unwrap();
        assert_eq!(bytes.len(), 8 + 36);
        assert_eq!(&bytes[..8], &[0x00, 0x08, 36, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(bytes[12..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_data_block_header_and_checksum() {
        let block = [0xAAu8; 16];
        let cmd = Command::flash_data(&block, 7);
        assert_eq!(cmd.opcode(), Opcode::FlashData);
        assert_eq!(cmd.checksum(), checksum(&block));
        assert_eq!(&cmd.data()[..8], &[16, 0, 0, 0, 7, 0, 0, 0]);
        assert_eq!(cmd.data().len(), 16 + 16);
    }

    #[test]
    fn test_flash_begin_optional_flag() {
        assert_eq!(
            Command::flash_begin(0x1000, 4, 0x400, 0x1000, None)
                .data()
                .len(),
            16
        );
        let with_flag = Command::flash_begin(0x1000, 4, 0x400, 0x1000, Some(true));
        assert_eq!(&with_flag.data()[16..], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_mem_end_flag() {
        assert_eq!(Command::mem_end(0).data(), &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Command::mem_end(0x4010_0000).data(),
            &[0, 0, 0, 0, 0x00, 0x00, 0x10, 0x40]
        );
    }

    #[test]
    fn test_response_parse() {
        let frame = [0x01, 0x0A, 0x02, 0x00, 0x83, 0x1D, 0xF0, 0x00, 0x00, 0x00];
        let resp = Response::parse(&frame).unwrap();
        assert_eq!(resp.opcode, 0x0A);
        assert_eq!(resp.value, 0x00F0_1D83);
        assert_eq!(resp.status_bytes(2), Some(&[0u8, 0][..]));
        assert!(!resp.is_failure());
        assert!(Response::parse(&frame[..7]).is_none());
    }

    #[test]
    fn test_invalid_command_response() {
        let frame = [0x01, 0x13, 0x02, 0x00, 0, 0, 0, 0, 0x01, 0x05];
        let resp = Response::parse(&frame).unwrap();
        assert!(resp.is_invalid_command());
    }

    #[test]
    fn test_timeout_per_mb() {
        assert_eq!(timeout_per_mb(8.0, 1000), DEFAULT_TIMEOUT);
        assert_eq!(
            timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, 1_000_000),
            Duration::from_secs(40)
        );
    }
}
