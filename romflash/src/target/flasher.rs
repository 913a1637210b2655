//! Flash writer and the caller-facing flashing surface.
//!
//! The low-level flash commands live on [`Connection`]. [`EspFlasher`] wraps
//! a connection with the session policy the CLI wants: stub bootstrap with a
//! ROM fallback, flash attach on first use, the write pipeline with
//! compression and MD5 verification, and the after-operation reset.
//!
//! ## Example
//!
//! ```rust,no_run
//! use romflash::target::{FlashFile, FlasherOptions, WriteOptions, create_flasher};
//! use romflash::{AfterMode, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
//!     let mut flasher = create_flasher(&config, FlasherOptions::default())?;
//!     flasher.connect()?;
//!
//!     let files = vec![FlashFile::from_path(0x10000, "app.bin")?];
//!     flasher.write_flash(&files, &WriteOptions::default(), &mut |name, current, total| {
//!         println!("{name}: {current}/{total}");
//!     })?;
//!
//!     flasher.reset(AfterMode::HardReset)?;
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::esp::FirmwareImage;
use crate::image::params::{FlashParams, FlashSize, flash_size_bytes, update_image_flash_params};
use crate::port::Port;
use crate::protocol::command::{
    CHIP_ERASE_TIMEOUT, Command, DEFAULT_TIMEOUT, ERASE_REGION_TIMEOUT_PER_MB,
    ERASE_WRITE_TIMEOUT_PER_MB, MD5_TIMEOUT_PER_MB, timeout_per_mb,
};
use crate::protocol::slip::hex;
use crate::target::chip::{CHIP_DETECT_MAGIC_REG, Capability, Chip, FLASH_SECTOR_SIZE, LoaderMode};
use crate::target::connection::{
    AfterMode, ConnectOptions, Connection, ConnectionState, SecurityInfo,
};
use crate::target::stub::StubImage;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

/// Attempts per flash block before the file is abandoned.
const WRITE_BLOCK_ATTEMPTS: usize = 3;

/// Sector size the stub streams flash reads in.
const READ_FLASH_SECTOR: u32 = 0x1000;

/// Unacknowledged packets the stub may have in flight during a read.
const READ_FLASH_IN_FLIGHT: u32 = 64;

/// Largest read the ROM serves per READ_FLASH_SLOW.
const READ_FLASH_SLOW_BLOCK: u32 = 64;

fn md5_hex(data: &[u8]) -> String {
    hex(&Md5::digest(data))
}

fn pad_to(data: &mut Vec<u8>, alignment: usize, pad: u8) {
    let len = data.len().div_ceil(alignment) * alignment;
    data.resize(len, pad);
}

/// First address past `len` bytes of `file` in flash.
fn file_end(file: &FlashFile, len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .and_then(|len| file.address.checked_add(len))
        .ok_or_else(|| {
            Error::Config(format!(
                "File {} at 0x{:08x} extends past 4GB",
                file.name, file.address
            ))
        })
}

fn interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Protocol("Interrupted".into()));
    }
    Ok(())
}

impl<P: Port> Connection<P> {
    /// FLASH_BEGIN for `size` bytes at `offset`. Returns the block count.
    ///
    /// The ROM erases synchronously here, so its timeout scales with size.
    pub fn flash_begin(&mut self, size: u32, offset: u32, encrypted: bool) -> Result<u32> {
        let profile = self.profile()?;
        let mode = self.mode();
        let block_size = profile.flash_write_size(mode);
        let blocks = size.div_ceil(block_size);
        let erase_size = profile.erase_size(mode, offset, size);
        let timeout = match mode {
            LoaderMode::Stub => DEFAULT_TIMEOUT,
            LoaderMode::Rom => timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size),
        };
        let encrypted_flag = profile
            .supports(Capability::EncryptedBeginFlag, mode)
            .then_some(encrypted);

        let started = Instant::now();
        self.channel.check_command(
            "enter Flash download mode",
            &Command::flash_begin(erase_size, blocks, block_size, offset, encrypted_flag),
            timeout,
        )?;
        if size != 0 && mode == LoaderMode::Rom {
            info!(
                "Took {:.2}s to erase flash block",
                started.elapsed().as_secs_f64()
            );
        }
        Ok(blocks)
    }

    /// Write one FLASH_DATA block.
    pub fn flash_block(&mut self, data: &[u8], sequence: u32, timeout: Duration) -> Result<()> {
        self.channel.check_command(
            &format!("write to target Flash after seq {sequence}"),
            &Command::flash_data(data, sequence),
            timeout,
        )?;
        Ok(())
    }

    /// Write one block that the loader encrypts on the way to flash.
    ///
    /// ROMs that take the encrypted flag in FLASH_BEGIN encrypt plain
    /// FLASH_DATA blocks.
    pub fn flash_encrypt_block(
        &mut self,
        data: &[u8],
        sequence: u32,
        timeout: Duration,
    ) -> Result<()> {
        if self.supports(Capability::EncryptedBeginFlag) {
            return self.flash_block(data, sequence, timeout);
        }
        self.require(Capability::EncryptedWrite)?;
        self.channel.check_command(
            &format!("Write encrypted to target Flash after seq {sequence}"),
            &Command::flash_encrypt_data(data, sequence),
            timeout,
        )?;
        Ok(())
    }

    /// FLASH_END.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        self.channel.check_command(
            "leave Flash mode",
            &Command::flash_end(reboot),
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// FLASH_DEFL_BEGIN for `size` uncompressed bytes sent as `compressed_size`.
    /// Returns the block count.
    pub fn flash_defl_begin(&mut self, size: u32, compressed_size: u32, offset: u32) -> Result<u32> {
        self.require(Capability::CompressedWrite)?;
        let profile = self.profile()?;
        let mode = self.mode();
        let block_size = profile.flash_write_size(mode);
        let blocks = compressed_size.div_ceil(block_size);
        let erase_blocks = size.div_ceil(block_size);

        let (write_size, timeout) = match mode {
            // The stub erases as it writes.
            LoaderMode::Stub => (size, DEFAULT_TIMEOUT),
            LoaderMode::Rom => {
                let write_size = erase_blocks * block_size;
                (
                    write_size,
                    timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, write_size),
                )
            },
        };
        let extra_word = profile.supports(Capability::EncryptedBeginFlag, mode);

        let started = Instant::now();
        info!("Compressed {size} bytes to {compressed_size}...");
        self.channel.check_command(
            "enter compressed flash mode",
            &Command::flash_defl_begin(write_size, blocks, block_size, offset, extra_word),
            timeout,
        )?;
        if size != 0 && mode == LoaderMode::Rom {
            info!(
                "Took {:.2}s to erase flash block",
                started.elapsed().as_secs_f64()
            );
        }
        Ok(blocks)
    }

    /// Write one FLASH_DEFL_DATA block.
    pub fn flash_defl_block(
        &mut self,
        data: &[u8],
        sequence: u32,
        timeout: Duration,
    ) -> Result<()> {
        self.channel.check_command(
            &format!("write compressed data to flash after seq {sequence}"),
            &Command::flash_defl_data(data, sequence),
            timeout,
        )?;
        Ok(())
    }

    /// FLASH_DEFL_END. Skipped on the ROM without reboot, which would exit
    /// the loader.
    pub fn flash_defl_finish(&mut self, reboot: bool) -> Result<()> {
        if !reboot && self.mode() == LoaderMode::Rom {
            return Ok(());
        }
        self.channel.check_command(
            "leave compressed flash mode",
            &Command::flash_defl_end(reboot),
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// MD5 of `size` flash bytes at `address`, as lowercase hex.
    pub fn flash_md5sum(&mut self, address: u32, size: u32) -> Result<String> {
        self.require(Capability::Md5)?;
        let reply = self
            .channel
            .check_command(
                "calculate md5sum",
                &Command::spi_flash_md5(address, size),
                timeout_per_mb(MD5_TIMEOUT_PER_MB, size),
            )?
            .into_data();
        match reply.len() {
            // ROM: ASCII hex
            32 => String::from_utf8(reply)
                .map(|s| s.to_ascii_lowercase())
                .map_err(|e| Error::Protocol(format!("MD5Sum reply is not ASCII: {e}"))),
            // Stub: raw digest
            16 => Ok(hex(&reply)),
            _ => Err(Error::Protocol(format!(
                "MD5Sum command returned unexpected result: {}",
                hex(&reply)
            ))),
        }
    }

    /// Erase the whole flash chip.
    pub fn erase_flash(&mut self) -> Result<()> {
        self.require(Capability::EraseFlash)?;
        self.channel
            .check_command("erase flash", &Command::erase_flash(), CHIP_ERASE_TIMEOUT)?;
        Ok(())
    }

    /// Erase `size` bytes at `offset`. Both must be sector aligned.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        if offset % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::Config(
                "Offset to erase from must be a multiple of 4096".into(),
            ));
        }
        if size % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::Config(
                "Size of data to erase must be a multiple of 4096".into(),
            ));
        }
        self.require(Capability::EraseRegion)?;
        self.channel.check_command(
            "erase region",
            &Command::erase_region(offset, size),
            timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size),
        )?;
        Ok(())
    }

    /// Read `length` flash bytes at `offset`.
    pub fn read_flash(
        &mut self,
        offset: u32,
        length: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        match self.mode() {
            LoaderMode::Stub => self.read_flash_stub(offset, length, progress),
            LoaderMode::Rom => self.read_flash_slow(offset, length, progress),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_flash_stub(
        &mut self,
        offset: u32,
        length: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        self.require(Capability::ReadFlash)?;
        self.channel.check_command(
            "read flash",
            &Command::read_flash(offset, length, READ_FLASH_SECTOR, READ_FLASH_IN_FLIGHT),
            DEFAULT_TIMEOUT,
        )?;

        let total = length as usize;
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            interrupted()?;
            let packet = self
                .channel
                .with_timeout(DEFAULT_TIMEOUT, |ch| ch.read_frame())?;
            data.extend_from_slice(&packet);
            if data.len() < total && packet.len() < READ_FLASH_SECTOR as usize {
                return Err(Error::Protocol(format!(
                    "Corrupt data, expected 0x{READ_FLASH_SECTOR:x} bytes but received 0x{:x} bytes",
                    packet.len()
                )));
            }
            let mut ack = Vec::with_capacity(4);
            ack.write_u32::<LittleEndian>(data.len() as u32)?;
            self.channel.write_frame(&ack)?;
            progress(data.len().min(total), total);
        }
        if data.len() > total {
            return Err(Error::Protocol("Read more than expected".into()));
        }

        let digest = self
            .channel
            .with_timeout(DEFAULT_TIMEOUT, |ch| ch.read_frame())?;
        if digest.len() != 16 {
            return Err(Error::Protocol(format!(
                "Expected digest, got: {}",
                hex(&digest)
            )));
        }
        let expected = md5_hex(&data);
        if hex(&digest) != expected {
            return Err(Error::Protocol(format!(
                "Digest mismatch: expected {expected}, got {}",
                hex(&digest)
            )));
        }
        Ok(data)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_flash_slow(
        &mut self,
        offset: u32,
        length: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        self.require(Capability::ReadFlashSlow)?;
        let total = length as usize;
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            interrupted()?;
            let block_len = READ_FLASH_SLOW_BLOCK.min(length - data.len() as u32);
            let address = offset + data.len() as u32;
            let block = self
                .channel
                .check_command(
                    "read flash block",
                    &Command::read_flash_slow(address, block_len),
                    DEFAULT_TIMEOUT,
                )
                .map_err(|e| {
                    Error::Protocol(format!(
                        "Failed to read from flash at 0x{address:08x}. Try with a lower baud rate: {e}"
                    ))
                })?
                .into_data();
            if block.len() < block_len as usize {
                return Err(Error::Protocol(format!(
                    "Expected {block_len} byte block, got {} bytes. Serial errors?",
                    block.len()
                )));
            }
            // The ROM always answers with a full 64-byte buffer.
            data.extend_from_slice(&block[..block_len as usize]);
            progress(data.len(), total);
        }
        Ok(data)
    }

    /// Leave the loader for the application, or with `stay_in_bootloader`,
    /// drop from the stub back to the ROM loader.
    pub fn soft_reset(&mut self, stay_in_bootloader: bool) -> Result<()> {
        let profile = self.profile()?;
        match (self.mode(), stay_in_bootloader) {
            (LoaderMode::Rom, true) => Ok(()),
            (LoaderMode::Rom, false) => {
                self.flash_begin(0, 0, false)?;
                self.flash_finish(false)
            },
            (LoaderMode::Stub, true) => {
                self.flash_begin(0, 0, false)?;
                self.flash_finish(true)?;
                self.state = ConnectionState::Synced;
                self.channel
                    .set_status_len(profile.status_len(LoaderMode::Rom));
                Ok(())
            },
            (LoaderMode::Stub, false) if profile.chip == Chip::Esp8266 => {
                self.require(Capability::RunUserCode)?;
                self.channel
                    .send_command(&Command::run_user_code(), false, DEFAULT_TIMEOUT)?;
                Ok(())
            },
            (LoaderMode::Stub, false) => Err(Error::Unsupported(
                "Soft resetting is currently only supported on ESP8266".into(),
            )),
        }
    }
}

/// One file to put in flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFile {
    /// Flash offset.
    pub address: u32,
    /// File contents.
    pub data: Vec<u8>,
    /// Name used in messages and progress.
    pub name: String,
    /// Write through the flash encryption engine.
    pub encrypted: bool,
}

impl FlashFile {
    /// A file held in memory.
    pub fn new(address: u32, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            name: name.into(),
            encrypted: false,
        }
    }

    /// Read a file from disk.
    pub fn from_path<Q: AsRef<Path>>(address: u32, path: Q) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Ok(Self::new(address, path.display().to_string(), data))
    }

    /// Mark the file for encrypted writing.
    #[must_use]
    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }
}

/// Options for [`EspFlasher::write_flash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Erase the whole chip first.
    pub erase_all: bool,
    /// Deflate the data before sending it.
    pub compress: bool,
    /// Encrypt every file.
    pub encrypt: bool,
    /// Verify all files again once everything is written.
    pub verify: bool,
    /// Header parameters for a bootloader image.
    pub flash_params: FlashParams,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            erase_all: false,
            compress: true,
            encrypt: false,
            verify: false,
            flash_params: FlashParams::default(),
        }
    }
}

/// Session setup for [`EspFlasher`].
#[derive(Debug, Clone, Default)]
pub struct FlasherOptions {
    /// How to connect.
    pub connect: ConnectOptions,
    /// Stub loader to run, if one is available.
    pub stub: Option<StubImage>,
    /// Stay with the ROM loader.
    pub no_stub: bool,
    /// Baud rate to switch to once connected.
    pub baud: Option<u32>,
}

/// Flasher for ESP8266 and ESP32-family chips over their serial bootloader.
pub struct EspFlasher<P: Port> {
    conn: Connection<P>,
    options: FlasherOptions,
    flash_ready: bool,
}

impl<P: Port> EspFlasher<P> {
    /// Create a flasher on an opened port. Nothing is sent until
    /// [`Self::connect`].
    pub fn new(port: P, options: FlasherOptions) -> Self {
        Self {
            conn: Connection::new(port),
            options,
            flash_ready: false,
        }
    }

    /// The underlying session.
    pub fn connection(&mut self) -> &mut Connection<P> {
        &mut self.conn
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.conn.into_port()
    }

    /// The connected chip, if known.
    pub fn chip(&self) -> Option<Chip> {
        self.conn.chip()
    }

    /// Connect, start the stub if possible, and switch baud rate.
    pub fn connect(&mut self) -> Result<()> {
        let profile = self.conn.connect(&self.options.connect)?;
        info!("Chip is {}", profile.name);
        self.flash_ready = false;

        if self.want_stub() {
            let stub = self.options.stub.clone();
            if let Err(e) = self.conn.run_stub(stub.as_ref()) {
                if !matches!(e, Error::BootstrapFailed(_)) {
                    return Err(e);
                }
                warn!("{e}. Falling back to the ROM loader.");
                self.conn.connect(&self.options.connect)?;
            }
        }

        if let Some(baud) = self.options.baud {
            if baud != self.conn.port().baud_rate() {
                match self.conn.change_baud(baud) {
                    Err(Error::Unsupported(reason)) => {
                        warn!("{reason}, keeping the current baud rate");
                    },
                    other => other?,
                }
            }
        }
        Ok(())
    }

    fn want_stub(&self) -> bool {
        if self.options.no_stub {
            return false;
        }
        if self.conn.secure_download_mode() {
            warn!("Secure download mode is enabled, the stub loader can't be used");
            return false;
        }
        if self.conn.stub_is_disabled() {
            warn!("Stub flasher is not supported on this chip revision, staying in ROM mode");
            return false;
        }
        if self.options.stub.is_none() && !self.conn.sync_stub_detected() {
            warn!("No stub loader available, staying in ROM mode");
            return false;
        }
        true
    }

    /// Attach the flash on first use and apply the flash size.
    ///
    /// Returns `params` with `detect` resolved.
    pub fn prepare_flash(&mut self, params: &FlashParams) -> Result<FlashParams> {
        if !self.flash_ready {
            info!("Configuring flash size...");
            self.conn.attach_flash()?;
            self.flash_ready = true;
        }

        let mut params = params.clone();
        if params.size == FlashSize::Detect {
            params.size = match self.conn.detect_flash_size()? {
                Some(name) => FlashSize::Named(name.to_string()),
                None => FlashSize::Keep,
            };
        }
        if let FlashSize::Named(name) = &params.size {
            if let Some(bytes) = flash_size_bytes(name) {
                self.conn.flash_set_parameters(bytes)?;
            }
        }
        Ok(params)
    }

    /// Pad and patch one file the way it will land in flash.
    fn prepare_image(&self, file: &FlashFile, encrypted: bool, params: &FlashParams) -> Result<Vec<u8>> {
        let profile = self.conn.profile()?;
        let alignment = if encrypted {
            profile.encrypted_write_align
        } else {
            4
        };
        let mut image = file.data.clone();
        pad_to(&mut image, alignment as usize, 0xFF);
        file_end(file, image.len())?;
        update_image_flash_params(profile, file.address, params, &mut image)?;
        Ok(image)
    }

    /// Write `files` to flash, checking each by MD5 afterwards.
    ///
    /// A failing file aborts the batch.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_flash(
        &mut self,
        files: &[FlashFile],
        options: &WriteOptions,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let params = self.prepare_flash(&options.flash_params)?;

        if options.erase_all {
            self.erase_flash()?;
        }

        let mut compress = options.compress;
        if compress && !self.conn.supports(Capability::CompressedWrite) {
            warn!("Compressed writes are not available with this loader, writing uncompressed");
            compress = false;
        }

        for file in files {
            let encrypted = options.encrypt || file.encrypted;
            self.write_file(file, encrypted, compress && !encrypted, &params, progress)?;
        }

        if self.conn.mode() == LoaderMode::Stub {
            // Leave flash mode without leaving the stub.
            self.conn.flash_begin(0, 0, false)?;
            if compress {
                self.conn.flash_defl_finish(false)?;
            } else {
                self.conn.flash_finish(false)?;
            }
        }

        if options.verify {
            info!("Verifying just-written flash...");
            let plain: Vec<FlashFile> = files
                .iter()
                .filter(|f| !(options.encrypt || f.encrypted))
                .cloned()
                .collect();
            self.verify_flash(&plain, &params, false)?;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn write_file(
        &mut self,
        file: &FlashFile,
        encrypted: bool,
        compress: bool,
        params: &FlashParams,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        if file.data.is_empty() {
            warn!("File {} is empty", file.name);
            return Ok(());
        }
        let profile = self.conn.profile()?;
        if encrypted {
            if !self.conn.supports(Capability::EncryptedWrite)
                && !self.conn.supports(Capability::EncryptedBeginFlag)
            {
                return Err(Error::Unsupported(format!(
                    "Encrypted writes are not available with the {} loader",
                    profile.name
                )));
            }
            if file.address % profile.encrypted_write_align != 0 {
                return Err(Error::Config(format!(
                    "File {} address 0x{:x} is not {} byte aligned, can't flash encrypted",
                    file.name, file.address, profile.encrypted_write_align
                )));
            }
        }

        let image = self.prepare_image(file, encrypted, params)?;
        let calc_md5 = md5_hex(&image);
        let uncompressed_size = image.len() as u32;

        let start = file.address / FLASH_SECTOR_SIZE * FLASH_SECTOR_SIZE;
        let last = file_end(file, image.len())? - 1;
        let end = last / FLASH_SECTOR_SIZE * FLASH_SECTOR_SIZE + (FLASH_SECTOR_SIZE - 1);
        if file.address % FLASH_SECTOR_SIZE != 0 {
            warn!(
                "Address 0x{:08x} is not sector aligned, the rest of the sector before it will be erased too",
                file.address
            );
        }
        info!("Flash will be erased from 0x{start:08x} to 0x{end:08x}...");

        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&image)?;
            encoder.finish()?
        } else {
            image
        };

        let block_size = profile.flash_write_size(self.conn.mode()) as usize;
        let blocks = if compress {
            self.conn.flash_defl_begin(
                uncompressed_size,
                payload.len() as u32,
                file.address,
            )?
        } else {
            self.conn.flash_begin(uncompressed_size, file.address, encrypted)?
        };
        debug!("Writing {} in {blocks} blocks", file.name);

        let stub = self.conn.mode() == LoaderMode::Stub;
        let mut decoder = ZlibDecoder::new(Vec::new());
        let mut timeout = DEFAULT_TIMEOUT;
        let started = Instant::now();
        let total = payload.len();
        for (seq, chunk) in payload.chunks(block_size).enumerate() {
            interrupted()?;
            let seq = seq as u32;
            let sent = (seq as usize * block_size + chunk.len()).min(total);

            let mut block = chunk.to_vec();
            let block_timeout = if compress {
                decoder.write_all(&block)?;
                decoder.flush()?;
                let inflated = decoder.get_ref().len() as u32;
                decoder.get_mut().clear();
                timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, inflated)
            } else {
                block.resize(block_size, 0xFF);
                timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, block_size as u32)
            };
            // The ROM writes the block before answering; the stub answers
            // first and writes while the next block arrives.
            if !stub {
                timeout = block_timeout;
            }

            let mut attempt = 1;
            loop {
                let result = if compress {
                    self.conn.flash_defl_block(&block, seq, timeout)
                } else if encrypted {
                    self.conn.flash_encrypt_block(&block, seq, timeout)
                } else {
                    self.conn.flash_block(&block, seq, timeout)
                };
                match result {
                    Ok(()) => break,
                    Err(e) if attempt < WRITE_BLOCK_ATTEMPTS => {
                        warn!(
                            "Failed to write block {seq} of {} (attempt {attempt}/{WRITE_BLOCK_ATTEMPTS}): {e}",
                            file.name
                        );
                        attempt += 1;
                    },
                    Err(e) => return Err(e),
                }
            }
            if stub {
                timeout = block_timeout;
            }
            progress(&file.name, sent, total);
        }

        if stub {
            // Returns once the stub has flushed its last write.
            self.conn
                .channel
                .read_reg(CHIP_DETECT_MAGIC_REG, timeout)?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        if compress {
            let rate = if elapsed > 0.0 {
                format!(
                    " ({:.1} kbit/s)",
                    f64::from(uncompressed_size) / elapsed * 8.0 / 1000.0
                )
            } else {
                String::new()
            };
            info!(
                "Wrote {uncompressed_size} bytes ({} compressed) at 0x{:08x} in {elapsed:.1} seconds{rate}...",
                payload.len(),
                file.address
            );
        } else {
            info!(
                "Wrote {uncompressed_size} bytes at 0x{:08x} in {elapsed:.1} seconds...",
                file.address
            );
        }

        if encrypted || self.conn.secure_download_mode() {
            return Ok(());
        }
        if !self.conn.supports(Capability::Md5) {
            debug!("MD5 is not available with this loader, skipping verification");
            return Ok(());
        }
        match self.conn.flash_md5sum(file.address, uncompressed_size) {
            Ok(flash_md5) if flash_md5 == calc_md5 => {
                info!("Hash of data verified.");
                Ok(())
            },
            Ok(flash_md5) => {
                info!("File  md5: {calc_md5}");
                info!("Flash md5: {flash_md5}");
                Err(Error::VerificationFailed(
                    "MD5 of file does not match data in flash!".into(),
                ))
            },
            Err(e @ Error::UnsupportedCommand { .. }) => {
                warn!("Skipping MD5 verification: {e}");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Compare `files` against flash by MD5.
    ///
    /// With `diff`, mismatching files are read back and the differing bytes
    /// are logged.
    #[allow(clippy::cast_possible_truncation)]
    pub fn verify_flash(&mut self, files: &[FlashFile], params: &FlashParams, diff: bool) -> Result<()> {
        let params = self.prepare_flash(params)?;
        let mut differences = false;

        for file in files {
            let image = self.prepare_image(file, false, &params)?;
            let size = image.len() as u32;
            info!(
                "Verifying 0x{size:x} ({size}) bytes @ 0x{:08x} in flash against {}...",
                file.address, file.name
            );
            let digest = self.conn.flash_md5sum(file.address, size)?;
            if digest == md5_hex(&image) {
                info!("-- verify OK (digest matched)");
                continue;
            }
            differences = true;
            if !diff {
                info!("-- verify FAILED (digest mismatch)");
                continue;
            }

            let flash = self.conn.read_flash(file.address, size, &mut |_, _| {})?;
            let offsets: Vec<usize> = flash
                .iter()
                .zip(&image)
                .enumerate()
                .filter(|(_, (a, b))| a != b)
                .map(|(i, _)| i)
                .collect();
            if let Some(first) = offsets.first() {
                info!(
                    "-- verify FAILED: {} differences, first @ 0x{:08x}",
                    offsets.len(),
                    file.address + *first as u32
                );
            }
            for i in offsets {
                info!(
                    "   {:08x} {:02x} {:02x}",
                    file.address + i as u32,
                    flash[i],
                    image[i]
                );
            }
        }

        if differences {
            return Err(Error::VerificationFailed("Verify failed.".into()));
        }
        Ok(())
    }

    /// Read `size` bytes of flash at `offset`.
    pub fn read_flash(
        &mut self,
        offset: u32,
        size: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        self.prepare_flash(&FlashParams::default())?;
        let started = Instant::now();
        let data = self.conn.read_flash(offset, size, progress)?;
        info!(
            "Read {} bytes at 0x{offset:08x} in {:.1} seconds...",
            data.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(data)
    }

    /// Erase the whole flash.
    pub fn erase_flash(&mut self) -> Result<()> {
        self.prepare_flash(&FlashParams::default())?;
        info!("Erasing flash (this may take a while)...");
        let started = Instant::now();
        self.conn.erase_flash()?;
        info!(
            "Chip erase completed successfully in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Erase a sector-aligned region.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        self.prepare_flash(&FlashParams::default())?;
        info!("Erasing region (may be slow depending on size)...");
        let started = Instant::now();
        self.conn.erase_region(offset, size)?;
        info!(
            "Erase completed successfully in {:.1} seconds.",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// JEDEC ID of the attached flash.
    pub fn flash_id(&mut self) -> Result<u32> {
        self.prepare_flash(&FlashParams::default())?;
        let id = self.conn.flash_id()?;
        info!("Manufacturer: {:02x}", id & 0xFF);
        info!("Device: {:02x}{:02x}", (id >> 8) & 0xFF, (id >> 16) & 0xFF);
        Ok(id)
    }

    /// Load an image into RAM and jump to its entry point.
    pub fn load_ram(&mut self, image: &FirmwareImage) -> Result<()> {
        info!("RAM boot...");
        for segment in &image.segments {
            info!(
                "Downloading {} bytes at {:08x}...",
                segment.data.len(),
                segment.addr
            );
            self.conn.mem_upload(segment.addr, &segment.data)?;
        }
        info!("All segments done, executing at {:08x}", image.entrypoint);
        self.conn.mem_finish(image.entrypoint)
    }

    /// Leave the chip as `after` asks.
    pub fn reset(&mut self, after: AfterMode) -> Result<()> {
        match after {
            AfterMode::HardReset => self.conn.hard_reset(),
            AfterMode::SoftReset => {
                info!("Soft resetting...");
                self.conn.soft_reset(false)
            },
            AfterMode::NoResetStub => {
                info!("Staying in flasher stub.");
                Ok(())
            },
            AfterMode::NoReset => {
                info!("Staying in bootloader.");
                if self.conn.mode() == LoaderMode::Stub {
                    self.conn.soft_reset(true)?;
                }
                Ok(())
            },
        }
    }
}

#[cfg(test)]
impl EspFlasher<crate::port::mock::MockPort> {
    /// A flasher on a synced session with the flash already attached.
    pub(crate) fn attached(chip: Chip, mode: LoaderMode) -> Self {
        Self {
            conn: Connection::synced(chip, mode),
            options: FlasherOptions::default(),
            flash_ready: true,
        }
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{EspFlasher, FlasherOptions};
    use crate::error::{Error, Result};
    use crate::port::{NativePort, SerialConfig};
    use log::{debug, warn};
    use std::thread;
    use std::time::Duration;

    impl EspFlasher<NativePort> {
        /// Open `config` and wrap it in a flasher.
        pub fn open(config: &SerialConfig, options: FlasherOptions) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;
            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                match NativePort::open(config) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port, options));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}",
                            config.port_name
                        );
                        last_error = Some(e);
                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }
            Err(last_error.unwrap_or(Error::DeviceNotFound))
        }
    }
}

impl<P: Port> crate::target::Flasher for EspFlasher<P> {
    fn connect(&mut self) -> Result<()> {
        self.connect()
    }

    fn chip(&self) -> Option<Chip> {
        self.chip()
    }

    fn write_flash(
        &mut self,
        files: &[FlashFile],
        options: &WriteOptions,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        self.write_flash(files, options, progress)
    }

    fn verify_flash(&mut self, files: &[FlashFile], params: &FlashParams, diff: bool) -> Result<()> {
        self.verify_flash(files, params, diff)
    }

    fn read_flash(
        &mut self,
        offset: u32,
        size: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        self.read_flash(offset, size, progress)
    }

    fn erase_flash(&mut self) -> Result<()> {
        self.erase_flash()
    }

    fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        self.erase_region(offset, size)
    }

    fn flash_id(&mut self) -> Result<u32> {
        self.flash_id()
    }

    fn chip_id(&mut self) -> Result<u32> {
        self.conn.chip_id()
    }

    fn security_info(&mut self) -> Result<SecurityInfo> {
        self.conn.security_info()
    }

    fn load_ram(&mut self, image: &FirmwareImage) -> Result<()> {
        self.load_ram(image)
    }

    fn reset(&mut self, after: AfterMode) -> Result<()> {
        self.reset(after)
    }

    fn connection_baud(&self) -> u32 {
        self.conn.port().baud_rate()
    }

    fn close(&mut self) {
        if let Err(e) = self.conn.channel().port_mut().close() {
            debug!("Closing port failed: {e}");
        }
    }
}
