//! SPI flash commands driven through the chip's SPI user registers.
//!
//! The ROM loader has no generic "talk to the flash chip" command, so these
//! helpers program the SPI controller directly with READ_REG/WRITE_REG.

use crate::error::{Error, Result};
use crate::image::params::detected_flash_size;
use crate::port::Port;
use crate::protocol::command::{Command, DEFAULT_TIMEOUT};
use crate::target::chip::{Chip, FlashHook, LoaderMode};
use crate::target::connection::Connection;
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_ADDR: u32 = 1 << 30;
const SPI_USR_DUMMY: u32 = 1 << 29;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;
const SPI_USR_ADDR_LEN_SHIFT: u32 = 26;
const SPI_USR1_MISO_BITLEN_SHIFT: u32 = 8;
const SPI_USR1_MOSI_BITLEN_SHIFT: u32 = 17;

const SPI_CMD_REG_OFFSET: u32 = 0x00;
const SPI_ADDR_REG_OFFSET: u32 = 0x04;

/// Polls of the command register before giving up.
const SPI_DONE_POLLS: usize = 10;

const MAX_READ_BITS: u32 = 32;
const MAX_WRITE_BYTES: usize = 64;

/// JEDEC read ID.
const CMD_RDID: u8 = 0x9F;
/// Read serial flash discoverable parameters.
const CMD_RDSFDP: u8 = 0x5A;

const XMC_VENDOR_ID: u32 = 0x20;
const SFDP_MFID_ADDR: u32 = 0x10;

/// One SPI flash transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpiFlashCommand {
    /// Flash opcode.
    pub command: u8,
    /// Bytes sent after the opcode (and address).
    pub data: Vec<u8>,
    /// Bits to clock back in, at most 32.
    pub read_bits: u32,
    /// Address phase, if any.
    pub address: Option<u32>,
    /// Address length in bits.
    pub addr_len: u32,
    /// Dummy cycles between address and data.
    pub dummy_len: u32,
}

impl SpiFlashCommand {
    /// A bare opcode.
    pub fn new(command: u8) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Read `bits` back from the flash.
    #[must_use]
    pub fn read(mut self, bits: u32) -> Self {
        self.read_bits = bits;
        self
    }

    /// Send `data` after the opcode.
    #[must_use]
    pub fn write(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Add an address phase of `len` bits.
    #[must_use]
    pub fn address(mut self, address: u32, len: u32) -> Self {
        self.address = Some(address);
        self.addr_len = len;
        self
    }

    /// Add `cycles` dummy cycles.
    #[must_use]
    pub fn dummy(mut self, cycles: u32) -> Self {
        self.dummy_len = cycles;
        self
    }
}

/// Whether a JEDEC ID belongs to a correctly booted XMC part.
pub fn is_xmc_chip_strict(flash_id: u32) -> bool {
    let vendor = flash_id & 0xFF;
    let memory_type = (flash_id >> 8) & 0xFF;
    let capacity = (flash_id >> 16) & 0xFF;
    if vendor != XMC_VENDOR_ID {
        return false;
    }
    match memory_type {
        0x40 => (0x13..=0x20).contains(&capacity),
        0x41 => (0x17..=0x20).contains(&capacity),
        0x50 => (0x15..=0x16).contains(&capacity),
        _ => false,
    }
}

impl<P: Port> Connection<P> {
    /// Run one command on the SPI flash and return the bits read back.
    #[allow(clippy::cast_possible_truncation)]
    pub fn run_spiflash_command(&mut self, cmd: &SpiFlashCommand) -> Result<u32> {
        if cmd.read_bits > MAX_READ_BITS {
            return Err(Error::Unsupported(
                "Reading more than 32 bits back from a SPI flash operation is unsupported".into(),
            ));
        }
        if cmd.data.len() > MAX_WRITE_BYTES {
            return Err(Error::Unsupported(
                "Writing more than 64 bytes of data with one SPI command is unsupported".into(),
            ));
        }

        let spi = self.profile()?.spi;
        let cmd_reg = spi.base + SPI_CMD_REG_OFFSET;
        let usr_reg = spi.base + spi.usr;
        let usr1_reg = spi.base + spi.usr1;
        let usr2_reg = spi.base + spi.usr2;
        let w0_reg = spi.base + spi.w0;
        let data_bits = cmd.data.len() as u32 * 8;

        let old_usr = self.channel.read_reg(usr_reg, DEFAULT_TIMEOUT)?;
        let old_usr2 = self.channel.read_reg(usr2_reg, DEFAULT_TIMEOUT)?;

        let mut flags = SPI_USR_COMMAND;
        if cmd.read_bits > 0 {
            flags |= SPI_USR_MISO;
        }
        if data_bits > 0 {
            flags |= SPI_USR_MOSI;
        }
        if cmd.addr_len > 0 {
            flags |= SPI_USR_ADDR;
        }
        if cmd.dummy_len > 0 {
            flags |= SPI_USR_DUMMY;
        }

        let mut usr1 = 0;
        if cmd.dummy_len > 0 {
            usr1 |= cmd.dummy_len - 1;
        }
        if cmd.addr_len > 0 {
            usr1 |= (cmd.addr_len - 1) << SPI_USR_ADDR_LEN_SHIFT;
        }
        match (spi.mosi_dlen, spi.miso_dlen) {
            (Some(mosi_dlen), Some(miso_dlen)) => {
                if data_bits > 0 {
                    self.channel
                        .write_reg(spi.base + mosi_dlen, data_bits - 1)?;
                }
                if cmd.read_bits > 0 {
                    self.channel
                        .write_reg(spi.base + miso_dlen, cmd.read_bits - 1)?;
                }
                if usr1 != 0 {
                    self.channel.write_reg(usr1_reg, usr1)?;
                }
            },
            _ => {
                // Older controllers keep the bit lengths in USR1.
                let mosi_mask = data_bits.saturating_sub(1);
                let miso_mask = cmd.read_bits.saturating_sub(1);
                usr1 |= (miso_mask << SPI_USR1_MISO_BITLEN_SHIFT)
                    | (mosi_mask << SPI_USR1_MOSI_BITLEN_SHIFT);
                self.channel.write_reg(usr1_reg, usr1)?;
            },
        }

        self.channel.write_reg(usr_reg, flags)?;
        self.channel.write_reg(
            usr2_reg,
            (7 << SPI_USR2_COMMAND_LEN_SHIFT) | u32::from(cmd.command),
        )?;
        if let Some(address) = cmd.address.filter(|a| *a != 0 && cmd.addr_len > 0) {
            self.channel
                .write_reg(spi.base + SPI_ADDR_REG_OFFSET, address)?;
        }

        if cmd.data.is_empty() {
            self.channel.write_reg(w0_reg, 0)?;
        } else {
            let mut padded = cmd.data.clone();
            padded.resize(cmd.data.len().div_ceil(4) * 4, 0);
            for (i, word) in padded.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                self.channel
                    .write_reg(w0_reg + 4 * i as u32, value)?;
            }
        }

        self.channel.write_reg(cmd_reg, SPI_CMD_USR)?;
        let mut done = false;
        for _ in 0..SPI_DONE_POLLS {
            if self.channel.read_reg(cmd_reg, DEFAULT_TIMEOUT)? & SPI_CMD_USR == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(Error::Timeout("SPI command did not complete in time".into()));
        }

        let status = self.channel.read_reg(w0_reg, DEFAULT_TIMEOUT)?;
        self.channel.write_reg(usr_reg, old_usr)?;
        self.channel.write_reg(usr2_reg, old_usr2)?;

        Ok(match cmd.read_bits {
            0 | MAX_READ_BITS => status,
            bits => status & ((1 << bits) - 1),
        })
    }

    /// JEDEC ID of the attached flash: manufacturer in the low byte, then
    /// memory type and capacity.
    pub fn flash_id(&mut self) -> Result<u32> {
        self.run_spiflash_command(&SpiFlashCommand::new(CMD_RDID).read(24))
    }

    /// Read `bits` of the SFDP table at `address`.
    pub fn read_spiflash_sfdp(&mut self, address: u32, bits: u32) -> Result<u32> {
        self.run_spiflash_command(
            &SpiFlashCommand::new(CMD_RDSFDP)
                .read(bits)
                .address(address, 24)
                .dummy(8),
        )
    }

    /// Attach the SPI flash so later flash commands reach it.
    pub fn flash_spi_attach(&mut self, hspi_arg: u32) -> Result<()> {
        let chip = self.profile()?.chip;
        match (chip, self.mode()) {
            // The ESP8266 ROM attaches as a side effect of FLASH_BEGIN.
            (Chip::Esp8266, LoaderMode::Rom) => self.flash_begin(0, 0, false).map(|_| ()),
            (_, mode) => {
                let rom_padding = mode == LoaderMode::Rom;
                self.channel.check_command(
                    "configure SPI flash pins",
                    &Command::spi_attach(hspi_arg, rom_padding),
                    DEFAULT_TIMEOUT,
                )?;
                Ok(())
            },
        }
    }

    /// Tell the loader how big the flash is.
    pub fn flash_set_parameters(&mut self, size: u32) -> Result<()> {
        self.channel.check_command(
            "set SPI params",
            &Command::spi_set_params(size),
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// Attach the flash and run the post-attach checks.
    pub fn attach_flash(&mut self) -> Result<()> {
        self.flash_spi_attach(0)?;
        self.run_flash_hooks();
        Ok(())
    }

    /// Check the flash answers and run the profile's flash hooks.
    ///
    /// Failures are logged and otherwise ignored. Nothing runs in secure
    /// download mode, where register access is refused.
    pub fn run_flash_hooks(&mut self) {
        if self.secure_download_mode() {
            return;
        }
        match self.flash_id() {
            Ok(0xFF_FFFF | 0) => warn!(
                "Failed to communicate with the flash chip, read/write operations will fail. Try checking the chip connections or removing any other hardware connected to IOs."
            ),
            Ok(id) => debug!("Flash ID 0x{id:06x}"),
            Err(e) => debug!("Reading flash ID failed: {e}"),
        }

        let hooks = self.profile().map(|p| p.flash_hooks).unwrap_or_default();
        for hook in hooks {
            let result = match hook {
                FlashHook::XmcStartup => self.xmc_startup(),
            };
            if let Err(e) = result {
                debug!("Flash hook {hook:?} failed: {e}");
            }
        }
    }

    fn xmc_startup(&mut self) -> Result<()> {
        if is_xmc_chip_strict(self.flash_id()?) {
            return Ok(());
        }
        if self.read_spiflash_sfdp(SFDP_MFID_ADDR, 8)? != XMC_VENDOR_ID {
            return Ok(());
        }

        warn!("XMC flash chip boot-up failure detected! Running XMC25QHxxC startup flow");
        // Deep power-down, ultra-deep power-down, exit, release.
        self.run_spiflash_command(&SpiFlashCommand::new(0xB9))?;
        self.run_spiflash_command(&SpiFlashCommand::new(0x79))?;
        self.run_spiflash_command(&SpiFlashCommand::new(0xFF))?;
        thread::sleep(Duration::from_millis(2));
        self.run_spiflash_command(&SpiFlashCommand::new(0xAB))?;
        thread::sleep(Duration::from_micros(20));

        if is_xmc_chip_strict(self.flash_id()?) {
            info!("XMC flash chip boot-up fix successful!");
        } else {
            warn!("XMC flash boot-up fix failed.");
        }
        Ok(())
    }

    /// Flash size reported by the flash ID, if it is a known one.
    pub fn detect_flash_size(&mut self) -> Result<Option<&'static str>> {
        if self.secure_download_mode() {
            warn!(
                "Detecting flash size is not supported in secure download mode. Need to manually specify flash size."
            );
            return Ok(None);
        }
        let flash_id = self.flash_id()?;
        let size = detected_flash_size(flash_id);
        match size {
            Some(name) => info!("Auto-detected Flash size: {name}"),
            None => warn!(
                "Could not auto-detect Flash size (FlashID=0x{flash_id:x}, SizeID=0x{:x}), keeping the image header value",
                (flash_id >> 16) & 0xFF
            ),
        }
        Ok(size)
    }
}
