//! Chip support and the flashing surface.
//!
//! - [`chip`]: per-chip profiles, capabilities and constants
//! - [`connection`]: reset, sync, chip detection and session state
//! - [`stub`]: RAM downloads and the stub loader
//! - [`spi`]: raw SPI flash commands and flash hooks
//! - [`flasher`]: flash write, read, verify and erase

pub mod chip;
pub mod connection;
pub mod flasher;
pub mod spi;
pub mod stub;

pub use chip::{Capability, Chip, ChipProfile, LoaderMode};
pub use connection::{AfterMode, ConnectOptions, Connection, ConnectionState, ResetMode, SecurityInfo};
pub use flasher::{EspFlasher, FlashFile, FlasherOptions, WriteOptions};
pub use stub::StubImage;

use crate::error::Result;
use crate::image::esp::FirmwareImage;
use crate::image::params::FlashParams;

/// Operations every flasher offers, independent of the port type.
pub trait Flasher {
    /// Connect to the bootloader and prepare the session.
    fn connect(&mut self) -> Result<()>;

    /// The connected chip, once known.
    fn chip(&self) -> Option<Chip>;

    /// Write files to flash.
    ///
    /// # Arguments
    ///
    /// * `files` - Files with their flash offsets
    /// * `options` - Compression, encryption, erase and header settings
    /// * `progress` - Progress callback (file_name, current_bytes, total_bytes)
    fn write_flash(
        &mut self,
        files: &[FlashFile],
        options: &WriteOptions,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()>;

    /// Compare files against flash contents.
    fn verify_flash(&mut self, files: &[FlashFile], params: &FlashParams, diff: bool) -> Result<()>;

    /// Read a flash range.
    fn read_flash(
        &mut self,
        offset: u32,
        size: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>>;

    /// Erase entire flash.
    fn erase_flash(&mut self) -> Result<()>;

    /// Erase a sector-aligned region.
    fn erase_region(&mut self, offset: u32, size: u32) -> Result<()>;

    /// JEDEC ID of the SPI flash.
    fn flash_id(&mut self) -> Result<u32>;

    /// Chip ID word from the ROM.
    fn chip_id(&mut self) -> Result<u32>;

    /// Security information block.
    fn security_info(&mut self) -> Result<SecurityInfo>;

    /// Load an image into RAM and run it.
    fn load_ram(&mut self, image: &FirmwareImage) -> Result<()>;

    /// Leave the device in the state `after` names.
    fn reset(&mut self, after: AfterMode) -> Result<()>;

    /// Get the connection baud rate.
    fn connection_baud(&self) -> u32;

    /// Close the flasher and release resources.
    ///
    /// It is safe to call even if the connection is not active.
    fn close(&mut self);
}

/// Open the port in `config` and create a flasher on it.
#[cfg(feature = "native")]
pub fn create_flasher(
    config: &crate::port::SerialConfig,
    options: FlasherOptions,
) -> Result<Box<dyn Flasher>> {
    let flasher = EspFlasher::open(config, options)?;
    Ok(Box::new(flasher))
}

/// Create a flasher on an already opened port.
///
/// This is useful for testing or custom port implementations.
pub fn create_flasher_with_port<P: crate::port::Port + 'static>(
    port: P,
    options: FlasherOptions,
) -> Box<dyn Flasher> {
    Box::new(EspFlasher::new(port, options))
}
