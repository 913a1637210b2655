//! Firmware image formats.
//!
//! - [`esp`]: the image container the ROM bootloader boots from
//! - [`elf`]: ELF input and conversion to an image
//! - [`params`]: flash mode, frequency and size header fields

pub mod elf;
pub mod esp;
pub mod params;

pub use elf::{Elf2ImageOptions, ElfFile, elf2image};
pub use esp::{FirmwareImage, ImageSegment};
pub use params::{FlashFreq, FlashMode, FlashParams, FlashSize};
