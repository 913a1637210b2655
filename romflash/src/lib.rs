//! # romflash
//!
//! A library for talking to the serial ROM bootloader of ESP8266 and
//! ESP32-family chips.
//!
//! This crate provides the core functionality for flashing these chips over
//! a serial port, including:
//!
//! - SLIP framing and the bootloader command protocol
//! - Reset sequences, sync and chip detection
//! - Stub loader upload and RAM boot
//! - Compressed flash writes with MD5 verification, flash reads and erase
//! - Firmware image parsing, ELF to image conversion and header patching
//!
//! ## Supported Chips
//!
//! - ESP8266
//! - ESP32, ESP32-S2, ESP32-S3, ESP32-C3
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use romflash::{AfterMode, FlashFile, FlasherOptions, SerialConfig, WriteOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
//!         let mut flasher = romflash::create_flasher(&config, FlasherOptions::default())?;
//!         flasher.connect()?;
//!
//!         let files = [FlashFile::from_path(0x10000, "app.bin")?];
//!         flasher.write_flash(&files, &WriteOptions::default(), &mut |name, current, total| {
//!             println!("Writing {name}: {current}/{total}");
//!         })?;
//!
//!         flasher.reset(AfterMode::HardReset)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

static INTERRUPT_CHECKER: OnceLock<InterruptChecker> = OnceLock::new();

/// Install the callback polled between flash blocks and connect attempts.
///
/// Returning `true` makes the running operation fail with "Interrupted".
/// Only the first call takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    if INTERRUPT_CHECKER.set(Arc::new(checker)).is_err() {
        log::debug!("Interrupt checker already installed");
    }
}

/// Whether the embedding application asked to stop.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

/// Drive the checker from a flag owned by the test harness.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    FLAG.get_or_init(|| {
        let flag = Arc::new(AtomicBool::new(false));
        let polled = Arc::clone(&flag);
        set_interrupt_checker(move || polled.load(Ordering::Relaxed));
        flag
    })
    .store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::NativePort;
#[cfg(feature = "native")]
pub use target::create_flasher;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    error::{Error, Result},
    image::{
        Elf2ImageOptions, ElfFile, FirmwareImage, FlashFreq, FlashMode, FlashParams, FlashSize,
        ImageSegment, elf2image,
    },
    port::{Port, SerialConfig},
    target::{
        AfterMode, Chip, ConnectOptions, EspFlasher, FlashFile, Flasher, FlasherOptions,
        ResetMode, SecurityInfo, StubImage, WriteOptions,
    },
};
