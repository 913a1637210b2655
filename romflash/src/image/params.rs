//! SPI flash mode, frequency and size parameters.
//!
//! These live in bytes 2 and 3 of every image header. The bootloader reads
//! them to configure the flash bus, so they are rewritten when a bootloader
//! image is flashed with non-default settings.

use crate::error::{Error, Result};
use crate::image::esp::{ESP_IMAGE_MAGIC, FirmwareImage};
use crate::target::chip::ChipProfile;
use log::warn;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Flash bus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FlashMode {
    /// Quad I/O.
    Qio,
    /// Quad output.
    Qout,
    /// Dual I/O.
    Dio,
    /// Dual output.
    Dout,
}

impl FlashMode {
    /// Header byte value.
    pub fn code(self) -> u8 {
        match self {
            Self::Qio => 0,
            Self::Qout => 1,
            Self::Dio => 2,
            Self::Dout => 3,
        }
    }

    /// Mode for a header byte value.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Qio),
            1 => Some(Self::Qout),
            2 => Some(Self::Dio),
            3 => Some(Self::Dout),
            _ => None,
        }
    }
}

impl FromStr for FlashMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "qio" => Ok(Self::Qio),
            "qout" => Ok(Self::Qout),
            "dio" => Ok(Self::Dio),
            "dout" => Ok(Self::Dout),
            _ => Err(Error::Config(format!(
                "Unknown flash mode '{s}' (expected qio, qout, dio or dout)"
            ))),
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Qio => "qio",
            Self::Qout => "qout",
            Self::Dio => "dio",
            Self::Dout => "dout",
        };
        f.write_str(name)
    }
}

/// SPI clock frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFreq {
    /// 80 MHz.
    Freq80M,
    /// 40 MHz.
    Freq40M,
    /// 26 MHz.
    Freq26M,
    /// 20 MHz.
    Freq20M,
}

impl FlashFreq {
    /// Low nibble of the size/frequency byte.
    pub fn code(self) -> u8 {
        match self {
            Self::Freq80M => 0xF,
            Self::Freq40M => 0x0,
            Self::Freq26M => 0x1,
            Self::Freq20M => 0x2,
        }
    }

    /// Frequency for a low nibble.
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x0F {
            0xF => Some(Self::Freq80M),
            0x0 => Some(Self::Freq40M),
            0x1 => Some(Self::Freq26M),
            0x2 => Some(Self::Freq20M),
            _ => None,
        }
    }
}

impl FromStr for FlashFreq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "80m" => Ok(Self::Freq80M),
            "40m" => Ok(Self::Freq40M),
            "26m" => Ok(Self::Freq26M),
            "20m" => Ok(Self::Freq20M),
            _ => Err(Error::Config(format!(
                "Unknown flash frequency '{s}' (expected 80m, 40m, 26m or 20m)"
            ))),
        }
    }
}

impl fmt::Display for FlashFreq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Freq80M => "80m",
            Self::Freq40M => "40m",
            Self::Freq26M => "26m",
            Self::Freq20M => "20m",
        };
        f.write_str(name)
    }
}

/// Flash size setting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlashSize {
    /// Leave the header value alone.
    #[default]
    Keep,
    /// Read the flash ID and use the size it reports.
    Detect,
    /// A size name such as `4MB`, checked against the chip's table when used.
    Named(String),
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "detect" => Ok(Self::Detect),
            _ if flash_size_bytes(s).is_some() => {
                Ok(Self::Named(s.to_ascii_uppercase().replace("-C1", "-c1")))
            },
            _ => Err(Error::Config(format!("Unknown flash size '{s}'"))),
        }
    }
}

/// Header parameters to apply when writing a bootloader image.
///
/// `None` keeps whatever the image already says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashParams {
    /// Flash mode.
    pub mode: Option<FlashMode>,
    /// SPI frequency.
    pub freq: Option<FlashFreq>,
    /// Flash size.
    pub size: FlashSize,
}

impl FlashParams {
    /// Parse the three textual settings, each of which may be `keep`.
    pub fn from_args(mode: &str, freq: &str, size: &str) -> Result<Self> {
        let keep = |s: &str| s.eq_ignore_ascii_case("keep");
        Ok(Self {
            mode: if keep(mode) { None } else { Some(mode.parse()?) },
            freq: if keep(freq) { None } else { Some(freq.parse()?) },
            size: size.parse()?,
        })
    }

    /// Whether every field is `keep`.
    pub fn is_keep(&self) -> bool {
        self.mode.is_none() && self.freq.is_none() && self.size == FlashSize::Keep
    }
}

/// Flash size name for byte 2 of a JEDEC flash ID.
pub fn detected_flash_size(flash_id: u32) -> Option<&'static str> {
    let size_id = (flash_id >> 16) & 0xFF;
    let name = match size_id {
        0x12 => "256KB",
        0x13 => "512KB",
        0x14 => "1MB",
        0x15 => "2MB",
        0x16 => "4MB",
        0x17 => "8MB",
        0x18 => "16MB",
        0x19 => "32MB",
        0x1A => "64MB",
        0x1B => "128MB",
        0x1C => "256MB",
        0x20 => "64MB",
        0x21 => "128MB",
        _ => return None,
    };
    Some(name)
}

/// Size in bytes of a name such as `4MB`, `512KB` or `2MB-c1`.
pub fn flash_size_bytes(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    let base = upper.strip_suffix("-C1").unwrap_or(&upper);
    if let Some(mb) = base.strip_suffix("MB") {
        mb.parse::<u32>().ok()?.checked_mul(1024 * 1024)
    } else if let Some(kb) = base.strip_suffix("KB") {
        kb.parse::<u32>().ok()?.checked_mul(1024)
    } else {
        None
    }
}

/// Rewrite bytes 2..4 of a bootloader image with `params`.
///
/// Images written anywhere but the bootloader offset, and buffers that do not
/// parse as an image for `profile`, are left alone. `FlashSize::Detect` must
/// already be resolved by the caller and is treated as keep here.
pub fn update_image_flash_params(
    profile: &ChipProfile,
    address: u32,
    params: &FlashParams,
    image: &mut [u8],
) -> Result<()> {
    if image.len() < 8 || address != profile.bootloader_offset || params.is_keep() {
        return Ok(());
    }
    if image[0] != ESP_IMAGE_MAGIC {
        warn!(
            "Image file at 0x{address:x} doesn't look like an image file, so not changing any flash settings."
        );
        return Ok(());
    }
    let parsed = FirmwareImage::from_bytes(profile.chip, image)
        .and_then(|img| img.verify().map(|()| img));
    let Ok(parsed) = parsed else {
        warn!(
            "Image file at 0x{address:x} is not a valid {} image, so not changing any flash settings.",
            profile.name
        );
        return Ok(());
    };

    let mode = params.mode.map_or(image[2], FlashMode::code);
    let freq = params.freq.map_or(image[3] & 0x0F, FlashFreq::code);
    let size = match &params.size {
        FlashSize::Named(name) => profile.flash_size_code(name).ok_or_else(|| {
            Error::Config(format!(
                "Flash size '{name}' is not supported by {}",
                profile.name
            ))
        })?,
        FlashSize::Keep | FlashSize::Detect => image[3] & 0xF0,
    };

    let patched = [mode, size | freq];
    if image[2..4] != patched {
        log::info!(
            "Flash params set to 0x{:04x}",
            u16::from_be_bytes(patched)
        );
        image[2..4].copy_from_slice(&patched);
    }

    // A valid appended digest has to follow the header change.
    if let (Some(true), Some(end)) = (parsed.digest_valid(), parsed.data_length) {
        let digest = Sha256::digest(&image[..end]);
        image[end..end + digest.len()].copy_from_slice(&digest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::esp::ImageSegment;
    use crate::target::chip::Chip;

    fn bootloader_image(chip: Chip) -> Vec<u8> {
        let mut image = FirmwareImage::new(chip);
        image.entrypoint = 0x4008_0000;
        image
            .segments
            .push(ImageSegment::new(0x3FFE_8000, vec![1, 2, 3, 4], None));
        image.to_bytes().unwrap()
    }

    #[test]
    fn test_mode_and_freq_codes() {
        assert_eq!("dio".parse::<FlashMode>().unwrap().code(), 2);
        assert_eq!(FlashMode::from_code(3), Some(FlashMode::Dout));
        assert_eq!("80m".parse::<FlashFreq>().unwrap().code(), 0xF);
        assert_eq!(FlashFreq::from_code(0x21), Some(FlashFreq::Freq26M));
        assert!("120m".parse::<FlashFreq>().is_err());
        assert!("sio".parse::<FlashMode>().is_err());
    }

    #[test]
    fn test_flash_params_from_args() {
        let params = FlashParams::from_args("keep", "keep", "keep").unwrap();
        assert!(params.is_keep());

        let params = FlashParams::from_args("dout", "40m", "4mb").unwrap();
        assert_eq!(params.mode, Some(FlashMode::Dout));
        assert_eq!(params.size, FlashSize::Named("4MB".into()));

        let params = FlashParams::from_args("keep", "keep", "detect").unwrap();
        assert_eq!(params.size, FlashSize::Detect);
        assert!(FlashParams::from_args("keep", "keep", "3XB").is_err());
    }

    #[test]
    fn test_flash_size_bytes() {
        assert_eq!(flash_size_bytes("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(flash_size_bytes("512KB"), Some(512 * 1024));
        assert_eq!(flash_size_bytes("2MB-c1"), Some(2 * 1024 * 1024));
        assert_eq!(flash_size_bytes("huge"), None);
    }

    #[test]
    fn test_detected_flash_size() {
        assert_eq!(detected_flash_size(0x0016_4020), Some("4MB"));
        assert_eq!(detected_flash_size(0x0018_40EF), Some("16MB"));
        assert_eq!(detected_flash_size(0x0021_0000), Some("128MB"));
        assert_eq!(detected_flash_size(0x00FF_FFFF), None);
    }

    #[test]
    fn test_patch_bootloader_header() {
        let profile = Chip::Esp32.profile();
        let mut image = bootloader_image(Chip::Esp32);
        let params = FlashParams::from_args("dio", "80m", "4MB").unwrap();
        update_image_flash_params(profile, 0x1000, &params, &mut image).unwrap();
        assert_eq!(image[2], 0x02);
        assert_eq!(image[3], 0x2F);

        let reloaded = FirmwareImage::from_bytes(Chip::Esp32, &image).unwrap();
        assert_eq!(reloaded.digest_valid(), Some(true));
    }

    #[test]
    fn test_patch_keeps_unchanged_fields() {
        let profile = Chip::Esp32.profile();
        let mut image = bootloader_image(Chip::Esp32);
        image[3] = 0x31;
        let params = FlashParams::from_args("qout", "keep", "keep").unwrap();
        update_image_flash_params(profile, 0x1000, &params, &mut image).unwrap();
        assert_eq!(image[2], 0x01);
        assert_eq!(image[3], 0x31);
    }

    #[test]
    fn test_patch_skips_other_offsets_and_non_images() {
        let profile = Chip::Esp32.profile();
        let params = FlashParams::from_args("dio", "80m", "4MB").unwrap();

        let original = bootloader_image(Chip::Esp32);
        let mut image = original.clone();
        update_image_flash_params(profile, 0x10000, &params, &mut image).unwrap();
        assert_eq!(image, original);

        let mut data = vec![0xAA; 64];
        update_image_flash_params(profile, 0x1000, &params, &mut data).unwrap();
        assert_eq!(data, vec![0xAA; 64]);

        // Magic byte present, but the segment table runs off the end.
        let mut fake = vec![ESP_IMAGE_MAGIC, 3, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF];
        let before = fake.clone();
        update_image_flash_params(profile, 0x1000, &params, &mut fake).unwrap();
        assert_eq!(fake, before);
    }

    #[test]
    fn test_patch_rejects_size_unknown_to_chip() {
        let profile = Chip::Esp8266.profile();
        let mut image = bootloader_image(Chip::Esp8266);
        let params = FlashParams::from_args("keep", "keep", "64MB").unwrap();
        assert!(matches!(
            update_image_flash_params(profile, 0, &params, &mut image),
            Err(Error::Config(_))
        ));
    }
}
