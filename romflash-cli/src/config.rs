//! `romflash.toml` settings.
//!
//! Values are layered, later sources winning: the global file in the user's
//! config directory, then the first local file found in the working
//! directory. `--config` replaces both. Flags and `ROMFLASH_*` variables
//! override whatever the files say.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local config file names, checked in order.
const LOCAL_CONFIG_FILES: [&str; 2] = ["romflash.toml", ".romflash.toml"];

/// Overwrite `dst` only when `src` holds a value.
fn take<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

/// `[port]`: how to reach the board.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate to switch to after connecting.
    pub baud: Option<u32>,
    /// Reset before connecting (`default-reset`, `usb-reset`, ...).
    pub before: Option<String>,
    /// Reset after the operation (`hard-reset`, `no-reset`, ...).
    pub after: Option<String>,
    /// Connection attempts, 0 for no limit.
    pub connect_attempts: Option<u32>,
}

impl PortConfig {
    fn overlay(&mut self, other: Self) {
        take(&mut self.serial, other.serial);
        take(&mut self.baud, other.baud);
        take(&mut self.before, other.before);
        take(&mut self.after, other.after);
        take(&mut self.connect_attempts, other.connect_attempts);
    }
}

/// `[flash]`: target chip and write defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Expected chip type.
    pub chip: Option<String>,
    /// Flash mode written into bootloader headers.
    pub mode: Option<String>,
    /// Flash frequency written into bootloader headers.
    pub freq: Option<String>,
    /// Flash size written into bootloader headers.
    pub size: Option<String>,
    /// Stub loader file.
    pub stub: Option<PathBuf>,
    /// Compress writes.
    pub compress: Option<bool>,
    /// Verify after writing.
    pub verify: Option<bool>,
}

impl FlashConfig {
    fn overlay(&mut self, other: Self) {
        take(&mut self.chip, other.chip);
        take(&mut self.mode, other.mode);
        take(&mut self.freq, other.freq);
        take(&mut self.size, other.size);
        take(&mut self.stub, other.stub);
        take(&mut self.compress, other.compress);
        take(&mut self.verify, other.verify);
    }
}

/// Everything a config file can set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// `[port]` table.
    #[serde(default)]
    pub port: PortConfig,
    /// `[flash]` table.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Global file overlaid with the first local file found.
    pub fn load() -> Self {
        let global = Self::global_config_path().and_then(|path| Self::read(&path));
        let local = LOCAL_CONFIG_FILES
            .iter()
            .find_map(|name| Self::read(Path::new(name)));

        let mut config = Self::default();
        for layer in [global, local].into_iter().flatten() {
            config.merge(layer);
        }
        config
    }

    /// Only the file given with `--config`.
    pub fn load_from_path(path: &Path) -> Self {
        Self::read(path).unwrap_or_else(|| {
            warn!("Ignoring config {}, using defaults", path.display());
            Self::default()
        })
    }

    /// Parse one file. Missing files are silent, broken ones warn.
    fn read(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        match toml::from_str(&text) {
            Ok(config) => {
                debug!("Using config {}", path.display());
                Some(config)
            },
            Err(e) => {
                warn!("Failed to parse config file {}: {e}", path.display());
                None
            },
        }
    }

    /// `<config dir>/romflash/config.toml`, when the platform has one.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "romflash").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Overlay `other`; its unset fields keep the current values.
    fn merge(&mut self, other: Self) {
        self.port.overlay(other.port);
        self.flash.overlay(other.flash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_fills_both_sections() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.port.serial = Some("/dev/ttyUSB0".to_string());
        other.flash.chip = Some("esp32".to_string());

        base.merge(other);

        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.flash.chip.as_deref(), Some("esp32"));
    }

    #[test]
    fn test_merge_keeps_values_missing_from_overlay() {
        let mut base = Config::default();
        base.port.serial = Some("/dev/ttyUSB0".to_string());
        base.port.baud = Some(115200);
        base.flash.compress = Some(false);

        base.merge(Config::default());

        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.port.baud, Some(115200));
        assert_eq!(base.flash.compress, Some(false));
    }

    #[test]
    fn test_merge_false_overrides_true() {
        let mut base = Config::default();
        base.flash.verify = Some(true);

        let mut other = Config::default();
        other.flash.verify = Some(false);

        base.merge(other);
        assert_eq!(base.flash.verify, Some(false));
    }

    #[test]
    fn test_every_key_parses() {
        let toml_str = r#"
[port]
serial = "/dev/ttyUSB0"
baud = 921600
before = "usb-reset"
after = "no-reset"
connect_attempts = 0

[flash]
chip = "esp32s3"
mode = "dio"
freq = "80m"
size = "detect"
stub = "stubs/esp32s3.stub"
compress = false
verify = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.baud, Some(921600));
        assert_eq!(config.port.before.as_deref(), Some("usb-reset"));
        assert_eq!(config.port.after.as_deref(), Some("no-reset"));
        assert_eq!(config.port.connect_attempts, Some(0));
        assert_eq!(config.flash.chip.as_deref(), Some("esp32s3"));
        assert_eq!(config.flash.mode.as_deref(), Some("dio"));
        assert_eq!(config.flash.freq.as_deref(), Some("80m"));
        assert_eq!(config.flash.size.as_deref(), Some("detect"));
        assert_eq!(
            config.flash.stub.as_deref(),
            Some(Path::new("stubs/esp32s3.stub"))
        );
        assert_eq!(config.flash.compress, Some(false));
        assert_eq!(config.flash.verify, Some(true));
    }

    #[test]
    fn test_missing_tables_default() {
        let config: Config = toml::from_str("[flash]\nchip = \"esp8266\"\n").unwrap();
        assert!(config.port.serial.is_none());
        assert_eq!(config.flash.chip.as_deref(), Some("esp8266"));
    }

    #[test]
    fn test_serialized_config_reloads() {
        let mut config = Config::default();
        config.port.serial = Some("COM3".to_string());
        config.port.baud = Some(460800);
        config.flash.size = Some("4MB".to_string());

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.port.serial.as_deref(), Some("COM3"));
        assert_eq!(deserialized.port.baud, Some(460800));
        assert_eq!(deserialized.flash.size.as_deref(), Some("4MB"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[port]\nserial = \"/dev/ttyUSB1\"\n[flash]\nchip = \"esp32c3\"\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.flash.chip.as_deref(), Some("esp32c3"));
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[port\nserial = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.port.serial.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.serial.is_none());
    }

    #[test]
    fn test_global_path_is_under_romflash() {
        if let Some(path) = Config::global_config_path() {
            assert_eq!(path.file_name().unwrap(), "config.toml");
            assert!(path.to_string_lossy().contains("romflash"));
        }
    }
}
