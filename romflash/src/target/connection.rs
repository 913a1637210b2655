//! Connection manager.
//!
//! Drives the chip from power-on into a synced bootloader session: reset
//! waveforms on DTR/RTS, sync, chip identification from the magic register,
//! and the profile-scoped hooks that run once the chip is known.
//!
//! States move `Disconnected -> Resetting -> Syncing -> Synced`, and the stub
//! bootstrap in [`crate::target::stub`] moves a synced session on to
//! `StubRunning`.

use crate::device::USB_JTAG_SERIAL_PID;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::channel::CommandChannel;
use crate::protocol::command::{Command, DEFAULT_TIMEOUT, SYNC_TIMEOUT};
use crate::target::chip::{
    CHIP_DETECT_MAGIC_REG, Capability, Chip, ChipProfile, ConnectHook, CrystalStrategy,
    ESP_RAM_BLOCK, GPIO_STRAP_SPI_BOOT_MASK, HardResetStrategy, LoaderMode,
    RTC_FORCE_DOWNLOAD_BOOT_MASK, RTC_SWD_AUTO_FEED_EN, RTC_SWD_WKEY, RTC_WDT_WKEY,
    UART_CLKDIV_MASK, UNSUPPORTED_CHIPS,
};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, trace, warn};
use std::fmt;
use std::io::Cursor;
use std::ops::Range;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

/// Sync tries per reset cycle.
const SYNC_TRIES: usize = 5;

/// Pause between sync tries.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Follow-up replies drained after the first sync response.
const SYNC_DRAIN_READS: usize = 7;

/// Default outer connect attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 7;

/// EN held low during a reset.
const RESET_HOLD: Duration = Duration::from_millis(100);

/// IO0 held low after EN is released.
const BOOT_STRAP_DELAY: Duration = Duration::from_millis(50);

/// IO0 hold time for slow-booting parts.
const BOOT_STRAP_EXTRA_DELAY: Duration = Duration::from_millis(500);

/// Settle time around releasing EN over USB-OTG.
const USB_OTG_RESET_DELAY: Duration = Duration::from_millis(200);

/// Settle time after a baud rate change.
const BAUD_CHANGE_DELAY: Duration = Duration::from_millis(50);

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Toggling control lines.
    Resetting,
    /// Waiting for a sync reply.
    Syncing,
    /// The ROM loader answers commands.
    Synced,
    /// The RAM stub answers commands.
    StubRunning,
}

/// How to get the chip into its bootloader before syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    /// Classic DTR/RTS auto-reset circuit.
    #[default]
    DefaultReset,
    /// USB-JTAG-Serial reset sequence.
    UsbReset,
    /// Sync only.
    NoReset,
    /// Neither reset nor sync.
    NoResetNoSync,
}

impl ResetMode {
    /// All modes with their command-line names.
    pub const NAMES: [(&'static str, Self); 4] = [
        ("default-reset", Self::DefaultReset),
        ("usb-reset", Self::UsbReset),
        ("no-reset", Self::NoReset),
        ("no-reset-no-sync", Self::NoResetNoSync),
    ];
}

impl fmt::Display for ResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES
            .iter()
            .find(|(_, m)| m == self)
            .map_or("default-reset", |(n, _)| *n);
        f.write_str(name)
    }
}

impl FromStr for ResetMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.replace('_', "-");
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&wanted))
            .map(|(_, m)| *m)
            .ok_or_else(|| Error::Config(format!("Unknown reset mode: {s}")))
    }
}

/// What to do with the chip once the operation is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterMode {
    /// Reset into the application.
    #[default]
    HardReset,
    /// Jump to the application through the loader.
    SoftReset,
    /// Leave the chip in the loader.
    NoReset,
    /// Leave the chip in the loader and keep the stub running.
    NoResetStub,
}

impl AfterMode {
    /// All modes with their command-line names.
    pub const NAMES: [(&'static str, Self); 4] = [
        ("hard-reset", Self::HardReset),
        ("soft-reset", Self::SoftReset),
        ("no-reset", Self::NoReset),
        ("no-reset-stub", Self::NoResetStub),
    ];
}

impl fmt::Display for AfterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES
            .iter()
            .find(|(_, m)| m == self)
            .map_or("hard-reset", |(n, _)| *n);
        f.write_str(name)
    }
}

impl FromStr for AfterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.replace('_', "-");
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&wanted))
            .map(|(_, m)| *m)
            .ok_or_else(|| Error::Config(format!("Unknown after-reset mode: {s}")))
    }
}

/// Options for [`Connection::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Reset waveform.
    pub reset: ResetMode,
    /// Outer connect attempts, 0 for no limit.
    pub attempts: u32,
    /// Expected chip, `None` to autodetect.
    pub chip: Option<Chip>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reset: ResetMode::DefaultReset,
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            chip: None,
        }
    }
}

/// Peripheral carrying the ROM console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    /// A UART, usually behind a USB bridge.
    Uart,
    /// The USB-OTG CDC device.
    UsbOtg,
    /// The USB-JTAG-Serial peripheral.
    UsbJtagSerial,
}

/// Boot message captured right after a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootLog {
    /// The `boot:0x..` strapping value.
    pub boot_mode: String,
    /// Whether the ROM said it was waiting for download.
    pub download_mode: bool,
}

impl BootLog {
    /// Find `boot:0x<hex>` and an optional later "waiting for download".
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(bytes);
        let start = text.find("boot:0x")? + "boot:".len();
        let rest = &text[start..];
        let end = rest[2..]
            .find(|c: char| !c.is_ascii_hexdigit())
            .map_or(rest.len(), |i| i + 2);
        if end == 2 {
            return None;
        }
        Some(Self {
            boot_mode: rest[..end].to_string(),
            download_mode: rest[end..].contains("waiting for download"),
        })
    }
}

/// Decoded GET_SECURITY_INFO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    /// Security flag word.
    pub flags: u32,
    /// Flash encryption counter.
    pub flash_crypt_cnt: u8,
    /// Key purposes of the seven key blocks.
    pub key_purposes: [u8; 7],
    /// Chip ID, on chips that report one.
    pub chip_id: Option<u32>,
    /// ROM API version, on chips that report one.
    pub api_version: Option<u32>,
}

impl SecurityInfo {
    /// Parse the 12- or 20-byte reply body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 12 && data.len() != 20 {
            return Err(Error::Protocol(format!(
                "Unexpected security info length {}",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let flash_crypt_cnt = cursor.read_u8()?;
        let mut key_purposes = [0u8; 7];
        for purpose in &mut key_purposes {
            *purpose = cursor.read_u8()?;
        }
        let (chip_id, api_version) = if data.len() == 20 {
            (
                Some(cursor.read_u32::<LittleEndian>()?),
                Some(cursor.read_u32::<LittleEndian>()?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            flags,
            flash_crypt_cnt,
            key_purposes,
            chip_id,
            api_version,
        })
    }
}

/// One bootloader session over an exclusively owned port.
pub struct Connection<P: Port> {
    pub(crate) channel: CommandChannel<P>,
    pub(crate) state: ConnectionState,
    profile: Option<&'static ChipProfile>,
    pub(crate) sync_stub_detected: bool,
    stub_is_disabled: bool,
    ram_block: u32,
    console: Option<Console>,
    dtr: bool,
    /// Address ranges occupied by a running stub, `None` when a stub
    /// of unknown layout answered the sync.
    pub(crate) resident_ranges: Option<Vec<Range<u32>>>,
}

impl<P: Port> Connection<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self {
            channel: CommandChannel::new(port),
            state: ConnectionState::Disconnected,
            profile: None,
            sync_stub_detected: false,
            stub_is_disabled: false,
            ram_block: ESP_RAM_BLOCK,
            console: None,
            dtr: false,
            resident_ranges: Some(Vec::new()),
        }
    }

    /// The command channel.
    pub fn channel(&mut self) -> &mut CommandChannel<P> {
        &mut self.channel
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.channel.port()
    }

    /// Consume the connection and return the underlying port.
    pub fn into_port(self) -> P {
        self.channel.into_port()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Which loader answers commands.
    pub fn mode(&self) -> LoaderMode {
        if self.state == ConnectionState::StubRunning {
            LoaderMode::Stub
        } else {
            LoaderMode::Rom
        }
    }

    /// Profile of the connected chip.
    pub fn profile(&self) -> Result<&'static ChipProfile> {
        self.profile
            .ok_or_else(|| Error::Protocol("Not connected to a chip".into()))
    }

    /// The connected chip, if known.
    pub fn chip(&self) -> Option<Chip> {
        self.profile.map(|p| p.chip)
    }

    /// Whether the last sync was answered by an already running stub.
    pub fn sync_stub_detected(&self) -> bool {
        self.sync_stub_detected
    }

    /// Whether the stub must not be used on this silicon.
    pub fn stub_is_disabled(&self) -> bool {
        self.stub_is_disabled
    }

    /// Whether the chip is in secure download mode.
    pub fn secure_download_mode(&self) -> bool {
        self.channel
            .secure_download_mode()
    }

    /// RAM download block size.
    pub fn ram_block(&self) -> u32 {
        self.ram_block
    }

    /// Fail with [`Error::Unsupported`] unless the current loader has `capability`.
    pub fn require(&self, capability: Capability) -> Result<()> {
        let profile = self.profile()?;
        let mode = self.mode();
        if profile.supports(capability, mode) {
            return Ok(());
        }
        let loader = match mode {
            LoaderMode::Rom => "ROM loader",
            LoaderMode::Stub => "stub loader",
        };
        Err(Error::Unsupported(format!(
            "{capability} is not available with the {} {loader}",
            profile.name
        )))
    }

    /// Whether the current loader has `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.require(capability)
            .is_ok()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("DTR={level}");
        self.dtr = level;
        self.channel
            .port_mut()
            .set_dtr(level)
    }

    // Some drivers only latch RTS on a DTR write.
    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("RTS={level}");
        let dtr = self.dtr;
        let port = self.channel.port_mut();
        port.set_rts(level)?;
        port.set_dtr(dtr)
    }

    /// Toggle DTR/RTS to enter the bootloader.
    pub fn bootloader_reset(&mut self, usb_jtag: bool, extra_delay: bool) -> Result<()> {
        if usb_jtag {
            self.set_rts(false)?;
            self.set_dtr(false)?;
            thread::sleep(RESET_HOLD);
            self.set_dtr(true)?;
            self.set_rts(false)?;
            thread::sleep(RESET_HOLD);
            self.set_rts(true)?;
            self.set_dtr(false)?;
            self.set_rts(true)?;
            thread::sleep(RESET_HOLD);
            self.set_dtr(false)?;
            self.set_rts(false)?;
        } else {
            self.set_dtr(false)?;
            self.set_rts(true)?;
            thread::sleep(RESET_HOLD);
            self.set_dtr(true)?;
            self.set_rts(false)?;
            thread::sleep(if extra_delay {
                BOOT_STRAP_EXTRA_DELAY
            } else {
                BOOT_STRAP_DELAY
            });
            self.set_dtr(false)?;
        }
        Ok(())
    }

    /// Sync with the loader and note whether a stub answered.
    pub fn sync(&mut self) -> Result<()> {
        let first = self
            .channel
            .command(&Command::sync(), SYNC_TIMEOUT)?;
        let mut stub = first.value == 0;
        for _ in 0..SYNC_DRAIN_READS {
            let reply = self
                .channel
                .read_response(None, SYNC_TIMEOUT)?;
            stub &= reply.value == 0;
        }
        self.sync_stub_detected = stub;
        Ok(())
    }

    fn capture_boot_log(&mut self) -> Option<BootLog> {
        let port = self.channel.port_mut();
        let waiting = port
            .bytes_to_read()
            .unwrap_or(0) as usize;
        if waiting == 0 {
            return None;
        }
        let mut buf = vec![0u8; waiting];
        let n = port.read(&mut buf).unwrap_or(0);
        BootLog::parse(&buf[..n])
    }

    fn connect_attempt(&mut self, reset: ResetMode, usb_jtag: bool, extra_delay: bool) -> Result<()> {
        if reset == ResetMode::NoResetNoSync {
            return Ok(());
        }

        let mut boot_log = None;
        if reset != ResetMode::NoReset {
            self.state = ConnectionState::Resetting;
            self.channel.flush_input()?;
            self.bootloader_reset(usb_jtag, extra_delay)?;
            boot_log = self.capture_boot_log();
        }

        self.state = ConnectionState::Syncing;
        let mut last_error = None;
        for _ in 0..SYNC_TRIES {
            let result = self
                .channel
                .flush_input()
                .and_then(|()| self.sync());
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Sync failed: {e}");
                    last_error = Some(e);
                    thread::sleep(SYNC_RETRY_DELAY);
                },
            }
        }
        self.state = ConnectionState::Disconnected;

        if let Some(log) = boot_log {
            let message = if log.download_mode {
                "Download mode successfully detected, but getting no sync reply: The serial TX path seems to be down.".to_string()
            } else {
                format!(
                    "Wrong boot mode detected ({})! The chip needs to be in download mode.",
                    log.boot_mode
                )
            };
            return Err(Error::ConnectionFailed(message));
        }
        Err(last_error.unwrap_or_else(|| Error::ConnectionFailed("No sync reply".into())))
    }

    /// Reset, sync, and identify the chip.
    pub fn connect(&mut self, options: &ConnectOptions) -> Result<&'static ChipProfile> {
        if matches!(options.reset, ResetMode::NoReset | ResetMode::NoResetNoSync) {
            warn!(
                "Pre-connection option \"{}\" was selected. Connection may fail if the chip is not in bootloader or flasher stub mode.",
                options.reset
            );
        }
        info!("Connecting...");

        let usb_jtag = options.reset == ResetMode::UsbReset
            || self.port().usb_pid() == Some(USB_JTAG_SERIAL_PID);
        let mut last_error = None;
        let mut attempt = 0u32;
        let mut synced = false;
        while options.attempts == 0 || attempt < options.attempts {
            if crate::is_interrupted_requested() {
                return Err(Error::Protocol("Interrupted".into()));
            }
            let extra_delay = attempt % 2 == 1;
            attempt += 1;
            match self.connect_attempt(options.reset, usb_jtag, extra_delay) {
                Ok(()) => {
                    synced = true;
                    break;
                },
                Err(e) => {
                    debug!("Connect attempt {attempt} failed: {e}");
                    last_error = Some(e);
                },
            }
        }
        if !synced {
            let target = options
                .chip
                .map_or("Espressif device", Chip::name);
            let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
            return Err(Error::ConnectionFailed(format!(
                "Failed to connect to {target}: {reason}"
            )));
        }

        let profile = if options.reset == ResetMode::NoResetNoSync {
            options
                .chip
                .ok_or_else(|| {
                    Error::Config(format!(
                        "A chip must be given with \"{}\"",
                        ResetMode::NoResetNoSync
                    ))
                })?
                .profile()
        } else {
            self.identify(options.chip)?
        };
        self.profile = Some(profile);
        self.state = ConnectionState::Synced;
        self.channel
            .set_status_len(if self.sync_stub_detected {
                2
            } else {
                profile.rom_status_len
            });

        self.run_connect_hooks()?;
        self.check_chip_id()?;
        Ok(profile)
    }

    fn identify(&mut self, requested: Option<Chip>) -> Result<&'static ChipProfile> {
        match self
            .channel
            .read_reg(CHIP_DETECT_MAGIC_REG, DEFAULT_TIMEOUT)
        {
            Ok(magic) => {
                debug!("Chip magic value 0x{magic:08x}");
                match (Chip::from_magic(magic), requested) {
                    (Some(found), Some(wanted)) if found != wanted => Err(Error::ChipMismatch {
                        detected: found.name().to_string(),
                        expected: wanted.name().to_string(),
                    }),
                    (Some(found), _) => Ok(found.profile()),
                    (None, Some(wanted)) => {
                        warn!(
                            "Unexpected chip magic value 0x{magic:08x}, continuing as {wanted}"
                        );
                        Ok(wanted.profile())
                    },
                    (None, None) => Err(Error::ChipDetectionFailed(magic)),
                }
            },
            Err(e) if e.is_unsupported_command() => {
                warn!("Chip magic register is not readable, chip is in Secure Download Mode");
                self.channel
                    .set_secure_download_mode(true);
                match requested {
                    Some(wanted) => Ok(wanted.profile()),
                    None => self.identify_secure(),
                }
            },
            Err(e) => Err(e),
        }
    }

    // Secure download mode only exists on chips with a 4-byte ROM status.
    fn identify_secure(&mut self) -> Result<&'static ChipProfile> {
        self.channel.set_status_len(4);
        let info = self.read_security_info()?;
        let id = info
            .chip_id
            .ok_or_else(|| {
                Error::ConnectionFailed(
                    "Chip in Secure Download Mode does not report its chip ID, give the chip explicitly".into(),
                )
            })?;
        u16::try_from(id)
            .ok()
            .and_then(Chip::from_image_chip_id)
            .map(Chip::profile)
            .ok_or_else(|| {
                Error::ConnectionFailed(format!(
                    "Unknown chip ID {id} in Secure Download Mode"
                ))
            })
    }

    fn read_security_info(&mut self) -> Result<SecurityInfo> {
        let data = self
            .channel
            .check_command(
                "get security info",
                &Command::get_security_info(),
                DEFAULT_TIMEOUT,
            )?
            .into_data();
        SecurityInfo::parse(&data)
    }

    /// Query GET_SECURITY_INFO.
    pub fn security_info(&mut self) -> Result<SecurityInfo> {
        self.require(Capability::SecurityInfo)?;
        self.read_security_info()
    }

    /// Chip ID from the security info reply.
    pub fn chip_id(&mut self) -> Result<u32> {
        self.require(Capability::ChipId)?;
        self.read_security_info()?
            .chip_id
            .ok_or_else(|| Error::Protocol("Security info carries no chip ID".into()))
    }

    fn check_chip_id(&mut self) -> Result<()> {
        let profile = self.profile()?;
        if !self.supports(Capability::ChipId) {
            return Ok(());
        }
        let id = match self.chip_id() {
            Ok(id) => id,
            Err(e) if e.is_unsupported_command() => {
                debug!("Chip ID check skipped: {e}");
                return Ok(());
            },
            Err(e) => return Err(e),
        };

        if let Some((_, name)) = UNSUPPORTED_CHIPS
            .iter()
            .find(|(unsupported, _)| u32::from(*unsupported) == id)
        {
            warn!("Chip {name} is not supported, operations may fail");
        }
        if let Some(expected) = profile.image_chip_id {
            if id != u32::from(expected) {
                warn!(
                    "Chip ID {id} doesn't match expected Chip ID {expected} for {}. romflash may not work correctly.",
                    profile.name
                );
                self.stub_is_disabled = true;
            }
        }
        Ok(())
    }

    /// Console peripheral, read from the ROM once per session.
    pub fn console(&mut self) -> Result<Console> {
        if let Some(console) = self.console {
            return Ok(console);
        }
        let profile = self.profile()?;
        let console = match profile.usb {
            Some(usb) if !self.secure_download_mode() => {
                let buf_no = self
                    .channel
                    .read_reg(usb.buf_no_reg, DEFAULT_TIMEOUT)?
                    & 0xff;
                if usb.otg == Some(buf_no) {
                    Console::UsbOtg
                } else if usb.jtag_serial == Some(buf_no) {
                    Console::UsbJtagSerial
                } else {
                    Console::Uart
                }
            },
            _ => Console::Uart,
        };
        debug!("Console is {console:?}");
        self.console = Some(console);
        Ok(console)
    }

    fn run_connect_hooks(&mut self) -> Result<()> {
        let profile = self.profile()?;
        for hook in profile.connect_hooks {
            match hook {
                ConnectHook::UsbOtgRamBlock => {
                    if let (Console::UsbOtg, Some(usb)) = (self.console()?, profile.usb) {
                        self.ram_block = usb.otg_ram_block;
                    }
                },
                ConnectHook::DisableWatchdogs => {
                    if !self.sync_stub_detected && self.console()? == Console::UsbJtagSerial {
                        self.disable_watchdogs()?;
                    }
                },
            }
        }
        Ok(())
    }

    fn disable_watchdogs(&mut self) -> Result<()> {
        let Some(wdt) = self.profile()?.rtc_watchdog else {
            return Ok(());
        };
        debug!("Disabling RTC watchdog and enabling super watchdog auto-feed");
        self.channel
            .write_reg(wdt.write_protect, RTC_WDT_WKEY)?;
        self.channel
            .write_reg(wdt.config0, 0)?;
        self.channel
            .write_reg(wdt.write_protect, 0)?;

        if let Some((conf, protect)) = wdt.swd {
            self.channel
                .write_reg(protect, RTC_SWD_WKEY)?;
            let value = self
                .channel
                .read_reg(conf, DEFAULT_TIMEOUT)?;
            self.channel
                .write_reg(conf, value | RTC_SWD_AUTO_FEED_EN)?;
            self.channel
                .write_reg(protect, 0)?;
        }
        Ok(())
    }

    /// Crystal frequency in MHz.
    pub fn crystal_freq(&mut self) -> Result<u32> {
        match self.profile()?.crystal {
            CrystalStrategy::Fixed(mhz) => Ok(mhz),
            CrystalStrategy::UartDivider { divider } => {
                let reg = self.profile()?.uart_clkdiv_reg;
                let clkdiv = self
                    .channel
                    .read_reg(reg, DEFAULT_TIMEOUT)?
                    & UART_CLKDIV_MASK;
                let baud = f64::from(self.port().baud_rate());
                let estimate = baud * f64::from(clkdiv) / 1e6 / f64::from(divider);
                Ok(ChipProfile::normalize_crystal(estimate))
            },
        }
    }

    /// Switch both ends of the link to `baud`.
    pub fn change_baud(&mut self, baud: u32) -> Result<()> {
        self.require(Capability::ChangeBaud)?;
        info!("Changing baud rate to {baud}");
        let current = match self.mode() {
            LoaderMode::Stub => self.port().baud_rate(),
            LoaderMode::Rom => 0,
        };
        self.channel
            .check_command(
                "change baud rate",
                &Command::change_baudrate(baud, current),
                DEFAULT_TIMEOUT,
            )?;
        info!("Changed.");
        self.channel
            .port_mut()
            .set_baud_rate(baud)?;
        thread::sleep(BAUD_CHANGE_DELAY);
        self.channel.flush_input()
    }

    /// Reset the chip into its application.
    pub fn hard_reset(&mut self) -> Result<()> {
        info!("Hard resetting via RTS pin...");
        match self.profile()?.hard_reset {
            HardResetStrategy::Rts => self.rts_reset(false),
            HardResetStrategy::RtcWatchdogOnUsbJtag => {
                if self.console()? == Console::UsbJtagSerial {
                    self.rtc_wdt_reset()
                } else {
                    self.rts_reset(false)
                }
            },
            HardResetStrategy::RtcWatchdogOnUsbOtg {
                clear_force_download,
                include_jtag_serial,
            } => {
                let console = self.console()?;
                let over_usb = console == Console::UsbOtg
                    || (include_jtag_serial && console == Console::UsbJtagSerial);
                if clear_force_download {
                    if let Some(straps) = self.profile()?.straps {
                        if let Err(e) = self.channel.write_reg_masked(
                            straps.rtc_option1,
                            0,
                            RTC_FORCE_DOWNLOAD_BOOT_MASK,
                        ) {
                            debug!("Clearing force-download boot failed: {e}");
                        }
                    }
                }
                if over_usb && self.watchdog_reset_allowed()? {
                    self.rtc_wdt_reset()
                } else {
                    self.rts_reset(console == Console::UsbOtg)
                }
            },
        }
    }

    fn watchdog_reset_allowed(&mut self) -> Result<bool> {
        let Some(straps) = self.profile()?.straps else {
            return Ok(true);
        };
        let strap = self
            .channel
            .read_reg(straps.gpio_strap, DEFAULT_TIMEOUT)?;
        let option1 = self
            .channel
            .read_reg(straps.rtc_option1, DEFAULT_TIMEOUT)?;
        Ok(strap & GPIO_STRAP_SPI_BOOT_MASK == 0 && option1 & RTC_FORCE_DOWNLOAD_BOOT_MASK == 0)
    }

    fn rts_reset(&mut self, usb_otg: bool) -> Result<()> {
        self.set_rts(true)?;
        if usb_otg {
            thread::sleep(USB_OTG_RESET_DELAY);
            self.set_rts(false)?;
            thread::sleep(USB_OTG_RESET_DELAY);
        } else {
            thread::sleep(RESET_HOLD);
            self.set_rts(false)?;
        }
        Ok(())
    }

    /// Reset through the RTC watchdog.
    pub fn rtc_wdt_reset(&mut self) -> Result<()> {
        let wdt = self
            .profile()?
            .rtc_watchdog
            .ok_or_else(|| Error::Unsupported("RTC watchdog reset".into()))?;
        debug!("Hard resetting with RTC WDT");
        self.channel
            .write_reg(wdt.write_protect, RTC_WDT_WKEY)?;
        self.channel
            .write_reg(wdt.config1, 5000)?;
        self.channel
            .write_reg(wdt.config0, (1 << 31) | (5 << 28) | (1 << 8) | 2)?;
        self.channel
            .write_reg(wdt.write_protect, 0)
    }
}

#[cfg(test)]
impl Connection<crate::port::mock::MockPort> {
    /// A session already talking to `chip` in `mode`, without any wire traffic.
    pub(crate) fn synced(chip: Chip, mode: LoaderMode) -> Self {
        let profile = chip.profile();
        let mut conn = Self::new(crate::port::mock::MockPort::new());
        conn.profile = Some(profile);
        conn.console = Some(Console::Uart);
        conn.state = match mode {
            LoaderMode::Rom => ConnectionState::Synced,
            LoaderMode::Stub => ConnectionState::StubRunning,
        };
        conn.channel.set_status_len(profile.status_len(mode));
        conn
    }
}
