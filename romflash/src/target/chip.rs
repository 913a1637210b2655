//! Chip profiles.
//!
//! Everything that differs between chip families lives here as plain data:
//! detection magic values, register addresses, memory maps, flash parameters,
//! capability sets, and tags naming the few behaviours that really are
//! per-chip (crystal detection, hard reset, erase sizing, post-connect
//! hooks). The protocol engine only ever looks these records up.

use std::fmt;

/// Magic register read right after sync to identify the chip.
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

/// Flash erase sector size.
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

/// RAM download block size.
pub const ESP_RAM_BLOCK: u32 = 0x1800;

/// Flash write block size in ROM mode.
pub const ROM_FLASH_WRITE_SIZE: u32 = 0x400;

/// Flash write block size once the stub is running.
pub const STUB_FLASH_WRITE_SIZE: u32 = 0x4000;

/// Baud rate every ROM loader starts at.
pub const ESP_ROM_BAUD: u32 = 115_200;

/// Mask applied to the UART clock divider register.
pub const UART_CLKDIV_MASK: u32 = 0xFFFFF;

/// Key unlocking RTC watchdog registers.
pub const RTC_WDT_WKEY: u32 = 0x50D8_3AA1;

/// Key unlocking super-watchdog registers.
pub const RTC_SWD_WKEY: u32 = 0x8F1D_312A;

/// Auto-feed enable bit in the super-watchdog config register.
pub const RTC_SWD_AUTO_FEED_EN: u32 = 1 << 31;

/// Strap bit that is set when the chip is not booting into download mode.
pub const GPIO_STRAP_SPI_BOOT_MASK: u32 = 1 << 3;

/// Option bit forcing download boot over USB.
pub const RTC_FORCE_DOWNLOAD_BOOT_MASK: u32 = 0x1;

/// Image chip IDs of silicon known not to work.
pub const UNSUPPORTED_CHIPS: &[(u16, &str)] = &[(6, "ESP32-S3(beta 3)")];

/// Supported chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chip {
    /// ESP8266.
    Esp8266,
    /// ESP32.
    Esp32,
    /// ESP32-S2.
    Esp32s2,
    /// ESP32-S3.
    Esp32s3,
    /// ESP32-C3.
    Esp32c3,
}

impl Chip {
    /// All chips, in detection order.
    pub const ALL: [Self; 5] = [
        Self::Esp8266,
        Self::Esp32,
        Self::Esp32s2,
        Self::Esp32s3,
        Self::Esp32c3,
    ];

    /// Parse a chip name such as `esp32s3` or `ESP32-S3`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "esp8266" => Some(Self::Esp8266),
            "esp32" => Some(Self::Esp32),
            "esp32s2" => Some(Self::Esp32s2),
            "esp32s3" => Some(Self::Esp32s3),
            "esp32c3" => Some(Self::Esp32c3),
            _ => None,
        }
    }

    /// Chip whose profile lists `magic`.
    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|chip| {
                chip.profile()
                    .magic_values
                    .contains(&magic)
            })
    }

    /// Chip with the given image chip ID.
    pub fn from_image_chip_id(id: u16) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|chip| chip.profile().image_chip_id == Some(id))
    }

    /// Static profile for this chip.
    pub fn profile(self) -> &'static ChipProfile {
        match self {
            Self::Esp8266 => &ESP8266,
            Self::Esp32 => &ESP32,
            Self::Esp32s2 => &ESP32S2,
            Self::Esp32s3 => &ESP32S3,
            Self::Esp32c3 => &ESP32C3,
        }
    }

    /// Display name, e.g. `ESP32-S3`.
    pub fn name(self) -> &'static str {
        self.profile().name
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which loader is answering commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    /// Mask ROM bootloader.
    Rom,
    /// RAM stub loader.
    Stub,
}

/// Operations that only some chip/loader combinations implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// FLASH_DEFL_* commands.
    CompressedWrite,
    /// SPI_FLASH_MD5.
    Md5,
    /// CHANGE_BAUDRATE.
    ChangeBaud,
    /// ERASE_FLASH.
    EraseFlash,
    /// ERASE_REGION.
    EraseRegion,
    /// Streamed READ_FLASH.
    ReadFlash,
    /// READ_FLASH_SLOW.
    ReadFlashSlow,
    /// GET_SECURITY_INFO.
    SecurityInfo,
    /// Chip ID inside the security info reply.
    ChipId,
    /// FLASH_BEGIN carries an "encrypted" word and encrypted blocks use FLASH_DATA.
    EncryptedBeginFlag,
    /// FLASH_ENCRYPT_DATA.
    EncryptedWrite,
    /// RUN_USER_CODE.
    RunUserCode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CompressedWrite => "compressed flash writes",
            Self::Md5 => "flash MD5 checks",
            Self::ChangeBaud => "changing baud rate",
            Self::EraseFlash => "erasing the whole flash",
            Self::EraseRegion => "erasing a flash region",
            Self::ReadFlash => "reading flash",
            Self::ReadFlashSlow => "slow flash reads",
            Self::SecurityInfo => "security info",
            Self::ChipId => "chip ID",
            Self::EncryptedBeginFlag => "encrypted flash begin",
            Self::EncryptedWrite => "encrypted flash writes",
            Self::RunUserCode => "running user code",
        };
        f.write_str(name)
    }
}

/// Named address range in the chip's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Inclusive start.
    pub start: u32,
    /// Exclusive end.
    pub end: u32,
    /// Region name such as `DRAM` or `IROM`.
    pub name: &'static str,
}

const fn region(start: u32, end: u32, name: &'static str) -> MemoryRegion {
    MemoryRegion { start, end, name }
}

/// SPI controller registers used to run raw flash commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRegisters {
    /// Controller base address.
    pub base: u32,
    /// `SPI_USR` offset.
    pub usr: u32,
    /// `SPI_USR1` offset.
    pub usr1: u32,
    /// `SPI_USR2` offset.
    pub usr2: u32,
    /// `SPI_W0` offset.
    pub w0: u32,
    /// `SPI_MOSI_DLEN` offset, absent on ESP8266.
    pub mosi_dlen: Option<u32>,
    /// `SPI_MISO_DLEN` offset, absent on ESP8266.
    pub miso_dlen: Option<u32>,
}

/// ROM variable telling which peripheral carries the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbConsole {
    /// Address of `UARTDEV_BUF_NO`.
    pub buf_no_reg: u32,
    /// Value meaning USB-OTG.
    pub otg: Option<u32>,
    /// Value meaning USB-JTAG-Serial.
    pub jtag_serial: Option<u32>,
    /// RAM block size to use over USB-OTG.
    pub otg_ram_block: u32,
}

/// RTC watchdog registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcWatchdog {
    /// `WDTCONFIG0`.
    pub config0: u32,
    /// `WDTCONFIG1`.
    pub config1: u32,
    /// `WDTWPROTECT`.
    pub write_protect: u32,
    /// Super-watchdog `(SWD_CONF, SWD_WPROTECT)`, where present.
    pub swd: Option<(u32, u32)>,
}

/// Boot strapping registers consulted before a watchdog reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrapRegisters {
    /// `GPIO_STRAP`.
    pub gpio_strap: u32,
    /// `RTC_CNTL_OPTION1`.
    pub rtc_option1: u32,
}

/// How to find the crystal frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrystalStrategy {
    /// Estimate from the UART divider and the current baud rate.
    UartDivider {
        /// Bus-to-crystal ratio.
        divider: u32,
    },
    /// The crystal is always this many MHz.
    Fixed(u32),
}

/// How to reset into the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardResetStrategy {
    /// Pulse RTS (EN).
    Rts,
    /// RTC watchdog reset when the console is USB-JTAG-Serial.
    RtcWatchdogOnUsbJtag,
    /// RTC watchdog reset over USB when strapping allows it.
    RtcWatchdogOnUsbOtg {
        /// Clear the force-download option bit first.
        clear_force_download: bool,
        /// Treat USB-JTAG-Serial like USB-OTG.
        include_jtag_serial: bool,
    },
}

/// How FLASH_BEGIN's erase size is derived from the write size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSizePolicy {
    /// Erase exactly what is written.
    Exact,
    /// Round the size up to whole sectors.
    SectorAligned,
    /// Compensate for the ESP8266 ROM erasing 16-sector blocks twice.
    Esp8266RomBug,
}

impl EraseSizePolicy {
    /// Erase size to request for a write of `size` bytes at `offset`.
    pub fn erase_size(self, offset: u32, size: u32) -> u32 {
        match self {
            Self::Exact => size,
            Self::SectorAligned => size.div_ceil(FLASH_SECTOR_SIZE) * FLASH_SECTOR_SIZE,
            Self::Esp8266RomBug => {
                const SECTORS_PER_BLOCK: u32 = 16;
                let num_sectors = size.div_ceil(FLASH_SECTOR_SIZE);
                let start_sector = offset / FLASH_SECTOR_SIZE;
                let head_sectors =
                    (SECTORS_PER_BLOCK - start_sector % SECTORS_PER_BLOCK).min(num_sectors);
                if num_sectors < 2 * head_sectors {
                    num_sectors.div_ceil(2) * FLASH_SECTOR_SIZE
                } else {
                    (num_sectors - head_sectors) * FLASH_SECTOR_SIZE
                }
            },
        }
    }
}

/// Work done right after the chip is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectHook {
    /// Shrink RAM blocks when the console runs over USB-OTG.
    UsbOtgRamBlock,
    /// Disable the RTC watchdog and auto-feed the super watchdog on USB-JTAG.
    DisableWatchdogs,
}

/// Work done after the SPI flash is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashHook {
    /// Bring XMC flash chips out of a bad power-up state.
    XmcStartup,
}

/// Firmware image container flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// ESP8266 V1 image, IROM written separately.
    Esp8266,
    /// ESP32-family image with extended header.
    Esp32,
}

/// Immutable description of one chip family.
#[derive(Debug)]
pub struct ChipProfile {
    /// Chip this profile describes.
    pub chip: Chip,
    /// Display name.
    pub name: &'static str,
    /// Values of [`CHIP_DETECT_MAGIC_REG`] identifying this chip.
    pub magic_values: &'static [u32],
    /// Chip ID used in image headers and security info.
    pub image_chip_id: Option<u16>,
    /// Status bytes per response in ROM mode.
    pub rom_status_len: usize,
    /// UART clock divider register.
    pub uart_clkdiv_reg: u32,
    /// eFuse block base, where known.
    pub efuse_base: Option<u32>,
    /// SPI controller registers.
    pub spi: SpiRegisters,
    /// Flash offset of the second-stage bootloader.
    pub bootloader_offset: u32,
    /// Flash-mapped instruction bus window.
    pub irom_map: (u32, u32),
    /// Flash-mapped data bus window.
    pub drom_map: Option<(u32, u32)>,
    /// Named memory ranges.
    pub memory_map: &'static [MemoryRegion],
    /// Alignment of encrypted writes.
    pub encrypted_write_align: u32,
    /// Flash size names and their header nibble.
    pub flash_sizes: &'static [(&'static str, u8)],
    /// Console detection registers.
    pub usb: Option<UsbConsole>,
    /// RTC watchdog registers.
    pub rtc_watchdog: Option<RtcWatchdog>,
    /// Strapping registers.
    pub straps: Option<StrapRegisters>,
    /// Crystal detection.
    pub crystal: CrystalStrategy,
    /// Hard reset flavour.
    pub hard_reset: HardResetStrategy,
    /// Erase sizing in ROM mode; the stub always erases exactly.
    pub rom_erase_policy: EraseSizePolicy,
    /// Post-connect hooks.
    pub connect_hooks: &'static [ConnectHook],
    /// Post-attach flash hooks.
    pub flash_hooks: &'static [FlashHook],
    /// Capabilities of the ROM loader.
    pub rom_capabilities: &'static [Capability],
    /// Capabilities of the stub loader.
    pub stub_capabilities: &'static [Capability],
    /// Image container flavour.
    pub image_format: ImageFormat,
}

impl ChipProfile {
    /// Whether `capability` is available in `mode`.
    pub fn supports(&self, capability: Capability, mode: LoaderMode) -> bool {
        match mode {
            LoaderMode::Rom => self.rom_capabilities,
            LoaderMode::Stub => self.stub_capabilities,
        }
        .contains(&capability)
    }

    /// Status byte count for responses from `mode`.
    pub fn status_len(&self, mode: LoaderMode) -> usize {
        match mode {
            LoaderMode::Rom => self.rom_status_len,
            LoaderMode::Stub => 2,
        }
    }

    /// Flash write block size for `mode`.
    pub fn flash_write_size(&self, mode: LoaderMode) -> u32 {
        match mode {
            LoaderMode::Rom => ROM_FLASH_WRITE_SIZE,
            LoaderMode::Stub => STUB_FLASH_WRITE_SIZE,
        }
    }

    /// Erase size FLASH_BEGIN should request.
    pub fn erase_size(&self, mode: LoaderMode, offset: u32, size: u32) -> u32 {
        match mode {
            LoaderMode::Rom => self.rom_erase_policy,
            LoaderMode::Stub => EraseSizePolicy::Exact,
        }
        .erase_size(offset, size)
    }

    /// Whether `address` falls in a flash-mapped window.
    pub fn is_flash_address(&self, address: u32) -> bool {
        let in_window = |(start, end): (u32, u32)| start <= address && address < end;
        in_window(self.irom_map) || self.drom_map.is_some_and(in_window)
    }

    /// Names of all memory regions containing `address`.
    pub fn memory_types(&self, address: u32) -> Vec<&'static str> {
        self.memory_map
            .iter()
            .filter(|r| r.start <= address && address < r.end)
            .map(|r| r.name)
            .collect()
    }

    /// Header nibble for a flash size name.
    pub fn flash_size_code(&self, name: &str) -> Option<u8> {
        self.flash_sizes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, code)| *code)
    }

    /// Flash size name for a header nibble.
    pub fn flash_size_name(&self, code: u8) -> Option<&'static str> {
        self.flash_sizes
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(n, _)| *n)
    }

    /// Normalize a crystal estimate in MHz, warning on odd values.
    pub fn normalize_crystal(estimate_mhz: f64) -> u32 {
        let normalized = if estimate_mhz > 33.0 { 40 } else { 26 };
        if (f64::from(normalized) - estimate_mhz).abs() > 1.0 {
            log::warn!(
                "Detected crystal freq {estimate_mhz:.2}MHz is quite different to normalized freq {normalized}MHz. Unsupported crystal in use?"
            );
        }
        normalized
    }
}

const ESP8266_FLASH_SIZES: &[(&str, u8)] = &[
    ("512KB", 0x00),
    ("256KB", 0x10),
    ("1MB", 0x20),
    ("2MB", 0x30),
    ("4MB", 0x40),
    ("2MB-c1", 0x50),
    ("4MB-c1", 0x60),
    ("8MB", 0x80),
    ("16MB", 0x90),
];

const ESP32_FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
    ("32MB", 0x50),
    ("64MB", 0x60),
    ("128MB", 0x70),
];

const ESP32_FAMILY_SPI: SpiRegisters = SpiRegisters {
    base: 0x6000_2000,
    usr: 0x18,
    usr1: 0x1C,
    usr2: 0x20,
    w0: 0x58,
    mosi_dlen: Some(0x24),
    miso_dlen: Some(0x28),
};

static ESP8266: ChipProfile = ChipProfile {
    chip: Chip::Esp8266,
    name: "ESP8266",
    magic_values: &[0xFFF0_C101],
    image_chip_id: None,
    rom_status_len: 2,
    uart_clkdiv_reg: 0x6000_0014,
    efuse_base: None,
    spi: SpiRegisters {
        base: 0x6000_0200,
        usr: 0x1C,
        usr1: 0x20,
        usr2: 0x24,
        w0: 0x40,
        mosi_dlen: None,
        miso_dlen: None,
    },
    bootloader_offset: 0,
    irom_map: (0x4020_0000, 0x4030_0000),
    drom_map: None,
    memory_map: &[
        region(0x3FF0_0000, 0x3FF0_0010, "DPORT"),
        region(0x3FFE_8000, 0x4000_0000, "DRAM"),
        region(0x4010_0000, 0x4010_8000, "IRAM"),
        region(0x4020_1010, 0x402E_1010, "IROM"),
    ],
    encrypted_write_align: 32,
    flash_sizes: ESP8266_FLASH_SIZES,
    usb: None,
    rtc_watchdog: None,
    straps: None,
    crystal: CrystalStrategy::UartDivider { divider: 2 },
    hard_reset: HardResetStrategy::Rts,
    rom_erase_policy: EraseSizePolicy::Esp8266RomBug,
    connect_hooks: &[],
    flash_hooks: &[FlashHook::XmcStartup],
    rom_capabilities: &[],
    stub_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::EraseFlash,
        Capability::EraseRegion,
        Capability::ReadFlash,
        Capability::RunUserCode,
    ],
    image_format: ImageFormat::Esp8266,
};

static ESP32: ChipProfile = ChipProfile {
    chip: Chip::Esp32,
    name: "ESP32",
    magic_values: &[0x00F0_1D83],
    image_chip_id: Some(0),
    rom_status_len: 4,
    uart_clkdiv_reg: 0x3FF4_0014,
    efuse_base: Some(0x3FF5_A000),
    spi: SpiRegisters {
        base: 0x3FF4_2000,
        usr: 0x1C,
        usr1: 0x20,
        usr2: 0x24,
        w0: 0x80,
        mosi_dlen: Some(0x28),
        miso_dlen: Some(0x2C),
    },
    bootloader_offset: 0x1000,
    irom_map: (0x400D_0000, 0x4040_0000),
    drom_map: Some((0x3F40_0000, 0x3F80_0000)),
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, "PADDING"),
        region(0x3F40_0000, 0x3F80_0000, "DROM"),
        region(0x3F80_0000, 0x3FC0_0000, "EXTRAM_DATA"),
        region(0x3FF8_0000, 0x3FF8_2000, "RTC_DRAM"),
        region(0x3FF9_0000, 0x4000_0000, "BYTE_ACCESSIBLE"),
        region(0x3FFA_E000, 0x4000_0000, "DRAM"),
        region(0x3FFE_0000, 0x3FFF_FFFC, "DIRAM_DRAM"),
        region(0x4000_0000, 0x4007_0000, "IROM"),
        region(0x4007_0000, 0x4007_8000, "CACHE_PRO"),
        region(0x4007_8000, 0x4008_0000, "CACHE_APP"),
        region(0x4008_0000, 0x400A_0000, "IRAM"),
        region(0x400A_0000, 0x400B_FFFC, "DIRAM_IRAM"),
        region(0x400C_0000, 0x400C_2000, "RTC_IRAM"),
        region(0x400D_0000, 0x4040_0000, "IROM"),
        region(0x5000_0000, 0x5000_2000, "RTC_DATA"),
    ],
    encrypted_write_align: 32,
    flash_sizes: ESP32_FLASH_SIZES,
    usb: None,
    rtc_watchdog: None,
    straps: None,
    crystal: CrystalStrategy::UartDivider { divider: 1 },
    hard_reset: HardResetStrategy::Rts,
    rom_erase_policy: EraseSizePolicy::SectorAligned,
    connect_hooks: &[],
    flash_hooks: &[FlashHook::XmcStartup],
    rom_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::ReadFlashSlow,
    ],
    stub_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::EraseFlash,
        Capability::EraseRegion,
        Capability::ReadFlash,
        Capability::EncryptedWrite,
    ],
    image_format: ImageFormat::Esp32,
};

static ESP32S2: ChipProfile = ChipProfile {
    chip: Chip::Esp32s2,
    name: "ESP32-S2",
    magic_values: &[0x0000_07C6],
    image_chip_id: Some(2),
    rom_status_len: 4,
    uart_clkdiv_reg: 0x3F40_0014,
    efuse_base: Some(0x3F41_A000),
    spi: SpiRegisters {
        base: 0x3F40_2000,
        ..ESP32_FAMILY_SPI
    },
    bootloader_offset: 0x1000,
    irom_map: (0x4008_0000, 0x40B8_0000),
    drom_map: Some((0x3F00_0000, 0x3F3F_0000)),
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, "PADDING"),
        region(0x3F00_0000, 0x3FF8_0000, "DROM"),
        region(0x3F50_0000, 0x3FF8_0000, "EXTRAM_DATA"),
        region(0x3FF9_E000, 0x3FFA_0000, "RTC_DRAM"),
        region(0x3FF9_E000, 0x4000_0000, "BYTE_ACCESSIBLE"),
        region(0x3FF9_E000, 0x4007_2000, "MEM_INTERNAL"),
        region(0x3FFB_0000, 0x4000_0000, "DRAM"),
        region(0x4000_0000, 0x4001_A100, "IROM_MASK"),
        region(0x4002_0000, 0x4007_0000, "IRAM"),
        region(0x4007_0000, 0x4007_2000, "RTC_IRAM"),
        region(0x4008_0000, 0x4080_0000, "IROM"),
        region(0x5000_0000, 0x5000_2000, "RTC_DATA"),
    ],
    encrypted_write_align: 16,
    flash_sizes: ESP32_FLASH_SIZES,
    usb: Some(UsbConsole {
        buf_no_reg: 0x3FFF_FD14,
        otg: Some(2),
        jtag_serial: None,
        otg_ram_block: 0x800,
    }),
    rtc_watchdog: Some(RtcWatchdog {
        config0: 0x3F40_8094,
        config1: 0x3F40_8098,
        write_protect: 0x3F40_80AC,
        swd: None,
    }),
    straps: Some(StrapRegisters {
        gpio_strap: 0x3F40_4038,
        rtc_option1: 0x3F40_8128,
    }),
    crystal: CrystalStrategy::Fixed(40),
    hard_reset: HardResetStrategy::RtcWatchdogOnUsbOtg {
        clear_force_download: false,
        include_jtag_serial: false,
    },
    rom_erase_policy: EraseSizePolicy::SectorAligned,
    connect_hooks: &[ConnectHook::UsbOtgRamBlock],
    flash_hooks: &[FlashHook::XmcStartup],
    rom_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::ReadFlashSlow,
        Capability::SecurityInfo,
        Capability::EncryptedBeginFlag,
    ],
    stub_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::EraseFlash,
        Capability::EraseRegion,
        Capability::ReadFlash,
        Capability::EncryptedWrite,
        Capability::SecurityInfo,
    ],
    image_format: ImageFormat::Esp32,
};

static ESP32S3: ChipProfile = ChipProfile {
    chip: Chip::Esp32s3,
    name: "ESP32-S3",
    magic_values: &[0x9],
    image_chip_id: Some(9),
    rom_status_len: 4,
    uart_clkdiv_reg: 0x6000_0014,
    efuse_base: Some(0x6000_7000),
    spi: ESP32_FAMILY_SPI,
    bootloader_offset: 0,
    irom_map: (0x4200_0000, 0x4400_0000),
    drom_map: Some((0x3C00_0000, 0x3E00_0000)),
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, "PADDING"),
        region(0x3C00_0000, 0x3D00_0000, "DROM"),
        region(0x3D00_0000, 0x3E00_0000, "EXTRAM_DATA"),
        region(0x600F_E000, 0x6010_0000, "RTC_DRAM"),
        region(0x3FC8_8000, 0x3FD0_0000, "BYTE_ACCESSIBLE"),
        region(0x3FC8_8000, 0x403E_2000, "MEM_INTERNAL"),
        region(0x3FC8_8000, 0x3FD0_0000, "DRAM"),
        region(0x4000_0000, 0x4001_A100, "IROM_MASK"),
        region(0x4037_0000, 0x403E_0000, "IRAM"),
        region(0x600F_E000, 0x6010_0000, "RTC_IRAM"),
        region(0x4200_0000, 0x4280_0000, "IROM"),
        region(0x5000_0000, 0x5000_2000, "RTC_DATA"),
    ],
    encrypted_write_align: 16,
    flash_sizes: ESP32_FLASH_SIZES,
    usb: Some(UsbConsole {
        buf_no_reg: 0x3FCE_F14C,
        otg: Some(3),
        jtag_serial: Some(4),
        otg_ram_block: 0x800,
    }),
    rtc_watchdog: Some(RtcWatchdog {
        config0: 0x6000_8098,
        config1: 0x6000_809C,
        write_protect: 0x6000_80B0,
        swd: Some((0x6000_80B4, 0x6000_80B8)),
    }),
    straps: Some(StrapRegisters {
        gpio_strap: 0x6000_4038,
        rtc_option1: 0x6000_812C,
    }),
    crystal: CrystalStrategy::Fixed(40),
    hard_reset: HardResetStrategy::RtcWatchdogOnUsbOtg {
        clear_force_download: true,
        include_jtag_serial: true,
    },
    rom_erase_policy: EraseSizePolicy::SectorAligned,
    connect_hooks: &[ConnectHook::UsbOtgRamBlock],
    flash_hooks: &[FlashHook::XmcStartup],
    rom_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::ReadFlashSlow,
        Capability::SecurityInfo,
        Capability::ChipId,
        Capability::EncryptedBeginFlag,
    ],
    stub_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::EraseFlash,
        Capability::EraseRegion,
        Capability::ReadFlash,
        Capability::EncryptedWrite,
        Capability::SecurityInfo,
        Capability::ChipId,
    ],
    image_format: ImageFormat::Esp32,
};

static ESP32C3: ChipProfile = ChipProfile {
    chip: Chip::Esp32c3,
    name: "ESP32-C3",
    // eco 1+2, eco 3, eco 6, eco 7
    magic_values: &[0x6921_506F, 0x1B31_506F, 0x4881_606F, 0x4361_606F],
    image_chip_id: Some(5),
    rom_status_len: 4,
    uart_clkdiv_reg: 0x6000_0014,
    efuse_base: Some(0x6000_8800),
    spi: ESP32_FAMILY_SPI,
    bootloader_offset: 0,
    irom_map: (0x4200_0000, 0x4280_0000),
    drom_map: Some((0x3C00_0000, 0x3C80_0000)),
    memory_map: &[
        region(0x0000_0000, 0x0001_0000, "PADDING"),
        region(0x3C00_0000, 0x3C80_0000, "DROM"),
        region(0x3FC8_0000, 0x3FCE_0000, "DRAM"),
        region(0x3FC8_8000, 0x3FD0_0000, "BYTE_ACCESSIBLE"),
        region(0x3FF0_0000, 0x3FF2_0000, "DROM_MASK"),
        region(0x4000_0000, 0x4006_0000, "IROM_MASK"),
        region(0x4200_0000, 0x4280_0000, "IROM"),
        region(0x4037_C000, 0x403E_0000, "IRAM"),
        region(0x5000_0000, 0x5000_2000, "RTC_IRAM"),
        region(0x5000_0000, 0x5000_2000, "RTC_DRAM"),
        region(0x600F_E000, 0x6010_0000, "MEM_INTERNAL2"),
    ],
    encrypted_write_align: 16,
    flash_sizes: ESP32_FLASH_SIZES,
    usb: Some(UsbConsole {
        buf_no_reg: 0x3FCD_F07C,
        otg: None,
        jtag_serial: Some(3),
        otg_ram_block: 0x800,
    }),
    rtc_watchdog: Some(RtcWatchdog {
        config0: 0x6000_8090,
        config1: 0x6000_8094,
        write_protect: 0x6000_80A8,
        swd: Some((0x6000_80AC, 0x6000_80B0)),
    }),
    straps: None,
    crystal: CrystalStrategy::Fixed(40),
    hard_reset: HardResetStrategy::RtcWatchdogOnUsbJtag,
    rom_erase_policy: EraseSizePolicy::SectorAligned,
    connect_hooks: &[ConnectHook::DisableWatchdogs],
    flash_hooks: &[FlashHook::XmcStartup],
    rom_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::ReadFlashSlow,
        Capability::SecurityInfo,
        Capability::ChipId,
        Capability::EncryptedBeginFlag,
    ],
    stub_capabilities: &[
        Capability::CompressedWrite,
        Capability::Md5,
        Capability::ChangeBaud,
        Capability::EraseFlash,
        Capability::EraseRegion,
        Capability::ReadFlash,
        Capability::EncryptedWrite,
        Capability::SecurityInfo,
        Capability::ChipId,
    ],
    image_format: ImageFormat::Esp32,
};
