//! romflash CLI - Command-line tool for ESP8266 and ESP32-family bootloaders.
//!
//! ## Features
//!
//! - Write, read, verify and erase SPI flash
//! - Load images into RAM
//! - Inspect firmware images and convert ELF files to images
//! - Automatic serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use romflash::{AfterMode, ResetMode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors the CLI raises itself, mapped to distinct exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// The user interrupted the operation.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for an error returned from [`run`].
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

/// romflash - A cross-platform serial bootloader client for ESP8266 and ESP32-family chips.
///
/// Environment variables:
///   ROMFLASH_PORT               - Default serial port
///   ROMFLASH_BAUD               - Baud rate to switch to after connecting
///   ROMFLASH_CHIP               - Expected chip type
///   ROMFLASH_STUB               - Stub loader file
///   ROMFLASH_CONNECT_ATTEMPTS   - Connection attempts (0 = keep trying)
#[derive(Parser)]
#[command(name = "romflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    romflash -p /dev/ttyUSB0 write-flash 0x1000 bootloader.bin 0x10000 app.bin\n  \
    romflash image-info app.bin\n  \
    romflash --chip esp32c3 elf2image app.elf")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ROMFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate to switch to once connected.
    #[arg(short, long, global = true, env = "ROMFLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Target chip type.
    #[arg(
        short,
        long,
        global = true,
        value_enum,
        default_value = "auto",
        env = "ROMFLASH_CHIP"
    )]
    pub(crate) chip: ChipArg,

    /// How to reset the chip into the bootloader.
    #[arg(long, global = true, value_enum)]
    pub(crate) before: Option<BeforeArg>,

    /// What to do with the chip when done.
    #[arg(long, global = true, value_enum)]
    pub(crate) after: Option<AfterArg>,

    /// Number of connection attempts (0 keeps trying).
    #[arg(long, global = true, env = "ROMFLASH_CONNECT_ATTEMPTS")]
    pub(crate) connect_attempts: Option<u32>,

    /// Stay with the ROM loader instead of running the stub.
    #[arg(long, global = true)]
    pub(crate) no_stub: bool,

    /// Stub loader file.
    #[arg(long, global = true, value_name = "PATH", env = "ROMFLASH_STUB")]
    pub(crate) stub: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Supported chip types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ChipArg {
    /// Detect the chip when connecting.
    Auto,
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

impl ChipArg {
    /// The chip, or `None` for auto.
    pub(crate) fn chip(self) -> Option<romflash::Chip> {
        match self {
            Self::Auto => None,
            Self::Esp8266 => Some(romflash::Chip::Esp8266),
            Self::Esp32 => Some(romflash::Chip::Esp32),
            Self::Esp32s2 => Some(romflash::Chip::Esp32s2),
            Self::Esp32s3 => Some(romflash::Chip::Esp32s3),
            Self::Esp32c3 => Some(romflash::Chip::Esp32c3),
        }
    }
}

/// Reset before connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum BeforeArg {
    /// Classic DTR/RTS auto-reset.
    DefaultReset,
    /// USB-JTAG-Serial reset.
    UsbReset,
    /// Sync without resetting.
    NoReset,
    /// Neither reset nor sync.
    NoResetNoSync,
}

impl From<BeforeArg> for ResetMode {
    fn from(arg: BeforeArg) -> Self {
        match arg {
            BeforeArg::DefaultReset => Self::DefaultReset,
            BeforeArg::UsbReset => Self::UsbReset,
            BeforeArg::NoReset => Self::NoReset,
            BeforeArg::NoResetNoSync => Self::NoResetNoSync,
        }
    }
}

/// Reset after the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum AfterArg {
    /// Reset into the application.
    HardReset,
    /// Jump to the application through the loader.
    SoftReset,
    /// Stay in the bootloader.
    NoReset,
    /// Stay in the bootloader with the stub running.
    NoResetStub,
}

impl From<AfterArg> for AfterMode {
    fn from(arg: AfterArg) -> Self {
        match arg {
            AfterArg::HardReset => Self::HardReset,
            AfterArg::SoftReset => Self::SoftReset,
            AfterArg::NoReset => Self::NoReset,
            AfterArg::NoResetStub => Self::NoResetStub,
        }
    }
}

/// Flash mode, frequency and size for image headers.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct FlashParamArgs {
    /// SPI flash mode (qio, qout, dio, dout, keep).
    #[arg(short = 'm', long = "flash-mode")]
    pub(crate) mode: Option<String>,

    /// SPI flash frequency (80m, 40m, 26m, 20m, keep).
    #[arg(short = 'f', long = "flash-freq")]
    pub(crate) freq: Option<String>,

    /// SPI flash size (e.g. 4MB, detect, keep).
    #[arg(short = 's', long = "flash-size")]
    pub(crate) size: Option<String>,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Write binary files to flash.
    WriteFlash {
        /// Address and file pairs, e.g. `0x1000 bootloader.bin 0x10000 app.bin`.
        #[arg(required = true, num_args = 2.., value_name = "ADDR FILE")]
        addr_files: Vec<String>,

        /// Erase the whole flash before writing.
        #[arg(long)]
        erase_all: bool,

        /// Send data uncompressed.
        #[arg(long, short = 'u')]
        no_compress: bool,

        /// Write through flash encryption.
        #[arg(long)]
        encrypt: bool,

        /// Verify every file against flash once written.
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        params: FlashParamArgs,
    },

    /// Read flash contents to a file.
    ReadFlash {
        /// Start address.
        #[arg(value_parser = parse_int)]
        address: u32,

        /// Number of bytes to read.
        #[arg(value_parser = parse_int)]
        size: u32,

        /// Output file.
        output: PathBuf,
    },

    /// Erase the whole flash.
    EraseFlash,

    /// Erase a region of flash.
    EraseRegion {
        /// Start address, a multiple of 4096.
        #[arg(value_parser = parse_int)]
        address: u32,

        /// Number of bytes, a multiple of 4096.
        #[arg(value_parser = parse_int)]
        size: u32,
    },

    /// Compare files against flash contents.
    VerifyFlash {
        /// Address and file pairs.
        #[arg(required = true, num_args = 2.., value_name = "ADDR FILE")]
        addr_files: Vec<String>,

        /// Show the differing bytes.
        #[arg(long)]
        diff: bool,

        #[command(flatten)]
        params: FlashParamArgs,
    },

    /// Load a firmware image into RAM and run it.
    LoadRam {
        /// Firmware image file.
        file: PathBuf,
    },

    /// Print the chip ID.
    ChipId,

    /// Print the SPI flash manufacturer and device ID.
    FlashId,

    /// Print security information.
    GetSecurityInfo,

    /// Show information about a firmware image file.
    ImageInfo {
        /// Firmware image file.
        file: PathBuf,
    },

    /// Convert an ELF file to a firmware image.
    Elf2image {
        /// Input ELF file.
        input: PathBuf,

        /// Output file (prefix for ESP8266).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// SPI flash mode.
        #[arg(short = 'm', long = "flash-mode", default_value = "qio")]
        mode: String,

        /// SPI flash frequency.
        #[arg(short = 'f', long = "flash-freq", default_value = "40m")]
        freq: String,

        /// SPI flash size.
        #[arg(short = 's', long = "flash-size", default_value = "1MB")]
        size: String,

        /// Build from program headers instead of sections.
        #[arg(long)]
        use_segments: bool,

        /// Minimum chip revision.
        #[arg(long, default_value = "0")]
        min_rev: u8,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions for your shell.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a number in decimal or `0x` hexadecimal, with optional underscores.
pub(crate) fn parse_int(s: &str) -> Result<u32, String> {
    let s: String = s
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect();
    let parsed = if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|e| format!("Invalid number '{s}': {e}"))
}

/// Split `ADDR FILE ADDR FILE ...` into pairs.
pub(crate) fn parse_addr_files(args: &[String]) -> Result<Vec<(u32, PathBuf)>> {
    if args.len() % 2 != 0 {
        return Err(CliError::Usage(
            "Values must be address and file pairs, e.g. 0x1000 bootloader.bin".to_string(),
        )
        .into());
    }
    args.chunks(2)
        .map(|pair| {
            let address = parse_int(&pair[0]).map_err(CliError::Usage)?;
            Ok((address, PathBuf::from(&pair[1])))
        })
        .collect()
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    romflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::WriteFlash {
            addr_files,
            erase_all,
            no_compress,
            encrypt,
            verify,
            params,
        } => {
            let files = parse_addr_files(addr_files)?;
            let options = commands::flash::WriteArgs {
                erase_all: *erase_all,
                no_compress: *no_compress,
                encrypt: *encrypt,
                verify: *verify,
            };
            commands::flash::cmd_write_flash(cli, &config, &files, &options, params)
        },
        Commands::ReadFlash {
            address,
            size,
            output,
        } => commands::flash::cmd_read_flash(cli, &config, *address, *size, output),
        Commands::EraseFlash => commands::flash::cmd_erase_flash(cli, &config),
        Commands::EraseRegion { address, size } => {
            commands::flash::cmd_erase_region(cli, &config, *address, *size)
        },
        Commands::VerifyFlash {
            addr_files,
            diff,
            params,
        } => {
            let files = parse_addr_files(addr_files)?;
            commands::flash::cmd_verify_flash(cli, &config, &files, *diff, params)
        },
        Commands::LoadRam { file } => commands::flash::cmd_load_ram(cli, &config, file),
        Commands::ChipId => commands::info::cmd_chip_id(cli, &config),
        Commands::FlashId => commands::info::cmd_flash_id(cli, &config),
        Commands::GetSecurityInfo => commands::info::cmd_security_info(cli, &config),
        Commands::ImageInfo { file } => commands::image::cmd_image_info(cli, file),
        Commands::Elf2image {
            input,
            output,
            mode,
            freq,
            size,
            use_segments,
            min_rev,
        } => {
            let args = commands::image::Elf2ImageArgs {
                output: output.clone(),
                mode: mode.clone(),
                freq: freq.clone(),
                size: size.clone(),
                use_segments: *use_segments,
                min_rev: *min_rev,
            };
            commands::image::cmd_elf2image(cli, input, &args)
        },
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g.: romflash completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "romflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0x1000"), Ok(0x1000));
        assert_eq!(parse_int("0X10_000"), Ok(0x10000));
        assert_eq!(parse_int("4096"), Ok(4096));
        assert!(parse_int("0xZZ").is_err());
        assert!(parse_int("").is_err());
    }

    #[test]
    fn test_parse_addr_files() {
        let args: Vec<String> = ["0x1000", "boot.bin", "65536", "app.bin"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let pairs = parse_addr_files(&args).unwrap();
        assert_eq!(pairs[0], (0x1000, PathBuf::from("boot.bin")));
        assert_eq!(pairs[1], (0x10000, PathBuf::from("app.bin")));

        let err = parse_addr_files(&args[..3]).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_cli_parse_write_flash() {
        let cli = Cli::try_parse_from([
            "romflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "460800",
            "write-flash",
            "--verify",
            "-m",
            "dio",
            "0x1000",
            "boot.bin",
            "0x10000",
            "app.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(460800));
        if let Commands::WriteFlash {
            addr_files,
            verify,
            no_compress,
            params,
            ..
        } = cli.command
        {
            assert_eq!(addr_files.len(), 4);
            assert!(verify);
            assert!(!no_compress);
            assert_eq!(params.mode.as_deref(), Some("dio"));
            assert!(params.size.is_none());
        } else {
            panic!("Expected WriteFlash command");
        }
    }

    #[test]
    fn test_cli_parse_read_flash() {
        let cli = Cli::try_parse_from(["romflash", "read-flash", "0", "0x400000", "dump.bin"])
            .unwrap();
        if let Commands::ReadFlash { address, size, .. } = cli.command {
            assert_eq!(address, 0);
            assert_eq!(size, 0x400000);
        } else {
            panic!("Expected ReadFlash command");
        }
    }

    #[test]
    fn test_cli_parse_reset_modes() {
        let cli = Cli::try_parse_from([
            "romflash",
            "--before",
            "usb-reset",
            "--after",
            "no-reset-stub",
            "--chip",
            "esp32c3",
            "chip-id",
        ])
        .unwrap();
        assert_eq!(cli.before.map(ResetMode::from), Some(ResetMode::UsbReset));
        assert_eq!(cli.after.map(AfterMode::from), Some(AfterMode::NoResetStub));
        assert_eq!(cli.chip.chip(), Some(romflash::Chip::Esp32c3));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["romflash", "list-ports"]).unwrap();
        assert!(cli.baud.is_none());
        assert_eq!(cli.chip, ChipArg::Auto);
        assert!(cli.chip.chip().is_none());
        assert!(!cli.quiet);
        assert!(!cli.no_stub);
        assert!(cli.port.is_none());
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn test_cli_rejects_unknown_chip() {
        assert!(Cli::try_parse_from(["romflash", "--chip", "esp32h2", "chip-id"]).is_err());
    }

    #[test]
    fn test_cli_parse_elf2image_defaults() {
        let cli = Cli::try_parse_from(["romflash", "elf2image", "app.elf"]).unwrap();
        if let Commands::Elf2image {
            mode, freq, size, ..
        } = cli.command
        {
            assert_eq!(mode, "qio");
            assert_eq!(freq, "40m");
            assert_eq!(size, "1MB");
        } else {
            panic!("Expected Elf2image command");
        }
    }
}
