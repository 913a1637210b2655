//! Command implementations.
//!
//! Each group of subcommands lives in its own module. This module holds the
//! session plumbing they share: settings resolution, connecting and the
//! final reset.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod image;
pub(crate) mod info;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use romflash::target::chip::ESP_ROM_BAUD;
use romflash::{
    AfterMode, Chip, ConnectOptions, FlashParams, Flasher, FlasherOptions, ResetMode,
    SerialConfig, StubImage,
};

use crate::config::Config;
use crate::{Cli, CliError, FlashParamArgs, use_fancy_output, was_interrupted};

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Operation interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Serial port from the command line, the config file or auto-detection.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(ref port) = cli.port {
        return Ok(port.clone());
    }
    if let Some(ref port) = config.port.serial {
        return Ok(port.clone());
    }
    let detected = romflash::auto_detect_port()
        .context("No serial port found. Connect a board or pass --port")?;
    Ok(detected.name)
}

/// Chip from `--chip`, falling back to the config file. `None` autodetects.
pub(crate) fn resolve_chip(cli: &Cli, config: &Config) -> Result<Option<Chip>> {
    if let Some(chip) = cli.chip.chip() {
        return Ok(Some(chip));
    }
    match config.flash.chip.as_deref() {
        None | Some("auto") => Ok(None),
        Some(name) => Chip::from_name(name)
            .map(Some)
            .ok_or_else(|| CliError::Usage(format!("Unknown chip '{name}' in config file")).into()),
    }
}

/// Reset mode before connecting.
pub(crate) fn resolve_before(cli: &Cli, config: &Config) -> Result<ResetMode> {
    if let Some(before) = cli.before {
        return Ok(before.into());
    }
    match config.port.before.as_deref() {
        Some(name) => Ok(name.parse()?),
        None => Ok(ResetMode::default()),
    }
}

/// Reset mode after the operation.
pub(crate) fn resolve_after(cli: &Cli, config: &Config) -> Result<AfterMode> {
    if let Some(after) = cli.after {
        return Ok(after.into());
    }
    match config.port.after.as_deref() {
        Some(name) => Ok(name.parse()?),
        None => Ok(AfterMode::default()),
    }
}

/// Header parameters from the flags, the config file, then `keep`.
pub(crate) fn resolve_flash_params(args: &FlashParamArgs, config: &Config) -> Result<FlashParams> {
    let pick = |arg: &Option<String>, cfg: &Option<String>| {
        arg.clone()
            .or_else(|| cfg.clone())
            .unwrap_or_else(|| "keep".to_string())
    };
    let mode = pick(&args.mode, &config.flash.mode);
    let freq = pick(&args.freq, &config.flash.freq);
    let size = pick(&args.size, &config.flash.size);
    Ok(FlashParams::from_args(&mode, &freq, &size)?)
}

/// Flasher options for this invocation.
pub(crate) fn flasher_options(cli: &Cli, config: &Config) -> Result<FlasherOptions> {
    let mut connect = ConnectOptions {
        reset: resolve_before(cli, config)?,
        chip: resolve_chip(cli, config)?,
        ..ConnectOptions::default()
    };
    if let Some(attempts) = cli.connect_attempts.or(config.port.connect_attempts) {
        connect.attempts = attempts;
    }

    let stub = match cli.stub.as_ref().or(config.flash.stub.as_ref()) {
        Some(path) if !cli.no_stub => Some(
            StubImage::from_file(path)
                .with_context(|| format!("Failed to load stub {}", path.display()))?,
        ),
        _ => None,
    };

    let baud = cli
        .baud
        .or(config.port.baud)
        .filter(|baud| *baud != ESP_ROM_BAUD);

    Ok(FlasherOptions {
        connect,
        stub,
        no_stub: cli.no_stub,
        baud,
    })
}

/// Open the port and connect to the bootloader.
pub(crate) fn connect(cli: &Cli, config: &Config) -> Result<Box<dyn Flasher>> {
    let options = flasher_options(cli, config)?;
    let port = get_port(cli, config)?;
    debug!("Connect options: {:?}", options.connect);

    if !cli.quiet {
        eprintln!("{} Serial port {}", style("🔌").cyan(), port);
    }

    let mut flasher = romflash::create_flasher(&SerialConfig::new(&port, ESP_ROM_BAUD), options)?;
    if let Err(err) = ensure_not_interrupted() {
        flasher.close();
        return Err(err);
    }
    if let Err(err) = flasher.connect() {
        flasher.close();
        return Err(err.into());
    }
    if let Err(err) = ensure_not_interrupted() {
        flasher.close();
        return Err(err);
    }
    Ok(flasher)
}

/// Run `op` on a connected flasher, then apply the after-reset and close.
///
/// The port is closed on every path.
pub(crate) fn with_flasher<T>(
    cli: &Cli,
    config: &Config,
    op: impl FnOnce(&mut dyn Flasher) -> Result<T>,
) -> Result<T> {
    let after = resolve_after(cli, config)?;
    let mut flasher = connect(cli, config)?;

    let result = op(flasher.as_mut()).and_then(|value| {
        ensure_not_interrupted()?;
        flasher.reset(after)?;
        Ok(value)
    });
    flasher.close();
    result
}

/// Progress bar on stderr, hidden when quiet or not a terminal.
pub(crate) fn progress_bar(cli: &Cli, len: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}
