//! Offline image commands: image-info and elf2image.

use anyhow::{Context, Result};
use console::style;
use romflash::image::elf::default_output_name;
use romflash::{Elf2ImageOptions, ElfFile, FirmwareImage, FlashSize, elf2image};
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

/// Settings of the elf2image command.
#[derive(Debug, Clone)]
pub(crate) struct Elf2ImageArgs {
    pub(crate) output: Option<PathBuf>,
    pub(crate) mode: String,
    pub(crate) freq: String,
    pub(crate) size: String,
    pub(crate) use_segments: bool,
    pub(crate) min_rev: u8,
}

/// Image-info command implementation.
pub(crate) fn cmd_image_info(cli: &Cli, file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let chip = match cli.chip.chip() {
        Some(chip) => chip,
        None => FirmwareImage::guess_chip(&bytes).with_context(|| {
            format!("{} is not a firmware image (bad magic)", file.display())
        })?,
    };
    let image = FirmwareImage::from_bytes(chip, &bytes)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes)",
            style("📦").cyan(),
            file.display(),
            bytes.len()
        );
    }
    println!("{}", image.info());
    Ok(())
}

fn build_options(cli: &Cli, args: &Elf2ImageArgs) -> Result<Elf2ImageOptions> {
    let chip = cli.chip.chip().ok_or_else(|| {
        CliError::Usage("elf2image needs a target chip, e.g. --chip esp32".to_string())
    })?;

    let mut options = Elf2ImageOptions::new(chip);
    options.flash_mode = args.mode.parse()?;
    options.flash_freq = args.freq.parse()?;
    options.flash_size = match args.size.parse::<FlashSize>()? {
        FlashSize::Named(name) => name,
        _ => {
            return Err(CliError::Usage(format!(
                "elf2image needs an explicit flash size, not '{}'",
                args.size
            ))
            .into());
        },
    };
    options.min_rev = args.min_rev;
    options.min_rev_full = u16::from(args.min_rev) * 100;
    options.use_segments = args.use_segments;
    Ok(options)
}

/// Elf2image command implementation.
pub(crate) fn cmd_elf2image(cli: &Cli, input: &Path, args: &Elf2ImageArgs) -> Result<()> {
    let options = build_options(cli, args)?;
    let elf = ElfFile::from_file(input)
        .with_context(|| format!("Failed to load {}", input.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Creating {} image from {}",
            style("⚙").cyan(),
            options.chip,
            input.display()
        );
    }

    let image = elf2image(&elf, &options)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_name(options.chip, input));
    let written = image.save(&output)?;

    if !cli.quiet {
        eprintln!(
            "{} Successfully created {} image",
            style("✓").green(),
            options.chip
        );
    }
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use romflash::{Chip, FlashFreq, FlashMode};

    fn args() -> Elf2ImageArgs {
        Elf2ImageArgs {
            output: None,
            mode: "dio".to_string(),
            freq: "80m".to_string(),
            size: "4mb".to_string(),
            use_segments: true,
            min_rev: 3,
        }
    }

    #[test]
    fn test_build_options() {
        let cli = Cli::try_parse_from(["romflash", "--chip", "esp32s3", "list-ports"]).unwrap();
        let options = build_options(&cli, &args()).unwrap();
        assert_eq!(options.chip, Chip::Esp32s3);
        assert_eq!(options.flash_mode, FlashMode::Dio);
        assert_eq!(options.flash_freq, FlashFreq::Freq80M);
        assert_eq!(options.flash_size, "4MB");
        assert_eq!(options.min_rev, 3);
        assert_eq!(options.min_rev_full, 300);
        assert!(options.use_segments);
    }

    #[test]
    fn test_build_options_needs_chip() {
        let cli = Cli::try_parse_from(["romflash", "list-ports"]).unwrap();
        let err = build_options(&cli, &args()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_build_options_size_keep_rejected() {
        let cli = Cli::try_parse_from(["romflash", "--chip", "esp32", "list-ports"]).unwrap();
        let mut keep = args();
        keep.size = "keep".to_string();
        assert!(build_options(&cli, &keep).is_err());
    }

    #[test]
    fn test_build_options_bad_mode() {
        let cli = Cli::try_parse_from(["romflash", "--chip", "esp32", "list-ports"]).unwrap();
        let mut bad = args();
        bad.mode = "octal".to_string();
        assert!(build_options(&cli, &bad).is_err());
    }
}
