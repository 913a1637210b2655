//! Flash write, read, erase and verify command implementations.

use anyhow::{Context, Result};
use console::style;
use romflash::{FirmwareImage, FlashFile, WriteOptions};
use std::path::{Path, PathBuf};

use super::{ensure_not_interrupted, progress_bar, resolve_flash_params, with_flasher};
use crate::config::Config;
use crate::{Cli, CliError, FlashParamArgs};

/// Switches of the write-flash command.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct WriteArgs {
    pub(crate) erase_all: bool,
    pub(crate) no_compress: bool,
    pub(crate) encrypt: bool,
    pub(crate) verify: bool,
}

fn load_files(pairs: &[(u32, PathBuf)]) -> Result<Vec<FlashFile>> {
    pairs
        .iter()
        .map(|(address, path)| {
            FlashFile::from_path(*address, path)
                .with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect()
}

/// Reject files that overlap each other before touching the device.
fn check_overlaps(files: &[FlashFile]) -> Result<()> {
    let mut ranges: Vec<(u64, u64, &str)> = files
        .iter()
        .map(|f| {
            let start = u64::from(f.address);
            (start, start + f.data.len() as u64, f.name.as_str())
        })
        .collect();
    ranges.sort_by_key(|r| r.0);
    for pair in ranges.windows(2) {
        let (_, end, first) = pair[0];
        let (start, _, second) = pair[1];
        if start < end {
            return Err(CliError::Usage(format!(
                "Detected overlap at address 0x{start:x} for file {second} (ends at 0x{end:x} in {first})"
            ))
            .into());
        }
    }
    Ok(())
}

/// Write-flash command implementation.
pub(crate) fn cmd_write_flash(
    cli: &Cli,
    config: &Config,
    pairs: &[(u32, PathBuf)],
    args: &WriteArgs,
    params: &FlashParamArgs,
) -> Result<()> {
    let files = load_files(pairs)?;
    check_overlaps(&files)?;

    let options = WriteOptions {
        erase_all: args.erase_all,
        compress: !args.no_compress && config.flash.compress.unwrap_or(true),
        encrypt: args.encrypt,
        verify: args.verify || config.flash.verify.unwrap_or(false),
        flash_params: resolve_flash_params(params, config)?,
    };

    if !cli.quiet {
        for file in &files {
            eprintln!(
                "    {} {} @ 0x{:08x} ({} bytes)",
                style("•").dim(),
                file.name,
                file.address,
                file.data.len()
            );
        }
    }

    with_flasher(cli, config, |flasher| {
        let pb = progress_bar(cli, 0);
        let mut current = String::new();
        flasher.write_flash(&files, &options, &mut |name, sent, total| {
            if name != current {
                current = name.to_string();
                pb.reset();
                pb.set_length(total as u64);
                pb.set_message(current.clone());
            }
            pb.set_position(sent as u64);
        })?;
        pb.finish_and_clear();
        ensure_not_interrupted()?;

        if !cli.quiet {
            eprintln!("{} Wrote {} file(s)", style("✓").green(), files.len());
        }
        Ok(())
    })
}

/// Read-flash command implementation.
pub(crate) fn cmd_read_flash(
    cli: &Cli,
    config: &Config,
    address: u32,
    size: u32,
    output: &Path,
) -> Result<()> {
    let data = with_flasher(cli, config, |flasher| {
        let pb = progress_bar(cli, u64::from(size));
        pb.set_message("Reading");
        let data = flasher.read_flash(address, size, &mut |done, _| pb.set_position(done as u64))?;
        pb.finish_and_clear();
        Ok(data)
    })?;

    std::fs::write(output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Read {} bytes at 0x{address:08x} into {}",
            style("✓").green(),
            data.len(),
            output.display()
        );
    }
    Ok(())
}

/// Erase-flash command implementation.
pub(crate) fn cmd_erase_flash(cli: &Cli, config: &Config) -> Result<()> {
    with_flasher(cli, config, |flasher| Ok(flasher.erase_flash()?))?;
    if !cli.quiet {
        eprintln!("{} Flash erased", style("✓").green());
    }
    Ok(())
}

/// Erase-region command implementation.
pub(crate) fn cmd_erase_region(cli: &Cli, config: &Config, address: u32, size: u32) -> Result<()> {
    with_flasher(cli, config, |flasher| Ok(flasher.erase_region(address, size)?))?;
    if !cli.quiet {
        eprintln!(
            "{} Erased 0x{size:x} bytes at 0x{address:08x}",
            style("✓").green()
        );
    }
    Ok(())
}

/// Verify-flash command implementation.
pub(crate) fn cmd_verify_flash(
    cli: &Cli,
    config: &Config,
    pairs: &[(u32, PathBuf)],
    diff: bool,
    params: &FlashParamArgs,
) -> Result<()> {
    let files = load_files(pairs)?;
    let params = resolve_flash_params(params, config)?;
    with_flasher(cli, config, |flasher| {
        Ok(flasher.verify_flash(&files, &params, diff)?)
    })?;
    if !cli.quiet {
        eprintln!("{} Flash contents match", style("✓").green());
    }
    Ok(())
}

/// Load-ram command implementation.
pub(crate) fn cmd_load_ram(cli: &Cli, config: &Config, file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    with_flasher(cli, config, |flasher| {
        let chip = flasher
            .chip()
            .context("Chip type unknown after connecting")?;
        let image = FirmwareImage::from_bytes(chip, &bytes)
            .with_context(|| format!("{} is not a {chip} image", file.display()))?;
        Ok(flasher.load_ram(&image)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_overlaps() {
        let files = vec![
            FlashFile::new(0x1000, "boot.bin", vec![0; 0x1000]),
            FlashFile::new(0x2000, "part.bin", vec![0; 0x100]),
        ];
        assert!(check_overlaps(&files).is_ok());

        let files = vec![
            FlashFile::new(0x10000, "app.bin", vec![0; 0x100]),
            FlashFile::new(0x1000, "boot.bin", vec![0; 0x1001]),
            FlashFile::new(0x2000, "part.bin", vec![0; 0x100]),
        ];
        let err = check_overlaps(&files).unwrap_err();
        assert!(err.to_string().contains("part.bin"));
    }

    #[test]
    fn test_load_files_missing() {
        let err = load_files(&[(0x1000, PathBuf::from("/nonexistent/boot.bin"))]).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/boot.bin"));
    }

    #[test]
    fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let files = load_files(&[(0x10000, path)]).unwrap();
        assert_eq!(files[0].address, 0x10000);
        assert_eq!(files[0].data, vec![1, 2, 3]);
    }
}
