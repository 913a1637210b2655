//! Shell completions: print to stdout or install for the current user.

use anyhow::{Context, Result, bail};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let bin = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin, out);
}

/// `completions <shell>`: write the script to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Where the script for `shell` is picked up without further setup
/// (zsh still needs `~/.zfunc` on its fpath).
fn install_path(shell: Shell, home: &Path, config: &Path, data: &Path) -> Result<PathBuf> {
    Ok(match shell {
        Shell::Bash => data.join("bash-completion/completions/romflash"),
        Shell::Zsh => home.join(".zfunc/_romflash"),
        Shell::Fish => config.join("fish/completions/romflash.fish"),
        Shell::Elvish => config.join("elvish/lib/romflash.elv"),
        Shell::PowerShell => config.join("powershell/completions/romflash.ps1"),
        other => bail!("Don't know where {other} completions go, use `romflash completions {other}`"),
    })
}

fn activation_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!("Open a new shell, or run: source {}", path.display()),
        Shell::Zsh => "Add `fpath=(~/.zfunc $fpath)` before `compinit` in ~/.zshrc".to_string(),
        Shell::PowerShell => format!("Dot-source it from your profile: . {}", path.display()),
        _ => "New shells pick it up automatically".to_string(),
    }
}

/// `completions --install [shell]`: write the script into the user's
/// completion directory. Without a shell, `$SHELL` decides.
pub(crate) fn cmd_completions_install(shell: Option<Shell>) -> Result<()> {
    let shell = match shell.or_else(Shell::from_env) {
        Some(shell) => shell,
        None => bail!("Could not tell which shell you use, pass it: romflash completions --install bash"),
    };

    let dirs = BaseDirs::new().context("No home directory")?;
    let path = install_path(shell, dirs.home_dir(), dirs.config_dir(), dirs.data_dir())?;

    let mut script = Vec::new();
    render(shell, &mut script);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    fs::write(&path, script).with_context(|| format!("Failed to write {}", path.display()))?;

    eprintln!(
        "{} {shell} completions written to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );
    eprintln!("  {}", style(activation_hint(shell, &path)).dim());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_paths() {
        let home = Path::new("/home/u");
        let config = Path::new("/home/u/.config");
        let data = Path::new("/home/u/.local/share");
        let path = |shell| install_path(shell, home, config, data).unwrap();

        assert_eq!(
            path(Shell::Bash),
            PathBuf::from("/home/u/.local/share/bash-completion/completions/romflash")
        );
        assert_eq!(path(Shell::Zsh), PathBuf::from("/home/u/.zfunc/_romflash"));
        assert_eq!(
            path(Shell::Fish),
            PathBuf::from("/home/u/.config/fish/completions/romflash.fish")
        );
        assert!(path(Shell::Elvish).ends_with("romflash.elv"));
        assert!(path(Shell::PowerShell).ends_with("romflash.ps1"));
    }

    #[test]
    fn test_activation_hint_mentions_path() {
        let path = Path::new("/tmp/romflash");
        assert!(activation_hint(Shell::Bash, path).contains("/tmp/romflash"));
        assert!(activation_hint(Shell::Zsh, path).contains("fpath"));
    }

    #[test]
    fn test_render_mentions_subcommands() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let mut buf = Vec::new();
            render(shell, &mut buf);
            let script = String::from_utf8(buf).unwrap();
            assert!(script.contains("romflash"));
            assert!(script.contains("write-flash"));
        }
    }
}
