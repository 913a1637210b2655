//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("romflash");
    for var in [
        "ROMFLASH_PORT",
        "ROMFLASH_BAUD",
        "ROMFLASH_CHIP",
        "ROMFLASH_STUB",
        "ROMFLASH_CONNECT_ATTEMPTS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// A 64-byte ESP32-C3 image with one 16-byte DRAM segment and no digest.
fn esp32c3_image() -> Vec<u8> {
    let mut image = vec![0xE9, 0x01, 0x02, 0x20];
    image.extend_from_slice(&0x4038_0000u32.to_le_bytes());
    // Extended header: wp pin, drive settings, chip id 5, revisions, no digest
    image.extend_from_slice(&[0xEE, 0, 0, 0, 5, 0, 0, 0, 0, 0xFF, 0xFF, 0, 0, 0, 0, 0]);
    image.extend_from_slice(&0x3FC8_0000u32.to_le_bytes());
    image.extend_from_slice(&16u32.to_le_bytes());
    image.extend_from_slice(&[0x11; 16]);
    image.resize(63, 0);
    // Sixteen equal bytes cancel out, leaving the checksum seed
    image.push(0xEF);
    image
}

/// A RISC-V ELF with a single `.dram0.data` section and matching program header.
fn riscv_elf(path: &Path) {
    let data = [0x5Au8; 32];
    let strtab = b"\0.dram0.data\0.shstrtab\0";
    let data_offset = 0x34 + 0x20;
    let strtab_offset = data_offset + data.len();
    let shoff = strtab_offset + strtab.len();

    let mut out = Vec::new();
    out.extend_from_slice(b"\x7fELF\x01\x01\x01\0\0\0\0\0\0\0\0\0");
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&0xF3u16.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0x4038_0080u32.to_le_bytes());
    out.extend_from_slice(&0x34u32.to_le_bytes());
    out.extend_from_slice(&(shoff as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for half in [0x34u16, 0x20, 1, 0x28, 3, 2] {
        out.extend_from_slice(&half.to_le_bytes());
    }
    for word in [1u32, data_offset as u32, 0x3FC8_0000, 0x3FC8_0000, 32, 32, 6, 4] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&data);
    out.extend_from_slice(strtab);
    out.extend_from_slice(&[0u8; 0x28]);
    for word in [1u32, 1, 3, 0x3FC8_0000, data_offset as u32, 32, 0, 0, 4, 0] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    for word in [13u32, 3, 0, 0, strtab_offset as u32, strtab.len() as u32, 0, 0, 1, 0] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    fs::write(path, out).expect("write elf");
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("romflash"))
        .stdout(predicate::str::contains("write-flash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("romflash"))
        .stderr(predicate::str::is_empty());
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd().arg("--invalid-flag-xyz").assert().failure().code(2);
}

#[test]
fn exit_code_two_for_unknown_reset_mode() {
    cli_cmd()
        .args(["--before", "sideways", "chip-id"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_odd_address_file_list() {
    cli_cmd()
        .args(["-p", "INVALID_PORT_NAME_XYZ", "write-flash", "0x1000", "a.bin", "0x2000"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("pairs"));
}

#[test]
fn exit_code_two_for_bad_address() {
    cli_cmd()
        .args(["read-flash", "0xZZ", "16", "out.bin"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_one_for_missing_image() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("does_not_exist.bin");

    cli_cmd()
        .arg("image-info")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn missing_write_file_fails_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("app.bin");

    cli_cmd()
        .args(["-p", "INVALID_PORT_NAME_XYZ", "write-flash", "0x10000"])
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("app.bin"));
}

#[test]
fn invalid_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let app = dir.path().join("app.bin");
    fs::write(&app, [0u8; 16]).expect("write app.bin");

    let output = cli_cmd()
        .args(["-p", "INVALID_PORT_NAME_XYZ", "--connect-attempts", "1", "write-flash", "0x10000"])
        .arg(&app)
        .output()
        .expect("command should execute");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

// ============================================================================
// Suggestions
// ============================================================================

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("erase-flsh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("erase-flash"));
}

#[test]
fn unknown_flag_suggests_similar() {
    cli_cmd()
        .arg("list-ports")
        .arg("--jason")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--json"));
}

// ============================================================================
// Offline commands
// ============================================================================

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], serde_json::Value::Bool(true));
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn image_info_detects_chip() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("app.bin");
    fs::write(&path, esp32c3_image()).expect("write image");

    cli_cmd()
        .arg("image-info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Image chip: ESP32-C3"))
        .stdout(predicate::str::contains("Entry point: 40380000"))
        .stdout(predicate::str::contains("1 segments"))
        .stdout(predicate::str::contains("Checksum: ef (valid)"));
}

#[test]
fn image_info_rejects_non_image() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("notes.txt");
    fs::write(&path, b"hello").expect("write file");

    cli_cmd()
        .arg("image-info")
        .arg(&path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not a firmware image"));
}

#[test]
fn elf2image_writes_image_with_digest() {
    let dir = tempdir().expect("tempdir should be created");
    let elf = dir.path().join("app.elf");
    let out = dir.path().join("app.bin");
    riscv_elf(&elf);

    cli_cmd()
        .args(["--chip", "esp32c3", "elf2image", "-m", "dio", "-s", "4MB"])
        .arg(&elf)
        .arg("-o")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("app.bin"));

    let image = fs::read(&out).expect("image written");
    assert_eq!(image[0], 0xE9);
    assert_eq!(image[1], 1);
    assert_eq!(image[2], 0x02);
    assert_eq!(image[3], 0x20);

    cli_cmd()
        .arg("image-info")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Image chip: ESP32-C3"))
        .stdout(predicate::str::contains("(valid)"))
        .stdout(predicate::str::contains("invalid").not());
}

#[test]
fn elf2image_without_chip_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let elf = dir.path().join("app.elf");
    riscv_elf(&elf);

    cli_cmd()
        .arg("elf2image")
        .arg(&elf)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--chip"));
}

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("romflash.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_romflash()"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd().arg("completions").assert().failure().code(2);
}
