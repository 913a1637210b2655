//! Device query and port listing command implementations.

use anyhow::Result;
use console::style;
use romflash::device::select_port;
use romflash::image::params::detected_flash_size;
use romflash::{DetectedPort, SecurityInfo, detect_ports};

use super::with_flasher;
use crate::Cli;
use crate::config::Config;

/// Names of the security flag bits, lowest bit first.
const SECURITY_FLAGS: [&str; 11] = [
    "SECURE_BOOT_EN",
    "SECURE_BOOT_AGGRESSIVE_REVOKE",
    "SECURE_DOWNLOAD_ENABLE",
    "SECURE_BOOT_KEY_REVOKE0",
    "SECURE_BOOT_KEY_REVOKE1",
    "SECURE_BOOT_KEY_REVOKE2",
    "SOFT_DIS_JTAG",
    "HARD_DIS_JTAG",
    "DIS_USB",
    "DIS_DOWNLOAD_DCACHE",
    "DIS_DOWNLOAD_ICACHE",
];

/// Chip-id command implementation.
pub(crate) fn cmd_chip_id(cli: &Cli, config: &Config) -> Result<()> {
    let id = with_flasher(cli, config, |flasher| Ok(flasher.chip_id()?))?;
    println!("Chip ID: 0x{id:08x}");
    Ok(())
}

/// Flash-id command implementation.
pub(crate) fn cmd_flash_id(cli: &Cli, config: &Config) -> Result<()> {
    let id = with_flasher(cli, config, |flasher| Ok(flasher.flash_id()?))?;
    println!("Manufacturer: {:02x}", id & 0xFF);
    println!("Device: {:02x}{:02x}", (id >> 8) & 0xFF, (id >> 16) & 0xFF);
    println!(
        "Detected flash size: {}",
        detected_flash_size(id).unwrap_or("Unknown")
    );
    Ok(())
}

/// Names of the flags set in `flags`.
fn security_flag_names(flags: u32) -> Vec<&'static str> {
    SECURITY_FLAGS
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Report lines for a security info block.
fn format_security_info(info: &SecurityInfo) -> Vec<String> {
    let mut lines = vec![format!("Flags: 0x{:08x}", info.flags)];
    for name in security_flag_names(info.flags) {
        lines.push(format!("  {name}"));
    }
    lines.push(format!("Flash_Crypt_Cnt: 0x{:x}", info.flash_crypt_cnt));
    let purposes: Vec<String> = info.key_purposes.iter().map(u8::to_string).collect();
    lines.push(format!("Key_Purposes: [{}]", purposes.join(", ")));
    if let Some(chip_id) = info.chip_id {
        lines.push(format!("Chip_ID: {chip_id}"));
    }
    if let Some(api_version) = info.api_version {
        lines.push(format!("Api_Version: {api_version}"));
    }

    let secure_boot = info.flags & 1 != 0;
    let encrypted = info.flash_crypt_cnt.count_ones() % 2 != 0;
    lines.push(format!(
        "Secure Boot: {}",
        if secure_boot { "Enabled" } else { "Disabled" }
    ));
    lines.push(format!(
        "Flash Encryption: {}",
        if encrypted { "Enabled" } else { "Disabled" }
    ));
    lines
}

/// Get-security-info command implementation.
pub(crate) fn cmd_security_info(cli: &Cli, config: &Config) -> Result<()> {
    let info = with_flasher(cli, config, |flasher| Ok(flasher.security_info()?))?;
    for line in format_security_info(&info) {
        println!("{line}");
    }
    Ok(())
}

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "native_usb": port.device.is_native_usb(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// One plain-text line per port: name, bridge kind, VID:PID and product.
fn port_line(port: &DetectedPort) -> String {
    let mut line = port.name.clone();
    if port.device.is_known() {
        line.push_str(&format!(" [{}]", port.device.name()));
    }
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        line.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = &port.product {
        line.push_str(&format!(" - {product}"));
    }
    line
}

/// `list-ports`: JSON on stdout, or a human list on stderr.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = detect_ports();

    if json {
        let envelope = serde_json::json!({
            "ok": true,
            "data": { "ports": ports.iter().map(port_json).collect::<Vec<_>>() },
        });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{}", style("No serial ports found").dim());
        return Ok(());
    }
    for port in &ports {
        eprintln!("  {}", style(port_line(port)).cyan());
    }
    if let Some(choice) = select_port(ports) {
        eprintln!(
            "{} {} is used when --port is not given",
            style("→").green().bold(),
            style(&choice.name).bold()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use romflash::DeviceKind;

    #[test]
    fn test_security_flag_names() {
        assert!(security_flag_names(0).is_empty());
        assert_eq!(
            security_flag_names(0b101),
            vec!["SECURE_BOOT_EN", "SECURE_DOWNLOAD_ENABLE"]
        );
        assert_eq!(security_flag_names(1 << 10), vec!["DIS_DOWNLOAD_ICACHE"]);
    }

    #[test]
    fn test_format_security_info() {
        let info = SecurityInfo {
            flags: 0x1,
            flash_crypt_cnt: 0x7,
            key_purposes: [0, 1, 2, 3, 4, 5, 6],
            chip_id: Some(9),
            api_version: Some(3),
        };
        let lines = format_security_info(&info);
        assert_eq!(lines[0], "Flags: 0x00000001");
        assert!(lines.contains(&"  SECURE_BOOT_EN".to_string()));
        assert!(lines.contains(&"Key_Purposes: [0, 1, 2, 3, 4, 5, 6]".to_string()));
        assert!(lines.contains(&"Chip_ID: 9".to_string()));
        assert!(lines.contains(&"Secure Boot: Enabled".to_string()));
        assert!(lines.contains(&"Flash Encryption: Enabled".to_string()));
    }

    #[test]
    fn test_format_security_info_esp32s2() {
        let info = SecurityInfo {
            flags: 0,
            flash_crypt_cnt: 0x3,
            key_purposes: [0; 7],
            chip_id: None,
            api_version: None,
        };
        let lines = format_security_info(&info);
        assert!(!lines.iter().any(|l| l.starts_with("Chip_ID")));
        assert!(lines.contains(&"Secure Boot: Disabled".to_string()));
        assert!(lines.contains(&"Flash Encryption: Disabled".to_string()));
    }

    #[test]
    fn test_port_line() {
        let port = DetectedPort {
            name: "/dev/ttyACM0".to_string(),
            device: DeviceKind::EspressifUsbJtag,
            vid: Some(0x303A),
            pid: Some(0x1001),
            manufacturer: Some("Espressif".to_string()),
            product: Some("USB JTAG/serial debug unit".to_string()),
            serial: None,
        };
        assert_eq!(
            port_line(&port),
            "/dev/ttyACM0 [USB-JTAG-Serial] (303A:1001) - USB JTAG/serial debug unit"
        );
        assert_eq!(port_json(&port)["native_usb"], serde_json::Value::Bool(true));

        let bare = DetectedPort {
            name: "/dev/ttyS0".to_string(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        };
        assert_eq!(port_line(&bare), "/dev/ttyS0");
    }

    #[test]
    fn test_cmd_list_ports_json() {
        assert!(cmd_list_ports(true).is_ok());
    }
}
