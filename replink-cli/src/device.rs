//! Board identity and power commands: info, sysinfo, reboot, ports, id.

use anyhow::Result;
use replink_proto::control::RebootMode;
use replink_proto::{ConnectionUid, DeviceInfo};

use crate::OutputFormat;
use crate::session::{Session, finish};

/// Prints what the firmware reports about itself.
pub async fn info(session: &Session, format: OutputFormat) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.device_info().await;
    let info = finish(repl, res).await?;

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "link": session.channel().info(),
            "device": info,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }
    for (label, value) in info_rows(&info) {
        println!("{label:<9} {value}");
    }
    println!("{:<9} {}", "link:", session.channel().info());
    Ok(())
}

/// Label/value pairs for the table form of `info`.
fn info_rows(info: &DeviceInfo) -> Vec<(&'static str, String)> {
    let mpy = match (info.mpy_version, info.mpy_sub) {
        (Some(v), Some(sub)) => format!("v{v}.{sub}"),
        (Some(v), None) => format!("v{v}"),
        _ => "none".to_owned(),
    };
    let arch = info.mpy_arch.clone().unwrap_or_else(|| "none".to_owned());
    vec![
        ("machine:", info.machine.clone()),
        ("port:", info.sysname.clone()),
        ("release:", info.release.clone()),
        ("version:", info.version.clone()),
        ("mpy:", mpy),
        ("arch:", arch),
        ("path:", info.sys_path.join(":")),
    ]
}

/// Prints the markdown system report.
pub async fn sysinfo(session: &Session) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.sysinfo_markdown().await;
    let report = finish(repl, res).await?;
    print!("{}", report.replace("\r\n", "\n"));
    Ok(())
}

/// Reboots the board.
pub async fn reboot(session: &Session, mode: RebootMode) -> Result<()> {
    session.channel().reboot(mode).await?;
    println!("{mode} reboot sent");
    Ok(())
}

/// Lists serial ports, USB ones first.
pub fn ports(format: OutputFormat) -> Result<()> {
    let mut ports = replink::link::available_ports()?;
    ports.sort_by_key(|p| p.vid.is_none());

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports.");
        return Ok(());
    }
    println!("{:<28} {:<10} NAME", "PORT", "USB ID");
    for p in &ports {
        let usb = match (p.vid, p.pid) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            _ => "-".to_owned(),
        };
        println!(
            "{:<28} {:<10} {}",
            p.address.as_deref().unwrap_or_default(),
            usb,
            p.name.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

/// Prints a fresh connection id for `--peer-id`.
pub fn id() {
    println!("{}", ConnectionUid::random());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn table_rows() {
        let info = DeviceInfo::parse(
            "ESP32 module with ESP32|1.22.0|esp32|v1.22.0 on 2024-01-05|6|2|10|:.frozen:/lib",
        )
        .unwrap();
        let rows = info_rows(&info);
        assert_eq!(rows[0], ("machine:", "ESP32 module with ESP32".to_owned()));
        assert_eq!(rows[1], ("port:", "esp32".to_owned()));
        assert_eq!(rows[4], ("mpy:", "v6.2".to_owned()));
        assert_eq!(rows[5], ("arch:", "xtensawin".to_owned()));
        assert_eq!(rows[6], ("path:", ":.frozen:/lib".to_owned()));
    }

    #[test]
    fn source_only_ports_have_no_mpy() {
        let info = DeviceInfo::parse("pyboard|1.9|unix|v1.9|0|0|0|").unwrap();
        let rows = info_rows(&info);
        assert_eq!(rows[4].1, "none");
        assert_eq!(rows[5].1, "none");
    }
}
