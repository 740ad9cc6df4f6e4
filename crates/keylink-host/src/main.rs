//! keylink demo entry point.
//!
//! Drives a simulated key end to end through the public API:
//!
//! ```text
//! main()
//!  └─ load HostConfig            -- argument path, or the platform default
//!  └─ Connection::spawn(SimulatedKey)
//!       ├─ read device info      -- management session
//!       ├─ echo through OATH     -- supersedes the management session
//!       ├─ write configuration   -- enables FIDO2 over NFC, reboots
//!       └─ unplug                -- queued work fails with Disconnected
//! ```
//!
//! Usage: `keylink [CONFIG_PATH]`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keylink_core::{
    Capability, CapabilityRecord, CommandApdu, DeviceInfo, FormFactor, Interface, SessionKind,
    Version,
};
use keylink_host::application::{
    ArbiterOptions, Connection, ManagementSession, OathSession, SessionError,
};
use keylink_host::infrastructure::storage::config::{config_file_path, load_config_or_default};
use keylink_host::infrastructure::transport::simulated::SimulatedKey;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => config_file_path()?,
    };
    let config = load_config_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    // Level from the config file, overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    info!(config = %path.display(), "keylink starting");

    let key = Arc::new(SimulatedKey::new(demo_device()));
    let conn = Connection::spawn(key.clone(), ArbiterOptions::from(&config));

    // ── Read ──────────────────────────────────────────────────────────────────
    let management: ManagementSession = conn.open().await?;
    if let Some(version) = management.firmware_version() {
        println!("management application reports firmware {version}");
    }
    let info = management.read_device_info().await?;
    print_device(&info);

    // ── Another application supersedes the management session ────────────────
    let oath: OathSession = conn.open().await?;
    let echo = oath
        .transceive(CommandApdu::new(0x00, 0x01, 0x00, 0x00).with_data(b"ping".to_vec()))
        .await?;
    println!("oath echo: {:?}", String::from_utf8_lossy(echo.data()));
    match management.read_configuration().await {
        Err(SessionError::SessionClosed) => println!("old management session is closed"),
        other => warn!(?other, "superseded session still answered"),
    }

    // ── Write ─────────────────────────────────────────────────────────────────
    let mut record = info.capabilities;
    match SessionKind::Fido2.capability() {
        Some(fido2) if record.is_supported(Interface::Nfc, fido2) => {
            record.set_enabled(Interface::Nfc, fido2, true);
            let outcome = conn.write_configuration(&record, true).await?;
            println!("write: {outcome:?}");
        }
        _ => warn!("fido2 is not available over nfc; skipping write"),
    }

    // ── Disconnect ────────────────────────────────────────────────────────────
    let sent = key.frames().len();
    key.close_gate();
    let pending = conn.request_session(SessionKind::Piv);
    key.wait_for_frames(sent + 1).await;
    key.unplug();
    match pending.await {
        Err(error) => println!("pending request after unplug: {error}"),
        Ok(handle) => warn!(?handle, "request survived the unplug"),
    }
    key.open_gate();

    info!(exchanges = key.frames().len(), "keylink stopped");
    Ok(())
}

fn demo_device() -> DeviceInfo {
    let all = Capability::OTP
        | Capability::U2F
        | Capability::OPENPGP
        | Capability::PIV
        | Capability::OATH
        | Capability::FIDO2;
    DeviceInfo {
        capabilities: CapabilityRecord {
            supported: BTreeMap::from([(Interface::Usb, all), (Interface::Nfc, all)]),
            enabled: BTreeMap::from([
                (Interface::Usb, all),
                (Interface::Nfc, Capability::OATH | Capability::OTP),
            ]),
        },
        serial: Some(18_733_012),
        version: Some(Version::new(5, 7, 2)),
        form_factor: Some(FormFactor::UsbANano),
        ..DeviceInfo::default()
    }
}

fn print_device(info: &DeviceInfo) {
    if let Some(serial) = info.serial {
        println!("serial: {serial}");
    }
    if let Some(form_factor) = info.form_factor {
        println!("form factor: {form_factor:?}");
    }
    for interface in Interface::ALL {
        println!(
            "{interface}: supported [{}], enabled [{}]",
            info.capabilities.supported_on(interface),
            info.capabilities.enabled_on(interface)
        );
    }
}
