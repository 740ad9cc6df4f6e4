//! Reading and writing the device configuration through the management
//! application.
//!
//! Both operations obtain a management session through the arbiter like any
//! other caller, so they queue behind whatever is already in flight and they
//! supersede the previously selected application.

use std::ops::Deref;

use keylink_core::management::{
    build_write_payload, parse_read_response, read_config_command, write_config_command,
};
use keylink_core::{CapabilityRecord, DeviceConfig, DeviceInfo, SessionKind, Version};
use tracing::{debug, info};

use super::arbiter::{Connection, SessionError, SessionHandle};
use super::sessions::TypedSession;

/// Result of a successful configuration write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored; the device keeps running.
    Applied,
    /// Stored, and the device is rebooting.  The link is about to drop.
    RebootPending,
}

/// A session on the configuration-management application.
#[derive(Debug, Clone)]
pub struct ManagementSession {
    handle: SessionHandle,
}

impl TypedSession for ManagementSession {
    const KIND: SessionKind = SessionKind::Management;

    fn from_handle(handle: SessionHandle) -> Self {
        Self { handle }
    }

    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn into_handle(self) -> SessionHandle {
        self.handle
    }
}

impl Deref for ManagementSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl ManagementSession {
    /// The firmware version announced in the SELECT response, if any.
    pub fn firmware_version(&self) -> Option<Version> {
        std::str::from_utf8(self.handle.select_response())
            .ok()
            .and_then(Version::find_in_text)
    }

    /// Issues READ CONFIG and decodes everything it reports.
    pub async fn read_device_info(&self) -> Result<DeviceInfo, SessionError> {
        let response = self.handle.transceive(read_config_command()).await?;
        let info = parse_read_response(response.data())?;
        debug!(
            generation = %self.handle.generation(),
            serial = ?info.serial,
            version = ?info.version,
            locked = info.config_locked,
            "device configuration read"
        );
        Ok(info)
    }

    /// The supported/enabled application matrix.
    pub async fn read_configuration(&self) -> Result<CapabilityRecord, SessionError> {
        Ok(self.read_device_info().await?.capabilities)
    }

    /// Issues WRITE CONFIG with the enabled bits of `config`.
    ///
    /// The payload is not checked against the supported bits; the device
    /// rejects what it cannot apply.
    pub async fn write_configuration(
        &self,
        config: &DeviceConfig,
    ) -> Result<WriteOutcome, SessionError> {
        let payload = build_write_payload(config)?;
        self.handle
            .transceive(write_config_command(payload))
            .await?;

        if config.reboot {
            info!(generation = %self.handle.generation(), "configuration written; device rebooting");
            Ok(WriteOutcome::RebootPending)
        } else {
            info!(generation = %self.handle.generation(), "configuration written");
            Ok(WriteOutcome::Applied)
        }
    }
}

impl Connection {
    /// Opens a management session and reads the full device information.
    pub async fn read_device_info(&self) -> Result<DeviceInfo, SessionError> {
        let session: ManagementSession = self.open().await?;
        session.read_device_info().await
    }

    /// Opens a management session and reads the capability matrix.
    pub async fn read_configuration(&self) -> Result<CapabilityRecord, SessionError> {
        let session: ManagementSession = self.open().await?;
        session.read_configuration().await
    }

    /// Opens a management session and writes the enabled half of `record`.
    pub async fn write_configuration(
        &self,
        record: &CapabilityRecord,
        reboot: bool,
    ) -> Result<WriteOutcome, SessionError> {
        let session: ManagementSession = self.open().await?;
        let config = DeviceConfig::from_record(record).with_reboot(reboot);
        session.write_configuration(&config).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::arbiter::ArbiterOptions;
    use crate::infrastructure::transport::simulated::SimulatedKey;
    use keylink_core::management::INS_WRITE_CONFIG;
    use keylink_core::{Capability, Interface, StatusWord};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn usb_only_info() -> DeviceInfo {
        DeviceInfo {
            capabilities: CapabilityRecord {
                supported: BTreeMap::from([(Interface::Usb, Capability::OATH | Capability::OTP)]),
                enabled: BTreeMap::from([(Interface::Usb, Capability::OATH)]),
            },
            serial: Some(12_345_678),
            version: Some(Version::new(5, 4, 3)),
            ..DeviceInfo::default()
        }
    }

    fn connect(info: DeviceInfo) -> (Arc<SimulatedKey>, Connection) {
        let key = Arc::new(SimulatedKey::new(info));
        let conn = Connection::spawn(key.clone(), ArbiterOptions::default());
        (key, conn)
    }

    #[tokio::test]
    async fn test_read_configuration_reports_matrix() {
        // Arrange
        let (_key, conn) = connect(usb_only_info());

        // Act
        let record = conn.read_configuration().await.unwrap();

        // Assert
        assert_eq!(
            record.supported_on(Interface::Usb),
            Capability::OATH | Capability::OTP
        );
        assert_eq!(record.enabled_on(Interface::Usb), Capability::OATH);
        assert!(record.supported_on(Interface::Nfc).is_empty());
    }

    #[tokio::test]
    async fn test_firmware_version_from_select_banner() {
        let (_key, conn) = connect(usb_only_info());

        let session: ManagementSession = conn.open().await.unwrap();

        assert_eq!(session.firmware_version(), Some(Version::new(5, 4, 3)));
    }

    #[tokio::test]
    async fn test_read_device_info_includes_serial() {
        let (_key, conn) = connect(usb_only_info());

        let info = conn.read_device_info().await.unwrap();

        assert_eq!(info.serial, Some(12_345_678));
        assert_eq!(info.version, Some(Version::new(5, 4, 3)));
    }

    #[tokio::test]
    async fn test_write_with_reboot_signals_pending_reboot() {
        // Arrange
        let (key, conn) = connect(usb_only_info());
        let mut record = conn.read_configuration().await.unwrap();
        record.set_enabled(Interface::Usb, Capability::OTP, true);

        // Act
        let outcome = conn.write_configuration(&record, true).await.unwrap();

        // Assert
        assert_eq!(outcome, WriteOutcome::RebootPending);
        assert_eq!(key.reboots(), 1);
        assert_eq!(
            key.device_info().capabilities.enabled_on(Interface::Usb),
            Capability::OATH | Capability::OTP
        );
    }

    #[tokio::test]
    async fn test_write_without_reboot_is_applied() {
        let (key, conn) = connect(usb_only_info());
        let record = conn.read_configuration().await.unwrap();

        let outcome = conn.write_configuration(&record, false).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(key.reboots(), 0);
    }

    #[tokio::test]
    async fn test_rejected_write_surfaces_status_verbatim() {
        // Arrange
        let (key, conn) = connect(usb_only_info());
        key.script_status(INS_WRITE_CONFIG, StatusWord::CONDITIONS_NOT_SATISFIED);
        let record = conn.read_configuration().await.unwrap();

        // Act
        let result = conn.write_configuration(&record, true).await;

        // Assert
        assert_eq!(
            result.unwrap_err(),
            SessionError::DeviceRejected {
                status: StatusWord::CONDITIONS_NOT_SATISFIED
            }
        );
        assert_eq!(key.reboots(), 0);
    }
}
