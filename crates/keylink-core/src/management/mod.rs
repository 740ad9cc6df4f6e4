//! Device configuration as seen by the management application.
//!
//! # The configuration payload (for beginners)
//!
//! The management application answers READ CONFIG with a single binary
//! payload:
//!
//! ```text
//! [total_len:1] [tag][len][value] [tag][len][value] ...
//! ```
//!
//! Each record describes one property.  The records that matter most form a
//! matrix of *interface × application*: for each interface (USB, NFC) one
//! record lists the applications the hardware supports and another lists the
//! ones currently enabled, both as a [`Capability`] bitmask.  Other records
//! carry the serial number, firmware version and so on.  Tags this crate does
//! not know are skipped so newer firmware stays readable.
//!
//! WRITE CONFIG takes the same layout, restricted to the enabled bitmasks plus
//! an optional zero-length reboot record.
//!
//! - **`tlv`** – record reader/writer and the tag constants.
//! - **`config`** – payload parsing and building, and the two commands.

pub mod config;
pub mod tlv;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Capability, FormFactor, Interface, Version};

pub use config::{
    build_write_payload, encode_read_response, parse_read_response, parse_write_payload,
    read_config_command, write_config_command, INS_READ_CONFIG, INS_WRITE_CONFIG,
};

/// Errors raised while decoding or encoding a configuration payload.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TlvError {
    /// The payload has no length prefix.
    #[error("configuration payload is empty")]
    Empty,

    /// The length prefix does not match the bytes that follow.
    #[error("configuration payload declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// A record ended before its length or value was complete.
    #[error("record 0x{tag:02X} truncated: need {needed} bytes, {available} available")]
    Truncated {
        tag: u8,
        needed: usize,
        available: usize,
    },

    /// A length byte used a multi-byte form other than `0x81`/`0x82`.
    #[error("unsupported TLV length form 0x{0:02X}")]
    UnsupportedLengthForm(u8),

    /// A known record has a value of the wrong size.
    #[error("record 0x{tag:02X} has invalid value length {len}")]
    InvalidValueLength { tag: u8, len: usize },

    /// A value is too long for the short length form used when writing.
    #[error("record 0x{tag:02X} value of {len} bytes is too long to encode")]
    ValueTooLong { tag: u8, len: usize },

    /// The encoded payload does not fit the one-byte length prefix.
    #[error("configuration payload of {0} bytes exceeds 255")]
    PayloadTooLong(usize),
}

/// The interface × application matrix.
///
/// Interfaces absent from a map were not reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub supported: BTreeMap<Interface, Capability>,
    pub enabled: BTreeMap<Interface, Capability>,
}

impl CapabilityRecord {
    /// Applications supported on `interface` (empty if not reported).
    pub fn supported_on(&self, interface: Interface) -> Capability {
        self.supported.get(&interface).copied().unwrap_or_default()
    }

    /// Applications enabled on `interface` (empty if not reported).
    pub fn enabled_on(&self, interface: Interface) -> Capability {
        self.enabled.get(&interface).copied().unwrap_or_default()
    }

    pub fn is_supported(&self, interface: Interface, capability: Capability) -> bool {
        self.supported_on(interface).contains(capability)
    }

    pub fn is_enabled(&self, interface: Interface, capability: Capability) -> bool {
        self.enabled_on(interface).contains(capability)
    }

    /// Turns `capability` on or off for `interface`.
    ///
    /// Supported bits are not consulted; the device is the judge of what it
    /// accepts.
    pub fn set_enabled(&mut self, interface: Interface, capability: Capability, on: bool) {
        let entry = self.enabled.entry(interface).or_default();
        entry.set(capability, on);
    }
}

/// Everything READ CONFIG reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub capabilities: CapabilityRecord,
    pub serial: Option<u32>,
    pub version: Option<Version>,
    pub form_factor: Option<FormFactor>,
    pub config_locked: bool,
    pub auto_eject_timeout: Option<u16>,
    pub challenge_response_timeout: Option<u8>,
    pub device_flags: Option<u8>,
}

/// A configuration write: the enabled bits to store and whether to reboot.
///
/// Only interfaces present in `enabled` are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub enabled: BTreeMap<Interface, Capability>,
    pub reboot: bool,
}

impl DeviceConfig {
    /// Takes the enabled half of `record`.
    pub fn from_record(record: &CapabilityRecord) -> Self {
        Self {
            enabled: record.enabled.clone(),
            reboot: false,
        }
    }

    pub fn with_reboot(mut self, reboot: bool) -> Self {
        self.reboot = reboot;
        self
    }
}
