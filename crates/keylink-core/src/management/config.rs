//! READ CONFIG / WRITE CONFIG payloads and commands.

use tracing::trace;

use super::tlv::{
    read_uint, write_tlv, TlvReader, TAG_AUTO_EJECT_TIMEOUT, TAG_CHALRESP_TIMEOUT,
    TAG_CONFIG_LOCK, TAG_DEVICE_FLAGS, TAG_FORM_FACTOR, TAG_NFC_ENABLED, TAG_NFC_SUPPORTED,
    TAG_REBOOT, TAG_SERIAL, TAG_USB_ENABLED, TAG_USB_SUPPORTED, TAG_VERSION,
};
use super::{DeviceConfig, DeviceInfo, TlvError};
use crate::apdu::CommandApdu;
use crate::domain::{Capability, FormFactor, Interface, Version};

/// READ CONFIG instruction of the management application.
pub const INS_READ_CONFIG: u8 = 0x1D;
/// WRITE CONFIG instruction of the management application.
pub const INS_WRITE_CONFIG: u8 = 0x1C;

/// `00 1D 00 00`
pub fn read_config_command() -> CommandApdu {
    CommandApdu::new(0x00, INS_READ_CONFIG, 0x00, 0x00)
}

/// `00 1C 00 00 Lc <payload>`
pub fn write_config_command(payload: Vec<u8>) -> CommandApdu {
    CommandApdu::new(0x00, INS_WRITE_CONFIG, 0x00, 0x00).with_data(payload)
}

fn supported_tag(interface: Interface) -> u8 {
    match interface {
        Interface::Usb => TAG_USB_SUPPORTED,
        Interface::Nfc => TAG_NFC_SUPPORTED,
    }
}

fn enabled_tag(interface: Interface) -> u8 {
    match interface {
        Interface::Usb => TAG_USB_ENABLED,
        Interface::Nfc => TAG_NFC_ENABLED,
    }
}

// ── Length prefix ─────────────────────────────────────────────────────────────

fn unwrap_body(payload: &[u8]) -> Result<&[u8], TlvError> {
    let (&declared, rest) = payload.split_first().ok_or(TlvError::Empty)?;
    let declared = declared as usize;
    if rest.len() < declared {
        return Err(TlvError::LengthMismatch {
            declared,
            actual: rest.len(),
        });
    }
    Ok(&rest[..declared])
}

fn wrap_body(body: Vec<u8>) -> Result<Vec<u8>, TlvError> {
    if body.len() > u8::MAX as usize {
        return Err(TlvError::PayloadTooLong(body.len()));
    }
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(body.len() as u8);
    payload.extend_from_slice(&body);
    Ok(payload)
}

// ── Value helpers ─────────────────────────────────────────────────────────────

fn bitmask(tag: u8, value: &[u8]) -> Result<Capability, TlvError> {
    if value.is_empty() || value.len() > 2 {
        return Err(TlvError::InvalidValueLength {
            tag,
            len: value.len(),
        });
    }
    Ok(Capability::from_bits_retain(read_uint(tag, value)? as u16))
}

fn single_byte(tag: u8, value: &[u8]) -> Result<u8, TlvError> {
    match value {
        [byte] => Ok(*byte),
        _ => Err(TlvError::InvalidValueLength {
            tag,
            len: value.len(),
        }),
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

/// Decodes a READ CONFIG response payload.
///
/// # Errors
///
/// Returns [`TlvError`] if the framing is broken or a known record has a
/// value of the wrong size.  Unknown tags are skipped.
pub fn parse_read_response(payload: &[u8]) -> Result<DeviceInfo, TlvError> {
    let mut info = DeviceInfo::default();

    for record in TlvReader::new(unwrap_body(payload)?) {
        let record = record?;
        let (tag, value) = (record.tag, record.value);
        match tag {
            TAG_USB_SUPPORTED | TAG_NFC_SUPPORTED => {
                let interface = if tag == TAG_USB_SUPPORTED { Interface::Usb } else { Interface::Nfc };
                info.capabilities.supported.insert(interface, bitmask(tag, value)?);
            }
            TAG_USB_ENABLED | TAG_NFC_ENABLED => {
                let interface = if tag == TAG_USB_ENABLED { Interface::Usb } else { Interface::Nfc };
                info.capabilities.enabled.insert(interface, bitmask(tag, value)?);
            }
            TAG_SERIAL => info.serial = Some(read_uint(tag, value)?),
            TAG_FORM_FACTOR => info.form_factor = Some(FormFactor::from_byte(single_byte(tag, value)?)),
            TAG_VERSION => {
                info.version = Some(Version::from_bytes(value).ok_or(TlvError::InvalidValueLength {
                    tag,
                    len: value.len(),
                })?);
            }
            TAG_AUTO_EJECT_TIMEOUT => {
                if value.len() > 2 {
                    return Err(TlvError::InvalidValueLength { tag, len: value.len() });
                }
                info.auto_eject_timeout = Some(read_uint(tag, value)? as u16);
            }
            TAG_CHALRESP_TIMEOUT => info.challenge_response_timeout = Some(single_byte(tag, value)?),
            TAG_DEVICE_FLAGS => info.device_flags = Some(single_byte(tag, value)?),
            TAG_CONFIG_LOCK => info.config_locked = single_byte(tag, value)? != 0,
            other => trace!(tag = other, len = value.len(), "skipping unknown configuration tag"),
        }
    }

    Ok(info)
}

/// Encodes `info` the way the device reports it.
///
/// Used by device simulators and tests; hosts never send this payload.
///
/// # Errors
///
/// Returns [`TlvError::PayloadTooLong`] if the result does not fit one byte
/// of length.
pub fn encode_read_response(info: &DeviceInfo) -> Result<Vec<u8>, TlvError> {
    let mut body = Vec::new();
    let caps = &info.capabilities;

    for interface in Interface::ALL {
        if let Some(supported) = caps.supported.get(&interface) {
            write_tlv(&mut body, supported_tag(interface), &supported.bits().to_be_bytes())?;
        }
    }
    if let Some(serial) = info.serial {
        write_tlv(&mut body, TAG_SERIAL, &serial.to_be_bytes())?;
    }
    for interface in Interface::ALL {
        if let Some(enabled) = caps.enabled.get(&interface) {
            write_tlv(&mut body, enabled_tag(interface), &enabled.bits().to_be_bytes())?;
        }
    }
    if let Some(form_factor) = info.form_factor {
        write_tlv(&mut body, TAG_FORM_FACTOR, &[form_factor.to_byte()])?;
    }
    if let Some(version) = info.version {
        write_tlv(&mut body, TAG_VERSION, &version.to_bytes())?;
    }
    if let Some(timeout) = info.auto_eject_timeout {
        write_tlv(&mut body, TAG_AUTO_EJECT_TIMEOUT, &timeout.to_be_bytes())?;
    }
    if let Some(timeout) = info.challenge_response_timeout {
        write_tlv(&mut body, TAG_CHALRESP_TIMEOUT, &[timeout])?;
    }
    if let Some(flags) = info.device_flags {
        write_tlv(&mut body, TAG_DEVICE_FLAGS, &[flags])?;
    }
    write_tlv(&mut body, TAG_CONFIG_LOCK, &[u8::from(info.config_locked)])?;

    wrap_body(body)
}

// ── Write ─────────────────────────────────────────────────────────────────────

/// Encodes a WRITE CONFIG payload: one enabled bitmask per interface present
/// in `config`, then the reboot record if requested.
///
/// # Errors
///
/// Returns [`TlvError::PayloadTooLong`] if the result does not fit one byte
/// of length.
///
/// # Examples
///
/// ```rust
/// use keylink_core::{Capability, DeviceConfig, Interface};
/// use keylink_core::management::build_write_payload;
///
/// let mut config = DeviceConfig::default();
/// config.enabled.insert(Interface::Usb, Capability::OATH);
/// config.reboot = true;
///
/// let payload = build_write_payload(&config).unwrap();
/// assert_eq!(payload, vec![0x06, 0x03, 0x02, 0x00, 0x20, 0x0C, 0x00]);
/// ```
pub fn build_write_payload(config: &DeviceConfig) -> Result<Vec<u8>, TlvError> {
    let mut body = Vec::new();
    for (interface, enabled) in &config.enabled {
        write_tlv(&mut body, enabled_tag(*interface), &enabled.bits().to_be_bytes())?;
    }
    if config.reboot {
        write_tlv(&mut body, TAG_REBOOT, &[])?;
    }
    wrap_body(body)
}

/// Decodes a WRITE CONFIG payload.  Records other than the enabled bitmasks
/// and the reboot flag are skipped.
///
/// # Errors
///
/// Returns [`TlvError`] if the framing is broken.
pub fn parse_write_payload(payload: &[u8]) -> Result<DeviceConfig, TlvError> {
    let mut config = DeviceConfig::default();
    for record in TlvReader::new(unwrap_body(payload)?) {
        let record = record?;
        match record.tag {
            TAG_USB_ENABLED => {
                config.enabled.insert(Interface::Usb, bitmask(record.tag, record.value)?);
            }
            TAG_NFC_ENABLED => {
                config.enabled.insert(Interface::Nfc, bitmask(record.tag, record.value)?);
            }
            TAG_REBOOT => config.reboot = true,
            other => trace!(tag = other, "skipping configuration tag in write payload"),
        }
    }
    Ok(config)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
