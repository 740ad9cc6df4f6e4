//! Physical properties of a key: its interfaces, form factor and firmware.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A physical interface the key can expose applications on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interface {
    Usb,
    Nfc,
}

impl Interface {
    pub const ALL: [Interface; 2] = [Interface::Usb, Interface::Nfc];
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interface::Usb => f.write_str("USB"),
            Interface::Nfc => f.write_str("NFC"),
        }
    }
}

/// Physical shape of the key.
///
/// Only the low nibble of the reported byte names the shape; the high bits
/// carry unrelated flags and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormFactor {
    UsbAKeychain,
    UsbANano,
    UsbCKeychain,
    UsbCNano,
    UsbCLightning,
    UsbABio,
    UsbCBio,
    Unknown(u8),
}

impl FormFactor {
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x0F {
            0x01 => FormFactor::UsbAKeychain,
            0x02 => FormFactor::UsbANano,
            0x03 => FormFactor::UsbCKeychain,
            0x04 => FormFactor::UsbCNano,
            0x05 => FormFactor::UsbCLightning,
            0x06 => FormFactor::UsbABio,
            0x07 => FormFactor::UsbCBio,
            other => FormFactor::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FormFactor::UsbAKeychain => 0x01,
            FormFactor::UsbANano => 0x02,
            FormFactor::UsbCKeychain => 0x03,
            FormFactor::UsbCNano => 0x04,
            FormFactor::UsbCLightning => 0x05,
            FormFactor::UsbABio => 0x06,
            FormFactor::UsbCBio => 0x07,
            FormFactor::Unknown(code) => code,
        }
    }
}

/// Firmware version `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the three-byte binary form used in the configuration TLV.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [major, minor, patch] => Some(Self::new(*major, *minor, *patch)),
            _ => None,
        }
    }

    pub const fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }

    /// Finds the last `a.b.c` token in free text, such as the banner a SELECT
    /// of the management application returns.
    pub fn find_in_text(text: &str) -> Option<Self> {
        text.split_whitespace().rev().find_map(|token| token.parse().ok())
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.').map(|p| p.parse::<u8>().map_err(|_| ()));
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(());
        };
        Ok(Self::new(major?, minor?, patch?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
