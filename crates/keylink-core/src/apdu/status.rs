//! Status words: the two-byte trailer on every response frame.
//!
//! # How status words are read (for beginners)
//!
//! The first byte (`SW1`) carries the broad meaning and the second (`SW2`)
//! the detail.  Three shapes matter to the transaction layer:
//!
//! - `90 00` – the command succeeded.
//! - `61 XX` – the command succeeded but `XX` more response bytes are waiting;
//!   the host must fetch them with GET RESPONSE (`XX == 00` means 256).
//! - anything else – an error the device reports for the caller to interpret.
//!
//! Everything outside the first two shapes is passed through unchanged and
//! tagged with a coarse [`StatusCategory`] for logging and error messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A response status word (`SW1 SW2`) as a big-endian `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// `90 00`: normal processing.
    pub const SUCCESS: Self = Self(0x9000);
    /// `67 00`: wrong length.
    pub const WRONG_LENGTH: Self = Self(0x6700);
    /// `69 82`: security status not satisfied.
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    /// `69 85`: conditions of use not satisfied.
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    /// `6A 80`: incorrect parameters in the data field.
    pub const WRONG_DATA: Self = Self(0x6A80);
    /// `6A 82`: file or application not found.
    pub const NOT_FOUND: Self = Self(0x6A82);
    /// `6A 86`: incorrect P1/P2.
    pub const INCORRECT_PARAMETERS: Self = Self(0x6A86);
    /// `6D 00`: instruction not supported.
    pub const INS_NOT_SUPPORTED: Self = Self(0x6D00);
    /// `6E 00`: class not supported.
    pub const CLA_NOT_SUPPORTED: Self = Self(0x6E00);
    /// `6F 00`: no precise diagnosis.
    pub const NO_PRECISE_DIAGNOSIS: Self = Self(0x6F00);

    /// `SW1` value signalling that more response data is available.
    pub const MORE_DATA_SW1: u8 = 0x61;

    /// Builds a status word from its two bytes.
    pub const fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    /// Returns `[SW1, SW2]`.
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub const fn sw1(self) -> u8 {
        self.to_bytes()[0]
    }

    pub const fn sw2(self) -> u8 {
        self.to_bytes()[1]
    }

    /// Returns `true` only for `90 00`.
    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// For a `61 XX` status word returns how many bytes GET RESPONSE should
    /// ask for (`XX`, with `00` meaning 256).  Returns `None` otherwise.
    pub const fn remaining_bytes(self) -> Option<usize> {
        if self.sw1() == Self::MORE_DATA_SW1 {
            let xx = self.sw2() as usize;
            Some(if xx == 0 { 256 } else { xx })
        } else {
            None
        }
    }

    /// Coarse classification used in logs and error messages.
    pub fn category(self) -> StatusCategory {
        match self {
            Self::SUCCESS => StatusCategory::Success,
            Self::NOT_FOUND => StatusCategory::ApplicationNotFound,
            Self::SECURITY_STATUS_NOT_SATISFIED => StatusCategory::SecurityNotSatisfied,
            Self::CONDITIONS_NOT_SATISFIED => StatusCategory::ConditionsNotSatisfied,
            Self::WRONG_DATA | Self::INCORRECT_PARAMETERS => StatusCategory::WrongData,
            Self::INS_NOT_SUPPORTED => StatusCategory::InstructionNotSupported,
            Self::CLA_NOT_SUPPORTED => StatusCategory::ClassNotSupported,
            _ if self.sw1() == Self::MORE_DATA_SW1 => StatusCategory::MoreData,
            _ if self.sw1() == 0x67 || self.sw1() == 0x6C => StatusCategory::WrongLength,
            _ => StatusCategory::Other,
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({})", self.0, self.category())
    }
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Coarse meaning of a status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCategory {
    Success,
    MoreData,
    ApplicationNotFound,
    SecurityNotSatisfied,
    ConditionsNotSatisfied,
    WrongLength,
    WrongData,
    InstructionNotSupported,
    ClassNotSupported,
    Other,
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::MoreData => "more data available",
            Self::ApplicationNotFound => "application not found",
            Self::SecurityNotSatisfied => "security status not satisfied",
            Self::ConditionsNotSatisfied => "conditions not satisfied",
            Self::WrongLength => "wrong length",
            Self::WrongData => "wrong data",
            Self::InstructionNotSupported => "instruction not supported",
            Self::ClassNotSupported => "class not supported",
            Self::Other => "device error",
        };
        f.write_str(text)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
