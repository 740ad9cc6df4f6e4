//! On-device applications and the session kinds that reach them.
//!
//! # Applications, AIDs and session kinds (for beginners)
//!
//! Every application on the key is addressed by a fixed *application
//! identifier* (AID), a short byte string registered with ISO.  The host
//! activates an application by sending SELECT with its AID; from then on every
//! command on the link goes to that application until something else is
//! selected.
//!
//! A [`SessionKind`] is what a client asks for.  Most kinds map one-to-one onto
//! an application, but two pairs share one:
//!
//! - `Otp` and `ChallengeResponse` both talk to the OTP application.
//! - `U2f` and `Fido2` both talk to the FIDO application over ISO 7816.
//!
//! The management application reports which applications exist and which are
//! enabled as a [`Capability`] bit set per interface.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// An ISO 7816-4 application identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Aid(&'static [u8]);

impl Aid {
    /// Management application.
    pub const MANAGEMENT: Aid = Aid(&[0xA0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17]);
    /// OATH credential store.
    pub const OATH: Aid = Aid(&[0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01]);
    /// OTP application, also serving challenge-response slots.
    pub const OTP: Aid = Aid(&[0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01]);
    /// FIDO application (U2F and CTAP2 over ISO 7816).
    pub const FIDO: Aid = Aid(&[0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01]);
    /// PIV certificate store.
    pub const PIV: Aid = Aid(&[0xA0, 0x00, 0x00, 0x03, 0x08]);
    /// OpenPGP card application.
    pub const OPENPGP: Aid = Aid(&[0xD2, 0x76, 0x00, 0x01, 0x24, 0x01]);

    pub const fn as_bytes(&self) -> &'static [u8] {
        self.0
    }

    /// Looks up a known AID by its bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        [
            Self::MANAGEMENT,
            Self::OATH,
            Self::OTP,
            Self::FIDO,
            Self::PIV,
            Self::OPENPGP,
        ]
        .into_iter()
        .find(|aid| aid.0 == bytes)
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Application bit set as reported by the management application.
    ///
    /// Unknown bits are retained so a read-modify-write cycle never drops
    /// capabilities this crate does not name.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Capability: u16 {
        const OTP = 0x0001;
        const U2F = 0x0002;
        const OPENPGP = 0x0008;
        const PIV = 0x0010;
        const OATH = 0x0020;
        const FIDO2 = 0x0200;
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "0x{unknown:04X}")?;
        }
        Ok(())
    }
}

/// The kinds of logical session a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionKind {
    /// OATH credential store.
    Oath,
    /// One-time-password slots.
    Otp,
    /// FIDO U2F.
    U2f,
    /// FIDO2 / CTAP2.
    Fido2,
    /// PIV certificate store.
    Piv,
    /// HMAC challenge-response slots of the OTP application.
    ChallengeResponse,
    /// Device configuration management.
    Management,
}

impl SessionKind {
    pub const ALL: [SessionKind; 7] = [
        SessionKind::Oath,
        SessionKind::Otp,
        SessionKind::U2f,
        SessionKind::Fido2,
        SessionKind::Piv,
        SessionKind::ChallengeResponse,
        SessionKind::Management,
    ];

    /// The application this kind selects.
    pub const fn aid(self) -> Aid {
        match self {
            SessionKind::Oath => Aid::OATH,
            SessionKind::Otp | SessionKind::ChallengeResponse => Aid::OTP,
            SessionKind::U2f | SessionKind::Fido2 => Aid::FIDO,
            SessionKind::Piv => Aid::PIV,
            SessionKind::Management => Aid::MANAGEMENT,
        }
    }

    /// The capability bit that must be enabled for this kind to work.
    ///
    /// `None` for management, which cannot be disabled.
    pub const fn capability(self) -> Option<Capability> {
        match self {
            SessionKind::Oath => Some(Capability::OATH),
            SessionKind::Otp | SessionKind::ChallengeResponse => Some(Capability::OTP),
            SessionKind::U2f => Some(Capability::U2F),
            SessionKind::Fido2 => Some(Capability::FIDO2),
            SessionKind::Piv => Some(Capability::PIV),
            SessionKind::Management => None,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionKind::Oath => "oath",
            SessionKind::Otp => "otp",
            SessionKind::U2f => "u2f",
            SessionKind::Fido2 => "fido2",
            SessionKind::Piv => "piv",
            SessionKind::ChallengeResponse => "challenge-response",
            SessionKind::Management => "management",
        };
        f.write_str(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_maps_to_a_known_aid() {
        for kind in SessionKind::ALL {
            let aid = kind.aid();
            assert_eq!(Aid::from_bytes(aid.as_bytes()), Some(aid), "{kind}");
        }
    }

    #[test]
    fn test_shared_applications() {
        assert_eq!(SessionKind::Otp.aid(), SessionKind::ChallengeResponse.aid());
        assert_eq!(SessionKind::U2f.aid(), SessionKind::Fido2.aid());
        assert_ne!(SessionKind::Oath.aid(), SessionKind::Piv.aid());
    }

    #[test]
    fn test_management_has_no_capability_bit() {
        assert_eq!(SessionKind::Management.capability(), None);
        assert_eq!(SessionKind::Fido2.capability(), Some(Capability::FIDO2));
    }

    #[test]
    fn test_aid_display_is_spaced_hex() {
        assert_eq!(Aid::PIV.to_string(), "A0 00 00 03 08");
    }

    #[test]
    fn test_unknown_aid_is_none() {
        assert_eq!(Aid::from_bytes(&[0x01, 0x02, 0x03]), None);
    }

    #[test]
    fn test_capability_retains_unknown_bits() {
        let caps = Capability::from_bits_retain(0x0421);
        assert!(caps.contains(Capability::OTP | Capability::OATH));
        assert_eq!(caps.bits(), 0x0421);
        assert_eq!(caps.to_string(), "OTP, OATH, 0x0400");
    }

    #[test]
    fn test_empty_capability_displays_none() {
        assert_eq!(Capability::empty().to_string(), "none");
    }
}
