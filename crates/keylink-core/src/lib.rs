//! # keylink-core
//!
//! Shared library for keylink containing the APDU codec, the application
//! identifiers of every on-device application, the management configuration
//! TLV format, and the session generation counter.
//!
//! This crate is used by the host crate that owns the physical link.
//! It has zero dependencies on OS APIs, async runtimes, or device drivers.
//!
//! # Architecture overview (for beginners)
//!
//! A security token (a USB or NFC key) hosts several independent applications:
//! an OATH credential store, a PIV certificate store, a FIDO authenticator, a
//! management application, and so on.  The host talks to them over one
//! physical connection using ISO 7816-4 *APDUs*: small command frames answered
//! by response frames that end in a two-byte *status word*.  Before talking to
//! an application the host must SELECT it by its *AID*; only one application
//! is selected at a time.
//!
//! This crate (`keylink-core`) is the pure foundation.  It defines:
//!
//! - **`apdu`** – How commands and responses look on the wire: short and
//!   extended length encodings, command chaining, the `0x61XX` continuation,
//!   and status word classification.
//!
//! - **`domain`** – The fixed vocabulary of the device: session kinds and
//!   their AIDs, the application capability bit set, the physical interfaces
//!   (USB, NFC), form factors and firmware versions.
//!
//! - **`management`** – The binary TLV payload the management application
//!   uses to report and rewrite which applications are enabled per interface.
//!
//! - **`session`** – The generation counter that retires stale session
//!   handles, and the lifecycle states a logical session moves through.

pub mod apdu;
pub mod domain;
pub mod management;
pub mod session;

// Re-export the most-used types at the crate root so callers can write
// `keylink_core::CommandApdu` instead of `keylink_core::apdu::command::CommandApdu`.
pub use apdu::{
    decode_response, encode_command, ApduError, ApduFormat, ChainStep, CommandApdu, ResponseApdu,
    ResponseChain, StatusCategory, StatusWord,
};
pub use domain::{Aid, Capability, FormFactor, Interface, SessionKind, Version};
pub use management::{CapabilityRecord, DeviceConfig, DeviceInfo, TlvError};
pub use session::{Generation, GenerationCounter, SessionState, SessionStateCell};
