//! ISO 7816-4 APDU codec.
//!
//! - **`command`** – command frames: short/extended encoding and chaining.
//! - **`response`** – response frames: payload plus trailing status word.
//! - **`status`** – status word constants and coarse classification.

pub mod command;
pub mod response;
pub mod status;

use thiserror::Error;

pub use command::{encode_command, ApduFormat, CommandApdu};
pub use response::{decode_response, ChainStep, ResponseApdu, ResponseChain};
pub use status::{StatusCategory, StatusWord};

/// Errors that can occur while encoding or decoding APDU frames.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ApduError {
    /// A response frame is shorter than the two status bytes.
    #[error("response too short: need at least 2 bytes, got {0}")]
    ResponseTooShort(usize),

    /// The command data does not fit the selected length encoding.
    #[error("command data of {len} bytes exceeds the {max}-byte limit of {format:?} encoding")]
    DataTooLong {
        len: usize,
        max: usize,
        format: ApduFormat,
    },

    /// The expected response length does not fit the selected encoding.
    #[error("expected length {le} exceeds the {max}-byte limit of {format:?} encoding")]
    ExpectedLengthTooLong {
        le: usize,
        max: usize,
        format: ApduFormat,
    },

    /// A raw command frame could not be parsed.
    #[error("malformed command frame: {0}")]
    MalformedCommand(String),

    /// The device kept answering `61 XX` past the configured round limit.
    #[error("response still incomplete after {0} GET RESPONSE rounds")]
    TooManyContinuations(usize),
}
