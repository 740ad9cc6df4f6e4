//! Command APDU encoding.
//!
//! Wire format (ISO 7816-4):
//! ```text
//! short:    [CLA][INS][P1][P2] ( [Lc:1][data:Lc] )? ( [Le:1] )?
//! extended: [CLA][INS][P1][P2] ( [00][Lc:2][data:Lc] )? ( [00]? [Le:2] )?
//! ```
//! In short form `Le = 00` means 256; in extended form `Le = 0000` means 65536.
//! The extra `00` before an extended `Le` is only present when there is no
//! data field.
//!
//! # Chaining vs extended length
//!
//! A command whose data does not fit in 255 bytes can travel in two ways.  If
//! the transport supports extended length it is sent as one extended frame.
//! Otherwise it is *chained*: split into short frames, each but the last with
//! bit `0x10` set in CLA, and the device reassembles them.

use serde::{Deserialize, Serialize};

use super::ApduError;
use crate::domain::Aid;

/// Largest data field of a short-form command.
pub const SHORT_MAX_DATA: usize = 255;
/// Largest expected length of a short-form command.
pub const SHORT_MAX_LE: usize = 256;
/// Largest data field of an extended-form command.
pub const EXTENDED_MAX_DATA: usize = 65_535;
/// Largest expected length of an extended-form command.
pub const EXTENDED_MAX_LE: usize = 65_536;

/// CLA bit flagging "more command data follows".
pub const CLA_CHAINING: u8 = 0x10;

/// SELECT instruction.
pub const INS_SELECT: u8 = 0xA4;
/// SELECT P1: select by DF name (AID).
pub const P1_SELECT_BY_NAME: u8 = 0x04;
/// GET RESPONSE instruction.
pub const INS_GET_RESPONSE: u8 = 0xC0;

/// Which length encoding a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApduFormat {
    Short,
    Extended,
}

/// A command APDU before encoding.
///
/// `le` is the expected response length; `None` means the command expects no
/// response data.  `Some(0)` and `Some(256)` both encode as the short-form
/// maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<usize>,
}

impl CommandApdu {
    /// Creates a command with no data and no expected length.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Sets the data field.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the expected response length.
    pub fn with_le(mut self, le: usize) -> Self {
        self.le = Some(le);
        self
    }

    /// `00 A4 04 00 Lc <aid>`: selects an application by AID.
    pub fn select(aid: &Aid) -> Self {
        Self::new(0x00, INS_SELECT, P1_SELECT_BY_NAME, 0x00).with_data(aid.as_bytes())
    }

    /// `00 C0 00 00 Le`: fetches `len` bytes announced by a `61 XX` status.
    pub fn get_response(len: usize) -> Self {
        Self::new(0x00, INS_GET_RESPONSE, 0x00, 0x00).with_le(len)
    }

    /// Returns `true` if the command is part of a chain and more frames follow.
    pub fn is_chained(&self) -> bool {
        self.cla & CLA_CHAINING != 0
    }

    /// Returns `true` if both the data and the expected length fit short form.
    pub fn fits_short(&self) -> bool {
        self.data.len() <= SHORT_MAX_DATA && self.le.map_or(true, |le| le <= SHORT_MAX_LE)
    }

    /// Encodes this command in the requested format.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError::DataTooLong`] or [`ApduError::ExpectedLengthTooLong`]
    /// if the command does not fit `format`.
    pub fn encode(&self, format: ApduFormat) -> Result<Vec<u8>, ApduError> {
        let (max_data, max_le) = match format {
            ApduFormat::Short => (SHORT_MAX_DATA, SHORT_MAX_LE),
            ApduFormat::Extended => (EXTENDED_MAX_DATA, EXTENDED_MAX_LE),
        };
        if self.data.len() > max_data {
            return Err(ApduError::DataTooLong {
                len: self.data.len(),
                max: max_data,
                format,
            });
        }
        if let Some(le) = self.le {
            if le > max_le {
                return Err(ApduError::ExpectedLengthTooLong {
                    le,
                    max: max_le,
                    format,
                });
            }
        }

        let mut buf = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        buf.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        match format {
            ApduFormat::Short => {
                if !self.data.is_empty() {
                    buf.push(self.data.len() as u8);
                    buf.extend_from_slice(&self.data);
                }
                if let Some(le) = self.le {
                    // 256 wraps to 0x00
                    buf.push((le % 256) as u8);
                }
            }
            ApduFormat::Extended => {
                if !self.data.is_empty() {
                    buf.push(0x00);
                    buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                    buf.extend_from_slice(&self.data);
                }
                if let Some(le) = self.le {
                    if self.data.is_empty() {
                        buf.push(0x00);
                    }
                    // 65536 wraps to 0x0000
                    buf.extend_from_slice(&((le % 65_536) as u16).to_be_bytes());
                }
            }
        }
        Ok(buf)
    }

    /// Splits the command into short frames of at most `chunk_size` data bytes.
    ///
    /// Every frame but the last carries [`CLA_CHAINING`]; only the last frame
    /// carries the expected length, clamped to the short-form maximum.
    pub fn chain(&self, chunk_size: usize) -> Vec<CommandApdu> {
        let chunk_size = chunk_size.clamp(1, SHORT_MAX_DATA);
        let last_le = self.le.map(|le| le.min(SHORT_MAX_LE));

        if self.data.len() <= chunk_size {
            let mut single = self.clone();
            single.le = last_le;
            return vec![single];
        }

        let chunks: Vec<&[u8]> = self.data.chunks(chunk_size).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| CommandApdu {
                cla: if i < last { self.cla | CLA_CHAINING } else { self.cla },
                ins: self.ins,
                p1: self.p1,
                p2: self.p2,
                data: chunk.to_vec(),
                le: if i < last { None } else { last_le },
            })
            .collect()
    }

    /// Encodes the command into the frames that actually go on the wire.
    ///
    /// Short commands produce one short frame.  Longer commands produce one
    /// extended frame when `extended_length` is supported, otherwise a chain
    /// of short frames of `chunk_size` data bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError`] if the command exceeds even the extended limits.
    pub fn to_frames(
        &self,
        extended_length: bool,
        chunk_size: usize,
    ) -> Result<Vec<Vec<u8>>, ApduError> {
        if self.fits_short() {
            return Ok(vec![self.encode(ApduFormat::Short)?]);
        }
        if extended_length {
            return Ok(vec![self.encode(ApduFormat::Extended)?]);
        }
        self.chain(chunk_size)
            .iter()
            .map(|frame| frame.encode(ApduFormat::Short))
            .collect()
    }

    /// Parses a raw command frame in either format.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError::MalformedCommand`] if the lengths do not add up.
    pub fn parse(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 4 {
            return Err(ApduError::MalformedCommand(format!(
                "need at least 4 header bytes, got {}",
                bytes.len()
            )));
        }
        let mut cmd = CommandApdu::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[4..];

        match body.len() {
            0 => {}
            1 => cmd.le = Some(short_le(body[0])),
            _ if body[0] != 0x00 => {
                let lc = body[0] as usize;
                match body.len().checked_sub(1 + lc) {
                    Some(0) => {}
                    Some(1) => cmd.le = Some(short_le(body[1 + lc])),
                    _ => {
                        return Err(ApduError::MalformedCommand(format!(
                            "short Lc {lc} does not match body of {} bytes",
                            body.len()
                        )))
                    }
                }
                cmd.data = body[1..1 + lc].to_vec();
            }
            3 => cmd.le = Some(extended_le(body[1], body[2])),
            n if n > 3 => {
                let lc = u16::from_be_bytes([body[1], body[2]]) as usize;
                match body.len().checked_sub(3 + lc) {
                    Some(0) => {}
                    Some(2) => cmd.le = Some(extended_le(body[3 + lc], body[4 + lc])),
                    _ => {
                        return Err(ApduError::MalformedCommand(format!(
                            "extended Lc {lc} does not match body of {n} bytes"
                        )))
                    }
                }
                cmd.data = body[3..3 + lc].to_vec();
            }
            n => {
                return Err(ApduError::MalformedCommand(format!(
                    "unparseable body of {n} bytes"
                )))
            }
        }
        Ok(cmd)
    }
}

fn short_le(byte: u8) -> usize {
    if byte == 0 {
        SHORT_MAX_LE
    } else {
        byte as usize
    }
}

fn extended_le(hi: u8, lo: u8) -> usize {
    match u16::from_be_bytes([hi, lo]) {
        0 => EXTENDED_MAX_LE,
        n => n as usize,
    }
}

/// Encodes a command in the smallest format that fits.
///
/// Short form is used when possible, extended form otherwise.  Use
/// [`CommandApdu::to_frames`] when the transport cannot carry extended frames.
///
/// # Errors
///
/// Returns [`ApduError`] if the command exceeds the extended limits.
///
/// # Examples
///
/// ```rust
/// use keylink_core::encode_command;
///
/// let bytes = encode_command(0x00, 0xA4, 0x04, 0x00, &[0xA0, 0x00], None).unwrap();
/// assert_eq!(bytes, vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0xA0, 0x00]);
/// ```
pub fn encode_command(
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: &[u8],
    le: Option<usize>,
) -> Result<Vec<u8>, ApduError> {
    let cmd = CommandApdu {
        cla,
        ins,
        p1,
        p2,
        data: data.to_vec(),
        le,
    };
    let format = if cmd.fits_short() {
        ApduFormat::Short
    } else {
        ApduFormat::Extended
    };
    cmd.encode(format)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
