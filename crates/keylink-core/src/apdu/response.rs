//! Response APDU decoding and `61 XX` continuation.
//!
//! Wire format: `[data:N][SW1][SW2]` with `N >= 0`.
//!
//! When a response does not fit in one frame the device answers `61 XX`
//! together with the first part of the data.  [`ResponseChain`] is a small
//! state machine that tells the caller which GET RESPONSE to send next and
//! concatenates the fragments until a terminal status word arrives.  It does
//! no I/O itself; the host drives it from its transport loop.

use super::{ApduError, CommandApdu, StatusWord};

/// A decoded response: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    data: Vec<u8>,
    status: StatusWord,
}

impl ResponseApdu {
    pub fn new(data: impl Into<Vec<u8>>, status: StatusWord) -> Self {
        Self {
            data: data.into(),
            status,
        }
    }

    /// A `90 00` response carrying `data`.
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, StatusWord::SUCCESS)
    }

    /// A response with no payload, only a status word.
    pub fn status_only(status: StatusWord) -> Self {
        Self::new(Vec::new(), status)
    }

    /// Splits a raw frame into payload and status word.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError::ResponseTooShort`] for frames under two bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApduError> {
        let (data, status) = decode_response(bytes)?;
        Ok(Self { data, status })
    }

    /// Serialises back to `[data][SW1][SW2]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 2);
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.status.to_bytes());
        buf
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn status(&self) -> StatusWord {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Appends a continuation fragment: its data goes after ours and its
    /// status word replaces ours.
    pub fn append(&mut self, next: ResponseApdu) {
        self.data.extend_from_slice(&next.data);
        self.status = next.status;
    }
}

/// Splits a raw response frame into `(payload, status)`.
///
/// # Errors
///
/// Returns [`ApduError::ResponseTooShort`] if `bytes` has fewer than two bytes.
///
/// # Examples
///
/// ```rust
/// use keylink_core::{decode_response, StatusWord};
///
/// let (data, sw) = decode_response(&[0x01, 0x02, 0x90, 0x00]).unwrap();
/// assert_eq!(data, vec![0x01, 0x02]);
/// assert_eq!(sw, StatusWord::SUCCESS);
/// ```
pub fn decode_response(bytes: &[u8]) -> Result<(Vec<u8>, StatusWord), ApduError> {
    if bytes.len() < 2 {
        return Err(ApduError::ResponseTooShort(bytes.len()));
    }
    let split = bytes.len() - 2;
    let status = StatusWord::from_bytes(bytes[split], bytes[split + 1]);
    Ok((bytes[..split].to_vec(), status))
}

/// What the caller should do after feeding a fragment to [`ResponseChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStep {
    /// Send this GET RESPONSE and feed its answer back in.
    Fetch(CommandApdu),
    /// The response is complete.
    Complete(ResponseApdu),
}

/// Accumulates `61 XX` continuation fragments into one response.
#[derive(Debug)]
pub struct ResponseChain {
    assembled: ResponseApdu,
    rounds: usize,
    limit: usize,
}

impl ResponseChain {
    /// Creates an empty chain that allows at most `limit` GET RESPONSE rounds.
    pub fn new(limit: usize) -> Self {
        Self {
            assembled: ResponseApdu::status_only(StatusWord::SUCCESS),
            rounds: 0,
            limit,
        }
    }

    /// Number of GET RESPONSE commands requested so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Feeds the next fragment.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError::TooManyContinuations`] when another round would
    /// exceed the limit.
    pub fn push(&mut self, fragment: ResponseApdu) -> Result<ChainStep, ApduError> {
        let more = fragment.status().remaining_bytes();
        self.assembled.append(fragment);

        match more {
            Some(len) => {
                if self.rounds >= self.limit {
                    return Err(ApduError::TooManyContinuations(self.rounds));
                }
                self.rounds += 1;
                Ok(ChainStep::Fetch(CommandApdu::get_response(len)))
            }
            None => Ok(ChainStep::Complete(std::mem::replace(
                &mut self.assembled,
                ResponseApdu::status_only(StatusWord::SUCCESS),
            ))),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
