//! Tag-length-value records of the management configuration payload.
//!
//! Each record is `[tag:1][len][value:len]`.  Lengths below `0x80` take one
//! byte; `0x81 LL` and `0x82 LL LL` carry longer values.  The device only ever
//! sends short lengths, but the long forms are accepted when reading.

use super::TlvError;

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Applications supported over USB (bitmask).
pub const TAG_USB_SUPPORTED: u8 = 0x01;
/// Device serial number (big-endian `u32`).
pub const TAG_SERIAL: u8 = 0x02;
/// Applications enabled over USB (bitmask).
pub const TAG_USB_ENABLED: u8 = 0x03;
/// Form factor byte.
pub const TAG_FORM_FACTOR: u8 = 0x04;
/// Firmware version, three bytes.
pub const TAG_VERSION: u8 = 0x05;
/// Auto-eject timeout in seconds (big-endian `u16`).
pub const TAG_AUTO_EJECT_TIMEOUT: u8 = 0x06;
/// Challenge-response timeout in seconds.
pub const TAG_CHALRESP_TIMEOUT: u8 = 0x07;
/// Device flags byte.
pub const TAG_DEVICE_FLAGS: u8 = 0x08;
/// Non-zero when the configuration is protected by a lock code.
pub const TAG_CONFIG_LOCK: u8 = 0x0A;
/// Present (with no value) to request a reboot after a write.
pub const TAG_REBOOT: u8 = 0x0C;
/// Applications supported over NFC (bitmask).
pub const TAG_NFC_SUPPORTED: u8 = 0x0D;
/// Applications enabled over NFC (bitmask).
pub const TAG_NFC_ENABLED: u8 = 0x0E;

/// One decoded record borrowing its value from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Iterates over the records of a payload body.
///
/// Yields an error and then stops if a record is truncated.
pub struct TlvReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }

    fn read_one(&mut self) -> Result<Tlv<'a>, TlvError> {
        let tag = self.buf[0];
        let rest = &self.buf[1..];

        let (len, header) = match rest.first() {
            None => return Err(TlvError::Truncated { tag, needed: 1, available: 0 }),
            Some(&0x81) => {
                let byte = *rest.get(1).ok_or(TlvError::Truncated {
                    tag,
                    needed: 2,
                    available: rest.len(),
                })?;
                (byte as usize, 2)
            }
            Some(&0x82) => {
                if rest.len() < 3 {
                    return Err(TlvError::Truncated {
                        tag,
                        needed: 3,
                        available: rest.len(),
                    });
                }
                (u16::from_be_bytes([rest[1], rest[2]]) as usize, 3)
            }
            Some(&b) if b >= 0x80 => return Err(TlvError::UnsupportedLengthForm(b)),
            Some(&b) => (b as usize, 1),
        };

        let body = &rest[header..];
        if body.len() < len {
            return Err(TlvError::Truncated {
                tag,
                needed: len,
                available: body.len(),
            });
        }
        self.buf = &body[len..];
        Ok(Tlv {
            tag,
            value: &body[..len],
        })
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<Tlv<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        let item = self.read_one();
        self.failed = item.is_err();
        Some(item)
    }
}

/// Appends one record with a short length.
///
/// # Errors
///
/// Returns [`TlvError::ValueTooLong`] for values of 128 bytes or more.
pub fn write_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<(), TlvError> {
    if value.len() >= 0x80 {
        return Err(TlvError::ValueTooLong {
            tag,
            len: value.len(),
        });
    }
    buf.push(tag);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
    Ok(())
}

/// Reads a big-endian unsigned integer of one to four bytes.
pub fn read_uint(tag: u8, value: &[u8]) -> Result<u32, TlvError> {
    if value.is_empty() || value.len() > 4 {
        return Err(TlvError::InvalidValueLength {
            tag,
            len: value.len(),
        });
    }
    Ok(value.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buf: &[u8]) -> Result<Vec<Tlv<'_>>, TlvError> {
        TlvReader::new(buf).collect()
    }

    #[test]
    fn test_reads_consecutive_records() {
        let records = collect(&[0x01, 0x01, 0x3F, 0x0C, 0x00]).unwrap();
        assert_eq!(
            records,
            vec![
                Tlv { tag: 0x01, value: &[0x3F] },
                Tlv { tag: 0x0C, value: &[] },
            ]
        );
    }

    #[test]
    fn test_reads_long_length_forms() {
        let mut buf = vec![0x02, 0x81, 0x03, 1, 2, 3];
        buf.extend_from_slice(&[0x05, 0x82, 0x00, 0x02, 9, 9]);
        let records = collect(&buf).unwrap();
        assert_eq!(records[0].value, &[1, 2, 3]);
        assert_eq!(records[1].value, &[9, 9]);
    }

    #[test]
    fn test_truncated_value_is_error() {
        let result = collect(&[0x03, 0x02, 0x00]);
        assert_eq!(
            result,
            Err(TlvError::Truncated { tag: 0x03, needed: 2, available: 1 })
        );
    }

    #[test]
    fn test_missing_length_is_error() {
        assert!(matches!(collect(&[0x01]), Err(TlvError::Truncated { tag: 0x01, .. })));
    }

    #[test]
    fn test_reader_stops_after_error() {
        let mut reader = TlvReader::new(&[0x01, 0x05, 0x00]);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_write_tlv() {
        let mut buf = Vec::new();
        write_tlv(&mut buf, TAG_USB_ENABLED, &[0x00, 0x20]).unwrap();
        write_tlv(&mut buf, TAG_REBOOT, &[]).unwrap();
        assert_eq!(buf, vec![0x03, 0x02, 0x00, 0x20, 0x0C, 0x00]);
    }

    #[test]
    fn test_write_tlv_rejects_long_value() {
        let mut buf = Vec::new();
        let result = write_tlv(&mut buf, 0x02, &[0u8; 200]);
        assert_eq!(result, Err(TlvError::ValueTooLong { tag: 0x02, len: 200 }));
    }

    #[test]
    fn test_read_uint() {
        assert_eq!(read_uint(0x02, &[0x00, 0xBC, 0x61, 0x4E]).unwrap(), 12_345_678);
        assert_eq!(read_uint(0x01, &[0x3F]).unwrap(), 0x3F);
        assert!(read_uint(0x01, &[]).is_err());
    }
}
