//! Wire Protocol for the Option Tick Feed
//!
//! Variable-length binary frames, little-endian. One frame carries either a
//! batch of per-instrument tick entries or a market-status notice.
//!
//! ```text
//! Header (8 bytes):
//! Offset  Size  Field
//! 0       2     magic (0xFEED)
//! 2       1     version
//! 3       1     kind (0 = tick batch, 1 = market status)
//! 4       2     count (entries) / status text length (bytes)
//! 6       2     reserved (0)
//!
//! Tick entry:
//! 0       2     entry_len (bytes, including this field)
//! 2       2     key_len
//! 4       n     instrument key (UTF-8)
//! 4+n     1     sections bitmask
//! ...           f64 fields per present section, in section order
//! ```
//!
//! Sections: LTPC (last_price, prev_close), MARKET (open_interest,
//! implied_vol), GREEKS (delta, gamma, vega, theta). A section absent from
//! the bitmask decodes every one of its fields to 0.0. An entry whose body
//! does not parse is skipped via `entry_len`; the rest of the batch survives.

use std::collections::HashMap;

/// Magic bytes for feed frames.
pub const FEED_MAGIC: u16 = 0xFEED;

/// Current protocol version.
pub const FEED_VERSION: u8 = 1;

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Frame kind discriminators.
pub const KIND_TICKS: u8 = 0;
pub const KIND_MARKET_STATUS: u8 = 1;

/// Section bitmask values for a tick entry.
#[allow(non_snake_case)]
pub mod Sections {
    /// last_price + prev_close
    pub const LTPC: u8 = 0x01;
    /// open_interest + implied_vol
    pub const MARKET: u8 = 0x02;
    /// delta, gamma, vega, theta
    pub const GREEKS: u8 = 0x04;
}

/// Decoded per-instrument field bag. Fields from sections absent on the wire
/// are 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickFields {
    pub last_price: f64,
    pub prev_close: f64,
    pub open_interest: f64,
    pub implied_vol: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Live data: instrument key -> field bag. May be empty.
    Ticks(HashMap<String, TickFields>),
    /// Non-tick control notice (e.g. "NORMAL_OPEN", "CLOSING_END").
    MarketStatus(String),
}

/// Whole-frame decode failures. Damage inside a single entry never produces
/// one of these; the entry is skipped instead.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    TooShort(usize),
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    UnknownKind(u8),
    Truncated { expected: usize, actual: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(n) => write!(f, "frame too short: {} bytes (header is {})", n, HEADER_SIZE),
            Self::InvalidMagic(m) => write!(f, "invalid magic: 0x{:04X} (expected 0x{:04X})", m, FEED_MAGIC),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version: {} (expected {})", v, FEED_VERSION),
            Self::UnknownKind(k) => write!(f, "unknown frame kind: {}", k),
            Self::Truncated { expected, actual } => {
                write!(f, "frame truncated: need {} bytes, have {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn read_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_le_bytes(buf[at..at + 8].try_into().expect("8-byte slice"))
}

/// Decode one raw frame. Pure and deterministic; no I/O.
pub fn decode_frame(buf: &[u8]) -> Result<DecodedFrame, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort(buf.len()));
    }

    let magic = read_u16(buf, 0);
    if magic != FEED_MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }

    let version = buf[2];
    if version != FEED_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let kind = buf[3];
    let count = read_u16(buf, 4) as usize;
    let body = &buf[HEADER_SIZE..];

    match kind {
        KIND_TICKS => decode_tick_batch(body, count),
        KIND_MARKET_STATUS => {
            if body.len() < count {
                return Err(DecodeError::Truncated {
                    expected: HEADER_SIZE + count,
                    actual: buf.len(),
                });
            }
            let status = String::from_utf8_lossy(&body[..count]).into_owned();
            Ok(DecodedFrame::MarketStatus(status))
        }
        other => Err(DecodeError::UnknownKind(other)),
    }
}

fn decode_tick_batch(body: &[u8], count: usize) -> Result<DecodedFrame, DecodeError> {
    let mut feeds = HashMap::with_capacity(count);
    let mut offset = 0usize;

    for _ in 0..count {
        if body.len() < offset + 2 {
            // Ran out of entries before the declared count: the frame itself
            // is damaged, not just one entry.
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE + offset + 2,
                actual: HEADER_SIZE + body.len(),
            });
        }
        let entry_len = read_u16(body, offset) as usize;
        if entry_len < 2 || body.len() < offset + entry_len {
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE + offset + entry_len.max(2),
                actual: HEADER_SIZE + body.len(),
            });
        }

        let entry = &body[offset..offset + entry_len];
        offset += entry_len;

        // Entry-level damage is contained: skip this entry, keep the batch.
        if let Some((key, fields)) = decode_entry(entry) {
            feeds.insert(key, fields);
        }
    }

    Ok(DecodedFrame::Ticks(feeds))
}

/// Decode one entry (starting at its entry_len field). None on damage.
fn decode_entry(entry: &[u8]) -> Option<(String, TickFields)> {
    if entry.len() < 5 {
        return None;
    }
    let key_len = read_u16(entry, 2) as usize;
    let mask_at = 4 + key_len;
    if entry.len() < mask_at + 1 {
        return None;
    }

    let key = std::str::from_utf8(&entry[4..4 + key_len]).ok()?;
    if key.is_empty() {
        return None;
    }

    let sections = entry[mask_at];
    let mut fields = TickFields::default();
    let mut at = mask_at + 1;

    let mut take = |n: usize| -> Option<usize> {
        let start = at;
        if entry.len() < at + n * 8 {
            return None;
        }
        at += n * 8;
        Some(start)
    };

    if sections & Sections::LTPC != 0 {
        let s = take(2)?;
        fields.last_price = read_f64(entry, s);
        fields.prev_close = read_f64(entry, s + 8);
    }
    if sections & Sections::MARKET != 0 {
        let s = take(2)?;
        fields.open_interest = read_f64(entry, s);
        fields.implied_vol = read_f64(entry, s + 8);
    }
    if sections & Sections::GREEKS != 0 {
        let s = take(4)?;
        fields.delta = read_f64(entry, s);
        fields.gamma = read_f64(entry, s + 8);
        fields.vega = read_f64(entry, s + 16);
        fields.theta = read_f64(entry, s + 24);
    }

    Some((key.to_string(), fields))
}

// =============================================================================
// Encoding (used by the feed simulator and test fixtures)
// =============================================================================

/// Encode a tick batch frame.
pub fn encode_ticks<'a, I>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a TickFields, u8)>,
{
    let mut body = Vec::new();
    let mut count = 0u16;

    for (key, fields, sections) in entries {
        let mut entry = Vec::with_capacity(5 + key.len() + 8 * 8);
        entry.extend_from_slice(&0u16.to_le_bytes()); // entry_len placeholder
        entry.extend_from_slice(&(key.len() as u16).to_le_bytes());
        entry.extend_from_slice(key.as_bytes());
        entry.push(sections);

        if sections & Sections::LTPC != 0 {
            entry.extend_from_slice(&fields.last_price.to_le_bytes());
            entry.extend_from_slice(&fields.prev_close.to_le_bytes());
        }
        if sections & Sections::MARKET != 0 {
            entry.extend_from_slice(&fields.open_interest.to_le_bytes());
            entry.extend_from_slice(&fields.implied_vol.to_le_bytes());
        }
        if sections & Sections::GREEKS != 0 {
            entry.extend_from_slice(&fields.delta.to_le_bytes());
            entry.extend_from_slice(&fields.gamma.to_le_bytes());
            entry.extend_from_slice(&fields.vega.to_le_bytes());
            entry.extend_from_slice(&fields.theta.to_le_bytes());
        }

        let entry_len = entry.len() as u16;
        entry[0..2].copy_from_slice(&entry_len.to_le_bytes());
        body.extend_from_slice(&entry);
        count += 1;
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&FEED_MAGIC.to_le_bytes());
    frame.push(FEED_VERSION);
    frame.push(KIND_TICKS);
    frame.extend_from_slice(&count.to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Encode a market-status frame.
pub fn encode_market_status(status: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + status.len());
    frame.extend_from_slice(&FEED_MAGIC.to_le_bytes());
    frame.push(FEED_VERSION);
    frame.push(KIND_MARKET_STATUS);
    frame.extend_from_slice(&(status.len() as u16).to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(status.as_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_fields() -> TickFields {
        TickFields {
            last_price: 102.5,
            prev_close: 95.0,
            open_interest: 123456.0,
            implied_vol: 0.1842,
            delta: 0.55,
            gamma: 0.0021,
            vega: 8.4,
            theta: -4.2,
        }
    }

    const ALL: u8 = Sections::LTPC | Sections::MARKET | Sections::GREEKS;

    #[test]
    fn test_roundtrip_full_entry() {
        let fields = full_fields();
        let frame = encode_ticks([("NSE_FO|54321", &fields, ALL)]);
        let decoded = decode_frame(&frame).unwrap();

        let DecodedFrame::Ticks(feeds) = decoded else {
            panic!("expected tick batch");
        };
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds["NSE_FO|54321"], fields);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let fields = full_fields();
        let frame = encode_ticks([("A", &fields, ALL), ("B", &fields, Sections::LTPC)]);
        assert_eq!(decode_frame(&frame).unwrap(), decode_frame(&frame).unwrap());
    }

    #[test]
    fn test_empty_batch_decodes_to_empty_map() {
        let entries: Vec<(&str, &TickFields, u8)> = Vec::new();
        let frame = encode_ticks(entries);
        let DecodedFrame::Ticks(feeds) = decode_frame(&frame).unwrap() else {
            panic!("expected tick batch");
        };
        assert!(feeds.is_empty());
    }

    #[test]
    fn test_missing_greeks_section_defaults_to_zero() {
        let fields = full_fields();
        let frame = encode_ticks([("X", &fields, Sections::LTPC | Sections::MARKET)]);
        let DecodedFrame::Ticks(feeds) = decode_frame(&frame).unwrap() else {
            panic!("expected tick batch");
        };

        let x = &feeds["X"];
        assert_eq!(x.last_price, 102.5);
        assert_eq!(x.open_interest, 123456.0);
        assert_eq!(x.delta, 0.0);
        assert_eq!(x.gamma, 0.0);
        assert_eq!(x.vega, 0.0);
        assert_eq!(x.theta, 0.0);
    }

    #[test]
    fn test_malformed_entry_does_not_drop_batch() {
        let fields = full_fields();
        let mut frame = encode_ticks([
            ("GOOD1", &fields, ALL),
            ("BAD", &fields, Sections::LTPC),
            ("GOOD2", &fields, Sections::GREEKS),
        ]);

        // Corrupt the middle entry: claim LTPC but truncate its payload by
        // rewriting the mask to demand more sections than the entry carries.
        let first_len = u16::from_le_bytes([frame[8], frame[9]]) as usize;
        let second_at = 8 + first_len;
        let key_len = u16::from_le_bytes([frame[second_at + 2], frame[second_at + 3]]) as usize;
        frame[second_at + 4 + key_len] = ALL;

        let DecodedFrame::Ticks(feeds) = decode_frame(&frame).unwrap() else {
            panic!("expected tick batch");
        };
        assert_eq!(feeds.len(), 2);
        assert!(feeds.contains_key("GOOD1"));
        assert!(feeds.contains_key("GOOD2"));
        assert!(!feeds.contains_key("BAD"));
    }

    #[test]
    fn test_invalid_utf8_key_skips_entry_only() {
        let fields = full_fields();
        let mut frame = encode_ticks([("AB", &fields, Sections::LTPC), ("OK", &fields, Sections::LTPC)]);
        // First entry key starts at body+4 = frame offset 12.
        frame[12] = 0xFF;
        frame[13] = 0xFE;

        let DecodedFrame::Ticks(feeds) = decode_frame(&frame).unwrap() else {
            panic!("expected tick batch");
        };
        assert_eq!(feeds.len(), 1);
        assert!(feeds.contains_key("OK"));
    }

    #[test]
    fn test_market_status_roundtrip() {
        let frame = encode_market_status("NORMAL_OPEN");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            DecodedFrame::MarketStatus("NORMAL_OPEN".to_string())
        );
    }

    #[test]
    fn test_header_validation() {
        assert!(matches!(decode_frame(&[]), Err(DecodeError::TooShort(0))));
        assert!(matches!(
            decode_frame(&[0x00; 4]),
            Err(DecodeError::TooShort(4))
        ));

        let mut frame = encode_market_status("X");
        frame[0] = 0xAA;
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::InvalidMagic(_))
        ));

        let mut frame = encode_market_status("X");
        frame[2] = 9;
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::UnsupportedVersion(9))
        ));

        let mut frame = encode_market_status("X");
        frame[3] = 7;
        assert!(matches!(decode_frame(&frame), Err(DecodeError::UnknownKind(7))));
    }

    #[test]
    fn test_truncated_batch_is_frame_error() {
        let fields = full_fields();
        let frame = encode_ticks([("LONGKEY", &fields, ALL)]);
        let cut = &frame[..frame.len() - 4];
        assert!(matches!(
            decode_frame(cut),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
