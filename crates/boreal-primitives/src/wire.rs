//! Wire envelope: every framed payload is a one-byte service category
//! followed by the bincode-encoded message, the whole thing prefixed with
//! an unsigned varint length.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single framed message; matches the overlay's limit.
pub const MAX_WIRE_MESSAGE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty payload")]
    Empty,
    #[error("unknown service category byte {0:#04x}")]
    UnknownCategory(u8),
    #[error("message length {len} exceeds the {max}-byte wire limit")]
    TooLarge { len: usize, max: usize },
    #[error("varint length prefix is truncated or oversized")]
    BadLengthPrefix,
    #[error("frame is shorter than its declared length")]
    Truncated,
}

/// Top-level dispatch byte ahead of every serialized message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceCategory {
    Consensus = 0x00,
    Node = 0x01,
    ClientSupport = 0x02,
    Drand = 0x03,
}

impl ServiceCategory {
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x00 => Ok(Self::Consensus),
            0x01 => Ok(Self::Node),
            0x02 => Ok(Self::ClientSupport),
            0x03 => Ok(Self::Drand),
            other => Err(WireError::UnknownCategory(other)),
        }
    }
}

/// Prefixes `payload` with its category byte.
pub fn encode_envelope(category: ServiceCategory, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(category as u8);
    out.extend_from_slice(payload);
    out
}

/// Splits an envelope back into category and payload.
pub fn decode_envelope(bytes: &[u8]) -> Result<(ServiceCategory, &[u8]), WireError> {
    let (&first, rest) = bytes.split_first().ok_or(WireError::Empty)?;
    Ok((ServiceCategory::from_byte(first)?, rest))
}

/// Appends an unsigned varint to `out` (LEB128, low seven bits per byte).
pub fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads an unsigned varint from the front of `bytes`, returning the value
/// and the number of bytes consumed.
pub fn get_uvarint(bytes: &[u8]) -> Result<(u64, usize), WireError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(WireError::BadLengthPrefix)
}

/// Frames an envelope with its varint length prefix.
pub fn encode_frame(envelope: &[u8]) -> Result<Vec<u8>, WireError> {
    if envelope.len() > MAX_WIRE_MESSAGE {
        return Err(WireError::TooLarge { len: envelope.len(), max: MAX_WIRE_MESSAGE });
    }
    let mut out = Vec::with_capacity(envelope.len() + 5);
    put_uvarint(&mut out, envelope.len() as u64);
    out.extend_from_slice(envelope);
    Ok(out)
}

/// Reads one frame from the front of `bytes`, returning the envelope and
/// the total bytes consumed (prefix + envelope).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), WireError> {
    let (len, prefix) = get_uvarint(bytes)?;
    let len = usize::try_from(len).map_err(|_| WireError::BadLengthPrefix)?;
    if len > MAX_WIRE_MESSAGE {
        return Err(WireError::TooLarge { len, max: MAX_WIRE_MESSAGE });
    }
    let end = prefix.checked_add(len).ok_or(WireError::BadLengthPrefix)?;
    if bytes.len() < end {
        return Err(WireError::Truncated);
    }
    Ok((&bytes[prefix..end], end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let enveloped = encode_envelope(ServiceCategory::Consensus, b"payload");
        let (category, payload) = decode_envelope(&enveloped).unwrap();
        assert_eq!(category, ServiceCategory::Consensus);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn envelope_rejects_unknown_category() {
        assert!(matches!(decode_envelope(&[0x7f, 1, 2]), Err(WireError::UnknownCategory(0x7f))));
        assert!(matches!(decode_envelope(&[]), Err(WireError::Empty)));
    }

    #[test]
    fn uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, value);
            let (decoded, consumed) = get_uvarint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn uvarint_rejects_unterminated() {
        // Ten continuation bytes with no terminator.
        let bad = vec![0x80u8; 10];
        assert!(get_uvarint(&bad).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let envelope = encode_envelope(ServiceCategory::ClientSupport, &[9u8; 300]);
        let framed = encode_frame(&envelope).unwrap();
        let (decoded, consumed) = decode_frame(&framed).unwrap();
        assert_eq!(decoded, envelope.as_slice());
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn frame_rejects_oversize_and_truncation() {
        let too_big = vec![0u8; MAX_WIRE_MESSAGE + 1];
        assert!(matches!(encode_frame(&too_big), Err(WireError::TooLarge { .. })));

        let framed = encode_frame(&[1, 2, 3, 4]).unwrap();
        assert!(matches!(decode_frame(&framed[..framed.len() - 1]), Err(WireError::Truncated)));

        // A forged prefix claiming more than the wire limit.
        let mut forged = Vec::new();
        put_uvarint(&mut forged, (MAX_WIRE_MESSAGE + 1) as u64);
        assert!(matches!(decode_frame(&forged), Err(WireError::TooLarge { .. })));
    }

    #[test]
    fn frame_decoding_leaves_trailing_bytes() {
        let mut buf = encode_frame(b"first").unwrap();
        buf.extend_from_slice(&encode_frame(b"second").unwrap());

        let (first, consumed) = decode_frame(&buf).unwrap();
        assert_eq!(first, b"first");
        let (second, _) = decode_frame(&buf[consumed..]).unwrap();
        assert_eq!(second, b"second");
    }
}
