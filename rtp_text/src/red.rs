//! RFC 2198 redundancy envelope.
//!
//! Each redundant block carries a 4-byte header: F=1, 7-bit payload type,
//! 14-bit timestamp offset, 10-bit block length. The final (primary) block
//! header is a single byte with F=0. Block data follows in header order,
//! primary last.

use heapless::Vec as HVec;

use crate::error::TextError;
use crate::rtp::MAX_TEXT_PAYLOAD;

pub(crate) const MAX_TS_OFFSET: u16 = 0x3fff;
const MAX_BLOCK_LEN: usize = 0x3ff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedBlock {
    pub payload_type: u8,
    pub timestamp_offset: u16,
    pub data: Vec<u8>,
}

/// Assemble the envelope: `redundant` oldest first as
/// `(timestamp_offset, data)` pairs, then the primary generation.
pub(crate) fn encode(
    payload_type: u8,
    redundant: &[(u16, &[u8])],
    primary: &[u8],
    out: &mut HVec<u8, MAX_TEXT_PAYLOAD>,
) -> Result<(), TextError> {
    for &(ts_offset, data) in redundant {
        if data.len() > MAX_BLOCK_LEN {
            return Err(TextError::BlockTooLarge);
        }
        let ts = ts_offset.min(MAX_TS_OFFSET);
        let len = data.len() as u16;

        out.push(0x80 | (payload_type & 0x7f))?;
        out.push((ts >> 6) as u8)?;
        out.push((((ts & 0x3f) << 2) as u8) | ((len >> 8) as u8))?;
        out.push((len & 0xff) as u8)?;
    }

    out.push(payload_type & 0x7f)?;

    for &(_, data) in redundant {
        out.extend_from_slice(data).map_err(|_| TextError::BufferFull)?;
    }
    out.extend_from_slice(primary)
        .map_err(|_| TextError::BufferFull)?;

    Ok(())
}

/// Split an envelope into its blocks, primary last (timestamp offset 0).
pub(crate) fn decode(payload: &[u8]) -> Result<Vec<RedBlock>, TextError> {
    let mut headers: Vec<(u8, u16, usize)> = Vec::new();
    let mut pos = 0;

    loop {
        let &first = payload.get(pos).ok_or(TextError::InvalidPacket)?;
        if first & 0x80 == 0 {
            // primary header
            pos += 1;
            headers.push((first & 0x7f, 0, usize::MAX));
            break;
        }

        if pos + 4 > payload.len() {
            return Err(TextError::InvalidPacket);
        }
        let pt = first & 0x7f;
        let ts_offset =
            ((payload[pos + 1] as u16) << 6) | ((payload[pos + 2] as u16) >> 2);
        let len =
            (((payload[pos + 2] & 0x03) as usize) << 8) | payload[pos + 3] as usize;
        headers.push((pt, ts_offset, len));
        pos += 4;
    }

    let mut blocks = Vec::with_capacity(headers.len());
    for (pt, ts_offset, len) in headers {
        let data = if len == usize::MAX {
            // primary runs to the end of the payload
            payload[pos..].to_vec()
        } else {
            let end = pos.checked_add(len).ok_or(TextError::InvalidPacket)?;
            if end > payload.len() {
                return Err(TextError::InvalidPacket);
            }
            let data = payload[pos..end].to_vec();
            pos = end;
            data
        };
        blocks.push(RedBlock {
            payload_type: pt,
            timestamp_offset: ts_offset,
            data,
        });
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let mut out: HVec<u8, MAX_TEXT_PAYLOAD> = HVec::new();
        encode(100, &[(600, b"ab"), (300, b"c")], b"de", &mut out).unwrap();

        let blocks = decode(&out).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].data, b"ab");
        assert_eq!(blocks[0].timestamp_offset, 600);
        assert_eq!(blocks[1].data, b"c");
        assert_eq!(blocks[2].data, b"de");
        assert_eq!(blocks[2].timestamp_offset, 0);
        assert!(blocks.iter().all(|b| b.payload_type == 100));
    }

    #[test]
    fn primary_only_envelope() {
        let mut out: HVec<u8, MAX_TEXT_PAYLOAD> = HVec::new();
        encode(98, &[], b"hi", &mut out).unwrap();
        assert_eq!(out[0], 98); // F bit clear

        let blocks = decode(&out).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, b"hi");
    }

    #[test]
    fn empty_generations_survive() {
        let mut out: HVec<u8, MAX_TEXT_PAYLOAD> = HVec::new();
        encode(100, &[(300, b"")], b"", &mut out).unwrap();

        let blocks = decode(&out).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].data.is_empty());
        assert!(blocks[1].data.is_empty());
    }

    #[test]
    fn truncated_envelope_is_invalid() {
        let mut out: HVec<u8, MAX_TEXT_PAYLOAD> = HVec::new();
        encode(100, &[(300, b"abcdef")], b"xy", &mut out).unwrap();

        assert_eq!(decode(&out[..3]), Err(TextError::InvalidPacket));
        // block length pointing past the end
        assert_eq!(decode(&out[..6]), Err(TextError::InvalidPacket));
    }
}
