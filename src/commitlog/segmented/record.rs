//! Record framing inside a segment file.
//!
//! ```text
//! +-----------+-----------+----------------------+
//! |  CRC32    |  Length   |  Payload             |
//! | (4 bytes) | (4 bytes) | (Length bytes)       |
//! +-----------+-----------+----------------------+
//! ```
//!
//! * `CRC32` - checksum of `Length` + `Payload`
//! * `Length` - payload size in bytes
//!
//! Integers are little-endian.

use bytes::{Buf, BufMut};

pub(super) const RECORD_HEADER_SIZE: usize = 8;

pub(super) fn encode_record(payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.put_u32_le(checksum(length, payload));
    buf.put_u32_le(length);
    buf.put_slice(payload);
    buf
}

pub(super) fn framed_size(payload: &[u8]) -> u64 {
    (RECORD_HEADER_SIZE + payload.len()) as u64
}

fn checksum(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[derive(Debug, PartialEq)]
pub(super) enum Tail {
    /// Every byte of the buffer belongs to a valid record.
    Clean,
    /// The buffer ends in the middle of a record.
    Partial,
    /// A record failed its checksum.
    Corrupt,
}

pub(super) struct DecodedRecords {
    pub(super) payloads: Vec<Vec<u8>>,
    /// Number of leading bytes that hold valid records.
    pub(super) valid_len: u64,
    pub(super) tail: Tail,
}

/// Decodes records from the start of `buf`, stopping at the first partial or corrupt record.
pub(super) fn decode_records(buf: &[u8]) -> DecodedRecords {
    let mut payloads = Vec::new();
    let mut cursor = buf;
    let mut valid_len = 0u64;

    let tail = loop {
        if cursor.is_empty() {
            break Tail::Clean;
        }
        if cursor.len() < RECORD_HEADER_SIZE {
            break Tail::Partial;
        }

        let mut header = &cursor[..RECORD_HEADER_SIZE];
        let crc = header.get_u32_le();
        let length = header.get_u32_le();
        let record_len = RECORD_HEADER_SIZE + length as usize;
        if cursor.len() < record_len {
            break Tail::Partial;
        }

        let payload = &cursor[RECORD_HEADER_SIZE..record_len];
        if checksum(length, payload) != crc {
            break Tail::Corrupt;
        }

        payloads.push(payload.to_vec());
        valid_len += record_len as u64;
        cursor.advance(record_len);
    };

    DecodedRecords {
        payloads,
        valid_len,
        tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_records() -> Vec<u8> {
        let mut buf = encode_record(b"hello");
        buf.extend(encode_record(b"world!"));
        buf
    }

    #[test]
    fn decode_clean_buffer() {
        let buf = two_records();
        let decoded = decode_records(&buf);

        assert_eq!(decoded.tail, Tail::Clean);
        assert_eq!(decoded.payloads, vec![b"hello".to_vec(), b"world!".to_vec()]);
        assert_eq!(decoded.valid_len, buf.len() as u64);
        assert_eq!(framed_size(b"hello"), 13);
    }

    #[test]
    fn decode_stops_at_torn_write() {
        let mut buf = two_records();
        buf.truncate(buf.len() - 2);
        let decoded = decode_records(&buf);

        assert_eq!(decoded.tail, Tail::Partial);
        assert_eq!(decoded.payloads, vec![b"hello".to_vec()]);
        assert_eq!(decoded.valid_len, 13);
    }

    #[test]
    fn decode_stops_at_bit_flip() {
        let mut buf = two_records();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let decoded = decode_records(&buf);

        assert_eq!(decoded.tail, Tail::Corrupt);
        assert_eq!(decoded.payloads.len(), 1);
        assert_eq!(decoded.valid_len, 13);
    }
}
