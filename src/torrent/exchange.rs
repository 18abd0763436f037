// Extension protocol handshake (BEP 10) and metadata exchange (BEP 9).

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Extended message id we advertise for `ut_metadata`; peers send metadata to us with it.
pub const UT_METADATA_ID: u8 = 1;

pub const METADATA_PIECE_LEN: usize = 16 * 1024;

/// Info dictionaries beyond this are refused.
pub const MAX_METADATA_BYTES: usize = 16 * 1024 * 1024;

const CLIENT_VERSION: &str = concat!("ma-relay ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExtHandshake {
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
}

impl ExtHandshake {
    pub fn ours() -> Self {
        let mut m = BTreeMap::new();
        m.insert("ut_metadata".to_string(), UT_METADATA_ID as i64);
        Self {
            m,
            metadata_size: None,
            v: Some(ByteBuf::from(CLIENT_VERSION.as_bytes().to_vec())),
        }
    }

    pub fn encode(&self) -> Bytes {
        // Serializing a struct of maps, ints and byte strings cannot fail.
        serde_bencode::to_bytes(self)
            .map(Bytes::from)
            .unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        serde_bencode::from_bytes(payload).ok()
    }

    /// Peer's extended id for `ut_metadata`; 0 means disabled.
    pub fn ut_metadata(&self) -> Option<u8> {
        self.m
            .get("ut_metadata")
            .and_then(|&id| u8::try_from(id).ok())
            .filter(|&id| id != 0)
    }

    pub fn metadata_size(&self) -> Option<usize> {
        self.metadata_size
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&n| n > 0 && n <= MAX_METADATA_BYTES)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: i64,
    piece: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Bytes {
        let (msg_type, piece, total_size, data) = match self {
            Self::Request { piece } => (0, *piece, None, None),
            Self::Data {
                piece,
                total_size,
                data,
            } => (1, *piece, Some(*total_size as i64), Some(data)),
            Self::Reject { piece } => (2, *piece, None, None),
        };
        let header = MetadataHeader {
            msg_type,
            piece: piece as i64,
            total_size,
        };
        let mut out = BytesMut::new();
        out.put_slice(&serde_bencode::to_bytes(&header).unwrap_or_default());
        if let Some(data) = data {
            out.put_slice(data);
        }
        out.freeze()
    }

    /// The payload is a bencoded dictionary, followed by raw piece bytes for `Data`.
    pub fn decode(payload: &Bytes) -> Option<Self> {
        let dict_len = bencode_value_len(payload)?;
        let header: MetadataHeader = serde_bencode::from_bytes(&payload[..dict_len]).ok()?;
        let piece = u32::try_from(header.piece).ok()?;
        match header.msg_type {
            0 => Some(Self::Request { piece }),
            1 => Some(Self::Data {
                piece,
                total_size: usize::try_from(header.total_size?).ok()?,
                data: payload.slice(dict_len..),
            }),
            2 => Some(Self::Reject { piece }),
            _ => None,
        }
    }
}

/// Length of the single bencoded value at the front of `buf`.
pub fn bencode_value_len(buf: &[u8]) -> Option<usize> {
    fn walk(buf: &[u8], pos: usize, depth: usize) -> Option<usize> {
        if depth > 64 {
            return None;
        }
        match *buf.get(pos)? {
            b'i' => {
                let end = buf[pos..].iter().position(|&b| b == b'e')?;
                Some(pos + end + 1)
            }
            b'l' | b'd' => {
                let mut cur = pos + 1;
                while *buf.get(cur)? != b'e' {
                    cur = walk(buf, cur, depth + 1)?;
                }
                Some(cur + 1)
            }
            b'0'..=b'9' => {
                let colon = buf[pos..].iter().position(|&b| b == b':')? + pos;
                let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
                let end = colon.checked_add(1)?.checked_add(len)?;
                (end <= buf.len()).then_some(end)
            }
            _ => None,
        }
    }
    walk(buf, 0, 0)
}

/// Collects metadata pieces from any peer until the info dictionary is complete.
#[derive(Debug)]
pub struct MetadataAssembler {
    total_size: usize,
    pieces: Vec<Option<Bytes>>,
}

impl MetadataAssembler {
    pub fn new(total_size: usize) -> Self {
        let count = total_size.div_ceil(METADATA_PIECE_LEN);
        Self {
            total_size,
            pieces: vec![None; count],
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn missing(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn expected_len(&self, piece: usize) -> usize {
        let start = piece * METADATA_PIECE_LEN;
        METADATA_PIECE_LEN.min(self.total_size - start)
    }

    /// Store a piece; returns `false` if it does not fit this metadata.
    pub fn insert(&mut self, piece: u32, total_size: usize, data: Bytes) -> bool {
        let piece = piece as usize;
        if total_size != self.total_size
            || piece >= self.pieces.len()
            || data.len() != self.expected_len(piece)
        {
            return false;
        }
        self.pieces[piece].get_or_insert(data);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// No piece has been stored yet.
    pub fn is_untouched(&self) -> bool {
        self.pieces.iter().all(Option::is_none)
    }

    /// Concatenated info dictionary once every piece is present.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter().flatten() {
            out.extend_from_slice(piece);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_our_handshake_advertises_ut_metadata() {
        let encoded = ExtHandshake::ours().encode();
        assert!(encoded.starts_with(b"d1:md11:ut_metadatai1ee"));
        let decoded = ExtHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.ut_metadata(), Some(UT_METADATA_ID));
        assert_eq!(decoded.metadata_size(), None);
    }

    #[test]
    fn test_peer_handshake_fields() {
        let decoded = ExtHandshake::decode(
            b"d1:md6:ut_pexi2e11:ut_metadatai3ee13:metadata_sizei31235e4:reqqi250ee",
        )
        .unwrap();
        assert_eq!(decoded.ut_metadata(), Some(3));
        assert_eq!(decoded.metadata_size(), Some(31235));

        let disabled = ExtHandshake::decode(b"d1:md11:ut_metadatai0eee").unwrap();
        assert_eq!(disabled.ut_metadata(), None);
    }

    #[test]
    fn test_metadata_message_with_trailing_data() {
        let msg = MetadataMessage::Data {
            piece: 1,
            total_size: 20000,
            data: Bytes::from_static(b"d4:spame"),
        };
        let encoded = msg.encode();
        assert_eq!(MetadataMessage::decode(&encoded), Some(msg));

        let request = Bytes::from_static(b"d8:msg_typei0e5:piecei0ee");
        assert_eq!(
            MetadataMessage::decode(&request),
            Some(MetadataMessage::Request { piece: 0 })
        );
    }

    #[test]
    fn test_bencode_value_len() {
        assert_eq!(bencode_value_len(b"i42etrailing"), Some(4));
        assert_eq!(bencode_value_len(b"4:spamxx"), Some(6));
        assert_eq!(bencode_value_len(b"d1:ali1ei2eee"), Some(13));
        assert_eq!(bencode_value_len(b"d1:a"), None);
        assert_eq!(bencode_value_len(b"9:short"), None);
        assert_eq!(bencode_value_len(b""), None);
    }

    #[test]
    fn test_assembler_collects_pieces() {
        let total = METADATA_PIECE_LEN + 10;
        let mut asm = MetadataAssembler::new(total);
        assert_eq!(asm.missing(), vec![0, 1]);

        assert!(!asm.insert(1, total, Bytes::from(vec![2u8; 9])));
        assert!(!asm.insert(0, total + 1, Bytes::from(vec![1u8; METADATA_PIECE_LEN])));
        assert!(asm.insert(1, total, Bytes::from(vec![2u8; 10])));
        assert!(asm.assemble().is_none());
        assert!(asm.insert(0, total, Bytes::from(vec![1u8; METADATA_PIECE_LEN])));

        let bytes = asm.assemble().unwrap();
        assert_eq!(bytes.len(), total);
        assert_eq!(bytes[METADATA_PIECE_LEN], 2);
    }
}
