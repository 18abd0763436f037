// BitTorrent peer wire protocol (BEP 3) with the extension bit (BEP 10).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Bitfields of very large torrents stay well below this.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer spoke an unknown protocol")]
    Protocol,

    #[error("peer is serving a different info hash")]
    InfoHashMismatch,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("malformed {0} message")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, WireError> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(WireError::Protocol);
        }
        let mut reserved = [0u8; 8];
        let mut info_hash = [0u8; 20];
        let mut peer_id = [0u8; 20];
        reserved.copy_from_slice(&buf[20..28]);
        info_hash.copy_from_slice(&buf[28..48]);
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// Send our handshake and read the peer's, checking it names the same torrent.
pub async fn exchange_handshake<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_bytes()).await?;
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::parse(&buf)?;
    if theirs.info_hash != ours.info_hash {
        return Err(WireError::InfoHashMismatch);
    }
    Ok(theirs)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Extended { id: u8, payload: Bytes },
    Unknown { id: u8, payload: Bytes },
}

/// Length-prefixed message framing for `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct MessageCodec;

fn take_u32(payload: &mut Bytes, what: &'static str) -> Result<u32, WireError> {
    if payload.remaining() < 4 {
        return Err(WireError::Malformed(what));
    }
    Ok(payload.get_u32())
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }
        let id = src.get_u8();
        let mut payload = src.split_to(len - 1).freeze();

        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(take_u32(&mut payload, "have")?),
            5 => Message::Bitfield(payload),
            6 | 8 => {
                let index = take_u32(&mut payload, "request")?;
                let begin = take_u32(&mut payload, "request")?;
                let length = take_u32(&mut payload, "request")?;
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                let index = take_u32(&mut payload, "piece")?;
                let begin = take_u32(&mut payload, "piece")?;
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
            9 => {
                if payload.remaining() < 2 {
                    return Err(WireError::Malformed("port"));
                }
                Message::Port(payload.get_u16())
            }
            20 => {
                if payload.is_empty() {
                    return Err(WireError::Malformed("extended"));
                }
                let ext = payload.get_u8();
                Message::Extended { id: ext, payload }
            }
            other => Message::Unknown { id: other, payload },
        };
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        let simple = |dst: &mut BytesMut, id: u8| {
            dst.put_u32(1);
            dst.put_u8(id);
        };
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => simple(dst, 0),
            Message::Unchoke => simple(dst, 1),
            Message::Interested => simple(dst, 2),
            Message::NotInterested => simple(dst, 3),
            Message::Have(index) => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(index);
            }
            Message::Bitfield(bits) => {
                dst.put_u32(1 + bits.len() as u32);
                dst.put_u8(5);
                dst.put_slice(&bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(9 + block.len() as u32);
                dst.put_u8(7);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            }
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
            Message::Unknown { id, payload } => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let hs = Handshake::new([0xaa; 20], [0xbb; 20]);
        let bytes = hs.to_bytes();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[25], 0x10);
        assert!(Handshake::parse(&bytes).unwrap().supports_extensions());

        let mut bad = bytes;
        bad[3] = b'x';
        assert!(matches!(Handshake::parse(&bad), Err(WireError::Protocol)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_torrent() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; HANDSHAKE_LEN];
            theirs.read_exact(&mut buf).await.unwrap();
            theirs
                .write_all(&Handshake::new([0x02; 20], [0x03; 20]).to_bytes())
                .await
                .unwrap();
        });
        let err = exchange_handshake(&mut ours, &Handshake::new([0x01; 20], [0x04; 20]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::InfoHashMismatch));
        peer.await.unwrap();
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Message::Piece {
                    index: 3,
                    begin: 16384,
                    block: Bytes::from_static(b"abcd"),
                },
                &mut buf,
            )
            .unwrap();
        let mut partial = buf.split_to(10);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Piece {
                index: 3,
                begin: 16384,
                block: Bytes::from_static(b"abcd"),
            })
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_keepalive_extended_and_unknown() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 0, 0, 0, 3, 20, 1, b'x', 0, 0, 0, 1, 13][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Extended {
                id: 1,
                payload: Bytes::from_static(b"x")
            })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Unknown {
                id: 13,
                payload: Bytes::new()
            })
        );
    }

    #[test]
    fn test_oversized_and_truncated_frames() {
        let mut codec = MessageCodec;
        let mut huge = BytesMut::from(&[0x7f, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            codec.decode(&mut huge),
            Err(WireError::FrameTooLarge(_))
        ));
        let mut short_have = BytesMut::from(&[0u8, 0, 0, 2, 4, 1][..]);
        assert!(matches!(
            codec.decode(&mut short_have),
            Err(WireError::Malformed("have"))
        ));
    }
}
