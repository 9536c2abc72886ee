//! Messages exchanged after the handshake.
//!
//! All of them but the keep alive take the form
//! `<length prefix><message id><payload>`, the length prefix being a four
//! byte big-endian value that counts the id and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{bitfield::Bitfield, error::Error};

/// The block length that most clients support, some clients drop the
/// connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: usize = 16384;

/// Largest message accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// A Block is a subset of a Piece, pieces are subsets of the entire
/// torrent data. Peers send them in the "Piece" message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's data. 16 KiB most of the times, but the last block of a
    /// piece *might* be smaller.
    pub block: Bytes,
}

/// What is sent to ask for a [`Block`], or to cancel or reject the ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's length in bytes. <= 16 KiB
    pub len: usize,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo { index: block.index, begin: block.begin, len: block.block.len() }
    }
}

impl BlockInfo {
    pub fn new(index: usize, begin: usize, len: usize) -> Self {
        Self { index, begin, len }
    }

    /// Like most clients, we only serve and accept blocks <= 16 KiB.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len <= BLOCK_LEN
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u32(to_u32(self.index)?);
        buf.put_u32(to_u32(self.begin)?);
        buf.put_u32(to_u32(self.len)?);
        Ok(())
    }

    fn decode(buf: &mut BytesMut) -> Self {
        let index = buf.get_u32() as usize;
        let begin = buf.get_u32() as usize;
        let len = buf.get_u32() as usize;
        Self { index, begin, len }
    }
}

fn to_u32(v: usize) -> Result<u32, Error> {
    u32::try_from(v).map_err(|_| Error::MessageResponse)
}

/// The first value is decided when the peer sends its extension header, in
/// the m field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

/// Messages of the vanilla protocol and of the fast extension.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// The DHT port of the peer.
    Port(u16),
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    Extended(ExtendedMessage),
}

impl Message {
    /// Bytes this message takes on the wire.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Message::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested | HaveAll | HaveNone => {
                4 + 1
            }
            Have(_) => 4 + 1 + 4,
            Port(_) => 4 + 1 + 2,
            Bitfield(b) => 4 + 1 + b.len().div_ceil(8),
            Request(_) | Cancel(_) | Reject(_) => 4 + 1 + 12,
            Piece(b) => 4 + 1 + 8 + b.block.len(),
            Extended(m) => 4 + 1 + 1 + m.1.len(),
        }
    }

    /// Bytes of block data, as opposed to protocol overhead.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Piece(b) => b.block.len(),
            _ => 0,
        }
    }
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            14 => HaveAll,
            15 => HaveNone,
            16 => Reject,
            20 => Extended,
            v => return Err(v),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(item.len());

        let id = |buf: &mut BytesMut, id: MessageId| {
            buf.put_u32(1);
            buf.put_u8(id as u8);
        };

        match item {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => id(buf, MessageId::Choke),
            Message::Unchoke => id(buf, MessageId::Unchoke),
            Message::Interested => id(buf, MessageId::Interested),
            Message::NotInterested => id(buf, MessageId::NotInterested),
            Message::HaveAll => id(buf, MessageId::HaveAll),
            Message::HaveNone => id(buf, MessageId::HaveNone),
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(to_u32(piece)?);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf)?;
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(Block { index, begin, block }) => {
                buf.put_u32(1 + 8 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(to_u32(index)?);
                buf.put_u32(to_u32(begin)?);
                buf.put(block);
            }
            Message::Cancel(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf)?;
            }
            Message::Reject(block) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Reject as u8);
                block.encode(buf)?;
            }
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(payload.len() as u32 + 2);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            // the length prefix must be present, otherwise we can't
            // determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without consuming it
            let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if size > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge(size));
            }

            // wait for the whole message
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let msg_id = buf.get_u8();

            let Ok(msg_id) = MessageId::try_from(msg_id) else {
                warn!("unknown message_id {msg_id}");
                buf.advance(size - 1);
                continue;
            };

            let payload = size - 1;
            let expect = |n: usize| {
                if payload == n {
                    Ok(())
                } else {
                    Err(Error::MessageResponse)
                }
            };

            let msg = match msg_id {
                MessageId::Choke => expect(0).map(|_| Message::Choke),
                MessageId::Unchoke => expect(0).map(|_| Message::Unchoke),
                MessageId::Interested => expect(0).map(|_| Message::Interested),
                MessageId::NotInterested => {
                    expect(0).map(|_| Message::NotInterested)
                }
                MessageId::HaveAll => expect(0).map(|_| Message::HaveAll),
                MessageId::HaveNone => expect(0).map(|_| Message::HaveNone),
                MessageId::Have => {
                    expect(4).map(|_| Message::Have(buf.get_u32() as usize))
                }
                MessageId::Port => expect(2).map(|_| Message::Port(buf.get_u16())),
                MessageId::Bitfield => {
                    let bytes = buf.split_to(payload).to_vec();
                    Ok(Message::Bitfield(Bitfield::from_vec(bytes)))
                }
                MessageId::Request => {
                    expect(12).map(|_| Message::Request(BlockInfo::decode(buf)))
                }
                MessageId::Cancel => {
                    expect(12).map(|_| Message::Cancel(BlockInfo::decode(buf)))
                }
                MessageId::Reject => {
                    expect(12).map(|_| Message::Reject(BlockInfo::decode(buf)))
                }
                MessageId::Piece => {
                    if payload < 8 {
                        Err(Error::MessageResponse)
                    } else {
                        let index = buf.get_u32() as usize;
                        let begin = buf.get_u32() as usize;
                        let block = buf.split_to(payload - 8).freeze();
                        Ok(Message::Piece(Block { index, begin, block }))
                    }
                }
                MessageId::Extended => {
                    if payload < 1 {
                        Err(Error::MessageResponse)
                    } else {
                        let ext_id = buf.get_u8();
                        let data = buf.split_to(payload - 1).to_vec();
                        Ok(Message::Extended(ExtendedMessage(ext_id, data)))
                    }
                }
            };

            return msg.map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use bitvec::{bitvec, prelude::Msb0};

    use super::*;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn request() {
        let msg = Message::Request(BlockInfo::default());
        let mut buf = encode(msg.clone());

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.len(), msg.len());
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.get_u32(), 0);
        assert_eq!(buf.get_u32(), BLOCK_LEN as u32);

        let mut buf = encode(msg.clone());
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn piece() {
        let msg = Message::Piece(Block {
            index: 3,
            begin: BLOCK_LEN,
            block: Bytes::from_static(&[9, 9, 9]),
        });
        let mut buf = encode(msg.clone());
        assert_eq!(&buf[..5], &[0, 0, 0, 12, 7]);
        assert_eq!(msg.payload_len(), 3);

        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn bitfield() {
        let mut original = bitvec![u8, Msb0; 0; 10];
        original.set(0, true);
        original.set(9, true);

        let mut buf = encode(Message::Bitfield(original.clone()));
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0b1000_0000, 0b0100_0000]);

        let Some(Message::Bitfield(got)) = MessageCodec.decode(&mut buf).unwrap()
        else {
            panic!("not a bitfield");
        };
        // the wire carries whole bytes
        assert_eq!(got.len(), 16);
        assert_eq!(&got[..10], &original[..]);
    }

    #[test]
    fn fast_extension() {
        assert_eq!(&encode(Message::HaveAll)[..], &[0, 0, 0, 1, 14]);
        assert_eq!(&encode(Message::HaveNone)[..], &[0, 0, 0, 1, 15]);

        let reject = Message::Reject(BlockInfo::new(1, 0, 100));
        let mut buf = encode(reject.clone());
        assert_eq!(buf[4], 16);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(reject));
    }

    #[test]
    fn fragmented_messages_wait() {
        let payload = vec![0xAA; 50_000];
        let msg = Message::Extended(ExtendedMessage(1, payload));
        let full = encode(msg.clone());

        let mut buf = BytesMut::from(&full[..15_000]);
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[15_000..]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);

        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));
        assert!(buf.is_empty());
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_ids_are_skipped() {
        // suggest piece, then unchoke
        let mut buf = BytesMut::from(&[0, 0, 0, 5, 13, 0, 0, 0, 1, 0, 0, 0, 1, 1][..]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_messages_fail() {
        let mut buf = BytesMut::from(&[0, 0, 0, 2, 4, 1][..]);
        assert!(MessageCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0xff, 0, 0, 0, 7][..]);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(Error::MessageTooLarge(_))
        ));
    }
}
