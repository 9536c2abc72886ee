//! The plaintext BitTorrent handshake message.
//!
//! It is exchanged once, at the start of the connection, possibly inside
//! the encrypted preamble. After it, the connection switches to
//! [`MessageCodec`](crate::wire::MessageCodec) on the same buffers.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::Reserved,
    error::Error,
    types::{InfoHash, PeerId},
};

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = [
    66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112, 114, 111, 116,
    111, 99, 111, 108,
];

/// Length prefix followed by [`PSTR`].
pub const HANDSHAKE_NAME: [u8; 20] = {
    let mut name = [19u8; 20];
    let mut i = 0;
    while i < PSTR.len() {
        name[i + 1] = PSTR[i];
        i += 1;
    }
    name
};

pub const HANDSHAKE_LEN: usize = 68;

/// Name, reserved bytes and info hash, everything but the peer id.
pub const INCOMING_HANDSHAKE_LEN: usize = 48;

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        debug_assert_eq!(pstr_len, 19);
        debug_assert_eq!(pstr, PSTR);

        buf.put_u8(pstr.len() as u8);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek, the whole message may not be here yet
        let prot_len = buf[0] as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        if buf.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: pstr.len() as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// `<pstrlen><pstr><reserved><info_hash><peer_id>`, 68 bytes.
#[derive(Clone, Debug, PartialEq, Eq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, reserved: Reserved) -> Self {
        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved: reserved.into(),
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self
            .write_to_vec_with_ctx(BigEndian {})
            .map_err(Error::SpeedyError)?;

        buf.copy_from_slice(&temp[..]);

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Self::read_from_buffer_with_ctx(BigEndian {}, buf)
            .map_err(Error::SpeedyError)
    }

    pub fn has_valid_name(&self) -> bool {
        self.pstr_len == 19 && self.pstr == PSTR
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let reserved = Reserved::from([0, 0, 0, 0, 0, 0x10, 0, 0]);
        let ours = Handshake::new(info_hash, peer_id, reserved);

        assert_eq!(ours.pstr_len, 19);
        assert!(ours.has_valid_name());

        let bytes = ours.serialize().unwrap();
        assert_eq!(
            bytes,
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 16, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );
        assert_eq!(&bytes[..20], &HANDSHAKE_NAME);
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), ours);
    }

    #[test]
    fn codec_waits_for_the_whole_message() {
        let ours = Handshake::new(
            InfoHash([1; 20]),
            PeerId([2; 20]),
            Reserved::supported(true),
        );
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(ours.clone(), &mut buf).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 1]);

        let mut partial = BytesMut::from(&buf[..40]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 40);

        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), Some(ours));
        assert_eq!(&buf[..], &[0, 0, 0, 1]);

        let mut bad = BytesMut::from(&[3u8, 1, 2, 3][..]);
        assert!(HandshakeCodec.decode(&mut bad).is_err());
    }
}
