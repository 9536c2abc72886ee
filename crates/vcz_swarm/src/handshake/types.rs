use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{
    bitfield::Reserved,
    crypto::KeyPair,
    peer_io::PeerIo,
    types::{InfoHash, PeerId},
};

/// Where a [`HandshakeSession`](super::HandshakeSession) is in the
/// negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    AwaitingHandshake,
    AwaitingPeerId,

    // incoming, encrypted
    AwaitingYa,
    AwaitingPadA,
    AwaitingCryptoProvide,
    AwaitingPadC,
    AwaitingIa,
    AwaitingPayloadStream,

    // outgoing, encrypted
    AwaitingYb,
    AwaitingVc,
    AwaitingCryptoSelect,
    AwaitingPadD,
}

/// Why a handshake failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("The peer did not send the BitTorrent protocol name")]
    EncryptionWrong,

    #[error("The peer returned the wrong info hash")]
    BadTorrent,

    #[error("Connected to ourselves")]
    PeerIsSelf,

    #[error("The peer is unencrypted and encryption is required")]
    PlaintextRejected,

    #[error("The peer selected or provided no cipher we accept")]
    CryptoMismatch,

    #[error("The peer's padding is longer than 512 bytes")]
    PadTooLong,

    #[error("Could not find the end of the peer's padding")]
    SyncNotFound,

    #[error("The peer asked for a torrent we don't have")]
    UnknownTorrent,

    #[error("Both ends are seeds")]
    BothSeeds,

    #[error("The peer sent an invalid public key")]
    BadPublicKey,

    #[error("Socket error: {0}")]
    Io(io::ErrorKind),

    #[error("The handshake took too long")]
    Timeout,

    #[error("The handshake was aborted")]
    Aborted,
}

impl From<io::Error> for HandshakeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.kind())
    }
}

/// What the session needs to know about a torrent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentInfo {
    pub info_hash: InfoHash,
    pub client_peer_id: PeerId,
    pub is_done: bool,
}

/// The session side of a handshake: torrents, policy and what is known
/// about peers.
pub trait Mediator {
    fn torrent_info(&self, info_hash: &InfoHash) -> Option<TorrentInfo>;

    /// Resolve `sha1("req2" ‖ info_hash)` back to a torrent.
    fn torrent_info_from_obfuscated(
        &self,
        obfuscated: &[u8; 20],
    ) -> Option<TorrentInfo>;

    fn is_peer_known_seed(&self, info_hash: &InfoHash, addr: SocketAddr) -> bool;

    fn allows_dht(&self) -> bool;

    fn allows_tcp(&self) -> bool;

    /// The peer did not answer on uTP.
    fn set_utp_failed(&mut self, info_hash: &InfoHash, addr: SocketAddr);
}

/// Progress of one read pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// Keep parsing.
    Now,
    /// Wait for more input.
    Later,
    /// The handshake succeeded.
    Done,
}

/// A finished handshake. On success the io carries on as the peer
/// connection.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub io: PeerIo,
    pub result: Result<(), HandshakeError>,
    pub peer_id: Option<PeerId>,
    pub reserved: Reserved,
    pub read_anything: bool,
    /// The key pair, when it never met a peer and can be reused.
    pub unused_keys: Option<KeyPair>,
}

impl HandshakeOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
