//! Connection establishment.
//!
//! A [`HandshakeSession`] owns the [`PeerIo`] of a new connection until the
//! plaintext BitTorrent handshake went both ways, optionally wrapped in
//! message stream encryption:
//!
//! ```text
//! 1 A->B: Ya, PadA
//! 2 B->A: Yb, PadB
//! 3 A->B: HASH('req1', S), HASH('req2', SKEY) xor HASH('req3', S),
//!         ENCRYPT(VC, crypto_provide, len(PadC), PadC, len(IA)), ENCRYPT(IA)
//! 4 B->A: ENCRYPT(VC, crypto_select, len(padD), padD), ENCRYPT2(Payload Stream)
//! 5 A->B: ENCRYPT2(Payload Stream)
//! ```
//!
//! The session never blocks, [`HandshakeSession::can_read`] parses what is
//! buffered and returns `None` until the negotiation finished.
pub mod codec;
pub mod types;

use std::{io, time::Duration};

use rand::Rng;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::{
    bitfield::Reserved,
    config::EncryptionMode,
    crypto::{
        encrypted_vc, sha1, KeyPair, CRYPTO_PLAINTEXT, CRYPTO_RC4, KEY_LEN, VC,
    },
    peer_io::{transport::TransportKind, PeerIo},
    types::{InfoHash, PeerId},
};

use self::codec::{
    Handshake, HandshakeCodec, HANDSHAKE_LEN, HANDSHAKE_NAME,
    INCOMING_HANDSHAKE_LEN,
};
pub use self::types::{
    HandshakeError, HandshakeOutcome, Mediator, State, TorrentInfo,
};
use self::types::ReadState;

/// Longest padding accepted in any of the padding fields.
pub const PAD_MAX: usize = 512;

type ReadResult = Result<ReadState, HandshakeError>;

fn crypto_provide(mode: EncryptionMode) -> u32 {
    match mode {
        EncryptionMode::Required | EncryptionMode::Preferred => CRYPTO_RC4,
        EncryptionMode::PlaintextPreferred => CRYPTO_RC4 | CRYPTO_PLAINTEXT,
    }
}

/// Our pick among the ciphers the peer provides, `0` if none.
fn crypto_select(mode: EncryptionMode, provide: u32) -> u32 {
    let choices: &[u32] = match mode {
        EncryptionMode::Required => &[CRYPTO_RC4],
        EncryptionMode::Preferred => &[CRYPTO_RC4, CRYPTO_PLAINTEXT],
        EncryptionMode::PlaintextPreferred => &[CRYPTO_PLAINTEXT, CRYPTO_RC4],
    };
    choices.iter().copied().find(|c| provide & c != 0).unwrap_or(0)
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

/// `HASH('req2', SKEY)`, how an encrypting initiator names the torrent.
pub fn obfuscated_hash(info_hash: &InfoHash) -> [u8; 20] {
    sha1(&[b"req2", &info_hash.0])
}

pub struct HandshakeSession {
    io: PeerIo,
    state: State,
    mode: EncryptionMode,
    keys: KeyPair,
    have_sent_handshake: bool,
    have_read_anything: bool,
    /// Reconnected once already.
    retried: bool,
    pad_c_len: usize,
    pad_d_len: usize,
    ia_len: usize,
    /// Padding bytes skipped while looking for a sync marker.
    pad_scanned: usize,
    crypto_provide: u32,
    crypto_select: u32,
    peer_id: Option<PeerId>,
    reserved: Reserved,
    deadline: Instant,
}

impl std::fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("addr", &self.io.addr())
            .field("state", &self.state)
            .field("mode", &self.mode)
            .finish()
    }
}

impl HandshakeSession {
    /// An outgoing `io` must already know the torrent it connects for.
    pub fn new(
        io: PeerIo,
        mode: EncryptionMode,
        keys: KeyPair,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            io,
            state: State::AwaitingHandshake,
            mode,
            keys,
            have_sent_handshake: false,
            have_read_anything: false,
            retried: false,
            pad_c_len: 0,
            pad_d_len: 0,
            ia_len: 0,
            pad_scanned: 0,
            crypto_provide: 0,
            crypto_select: 0,
            peer_id: None,
            reserved: Reserved::default(),
            deadline: now + timeout,
        }
    }

    /// Send the opening message, if we speak first.
    pub fn start(&mut self, m: &dyn Mediator) -> Result<(), HandshakeError> {
        if self.io.is_incoming() {
            self.set_state(State::AwaitingHandshake);
        } else if self.mode != EncryptionMode::PlaintextPreferred {
            self.send_public_key_and_pad();
            self.set_state(State::AwaitingYb);
        } else {
            let msg = self.build_handshake(m)?;
            self.have_sent_handshake = true;
            self.set_state(State::AwaitingHandshake);
            self.io.write(&msg, false);
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn io(&self) -> &PeerIo {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut PeerIo {
        &mut self.io
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// The transport is gone and has to be dialed again.
    pub fn needs_connect(&self) -> bool {
        !self.io.is_connected()
    }

    fn set_state(&mut self, state: State) {
        trace!("{} handshake state {:?} -> {state:?}", self.io.addr(), self.state);
        self.state = state;
    }

    fn secret(&self) -> Result<[u8; KEY_LEN], HandshakeError> {
        self.keys.secret().copied().ok_or(HandshakeError::BadPublicKey)
    }

    fn torrent_hash(&self) -> Result<InfoHash, HandshakeError> {
        self.io.torrent_hash().ok_or(HandshakeError::BadTorrent)
    }

    fn build_handshake(
        &self,
        m: &dyn Mediator,
    ) -> Result<[u8; HANDSHAKE_LEN], HandshakeError> {
        let info_hash = self.torrent_hash()?;
        let info = m
            .torrent_info(&info_hash)
            .ok_or(HandshakeError::UnknownTorrent)?;

        Handshake::new(
            info_hash,
            info.client_peer_id,
            Reserved::supported(m.allows_dht()),
        )
        .serialize()
        .map_err(|_| HandshakeError::Io(io::ErrorKind::InvalidData))
    }

    fn send_public_key_and_pad(&mut self) {
        let mut rng = rand::thread_rng();
        let pad_len = rng.gen_range(0..=PAD_MAX);

        let mut buf = Vec::with_capacity(KEY_LEN + pad_len);
        buf.extend_from_slice(self.keys.public_key());
        buf.extend((0..pad_len).map(|_| rng.gen::<u8>()));

        self.io.write(&buf, false);
    }

    /// Parse as much of the buffered input as possible.
    ///
    /// `None` means more input is needed, `Some` is the final result.
    pub fn can_read(
        &mut self,
        m: &mut dyn Mediator,
    ) -> Option<Result<(), HandshakeError>> {
        loop {
            let r = match self.state {
                State::AwaitingHandshake => self.read_handshake(m),
                State::AwaitingPeerId => self.read_peer_id(m),
                State::AwaitingYa => self.read_ya(),
                State::AwaitingPadA => self.read_pad_a(),
                State::AwaitingCryptoProvide => self.read_crypto_provide(m),
                State::AwaitingPadC => self.read_pad_c(),
                State::AwaitingIa => self.read_ia(m),
                State::AwaitingPayloadStream => self.read_payload_stream(m),
                State::AwaitingYb => self.read_yb(m),
                State::AwaitingVc => self.read_vc(),
                State::AwaitingCryptoSelect => self.read_crypto_select(),
                State::AwaitingPadD => self.read_pad_d(),
            };

            match r {
                Ok(ReadState::Now) => continue,
                Ok(ReadState::Later) => return None,
                Ok(ReadState::Done) => return Some(Ok(())),
                Err(e) => {
                    debug!("{} handshake failed in {:?}: {e}", self.io.addr(), self.state);
                    return Some(Err(e));
                }
            }
        }
    }

    /// A socket error. Returns `None` when the session reconnected and
    /// goes on in plaintext.
    pub fn got_error(
        &mut self,
        err: &io::Error,
        m: &mut dyn Mediator,
    ) -> Option<Result<(), HandshakeError>> {
        let kind = err.kind();
        let awaiting_key = self.state == State::AwaitingYb;

        if self.io.kind() == TransportKind::Utp
            && !self.io.is_incoming()
            && awaiting_key
        {
            // only a failed connect says the peer lacks uTP
            if matches!(
                kind,
                io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
            ) {
                if let Some(hash) = self.io.torrent_hash() {
                    if m.torrent_info(&hash).is_some() {
                        m.set_utp_failed(&hash, self.io.addr());
                    }
                }
            }

            if m.allows_tcp() && !self.retried {
                return self.reconnect_plaintext(m).err().map(Err);
            }
        }

        // a peer that drops us while we send a public key may just not
        // speak encryption
        if matches!(self.state, State::AwaitingYb | State::AwaitingVc)
            && self.mode != EncryptionMode::Required
            && m.allows_tcp()
            && !self.retried
        {
            debug!("{} handshake failed, trying plaintext", self.io.addr());
            return self.reconnect_plaintext(m).err().map(Err);
        }

        debug!("{} handshake socket error: {err}", self.io.addr());
        Some(Err(HandshakeError::Io(kind)))
    }

    fn reconnect_plaintext(
        &mut self,
        m: &dyn Mediator,
    ) -> Result<(), HandshakeError> {
        self.retried = true;
        self.io.reconnect(TransportKind::Tcp);

        let msg = self.build_handshake(m)?;
        self.have_sent_handshake = true;
        self.set_state(State::AwaitingHandshake);
        self.io.write(&msg, false);
        Ok(())
    }

    /// Hand over the io, ending the session.
    pub fn finish(self, result: Result<(), HandshakeError>) -> HandshakeOutcome {
        let recyclable = result.is_err()
            && !self.have_read_anything
            && self.keys.secret().is_none();

        HandshakeOutcome {
            io: self.io,
            result,
            peer_id: self.peer_id,
            reserved: self.reserved,
            read_anything: self.have_read_anything,
            unused_keys: recyclable.then_some(self.keys),
        }
    }

    // outgoing

    fn read_yb(&mut self, m: &dyn Mediator) -> ReadResult {
        if self.io.read_buffer_size() < HANDSHAKE_NAME.len() {
            return Ok(ReadState::Later);
        }

        let is_encrypted = !self.io.starts_with(&HANDSHAKE_NAME);
        if is_encrypted && self.io.read_buffer_size() < KEY_LEN {
            return Ok(ReadState::Later);
        }

        if !is_encrypted {
            trace!("{} got a plain handshake", self.io.addr());
            self.set_state(State::AwaitingHandshake);
            return Ok(ReadState::Now);
        }

        self.have_read_anything = true;

        let mut yb = [0u8; KEY_LEN];
        self.io.read_into(&mut yb);
        if !self.keys.compute_secret(&yb) {
            return Err(HandshakeError::BadPublicKey);
        }
        let secret = self.secret()?;
        let info_hash = self.torrent_hash()?;

        let mut out = Vec::with_capacity(40);
        out.extend_from_slice(&sha1(&[b"req1", &secret]));
        out.extend_from_slice(&xor20(
            &obfuscated_hash(&info_hash),
            &sha1(&[b"req3", &secret]),
        ));
        self.io.write(&out, false);

        self.io.encrypt_init(&secret, &info_hash);

        let msg = self.build_handshake(m)?;
        let mut out = Vec::with_capacity(16 + HANDSHAKE_LEN);
        out.extend_from_slice(&VC);
        out.extend_from_slice(&crypto_provide(self.mode).to_be_bytes());
        // len(PadC)
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(HANDSHAKE_LEN as u16).to_be_bytes());
        out.extend_from_slice(&msg);
        self.have_sent_handshake = true;

        self.set_state(State::AwaitingVc);
        self.pad_scanned = 0;
        self.io.write(&out, false);
        Ok(ReadState::Now)
    }

    /// Find the end of PadB by looking for `ENCRYPT(VC)`.
    fn read_vc(&mut self) -> ReadResult {
        let secret = self.secret()?;
        let info_hash = self.torrent_hash()?;
        let needle = encrypted_vc(self.io.is_incoming(), &secret, &info_hash);

        while self.pad_scanned <= PAD_MAX {
            if self.io.read_buffer_size() < needle.len() {
                return Ok(ReadState::Later);
            }

            if self.io.starts_with(&needle) {
                self.io.decrypt_init(&secret, &info_hash);
                self.io.drain(needle.len());
                self.set_state(State::AwaitingCryptoSelect);
                return Ok(ReadState::Now);
            }

            self.io.drain(1);
            self.pad_scanned += 1;
        }

        Err(HandshakeError::SyncNotFound)
    }

    fn read_crypto_select(&mut self) -> ReadResult {
        if self.io.read_buffer_size() < 6 {
            return Ok(ReadState::Later);
        }

        let select = self.io.read_u32().unwrap_or(0);
        self.crypto_select = select;
        trace!("{} crypto select is {select}", self.io.addr());

        if select & crypto_provide(self.mode) == 0 {
            return Err(HandshakeError::CryptoMismatch);
        }

        let pad_d_len = self.io.read_u16().unwrap_or(0) as usize;
        if pad_d_len > PAD_MAX {
            return Err(HandshakeError::PadTooLong);
        }
        self.pad_d_len = pad_d_len;

        self.set_state(State::AwaitingPadD);
        Ok(ReadState::Now)
    }

    fn read_pad_d(&mut self) -> ReadResult {
        if self.io.read_buffer_size() < self.pad_d_len {
            return Ok(ReadState::Later);
        }

        // the payload stream after PadD is in the clear
        if self.crypto_select == CRYPTO_PLAINTEXT {
            self.io.set_decrypt_limit(self.pad_d_len);
            self.io.disable_encrypt();
        }
        self.io.drain(self.pad_d_len);

        self.set_state(State::AwaitingHandshake);
        Ok(ReadState::Now)
    }

    // incoming, or the plaintext part of both

    fn read_handshake(&mut self, m: &dyn Mediator) -> ReadResult {
        if self.io.read_buffer_size() < INCOMING_HANDSHAKE_LEN {
            return Ok(ReadState::Later);
        }

        self.have_read_anything = true;

        if self.io.starts_with(&HANDSHAKE_NAME) {
            if self.mode == EncryptionMode::Required {
                return Err(HandshakeError::PlaintextRejected);
            }
        } else if self.io.is_incoming() {
            trace!("{} peer is sending an encrypted handshake", self.io.addr());
            self.set_state(State::AwaitingYa);
            return Ok(ReadState::Now);
        }

        let mut buf = [0u8; INCOMING_HANDSHAKE_LEN];
        self.io.read_into(&mut buf);

        if buf[..20] != HANDSHAKE_NAME {
            return Err(HandshakeError::EncryptionWrong);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        self.reserved = Reserved::from(reserved);

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&buf[28..48]);
        let hash = InfoHash(hash);

        if self.io.is_incoming() {
            if m.torrent_info(&hash).is_none() {
                return Err(HandshakeError::UnknownTorrent);
            }
            self.io.set_torrent_hash(hash);
        } else if self.io.torrent_hash() != Some(hash) {
            return Err(HandshakeError::BadTorrent);
        }

        if !self.have_sent_handshake {
            let msg = self.build_handshake(m)?;
            self.io.write(&msg, false);
            self.have_sent_handshake = true;
        }

        self.set_state(State::AwaitingPeerId);
        Ok(ReadState::Now)
    }

    fn read_peer_id(&mut self, m: &dyn Mediator) -> ReadResult {
        let mut peer_id = [0u8; 20];
        if !self.io.read_into(&mut peer_id) {
            return Ok(ReadState::Later);
        }
        let peer_id = PeerId(peer_id);
        self.peer_id = Some(peer_id);

        debug!(
            "{} peer id {peer_id:?}, incoming {}",
            self.io.addr(),
            self.io.is_incoming()
        );

        self.check_self(m, peer_id)?;
        Ok(ReadState::Done)
    }

    fn check_self(
        &self,
        m: &dyn Mediator,
        peer_id: PeerId,
    ) -> Result<(), HandshakeError> {
        let connected_to_self = self
            .io
            .torrent_hash()
            .and_then(|h| m.torrent_info(&h))
            .is_some_and(|info| info.client_peer_id == peer_id);

        if connected_to_self {
            return Err(HandshakeError::PeerIsSelf);
        }
        Ok(())
    }

    fn read_ya(&mut self) -> ReadResult {
        let mut ya = [0u8; KEY_LEN];
        if !self.io.read_into(&mut ya) {
            return Ok(ReadState::Later);
        }
        if !self.keys.compute_secret(&ya) {
            return Err(HandshakeError::BadPublicKey);
        }

        trace!("{} sending Yb, PadB", self.io.addr());
        self.send_public_key_and_pad();

        self.set_state(State::AwaitingPadA);
        self.pad_scanned = 0;
        Ok(ReadState::Now)
    }

    /// Find the end of PadA by looking for `HASH('req1', S)`.
    fn read_pad_a(&mut self) -> ReadResult {
        let secret = self.secret()?;
        let needle = sha1(&[b"req1", &secret]);

        while self.pad_scanned <= PAD_MAX {
            if self.io.read_buffer_size() < needle.len() {
                return Ok(ReadState::Later);
            }

            if self.io.starts_with(&needle) {
                self.io.drain(needle.len());
                self.set_state(State::AwaitingCryptoProvide);
                return Ok(ReadState::Now);
            }

            self.io.drain(1);
            self.pad_scanned += 1;
        }

        Err(HandshakeError::SyncNotFound)
    }

    fn read_crypto_provide(&mut self, m: &dyn Mediator) -> ReadResult {
        // HASH('req2', SKEY) xor HASH('req3', S), ENCRYPT(VC, crypto_provide, len(PadC))
        const NEED: usize = 20 + VC.len() + 4 + 2;
        if self.io.read_buffer_size() < NEED {
            return Ok(ReadState::Later);
        }

        let secret = self.secret()?;
        let mut req2 = [0u8; 20];
        self.io.read_into(&mut req2);
        let obfuscated = xor20(&req2, &sha1(&[b"req3", &secret]));

        let Some(info) = m.torrent_info_from_obfuscated(&obfuscated) else {
            return Err(HandshakeError::UnknownTorrent);
        };
        self.io.set_torrent_hash(info.info_hash);

        if info.is_done && m.is_peer_known_seed(&info.info_hash, self.io.addr()) {
            return Err(HandshakeError::BothSeeds);
        }

        self.io.decrypt_init(&secret, &info.info_hash);

        let mut vc = [0u8; 8];
        self.io.read_into(&mut vc);
        if vc != VC {
            return Err(HandshakeError::EncryptionWrong);
        }

        self.crypto_provide = self.io.read_u32().unwrap_or(0);
        trace!("{} crypto provide is {}", self.io.addr(), self.crypto_provide);

        let pad_c_len = self.io.read_u16().unwrap_or(0) as usize;
        if pad_c_len > PAD_MAX {
            return Err(HandshakeError::PadTooLong);
        }
        self.pad_c_len = pad_c_len;

        self.set_state(State::AwaitingPadC);
        Ok(ReadState::Now)
    }

    fn read_pad_c(&mut self) -> ReadResult {
        if self.io.read_buffer_size() < self.pad_c_len + 2 {
            return Ok(ReadState::Later);
        }

        self.io.drain(self.pad_c_len);
        self.ia_len = self.io.read_u16().unwrap_or(0) as usize;
        trace!("{} ia_len is {}", self.io.addr(), self.ia_len);

        self.set_state(State::AwaitingIa);
        Ok(ReadState::Now)
    }

    fn read_ia(&mut self, m: &dyn Mediator) -> ReadResult {
        if self.io.read_buffer_size() < self.ia_len {
            return Ok(ReadState::Later);
        }

        let secret = self.secret()?;
        let info_hash = self.torrent_hash()?;
        self.io.encrypt_init(&secret, &info_hash);

        let select = crypto_select(self.mode, self.crypto_provide);
        if select == 0 {
            return Err(HandshakeError::CryptoMismatch);
        }
        self.crypto_select = select;
        trace!("{} selecting crypto mode {select}", self.io.addr());

        let msg = self.build_handshake(m)?;

        let mut out = Vec::with_capacity(14 + HANDSHAKE_LEN);
        out.extend_from_slice(&VC);
        out.extend_from_slice(&select.to_be_bytes());
        // len(PadD)
        out.extend_from_slice(&0u16.to_be_bytes());

        if select == CRYPTO_PLAINTEXT {
            self.io.write(&out, false);
            self.io.disable_encrypt();
            // the IA is still encrypted, what follows it is not
            self.io.set_decrypt_limit(self.ia_len);
            self.io.write(&msg, false);
        } else {
            out.extend_from_slice(&msg);
            self.io.write(&out, false);
        }
        self.have_sent_handshake = true;

        self.set_state(State::AwaitingPayloadStream);
        Ok(ReadState::Now)
    }

    fn read_payload_stream(&mut self, m: &dyn Mediator) -> ReadResult {
        if self.io.read_buffer_size() < HANDSHAKE_LEN {
            return Ok(ReadState::Later);
        }

        let handshake = match self.io.with_decoded(|buf| HandshakeCodec.decode(buf)) {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(ReadState::Later),
            Err(_) => return Err(HandshakeError::EncryptionWrong),
        };

        if !handshake.has_valid_name() {
            return Err(HandshakeError::EncryptionWrong);
        }
        if handshake.info_hash == InfoHash::default()
            || Some(handshake.info_hash) != self.io.torrent_hash()
        {
            return Err(HandshakeError::BadTorrent);
        }

        self.peer_id = Some(handshake.peer_id);
        self.reserved = Reserved::from(handshake.reserved);
        self.check_self(m, handshake.peer_id)?;

        Ok(ReadState::Done)
    }
}
