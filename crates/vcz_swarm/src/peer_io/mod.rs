//! Bandwidth gated, encryption aware connection buffers.
//!
//! A [`PeerIo`] owns the leaf bandwidth node of one connection, the raw
//! input buffer, the already encrypted output buffer and the cipher state.
//! Inbound bytes are decrypted lazily, when they are consumed, so the
//! handshake can still look for plaintext markers in bytes that may turn
//! out to be ciphertext.
pub mod transport;

use std::{collections::VecDeque, io, net::SocketAddr};

use bytes::{Buf, BytesMut};
use tokio::time::Instant;
use tracing::trace;

use crate::{
    bandwidth::{Bandwidth, NodeId},
    crypto::{Filter, KEY_LEN},
    types::{ConnId, Dir, Direction, InfoHash},
};

use self::transport::{IoInterest, Transport, TransportKind};

/// Largest amount of unread input kept per connection.
pub const READ_CAP: usize = 256 * 1024;

/// TCP/IP header bytes that go on the wire for `d` bytes of data.
pub fn guess_packet_overhead(d: usize) -> usize {
    // around 94% of a full frame is payload
    d * 100 / 94 - d
}

pub struct PeerIo {
    conn: ConnId,
    addr: SocketAddr,
    direction: Direction,
    kind: TransportKind,
    /// `None` while an outbound connect is in flight.
    transport: Option<Box<dyn Transport>>,
    bandwidth: NodeId,
    filter: Filter,
    info_hash: Option<InfoHash>,

    inbuf: BytesMut,
    /// Leading bytes of `inbuf` that already went through the filter.
    decoded: usize,
    /// Input bytes consumed since the last [`PeerIo::take_consumed`].
    consumed: usize,
    read_anything: bool,

    outbuf: BytesMut,
    /// `(bytes, is_payload)` of each queued write, in order.
    outbuf_info: VecDeque<(usize, bool)>,
    payload_written: usize,

    enabled: [bool; 2],
    interest: IoInterest,
}

impl std::fmt::Debug for PeerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIo")
            .field("conn", &self.conn)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("inbuf", &self.inbuf.len())
            .field("outbuf", &self.outbuf.len())
            .finish()
    }
}

impl PeerIo {
    /// A connection whose leaf node hangs under `parent`.
    pub fn new(
        bw: &mut Bandwidth,
        parent: Option<NodeId>,
        conn: ConnId,
        addr: SocketAddr,
        direction: Direction,
        kind: TransportKind,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let bandwidth = bw.add_node(parent);
        bw.set_conn(bandwidth, Some(conn));

        let mut io = Self {
            conn,
            addr,
            direction,
            kind,
            transport,
            bandwidth,
            filter: Filter::default(),
            info_hash: None,
            inbuf: BytesMut::new(),
            decoded: 0,
            consumed: 0,
            read_anything: false,
            outbuf: BytesMut::new(),
            outbuf_info: VecDeque::new(),
            payload_written: 0,
            enabled: [true, true],
            interest: IoInterest::default(),
        };
        io.update_interest(true);
        io
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn bandwidth(&self) -> NodeId {
        self.bandwidth
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn has_read_anything(&self) -> bool {
        self.read_anything
    }

    pub fn torrent_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    pub fn set_torrent_hash(&mut self, hash: InfoHash) {
        self.info_hash = Some(hash);
    }

    /// Move the leaf node under another parent.
    pub fn set_parent(&self, bw: &mut Bandwidth, parent: Option<NodeId>) {
        bw.set_parent(self.bandwidth, parent);
    }

    /// Release the bandwidth node. The io must not be flushed afterwards.
    pub fn release(&self, bw: &mut Bandwidth) {
        bw.remove(self.bandwidth);
    }

    /// Plug in the transport of a connect that finished.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.kind = transport.kind();
        self.transport = Some(transport);
        self.update_interest(true);
    }

    /// Throw away the transport and every buffered byte, for a new connect
    /// attempt on the same io.
    pub fn reconnect(&mut self, kind: TransportKind) {
        self.transport = None;
        self.kind = kind;
        self.filter = Filter::default();
        self.inbuf.clear();
        self.decoded = 0;
        self.outbuf.clear();
        self.outbuf_info.clear();
        self.read_anything = false;
    }

    // encryption

    pub fn encrypt_init(&mut self, secret: &[u8; KEY_LEN], hash: &InfoHash) {
        self.filter.encrypt_init(self.is_incoming(), secret, hash);
    }

    pub fn decrypt_init(&mut self, secret: &[u8; KEY_LEN], hash: &InfoHash) {
        self.filter.decrypt_init(self.is_incoming(), secret, hash);
    }

    pub fn is_encrypted(&self) -> bool {
        self.filter.is_encrypting()
    }

    pub fn disable_encrypt(&mut self) {
        self.filter.disable_encrypt();
    }

    pub fn disable_decrypt(&mut self) {
        self.filter.disable_decrypt();
    }

    /// Keep decrypting for `n` more input bytes, then stop.
    pub fn set_decrypt_limit(&mut self, n: usize) {
        self.filter.set_decrypt_limit(n);
    }

    // input

    pub fn read_buffer_size(&self) -> usize {
        self.inbuf.len()
    }

    /// Compare the head of the input as it came off the wire.
    pub fn starts_with(&self, needle: &[u8]) -> bool {
        self.inbuf.starts_with(needle)
    }

    fn decode_up_to(&mut self, n: usize) {
        let n = n.min(self.inbuf.len());
        if n > self.decoded {
            let decoded = self.decoded;
            self.filter.decrypt(&mut self.inbuf[decoded..n]);
            self.decoded = n;
        }
    }

    fn advance(&mut self, n: usize) {
        self.inbuf.advance(n);
        self.decoded = self.decoded.saturating_sub(n);
        self.consumed += n;
    }

    /// Fill `dst` with decrypted input. Returns `false`, consuming nothing,
    /// when not enough input is buffered.
    pub fn read_into(&mut self, dst: &mut [u8]) -> bool {
        let n = dst.len();
        if self.inbuf.len() < n {
            return false;
        }
        self.decode_up_to(n);
        dst.copy_from_slice(&self.inbuf[..n]);
        self.advance(n);
        true
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf).then_some(buf)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let mut buf = [0u8; 2];
        self.read_into(&mut buf).then(|| u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf).then(|| u32::from_be_bytes(buf))
    }

    /// Consume `n` bytes, decrypting them so the cipher stays in step.
    pub fn drain(&mut self, n: usize) {
        let n = n.min(self.inbuf.len());
        self.decode_up_to(n);
        self.advance(n);
    }

    /// Run `f` over the decrypted input, for message codecs.
    pub fn with_decoded<R>(&mut self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        self.decode_up_to(self.inbuf.len());
        let before = self.inbuf.len();
        let r = f(&mut self.inbuf);
        let used = before.saturating_sub(self.inbuf.len());
        self.decoded = self.decoded.saturating_sub(used).min(self.inbuf.len());
        self.consumed += used;
        r
    }

    /// Input bytes consumed since the previous call.
    pub fn take_consumed(&mut self) -> usize {
        std::mem::take(&mut self.consumed)
    }

    /// Charge consumed input to the bandwidth tree, `piece` of the `used`
    /// bytes being payload. The acks it costs are charged upstream.
    pub fn notify_read(
        &self,
        bw: &mut Bandwidth,
        used: usize,
        piece: usize,
        now: Instant,
    ) {
        let piece = piece.min(used);
        if piece > 0 {
            bw.notify_consumed(self.bandwidth, Dir::Down, piece, true, now);
        }
        if used > piece {
            bw.notify_consumed(self.bandwidth, Dir::Down, used - piece, false, now);
        }
        let overhead = guess_packet_overhead(used);
        if overhead > 0 {
            bw.notify_consumed(self.bandwidth, Dir::Up, overhead, false, now);
        }
    }

    /// Read at most `max` bytes from the socket, as much as the bandwidth
    /// tree allows. End of stream is an `UnexpectedEof` error.
    pub fn try_read(
        &mut self,
        bw: &mut Bandwidth,
        max: usize,
        now: Instant,
    ) -> io::Result<usize> {
        let room = READ_CAP.saturating_sub(self.inbuf.len());
        let howmuch = bw.clamp(self.bandwidth, Dir::Down, max.min(room), now);

        if howmuch == 0 {
            self.set_enabled(Dir::Down, false);
            return Ok(0);
        }
        let Some(transport) = &mut self.transport else { return Ok(0) };

        let start = self.inbuf.len();
        self.inbuf.resize(start + howmuch, 0);
        let res = transport.try_read(&mut self.inbuf[start..]);

        match res {
            Ok(0) => {
                self.inbuf.truncate(start);
                Err(io::ErrorKind::UnexpectedEof.into())
            }
            Ok(n) => {
                self.inbuf.truncate(start + n);
                self.read_anything = true;
                trace!("{} read {n} bytes", self.conn);
                Ok(n)
            }
            Err(e) => {
                self.inbuf.truncate(start);
                match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                        Ok(0)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    // output

    /// Queue `bytes`, encrypted if the write side is encrypted.
    pub fn write(&mut self, bytes: &[u8], is_payload: bool) {
        if bytes.is_empty() {
            return;
        }
        let start = self.outbuf.len();
        self.outbuf.extend_from_slice(bytes);
        self.filter.encrypt(&mut self.outbuf[start..]);
        self.outbuf_info.push_back((bytes.len(), is_payload));
        self.update_interest(false);
    }

    pub fn write_buffer_size(&self) -> usize {
        self.outbuf.len()
    }

    /// Bytes of the queued protocol messages ahead of the first payload.
    fn protocol_bytes_ahead(&self) -> usize {
        self.outbuf_info
            .iter()
            .take_while(|(_, is_payload)| !is_payload)
            .map(|(n, _)| n)
            .sum()
    }

    /// Push out the control messages at the head of the output.
    pub fn flush_protocol(&mut self, bw: &mut Bandwidth, now: Instant) -> io::Result<usize> {
        let n = self.protocol_bytes_ahead();
        if n == 0 {
            return Ok(0);
        }
        self.try_write(bw, n, now)
    }

    /// Payload bytes that reached the socket since the previous call.
    pub fn take_payload_written(&mut self) -> usize {
        std::mem::take(&mut self.payload_written)
    }

    /// Write at most `max` queued bytes, as much as the bandwidth tree
    /// allows.
    pub fn try_write(
        &mut self,
        bw: &mut Bandwidth,
        max: usize,
        now: Instant,
    ) -> io::Result<usize> {
        let max = max.min(self.outbuf.len());
        if max == 0 {
            return Ok(0);
        }

        let howmuch = bw.clamp(self.bandwidth, Dir::Up, max, now);
        if howmuch == 0 {
            self.set_enabled(Dir::Up, false);
            return Ok(0);
        }
        let Some(transport) = &mut self.transport else { return Ok(0) };

        let n = match transport.try_write(&self.outbuf[..howmuch]) {
            Ok(n) => n,
            Err(e) => {
                return match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                        Ok(0)
                    }
                    _ => Err(e),
                };
            }
        };

        self.outbuf.advance(n);
        self.did_write(bw, n, now);
        self.update_interest(false);
        Ok(n)
    }

    fn did_write(&mut self, bw: &mut Bandwidth, mut written: usize, now: Instant) {
        while written > 0 {
            let Some((left, is_payload)) = self.outbuf_info.front_mut() else {
                break;
            };
            let payload = (*left).min(written);
            let is_payload = *is_payload;

            bw.notify_consumed(self.bandwidth, Dir::Up, payload, is_payload, now);
            let overhead = guess_packet_overhead(payload);
            if overhead > 0 {
                bw.notify_consumed(self.bandwidth, Dir::Up, overhead, false, now);
            }
            if is_payload {
                self.payload_written += payload;
            }

            written -= payload;
            *left -= payload;
            if *left == 0 {
                self.outbuf_info.pop_front();
            }
        }
    }

    // readiness

    pub fn is_enabled(&self, dir: Dir) -> bool {
        self.enabled[dir.index()]
    }

    pub fn set_enabled(&mut self, dir: Dir, enabled: bool) {
        self.enabled[dir.index()] = enabled;
        self.update_interest(false);
    }

    /// Re-arm readiness after an event was handled.
    pub fn rearm(&mut self) {
        self.update_interest(true);
    }

    fn update_interest(&mut self, force: bool) {
        let interest = IoInterest {
            read: self.enabled[Dir::Down.index()],
            write: self.enabled[Dir::Up.index()] && !self.outbuf.is_empty(),
        };
        if interest == self.interest && !force {
            return;
        }
        self.interest = interest;
        if let Some(t) = &mut self.transport {
            t.set_interest(interest);
        }
    }
}
