//! A connected remote peer, after the handshake.
use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use bitvec::{bitvec, order::Msb0};
use bytes::BytesMut;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::{
    bandwidth::Bandwidth,
    bitfield::{Bitfield, Reserved},
    error::Error,
    peer_io::PeerIo,
    types::{ConnId, Dir, PeerId},
    wire::{BlockInfo, Message, MessageCodec, BLOCK_LEN},
};

use super::{choke::NEW_PEER_AGE, stats::History};

/// Requests a peer may queue on us, and the default for how many it takes.
pub const REQQ: usize = 250;

/// Seconds of download a peer is kept busy with.
const REQUEST_BUF_SECS: u64 = 10;

const KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Peer {
    pub io: PeerIo,
    pub peer_id: PeerId,
    pub reserved: Reserved,
    /// We are choking the peer.
    pub am_choking: bool,
    pub am_interested: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Pieces the peer has.
    pub have: Bitfield,
    /// Blocks the peer asked us for, oldest first.
    pub peer_requests: VecDeque<BlockInfo>,
    pub blocks_to_client: History,
    pub blocks_to_peer: History,
    pub cancels_to_client: History,
    pub cancels_to_peer: History,
    /// Pieces the peer sent data for, cleared once the piece is checked.
    pub blame: Bitfield,
    /// Pieces it contributed to that failed the hash check.
    pub strikes: u8,
    /// Close at the next chance.
    pub do_purge: bool,
    pub connected_at: Instant,
    last_sent: Instant,
}

impl Peer {
    pub fn new(
        io: PeerIo,
        peer_id: PeerId,
        reserved: Reserved,
        piece_count: usize,
        now: Instant,
    ) -> Self {
        Self {
            io,
            peer_id,
            reserved,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            have: bitvec![u8, Msb0; 0; piece_count],
            peer_requests: VecDeque::new(),
            blocks_to_client: History::new(),
            blocks_to_peer: History::new(),
            cancels_to_client: History::new(),
            cancels_to_peer: History::new(),
            blame: bitvec![u8, Msb0; 0; piece_count],
            strikes: 0,
            do_purge: false,
            connected_at: now,
            last_sent: now,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.io.conn()
    }

    pub fn addr(&self) -> SocketAddr {
        self.io.addr()
    }

    /// Both ends speak the fast extension.
    pub fn supports_fast(&self) -> bool {
        self.reserved.supports_fast()
    }

    pub fn is_seed(&self) -> bool {
        !self.have.is_empty() && self.have.all()
    }

    /// Share of the torrent the peer has.
    pub fn progress(&self) -> f32 {
        if self.have.is_empty() {
            return 0.0;
        }
        self.have.count_ones() as f32 / self.have.len() as f32
    }

    pub fn is_new(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.connected_at) < NEW_PEER_AGE
    }

    /// Block data is moving in `dir` right now.
    pub fn is_active(&self, dir: Dir, bw: &Bandwidth, now: Instant) -> bool {
        let flags = match dir {
            Dir::Up => self.peer_interested && !self.am_choking,
            Dir::Down => self.am_interested && !self.peer_choking,
        };
        flags && self.rate(dir, bw, now) > 0
    }

    /// Bytes per second of block data.
    pub fn rate(&self, dir: Dir, bw: &Bandwidth, now: Instant) -> u64 {
        bw.piece_speed(self.io.bandwidth(), dir, now)
    }

    /// Requests to keep in flight, enough for a few seconds of download at
    /// the current rate.
    pub fn desired_requests(&self, bw: &Bandwidth, now: Instant) -> usize {
        let rate = self.rate(Dir::Down, bw, now);
        let n = (rate * REQUEST_BUF_SECS / BLOCK_LEN as u64) as usize;
        n.max(4).min(REQQ)
    }

    /// Queue a message. Block data is attributed as payload, the rest as
    /// protocol overhead.
    pub fn send(&mut self, msg: Message, now: Instant) {
        trace!("{} > {msg:?}", self.conn());
        let payload = msg.payload_len();
        let mut buf = BytesMut::with_capacity(msg.len());

        if let Err(e) = MessageCodec.encode(msg, &mut buf) {
            warn!("{} could not encode message: {e}", self.conn());
            self.do_purge = true;
            return;
        }

        let header = buf.len() - payload;
        self.io.write(&buf[..header], false);
        self.io.write(&buf[header..], true);
        self.last_sent = now;
    }

    /// Decode every complete message buffered.
    pub fn read_messages(&mut self) -> Result<Vec<Message>, Error> {
        self.io.with_decoded(|buf| {
            let mut messages = Vec::new();
            while let Some(msg) = MessageCodec.decode(buf)? {
                messages.push(msg);
            }
            Ok(messages)
        })
    }

    pub fn set_choke(&mut self, choke: bool, now: Instant) {
        if self.am_choking == choke {
            return;
        }
        self.am_choking = choke;

        if choke {
            let pending = std::mem::take(&mut self.peer_requests);
            if self.supports_fast() {
                for block in pending {
                    self.send(Message::Reject(block), now);
                }
            }
            self.send(Message::Choke, now);
        } else {
            self.send(Message::Unchoke, now);
        }
    }

    pub fn set_interested(&mut self, interested: bool, now: Instant) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        let msg = if interested { Message::Interested } else { Message::NotInterested };
        self.send(msg, now);
    }

    /// Say something if we have been quiet for too long.
    pub fn keep_alive(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sent) >= KEEP_ALIVE {
            self.send(Message::KeepAlive, now);
        }
    }
}
