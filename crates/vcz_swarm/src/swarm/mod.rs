//! One torrent's share of the engine.
//!
//! A [`Swarm`] owns the connected [`Peer`]s of a torrent, the pool of
//! [`PeerAtom`]s it knows about, the outstanding block requests and the
//! [`Wishlist`] deciding what to ask for next. It never touches a socket:
//! the peer manager reads into the peers' buffers, hands them to
//! [`Swarm::process_input`] and flushes what the swarm queued.
pub mod atom;
pub mod candidates;
pub mod choke;
pub mod events;
pub mod peer;
pub mod requests;
pub mod stats;
pub mod wishlist;

use std::{cmp::Reverse, collections::BTreeMap, net::SocketAddr, time::Duration};

use hashbrown::HashSet;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::{
    bandwidth::{Bandwidth, NodeId},
    bitfield::{Bitfield, Reserved, VczBitfield},
    config::Config,
    error::Error,
    peer_io::{transport::TransportKind, PeerIo},
    storage::Storage,
    types::{ConnId, Dir, InfoHash, PeerId, Priority},
    wire::{Block, BlockInfo, Message, BLOCK_LEN},
};

use self::{
    atom::{PeerAtom, PeerFrom, PeerHints},
    candidates::{candidate_score, is_candidate, TorrentTraits},
    choke::{max_interesting, pick_optimistic, unchoke_best, ChokeData, RechokeState},
    events::{Event, SwarmEvent},
    peer::Peer,
    requests::ActiveRequests,
    stats::{PeerStats, SwarmStats, CANCEL_HISTORY},
    wishlist::{PieceCtx, Requester, Wishlist},
};

/// Corrupt pieces a peer may take part in before it is banned.
pub const MAX_BAD_PIECES_PER_PEER: u8 = 5;

/// Requests unanswered for this long are cancelled.
pub const REQUEST_TTL: Duration = Duration::from_secs(90);

/// Idle time allowed when peers are plentiful.
pub const MIN_UPLOAD_IDLE: Duration = Duration::from_secs(60);

/// Idle time allowed when peers are scarce.
pub const MAX_UPLOAD_IDLE: Duration = Duration::from_secs(300);

/// Two seeds stay connected this long so peer exchange can happen.
const SEED_PEX_GRACE: Duration = Duration::from_secs(30);

/// Block data queued per peer before the next block is read from storage.
const UPLOAD_QUEUE: usize = 4 * BLOCK_LEN;

/// How close a peer is to being dropped, smaller is more useful: not
/// purged, then recent piece data, then a recent connection.
pub type Activity = (bool, Reverse<Option<Instant>>, Reverse<Option<Instant>>);

/// A peer with a piece we want and don't have.
fn wants_from(storage: &dyn Storage, have: &Bitfield) -> bool {
    !storage.is_done()
        && have.iter_ones().any(|p| storage.is_wanted(p) && !storage.has_piece(p))
}

fn since(t: Option<Instant>, now: Instant) -> Duration {
    t.map(|t| now.saturating_duration_since(t)).unwrap_or(Duration::MAX)
}

pub struct Swarm {
    pub info_hash: InfoHash,
    /// The id we present to this swarm.
    pub peer_id: PeerId,
    storage: Box<dyn Storage>,
    bandwidth: NodeId,
    priority: Priority,
    is_running: bool,
    started_at: Instant,

    pool: BTreeMap<SocketAddr, PeerAtom>,
    peers: BTreeMap<ConnId, Peer>,
    requests: ActiveRequests,
    wishlist: Wishlist,
    /// Connected peers that have each piece.
    replication: Vec<u16>,
    /// Average requests per downloading peer once in endgame, zero before.
    endgame: usize,
    needs_completeness_check: bool,

    optimistic: Option<ConnId>,
    /// Rechokes left before the optimistic unchoke is drawn again.
    optimistic_scaler: u32,
    max_interested: usize,
    last_cancel: Option<Instant>,
    /// Interest changed, the upload slots should be redistributed soon.
    rechoke_soon: bool,

    peer_limit: usize,
    upload_slots: usize,
    allow_pex: bool,
    optimistic_multiplier: u32,
    new_peer_weight: u32,

    pub events: Event<SwarmEvent>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("info_hash", &self.info_hash)
            .field("is_running", &self.is_running)
            .field("peers", &self.peers.len())
            .field("pool", &self.pool.len())
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl Swarm {
    /// A stopped swarm whose bandwidth node hangs under `parent`.
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        storage: Box<dyn Storage>,
        bw: &mut Bandwidth,
        parent: NodeId,
        config: &Config,
        now: Instant,
    ) -> Self {
        let bandwidth = bw.add_node(Some(parent));
        bw.set_priority(bandwidth, Priority::Normal);
        let replication = vec![0; storage.piece_count()];

        Self {
            info_hash,
            peer_id,
            storage,
            bandwidth,
            priority: Priority::Normal,
            is_running: false,
            started_at: now,
            pool: BTreeMap::new(),
            peers: BTreeMap::new(),
            requests: ActiveRequests::new(),
            wishlist: Wishlist::new(),
            replication,
            endgame: 0,
            needs_completeness_check: true,
            optimistic: None,
            optimistic_scaler: 0,
            max_interested: config.peer_limit_per_torrent,
            last_cancel: None,
            rechoke_soon: false,
            peer_limit: config.peer_limit_per_torrent,
            upload_slots: config.upload_slots_per_torrent,
            allow_pex: config.allow_pex,
            optimistic_multiplier: config.optimistic_unchoke_multiplier,
            new_peer_weight: config.new_peer_weight,
            events: Event::new(),
        }
    }

    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        &mut *self.storage
    }

    pub fn bandwidth(&self) -> NodeId {
        self.bandwidth
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame > 0
    }

    pub fn peer_limit(&self) -> usize {
        self.peer_limit
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, bw: &mut Bandwidth, priority: Priority) {
        self.priority = priority;
        bw.set_priority(self.bandwidth, priority);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer(&self, conn: ConnId) -> Option<&Peer> {
        self.peers.get(&conn)
    }

    pub fn peer_mut(&mut self, conn: ConnId) -> Option<&mut Peer> {
        self.peers.get_mut(&conn)
    }

    pub fn atom(&self, addr: &SocketAddr) -> Option<&PeerAtom> {
        self.pool.get(addr)
    }

    pub fn atom_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerAtom> {
        self.pool.get_mut(addr)
    }

    pub fn atoms(&self) -> impl Iterator<Item = &PeerAtom> {
        self.pool.values()
    }

    pub fn requests(&self) -> &ActiveRequests {
        &self.requests
    }

    /// Whether a rechoke was asked for since the last call.
    pub fn take_rechoke_soon(&mut self) -> bool {
        std::mem::take(&mut self.rechoke_soon)
    }

    pub fn start(&mut self, now: Instant) {
        if self.is_running {
            return;
        }
        info!("{:?} started", self.info_hash);
        self.is_running = true;
        self.started_at = now;
        self.needs_completeness_check = true;
    }

    /// Disconnect every peer. Returns the connections that were closed.
    pub fn stop(&mut self, bw: &mut Bandwidth, now: Instant) -> Vec<ConnId> {
        info!("{:?} stopped", self.info_hash);
        self.is_running = false;
        self.wishlist.reset();
        self.endgame = 0;

        let conns: Vec<ConnId> = self.peers.keys().copied().collect();
        for &conn in &conns {
            self.remove_peer(conn, bw, now);
        }
        conns
    }

    // the pool

    /// The atom of `addr`, created if unknown.
    pub fn ensure_atom(
        &mut self,
        addr: SocketAddr,
        from: PeerFrom,
        hints: PeerHints,
        now: Instant,
    ) -> &mut PeerAtom {
        self.pool
            .entry(addr)
            .and_modify(|a| a.merge(from, hints))
            .or_insert_with(|| PeerAtom::new(addr, from, hints, now))
    }

    /// Addresses learned from a discovery source.
    pub fn add_candidates(
        &mut self,
        peers: impl IntoIterator<Item = (SocketAddr, PeerHints)>,
        from: PeerFrom,
        now: Instant,
    ) {
        for (addr, hints) in peers {
            self.ensure_atom(addr, from, hints, now);
        }
    }

    /// Atoms worth dialing, with their score. Lower scores go first.
    pub fn candidates<R: Rng>(&self, now: Instant, rng: &mut R) -> Vec<(u64, SocketAddr)> {
        let traits = TorrentTraits {
            priority: self.priority,
            started_at: self.started_at,
            is_seed: self.storage.is_done(),
        };
        self.pool
            .values()
            .filter(|a| is_candidate(a, traits.is_seed, now))
            .map(|a| (candidate_score(a, &traits, rng.gen(), now), a.addr))
            .collect()
    }

    /// Most atoms worth keeping.
    pub fn max_atoms(&self) -> usize {
        (self.peer_limit * 3).min(50)
    }

    /// Forget the least useful atoms once the pool grows past its cap. Atoms
    /// in use are always kept.
    pub fn prune_atoms(&mut self, now: Instant) {
        let max = self.max_atoms();
        if self.pool.len() <= max {
            return;
        }

        let (in_use, mut rest): (Vec<&PeerAtom>, Vec<&PeerAtom>) =
            self.pool.values().partition(|a| a.is_in_use());
        rest.sort_by(|a, b| a.cmp_by_shelf_date(b, now));

        let room = max.saturating_sub(in_use.len());
        let keep: HashSet<SocketAddr> = in_use
            .iter()
            .chain(rest.iter().take(room))
            .map(|a| a.addr)
            .collect();

        let before = self.pool.len();
        self.pool.retain(|addr, _| keep.contains(addr));
        debug!("{:?} pruned {} atoms", self.info_hash, before - self.pool.len());
    }

    // connections

    /// Take over the io of a finished handshake.
    pub fn add_peer(
        &mut self,
        io: PeerIo,
        peer_id: PeerId,
        reserved: Reserved,
        now: Instant,
    ) -> ConnId {
        let conn = io.conn();
        let addr = io.addr();
        let mut peer = Peer::new(io, peer_id, reserved, self.storage.piece_count(), now);

        let have = self.storage.bitfield();
        if peer.supports_fast() {
            let msg = if self.storage.is_seed() {
                Message::HaveAll
            } else if have.not_any() {
                Message::HaveNone
            } else {
                Message::Bitfield(have)
            };
            peer.send(msg, now);
        } else if have.any() {
            peer.send(Message::Bitfield(have), now);
        }

        debug!("{:?} new peer {conn} {addr}", self.info_hash);
        self.peers.insert(conn, peer);
        self.rechoke_soon = true;
        self.events.emit(&SwarmEvent::PeerConnected { info_hash: self.info_hash, conn, addr });
        conn
    }

    /// Drop a connection, releasing everything it held.
    pub fn remove_peer(&mut self, conn: ConnId, bw: &mut Bandwidth, now: Instant) -> bool {
        let Some(peer) = self.peers.remove(&conn) else { return false };
        let addr = peer.addr();

        for piece in peer.have.iter_ones() {
            if let Some(r) = self.replication.get_mut(piece) {
                *r = r.saturating_sub(1);
            }
        }
        let dropped = self.requests.remove_peer(conn);
        if !dropped.is_empty() || peer.have.any() {
            self.wishlist.invalidate();
        }
        if let Some(atom) = self.pool.get_mut(&addr) {
            atom.on_closed(now);
        }
        if self.optimistic == Some(conn) {
            self.optimistic = None;
        }
        peer.io.release(bw);

        debug!("{:?} removed peer {conn} {addr}", self.info_hash);
        self.events.emit(&SwarmEvent::PeerDisconnected { info_hash: self.info_hash, conn, addr });
        true
    }

    // messages

    /// Handle what a peer sent. An error is a protocol violation, the
    /// connection has to be closed.
    pub fn process_input(&mut self, conn: ConnId, bw: &mut Bandwidth, now: Instant) -> Result<(), Error> {
        let Some(peer) = self.peers.get_mut(&conn) else { return Ok(()) };

        let messages = match peer.read_messages() {
            Ok(m) => m,
            Err(e) => {
                peer.do_purge = true;
                return Err(e);
            }
        };
        let used = peer.io.take_consumed();
        let payload = messages.iter().map(Message::payload_len).sum();
        peer.io.notify_read(bw, used, payload, now);

        for msg in messages {
            if let Err(e) = self.on_message(conn, msg, now) {
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.do_purge = true;
                }
                return Err(e);
            }
        }

        if self.is_running {
            self.fill_requests(conn, bw, now);
            self.serve_uploads(conn, now);
        }
        Ok(())
    }

    pub fn on_message(&mut self, conn: ConnId, msg: Message, now: Instant) -> Result<(), Error> {
        let piece_count = self.storage.piece_count();
        let info_hash = self.info_hash;
        let Some(peer) = self.peers.get_mut(&conn) else { return Ok(()) };
        trace!("{conn} < {msg:?}");

        match msg {
            Message::KeepAlive | Message::Port(_) | Message::Extended(_) => {}
            Message::Choke => {
                peer.peer_choking = true;
                if !self.requests.remove_peer(conn).is_empty() {
                    self.wishlist.invalidate();
                }
                self.events.emit(&SwarmEvent::GotChoke { info_hash, conn });
            }
            Message::Unchoke => peer.peer_choking = false,
            Message::Interested | Message::NotInterested => {
                let interested = matches!(msg, Message::Interested);
                if peer.peer_interested != interested {
                    peer.peer_interested = interested;
                    self.rechoke_soon = true;
                }
            }
            Message::Have(piece) => {
                if piece >= piece_count {
                    return Err(Error::MessageResponse);
                }
                if !peer.have.has(piece) {
                    peer.have.set(piece, true);
                    self.replication[piece] = self.replication[piece].saturating_add(1);
                    self.resort(piece);
                }
                self.events.emit(&SwarmEvent::GotHave { info_hash, conn, piece });
                self.update_interest(conn, now);
            }
            Message::Bitfield(bitfield) => {
                if bitfield.len() != piece_count.div_ceil(8) * 8 {
                    return Err(Error::MessageResponse);
                }
                let mut have = bitfield;
                have.truncate(piece_count);
                self.set_have(conn, have);
                self.events.emit(&SwarmEvent::GotBitfield { info_hash, conn });
                self.update_interest(conn, now);
            }
            Message::HaveAll | Message::HaveNone => {
                let all = matches!(msg, Message::HaveAll);
                let have = Bitfield::repeat(all, piece_count);
                self.set_have(conn, have);
                self.events.emit(&SwarmEvent::GotBitfield { info_hash, conn });
                self.update_interest(conn, now);
            }
            Message::Request(block) => self.got_request(conn, block, now),
            Message::Cancel(block) => {
                peer.cancels_to_client.add(now, 1);
                let before = peer.peer_requests.len();
                peer.peer_requests.retain(|b| *b != block);
                if peer.peer_requests.len() < before && peer.supports_fast() {
                    peer.send(Message::Reject(block), now);
                }
            }
            Message::Reject(block) => {
                if self.requests.remove(&block, conn) {
                    self.resort(block.index);
                }
                self.events.emit(&SwarmEvent::GotReject { info_hash, conn, block });
            }
            Message::Piece(block) => self.got_block(conn, block, now)?,
        }
        Ok(())
    }

    fn set_have(&mut self, conn: ConnId, have: Bitfield) {
        let Some(peer) = self.peers.get_mut(&conn) else { return };
        for piece in peer.have.iter_ones() {
            self.replication[piece] = self.replication[piece].saturating_sub(1);
        }
        for piece in have.iter_ones() {
            self.replication[piece] = self.replication[piece].saturating_add(1);
        }
        peer.have = have;
        self.wishlist.invalidate();
    }

    /// Be interested in a peer that has something for us, while we are
    /// below the number of peers we want to download from.
    fn update_interest(&mut self, conn: ConnId, now: Instant) {
        let interested = self.peers.values().filter(|p| p.am_interested).count();
        let Some(peer) = self.peers.get_mut(&conn) else { return };

        if !peer.am_interested
            && self.is_running
            && interested < self.max_interested
            && wants_from(&*self.storage, &peer.have)
        {
            peer.set_interested(true, now);
        }
    }

    fn got_request(&mut self, conn: ConnId, block: BlockInfo, now: Instant) {
        let Some(peer) = self.peers.get_mut(&conn) else { return };

        let fits = block.is_valid()
            && block.index < self.storage.piece_count()
            && block.begin + block.len <= self.storage.piece_size(block.index);
        let ok = fits
            && !peer.am_choking
            && self.storage.has_piece(block.index)
            && peer.peer_requests.len() < peer::REQQ;

        if ok {
            peer.peer_requests.push_back(block);
        } else if peer.supports_fast() {
            debug!("{conn} rejecting request {block:?}");
            peer.send(Message::Reject(block), now);
        }
    }

    fn got_block(&mut self, conn: ConnId, block: Block, now: Instant) -> Result<(), Error> {
        let info = BlockInfo::from(&block);
        if !self.requests.has(&info, conn) {
            debug!("{conn} sent {info:?} that we did not ask for");
            return Ok(());
        }

        // everyone else asked for it can stop
        for other in self.requests.remove_block(&info) {
            if other == conn {
                continue;
            }
            if let Some(p) = self.peers.get_mut(&other) {
                p.send(Message::Cancel(info), now);
                p.cancels_to_peer.add(now, 1);
            }
        }

        let index = info.index;
        if self.storage.has_block(index, info.begin / BLOCK_LEN) {
            return Ok(());
        }
        self.storage.write_block(&block)?;

        let addr = match self.peers.get_mut(&conn) {
            Some(peer) => {
                peer.blocks_to_client.add(now, 1);
                peer.blame.set(index, true);
                peer.addr()
            }
            None => return Ok(()),
        };
        if let Some(atom) = self.pool.get_mut(&addr) {
            atom.piece_data_time = Some(now);
        }
        self.events.emit(&SwarmEvent::BlockCompleted { info_hash: self.info_hash, block: info, conn });

        if !self.storage.has_all_blocks(index) {
            self.resort(index);
        } else if self.storage.verify_piece(index) {
            self.piece_completed(index, now);
        } else {
            self.got_bad_piece(index, now);
        }
        Ok(())
    }

    fn piece_completed(&mut self, piece: usize, now: Instant) {
        debug!("{:?} piece {piece} complete", self.info_hash);
        for peer in self.peers.values_mut() {
            peer.send(Message::Have(piece), now);
            peer.blame.set(piece, false);
        }
        self.wishlist.remove_piece(piece);
        self.recompute_interest(now);
        self.needs_completeness_check = true;
        self.events.emit(&SwarmEvent::PieceCompleted { info_hash: self.info_hash, piece });
    }

    fn got_bad_piece(&mut self, piece: usize, now: Instant) {
        debug!("{:?} piece {piece} failed the hash check", self.info_hash);

        for peer in self.peers.values_mut() {
            if !peer.blame.has(piece) {
                continue;
            }
            peer.blame.set(piece, false);
            peer.strikes += 1;

            if peer.strikes >= MAX_BAD_PIECES_PER_PEER {
                debug!("{} banned after {} bad pieces", peer.addr(), peer.strikes);
                peer.do_purge = true;
                if let Some(atom) = self.pool.get_mut(&peer.addr()) {
                    atom.banned = true;
                }
            }
        }
        self.resort(piece);
        self.recompute_interest(now);
        self.events.emit(&SwarmEvent::PieceFailed { info_hash: self.info_hash, piece });
    }

    /// Our pieces changed: drop peers with nothing left for us, or about to
    /// be purged, then fill the freed slots.
    fn recompute_interest(&mut self, now: Instant) {
        for peer in self.peers.values_mut() {
            if peer.do_purge || !wants_from(&*self.storage, &peer.have) {
                peer.set_interested(false, now);
            }
        }

        let conns: Vec<ConnId> = self
            .peers
            .values()
            .filter(|p| !p.do_purge && !p.am_interested)
            .map(|p| p.conn())
            .collect();
        for conn in conns {
            self.update_interest(conn, now);
        }
    }

    fn resort(&mut self, piece: usize) {
        let ctx = PieceCtx {
            storage: &*self.storage,
            requests: &self.requests,
            replication: &self.replication,
        };
        self.wishlist.resort_piece(piece, &ctx);
    }

    // periodic work

    /// Keep every peer busy. Runs on every bandwidth period.
    pub fn pulse(&mut self, bw: &Bandwidth, now: Instant) {
        if !self.is_running {
            return;
        }
        if self.needs_completeness_check {
            self.needs_completeness_check = false;
            self.check_completeness(now);
        }
        self.update_endgame(bw, now);

        let conns: Vec<ConnId> = self.peers.keys().copied().collect();
        for conn in conns {
            self.fill_requests(conn, bw, now);
            self.serve_uploads(conn, now);
            if let Some(peer) = self.peers.get_mut(&conn) {
                peer.keep_alive(now);
            }
        }
    }

    fn check_completeness(&mut self, now: Instant) {
        if !self.storage.is_done() {
            return;
        }
        info!("{:?} download complete", self.info_hash);
        for peer in self.peers.values_mut() {
            peer.set_interested(false, now);
        }
        self.wishlist.reset();
        self.endgame = 0;
    }

    /// Endgame starts once the requests in flight cover what is left.
    fn update_endgame(&mut self, bw: &Bandwidth, now: Instant) {
        let in_flight = self.requests.len() as u64 * BLOCK_LEN as u64;
        let left = self.storage.left_until_done();

        if left == 0 || in_flight < left {
            self.endgame = 0;
            return;
        }
        if self.endgame == 0 {
            let downloading = self
                .peers
                .values()
                .filter(|p| p.is_active(Dir::Down, bw, now))
                .count();
            self.endgame = (self.requests.len() / downloading.max(1)).max(1);
            debug!("{:?} endgame, {} requests per peer", self.info_hash, self.endgame);
        }
    }

    /// Top up the requests in flight to `conn`.
    pub fn fill_requests(&mut self, conn: ConnId, bw: &Bandwidth, now: Instant) {
        let Some(peer) = self.peers.get_mut(&conn) else { return };
        if !peer.am_interested || peer.peer_choking || peer.do_purge {
            return;
        }

        let pending = self.requests.count_for_peer(conn);
        let desired = peer.desired_requests(bw, now);
        if pending >= desired {
            return;
        }

        let requester = Requester { conn, have: &peer.have, pending };
        let blocks = self.wishlist.next_requests(
            &*self.storage,
            &mut self.requests,
            &self.replication,
            &requester,
            desired - pending,
            self.endgame,
            now,
        );
        for block in blocks {
            peer.send(Message::Request(block), now);
        }
    }

    /// Answer queued requests while the output of `conn` is short.
    pub fn serve_uploads(&mut self, conn: ConnId, now: Instant) {
        let Some(peer) = self.peers.get_mut(&conn) else { return };

        while !peer.am_choking && peer.io.write_buffer_size() < UPLOAD_QUEUE {
            let Some(req) = peer.peer_requests.pop_front() else { break };

            match self.storage.read_block(&req) {
                Some(data) => {
                    let block = Block { index: req.index, begin: req.begin, block: data };
                    peer.send(Message::Piece(block), now);
                    peer.blocks_to_peer.add(now, 1);
                    if let Some(atom) = self.pool.get_mut(&peer.addr()) {
                        atom.piece_data_time = Some(now);
                    }
                }
                None if peer.supports_fast() => peer.send(Message::Reject(req), now),
                None => {}
            }
        }
    }

    /// Pick who we upload to.
    pub fn rechoke_uploads(&mut self, bw: &Bandwidth, now: Instant) {
        if !self.is_running {
            return;
        }
        let mut rng = rand::thread_rng();

        if self.optimistic_scaler > 0 {
            self.optimistic_scaler -= 1;
        } else {
            self.optimistic = None;
        }

        let is_done = self.storage.is_done();
        let is_maxed_out = bw.is_maxed_out(self.bandwidth, Dir::Up, now);
        let mut choke = Vec::with_capacity(self.peers.len());

        for (&conn, peer) in self.peers.iter_mut() {
            // seeds need nothing from us
            if peer.is_seed() {
                peer.set_choke(true, now);
                if self.optimistic == Some(conn) {
                    self.optimistic = None;
                }
                continue;
            }
            if self.optimistic == Some(conn) {
                continue;
            }
            let dir = if is_done { Dir::Up } else { Dir::Down };
            choke.push(ChokeData {
                conn,
                is_interested: peer.peer_interested,
                was_choked: peer.am_choking,
                is_new: peer.is_new(now),
                rate: peer.rate(dir, bw, now),
                salt: rng.gen(),
                is_choked: true,
            });
        }

        let checked = unchoke_best(&mut choke, self.upload_slots, is_maxed_out);

        if self.optimistic.is_none() && !is_maxed_out {
            if let Some(i) = pick_optimistic(&choke, checked, self.new_peer_weight, &mut rng) {
                choke[i].is_choked = false;
                self.optimistic = Some(choke[i].conn);
                self.optimistic_scaler = self.optimistic_multiplier;
                trace!("{:?} optimistic unchoke {}", self.info_hash, choke[i].conn);
            }
        }

        for c in &choke {
            if let Some(peer) = self.peers.get_mut(&c.conn) {
                peer.set_choke(c.is_choked, now);
            }
        }
    }

    /// Pick who we download from. Cancelled requests mean the download is
    /// capped and fewer peers are worth the overhead.
    pub fn rechoke_downloads(&mut self, now: Instant) {
        if !self.is_running {
            return;
        }
        if self.storage.is_done() {
            for peer in self.peers.values_mut() {
                peer.set_interested(false, now);
            }
            return;
        }

        let (mut blocks, mut cancels) = (0, 0);
        for peer in self.peers.values() {
            blocks += peer.blocks_to_client.count(now, CANCEL_HISTORY);
            cancels += peer.cancels_to_peer.count(now, CANCEL_HISTORY);
        }
        if cancels > 0 {
            self.last_cancel = Some(now);
        }

        let interested = self.peers.values().filter(|p| p.am_interested).count();
        self.max_interested = max_interesting(
            blocks,
            cancels,
            interested,
            self.max_interested,
            self.last_cancel.map(|t| now.saturating_duration_since(t)),
            self.peer_limit,
        );

        let mut rng = rand::thread_rng();
        let mut ranked: Vec<(RechokeState, u32, ConnId)> = self
            .peers
            .values()
            .filter(|p| wants_from(&*self.storage, &p.have))
            .map(|p| {
                let state = RechokeState::from_history(
                    p.blocks_to_client.count(now, CANCEL_HISTORY),
                    p.cancels_to_peer.count(now, CANCEL_HISTORY),
                );
                (state, rng.gen(), p.conn())
            })
            .collect();
        ranked.sort_unstable();

        let chosen: HashSet<ConnId> =
            ranked.iter().take(self.max_interested).map(|r| r.2).collect();
        for (conn, peer) in self.peers.iter_mut() {
            peer.set_interested(chosen.contains(conn), now);
        }
    }

    /// Cancel requests that went unanswered for too long.
    pub fn refill_upkeep(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(REQUEST_TTL) else { return };
        let stale = self.requests.sent_before(cutoff);
        if stale.is_empty() {
            return;
        }

        debug!("{:?} cancelling {} stale requests", self.info_hash, stale.len());
        for (block, conn) in stale {
            self.requests.remove(&block, conn);
            if let Some(peer) = self.peers.get_mut(&conn) {
                peer.send(Message::Cancel(block), now);
                peer.cancels_to_peer.add(now, 1);
            }
        }
        self.wishlist.invalidate();
    }

    /// Connections that should go: purged ones, seeds connected to our
    /// seed, and peers idle for longer than the peer count allows.
    pub fn peers_to_close(&self, now: Instant) -> Vec<ConnId> {
        let count = self.peers.len();
        let relax = ((self.peer_limit as f64) * 0.9 + 0.5) as usize;
        let strictness =
            if count >= relax { 1.0 } else { count as f64 / relax.max(1) as f64 };
        let idle_limit =
            MAX_UPLOAD_IDLE - (MAX_UPLOAD_IDLE - MIN_UPLOAD_IDLE).mul_f64(strictness);
        let is_done = self.storage.is_done();

        self.peers
            .values()
            .filter(|p| self.should_close(p, is_done, idle_limit, now))
            .map(Peer::conn)
            .collect()
    }

    fn should_close(&self, peer: &Peer, is_done: bool, idle_limit: Duration, now: Instant) -> bool {
        if peer.do_purge {
            return true;
        }
        let Some(atom) = self.pool.get(&peer.addr()) else { return false };

        if is_done && peer.is_seed() {
            return !self.allow_pex || since(atom.time, now) >= SEED_PEX_GRACE;
        }

        let last = atom.time.max(atom.piece_data_time);
        since(last, now) > idle_limit
    }

    pub fn activity(&self, peer: &Peer) -> Activity {
        let atom = self.pool.get(&peer.addr());
        (
            peer.do_purge,
            Reverse(atom.and_then(|a| a.piece_data_time)),
            Reverse(atom.and_then(|a| a.time)),
        )
    }

    /// The least active connections beyond the peer limit.
    pub fn peers_over_limit(&self) -> Vec<ConnId> {
        if self.peers.len() <= self.peer_limit {
            return Vec::new();
        }
        let mut peers: Vec<(Activity, ConnId)> =
            self.peers.values().map(|p| (self.activity(p), p.conn())).collect();
        peers.sort_unstable();
        peers.into_iter().skip(self.peer_limit).map(|(_, c)| c).collect()
    }

    /// The upload of a seed is full, new peers would only wait.
    pub fn is_upload_maxed_out(&self, bw: &Bandwidth, now: Instant) -> bool {
        self.storage.is_done() && bw.is_maxed_out(self.bandwidth, Dir::Up, now)
    }

    // stats

    pub fn peer_stats(&self, bw: &Bandwidth, now: Instant) -> Vec<PeerStats> {
        self.peers
            .values()
            .map(|p| {
                let conn = p.conn();
                let from = self
                    .pool
                    .get(&p.addr())
                    .map(|a| a.from_first)
                    .unwrap_or(PeerFrom::Incoming);

                let mut s = PeerStats {
                    conn,
                    addr: p.addr(),
                    client: p.peer_id.to_string(),
                    from,
                    progress: p.progress(),
                    is_utp: p.io.kind() == TransportKind::Utp,
                    is_encrypted: p.io.is_encrypted(),
                    is_incoming: p.io.is_incoming(),
                    rate_to_peer: p.rate(Dir::Up, bw, now),
                    rate_to_client: p.rate(Dir::Down, bw, now),
                    peer_is_choked: p.am_choking,
                    peer_is_interested: p.peer_interested,
                    client_is_choked: p.peer_choking,
                    client_is_interested: p.am_interested,
                    is_downloading_from: p.is_active(Dir::Down, bw, now),
                    is_uploading_to: p.is_active(Dir::Up, bw, now),
                    is_seed: p.is_seed(),
                    blocks_to_peer: p.blocks_to_peer.count(now, CANCEL_HISTORY),
                    blocks_to_client: p.blocks_to_client.count(now, CANCEL_HISTORY),
                    cancels_to_peer: p.cancels_to_peer.count(now, CANCEL_HISTORY),
                    cancels_to_client: p.cancels_to_client.count(now, CANCEL_HISTORY),
                    pending_reqs_to_peer: self.requests.count_for_peer(conn),
                    pending_reqs_to_client: p.peer_requests.len(),
                    flags: String::new(),
                };
                s.flags = s.flag_str(self.optimistic == Some(conn));
                s
            })
            .collect()
    }

    pub fn stats(&self, bw: &Bandwidth, now: Instant) -> SwarmStats {
        let mut stats = SwarmStats {
            peer_count: self.peers.len(),
            known_peers: self.pool.len(),
            pending_requests: self.requests.len(),
            is_endgame: self.is_endgame(),
            ..Default::default()
        };
        for p in self.peers.values() {
            if let Some(atom) = self.pool.get(&p.addr()) {
                stats.peer_from_count[atom.from_first.index()] += 1;
            }
            for dir in Dir::ALL {
                if p.is_active(dir, bw, now) {
                    stats.active_peer_count[dir.index()] += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;
    use crate::{
        peer_io::transport::{MemoryTransport, Transport},
        storage::MemoryStorage,
        types::Direction,
        wire::MessageCodec,
    };

    const HASH: InfoHash = InfoHash([9; 20]);

    struct Harness {
        bw: Bandwidth,
        swarm: Swarm,
        remotes: BTreeMap<ConnId, MemoryTransport>,
        next: u64,
    }

    impl Harness {
        fn new(storage: MemoryStorage, config: Config) -> Self {
            let mut bw = Bandwidth::new();
            let root = bw.add_node(None);
            let mut swarm = Swarm::new(
                HASH,
                PeerId::generate(),
                Box::new(storage),
                &mut bw,
                root,
                &config,
                Instant::now(),
            );
            swarm.start(Instant::now());
            Self { bw, swarm, remotes: BTreeMap::new(), next: 1 }
        }

        fn leecher(pieces: usize, blocks_per_piece: usize) -> (Self, Vec<u8>) {
            let piece_len = blocks_per_piece * BLOCK_LEN;
            let data: Vec<u8> = (0..pieces * piece_len).map(|i| (i % 251) as u8).collect();
            let hashes = MemoryStorage::hashes_of(&data, piece_len);
            let storage = MemoryStorage::new(hashes, piece_len, data.len());
            (Self::new(storage, Config::default()), data)
        }

        fn connect(&mut self, now: Instant) -> ConnId {
            let conn = ConnId(self.next);
            self.next += 1;
            let addr: SocketAddr = format!("10.0.0.{}:6881", conn.0).parse().unwrap();
            let (a, b) = MemoryTransport::pair(TransportKind::Tcp);
            let io = PeerIo::new(
                &mut self.bw,
                Some(self.swarm.bandwidth()),
                conn,
                addr,
                Direction::Outbound,
                TransportKind::Tcp,
                Some(Box::new(a)),
            );

            let atom = self.swarm.ensure_atom(addr, PeerFrom::Tracker, PeerHints::default(), now);
            atom.conn = Some(conn);
            atom.time = Some(now);
            self.swarm.add_peer(io, PeerId([conn.0 as u8; 20]), Reserved::supported(false), now);
            self.remotes.insert(conn, b);
            conn
        }

        /// What the swarm sent to `conn`.
        fn sent(&mut self, conn: ConnId, now: Instant) -> Vec<Message> {
            let peer = self.swarm.peer_mut(conn).unwrap();
            peer.io.try_write(&mut self.bw, usize::MAX, now).unwrap();

            let remote = self.remotes.get_mut(&conn).unwrap();
            let mut buf = BytesMut::new();
            let mut chunk = vec![0u8; 1 << 16];
            while let Ok(n) = remote.try_read(&mut chunk) {
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let mut out = Vec::new();
            while let Some(msg) = MessageCodec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
            out
        }

        /// `conn` sends us `msgs`.
        fn receive(&mut self, conn: ConnId, msgs: Vec<Message>, now: Instant) -> Result<(), Error> {
            let mut buf = BytesMut::new();
            for msg in msgs {
                MessageCodec.encode(msg, &mut buf).unwrap();
            }
            self.remotes.get_mut(&conn).unwrap().try_write(&buf).unwrap();
            let peer = self.swarm.peer_mut(conn).unwrap();
            peer.io.try_read(&mut self.bw, usize::MAX, now).unwrap();
            self.swarm.process_input(conn, &mut self.bw, now)
        }
    }

    fn requests_in(msgs: &[Message]) -> Vec<BlockInfo> {
        msgs.iter()
            .filter_map(|m| match m {
                Message::Request(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    fn block_of(data: &[u8], piece_len: usize, b: BlockInfo) -> Message {
        let start = b.index * piece_len + b.begin;
        Message::Piece(Block {
            index: b.index,
            begin: b.begin,
            block: Bytes::copy_from_slice(&data[start..start + b.len]),
        })
    }

    #[test]
    fn downloads_a_piece_from_a_seed() {
        let now = Instant::now();
        let (mut h, data) = Harness::leecher(2, 2);
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _sub = h.swarm.events.subscribe(move |ev| e.lock().unwrap().push(ev.clone()));

        let conn = h.connect(now);
        // fast peers get HaveNone from an empty leecher
        assert_eq!(h.sent(conn, now), vec![Message::HaveNone]);

        h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        let sent = h.sent(conn, now);
        assert_eq!(sent[0], Message::Interested);
        let reqs = requests_in(&sent);
        assert_eq!(reqs.len(), 4);
        assert_eq!(h.swarm.requests().len(), 4);

        let piece_len = 2 * BLOCK_LEN;
        let answers = reqs.iter().map(|b| block_of(&data, piece_len, *b)).collect();
        h.receive(conn, answers, now).unwrap();

        assert!(h.swarm.storage().is_done());
        assert!(h.swarm.requests().is_empty());
        let atom = h.swarm.atom(&h.swarm.peer(conn).unwrap().addr()).unwrap();
        assert_eq!(atom.piece_data_time, Some(now));

        let events = events.lock().unwrap();
        let completed = events
            .iter()
            .filter(|e| matches!(e, SwarmEvent::PieceCompleted { .. }))
            .count();
        assert_eq!(completed, 2);
        assert!(events.iter().any(|e| matches!(e, SwarmEvent::GotBitfield { .. })));
    }

    #[test]
    fn no_block_is_requested_twice_outside_endgame() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(16, 4);
        let a = h.connect(now);
        let b = h.connect(now);

        for conn in [a, b] {
            h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        }
        assert!(!h.swarm.is_endgame());

        let reqs_a = requests_in(&h.sent(a, now));
        let reqs_b = requests_in(&h.sent(b, now));
        assert_eq!(reqs_a.len(), 4);
        assert_eq!(reqs_b.len(), 4);
        for block in &reqs_a {
            assert!(!reqs_b.contains(block));
            assert_eq!(h.swarm.requests().count(block), 1);
        }
    }

    #[test]
    fn endgame_starts_when_requests_cover_what_is_left() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(1, 2);
        let conn = h.connect(now);
        h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        assert_eq!(h.swarm.requests().len(), 2);

        h.swarm.pulse(&h.bw, now);
        assert!(h.swarm.is_endgame());
        assert!(h.swarm.stats(&h.bw, now).is_endgame);
    }

    #[test]
    fn choke_drops_our_requests() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(4, 2);
        let conn = h.connect(now);
        h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        assert!(!h.swarm.requests().is_empty());

        h.receive(conn, vec![Message::Choke], now).unwrap();
        assert!(h.swarm.requests().is_empty());
    }

    #[test]
    fn bad_pieces_get_the_peer_banned() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(1, 1);
        let conn = h.connect(now);
        let addr = h.swarm.peer(conn).unwrap().addr();
        h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();

        for strike in 1..=MAX_BAD_PIECES_PER_PEER {
            let reqs = requests_in(&h.sent(conn, now));
            assert_eq!(reqs.len(), 1, "strike {strike}");
            let garbage = Message::Piece(Block {
                index: 0,
                begin: 0,
                block: Bytes::from(vec![0xee; BLOCK_LEN]),
            });
            h.receive(conn, vec![garbage], now).unwrap();
            assert_eq!(h.swarm.peer(conn).unwrap().strikes, strike);
        }

        assert!(h.swarm.peer(conn).unwrap().do_purge);
        assert!(h.swarm.atom(&addr).unwrap().banned);
        assert_eq!(h.swarm.peers_to_close(now), vec![conn]);
        assert!(!h.swarm.storage().has_piece(0));
    }

    #[test]
    fn completing_a_piece_drops_interest_in_peers_with_nothing_left() {
        let now = Instant::now();
        let (mut h, data) = Harness::leecher(2, 1);
        let conn = h.connect(now);
        h.sent(conn, now);

        let mut have = Bitfield::repeat(false, 8);
        have.set(0, true);
        h.receive(conn, vec![Message::Bitfield(have), Message::Unchoke], now).unwrap();
        let sent = h.sent(conn, now);
        assert_eq!(sent[0], Message::Interested);
        let reqs = requests_in(&sent);
        assert_eq!(reqs, vec![BlockInfo::new(0, 0, BLOCK_LEN)]);

        h.receive(conn, vec![block_of(&data, BLOCK_LEN, reqs[0])], now).unwrap();
        assert!(h.swarm.storage().has_piece(0));
        assert!(!h.swarm.storage().is_done());

        let sent = h.sent(conn, now);
        assert!(sent.contains(&Message::Have(0)));
        assert!(sent.contains(&Message::NotInterested));
        assert!(!h.swarm.peer(conn).unwrap().am_interested);
    }

    #[test]
    fn a_banned_peer_hands_its_interest_to_a_waiting_one() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(1, 1);
        h.swarm.max_interested = 1;

        let a = h.connect(now);
        h.receive(a, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        let b = h.connect(now);
        h.receive(b, vec![Message::HaveAll], now).unwrap();
        assert!(h.swarm.peer(a).unwrap().am_interested);
        assert!(!h.swarm.peer(b).unwrap().am_interested);
        h.sent(b, now);

        for _ in 0..MAX_BAD_PIECES_PER_PEER {
            assert_eq!(requests_in(&h.sent(a, now)).len(), 1);
            let garbage = Message::Piece(Block {
                index: 0,
                begin: 0,
                block: Bytes::from(vec![0xee; BLOCK_LEN]),
            });
            h.receive(a, vec![garbage], now).unwrap();
        }

        assert!(h.swarm.peer(a).unwrap().do_purge);
        assert!(h.sent(a, now).contains(&Message::NotInterested));
        assert!(h.swarm.peer(b).unwrap().am_interested);
        assert_eq!(h.sent(b, now), vec![Message::Interested]);
    }

    #[test]
    fn serves_requests_when_unchoked() {
        let now = Instant::now();
        let data: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| i as u8).collect();
        let mut h = Harness::new(MemoryStorage::seeded(data.clone(), BLOCK_LEN), Config::default());
        let conn = h.connect(now);
        assert_eq!(h.sent(conn, now), vec![Message::HaveAll]);

        let want = BlockInfo::new(1, 0, BLOCK_LEN);
        h.receive(conn, vec![Message::Interested, Message::Request(want)], now).unwrap();
        // choked, so rejected
        assert_eq!(h.sent(conn, now), vec![Message::Reject(want)]);

        h.swarm.rechoke_uploads(&h.bw, now);
        assert_eq!(h.sent(conn, now), vec![Message::Unchoke]);

        h.receive(conn, vec![Message::Request(want)], now).unwrap();
        assert_eq!(h.sent(conn, now), vec![block_of(&data, BLOCK_LEN, want)]);
        let stats = &h.swarm.peer_stats(&h.bw, now)[0];
        assert_eq!(stats.blocks_to_peer, 1);
        assert!(!stats.peer_is_choked);
    }

    #[test]
    fn rechoke_respects_the_upload_slots() {
        let now = Instant::now();
        let data = vec![1u8; 4 * BLOCK_LEN];
        let config = Config { upload_slots_per_torrent: 2, ..Default::default() };
        let mut h = Harness::new(MemoryStorage::seeded(data, BLOCK_LEN), config);

        let conns: Vec<ConnId> = (0..8).map(|_| h.connect(now)).collect();
        for &conn in &conns {
            h.receive(conn, vec![Message::HaveNone, Message::Interested], now).unwrap();
        }

        for round in 0..6 {
            h.swarm.rechoke_uploads(&h.bw, now);
            let unchoked = h.swarm.peers().filter(|p| !p.am_choking).count();
            assert!(unchoked <= 2 + 1, "round {round}: {unchoked} unchoked");
            assert!(unchoked >= 2);
        }
    }

    #[test]
    fn request_ttl_cancels() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(4, 2);
        let conn = h.connect(now);
        h.receive(conn, vec![Message::HaveAll, Message::Unchoke], now).unwrap();
        let reqs = requests_in(&h.sent(conn, now));

        h.swarm.refill_upkeep(now + Duration::from_secs(60));
        assert_eq!(h.swarm.requests().len(), reqs.len());

        let later = now + REQUEST_TTL + Duration::from_secs(1);
        h.swarm.refill_upkeep(later);
        assert!(h.swarm.requests().is_empty());
        let cancels: Vec<Message> = reqs.iter().map(|b| Message::Cancel(*b)).collect();
        assert_eq!(h.sent(conn, later), cancels);
        assert_eq!(h.swarm.peer_stats(&h.bw, later)[0].cancels_to_peer, reqs.len() as u32);
    }

    #[test]
    fn idle_peers_are_closed() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(2, 1);
        let conn = h.connect(now);

        assert!(h.swarm.peers_to_close(now + MIN_UPLOAD_IDLE).is_empty());
        // one peer out of a limit of 50 is scarce, the limit is close to the lenient one
        assert!(h.swarm.peers_to_close(now + Duration::from_secs(290)).is_empty());
        assert_eq!(h.swarm.peers_to_close(now + Duration::from_secs(301)), vec![conn]);
    }

    #[test]
    fn seeds_drop_seeds_after_pex() {
        let now = Instant::now();
        let mut h = Harness::new(MemoryStorage::seeded(vec![3; BLOCK_LEN], BLOCK_LEN), Config::default());
        let conn = h.connect(now);
        h.receive(conn, vec![Message::HaveAll], now).unwrap();

        assert!(h.swarm.peers_to_close(now + Duration::from_secs(10)).is_empty());
        assert_eq!(h.swarm.peers_to_close(now + SEED_PEX_GRACE), vec![conn]);
    }

    #[test]
    fn prune_keeps_atoms_in_use() {
        let now = Instant::now();
        let config = Config { peer_limit_per_torrent: 5, ..Default::default() };
        let storage = MemoryStorage::seeded(vec![0; BLOCK_LEN], BLOCK_LEN);
        let mut h = Harness::new(storage, config);
        let conn = h.connect(now);
        let in_use = h.swarm.peer(conn).unwrap().addr();

        let addrs: Vec<(SocketAddr, PeerHints)> = (0..40)
            .map(|i| (SocketAddr::from(([192, 168, 0, i as u8], 6881)), PeerHints::default()))
            .collect();
        h.swarm.add_candidates(addrs, PeerFrom::Dht, now);
        assert_eq!(h.swarm.atoms().count(), 41);

        h.swarm.prune_atoms(now);
        assert_eq!(h.swarm.atoms().count(), h.swarm.max_atoms());
        assert_eq!(h.swarm.max_atoms(), 15);
        assert!(h.swarm.atom(&in_use).is_some());
    }

    #[test]
    fn over_the_limit_the_least_active_go() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(1, 1);
        h.swarm.peer_limit = 2;

        let a = h.connect(now);
        let b = h.connect(now);
        let c = h.connect(now);
        let addr_a = h.swarm.peer(a).unwrap().addr();
        h.swarm.atom_mut(&addr_a).unwrap().piece_data_time = Some(now);
        h.swarm.peer_mut(b).unwrap().do_purge = true;

        assert_eq!(h.swarm.peers_over_limit(), vec![b]);
        assert!(h.swarm.peers_over_limit().iter().all(|x| *x != a && *x != c));
    }

    #[test]
    fn stopping_closes_every_peer() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(2, 1);
        let a = h.connect(now);
        let b = h.connect(now);

        let closed = h.swarm.stop(&mut h.bw, now);
        assert_eq!(closed, vec![a, b]);
        assert_eq!(h.swarm.peer_count(), 0);
        assert!(!h.swarm.is_running());
        let atom = h.swarm.atoms().next().unwrap();
        assert!(!atom.is_in_use());
        assert_eq!(atom.fail_count, 1);
    }

    #[test]
    fn protocol_errors_purge() {
        let now = Instant::now();
        let (mut h, _) = Harness::leecher(2, 1);
        let conn = h.connect(now);
        assert!(h.receive(conn, vec![Message::Have(7)], now).is_err());
        assert!(h.swarm.peer(conn).unwrap().do_purge);
    }
}
