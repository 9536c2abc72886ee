//! Every swarm of the session, and the connections on their way in.
//!
//! The [`PeerMgr`] owns the bandwidth tree, the handshakes in flight and
//! the swarms. It is driven from outside: readiness events come in through
//! [`PeerMgr::on_ready`], timers through the `*_pulse` methods, and dials
//! it wants made are queued as [`Action`]s for the engine loop to carry out.
use std::{collections::BTreeMap, io, net::SocketAddr, time::Duration};

use hashbrown::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    bandwidth::{Bandwidth, IoPool, NodeId},
    config::Config,
    crypto::KeyPool,
    error::Error,
    handshake::{
        obfuscated_hash, HandshakeError, HandshakeOutcome, HandshakeSession,
        Mediator, TorrentInfo,
    },
    peer_io::{
        transport::{Transport, TransportKind},
        PeerIo, READ_CAP,
    },
    storage::Storage,
    swarm::{
        atom::{PeerFrom, PeerHints},
        candidates::{INCOMING_RESERVE, MAX_CONNECTIONS_PER_SECOND},
        events::{Subscription, SwarmEvent},
        stats::{PeerStats, SwarmStats},
        Activity, Swarm,
    },
    types::{ConnId, Dir, Direction, InfoHash, PeerId, Priority},
};

/// Period of the bandwidth pulse.
pub const BANDWIDTH_PERIOD: Duration = Duration::from_millis(500);

/// How often the upload slots and the download interest are redistributed.
pub const RECHOKE_PERIOD: Duration = Duration::from_secs(10);

/// How often stale requests are looked for.
pub const REFILL_UPKEEP_PERIOD: Duration = Duration::from_secs(10);

/// How often the pools of known addresses are pruned.
pub const ATOM_PERIOD: Duration = Duration::from_secs(60);

/// A dial the engine loop has to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect { conn: ConnId, addr: SocketAddr, kind: TransportKind },
}

/// What a handshake may ask about the session.
struct MediatorView<'a> {
    swarms: &'a mut BTreeMap<InfoHash, Swarm>,
    config: &'a Config,
}

impl Mediator for MediatorView<'_> {
    fn torrent_info(&self, info_hash: &InfoHash) -> Option<TorrentInfo> {
        let swarm = self.swarms.get(info_hash).filter(|s| s.is_running())?;
        Some(TorrentInfo {
            info_hash: *info_hash,
            client_peer_id: swarm.peer_id,
            is_done: swarm.storage().is_done(),
        })
    }

    fn torrent_info_from_obfuscated(&self, obfuscated: &[u8; 20]) -> Option<TorrentInfo> {
        let info_hash = self
            .swarms
            .keys()
            .find(|h| obfuscated_hash(h) == *obfuscated)?;
        self.torrent_info(info_hash)
    }

    fn is_peer_known_seed(&self, info_hash: &InfoHash, addr: SocketAddr) -> bool {
        self.swarms
            .get(info_hash)
            .and_then(|s| s.atom(&addr))
            .is_some_and(|a| a.is_seed())
    }

    fn allows_dht(&self) -> bool {
        self.config.allow_dht
    }

    fn allows_tcp(&self) -> bool {
        self.config.allow_tcp
    }

    fn set_utp_failed(&mut self, info_hash: &InfoHash, addr: SocketAddr) {
        if let Some(atom) = self.swarms.get_mut(info_hash).and_then(|s| s.atom_mut(&addr)) {
            atom.utp_failed = true;
        }
    }
}

/// Every io of the session, by connection, for the bandwidth allocator.
struct IoTable<'a> {
    handshakes: &'a mut HashMap<ConnId, HandshakeSession>,
    swarms: &'a mut BTreeMap<InfoHash, Swarm>,
    conns: &'a HashMap<ConnId, InfoHash>,
    /// Connections that read something.
    read: HashSet<ConnId>,
    errors: Vec<(ConnId, io::Error)>,
}

impl IoTable<'_> {
    fn io_mut(&mut self, conn: ConnId) -> Option<&mut PeerIo> {
        if self.handshakes.contains_key(&conn) {
            return self.handshakes.get_mut(&conn).map(HandshakeSession::io_mut);
        }
        let info_hash = self.conns.get(&conn)?;
        self.swarms
            .get_mut(info_hash)?
            .peer_mut(conn)
            .map(|p| &mut p.io)
    }
}

impl IoPool for IoTable<'_> {
    fn flush(
        &mut self,
        bandwidth: &mut Bandwidth,
        conn: ConnId,
        dir: Dir,
        max: usize,
        now: Instant,
    ) -> usize {
        let Some(io) = self.io_mut(conn) else { return 0 };
        let r = match dir {
            Dir::Up => io.try_write(bandwidth, max, now),
            Dir::Down => io.try_read(bandwidth, max, now),
        };
        match r {
            Ok(n) => {
                if dir == Dir::Down && n > 0 {
                    self.read.insert(conn);
                }
                n
            }
            Err(e) => {
                self.errors.push((conn, e));
                0
            }
        }
    }

    fn flush_protocol(&mut self, bandwidth: &mut Bandwidth, conn: ConnId, now: Instant) {
        let Some(io) = self.io_mut(conn) else { return };
        if let Err(e) = io.flush_protocol(bandwidth, now) {
            self.errors.push((conn, e));
        }
    }

    fn set_enabled(&mut self, conn: ConnId, dir: Dir, enabled: bool) {
        if let Some(io) = self.io_mut(conn) {
            io.set_enabled(dir, enabled);
        }
    }
}

pub struct PeerMgr {
    config: Config,
    bandwidth: Bandwidth,
    /// The session node, carrying the global speed limits.
    root: NodeId,
    peer_id: PeerId,
    swarms: BTreeMap<InfoHash, Swarm>,
    handshakes: HashMap<ConnId, HandshakeSession>,
    /// Connections past the handshake, and their torrent.
    conns: HashMap<ConnId, InfoHash>,
    keys: KeyPool,
    next_conn: u64,
    actions: Vec<Action>,
}

impl std::fmt::Debug for PeerMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerMgr")
            .field("swarms", &self.swarms.len())
            .field("handshakes", &self.handshakes.len())
            .field("conns", &self.conns.len())
            .finish()
    }
}

impl PeerMgr {
    pub fn new(config: Config) -> Self {
        let mut bandwidth = Bandwidth::new();
        let root = bandwidth.add_node(None);
        bandwidth.set_limit(root, Dir::Up, config.speed_limit_up);
        bandwidth.set_limit(root, Dir::Down, config.speed_limit_down);
        let keys = KeyPool::new(config.key_pool_capacity);

        Self {
            config,
            bandwidth,
            root,
            peer_id: PeerId::generate(),
            swarms: BTreeMap::new(),
            handshakes: HashMap::new(),
            conns: HashMap::new(),
            keys,
            next_conn: 0,
            actions: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    pub fn swarm(&self, info_hash: &InfoHash) -> Option<&Swarm> {
        self.swarms.get(info_hash)
    }

    pub fn swarm_mut(&mut self, info_hash: &InfoHash) -> Option<&mut Swarm> {
        self.swarms.get_mut(info_hash)
    }

    /// Connections past the handshake.
    pub fn peer_count(&self) -> usize {
        self.conns.len()
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.len()
    }

    pub fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    /// The dials queued since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn mediator(&mut self) -> MediatorView<'_> {
        MediatorView { swarms: &mut self.swarms, config: &self.config }
    }

    fn swarm_or_err(&mut self, info_hash: &InfoHash) -> Result<&mut Swarm, Error> {
        self.swarms
            .get_mut(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))
    }

    // torrents

    /// Manage a torrent, stopped. Returns `false` if it already was.
    pub fn add_torrent(
        &mut self,
        info_hash: InfoHash,
        storage: Box<dyn Storage>,
        now: Instant,
    ) -> bool {
        if self.swarms.contains_key(&info_hash) {
            return false;
        }
        info!("adding torrent {info_hash}");
        let swarm = Swarm::new(
            info_hash,
            self.peer_id,
            storage,
            &mut self.bandwidth,
            self.root,
            &self.config,
            now,
        );
        self.swarms.insert(info_hash, swarm);
        true
    }

    pub fn remove_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), Error> {
        self.stop_torrent(info_hash, now)?;
        if let Some(swarm) = self.swarms.remove(info_hash) {
            self.bandwidth.remove(swarm.bandwidth());
        }
        info!("removed torrent {info_hash}");
        Ok(())
    }

    pub fn start_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), Error> {
        self.swarm_or_err(info_hash)?.start(now);
        Ok(())
    }

    /// Close every connection of the torrent, handshakes included.
    pub fn stop_torrent(&mut self, info_hash: &InfoHash, now: Instant) -> Result<(), Error> {
        let swarm = self
            .swarms
            .get_mut(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))?;
        for conn in swarm.stop(&mut self.bandwidth, now) {
            self.conns.remove(&conn);
        }

        let pending: Vec<ConnId> = self
            .handshakes
            .iter()
            .filter(|(_, s)| s.io().torrent_hash() == Some(*info_hash))
            .map(|(c, _)| *c)
            .collect();
        for conn in pending {
            if let Some(session) = self.handshakes.remove(&conn) {
                self.on_handshake_done(session.finish(Err(HandshakeError::Aborted)), now);
            }
        }
        Ok(())
    }

    pub fn set_priority(&mut self, info_hash: &InfoHash, priority: Priority) -> Result<(), Error> {
        let swarm = self
            .swarms
            .get_mut(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))?;
        swarm.set_priority(&mut self.bandwidth, priority);
        Ok(())
    }

    pub fn add_candidates(
        &mut self,
        info_hash: &InfoHash,
        peers: Vec<(SocketAddr, PeerHints)>,
        from: PeerFrom,
        now: Instant,
    ) -> Result<(), Error> {
        debug!("{info_hash:?} {} candidates from {from:?}", peers.len());
        self.swarm_or_err(info_hash)?.add_candidates(peers, from, now);
        Ok(())
    }

    pub fn peer_stats(&self, info_hash: &InfoHash, now: Instant) -> Result<Vec<PeerStats>, Error> {
        let swarm = self
            .swarms
            .get(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))?;
        Ok(swarm.peer_stats(&self.bandwidth, now))
    }

    pub fn swarm_stats(&self, info_hash: &InfoHash, now: Instant) -> Result<SwarmStats, Error> {
        let swarm = self
            .swarms
            .get(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))?;
        Ok(swarm.stats(&self.bandwidth, now))
    }

    pub fn subscribe(
        &self,
        info_hash: &InfoHash,
        f: impl FnMut(&SwarmEvent) + Send + 'static,
    ) -> Result<Subscription, Error> {
        let swarm = self
            .swarms
            .get(info_hash)
            .ok_or(Error::TorrentDoesNotExist(*info_hash))?;
        Ok(swarm.events.subscribe(f))
    }

    /// Stop every torrent.
    pub fn shutdown(&mut self, now: Instant) {
        let hashes: Vec<InfoHash> = self.swarms.keys().copied().collect();
        for h in hashes {
            if let Err(e) = self.stop_torrent(&h, now) {
                warn!("could not stop {h}: {e}");
            }
        }
        for (_, session) in self.handshakes.drain() {
            session.io().release(&mut self.bandwidth);
        }
    }

    // connections

    /// A peer dialed us. `conn` comes from [`PeerMgr::next_conn_id`].
    pub fn add_incoming(
        &mut self,
        conn: ConnId,
        addr: SocketAddr,
        transport: Box<dyn Transport>,
        now: Instant,
    ) {
        debug!("{conn} incoming connection from {addr}");
        let kind = transport.kind();
        let io = PeerIo::new(
            &mut self.bandwidth,
            Some(self.root),
            conn,
            addr,
            Direction::Inbound,
            kind,
            Some(transport),
        );
        if let Err(e) = self.begin_handshake(io, now) {
            debug!("{conn} handshake with {addr} failed to start: {e}");
        }
    }

    fn begin_handshake(&mut self, io: PeerIo, now: Instant) -> Result<(), HandshakeError> {
        let conn = io.conn();
        let mut session = HandshakeSession::new(
            io,
            self.config.encryption,
            self.keys.take(),
            now,
            self.config.handshake_timeout(),
        );

        match session.start(&self.mediator()) {
            Ok(()) => {
                self.handshakes.insert(conn, session);
                Ok(())
            }
            Err(e) => {
                self.on_handshake_done(session.finish(Err(e)), now);
                Err(e)
            }
        }
    }

    /// Dial a known address of a torrent.
    fn initiate_connection(
        &mut self,
        info_hash: InfoHash,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<ConnId, Error> {
        let swarm = self.swarm_or_err(&info_hash)?;
        let utp = swarm
            .atom(&addr)
            .is_some_and(|a| !a.utp_failed && a.hints.utp != Some(false));

        let kind = if self.config.allow_utp && utp {
            TransportKind::Utp
        } else if self.config.allow_tcp {
            TransportKind::Tcp
        } else {
            return Err(Error::NoTransport);
        };

        let conn = self.next_conn_id();
        let mut io = PeerIo::new(
            &mut self.bandwidth,
            Some(self.root),
            conn,
            addr,
            Direction::Outbound,
            kind,
            None,
        );
        io.set_torrent_hash(info_hash);
        self.begin_handshake(io, now)?;

        if let Some(atom) = self.swarms.get_mut(&info_hash).and_then(|s| s.atom_mut(&addr)) {
            atom.conn = Some(conn);
            atom.last_connection_attempt_at = Some(now);
            atom.time = Some(now);
        }
        trace!("{conn} dialing {addr} over {kind:?}");
        self.actions.push(Action::Connect { conn, addr, kind });
        Ok(conn)
    }

    /// A dial finished, hand the socket to its handshake.
    pub fn attach_transport(&mut self, conn: ConnId, transport: Box<dyn Transport>) {
        match self.handshakes.get_mut(&conn) {
            Some(session) => session.io_mut().attach(transport),
            None => debug!("{conn} connected after the handshake was dropped"),
        }
    }

    /// A dial, or the socket of a handshake, failed.
    pub fn connect_failed(&mut self, conn: ConnId, err: io::Error, now: Instant) {
        let Some(mut session) = self.handshakes.remove(&conn) else { return };

        let mut m = MediatorView { swarms: &mut self.swarms, config: &self.config };
        match session.got_error(&err, &mut m) {
            None => {
                // it goes on over another transport
                if session.needs_connect() {
                    let io = session.io();
                    self.actions.push(Action::Connect { conn, addr: io.addr(), kind: io.kind() });
                }
                self.handshakes.insert(conn, session);
            }
            Some(result) => self.on_handshake_done(session.finish(result), now),
        }
    }

    /// Parse what a handshake buffered.
    fn advance_handshake(&mut self, conn: ConnId, now: Instant) {
        let Some(session) = self.handshakes.get_mut(&conn) else { return };
        let mut m = MediatorView { swarms: &mut self.swarms, config: &self.config };

        if let Some(result) = session.can_read(&mut m) {
            if let Some(session) = self.handshakes.remove(&conn) {
                self.on_handshake_done(session.finish(result), now);
            }
        }
    }

    fn on_handshake_done(&mut self, outcome: HandshakeOutcome, now: Instant) {
        let HandshakeOutcome { io, result, peer_id, reserved, read_anything, unused_keys } = outcome;
        if let Some(keys) = unused_keys {
            self.keys.give_back(keys);
        }

        let conn = io.conn();
        let addr = io.addr();
        let incoming = io.is_incoming();
        let Some(info_hash) = io.torrent_hash() else {
            debug!("{conn} {addr} handshake failed before naming a torrent: {result:?}");
            io.release(&mut self.bandwidth);
            return;
        };
        let Some(swarm) = self.swarms.get_mut(&info_hash) else {
            io.release(&mut self.bandwidth);
            return;
        };

        let peer_id = match (result, peer_id) {
            (Ok(()), Some(id)) => id,
            (result, _) => {
                debug!("{conn} {addr} handshake failed: {result:?}");
                if let Some(atom) = swarm.atom_mut(&addr).filter(|a| a.conn == Some(conn)) {
                    atom.conn = None;
                    atom.time = Some(now);
                    atom.fail_count = atom.fail_count.saturating_add(1);
                    if !incoming && !read_anything {
                        atom.unreachable = true;
                    }
                }
                io.release(&mut self.bandwidth);
                return;
            }
        };

        let from = match swarm.atom(&addr) {
            Some(a) if !incoming => a.from_first,
            _ => PeerFrom::Incoming,
        };
        let peer_limit = swarm.peer_limit();
        let swarm_full = swarm.peer_count() >= peer_limit;
        let global_full = self.conns.len() >= self.config.peer_limit_global;
        let is_running = swarm.is_running();
        let atom = swarm.ensure_atom(addr, from, PeerHints::default(), now);

        let taken = atom.conn.is_some_and(|c| c != conn);
        if atom.banned || taken || !is_running || (incoming && (swarm_full || global_full)) {
            debug!("{conn} {addr} refused: banned {} taken {taken} full {swarm_full}", atom.banned);
            if atom.conn == Some(conn) {
                atom.conn = None;
                atom.time = Some(now);
            }
            io.release(&mut self.bandwidth);
            return;
        }

        atom.conn = Some(conn);
        atom.time = Some(now);
        atom.last_connection_at = Some(now);
        atom.piece_data_time = None;
        if !incoming {
            atom.hints.connectable = Some(true);
            atom.unreachable = false;
        }
        if io.kind() == TransportKind::Utp {
            atom.hints.utp = Some(true);
        }

        io.set_parent(&mut self.bandwidth, Some(swarm.bandwidth()));
        swarm.add_peer(io, peer_id, reserved, now);
        self.conns.insert(conn, info_hash);

        // input that came with the end of the handshake
        if let Err(e) = swarm.process_input(conn, &mut self.bandwidth, now) {
            debug!("{conn} {addr} closed: {e}");
            self.close_peer(conn, now);
        }
    }

    fn close_peer(&mut self, conn: ConnId, now: Instant) {
        let Some(info_hash) = self.conns.remove(&conn) else { return };
        if let Some(swarm) = self.swarms.get_mut(&info_hash) {
            swarm.remove_peer(conn, &mut self.bandwidth, now);
        }
    }

    fn io_error(&mut self, conn: ConnId, err: io::Error, now: Instant) {
        if self.handshakes.contains_key(&conn) {
            self.connect_failed(conn, err, now);
        } else if self.conns.contains_key(&conn) {
            debug!("{conn} socket error: {err}");
            self.close_peer(conn, now);
        }
    }

    /// A socket became readable or writable.
    pub fn on_ready(&mut self, conn: ConnId, readable: bool, writable: bool, now: Instant) {
        if let Some(session) = self.handshakes.get_mut(&conn) {
            let io = session.io_mut();
            let mut res = Ok(0);
            if writable {
                res = io.try_write(&mut self.bandwidth, usize::MAX, now);
            }
            if readable && res.is_ok() {
                res = io.try_read(&mut self.bandwidth, READ_CAP, now);
            }

            match res {
                Err(e) => self.connect_failed(conn, e, now),
                Ok(_) if readable => self.advance_handshake(conn, now),
                Ok(_) => {}
            }
            if let Some(session) = self.handshakes.get_mut(&conn) {
                session.io_mut().rearm();
            }
            return;
        }

        let Some(info_hash) = self.conns.get(&conn).copied() else { return };
        let Some(swarm) = self.swarms.get_mut(&info_hash) else { return };
        let Some(peer) = swarm.peer_mut(conn) else { return };

        let mut res = Ok(0);
        if writable {
            res = peer.io.try_write(&mut self.bandwidth, usize::MAX, now);
        }
        if readable && res.is_ok() {
            res = peer.io.try_read(&mut self.bandwidth, READ_CAP, now);
        }
        let res = res.map_err(Error::from).and_then(|_| {
            if readable {
                swarm.process_input(conn, &mut self.bandwidth, now)?;
            }
            Ok(())
        });

        match res {
            Ok(()) => {
                if writable {
                    swarm.serve_uploads(conn, now);
                }
                if let Some(peer) = swarm.peer_mut(conn) {
                    peer.io.rearm();
                }
            }
            Err(e) => {
                debug!("{conn} closed: {e}");
                self.close_peer(conn, now);
            }
        }
    }

    // timers

    /// Hand out bandwidth for the next period, then look after the
    /// connections.
    #[tracing::instrument(skip_all)]
    pub fn bandwidth_pulse(&mut self, now: Instant) {
        let expired: Vec<ConnId> = self
            .handshakes
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(c, _)| *c)
            .collect();
        for conn in expired {
            if let Some(session) = self.handshakes.remove(&conn) {
                self.on_handshake_done(session.finish(Err(HandshakeError::Timeout)), now);
            }
        }

        for swarm in self.swarms.values_mut() {
            swarm.pulse(&self.bandwidth, now);
        }

        let mut table = IoTable {
            handshakes: &mut self.handshakes,
            swarms: &mut self.swarms,
            conns: &self.conns,
            read: HashSet::new(),
            errors: Vec::new(),
        };
        for dir in Dir::ALL {
            self.bandwidth.allocate(self.root, dir, BANDWIDTH_PERIOD, &mut table, now);
        }
        let IoTable { read, errors, .. } = table;

        for (conn, err) in errors {
            self.io_error(conn, err, now);
        }
        for conn in read {
            if self.handshakes.contains_key(&conn) {
                self.advance_handshake(conn, now);
            } else if let Some(info_hash) = self.conns.get(&conn).copied() {
                let Some(swarm) = self.swarms.get_mut(&info_hash) else { continue };
                if let Err(e) = swarm.process_input(conn, &mut self.bandwidth, now) {
                    debug!("{conn} closed: {e}");
                    self.close_peer(conn, now);
                }
            }
        }

        for swarm in self.swarms.values_mut() {
            if swarm.take_rechoke_soon() {
                swarm.rechoke_uploads(&self.bandwidth, now);
            }
        }

        self.close_bad_peers(now);
        self.enforce_peer_limits(now);
        self.make_new_connections(now);
    }

    fn close_bad_peers(&mut self, now: Instant) {
        let bad: Vec<ConnId> = self
            .swarms
            .values()
            .flat_map(|s| s.peers_to_close(now))
            .collect();
        for conn in bad {
            debug!("{conn} closing, no longer useful");
            self.close_peer(conn, now);
        }
    }

    fn enforce_peer_limits(&mut self, now: Instant) {
        let over: Vec<ConnId> = self
            .swarms
            .values()
            .flat_map(|s| s.peers_over_limit())
            .collect();
        for conn in over {
            self.close_peer(conn, now);
        }

        let limit = self.config.peer_limit_global;
        if self.conns.len() <= limit {
            return;
        }
        let mut all: Vec<(Activity, ConnId)> = self
            .swarms
            .values()
            .flat_map(|s| s.peers().map(move |p| (s.activity(p), p.conn())))
            .collect();
        all.sort_unstable();
        for (_, conn) in all.into_iter().skip(limit) {
            self.close_peer(conn, now);
        }
    }

    /// Handshakes dialing out for `info_hash`.
    fn outgoing_handshakes(&self, info_hash: &InfoHash) -> usize {
        self.handshakes
            .values()
            .filter(|s| !s.io().is_incoming() && s.io().torrent_hash() == Some(*info_hash))
            .count()
    }

    fn make_new_connections(&mut self, now: Instant) {
        let max = self.config.peer_limit_global;
        let cap = max - (max as f64 * INCOMING_RESERVE) as usize;
        let in_use = self.conns.len() + self.handshakes.len();
        if in_use >= cap {
            return;
        }

        let per_pulse = (MAX_CONNECTIONS_PER_SECOND * BANDWIDTH_PERIOD.as_secs_f64()) as usize;
        let budget = per_pulse.min(cap - in_use);

        let mut rng = rand::thread_rng();
        let mut candidates = Vec::new();
        for (info_hash, swarm) in &self.swarms {
            if !swarm.is_running() || swarm.is_upload_maxed_out(&self.bandwidth, now) {
                continue;
            }
            let used = swarm.peer_count() + self.outgoing_handshakes(info_hash);
            let room = swarm.peer_limit().saturating_sub(used);
            if room == 0 {
                continue;
            }
            let mut mine = swarm.candidates(now, &mut rng);
            mine.sort_unstable();
            candidates.extend(mine.into_iter().take(room).map(|(score, addr)| (score, *info_hash, addr)));
        }
        candidates.sort_unstable();

        for (_, info_hash, addr) in candidates.into_iter().take(budget) {
            if let Err(e) = self.initiate_connection(info_hash, addr, now) {
                warn!("could not dial {addr}: {e}");
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn rechoke_pulse(&mut self, now: Instant) {
        for swarm in self.swarms.values_mut() {
            swarm.rechoke_downloads(now);
            swarm.rechoke_uploads(&self.bandwidth, now);
        }
    }

    pub fn refill_upkeep(&mut self, now: Instant) {
        for swarm in self.swarms.values_mut() {
            swarm.refill_upkeep(now);
        }
    }

    pub fn atom_pulse(&mut self, now: Instant) {
        for swarm in self.swarms.values_mut() {
            swarm.prune_atoms(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EncryptionMode, peer_io::transport::MemoryTransport,
        storage::MemoryStorage, wire::BLOCK_LEN,
    };

    const HASH: InfoHash = InfoHash([5; 20]);

    fn data() -> Vec<u8> {
        (0..6 * BLOCK_LEN).map(|i| (i % 253) as u8).collect()
    }

    fn seeder(config: Config, now: Instant) -> PeerMgr {
        let mut mgr = PeerMgr::new(config);
        mgr.add_torrent(HASH, Box::new(MemoryStorage::seeded(data(), 2 * BLOCK_LEN)), now);
        mgr.start_torrent(&HASH, now).unwrap();
        mgr
    }

    fn leecher(config: Config, now: Instant) -> PeerMgr {
        let hashes = MemoryStorage::hashes_of(&data(), 2 * BLOCK_LEN);
        let storage = MemoryStorage::new(hashes, 2 * BLOCK_LEN, 6 * BLOCK_LEN);
        let mut mgr = PeerMgr::new(config);
        mgr.add_torrent(HASH, Box::new(storage), now);
        mgr.start_torrent(&HASH, now).unwrap();
        mgr
    }

    /// The leecher dials the seeder over a memory pipe.
    fn dial(seed: &mut PeerMgr, leech: &mut PeerMgr, now: Instant) -> ConnId {
        let seed_addr: SocketAddr = "10.0.0.1:51413".parse().unwrap();
        let leech_addr: SocketAddr = "10.0.0.2:40000".parse().unwrap();

        leech
            .add_candidates(&HASH, vec![(seed_addr, PeerHints::seed())], PeerFrom::Tracker, now)
            .unwrap();
        leech.bandwidth_pulse(now);
        let actions = leech.take_actions();
        let [Action::Connect { conn, addr, kind }] = actions[..] else {
            panic!("expected one dial, got {actions:?}");
        };
        assert_eq!(addr, seed_addr);
        assert_eq!(kind, TransportKind::Tcp);

        let (a, b) = MemoryTransport::pair(TransportKind::Tcp);
        leech.attach_transport(conn, Box::new(a));
        let incoming = seed.next_conn_id();
        seed.add_incoming(incoming, leech_addr, Box::new(b), now);
        conn
    }

    fn drive(seed: &mut PeerMgr, leech: &mut PeerMgr, mut now: Instant, rounds: usize) -> Instant {
        for _ in 0..rounds {
            now += Duration::from_millis(50);
            leech.bandwidth_pulse(now);
            seed.bandwidth_pulse(now);
        }
        now
    }

    #[test]
    fn leecher_downloads_from_seeder() {
        let now = Instant::now();
        let mut seed = seeder(Config::default(), now);
        let mut leech = leecher(Config::default(), now);

        let conn = dial(&mut seed, &mut leech, now);
        let now = drive(&mut seed, &mut leech, now, 60);

        assert_eq!(leech.handshake_count(), 0);
        assert_eq!(seed.handshake_count(), 0);
        let swarm = leech.swarm(&HASH).unwrap();
        assert!(swarm.storage().is_done());
        assert_eq!(swarm.peer(conn).unwrap().peer_id, seed.peer_id());

        let stats = leech.peer_stats(&HASH, now).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].is_encrypted);
        assert!(!stats[0].is_incoming);
        assert_eq!(stats[0].from, PeerFrom::Tracker);

        let seed_stats = seed.peer_stats(&HASH, now).unwrap();
        assert!(seed_stats[0].is_incoming);
        assert_eq!(seed.swarm_stats(&HASH, now).unwrap().peer_from_count[0], 1);
    }

    #[test]
    fn plaintext_sessions_connect() {
        let now = Instant::now();
        let config = Config { encryption: EncryptionMode::PlaintextPreferred, ..Default::default() };
        let mut seed = seeder(config.clone(), now);
        let mut leech = leecher(config, now);

        dial(&mut seed, &mut leech, now);
        drive(&mut seed, &mut leech, now, 60);

        let stats = leech.peer_stats(&HASH, now).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].is_encrypted);
        assert!(leech.swarm(&HASH).unwrap().storage().is_done());
    }

    #[test]
    fn shutdown_stops_every_torrent() {
        let now = Instant::now();
        let mut seed = seeder(Config::default(), now);
        let mut leech = leecher(Config::default(), now);

        dial(&mut seed, &mut leech, now);
        let now = drive(&mut seed, &mut leech, now, 3);
        assert_eq!(leech.peer_count() + leech.handshake_count(), 1);

        leech.shutdown(now);
        assert_eq!(leech.peer_count(), 0);
        assert_eq!(leech.handshake_count(), 0);
        assert!(!leech.swarm(&HASH).unwrap().is_running());
    }

    #[test]
    fn unknown_torrent_is_refused() {
        let now = Instant::now();
        let mut seed = PeerMgr::new(Config::default());
        let mut leech = leecher(Config::default(), now);

        dial(&mut seed, &mut leech, now);
        drive(&mut seed, &mut leech, now, 20);

        assert_eq!(seed.peer_count(), 0);
        assert_eq!(seed.handshake_count(), 0);
        assert_eq!(leech.peer_count(), 0);
    }

    #[test]
    fn utp_failure_falls_back_to_tcp() {
        let now = Instant::now();
        let config = Config { allow_utp: true, ..Default::default() };
        let mut leech = leecher(config, now);
        let addr: SocketAddr = "10.0.0.1:51413".parse().unwrap();
        leech
            .add_candidates(&HASH, vec![(addr, PeerHints::default())], PeerFrom::Dht, now)
            .unwrap();

        leech.bandwidth_pulse(now);
        let actions = leech.take_actions();
        let [Action::Connect { conn, kind, .. }] = actions[..] else {
            panic!("expected one dial");
        };
        assert_eq!(kind, TransportKind::Utp);
        assert!(leech.swarm(&HASH).unwrap().atom(&addr).unwrap().is_in_use());

        leech.connect_failed(conn, io::ErrorKind::ConnectionRefused.into(), now);
        assert_eq!(
            leech.take_actions(),
            vec![Action::Connect { conn, addr, kind: TransportKind::Tcp }]
        );
        assert!(leech.swarm(&HASH).unwrap().atom(&addr).unwrap().utp_failed);
        assert_eq!(leech.handshake_count(), 1);

        // the tcp dial fails too
        leech.connect_failed(conn, io::ErrorKind::ConnectionRefused.into(), now);
        assert_eq!(leech.handshake_count(), 0);
        let atom = leech.swarm(&HASH).unwrap().atom(&addr).unwrap();
        assert!(!atom.is_in_use());
        assert!(atom.unreachable);
    }

    #[test]
    fn handshakes_time_out() {
        let now = Instant::now();
        let mut leech = leecher(Config::default(), now);
        let addr: SocketAddr = "10.0.0.1:51413".parse().unwrap();
        leech
            .add_candidates(&HASH, vec![(addr, PeerHints::default())], PeerFrom::Pex, now)
            .unwrap();
        leech.bandwidth_pulse(now);
        assert_eq!(leech.handshake_count(), 1);

        let later = now + leech.config().handshake_timeout();
        leech.bandwidth_pulse(later);
        assert_eq!(leech.handshake_count(), 0);
        assert_eq!(leech.swarm(&HASH).unwrap().atom(&addr).unwrap().fail_count, 1);
    }

    #[test]
    fn no_dials_for_stopped_torrents() {
        let now = Instant::now();
        let mut leech = leecher(Config::default(), now);
        let addr: SocketAddr = "10.0.0.1:51413".parse().unwrap();
        leech
            .add_candidates(&HASH, vec![(addr, PeerHints::default())], PeerFrom::Tracker, now)
            .unwrap();
        leech.stop_torrent(&HASH, now).unwrap();

        leech.bandwidth_pulse(now);
        assert!(leech.take_actions().is_empty());

        assert!(matches!(
            leech.start_torrent(&InfoHash([1; 20]), now),
            Err(Error::TorrentDoesNotExist(_))
        ));
        leech.remove_torrent(&HASH, now).unwrap();
        assert!(leech.swarm(&HASH).is_none());
    }
}
