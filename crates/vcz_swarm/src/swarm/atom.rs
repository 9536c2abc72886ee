//! What we remember about a peer address, connected or not.
use std::{cmp::Ordering, net::SocketAddr, time::Duration};

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::ConnId;

/// Where a peer address came from. The order is the trust order, the
/// first variants being the most trusted.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PeerFrom {
    /// The peer connected to us.
    Incoming,
    /// Local peer discovery.
    Lpd,
    Tracker,
    Dht,
    Pex,
    /// Saved from a previous session.
    Resume,
    /// Extension protocol handshake.
    Ltep,
}

impl PeerFrom {
    pub const COUNT: usize = 7;

    pub fn index(self) -> usize {
        self as usize
    }

    /// How long an address from this source is worth keeping.
    pub fn shelf_life(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        Duration::from_secs(match self {
            PeerFrom::Incoming | PeerFrom::Ltep => 6 * HOUR,
            PeerFrom::Tracker | PeerFrom::Dht => 3 * HOUR,
            PeerFrom::Pex => 2 * HOUR,
            PeerFrom::Resume => HOUR,
            PeerFrom::Lpd => 10 * 60,
        })
    }
}

/// What a discovery source knows about a peer. Unknown is `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerHints {
    pub seed: Option<bool>,
    pub connectable: Option<bool>,
    pub utp: Option<bool>,
    pub encryption: Option<bool>,
}

impl PeerHints {
    pub fn seed() -> Self {
        Self { seed: Some(true), ..Default::default() }
    }
}

/// Shortest wait before reconnecting to a peer that sent us data.
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PeerAtom {
    pub addr: SocketAddr,
    pub from_first: PeerFrom,
    /// Most trusted source the address was seen from.
    pub from_best: PeerFrom,
    pub hints: PeerHints,
    /// The last uTP connect to it failed.
    pub utp_failed: bool,
    /// Connections that ended without any piece data.
    pub fail_count: u16,
    pub banned: bool,
    /// The last connect attempt never read a byte.
    pub unreachable: bool,
    /// Last change of the connection state.
    pub time: Option<Instant>,
    pub piece_data_time: Option<Instant>,
    pub last_connection_attempt_at: Option<Instant>,
    pub last_connection_at: Option<Instant>,
    /// Kept at least until then, later only if the pool has room.
    pub shelf_date: Instant,
    /// Connection or handshake using this address.
    pub conn: Option<ConnId>,
}

fn since(t: Option<Instant>, now: Instant) -> Duration {
    t.map(|t| now.saturating_duration_since(t)).unwrap_or(Duration::MAX)
}

impl PeerAtom {
    pub fn new(addr: SocketAddr, from: PeerFrom, hints: PeerHints, now: Instant) -> Self {
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..10 * 60));
        Self {
            addr,
            from_first: from,
            from_best: from,
            hints,
            utp_failed: false,
            fail_count: 0,
            banned: false,
            unreachable: false,
            time: None,
            piece_data_time: None,
            last_connection_attempt_at: None,
            last_connection_at: None,
            shelf_date: now + from.shelf_life() + jitter,
            conn: None,
        }
    }

    /// The same address was learned again.
    pub fn merge(&mut self, from: PeerFrom, hints: PeerHints) {
        self.from_best = self.from_best.min(from);

        let PeerHints { seed, connectable, utp, encryption } = hints;
        self.hints.seed = seed.or(self.hints.seed);
        self.hints.connectable = connectable.or(self.hints.connectable);
        self.hints.utp = utp.or(self.hints.utp);
        self.hints.encryption = encryption.or(self.hints.encryption);
    }

    pub fn is_seed(&self) -> bool {
        self.hints.seed == Some(true)
    }

    pub fn is_in_use(&self) -> bool {
        self.conn.is_some()
    }

    /// How long to wait after the last state change before dialing again.
    pub fn reconnect_interval(&self, now: Instant) -> Duration {
        // a peer that was sending data gets another chance quickly
        if !self.unreachable && since(self.piece_data_time, now) <= MIN_RECONNECT_INTERVAL * 2 {
            return MIN_RECONNECT_INTERVAL;
        }

        let mut step = self.fail_count as usize;
        if self.unreachable {
            step += 2;
        }

        let secs = match step {
            0 => 0,
            1 => 10,
            2 => 60 * 2,
            3 => 60 * 15,
            4 => 60 * 30,
            5 => 60 * 60,
            _ => 60 * 120,
        };
        Duration::from_secs(secs)
    }

    /// Connected, or tried, recently enough to wait.
    pub fn is_waiting_to_reconnect(&self, now: Instant) -> bool {
        since(self.time, now) < self.reconnect_interval(now)
    }

    /// A connection to the atom ended.
    pub fn on_closed(&mut self, now: Instant) {
        // only connections that moved data clear the slate
        if self.piece_data_time.is_some() {
            self.fail_count = 0;
        } else {
            self.fail_count = self.fail_count.saturating_add(1);
        }
        self.time = Some(now);
        self.conn = None;
    }

    /// The ordering used to pick what survives a pool prune, best first.
    ///
    /// Piece data from the last hour matters most, then the shelf date.
    pub fn cmp_by_shelf_date(&self, other: &Self, now: Instant) -> Ordering {
        const CUTOFF: Duration = Duration::from_secs(60 * 60);
        let recent = |a: &Self| a.piece_data_time.filter(|t| since(Some(*t), now) <= CUTOFF);

        recent(other)
            .cmp(&recent(self))
            .then_with(|| other.shelf_date.cmp(&self.shelf_date))
    }
}
