use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::types::ConnId;

use super::atom::PeerFrom;

/// How far back the block and cancel counters of a peer look.
pub const CANCEL_HISTORY: Duration = Duration::from_secs(60);

/// Event counter over a sliding window, in one second buckets.
#[derive(Debug, Clone, Default)]
pub struct History {
    buckets: VecDeque<(Instant, u32)>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, now: Instant, n: u32) {
        match self.buckets.back_mut() {
            Some((t, count)) if now.saturating_duration_since(*t) < Duration::from_secs(1) => {
                *count += n;
            }
            _ => self.buckets.push_back((now, n)),
        }
        while let Some((t, _)) = self.buckets.front() {
            if now.saturating_duration_since(*t) > CANCEL_HISTORY * 2 {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events in the last `window`.
    pub fn count(&self, now: Instant, window: Duration) -> u32 {
        self.buckets
            .iter()
            .rev()
            .take_while(|(t, _)| now.saturating_duration_since(*t) < window)
            .map(|(_, n)| n)
            .sum()
    }
}

/// A snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStats {
    #[serde(skip)]
    pub conn: ConnId,
    pub addr: SocketAddr,
    /// Human readable client name. Always the hex peer id for now.
    pub client: String,
    pub from: PeerFrom,
    pub progress: f32,
    pub is_utp: bool,
    pub is_encrypted: bool,
    pub is_incoming: bool,
    /// Bytes per second of block data.
    pub rate_to_peer: u64,
    pub rate_to_client: u64,
    pub peer_is_choked: bool,
    pub peer_is_interested: bool,
    pub client_is_choked: bool,
    pub client_is_interested: bool,
    pub is_downloading_from: bool,
    pub is_uploading_to: bool,
    pub is_seed: bool,
    pub blocks_to_peer: u32,
    pub blocks_to_client: u32,
    pub cancels_to_peer: u32,
    pub cancels_to_client: u32,
    pub pending_reqs_to_peer: usize,
    pub pending_reqs_to_client: usize,
    /// One letter per notable state, in the usual order: `T` uTP,
    /// `O` optimistic, `D`/`d` downloading or would, `U`/`u` uploading or
    /// would, `K` unchoked us but we are not interested, `?` we unchoked
    /// an uninterested peer, `E` encrypted, `H` from DHT, `X` from PEX, `I`
    /// incoming.
    pub flags: String,
}

impl PeerStats {
    pub(crate) fn flag_str(&self, is_optimistic: bool) -> String {
        let mut s = String::new();
        if self.is_utp {
            s.push('T');
        }
        if is_optimistic {
            s.push('O');
        }
        if self.is_downloading_from {
            s.push('D');
        } else if self.client_is_interested {
            s.push('d');
        }
        if self.is_uploading_to {
            s.push('U');
        } else if self.peer_is_interested {
            s.push('u');
        }
        if !self.client_is_choked && !self.client_is_interested {
            s.push('K');
        }
        if !self.peer_is_choked && !self.peer_is_interested {
            s.push('?');
        }
        if self.is_encrypted {
            s.push('E');
        }
        match self.from {
            PeerFrom::Dht => s.push('H'),
            PeerFrom::Pex => s.push('X'),
            _ => {}
        }
        if self.is_incoming {
            s.push('I');
        }
        s
    }
}

/// Counters of one swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwarmStats {
    pub peer_count: usize,
    /// Connected peers by where we first heard of them.
    pub peer_from_count: [usize; PeerFrom::COUNT],
    /// Peers we download from, and upload to.
    pub active_peer_count: [usize; 2],
    pub known_peers: usize,
    pub pending_requests: usize,
    pub is_endgame: bool,
}
