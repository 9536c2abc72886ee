//! Choosing which known addresses to dial.
use std::time::Duration;

use tokio::time::Instant;

use crate::types::Priority;

use super::atom::PeerAtom;

/// New connections started per second, at most.
pub const MAX_CONNECTIONS_PER_SECOND: f64 = 12.0;

/// A torrent started this recently gets its peers dialed first.
pub const RECENTLY_STARTED: Duration = Duration::from_secs(120);

/// Share of the global peer limit left to peers that dial us.
pub const INCOMING_RESERVE: f64 = 0.05;

/// Worth dialing now.
pub fn is_candidate(atom: &PeerAtom, torrent_is_seed: bool, now: Instant) -> bool {
    if torrent_is_seed && atom.is_seed() {
        return false;
    }
    if atom.is_in_use() || atom.banned {
        return false;
    }
    !atom.is_waiting_to_reconnect(now)
}

fn push_bits(key: u64, width: u32, value: u64) -> u64 {
    (key << width) | (value & ((1 << width) - 1))
}

/// The torrent side of a candidate score.
#[derive(Debug, Clone, Copy)]
pub struct TorrentTraits {
    pub priority: Priority,
    pub started_at: Instant,
    pub is_seed: bool,
}

/// Lower is better. Packs, from the most significant bits down: a failed
/// last attempt, how long ago we last tried, the torrent priority, whether
/// the torrent just started, whether we are seeding it, the peer being
/// known to accept connections, the peer being a seed, the trust of the
/// source and a salt.
pub fn candidate_score(atom: &PeerAtom, torrent: &TorrentTraits, salt: u8, now: Instant) -> u64 {
    let failed = match (atom.last_connection_at, atom.last_connection_attempt_at) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(ok), Some(tried)) => ok < tried,
    };
    let mut score = push_bits(0, 1, failed as u64);

    // the longest untried goes first, never tried is the longest
    let tried = atom
        .last_connection_attempt_at
        .map(|t| u32::MAX as u64 - now.saturating_duration_since(t).as_secs().min(u32::MAX as u64))
        .unwrap_or(0);
    score = push_bits(score, 32, tried);

    let priority = match torrent.priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    };
    score = push_bits(score, 4, priority);

    let recent = now.saturating_duration_since(torrent.started_at) < RECENTLY_STARTED;
    score = push_bits(score, 1, !recent as u64);
    score = push_bits(score, 1, torrent.is_seed as u64);
    score = push_bits(score, 1, (atom.hints.connectable != Some(true)) as u64);
    score = push_bits(score, 1, atom.is_seed() as u64);
    score = push_bits(score, 4, atom.from_best.index() as u64);
    push_bits(score, 8, salt as u64)
}
