//! Choke and interest decisions, as pure functions over snapshots of the
//! peers so the swarm can apply them afterwards.
use std::{cmp::Ordering, time::Duration};

use rand::{seq::SliceRandom, Rng};

use crate::types::ConnId;

/// A connection this young weighs more in the optimistic lottery.
pub const NEW_PEER_AGE: Duration = Duration::from_secs(45);

/// Never be interested in fewer peers than this.
pub const MIN_INTERESTING_PEERS: usize = 5;

/// One peer competing for an upload slot.
#[derive(Debug, Clone)]
pub struct ChokeData {
    pub conn: ConnId,
    pub is_interested: bool,
    pub was_choked: bool,
    pub is_new: bool,
    /// Bytes per second, the download rate while leeching and the upload
    /// rate while seeding.
    pub rate: u64,
    pub salt: u32,
    pub is_choked: bool,
}

impl ChokeData {
    /// Faster first, then the ones already unchoked, then random.
    fn cmp_rank(&self, other: &Self) -> Ordering {
        other
            .rate
            .cmp(&self.rate)
            .then_with(|| self.was_choked.cmp(&other.was_choked))
            .then_with(|| self.salt.cmp(&other.salt))
    }
}

/// Unchoke the best interested peers until `slots` of them are unchoked.
/// Uninterested peers passed on the way stay choked. A maxed out upload
/// keeps every peer as it was. Returns how many peers were considered.
pub fn unchoke_best(choke: &mut [ChokeData], slots: usize, is_maxed_out: bool) -> usize {
    choke.sort_by(ChokeData::cmp_rank);

    let mut checked = 0;
    let mut unchoked = 0;

    for c in choke.iter_mut() {
        if unchoked >= slots {
            break;
        }
        checked += 1;
        if is_maxed_out {
            c.is_choked = c.was_choked;
            unchoked += usize::from(!c.is_choked && c.is_interested);
        } else if c.is_interested {
            c.is_choked = false;
            unchoked += 1;
        }
    }
    checked
}

/// Draw the optimistic unchoke among the interested peers left choked by
/// [`unchoke_best`], new peers having `new_peer_weight` tickets.
pub fn pick_optimistic<R: Rng>(
    choke: &[ChokeData],
    checked: usize,
    new_peer_weight: u32,
    rng: &mut R,
) -> Option<usize> {
    let mut pool = Vec::new();
    for (i, c) in choke.iter().enumerate().skip(checked) {
        if !c.is_interested {
            continue;
        }
        let tickets = if c.is_new { new_peer_weight.max(1) } else { 1 };
        pool.extend(std::iter::repeat(i).take(tickets as usize));
    }
    pool.choose(rng).copied()
}

/// How well a peer answers our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RechokeState {
    Good,
    Untested,
    Bad,
}

impl RechokeState {
    /// From the blocks it sent and the requests we had to cancel recently.
    pub fn from_history(blocks: u32, cancels: u32) -> Self {
        match (blocks, cancels) {
            (0, 0) => RechokeState::Untested,
            (_, 0) => RechokeState::Good,
            (0, _) => RechokeState::Bad,
            (b, c) if c * 10 < b => RechokeState::Good,
            _ => RechokeState::Bad,
        }
    }
}

/// How many peers to be interested in.
///
/// Cancels mean we hit our download cap, so the count shrinks by the
/// cancel rate, then grows back for as long as nothing was cancelled,
/// staying between [`MIN_INTERESTING_PEERS`] and `max_peers`.
pub fn max_interesting(
    blocks: u32,
    cancels: u32,
    interested_count: usize,
    previous_max: usize,
    since_last_cancel: Option<Duration>,
    max_peers: usize,
) -> usize {
    let mut n = 0usize;

    if cancels > 0 {
        let cancel_rate = cancels as f64 / (cancels + blocks) as f64;
        let mult = 1.0 - cancel_rate.min(0.5);
        n = (interested_count as f64 * mult) as usize;
    }

    let since = since_last_cancel.unwrap_or(Duration::MAX);
    if !since.is_zero() {
        const MAX_INCREASE: f64 = 15.0;
        let max_history = super::stats::CANCEL_HISTORY * 2;
        let mult = since.min(max_history).as_secs_f64() / max_history.as_secs_f64();
        n = previous_max + (MAX_INCREASE * mult) as usize;
    }

    n.clamp(MIN_INTERESTING_PEERS, max_peers.max(MIN_INTERESTING_PEERS))
}
