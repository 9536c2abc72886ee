//! Which blocks to ask for next.
//!
//! The wanted pieces are kept sorted by weight:
//!
//! 1. fewer blocks left to request first, so started pieces finish,
//! 2. higher priority first,
//! 3. rarer first, by how many connected peers have the piece,
//! 4. a random salt, then the index.
//!
//! The salt is picked once per piece when the list is built, ties are
//! broken the same way for the whole session.
use std::cmp::Reverse;

use rand::Rng;
use tokio::time::Instant;

use crate::{
    bitfield::{Bitfield, VczBitfield},
    storage::Storage,
    types::{ConnId, Priority},
    wire::BlockInfo,
};

use super::requests::ActiveRequests;

/// Everything the weight of a piece depends on.
pub struct PieceCtx<'a> {
    pub storage: &'a dyn Storage,
    pub requests: &'a ActiveRequests,
    /// Connected peers that have each piece.
    pub replication: &'a [u16],
}

type Weight = (usize, Reverse<Priority>, u16, u16, usize);

impl PieceCtx<'_> {
    fn weight(&self, p: &WeightedPiece) -> Weight {
        let blocks = self.storage.blocks_in_piece(p.index);
        let missing = self.storage.missing_blocks(p.index);
        let pending = self.requests.count_in_piece(p.index);

        // pieces that are all requested go last
        let left = if missing > pending { missing - pending } else { blocks + pending };

        (
            left,
            Reverse(self.storage.piece_priority(p.index)),
            self.replication.get(p.index).copied().unwrap_or(0),
            p.salt,
            p.index,
        )
    }
}

/// The peer asking for blocks.
pub struct Requester<'a> {
    pub conn: ConnId,
    pub have: &'a Bitfield,
    /// Requests already in flight to it.
    pub pending: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WeightedPiece {
    index: usize,
    salt: u16,
}

#[derive(Debug, Default)]
pub struct Wishlist {
    pieces: Vec<WeightedPiece>,
    built: bool,
    sorted: bool,
}

impl Wishlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Piece indices in request order.
    pub fn order(&self) -> impl Iterator<Item = usize> + '_ {
        self.pieces.iter().map(|p| p.index)
    }

    /// Recollect the wanted pieces that are missing, keeping the salt of
    /// the ones already known.
    pub fn rebuild(&mut self, ctx: &PieceCtx) {
        let mut rng = rand::thread_rng();
        let storage = ctx.storage;

        let mut old = std::mem::take(&mut self.pieces);
        old.sort_unstable_by_key(|p| p.index);

        self.pieces = (0..storage.piece_count())
            .filter(|&i| storage.is_wanted(i) && !storage.has_piece(i))
            .map(|index| {
                let salt = match old.binary_search_by_key(&index, |p| p.index) {
                    Ok(pos) => old[pos].salt,
                    Err(_) => rng.gen_range(0..4096),
                };
                WeightedPiece { index, salt }
            })
            .collect();

        self.built = true;
        self.sort(ctx);
    }

    /// Forget the order, the next request sorts again.
    pub fn invalidate(&mut self) {
        self.sorted = false;
    }

    /// Forget the pieces, the next request rebuilds.
    pub fn reset(&mut self) {
        self.built = false;
        self.sorted = false;
    }

    pub fn sort(&mut self, ctx: &PieceCtx) {
        self.pieces.sort_by_cached_key(|p| ctx.weight(p));
        self.sorted = true;
    }

    pub fn remove_piece(&mut self, index: usize) {
        self.pieces.retain(|p| p.index != index);
    }

    /// Move one piece whose weight changed to its place.
    pub fn resort_piece(&mut self, index: usize, ctx: &PieceCtx) {
        if !self.sorted {
            self.sort(ctx);
            return;
        }
        let Some(pos) = self.pieces.iter().position(|p| p.index == index) else {
            return;
        };

        let w = ctx.weight(&self.pieces[pos]);
        let before_ok = pos == 0 || ctx.weight(&self.pieces[pos - 1]) <= w;
        let after_ok = pos + 1 == self.pieces.len() || w <= ctx.weight(&self.pieces[pos + 1]);
        if before_ok && after_ok {
            return;
        }

        let piece = self.pieces.remove(pos);
        let to = self.pieces.partition_point(|p| ctx.weight(p) < w);
        self.pieces.insert(to, piece);
    }

    pub(crate) fn is_sorted(&self, ctx: &PieceCtx) -> bool {
        self.pieces.windows(2).all(|w| ctx.weight(&w[0]) <= ctx.weight(&w[1]))
    }

    /// Pick up to `n_wanted` blocks for `peer` and record them as
    /// requested.
    ///
    /// A block already requested from someone else is only asked again in
    /// endgame, from at most one more peer, and only when the peer keeps
    /// more requests in flight than the endgame average. `endgame` is that
    /// average, zero outside of endgame.
    #[allow(clippy::too_many_arguments)]
    pub fn next_requests(
        &mut self,
        storage: &dyn Storage,
        requests: &mut ActiveRequests,
        replication: &[u16],
        peer: &Requester,
        n_wanted: usize,
        endgame: usize,
        now: Instant,
    ) -> Vec<BlockInfo> {
        if !self.built {
            self.rebuild(&PieceCtx { storage, requests, replication });
        }
        if !self.sorted {
            self.sort(&PieceCtx { storage, requests, replication });
        }

        let mut got = Vec::with_capacity(n_wanted);
        let mut checked = 0;

        for p in &self.pieces {
            if got.len() >= n_wanted {
                break;
            }
            checked += 1;

            if !peer.have.has(p.index) {
                continue;
            }

            for b in 0..storage.blocks_in_piece(p.index) {
                if got.len() >= n_wanted {
                    break;
                }
                if storage.has_block(p.index, b) {
                    continue;
                }

                let block = storage.block_info(p.index, b);
                let count = requests.count(&block);

                if count > 0 {
                    if endgame == 0 || count > 1 || requests.has(&block, peer.conn) {
                        continue;
                    }
                    // only fast peers take a block from a slower one
                    if peer.pending + (n_wanted - got.len()) < endgame {
                        continue;
                    }
                }

                requests.add(block, peer.conn, now);
                got.push(block);
            }
        }

        // the checked pieces only got heavier, walk them back into place
        if !got.is_empty() {
            let ctx = PieceCtx { storage, requests, replication };
            for i in (0..checked).rev() {
                let w = ctx.weight(&self.pieces[i]);
                let shift = self.pieces[i + 1..].partition_point(|p| ctx.weight(p) < w);
                if shift > 0 {
                    self.pieces[i..=i + shift].rotate_left(1);
                }
            }
        }

        got
    }
}
