use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::{types::ConnId, wire::BlockInfo};

/// Blocks we asked peers for and are still waiting on.
///
/// Keyed by block, with a reverse index by peer. A block has at most one
/// entry per peer.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    blocks: BTreeMap<BlockInfo, Vec<(ConnId, Instant)>>,
    by_peer: HashMap<ConnId, BTreeSet<BlockInfo>>,
    len: usize,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every (block, peer) pair.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns false if the peer already has the block requested.
    pub fn add(&mut self, block: BlockInfo, conn: ConnId, now: Instant) -> bool {
        let peers = self.blocks.entry(block).or_default();
        if peers.iter().any(|(c, _)| *c == conn) {
            return false;
        }
        peers.push((conn, now));
        self.by_peer.entry(conn).or_default().insert(block);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, block: &BlockInfo, conn: ConnId) -> bool {
        let Some(peers) = self.blocks.get_mut(block) else { return false };
        let Some(pos) = peers.iter().position(|(c, _)| *c == conn) else {
            return false;
        };

        peers.swap_remove(pos);
        if peers.is_empty() {
            self.blocks.remove(block);
        }
        if let Some(set) = self.by_peer.get_mut(&conn) {
            set.remove(block);
            if set.is_empty() {
                self.by_peer.remove(&conn);
            }
        }
        self.len -= 1;
        true
    }

    /// Drop every request of the block, returning who had it.
    pub fn remove_block(&mut self, block: &BlockInfo) -> Vec<ConnId> {
        let peers: Vec<ConnId> = self.peers(block).collect();
        for &conn in &peers {
            self.remove(block, conn);
        }
        peers
    }

    /// Drop every request sent to `conn`, returning the blocks.
    pub fn remove_peer(&mut self, conn: ConnId) -> Vec<BlockInfo> {
        let blocks: Vec<BlockInfo> =
            self.by_peer.get(&conn).into_iter().flatten().copied().collect();
        for block in &blocks {
            self.remove(block, conn);
        }
        blocks
    }

    pub fn has(&self, block: &BlockInfo, conn: ConnId) -> bool {
        self.by_peer.get(&conn).is_some_and(|set| set.contains(block))
    }

    /// How many peers the block is requested from.
    pub fn count(&self, block: &BlockInfo) -> usize {
        self.blocks.get(block).map_or(0, Vec::len)
    }

    pub fn peers(&self, block: &BlockInfo) -> impl Iterator<Item = ConnId> + '_ {
        self.blocks.get(block).into_iter().flatten().map(|(c, _)| *c)
    }

    pub fn count_for_peer(&self, conn: ConnId) -> usize {
        self.by_peer.get(&conn).map_or(0, BTreeSet::len)
    }

    /// Requests for blocks of `piece`, duplicates included.
    pub fn count_in_piece(&self, piece: usize) -> usize {
        let from = BlockInfo::new(piece, 0, 0);
        let to = BlockInfo::new(piece + 1, 0, 0);
        self.blocks.range(from..to).map(|(_, peers)| peers.len()).sum()
    }

    /// Requests sent at or before `cutoff`.
    pub fn sent_before(&self, cutoff: Instant) -> Vec<(BlockInfo, ConnId)> {
        self.blocks
            .iter()
            .flat_map(|(block, peers)| {
                peers
                    .iter()
                    .filter(move |(_, sent)| *sent <= cutoff)
                    .map(move |(conn, _)| (*block, *conn))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.by_peer.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::wire::BLOCK_LEN;

    fn block(piece: usize, i: usize) -> BlockInfo {
        BlockInfo::new(piece, i * BLOCK_LEN, BLOCK_LEN)
    }

    #[test]
    fn add_and_remove() {
        let now = Instant::now();
        let mut r = ActiveRequests::new();

        assert!(r.add(block(0, 0), ConnId(1), now));
        assert!(!r.add(block(0, 0), ConnId(1), now));
        assert!(r.add(block(0, 0), ConnId(2), now));
        assert!(r.add(block(0, 1), ConnId(1), now));
        assert!(r.add(block(1, 0), ConnId(1), now));

        assert_eq!(r.len(), 4);
        assert_eq!(r.count(&block(0, 0)), 2);
        assert_eq!(r.count_in_piece(0), 3);
        assert_eq!(r.count_in_piece(1), 1);
        assert_eq!(r.count_for_peer(ConnId(1)), 3);
        assert!(r.has(&block(0, 1), ConnId(1)));
        assert!(!r.has(&block(0, 1), ConnId(2)));

        assert!(r.remove(&block(0, 0), ConnId(2)));
        assert!(!r.remove(&block(0, 0), ConnId(2)));
        assert_eq!(r.count(&block(0, 0)), 1);

        let mut blocks = r.remove_peer(ConnId(1));
        blocks.sort();
        assert_eq!(blocks, vec![block(0, 0), block(0, 1), block(1, 0)]);
        assert!(r.is_empty());
        assert_eq!(r.count_for_peer(ConnId(1)), 0);
    }

    #[test]
    fn remove_block_returns_every_peer() {
        let now = Instant::now();
        let mut r = ActiveRequests::new();
        r.add(block(2, 0), ConnId(1), now);
        r.add(block(2, 0), ConnId(5), now);

        let mut peers = r.remove_block(&block(2, 0));
        peers.sort();
        assert_eq!(peers, vec![ConnId(1), ConnId(5)]);
        assert!(r.is_empty());
        assert_eq!(r.count_for_peer(ConnId(5)), 0);
    }

    #[test]
    fn old_requests() {
        let now = Instant::now();
        let mut r = ActiveRequests::new();
        r.add(block(0, 0), ConnId(1), now);
        r.add(block(0, 1), ConnId(1), now + Duration::from_secs(10));

        assert_eq!(r.sent_before(now), vec![(block(0, 0), ConnId(1))]);
        assert_eq!(r.sent_before(now + Duration::from_secs(10)).len(), 2);
    }
}
