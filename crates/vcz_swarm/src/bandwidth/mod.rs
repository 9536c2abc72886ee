//! Hierarchical token bucket.
//!
//! Nodes live in an arena owned by [`Bandwidth`] and are addressed by a
//! [`NodeId`] carrying a generation, so a handle to a removed node never
//! aliases a newer one. The usual shape is a session root, one child per
//! torrent and one grandchild per peer connection. Each period
//! [`Bandwidth::allocate`] refills the limited nodes and hands out the budget
//! to the connections in small increments, round robin, by priority band.
pub mod rate;

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::types::{ConnId, Dir, Priority};

use self::rate::{RateControl, HISTORY};

/// Bytes a connection may move on each round of the round robin, the
/// payload of a full ethernet frame carrying TCP.
pub const PHASE_INCREMENT: usize = 3000;

/// Stable handle of a node inside [`Bandwidth`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Band {
    is_limited: bool,
    honor_parent_limit: bool,
    desired_speed: u64,
    bytes_left: u64,
    raw: RateControl,
    piece: RateControl,
}

impl Default for Band {
    fn default() -> Self {
        Self {
            is_limited: false,
            honor_parent_limit: true,
            desired_speed: 0,
            bytes_left: 0,
            raw: RateControl::new(),
            piece: RateControl::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    band: [Band; 2],
    priority: Priority,
    conn: Option<ConnId>,
}

impl Node {
    /// Nodes start at the lowest priority, the effective priority of a
    /// connection is the highest one set on its path to the root.
    fn new() -> Self {
        Self { priority: Priority::Low, ..Default::default() }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The side of the connections that [`Bandwidth::allocate`] drives.
pub trait IoPool {
    /// Move at most `max` bytes through `conn` in `dir`, returning how many
    /// bytes actually moved.
    fn flush(
        &mut self,
        bandwidth: &mut Bandwidth,
        conn: ConnId,
        dir: Dir,
        max: usize,
        now: Instant,
    ) -> usize;

    /// Write out the protocol messages queued ahead of any payload.
    fn flush_protocol(
        &mut self,
        bandwidth: &mut Bandwidth,
        conn: ConnId,
        now: Instant,
    );

    /// Toggle readiness notifications of `conn` for `dir`.
    fn set_enabled(&mut self, conn: ConnId, dir: Dir, enabled: bool);
}

/// Arena of bandwidth nodes.
#[derive(Debug, Default)]
pub struct Bandwidth {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Bandwidth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node under `parent`, or a new root.
    pub fn add_node(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(Node::new());
                NodeId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, node: Some(Node::new()) });
                NodeId { index, generation: 0 }
            }
        };
        self.set_parent(id, parent);
        id
    }

    /// Destroy a node. It is removed from its parent and its children are
    /// left without one.
    pub fn remove(&mut self, id: NodeId) {
        if !self.contains(id) {
            return;
        }
        self.set_parent(id, None);

        let children = self
            .node_mut(id)
            .map(|n| std::mem::take(&mut n.children))
            .unwrap_or_default();
        for child in children {
            if let Some(c) = self.node_mut(child) {
                c.parent = None;
            }
        }

        let slot = &mut self.slots[id.index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or_default()
    }

    /// Move `id` under `parent`. A move that would create a cycle is
    /// ignored.
    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        if let Some(p) = parent {
            if !self.contains(p) || self.is_ancestor(id, p) {
                warn!("refusing to move bandwidth node {id:?} under {p:?}");
                return;
            }
        }

        let old = self.node(id).and_then(|n| n.parent);
        if let Some(old) = old {
            if let Some(o) = self.node_mut(old) {
                if let Some(pos) = o.children.iter().position(|c| *c == id) {
                    o.children.swap_remove(pos);
                }
            }
        }

        if let Some(n) = self.node_mut(id) {
            n.parent = parent;
        }
        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            p.children.push(id);
        }
    }

    /// `ancestor` is `id` itself or one of the nodes above `id`.
    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.parent(id) {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    pub fn set_conn(&mut self, id: NodeId, conn: Option<ConnId>) {
        if let Some(n) = self.node_mut(id) {
            n.conn = conn;
        }
    }

    pub fn set_priority(&mut self, id: NodeId, priority: Priority) {
        if let Some(n) = self.node_mut(id) {
            n.priority = priority;
        }
    }

    pub fn set_limited(&mut self, id: NodeId, dir: Dir, is_limited: bool) {
        if let Some(b) = self.band_mut(id, dir) {
            b.is_limited = is_limited;
        }
    }

    /// Set the limit of `id` in bytes per second, `None` lifts it.
    pub fn set_limit(&mut self, id: NodeId, dir: Dir, limit: Option<u64>) {
        if let Some(b) = self.band_mut(id, dir) {
            b.is_limited = limit.is_some();
            if let Some(limit) = limit {
                b.desired_speed = limit;
            }
        }
    }

    pub fn set_desired_speed(&mut self, id: NodeId, dir: Dir, bps: u64) {
        if let Some(b) = self.band_mut(id, dir) {
            b.desired_speed = bps;
        }
    }

    pub fn set_honor_parent_limit(&mut self, id: NodeId, dir: Dir, honor: bool) {
        if let Some(b) = self.band_mut(id, dir) {
            b.honor_parent_limit = honor;
        }
    }

    pub fn is_limited(&self, id: NodeId, dir: Dir) -> bool {
        self.band(id, dir).is_some_and(|b| b.is_limited)
    }

    pub fn desired_speed(&self, id: NodeId, dir: Dir) -> u64 {
        self.band(id, dir).map(|b| b.desired_speed).unwrap_or(0)
    }

    pub fn bytes_left(&self, id: NodeId, dir: Dir) -> u64 {
        self.band(id, dir).map(|b| b.bytes_left).unwrap_or(0)
    }

    /// Measured speed of everything that went through `id`, bytes/s.
    pub fn raw_speed(&self, id: NodeId, dir: Dir, now: Instant) -> u64 {
        self.band(id, dir).map(|b| b.raw.speed(now, HISTORY)).unwrap_or(0)
    }

    /// Measured speed of payload only, bytes/s.
    pub fn piece_speed(&self, id: NodeId, dir: Dir, now: Instant) -> u64 {
        self.band(id, dir).map(|b| b.piece.speed(now, HISTORY)).unwrap_or(0)
    }

    /// A limited node whose payload speed already reached its limit.
    pub fn is_maxed_out(&self, id: NodeId, dir: Dir, now: Instant) -> bool {
        match self.band(id, dir) {
            Some(b) if b.is_limited => {
                b.piece.speed(now, HISTORY) >= b.desired_speed
            }
            _ => false,
        }
    }

    /// How many of `bytes` may be moved by `id` right now.
    pub fn clamp(&self, id: NodeId, dir: Dir, bytes: usize, now: Instant) -> usize {
        let mut bytes = bytes;
        let mut cur = Some(id);

        while let Some(id) = cur {
            let Some(node) = self.node(id) else { break };
            let band = &node.band[dir.index()];

            if band.is_limited {
                bytes = bytes.min(band.bytes_left as usize);

                // slow down a bit when close to the limit, the history
                // lags behind what was already handed out
                let current = band.raw.speed(now, HISTORY) as f64;
                let desired = band.desired_speed as f64;
                let r = if desired >= 1.0 { current / desired } else { 0.0 };

                if r > 1.0 {
                    bytes = 0;
                } else if r > 0.9 {
                    bytes = (bytes as f64 * 0.8) as usize;
                } else if r > 0.8 {
                    bytes = (bytes as f64 * 0.9) as usize;
                }
            }

            if !band.honor_parent_limit || bytes == 0 {
                break;
            }
            cur = node.parent;
        }

        bytes
    }

    /// Record `bytes` moved by `id`, attributed to every node up to the
    /// root.
    pub fn notify_consumed(
        &mut self,
        id: NodeId,
        dir: Dir,
        bytes: usize,
        is_payload: bool,
        now: Instant,
    ) {
        let mut cur = Some(id);

        while let Some(id) = cur {
            let Some(node) = self.node_mut(id) else { break };
            let band = &mut node.band[dir.index()];

            if band.is_limited && is_payload {
                band.bytes_left = band.bytes_left.saturating_sub(bytes as u64);
            }
            band.raw.bytes_used(now, bytes as u64);
            if is_payload {
                band.piece.bytes_used(now, bytes as u64);
            }

            cur = node.parent;
        }
    }

    /// Refill the tree under `root` for a period and let every attached
    /// connection flush its share.
    pub fn allocate<P: IoPool>(
        &mut self,
        root: NodeId,
        dir: Dir,
        period: Duration,
        pool: &mut P,
        now: Instant,
    ) {
        let mut peers = Vec::new();
        self.refill(root, dir, period, &mut peers);

        let mut high = Vec::new();
        let mut normal = Vec::new();
        let mut low = Vec::new();

        for &(conn, _, priority) in &peers {
            pool.flush_protocol(self, conn, now);

            match priority {
                Priority::High => {
                    high.push(conn);
                    normal.push(conn);
                    low.push(conn);
                }
                Priority::Normal => {
                    normal.push(conn);
                    low.push(conn);
                }
                Priority::Low => low.push(conn),
            }
        }

        trace!(
            "allocate {dir:?} high {} normal {} low {}",
            high.len(),
            normal.len(),
            low.len()
        );

        self.phase_one(&mut high, dir, pool, now);
        self.phase_one(&mut normal, dir, pool, now);
        self.phase_one(&mut low, dir, pool, now);

        // connections that still have budget keep listening, the others
        // wait for the next period
        for &(conn, node, _) in &peers {
            let enabled = self.clamp(node, dir, 1024, now) > 0;
            pool.set_enabled(conn, dir, enabled);
        }
    }

    fn refill(
        &mut self,
        root: NodeId,
        dir: Dir,
        period: Duration,
        peers: &mut Vec<(ConnId, NodeId, Priority)>,
    ) {
        let period_ms = period.as_millis() as u64;
        let mut stack = vec![(root, Priority::Low)];

        while let Some((id, parent_priority)) = stack.pop() {
            let Some(node) = self.node_mut(id) else { continue };
            let priority = parent_priority.max(node.priority);
            let band = &mut node.band[dir.index()];

            if band.is_limited {
                band.bytes_left = band.desired_speed * period_ms / 1000;
            }
            if let Some(conn) = node.conn {
                peers.push((conn, id, priority));
            }
            for &child in node.children.iter().rev() {
                stack.push((child, priority));
            }
        }
    }

    /// Round robin in random order until no connection can use a full
    /// increment.
    fn phase_one<P: IoPool>(
        &mut self,
        conns: &mut [ConnId],
        dir: Dir,
        pool: &mut P,
        now: Instant,
    ) {
        let mut rng = rand::thread_rng();
        let mut n = conns.len();

        while n > 0 {
            let i = rng.gen_range(0..n);
            let used = pool.flush(self, conns[i], dir, PHASE_INCREMENT, now);

            if used != PHASE_INCREMENT {
                conns.swap(i, n - 1);
                n -= 1;
            }
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    fn band(&self, id: NodeId, dir: Dir) -> Option<&Band> {
        self.node(id).map(|n| &n.band[dir.index()])
    }

    fn band_mut(&mut self, id: NodeId, dir: Dir) -> Option<&mut Band> {
        self.node_mut(id).map(|n| &mut n.band[dir.index()])
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;

    /// Connections with a fixed amount of data queued.
    #[derive(Default)]
    struct MockPool {
        nodes: HashMap<ConnId, NodeId>,
        pending: HashMap<ConnId, usize>,
        sent: HashMap<ConnId, usize>,
        offers: HashMap<ConnId, usize>,
        enabled: HashMap<ConnId, bool>,
    }

    impl MockPool {
        fn add(&mut self, bw: &mut Bandwidth, parent: NodeId, id: u64, data: usize) -> NodeId {
            let conn = ConnId(id);
            let node = bw.add_node(Some(parent));
            bw.set_conn(node, Some(conn));
            self.nodes.insert(conn, node);
            self.pending.insert(conn, data);
            node
        }

        fn total_sent(&self) -> usize {
            self.sent.values().sum()
        }
    }

    impl IoPool for MockPool {
        fn flush(
            &mut self,
            bw: &mut Bandwidth,
            conn: ConnId,
            dir: Dir,
            max: usize,
            now: Instant,
        ) -> usize {
            *self.offers.entry(conn).or_default() += 1;
            let node = self.nodes[&conn];
            let pending = self.pending[&conn];
            let n = bw.clamp(node, dir, max.min(pending), now);
            bw.notify_consumed(node, dir, n, true, now);
            *self.pending.get_mut(&conn).unwrap() -= n;
            *self.sent.entry(conn).or_default() += n;
            n
        }

        fn flush_protocol(&mut self, _: &mut Bandwidth, _: ConnId, _: Instant) {}

        fn set_enabled(&mut self, conn: ConnId, _dir: Dir, enabled: bool) {
            self.enabled.insert(conn, enabled);
        }
    }

    const PERIOD: Duration = Duration::from_millis(500);

    #[test]
    fn limited_node_conserves_budget() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        bw.set_limit(root, Dir::Up, Some(1000));

        let mut pool = MockPool::default();
        pool.add(&mut bw, root, 1, 10_000);
        pool.add(&mut bw, root, 2, 10_000);

        let now = Instant::now();
        bw.allocate(root, Dir::Up, PERIOD, &mut pool, now);

        assert_eq!(pool.total_sent(), 500);
        assert_eq!(bw.bytes_left(root, Dir::Up), 0);
        assert!(!pool.enabled[&ConnId(1)]);
        assert!(!pool.enabled[&ConnId(2)]);
    }

    #[test]
    fn unlimited_node_never_restricts() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        let torrent = bw.add_node(Some(root));
        let peer = bw.add_node(Some(torrent));
        let now = Instant::now();

        assert_eq!(bw.clamp(peer, Dir::Down, 12345, now), 12345);
        bw.notify_consumed(peer, Dir::Down, 5000, true, now);
        assert_eq!(bw.clamp(peer, Dir::Down, 12345, now), 12345);
        assert_eq!(bw.raw_speed(root, Dir::Down, now), 2500);
    }

    #[test]
    fn clamp_is_idempotent_and_monotone() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        bw.set_limit(root, Dir::Down, Some(100_000));
        let peer = bw.add_node(Some(root));

        let mut pool = MockPool::default();
        let now = Instant::now();
        bw.allocate(root, Dir::Down, PERIOD, &mut pool, now);

        let a = bw.clamp(peer, Dir::Down, 80_000, now);
        let b = bw.clamp(peer, Dir::Down, 80_000, now);
        assert_eq!(a, b);
        assert_eq!(a, 50_000);

        let mut last = a;
        for _ in 0..5 {
            bw.notify_consumed(peer, Dir::Down, 1000, true, now);
            let c = bw.clamp(peer, Dir::Down, 80_000, now);
            assert!(c <= last);
            last = c;
        }
        assert_eq!(bw.bytes_left(root, Dir::Down), 45_000);
    }

    #[test]
    fn overhead_does_not_spend_the_budget() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        bw.set_limit(root, Dir::Up, Some(2000));
        let mut pool = MockPool::default();
        let now = Instant::now();
        bw.allocate(root, Dir::Up, PERIOD, &mut pool, now);

        bw.notify_consumed(root, Dir::Up, 100, false, now);
        assert_eq!(bw.bytes_left(root, Dir::Up), 1000);
        assert_eq!(bw.piece_speed(root, Dir::Up, now), 0);
        assert_eq!(bw.raw_speed(root, Dir::Up, now), 50);
    }

    #[test]
    fn two_peers_share_a_limited_parent() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        // 100 bytes per 500ms period
        bw.set_limit(root, Dir::Up, Some(200));

        let mut pool = MockPool::default();
        pool.add(&mut bw, root, 1, 40);
        pool.add(&mut bw, root, 2, 40);

        let now = Instant::now();
        bw.allocate(root, Dir::Up, PERIOD, &mut pool, now);

        assert_eq!(pool.sent[&ConnId(1)], 40);
        assert_eq!(pool.sent[&ConnId(2)], 40);
        assert!(pool.total_sent() <= 100);

        // with more data than budget both are offered and the sum holds
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        bw.set_limit(root, Dir::Up, Some(200));
        let mut pool = MockPool::default();
        pool.add(&mut bw, root, 1, 10_000);
        pool.add(&mut bw, root, 2, 10_000);
        bw.allocate(root, Dir::Up, PERIOD, &mut pool, now);

        assert!(pool.offers[&ConnId(1)] >= 1);
        assert!(pool.offers[&ConnId(2)] >= 1);
        assert_eq!(pool.total_sent(), 100);
    }

    #[test]
    fn high_priority_is_served_in_every_band() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        let hi = bw.add_node(Some(root));
        bw.set_priority(hi, Priority::High);
        let lo = bw.add_node(Some(root));
        bw.set_priority(lo, Priority::Low);

        let mut pool = MockPool::default();
        pool.add(&mut bw, hi, 1, 100);
        pool.add(&mut bw, lo, 2, 100);

        bw.allocate(root, Dir::Up, PERIOD, &mut pool, Instant::now());

        assert_eq!(pool.offers[&ConnId(1)], 3);
        assert_eq!(pool.offers[&ConnId(2)], 1);
        assert!(pool.enabled[&ConnId(1)]);
    }

    #[test]
    fn child_ignoring_parent_limit() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        bw.set_limit(root, Dir::Up, Some(0));
        let peer = bw.add_node(Some(root));
        let now = Instant::now();

        assert_eq!(bw.clamp(peer, Dir::Up, 10, now), 0);
        bw.set_honor_parent_limit(peer, Dir::Up, false);
        assert_eq!(bw.clamp(peer, Dir::Up, 10, now), 10);
    }

    #[test]
    fn removed_nodes_leave_the_tree() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        let a = bw.add_node(Some(root));
        let b = bw.add_node(Some(root));
        let a_child = bw.add_node(Some(a));

        bw.remove(a);
        assert_eq!(bw.children(root), &[b]);
        assert_eq!(bw.parent(a_child), None);
        assert!(!bw.contains(a));

        // the slot is reused but the stale handle stays dead
        let c = bw.add_node(Some(root));
        assert!(bw.contains(c));
        assert!(!bw.contains(a));
        assert_eq!(bw.len(), 4);
    }

    #[test]
    fn reparenting_moves_children() {
        let mut bw = Bandwidth::new();
        let root = bw.add_node(None);
        let t1 = bw.add_node(Some(root));
        let t2 = bw.add_node(Some(root));
        let peer = bw.add_node(Some(t1));

        bw.set_parent(peer, Some(t2));
        assert!(bw.children(t1).is_empty());
        assert_eq!(bw.children(t2), &[peer]);
        assert_eq!(bw.parent(peer), Some(t2));
    }
}
