//! Typed observers for what happens in a swarm.
//!
//! Storage and announce accounting subscribe a closure to an [`Event`] and
//! keep the returned [`Subscription`]; dropping it unsubscribes.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use crate::{types::{ConnId, InfoHash}, wire::BlockInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A requested block was written to storage.
    BlockCompleted { info_hash: InfoHash, block: BlockInfo, conn: ConnId },
    PieceCompleted { info_hash: InfoHash, piece: usize },
    /// A piece failed the hash check and was thrown away.
    PieceFailed { info_hash: InfoHash, piece: usize },
    GotBitfield { info_hash: InfoHash, conn: ConnId },
    GotHave { info_hash: InfoHash, conn: ConnId, piece: usize },
    GotChoke { info_hash: InfoHash, conn: ConnId },
    GotReject { info_hash: InfoHash, conn: ConnId, block: BlockInfo },
    PeerConnected { info_hash: InfoHash, conn: ConnId, addr: SocketAddr },
    PeerDisconnected { info_hash: InfoHash, conn: ConnId, addr: SocketAddr },
}

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Subscribers<T> {
    next_id: u64,
    list: Vec<(u64, Callback<T>)>,
}

fn lock<T>(m: &Mutex<Subscribers<T>>) -> MutexGuard<'_, Subscribers<T>> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A list of closures called, in subscription order, on every emit.
pub struct Event<T> {
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                list: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("subscribers", &self.len()).finish()
    }
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "the closure is unsubscribed when the subscription drops"]
    pub fn subscribe(&self, f: impl FnMut(&T) + Send + 'static) -> Subscription {
        let mut subs = lock(&self.subscribers);
        let id = subs.next_id;
        subs.next_id += 1;
        subs.list.push((id, Box::new(f)));

        let weak: Weak<Mutex<Subscribers<T>>> = Arc::downgrade(&self.subscribers);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(subs) = weak.upgrade() {
                    lock(&subs).list.retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    /// Call every subscriber. A subscriber must not subscribe to or emit on
    /// the same event from inside its closure.
    pub fn emit(&self, value: &T) {
        for (_, f) in lock(&self.subscribers).list.iter_mut() {
            f(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.subscribers).list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a closure subscribed while alive.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Keep the closure subscribed for as long as the event lives.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_subscription_unsubscribes() {
        let event = Event::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let first = event.subscribe(move |v| s.lock().unwrap().push(*v));
        let s = seen.clone();
        let second = event.subscribe(move |v| s.lock().unwrap().push(*v * 10));
        assert_eq!(event.len(), 2);

        event.emit(&1);
        drop(first);
        event.emit(&2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 10, 20]);

        second.detach();
        assert_eq!(event.len(), 1);
    }

    #[test]
    fn subscription_outlives_the_event() {
        let event = Event::<u32>::new();
        let sub = event.subscribe(|_| {});
        drop(event);
        drop(sub);
    }
}
