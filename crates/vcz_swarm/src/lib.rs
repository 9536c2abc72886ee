//! The peer side of a BitTorrent client.
//!
//! This crate moves blocks between Vincenzo and the rest of the swarm. It
//! knows nothing of trackers, metainfo or disks: torrents come in as an
//! [`InfoHash`](types::InfoHash) and a [`Storage`](storage::Storage), and
//! peers as addresses from whatever discovered them.
//!
//! The pieces, bottom up:
//!
//! * [`bandwidth`]: a tree of token buckets sharing out the global rate
//!   limits between torrents and peers every half second.
//! * [`handshake`]: the plaintext BitTorrent handshake and the Message
//!   Stream Encryption negotiation in front of it.
//! * [`peer_io`]: buffered, rate limited and optionally encrypted IO over
//!   a TCP or uTP socket.
//! * [`swarm`]: per torrent choking, interest, the piece wishlist and the
//!   pool of known peers.
//! * [`peer_mgr`]: everything above, driven by timers.
//!
//! The [`engine`] owns a listener and a [`PeerMgr`](peer_mgr::PeerMgr) and
//! runs them on tokio.
//!
//! # Example
//!
//! ```no_run
//! use vcz_swarm::{
//!     config::Config,
//!     engine::{Engine, EngineMsg},
//!     storage::MemoryStorage,
//!     types::InfoHash,
//! };
//!
//! # async fn run() -> Result<(), vcz_swarm::error::Error> {
//! let mut engine = Engine::new(Config::load().await?).await?;
//! let tx = engine.tx();
//!
//! tokio::spawn(async move { engine.run().await });
//!
//! let data = vec![0u8; 1 << 20];
//! tx.send(EngineMsg::AddTorrent {
//!     info_hash: InfoHash::random(),
//!     storage: Box::new(MemoryStorage::seeded(data, 1 << 16)),
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod bitfield;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod peer_io;
pub mod peer_mgr;
pub mod storage;
pub mod swarm;
pub mod types;
pub mod wire;
