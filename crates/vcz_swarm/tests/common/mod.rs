//! Engines running for real on loopback sockets.
//!
//! Each test spawns one [`Engine`] per client and talks to it only through
//! [`EngineMsg`], the same way a daemon would.
use std::{net::SocketAddr, time::Duration};

use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use vcz_swarm::{
    config::{Config, EncryptionMode},
    engine::{Engine, EngineMsg},
    error::Error,
    storage::MemoryStorage,
    swarm::{
        atom::{PeerFrom, PeerHints},
        events::{Subscription, SwarmEvent},
        stats::PeerStats,
    },
    types::InfoHash,
};

pub const PIECE_LEN: usize = 1 << 15;

pub struct Client {
    pub tx: mpsc::Sender<EngineMsg>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<Result<(), Error>>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// 5 pieces, the last one short.
pub fn torrent_data() -> Vec<u8> {
    (0..PIECE_LEN * 4 + 1000).map(|i| (i % 251) as u8).collect()
}

pub async fn client(encryption: EncryptionMode) -> Result<Client, Error> {
    let config = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        encryption,
        handshake_timeout_secs: 5,
        ..Default::default()
    };
    let mut engine = Engine::new(config).await?;
    let tx = engine.tx();
    let addr = engine.local_addr()?;
    let handle = spawn(async move { engine.run().await });

    Ok(Client { tx, addr, handle })
}

/// A seeder and a leecher of the same torrent, the leecher knowing where
/// the seeder is.
pub async fn setup_pair(
    seed_mode: EncryptionMode,
    leech_mode: EncryptionMode,
) -> Result<(InfoHash, Client, Client), Error> {
    let info_hash = InfoHash::random();
    let data = torrent_data();
    let hashes = MemoryStorage::hashes_of(&data, PIECE_LEN);
    let total_len = data.len();

    let seeder = client(seed_mode).await?;
    let leecher = client(leech_mode).await?;

    seeder
        .tx
        .send(EngineMsg::AddTorrent {
            info_hash,
            storage: Box::new(MemoryStorage::seeded(data, PIECE_LEN)),
        })
        .await?;
    leecher
        .tx
        .send(EngineMsg::AddTorrent {
            info_hash,
            storage: Box::new(MemoryStorage::new(hashes, PIECE_LEN, total_len)),
        })
        .await?;
    leecher
        .tx
        .send(EngineMsg::AddCandidates {
            info_hash,
            peers: vec![(seeder.addr, PeerHints::seed())],
            from: PeerFrom::Tracker,
        })
        .await?;

    Ok((info_hash, seeder, leecher))
}

/// Forward every event of the torrent to a channel.
pub async fn events(
    client: &Client,
    info_hash: InfoHash,
) -> Result<(Subscription, mpsc::UnboundedReceiver<SwarmEvent>), Error> {
    let (etx, erx) = mpsc::unbounded_channel();
    let (otx, orx) = oneshot::channel();

    client
        .tx
        .send(EngineMsg::Subscribe {
            info_hash,
            f: Box::new(move |e: &SwarmEvent| {
                let _ = etx.send(e.clone());
            }),
            recipient: otx,
        })
        .await?;

    Ok((orx.await??, erx))
}

pub async fn peer_stats(client: &Client, info_hash: InfoHash) -> Result<Vec<PeerStats>, Error> {
    let (otx, orx) = oneshot::channel();
    client
        .tx
        .send(EngineMsg::PeerStats { info_hash, recipient: otx })
        .await?;
    orx.await?
}

/// Wait until `n` distinct pieces completed.
pub async fn wait_pieces(
    rx: &mut mpsc::UnboundedReceiver<SwarmEvent>,
    n: usize,
) -> Vec<usize> {
    let mut done = Vec::new();
    let wait = async {
        while let Some(e) = rx.recv().await {
            if let SwarmEvent::PieceCompleted { piece, .. } = e {
                if !done.contains(&piece) {
                    done.push(piece);
                }
                if done.len() == n {
                    break;
                }
            }
        }
    };
    let _ = timeout(Duration::from_secs(30), wait).await;
    done
}

pub async fn quit(client: Client) -> Result<(), Error> {
    client.tx.send(EngineMsg::Quit).await?;
    client.handle.await.unwrap()
}
