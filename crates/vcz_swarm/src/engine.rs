//! The engine loop.
//!
//! An [`Engine`] owns the listener and a [`PeerMgr`] and is the only task
//! touching it. Everything else talks to it with [`EngineMsg`]s: torrents
//! and candidates come in that way, sockets report readiness that way, and
//! queries are answered on a oneshot.
use std::{io, net::SocketAddr};

use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot},
    time::{interval, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Error,
    peer_io::transport::{TcpTransport, TransportKind},
    peer_mgr::{
        Action, PeerMgr, ATOM_PERIOD, BANDWIDTH_PERIOD, RECHOKE_PERIOD,
        REFILL_UPKEEP_PERIOD,
    },
    storage::Storage,
    swarm::{
        atom::{PeerFrom, PeerHints},
        events::{Subscription, SwarmEvent},
        stats::{PeerStats, SwarmStats},
    },
    types::{ConnId, InfoHash, Priority},
};

type Callback = Box<dyn FnMut(&SwarmEvent) + Send>;

/// Messages used by the [`Engine`] for internal communication.
pub enum EngineMsg {
    /// A socket is ready in the directions it was armed for.
    Ready { conn: ConnId, readable: bool, writable: bool },
    /// A dial finished.
    Connected { conn: ConnId, result: io::Result<TcpStream> },
    /// Manage a torrent and start it right away.
    AddTorrent { info_hash: InfoHash, storage: Box<dyn Storage> },
    RemoveTorrent(InfoHash),
    StartTorrent(InfoHash),
    /// Disconnect every peer of the torrent, keeping it.
    StopTorrent(InfoHash),
    /// Bandwidth band of the torrent.
    SetPriority(InfoHash, Priority),
    /// Addresses learned from a tracker, the DHT, PEX or anywhere else.
    AddCandidates {
        info_hash: InfoHash,
        peers: Vec<(SocketAddr, PeerHints)>,
        from: PeerFrom,
    },
    PeerStats {
        info_hash: InfoHash,
        recipient: oneshot::Sender<Result<Vec<PeerStats>, Error>>,
    },
    SwarmStats {
        info_hash: InfoHash,
        recipient: oneshot::Sender<Result<SwarmStats, Error>>,
    },
    /// Call `f` on every event of the torrent, for as long as the returned
    /// [`Subscription`] lives.
    Subscribe {
        info_hash: InfoHash,
        f: Callback,
        recipient: oneshot::Sender<Result<Subscription, Error>>,
    },
    /// Gracefully shutdown the engine.
    Quit,
}

pub struct Engine {
    tx: mpsc::Sender<EngineMsg>,
    rx: mpsc::Receiver<EngineMsg>,
    listener: TcpListener,
    mgr: PeerMgr,
}

impl Engine {
    /// Bind the listener of `config`.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<EngineMsg>(300);
        let listener = TcpListener::bind(config.listen_addr).await?;

        Ok(Self { tx, rx, listener, mgr: PeerMgr::new(config) })
    }

    pub fn tx(&self) -> mpsc::Sender<EngineMsg> {
        self.tx.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until [`EngineMsg::Quit`].
    #[tracing::instrument(skip_all, name = "engine")]
    pub async fn run(&mut self) -> Result<(), Error> {
        info!("listening on {}", self.local_addr()?);

        let mut bandwidth_interval = interval(BANDWIDTH_PERIOD);
        let mut rechoke_interval = interval(RECHOKE_PERIOD);
        let mut refill_interval = interval(REFILL_UPKEEP_PERIOD);
        let mut atom_interval = interval(ATOM_PERIOD);

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if !self.handle(msg) {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let conn = self.mgr.next_conn_id();
                            let transport = TcpTransport::new(stream, conn, self.tx.clone());
                            self.mgr.add_incoming(conn, addr, Box::new(transport), Instant::now());
                        }
                        Err(e) => warn!("could not accept a connection: {e}"),
                    }
                }
                _ = bandwidth_interval.tick() => {
                    self.mgr.bandwidth_pulse(Instant::now());
                }
                _ = rechoke_interval.tick() => {
                    self.mgr.rechoke_pulse(Instant::now());
                }
                _ = refill_interval.tick() => {
                    self.mgr.refill_upkeep(Instant::now());
                }
                _ = atom_interval.tick() => {
                    self.mgr.atom_pulse(Instant::now());
                }
            }
            self.dispatch_actions();
        }

        info!("shutting down");
        self.mgr.shutdown(Instant::now());
        Ok(())
    }

    /// Returns `false` when the loop should stop.
    fn handle(&mut self, msg: EngineMsg) -> bool {
        let now = Instant::now();

        match msg {
            EngineMsg::Ready { conn, readable, writable } => {
                self.mgr.on_ready(conn, readable, writable, now);
            }
            EngineMsg::Connected { conn, result } => match result {
                Ok(stream) => {
                    let transport = TcpTransport::new(stream, conn, self.tx.clone());
                    self.mgr.attach_transport(conn, Box::new(transport));
                }
                Err(e) => {
                    debug!("{conn} connect failed: {e}");
                    self.mgr.connect_failed(conn, e, now);
                }
            },
            EngineMsg::AddTorrent { info_hash, storage } => {
                if !self.mgr.add_torrent(info_hash, storage, now) {
                    warn!("torrent {info_hash} was already added");
                }
                if let Err(e) = self.mgr.start_torrent(&info_hash, now) {
                    warn!("{e}");
                }
            }
            EngineMsg::RemoveTorrent(info_hash) => {
                if let Err(e) = self.mgr.remove_torrent(&info_hash, now) {
                    warn!("{e}");
                }
            }
            EngineMsg::StartTorrent(info_hash) => {
                if let Err(e) = self.mgr.start_torrent(&info_hash, now) {
                    warn!("{e}");
                }
            }
            EngineMsg::StopTorrent(info_hash) => {
                if let Err(e) = self.mgr.stop_torrent(&info_hash, now) {
                    warn!("{e}");
                }
            }
            EngineMsg::SetPriority(info_hash, priority) => {
                if let Err(e) = self.mgr.set_priority(&info_hash, priority) {
                    warn!("{e}");
                }
            }
            EngineMsg::AddCandidates { info_hash, peers, from } => {
                if let Err(e) = self.mgr.add_candidates(&info_hash, peers, from, now) {
                    warn!("{e}");
                }
            }
            EngineMsg::PeerStats { info_hash, recipient } => {
                let _ = recipient.send(self.mgr.peer_stats(&info_hash, now));
            }
            EngineMsg::SwarmStats { info_hash, recipient } => {
                let _ = recipient.send(self.mgr.swarm_stats(&info_hash, now));
            }
            EngineMsg::Subscribe { info_hash, f, recipient } => {
                let _ = recipient.send(self.mgr.subscribe(&info_hash, f));
            }
            EngineMsg::Quit => return false,
        }
        true
    }

    /// Carry out the dials the manager asked for.
    fn dispatch_actions(&mut self) {
        loop {
            let actions = self.mgr.take_actions();
            if actions.is_empty() {
                return;
            }

            for action in actions {
                match action {
                    Action::Connect { conn, addr, kind: TransportKind::Tcp } => {
                        let tx = self.tx.clone();
                        let limit = self.mgr.config().handshake_timeout();

                        spawn(async move {
                            let result = match timeout(limit, TcpStream::connect(addr)).await {
                                Ok(r) => r,
                                Err(_) => Err(io::ErrorKind::TimedOut.into()),
                            };
                            let _ = tx.send(EngineMsg::Connected { conn, result }).await;
                        });
                    }
                    // there is no datagram socket to dial from
                    Action::Connect { conn, kind: TransportKind::Utp, .. } => {
                        let err = io::ErrorKind::ConnectionRefused.into();
                        self.mgr.connect_failed(conn, err, Instant::now());
                    }
                }
            }
        }
    }
}
