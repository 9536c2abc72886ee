use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    engine::EngineMsg, handshake::HandshakeError, types::InfoHash,
    wire::BlockInfo,
};

impl From<mpsc::error::SendError<EngineMsg>> for Error {
    fn from(value: mpsc::error::SendError<EngineMsg>) -> Self {
        Self::SendEngineError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Could not read the configuration file: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("Could not write the configuration file: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Your system does not have a valid home directory")]
    HomeInvalid,

    #[error("Could not open the folder: `{0}`")]
    FolderOpenError(String),

    #[error("The handshake with the peer failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("The response received from the peer is wrong")]
    MessageResponse,

    #[error("The peer sent a message of {0} bytes, larger than allowed")]
    MessageTooLarge(usize),

    #[error("The peer closed the connection")]
    PeerClosedSocket,

    #[error("The block {0:?} does not fit in the torrent")]
    InvalidBlock(BlockInfo),

    #[error("The torrent {0} is not managed by this engine")]
    TorrentDoesNotExist(InfoHash),

    #[error("Neither TCP nor uTP are allowed, no transport is usable")]
    NoTransport,

    #[error("Could not send message to the engine: {0}")]
    SendEngineError(String),

    #[error("Could not receive message from oneshot")]
    ReceiveError(#[from] oneshot::error::RecvError),
}
