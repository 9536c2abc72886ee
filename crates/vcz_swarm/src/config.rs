use directories::ProjectDirs;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, File, OpenOptions};
use tracing::warn;

use crate::error::Error;

/// How the handshake treats message stream encryption.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// Reject any peer that doesn't encrypt.
    Required,
    /// Try encryption first, but accept plaintext peers.
    #[default]
    Preferred,
    /// Try plaintext first, accept encrypted peers.
    PlaintextPreferred,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub encryption: EncryptionMode,
    pub peer_limit_global: usize,
    pub peer_limit_per_torrent: usize,
    pub upload_slots_per_torrent: usize,
    /// Bytes per second, `None` means unlimited.
    pub speed_limit_up: Option<u64>,
    /// Bytes per second, `None` means unlimited.
    pub speed_limit_down: Option<u64>,
    pub allow_tcp: bool,
    pub allow_utp: bool,
    pub allow_dht: bool,
    pub allow_pex: bool,
    /// How many rechoke passes an optimistic unchoke survives.
    pub optimistic_unchoke_multiplier: u32,
    /// Weight of newly connected peers in the optimistic unchoke lottery.
    pub new_peer_weight: u32,
    pub handshake_timeout_secs: u64,
    pub key_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 51413)),
            encryption: EncryptionMode::default(),
            peer_limit_global: 200,
            peer_limit_per_torrent: 50,
            upload_slots_per_torrent: 8,
            speed_limit_up: None,
            speed_limit_down: None,
            allow_tcp: true,
            allow_utp: false,
            allow_dht: true,
            allow_pex: true,
            optimistic_unchoke_multiplier: 4,
            new_peer_weight: 3,
            handshake_timeout_secs: 30,
            key_pool_capacity: 20,
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }

    /// Returns the configuration fs File and it's path,
    ///
    /// If it doesn't exist, we try to create a default configuration file
    /// at the user's config folder, which we get from their environmental
    /// variables.
    ///
    /// # Errors
    ///
    /// This fn can fail if the program does not have access to any path, or
    /// file.
    pub async fn config_file() -> Result<(File, PathBuf), Error> {
        let dotfile =
            ProjectDirs::from("", "", "Vincenzo").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();

        if !config_path.exists() {
            create_dir_all(&config_path).await.map_err(|_| {
                Error::FolderOpenError(config_path.display().to_string())
            })?;
        }

        config_path.push("swarm.toml");

        // try to open the config file, and create one
        // if it doesnt exist. This will only fail if we dont
        // have permission to read or write to this path.
        let mut config_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config_path)
            .await?;

        let mut dst = String::new();
        config_file.read_to_string(&mut dst).await?;

        // an empty or broken file gets the defaults written over it
        if toml::from_str::<Config>(&dst).is_err() {
            warn!("invalid config at {config_path:?}, writing the defaults");
            let config_str = toml::to_string(&Config::default())?;
            config_file.set_len(0).await?;
            config_file.write_all(config_str.as_bytes()).await?;
        }

        let config_file =
            OpenOptions::new().read(true).open(&config_path).await?;

        Ok((config_file, config_path))
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist, it tries to create the file
    /// with the default configurations.
    pub async fn load() -> Result<Self, Error> {
        let (mut file, _p) = Self::config_file().await?;

        let mut config_str = String::new();
        file.read_to_string(&mut config_str).await?;

        Self::from_toml_str(&config_str)
    }
}
