//! Client configuration
//!
//! Loaded from an optional TOML file overlaid by `MESHROOM_*` environment
//! variables. The file is looked up at `$MESHROOM_CONFIG`, falling back to
//! `<config dir>/meshroom/client.toml`.

use config::{Config, ConfigError, Environment, File, FileFormat};
use meshroom_protocol::{IceServer, RoomId};
use serde::Deserialize;
use std::path::PathBuf;

use crate::network::Credentials;

const ENV_PREFIX: &str = "MESHROOM";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the rendezvous server
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// Token presented in the authenticate handshake
    #[serde(default)]
    pub token: String,
    /// Room joined by the headless client
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// Tracing filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_log_filter() -> String {
    "meshroom=debug".to_string()
}

impl ClientConfig {
    /// Load configuration from the config file (if any) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if let Some(path) = &path {
            tracing::debug!("Looking for configuration in {:?}", path);
        }

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from TOML text, ignoring the environment
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MESHROOM_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|p| p.join("meshroom").join("client.toml"))
    }

    /// STUN servers followed by TURN servers, in configuration order
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut ice_servers: Vec<IceServer> =
            self.stun_servers.iter().map(IceServer::stun).collect();

        for turn in &self.turn_servers {
            ice_servers.push(IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }

        ice_servers
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            url: self.signaling_url.clone(),
            token: self.token.clone(),
        }
    }

    pub fn room(&self) -> Option<RoomId> {
        self.room_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(RoomId::from)
    }
}
