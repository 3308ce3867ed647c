use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Top-level bridge configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_display_name")]
    pub device_display_name: String,
    /// Device id reused across logins so homeservers don't accumulate stale
    /// sessions for the bridge account.
    #[serde(default = "default_device_id")]
    pub unique_device_id: String,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub homeserver: String,
    pub login: LoginMethod,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginMethod {
    Password { user: String, password: String },
    AccessToken { user_id: String, token: String },
}

#[derive(Debug, Deserialize)]
pub struct RoomConfig {
    /// Rooms sharing a name form one bridged group, across all servers.
    pub name: String,
    pub room: String,
    /// Allow media being bridged into this room.
    #[serde(default)]
    pub media_inbound: bool,
    /// Allow media being bridged out of this room.
    #[serde(default)]
    pub media_outbound: bool,
}

fn default_display_name() -> String {
    "chanbridge".into()
}

fn default_device_id() -> String {
    "CHANBRIDGE".into()
}

impl BridgeConfig {
    /// Load and validate the config file. Any failure here is fatal; the
    /// relay engine never starts on a bad config.
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("no servers configured");
        }

        let mut seen_rooms = HashSet::new();
        for server in &self.servers {
            if server.homeserver.is_empty() {
                bail!("empty homeserver URL");
            }
            match &server.login {
                LoginMethod::Password { user, password } => {
                    if user.is_empty() || password.is_empty() {
                        bail!("invalid login data for {}", server.homeserver);
                    }
                }
                LoginMethod::AccessToken { user_id, token } => {
                    if user_id.is_empty() || token.is_empty() {
                        bail!("invalid login data for {}", server.homeserver);
                    }
                }
            }
            if server.rooms.is_empty() {
                bail!("{} has no rooms configured", server.homeserver);
            }
            for room in &server.rooms {
                if room.name.is_empty() || room.room.is_empty() {
                    bail!("room entry with empty name or id on {}", server.homeserver);
                }
                // A room may belong to at most one group.
                if !seen_rooms.insert((server.homeserver.clone(), room.room.clone())) {
                    bail!(
                        "room {} on {} is listed more than once",
                        room.room,
                        server.homeserver
                    );
                }
            }
        }
        Ok(())
    }
}
