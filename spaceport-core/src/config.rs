//! Client configuration for Spaceport.
//!
//! Settings are layered with `figment`: built-in defaults, the user and
//! workspace `config.toml` files, `SPACEPORT_*` environment variables, then
//! explicit overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default hub API base used for space status, host lookup and JWT issuance.
pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

/// Origin of the local development server. Page-injected configuration is
/// ignored when the page itself is served from here.
pub const LOCAL_DEV_ORIGIN: &str = "http://localhost:9876";

/// Settings that shape how a client talks to remote apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bearer token attached to every request when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_token: Option<String>,
    /// Base URL of the hub API.
    pub hub_url: String,
    /// Interval between space status polls while a space wakes up.
    pub wake_poll_interval_ms: u64,
    /// Origin that disables page-injected configuration.
    pub local_dev_origin: String,
    /// TCP connect timeout for HTTP requests.
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hf_token: None,
            hub_url: DEFAULT_HUB_URL.to_string(),
            wake_poll_interval_ms: 1000,
            local_dev_origin: LOCAL_DEV_ORIGIN.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.hub_url.trim().is_empty() {
            problems.push("hub_url must not be empty".to_string());
        } else if !self.hub_url.starts_with("http://") && !self.hub_url.starts_with("https://") {
            problems.push(format!("hub_url '{}' is not an http(s) URL", self.hub_url));
        }
        if self.wake_poll_interval_ms == 0 {
            problems.push("wake_poll_interval_ms must be greater than zero".to_string());
        }
        if self.connect_timeout_secs == 0 {
            problems.push("connect_timeout_secs must be greater than zero".to_string());
        }
        problems
    }

    /// Hub base URL without a trailing slash.
    pub fn hub_base(&self) -> &str {
        self.hub_url.trim_end_matches('/')
    }
}

/// Config files that exist for `workspace`, lowest priority first: the
/// user file under the platform config dir, then `<workspace>/.spaceport/config.toml`.
pub fn config_files(workspace: Option<&Path>) -> Vec<PathBuf> {
    let user = directories::ProjectDirs::from("dev", "spaceport", "spaceport")
        .map(|dirs| dirs.config_dir().join("config.toml"));
    let local = workspace.map(|ws| ws.join(".spaceport").join("config.toml"));
    user.into_iter()
        .chain(local)
        .filter(|path| path.exists())
        .collect()
}

/// Build client settings from defaults, [`config_files`], `SPACEPORT_*`
/// variables (nested keys split on `__`) and `overrides`, later layers
/// winning. The result is validated.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ClientConfig>,
) -> Result<ClientConfig, ConfigError> {
    let layered = config_files(workspace).iter().fold(
        Figment::from(Serialized::defaults(ClientConfig::default())),
        |figment, path| figment.merge(Toml::file(path)),
    );
    let layered = layered.merge(Env::prefixed("SPACEPORT_").split("__"));
    let layered = match overrides {
        Some(overrides) => layered.merge(Serialized::defaults(overrides)),
        None => layered,
    };

    let config: ClientConfig = layered.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    let problems = config.validate();
    if !problems.is_empty() {
        return Err(ConfigError::Invalid {
            message: problems.join("; "),
        });
    }
    Ok(config)
}
