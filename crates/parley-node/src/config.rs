//! Node configuration loaded from environment variables.
//!
//! Everything has a default so `parley-node` runs a loopback call with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::DEFAULT_STUN_URL;
use parley_shared::{ConversationId, PartyId};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// SQLite file both parties signal through.
    /// Env: `PARLEY_DB_PATH`
    /// Default: `parley.db` in the platform data directory
    pub db_path: Option<PathBuf>,

    /// Env: `PARLEY_CONVERSATION`
    /// Default: `loopback`
    pub conversation: ConversationId,

    /// Env: `PARLEY_CALLER`
    /// Default: `caller`
    pub caller: PartyId,

    /// Env: `PARLEY_CALLEE`
    /// Default: `callee`
    pub callee: PartyId,

    /// Env: `PARLEY_STUN_URL` (empty disables STUN)
    /// Default: `stun:stun.l.google.com:19302`
    pub stun_url: Option<String>,

    /// How long the caller stays in the call before hanging up.
    /// Env: `PARLEY_HOLD_SECS`
    /// Default: `5`
    pub hold: Duration,

    /// Whether each party's synthetic devices include a camera.
    /// Env: `PARLEY_CALLER_CAMERA`, `PARLEY_CALLEE_CAMERA` (true/false)
    /// Default: `true`
    pub caller_camera: bool,
    pub callee_camera: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            conversation: ConversationId::new("loopback"),
            caller: PartyId::new("caller"),
            callee: PartyId::new("callee"),
            stun_url: Some(DEFAULT_STUN_URL.to_string()),
            hold: Duration::from_secs(5),
            caller_camera: true,
            callee_camera: true,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = var("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(id) = var("PARLEY_CONVERSATION") {
            config.conversation = ConversationId::new(id);
        }

        if let Some(id) = var("PARLEY_CALLER") {
            config.caller = PartyId::new(id);
        }

        if let Some(id) = var("PARLEY_CALLEE") {
            config.callee = PartyId::new(id);
        }

        if config.caller == config.callee {
            tracing::warn!(party = %config.caller, "PARLEY_CALLER and PARLEY_CALLEE are equal, using defaults");
            let defaults = Self::default();
            config.caller = defaults.caller;
            config.callee = defaults.callee;
        }

        if let Some(url) = var("PARLEY_STUN_URL") {
            config.stun_url = if url.is_empty() { None } else { Some(url) };
        }

        if let Some(val) = var("PARLEY_HOLD_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.hold = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %val, "Invalid PARLEY_HOLD_SECS, using default"),
            }
        }

        if let Some(val) = var("PARLEY_CALLER_CAMERA") {
            config.caller_camera = val != "false" && val != "0";
        }

        if let Some(val) = var("PARLEY_CALLEE_CAMERA") {
            config.callee_camera = val != "false" && val != "0";
        }

        config
    }
}
