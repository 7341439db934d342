//! Server and backend tunables. These deserialise straight from the server's
//! configuration file; everything carries a sane default.

use serde::Deserialize;

/// Checkpoint the store after every successful commit. The thresholds are
/// handed to the store as-is; zero for both means an unconditional
/// checkpoint each call. Best effort - a failed checkpoint never affects
/// the reply.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub kbyte: u32,
    pub min: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy { kbyte: 0, min: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Global default for operational-attribute stamping.
    pub lastmod: bool,
    /// Where to point clients when no backend holds the target.
    pub default_referral: Vec<String>,
    /// Transient storage errors drive restarts up to this many attempts.
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            lastmod: true,
            default_referral: vec!["ldap://root.cadastre.dev/".to_string()],
            max_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// The naming context this backend holds, e.g. `dc=example,dc=com`.
    pub suffix: String,
    /// Set on a replica: only this identity may write, everyone else is
    /// referred away.
    pub update_ndn: Option<String>,
    /// Per-backend override of the global lastmod setting.
    pub lastmod: Option<bool>,
    pub checkpoint: Option<CheckpointPolicy>,
}
