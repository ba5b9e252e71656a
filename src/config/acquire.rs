//! Worker-side acquisition configuration.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::affinity::AffinityLadder;
use crate::core::AppResult;

/// Poll timeout used when none is configured.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

const ENV_LADDER: &str = "JOB_ACQUIRE_AFFINITY_LADDER";
const ENV_ACCEPT_ANY: &str = "JOB_ACQUIRE_ACCEPT_ANY";
const ENV_POLL_TIMEOUT: &str = "JOB_ACQUIRE_POLL_TIMEOUT_MS";

/// How a worker picks jobs across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Preferred affinities, most preferred first. Empty means take any job.
    #[serde(default)]
    pub affinity_ladder: Vec<String>,
    /// Accept a job outside the ladder when nothing better is held.
    #[serde(default)]
    pub accept_any_affinity: bool,
    /// How long an empty server is left alone before being asked again.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

const fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            affinity_ladder: Vec::new(),
            accept_any_affinity: false,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl AcquireConfig {
    /// Config with the given ladder and defaults elsewhere.
    pub fn with_ladder<I, S>(ladder: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            affinity_ladder: ladder.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be greater than 0".into());
        }
        AffinityLadder::new(self.affinity_ladder.iter().cloned()).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Poll timeout as a duration.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let cfg: Self = serde_json::from_str(json).context("failed to parse acquire config")?;
        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("acquire config invalid")?;
        Ok(cfg)
    }

    /// Load from the process environment, reading a `.env` file first if one
    /// exists. Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Fails on unparsable values or an invalid result.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(ladder) = lookup(ENV_LADDER) {
            cfg.affinity_ladder = ladder
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(flag) = lookup(ENV_ACCEPT_ANY) {
            cfg.accept_any_affinity = parse_flag(&flag)
                .with_context(|| format!("{ENV_ACCEPT_ANY} is not a boolean: `{flag}`"))?;
        }
        if let Some(timeout) = lookup(ENV_POLL_TIMEOUT) {
            cfg.poll_timeout_ms = timeout
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{ENV_POLL_TIMEOUT} is not a number: `{timeout}`"))?;
        }
        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("acquire config from environment invalid")?;
        Ok(cfg)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
