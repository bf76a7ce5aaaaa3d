//! Configuration surface consumed by the dispatcher.
//!
//! Owned by excluded config-loading code in a full deployment; here it can be
//! built from the environment or deserialized from TOML/JSON. Unset or invalid
//! values fall back to defaults, except the keyword table source whose load
//! failure is fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which fallback responder to wire in: the deterministic mock or a live provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    #[default]
    Mock,
    Live,
}

impl AdapterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterMode::Mock => "mock",
            AdapterMode::Live => "live",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().eq_ignore_ascii_case("live") {
            true => AdapterMode::Live,
            false => AdapterMode::Mock,
        }
    }
}

fn default_table_source() -> PathBuf {
    PathBuf::from("keywords.toml")
}

fn default_fallback_timeout_ms() -> u64 {
    10_000
}

fn default_cancellation_grace_ms() -> u64 {
    300
}

/// Runtime configuration for the voice turn handler.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | PATTER_KEYWORD_TABLE | keywords.toml | Keyword table file (TOML or JSON). |
/// | PATTER_FALLBACK_TIMEOUT_MS | 10000 | Overall fallback-path budget per turn. |
/// | PATTER_CANCELLATION_GRACE_MS | 300 | Wind-down budget for a cancelled responder. |
/// | PATTER_ADAPTER_MODE | mock | "mock" \| "live" responder wiring. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_table_source")]
    pub keyword_table_source: PathBuf,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    #[serde(default = "default_cancellation_grace_ms")]
    pub cancellation_grace_ms: u64,
    #[serde(default)]
    pub adapter_mode: AdapterMode,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            keyword_table_source: default_table_source(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            cancellation_grace_ms: default_cancellation_grace_ms(),
            adapter_mode: AdapterMode::default(),
        }
    }
}

impl VoiceConfig {
    /// Load from environment. Unset or unparsable => defaults (see struct docs).
    pub fn from_env() -> Self {
        Self {
            keyword_table_source: std::env::var("PATTER_KEYWORD_TABLE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_table_source()),
            fallback_timeout_ms: env_u64("PATTER_FALLBACK_TIMEOUT_MS", default_fallback_timeout_ms()),
            cancellation_grace_ms: env_u64(
                "PATTER_CANCELLATION_GRACE_MS",
                default_cancellation_grace_ms(),
            ),
            adapter_mode: std::env::var("PATTER_ADAPTER_MODE")
                .map(|v| AdapterMode::from_str(&v))
                .unwrap_or_default(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
