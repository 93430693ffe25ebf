// =============================================================================
// Runtime Configuration — environment-driven settings with atomic save
// =============================================================================
//
// Most knobs are read once from the environment at startup (the usual
// twelve-factor pattern). The subset that operators may want to flip without
// a restart — trading mode, watched symbols — is additionally persisted to a
// JSON file using an atomic tmp + rename write, so a crash mid-save can never
// corrupt the file on disk.
//
// Every field carries a default so that an older config file missing newer
// fields still loads cleanly.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountType, TradingMode};

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["NSE_EQ|11536".to_string(), "NSE_INDEX|Nifty 50".to_string()]
}

fn default_ws_max_symbols_per_client() -> u32 {
    50
}

fn default_ws_max_buffered_bytes() -> usize {
    1_048_576
}

fn default_ws_max_message_size_bytes() -> usize {
    65_536
}

fn default_min_safety_count() -> u32 {
    1
}

fn default_liquidation_max_steps() -> u32 {
    25
}

fn default_stale_price_max_ms() -> i64 {
    10_000
}

fn default_snapshot_ttl_secs() -> u64 {
    5
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Cash or Margin account type used when no override is specified.
    #[serde(default)]
    pub default_account_type: AccountType,

    /// Always true for this engine — kept as a field (rather than hardcoded)
    /// because the control surface can toggle it off to hard-stop new orders.
    #[serde(default = "default_true")]
    pub paper_trading_mode: bool,

    /// Instruments the supervisor subscribes to at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Maximum distinct instruments a single fanout client may subscribe to.
    #[serde(default = "default_ws_max_symbols_per_client")]
    pub ws_max_symbols_per_client: u32,

    /// Per-connection outbound buffer budget before a client is evicted as a
    /// slow consumer.
    #[serde(default = "default_ws_max_buffered_bytes")]
    pub ws_max_buffered_bytes: usize,

    /// Maximum accepted inbound websocket frame size.
    #[serde(default = "default_ws_max_message_size_bytes")]
    pub ws_max_message_size_bytes: usize,

    /// Whether the fanout server requires a signed bearer token to connect.
    #[serde(default = "default_true")]
    pub ws_auth_required: bool,

    /// Minimum number of healthy upstream connections the supervisor insists
    /// on before leaving the degraded state.
    #[serde(default = "default_min_safety_count")]
    pub min_safety_count: u32,

    /// Bound on the number of positions force-closed by a single liquidation
    /// sweep, so one pathological tick cannot stall the engine.
    #[serde(default = "default_liquidation_max_steps")]
    pub liquidation_max_steps: u32,

    /// Maximum tick age, in milliseconds, before a price is considered stale
    /// for pretrade checks.
    #[serde(default = "default_stale_price_max_ms")]
    pub stale_price_max_ms: i64,

    /// Snapshot cache TTL, before jitter is applied.
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::default(),
            default_account_type: AccountType::default(),
            paper_trading_mode: true,
            symbols: default_symbols(),
            ws_max_symbols_per_client: default_ws_max_symbols_per_client(),
            ws_max_buffered_bytes: default_ws_max_buffered_bytes(),
            ws_max_message_size_bytes: default_ws_max_message_size_bytes(),
            ws_auth_required: true,
            min_safety_count: default_min_safety_count(),
            liquidation_max_steps: default_liquidation_max_steps(),
            stale_price_max_ms: default_stale_price_max_ms(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PAPER_TRADING_MODE") {
            cfg.paper_trading_mode = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("WS_MAX_SYMBOLS_PER_CLIENT") {
            if let Ok(n) = v.parse() {
                cfg.ws_max_symbols_per_client = n;
            }
        }
        if let Ok(v) = std::env::var("WS_MAX_BUFFERED_BYTES") {
            if let Ok(n) = v.parse() {
                cfg.ws_max_buffered_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("WS_MAX_MESSAGE_SIZE_BYTES") {
            if let Ok(n) = v.parse() {
                cfg.ws_max_message_size_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("WS_AUTH_REQUIRED") {
            cfg.ws_auth_required = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("MIN_SAFETY_COUNT") {
            if let Ok(n) = v.parse() {
                cfg.min_safety_count = n;
            }
        }
        if let Ok(v) = std::env::var("LIQUIDATION_MAX_STEPS") {
            if let Ok(n) = v.parse() {
                cfg.liquidation_max_steps = n;
            }
        }
        if let Ok(v) = std::env::var("SYMBOLS") {
            let symbols: Vec<String> = v.split(',').map(|s| s.trim().to_string()).collect();
            if !symbols.is_empty() {
                cfg.symbols = symbols;
            }
        }

        cfg
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), trading_mode = %config.trading_mode, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert!(cfg.paper_trading_mode);
        assert!(cfg.ws_auth_required);
        assert_eq!(cfg.liquidation_max_steps, 25);
        assert_eq!(cfg.min_safety_count, 1);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.ws_max_symbols_per_client, 50);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Paused", "symbols": ["NSE_EQ|1"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.symbols, vec!["NSE_EQ|1"]);
        assert_eq!(cfg.liquidation_max_steps, 25);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn save_then_load_roundtrips_via_tmp_rename() {
        let dir = std::env::temp_dir().join(format!("rtc_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.trading_mode = TradingMode::Paused;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.trading_mode, TradingMode::Paused);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_overrides_are_parsed() {
        std::env::set_var("LIQUIDATION_MAX_STEPS", "9");
        std::env::set_var("WS_AUTH_REQUIRED", "false");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.liquidation_max_steps, 9);
        assert!(!cfg.ws_auth_required);
        std::env::remove_var("LIQUIDATION_MAX_STEPS");
        std::env::remove_var("WS_AUTH_REQUIRED");
    }
}
