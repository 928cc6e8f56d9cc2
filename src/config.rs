// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian suite.  Every tunable parameter
// lives here so that operators can reconfigure the engine without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Hot-reload is restricted to a documented subset (pause flag, score
// thresholds, trader roster) — everything else requires a restart.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Environment, RiskLevel, SizingMethod};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_active_broker() -> String {
    "alpaca".to_string()
}

fn default_max_position_size() -> f64 {
    10.0
}

fn default_max_budget() -> f64 {
    1000.0
}

fn default_global_min_score() -> u32 {
    70
}

fn default_btc_threshold() -> u32 {
    65
}

fn default_social_threshold() -> f64 {
    0.70
}

fn default_weather_variance_threshold() -> f64 {
    2.5
}

fn default_max_slippage_pct() -> f64 {
    0.5
}

fn default_execution_timeout_secs() -> u64 {
    15
}

fn default_stop_loss_pct() -> f64 {
    5.0
}

fn default_take_profit_pct() -> f64 {
    10.0
}

fn default_tax_bracket_pct() -> f64 {
    24.0
}

fn default_x_api_budget_limit() -> f64 {
    100.0
}

fn default_social_scan_frequency_mins() -> u64 {
    30
}

fn default_watchlist() -> Vec<String> {
    [
        "SPY", "QQQ", "IWM", "AAPL", "MSFT", "NVDA", "AMZN", "META", "GOOGL",
        "TSLA", "AMD", "PLTR", "AVGO", "COIN", "MSTR", "MARA", "JPM", "BAC", "GS",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian suite.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Master switch — when false the autopilot idles without scanning.
    #[serde(default)]
    pub trading_enabled: bool,

    /// Record-only mode: opportunities are scored and logged, never sent to
    /// a venue.
    #[serde(default = "default_true")]
    pub paper_mode: bool,

    /// Paper vs live environment label used by adapters and the ledger.
    #[serde(default)]
    pub environment: Environment,

    /// Operator pause (hot-reloadable). Distinct from `trading_enabled` so
    /// the dashboard's pause button never flips the persisted master switch.
    #[serde(default)]
    pub bot_paused: bool,

    /// Name of the primary broker adapter.
    #[serde(default = "default_active_broker")]
    pub active_broker: String,

    /// Whether the venue router may pick non-primary brokers by time/symbol.
    #[serde(default = "default_true")]
    pub routing_enabled: bool,

    // --- Risk & sizing -------------------------------------------------------

    #[serde(default)]
    pub risk_level: RiskLevel,

    /// Hard cap for a single position, as a percentage of bankroll.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Bankroll used for sizing when the venue balance is unavailable.
    #[serde(default = "default_max_budget")]
    pub max_budget: f64,

    #[serde(default)]
    pub bet_sizing_method: SizingMethod,

    #[serde(default)]
    pub auto_hedge: bool,

    // --- Scoring thresholds (hot-reloadable) ---------------------------------

    /// Minimum opportunity score required before any execution.
    #[serde(default = "default_global_min_score")]
    pub global_min_score: u32,

    /// Minimum crypto analyzer score to emit an opportunity.
    #[serde(default = "default_btc_threshold")]
    pub btc_threshold: u32,

    /// Minimum social sentiment score (0–1) to emit an opportunity.
    #[serde(default = "default_social_threshold")]
    pub social_threshold: f64,

    /// Maximum forecast-model variance accepted by the weather analyzer.
    #[serde(default = "default_weather_variance_threshold")]
    pub weather_variance_threshold: f64,

    // --- Execution -----------------------------------------------------------

    /// Marketable-limit slippage allowance, percent of the current quote.
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: f64,

    /// Per-order venue timeout in seconds.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Equity stop-loss distance, percent below entry.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Equity take-profit distance, percent above entry.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    // --- Tax -----------------------------------------------------------------

    #[serde(default = "default_true")]
    pub wash_sale_guard_enabled: bool,

    /// Flat bracket used for the ledger's estimated-tax column.
    #[serde(default = "default_tax_bracket_pct")]
    pub tax_bracket_pct: f64,

    // --- Paid social API budget ----------------------------------------------

    /// Monthly spend ceiling for the paid social API, USD.
    #[serde(default = "default_x_api_budget_limit")]
    pub x_api_budget_limit: f64,

    /// Spend accumulated so far this month, USD.
    #[serde(default)]
    pub x_api_total_spend: f64,

    /// Minimum minutes between social scans.
    #[serde(default = "default_social_scan_frequency_mins")]
    pub social_scan_frequency_mins: u64,

    // --- Roster (hot-reloadable) ---------------------------------------------

    /// Strategy/trader names allowed to dispatch through the signal router.
    /// Empty = all allowed.
    #[serde(default)]
    pub traders: Vec<String>,

    /// Symbols the playbook observer scans each cycle.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_enabled: false,
            paper_mode: true,
            environment: Environment::Paper,
            bot_paused: false,
            active_broker: default_active_broker(),
            routing_enabled: true,
            risk_level: RiskLevel::Conservative,
            max_position_size: default_max_position_size(),
            max_budget: default_max_budget(),
            bet_sizing_method: SizingMethod::Kelly,
            auto_hedge: false,
            global_min_score: default_global_min_score(),
            btc_threshold: default_btc_threshold(),
            social_threshold: default_social_threshold(),
            weather_variance_threshold: default_weather_variance_threshold(),
            max_slippage_pct: default_max_slippage_pct(),
            execution_timeout_secs: default_execution_timeout_secs(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            wash_sale_guard_enabled: true,
            tax_bracket_pct: default_tax_bracket_pct(),
            x_api_budget_limit: default_x_api_budget_limit(),
            x_api_total_spend: 0.0,
            social_scan_frequency_mins: default_social_scan_frequency_mins(),
            traders: Vec::new(),
            watchlist: default_watchlist(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            environment = %config.environment,
            active_broker = %config.active_broker,
            "runtime config loaded"
        );

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

    /// Reject configs whose values are outside their documented ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.max_position_size) {
            bail!("max_position_size must be within [0, 100] percent");
        }
        if self.max_budget < 0.0 {
            bail!("max_budget cannot be negative");
        }
        if self.max_slippage_pct < 0.0 || self.max_slippage_pct > 10.0 {
            bail!("max_slippage_pct must be within [0, 10] percent");
        }
        if !(0.0..=1.0).contains(&self.social_threshold) {
            bail!("social_threshold must be within [0, 1]");
        }
        if !(0.0..=100.0).contains(&self.tax_bracket_pct) {
            bail!("tax_bracket_pct must be within [0, 100]");
        }
        if self.global_min_score > 100 {
            bail!("global_min_score must be within [0, 100]");
        }
        Ok(())
    }

    /// Copy the hot-reloadable subset from a freshly loaded config.
    ///
    /// Only the pause flag, the score thresholds, and the trader roster may
    /// change without a restart; everything else in `fresh` is ignored.
    pub fn apply_hot_reload(&mut self, fresh: &RuntimeConfig) {
        self.bot_paused = fresh.bot_paused;
        self.global_min_score = fresh.global_min_score;
        self.btc_threshold = fresh.btc_threshold;
        self.social_threshold = fresh.social_threshold;
        self.weather_variance_threshold = fresh.weather_variance_threshold;
        self.traders = fresh.traders.clone();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.trading_enabled);
        assert!(cfg.paper_mode);
        assert_eq!(cfg.environment, Environment::Paper);
        assert_eq!(cfg.global_min_score, 70);
        assert_eq!(cfg.btc_threshold, 65);
        assert!((cfg.max_position_size - 10.0).abs() < f64::EPSILON);
        assert!((cfg.max_slippage_pct - 0.5).abs() < f64::EPSILON);
        assert!(cfg.wash_sale_guard_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.paper_mode);
        assert_eq!(cfg.risk_level, RiskLevel::Conservative);
        assert_eq!(cfg.bet_sizing_method, SizingMethod::Kelly);
        assert!(!cfg.watchlist.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_enabled": true, "risk_level": "AGGRESSIVE" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.trading_enabled);
        assert_eq!(cfg.risk_level, RiskLevel::Aggressive);
        assert_eq!(cfg.global_min_score, 70);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.watchlist, cfg2.watchlist);
        assert_eq!(cfg.global_min_score, cfg2.global_min_score);
        assert_eq!(cfg.environment, cfg2.environment);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_position_size = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.social_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hot_reload_only_touches_documented_subset() {
        let mut live = RuntimeConfig::default();
        let mut fresh = RuntimeConfig::default();
        fresh.bot_paused = true;
        fresh.global_min_score = 90;
        fresh.traders = vec!["swarm".to_string()];
        fresh.paper_mode = false; // must NOT propagate
        fresh.max_budget = 99_999.0; // must NOT propagate

        live.apply_hot_reload(&fresh);
        assert!(live.bot_paused);
        assert_eq!(live.global_min_score, 90);
        assert_eq!(live.traders, vec!["swarm".to_string()]);
        assert!(live.paper_mode);
        assert!((live.max_budget - 1000.0).abs() < f64::EPSILON);
    }
}
