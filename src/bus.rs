// =============================================================================
// Intel Bus — shared cross-process signal exchange
// =============================================================================
//
// Redis-backed key/value store for typed signals plus two pub/sub channels.
// Every key is written with a 300-second expiry; a missing or expired key is
// a valid state that callers must treat as "no signal".
//
// Failure semantics: bus unavailability never propagates.  Publishes log at
// debug level and return; reads return None.  A process that cannot reach
// Redis at boot runs with the bus disabled and behaves exactly as if every
// key were absent.
// =============================================================================

use std::time::Duration;

use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Seconds before a published signal expires.
pub const INTEL_TTL_SECS: u64 = 300;

/// Maximum time spent establishing the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Well-known keys and channels
// ---------------------------------------------------------------------------

pub mod keys {
    pub const BTC_SENTIMENT: &str = "intel:btc_sentiment";
    pub const BTC_VOLUME_SPIKE: &str = "intel:btc_volume_spike";
    pub const FED_BIAS: &str = "intel:fed_bias";
    pub const SOCIAL_SCORE: &str = "intel:social_score";
    pub const WEATHER_EDGE: &str = "intel:weather_edge";
    pub const VIX_LEVEL: &str = "intel:vix_level";
    pub const SPY_TREND: &str = "intel:spy_trend";
    pub const PORTFOLIO_HEAT: &str = "intel:portfolio_heat";
    pub const PLAYBOOK_SNAPSHOT: &str = "intel:playbook_snapshot";
    pub const GEOPOLITICAL_RISK: &str = "intel:geopolitical_risk";
    pub const CONFLICT_EVENTS: &str = "intel:conflict_events";
    pub const REGIONAL_RISK: &str = "intel:regional_risk";
    pub const FEAR_GREED: &str = "macro:fear_greed";
    pub const TEN_Y_YIELD: &str = "macro:10y_yield";
    pub const STRATEGY_MODE: &str = "strategy_mode";
    pub const PREDICTION_OI: &str = "intel:prediction_oi";
    pub const PREDICTION_LIQUIDITY_SPIKE: &str = "intel:prediction_liquidity_spike";
    pub const PREDICTION_BOOK_SUMMARY: &str = "intel:prediction_orderbook_summary";
    /// Autopilot restart-recovery state (no TTL — administrative clear only).
    pub const EXECUTED_TRADES: &str = "autopilot:executed_trades";
    pub const BLACKLIST: &str = "autopilot:blacklist";
}

pub mod channels {
    pub const TRADE_SIGNALS: &str = "trade_signals";
    pub const EMERGENCY_STOP: &str = "emergency_stop";
}

/// Payload broadcast on `emergency_stop`.
pub const CANCEL_ALL: &str = "CANCEL_ALL";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// The envelope every Intel Bus key carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelPayload {
    pub value: serde_json::Value,
    pub source_system: String,
    /// Unix epoch seconds at publish time.
    pub timestamp: f64,
    /// Publisher confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
}

impl IntelPayload {
    /// Convenience accessor for numeric signal values.
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Convenience accessor for string signal values.
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

// ---------------------------------------------------------------------------
// IntelBus
// ---------------------------------------------------------------------------

/// Handle to the shared signal exchange. Cheap to clone via `Arc`.
pub struct IntelBus {
    /// `None` when Redis was unreachable at boot — every read is then
    /// absence, every publish a no-op.
    conn: RwLock<Option<ConnectionManager>>,
    client: Option<redis::Client>,
}

impl IntelBus {
    /// Connect to the bus at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Never fails: on any connection error the bus comes up disabled and
    /// the process continues without cross-system intelligence.
    pub async fn connect(url: &str) -> Self {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "intel bus URL invalid — bus disabled");
                return Self {
                    conn: RwLock::new(None),
                    client: None,
                };
            }
        };

        let conn = match tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
        {
            Ok(Ok(m)) => {
                info!(url = %url, "intel bus connected");
                Some(m)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "intel bus unreachable — bus disabled");
                None
            }
            Err(_) => {
                warn!("intel bus connect timed out — bus disabled");
                None
            }
        };

        Self {
            conn: RwLock::new(conn),
            client: Some(client),
        }
    }

    /// Construct a permanently disabled bus (used by tests and offline runs).
    pub fn disabled() -> Self {
        Self {
            conn: RwLock::new(None),
            client: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.read().is_some()
    }

    // -------------------------------------------------------------------------
    // Keyed signals
    // -------------------------------------------------------------------------

    /// Publish `value` under `key` with the standard envelope and TTL.
    ///
    /// Failures are logged at debug level and swallowed — the producer must
    /// never stall on bus trouble.
    pub async fn publish(
        &self,
        key: &str,
        value: serde_json::Value,
        source_system: &str,
        confidence: f64,
    ) {
        let Some(mut conn) = self.conn.read().clone() else {
            return;
        };

        let payload = IntelPayload {
            value,
            source_system: source_system.to_string(),
            timestamp: epoch_now(),
            confidence,
        };
        let raw = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(e) => {
                debug!(key, error = %e, "intel publish serialisation failed");
                return;
            }
        };

        if let Err(e) = conn.set_ex::<_, _, ()>(key, raw, INTEL_TTL_SECS).await {
            debug!(key, error = %e, "intel publish failed");
        }
    }

    /// Publish a value under `key` with no expiry.
    ///
    /// Used for the autopilot's restart-recovery maps, which are cleared
    /// only by administrative action.
    pub async fn publish_durable(&self, key: &str, value: serde_json::Value) {
        let Some(mut conn) = self.conn.read().clone() else {
            return;
        };
        let raw = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(e) => {
                debug!(key, error = %e, "durable publish serialisation failed");
                return;
            }
        };
        if let Err(e) = conn.set::<_, _, ()>(key, raw).await {
            debug!(key, error = %e, "durable publish failed");
        }
    }

    /// Read the full payload for `key`.
    ///
    /// Returns `None` for a missing key, an expired key, a deserialisation
    /// failure, or any transport error — all are equally "no signal".
    pub async fn read(&self, key: &str) -> Option<IntelPayload> {
        let raw = self.read_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(key, error = %e, "intel payload malformed — treating as absent");
                None
            }
        }
    }

    /// Read a durable (non-enveloped) value for `key`.
    pub async fn read_durable(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.read_raw(key).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn read_raw(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.read().clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "intel read failed");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pub/sub channels
    // -------------------------------------------------------------------------

    /// Broadcast `payload` on `channel`. Fire-and-forget.
    pub async fn publish_channel(&self, channel: &str, payload: &str) {
        let Some(mut conn) = self.conn.read().clone() else {
            return;
        };
        if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
            debug!(channel, error = %e, "channel publish failed");
        }
    }

    /// Open a subscription on `channel`.
    ///
    /// Returns `None` when the bus is disabled or the subscription cannot be
    /// established; callers retry with a backoff.
    pub async fn subscribe(&self, channel: &str) -> Option<redis::aio::PubSub> {
        let client = self.client.as_ref()?;
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(e) => {
                debug!(channel, error = %e, "pubsub connect failed");
                return None;
            }
        };
        if let Err(e) = pubsub.subscribe(channel).await {
            debug!(channel, error = %e, "subscribe failed");
            return None;
        }
        info!(channel, "subscribed");
        Some(pubsub)
    }
}

/// Current Unix time as fractional seconds.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
