// =============================================================================
// Trade Signal — the validated, typed output of the analyst pipeline
// =============================================================================
//
// Every trade the swarm proposes must conform exactly to this structure
// before the signal router will dispatch it.  Signals that fail validation
// are rejected at the pipeline boundary, never coerced.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Ceiling on per-signal allocation: 10 % of buying power.
pub const MAX_ALLOCATION_PCT: f64 = 0.10;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which execution engine the signal targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSystem {
    EquityEngine,
    PredictionEngine,
}

/// Registered venue adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brokerage {
    Alpaca,
    Coinbase,
    Kalshi,
}

impl std::fmt::Display for Brokerage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alpaca => write!(f, "alpaca"),
            Self::Coinbase => write!(f, "coinbase"),
            Self::Kalshi => write!(f, "kalshi"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Option,
    Crypto,
    PredictionMarket,
    SportsBet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
    Short,
    Cover,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::Short => write!(f, "SHORT"),
            Self::Cover => write!(f, "COVER"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SignalError {
    #[error("confidence_score {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("proposed_allocation_pct {0} outside [0, {MAX_ALLOCATION_PCT}]")]
    AllocationOutOfRange(f64),
    #[error("options contract requires a strike_price")]
    MissingStrike,
    #[error("asset class requires an expiration_date")]
    MissingExpiration,
    #[error("ticker_or_event is empty")]
    EmptyTicker,
}

// ---------------------------------------------------------------------------
// TradeSignal
// ---------------------------------------------------------------------------

/// The strictly enforced trade contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeSignal {
    pub target_system: TargetSystem,
    pub target_brokerage: Brokerage,
    pub asset_class: AssetClass,
    /// Standardised ticker (AAPL), pair (BTC-USD), or event contract id.
    pub ticker_or_event: String,
    pub action: TradeAction,
    /// Consensus confidence from the analyst debate, in [0, 1].
    pub confidence_score: f64,
    /// Fraction of buying power to commit, in [0, 0.10].
    pub proposed_allocation_pct: f64,
    /// Required iff `asset_class == Option`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strike_price: Option<f64>,
    /// Required iff `asset_class` is Option or PredictionMarket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<NaiveDate>,
    /// One-sentence summary of the logic behind the signal.
    pub agent_reasoning: String,
}

impl TradeSignal {
    /// Enforce every cross-field invariant of the contract.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.ticker_or_event.trim().is_empty() {
            return Err(SignalError::EmptyTicker);
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(SignalError::ConfidenceOutOfRange(self.confidence_score));
        }
        if !(0.0..=MAX_ALLOCATION_PCT).contains(&self.proposed_allocation_pct) {
            return Err(SignalError::AllocationOutOfRange(
                self.proposed_allocation_pct,
            ));
        }
        if self.asset_class == AssetClass::Option && self.strike_price.is_none() {
            return Err(SignalError::MissingStrike);
        }
        if matches!(
            self.asset_class,
            AssetClass::Option | AssetClass::PredictionMarket
        ) && self.expiration_date.is_none()
        {
            return Err(SignalError::MissingExpiration);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel envelope
// ---------------------------------------------------------------------------

/// Payload published on the `trade_signals` channel: the signal itself plus
/// routing metadata the signal router needs before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub signal: TradeSignal,
    /// Strategy that produced the signal — checked against the kill switch's
    /// quarantine set and the configured trader roster.
    #[serde(default)]
    pub strategy: String,
    /// Optional extended reasoning beyond the signal's one-liner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn base_signal() -> TradeSignal {
        TradeSignal {
            target_system: TargetSystem::EquityEngine,
            target_brokerage: Brokerage::Alpaca,
            asset_class: AssetClass::Equity,
            ticker_or_event: "AAPL".to_string(),
            action: TradeAction::Buy,
            confidence_score: 0.8,
            proposed_allocation_pct: 0.05,
            strike_price: None,
            expiration_date: None,
            agent_reasoning: "Consensus breakout above resistance".to_string(),
        }
    }

    #[test]
    fn valid_equity_signal_passes() {
        assert!(base_signal().validate().is_ok());
    }

    #[test]
    fn option_without_strike_rejected() {
        let mut s = base_signal();
        s.asset_class = AssetClass::Option;
        s.expiration_date = NaiveDate::from_ymd_opt(2026, 9, 18);
        assert_eq!(s.validate(), Err(SignalError::MissingStrike));
    }

    #[test]
    fn option_without_expiration_rejected() {
        let mut s = base_signal();
        s.asset_class = AssetClass::Option;
        s.strike_price = Some(250.0);
        assert_eq!(s.validate(), Err(SignalError::MissingExpiration));
    }

    #[test]
    fn prediction_market_requires_expiration() {
        let mut s = base_signal();
        s.asset_class = AssetClass::PredictionMarket;
        s.target_brokerage = Brokerage::Kalshi;
        assert_eq!(s.validate(), Err(SignalError::MissingExpiration));

        s.expiration_date = NaiveDate::from_ymd_opt(2026, 8, 15);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn allocation_above_ten_percent_rejected() {
        let mut s = base_signal();
        s.proposed_allocation_pct = 0.11;
        assert_eq!(
            s.validate(),
            Err(SignalError::AllocationOutOfRange(0.11))
        );
        // Exactly at the cap is allowed.
        s.proposed_allocation_pct = MAX_ALLOCATION_PCT;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let mut s = base_signal();
        s.confidence_score = 1.2;
        assert_eq!(s.validate(), Err(SignalError::ConfidenceOutOfRange(1.2)));
    }

    #[test]
    fn serialize_then_parse_preserves_all_fields() {
        let mut s = base_signal();
        s.asset_class = AssetClass::Option;
        s.strike_price = Some(252.5);
        s.expiration_date = NaiveDate::from_ymd_opt(2026, 12, 18);

        let raw = serde_json::to_string(&s).unwrap();
        let back: TradeSignal = serde_json::from_str(&raw).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn envelope_roundtrip_with_defaults() {
        let raw = serde_json::to_string(&SignalEnvelope {
            signal: base_signal(),
            strategy: "swarm".to_string(),
            reasoning: None,
        })
        .unwrap();
        let back: SignalEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.strategy, "swarm");
        assert!(back.reasoning.is_none());
        assert!(back.signal.validate().is_ok());
    }
}
