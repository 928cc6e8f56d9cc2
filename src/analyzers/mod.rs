// =============================================================================
// Analyzers — domain scanners feeding the autopilot's opportunity ranking
// =============================================================================
//
// Every analyzer produces an `AnalyzerOutcome`:
//
//   Success(Assessment)  — a scored read on the domain, ready for ranking
//   NoSignal(reason)     — the domain has nothing actionable (missing data,
//                          budget window closed, markets shut)
//   Error(kind)          — an external failure; logged and ignored
//
// Only Success enters the opportunity list.  Analyzers never guess when an
// upstream API fails, and they never execute orders.  Cross-analyzer
// communication goes over the Intel Bus exclusively.
// =============================================================================

pub mod crypto_vision;
pub mod geopolitical;
pub mod rates;
pub mod social;
pub mod weather;

use async_trait::async_trait;
use serde::Serialize;

/// A scored domain read, normalised for the autopilot.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    /// Conviction mapped into [0, 100].
    pub score: f64,
    /// Direction label, e.g. "BTC BULLISH" or "Recession Hedge".
    pub signal: String,
    pub reason: String,
    /// Decimal odds the venue offers on this read.
    pub odds: f64,
    /// Domain-specific extras (e.g. the weather city code).
    pub extras: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub enum AnalyzerOutcome {
    Success(Assessment),
    NoSignal(String),
    Error(String),
}

impl AnalyzerOutcome {
    pub fn success(&self) -> Option<&Assessment> {
        match self {
            Self::Success(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Contract every domain analyzer implements.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Stable module tag used in opportunity ranking and trade ids.
    fn name(&self) -> &'static str;

    /// One scan of the domain. Must not raise: failures become
    /// `NoSignal` or `Error` variants.
    async fn analyze(&self) -> AnalyzerOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let ok = AnalyzerOutcome::Success(Assessment {
            score: 80.0,
            signal: "BTC BULLISH".to_string(),
            reason: "test".to_string(),
            odds: 1.95,
            extras: serde_json::Value::Null,
        });
        assert!(ok.is_success());
        assert!((ok.success().unwrap().score - 80.0).abs() < f64::EPSILON);

        let no = AnalyzerOutcome::NoSignal("markets closed".to_string());
        assert!(!no.is_success());
        assert!(no.success().is_none());
    }
}
