// =============================================================================
// Shared types used across the Meridian trading suite
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether orders reach real venues or are recorded locally only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    Paper,
    Live,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Risk appetite — selects the fractional-Kelly multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Conservative
    }
}

impl RiskLevel {
    /// Kelly fraction applied on top of the raw Kelly optimum.
    pub fn kelly_fraction(self) -> f64 {
        match self {
            Self::Conservative => 0.25,
            Self::Moderate => 0.40,
            Self::Aggressive => 0.50,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "CONSERVATIVE"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Aggressive => write!(f, "AGGRESSIVE"),
        }
    }
}

/// How stake size is derived from a scored opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SizingMethod {
    Kelly,
    Flat,
    Percentage,
}

impl Default for SizingMethod {
    fn default() -> Self {
        Self::Kelly
    }
}

/// Position summary as reported by a venue adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub quantity: f64,
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub average_buy_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_fractions() {
        assert!((RiskLevel::Conservative.kelly_fraction() - 0.25).abs() < f64::EPSILON);
        assert!((RiskLevel::Moderate.kelly_fraction() - 0.40).abs() < f64::EPSILON);
        assert!((RiskLevel::Aggressive.kelly_fraction() - 0.50).abs() < f64::EPSILON);
    }

    #[test]
    fn environment_serde_uppercase() {
        let env: Environment = serde_json::from_str("\"LIVE\"").unwrap();
        assert_eq!(env, Environment::Live);
        assert_eq!(serde_json::to_string(&Environment::Paper).unwrap(), "\"PAPER\"");
    }
}
