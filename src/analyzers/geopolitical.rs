// =============================================================================
// GeoPulse — conflict-event risk from the CAMEO-coded event feed
// =============================================================================
//
// Consumes a CAMEO-coded event stream (root codes 10–20 are high-impact
// activity: threats, coercion, assaults, fights, mass violence), aggregates
// an overall risk score plus per-region breakdown, and publishes all of it
// to the bus.
//
// When the upstream feed is unreachable the analyzer reports NoSignal — it
// never synthesises headlines.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::analyzers::{Analyzer, AnalyzerOutcome, Assessment};
use crate::bus::{keys, IntelBus};

const SOURCE: &str = "geo_pulse";
const GEO_ODDS: f64 = 2.50;

/// CAMEO root codes considered high-impact.
const HIGH_IMPACT_ROOTS: std::ops::RangeInclusive<u32> = 10..=20;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictEvent {
    /// CAMEO event code, e.g. "190" (fight) or "043" (consult).
    pub event_code: String,
    /// Goldstein scale value in [−10, 10]; negative = destabilising.
    #[serde(default)]
    pub goldstein: f64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub headline: String,
}

#[derive(Debug, Deserialize)]
struct EventFeed {
    #[serde(default)]
    events: Vec<ConflictEvent>,
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// First two digits of a CAMEO code.
pub fn cameo_root(code: &str) -> Option<u32> {
    let digits: String = code.chars().take(2).collect();
    digits.parse().ok()
}

pub fn is_high_impact(code: &str) -> bool {
    cameo_root(code).map(|r| HIGH_IMPACT_ROOTS.contains(&r)).unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct RiskReading {
    /// Aggregate risk in [0, 100].
    pub score: f64,
    pub level: &'static str,
    pub top_event: Option<String>,
    pub regional: HashMap<String, f64>,
}

/// Aggregate event severity: high-impact events weigh 3×, destabilising
/// Goldstein values add magnitude, and everything normalises into [0, 100].
pub fn score_events(events: &[ConflictEvent]) -> RiskReading {
    if events.is_empty() {
        return RiskReading {
            score: 0.0,
            level: "LOW",
            top_event: None,
            regional: HashMap::new(),
        };
    }

    let mut total = 0.0;
    let mut regional: HashMap<String, f64> = HashMap::new();
    let mut top: Option<(f64, &ConflictEvent)> = None;

    for event in events {
        let impact_mult = if is_high_impact(&event.event_code) { 3.0 } else { 1.0 };
        let severity = impact_mult * (1.0 + (-event.goldstein).max(0.0));
        total += severity;
        if !event.region.is_empty() {
            *regional.entry(event.region.clone()).or_insert(0.0) += severity;
        }
        if top.as_ref().map(|(s, _)| severity > *s).unwrap_or(true) {
            top = Some((severity, event));
        }
    }

    // Normalise: 30+ severity units across a feed window saturates the scale.
    let score = (total / 30.0 * 100.0).min(100.0);
    let level = match score {
        s if s >= 80.0 => "CRITICAL",
        s if s >= 60.0 => "HIGH",
        s if s >= 30.0 => "ELEVATED",
        _ => "LOW",
    };

    RiskReading {
        score,
        level,
        top_event: top.map(|(_, e)| e.headline.clone()).filter(|h| !h.is_empty()),
        regional,
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct GeoPulseAnalyzer {
    bus: Arc<IntelBus>,
    client: reqwest::Client,
    feed_url: Option<String>,
    previous_score: RwLock<Option<f64>>,
}

impl GeoPulseAnalyzer {
    /// `feed_url = None` runs the analyzer permanently in NoSignal mode.
    pub fn new(bus: Arc<IntelBus>, feed_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bus,
            client,
            feed_url,
            previous_score: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Analyzer for GeoPulseAnalyzer {
    fn name(&self) -> &'static str {
        "GEO"
    }

    async fn analyze(&self) -> AnalyzerOutcome {
        let Some(url) = self.feed_url.as_deref() else {
            return AnalyzerOutcome::NoSignal("event feed not configured".to_string());
        };

        let events = match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<EventFeed>().await {
                Ok(feed) => feed.events,
                Err(e) => return AnalyzerOutcome::Error(format!("malformed feed: {e}")),
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "event feed rejected the request");
                return AnalyzerOutcome::Error(format!("HTTP {}", resp.status()));
            }
            Err(e) => return AnalyzerOutcome::Error(format!("transport: {e}")),
        };

        if events.is_empty() {
            return AnalyzerOutcome::NoSignal("event feed empty".to_string());
        }

        let reading = score_events(&events);
        let trend = {
            let mut prev = self.previous_score.write();
            let trend = match *prev {
                Some(p) if reading.score > p + 5.0 => "rising",
                Some(p) if reading.score < p - 5.0 => "falling",
                Some(_) => "stable",
                None => "unknown",
            };
            *prev = Some(reading.score);
            trend
        };

        self.bus
            .publish(
                keys::GEOPOLITICAL_RISK,
                serde_json::json!({
                    "score": reading.score,
                    "level": reading.level,
                    "top_event": reading.top_event,
                    "trend": trend,
                }),
                SOURCE,
                reading.score / 100.0,
            )
            .await;
        self.bus
            .publish(
                keys::CONFLICT_EVENTS,
                serde_json::to_value(
                    events
                        .iter()
                        .filter(|e| is_high_impact(&e.event_code))
                        .map(|e| &e.headline)
                        .collect::<Vec<_>>(),
                )
                .unwrap_or_default(),
                SOURCE,
                1.0,
            )
            .await;
        self.bus
            .publish(
                keys::REGIONAL_RISK,
                serde_json::to_value(&reading.regional).unwrap_or_default(),
                SOURCE,
                1.0,
            )
            .await;

        debug!(
            score = reading.score,
            level = reading.level,
            trend,
            events = events.len(),
            "geo pulse scan complete"
        );

        if reading.score >= 60.0 {
            AnalyzerOutcome::Success(Assessment {
                score: reading.score,
                signal: "Geo Hedge".to_string(),
                reason: format!(
                    "Conflict risk {} ({:.0}/100), trend {trend}",
                    reading.level, reading.score
                ),
                odds: GEO_ODDS,
                extras: serde_json::json!({
                    "level": reading.level,
                    "top_event": reading.top_event,
                }),
            })
        } else {
            AnalyzerOutcome::NoSignal(format!(
                "conflict risk {} ({:.0}/100) below hedge threshold",
                reading.level, reading.score
            ))
        }
    }
}
