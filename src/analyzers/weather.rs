// =============================================================================
// Weather Alpha — multi-model forecast consensus vs live venue pricing
// =============================================================================
//
// For each covered city: pull tomorrow's high-temperature forecast from
// several weather models, measure cross-model variance, and compare the
// consensus against the venue's live high-temperature markets.  Tight model
// agreement priced cheaply by the market is the edge.
//
// Edges are computed against LIVE order data only — if the venue has no
// open markets for a city, that city contributes nothing.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::analyzers::{Analyzer, AnalyzerOutcome, Assessment};
use crate::broker::kalshi::{KalshiAdapter, KalshiMarket};
use crate::bus::{keys, IntelBus};

const SOURCE: &str = "weather_alpha";
const WEATHER_ODDS: f64 = 3.0;

/// Cross-model agreement tiers.
const DIAMOND_VARIANCE: f64 = 1.5;
const DIAMOND_CONFIDENCE: f64 = 0.95;
const GOLD_CONFIDENCE: f64 = 0.70;

/// Covered stations: city code -> (latitude, longitude).
fn default_cities() -> Vec<(&'static str, f64, f64)> {
    vec![
        ("MIA", 25.76, -80.19),
        ("NYC", 40.71, -74.01),
        ("CHI", 41.88, -87.63),
        ("AUS", 30.27, -97.74),
        ("DEN", 39.74, -104.99),
    ]
}

// ---------------------------------------------------------------------------
// Pure pricing helpers
// ---------------------------------------------------------------------------

/// Mean and variance of per-model forecast highs.
pub fn forecast_consensus(model_temps: &[f64]) -> Option<(f64, f64)> {
    if model_temps.len() < 2 {
        return None;
    }
    let n = model_temps.len() as f64;
    let mean = model_temps.iter().sum::<f64>() / n;
    let variance = model_temps.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance))
}

/// Model conviction for a given cross-model variance, or None when the
/// models disagree too much to trade.
pub fn model_confidence(variance: f64, variance_threshold: f64) -> Option<f64> {
    if variance < DIAMOND_VARIANCE {
        Some(DIAMOND_CONFIDENCE)
    } else if variance < variance_threshold {
        Some(GOLD_CONFIDENCE)
    } else {
        None
    }
}

/// Best (market, edge) where edge = model confidence − live ask.  Only
/// positive edges on actually-quoted markets qualify.
pub fn best_edge(markets: &[KalshiMarket], confidence: f64) -> Option<(KalshiMarket, f64)> {
    markets
        .iter()
        .filter(|m| m.yes_ask > 0)
        .map(|m| {
            let ask = m.yes_ask as f64 / 100.0;
            (m.clone(), confidence - ask)
        })
        .filter(|(_, edge)| *edge > 0.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

/// Pull every numeric series under `daily.temperature_2m_max*` — the
/// forecast API appends a model suffix per requested model.
pub fn extract_model_temps(daily: &serde_json::Value) -> Vec<f64> {
    let Some(map) = daily.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(key, _)| key.starts_with("temperature_2m_max"))
        .filter_map(|(_, value)| value.as_array()?.first()?.as_f64())
        .collect()
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

struct CityEdge {
    city: &'static str,
    ticker: String,
    edge: f64,
    consensus_temp: f64,
    variance: f64,
}

pub struct WeatherAnalyzer {
    bus: Arc<IntelBus>,
    venue: Arc<KalshiAdapter>,
    client: reqwest::Client,
    variance_threshold: f64,
    cities: Vec<(&'static str, f64, f64)>,
}

impl WeatherAnalyzer {
    pub fn new(bus: Arc<IntelBus>, venue: Arc<KalshiAdapter>, variance_threshold: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bus,
            venue,
            client,
            variance_threshold,
            cities: default_cities(),
        }
    }

    async fn fetch_model_temps(&self, lat: f64, lon: f64) -> Option<Vec<f64>> {
        let url = format!(
            "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}\
             &daily=temperature_2m_max&forecast_days=1&temperature_unit=fahrenheit\
             &models=gfs_seamless,ecmwf_ifs04,icon_seamless"
        );
        let body: serde_json::Value = self.client.get(&url).send().await.ok()?.json().await.ok()?;
        let temps = extract_model_temps(body.get("daily")?);
        (!temps.is_empty()).then_some(temps)
    }

    async fn scan_city(&self, city: &'static str, lat: f64, lon: f64) -> Option<CityEdge> {
        let temps = self.fetch_model_temps(lat, lon).await?;
        let (consensus, variance) = forecast_consensus(&temps)?;
        let confidence = model_confidence(variance, self.variance_threshold)?;

        let markets = match self.venue.list_open_markets(&format!("KXHIGH{city}")).await {
            Ok(m) => m,
            Err(e) => {
                warn!(city, error = %e, "weather market fetch failed");
                return None;
            }
        };
        let (market, edge) = best_edge(&markets, confidence)?;

        debug!(city, consensus, variance, edge, ticker = %market.ticker, "weather edge");
        Some(CityEdge {
            city,
            ticker: market.ticker,
            edge,
            consensus_temp: consensus,
            variance,
        })
    }
}

#[async_trait]
impl Analyzer for WeatherAnalyzer {
    fn name(&self) -> &'static str {
        "WEATHER"
    }

    async fn analyze(&self) -> AnalyzerOutcome {
        let scans = self
            .cities
            .iter()
            .map(|(city, lat, lon)| self.scan_city(*city, *lat, *lon));
        let edges: Vec<CityEdge> = join_all(scans).await.into_iter().flatten().collect();

        if edges.is_empty() {
            return AnalyzerOutcome::NoSignal(
                "no live weather markets with model edge".to_string(),
            );
        }

        // Bus enrichment: every city's edge percentage.
        let edge_map: HashMap<&str, f64> = edges
            .iter()
            .map(|e| (e.city, (e.edge * 10_000.0).round() / 100.0))
            .collect();
        self.bus
            .publish(
                keys::WEATHER_EDGE,
                serde_json::to_value(&edge_map).unwrap_or_default(),
                SOURCE,
                1.0,
            )
            .await;

        let best = edges
            .into_iter()
            .max_by(|a, b| a.edge.partial_cmp(&b.edge).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty");

        AnalyzerOutcome::Success(Assessment {
            score: best.edge * 100.0,
            signal: format!("{} high-temp edge", best.city),
            reason: format!(
                "Model consensus {:.1}F (variance {:.2}) vs live ask on {}",
                best.consensus_temp, best.variance, best.ticker
            ),
            odds: WEATHER_ODDS,
            extras: serde_json::json!({
                "city": best.city,
                "ticker": best.ticker,
                "consensus_temp": best.consensus_temp,
                "variance": best.variance,
            }),
        })
    }
}
