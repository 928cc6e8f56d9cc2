// =============================================================================
// Social Alpha — crowd sentiment from the paid social firehose, metered
// =============================================================================
//
// The upstream API is paid per request, so every scan passes a budget gate
// first: a minimum interval between scans and a hard monthly spend ceiling.
// A closed gate is a NoSignal, not an error — the autopilot simply ranks
// without crowd input that cycle.
//
// Scores are published to `intel:social_score` as `{score, top_ticker}`
// with score in [0, 1] (0 = max bearish, 1 = max bullish).
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::analyzers::{Analyzer, AnalyzerOutcome, Assessment};
use crate::bus::{keys, IntelBus};

const SOURCE: &str = "social_alpha";
const SOCIAL_ODDS: f64 = 2.10;

/// Flat cost charged against the monthly budget per scan.
const COST_PER_SCAN: f64 = 0.50;

const BULLISH_WORDS: [&str; 6] = ["moon", "call", "buy", "bull", "breakout", "long"];
const BEARISH_WORDS: [&str; 5] = ["put", "short", "sell", "bear", "dump"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SocialPost {
    pub text: String,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub repost_count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SocialPost>,
}

// ---------------------------------------------------------------------------
// Budget gate
// ---------------------------------------------------------------------------

struct BudgetState {
    month: String,
    total_spend: f64,
    last_scan: Option<Instant>,
}

/// Why a scan was skipped, if it was.
fn gate_reason(
    state: &BudgetState,
    now: Instant,
    current_month: &str,
    budget_limit: f64,
    min_interval: Duration,
) -> Option<String> {
    if let Some(last) = state.last_scan {
        let elapsed = now.duration_since(last);
        if elapsed < min_interval {
            return Some(format!(
                "scan frequency window: {}s of {}s elapsed",
                elapsed.as_secs(),
                min_interval.as_secs()
            ));
        }
    }
    if state.month == current_month && state.total_spend + COST_PER_SCAN > budget_limit {
        return Some(format!(
            "monthly API budget exhausted (${:.2} of ${budget_limit:.2})",
            state.total_spend
        ));
    }
    None
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Engagement-weighted bull/bear balance in [0, 1], plus the most-mentioned
/// cashtag.
pub fn score_posts(posts: &[SocialPost]) -> (f64, Option<String>) {
    let mut bull_weight = 0.0;
    let mut bear_weight = 0.0;
    let mut mentions: std::collections::HashMap<String, u32> = std::collections::HashMap::new();

    for post in posts {
        let lower = post.text.to_lowercase();
        let engagement = 1.0 + (post.like_count + 2 * post.repost_count) as f64;

        if BULLISH_WORDS.iter().any(|w| lower.contains(w)) {
            bull_weight += engagement;
        }
        if BEARISH_WORDS.iter().any(|w| lower.contains(w)) {
            bear_weight += engagement;
        }

        for word in post.text.split_whitespace() {
            if let Some(tag) = word.strip_prefix('$') {
                let ticker: String = tag
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect::<String>()
                    .to_uppercase();
                if (1..=5).contains(&ticker.len()) {
                    *mentions.entry(ticker).or_insert(0) += 1;
                }
            }
        }
    }

    let total = bull_weight + bear_weight;
    let score = if total > 0.0 {
        0.5 + 0.5 * (bull_weight - bear_weight) / total
    } else {
        0.5
    };

    let top_ticker = mentions
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(ticker, _)| ticker);

    (score, top_ticker)
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct SocialAnalyzer {
    bus: Arc<IntelBus>,
    client: reqwest::Client,
    bearer_token: Option<String>,
    search_url: String,
    budget_limit: f64,
    min_interval: Duration,
    budget: RwLock<BudgetState>,
}

impl SocialAnalyzer {
    pub fn new(
        bus: Arc<IntelBus>,
        bearer_token: Option<String>,
        budget_limit: f64,
        scan_frequency_mins: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bus,
            client,
            bearer_token,
            search_url: "https://api.x.com/2/tweets/search/recent".to_string(),
            budget_limit,
            min_interval: Duration::from_secs(scan_frequency_mins * 60),
            budget: RwLock::new(BudgetState {
                month: current_month(),
                total_spend: 0.0,
                last_scan: None,
            }),
        }
    }

    /// Spend accumulated against the current month's budget.
    pub fn total_spend(&self) -> f64 {
        self.budget.read().total_spend
    }

    fn check_and_charge(&self) -> Result<(), String> {
        let now = Instant::now();
        let month = current_month();
        let mut state = self.budget.write();

        if state.month != month {
            state.month = month.clone();
            state.total_spend = 0.0;
        }
        if let Some(reason) = gate_reason(&state, now, &month, self.budget_limit, self.min_interval)
        {
            return Err(reason);
        }

        state.last_scan = Some(now);
        state.total_spend += COST_PER_SCAN;
        Ok(())
    }
}

fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

#[async_trait]
impl Analyzer for SocialAnalyzer {
    fn name(&self) -> &'static str {
        "SOCIAL"
    }

    async fn analyze(&self) -> AnalyzerOutcome {
        let Some(token) = self.bearer_token.as_deref() else {
            return AnalyzerOutcome::NoSignal("social API token not configured".to_string());
        };

        if let Err(reason) = self.check_and_charge() {
            debug!(reason = %reason, "social scan skipped");
            return AnalyzerOutcome::NoSignal(reason);
        }

        let response = self
            .client
            .get(&self.search_url)
            .bearer_auth(token)
            .query(&[
                ("query", "($SPY OR $BTC OR $NVDA OR $TSLA) -is:retweet"),
                ("max_results", "50"),
            ])
            .send()
            .await;

        let posts = match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<SearchResponse>().await {
                    Ok(body) => body.data,
                    Err(e) => return AnalyzerOutcome::Error(format!("malformed response: {e}")),
                }
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "social API rejected the scan");
                return AnalyzerOutcome::Error(format!("HTTP {}", resp.status()));
            }
            Err(e) => return AnalyzerOutcome::Error(format!("transport: {e}")),
        };

        if posts.is_empty() {
            return AnalyzerOutcome::NoSignal("no matching posts".to_string());
        }

        let (score, top_ticker) = score_posts(&posts);
        self.bus
            .publish(
                keys::SOCIAL_SCORE,
                serde_json::json!({ "score": score, "top_ticker": top_ticker }),
                SOURCE,
                score,
            )
            .await;

        AnalyzerOutcome::Success(Assessment {
            score: score * 100.0,
            signal: "Social Alpha".to_string(),
            reason: format!(
                "{} posts scored {score:.2}; top ticker {}",
                posts.len(),
                top_ticker.as_deref().unwrap_or("n/a")
            ),
            odds: SOCIAL_ODDS,
            extras: serde_json::json!({ "top_ticker": top_ticker, "post_count": posts.len() }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn post(text: &str, likes: u64, reposts: u64) -> SocialPost {
        SocialPost {
            text: text.to_string(),
            like_count: likes,
            repost_count: reposts,
        }
    }

    #[test]
    fn bullish_crowd_scores_high() {
        let posts = vec![
            post("$NVDA breakout incoming, loading calls", 50, 10),
            post("buy the dip on $NVDA", 5, 0),
        ];
        let (score, top) = score_posts(&posts);
        assert!(score > 0.9);
        assert_eq!(top.as_deref(), Some("NVDA"));
    }

    #[test]
    fn bearish_crowd_scores_low() {
        let posts = vec![post("$TSLA puts printing, dump it", 30, 5)];
        let (score, top) = score_posts(&posts);
        assert!(score < 0.1);
        assert_eq!(top.as_deref(), Some("TSLA"));
    }

    #[test]
    fn no_keywords_is_neutral() {
        let posts = vec![post("interesting chart on $SPY today", 3, 0)];
        let (score, _) = score_posts(&posts);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn engagement_weights_the_balance() {
        let posts = vec![
            post("buy $AAPL", 0, 0),       // weight 1
            post("sell $AAPL now", 99, 0), // weight 100
        ];
        let (score, _) = score_posts(&posts);
        assert!(score < 0.05);
    }

    #[test]
    fn cashtag_extraction_ignores_noise() {
        let posts = vec![post("$123 $TOOLONGTAG $ok $SPY $SPY", 0, 0)];
        let (_, top) = score_posts(&posts);
        assert_eq!(top.as_deref(), Some("SPY"));
    }

    #[tokio::test]
    async fn missing_token_is_no_signal() {
        let analyzer = SocialAnalyzer::new(Arc::new(IntelBus::disabled()), None, 100.0, 30);
        assert!(matches!(
            analyzer.analyze().await,
            AnalyzerOutcome::NoSignal(_)
        ));
    }

    #[test]
    fn budget_gate_blocks_after_ceiling() {
        let state = BudgetState {
            month: current_month(),
            total_spend: 99.8,
            last_scan: None,
        };
        let reason = gate_reason(
            &state,
            Instant::now(),
            &current_month(),
            100.0,
            Duration::from_secs(0),
        );
        assert!(reason.unwrap().contains("budget"));
    }

    #[test]
    fn frequency_gate_blocks_rapid_scans() {
        let state = BudgetState {
            month: current_month(),
            total_spend: 0.0,
            last_scan: Some(Instant::now()),
        };
        let reason = gate_reason(
            &state,
            Instant::now(),
            &current_month(),
            100.0,
            Duration::from_secs(1800),
        );
        assert!(reason.unwrap().contains("frequency"));
    }

    #[test]
    fn charge_accumulates_spend() {
        let analyzer = SocialAnalyzer::new(Arc::new(IntelBus::disabled()), None, 100.0, 0);
        assert!(analyzer.check_and_charge().is_ok());
        assert!((analyzer.total_spend() - COST_PER_SCAN).abs() < 1e-12);
    }
}
