// =============================================================================
// Broker Router — picks a venue adapter per request by symbol and wall-clock
// =============================================================================
//
// Routing rules, evaluated in order:
//   1. Routing disabled            -> primary broker, always.
//   2. Crypto symbol               -> crypto venue.
//   3. Weekend                     -> primary.
//   4. US pre-market  [04:00-09:30 ET] -> extended-hours venue.
//   5. After-hours    [16:00-20:00 ET] -> extended-hours venue.
//   6. Regular hours  [09:30-16:00 ET] -> primary.
//
// The router owns one adapter instance per venue.  Health checks ping each
// initialized adapter with a lightweight balance call.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::types::VenuePosition;

pub struct BrokerRouter {
    adapters: HashMap<String, Arc<dyn BrokerAdapter>>,
    enabled: bool,
    primary: String,
    crypto_venue: String,
    extended_venue: String,
}

impl BrokerRouter {
    pub fn new(enabled: bool, primary: &str) -> Self {
        info!(enabled, primary, "broker router initialised");
        Self {
            adapters: HashMap::new(),
            enabled,
            primary: primary.to_string(),
            crypto_venue: "coinbase".to_string(),
            extended_venue: primary.to_string(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn BrokerAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Override the venue used for extended-hours equity flow.
    pub fn set_extended_venue(&mut self, name: &str) {
        self.extended_venue = name.to_string();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn primary(&self) -> Option<Arc<dyn BrokerAdapter>> {
        self.get(&self.primary)
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    /// Adapter name chosen for `symbol` at `now`.
    pub fn route_name(&self, symbol: &str, now: DateTime<Utc>) -> String {
        if !self.enabled {
            return self.primary.clone();
        }

        if is_crypto_symbol(symbol) {
            return self.crypto_venue.clone();
        }

        let eastern = now.with_timezone(&us_eastern_offset(now.date_naive()));
        if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) {
            return self.primary.clone();
        }

        let hhmm = eastern.hour() * 100 + eastern.minute();
        match hhmm {
            400..=929 => self.extended_venue.clone(),
            1600..=1959 => self.extended_venue.clone(),
            930..=1559 => self.primary.clone(),
            _ => self.primary.clone(),
        }
    }

    /// Resolve `symbol` to an adapter, falling back to the primary when the
    /// routed venue is not registered.
    pub fn route(&self, symbol: &str, now: DateTime<Utc>) -> Option<Arc<dyn BrokerAdapter>> {
        let name = self.route_name(symbol, now);
        match self.adapters.get(&name) {
            Some(a) => Some(a.clone()),
            None => {
                warn!(symbol, venue = %name, "routed venue not registered — falling back to primary");
                self.primary()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Health & aggregation
    // -------------------------------------------------------------------------

    /// Ping every registered adapter with a balance call.
    pub async fn check_health(&self) -> HashMap<String, bool> {
        let mut status = HashMap::new();
        for (name, adapter) in &self.adapters {
            let ok = adapter.get_buying_power().await.is_ok();
            status.insert(name.clone(), ok);
        }
        status
    }

    /// Positions aggregated across venues (primary only when routing is
    /// disabled).
    pub async fn aggregate_positions(&self) -> Vec<VenuePosition> {
        if !self.enabled {
            if let Some(primary) = self.primary() {
                return primary.get_positions().await.unwrap_or_default();
            }
            return Vec::new();
        }

        let mut all = Vec::new();
        for (name, adapter) in &self.adapters {
            match adapter.get_positions().await {
                Ok(mut positions) => all.append(&mut positions),
                Err(e) => warn!(venue = %name, error = %e, "position fetch failed"),
            }
        }
        all
    }
}

impl std::fmt::Debug for BrokerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRouter")
            .field("enabled", &self.enabled)
            .field("primary", &self.primary)
            .field("venues", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_crypto_symbol(symbol: &str) -> bool {
    let upper = symbol.to_uppercase();
    upper.ends_with("-USD")
        || upper.ends_with("USDT")
        || upper.starts_with("BTC")
        || upper.starts_with("ETH")
        || upper.starts_with("SOL")
}

/// UTC offset for US Eastern on `date`: −4 h during daylight saving
/// (second Sunday of March through the first Sunday of November), −5 h
/// otherwise.
pub(crate) fn us_eastern_offset(date: NaiveDate) -> FixedOffset {
    let year = date.year();
    let dst_start = nth_weekday(year, 3, Weekday::Sun, 2);
    let dst_end = nth_weekday(year, 11, Weekday::Sun, 1);

    let in_dst = date >= dst_start && date < dst_end;
    let hours = if in_dst { -4 } else { -5 };
    FixedOffset::east_opt(hours * 3600).expect("static offset in range")
}

/// The `n`-th `weekday` of `month` in `year`.
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first + chrono::Duration::days((offset + (n - 1) * 7) as i64)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn router() -> BrokerRouter {
        let mut r = BrokerRouter::new(true, "alpaca");
        r.set_extended_venue("alpaca");
        r
    }

    /// 2026-07-29 is a Wednesday; ET is UTC−4 (DST).
    fn summer_weekday(hour_et: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 29, hour_et + 4, minute, 0).unwrap()
    }

    #[test]
    fn disabled_router_always_primary() {
        let r = BrokerRouter::new(false, "alpaca");
        assert_eq!(r.route_name("BTC-USD", summer_weekday(12, 0)), "alpaca");
    }

    #[test]
    fn crypto_routes_to_crypto_venue() {
        let r = router();
        assert_eq!(r.route_name("BTC-USD", summer_weekday(12, 0)), "coinbase");
        assert_eq!(r.route_name("ETHUSDT", summer_weekday(2, 0)), "coinbase");
    }

    #[test]
    fn weekend_routes_to_primary() {
        let r = router();
        // 2026-08-01 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2026, 8, 1, 16, 0, 0).unwrap();
        assert_eq!(r.route_name("AAPL", saturday), "alpaca");
    }

    #[test]
    fn session_windows() {
        let mut r = router();
        r.set_extended_venue("extended");
        // Pre-market 08:00 ET.
        assert_eq!(r.route_name("AAPL", summer_weekday(8, 0)), "extended");
        // Regular hours 10:30 ET.
        assert_eq!(r.route_name("AAPL", summer_weekday(10, 30)), "alpaca");
        // After-hours 17:00 ET.
        assert_eq!(r.route_name("AAPL", summer_weekday(17, 0)), "extended");
        // Overnight 23:00 ET Wednesday = 03:00 UTC Thursday.
        let overnight = Utc.with_ymd_and_hms(2026, 7, 30, 3, 0, 0).unwrap();
        assert_eq!(r.route_name("AAPL", overnight), "alpaca");
    }

    #[test]
    fn session_boundaries() {
        let mut r = router();
        r.set_extended_venue("extended");
        // 09:29 ET is still pre-market, 09:30 is regular.
        assert_eq!(r.route_name("AAPL", summer_weekday(9, 29)), "extended");
        assert_eq!(r.route_name("AAPL", summer_weekday(9, 30)), "alpaca");
        // 16:00 ET starts after-hours.
        assert_eq!(r.route_name("AAPL", summer_weekday(16, 0)), "extended");
    }

    #[test]
    fn eastern_offset_tracks_dst() {
        // January: standard time (UTC−5).
        let winter = us_eastern_offset(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
        assert_eq!(winter.local_minus_utc(), -5 * 3600);
        // July: daylight time (UTC−4).
        let summer = us_eastern_offset(NaiveDate::from_ymd_opt(2026, 7, 15).unwrap());
        assert_eq!(summer.local_minus_utc(), -4 * 3600);
        // 2026 DST starts March 8 and ends November 1.
        assert_eq!(
            nth_weekday(2026, 3, Weekday::Sun, 2),
            NaiveDate::from_ymd_opt(2026, 3, 8).unwrap()
        );
        assert_eq!(
            nth_weekday(2026, 11, Weekday::Sun, 1),
            NaiveDate::from_ymd_opt(2026, 11, 1).unwrap()
        );
    }
}
