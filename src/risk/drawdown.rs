// =============================================================================
// Drawdown Monitor — per-strategy and portfolio peak tracking
// =============================================================================
//
// Every equity update records a new peak when applicable and recomputes
// `(peak − current) / peak`.  Crossing the threshold emits a halt reason;
// acting on it is the caller's job (the playbook observer records it, the
// kill switch enforces it).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

/// Default halt threshold: 15 % off the peak.
pub const DEFAULT_DRAWDOWN_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone, Serialize)]
pub struct DrawdownState {
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown: f64,
    pub breached: bool,
}

struct Track {
    peak: f64,
    current: f64,
    max_drawdown: f64,
}

pub struct DrawdownMonitor {
    threshold: f64,
    tracks: RwLock<HashMap<String, Track>>,
}

impl DrawdownMonitor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Record an equity observation for `name` ("portfolio" or a strategy).
    ///
    /// Returns a halt reason when the drawdown from peak exceeds the
    /// threshold.
    pub fn update(&self, name: &str, equity: f64) -> Option<String> {
        if equity <= 0.0 {
            return None;
        }

        let mut tracks = self.tracks.write();
        let track = tracks.entry(name.to_string()).or_insert(Track {
            peak: equity,
            current: equity,
            max_drawdown: 0.0,
        });

        track.current = equity;
        if equity > track.peak {
            track.peak = equity;
        }

        let drawdown = (track.peak - equity) / track.peak;
        if drawdown > track.max_drawdown {
            track.max_drawdown = drawdown;
        }

        if drawdown > self.threshold {
            let reason = format!(
                "{name} drawdown {:.1}% exceeds {:.1}% threshold (peak {:.2}, current {:.2})",
                drawdown * 100.0,
                self.threshold * 100.0,
                track.peak,
                equity
            );
            warn!("{}", reason);
            return Some(reason);
        }
        None
    }

    /// Serialisable view of every tracked curve.
    pub fn snapshot(&self) -> HashMap<String, DrawdownState> {
        self.tracks
            .read()
            .iter()
            .map(|(name, t)| {
                let drawdown = if t.peak > 0.0 {
                    (t.peak - t.current) / t.peak
                } else {
                    0.0
                };
                (
                    name.clone(),
                    DrawdownState {
                        peak_equity: t.peak,
                        current_equity: t.current,
                        drawdown,
                        breached: drawdown > self.threshold,
                    },
                )
            })
            .collect()
    }
}

impl Default for DrawdownMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_DRAWDOWN_THRESHOLD)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_halt_within_threshold() {
        let monitor = DrawdownMonitor::new(0.15);
        assert!(monitor.update("portfolio", 1000.0).is_none());
        assert!(monitor.update("portfolio", 900.0).is_none()); // 10% down
    }

    #[test]
    fn halt_beyond_threshold() {
        let monitor = DrawdownMonitor::new(0.15);
        monitor.update("portfolio", 1000.0);
        let reason = monitor.update("portfolio", 840.0); // 16% down
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("portfolio"));
    }

    #[test]
    fn peak_ratchets_upward() {
        let monitor = DrawdownMonitor::new(0.15);
        monitor.update("momentum", 1000.0);
        monitor.update("momentum", 1200.0);
        // 1020 is only 15% off the new 1200 peak — exactly at threshold, no halt.
        assert!(monitor.update("momentum", 1020.0).is_none());
        assert!(monitor.update("momentum", 1019.0).is_some());
    }

    #[test]
    fn strategies_tracked_independently() {
        let monitor = DrawdownMonitor::new(0.15);
        monitor.update("a", 1000.0);
        monitor.update("b", 1000.0);
        assert!(monitor.update("a", 500.0).is_some());
        assert!(monitor.update("b", 990.0).is_none());

        let snap = monitor.snapshot();
        assert!(snap["a"].breached);
        assert!(!snap["b"].breached);
    }
}
