//! Rolling per-tile risk history for trend queries.

use crate::grid::TileKey;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Default number of risk scores retained per tile.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded FIFO log of past risk scores, one per tile key.
///
/// Created alongside a tile's first score; capped at the configured
/// capacity with the oldest entry evicted first. Unknown keys read as empty.
pub struct RiskHistory {
    capacity: usize,
    log: Mutex<HashMap<TileKey, VecDeque<f64>>>,
}

impl RiskHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a score to the tile's log, evicting the oldest past capacity.
    pub fn append(&self, tile_key: TileKey, score: f64) {
        let mut log = self.log.lock();
        let scores = log.entry(tile_key).or_default();
        scores.push_back(score);
        while scores.len() > self.capacity {
            scores.pop_front();
        }
    }

    /// Scores for a tile, oldest first.
    pub fn history_of(&self, tile_key: TileKey) -> Vec<f64> {
        self.log
            .lock()
            .get(&tile_key)
            .map(|scores| scores.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mean retained score for a tile; `None` for unknown keys.
    pub fn mean_of(&self, tile_key: TileKey) -> Option<f64> {
        let log = self.log.lock();
        let scores = log.get(&tile_key)?;
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Number of tiles with a history log.
    pub fn tile_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl Default for RiskHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn key() -> TileKey {
        TileKey {
            lat_idx: 12,
            lon_idx: -34,
        }
    }

    #[test]
    fn test_history_bounded_at_capacity() {
        let history = RiskHistory::default();
        for i in 0..150 {
            history.append(key(), f64::from(i));
        }

        let scores = history.history_of(key());
        assert_eq!(scores.len(), 100);
        // Exactly the last 100, oldest first
        assert_eq!(scores[0], 50.0);
        assert_eq!(scores[99], 149.0);
    }

    #[test]
    fn test_unknown_tile_reads_empty() {
        let history = RiskHistory::default();
        assert!(history.history_of(key()).is_empty());
        assert!(history.mean_of(key()).is_none());
    }

    #[test]
    fn test_mean_over_retained_scores() {
        let history = RiskHistory::new(10);
        for score in [0.0, 2.0, 4.0] {
            history.append(key(), score);
        }
        assert_relative_eq!(history.mean_of(key()).unwrap(), 2.0);
    }

    #[test]
    fn test_logs_are_per_tile() {
        let history = RiskHistory::default();
        let other = TileKey {
            lat_idx: 0,
            lon_idx: 0,
        };
        history.append(key(), 3.0);
        history.append(other, 5.0);

        assert_eq!(history.history_of(key()), vec![3.0]);
        assert_eq!(history.history_of(other), vec![5.0]);
        assert_eq!(history.tile_count(), 2);
    }
}
