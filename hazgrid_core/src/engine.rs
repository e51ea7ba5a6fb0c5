//! The update pipeline - one actor report end to end.
//!
//! Each report runs Received -> Placed -> Scored -> Logged -> Broadcastable
//! synchronously and at-most-once: identity rotation, tile placement (with
//! migration out of any previous tile), affected-tile risk recompute,
//! history append, and finally the broadcastable tile view. A well-formed
//! report always reaches the terminal state; a malformed one is rejected
//! before any state mutation.

use crate::grid::{ActorSnapshot, ConnectionId, Position, Role, TileKey, DEFAULT_CELL_SIZE_DEG};
use crate::history::{RiskHistory, DEFAULT_HISTORY_CAPACITY};
use crate::risk::{self, Ttc, DEFAULT_TTC_THRESHOLD_SECS};
use crate::store::{OccupancyViolation, StoreStats, TileStore};
use crate::trust::{
    AnomalyDetector, KinematicAnomalyDetector, NeighborLedger, DEFAULT_TRUST_PENALTY,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Engine processing errors.
///
/// Queries against unknown tile keys are not errors: they read as empty
/// history and a never-converging prediction.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; rejected with no state change
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Occupancy bookkeeping corruption; fatal to the affected tile's state
    #[error("internal invariant violation: {0}")]
    InvariantViolation(#[from] OccupancyViolation),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tile edge length in degrees (default: 0.01)
    pub cell_size_deg: f64,

    /// TTC threshold below which a pair contributes risk, seconds (default: 5)
    pub ttc_threshold_secs: f64,

    /// Risk scores retained per tile (default: 100)
    pub history_capacity: usize,

    /// Trust deduction per detected anomaly (default: 0.1)
    pub trust_penalty: f64,

    /// How long a tile may sit empty before the sweep destroys it
    pub empty_tile_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cell_size_deg: DEFAULT_CELL_SIZE_DEG,
            ttc_threshold_secs: DEFAULT_TTC_THRESHOLD_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            trust_penalty: DEFAULT_TRUST_PENALTY,
            empty_tile_grace: Duration::from_secs(30),
        }
    }
}

/// One inbound actor report, already authenticated by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorReport {
    /// Stable transport identity
    pub connection_id: ConnectionId,

    /// Vulnerability class, trusted as asserted
    pub role: Role,

    /// Latitude in degrees
    pub lat: f64,

    /// Longitude in degrees
    pub lon: f64,

    /// Scalar speed in m/s
    pub speed: f64,

    /// Report timestamp, seconds since epoch
    pub timestamp: f64,
}

impl ActorReport {
    /// The reported coordinate.
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lon)
    }
}

/// Broadcastable view of one tile after a processed report.
#[derive(Debug, Clone, Serialize)]
pub struct TileUpdate {
    /// Affected tile
    pub tile_key: TileKey,

    /// Value copies of the tile's current occupants
    pub occupants: Vec<ActorSnapshot>,

    /// Risk score over those occupants
    pub risk_score: f64,
}

/// Response to an explicit minimum-TTC prediction request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TtcPrediction {
    /// Queried tile
    pub tile_key: TileKey,

    /// Minimum pairwise TTC over its current occupants
    pub ttc: Ttc,
}

/// Response to a tile history request, scores oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct TileHistorySnapshot {
    /// Queried tile
    pub tile_key: TileKey,

    /// Retained risk scores, oldest first
    pub scores: Vec<f64>,
}

/// Aggregate engine counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Tile arena counts
    pub store: StoreStats,

    /// Connections currently tracked by the ledger
    pub tracked_connections: usize,

    /// Tiles with a history log
    pub history_tiles: usize,
}

/// The hazard tile risk engine.
///
/// Safe to share across report-processing tasks: the store serializes
/// same-tile work on per-tile locks, and the ledger and history guard their
/// own maps. No lock is held across I/O.
pub struct HazardEngine {
    config: EngineConfig,
    ledger: NeighborLedger,
    store: TileStore,
    history: RiskHistory,
}

impl HazardEngine {
    /// Creates an engine with the default kinematic anomaly detector.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_detector(config, Box::new(KinematicAnomalyDetector::default()))
    }

    /// Creates an engine with a custom anomaly detector.
    pub fn with_detector(config: EngineConfig, detector: Box<dyn AnomalyDetector>) -> Self {
        let ledger = NeighborLedger::new(config.trust_penalty, detector);
        let history = RiskHistory::new(config.history_capacity);
        Self {
            config,
            ledger,
            store: TileStore::new(),
            history,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processes one actor report end to end.
    ///
    /// Returns the broadcastable tile view. `InvalidReport` leaves all state
    /// untouched; an invariant violation is logged for operator attention
    /// and surfaced.
    pub fn process_report(&self, report: ActorReport) -> Result<TileUpdate, EngineError> {
        validate(&report)?;

        let rotation = self.ledger.rotate(&report);
        let tile_key = TileKey::for_position(report.position(), self.config.cell_size_deg);

        let snapshot = ActorSnapshot {
            connection_id: report.connection_id,
            token: rotation.token,
            role: report.role,
            position: report.position(),
            speed: report.speed,
            timestamp: report.timestamp,
        };

        let placement = self
            .store
            .place(tile_key, snapshot, self.config.ttc_threshold_secs)
            .map_err(|violation| {
                error!(%violation, "occupancy bookkeeping corrupted");
                violation
            })?;

        self.history.append(tile_key, placement.risk_score);

        debug!(
            tile = %tile_key,
            occupants = placement.occupants.len(),
            risk = placement.risk_score,
            trust = rotation.trust_score,
            "report processed"
        );

        Ok(TileUpdate {
            tile_key: placement.tile_key,
            occupants: placement.occupants,
            risk_score: placement.risk_score,
        })
    }

    /// Minimum-TTC prediction over a tile's current occupants.
    ///
    /// Read-only; unknown tiles predict `Never`.
    pub fn predict_min_ttc(&self, tile_key: TileKey) -> TtcPrediction {
        TtcPrediction {
            tile_key,
            ttc: risk::min_ttc(&self.store.occupants_of(tile_key)),
        }
    }

    /// A tile's retained risk scores, oldest first; empty for unknown keys.
    pub fn history_of(&self, tile_key: TileKey) -> TileHistorySnapshot {
        TileHistorySnapshot {
            tile_key,
            scores: self.history.history_of(tile_key),
        }
    }

    /// Mean retained risk score for a tile, for trend consumers.
    pub fn mean_risk_of(&self, tile_key: TileKey) -> Option<f64> {
        self.history.mean_of(tile_key)
    }

    /// Current trust score of a connection, if it has ever reported.
    pub fn trust_of(&self, connection_id: ConnectionId) -> Option<f64> {
        self.ledger.trust_of(connection_id)
    }

    /// Clears a disconnected connection: its tile snapshot and ledger entry.
    ///
    /// Returns the tile it vacated, if any.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Result<Option<TileKey>, EngineError> {
        let vacated = self.store.remove(connection_id)?;
        self.ledger.forget(connection_id);
        if let Some(tile_key) = vacated {
            debug!(connection = %connection_id, tile = %tile_key, "connection disconnected");
        }
        Ok(vacated)
    }

    /// Destroys tiles empty for longer than the configured grace period.
    pub fn sweep_empty_tiles(&self) -> usize {
        self.store.sweep_empty(self.config.empty_tile_grace)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            tracked_connections: self.ledger.len(),
            history_tiles: self.history.tile_count(),
        }
    }
}

fn validate(report: &ActorReport) -> Result<(), EngineError> {
    if !report.lat.is_finite() || !(-90.0..=90.0).contains(&report.lat) {
        return Err(EngineError::InvalidReport(format!(
            "latitude out of range: {}",
            report.lat
        )));
    }
    if !report.lon.is_finite() || !(-180.0..=180.0).contains(&report.lon) {
        return Err(EngineError::InvalidReport(format!(
            "longitude out of range: {}",
            report.lon
        )));
    }
    if !report.speed.is_finite() {
        return Err(EngineError::InvalidReport(format!(
            "speed not finite: {}",
            report.speed
        )));
    }
    if !report.timestamp.is_finite() {
        return Err(EngineError::InvalidReport(format!(
            "timestamp not finite: {}",
            report.timestamp
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn report(conn: ConnectionId, role: Role, lat: f64, lon: f64, speed: f64) -> ActorReport {
        ActorReport {
            connection_id: conn,
            role,
            lat,
            lon,
            speed,
            timestamp: 100.0,
        }
    }

    #[test]
    fn test_malformed_report_mutates_nothing() {
        let engine = HazardEngine::new(EngineConfig::default());
        let conn = ConnectionId::new();

        for bad in [
            report(conn, Role::Walker, f64::NAN, 0.0, 1.0),
            report(conn, Role::Walker, 91.0, 0.0, 1.0),
            report(conn, Role::Walker, 0.0, -181.0, 1.0),
            report(conn, Role::Walker, 0.0, 0.0, f64::INFINITY),
        ] {
            assert!(matches!(
                engine.process_report(bad),
                Err(EngineError::InvalidReport(_))
            ));
        }

        let stats = engine.stats();
        assert_eq!(stats.store.tiles, 0);
        assert_eq!(stats.tracked_connections, 0);
        assert_eq!(stats.history_tiles, 0);
        assert!(engine.trust_of(conn).is_none());
    }

    #[test]
    fn test_single_occupant_scores_zero_and_logs_it() {
        let engine = HazardEngine::new(EngineConfig::default());
        let update = engine
            .process_report(report(ConnectionId::new(), Role::Cyclist, 0.001, 0.001, 4.0))
            .unwrap();

        assert_eq!(update.risk_score, 0.0);
        assert_eq!(update.occupants.len(), 1);
        assert_eq!(engine.history_of(update.tile_key).scores, vec![0.0]);
    }

    #[test]
    fn test_walker_vehicle_pair_scores_four() {
        let engine = HazardEngine::new(EngineConfig::default());

        engine
            .process_report(report(ConnectionId::new(), Role::Walker, 0.0, 0.0, 0.0))
            .unwrap();
        let update = engine
            .process_report(report(ConnectionId::new(), Role::Vehicle, 0.0001, 0.0, 5.0))
            .unwrap();

        assert_relative_eq!(update.risk_score, 4.0);
        assert_eq!(update.occupants.len(), 2);
        assert_eq!(engine.history_of(update.tile_key).scores, vec![0.0, 4.0]);
    }

    #[test]
    fn test_tokens_rotate_across_reports() {
        let engine = HazardEngine::new(EngineConfig::default());
        let conn = ConnectionId::new();

        let first = engine
            .process_report(report(conn, Role::Walker, 0.001, 0.001, 1.0))
            .unwrap();
        let mut second = report(conn, Role::Walker, 0.001, 0.001, 1.0);
        second.timestamp = 101.0;
        let second = engine.process_report(second).unwrap();

        assert_ne!(first.occupants[0].token, second.occupants[0].token);
        // Still exactly one occupant entry for the connection
        assert_eq!(second.occupants.len(), 1);
    }

    #[test]
    fn test_migration_through_the_pipeline() {
        let engine = HazardEngine::new(EngineConfig::default());
        let conn = ConnectionId::new();

        let first = engine
            .process_report(report(conn, Role::Vehicle, 0.001, 0.001, 5.0))
            .unwrap();
        let mut moved = report(conn, Role::Vehicle, 0.05, 0.001, 5.0);
        moved.timestamp = 101.0;
        let second = engine.process_report(moved).unwrap();

        assert_ne!(first.tile_key, second.tile_key);
        assert!(engine.predict_min_ttc(first.tile_key).ttc.seconds().is_none());
        assert_eq!(engine.stats().store.occupants, 1);
    }

    #[test]
    fn test_unknown_tile_queries_read_empty() {
        let engine = HazardEngine::new(EngineConfig::default());
        let key = TileKey {
            lat_idx: 999,
            lon_idx: 999,
        };

        assert_eq!(engine.predict_min_ttc(key).ttc, Ttc::Never);
        assert!(engine.history_of(key).scores.is_empty());
        assert!(engine.mean_risk_of(key).is_none());
    }

    #[test]
    fn test_prediction_does_not_mutate_state() {
        let engine = HazardEngine::new(EngineConfig::default());
        let update = engine
            .process_report(report(ConnectionId::new(), Role::Walker, 0.001, 0.001, 0.0))
            .unwrap();

        let before = engine.stats();
        engine.predict_min_ttc(update.tile_key);
        let after = engine.stats();
        assert_eq!(before.store.tiles, after.store.tiles);
        assert_eq!(
            engine.history_of(update.tile_key).scores.len(),
            1 // prediction appended nothing
        );
    }

    #[test]
    fn test_disconnect_clears_snapshot_and_ledger() {
        let engine = HazardEngine::new(EngineConfig::default());
        let conn = ConnectionId::new();

        let update = engine
            .process_report(report(conn, Role::Cyclist, 0.001, 0.001, 4.0))
            .unwrap();
        let vacated = engine.disconnect(conn).unwrap();

        assert_eq!(vacated, Some(update.tile_key));
        assert!(engine.trust_of(conn).is_none());
        assert_eq!(engine.stats().store.occupants, 0);
    }

    #[test]
    fn test_mean_risk_tracks_history() {
        let engine = HazardEngine::new(EngineConfig::default());
        let walker = ConnectionId::new();

        let update = engine
            .process_report(report(walker, Role::Walker, 0.0, 0.0, 0.0))
            .unwrap();
        engine
            .process_report(report(ConnectionId::new(), Role::Vehicle, 0.0001, 0.0, 5.0))
            .unwrap();

        // history: [0.0, 4.0]
        assert_relative_eq!(engine.mean_risk_of(update.tile_key).unwrap(), 2.0);
    }
}
