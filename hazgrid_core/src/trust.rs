//! The "TRUST" layer - ephemeral identity rotation and neighbor trust scores.
//!
//! Every report from a connection supersedes its neighbor entry under a
//! freshly minted pseudonymous token. The trust score carries forward across
//! rotations (it belongs to the connection, not the token) and is
//! monotonically non-increasing: there is no rehabilitation policy.
//!
//! Erratic-behavior detection is a deterministic predicate over the latest
//! and prior report kinematics, pluggable behind [`AnomalyDetector`].

use crate::engine::ActorReport;
use crate::grid::{ConnectionId, EphemeralToken, Position, Role};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Default trust deduction per detected anomaly.
pub const DEFAULT_TRUST_PENALTY: f64 = 0.1;

/// A detected kinematic or cadence anomaly in a connection's reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anomaly {
    /// Reported scalar speed above the plausibility ceiling
    ImplausibleSpeed {
        /// Magnitude reported, m/s
        reported_mps: f64,
    },

    /// Implied speed between consecutive reports above the teleport ceiling
    PositionJump {
        /// Metric displacement over elapsed time, m/s
        implied_mps: f64,
    },

    /// Consecutive reports closer together than the minimum interval
    /// (non-increasing timestamps included)
    ReportFlood {
        /// Elapsed time between the two reports, seconds
        interval_secs: f64,
    },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::ImplausibleSpeed { reported_mps } => {
                write!(f, "implausible speed {reported_mps:.1} m/s")
            }
            Anomaly::PositionJump { implied_mps } => {
                write!(f, "position jump at {implied_mps:.1} m/s")
            }
            Anomaly::ReportFlood { interval_secs } => {
                write!(f, "report flood ({interval_secs:.3}s interval)")
            }
        }
    }
}

/// Predicate over a connection's prior entry and its latest report.
///
/// Implementations must be deterministic: the same (prior, report) pair
/// always yields the same verdict.
pub trait AnomalyDetector: Send + Sync {
    /// Returns the anomaly this report exhibits, if any.
    fn inspect(&self, prior: &NeighborEntry, report: &ActorReport) -> Option<Anomaly>;
}

/// Default detector over reported and implied kinematics.
#[derive(Debug, Clone)]
pub struct KinematicAnomalyDetector {
    /// Maximum plausible reported speed, m/s
    pub max_speed_mps: f64,

    /// Maximum plausible implied speed between consecutive reports, m/s
    pub max_jump_mps: f64,

    /// Minimum interval between consecutive reports, seconds
    pub min_report_interval_secs: f64,
}

impl Default for KinematicAnomalyDetector {
    fn default() -> Self {
        Self {
            max_speed_mps: 70.0,             // ~250 km/h
            max_jump_mps: 120.0,             // displacement faster than any road actor
            min_report_interval_secs: 0.05,  // 20 Hz cadence ceiling
        }
    }
}

impl AnomalyDetector for KinematicAnomalyDetector {
    fn inspect(&self, prior: &NeighborEntry, report: &ActorReport) -> Option<Anomaly> {
        if report.speed.abs() > self.max_speed_mps {
            return Some(Anomaly::ImplausibleSpeed {
                reported_mps: report.speed,
            });
        }

        let dt = report.timestamp - prior.timestamp;
        if dt < self.min_report_interval_secs {
            return Some(Anomaly::ReportFlood { interval_secs: dt });
        }

        let implied_mps = prior.position.distance_meters(&report.position()) / dt;
        if implied_mps > self.max_jump_mps {
            return Some(Anomaly::PositionJump { implied_mps });
        }

        None
    }
}

/// Current entry for one (connection, token) pair.
///
/// Superseded - old token discarded, new entry created - every time the
/// owning connection reports.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    /// Token this entry is published under
    pub token: EphemeralToken,

    /// Vulnerability class as of the latest report
    pub role: Role,

    /// Latest reported coordinate
    pub position: Position,

    /// Latest reported scalar speed, m/s
    pub speed: f64,

    /// Latest report timestamp, seconds since epoch
    pub timestamp: f64,

    /// Confidence in this connection's reported kinematics, [0, 1]
    pub trust_score: f64,
}

/// Outcome of one identity rotation.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    /// Fresh token to attach to the report
    pub token: EphemeralToken,

    /// Trust score after any penalty
    pub trust_score: f64,

    /// Anomaly that triggered a penalty, if any
    pub anomaly: Option<Anomaly>,
}

/// The neighbor table: connection identity to rotating token and trust score.
pub struct NeighborLedger {
    entries: Mutex<HashMap<ConnectionId, NeighborEntry>>,
    detector: Box<dyn AnomalyDetector>,
    penalty: f64,
}

impl NeighborLedger {
    /// Creates a ledger with the given penalty and detector.
    pub fn new(penalty: f64, detector: Box<dyn AnomalyDetector>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            detector,
            penalty,
        }
    }

    /// Rotates the connection's identity for one report.
    ///
    /// Unconditionally mints a fresh token and supersedes the prior entry.
    /// Trust carries forward from the prior entry (1.0 on first report),
    /// minus the penalty when the detector flags the report, clamped to
    /// [0, 1].
    pub fn rotate(&self, report: &ActorReport) -> Rotation {
        let token = EphemeralToken::mint();
        let mut entries = self.entries.lock();

        let (trust_score, anomaly) = match entries.get(&report.connection_id) {
            Some(prior) => match self.detector.inspect(prior, report) {
                Some(anomaly) => {
                    let penalized = (prior.trust_score - self.penalty).clamp(0.0, 1.0);
                    warn!(
                        connection = %report.connection_id,
                        %anomaly,
                        trust = penalized,
                        "trust penalty applied"
                    );
                    (penalized, Some(anomaly))
                }
                None => (prior.trust_score, None),
            },
            None => (1.0, None),
        };

        entries.insert(
            report.connection_id,
            NeighborEntry {
                token,
                role: report.role,
                position: report.position(),
                speed: report.speed,
                timestamp: report.timestamp,
                trust_score,
            },
        );

        Rotation {
            token,
            trust_score,
            anomaly,
        }
    }

    /// Current trust score of a connection, if it has ever reported.
    pub fn trust_of(&self, connection_id: ConnectionId) -> Option<f64> {
        self.entries.lock().get(&connection_id).map(|e| e.trust_score)
    }

    /// Drops a connection's entry (transport disconnect).
    pub fn forget(&self, connection_id: ConnectionId) -> bool {
        self.entries.lock().remove(&connection_id).is_some()
    }

    /// Number of connections currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no connection has reported yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
