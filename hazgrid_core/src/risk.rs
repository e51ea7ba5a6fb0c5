//! The "RISK" layer - pairwise time-to-collision and per-tile risk scoring.
//!
//! The model is deliberately simple: scalar speeds, planar degree distance,
//! constant relative velocity. A pair with zero speed difference never
//! converges under this model, which is represented as an explicit `Ttc::Never`
//! rather than a floating-point infinity so comparisons and serialization
//! stay well-defined.
//!
//! Both entry points are O(n²) over a tile's occupants. That is a scaling
//! constraint of the design: physical cell size bounds occupancy, and only
//! the affected tile is ever recomputed on a report.

use crate::grid::ActorSnapshot;
use serde::{Deserialize, Serialize};

/// Default TTC threshold below which a pair contributes risk, in seconds.
pub const DEFAULT_TTC_THRESHOLD_SECS: f64 = 5.0;

/// Time to collision between two actors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ttc {
    /// The pair converges in this many seconds
    Seconds(f64),

    /// Zero relative speed: the separation is static and never closes
    Never,
}

impl Ttc {
    /// Returns the converging value, if any.
    pub fn seconds(&self) -> Option<f64> {
        match self {
            Ttc::Seconds(s) => Some(*s),
            Ttc::Never => None,
        }
    }

    /// True when the pair is under the given threshold.
    pub fn is_under(&self, threshold_secs: f64) -> bool {
        matches!(self, Ttc::Seconds(s) if *s < threshold_secs)
    }
}

/// Estimated time until two actors' separation reaches zero.
///
/// Planar degree distance divided by the absolute scalar speed difference.
/// Returns [`Ttc::Never`] when the speed difference is exactly zero.
pub fn time_to_collision(a: &ActorSnapshot, b: &ActorSnapshot) -> Ttc {
    let dv = (b.speed - a.speed).abs();
    if dv == 0.0 {
        return Ttc::Never;
    }
    Ttc::Seconds(a.position.separation_deg(&b.position) / dv)
}

/// Aggregate risk score for one tile's current occupants.
///
/// For every unordered pair under the TTC threshold, the candidate risk is
/// the sum of the two role priorities; the tile's score is the maximum
/// candidate, or 0 when no pair qualifies or fewer than two actors occupy
/// the tile.
pub fn tile_risk(snapshots: &[ActorSnapshot], ttc_threshold_secs: f64) -> f64 {
    let mut max_risk = 0.0f64;
    for i in 0..snapshots.len() {
        for j in (i + 1)..snapshots.len() {
            let ttc = time_to_collision(&snapshots[i], &snapshots[j]);
            if ttc.is_under(ttc_threshold_secs) {
                let risk =
                    f64::from(snapshots[i].role.priority() + snapshots[j].role.priority());
                if risk > max_risk {
                    max_risk = risk;
                }
            }
        }
    }
    max_risk
}

/// Minimum pairwise TTC across a tile's current occupants.
///
/// Pairs with zero relative speed are ignored; [`Ttc::Never`] when no pair
/// converges. This is the on-demand prediction query - unlike the scorer it
/// selects the minimum and carries no threshold.
pub fn min_ttc(snapshots: &[ActorSnapshot]) -> Ttc {
    let mut min: Option<f64> = None;
    for i in 0..snapshots.len() {
        for j in (i + 1)..snapshots.len() {
            if let Ttc::Seconds(ttc) = time_to_collision(&snapshots[i], &snapshots[j]) {
                min = Some(match min {
                    Some(m) if m <= ttc => m,
                    _ => ttc,
                });
            }
        }
    }
    match min {
        Some(s) => Ttc::Seconds(s),
        None => Ttc::Never,
    }
}
