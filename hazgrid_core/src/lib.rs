//! HazGrid Core - Hazard Tile Risk Engine
//!
//! A single authoritative in-memory engine that ingests streaming
//! position/velocity reports from mobile actors, buckets them into a
//! geospatial grid, and continuously computes a collision-risk signal per
//! grid cell for real-time hazard broadcast:
//! 1. **Grid**: deterministic floor-quantized tile indexing
//! 2. **Risk**: pairwise time-to-collision scoring and min-TTC prediction
//! 3. **Trust**: per-report pseudonym rotation with a decaying trust score
//! 4. **Store/History**: per-tile locked occupancy plus a bounded risk log

pub mod engine;
pub mod grid;
pub mod history;
pub mod risk;
pub mod service;
pub mod store;
pub mod trust;

// Re-export key types for convenience
pub use engine::{
    ActorReport, EngineConfig, EngineError, HazardEngine, TileHistorySnapshot, TileUpdate,
    TtcPrediction,
};
pub use grid::{ActorSnapshot, ConnectionId, EphemeralToken, Position, Role, TileKey};
pub use risk::Ttc;
pub use service::{EngineHandle, EngineService};
pub use trust::{Anomaly, AnomalyDetector, KinematicAnomalyDetector};
