//! The "GRID" layer - deterministic tile indexing and actor identity types.
//!
//! The world is bucketed into fixed-size lat/lon cells so that pairwise risk
//! computation stays bounded by physical cell size:
//! - `TileKey` quantizes a coordinate with floor division (negative
//!   coordinates bucket consistently instead of mirroring near zero)
//! - `ConnectionId` is the stable, transport-owned identity used for
//!   occupancy bookkeeping
//! - `EphemeralToken` is the rotating pseudonym that appears in outbound data

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WGS84 equatorial radius in meters.
const EARTH_RADIUS_M: f64 = 6378137.0;

/// Default tile edge length in degrees (~1.1 km of latitude).
pub const DEFAULT_CELL_SIZE_DEG: f64 = 0.01;

/// Stable identity of one transport connection.
///
/// Owned by the transport layer; the engine uses it only as the snapshot
/// identity for replace-on-upsert semantics. It never leaves the process in
/// outbound broadcasts' identity position - that is the ephemeral token's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Creates a new random ConnectionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a ConnectionId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic ConnectionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Per-report pseudonym replacing the durable identity in outward-facing data.
///
/// Minted fresh on every report, never derived from or reusable as the
/// previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EphemeralToken(pub Uuid);

impl EphemeralToken {
    /// Mints a fresh token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for EphemeralToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Actor vulnerability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Walker,
    Cyclist,
    Vehicle,
    Passenger,
}

impl Role {
    /// Fixed risk weight for this vulnerability class.
    ///
    /// Walkers are the most exposed; vehicle occupants the least.
    pub fn priority(self) -> u8 {
        match self {
            Role::Walker => 3,
            Role::Cyclist => 2,
            Role::Vehicle => 1,
            Role::Passenger => 2,
        }
    }
}

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees, [-90, 90]
    pub lat: f64,

    /// Longitude in degrees, [-180, 180]
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Planar Euclidean separation in degrees.
    ///
    /// This is the distance the TTC model is defined over; it is intentionally
    /// not a metric distance (see the risk module).
    pub fn separation_deg(&self, other: &Position) -> f64 {
        let dlat = other.lat - self.lat;
        let dlon = other.lon - self.lon;
        (dlat * dlat + dlon * dlon).sqrt()
    }

    /// Approximate metric distance in meters.
    ///
    /// Equirectangular approximation, valid for the local areas the trust
    /// layer compares consecutive reports over.
    pub fn distance_meters(&self, other: &Position) -> f64 {
        let mid_lat = ((self.lat + other.lat) / 2.0).to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let x = dlon * EARTH_RADIUS_M * mid_lat.cos();
        let y = dlat * EARTH_RADIUS_M;
        (x * x + y * y).sqrt()
    }
}

/// Key of one fixed-size grid cell.
///
/// Derived by quantizing (lat, lon) with floor division, truncated toward
/// negative infinity so that negative coordinates bucket consistently.
/// Deterministic and pure: equal inputs always produce equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    /// Quantized latitude index
    pub lat_idx: i64,

    /// Quantized longitude index
    pub lon_idx: i64,
}

impl TileKey {
    /// Indexes a position into its tile.
    ///
    /// Malformed (NaN/out-of-range) coordinates are rejected by report
    /// validation before reaching this function.
    pub fn for_position(position: Position, cell_size_deg: f64) -> Self {
        Self {
            lat_idx: (position.lat / cell_size_deg).floor() as i64,
            lon_idx: (position.lon / cell_size_deg).floor() as i64,
        }
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The wire format clients key their tile maps by
        write!(f, "{}_{}", self.lat_idx, self.lon_idx)
    }
}

/// The latest known state of one actor within one tile.
///
/// Invariant: at most one snapshot per `ConnectionId` across all tiles; a new
/// report for the same connection replaces its prior snapshot wherever it was.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSnapshot {
    /// Stable transport identity (occupancy bookkeeping only)
    pub connection_id: ConnectionId,

    /// Rotating pseudonym attached to this report
    pub token: EphemeralToken,

    /// Vulnerability class, trusted as asserted by the transport
    pub role: Role,

    /// Reported coordinate in degrees
    pub position: Position,

    /// Scalar speed in m/s (direction is not modeled)
    pub speed: f64,

    /// Report timestamp in seconds since epoch
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tile_key_deterministic() {
        let p = Position::new(40.7128, -74.0060);
        let a = TileKey::for_position(p, DEFAULT_CELL_SIZE_DEG);
        let b = TileKey::for_position(p, DEFAULT_CELL_SIZE_DEG);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tile_key_negative_coordinates_floor() {
        // Just below zero must land in cell -1, not mirror into cell 0
        let key = TileKey::for_position(Position::new(-0.005, -0.005), 0.01);
        assert_eq!(key.lat_idx, -1);
        assert_eq!(key.lon_idx, -1);

        let key = TileKey::for_position(Position::new(0.005, 0.005), 0.01);
        assert_eq!(key.lat_idx, 0);
        assert_eq!(key.lon_idx, 0);
    }

    #[test]
    fn test_tile_key_display_format() {
        let key = TileKey::for_position(Position::new(40.7128, -74.0060), 0.01);
        assert_eq!(key.to_string(), format!("{}_{}", key.lat_idx, key.lon_idx));
        assert_eq!(key.lat_idx, 4071);
        assert_eq!(key.lon_idx, -7401);
    }

    #[test]
    fn test_role_priorities() {
        assert_eq!(Role::Walker.priority(), 3);
        assert_eq!(Role::Cyclist.priority(), 2);
        assert_eq!(Role::Vehicle.priority(), 1);
        assert_eq!(Role::Passenger.priority(), 2);
    }

    #[test]
    fn test_ephemeral_tokens_never_repeat() {
        let a = EphemeralToken::mint();
        let b = EphemeralToken::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_id_from_seed_is_deterministic() {
        assert_eq!(ConnectionId::from_seed(7), ConnectionId::from_seed(7));
        assert_ne!(ConnectionId::from_seed(7), ConnectionId::from_seed(8));
    }

    #[test]
    fn test_distance_meters_latitude_degree() {
        // One degree of latitude is ~111 km everywhere
        let a = Position::new(0.0, 0.0);
        let b = Position::new(1.0, 0.0);
        let d = a.distance_meters(&b);
        assert!((d - 111_000.0).abs() < 1_000.0, "got {d}");
    }

    proptest! {
        #[test]
        fn prop_tile_key_idempotent(lat in -90.0f64..90.0, lon in -180.0f64..180.0) {
            let p = Position::new(lat, lon);
            prop_assert_eq!(
                TileKey::for_position(p, DEFAULT_CELL_SIZE_DEG),
                TileKey::for_position(p, DEFAULT_CELL_SIZE_DEG)
            );
        }

        #[test]
        fn prop_tile_key_sign_consistent(lat in -90.0f64..-0.0001, lon in 0.0001f64..180.0) {
            let key = TileKey::for_position(Position::new(lat, lon), DEFAULT_CELL_SIZE_DEG);
            prop_assert!(key.lat_idx < 0);
            prop_assert!(key.lon_idx >= 0);
        }
    }
}
