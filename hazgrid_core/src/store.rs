//! The "STORE" layer - per-tile occupant maps under per-tile locks.
//!
//! The tile arena maps `TileKey -> Arc<Mutex<HazardTile>>` so that reports
//! against different tiles proceed in parallel while reports to the same
//! tile serialize on that tile's lock. The outer map lock is only ever held
//! to look up or create a handle, never while a tile lock is held, so no
//! two tile locks are taken at once.
//!
//! Occupancy is replace-by-`ConnectionId`: a connection has at most one live
//! snapshot across all tiles, tracked by the location index. Finding the
//! index and a tile's occupant map in disagreement is an invariant violation
//! surfaced to the caller, never silently ignored.

use crate::grid::{ActorSnapshot, ConnectionId, TileKey};
use crate::risk;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// The location index and a tile's occupant map disagree about a connection.
///
/// Must never occur under the store's own upsert discipline; fatal to the
/// affected tile's state if detected.
#[derive(Debug, Clone, Error)]
#[error("connection {connection_id} recorded in tile {tile_key} but absent from its occupant map")]
pub struct OccupancyViolation {
    pub connection_id: ConnectionId,
    pub tile_key: TileKey,
}

/// One grid cell's live state: current occupants and cached risk score.
#[derive(Debug)]
pub struct HazardTile {
    /// This tile's key
    pub key: TileKey,

    /// Current occupants, one live entry per connection
    occupants: HashMap<ConnectionId, ActorSnapshot>,

    /// Cached risk score, valid as of the last recompute
    pub risk_score: f64,

    /// When the occupant map last became empty (eviction grace timer)
    empty_since: Option<Instant>,
}

impl HazardTile {
    fn new(key: TileKey) -> Self {
        Self {
            key,
            occupants: HashMap::new(),
            risk_score: 0.0,
            empty_since: None,
        }
    }

    /// Value copies of the current occupants.
    pub fn snapshots(&self) -> Vec<ActorSnapshot> {
        self.occupants.values().cloned().collect()
    }

    /// Number of current occupants.
    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }
}

/// Result of placing one snapshot: the affected tile's broadcastable view.
#[derive(Debug, Clone)]
pub struct Placement {
    /// Tile the snapshot now occupies
    pub tile_key: TileKey,

    /// Value copies of that tile's occupants after the upsert
    pub occupants: Vec<ActorSnapshot>,

    /// Risk score recomputed over those occupants
    pub risk_score: f64,
}

/// Aggregate counts over the tile arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    /// Tiles currently allocated (occupied or within eviction grace)
    pub tiles: usize,

    /// Live occupant snapshots across all tiles
    pub occupants: usize,

    /// Tiles currently empty and awaiting sweep
    pub empty_tiles: usize,
}

/// Arena of independently lockable hazard tiles.
pub struct TileStore {
    tiles: RwLock<HashMap<TileKey, Arc<Mutex<HazardTile>>>>,
    locations: Mutex<HashMap<ConnectionId, TileKey>>,
}

impl TileStore {
    pub fn new() -> Self {
        Self {
            tiles: RwLock::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
        }
    }

    /// Places a snapshot into its tile, migrating it out of any previous
    /// tile first, and recomputes the target tile's risk score.
    ///
    /// Only the target tile is rescored; a departed tile keeps its cached
    /// score (zeroed once empty) until its next report.
    pub fn place(
        &self,
        tile_key: TileKey,
        snapshot: ActorSnapshot,
        ttc_threshold_secs: f64,
    ) -> Result<Placement, OccupancyViolation> {
        let connection_id = snapshot.connection_id;

        let previous = self.locations.lock().insert(connection_id, tile_key);
        if let Some(prev_key) = previous {
            if prev_key != tile_key {
                self.evict_from(prev_key, connection_id)?;
                debug!(connection = %connection_id, from = %prev_key, to = %tile_key, "tile migration");
            }
        }

        let handle = self.handle_for(tile_key);
        let mut tile = handle.lock();
        tile.occupants.insert(connection_id, snapshot);
        tile.empty_since = None;

        let occupants = tile.snapshots();
        tile.risk_score = risk::tile_risk(&occupants, ttc_threshold_secs);

        Ok(Placement {
            tile_key,
            occupants,
            risk_score: tile.risk_score,
        })
    }

    /// Removes a connection's snapshot entirely (transport disconnect).
    ///
    /// Returns the tile it left, if it occupied one.
    pub fn remove(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<TileKey>, OccupancyViolation> {
        let previous = self.locations.lock().remove(&connection_id);
        match previous {
            Some(tile_key) => {
                self.evict_from(tile_key, connection_id)?;
                Ok(Some(tile_key))
            }
            None => Ok(None),
        }
    }

    /// Value copies of a tile's current occupants; empty for unknown keys.
    pub fn occupants_of(&self, tile_key: TileKey) -> Vec<ActorSnapshot> {
        match self.existing_handle(tile_key) {
            Some(handle) => handle.lock().snapshots(),
            None => Vec::new(),
        }
    }

    /// Destroys tiles that have been empty for longer than the grace period.
    ///
    /// Returns the number of tiles collected.
    pub fn sweep_empty(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut tiles = self.tiles.write();
        let before = tiles.len();
        tiles.retain(|_, handle| {
            let tile = handle.lock();
            !(tile.occupants.is_empty()
                && tile
                    .empty_since
                    .is_some_and(|since| now.duration_since(since) >= grace))
        });
        before - tiles.len()
    }

    /// Aggregate counts over the arena.
    pub fn stats(&self) -> StoreStats {
        let tiles = self.tiles.read();
        let mut stats = StoreStats {
            tiles: tiles.len(),
            ..StoreStats::default()
        };
        for handle in tiles.values() {
            let tile = handle.lock();
            stats.occupants += tile.occupant_count();
            if tile.occupant_count() == 0 {
                stats.empty_tiles += 1;
            }
        }
        stats
    }

    fn evict_from(
        &self,
        tile_key: TileKey,
        connection_id: ConnectionId,
    ) -> Result<(), OccupancyViolation> {
        let handle = self
            .existing_handle(tile_key)
            .ok_or(OccupancyViolation {
                connection_id,
                tile_key,
            })?;
        let mut tile = handle.lock();
        if tile.occupants.remove(&connection_id).is_none() {
            return Err(OccupancyViolation {
                connection_id,
                tile_key,
            });
        }
        if tile.occupants.is_empty() {
            tile.risk_score = 0.0;
            tile.empty_since = Some(Instant::now());
        }
        Ok(())
    }

    fn handle_for(&self, tile_key: TileKey) -> Arc<Mutex<HazardTile>> {
        if let Some(handle) = self.tiles.read().get(&tile_key) {
            return handle.clone();
        }
        self.tiles
            .write()
            .entry(tile_key)
            .or_insert_with(|| Arc::new(Mutex::new(HazardTile::new(tile_key))))
            .clone()
    }

    fn existing_handle(&self, tile_key: TileKey) -> Option<Arc<Mutex<HazardTile>>> {
        self.tiles.read().get(&tile_key).cloned()
    }
}

impl Default for TileStore {
    fn default() -> Self {
        Self::new()
    }
}
