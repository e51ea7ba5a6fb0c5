//! SimWorld - deterministic synthetic actor population.
//!
//! Actors random-walk inside a small bounding box around a city center so a
//! handful of tiles stay busy. All movement derives from a single seed: the
//! same seed always produces the same report stream.

use hazgrid_core::{ActorReport, ConnectionId, Role};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Meters per degree of latitude (good enough for the walk geometry).
const METERS_PER_DEG: f64 = 111_320.0;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of well-behaved actors
    pub actors: usize,

    /// Number of rogue actors that teleport periodically
    pub rogues: usize,

    /// Reports per actor per second
    pub tick_rate_hz: u32,

    /// Center latitude of the bounding box
    pub center_lat: f64,

    /// Center longitude of the bounding box
    pub center_lon: f64,

    /// Half-width of the bounding box in degrees
    pub half_extent_deg: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            actors: 24,
            rogues: 2,
            tick_rate_hz: 10,
            center_lat: 40.7128,
            center_lon: -74.0060,
            half_extent_deg: 0.02,
        }
    }
}

/// One synthetic actor.
#[derive(Debug, Clone)]
pub struct SimActor {
    /// Stable transport identity
    pub connection_id: ConnectionId,

    /// Vulnerability class
    pub role: Role,

    lat: f64,
    lon: f64,
    speed_mps: f64,
    heading_rad: f64,
    rogue: bool,
}

impl SimActor {
    fn cruise_speed(role: Role, rng: &mut ChaCha8Rng) -> f64 {
        let base = match role {
            Role::Walker => 1.4,
            Role::Cyclist => 5.5,
            Role::Vehicle => 13.0,
            Role::Passenger => 13.0,
        };
        base * rng.gen_range(0.7..1.3)
    }
}

/// The deterministic actor population.
pub struct SimWorld {
    config: SimConfig,
    rng: ChaCha8Rng,
    actors: Vec<SimActor>,
    tick: u64,
    time_secs: f64,
}

impl SimWorld {
    /// Spawns the population from the configured seed.
    pub fn new(config: SimConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let roles = [Role::Walker, Role::Cyclist, Role::Vehicle, Role::Passenger];

        let total = config.actors + config.rogues;
        let mut actors = Vec::with_capacity(total);
        for i in 0..total {
            let role = roles[i % roles.len()];
            actors.push(SimActor {
                connection_id: ConnectionId::from_seed(config.seed.wrapping_add(i as u64)),
                role,
                lat: config.center_lat
                    + rng.gen_range(-config.half_extent_deg..config.half_extent_deg),
                lon: config.center_lon
                    + rng.gen_range(-config.half_extent_deg..config.half_extent_deg),
                speed_mps: SimActor::cruise_speed(role, &mut rng),
                heading_rad: rng.gen_range(0.0..std::f64::consts::TAU),
                rogue: i >= config.actors,
            });
        }

        Self {
            config,
            rng,
            actors,
            tick: 0,
            time_secs: 0.0,
        }
    }

    /// The population's stable identities.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.actors.iter().map(|a| a.connection_id).collect()
    }

    /// Advances one tick and returns every actor's report.
    pub fn step(&mut self) -> Vec<ActorReport> {
        let dt = 1.0 / f64::from(self.config.tick_rate_hz);
        self.tick += 1;
        self.time_secs += dt;

        let mut reports = Vec::with_capacity(self.actors.len());
        for actor in &mut self.actors {
            if actor.rogue && self.tick % 40 == 0 {
                // Teleport across the box; the trust layer should flag this
                actor.lat = self.config.center_lat
                    + self.rng.gen_range(-self.config.half_extent_deg..self.config.half_extent_deg);
                actor.lon = self.config.center_lon
                    + self.rng.gen_range(-self.config.half_extent_deg..self.config.half_extent_deg);
            } else {
                actor.heading_rad += self.rng.gen_range(-0.3..0.3);
                let step_deg = actor.speed_mps * dt / METERS_PER_DEG;
                actor.lat += actor.heading_rad.cos() * step_deg;
                actor.lon += actor.heading_rad.sin() * step_deg;

                // Bounce back into the box
                let lat_min = self.config.center_lat - self.config.half_extent_deg;
                let lat_max = self.config.center_lat + self.config.half_extent_deg;
                let lon_min = self.config.center_lon - self.config.half_extent_deg;
                let lon_max = self.config.center_lon + self.config.half_extent_deg;
                if actor.lat < lat_min || actor.lat > lat_max {
                    actor.lat = actor.lat.clamp(lat_min, lat_max);
                    actor.heading_rad = -actor.heading_rad;
                }
                if actor.lon < lon_min || actor.lon > lon_max {
                    actor.lon = actor.lon.clamp(lon_min, lon_max);
                    actor.heading_rad = std::f64::consts::PI - actor.heading_rad;
                }
            }

            reports.push(ActorReport {
                connection_id: actor.connection_id,
                role: actor.role,
                lat: actor.lat,
                lon: actor.lon,
                speed: actor.speed_mps,
                timestamp: self.time_secs,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = SimWorld::new(SimConfig::default());
        let mut b = SimWorld::new(SimConfig::default());

        for _ in 0..5 {
            let ra = a.step();
            let rb = b.step();
            for (x, y) in ra.iter().zip(rb.iter()) {
                assert_eq!(x.connection_id, y.connection_id);
                assert_eq!(x.lat, y.lat);
                assert_eq!(x.lon, y.lon);
                assert_eq!(x.speed, y.speed);
            }
        }
    }

    #[test]
    fn test_actors_stay_in_the_box() {
        let config = SimConfig::default();
        let mut world = SimWorld::new(config.clone());
        for _ in 0..200 {
            for report in world.step() {
                assert!((report.lat - config.center_lat).abs() <= config.half_extent_deg + 1e-9);
                assert!((report.lon - config.center_lon).abs() <= config.half_extent_deg + 1e-9);
            }
        }
    }

    #[test]
    fn test_population_size() {
        let config = SimConfig {
            actors: 10,
            rogues: 3,
            ..SimConfig::default()
        };
        let world = SimWorld::new(config);
        assert_eq!(world.connection_ids().len(), 13);
    }
}
