//! HazGrid simulator CLI
//!
//! Drives the risk engine end to end with a seeded synthetic population and
//! prints a JSON run summary.

mod world;

use clap::Parser;
use hazgrid_core::{
    EngineConfig, EngineService, HazardEngine, Position, TileKey, Ttc,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use world::{SimConfig, SimWorld};

#[derive(Debug, Parser)]
#[command(name = "hazgrid-sim", about = "Deterministic synthetic-actor harness for the HazGrid risk engine")]
struct Args {
    /// Master seed for the actor population
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of well-behaved actors
    #[arg(long, default_value_t = 24)]
    actors: usize,

    /// Number of rogue actors that teleport periodically
    #[arg(long, default_value_t = 2)]
    rogues: usize,

    /// Simulation length in ticks
    #[arg(long, default_value_t = 600)]
    ticks: u64,

    /// Reports per actor per second
    #[arg(long, default_value_t = 10)]
    tick_rate_hz: u32,

    /// Tile edge length in degrees
    #[arg(long, default_value_t = 0.01)]
    cell_size_deg: f64,

    /// TTC threshold in seconds
    #[arg(long, default_value_t = 5.0)]
    ttc_threshold_secs: f64,
}

/// End-of-run summary, printed as JSON.
#[derive(Debug, Serialize)]
struct RunSummary {
    seed: u64,
    ticks: u64,
    reports_sent: u64,
    updates_seen: u64,
    updates_lagged: u64,
    max_risk: f64,
    hot_tile: Option<String>,
    hot_tile_mean_risk: Option<f64>,
    tiles_live: usize,
    min_trust: f64,
    penalized_connections: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(seed = args.seed, actors = args.actors, rogues = args.rogues, "starting simulation");

    let engine = Arc::new(HazardEngine::new(EngineConfig {
        cell_size_deg: args.cell_size_deg,
        ttc_threshold_secs: args.ttc_threshold_secs,
        ..EngineConfig::default()
    }));
    let handle = EngineService::spawn(engine.clone());

    // Collect broadcasts concurrently with report ingest
    let mut updates = handle.subscribe();
    let collector = tokio::spawn(async move {
        let mut seen = 0u64;
        let mut lagged = 0u64;
        let mut max_risk = 0.0f64;
        let mut per_tile: HashMap<TileKey, u64> = HashMap::new();
        loop {
            match updates.recv().await {
                Ok(update) => {
                    seen += 1;
                    if update.risk_score > max_risk {
                        max_risk = update.risk_score;
                    }
                    if update.risk_score > 0.0 {
                        *per_tile.entry(update.tile_key).or_default() += 1;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    lagged += n;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        let hot_tile = per_tile
            .into_iter()
            .max_by_key(|(_, hits)| *hits)
            .map(|(key, _)| key);
        (seen, lagged, max_risk, hot_tile)
    });

    let mut sim = SimWorld::new(SimConfig {
        seed: args.seed,
        actors: args.actors,
        rogues: args.rogues,
        tick_rate_hz: args.tick_rate_hz,
        ..SimConfig::default()
    });
    let population = sim.connection_ids();

    let mut reports_sent = 0u64;
    let mut probe_tile = None;
    for tick in 1..=args.ticks {
        for report in sim.step() {
            probe_tile = Some(TileKey::for_position(
                Position::new(report.lat, report.lon),
                args.cell_size_deg,
            ));
            handle.report(report).await?;
            reports_sent += 1;
        }

        if tick % 100 == 0 {
            if let Some(tile_key) = probe_tile {
                let prediction = handle.predict_ttc(tile_key).await?;
                match prediction.ttc {
                    Ttc::Seconds(secs) => {
                        info!(tile = %tile_key, ttc_secs = secs, "min-TTC probe")
                    }
                    Ttc::Never => info!(tile = %tile_key, "min-TTC probe: never converges"),
                }
            }
        }
    }

    handle.shutdown().await;
    let (updates_seen, updates_lagged, max_risk, hot_tile) = collector.await?;
    let tiles_live = engine.stats().store.tiles;

    let mut min_trust = 1.0f64;
    let mut penalized = 0usize;
    for connection_id in &population {
        if let Some(trust) = engine.trust_of(*connection_id) {
            min_trust = min_trust.min(trust);
            if trust < 1.0 {
                penalized += 1;
            }
        }
    }
    if penalized == 0 && args.rogues > 0 {
        warn!("rogue actors were never penalized; check detector thresholds");
    }

    let summary = RunSummary {
        seed: args.seed,
        ticks: args.ticks,
        reports_sent,
        updates_seen,
        updates_lagged,
        max_risk,
        hot_tile: hot_tile.map(|key| key.to_string()),
        hot_tile_mean_risk: hot_tile.and_then(|key| engine.mean_risk_of(key)),
        tiles_live,
        min_trust,
        penalized_connections: penalized,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
