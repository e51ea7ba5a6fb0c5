//! Async service surface over the engine.
//!
//! A single command loop owns the ingest channel; per-sender mpsc FIFO gives
//! the per-connection ordering guarantee (a connection's reports are applied
//! in arrival order, with no cross-connection ordering beyond "each report is
//! atomically applied before its broadcast is emitted"). Every processed
//! report fans out a [`TileUpdate`] over a broadcast channel; lagging
//! subscribers are the transport's concern.
//!
//! Shutdown is graceful by construction: dropping the handle closes the
//! channel, and the loop drains every buffered command before exiting.

use crate::engine::{
    ActorReport, EngineError, HazardEngine, TileHistorySnapshot, TileUpdate, TtcPrediction,
};
use crate::grid::{ConnectionId, TileKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the command and broadcast channels.
const CHANNEL_CAPACITY: usize = 256;

/// The service task has stopped and can no longer accept commands.
#[derive(Debug, thiserror::Error)]
#[error("engine service is no longer running")]
pub struct ServiceClosed;

/// Commands accepted by the service loop.
#[derive(Debug)]
pub enum EngineCommand {
    /// Process one actor report (fire-and-forget fact)
    Report(ActorReport),

    /// On-demand minimum-TTC prediction for a tile
    PredictTtc {
        tile_key: TileKey,
        reply: oneshot::Sender<TtcPrediction>,
    },

    /// A tile's retained risk scores
    History {
        tile_key: TileKey,
        reply: oneshot::Sender<TileHistorySnapshot>,
    },

    /// Transport-reported disconnect
    Disconnect(ConnectionId),
}

/// Handle to a running engine service.
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    updates: broadcast::Sender<TileUpdate>,
    engine: Arc<HazardEngine>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Queues one actor report.
    pub async fn report(&self, report: ActorReport) -> Result<(), ServiceClosed> {
        self.commands
            .send(EngineCommand::Report(report))
            .await
            .map_err(|_| ServiceClosed)
    }

    /// Requests a minimum-TTC prediction for a tile.
    pub async fn predict_ttc(&self, tile_key: TileKey) -> Result<TtcPrediction, ServiceClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::PredictTtc { tile_key, reply })
            .await
            .map_err(|_| ServiceClosed)?;
        response.await.map_err(|_| ServiceClosed)
    }

    /// Requests a tile's risk history.
    pub async fn history(&self, tile_key: TileKey) -> Result<TileHistorySnapshot, ServiceClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::History { tile_key, reply })
            .await
            .map_err(|_| ServiceClosed)?;
        response.await.map_err(|_| ServiceClosed)
    }

    /// Reports a transport disconnect for a connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), ServiceClosed> {
        self.commands
            .send(EngineCommand::Disconnect(connection_id))
            .await
            .map_err(|_| ServiceClosed)
    }

    /// Subscribes to broadcast tile updates.
    pub fn subscribe(&self) -> broadcast::Receiver<TileUpdate> {
        self.updates.subscribe()
    }

    /// A cloneable command sender for per-connection ingest tasks.
    pub fn command_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.commands.clone()
    }

    /// Direct read access to the engine (stats, trend queries).
    pub fn engine(&self) -> &HazardEngine {
        &self.engine
    }

    /// Stops the service, draining every queued command first.
    pub async fn shutdown(self) {
        let EngineHandle {
            commands, task, ..
        } = self;
        drop(commands);
        let _ = task.await;
    }
}

/// The engine service: spawns the command loop.
pub struct EngineService;

impl EngineService {
    /// Spawns the service loop on the current tokio runtime.
    ///
    /// The loop also drives the periodic empty-tile sweep.
    pub fn spawn(engine: Arc<HazardEngine>) -> EngineHandle {
        let (commands, mut inbox) = mpsc::channel(CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);

        let loop_engine = engine.clone();
        let loop_updates = updates.clone();
        let sweep_period = engine.config().empty_tile_grace.max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_period);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = inbox.recv() => match command {
                        Some(command) => handle_command(&loop_engine, &loop_updates, command),
                        // Channel closed: every buffered command has been
                        // drained by recv(), so this is the graceful exit.
                        None => break,
                    },
                    _ = sweep.tick() => {
                        let collected = loop_engine.sweep_empty_tiles();
                        if collected > 0 {
                            debug!(collected, "swept empty tiles");
                        }
                    }
                }
            }
            info!("engine service stopped");
        });

        EngineHandle {
            commands,
            updates,
            engine,
            task,
        }
    }
}

fn handle_command(
    engine: &HazardEngine,
    updates: &broadcast::Sender<TileUpdate>,
    command: EngineCommand,
) {
    match command {
        EngineCommand::Report(report) => match engine.process_report(report) {
            // A send error only means no subscriber is listening right now
            Ok(update) => {
                let _ = updates.send(update);
            }
            Err(EngineError::InvalidReport(reason)) => {
                warn!(%reason, "report rejected");
            }
            Err(err) => {
                warn!(%err, "report failed");
            }
        },
        EngineCommand::PredictTtc { tile_key, reply } => {
            let _ = reply.send(engine.predict_min_ttc(tile_key));
        }
        EngineCommand::History { tile_key, reply } => {
            let _ = reply.send(engine.history_of(tile_key));
        }
        EngineCommand::Disconnect(connection_id) => {
            if let Err(err) = engine.disconnect(connection_id) {
                warn!(%err, "disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::grid::{Position, Role, TileKey};
    use crate::risk::Ttc;

    fn report(conn: ConnectionId, lat: f64, lon: f64, speed: f64) -> ActorReport {
        ActorReport {
            connection_id: conn,
            role: Role::Vehicle,
            lat,
            lon,
            speed,
            timestamp: 100.0,
        }
    }

    fn spawn_engine() -> EngineHandle {
        EngineService::spawn(Arc::new(HazardEngine::new(EngineConfig::default())))
    }

    #[tokio::test]
    async fn test_report_reaches_subscribers() {
        let handle = spawn_engine();
        let mut updates = handle.subscribe();

        handle
            .report(report(ConnectionId::new(), 0.001, 0.001, 5.0))
            .await
            .unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(
            update.tile_key,
            TileKey::for_position(Position::new(0.001, 0.001), 0.01)
        );
        assert_eq!(update.occupants.len(), 1);
        assert_eq!(update.risk_score, 0.0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_report_emits_no_update() {
        let handle = spawn_engine();
        let mut updates = handle.subscribe();

        handle
            .report(report(ConnectionId::new(), f64::NAN, 0.0, 5.0))
            .await
            .unwrap();
        handle
            .report(report(ConnectionId::new(), 0.001, 0.001, 5.0))
            .await
            .unwrap();

        // Only the well-formed report produces a broadcast
        let update = updates.recv().await.unwrap();
        assert_eq!(update.occupants.len(), 1);
        assert_eq!(handle.engine().stats().store.occupants, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_prediction_and_history_queries() {
        let handle = spawn_engine();

        handle
            .report(report(ConnectionId::new(), 0.0001, 0.0001, 5.0))
            .await
            .unwrap();
        handle
            .report(report(ConnectionId::new(), 0.0002, 0.0001, 0.0))
            .await
            .unwrap();

        let tile_key = TileKey::for_position(Position::new(0.0001, 0.0001), 0.01);
        let prediction = handle.predict_ttc(tile_key).await.unwrap();
        assert!(matches!(prediction.ttc, Ttc::Seconds(_)));

        let history = handle.history(tile_key).await.unwrap();
        assert_eq!(history.scores, vec![0.0, 2.0]);

        // Unknown tile reads empty, not an error
        let nowhere = TileKey { lat_idx: 5000, lon_idx: 5000 };
        assert_eq!(handle.predict_ttc(nowhere).await.unwrap().ttc, Ttc::Never);
        assert!(handle.history(nowhere).await.unwrap().scores.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_reports() {
        let engine = Arc::new(HazardEngine::new(EngineConfig::default()));
        let handle = EngineService::spawn(engine.clone());

        for i in 0..50u64 {
            handle
                .report(report(
                    ConnectionId::from_seed(i),
                    0.001 + (i as f64) * 0.0001,
                    0.001,
                    5.0,
                ))
                .await
                .unwrap();
        }
        handle.shutdown().await;

        // Every report queued before shutdown was processed
        assert_eq!(engine.stats().store.occupants, 50);
        assert_eq!(engine.stats().tracked_connections, 50);
    }

    #[tokio::test]
    async fn test_disconnect_command_clears_connection() {
        let engine = Arc::new(HazardEngine::new(EngineConfig::default()));
        let handle = EngineService::spawn(engine.clone());
        let conn = ConnectionId::new();

        handle.report(report(conn, 0.001, 0.001, 5.0)).await.unwrap();
        // Queue order guarantees the disconnect runs after the report
        handle.disconnect(conn).await.unwrap();
        handle.shutdown().await;

        assert!(engine.trust_of(conn).is_none());
        assert_eq!(engine.stats().store.occupants, 0);
    }
}
