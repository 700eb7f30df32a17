//! ScooterMap Worker - occupancy aggregation over a sled store
//!
//! Reads vehicle observations as JSON lines on stdin, commits them in
//! batches and periodically logs the current occupancy heatmap:
//! - Last-writer-wins state per vehicle in sled
//! - Retention sweeps inside the worker loop
//! - Optional GeoJSON snapshot of the occupied cells
//!
//! ```text
//! feed-poller | scootermap-worker --store ./scootermap.db --geojson cells.geojson
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use scootermap_core::{
    feature_collection, heatmap_json, AggregationWorker, EngineConfig, MetricsSnapshot, OccupancyQuery,
    OccupancyStats, SledStore, VehicleStateStore, WindowedQueryEngine,
};
use scootermap_env::{MobilityContext, TokioContext};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod stdin_transport;

use stdin_transport::StdinTransport;

/// ScooterMap aggregation worker
#[derive(Parser, Debug)]
#[command(name = "scootermap-worker")]
#[command(about = "Aggregate vehicle observations into H3 occupancy", long_about = None)]
struct Args {
    /// sled database directory
    #[arg(long, default_value = "scootermap.db")]
    store: PathBuf,

    /// Engine configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between occupancy reports
    #[arg(long, default_value = "60")]
    report_interval: u64,

    /// Report resolution (default: configured default resolution)
    #[arg(short, long)]
    resolution: Option<u8>,

    /// Minimum vehicles per reported cell
    #[arg(long, default_value = "1")]
    min_count: u32,

    /// Write each report as a GeoJSON FeatureCollection to this path
    #[arg(long)]
    geojson: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct ShutdownSummary {
    metrics: MetricsSnapshot,
    stats: Option<OccupancyStats>,
    acked: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let store: Arc<dyn VehicleStateStore> = Arc::new(
        SledStore::open(&args.store).with_context(|| format!("opening store at {}", args.store.display()))?,
    );
    let context = TokioContext::shared();
    let transport = Arc::new(StdinTransport::new(context.clone()));

    let mut worker = AggregationWorker::new(context.clone(), transport.clone(), store.clone(), config.clone())?;
    let engine = Arc::new(WindowedQueryEngine::new(context.clone(), store, &config)?);

    let mut query = OccupancyQuery::default().with_min_count(args.min_count);
    query.resolution = args.resolution;

    info!(
        store = %args.store.display(),
        resolutions = ?engine.resolutions().as_u8(),
        window_secs = config.occupancy_window.as_secs(),
        "ScooterMap worker starting"
    );

    let (stop_reporter, shutdown) = watch::channel(false);
    {
        let engine = engine.clone();
        let interval = Duration::from_secs(args.report_interval.max(1));
        let geojson = args.geojson.clone();
        let query = query.clone();
        context.spawn(
            "occupancy-reporter",
            report_every(interval, shutdown, move || {
                let engine = engine.clone();
                let query = query.clone();
                let geojson = geojson.clone();
                async move { report_occupancy(&engine, &query, geojson.as_deref()).await }
            }),
        );
    }

    let outcome = tokio::select! {
        result = worker.run() => result.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };
    let _ = stop_reporter.send(true);

    // Final snapshot, including the GeoJSON dump
    report_occupancy(&engine, &query, args.geojson.as_deref()).await;

    let summary = ShutdownSummary {
        metrics: worker.metrics().snapshot(),
        stats: engine.stats().await.ok(),
        acked: transport.acked(),
    };
    info!(summary = %serde_json::to_string(&summary)?, "worker stopped");

    outcome.context("aggregation worker failed")
}

/// Runs `report` once per `interval` until `shutdown` flips to true.
///
/// The first tick fires immediately and is skipped; the caller reports
/// on its own at shutdown.
async fn report_every<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, mut report: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => report().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("occupancy reporter stopped");
                    return;
                }
            }
        }
    }
}

async fn report_occupancy(
    engine: &WindowedQueryEngine<TokioContext>,
    query: &OccupancyQuery,
    geojson: Option<&Path>,
) {
    let report = match engine.occupancy(query).await {
        Ok(report) => report,
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "occupancy query failed, retrying next interval");
            return;
        }
        Err(e) => {
            error!(error = %e, "occupancy query rejected");
            return;
        }
    };

    let heatmap = heatmap_json(&report, &engine.resolutions().as_u8());
    info!(
        resolution = heatmap.resolution,
        hexagons = heatmap.hexagon_count,
        vehicles = heatmap.total_vehicles,
        window_start = %heatmap.metadata.window_start,
        "occupancy"
    );

    if let Some(path) = geojson {
        if let Err(e) = write_geojson(&report, path).await {
            warn!(path = %path.display(), error = %e, "GeoJSON export failed");
        }
    }
}

async fn write_geojson(report: &scootermap_core::OccupancyReport, path: &Path) -> Result<()> {
    let body = serde_json::to_vec_pretty(&feature_collection(report))?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
