use std::sync::Arc;

use chrono::Utc;
use fleetflow::demo::{run_echo, run_in_memory, DemoReport};
use fleetflow::fleet_core::{ManualClock, SharedDataStore};
use fleetflow::fleet_persistence::{build_pool, PgDataStore, PoolProvider};
use fleetflow::{init_logging, AppConfig, AppError};
use log::{error, info, warn};

const WORDS: [&str; 3] = ["hola", "fleet", "flow"];

fn print_report(label: &str, report: &DemoReport) {
    println!("[{label}] {}", serde_json::to_string_pretty(report).unwrap_or_default());
}

/// Demo sobre Postgres. Sólo corre con `FLEETFLOW_RUN_PG_DEMO=1`.
fn run_pg_demo(config: &AppConfig) -> Result<DemoReport, AppError> {
    let db = config.require_database()?;
    if !db.url.to_lowercase().contains("gssencmode=") && std::env::var("PGGSSENCMODE").is_err() {
        std::env::set_var("PGGSSENCMODE", "disable");
        warn!("PGGSSENCMODE=disable (auto) to avoid libpq/GSS teardown issues");
    }
    let pool = build_pool(&db.url, db.min_connections, db.max_connections)?;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store: SharedDataStore = Arc::new(PgDataStore::new(PoolProvider { pool }, clock.clone()));
    run_echo(store, clock, config, &WORDS)
}

fn main() {
    let _ = dotenvy::dotenv();
    init_logging();
    let config = AppConfig::from_env();
    info!("queues={:?} shards={}", config.worker.queues, config.queue.num_notification_shards);

    match run_in_memory(&config, &WORDS) {
        Ok(report) => print_report("memory", &report),
        Err(e) => error!("in-memory demo failed: {e}"),
    }

    if cfg!(feature = "pg_demo") || std::env::var("FLEETFLOW_RUN_PG_DEMO").ok().as_deref() == Some("1") {
        match run_pg_demo(&config) {
            Ok(report) => print_report("pg", &report),
            Err(e) => error!("postgres demo failed: {e}"),
        }
    } else {
        eprintln!("[PG DEMO] Skipping (set FLEETFLOW_RUN_PG_DEMO=1 or build with --features pg_demo)");
    }
}
