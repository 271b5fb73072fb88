#![allow(dead_code)]

use std::sync::Arc;

use fleet_core::{ManualClock, SharedDataStore};
use fleet_persistence::pg::{build_pool, PgDataStore, PgPool, PoolProvider};
use fleet_persistence::DbConfig;
use once_cell::sync::Lazy;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    let cfg = DbConfig::from_env().ok()?;
    match build_pool(&cfg.url, 1, 2) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("could not build test pool: {e}");
            None
        }
    }
});

/// Ejecuta `f` con el pool de test; `None` (test omitido) sin DATABASE_URL.
pub fn with_pool<F, R>(f: F) -> Option<R>
    where F: FnOnce(&PgPool) -> R
{
    TEST_POOL.as_ref().map(f)
}

/// Store Postgres con reloj manual. Los subjects de cada test llevan un
/// sufijo único para no pisarse entre ejecuciones.
pub fn pg_store(pool: &PgPool, clock: &Arc<ManualClock>) -> SharedDataStore {
    Arc::new(PgDataStore::new(PoolProvider { pool: pool.clone() }, clock.clone()))
}

pub fn unique(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4().simple())
}
