//! fleet-persistence
//!
//! Implementación Postgres (Diesel + r2d2) del contrato `DataStore` de
//! `fleet-core`, con paridad de semántica respecto al store en memoria.
//!
//! Módulos:
//! - `pg`: pool de conexiones, reintentos y `PgDataStore`.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel (`kv_cells`, `kv_locks`).

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgDataStore, PgPool, PoolProvider};
