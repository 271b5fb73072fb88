//! fleetflow
//!
//! Crate fachada del plano de control:
//! - `config`: configuración de colas, worker y base de datos desde el entorno.
//! - `logging`: arranque idempotente de `env_logger`.
//! - `errors`: `AppError`, el error de la capa de aplicación.
//! - `demo`: un flow de ejemplo con su agente simulado.
//!
//! El motor vive en `fleet_core`; el store durable en `fleet_persistence`.

pub mod config;
pub mod demo;
pub mod errors;
pub mod logging;

pub use config::{AppConfig, CONFIG};
pub use errors::AppError;
pub use fleet_core;
pub use fleet_persistence;
pub use logging::init_logging;
