//! Configuración central de la aplicación.
//! Compone la configuración del queue manager, del worker y, si existe
//! `DATABASE_URL`, la de Postgres. Todo se lee una vez desde el entorno
//! (con `.env` cargado de forma perezosa por cada crate).
use fleet_core::{QueueConfig, WorkerConfig};
use fleet_persistence::DbConfig;
use once_cell::sync::Lazy;

use crate::errors::AppError;

/// Configuración global de la aplicación.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// `None` si no hay base configurada; se usa el store en memoria.
    pub database: Option<DbConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        fleet_persistence::init_dotenv();
        Self { queue: QueueConfig::from_env(), worker: WorkerConfig::from_env(), database: DbConfig::from_env().ok() }
    }

    /// Sección de base de datos; error de configuración si falta.
    pub fn require_database(&self) -> Result<&DbConfig, AppError> {
        self.database.as_ref().ok_or_else(|| AppError::Config("DATABASE_URL is not set".into()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { queue: QueueConfig::default(), worker: WorkerConfig::default(), database: None }
    }
}

/// Instancia global perezosa, evaluada una sola vez.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);
