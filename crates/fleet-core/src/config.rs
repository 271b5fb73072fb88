//! Configuración del queue manager y del worker desde variables de entorno.
//!
//! Mismo patrón que la configuración de base de datos: `.env` se carga una
//! única vez de forma perezosa y cada variable tiene un default razonable.

use std::env;
use std::str::FromStr;

use chrono::Duration;
use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::constants::DEFAULT_WORKER_QUEUE;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Parámetros del queue manager.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Número de shards de notificación por cola (>= 1).
    pub num_notification_shards: usize,
    /// Notificaciones re-encoladas más viejas que esto se descartan.
    pub notification_expiry: Duration,
    pub request_limit: usize,
    pub response_limit: usize,
    pub well_known_response_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { num_notification_shards: 1,
               notification_expiry: Duration::seconds(600),
               request_limit: 1_000_000,
               response_limit: 1_000_000,
               well_known_response_limit: 10_000 }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let d = Self::default();
        Self { num_notification_shards: env_or("FLEET_QUEUE_SHARDS", d.num_notification_shards).max(1),
               notification_expiry: Duration::seconds(env_or("FLEET_NOTIFICATION_EXPIRY_SECS", 600i64)),
               request_limit: env_or("FLEET_REQUEST_LIMIT", d.request_limit),
               response_limit: env_or("FLEET_RESPONSE_LIMIT", d.response_limit),
               well_known_response_limit: d.well_known_response_limit }
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.num_notification_shards = shards.max(1);
        self
    }
}

/// Parámetros del worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub task_lease: Duration,
    pub flow_lease: Duration,
    /// Si está activo, un flow que termina en ERROR aborta la iteración.
    pub check_flow_errors: bool,
    pub poll_interval: std::time::Duration,
    /// Reintentos del lock bloqueante usado por `TerminateFlow`.
    pub lock_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queues: vec![DEFAULT_WORKER_QUEUE.to_string()],
               task_lease: Duration::seconds(600),
               flow_lease: Duration::seconds(600),
               check_flow_errors: false,
               poll_interval: std::time::Duration::from_millis(500),
               lock_retries: 10 }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let d = Self::default();
        let queues = env::var("FLEET_WORKER_QUEUES").ok()
                                                     .map(|v| {
                                                         v.split(',')
                                                          .map(str::trim)
                                                          .filter(|q| !q.is_empty())
                                                          .map(String::from)
                                                          .collect::<Vec<_>>()
                                                     })
                                                     .filter(|q| !q.is_empty())
                                                     .unwrap_or(d.queues);
        Self { queues,
               task_lease: Duration::seconds(env_or("FLEET_TASK_LEASE_SECS", 600i64)),
               flow_lease: Duration::seconds(env_or("FLEET_FLOW_LEASE_SECS", 600i64)),
               check_flow_errors: env_or("FLEET_CHECK_FLOW_ERRORS", d.check_flow_errors),
               poll_interval: std::time::Duration::from_millis(env_or("FLEET_POLL_INTERVAL_MS", 500u64)),
               lock_retries: d.lock_retries }
    }
}
