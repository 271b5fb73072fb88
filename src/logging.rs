//! Arranque del logger.

use once_cell::sync::Lazy;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
});

/// Instala `env_logger` respetando `RUST_LOG` (por defecto `info`).
/// Llamarla más de una vez no tiene efecto.
pub fn init_logging() {
    Lazy::force(&LOGGER);
}
