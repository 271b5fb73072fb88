//! Constantes del control plane.
//!
//! Agrupa valores estáticos compartidos entre el queue manager, el runner y
//! el worker. Algunos forman parte del layout persistido en el store (prefijos
//! de columnas); cambiarlos rompe la compatibilidad con datos existentes.

/// Prefijo de las columnas que contienen tasks dentro de una cola.
pub const TASK_PREDICATE_PREFIX: &str = "task:";

/// Prefijo de las columnas de notificación dentro de un shard de cola.
pub const NOTIFY_PREDICATE_PREFIX: &str = "notify:";

/// Prefijo común de todas las columnas del estado de un flow
/// (request states, status y responses).
pub const FLOW_STATE_PREFIX: &str = "flow:";

/// Intentos de entrega de un task antes de descartarlo (poison message).
pub const MAX_TASK_TTL: u32 = 5;

/// Los mensajes dirigidos a well-known flows no tienen request asociado.
pub const WELL_KNOWN_REQUEST_ID: u64 = 0;

/// Nombre del estado de entrada de todo flow.
pub const START_STATE: &str = "Start";

/// Nombre del estado de limpieza invocado cuando no quedan requests.
pub const END_STATE: &str = "End";

/// Cola por defecto de los workers.
pub const DEFAULT_WORKER_QUEUE: &str = "W";

/// Canal de auditoría usado al arrancar flows de primer nivel.
pub const AUDIT_CHANNEL: &str = "Audit";

/// Usuario con el que se registran los leases cuando no hay token.
pub const WORKER_USERNAME: &str = "FleetWorker";
