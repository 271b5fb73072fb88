//! Contrato del key-value store sobre el que se coordina todo.
//!
//! Modelo: `subject -> column -> {timestamp -> bytes}`. Cada celda puede
//! tener varias versiones; el timestamp sirve a la vez de versión y de
//! instante de visibilidad (las colas sólo leen celdas con `ts <= now`).
//!
//! Además del acceso a celdas, el store provee un lock exclusivo con
//! expiración por subject (`try_lock`), que es la primitiva de exclusión
//! mutua de colas y flows.
//!
//! Todas las escrituras de un turno se agrupan en un `MutationPool` y se
//! aplican con `DataStore::apply`, que es atómico: o se ven todas o
//! ninguna.

mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::errors::StoreError;

pub use memory::InMemoryDataStore;

/// Una versión de una celda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Rango de timestamps cerrado en ambos extremos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Desde el epoch hasta `end`.
    pub fn up_to(end: DateTime<Utc>) -> Self {
        Self { start: DateTime::<Utc>::default(), end }
    }

    pub fn all() -> Self {
        Self { start: DateTime::<Utc>::default(), end: DateTime::<Utc>::MAX_UTC }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Escribe una versión. Con `replace` se borran antes las demás
    /// versiones de la columna.
    Set { subject: String, column: String, value: Vec<u8>, timestamp: DateTime<Utc>, replace: bool },
    /// Borra columnas completas o sólo las versiones dentro de `range`.
    DeleteAttributes { subject: String, columns: Vec<String>, range: Option<TimeRange> },
    /// Borra todas las columnas que empiezan por `prefix`.
    DeletePrefix { subject: String, prefix: String },
    DeleteSubject { subject: String },
}

/// Lock concedido por el store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub subject: String,
    pub owner: u64,
    pub expires: DateTime<Utc>,
}

pub trait DataStore: Send + Sync {
    /// Aplica un lote de mutaciones de forma atómica y en orden.
    fn apply(&self, mutations: Vec<Mutation>) -> Result<(), StoreError>;

    /// Todas las versiones de columnas con prefijo `prefix` dentro de
    /// `range`, ordenadas por columna y luego por timestamp ascendente.
    fn resolve_prefix(&self, subject: &str, prefix: &str, range: TimeRange) -> Result<Vec<Cell>, StoreError>;

    /// Intenta tomar el lock del subject sin bloquear.
    /// Devuelve `StoreError::LockContention` si otro dueño lo tiene vigente.
    fn try_lock(&self, subject: &str, lease: Duration) -> Result<LockToken, StoreError>;

    fn extend_lock(&self, token: &LockToken, lease: Duration) -> Result<LockToken, StoreError>;

    /// Libera el lock; liberar un lock ajeno o ya expirado no es error.
    fn unlock(&self, token: &LockToken) -> Result<(), StoreError>;

    /// Reloj del store (usado para expiración de locks).
    fn now(&self) -> DateTime<Utc>;

    fn multi_set(&self,
                 subject: &str,
                 values: BTreeMap<String, Vec<Vec<u8>>>,
                 timestamp: DateTime<Utc>,
                 replace: bool,
                 to_delete: &[String])
                 -> Result<(), StoreError> {
        let mut pool = MutationPool::new();
        pool.multi_set(subject, values, timestamp, replace, to_delete);
        pool.flush(self)
    }

    fn set(&self,
           subject: &str,
           column: &str,
           value: Vec<u8>,
           timestamp: DateTime<Utc>,
           replace: bool)
           -> Result<(), StoreError> {
        self.apply(vec![Mutation::Set { subject: subject.to_string(),
                                        column: column.to_string(),
                                        value,
                                        timestamp,
                                        replace }])
    }

    /// Versión más reciente de una columna exacta.
    fn resolve(&self, subject: &str, column: &str) -> Result<Option<Cell>, StoreError> {
        Ok(self.resolve_prefix(subject, column, TimeRange::all())?
               .into_iter()
               .filter(|c| c.column == column)
               .max_by_key(|c| c.timestamp))
    }

    fn delete_attributes(&self, subject: &str, columns: &[String], range: Option<TimeRange>) -> Result<(), StoreError> {
        if columns.is_empty() {
            return Ok(());
        }
        self.apply(vec![Mutation::DeleteAttributes { subject: subject.to_string(),
                                                     columns: columns.to_vec(),
                                                     range }])
    }

    fn delete_subject(&self, subject: &str) -> Result<(), StoreError> {
        self.apply(vec![Mutation::DeleteSubject { subject: subject.to_string() }])
    }
}

pub type SharedDataStore = Arc<dyn DataStore>;

/// Escrituras diferidas sobre varios subjects, aplicadas como una unidad.
#[derive(Debug, Default, Clone)]
pub struct MutationPool {
    mutations: Vec<Mutation>,
}

impl MutationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, subject: &str, column: &str, value: Vec<u8>, timestamp: DateTime<Utc>, replace: bool) {
        self.mutations.push(Mutation::Set { subject: subject.to_string(),
                                            column: column.to_string(),
                                            value,
                                            timestamp,
                                            replace });
    }

    pub fn multi_set(&mut self,
                     subject: &str,
                     values: BTreeMap<String, Vec<Vec<u8>>>,
                     timestamp: DateTime<Utc>,
                     replace: bool,
                     to_delete: &[String]) {
        self.delete_attributes(subject, to_delete.to_vec(), None);
        for (column, versions) in values {
            for value in versions {
                self.set(subject, &column, value, timestamp, replace);
            }
        }
    }

    pub fn delete_attributes(&mut self, subject: &str, columns: Vec<String>, range: Option<TimeRange>) {
        if columns.is_empty() {
            return;
        }
        self.mutations.push(Mutation::DeleteAttributes { subject: subject.to_string(), columns, range });
    }

    pub fn delete_prefix(&mut self, subject: &str, prefix: &str) {
        self.mutations.push(Mutation::DeletePrefix { subject: subject.to_string(), prefix: prefix.to_string() });
    }

    pub fn delete_subject(&mut self, subject: &str) {
        self.mutations.push(Mutation::DeleteSubject { subject: subject.to_string() });
    }

    pub fn extend(&mut self, other: MutationPool) {
        self.mutations.extend(other.mutations);
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Aplica el lote pendiente. El pool queda vacío aun si el store falla.
    pub fn flush<S: DataStore + ?Sized>(&mut self, store: &S) -> Result<(), StoreError> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.mutations);
        debug!("mutation_pool:flush count={}", batch.len());
        store.apply(batch)
    }
}

/// Lock de un subject que se libera al salir de scope.
pub struct SubjectLock {
    store: SharedDataStore,
    token: LockToken,
    lease: Duration,
    released: bool,
}

impl SubjectLock {
    /// Un único intento no bloqueante.
    pub fn acquire(store: &SharedDataStore, subject: &str, lease: Duration) -> Result<Self, StoreError> {
        let token = store.try_lock(subject, lease)?;
        Ok(Self { store: Arc::clone(store), token, lease, released: false })
    }

    pub fn subject(&self) -> &str {
        &self.token.subject
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.token.expires
    }

    /// Tiempo restante del lease; `LockLost` si ya expiró.
    pub fn check_lease(&self) -> Result<Duration, StoreError> {
        let remaining = self.token.expires - self.store.now();
        if remaining <= Duration::zero() {
            return Err(StoreError::LockLost(self.token.subject.clone()));
        }
        Ok(remaining)
    }

    pub fn extend(&mut self, lease: Duration) -> Result<(), StoreError> {
        self.token = self.store.extend_lock(&self.token, lease)?;
        self.lease = lease;
        Ok(())
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.unlock(&self.token)
    }
}

impl Drop for SubjectLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.store.unlock(&self.token) {
                warn!("unlock failed subject={} err={e}", self.token.subject);
            }
        }
    }
}

impl std::fmt::Debug for SubjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectLock").field("token", &self.token).field("lease", &self.lease).finish()
    }
}

/// Intenta el lock hasta `retries` veces adicionales, esperando `wait`
/// entre intentos. Cualquier error distinto de contención se propaga ya.
pub fn lock_retry(store: &SharedDataStore,
                  subject: &str,
                  lease: Duration,
                  retries: u32,
                  wait: std::time::Duration)
                  -> Result<SubjectLock, StoreError> {
    let mut attempt = 0;
    loop {
        match SubjectLock::acquire(store, subject, lease) {
            Err(StoreError::LockContention(s)) if attempt < retries => {
                debug!("lock_retry: contention on {s} (attempt {})", attempt + 1);
                attempt += 1;
                std::thread::sleep(wait);
            }
            other => return other,
        }
    }
}
