use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use fleet_core::clock::{from_micros, to_micros, SharedClock};
use fleet_core::store::{Cell, DataStore, LockToken, Mutation, TimeRange};
use fleet_core::StoreError;
use log::debug;
use uuid::Uuid;

use super::{with_retry, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::{kv_cells, kv_locks};

#[derive(Insertable, Debug)]
#[diesel(table_name = kv_cells)]
struct NewCellRow<'a> {
    subject: &'a str,
    column_name: &'a str,
    ts_micros: i64,
    value: &'a [u8],
}

/// Escapa `%`, `_` y `\` para usar `prefix` en un `LIKE 'prefix%'`.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn new_owner() -> i64 {
    (Uuid::new_v4().as_u64_pair().0 & (i64::MAX as u64)) as i64
}

fn apply_one(conn: &mut PgConnection, m: &Mutation) -> Result<(), PersistenceError> {
    match m {
        Mutation::Set { subject, column, value, timestamp, replace } => {
            if *replace {
                diesel::delete(kv_cells::table.filter(kv_cells::subject.eq(subject.as_str()))
                                              .filter(kv_cells::column_name.eq(column.as_str())))
                .execute(conn)?;
            }
            let row = NewCellRow { subject, column_name: column, ts_micros: to_micros(*timestamp), value };
            diesel::insert_into(kv_cells::table).values(&row)
                                                .on_conflict((kv_cells::subject,
                                                              kv_cells::column_name,
                                                              kv_cells::ts_micros))
                                                .do_update()
                                                .set(kv_cells::value.eq(excluded(kv_cells::value)))
                                                .execute(conn)?;
        }
        Mutation::DeleteAttributes { subject, columns, range } => {
            let base = kv_cells::table.filter(kv_cells::subject.eq(subject.as_str()))
                                      .filter(kv_cells::column_name.eq_any(columns.clone()));
            match range {
                None => diesel::delete(base).execute(conn)?,
                Some(r) => {
                    let window = kv_cells::ts_micros.between(to_micros(r.start), to_micros(r.end));
                    diesel::delete(base.filter(window)).execute(conn)?
                }
            };
        }
        Mutation::DeletePrefix { subject, prefix } => {
            diesel::delete(kv_cells::table.filter(kv_cells::subject.eq(subject.as_str()))
                                          .filter(kv_cells::column_name.like(like_prefix(prefix))))
            .execute(conn)?;
        }
        Mutation::DeleteSubject { subject } => {
            diesel::delete(kv_cells::table.filter(kv_cells::subject.eq(subject.as_str()))).execute(conn)?;
        }
    }
    Ok(())
}

/// `DataStore` persistente sobre Postgres.
///
/// El reloj lo aporta el llamador: las expiraciones de lock y la
/// visibilidad de celdas se evalúan con el mismo `SharedClock` que usa el
/// resto de los servicios.
pub struct PgDataStore<P: ConnectionProvider> {
    provider: P,
    clock: SharedClock,
}

impl<P: ConnectionProvider> PgDataStore<P> {
    pub fn new(provider: P, clock: SharedClock) -> Self {
        Self { provider, clock }
    }

    /// Borra locks vencidos. Devuelve cuántos se eliminaron.
    pub fn purge_expired_locks(&self) -> Result<usize, StoreError> {
        let now = to_micros(self.now());
        let removed = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::delete(kv_locks::table.filter(kv_locks::expires_micros.le(now))).execute(&mut conn)
                                                                                     .map_err(PersistenceError::from)
        })?;
        debug!("purged {removed} expired locks");
        Ok(removed)
    }
}

impl<P: ConnectionProvider> DataStore for PgDataStore<P> {
    fn apply(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| -> Result<(), PersistenceError> {
                                                     for m in &mutations {
                                                         apply_one(tx, m)?;
                                                     }
                                                     Ok(())
                                                 })
        })?;
        Ok(())
    }

    fn resolve_prefix(&self, subject: &str, prefix: &str, range: TimeRange) -> Result<Vec<Cell>, StoreError> {
        let (lo, hi) = (to_micros(range.start), to_micros(range.end));
        if lo > hi {
            return Ok(Vec::new());
        }
        let pattern = like_prefix(prefix);
        let mut rows: Vec<(String, i64, Vec<u8>)> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            kv_cells::table.filter(kv_cells::subject.eq(subject))
                           .filter(kv_cells::column_name.like(pattern.as_str()))
                           .filter(kv_cells::ts_micros.between(lo, hi))
                           .select((kv_cells::column_name, kv_cells::ts_micros, kv_cells::value))
                           .load(&mut conn)
                           .map_err(PersistenceError::from)
        })?;
        // Orden por bytes, independiente de la collation de la base.
        rows.sort_by(|a, b| (a.0.as_bytes(), a.1).cmp(&(b.0.as_bytes(), b.1)));
        Ok(rows.into_iter()
               .map(|(column, ts, value)| Cell { column, value, timestamp: from_micros(ts) })
               .collect())
    }

    fn try_lock(&self, subject: &str, lease: Duration) -> Result<LockToken, StoreError> {
        let now = self.now();
        let expires = now + lease;
        let owner = new_owner();
        let acquired = with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_write().run(|tx| -> Result<bool, PersistenceError> {
                                                     let current: Option<i64> =
                                                         kv_locks::table.find(subject)
                                                                        .select(kv_locks::expires_micros)
                                                                        .for_update()
                                                                        .first(tx)
                                                                        .optional()?;
                                                     match current {
                                                         Some(exp) if exp > to_micros(now) => Ok(false),
                                                         Some(_) => {
                                                             diesel::update(kv_locks::table.find(subject))
                                                                 .set((kv_locks::owner.eq(owner),
                                                                       kv_locks::expires_micros.eq(to_micros(expires))))
                                                                 .execute(tx)?;
                                                             Ok(true)
                                                         }
                                                         None => {
                                                             diesel::insert_into(kv_locks::table)
                                                                 .values((kv_locks::subject.eq(subject),
                                                                          kv_locks::owner.eq(owner),
                                                                          kv_locks::expires_micros.eq(to_micros(expires))))
                                                                 .execute(tx)?;
                                                             Ok(true)
                                                         }
                                                     }
                                                 })
        });
        match acquired {
            Ok(true) => Ok(LockToken { subject: subject.to_string(), owner: owner as u64, expires }),
            Ok(false) | Err(PersistenceError::UniqueViolation(_)) => Err(StoreError::LockContention(subject.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn extend_lock(&self, token: &LockToken, lease: Duration) -> Result<LockToken, StoreError> {
        let expires = self.now() + lease;
        let updated = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(kv_locks::table.filter(kv_locks::subject.eq(token.subject.as_str()))
                                          .filter(kv_locks::owner.eq(token.owner as i64)))
            .set(kv_locks::expires_micros.eq(to_micros(expires)))
            .execute(&mut conn)
            .map_err(PersistenceError::from)
        })?;
        if updated == 0 {
            return Err(StoreError::LockLost(token.subject.clone()));
        }
        Ok(LockToken { subject: token.subject.clone(), owner: token.owner, expires })
    }

    fn unlock(&self, token: &LockToken) -> Result<(), StoreError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::delete(kv_locks::table.filter(kv_locks::subject.eq(token.subject.as_str()))
                                          .filter(kv_locks::owner.eq(token.owner as i64)))
            .execute(&mut conn)
            .map_err(PersistenceError::from)
        })?;
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
