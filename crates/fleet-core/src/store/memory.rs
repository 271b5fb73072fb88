use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use super::{Cell, DataStore, LockToken, Mutation, TimeRange};
use crate::clock::{from_micros, to_micros, SharedClock};
use crate::errors::StoreError;

type Versions = BTreeMap<i64, Vec<u8>>;

#[derive(Default)]
struct Inner {
    cells: HashMap<String, BTreeMap<String, Versions>>,
    locks: HashMap<String, (u64, DateTime<Utc>)>,
    next_owner: u64,
}

impl Inner {
    fn apply_one(&mut self, m: Mutation) {
        match m {
            Mutation::Set { subject, column, value, timestamp, replace } => {
                let versions = self.cells.entry(subject).or_default().entry(column).or_default();
                if replace {
                    versions.clear();
                }
                versions.insert(to_micros(timestamp), value);
            }
            Mutation::DeleteAttributes { subject, columns, range } => {
                if let Some(cols) = self.cells.get_mut(&subject) {
                    for c in columns {
                        match range {
                            None => {
                                cols.remove(&c);
                            }
                            Some(r) => {
                                if let Some(v) = cols.get_mut(&c) {
                                    v.retain(|ts, _| !r.contains(from_micros(*ts)));
                                    if v.is_empty() {
                                        cols.remove(&c);
                                    }
                                }
                            }
                        }
                    }
                    if cols.is_empty() {
                        self.cells.remove(&subject);
                    }
                }
            }
            Mutation::DeletePrefix { subject, prefix } => {
                if let Some(cols) = self.cells.get_mut(&subject) {
                    cols.retain(|c, _| !c.starts_with(&prefix));
                    if cols.is_empty() {
                        self.cells.remove(&subject);
                    }
                }
            }
            Mutation::DeleteSubject { subject } => {
                self.cells.remove(&subject);
            }
        }
    }
}

/// Store en memoria con versiones por celda y locks con expiración.
///
/// Todas las operaciones toman un único mutex, así que `apply` es atómico
/// respecto de cualquier lector.
pub struct InMemoryDataStore {
    inner: Mutex<Inner>,
    clock: SharedClock,
}

impl InMemoryDataStore {
    pub fn new(clock: SharedClock) -> Self {
        Self { inner: Mutex::new(Inner::default()), clock }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl DataStore for InMemoryDataStore {
    fn apply(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let mut inner = self.guard();
        for m in mutations {
            inner.apply_one(m);
        }
        Ok(())
    }

    fn resolve_prefix(&self, subject: &str, prefix: &str, range: TimeRange) -> Result<Vec<Cell>, StoreError> {
        let inner = self.guard();
        let Some(cols) = inner.cells.get(subject) else {
            return Ok(Vec::new());
        };
        let (lo, hi) = (to_micros(range.start), to_micros(range.end));
        let mut out = Vec::new();
        if lo > hi {
            return Ok(out);
        }
        for (column, versions) in cols.range(prefix.to_string()..) {
            if !column.starts_with(prefix) {
                break;
            }
            for (ts, value) in versions.range(lo..=hi) {
                out.push(Cell { column: column.clone(), value: value.clone(), timestamp: from_micros(*ts) });
            }
        }
        Ok(out)
    }

    fn try_lock(&self, subject: &str, lease: Duration) -> Result<LockToken, StoreError> {
        let now = self.clock.now();
        let mut inner = self.guard();
        if let Some((_, expires)) = inner.locks.get(subject) {
            if *expires > now {
                return Err(StoreError::LockContention(subject.to_string()));
            }
        }
        inner.next_owner += 1;
        let owner = inner.next_owner;
        let expires = now + lease;
        inner.locks.insert(subject.to_string(), (owner, expires));
        Ok(LockToken { subject: subject.to_string(), owner, expires })
    }

    fn extend_lock(&self, token: &LockToken, lease: Duration) -> Result<LockToken, StoreError> {
        let now = self.clock.now();
        let mut inner = self.guard();
        match inner.locks.get_mut(&token.subject) {
            Some((owner, expires)) if *owner == token.owner => {
                *expires = now + lease;
                Ok(LockToken { subject: token.subject.clone(), owner: *owner, expires: *expires })
            }
            _ => Err(StoreError::LockLost(token.subject.clone())),
        }
    }

    fn unlock(&self, token: &LockToken) -> Result<(), StoreError> {
        let mut inner = self.guard();
        if matches!(inner.locks.get(&token.subject), Some((owner, _)) if *owner == token.owner) {
            inner.locks.remove(&token.subject);
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{lock_retry, MutationPool, SharedDataStore, SubjectLock};

    fn store() -> (Arc<ManualClock>, SharedDataStore) {
        let clock = Arc::new(ManualClock::at_epoch());
        let s: SharedDataStore = Arc::new(InMemoryDataStore::new(clock.clone()));
        (clock, s)
    }

    #[test]
    fn versions_and_replace() {
        let (clock, s) = store();
        let t0 = clock.now();
        s.set("subj", "col:a", b"1".to_vec(), t0, false).unwrap();
        s.set("subj", "col:a", b"2".to_vec(), t0 + Duration::seconds(1), false).unwrap();
        assert_eq!(s.resolve_prefix("subj", "col:", TimeRange::all()).unwrap().len(), 2);
        assert_eq!(s.resolve("subj", "col:a").unwrap().unwrap().value, b"2".to_vec());

        s.set("subj", "col:a", b"3".to_vec(), t0, true).unwrap();
        let cells = s.resolve_prefix("subj", "col:", TimeRange::all()).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].value, b"3".to_vec());
    }

    #[test]
    fn prefix_scan_respects_time_range() {
        let (clock, s) = store();
        let t0 = clock.now();
        s.set("q", "task:1", vec![1], t0, true).unwrap();
        s.set("q", "task:2", vec![2], t0 + Duration::seconds(10), true).unwrap();
        s.set("q", "other", vec![3], t0, true).unwrap();
        let visible = s.resolve_prefix("q", "task:", TimeRange::up_to(t0 + Duration::seconds(5))).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].column, "task:1");
    }

    #[test]
    fn ranged_delete_keeps_newer_versions() {
        let (clock, s) = store();
        let t0 = clock.now();
        s.set("n", "notify:x", vec![1], t0, false).unwrap();
        s.set("n", "notify:x", vec![2], t0 + Duration::seconds(5), false).unwrap();
        s.delete_attributes("n", &["notify:x".to_string()], Some(TimeRange::up_to(t0 + Duration::seconds(1))))
         .unwrap();
        let left = s.resolve_prefix("n", "notify:", TimeRange::all()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].value, vec![2]);
    }

    #[test]
    fn pool_applies_everything_at_once() {
        let (clock, s) = store();
        let mut pool = MutationPool::new();
        pool.set("a", "x", vec![1], clock.now(), true);
        pool.set("b", "y", vec![2], clock.now(), true);
        pool.delete_prefix("a", "zzz");
        assert_eq!(pool.len(), 3);
        pool.flush(s.as_ref()).unwrap();
        assert!(pool.is_empty());
        assert!(s.resolve("b", "y").unwrap().is_some());
    }

    #[test]
    fn lock_is_exclusive_until_expiry() {
        let (clock, s) = store();
        let lock = SubjectLock::acquire(&s, "flow", Duration::seconds(10)).unwrap();
        assert!(matches!(SubjectLock::acquire(&s, "flow", Duration::seconds(10)),
                         Err(StoreError::LockContention(_))));
        clock.advance(Duration::seconds(11));
        assert!(matches!(lock.check_lease(), Err(StoreError::LockLost(_))));
        let second = SubjectLock::acquire(&s, "flow", Duration::seconds(10)).unwrap();
        // El lock viejo no libera al nuevo dueño.
        drop(lock);
        assert!(SubjectLock::acquire(&s, "flow", Duration::seconds(10)).is_err());
        second.release().unwrap();
        assert!(lock_retry(&s, "flow", Duration::seconds(1), 0, std::time::Duration::ZERO).is_ok());
    }

    #[test]
    fn extend_requires_ownership() {
        let (clock, s) = store();
        let mut lock = SubjectLock::acquire(&s, "f", Duration::seconds(10)).unwrap();
        clock.advance(Duration::seconds(8));
        lock.extend(Duration::seconds(10)).unwrap();
        assert!(lock.check_lease().unwrap() > Duration::seconds(9));
    }
}
