//! Queue manager: colas de tasks de cliente, estado de requests/responses
//! de flows y notificaciones por shard.
//!
//! Las escrituras se acumulan en buffers y sólo llegan al store con
//! `flush`, en un único lote atómico y en un orden fijo:
//! destrucción de estado, borrado de requests, requests nuevos, responses,
//! borrado de tasks, tasks nuevos y por último notificaciones. Así una
//! notificación nunca es visible antes que el estado que anuncia.
//!
//! `freeze_timestamp` fija el "ahora" de lectura para que todas las
//! consultas de una iteración del worker vean el mismo corte.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};

use super::layout::{self, RESPONSE_PREFIX};
use crate::clock::to_micros;
use crate::constants::{FLOW_STATE_PREFIX, MAX_TASK_TTL, NOTIFY_PREDICATE_PREFIX, TASK_PREDICATE_PREFIX,
                       WELL_KNOWN_REQUEST_ID};
use crate::errors::{QueueError, StoreError};
use crate::model::{ClientId, Message, Notification, PriorityBucket, RequestState, SessionId};
use crate::services::Services;
use crate::stats::{NOTIFICATION_QUEUE_COUNT, TASK_RETRANSMISSION_COUNT, TASK_TTL_EXPIRED_COUNT};
use crate::store::{Cell, MutationPool, SubjectLock, TimeRange};

type Timestamp = Option<DateTime<Utc>>;

/// Requests completos (con status) y sus responses, ordenados por id.
pub type CompletedRequests = Vec<(RequestState, Vec<Message>)>;

pub struct QueueManager {
    services: Arc<Services>,
    user: String,
    request_queue: Vec<(RequestState, Timestamp)>,
    response_queue: Vec<(Message, Timestamp)>,
    requests_to_delete: Vec<(SessionId, u64)>,
    client_messages_to_delete: BTreeMap<String, Vec<u64>>,
    new_client_messages: Vec<(Message, Timestamp)>,
    notifications: IndexMap<String, Notification>,
    flow_states_to_destroy: Vec<SessionId>,
    prev_frozen: Vec<Timestamp>,
    frozen: Timestamp,
}

impl QueueManager {
    pub fn new(services: Arc<Services>, user: impl Into<String>) -> Self {
        Self { services,
               user: user.into(),
               request_queue: Vec::new(),
               response_queue: Vec::new(),
               requests_to_delete: Vec::new(),
               client_messages_to_delete: BTreeMap::new(),
               new_client_messages: Vec::new(),
               notifications: IndexMap::new(),
               flow_states_to_destroy: Vec::new(),
               prev_frozen: Vec::new(),
               frozen: None }
    }

    /// Manager vacío que comparte el corte temporal de éste.
    pub fn copy(&self) -> Self {
        let mut out = Self::new(Arc::clone(&self.services), self.user.clone());
        out.frozen = self.frozen;
        out.prev_frozen = self.prev_frozen.clone();
        out
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Instante de lectura: el congelado si lo hay, si no el reloj.
    pub fn now(&self) -> DateTime<Utc> {
        self.frozen.unwrap_or_else(|| self.services.now())
    }

    pub fn frozen_timestamp(&self) -> Timestamp {
        self.frozen
    }

    pub fn freeze_timestamp(&mut self) {
        self.prev_frozen.push(self.frozen);
        self.frozen = Some(self.services.now());
    }

    pub fn unfreeze_timestamp(&mut self) -> Result<(), QueueError> {
        self.frozen = self.prev_frozen.pop().ok_or(QueueError::UnbalancedUnfreeze)?;
        Ok(())
    }

    fn write_ts(&self, ts: Timestamp) -> DateTime<Utc> {
        ts.or(self.frozen).unwrap_or_else(|| self.services.now())
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn queue_request(&mut self, request: RequestState, timestamp: Timestamp) {
        self.request_queue.push((request, timestamp));
    }

    pub fn queue_response(&mut self, response: Message, timestamp: Timestamp) {
        self.response_queue.push((response, timestamp));
    }

    pub fn queue_client_message(&mut self, message: Message, timestamp: Timestamp) {
        self.new_client_messages.push((message, timestamp));
    }

    /// Encola una notificación. Dos notificaciones del mismo flow con el
    /// mismo timestamp se funden quedándose con el mayor `last_status`.
    pub fn queue_notification(&mut self, mut notification: Notification, timestamp: Timestamp) {
        notification.timestamp = timestamp.or(self.frozen);
        let key = format!("{}!{}",
                          notification.session_id,
                          notification.timestamp.map(to_micros).map(|t| t.to_string()).unwrap_or_default());
        match self.notifications.get(&key) {
            Some(existing) if existing.last_status >= notification.last_status => {}
            _ => {
                self.notifications.insert(key, notification);
            }
        }
    }

    pub fn dequeue_client_request(&mut self, client_id: &ClientId, task_id: u64) {
        self.client_messages_to_delete.entry(client_id.queue()).or_default().push(task_id);
    }

    /// Borra el request, su status y todas sus responses.
    pub fn delete_request(&mut self, request: &RequestState) {
        self.requests_to_delete.push((request.session_id.clone(), request.id));
    }

    pub fn destroy_flow_states(&mut self, session_id: &SessionId) -> Result<(), QueueError> {
        self.multi_destroy_flow_states(std::slice::from_ref(session_id))
    }

    /// Programa el borrado del estado de requests de cada flow, desencola
    /// los tasks de cliente que siguen pendientes y descarta lo que esté en
    /// buffer para esos flows.
    pub fn multi_destroy_flow_states(&mut self, session_ids: &[SessionId]) -> Result<(), QueueError> {
        for session_id in session_ids {
            for (request, _) in self.fetch_requests_and_responses(session_id)? {
                if let (Some(task), Some(client)) = (&request.request, &request.client_id) {
                    self.dequeue_client_request(client, task.task_id);
                }
            }
            self.purge_buffers(session_id);
            self.flow_states_to_destroy.push(session_id.clone());
        }
        Ok(())
    }

    fn purge_buffers(&mut self, session_id: &SessionId) {
        let mut dropped_tasks = Vec::new();
        self.request_queue.retain(|(r, _)| {
                              if &r.session_id != session_id {
                                  return true;
                              }
                              if let (Some(task), Some(client)) = (&r.request, &r.client_id) {
                                  dropped_tasks.push((client.queue(), task.task_id));
                              }
                              false
                          });
        self.response_queue.retain(|(m, _)| &m.session_id != session_id);
        self.requests_to_delete.retain(|(s, _)| s != session_id);
        self.notifications.retain(|_, n| &n.session_id != session_id);
        self.new_client_messages
            .retain(|(m, _)| !(&m.session_id == session_id && dropped_tasks.iter().any(|(_, t)| *t == m.task_id)));
    }

    pub fn has_pending(&self) -> bool {
        !(self.request_queue.is_empty()
          && self.response_queue.is_empty()
          && self.requests_to_delete.is_empty()
          && self.client_messages_to_delete.is_empty()
          && self.new_client_messages.is_empty()
          && self.notifications.is_empty()
          && self.flow_states_to_destroy.is_empty())
    }

    /// Absorbe los buffers de otro manager (p.ej. el de un flow hijo).
    pub fn merge(&mut self, other: QueueManager) {
        self.request_queue.extend(other.request_queue);
        self.response_queue.extend(other.response_queue);
        self.requests_to_delete.extend(other.requests_to_delete);
        for (queue, ids) in other.client_messages_to_delete {
            self.client_messages_to_delete.entry(queue).or_default().extend(ids);
        }
        self.new_client_messages.extend(other.new_client_messages);
        for (_, n) in other.notifications {
            let ts = n.timestamp;
            self.queue_notification(n, ts);
        }
        self.flow_states_to_destroy.extend(other.flow_states_to_destroy);
    }

    /// Escribe todo lo acumulado en un único lote atómico.
    pub fn flush(&mut self) -> Result<(), QueueError> {
        let mut pool = MutationPool::new();

        for session_id in self.flow_states_to_destroy.drain(..) {
            pool.delete_subject(&layout::state_subject(&session_id));
        }

        for (session_id, request_id) in self.requests_to_delete.drain(..) {
            let subject = layout::state_subject(&session_id);
            pool.delete_attributes(&subject,
                                   vec![layout::request_column(request_id), layout::status_column(request_id)],
                                   None);
            pool.delete_prefix(&subject, &layout::response_prefix(request_id));
        }

        let requests = std::mem::take(&mut self.request_queue);
        for (request, ts) in requests {
            let ts = self.write_ts(ts);
            pool.set(&layout::state_subject(&request.session_id),
                     &layout::request_column(request.id),
                     serde_json::to_vec(&request)?,
                     ts,
                     true);
        }

        let responses = std::mem::take(&mut self.response_queue);
        for (response, ts) in responses {
            let ts = self.write_ts(ts);
            let subject = layout::state_subject(&response.session_id);
            let value = serde_json::to_vec(&response)?;
            let column = if response.request_id == WELL_KNOWN_REQUEST_ID {
                layout::well_known_column(response.task_id)
            } else {
                layout::response_column(response.request_id, response.response_id)
            };
            if response.is_status() && response.request_id != WELL_KNOWN_REQUEST_ID {
                pool.set(&subject, &layout::status_column(response.request_id), value.clone(), ts, true);
            }
            pool.set(&subject, &column, value, ts, true);
        }

        for (queue, ids) in std::mem::take(&mut self.client_messages_to_delete) {
            pool.delete_attributes(&queue, ids.into_iter().map(layout::task_column).collect(), None);
        }

        let tasks = std::mem::take(&mut self.new_client_messages);
        for (task, ts) in tasks {
            let ts = self.write_ts(ts);
            let queue = task.queue.clone().ok_or(QueueError::MissingQueue(task.task_id))?;
            pool.set(&queue, &layout::task_column(task.task_id), serde_json::to_vec(&task)?, ts, true);
        }

        let notifications: Vec<Notification> = std::mem::take(&mut self.notifications).into_values().collect();
        self.add_notifications(&mut pool, notifications)?;

        pool.flush(self.services.store.as_ref())?;
        Ok(())
    }

    fn add_notifications(&self, pool: &mut MutationPool, notifications: Vec<Notification>) -> Result<(), QueueError> {
        let now = self.now();
        let expiry = self.services.queue_config.notification_expiry;
        for mut n in notifications {
            match n.first_queued {
                None => n.first_queued = Some(now),
                Some(first) if now - first >= expiry => {
                    debug!("dropping expired notification session={} first_queued={first}", n.session_id);
                    continue;
                }
                Some(_) => {}
            }
            let ts = n.timestamp.unwrap_or(now);
            let shard = self.services.notification_shard(n.session_id.queue());
            let column = layout::notify_column(&n.session_id);
            if let Some(stored) = self.stored_last_status(&shard, &column, ts)? {
                if stored > n.last_status {
                    debug!("keeping stored notification session={} last_status={stored}", n.session_id);
                    continue;
                }
            }
            pool.set(&shard, &column, serde_json::to_vec(&n)?, ts, false);
        }
        Ok(())
    }

    /// `last_status` de la notificación ya escrita en `(shard, column, ts)`.
    fn stored_last_status(&self, shard: &str, column: &str, ts: DateTime<Utc>) -> Result<Option<u64>, QueueError> {
        let cells = self.services.store.resolve_prefix(shard, column, TimeRange::new(ts, ts))?;
        let mut best = None;
        for cell in cells.into_iter().filter(|c| c.column == column) {
            let n: Notification = serde_json::from_slice(&cell.value)?;
            best = best.max(Some(n.last_status));
        }
        Ok(best)
    }

    // ------------------------------------------------------------------
    // Estado de flows
    // ------------------------------------------------------------------

    fn read_state(&self, session_id: &SessionId, range: TimeRange) -> Result<FlowStateSnapshot, QueueError> {
        let cells = self.services.store.resolve_prefix(&layout::state_subject(session_id),
                                                       FLOW_STATE_PREFIX,
                                                       range)?;
        let mut snapshot = FlowStateSnapshot::default();
        for cell in latest_versions(cells) {
            if let Some(ids) = layout::parse_ids(&cell.column, layout::REQUEST_PREFIX) {
                if let [id] = ids.as_slice() {
                    snapshot.requests.insert(*id, serde_json::from_slice(&cell.value)?);
                }
            } else if let Some(ids) = layout::parse_ids(&cell.column, layout::STATUS_PREFIX) {
                if let [id] = ids.as_slice() {
                    snapshot.statuses.insert(*id, serde_json::from_slice(&cell.value)?);
                }
            } else if let Some(ids) = layout::parse_ids(&cell.column, RESPONSE_PREFIX) {
                if let [req, _] = ids.as_slice() {
                    let msg: Message = serde_json::from_slice(&cell.value)?;
                    snapshot.responses.entry(*req).or_default().push(msg);
                }
            }
        }
        Ok(snapshot)
    }

    /// Para cada request indica si ya tiene status.
    pub fn multi_check_status(&self, requests: &[RequestState]) -> Result<BTreeMap<u64, bool>, QueueError> {
        let mut by_session: BTreeMap<&SessionId, Vec<u64>> = BTreeMap::new();
        for r in requests {
            by_session.entry(&r.session_id).or_default().push(r.id);
        }
        let mut out = BTreeMap::new();
        for (session_id, ids) in by_session {
            let subject = layout::state_subject(session_id);
            let statuses = self.services.store.resolve_prefix(&subject, layout::STATUS_PREFIX, TimeRange::all())?;
            let present: BTreeSet<String> = statuses.into_iter().map(|c| c.column).collect();
            for id in ids {
                out.insert(id, present.contains(&layout::status_column(id)));
            }
        }
        Ok(out)
    }

    /// Requests con status visible dentro del rango, junto a su status.
    pub fn fetch_completed_requests(&self,
                                    session_id: &SessionId,
                                    range: Option<TimeRange>)
                                    -> Result<Vec<(RequestState, Message)>, QueueError> {
        let mut snapshot = self.read_state(session_id, range.unwrap_or_else(|| TimeRange::up_to(self.now())))?;
        Ok(snapshot.requests
                   .into_iter()
                   .filter_map(|(id, r)| snapshot.statuses.remove(&id).map(|s| (r, s)))
                   .collect())
    }

    /// Requests completos con sus responses ordenadas. Se detiene al superar
    /// `limit` responses y lo indica con el segundo valor (`more_data`).
    pub fn fetch_completed_responses(&self,
                                     session_id: &SessionId,
                                     range: Option<TimeRange>,
                                     limit: usize)
                                     -> Result<(CompletedRequests, bool), QueueError> {
        let mut snapshot = self.read_state(session_id, range.unwrap_or_else(|| TimeRange::up_to(self.now())))?;
        let mut out = Vec::new();
        let mut total = 0usize;
        for (id, request) in snapshot.requests {
            if !snapshot.statuses.contains_key(&id) {
                continue;
            }
            let mut responses = snapshot.responses.remove(&id).unwrap_or_default();
            responses.sort_by_key(|m| m.response_id);
            total += responses.len();
            if total > limit && !out.is_empty() {
                return Ok((out, true));
            }
            out.push((request, responses));
        }
        Ok((out, false))
    }

    /// Todos los requests del flow, completos o no, con lo recibido hasta ahora.
    pub fn fetch_requests_and_responses(&self, session_id: &SessionId) -> Result<CompletedRequests, QueueError> {
        let mut snapshot = self.read_state(session_id, TimeRange::all())?;
        Ok(snapshot.requests
                   .into_iter()
                   .map(|(id, r)| {
                       let mut responses = snapshot.responses.remove(&id).unwrap_or_default();
                       responses.sort_by_key(|m| m.response_id);
                       (r, responses)
                   })
                   .collect())
    }

    pub fn fetch_well_known_responses(&self, session_id: &SessionId) -> Result<Vec<Message>, QueueError> {
        let cells = self.services.store.resolve_prefix(&layout::state_subject(session_id),
                                                       &layout::response_prefix(WELL_KNOWN_REQUEST_ID),
                                                       TimeRange::up_to(self.now()))?;
        latest_versions(cells).into_iter()
                              .take(self.services.queue_config.well_known_response_limit)
                              .map(|c| serde_json::from_slice(&c.value).map_err(QueueError::from))
                              .collect()
    }

    pub fn delete_well_known_responses(&self, session_id: &SessionId, messages: &[Message]) -> Result<(), QueueError> {
        let columns: Vec<String> = messages.iter().map(|m| layout::well_known_column(m.task_id)).collect();
        self.services.store.delete_attributes(&layout::state_subject(session_id), &columns, None)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Colas de tasks
    // ------------------------------------------------------------------

    /// Escribe tasks inmediatamente, visibles desde `timestamp` (o ya).
    pub fn schedule(&self, tasks: &[Message], timestamp: Timestamp) -> Result<(), QueueError> {
        let ts = self.write_ts(timestamp);
        let mut pool = MutationPool::new();
        for task in tasks {
            let queue = task.queue.as_deref().ok_or(QueueError::MissingQueue(task.task_id))?;
            pool.set(queue, &layout::task_column(task.task_id), serde_json::to_vec(task)?, ts, true);
        }
        pool.flush(self.services.store.as_ref())?;
        Ok(())
    }

    /// Borra tasks de una cola. Borrar un task inexistente no es error.
    pub fn delete(&self, queue: &str, task_ids: &[u64]) -> Result<(), QueueError> {
        let columns: Vec<String> = task_ids.iter().copied().map(layout::task_column).collect();
        self.services.store.delete_attributes(queue, &columns, None)?;
        Ok(())
    }

    pub fn drop_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.services.store.delete_subject(queue)?;
        Ok(())
    }

    /// Lista tasks de la cola (visibles o con lease) sin tomarlos.
    pub fn query(&self, queue: &str, limit: usize, task_id: Option<u64>) -> Result<Vec<Message>, QueueError> {
        let cells = self.services.store.resolve_prefix(queue, TASK_PREDICATE_PREFIX, TimeRange::all())?;
        let mut tasks = decode_tasks(cells)?;
        if let Some(id) = task_id {
            tasks.retain(|t| t.task_id == id);
        }
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Toma hasta `limit` tasks visibles, por prioridad descendente, y los
    /// oculta durante `lease`. Cada entrega consume una unidad de TTL; un
    /// task sin TTL se descarta. Si la cola está bloqueada o el store falla
    /// devuelve vacío.
    pub fn query_and_own(&self, queue: &str, lease: Duration, limit: usize) -> Result<Vec<Message>, QueueError> {
        let _lock = match SubjectLock::acquire(&self.services.store, queue, lease) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("query_and_own: could not lock queue {queue}: {e}");
                return Ok(Vec::new());
            }
        };
        match self.lease_tasks(queue, lease, limit) {
            Err(QueueError::Store(e)) if !matches!(e, StoreError::Codec(_)) => {
                warn!("query_and_own: store error on {queue}: {e}");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn lease_tasks(&self, queue: &str, lease: Duration, limit: usize) -> Result<Vec<Message>, QueueError> {
        let now = self.now();
        let cells = self.services.store.resolve_prefix(queue, TASK_PREDICATE_PREFIX, TimeRange::up_to(now))?;
        let tasks = decode_tasks(cells)?;

        let stats = &self.services.stats;
        let lease_owner = lease_owner(&self.user);
        let mut pool = MutationPool::new();
        let mut owned = Vec::new();
        for mut task in tasks {
            if owned.len() >= limit {
                break;
            }
            task.ttl = task.ttl.saturating_sub(1);
            let column = layout::task_column(task.task_id);
            if task.ttl == 0 {
                info!("task {} on {queue} exhausted its ttl, dropping", task.task_id);
                pool.delete_attributes(queue, vec![column], None);
                stats.increment(TASK_TTL_EXPIRED_COUNT, &[]);
                continue;
            }
            if task.ttl != MAX_TASK_TTL - 1 {
                stats.increment(TASK_RETRANSMISSION_COUNT, &[]);
            }
            let expires = now + lease;
            task.last_lease = Some(lease_owner.clone());
            task.eta = Some(expires);
            pool.set(queue, &column, serde_json::to_vec(&task)?, expires, true);
            owned.push(task);
        }
        pool.flush(self.services.store.as_ref())?;
        Ok(owned)
    }

    // ------------------------------------------------------------------
    // Notificaciones
    // ------------------------------------------------------------------

    pub fn get_notification_shard(&self, queue: &str) -> String {
        self.services.notification_shard(queue)
    }

    pub fn get_all_notification_shards(&self, queue: &str) -> Vec<String> {
        self.services.all_notification_shards(queue)
    }

    /// Notificaciones visibles de un shard, una por flow.
    fn read_notifications(&self, shard: &str) -> Result<IndexMap<SessionId, Notification>, QueueError> {
        let cells = self.services.store.resolve_prefix(shard, NOTIFY_PREDICATE_PREFIX, TimeRange::up_to(self.now()))?;
        let mut out: IndexMap<SessionId, Notification> = IndexMap::new();
        for cell in cells {
            let mut n: Notification = serde_json::from_slice(&cell.value)?;
            n.timestamp = Some(cell.timestamp);
            collapse_notification(&mut out, n);
        }
        Ok(out)
    }

    fn bucket_notifications(&self,
                            queue: &str,
                            notifications: IndexMap<SessionId, Notification>)
                            -> BTreeMap<PriorityBucket, Vec<Notification>> {
        let mut buckets: BTreeMap<PriorityBucket, Vec<Notification>> = BTreeMap::new();
        for n in notifications.into_values() {
            let bucket = if n.in_progress { PriorityBucket::Stuck } else { PriorityBucket::Level(n.priority) };
            buckets.entry(bucket).or_default().push(n);
        }
        for (bucket, items) in &buckets {
            self.services.stats.set_gauge(NOTIFICATION_QUEUE_COUNT, items.len() as i64, &[queue, &bucket.to_string()]);
        }
        buckets
    }

    pub fn get_notifications_by_priority(&self,
                                         shard: &str)
                                         -> Result<BTreeMap<PriorityBucket, Vec<Notification>>, QueueError> {
        let notifications = self.read_notifications(shard)?;
        Ok(self.bucket_notifications(shard, notifications))
    }

    pub fn get_notifications_by_priority_for_all_shards(
        &self,
        queue: &str)
        -> Result<BTreeMap<PriorityBucket, Vec<Notification>>, QueueError> {
        let mut merged = IndexMap::new();
        for shard in self.get_all_notification_shards(queue) {
            for (_, n) in self.read_notifications(&shard)? {
                collapse_notification(&mut merged, n);
            }
        }
        Ok(self.bucket_notifications(queue, merged))
    }

    pub fn get_notifications(&self, shard: &str) -> Result<Vec<Notification>, QueueError> {
        Ok(sort_by_priority(self.read_notifications(shard)?))
    }

    pub fn get_notifications_for_all_shards(&self, queue: &str) -> Result<Vec<Notification>, QueueError> {
        let mut merged = IndexMap::new();
        for shard in self.get_all_notification_shards(queue) {
            for (_, n) in self.read_notifications(&shard)? {
                collapse_notification(&mut merged, n);
            }
        }
        Ok(sort_by_priority(merged))
    }

    pub fn delete_notification(&self, session_id: &SessionId, start: Timestamp, end: Timestamp) -> Result<(), QueueError> {
        self.delete_notifications(std::slice::from_ref(session_id), start, end)
    }

    /// Borra las versiones de notificación dentro de `[start, end]` en todos
    /// los shards. `end` por defecto es el instante de lectura actual.
    pub fn delete_notifications(&self, session_ids: &[SessionId], start: Timestamp, end: Timestamp) -> Result<(), QueueError> {
        let range = TimeRange::new(start.unwrap_or_default(), end.unwrap_or_else(|| self.now()));
        let mut pool = MutationPool::new();
        for session_id in session_ids {
            for shard in self.get_all_notification_shards(session_id.queue()) {
                pool.delete_attributes(&shard, vec![layout::notify_column(session_id)], Some(range));
            }
        }
        pool.flush(self.services.store.as_ref())?;
        Ok(())
    }

    /// Escritura inmediata de una notificación, fuera de `flush`.
    pub fn notify_queue(&self, notification: Notification) -> Result<(), QueueError> {
        self.multi_notify_queue(vec![notification])
    }

    pub fn multi_notify_queue(&self, notifications: Vec<Notification>) -> Result<(), QueueError> {
        let mut pool = MutationPool::new();
        self.add_notifications(&mut pool, notifications)?;
        pool.flush(self.services.store.as_ref())?;
        Ok(())
    }
}

#[derive(Default)]
struct FlowStateSnapshot {
    requests: BTreeMap<u64, RequestState>,
    statuses: BTreeMap<u64, Message>,
    responses: BTreeMap<u64, Vec<Message>>,
}

/// Última versión de cada columna, en orden de columna.
fn latest_versions(cells: Vec<Cell>) -> Vec<Cell> {
    let mut latest: BTreeMap<String, Cell> = BTreeMap::new();
    for cell in cells {
        match latest.get(&cell.column) {
            Some(prev) if prev.timestamp >= cell.timestamp => {}
            _ => {
                latest.insert(cell.column.clone(), cell);
            }
        }
    }
    latest.into_values().collect()
}

fn decode_tasks(cells: Vec<Cell>) -> Result<Vec<Message>, QueueError> {
    let mut tasks = Vec::new();
    for cell in latest_versions(cells) {
        let mut task: Message = serde_json::from_slice(&cell.value)?;
        task.eta = Some(cell.timestamp);
        tasks.push(task);
    }
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.task_id.cmp(&b.task_id)));
    Ok(tasks)
}

/// Una notificación por flow: gana la encolada más tarde; a igualdad, el
/// mayor `last_status`.
fn collapse_notification(out: &mut IndexMap<SessionId, Notification>, n: Notification) {
    match out.get(&n.session_id) {
        None => {
            out.insert(n.session_id.clone(), n);
        }
        Some(existing) => {
            if n.first_queued > existing.first_queued {
                out.insert(n.session_id.clone(), n);
            } else if n.first_queued == existing.first_queued && n.last_status != existing.last_status {
                warn!("conflicting notifications for {} with the same first_queued", n.session_id);
                if n.last_status > existing.last_status {
                    out.insert(n.session_id.clone(), n);
                }
            }
        }
    }
}

fn sort_by_priority(notifications: IndexMap<SessionId, Notification>) -> Vec<Notification> {
    let mut out: Vec<Notification> = notifications.into_values().collect();
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

fn lease_owner(user: &str) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}:{}", std::process::id())
}
