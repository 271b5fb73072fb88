//! Worker loop: descubre flows con trabajo pendiente a través de las
//! notificaciones y los ejecuta bajo su lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::constants::WORKER_USERNAME;
use crate::errors::FlowError;
use crate::flow::{is_lock_contention, FlowManager};
use crate::model::{AccessToken, AuthState, FlowState, Notification, PriorityBucket};
use crate::queue::QueueManager;
use crate::registry::WellKnownEntry;
use crate::services::Services;
use crate::stats::{WELL_KNOWN_FLOW_ERRORS, WELL_KNOWN_FLOW_REQUESTS};

pub struct Worker {
    services: Arc<Services>,
    flows: FlowManager,
    queue_manager: QueueManager,
    token: AccessToken,
}

impl Worker {
    pub fn new(services: Arc<Services>) -> Self {
        let token = AccessToken::new(WORKER_USERNAME).with_reason("Worker processing").set_uid();
        Self { flows: FlowManager::new(Arc::clone(&services)),
               queue_manager: QueueManager::new(Arc::clone(&services), WORKER_USERNAME),
               token,
               services }
    }

    /// Una pasada por todas las colas del worker con el tiempo congelado: a
    /// lo sumo una notificación por cola, la de mayor prioridad. Devuelve
    /// cuántas se procesaron.
    pub fn run_once(&mut self) -> Result<usize, FlowError> {
        self.queue_manager.freeze_timestamp();
        let result = self.process_queues();
        self.queue_manager.unfreeze_timestamp()?;
        result
    }

    /// Itera hasta que `stop` se active; duerme cuando no hay trabajo.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), FlowError> {
        info!("worker started on queues {:?}", self.services.worker_config.queues);
        while !stop.load(Ordering::Relaxed) {
            match self.run_once() {
                Ok(0) => std::thread::sleep(self.services.worker_config.poll_interval),
                Ok(_) => {}
                Err(e) if is_store_failure(&e) => {
                    warn!("worker turn aborted, retrying on next poll: {e}");
                    std::thread::sleep(self.services.worker_config.poll_interval);
                }
                Err(e) => return Err(e),
            }
        }
        info!("worker stopped");
        Ok(())
    }

    fn process_queues(&mut self) -> Result<usize, FlowError> {
        let mut processed = 0;
        for queue in self.services.worker_config.queues.clone() {
            let mut buckets = self.queue_manager.get_notifications_by_priority_for_all_shards(&queue)?;
            let stuck = buckets.remove(&PriorityBucket::Stuck).unwrap_or_default();
            let normal: Vec<Notification> = buckets.into_values().rev().flatten().collect();
            let next = if normal.is_empty() { stuck } else { normal }.into_iter().next();
            if let Some(notification) = next {
                self.process_notification(notification)?;
                processed += 1;
            }
        }
        Ok(processed)
    }

    fn process_notification(&mut self, notification: Notification) -> Result<(), FlowError> {
        let session_id = notification.session_id.clone();
        self.queue_manager.delete_notification(&session_id, None, notification.timestamp)?;

        if let Some(entry) = self.services.flows.well_known(&session_id).cloned() {
            return self.process_well_known(&entry);
        }

        let mut runner = match self.flows.open_with_lock(&session_id, false, &self.token) {
            Ok(runner) => runner,
            Err(e) if is_lock_contention(&e) => {
                debug!("flow {session_id} is busy, requeueing its notification");
                let mut retry = notification;
                retry.timestamp = None;
                self.queue_manager.notify_queue(retry)?;
                return Ok(());
            }
            Err(FlowError::FlowNotFound(_)) => {
                warn!("notification for unknown flow {session_id}, dropping it");
                return Ok(());
            }
            Err(e) => {
                error!("unable to open flow {session_id}: {e}");
                return Ok(());
            }
        };

        match runner.process_completed_requests(Some(&notification)) {
            Ok(()) => {}
            Err(e) if is_store_failure(&e) => {
                // Sin commit: soltar el runner libera el lease y la
                // notificación vuelve a la cola con su `first_queued`.
                warn!("processing flow {session_id} hit a store error, requeueing: {e}");
                drop(runner);
                let mut retry = notification;
                retry.timestamp = None;
                self.queue_manager.notify_queue(retry)?;
                return Err(e);
            }
            Err(e) => error!("processing flow {session_id} failed: {e}"),
        }
        let failed = runner.context().state == FlowState::Error;
        let reason = runner.context().backtrace.clone().unwrap_or_default();
        if let Err(e) = runner.close() {
            error!("closing flow {session_id} failed: {e}");
        }
        if failed && self.services.worker_config.check_flow_errors {
            return Err(FlowError::FlowFailed { session: session_id.to_string(), reason });
        }
        Ok(())
    }

    fn process_well_known(&self, entry: &WellKnownEntry) -> Result<(), FlowError> {
        let messages = self.queue_manager.fetch_well_known_responses(&entry.session_id)?;
        if messages.is_empty() {
            return Ok(());
        }
        self.queue_manager.delete_well_known_responses(&entry.session_id, &messages)?;
        let stats = &self.services.stats;
        stats.increment_by(WELL_KNOWN_FLOW_REQUESTS, messages.len() as u64, &[&entry.name]);

        let allow_unauthenticated = entry.flow.allow_unauthenticated();
        let accepted: Vec<_> = messages.into_iter()
                                       .filter(|m| allow_unauthenticated || m.auth_state == AuthState::Authenticated)
                                       .collect();
        let services: &Services = &self.services;
        accepted.par_iter().for_each(|msg| {
                               if let Err(e) = entry.flow.process_message(msg, services) {
                                   error!("well-known flow {} failed on message {}: {e}", entry.name, msg.task_id);
                                   services.stats.increment(WELL_KNOWN_FLOW_ERRORS, &[&entry.name]);
                               }
                           });
        Ok(())
    }
}

/// Errores del store o de la cola: abortan el turno sin commit.
fn is_store_failure(err: &FlowError) -> bool {
    matches!(err, FlowError::Store(_) | FlowError::Queue(_))
}
