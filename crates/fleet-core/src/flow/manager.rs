//! Arranque, terminación y consulta de flows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Value};

use super::record::{self, FlowLogEntry};
use super::runner::{FlowRunner, StateInput};
use super::Responses;
use crate::constants::{AUDIT_CHANNEL, DEFAULT_WORKER_QUEUE, START_STATE};
use crate::errors::{FlowError, StoreError};
use crate::event::{AuditAction, AuditEvent, Event};
use crate::model::{AccessToken, ClientId, FlowContext, FlowRunnerArgs, Priority, RequestData, RequestState, SessionId,
                   Status, StatusCode};
use crate::queue::{CompletedRequests, QueueManager};
use crate::registry::FlowKind;
use crate::services::Services;
use crate::stats::FLOW_INVALID_FLOW_COUNT;
use crate::store::{lock_retry, SubjectLock};

const DEFAULT_TERMINATION_REASON: &str = "Manual termination by console.";
const PARENT_TERMINATED_REASON: &str = "Parent flow terminated.";
const LOCK_RETRY_WAIT: std::time::Duration = std::time::Duration::from_millis(50);

/// Parámetros de `StartFlow`.
#[derive(Debug, Clone)]
pub struct StartFlowRequest {
    pub flow_name: String,
    pub client_id: Option<ClientId>,
    pub args: Value,
    pub token: Option<AccessToken>,
    /// Ejecuta `Start` en el hilo llamador. Se ignora si hay `start_time`.
    pub sync: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub cpu_limit: Option<f64>,
    pub network_bytes_limit: Option<u64>,
    pub queue: String,
    pub notification_event: Option<String>,
}

impl StartFlowRequest {
    pub fn new(flow_name: &str) -> Self {
        Self { flow_name: flow_name.to_string(),
               client_id: None,
               args: json!({}),
               token: None,
               sync: true,
               start_time: None,
               priority: Priority::Medium,
               cpu_limit: None,
               network_bytes_limit: None,
               queue: DEFAULT_WORKER_QUEUE.to_string(),
               notification_event: None }
    }

    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn token(mut self, token: AccessToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cpu_limit(mut self, seconds: f64) -> Self {
        self.cpu_limit = Some(seconds);
        self
    }

    pub fn network_bytes_limit(mut self, bytes: u64) -> Self {
        self.network_bytes_limit = Some(bytes);
        self
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn notification_event(mut self, channel: &str) -> Self {
        self.notification_event = Some(channel.to_string());
        self
    }
}

/// Enlace de un flow hijo con el request del padre que lo lanzó.
pub(crate) struct ParentLink {
    pub request_state: RequestState,
    pub queue_manager: QueueManager,
}

fn validate_start(services: &Services, req: &StartFlowRequest) -> Result<AccessToken, FlowError> {
    let Some(kind) = services.flows.kind_of(&req.flow_name) else {
        services.stats.increment(FLOW_INVALID_FLOW_COUNT, &[]);
        return Err(FlowError::UnknownFlow(req.flow_name.clone()));
    };
    let token = req.token
                   .as_ref()
                   .ok_or_else(|| FlowError::Unauthorized("A token must be specified.".into()))?
                   .set_uid();
    match kind {
        FlowKind::WellKnown => {
            Err(FlowError::InvalidArgs(format!("well-known flow {} can not be started", req.flow_name)))
        }
        FlowKind::Ordinary if req.client_id.is_none() => {
            Err(FlowError::InvalidArgs(format!("no client_id specified for flow {}", req.flow_name)))
        }
        _ => Ok(token),
    }
}

/// Crea un flow y ejecuta (o programa) su estado `Start`.
///
/// Para un flow hijo (`parent` presente) no se escribe nada en el store
/// salvo su registro: los mensajes vuelven en el `QueueManager` devuelto
/// para que el padre los vacíe junto a los suyos.
pub(crate) fn start_flow_impl(services: &Arc<Services>,
                              req: StartFlowRequest,
                              parent: Option<ParentLink>)
                              -> Result<(SessionId, Option<QueueManager>), FlowError> {
    let token = validate_start(services, &req)?;
    let descriptor = services.flows
                             .get(&req.flow_name)
                             .ok_or_else(|| FlowError::UnknownFlow(req.flow_name.clone()))?;

    if let (Some(allowed), Some(given)) = (&descriptor.arg_names, req.args.as_object()) {
        let unknown: Vec<&str> =
            given.keys().filter(|k| !allowed.iter().any(|a| a == *k)).map(String::as_str).collect();
        if !unknown.is_empty() {
            return Err(FlowError::InvalidArgs(format!("Unknown parameters to StartFlow: {}", unknown.join(", "))));
        }
    }
    let flow = descriptor.instantiate();
    flow.validate_args(&req.args)?;

    let sync = req.sync && req.start_time.is_none();
    let session_id = SessionId::new(&req.queue);
    let (parent_request, queue_manager) = match parent {
        Some(link) => (Some(link.request_state), link.queue_manager),
        None => (None, QueueManager::new(Arc::clone(services), token.username.clone())),
    };
    let nested = parent_request.is_some();
    let runner_args = FlowRunnerArgs { flow_name: req.flow_name.clone(),
                                       client_id: req.client_id.clone(),
                                       queue: req.queue.clone(),
                                       priority: req.priority,
                                       cpu_limit: req.cpu_limit,
                                       network_bytes_limit: req.network_bytes_limit,
                                       start_time: req.start_time,
                                       notification_event: req.notification_event.clone(),
                                       request_state: parent_request };
    let mut runner = FlowRunner::create(Arc::clone(services),
                                        session_id.clone(),
                                        flow,
                                        req.args.clone(),
                                        runner_args,
                                        token.clone(),
                                        queue_manager)?;
    if !nested {
        let lock = SubjectLock::acquire(&services.store, session_id.as_str(), services.worker_config.flow_lease)?;
        runner.set_lock(lock);
    }

    info!("Scheduling {session_id}({}) on {}",
          req.flow_name,
          req.client_id.as_ref().map(ClientId::as_str).unwrap_or("fleet"));

    if sync {
        runner.dispatch(START_STATE, StateInput::Direct(Responses::empty()))?;
    } else {
        runner.queue_state_call(START_STATE, Vec::new(), RequestData::new(), req.start_time)?;
    }
    if runner.outstanding_requests() == 0 {
        runner.terminate(None)?;
    }

    if nested {
        return Ok((session_id, Some(runner.into_queue_manager()?)));
    }

    runner.close()?;
    let event = AuditEvent { user: token.username.clone(),
                             action: AuditAction::RunFlow,
                             flow_name: req.flow_name,
                             session_id: session_id.clone(),
                             client_id: req.client_id,
                             description: token.reason.clone(),
                             timestamp: services.now() };
    services.events.publish(AUDIT_CHANNEL, Event::Audit(event));
    Ok((session_id, None))
}

/// Punto de entrada administrativo sobre flows.
#[derive(Clone)]
pub struct FlowManager {
    services: Arc<Services>,
}

impl FlowManager {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn start_flow(&self, req: StartFlowRequest) -> Result<SessionId, FlowError> {
        start_flow_impl(&self.services, req, None).map(|(session_id, _)| session_id)
    }

    fn queue_manager(&self, token: &AccessToken) -> QueueManager {
        QueueManager::new(Arc::clone(&self.services), token.username.clone())
    }

    /// Abre un flow con su lease. Sin bloqueo, un flow ocupado devuelve
    /// `StoreError::LockContention`.
    pub fn open_with_lock(&self,
                          session_id: &SessionId,
                          blocking: bool,
                          token: &AccessToken)
                          -> Result<FlowRunner, FlowError> {
        let lease = self.services.worker_config.flow_lease;
        let lock = if blocking {
            lock_retry(&self.services.store,
                       session_id.as_str(),
                       lease,
                       self.services.worker_config.lock_retries,
                       LOCK_RETRY_WAIT)?
        } else {
            SubjectLock::acquire(&self.services.store, session_id.as_str(), lease)?
        };
        FlowRunner::open(Arc::clone(&self.services), session_id, token.clone(), Some(lock), self.queue_manager(token))
    }

    /// Termina un flow y, recursivamente, a sus hijos.
    pub fn terminate_flow(&self,
                          session_id: &SessionId,
                          reason: Option<&str>,
                          status: Option<Status>,
                          token: Option<&AccessToken>,
                          force: bool)
                          -> Result<(), FlowError> {
        let token = token.ok_or_else(|| FlowError::Unauthorized("A token must be specified.".into()))?;
        let mut runner = if force {
            FlowRunner::open(Arc::clone(&self.services), session_id, token.clone(), None, self.queue_manager(token))?
        } else {
            self.open_with_lock(session_id, true, token)?
        };
        if !runner.is_running() {
            return Ok(());
        }

        let reason = reason.unwrap_or(DEFAULT_TERMINATION_REASON);
        let code = status.map(|s| s.code).unwrap_or(StatusCode::GenericError);
        runner.error(Some(reason.to_string()), code)?;
        runner.log(format!("Terminated by user {}. Reason: {reason}", token.username));
        let children = runner.context().children.clone();
        let flow_name = runner.flow_name().to_string();
        let client_id = runner.client_id().cloned();
        runner.close()?;

        let event = AuditEvent { user: token.username.clone(),
                                 action: AuditAction::TerminateFlow,
                                 flow_name,
                                 session_id: session_id.clone(),
                                 client_id,
                                 description: Some(reason.to_string()),
                                 timestamp: self.services.now() };
        self.services.events.publish(AUDIT_CHANNEL, Event::Audit(event));

        let supervisor = token.set_uid();
        for child in children {
            match self.terminate_flow(&child, Some(PARENT_TERMINATED_REASON), None, Some(&supervisor), force) {
                Err(FlowError::FlowNotFound(_)) => warn!("child flow {child} of {session_id} not found"),
                other => other?,
            }
        }
        Ok(())
    }

    /// Marca el flow para que termine en su próximo turno. No toma el lease.
    pub fn mark_for_termination(&self, session_id: &SessionId, reason: &str) -> Result<(), FlowError> {
        record::write_pending_termination(self.services.store.as_ref(), session_id, reason, self.services.now())
    }

    pub fn flow_context(&self, session_id: &SessionId) -> Result<FlowContext, FlowError> {
        record::load_record(self.services.store.as_ref(), session_id)?
            .map(|r| r.context)
            .ok_or_else(|| FlowError::FlowNotFound(session_id.to_string()))
    }

    pub fn flow_logs(&self, session_id: &SessionId) -> Result<Vec<FlowLogEntry>, FlowError> {
        record::read_logs(self.services.store.as_ref(), session_id)
    }

    pub fn flow_results(&self, session_id: &SessionId) -> Result<Vec<Value>, FlowError> {
        record::read_results(self.services.store.as_ref(), session_id)
    }

    /// Requests pendientes del flow con las responses recibidas.
    pub fn get_flow_requests(&self, session_id: &SessionId) -> Result<CompletedRequests, FlowError> {
        let qm = QueueManager::new(Arc::clone(&self.services), crate::constants::WORKER_USERNAME);
        Ok(qm.fetch_requests_and_responses(session_id)?)
    }
}

/// `true` si el error indica que otro proceso tiene el flow.
pub fn is_lock_contention(err: &FlowError) -> bool {
    matches!(err, FlowError::Store(StoreError::LockContention(_)))
}
