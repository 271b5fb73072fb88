//! Runner de un flow: ejecuta state handlers, emite llamadas y lleva el
//! contexto persistido.
//!
//! Un runner vive lo que dura un turno: se abre (o crea) con el lease del
//! flow, procesa los requests completos y se cierra. Todas las escrituras
//! del turno pasan por su `QueueManager`; el registro del flow se persiste
//! antes de vaciar ese buffer, de modo que nunca se publica una
//! notificación o un task que apunte a un estado aún no guardado.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;

use super::manager::{start_flow_impl, ParentLink, StartFlowRequest};
use super::record::{self, FlowLogEntry, FlowRecord};
use super::{Flow, Responses};
use crate::constants::{END_STATE, START_STATE};
use crate::errors::FlowError;
use crate::event::{Event, FlowStatusEvent};
use crate::model::{AccessToken, ClientId, FlowContext, FlowRunnerArgs, FlowState, FlowStateDict, Message,
                   Notification, RequestData, RequestState, SessionId, Status, StatusCode};
use crate::queue::QueueManager;
use crate::services::Services;
use crate::stats::{FLOW_COMPLETIONS, FLOW_ERRORS, FLOW_STARTS, REQUEST_RETRANSMISSION_COUNT, RESPONSE_OUT_OF_ORDER,
                   WORKER_STATES_RUN};
use crate::store::{MutationPool, SubjectLock, TimeRange};

const MAX_REQUEST_TRANSMISSIONS: u32 = 5;
const CPU_LIMIT_EXCEEDED: &str = "CPU limit exceeded.";
const NETWORK_LIMIT_EXCEEDED: &str = "Network bytes limit exceeded.";

/// Entrada de un state handler.
pub enum StateInput {
    /// Request persistido y sus mensajes crudos; se colan antes de despachar.
    Collate { request: RequestState, messages: Vec<Message> },
    /// Responses ya construidas en memoria.
    Direct(Responses),
}

/// Parámetros de `FlowRunner::call_client_with`.
#[derive(Debug, Clone)]
pub struct ClientCall {
    pub action: String,
    pub next_state: String,
    pub payload: Value,
    pub args_type: Option<String>,
    pub request_data: RequestData,
    /// Cliente destino; por defecto el del flow.
    pub client_id: Option<ClientId>,
    /// Visibilidad diferida del task.
    pub start_time: Option<DateTime<Utc>>,
}

impl ClientCall {
    pub fn new(action: &str, next_state: &str) -> Self {
        Self { action: action.to_string(),
               next_state: next_state.to_string(),
               payload: Value::Null,
               args_type: None,
               request_data: RequestData::new(),
               client_id: None,
               start_time: None }
    }

    pub fn payload(mut self, payload: Value, args_type: &str) -> Self {
        self.payload = payload;
        self.args_type = Some(args_type.to_string());
        self
    }

    pub fn request_data(mut self, data: RequestData) -> Self {
        self.request_data = data;
        self
    }

    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }
}

pub struct FlowRunner {
    services: Arc<Services>,
    session_id: SessionId,
    context: FlowContext,
    args: Value,
    runner_args: FlowRunnerArgs,
    state: FlowStateDict,
    flow: Option<Box<dyn Flow>>,
    states: &'static [&'static str],
    queue_manager: QueueManager,
    lock: Option<SubjectLock>,
    token: AccessToken,
    pending_inline: VecDeque<(String, Responses)>,
    pending_logs: Vec<FlowLogEntry>,
    pending_results: Vec<Value>,
}

impl FlowRunner {
    /// Runner de un flow recién creado, ya en `Running`.
    pub(crate) fn create(services: Arc<Services>,
                         session_id: SessionId,
                         mut flow: Box<dyn Flow>,
                         args: Value,
                         runner_args: FlowRunnerArgs,
                         token: AccessToken,
                         queue_manager: QueueManager)
                         -> Result<Self, FlowError> {
        let state = FlowStateDict::new();
        flow.initialize(&args, &state)?;
        let mut context = FlowContext::new(session_id.clone(), token.username.clone(), services.now());
        context.state = FlowState::Running;
        let states = flow.states();
        Ok(Self { services,
                  session_id,
                  context,
                  args,
                  runner_args,
                  state,
                  flow: Some(flow),
                  states,
                  queue_manager,
                  lock: None,
                  token,
                  pending_inline: VecDeque::new(),
                  pending_logs: Vec::new(),
                  pending_results: Vec::new() })
    }

    pub(crate) fn set_lock(&mut self, lock: SubjectLock) {
        self.lock = Some(lock);
    }

    /// Reconstruye el runner desde el registro persistido.
    pub fn open(services: Arc<Services>,
                session_id: &SessionId,
                token: AccessToken,
                lock: Option<SubjectLock>,
                queue_manager: QueueManager)
                -> Result<Self, FlowError> {
        let rec = record::load_record(services.store.as_ref(), session_id)?
            .ok_or_else(|| FlowError::FlowNotFound(session_id.to_string()))?;
        let descriptor = services.flows
                                 .get(&rec.runner_args.flow_name)
                                 .ok_or_else(|| FlowError::UnknownFlow(rec.runner_args.flow_name.clone()))?;
        let mut flow = descriptor.instantiate();
        flow.initialize(&rec.args, &rec.state_dict)?;
        let states = flow.states();
        Ok(Self { services,
                  session_id: session_id.clone(),
                  context: rec.context,
                  args: rec.args,
                  runner_args: rec.runner_args,
                  state: rec.state_dict,
                  flow: Some(flow),
                  states,
                  queue_manager,
                  lock,
                  token,
                  pending_inline: VecDeque::new(),
                  pending_logs: Vec::new(),
                  pending_results: Vec::new() })
    }

    // ------------------------------------------------------------------
    // Accesores
    // ------------------------------------------------------------------

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn flow_name(&self) -> &str {
        &self.runner_args.flow_name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.runner_args.client_id.as_ref()
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    pub fn runner_args(&self) -> &FlowRunnerArgs {
        &self.runner_args
    }

    pub fn state(&self) -> &FlowStateDict {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut FlowStateDict {
        &mut self.state
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.context.state == FlowState::Running
    }

    pub fn outstanding_requests(&self) -> u64 {
        self.context.outstanding_requests
    }

    fn has_state(&self, state: &str) -> bool {
        state == END_STATE || self.states.contains(&state)
    }

    fn ensure_state(&self, state: &str) -> Result<(), FlowError> {
        if self.has_state(state) {
            Ok(())
        } else {
            Err(FlowError::UnknownState { flow: self.runner_args.flow_name.clone(), state: state.to_string() })
        }
    }

    fn allocate_request_id(&mut self) -> u64 {
        let id = self.context.next_outbound_id;
        self.context.next_outbound_id += 1;
        id
    }

    fn notification(&self, session_id: SessionId, last_status: u64) -> Notification {
        Notification::new(session_id).with_priority(self.runner_args.priority).with_last_status(last_status)
    }

    // ------------------------------------------------------------------
    // Llamadas salientes
    // ------------------------------------------------------------------

    pub fn call_client(&mut self,
                       action: &str,
                       payload: Value,
                       args_type: &str,
                       next_state: &str)
                       -> Result<u64, FlowError> {
        self.call_client_with(ClientCall::new(action, next_state).payload(payload, args_type))
    }

    /// Encola un task para el cliente y el request que recogerá su
    /// respuesta en `next_state`. Devuelve el id del request.
    pub fn call_client_with(&mut self, call: ClientCall) -> Result<u64, FlowError> {
        if self.services.actions.get(&call.action).is_none() {
            return Err(FlowError::UnknownAction(call.action));
        }
        self.ensure_state(&call.next_state)?;
        let client_id = call.client_id
                            .or_else(|| self.runner_args.client_id.clone())
                            .ok_or_else(|| FlowError::InvalidArgs("CallClient needs a client id".into()))?;

        let mut task = Message::new(self.session_id.clone());
        task.name = call.action.clone();
        task.payload = call.payload;
        task.args_type = call.args_type;
        task.priority = self.runner_args.priority;
        task.queue = Some(client_id.queue());

        let used = self.context.client_resources;
        if let Some(limit) = self.runner_args.cpu_limit {
            let remaining = (limit - used.cpu_usage.total()).max(0.0);
            if remaining == 0.0 {
                return Err(FlowError::ResourceLimitExceeded(CPU_LIMIT_EXCEEDED.into()));
            }
            task.cpu_limit = Some(remaining);
        }
        if let Some(limit) = self.runner_args.network_bytes_limit {
            let remaining = limit.saturating_sub(used.network_bytes_sent);
            if remaining == 0 {
                return Err(FlowError::ResourceLimitExceeded(NETWORK_LIMIT_EXCEEDED.into()));
            }
            task.network_bytes_limit = Some(remaining);
        }

        let request_id = self.allocate_request_id();
        task.request_id = request_id;
        task.task_id = self.services.next_task_id();

        let mut request = RequestState::new(request_id, self.session_id.clone(), call.next_state);
        request.client_id = Some(client_id.clone());
        request.data = call.request_data;
        request.request = Some(task.clone());

        debug!("{} calling {} on {client_id} (request {request_id})", self.session_id, call.action);
        self.queue_manager.queue_request(request, call.start_time);
        self.queue_manager.queue_client_message(task, call.start_time);
        self.context.outstanding_requests += 1;
        Ok(request_id)
    }

    /// Arranca un flow hijo cuyo status final llegará a `next_state`.
    pub fn call_flow(&mut self,
                     flow_name: &str,
                     next_state: &str,
                     args: Value,
                     request_data: RequestData)
                     -> Result<SessionId, FlowError> {
        self.ensure_state(next_state)?;
        let request_id = self.allocate_request_id();
        let mut request = RequestState::new(request_id, self.session_id.clone(), next_state);
        request.client_id = self.runner_args.client_id.clone();
        request.data = request_data;

        let used = self.context.client_resources;
        let mut start = StartFlowRequest::new(flow_name).args(args)
                                                        .token(self.token.clone())
                                                        .priority(self.runner_args.priority)
                                                        .queue(&self.runner_args.queue);
        if let Some(client) = &self.runner_args.client_id {
            start = start.client_id(client.clone());
        }
        if let Some(limit) = self.runner_args.cpu_limit {
            start = start.cpu_limit((limit - used.cpu_usage.total()).max(0.0));
        }
        if let Some(limit) = self.runner_args.network_bytes_limit {
            start = start.network_bytes_limit(limit.saturating_sub(used.network_bytes_sent));
        }

        let link = ParentLink { request_state: request.clone(), queue_manager: self.queue_manager.copy() };
        let (child, child_queue) = start_flow_impl(&self.services, start, Some(link))?;
        if let Some(child_queue) = child_queue {
            self.queue_manager.merge(child_queue);
        }
        self.queue_manager.queue_request(request, None);
        self.context.children.push(child.clone());
        self.context.outstanding_requests += 1;
        Ok(child)
    }

    /// Invoca otro estado del mismo flow. Sin `start_time` se ejecuta en
    /// este mismo turno, tras el handler actual; con `start_time` se
    /// persiste como request y se procesa cuando llegue ese instante.
    pub fn call_state(&mut self,
                      next_state: &str,
                      payloads: Vec<Value>,
                      request_data: RequestData,
                      start_time: Option<DateTime<Utc>>)
                      -> Result<(), FlowError> {
        self.ensure_state(next_state)?;
        match start_time {
            Some(_) => self.queue_state_call(next_state, payloads, request_data, start_time),
            None => {
                let messages = payloads.into_iter()
                                       .enumerate()
                                       .map(|(i, p)| Message::response(self.session_id.clone(), 0, i as u64 + 1, p))
                                       .collect();
                self.pending_inline.push_back((next_state.to_string(), Responses::direct(messages, request_data)));
                Ok(())
            }
        }
    }

    /// Persiste un request a sí mismo con sus responses, su status y la
    /// notificación, todo visible desde `start_time`.
    pub(crate) fn queue_state_call(&mut self,
                                   next_state: &str,
                                   payloads: Vec<Value>,
                                   request_data: RequestData,
                                   start_time: Option<DateTime<Utc>>)
                                   -> Result<(), FlowError> {
        let request_id = self.allocate_request_id();
        let mut request = RequestState::new(request_id, self.session_id.clone(), next_state);
        request.data = request_data;
        self.queue_manager.queue_request(request, start_time);

        let count = payloads.len() as u64;
        for (i, payload) in payloads.into_iter().enumerate() {
            let msg = Message::response(self.session_id.clone(), request_id, i as u64 + 1, payload);
            self.queue_manager.queue_response(msg, start_time);
        }
        let status = Message::status(self.session_id.clone(), request_id, count + 1, &Status::ok())?;
        self.queue_manager.queue_response(status, start_time);
        let n = self.notification(self.session_id.clone(), request_id);
        self.queue_manager.queue_notification(n, start_time);
        self.context.outstanding_requests += 1;
        Ok(())
    }

    /// Ejecuta `next_state` ahora mismo si el flow está disponible; si no
    /// (se está ejecutando un handler) lo adelanta en la cola inline.
    pub fn call_state_inline(&mut self, next_state: &str, payloads: Vec<Value>, request_data: RequestData)
                             -> Result<(), FlowError> {
        self.ensure_state(next_state)?;
        let messages = payloads.into_iter()
                               .enumerate()
                               .map(|(i, p)| Message::response(self.session_id.clone(), 0, i as u64 + 1, p))
                               .collect();
        let responses = Responses::direct(messages, request_data);
        if self.flow.is_some() {
            self.dispatch(next_state, StateInput::Direct(responses))
        } else {
            self.pending_inline.push_front((next_state.to_string(), responses));
            Ok(())
        }
    }

    /// Emite un resultado: al padre si lo hay y siempre a la colección de
    /// resultados del flow.
    pub fn send_reply(&mut self, payload: Value) -> Result<(), FlowError> {
        if let Some(parent) = self.runner_args.request_state.as_mut() {
            parent.response_count += 1;
            let msg = Message::response(parent.session_id.clone(), parent.id, parent.response_count, payload.clone());
            self.queue_manager.queue_response(msg, None);
        }
        self.pending_results.push(payload);
        Ok(())
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}: {message}", self.session_id);
        self.pending_logs.push(FlowLogEntry { session_id: self.session_id.clone(),
                                              timestamp: self.services.now(),
                                              message });
    }

    pub fn status(&mut self, message: impl Into<String>) {
        self.context.status = Some(message.into());
    }

    // ------------------------------------------------------------------
    // Despacho
    // ------------------------------------------------------------------

    /// Ejecuta un estado y luego las continuaciones inline que deje.
    pub fn dispatch(&mut self, state: &str, input: StateInput) -> Result<(), FlowError> {
        self.dispatch_one(state, input)?;
        while self.is_running() {
            let Some((next, responses)) = self.pending_inline.pop_front() else {
                break;
            };
            self.dispatch_one(&next, StateInput::Direct(responses))?;
        }
        Ok(())
    }

    fn dispatch_one(&mut self, state: &str, input: StateInput) -> Result<(), FlowError> {
        if let Some(pending) = record::read_pending_termination(self.services.store.as_ref(), &self.session_id)? {
            if self.is_running() {
                self.log(format!("Pending termination: {}", pending.reason));
                self.error(Some(pending.reason), StatusCode::GenericError)?;
            }
            return Ok(());
        }

        let auth_required = self.flow.as_ref().map(|f| f.auth_required(state)).unwrap_or(true);
        let responses = match input {
            StateInput::Collate { request, messages } => {
                Responses::collate(request, messages, auth_required, &self.services.actions)?
            }
            StateInput::Direct(responses) => responses,
        };
        if let Some(status) = responses.status() {
            self.save_resource_usage(status)?;
        }

        let stats = Arc::clone(&self.services.stats);
        stats.increment(WORKER_STATES_RUN, &[]);
        if state == START_STATE {
            stats.increment(FLOW_STARTS, &[self.flow_name()]);
        }
        self.ensure_state(state)?;
        if state == END_STATE && !self.states.contains(&END_STATE) {
            return Ok(());
        }

        let mut flow = self.flow
                           .take()
                           .ok_or_else(|| FlowError::handler(format!("flow {} is already executing", self.session_id)))?;
        let result = flow.handle_state(state, self, &responses);
        self.flow = Some(flow);
        result
    }

    /// Ejecuta un estado capturando sus errores: un fallo del handler deja
    /// el flow en `Error` en lugar de propagarse.
    pub fn run_state_method(&mut self, state: &str, input: StateInput) -> Result<(), FlowError> {
        self.context.current_state = state.to_string();
        self.heartbeat()?;
        let Err(err) = self.dispatch(state, input) else {
            return Ok(());
        };
        self.services.stats.increment(FLOW_ERRORS, &[self.flow_name()]);
        let code = match &err {
            FlowError::ResourceLimitExceeded(msg) => {
                warn!("flow {} hit its resource limits: {msg}", self.session_id);
                if msg == CPU_LIMIT_EXCEEDED {
                    StatusCode::CpuLimitExceeded
                } else {
                    StatusCode::NetworkLimitExceeded
                }
            }
            _ => StatusCode::GenericError,
        };
        error!("flow {} raised in state {state}: {err}", self.session_id);
        self.error(Some(err.to_string()), code)
    }

    /// Procesa, en orden y sin huecos, los requests completos visibles hasta
    /// la notificación recibida.
    pub fn process_completed_requests(&mut self, notification: Option<&Notification>) -> Result<(), FlowError> {
        let range = TimeRange::up_to(notification.and_then(|n| n.timestamp).unwrap_or_else(|| self.queue_manager.now()));

        let mut dequeue = self.queue_manager.copy();
        for (request, _) in self.queue_manager.fetch_completed_requests(&self.session_id, Some(range))? {
            if let (Some(task), Some(client)) = (&request.request, &request.client_id) {
                dequeue.dequeue_client_request(client, task.task_id);
            }
        }
        dequeue.flush()?;

        if !self.is_running() {
            self.queue_manager.destroy_flow_states(&self.session_id)?;
            return Ok(());
        }

        let limit = self.services.queue_config.response_limit;
        let (completed, more_data) = self.queue_manager.fetch_completed_responses(&self.session_id, Some(range), limit)?;
        let mut interrupted = false;
        for (mut request, responses) in completed {
            if request.id == 0 {
                continue;
            }
            if responses.is_empty() {
                interrupted = true;
                break;
            }
            if request.id > self.context.next_processed_request {
                self.services.stats.increment(RESPONSE_OUT_OF_ORDER, &[]);
                interrupted = true;
                break;
            }
            if request.id < self.context.next_processed_request {
                self.queue_manager.delete_request(&request);
                continue;
            }

            let distinct = {
                let mut ids: Vec<u64> = responses.iter().map(|m| m.response_id).collect();
                ids.dedup();
                ids.len() as u64
            };
            let last = responses.last().map(|m| m.response_id).unwrap_or(0);
            if distinct != last {
                if request.transmission_count < MAX_REQUEST_TRANSMISSIONS {
                    warn!("{} request {} is missing responses, retransmitting", self.session_id, request.id);
                    self.services.stats.increment(REQUEST_RETRANSMISSION_COUNT, &[]);
                    request.transmission_count += 1;
                    self.requeue_request(request);
                }
                interrupted = true;
                break;
            }

            if !self.is_running() {
                interrupted = true;
                break;
            }
            let next_state = request.next_state.clone();
            self.queue_manager.delete_request(&request);
            self.run_state_method(&next_state, StateInput::Collate { request, messages: responses })?;
            self.context.next_processed_request += 1;
            self.context.outstanding_requests = self.context.outstanding_requests.saturating_sub(1);
        }

        if more_data && !interrupted && self.is_running() {
            let mut n = self.notification(self.session_id.clone(), 0).in_progress();
            n.first_queued = notification.and_then(|n| n.first_queued);
            self.queue_manager.queue_notification(n, None);
            return Ok(());
        }

        if self.context.outstanding_requests == 0 && self.is_running() && self.context.current_state != END_STATE {
            self.run_state_method(END_STATE, StateInput::Direct(Responses::empty()))?;
        }
        if self.context.outstanding_requests == 0 && self.is_running() {
            self.services.stats.increment(FLOW_COMPLETIONS, &[self.flow_name()]);
            self.terminate(None)?;
        }
        Ok(())
    }

    fn requeue_request(&mut self, request: RequestState) {
        if let Some(task) = &request.request {
            let mut task = task.clone();
            task.ttl = crate::constants::MAX_TASK_TTL;
            task.task_id = self.services.next_task_id();
            let mut request = request.clone();
            request.request = Some(task.clone());
            self.queue_manager.queue_request(request, None);
            self.queue_manager.queue_client_message(task, None);
        } else {
            self.queue_manager.queue_request(request, None);
        }
    }

    fn save_resource_usage(&mut self, status: &Status) -> Result<(), FlowError> {
        let res = &mut self.context.client_resources;
        res.cpu_usage.user += status.cpu_time_used.user;
        res.cpu_usage.system += status.cpu_time_used.system;
        res.network_bytes_sent += status.network_bytes_sent;
        if let Some(limit) = self.runner_args.cpu_limit {
            if limit < res.cpu_usage.total() {
                return Err(FlowError::ResourceLimitExceeded(CPU_LIMIT_EXCEEDED.into()));
            }
        }
        if let Some(limit) = self.runner_args.network_bytes_limit {
            if limit < res.network_bytes_sent {
                return Err(FlowError::ResourceLimitExceeded(NETWORK_LIMIT_EXCEEDED.into()));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalización
    // ------------------------------------------------------------------

    fn finish(&mut self, mut status: Status, final_state: FlowState, backtrace: Option<String>) -> Result<(), FlowError> {
        self.queue_manager.destroy_flow_states(&self.session_id)?;
        self.pending_inline.clear();
        if !self.is_running() {
            return Ok(());
        }

        status.cpu_time_used = self.context.client_resources.cpu_usage;
        status.network_bytes_sent = self.context.client_resources.network_bytes_sent;
        status.child_session_id = Some(self.session_id.clone());

        if let Some(parent) = self.runner_args.request_state.as_mut() {
            parent.response_count += 1;
            let msg = Message::status(parent.session_id.clone(), parent.id, parent.response_count, &status)?;
            let (parent_session, parent_request) = (parent.session_id.clone(), parent.id);
            self.queue_manager.queue_response(msg, None);
            let n = self.notification(parent_session, parent_request);
            self.queue_manager.queue_notification(n, None);
        } else if let Some(channel) = &self.runner_args.notification_event {
            let event = FlowStatusEvent { session_id: self.session_id.clone(),
                                          flow_name: self.runner_args.flow_name.clone(),
                                          state: final_state,
                                          status };
            self.services.events.publish(channel, Event::FlowStatus(event));
        }

        self.context.state = final_state;
        if backtrace.is_some() {
            self.context.backtrace = backtrace;
        }
        Ok(())
    }

    pub fn terminate(&mut self, status: Option<Status>) -> Result<(), FlowError> {
        if self.is_running() {
            debug!("terminating flow {}", self.session_id);
        }
        self.finish(status.unwrap_or_else(Status::ok), FlowState::Terminated, None)
    }

    pub fn error(&mut self, backtrace: Option<String>, code: StatusCode) -> Result<(), FlowError> {
        if !self.is_running() {
            return Ok(());
        }
        let message = backtrace.clone().unwrap_or_else(|| "Error in flow".to_string());
        error!("flow {} ({}) failed: {message}", self.session_id, self.runner_args.flow_name);
        let mut status = Status::error(code, message);
        status.backtrace = backtrace.clone();
        self.finish(status, FlowState::Error, backtrace)
    }

    // ------------------------------------------------------------------
    // Lease y persistencia
    // ------------------------------------------------------------------

    pub fn check_lease(&self) -> Result<(), FlowError> {
        match &self.lock {
            Some(lock) => lock.check_lease().map(|_| ()).map_err(|_| FlowError::LeaseExpired(self.session_id.to_string())),
            None => Ok(()),
        }
    }

    /// Renueva el lease cuando queda menos de la mitad.
    pub fn heartbeat(&mut self) -> Result<(), FlowError> {
        if let Some(lock) = self.lock.as_mut() {
            let remaining = lock.check_lease().map_err(|_| FlowError::LeaseExpired(self.session_id.to_string()))?;
            let lease = lock.lease();
            if remaining < lease / 2 {
                lock.extend(lease)?;
            }
        }
        self.context.last_active = self.services.now();
        Ok(())
    }

    /// Guarda registro, logs y resultados en un único lote.
    pub fn persist_state(&mut self) -> Result<(), FlowError> {
        if let Some(flow) = &self.flow {
            flow.serialize(&mut self.state)?;
        }
        let services = Arc::clone(&self.services);
        let now = services.now();
        let rec = FlowRecord { context: self.context.clone(),
                               args: self.args.clone(),
                               runner_args: self.runner_args.clone(),
                               state_dict: self.state.clone() };
        let mut pool = MutationPool::new();
        record::write_record(&mut pool, &rec, now)?;
        let logs = std::mem::take(&mut self.pending_logs);
        record::append_logs(&mut pool, &self.session_id, &logs, || services.next_task_id())?;
        let results = std::mem::take(&mut self.pending_results);
        record::append_results(&mut pool, &self.session_id, &results, now, || services.next_task_id())?;
        pool.flush(services.store.as_ref())?;
        Ok(())
    }

    pub fn flush_messages(&mut self) -> Result<(), FlowError> {
        self.queue_manager.flush()?;
        Ok(())
    }

    /// Lease vigente, luego estado y por último los mensajes del turno.
    pub fn flush(&mut self) -> Result<(), FlowError> {
        self.check_lease()?;
        self.persist_state()?;
        self.flush_messages()
    }

    pub fn close(mut self) -> Result<(), FlowError> {
        self.flush()?;
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        Ok(())
    }

    /// Persiste el estado y entrega los mensajes sin escribir al llamador.
    pub(crate) fn into_queue_manager(mut self) -> Result<QueueManager, FlowError> {
        self.persist_state()?;
        Ok(self.queue_manager)
    }
}
