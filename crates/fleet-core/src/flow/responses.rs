//! Colación de responses para un state handler.
//!
//! Un request completo llega como una lista desordenada de mensajes. El
//! collator los ordena por `response_id`, descarta los no autenticados,
//! separa iterator y status y valida el tipo de cada payload contra la
//! acción de cliente que lo originó. Lo que recibe el handler es siempre un
//! `Responses` coherente o un error.

use log::{error, warn};
use serde_json::Value;

use crate::errors::FlowError;
use crate::model::{AuthState, ClientIterator, Message, MessageKind, RequestData, RequestState, Status};
use crate::registry::ActionRegistry;

#[derive(Debug, Clone, Default)]
pub struct Responses {
    request: Option<RequestState>,
    request_data: RequestData,
    messages: Vec<Message>,
    status: Option<Status>,
    success: bool,
    iterator: Option<ClientIterator>,
    dropped: Vec<Message>,
}

impl Responses {
    /// Responses para un estado invocado sin request (p.ej. `Start`).
    pub fn empty() -> Self {
        Self { success: true, ..Self::default() }
    }

    /// Responses fabricadas en memoria para un `CallState` inmediato.
    pub fn direct(messages: Vec<Message>, request_data: RequestData) -> Self {
        Self { request_data, messages, status: Some(Status::ok()), success: true, ..Self::default() }
    }

    pub fn collate(request: RequestState,
                   mut messages: Vec<Message>,
                   auth_required: bool,
                   actions: &ActionRegistry)
                   -> Result<Self, FlowError> {
        let had_input = !messages.is_empty();
        messages.sort_by_key(|m| m.response_id);

        let mut out = Self { request_data: request.data.clone(), ..Self::default() };
        for msg in messages {
            let rejected = msg.auth_state == AuthState::Desynchronized
                           || (auth_required && msg.auth_state != AuthState::Authenticated);
            if rejected {
                warn!("dropping {:?} response {} for request {} of {}",
                      msg.auth_state, msg.response_id, msg.request_id, msg.session_id);
                out.dropped.push(msg);
                continue;
            }
            match msg.kind {
                MessageKind::Iterator => {
                    out.iterator = Some(serde_json::from_value(msg.payload)?);
                }
                MessageKind::Status => {
                    let status = msg.status_payload()?;
                    out.success = status.is_ok();
                    out.status = Some(status);
                    break;
                }
                MessageKind::Message => out.messages.push(msg),
            }
        }

        if had_input && out.status.is_none() {
            for d in &out.dropped {
                error!("desynchronized message: session={} request={} response={}",
                       d.session_id, d.request_id, d.response_id);
            }
            return Err(FlowError::Desynchronized("No valid Status message.".into()));
        }

        out.messages.dedup_by_key(|m| m.response_id);

        if let Some(task) = &request.request {
            let action = actions.get(&task.name).ok_or_else(|| FlowError::UnknownAction(task.name.clone()))?;
            for msg in &out.messages {
                if action.output_types.is_empty() {
                    return Err(FlowError::SchemaMismatch(format!("action {} declares no output types", task.name)));
                }
                let declared = msg.args_type
                                  .as_deref()
                                  .ok_or_else(|| FlowError::SchemaMismatch(format!("response {} of {} has no type",
                                                                                  msg.response_id, task.name)))?;
                if !action.output_types.iter().any(|t| t == declared) {
                    return Err(FlowError::SchemaMismatch(format!("response type {declared} is not one of {:?} for {}",
                                                                 action.output_types, task.name)));
                }
            }
        }

        out.request = Some(request);
        Ok(out)
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Value> {
        self.messages.iter().map(|m| &m.payload)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iterator(&self) -> Option<&ClientIterator> {
        self.iterator.as_ref()
    }

    pub fn request_data(&self) -> &RequestData {
        &self.request_data
    }

    pub fn request(&self) -> Option<&RequestState> {
        self.request.as_ref()
    }

    pub fn dropped(&self) -> &[Message] {
        &self.dropped
    }
}

impl<'a> IntoIterator for &'a Responses {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{SessionId, StatusCode};
    use crate::registry::ActionDescriptor;

    fn sid() -> SessionId {
        SessionId::well_known("W", "ABCD0001")
    }

    fn payload(id: u64, v: Value) -> Message {
        Message::response(sid(), 1, id, v).with_args_type("Process")
    }

    fn actions() -> ActionRegistry {
        let mut a = ActionRegistry::new();
        a.register("ListProcesses", ActionDescriptor::new(None, &["Process"]));
        a
    }

    fn client_request() -> RequestState {
        let mut r = RequestState::new(1, sid(), "Process");
        let mut task = Message::new(sid());
        task.name = "ListProcesses".into();
        r.request = Some(task);
        r
    }

    #[test]
    fn orders_dedups_and_stops_at_status() {
        let msgs = vec![payload(3, json!("c")),
                        payload(1, json!("a")),
                        payload(2, json!("b")),
                        payload(2, json!("b-dup")),
                        Message::status(sid(), 1, 4, &Status::ok()).unwrap(),
                        payload(5, json!("after-status"))];
        let r = Responses::collate(client_request(), msgs, true, &actions()).unwrap();
        let ids: Vec<u64> = r.iter().map(|m| m.response_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(r.success());
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn missing_status_is_desynchronized() {
        let err = Responses::collate(client_request(), vec![payload(1, json!(1))], true, &actions()).unwrap_err();
        assert_eq!(err, FlowError::Desynchronized("No valid Status message.".into()));
    }

    #[test]
    fn unauthenticated_responses_are_dropped() {
        let mut unauth = payload(1, json!("x"));
        unauth.auth_state = AuthState::Unauthenticated;
        let msgs = vec![unauth, Message::status(sid(), 1, 2, &Status::ok()).unwrap()];
        let r = Responses::collate(client_request(), msgs.clone(), true, &actions()).unwrap();
        assert!(r.is_empty());
        assert_eq!(r.dropped().len(), 1);
        let relaxed = Responses::collate(client_request(), msgs, false, &actions()).unwrap();
        assert_eq!(relaxed.len(), 1);
    }

    #[test]
    fn failed_status_reports_failure() {
        let st = Status::error(StatusCode::GenericError, "nope");
        let r = Responses::collate(client_request(), vec![Message::status(sid(), 1, 1, &st).unwrap()], true, &actions())
            .unwrap();
        assert!(!r.success());
        assert_eq!(r.status().and_then(|s| s.error_message.as_deref()), Some("nope"));
    }

    #[test]
    fn wrong_payload_type_is_schema_error() {
        let bad = Message::response(sid(), 1, 1, json!(1)).with_args_type("File");
        let msgs = vec![bad, Message::status(sid(), 1, 2, &Status::ok()).unwrap()];
        let err = Responses::collate(client_request(), msgs, true, &actions()).unwrap_err();
        assert!(matches!(err, FlowError::SchemaMismatch(_)));

        let untyped = Message::response(sid(), 1, 1, json!(1));
        let msgs = vec![untyped, Message::status(sid(), 1, 2, &Status::ok()).unwrap()];
        assert!(matches!(Responses::collate(client_request(), msgs, true, &actions()),
                         Err(FlowError::SchemaMismatch(_))));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let mut req = client_request();
        if let Some(task) = req.request.as_mut() {
            task.name = "Nope".into();
        }
        let msgs = vec![payload(1, json!(1)), Message::status(sid(), 1, 2, &Status::ok()).unwrap()];
        assert_eq!(Responses::collate(req, msgs, true, &actions()).unwrap_err(), FlowError::UnknownAction("Nope".into()));
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let r = Responses::collate(RequestState::new(1, sid(), "X"), vec![], true, &actions()).unwrap();
        assert!(r.is_empty());
        assert!(r.status().is_none());
    }
}
