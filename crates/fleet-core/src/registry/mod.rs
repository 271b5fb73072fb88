//! Registros explícitos de flows y acciones de cliente.
//!
//! Se pueblan una vez al arrancar (vía `ServicesBuilder`) y luego se
//! consultan por referencia: `StartFlow` y el worker resuelven flows por
//! nombre; el collator valida payloads contra las acciones.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::flow::{Flow, WellKnownFlow};
use crate::model::SessionId;

/// Variante de flow. Selecciona el comportamiento por configuración.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Flow ligado a un cliente; exige `client_id` al arrancar.
    Ordinary,
    /// Flow que actúa sobre toda la flota, sin cliente.
    Global,
    /// Dirección fija; recibe mensajes directos, no se arranca.
    WellKnown,
}

pub type FlowFactory = Arc<dyn Fn() -> Box<dyn Flow> + Send + Sync>;

#[derive(Clone)]
pub struct FlowDescriptor {
    pub name: String,
    pub kind: FlowKind,
    pub factory: FlowFactory,
    /// Nombres de argumentos aceptados. `None` acepta cualquiera.
    pub arg_names: Option<Vec<String>>,
}

impl FlowDescriptor {
    pub fn ordinary<F>(name: &str, factory: F) -> Self
        where F: Fn() -> Box<dyn Flow> + Send + Sync + 'static
    {
        Self { name: name.to_string(), kind: FlowKind::Ordinary, factory: Arc::new(factory), arg_names: None }
    }

    pub fn global<F>(name: &str, factory: F) -> Self
        where F: Fn() -> Box<dyn Flow> + Send + Sync + 'static
    {
        Self { kind: FlowKind::Global, ..Self::ordinary(name, factory) }
    }

    pub fn with_args(mut self, names: &[&str]) -> Self {
        self.arg_names = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn instantiate(&self) -> Box<dyn Flow> {
        (self.factory)()
    }
}

impl std::fmt::Debug for FlowDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDescriptor")
         .field("name", &self.name)
         .field("kind", &self.kind)
         .field("arg_names", &self.arg_names)
         .finish()
    }
}

#[derive(Clone)]
pub struct WellKnownEntry {
    pub name: String,
    pub session_id: SessionId,
    pub flow: Arc<dyn WellKnownFlow>,
}

#[derive(Default, Clone)]
pub struct FlowRegistry {
    flows: IndexMap<String, FlowDescriptor>,
    well_known: IndexMap<SessionId, WellKnownEntry>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: FlowDescriptor) {
        self.flows.insert(descriptor.name.clone(), descriptor);
    }

    pub fn register_well_known(&mut self, name: &str, session_id: SessionId, flow: Arc<dyn WellKnownFlow>) {
        self.well_known.insert(session_id.clone(), WellKnownEntry { name: name.to_string(), session_id, flow });
    }

    pub fn get(&self, name: &str) -> Option<&FlowDescriptor> {
        self.flows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name) || self.well_known.values().any(|w| w.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<FlowKind> {
        if let Some(d) = self.flows.get(name) {
            return Some(d.kind);
        }
        self.well_known.values().any(|w| w.name == name).then_some(FlowKind::WellKnown)
    }

    pub fn well_known(&self, session_id: &SessionId) -> Option<&WellKnownEntry> {
        self.well_known.get(session_id)
    }
}

/// Contrato de una acción de cliente.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionDescriptor {
    pub input_type: Option<String>,
    /// Tipos de payload que la acción puede devolver.
    pub output_types: Vec<String>,
}

impl ActionDescriptor {
    pub fn new(input_type: Option<&str>, output_types: &[&str]) -> Self {
        Self { input_type: input_type.map(String::from),
               output_types: output_types.iter().map(|s| s.to_string()).collect() }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    actions: IndexMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, descriptor: ActionDescriptor) {
        self.actions.insert(name.to_string(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }
}
