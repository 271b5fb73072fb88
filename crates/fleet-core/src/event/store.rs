use std::sync::Mutex;

use log::info;

use super::Event;

/// Publicación fire-and-forget: un publisher nunca hace fallar al llamador.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, channel: &str, event: Event);
}

/// Guarda los eventos en memoria en orden de publicación.
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    inner: Mutex<Vec<(String, Event)>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Event)> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn events_on(&self, channel: &str) -> Vec<Event> {
        self.events().into_iter().filter(|(c, _)| c == channel).map(|(_, e)| e).collect()
    }
}

impl EventPublisher for InMemoryEventPublisher {
    fn publish(&self, channel: &str, event: Event) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.push((channel.to_string(), event));
    }
}

/// Publisher por defecto: sólo deja constancia en el log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventPublisher;

impl EventPublisher for LogEventPublisher {
    fn publish(&self, channel: &str, event: Event) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("event channel={channel} {json}"),
            Err(e) => info!("event channel={channel} (unserializable: {e})"),
        }
    }
}
