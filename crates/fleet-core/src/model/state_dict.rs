//! Diccionario de estado visible para los handlers de un flow.
//!
//! Mapa ordenado `String -> Value` con accesores tipados. Se persiste junto
//! al contexto en cada punto de suspensión.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FlowError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowStateDict(IndexMap<String, Value>);

impl FlowStateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lee y deserializa `key`. `Ok(None)` si no existe.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FlowError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some)
                                                        .map_err(|e| FlowError::Codec(format!("state key {key}: {e}"))),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, FlowError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), FlowError> {
        let v = serde_json::to_value(value)?;
        self.0.insert(key.into(), v);
        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
