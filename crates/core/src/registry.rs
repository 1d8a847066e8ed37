//! Named, read-only resource registries.
//!
//! A registry is filled once through [`RegistryBuilder`] while the runtime
//! initializes and is never mutated afterwards, so lookups take no lock.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} `{name}` is not registered (available: {available})")]
    NotFound { kind: &'static str, name: String, available: String },
    #[error("{kind} `{name}` is registered more than once")]
    Duplicate { kind: &'static str, name: String },
    #[error("model `{name}` uses unsupported provider `{provider}` (supported: {supported})")]
    UnsupportedProvider { name: String, provider: String, supported: String },
}

#[derive(Clone, Debug)]
pub struct RegistryEntry<T> {
    pub name: String,
    pub provider: String,
    pub handle: T,
}

#[derive(Clone, Debug)]
pub struct Registry<T> {
    kind: &'static str,
    entries: Vec<RegistryEntry<T>>,
    index: HashMap<String, usize>,
}

impl<T> Registry<T> {
    pub fn builder(kind: &'static str) -> RegistryBuilder<T> {
        RegistryBuilder { registry: Registry { kind, entries: Vec::new(), index: HashMap::new() } }
    }

    pub fn empty(kind: &'static str) -> Self {
        Self::builder(kind).build()
    }

    pub fn get(&self, name: &str) -> Result<&T, RegistryError> {
        self.index.get(name).map(|position| &self.entries[*position].handle).ok_or_else(|| {
            RegistryError::NotFound {
                kind: self.kind,
                name: name.to_string(),
                available: self.list_names().join(", "),
            }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names in registration order.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn entries(&self) -> &[RegistryEntry<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

pub struct RegistryBuilder<T> {
    registry: Registry<T>,
}

impl<T> RegistryBuilder<T> {
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        provider: impl Into<String>,
        handle: T,
    ) -> Result<&mut Self, RegistryError> {
        let name = name.into();
        if self.registry.index.contains_key(&name) {
            return Err(RegistryError::Duplicate { kind: self.registry.kind, name });
        }

        self.registry.index.insert(name.clone(), self.registry.entries.len());
        self.registry.entries.push(RegistryEntry { name, provider: provider.into(), handle });
        Ok(self)
    }

    /// Handles inserted so far, in order. Used to release partially built state.
    pub fn into_handles(self) -> Vec<T> {
        self.registry.entries.into_iter().map(|entry| entry.handle).collect()
    }

    pub fn build(self) -> Registry<T> {
        self.registry
    }
}
