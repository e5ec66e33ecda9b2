//! Registry of protocol versions by id.

use crate::protocol::SharedProtocol;
use dashmap::DashMap;
use std::fmt;

/// Maps protocol ids to protocol instances.
///
/// Owned by the application and shared by `Arc`; there is no process-wide
/// instance. Registration performs no validation and the last registration
/// for an id wins.
pub struct ProtocolRegistry<S> {
    protocols: DashMap<String, SharedProtocol<S>>,
}

impl<S: 'static> ProtocolRegistry<S> {
    pub fn new() -> Self {
        Self {
            protocols: DashMap::new(),
        }
    }

    /// Registers `protocol` under `id`, returning the protocol it displaced.
    pub fn register(
        &self,
        id: impl Into<String>,
        protocol: SharedProtocol<S>,
    ) -> Option<SharedProtocol<S>> {
        let id = id.into();
        let previous = self.protocols.insert(id.clone(), protocol);
        if previous.is_some() {
            tracing::debug!(protocol = %id, "replaced protocol");
        } else {
            tracing::debug!(protocol = %id, "registered protocol");
        }
        previous
    }

    pub fn get(&self, id: &str) -> Option<SharedProtocol<S>> {
        self.protocols.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.protocols.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.protocols.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl<S: 'static> Default for ProtocolRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> fmt::Debug for ProtocolRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
