//! Registry over a fixed, editable list of servers.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::core::client::ServerRegistry;
use crate::core::job::ServerAddress;
use crate::core::SchedulerError;

#[derive(Debug, Default)]
struct RegistryState {
    servers: Vec<ServerAddress>,
    penalized: HashSet<ServerAddress>,
    fail_next: Option<String>,
}

/// Cheap-clone server registry backed by an in-memory list.
#[derive(Debug, Clone, Default)]
pub struct StaticServerRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl StaticServerRegistry {
    /// Registry listing `servers` in order, duplicates dropped.
    #[must_use]
    pub fn new<I>(servers: I) -> Self
    where
        I: IntoIterator<Item = ServerAddress>,
    {
        let registry = Self::default();
        for server in servers {
            registry.add(server);
        }
        registry
    }

    /// Append a server.
    pub fn add(&self, server: ServerAddress) {
        let mut state = self.state.write();
        if !state.servers.contains(&server) {
            state.servers.push(server);
        }
    }

    /// Remove a server.
    pub fn remove(&self, server: &ServerAddress) {
        let mut state = self.state.write();
        state.servers.retain(|s| s != server);
        state.penalized.remove(server);
    }

    /// Mark a server as penalized or clear the mark.
    pub fn set_penalized(&self, server: &ServerAddress, penalized: bool) {
        let mut state = self.state.write();
        if penalized {
            state.penalized.insert(server.clone());
        } else {
            state.penalized.remove(server);
        }
    }

    /// Make the next snapshot fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.state.write().fail_next = Some(reason.into());
    }
}

impl ServerRegistry for StaticServerRegistry {
    fn iterate(&self, include_penalized: bool) -> Result<Vec<ServerAddress>, SchedulerError> {
        let state = self.state.upgradable_read();
        if state.fail_next.is_some() {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            let reason = state.fail_next.take().unwrap_or_default();
            return Err(SchedulerError::Registry(reason));
        }
        Ok(state
            .servers
            .iter()
            .filter(|s| include_penalized || !state.penalized.contains(*s))
            .cloned()
            .collect())
    }
}
