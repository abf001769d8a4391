//! The three fields every [`super::SyncRunner`] transition mutates, and the
//! invariants over them (§3 "Sync Runner", §8 "Invariants").

use std::collections::HashSet;
use std::sync::Arc;

use crate::client::ConnectedClient;
use crate::engine::SyncEngine;

/// `(engine, databaseHost, connections)` — mutated only by the event-queue
/// consumer (§3, §5 "Serialization").
#[derive(Default)]
pub struct RunnerState {
    pub engine: Option<Arc<dyn SyncEngine>>,
    pub host: Option<Arc<ConnectedClient>>,
    pub connections: HashSet<Arc<ConnectedClient>>,
}

impl RunnerState {
    /// §8 invariants 1-3. Debug-only: a violation is a bug in this module,
    /// not a condition to handle at runtime.
    pub fn check_invariants(&self) -> bool {
        let engine_iff_host = self.engine.is_some() == self.host.is_some();
        let host_in_connections = self
            .host
            .as_ref()
            .is_none_or(|host| self.connections.contains(host));
        let empty_implies_idle = !self.connections.is_empty() || (self.engine.is_none() && self.host.is_none());
        engine_iff_host && host_in_connections && empty_implies_idle
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_none() && self.host.is_none() && self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_connections(clients: &[Arc<ConnectedClient>]) -> RunnerState {
        let mut state = RunnerState::default();
        for c in clients {
            state.connections.insert(c.clone());
        }
        state
    }

    #[test]
    fn fresh_state_is_idle_and_valid() {
        let state = RunnerState::default();
        assert!(state.is_idle());
        assert!(state.check_invariants());
    }

    #[tokio::test]
    async fn host_without_engine_violates_invariant_1() {
        let clients = vec![crate::client::test_support::fake_client()];
        let mut state = state_with_connections(&clients);
        state.host = Some(clients[0].clone());
        assert!(!state.check_invariants());
    }

    #[tokio::test]
    async fn host_outside_connections_violates_invariant_2() {
        let mut state = RunnerState::default();
        let stray = crate::client::test_support::fake_client();
        state.host = Some(stray.clone());
        state.engine = Some(crate::engine::test_support::fake_engine());
        assert!(!state.check_invariants());
    }

    #[test]
    fn engine_with_empty_connections_violates_invariant_3() {
        let mut state = RunnerState::default();
        state.engine = Some(crate::engine::test_support::fake_engine());
        assert!(!state.check_invariants());
    }

    #[tokio::test]
    async fn host_member_of_connections_is_valid() {
        let clients = vec![crate::client::test_support::fake_client(), crate::client::test_support::fake_client()];
        let mut state = state_with_connections(&clients);
        state.host = Some(clients[0].clone());
        state.engine = Some(crate::engine::test_support::fake_engine());
        assert!(state.check_invariants());
    }
}
