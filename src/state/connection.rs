use std::{collections::HashMap, sync::Mutex};

use tracing::instrument;

use super::{session::SessionState, transaction::TransactionState};
use crate::{
    command::{ConnectionInfo, ConsumerInfo, Destination},
    ids::{ConsumerId, SessionId, TransactionId},
    Error, Result,
};

/// The tree this tracker maintains: one `ConnectionInfo`, the sessions
/// opened under it (always including the default `-1` session), the
/// transactions currently open across those sessions, the temporary
/// destinations created on this connection, and the zero-prefetch consumers
/// whose recovery after a reconnect needs an outstanding pull reissued.
#[derive(Debug)]
pub struct ConnectionState {
    pub info: ConnectionInfo,
    sessions: HashMap<SessionId, SessionState>,
    transactions: HashMap<TransactionId, TransactionState>,
    temp_destinations: Vec<Destination>,
    recovering_pull_consumers: HashMap<ConsumerId, ConsumerInfo>,
    shutdown: bool,
}

impl ConnectionState {
    fn new(info: ConnectionInfo) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(SessionId::default_for(info.connection_id.clone()), SessionState::new());
        Self {
            info,
            sessions,
            transactions: HashMap::new(),
            temp_destinations: Vec::new(),
            recovering_pull_consumers: HashMap::new(),
            shutdown: false,
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.shutdown {
            Err(Error::ObjectClosed("connection state disposed".into()))
        } else {
            Ok(())
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<&SessionState> { self.sessions.get(id) }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut SessionState> {
        self.sessions.get_mut(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionState)> {
        self.sessions.iter()
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.transactions.get(id)
    }

    pub fn transaction_mut(&mut self, id: &TransactionId) -> Option<&mut TransactionState> {
        self.transactions.get_mut(id)
    }

    pub fn temp_destinations(&self) -> &[Destination] { &self.temp_destinations }

    pub fn recovering_pull_consumers(&self) -> impl Iterator<Item = &ConsumerInfo> {
        self.recovering_pull_consumers.values()
    }
}

/// Thread-safe facade over [`ConnectionState`]; every mutation is logged
/// and rejected once the connection has been shut down.
#[derive(Debug)]
pub struct ConnectionStateTracker {
    state: Mutex<ConnectionState>,
}

impl ConnectionStateTracker {
    pub fn new(info: ConnectionInfo) -> Self { Self { state: Mutex::new(ConnectionState::new(info)) } }

    #[instrument(skip(self))]
    pub fn add_session(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        state.sessions.entry(id).or_insert_with(SessionState::new);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_session(&self, id: &SessionId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        if let Some(mut session) = state.sessions.remove(id) {
            session.shutdown();
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn add_temp_destination(&self, destination: Destination) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        state.temp_destinations.push(destination);
        Ok(())
    }

    pub fn remove_temp_destination(&self, destination: &Destination) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        state.temp_destinations.retain(|d| d != destination);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn add_transaction_state(&self, id: TransactionId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        state.transactions.entry(id).or_insert_with(TransactionState::new);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_transaction_state(&self, id: &TransactionId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_mutable()?;
        if let Some(mut tx) = state.transactions.remove(id) {
            tx.shutdown();
        }
        Ok(())
    }

    pub fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&SessionState) -> T) -> Option<T> {
        self.state.lock().unwrap().session(id).map(f)
    }

    pub fn with_session_mut<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Option<T> {
        self.state.lock().unwrap().session_mut(id).map(f)
    }

    pub fn with_transaction_mut<T>(
        &self,
        id: &TransactionId,
        f: impl FnOnce(&mut TransactionState) -> T,
    ) -> Option<T> {
        self.state.lock().unwrap().transaction_mut(id).map(f)
    }

    /// Replace the tracked `ConnectionInfo` and discard every child; used
    /// when the client renegotiates its client id with the broker.
    #[instrument(skip(self, info))]
    pub fn reset(&self, info: ConnectionInfo) {
        let mut state = self.state.lock().unwrap();
        *state = ConnectionState::new(info);
    }

    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for session in state.sessions.values_mut() {
            session.shutdown();
        }
        for tx in state.transactions.values_mut() {
            tx.shutdown();
        }
    }

    /// A read-only clone of the current tree's shape, safe to inspect
    /// without holding the tracker's lock. Diagnostics/tests only; does not
    /// itself count as a mutation.
    pub fn snapshot(&self) -> ConnectionStateSnapshot {
        let state = self.state.lock().unwrap();
        ConnectionStateSnapshot {
            connection_id: state.info.connection_id.clone(),
            session_ids: state.sessions.keys().cloned().collect(),
            transaction_ids: state.transactions.keys().cloned().collect(),
            temp_destination_count: state.temp_destinations.len(),
            shutdown: state.shutdown,
        }
    }
}

/// A point-in-time, detached view of a [`ConnectionStateTracker`].
#[derive(Debug, Clone)]
pub struct ConnectionStateSnapshot {
    pub connection_id: crate::ids::ConnectionId,
    pub session_ids: Vec<SessionId>,
    pub transaction_ids: Vec<TransactionId>,
    pub temp_destination_count: usize,
    pub shutdown: bool,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tracker() -> ConnectionStateTracker {
        let connection_id = crate::ids::ConnectionId::from("conn-1");
        ConnectionStateTracker::new(ConnectionInfo {
            connection_id,
            client_id: None,
            user_name: None,
        })
    }

    #[test]
    fn construction_seeds_the_default_session() {
        let tracker = tracker();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.session_ids.len(), 1);
        assert_eq!(snapshot.session_ids[0].value, -1);
    }

    #[test]
    fn add_then_remove_session_restores_the_default_shape() {
        let tracker = tracker();
        let id = SessionId::new(crate::ids::ConnectionId::from("conn-1"), 1);
        tracker.add_session(id.clone()).unwrap();
        assert_eq!(tracker.snapshot().session_ids.len(), 2);
        tracker.remove_session(&id).unwrap();
        assert_eq!(tracker.snapshot().session_ids.len(), 1);
    }

    #[test]
    fn shutdown_rejects_further_mutation() {
        let tracker = tracker();
        tracker.shutdown();
        let id = SessionId::new(crate::ids::ConnectionId::from("conn-1"), 2);
        assert!(matches!(tracker.add_session(id), Err(Error::ObjectClosed(_))));
    }

    #[test]
    fn add_then_remove_temp_destination_round_trips() {
        let tracker = tracker();
        let destination = Destination { physical_name: "temp.1".into(), is_topic: false, is_temporary: true };
        tracker.add_temp_destination(destination.clone()).unwrap();
        assert_eq!(tracker.snapshot().temp_destination_count, 1);
        tracker.remove_temp_destination(&destination).unwrap();
        assert_eq!(tracker.snapshot().temp_destination_count, 0);
    }

    #[test]
    fn reset_replaces_info_and_empties_children() {
        let tracker = tracker();
        let id = SessionId::new(crate::ids::ConnectionId::from("conn-1"), 1);
        tracker.add_session(id).unwrap();
        tracker.reset(ConnectionInfo {
            connection_id: crate::ids::ConnectionId::from("conn-2"),
            client_id: None,
            user_name: None,
        });
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.connection_id, crate::ids::ConnectionId::from("conn-2"));
        assert_eq!(snapshot.session_ids.len(), 1);
    }
}
