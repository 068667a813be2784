//! Set of live connections, used for broadcast fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::ConnectionId;
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// Live connections indexed by connection ID.
///
/// Iteration runs under the read lock, so `add`/`remove` never race a
/// broadcast in progress. Callbacks passed to [`for_each`](Self::for_each)
/// must not block.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let id = connection.id.clone();
        let mut conns = self.connections.write();
        if conns.insert(id.clone(), connection).is_some() {
            warn!(conn_id = %id, "connection id registered twice, replaced");
        }
        debug!(conn_id = %id, total = conns.len(), "connection registered");
    }

    /// Remove a connection by ID. Removing an absent ID is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.write().remove(id);
        if removed.is_some() {
            debug!(conn_id = %id, "connection unregistered");
        }
        removed
    }

    /// Run `f` for every registered connection. Returns how many were visited.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ClientConnection>)) -> usize {
        let conns = self.connections.read();
        for conn in conns.values() {
            f(conn);
        }
        conns.len()
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::Frame;
    use tokio::sync::mpsc;

    fn make_connection(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(2048);
        (
            Arc::new(ClientConnection::new(ConnectionId::from_string(id), tx)),
            rx,
        )
    }

    #[test]
    fn add_and_remove() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = make_connection("a");
        let (b, _rb) = make_connection("b");
        reg.add(a);
        reg.add(b);
        assert_eq!(reg.len(), 2);

        assert!(reg.remove(&ConnectionId::from_string("a")).is_some());
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&ConnectionId::from_string("b")).is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = make_connection("a");
        reg.add(a);
        let id = ConnectionId::from_string("a");
        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_unknown_is_noop() {
        let reg = ConnectionRegistry::new();
        assert!(reg.remove(&ConnectionId::from_string("ghost")).is_none());
    }

    #[test]
    fn duplicate_add_replaces() {
        let reg = ConnectionRegistry::new();
        let (first, _r1) = make_connection("same");
        let (second, _r2) = make_connection("same");
        reg.add(first);
        reg.add(Arc::clone(&second));
        assert_eq!(reg.len(), 1);
        let stored = reg.get(&ConnectionId::from_string("same")).unwrap();
        assert!(Arc::ptr_eq(&stored, &second));
    }

    #[test]
    fn for_each_visits_all() {
        let reg = ConnectionRegistry::new();
        let mut rxs = Vec::new();
        for i in 0..5 {
            let (c, rx) = make_connection(&format!("c{i}"));
            reg.add(c);
            rxs.push(rx);
        }
        let mut seen = Vec::new();
        let visited = reg.for_each(|c| seen.push(c.id.clone()));
        assert_eq!(visited, 5);
        seen.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn concurrent_iteration_and_mutation() {
        let reg = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..100 {
            let (c, rx) = make_connection(&format!("stable_{i}"));
            reg.add(c);
            receivers.push(rx);
        }

        let churn = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let (c, _rx) = make_connection(&format!("churn_{i}"));
                    reg.add(c);
                    let _ = reg.remove(&ConnectionId::from_string(format!("churn_{i}")));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let mut stable = 0;
                        let _ = reg.for_each(|c| {
                            if c.id.as_str().starts_with("stable_") {
                                stable += 1;
                            }
                        });
                        assert_eq!(stable, 100);
                    }
                })
            })
            .collect();

        churn.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(reg.len(), 100);
    }
}
