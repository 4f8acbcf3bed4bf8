//! Connection registry (component D).
//!
//! Tracks live connections so a supervisor `stop()` can cancel every one of
//! them in bulk. Cancellation is modeled with a `CancellationToken` rather
//! than by reaching into socket internals: every relay task races its byte
//! pumps against `cancelled()`, so closing a registry entry unblocks the
//! task the same way a read/send error would (spec §5: "cancellation is
//! signalled by closing the underlying streams"). A `CancellationToken`
//! latches its cancelled state, so `close_all()` still reaches a task that
//! hasn't started awaiting `cancelled()` yet (e.g. one still mid-dial) —
//! unlike `tokio::sync::Notify`, whose `notify_waiters` only wakes tasks
//! already parked on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, (Direction, CancellationToken)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionRegistry {
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a new connection and returns an RAII handle. Dropping the
    /// handle removes the entry; the session also holds onto the handle's
    /// cancel token to observe a bulk [`ConnectionRegistry::close_all`].
    pub fn register(self: &Arc<Self>, direction: Direction) -> RegisteredConn {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.conns
            .lock()
            .unwrap()
            .insert(id, (direction, cancel.clone()));
        RegisteredConn {
            id,
            cancel,
            registry: self.clone(),
        }
    }

    /// Cancels and removes every tracked connection. A connection whose
    /// `RegisteredConn` drops (and tries to remove itself) after this call
    /// is tolerated: removal from an already-empty map is a no-op.
    pub fn close_all(&self) {
        let snapshot: Vec<CancellationToken> = {
            let conns = self.conns.lock().unwrap();
            conns.values().map(|(_, t)| t.clone()).collect()
        };
        for token in &snapshot {
            token.cancel();
        }
        self.conns.lock().unwrap().clear();
    }

    /// Number of tracked *inbound* connections — outbound dials are not
    /// counted towards "clients" (spec §4.D).
    pub fn inbound_count(&self) -> usize {
        self.conns
            .lock()
            .unwrap()
            .values()
            .filter(|(dir, _)| *dir == Direction::Inbound)
            .count()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }
}

/// RAII membership in a [`ConnectionRegistry`]. Clone the cancel token with
/// [`RegisteredConn::cancel_token`] to race it against a byte pump; the
/// connection is removed from the registry when this handle drops.
pub struct RegisteredConn {
    id: u64,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl RegisteredConn {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for RegisteredConn {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_count_ignores_outbound() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(Direction::Inbound);
        let b = registry.register(Direction::Outbound);
        assert_eq!(registry.inbound_count(), 1);
        assert_eq!(registry.len(), 2);
        drop(a);
        drop(b);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn close_all_empties_registry_and_cancels_tokens() {
        let registry = ConnectionRegistry::new();
        let conn = registry.register(Direction::Inbound);
        let token = conn.cancel_token();
        assert!(!token.is_cancelled());
        registry.close_all();
        assert!(registry.is_empty());
        // Unlike `Notify::notify_waiters`, cancellation latches: a task that
        // hasn't started awaiting `cancelled()` yet still observes it.
        assert!(token.is_cancelled());
        drop(conn);
    }
}
