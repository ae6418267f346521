use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Anything that can push an event to every live session of a user.
/// Pipelines publish through this seam so tests can record fan-out instead
/// of opening sockets.
pub trait Notify: Send + Sync {
    fn publish(&self, user_id: Uuid, event: GatewayEvent);
}

/// Presence registry and fan-out hub. Maps each user to their live sessions;
/// several simultaneous connections per user all receive the same events
/// (multicast-to-self-across-devices). Per-instance by design — cross
/// instance fan-out is an external concern.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// user_id -> (conn_id -> sender)
    sessions: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Bind a new session for a user. Returns the connection id and the
    /// receiving end the connection task drains.
    pub fn register_session(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .sessions
            .write()
            .expect("session lock poisoned")
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Unbind a session. Returns true when this was the user's last live
    /// session (the caller then records last-seen).
    pub fn unregister_session(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut sessions = self.inner.sessions.write().expect("session lock poisoned");
        if let Some(conns) = sessions.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                sessions.remove(&user_id);
                return true;
            }
        }
        false
    }

    pub fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .sessions
            .read()
            .expect("session lock poisoned")
            .get(&user_id)
            .map_or(0, |conns| conns.len())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Notify for Dispatcher {
    /// At-most-once, best-effort: zero live sessions is not an error and
    /// nothing is queued for later delivery.
    fn publish(&self, user_id: Uuid, event: GatewayEvent) {
        let sessions = self.inner.sessions.read().expect("session lock poisoned");
        if let Some(conns) = sessions.get(&user_id) {
            for tx in conns.values() {
                let _ = tx.send(event.clone());
            }
        }
    }
}
