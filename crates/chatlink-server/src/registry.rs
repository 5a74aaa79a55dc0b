//! ConnectionRegistry: every live connection, by user and by id.
//!
//! Both maps sit behind one lock so add/evict/remove are atomic with respect
//! to each other. Anything that awaits (closing an evicted socket, waiting for
//! its tasks) happens after the lock is released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chatlink_protocol::{CloseCode, ConnectionStats, SessionInfo};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionStatus, Outbound};

#[derive(Default)]
struct Tables {
    /// Oldest first.
    by_user: HashMap<String, VecDeque<String>>,
    by_id: HashMap<String, Arc<Connection>>,
}

pub struct ConnectionRegistry {
    tables: Mutex<Tables>,
    max_per_user: usize,
    /// Last issued id timestamp, in microseconds.
    id_clock: AtomicI64,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            max_per_user: max_per_user.max(1),
            id_clock: AtomicI64::new(0),
        }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// `{user_id}_{micros}` with strictly increasing micros.
    fn next_id(&self, user_id: &str) -> String {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .id_clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        format!("{user_id}_{}", now.max(prev + 1))
    }

    /// Register a connection. If the user is now over the cap, the oldest
    /// connection is removed, its tasks cancelled and its socket closed with
    /// a normal closure before this returns.
    pub async fn add(
        &self,
        session: SessionInfo,
        outbound: mpsc::Sender<Outbound>,
    ) -> Arc<Connection> {
        let user_id = session.user_id.clone();
        let id = self.next_id(&user_id);
        let conn = Arc::new(Connection::new(id.clone(), session, outbound));

        let evicted = {
            let mut tables = self.tables.lock();
            tables.by_id.insert(id.clone(), conn.clone());
            let ids = tables.by_user.entry(user_id.clone()).or_default();
            ids.push_back(id.clone());
            let oldest = if ids.len() > self.max_per_user {
                ids.pop_front()
            } else {
                None
            };
            oldest.and_then(|old| tables.by_id.remove(&old))
        };

        info!("Registered connection {id} for {user_id}");

        if let Some(old) = evicted {
            Self::evict(&old).await;
        }

        conn
    }

    async fn evict(conn: &Connection) {
        info!(
            "Evicting oldest connection {} of {} (limit reached)",
            conn.id(),
            conn.user_id()
        );
        conn.set_status(ConnectionStatus::Closing);
        conn.signal_close();
        // Registry state is authoritative; the socket may already be gone or
        // its writer stalled, so the close frame is never waited on.
        if let Err(e) = conn.try_close(CloseCode::NORMAL, "Connection limit exceeded") {
            debug!("Close of evicted {} failed: {e}", conn.id());
        }
        conn.shutdown_tasks().await;
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub async fn remove(&self, user_id: &str, connection_id: &str) -> bool {
        let removed = {
            let mut tables = self.tables.lock();
            let removed = tables.by_id.remove(connection_id);
            // The owner recorded on the connection wins over the caller's claim.
            let owner = removed.as_ref().map_or(user_id, |conn| conn.user_id());
            if let Some(ids) = tables.by_user.get_mut(owner) {
                ids.retain(|id| id != connection_id);
                if ids.is_empty() {
                    tables.by_user.remove(owner);
                }
            }
            removed
        };
        match removed {
            Some(conn) => {
                if conn.user_id() != user_id {
                    warn!(
                        "Connection {connection_id} belongs to {}, not {user_id}",
                        conn.user_id()
                    );
                }
                conn.shutdown_tasks().await;
                conn.set_status(ConnectionStatus::Closed);
                info!("Removed connection {connection_id} for {}", conn.user_id());
                true
            }
            None => {
                debug!("Connection {connection_id} already removed");
                false
            }
        }
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.tables.lock().by_id.contains_key(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.tables.lock().by_id.get(connection_id).cloned()
    }

    /// Connection ids of a user, oldest first.
    pub fn connections_for(&self, user_id: &str) -> Vec<String> {
        self.tables
            .lock()
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ConnectionStats {
        let tables = self.tables.lock();
        let connections_per_user: BTreeMap<String, usize> = tables
            .by_user
            .iter()
            .map(|(user, ids)| (user.clone(), ids.len()))
            .collect();
        ConnectionStats {
            total_connections: tables.by_id.len(),
            active_users: connections_per_user.len(),
            connections_per_user,
        }
    }
}
