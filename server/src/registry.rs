use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use krypton_misc::time::now_millis;
use krypton_proto::packet::Packet;
use log::debug;

use crate::session::Session;

/// Owns every live session and a secondary index from user id to that
/// user's authenticated sessions. Handlers hold `Arc<Session>` clones,
/// never the registry itself.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    by_user: HashMap<String, HashSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        let mut inner = self.inner.write().unwrap();
        inner.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        let session = inner.sessions.remove(id);
        if let Some(session) = session {
            if let Some(user) = session.user() {
                if let Some(ids) = inner.by_user.get_mut(&user.id) {
                    ids.remove(id);
                    if ids.is_empty() {
                        inner.by_user.remove(&user.id);
                    }
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().unwrap();
        inner.sessions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds the session to the per-user index. Called once the session
    /// reaches the authenticated state; broadcasts only ever target
    /// indexed sessions.
    pub fn mark_authenticated(&self, id: &str, user_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if !inner.sessions.contains_key(id) {
            return;
        }
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(id.to_string());
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.read().unwrap();
        match inner.by_user.get(user_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.sessions.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn list_stale(&self, older_than_ms: u64) -> Vec<Arc<Session>> {
        let deadline = now_millis().saturating_sub(older_than_ms);
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .values()
            .filter(|s| s.conn.last_activity() < deadline)
            .cloned()
            .collect()
    }

    /// Sends a packet to the target sessions: every authenticated session
    /// of `only_user` (or every session when absent), minus `exclude`.
    /// Per-session send failures are swallowed; the failing session's own
    /// reader will notice the broken stream next.
    pub async fn broadcast(
        &self,
        packet: &Packet,
        exclude: Option<&str>,
        only_user: Option<&str>,
    ) {
        let targets: Vec<Arc<Session>> = {
            let inner = self.inner.read().unwrap();
            let ids: Vec<&String> = match only_user {
                Some(user_id) => match inner.by_user.get(user_id) {
                    Some(ids) => ids.iter().collect(),
                    None => Vec::new(),
                },
                None => inner.sessions.keys().collect(),
            };
            ids.into_iter()
                .filter(|id| Some(id.as_str()) != exclude)
                .filter_map(|id| inner.sessions.get(id).cloned())
                .collect()
        };

        for session in targets {
            if let Err(err) = session.conn.send(packet).await {
                debug!(
                    "Broadcast send to session {} failed: {:#}",
                    session.id, err
                );
            }
        }
    }

    /// Trips every session's cancellation token and empties the registry.
    /// Used on server shutdown.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write().unwrap();
            inner.by_user.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };

        for session in sessions {
            session.cancel.cancel();
            session.conn.close().await;
        }
    }
}
