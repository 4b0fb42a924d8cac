//! Process-wide session registry.
//!
//! The id→session map is the only structure touched by multiple top-level
//! tasks directly, so it stays deliberately dumb: insert, fetch, remove.
//! No I/O and no session-internal work happen while a map shard is held —
//! session creation (which spawns a process) runs before the insert, and
//! the loser of a creation race shuts its freshly spawned actor down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::debug_hub::DebugHubHandle;
use crate::session::SessionSnapshot;
use crate::session_actor::SessionActorHandle;
use crate::session_command::SessionCommand;

/// One registered session: its actor and its debug hub.
#[derive(Clone)]
pub struct SessionEntry {
    pub actor: SessionActorHandle,
    pub debug: DebugHubHandle,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Fetch the session for `id`, creating it with `factory` when absent.
    /// The factory runs outside the map lock; when two callers race, the
    /// loser's freshly built entry is shut down and the winner's returned.
    /// Returns `(entry, created)`.
    pub fn get_or_create(
        &self,
        id: &str,
        factory: impl FnOnce() -> SessionEntry,
    ) -> (SessionEntry, bool) {
        if let Some(existing) = self.get(id) {
            return (existing, false);
        }
        let candidate = factory();
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(occupied) => {
                let winner = occupied.get().clone();
                let loser = candidate;
                tokio::spawn(async move {
                    let (tx, rx) = oneshot::channel();
                    loser.actor.send(SessionCommand::Shutdown { reply: tx }).await;
                    let _ = rx.await;
                });
                (winner, false)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(candidate.clone());
                (candidate, true)
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lock-free snapshots of every session (sessions list, reaper).
    pub fn snapshots(&self) -> Vec<Arc<SessionSnapshot>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().actor.snapshot())
            .collect()
    }

    fn entries(&self) -> Vec<(String, SessionEntry)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Periodically reap sessions nobody is using: no viewers and no activity
/// past the idle window, or an exited process past the reconnect grace.
pub async fn run_reaper(
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    exit_grace: Duration,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        for (id, entry) in registry.entries() {
            let snapshot = entry.actor.snapshot();
            if snapshot.viewer_count > 0 {
                continue;
            }
            let reap = match snapshot.exited {
                Some(exit) => exit.at.elapsed() >= exit_grace,
                None => snapshot.last_activity.elapsed() >= idle_timeout,
            };
            if !reap {
                continue;
            }
            info!(
                component = "registry",
                event = "session.reaped",
                session_id = %id,
                exited = snapshot.exited.is_some(),
                "Reaping unused session"
            );
            registry.remove(&id);
            let (tx, rx) = oneshot::channel();
            entry.actor.send(SessionCommand::Shutdown { reply: tx }).await;
            if rx.await.is_err() {
                debug!(
                    component = "registry",
                    session_id = %id,
                    "Session actor was already gone"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::debug_hub::DebugHubHandle;
    use crate::proxy::ProxyGateway;
    use crate::session::SessionHandle;
    use crate::session_actor::{ActorContext, SessionActorHandle};
    use crate::supervisor::SpawnSpec;

    fn test_entry(registry: &Arc<SessionRegistry>, id: &str) -> SessionEntry {
        let handle = SessionHandle::new(
            id.to_string(),
            "shell".to_string(),
            SpawnSpec {
                program: "sh".into(),
                args: vec![],
                env: vec![],
                workdir: "/tmp".into(),
                cols: 80,
                rows: 24,
            },
            None,
        );
        let ctx = ActorContext {
            gateway: Arc::new(ProxyGateway::new(3000, registry.clone())),
            terminate_grace: Duration::from_millis(200),
        };
        SessionEntry {
            actor: SessionActorHandle::spawn(handle, ctx),
            debug: DebugHubHandle::spawn(id.to_string()),
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_id() {
        let registry = Arc::new(SessionRegistry::new());
        let (_first, created) = registry.get_or_create("s1", || test_entry(&registry, "s1"));
        assert!(created);
        let (_second, created) = registry.get_or_create("s1", || test_entry(&registry, "s1"));
        assert!(!created);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_leaves_no_entry_behind() {
        let registry = Arc::new(SessionRegistry::new());
        registry.get_or_create("s1", || test_entry(&registry, "s1"));
        assert!(registry.get("s1").is_some());
        assert!(registry.remove("s1").is_some());
        assert!(registry.get("s1").is_none());
        assert!(registry.remove("s1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn snapshots_cover_every_session() {
        let registry = Arc::new(SessionRegistry::new());
        registry.get_or_create("a", || test_entry(&registry, "a"));
        registry.get_or_create("b", || test_entry(&registry, "b"));
        let mut ids: Vec<String> = registry
            .snapshots()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
