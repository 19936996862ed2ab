//! Session arena keyed by a stable session id, plus the fd alias map.
//!
//! One reader/writer lock covers the topology (both maps) and is only held for
//! map operations. Each session has its own async mutex that may be held
//! across network I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Descriptor handed to callers. Several may alias one session after `dup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub i32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Entry<T> {
    node: Arc<Mutex<T>>,
    refs: usize,
}

struct Topology<T> {
    sessions: HashMap<SessionId, Entry<T>>,
    fds: HashMap<Fd, SessionId>,
    next_id: u64,
}

pub struct Registry<T> {
    topology: RwLock<Topology<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            topology: RwLock::new(Topology {
                sessions: HashMap::new(),
                fds: HashMap::new(),
                next_id: 0,
            }),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session built by `build` and return it already locked, so no
    /// other task observes it half-initialised.
    pub async fn create(&self, build: impl FnOnce(SessionId) -> T) -> (SessionId, OwnedMutexGuard<T>) {
        let id = match self.topology.write() {
            Ok(mut topo) => {
                topo.next_id += 1;
                SessionId(topo.next_id)
            }
            Err(poisoned) => {
                let mut topo = poisoned.into_inner();
                topo.next_id += 1;
                SessionId(topo.next_id)
            }
        };
        let node = Arc::new(Mutex::new(build(id)));
        let guard = node.clone().lock_owned().await;
        if let Ok(mut topo) = self.topology.write() {
            topo.sessions.insert(id, Entry { node, refs: 0 });
        }
        (id, guard)
    }

    /// Alias `fd` to session `id`. `false` if the session is gone or `fd` is taken.
    pub fn attach_fd(&self, id: SessionId, fd: Fd) -> bool {
        let Ok(mut topo) = self.topology.write() else {
            return false;
        };
        if topo.fds.contains_key(&fd) {
            return false;
        }
        let Some(entry) = topo.sessions.get_mut(&id) else {
            return false;
        };
        entry.refs += 1;
        topo.fds.insert(fd, id);
        true
    }

    /// Drop alias `fd`. Returns its session and how many aliases remain.
    pub fn detach_fd(&self, fd: Fd) -> Option<(SessionId, usize)> {
        let mut topo = self.topology.write().ok()?;
        let id = topo.fds.remove(&fd)?;
        let entry = topo.sessions.get_mut(&id)?;
        entry.refs = entry.refs.saturating_sub(1);
        Some((id, entry.refs))
    }

    pub fn session_of(&self, fd: Fd) -> Option<SessionId> {
        self.topology.read().ok()?.fds.get(&fd).copied()
    }

    /// Session behind `fd`, locked. The topology lock is released before waiting.
    pub async fn lookup_by_fd(&self, fd: Fd) -> Option<OwnedMutexGuard<T>> {
        let node = {
            let topo = self.topology.read().ok()?;
            let id = topo.fds.get(&fd)?;
            topo.sessions.get(id)?.node.clone()
        };
        Some(node.lock_owned().await)
    }

    /// Remove session `id` from the arena if no fd still aliases it.
    pub fn unplug(&self, id: SessionId) -> Option<Arc<Mutex<T>>> {
        let mut topo = self.topology.write().ok()?;
        match topo.sessions.get(&id) {
            Some(entry) if entry.refs > 0 => {
                debug!(session = id.0, refs = entry.refs, "unplug refused, session still aliased");
                None
            }
            Some(_) => topo.sessions.remove(&id).map(|e| e.node),
            None => None,
        }
    }

    /// Release a session's memory. Refused (and logged) while an alias is live.
    pub fn destroy(&self, id: SessionId, node: OwnedMutexGuard<T>) -> bool {
        let refs = self
            .topology
            .read()
            .ok()
            .and_then(|t| t.sessions.get(&id).map(|e| e.refs))
            .unwrap_or(0);
        if refs > 0 {
            debug!(session = id.0, refs, "destroy deferred, session still aliased");
            return false;
        }
        drop(node);
        true
    }

    pub fn len(&self) -> usize {
        self.topology.read().map(|t| t.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fd_count(&self) -> usize {
        self.topology.read().map(|t| t.fds.len()).unwrap_or(0)
    }
}
