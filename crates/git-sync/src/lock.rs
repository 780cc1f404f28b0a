use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// One async mutex per project id. Whoever touches a project's repository
/// (sync, import, classification) holds its guard for the whole operation.
/// A project's entry is dropped again once nobody holds or waits for it.
#[derive(Clone, Default)]
pub struct ProjectLocks {
    inner: Slots,
}

/// Held access to one project. Releasing the last one prunes the entry.
pub struct ProjectGuard {
    guard: Option<OwnedMutexGuard<()>>,
    project_id: String,
    slots: Slots,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(project_id.to_string()).or_default().clone()
    }

    fn wrap(&self, project_id: &str, guard: OwnedMutexGuard<()>) -> ProjectGuard {
        ProjectGuard {
            guard: Some(guard),
            project_id: project_id.to_string(),
            slots: self.inner.clone(),
        }
    }

    pub async fn lock(&self, project_id: &str) -> ProjectGuard {
        let guard = self.slot(project_id).lock_owned().await;
        self.wrap(project_id, guard)
    }

    pub fn try_lock(&self, project_id: &str) -> Option<ProjectGuard> {
        let slot = self.slot(project_id);
        match slot.try_lock_owned() {
            Ok(guard) => Some(self.wrap(project_id, guard)),
            Err(_) => {
                prune(&self.inner, project_id);
                None
            }
        }
    }

    /// Number of projects with a live entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remove the entry when the map holds the only reference. Waiters and
/// holders each keep their own clone, so they keep it alive.
fn prune(slots: &Slots, project_id: &str) {
    let mut map = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if map.get(project_id).is_some_and(|m| Arc::strong_count(m) == 1) {
        map.remove(project_id);
    }
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        self.guard.take();
        prune(&self.slots, &self.project_id);
    }
}
