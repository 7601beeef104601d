//! In-memory offline queue of deferred commands.
//!
//! Owned per facade instance rather than as a process-wide singleton: queue
//! semantics depend on which router is offline, so sharing one queue across
//! unrelated facades would silently cross-wire their retries. An embedder
//! wanting a shared/global queue composes one externally; the core does not
//! provide it.
//!
//! No durability contract — the queue is lost on process restart by design
//! (§1 Non-goals).

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Set,
    Remove,
}

#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub id: Uuid,
    pub path: String,
    pub action: Action,
    pub params: BTreeMap<String, String>,
    pub enqueued_at: Instant,
}

/// The per-facade deferred-command store.
#[derive(Default)]
pub struct OfflineQueue {
    tasks: Mutex<Vec<DeferredTask>>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task, returning its generated id.
    pub fn enqueue(&self, path: String, action: Action, params: BTreeMap<String, String>) -> Uuid {
        let id = Uuid::new_v4();
        self.tasks.lock().unwrap().push(DeferredTask {
            id,
            path,
            action,
            params,
            enqueued_at: Instant::now(),
        });
        id
    }

    /// Drain all queued tasks in enqueue order, handing each to `drain_one`
    /// in turn. Best-effort: a failure on one task does not prevent the
    /// rest from draining, and the queue does not roll back on partial
    /// failure (no transactional guarantee, per §1).
    pub async fn drain<F, Fut>(&self, mut drain_one: F)
    where
        F: FnMut(DeferredTask) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let pending = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in pending {
            drain_one(task).await;
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let queue = OfflineQueue::new();
        queue.enqueue("/ip/address".into(), Action::Add, BTreeMap::new());
        queue.enqueue("/ip/route".into(), Action::Remove, BTreeMap::new());
        assert_eq!(queue.len(), 2);

        let drained = std::sync::Mutex::new(Vec::new());
        queue
            .drain(|task| {
                drained.lock().unwrap().push(task.path);
                std::future::ready(())
            })
            .await;

        assert_eq!(drained.into_inner().unwrap(), vec!["/ip/address", "/ip/route"]);
        assert!(queue.is_empty());
    }
}
