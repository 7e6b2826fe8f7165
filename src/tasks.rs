//! Task Store
//!
//! The ordered, observable list of download tasks. All mutations go through
//! here so that `queue_order` stays a dense `1..N` ranking and every change is
//! broadcast to observers and the queue loop.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::events::{DownloaderEvent, EventBus};
use crate::models::{DownloadTask, NewTask, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

/// Shared task list. Cheap to clone; all clones see the same tasks.
///
/// Uses a std lock because progress updates arrive from the synchronous
/// line callback of a running process. Never held across an await.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks: Arc<RwLock<Vec<DownloadTask>>>,
    events: EventBus,
    changed: Arc<Notify>,
}

impl TaskStore {
    pub fn new(events: EventBus) -> Self {
        Self::with_tasks(Vec::new(), events)
    }

    /// Seed the store with tasks loaded from storage. Interrupted statuses are
    /// coerced and orders renumbered before anything sees them.
    pub fn with_tasks(mut tasks: Vec<DownloadTask>, events: EventBus) -> Self {
        coerce_on_load(&mut tasks);
        tasks.sort_by_key(|t| t.queue_order);
        renumber(&mut tasks);
        Self {
            tasks: Arc::new(RwLock::new(tasks)),
            events,
            changed: Arc::new(Notify::new()),
        }
    }

    /// Woken on every mutation.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    pub fn snapshot(&self) -> Vec<DownloadTask> {
        self.read().clone()
    }

    pub fn get(&self, id: TaskId) -> Option<DownloadTask> {
        self.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append a new waiting task at the end of the queue.
    pub fn add(&self, new: NewTask) -> DownloadTask {
        self.add_with_status(new, TaskStatus::Waiting)
    }

    pub fn add_with_status(&self, new: NewTask, status: TaskStatus) -> DownloadTask {
        let task = {
            let mut tasks = self.write();
            let task = DownloadTask::new(
                new.url,
                new.service,
                new.options,
                new.title,
                new.thumbnail,
                next_order(&tasks),
            )
            .with_status(status);
            tasks.push(task.clone());
            task
        };
        log::info!("Added task {} ({})", task.id, task.url);
        self.emit(DownloaderEvent::TaskAdded { task: task.clone() });
        task
    }

    /// Append a waiting task and claim it under the same lock, so the idle
    /// queue cannot start it first. Observers see `waiting` then `downloading`.
    pub fn add_claimed(&self, new: NewTask) -> DownloadTask {
        let (waiting, claimed) = {
            let mut tasks = self.write();
            let waiting = DownloadTask::new(
                new.url,
                new.service,
                new.options,
                new.title,
                new.thumbnail,
                next_order(&tasks),
            );
            let claimed = waiting.clone().with_status(TaskStatus::Downloading);
            tasks.push(claimed.clone());
            (waiting, claimed)
        };
        log::info!("Added task {} ({}) for immediate start", claimed.id, claimed.url);
        self.events.emit(DownloaderEvent::TaskAdded { task: waiting });
        self.emit(DownloaderEvent::TaskUpdated {
            task: claimed.clone(),
        });
        claimed
    }

    /// Append several tasks in input order with consecutive orders.
    pub fn add_bulk(&self, items: Vec<NewTask>) -> Vec<DownloadTask> {
        if items.is_empty() {
            return Vec::new();
        }
        let added: Vec<DownloadTask> = {
            let mut tasks = self.write();
            let first = next_order(&tasks);
            let added: Vec<DownloadTask> = items
                .into_iter()
                .enumerate()
                .map(|(i, new)| {
                    DownloadTask::new(
                        new.url,
                        new.service,
                        new.options,
                        new.title,
                        new.thumbnail,
                        first + i as u32,
                    )
                })
                .collect();
            tasks.extend(added.iter().cloned());
            added
        };
        log::info!("Added {} tasks", added.len());
        for task in &added {
            self.events
                .emit(DownloaderEvent::TaskAdded { task: task.clone() });
        }
        self.changed.notify_one();
        added
    }

    /// Apply `f` to the task with `id` and broadcast the result. Returns the
    /// updated task, or `None` when no such task exists.
    pub fn update<F>(&self, id: TaskId, f: F) -> Option<DownloadTask>
    where
        F: FnOnce(DownloadTask) -> DownloadTask,
    {
        let updated = {
            let mut tasks = self.write();
            let slot = tasks.iter_mut().find(|t| t.id == id)?;
            let mut next = f(slot.clone());
            // Identity and rank are owned by the store.
            next.id = slot.id;
            next.queue_order = slot.queue_order;
            *slot = next.clone();
            next
        };
        self.emit(DownloaderEvent::TaskUpdated {
            task: updated.clone(),
        });
        Some(updated)
    }

    /// Atomically move a waiting/paused/failed task to `Downloading`. Returns
    /// `None` when the task is missing or already running/completed.
    pub fn claim(&self, id: TaskId) -> Option<DownloadTask> {
        let claimed = {
            let mut tasks = self.write();
            let slot = tasks.iter_mut().find(|t| t.id == id)?;
            if !matches!(
                slot.status,
                TaskStatus::Waiting | TaskStatus::Paused | TaskStatus::Failed
            ) {
                return None;
            }
            slot.status = TaskStatus::Downloading;
            slot.clone()
        };
        self.emit(DownloaderEvent::TaskUpdated {
            task: claimed.clone(),
        });
        Some(claimed)
    }

    /// Atomically claim the waiting task with the lowest order, unless some
    /// task is already downloading.
    pub fn claim_next_waiting(&self) -> Option<DownloadTask> {
        let claimed = {
            let mut tasks = self.write();
            if tasks.iter().any(|t| t.status == TaskStatus::Downloading) {
                return None;
            }
            let slot = tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Waiting)
                .min_by_key(|t| t.queue_order)?;
            slot.status = TaskStatus::Downloading;
            slot.clone()
        };
        self.emit(DownloaderEvent::TaskUpdated {
            task: claimed.clone(),
        });
        Some(claimed)
    }

    /// Remove a task and close the gap in the ordering.
    pub fn remove(&self, id: TaskId) -> Option<DownloadTask> {
        let removed = {
            let mut tasks = self.write();
            let pos = tasks.iter().position(|t| t.id == id)?;
            let removed = tasks.remove(pos);
            renumber(&mut tasks);
            removed
        };
        self.emit(DownloaderEvent::TaskRemoved { id });
        self.emit_reset();
        Some(removed)
    }

    /// Swap a task with its neighbour. No-op (false) at the ends of the queue
    /// or for an unknown id.
    pub fn reorder(&self, id: TaskId, direction: MoveDirection) -> bool {
        {
            let mut tasks = self.write();
            tasks.sort_by_key(|t| t.queue_order);
            let Some(pos) = tasks.iter().position(|t| t.id == id) else {
                return false;
            };
            let other = match direction {
                MoveDirection::Up if pos > 0 => pos - 1,
                MoveDirection::Down if pos + 1 < tasks.len() => pos + 1,
                _ => return false,
            };
            let (a, b) = (tasks[pos].queue_order, tasks[other].queue_order);
            tasks[pos].queue_order = b;
            tasks[other].queue_order = a;
            tasks.swap(pos, other);
        }
        self.emit_reset();
        true
    }

    /// Keep only tasks matching `keep`. Returns the removed tasks.
    pub fn retain<F>(&self, mut keep: F) -> Vec<DownloadTask>
    where
        F: FnMut(&DownloadTask) -> bool,
    {
        let removed = {
            let mut tasks = self.write();
            let (kept, removed): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *tasks).into_iter().partition(|t| keep(t));
            *tasks = kept;
            renumber(&mut tasks);
            removed
        };
        if !removed.is_empty() {
            for task in &removed {
                self.events
                    .emit(DownloaderEvent::TaskRemoved { id: task.id });
            }
            self.emit_reset();
        }
        removed
    }

    pub fn clear(&self) -> Vec<DownloadTask> {
        self.retain(|_| false)
    }

    /// Coerce every downloading/waiting/analyzing task to paused, clearing
    /// live speed/eta. Returns how many tasks changed.
    pub fn coerce_interrupted(&self) -> usize {
        let changed = {
            let mut tasks = self.write();
            let mut changed = 0;
            for task in tasks.iter_mut().filter(|t| t.status.is_interruptible()) {
                *task = task.clone().paused();
                changed += 1;
            }
            changed
        };
        if changed > 0 {
            self.emit_reset();
        }
        changed
    }

    fn emit(&self, event: DownloaderEvent) {
        self.events.emit(event);
        self.changed.notify_one();
    }

    fn emit_reset(&self) {
        let tasks = self.snapshot();
        self.emit(DownloaderEvent::TasksReset { tasks });
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<DownloadTask>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<DownloadTask>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_order(tasks: &[DownloadTask]) -> u32 {
    tasks.iter().map(|t| t.queue_order).max().unwrap_or(0) + 1
}

/// Rewrite `queue_order` to `1..N` keeping the current relative order.
pub fn renumber(tasks: &mut [DownloadTask]) {
    tasks.sort_by_key(|t| t.queue_order);
    for (i, task) in tasks.iter_mut().enumerate() {
        task.queue_order = i as u32 + 1;
    }
}

/// A process cannot survive a restart: anything that was running or being
/// analyzed comes back paused.
pub fn coerce_on_load(tasks: &mut [DownloadTask]) {
    for task in tasks.iter_mut().filter(|t| t.status.is_transient()) {
        *task = task.clone().paused();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadOptions, DownloadService};

    fn new_task(url: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            service: DownloadService::Fetcher,
            options: DownloadOptions::default(),
            title: url.to_string(),
            thumbnail: None,
        }
    }

    fn orders(store: &TaskStore) -> Vec<(String, u32)> {
        let mut tasks = store.snapshot();
        tasks.sort_by_key(|t| t.queue_order);
        tasks.into_iter().map(|t| (t.url, t.queue_order)).collect()
    }

    #[test]
    fn orders_stay_dense_through_add_and_remove() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        store.add(new_task("b"));
        store.add_bulk(vec![new_task("c"), new_task("d")]);

        assert_eq!(
            orders(&store),
            vec![("a".into(), 1), ("b".into(), 2), ("c".into(), 3), ("d".into(), 4)]
        );

        store.remove(a.id);
        assert_eq!(
            orders(&store),
            vec![("b".into(), 1), ("c".into(), 2), ("d".into(), 3)]
        );
    }

    #[test]
    fn reorder_swaps_and_is_reversible() {
        let store = TaskStore::new(EventBus::new());
        store.add(new_task("a"));
        let b = store.add(new_task("b"));
        store.add(new_task("c"));

        assert!(store.reorder(b.id, MoveDirection::Up));
        assert_eq!(
            orders(&store),
            vec![("b".into(), 1), ("a".into(), 2), ("c".into(), 3)]
        );

        assert!(store.reorder(b.id, MoveDirection::Down));
        assert_eq!(
            orders(&store),
            vec![("a".into(), 1), ("b".into(), 2), ("c".into(), 3)]
        );
    }

    #[test]
    fn reorder_at_bounds_is_a_noop() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        let b = store.add(new_task("b"));

        assert!(!store.reorder(a.id, MoveDirection::Up));
        assert!(!store.reorder(b.id, MoveDirection::Down));
        assert!(!store.reorder(uuid::Uuid::new_v4(), MoveDirection::Up));
        assert_eq!(orders(&store), vec![("a".into(), 1), ("b".into(), 2)]);
    }

    #[test]
    fn claim_next_waiting_is_one_at_a_time_and_lowest_first() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        let b = store.add(new_task("b"));
        store.reorder(b.id, MoveDirection::Up);

        let first = store.claim_next_waiting().unwrap();
        assert_eq!(first.id, b.id);
        assert_eq!(first.status, TaskStatus::Downloading);
        assert!(store.claim_next_waiting().is_none());

        store.update(b.id, |t| t.completed());
        assert_eq!(store.claim_next_waiting().unwrap().id, a.id);
    }

    #[test]
    fn immediate_start_is_announced_as_waiting_first() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let store = TaskStore::new(events);

        let task = store.add_claimed(new_task("a"));
        assert_eq!(task.status, TaskStatus::Downloading);
        assert_eq!(task.queue_order, 1);
        assert!(store.claim_next_waiting().is_none());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                DownloaderEvent::TaskAdded { task } => seen.push(("added", task.status)),
                DownloaderEvent::TaskUpdated { task } => seen.push(("updated", task.status)),
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![
                ("added", TaskStatus::Waiting),
                ("updated", TaskStatus::Downloading)
            ]
        );
    }

    #[test]
    fn claim_refuses_running_and_completed_tasks() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        assert!(store.claim(a.id).is_some());
        assert!(store.claim(a.id).is_none());

        store.update(a.id, |t| t.completed());
        assert!(store.claim(a.id).is_none());
    }

    #[test]
    fn update_cannot_change_identity_or_rank() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        let updated = store
            .update(a.id, |mut t| {
                t.queue_order = 42;
                t.progress = 10.0;
                t
            })
            .unwrap();
        assert_eq!(updated.queue_order, 1);
        assert_eq!(updated.progress, 10.0);
    }

    #[test]
    fn coerce_interrupted_pauses_live_tasks() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        let b = store.add_with_status(new_task("b"), TaskStatus::Analyzing);
        let c = store.add(new_task("c"));
        store.update(a.id, |mut t| {
            t.status = TaskStatus::Downloading;
            t.speed = Some("1MiB/s".into());
            t
        });
        store.update(c.id, |t| t.completed());

        assert_eq!(store.coerce_interrupted(), 2);
        let a = store.get(a.id).unwrap();
        assert_eq!(a.status, TaskStatus::Paused);
        assert!(a.speed.is_none());
        assert_eq!(store.get(b.id).unwrap().status, TaskStatus::Paused);
        assert_eq!(store.get(c.id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn loading_pauses_transient_tasks_and_renumbers() {
        let mut running = DownloadTask::new("r", DownloadService::Extractor, Default::default(), "r", None, 7)
            .with_status(TaskStatus::Downloading);
        running.eta = Some("00:10".into());
        let waiting = DownloadTask::new("w", DownloadService::Extractor, Default::default(), "w", None, 3);

        let store = TaskStore::with_tasks(vec![running, waiting], EventBus::new());
        let tasks = store.snapshot();
        assert_eq!(tasks[0].url, "w");
        assert_eq!(tasks[0].queue_order, 1);
        assert_eq!(tasks[0].status, TaskStatus::Waiting);
        assert_eq!(tasks[1].queue_order, 2);
        assert_eq!(tasks[1].status, TaskStatus::Paused);
        assert!(tasks[1].eta.is_none());
    }

    #[test]
    fn retain_reports_removed_tasks() {
        let store = TaskStore::new(EventBus::new());
        let a = store.add(new_task("a"));
        store.add(new_task("b"));
        store.update(a.id, |t| t.completed());

        let removed = store.retain(|t| t.status != TaskStatus::Completed);
        assert_eq!(removed.len(), 1);
        assert_eq!(orders(&store), vec![("b".into(), 1)]);
        assert_eq!(store.clear().len(), 1);
        assert!(store.is_empty());
    }
}
