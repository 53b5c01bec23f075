//! Cooperative per-actor scheduling.
//!
//! Every actor in the simulation (a service process, one direction of a
//! network link, the control-plane driver) owns a scheduler identity. Tasks
//! live in a single arena keyed by task id; each slot remembers its owning
//! scheduler so a forced kill can erase everything an actor owns in one pass.
//!
//! Wakers do not poll anything themselves. They append the task to a shared
//! wake list; after each dispatch the runtime loop drains that list and
//! schedules a resume at the current virtual time, after already-due work.
//! This keeps the single-stepping invariant: exactly one actor executes
//! between two queue pops.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Wake, Waker},
};

/// Identity of one cooperative scheduler (one actor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchedulerId(pub(crate) u64);

/// Identity of one task within the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskId(pub(crate) u64);

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// One stored task. The future is taken out of the slot while being polled
/// so the world is not borrowed during user code; an erased slot simply
/// disappears, which drops the future and cancels the task.
struct TaskSlot {
    scheduler: SchedulerId,
    future: Option<LocalFuture>,
}

/// Arena of all live tasks plus the scheduler name registry.
#[derive(Default)]
pub(crate) struct TaskArena {
    tasks: HashMap<TaskId, TaskSlot>,
    names: HashMap<SchedulerId, String>,
    next_task: u64,
    next_scheduler: u64,
}

impl TaskArena {
    pub(crate) fn create_scheduler(&mut self, name: impl Into<String>) -> SchedulerId {
        let id = SchedulerId(self.next_scheduler);
        self.next_scheduler += 1;
        self.names.insert(id, name.into());
        id
    }

    pub(crate) fn scheduler_name(&self, id: SchedulerId) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("?")
    }

    pub(crate) fn insert(&mut self, scheduler: SchedulerId, future: LocalFuture) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        self.tasks.insert(
            id,
            TaskSlot {
                scheduler,
                future: Some(future),
            },
        );
        id
    }

    /// Takes the future out of its slot for polling. Returns `None` when the
    /// task finished or was erased; stale resume events are simply skipped.
    pub(crate) fn take(&mut self, id: TaskId) -> Option<LocalFuture> {
        self.tasks.get_mut(&id).and_then(|slot| slot.future.take())
    }

    /// Puts a still-pending future back. The slot may have been erased while
    /// the task was running (a process stopping itself); in that case the
    /// future is dropped here and the task never resumes.
    pub(crate) fn restore(&mut self, id: TaskId, future: LocalFuture) {
        if let Some(slot) = self.tasks.get_mut(&id) {
            slot.future = Some(future);
        }
    }

    pub(crate) fn remove(&mut self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Removes every task owned by a scheduler. The futures are returned so
    /// the caller can drop them while the world is not borrowed.
    pub(crate) fn erase(&mut self, scheduler: SchedulerId) -> Vec<LocalFuture> {
        let mut removed = Vec::new();
        self.tasks.retain(|_, slot| {
            if slot.scheduler == scheduler {
                if let Some(future) = slot.future.take() {
                    removed.push(future);
                }
                false
            } else {
                true
            }
        });
        removed
    }
}

/// Ordered list of tasks marked ready since the last dispatch.
pub(crate) type WakeList = Arc<Mutex<Vec<(SchedulerId, TaskId)>>>;

/// Waker that marks a task ready by appending it to the wake list.
struct TaskWaker {
    scheduler: SchedulerId,
    task: TaskId,
    wakes: WakeList,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Ok(mut wakes) = self.wakes.lock() {
            wakes.push((self.scheduler, self.task));
        }
    }
}

/// Builds the waker handed to a task's poll context.
pub(crate) fn task_waker(scheduler: SchedulerId, task: TaskId, wakes: WakeList) -> Waker {
    Waker::from(Arc::new(TaskWaker {
        scheduler,
        task,
        wakes,
    }))
}
