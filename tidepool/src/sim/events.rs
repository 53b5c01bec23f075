//! Event queue for the simulation.
//!
//! Events are keyed by virtual time. Within one time bucket events fire in
//! insertion order, with one exception: when a bucket drains and the clock is
//! about to advance past it, every currently-due cancellable wait (jump) is
//! promoted into that bucket, ordered among themselves by jump identity.
//! This is how a cancellation interrupts an arbitrarily-far-future wait
//! without the wait ever being removed from the time index ahead of schedule.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use super::scheduler::{SchedulerId, TaskId};
use super::timer::{JumpId, JumpState};

/// A unit of work owned by a scheduler.
#[derive(Debug, Clone)]
pub(crate) enum EventPayload {
    /// Resume the task: poll it one step.
    Resume(TaskId),
    /// A timer or promise deadline firing (or firing early via cancellation).
    Fire(Rc<JumpState>),
}

impl EventPayload {
    /// Short label for trace recording.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            EventPayload::Resume(_) => "resume",
            EventPayload::Fire(_) => "fire",
        }
    }
}

/// Registration record for a jump while it is pending.
struct JumpSlot {
    scheduler: SchedulerId,
    /// Position in the time index, if the deadline is finite.
    deadline: Option<Duration>,
    state: Rc<JumpState>,
}

/// Priority structure keyed by virtual time, with a side index of
/// cancellable waits that may fire before their nominal deadline.
#[derive(Default)]
pub(crate) struct EventQueue {
    buckets: BTreeMap<Duration, VecDeque<(SchedulerId, EventPayload)>>,
    jumps: HashMap<JumpId, JumpSlot>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules a task resume at an absolute time.
    pub(crate) fn schedule_resume(
        &mut self,
        scheduler: SchedulerId,
        time: Duration,
        task: TaskId,
    ) {
        self.buckets
            .entry(time)
            .or_default()
            .push_back((scheduler, EventPayload::Resume(task)));
    }

    /// Registers a jump. A finite deadline also places it in the time index;
    /// an infinite one lives only in the jump index and fires solely via
    /// cancellation or completion.
    pub(crate) fn schedule_jump(
        &mut self,
        scheduler: SchedulerId,
        deadline: Option<Duration>,
        state: Rc<JumpState>,
    ) {
        let id = state.id();
        if let Some(time) = deadline {
            self.buckets
                .entry(time)
                .or_default()
                .push_back((scheduler, EventPayload::Fire(Rc::clone(&state))));
        }
        self.jumps.insert(
            id,
            JumpSlot {
                scheduler,
                deadline,
                state,
            },
        );
    }

    /// Removes every pending event and jump owned by a scheduler. Afterward
    /// nothing for that scheduler is ever popped.
    pub(crate) fn erase(&mut self, scheduler: SchedulerId) {
        for bucket in self.buckets.values_mut() {
            bucket.retain(|(owner, _)| *owner != scheduler);
        }
        self.jumps.retain(|_, slot| slot.scheduler != scheduler);
    }

    /// Pops the next due event, promoting due jumps at bucket boundaries.
    ///
    /// Returns `None` once no bucket holds fireable work; an exhausted queue
    /// is a terminal condition, not an error. Jumps whose deadline is
    /// infinite cannot by themselves keep the queue alive.
    pub(crate) fn pop_next(&mut self) -> Option<(Duration, SchedulerId, EventPayload)> {
        loop {
            let time = *self.buckets.keys().next()?;

            let drained = self
                .buckets
                .get(&time)
                .map(|b| b.is_empty())
                .unwrap_or(true);

            if drained {
                // About to advance past this time: promote every currently
                // due jump into the draining bucket, ordered by identity.
                let mut due: Vec<JumpId> = self
                    .jumps
                    .iter()
                    .filter(|(_, slot)| slot.state.is_due())
                    .map(|(id, _)| *id)
                    .collect();
                if due.is_empty() {
                    self.buckets.remove(&time);
                    continue;
                }
                due.sort_unstable();
                for id in due {
                    if let Some(slot) = self.jumps.remove(&id) {
                        // Pull it out of its deadline bucket so it cannot
                        // fire a second time.
                        if let Some(pos) = slot.deadline {
                            if pos != time {
                                self.remove_from_bucket(pos, id);
                            }
                        }
                        if let Some(bucket) = self.buckets.get_mut(&time) {
                            bucket.push_back((slot.scheduler, EventPayload::Fire(slot.state)));
                        }
                    }
                }
            }

            if let Some(bucket) = self.buckets.get_mut(&time) {
                if let Some((scheduler, payload)) = bucket.pop_front() {
                    // A jump popped at its deadline leaves the index here, so
                    // it can never refire through promotion.
                    if let EventPayload::Fire(state) = &payload {
                        self.jumps.remove(&state.id());
                    }
                    return Some((time, scheduler, payload));
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.jumps.clear();
    }

    fn remove_from_bucket(&mut self, time: Duration, id: JumpId) {
        if let Some(bucket) = self.buckets.get_mut(&time) {
            bucket.retain(|(_, payload)| match payload {
                EventPayload::Fire(state) => state.id() != id,
                _ => true,
            });
        }
    }
}
