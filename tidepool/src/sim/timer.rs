//! Jump-backed futures: delays and promises.
//!
//! A jump is a registered continuation with a deadline and a liveness
//! predicate. It fires at its deadline, or earlier at a bucket boundary once
//! the predicate turns true (cancellation requested, promise completed).
//! Firing wakes the awaiting task; the outcome is decided at poll time from
//! the jump's state, mirroring the precedence cancellation > timeout >
//! error > result.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use tokio_util::sync::CancellationToken;

use crate::error::{SimulationError, SimulationResult};

/// Stable numeric identity of a jump; the deterministic tie-break key when
/// several jumps fire at the same bucket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct JumpId(pub(crate) u64);

/// Shared state between a registered jump and the future awaiting it.
#[derive(Debug)]
pub(crate) struct JumpState {
    id: JumpId,
    token: Option<CancellationToken>,
    completed: Cell<bool>,
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl JumpState {
    pub(crate) fn new(id: JumpId, token: Option<CancellationToken>) -> Self {
        Self {
            id,
            token,
            completed: Cell::new(false),
            fired: Cell::new(false),
            waker: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> JumpId {
        self.id
    }

    /// The liveness predicate: may this jump fire ahead of its deadline?
    pub(crate) fn is_due(&self) -> bool {
        self.completed.get()
            || self
                .token
                .as_ref()
                .map(|t| t.is_cancelled())
                .unwrap_or(false)
    }

    fn is_cancelled(&self) -> bool {
        self.token
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Marks the jump fired and wakes the awaiting task, if any.
    pub(crate) fn fire(&self) {
        self.fired.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn register(&self, waker: &Waker) {
        *self.waker.borrow_mut() = Some(waker.clone());
    }
}

/// Future that completes when simulated time reaches its deadline, or fails
/// fast once the cancellation token fires.
///
/// Created through the environment or control handles; the jump is already
/// registered with the event queue by the time the future exists.
pub struct SimDelay {
    state: Option<Rc<JumpState>>,
    error: Option<SimulationError>,
}

impl SimDelay {
    pub(crate) fn new(state: Rc<JumpState>) -> Self {
        Self {
            state: Some(state),
            error: None,
        }
    }

    /// A delay that immediately resolves to an error; used when the world
    /// behind a handle is already gone.
    pub(crate) fn failed(error: SimulationError) -> Self {
        Self {
            state: None,
            error: Some(error),
        }
    }
}

impl Future for SimDelay {
    type Output = SimulationResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(error) = this.error.take() {
            return Poll::Ready(Err(error));
        }
        let Some(state) = this.state.as_ref() else {
            return Poll::Ready(Err(SimulationError::SimulationShutdown));
        };
        if !state.fired.get() {
            state.register(cx.waker());
            return Poll::Pending;
        }
        if state.is_cancelled() {
            return Poll::Ready(Err(SimulationError::Cancelled));
        }
        Poll::Ready(Ok(()))
    }
}

type PromiseValue<T> = Rc<RefCell<Option<SimulationResult<T>>>>;

/// Completion side of a promise. Completing does not wake the awaiting task
/// directly; the result is observed at the next bucket boundary, after all
/// already-queued same-time work.
pub(crate) struct PromiseHandle<T> {
    state: Rc<JumpState>,
    value: PromiseValue<T>,
}

impl<T> Clone for PromiseHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            value: Rc::clone(&self.value),
        }
    }
}

impl<T> PromiseHandle<T> {
    pub(crate) fn set_result(&self, value: T) {
        if !self.state.completed.get() {
            *self.value.borrow_mut() = Some(Ok(value));
            self.state.completed.set(true);
        }
    }

    pub(crate) fn set_error(&self, error: SimulationError) {
        if !self.state.completed.get() {
            *self.value.borrow_mut() = Some(Err(error));
            self.state.completed.set(true);
        }
    }
}

/// Future side of a promise with a deadline and optional cancellation token.
///
/// Resolves to the completed value, or `Timeout` when the deadline fires
/// first, or `Cancelled` when the token fires first.
pub(crate) struct SimPromise<T> {
    state: Rc<JumpState>,
    value: PromiseValue<T>,
}

impl<T> SimPromise<T> {
    /// Builds the linked handle/future pair over an already-registered jump.
    pub(crate) fn pair(state: Rc<JumpState>) -> (PromiseHandle<T>, SimPromise<T>) {
        let value: PromiseValue<T> = Rc::new(RefCell::new(None));
        (
            PromiseHandle {
                state: Rc::clone(&state),
                value: Rc::clone(&value),
            },
            SimPromise { state, value },
        )
    }
}

impl<T> Future for SimPromise<T> {
    type Output = SimulationResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.state.fired.get() {
            self.state.register(cx.waker());
            return Poll::Pending;
        }
        if self.state.is_cancelled() {
            return Poll::Ready(Err(SimulationError::Cancelled));
        }
        match self.value.borrow_mut().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Ready(Err(SimulationError::Timeout)),
        }
    }
}
