//! Completion tokens for asynchronously enqueued device commands.
//!
//! An [`Event`] is a cloneable handle shared between the queue that
//! completes it and any number of waiters. Callbacks registered with
//! [`Event::on_complete`] run exactly once, on whichever thread moves the
//! event to a terminal state (or immediately, if it is already terminal).

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::device::ResourceTracker;

/// Unique identifier for an event within one device.
pub type EventId = u64;

/// OpenCL `CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST`.
pub const ERROR_IN_WAIT_LIST: i32 = -14;

/// Execution status of the command behind an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Enqueued but not started.
    Queued,
    /// Currently executing on the device.
    Running,
    /// Completed successfully.
    Complete,
    /// Failed with a vendor error code.
    Error(i32),
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }
}

type CompletionCallback = Box<dyn FnOnce(EventStatus) + Send + 'static>;

struct EventState {
    status: EventStatus,
    callbacks: Vec<CompletionCallback>,
    completed_at: Option<Instant>,
}

struct EventInner {
    id: EventId,
    label: String,
    created_at: Instant,
    state: Mutex<EventState>,
    done: Condvar,
    tracker: Option<Arc<ResourceTracker>>,
}

impl Drop for EventInner {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.event_released();
        }
    }
}

/// Shared completion token.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create an untracked event in `Queued` state.
    pub fn new(id: EventId, label: impl Into<String>) -> Self {
        Self::build(id, label.into(), None)
    }

    pub(crate) fn tracked(id: EventId, label: String, tracker: Arc<ResourceTracker>) -> Self {
        tracker.event_created();
        Self::build(id, label, Some(tracker))
    }

    fn build(id: EventId, label: String, tracker: Option<Arc<ResourceTracker>>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id,
                label,
                created_at: Instant::now(),
                state: Mutex::new(EventState {
                    status: EventStatus::Queued,
                    callbacks: Vec::new(),
                    completed_at: None,
                }),
                done: Condvar::new(),
                tracker,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    /// Name of the command this event tracks.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn status(&self) -> EventStatus {
        self.state().status
    }

    /// Returns `true` when the event has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn set_running(&self) {
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.status = EventStatus::Running;
        }
    }

    pub fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    pub fn fail(&self, code: i32) {
        self.finish(EventStatus::Error(code));
    }

    fn finish(&self, status: EventStatus) {
        let callbacks = {
            let mut state = self.state();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.completed_at = Some(Instant::now());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.done.notify_all();
        for cb in callbacks {
            cb(status);
        }
    }

    /// Block until the event is terminal and return its final status.
    pub fn wait(&self) -> EventStatus {
        let mut state = self.state();
        while !state.status.is_terminal() {
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.status
    }

    /// Register `cb` to run once the event is terminal.
    ///
    /// Runs `cb` on the calling thread when the event already finished.
    pub fn on_complete<F>(&self, cb: F)
    where
        F: FnOnce(EventStatus) + Send + 'static,
    {
        let mut state = self.state();
        if state.status.is_terminal() {
            let status = state.status;
            drop(state);
            cb(status);
        } else {
            state.callbacks.push(Box::new(cb));
        }
    }

    /// Time from creation to completion, or to now if still pending.
    pub fn elapsed(&self) -> Duration {
        self.state()
            .completed_at
            .map(|t| t.duration_since(self.inner.created_at))
            .unwrap_or_else(|| self.inner.created_at.elapsed())
    }

    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn new_event_is_queued() {
        let ev = Event::new(1, "gemm_32_1_NN_1_1_float");
        assert_eq!(ev.status(), EventStatus::Queued);
        assert!(!ev.is_finished());
        assert_eq!(ev.label(), "gemm_32_1_NN_1_1_float");
    }

    #[test]
    fn callbacks_fire_once_on_completion() {
        let ev = Event::new(1, "k");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ev.on_complete(move |status| {
            assert_eq!(status, EventStatus::Complete);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ev.complete();
        ev.complete();
        ev.fail(-5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ev.status(), EventStatus::Complete);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let ev = Event::new(2, "k");
        ev.fail(-36);
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        ev.on_complete(move |status| *s.lock().unwrap() = Some(status));
        assert_eq!(*seen.lock().unwrap(), Some(EventStatus::Error(-36)));
    }

    #[test]
    fn wait_blocks_until_other_thread_completes() {
        let ev = Event::new(3, "k");
        let remote = ev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set_running();
            remote.complete();
        });
        assert_eq!(ev.wait(), EventStatus::Complete);
        handle.join().unwrap();
    }

    #[test]
    fn tracked_events_report_release() {
        let tracker = Arc::new(ResourceTracker::default());
        let ev = Event::tracked(4, "k".into(), Arc::clone(&tracker));
        let copy = ev.clone();
        assert_eq!(tracker.snapshot().live_events, 1);
        drop(ev);
        assert_eq!(tracker.snapshot().live_events, 1);
        drop(copy);
        assert_eq!(tracker.snapshot().live_events, 0);
    }
}
