//! Completion-driven release of per-tile resources.
//!
//! A tile's transient images must outlive every kernel that reads them.
//! The completion callback on the tile's compute token does not release
//! anything itself: it only forwards the tile's [`PendingLaunch`] over a
//! channel to a reaper thread, which drops it. Dropping a record releases
//! its transient images and its references to the tile's tokens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::event::{Event, EventStatus};
use crate::image::TransientImage;

/// Resources held by one launched tile until its compute token completes.
#[derive(Debug, Default)]
pub struct PendingLaunch {
    /// Staging tokens and the compute token.
    pub events: Vec<Event>,
    pub images: Vec<TransientImage>,
}

impl PendingLaunch {
    pub fn new(events: Vec<Event>, images: Vec<TransientImage>) -> Self {
        Self { events, images }
    }
}

enum Message {
    Release(PendingLaunch),
    Shutdown,
}

/// Cumulative reaper counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub attached: u64,
    pub released: u64,
    pub images_released: u64,
    pub failed_launches: u64,
}

impl ReclaimStats {
    pub fn outstanding(&self) -> u64 {
        self.attached - self.released
    }
}

#[derive(Default)]
struct State {
    counts: Mutex<ReclaimStats>,
    drained: Condvar,
}

impl State {
    fn counts(&self) -> MutexGuard<'_, ReclaimStats> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, record: PendingLaunch) {
        let images = record.images.len() as u64;
        drop(record);
        let mut counts = self.counts();
        counts.released += 1;
        counts.images_released += images;
        if counts.outstanding() == 0 {
            self.drained.notify_all();
        }
    }
}

/// Cloneable submission side of a [`Reclaimer`].
#[derive(Clone)]
pub struct ReclaimHandle {
    tx: Sender<Message>,
    state: Arc<State>,
}

/// Hand `record` to the reaper, or release it inline once the reaper is gone.
fn submit(tx: &Sender<Message>, state: &State, record: PendingLaunch) {
    if let Err(mpsc::SendError(Message::Release(record))) = tx.send(Message::Release(record)) {
        state.release(record);
    }
}

fn note_failure(state: &State, label: &str, status: EventStatus) {
    if let EventStatus::Error(code) = status {
        warn!(kernel = %label, code, "launch failed, releasing its resources");
        state.counts().failed_launches += 1;
    }
}

impl ReclaimHandle {
    /// Release `record` once `token` reaches a terminal state.
    pub fn attach(&self, token: &Event, record: PendingLaunch) {
        self.state.counts().attached += 1;
        let tx = self.tx.clone();
        let state = Arc::clone(&self.state);
        let label = token.label().to_string();
        token.on_complete(move |status| {
            note_failure(&state, &label, status);
            submit(&tx, &state, record);
        });
    }

    /// Release `record` once every token in `after` is terminal.
    pub fn defer_all(&self, record: PendingLaunch, after: &[Event]) {
        let tokens = match after {
            [] => return self.defer(record, None),
            [token] => return self.attach(token, record),
            tokens => tokens,
        };
        self.state.counts().attached += 1;
        let pending = Arc::new(Mutex::new(Some(record)));
        let remaining = Arc::new(AtomicUsize::new(tokens.len()));
        for token in tokens {
            let tx = self.tx.clone();
            let state = Arc::clone(&self.state);
            let pending = Arc::clone(&pending);
            let remaining = Arc::clone(&remaining);
            let label = token.label().to_string();
            token.on_complete(move |status| {
                note_failure(&state, &label, status);
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let record = pending.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(record) = record {
                    submit(&tx, &state, record);
                }
            });
        }
    }

    /// Release `record` after `after` completes, or right away through the
    /// reaper when there is nothing to wait for.
    pub fn defer(&self, record: PendingLaunch, after: Option<&Event>) {
        match after {
            Some(token) => self.attach(token, record),
            None => {
                self.state.counts().attached += 1;
                submit(&self.tx, &self.state, record);
            }
        }
    }
}

/// Owner of the reaper thread.
pub struct Reclaimer {
    handle: ReclaimHandle,
    reaper: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let state = Arc::new(State::default());
        let reaper_state = Arc::clone(&state);
        let reaper = thread::spawn(move || reap(&rx, &reaper_state));
        Self {
            handle: ReclaimHandle { tx, state },
            reaper: Some(reaper),
        }
    }

    pub fn handle(&self) -> ReclaimHandle {
        self.handle.clone()
    }

    pub fn attach(&self, token: &Event, record: PendingLaunch) {
        self.handle.attach(token, record);
    }

    /// Records attached but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.handle.state.counts().outstanding()
    }

    pub fn stats(&self) -> ReclaimStats {
        *self.handle.state.counts()
    }

    /// Block until every attached record has been released.
    pub fn quiesce(&self) {
        let state = &self.handle.state;
        let mut counts = state.counts();
        while counts.outstanding() > 0 {
            counts = state
                .drained
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        // Records still waiting on their tokens are released by the
        // completing thread once the reaper is gone.
        let _ = self.handle.tx.send(Message::Shutdown);
        if let Some(reaper) = self.reaper.take() {
            if reaper.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

fn reap(rx: &Receiver<Message>, state: &State) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Release(record) => {
                trace!(
                    events = record.events.len(),
                    images = record.images.len(),
                    "releasing tile resources"
                );
                state.release(record);
            }
            Message::Shutdown => break,
        }
    }
    while let Ok(Message::Release(record)) = rx.try_recv() {
        state.release(record);
    }
    debug!(released = state.counts().released, "reaper stopped");
}
