use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// The monitor's view of the record/replay engine.
///
/// The monitor thread only ever sets these request flags; the emulator
/// thread observes and clears them between translation blocks. Nothing
/// else crosses the thread boundary.
#[derive(Debug, Default)]
pub struct RrControl {
    record_requested: AtomicBool,
    end_record_requested: AtomicBool,
    replay_requested: AtomicBool,
    end_replay_requested: AtomicBool,
    end_replay_is_error: AtomicBool,
    requested_name: Mutex<Option<PathBuf>>,
}

impl RrControl {
    pub fn new() -> RrControl {
        RrControl::default()
    }

    /// Asks the emulator to start recording into `name`.
    pub fn begin_record(&self, name: impl Into<PathBuf>) {
        *self.requested_name.lock().unwrap() = Some(name.into());
        self.record_requested.store(true, Ordering::SeqCst);
    }

    pub fn end_record(&self) {
        self.end_record_requested.store(true, Ordering::SeqCst);
    }

    /// Asks the emulator to start replaying from `name`.
    pub fn begin_replay(&self, name: impl Into<PathBuf>) {
        *self.requested_name.lock().unwrap() = Some(name.into());
        self.replay_requested.store(true, Ordering::SeqCst);
    }

    /// Asks the emulator to stop replaying; `is_error` marks an abort
    /// after a divergence rather than a clean end.
    pub fn end_replay(&self, is_error: bool) {
        self.end_replay_is_error.store(is_error, Ordering::SeqCst);
        self.end_replay_requested.store(true, Ordering::SeqCst);
    }

    // Emulator-side accessors: take the flag, returning whether it was
    // set.

    pub fn take_record_request(&self) -> Option<PathBuf> {
        if self.record_requested.swap(false, Ordering::SeqCst) {
            self.requested_name.lock().unwrap().take()
        } else {
            None
        }
    }

    pub fn take_end_record_request(&self) -> bool {
        self.end_record_requested.swap(false, Ordering::SeqCst)
    }

    pub fn take_replay_request(&self) -> Option<PathBuf> {
        if self.replay_requested.swap(false, Ordering::SeqCst) {
            self.requested_name.lock().unwrap().take()
        } else {
            None
        }
    }

    /// Returns `Some(is_error)` when an end-replay was requested.
    pub fn take_end_replay_request(&self) -> Option<bool> {
        if self.end_replay_requested.swap(false, Ordering::SeqCst) {
            Some(self.end_replay_is_error.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}
