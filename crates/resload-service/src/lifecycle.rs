//! Loader-wide pause and exit-early signals shared with all workers.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// A gate that parks workers while the loader is paused.
///
/// Waiting workers wake up when the gate reopens, and whenever [`PauseGate::wake`] is called so
/// they can re-check their cancellation flag.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Closes or reopens the gate. Reopening wakes all parked workers.
    pub fn set_paused(&self, paused: bool) {
        let mut guard = self.paused.lock();
        *guard = paused;
        if !paused {
            self.resumed.notify_all();
        }
    }

    /// Blocks while the gate is closed and `cancelled` is not set.
    ///
    /// Returns the value of `cancelled` at the time the gate was passed.
    pub fn await_if_paused(&self, cancelled: &AtomicBool) -> bool {
        let mut paused = self.paused.lock();
        while *paused && !cancelled.load(Ordering::SeqCst) {
            self.resumed.wait(&mut paused);
        }
        cancelled.load(Ordering::SeqCst)
    }

    /// Wakes every parked worker without reopening the gate.
    ///
    /// Setters of a cancellation flag must call this after setting it, the lock is taken so a
    /// worker cannot miss the wakeup between checking its flag and parking.
    pub fn wake(&self) {
        let _guard = self.paused.lock();
        self.resumed.notify_all();
    }
}

/// The coarse state of the whole loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Tasks execute normally.
    Running,
    /// Workers park before doing any work.
    Paused,
    /// Workers finish their current step, but results are neither committed nor delivered.
    Stopped,
}

/// Pause and exit-early flags, read by every worker.
#[derive(Debug, Default)]
pub struct LifecycleState {
    exit_early: AtomicBool,
    gate: PauseGate,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to `phase`.
    ///
    /// Leaving [`Phase::Paused`] always reopens the gate, so stopping a paused loader releases
    /// its workers.
    pub fn transition(&self, phase: Phase) {
        self.exit_early
            .store(phase == Phase::Stopped, Ordering::SeqCst);
        self.gate.set_paused(phase == Phase::Paused);
        tracing::debug!(?phase, "loader lifecycle changed");
    }

    pub fn phase(&self) -> Phase {
        if self.exit_early() {
            Phase::Stopped
        } else if self.gate.is_paused() {
            Phase::Paused
        } else {
            Phase::Running
        }
    }

    pub fn exit_early(&self) -> bool {
        self.exit_early.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// See [`PauseGate::await_if_paused`].
    pub fn await_if_paused(&self, cancelled: &AtomicBool) -> bool {
        self.gate.await_if_paused(cancelled)
    }

    /// See [`PauseGate::wake`].
    pub fn wake_waiters(&self) {
        self.gate.wake();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn spawn_waiter(
        gate: &Arc<PauseGate>,
        cancelled: &Arc<AtomicBool>,
    ) -> thread::JoinHandle<bool> {
        let gate = Arc::clone(gate);
        let cancelled = Arc::clone(cancelled);
        thread::spawn(move || gate.await_if_paused(&cancelled))
    }

    #[test]
    fn test_open_gate_passes() {
        let gate = PauseGate::new();
        let cancelled = AtomicBool::new(false);
        assert!(!gate.await_if_paused(&cancelled));
    }

    #[test]
    fn test_resume_releases_waiters() {
        let gate = Arc::new(PauseGate::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        gate.set_paused(true);

        let waiters: Vec<_> = (0..3).map(|_| spawn_waiter(&gate, &cancelled)).collect();
        thread::sleep(Duration::from_millis(50));
        assert!(waiters.iter().all(|w| !w.is_finished()));

        gate.set_paused(false);
        for waiter in waiters {
            assert!(!waiter.join().unwrap());
        }
    }

    #[test]
    fn test_cancel_releases_waiter() {
        let gate = Arc::new(PauseGate::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        gate.set_paused(true);

        let waiter = spawn_waiter(&gate, &cancelled);
        thread::sleep(Duration::from_millis(50));

        cancelled.store(true, Ordering::SeqCst);
        gate.wake();
        assert!(waiter.join().unwrap());
        assert!(gate.is_paused());
    }

    #[test]
    fn test_stop_unpauses() {
        let state = LifecycleState::new();
        state.transition(Phase::Paused);
        assert_eq!(state.phase(), Phase::Paused);
        assert!(!state.exit_early());

        state.transition(Phase::Stopped);
        assert_eq!(state.phase(), Phase::Stopped);
        assert!(!state.is_paused());

        state.transition(Phase::Running);
        assert_eq!(state.phase(), Phase::Running);
        assert!(!state.exit_early());
    }
}
