//! The timing triad: heartbeat emitter, election timeout, pulse monitor.
//!
//! All three share one lifecycle: `connect` registers the single expiry
//! callback, `start` (re)arms — cancelling any in-flight run so the previous
//! run's callback cannot fire — and `stop` is an idempotent cancel. Starting
//! before connecting is a usage error.
//!
//! The tokio implementations run their waits on spawned tasks and never block
//! the caller. Cancellation is a generation counter checked under the timer's
//! own lock immediately before the callback fires, plus a task abort; there
//! are no blocking joins, so a callback stopping its own timer cannot
//! deadlock.

use crate::error::{RaftError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Callback invoked on timer expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Repeating heartbeat emitter (leader only).
///
/// The callback fires immediately on `start` — starting counts as the first
/// beat — and then once per interval until stopped.
pub trait Heart: Send + Sync {
    fn connect(&self, on_beat: TimerCallback);
    fn start(&self, interval: Duration) -> Result<()>;
    fn stop(&self);
}

/// One-shot election timeout (candidate only).
pub trait ElectionTimeout: Send + Sync {
    fn connect(&self, on_elapsed: TimerCallback);
    fn start(&self, duration: Duration) -> Result<()>;
    fn stop(&self);
}

/// Follower failure detector.
///
/// Fires exactly once if the window elapses with no `pulse()` since
/// monitoring started or since the last pulse, then stays stopped until
/// restarted. `pulse()` refreshes the window without re-arming.
pub trait PulseMonitor: Send + Sync {
    fn connect(&self, on_pulse_lost: TimerCallback);
    fn start(&self, window: Duration) -> Result<()>;
    fn stop(&self);
    fn pulse(&self);
}

/// The three timers a node owns, behind their trait seams.
#[derive(Clone)]
pub struct Timers {
    pub heart: Arc<dyn Heart>,
    pub election: Arc<dyn ElectionTimeout>,
    pub pulse_monitor: Arc<dyn PulseMonitor>,
}

impl Timers {
    /// Tokio-backed timers. `start` spawns onto the ambient runtime, so the
    /// owning node must be created inside one.
    pub fn tokio() -> Self {
        Self {
            heart: Arc::new(TokioHeart::default()),
            election: Arc::new(TokioElectionTimeout::default()),
            pulse_monitor: Arc::new(TokioPulseMonitor::default()),
        }
    }
}

struct TimerState {
    callback: Option<TimerCallback>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            callback: None,
            generation: 0,
            task: None,
        }
    }
}

impl TimerState {
    /// Invalidate the in-flight run, if any.
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn armed_callback(&mut self, timer: &'static str) -> Result<TimerCallback> {
        self.callback
            .clone()
            .ok_or(RaftError::TimerNotConnected { timer })
    }
}

/// Check that `generation` is still current and, if so, retire the run.
///
/// Returns the callback to invoke. Called by expiry tasks with no locks held
/// around the actual invocation.
fn take_expiry(
    state: &Mutex<TimerState>,
    generation: u64,
    callback: &TimerCallback,
) -> Option<TimerCallback> {
    let mut state = state.lock();
    if state.generation != generation {
        return None;
    }
    state.task = None;
    Some(Arc::clone(callback))
}

/// Tokio heartbeat emitter.
#[derive(Default)]
pub struct TokioHeart {
    state: Arc<Mutex<TimerState>>,
}

impl Heart for TokioHeart {
    fn connect(&self, on_beat: TimerCallback) {
        self.state.lock().callback = Some(on_beat);
    }

    fn start(&self, interval: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let callback = state.armed_callback("heart")?;
        state.cancel();
        let generation = state.generation;

        let shared = Arc::clone(&self.state);
        state.task = Some(tokio::spawn(async move {
            loop {
                let beat = {
                    let state = shared.lock();
                    if state.generation != generation {
                        return;
                    }
                    Arc::clone(&callback)
                };
                beat();
                tokio::time::sleep(interval).await;
            }
        }));

        Ok(())
    }

    fn stop(&self) {
        self.state.lock().cancel();
    }
}

/// Tokio one-shot election timeout.
#[derive(Default)]
pub struct TokioElectionTimeout {
    state: Arc<Mutex<TimerState>>,
}

impl ElectionTimeout for TokioElectionTimeout {
    fn connect(&self, on_elapsed: TimerCallback) {
        self.state.lock().callback = Some(on_elapsed);
    }

    fn start(&self, duration: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let callback = state.armed_callback("election")?;
        state.cancel();
        let generation = state.generation;

        let shared = Arc::clone(&self.state);
        state.task = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(elapsed) = take_expiry(&shared, generation, &callback) {
                elapsed();
            }
        }));

        Ok(())
    }

    fn stop(&self) {
        self.state.lock().cancel();
    }
}

/// Tokio pulse monitor.
pub struct TokioPulseMonitor {
    state: Arc<Mutex<TimerState>>,
    last_pulse: Arc<Mutex<Instant>>,
}

impl Default for TokioPulseMonitor {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            last_pulse: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl PulseMonitor for TokioPulseMonitor {
    fn connect(&self, on_pulse_lost: TimerCallback) {
        self.state.lock().callback = Some(on_pulse_lost);
    }

    fn start(&self, window: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let callback = state.armed_callback("pulse monitor")?;
        state.cancel();
        let generation = state.generation;

        // Starting counts as the first pulse.
        *self.last_pulse.lock() = Instant::now();

        let shared = Arc::clone(&self.state);
        let last_pulse = Arc::clone(&self.last_pulse);
        state.task = Some(tokio::spawn(async move {
            loop {
                {
                    let state = shared.lock();
                    if state.generation != generation {
                        return;
                    }
                }

                let deadline = *last_pulse.lock() + window;
                if Instant::now() < deadline {
                    // A pulse may arrive while we sleep; loop to re-check.
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                    continue;
                }

                if let Some(lost) = take_expiry(&shared, generation, &callback) {
                    lost();
                }
                return;
            }
        }));

        Ok(())
    }

    fn stop(&self) {
        self.state.lock().cancel();
    }

    fn pulse(&self) {
        *self.last_pulse.lock() = Instant::now();
    }
}

/// Inert timers that only fire when the test tells them to.
///
/// `start`/`stop` track the running flag (and still enforce the connect-first
/// contract) but nothing fires on its own, so tests drive transitions
/// deterministically.
pub struct ManualTimers {
    pub heart: Arc<ManualHeart>,
    pub election: Arc<ManualElectionTimeout>,
    pub pulse_monitor: Arc<ManualPulseMonitor>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self {
            heart: Arc::new(ManualHeart::default()),
            election: Arc::new(ManualElectionTimeout::default()),
            pulse_monitor: Arc::new(ManualPulseMonitor::default()),
        }
    }

    pub fn timers(&self) -> Timers {
        Timers {
            heart: self.heart.clone(),
            election: self.election.clone(),
            pulse_monitor: self.pulse_monitor.clone(),
        }
    }
}

impl Default for ManualTimers {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ManualHeart {
    callback: Mutex<Option<TimerCallback>>,
    running: AtomicBool,
}

impl ManualHeart {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire one beat, as the interval elapsing would.
    pub fn beat(&self) {
        if !self.is_running() {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(beat) = callback {
            beat();
        }
    }
}

impl Heart for ManualHeart {
    fn connect(&self, on_beat: TimerCallback) {
        *self.callback.lock() = Some(on_beat);
    }

    fn start(&self, _interval: Duration) -> Result<()> {
        if self.callback.lock().is_none() {
            return Err(RaftError::TimerNotConnected { timer: "heart" });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ManualElectionTimeout {
    callback: Mutex<Option<TimerCallback>>,
    running: AtomicBool,
}

impl ManualElectionTimeout {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Expire the one-shot, as the duration elapsing would.
    pub fn expire(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(elapsed) = callback {
            elapsed();
        }
    }
}

impl ElectionTimeout for ManualElectionTimeout {
    fn connect(&self, on_elapsed: TimerCallback) {
        *self.callback.lock() = Some(on_elapsed);
    }

    fn start(&self, _duration: Duration) -> Result<()> {
        if self.callback.lock().is_none() {
            return Err(RaftError::TimerNotConnected { timer: "election" });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ManualPulseMonitor {
    callback: Mutex<Option<TimerCallback>>,
    running: AtomicBool,
    pulses: AtomicU64,
}

impl ManualPulseMonitor {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pulse_count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }

    /// Fire the failure detector, as the window elapsing would.
    pub fn lose_pulse(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(lost) = callback {
            lost();
        }
    }
}

impl PulseMonitor for ManualPulseMonitor {
    fn connect(&self, on_pulse_lost: TimerCallback) {
        *self.callback.lock() = Some(on_pulse_lost);
    }

    fn start(&self, _window: Duration) -> Result<()> {
        if self.callback.lock().is_none() {
            return Err(RaftError::TimerNotConnected {
                timer: "pulse monitor",
            });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn pulse(&self) {
        self.pulses.fetch_add(1, Ordering::SeqCst);
    }
}
