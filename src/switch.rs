//! The dead man's switch: fires its actions unless postponed within `ttl`,
//! tolerating `max_misses` consecutive missed intervals.
//!
//! `start`, `stop` and `postpone` are short critical sections under a single
//! mutex and never await. The monitoring loop runs as its own tokio task and
//! owns the miss counter and the timer.

use crate::action::{self, Action};
use crate::clock::{Clock, SystemClock};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Postpone source shown when a request does not carry one.
pub const DEFAULT_SOURCE: &str = "<unset>";

/// TTL used when a zero TTL is supplied.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Misses tolerated when none are configured: trigger on the first miss.
pub const DEFAULT_MAX_MISSES: u32 = 0;

/// Identifies who postponed the switch. Display-only, never used for
/// authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostponeRequest {
    pub source: String,
    /// Empty for requests that did not arrive over a network connection.
    pub remote_addr: String,
}

impl std::fmt::Display for PostponeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = if self.source.is_empty() {
            DEFAULT_SOURCE
        } else {
            &self.source
        };

        if self.remote_addr.is_empty() {
            write!(f, "[source={}]", source)
        } else {
            write!(f, "[source={}] [remoteaddr={}]", source, self.remote_addr)
        }
    }
}

/// Anything that can delay the trigger. Lets transports depend on the
/// operation instead of the concrete switch.
pub trait Postponer: Send + Sync {
    /// Returns true if the trigger was postponed, false if the switch is
    /// not running.
    fn postpone(&self, request: PostponeRequest) -> bool;
}

/// Lifecycle errors returned by `Switch::start` and `Switch::stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchError {
    /// `start` was called while a monitoring loop is active.
    AlreadyStarted,
    /// `stop` was called while no monitoring loop is active, including after
    /// the switch has already triggered.
    NotStarted,
}

impl std::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchError::AlreadyStarted => write!(f, "switch is already started"),
            SwitchError::NotStarted => write!(f, "switch is not started"),
        }
    }
}

impl std::error::Error for SwitchError {}

/// Externally observable switch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Stopped,
    Running,
    /// The miss threshold was reached and actions are running.
    Triggering,
}

impl SwitchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::Stopped => "stopped",
            SwitchState::Running => "running",
            SwitchState::Triggering => "triggering",
        }
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction parameters for a `Switch`.
#[derive(Debug, Clone, Copy)]
pub struct SwitchConfig {
    /// Interval to wait for a postpone. Zero means `DEFAULT_TTL`.
    pub ttl: Duration,
    /// Consecutive missed intervals tolerated. The switch triggers on miss
    /// number `max_misses + 1`.
    pub max_misses: u32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_misses: DEFAULT_MAX_MISSES,
        }
    }
}

/// Handles shared between the switch and its running loop.
struct Running {
    postpone: watch::Sender<Option<PostponeRequest>>,
    cancel: oneshot::Sender<()>,
    generation: u64,
}

enum State {
    Stopped,
    Running(Running),
    Triggering { generation: u64 },
}

impl State {
    fn observed(&self) -> SwitchState {
        match self {
            State::Stopped => SwitchState::Stopped,
            State::Running(_) => SwitchState::Running,
            State::Triggering { .. } => SwitchState::Triggering,
        }
    }
}

struct Guarded {
    state: State,
    next_generation: u64,
}

struct Inner {
    ttl: Duration,
    max_misses: u32,
    actions: Arc<[Box<dyn Action>]>,
    clock: Arc<dyn Clock>,
    guarded: Mutex<Guarded>,
    observed: watch::Sender<SwitchState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Guarded> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds a consistent state.
        self.guarded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the state and publish the change. Caller holds the lock.
    fn transition(&self, guarded: &mut Guarded, next: State) -> State {
        let previous = std::mem::replace(&mut guarded.state, next);
        self.observed.send_replace(guarded.state.observed());
        previous
    }

    /// Move a running loop to `Triggering`. Returns false if the state no
    /// longer belongs to `generation` (a concurrent `stop` won the race).
    fn begin_trigger(&self, generation: u64) -> bool {
        let mut guarded = self.lock();
        let owned = matches!(&guarded.state, State::Running(r) if r.generation == generation);
        if owned {
            self.transition(&mut guarded, State::Triggering { generation });
        }
        owned
    }

    /// Return to `Stopped` if `generation` still owns the state.
    fn finish(&self, generation: u64) {
        let mut guarded = self.lock();
        let owned = match &guarded.state {
            State::Running(r) => r.generation == generation,
            State::Triggering { generation: g } => *g == generation,
            State::Stopped => false,
        };
        if owned {
            self.transition(&mut guarded, State::Stopped);
        }
    }
}

/// A dead man's switch. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<Inner>,
}

impl Switch {
    /// Build a stopped switch. The monitoring loop does not run until
    /// `start` is called.
    pub fn new(config: SwitchConfig, actions: Vec<Box<dyn Action>>) -> Self {
        Self::with_clock(config, actions, Arc::new(SystemClock))
    }

    /// Build a stopped switch that takes its timers from `clock`.
    pub fn with_clock(
        config: SwitchConfig,
        actions: Vec<Box<dyn Action>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = if config.ttl.is_zero() {
            DEFAULT_TTL
        } else {
            config.ttl
        };
        let (observed, _) = watch::channel(SwitchState::Stopped);

        Self {
            inner: Arc::new(Inner {
                ttl,
                max_misses: config.max_misses,
                actions: actions.into(),
                clock,
                guarded: Mutex::new(Guarded {
                    state: State::Stopped,
                    next_generation: 0,
                }),
                observed,
            }),
        }
    }

    #[cfg(test)]
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    #[cfg(test)]
    pub fn max_misses(&self) -> u32 {
        self.inner.max_misses
    }

    pub fn state(&self) -> SwitchState {
        self.inner.lock().state.observed()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SwitchState> {
        self.inner.observed.subscribe()
    }

    /// Launch the monitoring loop and return immediately.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// `AlreadyStarted` if a loop is active or still running its actions.
    pub fn start(&self) -> Result<(), SwitchError> {
        let mut guarded = self.inner.lock();
        if !matches!(guarded.state, State::Stopped) {
            return Err(SwitchError::AlreadyStarted);
        }

        let generation = guarded.next_generation;
        guarded.next_generation += 1;

        let (postpone_tx, postpone_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.inner.transition(
            &mut guarded,
            State::Running(Running {
                postpone: postpone_tx,
                cancel: cancel_tx,
                generation,
            }),
        );
        drop(guarded);

        tracing::info!(
            ttl_ms = self.inner.ttl.as_millis() as u64,
            max_misses = self.inner.max_misses,
            actions = self.inner.actions.len(),
            "starting switch"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(monitor(inner, generation, postpone_rx, cancel_rx));
        Ok(())
    }

    /// Stop the monitoring loop without running any actions.
    ///
    /// Does not wait for the loop task to exit. Fails with `NotStarted` if
    /// no loop is active, which includes the case where the switch already
    /// triggered.
    pub fn stop(&self) -> Result<(), SwitchError> {
        let mut guarded = self.inner.lock();
        if !matches!(guarded.state, State::Running(_)) {
            return Err(SwitchError::NotStarted);
        }

        if let State::Running(running) = self.inner.transition(&mut guarded, State::Stopped) {
            // The loop may already be gone if it is racing to exit.
            let _ = running.cancel.send(());
        }
        Ok(())
    }

    /// Delay the trigger by resetting the miss counter and rearming the full
    /// TTL window. Never blocks beyond acquiring the state lock.
    pub fn postpone(&self, request: PostponeRequest) -> bool {
        let guarded = self.inner.lock();
        match &guarded.state {
            State::Running(running) => {
                // Single slot: a postpone the loop has not seen yet is replaced.
                running.postpone.send_replace(Some(request));
                true
            }
            _ => false,
        }
    }
}

impl Postponer for Switch {
    fn postpone(&self, request: PostponeRequest) -> bool {
        Switch::postpone(self, request)
    }
}

/// Returns the switch to `Stopped` however the loop exits, unwinding or
/// task cancellation included.
struct LoopExit {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.inner.finish(self.generation);
    }
}

async fn monitor(
    inner: Arc<Inner>,
    generation: u64,
    mut postpone: watch::Receiver<Option<PostponeRequest>>,
    mut cancel: oneshot::Receiver<()>,
) {
    let _exit = LoopExit {
        inner: Arc::clone(&inner),
        generation,
    };
    let mut misses: u32 = 0;

    loop {
        let mut timer = inner.clock.timer(inner.ttl);

        tokio::select! {
            biased;

            // Fires on stop; also resolves if the sender is dropped, which
            // only happens once the state has left `Running`.
            _ = &mut cancel => {
                timer.cancel();
                tracing::info!("stopping switch loop");
                break;
            }

            changed = postpone.changed() => {
                timer.cancel();
                if changed.is_err() {
                    break;
                }
                misses = 0;
                let request = postpone.borrow_and_update().clone();
                if let Some(request) = request {
                    tracing::info!("postponed {}", request);
                }
            }

            _ = &mut timer => {
                misses = misses.saturating_add(1);
                tracing::warn!(misses, max_misses = inner.max_misses, "missed postpone update");

                if misses > inner.max_misses {
                    if inner.begin_trigger(generation) {
                        tracing::warn!("triggering actions");
                        let failures = action::trigger(&inner.actions).await;
                        tracing::info!(
                            actions = inner.actions.len(),
                            failures,
                            "actions triggered, switch stopped"
                        );
                    }
                    break;
                }
            }
        }
    }
}
