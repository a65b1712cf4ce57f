//! ---
//! herald_section: "04-publishing-resilience"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Circuit breaker, failed-message queue, and publishing facade."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
//! Two-state circuit breaker with a cancellable reset timer.
//!
//! Each time the circuit opens a new episode starts and exactly one reset
//! timer is scheduled for it. The timer closes the circuit only if its
//! episode is still the current one, so a timer outliving an early close is
//! harmless. There is no half-open state: the circuit closes unconditionally
//! once the reset timeout elapses.
use std::sync::{Arc, Weak};
use std::time::Duration;

use herald_broker::ReconnectGate;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Whether publishing is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Publishing permitted.
    Closed,
    /// Publishing short-circuited to the failed queue.
    Open,
}

impl CircuitState {
    /// Lowercase label used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
        }
    }

    /// Whether this is [`CircuitState::Open`].
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open)
    }
}

/// Broadcast on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State entered.
    pub state: CircuitState,
    /// Episode the transition belongs to.
    pub episode: u64,
}

struct BreakerState {
    open: bool,
    consecutive_failures: u32,
    episode: u64,
    failure_threshold: u32,
    reset_timeout: Duration,
    reset_task: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<BreakerState>,
    events: broadcast::Sender<Transition>,
}

impl Shared {
    /// Close `episode` if it is still open. The caller decides what happens
    /// to the timer handle taken out of the state.
    fn close_episode(&self, episode: u64) -> Option<Option<JoinHandle<()>>> {
        let mut state = self.state.lock();
        if !state.open || state.episode != episode {
            return None;
        }
        state.open = false;
        state.consecutive_failures = 0;
        let task = state.reset_task.take();
        // sent under the lock so subscribers see transitions in order
        let _ = self.events.send(Transition {
            state: CircuitState::Closed,
            episode,
        });
        Some(task)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().reset_task.take() {
            task.abort();
        }
    }
}

/// Shared handle to a circuit breaker; clones observe the same circuit.
///
/// Opening the circuit spawns the reset timer, so failures must be recorded
/// from within a tokio runtime.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// New closed breaker. A zero threshold is treated as one.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BreakerState {
                    open: false,
                    consecutive_failures: 0,
                    episode: 0,
                    failure_threshold: failure_threshold.max(1),
                    reset_timeout,
                    reset_task: None,
                }),
                events,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        if self.shared.state.lock().open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Whether the circuit is open.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// Whether a publish may go to the broker.
    pub fn allow_request(&self) -> bool {
        !self.is_open()
    }

    /// Failures counted since the last success or close.
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.state.lock().consecutive_failures
    }

    /// Number of times the circuit has opened.
    pub fn episode(&self) -> u64 {
        self.shared.state.lock().episode
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.shared.events.subscribe()
    }

    /// A success resets the failure count. It does not close an open circuit.
    pub fn record_success(&self) {
        self.shared.state.lock().consecutive_failures = 0;
    }

    /// Count a failure; returns `true` when this call opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.shared.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.open || state.consecutive_failures < state.failure_threshold {
            return false;
        }

        state.open = true;
        state.episode += 1;
        let episode = state.episode;
        let timeout = state.reset_timeout;
        if let Some(stale) = state.reset_task.take() {
            stale.abort();
        }
        state.reset_task = Some(spawn_reset_timer(
            Arc::downgrade(&self.shared),
            episode,
            timeout,
        ));
        warn!(
            episode,
            failures = state.consecutive_failures,
            reset_timeout = ?timeout,
            "circuit breaker opened"
        );
        let _ = self.shared.events.send(Transition {
            state: CircuitState::Open,
            episode,
        });
        true
    }

    /// Close the circuit ahead of its timer; returns `false` if it was not open.
    pub fn close_manually(&self) -> bool {
        let episode = self.episode();
        match self.shared.close_episode(episode) {
            Some(task) => {
                if let Some(task) = task {
                    task.abort();
                }
                info!(episode, "circuit breaker closed early");
                true
            }
            None => false,
        }
    }

    /// Apply new limits. They take effect for the next failure and the next
    /// episode; a pending timer keeps its original deadline.
    pub fn reconfigure(&self, failure_threshold: u32, reset_timeout: Duration) {
        let mut state = self.shared.state.lock();
        state.failure_threshold = failure_threshold.max(1);
        state.reset_timeout = reset_timeout;
    }
}

fn spawn_reset_timer(shared: Weak<Shared>, episode: u64, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.close_episode(episode) {
            // dropping our own handle detaches it; nothing to abort
            Some(_) => info!(episode, "circuit breaker reset timeout elapsed, closed"),
            None => debug!(episode, "stale reset timer ignored"),
        }
    })
}

impl ReconnectGate for CircuitBreaker {
    fn allow_reconnect(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("open", &state.open)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("episode", &state.episode)
            .field("failure_threshold", &state.failure_threshold)
            .field("reset_timeout", &state.reset_timeout)
            .finish_non_exhaustive()
    }
}
