//! Countdown session timer
//!
//! The timer is a small state machine (`Idle`, `Running`, `Paused`) whose
//! background tick decrements the remaining time once per period. Every
//! transition and every tick is reported as a [`TimerEvent`] on a channel;
//! events are sent while the state lock is held, so listeners see them in
//! the exact order the transitions happened.

use crate::error::TimerError;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
}

/// Notification emitted by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Started { total: u32 },
    Paused { remaining: u32 },
    Resumed { remaining: u32 },
    /// One period elapsed while running; `remaining` is always positive.
    Tick { remaining: u32 },
    Stopped,
    /// The countdown reached zero on its own.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub phase: TimerPhase,
    pub total: u32,
    pub remaining: u32,
}

impl TimerSnapshot {
    pub fn is_active(&self) -> bool {
        self.phase != TimerPhase::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.phase == TimerPhase::Paused
    }
}

#[derive(Debug)]
struct TimerState {
    phase: TimerPhase,
    total: u32,
    remaining: u32,
    /// Bumped on every start and stop so a tick task from an earlier
    /// session can tell it is stale.
    generation: u64,
}

pub struct SessionTimer {
    state: Arc<Mutex<TimerState>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    tick_period: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTimer {
    pub fn new(events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                phase: TimerPhase::Idle,
                total: 0,
                remaining: 0,
                generation: 0,
            })),
            events,
            tick_period: DEFAULT_TICK_PERIOD,
            ticker: Mutex::new(None),
        }
    }

    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    /// Starts a countdown of `duration` seconds. Must be called from within
    /// a tokio runtime.
    pub fn start(&self, duration: u32) -> Result<(), TimerError> {
        if duration == 0 {
            return Err(TimerError::ZeroDuration);
        }

        let generation = {
            let mut state = lock(&self.state);
            if state.phase != TimerPhase::Idle {
                return Err(TimerError::AlreadyActive);
            }

            state.generation += 1;
            state.phase = TimerPhase::Running;
            state.total = duration;
            state.remaining = duration;
            notify(&self.events, TimerEvent::Started { total: duration });
            state.generation
        };

        let task = tokio::spawn(run_ticks(
            Arc::clone(&self.state),
            self.events.clone(),
            generation,
            self.tick_period,
        ));
        if let Some(stale) = lock(&self.ticker).replace(task) {
            stale.abort();
        }

        info!("Session timer started: {}s", duration);
        Ok(())
    }

    /// Freezes the countdown. Returns the remaining seconds.
    pub fn pause(&self) -> Result<u32, TimerError> {
        let mut state = lock(&self.state);
        if state.phase != TimerPhase::Running {
            return Err(TimerError::NotRunning);
        }

        state.phase = TimerPhase::Paused;
        notify(
            &self.events,
            TimerEvent::Paused {
                remaining: state.remaining,
            },
        );
        info!("Session timer paused at {}s", state.remaining);
        Ok(state.remaining)
    }

    pub fn resume(&self) -> Result<u32, TimerError> {
        let mut state = lock(&self.state);
        if state.phase != TimerPhase::Paused {
            return Err(TimerError::NotPaused);
        }

        state.phase = TimerPhase::Running;
        notify(
            &self.events,
            TimerEvent::Resumed {
                remaining: state.remaining,
            },
        );
        info!("Session timer resumed at {}s", state.remaining);
        Ok(state.remaining)
    }

    /// Halts the countdown and waits for the tick task to finish.
    ///
    /// Returns whether a session was active. Stopping an idle timer is a
    /// no-op.
    pub async fn stop(&self) -> bool {
        let was_active = {
            let mut state = lock(&self.state);
            if state.phase == TimerPhase::Idle {
                false
            } else {
                state.generation += 1;
                state.phase = TimerPhase::Idle;
                state.remaining = 0;
                notify(&self.events, TimerEvent::Stopped);
                true
            }
        };

        let task = lock(&self.ticker).take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    debug!("Timer tick task ended abnormally: {}", e);
                }
            }
        }

        if was_active {
            info!("Session timer stopped");
        }
        was_active
    }

    /// Phase, total and remaining seconds, read together under one lock.
    pub fn snapshot(&self) -> TimerSnapshot {
        let state = lock(&self.state);
        TimerSnapshot {
            phase: state.phase,
            total: state.total,
            remaining: state.remaining,
        }
    }

    pub fn remaining(&self) -> u32 {
        lock(&self.state).remaining
    }

    pub fn is_active(&self) -> bool {
        self.snapshot().is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot().is_paused()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.ticker).take() {
            task.abort();
        }
    }
}

async fn run_ticks(
    state: Arc<Mutex<TimerState>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    generation: u64,
    period: Duration,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        if !advance(&state, &events, generation) {
            break;
        }
    }
}

/// Applies one tick. Returns false once the tick task should exit.
fn advance(
    state: &Mutex<TimerState>,
    events: &mpsc::UnboundedSender<TimerEvent>,
    generation: u64,
) -> bool {
    let mut state = lock(state);
    if state.generation != generation || state.phase == TimerPhase::Idle {
        return false;
    }
    if state.phase == TimerPhase::Paused {
        return true;
    }

    state.remaining = state.remaining.saturating_sub(1);
    if state.remaining == 0 {
        state.phase = TimerPhase::Idle;
        notify(events, TimerEvent::Expired);
        info!("Session expired after {}s", state.total);
        return false;
    }

    notify(
        events,
        TimerEvent::Tick {
            remaining: state.remaining,
        },
    );
    true
}

fn notify(events: &mpsc::UnboundedSender<TimerEvent>, event: TimerEvent) {
    if events.send(event).is_err() {
        debug!("No listener for timer event {:?}", event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
