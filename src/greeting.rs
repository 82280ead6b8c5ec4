//! Greeting bubble scheduling.
//!
//! While the widget is closed and the conversation is empty, the greeting
//! bubble blinks on a fixed cadence: hidden for one delay, shown for one
//! delay, hidden again. Any interruption hides it and stops the cycle.
//!
//! All timer work goes through a single handle slot, so at most one timer is
//! ever pending per scheduler.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, trace};

pub const DEFAULT_GREETING_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GreetingPhase {
    Idle,
    WaitingToShow,
    Showing,
    WaitingToRecycle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetingState {
    pub visible: bool,
}

/// The three values the greeting cycle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreetingInputs {
    pub is_open: bool,
    pub message_count: usize,
    /// `None` until widget settings are known. A zero delay disables the cycle.
    pub greeting_delay: Option<Duration>,
}

impl GreetingInputs {
    pub fn should_greet(&self) -> bool {
        !self.is_open
            && self.message_count == 0
            && self.greeting_delay.is_some_and(|delay| !delay.is_zero())
    }
}

struct Cycle {
    phase: GreetingPhase,
    inputs: Option<GreetingInputs>,
    delay: Duration,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Shared {
    cycle: Mutex<Cycle>,
    state: watch::Sender<GreetingState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Cycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_visible(&self, visible: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.visible != visible;
            state.visible = visible;
            changed
        });
    }

    /// Cancels the pending timer, hides the bubble and parks the cycle in `Idle`.
    fn halt(&self, cycle: &mut Cycle) {
        if let Some(timer) = cycle.timer.take() {
            timer.abort();
        }
        cycle.generation += 1;
        cycle.phase = GreetingPhase::Idle;
        self.set_visible(false);
    }

    /// Enters `phase` and schedules its expiry after one delay. The previous
    /// timer, if any, is cancelled first.
    fn arm(self: &Arc<Self>, cycle: &mut Cycle, phase: GreetingPhase) {
        if let Some(timer) = cycle.timer.take() {
            timer.abort();
        }
        cycle.generation += 1;
        cycle.phase = phase;

        let generation = cycle.generation;
        let delay = cycle.delay;
        let shared: Weak<Self> = Arc::downgrade(self);
        cycle.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(generation);
            }
        }));
        trace!(?phase, ?delay, "greeting timer armed");
    }

    fn expire(self: &Arc<Self>, generation: u64) {
        let mut cycle = self.lock();
        if cycle.generation != generation {
            return;
        }
        // The handle belongs to the task running this call; it finishes on its own.
        cycle.timer = None;

        match cycle.phase {
            GreetingPhase::WaitingToShow => {
                self.set_visible(true);
                self.arm(&mut cycle, GreetingPhase::Showing);
            }
            GreetingPhase::Showing => {
                self.set_visible(false);
                self.arm(&mut cycle, GreetingPhase::WaitingToRecycle);
            }
            GreetingPhase::WaitingToRecycle => {
                if cycle.inputs.is_some_and(|inputs| inputs.should_greet()) {
                    self.set_visible(true);
                    self.arm(&mut cycle, GreetingPhase::Showing);
                } else {
                    self.halt(&mut cycle);
                }
            }
            GreetingPhase::Idle => {}
        }
        debug!(phase = ?cycle.phase, "greeting phase changed");
    }
}

/// Drives the greeting bubble for one widget instance.
///
/// Must be used from within a tokio runtime. Dropping the scheduler cancels
/// its pending timer.
pub struct GreetingScheduler {
    shared: Arc<Shared>,
}

impl GreetingScheduler {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GreetingState::default());
        Self {
            shared: Arc::new(Shared {
                cycle: Mutex::new(Cycle {
                    phase: GreetingPhase::Idle,
                    inputs: None,
                    delay: DEFAULT_GREETING_DELAY,
                    timer: None,
                    generation: 0,
                }),
                state,
            }),
        }
    }

    /// Re-binds the cycle to new inputs. Unchanged inputs leave a running
    /// cycle alone; anything else tears it down before a new one is armed.
    pub fn update(&self, inputs: GreetingInputs) {
        let mut cycle = self.shared.lock();
        if cycle.inputs == Some(inputs) {
            return;
        }
        cycle.inputs = Some(inputs);
        self.shared.halt(&mut cycle);

        if let (true, Some(delay)) = (inputs.should_greet(), inputs.greeting_delay) {
            cycle.delay = delay;
            self.shared.arm(&mut cycle, GreetingPhase::WaitingToShow);
        }
    }

    /// Hides the bubble and stops the cycle until `update` re-arms it.
    pub fn interrupt(&self) {
        let mut cycle = self.shared.lock();
        if cycle.phase != GreetingPhase::Idle || cycle.timer.is_some() {
            debug!("greeting cycle interrupted");
        }
        self.shared.halt(&mut cycle);
    }

    pub fn phase(&self) -> GreetingPhase {
        self.shared.lock().phase
    }

    pub fn is_visible(&self) -> bool {
        self.shared.state.borrow().visible
    }

    /// Number of timers currently pending: 0 or 1.
    pub fn pending_timers(&self) -> usize {
        self.shared
            .lock()
            .timer
            .as_ref()
            .map_or(0, |timer| usize::from(!timer.is_finished()))
    }

    pub fn subscribe(&self) -> watch::Receiver<GreetingState> {
        self.shared.state.subscribe()
    }
}

impl Default for GreetingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GreetingScheduler {
    fn drop(&mut self) {
        let mut cycle = self.shared.lock();
        self.shared.halt(&mut cycle);
    }
}
