//! The timer subsystem.
//!
//! Timer ids are dense positive integers: starting a timer takes the lowest
//! free slot, stopping one frees the slot for reuse, and id 0 is reserved.
//! Platform timers run in background tasks produced by a [`TimerFactory`];
//! each tick re-enters the engine loop through the task channel, so timer
//! callbacks always execute on the engine thread. A tick that was already in
//! flight when its timer was stopped finds an empty slot and is dropped.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::ScriptValue;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::error;

use crate::bridge::ScriptCtx;
use crate::engine::{EngineHandle, EngineInner};
use crate::script::{Callable, CallbackArgs};

/// Timer identifier handed to scripts. Positive; 0 is reserved.
pub type TimerId = usize;

/// Tick stream of one platform timer. The producer stops when the receiver
/// is dropped.
pub type TimerTicks = mpsc::Receiver<()>;

/// Seam for platform timers, injectable so tests can drive a deterministic
/// clock.
pub trait TimerFactory: Send + Sync {
    fn start(&self, id: TimerId, duration: Duration, periodic: bool) -> TimerTicks;
}

/// Wall-clock timers on the tokio runtime.
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn start(&self, _id: TimerId, duration: Duration, periodic: bool) -> TimerTicks {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if periodic {
                let mut interval = tokio::time::interval_at(Instant::now() + duration, duration);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if tx.send(()).await.is_err() {
                        return;
                    }
                }
            } else {
                tokio::time::sleep(duration).await;
                let _ = tx.send(()).await;
            }
        });
        rx
    }
}

/// Test factory: records what was armed and lets the test produce ticks.
#[derive(Clone, Default)]
pub struct ManualTimerFactory {
    armed: Arc<Mutex<Vec<ArmedTimer>>>,
}

struct ArmedTimer {
    id: TimerId,
    duration: Duration,
    periodic: bool,
    tx: mpsc::Sender<()>,
}

impl ManualTimerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every timer ever armed, oldest first: `(id, duration, periodic)`.
    pub fn armed(&self) -> Vec<(TimerId, Duration, bool)> {
        self.armed
            .lock()
            .iter()
            .map(|t| (t.id, t.duration, t.periodic))
            .collect()
    }

    /// Produce one tick on the most recently armed timer with this id.
    /// Returns false if that timer is gone (stopped).
    pub async fn fire(&self, id: TimerId) -> bool {
        let tx = {
            let armed = self.armed.lock();
            armed.iter().rev().find(|t| t.id == id).map(|t| t.tx.clone())
        };
        match tx {
            Some(tx) => tx.send(()).await.is_ok(),
            None => false,
        }
    }
}

impl TimerFactory for ManualTimerFactory {
    fn start(&self, id: TimerId, duration: Duration, periodic: bool) -> TimerTicks {
        let (tx, rx) = mpsc::channel(4);
        self.armed.lock().push(ArmedTimer {
            id,
            duration,
            periodic,
            tx,
        });
        rx
    }
}

/// One occupied timer slot.
pub(crate) struct TimerEntry {
    pub periodic: bool,
    /// Set for named timers started via `start_ticker`/`start_named_timer`.
    pub name: Option<String>,
    /// Dropping this cancels the tick-forwarding task and, through it, the
    /// platform timer.
    pub stop: Option<oneshot::Sender<()>>,
}

impl EngineInner {
    pub(crate) fn start_timer_callable(
        &mut self,
        callback: Callable,
        ms: u64,
        periodic: bool,
    ) -> TimerId {
        let id = self.allocate_timer_slot();
        self.timer_callbacks.insert(id, callback);
        self.arm_timer(id, ms, periodic, None)
    }

    /// Start a script-visible named timer. A tick runs a full rule pass with
    /// `timer_firing(name)` true for its duration; an existing timer under
    /// the same name is replaced.
    pub(crate) fn start_named_timer(&mut self, name: &str, ms: u64, periodic: bool) -> TimerId {
        if let Some(old) = self.named_timers.get(name).copied() {
            self.remove_timer(old);
        }
        let id = self.allocate_timer_slot();
        let timer_name = name.to_string();
        let callback: Callable = Arc::new(move |ctx, _| {
            ctx.engine.current_timer = Some(timer_name.clone());
            ctx.engine.run_rules(None);
            ctx.engine.current_timer = None;
            Ok(ScriptValue::Undefined)
        });
        self.timer_callbacks.insert(id, callback);
        self.named_timers.insert(name.to_string(), id);
        self.arm_timer(id, ms, periodic, Some(name.to_string()))
    }

    fn allocate_timer_slot(&mut self) -> TimerId {
        for (index, slot) in self.timers.iter().enumerate() {
            if slot.is_none() {
                return index + 1;
            }
        }
        self.timers.push(None);
        self.timers.len()
    }

    fn arm_timer(&mut self, id: TimerId, ms: u64, periodic: bool, name: Option<String>) -> TimerId {
        let ticks = self
            .timer_factory
            .start(id, Duration::from_millis(ms), periodic);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.timers[id - 1] = Some(TimerEntry {
            periodic,
            name,
            stop: Some(stop_tx),
        });
        let handle = self.handle.clone();
        tokio::spawn(forward_ticks(ticks, stop_rx, handle, id, periodic));
        id
    }

    /// Runs on the engine thread for every tick. Tolerates ticks for slots
    /// that were freed while the tick was in flight.
    pub(crate) fn fire_timer(&mut self, id: TimerId) {
        let periodic = match self.timers.get(id - 1) {
            Some(Some(entry)) => entry.periodic,
            _ => {
                error!(timer = id, "firing unknown timer");
                return;
            }
        };
        if let Some(callback) = self.timer_callbacks.get(&id).cloned() {
            if let Err(err) = callback(&mut ScriptCtx::new(self), &CallbackArgs::None) {
                error!(timer = id, error = %err, "timer callback failed");
            }
        }
        if !periodic {
            self.remove_timer(id);
        }
    }

    pub(crate) fn stop_timer(&mut self, id: TimerId) {
        if id == 0 {
            error!("timer id cannot be zero");
            return;
        }
        let occupied = matches!(self.timers.get(id - 1), Some(Some(_)));
        if occupied {
            self.remove_timer(id);
        } else {
            error!(timer = id, "trying to stop unknown timer");
        }
    }

    pub(crate) fn stop_named_timer(&mut self, name: &str) {
        match self.named_timers.get(name).copied() {
            Some(id) => self.remove_timer(id),
            None => error!(timer = name, "trying to stop unknown timer"),
        }
    }

    fn remove_timer(&mut self, id: TimerId) {
        self.timer_callbacks.remove(&id);
        if let Some(slot) = self.timers.get_mut(id - 1) {
            if let Some(entry) = slot.take() {
                if let Some(name) = entry.name {
                    self.named_timers.remove(&name);
                }
            }
        }
    }
}

async fn forward_ticks(
    mut ticks: TimerTicks,
    mut stop: oneshot::Receiver<()>,
    handle: EngineHandle,
    id: TimerId,
    periodic: bool,
) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            tick = ticks.recv() => match tick {
                Some(()) => {
                    handle.inject(move |engine| engine.fire_timer(id));
                    if !periodic {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
