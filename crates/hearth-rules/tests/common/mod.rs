//! Shared fixture for engine integration tests: an in-memory model, a
//! recording bus and a manually driven timer factory.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hearth_model::{BusPublisher, CellModel, CellSpec};
use hearth_rules::{EngineHandle, ManualTimerFactory, RuleEngine};
use parking_lot::Mutex;

/// Bus double that records every publish.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, String, u8, bool)>>,
}

impl RecordingBus {
    pub fn messages(&self) -> Vec<(String, String, u8, bool)> {
        self.messages.lock().clone()
    }

    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, ..)| t == topic)
            .map(|(_, payload, ..)| payload.clone())
            .collect()
    }
}

impl BusPublisher for RecordingBus {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retained: bool) {
        self.messages
            .lock()
            .push((topic.to_string(), payload.to_string(), qos, retained));
    }
}

pub struct Fixture {
    pub model: CellModel,
    pub handle: EngineHandle,
    pub timers: Arc<ManualTimerFactory>,
    pub bus: Arc<RecordingBus>,
}

pub fn fixture() -> Fixture {
    let model = CellModel::new();
    let bus = Arc::new(RecordingBus::default());
    let timers = Arc::new(ManualTimerFactory::new());
    model.set_bus(bus.clone());
    let handle = RuleEngine::new(model.clone(), bus.clone())
        .with_timer_factory(timers.clone())
        .start();
    Fixture {
        model,
        handle,
        timers,
        bus,
    }
}

/// Simulate the bus driver delivering a value for `"Device/Control"`.
pub fn publish(model: &CellModel, cell: &str, raw: &str) {
    let spec: CellSpec = cell.parse().unwrap();
    model.apply_bus_value(&spec, raw);
}

/// Let pending change notifications land, then drain the task queue behind
/// them. After this, everything published so far has been scheduled.
pub async fn settle(handle: &EngineHandle) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.call_sync(|_| ()).await.unwrap();
}

/// Poll until the condition holds; panics after ~2s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
