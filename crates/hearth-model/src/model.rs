//! The in-memory cell model.
//!
//! The model is shared between the bus driver (which feeds values in) and
//! the rule engine (which reads and writes cells on its own thread), so all
//! state sits behind one lock. Change notifications fan out over unbounded
//! channels; subscribers release a channel by dropping its receiver.

use std::collections::BTreeMap;
use std::sync::Arc;

use hearth_core::{CellValue, Error, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::bus::BusPublisher;
use crate::cell::{Cell, CellSpec, CellType};

/// Receiver side of the cell-change channel. Dropping it releases the
/// channel.
pub type ChangeReceiver = mpsc::UnboundedReceiver<CellSpec>;

#[derive(Debug)]
struct DeviceEntry {
    title: String,
    local: bool,
    cells: BTreeMap<String, Cell>,
}

impl DeviceEntry {
    fn new(name: &str) -> Self {
        Self {
            title: name.to_string(),
            local: false,
            cells: BTreeMap::new(),
        }
    }
}

struct ModelState {
    devices: BTreeMap<String, DeviceEntry>,
    subscribers: Vec<mpsc::UnboundedSender<CellSpec>>,
    bus: Option<Arc<dyn BusPublisher>>,
}

/// Shared handle to the cell model. Cheap to clone.
#[derive(Clone)]
pub struct CellModel {
    state: Arc<RwLock<ModelState>>,
    ready_tx: Arc<watch::Sender<bool>>,
}

impl CellModel {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(ModelState {
                devices: BTreeMap::new(),
                subscribers: Vec::new(),
                bus: None,
            })),
            ready_tx: Arc::new(ready_tx),
        }
    }

    /// Attach the bus publisher used to mirror engine-initiated writes onto
    /// the bus.
    pub fn set_bus(&self, bus: Arc<dyn BusPublisher>) {
        self.state.write().bus = Some(bus);
    }

    /// Create the device if it does not exist yet.
    pub fn ensure_device(&self, name: &str) {
        let mut state = self.state.write();
        state
            .devices
            .entry(name.to_string())
            .or_insert_with(|| DeviceEntry::new(name));
    }

    /// Create or update a local (virtual) device owned by the engine.
    pub fn ensure_local_device(&self, name: &str, title: &str) {
        let mut state = self.state.write();
        let dev = state
            .devices
            .entry(name.to_string())
            .or_insert_with(|| DeviceEntry::new(name));
        dev.local = true;
        dev.title = title.to_string();
    }

    /// Create the cell (and its device) if it does not exist yet. New cells
    /// start incomplete with an inferred-on-first-value type.
    pub fn ensure_cell(&self, spec: &CellSpec) {
        let mut state = self.state.write();
        let dev = state
            .devices
            .entry(spec.device.clone())
            .or_insert_with(|| DeviceEntry::new(&spec.device));
        dev.cells
            .entry(spec.control.clone())
            .or_insert_with(|| Cell::new(&spec.control));
    }

    /// Declare a cell on a local device with an explicit type and initial
    /// value. The cell is complete from the start.
    pub fn set_cell(
        &self,
        device: &str,
        name: &str,
        cell_type: CellType,
        value: CellValue,
        readonly: bool,
    ) {
        self.declare_cell(device, name, cell_type, value, readonly, None);
    }

    /// Declare a `range` cell with an upper bound.
    pub fn set_range_cell(
        &self,
        device: &str,
        name: &str,
        value: CellValue,
        max: f64,
        readonly: bool,
    ) {
        self.declare_cell(device, name, CellType::Range, value, readonly, Some(max));
    }

    fn declare_cell(
        &self,
        device: &str,
        name: &str,
        cell_type: CellType,
        value: CellValue,
        readonly: bool,
        max: Option<f64>,
    ) {
        let spec = CellSpec::new(device, name);
        let payload;
        {
            let mut state = self.state.write();
            let dev = state
                .devices
                .entry(device.to_string())
                .or_insert_with(|| DeviceEntry::new(device));
            let cell = dev
                .cells
                .entry(name.to_string())
                .or_insert_with(|| Cell::new(name));
            cell.cell_type = cell_type;
            cell.typed = true;
            cell.readonly = readonly;
            cell.max = max;
            cell.raw = cell.encode(&value);
            cell.value = value;
            cell.complete = true;
            payload = cell.raw.clone();
            if let Some(bus) = &state.bus {
                publish_state(bus.as_ref(), &spec, &payload);
            }
        }
        self.notify(&spec);
    }

    /// Current typed value of a cell.
    pub fn value(&self, spec: &CellSpec) -> Option<CellValue> {
        let state = self.state.read();
        state
            .devices
            .get(&spec.device)
            .and_then(|d| d.cells.get(&spec.control))
            .map(|c| c.value.clone())
    }

    /// Raw wire payload of a cell.
    pub fn raw_value(&self, spec: &CellSpec) -> Option<String> {
        let state = self.state.read();
        state
            .devices
            .get(&spec.device)
            .and_then(|d| d.cells.get(&spec.control))
            .map(|c| c.raw.clone())
    }

    pub fn is_complete(&self, spec: &CellSpec) -> bool {
        let state = self.state.read();
        state
            .devices
            .get(&spec.device)
            .and_then(|d| d.cells.get(&spec.control))
            .map(|c| c.complete)
            .unwrap_or(false)
    }

    pub fn is_readonly(&self, spec: &CellSpec) -> bool {
        let state = self.state.read();
        state
            .devices
            .get(&spec.device)
            .and_then(|d| d.cells.get(&spec.control))
            .map(|c| c.readonly)
            .unwrap_or(false)
    }

    /// Engine-initiated write. Updates the model, mirrors the value onto the
    /// bus (state topic for local devices, command topic for external ones)
    /// and notifies change subscribers.
    pub fn set_value(&self, spec: &CellSpec, value: CellValue) -> Result<()> {
        {
            let mut state = self.state.write();
            let dev = state
                .devices
                .entry(spec.device.clone())
                .or_insert_with(|| DeviceEntry::new(&spec.device));
            let local = dev.local;
            let cell = dev
                .cells
                .entry(spec.control.clone())
                .or_insert_with(|| Cell::new(&spec.control));
            if cell.readonly {
                return Err(Error::Model(format!("cell {} is read-only", spec)));
            }
            cell.raw = cell.encode(&value);
            cell.value = value;
            cell.complete = true;
            let payload = cell.raw.clone();
            if let Some(bus) = &state.bus {
                if local {
                    publish_state(bus.as_ref(), spec, &payload);
                } else {
                    bus.publish(
                        &format!("/devices/{}/controls/{}/on", spec.device, spec.control),
                        &payload,
                        1,
                        false,
                    );
                }
            }
        }
        self.notify(spec);
        Ok(())
    }

    /// Bus-driver entry point: a value arrived from the bus. Marks the cell
    /// complete and notifies subscribers.
    pub fn apply_bus_value(&self, spec: &CellSpec, raw: &str) {
        {
            let mut state = self.state.write();
            let dev = state
                .devices
                .entry(spec.device.clone())
                .or_insert_with(|| DeviceEntry::new(&spec.device));
            let cell = dev
                .cells
                .entry(spec.control.clone())
                .or_insert_with(|| Cell::new(&spec.control));
            cell.value = cell.parse_raw(raw);
            cell.raw = raw.to_string();
            cell.complete = true;
        }
        self.notify(spec);
    }

    /// Bus-driver entry point: a `/meta/type` message declared a cell type.
    /// Reparses the current raw value under the new type.
    pub fn apply_bus_meta_type(&self, spec: &CellSpec, type_name: &str) {
        let Some(cell_type) = CellType::parse(type_name) else {
            debug!(cell = %spec, type_name, "ignoring unknown cell type");
            return;
        };
        let mut state = self.state.write();
        let dev = state
            .devices
            .entry(spec.device.clone())
            .or_insert_with(|| DeviceEntry::new(&spec.device));
        let cell = dev
            .cells
            .entry(spec.control.clone())
            .or_insert_with(|| Cell::new(&spec.control));
        cell.cell_type = cell_type;
        cell.typed = true;
        if cell.complete {
            let raw = cell.raw.clone();
            cell.value = cell.parse_raw(&raw);
        }
    }

    /// Subscribe to cell changes. Every mutation of a cell value produces one
    /// `CellSpec` message. Drop the receiver to release the channel.
    pub fn acquire_cell_change_channel(&self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().subscribers.push(tx);
        rx
    }

    /// Signal that the initial bus sync is done and rules may run.
    pub fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }

    /// Wait until [`mark_ready`](Self::mark_ready) has been called.
    pub async fn when_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn notify(&self, spec: &CellSpec) {
        let mut state = self.state.write();
        state
            .subscribers
            .retain(|tx| tx.send(spec.clone()).is_ok());
    }
}

impl Default for CellModel {
    fn default() -> Self {
        Self::new()
    }
}

fn publish_state(bus: &dyn BusPublisher, spec: &CellSpec, payload: &str) {
    bus.publish(
        &format!("/devices/{}/controls/{}", spec.device, spec.control),
        payload,
        1,
        true,
    );
}
