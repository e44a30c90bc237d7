//! Cell model and bus layer for hearth.
//!
//! Devices on the home-automation bus expose *cells*: named, typed
//! parameters. This crate owns the in-memory picture of those cells — their
//! values, completeness and the change stream the rule engine consumes — and
//! the MQTT adapter that keeps the picture in sync with the bus.

pub mod bus;
pub mod cell;
pub mod model;

pub use bus::{BusPublisher, MqttBus, MqttConfig, MqttDriver, Qos};
pub use cell::{Cell, CellSpec, CellType};
pub use model::{CellModel, ChangeReceiver};
