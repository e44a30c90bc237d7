//! Rule evaluation engine for the hearth bus.
//!
//! User scripts declare rules over bus cells; the engine turns those
//! declarations into a dependency-tracked, change-driven evaluation graph:
//!
//! - **Level rules** (`when`) fire whenever their condition is true.
//! - **Edge rules** (`asSoonAs`) fire on false→true transitions.
//! - **Change rules** (`onCellChange`) fire when a watched cell changes.
//!
//! Conditions are opaque callables; the cells they depend on are discovered
//! by recording reads during evaluation, and a rule is only re-checked when
//! one of its cells changes. A condition that touches a cell that has not
//! yet received a value from the bus is skipped for that pass.
//!
//! Everything runs on one engine task: cell changes, timer ticks and
//! subprocess completions are serialized through it, so rule code never
//! observes concurrent mutation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hearth_model::{CellModel, MqttConfig, MqttDriver};
//! use hearth_rules::{RuleDef, RuleEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = CellModel::new();
//!     let bus = MqttDriver::start(MqttConfig::new("localhost"), model.clone());
//!     let engine = RuleEngine::new(model, Arc::new(bus)).start();
//!
//!     engine
//!         .define_rule(
//!             "heaterOn",
//!             RuleDef::new()
//!                 .as_soon_as(|ctx| {
//!                     Ok(ctx.cell_value("Weather", "Temp1")?.as_f64() < Some(20.0))
//!                 })
//!                 .then(|ctx, _| {
//!                     ctx.set_cell_value("Relays", "Relay1", true)?;
//!                     Ok(())
//!                 }),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod callbacks;
pub mod cron;
pub mod engine;
pub mod process;
pub mod rule;
pub mod script;
pub mod timers;

pub use bridge::{ScriptCtx, VirtualCellDef, VirtualDeviceDef, DEFAULT_CELL_MAX};
pub use callbacks::CallbackId;
pub use cron::{CronJob, CronJobId, CronScheduler, ManualCron, NoCron};
pub use engine::{EngineHandle, RuleEngine};
pub use process::SpawnOptions;
pub use rule::{RuleDef, RuleType};
pub use script::{
    callable, process_callback, Callable, CallbackArgs, CellChangeEvent, ProcessExit, ScriptError,
    ScriptResult,
};
pub use timers::{ManualTimerFactory, TimerFactory, TimerId, TokioTimerFactory};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
