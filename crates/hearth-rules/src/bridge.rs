//! The script-host bridge.
//!
//! [`ScriptCtx`] is the primitive surface rule scripts see: cell accessors
//! (each read routed through the dependency tracker), rule and
//! virtual-device definition, timers, subprocesses, raw bus publishes and
//! logging. The script host holds an [`EngineHandle`](crate::EngineHandle)
//! and reaches this surface through `call_sync`; callables receive it as
//! their first argument.

use std::collections::BTreeMap;
use std::sync::Arc;

use hearth_core::{CellValue, Error, Result, ScriptValue};
use hearth_model::{CellSpec, CellType, Qos};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::EngineInner;
use crate::process::SpawnOptions;
use crate::script::{Callable, ScriptError, ScriptResult};
use crate::timers::TimerId;

/// Upper bound used for `range` cells that do not declare one.
pub const DEFAULT_CELL_MAX: f64 = 255.0;

/// A virtual-device definition as a script supplies it.
///
/// Deserializes from the literal shape scripts use:
///
/// ```json
/// {
///   "title": "Stabilization Settings",
///   "cells": {
///     "enabled": {"type": "switch", "value": false},
///     "lowThreshold": {"type": "range", "value": 20, "max": 40}
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualDeviceDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub cells: BTreeMap<String, VirtualCellDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCellDef {
    #[serde(rename = "type")]
    pub cell_type: CellType,
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub readonly: bool,
}

impl VirtualDeviceDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn cell(
        mut self,
        name: impl Into<String>,
        cell_type: CellType,
        value: impl Into<CellValue>,
    ) -> Self {
        self.cells.insert(
            name.into(),
            VirtualCellDef {
                cell_type,
                value: value.into(),
                max: None,
                readonly: false,
            },
        );
        self
    }

    pub fn range_cell(
        mut self,
        name: impl Into<String>,
        value: impl Into<CellValue>,
        max: f64,
    ) -> Self {
        self.cells.insert(
            name.into(),
            VirtualCellDef {
                cell_type: CellType::Range,
                value: value.into(),
                max: Some(max),
                readonly: false,
            },
        );
        self
    }

    pub fn readonly_cell(
        mut self,
        name: impl Into<String>,
        cell_type: CellType,
        value: impl Into<CellValue>,
    ) -> Self {
        self.cells.insert(
            name.into(),
            VirtualCellDef {
                cell_type,
                value: value.into(),
                max: None,
                readonly: true,
            },
        );
        self
    }
}

/// The engine as scripts see it. Only ever constructed on the engine task.
pub struct ScriptCtx<'a> {
    pub(crate) engine: &'a mut EngineInner,
}

impl<'a> ScriptCtx<'a> {
    pub(crate) fn new(engine: &'a mut EngineInner) -> Self {
        Self { engine }
    }

    /// Create or update a virtual device owned by this engine. Its cells
    /// are complete from the start.
    pub fn define_virtual_device(&mut self, name: &str, def: VirtualDeviceDef) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Model("device name must not be empty".into()));
        }
        let title = def.title.unwrap_or_else(|| name.to_string());
        self.engine.model.ensure_local_device(name, &title);
        for (cell_name, cell) in def.cells {
            match cell.cell_type {
                CellType::Range => self.engine.model.set_range_cell(
                    name,
                    &cell_name,
                    cell.value,
                    cell.max.unwrap_or(DEFAULT_CELL_MAX),
                    cell.readonly,
                ),
                cell_type => self.engine.model.set_cell(
                    name,
                    &cell_name,
                    cell_type,
                    cell.value,
                    cell.readonly,
                ),
            }
        }
        Ok(())
    }

    pub fn define_rule(&mut self, name: &str, def: crate::rule::RuleDef) -> Result<()> {
        self.engine.define_rule(name, def)
    }

    /// Destroy a rule: its callback handles are released and it never fires
    /// again. Safe to call from inside a rule body, including on the rule
    /// itself; the registry slot is reclaimed before the next full pass.
    /// Returns false for an unknown (or already destroyed) name.
    pub fn undefine_rule(&mut self, name: &str) -> bool {
        self.engine.undefine_rule(name)
    }

    /// Registry contents in evaluation order.
    pub fn rule_names(&self) -> Vec<String> {
        self.engine.rule_names()
    }

    /// Declare a short name for a cell. Resolution happens on each use, so
    /// the cell does not have to exist yet.
    pub fn define_alias(&mut self, alias: &str, target: &str) -> Result<()> {
        let spec: CellSpec = target.parse()?;
        self.engine.aliases.insert(alias.to_string(), spec);
        Ok(())
    }

    // --- cell access; every read goes through the dependency tracker ---

    /// Typed value of a cell. Under an armed condition guard, reading an
    /// incomplete cell yields the incomplete-cell sentinel; elsewhere it
    /// reads the current (possibly default) value.
    pub fn cell_value(&mut self, device: &str, control: &str) -> ScriptResult<CellValue> {
        let spec = CellSpec::new(device, control);
        self.engine.model.ensure_cell(&spec);
        self.engine.track_cell(&spec);
        if self.engine.require_complete > 0 && !self.engine.model.is_complete(&spec) {
            return Err(ScriptError::IncompleteCell(spec));
        }
        Ok(self.engine.model.value(&spec).unwrap_or_default())
    }

    /// Raw wire payload of a cell.
    pub fn raw_cell_value(&mut self, device: &str, control: &str) -> ScriptResult<String> {
        let spec = CellSpec::new(device, control);
        self.engine.model.ensure_cell(&spec);
        self.engine.track_cell(&spec);
        if self.engine.require_complete > 0 && !self.engine.model.is_complete(&spec) {
            return Err(ScriptError::IncompleteCell(spec));
        }
        Ok(self.engine.model.raw_value(&spec).unwrap_or_default())
    }

    pub fn cell_is_complete(&mut self, device: &str, control: &str) -> bool {
        let spec = CellSpec::new(device, control);
        self.engine.model.ensure_cell(&spec);
        self.engine.track_cell(&spec);
        self.engine.model.is_complete(&spec)
    }

    pub fn set_cell_value(
        &mut self,
        device: &str,
        control: &str,
        value: impl Into<CellValue>,
    ) -> ScriptResult<()> {
        let spec = CellSpec::new(device, control);
        self.engine.model.ensure_cell(&spec);
        self.engine.track_cell(&spec);
        self.engine
            .model
            .set_value(&spec, value.into())
            .map_err(|err| ScriptError::Failure(err.to_string()))
    }

    /// Read through an alias declared with [`define_alias`](Self::define_alias).
    pub fn alias_value(&mut self, alias: &str) -> ScriptResult<CellValue> {
        let spec = self.resolve_alias(alias)?;
        self.cell_value(&spec.device, &spec.control)
    }

    pub fn set_alias_value(&mut self, alias: &str, value: impl Into<CellValue>) -> ScriptResult<()> {
        let spec = self.resolve_alias(alias)?;
        self.set_cell_value(&spec.device, &spec.control, value)
    }

    fn resolve_alias(&self, alias: &str) -> ScriptResult<CellSpec> {
        self.engine
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| ScriptError::Failure(format!("unknown alias '{}'", alias)))
    }

    // --- logging and bus ---

    pub fn log(&mut self, message: impl AsRef<str>) {
        info!(target: "rule", "{}", message.as_ref());
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        debug!(target: "rule", "{}", message.as_ref());
    }

    /// Raw publish to the bus. QoS must be 0, 1 or 2.
    pub fn publish(&mut self, topic: &str, payload: &str, qos: u8, retained: bool) -> Result<()> {
        if Qos::from_u8(qos).is_none() {
            return Err(Error::Bus(format!("invalid qos {}", qos)));
        }
        self.engine.bus.publish(topic, payload, qos, retained);
        Ok(())
    }

    // --- timers ---

    /// Arm a timer with a script callback. Returns immediately with the
    /// allocated id.
    pub fn start_timer<F>(&mut self, ms: u64, periodic: bool, callback: F) -> TimerId
    where
        F: Fn(&mut ScriptCtx<'_>) -> ScriptResult<()> + Send + Sync + 'static,
    {
        let callable: Callable = Arc::new(move |ctx, _| {
            callback(ctx)?;
            Ok(ScriptValue::Undefined)
        });
        self.engine.start_timer_callable(callable, ms, periodic)
    }

    pub fn stop_timer(&mut self, id: TimerId) {
        self.engine.stop_timer(id)
    }

    /// Arm the periodic named timer `name`. Each tick runs a rule pass with
    /// [`timer_firing`](Self::timer_firing) true for this name.
    pub fn start_ticker(&mut self, name: &str, ms: u64) -> TimerId {
        self.engine.start_named_timer(name, ms, true)
    }

    /// One-shot variant of [`start_ticker`](Self::start_ticker).
    pub fn start_named_timer(&mut self, name: &str, ms: u64) -> TimerId {
        self.engine.start_named_timer(name, ms, false)
    }

    pub fn stop_named_timer(&mut self, name: &str) {
        self.engine.stop_named_timer(name)
    }

    /// True iff the rule pass currently running was triggered by a tick of
    /// the named timer.
    pub fn timer_firing(&self, name: &str) -> bool {
        self.engine.current_timer.as_deref() == Some(name)
    }

    // --- subprocesses ---

    pub fn spawn(
        &mut self,
        argv: Vec<String>,
        callback: Option<Callable>,
        options: SpawnOptions,
    ) -> Result<()> {
        self.engine.spawn_process(argv, callback, options)
    }

    /// `spawn("/bin/sh", ["-c", cmd], ...)` convenience.
    pub fn run_shell_command(
        &mut self,
        cmd: &str,
        callback: Option<Callable>,
        options: SpawnOptions,
    ) -> Result<()> {
        self.engine.run_shell_command(cmd, callback, options)
    }

    // --- scheduler ---

    /// Force a full scheduler pass.
    pub fn run_rules(&mut self) {
        self.engine.run_rules(None)
    }

    /// Force a scheduler pass as if the given cell had changed.
    pub fn run_rules_for(&mut self, device: &str, control: &str) {
        self.engine.run_rules(Some(CellSpec::new(device, control)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_device_def_deserializes_from_script_shape() {
        let def: VirtualDeviceDef = serde_json::from_str(
            r#"{
                "title": "Stabilization",
                "cells": {
                    "enabled": {"type": "switch", "value": false},
                    "lowThreshold": {"type": "range", "value": 20, "max": 40},
                    "state": {"type": "text", "value": "idle", "readonly": true}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(def.title.as_deref(), Some("Stabilization"));
        assert_eq!(def.cells.len(), 3);
        let low = &def.cells["lowThreshold"];
        assert_eq!(low.cell_type, CellType::Range);
        assert_eq!(low.max, Some(40.0));
        assert!(def.cells["state"].readonly);
        assert_eq!(def.cells["enabled"].value, CellValue::Bool(false));
    }
}
