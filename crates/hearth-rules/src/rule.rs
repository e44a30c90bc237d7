//! Rule records and definitions.

use std::sync::Arc;

use hearth_core::{Error, Result, ScriptValue};
use hearth_model::CellSpec;

use crate::bridge::ScriptCtx;
use crate::callbacks::CallbackId;
use crate::cron::CronJobId;
use crate::script::{Callable, CallbackArgs, ScriptResult};

/// Trigger semantics of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Fires whenever the condition evaluates true.
    Level,
    /// Fires on false→true transitions (and on a first-run true).
    Edge,
    /// Fires when one of the explicitly watched cells changes.
    OnCellChange,
    /// Replaced or unloaded; never invoked.
    Destroyed,
}

/// A registered rule. All latched evaluation state lives here.
pub(crate) struct Rule {
    pub name: String,
    /// Instance marker: a redefinition under the same name gets a new
    /// serial, so an in-flight `Check` never writes through to a
    /// replacement rule.
    pub serial: u64,
    pub rule_type: RuleType,
    pub cond: Option<CallbackId>,
    pub then: CallbackId,
    pub watch_cells: Vec<CellSpec>,
    pub cron_job: Option<CronJobId>,
    pub first_run: bool,
    pub prev_cond_value: bool,
    pub old_cell_value: Option<hearth_core::CellValue>,
    pub should_check: bool,
}

/// What `defineRule` received, before validation.
///
/// Exactly one of `when` / `as_soon_as` / `on_cell_change` must be present,
/// plus a mandatory `then`:
///
/// ```ignore
/// RuleDef::new()
///     .as_soon_as(|ctx| Ok(ctx.cell_value("Weather", "Temp1")?.as_f64() < Some(20.0)))
///     .then(|ctx, _| ctx.set_cell_value("Relays", "Relay1", true).map_err(Into::into))
/// ```
#[derive(Default)]
pub struct RuleDef {
    pub(crate) when: Option<Callable>,
    pub(crate) as_soon_as: Option<Callable>,
    pub(crate) on_cell_change: Option<Vec<String>>,
    pub(crate) then: Option<Callable>,
    pub(crate) cron: Option<String>,
}

pub(crate) enum TriggerKind {
    Level,
    Edge,
    OnChange(Vec<CellSpec>),
}

impl RuleDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level trigger: fire whenever the condition is true.
    pub fn when<F>(mut self, cond: F) -> Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> ScriptResult<bool> + Send + Sync + 'static,
    {
        self.when = Some(wrap_condition(cond));
        self
    }

    /// Edge trigger: fire on false→true transitions.
    pub fn as_soon_as<F>(mut self, cond: F) -> Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> ScriptResult<bool> + Send + Sync + 'static,
    {
        self.as_soon_as = Some(wrap_condition(cond));
        self
    }

    /// Change trigger: fire when one of the referenced cells
    /// (`"Device/Control"`) changes and is complete.
    pub fn on_cell_change<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on_cell_change = Some(cells.into_iter().map(Into::into).collect());
        self
    }

    /// The rule body. Mandatory.
    pub fn then<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut ScriptCtx<'_>, &CallbackArgs) -> ScriptResult<()> + Send + Sync + 'static,
    {
        self.then = Some(Arc::new(move |ctx, args| {
            body(ctx, args)?;
            Ok(ScriptValue::Undefined)
        }));
        self
    }

    /// Additionally evaluate the rule on a cron schedule. The spec string is
    /// opaque to the engine and handed to the configured cron scheduler.
    pub fn cron(mut self, spec: impl Into<String>) -> Self {
        self.cron = Some(spec.into());
        self
    }

    /// Validate the trigger combination and resolve cell references.
    pub(crate) fn trigger(&self) -> Result<TriggerKind> {
        if self.then.is_none() {
            return Err(Error::Rule("no 'then'".into()));
        }
        match (&self.when, &self.as_soon_as, &self.on_cell_change) {
            (Some(_), None, None) => Ok(TriggerKind::Level),
            (None, Some(_), None) => Ok(TriggerKind::Edge),
            (None, None, Some(cells)) => {
                if cells.is_empty() {
                    return Err(Error::Rule("empty 'onCellChange'".into()));
                }
                let specs = cells
                    .iter()
                    .map(|s| s.parse::<CellSpec>())
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| Error::Rule(e.to_string()))?;
                Ok(TriggerKind::OnChange(specs))
            }
            (None, None, None) => Err(Error::Rule(
                "must provide one of 'when', 'asSoonAs' or 'onCellChange'".into(),
            )),
            _ => Err(Error::Rule(
                "cannot combine 'when', 'asSoonAs' and 'onCellChange'".into(),
            )),
        }
    }
}

fn wrap_condition<F>(cond: F) -> Callable
where
    F: Fn(&mut ScriptCtx<'_>) -> ScriptResult<bool> + Send + Sync + 'static,
{
    Arc::new(move |ctx, _| cond(ctx).map(ScriptValue::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> RuleDef {
        RuleDef::new().then(|_, _| Ok(()))
    }

    #[test]
    fn requires_then() {
        let def = RuleDef::new().when(|_| Ok(true));
        assert!(def.trigger().is_err());
    }

    #[test]
    fn requires_exactly_one_trigger() {
        assert!(noop_body().trigger().is_err());
        assert!(noop_body().when(|_| Ok(true)).trigger().is_ok());
        assert!(noop_body()
            .when(|_| Ok(true))
            .on_cell_change(["a/b"])
            .trigger()
            .is_err());
        assert!(noop_body()
            .when(|_| Ok(true))
            .as_soon_as(|_| Ok(true))
            .trigger()
            .is_err());
    }

    #[test]
    fn on_cell_change_validates_references() {
        assert!(noop_body()
            .on_cell_change(Vec::<String>::new())
            .trigger()
            .is_err());
        assert!(noop_body().on_cell_change(["no-slash"]).trigger().is_err());
        assert!(noop_body().on_cell_change(["dev/"]).trigger().is_err());

        match noop_body()
            .on_cell_change(["Weather/Temp1", "Weather/Temp2"])
            .trigger()
            .unwrap()
        {
            TriggerKind::OnChange(cells) => {
                assert_eq!(cells.len(), 2);
                assert_eq!(cells[0], CellSpec::new("Weather", "Temp1"));
            }
            _ => panic!("expected OnChange trigger"),
        }
    }
}
