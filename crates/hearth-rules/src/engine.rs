//! The rule evaluation engine.
//!
//! A single tokio task owns all engine state. Everything that mutates it —
//! rule definition, cell-change scheduling, timer ticks, process completions
//! — arrives either on the cell-change channel or as an injected closure on
//! the task channel, and runs to completion on that task. Background workers
//! exist only to wait: on platform timers and on subprocess exits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hearth_core::{Error, Result};
use hearth_model::{BusPublisher, CellModel, CellSpec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bridge::ScriptCtx;
use crate::callbacks::{CallbackId, CallbackSpace};
use crate::cron::{CronScheduler, NoCron};
use crate::rule::{Rule, RuleDef, RuleType, TriggerKind};
use crate::script::{Callable, CallbackArgs, CellChangeEvent, ScriptError};
use crate::timers::{TimerEntry, TimerFactory, TimerId, TokioTimerFactory};

pub(crate) type EngineTask = Box<dyn FnOnce(&mut EngineInner) + Send>;

/// Builder for a rule engine. `start` moves the state into the engine task
/// and returns the handle everything else talks through.
pub struct RuleEngine {
    model: CellModel,
    bus: Arc<dyn BusPublisher>,
    timer_factory: Arc<dyn TimerFactory>,
    cron: Arc<dyn CronScheduler>,
}

impl RuleEngine {
    pub fn new(model: CellModel, bus: Arc<dyn BusPublisher>) -> Self {
        Self {
            model,
            bus,
            timer_factory: Arc::new(TokioTimerFactory),
            cron: Arc::new(NoCron),
        }
    }

    /// Replace the wall-clock timer factory, e.g. with a deterministic one
    /// in tests.
    pub fn with_timer_factory(mut self, factory: Arc<dyn TimerFactory>) -> Self {
        self.timer_factory = factory;
        self
    }

    pub fn with_cron(mut self, cron: Arc<dyn CronScheduler>) -> Self {
        self.cron = cron;
        self
    }

    /// Spawn the engine loop. Injected calls are served immediately, so
    /// rules can be defined right away; the change channel is consumed only
    /// after the model signals ready and the initial rule pass has run.
    pub fn start(self) -> EngineHandle {
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<EngineTask>();
        let handle = EngineHandle { tasks: task_tx };

        let mut changes = self.model.acquire_cell_change_channel();
        let model = self.model.clone();
        let mut inner = EngineInner::new(
            self.model,
            self.bus,
            self.timer_factory,
            self.cron,
            handle.clone(),
        );

        tokio::spawn(async move {
            let ready = {
                let model = model.clone();
                async move { model.when_ready().await }
            };
            tokio::pin!(ready);

            let mut tasks_open = true;
            loop {
                tokio::select! {
                    _ = &mut ready => break,
                    maybe = task_rx.recv(), if tasks_open => match maybe {
                        Some(task) => {
                            task(&mut inner);
                            if inner.stopping {
                                inner.shutdown();
                                return;
                            }
                        }
                        None => tasks_open = false,
                    },
                }
            }

            info!("model ready, running initial rule pass");
            inner.run_rules(None);

            loop {
                tokio::select! {
                    maybe = changes.recv() => match maybe {
                        Some(spec) => {
                            debug!(cell = %spec, "running rules after cell change");
                            inner.run_rules(Some(spec));
                        }
                        None => break,
                    },
                    maybe = task_rx.recv(), if tasks_open => match maybe {
                        Some(task) => {
                            task(&mut inner);
                            if inner.stopping {
                                break;
                            }
                        }
                        None => tasks_open = false,
                    },
                }
            }

            inner.shutdown();
            // `changes` drops here, releasing the change channel.
        });

        handle
    }
}

/// Clonable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tasks: mpsc::UnboundedSender<EngineTask>,
}

impl EngineHandle {
    /// Fire-and-forget injection of a closure into the engine loop. Used by
    /// background workers (timers, processes, cron).
    pub(crate) fn inject(&self, f: impl FnOnce(&mut EngineInner) + Send + 'static) {
        let _ = self.tasks.send(Box::new(f));
    }

    /// The call-into-loop primitive: run a closure on the engine task and
    /// return its result. Fails only if the engine has stopped.
    pub async fn call_sync<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ScriptCtx<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inject(move |engine| {
            let result = f(&mut ScriptCtx::new(engine));
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| Error::Engine("engine has stopped".into()))
    }

    pub async fn define_rule(&self, name: impl Into<String>, def: RuleDef) -> Result<()> {
        let name = name.into();
        self.call_sync(move |ctx| ctx.define_rule(&name, def)).await?
    }

    pub async fn define_virtual_device(
        &self,
        name: impl Into<String>,
        def: crate::bridge::VirtualDeviceDef,
    ) -> Result<()> {
        let name = name.into();
        self.call_sync(move |ctx| ctx.define_virtual_device(&name, def))
            .await?
    }

    pub async fn define_alias(
        &self,
        alias: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<()> {
        let alias = alias.into();
        let target = target.into();
        self.call_sync(move |ctx| ctx.define_alias(&alias, &target))
            .await?
    }

    /// Force a full scheduler pass.
    pub async fn run_rules(&self) -> Result<()> {
        self.call_sync(|ctx| ctx.run_rules()).await
    }

    /// Force a scheduler pass as if the given cell had changed.
    pub async fn run_rules_for(
        &self,
        device: impl Into<String>,
        control: impl Into<String>,
    ) -> Result<()> {
        let device = device.into();
        let control = control.into();
        self.call_sync(move |ctx| ctx.run_rules_for(&device, &control))
            .await
    }

    /// Stop the engine: drains and stops all timers, cancels cron jobs and
    /// releases the change channel.
    pub async fn stop(&self) -> Result<()> {
        self.call_sync(|ctx| ctx.engine.stopping = true).await
    }
}

/// All engine-thread-only state.
pub(crate) struct EngineInner {
    pub(crate) model: CellModel,
    pub(crate) bus: Arc<dyn BusPublisher>,
    pub(crate) handle: EngineHandle,
    pub(crate) timer_factory: Arc<dyn TimerFactory>,
    pub(crate) cron: Arc<dyn CronScheduler>,

    rules: HashMap<String, Rule>,
    rule_order: Vec<String>,
    rule_serial: u64,
    /// Depth of nested `run_rules` passes. Destroyed-rule slots are pruned
    /// only between top-level passes, so an in-flight pass never sees
    /// `rule_order` shrink under its index.
    pass_depth: u32,

    /// Cell → rules whose last condition evaluation read it.
    cell_to_rules: HashMap<CellSpec, Vec<String>>,
    /// Rules whose last condition evaluation read no cells; affected by any
    /// change.
    rules_without_cells: HashSet<String>,
    /// Armed while a condition runs: cells read during evaluation.
    noted_cells: Option<HashSet<CellSpec>>,
    /// While > 0, reading an incomplete cell raises the incomplete sentinel.
    pub(crate) require_complete: u32,

    pub(crate) rule_funcs: CallbackSpace,
    pub(crate) process_callbacks: CallbackSpace,
    pub(crate) timer_callbacks: HashMap<TimerId, Callable>,
    pub(crate) timers: Vec<Option<TimerEntry>>,
    pub(crate) named_timers: HashMap<String, TimerId>,
    /// Name of the named timer whose tick is currently being processed.
    pub(crate) current_timer: Option<String>,

    pub(crate) aliases: HashMap<String, CellSpec>,
    pub(crate) stopping: bool,
}

impl EngineInner {
    fn new(
        model: CellModel,
        bus: Arc<dyn BusPublisher>,
        timer_factory: Arc<dyn TimerFactory>,
        cron: Arc<dyn CronScheduler>,
        handle: EngineHandle,
    ) -> Self {
        Self {
            model,
            bus,
            handle,
            timer_factory,
            cron,
            rules: HashMap::new(),
            rule_order: Vec::new(),
            rule_serial: 0,
            pass_depth: 0,
            cell_to_rules: HashMap::new(),
            rules_without_cells: HashSet::new(),
            noted_cells: None,
            require_complete: 0,
            rule_funcs: CallbackSpace::new("ruleFuncs"),
            process_callbacks: CallbackSpace::new("processes"),
            timer_callbacks: HashMap::new(),
            timers: Vec::new(),
            named_timers: HashMap::new(),
            current_timer: None,
            aliases: HashMap::new(),
            stopping: false,
        }
    }

    /// One scheduler pass. With a changed cell, only rules depending on it
    /// (plus rules reading no cells) are marked for checking, and only if
    /// the cell is complete; without one, every rule evaluates its
    /// condition.
    pub(crate) fn run_rules(&mut self, changed: Option<CellSpec>) {
        if self.pass_depth == 0 {
            self.prune_destroyed_rules();
        }
        if let Some(spec) = &changed {
            self.model.ensure_cell(spec);
            if self.model.is_complete(spec) {
                let mut marked: Vec<String> =
                    self.cell_to_rules.get(spec).cloned().unwrap_or_default();
                marked.extend(self.rules_without_cells.iter().cloned());
                for name in marked {
                    if let Some(rule) = self.rules.get_mut(&name) {
                        rule.should_check = true;
                    }
                }
            }
        }

        // Index loop: a rule body may define new rules mid-pass; they are
        // appended and picked up by the same pass. `rule_order` never
        // shrinks during a pass (destruction leaves a tombstone), so the
        // index never skips a live rule.
        self.pass_depth += 1;
        let mut i = 0;
        while i < self.rule_order.len() {
            let name = self.rule_order[i].clone();
            self.check_rule(&name, changed.as_ref());
            i += 1;
        }
        self.pass_depth -= 1;
    }

    /// Drop the slots of rules destroyed without replacement. Runs between
    /// top-level passes only.
    fn prune_destroyed_rules(&mut self) {
        let dead: Vec<String> = self
            .rules
            .iter()
            .filter(|(_, rule)| rule.rule_type == RuleType::Destroyed)
            .map(|(name, _)| name.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        for name in &dead {
            self.rules.remove(name);
        }
        self.rule_order.retain(|name| self.rules.contains_key(name));
        debug!(count = dead.len(), "pruned destroyed rules");
    }

    /// Evaluate one rule against an optional changed cell.
    pub(crate) fn check_rule(&mut self, name: &str, changed: Option<&CellSpec>) {
        let (serial, rule_type, cond, then, should_check) = match self.rules.get(name) {
            Some(rule) => (
                rule.serial,
                rule.rule_type,
                rule.cond,
                rule.then,
                rule.should_check,
            ),
            None => return,
        };
        if rule_type == RuleType::Destroyed {
            // Tombstone of a rule destroyed mid-pass; its slot is pruned
            // before the next top-level pass.
            debug!(rule = name, "skipping destroyed rule");
            return;
        }
        // Skip the script entirely when none of the condition's cells
        // changed; a pass without a changed cell always evaluates.
        if changed.is_some() && !should_check {
            return;
        }

        let mut fire: Option<CallbackArgs> = None;
        match rule_type {
            RuleType::Level => {
                if let Some(current) = self.invoke_cond(name, cond) {
                    if current {
                        fire = Some(CallbackArgs::None);
                    }
                }
            }
            RuleType::Edge => {
                if let Some(current) = self.invoke_cond(name, cond) {
                    if let Some(rule) = self.rule_instance_mut(name, serial) {
                        if current && (rule.first_run || current != rule.prev_cond_value) {
                            fire = Some(CallbackArgs::None);
                        }
                        rule.prev_cond_value = current;
                    }
                }
            }
            RuleType::OnCellChange => {
                if let Some(cell) = changed {
                    if self.model.is_complete(cell) {
                        let new_value = self.model.value(cell).unwrap_or_default();
                        if let Some(rule) = self.rule_instance_mut(name, serial) {
                            if rule.watch_cells.contains(cell) {
                                let old_value = rule.old_cell_value.replace(new_value.clone());
                                fire = Some(CallbackArgs::CellChange(CellChangeEvent {
                                    device: cell.device.clone(),
                                    control: cell.control.clone(),
                                    new_value,
                                    old_value,
                                }));
                            }
                        }
                    }
                }
            }
            RuleType::Destroyed => unreachable!(),
        }

        if let Some(rule) = self.rule_instance_mut(name, serial) {
            rule.first_run = false;
            rule.should_check = false;
        }

        if let Some(args) = fire {
            debug!(rule = name, "firing rule");
            self.invoke_rule_body(name, then, args);
        }
    }

    /// Run a condition with the dependency tracker armed and incomplete-cell
    /// protection on. Returns the boolean outcome, or `None` when the script
    /// failed (distinct from an incomplete-cell skip: a failure must not
    /// update edge state).
    fn invoke_cond(&mut self, name: &str, cond: Option<CallbackId>) -> Option<bool> {
        let Some(id) = cond else {
            return Some(false);
        };
        let Some(condition) = self.rule_funcs.get(id) else {
            warn!(rule = name, callback = %id, "condition callback vanished");
            return None;
        };

        self.noted_cells = Some(HashSet::new());
        self.require_complete += 1;
        let result = condition(&mut ScriptCtx::new(self), &CallbackArgs::None);
        self.require_complete -= 1;
        self.store_tracked_cells(name);

        match result {
            Ok(value) => Some(value.is_truthy()),
            Err(ScriptError::IncompleteCell(spec)) => {
                debug!(rule = name, cell = %spec, "condition skipped, cell not complete");
                Some(false)
            }
            Err(ScriptError::Failure(msg)) => {
                error!(rule = name, error = %msg, "rule condition failed");
                None
            }
        }
    }

    fn invoke_rule_body(&mut self, name: &str, then: CallbackId, args: CallbackArgs) {
        let Some(body) = self.rule_funcs.get(then) else {
            warn!(rule = name, callback = %then, "rule body callback vanished");
            return;
        };
        if let Err(err) = body(&mut ScriptCtx::new(self), &args) {
            error!(rule = name, error = %err, "rule body failed");
        }
    }

    /// The rule under `name`, only if it is still the same instance.
    fn rule_instance_mut(&mut self, name: &str, serial: u64) -> Option<&mut Rule> {
        self.rules.get_mut(name).filter(|rule| rule.serial == serial)
    }

    /// Record a cell read while a condition is being evaluated.
    pub(crate) fn track_cell(&mut self, spec: &CellSpec) {
        if let Some(noted) = &mut self.noted_cells {
            noted.insert(spec.clone());
        }
    }

    fn store_tracked_cells(&mut self, name: &str) {
        match self.noted_cells.take() {
            Some(noted) if !noted.is_empty() => {
                for spec in noted {
                    self.store_rule_cell(&spec, name);
                }
            }
            Some(_) => {
                debug!(rule = name, "rule reads no cells");
                self.rules_without_cells.insert(name.to_string());
            }
            None => {}
        }
    }

    fn store_rule_cell(&mut self, spec: &CellSpec, name: &str) {
        self.cell_to_rules
            .entry(spec.clone())
            .or_default()
            .push(name.to_string());
    }

    pub(crate) fn define_rule(&mut self, name: &str, def: RuleDef) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Rule("rule name must not be empty".into()));
        }
        let trigger = def.trigger()?;
        let (Some(then_fn), cond_fn) = (
            def.then.clone(),
            def.when.clone().or_else(|| def.as_soon_as.clone()),
        ) else {
            return Err(Error::Rule("no 'then'".into()));
        };
        let cron_job = match &def.cron {
            Some(spec) => Some(self.schedule_cron(name, spec)?),
            None => None,
        };

        // Validation is done; from here on the old rule (if any) goes away.
        if self.rules.contains_key(name) {
            self.destroy_rule(name);
        } else {
            self.rule_order.push(name.to_string());
        }

        self.rule_serial += 1;
        let serial = self.rule_serial;
        let then = self.rule_funcs.store(then_fn);
        let (rule_type, cond, watch_cells) = match trigger {
            TriggerKind::Level => (
                RuleType::Level,
                cond_fn.map(|f| self.rule_funcs.store(f)),
                Vec::new(),
            ),
            TriggerKind::Edge => (
                RuleType::Edge,
                cond_fn.map(|f| self.rule_funcs.store(f)),
                Vec::new(),
            ),
            TriggerKind::OnChange(cells) => {
                for spec in &cells {
                    self.model.ensure_cell(spec);
                    self.store_rule_cell(spec, name);
                }
                (RuleType::OnCellChange, None, cells)
            }
        };

        self.rules.insert(
            name.to_string(),
            Rule {
                name: name.to_string(),
                serial,
                rule_type,
                cond,
                then,
                watch_cells,
                cron_job,
                first_run: true,
                prev_cond_value: false,
                old_cell_value: None,
                should_check: false,
            },
        );
        debug!(rule = name, "rule defined");
        Ok(())
    }

    /// Release a rule's callback handles and its dependency-index entries,
    /// and mark it destroyed. The registry slot survives so a redefinition
    /// keeps its position.
    pub(crate) fn destroy_rule(&mut self, name: &str) {
        let Some(rule) = self.rules.get_mut(name) else {
            return;
        };
        debug!(rule = %rule.name, "destroying rule");
        let cond = rule.cond.take();
        let then = rule.then;
        let cron_job = rule.cron_job.take();
        rule.rule_type = RuleType::Destroyed;

        if let Some(id) = cond {
            self.rule_funcs.remove(id);
        }
        self.rule_funcs.remove(then);
        if let Some(job) = cron_job {
            self.cron.cancel(job);
        }
        for rules in self.cell_to_rules.values_mut() {
            rules.retain(|n| n != name);
        }
        self.cell_to_rules.retain(|_, rules| !rules.is_empty());
        self.rules_without_cells.remove(name);
    }

    /// Destroy a rule without replacement. The registry keeps a tombstone
    /// so a pass that is currently iterating never sees the order list
    /// shrink; the slot is reclaimed before the next top-level pass.
    pub(crate) fn undefine_rule(&mut self, name: &str) -> bool {
        match self.rules.get(name) {
            Some(rule) if rule.rule_type != RuleType::Destroyed => {
                self.destroy_rule(name);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn rule_names(&self) -> Vec<String> {
        self.rule_order
            .iter()
            .filter(|name| {
                matches!(self.rules.get(*name), Some(rule) if rule.rule_type != RuleType::Destroyed)
            })
            .cloned()
            .collect()
    }

    fn schedule_cron(&mut self, rule: &str, spec: &str) -> Result<crate::cron::CronJobId> {
        let handle = self.handle.clone();
        let rule_name = rule.to_string();
        self.cron.schedule(
            spec,
            Box::new(move || {
                let rule_name = rule_name.clone();
                handle.inject(move |engine| {
                    debug!(rule = %rule_name, "cron tick");
                    engine.check_rule(&rule_name, None);
                });
            }),
        )
    }

    fn shutdown(&mut self) {
        // Dropping the stop senders cancels every tick-forwarding task and,
        // through them, the platform timers.
        self.timers.clear();
        self.timer_callbacks.clear();
        self.named_timers.clear();
        let jobs: Vec<_> = self.rules.values().filter_map(|r| r.cron_job).collect();
        for job in jobs {
            self.cron.cancel(job);
        }
        info!("rule engine stopped");
    }
}
