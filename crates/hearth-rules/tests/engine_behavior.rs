//! Behavioral coverage beyond the end-to-end scenarios: named timers,
//! on-change semantics, aliases, script failures, cron delegation and
//! engine shutdown.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fixture, publish, settle, wait_until, RecordingBus};
use hearth_core::CellValue;
use hearth_model::{CellModel, CellType};
use hearth_rules::{
    CellChangeEvent, ManualCron, ManualTimerFactory, RuleDef, RuleEngine, ScriptError,
    VirtualDeviceDef,
};
use parking_lot::Mutex;

#[tokio::test]
async fn named_ticker_firing_is_visible_to_conditions() {
    let f = fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let hits = fired.clone();
    f.handle
        .define_rule(
            "onHeating",
            RuleDef::new()
                .when(|ctx| Ok(ctx.timer_firing("heating")))
                .then(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    settle(&f.handle).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let ticker_id = f
        .handle
        .call_sync(|ctx| ctx.start_ticker("heating", 1000))
        .await
        .unwrap();

    f.timers.fire(ticker_id).await;
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

    // Outside a tick of this timer the flag reads false: a rule pass caused
    // by an ordinary cell change must not fire the rule.
    publish(&f.model, "Some/cell", "1");
    settle(&f.handle).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    f.timers.fire(ticker_id).await;
    wait_until(|| fired.load(Ordering::SeqCst) == 2).await;

    f.handle
        .call_sync(|ctx| ctx.stop_named_timer("heating"))
        .await
        .unwrap();
    f.timers.fire(ticker_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn restarting_a_named_timer_replaces_it() {
    let f = fixture();
    f.model.mark_ready();

    let first = f
        .handle
        .call_sync(|ctx| ctx.start_ticker("blink", 500))
        .await
        .unwrap();
    let second = f
        .handle
        .call_sync(|ctx| ctx.start_ticker("blink", 250))
        .await
        .unwrap();

    // The first slot was freed by the replacement and taken again.
    assert_eq!(first, second);
    let armed = f.timers.armed();
    assert_eq!(armed.len(), 2);
    assert_eq!(armed[1].1, Duration::from_millis(250));
}

#[tokio::test]
async fn on_change_rules_see_new_and_previous_values() {
    let f = fixture();
    let events: Arc<Mutex<Vec<CellChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    f.handle
        .define_rule(
            "watcher",
            RuleDef::new()
                .on_cell_change(["A/x", "A/y"])
                .then(move |_, args| {
                    let event = args
                        .cell_change()
                        .ok_or_else(|| ScriptError::failure("missing change event"))?;
                    log.lock().push(event.clone());
                    Ok(())
                }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    settle(&f.handle).await;
    assert!(events.lock().is_empty(), "forced passes never fire change rules");

    publish(&f.model, "A/x", "1");
    wait_until(|| events.lock().len() == 1).await;
    {
        let seen = events.lock();
        assert_eq!(seen[0].device, "A");
        assert_eq!(seen[0].control, "x");
        assert_eq!(seen[0].new_value, CellValue::Number(1.0));
        assert_eq!(seen[0].old_value, None);
    }

    // The previous value is latched per rule, not per cell: a change to the
    // other watched cell reports x's value as "old".
    publish(&f.model, "A/y", "5");
    wait_until(|| events.lock().len() == 2).await;
    assert_eq!(events.lock()[1].old_value, Some(CellValue::Number(1.0)));

    publish(&f.model, "A/x", "2");
    wait_until(|| events.lock().len() == 3).await;
    assert_eq!(events.lock()[2].old_value, Some(CellValue::Number(5.0)));

    // Unwatched cells never fire the rule.
    publish(&f.model, "B/z", "9");
    settle(&f.handle).await;
    assert_eq!(events.lock().len(), 3);
}

#[tokio::test]
async fn condition_failure_is_skipped_without_touching_edge_state() {
    let f = fixture();
    let fired = Arc::new(AtomicUsize::new(0));
    let broken = Arc::new(AtomicBool::new(false));
    let level = Arc::new(AtomicBool::new(true));

    let hits = fired.clone();
    let is_broken = broken.clone();
    let is_high = level.clone();
    f.handle
        .define_rule(
            "fragile",
            RuleDef::new()
                .as_soon_as(move |_| {
                    if is_broken.load(Ordering::SeqCst) {
                        return Err(ScriptError::failure("script blew up"));
                    }
                    Ok(is_high.load(Ordering::SeqCst))
                })
                .then(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

    // A failing condition is treated as false for the pass but must leave
    // prev_cond_value alone.
    broken.store(true, Ordering::SeqCst);
    f.handle.run_rules().await.unwrap();
    broken.store(false, Ordering::SeqCst);
    f.handle.run_rules().await.unwrap();
    settle(&f.handle).await;
    assert_eq!(
        fired.load(Ordering::SeqCst),
        1,
        "still-true condition after a failure is not a transition"
    );

    // A genuine false→true transition still fires.
    level.store(false, Ordering::SeqCst);
    f.handle.run_rules().await.unwrap();
    level.store(true, Ordering::SeqCst);
    f.handle.run_rules().await.unwrap();
    settle(&f.handle).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn undefining_rules_mid_pass_does_not_skip_later_rules() {
    let f = fixture();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // A removes itself from inside its own body while the pass is at its
    // index; B and C must still be checked in the same pass.
    let log = order.clone();
    f.handle
        .define_rule(
            "A",
            RuleDef::new().when(|_| Ok(true)).then(move |ctx, _| {
                log.lock().push("A");
                assert!(ctx.undefine_rule("A"));
                Ok(())
            }),
        )
        .await
        .unwrap();
    for name in ["B", "C"] {
        let log = order.clone();
        f.handle
            .define_rule(
                name,
                RuleDef::new().when(|_| Ok(true)).then(move |_, _| {
                    log.lock().push(name);
                    Ok(())
                }),
            )
            .await
            .unwrap();
    }

    f.model.mark_ready();
    wait_until(|| *order.lock() == vec!["A", "B", "C"]).await;

    // The destroyed rule is gone from the registry view and stays silent on
    // later passes.
    order.lock().clear();
    f.handle.run_rules().await.unwrap();
    settle(&f.handle).await;
    assert_eq!(*order.lock(), vec!["B", "C"]);
    let names = f.handle.call_sync(|ctx| ctx.rule_names()).await.unwrap();
    assert_eq!(names, vec!["B".to_string(), "C".to_string()]);
    assert!(!f
        .handle
        .call_sync(|ctx| ctx.undefine_rule("A"))
        .await
        .unwrap());

    // Undefining an already checked, earlier rule from a later rule's body
    // must not shift the pass off the rules that follow it.
    let log = order.clone();
    f.handle
        .define_rule(
            "D",
            RuleDef::new().when(|_| Ok(true)).then(move |_, _| {
                log.lock().push("D");
                Ok(())
            }),
        )
        .await
        .unwrap();
    let log = order.clone();
    f.handle
        .define_rule(
            "C",
            RuleDef::new().when(|_| Ok(true)).then(move |ctx, _| {
                log.lock().push("C(kill B)");
                ctx.undefine_rule("B");
                Ok(())
            }),
        )
        .await
        .unwrap();

    order.lock().clear();
    f.handle.run_rules().await.unwrap();
    settle(&f.handle).await;
    assert_eq!(*order.lock(), vec!["B", "C(kill B)", "D"]);

    order.lock().clear();
    f.handle.run_rules().await.unwrap();
    settle(&f.handle).await;
    assert_eq!(*order.lock(), vec!["C(kill B)", "D"]);
}

#[tokio::test]
async fn body_failure_does_not_stop_the_pass() {
    let f = fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    f.handle
        .define_rule(
            "exploding",
            RuleDef::new()
                .when(|_| Ok(true))
                .then(|_, _| Err(ScriptError::failure("body failed"))),
        )
        .await
        .unwrap();

    let hits = fired.clone();
    f.handle
        .define_rule(
            "after",
            RuleDef::new().when(|_| Ok(true)).then(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn bodies_read_incomplete_cells_as_defaults() {
    let f = fixture();
    let observed: Arc<Mutex<Option<CellValue>>> = Arc::new(Mutex::new(None));

    let slot = observed.clone();
    f.handle
        .define_rule(
            "reader",
            RuleDef::new()
                .on_cell_change(["A/x"])
                .then(move |ctx, _| {
                    // B/y has never received a value; inside a body this
                    // reads the default instead of raising.
                    *slot.lock() = Some(ctx.cell_value("B", "y")?);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    publish(&f.model, "A/x", "1");
    wait_until(|| observed.lock().is_some()).await;
    assert_eq!(observed.lock().clone(), Some(CellValue::Text(String::new())));
}

#[tokio::test]
async fn aliases_resolve_lazily_and_track_dependencies() {
    let f = fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    // Declared before the cell exists anywhere.
    f.handle.define_alias("outdoor", "Weather/Temp1").await.unwrap();

    let hits = fired.clone();
    f.handle
        .define_rule(
            "frost",
            RuleDef::new()
                .when(|ctx| Ok(ctx.alias_value("outdoor")?.as_f64().unwrap_or(f64::MAX) < 0.0))
                .then(move |_, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .await
        .unwrap();

    f.model.mark_ready();
    settle(&f.handle).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    publish(&f.model, "Weather/Temp1", "-4");
    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;

    let unknown = f
        .handle
        .call_sync(|ctx| ctx.alias_value("nothing"))
        .await
        .unwrap();
    assert!(unknown.is_err());
}

#[tokio::test]
async fn virtual_devices_are_mirrored_to_the_bus() {
    let f = fixture();
    f.handle
        .define_virtual_device(
            "stabSettings",
            VirtualDeviceDef::new().cell("enabled", CellType::Switch, false),
        )
        .await
        .unwrap();

    let payloads = f
        .bus
        .payloads_for("/devices/stabSettings/controls/enabled");
    assert_eq!(payloads, vec!["0".to_string()]);

    // Engine writes to external cells go out on the command topic.
    publish(&f.model, "Relays/Relay1", "0");
    f.handle
        .call_sync(|ctx| ctx.set_cell_value("Relays", "Relay1", true))
        .await
        .unwrap()
        .unwrap();
    let payloads = f.bus.payloads_for("/devices/Relays/controls/Relay1/on");
    assert_eq!(payloads, vec!["1".to_string()]);
}

#[tokio::test]
async fn raw_publish_validates_qos() {
    let f = fixture();
    f.handle
        .call_sync(|ctx| ctx.publish("/hearth/ping", "1", 2, true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.bus.messages(), vec![("/hearth/ping".to_string(), "1".to_string(), 2, true)]);

    let err = f
        .handle
        .call_sync(|ctx| ctx.publish("/hearth/ping", "1", 3, false))
        .await
        .unwrap();
    assert!(err.is_err());
}

#[tokio::test]
async fn cron_rules_delegate_to_the_scheduler() {
    let model = CellModel::new();
    let bus = Arc::new(RecordingBus::default());
    let timers = Arc::new(ManualTimerFactory::new());
    let cron = Arc::new(ManualCron::new());
    let handle = RuleEngine::new(model.clone(), bus)
        .with_timer_factory(timers)
        .with_cron(cron.clone())
        .start();

    let evals = Arc::new(AtomicUsize::new(0));
    let count = evals.clone();
    handle
        .define_rule(
            "nightly",
            RuleDef::new()
                .when(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                })
                .then(|_, _| Ok(()))
                .cron("0 0 * * *"),
        )
        .await
        .unwrap();

    model.mark_ready();
    settle(&handle).await;
    let base = evals.load(Ordering::SeqCst);

    let jobs = cron.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1, "0 0 * * *");

    // A cron tick forces a check of exactly this rule.
    cron.fire(jobs[0].0);
    wait_until(|| evals.load(Ordering::SeqCst) == base + 1).await;

    // Redefining the rule without a schedule cancels the job.
    handle
        .define_rule(
            "nightly",
            RuleDef::new().when(|_| Ok(false)).then(|_, _| Ok(())),
        )
        .await
        .unwrap();
    settle(&handle).await;
    assert!(cron.jobs().is_empty());
}

#[tokio::test]
async fn cron_without_a_scheduler_rejects_the_rule() {
    let f = fixture();
    let result = f
        .handle
        .define_rule(
            "nightly",
            RuleDef::new()
                .when(|_| Ok(true))
                .then(|_, _| Ok(()))
                .cron("@hourly"),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_definitions_preserve_the_prior_rule() {
    let f = fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let hits = fired.clone();
    f.handle
        .define_rule(
            "guard",
            RuleDef::new().when(|_| Ok(true)).then(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

    let invalid = f
        .handle
        .define_rule(
            "guard",
            RuleDef::new()
                .when(|_| Ok(true))
                .as_soon_as(|_| Ok(true))
                .then(|_, _| Ok(())),
        )
        .await;
    assert!(invalid.is_err());

    f.model.mark_ready();
    wait_until(|| fired.load(Ordering::SeqCst) >= 1).await;

    let names = f.handle.call_sync(|ctx| ctx.rule_names()).await.unwrap();
    assert_eq!(names, vec!["guard".to_string()]);
}

#[tokio::test]
async fn stop_halts_the_engine_and_timers() {
    let f = fixture();
    f.model.mark_ready();

    let id = f
        .handle
        .call_sync(|ctx| ctx.start_ticker("blink", 100))
        .await
        .unwrap();

    f.handle.stop().await.unwrap();

    assert!(f.handle.run_rules().await.is_err());

    // The tick-forwarding task shuts down asynchronously; once it is gone
    // the factory can no longer deliver ticks.
    let mut released = false;
    for _ in 0..100 {
        if !f.timers.fire(id).await {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released, "stopped engine must have released its timers");
}
