// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Partial-save scheduling, flush idempotence, metascript teardown and
//! storage failure semantics.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use prov::machine::MemoryMachine;
use prov::value::{BodyFn, ParamSpec};
use prov::{
    run_script, ArgKind, CallArgs, Config, DefaultCollector, ExecutionError, Hooks, Metascript,
    ObjRef, UserError,
};
use prov_shared::records::ComponentAccess;
use prov_shared::{mode, TrialStatus};
use prov_integration_tests::{check_invariants, Harness};

#[test]
fn partial_saves_fire_during_a_slow_call() {
    let mut config = Config::new(1);
    config.set_save_frequency(100);
    let mut h = Harness::with_config(config);

    let main = h.component("script", "script", ComponentAccess::Read);
    let c_block = h.component("waiter", "function_def", ComponentAccess::Write);
    let c_sleepr = h.read("sleep");
    let c_callee = h.component("sleep", "func", ComponentAccess::Read);
    let c_call_inner = h.component("sleep(0.125)", "call", ComponentAccess::Read);
    let c_arg = h.component("0.125", "argument", ComponentAccess::Read);
    let c_d = h.lit("0.125");
    let c_fr = h.read("waiter");
    let c_callee_w = h.component("waiter", "func", ComponentAccess::Read);
    let c_call_w = h.component("waiter()", "call", ComponentAccess::Read);

    let sleep_obj = h.collector.global("sleep").unwrap();

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        // def waiter(): sleep(0.125); sleep(0.125)
        col.function_def(act)?;
        let sleep_for_body = sleep_obj.clone();
        let body: BodyFn = Rc::new(move |hooks, fact, _args| {
            for _ in 0..2 {
                hooks.func(fact)?;
                let s = hooks.name(
                    fact,
                    Some((c_sleepr, "sleep")),
                    sleep_for_body.clone(),
                    mode::DEPENDENCY,
                )?;
                hooks.func_after(fact, c_call_inner, c_callee, s, mode::DEPENDENCY)?;
                hooks.argument(fact)?;
                let d = hooks.literal(fact, c_d, ObjRef::float(0.125), mode::DEPENDENCY)?;
                hooks.argument_after(fact, c_arg, d.clone(), None, None, ArgKind::Argument)?;
                hooks.call_after(CallArgs::positional(vec![d]))?;
            }
            hooks.return_(fact)?;
            hooks.return_after(fact, ObjRef::none())
        });
        let f = col.function_def_after(act, c_block, "waiter", ParamSpec::default(), body)?;
        col.collect_function_def(act, "waiter")?;

        // waiter()
        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "waiter")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call_w, c_callee_w, f_ref, mode::DEPENDENCY)?;
        col.call_after(CallArgs::default())
    })
    .unwrap();
    assert!(outcome.finished());

    // 250ms of sleeping against a 100ms interval: at least two partial
    // flushes happened while the call was in flight.
    assert!(
        h.collector.partial_saves() >= 2,
        "expected at least 2 partial saves, got {}",
        h.collector.partial_saves()
    );

    // Re-flushing after completion drains nothing new.
    let before = h.meta.machine().total_rows();
    h.collector.store(true, TrialStatus::Running).unwrap();
    let after = h.meta.machine().total_rows();
    assert_eq!(before, after);

    let machine = h.finish();
    check_invariants(&machine);
    // Partial batches plus the final one all arrived in order: ids dense.
    let mut ids: Vec<i64> = machine.evaluations.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    ids.dedup();
    assert_eq!(ids.len(), machine.evaluations.len());
}

#[test]
fn hooks_are_transparent_after_metascript_teardown() {
    let meta = Rc::new(Metascript::new(Config::new(7), MemoryMachine::new()));
    let mut collector = DefaultCollector::new(&meta);
    let act = collector.root_activation();
    drop(meta);
    assert!(!collector.alive());

    let evaluations_before = collector.stores().evaluations.len();
    let value = ObjRef::int(3);
    let out = collector
        .literal(act, 0, value.clone(), mode::DEPENDENCY)
        .unwrap();
    assert!(out.is(&value), "hooks must hand the value back unchanged");
    let name_out = collector
        .name(act, Some((1, "x")), value.clone(), mode::DEPENDENCY)
        .unwrap();
    assert!(name_out.is(&value));
    collector.operation(act).unwrap();
    let op_out = collector
        .operation_after(act, 2, value.clone(), mode::DEPENDENCY)
        .unwrap();
    assert!(op_out.is(&value));
    assert_eq!(collector.stores().evaluations.len(), evaluations_before);

    // Storing is a no-op rather than a crash.
    collector.store(false, TrialStatus::Finished).unwrap();
}

#[test]
fn final_store_failure_is_fatal_when_no_guest_error_is_in_flight() {
    let machine = MemoryMachine {
        fail_persists: true,
        ..MemoryMachine::new()
    };
    let mut h = Harness::with_machine(Config::new(1), machine);
    let main = h.component("script", "script", ComponentAccess::Read);

    let err = run_script(&mut h.collector, "script", main, |_col, _act| {
        Ok(ObjRef::none())
    })
    .unwrap_err();
    assert!(matches!(err, ExecutionError::Fatal(_)));
}

#[test]
fn store_failure_does_not_mask_a_guest_exception() {
    let machine = MemoryMachine {
        fail_persists: true,
        ..MemoryMachine::new()
    };
    let mut h = Harness::with_machine(Config::new(1), machine);
    let main = h.component("script", "script", ComponentAccess::Read);

    let outcome = run_script(&mut h.collector, "script", main, |_col, _act| {
        Err(UserError::value_error("primary failure").into())
    })
    .unwrap();
    assert_eq!(outcome.status, TrialStatus::Unfinished);
    let err = outcome.result.unwrap_err();
    assert_eq!(err.raised().unwrap().message, "primary failure");
}

#[test]
fn partial_store_is_idempotent_without_new_records() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_lit = h.lit("1");

    let act = h.collector.start_script("script", main).unwrap();
    h.collector
        .literal(act, c_lit, ObjRef::int(1), mode::DEPENDENCY)
        .unwrap();

    h.collector.store(true, TrialStatus::Running).unwrap();
    let after_first = h.meta.machine().total_rows();
    assert!(after_first > 0);
    h.collector.store(true, TrialStatus::Running).unwrap();
    assert_eq!(h.meta.machine().total_rows(), after_first);
    // Partial stores never finalise the trial.
    assert!(h.meta.machine().trial_updates.is_empty());
}
