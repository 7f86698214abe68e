// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Function definition, parameter matching, closures and exception capture.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use prov::machine::MemoryMachine;
use prov::value::{BodyFn, ParamDecl, ParamSpec};
use prov::{
    run_script, ArgKind, AssignTarget, CallArgs, Hooks, ObjRef, UserError,
};
use prov_shared::records::ComponentAccess;
use prov_shared::{mode, TrialStatus};
use prov_integration_tests::{check_invariants, Harness};

fn eval_at(machine: &MemoryMachine, component: i64) -> i64 {
    machine
        .evaluations
        .iter()
        .find(|e| e.code_component_id == component)
        .map(|e| e.id)
        .unwrap_or_else(|| panic!("no evaluation at component {component}"))
}

fn edge_modes(machine: &MemoryMachine, dependent: i64, dependency: i64) -> Vec<String> {
    machine
        .dependencies
        .iter()
        .filter(|d| d.dependent_id == dependent && d.dependency_id == dependency)
        .map(|d| d.mode.to_string())
        .collect()
}

#[test]
fn identity_function_binds_and_returns_its_argument() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_block = h.component("f", "function_def", ComponentAccess::Write);
    let c_param = h.component("x", "param", ComponentAccess::Write);
    let c_xr = h.read("x");
    let c_fr = h.read("f");
    let c_callee = h.component("f", "func", ComponentAccess::Read);
    let c_call = h.component("f(5)", "call", ComponentAccess::Read);
    let c_arg = h.component("5", "argument", ComponentAccess::Read);
    let c_5 = h.lit("5");

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        // def f(x): return x
        col.function_def(act)?;
        let body: BodyFn = Rc::new(move |hooks, fact, args| {
            hooks.return_(fact)?;
            let x = hooks.name(
                fact,
                Some((c_xr, "x")),
                args.positional[0].clone(),
                mode::DEPENDENCY,
            )?;
            hooks.return_after(fact, x)
        });
        let params = ParamSpec {
            args: vec![ParamDecl::new("x", c_param)],
            ..Default::default()
        };
        let f = col.function_def_after(act, c_block, "f", params, body)?;
        col.collect_function_def(act, "f")?;

        // f(5)
        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "f")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call, c_callee, f_ref, mode::DEPENDENCY)?;
        col.argument(act)?;
        let five = col.literal(act, c_5, ObjRef::int(5), mode::DEPENDENCY)?;
        col.argument_after(act, c_arg, five.clone(), None, None, ArgKind::Argument)?;
        let result = col.call_after(CallArgs::positional(vec![five]))?;
        assert_eq!(result.as_int(), Some(5));
        Ok(result)
    })
    .unwrap();
    assert!(outcome.finished());

    let machine = h.finish();
    check_invariants(&machine);

    // The definition is an evaluation in the enclosing scope...
    let e_def = eval_at(&machine, c_block);
    // ...and the read of `f` links back to it by assignment.
    let e_fr = eval_at(&machine, c_fr);
    assert_eq!(edge_modes(&machine, e_fr, e_def), vec!["assignment"]);

    // Parameter x bound from the literal argument; identity makes it a bind.
    let e_param = eval_at(&machine, c_param);
    let e_5 = eval_at(&machine, c_5);
    assert_eq!(edge_modes(&machine, e_param, e_5), vec!["argument-bind"]);

    // The body's read of x links to the parameter binding.
    let e_xr = eval_at(&machine, c_xr);
    assert_eq!(edge_modes(&machine, e_xr, e_param), vec!["assignment"]);

    // The return expression feeds the call's evaluation.
    let e_call = eval_at(&machine, c_call);
    assert!(edge_modes(&machine, e_call, e_xr).contains(&"dependency".to_string()));

    // The defined function ran with its code block attached.
    let f_activation = machine.activations.iter().find(|a| a.name == "f").unwrap();
    assert_eq!(f_activation.code_block_id, Some(c_block));
}

#[test]
fn default_parameters_match_their_stored_dependency() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_block = h.component("add", "function_def", ComponentAccess::Write);
    let c_pa = h.component("a", "param", ComponentAccess::Write);
    let c_pb = h.component("b", "param", ComponentAccess::Write);
    let c_10 = h.lit("10");
    let c_ar = h.read("a");
    let c_br = h.read("b");
    let c_sum = h.component("a + b", "operation", ComponentAccess::Read);
    let c_fr = h.read("add");
    let c_callee = h.component("add", "func", ComponentAccess::Read);
    let c_call = h.component("add(1)", "call", ComponentAccess::Read);
    let c_arg = h.component("1", "argument", ComponentAccess::Read);
    let c_1 = h.lit("1");

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        // def add(a, b=10): return a + b
        col.function_def(act)?;
        let ten = col.literal(act, c_10, ObjRef::int(10), mode::DEPENDENCY)?;
        let default_value = ten.clone();
        let body: BodyFn = Rc::new(move |hooks, fact, args| {
            hooks.return_(fact)?;
            hooks.operation(fact)?;
            let a = hooks.name(
                fact,
                Some((c_ar, "a")),
                args.positional[0].clone(),
                mode::DEPENDENCY,
            )?;
            let b = hooks.name(fact, Some((c_br, "b")), default_value.clone(), mode::DEPENDENCY)?;
            let sum = ObjRef::int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0));
            let sum = hooks.operation_after(fact, c_sum, sum, mode::DEPENDENCY)?;
            hooks.return_after(fact, sum)
        });
        let params = ParamSpec {
            args: vec![ParamDecl::new("a", c_pa), ParamDecl::new("b", c_pb)],
            ..Default::default()
        };
        let f = col.function_def_after(act, c_block, "add", params, body)?;
        col.collect_function_def(act, "add")?;

        // add(1)
        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "add")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call, c_callee, f_ref, mode::DEPENDENCY)?;
        col.argument(act)?;
        let one = col.literal(act, c_1, ObjRef::int(1), mode::DEPENDENCY)?;
        col.argument_after(act, c_arg, one.clone(), None, None, ArgKind::Argument)?;
        let result = col.call_after(CallArgs::positional(vec![one]))?;
        assert_eq!(result.as_int(), Some(11));
        Ok(result)
    })
    .unwrap();
    assert!(outcome.finished());

    let machine = h.finish();
    check_invariants(&machine);

    // a bound from the call argument, b from the default's dependency.
    let e_pa = eval_at(&machine, c_pa);
    let e_pb = eval_at(&machine, c_pb);
    let e_1 = eval_at(&machine, c_1);
    let e_10 = eval_at(&machine, c_10);
    assert_eq!(edge_modes(&machine, e_pa, e_1), vec!["argument-bind"]);
    assert_eq!(edge_modes(&machine, e_pb, e_10), vec!["argument-bind"]);

    // The operation depends on both reads.
    let e_sum = eval_at(&machine, c_sum);
    let e_ar = eval_at(&machine, c_ar);
    let e_br = eval_at(&machine, c_br);
    assert_eq!(edge_modes(&machine, e_sum, e_ar), vec!["dependency"]);
    assert_eq!(edge_modes(&machine, e_sum, e_br), vec!["dependency"]);
}

#[test]
fn keyword_vararg_and_kwarg_parameters_all_bind() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_block = h.component("f", "function_def", ComponentAccess::Write);
    let c_pa = h.component("a", "param", ComponentAccess::Write);
    let c_rest = h.component("rest", "param", ComponentAccess::Write);
    let c_opts = h.component("opts", "param", ComponentAccess::Write);
    let c_fr = h.read("f");
    let c_callee = h.component("f", "func", ComponentAccess::Read);
    let c_call = h.component("f(1, 2, 3, k=4)", "call", ComponentAccess::Read);
    let c_args: Vec<i64> = (0..4)
        .map(|i| h.component(&format!("arg{i}"), "argument", ComponentAccess::Read))
        .collect();
    let lits: Vec<i64> = (1..=4).map(|i| h.lit(&i.to_string())).collect();

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        // def f(a, *rest, **opts): return a
        col.function_def(act)?;
        let body: BodyFn = Rc::new(move |hooks, fact, args| {
            hooks.return_(fact)?;
            hooks.return_after(fact, args.positional[0].clone())
        });
        let params = ParamSpec {
            args: vec![ParamDecl::new("a", c_pa)],
            vararg: Some(ParamDecl::new("rest", c_rest)),
            kwarg: Some(ParamDecl::new("opts", c_opts)),
            kw_only: Vec::new(),
        };
        let f = col.function_def_after(act, c_block, "f", params, body)?;
        col.collect_function_def(act, "f")?;

        // f(1, 2, 3, k=4)
        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "f")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call, c_callee, f_ref, mode::DEPENDENCY)?;
        let mut values = Vec::new();
        for (index, (&c_arg, &c_lit)) in c_args.iter().zip(&lits).enumerate().take(3) {
            col.argument(act)?;
            let v = col.literal(act, c_lit, ObjRef::int(index as i64 + 1), mode::DEPENDENCY)?;
            col.argument_after(act, c_arg, v.clone(), None, None, ArgKind::Argument)?;
            values.push(v);
        }
        col.argument(act)?;
        let four = col.literal(act, lits[3], ObjRef::int(4), mode::DEPENDENCY)?;
        col.argument_after(act, c_args[3], four.clone(), None, Some("k"), ArgKind::Keyword)?;

        let mut call_args = CallArgs::positional(values);
        call_args.keywords.push(("k".to_owned(), four));
        let result = col.call_after(call_args)?;
        assert_eq!(result.as_int(), Some(1));
        Ok(result)
    })
    .unwrap();
    assert!(outcome.finished());

    let machine = h.finish();
    check_invariants(&machine);

    // a takes the first positional; rest absorbs the remaining two (last
    // binding wins in the context, both are evaluated); k routes to opts.
    let e_pa = eval_at(&machine, c_pa);
    let e_1 = eval_at(&machine, lits[0]);
    assert_eq!(edge_modes(&machine, e_pa, e_1), vec!["argument-bind"]);
    let rest_evals: Vec<i64> = machine
        .evaluations
        .iter()
        .filter(|e| e.code_component_id == c_rest)
        .map(|e| e.id)
        .collect();
    assert_eq!(rest_evals.len(), 2);
    let opts_evals: Vec<i64> = machine
        .evaluations
        .iter()
        .filter(|e| e.code_component_id == c_opts)
        .map(|e| e.id)
        .collect();
    assert_eq!(opts_evals.len(), 1);
    let e_4 = eval_at(&machine, lits[3]);
    assert_eq!(edge_modes(&machine, opts_evals[0], e_4), vec!["argument-bind"]);
}

#[test]
fn closure_lookup_walks_the_defining_chain() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_gw = h.write("g");
    let c_g_lit = h.lit("7");
    let c_block = h.component("reader", "function_def", ComponentAccess::Write);
    let c_gr = h.read("g");
    let c_fr = h.read("reader");
    let c_callee = h.component("reader", "func", ComponentAccess::Read);
    let c_call = h.component("reader()", "call", ComponentAccess::Read);

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        // g = 7
        col.assign_value(act)?;
        let seven = col.literal(act, c_g_lit, ObjRef::int(7), mode::DEPENDENCY)?;
        col.assign_value_after(act, seven.clone())?;
        let assign = col.pop_assign(act)?;
        col.assign(act, assign, &AssignTarget::single(c_gw, "g", seven.clone()))?;

        // def reader(): return g
        col.function_def(act)?;
        let captured = seven.clone();
        let body: BodyFn = Rc::new(move |hooks, fact, _args| {
            hooks.return_(fact)?;
            let g = hooks.name(fact, Some((c_gr, "g")), captured.clone(), mode::DEPENDENCY)?;
            hooks.return_after(fact, g)
        });
        let f = col.function_def_after(act, c_block, "reader", ParamSpec::default(), body)?;
        col.collect_function_def(act, "reader")?;

        // reader()
        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "reader")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call, c_callee, f_ref, mode::DEPENDENCY)?;
        let result = col.call_after(CallArgs::default())?;
        assert_eq!(result.as_int(), Some(7));
        Ok(result)
    })
    .unwrap();
    assert!(outcome.finished());

    let machine = h.finish();
    check_invariants(&machine);

    // The body's read of g resolved through the closure to the script-level
    // binding.
    let e_gr = eval_at(&machine, c_gr);
    let e_gw = eval_at(&machine, c_gw);
    assert_eq!(edge_modes(&machine, e_gr, e_gw), vec!["assignment"]);
}

#[test]
fn guest_exceptions_are_recorded_and_re_raised() {
    let mut h = Harness::new();
    let main = h.component("script", "script", ComponentAccess::Read);
    let c_block = h.component("boom", "function_def", ComponentAccess::Write);
    let c_fr = h.read("boom");
    let c_callee = h.component("boom", "func", ComponentAccess::Read);
    let c_call = h.component("boom()", "call", ComponentAccess::Read);

    let outcome = run_script(&mut h.collector, "script", main, |col, act| {
        col.function_def(act)?;
        let body: BodyFn = Rc::new(|_hooks, _fact, _args| {
            Err(UserError::value_error("boom").into())
        });
        let f = col.function_def_after(act, c_block, "boom", ParamSpec::default(), body)?;
        col.collect_function_def(act, "boom")?;

        col.func(act)?;
        let f_ref = col.name(act, Some((c_fr, "boom")), f, mode::DEPENDENCY)?;
        col.func_after(act, c_call, c_callee, f_ref, mode::DEPENDENCY)?;
        col.call_after(CallArgs::default())
    })
    .unwrap();

    assert_eq!(outcome.status, TrialStatus::Unfinished);
    let err = outcome.result.unwrap_err();
    assert_eq!(err.raised().unwrap().kind, "ValueError");

    let machine = h.finish();
    check_invariants(&machine);

    // Recorded against the callee activation and again at the script level
    // as the exception propagated.
    assert_eq!(machine.exceptions.len(), 2);
    assert!(machine
        .exceptions
        .iter()
        .all(|e| e.exception == "ValueError: boom"));
    assert_eq!(machine.trial_updates.len(), 1);
    assert_eq!(machine.trial_updates[0].status, TrialStatus::Unfinished);

    // The activation was still closed: its evaluation has a moment.
    let boom = machine.activations.iter().find(|a| a.name == "boom").unwrap();
    let call_eval = machine.evaluation(boom.evaluation_id).unwrap();
    assert!(call_eval.moment.is_some());
}
