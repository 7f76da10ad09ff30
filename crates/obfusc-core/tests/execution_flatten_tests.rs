//! Execution tests for control-flow flattening: the flattened tree must
//! behave exactly like the source tree under the reference interpreter, for
//! every case id style, across branches, loops, switches, and gotos.

use obfusc_core::analysis::AnalysisContext;
use obfusc_core::ast::{BinOp, CaseLabel, CType, Expr, SourceUnit, Stmt, SwitchCase};
use obfusc_core::transforms::flatten::{flatten_control_flow, CaseIdStyle, FlattenParams};
use obfusc_test_helpers::builders::{
    assign, bin, decl, function, ident, if_else, lit, param, print, ret, unit, while_loop,
};
use obfusc_test_helpers::{Interpreter, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn flatten(tree: &SourceUnit, style: CaseIdStyle, randomize: bool, seed: u64) -> SourceUnit {
    let ctx = AnalysisContext::run(tree).unwrap();
    let params = FlattenParams {
        style,
        randomize_case_order: randomize,
    };
    let mut rng = StdRng::seed_from_u64(seed);
    flatten_control_flow(tree, &ctx, &params, &mut rng).unwrap()
}

/// Run `f(input)` on both trees and compare the returned value and the
/// print trace.
fn assert_same_behavior(source: &SourceUnit, transformed: &SourceUnit, inputs: &[i64]) {
    for &input in inputs {
        let mut before = Interpreter::new(source);
        let mut after = Interpreter::new(transformed);
        let expected = before.run_function("f", &[Value::Int(input)]).unwrap();
        let actual = after.run_function("f", &[Value::Int(input)]).unwrap();
        assert_eq!(actual, expected, "diverged on input {input}");
        assert_eq!(after.output(), before.output(), "trace diverged on input {input}");
    }
}

// ============================================================================
// The three-block branch scenario
// ============================================================================

fn branchy() -> SourceUnit {
    // if (a > 0) return 1; return 2;
    unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            if_else(
                bin(BinOp::Gt, ident("a"), lit(0)),
                vec![ret(lit(1))],
                vec![],
            ),
            ret(lit(2)),
        ],
    )])
}

#[test]
fn test_three_blocks_get_sequential_cases_zero_one_two() {
    let out = flatten(&branchy(), CaseIdStyle::Sequential, false, 0);
    let f = out.function("f").unwrap();

    let cases = match f.body.last().unwrap() {
        Stmt::While { body, .. } => match body.as_ref() {
            Stmt::Compound(inner) => match &inner[0] {
                Stmt::Switch { cases, .. } => cases,
                other => panic!("expected dispatch switch, got {other:?}"),
            },
            other => panic!("expected compound, got {other:?}"),
        },
        other => panic!("expected dispatch loop, got {other:?}"),
    };
    assert_eq!(cases.len(), 3);
    for (i, case) in cases.iter().enumerate() {
        assert_eq!(case.label, CaseLabel::Case(Expr::IntLit(i as i64)));
    }
    assert_same_behavior(&branchy(), &out, &[-1, 0, 1, 100]);
}

#[test]
fn test_branch_scenario_survives_every_style() {
    for style in [
        CaseIdStyle::Sequential,
        CaseIdStyle::RandomInt,
        CaseIdStyle::Enumerator,
    ] {
        for seed in 0..4u64 {
            let out = flatten(&branchy(), style, false, seed);
            assert_same_behavior(&branchy(), &out, &[-1, 0, 1, 100]);
        }
    }
}

#[test]
fn test_randomized_case_order_preserves_behavior() {
    for seed in 0..6u64 {
        let out = flatten(&branchy(), CaseIdStyle::RandomInt, true, seed);
        assert_same_behavior(&branchy(), &out, &[-1, 0, 1, 100]);
    }
}

// ============================================================================
// Loops
// ============================================================================

#[test]
fn test_while_loop_accumulator() {
    // sum of 0..a
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            decl("sum", lit(0)),
            decl("i", lit(0)),
            while_loop(
                bin(BinOp::Lt, ident("i"), ident("a")),
                vec![
                    assign("sum", bin(BinOp::Add, ident("sum"), ident("i"))),
                    assign("i", bin(BinOp::Add, ident("i"), lit(1))),
                ],
            ),
            ret(ident("sum")),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 1);
    assert_same_behavior(&tree, &out, &[0, 1, 5, 10, 100]);
}

#[test]
fn test_for_loop_with_break_and_continue() {
    // for (i = 0; i < a; i++) { if (i == 3) continue; if (i == 7) break; print(i); }
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            Stmt::For {
                init: Some(Box::new(obfusc_core::ast::ForInit::Decl(
                    obfusc_core::ast::Declaration::new(
                        "i",
                        CType::int(),
                        Some(obfusc_core::ast::Initializer::Expr(lit(0))),
                    ),
                ))),
                cond: Some(bin(BinOp::Lt, ident("i"), ident("a"))),
                step: Some(Expr::assign(
                    ident("i"),
                    bin(BinOp::Add, ident("i"), lit(1)),
                )),
                body: Box::new(Stmt::Compound(vec![
                    if_else(
                        bin(BinOp::Eq, ident("i"), lit(3)),
                        vec![Stmt::Continue],
                        vec![],
                    ),
                    if_else(
                        bin(BinOp::Eq, ident("i"), lit(7)),
                        vec![Stmt::Break],
                        vec![],
                    ),
                    print(vec![ident("i")]),
                ])),
            },
            ret(lit(0)),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 2);
    assert_same_behavior(&tree, &out, &[0, 3, 5, 10]);
}

#[test]
fn test_do_while_runs_at_least_once() {
    // do { print(a); a = a - 1; } while (a > 0);
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            Stmt::DoWhile {
                body: Box::new(Stmt::Compound(vec![
                    print(vec![ident("a")]),
                    assign("a", bin(BinOp::Sub, ident("a"), lit(1))),
                ])),
                cond: bin(BinOp::Gt, ident("a"), lit(0)),
            },
            ret(ident("a")),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Enumerator, false, 3);
    assert_same_behavior(&tree, &out, &[-5, 0, 1, 4]);
}

// ============================================================================
// Switch dispatch and gotos
// ============================================================================

#[test]
fn test_switch_fallthrough_is_preserved()  {
    // switch (a) { case 1: print(1); case 2: print(2); break; default: print(9); }
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            Stmt::Switch {
                cond: ident("a"),
                cases: vec![
                    SwitchCase {
                        label: CaseLabel::Case(lit(1)),
                        body: vec![print(vec![lit(1)])],
                    },
                    SwitchCase {
                        label: CaseLabel::Case(lit(2)),
                        body: vec![print(vec![lit(2)]), Stmt::Break],
                    },
                    SwitchCase {
                        label: CaseLabel::Default,
                        body: vec![print(vec![lit(9)])],
                    },
                ],
            },
            ret(lit(0)),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 4);
    assert_same_behavior(&tree, &out, &[0, 1, 2, 3]);
}

#[test]
fn test_goto_over_a_statement() {
    // a = a + 1; goto skip; a = a + 100; skip: return a;
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            assign("a", bin(BinOp::Add, ident("a"), lit(1))),
            Stmt::Goto("skip".into()),
            assign("a", bin(BinOp::Add, ident("a"), lit(100))),
            Stmt::Labeled {
                label: "skip".into(),
                stmt: Box::new(ret(ident("a"))),
            },
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 5);
    assert_same_behavior(&tree, &out, &[0, 41]);
}

// ============================================================================
// Hoisting
// ============================================================================

#[test]
fn test_loop_local_initializer_reruns_every_iteration() {
    // while (a > 0) { int x = a * 2; print(x); a = a - 1; }
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            while_loop(
                bin(BinOp::Gt, ident("a"), lit(0)),
                vec![
                    decl("x", bin(BinOp::Mul, ident("a"), lit(2))),
                    print(vec![ident("x")]),
                    assign("a", bin(BinOp::Sub, ident("a"), lit(1))),
                ],
            ),
            ret(lit(0)),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 6);
    assert_same_behavior(&tree, &out, &[0, 1, 3]);
}

#[test]
fn test_array_initializer_hoists_to_element_assignments() {
    // int t[3] = {5, 6, 7}; return t[a];
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            Stmt::Decl(obfusc_core::ast::Declaration::new(
                "t",
                CType::Array {
                    elem: Box::new(CType::int()),
                    len: Some(Box::new(lit(3))),
                },
                Some(obfusc_core::ast::Initializer::List(vec![
                    obfusc_core::ast::Initializer::Expr(lit(5)),
                    obfusc_core::ast::Initializer::Expr(lit(6)),
                    obfusc_core::ast::Initializer::Expr(lit(7)),
                ])),
            )),
            ret(Expr::Index {
                base: Box::new(ident("t")),
                index: Box::new(ident("a")),
            }),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 7);
    assert_same_behavior(&tree, &out, &[0, 1, 2]);
}

#[test]
fn test_vla_behaves_after_pointer_hoisting() {
    // int buf[a]; buf[0] = 42; return buf[0];
    let tree = unit(vec![function(
        "f",
        vec![param("a")],
        vec![
            Stmt::Decl(obfusc_core::ast::Declaration::new(
                "buf",
                CType::Array {
                    elem: Box::new(CType::int()),
                    len: Some(Box::new(ident("a"))),
                },
                None,
            )),
            Stmt::Expr(Expr::assign(
                Expr::Index {
                    base: Box::new(ident("buf")),
                    index: Box::new(lit(0)),
                },
                lit(42),
            )),
            ret(Expr::Index {
                base: Box::new(ident("buf")),
                index: Box::new(lit(0)),
            }),
        ],
    )]);
    let out = flatten(&tree, CaseIdStyle::Sequential, false, 8);
    assert_same_behavior(&tree, &out, &[1, 4, 16]);
}

// ============================================================================
// Whole-tree invariants
// ============================================================================

#[test]
fn test_flattened_tree_still_validates() {
    for style in [
        CaseIdStyle::Sequential,
        CaseIdStyle::RandomInt,
        CaseIdStyle::Enumerator,
    ] {
        let out = flatten(&branchy(), style, false, 9);
        assert!(AnalysisContext::run(&out).is_ok());
    }
}

#[test]
fn test_flattening_is_deterministic() {
    let a = flatten(&branchy(), CaseIdStyle::RandomInt, true, 77);
    let b = flatten(&branchy(), CaseIdStyle::RandomInt, true, 77);
    assert_eq!(a, b);
}
