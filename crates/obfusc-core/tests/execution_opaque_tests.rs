//! Execution tests for opaque predicates: augmented conditions and inserted
//! guards must leave observable behavior untouched for every style, kind, and
//! granularity, because guarded buggy code is never reached.

use obfusc_core::analysis::AnalysisContext;
use obfusc_core::ast::{BinOp, SourceUnit};
use obfusc_core::transforms::opaque::{
    augment_opaque, insert_opaque, AugmentOpaqueParams, Granularity, InsertOpaqueParams,
    OpaqueKind, OpaqueStyle,
};
use obfusc_test_helpers::builders::{
    assign, bin, decl, function, ident, if_else, lit, param, print, ret, unit, while_loop,
};
use obfusc_test_helpers::{Interpreter, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// A worker with branches, a loop, and prints, so inserted guards have real
/// statements to wrap and augmented conditions sit on live control flow.
fn subject() -> SourceUnit {
    unit(vec![function(
        "f",
        vec![param("a"), param("b")],
        vec![
            decl("acc", lit(0)),
            if_else(
                bin(BinOp::Gt, ident("a"), ident("b")),
                vec![assign("acc", bin(BinOp::Sub, ident("a"), ident("b")))],
                vec![assign("acc", bin(BinOp::Add, ident("a"), ident("b")))],
            ),
            while_loop(
                bin(BinOp::Gt, ident("acc"), lit(0)),
                vec![
                    print(vec![ident("acc")]),
                    assign("acc", bin(BinOp::Sub, ident("acc"), lit(3))),
                ],
            ),
            ret(ident("acc")),
        ],
    )])
}

fn assert_same_behavior(source: &SourceUnit, transformed: &SourceUnit) {
    for (a, b) in [(0i64, 0i64), (5, 2), (2, 5), (-4, 9), (100, 1)] {
        let mut before = Interpreter::new(source);
        let mut after = Interpreter::new(transformed);
        let expected = before
            .run_function("f", &[Value::Int(a), Value::Int(b)])
            .unwrap();
        let actual = after
            .run_function("f", &[Value::Int(a), Value::Int(b)])
            .unwrap();
        assert_eq!(actual, expected, "diverged on f({a}, {b})");
        assert_eq!(after.output(), before.output(), "trace diverged on f({a}, {b})");
    }
}

// ============================================================================
// Condition augmentation
// ============================================================================

#[test]
fn test_augmented_conditions_keep_behavior() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let params = AugmentOpaqueParams {
        styles: vec![OpaqueStyle::Input],
        probability: 1.0,
        number: 2,
    };
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let out = augment_opaque(&tree, &ctx, &params, &mut rng).unwrap();
        assert_ne!(out, tree, "seed {seed} changed nothing");
        assert_same_behavior(&tree, &out);
    }
}

#[test]
fn test_entropy_augmentation_keeps_behavior() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let params = AugmentOpaqueParams {
        styles: vec![OpaqueStyle::Entropy],
        probability: 1.0,
        number: 1,
    };
    let mut rng = StdRng::seed_from_u64(11);
    let out = augment_opaque(&tree, &ctx, &params, &mut rng).unwrap();
    assert_same_behavior(&tree, &out);
}

// ============================================================================
// Guard insertion
// ============================================================================

#[test]
fn test_each_insertion_kind_keeps_behavior() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let kinds = [
        OpaqueKind::Check,
        OpaqueKind::False,
        OpaqueKind::ElseTrue,
        OpaqueKind::ElseFalse,
        OpaqueKind::WhileFalse,
        OpaqueKind::Either,
    ];
    for kind in kinds {
        let params = InsertOpaqueParams {
            styles: vec![OpaqueStyle::Input],
            granularities: vec![Granularity::Function],
            kinds: vec![kind],
            number: 2,
        };
        for seed in 0..4u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = insert_opaque(&tree, &ctx, &params, &mut rng).unwrap();
            assert_same_behavior(&tree, &out);
        }
    }
}

#[test]
fn test_each_granularity_keeps_behavior() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    for granularity in [
        Granularity::Function,
        Granularity::Block,
        Granularity::Statement,
    ] {
        let params = InsertOpaqueParams {
            styles: vec![OpaqueStyle::Input, OpaqueStyle::Entropy],
            granularities: vec![granularity],
            kinds: vec![OpaqueKind::Check, OpaqueKind::False, OpaqueKind::Either],
            number: 3,
        };
        for seed in 0..4u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = insert_opaque(&tree, &ctx, &params, &mut rng).unwrap();
            assert_same_behavior(&tree, &out);
        }
    }
}

#[test]
fn test_mixed_granularities_split_across_many_guards() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let params = InsertOpaqueParams {
        styles: vec![OpaqueStyle::Input],
        granularities: vec![
            Granularity::Function,
            Granularity::Block,
            Granularity::Statement,
        ],
        kinds: vec![OpaqueKind::Check],
        number: 12,
    };
    let mut rng = StdRng::seed_from_u64(42);
    let out = insert_opaque(&tree, &ctx, &params, &mut rng).unwrap();
    assert_same_behavior(&tree, &out);
}

// ============================================================================
// Whole-tree invariants
// ============================================================================

#[test]
fn test_transformed_trees_still_validate() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let params = InsertOpaqueParams {
        styles: vec![OpaqueStyle::Entropy],
        granularities: vec![Granularity::Block],
        kinds: vec![OpaqueKind::ElseFalse, OpaqueKind::WhileFalse],
        number: 4,
    };
    let mut rng = StdRng::seed_from_u64(3);
    let out = insert_opaque(&tree, &ctx, &params, &mut rng).unwrap();
    assert!(AnalysisContext::run(&out).is_ok());
}

#[test]
fn test_insertion_is_deterministic() {
    let tree = subject();
    let ctx = AnalysisContext::run(&tree).unwrap();
    let params = InsertOpaqueParams {
        styles: vec![OpaqueStyle::Input],
        granularities: vec![Granularity::Statement],
        kinds: vec![OpaqueKind::Either],
        number: 5,
    };
    let mut a_rng = StdRng::seed_from_u64(123);
    let mut b_rng = StdRng::seed_from_u64(123);
    let a = insert_opaque(&tree, &ctx, &params, &mut a_rng).unwrap();
    let b = insert_opaque(&tree, &ctx, &params, &mut b_rng).unwrap();
    assert_eq!(a, b);
}
