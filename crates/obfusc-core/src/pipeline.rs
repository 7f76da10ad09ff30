//! Composition pipeline: validated unit sequence, seeded randomness, and
//! per-unit analysis refresh.
//!
//! The pipeline owns the generator; every enabled unit draws from it in
//! order, so a run is fully determined by the seed, the unit sequence, and
//! the input tree. A failing unit surfaces with its index and the tree as
//! produced by all prior units, which stays valid on its own.

use crate::analysis::AnalysisContext;
use crate::ast::SourceUnit;
use crate::error::PipelineError;
use crate::transforms::UnitConfig;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A persisted composition: named unit slots in application order, plus the
/// seed. This is the JSON shape composition-file collaborators exchange; the
/// core never reads or writes files itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub seed: u64,
    pub units: IndexMap<String, UnitConfig>,
}

impl Composition {
    pub fn from_json(text: &str) -> Result<Composition, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn into_pipeline(self) -> Result<Pipeline, PipelineError> {
        let seed = self.seed;
        Pipeline::new(self.units.into_values().collect(), seed)
    }
}

/// Where a pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(usize),
    Done,
    Failed(usize),
}

#[derive(Debug)]
pub struct Pipeline {
    units: Vec<UnitConfig>,
    rng: StdRng,
    state: PipelineState,
}

impl Pipeline {
    /// Build a pipeline, validating every unit's parameters before any tree
    /// is accepted.
    pub fn new(units: Vec<UnitConfig>, seed: u64) -> Result<Pipeline, PipelineError> {
        for config in &units {
            config
                .unit
                .validate()
                .map_err(PipelineError::InvalidComposition)?;
        }
        Ok(Pipeline {
            units,
            rng: StdRng::seed_from_u64(seed),
            state: PipelineState::Idle,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Apply the enabled units in order. Analyses are rebuilt for each unit
    /// so every transform sees the tree its predecessor produced.
    pub fn run(&mut self, input: SourceUnit) -> Result<SourceUnit, PipelineError> {
        // Malformed input is rejected before any unit runs.
        AnalysisContext::run(&input)?;

        let mut tree = input;
        for index in 0..self.units.len() {
            let config = self.units[index].clone();
            if !config.enabled {
                debug!(index, unit = %config.unit, "skipping disabled unit");
                continue;
            }
            self.state = PipelineState::Running(index);
            debug!(index, unit = %config.unit, "applying unit");

            let ctx = AnalysisContext::run(&tree)?;
            match config.unit.apply(&tree, &ctx, &mut self.rng) {
                Ok(next) => tree = next,
                Err(source) => {
                    self.state = PipelineState::Failed(index);
                    return Err(PipelineError::UnitFailed {
                        index,
                        unit: config.unit.to_string(),
                        source,
                        last_good: tree,
                    });
                }
            }
        }
        self.state = PipelineState::Done;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CType, Expr, FunctionDef, Item, Param, Stmt};
    use crate::transforms::{
        AugmentOpaqueParams, FlattenParams, CaseIdStyle, ObfuscationUnit, OpaqueStyle,
    };

    fn sample_unit() -> SourceUnit {
        SourceUnit::new(vec![Item::Function(FunctionDef {
            name: "f".into(),
            ret: CType::int(),
            params: vec![Param::new("a", CType::int())],
            variadic: false,
            body: vec![
                Stmt::If {
                    cond: Expr::binary(
                        crate::ast::BinOp::Gt,
                        Expr::Ident("a".into()),
                        Expr::IntLit(0),
                    ),
                    then_branch: Box::new(Stmt::Return(Some(Expr::IntLit(1)))),
                    else_branch: None,
                },
                Stmt::Return(Some(Expr::IntLit(2))),
            ],
        })])
    }

    fn augment() -> ObfuscationUnit {
        ObfuscationUnit::AugmentOpaque(AugmentOpaqueParams {
            styles: vec![OpaqueStyle::Input],
            probability: 1.0,
            number: 1,
        })
    }

    #[test]
    fn invalid_parameters_are_rejected_before_running() {
        let bad = ObfuscationUnit::AugmentOpaque(AugmentOpaqueParams {
            styles: vec![],
            probability: 0.5,
            number: 1,
        });
        let err = Pipeline::new(vec![UnitConfig::enabled(bad)], 1).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidComposition(_)));
    }

    #[test]
    fn same_seed_and_units_give_identical_trees() {
        let units = vec![
            UnitConfig::enabled(augment()),
            UnitConfig::enabled(ObfuscationUnit::FlattenControlFlow(FlattenParams {
                style: CaseIdStyle::RandomInt,
                randomize_case_order: false,
            })),
        ];
        let mut first = Pipeline::new(units.clone(), 42).unwrap();
        let mut second = Pipeline::new(units, 42).unwrap();
        let a = first.run(sample_unit()).unwrap();
        let b = second.run(sample_unit()).unwrap();
        assert_eq!(a, b);
        assert_eq!(first.state(), PipelineState::Done);
    }

    #[test]
    fn disabled_units_consume_no_randomness() {
        let enabled_only = vec![UnitConfig::enabled(augment())];
        let with_disabled = vec![
            UnitConfig::disabled(ObfuscationUnit::FlattenControlFlow(FlattenParams {
                style: CaseIdStyle::RandomInt,
                randomize_case_order: true,
            })),
            UnitConfig::enabled(augment()),
        ];
        let a = Pipeline::new(enabled_only, 7).unwrap().run(sample_unit()).unwrap();
        let b = Pipeline::new(with_disabled, 7)
            .unwrap()
            .run(sample_unit())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_input_is_rejected_up_front() {
        let unit = SourceUnit::new(vec![Item::Function(FunctionDef {
            name: "f".into(),
            ret: CType::Void,
            params: vec![],
            variadic: false,
            body: vec![Stmt::Goto("nowhere".into())],
        })]);
        let mut pipeline = Pipeline::new(vec![UnitConfig::enabled(augment())], 1).unwrap();
        let err = pipeline.run(unit).unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
    }

    #[test]
    fn failing_unit_reports_index_and_last_good_tree() {
        // Interface randomization refuses the address-taken callee.
        let unit = SourceUnit::new(vec![
            Item::Function(FunctionDef {
                name: "cb".into(),
                ret: CType::int(),
                params: vec![],
                variadic: false,
                body: vec![Stmt::Return(Some(Expr::IntLit(0)))],
            }),
            Item::Function(FunctionDef {
                name: "main".into(),
                ret: CType::int(),
                params: vec![],
                variadic: false,
                body: vec![
                    Stmt::Expr(Expr::call("install", vec![Expr::Ident("cb".into())])),
                    Stmt::Return(Some(Expr::IntLit(0))),
                ],
            }),
        ]);
        let units = vec![
            UnitConfig::enabled(ObfuscationUnit::Identity),
            UnitConfig::enabled(ObfuscationUnit::RandomizeInterface(
                crate::transforms::InterfaceParams {
                    extra_args: 1,
                    variable_probability: 0.0,
                    randomize_order: false,
                },
            )),
        ];
        let mut pipeline = Pipeline::new(units, 3).unwrap();
        match pipeline.run(unit.clone()).unwrap_err() {
            PipelineError::UnitFailed {
                index, last_good, ..
            } => {
                assert_eq!(index, 1);
                // Identity left the tree untouched.
                assert_eq!(last_good, unit);
            }
            other => panic!("expected unit failure, got {other}"),
        }
        assert_eq!(pipeline.state(), PipelineState::Failed(1));
    }

    #[test]
    fn composition_round_trips_through_json_in_order() {
        let mut units = IndexMap::new();
        units.insert("warmup".to_string(), UnitConfig::disabled(ObfuscationUnit::Identity));
        units.insert("augment".to_string(), UnitConfig::enabled(augment()));
        let composition = Composition { seed: 99, units };

        let text = composition.to_json().unwrap();
        let parsed = Composition::from_json(&text).unwrap();
        assert_eq!(parsed, composition);
        assert_eq!(
            parsed.units.keys().collect::<Vec<_>>(),
            vec!["warmup", "augment"]
        );
        assert!(parsed.into_pipeline().is_ok());
    }

    #[test]
    fn identity_pipeline_is_idempotent() {
        let units = vec![UnitConfig::enabled(ObfuscationUnit::Identity)];
        let mut pipeline = Pipeline::new(units, 0).unwrap();
        let input = sample_unit();
        let out = pipeline.run(input.clone()).unwrap();
        assert_eq!(out, input);
    }
}
