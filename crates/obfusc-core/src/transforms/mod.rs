//! Structural and procedural transform units.
//!
//! Units form a closed set dispatched by exhaustive match; every unit is a
//! pure function from one tree to the next, taking the analyses of the input
//! tree and a seeded generator.

pub mod flatten;
pub mod interface;
pub mod opaque;

pub use flatten::{CaseIdStyle, FlattenParams};
pub use interface::InterfaceParams;
pub use opaque::{
    AugmentOpaqueParams, Granularity, InsertOpaqueParams, OpaqueKind, OpaqueStyle,
};

use crate::analysis::AnalysisContext;
use crate::ast::SourceUnit;
use crate::error::{PreconditionViolation, TransformError};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// One transform in a composition, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObfuscationUnit {
    /// No-op placeholder; keeps composition slots addressable.
    Identity,
    AugmentOpaque(AugmentOpaqueParams),
    InsertOpaque(InsertOpaqueParams),
    FlattenControlFlow(FlattenParams),
    RandomizeInterface(InterfaceParams),
}

impl ObfuscationUnit {
    pub fn name(&self) -> &'static str {
        match self {
            ObfuscationUnit::Identity => "identity",
            ObfuscationUnit::AugmentOpaque(_) => "augment-opaque",
            ObfuscationUnit::InsertOpaque(_) => "insert-opaque",
            ObfuscationUnit::FlattenControlFlow(_) => "flatten-control-flow",
            ObfuscationUnit::RandomizeInterface(_) => "randomize-interface",
        }
    }

    /// Parameter validation, run for the whole composition before any tree
    /// is touched.
    pub fn validate(&self) -> Result<(), PreconditionViolation> {
        let invalid = |reason: String| PreconditionViolation::InvalidParameter {
            unit: self.name(),
            reason,
        };
        match self {
            ObfuscationUnit::Identity | ObfuscationUnit::FlattenControlFlow(_) => Ok(()),
            ObfuscationUnit::AugmentOpaque(p) => {
                if !(0.0..=1.0).contains(&p.probability) {
                    return Err(invalid(format!(
                        "probability {} outside [0, 1]",
                        p.probability
                    )));
                }
                if p.styles.is_empty() {
                    return Err(invalid("no operand styles enabled".into()));
                }
                Ok(())
            }
            ObfuscationUnit::InsertOpaque(p) => {
                if p.number == 0 {
                    return Err(invalid("number must be at least 1".into()));
                }
                if p.styles.is_empty() {
                    return Err(invalid("no operand styles enabled".into()));
                }
                if p.granularities.is_empty() {
                    return Err(invalid("no granularities enabled".into()));
                }
                if p.kinds.is_empty() {
                    return Err(invalid("no insertion kinds enabled".into()));
                }
                Ok(())
            }
            ObfuscationUnit::RandomizeInterface(p) => {
                if !(0.0..=1.0).contains(&p.variable_probability) {
                    return Err(invalid(format!(
                        "variable probability {} outside [0, 1]",
                        p.variable_probability
                    )));
                }
                Ok(())
            }
        }
    }

    /// Apply this unit to a tree. The analyses must describe `unit`.
    pub fn apply(
        &self,
        unit: &SourceUnit,
        ctx: &AnalysisContext,
        rng: &mut StdRng,
    ) -> Result<SourceUnit, TransformError> {
        match self {
            ObfuscationUnit::Identity => Ok(unit.clone()),
            ObfuscationUnit::AugmentOpaque(p) => opaque::augment_opaque(unit, ctx, p, rng),
            ObfuscationUnit::InsertOpaque(p) => opaque::insert_opaque(unit, ctx, p, rng),
            ObfuscationUnit::FlattenControlFlow(p) => {
                flatten::flatten_control_flow(unit, ctx, p, rng)
            }
            ObfuscationUnit::RandomizeInterface(p) => {
                interface::randomize_interface(unit, ctx, p, rng)
            }
        }
    }
}

impl std::fmt::Display for ObfuscationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit slot in a composition. Disabled slots are skipped entirely and
/// consume no randomness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub enabled: bool,
    pub unit: ObfuscationUnit,
}

impl UnitConfig {
    pub fn enabled(unit: ObfuscationUnit) -> UnitConfig {
        UnitConfig {
            enabled: true,
            unit,
        }
    }

    pub fn disabled(unit: ObfuscationUnit) -> UnitConfig {
        UnitConfig {
            enabled: false,
            unit,
        }
    }
}
