//! Error taxonomy for analyses, transforms, and the pipeline.
//!
//! `AnalysisError` is the conservative fallback: a transform that cannot
//! prove a candidate site safe skips the site, it never aborts the run.
//! `PreconditionViolation` aborts the failing unit and surfaces through the
//! pipeline together with the tree produced by all prior successful units.
//! `ParseInputError` is raised by input validation before any unit runs.

use crate::ast::SourceUnit;
use thiserror::Error;

/// Missing or unprovable analysis information. Never fatal: the affected
/// candidate site is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("unknown effect for call to `{0}`")]
    UnknownCallEffect(String),
    #[error("no binding for `{name}` visible at position {position}")]
    UnresolvedIdentifier { name: String, position: u32 },
    #[error("type of expression could not be inferred")]
    UnknownType,
}

/// A transform's structural requirement is unmet; the unit fails as a whole.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreconditionViolation {
    #[error("function `{function}` is reached through an unresolved function pointer (address taken at position {position})")]
    AddressTakenFunction { function: String, position: u32 },
    #[error("const-qualified array `{name}` in `{function}` has an initializer list and cannot be hoisted")]
    ConstArrayInitializer { function: String, name: String },
    #[error("case order in `{function}` cannot be randomized: `{name}` is used before its case after reordering")]
    UnverifiableCaseOrder { function: String, name: String },
    #[error("invalid parameter for {unit}: {reason}")]
    InvalidParameter { unit: &'static str, reason: String },
}

/// Malformed input tree. Raised before the pipeline starts; not recoverable
/// within the core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseInputError {
    #[error("goto target `{label}` is not defined in function `{function}`")]
    UndefinedLabel { function: String, label: String },
    #[error("label `{label}` defined twice in function `{function}`")]
    DuplicateLabel { function: String, label: String },
    #[error("`{stmt}` outside of a loop in function `{function}`")]
    StrayJump { function: String, stmt: &'static str },
    #[error("duplicate binding `{name}` in namespace {namespace} within one scope")]
    DuplicateBinding { name: String, namespace: &'static str },
}

/// Failure of one transform unit during application.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error(transparent)]
    Precondition(#[from] PreconditionViolation),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Pipeline-level failure: which unit failed, why, and the tree as produced
/// by all prior successful units.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid composition: {0}")]
    InvalidComposition(#[source] PreconditionViolation),
    #[error(transparent)]
    Input(#[from] ParseInputError),
    #[error("unit {index} ({unit}) failed: {source}")]
    UnitFailed {
        index: usize,
        unit: String,
        #[source]
        source: TransformError,
        /// The last tree every prior unit agreed on; valid and independently
        /// owned, usable for caller-level retry policies.
        last_good: SourceUnit,
    },
}
