//! Static analysis and obfuscating transforms over a C-like AST.
//!
//! The crate consumes an already-parsed [`ast::SourceUnit`], analyses it
//! (scopes and namespaces, expression types and effects, per-function control
//! flow graphs), and rewrites it through a validated [`pipeline::Pipeline`]
//! of transform units: opaque predicate augmentation and insertion,
//! control-flow flattening, and function interface randomization. Every
//! transform is a pure `SourceUnit -> SourceUnit` step driven by a seeded
//! generator, so runs are deterministic and a failure always leaves the last
//! good tree intact.

pub mod analysis;
pub mod ast;
pub mod error;
pub mod pipeline;
pub mod transforms;

pub use analysis::AnalysisContext;
pub use ast::SourceUnit;
pub use error::{
    AnalysisError, ParseInputError, PipelineError, PreconditionViolation, TransformError,
};
pub use pipeline::{Composition, Pipeline, PipelineState};
pub use transforms::{ObfuscationUnit, UnitConfig};
