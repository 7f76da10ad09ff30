//! Static analyses over one translation unit.
//!
//! Transforms run the analyses they need through one [`AnalysisContext`],
//! built once per unit application. The context is read-only; a transform
//! that rewrote the tree builds a fresh context for the rewritten unit.

pub mod cfg;
pub mod expr;
pub mod scope;

pub use cfg::{BasicBlock, BlockId, Cfg, Terminator};
pub use expr::{Effect, ExprAnalysis, ExprInfo, ExprType, TypeEnv};
pub use scope::{Binding, BindingKind, CallSite, NameSpace, ScopeAnalysis, ScopeId};

use crate::ast::{FunctionDef, SourceUnit};
use crate::error::ParseInputError;

/// Scope and expression analyses for one unit, plus on-demand CFGs.
#[derive(Debug)]
pub struct AnalysisContext {
    scopes: ScopeAnalysis,
    exprs: ExprAnalysis,
}

impl AnalysisContext {
    /// Run all whole-unit analyses. Fails only on malformed input.
    pub fn run(unit: &SourceUnit) -> Result<AnalysisContext, ParseInputError> {
        let scopes = ScopeAnalysis::run(unit)?;
        let exprs = ExprAnalysis::run(unit, &scopes);
        Ok(AnalysisContext { scopes, exprs })
    }

    pub fn scopes(&self) -> &ScopeAnalysis {
        &self.scopes
    }

    pub fn exprs(&self) -> &ExprAnalysis {
        &self.exprs
    }

    /// Build the CFG of one function. Cheap enough to rebuild per transform.
    pub fn cfg(&self, f: &FunctionDef) -> Cfg {
        Cfg::build(f)
    }
}
