//! Function interface randomization.
//!
//! Each defined function grows a number of spurious parameters and may have
//! its parameter order permuted. The signature and every call site change in
//! one step, so the unit either rewrites a function consistently or not at
//! all. `main` keeps its fixed interface, and a function whose address
//! escapes cannot be rewritten: calls through the pointer would keep the old
//! shape.

use crate::analysis::{AnalysisContext, NameSpace, ScopeAnalysis};
use crate::ast::{CType, Expr, ForInit, Initializer, IntKind, Param, RealKind, Stmt};
use crate::error::{PreconditionViolation, TransformError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceParams {
    /// Spurious parameters appended per function.
    pub extra_args: u32,
    /// Probability that a spurious argument is a matching in-scope variable
    /// rather than a fresh constant.
    pub variable_probability: f64,
    pub randomize_order: bool,
}

pub fn randomize_interface(
    unit: &crate::ast::SourceUnit,
    ctx: &AnalysisContext,
    params: &InterfaceParams,
    rng: &mut StdRng,
) -> Result<crate::ast::SourceUnit, TransformError> {
    let mut out = unit.clone();
    let targets: Vec<String> = out
        .functions()
        .filter(|f| f.name != "main")
        .map(|f| f.name.clone())
        .collect();

    let mut taken: FxHashSet<String> = FxHashSet::default();
    for target in targets {
        if let Some(position) = ctx.scopes().address_taken(&target) {
            return Err(PreconditionViolation::AddressTakenFunction {
                function: target,
                position,
            }
            .into());
        }
        rewrite_function(&mut out, ctx.scopes(), &target, params, &mut taken, rng);
    }
    Ok(out)
}

/// Candidate types for spurious parameters.
const EXTRA_TYPES: &[CType] = &[
    CType::Int(IntKind::Int),
    CType::Real(RealKind::Double),
    CType::Int(IntKind::Char),
];

fn rewrite_function(
    unit: &mut crate::ast::SourceUnit,
    scopes: &ScopeAnalysis,
    target: &str,
    params: &InterfaceParams,
    taken: &mut FxHashSet<String>,
    rng: &mut StdRng,
) {
    let (old_n, extras) = {
        let f = match unit.functions().find(|f| f.name == target) {
            Some(f) => f,
            None => return,
        };
        let old_n = f.params.len();
        let extras: Vec<Param> = (0..params.extra_args)
            .map(|_| {
                let name = scopes.fresh_name("extra", NameSpace::Ordinary, taken);
                taken.insert(name.clone());
                let ty = EXTRA_TYPES[rng.gen_range(0..EXTRA_TYPES.len())].clone();
                Param::new(&name, ty)
            })
            .collect();
        (old_n, extras)
    };

    let total = old_n + extras.len();
    // perm[new_position] = old_position over the combined parameter list.
    let mut perm: Vec<usize> = (0..total).collect();
    if params.randomize_order {
        perm.shuffle(rng);
    }
    debug!(function = %target, extra = extras.len(), "randomizing interface");

    // New signature.
    let extra_types: Vec<CType> = extras.iter().map(|p| p.ty.clone()).collect();
    for f in unit.functions_mut() {
        if f.name == target {
            let mut combined: Vec<Param> = f.params.drain(..).collect();
            combined.extend(extras.iter().cloned());
            f.params = perm.iter().map(|&old| combined[old].clone()).collect();
            break;
        }
    }

    // All call sites, in every function body.
    let callers: Vec<String> = unit.functions().map(|f| f.name.clone()).collect();
    for caller in callers {
        let pool = unshadowed_params(unit, scopes, &caller);
        let f = match unit.items.iter_mut().find_map(|item| match item {
            crate::ast::Item::Function(f) if f.name == caller => Some(f),
            _ => None,
        }) {
            Some(f) => f,
            None => continue,
        };
        let mut rewriter = CallRewriter {
            target,
            old_n,
            perm: &perm,
            extra_types: &extra_types,
            variable_probability: params.variable_probability,
            pool,
        };
        for stmt in &mut f.body {
            rewriter.stmt(stmt, rng);
        }
    }
}

/// Parameters of `caller` usable as spurious arguments: any parameter whose
/// name is never redeclared inside the function, so a use at an arbitrary
/// call site cannot be captured by a shadowing local.
fn unshadowed_params(
    unit: &crate::ast::SourceUnit,
    scopes: &ScopeAnalysis,
    caller: &str,
) -> Vec<(String, CType)> {
    let f = match unit.function(caller) {
        Some(f) => f,
        None => return Vec::new(),
    };
    f.params
        .iter()
        .filter(|p| {
            let rebound = scopes
                .bindings()
                .iter()
                .filter(|b| {
                    b.function.as_deref() == Some(caller)
                        && b.namespace == NameSpace::Ordinary
                        && b.name == p.name
                })
                .count()
                > 1;
            !rebound
        })
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect()
}

struct CallRewriter<'a> {
    target: &'a str,
    old_n: usize,
    perm: &'a [usize],
    extra_types: &'a [CType],
    variable_probability: f64,
    pool: Vec<(String, CType)>,
}

impl CallRewriter<'_> {
    fn stmt(&mut self, stmt: &mut Stmt, rng: &mut StdRng) {
        match stmt {
            Stmt::Expr(e) | Stmt::Return(Some(e)) => self.expr(e, rng),
            Stmt::Decl(d) => {
                if let Some(init) = &mut d.init {
                    self.init(init, rng);
                }
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.stmt(s, rng);
                }
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond, rng);
                self.stmt(then_branch, rng);
                if let Some(e) = else_branch {
                    self.stmt(e, rng);
                }
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                self.expr(cond, rng);
                self.stmt(body, rng);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                match init.as_deref_mut() {
                    Some(ForInit::Decl(d)) => {
                        if let Some(i) = &mut d.init {
                            self.init(i, rng);
                        }
                    }
                    Some(ForInit::Expr(e)) => self.expr(e, rng),
                    None => {}
                }
                if let Some(c) = cond {
                    self.expr(c, rng);
                }
                if let Some(s) = step {
                    self.expr(s, rng);
                }
                self.stmt(body, rng);
            }
            Stmt::Switch { cond, cases } => {
                self.expr(cond, rng);
                for case in cases {
                    for s in &mut case.body {
                        self.stmt(s, rng);
                    }
                }
            }
            Stmt::Labeled { stmt, .. } => self.stmt(stmt, rng),
            Stmt::EnumDecl(_)
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Goto(_)
            | Stmt::Return(None)
            | Stmt::Empty => {}
        }
    }

    fn init(&mut self, init: &mut Initializer, rng: &mut StdRng) {
        match init {
            Initializer::Expr(e) => self.expr(e, rng),
            Initializer::List(items) => {
                for i in items {
                    self.init(i, rng);
                }
            }
        }
    }

    /// Children first, so nested calls to the target are already rewritten
    /// when their enclosing call is remapped.
    fn expr(&mut self, e: &mut Expr, rng: &mut StdRng) {
        match e {
            Expr::Unary(_, inner) | Expr::Cast { expr: inner, .. } | Expr::SizeOfExpr(inner) => {
                self.expr(inner, rng)
            }
            Expr::Binary(_, l, r) => {
                self.expr(l, rng);
                self.expr(r, rng);
            }
            Expr::Assign { target, value, .. } => {
                self.expr(target, rng);
                self.expr(value, rng);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond, rng);
                self.expr(then_expr, rng);
                self.expr(else_expr, rng);
            }
            Expr::Call { callee, args } => {
                self.expr(callee, rng);
                for a in args.iter_mut() {
                    self.expr(a, rng);
                }
                if matches!(callee.as_ref(), Expr::Ident(name) if name == self.target) {
                    self.remap_args(args, rng);
                }
            }
            Expr::Index { base, index } => {
                self.expr(base, rng);
                self.expr(index, rng);
            }
            Expr::Member { base, .. } => self.expr(base, rng),
            Expr::Comma(parts) => {
                for p in parts {
                    self.expr(p, rng);
                }
            }
            Expr::IntLit(_)
            | Expr::RealLit(_)
            | Expr::CharLit(_)
            | Expr::StrLit(_)
            | Expr::Ident(_)
            | Expr::SizeOfType(_) => {}
        }
    }

    fn remap_args(&mut self, args: &mut Vec<Expr>, rng: &mut StdRng) {
        let old_args: Vec<Expr> = std::mem::take(args);
        let mut remapped: Vec<Expr> = Vec::with_capacity(self.perm.len());
        for &old in self.perm {
            if old < self.old_n {
                // Assume valid input: calls supply every named parameter.
                remapped.push(old_args.get(old).cloned().unwrap_or(Expr::IntLit(0)));
            } else {
                remapped.push(self.spurious(&self.extra_types[old - self.old_n].clone(), rng));
            }
        }
        // Variadic extras keep their positions after the named parameters.
        remapped.extend(old_args.into_iter().skip(self.old_n));
        *args = remapped;
    }

    fn spurious(&self, ty: &CType, rng: &mut StdRng) -> Expr {
        if rng.gen::<f64>() < self.variable_probability {
            let matching: Vec<&(String, CType)> =
                self.pool.iter().filter(|(_, t)| t == ty).collect();
            if !matching.is_empty() {
                let (name, _) = matching[rng.gen_range(0..matching.len())];
                return Expr::Ident(name.clone());
            }
        }
        match ty {
            CType::Int(IntKind::Char) => Expr::CharLit(rng.gen_range(32..127)),
            CType::Real(_) => Expr::RealLit(rng.gen_range(0.0..100.0)),
            _ => Expr::IntLit(rng.gen_range(-100..=100)),
        }
    }
}
