//! Opaque predicate synthesis: augmentation of existing conditions and
//! insertion of new predicate-guarded conditionals.
//!
//! The true-predicate pool holds algebraic identities over one or two integer
//! operands. Each identity only holds while the arithmetic stays in range, so
//! every predicate is guarded by a short-circuit bound on the operand that
//! makes the whole disjunction true before any multiplication can overflow.
//! The either-pool holds unconstrained comparisons whose value is unknown;
//! both branch arms of an either-guard carry equivalent code.

use crate::analysis::{AnalysisContext, NameSpace, ScopeAnalysis};
use crate::ast::{
    BinOp, CType, Declaration, Expr, ForInit, FunctionDef, Initializer, Stmt, UnOp,
};
use crate::error::TransformError;
use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where predicate operands come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpaqueStyle {
    /// Arithmetic-typed parameters of the enclosing function.
    Input,
    /// Fresh `int` locals initialized from `rand()` at function entry.
    Entropy,
}

/// How much code one inserted predicate wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Function,
    Block,
    Statement,
}

/// The shape of an inserted conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpaqueKind {
    /// `if (true) { original }`
    Check,
    /// `if (false) { buggy } original`
    False,
    /// `if (true) { original } else { buggy }`
    ElseTrue,
    /// `if (false) { buggy } else { original }`
    ElseFalse,
    /// `while (false) { buggy } original`
    WhileFalse,
    /// `if (either) { original } else { original copy }`
    Either,
}

/// Parameters for condition augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentOpaqueParams {
    pub styles: Vec<OpaqueStyle>,
    /// Probability that any given condition is augmented.
    pub probability: f64,
    /// Predicates conjoined per augmented condition.
    pub number: u32,
}

/// Parameters for predicate insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOpaqueParams {
    pub styles: Vec<OpaqueStyle>,
    pub granularities: Vec<Granularity>,
    pub kinds: Vec<OpaqueKind>,
    /// Predicates inserted per function.
    pub number: u32,
}

/// Augment existing `if`/`while`/`do-while`/`for`/ternary conditions with
/// opaque conjuncts or disjuncts. The condition's value is preserved exactly:
/// `cond && true` or `cond || false`.
pub fn augment_opaque(
    unit: &crate::ast::SourceUnit,
    ctx: &AnalysisContext,
    params: &AugmentOpaqueParams,
    rng: &mut StdRng,
) -> Result<crate::ast::SourceUnit, TransformError> {
    let mut out = unit.clone();
    if params.styles.is_empty() {
        return Ok(out);
    }
    for f in out.functions_mut() {
        let mut cx = Operands::for_function(f, ctx.scopes(), &params.styles);
        debug!(function = %f.name, "augmenting conditions");
        let mut aug = Augmenter {
            cx: &mut cx,
            probability: params.probability,
            number: params.number,
        };
        aug.visit_stmts(&mut f.body, rng);
        cx.prepend_entropy_decls(&mut f.body);
    }
    Ok(out)
}

/// Insert new predicate-guarded conditionals, `number` per function, split
/// across the enabled granularities.
pub fn insert_opaque(
    unit: &crate::ast::SourceUnit,
    ctx: &AnalysisContext,
    params: &InsertOpaqueParams,
    rng: &mut StdRng,
) -> Result<crate::ast::SourceUnit, TransformError> {
    let mut out = unit.clone();
    if params.styles.is_empty()
        || params.granularities.is_empty()
        || params.kinds.is_empty()
        || params.number == 0
    {
        return Ok(out);
    }
    for f in out.functions_mut() {
        let taken_labels = ctx
            .scopes()
            .labels(&f.name)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();
        let mut cx = Operands::for_function(f, ctx.scopes(), &params.styles);
        let mut inserter = Inserter {
            cx: &mut cx,
            kinds: &params.kinds,
            scopes: ctx.scopes(),
            taken_labels,
        };
        debug!(function = %f.name, number = params.number, "inserting opaque predicates");

        let amounts = split_granularities(&params.granularities, params.number, rng);
        for (granularity, amount) in amounts {
            for _ in 0..amount {
                let done = match granularity {
                    Granularity::Function => inserter.insert_function(&mut f.body, rng),
                    Granularity::Block => inserter.insert_block(&mut f.body, rng),
                    Granularity::Statement => inserter.insert_statement(&mut f.body, rng),
                };
                // Block/statement insertion needs an eligible compound; when
                // none exists, wrap the whole function instead.
                if !done && granularity != Granularity::Function {
                    inserter.insert_function(&mut f.body, rng);
                }
            }
        }
        cx.prepend_entropy_decls(&mut f.body);
    }
    Ok(out)
}

/// Proportional split of `number` across the enabled granularities, 10/70/20
/// for function/block/statement, remainder assigned at random.
fn split_granularities(
    granularities: &[Granularity],
    number: u32,
    rng: &mut StdRng,
) -> Vec<(Granularity, u32)> {
    let weight = |g: Granularity| match g {
        Granularity::Function => 10u32,
        Granularity::Block => 70,
        Granularity::Statement => 20,
    };
    let total: u32 = granularities.iter().map(|&g| weight(g)).sum();
    let mut amounts: Vec<(Granularity, u32)> = granularities
        .iter()
        .map(|&g| (g, weight(g) * number / total))
        .collect();
    let mut assigned: u32 = amounts.iter().map(|(_, n)| n).sum();
    while assigned < number {
        let i = rng.gen_range(0..amounts.len());
        amounts[i].1 += 1;
        assigned += 1;
    }
    amounts
}

// ---------------------------------------------------------------------------
// Predicate pools

/// A true-predicate builder: arity, then construction from operand
/// expressions (cloned as needed).
pub struct Predicate {
    pub arity: usize,
    build: fn(&[Expr]) -> Expr,
}

impl Predicate {
    pub fn build(&self, operands: &[Expr]) -> Expr {
        debug_assert_eq!(operands.len(), self.arity);
        (self.build)(operands)
    }
}

fn lit(v: i64) -> Expr {
    Expr::IntLit(v)
}

fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
    Expr::binary(op, l, r)
}

/// Always-true identities over the guarded domain.
pub const TRUE_PREDICATES: &[Predicate] = &[
    // x > 46340 || x * x >= 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(46340)),
                bin(BinOp::Ge, bin(BinOp::Mul, x.clone(), x.clone()), lit(0)),
            )
        },
    },
    // x > 23170 || x * -x <= 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(23170)),
                bin(
                    BinOp::Le,
                    bin(
                        BinOp::Mul,
                        x.clone(),
                        Expr::Unary(UnOp::Neg, Box::new(x.clone())),
                    ),
                    lit(0),
                ),
            )
        },
    },
    // (y > 6620 && x > 46339) || 7 * (y * y) != (x * x) + 1
    Predicate {
        arity: 2,
        build: |o| {
            let (x, y) = (&o[0], &o[1]);
            bin(
                BinOp::LogOr,
                bin(
                    BinOp::LogAnd,
                    bin(BinOp::Gt, y.clone(), lit(6620)),
                    bin(BinOp::Gt, x.clone(), lit(46339)),
                ),
                bin(
                    BinOp::Ne,
                    bin(BinOp::Mul, lit(7), bin(BinOp::Mul, y.clone(), y.clone())),
                    bin(
                        BinOp::Add,
                        bin(BinOp::Mul, x.clone(), x.clone()),
                        lit(1),
                    ),
                ),
            )
        },
    },
    // (y > 6620 && x > 46339) || 7 * (y * y) - 1 != x * x
    Predicate {
        arity: 2,
        build: |o| {
            let (x, y) = (&o[0], &o[1]);
            bin(
                BinOp::LogOr,
                bin(
                    BinOp::LogAnd,
                    bin(BinOp::Gt, y.clone(), lit(6620)),
                    bin(BinOp::Gt, x.clone(), lit(46339)),
                ),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Sub,
                        bin(BinOp::Mul, lit(7), bin(BinOp::Mul, y.clone(), y.clone())),
                        lit(1),
                    ),
                    bin(BinOp::Mul, x.clone(), x.clone()),
                ),
            )
        },
    },
    // x > 46339 || (x * (x + 1)) % 2 == 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(46339)),
                bin(
                    BinOp::Eq,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Mul,
                            x.clone(),
                            bin(BinOp::Add, x.clone(), lit(1)),
                        ),
                        lit(2),
                    ),
                    lit(0),
                ),
            )
        },
    },
    // x > 46339 || (x * (1 + x)) % 2 != 1
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(46339)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Mul,
                            x.clone(),
                            bin(BinOp::Add, lit(1), x.clone()),
                        ),
                        lit(2),
                    ),
                    lit(1),
                ),
            )
        },
    },
    // x > 1280 || (x * ((x + 1) * (x + 2))) % 3 == 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(1280)),
                bin(
                    BinOp::Eq,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Mul,
                            x.clone(),
                            bin(
                                BinOp::Mul,
                                bin(BinOp::Add, x.clone(), lit(1)),
                                bin(BinOp::Add, x.clone(), lit(2)),
                            ),
                        ),
                        lit(3),
                    ),
                    lit(0),
                ),
            )
        },
    },
    // x > 1200 || ((x + 1) * (x * (x + 2))) % 3 != 1
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(1200)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Mul,
                            bin(BinOp::Add, x.clone(), lit(1)),
                            bin(
                                BinOp::Mul,
                                x.clone(),
                                bin(BinOp::Add, x.clone(), lit(2)),
                            ),
                        ),
                        lit(3),
                    ),
                    lit(1),
                ),
            )
        },
    },
    // x > 1200 || ((x + 2) * ((x + 1) * x)) % 3 != 2
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(1200)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Mul,
                            bin(BinOp::Add, x.clone(), lit(2)),
                            bin(
                                BinOp::Mul,
                                bin(BinOp::Add, x.clone(), lit(1)),
                                x.clone(),
                            ),
                        ),
                        lit(3),
                    ),
                    lit(2),
                ),
            )
        },
    },
    // x > 6620 || ((7 * x) * x + 1) % 7 != 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(6620)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Add,
                            bin(BinOp::Mul, bin(BinOp::Mul, lit(7), x.clone()), x.clone()),
                            lit(1),
                        ),
                        lit(7),
                    ),
                    lit(0),
                ),
            )
        },
    },
    // x > 46000 || ((x * x) + x + 7) % 81 != 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(46000)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Add,
                            bin(
                                BinOp::Add,
                                bin(BinOp::Mul, x.clone(), x.clone()),
                                x.clone(),
                            ),
                            lit(7),
                        ),
                        lit(81),
                    ),
                    lit(0),
                ),
            )
        },
    },
    // x > 46000 || (((x + 1) * x) + 7) % 81 != 0
    Predicate {
        arity: 1,
        build: |o| {
            let x = &o[0];
            bin(
                BinOp::LogOr,
                bin(BinOp::Gt, x.clone(), lit(46000)),
                bin(
                    BinOp::Ne,
                    bin(
                        BinOp::Rem,
                        bin(
                            BinOp::Add,
                            bin(BinOp::Mul, bin(BinOp::Add, x.clone(), lit(1)), x.clone()),
                            lit(7),
                        ),
                        lit(81),
                    ),
                    lit(0),
                ),
            )
        },
    },
];

const COMPARISON_OPS: &[BinOp] = &[
    BinOp::Gt,
    BinOp::Ge,
    BinOp::Lt,
    BinOp::Le,
    BinOp::Eq,
    BinOp::Ne,
];

// Division and remainder stay out: a zero operand would trap at runtime,
// and either-guards evaluate their condition on the live path.
const SAFE_ARITHMETIC_OPS: &[BinOp] = &[BinOp::Add, BinOp::Sub, BinOp::Mul];

fn either_arity(choice: usize) -> usize {
    match choice {
        0..=3 => 1,
        4 => 2,
        _ => 3,
    }
}

fn pick<'a, T>(rng: &mut StdRng, items: &'a [T]) -> &'a T {
    &items[rng.gen_range(0..items.len())]
}

/// Logical negation with De Morgan rewriting instead of a blanket `!`.
pub fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Binary(BinOp::Eq, l, r) => Expr::Binary(BinOp::Ne, l, r),
        Expr::Binary(BinOp::Ne, l, r) => Expr::Binary(BinOp::Eq, l, r),
        Expr::Binary(BinOp::LogAnd, l, r) => {
            Expr::Binary(BinOp::LogOr, Box::new(negate(*l)), Box::new(negate(*r)))
        }
        Expr::Binary(BinOp::LogOr, l, r) => {
            Expr::Binary(BinOp::LogAnd, Box::new(negate(*l)), Box::new(negate(*r)))
        }
        other => Expr::Unary(UnOp::Not, Box::new(other)),
    }
}

// ---------------------------------------------------------------------------
// Operand selection

/// Per-function operand source shared by both opaque transforms.
struct Operands<'a> {
    styles: &'a [OpaqueStyle],
    /// Arithmetic-typed parameters: name plus whether a cast to int is needed.
    params: Vec<(String, bool)>,
    entropic: Vec<String>,
    pending_decls: Vec<Stmt>,
    taken: FxHashSet<String>,
    scopes: &'a ScopeAnalysis,
}

impl<'a> Operands<'a> {
    fn for_function(
        f: &FunctionDef,
        scopes: &'a ScopeAnalysis,
        styles: &'a [OpaqueStyle],
    ) -> Operands<'a> {
        let params = f
            .params
            .iter()
            .filter_map(|p| {
                let resolved = resolve_named(scopes, &p.ty);
                if resolved.is_arithmetic() {
                    Some((p.name.clone(), resolved.is_real()))
                } else {
                    None
                }
            })
            .collect();
        Operands {
            styles,
            params,
            entropic: Vec::new(),
            pending_decls: Vec::new(),
            taken: FxHashSet::default(),
            scopes,
        }
    }

    /// Pick `arity` distinct operand expressions, creating entropy locals as
    /// needed. `None` when no enabled style can supply another operand.
    fn pick(&mut self, arity: usize, rng: &mut StdRng) -> Option<Vec<Expr>> {
        let mut used: Vec<String> = Vec::new();
        let mut out = Vec::with_capacity(arity);
        while out.len() < arity {
            let style = self.pick_style(&used, rng)?;
            match style {
                OpaqueStyle::Input => {
                    let unused: Vec<&(String, bool)> = self
                        .params
                        .iter()
                        .filter(|(n, _)| !used.iter().any(|u| u == n))
                        .collect();
                    let &(ref name, is_real) = *pick(rng, &unused);
                    let ident = Expr::Ident(name.clone());
                    out.push(if is_real {
                        Expr::Cast {
                            ty: CType::int(),
                            expr: Box::new(ident),
                        }
                    } else {
                        ident
                    });
                    used.push(name.clone());
                }
                OpaqueStyle::Entropy => {
                    let available: Vec<String> = self
                        .entropic
                        .iter()
                        .filter(|n| !used.iter().any(|u| &u == n))
                        .cloned()
                        .collect();
                    let fresh = available.is_empty() || rng.gen::<f64>() >= 0.75;
                    let name = if fresh {
                        let name = self.scopes.fresh_name("ent", NameSpace::Ordinary, &self.taken);
                        self.taken.insert(name.clone());
                        self.entropic.push(name.clone());
                        self.pending_decls.push(Stmt::Decl(Declaration::new(
                            &name,
                            CType::int(),
                            Some(Initializer::Expr(Expr::call("rand", vec![]))),
                        )));
                        name
                    } else {
                        pick(rng, &available).clone()
                    };
                    out.push(Expr::Ident(name.clone()));
                    used.push(name);
                }
            }
        }
        Some(out)
    }

    fn pick_style(&self, used: &[String], rng: &mut StdRng) -> Option<OpaqueStyle> {
        let mut candidates: Vec<OpaqueStyle> = self.styles.to_vec();
        while !candidates.is_empty() {
            let style = candidates.remove(rng.gen_range(0..candidates.len()));
            let valid = match style {
                OpaqueStyle::Input => self
                    .params
                    .iter()
                    .any(|(n, _)| !used.iter().any(|u| u == n)),
                OpaqueStyle::Entropy => true,
            };
            if valid {
                return Some(style);
            }
        }
        None
    }

    /// Build a true-valued condition from the pool.
    fn true_condition(&mut self, rng: &mut StdRng) -> Option<Expr> {
        let predicate = &TRUE_PREDICATES[rng.gen_range(0..TRUE_PREDICATES.len())];
        let operands = self.pick(predicate.arity, rng)?;
        Some(predicate.build(&operands))
    }

    /// Build an either-valued condition from the pool.
    fn either_condition(&mut self, rng: &mut StdRng) -> Option<Expr> {
        let choice = rng.gen_range(0..7usize);
        let operands = self.pick(either_arity(choice), rng)?;
        Some(either_predicate(choice, rng, &operands))
    }

    fn prepend_entropy_decls(&mut self, body: &mut Vec<Stmt>) {
        if !self.pending_decls.is_empty() {
            let mut new_body = std::mem::take(&mut self.pending_decls);
            new_body.append(body);
            *body = new_body;
        }
    }
}

/// Build an either-valued predicate for a pre-drawn shape. The shape is
/// chosen before the operands so the arity is known up front.
fn either_predicate(choice: usize, rng: &mut StdRng, operands: &[Expr]) -> Expr {
    let x = operands[0].clone();
    match choice {
        0 => x,
        1 => Expr::Unary(UnOp::Not, Box::new(x)),
        2 => bin(*pick(rng, COMPARISON_OPS), x, lit(0)),
        3 => bin(*pick(rng, COMPARISON_OPS), x, lit(rng.gen_range(-25..=25))),
        4 => bin(*pick(rng, COMPARISON_OPS), x, operands[1].clone()),
        5 => bin(
            *pick(rng, &[BinOp::LogAnd, BinOp::LogOr]),
            bin(*pick(rng, COMPARISON_OPS), x, operands[1].clone()),
            bin(
                *pick(rng, COMPARISON_OPS),
                operands[1].clone(),
                operands[2].clone(),
            ),
        ),
        _ => bin(
            *pick(rng, COMPARISON_OPS),
            bin(*pick(rng, SAFE_ARITHMETIC_OPS), x, operands[1].clone()),
            operands[2].clone(),
        ),
    }
}

/// Resolve typedef names down to a concrete type. Cycle-capped.
fn resolve_named<'a>(scopes: &'a ScopeAnalysis, ty: &'a CType) -> &'a CType {
    let mut cur = ty;
    for _ in 0..32 {
        match cur {
            CType::Named(name) => {
                let next = scopes.bindings().iter().find(|b| {
                    b.kind == crate::analysis::BindingKind::Typedef && b.name == *name
                });
                match next.and_then(|b| b.ty.as_ref()) {
                    Some(t) => cur = t,
                    None => return cur,
                }
            }
            _ => return cur,
        }
    }
    cur
}

// ---------------------------------------------------------------------------
// Augmentation

struct Augmenter<'a, 'b> {
    cx: &'a mut Operands<'b>,
    probability: f64,
    number: u32,
}

impl Augmenter<'_, '_> {
    fn visit_stmts(&mut self, stmts: &mut [Stmt], rng: &mut StdRng) {
        for stmt in stmts {
            self.visit_stmt(stmt, rng);
        }
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt, rng: &mut StdRng) {
        match stmt {
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.maybe_augment(cond, rng);
                self.visit_expr(cond, rng);
                self.visit_stmt(then_branch, rng);
                if let Some(e) = else_branch {
                    self.visit_stmt(e, rng);
                }
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                self.maybe_augment(cond, rng);
                self.visit_expr(cond, rng);
                self.visit_stmt(body, rng);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(cond) = cond {
                    self.maybe_augment(cond, rng);
                    self.visit_expr(cond, rng);
                }
                if let Some(ForInit::Expr(e)) = init.as_deref_mut() {
                    self.visit_expr(e, rng);
                }
                if let Some(step) = step {
                    self.visit_expr(step, rng);
                }
                self.visit_stmt(body, rng);
            }
            Stmt::Expr(e) | Stmt::Return(Some(e)) => self.visit_expr(e, rng),
            Stmt::Decl(d) => {
                if let Some(Initializer::Expr(e)) = &mut d.init {
                    self.visit_expr(e, rng);
                }
            }
            Stmt::Compound(stmts) => self.visit_stmts(stmts, rng),
            Stmt::Switch { cond, cases } => {
                self.visit_expr(cond, rng);
                for case in cases {
                    self.visit_stmts(&mut case.body, rng);
                }
            }
            Stmt::Labeled { stmt, .. } => self.visit_stmt(stmt, rng),
            Stmt::EnumDecl(_)
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Goto(_)
            | Stmt::Return(None)
            | Stmt::Empty => {}
        }
    }

    /// Ternary conditions are augmentable too.
    fn visit_expr(&mut self, e: &mut Expr, rng: &mut StdRng) {
        if let Expr::Conditional { cond, .. } = e {
            self.maybe_augment(cond, rng);
        }
        match e {
            Expr::Unary(_, inner) | Expr::Cast { expr: inner, .. } | Expr::SizeOfExpr(inner) => {
                self.visit_expr(inner, rng)
            }
            Expr::Binary(_, l, r) => {
                self.visit_expr(l, rng);
                self.visit_expr(r, rng);
            }
            Expr::Assign { target, value, .. } => {
                self.visit_expr(target, rng);
                self.visit_expr(value, rng);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.visit_expr(cond, rng);
                self.visit_expr(then_expr, rng);
                self.visit_expr(else_expr, rng);
            }
            Expr::Call { callee, args } => {
                self.visit_expr(callee, rng);
                for a in args {
                    self.visit_expr(a, rng);
                }
            }
            Expr::Index { base, index } => {
                self.visit_expr(base, rng);
                self.visit_expr(index, rng);
            }
            Expr::Member { base, .. } => self.visit_expr(base, rng),
            Expr::Comma(parts) => {
                for p in parts {
                    self.visit_expr(p, rng);
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

    fn maybe_augment(&mut self, cond: &mut Expr, rng: &mut StdRng) {
        if rng.gen::<f64>() >= self.probability {
            return;
        }
        for _ in 0..self.number {
            let opaque = match self.cx.true_condition(rng) {
                Some(p) => p,
                None => return,
            };
            let old = std::mem::replace(cond, Expr::IntLit(0));
            let is_true = rng.gen_bool(0.5);
            let is_before = rng.gen_bool(0.5);
            *cond = if is_true {
                if is_before {
                    bin(BinOp::LogAnd, opaque, old)
                } else {
                    bin(BinOp::LogAnd, old, opaque)
                }
            } else {
                let opaque = negate(opaque);
                if is_before {
                    bin(BinOp::LogOr, opaque, old)
                } else {
                    bin(BinOp::LogOr, old, opaque)
                }
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Insertion

struct Inserter<'a, 'b> {
    cx: &'a mut Operands<'b>,
    kinds: &'a [OpaqueKind],
    scopes: &'a ScopeAnalysis,
    taken_labels: FxHashSet<String>,
}

impl Inserter<'_, '_> {
    /// Wrap the whole function body.
    fn insert_function(&mut self, body: &mut Vec<Stmt>, rng: &mut StdRng) -> bool {
        let seg = std::mem::take(body);
        match self.wrap(seg, rng) {
            Some(wrapped) => {
                *body = wrapped;
                true
            }
            None => false,
        }
    }

    /// Wrap a random maximal run of consecutive wrappable statements inside a
    /// random eligible compound.
    fn insert_block(&mut self, body: &mut Vec<Stmt>, rng: &mut StdRng) -> bool {
        self.insert_in_compound(body, rng, true)
    }

    /// Wrap one random wrappable statement.
    fn insert_statement(&mut self, body: &mut Vec<Stmt>, rng: &mut StdRng) -> bool {
        self.insert_in_compound(body, rng, false)
    }

    fn insert_in_compound(&mut self, body: &mut Vec<Stmt>, rng: &mut StdRng, run: bool) -> bool {
        let eligible = count_compounds(body, |stmts| stmts.iter().any(is_wrappable));
        if eligible == 0 {
            return false;
        }
        let target = rng.gen_range(0..eligible);
        let mut seen = 0usize;
        let mut done = false;
        for_each_compound(body, &mut |stmts| {
            if done || !stmts.iter().any(is_wrappable) {
                return;
            }
            if seen != target {
                seen += 1;
                return;
            }
            seen += 1;
            done = true;

            let runs = wrappable_runs(stmts);
            let (start, end) = if run {
                *pick(rng, &runs)
            } else {
                // A single statement: any index inside any run.
                let flat: Vec<usize> = runs.iter().flat_map(|&(s, e)| s..=e).collect();
                let i = *pick(rng, &flat);
                (i, i)
            };
            let seg: Vec<Stmt> = stmts.splice(start..=end, std::iter::empty()).collect();
            match self.wrap(seg, rng) {
                Some(wrapped) => {
                    stmts.splice(start..start, wrapped);
                }
                None => {
                    // Condition synthesis failed; put the code back.
                }
            }
        });
        done
    }

    fn wrap(&mut self, seg: Vec<Stmt>, rng: &mut StdRng) -> Option<Vec<Stmt>> {
        // Failed wrapping must not lose the segment.
        let kind = *pick(rng, self.kinds);
        let cond = match kind {
            OpaqueKind::Either => self.cx.either_condition(rng),
            _ => self.cx.true_condition(rng),
        };
        let cond = match cond {
            Some(c) => c,
            None => return Some(seg),
        };
        let guarded = |cond: Expr, then: Vec<Stmt>, els: Option<Vec<Stmt>>| Stmt::If {
            cond,
            then_branch: Box::new(Stmt::Compound(then)),
            else_branch: els.map(|e| Box::new(Stmt::Compound(e))),
        };
        Some(match kind {
            OpaqueKind::Check => vec![guarded(cond, seg, None)],
            OpaqueKind::False => {
                let buggy = self.buggy_clone(&seg, rng);
                let mut out = vec![guarded(negate(cond), buggy, None)];
                out.extend(seg);
                out
            }
            OpaqueKind::ElseTrue => {
                let buggy = self.buggy_clone(&seg, rng);
                vec![guarded(cond, seg, Some(buggy))]
            }
            OpaqueKind::ElseFalse => {
                let buggy = self.buggy_clone(&seg, rng);
                vec![guarded(negate(cond), buggy, Some(seg))]
            }
            OpaqueKind::WhileFalse => {
                let buggy = self.buggy_clone(&seg, rng);
                let mut out = vec![Stmt::While {
                    cond: negate(cond),
                    body: Box::new(Stmt::Compound(buggy)),
                }];
                out.extend(seg);
                out
            }
            OpaqueKind::Either => {
                let mut copy = seg.clone();
                self.rename_labels(&mut copy, rng);
                vec![guarded(cond, seg, Some(copy))]
            }
        })
    }

    fn buggy_clone(&mut self, seg: &[Stmt], rng: &mut StdRng) -> Vec<Stmt> {
        let mut copy: Vec<Stmt> = seg.to_vec();
        let mut bugs = BugGenerator::new();
        for stmt in &mut copy {
            bugs.visit_stmt(stmt, rng);
        }
        self.rename_labels(&mut copy, rng);
        copy
    }

    /// Rename every label definition in the copy so the function-wide label
    /// namespace stays collision-free. Gotos keep their targets; they resolve
    /// to the surviving original labels.
    fn rename_labels(&mut self, stmts: &mut [Stmt], _rng: &mut StdRng) {
        for stmt in stmts {
            self.rename_labels_stmt(stmt);
        }
    }

    fn rename_labels_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Labeled { label, stmt } => {
                let fresh = self
                    .scopes
                    .fresh_name("dup", NameSpace::Label, &self.taken_labels);
                self.taken_labels.insert(fresh.clone());
                *label = fresh;
                self.rename_labels_stmt(stmt);
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.rename_labels_stmt(s);
                }
            }
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.rename_labels_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.rename_labels_stmt(e);
                }
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
                self.rename_labels_stmt(body);
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    for s in &mut case.body {
                        self.rename_labels_stmt(s);
                    }
                }
            }
            _ => {}
        }
    }
}

fn is_wrappable(stmt: &Stmt) -> bool {
    !matches!(
        stmt,
        Stmt::Decl(_) | Stmt::EnumDecl(_) | Stmt::Labeled { .. } | Stmt::Empty
    )
}

/// Maximal runs of consecutive wrappable statements.
fn wrappable_runs(stmts: &[Stmt]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (i, stmt) in stmts.iter().enumerate() {
        if is_wrappable(stmt) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            runs.push((s, i - 1));
        }
    }
    if let Some(s) = start {
        runs.push((s, stmts.len() - 1));
    }
    runs
}

/// Visit every statement list in the function in preorder: the body itself,
/// nested compounds, branch and loop bodies, and switch case bodies.
fn for_each_compound(stmts: &mut Vec<Stmt>, f: &mut impl FnMut(&mut Vec<Stmt>)) {
    f(stmts);
    for stmt in stmts {
        for_each_compound_stmt(stmt, f);
    }
}

fn for_each_compound_stmt(stmt: &mut Stmt, f: &mut impl FnMut(&mut Vec<Stmt>)) {
    match stmt {
        Stmt::Compound(stmts) => for_each_compound(stmts, f),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            for_each_compound_stmt(then_branch, f);
            if let Some(e) = else_branch {
                for_each_compound_stmt(e, f);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            for_each_compound_stmt(body, f);
        }
        Stmt::Switch { cases, .. } => {
            for case in cases {
                f(&mut case.body);
                for s in &mut case.body {
                    for_each_compound_stmt(s, f);
                }
            }
        }
        Stmt::Labeled { stmt, .. } => for_each_compound_stmt(stmt, f),
        _ => {}
    }
}

fn count_compounds(stmts: &mut Vec<Stmt>, pred: impl Fn(&[Stmt]) -> bool) -> usize {
    let mut count = 0;
    for_each_compound(stmts, &mut |s| {
        if pred(s) {
            count += 1;
        }
    });
    count
}

// ---------------------------------------------------------------------------
// Bug generation

/// Perturbs a cloned statement so a dead branch carries plausible but wrong
/// code: non-zero constants drift, comparison and arithmetic operators flip.
/// At least one change is guaranteed when any candidate exists. Switch case
/// label values are never touched.
struct BugGenerator {
    p_replace_op: f64,
    p_change_constants: f64,
    changed: bool,
}

impl BugGenerator {
    fn new() -> BugGenerator {
        BugGenerator {
            p_replace_op: 0.5,
            p_change_constants: 0.4,
            changed: false,
        }
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt, rng: &mut StdRng) {
        match stmt {
            Stmt::Expr(e) | Stmt::Return(Some(e)) => self.visit_expr(e, rng),
            Stmt::Decl(d) => {
                if let Some(init) = &mut d.init {
                    self.visit_init(init, rng);
                }
            }
            Stmt::Compound(stmts) => {
                for s in stmts {
                    self.visit_stmt(s, rng);
                }
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.visit_expr(cond, rng);
                self.visit_stmt(then_branch, rng);
                if let Some(e) = else_branch {
                    self.visit_stmt(e, rng);
                }
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                self.visit_expr(cond, rng);
                self.visit_stmt(body, rng);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                match init.as_deref_mut() {
                    Some(ForInit::Decl(d)) => {
                        if let Some(init) = &mut d.init {
                            self.visit_init(init, rng);
                        }
                    }
                    Some(ForInit::Expr(e)) => self.visit_expr(e, rng),
                    None => {}
                }
                if let Some(c) = cond {
                    self.visit_expr(c, rng);
                }
                if let Some(s) = step {
                    self.visit_expr(s, rng);
                }
                self.visit_stmt(body, rng);
            }
            Stmt::Switch { cond, cases } => {
                self.visit_expr(cond, rng);
                // Case label expressions stay intact; duplicated or shifted
                // labels would not compile.
                for case in cases {
                    for s in &mut case.body {
                        self.visit_stmt(s, rng);
                    }
                }
            }
            Stmt::Labeled { stmt, .. } => self.visit_stmt(stmt, rng),
            Stmt::EnumDecl(_)
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Goto(_)
            | Stmt::Return(None)
            | Stmt::Empty => {}
        }
    }

    fn visit_init(&mut self, init: &mut Initializer, rng: &mut StdRng) {
        match init {
            Initializer::Expr(e) => self.visit_expr(e, rng),
            Initializer::List(items) => {
                for i in items {
                    self.visit_init(i, rng);
                }
            }
        }
    }

    fn visit_expr(&mut self, e: &mut Expr, rng: &mut StdRng) {
        match e {
            Expr::IntLit(v) => {
                if *v != 0 && (!self.changed || rng.gen::<f64>() < self.p_change_constants) {
                    let delta = *pick(rng, &[-3i64, -2, -1, 1, 2, 3]);
                    *v = std::cmp::max(1, *v + delta);
                    self.changed = true;
                }
            }
            Expr::RealLit(v) => {
                if *v != 0.0 && (!self.changed || rng.gen::<f64>() < self.p_change_constants) {
                    *v += rng.gen::<f64>();
                    self.changed = true;
                }
            }
            Expr::CharLit(c) => {
                if !self.changed || rng.gen::<f64>() < self.p_change_constants {
                    *c = c.wrapping_add(1);
                    self.changed = true;
                }
            }
            Expr::Binary(op, l, r) => {
                if let Some(choices) = flipped_ops(*op) {
                    if !self.changed || rng.gen::<f64>() < self.p_replace_op {
                        *op = *pick(rng, choices);
                        self.changed = true;
                    }
                }
                self.visit_expr(l, rng);
                self.visit_expr(r, rng);
            }
            Expr::Unary(_, inner) | Expr::Cast { expr: inner, .. } | Expr::SizeOfExpr(inner) => {
                self.visit_expr(inner, rng)
            }
            Expr::Assign { target, value, .. } => {
                self.visit_expr(target, rng);
                self.visit_expr(value, rng);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.visit_expr(cond, rng);
                self.visit_expr(then_expr, rng);
                self.visit_expr(else_expr, rng);
            }
            Expr::Call { callee, args } => {
                self.visit_expr(callee, rng);
                for a in args {
                    self.visit_expr(a, rng);
                }
            }
            Expr::Index { base, index } => {
                self.visit_expr(base, rng);
                self.visit_expr(index, rng);
            }
            Expr::Member { base, .. } => self.visit_expr(base, rng),
            Expr::Comma(parts) => {
                for p in parts {
                    self.visit_expr(p, rng);
                }
            }
            Expr::StrLit(_) | Expr::Ident(_) | Expr::SizeOfType(_) => {}
        }
    }
}

fn flipped_ops(op: BinOp) -> Option<&'static [BinOp]> {
    match op {
        BinOp::Gt | BinOp::Ge => Some(&[BinOp::Lt, BinOp::Le, BinOp::Ne, BinOp::Eq]),
        BinOp::Lt | BinOp::Le => Some(&[BinOp::Gt, BinOp::Ge, BinOp::Ne, BinOp::Eq]),
        BinOp::Add => Some(&[BinOp::Sub]),
        BinOp::Sub => Some(&[BinOp::Add]),
        BinOp::Mul => Some(&[BinOp::Add, BinOp::Sub]),
        BinOp::Eq => Some(&[BinOp::Ne, BinOp::Lt, BinOp::Gt]),
        BinOp::Ne => Some(&[BinOp::Eq, BinOp::Lt, BinOp::Gt]),
        BinOp::LogAnd => Some(&[BinOp::LogOr]),
        BinOp::LogOr => Some(&[BinOp::LogAnd]),
        _ => None,
    }
}
