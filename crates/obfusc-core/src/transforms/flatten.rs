//! Control-flow flattening.
//!
//! Each function is rebuilt as a state machine driven by its control flow
//! graph: one dispatch case per reachable block, a state variable selecting
//! the next case, and every structured jump lowered to a state assignment.
//! Declarations hoist to the function entry first so every name stays visible
//! from every case; shadowed locals are renamed apart beforehand since entry
//! hoisting collapses their scopes into one.

use crate::analysis::{AnalysisContext, BlockId, Cfg, NameSpace, ScopeAnalysis, Terminator};
use crate::ast::{
    BinOp, CaseLabel, CType, Declaration, EnumDef, Expr, ForInit, FunctionDef, Initializer,
    Stmt, SwitchCase,
};
use crate::error::{PreconditionViolation, TransformError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How dispatch case values are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseIdStyle {
    /// `0..n` in source order.
    Sequential,
    /// Distinct random integers from a power-of-two range that widens with
    /// the case count.
    RandomInt,
    /// A fresh `enum` of synthesized names; the state variable takes the
    /// enum type.
    Enumerator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenParams {
    pub style: CaseIdStyle,
    pub randomize_case_order: bool,
}

/// Flatten every function in the unit into dispatch-loop form.
pub fn flatten_control_flow(
    unit: &crate::ast::SourceUnit,
    ctx: &AnalysisContext,
    params: &FlattenParams,
    rng: &mut StdRng,
) -> Result<crate::ast::SourceUnit, TransformError> {
    let mut out = unit.clone();
    for f in out.functions_mut() {
        flatten_function(f, ctx.scopes(), params, rng)?;
    }
    Ok(out)
}

fn flatten_function(
    f: &mut FunctionDef,
    scopes: &ScopeAnalysis,
    params: &FlattenParams,
    rng: &mut StdRng,
) -> Result<(), TransformError> {
    let mut taken: FxHashSet<String> = FxHashSet::default();
    rename_shadowed_locals(f, scopes, &mut taken);

    let cfg = Cfg::build(f);
    let code_blocks = reachable_code_blocks(&cfg);
    debug!(function = %f.name, blocks = code_blocks.len(), "flattening");

    // Hoist declarations out of every reachable block.
    let mut hoister = Hoister {
        function: f.name.clone(),
        entry: Vec::new(),
        hoisted: FxHashSet::default(),
        vla_names: Vec::new(),
    };
    let mut case_stmts: FxHashMap<BlockId, Vec<Stmt>> = FxHashMap::default();
    for &id in &code_blocks {
        let stmts = hoister.hoist(cfg.block(id).stmts.clone())?;
        case_stmts.insert(id, stmts);
    }

    let ids = CaseIds::assign(params.style, &code_blocks, scopes, &mut taken, rng);
    let state = scopes.fresh_name("state", NameSpace::Ordinary, &taken);
    taken.insert(state.clone());

    if params.randomize_case_order {
        verify_case_order(f, &cfg, &code_blocks, &case_stmts, &hoister, &ids, &state, scopes)?;
    }

    // Assemble dispatch cases: block statements, then the terminator lowered
    // to state assignments.
    let mut cases: Vec<SwitchCase> = Vec::with_capacity(code_blocks.len());
    for &id in &code_blocks {
        let mut body = case_stmts.remove(&id).unwrap_or_default();
        lower_terminator(&cfg.block(id).terminator, &ids, &state, &mut body);
        cases.push(SwitchCase {
            label: CaseLabel::Case(ids.of(id)),
            body,
        });
    }
    if params.randomize_case_order {
        cases.shuffle(rng);
    }

    let entry_target = cfg.block(BlockId::ENTRY).terminator.targets()[0];
    let mut body: Vec<Stmt> = Vec::new();
    if let Some(def) = ids.enum_def.clone() {
        body.push(Stmt::EnumDecl(def));
    }
    body.append(&mut hoister.entry);
    body.push(Stmt::Decl(Declaration::new(
        &state,
        ids.state_ty.clone(),
        Some(Initializer::Expr(ids.of(entry_target))),
    )));
    body.push(Stmt::While {
        cond: Expr::binary(BinOp::Ne, Expr::Ident(state.clone()), ids.exit.clone()),
        body: Box::new(Stmt::Compound(vec![Stmt::Switch {
            cond: Expr::Ident(state),
            cases,
        }])),
    });
    f.body = body;
    Ok(())
}

/// Reachable blocks excluding the ENTRY/EXIT sentinels, in source order.
fn reachable_code_blocks(cfg: &Cfg) -> Vec<BlockId> {
    let mut blocks: Vec<BlockId> = cfg
        .reachable_blocks()
        .into_iter()
        .filter(|&id| id != BlockId::ENTRY && id != BlockId::EXIT)
        .collect();
    blocks.sort_by_key(|b| b.0);
    blocks
}

/// Lower a block terminator into trailing case statements.
fn lower_terminator(term: &Terminator, ids: &CaseIds, state: &str, out: &mut Vec<Stmt>) {
    let set_state = |target: BlockId| {
        Stmt::Expr(Expr::assign(Expr::Ident(state.to_string()), ids.of(target)))
    };
    match term {
        Terminator::FallThrough(t) | Terminator::Jump(t) => {
            out.push(set_state(*t));
            out.push(Stmt::Break);
        }
        Terminator::Branch {
            cond,
            then_target,
            else_target,
        } => {
            out.push(Stmt::If {
                cond: cond.clone(),
                then_branch: Box::new(Stmt::Compound(vec![set_state(*then_target)])),
                else_branch: Some(Box::new(Stmt::Compound(vec![set_state(*else_target)]))),
            });
            out.push(Stmt::Break);
        }
        Terminator::SwitchDispatch {
            scrutinee,
            cases,
            default,
        } => {
            // The inner switch's breaks bind to it; control then reaches the
            // outer break.
            let mut arms: Vec<SwitchCase> = cases
                .iter()
                .map(|(value, target)| SwitchCase {
                    label: CaseLabel::Case(value.clone()),
                    body: vec![set_state(*target), Stmt::Break],
                })
                .collect();
            arms.push(SwitchCase {
                label: CaseLabel::Default,
                body: vec![set_state(*default), Stmt::Break],
            });
            out.push(Stmt::Switch {
                cond: scrutinee.clone(),
                cases: arms,
            });
            out.push(Stmt::Break);
        }
        Terminator::Return(value) => out.push(Stmt::Return(value.clone())),
        Terminator::Unreachable => out.push(Stmt::Break),
    }
}

// ---------------------------------------------------------------------------
// Case ids

struct CaseIds {
    by_block: FxHashMap<BlockId, Expr>,
    exit: Expr,
    state_ty: CType,
    enum_def: Option<EnumDef>,
}

impl CaseIds {
    fn of(&self, id: BlockId) -> Expr {
        match self.by_block.get(&id) {
            Some(e) => e.clone(),
            // Only EXIT is absent from the map.
            None => self.exit.clone(),
        }
    }

    fn assign(
        style: CaseIdStyle,
        blocks: &[BlockId],
        scopes: &ScopeAnalysis,
        taken: &mut FxHashSet<String>,
        rng: &mut StdRng,
    ) -> CaseIds {
        let n = blocks.len();
        match style {
            CaseIdStyle::Sequential => {
                let by_block = blocks
                    .iter()
                    .enumerate()
                    .map(|(i, &b)| (b, Expr::IntLit(i as i64)))
                    .collect();
                CaseIds {
                    by_block,
                    exit: Expr::IntLit(n as i64),
                    state_ty: CType::int(),
                    enum_def: None,
                }
            }
            CaseIdStyle::RandomInt => {
                let values = distinct_random_ids(n + 1, rng);
                let by_block = blocks
                    .iter()
                    .zip(&values)
                    .map(|(&b, &v)| (b, Expr::IntLit(v)))
                    .collect();
                CaseIds {
                    by_block,
                    exit: Expr::IntLit(values[n]),
                    state_ty: CType::int(),
                    enum_def: None,
                }
            }
            CaseIdStyle::Enumerator => {
                let tag = scopes.fresh_name("states", NameSpace::Tag, taken);
                taken.insert(tag.clone());
                let mut enumerators = Vec::with_capacity(n + 1);
                for _ in 0..=n {
                    let name = scopes.fresh_name("st", NameSpace::Ordinary, taken);
                    taken.insert(name.clone());
                    enumerators.push(name);
                }
                let by_block = blocks
                    .iter()
                    .zip(&enumerators)
                    .map(|(&b, name)| (b, Expr::Ident(name.clone())))
                    .collect();
                CaseIds {
                    by_block,
                    exit: Expr::Ident(enumerators[n].clone()),
                    state_ty: CType::Enum(tag.clone()),
                    enum_def: Some(EnumDef { tag, enumerators }),
                }
            }
        }
    }
}

/// `count` distinct non-negative integers drawn from a range of
/// `2^(floor(log2(count)) + 3)` values, doubled whenever draws keep
/// colliding.
fn distinct_random_ids(count: usize, rng: &mut StdRng) -> Vec<i64> {
    let log2 = 63 - (count.max(1) as u64).leading_zeros();
    let mut range: i64 = 1i64 << (log2 + 3);
    let mut seen: FxHashSet<i64> = FxHashSet::default();
    let mut out = Vec::with_capacity(count);
    let mut misses = 0u32;
    while out.len() < count {
        let v = rng.gen_range(0..range);
        if seen.insert(v) {
            out.push(v);
            misses = 0;
        } else {
            misses += 1;
            if misses > 8 {
                range *= 2;
                misses = 0;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Declaration hoisting

struct Hoister {
    function: String,
    entry: Vec<Stmt>,
    hoisted: FxHashSet<String>,
    vla_names: Vec<String>,
}

impl Hoister {
    /// Rewrite one block's statements: declarations move to the entry list,
    /// leaving an assignment at the original point when there was an
    /// initializer.
    fn hoist(&mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>, PreconditionViolation> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match stmt {
                Stmt::Decl(d) => self.hoist_decl(d, &mut out)?,
                Stmt::EnumDecl(def) => self.entry.push(Stmt::EnumDecl(def)),
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn hoist_decl(
        &mut self,
        mut d: Declaration,
        out: &mut Vec<Stmt>,
    ) -> Result<(), PreconditionViolation> {
        if d.is_const && d.ty.is_array() && d.init.is_some() {
            return Err(PreconditionViolation::ConstArrayInitializer {
                function: self.function.clone(),
                name: d.name,
            });
        }
        self.hoisted.insert(d.name.clone());

        if d.ty.is_vla() {
            // The length is only known at the original point: hoist a
            // pointer and allocate there.
            let (elem, size) = vla_allocation(&d.ty);
            self.entry.push(Stmt::Decl(Declaration::new(
                &d.name,
                CType::Pointer(Box::new(elem)),
                None,
            )));
            out.push(Stmt::Expr(Expr::assign(
                Expr::Ident(d.name.clone()),
                Expr::call("alloca", vec![size]),
            )));
            self.vla_names.push(d.name);
            return Ok(());
        }

        let init = d.init.take();
        match (&d.ty, init) {
            (CType::Array { elem, len }, Some(Initializer::List(items))) => {
                // An unsized array takes its length from the initializer.
                let len = match len {
                    Some(l) => Some(l.clone()),
                    None => Some(Box::new(Expr::IntLit(items.len() as i64))),
                };
                self.entry.push(Stmt::Decl(Declaration::new(
                    &d.name,
                    CType::Array {
                        elem: elem.clone(),
                        len,
                    },
                    None,
                )));
                element_assignments(Expr::Ident(d.name), &Initializer::List(items), out);
            }
            (CType::Array { .. }, Some(init @ Initializer::Expr(_))) => {
                // String-literal initialized arrays cannot be rebuilt as
                // element assignments; the whole constant declaration moves.
                self.entry.push(Stmt::Decl(Declaration {
                    name: d.name,
                    ty: d.ty.clone(),
                    is_const: d.is_const,
                    init: Some(init),
                }));
            }
            (CType::Record(_) | CType::Named(_), Some(init @ Initializer::List(_))) => {
                // Aggregate initializer lists have no assignment equivalent
                // without field names; the initialized declaration moves.
                self.entry.push(Stmt::Decl(Declaration {
                    name: d.name,
                    ty: d.ty.clone(),
                    is_const: false,
                    init: Some(init),
                }));
            }
            (_, init) => {
                // const drops so the deferred assignment stays legal.
                self.entry
                    .push(Stmt::Decl(Declaration::new(&d.name, d.ty.clone(), None)));
                match init {
                    Some(Initializer::Expr(e)) => {
                        out.push(Stmt::Expr(Expr::assign(Expr::Ident(d.name), e)));
                    }
                    // A braced scalar initializer carries one expression.
                    Some(Initializer::List(items)) if items.len() == 1 => {
                        if let Initializer::Expr(e) = &items[0] {
                            out.push(Stmt::Expr(Expr::assign(
                                Expr::Ident(d.name),
                                e.clone(),
                            )));
                        }
                    }
                    Some(list @ Initializer::List(_)) => {
                        element_assignments(Expr::Ident(d.name), &list, out);
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }
}

/// Element type and byte-size expression for a variable-length array:
/// `sizeof(element) * len_0 * len_1 ...`.
fn vla_allocation(ty: &CType) -> (CType, Expr) {
    let mut lens: Vec<Expr> = Vec::new();
    let mut cur = ty;
    let elem = loop {
        match cur {
            CType::Array { elem, len } => {
                if let Some(l) = len {
                    lens.push((**l).clone());
                }
                cur = elem;
            }
            other => break other.clone(),
        }
    };
    let mut size = Expr::SizeOfType(elem.clone());
    for l in lens {
        size = Expr::binary(BinOp::Mul, size, l);
    }
    // The hoisted pointer points at the outermost element type.
    let pointee = match ty {
        CType::Array { elem, .. } => (**elem).clone(),
        other => other.clone(),
    };
    (pointee, size)
}

/// Expand an initializer list into per-element assignments, recursing into
/// nested lists with chained indexing.
fn element_assignments(base: Expr, init: &Initializer, out: &mut Vec<Stmt>) {
    match init {
        Initializer::Expr(e) => {
            out.push(Stmt::Expr(Expr::assign(base, e.clone())));
        }
        Initializer::List(items) => {
            for (i, item) in items.iter().enumerate() {
                let indexed = Expr::Index {
                    base: Box::new(base.clone()),
                    index: Box::new(Expr::IntLit(i as i64)),
                };
                element_assignments(indexed, item, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Case order verification

/// Randomized order is only taken when every name a case touches is fully
/// established at entry: a parameter, a hoisted local, a case id, or a
/// file-scope name. VLAs disqualify outright since their storage only exists
/// after the original allocation point.
#[allow(clippy::too_many_arguments)]
fn verify_case_order(
    f: &FunctionDef,
    cfg: &Cfg,
    blocks: &[BlockId],
    case_stmts: &FxHashMap<BlockId, Vec<Stmt>>,
    hoister: &Hoister,
    ids: &CaseIds,
    state: &str,
    scopes: &ScopeAnalysis,
) -> Result<(), PreconditionViolation> {
    if let Some(name) = hoister.vla_names.first() {
        return Err(PreconditionViolation::UnverifiableCaseOrder {
            function: f.name.clone(),
            name: name.clone(),
        });
    }

    let enumerators: FxHashSet<&str> = ids
        .enum_def
        .as_ref()
        .map(|d| d.enumerators.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let params: FxHashSet<&str> = f.params.iter().map(|p| p.name.as_str()).collect();

    let mut used: Vec<String> = Vec::new();
    for &id in blocks {
        if let Some(stmts) = case_stmts.get(&id) {
            for stmt in stmts {
                collect_idents_stmt(stmt, &mut used);
            }
        }
        for e in terminator_exprs(&cfg.block(id).terminator) {
            e.walk(&mut |e| {
                if let Expr::Ident(name) = e {
                    used.push(name.clone());
                }
            });
        }
    }
    for name in used {
        let known = name == state
            || params.contains(name.as_str())
            || hoister.hoisted.contains(&name)
            || enumerators.contains(name.as_str())
            || scopes.is_global(&name)
            || scopes.is_function(&name)
            || scopes
                .bindings_in(crate::analysis::ScopeId::FILE)
                .any(|b| b.name == name);
        if !known {
            return Err(PreconditionViolation::UnverifiableCaseOrder {
                function: f.name.clone(),
                name,
            });
        }
    }
    Ok(())
}

fn terminator_exprs(term: &Terminator) -> Vec<&Expr> {
    match term {
        Terminator::Branch { cond, .. } => vec![cond],
        Terminator::SwitchDispatch {
            scrutinee, cases, ..
        } => {
            let mut out = vec![scrutinee];
            out.extend(cases.iter().map(|(v, _)| v));
            out
        }
        Terminator::Return(Some(e)) => vec![e],
        _ => vec![],
    }
}

fn collect_idents_stmt(stmt: &Stmt, out: &mut Vec<String>) {
    let mut push = |e: &Expr| {
        e.walk(&mut |e| {
            if let Expr::Ident(name) = e {
                out.push(name.clone());
            }
        });
    };
    if let Stmt::Expr(e) = stmt {
        push(e);
    }
}

// ---------------------------------------------------------------------------
// Shadow renaming

/// Rename locals apart so every variable name is unique within the function.
/// Entry hoisting collapses all block scopes into one; without this pass two
/// sibling `int i;` declarations would collide.
fn rename_shadowed_locals(
    f: &mut FunctionDef,
    scopes: &ScopeAnalysis,
    taken: &mut FxHashSet<String>,
) {
    let mut renamer = Renamer {
        scopes,
        stack: vec![FxHashMap::default()],
        used: f.params.iter().map(|p| p.name.clone()).collect(),
        taken,
    };
    for p in &f.params {
        renamer
            .stack
            .last_mut()
            .expect("rename stack never empty")
            .insert(p.name.clone(), p.name.clone());
    }
    for stmt in &mut f.body {
        renamer.stmt(stmt);
    }
}

struct Renamer<'a> {
    scopes: &'a ScopeAnalysis,
    stack: Vec<FxHashMap<String, String>>,
    used: FxHashSet<String>,
    taken: &'a mut FxHashSet<String>,
}

impl Renamer<'_> {
    /// A local that shadows a file-scope name must also be renamed: after
    /// hoisting it would shadow that name for the whole function, capturing
    /// references that used to resolve past it.
    fn shadows_file_scope(&self, name: &str) -> bool {
        self.scopes.is_global(name)
            || self.scopes.is_function(name)
            || self
                .scopes
                .bindings_in(crate::analysis::ScopeId::FILE)
                .any(|b| b.namespace == NameSpace::Ordinary && b.name == name)
    }

    fn declare(&mut self, name: &mut String) {
        let new = if self.used.contains(name.as_str()) || self.shadows_file_scope(name) {
            let fresh = self
                .scopes
                .fresh_name(name, NameSpace::Ordinary, self.taken);
            self.taken.insert(fresh.clone());
            fresh
        } else {
            name.clone()
        };
        self.used.insert(new.clone());
        self.stack
            .last_mut()
            .expect("rename stack never empty")
            .insert(name.clone(), new.clone());
        *name = new;
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.stack.iter().rev().find_map(|scope| scope.get(name))
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Decl(d) => self.decl(d),
            Stmt::Expr(e) | Stmt::Return(Some(e)) => self.expr(e),
            Stmt::Compound(stmts) => {
                self.stack.push(FxHashMap::default());
                for s in stmts {
                    self.stmt(s);
                }
                self.stack.pop();
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond);
                self.stmt(then_branch);
                if let Some(e) = else_branch {
                    self.stmt(e);
                }
            }
            Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
                self.expr(cond);
                self.stmt(body);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.stack.push(FxHashMap::default());
                match init.as_deref_mut() {
                    Some(ForInit::Decl(d)) => self.decl(d),
                    Some(ForInit::Expr(e)) => self.expr(e),
                    None => {}
                }
                if let Some(c) = cond {
                    self.expr(c);
                }
                if let Some(s) = step {
                    self.expr(s);
                }
                self.stmt(body);
                self.stack.pop();
            }
            Stmt::Switch { cond, cases } => {
                self.expr(cond);
                self.stack.push(FxHashMap::default());
                for case in cases {
                    if let CaseLabel::Case(v) = &mut case.label {
                        self.expr(v);
                    }
                    for s in &mut case.body {
                        self.stmt(s);
                    }
                }
                self.stack.pop();
            }
            Stmt::Labeled { stmt, .. } => self.stmt(stmt),
            Stmt::EnumDecl(_)
            | Stmt::Break
            | Stmt::Continue
            | Stmt::Goto(_)
            | Stmt::Return(None)
            | Stmt::Empty => {}
        }
    }

    fn decl(&mut self, d: &mut Declaration) {
        // The name is in scope within its own initializer.
        self.declare(&mut d.name);
        self.ty(&mut d.ty);
        if let Some(init) = &mut d.init {
            self.init(init);
        }
    }

    fn init(&mut self, init: &mut Initializer) {
        match init {
            Initializer::Expr(e) => self.expr(e),
            Initializer::List(items) => {
                for i in items {
                    self.init(i);
                }
            }
        }
    }

    /// Array lengths can reference earlier locals.
    fn ty(&mut self, ty: &mut CType) {
        match ty {
            CType::Array { elem, len } => {
                if let Some(l) = len {
                    self.expr(l);
                }
                self.ty(elem);
            }
            CType::Pointer(inner) => self.ty(inner),
            _ => {}
        }
    }

    fn expr(&mut self, e: &mut Expr) {
        match e {
            Expr::Ident(name) => {
                if let Some(new) = self.lookup(name) {
                    *name = new.clone();
                }
            }
            Expr::Unary(_, inner) | Expr::SizeOfExpr(inner) => self.expr(inner),
            Expr::Cast { ty, expr } => {
                self.ty(ty);
                self.expr(expr);
            }
            Expr::Binary(_, l, r) => {
                self.expr(l);
                self.expr(r);
            }
            Expr::Assign { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond);
                self.expr(then_expr);
                self.expr(else_expr);
            }
            Expr::Call { callee, args } => {
                self.expr(callee);
                for a in args {
                    self.expr(a);
                }
            }
            Expr::Index { base, index } => {
                self.expr(base);
                self.expr(index);
            }
            Expr::Member { base, .. } => self.expr(base),
            Expr::Comma(parts) => {
                for p in parts {
                    self.expr(p);
                }
            }
            Expr::SizeOfType(ty) => self.ty(ty),
            Expr::IntLit(_) | Expr::RealLit(_) | Expr::CharLit(_) | Expr::StrLit(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Item, Param, SourceUnit};
    use rand::SeedableRng;

    fn func(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            ret: CType::int(),
            params,
            variadic: false,
            body,
        }
    }

    fn flatten(unit: &SourceUnit, params: &FlattenParams) -> Result<SourceUnit, TransformError> {
        let ctx = AnalysisContext::run(unit).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        flatten_control_flow(unit, &ctx, params, &mut rng)
    }

    fn sequential() -> FlattenParams {
        FlattenParams {
            style: CaseIdStyle::Sequential,
            randomize_case_order: false,
        }
    }

    /// `if (a > 0) return 1; return 2;` has three reachable code blocks.
    fn branchy_unit() -> SourceUnit {
        SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![Param::new("a", CType::int())],
            vec![
                Stmt::If {
                    cond: Expr::binary(BinOp::Gt, Expr::Ident("a".into()), Expr::IntLit(0)),
                    then_branch: Box::new(Stmt::Return(Some(Expr::IntLit(1)))),
                    else_branch: None,
                },
                Stmt::Return(Some(Expr::IntLit(2))),
            ],
        ))])
    }

    fn dispatch_of(f: &FunctionDef) -> (&Declaration, &Expr, &Vec<SwitchCase>) {
        let state_decl = match &f.body[f.body.len() - 2] {
            Stmt::Decl(d) => d,
            other => panic!("expected state declaration, got {other:?}"),
        };
        match f.body.last().unwrap() {
            Stmt::While { cond, body } => match body.as_ref() {
                Stmt::Compound(inner) => match &inner[0] {
                    Stmt::Switch { cases, .. } => (state_decl, cond, cases),
                    other => panic!("expected dispatch switch, got {other:?}"),
                },
                other => panic!("expected compound loop body, got {other:?}"),
            },
            other => panic!("expected dispatch loop, got {other:?}"),
        }
    }

    #[test]
    fn sequential_ids_cover_blocks_in_source_order() {
        let out = flatten(&branchy_unit(), &sequential()).unwrap();
        let f = out.function("f").unwrap();
        let (state_decl, _, cases) = dispatch_of(f);

        assert_eq!(state_decl.ty, CType::int());
        assert_eq!(cases.len(), 3);
        for (i, case) in cases.iter().enumerate() {
            assert_eq!(case.label, CaseLabel::Case(Expr::IntLit(i as i64)));
        }
    }

    #[test]
    fn branch_block_lowers_to_state_selection() {
        let out = flatten(&branchy_unit(), &sequential()).unwrap();
        let f = out.function("f").unwrap();
        let (_, _, cases) = dispatch_of(f);

        // The entry case carries the branch.
        match &cases[0].body[0] {
            Stmt::If {
                then_branch,
                else_branch: Some(else_branch),
                ..
            } => {
                let state_assign = |s: &Stmt| match s {
                    Stmt::Compound(inner) => {
                        matches!(inner[0], Stmt::Expr(Expr::Assign { .. }))
                    }
                    _ => false,
                };
                assert!(state_assign(then_branch));
                assert!(state_assign(else_branch));
            }
            other => panic!("expected lowered branch, got {other:?}"),
        }
        assert_eq!(cases[0].body[1], Stmt::Break);
        // Return blocks keep their returns.
        assert!(cases[1..]
            .iter()
            .all(|c| matches!(c.body.last(), Some(Stmt::Return(_)))));
    }

    #[test]
    fn initialized_declarations_hoist_as_assignments() {
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![],
            vec![
                Stmt::Decl(Declaration::new(
                    "x",
                    CType::int(),
                    Some(Initializer::Expr(Expr::IntLit(5))),
                )),
                Stmt::Return(Some(Expr::Ident("x".into()))),
            ],
        ))]);
        let out = flatten(&unit, &sequential()).unwrap();
        let f = out.function("f").unwrap();

        // Hoisted declaration at entry, uninitialized.
        match &f.body[0] {
            Stmt::Decl(d) => {
                assert_eq!(d.name, "x");
                assert!(d.init.is_none());
            }
            other => panic!("expected hoisted declaration, got {other:?}"),
        }
        // The assignment stays in the single case.
        let (_, _, cases) = dispatch_of(f);
        assert_eq!(cases.len(), 1);
        assert!(matches!(
            &cases[0].body[0],
            Stmt::Expr(Expr::Assign { .. })
        ));
    }

    #[test]
    fn shadowed_locals_are_renamed_apart() {
        let decl = |name: &str, v: i64| {
            Stmt::Decl(Declaration::new(
                name,
                CType::int(),
                Some(Initializer::Expr(Expr::IntLit(v))),
            ))
        };
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![],
            vec![
                Stmt::Compound(vec![decl("x", 1)]),
                Stmt::Compound(vec![decl("x", 2)]),
                Stmt::Return(Some(Expr::IntLit(0))),
            ],
        ))]);
        let out = flatten(&unit, &sequential()).unwrap();
        let f = out.function("f").unwrap();

        let mut names: Vec<&str> = f
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Decl(d) if d.ty == CType::int() => Some(d.name.as_str()),
                _ => None,
            })
            .collect();
        // Two hoisted x's plus the state variable, all distinct.
        assert_eq!(names.len(), 3);
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn const_array_initializer_is_refused() {
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![],
            vec![
                Stmt::Decl(Declaration {
                    name: "table".into(),
                    ty: CType::Array {
                        elem: Box::new(CType::int()),
                        len: Some(Box::new(Expr::IntLit(2))),
                    },
                    is_const: true,
                    init: Some(Initializer::List(vec![
                        Initializer::Expr(Expr::IntLit(1)),
                        Initializer::Expr(Expr::IntLit(2)),
                    ])),
                }),
                Stmt::Return(Some(Expr::IntLit(0))),
            ],
        ))]);
        let err = flatten(&unit, &sequential()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Precondition(PreconditionViolation::ConstArrayInitializer {
                ref name,
                ..
            }) if name == "table"
        ));
    }

    #[test]
    fn vla_hoists_as_pointer_with_alloca() {
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![Param::new("n", CType::int())],
            vec![
                Stmt::Decl(Declaration::new(
                    "buf",
                    CType::Array {
                        elem: Box::new(CType::int()),
                        len: Some(Box::new(Expr::Ident("n".into()))),
                    },
                    None,
                )),
                Stmt::Return(Some(Expr::IntLit(0))),
            ],
        ))]);
        let out = flatten(&unit, &sequential()).unwrap();
        let f = out.function("f").unwrap();

        match &f.body[0] {
            Stmt::Decl(d) => {
                assert_eq!(d.name, "buf");
                assert_eq!(d.ty, CType::Pointer(Box::new(CType::int())));
            }
            other => panic!("expected hoisted pointer, got {other:?}"),
        }
        let (_, _, cases) = dispatch_of(f);
        match &cases[0].body[0] {
            Stmt::Expr(Expr::Assign { value, .. }) => match value.as_ref() {
                Expr::Call { callee, .. } => {
                    assert_eq!(**callee, Expr::Ident("alloca".into()));
                }
                other => panic!("expected alloca call, got {other:?}"),
            },
            other => panic!("expected allocation assignment, got {other:?}"),
        }
    }

    #[test]
    fn randomized_order_refuses_vla_functions() {
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![Param::new("n", CType::int())],
            vec![
                Stmt::Decl(Declaration::new(
                    "buf",
                    CType::Array {
                        elem: Box::new(CType::int()),
                        len: Some(Box::new(Expr::Ident("n".into()))),
                    },
                    None,
                )),
                Stmt::Return(Some(Expr::IntLit(0))),
            ],
        ))]);
        let params = FlattenParams {
            style: CaseIdStyle::Sequential,
            randomize_case_order: true,
        };
        let err = flatten(&unit, &params).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Precondition(PreconditionViolation::UnverifiableCaseOrder {
                ref name,
                ..
            }) if name == "buf"
        ));
    }

    #[test]
    fn enumerator_style_types_the_state_with_a_fresh_enum() {
        let params = FlattenParams {
            style: CaseIdStyle::Enumerator,
            randomize_case_order: false,
        };
        let out = flatten(&branchy_unit(), &params).unwrap();
        let f = out.function("f").unwrap();

        let def = match &f.body[0] {
            Stmt::EnumDecl(def) => def,
            other => panic!("expected enum declaration, got {other:?}"),
        };
        // One enumerator per block plus the exit value.
        assert_eq!(def.enumerators.len(), 4);
        let (state_decl, _, cases) = dispatch_of(f);
        assert_eq!(state_decl.ty, CType::Enum(def.tag.clone()));
        for (case, name) in cases.iter().zip(&def.enumerators) {
            assert_eq!(case.label, CaseLabel::Case(Expr::Ident(name.clone())));
        }
    }

    #[test]
    fn random_ids_are_distinct() {
        let mut rng = StdRng::seed_from_u64(3);
        for count in [1usize, 2, 9, 64] {
            let ids = distinct_random_ids(count, &mut rng);
            assert_eq!(ids.len(), count);
            let unique: FxHashSet<i64> = ids.iter().copied().collect();
            assert_eq!(unique.len(), count);
        }
    }

    #[test]
    fn loops_flatten_into_back_edges() {
        // while (i < 3) i = i + 1;
        let unit = SourceUnit::new(vec![Item::Function(func(
            "f",
            vec![Param::new("i", CType::int())],
            vec![
                Stmt::While {
                    cond: Expr::binary(BinOp::Lt, Expr::Ident("i".into()), Expr::IntLit(3)),
                    body: Box::new(Stmt::Expr(Expr::assign(
                        Expr::Ident("i".into()),
                        Expr::binary(BinOp::Add, Expr::Ident("i".into()), Expr::IntLit(1)),
                    ))),
                },
                Stmt::Return(Some(Expr::Ident("i".into()))),
            ],
        ))]);
        let out = flatten(&unit, &sequential()).unwrap();
        let f = out.function("f").unwrap();
        let (_, _, cases) = dispatch_of(f);

        // Entry, header, body, and the return block after the loop.
        assert_eq!(cases.len(), 4);
        // No structured loop survives inside any case.
        for case in cases {
            for stmt in &case.body {
                assert!(!matches!(stmt, Stmt::While { .. } | Stmt::For { .. }));
            }
        }
    }
}
