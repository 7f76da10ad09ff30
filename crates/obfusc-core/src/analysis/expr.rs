//! Expression type and effect analysis.
//!
//! Effects tracked:
//! - Assignments, increments, and decrements
//! - Global variable reads
//! - Calls, resolved interprocedurally over the unit's own functions
//! - Calls to external functions, which stay `Unknown`
//!
//! `Unknown` ranks above `HasSideEffect`: every consumer that needs purity
//! treats the two the same, so a transform can never duplicate or discard an
//! expression it cannot account for.

use crate::ast::{
    BinOp, CType, Expr, ForInit, FunctionDef, Initializer, IntKind, RealKind, SourceUnit, Stmt,
    UnOp,
};
use crate::analysis::scope::{ScopeAnalysis, ScopeId};
use rustc_hash::FxHashMap;

/// The shape of an expression's value, at the precision transforms need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprType {
    Int(IntKind),
    Real(RealKind),
    Pointer,
    Other,
}

impl ExprType {
    pub fn is_integer(self) -> bool {
        matches!(self, ExprType::Int(_))
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, ExprType::Int(_) | ExprType::Real(_))
    }

    fn of_ctype(ty: &CType) -> ExprType {
        match ty {
            CType::Int(k) => ExprType::Int(*k),
            CType::Real(k) => ExprType::Real(*k),
            CType::Enum(_) => ExprType::Int(IntKind::Int),
            CType::Pointer(_) | CType::Array { .. } => ExprType::Pointer,
            CType::Function { .. } => ExprType::Pointer,
            CType::Void | CType::Named(_) | CType::Record(_) => ExprType::Other,
        }
    }
}

/// Effect classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Effect {
    /// No observable effect, no global reads.
    Pure,
    /// Reads global state but writes nothing.
    ReadsGlobal,
    /// Writes state, performs I/O, or increments/decrements.
    HasSideEffect,
    /// Cannot be classified; treated as side-effecting everywhere.
    Unknown,
}

impl Effect {
    pub fn join(self, other: Effect) -> Effect {
        self.max(other)
    }

    pub fn is_pure(self) -> bool {
        self == Effect::Pure
    }

    /// True when evaluating the expression twice is observably the same as
    /// evaluating it once.
    pub fn is_duplicable(self) -> bool {
        matches!(self, Effect::Pure | Effect::ReadsGlobal)
    }
}

/// Combined classification of one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprInfo {
    pub ty: ExprType,
    pub effect: Effect,
}

/// Types of the names visible at the query point. Callers build this from
/// the enclosing function's parameters and the declarations walked so far.
pub type TypeEnv = FxHashMap<String, CType>;

/// Environment holding just a function's parameters.
pub fn param_env(f: &FunctionDef) -> TypeEnv {
    f.params
        .iter()
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect()
}

/// Whole-unit expression analysis. Function effects are computed once by
/// fixed-point iteration; per-expression queries are derived bottom-up.
#[derive(Debug)]
pub struct ExprAnalysis {
    function_effects: FxHashMap<String, Effect>,
    function_returns: FxHashMap<String, ExprType>,
    global_types: FxHashMap<String, CType>,
    known_pure: rustc_hash::FxHashSet<&'static str>,
}

impl ExprAnalysis {
    pub fn run(unit: &SourceUnit, scopes: &ScopeAnalysis) -> ExprAnalysis {
        // Libc arithmetic helpers with no observable effects.
        let known_pure: rustc_hash::FxHashSet<&'static str> = [
            "abs", "labs", "llabs", "fabs", "fabsf", "sqrt", "sqrtf", "floor", "ceil", "pow",
            "powf", "sin", "cos", "tan", "exp", "log", "fmod", "fmin", "fmax",
        ]
        .into_iter()
        .collect();

        let mut analysis = ExprAnalysis {
            function_effects: FxHashMap::default(),
            function_returns: FxHashMap::default(),
            global_types: FxHashMap::default(),
            known_pure,
        };

        for b in scopes.bindings() {
            if b.scope == ScopeId::FILE && scopes.is_global(&b.name) {
                if let Some(ty) = &b.ty {
                    analysis.global_types.insert(b.name.clone(), ty.clone());
                }
            }
        }

        for f in unit.functions() {
            analysis
                .function_returns
                .insert(f.name.clone(), ExprType::of_ctype(&f.ret));
            analysis.function_effects.insert(f.name.clone(), Effect::Pure);
        }

        // Interprocedural fixed point: each function's effect is the join
        // over its body, with calls contributing the callee's current
        // estimate. The lattice is finite, so this terminates.
        let mut changed = true;
        while changed {
            changed = false;
            let names: Vec<String> = analysis.function_effects.keys().cloned().collect();
            for name in names {
                let f = match unit.function(&name) {
                    Some(f) => f,
                    None => continue,
                };
                let env = param_env(f);
                let mut effect = Effect::Pure;
                each_expr_in_body(&f.body, &mut |e| {
                    effect = effect.join(analysis.info(e, &env).effect);
                });
                if effect > analysis.function_effects[&name] {
                    analysis.function_effects.insert(name, effect);
                    changed = true;
                }
            }
        }

        analysis
    }

    /// Effect of calling the named function, `Unknown` for externals.
    pub fn call_effect(&self, name: &str) -> Effect {
        if let Some(e) = self.function_effects.get(name) {
            return *e;
        }
        if self.known_pure.contains(name) {
            Effect::Pure
        } else {
            Effect::Unknown
        }
    }

    /// Classify one expression under the given environment. Names missing
    /// from both the environment and file scope are externally declared;
    /// reading one is a global read of an unknown type.
    pub fn info(&self, e: &Expr, env: &TypeEnv) -> ExprInfo {
        match e {
            Expr::IntLit(_) => pure(ExprType::Int(IntKind::Int)),
            Expr::RealLit(_) => pure(ExprType::Real(RealKind::Double)),
            Expr::CharLit(_) => pure(ExprType::Int(IntKind::Char)),
            Expr::StrLit(_) => pure(ExprType::Pointer),
            Expr::Ident(name) => {
                if let Some(ty) = env.get(name) {
                    return pure(ExprType::of_ctype(ty));
                }
                let ty = self
                    .global_types
                    .get(name)
                    .map(ExprType::of_ctype)
                    .unwrap_or(ExprType::Other);
                ExprInfo {
                    ty,
                    effect: Effect::ReadsGlobal,
                }
            }
            Expr::Unary(op, inner) => {
                let inner = self.info(inner, env);
                let effect = if op.has_side_effect() {
                    inner.effect.join(Effect::HasSideEffect)
                } else if *op == UnOp::Deref {
                    inner.effect.join(Effect::ReadsGlobal)
                } else {
                    inner.effect
                };
                let ty = match op {
                    UnOp::Not => ExprType::Int(IntKind::Int),
                    UnOp::AddrOf => ExprType::Pointer,
                    UnOp::Deref => ExprType::Other,
                    UnOp::Neg | UnOp::Plus | UnOp::BitNot => promote(inner.ty),
                    UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec => inner.ty,
                };
                ExprInfo { ty, effect }
            }
            Expr::Binary(op, l, r) => {
                let l = self.info(l, env);
                let r = self.info(r, env);
                let effect = l.effect.join(r.effect);
                let ty = if op.is_comparison() || matches!(op, BinOp::LogAnd | BinOp::LogOr) {
                    ExprType::Int(IntKind::Int)
                } else if l.ty == ExprType::Pointer || r.ty == ExprType::Pointer {
                    ExprType::Pointer
                } else {
                    usual_arithmetic(l.ty, r.ty)
                };
                ExprInfo { ty, effect }
            }
            Expr::Assign { target, value, .. } => {
                let target = self.info(target, env);
                let value = self.info(value, env);
                ExprInfo {
                    ty: target.ty,
                    effect: target.effect.join(value.effect).join(Effect::HasSideEffect),
                }
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.info(cond, env);
                let t = self.info(then_expr, env);
                let f = self.info(else_expr, env);
                ExprInfo {
                    ty: usual_arithmetic(t.ty, f.ty),
                    effect: c.effect.join(t.effect).join(f.effect),
                }
            }
            Expr::Call { callee, args } => {
                let mut effect = match callee.as_ref() {
                    Expr::Ident(name) => self.call_effect(name),
                    other => self.info(other, env).effect.join(Effect::Unknown),
                };
                for a in args {
                    effect = effect.join(self.info(a, env).effect);
                }
                let ty = match callee.as_ref() {
                    Expr::Ident(name) => self
                        .function_returns
                        .get(name)
                        .copied()
                        .unwrap_or(ExprType::Other),
                    _ => ExprType::Other,
                };
                ExprInfo { ty, effect }
            }
            Expr::Index { base, index } => {
                let b = self.info(base, env);
                let i = self.info(index, env);
                let ty = match base.as_ref() {
                    Expr::Ident(name) => env
                        .get(name)
                        .or_else(|| self.global_types.get(name))
                        .map(|t| ExprType::of_ctype(t.array_element()))
                        .unwrap_or(ExprType::Other),
                    _ => ExprType::Other,
                };
                ExprInfo {
                    ty,
                    effect: b.effect.join(i.effect),
                }
            }
            Expr::Member { base, .. } => {
                let b = self.info(base, env);
                ExprInfo {
                    ty: ExprType::Other,
                    effect: b.effect,
                }
            }
            Expr::Cast { ty, expr } => {
                let inner = self.info(expr, env);
                ExprInfo {
                    ty: ExprType::of_ctype(ty),
                    effect: inner.effect,
                }
            }
            Expr::Comma(parts) => {
                let mut effect = Effect::Pure;
                let mut ty = ExprType::Other;
                for p in parts {
                    let info = self.info(p, env);
                    effect = effect.join(info.effect);
                    ty = info.ty;
                }
                ExprInfo { ty, effect }
            }
            // The operand of sizeof is not evaluated.
            Expr::SizeOfType(_) | Expr::SizeOfExpr(_) => pure(ExprType::Int(IntKind::ULong)),
        }
    }
}

fn pure(ty: ExprType) -> ExprInfo {
    ExprInfo {
        ty,
        effect: Effect::Pure,
    }
}

fn promote(ty: ExprType) -> ExprType {
    match ty {
        ExprType::Int(k) => ExprType::Int(k.promoted()),
        other => other,
    }
}

/// Usual arithmetic conversions over the reduced type lattice.
fn usual_arithmetic(l: ExprType, r: ExprType) -> ExprType {
    match (l, r) {
        (ExprType::Real(a), ExprType::Real(b)) => ExprType::Real(a.max(b)),
        (ExprType::Real(a), ExprType::Int(_)) | (ExprType::Int(_), ExprType::Real(a)) => {
            ExprType::Real(a)
        }
        (ExprType::Int(a), ExprType::Int(b)) => {
            let a = a.promoted();
            let b = b.promoted();
            if a.rank() != b.rank() {
                ExprType::Int(if a.rank() > b.rank() { a } else { b })
            } else if a.is_unsigned() {
                ExprType::Int(a)
            } else {
                ExprType::Int(b)
            }
        }
        _ => ExprType::Other,
    }
}

/// Visit every expression in a statement list, including conditions, loop
/// headers, initializers, and array length expressions in declared types.
pub fn each_expr_in_body(stmts: &[Stmt], f: &mut impl FnMut(&Expr)) {
    for stmt in stmts {
        each_expr_in_stmt(stmt, f);
    }
}

fn each_expr_in_stmt(stmt: &Stmt, f: &mut impl FnMut(&Expr)) {
    match stmt {
        Stmt::Expr(e) => e.walk(f),
        Stmt::Decl(d) => {
            each_len_in_type(&d.ty, f);
            if let Some(init) = &d.init {
                each_expr_in_init(init, f);
            }
        }
        Stmt::EnumDecl(_) => {}
        Stmt::Compound(stmts) => each_expr_in_body(stmts, f),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            cond.walk(f);
            each_expr_in_stmt(then_branch, f);
            if let Some(e) = else_branch {
                each_expr_in_stmt(e, f);
            }
        }
        Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
            cond.walk(f);
            each_expr_in_stmt(body, f);
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            match init.as_deref() {
                Some(ForInit::Decl(d)) => {
                    each_len_in_type(&d.ty, f);
                    if let Some(init) = &d.init {
                        each_expr_in_init(init, f);
                    }
                }
                Some(ForInit::Expr(e)) => e.walk(f),
                None => {}
            }
            if let Some(c) = cond {
                c.walk(f);
            }
            if let Some(s) = step {
                s.walk(f);
            }
            each_expr_in_stmt(body, f);
        }
        Stmt::Switch { cond, cases } => {
            cond.walk(f);
            for case in cases {
                if let crate::ast::CaseLabel::Case(e) = &case.label {
                    e.walk(f);
                }
                each_expr_in_body(&case.body, f);
            }
        }
        Stmt::Labeled { stmt, .. } => each_expr_in_stmt(stmt, f),
        Stmt::Return(Some(e)) => e.walk(f),
        Stmt::Return(None) | Stmt::Break | Stmt::Continue | Stmt::Goto(_) | Stmt::Empty => {}
    }
}

fn each_expr_in_init(init: &Initializer, f: &mut impl FnMut(&Expr)) {
    match init {
        Initializer::Expr(e) => e.walk(f),
        Initializer::List(items) => {
            for i in items {
                each_expr_in_init(i, f);
            }
        }
    }
}

fn each_len_in_type(ty: &CType, f: &mut impl FnMut(&Expr)) {
    match ty {
        CType::Array { elem, len } => {
            each_len_in_type(elem, f);
            if let Some(len) = len {
                len.walk(f);
            }
        }
        CType::Pointer(inner) => each_len_in_type(inner, f),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Declaration, FunctionDef, Item, Param};

    fn analyze(unit: &SourceUnit) -> (ExprAnalysis, ScopeAnalysis) {
        let scopes = ScopeAnalysis::run(unit).unwrap();
        let exprs = ExprAnalysis::run(unit, &scopes);
        (exprs, scopes)
    }

    fn func(name: &str, body: Vec<Stmt>) -> Item {
        Item::Function(FunctionDef {
            name: name.to_string(),
            ret: CType::int(),
            params: vec![Param::new("a", CType::int())],
            variadic: false,
            body,
        })
    }

    #[test]
    fn literals_and_locals_are_pure() {
        let unit = SourceUnit::new(vec![func("f", vec![])]);
        let (exprs, _) = analyze(&unit);
        let env: TypeEnv = [("x".to_string(), CType::int())].into_iter().collect();

        let e = Expr::binary(BinOp::Add, Expr::Ident("x".to_string()), Expr::IntLit(3));
        let info = exprs.info(&e, &env);
        assert_eq!(info.effect, Effect::Pure);
        assert_eq!(info.ty, ExprType::Int(IntKind::Int));
    }

    #[test]
    fn global_read_is_not_pure_but_is_duplicable() {
        let unit = SourceUnit::new(vec![
            Item::Decl(Declaration::new("g", CType::int(), None)),
            func("f", vec![]),
        ]);
        let (exprs, _) = analyze(&unit);
        let info = exprs.info(&Expr::Ident("g".to_string()), &TypeEnv::default());
        assert_eq!(info.effect, Effect::ReadsGlobal);
        assert!(info.effect.is_duplicable());
    }

    #[test]
    fn assignment_and_increment_have_side_effects() {
        let unit = SourceUnit::new(vec![func("f", vec![])]);
        let (exprs, _) = analyze(&unit);
        let env: TypeEnv = [("x".to_string(), CType::int())].into_iter().collect();

        let assign = Expr::assign(Expr::Ident("x".to_string()), Expr::IntLit(1));
        assert_eq!(exprs.info(&assign, &env).effect, Effect::HasSideEffect);

        let inc = Expr::Unary(UnOp::PostInc, Box::new(Expr::Ident("x".to_string())));
        assert_eq!(exprs.info(&inc, &env).effect, Effect::HasSideEffect);
    }

    #[test]
    fn call_effects_propagate_through_the_call_graph() {
        // h writes a global; g calls h; f calls g.
        let unit = SourceUnit::new(vec![
            Item::Decl(Declaration::new("counter", CType::int(), None)),
            func(
                "h",
                vec![Stmt::Expr(Expr::assign(
                    Expr::Ident("counter".to_string()),
                    Expr::IntLit(1),
                ))],
            ),
            func("g", vec![Stmt::Expr(Expr::call("h", vec![]))]),
            func("f", vec![Stmt::Expr(Expr::call("g", vec![]))]),
        ]);
        let (exprs, _) = analyze(&unit);
        assert_eq!(exprs.call_effect("h"), Effect::HasSideEffect);
        assert_eq!(exprs.call_effect("g"), Effect::HasSideEffect);
        assert_eq!(exprs.call_effect("f"), Effect::HasSideEffect);
    }

    #[test]
    fn external_call_is_unknown_and_not_duplicable() {
        let unit = SourceUnit::new(vec![func("f", vec![])]);
        let (exprs, _) = analyze(&unit);
        assert_eq!(exprs.call_effect("read_sensor"), Effect::Unknown);
        assert!(!Effect::Unknown.is_duplicable());
        assert_eq!(exprs.call_effect("abs"), Effect::Pure);
    }

    #[test]
    fn usual_conversions_pick_the_wider_operand() {
        assert_eq!(
            usual_arithmetic(ExprType::Int(IntKind::Char), ExprType::Int(IntKind::Long)),
            ExprType::Int(IntKind::Long)
        );
        assert_eq!(
            usual_arithmetic(ExprType::Int(IntKind::UInt), ExprType::Int(IntKind::Int)),
            ExprType::Int(IntKind::UInt)
        );
        assert_eq!(
            usual_arithmetic(ExprType::Int(IntKind::Int), ExprType::Real(RealKind::Float)),
            ExprType::Real(RealKind::Float)
        );
    }
}
