//! Scope and identifier analysis.
//!
//! Builds an explicit scope arena over one translation unit and records every
//! binding with its namespace, kind, owning scope, and liveness interval.
//! The four namespaces follow the language model: ordinary identifiers, tags,
//! members, and labels. Labels are function-wide and never shadowable, so
//! they bind in the function's outermost scope regardless of nesting depth.
//!
//! The analysis doubles as tree validation: duplicate bindings in one scope,
//! undefined or duplicated labels, and `break`/`continue` outside a loop are
//! rejected before any transform runs.

use crate::ast::{
    CType, Declaration, Expr, ForInit, FunctionDef, Initializer, Item, SourceUnit, Stmt,
};
use crate::error::ParseInputError;
use rustc_hash::{FxHashMap, FxHashSet};

/// The namespace an identifier binds in. Two bindings only conflict when
/// they share both name and namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameSpace {
    /// Variables, functions, typedef names, and enumerators.
    Ordinary,
    /// Struct, union, and enum tags.
    Tag,
    /// Struct and union member names.
    Member,
    /// Statement labels; function-wide.
    Label,
}

impl NameSpace {
    pub fn as_str(self) -> &'static str {
        match self {
            NameSpace::Ordinary => "ordinary",
            NameSpace::Tag => "tag",
            NameSpace::Member => "member",
            NameSpace::Label => "label",
        }
    }
}

/// What a binding declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Variable,
    Function,
    Typedef,
    Enumerator,
    Aggregate,
    Label,
}

/// Index of a scope in the arena. Scope 0 is file scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const FILE: ScopeId = ScopeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One scope in the arena. `span` covers the traversal positions the scope
/// was open for.
#[derive(Debug)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub bindings: Vec<usize>,
    pub span: (u32, u32),
}

/// One declared name.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub namespace: NameSpace,
    pub kind: BindingKind,
    pub ty: Option<CType>,
    pub scope: ScopeId,
    /// Enclosing function, `None` at file scope.
    pub function: Option<String>,
    /// Traversal position of the declaration.
    pub declared: u32,
    /// Traversal position of the last recorded use; equals `declared` for a
    /// binding that is never read.
    pub last_use: u32,
}

impl Binding {
    fn overlaps(&self, other: &Binding) -> bool {
        self.declared <= other.last_use && other.declared <= self.last_use
    }
}

/// One call through a plain identifier callee.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub callee: String,
    /// Function the call appears in, `None` in a file-scope initializer.
    pub caller: Option<String>,
    pub position: u32,
}

/// Immutable result of scope analysis over one translation unit.
#[derive(Debug)]
pub struct ScopeAnalysis {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    used: [FxHashSet<String>; 4],
    call_sites: Vec<CallSite>,
    address_taken: FxHashMap<String, u32>,
    labels: FxHashMap<String, FxHashSet<String>>,
    globals: FxHashSet<String>,
    functions: FxHashSet<String>,
}

impl ScopeAnalysis {
    /// Analyze a unit, or reject it as malformed input.
    pub fn run(unit: &SourceUnit) -> Result<ScopeAnalysis, ParseInputError> {
        ScopeBuilder::new().build(unit)
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Bindings declared directly in one scope.
    pub fn bindings_in(&self, id: ScopeId) -> impl Iterator<Item = &Binding> {
        self.scope(id).bindings.iter().map(|&i| &self.bindings[i])
    }

    /// True when `name` occurs somewhere in the unit within `namespace`,
    /// as a binding or as a use.
    pub fn name_in_use(&self, name: &str, namespace: NameSpace) -> bool {
        self.used[namespace as usize].contains(name)
    }

    /// True when introducing `name` at traversal position `position` cannot
    /// collide with any binding visible there. A binding conflicts when it
    /// shares the namespace and its owning scope is open at `position`.
    pub fn is_name_free(&self, name: &str, namespace: NameSpace, position: u32) -> bool {
        !self.bindings.iter().any(|b| {
            b.namespace == namespace && b.name == name && {
                let (start, end) = self.scope(b.scope).span;
                start <= position && position <= end
            }
        })
    }

    /// Produce a name unused anywhere in the unit within `namespace`.
    /// `taken` carries names generated earlier in the same transform that are
    /// not in the analyzed tree yet.
    pub fn fresh_name(
        &self,
        prefix: &str,
        namespace: NameSpace,
        taken: &FxHashSet<String>,
    ) -> String {
        let mut n = 0u32;
        loop {
            let candidate = if n == 0 {
                prefix.to_string()
            } else {
                format!("{prefix}{n}")
            };
            if !self.name_in_use(&candidate, namespace) && !taken.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Greedy interval-graph coloring over the given bindings. Two bindings
    /// receive distinct colors when they could alias: same namespace,
    /// overlapping liveness, and one scope visible from the other. Returns
    /// one color per input, in input order.
    pub fn pack_intervals(&self, ids: &[usize]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..ids.len()).collect();
        order.sort_by_key(|&i| self.bindings[ids[i]].declared);

        let mut colors = vec![0usize; ids.len()];
        for (rank, &i) in order.iter().enumerate() {
            let b = &self.bindings[ids[i]];
            let mut used: FxHashSet<usize> = FxHashSet::default();
            for &j in &order[..rank] {
                let other = &self.bindings[ids[j]];
                if other.namespace == b.namespace
                    && other.overlaps(b)
                    && self.scopes_visible(other.scope, b.scope)
                {
                    used.insert(colors[j]);
                }
            }
            let mut color = 0;
            while used.contains(&color) {
                color += 1;
            }
            colors[i] = color;
        }
        colors
    }

    /// Call sites whose callee is the named function.
    pub fn call_sites<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a CallSite> {
        self.call_sites.iter().filter(move |c| c.callee == function)
    }

    pub fn all_call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// Position of the first use of the named function outside a direct call,
    /// if any. Such a function may be reached through a pointer.
    pub fn address_taken(&self, function: &str) -> Option<u32> {
        self.address_taken.get(function).copied()
    }

    /// Labels defined in the named function.
    pub fn labels(&self, function: &str) -> Option<&FxHashSet<String>> {
        self.labels.get(function)
    }

    /// True for file-scope variables and for names never declared in the
    /// unit at their point of use.
    pub fn is_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }

    /// True when the unit defines a function of this name.
    pub fn is_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    fn scopes_visible(&self, a: ScopeId, b: ScopeId) -> bool {
        a == b || self.is_ancestor(a, b) || self.is_ancestor(b, a)
    }

    fn is_ancestor(&self, ancestor: ScopeId, mut scope: ScopeId) -> bool {
        while let Some(parent) = self.scope(scope).parent {
            if parent == ancestor {
                return true;
            }
            scope = parent;
        }
        false
    }
}

/// Builder walking the tree with an explicit scope stack.
struct ScopeBuilder {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    stack: Vec<ScopeId>,
    used: [FxHashSet<String>; 4],
    call_sites: Vec<CallSite>,
    address_taken: FxHashMap<String, u32>,
    labels: FxHashMap<String, FxHashSet<String>>,
    globals: FxHashSet<String>,
    functions: FxHashSet<String>,
    current_function: Option<String>,
    /// Label name -> binding index, for the function being walked.
    label_bindings: FxHashMap<String, usize>,
    pos: u32,
    loop_depth: usize,
    switch_depth: usize,
}

impl ScopeBuilder {
    fn new() -> ScopeBuilder {
        ScopeBuilder {
            scopes: Vec::new(),
            bindings: Vec::new(),
            stack: Vec::new(),
            used: Default::default(),
            call_sites: Vec::new(),
            address_taken: FxHashMap::default(),
            labels: FxHashMap::default(),
            globals: FxHashSet::default(),
            functions: FxHashSet::default(),
            current_function: None,
            label_bindings: FxHashMap::default(),
            pos: 0,
            loop_depth: 0,
            switch_depth: 0,
        }
    }

    fn build(mut self, unit: &SourceUnit) -> Result<ScopeAnalysis, ParseInputError> {
        self.push_scope();

        // Bind all file-scope names before walking bodies so that calls to
        // later definitions resolve.
        for item in &unit.items {
            match item {
                Item::Function(f) => {
                    let ty = CType::Function {
                        ret: Box::new(f.ret.clone()),
                        params: f.params.iter().map(|p| p.ty.clone()).collect(),
                        variadic: f.variadic,
                    };
                    self.bind(&f.name, NameSpace::Ordinary, BindingKind::Function, Some(ty))?;
                    self.functions.insert(f.name.clone());
                }
                Item::Decl(d) => {
                    self.bind(
                        &d.name,
                        NameSpace::Ordinary,
                        BindingKind::Variable,
                        Some(d.ty.clone()),
                    )?;
                    self.globals.insert(d.name.clone());
                }
                Item::Typedef(t) => {
                    self.bind(
                        &t.name,
                        NameSpace::Ordinary,
                        BindingKind::Typedef,
                        Some(t.ty.clone()),
                    )?;
                }
            }
        }

        for item in &unit.items {
            match item {
                Item::Function(f) => self.walk_function(f)?,
                Item::Decl(d) => self.walk_initializer(&d.init),
                Item::Typedef(t) => self.walk_type(&t.ty),
            }
        }

        self.pop_scope();

        Ok(ScopeAnalysis {
            scopes: self.scopes,
            bindings: self.bindings,
            used: self.used,
            call_sites: self.call_sites,
            address_taken: self.address_taken,
            labels: self.labels,
            globals: self.globals,
            functions: self.functions,
        })
    }

    fn walk_function(&mut self, f: &FunctionDef) -> Result<(), ParseInputError> {
        self.current_function = Some(f.name.clone());
        self.push_scope();

        for p in &f.params {
            self.walk_type(&p.ty);
            self.bind(&p.name, NameSpace::Ordinary, BindingKind::Variable, Some(p.ty.clone()))?;
        }

        // Labels live in the function's outermost scope, collected up front
        // so that forward gotos resolve.
        self.label_bindings.clear();
        let mut defined = FxHashSet::default();
        collect_labels(&f.body, &mut |label| {
            if !defined.insert(label.to_string()) {
                return Err(ParseInputError::DuplicateLabel {
                    function: f.name.clone(),
                    label: label.to_string(),
                });
            }
            Ok(())
        })?;
        for label in &defined {
            let idx = self.bind(label, NameSpace::Label, BindingKind::Label, None)?;
            self.label_bindings.insert(label.clone(), idx);
        }
        self.labels.insert(f.name.clone(), defined);

        for stmt in &f.body {
            self.walk_stmt(stmt)?;
        }

        self.pop_scope();
        self.current_function = None;
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> Result<(), ParseInputError> {
        self.tick();
        match stmt {
            Stmt::Expr(e) => self.walk_expr(e),
            Stmt::Decl(d) => self.walk_decl(d)?,
            Stmt::EnumDecl(def) => {
                self.bind(&def.tag, NameSpace::Tag, BindingKind::Aggregate, None)?;
                for name in &def.enumerators {
                    self.bind(
                        name,
                        NameSpace::Ordinary,
                        BindingKind::Enumerator,
                        Some(CType::Enum(def.tag.clone())),
                    )?;
                }
            }
            Stmt::Compound(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.walk_stmt(s)?;
                }
                self.pop_scope();
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.walk_expr(cond);
                self.walk_stmt(then_branch)?;
                if let Some(e) = else_branch {
                    self.walk_stmt(e)?;
                }
            }
            Stmt::While { cond, body } => {
                self.walk_expr(cond);
                self.loop_depth += 1;
                self.walk_stmt(body)?;
                self.loop_depth -= 1;
            }
            Stmt::DoWhile { body, cond } => {
                self.loop_depth += 1;
                self.walk_stmt(body)?;
                self.loop_depth -= 1;
                self.walk_expr(cond);
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                // The header declaration opens its own scope around the loop.
                self.push_scope();
                match init.as_deref() {
                    Some(ForInit::Decl(d)) => self.walk_decl(d)?,
                    Some(ForInit::Expr(e)) => self.walk_expr(e),
                    None => {}
                }
                if let Some(c) = cond {
                    self.walk_expr(c);
                }
                if let Some(s) = step {
                    self.walk_expr(s);
                }
                self.loop_depth += 1;
                self.walk_stmt(body)?;
                self.loop_depth -= 1;
                self.pop_scope();
            }
            Stmt::Switch { cond, cases } => {
                self.walk_expr(cond);
                self.switch_depth += 1;
                self.push_scope();
                for case in cases {
                    if let crate::ast::CaseLabel::Case(e) = &case.label {
                        self.walk_expr(e);
                    }
                    for s in &case.body {
                        self.walk_stmt(s)?;
                    }
                }
                self.pop_scope();
                self.switch_depth -= 1;
            }
            Stmt::Break => {
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    return Err(ParseInputError::StrayJump {
                        function: self.current_function.clone().unwrap_or_default(),
                        stmt: "break",
                    });
                }
            }
            Stmt::Continue => {
                if self.loop_depth == 0 {
                    return Err(ParseInputError::StrayJump {
                        function: self.current_function.clone().unwrap_or_default(),
                        stmt: "continue",
                    });
                }
            }
            Stmt::Goto(label) => {
                match self.label_bindings.get(label) {
                    Some(&idx) => self.bindings[idx].last_use = self.pos,
                    None => {
                        return Err(ParseInputError::UndefinedLabel {
                            function: self.current_function.clone().unwrap_or_default(),
                            label: label.clone(),
                        })
                    }
                }
            }
            Stmt::Labeled { label, stmt } => {
                if let Some(&idx) = self.label_bindings.get(label) {
                    self.bindings[idx].last_use = self.pos;
                }
                self.walk_stmt(stmt)?;
            }
            Stmt::Return(e) => {
                if let Some(e) = e {
                    self.walk_expr(e);
                }
            }
            Stmt::Empty => {}
        }
        Ok(())
    }

    fn walk_decl(&mut self, d: &Declaration) -> Result<(), ParseInputError> {
        self.walk_type(&d.ty);
        self.bind(&d.name, NameSpace::Ordinary, BindingKind::Variable, Some(d.ty.clone()))?;
        self.walk_initializer(&d.init);
        Ok(())
    }

    fn walk_initializer(&mut self, init: &Option<Initializer>) {
        fn go(b: &mut ScopeBuilder, init: &Initializer) {
            match init {
                Initializer::Expr(e) => b.walk_expr(e),
                Initializer::List(items) => {
                    for i in items {
                        go(b, i);
                    }
                }
            }
        }
        if let Some(init) = init {
            go(self, init);
        }
    }

    /// Record type-level uses: typedef names, tags, and identifiers inside
    /// array length expressions.
    fn walk_type(&mut self, ty: &CType) {
        match ty {
            CType::Named(name) => self.record_use(name, NameSpace::Ordinary),
            CType::Record(tag) | CType::Enum(tag) => self.record_use(tag, NameSpace::Tag),
            CType::Pointer(inner) => self.walk_type(inner),
            CType::Array { elem, len } => {
                self.walk_type(elem);
                if let Some(len) = len {
                    self.walk_expr(len);
                }
            }
            CType::Function { ret, params, .. } => {
                self.walk_type(ret);
                for p in params {
                    self.walk_type(p);
                }
            }
            CType::Void | CType::Int(_) | CType::Real(_) => {}
        }
    }

    fn walk_expr(&mut self, e: &Expr) {
        self.tick();
        match e {
            Expr::Ident(name) => self.use_ident(name, false),
            Expr::Call { callee, args } => {
                if let Expr::Ident(name) = callee.as_ref() {
                    self.use_ident(name, true);
                    self.call_sites.push(CallSite {
                        callee: name.clone(),
                        caller: self.current_function.clone(),
                        position: self.pos,
                    });
                } else {
                    self.walk_expr(callee);
                }
                for a in args {
                    self.walk_expr(a);
                }
            }
            Expr::Unary(_, inner) | Expr::SizeOfExpr(inner) => self.walk_expr(inner),
            Expr::Binary(_, l, r) => {
                self.walk_expr(l);
                self.walk_expr(r);
            }
            Expr::Assign { target, value, .. } => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond);
                self.walk_expr(then_expr);
                self.walk_expr(else_expr);
            }
            Expr::Index { base, index } => {
                self.walk_expr(base);
                self.walk_expr(index);
            }
            Expr::Member { base, field, .. } => {
                self.walk_expr(base);
                self.record_use(field, NameSpace::Member);
            }
            Expr::Cast { ty, expr } => {
                self.walk_type(ty);
                self.walk_expr(expr);
            }
            Expr::Comma(parts) => {
                for p in parts {
                    self.walk_expr(p);
                }
            }
            Expr::SizeOfType(ty) => self.walk_type(ty),
            Expr::IntLit(_) | Expr::RealLit(_) | Expr::CharLit(_) | Expr::StrLit(_) => {}
        }
    }

    /// Resolve an ordinary-namespace use. A function name in non-callee
    /// position counts as address-taken. Unresolved names are assumed to be
    /// externally declared globals.
    fn use_ident(&mut self, name: &str, callee: bool) {
        self.record_use(name, NameSpace::Ordinary);
        match self.resolve(name) {
            Some(idx) => {
                self.bindings[idx].last_use = self.pos;
                if !callee && self.bindings[idx].kind == BindingKind::Function {
                    self.address_taken
                        .entry(name.to_string())
                        .or_insert(self.pos);
                }
            }
            None => {
                self.globals.insert(name.to_string());
            }
        }
    }

    fn resolve(&self, name: &str) -> Option<usize> {
        for &sid in self.stack.iter().rev() {
            for &idx in self.scopes[sid.index()].bindings.iter().rev() {
                let b = &self.bindings[idx];
                if b.namespace == NameSpace::Ordinary && b.name == name {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn bind(
        &mut self,
        name: &str,
        namespace: NameSpace,
        kind: BindingKind,
        ty: Option<CType>,
    ) -> Result<usize, ParseInputError> {
        let scope = *self.stack.last().expect("scope stack never empty during build");
        let clash = self.scopes[scope.index()]
            .bindings
            .iter()
            .any(|&i| self.bindings[i].namespace == namespace && self.bindings[i].name == name);
        if clash {
            return Err(ParseInputError::DuplicateBinding {
                name: name.to_string(),
                namespace: namespace.as_str(),
            });
        }

        self.record_use(name, namespace);
        let idx = self.bindings.len();
        self.bindings.push(Binding {
            name: name.to_string(),
            namespace,
            kind,
            ty,
            scope,
            function: self.current_function.clone(),
            declared: self.pos,
            last_use: self.pos,
        });
        self.scopes[scope.index()].bindings.push(idx);
        Ok(idx)
    }

    fn record_use(&mut self, name: &str, namespace: NameSpace) {
        self.used[namespace as usize].insert(name.to_string());
    }

    fn push_scope(&mut self) {
        let id = ScopeId(self.scopes.len() as u32);
        let parent = self.stack.last().copied();
        self.scopes.push(Scope {
            id,
            parent,
            bindings: Vec::new(),
            span: (self.pos, self.pos),
        });
        self.stack.push(id);
    }

    fn pop_scope(&mut self) {
        let id = self.stack.pop().expect("pop on empty scope stack");
        self.scopes[id.index()].span.1 = self.pos;
    }

    fn tick(&mut self) {
        self.pos += 1;
    }
}

/// Visit every label definition in a statement list, nested bodies included.
fn collect_labels(
    stmts: &[Stmt],
    f: &mut impl FnMut(&str) -> Result<(), ParseInputError>,
) -> Result<(), ParseInputError> {
    for stmt in stmts {
        collect_labels_stmt(stmt, f)?;
    }
    Ok(())
}

fn collect_labels_stmt(
    stmt: &Stmt,
    f: &mut impl FnMut(&str) -> Result<(), ParseInputError>,
) -> Result<(), ParseInputError> {
    match stmt {
        Stmt::Labeled { label, stmt } => {
            f(label)?;
            collect_labels_stmt(stmt, f)?;
        }
        Stmt::Compound(stmts) => collect_labels(stmts, f)?,
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_labels_stmt(then_branch, f)?;
            if let Some(e) = else_branch {
                collect_labels_stmt(e, f)?;
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            collect_labels_stmt(body, f)?;
        }
        Stmt::Switch { cases, .. } => {
            for case in cases {
                collect_labels(&case.body, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionDef, Item, Param};

    fn unit_with(body: Vec<Stmt>) -> SourceUnit {
        SourceUnit::new(vec![Item::Function(FunctionDef {
            name: "f".to_string(),
            ret: CType::int(),
            params: vec![Param::new("a", CType::int())],
            variadic: false,
            body,
        })])
    }

    fn decl(name: &str) -> Stmt {
        Stmt::Decl(Declaration::new(name, CType::int(), None))
    }

    #[test]
    fn duplicate_binding_in_one_scope_is_rejected() {
        let unit = unit_with(vec![decl("x"), decl("x")]);
        let err = ScopeAnalysis::run(&unit).unwrap_err();
        assert!(matches!(err, ParseInputError::DuplicateBinding { .. }));
    }

    #[test]
    fn shadowing_in_nested_scope_is_two_bindings() {
        let unit = unit_with(vec![decl("x"), Stmt::Compound(vec![decl("x")])]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();
        let count = analysis
            .bindings()
            .iter()
            .filter(|b| b.name == "x" && b.namespace == NameSpace::Ordinary)
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn fresh_name_avoids_everything_in_the_namespace() {
        let unit = unit_with(vec![decl("tmp"), decl("tmp1")]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();
        let mut taken = FxHashSet::default();
        assert_eq!(analysis.fresh_name("tmp", NameSpace::Ordinary, &taken), "tmp2");
        taken.insert("tmp2".to_string());
        assert_eq!(analysis.fresh_name("tmp", NameSpace::Ordinary, &taken), "tmp3");
    }

    #[test]
    fn labels_do_not_collide_with_variables() {
        let unit = unit_with(vec![
            decl("out"),
            Stmt::Labeled {
                label: "out".to_string(),
                stmt: Box::new(Stmt::Return(Some(Expr::IntLit(0)))),
            },
        ]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();
        assert!(analysis.labels("f").unwrap().contains("out"));
        assert!(!analysis.name_in_use("out2", NameSpace::Label));
    }

    #[test]
    fn name_in_use_sees_bindings_and_uses() {
        let unit = unit_with(vec![
            decl("bound"),
            Stmt::Expr(Expr::Ident("referenced".to_string())),
        ]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();
        assert!(analysis.name_in_use("bound", NameSpace::Ordinary));
        assert!(analysis.name_in_use("referenced", NameSpace::Ordinary));
        assert!(!analysis.name_in_use("absent", NameSpace::Ordinary));
    }

    #[test]
    fn goto_to_undefined_label_is_rejected() {
        let unit = unit_with(vec![Stmt::Goto("missing".to_string())]);
        let err = ScopeAnalysis::run(&unit).unwrap_err();
        assert!(matches!(err, ParseInputError::UndefinedLabel { .. }));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let labeled = |l: &str| Stmt::Labeled {
            label: l.to_string(),
            stmt: Box::new(Stmt::Empty),
        };
        let unit = unit_with(vec![labeled("here"), labeled("here")]);
        let err = ScopeAnalysis::run(&unit).unwrap_err();
        assert!(matches!(err, ParseInputError::DuplicateLabel { .. }));
    }

    #[test]
    fn stray_break_is_rejected_but_switch_break_is_fine() {
        let unit = unit_with(vec![Stmt::Break]);
        assert!(matches!(
            ScopeAnalysis::run(&unit).unwrap_err(),
            ParseInputError::StrayJump { stmt: "break", .. }
        ));

        let unit = unit_with(vec![Stmt::Switch {
            cond: Expr::Ident("a".to_string()),
            cases: vec![crate::ast::SwitchCase {
                label: crate::ast::CaseLabel::Default,
                body: vec![Stmt::Break],
            }],
        }]);
        assert!(ScopeAnalysis::run(&unit).is_ok());
    }

    #[test]
    fn call_and_address_taken_are_distinguished() {
        let callee = FunctionDef {
            name: "g".to_string(),
            ret: CType::int(),
            params: vec![],
            variadic: false,
            body: vec![Stmt::Return(Some(Expr::IntLit(1)))],
        };
        let caller = FunctionDef {
            name: "f".to_string(),
            ret: CType::int(),
            params: vec![],
            variadic: false,
            body: vec![
                Stmt::Expr(Expr::call("g", vec![])),
                Stmt::Decl(Declaration::new(
                    "p",
                    CType::Pointer(Box::new(CType::int())),
                    Some(Initializer::Expr(Expr::Unary(
                        crate::ast::UnOp::AddrOf,
                        Box::new(Expr::Ident("g".to_string())),
                    ))),
                )),
            ],
        };
        let unit = SourceUnit::new(vec![Item::Function(callee), Item::Function(caller)]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();

        let sites: Vec<_> = analysis.call_sites("g").collect();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].caller.as_deref(), Some("f"));
        assert!(analysis.address_taken("g").is_some());
        assert!(analysis.address_taken("f").is_none());
    }

    #[test]
    fn pack_intervals_reuses_colors_for_disjoint_lifetimes() {
        // x dies before y is declared in a sibling scope; z overlaps both.
        let unit = unit_with(vec![
            decl("z"),
            Stmt::Compound(vec![decl("x"), Stmt::Expr(Expr::Ident("x".to_string()))]),
            Stmt::Compound(vec![decl("y"), Stmt::Expr(Expr::Ident("y".to_string()))]),
            Stmt::Expr(Expr::Ident("z".to_string())),
        ]);
        let analysis = ScopeAnalysis::run(&unit).unwrap();
        let ids: Vec<usize> = ["z", "x", "y"]
            .iter()
            .map(|n| {
                analysis
                    .bindings()
                    .iter()
                    .position(|b| b.name == *n && b.kind == BindingKind::Variable)
                    .unwrap()
            })
            .collect();
        let colors = analysis.pack_intervals(&ids);
        // z conflicts with both; x and y are in sibling scopes.
        assert_ne!(colors[0], colors[1]);
        assert_ne!(colors[0], colors[2]);
        assert_eq!(colors[1], colors[2]);
    }
}
