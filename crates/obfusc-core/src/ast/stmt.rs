//! Statement nodes.
//!
//! `switch` bodies are a flat case list: every case owns the statements up to
//! the next case label, and control falls through into the following case
//! unless a `break` intervenes. This mirrors the language's real flat
//! dispatch semantics; cases are not nested scopes.

use crate::ast::expr::Expr;
use crate::ast::ty::CType;

/// One declared name with optional initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub ty: CType,
    pub is_const: bool,
    pub init: Option<Initializer>,
}

impl Declaration {
    pub fn new(name: &str, ty: CType, init: Option<Initializer>) -> Declaration {
        Declaration {
            name: name.to_string(),
            ty,
            is_const: false,
            init,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Expr(Expr),
    List(Vec<Initializer>),
}

/// The first clause of a `for` header.
#[derive(Debug, Clone, PartialEq)]
pub enum ForInit {
    Decl(Declaration),
    Expr(Expr),
}

/// An enum definition. Enumerator values are implicit `0..n`, which is all
/// the flattener's enumerator case style needs.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub tag: String,
    pub enumerators: Vec<String>,
}

/// A case label inside a `switch` body.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseLabel {
    Case(Expr),
    Default,
}

/// One labeled arm of a `switch`; falls through to the next arm.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub label: CaseLabel,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Decl(Declaration),
    EnumDecl(EnumDef),
    Compound(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<ForInit>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Switch {
        cond: Expr,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Goto(String),
    Labeled {
        label: String,
        stmt: Box<Stmt>,
    },
    Return(Option<Expr>),
    Empty,
}

impl Stmt {
    /// Wrap a statement in a single-element compound unless it already is one.
    pub fn into_compound(self) -> Vec<Stmt> {
        match self {
            Stmt::Compound(stmts) => stmts,
            other => vec![other],
        }
    }

    /// Strip label wrappers, returning the innermost statement and the label
    /// chain from outermost in.
    pub fn peel_labels(&self) -> (&Stmt, Vec<&str>) {
        let mut labels = Vec::new();
        let mut cur = self;
        while let Stmt::Labeled { label, stmt } = cur {
            labels.push(label.as_str());
            cur = stmt;
        }
        (cur, labels)
    }
}
