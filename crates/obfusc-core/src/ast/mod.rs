//! AST data model for the C-like source language.
//!
//! The parser and pretty-printer are external collaborators; the core
//! consumes an already-built `SourceUnit` and produces a rewritten one. Trees
//! are owned values: every transform takes a unit and returns a new unit, so
//! a failed transform never leaves a half-mutated tree behind.

pub mod expr;
pub mod stmt;
pub mod ty;

pub use expr::{AssignOp, BinOp, Expr, UnOp};
pub use stmt::{CaseLabel, Declaration, EnumDef, ForInit, Initializer, Stmt, SwitchCase};
pub use ty::{CType, IntKind, RealKind};

/// One function parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: CType,
}

impl Param {
    pub fn new(name: &str, ty: CType) -> Param {
        Param {
            name: name.to_string(),
            ty,
        }
    }
}

/// A function definition with a body.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub ret: CType,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub body: Vec<Stmt>,
}

/// A typedef at file scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Typedef {
    pub name: String,
    pub ty: CType,
}

/// One top-level item of a translation unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Function(FunctionDef),
    Decl(Declaration),
    Typedef(Typedef),
}

/// The root of one parsed translation unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceUnit {
    pub items: Vec<Item>,
}

impl SourceUnit {
    pub fn new(items: Vec<Item>) -> SourceUnit {
        SourceUnit { items }
    }

    /// Iterate the function definitions in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut FunctionDef> {
        self.items.iter_mut().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions().find(|f| f.name == name)
    }
}
