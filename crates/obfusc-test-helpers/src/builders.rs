//! Compact builders for test trees.
//!
//! These cover the shapes the integration tests construct over and over;
//! anything unusual is built from the AST types directly.

use obfusc_core::ast::{
    BinOp, CType, Declaration, Expr, FunctionDef, Initializer, Item, Param, SourceUnit, Stmt,
};

pub fn int() -> CType {
    CType::int()
}

pub fn lit(v: i64) -> Expr {
    Expr::IntLit(v)
}

pub fn ident(name: &str) -> Expr {
    Expr::Ident(name.to_string())
}

pub fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
    Expr::binary(op, l, r)
}

pub fn param(name: &str) -> Param {
    Param::new(name, int())
}

/// `int <name> = <init>;`
pub fn decl(name: &str, init: Expr) -> Stmt {
    Stmt::Decl(Declaration::new(
        name,
        int(),
        Some(Initializer::Expr(init)),
    ))
}

/// `<name> = <value>;`
pub fn assign(name: &str, value: Expr) -> Stmt {
    Stmt::Expr(Expr::assign(ident(name), value))
}

pub fn ret(e: Expr) -> Stmt {
    Stmt::Return(Some(e))
}

/// `print(<args>);` — the interpreter records each argument in its output
/// trace.
pub fn print(args: Vec<Expr>) -> Stmt {
    Stmt::Expr(Expr::call("print", args))
}

pub fn if_else(cond: Expr, then: Vec<Stmt>, els: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond,
        then_branch: Box::new(Stmt::Compound(then)),
        else_branch: if els.is_empty() {
            None
        } else {
            Some(Box::new(Stmt::Compound(els)))
        },
    }
}

pub fn while_loop(cond: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::While {
        cond,
        body: Box::new(Stmt::Compound(body)),
    }
}

pub fn function(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> FunctionDef {
    FunctionDef {
        name: name.to_string(),
        ret: int(),
        params,
        variadic: false,
        body,
    }
}

pub fn unit(functions: Vec<FunctionDef>) -> SourceUnit {
    SourceUnit::new(functions.into_iter().map(Item::Function).collect())
}
