//! Expression nodes.

use crate::ast::ty::CType;

/// Unary operators, including the side-effecting increment/decrement forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Plus,
    Not,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Deref,
    AddrOf,
}

impl UnOp {
    pub fn has_side_effect(self) -> bool {
        matches!(self, UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec)
    }
}

/// Binary operators (assignment is a separate node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

/// Assignment operators, plain and compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Xor,
    Or,
}

/// An expression node. Owned tree; transforms clone and rebuild rather than
/// mutating shared structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    RealLit(f64),
    CharLit(u8),
    StrLit(String),
    Ident(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        field: String,
        arrow: bool,
    },
    Cast {
        ty: CType,
        expr: Box<Expr>,
    },
    Comma(Vec<Expr>),
    SizeOfType(CType),
    SizeOfExpr(Box<Expr>),
}

impl Expr {
    /// Shorthand for a direct call to a named function.
    pub fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(Expr::Ident(name.to_string())),
            args,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        Expr::Assign {
            op: AssignOp::Assign,
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    /// True when any identifier occurs anywhere in this expression.
    pub fn references_identifiers(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Ident(_)) {
                found = true;
            }
        });
        found
    }

    /// Visit every sub-expression, this node included, depth-first.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Unary(_, e) | Expr::Cast { expr: e, .. } | Expr::SizeOfExpr(e) => e.walk(f),
            Expr::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Assign { target, value, .. } => {
                target.walk(f);
                value.walk(f);
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                cond.walk(f);
                then_expr.walk(f);
                else_expr.walk(f);
            }
            Expr::Call { callee, args } => {
                callee.walk(f);
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Index { base, index } => {
                base.walk(f);
                index.walk(f);
            }
            Expr::Member { base, .. } => base.walk(f),
            Expr::Comma(parts) => {
                for p in parts {
                    p.walk(f);
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
}
