//! A reference interpreter for the C-like AST.
//!
//! Executes a `SourceUnit` directly so tests can compare observable behavior
//! (returned value plus print trace) between a source tree and its
//! obfuscated counterpart. Deliberate simplifications, all irrelevant to the
//! comparisons the tests make:
//!
//! - `sizeof` evaluates to 1, so `alloca(sizeof(T) * n)` allocates `n`
//!   elements.
//! - `rand()` is a fixed-seed linear congruential generator; two interpreter
//!   instances produce the same stream.
//! - `printf`/`print` record their (non-format) arguments in an output trace
//!   instead of formatting.
//! - `goto` resolves labels within the enclosing statement lists; the tests
//!   only jump to labels at function or compound level.

use obfusc_core::ast::{
    AssignOp, BinOp, CType, CaseLabel, Expr, ForInit, FunctionDef, Initializer, Item, SourceUnit,
    Stmt, UnOp,
};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// A runtime value. Arrays are shared so element assignment through a copied
/// binding (the hoisted-pointer case) stays visible.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Real(f64),
    Array(Rc<RefCell<Vec<Value>>>),
    Str(String),
}

impl Value {
    pub fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Real(v) => *v != 0.0,
            Value::Array(_) | Value::Str(_) => true,
        }
    }

    fn as_int(&self) -> Result<i64, String> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Real(v) => Ok(*v as i64),
            other => Err(format!("expected a number, got {other:?}")),
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Real(v) => format!("{v}"),
            Value::Str(s) => s.clone(),
            Value::Array(_) => "<array>".to_string(),
        }
    }
}

/// How control left a statement.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
    Goto(String),
}

const STEP_LIMIT: u64 = 4_000_000;

pub struct Interpreter<'a> {
    unit: &'a SourceUnit,
    globals: FxHashMap<String, Value>,
    output: Vec<String>,
    rand_state: u64,
    steps: u64,
}

/// One call frame: a stack of lexical scopes plus the enumerator constants
/// seen so far in this function.
struct Frame {
    scopes: Vec<FxHashMap<String, Value>>,
    enums: FxHashMap<String, i64>,
}

impl Frame {
    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn declare(&mut self, name: &str, value: Value) {
        self.scopes
            .last_mut()
            .expect("frame always has a scope")
            .insert(name.to_string(), value);
    }
}

impl<'a> Interpreter<'a> {
    pub fn new(unit: &'a SourceUnit) -> Interpreter<'a> {
        let mut interp = Interpreter {
            unit,
            globals: FxHashMap::default(),
            output: Vec::new(),
            rand_state: 0x243f_6a88_85a3_08d3,
            steps: 0,
        };
        // File-scope declarations get their (constant) initializers; anything
        // unevaluable starts as zero.
        for item in &unit.items {
            if let Item::Decl(d) = item {
                let mut frame = Frame {
                    scopes: vec![FxHashMap::default()],
                    enums: FxHashMap::default(),
                };
                let value = match &d.init {
                    Some(Initializer::Expr(e)) => {
                        interp.eval(e, &mut frame).unwrap_or(Value::Int(0))
                    }
                    _ => Value::Int(0),
                };
                interp.globals.insert(d.name.clone(), value);
            }
        }
        interp
    }

    /// The print trace accumulated so far.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Call a defined function with the given arguments.
    pub fn run_function(&mut self, name: &str, args: &[Value]) -> Result<Value, String> {
        let f = self
            .unit
            .function(name)
            .ok_or_else(|| format!("no function named `{name}`"))?;
        self.call(f, args.to_vec())
    }

    fn call(&mut self, f: &'a FunctionDef, args: Vec<Value>) -> Result<Value, String> {
        let mut frame = Frame {
            scopes: vec![FxHashMap::default()],
            enums: FxHashMap::default(),
        };
        for (i, p) in f.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Int(0));
            frame.declare(&p.name, value);
        }
        match self.exec_stmts(&f.body, &mut frame)? {
            Flow::Return(v) => Ok(v),
            Flow::Goto(label) => Err(format!("unresolved goto `{label}` in `{}`", f.name)),
            _ => Ok(Value::Int(0)),
        }
    }

    fn tick(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err("step limit exceeded".to_string());
        }
        Ok(())
    }

    fn rand(&mut self) -> i64 {
        self.rand_state = self
            .rand_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.rand_state >> 33) & 0x7fff_ffff) as i64
    }

    // -- statements --------------------------------------------------------

    fn exec_stmts(&mut self, stmts: &[Stmt], frame: &mut Frame) -> Result<Flow, String> {
        let mut index = 0;
        while index < stmts.len() {
            match self.exec_stmt(&stmts[index], frame)? {
                Flow::Normal => index += 1,
                Flow::Goto(label) => {
                    // Resume at the label if this list defines it, otherwise
                    // keep unwinding.
                    match stmts.iter().position(|s| has_label(s, &label)) {
                        Some(target) => index = target,
                        None => return Ok(Flow::Goto(label)),
                    }
                }
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, frame: &mut Frame) -> Result<Flow, String> {
        self.tick()?;
        match stmt {
            Stmt::Empty => Ok(Flow::Normal),
            Stmt::Expr(e) => {
                self.eval(e, frame)?;
                Ok(Flow::Normal)
            }
            Stmt::Decl(d) => {
                let value = self.initial_value(&d.ty, d.init.as_ref(), frame)?;
                frame.declare(&d.name, value);
                Ok(Flow::Normal)
            }
            Stmt::EnumDecl(def) => {
                for (i, name) in def.enumerators.iter().enumerate() {
                    frame.enums.insert(name.clone(), i as i64);
                }
                Ok(Flow::Normal)
            }
            Stmt::Compound(stmts) => {
                frame.scopes.push(FxHashMap::default());
                let flow = self.exec_stmts(stmts, frame);
                frame.scopes.pop();
                flow
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval(cond, frame)?.truthy() {
                    self.exec_stmt(then_branch, frame)
                } else if let Some(e) = else_branch {
                    self.exec_stmt(e, frame)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, frame)?.truthy() {
                    self.tick()?;
                    match self.exec_stmt(body, frame)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, cond } => {
                loop {
                    self.tick()?;
                    match self.exec_stmt(body, frame)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        other => return Ok(other),
                    }
                    if !self.eval(cond, frame)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                frame.scopes.push(FxHashMap::default());
                match init.as_deref() {
                    Some(ForInit::Decl(d)) => {
                        let value = self.initial_value(&d.ty, d.init.as_ref(), frame)?;
                        frame.declare(&d.name, value);
                    }
                    Some(ForInit::Expr(e)) => {
                        self.eval(e, frame)?;
                    }
                    None => {}
                }
                let flow = loop {
                    self.tick()?;
                    let go = match cond {
                        Some(c) => self.eval(c, frame)?.truthy(),
                        None => true,
                    };
                    if !go {
                        break Flow::Normal;
                    }
                    match self.exec_stmt(body, frame)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break Flow::Normal,
                        other => break other,
                    }
                    if let Some(s) = step {
                        self.eval(s, frame)?;
                    }
                };
                frame.scopes.pop();
                Ok(flow)
            }
            Stmt::Switch { cond, cases } => {
                let scrutinee = self.eval(cond, frame)?.as_int()?;
                let mut start = None;
                let mut default = None;
                for (i, case) in cases.iter().enumerate() {
                    match &case.label {
                        CaseLabel::Case(value) => {
                            if self.eval(value, frame)?.as_int()? == scrutinee {
                                start = Some(i);
                                break;
                            }
                        }
                        CaseLabel::Default => default = Some(i),
                    }
                }
                let mut index = match start.or(default) {
                    Some(i) => i,
                    None => return Ok(Flow::Normal),
                };
                frame.scopes.push(FxHashMap::default());
                let mut flow = Flow::Normal;
                'arms: while index < cases.len() {
                    for stmt in &cases[index].body {
                        match self.exec_stmt(stmt, frame)? {
                            Flow::Normal => {}
                            Flow::Break => break 'arms,
                            other => {
                                flow = other;
                                break 'arms;
                            }
                        }
                    }
                    // Fall through into the next arm.
                    index += 1;
                }
                frame.scopes.pop();
                Ok(flow)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Goto(label) => Ok(Flow::Goto(label.clone())),
            Stmt::Labeled { stmt, .. } => self.exec_stmt(stmt, frame),
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => self.eval(e, frame)?,
                    None => Value::Int(0),
                };
                Ok(Flow::Return(v))
            }
        }
    }

    fn initial_value(
        &mut self,
        ty: &CType,
        init: Option<&Initializer>,
        frame: &mut Frame,
    ) -> Result<Value, String> {
        if let CType::Array { len, .. } = ty {
            let size = match len {
                Some(l) => self.eval(l, frame)?.as_int()?.max(0) as usize,
                None => match init {
                    Some(Initializer::List(items)) => items.len(),
                    _ => 0,
                },
            };
            let mut elems = vec![Value::Int(0); size];
            if let Some(Initializer::List(items)) = init {
                for (i, item) in items.iter().enumerate() {
                    if let Initializer::Expr(e) = item {
                        if i < elems.len() {
                            elems[i] = self.eval(e, frame)?;
                        }
                    }
                }
            }
            return Ok(Value::Array(Rc::new(RefCell::new(elems))));
        }
        match init {
            Some(Initializer::Expr(e)) => self.eval(e, frame),
            Some(Initializer::List(items)) => match items.first() {
                Some(Initializer::Expr(e)) if items.len() == 1 => self.eval(e, frame),
                _ => Ok(Value::Int(0)),
            },
            None => Ok(Value::Int(0)),
        }
    }

    // -- expressions -------------------------------------------------------

    /// Evaluate a closed expression: no free identifiers besides
    /// enumerators and globals.
    pub fn eval_expr(&mut self, e: &Expr) -> Result<Value, String> {
        let mut frame = Frame {
            scopes: vec![FxHashMap::default()],
            enums: FxHashMap::default(),
        };
        self.eval(e, &mut frame)
    }

    fn eval(&mut self, e: &Expr, frame: &mut Frame) -> Result<Value, String> {
        self.tick()?;
        match e {
            Expr::IntLit(v) => Ok(Value::Int(*v)),
            Expr::RealLit(v) => Ok(Value::Real(*v)),
            Expr::CharLit(c) => Ok(Value::Int(*c as i64)),
            Expr::StrLit(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => self.read_ident(name, frame),
            Expr::Unary(op, inner) => self.eval_unary(*op, inner, frame),
            Expr::Binary(op, l, r) => self.eval_binary(*op, l, r, frame),
            Expr::Assign { op, target, value } => {
                let rhs = self.eval(value, frame)?;
                let result = match op {
                    AssignOp::Assign => rhs,
                    compound => {
                        let current = self.eval(target, frame)?;
                        apply_binop(compound_op(*compound), &current, &rhs)?
                    }
                };
                self.write(target, result.clone(), frame)?;
                Ok(result)
            }
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.eval(cond, frame)?.truthy() {
                    self.eval(then_expr, frame)
                } else {
                    self.eval(else_expr, frame)
                }
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, frame),
            Expr::Index { base, index } => {
                let array = self.eval(base, frame)?;
                let i = self.eval(index, frame)?.as_int()?;
                match array {
                    Value::Array(elems) => elems
                        .borrow()
                        .get(i as usize)
                        .cloned()
                        .ok_or_else(|| format!("index {i} out of bounds")),
                    other => Err(format!("indexing a non-array value {other:?}")),
                }
            }
            Expr::Cast { ty, expr } => {
                let v = self.eval(expr, frame)?;
                Ok(match (ty.is_integer(), v) {
                    (true, Value::Real(r)) => Value::Int(r as i64),
                    (false, Value::Int(i)) if ty.is_real() => Value::Real(i as f64),
                    (_, v) => v,
                })
            }
            Expr::Comma(parts) => {
                let mut last = Value::Int(0);
                for p in parts {
                    last = self.eval(p, frame)?;
                }
                Ok(last)
            }
            // Sizes collapse to 1 so alloca arguments count elements.
            Expr::SizeOfType(_) => Ok(Value::Int(1)),
            Expr::SizeOfExpr(_) => Ok(Value::Int(1)),
            Expr::Member { .. } => Err("member access is not modeled".to_string()),
        }
    }

    fn read_ident(&mut self, name: &str, frame: &mut Frame) -> Result<Value, String> {
        if let Some(v) = frame.lookup(name) {
            return Ok(v.clone());
        }
        if let Some(v) = frame.enums.get(name) {
            return Ok(Value::Int(*v));
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        Err(format!("unbound identifier `{name}`"))
    }

    fn eval_unary(&mut self, op: UnOp, inner: &Expr, frame: &mut Frame) -> Result<Value, String> {
        if op.has_side_effect() {
            let old = self.eval(inner, frame)?;
            let old_int = old.as_int()?;
            let delta = match op {
                UnOp::PreInc | UnOp::PostInc => 1,
                _ => -1,
            };
            let new = Value::Int(old_int.wrapping_add(delta));
            self.write(inner, new.clone(), frame)?;
            return Ok(match op {
                UnOp::PostInc | UnOp::PostDec => old,
                _ => new,
            });
        }
        let v = self.eval(inner, frame)?;
        match op {
            UnOp::Plus => Ok(v),
            UnOp::Neg => Ok(match v {
                Value::Int(i) => Value::Int(i.wrapping_neg()),
                Value::Real(r) => Value::Real(-r),
                other => return Err(format!("negating {other:?}")),
            }),
            UnOp::Not => Ok(Value::Int(if v.truthy() { 0 } else { 1 })),
            UnOp::BitNot => Ok(Value::Int(!v.as_int()?)),
            UnOp::Deref | UnOp::AddrOf => Err("pointers are not modeled".to_string()),
            _ => unreachable!("side-effecting ops handled above"),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        l: &Expr,
        r: &Expr,
        frame: &mut Frame,
    ) -> Result<Value, String> {
        // Short-circuit forms evaluate the right side conditionally.
        match op {
            BinOp::LogAnd => {
                let lv = self.eval(l, frame)?;
                if !lv.truthy() {
                    return Ok(Value::Int(0));
                }
                let rv = self.eval(r, frame)?;
                return Ok(Value::Int(if rv.truthy() { 1 } else { 0 }));
            }
            BinOp::LogOr => {
                let lv = self.eval(l, frame)?;
                if lv.truthy() {
                    return Ok(Value::Int(1));
                }
                let rv = self.eval(r, frame)?;
                return Ok(Value::Int(if rv.truthy() { 1 } else { 0 }));
            }
            _ => {}
        }
        let lv = self.eval(l, frame)?;
        let rv = self.eval(r, frame)?;
        apply_binop(op, &lv, &rv)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        frame: &mut Frame,
    ) -> Result<Value, String> {
        let name = match callee {
            Expr::Ident(name) => name.clone(),
            other => return Err(format!("calls through {other:?} are not modeled")),
        };
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.eval(a, frame)?);
        }
        match name.as_str() {
            "rand" => Ok(Value::Int(self.rand())),
            "alloca" => {
                let n = values
                    .first()
                    .map(Value::as_int)
                    .transpose()?
                    .unwrap_or(0)
                    .max(0) as usize;
                Ok(Value::Array(Rc::new(RefCell::new(vec![Value::Int(0); n]))))
            }
            "abs" | "labs" | "llabs" => {
                Ok(Value::Int(values.first().map(Value::as_int).transpose()?.unwrap_or(0).abs()))
            }
            "print" => {
                for v in &values {
                    self.output.push(v.render());
                }
                Ok(Value::Int(0))
            }
            "printf" => {
                // The format string is skipped; the values are the trace.
                for v in values.iter().skip(1) {
                    self.output.push(v.render());
                }
                Ok(Value::Int(0))
            }
            _ => match self.unit.function(&name) {
                Some(f) => self.call(f, values),
                None => Err(format!("call to undefined function `{name}`")),
            },
        }
    }

    fn write(&mut self, target: &Expr, value: Value, frame: &mut Frame) -> Result<(), String> {
        match target {
            Expr::Ident(name) => {
                if let Some(slot) = frame.lookup_mut(name) {
                    *slot = value;
                    return Ok(());
                }
                if let Some(slot) = self.globals.get_mut(name) {
                    *slot = value;
                    return Ok(());
                }
                Err(format!("assignment to unbound identifier `{name}`"))
            }
            Expr::Index { base, index } => {
                let array = self.eval(base, frame)?;
                let i = self.eval(index, frame)?.as_int()?;
                match array {
                    Value::Array(elems) => {
                        let mut elems = elems.borrow_mut();
                        let len = elems.len();
                        match elems.get_mut(i as usize) {
                            Some(slot) => {
                                *slot = value;
                                Ok(())
                            }
                            None => Err(format!("index {i} out of bounds (len {len})")),
                        }
                    }
                    other => Err(format!("indexing a non-array value {other:?}")),
                }
            }
            other => Err(format!("unsupported assignment target {other:?}")),
        }
    }
}

/// Evaluate a closed expression against an empty unit.
pub fn eval_closed(unit: &SourceUnit, e: &Expr) -> Result<Value, String> {
    Interpreter::new(unit).eval_expr(e)
}

fn has_label(stmt: &Stmt, label: &str) -> bool {
    let (_, labels) = stmt.peel_labels();
    labels.contains(&label)
}

fn compound_op(op: AssignOp) -> BinOp {
    match op {
        AssignOp::Add => BinOp::Add,
        AssignOp::Sub => BinOp::Sub,
        AssignOp::Mul => BinOp::Mul,
        AssignOp::Div => BinOp::Div,
        AssignOp::Rem => BinOp::Rem,
        AssignOp::Shl => BinOp::Shl,
        AssignOp::Shr => BinOp::Shr,
        AssignOp::And => BinOp::BitAnd,
        AssignOp::Xor => BinOp::BitXor,
        AssignOp::Or => BinOp::BitOr,
        AssignOp::Assign => unreachable!("plain assignment handled by the caller"),
    }
}

fn apply_binop(op: BinOp, l: &Value, r: &Value) -> Result<Value, String> {
    use BinOp::*;
    // Usual promotion: any real operand makes the operation real.
    if let (Value::Real(_), _) | (_, Value::Real(_)) = (l, r) {
        let a = match l {
            Value::Real(v) => *v,
            other => other.as_int()? as f64,
        };
        let b = match r {
            Value::Real(v) => *v,
            other => other.as_int()? as f64,
        };
        return Ok(match op {
            Add => Value::Real(a + b),
            Sub => Value::Real(a - b),
            Mul => Value::Real(a * b),
            Div => Value::Real(a / b),
            Lt => Value::Int((a < b) as i64),
            Le => Value::Int((a <= b) as i64),
            Gt => Value::Int((a > b) as i64),
            Ge => Value::Int((a >= b) as i64),
            Eq => Value::Int((a == b) as i64),
            Ne => Value::Int((a != b) as i64),
            _ => return Err(format!("{op:?} on real operands")),
        });
    }
    let a = l.as_int()?;
    let b = r.as_int()?;
    Ok(match op {
        Add => Value::Int(a.wrapping_add(b)),
        Sub => Value::Int(a.wrapping_sub(b)),
        Mul => Value::Int(a.wrapping_mul(b)),
        Div => {
            if b == 0 {
                return Err("division by zero".to_string());
            }
            Value::Int(a.wrapping_div(b))
        }
        Rem => {
            if b == 0 {
                return Err("remainder by zero".to_string());
            }
            Value::Int(a.wrapping_rem(b))
        }
        Shl => Value::Int(a.wrapping_shl(b as u32)),
        Shr => Value::Int(a.wrapping_shr(b as u32)),
        BitAnd => Value::Int(a & b),
        BitXor => Value::Int(a ^ b),
        BitOr => Value::Int(a | b),
        Lt => Value::Int((a < b) as i64),
        Le => Value::Int((a <= b) as i64),
        Gt => Value::Int((a > b) as i64),
        Ge => Value::Int((a >= b) as i64),
        Eq => Value::Int((a == b) as i64),
        Ne => Value::Int((a != b) as i64),
        LogAnd | LogOr => unreachable!("short-circuit forms handled by the caller"),
    })
}
