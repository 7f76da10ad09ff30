//! Control flow graph construction from a function body.
//!
//! Blocks own clones of their straight-line statements, so a consumer can
//! re-emit a block's code without holding a borrow of the original tree.
//! ENTRY and EXIT are sentinel blocks with no statements. Unreachable blocks
//! (code after `return`, `break`, `goto`) are kept in the graph with no
//! incoming edges; `reachable_blocks` filters them out.

use crate::ast::{CaseLabel, Expr, ForInit, FunctionDef, Stmt};
use rustc_hash::FxHashMap;

/// Unique identifier for a basic block within one function's CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The entry block; control flow begins here.
    pub const ENTRY: BlockId = BlockId(0);
    /// The exit block; every return edge ends here.
    pub const EXIT: BlockId = BlockId(1);

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// A basic block: straight-line statements plus one terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub stmts: Vec<Stmt>,
    pub terminator: Terminator,
}

/// How control leaves a basic block.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Implicit continuation into the next block in source order.
    FallThrough(BlockId),
    /// Explicit jump: `goto`, `break`, `continue`, or a loop back-edge.
    Jump(BlockId),
    /// Two-way branch on a condition.
    Branch {
        cond: Expr,
        then_target: BlockId,
        else_target: BlockId,
    },
    /// Multi-way dispatch on a switch scrutinee. `default` is the default
    /// case's block, or the join block when the switch has no default.
    SwitchDispatch {
        scrutinee: Expr,
        cases: Vec<(Expr, BlockId)>,
        default: BlockId,
    },
    /// Return from the function; the edge goes to EXIT.
    Return(Option<Expr>),
    /// No terminator assigned yet, or dead code with no way out.
    Unreachable,
}

impl Terminator {
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Terminator::FallThrough(t) | Terminator::Jump(t) => vec![*t],
            Terminator::Branch {
                then_target,
                else_target,
                ..
            } => vec![*then_target, *else_target],
            Terminator::SwitchDispatch { cases, default, .. } => {
                let mut targets: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                targets.push(*default);
                targets
            }
            Terminator::Return(_) => vec![BlockId::EXIT],
            Terminator::Unreachable => vec![],
        }
    }

    fn is_open(&self) -> bool {
        matches!(self, Terminator::Unreachable)
    }
}

/// The control flow graph of a single function.
#[derive(Debug)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub predecessors: FxHashMap<BlockId, Vec<BlockId>>,
    pub successors: FxHashMap<BlockId, Vec<BlockId>>,
    /// Targets of back-edges.
    pub loop_headers: Vec<BlockId>,
}

impl Cfg {
    pub fn build(f: &FunctionDef) -> Cfg {
        CfgBuilder::build(&f.body)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn preds(&self, id: BlockId) -> &[BlockId] {
        self.predecessors.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn succs(&self, id: BlockId) -> &[BlockId] {
        self.successors.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Blocks reachable from ENTRY, in deterministic preorder following each
    /// terminator's target order. Sentinels included.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut stack = vec![BlockId::ENTRY];
        while let Some(id) = stack.pop() {
            if visited[id.index()] {
                continue;
            }
            visited[id.index()] = true;
            order.push(id);
            let targets = self.blocks[id.index()].terminator.targets();
            for &t in targets.iter().rev() {
                if !visited[t.index()] {
                    stack.push(t);
                }
            }
        }
        order
    }

    /// Blocks in reverse postorder from ENTRY, for forward dataflow.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        self.dfs_postorder(BlockId::ENTRY, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn dfs_postorder(&self, block: BlockId, visited: &mut Vec<bool>, postorder: &mut Vec<BlockId>) {
        if visited[block.index()] {
            return;
        }
        visited[block.index()] = true;
        for succ in self.blocks[block.index()].terminator.targets() {
            self.dfs_postorder(succ, visited, postorder);
        }
        postorder.push(block);
    }
}

/// One enclosing `break`/`continue` target frame. Switches push a frame with
/// no continue target; `continue` skips them.
struct Frame {
    break_to: BlockId,
    continue_to: Option<BlockId>,
}

struct CfgBuilder {
    blocks: Vec<BasicBlock>,
    frames: Vec<Frame>,
    labels: FxHashMap<String, BlockId>,
    loop_headers: Vec<BlockId>,
}

impl CfgBuilder {
    fn build(body: &[Stmt]) -> Cfg {
        let mut builder = CfgBuilder {
            blocks: Vec::new(),
            frames: Vec::new(),
            labels: FxHashMap::default(),
            loop_headers: Vec::new(),
        };

        let entry = builder.new_block();
        debug_assert_eq!(entry, BlockId::ENTRY);
        let exit = builder.new_block();
        debug_assert_eq!(exit, BlockId::EXIT);

        // Pre-create a block per label so forward gotos have a target.
        builder.scan_labels(body);

        let first = builder.new_block();
        builder.set_terminator(BlockId::ENTRY, Terminator::FallThrough(first));

        let mut current = first;
        for stmt in body {
            current = builder.process_stmt(stmt, current);
        }
        // A body that falls off the end returns implicitly. An empty dead
        // block left over after return/goto stays edgeless instead.
        let has_preds = builder
            .blocks
            .iter()
            .any(|b| b.terminator.targets().contains(&current));
        if builder.is_open(current)
            && (current == first || has_preds || !builder.blocks[current.index()].stmts.is_empty())
        {
            builder.set_terminator(current, Terminator::Return(None));
        }
        builder.set_terminator(BlockId::EXIT, Terminator::Unreachable);

        builder.finalize()
    }

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            stmts: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block.index()].terminator = term;
    }

    fn is_open(&self, block: BlockId) -> bool {
        self.blocks[block.index()].terminator.is_open()
    }

    fn scan_labels(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.scan_labels_stmt(stmt);
        }
    }

    fn scan_labels_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Labeled { label, stmt } => {
                let block = self.new_block();
                self.labels.insert(label.clone(), block);
                self.scan_labels_stmt(stmt);
            }
            Stmt::Compound(stmts) => self.scan_labels(stmts),
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.scan_labels_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.scan_labels_stmt(e);
                }
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
                self.scan_labels_stmt(body);
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    self.scan_labels(&case.body);
                }
            }
            _ => {}
        }
    }

    /// Process one statement, splitting blocks at control flow. Returns the
    /// block subsequent statements land in.
    fn process_stmt(&mut self, stmt: &Stmt, current: BlockId) -> BlockId {
        // A closed block means dead code follows; keep it in an edgeless block.
        if !self.is_open(current) {
            let dead = self.new_block();
            return self.process_stmt(stmt, dead);
        }

        match stmt {
            Stmt::Expr(_) | Stmt::Decl(_) | Stmt::EnumDecl(_) => {
                self.blocks[current.index()].stmts.push(stmt.clone());
                current
            }
            Stmt::Empty => current,
            Stmt::Compound(stmts) => {
                let mut cur = current;
                for s in stmts {
                    cur = self.process_stmt(s, cur);
                }
                cur
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let join = self.new_block();

                let then_block = self.new_block();
                let then_end = self.process_stmt(then_branch, then_block);
                if self.is_open(then_end) {
                    self.set_terminator(then_end, Terminator::Jump(join));
                }

                let else_target = match else_branch {
                    Some(else_branch) => {
                        let else_block = self.new_block();
                        let else_end = self.process_stmt(else_branch, else_block);
                        if self.is_open(else_end) {
                            self.set_terminator(else_end, Terminator::Jump(join));
                        }
                        else_block
                    }
                    None => join,
                };

                self.set_terminator(
                    current,
                    Terminator::Branch {
                        cond: cond.clone(),
                        then_target: then_block,
                        else_target,
                    },
                );
                join
            }
            Stmt::While { cond, body } => {
                let header = self.new_block();
                let body_block = self.new_block();
                let exit = self.new_block();

                self.set_terminator(current, Terminator::FallThrough(header));
                self.set_terminator(
                    header,
                    Terminator::Branch {
                        cond: cond.clone(),
                        then_target: body_block,
                        else_target: exit,
                    },
                );

                self.frames.push(Frame {
                    break_to: exit,
                    continue_to: Some(header),
                });
                let body_end = self.process_stmt(body, body_block);
                self.frames.pop();
                if self.is_open(body_end) {
                    self.set_terminator(body_end, Terminator::Jump(header));
                }
                self.loop_headers.push(header);
                exit
            }
            Stmt::DoWhile { body, cond } => {
                let body_block = self.new_block();
                let cond_block = self.new_block();
                let exit = self.new_block();

                self.set_terminator(current, Terminator::FallThrough(body_block));

                self.frames.push(Frame {
                    break_to: exit,
                    continue_to: Some(cond_block),
                });
                let body_end = self.process_stmt(body, body_block);
                self.frames.pop();
                if self.is_open(body_end) {
                    self.set_terminator(body_end, Terminator::FallThrough(cond_block));
                }
                self.set_terminator(
                    cond_block,
                    Terminator::Branch {
                        cond: cond.clone(),
                        then_target: body_block,
                        else_target: exit,
                    },
                );
                self.loop_headers.push(body_block);
                exit
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                match init.as_deref() {
                    Some(ForInit::Decl(d)) => {
                        self.blocks[current.index()].stmts.push(Stmt::Decl(d.clone()));
                    }
                    Some(ForInit::Expr(e)) => {
                        self.blocks[current.index()].stmts.push(Stmt::Expr(e.clone()));
                    }
                    None => {}
                }

                let header = self.new_block();
                let body_block = self.new_block();
                let step_block = self.new_block();
                let exit = self.new_block();

                self.set_terminator(current, Terminator::FallThrough(header));
                // A missing condition loops unconditionally.
                let cond = cond.clone().unwrap_or(Expr::IntLit(1));
                self.set_terminator(
                    header,
                    Terminator::Branch {
                        cond,
                        then_target: body_block,
                        else_target: exit,
                    },
                );

                self.frames.push(Frame {
                    break_to: exit,
                    continue_to: Some(step_block),
                });
                let body_end = self.process_stmt(body, body_block);
                self.frames.pop();
                if self.is_open(body_end) {
                    self.set_terminator(body_end, Terminator::FallThrough(step_block));
                }

                if let Some(step) = step {
                    self.blocks[step_block.index()].stmts.push(Stmt::Expr(step.clone()));
                }
                self.set_terminator(step_block, Terminator::Jump(header));
                self.loop_headers.push(header);
                exit
            }
            Stmt::Switch { cond, cases } => {
                let join = self.new_block();

                // Every case body is a block entry; an open case end falls
                // through into the next case's block.
                let case_blocks: Vec<BlockId> = cases.iter().map(|_| self.new_block()).collect();

                self.frames.push(Frame {
                    break_to: join,
                    continue_to: None,
                });
                for (i, case) in cases.iter().enumerate() {
                    let mut cur = case_blocks[i];
                    for s in &case.body {
                        cur = self.process_stmt(s, cur);
                    }
                    if self.is_open(cur) {
                        let next = case_blocks.get(i + 1).copied().unwrap_or(join);
                        self.set_terminator(cur, Terminator::FallThrough(next));
                    }
                }
                self.frames.pop();

                let mut dispatch_cases = Vec::new();
                let mut default = join;
                for (i, case) in cases.iter().enumerate() {
                    match &case.label {
                        CaseLabel::Case(value) => {
                            dispatch_cases.push((value.clone(), case_blocks[i]));
                        }
                        CaseLabel::Default => default = case_blocks[i],
                    }
                }
                self.set_terminator(
                    current,
                    Terminator::SwitchDispatch {
                        scrutinee: cond.clone(),
                        cases: dispatch_cases,
                        default,
                    },
                );
                join
            }
            Stmt::Break => {
                let target = self
                    .frames
                    .last()
                    .map(|f| f.break_to)
                    .unwrap_or(BlockId::EXIT);
                self.set_terminator(current, Terminator::Jump(target));
                self.new_block()
            }
            Stmt::Continue => {
                let target = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|f| f.continue_to)
                    .unwrap_or(BlockId::EXIT);
                self.set_terminator(current, Terminator::Jump(target));
                self.new_block()
            }
            Stmt::Goto(label) => {
                match self.labels.get(label) {
                    Some(&target) => self.set_terminator(current, Terminator::Jump(target)),
                    // Validated input never hits this; keep the block dead.
                    None => self.set_terminator(current, Terminator::Unreachable),
                }
                self.new_block()
            }
            Stmt::Labeled { label, stmt } => {
                let block = self.labels[label.as_str()];
                if self.is_open(current) {
                    self.set_terminator(current, Terminator::FallThrough(block));
                }
                self.process_stmt(stmt, block)
            }
            Stmt::Return(value) => {
                self.set_terminator(current, Terminator::Return(value.clone()));
                self.new_block()
            }
        }
    }

    fn finalize(self) -> Cfg {
        let mut successors: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        let mut predecessors: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();

        for block in &self.blocks {
            successors.entry(block.id).or_default();
            predecessors.entry(block.id).or_default();
        }
        for block in &self.blocks {
            for target in block.terminator.targets() {
                successors
                    .entry(block.id)
                    .or_default()
                    .push(target);
                predecessors.entry(target).or_default().push(block.id);
            }
        }

        Cfg {
            blocks: self.blocks,
            predecessors,
            successors,
            loop_headers: self.loop_headers,
        }
    }
}
