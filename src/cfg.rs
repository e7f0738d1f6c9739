//! Control flow graph.
//!
//! Built by the semantic pass, one per emittable unit (program entry, each
//! function/sub/worker). The block emitter never mutates a CFG; it only
//! walks it in the recorded reverse-postorder.

use crate::ast::{ExprId, StmtId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Entry,
    Normal,
    LoopHeader,
    LoopBody,
    LoopIncrement,
    CaseTest,
    CaseOtherwise,
    Merge,
    ExitBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    Jump,
    BranchTrue,
    BranchFalse,
    BackEdge,
    LoopExit,
    CaseMatch,
    CaseNext,
    GosubCall,
    GosubReturn,
    ComputedBranch,
    Exit,
    Exception,
    Finally,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub target: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub index: usize,
    pub kind: BlockKind,
    pub name: Option<String>,
    pub stmts: Vec<StmtId>,
    pub branch_cond: Option<ExprId>,
    pub preds: Vec<usize>,
    pub succs: Vec<Edge>,
}

impl BasicBlock {
    pub fn new(index: usize, kind: BlockKind) -> Self {
        BasicBlock {
            index,
            kind,
            name: None,
            stmts: Vec::new(),
            branch_cond: None,
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    pub fn successors_of_kind(&self, kind: EdgeKind) -> Vec<usize> {
        self.succs
            .iter()
            .filter(|e| std::mem::discriminant(&e.kind) == std::mem::discriminant(&kind))
            .map(|e| e.target)
            .collect()
    }

    pub fn has_edge_kind(&self, kind: EdgeKind) -> bool {
        self.succs
            .iter()
            .any(|e| std::mem::discriminant(&e.kind) == std::mem::discriminant(&kind))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub rpo: Vec<usize>,
    pub gosub_return_points: Vec<usize>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, kind: BlockKind) -> usize {
        let idx = self.blocks.len();
        self.blocks.push(BasicBlock::new(idx, kind));
        idx
    }

    pub fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        self.blocks[from].succs.push(Edge { target: to, kind });
        self.blocks[to].preds.push(from);
    }

    pub fn block(&self, idx: usize) -> &BasicBlock {
        &self.blocks[idx]
    }

    /// Computes and stores reverse postorder from the entry block (index
    /// 0). Unreachable blocks are omitted, mirroring "every block
    /// reachable in the CFG produces exactly one labelled block."
    pub fn compute_rpo(&mut self) {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        if !self.blocks.is_empty() {
            self.dfs_postorder(0, &mut visited, &mut postorder);
        }
        postorder.reverse();
        self.rpo = postorder;
    }

    fn dfs_postorder(&self, node: usize, visited: &mut [bool], out: &mut Vec<usize>) {
        if visited[node] {
            return;
        }
        visited[node] = true;
        for edge in &self.blocks[node].succs {
            self.dfs_postorder(edge.target, visited, out);
        }
        out.push(node);
    }

    /// Distinct return-point block ids collected from `gosub_return`
    /// edges, sorted ascending, as required by the sparse GOSUB dispatch.
    pub fn collect_gosub_return_points(&self) -> Vec<usize> {
        let mut points: Vec<usize> = self
            .blocks
            .iter()
            .flat_map(|b| b.successors_of_kind(EdgeKind::GosubReturn))
            .collect();
        points.sort_unstable();
        points.dedup();
        points
    }
}
