//! Function Scope Analyzer: decides whether a function body needs a
//! SAMM (scope-aware memory manager) enter/exit pair wrapped around it.
//!
//! A function only pays for scope tracking when it could plausibly leak:
//! it declares locals that need cleanup (`DIM`), or it loops and also
//! allocates inside the loop (a single allocation outside a loop is
//! covered by the function-exit cleanup already).

use crate::ast::{Ast, Stmt, StmtId};

pub struct FunctionScopeAnalyzer<'a> {
    ast: &'a Ast,
}

impl<'a> FunctionScopeAnalyzer<'a> {
    pub fn new(ast: &'a Ast) -> Self {
        FunctionScopeAnalyzer { ast }
    }

    pub fn needs_scope(&self, body: &[StmtId]) -> bool {
        let has_dim = self.any_stmt(body, &mut |s| matches!(s, Stmt::Dim { .. }));
        if has_dim {
            return true;
        }
        let has_loops = self.any_stmt(body, &mut |s| {
            matches!(s, Stmt::For(..) | Stmt::ForEach(..) | Stmt::While { .. } | Stmt::DoLoop { .. })
        });
        has_loops && self.any_loop_contains_allocation(body)
    }

    fn any_stmt(&self, body: &[StmtId], pred: &mut dyn FnMut(&Stmt) -> bool) -> bool {
        for &id in body {
            let stmt = self.ast.stmt(id);
            if pred(stmt) {
                return true;
            }
            if self.walk_children(stmt, pred) {
                return true;
            }
        }
        false
    }

    fn walk_children(&self, stmt: &Stmt, pred: &mut dyn FnMut(&Stmt) -> bool) -> bool {
        match stmt {
            Stmt::If { then_body, else_body, .. } => self.any_stmt(then_body, pred) || self.any_stmt(else_body, pred),
            Stmt::While { body, .. } | Stmt::DoLoop { body, .. } => self.any_stmt(body, pred),
            Stmt::For(_, body) | Stmt::ForEach(_, body) => self.any_stmt(body, pred),
            Stmt::SelectCase { arms, otherwise, .. } => {
                arms.iter().any(|a| self.any_stmt(&a.body, pred)) || self.any_stmt(otherwise, pred)
            }
            Stmt::MatchType { arms } => arms.iter().any(|a| self.any_stmt(&a.body, pred)),
            Stmt::MatchReceive { arms, .. } => arms.iter().any(|a| self.any_stmt(&a.body, pred)),
            Stmt::TryCatch { body, catch_body } => self.any_stmt(body, pred) || self.any_stmt(catch_body, pred),
            _ => false,
        }
    }

    /// Allocation inside a loop means CREATE/NEW/array-growth expressions
    /// reachable from a loop body; approximated here by checking DIM with
    /// an initializer or LET assigning the result of CREATE/NEW, since
    /// those are the statement forms that can materialize a new heap or
    /// stack object per iteration.
    fn any_loop_contains_allocation(&self, body: &[StmtId]) -> bool {
        fn loop_bodies<'a>(ast: &'a Ast, stmts: &[StmtId], out: &mut Vec<&'a [StmtId]>) {
            for &id in stmts {
                match ast.stmt(id) {
                    Stmt::For(_, b) | Stmt::ForEach(_, b) => {
                        out.push(b);
                        loop_bodies(ast, b, out);
                    }
                    Stmt::While { body, .. } | Stmt::DoLoop { body, .. } => {
                        out.push(body);
                        loop_bodies(ast, body, out);
                    }
                    Stmt::If { then_body, else_body, .. } => {
                        loop_bodies(ast, then_body, out);
                        loop_bodies(ast, else_body, out);
                    }
                    Stmt::SelectCase { arms, otherwise, .. } => {
                        for a in arms {
                            loop_bodies(ast, &a.body, out);
                        }
                        loop_bodies(ast, otherwise, out);
                    }
                    _ => {}
                }
            }
        }
        let mut bodies = Vec::new();
        loop_bodies(self.ast, body, &mut bodies);
        bodies.iter().any(|b| {
            self.any_stmt(b, &mut |s| match s {
                Stmt::Dim { init: Some(e), .. } => self.expr_allocates(*e),
                Stmt::Let { value, .. } => self.expr_allocates(*value),
                _ => false,
            })
        })
    }

    fn expr_allocates(&self, id: crate::ast::ExprId) -> bool {
        matches!(self.ast.expr(id), crate::ast::Expr::Create { .. } | crate::ast::Expr::New { .. })
    }
}
