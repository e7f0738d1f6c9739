//! Program AST.
//!
//! Statements and expressions are sum types with a payload per variant,
//! matched in the block and expression emitters rather than dispatched
//! through virtual calls. Nodes are arena-allocated (`ExprId`/`StmtId`
//! index into an [`Ast`]) so subtrees can reference each other without
//! ownership friction; the AST itself is read-only once semantic analysis
//! hands it to codegen.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    Avg,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A member-access / array-index chain segment, used by LET targets and
/// by `Expr::Member`/`Expr::ArrayAccess` to describe `a.b(i).c` style
/// paths without needing a separate lvalue AST.
#[derive(Debug, Clone)]
pub enum ChainSegment {
    Field(String),
    Index(Vec<ExprId>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(Literal),
    StringLit(String),
    Variable(String),
    Binary(BinOp, ExprId, ExprId),
    Unary(UnOp, ExprId),
    Call {
        name: String,
        args: Vec<ExprId>,
    },
    Iif {
        cond: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    },
    Member {
        base: ExprId,
        field: String,
    },
    ArrayAccess {
        base: ExprId,
        indices: Vec<ExprId>,
    },
    Create {
        type_name: String,
        positional: Vec<ExprId>,
        named: Vec<(String, ExprId)>,
    },
    New {
        class_name: String,
        args: Vec<ExprId>,
    },
    Me,
    Nothing,
    Is(ExprId, ExprId),
    Super,
    ListCtor(Vec<ExprId>),
    ArrayBinop {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    ArrayReduce {
        op: ReduceOp,
        array: ExprId,
        other: Option<ExprId>,
    },
    MethodCall {
        receiver: ExprId,
        method: String,
        args: Vec<ExprId>,
    },
    Spawn {
        target: String,
        args: Vec<ExprId>,
        messaging: bool,
    },
    Await(ExprId),
    Ready(ExprId),
    Receive(ExprId),
    HasMessage(ExprId),
    Parent,
    Cancelled(ExprId),
    Marshall(ExprId),
}

#[derive(Debug, Clone)]
pub struct LetTarget {
    pub name: String,
    pub chain: Vec<ChainSegment>,
}

#[derive(Debug, Clone)]
pub struct ForStmt {
    pub var: String,
    pub start: ExprId,
    pub limit: ExprId,
    pub step: Option<ExprId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForEachCollection {
    Array,
    List,
    Hashmap,
}

#[derive(Debug, Clone)]
pub struct ForEachStmt {
    pub collection_kind: ForEachCollection,
    pub collection: ExprId,
    pub item_var: String,
    pub index_var: Option<String>,
    pub value_var: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaseArm {
    pub test_values: Vec<ExprId>,
    pub body: Vec<StmtId>,
}

#[derive(Debug, Clone)]
pub struct MatchTypeArm {
    pub bind_var: String,
    pub type_name: String,
    pub body: Vec<StmtId>,
}

#[derive(Debug, Clone)]
pub struct MatchReceiveArm {
    pub bind_var: String,
    pub type_name: String,
    pub is_forward: bool,
    pub body: Vec<StmtId>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Print {
        items: Vec<ExprId>,
        newline: bool,
        file: Option<ExprId>,
    },
    Console {
        items: Vec<ExprId>,
        newline: bool,
    },
    Let {
        target: LetTarget,
        suffix: Option<char>,
        value: ExprId,
    },
    Dim {
        name: String,
        as_type: Option<String>,
        dims: Vec<ExprId>,
        init: Option<ExprId>,
        is_global: bool,
    },
    Local {
        name: String,
        as_type: Option<String>,
        init: Option<ExprId>,
    },
    Shared(String),
    Erase(String),
    Call {
        name: String,
        args: Vec<ExprId>,
    },
    Return(Option<ExprId>),
    Inc(LetTarget),
    Dec(LetTarget),
    Swap(LetTarget, LetTarget),
    Input {
        prompt: Option<ExprId>,
        target: LetTarget,
    },
    Wrch(ExprId),
    Wrstr(ExprId),
    Cls,
    Gcls,
    Locate {
        col: ExprId,
        row: ExprId,
    },
    Color {
        fg: ExprId,
        bg: Option<ExprId>,
    },
    TerminalControl {
        op: String,
        args: Vec<ExprId>,
    },
    Keyboard {
        op: String,
        target: Option<LetTarget>,
    },
    Send {
        handle: ExprId,
        value: ExprId,
    },
    Cancel(ExprId),
    After {
        handle: ExprId,
        delay: ExprId,
        unit: TimeUnit,
        send: Option<ExprId>,
    },
    Every {
        handle: ExprId,
        interval: ExprId,
        unit: TimeUnit,
        send: Option<ExprId>,
    },
    TimerStopAll,
    TimerStop(ExprId),
    TimerStopHandler(String),
    Unmarshall {
        target: LetTarget,
        source: ExprId,
    },
    If {
        cond: ExprId,
        then_body: Vec<StmtId>,
        else_body: Vec<StmtId>,
    },
    While {
        cond: ExprId,
        body: Vec<StmtId>,
    },
    DoLoop {
        body: Vec<StmtId>,
        cond: Option<ExprId>,
        post_test: bool,
        until: bool,
    },
    For(ForStmt, Vec<StmtId>),
    ForEach(ForEachStmt, Vec<StmtId>),
    SelectCase {
        selector: ExprId,
        arms: Vec<CaseArm>,
        otherwise: Vec<StmtId>,
    },
    MatchType {
        arms: Vec<MatchTypeArm>,
    },
    MatchReceive {
        handle: ExprId,
        arms: Vec<MatchReceiveArm>,
    },
    TryCatch {
        body: Vec<StmtId>,
        catch_body: Vec<StmtId>,
    },
    Goto(String),
    Gosub(String),
    OnGoto {
        selector: ExprId,
        targets: Vec<String>,
    },
    OnGosub {
        selector: ExprId,
        targets: Vec<String>,
    },
    Exit(ExitKind),
    End,
    Label(String),
    Rem,
    Option,
    TypeDecl,
    ClassDecl,
    DataDecl,
    FuncDecl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Milliseconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Loop,
    For,
    Sub,
    Function,
}

/// Owning arena for a program's statements and expressions. Indices
/// (`StmtId`/`ExprId`) are stable for the arena's lifetime.
#[derive(Debug, Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    expr_locs: Vec<SourceLoc>,
    stmts: Vec<Stmt>,
    stmt_locs: Vec<SourceLoc>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_expr(&mut self, expr: Expr, loc: SourceLoc) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        self.expr_locs.push(loc);
        id
    }

    pub fn push_stmt(&mut self, stmt: Stmt, loc: SourceLoc) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(stmt);
        self.stmt_locs.push(loc);
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn expr_loc(&self, id: ExprId) -> SourceLoc {
        self.expr_locs[id.0 as usize]
    }

    pub fn stmt_loc(&self, id: StmtId) -> SourceLoc {
        self.stmt_locs[id.0 as usize]
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }
}
