//! CFG-driven QBE IL codegen core for a BASIC-family compiler.
//!
//! Lexing, parsing, and semantic analysis all happen upstream of this
//! crate. What lands here is a [`Program`]: an expression/statement arena,
//! a fully resolved [`symtab::SymbolTable`], and one [`cfg::Cfg`] per
//! emittable function plus the program entry point. [`codegen::CodeGenerator`]
//! walks that structure and produces QBE's textual IL, ready to hand to
//! `qbe` for the final lowering to assembly.
//!
//! The crate never touches the filesystem or spawns the QBE binary itself;
//! it only assembles IL text in memory and reports diagnostics through
//! [`error::Diagnostics`] for anything it had to guess at or recover from.

#![warn(missing_docs, unused_import_braces)]

/// True when this build was compiled with whole-UDT NEON acceleration
/// available. The actual decision to emit a NEON fast path still comes
/// from [`symtab::SymbolTable::neon_enabled`] at codegen time, since an
/// AArch64-compiled library may still target a BASIC program that never
/// opted in; this constant only says whether the `neon_*` runtime entry
/// points can be linked at all.
#[cfg(feature = "neon")]
pub const NEON_SUPPORTED: bool = true;

/// See the `neon` feature's definition above.
#[cfg(not(feature = "neon"))]
pub const NEON_SUPPORTED: bool = false;

mod ast;
mod block;
mod builder;
mod cfg;
mod codegen;
mod context;
mod error;
mod expr;
mod mangle;
mod runtime;
mod scope;
mod symtab;
mod types;

pub use ast::{
    Ast, BinOp, CaseArm, ChainSegment, Expr, ExprId, ExitKind, ForEachCollection, ForEachStmt, ForStmt,
    LetTarget, Literal, MatchReceiveArm, MatchTypeArm, ReduceOp, SourceLoc, Stmt, StmtId, TimeUnit, UnOp,
};
pub use cfg::{BasicBlock, BlockKind, Cfg, Edge, EdgeKind};
pub use codegen::{CodeGenerator, FunctionRole, FunctionUnit, Program};
pub use error::{CodegenError, CodegenResult, Diagnostic, Diagnostics};
pub use runtime::{RuntimeFn, RuntimeLibrary, RUNTIME_FNS};
pub use scope::FunctionScopeAnalyzer;
pub use symtab::{
    ArraySymbol, BaseType, ClassSymbol, FunctionSymbol, MethodDesc, ParamDesc, Scope, SimdArrangement,
    SimdInfo, StepDirection, SymbolTable, TypeSymbol, UdtField, VariableSymbol,
};
pub use types::{IlType, LoadSuffix, StoreSuffix, TypeManager};
