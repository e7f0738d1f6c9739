//! Block Emitter: walks a function's CFG in reverse postorder, emitting
//! one QBE label per reachable block, the block's statements, and a
//! terminator chosen from its outgoing edge kinds.

use crate::ast::{Ast, BinOp, Expr, ExprId, Stmt, StmtId, TimeUnit};
use crate::builder::{Cmp, IlBuilder};
use crate::cfg::{BlockKind, Cfg, EdgeKind};
use crate::context::{ActiveForwardContext, EmitContext, FunctionContext, MatchArmInfo, MatchReceiveContext, MergeCleanup, SlotInfo};
use crate::error::{CodegenResult, Diagnostics};
use crate::expr::ExpressionEmitter;
use crate::mangle::SymbolMapper;
use crate::runtime::RuntimeLibrary;
use crate::symtab::{BaseType, Scope, SimdArrangement, SymbolTable, TypeSymbol, VariableSymbol};
use crate::types::{LoadSuffix, StoreSuffix, TypeManager};

/// Walks one function's CFG and emits its blocks. Control-flow statements
/// (IF/WHILE/FOR/SELECT CASE/MATCH .../TRY) never appear in a block's
/// statement list: the CFG builder lowers them entirely into block/edge
/// structure before this emitter runs, leaving only leaf statements and
/// branch conditions for it to translate.
pub struct BlockEmitter<'a> {
    pub ast: &'a Ast,
    pub symtab: &'a mut SymbolTable,
    pub types: &'a TypeManager,
    pub mangle: &'a SymbolMapper,
    pub runtime: &'a RuntimeLibrary,
    pub diags: &'a mut Diagnostics,
}

impl<'a> BlockEmitter<'a> {
    pub fn new(
        ast: &'a Ast,
        symtab: &'a mut SymbolTable,
        types: &'a TypeManager,
        mangle: &'a SymbolMapper,
        runtime: &'a RuntimeLibrary,
        diags: &'a mut Diagnostics,
    ) -> Self {
        BlockEmitter { ast, symtab, types, mangle, runtime, diags }
    }

    fn expr_emitter(&mut self) -> ExpressionEmitter<'_> {
        ExpressionEmitter::new(self.ast, self.symtab, self.types, self.mangle, self.runtime, self.diags)
    }

    /// Emits every reachable block of `cfg` in its recorded RPO, plus the
    /// terminator each block's edges imply.
    pub fn emit_function(
        &mut self,
        b: &mut IlBuilder,
        cfg: &Cfg,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let gosub_points = cfg.collect_gosub_return_points();
        for &idx in &cfg.rpo {
            let block = cfg.block(idx);
            let label = block.name.clone().unwrap_or_else(|| format!("blk_{idx}"));
            b.label(&label)?;
            for &stmt_id in &block.stmts {
                self.emit_stmt(b, stmt_id, func, ectx)?;
            }
            self.emit_terminator(b, cfg, block.index, &gosub_points, func, ectx)?;
        }
        Ok(())
    }

    fn emit_terminator(
        &mut self,
        b: &mut IlBuilder,
        cfg: &Cfg,
        idx: usize,
        gosub_points: &[usize],
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let block = cfg.block(idx);
        if b.is_terminated() {
            return Ok(());
        }

        if let Some(target) = block.successors_of_kind(EdgeKind::GosubCall).first() {
            let ret_point = block
                .successors_of_kind(EdgeKind::GosubReturn)
                .first()
                .copied()
                .unwrap_or(idx + 1);
            self.emit_gosub_push(b, ret_point)?;
            b.jump(&format!("blk_{target}"))?;
            return Ok(());
        }

        if block.has_edge_kind(EdgeKind::ComputedBranch) {
            // RETURN's sparse dispatch: pop the saved return point and
            // chain-compare against every distinct GOSUB call site.
            let saved = self.emit_gosub_pop(b)?;
            for (i, &point) in gosub_points.iter().enumerate() {
                let is_match = b.new_temp();
                b.cmp(&is_match, "w", Cmp::Eq, false, &saved, &point.to_string())?;
                let yes = b.new_label();
                let no = if i + 1 < gosub_points.len() { b.new_label() } else { "blk_unreachable".to_string() };
                b.branch(&is_match, &yes, &no)?;
                b.label(&yes)?;
                b.jump(&format!("blk_{point}"))?;
                if i + 1 < gosub_points.len() {
                    b.label(&no)?;
                }
            }
            return Ok(());
        }

        if let (Some(&t), Some(&f)) = (
            block.successors_of_kind(EdgeKind::BranchTrue).first(),
            block.successors_of_kind(EdgeKind::BranchFalse).first(),
        ) {
            let cond = match block.branch_cond {
                Some(c) => self.expr_emitter().emit(b, c, func, ectx)?,
                None => {
                    self.diags.warn(Some(idx), "branch block missing condition");
                    b.warn("branch block missing condition")?;
                    "0".to_string()
                }
            };
            b.branch(&cond, &format!("blk_{t}"), &format!("blk_{f}"))?;
            return Ok(());
        }

        if let Some(t) = block.successors_of_kind(EdgeKind::CaseMatch).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::CaseNext).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::BackEdge).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::LoopExit).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::Jump).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::Fallthrough).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if block.has_edge_kind(EdgeKind::Exit) || block.kind == BlockKind::ExitBlock {
            self.emit_function_exit(b, func)?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::Exception).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }
        if let Some(t) = block.successors_of_kind(EdgeKind::Finally).first() {
            b.jump(&format!("blk_{t}"))?;
            return Ok(());
        }

        // MalformedCfg: no outgoing edge matches a known terminator shape.
        // Recoverable per the error model: warn and fall through to the
        // next RPO block rather than leaving an unterminated block.
        self.diags.warn(Some(idx), "block terminator does not match any outgoing edge kind");
        b.warn("malformed CFG: falling through")?;
        if let Some(&next) = cfg.rpo.iter().skip_while(|&&n| n != idx).nth(1) {
            b.jump(&format!("blk_{next}"))?;
        } else {
            self.emit_function_exit(b, func)?;
        }
        Ok(())
    }

    fn emit_function_exit(&mut self, b: &mut IlBuilder, func: &mut FunctionContext) -> CodegenResult<()> {
        if func.is_function {
            if let Some(addr) = func.return_addr.clone() {
                let dst = b.new_temp();
                let ty = func.return_type.map(|t| t.letter()).unwrap_or("d");
                let suffix = self.types.load_suffix(func.return_base_type);
                b.load(&dst, suffix, ty, &addr)?;
                self.retain_object_return(b, func, &dst)?;
                self.emit_epilogue_calls(b, func)?;
                b.ret(Some(&dst))?;
            } else {
                self.emit_epilogue_calls(b, func)?;
                b.ret(None)?;
            }
        } else {
            self.emit_epilogue_calls(b, func)?;
            b.ret(None)?;
        }
        Ok(())
    }

    /// An object (or other pointer-typed) return value must be retained
    /// before `samm_exit_scope` runs in the epilogue, or the scope's own
    /// exit-time release could free it out from under the caller. Scalar
    /// and UDT-by-value returns never alias scope-tracked storage, so this
    /// is a no-op for them.
    fn retain_object_return(&mut self, b: &mut IlBuilder, func: &FunctionContext, value: &str) -> CodegenResult<()> {
        if func.return_base_type.is_samm_tracked() {
            self.runtime.call(b, None, "samm_retain", &[value.to_string(), "1".to_string()])?;
        }
        Ok(())
    }

    /// Runs scope-exit/runtime-teardown calls registered on `func` at every
    /// exit point — `RETURN`, fallthrough, or an `Exit` edge — so cleanup
    /// happens regardless of which path out of the function is taken.
    fn emit_epilogue_calls(&mut self, b: &mut IlBuilder, func: &FunctionContext) -> CodegenResult<()> {
        for name in func.epilogue_calls.clone() {
            self.runtime.call(b, None, &name, &[])?;
        }
        Ok(())
    }

    // ---- GOSUB stack ---------------------------------------------------

    /// 16-deep process-wide stack: a global array plus a stack pointer
    /// global, so nested GOSUBs across sub boundaries still share one
    /// frame array the way the runtime's single-threaded program model
    /// expects.
    fn emit_gosub_push(&mut self, b: &mut IlBuilder, return_point: usize) -> CodegenResult<()> {
        let sp = b.new_temp();
        b.load(&sp, LoadSuffix::Word, "w", "$gosub_sp")?;
        let idx64 = b.new_temp();
        b.extend(&idx64, "extsw", &sp)?;
        let offset = b.new_temp();
        b.binop(&offset, "l", "mul", &idx64, "4")?;
        let addr = b.new_temp();
        b.binop(&addr, "l", "add", "$gosub_stack", &offset)?;
        b.store(StoreSuffix::W, &return_point.to_string(), &addr)?;
        let new_sp = b.new_temp();
        b.binop(&new_sp, "w", "add", &sp, "1")?;
        b.store(StoreSuffix::W, &new_sp, "$gosub_sp")?;
        Ok(())
    }

    fn emit_gosub_pop(&mut self, b: &mut IlBuilder) -> CodegenResult<String> {
        let sp = b.new_temp();
        b.load(&sp, LoadSuffix::Word, "w", "$gosub_sp")?;
        let new_sp = b.new_temp();
        b.binop(&new_sp, "w", "sub", &sp, "1")?;
        b.store(StoreSuffix::W, &new_sp, "$gosub_sp")?;
        let idx64 = b.new_temp();
        b.extend(&idx64, "extsw", &new_sp)?;
        let offset = b.new_temp();
        b.binop(&offset, "l", "mul", &idx64, "4")?;
        let addr = b.new_temp();
        b.binop(&addr, "l", "add", "$gosub_stack", &offset)?;
        let dst = b.new_temp();
        b.load(&dst, LoadSuffix::Word, "w", &addr)?;
        Ok(dst)
    }

    // ---- statement dispatch ---------------------------------------------

    fn emit_stmt(&mut self, b: &mut IlBuilder, id: StmtId, func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        match self.ast.stmt(id).clone() {
            Stmt::Print { items, newline, file } => self.emit_print(b, &items, newline, file, func, ectx),
            Stmt::Console { items, newline } => self.emit_console(b, &items, newline, func, ectx),
            Stmt::Let { target, suffix, value } => self.emit_let(b, &target, suffix, value, func, ectx),
            Stmt::Dim { name, as_type, dims, init, is_global } => {
                self.emit_dim(b, &name, as_type.as_deref(), &dims, init, is_global, func, ectx)
            }
            Stmt::Local { name, as_type, init } => self.emit_local(b, &name, as_type.as_deref(), init, func, ectx),
            Stmt::Shared(_) | Stmt::Rem | Stmt::Option | Stmt::TypeDecl | Stmt::ClassDecl | Stmt::DataDecl | Stmt::FuncDecl => Ok(()),
            Stmt::Erase(name) => {
                let desc = format!("${}", self.mangle.array_descriptor(&name));
                self.runtime.call(b, None, "array_erase", &[desc]).map(|_| ())
            }
            Stmt::Call { name, args } => self.emit_call_stmt(b, &name, &args, func, ectx),
            Stmt::Return(value) => self.emit_return(b, value, func, ectx),
            Stmt::Inc(target) => self.emit_incdec(b, &target, 1, func, ectx),
            Stmt::Dec(target) => self.emit_incdec(b, &target, -1, func, ectx),
            Stmt::Swap(a, c) => self.emit_swap(b, &a, &c, func, ectx),
            Stmt::Input { prompt, target } => self.emit_input(b, prompt, &target, func, ectx),
            Stmt::Wrch(e) => {
                let v = self.expr_emitter().emit(b, e, func, ectx)?;
                self.runtime.call(b, None, "term_wrch", &[v]).map(|_| ())
            }
            Stmt::Wrstr(e) => {
                let v = self.expr_emitter().emit(b, e, func, ectx)?;
                self.runtime.call(b, None, "term_wrstr", &[v]).map(|_| ())
            }
            Stmt::Cls => self.runtime.call(b, None, "term_cls", &[]).map(|_| ()),
            Stmt::Gcls => self.runtime.call(b, None, "term_gcls", &[]).map(|_| ()),
            Stmt::Locate { col, row } => {
                let cv = self.expr_emitter().emit(b, col, func, ectx)?;
                let rv = self.expr_emitter().emit(b, row, func, ectx)?;
                self.runtime.call(b, None, "term_locate", &[cv, rv]).map(|_| ())
            }
            Stmt::Color { fg, bg } => {
                let fv = self.expr_emitter().emit(b, fg, func, ectx)?;
                let bv = match bg {
                    Some(e) => self.expr_emitter().emit(b, e, func, ectx)?,
                    None => "-1".to_string(),
                };
                self.runtime.call(b, None, "term_color", &[fv, bv]).map(|_| ())
            }
            Stmt::TerminalControl { op, args } => self.emit_terminal_control(b, &op, &args, func, ectx),
            Stmt::Keyboard { op, target } => self.emit_keyboard(b, &op, target.as_ref(), func, ectx),
            Stmt::Send { handle, value } => self.emit_send(b, handle, value, func, ectx),
            Stmt::Cancel(h) => {
                let hv = self.expr_emitter().emit(b, h, func, ectx)?;
                self.runtime.call(b, None, "msg_cancel", &[hv]).map(|_| ())
            }
            Stmt::After { handle, delay, unit, send } => self.emit_after(b, handle, delay, unit, send, func, ectx),
            Stmt::Every { handle, interval, unit, send } => self.emit_every(b, handle, interval, unit, send, func, ectx),
            Stmt::TimerStopAll => self.runtime.call(b, None, "timer_stop_all", &[]).map(|_| ()),
            Stmt::TimerStop(e) => {
                let v = self.expr_emitter().emit(b, e, func, ectx)?;
                self.runtime.call(b, None, "timer_stop", &[v]).map(|_| ())
            }
            // No registered timer-handler table to look up at this layer;
            // a no-op is the documented fallback (see DESIGN.md).
            Stmt::TimerStopHandler(_) => Ok(()),
            Stmt::Unmarshall { target, source } => self.emit_unmarshall(b, &target, source, func, ectx),
            Stmt::Goto(label) => b.jump(&format!("lbl_{}", label.to_ascii_uppercase())),
            Stmt::Gosub(_) => Ok(()), // lowered into CFG edges by the GOSUB-call block, not a direct jump here
            Stmt::OnGoto { selector, targets } => self.emit_on_goto(b, selector, &targets, func, ectx),
            Stmt::OnGosub { .. } => Ok(()), // lowered into CFG edges, same as plain GOSUB
            Stmt::Exit(_) | Stmt::End | Stmt::Label(_) => Ok(()),
            // Structured control-flow statements (If/While/DoLoop/For/
            // ForEach/SelectCase/MatchType/TryCatch) are lowered entirely
            // into CFG block/edge structure upstream; reaching one
            // directly here means its body fell outside the CFG split,
            // which the CFG builder guarantees does not happen, so these
            // are no-ops at this layer.
            Stmt::If { .. }
            | Stmt::While { .. }
            | Stmt::DoLoop { .. }
            | Stmt::For(..)
            | Stmt::ForEach(..)
            | Stmt::SelectCase { .. }
            | Stmt::MatchType { .. }
            | Stmt::TryCatch { .. } => Ok(()),
            // MATCH RECEIVE is the one structured statement the CFG
            // builder leaves as a leaf: its dispatch depends on a value
            // (the popped blob's tag/type-id) only known at runtime, so
            // the block emitter expands it in place with its own
            // label/branch sequence instead of pre-split CFG edges.
            Stmt::MatchReceive { handle, arms } => self.emit_match_receive(b, handle, &arms, func, ectx),
        }
    }

    // ---- PRINT / CONSOLE -------------------------------------------------

    fn emit_print(
        &mut self,
        b: &mut IlBuilder,
        items: &[crate::ast::ExprId],
        newline: bool,
        file: Option<crate::ast::ExprId>,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let file_handle = match file {
            Some(e) => Some(self.expr_emitter().emit(b, e, func, ectx)?),
            None => None,
        };
        // PRINT to the console is made atomic at statement granularity by
        // bracketing the whole item loop in the print mutex; a file target
        // has its own per-handle serialization and skips it entirely.
        if file_handle.is_none() {
            self.runtime.call(b, None, "basic_print_lock", &[])?;
        }
        for item in items {
            if let Some((addr, type_name)) = self.resolve_udt_operand(*item, func) {
                self.emit_print_udt(b, &addr, &type_name, file_handle.as_deref())?;
                continue;
            }
            let kind = self.expr_emitter().infer_kind(*item, Some(func), ectx);
            let v = self.expr_emitter().emit(b, *item, func, ectx)?;
            match (&file_handle, kind) {
                (Some(h), crate::expr::ExprKind::Integer) => {
                    self.runtime.call(b, None, "file_print_int", &[h.clone(), v])?;
                }
                (Some(h), crate::expr::ExprKind::Double) => {
                    self.runtime.call(b, None, "file_print_double", &[h.clone(), v])?;
                }
                (Some(h), crate::expr::ExprKind::Str) => {
                    self.runtime.call(b, None, "file_print_string_desc", &[h.clone(), v])?;
                }
                (None, crate::expr::ExprKind::Integer) => {
                    self.runtime.call(b, None, "basic_print_int", &[v])?;
                }
                (None, crate::expr::ExprKind::Double) => {
                    self.runtime.call(b, None, "basic_print_double", &[v])?;
                }
                (None, crate::expr::ExprKind::Str) => {
                    self.runtime.call(b, None, "basic_print_string_desc", &[v])?;
                }
            }
        }
        if newline && file_handle.is_none() {
            self.runtime.call(b, None, "basic_print_newline", &[])?;
        }
        if file_handle.is_none() {
            self.runtime.call(b, None, "basic_print_unlock", &[])?;
        }
        Ok(())
    }

    /// Pretty-prints a UDT value field-by-field as `{F1: v1, F2: v2, ...}`,
    /// recursing into nested UDT fields. `file_handle` selects `file_print_*`
    /// over `basic_print_*` for the scalar/string leaves, matching whichever
    /// family the surrounding PRINT/CONSOLE statement is already using.
    fn emit_print_udt(&mut self, b: &mut IlBuilder, addr: &str, type_name: &str, file_handle: Option<&str>) -> CodegenResult<()> {
        let Some(ty) = self.symtab.lookup_type(type_name).cloned() else {
            self.diags.warn(None, format!("unresolved UDT `{type_name}` in PRINT"));
            return b.warn(&format!("unresolved UDT `{type_name}` in PRINT"));
        };
        self.print_literal(b, "{", file_handle)?;
        for (i, field) in ty.fields.iter().enumerate() {
            if i > 0 {
                self.print_literal(b, ", ", file_handle)?;
            }
            self.print_literal(b, &format!("{}: ", field.name), file_handle)?;
            let field_addr = b.new_temp();
            b.binop(&field_addr, "l", "add", addr, &field.offset.to_string())?;
            if field.type_desc == BaseType::UserDefined {
                let nested_type = field.type_name.clone().unwrap_or_default();
                self.emit_print_udt(b, &field_addr, &nested_type, file_handle)?;
            } else if field.type_desc == BaseType::String {
                let v = b.new_temp();
                b.load(&v, LoadSuffix::Long, "l", &field_addr)?;
                self.print_runtime_call(b, file_handle, "string_desc", &v)?;
            } else if field.type_desc.is_integer_like() {
                let v = b.new_temp();
                b.load(&v, self.types.load_suffix(field.type_desc), "w", &field_addr)?;
                self.print_runtime_call(b, file_handle, "int", &v)?;
            } else {
                let v = b.new_temp();
                if field.type_desc == BaseType::Single {
                    let tmp = b.new_temp();
                    b.load(&tmp, self.types.load_suffix(field.type_desc), "s", &field_addr)?;
                    b.convert(&v, "d", "exts", &tmp)?;
                } else {
                    b.load(&v, self.types.load_suffix(field.type_desc), "d", &field_addr)?;
                }
                self.print_runtime_call(b, file_handle, "double", &v)?;
            }
        }
        self.print_literal(b, "}", file_handle)
    }

    fn print_runtime_call(&mut self, b: &mut IlBuilder, file_handle: Option<&str>, kind: &str, v: &str) -> CodegenResult<()> {
        let name = match file_handle {
            Some(_) => format!("file_print_{kind}"),
            None => format!("basic_print_{kind}"),
        };
        let args: Vec<String> = match file_handle {
            Some(h) => vec![h.to_string(), v.to_string()],
            None => vec![v.to_string()],
        };
        self.runtime.call(b, None, &name, &args).map(|_| ())
    }

    fn print_literal(&mut self, b: &mut IlBuilder, s: &str, file_handle: Option<&str>) -> CodegenResult<()> {
        let label = b.register_string(s.as_bytes());
        let addr = format!("${label}");
        self.print_runtime_call(b, file_handle, "string_desc", &addr)
    }

    fn emit_console(
        &mut self,
        b: &mut IlBuilder,
        items: &[crate::ast::ExprId],
        newline: bool,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        self.emit_print(b, items, newline, None, func, ectx)
    }

    // ---- LET --------------------------------------------------------------

    /// LET has seven source-level specializations that all funnel through
    /// here: plain scalar assign, member-field assign, array-element
    /// assign, UDT-by-value copy (blit), ARRAY op= (elementwise),
    /// string-append compound assign, and numeric compound assign. The
    /// target shape plus the suffix operator select among them.
    fn emit_let(
        &mut self,
        b: &mut IlBuilder,
        target: &crate::ast::LetTarget,
        suffix: Option<char>,
        value: crate::ast::ExprId,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        if target.chain.is_empty() {
            return self.emit_let_scalar(b, &target.name, suffix, value, func, ectx);
        }
        self.emit_let_chain(b, target, suffix, value, func, ectx)
    }

    fn emit_let_scalar(
        &mut self,
        b: &mut IlBuilder,
        name: &str,
        suffix: Option<char>,
        value: crate::ast::ExprId,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let (addr, base_type, load_suffix, store_suffix) = if let Some(slot) = func.lookup(name) {
            (slot.addr.clone(), slot.base_type, slot.load_suffix, slot.store_suffix)
        } else {
            let base = self.infer_global_base_type(name);
            let gname = self.mangle.global_var(name, base);
            (format!("${gname}"), base, self.types.load_suffix(base), self.types.store_suffix(base))
        };

        if suffix.is_none() && base_type == BaseType::UserDefined {
            if self.try_emit_udt_binary_into(b, value, &addr, func)? {
                return Ok(());
            }
            if let Some((src_addr, type_name)) = self.resolve_udt_operand(value, func) {
                let size = self.types.size_of_udt(self.symtab, &type_name);
                return b.blit(&src_addr, &addr, size);
            }
        }

        let mut ee = self.expr_emitter();
        let vkind = ee.infer_kind(value, Some(func), ectx);
        let mut v = ee.emit(b, value, func, ectx)?;

        if let Some(op) = suffix {
            let cur = self.emit_scalar_load(b, &addr, base_type, load_suffix)?;
            let mut ee = self.expr_emitter();
            v = match (op, base_type == BaseType::String) {
                ('+', true) => {
                    let rhs = ee.coerce_to_string_pub(b, v, vkind)?;
                    self.runtime.call(b, None, "string_concat", &[cur, rhs])?.unwrap()
                }
                ('+', false) => {
                    let dst = b.new_temp();
                    b.binop(&dst, if base_type.is_float() { "d" } else { "w" }, "add", &cur, &v)?;
                    dst
                }
                ('-', false) => {
                    let dst = b.new_temp();
                    b.binop(&dst, if base_type.is_float() { "d" } else { "w" }, "sub", &cur, &v)?;
                    dst
                }
                ('*', false) => {
                    let dst = b.new_temp();
                    b.binop(&dst, if base_type.is_float() { "d" } else { "w" }, "mul", &cur, &v)?;
                    dst
                }
                ('/', false) => {
                    let dst = b.new_temp();
                    b.binop(&dst, "d", "div", &cur, &v)?;
                    dst
                }
                _ => v,
            };
        } else if base_type == BaseType::String {
            self.runtime.call(b, None, "string_retain", &[v.clone()])?;
        } else if base_type.is_float() && vkind == crate::expr::ExprKind::Integer {
            let dst = b.new_temp();
            b.convert(&dst, "d", "swtof", &v)?;
            v = dst;
        }

        let v = if base_type == BaseType::Single {
            let dst = b.new_temp();
            b.convert(&dst, "s", "truncd", &v)?;
            dst
        } else {
            v
        };
        b.store(store_suffix, &v, &addr)
    }

    fn emit_scalar_load(&mut self, b: &mut IlBuilder, addr: &str, base: BaseType, suffix: LoadSuffix) -> CodegenResult<String> {
        let dst = b.new_temp();
        let ty = self.types.il_type(base).letter();
        b.load(&dst, suffix, ty, addr)?;
        Ok(dst)
    }

    fn emit_let_chain(
        &mut self,
        b: &mut IlBuilder,
        target: &crate::ast::LetTarget,
        suffix: Option<char>,
        value: crate::ast::ExprId,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        use crate::ast::ChainSegment;
        let mut addr = if let Some(slot) = func.lookup(&target.name) {
            slot.addr.clone()
        } else {
            let base = self.infer_global_base_type(&target.name);
            format!("${}", self.mangle.global_var(&target.name, base))
        };
        let mut cur_field_type = BaseType::UserDefined;
        let mut type_name = func.as_type_name(&target.name).map(|s| s.to_string()).or_else(|| {
            self.symtab
                .lookup_variable(Some(&func.func_name), &target.name)
                .and_then(|v| v.udt_or_class_name.clone())
        });

        for seg in &target.chain {
            match seg {
                ChainSegment::Field(field) => {
                    let Some(tn) = &type_name else {
                        self.diags.warn(None, format!("unresolved chain base for `.{field}`"));
                        b.warn(&format!("unresolved chain base for `.{field}`"))?;
                        return Ok(());
                    };
                    let (offset, ftype, ftype_name) = if let Some(class) = self.symtab.lookup_class(tn) {
                        match class.fields.iter().find(|f| f.name.eq_ignore_ascii_case(field)) {
                            Some(f) => (f.offset, f.type_desc, f.type_name.clone()),
                            None => {
                                self.diags.warn(None, format!("unresolved field `{field}` on `{tn}`"));
                                return Ok(());
                            }
                        }
                    } else if let Some(udt) = self.symtab.lookup_type(tn) {
                        match udt.fields.iter().find(|f| f.name.eq_ignore_ascii_case(field)) {
                            Some(f) => (f.offset, f.type_desc, f.type_name.clone()),
                            None => {
                                self.diags.warn(None, format!("unresolved field `{field}` on `{tn}`"));
                                return Ok(());
                            }
                        }
                    } else {
                        self.diags.warn(None, format!("unresolved type `{tn}`"));
                        return Ok(());
                    };
                    let next_addr = b.new_temp();
                    b.binop(&next_addr, "l", "add", &addr, &offset.to_string())?;
                    addr = next_addr;
                    cur_field_type = ftype;
                    type_name = ftype_name;
                }
                ChainSegment::Index(indices) => {
                    let base_expr = self.find_base_expr_for(&target.name, indices)?;
                    let mut ee = self.expr_emitter();
                    let idx0 = ee.emit(b, indices[0], func, ectx)?;
                    let idx0_kind = ee.infer_kind(indices[0], Some(func), ectx);
                    let idx0 = if idx0_kind != crate::expr::ExprKind::Integer {
                        let t = b.new_temp();
                        b.convert(&t, "w", "dtosi", &idx0)?;
                        t
                    } else {
                        idx0
                    };
                    let _ = base_expr;
                    self.runtime.call(b, None, "array_bounds_check", &[addr.clone(), idx0.clone()])?;
                    let elem_addr = if indices.len() == 2 {
                        let mut ee = self.expr_emitter();
                        let idx1 = ee.emit(b, indices[1], func, ectx)?;
                        self.runtime
                            .call(b, None, "array_element_addr_2d", &[addr.clone(), idx0.clone(), idx1])?
                            .unwrap()
                    } else {
                        self.runtime.call(b, None, "array_element_addr", &[addr.clone(), idx0])?.unwrap()
                    };
                    addr = elem_addr;
                }
            }
        }

        let _ = suffix;
        if cur_field_type == BaseType::UserDefined {
            if self.try_emit_udt_binary_into(b, value, &addr, func)? {
                return Ok(());
            }
            // UDT-by-value copy: blit the source struct over the target.
            let size = type_name.as_deref().map(|n| self.types.size_of_udt(self.symtab, n)).unwrap_or(8);
            if let Some((src_addr, _)) = self.resolve_udt_operand(value, func) {
                return b.blit(&src_addr, &addr, size);
            }
            let mut ee = self.expr_emitter();
            let v = ee.emit(b, value, func, ectx)?;
            return b.blit(&v, &addr, size);
        }

        let mut ee = self.expr_emitter();
        let vkind = ee.infer_kind(value, Some(func), ectx);
        let mut v = ee.emit(b, value, func, ectx)?;
        if cur_field_type.is_float() && vkind == crate::expr::ExprKind::Integer {
            let dst = b.new_temp();
            b.convert(&dst, "d", "swtof", &v)?;
            v = dst;
        }
        if cur_field_type == BaseType::String {
            self.runtime.call(b, None, "string_retain", &[v.clone()])?;
        }
        let suffix_ty = self.types.store_suffix(cur_field_type);
        b.store(suffix_ty, &v, &addr)
    }

    /// Resolves a bare-variable UDT operand to its struct address and
    /// declared type name. Returns `None` for anything but a plain
    /// variable reference of UDT type, so callers fall back to the
    /// general expression path for chains, calls, and scalar operands.
    fn resolve_udt_operand(&self, id: ExprId, func: &FunctionContext) -> Option<(String, String)> {
        let Expr::Variable(name) = self.ast.expr(id) else { return None };
        if let Some(slot) = func.lookup(name) {
            if slot.base_type != BaseType::UserDefined {
                return None;
            }
            let type_name = func.as_type_name(name)?.to_string();
            return Some((slot.addr.clone(), type_name));
        }
        let v = self.symtab.lookup_variable(Some(&func.func_name), name)?;
        if v.base_type != BaseType::UserDefined {
            return None;
        }
        let type_name = v.udt_or_class_name.clone()?;
        let addr = format!("${}", self.mangle.global_var(name, BaseType::UserDefined));
        Some((addr, type_name))
    }

    /// Whole-UDT `dst = lhs op rhs`: picks the NEON fast path when the
    /// type's field layout qualifies and NEON is enabled, otherwise falls
    /// back to scalar field-by-field ops, writing the result straight into
    /// `dst_addr`. Returns `false` when `value` isn't a binary expression
    /// over two same-typed UDT variables, leaving `dst_addr` untouched so
    /// the caller's own scalar/blit handling runs instead.
    fn try_emit_udt_binary_into(
        &mut self,
        b: &mut IlBuilder,
        value: ExprId,
        dst_addr: &str,
        func: &FunctionContext,
    ) -> CodegenResult<bool> {
        let (op, lhs, rhs) = match self.ast.expr(value) {
            Expr::Binary(op, lhs, rhs) => (*op, *lhs, *rhs),
            _ => return Ok(false),
        };
        let Some((lhs_addr, lhs_type)) = self.resolve_udt_operand(lhs, func) else {
            return Ok(false);
        };
        let Some((rhs_addr, rhs_type)) = self.resolve_udt_operand(rhs, func) else {
            return Ok(false);
        };
        if !lhs_type.eq_ignore_ascii_case(&rhs_type) {
            return Ok(false);
        }
        let Some(ty) = self.symtab.lookup_type(&lhs_type).cloned() else {
            return Ok(false);
        };

        let arrangement = ty.simd_arrangement_code();
        if self.symtab.neon_enabled && arrangement != SimdArrangement::None {
            if let Some(rt_name) = neon_op_name(arrangement, op) {
                self.runtime
                    .call(b, None, rt_name, &[dst_addr.to_string(), lhs_addr, rhs_addr])?;
                return Ok(true);
            }
            self.diags
                .warn(None, format!("no NEON op for `{lhs_type}` with this operator, falling back to scalar fields"));
        }

        self.emit_scalar_udt_binop(b, op, &ty, &lhs_addr, &rhs_addr, dst_addr)?;
        Ok(true)
    }

    /// Field-by-field fallback for whole-UDT arithmetic: loads each field
    /// from `lhs_addr`/`rhs_addr`, applies `op` at the field's own type,
    /// and stores into the matching offset of `dst_addr`.
    fn emit_scalar_udt_binop(
        &mut self,
        b: &mut IlBuilder,
        op: BinOp,
        ty: &TypeSymbol,
        lhs_addr: &str,
        rhs_addr: &str,
        dst_addr: &str,
    ) -> CodegenResult<()> {
        let opname = match op {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            _ => {
                self.diags.warn(None, format!("unsupported whole-UDT operator on `{}`, left unset", ty.name));
                return Ok(());
            }
        };
        for field in &ty.fields {
            let l_addr = b.new_temp();
            b.binop(&l_addr, "l", "add", lhs_addr, &field.offset.to_string())?;
            let r_addr = b.new_temp();
            b.binop(&r_addr, "l", "add", rhs_addr, &field.offset.to_string())?;
            let d_addr = b.new_temp();
            b.binop(&d_addr, "l", "add", dst_addr, &field.offset.to_string())?;

            let suffix = self.types.load_suffix(field.type_desc);
            let il_ty = self.types.il_type(field.type_desc).letter();
            let lv = b.new_temp();
            b.load(&lv, suffix, il_ty, &l_addr)?;
            let rv = b.new_temp();
            b.load(&rv, suffix, il_ty, &r_addr)?;
            let dv = b.new_temp();
            b.binop(&dv, il_ty, opname, &lv, &rv)?;
            b.store(self.types.store_suffix(field.type_desc), &dv, &d_addr)?;
        }
        Ok(())
    }

    /// Placeholder hook: index-chain lowering resolves the array
    /// descriptor from the preceding base address directly rather than
    /// re-walking AST nodes, so this returns the name unchanged; kept as
    /// a named seam for a future multi-dimensional chained-index variant.
    fn find_base_expr_for(&self, name: &str, _indices: &[crate::ast::ExprId]) -> CodegenResult<String> {
        Ok(name.to_string())
    }

    // ---- DIM / LOCAL --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn emit_dim(
        &mut self,
        b: &mut IlBuilder,
        name: &str,
        as_type: Option<&str>,
        dims: &[crate::ast::ExprId],
        init: Option<crate::ast::ExprId>,
        is_global: bool,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let base = as_type.map(BaseType::from_as_type_name).unwrap_or_else(|| self.infer_global_base_type(name));
        if !dims.is_empty() {
            let mut ee = self.expr_emitter();
            let mut dim_vals = Vec::new();
            for d in dims {
                dim_vals.push(ee.emit(b, *d, func, ectx)?);
            }
            let elem_size = self.types.size_of(base);
            let entry = if dim_vals.len() == 2 { "array_create_2d" } else { "array_create_1d" };
            let mut args = dim_vals;
            args.push(elem_size.to_string());
            let data_ptr = self.runtime.call(b, None, entry, &args)?.unwrap();
            let desc_name = self.mangle.array_descriptor(name);
            b.store(StoreSuffix::L, &data_ptr, &format!("${desc_name}"))?;
            return Ok(());
        }

        if base == BaseType::UserDefined {
            let type_name = as_type.unwrap_or_default().to_string();
            let size = self.types.create_alloc_size(self.symtab, &type_name);
            let slot_addr = if is_global {
                format!("${}", self.mangle.global_var(name, base))
            } else {
                let addr = b.new_temp();
                b.alloc(&addr, size, Some(8))?;
                func.register_local(
                    name,
                    SlotInfo {
                        addr: addr.clone(),
                        il_type: self.types.il_type(base),
                        base_type: base,
                        store_suffix: self.types.store_suffix(base),
                        load_suffix: self.types.load_suffix(base),
                    },
                    Some(type_name.clone()),
                );
                self.symtab.register_scoped_local(
                    &func.func_name,
                    name,
                    VariableSymbol {
                        base_type: base,
                        udt_or_class_name: Some(type_name.clone()),
                        element_type: None,
                        object_type_name: None,
                        scope: Scope::Local,
                        is_global: false,
                    },
                );
                return Ok(());
            };
            let _ = slot_addr;
            return Ok(());
        }

        if is_global {
            return Ok(());
        }

        let size = self.types.size_of(base);
        let align = self.types.align_of(base);
        let addr = b.new_temp();
        b.alloc(&addr, size.max(4), Some(align))?;
        func.register_local(
            name,
            SlotInfo {
                addr: addr.clone(),
                il_type: self.types.il_type(base),
                base_type: base,
                store_suffix: self.types.store_suffix(base),
                load_suffix: self.types.load_suffix(base),
            },
            None,
        );
        if let Some(init_expr) = init {
            self.emit_let_scalar(b, name, None, init_expr, func, ectx)?;
        } else if base == BaseType::String {
            b.store(StoreSuffix::L, "0", &addr)?;
        }
        Ok(())
    }

    fn emit_local(
        &mut self,
        b: &mut IlBuilder,
        name: &str,
        as_type: Option<&str>,
        init: Option<crate::ast::ExprId>,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        self.emit_dim(b, name, as_type, &[], init, false, func, ectx)
    }

    // ---- RETURN / INC / DEC / SWAP / INPUT -------------------------------

    fn emit_return(
        &mut self,
        b: &mut IlBuilder,
        value: Option<crate::ast::ExprId>,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        match value {
            Some(e) => {
                let v = self.expr_emitter().emit(b, e, func, ectx)?;
                self.retain_object_return(b, func, &v)?;
                self.emit_epilogue_calls(b, func)?;
                b.ret(Some(&v))
            }
            None => self.emit_function_exit(b, func),
        }
    }

    fn emit_incdec(&mut self, b: &mut IlBuilder, target: &crate::ast::LetTarget, delta: i64, func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        if !target.chain.is_empty() {
            self.diags.warn(None, "INC/DEC on chained target not supported, treated as no-op");
            return Ok(());
        }
        let (addr, base_type, load_suffix, store_suffix) = if let Some(slot) = func.lookup(&target.name) {
            (slot.addr.clone(), slot.base_type, slot.load_suffix, slot.store_suffix)
        } else {
            let base = self.infer_global_base_type(&target.name);
            (format!("${}", self.mangle.global_var(&target.name, base)), base, self.types.load_suffix(base), self.types.store_suffix(base))
        };
        let cur = self.emit_scalar_load(b, &addr, base_type, load_suffix)?;
        let dst = b.new_temp();
        let ty = if base_type.is_float() { "d" } else { "w" };
        let delta_str = if base_type.is_float() { format!("d_{delta}") } else { delta.to_string() };
        b.binop(&dst, ty, "add", &cur, &delta_str)?;
        let _ = ectx;
        b.store(store_suffix, &dst, &addr)
    }

    fn emit_swap(&mut self, b: &mut IlBuilder, a: &crate::ast::LetTarget, c: &crate::ast::LetTarget, func: &mut FunctionContext, _ectx: &mut EmitContext) -> CodegenResult<()> {
        if !a.chain.is_empty() || !c.chain.is_empty() {
            self.diags.warn(None, "SWAP on chained targets not supported, treated as no-op");
            return Ok(());
        }
        let slot_a = self.resolve_scalar_slot(&a.name, func);
        let slot_c = self.resolve_scalar_slot(&c.name, func);
        let va = self.emit_scalar_load(b, &slot_a.0, slot_a.1, slot_a.2)?;
        let vc = self.emit_scalar_load(b, &slot_c.0, slot_c.1, slot_c.2)?;
        b.store(slot_a.3, &vc, &slot_a.0)?;
        b.store(slot_c.3, &va, &slot_c.0)
    }

    fn resolve_scalar_slot(&self, name: &str, func: &FunctionContext) -> (String, BaseType, LoadSuffix, StoreSuffix) {
        if let Some(slot) = func.lookup(name) {
            (slot.addr.clone(), slot.base_type, slot.load_suffix, slot.store_suffix)
        } else {
            let base = self.infer_global_base_type(name);
            (format!("${}", self.mangle.global_var(name, base)), base, self.types.load_suffix(base), self.types.store_suffix(base))
        }
    }

    fn emit_input(
        &mut self,
        b: &mut IlBuilder,
        prompt: Option<crate::ast::ExprId>,
        target: &crate::ast::LetTarget,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        if let Some(p) = prompt {
            let v = self.expr_emitter().emit(b, p, func, ectx)?;
            self.runtime.call(b, None, "basic_print_string_desc", &[v])?;
        }
        let line = self.runtime.call(b, None, "basic_read_line", &[])?.unwrap();
        let (addr, base_type, _, store_suffix) = self.resolve_scalar_slot(&target.name, func);
        let v = if base_type == BaseType::String {
            line
        } else if base_type.is_integer_like() {
            self.runtime.call(b, None, "string_to_int", &[line])?.unwrap()
        } else {
            self.runtime.call(b, None, "string_to_double", &[line])?.unwrap()
        };
        b.store(store_suffix, &v, &addr)
    }

    fn infer_global_base_type(&self, name: &str) -> BaseType {
        match name.chars().last() {
            Some('$') => BaseType::String,
            Some('%') => BaseType::Integer,
            Some('&') => BaseType::Long,
            Some('!') => BaseType::Single,
            Some('#') => BaseType::Double,
            _ => self.symtab.lookup_variable(None, name).map(|v| v.base_type).unwrap_or(BaseType::Double),
        }
    }

    // ---- terminal / keyboard --------------------------------------------

    fn emit_terminal_control(&mut self, b: &mut IlBuilder, op: &str, args: &[crate::ast::ExprId], func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        let rt_name = match op.to_ascii_uppercase().as_str() {
            "CURSOR_SHOW" => "term_cursor_show",
            "CURSOR_HIDE" => "term_cursor_hide",
            "STYLE" => "term_style",
            "SCREEN_ALT" => "term_screen_alt",
            "SCREEN_MAIN" => "term_screen_main",
            "FLUSH" => "term_flush",
            "BEGIN_DRAW" => "term_begin_draw",
            "END_DRAW" => "term_end_draw",
            "INIT" => "term_init",
            "CLEANUP" => "term_cleanup",
            "MOUSE_ENABLE" => "mouse_enable",
            "MOUSE_DISABLE" => "mouse_disable",
            other => {
                self.diags.warn(None, format!("unresolved terminal control `{other}`"));
                return Ok(());
            }
        };
        let mut call_args = Vec::new();
        for a in args {
            call_args.push(self.expr_emitter().emit(b, *a, func, ectx)?);
        }
        self.runtime.call(b, None, rt_name, &call_args).map(|_| ())
    }

    fn emit_keyboard(&mut self, b: &mut IlBuilder, op: &str, target: Option<&crate::ast::LetTarget>, func: &mut FunctionContext, _ectx: &mut EmitContext) -> CodegenResult<()> {
        let rt_name = match op.to_ascii_uppercase().as_str() {
            "SET_RAW" => "kbd_set_raw",
            "SET_ECHO" => "kbd_set_echo",
            "FLUSH" => "kbd_flush",
            "HIT" => "kbd_hit",
            "GET" => "kbd_get",
            "PEEK" => "kbd_peek",
            other => {
                self.diags.warn(None, format!("unresolved keyboard op `{other}`"));
                return Ok(());
            }
        };
        let result = self.runtime.call(b, None, rt_name, &[])?;
        if let (Some(v), Some(t)) = (result, target) {
            if t.chain.is_empty() {
                let (addr, _, _, store_suffix) = self.resolve_scalar_slot(&t.name, func);
                b.store(store_suffix, &v, &addr)?;
            }
        }
        Ok(())
    }

    // ---- messaging / timers ------------------------------------------

    /// MATCH RECEIVE: pops one blob off the resolved queue, reads its tag
    /// and type id, then tests each arm in source order against them,
    /// branching either to an extraction trampoline (STRING/UDT/CLASS) or
    /// straight to the body (INTEGER/DOUBLE, pre-extracted on entry since
    /// the extraction itself is side-effect-free on a non-match). Every
    /// arm falls through to a shared merge block that frees the blob
    /// reference — reloaded from the forward stack slot when any arm in
    /// this statement can forward, otherwise the plain popped temp.
    fn emit_match_receive(
        &mut self,
        b: &mut IlBuilder,
        handle: crate::ast::ExprId,
        arms: &[crate::ast::MatchReceiveArm],
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let handle_is_parent = matches!(self.ast.expr(handle), Expr::Parent);
        let hv = self.expr_emitter().emit(b, handle, func, ectx)?;
        let queue = b.new_temp();
        b.convert(&queue, "l", "cast", &hv)?;

        let blob = self.runtime.call(b, None, "msg_queue_pop", &[queue.clone()])?.unwrap();
        let tag = self.runtime.call(b, None, "msg_blob_tag", &[blob.clone()])?.unwrap();
        let type_id = self.runtime.call(b, None, "msg_blob_type_id", &[blob.clone()])?.unwrap();

        let arm_infos: Vec<MatchArmInfo> = arms
            .iter()
            .enumerate()
            .map(|(i, arm)| {
                let (tag_const, type_id_const) = self.match_receive_tag_for(&arm.type_name);
                MatchArmInfo { tag: tag_const, type_id: type_id_const, body_block: i }
            })
            .collect();

        let any_forward = arms.iter().any(|a| a.is_forward);
        let blob_slot_addr = if any_forward {
            let addr = b.new_temp();
            b.alloc(&addr, 8, Some(8))?;
            b.store(StoreSuffix::L, &blob, &addr)?;
            Some(addr)
        } else {
            None
        };

        let mut mr_ctx = MatchReceiveContext {
            blob_temp: blob.clone(),
            tag_temp: tag.clone(),
            type_id_temp: type_id.clone(),
            arms: arm_infos,
            current_arm: 0,
            merge_block: None,
            blob_slot_addr: blob_slot_addr.clone(),
            forward_flags: arms.iter().map(|a| a.is_forward).collect(),
            handle_is_parent,
            send_direction_queue_temp: queue,
        };

        let merge_label = b.new_label();
        mr_ctx.merge_block = Some(arms.len());

        for (i, arm) in arms.iter().enumerate() {
            mr_ctx.current_arm = i;
            let info = mr_ctx.arms[i].clone();

            let tag_ok = b.new_temp();
            b.cmp(&tag_ok, "w", Cmp::Eq, false, &tag, &info.tag.to_string())?;
            let tag_ok_label = b.new_label();
            let miss_label = b.new_label();
            b.branch(&tag_ok, &tag_ok_label, &miss_label)?;
            b.label(&tag_ok_label)?;

            if let Some(expected_type_id) = info.type_id {
                let type_ok = b.new_temp();
                b.cmp(&type_ok, "w", Cmp::Eq, false, &type_id, &expected_type_id.to_string())?;
                let body_entry = b.new_label();
                b.branch(&type_ok, &body_entry, &miss_label)?;
                b.label(&body_entry)?;
            }

            self.emit_match_receive_arm(b, arm, &mr_ctx, func, ectx)?;
            if !b.is_terminated() {
                b.jump(&merge_label)?;
            }
            b.label(&miss_label)?;
        }
        if !b.is_terminated() {
            b.jump(&merge_label)?;
        }
        b.label(&merge_label)?;

        let cleanup = match &blob_slot_addr {
            Some(slot) => MergeCleanup { blob_ref: slot.clone(), needs_load: true },
            None => MergeCleanup { blob_ref: blob.clone(), needs_load: false },
        };
        let final_blob = if cleanup.needs_load {
            let loaded = b.new_temp();
            b.load(&loaded, LoadSuffix::Long, "l", &cleanup.blob_ref)?;
            loaded
        } else {
            cleanup.blob_ref
        };
        self.runtime.call(b, None, "msg_blob_free", &[final_blob]).map(|_| ())
    }

    /// Maps an arm's declared type name to the tag `msg_blob_tag` returns
    /// for that wire shape (same scheme MATCH TYPE uses: INTEGER=1,
    /// DOUBLE/SINGLE=2, STRING=3, LIST=4, everything object-shaped=5) and,
    /// for the object-shaped case, the type id `msg_blob_type_id` carries
    /// alongside it — a registered class's id, or 0 for a plain UDT with
    /// no class registration, mirroring `emit_unmarshall`'s own fallback.
    fn match_receive_tag_for(&self, type_name: &str) -> (u32, Option<i32>) {
        match type_name.to_ascii_uppercase().as_str() {
            "INTEGER" => (1, None),
            "DOUBLE" | "SINGLE" => (2, None),
            "STRING" => (3, None),
            "LIST" => (4, None),
            _ => {
                let class_id = self.symtab.lookup_class(type_name).map(|c| c.class_id).unwrap_or(0);
                (5, Some(class_id as i32))
            }
        }
    }

    /// Binds one MATCH RECEIVE arm's variable and emits its body.
    /// INTEGER/DOUBLE extract the inline scalar; STRING transfers
    /// ownership of the descriptor out of the blob's inline slot; UDT/
    /// CLASS either aliases the blob's payload directly (forward arms,
    /// zero-copy) or unmarshals a fresh copy (non-forward).
    fn emit_match_receive_arm(
        &mut self,
        b: &mut IlBuilder,
        arm: &crate::ast::MatchReceiveArm,
        mr_ctx: &MatchReceiveContext,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        match arm.type_name.to_ascii_uppercase().as_str() {
            "INTEGER" => {
                let payload = self.runtime.call(b, None, "msg_blob_payload_ptr", &[mr_ctx.blob_temp.clone()])?.unwrap();
                let v = b.new_temp();
                b.load(&v, LoadSuffix::Word, "w", &payload)?;
                let addr = b.new_temp();
                b.alloc(&addr, 4, Some(4))?;
                b.store(StoreSuffix::W, &v, &addr)?;
                func.register_local(
                    &arm.bind_var,
                    SlotInfo {
                        addr,
                        il_type: self.types.il_type(BaseType::Integer),
                        base_type: BaseType::Integer,
                        store_suffix: self.types.store_suffix(BaseType::Integer),
                        load_suffix: self.types.load_suffix(BaseType::Integer),
                    },
                    None,
                );
            }
            "DOUBLE" | "SINGLE" => {
                let payload = self.runtime.call(b, None, "msg_blob_payload_ptr", &[mr_ctx.blob_temp.clone()])?.unwrap();
                let v = b.new_temp();
                b.load(&v, LoadSuffix::Double, "d", &payload)?;
                let addr = b.new_temp();
                b.alloc(&addr, 8, Some(8))?;
                b.store(StoreSuffix::D, &v, &addr)?;
                func.register_local(
                    &arm.bind_var,
                    SlotInfo {
                        addr,
                        il_type: self.types.il_type(BaseType::Double),
                        base_type: BaseType::Double,
                        store_suffix: self.types.store_suffix(BaseType::Double),
                        load_suffix: self.types.load_suffix(BaseType::Double),
                    },
                    None,
                );
            }
            "STRING" => {
                let inline_slot = self.runtime.call(b, None, "msg_blob_payload_ptr", &[mr_ctx.blob_temp.clone()])?.unwrap();
                let desc = b.new_temp();
                b.load(&desc, LoadSuffix::Long, "l", &inline_slot)?;
                let addr = b.new_temp();
                b.alloc(&addr, 8, Some(8))?;
                b.store(StoreSuffix::L, &desc, &addr)?;
                b.store(StoreSuffix::L, "0", &inline_slot)?;
                func.register_local(
                    &arm.bind_var,
                    SlotInfo {
                        addr,
                        il_type: self.types.il_type(BaseType::String),
                        base_type: BaseType::String,
                        store_suffix: self.types.store_suffix(BaseType::String),
                        load_suffix: self.types.load_suffix(BaseType::String),
                    },
                    None,
                );
            }
            _ if arm.is_forward => {
                let payload = self.runtime.call(b, None, "msg_blob_payload_ptr", &[mr_ctx.blob_temp.clone()])?.unwrap();
                let addr = b.new_temp();
                b.alloc(&addr, 8, Some(8))?;
                b.store(StoreSuffix::L, &payload, &addr)?;
                func.register_local(
                    &arm.bind_var,
                    SlotInfo {
                        addr,
                        il_type: self.types.il_type(BaseType::ClassInstance),
                        base_type: BaseType::ClassInstance,
                        store_suffix: self.types.store_suffix(BaseType::ClassInstance),
                        load_suffix: self.types.load_suffix(BaseType::ClassInstance),
                    },
                    Some(arm.type_name.clone()),
                );
                self.symtab.register_scoped_local(
                    &func.func_name,
                    &arm.bind_var,
                    VariableSymbol {
                        base_type: BaseType::ClassInstance,
                        udt_or_class_name: Some(arm.type_name.clone()),
                        element_type: None,
                        object_type_name: Some(arm.type_name.clone()),
                        scope: Scope::Local,
                        is_global: false,
                    },
                );
                let saved = ectx.active_forward.take();
                ectx.active_forward = Some(ActiveForwardContext {
                    bind_var_upper: arm.bind_var.to_ascii_uppercase(),
                    blob_temp: mr_ctx.blob_temp.clone(),
                    blob_slot_addr: mr_ctx
                        .blob_slot_addr
                        .clone()
                        .expect("a forward arm implies the match-receive statement allocated a blob stack slot"),
                    send_direction_queue_temp: mr_ctx.send_direction_queue_temp.clone(),
                    handle_is_parent: mr_ctx.handle_is_parent,
                });
                for stmt in &arm.body {
                    self.emit_stmt(b, *stmt, func, ectx)?;
                }
                ectx.active_forward = saved;
                return Ok(());
            }
            type_name => {
                let payload = self.runtime.call(b, None, "msg_blob_payload_ptr", &[mr_ctx.blob_temp.clone()])?.unwrap();
                let size = self.types.size_of_udt(self.symtab, type_name);
                let class_id = self.symtab.lookup_class(type_name).map(|c| c.class_id).unwrap_or(0);
                let has_strings = self.expr_emitter().udt_has_string_field(type_name);
                let result = if has_strings {
                    let offsets = format!("$str_offsets_{}", type_name.to_ascii_uppercase());
                    self.runtime
                        .call(b, None, "unmarshall_udt_deep", &[payload, offsets, class_id.to_string(), size.to_string()])?
                        .unwrap()
                } else {
                    self.runtime.call(b, None, "unmarshall_udt", &[payload, size.to_string(), class_id.to_string()])?.unwrap()
                };
                let addr = b.new_temp();
                b.alloc(&addr, size, Some(8))?;
                b.blit(&result, &addr, size)?;
                func.register_local(
                    &arm.bind_var,
                    SlotInfo {
                        addr,
                        il_type: self.types.il_type(BaseType::UserDefined),
                        base_type: BaseType::UserDefined,
                        store_suffix: self.types.store_suffix(BaseType::UserDefined),
                        load_suffix: self.types.load_suffix(BaseType::UserDefined),
                    },
                    Some(arm.type_name.clone()),
                );
                self.symtab.register_scoped_local(
                    &func.func_name,
                    &arm.bind_var,
                    VariableSymbol {
                        base_type: BaseType::UserDefined,
                        udt_or_class_name: Some(arm.type_name.clone()),
                        element_type: None,
                        object_type_name: None,
                        scope: Scope::Local,
                        is_global: false,
                    },
                );
            }
        }
        for stmt in &arm.body {
            self.emit_stmt(b, *stmt, func, ectx)?;
        }
        Ok(())
    }

    fn emit_send(&mut self, b: &mut IlBuilder, handle: crate::ast::ExprId, value: crate::ast::ExprId, func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        if let Some(fwd) = ectx.active_forward.clone() {
            let is_bind_var = matches!(self.ast.expr(value), Expr::Variable(name) if name.eq_ignore_ascii_case(&fwd.bind_var_upper));
            let same_direction = matches!(self.ast.expr(handle), Expr::Parent) == fwd.handle_is_parent;
            if is_bind_var && same_direction {
                self.runtime.call(b, None, "msg_blob_forward", &[fwd.blob_temp.clone(), fwd.send_direction_queue_temp.clone()])?;
                b.store(StoreSuffix::L, "0", &fwd.blob_slot_addr)?;
                return Ok(());
            }
        }
        let mut ee = self.expr_emitter();
        let kind = ee.infer_kind(value, Some(func), ectx);
        let hv = ee.emit(b, handle, func, ectx)?;
        let h_l = b.new_temp();
        b.convert(&h_l, "l", "cast", &hv)?;
        let vv = self.expr_emitter().emit(b, value, func, ectx)?;
        let rt_name = match kind {
            crate::expr::ExprKind::Integer => "msg_send_int",
            crate::expr::ExprKind::Double => "msg_send_double",
            crate::expr::ExprKind::Str => "msg_send_string",
        };
        self.runtime.call(b, None, rt_name, &[h_l, vv]).map(|_| ())
    }

    fn emit_after(
        &mut self,
        b: &mut IlBuilder,
        handle: crate::ast::ExprId,
        delay: crate::ast::ExprId,
        unit: TimeUnit,
        send: Option<crate::ast::ExprId>,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let hv = self.expr_emitter().emit(b, handle, func, ectx)?;
        let dv = self.expr_emitter().emit(b, delay, func, ectx)?;
        let ms = self.to_milliseconds(b, dv, unit)?;
        let sv = match send {
            Some(e) => self.expr_emitter().emit(b, e, func, ectx)?,
            None => "0".to_string(),
        };
        self.runtime.call(b, None, "timer_after_send", &[hv, ms, sv]).map(|_| ())
    }

    fn emit_every(
        &mut self,
        b: &mut IlBuilder,
        handle: crate::ast::ExprId,
        interval: crate::ast::ExprId,
        unit: TimeUnit,
        send: Option<crate::ast::ExprId>,
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let hv = self.expr_emitter().emit(b, handle, func, ectx)?;
        let dv = self.expr_emitter().emit(b, interval, func, ectx)?;
        let ms = self.to_milliseconds(b, dv, unit)?;
        let sv = match send {
            Some(e) => self.expr_emitter().emit(b, e, func, ectx)?,
            None => "0".to_string(),
        };
        self.runtime.call(b, None, "timer_every_send", &[hv, ms, sv]).map(|_| ())
    }

    fn to_milliseconds(&mut self, b: &mut IlBuilder, value: String, unit: TimeUnit) -> CodegenResult<String> {
        let multiplier = match unit {
            TimeUnit::Milliseconds => return Ok(value),
            TimeUnit::Seconds => 1000,
            TimeUnit::Minutes => 60_000,
        };
        let dst = b.new_temp();
        b.binop(&dst, "l", "mul", &value, &multiplier.to_string())?;
        Ok(dst)
    }

    fn emit_unmarshall(&mut self, b: &mut IlBuilder, target: &crate::ast::LetTarget, source: crate::ast::ExprId, func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        let sv = self.expr_emitter().emit(b, source, func, ectx)?;
        if !target.chain.is_empty() {
            self.diags.warn(None, "UNMARSHALL into chained target not supported");
            return Ok(());
        }
        let type_name = func
            .as_type_name(&target.name)
            .map(|s| s.to_string())
            .or_else(|| self.symtab.lookup_variable(Some(&func.func_name), &target.name).and_then(|v| v.udt_or_class_name.clone()));
        let Some(tn) = type_name else {
            self.diags.warn(None, format!("unresolved UNMARSHALL target `{}`", target.name));
            return Ok(());
        };
        let class_id = self.symtab.lookup_class(&tn).map(|c| c.class_id).unwrap_or(0);
        let size = self.types.size_of_udt(self.symtab, &tn);
        let has_strings = self.expr_emitter().udt_has_string_field(&tn);
        let result = if has_strings {
            let offsets = format!("$str_offsets_{}", tn.to_ascii_uppercase());
            self.runtime.call(b, None, "unmarshall_udt_deep", &[sv, offsets, class_id.to_string(), size.to_string()])?.unwrap()
        } else {
            self.runtime.call(b, None, "unmarshall_udt", &[sv, size.to_string(), class_id.to_string()])?.unwrap()
        };
        let (addr, _, _, _) = self.resolve_scalar_slot(&target.name, func);
        b.blit(&result, &addr, size)
    }

    fn emit_on_goto(&mut self, b: &mut IlBuilder, selector: crate::ast::ExprId, targets: &[String], func: &mut FunctionContext, ectx: &mut EmitContext) -> CodegenResult<()> {
        let sv = self.expr_emitter().emit(b, selector, func, ectx)?;
        for (i, label) in targets.iter().enumerate() {
            let is_match = b.new_temp();
            b.cmp(&is_match, "w", Cmp::Eq, false, &sv, &(i as i64 + 1).to_string())?;
            let yes = b.new_label();
            let no = b.new_label();
            b.branch(&is_match, &yes, &no)?;
            b.label(&yes)?;
            b.jump(&format!("lbl_{}", label.to_ascii_uppercase()))?;
            b.label(&no)?;
        }
        Ok(())
    }

    /// CALL statement: a function/sub invocation whose result (if any) is
    /// discarded. Mirrors the expression emitter's user-call dispatch
    /// without needing to round-trip through an arena-allocated `Call`
    /// expression.
    fn emit_call_stmt(
        &mut self,
        b: &mut IlBuilder,
        name: &str,
        args: &[crate::ast::ExprId],
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        if let Some(class_ctx) = ectx.class_ctx.clone() {
            if let Some(class) = self.symtab.lookup_class(&class_ctx.class_name).cloned() {
                if class.vtable_methods(self.symtab).iter().any(|m| m.name.eq_ignore_ascii_case(name)) {
                    self.emit_self_method_call_stmt(b, &class_ctx.class_name, name, args, func, ectx)?;
                    return Ok(());
                }
            }
        }
        let Some(f) = self.symtab.lookup_function(name).cloned() else {
            self.diags.warn(None, format!("unresolved sub/function `{name}`"));
            b.warn(&format!("unresolved sub/function `{name}`"))?;
            return Ok(());
        };
        let mut typed_args = Vec::new();
        for (i, a) in args.iter().enumerate() {
            let v = self.expr_emitter().emit(b, *a, func, ectx)?;
            let param_ty = f.params.get(i).map(|p| self.types.il_type(p.base_type).letter()).unwrap_or("d");
            typed_args.push((param_ty.to_string(), v));
        }
        let callee = if f.is_function { self.mangle.function(name) } else { self.mangle.sub(name) };
        if f.is_function {
            let dst = b.new_temp();
            let ret_ty = self.types.il_type(f.return_type).letter();
            b.call(Some((&dst, ret_ty)), &format!("${callee}"), &typed_args)?;
        } else {
            b.call(None, &format!("${callee}"), &typed_args)?;
        }
        Ok(())
    }

    fn emit_self_method_call_stmt(
        &mut self,
        b: &mut IlBuilder,
        class_name: &str,
        method: &str,
        args: &[crate::ast::ExprId],
        func: &mut FunctionContext,
        ectx: &mut EmitContext,
    ) -> CodegenResult<()> {
        let class = self.symtab.lookup_class(class_name).cloned().expect("checked by caller");
        let methods = class.vtable_methods(self.symtab);
        let Some(m) = methods.iter().find(|m| m.name.eq_ignore_ascii_case(method)).cloned().cloned() else {
            return Ok(());
        };
        let vtable_ptr = b.new_temp();
        b.load(&vtable_ptr, LoadSuffix::Long, "l", "%ME")?;
        let slot_offset = 32 + m.vtable_slot * 8;
        let slot_addr = b.new_temp();
        b.binop(&slot_addr, "l", "add", &vtable_ptr, &slot_offset.to_string())?;
        let fn_ptr = b.new_temp();
        b.load(&fn_ptr, LoadSuffix::Long, "l", &slot_addr)?;

        let mut typed_args = vec![("l".to_string(), "%ME".to_string())];
        for (i, a) in args.iter().enumerate() {
            let param_ty = m.params.get(i).map(|p| p.base_type);
            let mut ee = self.expr_emitter();
            let v = ee.emit(b, *a, func, ectx)?;
            let kind = ee.infer_kind(*a, Some(func), ectx);
            let il_ty = param_ty.map(|pt| self.types.il_type(pt).letter()).unwrap_or(if kind == crate::expr::ExprKind::Integer { "w" } else { "d" });
            typed_args.push((il_ty.to_string(), v));
        }
        if m.return_type == BaseType::Void {
            b.call_indirect(None, &fn_ptr, &typed_args)?;
        } else {
            let dst = b.new_temp();
            let ret_ty = self.types.il_type(m.return_type).letter();
            b.call_indirect(Some((&dst, ret_ty)), &fn_ptr, &typed_args)?;
        }
        Ok(())
    }
}

/// Picks the NEON runtime entry point for a whole-UDT arithmetic op, or
/// `None` when the type's arrangement/operator combination has no NEON
/// counterpart (division on integer lanes, bitwise ops, comparisons).
fn neon_op_name(arrangement: SimdArrangement, op: BinOp) -> Option<&'static str> {
    match (arrangement, op) {
        (SimdArrangement::I32x4, BinOp::Add) => Some("neon_add_i32x4"),
        (SimdArrangement::I32x4, BinOp::Sub) => Some("neon_sub_i32x4"),
        (SimdArrangement::I32x4, BinOp::Mul) => Some("neon_mul_i32x4"),
        (SimdArrangement::F32x4, BinOp::Add) => Some("neon_add_f32x4"),
        (SimdArrangement::F32x4, BinOp::Sub) => Some("neon_sub_f32x4"),
        (SimdArrangement::F32x4, BinOp::Mul) => Some("neon_mul_f32x4"),
        (SimdArrangement::F32x4, BinOp::Div) => Some("neon_div_f32x4"),
        _ => None,
    }
}

// ExpressionEmitter extension for coercion reused by LET compound-assign.
impl<'a> crate::expr::ExpressionEmitter<'a> {
    pub fn coerce_to_string_pub(&mut self, b: &mut IlBuilder, v: String, kind: crate::expr::ExprKind) -> CodegenResult<String> {
        match kind {
            crate::expr::ExprKind::Str => Ok(v),
            crate::expr::ExprKind::Integer => self.runtime.call(b, None, "string_from_int", &[v]).map(|o| o.unwrap()),
            crate::expr::ExprKind::Double => self.runtime.call(b, None, "string_from_double", &[v]).map(|o| o.unwrap()),
        }
    }
}

