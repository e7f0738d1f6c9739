//! CFG Code Generator: the top-level orchestrator. Assembles one QBE IL
//! text file from a [`Program`] — an already semantically-analyzed unit
//! consisting of the statement/expression arena, the symbol table, and one
//! CFG per emittable function (plus the program's own entry CFG). Lexing,
//! parsing, semantic analysis, and CFG construction are all upstream of
//! this crate; `Program` is the handoff contract this layer consumes.

use smallvec::{smallvec, SmallVec};

use crate::ast::{Ast, Expr, ExprId, Stmt, StmtId};
use crate::block::BlockEmitter;
use crate::builder::IlBuilder;
use crate::cfg::Cfg;
use crate::context::{ClassEmitContext, EmitContext, FunctionContext, SlotInfo};
use crate::error::{CodegenResult, Diagnostics};
use crate::mangle::SymbolMapper;
use crate::runtime::RuntimeLibrary;
use crate::scope::FunctionScopeAnalyzer;
use crate::symtab::{BaseType, ClassSymbol, MethodDesc, SymbolTable};
use crate::types::{StoreSuffix, TypeManager};

/// Most functions take only a handful of parameters; inlining up to four
/// avoids a heap allocation for the common case the way the builder's own
/// call-argument lists do.
type ParamList = SmallVec<[(String, String); 4]>;

/// What kind of callable a [`FunctionUnit`] lowers to. Carries just enough
/// to pick a mangled name and a calling convention; the rest (params,
/// return type, messaging flag) is looked up from the symbol table by
/// name, except for class members where the class/method symbol supplies
/// it directly.
#[derive(Debug, Clone)]
pub enum FunctionRole {
    Function,
    Sub,
    Worker,
    ClassConstructor(String),
    ClassDestructor(String),
    ClassMethod(String, String),
}

/// One emittable unit: a lowered CFG ready for the block emitter, plus the
/// original (pre-lowering) structured statement list the scope analyzer
/// needs — FOR/WHILE/IF still appear as themselves there, since the CFG
/// builder replaces them with block/edge structure only in `cfg`, not in
/// the arena.
pub struct FunctionUnit {
    pub name: String,
    pub role: FunctionRole,
    pub body: Vec<StmtId>,
    pub cfg: Cfg,
}

/// A fully semantically-analyzed program: the arena, the symbol table, the
/// program entry's own body/CFG, and every function/sub/worker/class
/// member as a [`FunctionUnit`].
pub struct Program {
    pub ast: Ast,
    pub symtab: SymbolTable,
    pub main_body: Vec<StmtId>,
    pub main_cfg: Cfg,
    pub functions: Vec<FunctionUnit>,
}

pub struct CodeGenerator {
    pub diags: Diagnostics,
    types: TypeManager,
    mangle: SymbolMapper,
    runtime: RuntimeLibrary,
}

impl CodeGenerator {
    pub fn new() -> Self {
        CodeGenerator {
            diags: Diagnostics::new(),
            types: TypeManager::new(),
            mangle: SymbolMapper::new(),
            runtime: RuntimeLibrary::new(),
        }
    }

    /// The label the block emitter will give `cfg`'s first RPO block, so a
    /// hand-written prologue can jump into it instead of falling through —
    /// every QBE block needs an explicit terminator, and the block emitter
    /// always opens one for each RPO entry regardless of what came before it.
    fn cfg_entry_label(cfg: &Cfg) -> Option<String> {
        cfg.rpo.first().map(|&idx| {
            let blk = cfg.block(idx);
            blk.name.clone().unwrap_or_else(|| format!("blk_{idx}"))
        })
    }

    /// Last-resort terminator for a prologue that never reaches the block
    /// emitter's own exit handling (an empty CFG with no blocks at all).
    /// Mirrors `BlockEmitter::emit_function_exit` so the two stay in sync.
    fn emit_fallback_exit(&mut self, b: &mut IlBuilder, func: &FunctionContext) -> CodegenResult<()> {
        if b.is_terminated() {
            return Ok(());
        }
        if func.is_function {
            if let Some(addr) = func.return_addr.clone() {
                let dst = b.new_temp();
                let ty = func.return_type.map(|t| t.letter()).unwrap_or("d");
                let suffix = self.types.load_suffix(func.return_base_type);
                b.load(&dst, suffix, ty, &addr)?;
                if func.return_base_type.is_samm_tracked() {
                    self.runtime.call(b, None, "samm_retain", &[dst.clone(), "1".to_string()])?;
                }
                for name in func.epilogue_calls.clone() {
                    self.runtime.call(b, None, &name, &[])?;
                }
                b.ret(Some(&dst))?;
                return Ok(());
            }
        }
        for name in func.epilogue_calls.clone() {
            self.runtime.call(b, None, &name, &[])?;
        }
        b.ret(None)
    }

    /// Runs every orchestration step and returns the complete IL text.
    pub fn generate(&mut self, program: &mut Program) -> CodegenResult<String> {
        log::debug!("generating IL for {} function unit(s)", program.functions.len());
        let mut b = IlBuilder::new();

        b.comment("generated by the BASIC-family QBE codegen core")?;

        self.collect_string_literals(&mut b, &program.ast);
        b.emit_string_pool()?;

        self.emit_globals(&mut b, &program.symtab)?;
        self.emit_array_descriptors(&mut b, &program.symtab)?;
        self.emit_gosub_stack_if_needed(&mut b, program)?;
        self.emit_class_system(&mut b, program)?;
        self.emit_marshall_tables(&mut b, &program.symtab)?;
        self.runtime.emit_declarations(&mut b)?;

        self.emit_main(&mut b, program)?;

        let units: Vec<usize> = (0..program.functions.len())
            .filter(|&i| matches!(program.functions[i].role, FunctionRole::Function | FunctionRole::Sub | FunctionRole::Worker))
            .collect();
        for i in units {
            self.emit_plain_function(&mut b, program, i)?;
        }

        b.emit_late_string_pool()?;

        if program.symtab.variables.values().any(|v| v.base_type == BaseType::Pointer && v.object_type_name.as_deref() == Some("HASHMAP"))
        {
            self.emit_hashmap_module(&mut b)?;
        }

        if !self.diags.is_empty() {
            log::warn!("codegen finished with {} diagnostic(s)", self.diags.len());
        }
        Ok(b.into_text())
    }

    // ---- step 2: string pool -------------------------------------------

    /// Scans every arena slot for string literals (dead or reachable) and
    /// interns each; idempotent interning means a literal reachable from
    /// more than one expression still gets one pool entry.
    fn collect_string_literals(&mut self, b: &mut IlBuilder, ast: &Ast) {
        for i in 0..ast.expr_count() {
            if let Expr::StringLit(s) = ast.expr(ExprId(i as u32)) {
                b.register_string(s.as_bytes());
            }
        }
    }

    // ---- step 3: globals -------------------------------------------------

    fn emit_globals(&mut self, b: &mut IlBuilder, symtab: &SymbolTable) -> CodegenResult<()> {
        let mut names: Vec<&String> = symtab
            .variables
            .keys()
            .filter(|k| !k.contains('.') && symtab.variables[*k].is_global)
            .collect();
        names.sort();
        for key in names {
            let sym = &symtab.variables[key];
            let mangled = self.mangle.global_var(key, sym.base_type);
            let size = match sym.base_type {
                BaseType::UserDefined => sym
                    .udt_or_class_name
                    .as_deref()
                    .map(|n| self.types.size_of_udt(symtab, n))
                    .unwrap_or(8),
                other => self.types.size_of(other),
            };
            b.data_zeroed(&mangled, size)?;
        }
        Ok(())
    }

    // ---- step 4: array descriptors ---------------------------------------

    fn emit_array_descriptors(&mut self, b: &mut IlBuilder, symtab: &SymbolTable) -> CodegenResult<()> {
        let mut names: Vec<&String> = symtab.arrays.keys().collect();
        names.sort();
        for name in names {
            b.data_zeroed(&self.mangle.array_descriptor(name), 64)?;
        }
        Ok(())
    }

    // ---- step 5: GOSUB stack ----------------------------------------------

    fn emit_gosub_stack_if_needed(&mut self, b: &mut IlBuilder, program: &Program) -> CodegenResult<()> {
        let any = !program.main_cfg.collect_gosub_return_points().is_empty()
            || program.functions.iter().any(|f| !f.cfg.collect_gosub_return_points().is_empty());
        if any {
            b.data_zeroed("gosub_stack", 64)?;
            b.data_zeroed("gosub_sp", 4)?;
        }
        Ok(())
    }

    // ---- step 6: class system ----------------------------------------------

    fn emit_class_system(&mut self, b: &mut IlBuilder, program: &mut Program) -> CodegenResult<()> {
        let mut class_names: Vec<String> = program.symtab.classes.keys().cloned().collect();
        class_names.sort();
        for cname in &class_names {
            let class = program.symtab.classes.get(cname).unwrap().clone();
            b.register_string(class.name.to_ascii_uppercase().as_bytes());
        }
        for cname in &class_names {
            self.emit_vtable(b, &program.symtab, cname)?;
        }

        let unit_indices: Vec<usize> = (0..program.functions.len())
            .filter(|&i| {
                matches!(
                    program.functions[i].role,
                    FunctionRole::ClassConstructor(_) | FunctionRole::ClassDestructor(_) | FunctionRole::ClassMethod(_, _)
                )
            })
            .collect();
        for i in unit_indices {
            self.emit_class_member(b, program, i)?;
        }
        Ok(())
    }

    fn emit_vtable(&mut self, b: &mut IlBuilder, symtab: &SymbolTable, cname: &str) -> CodegenResult<()> {
        let class = symtab.classes.get(cname).unwrap();
        let name_label = b
            .get_string_label(class.name.to_ascii_uppercase().as_bytes())
            .expect("class name interned above")
            .to_string();
        let parent_vtable = class
            .parent
            .as_deref()
            .map(|p| format!("${}", self.mangle.vtable(p)))
            .unwrap_or_else(|| "0".to_string());
        let dtor_ptr = class
            .destructor_mangled
            .clone()
            .map(|d| format!("${d}"))
            .unwrap_or_else(|| "0".to_string());
        let methods = class.vtable_methods(symtab);
        let mut body = format!("l {}, l {}, l ${}, l {}", class.class_id, parent_vtable, name_label, dtor_ptr);
        for m in &methods {
            body.push_str(&format!(", l ${}", m.mangled_name));
        }
        b.data_raw(&self.mangle.vtable(cname), &body)
    }

    fn emit_class_member(&mut self, b: &mut IlBuilder, program: &mut Program, idx: usize) -> CodegenResult<()> {
        let (role, body, cfg, unit_name) = {
            let u = &program.functions[idx];
            (u.role.clone(), u.body.clone(), u.cfg.clone(), u.name.clone())
        };
        let _ = unit_name;
        match role {
            FunctionRole::ClassConstructor(class_name) => {
                let class = program.symtab.classes.get(&class_name).cloned().unwrap();
                let mangled = class.constructor_mangled.clone().unwrap_or_else(|| self.mangle.class_constructor(&class_name));
                self.emit_method_body(b, program, &class, None, &mangled, BaseType::Void, None, &body, &cfg)
            }
            FunctionRole::ClassDestructor(class_name) => {
                let class = program.symtab.classes.get(&class_name).cloned().unwrap();
                let mangled = class.destructor_mangled.clone().unwrap_or_else(|| self.mangle.class_destructor(&class_name));
                self.emit_method_body(b, program, &class, None, &mangled, BaseType::Void, None, &body, &cfg)
            }
            FunctionRole::ClassMethod(class_name, method_name) => {
                let class = program.symtab.classes.get(&class_name).cloned().unwrap();
                let Some(m) = class.methods.iter().find(|m| m.name.eq_ignore_ascii_case(&method_name)).cloned() else {
                    self.diags.warn(None, format!("unresolved method `{class_name}.{method_name}`"));
                    return Ok(());
                };
                let mangled = m.mangled_name.clone();
                self.emit_method_body(b, program, &class, Some(&m), &mangled, m.return_type, m.return_type_name.clone(), &body, &cfg)
            }
            _ => unreachable!("filtered by caller"),
        }
    }

    /// Shared machinery for CONSTRUCTOR/DESTRUCTOR/method bodies: every
    /// class member takes an implicit `%ME` receiver as its first
    /// parameter, carries a `ClassEmitContext` for the duration (so
    /// `MethodName = expr` return-assignment and self-calls resolve), and
    /// falls back to loading the return slot in its epilogue.
    fn emit_method_body(
        &mut self,
        b: &mut IlBuilder,
        program: &mut Program,
        class: &ClassSymbol,
        method: Option<&MethodDesc>,
        mangled_name: &str,
        return_base: BaseType,
        return_type_name: Option<String>,
        body: &[StmtId],
        cfg: &Cfg,
    ) -> CodegenResult<()> {
        let _ = return_type_name;
        let is_function = return_base != BaseType::Void;
        let ret_ty = if is_function { self.types.il_type(return_base).letter() } else { "" };
        let mut params: ParamList = smallvec![("l".to_string(), "%ME".to_string())];
        if let Some(m) = method {
            for p in &m.params {
                params.push((self.types.param_type(p.base_type).letter().to_string(), format!("%{}", p.name.to_ascii_uppercase())));
            }
        }
        b.function_header(true, ret_ty, mangled_name, &params)?;
        b.label("entry")?;

        let method_display_name = method.map(|m| m.name.clone()).unwrap_or_else(|| mangled_name.to_string());
        let mut func = FunctionContext::new(&method_display_name, is_function, return_base, if is_function { Some(self.types.il_type(return_base)) } else { None });

        let me_addr = b.new_temp();
        b.alloc(&me_addr, 8, None)?;
        b.store(StoreSuffix::L, "%ME", &me_addr)?;
        func.register_param(
            "ME",
            SlotInfo {
                addr: me_addr,
                il_type: crate::types::IlType::L,
                base_type: BaseType::ClassInstance,
                store_suffix: StoreSuffix::L,
                load_suffix: crate::types::LoadSuffix::Long,
            },
        );

        if let Some(m) = method {
            for p in &m.params {
                let il = self.types.param_type(p.base_type);
                let addr = b.new_temp();
                b.alloc(&addr, self.types.size_of(p.base_type).max(4), None)?;
                b.store(self.types.store_suffix(p.base_type), &format!("%{}", p.name.to_ascii_uppercase()), &addr)?;
                func.register_param(
                    &p.name,
                    SlotInfo {
                        addr,
                        il_type: il,
                        base_type: p.base_type,
                        store_suffix: self.types.store_suffix(p.base_type),
                        load_suffix: self.types.load_suffix(p.base_type),
                    },
                );
            }
        }

        let method_ret_slot = if is_function {
            let addr = b.new_temp();
            b.alloc(&addr, self.types.size_of(return_base).max(4), None)?;
            func.return_addr = Some(addr.clone());
            Some(addr)
        } else {
            None
        };

        let mut ectx = EmitContext::new();
        ectx.class_ctx = Some(ClassEmitContext {
            class_name: class.name.clone(),
            method_ret_slot,
            method_ret_type: if is_function { Some(self.types.il_type(return_base)) } else { None },
            method_name: Some(method_display_name),
        });

        let needs_scope = FunctionScopeAnalyzer::new(&program.ast).needs_scope(body);
        if needs_scope {
            self.runtime.call(b, None, "samm_enter_scope", &[])?;
            func.epilogue_calls.push("samm_exit_scope".to_string());
        }

        if let Some(label) = Self::cfg_entry_label(cfg) {
            b.jump(&label)?;
        }

        {
            let mut emitter = BlockEmitter::new(&program.ast, &mut program.symtab, &self.types, &self.mangle, &self.runtime, &mut self.diags);
            emitter.emit_function(b, cfg, &mut func, &mut ectx)?;
        }

        self.emit_fallback_exit(b, &func)?;
        b.function_footer()?;
        Ok(())
    }

    // ---- step 7: MARSHALL string-offset tables -----------------------------

    fn emit_marshall_tables(&mut self, b: &mut IlBuilder, symtab: &SymbolTable) -> CodegenResult<()> {
        let mut type_names: Vec<String> = symtab.types.keys().cloned().collect();
        type_names.extend(symtab.classes.keys().cloned());
        type_names.sort();
        for name in type_names {
            let offsets = self.flatten_string_offsets(symtab, &name, 0);
            if offsets.is_empty() {
                continue;
            }
            let mut body = format!("w {}", offsets.len());
            for off in offsets {
                body.push_str(&format!(", w {off}"));
            }
            b.data_raw(&format!("str_offsets_{}", name.to_ascii_uppercase()), &body)?;
        }
        Ok(())
    }

    /// Recursively collects byte offsets of every STRING field, descending
    /// into nested UDT/class fields and adding the parent field's offset
    /// so the runtime can walk a flat list without knowing the shape.
    fn flatten_string_offsets(&self, symtab: &SymbolTable, type_name: &str, base_offset: u32) -> Vec<u32> {
        let fields = symtab
            .lookup_type(type_name)
            .map(|t| t.fields.clone())
            .or_else(|| symtab.lookup_class(type_name).map(|c| c.fields.clone()));
        let Some(fields) = fields else { return Vec::new() };
        let mut out = Vec::new();
        for f in &fields {
            let off = base_offset + f.offset;
            match f.type_desc {
                BaseType::String => out.push(off),
                BaseType::UserDefined => {
                    if let Some(n) = &f.type_name {
                        out.extend(self.flatten_string_offsets(symtab, n, off));
                    }
                }
                _ => {}
            }
        }
        out
    }

    // ---- step 9: program entry --------------------------------------------

    fn emit_main(&mut self, b: &mut IlBuilder, program: &mut Program) -> CodegenResult<()> {
        b.function_header(true, "w", "main", &[])?;
        b.label("entry")?;
        self.runtime.call(b, None, "basic_runtime_init", &[])?;
        self.runtime.call(b, None, "samm_init", &[])?;
        self.runtime.call(b, None, "term_init", &[])?;

        // main returns an ordinary w 0 through the same return-slot plumbing
        // every function uses, so a CFG-level RETURN (or just falling off
        // the end) both produce it without special-casing the exit path.
        let mut func = FunctionContext::new("main", true, BaseType::Integer, Some(self.types.il_type(BaseType::Integer)));
        let ret_addr = b.new_temp();
        b.alloc(&ret_addr, 4, None)?;
        b.store(StoreSuffix::W, "0", &ret_addr)?;
        func.return_addr = Some(ret_addr);

        let needs_scope = FunctionScopeAnalyzer::new(&program.ast).needs_scope(&program.main_body);
        if needs_scope {
            self.runtime.call(b, None, "samm_enter_scope", &[])?;
            func.epilogue_calls.push("samm_exit_scope".to_string());
        }
        func.epilogue_calls.push("term_cleanup".to_string());
        func.epilogue_calls.push("basic_runtime_cleanup".to_string());

        let mut ectx = EmitContext::new();

        if let Some(label) = Self::cfg_entry_label(&program.main_cfg) {
            b.jump(&label)?;
        }

        {
            let mut emitter = BlockEmitter::new(&program.ast, &mut program.symtab, &self.types, &self.mangle, &self.runtime, &mut self.diags);
            emitter.emit_function(b, &program.main_cfg, &mut func, &mut ectx)?;
        }

        self.emit_fallback_exit(b, &func)?;
        b.function_footer()?;
        Ok(())
    }

    // ---- step 10: functions / subs / workers -------------------------------

    fn emit_plain_function(&mut self, b: &mut IlBuilder, program: &mut Program, idx: usize) -> CodegenResult<()> {
        let (role, name, body, cfg) = {
            let u = &program.functions[idx];
            (u.role.clone(), u.name.clone(), u.body.clone(), u.cfg.clone())
        };
        let Some(fsym) = program.symtab.lookup_function(&name).cloned() else {
            self.diags.warn(None, format!("unresolved function/sub `{name}`"));
            return Ok(());
        };
        let is_worker = matches!(role, FunctionRole::Worker);
        let mangled = if fsym.is_function { self.mangle.function(&name) } else { self.mangle.sub(&name) };

        let mut params: ParamList = fsym
            .params
            .iter()
            .map(|p| (self.types.param_type(p.base_type).letter().to_string(), format!("%{}", p.name.to_ascii_uppercase())))
            .collect();
        if is_worker && fsym.uses_messaging {
            params.push(("d".to_string(), "%__parent_handle".to_string()));
        }

        let ret_ty = if fsym.is_function { self.types.il_type(fsym.return_type).letter() } else { "" };
        b.function_header(true, ret_ty, &mangled, &params)?;
        b.label("entry")?;

        let mut func = FunctionContext::new(
            &name,
            fsym.is_function,
            fsym.return_type,
            if fsym.is_function { Some(self.types.il_type(fsym.return_type)) } else { None },
        );

        for p in &fsym.params {
            let il = self.types.param_type(p.base_type);
            let addr = b.new_temp();
            b.alloc(&addr, self.types.size_of(p.base_type).max(4), None)?;
            b.store(self.types.store_suffix(p.base_type), &format!("%{}", p.name.to_ascii_uppercase()), &addr)?;
            func.register_param(
                &p.name,
                SlotInfo {
                    addr,
                    il_type: il,
                    base_type: p.base_type,
                    store_suffix: self.types.store_suffix(p.base_type),
                    load_suffix: self.types.load_suffix(p.base_type),
                },
            );
        }
        if is_worker && fsym.uses_messaging {
            let addr = b.new_temp();
            b.alloc(&addr, 8, None)?;
            let handle_l = b.new_temp();
            b.convert(&handle_l, "l", "cast", "%__parent_handle")?;
            b.store(StoreSuffix::L, &handle_l, &addr)?;
            func.register_param(
                "__PARENT_HANDLE",
                SlotInfo {
                    addr,
                    il_type: crate::types::IlType::L,
                    base_type: BaseType::Pointer,
                    store_suffix: StoreSuffix::L,
                    load_suffix: crate::types::LoadSuffix::Long,
                },
            );
        }

        if fsym.is_function {
            let addr = b.new_temp();
            b.alloc(&addr, self.types.size_of(fsym.return_type).max(4), None)?;
            func.return_addr = Some(addr);
        }

        let mut ectx = EmitContext::new();
        let needs_scope = FunctionScopeAnalyzer::new(&program.ast).needs_scope(&body);
        if needs_scope {
            self.runtime.call(b, None, "samm_enter_scope", &[])?;
            func.epilogue_calls.push("samm_exit_scope".to_string());
        }

        if let Some(label) = Self::cfg_entry_label(&cfg) {
            b.jump(&label)?;
        }

        {
            let mut emitter = BlockEmitter::new(&program.ast, &mut program.symtab, &self.types, &self.mangle, &self.runtime, &mut self.diags);
            emitter.emit_function(b, &cfg, &mut func, &mut ectx)?;
        }

        self.emit_fallback_exit(b, &func)?;
        b.function_footer()
    }

    // ---- step 12: hashmap module -------------------------------------------

    /// Appends a small fixed module of IL helper comments describing the
    /// hashmap runtime contract; the actual hash table lives in the C
    /// runtime (`hashmap_new`/`hashmap_insert`/...), so there is no IL body
    /// to generate beyond documenting that the program pulls those symbols
    /// in.
    fn emit_hashmap_module(&mut self, b: &mut IlBuilder) -> CodegenResult<()> {
        b.comment("hashmap module: backed entirely by the C runtime's hashmap_* functions")
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, SourceLoc};
    use crate::cfg::{BlockKind, EdgeKind};
    use crate::symtab::{FunctionSymbol, ParamDesc, Scope, VariableSymbol};

    fn loc() -> SourceLoc {
        SourceLoc { line: 1, col: 1 }
    }

    #[test]
    fn simple_arithmetic_program_lowers_to_expected_shape() {
        let mut ast = Ast::new();
        let two = ast.push_expr(Expr::Number(Literal::Int(2)), loc());
        let three = ast.push_expr(Expr::Number(Literal::Int(3)), loc());
        let four = ast.push_expr(Expr::Number(Literal::Int(4)), loc());
        let mul = ast.push_expr(Expr::Binary(crate::ast::BinOp::Mul, three, four), loc());
        let add = ast.push_expr(Expr::Binary(crate::ast::BinOp::Add, two, mul), loc());
        let target = crate::ast::LetTarget { name: "X".to_string(), chain: vec![] };
        let let_stmt = ast.push_stmt(Stmt::Let { target, suffix: None, value: add }, loc());

        let mut symtab = SymbolTable::new();
        symtab.variables.insert(
            "X".to_string(),
            VariableSymbol {
                base_type: BaseType::Integer,
                udt_or_class_name: None,
                element_type: None,
                object_type_name: None,
                scope: Scope::Global,
                is_global: true,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.push(let_stmt);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let mut program = Program {
            ast,
            symtab,
            main_body: vec![let_stmt],
            main_cfg: cfg,
            functions: vec![],
        };

        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(text.contains("data $var_X_int = { z 4 }"));
        assert!(text.contains("storew"));
        assert!(text.contains("function w $main()"));
    }

    #[test]
    fn double_emit_is_byte_identical() {
        let run = || {
            let mut ast = Ast::new();
            let one = ast.push_expr(Expr::Number(Literal::Int(1)), loc());
            let target = crate::ast::LetTarget { name: "Y".to_string(), chain: vec![] };
            let let_stmt = ast.push_stmt(Stmt::Let { target, suffix: None, value: one }, loc());
            let mut symtab = SymbolTable::new();
            symtab.variables.insert(
                "Y".to_string(),
                VariableSymbol {
                    base_type: BaseType::Integer,
                    udt_or_class_name: None,
                    element_type: None,
                    object_type_name: None,
                    scope: Scope::Global,
                    is_global: true,
                },
            );
            let mut cfg = Cfg::new();
            let entry = cfg.add_block(BlockKind::Entry);
            let exit = cfg.add_block(BlockKind::ExitBlock);
            cfg.blocks[entry].stmts.push(let_stmt);
            cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
            cfg.compute_rpo();
            let mut program = Program { ast, symtab, main_body: vec![let_stmt], main_cfg: cfg, functions: vec![] };
            let mut gen = CodeGenerator::new();
            gen.generate(&mut program).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn function_with_params_builds_prologue_and_return_slot() {
        let mut ast = Ast::new();
        let var_n = ast.push_expr(Expr::Variable("N".to_string()), loc());
        let ret_stmt = ast.push_stmt(Stmt::Return(Some(var_n)), loc());

        let mut symtab = SymbolTable::new();
        symtab.functions.insert(
            "DOUBLEIT".to_string(),
            FunctionSymbol {
                return_type: BaseType::Integer,
                return_type_name: None,
                params: vec![ParamDesc { name: "N".to_string(), base_type: BaseType::Integer, type_name: None }],
                is_function: true,
                is_worker: false,
                uses_messaging: false,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.push(ret_stmt);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let unit = FunctionUnit { name: "DOUBLEIT".to_string(), role: FunctionRole::Function, body: vec![ret_stmt], cfg };
        let mut program = Program { ast, symtab, main_body: vec![], main_cfg: Cfg::new(), functions: vec![unit] };
        program.main_cfg.add_block(BlockKind::Entry);
        program.main_cfg.add_block(BlockKind::ExitBlock);
        program.main_cfg.add_edge(0, 1, EdgeKind::Fallthrough);
        program.main_cfg.compute_rpo();

        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(text.contains("function w $func_DOUBLEIT(w %N)"));
    }

    #[test]
    fn object_return_is_retained_before_scope_exit_runs() {
        let mut ast = Ast::new();
        // DIM forces FunctionScopeAnalyzer::needs_scope to wrap the body
        // in samm_enter_scope/samm_exit_scope.
        let dim_stmt = ast.push_stmt(
            Stmt::Dim { name: "TMP".to_string(), as_type: Some("INTEGER".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let handle = ast.push_expr(Expr::Variable("HANDLE".to_string()), loc());
        let ret_stmt = ast.push_stmt(Stmt::Return(Some(handle)), loc());

        let mut symtab = SymbolTable::new();
        symtab.variables.insert(
            "HANDLE".to_string(),
            VariableSymbol {
                base_type: BaseType::ClassInstance,
                udt_or_class_name: Some("WIDGET".to_string()),
                element_type: None,
                object_type_name: Some("WIDGET".to_string()),
                scope: Scope::Global,
                is_global: true,
            },
        );
        symtab.functions.insert(
            "MAKEWIDGET".to_string(),
            FunctionSymbol {
                return_type: BaseType::ClassInstance,
                return_type_name: Some("WIDGET".to_string()),
                params: vec![],
                is_function: true,
                is_worker: false,
                uses_messaging: false,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.push(ret_stmt);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let unit = FunctionUnit {
            name: "MAKEWIDGET".to_string(),
            role: FunctionRole::Function,
            body: vec![dim_stmt, ret_stmt],
            cfg,
        };
        let mut program = Program { ast, symtab, main_body: vec![], main_cfg: Cfg::new(), functions: vec![unit] };
        program.main_cfg.add_block(BlockKind::Entry);
        program.main_cfg.add_block(BlockKind::ExitBlock);
        program.main_cfg.add_edge(0, 1, EdgeKind::Fallthrough);
        program.main_cfg.compute_rpo();

        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();

        let retain_pos = text.find("call $samm_retain").expect("samm_retain was never called for an object return");
        let exit_pos = text.find("call $samm_exit_scope").expect("samm_exit_scope was never emitted");
        assert!(retain_pos < exit_pos, "samm_retain must run before samm_exit_scope, got:\n{text}");
    }

    #[test]
    fn class_with_string_field_emits_offsets_table() {
        let mut symtab = SymbolTable::new();
        symtab.types.insert(
            "PERSON".to_string(),
            crate::symtab::TypeSymbol {
                name: "PERSON".to_string(),
                fields: vec![crate::symtab::UdtField {
                    name: "NAME".to_string(),
                    type_desc: BaseType::String,
                    type_name: None,
                    offset: 0,
                }],
                simd: None,
            },
        );
        let mut program = Program {
            ast: Ast::new(),
            symtab,
            main_body: vec![],
            main_cfg: {
                let mut c = Cfg::new();
                c.add_block(BlockKind::Entry);
                c.add_block(BlockKind::ExitBlock);
                c.add_edge(0, 1, EdgeKind::Fallthrough);
                c.compute_rpo();
                c
            },
            functions: vec![],
        };
        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(text.contains("data $str_offsets_PERSON = { w 1, w 0 }"));
    }

    fn vec4_type() -> crate::symtab::TypeSymbol {
        crate::symtab::TypeSymbol {
            name: "VEC4".to_string(),
            fields: (0..4)
                .map(|i| crate::symtab::UdtField {
                    name: format!("F{i}"),
                    type_desc: BaseType::Integer,
                    type_name: None,
                    offset: i * 4,
                })
                .collect(),
            simd: Some(crate::symtab::SimdInfo { arrangement: crate::symtab::SimdArrangement::I32x4 }),
        }
    }

    fn udt_binop_program(neon_enabled: bool) -> Program {
        let mut ast = Ast::new();
        let dim_a = ast.push_stmt(
            Stmt::Dim { name: "A".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let dim_b = ast.push_stmt(
            Stmt::Dim { name: "B".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let dim_c = ast.push_stmt(
            Stmt::Dim { name: "C".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let var_a = ast.push_expr(Expr::Variable("A".to_string()), loc());
        let var_b = ast.push_expr(Expr::Variable("B".to_string()), loc());
        let sum = ast.push_expr(Expr::Binary(crate::ast::BinOp::Add, var_a, var_b), loc());
        let target = crate::ast::LetTarget { name: "C".to_string(), chain: vec![] };
        let let_stmt = ast.push_stmt(Stmt::Let { target, suffix: None, value: sum }, loc());

        let mut symtab = SymbolTable::new();
        symtab.types.insert("VEC4".to_string(), vec4_type());
        symtab.neon_enabled = neon_enabled;

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.extend([dim_a, dim_b, dim_c, let_stmt]);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        Program { ast, symtab, main_body: vec![dim_a, dim_b, dim_c, let_stmt], main_cfg: cfg, functions: vec![] }
    }

    #[test]
    fn whole_udt_add_with_neon_enabled_emits_single_call() {
        let mut program = udt_binop_program(true);
        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(text.contains("call $neon_add_i32x4"));
        assert!(!text.contains("loadw"));
    }

    #[test]
    fn whole_udt_add_without_neon_falls_back_to_scalar_fields() {
        let mut program = udt_binop_program(false);
        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(!text.contains("neon_add_i32x4"));
        assert_eq!(text.matches("loadw").count(), 8, "expected one load per lhs/rhs field across 4 fields");
        assert_eq!(text.matches("storew").count(), 4, "expected one store per result field");
    }

    #[test]
    fn whole_udt_copy_assignment_emits_blit_not_truncated_store() {
        let mut ast = Ast::new();
        let dim_a = ast.push_stmt(
            Stmt::Dim { name: "A".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let dim_c = ast.push_stmt(
            Stmt::Dim { name: "C".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let var_a = ast.push_expr(Expr::Variable("A".to_string()), loc());
        let target = crate::ast::LetTarget { name: "C".to_string(), chain: vec![] };
        let let_stmt = ast.push_stmt(Stmt::Let { target, suffix: None, value: var_a }, loc());

        let mut symtab = SymbolTable::new();
        symtab.types.insert("VEC4".to_string(), vec4_type());

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.extend([dim_a, dim_c, let_stmt]);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let mut program = Program { ast, symtab, main_body: vec![dim_a, dim_c, let_stmt], main_cfg: cfg, functions: vec![] };
        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(text.contains("blit"), "expected a blit copy for whole-UDT assignment, got:\n{text}");
    }

    #[test]
    fn udt_variable_argument_passes_slot_address_with_no_load() {
        // A UDT local passed as a call argument must hand over its own
        // stack-slot address, never a value loaded from it.
        let mut ast = Ast::new();
        let dim_a = ast.push_stmt(
            Stmt::Dim { name: "A".to_string(), as_type: Some("VEC4".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let var_a = ast.push_expr(Expr::Variable("A".to_string()), loc());
        let call_stmt = ast.push_stmt(Stmt::Call { name: "TAKESVEC".to_string(), args: vec![var_a] }, loc());

        let mut symtab = SymbolTable::new();
        symtab.types.insert("VEC4".to_string(), vec4_type());
        symtab.functions.insert(
            "TAKESVEC".to_string(),
            FunctionSymbol {
                return_type: BaseType::Void,
                return_type_name: None,
                params: vec![ParamDesc { name: "V".to_string(), base_type: BaseType::UserDefined, type_name: Some("VEC4".to_string()) }],
                is_function: false,
                is_worker: false,
                uses_messaging: false,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.extend([dim_a, call_stmt]);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let mut program = Program { ast, symtab, main_body: vec![dim_a, call_stmt], main_cfg: cfg, functions: vec![] };
        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();
        assert!(!text.contains("loadl") && !text.contains("loadw"), "UDT argument must not be loaded, got:\n{text}");
        assert!(text.contains("call $sub_TAKESVEC"));
    }

    #[test]
    fn match_receive_forward_arm_is_zero_copy() {
        // Scenario 5: a worker receives a UDT message and bounces it back
        // unchanged — MATCH RECEIVE handle : CASE m AS Msg : SEND handle, m
        // : END MATCH.
        let mut ast = Ast::new();
        let parent_handle = ast.push_expr(Expr::Parent, loc());
        let bind_var = ast.push_expr(Expr::Variable("M".to_string()), loc());
        let send_handle = ast.push_expr(Expr::Parent, loc());
        let send_stmt = ast.push_stmt(Stmt::Send { handle: send_handle, value: bind_var }, loc());
        let match_receive = ast.push_stmt(
            Stmt::MatchReceive {
                handle: parent_handle,
                arms: vec![crate::ast::MatchReceiveArm {
                    bind_var: "M".to_string(),
                    type_name: "MSG".to_string(),
                    is_forward: true,
                    body: vec![send_stmt],
                }],
            },
            loc(),
        );

        let mut symtab = SymbolTable::new();
        symtab.types.insert(
            "MSG".to_string(),
            crate::symtab::TypeSymbol {
                name: "MSG".to_string(),
                fields: vec![crate::symtab::UdtField { name: "PAYLOAD".to_string(), type_desc: BaseType::Integer, type_name: None, offset: 0 }],
                simd: None,
            },
        );
        symtab.functions.insert(
            "ECHOWORKER".to_string(),
            FunctionSymbol {
                return_type: BaseType::Void,
                return_type_name: None,
                params: vec![],
                is_function: false,
                is_worker: true,
                uses_messaging: true,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.push(match_receive);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let unit = FunctionUnit { name: "ECHOWORKER".to_string(), role: FunctionRole::Worker, body: vec![match_receive], cfg };
        let mut program = Program { ast, symtab, main_body: vec![], main_cfg: Cfg::new(), functions: vec![unit] };
        program.main_cfg.add_block(BlockKind::Entry);
        program.main_cfg.add_block(BlockKind::ExitBlock);
        program.main_cfg.add_edge(0, 1, EdgeKind::Fallthrough);
        program.main_cfg.compute_rpo();

        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();

        let payload_pos = text.find("call $msg_blob_payload_ptr").expect("forward arm must fetch the payload pointer directly (zero-copy)");
        let forward_pos = text.find("call $msg_blob_forward").expect("SEND of the bound variable inside a forward arm must call msg_blob_forward");
        let free_pos = text.rfind("call $msg_blob_free").expect("the merge block must free the blob reference");
        assert!(payload_pos < forward_pos, "payload must be fetched before the forward, got:\n{text}");
        assert!(forward_pos < free_pos, "forward must run before the merge block's free, got:\n{text}");
        assert!(!text.contains("unmarshall_udt"), "a forward arm must not unmarshal a copy, got:\n{text}");
        assert!(text.contains("call $msg_queue_pop"));
        assert!(text.contains("call $msg_blob_tag"));
        assert!(text.contains("call $msg_blob_type_id"));
    }

    #[test]
    fn print_locks_and_pretty_prints_a_udt() {
        // PRINT P, where P AS Point (X AS INTEGER, Y AS INTEGER), must lock
        // around the whole statement and print "{X: .., Y: ..}" field by
        // field instead of falling through to basic_print_double on P
        // itself.
        let mut ast = Ast::new();
        let dim_stmt = ast.push_stmt(
            Stmt::Dim { name: "P".to_string(), as_type: Some("POINT".to_string()), dims: vec![], init: None, is_global: false },
            loc(),
        );
        let p_var = ast.push_expr(Expr::Variable("P".to_string()), loc());
        let print_stmt = ast.push_stmt(Stmt::Print { items: vec![p_var], newline: true, file: None }, loc());

        let mut symtab = SymbolTable::new();
        symtab.types.insert(
            "POINT".to_string(),
            crate::symtab::TypeSymbol {
                name: "POINT".to_string(),
                fields: vec![
                    crate::symtab::UdtField { name: "X".to_string(), type_desc: BaseType::Integer, type_name: None, offset: 0 },
                    crate::symtab::UdtField { name: "Y".to_string(), type_desc: BaseType::Integer, type_name: None, offset: 4 },
                ],
                simd: None,
            },
        );
        symtab.functions.insert(
            "SHOWPOINT".to_string(),
            FunctionSymbol {
                return_type: BaseType::Void,
                return_type_name: None,
                params: vec![],
                is_function: false,
                is_worker: false,
                uses_messaging: false,
            },
        );

        let mut cfg = Cfg::new();
        let entry = cfg.add_block(BlockKind::Entry);
        let exit = cfg.add_block(BlockKind::ExitBlock);
        cfg.blocks[entry].stmts.push(dim_stmt);
        cfg.blocks[entry].stmts.push(print_stmt);
        cfg.add_edge(entry, exit, EdgeKind::Fallthrough);
        cfg.compute_rpo();

        let unit = FunctionUnit { name: "SHOWPOINT".to_string(), role: FunctionRole::Sub, body: vec![dim_stmt, print_stmt], cfg };
        let mut program = Program { ast, symtab, main_body: vec![], main_cfg: Cfg::new(), functions: vec![unit] };
        program.main_cfg.add_block(BlockKind::Entry);
        program.main_cfg.add_block(BlockKind::ExitBlock);
        program.main_cfg.add_edge(0, 1, EdgeKind::Fallthrough);
        program.main_cfg.compute_rpo();

        let mut gen = CodeGenerator::new();
        let text = gen.generate(&mut program).unwrap();

        let lock_pos = text.find("call $basic_print_lock").expect("PRINT must acquire the print mutex");
        let unlock_pos = text.find("call $basic_print_unlock").expect("PRINT must release the print mutex");
        assert!(lock_pos < unlock_pos, "lock must precede unlock, got:\n{text}");
        assert_eq!(text.matches("call $basic_print_int").count(), 2, "both X and Y fields must print as integers, got:\n{text}");
        assert!(!text.contains("call $basic_print_double"), "a UDT value must not fall through to basic_print_double, got:\n{text}");
        assert!(text.contains("data $str_0 "), "brace/field-name literals must land in the string pool, got:\n{text}");
    }
}
