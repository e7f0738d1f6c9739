//! IL Builder: the lowest layer. Appends QBE IL text to a buffer,
//! allocates SSA temporaries and labels, pools string constants, and
//! tracks per-block termination so upstream emitters can naively emit a
//! fallthrough jump without tracking whether a prior statement already
//! terminated the block.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{CodegenError, CodegenResult};
use crate::types::{LoadSuffix, StoreSuffix};

fn try_write(buf: &mut String, args: std::fmt::Arguments<'_>) -> CodegenResult<()> {
    buf.try_reserve(args.as_str().map(str::len).unwrap_or(64))
        .map_err(|_| CodegenError::OutOfMemory)?;
    buf.write_fmt(args).map_err(|_| CodegenError::OutOfMemory)
}

macro_rules! emit {
    ($self:ident, $($arg:tt)*) => {
        try_write(&mut $self.buf, format_args!($($arg)*))
    };
}

/// Signed integer comparison operators emit QBE's `cs` (signed) prefix;
/// unsigned comparisons would use `cu`, but the source language has no
/// unsigned comparison operators at the IL boundary (unsigned base types
/// are still compared with the signed opcodes once widened). Equality
/// and inequality never take a sign prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn mnemonic(self, float: bool) -> &'static str {
        match (self, float) {
            (Cmp::Eq, false) => "ceq",
            (Cmp::Ne, false) => "cne",
            (Cmp::Lt, false) => "cslt",
            (Cmp::Le, false) => "csle",
            (Cmp::Gt, false) => "csgt",
            (Cmp::Ge, false) => "csge",
            (Cmp::Eq, true) => "ceq",
            (Cmp::Ne, true) => "cne",
            (Cmp::Lt, true) => "clt",
            (Cmp::Le, true) => "cle",
            (Cmp::Gt, true) => "cgt",
            (Cmp::Ge, true) => "cgt",
        }
    }
}

/// One string pool entry: the interned value plus the label QBE will use
/// for it. `emitted` tracks whether it has already been flushed to the
/// output, so `emit_late_string_pool` can flush only the remainder.
struct PoolEntry {
    value: Vec<u8>,
    label: String,
    emitted: bool,
}

pub struct IlBuilder {
    buf: String,
    temp_counter: u32,
    label_counter: u32,
    str_counter: u32,
    terminated: bool,
    current_label: Option<String>,
    pool: Vec<PoolEntry>,
    pool_index: HashMap<Vec<u8>, usize>,
}

impl IlBuilder {
    pub fn new() -> Self {
        IlBuilder {
            buf: String::new(),
            temp_counter: 0,
            label_counter: 0,
            str_counter: 0,
            terminated: false,
            current_label: None,
            pool: Vec::new(),
            pool_index: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.temp_counter = 0;
        self.label_counter = 0;
        self.str_counter = 0;
        self.terminated = false;
        self.current_label = None;
        self.pool.clear();
        self.pool_index.clear();
    }

    pub fn text(&self) -> &str {
        &self.buf
    }

    pub fn into_text(self) -> String {
        self.buf
    }

    // ---- counters -------------------------------------------------

    pub fn new_temp(&mut self) -> String {
        let t = format!("%t.{}", self.temp_counter);
        self.temp_counter += 1;
        t
    }

    pub fn next_label_id(&mut self) -> u32 {
        let id = self.label_counter;
        self.label_counter += 1;
        id
    }

    pub fn new_label(&mut self) -> String {
        format!("id_{}", self.next_label_id())
    }

    pub fn current_label(&self) -> Option<&str> {
        self.current_label.as_deref()
    }

    // ---- raw text / termination state ------------------------------

    pub fn raw(&mut self, text: &str) -> CodegenResult<()> {
        emit!(self, "{text}")
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Emits a generic instruction of the form `%dst =ty op args`. Does
    /// nothing and returns Ok if the current block is terminated.
    pub fn instr(&mut self, dst: Option<(&str, &str)>, op: &str, args: &[&str]) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        match dst {
            Some((d, ty)) => emit!(self, "    {d} ={ty} {op} {}\n", args.join(", "))?,
            None => emit!(self, "    {op} {}\n", args.join(", "))?,
        }
        Ok(())
    }

    // ---- function / block structure ---------------------------------

    pub fn function_header(
        &mut self,
        exported: bool,
        ret_ty: &str,
        name: &str,
        params: &[(String, String)],
    ) -> CodegenResult<()> {
        let export = if exported { "export " } else { "" };
        let ret = if ret_ty.is_empty() { String::new() } else { format!("{ret_ty} ") };
        let param_list = params
            .iter()
            .map(|(ty, p)| format!("{ty} {p}"))
            .collect::<Vec<_>>()
            .join(", ");
        emit!(self, "{export}function {ret}${name}({param_list}) {{\n")?;
        self.terminated = true;
        self.current_label = None;
        Ok(())
    }

    pub fn function_footer(&mut self) -> CodegenResult<()> {
        emit!(self, "}}\n")
    }

    /// Emits a block label. This is the only way to "reopen" a
    /// previously terminated block: `terminated` resets to `false`.
    pub fn label(&mut self, name: &str) -> CodegenResult<()> {
        emit!(self, "@{name}\n")?;
        self.terminated = false;
        self.current_label = Some(name.to_string());
        Ok(())
    }

    // ---- arithmetic / comparisons ------------------------------------

    pub fn binop(&mut self, dst: &str, ty: &str, op: &str, a: &str, b: &str) -> CodegenResult<()> {
        self.instr(Some((dst, ty)), op, &[a, b])
    }

    pub fn cmp(&mut self, dst: &str, ty: &str, cmp: Cmp, float: bool, a: &str, b: &str) -> CodegenResult<()> {
        let op = format!("{}{}", cmp.mnemonic(float), ty);
        self.instr(Some((dst, "w")), &op, &[a, b])
    }

    /// Unary negation via `sub 0, x` (QBE has no dedicated neg opcode).
    pub fn neg(&mut self, dst: &str, ty: &str, x: &str) -> CodegenResult<()> {
        let zero = if ty == "s" || ty == "d" { "0" } else { "0" };
        self.instr(Some((dst, ty)), "sub", &[zero, x])
    }

    // ---- memory ops ---------------------------------------------------

    pub fn load(&mut self, dst: &str, suffix: LoadSuffix, ty: &str, addr: &str) -> CodegenResult<()> {
        self.instr(Some((dst, ty)), suffix.qbe_op(), &[addr])
    }

    pub fn store(&mut self, suffix: StoreSuffix, value: &str, addr: &str) -> CodegenResult<()> {
        let op = format!("store{}", suffix.letter());
        self.instr(None, &op, &[value, addr])
    }

    /// Stack allocation. Chooses alignment from `size` when `align` is
    /// `None` (4 bytes for <= 4 byte allocations, else 8).
    pub fn alloc(&mut self, dst: &str, size: u32, align: Option<u32>) -> CodegenResult<()> {
        let align = align.unwrap_or(if size <= 4 { 4 } else { 8 });
        let op = format!("alloc{align}");
        let size_str = size.to_string();
        self.instr(Some((dst, "l")), &op, &[&size_str])
    }

    pub fn blit(&mut self, src: &str, dst: &str, n: u32) -> CodegenResult<()> {
        let n_str = n.to_string();
        self.instr(None, "blit", &[src, dst, &n_str])
    }

    // ---- control flow ---------------------------------------------------

    pub fn jump(&mut self, label: &str) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        emit!(self, "    jmp @{label}\n")?;
        self.terminated = true;
        Ok(())
    }

    pub fn branch(&mut self, cond: &str, if_true: &str, if_false: &str) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        emit!(self, "    jnz {cond}, @{if_true}, @{if_false}\n")?;
        self.terminated = true;
        Ok(())
    }

    pub fn ret(&mut self, value: Option<&str>) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        match value {
            Some(v) => emit!(self, "    ret {v}\n")?,
            None => emit!(self, "    ret\n")?,
        }
        self.terminated = true;
        Ok(())
    }

    // ---- calls ---------------------------------------------------------

    pub fn call(
        &mut self,
        dst: Option<(&str, &str)>,
        callee: &str,
        args: &[(String, String)],
    ) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        let arg_list = args
            .iter()
            .map(|(ty, v)| format!("{ty} {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        match dst {
            Some((d, ty)) => emit!(self, "    {d} ={ty} call {callee}({arg_list})\n")?,
            None => emit!(self, "    call {callee}({arg_list})\n")?,
        }
        Ok(())
    }

    /// Indirect call via a computed function-pointer value (used by
    /// virtual method dispatch: the callee is a loaded temp, not a
    /// `$name`).
    pub fn call_indirect(
        &mut self,
        dst: Option<(&str, &str)>,
        fn_ptr: &str,
        args: &[(String, String)],
    ) -> CodegenResult<()> {
        self.call(dst, fn_ptr, args)
    }

    // ---- conversions -----------------------------------------------

    pub fn extend(&mut self, dst: &str, op: &str, src: &str) -> CodegenResult<()> {
        self.instr(Some((dst, if op.ends_with('w') { "l" } else { "w" })), op, &[src])
    }

    pub fn convert(&mut self, dst: &str, dst_ty: &str, op: &str, src: &str) -> CodegenResult<()> {
        self.instr(Some((dst, dst_ty)), op, &[src])
    }

    pub fn truncate(&mut self, dst: &str, op: &str, src: &str) -> CodegenResult<()> {
        self.instr(Some((dst, "w")), op, &[src])
    }

    pub fn phi(&mut self, dst: &str, ty: &str, preds: &[(String, String)]) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        let list = preds
            .iter()
            .map(|(label, val)| format!("@{label} {val}"))
            .collect::<Vec<_>>()
            .join(", ");
        emit!(self, "    {dst} ={ty} phi {list}\n")
    }

    // ---- global data ------------------------------------------------

    pub fn data_zeroed(&mut self, name: &str, size: u32) -> CodegenResult<()> {
        emit!(self, "data ${name} = {{ z {size} }}\n")
    }

    pub fn data_scalar(&mut self, name: &str, ty_letter: &str, value: &str) -> CodegenResult<()> {
        emit!(self, "data ${name} = {{ {ty_letter} {value} }}\n")
    }

    pub fn data_raw(&mut self, name: &str, body: &str) -> CodegenResult<()> {
        emit!(self, "data ${name} = {{ {body} }}\n")
    }

    pub fn comment(&mut self, text: &str) -> CodegenResult<()> {
        emit!(self, "# {text}\n")
    }

    pub fn warn(&mut self, text: &str) -> CodegenResult<()> {
        emit!(self, "# WARN: {text}\n")
    }

    // ---- string pool --------------------------------------------------

    /// Escapes a byte string for a QBE `data` string literal: `\n \r \t \\
    /// \" \0` get their short forms, everything else outside printable
    /// ASCII becomes `\xHH`.
    fn escape_string(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() + 2);
        out.push('"');
        for &b in bytes {
            match b {
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                b'\t' => out.push_str("\\t"),
                b'\\' => out.push_str("\\\\"),
                b'"' => out.push_str("\\\""),
                0 => out.push_str("\\0"),
                0x20..=0x7e => out.push(b as char),
                other => {
                    out.push_str(&format!("\\x{other:02x}"));
                }
            }
        }
        out.push('"');
        out
    }

    /// Idempotent: identical byte values map to the same pool label.
    pub fn register_string(&mut self, value: &[u8]) -> String {
        if let Some(&idx) = self.pool_index.get(value) {
            return self.pool[idx].label.clone();
        }
        let idx = self.pool.len();
        let label = format!("str_{}", self.str_counter);
        self.str_counter += 1;
        self.pool.push(PoolEntry {
            value: value.to_vec(),
            label: label.clone(),
            emitted: false,
        });
        self.pool_index.insert(value.to_vec(), idx);
        label
    }

    pub fn has_string(&self, value: &[u8]) -> bool {
        self.pool_index.contains_key(value)
    }

    pub fn get_string_label(&self, value: &[u8]) -> Option<&str> {
        self.pool_index.get(value).map(|&idx| self.pool[idx].label.as_str())
    }

    /// Flushes every registered string as a `data` declaration,
    /// regardless of whether it was already emitted. Used once, near the
    /// start of the file.
    pub fn emit_string_pool(&mut self) -> CodegenResult<()> {
        let entries: Vec<(String, Vec<u8>)> = self
            .pool
            .iter()
            .map(|e| (e.label.clone(), e.value.clone()))
            .collect();
        for (label, value) in entries {
            let escaped = Self::escape_string(&value);
            let len = value.len();
            emit!(self, "data ${label} = {{ b {escaped}, b 0, z 0 }} # len {len}\n")?;
        }
        for entry in &mut self.pool {
            entry.emitted = true;
        }
        Ok(())
    }

    /// Flushes only the strings registered after `emit_string_pool` ran
    /// (interned mid-codegen, e.g. by a runtime-error message), so the
    /// two phases together cover every registered string exactly once.
    pub fn emit_late_string_pool(&mut self) -> CodegenResult<()> {
        let pending: Vec<(String, Vec<u8>)> = self
            .pool
            .iter()
            .filter(|e| !e.emitted)
            .map(|e| (e.label.clone(), e.value.clone()))
            .collect();
        for (label, value) in pending {
            let escaped = Self::escape_string(&value);
            emit!(self, "data ${label} = {{ b {escaped}, b 0, z 0 }}\n")?;
        }
        for entry in &mut self.pool {
            entry.emitted = true;
        }
        Ok(())
    }
}

impl Default for IlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_suppresses_further_instructions_until_label() {
        let mut b = IlBuilder::new();
        b.label("start").unwrap();
        b.jump("end").unwrap();
        let before = b.text().len();
        b.jump("other").unwrap();
        b.ret(None).unwrap();
        assert_eq!(b.text().len(), before, "instructions after terminator must be dropped");
        b.label("end").unwrap();
        b.ret(None).unwrap();
        assert!(b.text().ends_with("ret\n"));
    }

    #[test]
    fn string_pool_is_idempotent() {
        let mut b = IlBuilder::new();
        let l1 = b.register_string(b"hello");
        let l2 = b.register_string(b"hello");
        assert_eq!(l1, l2);
        let l3 = b.register_string(b"world");
        assert_ne!(l1, l3);
    }

    #[test]
    fn two_phase_pool_flush_covers_every_string_once() {
        let mut b = IlBuilder::new();
        b.register_string(b"a");
        b.emit_string_pool().unwrap();
        b.register_string(b"b");
        b.emit_late_string_pool().unwrap();
        let text = b.text();
        assert_eq!(text.matches("data $str_0").count(), 1);
        assert_eq!(text.matches("data $str_1").count(), 1);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut b = IlBuilder::new();
        b.new_temp();
        b.register_string(b"x");
        b.label("l").unwrap();
        b.reset();
        assert_eq!(b.text(), "");
        assert_eq!(b.new_temp(), "%t.0");
        assert!(!b.has_string(b"x"));
    }

    #[test]
    fn double_emit_is_byte_identical() {
        let run = || {
            let mut b = IlBuilder::new();
            b.register_string(b"hi");
            b.label("entry").unwrap();
            let t = b.new_temp();
            b.binop(&t, "w", "add", "1", "2").unwrap();
            b.ret(Some(&t)).unwrap();
            b.emit_string_pool().unwrap();
            b.into_text()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn escape_writer_handles_all_special_bytes() {
        let mut b = IlBuilder::new();
        b.register_string(b"a\nb\tc\\\"d\0e");
        b.emit_string_pool().unwrap();
        assert!(b.text().contains("\\n"));
        assert!(b.text().contains("\\t"));
        assert!(b.text().contains("\\\\"));
        assert!(b.text().contains("\\\""));
        assert!(b.text().contains("\\0"));
    }
}
