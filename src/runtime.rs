//! Runtime Library: the fixed set of C runtime functions the codegen may
//! call, plus typed call helpers built on top of the IL Builder. The
//! actual C implementations live outside this core; QBE resolves them as
//! externs at link time. Declarations are emitted as informational
//! comments only — the real contract is the signature these helpers
//! assume.

use crate::builder::IlBuilder;
use crate::error::CodegenResult;

/// One runtime function's descriptor: its linker name, argument IL
/// types, and return IL type (empty string for void).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFn {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub ret: &'static str,
}

macro_rules! rtfn {
    ($name:expr, [$($arg:expr),*], $ret:expr) => {
        RuntimeFn { name: $name, args: &[$($arg),*], ret: $ret }
    };
}

/// Every runtime function this core may reference, grouped the way
/// §4.4 groups them. The list is exhaustive for declaration purposes;
/// call sites still go through `RuntimeLibrary::call`.
pub const RUNTIME_FNS: &[RuntimeFn] = &[
    // I/O
    rtfn!("basic_print_int", ["w"], ""),
    rtfn!("basic_print_double", ["d"], ""),
    rtfn!("basic_print_string_desc", ["l"], ""),
    rtfn!("basic_print_newline", [], ""),
    rtfn!("basic_print_tab", [], ""),
    rtfn!("basic_print_lock", [], ""),
    rtfn!("basic_print_unlock", [], ""),
    rtfn!("basic_read_line", [], "l"),
    rtfn!("file_print_int", ["l", "w"], ""),
    rtfn!("file_print_double", ["l", "d"], ""),
    rtfn!("file_print_string_desc", ["l", "l"], ""),
    // String descriptors
    rtfn!("string_from_cstr", ["l"], "l"),
    rtfn!("string_concat", ["l", "l"], "l"),
    rtfn!("string_compare", ["l", "l"], "w"),
    rtfn!("string_length", ["l"], "l"),
    rtfn!("string_retain", ["l"], ""),
    rtfn!("string_release", ["l"], ""),
    rtfn!("string_slice", ["l", "w", "w"], "l"),
    rtfn!("string_upper", ["l"], "l"),
    rtfn!("string_lower", ["l"], "l"),
    rtfn!("string_find", ["l", "l"], "w"),
    rtfn!("string_trim", ["l"], "l"),
    rtfn!("string_repeat", ["l", "w"], "l"),
    rtfn!("string_from_int", ["w"], "l"),
    rtfn!("string_from_double", ["d"], "l"),
    rtfn!("string_to_int", ["l"], "w"),
    rtfn!("string_to_double", ["l"], "d"),
    // Math
    rtfn!("basic_pow", ["d", "d"], "d"),
    rtfn!("basic_sqrt", ["d"], "d"),
    rtfn!("basic_sin", ["d"], "d"),
    rtfn!("basic_cos", ["d"], "d"),
    rtfn!("basic_atan2", ["d", "d"], "d"),
    // Memory
    rtfn!("basic_malloc", ["l"], "l"),
    rtfn!("basic_free", ["l"], ""),
    // Arrays
    rtfn!("array_create_1d", ["w", "w"], "l"),
    rtfn!("array_create_2d", ["w", "w", "w"], "l"),
    rtfn!("array_bounds_check", ["l", "w"], ""),
    rtfn!("array_element_addr", ["l", "w"], "l"),
    rtfn!("array_element_addr_2d", ["l", "w", "w"], "l"),
    rtfn!("array_erase", ["l"], ""),
    // Scope-aware memory manager
    rtfn!("samm_init", [], ""),
    rtfn!("samm_shutdown", [], ""),
    rtfn!("samm_enter_scope", [], ""),
    rtfn!("samm_exit_scope", [], ""),
    rtfn!("samm_retain", ["l", "w"], ""),
    rtfn!("samm_register_cleanup", ["l"], ""),
    // Error
    rtfn!("basic_set_line", ["w"], ""),
    rtfn!("basic_set_error", ["w"], ""),
    rtfn!("basic_runtime_init", [], ""),
    rtfn!("basic_runtime_cleanup", [], ""),
    // Object system
    rtfn!("object_alloc", ["l", "l", "w"], "l"),
    rtfn!("object_delete", ["l"], ""),
    rtfn!("class_is_instance", ["l", "w"], "w"),
    // Data statements
    rtfn!("data_init", [], ""),
    rtfn!("data_read_int", [], "w"),
    rtfn!("data_read_double", [], "d"),
    rtfn!("data_read_string", [], "l"),
    rtfn!("data_restore", [], ""),
    // Timer
    rtfn!("timer_now", [], "d"),
    rtfn!("timer_ms", [], "l"),
    rtfn!("timer_sleep", ["l"], ""),
    rtfn!("timer_after_send", ["l", "l", "l"], "w"),
    rtfn!("timer_every_send", ["l", "l", "l"], "w"),
    rtfn!("timer_stop", ["w"], ""),
    rtfn!("timer_stop_all", [], ""),
    // Hashmap
    rtfn!("hashmap_new", ["w"], "l"),
    rtfn!("hashmap_free", ["l"], ""),
    rtfn!("hashmap_insert", ["l", "l", "l"], ""),
    rtfn!("hashmap_lookup", ["l", "l"], "l"),
    rtfn!("hashmap_has_key", ["l", "l"], "w"),
    rtfn!("hashmap_remove", ["l", "l"], ""),
    rtfn!("hashmap_size", ["l"], "w"),
    rtfn!("hashmap_clear", ["l"], ""),
    rtfn!("hashmap_keys", ["l"], "l"),
    // List
    rtfn!("list_create", [], "l"),
    rtfn!("list_create_typed", ["w"], "l"),
    rtfn!("list_free", ["l"], ""),
    rtfn!("list_append", ["l", "l"], ""),
    rtfn!("list_prepend", ["l", "l"], ""),
    rtfn!("list_insert", ["l", "l", "l"], ""),
    rtfn!("list_length", ["l"], "l"),
    rtfn!("list_empty", ["l"], "w"),
    rtfn!("list_get_int", ["l", "l"], "w"),
    rtfn!("list_get_float", ["l", "l"], "d"),
    rtfn!("list_get_ptr", ["l", "l"], "l"),
    rtfn!("list_head", ["l"], "l"),
    rtfn!("list_shift", ["l"], "l"),
    rtfn!("list_pop", ["l"], "l"),
    rtfn!("list_remove", ["l", "l"], ""),
    rtfn!("list_clear", ["l"], ""),
    rtfn!("list_contains", ["l", "l"], "w"),
    rtfn!("list_index_of", ["l", "l"], "l"),
    rtfn!("list_join", ["l", "l"], "l"),
    rtfn!("list_copy", ["l"], "l"),
    rtfn!("list_reverse", ["l"], "l"),
    rtfn!("list_set_int", ["l", "l", "w"], ""),
    rtfn!("list_set_float", ["l", "l", "d"], ""),
    rtfn!("list_set_ptr", ["l", "l", "l"], ""),
    rtfn!("list_iter_begin", ["l"], "l"),
    rtfn!("list_iter_next", ["l"], "l"),
    rtfn!("list_iter_type", ["l"], "w"),
    rtfn!("list_iter_value_int", ["l"], "w"),
    rtfn!("list_iter_value_float", ["l"], "d"),
    rtfn!("list_iter_value_ptr", ["l"], "l"),
    // Worker / concurrency
    rtfn!("worker_spawn", ["l", "l"], "l"),
    rtfn!("worker_spawn_messaging", ["l", "l"], "l"),
    rtfn!("worker_await", ["l"], "d"),
    rtfn!("worker_ready", ["l"], "w"),
    rtfn!("worker_args_alloc", ["w"], "l"),
    rtfn!("worker_args_set_int", ["l", "w", "w"], ""),
    rtfn!("worker_args_set_double", ["l", "w", "d"], ""),
    rtfn!("worker_args_set_ptr", ["l", "w", "l"], ""),
    rtfn!("marshall_array", ["l"], "l"),
    rtfn!("marshall_udt", ["l", "l", "w"], "l"),
    rtfn!("marshall_udt_deep", ["l", "l", "w", "l"], "l"),
    rtfn!("unmarshall_udt", ["l", "l", "w"], "l"),
    rtfn!("unmarshall_udt_deep", ["l", "l", "w", "l"], "l"),
    // Messaging
    rtfn!("msg_queue_create", [], "l"),
    rtfn!("msg_queue_destroy", ["l"], ""),
    rtfn!("msg_queue_push", ["l", "l"], ""),
    rtfn!("msg_queue_pop", ["l"], "l"),
    rtfn!("msg_queue_close", ["l"], ""),
    rtfn!("msg_cancel", ["l"], ""),
    rtfn!("msg_queue_has_message", ["l"], "w"),
    rtfn!("msg_send_double", ["l", "d"], ""),
    rtfn!("msg_send_int", ["l", "w"], ""),
    rtfn!("msg_send_string", ["l", "l"], ""),
    rtfn!("msg_send_udt", ["l", "l", "w"], ""),
    rtfn!("msg_send_class", ["l", "l", "w"], ""),
    rtfn!("msg_send_marshalled", ["l", "l"], ""),
    rtfn!("msg_receive", ["l"], "l"),
    rtfn!("msg_blob_tag", ["l"], "w"),
    rtfn!("msg_blob_type_id", ["l"], "w"),
    rtfn!("msg_blob_payload_ptr", ["l"], "l"),
    rtfn!("msg_blob_forward", ["l", "l"], ""),
    rtfn!("msg_blob_free", ["l"], ""),
    rtfn!("msg_bounce", ["l", "l"], ""),
    // Terminal I/O
    rtfn!("term_init", [], ""),
    rtfn!("term_cleanup", [], ""),
    rtfn!("term_cursor_show", [], ""),
    rtfn!("term_cursor_hide", [], ""),
    rtfn!("term_color", ["w", "w"], ""),
    rtfn!("term_style", ["w"], ""),
    rtfn!("term_screen_alt", [], ""),
    rtfn!("term_screen_main", [], ""),
    rtfn!("term_wrch", ["w"], ""),
    rtfn!("term_wrstr", ["l"], ""),
    rtfn!("term_cls", [], ""),
    rtfn!("term_gcls", [], ""),
    rtfn!("term_flush", [], ""),
    rtfn!("term_begin_draw", [], ""),
    rtfn!("term_end_draw", [], ""),
    rtfn!("term_width", [], "w"),
    rtfn!("term_height", [], "w"),
    rtfn!("term_locate", ["w", "w"], ""),
    rtfn!("kbd_set_raw", ["w"], ""),
    rtfn!("kbd_set_echo", ["w"], ""),
    rtfn!("kbd_flush", [], ""),
    rtfn!("kbd_hit", [], "w"),
    rtfn!("kbd_get", [], "w"),
    rtfn!("kbd_peek", [], "w"),
    rtfn!("kbd_code", [], "w"),
    rtfn!("kbd_special", [], "w"),
    rtfn!("kbd_mod", [], "w"),
    rtfn!("kbd_count", [], "w"),
    rtfn!("kbd_inkey", [], "l"),
    rtfn!("term_cursor_row", [], "w"),
    rtfn!("term_cursor_col", [], "w"),
    rtfn!("mouse_enable", [], ""),
    rtfn!("mouse_disable", [], ""),
    rtfn!("mouse_read", ["l"], "w"),
    // NEON-accelerated whole-UDT arithmetic: (dst, lhs, rhs), all pointers
    // to a 128-bit, four-field struct laid out per `simd_arrangement_code`.
    rtfn!("neon_add_i32x4", ["l", "l", "l"], ""),
    rtfn!("neon_sub_i32x4", ["l", "l", "l"], ""),
    rtfn!("neon_mul_i32x4", ["l", "l", "l"], ""),
    rtfn!("neon_add_f32x4", ["l", "l", "l"], ""),
    rtfn!("neon_sub_f32x4", ["l", "l", "l"], ""),
    rtfn!("neon_mul_f32x4", ["l", "l", "l"], ""),
    rtfn!("neon_div_f32x4", ["l", "l", "l"], ""),
];

pub struct RuntimeLibrary;

impl RuntimeLibrary {
    pub fn new() -> Self {
        RuntimeLibrary
    }

    pub fn lookup(&self, name: &str) -> Option<&'static RuntimeFn> {
        RUNTIME_FNS.iter().find(|f| f.name == name)
    }

    /// Emits every known runtime function as an informational `# extern`
    /// comment; QBE resolves them at link time so nothing more is needed.
    pub fn emit_declarations(&self, b: &mut IlBuilder) -> CodegenResult<()> {
        for f in RUNTIME_FNS {
            let args = f.args.join(", ");
            let ret = if f.ret.is_empty() { "void" } else { f.ret };
            b.comment(&format!("extern {ret} {}({args})", f.name))?;
        }
        Ok(())
    }

    /// Typed call helper: emits a call to `name`, panicking (a codegen
    /// bug, not a source-language error) if the function isn't in the
    /// known runtime set, since that would mean an emitter layer above
    /// this one referenced a nonexistent runtime entry point.
    pub fn call(
        &self,
        b: &mut IlBuilder,
        dst: Option<&str>,
        name: &str,
        args: &[String],
    ) -> CodegenResult<Option<String>> {
        let rtfn = self
            .lookup(name)
            .unwrap_or_else(|| panic!("unknown runtime function `{name}`"));
        let callee = format!("${name}");
        let typed_args: Vec<(String, String)> = rtfn
            .args
            .iter()
            .zip(args.iter())
            .map(|(ty, v)| (ty.to_string(), v.clone()))
            .collect();
        if rtfn.ret.is_empty() {
            b.call(None, &callee, &typed_args)?;
            Ok(None)
        } else {
            let dst = dst.map(|d| d.to_string()).unwrap_or_else(|| b.new_temp());
            b.call(Some((&dst, rtfn.ret)), &callee, &typed_args)?;
            Ok(Some(dst))
        }
    }
}

impl Default for RuntimeLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_runtime_fn_name_is_unique() {
        let mut names: Vec<&str> = RUNTIME_FNS.iter().map(|f| f.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn call_helper_emits_typed_args_and_returns_dst() {
        let rt = RuntimeLibrary::new();
        let mut b = IlBuilder::new();
        b.label("entry").unwrap();
        let dst = rt
            .call(&mut b, None, "string_concat", &["%a".into(), "%b".into()])
            .unwrap();
        assert!(dst.is_some());
        assert!(b.text().contains("=l call $string_concat(l %a, l %b)"));
    }

    #[test]
    fn void_runtime_call_has_no_destination() {
        let rt = RuntimeLibrary::new();
        let mut b = IlBuilder::new();
        b.label("entry").unwrap();
        let dst = rt.call(&mut b, None, "basic_print_newline", &[]).unwrap();
        assert!(dst.is_none());
        assert!(b.text().contains("call $basic_print_newline()"));
    }
}
