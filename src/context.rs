//! Per-function emission state.
//!
//! Bundled into one `EmitContext` rather than carried as ad hoc fields on
//! the emitters, per the "context propagation without globals"
//! re-architecture note: every piece of state that the source kept as a
//! mutable field on a long-lived emitter object lives here instead, save
//! and restored explicitly around nested scopes (e.g. a class method
//! body, a forward-arm body).

use std::collections::HashMap;

use crate::symtab::BaseType;
use crate::types::{IlType, LoadSuffix, StoreSuffix};

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub addr: String,
    pub il_type: IlType,
    pub base_type: BaseType,
    pub store_suffix: StoreSuffix,
    pub load_suffix: LoadSuffix,
}

#[derive(Debug, Clone)]
pub struct LocalSlotInfo {
    pub slot: SlotInfo,
    pub as_type_name: Option<String>,
}

/// Per-function emission state: parameter/local stack slots, return
/// plumbing. Created before emitting a function, torn down at function
/// end.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub func_name: String,
    pub upper_name: String,
    pub is_function: bool,
    pub return_type: Option<IlType>,
    pub return_base_type: BaseType,
    pub return_addr: Option<String>,
    pub param_addrs: HashMap<String, SlotInfo>,
    pub local_addrs: HashMap<String, LocalSlotInfo>,
    /// Zero-argument, void runtime calls to run at every exit point of this
    /// function — `RETURN`, fallthrough off the end, or an `Exit` edge —
    /// before the actual `ret`. Populated by the orchestrator from the
    /// scope analyzer's verdict (`samm_exit_scope`) and, for the program
    /// entry point, the runtime teardown sequence.
    pub epilogue_calls: Vec<String>,
}

impl FunctionContext {
    pub fn new(func_name: &str, is_function: bool, return_base_type: BaseType, return_type: Option<IlType>) -> Self {
        FunctionContext {
            func_name: func_name.to_string(),
            upper_name: func_name.to_ascii_uppercase(),
            is_function,
            return_type,
            return_base_type,
            return_addr: None,
            param_addrs: HashMap::new(),
            local_addrs: HashMap::new(),
            epilogue_calls: Vec::new(),
        }
    }

    pub fn register_param(&mut self, name: &str, slot: SlotInfo) {
        self.param_addrs.insert(name.to_ascii_uppercase(), slot);
    }

    pub fn register_local(&mut self, name: &str, slot: SlotInfo, as_type_name: Option<String>) {
        self.local_addrs
            .insert(name.to_ascii_uppercase(), LocalSlotInfo { slot, as_type_name });
    }

    /// Looks up a name as a param first, then a local — the order the
    /// expression emitter's variable-type inference uses before falling
    /// back to the global symbol table.
    pub fn lookup(&self, name: &str) -> Option<&SlotInfo> {
        let upper = name.to_ascii_uppercase();
        self.param_addrs
            .get(&upper)
            .or_else(|| self.local_addrs.get(&upper).map(|l| &l.slot))
    }

    pub fn as_type_name(&self, name: &str) -> Option<&str> {
        self.local_addrs
            .get(&name.to_ascii_uppercase())
            .and_then(|l| l.as_type_name.as_deref())
    }

    /// True when `name` matches the function's own name (the legacy
    /// `FuncName = expr` return-assignment idiom).
    pub fn is_return_assignment_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.func_name)
    }
}

#[derive(Debug, Clone)]
pub struct ForLoopContext {
    pub loop_var: String,
    pub step_expr_is_const_zero: bool,
    pub limit_addr: String,
    pub step_addr: String,
}

#[derive(Debug, Clone)]
pub struct ForEachArrayContext {
    pub item_var: String,
    pub index_var: Option<String>,
    pub hidden_index_addr: String,
    pub descriptor_addr: String,
    pub element_load_suffix: LoadSuffix,
    pub element_base_type: BaseType,
}

#[derive(Debug, Clone)]
pub struct ForEachListContext {
    pub item_var: String,
    pub index_var: Option<String>,
    pub cursor_addr: String,
    pub hidden_index_addr: String,
    pub element_base_type: BaseType,
}

#[derive(Debug, Clone)]
pub struct ForEachHashmapContext {
    pub key_var: String,
    pub value_var: Option<String>,
    pub hidden_index_addr: String,
    pub size_addr: String,
    pub keys_addr: String,
    pub map_addr: String,
}

#[derive(Debug, Clone)]
pub enum ForEachContext {
    Array(ForEachArrayContext),
    List(ForEachListContext),
    Hashmap(ForEachHashmapContext),
}

#[derive(Debug, Clone)]
pub struct CaseContext {
    pub selector_temp: String,
    pub selector_type: BaseType,
}

#[derive(Debug, Clone)]
pub struct MatchArmInfo {
    pub tag: u32,
    pub type_id: Option<i32>,
    pub body_block: usize,
}

#[derive(Debug, Clone)]
pub struct MatchTypeContext {
    pub tag_temp: String,
    pub cursor_temp: String,
    pub arms: Vec<MatchArmInfo>,
    pub current_arm: usize,
}

#[derive(Debug, Clone)]
pub struct MatchReceiveContext {
    pub blob_temp: String,
    pub tag_temp: String,
    pub type_id_temp: String,
    pub arms: Vec<MatchArmInfo>,
    pub current_arm: usize,
    pub merge_block: Option<usize>,
    pub blob_slot_addr: Option<String>,
    pub forward_flags: Vec<bool>,
    pub handle_is_parent: bool,
    pub send_direction_queue_temp: String,
}

/// Merge-block cleanup info for a MATCH RECEIVE: the reference the final
/// `msg_blob_free` should load (a stack slot when any arm can forward,
/// otherwise the plain SSA temp), and whether that reference needs a load
/// first.
#[derive(Debug, Clone)]
pub struct MergeCleanup {
    pub blob_ref: String,
    pub needs_load: bool,
}

/// Non-null only while emitting statements inside a forward-arm body.
#[derive(Debug, Clone)]
pub struct ActiveForwardContext {
    pub bind_var_upper: String,
    pub blob_temp: String,
    pub blob_slot_addr: String,
    pub send_direction_queue_temp: String,
    pub handle_is_parent: bool,
}

#[derive(Debug, Clone)]
pub struct ClassEmitContext {
    pub class_name: String,
    pub method_ret_slot: Option<String>,
    pub method_ret_type: Option<IlType>,
    pub method_name: Option<String>,
}

/// Bundles every piece of "current emission position" state that the
/// block/expression emitters thread through a function body. Carried by
/// reference rather than as emitter fields, and saved/restored around
/// nested scopes (class methods, forward-arm bodies).
#[derive(Debug, Clone, Default)]
pub struct EmitContext {
    pub class_ctx: Option<ClassEmitContext>,
    pub active_forward: Option<ActiveForwardContext>,
}

impl EmitContext {
    pub fn new() -> Self {
        Self::default()
    }
}
