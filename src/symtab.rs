//! The semantic symbol table.
//!
//! Built by a prior semantic pass and handed to codegen read-mostly: the
//! block emitter does insert class-instance-local entries under a
//! function-scoped key so later `infer_class_name`/`infer_udt_name` calls
//! succeed, but never removes or mutates an existing entry. Keys are
//! uppercase; function-local keys are `FUNC.VAR`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Byte,
    UByte,
    Short,
    UShort,
    Integer,
    UInteger,
    Long,
    ULong,
    Single,
    Double,
    String,
    Unicode,
    Pointer,
    Object,
    ClassInstance,
    ArrayDescriptor,
    StringDescriptor,
    UserDefined,
    Void,
    LoopIndex,
    Marshalled,
}

impl BaseType {
    /// Maps an `AS <type>` source-level type name to a base type. UDT and
    /// class names that are not one of the built-ins fall back to
    /// `UserDefined`; the caller resolves the concrete UDT/class name
    /// separately via `SymbolTable::types`/`classes`.
    pub fn from_as_type_name(name: &str) -> BaseType {
        match name.to_ascii_uppercase().as_str() {
            "BYTE" => BaseType::Byte,
            "UBYTE" => BaseType::UByte,
            "SHORT" => BaseType::Short,
            "USHORT" => BaseType::UShort,
            "INTEGER" => BaseType::Integer,
            "UINTEGER" => BaseType::UInteger,
            "LONG" => BaseType::Long,
            "ULONG" => BaseType::ULong,
            "SINGLE" => BaseType::Single,
            "DOUBLE" => BaseType::Double,
            "STRING" => BaseType::String,
            "UNICODE" => BaseType::Unicode,
            "POINTER" => BaseType::Pointer,
            "OBJECT" => BaseType::Object,
            "LIST" | "HASHMAP" => BaseType::Pointer,
            "" => BaseType::Void,
            _ => BaseType::UserDefined,
        }
    }

    pub fn is_integer_like(self) -> bool {
        matches!(
            self,
            BaseType::Byte
                | BaseType::UByte
                | BaseType::Short
                | BaseType::UShort
                | BaseType::Integer
                | BaseType::UInteger
                | BaseType::LoopIndex
        )
    }

    pub fn is_long(self) -> bool {
        matches!(self, BaseType::Long | BaseType::ULong)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BaseType::Single | BaseType::Double)
    }

    pub fn is_pointerish(self) -> bool {
        matches!(
            self,
            BaseType::Pointer
                | BaseType::Object
                | BaseType::ClassInstance
                | BaseType::UserDefined
                | BaseType::ArrayDescriptor
        )
    }

    /// Narrower than [`is_pointerish`](Self::is_pointerish): true only for
    /// the base types SAMM actually tracks as a scope-owned heap object
    /// (`samm_enter_scope`/`samm_exit_scope`/`samm_retain` operate on
    /// these). `UserDefined` is pointer-shaped for load/store purposes but
    /// a UDT return is an inline struct copy, not a heap handle, so it's
    /// excluded here even though `is_pointerish` includes it.
    pub fn is_samm_tracked(self) -> bool {
        matches!(self, BaseType::Pointer | BaseType::Object | BaseType::ClassInstance | BaseType::ArrayDescriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Local,
    Param,
}

#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub base_type: BaseType,
    pub udt_or_class_name: Option<String>,
    pub element_type: Option<BaseType>,
    pub object_type_name: Option<String>,
    pub scope: Scope,
    pub is_global: bool,
}

#[derive(Debug, Clone)]
pub struct ParamDesc {
    pub name: String,
    pub base_type: BaseType,
    pub type_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub return_type: BaseType,
    pub return_type_name: Option<String>,
    pub params: Vec<ParamDesc>,
    pub is_function: bool,
    pub is_worker: bool,
    pub uses_messaging: bool,
}

#[derive(Debug, Clone)]
pub struct ArraySymbol {
    pub element_type: BaseType,
    pub element_type_name: Option<String>,
    pub dims: u8,
}

#[derive(Debug, Clone)]
pub struct UdtField {
    pub name: String,
    pub type_desc: BaseType,
    pub type_name: Option<String>,
    pub offset: u32,
}

/// Classification of a UDT's field layout for NEON-accelerated
/// whole-value arithmetic. Per the spec this is treated as part of the
/// type system's contract and not guessed at beyond what it already
/// enumerates: a UDT qualifies only if it is exactly four 32-bit lanes
/// (int or float) laid out contiguously from offset 0, i.e. a full
/// 128-bit vector register's worth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdArrangement {
    /// Four contiguous `w`-sized (4 byte) integer lanes: `int32x4`.
    I32x4,
    /// Four contiguous `s`-sized (4 byte) float lanes: `float32x4`.
    F32x4,
    /// Does not qualify for a NEON fast path.
    None,
}

#[derive(Debug, Clone)]
pub struct SimdInfo {
    pub arrangement: SimdArrangement,
}

#[derive(Debug, Clone)]
pub struct TypeSymbol {
    pub name: String,
    pub fields: Vec<UdtField>,
    pub simd: Option<SimdInfo>,
}

impl TypeSymbol {
    /// Mirrors the source's `simdArrangementCode`: a UDT qualifies for a
    /// NEON fast path only when it has exactly four fields, all of the
    /// same base type (`INTEGER` or `SINGLE`), laid out back to back
    /// starting at offset 0 with no padding.
    pub fn simd_arrangement_code(&self) -> SimdArrangement {
        if self.fields.len() != 4 {
            return SimdArrangement::None;
        }
        let first = self.fields[0].type_desc;
        if !matches!(first, BaseType::Integer | BaseType::Single) {
            return SimdArrangement::None;
        }
        for (i, f) in self.fields.iter().enumerate() {
            if f.type_desc != first || f.offset != (i as u32) * 4 {
                return SimdArrangement::None;
            }
        }
        match first {
            BaseType::Integer => SimdArrangement::I32x4,
            BaseType::Single => SimdArrangement::F32x4,
            _ => SimdArrangement::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub name: String,
    pub mangled_name: String,
    pub vtable_slot: u32,
    pub return_type: BaseType,
    pub return_type_name: Option<String>,
    pub params: Vec<ParamDesc>,
}

#[derive(Debug, Clone)]
pub struct ClassSymbol {
    pub name: String,
    pub class_id: u32,
    pub object_size: u32,
    pub parent: Option<String>,
    pub fields: Vec<UdtField>,
    pub methods: Vec<MethodDesc>,
    pub has_constructor: bool,
    pub constructor_mangled: Option<String>,
    pub has_destructor: bool,
    pub destructor_mangled: Option<String>,
}

impl ClassSymbol {
    /// All methods including inherited ones, parent-first, used to build
    /// the vtable layout. Overridden methods keep the child's slot.
    pub fn vtable_methods<'a>(&'a self, table: &'a SymbolTable) -> Vec<&'a MethodDesc> {
        let mut methods: Vec<&MethodDesc> = Vec::new();
        if let Some(parent_name) = &self.parent {
            if let Some(parent) = table.classes.get(parent_name) {
                methods = parent.vtable_methods(table);
            }
        }
        for m in &self.methods {
            if let Some(slot) = methods.iter().position(|pm| pm.name == m.name) {
                methods[slot] = m;
            } else {
                methods.push(m);
            }
        }
        methods
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Positive,
    Negative,
    Zero,
    Unknown,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    pub variables: HashMap<String, VariableSymbol>,
    pub functions: HashMap<String, FunctionSymbol>,
    pub arrays: HashMap<String, ArraySymbol>,
    pub types: HashMap<String, TypeSymbol>,
    pub classes: HashMap<String, ClassSymbol>,
    pub neon_enabled: bool,
    pub for_step_hints: HashMap<String, StepDirection>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strips BASIC type-suffix characters (`$ % # ! & ^ @`) from a name.
    pub fn strip_suffix(name: &str) -> &str {
        name.trim_end_matches(['$', '%', '#', '!', '&', '^', '@'])
    }

    /// Resolution order per the spec: uppercase-stripped-of-suffix, then
    /// uppercase-with-suffix, then function-scoped key.
    pub fn lookup_variable(&self, func: Option<&str>, name: &str) -> Option<&VariableSymbol> {
        let upper = name.to_ascii_uppercase();
        let stripped = Self::strip_suffix(&upper);
        if let Some(v) = self.variables.get(stripped) {
            return Some(v);
        }
        if let Some(v) = self.variables.get(&upper) {
            return Some(v);
        }
        if let Some(f) = func {
            let scoped = format!("{}.{}", f.to_ascii_uppercase(), stripped);
            if let Some(v) = self.variables.get(&scoped) {
                return Some(v);
            }
        }
        None
    }

    pub fn lookup_function(&self, name: &str) -> Option<&FunctionSymbol> {
        self.functions.get(&name.to_ascii_uppercase())
    }

    pub fn lookup_array(&self, name: &str) -> Option<&ArraySymbol> {
        let upper = name.to_ascii_uppercase();
        self.arrays.get(Self::strip_suffix(&upper)).or_else(|| self.arrays.get(&upper))
    }

    pub fn lookup_type(&self, name: &str) -> Option<&TypeSymbol> {
        self.types.get(&name.to_ascii_uppercase())
    }

    pub fn lookup_class(&self, name: &str) -> Option<&ClassSymbol> {
        self.classes.get(&name.to_ascii_uppercase())
    }

    /// Inserts a scoped class/UDT-instance local so later `infer_*`
    /// queries resolve it; used only by the block emitter when processing
    /// a DIM/LOCAL of a class or UDT type. Per the re-architecture note
    /// this is the one sanctioned mutation path into an otherwise
    /// read-mostly table.
    pub fn register_scoped_local(&mut self, func: &str, name: &str, sym: VariableSymbol) {
        let key = format!(
            "{}.{}",
            func.to_ascii_uppercase(),
            Self::strip_suffix(&name.to_ascii_uppercase())
        );
        self.variables.insert(key, sym);
    }

    pub fn step_hint(&self, var: &str) -> StepDirection {
        self.for_step_hints
            .get(&var.to_ascii_uppercase())
            .copied()
            .unwrap_or(StepDirection::Unknown)
    }
}
