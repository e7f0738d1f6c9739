//! Symbol Mapper: deterministic name mangling plus SHARED tracking.

use std::collections::HashSet;

use crate::symtab::BaseType;

const SUFFIX_CHARS: [char; 7] = ['$', '%', '#', '!', '&', '^', '@'];

fn strip_type_suffix(name: &str) -> &str {
    name.trim_end_matches(SUFFIX_CHARS.as_slice())
}

/// Derives the `_TYPETAG` mangling suffix from a base type.
fn type_tag(base: BaseType) -> Option<&'static str> {
    match base {
        BaseType::Integer | BaseType::UInteger => Some("_int"),
        BaseType::Single => Some("_sng"),
        BaseType::Double => Some("_dbl"),
        BaseType::String | BaseType::Unicode | BaseType::StringDescriptor => Some("_str"),
        BaseType::Byte | BaseType::UByte => Some("_byt"),
        BaseType::Short | BaseType::UShort => Some("_sht"),
        BaseType::Long | BaseType::ULong => Some("_lng"),
        _ => None,
    }
}

/// Maps a BASIC type-suffix character (as the last character of a source
/// identifier) to the same `_TYPETAG` mangling suffix used for array
/// descriptors.
fn type_tag_from_suffix_char(c: char) -> Option<&'static str> {
    match c {
        '%' => Some("_int"),
        '!' => Some("_sng"),
        '#' => Some("_dbl"),
        '$' => Some("_str"),
        _ => None,
    }
}

pub struct SymbolMapper {
    shared: HashSet<String>,
}

impl SymbolMapper {
    pub fn new() -> Self {
        SymbolMapper {
            shared: HashSet::new(),
        }
    }

    pub fn global_var(&self, name: &str, base: BaseType) -> String {
        let base_name = strip_type_suffix(name).to_ascii_uppercase();
        match type_tag(base) {
            Some(tag) => format!("var_{base_name}{tag}"),
            None => format!("var_{base_name}"),
        }
    }

    pub fn local_var(&self, name: &str, base: BaseType) -> String {
        let base_name = strip_type_suffix(name).to_ascii_uppercase();
        match type_tag(base) {
            Some(tag) => format!("%{base_name}{tag}"),
            None => format!("%{base_name}"),
        }
    }

    pub fn function(&self, name: &str) -> String {
        format!("func_{}", name.to_ascii_uppercase())
    }

    pub fn sub(&self, name: &str) -> String {
        format!("sub_{}", name.to_ascii_uppercase())
    }

    /// `arr_UPPERBASE[_TYPETAG]_desc`, with the type tag derived from the
    /// last character of the *original* (unstripped) name.
    pub fn array_descriptor(&self, name: &str) -> String {
        let base_name = strip_type_suffix(name).to_ascii_uppercase();
        let tag = name.chars().last().and_then(type_tag_from_suffix_char);
        match tag {
            Some(t) => format!("arr_{base_name}{t}_desc"),
            None => format!("arr_{base_name}_desc"),
        }
    }

    pub fn class_method(&self, class_name: &str, method_name: &str) -> String {
        format!(
            "{}__{}",
            class_name.to_ascii_uppercase(),
            method_name.to_ascii_uppercase()
        )
    }

    pub fn class_constructor(&self, class_name: &str) -> String {
        format!("{}__CONSTRUCTOR", class_name.to_ascii_uppercase())
    }

    pub fn class_destructor(&self, class_name: &str) -> String {
        format!("{}__DESTRUCTOR", class_name.to_ascii_uppercase())
    }

    pub fn vtable(&self, class_name: &str) -> String {
        format!("vtable_{}", class_name.to_ascii_uppercase())
    }

    pub fn class_name_label(&self, class_name: &str) -> String {
        format!("classname_{}", class_name.to_ascii_uppercase())
    }

    pub fn register_shared(&mut self, name: &str) {
        self.shared.insert(strip_type_suffix(name).to_ascii_uppercase());
    }

    pub fn is_shared(&self, name: &str) -> bool {
        self.shared.contains(&strip_type_suffix(name).to_ascii_uppercase())
    }

    pub fn clear_shared(&mut self) {
        self.shared.clear();
    }
}

impl Default for SymbolMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_var_strips_suffix_and_adds_type_tag() {
        let m = SymbolMapper::new();
        assert_eq!(m.global_var("count%", BaseType::Integer), "var_COUNT_int");
        assert_eq!(m.global_var("name$", BaseType::String), "var_NAME_str");
    }

    #[test]
    fn local_var_is_sigiled() {
        let m = SymbolMapper::new();
        assert_eq!(m.local_var("x", BaseType::Double), "%X_dbl");
    }

    #[test]
    fn function_and_sub_mangling_differ() {
        let m = SymbolMapper::new();
        assert_eq!(m.function("Area"), "func_AREA");
        assert_eq!(m.sub("Draw"), "sub_DRAW");
    }

    #[test]
    fn array_descriptor_uses_trailing_sigil() {
        let m = SymbolMapper::new();
        assert_eq!(m.array_descriptor("scores%"), "arr_SCORES_int_desc");
        assert_eq!(m.array_descriptor("data"), "arr_DATA_desc");
    }

    #[test]
    fn class_mangling_matches_spec_forms() {
        let m = SymbolMapper::new();
        assert_eq!(m.class_method("Shape", "Area"), "SHAPE__AREA");
        assert_eq!(m.class_constructor("Shape"), "SHAPE__CONSTRUCTOR");
        assert_eq!(m.class_destructor("Shape"), "SHAPE__DESTRUCTOR");
        assert_eq!(m.vtable("Shape"), "vtable_SHAPE");
    }

    #[test]
    fn shared_tracking_round_trips() {
        let mut m = SymbolMapper::new();
        assert!(!m.is_shared("counter"));
        m.register_shared("Counter%");
        assert!(m.is_shared("COUNTER"));
        m.clear_shared();
        assert!(!m.is_shared("COUNTER"));
    }

    #[test]
    fn mangling_is_a_pure_function() {
        let m = SymbolMapper::new();
        assert_eq!(
            m.global_var("x", BaseType::Integer),
            m.global_var("x", BaseType::Integer)
        );
    }
}
