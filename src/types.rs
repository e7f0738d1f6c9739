//! Type Manager: pure mapping from semantic base types to QBE IL type
//! letters, memory-operation suffixes, sizes, and alignments.

use crate::symtab::{BaseType, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlType {
    W,
    L,
    S,
    D,
}

impl IlType {
    pub fn letter(self) -> &'static str {
        match self {
            IlType::W => "w",
            IlType::L => "l",
            IlType::S => "s",
            IlType::D => "d",
        }
    }
}

/// A memory-op load suffix, distinguishing sign/zero-extending small
/// loads from full-width loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSuffix {
    SignedByte,
    UnsignedByte,
    SignedHalf,
    UnsignedHalf,
    Word,
    Long,
    Single,
    Double,
}

impl LoadSuffix {
    pub fn qbe_op(self) -> &'static str {
        match self {
            LoadSuffix::SignedByte => "loadsb",
            LoadSuffix::UnsignedByte => "loadub",
            LoadSuffix::SignedHalf => "loadsh",
            LoadSuffix::UnsignedHalf => "loaduh",
            LoadSuffix::Word => "loadw",
            LoadSuffix::Long => "loadl",
            LoadSuffix::Single => "loads",
            LoadSuffix::Double => "loadd",
        }
    }
}

/// A memory-op store suffix (plain width, no sign distinction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSuffix {
    B,
    H,
    W,
    L,
    S,
    D,
}

impl StoreSuffix {
    pub fn letter(self) -> &'static str {
        match self {
            StoreSuffix::B => "b",
            StoreSuffix::H => "h",
            StoreSuffix::W => "w",
            StoreSuffix::L => "l",
            StoreSuffix::S => "s",
            StoreSuffix::D => "d",
        }
    }
}

pub struct TypeManager;

impl TypeManager {
    pub fn new() -> Self {
        TypeManager
    }

    pub fn il_type(&self, base: BaseType) -> IlType {
        match base {
            BaseType::Single => IlType::S,
            BaseType::Double | BaseType::Marshalled => IlType::D,
            BaseType::Long | BaseType::ULong => IlType::L,
            b if b.is_pointerish() => IlType::L,
            BaseType::StringDescriptor => IlType::L,
            _ => IlType::W,
        }
    }

    /// Small integers are widened to `w` when passed as a call argument;
    /// everything else keeps its natural IL type.
    pub fn param_type(&self, base: BaseType) -> IlType {
        match self.il_type(base) {
            IlType::W => IlType::W,
            other => other,
        }
    }

    pub fn size_of(&self, base: BaseType) -> u32 {
        match base {
            BaseType::Byte | BaseType::UByte => 1,
            BaseType::Short | BaseType::UShort => 2,
            BaseType::Integer | BaseType::UInteger | BaseType::LoopIndex => 4,
            BaseType::Single => 4,
            BaseType::Long | BaseType::ULong | BaseType::Double | BaseType::Marshalled => 8,
            b if b.is_pointerish() => 8,
            BaseType::StringDescriptor => 8,
            BaseType::Void => 0,
            _ => 8,
        }
    }

    pub fn align_of(&self, base: BaseType) -> u32 {
        self.align_for_size(self.size_of(base))
    }

    pub fn align_for_size(&self, size: u32) -> u32 {
        if size <= 4 {
            4
        } else {
            8
        }
    }

    pub fn store_suffix(&self, base: BaseType) -> StoreSuffix {
        match base {
            BaseType::Byte | BaseType::UByte => StoreSuffix::B,
            BaseType::Short | BaseType::UShort => StoreSuffix::H,
            BaseType::Integer | BaseType::UInteger | BaseType::LoopIndex => StoreSuffix::W,
            BaseType::Single => StoreSuffix::S,
            BaseType::Long | BaseType::ULong | BaseType::Double | BaseType::Marshalled => {
                StoreSuffix::D
            }
            b if b.is_pointerish() => StoreSuffix::L,
            BaseType::StringDescriptor => StoreSuffix::L,
            _ => StoreSuffix::L,
        }
    }

    /// Picks the load suffix, baking in sign/zero extension choice for
    /// sub-word types (signed small types use sign extension, unsigned
    /// use zero extension).
    pub fn load_suffix(&self, base: BaseType) -> LoadSuffix {
        match base {
            BaseType::Byte => LoadSuffix::SignedByte,
            BaseType::UByte => LoadSuffix::UnsignedByte,
            BaseType::Short => LoadSuffix::SignedHalf,
            BaseType::UShort => LoadSuffix::UnsignedHalf,
            BaseType::Integer | BaseType::UInteger | BaseType::LoopIndex => LoadSuffix::Word,
            BaseType::Single => LoadSuffix::Single,
            BaseType::Long | BaseType::ULong | BaseType::Double | BaseType::Marshalled => {
                LoadSuffix::Double
            }
            b if b.is_pointerish() => LoadSuffix::Long,
            BaseType::StringDescriptor => LoadSuffix::Long,
            _ => LoadSuffix::Long,
        }
    }

    /// Recursively sizes a UDT by walking its fields; nested UDTs recurse,
    /// unknown/empty fields floor at 8 bytes, and the whole thing floors
    /// at 8 bytes too (matching the spec's UDT-size-floor invariant used
    /// by CREATE's allocation).
    pub fn size_of_udt(&self, table: &SymbolTable, name: &str) -> u32 {
        let Some(udt) = table.lookup_type(name) else {
            return 8;
        };
        if udt.fields.is_empty() {
            return 8;
        }
        let mut total = 0u32;
        for field in &udt.fields {
            let field_size = match field.type_desc {
                BaseType::UserDefined => field
                    .type_name
                    .as_deref()
                    .map(|n| self.size_of_udt(table, n))
                    .unwrap_or(8),
                other => self.size_of(other),
            };
            let end = field.offset + field_size;
            if end > total {
                total = end;
            }
        }
        total.max(8)
    }

    /// CREATE's stack allocation size: UDT size, floored at 16 bytes and
    /// aligned to 8.
    pub fn create_alloc_size(&self, table: &SymbolTable, name: &str) -> u32 {
        self.size_of_udt(table, name).max(16)
    }
}

impl Default for TypeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::{TypeSymbol, UdtField};

    #[test]
    fn small_signed_types_sign_extend_on_load() {
        let tm = TypeManager::new();
        assert_eq!(tm.load_suffix(BaseType::Byte), LoadSuffix::SignedByte);
        assert_eq!(tm.load_suffix(BaseType::UByte), LoadSuffix::UnsignedByte);
    }

    #[test]
    fn align_switches_at_four_bytes() {
        let tm = TypeManager::new();
        assert_eq!(tm.align_for_size(1), 4);
        assert_eq!(tm.align_for_size(4), 4);
        assert_eq!(tm.align_for_size(5), 8);
        assert_eq!(tm.align_for_size(8), 8);
    }

    #[test]
    fn udt_size_floors_at_eight_and_recurses() {
        let tm = TypeManager::new();
        let mut table = SymbolTable::new();
        table.types.insert(
            "POINT".into(),
            TypeSymbol {
                name: "POINT".into(),
                fields: vec![
                    UdtField { name: "X".into(), type_desc: BaseType::Integer, type_name: None, offset: 0 },
                    UdtField { name: "Y".into(), type_desc: BaseType::Integer, type_name: None, offset: 4 },
                ],
                simd: None,
            },
        );
        assert_eq!(tm.size_of_udt(&table, "POINT"), 8);
        assert_eq!(tm.size_of_udt(&table, "MISSING"), 8);
    }

    #[test]
    fn unknown_udt_falls_back_to_eight() {
        let tm = TypeManager::new();
        let table = SymbolTable::new();
        assert_eq!(tm.size_of_udt(&table, "NOPE"), 8);
    }
}
