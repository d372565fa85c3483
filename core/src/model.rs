// model.rs - Recovered Objective-C metadata
//
// Plain records filled in by the structure analyzers. Once analysis of a
// binary finishes the `AnalysisInfo` is frozen behind an `Arc` and shared by
// every function rewrite for that binary.

use std::collections::HashMap;
use std::fmt;

use crate::abi;
use crate::encoding::{self, TypeToken};

/// A constant string literal (`__cfstring` entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLiteralInfo {
    pub address: u64,
    pub data_address: u64,
    pub size: u64,
}

/// A selector reference slot (`__objc_selrefs` entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorRefInfo {
    pub address: u64,
    pub name: String,
    /// Slot contents as stored on disk
    pub raw_selector: u64,
    pub name_address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub address: u64,
    pub selector: String,
    pub type_encoding: String,
    pub name_address: u64,
    pub type_address: u64,
    pub implementation_address: u64,
}

impl MethodInfo {
    /// Selector split at its colons: `initWithFrame:style:` gives
    /// `["initWithFrame", "style"]`.
    pub fn selector_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.selector.split(':').map(str::to_string).collect();
        if tokens.len() > 1 && tokens.last().is_some_and(|t| t.is_empty()) {
            tokens.pop();
        }
        tokens
    }

    /// Return type, receiver, selector, then the explicit parameters.
    pub fn decoded_type_tokens(&self) -> Vec<TypeToken> {
        encoding::decode(&self.type_encoding)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodListInfo {
    pub address: u64,
    pub flags: u32,
    pub methods: Vec<MethodInfo>,
}

impl MethodListInfo {
    pub fn has_relative_offsets(&self) -> bool {
        self.flags & abi::METHOD_LIST_RELATIVE != 0
    }

    pub fn has_direct_selectors(&self) -> bool {
        self.flags & abi::METHOD_LIST_DIRECT_SELECTORS != 0
    }

    pub fn entry_size(&self, pointer_width: u8) -> u64 {
        abi::method_entry_size(self.flags, abi::Layout::new(pointer_width))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarInfo {
    pub address: u64,
    pub offset_address: u64,
    pub offset: u32,
    pub name: String,
    pub name_address: u64,
    pub type_encoding: String,
    pub type_address: u64,
    pub size: u32,
}

impl IvarInfo {
    /// First decoded type; an opaque pointer when nothing decodes.
    pub fn decoded_type_token(&self) -> TypeToken {
        encoding::decode(&self.type_encoding)
            .into_iter()
            .next()
            .unwrap_or(TypeToken::Composite)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IvarListInfo {
    pub address: u64,
    pub count: u32,
    pub ivars: Vec<IvarInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassInfo {
    pub address: u64,
    /// Class list slot that points at this class
    pub list_pointer: u64,
    /// Address of class_ro_t, tag bits cleared
    pub data_address: u64,
    pub name: String,
    pub name_address: u64,
    pub method_list: MethodListInfo,
    pub method_list_address: u64,
    pub ivar_list: IvarListInfo,
    pub ivar_list_address: u64,
    pub is_meta_class: bool,
    pub meta_class: Option<Box<ClassInfo>>,
}

impl ClassInfo {
    /// Methods of the class followed by those of its meta-class.
    pub fn all_methods(&self) -> impl Iterator<Item = (&ClassInfo, &MethodInfo)> {
        let own = self.method_list.methods.iter().map(move |m| (self, m));
        let meta = self.meta_class.iter().flat_map(|meta| {
            let meta: &ClassInfo = meta;
            meta.method_list.methods.iter().map(move |m| (meta, m))
        });
        own.chain(meta)
    }
}

/// A class or superclass reference slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRefInfo {
    pub address: u64,
    pub referenced_address: u64,
}

pub type SuperclassRefInfo = ClassRefInfo;

/// Everything recovered from one binary.
#[derive(Debug, Clone, Default)]
pub struct AnalysisInfo {
    pub string_literals: Vec<StringLiteralInfo>,
    pub selector_refs: Vec<SelectorRefInfo>,
    pub classes: Vec<ClassInfo>,
    pub class_refs: Vec<ClassRefInfo>,
    pub super_refs: Vec<SuperclassRefInfo>,
    /// Selector key (method name address) to implementation address
    pub method_impls: HashMap<u64, u64>,

    selector_refs_by_key: HashMap<u64, usize>,
    string_literals_by_address: HashMap<u64, usize>,
}

impl AnalysisInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.string_literals.is_empty()
            && self.selector_refs.is_empty()
            && self.classes.is_empty()
            && self.class_refs.is_empty()
            && self.super_refs.is_empty()
    }

    pub fn add_string_literal(&mut self, literal: StringLiteralInfo) {
        self.string_literals_by_address
            .insert(literal.address, self.string_literals.len());
        self.string_literals.push(literal);
    }

    /// Record a selector reference under its slot address and its raw slot
    /// value. The decoded name address is indexed too, since dataflow sees
    /// loads from the slot after fixups are applied.
    pub fn add_selector_ref(&mut self, selector_ref: SelectorRefInfo) {
        let idx = self.selector_refs.len();
        self.selector_refs_by_key.insert(selector_ref.address, idx);
        self.selector_refs_by_key.insert(selector_ref.raw_selector, idx);
        self.selector_refs_by_key
            .entry(selector_ref.name_address)
            .or_insert(idx);
        self.selector_refs.push(selector_ref);
    }

    /// Record a class and the implementations of every method it (and its
    /// meta-class) defines.
    pub fn add_class(&mut self, class: ClassInfo) {
        for (_, method) in class.all_methods() {
            self.method_impls
                .insert(method.name_address, method.implementation_address);
        }
        self.classes.push(class);
    }

    pub fn selector_ref(&self, key: u64) -> Option<&SelectorRefInfo> {
        self.selector_refs_by_key
            .get(&key)
            .map(|&idx| &self.selector_refs[idx])
    }

    pub fn string_literal_at(&self, address: u64) -> Option<&StringLiteralInfo> {
        self.string_literals_by_address
            .get(&address)
            .map(|&idx| &self.string_literals[idx])
    }

    pub fn class_name_at(&self, address: u64) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.address == address)
            .map(|c| c.name.as_str())
    }

    /// Implementation of the method named by a selector value.
    ///
    /// The value may be a selector reference slot address or the raw slot
    /// contents. Implementations are found by raw value first, then by the
    /// decoded name address, then by the slot address (relative method lists
    /// key on the slot).
    pub fn implementation_for_selector(&self, selector: u64) -> Option<u64> {
        let selector_ref = self.selector_ref(selector)?;
        [
            selector_ref.raw_selector,
            selector_ref.name_address,
            selector_ref.address,
        ]
        .iter()
        .find_map(|key| self.method_impls.get(key).copied())
    }

    pub fn method_count(&self) -> usize {
        self.classes.iter().map(|c| c.all_methods().count()).sum()
    }

    /// Human-readable listing of everything recovered.
    pub fn dump(&self) -> String {
        self.to_string()
    }
}

fn write_methods(f: &mut fmt::Formatter<'_>, class: &ClassInfo) -> fmt::Result {
    let marker = if class.is_meta_class { '+' } else { '-' };
    for m in &class.method_list.methods {
        writeln!(
            f,
            "    {} {:#x} {} -> {:#x}  {}",
            marker, m.address, m.selector, m.implementation_address, m.type_encoding
        )?;
    }
    Ok(())
}

impl fmt::Display for AnalysisInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Classes ({}):", self.classes.len())?;
        for class in &self.classes {
            writeln!(
                f,
                "  {:#x} {} (ro {:#x}, methods {:#x}, ivars {:#x})",
                class.address,
                class.name,
                class.data_address,
                class.method_list_address,
                class.ivar_list_address
            )?;
            write_methods(f, class)?;
            if let Some(meta) = &class.meta_class {
                write_methods(f, meta)?;
            }
            for ivar in &class.ivar_list.ivars {
                writeln!(
                    f,
                    "    ivar {} @ {} ({}, {} bytes)",
                    ivar.name,
                    ivar.offset,
                    ivar.decoded_type_token(),
                    ivar.size
                )?;
            }
        }

        writeln!(f, "Selector references ({}):", self.selector_refs.len())?;
        for sr in &self.selector_refs {
            writeln!(f, "  {:#x} -> {:#x} {}", sr.address, sr.name_address, sr.name)?;
        }

        writeln!(f, "String literals ({}):", self.string_literals.len())?;
        for s in &self.string_literals {
            writeln!(f, "  {:#x} -> {:#x} ({} bytes)", s.address, s.data_address, s.size)?;
        }

        for (title, refs) in [
            ("Class references", &self.class_refs),
            ("Superclass references", &self.super_refs),
        ] {
            writeln!(f, "{} ({}):", title, refs.len())?;
            for r in refs {
                let target = self.class_name_at(r.referenced_address).unwrap_or("?");
                writeln!(f, "  {:#x} -> {:#x} {}", r.address, r.referenced_address, target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(selector: &str, name_address: u64, imp: u64) -> MethodInfo {
        MethodInfo {
            address: 0,
            selector: selector.into(),
            type_encoding: "v16@0:8".into(),
            name_address,
            type_address: 0,
            implementation_address: imp,
        }
    }

    #[test]
    fn test_selector_tokens() {
        assert_eq!(method("count", 0, 0).selector_tokens(), vec!["count"]);
        assert_eq!(
            method("initWithFrame:style:", 0, 0).selector_tokens(),
            vec!["initWithFrame", "style"]
        );
    }

    #[test]
    fn test_method_list_facets() {
        let list = |flags| MethodListInfo {
            flags,
            ..Default::default()
        };
        assert!(list(0x8000_000c).has_relative_offsets());
        assert!(!list(0x8000_000c).has_direct_selectors());
        assert!(list(0xc000_000c).has_direct_selectors());
        assert_eq!(list(0x8000_000c).entry_size(8), 12);
        assert_eq!(list(0x18).entry_size(8), 24);
        assert_eq!(list(0x0c).entry_size(4), 12);
    }

    #[test]
    fn test_add_class_records_meta_methods() {
        let mut info = AnalysisInfo::new();
        let meta = ClassInfo {
            is_meta_class: true,
            method_list: MethodListInfo {
                methods: vec![method("shared", 0x200, 0x3000)],
                ..Default::default()
            },
            ..Default::default()
        };
        info.add_class(ClassInfo {
            address: 0x8000,
            name: "Foo".into(),
            method_list: MethodListInfo {
                methods: vec![method("bar", 0x100, 0x2000)],
                ..Default::default()
            },
            meta_class: Some(Box::new(meta)),
            ..Default::default()
        });

        assert_eq!(info.method_impls.get(&0x100), Some(&0x2000));
        assert_eq!(info.method_impls.get(&0x200), Some(&0x3000));
        assert_eq!(info.method_count(), 2);
        assert_eq!(info.class_name_at(0x8000), Some("Foo"));
    }

    #[test]
    fn test_implementation_lookup_order() {
        let mut info = AnalysisInfo::new();
        info.add_selector_ref(SelectorRefInfo {
            address: 0x5000,
            name: "bar".into(),
            raw_selector: 0x8010_0000_0000_0100,
            name_address: 0x100,
        });
        info.add_class(ClassInfo {
            method_list: MethodListInfo {
                methods: vec![method("bar", 0x100, 0x2000)],
                ..Default::default()
            },
            ..Default::default()
        });

        // raw value misses, decoded name address hits
        assert_eq!(info.implementation_for_selector(0x5000), Some(0x2000));
        assert_eq!(info.implementation_for_selector(0x100), Some(0x2000));
        assert_eq!(
            info.implementation_for_selector(0x8010_0000_0000_0100),
            Some(0x2000)
        );
        assert_eq!(info.implementation_for_selector(0x6000), None);
    }

    #[test]
    fn test_dump_lists_sections() {
        let mut info = AnalysisInfo::new();
        info.add_string_literal(StringLiteralInfo {
            address: 0x10,
            data_address: 0x20,
            size: 5,
        });
        let text = info.dump();
        assert!(text.contains("String literals (1):"));
        assert!(text.contains("0x10 -> 0x20 (5 bytes)"));
        assert!(info.string_literal_at(0x10).is_some());
    }
}
