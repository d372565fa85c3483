// annotate.rs - Pushing recovered metadata to a host
//
// Every record in an `AnalysisInfo` becomes typed data, named symbols and
// cross references on an `AnnotationSink`. Symbol names carry a short prefix
// per record kind (cf_, sr_, cl_, ...) so they stay distinct in a flat
// namespace.

use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::abi::sections;
use crate::encoding::{PrimitiveKind, ResolvedType, TypeToken};
use crate::image::{BinaryImage, SymbolKind};
use crate::model::{AnalysisInfo, ClassInfo, MethodInfo, MethodListInfo};

/// Type of a data item the sink is asked to define.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// A runtime structure, by its C name
    Structure(&'static str),
    /// Character array of this many bytes plus a terminator
    CString(u64),
    /// Pointer slot whose low bits may carry tags
    TaggedPointer,
    /// Constant ivar offset slot
    IvarOffset,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Structure(name) => f.write_str(name),
            DataType::CString(len) => write!(f, "char[{}]", len + 1),
            DataType::TaggedPointer => f.write_str("tptr_t"),
            DataType::IvarOffset => f.write_str("const uint64_t"),
        }
    }
}

/// Prototype of a method implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub return_type: ResolvedType,
    /// (name, type)
    pub params: Vec<(String, ResolvedType)>,
    pub variadic: bool,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.return_type)?;
        for (i, (name, ty)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", ty, name)?;
        }
        if self.variadic {
            f.write_str(", ...")?;
        }
        f.write_str(")")
    }
}

/// Instance layout of a class, built from its ivars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLayout {
    pub name: String,
    /// (offset, name, type)
    pub fields: Vec<(u32, String, ResolvedType)>,
}

/// Receiver of annotations.
pub trait AnnotationSink {
    fn define_typed_variable(&mut self, address: u64, ty: DataType);

    /// Name `address` as `prefix` followed by `name`.
    fn define_symbol(&mut self, address: u64, name: &str, prefix: &str, kind: SymbolKind);

    fn define_reference(&mut self, from: u64, to: u64);

    fn define_function_type(&mut self, address: u64, signature: &MethodSignature);

    fn define_class_type(&mut self, layout: &ClassLayout);
}

/// "Wow I AM a very@cool String" -> "WowIAMAVeryCoolStr"
///
/// Only the first 24 characters are looked at.
pub fn sanitize_text(text: &str) -> String {
    let mut result = String::new();
    let mut capitalize = true;
    for c in text.chars().take(24) {
        if c.is_ascii_alphanumeric() {
            if capitalize {
                result.push(c.to_ascii_uppercase());
                capitalize = false;
            } else {
                result.push(c);
            }
        } else {
            capitalize = true;
        }
    }
    result
}

pub fn sanitize_selector(selector: &str) -> String {
    selector.replace(':', "_")
}

fn named(name: &str, pointer_depth: u8, pointer_width: u8) -> ResolvedType {
    ResolvedType {
        name: name.to_string(),
        pointer_depth,
        size: pointer_width,
    }
}

/// Prototype of `method` as implemented by `class_name`.
///
/// `None` when the selector has more parts than the encoding has types.
pub fn method_signature(class_name: &str, method: &MethodInfo, pointer_width: u8) -> Option<MethodSignature> {
    let selector_tokens = method.selector_tokens();
    let type_tokens = method.decoded_type_tokens();
    if selector_tokens.len() > type_tokens.len() {
        return None;
    }

    let receiver = if class_name.is_empty() {
        TypeToken::primitive(PrimitiveKind::Id).resolve(pointer_width)
    } else {
        named(class_name, 1, pointer_width)
    };
    let mut params = vec![
        ("self".to_string(), receiver),
        ("sel".to_string(), TypeToken::primitive(PrimitiveKind::Selector).resolve(pointer_width)),
    ];
    for (i, token) in type_tokens.iter().enumerate().skip(3) {
        let name = selector_tokens
            .get(i - 3)
            .cloned()
            .unwrap_or_else(|| "arg".to_string());
        params.push((name, token.resolve(pointer_width)));
    }

    Some(MethodSignature {
        return_type: type_tokens[0].resolve(pointer_width),
        params,
        variadic: false,
    })
}

/// `id objc_msgSend(id self, SEL op, ...)`
pub fn message_send_signature(pointer_width: u8) -> MethodSignature {
    let id = TypeToken::primitive(PrimitiveKind::Id).resolve(pointer_width);
    MethodSignature {
        return_type: id.clone(),
        params: vec![
            ("self".to_string(), id),
            ("op".to_string(), TypeToken::primitive(PrimitiveKind::Selector).resolve(pointer_width)),
        ],
        variadic: true,
    }
}

fn class_layout(class: &ClassInfo, pointer_width: u8) -> ClassLayout {
    ClassLayout {
        name: class.name.clone(),
        fields: class
            .ivar_list
            .ivars
            .iter()
            .map(|ivar| (ivar.offset, ivar.name.clone(), ivar.decoded_type_token().resolve(pointer_width)))
            .collect(),
    }
}

fn literal_text(image: &dyn BinaryImage, address: u64, size: u64) -> String {
    // Only the head of the text ends up in a name
    let len = size.min(64) as usize;
    let mut buf = vec![0u8; len];
    match image.read_bytes(address, &mut buf) {
        Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            debug!("Unreadable string literal data at {:#x}: {}", address, e);
            String::new()
        }
    }
}

struct Applier<'a> {
    sink: &'a mut dyn AnnotationSink,
    pointer_width: u8,
}

impl Applier<'_> {
    fn methods(&mut self, owner: &ClassInfo, class_name: &str, list: &MethodListInfo) {
        let entry_type = if list.has_relative_offsets() {
            DataType::Structure("method_entry_t")
        } else {
            DataType::Structure("method_t")
        };
        let marker = if owner.is_meta_class { '+' } else { '-' };

        for method in &list.methods {
            self.sink.define_typed_variable(method.address, entry_type.clone());
            self.sink
                .define_symbol(method.address, &sanitize_selector(&method.selector), "mt_", SymbolKind::Data);
            self.sink
                .define_typed_variable(method.type_address, DataType::CString(method.type_encoding.len() as u64));

            self.sink.define_reference(list.address, method.address);
            self.sink.define_reference(method.address, method.name_address);
            self.sink.define_reference(method.address, method.type_address);
            self.sink.define_reference(method.address, method.implementation_address);

            match method_signature(class_name, method, self.pointer_width) {
                Some(signature) => self.sink.define_function_type(method.implementation_address, &signature),
                None => warn!(
                    "Cannot apply method type to {:#x}: selector has more parts than its type encoding",
                    method.implementation_address
                ),
            }
            let name = format!("{}[{} {}]", marker, owner.name, method.selector);
            self.sink
                .define_symbol(method.implementation_address, &name, "", SymbolKind::Function);
        }
    }

    fn class(&mut self, class: &ClassInfo) {
        let sink = &mut *self.sink;
        sink.define_typed_variable(class.list_pointer, DataType::TaggedPointer);
        sink.define_typed_variable(class.address, DataType::Structure("objc_class_t"));
        sink.define_typed_variable(class.data_address, DataType::Structure("objc_class_ro_t"));
        sink.define_typed_variable(class.name_address, DataType::CString(class.name.len() as u64));
        sink.define_symbol(class.list_pointer, &class.name, "cp_", SymbolKind::Data);
        sink.define_symbol(class.address, &class.name, "cl_", SymbolKind::Data);
        sink.define_symbol(class.data_address, &class.name, "ro_", SymbolKind::Data);
        sink.define_symbol(class.name_address, &class.name, "nm_", SymbolKind::Data);

        sink.define_reference(class.list_pointer, class.address);
        sink.define_reference(class.address, class.data_address);
        sink.define_reference(class.data_address, class.name_address);
        if class.method_list_address != 0 {
            sink.define_reference(class.data_address, class.method_list_address);
        }

        sink.define_class_type(&class_layout(class, self.pointer_width));

        self.methods(class, &class.name, &class.method_list);
        if let Some(meta) = &class.meta_class {
            self.methods(meta, &class.name, &meta.method_list);
        }

        let sink = &mut *self.sink;
        if class.ivar_list_address != 0 {
            sink.define_typed_variable(class.ivar_list_address, DataType::Structure("objc_ivar_list_t"));
            sink.define_symbol(class.ivar_list_address, &class.name, "vl_", SymbolKind::Data);
            for ivar in &class.ivar_list.ivars {
                sink.define_typed_variable(ivar.address, DataType::Structure("objc_ivar_t"));
                sink.define_symbol(ivar.address, &ivar.name, "iv_", SymbolKind::Data);
            }
        }
        if class.method_list_address != 0 {
            sink.define_typed_variable(class.method_list_address, DataType::Structure("objc_method_list_t"));
            sink.define_symbol(class.method_list_address, &class.name, "ml_", SymbolKind::Data);
        }
    }
}

/// Push everything in `info` to `sink`.
///
/// `message_send_functions` are the dispatch entry points found in the image;
/// each gets the `objc_msgSend` prototype.
pub fn apply_info(
    image: &dyn BinaryImage,
    info: &AnalysisInfo,
    message_send_functions: &[u64],
    sink: &mut dyn AnnotationSink,
) {
    let start = Instant::now();
    let pointer_width = image.pointer_width();

    for literal in &info.string_literals {
        let name = sanitize_text(&literal_text(image, literal.data_address, literal.size));
        sink.define_typed_variable(literal.address, DataType::Structure("CFString"));
        sink.define_typed_variable(literal.data_address, DataType::CString(literal.size));
        sink.define_symbol(literal.address, &name, "cf_", SymbolKind::Data);
        sink.define_symbol(literal.data_address, &name, "as_", SymbolKind::Data);
        sink.define_reference(literal.address, literal.data_address);
    }

    for selector_ref in &info.selector_refs {
        let name = sanitize_selector(&selector_ref.name);
        sink.define_typed_variable(selector_ref.address, DataType::TaggedPointer);
        sink.define_typed_variable(selector_ref.name_address, DataType::CString(selector_ref.name.len() as u64));
        sink.define_symbol(selector_ref.address, &name, "sr_", SymbolKind::Data);
        sink.define_symbol(selector_ref.name_address, &name, "sl_", SymbolKind::Data);
        sink.define_reference(selector_ref.address, selector_ref.name_address);
    }

    let mut applier = Applier { sink, pointer_width };
    for class in &info.classes {
        applier.class(class);
    }
    let sink = applier.sink;

    for (refs, prefix) in [(&info.class_refs, "cr_"), (&info.super_refs, "su_")] {
        for class_ref in refs {
            sink.define_typed_variable(class_ref.address, DataType::TaggedPointer);
            if class_ref.referenced_address == 0 {
                continue;
            }
            // Classes defined in other images have no name here
            if let Some(name) = info.class_name_at(class_ref.referenced_address) {
                sink.define_symbol(class_ref.address, name, prefix, SymbolKind::Data);
            }
        }
    }

    if let Some(section) = image.section(sections::IVAR_OFFSETS) {
        for slot in section.slots(8) {
            sink.define_typed_variable(slot, DataType::IvarOffset);
        }
    }

    let signature = message_send_signature(pointer_width);
    for &address in message_send_functions {
        sink.define_function_type(address, &signature);
    }

    info!("Analysis results applied in {} ms", start.elapsed().as_millis());
    info!(
        "Found {} classes, {} methods, {} selector references",
        info.classes.len(),
        info.method_count(),
        info.selector_refs.len()
    );
    info!("Found {} CFString instances", info.string_literals.len());
    info!(
        "Found {} class references, {} superclass references",
        info.class_refs.len(),
        info.super_refs.len()
    );
}

/// One call made on a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Variable { address: u64, ty: DataType },
    Symbol { address: u64, name: String, kind: SymbolKind },
    Reference { from: u64, to: u64 },
    FunctionType { address: u64, signature: MethodSignature },
    ClassType(ClassLayout),
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::Variable { address, ty } => write!(f, "{:#x}  data    {}", address, ty),
            Annotation::Symbol { address, name, kind } => write!(f, "{:#x}  symbol  {} ({:?})", address, name, kind),
            Annotation::Reference { from, to } => write!(f, "{:#x}  xref -> {:#x}", from, to),
            Annotation::FunctionType { address, signature } => write!(f, "{:#x}  type    {}", address, signature),
            Annotation::ClassType(layout) => {
                write!(f, "struct class_{} {{", layout.name)?;
                for (offset, name, ty) in &layout.fields {
                    write!(f, " {} {} @{:#x};", ty, name, offset)?;
                }
                f.write_str(" }")
            }
        }
    }
}

/// Sink that keeps every annotation in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub annotations: Vec<Annotation>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last name given to `address`.
    pub fn symbol_at(&self, address: u64) -> Option<&str> {
        self.annotations.iter().rev().find_map(|a| match a {
            Annotation::Symbol { address: at, name, .. } if *at == address => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn variable_at(&self, address: u64) -> Option<&DataType> {
        self.annotations.iter().rev().find_map(|a| match a {
            Annotation::Variable { address: at, ty } if *at == address => Some(ty),
            _ => None,
        })
    }

    pub fn function_type_at(&self, address: u64) -> Option<&MethodSignature> {
        self.annotations.iter().rev().find_map(|a| match a {
            Annotation::FunctionType { address: at, signature } if *at == address => Some(signature),
            _ => None,
        })
    }

    pub fn has_reference(&self, from: u64, to: u64) -> bool {
        self.annotations
            .iter()
            .any(|a| *a == Annotation::Reference { from, to })
    }
}

impl AnnotationSink for RecordingSink {
    fn define_typed_variable(&mut self, address: u64, ty: DataType) {
        self.annotations.push(Annotation::Variable { address, ty });
    }

    fn define_symbol(&mut self, address: u64, name: &str, prefix: &str, kind: SymbolKind) {
        self.annotations.push(Annotation::Symbol {
            address,
            name: format!("{}{}", prefix, name),
            kind,
        });
    }

    fn define_reference(&mut self, from: u64, to: u64) {
        self.annotations.push(Annotation::Reference { from, to });
    }

    fn define_function_type(&mut self, address: u64, signature: &MethodSignature) {
        self.annotations.push(Annotation::FunctionType {
            address,
            signature: signature.clone(),
        });
    }

    fn define_class_type(&mut self, layout: &ClassLayout) {
        self.annotations.push(Annotation::ClassType(layout.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Architecture, MemoryImage};
    use crate::model::{ClassRefInfo, IvarInfo, IvarListInfo, SelectorRefInfo, StringLiteralInfo};

    fn method(selector: &str, types: &str) -> MethodInfo {
        MethodInfo {
            address: 0x5000,
            selector: selector.into(),
            type_encoding: types.into(),
            name_address: 0x7000,
            type_address: 0x7100,
            implementation_address: 0x4000,
        }
    }

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("Wow I AM a very@cool String@U*#(FW)E()*FUE"), "WowIAMAVeryCoolStr");
        assert_eq!(sanitize_text("hello, world"), "HelloWorld");
        assert_eq!(sanitize_text("%@"), "");
    }

    #[test]
    fn test_sanitize_selector() {
        assert_eq!(sanitize_selector("initWithFrame:style:"), "initWithFrame_style_");
    }

    #[test]
    fn test_method_signature() {
        let sig = method_signature("Foo", &method("setValue:forKey:", "v32@0:8@16@24"), 8).unwrap();
        assert_eq!(sig.to_string(), "void (Foo* self, SEL sel, id setValue, id forKey)");

        let sig = method_signature("", &method("count", "Q16@0:8"), 8).unwrap();
        assert_eq!(sig.return_type.size, 8);
        assert_eq!(sig.params[0].1.name, "id");
    }

    #[test]
    fn test_method_signature_extra_types_named_arg() {
        let sig = method_signature("Foo", &method("run", "v28@0:8i16i20i24"), 8).unwrap();
        let names: Vec<&str> = sig.params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["self", "sel", "run", "arg", "arg"]);
    }

    #[test]
    fn test_method_signature_mismatch() {
        assert!(method_signature("Foo", &method("a:b:c:", "v@"), 8).is_none());
        assert!(method_signature("Foo", &method("a", "{CGRect=dd"), 8).is_none());
    }

    #[test]
    fn test_apply_info() {
        let mut image = MemoryImage::new(Architecture::Aarch64);
        image.map_zeroed(0x9000, 0x100);
        image.write_c_string(0x9000, "hello, world").unwrap();
        image.add_section(sections::IVAR_OFFSETS, 0x9080, 0x9090);

        let mut info = AnalysisInfo::new();
        info.add_string_literal(StringLiteralInfo {
            address: 0x8000,
            data_address: 0x9000,
            size: 12,
        });
        info.add_selector_ref(SelectorRefInfo {
            address: 0x6000,
            name: "setName:".into(),
            raw_selector: 0x7000,
            name_address: 0x7000,
        });
        let meta = ClassInfo {
            address: 0x3100,
            name: "Foo".into(),
            is_meta_class: true,
            method_list: MethodListInfo {
                address: 0x3300,
                methods: vec![MethodInfo {
                    address: 0x3308,
                    implementation_address: 0x4100,
                    ..method("shared", "@16@0:8")
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        info.add_class(ClassInfo {
            address: 0x3000,
            list_pointer: 0x2000,
            data_address: 0x3200,
            name: "Foo".into(),
            name_address: 0x3400,
            method_list_address: 0x3500,
            method_list: MethodListInfo {
                address: 0x3500,
                methods: vec![method("setName:", "v24@0:8@16")],
                ..Default::default()
            },
            ivar_list_address: 0x3600,
            ivar_list: IvarListInfo {
                address: 0x3600,
                count: 1,
                ivars: vec![IvarInfo {
                    address: 0x3608,
                    offset_address: 0x9080,
                    offset: 8,
                    name: "_name".into(),
                    name_address: 0x3700,
                    type_encoding: "@\"NSString\"".into(),
                    type_address: 0x3710,
                    size: 8,
                }],
            },
            meta_class: Some(Box::new(meta)),
            ..Default::default()
        });
        info.class_refs.push(ClassRefInfo {
            address: 0x2100,
            referenced_address: 0x3000,
        });
        info.class_refs.push(ClassRefInfo {
            address: 0x2108,
            referenced_address: 0xdead_0000,
        });

        let mut sink = RecordingSink::new();
        apply_info(&image, &info, &[0x1000], &mut sink);

        assert_eq!(sink.symbol_at(0x8000), Some("cf_HelloWorld"));
        assert_eq!(sink.symbol_at(0x9000), Some("as_HelloWorld"));
        assert_eq!(sink.symbol_at(0x6000), Some("sr_setName_"));
        assert_eq!(sink.symbol_at(0x7000), Some("sl_setName_"));
        assert_eq!(sink.symbol_at(0x2000), Some("cp_Foo"));
        assert_eq!(sink.symbol_at(0x3000), Some("cl_Foo"));
        assert_eq!(sink.symbol_at(0x3200), Some("ro_Foo"));
        assert_eq!(sink.symbol_at(0x3400), Some("nm_Foo"));
        assert_eq!(sink.symbol_at(0x3500), Some("ml_Foo"));
        assert_eq!(sink.symbol_at(0x3600), Some("vl_Foo"));
        assert_eq!(sink.symbol_at(0x3608), Some("iv__name"));
        assert_eq!(sink.symbol_at(0x5000), Some("mt_setName_"));
        assert_eq!(sink.symbol_at(0x4000), Some("-[Foo setName:]"));
        assert_eq!(sink.symbol_at(0x4100), Some("+[Foo shared]"));
        assert_eq!(sink.symbol_at(0x2100), Some("cr_Foo"));
        assert_eq!(sink.symbol_at(0x2108), None);

        assert_eq!(sink.variable_at(0x2108), Some(&DataType::TaggedPointer));
        assert_eq!(sink.variable_at(0x9088), Some(&DataType::IvarOffset));
        assert!(sink.has_reference(0x8000, 0x9000));
        assert!(sink.has_reference(0x5000, 0x4000));
        assert!(sink.has_reference(0x3300, 0x3308));

        assert_eq!(
            sink.function_type_at(0x4000).map(|s| s.to_string()),
            Some("void (Foo* self, SEL sel, id setName)".to_string())
        );
        assert!(sink.function_type_at(0x1000).is_some_and(|s| s.variadic));
        assert!(sink.annotations.iter().any(|a| matches!(
            a,
            Annotation::ClassType(layout) if layout.fields == vec![(8, "_name".to_string(), named("NSString", 1, 8))]
        )));
    }
}
