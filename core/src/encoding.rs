// encoding.rs - Objective-C type encoding decoder
//
// Turns strings such as "v24@0:8@16" into a flat list of tokens, one per
// encoded type. Frame offsets and qualifiers are ignored. Structures and
// unions are not interpreted; they become a single opaque token.

use std::fmt;

/// Scalar and object types with a single-character encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Void,
    Char,
    Short,
    Int,
    Long,
    UChar,
    UShort,
    UInt,
    ULong,
    Bool,
    Float,
    CharPointer,
    Byte,
    Id,
    Selector,
    Class,
    VoidPointer,
    /// `q`; width follows the target.
    NSInteger,
    /// `Q`; width follows the target.
    NSUInteger,
    /// `d`; double on 64-bit targets, float on 32-bit ones.
    CGFloat,
}

impl PrimitiveKind {
    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            b'v' => PrimitiveKind::Void,
            b'c' => PrimitiveKind::Char,
            b's' => PrimitiveKind::Short,
            b'i' => PrimitiveKind::Int,
            b'l' => PrimitiveKind::Long,
            b'q' => PrimitiveKind::NSInteger,
            b'C' => PrimitiveKind::UChar,
            b'S' => PrimitiveKind::UShort,
            b'I' => PrimitiveKind::UInt,
            b'L' => PrimitiveKind::ULong,
            b'Q' => PrimitiveKind::NSUInteger,
            b'B' | b'b' => PrimitiveKind::Bool,
            b'f' => PrimitiveKind::Float,
            b'd' => PrimitiveKind::CGFloat,
            b'*' => PrimitiveKind::CharPointer,
            b'A' => PrimitiveKind::Byte,
            b'@' => PrimitiveKind::Id,
            b':' => PrimitiveKind::Selector,
            b'#' => PrimitiveKind::Class,
            b'?' | b'T' => PrimitiveKind::VoidPointer,
            _ => return None,
        };
        Some(kind)
    }

    /// C spelling of the type
    pub fn c_name(&self) -> &'static str {
        match self {
            PrimitiveKind::Void => "void",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Short => "short",
            PrimitiveKind::Int => "int",
            PrimitiveKind::Long => "long",
            PrimitiveKind::UChar => "unsigned char",
            PrimitiveKind::UShort => "unsigned short",
            PrimitiveKind::UInt => "unsigned int",
            PrimitiveKind::ULong => "unsigned long",
            PrimitiveKind::Bool => "BOOL",
            PrimitiveKind::Float => "float",
            PrimitiveKind::CharPointer => "char*",
            PrimitiveKind::Byte => "uint8_t",
            PrimitiveKind::Id => "id",
            PrimitiveKind::Selector => "SEL",
            PrimitiveKind::Class => "Class",
            PrimitiveKind::VoidPointer => "void*",
            PrimitiveKind::NSInteger => "NSInteger",
            PrimitiveKind::NSUInteger => "NSUInteger",
            PrimitiveKind::CGFloat => "CGFloat",
        }
    }

    /// Size in bytes on a target with the given pointer width.
    pub fn size(&self, pointer_width: u8) -> u8 {
        match self {
            PrimitiveKind::Void => 0,
            PrimitiveKind::Char | PrimitiveKind::UChar | PrimitiveKind::Byte => 1,
            PrimitiveKind::Bool => 1,
            PrimitiveKind::Short | PrimitiveKind::UShort => 2,
            PrimitiveKind::Int | PrimitiveKind::UInt | PrimitiveKind::Float => 4,
            PrimitiveKind::Long | PrimitiveKind::ULong => 8,
            PrimitiveKind::CharPointer
            | PrimitiveKind::Id
            | PrimitiveKind::Selector
            | PrimitiveKind::Class
            | PrimitiveKind::VoidPointer
            | PrimitiveKind::NSInteger
            | PrimitiveKind::NSUInteger
            | PrimitiveKind::CGFloat => pointer_width,
        }
    }
}

/// One decoded type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeToken {
    Primitive { kind: PrimitiveKind, pointer_depth: u8 },
    /// A quoted class or protocol name; always an object pointer.
    Named { name: String, pointer_depth: u8 },
    /// A structure or union, kept as an opaque pointer-sized value.
    Composite,
}

/// A token with its target-dependent size filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub name: String,
    pub pointer_depth: u8,
    pub size: u8,
}

impl fmt::Display for ResolvedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for _ in 0..self.pointer_depth {
            f.write_str("*")?;
        }
        Ok(())
    }
}

impl TypeToken {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        TypeToken::Primitive {
            kind,
            pointer_depth: 0,
        }
    }

    pub fn pointer_depth(&self) -> u8 {
        match self {
            TypeToken::Primitive { pointer_depth, .. } | TypeToken::Named { pointer_depth, .. } => {
                *pointer_depth
            }
            TypeToken::Composite => 0,
        }
    }

    /// Fix the size of the token for a target.
    pub fn resolve(&self, pointer_width: u8) -> ResolvedType {
        match self {
            TypeToken::Primitive {
                kind,
                pointer_depth,
            } => ResolvedType {
                name: kind.c_name().to_string(),
                pointer_depth: *pointer_depth,
                size: if *pointer_depth > 0 {
                    pointer_width
                } else {
                    kind.size(pointer_width)
                },
            },
            TypeToken::Named {
                name,
                pointer_depth,
            } => ResolvedType {
                name: name.clone(),
                pointer_depth: *pointer_depth,
                size: pointer_width,
            },
            TypeToken::Composite => ResolvedType {
                name: "void".to_string(),
                pointer_depth: 1,
                size: pointer_width,
            },
        }
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Width is irrelevant to the spelling.
        self.resolve(8).fmt(f)
    }
}

/// Method qualifiers (const, in, inout, out, bycopy, byref, oneway).
fn is_qualifier(code: u8) -> bool {
    matches!(code, b'r' | b'n' | b'N' | b'o' | b'O' | b'R' | b'V')
}

/// Index just past the bracket that closes the one at `open`.
fn skip_nested(bytes: &[u8], open: usize) -> Option<usize> {
    let (open_ch, close_ch) = match bytes[open] {
        b'{' => (b'{', b'}'),
        _ => (b'(', b')'),
    };
    let mut depth = 0usize;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if b == open_ch {
            depth += 1;
        } else if b == close_ch {
            depth -= 1;
            if depth == 0 {
                return Some(open + offset + 1);
            }
        }
    }
    None
}

/// Decode a type encoding string.
///
/// An unbalanced structure or union yields an empty list. Unknown codes are
/// skipped.
pub fn decode(text: &str) -> Vec<TypeToken> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pending_depth: u8 = 0;
    let mut i = 0;

    while i < bytes.len() {
        let code = bytes[i];
        match code {
            b'0'..=b'9' => {}
            c if is_qualifier(c) => {}
            b'^' => pending_depth = pending_depth.saturating_add(1),
            b'"' => {
                let start = i + 1;
                let Some(len) = bytes[start..].iter().position(|&b| b == b'"') else {
                    break;
                };
                let name = String::from_utf8_lossy(&bytes[start..start + len]).into_owned();
                // @"NSString" is one object type, not id followed by a name
                if i > 0 && bytes[i - 1] == b'@' {
                    if let Some(TypeToken::Primitive {
                        kind: PrimitiveKind::Id,
                        ..
                    }) = tokens.last()
                    {
                        tokens.pop();
                    }
                }
                tokens.push(TypeToken::Named {
                    name,
                    pointer_depth: pending_depth.saturating_add(1),
                });
                pending_depth = 0;
                i = start + len;
            }
            b'{' | b'(' => {
                let Some(end) = skip_nested(bytes, i) else {
                    return Vec::new();
                };
                tokens.push(TypeToken::Composite);
                pending_depth = 0;
                i = end;
                continue;
            }
            c => {
                if let Some(kind) = PrimitiveKind::from_code(c) {
                    tokens.push(TypeToken::Primitive {
                        kind,
                        pointer_depth: pending_depth,
                    });
                    pending_depth = 0;
                }
            }
        }
        i += 1;
    }

    tokens
}
