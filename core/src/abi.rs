// abi.rs - Objective-C runtime ABI tables
//
// Field offsets of the runtime structures for each pointer width, the flag
// bits of method lists, and the section and symbol names the analysis keys on.

/// Sections holding runtime metadata.
pub mod sections {
    pub const CLASS_LIST: &str = "__objc_classlist";
    pub const CLASS_REFS: &str = "__objc_classrefs";
    pub const SUPER_REFS: &str = "__objc_superrefs";
    pub const SELECTOR_REFS: &str = "__objc_selrefs";
    pub const CF_STRINGS: &str = "__cfstring";
    pub const IVAR_OFFSETS: &str = "__objc_ivar";

    pub const AUTH_STUBS: &str = "__auth_stubs";
    pub const STUBS: &str = "__stubs";
    pub const AUTH_GOT: &str = "__auth_got";
    pub const GOT: &str = "__got";
    pub const LAZY_SYMBOL_POINTERS: &str = "__la_symbol_ptr";
}

/// Sections whose contents are fixed once the image is loaded.
pub const CONSTANT_SECTIONS: &[&str] = &[
    sections::SELECTOR_REFS,
    sections::CLASS_REFS,
    sections::SUPER_REFS,
];

/// Pointer sections bound to imported symbols.
pub const IMPORT_SLOT_SECTIONS: &[&str] = &[
    sections::AUTH_GOT,
    sections::GOT,
    sections::LAZY_SYMBOL_POINTERS,
];

/// Code sections that hold import trampolines.
pub const STUB_SECTIONS: &[&str] = &[sections::AUTH_STUBS, sections::STUBS];

/// The dynamic dispatch trampoline.
pub const MSG_SEND: &str = "_objc_msgSend";

/// Reference-counting entry points removed by ARC cleanup.
pub const ARC_FUNCTIONS: &[&str] = &[
    "_objc_retain",
    "_objc_release",
    "_objc_autorelease",
    "_objc_autoreleaseReturnValue",
    "_objc_retainAutoreleasedReturnValue",
    "_objc_unsafeClaimAutoreleasedReturnValue",
];

// method_list_t flags live in the top half of entsizeAndFlags.
pub const METHOD_LIST_FLAGS_MASK: u32 = 0xFFFF_0000;
pub const METHOD_LIST_RELATIVE: u32 = 0x8000_0000;
pub const METHOD_LIST_DIRECT_SELECTORS: u32 = 0x4000_0000;

/// Size of a relative method entry: three i32 offsets.
pub const RELATIVE_METHOD_SIZE: u64 = 12;

/// Both method and ivar lists start with two u32 fields.
pub const LIST_HEADER_SIZE: u64 = 8;

/// Swift marks classes through the low two bits of the data pointer.
pub const CLASS_DATA_TAG_MASK: u64 = !0b11;

/// Thumb interworking bit of ARM code pointers.
pub const THUMB_BIT_MASK: u64 = !1;

/// Offsets inside runtime structures for one pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub pointer_width: u8,
}

impl Layout {
    pub fn new(pointer_width: u8) -> Self {
        Self { pointer_width }
    }

    fn ptr(&self) -> u64 {
        u64::from(self.pointer_width)
    }

    /// objc_class: isa, superclass, cache, vtable, data
    pub fn class_isa(&self) -> u64 {
        0
    }

    pub fn class_data(&self) -> u64 {
        4 * self.ptr()
    }

    /// First pointer field of class_ro_t (ivarLayout), after the u32 header
    /// fields and the 64-bit reserved word.
    pub fn class_ro_pointers(&self) -> u64 {
        if self.pointer_width == 8 {
            16
        } else {
            12
        }
    }

    pub fn class_ro_name(&self) -> u64 {
        self.class_ro_pointers() + self.ptr()
    }

    pub fn class_ro_base_methods(&self) -> u64 {
        self.class_ro_pointers() + 2 * self.ptr()
    }

    pub fn class_ro_ivars(&self) -> u64 {
        self.class_ro_pointers() + 4 * self.ptr()
    }

    /// Absolute method entry: name, types, imp.
    pub fn method_size(&self) -> u64 {
        3 * self.ptr()
    }

    /// Ivar entry: offset, name, type pointers then alignment and size.
    pub fn ivar_size(&self) -> u64 {
        3 * self.ptr() + 8
    }

    /// CFString: isa, flags, data, length.
    pub fn cfstring_size(&self) -> u64 {
        4 * self.ptr()
    }

    pub fn cfstring_data(&self) -> u64 {
        2 * self.ptr()
    }

    pub fn cfstring_length(&self) -> u64 {
        3 * self.ptr()
    }
}

/// Stride of method list entries for the given flags.
pub fn method_entry_size(flags: u32, layout: Layout) -> u64 {
    if flags & METHOD_LIST_RELATIVE != 0 {
        RELATIVE_METHOD_SIZE
    } else {
        layout.method_size()
    }
}

/// How pointers are stored in the image's data segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerFormat {
    /// Plain virtual addresses (classic dyld info or already fixed up).
    #[default]
    Plain,
    /// `DYLD_CHAINED_PTR_64` and `DYLD_CHAINED_PTR_64_OFFSET`.
    Chained64,
    /// The arm64e family of chained formats, with authenticated pointers.
    Arm64e,
}

impl PointerFormat {
    /// Map a `pointer_format` value from `dyld_chained_starts_in_segment`.
    /// Returns `None` for formats whose layout is not decoded here.
    pub fn from_chained(format: u16) -> Option<Self> {
        match format {
            // ARM64E, ARM64E_KERNEL, ARM64E_USERLAND, ARM64E_FIRMWARE, ARM64E_USERLAND24
            1 | 7 | 9 | 10 | 12 => Some(PointerFormat::Arm64e),
            // PTR_64, PTR_64_OFFSET
            2 | 6 => Some(PointerFormat::Chained64),
            _ => None,
        }
    }
}

// DYLD_CHAINED_PTR_64 bit layout
const CHAINED64_BIND_BIT: u64 = 1 << 63;
const CHAINED64_TARGET_BITS: u32 = 36;

// DYLD_CHAINED_PTR_ARM64E bit layout
const ARM64E_AUTH_BIT: u64 = 1 << 63;
const ARM64E_BIND_BIT: u64 = 1 << 62;
const ARM64E_TARGET_BITS: u32 = 43;
const ARM64E_AUTH_TARGET_MASK: u64 = 0xFFFF_FFFF;

/// Decode a pointer as stored on disk into a virtual address.
///
/// Binds to other images decode to 0, the same as a null pointer, because
/// nothing in this image lives at their target. Rebase targets below
/// `image_base` are image offsets (the `_OFFSET` and userland variants);
/// larger ones are already virtual addresses.
pub fn decode_pointer(raw: u64, image_base: u64, format: PointerFormat) -> u64 {
    match format {
        PointerFormat::Plain => raw,
        PointerFormat::Chained64 => {
            if raw & CHAINED64_BIND_BIT != 0 {
                return 0;
            }
            rebase(raw, CHAINED64_TARGET_BITS, image_base)
        }
        PointerFormat::Arm64e => {
            if raw & ARM64E_BIND_BIT != 0 {
                return 0;
            }
            if raw & ARM64E_AUTH_BIT != 0 {
                return image_base.wrapping_add(raw & ARM64E_AUTH_TARGET_MASK);
            }
            rebase(raw, ARM64E_TARGET_BITS, image_base)
        }
    }
}

/// Plain rebase: a `target_bits` wide target with the top byte stored just
/// above it.
fn rebase(raw: u64, target_bits: u32, image_base: u64) -> u64 {
    let target = raw & ((1u64 << target_bits) - 1);
    let high8 = (raw >> target_bits) & 0xff;
    let address = if target != 0 && target < image_base {
        image_base.wrapping_add(target)
    } else {
        target
    };
    address | (high8 << 56)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_64() {
        let l = Layout::new(8);
        assert_eq!(l.class_data(), 32);
        assert_eq!(l.class_ro_name(), 24);
        assert_eq!(l.class_ro_base_methods(), 32);
        assert_eq!(l.class_ro_ivars(), 48);
        assert_eq!(l.ivar_size(), 32);
        assert_eq!(l.cfstring_size(), 32);
    }

    #[test]
    fn test_layout_32() {
        let l = Layout::new(4);
        assert_eq!(l.class_data(), 16);
        assert_eq!(l.class_ro_name(), 16);
        assert_eq!(l.class_ro_base_methods(), 20);
        assert_eq!(l.class_ro_ivars(), 28);
        assert_eq!(l.ivar_size(), 20);
        assert_eq!(l.method_size(), 12);
    }

    #[test]
    fn test_method_entry_size() {
        assert_eq!(method_entry_size(0x8000_000c, Layout::new(8)), 12);
        assert_eq!(method_entry_size(0x0000_0018, Layout::new(8)), 24);
        assert_eq!(method_entry_size(0x4000_0018, Layout::new(8)), 24);
    }

    const BASE: u64 = 0x1_0000_0000;

    #[test]
    fn test_plain_pointers_pass_through() {
        assert_eq!(decode_pointer(0x1_0000_4000, BASE, PointerFormat::Plain), 0x1_0000_4000);
        assert_eq!(decode_pointer(0, BASE, PointerFormat::Plain), 0);
        // kernel-space address with every high bit set
        let kernel = 0xffff_ff80_0020_1000;
        assert_eq!(decode_pointer(kernel, BASE, PointerFormat::Plain), kernel);
    }

    #[test]
    fn test_decode_chained_rebase() {
        // next bits set above the 36-bit target
        let raw = 0x0010_0000_0000_4000;
        assert_eq!(decode_pointer(raw, BASE, PointerFormat::Chained64), 0x1_0000_4000);
        // absolute target at or above the base is kept
        assert_eq!(decode_pointer(0x1_0000_4000, BASE, PointerFormat::Chained64), 0x1_0000_4000);
    }

    #[test]
    fn test_decode_chained_bind_is_null() {
        // ordinal 3 bound to another image
        let raw = CHAINED64_BIND_BIT | 3;
        assert_eq!(decode_pointer(raw, BASE, PointerFormat::Chained64), 0);
    }

    #[test]
    fn test_decode_arm64e_rebases() {
        let auth = ARM64E_AUTH_BIT | 0x0001_2345_0000_8000;
        assert_eq!(decode_pointer(auth, BASE, PointerFormat::Arm64e), 0x1_0000_8000);

        let plain = (5 << 51) | 0x1_0000_c000;
        assert_eq!(decode_pointer(plain, BASE, PointerFormat::Arm64e), 0x1_0000_c000);
    }

    #[test]
    fn test_decode_arm64e_binds_are_null() {
        assert_eq!(decode_pointer(ARM64E_BIND_BIT | 7, BASE, PointerFormat::Arm64e), 0);
        let auth_bind = ARM64E_AUTH_BIT | ARM64E_BIND_BIT | 0x0000_1234_0000_0002;
        assert_eq!(decode_pointer(auth_bind, BASE, PointerFormat::Arm64e), 0);
    }

    #[test]
    fn test_chained_format_values() {
        assert_eq!(PointerFormat::from_chained(1), Some(PointerFormat::Arm64e));
        assert_eq!(PointerFormat::from_chained(6), Some(PointerFormat::Chained64));
        assert_eq!(PointerFormat::from_chained(3), None);
    }
}
