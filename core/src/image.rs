// image.rs - Byte access over a loaded binary image
//
// Everything the analyzers read is addressed by virtual address through
// `BinaryImage`. Structures are walked with `StructCursor`, which keeps the
// pointer width of the image so callers never hand-size their reads.

use std::fmt;

use thiserror::Error;

use crate::abi::{self, PointerFormat};
use crate::il::ssa::MemoryOracle;

/// Failure to read from the image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("address 0x{address:x} is not mapped")]
    Unmapped { address: u64 },

    #[error("read of {len} bytes at 0x{address:x} runs past mapped data")]
    Truncated { address: u64, len: usize },

    #[error("unterminated string at 0x{address:x}")]
    UnterminatedString { address: u64 },
}

/// Default execution architecture of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Aarch64,
    X86_64,
    Armv7,
    X86,
    Unknown,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Aarch64 => "aarch64",
            Architecture::X86_64 => "x86_64",
            Architecture::Armv7 => "armv7",
            Architecture::X86 => "x86",
            Architecture::Unknown => "unknown",
        }
    }

    /// Width of a pointer in bytes
    pub fn pointer_width(&self) -> u8 {
        match self {
            Architecture::Armv7 | Architecture::X86 => 4,
            _ => 8,
        }
    }

    /// Call-site rewriting is only implemented for these targets.
    pub fn supports_rewriting(&self) -> bool {
        matches!(self, Architecture::Aarch64 | Architecture::X86_64)
    }

    /// Does bit 0 of a code pointer select the Thumb instruction set?
    pub fn has_thumb_bit(&self) -> bool {
        matches!(self, Architecture::Armv7)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open address range of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRange {
    pub start: u64,
    pub end: u64,
}

impl SectionRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// Addresses of consecutive `stride`-sized slots in the section.
    pub fn slots(&self, stride: u64) -> impl Iterator<Item = u64> {
        let end = self.end;
        let stride = stride.max(1);
        (self.start..end)
            .step_by(stride as usize)
            .take_while(move |slot| slot.checked_add(stride).is_some_and(|next| next <= end))
    }
}

/// What a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Data,
    /// A stub that forwards to an imported function.
    ImportedFunction,
    /// A pointer slot bound to an imported symbol.
    ImportAddress,
    /// A symbol without a mapped definition.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn new(name: impl Into<String>, address: u64, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            address,
            kind,
        }
    }
}

/// Random access to the bytes, sections and symbols of one binary image.
///
/// Section lookups report absence with `None`; reads outside mapped memory
/// return `ReadError` and never panic.
pub trait BinaryImage: Send + Sync {
    /// Default architecture of the image.
    fn architecture(&self) -> Architecture;

    /// Width of a pointer in bytes.
    fn pointer_width(&self) -> u8 {
        self.architecture().pointer_width()
    }

    /// Lowest mapped address of the image proper.
    fn image_base(&self) -> u64;

    /// Encoding of pointers stored in data sections.
    fn pointer_format(&self) -> PointerFormat {
        PointerFormat::Plain
    }

    /// Fill `buf` from `address`.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Address range of the section named `name`.
    fn section(&self, name: &str) -> Option<SectionRange>;

    /// Is `address` backed by the image?
    ///
    /// With `include_external` unset, addresses in the synthetic region that
    /// holds imported symbols are reported as unmapped.
    fn address_is_mapped(&self, address: u64, include_external: bool) -> bool;

    /// Name of the symbol defined at `address`.
    fn symbol_name_at(&self, address: u64) -> Option<String>;

    /// Every symbol called `name`.
    fn symbols_named(&self, name: &str) -> Vec<Symbol>;
}

/// Seek-and-read access to little-endian structures in an image.
pub struct StructCursor<'a> {
    image: &'a dyn BinaryImage,
    position: u64,
    pointer_width: u8,
}

impl<'a> StructCursor<'a> {
    /// Longest C string the cursor will follow before giving up.
    pub const MAX_STRING_LEN: usize = 4096;

    pub fn new(image: &'a dyn BinaryImage) -> Self {
        Self {
            image,
            position: 0,
            pointer_width: image.pointer_width(),
        }
    }

    pub fn image(&self) -> &'a dyn BinaryImage {
        self.image
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn pointer_width(&self) -> u8 {
        self.pointer_width
    }

    pub fn seek(&mut self, address: u64) {
        self.position = address;
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        let mut buf = [0u8; N];
        self.image.read_bytes(self.position, &mut buf)?;
        self.position = self.position.wrapping_add(N as u64);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ReadError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReadError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a pointer-width integer, zero-extended.
    pub fn read_pointer(&mut self) -> Result<u64, ReadError> {
        if self.pointer_width == 4 {
            self.read_u32().map(u64::from)
        } else {
            self.read_u64()
        }
    }

    pub fn read_u32_at(&mut self, address: u64) -> Result<u32, ReadError> {
        self.seek(address);
        self.read_u32()
    }

    pub fn read_i32_at(&mut self, address: u64) -> Result<i32, ReadError> {
        self.seek(address);
        self.read_i32()
    }

    pub fn read_u64_at(&mut self, address: u64) -> Result<u64, ReadError> {
        self.seek(address);
        self.read_u64()
    }

    pub fn read_pointer_at(&mut self, address: u64) -> Result<u64, ReadError> {
        self.seek(address);
        self.read_pointer()
    }

    /// Read a NUL-terminated string; invalid UTF-8 is replaced.
    pub fn read_c_string_at(&mut self, address: u64) -> Result<String, ReadError> {
        let mut bytes = Vec::new();
        self.seek(address);
        loop {
            if bytes.len() >= Self::MAX_STRING_LEN {
                return Err(ReadError::UnterminatedString { address });
            }
            match self.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Dataflow view of an image: which loads are constant and which slots are
/// bound to imports.
pub struct ImageMemory<'a> {
    image: &'a dyn BinaryImage,
    constant: Vec<SectionRange>,
    import_slots: Vec<SectionRange>,
}

impl<'a> ImageMemory<'a> {
    pub fn new(image: &'a dyn BinaryImage) -> Self {
        let lookup = |names: &[&str]| -> Vec<SectionRange> {
            names.iter().filter_map(|name| image.section(name)).collect()
        };
        Self {
            image,
            constant: lookup(abi::CONSTANT_SECTIONS),
            import_slots: lookup(abi::IMPORT_SLOT_SECTIONS),
        }
    }
}

impl MemoryOracle for ImageMemory<'_> {
    fn constant_load(&self, address: u64, size: u8) -> Option<u64> {
        if !self.constant.iter().any(|s| s.contains(address)) {
            return None;
        }
        let mut cursor = StructCursor::new(self.image);
        cursor.seek(address);
        let raw = match size {
            1 => cursor.read_u8().map(u64::from),
            4 => cursor.read_u32().map(u64::from),
            8 => cursor.read_u64(),
            _ => return None,
        };
        raw.ok()
            .map(|value| abi::decode_pointer(value, self.image.image_base(), self.image.pointer_format()))
    }

    fn is_import_slot(&self, address: u64) -> bool {
        self.import_slots.iter().any(|s| s.contains(address))
    }
}

/// A contiguous run of mapped bytes in a `MemoryImage`.
#[derive(Debug, Clone)]
struct MappedRegion {
    address: u64,
    data: Vec<u8>,
}

impl MappedRegion {
    fn range(&self) -> SectionRange {
        SectionRange::new(self.address, self.address + self.data.len() as u64)
    }
}

/// An image held entirely in memory.
///
/// Hosts that already have the loaded bytes can describe them here instead of
/// implementing `BinaryImage` themselves.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    architecture: Architecture,
    image_base: u64,
    pointer_format: PointerFormat,
    regions: Vec<MappedRegion>,
    sections: Vec<(String, SectionRange)>,
    external: Vec<SectionRange>,
    symbols: Vec<Symbol>,
}

impl MemoryImage {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            image_base: 0,
            pointer_format: PointerFormat::Plain,
            regions: Vec::new(),
            sections: Vec::new(),
            external: Vec::new(),
            symbols: Vec::new(),
        }
    }

    pub fn with_image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    pub fn with_pointer_format(mut self, pointer_format: PointerFormat) -> Self {
        self.pointer_format = pointer_format;
        self
    }

    /// Map `size` zeroed bytes at `address`.
    pub fn map_zeroed(&mut self, address: u64, size: usize) -> &mut Self {
        self.map(address, vec![0; size])
    }

    pub fn map(&mut self, address: u64, data: Vec<u8>) -> &mut Self {
        self.regions.push(MappedRegion { address, data });
        self
    }

    /// Register a section, replacing any earlier one of the same name.
    pub fn add_section(&mut self, name: impl Into<String>, start: u64, end: u64) -> &mut Self {
        let name = name.into();
        self.sections.retain(|(section, _)| *section != name);
        self.sections.push((name, SectionRange::new(start, end)));
        self
    }

    /// Mark a mapped range as the external (import) region.
    pub fn add_external_range(&mut self, start: u64, end: u64) -> &mut Self {
        self.external.push(SectionRange::new(start, end));
        self
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> &mut Self {
        self.symbols.push(symbol);
        self
    }

    fn region_for(&self, address: u64, len: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(idx, region)| {
            let range = region.range();
            if !range.contains(address) {
                return None;
            }
            let offset = (address - region.address) as usize;
            (offset + len <= region.data.len()).then_some((idx, offset))
        })
    }

    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<(), ReadError> {
        let (idx, offset) = self
            .region_for(address, bytes.len())
            .ok_or(ReadError::Unmapped { address })?;
        self.regions[idx].data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<(), ReadError> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), ReadError> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Write a pointer-width value.
    pub fn write_pointer(&mut self, address: u64, value: u64) -> Result<(), ReadError> {
        if self.architecture.pointer_width() == 4 {
            self.write_u32(address, value as u32)
        } else {
            self.write_u64(address, value)
        }
    }

    /// Write `text` followed by a NUL byte.
    pub fn write_c_string(&mut self, address: u64, text: &str) -> Result<(), ReadError> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.write_bytes(address, &bytes)
    }
}

impl BinaryImage for MemoryImage {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn image_base(&self) -> u64 {
        self.image_base
    }

    fn pointer_format(&self) -> PointerFormat {
        self.pointer_format
    }

    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        if !self.regions.iter().any(|r| r.range().contains(address)) {
            return Err(ReadError::Unmapped { address });
        }
        let (idx, offset) = self
            .region_for(address, buf.len())
            .ok_or(ReadError::Truncated {
                address,
                len: buf.len(),
            })?;
        buf.copy_from_slice(&self.regions[idx].data[offset..offset + buf.len()]);
        Ok(())
    }

    fn section(&self, name: &str) -> Option<SectionRange> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, range)| *range)
    }

    fn address_is_mapped(&self, address: u64, include_external: bool) -> bool {
        if !include_external && self.external.iter().any(|r| r.contains(address)) {
            return false;
        }
        self.regions.iter().any(|r| r.range().contains(address))
    }

    fn symbol_name_at(&self, address: u64) -> Option<String> {
        self.symbols
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.name.clone())
    }

    fn symbols_named(&self, name: &str) -> Vec<Symbol> {
        self.symbols.iter().filter(|s| s.name == name).cloned().collect()
    }
}
