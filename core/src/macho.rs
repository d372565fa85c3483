// macho.rs - Mach-O binary loading
//
// Uses goblin for parsing. Segment bytes are copied out so the image owns
// its data. Raw section headers are read back out of the load commands with
// goblin's `Section64`/`Section32` because the indirect symbol bookkeeping
// (reserved1/reserved2) is needed to name stubs and pointer slots after the
// imports they forward to. goblin's parsed `Section` drops those fields.

use goblin::container::Endian;
use goblin::mach::cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};
use goblin::mach::load_command::{
    CommandVariant, Section32, Section64, SIZEOF_SECTION_32, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32,
    SIZEOF_SEGMENT_COMMAND_64,
};
use goblin::mach::symbols::{N_SECT, N_STAB, N_TYPE};
use goblin::mach::{Mach, MachO};
use scroll::Pread;
use tracing::{debug, warn};

use crate::abi::PointerFormat;
use crate::error::{Error, Result};
use crate::image::{Architecture, BinaryImage, ReadError, SectionRange, Symbol, SymbolKind};

// Section types (low byte of flags)
const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
const S_SYMBOL_STUBS: u32 = 0x8;
const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;

const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

fn architecture_of(cputype: u32) -> Architecture {
    match cputype {
        CPU_TYPE_ARM64 => Architecture::Aarch64,
        CPU_TYPE_X86_64 => Architecture::X86_64,
        CPU_TYPE_ARM => Architecture::Armv7,
        CPU_TYPE_X86 => Architecture::X86,
        _ => Architecture::Unknown,
    }
}

fn fixed_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// `pointer_format` of the first segment with chained starts, read from the
/// `LC_DYLD_CHAINED_FIXUPS` payload at `dataoff`.
fn chained_pointer_format(data: &[u8], dataoff: usize, endian: Endian) -> Option<u16> {
    // dyld_chained_fixups_header.starts_offset
    let starts_offset: u32 = data.pread_with(dataoff.checked_add(4)?, endian).ok()?;
    let starts = dataoff.checked_add(starts_offset as usize)?;

    // dyld_chained_starts_in_image: seg_count, then seg_info_offset[seg_count]
    let seg_count: u32 = data.pread_with(starts, endian).ok()?;
    for n in 0..seg_count as usize {
        let info: u32 = data.pread_with(starts + 4 + n * 4, endian).ok()?;
        if info == 0 {
            continue;
        }
        // dyld_chained_starts_in_segment: size, page_size, pointer_format
        return data.pread_with(starts.checked_add(info as usize)?.checked_add(6)?, endian).ok();
    }
    None
}

/// A mapped segment
#[derive(Debug, Clone)]
struct Segment {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    /// File contents; the rest of vmsize is zero-filled
    data: Vec<u8>,
}

impl Segment {
    fn range(&self) -> SectionRange {
        SectionRange::new(self.vmaddr, self.vmaddr.saturating_add(self.vmsize))
    }
}

/// A section header
#[derive(Debug, Clone)]
struct Section {
    name: String,
    segment: String,
    range: SectionRange,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

impl Section {
    fn section_type(&self) -> u32 {
        self.flags & 0xff
    }
}

/// A Mach-O image, one architecture slice.
#[derive(Debug, Clone)]
pub struct MachOImage {
    architecture: Architecture,
    image_base: u64,
    pointer_format: PointerFormat,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl MachOImage {
    /// Parse a thin or fat Mach-O.
    ///
    /// For fat binaries `arch` picks the slice by name (`aarch64`, `x86_64`,
    /// ...). Without it the first slice that can be rewritten is used, or the
    /// first slice at all.
    pub fn parse(data: &[u8], arch: Option<&str>) -> Result<Self> {
        let mach = match Mach::parse(data) {
            Ok(mach) => mach,
            Err(goblin::error::Error::BadMagic(_)) => return Err(Error::NotMachO),
            Err(e) => return Err(e.into()),
        };

        match mach {
            Mach::Binary(macho) => {
                let image = Self::from_macho(&macho, data)?;
                match arch {
                    Some(name) if name != image.architecture.name() => {
                        Err(Error::MissingSlice(name.to_string()))
                    }
                    _ => Ok(image),
                }
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for fat_arch in fat.iter_arches() {
                    let fat_arch = fat_arch?;
                    slices.push((
                        architecture_of(fat_arch.cputype),
                        fat_arch.offset as usize,
                        fat_arch.size as usize,
                    ));
                }
                debug!(
                    "Fat binary with slices: {:?}",
                    slices.iter().map(|(a, _, _)| a.name()).collect::<Vec<_>>()
                );

                let chosen = match arch {
                    Some(name) => slices.iter().find(|(a, _, _)| a.name() == name),
                    None => slices
                        .iter()
                        .find(|(a, _, _)| a.supports_rewriting())
                        .or_else(|| slices.first()),
                };
                let Some(&(_, offset, size)) = chosen else {
                    return Err(Error::MissingSlice(arch.unwrap_or("any").to_string()));
                };
                let slice = data
                    .get(offset..offset.saturating_add(size))
                    .ok_or(Error::NotMachO)?;
                let macho = MachO::parse(slice, 0)?;
                Self::from_macho(&macho, slice)
            }
        }
    }

    fn from_macho(macho: &MachO, data: &[u8]) -> Result<Self> {
        let architecture = architecture_of(macho.header.cputype);
        let endian = if macho.little_endian { scroll::LE } else { scroll::BE };
        let pointer_width: u64 = if macho.is_64 { 8 } else { 4 };

        // Segments and their section headers
        let mut segments = Vec::new();
        let mut sections = Vec::new();
        let mut indirect = Vec::new();
        let mut chained_fixups = None;
        for lc in &macho.load_commands {
            let (segname, vmaddr, vmsize, fileoff, filesize, nsects, cmdsize, header, stride) = match &lc.command {
                CommandVariant::Segment64(seg) => (
                    seg.segname,
                    seg.vmaddr,
                    seg.vmsize,
                    seg.fileoff,
                    seg.filesize,
                    seg.nsects,
                    seg.cmdsize,
                    SIZEOF_SEGMENT_COMMAND_64,
                    SIZEOF_SECTION_64,
                ),
                CommandVariant::Segment32(seg) => (
                    seg.segname,
                    u64::from(seg.vmaddr),
                    u64::from(seg.vmsize),
                    u64::from(seg.fileoff),
                    u64::from(seg.filesize),
                    seg.nsects,
                    seg.cmdsize,
                    SIZEOF_SEGMENT_COMMAND_32,
                    SIZEOF_SECTION_32,
                ),
                CommandVariant::Dysymtab(dysym) => {
                    let start = dysym.indirectsymoff as usize;
                    indirect = (0..dysym.nindirectsyms as usize)
                        .map_while(|i| data.pread_with::<u32>(start + i * 4, endian).ok())
                        .collect();
                    continue;
                }
                CommandVariant::DyldChainedFixups(fixups) => {
                    chained_fixups = Some(fixups.dataoff as usize);
                    continue;
                }
                _ => continue,
            };

            let name = fixed_name(&segname);
            // Headers past cmdsize belong to the next load command
            let room = (cmdsize as usize).saturating_sub(header) / stride;
            let count = (nsects as usize).min(room);
            if count < nsects as usize {
                warn!("Segment {} claims {} sections but has room for {}", name, nsects, room);
            }
            let first = lc.offset + header;
            for n in 0..count {
                let section = read_section_header(data, first + n * stride, macho.is_64, endian)
                    .map_err(goblin::error::Error::from)?;
                sections.push(section);
            }

            let file_range = fileoff as usize..(fileoff.saturating_add(filesize)) as usize;
            let contents = data.get(file_range).map(<[u8]>::to_vec).unwrap_or_default();
            segments.push(Segment {
                name,
                vmaddr,
                vmsize,
                data: contents,
            });
        }

        let pointer_format = match chained_fixups {
            None => PointerFormat::Plain,
            Some(dataoff) => {
                let raw = chained_pointer_format(data, dataoff, endian);
                match raw.and_then(PointerFormat::from_chained) {
                    Some(format) => format,
                    None => {
                        warn!("Chained fixup pointer format {:?} is not decoded; reading pointers as stored", raw);
                        PointerFormat::Plain
                    }
                }
            }
        };

        let image_base = segments
            .iter()
            .find(|s| s.name == "__TEXT")
            .or_else(|| segments.iter().find(|s| !s.data.is_empty()))
            .map(|s| s.vmaddr)
            .unwrap_or(0);

        // Symbol table, index-aligned for the indirect table
        let table: Vec<(String, u8, u64)> = macho
            .symbols()
            .map_while(|sym| sym.ok())
            .map(|(name, nlist)| (name.to_string(), nlist.n_type, nlist.n_value))
            .collect();

        let mut symbols = Vec::new();
        for (name, n_type, value) in &table {
            if n_type & N_STAB != 0 || n_type & N_TYPE != N_SECT {
                continue;
            }
            let kind = match sections.iter().find(|s| s.range.contains(*value)) {
                Some(s) if s.flags & S_ATTR_PURE_INSTRUCTIONS != 0 => SymbolKind::Function,
                _ => SymbolKind::Data,
            };
            symbols.push(Symbol::new(name.clone(), *value, kind));
        }

        // Stubs and pointer slots named after the imports they forward to
        for section in &sections {
            let (entry_size, kind) = match section.section_type() {
                S_SYMBOL_STUBS => (u64::from(section.reserved2), SymbolKind::ImportedFunction),
                S_LAZY_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => (pointer_width, SymbolKind::ImportAddress),
                _ => continue,
            };
            for (n, address) in section.range.slots(entry_size).enumerate() {
                let Some(&index) = indirect.get(section.reserved1 as usize + n) else {
                    break;
                };
                if index & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                    continue;
                }
                if let Some((name, _, _)) = table.get(index as usize) {
                    symbols.push(Symbol::new(name.clone(), address, kind));
                }
            }
        }

        debug!(
            "Loaded {} image ({:?} pointers): {} segments, {} sections, {} symbols",
            architecture,
            pointer_format,
            segments.len(),
            sections.len(),
            symbols.len()
        );

        Ok(Self {
            architecture,
            image_base,
            pointer_format,
            segments,
            sections,
            symbols,
        })
    }

    /// Name of the segment holding section `name`.
    pub fn section_segment(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.segment.as_str())
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

fn read_section_header(
    data: &[u8],
    at: usize,
    is_64: bool,
    endian: Endian,
) -> std::result::Result<Section, scroll::Error> {
    let (sectname, segname, addr, size, flags, reserved1, reserved2) = if is_64 {
        let raw: Section64 = data.pread_with(at, endian)?;
        (raw.sectname, raw.segname, raw.addr, raw.size, raw.flags, raw.reserved1, raw.reserved2)
    } else {
        let raw: Section32 = data.pread_with(at, endian)?;
        (
            raw.sectname,
            raw.segname,
            u64::from(raw.addr),
            u64::from(raw.size),
            raw.flags,
            raw.reserved1,
            raw.reserved2,
        )
    };
    Ok(Section {
        name: fixed_name(&sectname),
        segment: fixed_name(&segname),
        range: SectionRange::new(addr, addr.saturating_add(size)),
        flags,
        reserved1,
        reserved2,
    })
}

impl BinaryImage for MachOImage {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn image_base(&self) -> u64 {
        self.image_base
    }

    fn pointer_format(&self) -> PointerFormat {
        self.pointer_format
    }

    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> std::result::Result<(), ReadError> {
        // Segments without file contents (__PAGEZERO) back nothing
        let segment = self
            .segments
            .iter()
            .find(|s| !s.data.is_empty() && s.range().contains(address))
            .ok_or(ReadError::Unmapped { address })?;
        let fits = address
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= segment.range().end);
        if !fits {
            return Err(ReadError::Truncated {
                address,
                len: buf.len(),
            });
        }

        // Past the file contents the segment is zero-filled
        let start = (address - segment.vmaddr) as usize;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = segment.data.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn section(&self, name: &str) -> Option<SectionRange> {
        self.sections.iter().find(|s| s.name == name).map(|s| s.range)
    }

    fn address_is_mapped(&self, address: u64, _include_external: bool) -> bool {
        // Imports have no synthetic region in a raw Mach-O
        self.segments
            .iter()
            .any(|s| !s.data.is_empty() && s.range().contains(address))
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
