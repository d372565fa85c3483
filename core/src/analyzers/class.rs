// analyzers/class.rs - Class, method list and ivar list decoding
//
// Walks __objc_classlist. For every class: objc_class -> class_ro_t ->
// name, base method list and ivar list, then the same for the meta-class
// reached through isa.

use tracing::debug;

use super::{Analyzer, SectionReader};
use crate::abi::{self, sections};
use crate::image::{BinaryImage, ReadError};
use crate::model::{AnalysisInfo, ClassInfo, IvarInfo, IvarListInfo, MethodInfo, MethodListInfo};

pub struct ClassAnalyzer;

impl Analyzer for ClassAnalyzer {
    fn name(&self) -> &'static str {
        "class"
    }

    fn run(&self, image: &dyn BinaryImage, info: &mut AnalysisInfo) {
        let Some(section) = image.section(sections::CLASS_LIST) else {
            return;
        };
        let mut reader = SectionReader::new(image);

        for list_pointer in reader.pointer_slots(section) {
            match read_listed_class(&mut reader, list_pointer) {
                Ok(class) => info.add_class(class),
                Err(e) => debug!("Skipping class list entry at {:#x}: {}", list_pointer, e),
            }
        }
    }
}

fn read_listed_class(reader: &mut SectionReader, list_pointer: u64) -> Result<ClassInfo, ReadError> {
    let address = reader.pointer_at(list_pointer)?;
    let mut class = read_class(reader, address, false)?;
    class.list_pointer = list_pointer;

    // Follow isa only when it lands inside the image
    let isa = reader.pointer_at(address + reader.layout.class_isa())?;
    if isa != 0 && reader.image().address_is_mapped(isa, false) {
        match read_class(reader, isa, true) {
            Ok(meta) => class.meta_class = Some(Box::new(meta)),
            Err(e) => debug!("Skipping meta-class of {} at {:#x}: {}", class.name, isa, e),
        }
    }

    Ok(class)
}

fn read_class(reader: &mut SectionReader, address: u64, is_meta_class: bool) -> Result<ClassInfo, ReadError> {
    let layout = reader.layout;

    let data_address = reader.pointer_at(address + layout.class_data())? & abi::CLASS_DATA_TAG_MASK;

    let name_address = reader.pointer_at(data_address + layout.class_ro_name())?;
    let name = reader.string_at(name_address)?;

    let method_list_address = reader.pointer_at(data_address + layout.class_ro_base_methods())?;
    let ivar_list_address = reader.pointer_at(data_address + layout.class_ro_ivars())?;

    let method_list = if method_list_address != 0 {
        read_method_list(reader, method_list_address).unwrap_or_else(|e| {
            debug!("Bad method list for {} at {:#x}: {}", name, method_list_address, e);
            MethodListInfo {
                address: method_list_address,
                ..Default::default()
            }
        })
    } else {
        MethodListInfo::default()
    };

    let ivar_list = if ivar_list_address != 0 {
        read_ivar_list(reader, ivar_list_address).unwrap_or_else(|e| {
            debug!("Bad ivar list for {} at {:#x}: {}", name, ivar_list_address, e);
            IvarListInfo {
                address: ivar_list_address,
                ..Default::default()
            }
        })
    } else {
        IvarListInfo::default()
    };

    Ok(ClassInfo {
        address,
        list_pointer: 0,
        data_address,
        name,
        name_address,
        method_list,
        method_list_address,
        ivar_list,
        ivar_list_address,
        is_meta_class,
        meta_class: None,
    })
}

/// Decode a method list. Entries that cannot be read are skipped.
pub(crate) fn read_method_list(reader: &mut SectionReader, address: u64) -> Result<MethodListInfo, ReadError> {
    let flags = reader.cursor.read_u32_at(address)?;
    let count = reader.cursor.read_u32()?;

    let mut list = MethodListInfo {
        address,
        flags,
        methods: Vec::new(),
    };
    let entry_size = list.entry_size(reader.layout.pointer_width);

    for i in 0..u64::from(count) {
        let entry = address + abi::LIST_HEADER_SIZE + i * entry_size;
        if !reader.image().address_is_mapped(entry, true) {
            debug!("Method list at {:#x} runs off mapped memory after {} entries", address, i);
            break;
        }
        match read_method(reader, &list, entry) {
            Ok(method) => list.methods.push(method),
            Err(e) => debug!("Skipping method at {:#x}: {}", entry, e),
        }
    }

    Ok(list)
}

fn read_method(reader: &mut SectionReader, list: &MethodListInfo, address: u64) -> Result<MethodInfo, ReadError> {
    let (name_address, type_address, implementation_address) = if list.has_relative_offsets() {
        let name = address.wrapping_add_signed(i64::from(reader.cursor.read_i32_at(address)?));
        let types = (address + 4).wrapping_add_signed(i64::from(reader.cursor.read_i32()?));
        let imp = (address + 8).wrapping_add_signed(i64::from(reader.cursor.read_i32()?));
        (name, types, imp)
    } else {
        reader.cursor.seek(address);
        let name = reader.next_pointer()?;
        let types = reader.next_pointer()?;
        let mut imp = reader.next_pointer()?;
        if reader.image().architecture().has_thumb_bit() {
            imp &= abi::THUMB_BIT_MASK;
        }
        (name, types, imp)
    };

    // Relative lists without direct selectors point at a selector reference
    let selector = if !list.has_relative_offsets() || list.has_direct_selectors() {
        reader.string_at(name_address)?
    } else {
        let selector_name = reader.pointer_at(name_address)?;
        reader.string_at(selector_name)?
    };
    let type_encoding = reader.string_at(type_address)?;

    Ok(MethodInfo {
        address,
        selector,
        type_encoding,
        name_address,
        type_address,
        implementation_address,
    })
}

/// Decode an ivar list. Entries that cannot be read are skipped.
pub(crate) fn read_ivar_list(reader: &mut SectionReader, address: u64) -> Result<IvarListInfo, ReadError> {
    let count = reader.cursor.read_u32_at(address + 4)?;
    let entry_size = reader.layout.ivar_size();

    let mut list = IvarListInfo {
        address,
        count,
        ivars: Vec::new(),
    };

    for i in 0..u64::from(count) {
        let entry = address + abi::LIST_HEADER_SIZE + i * entry_size;
        if !reader.image().address_is_mapped(entry, true) {
            debug!("Ivar list at {:#x} runs off mapped memory after {} entries", address, i);
            break;
        }
        match read_ivar(reader, entry) {
            Ok(ivar) => list.ivars.push(ivar),
            Err(e) => debug!("Skipping ivar at {:#x}: {}", entry, e),
        }
    }

    Ok(list)
}

fn read_ivar(reader: &mut SectionReader, address: u64) -> Result<IvarInfo, ReadError> {
    reader.cursor.seek(address);
    let offset_address = reader.next_pointer()?;
    let name_address = reader.next_pointer()?;
    let type_address = reader.next_pointer()?;
    let _alignment = reader.cursor.read_u32()?;
    let size = reader.cursor.read_u32()?;

    let offset = reader.cursor.read_u32_at(offset_address)?;
    let name = reader.string_at(name_address)?;
    let type_encoding = reader.string_at(type_address)?;

    Ok(IvarInfo {
        address,
        offset_address,
        offset,
        name,
        name_address,
        type_encoding,
        type_address,
        size,
    })
}
