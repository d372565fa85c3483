// analyzers/selector.rs - Selector reference decoding

use tracing::debug;

use super::{Analyzer, SectionReader};
use crate::abi::sections;
use crate::image::{BinaryImage, ReadError};
use crate::model::{AnalysisInfo, SelectorRefInfo};

/// Walks __objc_selrefs. Each slot holds a (possibly fixup-encoded) pointer
/// to the selector name.
pub struct SelectorRefAnalyzer;

impl Analyzer for SelectorRefAnalyzer {
    fn name(&self) -> &'static str {
        "selector"
    }

    fn run(&self, image: &dyn BinaryImage, info: &mut AnalysisInfo) {
        let Some(section) = image.section(sections::SELECTOR_REFS) else {
            return;
        };
        let mut reader = SectionReader::new(image);

        for address in reader.pointer_slots(section) {
            match read_selector_ref(&mut reader, address) {
                Ok(selector_ref) => info.add_selector_ref(selector_ref),
                Err(e) => debug!("Skipping selector reference at {:#x}: {}", address, e),
            }
        }
    }
}

fn read_selector_ref(reader: &mut SectionReader, address: u64) -> Result<SelectorRefInfo, ReadError> {
    let raw_selector = reader.cursor.read_pointer_at(address)?;
    let name_address = reader.decode(raw_selector);
    let name = reader.string_at(name_address)?;

    Ok(SelectorRefInfo {
        address,
        name,
        raw_selector,
        name_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::PointerFormat;
    use crate::image::{Architecture, MemoryImage};

    #[test]
    fn test_selector_refs_indexed_by_address_and_raw_value() {
        let mut image = MemoryImage::new(Architecture::Aarch64)
            .with_image_base(0x1_0000_0000)
            .with_pointer_format(PointerFormat::Chained64);
        image.map_zeroed(0x1_0000_0000, 0x1000);
        image.add_section(sections::SELECTOR_REFS, 0x1_0000_0100, 0x1_0000_0110);
        image.write_c_string(0x1_0000_0800, "viewDidLoad").unwrap();
        // chained rebase to image offset 0x800
        image
            .write_u64(0x1_0000_0100, 0x0020_0000_0000_0800)
            .unwrap();
        image.write_u64(0x1_0000_0108, 0x1_0000_0800).unwrap();

        let mut info = AnalysisInfo::new();
        SelectorRefAnalyzer.run(&image, &mut info);

        assert_eq!(info.selector_refs.len(), 2);
        let first = info.selector_ref(0x1_0000_0100).unwrap();
        assert_eq!(first.name, "viewDidLoad");
        assert_eq!(first.name_address, 0x1_0000_0800);
        assert_eq!(
            info.selector_ref(0x0020_0000_0000_0800).unwrap().address,
            0x1_0000_0100
        );
    }

    #[test]
    fn test_unreadable_name_skipped() {
        let mut image = MemoryImage::new(Architecture::X86_64);
        image.map_zeroed(0x1000, 0x100);
        image.add_section(sections::SELECTOR_REFS, 0x1000, 0x1010);
        image.write_u64(0x1000, 0x9999_0000).unwrap();
        image.write_u64(0x1008, 0x1080).unwrap();
        image.write_c_string(0x1080, "init").unwrap();

        let mut info = AnalysisInfo::new();
        SelectorRefAnalyzer.run(&image, &mut info);
        assert_eq!(info.selector_refs.len(), 1);
        assert_eq!(info.selector_refs[0].name, "init");
    }
}
