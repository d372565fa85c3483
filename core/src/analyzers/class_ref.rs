// analyzers/class_ref.rs - Class and superclass reference decoding

use tracing::debug;

use super::{Analyzer, SectionReader};
use crate::abi::sections;
use crate::image::BinaryImage;
use crate::model::{AnalysisInfo, ClassRefInfo};

/// Walks __objc_classrefs and __objc_superrefs.
pub struct ClassRefAnalyzer;

impl Analyzer for ClassRefAnalyzer {
    fn name(&self) -> &'static str {
        "class_ref"
    }

    fn run(&self, image: &dyn BinaryImage, info: &mut AnalysisInfo) {
        let mut reader = SectionReader::new(image);
        info.class_refs = read_refs(&mut reader, sections::CLASS_REFS);
        info.super_refs = read_refs(&mut reader, sections::SUPER_REFS);
    }
}

fn read_refs(reader: &mut SectionReader, section_name: &str) -> Vec<ClassRefInfo> {
    let Some(section) = reader.image().section(section_name) else {
        return Vec::new();
    };

    reader
        .pointer_slots(section)
        .filter_map(|address| match reader.pointer_at(address) {
            Ok(referenced_address) => Some(ClassRefInfo {
                address,
                referenced_address,
            }),
            Err(e) => {
                debug!("Skipping {} entry at {:#x}: {}", section_name, address, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Architecture, MemoryImage};

    #[test]
    fn test_class_and_super_refs() {
        let mut image = MemoryImage::new(Architecture::X86_64);
        image.map_zeroed(0x3000, 0x100);
        image.add_section(sections::CLASS_REFS, 0x3000, 0x3010);
        image.add_section(sections::SUPER_REFS, 0x3010, 0x3018);
        image.write_u64(0x3000, 0x3080).unwrap();
        image.write_u64(0x3010, 0x3090).unwrap();

        let mut info = AnalysisInfo::new();
        ClassRefAnalyzer.run(&image, &mut info);

        assert_eq!(info.class_refs.len(), 2);
        assert_eq!(info.class_refs[0].referenced_address, 0x3080);
        assert_eq!(info.class_refs[1].referenced_address, 0);
        assert_eq!(info.super_refs.len(), 1);
        assert_eq!(info.super_refs[0].address, 0x3010);
    }
}
