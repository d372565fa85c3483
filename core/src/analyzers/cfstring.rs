// analyzers/cfstring.rs - Constant string literal decoding

use tracing::debug;

use super::{Analyzer, SectionReader};
use crate::abi::sections;
use crate::image::{BinaryImage, ReadError};
use crate::model::{AnalysisInfo, StringLiteralInfo};

/// Walks __cfstring: `{isa, flags, data, length}` per literal.
pub struct StringLiteralAnalyzer;

impl Analyzer for StringLiteralAnalyzer {
    fn name(&self) -> &'static str {
        "cfstring"
    }

    fn run(&self, image: &dyn BinaryImage, info: &mut AnalysisInfo) {
        let Some(section) = image.section(sections::CF_STRINGS) else {
            return;
        };
        let mut reader = SectionReader::new(image);
        let stride = reader.layout.cfstring_size();

        for address in section.slots(stride) {
            match read_literal(&mut reader, address) {
                Ok(literal) => info.add_string_literal(literal),
                Err(e) => debug!("Skipping string literal at {:#x}: {}", address, e),
            }
        }
    }
}

fn read_literal(reader: &mut SectionReader, address: u64) -> Result<StringLiteralInfo, ReadError> {
    let layout = reader.layout;
    let data_address = reader.pointer_at(address + layout.cfstring_data())?;
    let size = reader.cursor.read_pointer_at(address + layout.cfstring_length())?;

    Ok(StringLiteralInfo {
        address,
        data_address,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Architecture, MemoryImage};

    #[test]
    fn test_literals_64() {
        let mut image = MemoryImage::new(Architecture::Aarch64);
        image.map_zeroed(0x2000, 0x200);
        image.add_section(sections::CF_STRINGS, 0x2000, 0x2040);
        image.write_u64(0x2010, 0x2100).unwrap();
        image.write_u64(0x2018, 5).unwrap();
        image.write_u64(0x2030, 0x2110).unwrap();
        image.write_u64(0x2038, 11).unwrap();

        let mut info = AnalysisInfo::new();
        StringLiteralAnalyzer.run(&image, &mut info);

        assert_eq!(info.string_literals.len(), 2);
        let second = info.string_literal_at(0x2020).unwrap();
        assert_eq!(second.data_address, 0x2110);
        assert_eq!(second.size, 11);
    }

    #[test]
    fn test_literals_32() {
        let mut image = MemoryImage::new(Architecture::Armv7);
        image.map_zeroed(0x4000, 0x100);
        image.add_section(sections::CF_STRINGS, 0x4000, 0x4010);
        image.write_u32(0x4008, 0x4080).unwrap();
        image.write_u32(0x400c, 3).unwrap();

        let mut info = AnalysisInfo::new();
        StringLiteralAnalyzer.run(&image, &mut info);
        assert_eq!(
            info.string_literals,
            vec![StringLiteralInfo {
                address: 0x4000,
                data_address: 0x4080,
                size: 3
            }]
        );
    }
}
