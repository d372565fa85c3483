// analyzers/mod.rs - Structure analyzers
//
// Each analyzer walks one metadata section and adds what it decodes to the
// shared `AnalysisInfo`. A missing section contributes nothing. Bad entries
// are skipped with a debug log; nothing here fails the whole binary.

mod cfstring;
mod class;
mod class_ref;
mod selector;

pub use cfstring::StringLiteralAnalyzer;
pub use class::ClassAnalyzer;
pub use class_ref::ClassRefAnalyzer;
pub use selector::SelectorRefAnalyzer;

use std::time::Instant;

use tracing::{debug, info};

use crate::abi::{self, Layout, PointerFormat};
use crate::image::{BinaryImage, ReadError, SectionRange, StructCursor};
use crate::model::AnalysisInfo;

/// A pass over one kind of runtime structure.
pub trait Analyzer {
    fn name(&self) -> &'static str;

    fn run(&self, image: &dyn BinaryImage, info: &mut AnalysisInfo);
}

/// All analyzers, in the order they run.
pub fn default_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(StringLiteralAnalyzer),
        Box::new(SelectorRefAnalyzer),
        Box::new(ClassAnalyzer),
        Box::new(ClassRefAnalyzer),
    ]
}

/// Run every analyzer over `image`.
pub fn analyze(image: &dyn BinaryImage) -> AnalysisInfo {
    let start = Instant::now();
    let mut info = AnalysisInfo::new();

    for analyzer in default_analyzers() {
        analyzer.run(image, &mut info);
        debug!("{} finished", analyzer.name());
    }

    info!(
        "Structures analyzed in {} ms",
        start.elapsed().as_millis()
    );
    info!(
        "Found {} classes, {} methods, {} selector references, {} string literals",
        info.classes.len(),
        info.method_count(),
        info.selector_refs.len(),
        info.string_literals.len()
    );
    info
}

/// Cursor plus the per-image facts every analyzer needs.
pub(crate) struct SectionReader<'a> {
    pub cursor: StructCursor<'a>,
    pub layout: Layout,
    image_base: u64,
    pointer_format: PointerFormat,
}

impl<'a> SectionReader<'a> {
    pub fn new(image: &'a dyn BinaryImage) -> Self {
        Self {
            cursor: StructCursor::new(image),
            layout: Layout::new(image.pointer_width()),
            image_base: image.image_base(),
            pointer_format: image.pointer_format(),
        }
    }

    pub fn image(&self) -> &'a dyn BinaryImage {
        self.cursor.image()
    }

    pub fn pointer_width(&self) -> u64 {
        u64::from(self.layout.pointer_width)
    }

    /// Read the pointer at `address` and resolve any fixup encoding.
    pub fn pointer_at(&mut self, address: u64) -> Result<u64, ReadError> {
        let raw = self.cursor.read_pointer_at(address)?;
        Ok(self.decode(raw))
    }

    /// Read the next pointer and resolve any fixup encoding.
    pub fn next_pointer(&mut self) -> Result<u64, ReadError> {
        let raw = self.cursor.read_pointer()?;
        Ok(self.decode(raw))
    }

    pub fn decode(&self, raw: u64) -> u64 {
        abi::decode_pointer(raw, self.image_base, self.pointer_format)
    }

    pub fn string_at(&mut self, address: u64) -> Result<String, ReadError> {
        self.cursor.read_c_string_at(address)
    }

    /// Slot addresses of a pointer list section.
    pub fn pointer_slots(&self, section: SectionRange) -> impl Iterator<Item = u64> {
        section.slots(self.pointer_width())
    }
}
