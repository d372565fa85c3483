// objc-lift - Objective-C metadata recovery and call-site rewriting
//
// This library recovers the Objective-C runtime metadata of a Mach-O image
// and uses it to turn dynamic message sends into direct calls.
//
// # Architecture
//
// Work is split into two phases:
//
// 1. **Structure analysis** (`analyzers/`): Walk __objc_classlist,
//    __objc_selrefs, __cfstring, __objc_classrefs and __objc_superrefs
//    through a `BinaryImage` and collect an `AnalysisInfo`
// 2. **Function rewriting** (`rewrite.rs`): For each lifted function, build
//    SSA (`il/ssa.rs`), propagate constants and replace
//      - objc_msgSend calls with a known selector by direct calls
//      - ARC runtime calls by nothing (or a return, in tail position)
//      - constant string literal addresses by CFSTR intrinsics
//
// Supporting pieces:
// - `macho.rs` loads thin and fat Mach-O files with goblin
// - `dispatch.rs` finds the msgSend and ARC entry points, including stubs
//   that only get symbols after a first pass
// - `session.rs` runs analysis once per binary and shares the result
// - `annotate.rs` pushes the recovered records to a host as symbols,
//   typed data and cross references
//
// # Pointers
//
// Pointers stored in metadata may use chained-fixup encodings. The image
// reports its `abi::PointerFormat` and every pointer read by the analyzers
// goes through `abi::decode_pointer` with it; binds to other images read
// as null.

pub mod abi;
pub mod analyzers;
pub mod annotate;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod il;
pub mod image;
pub mod macho;
pub mod model;
pub mod rewrite;
pub mod session;

pub use abi::PointerFormat;
pub use config::Settings;
pub use dispatch::{DispatchResolver, Readiness};
pub use error::{Error, Result};
pub use il::{Expr, Function, Instruction};
pub use image::{Architecture, BinaryImage, MemoryImage};
pub use macho::MachOImage;
pub use model::AnalysisInfo;
pub use rewrite::{RewriteReport, rewrite_function};
pub use session::{Registry, SessionId};

/// Recover the Objective-C metadata of a Mach-O file
pub fn analyze_binary(data: &[u8], arch: Option<&str>) -> Result<AnalysisInfo> {
    // Parse Mach-O
    let image = MachOImage::parse(data, arch)?;

    // Walk the metadata sections
    Ok(analyzers::analyze(&image))
}
