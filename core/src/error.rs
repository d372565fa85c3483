// error.rs - Error types
//
// Read failures on individual structures are recovered inside the analyzers;
// only whole-image problems surface through `Error`.

use thiserror::Error;

/// Error type for loading and analyzing an image.
#[derive(Error, Debug)]
pub enum Error {
    /// The container could not be parsed.
    #[error("failed to parse image: {0}")]
    Parse(#[from] goblin::error::Error),

    /// The input is some other kind of object file.
    #[error("not a Mach-O image")]
    NotMachO,

    /// A fat binary has no slice for the requested architecture.
    #[error("no slice for architecture '{0}' in fat binary")]
    MissingSlice(String),

    /// Structure analysis faulted and was abandoned.
    #[error("structure analysis failed: {0}")]
    Analysis(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
