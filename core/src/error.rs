use thiserror::Error;

/// Error taxonomy for the NTFS parsing engine.
///
/// Most decode failures do not produce an `Err` at all — they collapse into an
/// "invalid" marker on the decoded value, per the core's failure-semantics
/// discipline. These variants are reserved for the few call sites that short
/// circuit: volume open, and explicit range reads.
#[derive(Debug, Error)]
pub enum NtfsError {
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("corrupt structure: {0}")]
    CorruptStructure(String),

    #[error("range request out of bounds: offset {offset}, length {length}")]
    RangeRequest { offset: u64, length: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("fixup mismatch in file record {frn}")]
    FixupMismatch { frn: u64 },

    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),
}
