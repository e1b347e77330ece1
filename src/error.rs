//! Error handling for the virtual texturing pipeline.
//!
//! A failed page table load means the virtual texture is unavailable, not
//! that the process is doomed; callers are expected to degrade (skip the
//! texture, keep sampling the coarsest resident mip) rather than abort.

/// Result type for virtual texturing operations
pub type VtResult<T> = Result<T, VirtualTextureError>;

/// Errors surfaced by the virtual texturing subsystem
#[derive(Debug, thiserror::Error)]
pub enum VirtualTextureError {
    #[error("bad page table magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("unsupported page table version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("unknown texel format tag {tag}")]
    UnknownFormat { tag: u32 },

    #[error("mip count {found} exceeds the {max}-level quad tree limit")]
    TooManyMips { found: u16, max: usize },

    #[error(
        "level {level} declares a {page_count_x}x{page_count_y} page grid, \
         limit is {max} pages per axis"
    )]
    OversizedLevelGrid {
        level: u16,
        page_count_x: u16,
        page_count_y: u16,
        max: u16,
    },

    #[error("page table metadata truncated: {context}")]
    TruncatedMetadata { context: String },

    #[error(
        "page ({x}, {y}) at level {level} points past the end of the file \
         ({offset} + {size} > {file_len})"
    )]
    EntryOutOfRange {
        x: u16,
        y: u16,
        level: u16,
        offset: u64,
        size: u32,
        file_len: u64,
    },

    #[error("page ({x}, {y}) at level {level} is outside the page table bounds")]
    PageOutOfBounds { x: u8, y: u8, level: u8 },

    #[error("destination buffer holds {available} bytes, page needs {needed}")]
    DestinationTooSmall { needed: usize, available: usize },

    #[error("page table build failed: {context}")]
    InvalidBuild { context: String },

    #[error("feedback readback failed: {reason}")]
    ReadbackFailed { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for VirtualTextureError {
    fn from(err: bincode::Error) -> Self {
        VirtualTextureError::Serialization(err.to_string())
    }
}
