// Virtual texturing constants - single source of truth
//
// The feedback shader pass and the indirection sampler read the same packed
// layouts these constants describe; keep CPU and GPU code in agreement.

/// On-disk page table format
pub mod page_table {
    /// Magic identifying a virtual texture page table file.
    pub const PAGE_TABLE_MAGIC: u32 = 0x00FF00FF;

    /// Current page table file version.
    pub const PAGE_TABLE_VERSION: u32 = 1;

    /// Maximum mip levels a page table may declare (quad tree down to a
    /// single page).
    pub const MAX_MIP_COUNT: usize = 11;

    /// Maximum pages per axis of one level. Page coordinates are packed
    /// into one byte each, so a wider grid would hold pages no id can
    /// address; the cap also keeps entry pool sizing off untrusted headers.
    pub const MAX_PAGE_COUNT_PER_AXIS: u16 = 256;
}

/// Feedback render target
pub mod feedback {
    /// Sentinel feedback value meaning "no page sampled here".
    pub const INVALID_PAGE_ID: u32 = 0xFFFF_FFFF;

    /// Default feedback render target resolution.
    pub const FEEDBACK_TARGET_WIDTH: u32 = 256;
    pub const FEEDBACK_TARGET_HEIGHT: u32 = 128;

    /// Bytes per feedback texel (RGBA8, one packed page id).
    pub const FEEDBACK_BYTES_PER_TEXEL: u32 = 4;
}

/// Indirection table
pub mod indirection {
    /// Indirection texture dimension at mip 0.
    pub const INDIRECTION_TABLE_DIMENSION: u32 = 2048;

    /// Mip chain length of the indirection texture.
    pub const INDIRECTION_TABLE_MIP_COUNT: u32 = 11;

    /// Page grid side at the finest level of a fully populated quad tree.
    pub const PAGE_COUNT_PER_LINE: u32 = 128;

    /// Fixed-point units per page line used by the sampler's mip-bias scale.
    pub const SCALE_UNITS_PER_PAGE: u32 = 16;

    /// Scale written to freshly initialized indirection texels; points every
    /// page at the coarsest fallback with a half-range bias.
    pub const DEFAULT_INDIRECTION_SCALE: u16 =
        ((PAGE_COUNT_PER_LINE * SCALE_UNITS_PER_PAGE) >> 1) as u16;
}
