//! Virtual texture streaming.
//!
//! Streams textures larger than GPU memory by splitting them into fixed-size
//! pages loaded on demand, guided by a GPU-rendered feedback pass that
//! reports which pages are actually visible each frame.
//!
//! Pipeline, load time to frame loop:
//!
//! 1. [`page_file::parse`] reads the on-disk quad-tree metadata into a
//!    [`PageIndex`] (byte ranges for every page of every mip level).
//! 2. Each frame, [`PageResolver::resolve_frame`] reads the feedback target
//!    back and aggregates a [`PageUsageTable`].
//! 3. The external page cache manager turns usage into residency decisions,
//!    issuing blocking [`PageIndex::load_page`] reads from worker tasks.
//! 4. [`IndirectionTable::update`] publishes the resulting residency set to
//!    the GPU sampler, which falls back to a coarser resident mip for any
//!    page that is not (yet) there.
//!
//! The physical page cache, the feedback shader pass and all task scheduling
//! live outside this crate; everything here is either pure data or a thin
//! owner of the two GPU resources involved (feedback target, indirection
//! texture).

pub mod constants;
pub mod error;
pub mod feedback;
pub mod indirection;
pub mod page_file;
pub mod page_index;

pub use error::{VirtualTextureError, VtResult};
pub use feedback::{PageResolver, PageUsageTable};
pub use indirection::{
    IndirectionPool, IndirectionTable, IndirectionTexel, PhysicalSlot, ResidentPage,
};
pub use page_file::{
    parse, MipLevelHeader, PageEntry, PageTableFileBuilder, TexelFormat, VirtualTextureHeader,
};
pub use page_index::{LevelDescriptor, PageId, PageIndex, VirtualTexture};
