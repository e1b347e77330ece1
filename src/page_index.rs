//! Runtime page index: id packing, entry lookup, raw page IO.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::constants::feedback::INVALID_PAGE_ID;
use crate::error::{VirtualTextureError, VtResult};
use crate::page_file::{self, PageEntry, VirtualTextureHeader};

/// Identifies one page of a virtual texture.
///
/// Canonical packing: `x` in bits 0..8, `y` in bits 8..16, mip `level` in
/// bits 16..24; bits 24..32 carry the slot index of the registered virtual
/// texture (zero for a bare encode). The feedback pass writes these four
/// bytes into its render target most significant byte first, so the red
/// channel holds the texture slot and the alpha channel holds `x`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct PageId(u32);

impl PageId {
    /// Feedback sentinel: no page was sampled.
    ///
    /// The sentinel shares its bit pattern with page `(255, 255)` at level
    /// 255 on texture slot 255, so that one id can never travel through the
    /// feedback path. See [`PageId::with_texture_slot`].
    pub const INVALID: PageId = PageId(INVALID_PAGE_ID);

    pub const fn encode(x: u8, y: u8, level: u8) -> Self {
        PageId(((level as u32) << 16) | ((y as u32) << 8) | x as u32)
    }

    pub const fn decode(self) -> (u8, u8, u8) {
        (self.x(), self.y(), self.level())
    }

    pub const fn x(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub const fn y(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub const fn level(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub const fn texture_slot(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Stamps the texture slot into bits 24..32.
    ///
    /// Slot 255 on the maximal coordinate `(255, 255, 255)` collides with
    /// [`PageId::INVALID`] and would be dropped by feedback aggregation;
    /// keep registered slot indices below 255.
    pub const fn with_texture_slot(self, slot: u8) -> Self {
        PageId((self.0 & 0x00FF_FFFF) | ((slot as u32) << 24))
    }

    /// Reassembles an id from the four bytes of a feedback texel, most
    /// significant byte first.
    pub const fn from_feedback_bytes(bytes: [u8; 4]) -> Self {
        PageId(
            ((bytes[0] as u32) << 24)
                | ((bytes[1] as u32) << 16)
                | ((bytes[2] as u32) << 8)
                | bytes[3] as u32,
        )
    }

    /// The four bytes the feedback shader writes for this id, most
    /// significant byte first.
    pub const fn to_feedback_bytes(self) -> [u8; 4] {
        [
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == INVALID_PAGE_ID
    }

    pub const fn to_bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        PageId(bits)
    }
}

impl std::fmt::Debug for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            return write!(f, "PageId(INVALID)");
        }
        write!(
            f,
            "PageId(x={}, y={}, level={}, slot={})",
            self.x(),
            self.y(),
            self.level(),
            self.texture_slot()
        )
    }
}

/// Page grid dimensions of one mip level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelDescriptor {
    pub page_count_x: u16,
    pub page_count_y: u16,
}

impl LevelDescriptor {
    pub fn page_count(&self) -> usize {
        self.page_count_x as usize * self.page_count_y as usize
    }
}

/// `(start, count)` view into a flattened per-level pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LevelSlice {
    pub start: usize,
    pub count: usize,
}

/// Prefix-sum slicing over levels in ascending order; a zero-page level
/// contributes an empty slice without shifting its neighbours.
pub(crate) fn level_slices(levels: &[LevelDescriptor]) -> Vec<LevelSlice> {
    let mut slices = Vec::with_capacity(levels.len());
    let mut start = 0;
    for level in levels {
        let count = level.page_count();
        slices.push(LevelSlice { start, count });
        start += count;
    }
    slices
}

/// Parsed page table of one virtual texture.
///
/// Owns the flattened page entry pool; levels are `(start, count)` slices
/// into it, never freestanding pointers. Immutable once parsed.
#[derive(Debug)]
pub struct PageIndex {
    header: VirtualTextureHeader,
    levels: Vec<LevelDescriptor>,
    slices: Vec<LevelSlice>,
    entries: Vec<PageEntry>,
}

impl PageIndex {
    pub(crate) fn with_levels(header: VirtualTextureHeader, levels: &[LevelDescriptor]) -> Self {
        let slices = level_slices(levels);
        let total = slices.last().map_or(0, |s| s.start + s.count);
        Self {
            header,
            levels: levels.to_vec(),
            slices,
            entries: vec![PageEntry::default(); total],
        }
    }

    pub fn header(&self) -> &VirtualTextureHeader {
        &self.header
    }

    pub fn mip_count(&self) -> u16 {
        self.header.mip_count
    }

    pub fn total_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn level(&self, level: u8) -> Option<LevelDescriptor> {
        self.levels.get(level as usize).copied()
    }

    /// All level descriptors in ascending mip order.
    pub fn levels(&self) -> &[LevelDescriptor] {
        &self.levels
    }

    /// `(start, count)` of a level's slice in the flattened entry pool.
    pub fn level_span(&self, level: u8) -> Option<(usize, usize)> {
        self.slices.get(level as usize).map(|s| (s.start, s.count))
    }

    /// A level's entries, `x + y * page_count_x` ordered.
    pub fn level_entries(&self, level: u8) -> Option<&[PageEntry]> {
        let slice = self.slices.get(level as usize)?;
        Some(&self.entries[slice.start..slice.start + slice.count])
    }

    fn entry_index(&self, id: PageId) -> VtResult<usize> {
        let (x, y, level) = id.decode();
        let out_of_bounds = VirtualTextureError::PageOutOfBounds { x, y, level };

        let descriptor = self.levels.get(level as usize).ok_or(out_of_bounds)?;
        if x as u16 >= descriptor.page_count_x || y as u16 >= descriptor.page_count_y {
            return Err(VirtualTextureError::PageOutOfBounds { x, y, level });
        }

        let slice = self.slices[level as usize];
        Ok(slice.start + x as usize + y as usize * descriptor.page_count_x as usize)
    }

    /// Looks up a page's byte range, bounds-checking the decoded coordinate
    /// against the level's page counts before touching the pool.
    pub fn lookup(&self, id: PageId) -> VtResult<PageEntry> {
        Ok(self.entries[self.entry_index(id)?])
    }

    // Fill-pass only; positions come straight from a validated mip header.
    pub(crate) fn set_entry(&mut self, x: u16, y: u16, level: u8, entry: PageEntry) {
        let slice = self.slices[level as usize];
        let descriptor = self.levels[level as usize];
        self.entries[slice.start + x as usize + y as usize * descriptor.page_count_x as usize] =
            entry;
    }

    /// Reads one page's payload bytes into `dest`.
    ///
    /// Synchronous and blocking: the external page cache manager dispatches
    /// this onto a worker so the render thread never waits on disk. The
    /// backing stream is an explicit parameter so ownership and thread-safety
    /// stay visible at the call site.
    pub fn load_page<S: Read + Seek>(
        &self,
        stream: &mut S,
        id: PageId,
        dest: &mut [u8],
    ) -> VtResult<usize> {
        let entry = self.lookup(id)?;
        let size = entry.size_in_bytes as usize;
        if dest.len() < size {
            return Err(VirtualTextureError::DestinationTooSmall {
                needed: size,
                available: dest.len(),
            });
        }

        stream.seek(SeekFrom::Start(entry.offset_in_file))?;
        stream.read_exact(&mut dest[..size])?;
        Ok(size)
    }
}

/// A parsed page index bundled with its backing stream.
///
/// Convenience assembly for the common one-file case; the index itself works
/// against any external `Read + Seek` stream.
pub struct VirtualTexture<S = File> {
    index: PageIndex,
    stream: S,
}

impl VirtualTexture<File> {
    /// Opens and parses a virtual texture file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> VtResult<Self> {
        let mut file = File::open(path.as_ref())?;
        let index = page_file::parse(&mut file)?;
        log::info!(
            "opened virtual texture {} ({} mips, {} pages)",
            path.as_ref().display(),
            index.mip_count(),
            index.total_entries()
        );
        Ok(Self { index, stream: file })
    }
}

impl<S: Read + Seek> VirtualTexture<S> {
    pub fn from_stream(mut stream: S) -> VtResult<Self> {
        let index = page_file::parse(&mut stream)?;
        Ok(Self { index, stream })
    }

    pub fn index(&self) -> &PageIndex {
        &self.index
    }

    /// Blocking raw page read through the owned stream.
    pub fn load_page(&mut self, id: PageId, dest: &mut [u8]) -> VtResult<usize> {
        self.index.load_page(&mut self.stream, id, dest)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::page_file::{PageTableFileBuilder, TexelFormat};

    #[test]
    fn page_id_roundtrips_each_axis() {
        for v in 0..=255u8 {
            assert_eq!(PageId::encode(v, 0, 0).decode(), (v, 0, 0));
            assert_eq!(PageId::encode(0, v, 0).decode(), (0, v, 0));
            assert_eq!(PageId::encode(0, 0, v).decode(), (0, 0, v));
        }
    }

    #[test]
    fn page_id_roundtrips_across_the_domain() {
        for level in [0u8, 1, 5, 10, 127, 255] {
            for y in 0..=255u8 {
                for x in 0..=255u8 {
                    let id = PageId::encode(x, y, level);
                    assert_eq!(id.decode(), (x, y, level));
                }
            }
        }
    }

    #[test]
    fn page_id_texture_slot_is_preserved() {
        let id = PageId::encode(3, 7, 2).with_texture_slot(9);
        assert_eq!(id.texture_slot(), 9);
        assert_eq!(id.decode(), (3, 7, 2));
    }

    #[test]
    fn page_id_feedback_bytes_are_msb_first() {
        let id = PageId::from_feedback_bytes([0x01, 0x02, 0x03, 0x04]);
        assert_eq!(id.to_bits(), 0x0102_0304);
        assert_eq!(id.texture_slot(), 0x01);
        assert_eq!(id.level(), 0x02);
        assert_eq!(id.y(), 0x03);
        assert_eq!(id.x(), 0x04);
        assert_eq!(id.to_feedback_bytes(), [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn sentinel_decodes_as_invalid() {
        assert!(PageId::from_feedback_bytes([0xFF; 4]).is_invalid());
        assert!(!PageId::encode(255, 255, 255).is_invalid());
        // Slot 255 on the maximal coordinate aliases the sentinel.
        assert!(PageId::encode(255, 255, 255)
            .with_texture_slot(255)
            .is_invalid());
        assert!(!PageId::encode(255, 255, 255)
            .with_texture_slot(254)
            .is_invalid());
    }

    fn small_index() -> PageIndex {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 4, 120, 128);
        builder.begin_level(128, 128, 2, 2).expect("level 0");
        for seed in 10..14u8 {
            builder.push_page(&vec![seed; 16]).expect("page");
        }
        builder.begin_level(64, 64, 1, 1).expect("level 1");
        builder.push_page(&[99; 16]).expect("page");

        let bytes = builder.to_bytes().expect("serialize");
        page_file::parse(&mut Cursor::new(bytes)).expect("parse")
    }

    #[test]
    fn lookup_rejects_out_of_bounds_pages() {
        let index = small_index();

        assert!(index.lookup(PageId::encode(1, 1, 0)).is_ok());
        assert!(matches!(
            index.lookup(PageId::encode(2, 0, 0)),
            Err(VirtualTextureError::PageOutOfBounds { x: 2, y: 0, level: 0 })
        ));
        assert!(matches!(
            index.lookup(PageId::encode(0, 2, 0)),
            Err(VirtualTextureError::PageOutOfBounds { .. })
        ));
        assert!(matches!(
            index.lookup(PageId::encode(0, 0, 2)),
            Err(VirtualTextureError::PageOutOfBounds { level: 2, .. })
        ));
    }

    #[test]
    fn load_page_reads_exactly_the_entry_range() {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 4, 120, 128);
        builder.begin_level(128, 128, 2, 1).expect("level");
        builder.push_page(&[0x11; 32]).expect("page");
        builder.push_page(&[0x22; 48]).expect("page");

        let bytes = builder.to_bytes().expect("serialize");
        let mut texture =
            VirtualTexture::from_stream(Cursor::new(bytes)).expect("from_stream");

        let mut dest = vec![0u8; 64];
        let read = texture
            .load_page(PageId::encode(1, 0, 0), &mut dest)
            .expect("load_page");
        assert_eq!(read, 48);
        assert!(dest[..48].iter().all(|&b| b == 0x22));

        let mut tiny = vec![0u8; 8];
        assert!(matches!(
            texture.load_page(PageId::encode(0, 0, 0), &mut tiny),
            Err(VirtualTextureError::DestinationTooSmall {
                needed: 32,
                available: 8
            })
        ));
    }

    #[test]
    fn level_slices_skip_zero_page_levels() {
        let levels = [
            LevelDescriptor { page_count_x: 2, page_count_y: 2 },
            LevelDescriptor { page_count_x: 0, page_count_y: 5 },
            LevelDescriptor { page_count_x: 1, page_count_y: 1 },
        ];
        let slices = level_slices(&levels);
        assert_eq!((slices[0].start, slices[0].count), (0, 4));
        assert_eq!((slices[1].start, slices[1].count), (4, 0));
        assert_eq!((slices[2].start, slices[2].count), (4, 1));
    }
}
