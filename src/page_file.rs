//! On-disk page table format: loader and writer.
//!
//! A virtual texture file is a fixed header, then one `MipLevelHeader` per
//! mip level followed immediately by that level's page entry records, then
//! the raw page payload blob. Entry offsets are absolute file offsets; the
//! payload layout itself is opaque to this subsystem.
//!
//! The records below are read and written with bincode's fixed-int
//! little-endian encoding, which is byte-identical to the packed on-disk
//! layout (24-byte header, 12-byte mip headers and entries).

use std::io::{Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::constants::page_table::{
    MAX_MIP_COUNT, MAX_PAGE_COUNT_PER_AXIS, PAGE_TABLE_MAGIC, PAGE_TABLE_VERSION,
};
use crate::error::{VirtualTextureError, VtResult};
use crate::page_index::{LevelDescriptor, PageIndex};

/// Texel format of the page payloads.
///
/// Stored as a raw `u32` tag in the file header. Decoding page payloads is
/// the renderer's business; the tag is only validated and carried through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TexelFormat {
    Rgba8 = 0,
    Rgba16Float = 1,
    Bc1 = 2,
    Bc3 = 3,
    Bc5 = 4,
}

impl TexelFormat {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(TexelFormat::Rgba8),
            1 => Some(TexelFormat::Rgba16Float),
            2 => Some(TexelFormat::Bc1),
            3 => Some(TexelFormat::Bc3),
            4 => Some(TexelFormat::Bc5),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Fixed file header.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VirtualTextureHeader {
    pub magic: u32,
    pub version: u32,
    pub format: u32,
    pub mip_count: u16,
    pub border_size: u16,
    pub dimension_borderless: u32,
    pub dimension: u32,
}

impl VirtualTextureHeader {
    /// Encoded size in bytes.
    pub const SIZE: u64 = 24;

    pub fn texel_format(&self) -> Option<TexelFormat> {
        TexelFormat::from_tag(self.format)
    }
}

/// Per-level metadata preceding that level's page entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MipLevelHeader {
    pub width: u32,
    pub height: u32,
    pub page_count_x: u16,
    pub page_count_y: u16,
}

impl MipLevelHeader {
    /// Encoded size in bytes.
    pub const SIZE: u64 = 12;
}

/// One page's location inside the backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub offset_in_file: u64,
    pub size_in_bytes: u32,
}

impl PageEntry {
    /// Encoded size in bytes.
    pub const SIZE: u64 = 12;
}

/// Parses a page table stream into a [`PageIndex`].
///
/// Two passes over the metadata: discovery records each level's page counts
/// (seeking past the entry records) so the flattened entry pool can be sized
/// up front, then the fill pass rewinds and decodes every entry into its
/// level slice. A bad magic or any malformed metadata aborts the load; the
/// caller should treat the virtual texture as unavailable, nothing more.
pub fn parse<S: Read + Seek>(stream: &mut S) -> VtResult<PageIndex> {
    let file_len = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(0))?;

    let header: VirtualTextureHeader =
        bincode::deserialize_from(&mut *stream).map_err(|err| {
            VirtualTextureError::TruncatedMetadata {
                context: format!("file header: {}", err),
            }
        })?;

    if header.magic != PAGE_TABLE_MAGIC {
        return Err(VirtualTextureError::BadMagic {
            found: header.magic,
            expected: PAGE_TABLE_MAGIC,
        });
    }
    if header.version != PAGE_TABLE_VERSION {
        return Err(VirtualTextureError::UnsupportedVersion {
            found: header.version,
            expected: PAGE_TABLE_VERSION,
        });
    }
    if header.texel_format().is_none() {
        return Err(VirtualTextureError::UnknownFormat { tag: header.format });
    }
    if header.mip_count as usize > MAX_MIP_COUNT {
        return Err(VirtualTextureError::TooManyMips {
            found: header.mip_count,
            max: MAX_MIP_COUNT,
        });
    }

    let metadata_begin = stream.stream_position()?;

    // Discovery pass: page counts only, skipping each level's entry block.
    let mut levels = Vec::with_capacity(header.mip_count as usize);
    for level in 0..header.mip_count {
        let mip: MipLevelHeader = bincode::deserialize_from(&mut *stream).map_err(|err| {
            VirtualTextureError::TruncatedMetadata {
                context: format!("mip header {}: {}", level, err),
            }
        })?;

        // Coordinates pack into one byte each; a wider grid would hold pages
        // no id can address, and the pool allocation must not be sized from
        // an unbounded header field.
        if mip.page_count_x > MAX_PAGE_COUNT_PER_AXIS || mip.page_count_y > MAX_PAGE_COUNT_PER_AXIS
        {
            return Err(VirtualTextureError::OversizedLevelGrid {
                level,
                page_count_x: mip.page_count_x,
                page_count_y: mip.page_count_y,
                max: MAX_PAGE_COUNT_PER_AXIS,
            });
        }

        let entry_count = mip.page_count_x as u64 * mip.page_count_y as u64;
        stream.seek(SeekFrom::Current((entry_count * PageEntry::SIZE) as i64))?;

        levels.push(LevelDescriptor {
            page_count_x: mip.page_count_x,
            page_count_y: mip.page_count_y,
        });
    }

    let mut index = PageIndex::with_levels(header, &levels);

    // Fill pass: rewind to just past the file header and decode every entry
    // in x + y * page_count_x order.
    stream.seek(SeekFrom::Start(metadata_begin))?;
    for level in 0..header.mip_count {
        let mip: MipLevelHeader = bincode::deserialize_from(&mut *stream).map_err(|err| {
            VirtualTextureError::TruncatedMetadata {
                context: format!("mip header {}: {}", level, err),
            }
        })?;

        for y in 0..mip.page_count_y {
            for x in 0..mip.page_count_x {
                let entry: PageEntry =
                    bincode::deserialize_from(&mut *stream).map_err(|err| {
                        VirtualTextureError::TruncatedMetadata {
                            context: format!(
                                "page entry ({}, {}) at level {}: {}",
                                x, y, level, err
                            ),
                        }
                    })?;

                let end = entry
                    .offset_in_file
                    .checked_add(entry.size_in_bytes as u64);
                if end.map_or(true, |end| end > file_len) {
                    return Err(VirtualTextureError::EntryOutOfRange {
                        x,
                        y,
                        level,
                        offset: entry.offset_in_file,
                        size: entry.size_in_bytes,
                        file_len,
                    });
                }

                index.set_entry(x, y, level as u8, entry);
            }
        }
    }

    log::debug!(
        "parsed page table: {} mips, {} entries, base dimension {}",
        header.mip_count,
        index.total_entries(),
        header.dimension
    );

    Ok(index)
}

struct BuilderLevel {
    width: u32,
    height: u32,
    page_count_x: u16,
    page_count_y: u16,
    payloads: Vec<Vec<u8>>,
}

/// Builds a page table file: metadata block first, payload blob after.
///
/// Pages are appended level by level in `x + y * page_count_x` order, the
/// same order the fill pass reads entries back in. Entry offsets into the
/// payload blob are computed when the file is written.
pub struct PageTableFileBuilder {
    format: TexelFormat,
    border_size: u16,
    dimension_borderless: u32,
    dimension: u32,
    levels: Vec<BuilderLevel>,
}

impl PageTableFileBuilder {
    pub fn new(
        format: TexelFormat,
        border_size: u16,
        dimension_borderless: u32,
        dimension: u32,
    ) -> Self {
        Self {
            format,
            border_size,
            dimension_borderless,
            dimension,
            levels: Vec::new(),
        }
    }

    /// Opens the next (finer-to-coarser) mip level.
    pub fn begin_level(
        &mut self,
        width: u32,
        height: u32,
        page_count_x: u16,
        page_count_y: u16,
    ) -> VtResult<()> {
        if self.levels.len() >= MAX_MIP_COUNT {
            return Err(VirtualTextureError::TooManyMips {
                found: self.levels.len() as u16 + 1,
                max: MAX_MIP_COUNT,
            });
        }
        if page_count_x > MAX_PAGE_COUNT_PER_AXIS || page_count_y > MAX_PAGE_COUNT_PER_AXIS {
            return Err(VirtualTextureError::OversizedLevelGrid {
                level: self.levels.len() as u16,
                page_count_x,
                page_count_y,
                max: MAX_PAGE_COUNT_PER_AXIS,
            });
        }

        self.levels.push(BuilderLevel {
            width,
            height,
            page_count_x,
            page_count_y,
            payloads: Vec::with_capacity(page_count_x as usize * page_count_y as usize),
        });
        Ok(())
    }

    /// Appends the next page payload of the currently open level.
    pub fn push_page(&mut self, payload: &[u8]) -> VtResult<()> {
        let level = self.levels.last_mut().ok_or_else(|| {
            VirtualTextureError::InvalidBuild {
                context: "push_page before begin_level".to_string(),
            }
        })?;

        let capacity = level.page_count_x as usize * level.page_count_y as usize;
        if level.payloads.len() >= capacity {
            return Err(VirtualTextureError::InvalidBuild {
                context: format!(
                    "level {} already holds its {} pages",
                    self.levels.len() - 1,
                    capacity
                ),
            });
        }
        if payload.len() > u32::MAX as usize {
            return Err(VirtualTextureError::InvalidBuild {
                context: format!("page payload of {} bytes overflows u32", payload.len()),
            });
        }

        level.payloads.push(payload.to_vec());
        Ok(())
    }

    fn metadata_size(&self) -> u64 {
        let mut size = VirtualTextureHeader::SIZE;
        for level in &self.levels {
            let count = level.page_count_x as u64 * level.page_count_y as u64;
            size += MipLevelHeader::SIZE + count * PageEntry::SIZE;
        }
        size
    }

    /// Writes the complete file.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> VtResult<()> {
        for (index, level) in self.levels.iter().enumerate() {
            let expected = level.page_count_x as usize * level.page_count_y as usize;
            if level.payloads.len() != expected {
                return Err(VirtualTextureError::InvalidBuild {
                    context: format!(
                        "level {} holds {} pages, declared {}",
                        index,
                        level.payloads.len(),
                        expected
                    ),
                });
            }
        }

        let header = VirtualTextureHeader {
            magic: PAGE_TABLE_MAGIC,
            version: PAGE_TABLE_VERSION,
            format: self.format.tag(),
            mip_count: self.levels.len() as u16,
            border_size: self.border_size,
            dimension_borderless: self.dimension_borderless,
            dimension: self.dimension,
        };
        bincode::serialize_into(&mut *writer, &header)?;

        // Payloads land right after the metadata block; entries carry
        // absolute offsets into that blob.
        let mut payload_cursor = self.metadata_size();
        for level in &self.levels {
            let mip = MipLevelHeader {
                width: level.width,
                height: level.height,
                page_count_x: level.page_count_x,
                page_count_y: level.page_count_y,
            };
            bincode::serialize_into(&mut *writer, &mip)?;

            for payload in &level.payloads {
                let entry = PageEntry {
                    offset_in_file: payload_cursor,
                    size_in_bytes: payload.len() as u32,
                };
                bincode::serialize_into(&mut *writer, &entry)?;
                payload_cursor += payload.len() as u64;
            }
        }

        for level in &self.levels {
            for payload in &level.payloads {
                writer.write_all(payload)?;
            }
        }

        Ok(())
    }

    /// Writes the complete file into a fresh byte vector.
    pub fn to_bytes(&self) -> VtResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.metadata_size() as usize);
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::page_index::PageId;

    fn two_level_builder() -> PageTableFileBuilder {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 4, 248, 256);
        builder.begin_level(256, 256, 2, 2).expect("level 0");
        for seed in 0..4u8 {
            builder.push_page(&vec![seed; 64]).expect("level 0 page");
        }
        builder.begin_level(128, 128, 1, 1).expect("level 1");
        builder.push_page(&[0xAB; 64]).expect("level 1 page");
        builder
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut bytes = two_level_builder().to_bytes().expect("serialize");
        bytes[0] = 0xDE;

        match parse(&mut Cursor::new(bytes)) {
            Err(VirtualTextureError::BadMagic { expected, .. }) => {
                assert_eq!(expected, PAGE_TABLE_MAGIC);
            }
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn parse_rejects_unknown_format() {
        let mut bytes = two_level_builder().to_bytes().expect("serialize");
        // Format tag is the third u32 of the header.
        bytes[8..12].copy_from_slice(&0xFFu32.to_le_bytes());

        assert!(matches!(
            parse(&mut Cursor::new(bytes)),
            Err(VirtualTextureError::UnknownFormat { tag: 0xFF })
        ));
    }

    #[test]
    fn parse_rejects_grid_wider_than_the_id_domain() {
        let mut bytes = two_level_builder().to_bytes().expect("serialize");
        // page_count_x of the first mip header, right after the file header.
        let offset = VirtualTextureHeader::SIZE as usize + 8;
        bytes[offset..offset + 2].copy_from_slice(&300u16.to_le_bytes());

        assert!(matches!(
            parse(&mut Cursor::new(bytes)),
            Err(VirtualTextureError::OversizedLevelGrid {
                level: 0,
                page_count_x: 300,
                ..
            })
        ));
    }

    #[test]
    fn builder_rejects_grid_wider_than_the_id_domain() {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 0, 16, 16);

        assert!(builder.begin_level(16, 16, 256, 256).is_ok());
        assert!(matches!(
            builder.begin_level(16, 16, 300, 1),
            Err(VirtualTextureError::OversizedLevelGrid { level: 1, .. })
        ));
    }

    #[test]
    fn parse_rejects_truncated_metadata() {
        let bytes = two_level_builder().to_bytes().expect("serialize");
        let truncated = bytes[..VirtualTextureHeader::SIZE as usize + 6].to_vec();

        assert!(matches!(
            parse(&mut Cursor::new(truncated)),
            Err(VirtualTextureError::TruncatedMetadata { .. })
        ));
    }

    #[test]
    fn parse_rejects_entry_past_end_of_file() {
        let bytes = two_level_builder().to_bytes().expect("serialize");
        // Drop the last payload byte so the final entry overruns the file.
        let short = bytes[..bytes.len() - 1].to_vec();

        assert!(matches!(
            parse(&mut Cursor::new(short)),
            Err(VirtualTextureError::EntryOutOfRange { .. })
        ));
    }

    #[test]
    fn zero_page_level_contributes_no_entries() {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Bc1, 0, 64, 64);
        builder.begin_level(64, 64, 2, 1).expect("level 0");
        builder.push_page(&[1; 8]).expect("page");
        builder.push_page(&[2; 8]).expect("page");
        builder.begin_level(32, 32, 0, 3).expect("level 1");
        builder.begin_level(16, 16, 1, 1).expect("level 2");
        builder.push_page(&[3; 8]).expect("page");

        let bytes = builder.to_bytes().expect("serialize");
        let index = parse(&mut Cursor::new(bytes)).expect("parse");

        assert_eq!(index.total_entries(), 3);
        assert_eq!(index.level_span(1), Some((2, 0)));
        // Level 2's slice is not shifted by the empty level.
        assert_eq!(index.level_span(2), Some((2, 1)));

        let entry = index.lookup(PageId::encode(0, 0, 2)).expect("lookup");
        assert_eq!(entry.size_in_bytes, 8);
    }

    #[test]
    fn builder_rejects_overfull_level() {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 0, 16, 16);
        builder.begin_level(16, 16, 1, 1).expect("level");
        builder.push_page(&[0; 4]).expect("page");

        assert!(matches!(
            builder.push_page(&[0; 4]),
            Err(VirtualTextureError::InvalidBuild { .. })
        ));
    }

    #[test]
    fn builder_rejects_undeclared_pages() {
        let mut builder = PageTableFileBuilder::new(TexelFormat::Rgba8, 0, 16, 16);
        builder.begin_level(16, 16, 2, 2).expect("level");
        builder.push_page(&[0; 4]).expect("page");

        assert!(matches!(
            builder.to_bytes(),
            Err(VirtualTextureError::InvalidBuild { .. })
        ));
    }
}
