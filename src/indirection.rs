//! Indirection table: publishes page residency to the GPU sampler.
//!
//! The sampler reads one texel per virtual page per level; the texel names
//! the physical atlas slot holding that page plus a fixed-point mip-bias
//! scale. Pages that were never made resident keep their initial texel and
//! the shader walks up to a coarser resident ancestor on its own - no
//! fallback is computed here.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::{Device, Queue, Texture, TextureView};

use crate::constants::indirection::{
    DEFAULT_INDIRECTION_SCALE, INDIRECTION_TABLE_DIMENSION, INDIRECTION_TABLE_MIP_COUNT,
    PAGE_COUNT_PER_LINE,
};
use crate::constants::page_table::MAX_MIP_COUNT;
use crate::error::{VirtualTextureError, VtResult};
use crate::page_index::{level_slices, LevelDescriptor, LevelSlice, PageId};

/// One indirection texture texel: physical atlas coordinate of the resident
/// page (or ancestor) plus the fixed-point mip-bias scale the sampler
/// applies. Uploaded as a single `R32Uint` value.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectionTexel {
    pub phys_x: u8,
    pub phys_y: u8,
    pub scale_high: u8,
    pub scale_low: u8,
}

impl IndirectionTexel {
    pub fn new(phys_x: u8, phys_y: u8, scale: u16) -> Self {
        Self {
            phys_x,
            phys_y,
            scale_high: (scale >> 8) as u8,
            scale_low: (scale & 0xFF) as u8,
        }
    }

    pub fn scale(&self) -> u16 {
        ((self.scale_high as u16) << 8) | self.scale_low as u16
    }
}

impl Default for IndirectionTexel {
    fn default() -> Self {
        Self::new(0, 0, DEFAULT_INDIRECTION_SCALE)
    }
}

/// Physical atlas slot of a resident page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalSlot {
    pub x: u8,
    pub y: u8,
}

/// One entry of the residency set the external page cache manager publishes
/// after servicing a frame's usage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentPage {
    pub id: PageId,
    pub slot: PhysicalSlot,
    pub mip_bias: u16,
}

/// Host-side indirection texel pool, flattened and sliced per level with the
/// same prefix-sum discipline as the page entry pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectionPool {
    levels: Vec<LevelDescriptor>,
    slices: Vec<LevelSlice>,
    texels: Vec<IndirectionTexel>,
}

impl IndirectionPool {
    /// Pool over the given per-level page grids. Grids beyond the 11-level
    /// chain are dropped; every texel starts at the default fallback.
    pub fn new(levels: &[LevelDescriptor]) -> Self {
        let levels = if levels.len() > MAX_MIP_COUNT {
            log::warn!(
                "indirection pool truncated from {} to {} levels",
                levels.len(),
                MAX_MIP_COUNT
            );
            &levels[..MAX_MIP_COUNT]
        } else {
            levels
        };

        let slices = level_slices(levels);
        let total = slices.last().map_or(0, |s| s.start + s.count);
        Self {
            levels: levels.to_vec(),
            slices,
            texels: vec![IndirectionTexel::default(); total],
        }
    }

    /// Pool covering a fully populated quad tree: 128x128 pages at the
    /// finest level, halving per level across the 11-level chain (the
    /// coarsest levels past 1x1 hold zero pages).
    pub fn full_quad_tree() -> Self {
        let mut levels = Vec::with_capacity(INDIRECTION_TABLE_MIP_COUNT as usize);
        let mut pages = PAGE_COUNT_PER_LINE;
        for _ in 0..INDIRECTION_TABLE_MIP_COUNT {
            levels.push(LevelDescriptor {
                page_count_x: pages as u16,
                page_count_y: pages as u16,
            });
            pages >>= 1;
        }
        Self::new(&levels)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn total_texels(&self) -> usize {
        self.texels.len()
    }

    pub fn level(&self, level: u8) -> Option<LevelDescriptor> {
        self.levels.get(level as usize).copied()
    }

    /// `(start, count)` of a level's slice in the flattened pool.
    pub fn level_span(&self, level: u8) -> Option<(usize, usize)> {
        self.slices.get(level as usize).map(|s| (s.start, s.count))
    }

    /// A level's texels, `x + y * page_count_x` ordered.
    pub fn level_texels(&self, level: u8) -> Option<&[IndirectionTexel]> {
        let slice = self.slices.get(level as usize)?;
        Some(&self.texels[slice.start..slice.start + slice.count])
    }

    fn texel_index(&self, id: PageId) -> VtResult<usize> {
        let (x, y, level) = id.decode();
        let out_of_bounds = VirtualTextureError::PageOutOfBounds { x, y, level };

        let descriptor = self.levels.get(level as usize).ok_or(out_of_bounds)?;
        if x as u16 >= descriptor.page_count_x || y as u16 >= descriptor.page_count_y {
            return Err(VirtualTextureError::PageOutOfBounds { x, y, level });
        }

        let slice = self.slices[level as usize];
        Ok(slice.start + x as usize + y as usize * descriptor.page_count_x as usize)
    }

    /// Writes one page's texel, bounds-checked against the level grids.
    pub fn set(&mut self, id: PageId, texel: IndirectionTexel) -> VtResult<()> {
        let index = self.texel_index(id)?;
        self.texels[index] = texel;
        Ok(())
    }

    /// Applies a residency set and reports the touched levels as a bitmask.
    ///
    /// All-or-nothing: the whole set is validated against the level grids
    /// before any texel is written, so a rejected set leaves the pool
    /// untouched and the host pool never diverges from what was uploaded.
    /// Pages absent from the set keep their previous texel. Deterministic in
    /// its input: applying the same set twice leaves the pool byte-identical.
    pub fn apply<I>(&mut self, residency: I) -> VtResult<u16>
    where
        I: IntoIterator<Item = ResidentPage>,
    {
        let residency: Vec<ResidentPage> = residency.into_iter().collect();
        let mut indices = Vec::with_capacity(residency.len());
        for resident in &residency {
            indices.push(self.texel_index(resident.id)?);
        }

        let mut dirty_levels = 0u16;
        for (resident, index) in residency.iter().zip(indices) {
            self.texels[index] =
                IndirectionTexel::new(resident.slot.x, resident.slot.y, resident.mip_bias);
            dirty_levels |= 1 << resident.id.level();
        }
        Ok(dirty_levels)
    }
}

/// GPU indirection texture plus the host pool it is rewritten from.
///
/// Single-threaded by call-site discipline: `update` mutates the host pool
/// and uploads it immediately, so only the render-preparation thread may
/// hold this.
pub struct IndirectionTable {
    queue: Arc<Queue>,
    texture: Texture,
    view: TextureView,
    pool: IndirectionPool,
}

impl IndirectionTable {
    /// Allocates the 11-level `R32Uint` mip chain (2048x2048 base) and
    /// publishes the pool's initial fallback texels to it.
    pub fn new(device: &Device, queue: Arc<Queue>, pool: IndirectionPool) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Page Indirection Table"),
            size: wgpu::Extent3d {
                width: INDIRECTION_TABLE_DIMENSION,
                height: INDIRECTION_TABLE_DIMENSION,
                depth_or_array_layers: 1,
            },
            mip_level_count: INDIRECTION_TABLE_MIP_COUNT,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let table = Self {
            queue,
            texture,
            view,
            pool,
        };
        table.upload(u16::MAX);
        table
    }

    /// Table over a fully populated 128x128-page quad tree.
    pub fn with_full_quad_tree(device: &Device, queue: Arc<Queue>) -> Self {
        Self::new(device, queue, IndirectionPool::full_quad_tree())
    }

    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn view(&self) -> &TextureView {
        &self.view
    }

    pub fn pool(&self) -> &IndirectionPool {
        &self.pool
    }

    /// Rewrites resident pages' texels and uploads the dirtied mip levels.
    ///
    /// A rejected set leaves both the host pool and the texture untouched.
    /// Idempotent: the same residency set twice produces byte-identical host
    /// pool and texture contents.
    pub fn update<I>(&mut self, residency: I) -> VtResult<()>
    where
        I: IntoIterator<Item = ResidentPage>,
    {
        let dirty_levels = self.pool.apply(residency)?;
        self.upload(dirty_levels);
        Ok(())
    }

    fn upload(&self, dirty_levels: u16) {
        for level in 0..self.pool.level_count() {
            if dirty_levels & (1 << level) == 0 {
                continue;
            }
            let Some(descriptor) = self.pool.level(level as u8) else {
                continue;
            };
            let Some(texels) = self.pool.level_texels(level as u8) else {
                continue;
            };
            if texels.is_empty() {
                continue;
            }

            let mip_dimension = (INDIRECTION_TABLE_DIMENSION >> level).max(1);
            let width = (descriptor.page_count_x as u32).min(mip_dimension);
            let height = (descriptor.page_count_y as u32).min(mip_dimension);
            if width != descriptor.page_count_x as u32 || height != descriptor.page_count_y as u32
            {
                log::warn!(
                    "indirection level {} grid {}x{} clamped to mip dimension {}",
                    level,
                    descriptor.page_count_x,
                    descriptor.page_count_y,
                    mip_dimension
                );
            }

            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(texels),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(descriptor.page_count_x as u32 * 4),
                    rows_per_image: Some(descriptor.page_count_y as u32),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }

        log::trace!("indirection upload, dirty level mask {:#06x}", dirty_levels);
    }
}
