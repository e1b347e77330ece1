//! Feedback resolution: rendered feedback buffer to per-frame page usage.
//!
//! The external feedback pass renders one packed [`PageId`] per texel into a
//! small RGBA8-uint target. Each frame the resolver reads that target back
//! and aggregates it into a [`PageUsageTable`] for the external page cache
//! manager. Usage is advisory: a page counted here may already be evicted by
//! the time it is sampled, and the sampler degrades to a coarser resident
//! mip rather than fault.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use wgpu::{Device, Queue, Texture, TextureView};

use crate::constants::feedback::{
    FEEDBACK_BYTES_PER_TEXEL, FEEDBACK_TARGET_HEIGHT, FEEDBACK_TARGET_WIDTH,
};
use crate::error::{VirtualTextureError, VtResult};
use crate::page_index::PageId;

/// Per-frame table of how many feedback samples referenced each page.
///
/// Built fresh each frame and handed to the cache manager; carries no
/// cross-frame state.
#[derive(Debug, Clone)]
pub struct PageUsageTable {
    counts: FxHashMap<PageId, u32>,
    authoritative: bool,
}

impl Default for PageUsageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageUsageTable {
    pub fn new() -> Self {
        Self {
            counts: FxHashMap::default(),
            authoritative: true,
        }
    }

    /// Table returned when the readback could not complete. Carries no
    /// samples and must be read as "no new information", never as "nothing
    /// is needed" - treating it as zero demand would evict the world.
    pub fn stale() -> Self {
        Self {
            counts: FxHashMap::default(),
            authoritative: false,
        }
    }

    /// False when this frame's readback was skipped and the table holds no
    /// information.
    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Number of distinct pages referenced this frame.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, id: PageId) -> u32 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn record(&mut self, id: PageId) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageId, u32)> + '_ {
        self.counts.iter().map(|(&id, &n)| (id, n))
    }

    /// Aggregates a host-side feedback buffer: 4 bytes per texel assembled
    /// most significant byte first, sentinel texels skipped entirely.
    pub fn from_feedback(texels: &[u8]) -> Self {
        let mut table = Self::new();
        for texel in texels.chunks_exact(FEEDBACK_BYTES_PER_TEXEL as usize) {
            let id = PageId::from_feedback_bytes([texel[0], texel[1], texel[2], texel[3]]);
            if id.is_invalid() {
                continue;
            }
            table.record(id);
        }
        table
    }

    /// Pages in the order the cache manager should service them: coarser
    /// mips first, ties broken by reference count, then by id for a stable
    /// order.
    pub fn sorted_requests(&self) -> Vec<PageId> {
        let mut pages: Vec<(PageId, u32)> = self.iter().collect();
        pages.sort_unstable_by(|a, b| {
            b.0.level()
                .cmp(&a.0.level())
                .then(b.1.cmp(&a.1))
                .then(a.0.to_bits().cmp(&b.0.to_bits()))
        });
        pages.into_iter().map(|(id, _)| id).collect()
    }
}

/// Owns the feedback render target and resolves it into a usage table once
/// per frame. Stateless across frames: no residency memory of its own.
pub struct PageResolver {
    device: Arc<Device>,
    queue: Arc<Queue>,
    feedback_target: Texture,
    feedback_view: TextureView,
    readback_buffer: wgpu::Buffer,
    host_texels: Vec<u8>,
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
}

impl PageResolver {
    /// Resolver at the default 256x128 feedback resolution.
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self::with_resolution(device, queue, FEEDBACK_TARGET_WIDTH, FEEDBACK_TARGET_HEIGHT)
    }

    pub fn with_resolution(
        device: Arc<Device>,
        queue: Arc<Queue>,
        width: u32,
        height: u32,
    ) -> Self {
        let feedback_target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Feedback Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Uint,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let feedback_view = feedback_target.create_view(&wgpu::TextureViewDescriptor::default());

        // Buffer copies need 256-byte aligned rows; the host buffer stays
        // tightly packed.
        let unpadded_bytes_per_row = width * FEEDBACK_BYTES_PER_TEXEL;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Feedback Readback"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device,
            queue,
            feedback_target,
            feedback_view,
            readback_buffer,
            host_texels: vec![0; (unpadded_bytes_per_row * height) as usize],
            width,
            height,
            padded_bytes_per_row,
        }
    }

    /// Render target the external feedback pass draws into.
    pub fn feedback_target(&self) -> &Texture {
        &self.feedback_target
    }

    pub fn feedback_view(&self) -> &TextureView {
        &self.feedback_view
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Reads the feedback target back and aggregates this frame's page
    /// usage. Ownership of the table passes to the caller.
    ///
    /// The readback is a synchronous GPU to CPU stall. An implementation
    /// hiding it behind an N-frame buffered readback must tell the cache
    /// manager about the added staleness window; this one does not add any.
    /// If the readback cannot complete, aggregation is skipped and a stale
    /// table is returned instead.
    pub fn resolve_frame(&mut self) -> PageUsageTable {
        match self.readback() {
            Ok(()) => PageUsageTable::from_feedback(&self.host_texels),
            Err(err) => {
                log::warn!("feedback readback failed, page usage is stale: {}", err);
                PageUsageTable::stale()
            }
        }
    }

    fn readback(&mut self) -> VtResult<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Feedback Readback"),
            });

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.feedback_target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = self.readback_buffer.slice(..);
        let (tx, rx) = flume::bounded(1);
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| VirtualTextureError::ReadbackFailed {
                reason: "map callback dropped".to_string(),
            })?
            .map_err(|err| VirtualTextureError::ReadbackFailed {
                reason: err.to_string(),
            })?;

        {
            let data = buffer_slice.get_mapped_range();
            let unpadded = (self.width * FEEDBACK_BYTES_PER_TEXEL) as usize;
            for (row, padded) in data
                .chunks_exact(self.padded_bytes_per_row as usize)
                .enumerate()
            {
                self.host_texels[row * unpadded..(row + 1) * unpadded]
                    .copy_from_slice(&padded[..unpadded]);
            }
        }
        self.readback_buffer.unmap();

        Ok(())
    }
}
