//! Compute-based mip chain generation.
//!
//! Levels are produced in batches of up to four. Each batch reads one source
//! level through a shader-resource view and writes its levels through storage
//! views; both live in slots the generator reserves once and rewrites. The
//! first level of a batch filters the source according to its width/height
//! parity; every deeper level averages 2x2 texels of the level above it (2x1
//! once an axis is one texel wide), so a batch only spans levels that halve
//! evenly.
//!
//! Batches run on the compute queue and are waited on one at a time. This is
//! a load-time path.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::context::RecordingContext;
use crate::device::Device;
use crate::hal::{
    ComputePipelineDesc, ComputeProgram, Format, ResourceState, ShaderEnv, ThreadIds,
    linear_to_srgb, mip_extent, read_buffer,
};
use crate::pipeline::PipelineState;
use crate::resource::{Buffer, BufferDesc, BufferUsage, Texture, TextureUsage};

/// Storage views a single dispatch may write.
pub const MAX_MIPS_PER_BATCH: u32 = 4;

/// Edge length of the generator's thread group.
pub const GROUP_SIZE: u32 = 8;

/// Parity of the source level, which decides how many taps a destination
/// texel needs along each axis.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum DimensionType {
    HeightWidthEven = 0,
    HeightEvenWidthOdd = 1,
    HeightOddWidthEven = 2,
    HeightWidthOdd = 3,
}

impl DimensionType {
    pub fn of(width: u32, height: u32) -> Self {
        match (height & 1 == 1, width & 1 == 1) {
            (false, false) => DimensionType::HeightWidthEven,
            (false, true) => DimensionType::HeightEvenWidthOdd,
            (true, false) => DimensionType::HeightOddWidthEven,
            (true, true) => DimensionType::HeightWidthOdd,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw & 3 {
            0 => DimensionType::HeightWidthEven,
            1 => DimensionType::HeightEvenWidthOdd,
            2 => DimensionType::HeightOddWidthEven,
            _ => DimensionType::HeightWidthOdd,
        }
    }

    fn width_odd(self) -> bool {
        matches!(self, DimensionType::HeightEvenWidthOdd | DimensionType::HeightWidthOdd)
    }

    fn height_odd(self) -> bool {
        matches!(self, DimensionType::HeightOddWidthEven | DimensionType::HeightWidthOdd)
    }
}

/// One dispatch worth of levels.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MipBatch {
    pub source_mip: u32,
    /// Levels written, `1..=MAX_MIPS_PER_BATCH`.
    pub count: u32,
    /// Extent of the first level written.
    pub width: u32,
    pub height: u32,
    pub dimension: DimensionType,
}

impl MipBatch {
    pub fn thread_groups(&self) -> [u32; 3] {
        [self.width.div_ceil(GROUP_SIZE), self.height.div_ceil(GROUP_SIZE), 1]
    }
}

/// Splits the generation of `levels` mips of a `width` x `height` texture into batches.
pub fn plan_batches(width: u32, height: u32, levels: u32) -> Vec<MipBatch> {
    let mut batches = Vec::new();
    let mut source = 0;

    while source + 1 < levels {
        let src_w = mip_extent(width, source);
        let src_h = mip_extent(height, source);
        let dst_w = (src_w >> 1).max(1);
        let dst_h = (src_h >> 1).max(1);

        // A 1-texel axis stops constraining the other axis.
        let halvings = (if dst_w == 1 { dst_h } else { dst_w }) | (if dst_h == 1 { dst_w } else { dst_h });
        let count = (1 + halvings.trailing_zeros())
            .min(MAX_MIPS_PER_BATCH)
            .min(levels - 1 - source);

        batches.push(MipBatch {
            source_mip: source,
            count,
            width: dst_w,
            height: dst_h,
            dimension: DimensionType::of(src_w, src_h),
        });
        source += count;
    }
    batches
}

/// Per-batch parameters, read by the kernel through a constant buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct MipParams {
    pub is_srgb: u32,
    pub source_mip_level: u32,
    /// Reciprocal extent of the first destination level.
    pub texel_size: [f32; 2],
    pub num_mip_levels: u32,
    pub dimension_type: u32,
    /// Storage binding the levels are written through, see [`storage_format`].
    pub storage_format: u32,
    pub _pad: u32,
}

/// Storage binding selector of [`MipParams`]: 0 for RGBA8, 1 for RGBA32F, 2 for R32F.
pub fn storage_format(format: Format) -> Option<u32> {
    match format.non_srgb() {
        Format::Rgba8Unorm => Some(0),
        Format::Rgba32Float => Some(1),
        Format::R32Float => Some(2),
        _ => None,
    }
}

/// Descriptor indices passed as inline constants.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct MipBindings {
    pub params: u32,
    pub source: u32,
    pub destinations: [u32; MAX_MIPS_PER_BATCH as usize],
}

/// Reference mip kernel: one thread per texel of the batch's first level.
#[derive(Debug, Default)]
pub struct GenerateMipsProgram;

impl GenerateMipsProgram {
    /// Filters one texel of the batch's first level out of the source.
    fn first_level(env: &dyn ShaderEnv, source: u32, dim: DimensionType, x: u32, y: u32) -> [f32; 4] {
        let (src_w, src_h) = env.texture_size(source, 0).unwrap_or((1, 1));
        let taps = |odd: bool| -> &'static [(u32, f32)] {
            if odd {
                &[(0, 0.25), (1, 0.5), (2, 0.25)]
            } else {
                &[(0, 0.5), (1, 0.5)]
            }
        };

        let mut sum = [0.0f32; 4];
        for &(dy, wy) in taps(dim.height_odd()) {
            let sy = (2 * y + dy).min(src_h - 1);
            for &(dx, wx) in taps(dim.width_odd()) {
                let sx = (2 * x + dx).min(src_w - 1);
                let texel = env.load(source, 0, sx, sy);
                for c in 0..4 {
                    sum[c] += texel[c] * wx * wy;
                }
            }
        }
        sum
    }

    /// Texel `(x, y)` of batch level `depth` (1-based), averaged from level 1.
    ///
    /// `first` is the extent of level 1. An axis that is already one texel
    /// wide in the level above contributes a single tap at full weight.
    fn level(
        env: &dyn ShaderEnv,
        source: u32,
        dim: DimensionType,
        first: (u32, u32),
        depth: u32,
        x: u32,
        y: u32,
    ) -> [f32; 4] {
        if depth == 1 {
            return Self::first_level(env, source, dim, x, y);
        }
        let above_w = (first.0 >> (depth - 2)).max(1);
        let above_h = (first.1 >> (depth - 2)).max(1);
        let xs: &[u32] = if above_w == 1 { &[0] } else { &[0, 1] };
        let ys: &[u32] = if above_h == 1 { &[0] } else { &[0, 1] };
        let weight = 1.0 / (xs.len() * ys.len()) as f32;

        let mut sum = [0.0f32; 4];
        for &oy in ys {
            for &ox in xs {
                let texel = Self::level(env, source, dim, first, depth - 1, 2 * x + ox, 2 * y + oy);
                for c in 0..4 {
                    sum[c] += texel[c] * weight;
                }
            }
        }
        sum
    }
}

impl ComputeProgram for GenerateMipsProgram {
    fn thread_group_size(&self) -> [u32; 3] {
        [GROUP_SIZE, GROUP_SIZE, 1]
    }

    fn wgsl(&self) -> Option<&'static str> {
        Some(include_str!("shaders/generate_mips.wgsl"))
    }

    fn execute(&self, env: &mut dyn ShaderEnv, ids: ThreadIds) {
        let bindings: MipBindings = {
            let constants = env.constants();
            let mut raw = [0u32; 6];
            for (slot, value) in raw.iter_mut().zip(constants) {
                *slot = *value;
            }
            bytemuck::cast(raw)
        };
        let Some(params) = read_buffer::<MipParams, _>(&*env, bindings.params, 0) else {
            return;
        };

        let [x, y, _] = ids.dispatch;
        let width = (1.0 / params.texel_size[0]).round() as u32;
        let height = (1.0 / params.texel_size[1]).round() as u32;
        let dim = DimensionType::from_raw(params.dimension_type);

        for depth in 1..=params.num_mip_levels.min(MAX_MIPS_PER_BATCH) {
            // Level `depth` has one texel per 2^(depth-1) threads along each axis.
            let step = 1 << (depth - 1);
            if x % step != 0 || y % step != 0 {
                break;
            }
            let (lx, ly) = (x / step, y / step);
            if lx >= (width >> (depth - 1)).max(1) || ly >= (height >> (depth - 1)).max(1) {
                break;
            }

            let mut texel = Self::level(&*env, bindings.source, dim, (width, height), depth, lx, ly);
            if params.is_srgb != 0 {
                for c in texel.iter_mut().take(3) {
                    *c = linear_to_srgb(*c);
                }
            }
            env.store(bindings.destinations[depth as usize - 1], lx, ly, texel);
        }
    }
}

/// Parameter buffer and descriptor slots shared by every batch.
#[derive(Debug)]
struct Scratch {
    params: Buffer,
    source: u32,
    destinations: [u32; MAX_MIPS_PER_BATCH as usize],
}

/// Fills the mip chain of storage textures.
///
/// The generator owns one parameter buffer and five resource-table slots,
/// rewritten for every batch, so generating any number of textures leaves
/// the descriptor tables as they were.
#[derive(Debug, Clone)]
pub struct MipMapGenerator {
    pipeline: PipelineState,
    scratch: Arc<Mutex<Scratch>>,
}

impl MipMapGenerator {
    pub fn new(device: &Device) -> Self {
        let pipeline = device.create_pipeline_state(ComputePipelineDesc {
            name: "generate mips".to_string(),
            program: Arc::new(GenerateMipsProgram),
        });
        let params = device.create_buffer(
            &BufferDesc::new(BufferUsage::ConstantBuffer, "mip params"),
            &[MipParams::zeroed()],
        );
        let slots = device.reserve_resource_slots(1 + MAX_MIPS_PER_BATCH);
        let source = slots.start;
        let destinations = std::array::from_fn(|i| slots.start + 1 + i as u32);
        Self {
            pipeline,
            scratch: Arc::new(Mutex::new(Scratch {
                params,
                source,
                destinations,
            })),
        }
    }

    /// Generates levels `1..mip_levels` of `texture` from level 0.
    ///
    /// The texture must have `UnorderedAccess` usage and a single array slice.
    /// Calls from several threads run one after another.
    pub fn generate(&self, device: &Device, texture: &Texture) {
        debug_assert_eq!(
            texture.usage(),
            TextureUsage::UnorderedAccess,
            "'{}' cannot be written by the mip generator",
            texture.desc.name
        );
        debug_assert_eq!(texture.desc.array_size, 1, "mip generation of texture arrays");

        let batches = plan_batches(texture.width(), texture.height(), texture.mip_levels());
        if batches.is_empty() {
            return;
        }
        log::debug!(
            "generating {} mips of '{}' in {} batches",
            texture.mip_levels() - 1,
            texture.desc.name,
            batches.len()
        );

        let resting = texture.allocation.initial_state();
        let is_srgb = texture.format().is_srgb();
        let Some(storage_format) = storage_format(texture.format()) else {
            log::error!("'{}': no storage view for {:?}", texture.desc.name, texture.format());
            return;
        };
        let scratch = self.scratch.lock();

        for batch in batches {
            // The previous batch has completed, so its views and parameters are free.
            scratch.params.update(&MipParams {
                is_srgb: is_srgb as u32,
                source_mip_level: batch.source_mip,
                texel_size: [1.0 / batch.width as f32, 1.0 / batch.height as f32],
                num_mip_levels: batch.count,
                dimension_type: batch.dimension as u32,
                storage_format,
                _pad: 0,
            });
            device.write_srv(scratch.source, texture, batch.source_mip, 1);

            let mut bindings = MipBindings {
                params: scratch.params.cbv_index,
                source: scratch.source,
                destinations: [crate::INVALID_INDEX; MAX_MIPS_PER_BATCH as usize],
            };
            for i in 0..batch.count as usize {
                let index = scratch.destinations[i];
                device.write_uav(index, texture, batch.source_mip + 1 + i as u32);
                bindings.destinations[i] = index;
            }

            let queue = Arc::clone(device.compute_queue());
            let mut ctx = device.compute_context();
            queue.wait_for_value(ctx.last_fence_value());
            ctx.reset();
            ctx.set_pipeline_state(&self.pipeline);
            ctx.add_resource_barrier(texture.resource(), resting, ResourceState::UnorderedAccess);
            ctx.execute_resource_barriers();
            ctx.set_32bit_constants(&bindings);
            let [gx, gy, gz] = batch.thread_groups();
            ctx.dispatch(gx, gy, gz);
            ctx.add_uav_barrier(texture.resource());
            ctx.add_resource_barrier(texture.resource(), ResourceState::UnorderedAccess, resting);
            ctx.execute_resource_barriers();

            let value = queue.submit(&mut [&mut *ctx as &mut dyn RecordingContext]);
            drop(ctx);
            queue.wait_for_value(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceInit;
    use crate::resource::TextureDesc;

    // ── batch planning ────────────────────────────────────────────────────

    #[test]
    fn power_of_two_chain_batches_by_four() {
        let batches = plan_batches(256, 256, 9);
        let counts: Vec<u32> = batches.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![4, 4]);
        assert_eq!(batches[1].source_mip, 4);
        assert_eq!((batches[1].width, batches[1].height), (8, 8));
    }

    #[test]
    fn odd_level_ends_a_batch() {
        // 24 -> 12 -> 6 -> 3: three levels halve evenly, then 3 -> 1 is odd.
        let batches = plan_batches(48, 48, 6);
        assert_eq!(batches[0].count, 3);
        assert_eq!(batches[0].dimension, DimensionType::HeightWidthEven);
        assert_eq!(batches[1].source_mip, 3);
        assert_eq!(batches[1].dimension, DimensionType::HeightWidthOdd);
    }

    #[test]
    fn kernel_compiles_against_the_bindless_prelude() {
        let body = GenerateMipsProgram.wgsl().unwrap();
        let words = crate::hal::vulkan::compile("generate mips", body).unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn storage_format_follows_the_linear_format() {
        assert_eq!(storage_format(Format::Rgba8UnormSrgb), Some(0));
        assert_eq!(storage_format(Format::Rgba32Float), Some(1));
        assert_eq!(storage_format(Format::R32Float), Some(2));
    }

    #[test]
    fn parity_is_classified_per_axis() {
        assert_eq!(DimensionType::of(5, 4), DimensionType::HeightEvenWidthOdd);
        assert_eq!(DimensionType::of(4, 5), DimensionType::HeightOddWidthEven);
        assert_eq!(plan_batches(5, 4, 2)[0].dimension, DimensionType::HeightEvenWidthOdd);
    }

    #[test]
    fn one_texel_axis_does_not_limit_batch() {
        let batches = plan_batches(64, 1, 7);
        assert_eq!(batches[0].count, 4);
        assert_eq!((batches[0].width, batches[0].height), (32, 1));
    }

    #[test]
    fn planning_covers_every_level_once() {
        for (w, h) in [(1024, 512), (37, 91), (3, 3), (640, 360)] {
            let levels = crate::hal::full_mip_chain(w, h);
            let batches = plan_batches(w, h, levels);
            let produced: u32 = batches.iter().map(|b| b.count).sum();
            assert_eq!(produced, levels - 1, "{w}x{h}");
            assert!(batches.iter().all(|b| b.count <= MAX_MIPS_PER_BATCH));
        }
    }

    #[test]
    fn single_level_needs_no_batches() {
        assert!(plan_batches(16, 16, 1).is_empty());
    }

    #[test]
    fn dispatch_covers_first_level() {
        let batch = plan_batches(100, 36, 2)[0];
        assert_eq!(batch.thread_groups(), [7, 3, 1]);
    }

    // ── generation ────────────────────────────────────────────────────────

    fn texel(bytes: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
        let at = ((y * width + x) * 4) as usize;
        [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
    }

    fn generated(format: Format, size: u32, levels: u32, pixels: &[u8]) -> Vec<Vec<u8>> {
        generated_rect(format, size, size, levels, pixels)
    }

    fn generated_rect(format: Format, width: u32, height: u32, levels: u32, pixels: &[u8]) -> Vec<Vec<u8>> {
        let (device, _) = Device::headless(4, 4, Format::Rgba8Unorm, DeviceInit::default());
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::UnorderedAccess, width, height, format).with_mips(levels),
            Some(pixels),
        );
        MipMapGenerator::new(&device).generate(&device, &tex);
        (0..levels).map(|mip| device.read_texture(&tex, mip, 0)).collect()
    }

    #[test]
    fn each_level_averages_the_one_above() {
        let size = 8;
        let pixels: Vec<u8> = (0..size * size)
            .flat_map(|i| {
                let (x, y) = (i % size, i / size);
                [(x * 32) as u8, (y * 32) as u8, ((x + y) * 16) as u8, 255]
            })
            .collect();
        let levels = generated(Format::Rgba8Unorm, size, 4, &pixels);

        for mip in 1..4 {
            let (above, below) = (&levels[mip - 1], &levels[mip]);
            assert_ne!(above[..below.len()], below[..], "levels {} and {mip} match", mip - 1);

            let w = size >> mip;
            for y in 0..w {
                for x in 0..w {
                    let got = texel(below, w, x, y);
                    for c in 0..4 {
                        let expected: f32 = [(0, 0), (1, 0), (0, 1), (1, 1)]
                            .iter()
                            .map(|(dx, dy)| texel(above, w * 2, 2 * x + dx, 2 * y + dy)[c] as f32)
                            .sum::<f32>()
                            / 4.0;
                        assert!(
                            (got[c] as f32 - expected).abs() <= 1.5,
                            "mip {mip} ({x},{y}) channel {c}: {} vs {expected}",
                            got[c]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn srgb_levels_average_in_linear_space() {
        // Alternating black and white columns.
        let pixels: Vec<u8> = (0..4 * 4)
            .flat_map(|i| if i % 2 == 0 { [0, 0, 0, 255] } else { [255, 255, 255, 255] })
            .collect();
        let levels = generated(Format::Rgba8UnormSrgb, 4, 2, &pixels);
        // Linear 0.5 encodes to about 188, not 128.
        let t = texel(&levels[1], 2, 0, 0);
        assert!((186..=190).contains(&t[0]), "{t:?}");
    }

    #[test]
    fn odd_source_uses_three_taps() {
        let mut env_pixels = vec![0u8; 3 * 3 * 4];
        // Only the centre texel is white.
        env_pixels[(4 * 4)..(4 * 4 + 4)].copy_from_slice(&[255, 255, 255, 255]);
        let (device, _) = Device::headless(4, 4, Format::Rgba8Unorm, DeviceInit::default());
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::UnorderedAccess, 3, 3, Format::Rgba8Unorm).with_mips(2),
            Some(&env_pixels),
        );
        MipMapGenerator::new(&device).generate(&device, &tex);
        let level = device.read_texture(&tex, 1, 0);
        // Centre weight is 0.5 * 0.5.
        assert!((63..=65).contains(&level[0]), "{:?}", &level[..4]);
    }

    fn assert_flat_grey(levels: &[Vec<u8>]) {
        for (mip, level) in levels.iter().enumerate().skip(1) {
            for t in level.chunks_exact(4) {
                assert!((127..=128).contains(&t[0]), "mip {mip}: {:?}", &level[..]);
                assert_eq!(t[3], 255);
            }
        }
    }

    #[test]
    fn one_texel_high_levels_keep_the_row_average() {
        // Black top row, white bottom row: every level below 16x2 is mid grey.
        let pixels: Vec<u8> = (0..16 * 2)
            .flat_map(|i| if i < 16 { [0, 0, 0, 255] } else { [255, 255, 255, 255] })
            .collect();
        let levels = generated_rect(Format::Rgba8Unorm, 16, 2, 5, &pixels);
        assert_eq!(levels[4].len(), 4);
        assert_flat_grey(&levels);
    }

    #[test]
    fn one_texel_wide_levels_keep_the_column_average() {
        let pixels: Vec<u8> = (0..2 * 16)
            .flat_map(|i| if i % 2 == 0 { [0, 0, 0, 255] } else { [255, 255, 255, 255] })
            .collect();
        let levels = generated_rect(Format::Rgba8Unorm, 2, 16, 5, &pixels);
        assert_flat_grey(&levels);
    }

    #[test]
    fn generation_reuses_its_descriptor_slots() {
        let init = DeviceInit {
            resource_descriptors: 32,
            ..DeviceInit::default()
        };
        let (device, _) = Device::headless(4, 4, Format::Rgba8Unorm, init);
        let mips = MipMapGenerator::new(&device);
        let tex = device.create_texture(
            &TextureDesc::new(TextureUsage::UnorderedAccess, 64, 64, Format::Rgba8Unorm).with_mips(7),
            Some(&vec![200u8; 64 * 64 * 4]),
        );
        let used = device
            .descriptor_tables()
            .table(crate::hal::TableKind::Resource)
            .lock()
            .len();

        // Two batches per call; registering views per batch would need hundreds of slots.
        for _ in 0..100 {
            mips.generate(&device, &tex);
        }

        let after = device
            .descriptor_tables()
            .table(crate::hal::TableKind::Resource)
            .lock()
            .len();
        assert_eq!(after, used);
        assert_eq!(device.read_texture(&tex, 6, 0)[0], 200);
    }
}
