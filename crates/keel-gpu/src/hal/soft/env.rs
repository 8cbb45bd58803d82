use crate::hal::{
    AddressMode, CompareFunc, DepthState, Filter, Format, HeapId, IndexFormat, RasterEnv,
    ResourceDesc, ResourceId, SamplerDesc, ScissorRect, ShaderEnv, ViewDesc, Viewport,
};

use super::state::{Arena, Registry, SoftTable};

/// One addressable 2D subresource.
#[derive(Debug, Copy, Clone)]
pub(super) struct Surface {
    pub heap: HeapId,
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub row_pitch: u64,
    pub format: Format,
}

impl Surface {
    pub fn resolve(
        registry: &Registry,
        resource: ResourceId,
        mip: u32,
        slice: u32,
        format: Format,
    ) -> Option<Surface> {
        let res = registry.get(&resource)?;
        if mip >= mip_count(&res.desc) || slice >= slice_count(&res.desc) {
            return None;
        }
        let fp = res.desc.footprint(res.desc.subresource_index(mip, slice));
        Some(Surface {
            heap: res.heap,
            base: res.offset + fp.offset,
            width: fp.width,
            height: fp.height,
            row_pitch: fp.row_pitch,
            format,
        })
    }

    fn texel_offset(&self, x: u32, y: u32) -> Option<u64> {
        (x < self.width && y < self.height).then(|| {
            self.base + y as u64 * self.row_pitch + x as u64 * self.format.bytes_per_texel() as u64
        })
    }

    pub fn read(&self, arena: &Arena, x: u32, y: u32) -> [f32; 4] {
        let Some(at) = self.texel_offset(x, y) else { return [0.0; 4] };
        let mut texel = [0u8; 16];
        let n = self.format.bytes_per_texel() as usize;
        if !arena.read(self.heap, at, &mut texel[..n]) {
            return [0.0; 4];
        }
        self.format.decode(&texel[..n])
    }

    pub fn write(&self, arena: &mut Arena, x: u32, y: u32, value: [f32; 4]) {
        let Some(at) = self.texel_offset(x, y) else { return };
        let mut texel = [0u8; 16];
        let n = self.format.bytes_per_texel() as usize;
        self.format.encode(value, &mut texel[..n]);
        arena.write(self.heap, at, &texel[..n]);
    }

    pub fn fill(&self, arena: &mut Arena, value: [f32; 4]) {
        let mut texel = [0u8; 16];
        let n = self.format.bytes_per_texel() as usize;
        self.format.encode(value, &mut texel[..n]);
        let len = self.row_pitch * self.height as u64;
        arena.fill(self.heap, self.base, len, &texel[..n]);
    }
}

fn mip_count(desc: &ResourceDesc) -> u32 {
    match desc {
        ResourceDesc::Buffer { .. } => 0,
        ResourceDesc::Texture2D { mip_levels, .. } => *mip_levels,
    }
}

fn slice_count(desc: &ResourceDesc) -> u32 {
    match desc {
        ResourceDesc::Buffer { .. } => 0,
        ResourceDesc::Texture2D { array_size, .. } => *array_size,
    }
}

#[derive(Debug, Copy, Clone)]
pub(super) struct IndexBinding {
    pub heap: HeapId,
    pub offset: u64,
    pub size: u64,
    pub format: IndexFormat,
}

pub(super) struct Raster {
    pub targets: Vec<Surface>,
    pub depth: Option<Surface>,
    pub depth_state: Option<DepthState>,
    pub viewport: Viewport,
    pub scissor: Option<ScissorRect>,
    pub index: Option<IndexBinding>,
}

impl Raster {
    fn covers(&self, x: u32, y: u32) -> bool {
        let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
        let vp = &self.viewport;
        let in_viewport =
            fx >= vp.x && fy >= vp.y && fx < vp.x + vp.width && fy < vp.y + vp.height;
        let in_scissor = self
            .scissor
            .is_none_or(|s| x >= s.left && x < s.right && y >= s.top && y < s.bottom);
        in_viewport && in_scissor
    }
}

/// Program-visible view of device memory for one draw or dispatch.
pub(super) struct Env<'a> {
    pub registry: &'a Registry,
    pub resources: Option<&'a SoftTable>,
    pub samplers: Option<&'a SoftTable>,
    pub arena: &'a mut Arena,
    pub constants: &'a [u32],
    pub raster: Option<Raster>,
}

impl Env<'_> {
    fn resource_view(&self, index: u32) -> Option<&ViewDesc> {
        self.resources?.view(index)
    }

    fn texture_surface(&self, srv: u32, layer: u32, mip: u32) -> Option<Surface> {
        match *self.resource_view(srv)? {
            ViewDesc::Texture {
                resource,
                format,
                most_detailed_mip,
                mip_levels,
                first_slice,
                array_size,
                ..
            } => {
                if mip >= mip_levels || layer >= array_size {
                    return None;
                }
                Surface::resolve(
                    self.registry,
                    resource,
                    most_detailed_mip + mip,
                    first_slice + layer,
                    format,
                )
            }
            _ => None,
        }
    }

    fn view_mip_levels(&self, srv: u32) -> u32 {
        match self.resource_view(srv) {
            Some(ViewDesc::Texture { mip_levels, .. }) => *mip_levels,
            _ => 0,
        }
    }
}

impl ShaderEnv for Env<'_> {
    fn constants(&self) -> &[u32] {
        self.constants
    }

    fn texture_size(&self, srv: u32, mip: u32) -> Option<(u32, u32)> {
        self.texture_surface(srv, 0, mip).map(|s| (s.width, s.height))
    }

    fn load_layer(&self, srv: u32, layer: u32, mip: u32, x: u32, y: u32) -> [f32; 4] {
        match self.texture_surface(srv, layer, mip) {
            Some(surface) => surface.read(self.arena, x, y),
            None => [0.0; 4],
        }
    }

    fn sample(&self, srv: u32, sampler: u32, uv: [f32; 2], lod: f32) -> [f32; 4] {
        let Some(ViewDesc::Sampler(desc)) = self.samplers.and_then(|t| t.view(sampler)) else {
            return [0.0; 4];
        };
        let levels = self.view_mip_levels(srv);
        if levels == 0 {
            return [0.0; 4];
        }
        let max_level = desc.max_lod.min((levels - 1) as f32);
        let level = (lod + desc.mip_lod_bias).clamp(desc.min_lod, max_level).round() as u32;
        let Some(surface) = self.texture_surface(srv, 0, level) else { return [0.0; 4] };
        sample_surface(&surface, self.arena, desc, uv)
    }

    fn load_buffer(&self, index: u32, offset: u64, out: &mut [u8]) -> bool {
        let Some(view) = self.resource_view(index) else { return false };
        let (resource, start, limit) = match *view {
            ViewDesc::ConstantBuffer {
                resource,
                offset: view_offset,
                size,
            } => (resource, view_offset, size),
            ViewDesc::StructuredBuffer {
                resource,
                first_element,
                num_elements,
                stride,
            } => (
                resource,
                first_element * stride as u64,
                num_elements as u64 * stride as u64,
            ),
            _ => return false,
        };
        if offset + out.len() as u64 > limit {
            return false;
        }
        let Some(res) = self.registry.get(&resource) else { return false };
        self.arena.read(res.heap, res.offset + start + offset, out)
    }

    fn store(&mut self, uav: u32, x: u32, y: u32, value: [f32; 4]) {
        let surface = match self.resource_view(uav) {
            Some(&ViewDesc::StorageTexture {
                resource,
                format,
                mip_slice,
                slice,
            }) => Surface::resolve(self.registry, resource, mip_slice, slice, format),
            _ => None,
        };
        if let Some(surface) = surface {
            surface.write(self.arena, x, y, value);
        }
    }
}

impl RasterEnv for Env<'_> {
    fn viewport(&self) -> Viewport {
        self.raster
            .as_ref()
            .map_or(Viewport::full(0, 0), |r| r.viewport)
    }

    fn render_target_count(&self) -> usize {
        self.raster.as_ref().map_or(0, |r| r.targets.len())
    }

    fn fetch_index(&self, i: u32) -> Option<u32> {
        let binding = self.raster.as_ref()?.index?;
        let size = binding.format.size();
        let at = i as u64 * size;
        if at + size > binding.size {
            return None;
        }
        let mut raw = [0u8; 4];
        if !self
            .arena
            .read(binding.heap, binding.offset + at, &mut raw[..size as usize])
        {
            return None;
        }
        Some(match binding.format {
            IndexFormat::Uint16 => u16::from_le_bytes([raw[0], raw[1]]) as u32,
            IndexFormat::Uint32 => u32::from_le_bytes(raw),
        })
    }

    fn write_color(&mut self, target: usize, x: u32, y: u32, color: [f32; 4]) {
        let Some(raster) = self.raster.as_ref() else { return };
        if !raster.covers(x, y) {
            return;
        }
        if let Some(surface) = raster.targets.get(target).copied() {
            surface.write(self.arena, x, y, color);
        }
    }

    fn depth_test(&mut self, x: u32, y: u32, depth: f32) -> bool {
        let Some(raster) = self.raster.as_ref() else { return true };
        let Some(surface) = raster.depth else { return true };
        let (compare, write) = raster
            .depth_state
            .as_ref()
            .map_or((CompareFunc::Less, true), |d| (d.compare, d.write));

        let stored = surface.read(self.arena, x, y)[0];
        let passed = compare.passes(depth, stored);
        if passed && write {
            surface.write(self.arena, x, y, [depth, 0.0, 0.0, 1.0]);
        }
        passed
    }
}

fn address(coord: i64, size: u32, mode: AddressMode) -> Option<u32> {
    let size = size as i64;
    match mode {
        AddressMode::Wrap => Some(coord.rem_euclid(size) as u32),
        AddressMode::Mirror => {
            let m = coord.rem_euclid(2 * size);
            Some(if m >= size { 2 * size - 1 - m } else { m } as u32)
        }
        AddressMode::Clamp => Some(coord.clamp(0, size - 1) as u32),
        AddressMode::Border => (0..size).contains(&coord).then_some(coord as u32),
    }
}

fn fetch(surface: &Surface, arena: &Arena, desc: &SamplerDesc, x: i64, y: i64) -> [f32; 4] {
    match (
        address(x, surface.width, desc.address_u),
        address(y, surface.height, desc.address_v),
    ) {
        (Some(x), Some(y)) => surface.read(arena, x, y),
        _ => desc.border_color,
    }
}

fn sample_surface(surface: &Surface, arena: &Arena, desc: &SamplerDesc, uv: [f32; 2]) -> [f32; 4] {
    let fx = uv[0] * surface.width as f32;
    let fy = uv[1] * surface.height as f32;

    match desc.filter {
        Filter::Point => fetch(surface, arena, desc, fx.floor() as i64, fy.floor() as i64),
        Filter::Linear | Filter::Anisotropic => {
            let (sx, sy) = (fx - 0.5, fy - 0.5);
            let (x0, y0) = (sx.floor(), sy.floor());
            let (tx, ty) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);

            let c00 = fetch(surface, arena, desc, x0, y0);
            let c10 = fetch(surface, arena, desc, x0 + 1, y0);
            let c01 = fetch(surface, arena, desc, x0, y0 + 1);
            let c11 = fetch(surface, arena, desc, x0 + 1, y0 + 1);

            let mut out = [0.0; 4];
            for i in 0..4 {
                let top = c00[i] + (c10[i] - c00[i]) * tx;
                let bottom = c01[i] + (c11[i] - c01[i]) * tx;
                out[i] = top + (bottom - top) * ty;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── addressing ────────────────────────────────────────────────────────

    #[test]
    fn wrap_and_mirror_fold_coordinates() {
        assert_eq!(address(-1, 4, AddressMode::Wrap), Some(3));
        assert_eq!(address(5, 4, AddressMode::Wrap), Some(1));
        assert_eq!(address(4, 4, AddressMode::Mirror), Some(3));
        assert_eq!(address(-1, 4, AddressMode::Mirror), Some(0));
    }

    #[test]
    fn border_rejects_outside() {
        assert_eq!(address(-1, 4, AddressMode::Border), None);
        assert_eq!(address(3, 4, AddressMode::Border), Some(3));
        assert_eq!(address(9, 4, AddressMode::Clamp), Some(3));
    }
}
