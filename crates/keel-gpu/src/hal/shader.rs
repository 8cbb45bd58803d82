//! Program interface.
//!
//! Programs address every resource through descriptor-table indices; no
//! per-draw binding exists beyond the 32-bit constants blob. The reference
//! device runs the Rust bodies below; hardware devices compile the WGSL body
//! a program supplies.

use std::fmt::Debug;

use bytemuck::Pod;

use super::{DrawArgs, Viewport};

/// Bindless resource access available to every program invocation.
///
/// Reads through an empty slot or `INVALID_INDEX` return zero; writes through
/// one are dropped.
pub trait ShaderEnv {
    /// Inline 32-bit constants set on the recording context.
    fn constants(&self) -> &[u32];

    fn constant(&self, i: usize) -> u32 {
        self.constants().get(i).copied().unwrap_or(0)
    }

    /// Extent of `mip` (relative to the view's most detailed mip).
    fn texture_size(&self, srv: u32, mip: u32) -> Option<(u32, u32)>;

    /// Loads a texel of array layer `layer`.
    fn load_layer(&self, srv: u32, layer: u32, mip: u32, x: u32, y: u32) -> [f32; 4];

    fn load(&self, srv: u32, mip: u32, x: u32, y: u32) -> [f32; 4] {
        self.load_layer(srv, 0, mip, x, y)
    }

    /// Filtered read at normalized coordinates using the sampler in slot `sampler`.
    fn sample(&self, srv: u32, sampler: u32, uv: [f32; 2], lod: f32) -> [f32; 4];

    /// Copies raw bytes out of a constant or structured buffer view.
    /// Returns `false` when the slot does not hold a buffer view.
    fn load_buffer(&self, index: u32, offset: u64, out: &mut [u8]) -> bool;

    /// Writes one texel through a storage texture view.
    fn store(&mut self, uav: u32, x: u32, y: u32, value: [f32; 4]);
}

/// Reads a whole `T` from a buffer view.
pub fn read_buffer<T: Pod, E: ShaderEnv + ?Sized>(env: &E, index: u32, offset: u64) -> Option<T> {
    let mut value = T::zeroed();
    env.load_buffer(index, offset, bytemuck::bytes_of_mut(&mut value))
        .then_some(value)
}

/// Additional state visible to graphics programs.
pub trait RasterEnv: ShaderEnv {
    fn viewport(&self) -> Viewport;

    fn render_target_count(&self) -> usize;

    /// Index `i` of the bound index buffer, or `None` past its end.
    fn fetch_index(&self, i: u32) -> Option<u32>;

    /// Writes a color to target `target`, clipped to viewport and scissor.
    fn write_color(&mut self, target: usize, x: u32, y: u32, color: [f32; 4]);

    /// Tests `depth` against the bound depth target and updates it on success.
    /// Always passes when no depth target is bound.
    fn depth_test(&mut self, x: u32, y: u32, depth: f32) -> bool;
}

/// Thread coordinates of one compute invocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThreadIds {
    pub dispatch: [u32; 3],
    pub group: [u32; 3],
    pub local: [u32; 3],
}

pub trait ComputeProgram: Send + Sync + Debug {
    fn thread_group_size(&self) -> [u32; 3];

    fn execute(&self, env: &mut dyn ShaderEnv, ids: ThreadIds);

    /// WGSL body with a `cs_main` entry point, written against the bindless
    /// prelude (`root_constant`, `textures`, `buffers`, ...).
    fn wgsl(&self) -> Option<&'static str> {
        None
    }
}

pub trait GraphicsProgram: Send + Sync + Debug {
    fn draw(&self, env: &mut dyn RasterEnv, args: &DrawArgs);

    /// WGSL body with `vs_main` and `fs_main` entry points.
    fn wgsl(&self) -> Option<&'static str> {
        None
    }
}
