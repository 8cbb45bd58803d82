//! Programs the sandbox draws with, and the texture it samples.

use bytemuck::{Pod, Zeroable};
use keel_gpu::hal::{DrawArgs, GraphicsProgram, RasterEnv, linear_to_srgb};

/// Root constants of [`ScenePass`].
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct SceneConstants {
    pub checker_srv: u32,
    pub sampler: u32,
    pub time: f32,
    /// Size of the target in pixels.
    pub width: f32,
    pub height: f32,
}

/// Root constants of [`TonemapPass`].
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct TonemapConstants {
    pub hdr_srv: u32,
    pub exposure: f32,
}

const SKY_TOP: [f32; 3] = [0.05, 0.08, 0.25];
const SKY_BOTTOM: [f32; 3] = [0.9, 0.45, 0.2];

/// Vertical gradient with a pulsing HDR glow and a checkerboard panel that
/// sweeps through its mip chain.
#[derive(Debug)]
pub struct ScenePass;

impl GraphicsProgram for ScenePass {
    fn wgsl(&self) -> Option<&'static str> {
        Some(concat!(
            include_str!("shaders/fullscreen.wgsl"),
            include_str!("shaders/scene.wgsl")
        ))
    }

    fn draw(&self, env: &mut dyn RasterEnv, _args: &DrawArgs) {
        let checker = env.constant(0);
        let sampler = env.constant(1);
        let time = f32::from_bits(env.constant(2));

        let w = f32::from_bits(env.constant(3)).max(1.0);
        let h = f32::from_bits(env.constant(4)).max(1.0);
        let glow_center = [0.5 + 0.3 * time.cos(), 0.3];
        let glow_strength = 2.0 + 1.5 * (time * 1.7).sin();

        let panel = 0.5 * w.min(h);
        let panel_x = (w - panel) * 0.5;
        let panel_y = (h - panel) * 0.5;
        let lod = 2.0 + 2.0 * (time * 0.8).sin();

        for y in 0..h as u32 {
            let v = (y as f32 + 0.5) / h;
            for x in 0..w as u32 {
                let u = (x as f32 + 0.5) / w;

                let px = x as f32 - panel_x;
                let py = y as f32 - panel_y;
                let color = if (0.0..panel).contains(&px) && (0.0..panel).contains(&py) {
                    let uv = [4.0 * px / panel, 4.0 * py / panel];
                    env.sample(checker, sampler, uv, lod)
                } else {
                    let mut sky = lerp3(SKY_TOP, SKY_BOTTOM, v);
                    let dx = u - glow_center[0];
                    let dy = v - glow_center[1];
                    let glow = glow_strength * (-(dx * dx + dy * dy) * 40.0).exp();
                    for c in &mut sky {
                        *c += glow;
                    }
                    [sky[0], sky[1], sky[2], 1.0]
                };
                env.write_color(0, x, y, color);
            }
        }
    }
}

/// Reinhard tonemapping of the HDR target onto the back buffer.
#[derive(Debug)]
pub struct TonemapPass;

impl GraphicsProgram for TonemapPass {
    fn wgsl(&self) -> Option<&'static str> {
        Some(concat!(
            include_str!("shaders/fullscreen.wgsl"),
            include_str!("shaders/tonemap.wgsl")
        ))
    }

    fn draw(&self, env: &mut dyn RasterEnv, _args: &DrawArgs) {
        let hdr = env.constant(0);
        let exposure = f32::from_bits(env.constant(1));
        let Some((tw, th)) = env.texture_size(hdr, 0) else {
            return;
        };

        let vp = env.viewport();
        for y in 0..(vp.height as u32).min(th) {
            for x in 0..(vp.width as u32).min(tw) {
                let [r, g, b, _] = env.load(hdr, 0, x, y);
                let map = |c: f32| {
                    let c = c * exposure;
                    c / (1.0 + c)
                };
                env.write_color(0, x, y, [map(r), map(g), map(b), 1.0]);
            }
        }
    }
}

fn lerp3(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

/// sRGB-encoded RGBA8 checkerboard with `cells` squares per side.
pub fn checkerboard(size: u32, cells: u32) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    let light = linear_to_srgb(0.9);
    let dark = linear_to_srgb(0.05);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            let (r, g, b) = if on { (light, light, dark) } else { (dark, dark, light) };
            pixels.extend([to_unorm8(r), to_unorm8(g), to_unorm8(b), 255]);
        }
    }
    pixels
}

fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_gpu::hal::vulkan::compile;

    #[test]
    fn checkerboard_alternates_cells() {
        let pixels = checkerboard(8, 2);
        assert_eq!(pixels.len(), 8 * 8 * 4);
        let texel = |x: usize, y: usize| &pixels[(y * 8 + x) * 4..(y * 8 + x) * 4 + 4];
        assert_eq!(texel(0, 0), texel(5, 5));
        assert_ne!(texel(0, 0), texel(4, 0));
    }

    #[test]
    fn passes_compile_for_vulkan() {
        let passes: [(&str, &dyn GraphicsProgram); 2] = [("scene", &ScenePass), ("tonemap", &TonemapPass)];
        for (name, pass) in passes {
            let words = compile(name, pass.wgsl().unwrap()).unwrap();
            assert_eq!(words[0], 0x0723_0203, "{name}");
        }
    }
}
