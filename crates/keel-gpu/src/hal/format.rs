/// Texel formats understood by the core.
///
/// sRGB formats decode to linear on load and encode on store; storage (UAV)
/// views are always created with the `non_srgb` variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    D32Float,
}

impl Format {
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Rgba8Unorm
            | Format::Rgba8UnormSrgb
            | Format::Bgra8Unorm
            | Format::Bgra8UnormSrgb
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float => 4,
            Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub const fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8UnormSrgb | Format::Bgra8UnormSrgb)
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Format::D32Float)
    }

    /// Same memory layout without the sRGB transfer function.
    pub const fn non_srgb(self) -> Format {
        match self {
            Format::Rgba8UnormSrgb => Format::Rgba8Unorm,
            Format::Bgra8UnormSrgb => Format::Bgra8Unorm,
            other => other,
        }
    }

    /// Format used when a shader reads the resource.
    ///
    /// Depth surfaces are sampled as single-channel floats.
    pub const fn shader_view_format(self) -> Format {
        match self {
            Format::D32Float => Format::R32Float,
            other => other,
        }
    }

    /// Decodes one texel. Missing channels read as `0.0`, missing alpha as `1.0`.
    pub fn decode(self, bytes: &[u8]) -> [f32; 4] {
        match self {
            Format::Rgba8Unorm => [unorm(bytes[0]), unorm(bytes[1]), unorm(bytes[2]), unorm(bytes[3])],
            Format::Bgra8Unorm => [unorm(bytes[2]), unorm(bytes[1]), unorm(bytes[0]), unorm(bytes[3])],
            Format::Rgba8UnormSrgb => [
                srgb_to_linear(unorm(bytes[0])),
                srgb_to_linear(unorm(bytes[1])),
                srgb_to_linear(unorm(bytes[2])),
                unorm(bytes[3]),
            ],
            Format::Bgra8UnormSrgb => [
                srgb_to_linear(unorm(bytes[2])),
                srgb_to_linear(unorm(bytes[1])),
                srgb_to_linear(unorm(bytes[0])),
                unorm(bytes[3]),
            ],
            Format::R32Float | Format::D32Float => [f32_at(bytes, 0), 0.0, 0.0, 1.0],
            Format::Rg32Float => [f32_at(bytes, 0), f32_at(bytes, 4), 0.0, 1.0],
            Format::Rgba32Float => [
                f32_at(bytes, 0),
                f32_at(bytes, 4),
                f32_at(bytes, 8),
                f32_at(bytes, 12),
            ],
            Format::R32Uint => {
                let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                [v as f32, 0.0, 0.0, 1.0]
            }
        }
    }

    /// Encodes one texel into `out` (`out.len() >= bytes_per_texel`).
    pub fn encode(self, value: [f32; 4], out: &mut [u8]) {
        match self {
            Format::Rgba8Unorm => {
                out[..4].copy_from_slice(&[to_unorm(value[0]), to_unorm(value[1]), to_unorm(value[2]), to_unorm(value[3])]);
            }
            Format::Bgra8Unorm => {
                out[..4].copy_from_slice(&[to_unorm(value[2]), to_unorm(value[1]), to_unorm(value[0]), to_unorm(value[3])]);
            }
            Format::Rgba8UnormSrgb => {
                out[..4].copy_from_slice(&[
                    to_unorm(linear_to_srgb(value[0])),
                    to_unorm(linear_to_srgb(value[1])),
                    to_unorm(linear_to_srgb(value[2])),
                    to_unorm(value[3]),
                ]);
            }
            Format::Bgra8UnormSrgb => {
                out[..4].copy_from_slice(&[
                    to_unorm(linear_to_srgb(value[2])),
                    to_unorm(linear_to_srgb(value[1])),
                    to_unorm(linear_to_srgb(value[0])),
                    to_unorm(value[3]),
                ]);
            }
            Format::R32Float | Format::D32Float => out[..4].copy_from_slice(&value[0].to_le_bytes()),
            Format::Rg32Float => {
                out[..4].copy_from_slice(&value[0].to_le_bytes());
                out[4..8].copy_from_slice(&value[1].to_le_bytes());
            }
            Format::Rgba32Float => {
                for (i, c) in value.iter().enumerate() {
                    out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
                }
            }
            Format::R32Uint => out[..4].copy_from_slice(&(value[0].max(0.0) as u32).to_le_bytes()),
        }
    }
}

pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn unorm(b: u8) -> f32 {
    b as f32 / 255.0
}

fn to_unorm(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn f32_at(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── layout ────────────────────────────────────────────────────────────

    #[test]
    fn depth_reads_as_single_channel_float() {
        assert_eq!(Format::D32Float.shader_view_format(), Format::R32Float);
        assert!(Format::D32Float.is_depth());
        assert!(!Format::R32Float.is_depth());
    }

    #[test]
    fn non_srgb_keeps_channel_order() {
        assert_eq!(Format::Bgra8UnormSrgb.non_srgb(), Format::Bgra8Unorm);
        assert_eq!(Format::Rgba8UnormSrgb.non_srgb(), Format::Rgba8Unorm);
        assert_eq!(Format::Rgba32Float.non_srgb(), Format::Rgba32Float);
    }

    // ── texel codec ───────────────────────────────────────────────────────

    #[test]
    fn bgra_swizzles_on_decode() {
        let texel = [0u8, 128, 255, 255];
        let c = Format::Bgra8Unorm.decode(&texel);
        assert_eq!(c[0], 1.0);
        assert_eq!(c[2], 0.0);
    }

    #[test]
    fn srgb_midpoint_decodes_below_half() {
        let c = Format::Rgba8UnormSrgb.decode(&[128, 128, 128, 128]);
        assert!(c[0] < 0.25 && c[0] > 0.2);
        // alpha is always linear
        assert!((c[3] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn srgb_encode_inverts_decode() {
        let mut out = [0u8; 4];
        let c = Format::Rgba8UnormSrgb.decode(&[10, 100, 200, 255]);
        Format::Rgba8UnormSrgb.encode(c, &mut out);
        assert_eq!(out, [10, 100, 200, 255]);
    }

    #[test]
    fn unorm_encode_clamps() {
        let mut out = [0u8; 4];
        Format::Rgba8Unorm.encode([2.0, -1.0, 0.5, 1.0], &mut out);
        assert_eq!(out, [255, 0, 128, 255]);
    }
}
