//! Parallel texture loading on a fixed-size worker pool.
//!
//! Each request is created and uploaded on one pool thread. Descriptor
//! registration serialises on the device's table locks; the uploads
//! themselves overlap on the copy queue.

use anyhow::Context;
use rayon::prelude::*;

use crate::config::DeviceInit;
use crate::device::Device;
use crate::mipmap::MipMapGenerator;
use crate::resource::{Texture, TextureDesc, TextureUsage};

/// Pixels for one texture, plus what to do after uploading them.
#[derive(Debug, Clone)]
pub struct TextureRequest {
    pub desc: TextureDesc,
    /// Tightly packed rows of mip 0.
    pub pixels: Vec<u8>,
    pub generate_mips: bool,
}

impl TextureRequest {
    pub fn new(desc: TextureDesc, pixels: Vec<u8>) -> Self {
        Self {
            desc,
            pixels,
            generate_mips: false,
        }
    }

    /// Requests a full mip chain, generated on the compute queue after upload.
    pub fn with_generated_mips(mut self) -> Self {
        self.desc.usage = TextureUsage::UnorderedAccess;
        if self.desc.mip_levels == 1 {
            self.desc.mip_levels = 0;
        }
        self.generate_mips = true;
        self
    }
}

pub struct UploadPool {
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for UploadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPool")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl UploadPool {
    pub fn new(threads: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("keel-upload-{i}"))
            .build()
            .context("failed to build upload thread pool")?;
        log::debug!("upload pool started with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn from_init(init: &DeviceInit) -> anyhow::Result<Self> {
        Self::new(init.upload_threads)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Creates every requested texture. Results are in request order.
    ///
    /// Requests asking for mips need `mips`; without it their chain is left
    /// as uploaded.
    pub fn load_textures(
        &self,
        device: &Device,
        requests: Vec<TextureRequest>,
        mips: Option<&MipMapGenerator>,
    ) -> Vec<Texture> {
        let count = requests.len();
        let textures: Vec<Texture> = self.pool.install(|| {
            requests
                .into_par_iter()
                .map(|request| {
                    let texture = device.create_texture(&request.desc, Some(&request.pixels));
                    match (request.generate_mips, mips) {
                        (true, Some(generator)) => generator.generate(device, &texture),
                        (true, None) => log::warn!(
                            "'{}' asked for mips but no generator was supplied",
                            request.desc.name
                        ),
                        (false, _) => {}
                    }
                    texture
                })
                .collect()
        });
        log::info!("loaded {count} textures on {} upload threads", self.threads());
        textures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_INDEX;
    use crate::hal::Format;

    fn device() -> Device {
        Device::headless(4, 4, Format::Rgba8Unorm, DeviceInit::default()).0
    }

    fn solid(name: &str, size: u32, value: u8) -> TextureRequest {
        TextureRequest::new(
            TextureDesc::new(TextureUsage::Sampled, size, size, Format::Rgba8Unorm).named(name),
            vec![value; (size * size * 4) as usize],
        )
    }

    #[test]
    fn pool_size_follows_init() {
        let init = DeviceInit {
            upload_threads: 3,
            ..DeviceInit::default()
        };
        assert_eq!(UploadPool::from_init(&init).unwrap().threads(), 3);
    }

    #[test]
    fn results_keep_request_order() {
        let device = device();
        let pool = UploadPool::new(4).unwrap();
        let requests: Vec<_> = (0..12).map(|i| solid(&format!("tex {i}"), 4, i as u8)).collect();

        let textures = pool.load_textures(&device, requests, None);
        for (i, tex) in textures.iter().enumerate() {
            assert_eq!(tex.desc.name, format!("tex {i}"));
            assert_eq!(device.read_texture(tex, 0, 0)[0], i as u8);
        }
    }

    #[test]
    fn parallel_loads_get_distinct_descriptors() {
        let device = device();
        let pool = UploadPool::new(4).unwrap();
        let requests: Vec<_> = (0..16).map(|i| solid(&format!("tex {i}"), 8, 0)).collect();

        let textures = pool.load_textures(&device, requests, None);
        let mut indices: Vec<u32> = textures.iter().map(|t| t.srv_index).collect();
        assert!(indices.iter().all(|&i| i != INVALID_INDEX));
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 16);
    }

    #[test]
    fn mip_requests_get_a_full_generated_chain() {
        let device = device();
        let pool = UploadPool::new(2).unwrap();
        let generator = MipMapGenerator::new(&device);
        let pixels: Vec<u8> = (0..16 * 16).flat_map(|i| [(i % 16 * 16) as u8, 0, 0, 255]).collect();
        let request = TextureRequest::new(
            TextureDesc::new(TextureUsage::Sampled, 16, 16, Format::Rgba8Unorm),
            pixels,
        )
        .with_generated_mips();

        let textures = pool.load_textures(&device, vec![request], Some(&generator));
        let tex = &textures[0];
        assert_eq!(tex.mip_levels(), 5);
        assert_ne!(tex.uav_index, INVALID_INDEX);
        let last = device.read_texture(tex, 4, 0);
        // Mean of 0, 16, .., 240.
        assert!((119..=121).contains(&last[0]), "{:?}", &last[..4]);
    }
}
