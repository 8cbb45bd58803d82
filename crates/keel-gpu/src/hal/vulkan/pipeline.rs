//! WGSL programs compiled to SPIR-V and built into pipelines.
//!
//! Programs supply WGSL bodies with fixed entry points (`vs_main`/`fs_main`
//! or `cs_main`); the bindless prelude is prepended before compilation.

use ash::vk;

use crate::hal::{
    ComputePipelineDesc, GraphicsPipelineDesc, HalError, HalResult, PipelineDesc, PipelineId,
};

use super::conversion;
use super::state::Shared;

pub const PRELUDE: &str = include_str!("shaders/bindless.wgsl");

pub(super) struct VkPipeline {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
}

/// Compiles a program body against the bindless prelude.
pub fn compile(name: &str, body: &str) -> HalResult<Vec<u32>> {
    let source = format!("{PRELUDE}\n{body}");
    let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
        HalError::Unsupported(format!("'{name}' failed to parse:\n{}", e.emit_to_string(&source)))
    })?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| {
        HalError::Unsupported(format!("'{name}' failed to validate:\n{}", e.emit_to_string(&source)))
    })?;
    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        ..Default::default()
    };
    naga::back::spv::write_vec(&module, &info, &options, None)
        .map_err(|e| HalError::Unsupported(format!("'{name}' failed to emit SPIR-V: {e}")))
}

impl Shared {
    fn shader_module(&self, name: &str, body: Option<&str>) -> HalResult<vk::ShaderModule> {
        let body = body.ok_or_else(|| {
            HalError::Unsupported(format!("'{name}' has no WGSL body for this device"))
        })?;
        let words = compile(name, body)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| HalError::Unsupported(format!("'{name}' shader module: {e}")))
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> HalResult<PipelineId> {
        let pipeline = match desc {
            PipelineDesc::Graphics(d) => self.graphics_pipeline(d)?,
            PipelineDesc::Compute(d) => self.compute_pipeline(d)?,
        };
        let id = PipelineId(self.next_id());
        self.pipelines.write().insert(id, pipeline);
        log::debug!("pipeline '{}' compiled", desc.name());
        Ok(id)
    }

    pub fn destroy_pipeline(&self, pipeline: PipelineId) {
        if let Some(p) = self.pipelines.write().remove(&pipeline) {
            unsafe { self.device.destroy_pipeline(p.pipeline, None) };
        }
    }

    fn compute_pipeline(&self, desc: &ComputePipelineDesc) -> HalResult<VkPipeline> {
        let module = self.shader_module(&desc.name, desc.program.wgsl())?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"cs_main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.bindless.pipeline_layout);
        let created = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipelines = created
            .map_err(|(_, e)| HalError::Unsupported(format!("'{}' compute pipeline: {e}", desc.name)))?;
        Ok(VkPipeline {
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    fn graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> HalResult<VkPipeline> {
        let module = self.shader_module(&desc.name, desc.program.wgsl())?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(module)
                .name(c"vs_main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(c"fs_main"),
        ];

        // Vertices are fetched from buffers by index; nothing is bound.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .render_target_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let depth_stencil = match &desc.depth {
            Some(depth) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(depth.write)
                .depth_compare_op(conversion::compare_op(depth.compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = desc
            .render_target_formats
            .iter()
            .map(|&f| conversion::format(f))
            .collect();
        let depth_format = desc
            .depth
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |d| conversion::format(d.format));
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .color_blend_state(&blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic)
            .layout(self.bindless.pipeline_layout)
            .push_next(&mut rendering);
        let created = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipelines = created
            .map_err(|(_, e)| HalError::Unsupported(format!("'{}' graphics pipeline: {e}", desc.name)))?;
        Ok(VkPipeline {
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_compiles_on_its_own() {
        let words = compile("empty", "@compute @workgroup_size(1) fn cs_main() {}").unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn root_constants_reach_storage_writes() {
        let body = r#"
            @compute @workgroup_size(8, 8, 1)
            fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
                let value = vec4<f32>(root_float(1u));
                textureStore(storage_rgba32f[root_constant(0u)], vec2<i32>(id.xy), value);
            }
        "#;
        assert!(compile("fill", body).is_ok());
    }

    #[test]
    fn broken_bodies_report_the_program() {
        let err = compile("broken", "fn cs_main( {").unwrap_err();
        assert!(err.to_string().contains("'broken'"));
    }
}
