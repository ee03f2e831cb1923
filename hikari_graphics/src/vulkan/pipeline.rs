use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::util::align_up_to;

use super::{
    descriptor::{AllocatedDescriptorSets, DescriptorSetLayout, PushDescriptorSet},
    device::{Device, PendingDestruction},
    resource::{Buffer, BufferDescriptor},
    shader::ShaderSource,
};

/// Shared capability surface of the three pipeline kinds: binding, push
/// constants and descriptor set plumbing over one layout.
pub struct PipelineCore {
    pub(crate) raw: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_constant_stages: vk::ShaderStageFlags,
    device: Arc<Device>,
}

impl PipelineCore {
    fn create_layout(
        device: &Arc<Device>,
        layouts: &[&Arc<DescriptorSetLayout>],
        shaders: &[&ShaderSource],
    ) -> Result<(vk::PipelineLayout, vk::ShaderStageFlags)> {
        let set_layouts: Vec<vk::DescriptorSetLayout> = layouts
            .iter()
            .map(|layout| layout.handle(device))
            .collect::<Result<_>>()?;

        let mut push_constant_size = 0;
        let mut push_constant_stages = vk::ShaderStageFlags::empty();
        for shader in shaders {
            if shader.reflection.push_constant_size > 0 {
                push_constant_size =
                    push_constant_size.max(shader.reflection.push_constant_size);
                push_constant_stages |= shader.stage.to_vulkan_stage_flags();
            }
        }

        let push_constant_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange::default()
                .stage_flags(push_constant_stages)
                .offset(0)
                .size(push_constant_size)]
        } else {
            Vec::new()
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.raw.create_pipeline_layout(&layout_info, None)? };
        Ok((layout, push_constant_stages))
    }

    pub fn bind(&self, cb: vk::CommandBuffer) {
        unsafe {
            self.device.raw.cmd_bind_pipeline(cb, self.bind_point, self.raw);
        }
    }

    pub fn push_constants<T: Copy>(&self, cb: vk::CommandBuffer, data: &T) {
        let bytes = unsafe {
            std::slice::from_raw_parts(data as *const T as *const u8, std::mem::size_of::<T>())
        };
        unsafe {
            self.device
                .raw
                .cmd_push_constants(cb, self.layout, self.push_constant_stages, 0, bytes);
        }
    }

    pub fn set_descriptors(
        &self,
        cb: vk::CommandBuffer,
        sets: &AllocatedDescriptorSets,
        alternative: u32,
        set_index: u32,
    ) {
        let set = sets.set(self.device.id, alternative);
        unsafe {
            self.device.raw.cmd_bind_descriptor_sets(
                cb,
                self.bind_point,
                self.layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    pub fn push_descriptors(
        &self,
        cb: vk::CommandBuffer,
        set: &PushDescriptorSet,
        set_index: u32,
    ) {
        set.push(&self.device, cb, self.bind_point, self.layout, set_index);
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for PipelineCore {
    fn drop(&mut self) {
        self.device
            .schedule_destruction(PendingDestruction::Pipeline(self.raw));
        self.device
            .schedule_destruction(PendingDestruction::PipelineLayout(self.layout));
    }
}

pub struct ComputePipeline {
    pub core: PipelineCore,
}

impl ComputePipeline {
    pub fn new(
        device: Arc<Device>,
        shader: &ShaderSource,
        layouts: &[&Arc<DescriptorSetLayout>],
    ) -> Result<Self> {
        let (layout, push_constant_stages) =
            PipelineCore::create_layout(&device, layouts, &[shader])?;

        let module = shader.create_module(&device.raw)?;
        let entry_point = std::ffi::CString::new("main").unwrap();
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point.as_c_str());

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let raw = unsafe {
            device
                .raw
                .create_compute_pipelines(
                    device.pipeline_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, e)| e)
                .with_context(|| "Compute pipeline creation failed")?[0]
        };
        unsafe {
            device.raw.destroy_shader_module(module, None);
        }

        Ok(Self {
            core: PipelineCore {
                raw,
                layout,
                bind_point: vk::PipelineBindPoint::COMPUTE,
                push_constant_stages,
                device,
            },
        })
    }

    pub fn dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe {
            self.core.device.raw.cmd_dispatch(cb, x, y, z);
        }
    }
}

pub struct RasterPipelineDescriptor<'a> {
    pub vertex: &'a ShaderSource,
    pub fragment: &'a ShaderSource,
    pub layouts: Vec<&'a Arc<DescriptorSetLayout>>,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub color_attachment_count: u32,
    pub depth_test: bool,
    pub depth_write: bool,
    pub cull_mode: vk::CullModeFlags,
    pub depth_bias: Option<(f32, f32)>,
}

pub struct RasterPipeline {
    pub core: PipelineCore,
}

impl RasterPipeline {
    pub fn new(device: Arc<Device>, desc: RasterPipelineDescriptor) -> Result<Self> {
        let (layout, push_constant_stages) =
            PipelineCore::create_layout(&device, &desc.layouts, &[desc.vertex, desc.fragment])?;

        let vertex_module = desc.vertex.create_module(&device.raw)?;
        let fragment_module = desc.fragment.create_module(&device.raw)?;
        let entry_point = std::ffi::CString::new("main").unwrap();
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(entry_point.as_c_str()),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(entry_point.as_c_str()),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // Viewport and scissor are dynamic; the counts still have to be set.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let mut rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        if let Some((constant, slope)) = desc.depth_bias {
            rasterization_state = rasterization_state
                .depth_bias_enable(true)
                .depth_bias_constant_factor(constant)
                .depth_bias_slope_factor(slope);
        }

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let color_blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA);
            desc.color_attachment_count as usize
        ];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(desc.render_pass)
            .subpass(desc.subpass);

        let raw = unsafe {
            device
                .raw
                .create_graphics_pipelines(
                    device.pipeline_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, e)| e)
                .with_context(|| "Raster pipeline creation failed")?[0]
        };
        unsafe {
            device.raw.destroy_shader_module(vertex_module, None);
            device.raw.destroy_shader_module(fragment_module, None);
        }

        Ok(Self {
            core: PipelineCore {
                raw,
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                push_constant_stages,
                device,
            },
        })
    }
}

pub struct HitGroup {
    pub closest_hit: Option<ShaderSource>,
    pub any_hit: Option<ShaderSource>,
    pub intersection: Option<ShaderSource>,
}

pub struct RayTracingShaderSources {
    pub raygen: ShaderSource,
    pub hit_groups: Vec<HitGroup>,
    pub miss: Vec<ShaderSource>,
}

/// Offsets of one shader binding table region within the SBT buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct SbtLayout {
    pub rgen: SbtRegion,
    pub hit: SbtRegion,
    pub miss: SbtRegion,
    pub total_size: u64,
    /// Destination offset of each shader group handle, in group index order
    /// `{raygen, hit groups, miss}`.
    pub handle_offsets: Vec<u64>,
}

/// Lays out the shader binding table regions with each group padded to the
/// handle alignment and each region padded to the base alignment.
pub(crate) fn compute_sbt_layout(
    hit_group_count: u64,
    miss_count: u64,
    handle_size: u64,
    handle_alignment: u64,
    base_alignment: u64,
) -> SbtLayout {
    let stride = align_up_to(handle_size, handle_alignment);
    let mut handle_offsets = Vec::new();
    let mut offset = 0;

    let rgen = SbtRegion {
        offset,
        stride,
        size: stride,
    };
    handle_offsets.push(offset);
    offset = align_up_to(offset + stride, base_alignment);

    let hit = SbtRegion {
        offset,
        stride,
        size: stride * hit_group_count,
    };
    for i in 0..hit_group_count {
        handle_offsets.push(offset + stride * i);
    }
    offset = align_up_to(offset + stride * hit_group_count, base_alignment);

    let miss = SbtRegion {
        offset,
        stride,
        size: stride * miss_count,
    };
    for i in 0..miss_count {
        handle_offsets.push(offset + stride * i);
    }
    let total_size = align_up_to(offset + stride * miss_count, base_alignment);

    SbtLayout {
        rgen,
        hit,
        miss,
        total_size,
        handle_offsets,
    }
}

pub struct RayTracingPipeline {
    pub core: PipelineCore,
    _sbt_buffer: Buffer,
    rgen_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl RayTracingPipeline {
    pub fn new(
        device: Arc<Device>,
        sources: RayTracingShaderSources,
        layouts: &[&Arc<DescriptorSetLayout>],
        max_recursion_depth: u32,
    ) -> Result<Self> {
        let rt_fns = device
            .ray_tracing_fns
            .clone()
            .with_context(|| "Ray tracing is not supported on this device")?;
        let rt_properties = device
            .rt_properties
            .with_context(|| "Missing ray tracing properties")?;

        let mut all_shaders: Vec<&ShaderSource> = vec![&sources.raygen];
        for group in &sources.hit_groups {
            all_shaders.extend(group.closest_hit.as_ref());
            all_shaders.extend(group.any_hit.as_ref());
            all_shaders.extend(group.intersection.as_ref());
        }
        all_shaders.extend(sources.miss.iter());

        let (layout, push_constant_stages) =
            PipelineCore::create_layout(&device, layouts, &all_shaders)?;

        let entry_point = std::ffi::CString::new("main").unwrap();
        let entry_name = entry_point.as_c_str();
        let mut modules = Vec::new();
        let mut stages = Vec::new();
        let mut groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = Vec::new();

        let device_raw = device.raw.clone();
        fn add_stage<'a>(
            shader: &ShaderSource,
            entry_name: &'a std::ffi::CStr,
            device_raw: &ash::Device,
            modules: &mut Vec<vk::ShaderModule>,
            stages: &mut Vec<vk::PipelineShaderStageCreateInfo<'a>>,
        ) -> Result<u32> {
            let module = shader.create_module(device_raw)?;
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage.to_vulkan_stage_flags())
                    .module(module)
                    .name(entry_name),
            );
            Ok(stages.len() as u32 - 1)
        }

        let rgen_index = add_stage(
            &sources.raygen,
            entry_name,
            &device_raw,
            &mut modules,
            &mut stages,
        )?;
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(rgen_index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );

        for hit_group in &sources.hit_groups {
            let mut closest_hit = vk::SHADER_UNUSED_KHR;
            let mut any_hit = vk::SHADER_UNUSED_KHR;
            let mut intersection = vk::SHADER_UNUSED_KHR;
            if let Some(shader) = &hit_group.closest_hit {
                closest_hit = add_stage(shader, entry_name, &device_raw, &mut modules, &mut stages)?;
            }
            if let Some(shader) = &hit_group.any_hit {
                any_hit = add_stage(shader, entry_name, &device_raw, &mut modules, &mut stages)?;
            }
            if let Some(shader) = &hit_group.intersection {
                intersection = add_stage(shader, entry_name, &device_raw, &mut modules, &mut stages)?;
            }
            let group_type = if intersection != vk::SHADER_UNUSED_KHR {
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
            } else {
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
            };
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(group_type)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(intersection),
            );
        }

        for miss in &sources.miss {
            let miss_index = add_stage(miss, entry_name, &device_raw, &mut modules, &mut stages)?;
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(miss_index)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
        }

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(
                max_recursion_depth.min(rt_properties.max_ray_recursion_depth),
            )
            .layout(layout);

        let raw = unsafe {
            rt_fns
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    device.pipeline_cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|e| anyhow::anyhow!("Ray tracing pipeline creation failed: {e:?}"))?[0]
        };
        for module in modules {
            unsafe {
                device.raw.destroy_shader_module(module, None);
            }
        }

        // Fetch the group handles and copy them into a host buffer with the
        // required alignments before uploading as one piece.
        let group_count = groups.len();
        let handle_size = rt_properties.shader_group_handle_size as u64;
        let handles = unsafe {
            rt_fns.get_ray_tracing_shader_group_handles(
                raw,
                0,
                group_count as u32,
                group_count * handle_size as usize,
            )?
        };

        let sbt_layout = compute_sbt_layout(
            sources.hit_groups.len() as u64,
            sources.miss.len() as u64,
            handle_size,
            rt_properties.shader_group_handle_alignment as u64,
            rt_properties.shader_group_base_alignment as u64,
        );

        let mut sbt_data = vec![0u8; sbt_layout.total_size as usize];
        for (group_index, &dst_offset) in sbt_layout.handle_offsets.iter().enumerate() {
            let src = group_index * handle_size as usize;
            sbt_data[dst_offset as usize..dst_offset as usize + handle_size as usize]
                .copy_from_slice(&handles[src..src + handle_size as usize]);
        }

        let sbt_buffer = Buffer::new(
            device.clone(),
            BufferDescriptor::new(
                sbt_layout.total_size,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
            )
            .alignment(rt_properties.shader_group_base_alignment as u64),
        )?;
        sbt_buffer.write_data(&sbt_data)?;

        let sbt_address = sbt_buffer.device_address();
        let region = |r: SbtRegion| {
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(sbt_address + r.offset)
                .stride(r.stride)
                .size(r.size)
        };

        Ok(Self {
            rgen_region: region(sbt_layout.rgen),
            hit_region: region(sbt_layout.hit),
            miss_region: region(sbt_layout.miss),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            _sbt_buffer: sbt_buffer,
            core: PipelineCore {
                raw,
                layout,
                bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
                push_constant_stages,
                device,
            },
        })
    }

    pub fn trace_rays(&self, cb: vk::CommandBuffer, width: u32, height: u32, depth: u32) {
        let rt_fns = self
            .core
            .device
            .ray_tracing_fns
            .as_ref()
            .expect("ray tracing pipeline without ray tracing support");
        unsafe {
            rt_fns.cmd_trace_rays(
                cb,
                &self.rgen_region,
                &self.miss_region,
                &self.hit_region,
                &self.callable_region,
                width,
                height,
                depth,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbt_regions_are_base_aligned() {
        // Typical NVIDIA numbers: 32 byte handles, 32 byte handle alignment,
        // 64 byte base alignment.
        let layout = compute_sbt_layout(3, 2, 32, 32, 64);
        assert_eq!(layout.rgen, SbtRegion { offset: 0, stride: 32, size: 32 });
        assert_eq!(layout.hit.offset % 64, 0);
        assert_eq!(layout.hit.size, 96);
        assert_eq!(layout.miss.offset % 64, 0);
        assert!(layout.miss.offset >= layout.hit.offset + layout.hit.size);
        assert_eq!(layout.total_size % 64, 0);
    }

    #[test]
    fn sbt_handle_offsets_follow_group_order() {
        let layout = compute_sbt_layout(2, 1, 16, 32, 64);
        // stride = 32 (handle padded to alignment)
        assert_eq!(layout.handle_offsets.len(), 4);
        assert_eq!(layout.handle_offsets[0], 0);
        assert_eq!(layout.handle_offsets[1], layout.hit.offset);
        assert_eq!(layout.handle_offsets[2], layout.hit.offset + 32);
        assert_eq!(layout.handle_offsets[3], layout.miss.offset);
    }

    #[test]
    fn sbt_empty_miss_region_has_zero_size() {
        let layout = compute_sbt_layout(1, 0, 32, 32, 64);
        assert_eq!(layout.miss.size, 0);
        assert_eq!(layout.handle_offsets.len(), 2);
    }
}
