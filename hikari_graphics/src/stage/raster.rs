/*! G-buffer fill raster stage.
 *
 * Iterates the instance cache and draws every mesh with one push constant
 * per instance. When several viewports share geometry, multiview rendering
 * writes all layers in one pass to keep draw-call traffic down.
 */

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;

use crate::{
    gbuffer::{GBufferEntry, GBufferTarget},
    vulkan::{
        context::{Context, Frame},
        descriptor::{AllocatedDescriptorSets, DescriptorSetLayout},
        device::{Device, DeviceId, DeviceMask, PendingDestruction, MAX_FRAMES_IN_FLIGHT},
        pipeline::{RasterPipeline, RasterPipelineDescriptor},
        shader::{ShaderSource, ShaderStage},
        timer::Timer,
    },
};

use super::{scene::SceneStage, CommandBufferStrategy, Dependencies, StageCore};

pub const MAX_MULTIVIEW_LAYERS: u32 = 16;

/// Entries the raster fill writes as color attachments, in attachment order.
const RASTER_COLOR_ENTRIES: [GBufferEntry; 8] = [
    GBufferEntry::Albedo,
    GBufferEntry::Material,
    GBufferEntry::Normal,
    GBufferEntry::FlatNormal,
    GBufferEntry::Curvature,
    GBufferEntry::Emission,
    GBufferEntry::ScreenMotion,
    GBufferEntry::InstanceId,
];

#[derive(Clone, Copy)]
#[repr(C)]
struct RasterPushConstants {
    instance_index: u32,
    camera_index: u32,
    pcf_samples: u32,
    pad: u32,
    ambient: [f32; 4],
}

#[derive(Clone)]
pub struct RasterStageOptions {
    pub camera_index: u32,
    pub pcf_samples: u32,
}

impl Default for RasterStageOptions {
    fn default() -> Self {
        Self {
            camera_index: 0,
            pcf_samples: 4,
        }
    }
}

pub struct RasterStage {
    device: Arc<Device>,
    core: StageCore,

    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    pipeline: RasterPipeline,
    scene_sets: AllocatedDescriptorSets,

    target: GBufferTarget,
    color_entries: Vec<GBufferEntry>,
    view_count: u32,

    scene_revision: u32,
    options: RasterStageOptions,
    stage_timer: Timer,
}

impl RasterStage {
    pub fn new(
        ctx: &Context,
        id: DeviceId,
        scene_stage: &SceneStage,
        target: GBufferTarget,
        options: RasterStageOptions,
    ) -> Result<Self> {
        let device = ctx.device(id).clone();
        let core = StageCore::new(device.clone(), CommandBufferStrategy::PerFrame)?;

        target
            .get(GBufferEntry::Depth)
            .with_context(|| "Raster stage requires a depth target")?;
        let view_count = target.layer_count().min(MAX_MULTIVIEW_LAYERS);
        assert!(
            target.layer_count() <= MAX_MULTIVIEW_LAYERS,
            "multiview render passes are capped at {MAX_MULTIVIEW_LAYERS} views"
        );

        let color_entries: Vec<GBufferEntry> = RASTER_COLOR_ENTRIES
            .iter()
            .copied()
            .filter(|entry| target.contains(*entry))
            .collect();

        let render_pass = create_render_pass(&device, &target, &color_entries, view_count)?;
        let framebuffer = create_framebuffer(&device, render_pass, &target, &color_entries)?;

        let mut defines = BTreeMap::new();
        scene_stage.get_defines(&mut defines);
        if view_count > 1 {
            defines.insert(String::from("MULTIVIEW"), String::new());
        }
        let vertex = ShaderSource::new(
            ctx.shader_cache(),
            "shader/gbuffer.vert",
            ShaderStage::Vertex,
            &defines,
        )?;
        let fragment = ShaderSource::new(
            ctx.shader_cache(),
            "shader/gbuffer.frag",
            ShaderStage::Fragment,
            &defines,
        )?;

        let mut scene_layout = DescriptorSetLayout::new(0, false);
        scene_layout.add(&vertex);
        scene_layout.add(&fragment);
        let scene_layout = Arc::new(scene_layout);
        let mut scene_sets =
            AllocatedDescriptorSets::new(ctx, DeviceMask::single(id), scene_layout.clone());
        scene_sets.reset(1)?;

        let pipeline = RasterPipeline::new(
            device.clone(),
            RasterPipelineDescriptor {
                vertex: &vertex,
                fragment: &fragment,
                layouts: vec![&scene_layout],
                render_pass,
                subpass: 0,
                vertex_bindings: crate::mesh::Mesh::vertex_input_bindings(),
                vertex_attributes: crate::mesh::Mesh::vertex_input_attributes(),
                color_attachment_count: color_entries.len() as u32,
                depth_test: true,
                depth_write: true,
                cull_mode: vk::CullModeFlags::BACK,
                depth_bias: None,
            },
        )?;

        let stage_timer = Timer::new([&device], "gbuffer raster")?;

        Ok(Self {
            device,
            core,
            render_pass,
            framebuffer,
            pipeline,
            scene_sets,
            target,
            color_entries,
            view_count,
            scene_revision: 0,
            options,
            stage_timer,
        })
    }

    fn update(&mut self, frame: &Frame, scene_stage: &SceneStage) -> Result<()> {
        let scene_changed = scene_stage.check_update(
            crate::scene::UPDATE_GEOMETRY | crate::scene::UPDATE_LIGHT,
            &mut self.scene_revision,
        );
        if !scene_changed && !self.core.needs_recording(frame.frame_index, 0) {
            return Ok(());
        }
        if scene_changed {
            self.core.clear_commands();
            scene_stage.bind(&self.scene_sets, self.device.id, 0)?;
        }

        let scene = scene_stage
            .scene()
            .with_context(|| "Raster stage run without a bound scene")?;
        let ambient = scene.ambient();
        let instances: Vec<(usize, u64)> = scene_stage
            .instances()
            .iter()
            .map(|i| (i.object_index, i.mesh_id))
            .collect();

        for frame_index in 0..MAX_FRAMES_IN_FLIGHT as u32 {
            if !self.core.needs_recording(frame_index, 0) && frame_index != frame.frame_index {
                continue;
            }
            let cb = self.core.begin_commands(frame_index, 0)?;
            let id = self.device.id;
            self.stage_timer.begin(cb, id, frame_index);

            let size = self.target.size();
            let mut clear_values = Vec::new();
            for _ in &self.color_entries {
                clear_values.push(vk::ClearValue {
                    color: vk::ClearColorValue { float32: [0.0; 4] },
                });
            }
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });

            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.render_pass)
                .framebuffer(self.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: size.0,
                        height: size.1,
                    },
                })
                .clear_values(&clear_values);
            unsafe {
                self.device.raw.cmd_begin_render_pass(
                    cb,
                    &begin_info,
                    vk::SubpassContents::INLINE,
                );
                self.device.raw.cmd_set_viewport(
                    cb,
                    0,
                    &[vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: size.0 as f32,
                        height: size.1 as f32,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    }],
                );
                self.device.raw.cmd_set_scissor(
                    cb,
                    0,
                    &[vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: size.0,
                            height: size.1,
                        },
                    }],
                );
            }

            self.pipeline.core.bind(cb);
            self.pipeline.core.set_descriptors(cb, &self.scene_sets, 0, 0);

            for (i, (object_index, _)) in instances.iter().enumerate() {
                let mesh = &scene.objects()[*object_index].mesh;
                let index_count = mesh.indices().len() as u32;
                if index_count == 0 {
                    continue;
                }
                unsafe {
                    self.device.raw.cmd_bind_vertex_buffers(
                        cb,
                        0,
                        &[mesh.vertex_buffer(id)],
                        &[0],
                    );
                    self.device.raw.cmd_bind_index_buffer(
                        cb,
                        mesh.index_buffer(id),
                        0,
                        vk::IndexType::UINT32,
                    );
                }
                let pc = RasterPushConstants {
                    instance_index: i as u32,
                    camera_index: self.options.camera_index,
                    pcf_samples: self.options.pcf_samples,
                    pad: 0,
                    ambient: [ambient.x, ambient.y, ambient.z, 0.0],
                };
                self.pipeline.core.push_constants(cb, &pc);
                unsafe {
                    self.device.raw.cmd_draw_indexed(cb, index_count, 1, 0, 0, 0);
                }
            }

            unsafe {
                self.device.raw.cmd_end_render_pass(cb);
            }
            self.stage_timer.end(cb, id, frame_index);
            self.core.end_commands(cb)?;
        }
        Ok(())
    }

    pub fn run(
        &mut self,
        frame: &Frame,
        scene_stage: &SceneStage,
        deps: &Dependencies,
    ) -> Result<Dependencies> {
        self.update(frame, scene_stage)?;
        Ok(self.core.submit(frame, deps)?.into())
    }
}

impl Drop for RasterStage {
    fn drop(&mut self) {
        self.device
            .schedule_destruction(PendingDestruction::Framebuffer(self.framebuffer));
        self.device
            .schedule_destruction(PendingDestruction::RenderPass(self.render_pass));
    }
}

fn create_render_pass(
    device: &Arc<Device>,
    target: &GBufferTarget,
    color_entries: &[GBufferEntry],
    view_count: u32,
) -> Result<vk::RenderPass> {
    let mut attachments = Vec::new();
    let mut color_refs = Vec::new();
    for entry in color_entries {
        let rt = target.get(*entry).unwrap();
        color_refs.push(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        attachments.push(
            vk::AttachmentDescription::default()
                .format(rt.format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::GENERAL),
        );
    }

    let depth = target.get(GBufferEntry::Depth).unwrap();
    let depth_ref = vk::AttachmentReference::default()
        .attachment(attachments.len() as u32)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    attachments.push(
        vk::AttachmentDescription::default()
            .format(depth.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    );

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref);

    let view_mask = (1u32 << view_count) - 1;
    let view_masks = [view_mask];
    let correlation_masks = [view_mask];
    let mut multiview_info = vk::RenderPassMultiviewCreateInfo::default()
        .view_masks(&view_masks)
        .correlation_masks(&correlation_masks);

    let mut create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass));
    if view_count > 1 {
        create_info = create_info.push_next(&mut multiview_info);
    }

    let render_pass = unsafe { device.raw.create_render_pass(&create_info, None)? };
    Ok(render_pass)
}

fn create_framebuffer(
    device: &Arc<Device>,
    render_pass: vk::RenderPass,
    target: &GBufferTarget,
    color_entries: &[GBufferEntry],
) -> Result<vk::Framebuffer> {
    let mut views: Vec<vk::ImageView> = color_entries
        .iter()
        .map(|entry| target.get(*entry).unwrap().view)
        .collect();
    views.push(target.get(GBufferEntry::Depth).unwrap().view);

    let size = target.size();
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(&views)
        .width(size.0)
        .height(size.1)
        .layers(1);
    let framebuffer = unsafe { device.raw.create_framebuffer(&create_info, None)? };
    Ok(framebuffer)
}
