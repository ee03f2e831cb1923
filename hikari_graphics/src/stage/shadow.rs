/*! Shadow map atlas build stage.
 *
 * Renders every shadow map face and cascade the scene stage laid out into
 * one depth atlas. Omnidirectional maps occupy a 3x2 face grid inside their
 * atlas rect; directional maps get one rect per cascade. The stage owns the
 * render pass and pipeline, the scene stage owns the atlas itself.
 */

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;
use nalgebra::Matrix4;

use crate::vulkan::{
    context::{Context, Frame},
    descriptor::{AllocatedDescriptorSets, DescriptorSetLayout},
    device::{Device, DeviceId, DeviceMask, PendingDestruction, MAX_FRAMES_IN_FLIGHT},
    pipeline::{RasterPipeline, RasterPipelineDescriptor},
    shader::{ShaderSource, ShaderStage},
    timer::Timer,
};

use super::{scene::SceneStage, CommandBufferStrategy, Dependencies, StageCore};

/// Face offsets of the 3x2 omnidirectional layout:
/// +X +Y +Z / -X -Y -Z.
const OMNI_FACE_OFFSETS: [(u32, u32); 6] = [(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)];

#[derive(Clone, Copy)]
#[repr(C)]
struct ShadowPushConstants {
    view_proj: [[f32; 4]; 4],
    instance_index: u32,
}

pub struct ShadowMapStage {
    device: Arc<Device>,
    core: StageCore,

    render_pass: vk::RenderPass,
    framebuffer: Option<(vk::Framebuffer, (u32, u32))>,
    pipeline: RasterPipeline,
    scene_sets: AllocatedDescriptorSets,

    scene_revision: u32,
    stage_timer: Timer,
}

impl ShadowMapStage {
    pub fn new(ctx: &Context, id: DeviceId, scene_stage: &SceneStage) -> Result<Self> {
        let device = ctx.device(id).clone();
        let core = StageCore::new(device.clone(), CommandBufferStrategy::PerFrame)?;

        let render_pass = create_depth_render_pass(&device, vk::Format::D32_SFLOAT)?;

        let mut defines = BTreeMap::new();
        scene_stage.get_defines(&mut defines);
        let vertex = ShaderSource::new(
            ctx.shader_cache(),
            "shader/shadow.vert",
            ShaderStage::Vertex,
            &defines,
        )?;
        let fragment = ShaderSource::new(
            ctx.shader_cache(),
            "shader/shadow.frag",
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
                color_attachment_count: 0,
                depth_test: true,
                depth_write: true,
                // Slope-scaled bias keeps acne off curved casters.
                cull_mode: vk::CullModeFlags::FRONT,
                depth_bias: Some((1.25, 1.75)),
            },
        )?;

        let stage_timer = Timer::new([&device], "shadow maps")?;

        Ok(Self {
            device,
            core,
            render_pass,
            framebuffer: None,
            pipeline,
            scene_sets,
            scene_revision: 0,
            stage_timer,
        })
    }

    fn refresh_framebuffer(&mut self, scene_stage: &SceneStage) -> Result<()> {
        let atlas = scene_stage
            .shadow_map_atlas()
            .with_context(|| "Shadow stage run without a shadow atlas")?;
        let size = atlas.size();
        if let Some((_, current)) = self.framebuffer {
            if current == size {
                return Ok(());
            }
        }
        if let Some((old, _)) = self.framebuffer.take() {
            self.device
                .schedule_destruction(PendingDestruction::Framebuffer(old));
        }

        let views = [atlas.texture().view(self.device.id)];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(self.render_pass)
            .attachments(&views)
            .width(size.0)
            .height(size.1)
            .layers(1);
        let framebuffer = unsafe { self.device.raw.create_framebuffer(&create_info, None)? };
        self.framebuffer = Some((framebuffer, size));
        self.core.clear_commands();
        Ok(())
    }

    fn update(&mut self, frame: &Frame, scene_stage: &SceneStage) -> Result<()> {
        if scene_stage.shadow_maps().is_empty() {
            return Ok(());
        }
        let scene_changed = scene_stage.check_update(
            crate::scene::UPDATE_GEOMETRY | crate::scene::UPDATE_LIGHT,
            &mut self.scene_revision,
        );
        self.refresh_framebuffer(scene_stage)?;
        if !scene_changed && !self.core.needs_recording(frame.frame_index, 0) {
            return Ok(());
        }
        if scene_changed {
            self.core.clear_commands();
            scene_stage.bind(&self.scene_sets, self.device.id, 0)?;
        }

        let scene = scene_stage
            .scene()
            .with_context(|| "Shadow stage run without a bound scene")?;
        let atlas = scene_stage.shadow_map_atlas().unwrap();
        let (framebuffer, atlas_size) = self.framebuffer.unwrap();
        let id = self.device.id;

        for frame_index in 0..MAX_FRAMES_IN_FLIGHT as u32 {
            if !self.core.needs_recording(frame_index, 0) && frame_index != frame.frame_index {
                continue;
            }
            let cb = self.core.begin_commands(frame_index, 0)?;
            self.stage_timer.begin(cb, id, frame_index);

            let clear_values = [vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            }];
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: atlas_size.0,
                        height: atlas_size.1,
                    },
                })
                .clear_values(&clear_values);
            unsafe {
                self.device
                    .raw
                    .cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE);
            }

            self.pipeline.core.bind(cb);
            self.pipeline.core.set_descriptors(cb, &self.scene_sets, 0, 0);

            for sm in scene_stage.shadow_maps() {
                let rect = atlas.rect_px(sm.atlas_index);
                if sm.faces.len() == 6 {
                    for (face, cam) in sm.faces.iter().enumerate() {
                        let (ox, oy) = OMNI_FACE_OFFSETS[face];
                        let viewport = (
                            rect.0 + (ox * sm.face_size.0) as i32,
                            rect.1 + (oy * sm.face_size.1) as i32,
                            sm.face_size.0,
                            sm.face_size.1,
                        );
                        self.draw_casters(cb, scene, scene_stage, viewport, &cam.view_projection());
                    }
                } else {
                    let viewport = (rect.0, rect.1, sm.face_size.0, sm.face_size.1);
                    self.draw_casters(
                        cb,
                        scene,
                        scene_stage,
                        viewport,
                        &sm.faces[0].view_projection(),
                    );
                    for cascade in &sm.cascades {
                        let crect = atlas.rect_px(cascade.atlas_index);
                        let viewport = (crect.0, crect.1, sm.face_size.0, sm.face_size.1);
                        self.draw_casters(
                            cb,
                            scene,
                            scene_stage,
                            viewport,
                            &cascade.camera.view_projection(),
                        );
                    }
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

    fn draw_casters(
        &self,
        cb: vk::CommandBuffer,
        scene: &crate::scene::Scene,
        scene_stage: &SceneStage,
        viewport: (i32, i32, u32, u32),
        view_proj: &Matrix4<f32>,
    ) {
        let id = self.device.id;
        unsafe {
            self.device.raw.cmd_set_viewport(
                cb,
                0,
                &[vk::Viewport {
                    x: viewport.0 as f32,
                    y: viewport.1 as f32,
                    width: viewport.2 as f32,
                    height: viewport.3 as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.device.raw.cmd_set_scissor(
                cb,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: viewport.0,
                        y: viewport.1,
                    },
                    extent: vk::Extent2D {
                        width: viewport.2,
                        height: viewport.3,
                    },
                }],
            );
        }

        for (i, instance) in scene_stage.instances().iter().enumerate() {
            let mesh = &scene.objects()[instance.object_index].mesh;
            let index_count = mesh.indices().len() as u32;
            if index_count == 0 {
                continue;
            }
            unsafe {
                self.device
                    .raw
                    .cmd_bind_vertex_buffers(cb, 0, &[mesh.vertex_buffer(id)], &[0]);
                self.device.raw.cmd_bind_index_buffer(
                    cb,
                    mesh.index_buffer(id),
                    0,
                    vk::IndexType::UINT32,
                );
            }
            let pc = ShadowPushConstants {
                view_proj: (*view_proj).into(),
                instance_index: i as u32,
            };
            self.pipeline.core.push_constants(cb, &pc);
            unsafe {
                self.device.raw.cmd_draw_indexed(cb, index_count, 1, 0, 0, 0);
            }
        }
    }

    pub fn run(
        &mut self,
        frame: &Frame,
        scene_stage: &SceneStage,
        deps: &Dependencies,
    ) -> Result<Dependencies> {
        if scene_stage.shadow_maps().is_empty() {
            return Ok(deps.clone());
        }
        self.update(frame, scene_stage)?;
        Ok(self.core.submit(frame, deps)?.into())
    }
}

impl Drop for ShadowMapStage {
    fn drop(&mut self) {
        if let Some((framebuffer, _)) = self.framebuffer.take() {
            self.device
                .schedule_destruction(PendingDestruction::Framebuffer(framebuffer));
        }
        self.device
            .schedule_destruction(PendingDestruction::RenderPass(self.render_pass));
    }
}

fn create_depth_render_pass(device: &Arc<Device>, format: vk::Format) -> Result<vk::RenderPass> {
    let attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let depth_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .depth_stencil_attachment(&depth_ref);

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass));
    let render_pass = unsafe { device.raw.create_render_pass(&create_info, None)? };
    Ok(render_pass)
}
