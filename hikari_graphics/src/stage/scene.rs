/*! Scene state engine.
 *
 * Produces the device-visible mirrors of the CPU scene for each frame in
 * flight: instance and material tables, light tables, camera blocks with
 * their previous-frame halves, shadow map tables, the sampler table and the
 * acceleration structures. The cached command buffers replay the staged
 * uploads, the skinning dispatches and the BLAS/TLAS builds; they are only
 * re-recorded when the instance or acceleration structure topology changes.
 */

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use nalgebra::{Matrix4, Vector2, Vector3, Vector4};

use crate::{
    atlas::Atlas,
    scene::{
        instance_needs_upload, sampler_table::SamplerTable, Camera, CameraUniform, DirectionalLight,
        InstanceCache, PointLight, Scene, ShadowMapSpec, Spotlight,
    },
    vulkan::{
        acceleration::{
            BlasBuildEntry, BlasGeometry, BottomLevelAccelerationStructure,
            TopLevelAccelerationStructure,
        },
        command::bulk_upload_barrier,
        context::{Context, Frame},
        descriptor::{AllocatedDescriptorSets, DescriptorSetLayout},
        device::{DeviceId, DeviceMask, MAX_FRAMES_IN_FLIGHT},
        pipeline::ComputePipeline,
        resource::{Buffer, BufferDescriptor, Sampler, SamplerDescriptor},
        shader::{ShaderSource, ShaderStage},
        staged::StagedBuffer,
        timer::Timer,
    },
};

use super::{CommandBufferStrategy, Dependencies, StageCore};

const SKINNING_GROUP_SIZE: u32 = 32;
const EXTRACT_GROUP_SIZE: u32 = 256;
const PRE_TRANSFORM_GROUP_SIZE: u32 = 256;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct MaterialEntry {
    albedo_factor: [f32; 4],
    metallic_roughness_factor: [f32; 4],
    emission_factor_double_sided: [f32; 4],
    transmittance: f32,
    ior: f32,
    normal_factor: f32,
    pad: f32,
    albedo_tex_id: i32,
    metallic_roughness_tex_id: i32,
    normal_tex_id: i32,
    emission_tex_id: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct InstanceEntry {
    light_base_id: i32,
    sh_grid_index: i32,
    pad: u32,
    shadow_terminator_mul: f32,
    model: [[f32; 4]; 4],
    model_normal: [[f32; 4]; 4],
    model_prev: [[f32; 4]; 4],
    material: MaterialEntry,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PointLightEntry {
    color: [f32; 3],
    shadow_map_index: i32,
    dir: [f32; 3],
    dir_cutoff: f32,
    pos: [f32; 3],
    radius: f32,
    dir_falloff: f32,
    cutoff_radius: f32,
    spot_radius: f32,
    padding: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct DirectionalLightEntry {
    color: [f32; 3],
    shadow_map_index: i32,
    dir: [f32; 3],
    dir_cutoff: f32,
}

// Built on the GPU by the extraction pass; the host only sizes the buffer.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TriLightEntry {
    pos: [[f32; 4]; 3],
    emission_factor: [f32; 4],
    uv: [[f32; 2]; 3],
    emission_tex_id: i32,
    padding: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct ShadowMapEntry {
    /// Directional: number of additional cascades. 0 perspective, 1 omni.
    map_type: i32,
    min_bias: f32,
    max_bias: f32,
    cascade_index: i32,
    /// Portion of the atlas holding this map; for omni maps this is the +X
    /// face and the other faces are arranged in a 3x2 grid from it.
    /// xy = origin, zw = size, all normalized.
    rect: [f32; 4],
    clip_info: [f32; 4],
    projection_info_radius: [f32; 4],
    world_to_shadow: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct ShadowMapCascadeEntry {
    /// xy = offset, z = 1/scale, w = bias scale.
    offset_scale: [f32; 4],
    rect: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SceneMetadataEntry {
    point_light_count: u32,
    directional_light_count: u32,
    tri_light_count: u32,
    instance_count: u32,
    ambient: [f32; 4],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SkinningPushConstants {
    vertex_count: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ExtractTriLightPushConstants {
    triangle_count: u32,
    instance_id: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct PreTransformPushConstants {
    vertex_count: u32,
    instance_id: u32,
}

#[derive(Clone)]
pub struct ShadowCascade {
    pub atlas_index: usize,
    pub offset: Vector2<f32>,
    pub scale: f32,
    pub bias_scale: f32,
    pub camera: Camera,
}

#[derive(Clone)]
pub struct ShadowMapInstance {
    pub atlas_index: usize,
    pub map_index: usize,
    pub face_size: (u32, u32),
    pub min_bias: f32,
    pub max_bias: f32,
    pub radius: Vector2<f32>,
    pub faces: Vec<Camera>,
    pub cascades: Vec<ShadowCascade>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKey {
    Directional(usize),
    Point(usize),
    Spot(usize),
}

/// Aligns a cascade offset to the texel grid of the base cascade so that
/// camera movement does not make shadow edges shimmer.
pub(crate) fn align_cascade(
    offset: Vector2<f32>,
    area: Vector2<f32>,
    scale: f32,
    resolution: (u32, u32),
) -> Vector2<f32> {
    let step = Vector2::new(
        area.x * scale / resolution.0 as f32,
        area.y * scale / resolution.1 as f32,
    );
    Vector2::new(
        (offset.x / step.x).round() * step.x,
        (offset.y / step.y).round() * step.y,
    )
}

/// Writes every camera block followed by its previous-frame value, and
/// refreshes the CPU-side shadow copy afterwards. The layout per camera is
/// `[current, previous]`.
pub(crate) fn fill_camera_table(
    uniforms: &[CameraUniform],
    old_data: &mut Vec<u8>,
    out: &mut [u8],
) {
    let block = std::mem::size_of::<CameraUniform>();
    let total = uniforms.len() * block;
    if old_data.len() != total {
        // First fill: previous values mirror the current ones.
        old_data.resize(total, 0);
        for (i, uniform) in uniforms.iter().enumerate() {
            let bytes = unsafe {
                std::slice::from_raw_parts(uniform as *const CameraUniform as *const u8, block)
            };
            old_data[i * block..(i + 1) * block].copy_from_slice(bytes);
        }
    }
    for (i, uniform) in uniforms.iter().enumerate() {
        let bytes = unsafe {
            std::slice::from_raw_parts(uniform as *const CameraUniform as *const u8, block)
        };
        let base = i * block * 2;
        out[base..base + block].copy_from_slice(bytes);
        out[base + block..base + block * 2]
            .copy_from_slice(&old_data[i * block..(i + 1) * block]);
        old_data[i * block..(i + 1) * block].copy_from_slice(bytes);
    }
}

#[derive(Clone)]
pub struct SceneStageOptions {
    pub max_instances: usize,
    pub max_samplers: u32,
    pub gather_emissive_triangles: bool,
    pub pre_transform_vertices: bool,
    pub shadow_mapping: bool,
}

impl Default for SceneStageOptions {
    fn default() -> Self {
        Self {
            max_instances: 1024,
            max_samplers: 128,
            gather_emissive_triangles: false,
            pre_transform_vertices: false,
            shadow_mapping: false,
        }
    }
}

struct DevicePipelines {
    skinning: ComputePipeline,
    extract_tri_lights: Option<ComputePipeline>,
    pre_transform: Option<ComputePipeline>,
}

struct PerDeviceBuffers {
    device_id: DeviceId,
    tri_light_buffer: Option<Buffer>,
    pre_transformed_vertices: Option<Buffer>,
    pre_transformed_capacity: u64,
}

pub struct SceneStage {
    mask: DeviceMask,
    cores: Vec<(DeviceId, StageCore)>,

    scene: Option<Scene>,
    instance_cache: InstanceCache,
    sampler_table: SamplerTable,

    instance_data: StagedBuffer,
    point_light_data: StagedBuffer,
    directional_light_data: StagedBuffer,
    shadow_map_data: StagedBuffer,
    camera_data: StagedBuffer,
    scene_metadata: StagedBuffer,
    envmap_alias_data: StagedBuffer,
    light_aabb_data: StagedBuffer,

    /// Previous camera blocks, kept on the CPU for the temporal halves.
    old_camera_data: Vec<u8>,

    device_buffers: Vec<PerDeviceBuffers>,
    joint_buffers: HashMap<usize, StagedBuffer>,

    blas_map: HashMap<u64, BottomLevelAccelerationStructure>,
    light_blas: Option<BottomLevelAccelerationStructure>,
    tlas: Option<TopLevelAccelerationStructure>,
    as_instance_count: usize,
    as_rebuild: bool,
    command_buffers_outdated: bool,
    force_instance_refresh_frames: u32,

    pipelines: Vec<(DeviceId, DevicePipelines)>,
    scene_sets: AllocatedDescriptorSets,
    skinning_set: crate::vulkan::descriptor::PushDescriptorSet,
    pre_transform_set: Option<crate::vulkan::descriptor::PushDescriptorSet>,

    shadow_maps: Vec<ShadowMapInstance>,
    shadow_map_indices: HashMap<LightKey, usize>,
    shadow_atlas: Option<Atlas>,
    shadow_sampler: Sampler,
    envmap_sampler: Sampler,

    tri_light_count: usize,
    total_vertex_count: usize,
    ray_tracing: bool,

    options: SceneStageOptions,
    stage_timer: Timer,
}

impl SceneStage {
    pub fn new(ctx: &Context, mask: DeviceMask, options: SceneStageOptions) -> Result<Self> {
        let cores = mask
            .iter()
            .map(|id| {
                Ok((
                    id,
                    StageCore::new(ctx.device(id).clone(), CommandBufferStrategy::PerFrame)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let staged = |usage: vk::BufferUsageFlags, size: u64| -> Result<StagedBuffer> {
            StagedBuffer::new(ctx, mask, size, usage)
        };
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let ray_tracing = ctx.is_ray_tracing_supported();

        let mut defines = BTreeMap::new();
        if ray_tracing {
            defines.insert(String::from("RAY_TRACING_SUPPORTED"), String::new());
        }
        defines.insert(
            String::from("GROUP_SIZE"),
            SKINNING_GROUP_SIZE.to_string(),
        );
        let skinning_shader = ShaderSource::new(
            ctx.shader_cache(),
            "shader/skinning.comp",
            ShaderStage::Compute,
            &defines,
        )?;

        let mut extract_defines = BTreeMap::new();
        if ray_tracing {
            extract_defines.insert(String::from("RAY_TRACING_SUPPORTED"), String::new());
        }
        extract_defines.insert(
            String::from("GROUP_SIZE"),
            EXTRACT_GROUP_SIZE.to_string(),
        );
        extract_defines.insert(
            String::from("MAX_INSTANCES"),
            options.max_instances.to_string(),
        );
        if options.pre_transform_vertices {
            extract_defines.insert(String::from("PRE_TRANSFORMED_VERTICES"), String::new());
        }
        let extract_shader = if options.gather_emissive_triangles {
            Some(ShaderSource::new(
                ctx.shader_cache(),
                "shader/extract_tri_lights.comp",
                ShaderStage::Compute,
                &extract_defines,
            )?)
        } else {
            None
        };

        let mut pre_transform_defines = BTreeMap::new();
        if ray_tracing {
            pre_transform_defines.insert(String::from("RAY_TRACING_SUPPORTED"), String::new());
        }
        pre_transform_defines.insert(
            String::from("GROUP_SIZE"),
            PRE_TRANSFORM_GROUP_SIZE.to_string(),
        );
        let pre_transform_shader = if options.pre_transform_vertices {
            Some(ShaderSource::new(
                ctx.shader_cache(),
                "shader/pre_transform.comp",
                ShaderStage::Compute,
                &pre_transform_defines,
            )?)
        } else {
            None
        };

        // One layout over everything the scene owns; the same set is bound
        // by the internal pipelines and handed to the renderer stages.
        let mut scene_layout = DescriptorSetLayout::new(0, false);
        scene_layout.add(&skinning_shader);
        if let Some(shader) = &extract_shader {
            scene_layout.add(shader);
        }
        if let Some(shader) = &pre_transform_shader {
            scene_layout.add(shader);
        }

        // Per-dispatch mesh buffers go through push descriptors in set 1.
        let mut skinning_layout = DescriptorSetLayout::new(1, true);
        skinning_layout.add(&skinning_shader);
        let skinning_layout = Arc::new(skinning_layout);
        let pre_transform_layout = pre_transform_shader.as_ref().map(|shader| {
            let mut layout = DescriptorSetLayout::new(1, true);
            layout.add(shader);
            Arc::new(layout)
        });
        scene_layout.set_binding_params(
            "textures",
            options.max_samplers,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "vertices",
            options.max_instances as u32,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "indices",
            options.max_instances as u32,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "envmap_alias_table",
            1,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "envmap_tex",
            1,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "shadow_map_atlas_tex",
            1,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        let scene_layout = Arc::new(scene_layout);

        let mut scene_sets = AllocatedDescriptorSets::new(ctx, mask, scene_layout.clone());
        scene_sets.reset(1)?;

        let pipelines = mask
            .iter()
            .map(|id| {
                let device = ctx.device(id).clone();
                let skinning = ComputePipeline::new(
                    device.clone(),
                    &skinning_shader,
                    &[&scene_layout, &skinning_layout],
                )?;
                let extract_tri_lights = extract_shader
                    .as_ref()
                    .map(|shader| ComputePipeline::new(device.clone(), shader, &[&scene_layout]))
                    .transpose()?;
                let pre_transform = pre_transform_shader
                    .as_ref()
                    .map(|shader| {
                        ComputePipeline::new(
                            device.clone(),
                            shader,
                            &[&scene_layout, pre_transform_layout.as_ref().unwrap()],
                        )
                    })
                    .transpose()?;
                Ok((
                    id,
                    DevicePipelines {
                        skinning,
                        extract_tri_lights,
                        pre_transform,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let skinning_set = crate::vulkan::descriptor::PushDescriptorSet::new(skinning_layout);
        let pre_transform_set = pre_transform_layout
            .map(crate::vulkan::descriptor::PushDescriptorSet::new);

        let device_buffers = mask
            .iter()
            .map(|id| PerDeviceBuffers {
                device_id: id,
                tri_light_buffer: None,
                pre_transformed_vertices: None,
                pre_transformed_capacity: 0,
            })
            .collect();

        let shadow_sampler = Sampler::new(
            ctx,
            mask,
            SamplerDescriptor::nearest_clamp().min_filter(vk::Filter::LINEAR),
        )?;
        let envmap_sampler = Sampler::new(
            ctx,
            mask,
            SamplerDescriptor::new().address_modes(vk::SamplerAddressMode::CLAMP_TO_EDGE),
        )?;

        let devices: Vec<_> = mask.iter().map(|id| ctx.device(id).clone()).collect();
        let stage_timer = Timer::new(devices.iter(), "scene update")?;

        Ok(Self {
            mask,
            cores,
            scene: None,
            instance_cache: InstanceCache::default(),
            sampler_table: SamplerTable::new(ctx, mask)?,
            instance_data: staged(storage, 0)?,
            point_light_data: staged(storage, 0)?,
            directional_light_data: staged(storage, 0)?,
            shadow_map_data: staged(storage, 0)?,
            camera_data: staged(storage, 0)?,
            scene_metadata: staged(vk::BufferUsageFlags::UNIFORM_BUFFER, 0)?,
            envmap_alias_data: staged(storage, 0)?,
            light_aabb_data: staged(
                storage
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                0,
            )?,
            old_camera_data: Vec::new(),
            device_buffers,
            joint_buffers: HashMap::new(),
            blas_map: HashMap::new(),
            light_blas: None,
            tlas: None,
            as_instance_count: 0,
            as_rebuild: true,
            command_buffers_outdated: true,
            force_instance_refresh_frames: 0,
            pipelines,
            scene_sets,
            skinning_set,
            pre_transform_set,
            shadow_maps: Vec::new(),
            shadow_map_indices: HashMap::new(),
            shadow_atlas: None,
            shadow_sampler,
            envmap_sampler,
            tri_light_count: 0,
            total_vertex_count: 0,
            ray_tracing,
            options: options.clone(),
            stage_timer,
        })
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    pub fn scene_mut(&mut self) -> Option<&mut Scene> {
        self.scene.as_mut()
    }

    pub fn instances(&self) -> &[crate::scene::Instance] {
        self.instance_cache.instances()
    }

    pub fn shadow_maps(&self) -> &[ShadowMapInstance] {
        &self.shadow_maps
    }

    pub fn shadow_map_atlas(&self) -> Option<&Atlas> {
        self.shadow_atlas.as_ref()
    }

    pub fn get_shadow_map_index(&self, key: LightKey) -> i32 {
        self.shadow_map_indices
            .get(&key)
            .map(|&i| self.shadow_maps[i].map_index as i32)
            .unwrap_or(-1)
    }

    pub fn acceleration_structure(&self, id: DeviceId) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|tlas| tlas.handle(id))
    }

    pub fn has_prev_tlas(&self) -> bool {
        // The TLAS is rebuilt in place every frame; no previous-frame copy
        // is retained.
        false
    }

    pub fn max_samplers(&self) -> u32 {
        self.options.max_samplers
    }

    pub fn max_instances(&self) -> usize {
        self.options.max_instances
    }

    /// Checks whether the given scene revision categories changed since the
    /// observed counter, updating it.
    pub fn check_update(&self, categories: u32, prev_counter: &mut u32) -> bool {
        match &self.scene {
            Some(scene) => scene.check_update(categories, prev_counter),
            None => false,
        }
    }

    pub fn get_defines(&self, defines: &mut BTreeMap<String, String>) {
        if self.ray_tracing {
            defines.insert(String::from("RAY_TRACING_SUPPORTED"), String::new());
        }
        defines.insert(
            String::from("MAX_SAMPLERS"),
            self.options.max_samplers.to_string(),
        );
        defines.insert(
            String::from("MAX_INSTANCES"),
            self.options.max_instances.to_string(),
        );
        if self.options.pre_transform_vertices {
            defines.insert(String::from("PRE_TRANSFORMED_VERTICES"), String::new());
        }
        if self.options.shadow_mapping {
            defines.insert(String::from("USE_SHADOW_MAPPING"), String::new());
        }
        if self
            .scene
            .as_ref()
            .map(|s| s.environment().is_some())
            .unwrap_or(false)
        {
            defines.insert(String::from("USE_ENVIRONMENT_MAP"), String::new());
        }
    }

    /// Binds the scene to the stage. Mirrors are sized, the sampler table is
    /// rebuilt and every frame slot is refreshed under the forced window.
    pub fn set_scene(&mut self, ctx: &Context, scene: Scene) -> Result<()> {
        self.scene = Some(scene);
        let frame_counter = ctx.get_frame_counter();
        self.instance_cache
            .refresh(self.scene.as_ref().unwrap(), frame_counter, true);

        let scene = self.scene.as_ref().unwrap();
        let point_light_count = scene.point_light_count();
        let directional_light_count = scene.directional_lights().len();

        let mut tri_light_count = 0usize;
        for instance in self.instance_cache.instances() {
            let object = &scene.objects()[instance.object_index];
            if object.material.is_emissive() {
                tri_light_count += object.mesh.triangle_count();
            }
        }
        self.tri_light_count = tri_light_count;

        self.instance_data.resize(
            (self.instance_cache.instances().len() * std::mem::size_of::<InstanceEntry>()) as u64,
        )?;
        self.point_light_data.resize(
            (point_light_count * std::mem::size_of::<PointLightEntry>()) as u64,
        )?;
        self.directional_light_data.resize(
            (directional_light_count * std::mem::size_of::<DirectionalLightEntry>()) as u64,
        )?;
        self.scene_metadata
            .resize(std::mem::size_of::<SceneMetadataEntry>() as u64)?;
        self.camera_data.resize(
            (scene.cameras().len() * std::mem::size_of::<CameraUniform>() * 2) as u64,
        )?;
        self.light_aabb_data.resize(
            (point_light_count.max(1) * std::mem::size_of::<vk::AabbPositionsKHR>()) as u64,
        )?;
        if let Some(environment) = scene.environment() {
            let table = environment.alias_table();
            self.envmap_alias_data
                .resize(std::mem::size_of_val(table) as u64)?;
        } else {
            self.envmap_alias_data.resize(0)?;
        }
        self.old_camera_data.clear();

        for buffers in &mut self.device_buffers {
            buffers.tri_light_buffer = if self.options.gather_emissive_triangles
                && tri_light_count > 0
            {
                Some(Buffer::new(
                    ctx.device(buffers.device_id).clone(),
                    BufferDescriptor::new(
                        (tri_light_count * std::mem::size_of::<TriLightEntry>()) as u64,
                        vk::BufferUsageFlags::STORAGE_BUFFER,
                        MemoryLocation::GpuOnly,
                    ),
                )?)
            } else {
                None
            };
        }

        self.sampler_table
            .update_scene(self.scene.as_ref().unwrap());

        if ctx.is_ray_tracing_supported() {
            let capacity = self.options.max_instances + 1;
            if self
                .tlas
                .as_ref()
                .map(|tlas| tlas.capacity() != capacity)
                .unwrap_or(true)
            {
                self.tlas = Some(TopLevelAccelerationStructure::new(ctx, self.mask, capacity)?);
            }
            self.as_rebuild = true;
        }

        self.force_instance_refresh_frames = MAX_FRAMES_IN_FLIGHT as u32;
        self.command_buffers_outdated = true;

        for frame_index in 0..MAX_FRAMES_IN_FLIGHT as u32 {
            self.update(ctx, frame_index, frame_counter)?;
        }
        Ok(())
    }

    /// Per-frame update: refreshes the instance cache, rewrites the staged
    /// mirrors for this frame slot and re-records the command buffers if the
    /// topology changed.
    pub fn update(&mut self, ctx: &Context, frame_index: u32, frame_counter: u64) -> Result<()> {
        if self.scene.is_none() {
            return Ok(());
        }

        let force = self.force_instance_refresh_frames > 0;
        let topology_changed = {
            let scene = self.scene.as_ref().unwrap();
            self.instance_cache.refresh(scene, frame_counter, force)
        };
        if topology_changed {
            self.command_buffers_outdated = true;
            self.as_rebuild = true;
        }

        self.update_instance_table(frame_index, frame_counter, force)?;
        self.update_light_tables(frame_index)?;
        self.update_camera_table(frame_index)?;
        if self.options.shadow_mapping {
            self.update_shadow_maps(ctx, frame_index)?;
        }
        self.update_metadata(frame_index);
        self.update_envmap_table(frame_index);

        if ctx.is_ray_tracing_supported() {
            self.update_acceleration_structures(ctx, frame_index)?;
        }

        for (index, object) in self.scene.as_ref().unwrap().objects().iter().enumerate() {
            if object.joint_matrices.is_empty() {
                continue;
            }
            let bytes = (object.joint_matrices.len() * std::mem::size_of::<Matrix4<f32>>()) as u64;
            if !self.joint_buffers.contains_key(&index) {
                let buffer = StagedBuffer::new(
                    ctx,
                    self.mask,
                    bytes,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                )?;
                self.joint_buffers.insert(index, buffer);
                self.command_buffers_outdated = true;
            }
            let joints = self.joint_buffers.get_mut(&index).unwrap();
            if joints.resize(bytes)? {
                self.command_buffers_outdated = true;
            }
            let matrices: Vec<[[f32; 4]; 4]> = object
                .joint_matrices
                .iter()
                .map(|m| (*m).into())
                .collect();
            let data = unsafe {
                std::slice::from_raw_parts(
                    matrices.as_ptr() as *const u8,
                    std::mem::size_of_val(matrices.as_slice()),
                )
            };
            joints.update(frame_index, data, 0);
        }

        if self.force_instance_refresh_frames > 0 {
            self.force_instance_refresh_frames -= 1;
        }

        if self.command_buffers_outdated {
            self.rewrite_descriptors()?;
            self.record_command_buffers(ctx)?;
            if self.as_rebuild {
                // One-shot: the recorded buffers performed a full rebuild;
                // re-record next frame so subsequent frames use updates.
                self.as_rebuild = false;
            } else {
                self.command_buffers_outdated = false;
            }
        }
        Ok(())
    }

    fn update_instance_table(
        &mut self,
        frame_index: u32,
        frame_counter: u64,
        force: bool,
    ) -> Result<()> {
        let scene = self.scene.as_ref().unwrap();
        let instances = self.instance_cache.instances();
        if self
            .instance_data
            .resize((instances.len() * std::mem::size_of::<InstanceEntry>()) as u64)?
        {
            self.command_buffers_outdated = true;
        }

        let mut tri_light_count = 0usize;
        let mut total_vertex_count = 0usize;
        let mut entries: Vec<Option<InstanceEntry>> = Vec::with_capacity(instances.len());
        for instance in instances {
            let object = &scene.objects()[instance.object_index];
            let material = &object.material;

            let light_base_id = if material.is_emissive() {
                let base = tri_light_count as i32;
                tri_light_count += object.mesh.triangle_count();
                base
            } else {
                -1
            };
            total_vertex_count += object.mesh.vertices().len();

            // Skip unchanged instances outside the forced-refresh window.
            if !instance_needs_upload(instance.last_refresh_frame, frame_counter, force) {
                entries.push(None);
                continue;
            }

            let mat_entry = MaterialEntry {
                albedo_factor: material.albedo_factor.into(),
                metallic_roughness_factor: [
                    material.metallic_factor,
                    material.roughness_factor,
                    0.0,
                    0.0,
                ],
                emission_factor_double_sided: [
                    material.emission_factor.x,
                    material.emission_factor.y,
                    material.emission_factor.z,
                    if material.double_sided { 1.0 } else { 0.0 },
                ],
                transmittance: material.transmittance,
                ior: material.ior,
                normal_factor: material.normal_factor,
                pad: 0.0,
                albedo_tex_id: self.sampler_table.find_texture_index(&material.albedo_texture)?,
                metallic_roughness_tex_id: self
                    .sampler_table
                    .find_texture_index(&material.metallic_roughness_texture)?,
                normal_tex_id: self
                    .sampler_table
                    .find_texture_index(&material.normal_texture)?,
                emission_tex_id: self
                    .sampler_table
                    .find_texture_index(&material.emission_texture)?,
            };
            entries.push(Some(InstanceEntry {
                light_base_id,
                sh_grid_index: -1,
                pad: 0,
                shadow_terminator_mul: instance.shadow_terminator_mul,
                model: instance.transform.into(),
                model_normal: instance.normal_transform.into(),
                model_prev: instance.prev_transform.into(),
                material: mat_entry,
            }));
        }
        self.tri_light_count = tri_light_count;
        self.total_vertex_count = total_vertex_count;

        self.instance_data
            .foreach_entry::<InstanceEntry, _>(frame_index, entries.len(), |entry, i| {
                if let Some(new_entry) = &entries[i] {
                    *entry = *new_entry;
                }
            });
        Ok(())
    }

    fn update_light_tables(&mut self, frame_index: u32) -> Result<()> {
        let scene = self.scene.as_ref().unwrap();
        let point_lights: Vec<PointLightEntry> = scene
            .point_lights()
            .iter()
            .enumerate()
            .map(|(i, light)| self.point_light_entry(light, LightKey::Point(i)))
            .chain(
                scene
                    .spotlights()
                    .iter()
                    .enumerate()
                    .map(|(i, light)| self.spotlight_entry(light, LightKey::Spot(i))),
            )
            .collect();
        if self.point_light_data.resize(
            (point_lights.len() * std::mem::size_of::<PointLightEntry>()) as u64,
        )? {
            self.command_buffers_outdated = true;
        }
        self.point_light_data
            .foreach_entry::<PointLightEntry, _>(frame_index, point_lights.len(), |entry, i| {
                *entry = point_lights[i];
            });

        let directional: Vec<DirectionalLightEntry> = scene
            .directional_lights()
            .iter()
            .enumerate()
            .map(|(i, light)| DirectionalLightEntry {
                color: light.color.into(),
                shadow_map_index: self.get_shadow_map_index(LightKey::Directional(i)),
                dir: light.direction.normalize().into(),
                dir_cutoff: light.angle.to_radians().cos(),
            })
            .collect();
        if self.directional_light_data.resize(
            (directional.len() * std::mem::size_of::<DirectionalLightEntry>()) as u64,
        )? {
            self.command_buffers_outdated = true;
        }
        self.directional_light_data
            .foreach_entry::<DirectionalLightEntry, _>(
                frame_index,
                directional.len(),
                |entry, i| {
                    *entry = directional[i];
                },
            );

        // Procedural AABBs standing in for the point lights in the TLAS.
        let aabbs: Vec<vk::AabbPositionsKHR> = scene
            .point_lights()
            .iter()
            .map(|l| (l.position, l.radius))
            .chain(scene.spotlights().iter().map(|l| (l.position, l.radius)))
            .map(|(pos, radius)| vk::AabbPositionsKHR {
                min_x: pos.x - radius,
                min_y: pos.y - radius,
                min_z: pos.z - radius,
                max_x: pos.x + radius,
                max_y: pos.y + radius,
                max_z: pos.z + radius,
            })
            .collect();
        if !aabbs.is_empty() {
            self.light_aabb_data.resize(
                (aabbs.len() * std::mem::size_of::<vk::AabbPositionsKHR>()) as u64,
            )?;
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    aabbs.as_ptr() as *const u8,
                    std::mem::size_of_val(aabbs.as_slice()),
                )
            };
            self.light_aabb_data.update(frame_index, bytes, 0);
        }
        Ok(())
    }

    fn point_light_entry(&self, light: &PointLight, key: LightKey) -> PointLightEntry {
        PointLightEntry {
            color: light.color.into(),
            shadow_map_index: self.get_shadow_map_index(key),
            dir: [0.0; 3],
            dir_cutoff: 0.0,
            pos: light.position.into(),
            radius: light.radius,
            dir_falloff: 0.0,
            cutoff_radius: light.cutoff_radius,
            spot_radius: -1.0,
            padding: 0,
        }
    }

    fn spotlight_entry(&self, light: &Spotlight, key: LightKey) -> PointLightEntry {
        PointLightEntry {
            color: light.color.into(),
            shadow_map_index: self.get_shadow_map_index(key),
            dir: light.direction.normalize().into(),
            dir_cutoff: light.cutoff_angle.to_radians().cos(),
            pos: light.position.into(),
            radius: light.radius,
            dir_falloff: light.falloff_exponent,
            cutoff_radius: light.cutoff_radius,
            spot_radius: light.cutoff_radius * light.cutoff_angle.to_radians().tan(),
            padding: 0,
        }
    }

    fn update_camera_table(&mut self, frame_index: u32) -> Result<()> {
        let scene = self.scene.as_ref().unwrap();
        let uniforms: Vec<CameraUniform> = scene.cameras().iter().map(|c| c.uniform()).collect();
        if uniforms.is_empty() {
            return Ok(());
        }
        let block = std::mem::size_of::<CameraUniform>();
        if self.camera_data.resize((uniforms.len() * block * 2) as u64)? {
            self.command_buffers_outdated = true;
        }

        let mut table = vec![0u8; uniforms.len() * block * 2];
        fill_camera_table(&uniforms, &mut self.old_camera_data, &mut table);
        self.camera_data.update(frame_index, &table, 0);
        Ok(())
    }

    fn update_metadata(&mut self, frame_index: u32) {
        let scene = self.scene.as_ref().unwrap();
        let entry = SceneMetadataEntry {
            point_light_count: scene.point_light_count() as u32,
            directional_light_count: scene.directional_lights().len() as u32,
            tri_light_count: if self.options.gather_emissive_triangles {
                self.tri_light_count as u32
            } else {
                0
            },
            instance_count: self.instance_cache.instances().len() as u32,
            ambient: [
                scene.ambient().x,
                scene.ambient().y,
                scene.ambient().z,
                0.0,
            ],
        };
        self.scene_metadata
            .foreach_entry::<SceneMetadataEntry, _>(frame_index, 1, |e, _| *e = entry);
    }

    fn update_envmap_table(&mut self, frame_index: u32) {
        let Some(scene) = self.scene.as_ref() else {
            return;
        };
        let Some(environment) = scene.environment() else {
            return;
        };
        let table = environment.alias_table();
        if table.is_empty() {
            return;
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                table.as_ptr() as *const u8,
                std::mem::size_of_val(table),
            )
        };
        self.envmap_alias_data.update(frame_index, bytes, 0);
    }

    fn update_shadow_maps(&mut self, ctx: &Context, frame_index: u32) -> Result<()> {
        self.refresh_shadow_map_params(ctx)?;

        let map_count = self.shadow_maps.len();
        let cascade_count: usize = self.shadow_maps.iter().map(|m| m.cascades.len()).sum();
        let map_range = map_count * std::mem::size_of::<ShadowMapEntry>();
        let cascade_range = cascade_count * std::mem::size_of::<ShadowMapCascadeEntry>();
        if map_count == 0 {
            return Ok(());
        }
        if self
            .shadow_map_data
            .resize((map_range + cascade_range) as u64)?
        {
            self.command_buffers_outdated = true;
        }

        let atlas = self.shadow_atlas.as_ref().unwrap();
        let atlas_size = atlas.size();
        let normalize = |rect: (i32, i32, u32, u32), face: (u32, u32)| -> [f32; 4] {
            [
                rect.0 as f32 / atlas_size.0 as f32,
                rect.1 as f32 / atlas_size.1 as f32,
                face.0 as f32 / atlas_size.0 as f32,
                face.1 as f32 / atlas_size.1 as f32,
            ]
        };

        let mut table = vec![0u8; map_range + cascade_range];
        let mut cascade_index = 0usize;
        for sm in &self.shadow_maps {
            let first_cam = &sm.faces[0];
            let mut entry = ShadowMapEntry {
                min_bias: sm.min_bias,
                max_bias: sm.max_bias,
                cascade_index: -1,
                rect: normalize(atlas.rect_px(sm.atlas_index), sm.face_size),
                clip_info: first_cam.clip_info().into(),
                projection_info_radius: [
                    first_cam.projection_info().x,
                    first_cam.projection_info().y,
                    sm.radius.x,
                    sm.radius.y,
                ],
                ..Default::default()
            };
            match first_cam.projection {
                crate::scene::CameraProjection::Perspective { .. } => {
                    if sm.faces.len() == 6 {
                        entry.map_type = 1;
                        entry.world_to_shadow = sm.faces[5]
                            .transform
                            .try_inverse()
                            .unwrap_or_else(Matrix4::identity)
                            .into();
                    } else {
                        entry.map_type = 0;
                        entry.world_to_shadow = first_cam.view_matrix().into();
                    }
                }
                crate::scene::CameraProjection::Orthographic { .. } => {
                    entry.clip_info[2] = first_cam.far();
                    entry.map_type = sm.cascades.len() as i32;
                    entry.cascade_index = cascade_index as i32;
                    entry.world_to_shadow = first_cam.view_projection().into();
                }
            }

            let offset = sm.map_index * std::mem::size_of::<ShadowMapEntry>();
            table[offset..offset + std::mem::size_of::<ShadowMapEntry>()].copy_from_slice(unsafe {
                std::slice::from_raw_parts(
                    &entry as *const ShadowMapEntry as *const u8,
                    std::mem::size_of::<ShadowMapEntry>(),
                )
            });

            for cascade in &sm.cascades {
                let centry = ShadowMapCascadeEntry {
                    offset_scale: [
                        cascade.offset.x,
                        cascade.offset.y,
                        1.0 / cascade.scale,
                        cascade.bias_scale,
                    ],
                    rect: normalize(atlas.rect_px(cascade.atlas_index), sm.face_size),
                };
                let offset =
                    map_range + cascade_index * std::mem::size_of::<ShadowMapCascadeEntry>();
                table[offset..offset + std::mem::size_of::<ShadowMapCascadeEntry>()]
                    .copy_from_slice(unsafe {
                        std::slice::from_raw_parts(
                            &centry as *const ShadowMapCascadeEntry as *const u8,
                            std::mem::size_of::<ShadowMapCascadeEntry>(),
                        )
                    });
                cascade_index += 1;
            }
        }
        self.shadow_map_data.update(frame_index, &table, 0);
        Ok(())
    }

    /// Recomputes the per-light shadow cameras and (re)packs the atlas.
    fn refresh_shadow_map_params(&mut self, ctx: &Context) -> Result<()> {
        let scene = self.scene.as_ref().unwrap();
        let cameras = scene.cameras();

        let mut shadow_maps = Vec::new();
        let mut indices = HashMap::new();
        let mut sub_sizes: Vec<(u32, u32)> = Vec::new();

        let mut push_map = |sm: ShadowMapInstance, key: LightKey, indices: &mut HashMap<LightKey, usize>| {
            indices.insert(key, sm.map_index);
            shadow_maps.push(sm);
        };

        let mut map_index = 0usize;
        for (i, light) in scene.directional_lights().iter().enumerate() {
            let Some(spec) = &light.shadow_map else {
                continue;
            };
            let light_transform = directional_light_transform(light);
            let sm = directional_shadow_map(
                light,
                spec,
                &light_transform,
                cameras,
                map_index,
                &mut sub_sizes,
            );
            push_map(sm, LightKey::Directional(i), &mut indices);
            map_index += 1;
        }
        for (i, light) in scene.point_lights().iter().enumerate() {
            let Some(spec) = &light.shadow_map else {
                continue;
            };
            let sm = omni_shadow_map(
                light.position,
                light.radius,
                light.cutoff_radius,
                spec,
                map_index,
                &mut sub_sizes,
            );
            push_map(sm, LightKey::Point(i), &mut indices);
            map_index += 1;
        }
        for (i, light) in scene.spotlights().iter().enumerate() {
            let Some(spec) = &light.shadow_map else {
                continue;
            };
            let sm = if light.cutoff_angle < 60.0 {
                spot_shadow_map(light, spec, map_index, &mut sub_sizes)
            } else {
                omni_shadow_map(
                    light.position,
                    light.radius,
                    light.cutoff_radius,
                    spec,
                    map_index,
                    &mut sub_sizes,
                )
            };
            push_map(sm, LightKey::Spot(i), &mut indices);
            map_index += 1;
        }

        self.shadow_maps = shadow_maps;
        self.shadow_map_indices = indices;

        if sub_sizes.is_empty() {
            return Ok(());
        }
        match &mut self.shadow_atlas {
            Some(atlas) => {
                if atlas.set_sub_textures(&sub_sizes, 2)? {
                    self.command_buffers_outdated = true;
                }
            }
            None => {
                self.shadow_atlas = Some(Atlas::new(
                    ctx,
                    self.mask,
                    &sub_sizes,
                    2,
                    vk::Format::D32_SFLOAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                )?);
                self.command_buffers_outdated = true;
            }
        }
        Ok(())
    }

    fn update_acceleration_structures(&mut self, ctx: &Context, frame_index: u32) -> Result<()> {
        let scene = self.scene.as_ref().unwrap();
        let instances = self.instance_cache.instances();
        if instances.len() > self.options.max_instances {
            anyhow::bail!(
                "Instance count {} exceeds TLAS capacity {}",
                instances.len(),
                self.options.max_instances
            );
        }

        // Create BLASes for meshes seen for the first time. Static meshes
        // get compactable fast-trace structures built once; animated meshes
        // get updatable fast-build ones refreshed in the cached commands.
        let mut seen_ids = Vec::new();
        for instance in instances {
            let object = &scene.objects()[instance.object_index];
            let mesh = &object.mesh;
            seen_ids.push(mesh.id());
            if self.blas_map.contains_key(&mesh.id()) {
                continue;
            }
            let dynamic = mesh.animation_source().is_some();
            let mut blas = BottomLevelAccelerationStructure::new(
                ctx,
                self.mask,
                1,
                &[Matrix4::identity()],
                !object.material.double_sided,
                dynamic,
                !dynamic,
            )?;
            if !dynamic {
                for id in self.mask.iter() {
                    let device = ctx.device(id).clone();
                    let entry = blas_entry_for_mesh(mesh, &object.material, id);
                    device.one_time_submit(|cb| {
                        blas.rebuild(id, frame_index, cb, &[entry], false)?;
                        Ok(())
                    })?;
                }
            }
            self.blas_map.insert(mesh.id(), blas);
            self.command_buffers_outdated = true;
            self.as_rebuild = true;
        }

        // Drop BLASes whose meshes left the scene.
        let before = self.blas_map.len();
        self.blas_map.retain(|id, _| seen_ids.contains(id));
        if self.blas_map.len() != before {
            self.command_buffers_outdated = true;
            self.as_rebuild = true;
        }

        let point_light_count = scene.point_light_count();
        if point_light_count > 0 && self.light_blas.is_none() {
            self.light_blas = Some(BottomLevelAccelerationStructure::new(
                ctx,
                self.mask,
                1,
                &[Matrix4::identity()],
                false,
                true,
                false,
            )?);
            self.command_buffers_outdated = true;
            self.as_rebuild = true;
        }

        // Mirror the CPU instance order into the TLAS instance buffer.
        let tlas = self.tlas.as_mut().unwrap();
        let mut as_instance_count = 0usize;
        for id in self.mask.iter() {
            let blas_map = &self.blas_map;
            let light_blas = &self.light_blas;
            let mut count = 0usize;
            tlas.instance_buffer_mut().map_one::<vk::AccelerationStructureInstanceKHR, _>(
                id,
                frame_index,
                |entries| {
                    for (i, instance) in instances.iter().enumerate() {
                        let object = &scene.objects()[instance.object_index];
                        let blas = &blas_map[&instance.mesh_id];
                        let mut flags = vk::GeometryInstanceFlagsKHR::empty();
                        if object.material.double_sided {
                            flags |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
                        }
                        entries[count] = vk::AccelerationStructureInstanceKHR {
                            transform: transform_to_khr(&instance.transform),
                            instance_custom_index_and_mask: vk::Packed24_8::new(i as u32, 0xFF),
                            instance_shader_binding_table_record_offset_and_flags:
                                vk::Packed24_8::new(0, flags.as_raw() as u8),
                            acceleration_structure_reference:
                                vk::AccelerationStructureReferenceKHR {
                                    device_handle: blas.address(id),
                                },
                        };
                        count += 1;
                    }
                    if let Some(light_blas) = light_blas {
                        if point_light_count > 0 {
                            entries[count] = vk::AccelerationStructureInstanceKHR {
                                transform: transform_to_khr(&Matrix4::identity()),
                                instance_custom_index_and_mask: vk::Packed24_8::new(
                                    count as u32,
                                    0x02,
                                ),
                                instance_shader_binding_table_record_offset_and_flags:
                                    vk::Packed24_8::new(0, 0),
                                acceleration_structure_reference:
                                    vk::AccelerationStructureReferenceKHR {
                                        device_handle: light_blas.address(id),
                                    },
                            };
                            count += 1;
                        }
                    }
                },
            );
            as_instance_count = count;
        }
        self.as_instance_count = as_instance_count;

        if self.options.pre_transform_vertices {
            let bytes =
                (self.total_vertex_count * std::mem::size_of::<crate::mesh::Vertex>()) as u64;
            for buffers in &mut self.device_buffers {
                if buffers.pre_transformed_capacity < bytes {
                    buffers.pre_transformed_vertices = Some(Buffer::new(
                        ctx.device(buffers.device_id).clone(),
                        BufferDescriptor::new(
                            bytes,
                            vk::BufferUsageFlags::STORAGE_BUFFER
                                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                            MemoryLocation::GpuOnly,
                        ),
                    )?);
                    buffers.pre_transformed_capacity = bytes;
                    self.command_buffers_outdated = true;
                }
            }
        }
        Ok(())
    }

    /// Writes every named binding of the scene set. Called on scene reset
    /// and whenever a mirror buffer was reallocated.
    fn rewrite_descriptors(&mut self) -> Result<()> {
        self.scene_sets.reset(1)?;
        for id in self.mask.iter() {
            self.bind(&self.scene_sets, id, 0)?;
        }
        Ok(())
    }

    /// Writes the scene's resources into any descriptor set that declares
    /// them by name. Renderer stages call this for their own scene sets.
    pub fn bind(&self, sets: &AllocatedDescriptorSets, id: DeviceId, alternative: u32) -> Result<()> {
        let buffer_info = |buffer: &StagedBuffer| {
            vec![vk::DescriptorBufferInfo::default()
                .buffer(buffer.raw(id))
                .offset(0)
                .range(vk::WHOLE_SIZE)]
        };

        if !self.instance_data.is_empty() {
            sets.set_buffer(id, alternative, "instances", &buffer_info(&self.instance_data))?;
        }
        if !self.point_light_data.is_empty() {
            sets.set_buffer(
                id,
                alternative,
                "point_lights",
                &buffer_info(&self.point_light_data),
            )?;
        }
        if !self.directional_light_data.is_empty() {
            sets.set_buffer(
                id,
                alternative,
                "directional_lights",
                &buffer_info(&self.directional_light_data),
            )?;
        }
        if !self.camera_data.is_empty() {
            sets.set_buffer(id, alternative, "cameras", &buffer_info(&self.camera_data))?;
        }
        if !self.scene_metadata.is_empty() {
            sets.set_buffer(
                id,
                alternative,
                "scene_metadata",
                &buffer_info(&self.scene_metadata),
            )?;
        }
        if !self.shadow_map_data.is_empty() {
            sets.set_buffer(
                id,
                alternative,
                "shadow_maps",
                &buffer_info(&self.shadow_map_data),
            )?;
        }
        if !self.envmap_alias_data.is_empty() {
            sets.set_buffer(
                id,
                alternative,
                "envmap_alias_table",
                &buffer_info(&self.envmap_alias_data),
            )?;
        }

        let device_buffers = self
            .device_buffers
            .iter()
            .find(|b| b.device_id == id)
            .unwrap();
        if let Some(buffer) = &device_buffers.tri_light_buffer {
            sets.set_buffer(
                id,
                alternative,
                "tri_lights",
                &[vk::DescriptorBufferInfo::default()
                    .buffer(buffer.raw())
                    .range(vk::WHOLE_SIZE)],
            )?;
        }
        if let Some(buffer) = &device_buffers.pre_transformed_vertices {
            sets.set_buffer(
                id,
                alternative,
                "pre_transformed_vertices",
                &[vk::DescriptorBufferInfo::default()
                    .buffer(buffer.raw())
                    .range(vk::WHOLE_SIZE)],
            )?;
        }

        if !self.sampler_table.is_empty() {
            sets.set_image(id, alternative, "textures", &self.sampler_table.image_infos(id))?;
        }

        if let Some(scene) = &self.scene {
            // Per-mesh geometry buffers for the extraction and ray queries.
            let mut vertex_infos = Vec::new();
            let mut index_infos = Vec::new();
            for instance in self.instance_cache.instances() {
                let mesh = &scene.objects()[instance.object_index].mesh;
                vertex_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(mesh.vertex_buffer(id))
                        .range(vk::WHOLE_SIZE),
                );
                index_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(mesh.index_buffer(id))
                        .range(vk::WHOLE_SIZE),
                );
            }
            if !vertex_infos.is_empty() {
                sets.set_buffer(id, alternative, "vertices", &vertex_infos)?;
                sets.set_buffer(id, alternative, "indices", &index_infos)?;
            }

            if let Some(environment) = scene.environment() {
                sets.set_image(
                    id,
                    alternative,
                    "envmap_tex",
                    &[vk::DescriptorImageInfo::default()
                        .sampler(self.envmap_sampler.raw(id))
                        .image_view(environment.texture().view(id))
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)],
                )?;
            }
        }

        if let Some(atlas) = &self.shadow_atlas {
            sets.set_image(
                id,
                alternative,
                "shadow_map_atlas_tex",
                &[vk::DescriptorImageInfo::default()
                    .sampler(self.shadow_sampler.raw(id))
                    .image_view(atlas.texture().view(id))
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)],
            )?;
        }

        if let Some(tlas) = &self.tlas {
            sets.set_acceleration_structure(id, alternative, "tlas", tlas.handle(id))?;
        }
        Ok(())
    }

    fn record_command_buffers(&mut self, ctx: &Context) -> Result<()> {
        let mut cores = std::mem::take(&mut self.cores);
        for (id, core) in &mut cores {
            core.clear_commands();
            for frame_index in 0..MAX_FRAMES_IN_FLIGHT as u32 {
                let cb = core.begin_commands(frame_index, 0)?;
                self.stage_timer.begin(cb, *id, frame_index);
                self.record_uploads(ctx, *id, frame_index, cb);
                self.record_skinning(ctx, *id, frame_index, cb)?;
                if ctx.is_ray_tracing_supported() {
                    self.record_as_build(ctx, *id, frame_index, cb)?;
                    if self.options.pre_transform_vertices {
                        self.record_pre_transform(ctx, *id, cb);
                    }
                    if self.options.gather_emissive_triangles && self.tri_light_count > 0 {
                        self.record_tri_light_extraction(*id, cb);
                    }
                }
                self.stage_timer.end(cb, *id, frame_index);
                core.end_commands(cb)?;
            }
        }
        self.cores = cores;
        Ok(())
    }

    fn record_uploads(&self, ctx: &Context, id: DeviceId, frame_index: u32, cb: vk::CommandBuffer) {
        let device = ctx.device(id);
        self.instance_data.upload(id, frame_index, cb);
        self.point_light_data.upload(id, frame_index, cb);
        self.directional_light_data.upload(id, frame_index, cb);
        self.shadow_map_data.upload(id, frame_index, cb);
        self.camera_data.upload(id, frame_index, cb);
        self.scene_metadata.upload(id, frame_index, cb);
        self.envmap_alias_data.upload(id, frame_index, cb);
        self.light_aabb_data.upload(id, frame_index, cb);
        for joints in self.joint_buffers.values() {
            joints.upload(id, frame_index, cb);
        }
        bulk_upload_barrier(device, cb, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    fn record_skinning(
        &mut self,
        ctx: &Context,
        id: DeviceId,
        frame_index: u32,
        cb: vk::CommandBuffer,
    ) -> Result<()> {
        let device = ctx.device(id).clone();
        let scene = self.scene.as_ref().unwrap();
        let pipelines = self
            .pipelines
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, p)| p)
            .unwrap();

        let mut any_skinned = false;
        for (index, object) in scene.objects().iter().enumerate() {
            let mesh = &object.mesh;
            let Some(source) = mesh.animation_source() else {
                continue;
            };
            if !source.is_skinned() {
                continue;
            }
            let Some(joints) = self.joint_buffers.get(&index) else {
                continue;
            };
            if !any_skinned {
                pipelines.skinning.core.bind(cb);
                pipelines
                    .skinning
                    .core
                    .set_descriptors(cb, &self.scene_sets, 0, 0);
                any_skinned = true;
            }

            let vertex_count = source.vertices().len() as u32;
            let buffer_info = |buffer: vk::Buffer| {
                vec![vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .range(vk::WHOLE_SIZE)]
            };
            let skin_buffer = source
                .skin_buffer(id)
                .with_context(|| "Skinned mesh without a skin buffer")?;
            let prev_pos = mesh
                .prev_pos_buffer(id)
                .with_context(|| "Animated mesh without a prev-position buffer")?;

            // The skinning kernel copies the previous output positions into
            // the prev-position buffer before overwriting, preserving last
            // frame's positions for motion vectors.
            self.skinning_set
                .set_buffer(id, "source_data", buffer_info(source.vertex_buffer(id)));
            self.skinning_set
                .set_buffer(id, "destination_data", buffer_info(mesh.vertex_buffer(id)));
            self.skinning_set
                .set_buffer(id, "skin_data", buffer_info(skin_buffer));
            self.skinning_set
                .set_buffer(id, "joint_data", buffer_info(joints.raw(id)));
            self.skinning_set
                .set_buffer(id, "prev_position_data", buffer_info(prev_pos));
            pipelines
                .skinning
                .core
                .push_descriptors(cb, &self.skinning_set, 1);

            pipelines.skinning.core.push_constants(
                cb,
                &SkinningPushConstants { vertex_count },
            );
            pipelines.skinning.dispatch(
                cb,
                vertex_count.div_ceil(SKINNING_GROUP_SIZE),
                1,
                1,
            );
        }

        if any_skinned && device.is_ray_tracing_supported() {
            // Vertex buffers must be updated by the time BLAS updates read
            // them.
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
            unsafe {
                device.raw.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        }
        Ok(())
    }

    fn record_as_build(
        &mut self,
        ctx: &Context,
        id: DeviceId,
        frame_index: u32,
        cb: vk::CommandBuffer,
    ) -> Result<()> {
        let as_update = !self.as_rebuild;
        let scene = self.scene.as_ref().unwrap();

        // Dynamic (animated) BLASes are refreshed every frame.
        for instance in self.instance_cache.instances() {
            let object = &scene.objects()[instance.object_index];
            let blas = self.blas_map.get_mut(&instance.mesh_id).unwrap();
            if !blas.is_dynamic() {
                continue;
            }
            let entry = blas_entry_for_mesh(&object.mesh, &object.material, id);
            blas.rebuild(id, frame_index, cb, &[entry], as_update)?;
        }

        if let Some(light_blas) = &mut self.light_blas {
            let count = scene.point_light_count();
            if count > 0 {
                let entry = BlasBuildEntry {
                    geometry: BlasGeometry::Aabbs {
                        address: self.light_aabb_data.device_address(id),
                        count: count as u32,
                    },
                    opaque: false,
                };
                light_blas.rebuild(id, frame_index, cb, &[entry], as_update)?;
            }
        }

        if self.as_instance_count > 0 {
            let tlas = self.tlas.as_ref().unwrap();
            tlas.instance_buffer().upload(id, frame_index, cb);
            let device = ctx.device(id);
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
            unsafe {
                device.raw.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        }

        let as_instance_count = self.as_instance_count;
        self.tlas
            .as_mut()
            .unwrap()
            .rebuild(id, cb, as_instance_count, as_update)?;
        Ok(())
    }

    fn record_tri_light_extraction(&self, id: DeviceId, cb: vk::CommandBuffer) {
        let scene = self.scene.as_ref().unwrap();
        let pipelines = self
            .pipelines
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, p)| p)
            .unwrap();
        let Some(extract) = &pipelines.extract_tri_lights else {
            return;
        };

        extract.core.bind(cb);
        extract.core.set_descriptors(cb, &self.scene_sets, 0, 0);
        for (i, instance) in self.instance_cache.instances().iter().enumerate() {
            let object = &scene.objects()[instance.object_index];
            if !object.material.is_emissive() {
                continue;
            }
            let pc = ExtractTriLightPushConstants {
                triangle_count: object.mesh.triangle_count() as u32,
                instance_id: i as u32,
            };
            extract.core.push_constants(cb, &pc);
            extract.dispatch(
                cb,
                (pc.triangle_count).div_ceil(EXTRACT_GROUP_SIZE),
                1,
                1,
            );
        }
    }

    fn record_pre_transform(&self, ctx: &Context, id: DeviceId, cb: vk::CommandBuffer) {
        let scene = self.scene.as_ref().unwrap();
        let device = ctx.device(id);
        let pipelines = self
            .pipelines
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, p)| p)
            .unwrap();
        let Some(pre_transform) = &pipelines.pre_transform else {
            return;
        };
        let device_buffers = self
            .device_buffers
            .iter()
            .find(|b| b.device_id == id)
            .unwrap();
        let Some(output) = &device_buffers.pre_transformed_vertices else {
            return;
        };

        let Some(pre_transform_set) = &self.pre_transform_set else {
            return;
        };

        pre_transform.core.bind(cb);
        pre_transform.core.set_descriptors(cb, &self.scene_sets, 0, 0);
        let mut offset = 0u64;
        for (i, instance) in self.instance_cache.instances().iter().enumerate() {
            let object = &scene.objects()[instance.object_index];
            let pc = PreTransformPushConstants {
                vertex_count: object.mesh.vertices().len() as u32,
                instance_id: i as u32,
            };
            let bytes = pc.vertex_count as u64 * std::mem::size_of::<crate::mesh::Vertex>() as u64;

            pre_transform_set.set_buffer(
                id,
                "input_verts",
                vec![vk::DescriptorBufferInfo::default()
                    .buffer(object.mesh.vertex_buffer(id))
                    .range(vk::WHOLE_SIZE)],
            );
            pre_transform_set.set_buffer(
                id,
                "output_verts",
                vec![vk::DescriptorBufferInfo::default()
                    .buffer(output.raw())
                    .offset(offset)
                    .range(bytes.max(4))],
            );
            pre_transform.core.push_descriptors(cb, pre_transform_set, 1);

            pre_transform.core.push_constants(cb, &pc);
            pre_transform.dispatch(cb, pc.vertex_count.div_ceil(PRE_TRANSFORM_GROUP_SIZE), 1, 1);
            offset += bytes;
        }

        crate::vulkan::command::buffer_barrier(
            device,
            cb,
            output.raw(),
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
    }
}

impl SceneStage {
    /// Refreshes the GPU mirrors for the frame and submits the cached
    /// command buffers on every participating device. With no scene bound
    /// the dependencies pass through untouched.
    pub fn run(&mut self, ctx: &Context, frame: &Frame, deps: &Dependencies) -> Result<Dependencies> {
        if self.scene.is_none() {
            return Ok(deps.clone());
        }
        self.update(ctx, frame.frame_index, frame.frame_counter)?;
        let mut out = Dependencies::new();
        for (_, core) in &self.cores {
            out.add(core.submit(frame, deps)?);
        }
        Ok(out)
    }
}

fn blas_entry_for_mesh(
    mesh: &crate::mesh::Mesh,
    material: &crate::scene::Material,
    id: DeviceId,
) -> BlasBuildEntry {
    BlasBuildEntry {
        geometry: BlasGeometry::Triangles {
            vertex_address: mesh.vertex_buffer_address(id),
            vertex_stride: std::mem::size_of::<crate::mesh::Vertex>() as u64,
            vertex_count: mesh.vertices().len() as u32,
            index_address: mesh.index_buffer_address(id),
            triangle_count: mesh.triangle_count() as u32,
        },
        opaque: material.transmittance <= 0.0 && material.albedo_factor.w >= 1.0,
    }
}

fn transform_to_khr(transform: &Matrix4<f32>) -> vk::TransformMatrixKHR {
    let t = transform.transpose();
    let mut matrix = [0.0f32; 12];
    matrix.copy_from_slice(&t.as_slice()[0..12]);
    vk::TransformMatrixKHR { matrix }
}

fn directional_light_transform(light: &DirectionalLight) -> Matrix4<f32> {
    let dir = light.direction.normalize();
    let up = if dir.y.abs() > 0.99 {
        Vector3::z()
    } else {
        Vector3::y()
    };
    let right = up.cross(&dir).normalize();
    let up = dir.cross(&right);
    Matrix4::from_columns(&[
        Vector4::new(right.x, right.y, right.z, 0.0),
        Vector4::new(up.x, up.y, up.z, 0.0),
        Vector4::new(dir.x, dir.y, dir.z, 0.0),
        Vector4::new(0.0, 0.0, 0.0, 1.0),
    ])
}

/// Projects the view frustum (single camera) or the mean camera position
/// onto the light plane to center the cascades.
fn cascade_center(cameras: &[Camera], light_transform: &Matrix4<f32>) -> Vector2<f32> {
    if cameras.is_empty() {
        return Vector2::zeros();
    }
    let world_to_light = light_transform
        .try_inverse()
        .unwrap_or_else(Matrix4::identity);
    if cameras.len() == 1 {
        // Fit: project the frustum corners and take their center.
        let camera = &cameras[0];
        let inv_view_proj = camera
            .view_projection()
            .try_inverse()
            .unwrap_or_else(Matrix4::identity);
        let mut center = Vector2::zeros();
        let mut count = 0.0f32;
        for &z in &[0.0f32, 1.0] {
            for &y in &[-1.0f32, 1.0] {
                for &x in &[-1.0f32, 1.0] {
                    let corner = inv_view_proj * Vector4::new(x, y, z, 1.0);
                    if corner.w.abs() < 1e-9 {
                        continue;
                    }
                    let world = corner / corner.w;
                    let light = world_to_light * Vector4::new(world.x, world.y, world.z, 1.0);
                    center += Vector2::new(light.x, light.y);
                    count += 1.0;
                }
            }
        }
        center / count.max(1.0)
    } else {
        let mut center = Vector2::zeros();
        for camera in cameras {
            let pos = camera.position();
            let light = world_to_light * Vector4::new(pos.x, pos.y, pos.z, 1.0);
            center += Vector2::new(light.x, light.y);
        }
        center / cameras.len() as f32
    }
}

fn directional_shadow_map(
    light: &DirectionalLight,
    spec: &ShadowMapSpec,
    light_transform: &Matrix4<f32>,
    cameras: &[Camera],
    map_index: usize,
    sub_sizes: &mut Vec<(u32, u32)>,
) -> ShadowMapInstance {
    let area_size = Vector2::new(
        (spec.x_range.1 - spec.x_range.0).abs(),
        (spec.y_range.1 - spec.y_range.0).abs(),
    );
    // Bias is adjusted so that it's independent of the depth range.
    let bias_scale = 20.0 / (spec.depth_range.0 - spec.depth_range.1).abs();

    let center = cascade_center(cameras, light_transform);
    let top_offset = if spec.cascades.is_empty() {
        Vector2::zeros()
    } else {
        align_cascade(center, area_size, 1.0, spec.resolution)
    };

    let mut face_cam = Camera::orthographic(
        spec.x_range.0 + top_offset.x,
        spec.x_range.1 + top_offset.x,
        spec.y_range.0 + top_offset.y,
        spec.y_range.1 + top_offset.y,
        spec.depth_range.0,
        spec.depth_range.1,
    );
    face_cam.transform = *light_transform;

    let atlas_index = sub_sizes.len();
    sub_sizes.push(spec.resolution);

    let mut cascades = Vec::new();
    let mut cascade_scale = 2.0f32;
    for _ in 1..spec.cascades.len().max(1) {
        let offset = align_cascade(center, area_size, cascade_scale, spec.resolution);
        let area = Vector4::new(
            spec.x_range.0 * cascade_scale + offset.x,
            spec.x_range.1 * cascade_scale + offset.x,
            spec.y_range.0 * cascade_scale + offset.y,
            spec.y_range.1 * cascade_scale + offset.y,
        );
        let mut cam = face_cam;
        cam.projection = crate::scene::CameraProjection::Orthographic {
            left: area.x,
            right: area.y,
            bottom: area.z,
            top: area.w,
            near: spec.depth_range.0,
            far: spec.depth_range.1,
        };

        cascades.push(ShadowCascade {
            atlas_index: sub_sizes.len(),
            offset: (top_offset - offset).component_div(&Vector2::new(
                0.5 * (area.y - area.x).abs(),
                0.5 * (area.w - area.z).abs(),
            )),
            scale: cascade_scale,
            bias_scale: cascade_scale.sqrt(),
            camera: cam,
        });
        sub_sizes.push(spec.resolution);
        cascade_scale *= 2.0;
    }

    ShadowMapInstance {
        atlas_index,
        map_index,
        face_size: spec.resolution,
        min_bias: spec.min_bias * bias_scale,
        max_bias: spec.max_bias * bias_scale,
        radius: Vector2::new(
            light.angle.to_radians().tan() / area_size.x,
            light.angle.to_radians().tan() / area_size.y,
        ),
        faces: vec![face_cam],
        cascades,
    }
}

const OMNI_FACE_DIRECTIONS: [(Vector3<f32>, Vector3<f32>); 6] = [
    (Vector3::new(-1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)),
    (Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)),
    (Vector3::new(0.0, -1.0, 0.0), Vector3::new(0.0, 0.0, 1.0)),
    (Vector3::new(0.0, 1.0, 0.0), Vector3::new(0.0, 0.0, 1.0)),
    (Vector3::new(0.0, 0.0, -1.0), Vector3::new(0.0, 1.0, 0.0)),
    (Vector3::new(0.0, 0.0, 1.0), Vector3::new(0.0, 1.0, 0.0)),
];

fn look_transform(position: Vector3<f32>, forward: Vector3<f32>, up: Vector3<f32>) -> Matrix4<f32> {
    let f = forward.normalize();
    let r = up.cross(&f).normalize();
    let u = f.cross(&r);
    Matrix4::from_columns(&[
        Vector4::new(r.x, r.y, r.z, 0.0),
        Vector4::new(u.x, u.y, u.z, 0.0),
        Vector4::new(f.x, f.y, f.z, 0.0),
        Vector4::new(position.x, position.y, position.z, 1.0),
    ])
}

/// Cubemap shadow map: six 90 degree faces in a 3x2 layout in the atlas.
fn omni_shadow_map(
    position: Vector3<f32>,
    radius: f32,
    cutoff_radius: f32,
    spec: &ShadowMapSpec,
    map_index: usize,
    sub_sizes: &mut Vec<(u32, u32)>,
) -> ShadowMapInstance {
    let mut faces = Vec::with_capacity(6);
    for (dir, up) in OMNI_FACE_DIRECTIONS {
        let mut cam = Camera::perspective(90.0, 1.0, spec.near, cutoff_radius);
        cam.transform = look_transform(position, dir, up);
        faces.push(cam);
    }
    let atlas_index = sub_sizes.len();
    sub_sizes.push((spec.resolution.0 * 3, spec.resolution.1 * 2));
    ShadowMapInstance {
        atlas_index,
        map_index,
        face_size: spec.resolution,
        min_bias: spec.min_bias,
        max_bias: spec.max_bias,
        radius: Vector2::new(radius, radius),
        faces,
        cascades: Vec::new(),
    }
}

fn spot_shadow_map(
    light: &Spotlight,
    spec: &ShadowMapSpec,
    map_index: usize,
    sub_sizes: &mut Vec<(u32, u32)>,
) -> ShadowMapInstance {
    let mut cam = Camera::perspective(
        light.cutoff_angle * 2.0,
        1.0,
        spec.near,
        light.cutoff_radius,
    );
    let up = if light.direction.normalize().y.abs() > 0.99 {
        Vector3::z()
    } else {
        Vector3::y()
    };
    cam.transform = look_transform(light.position, light.direction, up);

    let atlas_index = sub_sizes.len();
    sub_sizes.push(spec.resolution);
    ShadowMapInstance {
        atlas_index,
        map_index,
        face_size: spec.resolution,
        min_bias: spec.min_bias,
        max_bias: spec.max_bias,
        radius: Vector2::new(light.radius, light.radius),
        faces: vec![cam],
        cascades: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_cascade_snaps_to_texel_grid() {
        let area = Vector2::new(32.0, 32.0);
        let resolution = (512, 512);
        let step = 32.0 / 512.0;
        let aligned = align_cascade(Vector2::new(0.033, -0.01), area, 1.0, resolution);
        assert!((aligned.x / step).fract().abs() < 1e-4);
        assert!((aligned.y / step).fract().abs() < 1e-4);
        // Idempotent: aligning an aligned offset changes nothing.
        let again = align_cascade(aligned, area, 1.0, resolution);
        assert!((again - aligned).norm() < 1e-6);
    }

    #[test]
    fn camera_table_keeps_previous_frame_blocks() {
        let mut cam_a = CameraUniform::default();
        cam_a.origin = [1.0, 0.0, 0.0, 1.0];
        let mut cam_b = CameraUniform::default();
        cam_b.origin = [2.0, 0.0, 0.0, 1.0];

        let block = std::mem::size_of::<CameraUniform>();
        let mut old = Vec::new();
        let mut out = vec![0u8; block * 2];

        fill_camera_table(&[cam_a], &mut old, &mut out);
        // First frame: previous half equals the current one.
        assert_eq!(out[0..block], out[block..block * 2]);

        fill_camera_table(&[cam_b], &mut old, &mut out);
        let current: &[u8] = &out[0..block];
        let previous: &[u8] = &out[block..block * 2];
        let a_bytes = unsafe {
            std::slice::from_raw_parts(&cam_a as *const CameraUniform as *const u8, block)
        };
        let b_bytes = unsafe {
            std::slice::from_raw_parts(&cam_b as *const CameraUniform as *const u8, block)
        };
        assert_eq!(current, b_bytes);
        assert_eq!(previous, a_bytes);
    }

    #[test]
    fn omni_maps_use_3x2_layout() {
        let spec = ShadowMapSpec::default();
        let mut sub_sizes = Vec::new();
        let sm = omni_shadow_map(Vector3::zeros(), 0.1, 10.0, &spec, 0, &mut sub_sizes);
        assert_eq!(sm.faces.len(), 6);
        assert_eq!(
            sub_sizes[sm.atlas_index],
            (spec.resolution.0 * 3, spec.resolution.1 * 2)
        );
    }

    #[test]
    fn directional_cascades_reserve_atlas_slots() {
        let light = DirectionalLight {
            color: Vector3::new(1.0, 1.0, 1.0),
            direction: Vector3::new(0.2, -1.0, 0.1),
            angle: 0.26,
            shadow_map: None,
        };
        let spec = ShadowMapSpec {
            cascades: vec![Vector2::zeros(); 4],
            ..Default::default()
        };
        let transform = directional_light_transform(&light);
        let mut sub_sizes = Vec::new();
        let sm = directional_shadow_map(&light, &spec, &transform, &[], 0, &mut sub_sizes);
        // Base map plus one slot per additional cascade.
        assert_eq!(sm.cascades.len(), 3);
        assert_eq!(sub_sizes.len(), 4);
        // Cascade scales double each step and bias grows with sqrt(scale).
        assert_eq!(sm.cascades[0].scale, 2.0);
        assert_eq!(sm.cascades[1].scale, 4.0);
        assert!((sm.cascades[1].bias_scale - 2.0).abs() < 1e-6);
    }
}
