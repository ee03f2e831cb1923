/*! ReSTIR spatiotemporal resampling core.
 *
 * Estimates global-illumination radiance at every primary-visible surface
 * with reservoir resampling: canonical BSDF-sampled paths are merged with
 * temporally reprojected reservoirs and spatially reused neighbours under
 * MIS, with confidence-capped accumulation. Reservoir state lives in a
 * double-buffered set of textures to benefit from the locality-preserving
 * layout; optional planes are dropped when the shift mapping does not need
 * them.
 */

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;

use crate::{
    gbuffer::{GBufferEntry, GBufferTarget},
    util::{next_power_of_two, r2_noise},
    vulkan::{
        command::image_barrier,
        context::{Context, Frame},
        descriptor::{DescriptorSetLayout, PushDescriptorSet},
        device::{Device, DeviceId, DeviceMask},
        pipeline::ComputePipeline,
        resource::{Sampler, SamplerDescriptor, Texture, TextureDescriptor},
        shader::{ShaderSource, ShaderStage},
        timer::Timer,
    },
};

use super::{scene::SceneStage, CommandBufferStrategy, Dependencies, StageCore};

const DISPATCH_WIDTH: u32 = 16;
const DISPATCH_HEIGHT: u32 = 16;

/// Absolute maximum confidence until the bit packing breaks down.
pub const MAX_CONFIDENCE_HARD_CAP: u32 = 32767;

/// Hard cap of the spatial neighbour selection bitmask.
pub const MAX_SPATIAL_SAMPLES: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftMapping {
    /// Good for direct light and okay for diffuse GI; very fast.
    Reconnection,
    /// Slightly worse quality and slower, but tolerates higher confidence
    /// and works with specular surfaces.
    RandomReplay,
    /// Reconnection delayed further into the path; good all-rounder.
    Hybrid,
}

/// Scattering lobe at the head or tail of a reused path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathLobe {
    /// Head lobe zero implies a next-event-estimation sample.
    Nee = 0,
    Diffuse = 1,
    Transmission = 2,
    Reflection = 3,
}

/// Packs the confidence/path-length reservoir word:
/// bits 0..14 confidence, bit 15 NEE terminal, 16..17 head lobe,
/// 18..19 tail lobe, 20..25 head length, 26..31 tail length.
pub fn pack_reservoir_metadata(
    confidence: u32,
    nee_terminal: bool,
    head_lobe: PathLobe,
    tail_lobe: PathLobe,
    head_length: u32,
    tail_length: u32,
) -> u32 {
    let confidence = confidence.min(MAX_CONFIDENCE_HARD_CAP);
    confidence
        | ((nee_terminal as u32) << 15)
        | ((head_lobe as u32) << 16)
        | ((tail_lobe as u32) << 18)
        | (head_length.min(63) << 20)
        | (tail_length.min(63) << 26)
}

pub fn unpack_reservoir_confidence(packed: u32) -> u32 {
    packed & MAX_CONFIDENCE_HARD_CAP
}

pub fn unpack_reservoir_metadata(packed: u32) -> (u32, bool, u32, u32, u32, u32) {
    (
        packed & 0x7fff,
        packed & (1 << 15) != 0,
        (packed >> 16) & 0x3,
        (packed >> 18) & 0x3,
        (packed >> 20) & 0x3f,
        (packed >> 26) & 0x3f,
    )
}

/// The spatial trace pass packs its fan-out so the per-pixel candidate work
/// fits one workgroup dispatch.
pub(crate) fn selection_tile_size(spatial_samples: u32) -> u32 {
    next_power_of_two(((128 / spatial_samples.max(1)) as f32).sqrt() as u32).max(1)
}

#[derive(Clone)]
pub struct RestirOptions {
    /// The default assumes a reconstructed, inexact position as produced by
    /// rasterization and depth reconstruction; G-buffers originating from a
    /// ray tracer can set this much lower.
    pub min_ray_dist: f32,
    pub max_ray_dist: f32,
    pub opaque_only: bool,
    /// 1 is equivalent to ReSTIR DI.
    pub max_bounces: u32,
    pub min_spatial_search_radius: f32,
    /// Scale and upper limit for the heuristically adjusted search radius.
    pub max_spatial_search_radius: f32,
    /// When temporal reprojection fails, further candidates are probed
    /// within a widening radius.
    pub temporal_search_base_radius: f32,
    pub temporal_search_widening: f32,
    pub temporal_reuse_search_attempts: u32,
    /// Assume the material of the reprojected point is unchanged since the
    /// previous frame. Forced on when temporal material inputs are missing.
    pub assume_unchanged_material: bool,
    pub assume_unchanged_reconnection_radiance: bool,
    pub assume_unchanged_temporal_visibility: bool,
    /// Forced on when no previous-frame acceleration structure exists.
    pub assume_unchanged_acceleration_structures: bool,
    /// Bias spatial neighbour picks towards the local tangent disk;
    /// improves grazing angles for a small cost.
    pub spatial_sample_oriented_disk: bool,
    /// Neighbour pixels picked for spatial reuse; zero disables it.
    pub spatial_samples: u32,
    pub canonical_samples: u32,
    /// Number of ReSTIR iterations; converges towards noise-free output.
    pub passes: u32,
    /// Create a new canonical sample for each pass. Faster when false, but
    /// causes sample impoverishment unless `max_confidence` is low.
    pub do_canonical_samples_for_passes: bool,
    /// Amount of sample reuse. Values above ~32 cause visible correlation
    /// artifacts; 32767 is the absolute maximum.
    pub max_confidence: f32,
    pub temporal_reuse: bool,
    /// World-space radius around the shade point inside which the hybrid
    /// shift falls back to random replay.
    pub reconnection_scale: f32,
    pub shift_mapping: ShiftMapping,
    /// Accumulate successive frames for a reference render. Not supported
    /// together with demodulated output.
    pub accumulate: bool,
    /// Write demodulated diffuse and reflection instead of combined color.
    pub demodulated_output: bool,
    /// Permuting temporal samples trades noise for reduced temporal
    /// correlation, which helps denoisers.
    pub temporal_permutation: u32,
    /// 0 disables path-space regularization.
    pub regularization_gamma: f32,
    pub camera_index: u32,
    pub expect_taa_jitter: bool,
}

impl Default for RestirOptions {
    fn default() -> Self {
        Self {
            min_ray_dist: 1e-3,
            max_ray_dist: 1e9,
            opaque_only: false,
            max_bounces: 2,
            min_spatial_search_radius: 1.0,
            max_spatial_search_radius: 32.0,
            temporal_search_base_radius: 4.0,
            temporal_search_widening: 4.0,
            temporal_reuse_search_attempts: 0,
            assume_unchanged_material: false,
            assume_unchanged_reconnection_radiance: false,
            assume_unchanged_temporal_visibility: false,
            assume_unchanged_acceleration_structures: false,
            spatial_sample_oriented_disk: true,
            spatial_samples: 1,
            canonical_samples: 1,
            passes: 1,
            do_canonical_samples_for_passes: false,
            max_confidence: 16.0,
            temporal_reuse: true,
            reconnection_scale: 2.0,
            shift_mapping: ShiftMapping::Hybrid,
            accumulate: false,
            demodulated_output: false,
            temporal_permutation: 0,
            regularization_gamma: 0.0,
            camera_index: 0,
            expect_taa_jitter: false,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RestirConfig {
    display_size: [u32; 2],
    min_ray_dist: f32,
    max_ray_dist: f32,
    reconnection_scale: f32,
    max_confidence: f32,
    min_spatial_radius: f32,
    max_spatial_radius: f32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CanonicalPushConstants {
    config: RestirConfig,
    sample_index: u32,
    camera_index: u32,
    first_pass: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct TemporalPushConstants {
    config: RestirConfig,
    search_base_radius: f32,
    search_widening: f32,
    sample_index: u32,
    camera_index: u32,
    jitter: [f32; 2],
    permutation: i32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SpatialTracePushConstants {
    config: RestirConfig,
    sample_index: u32,
    camera_index: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SpatialGatherPushConstants {
    config: RestirConfig,
    display_size: [u32; 2],
    sample_index: u32,
    camera_index: u32,
    accumulated_samples: u32,
    initialize_output: u32,
    accumulate_color: u32,
    update_sample_color: u32,
}

struct ReservoirTextures {
    /// Target-function value, unbiased contribution weight, base-path
    /// jacobian and the packed confidence/path-length word. No compression:
    /// halves are not precise enough for any of these.
    ris_data: Texture,
    /// Barycentrics / normals / envmap direction plus instance and
    /// primitive ids. Absent with the random-replay shift.
    reconnection_data: Option<Texture>,
    /// Radiance estimate plus its luminance. Absent with random replay.
    reconnection_radiance: Option<Texture>,
    /// Head and tail RNG seeds plus the incident direction. Absent when one
    /// bounce reconnection needs no replay.
    rng_seeds: Option<Texture>,
}

impl ReservoirTextures {
    fn barrier(&self, device: &Device, cb: vk::CommandBuffer, id: DeviceId) {
        // Reuse steps must see committed reservoir writes.
        let mut images = vec![self.ris_data.image(id)];
        if let Some(t) = &self.reconnection_data {
            images.push(t.image(id));
        }
        if let Some(t) = &self.reconnection_radiance {
            images.push(t.image(id));
        }
        if let Some(t) = &self.rng_seeds {
            images.push(t.image(id));
        }
        for image in images {
            image_barrier(
                device,
                cb,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
            );
        }
    }
}

/// G-buffer entries read by the resampling kernels.
const USED_GBUFFER_ENTRIES: [GBufferEntry; 8] = [
    GBufferEntry::Depth,
    GBufferEntry::Position,
    GBufferEntry::Normal,
    GBufferEntry::FlatNormal,
    GBufferEntry::Curvature,
    GBufferEntry::Albedo,
    GBufferEntry::Emission,
    GBufferEntry::Material,
];

fn gbuffer_binding_name(entry: GBufferEntry, previous: bool) -> &'static str {
    match (entry, previous) {
        (GBufferEntry::Depth | GBufferEntry::Position, false) => "depth_or_position_tex",
        (GBufferEntry::Depth | GBufferEntry::Position, true) => "prev_depth_or_position_tex",
        (GBufferEntry::Normal, false) => "normal_tex",
        (GBufferEntry::Normal, true) => "prev_normal_tex",
        (GBufferEntry::FlatNormal, false) => "flat_normal_tex",
        (GBufferEntry::FlatNormal, true) => "prev_flat_normal_tex",
        (GBufferEntry::Curvature, false) => "curvature_tex",
        (GBufferEntry::Curvature, true) => "prev_curvature_tex",
        (GBufferEntry::Albedo, false) => "albedo_tex",
        (GBufferEntry::Albedo, true) => "prev_albedo_tex",
        (GBufferEntry::Emission, false) => "emission_tex",
        (GBufferEntry::Emission, true) => "prev_emission_tex",
        (GBufferEntry::Material, false) => "material_tex",
        (GBufferEntry::Material, true) => "prev_material_tex",
        _ => "unused_tex",
    }
}

pub struct RestirStage {
    device: Arc<Device>,
    core: StageCore,

    canonical: ComputePipeline,
    canonical_set: PushDescriptorSet,
    temporal: ComputePipeline,
    temporal_set: PushDescriptorSet,
    spatial_trace: Option<ComputePipeline>,
    spatial_trace_set: Option<PushDescriptorSet>,
    spatial_gather: ComputePipeline,
    spatial_gather_set: PushDescriptorSet,
    scene_sets: crate::vulkan::descriptor::AllocatedDescriptorSets,
    scene_revision: u32,

    reservoir_data: [ReservoirTextures; 2],
    reservoir_parity: usize,
    selection_data: Option<Texture>,
    /// Per-candidate MIS partials; present when spatial reuse is on.
    spatial_mis_data: Option<Texture>,
    spatial_candidate_color: Option<Texture>,
    cached_sample_color: Texture,
    selection_tile_size: u32,

    current_buffers: GBufferTarget,
    previous_buffers: GBufferTarget,
    gbuf_sampler: Sampler,

    options: RestirOptions,
    accumulated_samples: u32,
    valid_history_frame: u64,

    stage_timer: Timer,
    canonical_timer: Timer,
    temporal_timer: Timer,
    trace_timer: Timer,
    gather_timer: Timer,
}

impl RestirStage {
    pub fn new(
        ctx: &Context,
        id: DeviceId,
        scene_stage: &SceneStage,
        current_buffers: GBufferTarget,
        previous_buffers: GBufferTarget,
        options: RestirOptions,
    ) -> Result<Self> {
        let device = ctx.device(id).clone();
        let core = StageCore::new(device.clone(), CommandBufferStrategy::PerFrame)?;
        let mut opt = options;

        // There's an internal bitmask that won't deal with more than 16
        // spatial samples.
        if opt.spatial_samples > MAX_SPATIAL_SAMPLES {
            anyhow::bail!(
                "spatial_samples {} exceeds the hard cap of {MAX_SPATIAL_SAMPLES}",
                opt.spatial_samples
            );
        }
        opt.max_confidence = opt.max_confidence.min(MAX_CONFIDENCE_HARD_CAP as f32);

        let c = &current_buffers;
        let p = &previous_buffers;
        let has = |t: &GBufferTarget, e: GBufferEntry| t.contains(e);
        assert!(
            (has(c, GBufferEntry::Depth) || has(c, GBufferEntry::Position))
                && has(c, GBufferEntry::Normal),
            "ReSTIR requires depth or position plus normals in the G-buffer"
        );
        assert!(has(c, GBufferEntry::Albedo) && has(c, GBufferEntry::Material));
        assert!(has(c, GBufferEntry::ScreenMotion));

        if opt.demodulated_output {
            if !has(c, GBufferEntry::Diffuse) || !has(c, GBufferEntry::Reflection) {
                anyhow::bail!("Missing demodulated output buffers (diffuse, reflection)");
            }
        } else if !has(c, GBufferEntry::Color) {
            anyhow::bail!("Missing color output buffer");
        }

        let temporal_inputs_ok = has(p, GBufferEntry::Normal)
            && (has(p, GBufferEntry::Depth) || has(p, GBufferEntry::Position));
        if opt.temporal_reuse && !temporal_inputs_ok {
            log::warn!(
                "Temporal reuse disabled: previous-frame normals and depth/position are missing"
            );
            opt.temporal_reuse = false;
        }
        if !opt.assume_unchanged_material
            && (!has(p, GBufferEntry::Albedo) || !has(p, GBufferEntry::Material))
        {
            log::warn!(
                "Assuming unchanged materials in temporal reuse: previous-frame material \
                 textures are missing"
            );
            opt.assume_unchanged_material = true;
        }
        if !scene_stage.has_prev_tlas() && !opt.assume_unchanged_acceleration_structures {
            log::warn!(
                "Assuming unchanged acceleration structures: previous-frame acceleration \
                 structures are not available"
            );
            opt.assume_unchanged_acceleration_structures = true;
        }
        if opt.accumulate && opt.demodulated_output {
            log::warn!("Accumulation is not supported with demodulated output; disabling");
            opt.accumulate = false;
        }

        let size = current_buffers.size();
        let storage_tex = |format: vk::Format, layers: u32| -> Result<Texture> {
            Texture::new(
                ctx,
                DeviceMask::single(id),
                TextureDescriptor::new_2d(size, format, vk::ImageUsageFlags::STORAGE)
                    .array_layers(layers),
            )
        };

        let cached_sample_color = storage_tex(vk::Format::R32G32B32A32_SFLOAT, 1)?;
        let make_reservoirs = || -> Result<ReservoirTextures> {
            let reconnection = opt.shift_mapping != ShiftMapping::RandomReplay;
            let rng = opt.max_bounces != 1 || opt.shift_mapping != ShiftMapping::Reconnection;
            Ok(ReservoirTextures {
                ris_data: storage_tex(vk::Format::R32G32B32A32_UINT, 1)?,
                reconnection_data: reconnection
                    .then(|| storage_tex(vk::Format::R32G32B32A32_UINT, 1))
                    .transpose()?,
                reconnection_radiance: reconnection
                    .then(|| storage_tex(vk::Format::R32G32B32A32_SFLOAT, 1))
                    .transpose()?,
                rng_seeds: rng
                    .then(|| storage_tex(vk::Format::R32G32B32A32_UINT, 1))
                    .transpose()?,
            })
        };
        let reservoir_data = [make_reservoirs()?, make_reservoirs()?];

        let (selection_data, spatial_mis_data, spatial_candidate_color) =
            if opt.spatial_samples > 0 {
                (
                    Some(storage_tex(vk::Format::R32G32_UINT, 1)?),
                    Some(storage_tex(
                        vk::Format::R32G32B32A32_SFLOAT,
                        opt.spatial_samples.max(1),
                    )?),
                    Some(storage_tex(
                        vk::Format::R32G32B32A32_SFLOAT,
                        opt.spatial_samples.max(1),
                    )?),
                )
            } else {
                (None, None, None)
            };

        let tile_size = selection_tile_size(opt.spatial_samples);

        let mut defines = BTreeMap::new();
        scene_stage.get_defines(&mut defines);
        defines.insert(String::from("RAY_TRACING_SUPPORTED"), String::new());
        let visibility_ray_mask: u32 = 0xFF ^ 0x02;
        defines.insert(String::from("DISPATCH_WIDTH"), DISPATCH_WIDTH.to_string());
        defines.insert(String::from("DISPATCH_HEIGHT"), DISPATCH_HEIGHT.to_string());
        defines.insert(
            String::from("VISIBILITY_RAY_MASK"),
            visibility_ray_mask.to_string(),
        );
        defines.insert(String::from("RAY_MASK"), String::from("255"));
        defines.insert(String::from("MAX_BOUNCES"), opt.max_bounces.to_string());
        defines.insert(
            String::from("CANONICAL_SAMPLES"),
            opt.canonical_samples.to_string(),
        );
        defines.insert(
            String::from("TEMPORAL_REUSE_ATTEMPTS"),
            opt.temporal_reuse_search_attempts.to_string(),
        );
        defines.insert(
            String::from("MAX_SPATIAL_SAMPLES"),
            opt.spatial_samples.to_string(),
        );
        if opt.spatial_samples > 0 {
            defines.insert(String::from("SELECTION_TILE_SIZE"), tile_size.to_string());
        }
        if has(c, GBufferEntry::Position) {
            defines.insert(String::from("USE_POSITION"), String::new());
        }
        if has(c, GBufferEntry::FlatNormal) {
            defines.insert(String::from("USE_FLAT_NORMAL"), String::new());
        }
        if !opt.opaque_only {
            defines.insert(String::from("STOCHASTIC_ALPHA_BLENDING"), String::new());
        }
        if opt.assume_unchanged_material {
            defines.insert(String::from("ASSUME_SAME_MATERIAL_IN_TEMPORAL"), String::new());
        }
        if opt.assume_unchanged_reconnection_radiance {
            defines.insert(
                String::from("ASSUME_UNCHANGED_RECONNECTION_RADIANCE"),
                String::new(),
            );
        }
        if opt.assume_unchanged_temporal_visibility {
            defines.insert(
                String::from("ASSUME_UNCHANGED_TEMPORAL_VISIBILITY"),
                String::new(),
            );
        }
        if opt.assume_unchanged_acceleration_structures {
            defines.insert(
                String::from("ASSUME_UNCHANGED_ACCELERATION_STRUCTURES"),
                String::new(),
            );
        }
        if opt.spatial_sample_oriented_disk {
            defines.insert(String::from("NEIGHBOR_SAMPLE_ORIENTED_DISKS"), String::new());
        }
        if opt.demodulated_output {
            defines.insert(String::from("DEMODULATE_OUTPUT"), String::new());
        }
        if opt.regularization_gamma > 0.0 {
            defines.insert(
                String::from("PATH_SPACE_REGULARIZATION"),
                opt.regularization_gamma.to_string(),
            );
        }
        if has(c, GBufferEntry::TemporalGradient) {
            defines.insert(String::from("TEMPORAL_GRADIENTS"), String::new());
        }
        if has(c, GBufferEntry::Confidence) {
            defines.insert(String::from("OUTPUT_CONFIDENCE"), String::new());
        }
        match opt.shift_mapping {
            ShiftMapping::Reconnection => {
                defines.insert(String::from("USE_RECONNECTION_SHIFT"), String::new());
            }
            ShiftMapping::RandomReplay => {
                defines.insert(String::from("USE_RANDOM_REPLAY_SHIFT"), String::new());
            }
            ShiftMapping::Hybrid => {
                defines.insert(String::from("USE_HYBRID_SHIFT"), String::new());
            }
        }

        // Each kernel gets its own push-descriptor set 0; set 1 is the scene
        // interface merged from all four kernels and written by the scene
        // stage by name.
        let mut kernel_shaders = Vec::new();
        for path in [
            "shader/restir_canonical.comp",
            "shader/restir_temporal.comp",
            "shader/restir_spatial_trace.comp",
            "shader/restir_spatial_gather.comp",
        ] {
            kernel_shaders.push(ShaderSource::new(
                ctx.shader_cache(),
                path,
                ShaderStage::Compute,
                &defines,
            )?);
        }
        let mut scene_layout = DescriptorSetLayout::new(1, false);
        for shader in &kernel_shaders {
            scene_layout.add(shader);
        }
        scene_layout.set_binding_params(
            "textures",
            scene_stage.max_samplers(),
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "vertices",
            scene_stage.max_instances() as u32,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        scene_layout.set_binding_params(
            "indices",
            scene_stage.max_instances() as u32,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        for name in ["envmap_tex", "envmap_alias_table", "shadow_map_atlas_tex", "tri_lights"] {
            scene_layout.set_binding_params(name, 1, vk::DescriptorBindingFlags::PARTIALLY_BOUND);
        }
        let scene_layout = Arc::new(scene_layout);
        let mut scene_sets =
            crate::vulkan::descriptor::AllocatedDescriptorSets::new(
                ctx,
                DeviceMask::single(id),
                scene_layout.clone(),
            );
        scene_sets.reset(1)?;

        let make_kernel = |shader: &ShaderSource| -> Result<(ComputePipeline, PushDescriptorSet)> {
            let mut layout = DescriptorSetLayout::new(0, true);
            layout.add(shader);
            for name in [
                "emission_tex",
                "prev_emission_tex",
                "flat_normal_tex",
                "prev_flat_normal_tex",
                "curvature_tex",
                "prev_curvature_tex",
                "prev_albedo_tex",
                "prev_material_tex",
                "prev_normal_tex",
                "prev_depth_or_position_tex",
                "motion_tex",
                "in_color",
                "out_color",
                "in_reservoir_ris_data_tex",
                "in_reservoir_reconnection_data_tex",
                "in_reservoir_reconnection_radiance_tex",
                "in_reservoir_rng_seeds_tex",
                "out_reservoir_ris_data_tex",
                "out_reservoir_reconnection_data_tex",
                "out_reservoir_reconnection_radiance_tex",
                "out_reservoir_rng_seeds_tex",
                "out_diffuse",
                "out_reflection",
                "out_length",
                "out_temporal_gradients",
                "out_confidence",
                "spatial_selection",
                "spatial_candidates",
                "mis_data",
            ] {
                layout.set_binding_params(name, 1, vk::DescriptorBindingFlags::PARTIALLY_BOUND);
            }
            let layout = Arc::new(layout);
            let pipeline =
                ComputePipeline::new(device.clone(), shader, &[&layout, &scene_layout])?;
            Ok((pipeline, PushDescriptorSet::new(layout)))
        };

        let (canonical, canonical_set) = make_kernel(&kernel_shaders[0])?;
        let (temporal, temporal_set) = make_kernel(&kernel_shaders[1])?;
        let (spatial_trace, spatial_trace_set) = if opt.spatial_samples > 0 {
            let (pipeline, set) = make_kernel(&kernel_shaders[2])?;
            (Some(pipeline), Some(set))
        } else {
            (None, None)
        };
        let (spatial_gather, spatial_gather_set) = make_kernel(&kernel_shaders[3])?;

        let gbuf_sampler = Sampler::new(
            ctx,
            DeviceMask::single(id),
            SamplerDescriptor::nearest_clamp(),
        )?;

        let devices = [&device];
        Ok(Self {
            core,
            canonical,
            canonical_set,
            temporal,
            temporal_set,
            spatial_trace,
            spatial_trace_set,
            spatial_gather,
            spatial_gather_set,
            scene_sets,
            scene_revision: 0,
            reservoir_data,
            reservoir_parity: 0,
            selection_data,
            spatial_mis_data,
            spatial_candidate_color,
            cached_sample_color,
            selection_tile_size: tile_size,
            current_buffers,
            previous_buffers,
            gbuf_sampler,
            options: opt,
            accumulated_samples: 0,
            valid_history_frame: u64::MAX,
            stage_timer: Timer::new(devices, "restir")?,
            canonical_timer: Timer::new(devices, "restir canonical")?,
            temporal_timer: Timer::new(devices, "restir temporal")?,
            trace_timer: Timer::new(devices, "restir trace")?,
            gather_timer: Timer::new(devices, "restir gather")?,
            device,
        })
    }

    pub fn reset_accumulation(&mut self) {
        self.accumulated_samples = 0;
    }

    fn config(&self) -> RestirConfig {
        let size = self.current_buffers.size();
        let opt = &self.options;
        // Radii are scaled by 1/width in here so that kernel size stays
        // invariant to resolution ratio across passes.
        RestirConfig {
            display_size: [size.0, size.1],
            min_ray_dist: opt.min_ray_dist,
            max_ray_dist: opt.max_ray_dist,
            reconnection_scale: opt.reconnection_scale * opt.max_spatial_search_radius
                / size.0 as f32,
            max_confidence: opt.max_confidence,
            min_spatial_radius: opt.min_spatial_search_radius / size.0 as f32,
            max_spatial_radius: opt.max_spatial_search_radius / size.0 as f32,
        }
    }

    fn bind_gbuffer(&self, set: &PushDescriptorSet) {
        let id = self.device.id;
        let sampled = |view: vk::ImageView| {
            vec![vk::DescriptorImageInfo::default()
                .sampler(self.gbuf_sampler.raw(id))
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)]
        };

        for entry in USED_GBUFFER_ENTRIES {
            // Don't bind depth when position is available; they share the
            // depth_or_position binding.
            if entry == GBufferEntry::Depth
                && self.current_buffers.contains(GBufferEntry::Position)
            {
                continue;
            }
            if let Some(target) = self.current_buffers.get(entry) {
                set.set_image(id, gbuffer_binding_name(entry, false), sampled(target.view));
            }
            if let Some(target) = self.previous_buffers.get(entry) {
                set.set_image(id, gbuffer_binding_name(entry, true), sampled(target.view));
            }
        }
    }

    fn bind_reservoirs(&self, set: &PushDescriptorSet) {
        let id = self.device.id;
        let storage = |texture: &Texture| {
            vec![vk::DescriptorImageInfo::default()
                .image_view(texture.view(id))
                .image_layout(vk::ImageLayout::GENERAL)]
        };
        let input = &self.reservoir_data[self.reservoir_parity];
        let output = &self.reservoir_data[1 - self.reservoir_parity];

        set.set_image(id, "in_reservoir_ris_data_tex", storage(&input.ris_data));
        if let Some(t) = &input.reconnection_data {
            set.set_image(id, "in_reservoir_reconnection_data_tex", storage(t));
        }
        if let Some(t) = &input.reconnection_radiance {
            set.set_image(id, "in_reservoir_reconnection_radiance_tex", storage(t));
        }
        if let Some(t) = &input.rng_seeds {
            set.set_image(id, "in_reservoir_rng_seeds_tex", storage(t));
        }
        set.set_image(id, "out_reservoir_ris_data_tex", storage(&output.ris_data));
        if let Some(t) = &output.reconnection_data {
            set.set_image(id, "out_reservoir_reconnection_data_tex", storage(t));
        }
        if let Some(t) = &output.reconnection_radiance {
            set.set_image(id, "out_reservoir_reconnection_radiance_tex", storage(t));
        }
        if let Some(t) = &output.rng_seeds {
            set.set_image(id, "out_reservoir_rng_seeds_tex", storage(t));
        }
    }

    fn sample_color_barrier(&self, cb: vk::CommandBuffer) {
        let id = self.device.id;
        let mut images = Vec::new();
        if self.options.demodulated_output {
            images.push(self.current_buffers.get(GBufferEntry::Diffuse).unwrap().image);
            images.push(
                self.current_buffers
                    .get(GBufferEntry::Reflection)
                    .unwrap()
                    .image,
            );
        } else {
            images.push(self.cached_sample_color.image(id));
        }
        for image in images {
            image_barrier(
                &self.device,
                cb,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
            );
        }
    }

    fn texture_barrier(&self, cb: vk::CommandBuffer, texture: &Texture) {
        image_barrier(
            &self.device,
            cb,
            texture.image(self.device.id),
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
    }

    /// Re-records the frame's command buffer: `passes` iterations of the
    /// canonical / temporal / spatial trace / spatial gather sequence with
    /// reservoir parity swaps in between.
    fn update(&mut self, frame: &Frame, scene_stage: &SceneStage) -> Result<()> {
        if scene_stage.check_update(
            crate::scene::UPDATE_ENVMAP
                | crate::scene::UPDATE_GEOMETRY
                | crate::scene::UPDATE_LIGHT,
            &mut self.scene_revision,
        ) {
            scene_stage.bind(&self.scene_sets, self.device.id, 0)?;
        }

        let cb = self.core.begin_commands(frame.frame_index, 0)?;
        let id = self.device.id;
        self.stage_timer.begin(cb, id, frame.frame_index);

        for pass_index in 0..self.options.passes {
            if pass_index != 0 {
                self.reservoir_data[self.reservoir_parity].barrier(&self.device, cb, id);
                self.reservoir_data[1 - self.reservoir_parity].barrier(&self.device, cb, id);
            }
            if pass_index == 0 || self.options.do_canonical_samples_for_passes {
                self.record_canonical_pass(cb, frame, scene_stage, pass_index)?;
            }
            self.record_spatial_pass(cb, frame, scene_stage, pass_index)?;
        }

        self.stage_timer.end(cb, id, frame.frame_index);
        self.core.end_commands(cb)?;

        if self.options.accumulate {
            self.accumulated_samples += 1;
        }
        self.valid_history_frame = frame.frame_counter;
        Ok(())
    }

    fn record_canonical_pass(
        &mut self,
        cb: vk::CommandBuffer,
        frame: &Frame,
        scene_stage: &SceneStage,
        pass_index: u32,
    ) -> Result<()> {
        let id = self.device.id;
        let config = self.config();
        let size = self.current_buffers.size();
        let sample_index = frame.frame_counter as u32 * self.options.passes + pass_index;

        self.canonical_timer.begin(cb, id, frame.frame_index);
        {
            let set = &self.canonical_set;
            let storage_info = |view: vk::ImageView| {
                vec![vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)]
            };
            set.set_image(id, "out_color", storage_info(self.cached_sample_color.view(id)));
            if self.options.demodulated_output {
                let reflection = self.current_buffers.get(GBufferEntry::Reflection).unwrap();
                set.set_image(id, "out_length", storage_info(reflection.view));
            }
            self.bind_reservoirs(set);
            self.bind_gbuffer(set);

            self.canonical.core.bind(cb);
            self.canonical.core.push_descriptors(cb, set, 0);
            self.canonical
                .core
                .set_descriptors(cb, &self.scene_sets, 0, 1);

            let pc = CanonicalPushConstants {
                config,
                sample_index,
                camera_index: self.options.camera_index,
                first_pass: (pass_index == 0) as u32,
            };
            self.canonical.core.push_constants(cb, &pc);
            self.canonical.dispatch(
                cb,
                size.0.div_ceil(DISPATCH_WIDTH),
                size.1.div_ceil(DISPATCH_HEIGHT),
                1,
            );

            self.reservoir_data[1 - self.reservoir_parity].barrier(&self.device, cb, id);
            self.sample_color_barrier(cb);
        }
        self.canonical_timer.end(cb, id, frame.frame_index);

        self.temporal_timer.begin(cb, id, frame.frame_index);
        let history_valid = self.valid_history_frame.checked_add(1) == Some(frame.frame_counter);
        if pass_index == 0 && self.options.temporal_reuse && history_valid {
            let set = &self.temporal_set;
            let storage_info = |view: vk::ImageView| {
                vec![vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)]
            };
            let motion = self.current_buffers.get(GBufferEntry::ScreenMotion).unwrap();
            set.set_image(
                id,
                "motion_tex",
                vec![vk::DescriptorImageInfo::default()
                    .sampler(self.gbuf_sampler.raw(id))
                    .image_view(motion.view)
                    .image_layout(vk::ImageLayout::GENERAL)],
            );
            set.set_image(id, "out_color", storage_info(self.cached_sample_color.view(id)));
            if let Some(gradient) = self.current_buffers.get(GBufferEntry::TemporalGradient) {
                set.set_image(id, "out_temporal_gradients", storage_info(gradient.view));
            }
            self.bind_reservoirs(set);
            self.bind_gbuffer(set);

            self.temporal.core.bind(cb);
            self.temporal.core.push_descriptors(cb, set, 0);
            self.temporal
                .core
                .set_descriptors(cb, &self.scene_sets, 0, 1);

            // Sub-pixel jitter from the R2 sequence, clamped away from the
            // texel edges.
            let jitter = r2_noise(sample_index as u64);
            let pc = TemporalPushConstants {
                config,
                search_base_radius: self.options.temporal_search_base_radius,
                search_widening: self.options.temporal_search_widening,
                sample_index,
                camera_index: self.options.camera_index,
                jitter: [
                    jitter.x.clamp(0.05, 0.95) - 0.5,
                    jitter.y.clamp(0.05, 0.95) - 0.5,
                ],
                permutation: self.options.temporal_permutation as i32,
            };
            self.temporal.core.push_constants(cb, &pc);
            self.temporal.dispatch(
                cb,
                size.0.div_ceil(DISPATCH_WIDTH),
                size.1.div_ceil(DISPATCH_HEIGHT),
                1,
            );

            self.reservoir_data[1 - self.reservoir_parity].barrier(&self.device, cb, id);
            self.sample_color_barrier(cb);
        }
        self.temporal_timer.end(cb, id, frame.frame_index);

        self.reservoir_parity = 1 - self.reservoir_parity;
        Ok(())
    }

    fn record_spatial_pass(
        &mut self,
        cb: vk::CommandBuffer,
        frame: &Frame,
        scene_stage: &SceneStage,
        pass_index: u32,
    ) -> Result<()> {
        let id = self.device.id;
        let config = self.config();
        let size = self.current_buffers.size();
        let sample_index = frame.frame_counter as u32 * self.options.passes + pass_index;
        let final_pass = pass_index == self.options.passes - 1;

        self.trace_timer.begin(cb, id, frame.frame_index);
        if let (Some(trace), Some(trace_set)) = (&self.spatial_trace, &self.spatial_trace_set) {
            let storage_info = |view: vk::ImageView| {
                vec![vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)]
            };
            trace_set.set_image(
                id,
                "spatial_selection",
                storage_info(self.selection_data.as_ref().unwrap().view(id)),
            );
            trace_set.set_image(
                id,
                "spatial_candidates",
                storage_info(self.spatial_candidate_color.as_ref().unwrap().view(id)),
            );
            trace_set.set_image(
                id,
                "mis_data",
                storage_info(self.spatial_mis_data.as_ref().unwrap().view(id)),
            );
            self.bind_reservoirs(trace_set);
            self.bind_gbuffer(trace_set);

            trace.core.bind(cb);
            trace.core.push_descriptors(cb, trace_set, 0);
            trace
                .core
                .set_descriptors(cb, &self.scene_sets, 0, 1);

            let pc = SpatialTracePushConstants {
                config,
                sample_index,
                camera_index: self.options.camera_index,
            };
            trace.core.push_constants(cb, &pc);
            trace.dispatch(
                cb,
                size.0.div_ceil(self.selection_tile_size),
                size.1.div_ceil(self.selection_tile_size),
                1,
            );

            self.texture_barrier(cb, self.spatial_mis_data.as_ref().unwrap());
            self.texture_barrier(cb, self.spatial_candidate_color.as_ref().unwrap());
            self.texture_barrier(cb, self.selection_data.as_ref().unwrap());
        }
        self.trace_timer.end(cb, id, frame.frame_index);

        self.gather_timer.begin(cb, id, frame.frame_index);
        {
            let set = &self.spatial_gather_set;
            let storage_info = |view: vk::ImageView| {
                vec![vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)]
            };
            if self.options.spatial_samples > 0 {
                set.set_image(
                    id,
                    "spatial_selection",
                    storage_info(self.selection_data.as_ref().unwrap().view(id)),
                );
                set.set_image(
                    id,
                    "spatial_candidates",
                    storage_info(self.spatial_candidate_color.as_ref().unwrap().view(id)),
                );
                set.set_image(
                    id,
                    "mis_data",
                    storage_info(self.spatial_mis_data.as_ref().unwrap().view(id)),
                );
            }
            set.set_image(id, "in_color", storage_info(self.cached_sample_color.view(id)));

            if self.options.demodulated_output {
                let diffuse = self.current_buffers.get(GBufferEntry::Diffuse).unwrap();
                let reflection = self.current_buffers.get(GBufferEntry::Reflection).unwrap();
                set.set_image(id, "out_diffuse", storage_info(diffuse.view));
                set.set_image(id, "out_reflection", storage_info(reflection.view));
            } else {
                let color = self.current_buffers.get(GBufferEntry::Color).unwrap();
                set.set_image(id, "out_reflection", storage_info(color.view));
            }
            if let Some(confidence) = self.current_buffers.get(GBufferEntry::Confidence) {
                set.set_image(id, "out_confidence", storage_info(confidence.view));
            }
            self.bind_reservoirs(set);
            self.bind_gbuffer(set);

            self.spatial_gather.core.bind(cb);
            self.spatial_gather.core.push_descriptors(cb, set, 0);
            self.spatial_gather
                .core
                .set_descriptors(cb, &self.scene_sets, 0, 1);

            let opt = &self.options;
            let pc = SpatialGatherPushConstants {
                config,
                display_size: [size.0, size.1],
                sample_index,
                camera_index: opt.camera_index,
                accumulated_samples: self.accumulated_samples,
                initialize_output: ((opt.accumulate && pass_index == 0) || !opt.accumulate) as u32,
                accumulate_color: (opt.accumulate || final_pass) as u32,
                update_sample_color: (!final_pass) as u32,
            };
            self.spatial_gather.core.push_constants(cb, &pc);
            self.spatial_gather.dispatch(
                cb,
                size.0.div_ceil(DISPATCH_WIDTH),
                size.1.div_ceil(DISPATCH_HEIGHT),
                1,
            );
        }
        self.gather_timer.end(cb, id, frame.frame_index);

        self.reservoir_parity = 1 - self.reservoir_parity;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_metadata_roundtrips() {
        let packed = pack_reservoir_metadata(1234, true, PathLobe::Transmission, PathLobe::Reflection, 5, 37);
        let (confidence, nee, head_lobe, tail_lobe, head_len, tail_len) =
            unpack_reservoir_metadata(packed);
        assert_eq!(confidence, 1234);
        assert!(nee);
        assert_eq!(head_lobe, PathLobe::Transmission as u32);
        assert_eq!(tail_lobe, PathLobe::Reflection as u32);
        assert_eq!(head_len, 5);
        assert_eq!(tail_len, 37);
    }

    #[test]
    fn reservoir_confidence_saturates_at_hard_cap() {
        let packed =
            pack_reservoir_metadata(100_000, false, PathLobe::Nee, PathLobe::Nee, 0, 0);
        assert_eq!(unpack_reservoir_confidence(packed), MAX_CONFIDENCE_HARD_CAP);
        // Saturation must not spill into the NEE flag.
        let (_, nee, ..) = unpack_reservoir_metadata(packed);
        assert!(!nee);
    }

    #[test]
    fn path_lengths_clamp_to_six_bits() {
        let packed = pack_reservoir_metadata(0, false, PathLobe::Nee, PathLobe::Nee, 200, 200);
        let (.., head_len, tail_len) = unpack_reservoir_metadata(packed);
        assert_eq!(head_len, 63);
        assert_eq!(tail_len, 63);
    }

    #[test]
    fn selection_tile_size_is_power_of_two_fit() {
        // The fan-out must fit a single workgroup dispatch.
        assert_eq!(selection_tile_size(1), 16);
        assert_eq!(selection_tile_size(2), 8);
        assert_eq!(selection_tile_size(4), 8);
        assert_eq!(selection_tile_size(8), 4);
        assert_eq!(selection_tile_size(16), 2);
        for samples in 1..=16 {
            let tile = selection_tile_size(samples);
            assert!(tile.is_power_of_two());
            assert!(tile >= 1);
        }
    }

    #[test]
    fn default_options_follow_documented_limits() {
        let opt = RestirOptions::default();
        assert!(opt.spatial_samples <= MAX_SPATIAL_SAMPLES);
        assert!(opt.max_confidence <= MAX_CONFIDENCE_HARD_CAP as f32);
        assert_eq!(opt.shift_mapping, ShiftMapping::Hybrid);
    }
}
