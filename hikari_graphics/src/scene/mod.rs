/*! CPU-side scene model.
 *
 * Holds the object, light and camera lists plus the instance cache that the
 * scene stage mirrors onto the GPU every frame. Change tracking happens
 * through three monotonic revision counters; stages remember the last value
 * they observed to decide whether their command buffers need re-recording.
 */

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix4, Vector2, Vector3, Vector4};

use crate::{
    mesh::Mesh,
    vulkan::device::MAX_FRAMES_IN_FLIGHT,
    vulkan::resource::{Sampler, Texture},
};

pub mod environment;
pub mod sampler_table;

pub use environment::EnvironmentMap;

/// Update categories for on-demand command buffer re-recording.
pub const UPDATE_ENVMAP: u32 = 1 << 0;
pub const UPDATE_GEOMETRY: u32 = 1 << 1;
pub const UPDATE_LIGHT: u32 = 1 << 2;

pub type CombinedTexture = (Arc<Texture>, Option<Arc<Sampler>>);

/// PBR metallic-roughness material.
#[derive(Clone, Default)]
pub struct Material {
    pub name: String,
    pub albedo_factor: Vector4<f32>,
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emission_factor: Vector3<f32>,
    pub transmittance: f32,
    pub ior: f32,
    pub normal_factor: f32,
    pub double_sided: bool,
    pub albedo_texture: Option<CombinedTexture>,
    pub metallic_roughness_texture: Option<CombinedTexture>,
    pub normal_texture: Option<CombinedTexture>,
    pub emission_texture: Option<CombinedTexture>,
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            albedo_factor: Vector4::new(1.0, 1.0, 1.0, 1.0),
            metallic_factor: 0.0,
            roughness_factor: 1.0,
            emission_factor: Vector3::zeros(),
            transmittance: 0.0,
            ior: 1.45,
            normal_factor: 1.0,
            double_sided: false,
            albedo_texture: None,
            metallic_roughness_texture: None,
            normal_texture: None,
            emission_texture: None,
        }
    }

    pub fn is_emissive(&self) -> bool {
        self.emission_factor != Vector3::zeros()
    }
}

/// Per-light shadow map request. Cascade offsets are in light space; the
/// first entry anchors the base cascade.
#[derive(Clone)]
pub struct ShadowMapSpec {
    pub resolution: (u32, u32),
    pub near: f32,
    pub min_bias: f32,
    pub max_bias: f32,
    pub x_range: (f32, f32),
    pub y_range: (f32, f32),
    pub depth_range: (f32, f32),
    pub cascades: Vec<Vector2<f32>>,
}

impl Default for ShadowMapSpec {
    fn default() -> Self {
        Self {
            resolution: (512, 512),
            near: 0.05,
            min_bias: 0.001,
            max_bias: 0.02,
            x_range: (-16.0, 16.0),
            y_range: (-16.0, 16.0),
            depth_range: (-64.0, 64.0),
            cascades: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct PointLight {
    pub color: Vector3<f32>,
    pub position: Vector3<f32>,
    pub radius: f32,
    pub cutoff_radius: f32,
    pub shadow_map: Option<ShadowMapSpec>,
}

#[derive(Clone)]
pub struct Spotlight {
    pub color: Vector3<f32>,
    pub position: Vector3<f32>,
    pub direction: Vector3<f32>,
    pub radius: f32,
    pub cutoff_radius: f32,
    pub cutoff_angle: f32,
    pub falloff_exponent: f32,
    pub shadow_map: Option<ShadowMapSpec>,
}

#[derive(Clone)]
pub struct DirectionalLight {
    pub color: Vector3<f32>,
    pub direction: Vector3<f32>,
    /// Angular radius in degrees, for soft shadows.
    pub angle: f32,
    pub shadow_map: Option<ShadowMapSpec>,
}

#[derive(Clone, Copy)]
pub enum CameraProjection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

/// Uniform block layout shared with the shaders. The scene stage appends the
/// previous frame's block right after the current one for temporal use.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CameraUniform {
    pub view_proj: [[f32; 4]; 4],
    pub view_inv: [[f32; 4]; 4],
    pub proj_inv: [[f32; 4]; 4],
    pub origin: [f32; 4],
    pub clip_info: [f32; 4],
    pub projection_info: [f32; 4],
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self {
            view_proj: Matrix4::identity().into(),
            view_inv: Matrix4::identity().into(),
            proj_inv: Matrix4::identity().into(),
            origin: [0.0; 4],
            clip_info: [0.0; 4],
            projection_info: [0.0; 4],
        }
    }
}

#[derive(Clone, Copy)]
pub struct Camera {
    /// World from local.
    pub transform: Matrix4<f32>,
    pub projection: CameraProjection,
}

impl Camera {
    pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            transform: Matrix4::identity(),
            projection: CameraProjection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Self {
        Self {
            transform: Matrix4::identity(),
            projection: CameraProjection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            },
        }
    }

    pub fn position(&self) -> Vector3<f32> {
        Vector3::new(
            self.transform[(0, 3)],
            self.transform[(1, 3)],
            self.transform[(2, 3)],
        )
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        self.transform
            .try_inverse()
            .unwrap_or_else(Matrix4::identity)
    }

    pub fn projection_matrix(&self) -> Matrix4<f32> {
        let mut proj = match self.projection {
            CameraProjection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Matrix4::new_perspective(aspect, fov_y.to_radians(), near, far),
            CameraProjection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Matrix4::new_orthographic(left, right, bottom, top, near, far),
        };
        // Vulkan clip space is y-down.
        proj[(1, 1)] = -proj[(1, 1)];
        proj
    }

    pub fn view_projection(&self) -> Matrix4<f32> {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn near(&self) -> f32 {
        match self.projection {
            CameraProjection::Perspective { near, .. } => near,
            CameraProjection::Orthographic { near, .. } => near,
        }
    }

    pub fn far(&self) -> f32 {
        match self.projection {
            CameraProjection::Perspective { far, .. } => far,
            CameraProjection::Orthographic { far, .. } => far,
        }
    }

    /// Coefficients for linearizing the hyperbolic depth value.
    pub fn clip_info(&self) -> Vector4<f32> {
        let near = self.near();
        let far = self.far();
        Vector4::new(near * far, near - far, far, near)
    }

    /// Scale of the view frustum at unit distance, used to reconstruct view
    /// rays and to scale PCF kernels.
    pub fn projection_info(&self) -> Vector4<f32> {
        match self.projection {
            CameraProjection::Perspective { fov_y, aspect, .. } => {
                let tan_half = (fov_y.to_radians() * 0.5).tan();
                Vector4::new(tan_half * aspect, tan_half, 0.0, 0.0)
            }
            CameraProjection::Orthographic {
                left,
                right,
                bottom,
                top,
                ..
            } => Vector4::new(right - left, top - bottom, 1.0, 0.0),
        }
    }

    pub fn uniform(&self) -> CameraUniform {
        let origin = self.position();
        CameraUniform {
            view_proj: self.view_projection().into(),
            view_inv: self.transform.into(),
            proj_inv: self
                .projection_matrix()
                .try_inverse()
                .unwrap_or_else(Matrix4::identity)
                .into(),
            origin: [origin.x, origin.y, origin.z, 1.0],
            clip_info: self.clip_info().into(),
            projection_info: self.projection_info().into(),
        }
    }
}

/// One renderable object binding a mesh to a material and a transform.
/// Skinned objects additionally carry the joint palette driving their
/// animated mesh copy.
pub struct MeshObject {
    pub mesh: Arc<Mesh>,
    pub material: Material,
    pub transform: Matrix4<f32>,
    pub shadow_terminator_offset: f32,
    pub joint_matrices: Vec<Matrix4<f32>>,
}

impl MeshObject {
    pub fn new(mesh: Arc<Mesh>, material: Material) -> Self {
        Self {
            mesh,
            material,
            transform: Matrix4::identity(),
            shadow_terminator_offset: 0.0,
            joint_matrices: Vec::new(),
        }
    }
}

/// Flattened view of one object, refreshed at most once per frame.
#[derive(Clone)]
pub struct Instance {
    pub object_index: usize,
    pub mesh_id: u64,
    pub transform: Matrix4<f32>,
    pub prev_transform: Matrix4<f32>,
    pub normal_transform: Matrix4<f32>,
    pub shadow_terminator_mul: f32,
    pub last_refresh_frame: u64,
}

/// Whether an instance table entry needs to be rewritten this frame. Entries
/// untouched for a full pipeline depth can be skipped, except during the
/// forced-refresh window right after a scene change.
pub fn instance_needs_upload(last_refresh_frame: u64, frame_counter: u64, force: bool) -> bool {
    force || last_refresh_frame + (MAX_FRAMES_IN_FLIGHT as u64) >= frame_counter
}

#[derive(Default)]
pub struct InstanceCache {
    instances: Vec<Instance>,
    refreshed_frame: Option<u64>,
}

impl InstanceCache {
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Rebuilds the flattened instance list. Runs at most once per frame
    /// unless forced. Returns true when the instance topology (count or mesh
    /// identity) changed, which invalidates acceleration structures.
    pub fn refresh(&mut self, scene: &Scene, frame_counter: u64, force: bool) -> bool {
        if !force && self.refreshed_frame == Some(frame_counter) {
            return false;
        }
        self.refreshed_frame = Some(frame_counter);

        let mut topology_changed = self.instances.len() != scene.objects.len();
        for (i, object) in scene.objects.iter().enumerate() {
            let shadow_terminator_mul =
                1.0 / (1.0 - 0.5 * object.shadow_terminator_offset.clamp(0.0, 0.99));
            let normal_transform = normal_matrix(&object.transform);

            if i < self.instances.len() {
                let instance = &mut self.instances[i];
                if instance.mesh_id != object.mesh.id() {
                    instance.mesh_id = object.mesh.id();
                    topology_changed = true;
                }
                if force || instance.transform != object.transform {
                    instance.prev_transform = instance.transform;
                    instance.transform = object.transform;
                    instance.normal_transform = normal_transform;
                    instance.shadow_terminator_mul = shadow_terminator_mul;
                    instance.last_refresh_frame = frame_counter;
                }
                instance.object_index = i;
            } else {
                self.instances.push(Instance {
                    object_index: i,
                    mesh_id: object.mesh.id(),
                    transform: object.transform,
                    prev_transform: object.transform,
                    normal_transform,
                    shadow_terminator_mul,
                    last_refresh_frame: frame_counter,
                });
            }
        }
        self.instances.truncate(scene.objects.len());
        topology_changed
    }
}

fn normal_matrix(transform: &Matrix4<f32>) -> Matrix4<f32> {
    let linear: Matrix3<f32> = transform.fixed_view::<3, 3>(0, 0).clone_owned();
    let normal = linear
        .try_inverse()
        .unwrap_or_else(Matrix3::identity)
        .transpose();
    normal.to_homogeneous()
}

/// Scene description consumed by the renderer stages. External loaders
/// produce this; the renderer only reads it and tracks revisions.
#[derive(Default)]
pub struct Scene {
    objects: Vec<MeshObject>,
    point_lights: Vec<PointLight>,
    spotlights: Vec<Spotlight>,
    directional_lights: Vec<DirectionalLight>,
    cameras: Vec<Camera>,
    environment: Option<EnvironmentMap>,
    ambient: Vector3<f32>,

    envmap_counter: u32,
    geometry_counter: u32,
    light_counter: u32,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> &[MeshObject] {
        &self.objects
    }

    pub fn add_object(&mut self, object: MeshObject) -> usize {
        self.objects.push(object);
        self.geometry_counter += 1;
        if self.objects.last().unwrap().material.is_emissive() {
            self.light_counter += 1;
        }
        self.objects.len() - 1
    }

    /// Mutable object access; conservatively counts as a geometry change.
    pub fn object_mut(&mut self, index: usize) -> &mut MeshObject {
        self.geometry_counter += 1;
        &mut self.objects[index]
    }

    pub fn set_transform(&mut self, index: usize, transform: Matrix4<f32>) {
        self.objects[index].transform = transform;
    }

    pub fn point_lights(&self) -> &[PointLight] {
        &self.point_lights
    }

    pub fn spotlights(&self) -> &[Spotlight] {
        &self.spotlights
    }

    pub fn directional_lights(&self) -> &[DirectionalLight] {
        &self.directional_lights
    }

    pub fn add_point_light(&mut self, light: PointLight) {
        self.point_lights.push(light);
        self.light_counter += 1;
    }

    pub fn add_spotlight(&mut self, light: Spotlight) {
        self.spotlights.push(light);
        self.light_counter += 1;
    }

    pub fn add_directional_light(&mut self, light: DirectionalLight) {
        self.directional_lights.push(light);
        self.light_counter += 1;
    }

    pub fn clear_lights(&mut self) {
        self.point_lights.clear();
        self.spotlights.clear();
        self.directional_lights.clear();
        self.light_counter += 1;
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.push(camera);
    }

    pub fn set_camera(&mut self, index: usize, camera: Camera) {
        self.cameras[index] = camera;
    }

    pub fn environment(&self) -> Option<&EnvironmentMap> {
        self.environment.as_ref()
    }

    pub fn set_environment(&mut self, environment: Option<EnvironmentMap>) {
        self.environment = environment;
        self.envmap_counter += 1;
    }

    pub fn ambient(&self) -> Vector3<f32> {
        self.ambient
    }

    pub fn set_ambient(&mut self, ambient: Vector3<f32>) {
        self.ambient = ambient;
        self.light_counter += 1;
    }

    pub fn point_light_count(&self) -> usize {
        self.point_lights.len() + self.spotlights.len()
    }

    /// Packed (ENVMAP, GEOMETRY, LIGHT) revision counters.
    pub fn revision_counters(&self) -> (u32, u32, u32) {
        (
            self.envmap_counter,
            self.geometry_counter,
            self.light_counter,
        )
    }

    /// Checks whether any of the given categories changed since
    /// `prev_counter`, updating it to the current combined value.
    pub fn check_update(&self, categories: u32, prev_counter: &mut u32) -> bool {
        let mut combined = 0u32;
        if categories & UPDATE_ENVMAP != 0 {
            combined = combined.wrapping_add(self.envmap_counter);
        }
        if categories & UPDATE_GEOMETRY != 0 {
            combined = combined.wrapping_add(self.geometry_counter);
        }
        if categories & UPDATE_LIGHT != 0 {
            combined = combined.wrapping_add(self.light_counter);
        }
        let changed = *prev_counter != combined;
        *prev_counter = combined;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn instance_upload_skip_rule() {
        // Entries older than the pipeline depth can be skipped.
        assert!(instance_needs_upload(10, 10, false));
        assert!(instance_needs_upload(10, 12, false));
        assert!(!instance_needs_upload(10, 13, false));
        // The force window overrides the skip.
        assert!(instance_needs_upload(0, 100, true));
    }

    #[test]
    fn revision_counters_track_categories() {
        let mut scene = Scene::new();
        let mut geometry_rev = 0;
        let mut light_rev = 0;
        // First check initializes the observed value.
        scene.check_update(UPDATE_GEOMETRY, &mut geometry_rev);
        scene.check_update(UPDATE_LIGHT, &mut light_rev);

        scene.add_point_light(PointLight {
            color: Vector3::new(1.0, 1.0, 1.0),
            position: Vector3::zeros(),
            radius: 0.1,
            cutoff_radius: 10.0,
            shadow_map: None,
        });
        assert!(scene.check_update(UPDATE_LIGHT, &mut light_rev));
        assert!(!scene.check_update(UPDATE_LIGHT, &mut light_rev));
        assert!(!scene.check_update(UPDATE_GEOMETRY, &mut geometry_rev));
    }

    #[test]
    fn camera_projection_is_invertible() {
        let camera = Camera::perspective(60.0, 16.0 / 9.0, 0.1, 100.0);
        let proj = camera.projection_matrix();
        let inv = proj.try_inverse().unwrap();
        let id = proj * inv;
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((id[(i, j)] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn camera_clip_info_carries_planes() {
        let camera = Camera::perspective(60.0, 1.0, 0.5, 64.0);
        let clip = camera.clip_info();
        assert_eq!(clip.w, 0.5);
        assert_eq!(clip.z, 64.0);
    }

    #[test]
    fn moved_instance_keeps_previous_transform() {
        use crate::mesh::Mesh;

        let mesh = Arc::new(Mesh::new_cpu(Vec::new(), Vec::new(), Vec::new()));
        let mut scene = Scene::new();
        let index = scene.add_object(MeshObject::new(mesh, Material::new("test")));

        let mut cache = InstanceCache::default();
        cache.refresh(&scene, 0, true);
        let first = Matrix4::identity();
        assert_eq!(cache.instances()[0].transform, first);

        let moved = Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        scene.set_transform(index, moved);
        cache.refresh(&scene, 1, false);

        let instance = &cache.instances()[0];
        assert_eq!(instance.transform, moved);
        assert_eq!(instance.prev_transform, first);
        assert_eq!(instance.last_refresh_frame, 1);
    }

    #[test]
    fn instance_cache_refreshes_at_most_once_per_frame() {
        use crate::mesh::Mesh;

        let mesh = Arc::new(Mesh::new_cpu(Vec::new(), Vec::new(), Vec::new()));
        let mut scene = Scene::new();
        let index = scene.add_object(MeshObject::new(mesh, Material::new("test")));

        let mut cache = InstanceCache::default();
        cache.refresh(&scene, 5, false);
        let moved = Matrix4::new_translation(&Vector3::new(1.0, 0.0, 0.0));
        scene.set_transform(index, moved);

        // Same frame: no refresh without force.
        cache.refresh(&scene, 5, false);
        assert_eq!(cache.instances()[0].transform, Matrix4::identity());

        cache.refresh(&scene, 6, false);
        assert_eq!(cache.instances()[0].transform, moved);
    }

    #[test]
    fn topology_change_is_detected() {
        use crate::mesh::Mesh;

        let mesh_a = Arc::new(Mesh::new_cpu(Vec::new(), Vec::new(), Vec::new()));
        let mesh_b = Arc::new(Mesh::new_cpu(Vec::new(), Vec::new(), Vec::new()));
        let mut scene = Scene::new();
        scene.add_object(MeshObject::new(mesh_a, Material::new("a")));

        let mut cache = InstanceCache::default();
        assert!(cache.refresh(&scene, 0, true));
        assert!(!cache.refresh(&scene, 1, false));

        scene.add_object(MeshObject::new(mesh_b, Material::new("b")));
        assert!(cache.refresh(&scene, 2, false));
    }
}
