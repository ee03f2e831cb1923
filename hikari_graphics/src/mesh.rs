use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use nalgebra::{Vector2, Vector3, Vector4};

use crate::vulkan::{
    context::Context,
    device::{DeviceId, DeviceMask},
    resource::{Buffer, BufferDescriptor},
};

/// All meshes share the same vertex layout to avoid shader permutations.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 4],
}

/// Four joint indices and weights per vertex.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SkinData {
    pub joints: [u32; 4],
    pub weights: [f32; 4],
}

static MESH_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

struct MeshBuffers {
    device_id: DeviceId,
    vertex_buffer: Buffer,
    index_buffer: Option<Buffer>,
    skin_buffer: Option<Buffer>,
    /// Only allocated for animated meshes; holds last frame's positions when
    /// skinning starts.
    prev_pos_buffer: Option<Buffer>,
}

/// Triangle mesh with one GPU buffer set per device.
///
/// Mesh identity is tracked with ids rather than addresses: ids are
/// reassigned whenever `refresh_buffers` is called, and the triangle count
/// cannot change without the id changing, so acceleration structures with
/// the same id are always update-compatible.
pub struct Mesh {
    id: u64,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    skin: Vec<SkinData>,
    animation_source: Option<Arc<Mesh>>,
    buffers: Vec<MeshBuffers>,
}

impl Mesh {
    pub fn new(
        ctx: &Context,
        mask: DeviceMask,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        skin: Vec<SkinData>,
    ) -> Result<Self> {
        let mut mesh = Self {
            id: MESH_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            vertices,
            indices,
            skin,
            animation_source: None,
            buffers: Vec::new(),
        };
        mesh.init_buffers(ctx, mask)?;
        Ok(mesh)
    }

    /// Builds an animation copy. It shares the source's indices and skin on
    /// the GPU side but gets its own vertex buffer (written by the skinning
    /// pass) plus a previous-position buffer.
    pub fn new_animated(ctx: &Context, mask: DeviceMask, source: Arc<Mesh>) -> Result<Self> {
        let vertex_bytes = (source.vertices.len() * std::mem::size_of::<Vertex>()) as u64;
        let prev_pos_bytes = (source.vertices.len() * std::mem::size_of::<[f32; 4]>()) as u64;

        let mut buffers = Vec::new();
        for id in mask.iter() {
            let device = ctx.device(id).clone();
            let vertex_buffer = Buffer::new(
                device.clone(),
                BufferDescriptor::new(vertex_bytes, vertex_buffer_usage(), MemoryLocation::GpuOnly),
            )?;
            let prev_pos_buffer = Buffer::new(
                device,
                BufferDescriptor::new(
                    prev_pos_bytes,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::GpuOnly,
                ),
            )?;
            buffers.push(MeshBuffers {
                device_id: id,
                vertex_buffer,
                index_buffer: None,
                skin_buffer: None,
                prev_pos_buffer: Some(prev_pos_buffer),
            });
        }

        Ok(Self {
            id: MESH_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            vertices: Vec::new(),
            indices: Vec::new(),
            skin: Vec::new(),
            animation_source: Some(source),
            buffers,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// CPU-only mesh without GPU buffers, for host-side tooling and tests.
    pub fn new_cpu(vertices: Vec<Vertex>, indices: Vec<u32>, skin: Vec<SkinData>) -> Self {
        Self {
            id: MESH_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            vertices,
            indices,
            skin,
            animation_source: None,
            buffers: Vec::new(),
        }
    }

    pub fn vertices(&self) -> &[Vertex] {
        match &self.animation_source {
            Some(source) => &source.vertices,
            None => &self.vertices,
        }
    }

    pub fn vertices_mut(&mut self) -> &mut Vec<Vertex> {
        &mut self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        match &self.animation_source {
            Some(source) => &source.indices,
            None => &self.indices,
        }
    }

    pub fn indices_mut(&mut self) -> &mut Vec<u32> {
        &mut self.indices
    }

    pub fn skin(&self) -> &[SkinData] {
        match &self.animation_source {
            Some(source) => &source.skin,
            None => &self.skin,
        }
    }

    pub fn is_skinned(&self) -> bool {
        !self.skin().is_empty()
    }

    pub fn animation_source(&self) -> Option<&Arc<Mesh>> {
        self.animation_source.as_ref()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices().len() / 3
    }

    pub fn vertex_buffer(&self, id: DeviceId) -> vk::Buffer {
        self.buffer(id).vertex_buffer.raw()
    }

    pub fn vertex_buffer_address(&self, id: DeviceId) -> vk::DeviceAddress {
        self.buffer(id).vertex_buffer.device_address()
    }

    pub fn index_buffer(&self, id: DeviceId) -> vk::Buffer {
        match (&self.animation_source, &self.buffer(id).index_buffer) {
            (_, Some(buffer)) => buffer.raw(),
            (Some(source), None) => source.index_buffer(id),
            (None, None) => vk::Buffer::null(),
        }
    }

    pub fn index_buffer_address(&self, id: DeviceId) -> vk::DeviceAddress {
        match (&self.animation_source, &self.buffer(id).index_buffer) {
            (_, Some(buffer)) => buffer.device_address(),
            (Some(source), None) => source.index_buffer_address(id),
            (None, None) => 0,
        }
    }

    pub fn skin_buffer(&self, id: DeviceId) -> Option<vk::Buffer> {
        match (&self.animation_source, &self.buffer(id).skin_buffer) {
            (_, Some(buffer)) => Some(buffer.raw()),
            (Some(source), None) => source.skin_buffer(id),
            (None, None) => None,
        }
    }

    pub fn prev_pos_buffer(&self, id: DeviceId) -> Option<vk::Buffer> {
        self.buffer(id).prev_pos_buffer.as_ref().map(|b| b.raw())
    }

    fn buffer(&self, id: DeviceId) -> &MeshBuffers {
        self.buffers
            .iter()
            .find(|b| b.device_id == id)
            .expect("mesh not replicated on device")
    }

    /// Reloads the GPU buffers after CPU-side vertex or index edits. The
    /// mesh id changes so acceleration structures know to rebuild.
    pub fn refresh_buffers(&mut self, ctx: &Context, mask: DeviceMask) -> Result<()> {
        assert!(
            self.animation_source.is_none(),
            "animation copies source their data from the original mesh"
        );
        self.id = MESH_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.init_buffers(ctx, mask)
    }

    fn init_buffers(&mut self, ctx: &Context, mask: DeviceMask) -> Result<()> {
        self.buffers.clear();
        for id in mask.iter() {
            let vertex_buffer = upload_buffer(
                ctx,
                id,
                &self.vertices,
                vertex_buffer_usage(),
            )?;
            let index_buffer = upload_buffer(
                ctx,
                id,
                &self.indices,
                vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            )?;
            let skin_buffer = if self.skin.is_empty() {
                None
            } else {
                Some(upload_buffer(
                    ctx,
                    id,
                    &self.skin,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?)
            };

            self.buffers.push(MeshBuffers {
                device_id: id,
                vertex_buffer,
                index_buffer: Some(index_buffer),
                skin_buffer,
                prev_pos_buffer: None,
            });
        }
        Ok(())
    }

    /// Calculates new normals for the existing vertices. Assumes positions
    /// and indices are filled out; previous normals are overwritten.
    pub fn calculate_normals(&mut self) {
        let mut accumulated = vec![Vector3::<f32>::zeros(); self.vertices.len()];
        for triangle in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [triangle[0] as usize, triangle[1] as usize, triangle[2] as usize];
            let p0 = Vector3::from(self.vertices[i0].pos);
            let p1 = Vector3::from(self.vertices[i1].pos);
            let p2 = Vector3::from(self.vertices[i2].pos);
            // Unnormalized cross product weights by triangle area.
            let face_normal = (p1 - p0).cross(&(p2 - p0));
            accumulated[i0] += face_normal;
            accumulated[i1] += face_normal;
            accumulated[i2] += face_normal;
        }
        for (vertex, normal) in self.vertices.iter_mut().zip(accumulated.iter()) {
            let normal = if normal.norm_squared() > 0.0 {
                normal.normalize()
            } else {
                Vector3::z()
            };
            vertex.normal = normal.into();
        }
    }

    /// Calculates new tangents for the existing vertices from the UV layout.
    /// Assumes positions, normals, uvs and indices are already filled out.
    pub fn calculate_tangents(&mut self) {
        let mut accumulated = vec![Vector3::<f32>::zeros(); self.vertices.len()];
        for triangle in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [triangle[0] as usize, triangle[1] as usize, triangle[2] as usize];
            let p0 = Vector3::from(self.vertices[i0].pos);
            let p1 = Vector3::from(self.vertices[i1].pos);
            let p2 = Vector3::from(self.vertices[i2].pos);
            let uv0 = Vector2::from(self.vertices[i0].uv);
            let uv1 = Vector2::from(self.vertices[i1].uv);
            let uv2 = Vector2::from(self.vertices[i2].uv);

            let edge1 = p1 - p0;
            let edge2 = p2 - p0;
            let duv1 = uv1 - uv0;
            let duv2 = uv2 - uv0;

            let det = duv1.x * duv2.y - duv2.x * duv1.y;
            if det.abs() < 1e-12 {
                continue;
            }
            let tangent = (edge1 * duv2.y - edge2 * duv1.y) / det;
            accumulated[i0] += tangent;
            accumulated[i1] += tangent;
            accumulated[i2] += tangent;
        }
        for (vertex, tangent) in self.vertices.iter_mut().zip(accumulated.iter()) {
            let normal = Vector3::from(vertex.normal);
            // Gram-Schmidt against the normal.
            let mut tangent = tangent - normal * normal.dot(tangent);
            if tangent.norm_squared() < 1e-12 {
                tangent = orthogonal(normal);
            } else {
                tangent.normalize_mut();
            }
            vertex.tangent = Vector4::new(tangent.x, tangent.y, tangent.z, 1.0).into();
        }
    }

    pub fn vertex_input_bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    pub fn vertex_input_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(24),
            vk::VertexInputAttributeDescription::default()
                .location(3)
                .binding(0)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(32),
        ]
    }
}

fn vertex_buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
}

fn orthogonal(v: Vector3<f32>) -> Vector3<f32> {
    let other = if v.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    v.cross(&other).normalize()
}

fn upload_buffer<T: Copy>(
    ctx: &Context,
    id: DeviceId,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let device = ctx.device(id).clone();
    let bytes = (std::mem::size_of_val(data)).max(4) as u64;

    let buffer = Buffer::new(
        device.clone(),
        BufferDescriptor::new(
            bytes,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
    )?;
    if data.is_empty() {
        return Ok(buffer);
    }

    let staging = Buffer::new(
        device.clone(),
        BufferDescriptor::new(bytes, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu),
    )?;
    staging.write_data(data)?;

    device.one_time_submit(|cb| {
        let region = vk::BufferCopy::default().size(bytes);
        unsafe {
            device.raw.cmd_copy_buffer(cb, staging.raw(), buffer.raw(), &[region]);
        }
        Ok(())
    })?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_vertices() -> Vec<Vertex> {
        vec![
            Vertex {
                pos: [0.0, 0.0, 0.0],
                uv: [0.0, 0.0],
                ..Default::default()
            },
            Vertex {
                pos: [1.0, 0.0, 0.0],
                uv: [1.0, 0.0],
                ..Default::default()
            },
            Vertex {
                pos: [1.0, 1.0, 0.0],
                uv: [1.0, 1.0],
                ..Default::default()
            },
            Vertex {
                pos: [0.0, 1.0, 0.0],
                uv: [0.0, 1.0],
                ..Default::default()
            },
        ]
    }

    fn cpu_mesh(vertices: Vec<Vertex>, indices: Vec<u32>) -> Mesh {
        Mesh {
            id: 0,
            vertices,
            indices,
            skin: Vec::new(),
            animation_source: None,
            buffers: Vec::new(),
        }
    }

    #[test]
    fn calculate_normals_produces_unit_face_normals() {
        let mut mesh = cpu_mesh(quad_vertices(), vec![0, 1, 2, 0, 2, 3]);
        mesh.calculate_normals();
        for vertex in mesh.vertices() {
            let normal = Vector3::from(vertex.normal);
            assert!((normal.norm() - 1.0).abs() < 1e-6);
            assert!((normal - Vector3::z()).norm() < 1e-6);
        }
    }

    #[test]
    fn calculate_normals_is_idempotent() {
        let mut mesh = cpu_mesh(quad_vertices(), vec![0, 1, 2, 0, 2, 3]);
        mesh.calculate_normals();
        let first: Vec<[f32; 3]> = mesh.vertices().iter().map(|v| v.normal).collect();
        mesh.calculate_normals();
        let second: Vec<[f32; 3]> = mesh.vertices().iter().map(|v| v.normal).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn calculate_tangents_is_orthogonal_to_normals() {
        let mut mesh = cpu_mesh(quad_vertices(), vec![0, 1, 2, 0, 2, 3]);
        mesh.calculate_normals();
        mesh.calculate_tangents();
        for vertex in mesh.vertices() {
            let normal = Vector3::from(vertex.normal);
            let tangent = Vector4::from(vertex.tangent);
            let tangent3 = Vector3::new(tangent.x, tangent.y, tangent.z);
            assert!((tangent3.norm() - 1.0).abs() < 1e-5);
            assert!(normal.dot(&tangent3).abs() < 1e-5);
        }
    }

    #[test]
    fn degenerate_uvs_still_produce_valid_tangents() {
        let mut vertices = quad_vertices();
        for vertex in &mut vertices {
            vertex.uv = [0.5, 0.5];
        }
        let mut mesh = cpu_mesh(vertices, vec![0, 1, 2, 0, 2, 3]);
        mesh.calculate_normals();
        mesh.calculate_tangents();
        for vertex in mesh.vertices() {
            let tangent = Vector4::from(vertex.tangent);
            let tangent3 = Vector3::new(tangent.x, tangent.y, tangent.z);
            assert!((tangent3.norm() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn vertex_layout_matches_attribute_offsets() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        let attributes = Mesh::vertex_input_attributes();
        assert_eq!(attributes[1].offset as usize, std::mem::offset_of!(Vertex, normal));
        assert_eq!(attributes[2].offset as usize, std::mem::offset_of!(Vertex, uv));
        assert_eq!(attributes[3].offset as usize, std::mem::offset_of!(Vertex, tangent));
    }
}
