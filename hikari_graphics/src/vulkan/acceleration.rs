use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use nalgebra::Matrix4;

use super::{
    context::Context,
    device::{Device, DeviceId, DeviceMask, PendingDestruction},
    resource::{Buffer, BufferDescriptor},
    staged::StagedBuffer,
};

/// Geometry of one BLAS entry, with buffer addresses resolved for the device
/// whose command buffer is being recorded.
pub enum BlasGeometry {
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_stride: u64,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        triangle_count: u32,
    },
    Aabbs {
        address: vk::DeviceAddress,
        count: u32,
    },
}

pub struct BlasBuildEntry {
    pub geometry: BlasGeometry,
    pub opaque: bool,
}

struct BlasReplica {
    device: Arc<Device>,
    blas: Option<vk::AccelerationStructureKHR>,
    blas_buffer: Option<Buffer>,
    scratch_buffer: Option<Buffer>,
    blas_address: vk::DeviceAddress,
}

/// Bottom-level acceleration structure over one or more triangle meshes or
/// AABB sets. `dynamic` structures prefer fast builds and allow updates;
/// static ones may be compacted after the initial build.
pub struct BottomLevelAccelerationStructure {
    replicas: Vec<(DeviceId, BlasReplica)>,
    transform_buffer: StagedBuffer,
    geometry_count: usize,
    updates_since_rebuild: usize,
    dynamic: bool,
    compact: bool,
    backface_culled: bool,
}

impl BottomLevelAccelerationStructure {
    pub fn new(
        ctx: &Context,
        mask: DeviceMask,
        geometry_count: usize,
        transforms: &[Matrix4<f32>],
        backface_culled: bool,
        dynamic: bool,
        compact: bool,
    ) -> Result<Self> {
        assert_eq!(geometry_count, transforms.len());
        let transform_buffer = StagedBuffer::new(
            ctx,
            mask,
            (std::mem::size_of::<vk::TransformMatrixKHR>() * geometry_count.max(1)) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;

        let replicas = mask
            .iter()
            .map(|id| {
                (
                    id,
                    BlasReplica {
                        device: ctx.device(id).clone(),
                        blas: None,
                        blas_buffer: None,
                        scratch_buffer: None,
                        blas_address: 0,
                    },
                )
            })
            .collect();

        let mut blas = Self {
            replicas,
            transform_buffer,
            geometry_count,
            updates_since_rebuild: 0,
            dynamic,
            // Compaction only applies to structures that are never updated.
            compact: !dynamic && compact,
            backface_culled,
        };
        for frame_index in 0..super::device::MAX_FRAMES_IN_FLIGHT {
            blas.update_transforms(frame_index as u32, transforms);
        }
        Ok(blas)
    }

    pub fn geometry_count(&self) -> usize {
        self.geometry_count
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_backface_culled(&self) -> bool {
        self.backface_culled
    }

    pub fn updates_since_rebuild(&self) -> usize {
        self.updates_since_rebuild
    }

    pub fn handle(&self, id: DeviceId) -> vk::AccelerationStructureKHR {
        self.replica(id).blas.unwrap_or_default()
    }

    pub fn address(&self, id: DeviceId) -> vk::DeviceAddress {
        self.replica(id).blas_address
    }

    fn replica(&self, id: DeviceId) -> &BlasReplica {
        &self
            .replicas
            .iter()
            .find(|(i, _)| *i == id)
            .expect("BLAS not replicated on device")
            .1
    }

    fn replica_mut(&mut self, id: DeviceId) -> &mut BlasReplica {
        &mut self
            .replicas
            .iter_mut()
            .find(|(i, _)| *i == id)
            .expect("BLAS not replicated on device")
            .1
    }

    pub fn update_transforms(&mut self, frame_index: u32, transforms: &[Matrix4<f32>]) {
        let entries: Vec<vk::TransformMatrixKHR> = transforms
            .iter()
            .map(|transform| {
                // Vulkan wants a row-major 3x4 matrix.
                let t = transform.transpose();
                let mut matrix = [0.0f32; 12];
                matrix.copy_from_slice(&t.as_slice()[0..12]);
                vk::TransformMatrixKHR { matrix }
            })
            .collect();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                entries.as_ptr() as *const u8,
                std::mem::size_of_val(entries.as_slice()),
            )
        };
        self.transform_buffer.update(frame_index, bytes, 0);
    }

    /// Records a build or update into `cb`. `update` is only valid when the
    /// geometry id set is unchanged since the last full rebuild.
    pub fn rebuild(
        &mut self,
        id: DeviceId,
        frame_index: u32,
        cb: vk::CommandBuffer,
        entries: &[BlasBuildEntry],
        update: bool,
    ) -> Result<()> {
        assert_eq!(entries.len(), self.geometry_count);
        if update {
            self.updates_since_rebuild += 1;
        } else {
            self.updates_since_rebuild = 0;
        }
        let dynamic = self.dynamic;
        let compact = self.compact;
        let transform_address = self.transform_buffer.device_address(id);
        let device = self.replica(id).device.clone();
        let as_fns = device
            .acceleration_fns
            .clone()
            .with_context(|| "Acceleration structures are not supported on this device")?;
        let scratch_alignment = device
            .as_properties
            .map(|p| p.min_scratch_alignment as u64)
            .unwrap_or(256);

        let mut geometries = Vec::with_capacity(entries.len());
        let mut ranges = Vec::with_capacity(entries.len());
        let mut primitive_counts = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let mut geometry = match &entry.geometry {
                BlasGeometry::Triangles {
                    vertex_address,
                    vertex_stride,
                    vertex_count,
                    index_address,
                    triangle_count,
                } => {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: *vertex_address,
                        })
                        .vertex_stride(*vertex_stride)
                        .max_vertex(vertex_count.saturating_sub(1))
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: *index_address,
                        })
                        .transform_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: transform_address
                                + (std::mem::size_of::<vk::TransformMatrixKHR>() * i) as u64,
                        });
                    ranges.push(
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(*triangle_count),
                    );
                    primitive_counts.push(*triangle_count);
                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                }
                BlasGeometry::Aabbs { address, count } => {
                    let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: *address,
                        })
                        .stride(std::mem::size_of::<vk::AabbPositionsKHR>() as u64);
                    ranges.push(
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(*count),
                    );
                    primitive_counts.push(*count);
                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::AABBS)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                }
            };
            geometry = geometry.flags(if entry.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION
            });
            geometries.push(geometry);
        }

        let build_flags = if dynamic {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        } else if compact {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        };

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags)
            .mode(if update {
                vk::BuildAccelerationStructureModeKHR::UPDATE
            } else {
                vk::BuildAccelerationStructureModeKHR::BUILD
            })
            .geometries(&geometries);

        if self.replica(id).blas.is_none() {
            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                as_fns.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &primitive_counts,
                    &mut size_info,
                )
            };

            let scratch_buffer = Buffer::new(
                device.clone(),
                BufferDescriptor::new(
                    size_info.build_scratch_size,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::GpuOnly,
                )
                .alignment(scratch_alignment),
            )?;
            let blas_buffer = Buffer::new(
                device.clone(),
                BufferDescriptor::new(
                    size_info.acceleration_structure_size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::GpuOnly,
                ),
            )?;

            let create_info = vk::AccelerationStructureCreateInfoKHR::default()
                .buffer(blas_buffer.raw())
                .size(size_info.acceleration_structure_size)
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
            let blas = unsafe { as_fns.create_acceleration_structure(&create_info, None)? };

            let replica = self.replica_mut(id);
            replica.scratch_buffer = Some(scratch_buffer);
            replica.blas_buffer = Some(blas_buffer);
            replica.blas = Some(blas);
        }

        {
            let replica = self.replica(id);
            build_info.src_acceleration_structure = if update {
                replica.blas.unwrap()
            } else {
                vk::AccelerationStructureKHR::null()
            };
            build_info.dst_acceleration_structure = replica.blas.unwrap();
            build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: replica.scratch_buffer.as_ref().unwrap().device_address(),
            };
        }

        if compact && !update {
            self.build_compacted(id, frame_index, cb, &as_fns, build_info, &ranges)?;
        } else {
            self.transform_buffer.upload(id, frame_index, cb);
            unsafe {
                as_fns.cmd_build_acceleration_structures(cb, &[build_info], &[&ranges]);
            }
        }

        let replica = self.replica_mut(id);
        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(replica.blas.unwrap());
        replica.blas_address =
            unsafe { as_fns.get_acceleration_structure_device_address(&address_info) };
        Ok(())
    }

    /// Builds into a throwaway structure, reads the compacted size back and
    /// records a compacting copy into the caller's command buffer. The
    /// throwaway is released at frame end.
    fn build_compacted(
        &mut self,
        id: DeviceId,
        frame_index: u32,
        cb: vk::CommandBuffer,
        as_fns: &ash::khr::acceleration_structure::Device,
        build_info: vk::AccelerationStructureBuildGeometryInfoKHR,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) -> Result<()> {
        let device = self.replica(id).device.clone();
        let fat_blas = self.replica(id).blas.unwrap();

        let query_pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);
        let query_pool = unsafe { device.raw.create_query_pool(&query_pool_info, None)? };

        device.one_time_submit(|setup_cb| {
            self.transform_buffer.upload(id, frame_index, setup_cb);
            unsafe {
                device.raw.cmd_reset_query_pool(setup_cb, query_pool, 0, 1);
                as_fns.cmd_build_acceleration_structures(setup_cb, &[build_info], &[ranges]);
            }
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);
            unsafe {
                device.raw.cmd_pipeline_barrier(
                    setup_cb,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                as_fns.cmd_write_acceleration_structures_properties(
                    setup_cb,
                    &[fat_blas],
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool,
                    0,
                );
            }
            Ok(())
        })?;

        // Some drivers only write the low 32 bits of the result despite the
        // spec declaring a 64-bit size, so the destination must be
        // zero-initialized before reading.
        let mut compact_size = [0u64; 1];
        unsafe {
            device.raw.get_query_pool_results(
                query_pool,
                0,
                &mut compact_size,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        device.schedule_destruction(PendingDestruction::QueryPool(query_pool));

        let compact_buffer = Buffer::new(
            device.clone(),
            BufferDescriptor::new(
                compact_size[0],
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            ),
        )?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(compact_buffer.raw())
            .size(compact_size[0])
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        let compact_blas = unsafe { as_fns.create_acceleration_structure(&create_info, None)? };

        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(fat_blas)
            .dst(compact_blas)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe {
            as_fns.cmd_copy_acceleration_structure(cb, &copy_info);
        }

        let replica = self.replica_mut(id);
        device.schedule_destruction(PendingDestruction::AccelerationStructure(fat_blas));
        // The fat buffer is released through the normal deferred drop.
        let _fat_buffer = replica.blas_buffer.take();
        replica.blas = Some(compact_blas);
        replica.blas_buffer = Some(compact_buffer);
        Ok(())
    }
}

impl Drop for BottomLevelAccelerationStructure {
    fn drop(&mut self) {
        for (_, replica) in &mut self.replicas {
            if let Some(blas) = replica.blas.take() {
                replica
                    .device
                    .schedule_destruction(PendingDestruction::AccelerationStructure(blas));
            }
        }
    }
}

struct TlasReplica {
    device: Arc<Device>,
    tlas: vk::AccelerationStructureKHR,
    _tlas_buffer: Buffer,
    scratch_buffer: Buffer,
    tlas_address: vk::DeviceAddress,
}

/// Top-level acceleration structure with a fixed instance capacity, rebuilt
/// or updated every frame against the instance buffer.
pub struct TopLevelAccelerationStructure {
    replicas: Vec<(DeviceId, TlasReplica)>,
    instance_buffer: StagedBuffer,
    capacity: usize,
    built: bool,
}

impl TopLevelAccelerationStructure {
    pub fn new(ctx: &Context, mask: DeviceMask, capacity: usize) -> Result<Self> {
        let instance_buffer = StagedBuffer::new(
            ctx,
            mask,
            (capacity * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;

        let mut replicas = Vec::new();
        for id in mask.iter() {
            let device = ctx.device(id).clone();
            let as_fns = device
                .acceleration_fns
                .clone()
                .with_context(|| "Acceleration structures are not supported on this device")?;
            let scratch_alignment = device
                .as_properties
                .map(|p| p.min_scratch_alignment as u64)
                .unwrap_or(256);

            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: instance_buffer.device_address(id),
                        }),
                });
            let geometries = [geometry];
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(
                    vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                        | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
                )
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(&geometries);

            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                as_fns.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[capacity as u32],
                    &mut size_info,
                )
            };

            let tlas_buffer = Buffer::new(
                device.clone(),
                BufferDescriptor::new(
                    size_info.acceleration_structure_size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::GpuOnly,
                ),
            )?;
            let scratch_buffer = Buffer::new(
                device.clone(),
                BufferDescriptor::new(
                    size_info.build_scratch_size.max(size_info.update_scratch_size),
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::GpuOnly,
                )
                .alignment(scratch_alignment),
            )?;

            let create_info = vk::AccelerationStructureCreateInfoKHR::default()
                .buffer(tlas_buffer.raw())
                .size(size_info.acceleration_structure_size)
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
            let tlas = unsafe { as_fns.create_acceleration_structure(&create_info, None)? };
            let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
                .acceleration_structure(tlas);
            let tlas_address =
                unsafe { as_fns.get_acceleration_structure_device_address(&address_info) };

            replicas.push((
                id,
                TlasReplica {
                    device,
                    tlas,
                    _tlas_buffer: tlas_buffer,
                    scratch_buffer,
                    tlas_address,
                },
            ));
        }

        Ok(Self {
            replicas,
            instance_buffer,
            capacity,
            built: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn instance_buffer(&self) -> &StagedBuffer {
        &self.instance_buffer
    }

    pub fn instance_buffer_mut(&mut self) -> &mut StagedBuffer {
        &mut self.instance_buffer
    }

    pub fn handle(&self, id: DeviceId) -> vk::AccelerationStructureKHR {
        self.replica(id).tlas
    }

    pub fn address(&self, id: DeviceId) -> vk::DeviceAddress {
        self.replica(id).tlas_address
    }

    fn replica(&self, id: DeviceId) -> &TlasReplica {
        &self
            .replicas
            .iter()
            .find(|(i, _)| *i == id)
            .expect("TLAS not replicated on device")
            .1
    }

    /// Records the TLAS build for the current live instance count. Updates
    /// are preferred over rebuilds after the first build.
    pub fn rebuild(
        &mut self,
        id: DeviceId,
        cb: vk::CommandBuffer,
        instance_count: usize,
        allow_update: bool,
    ) -> Result<()> {
        if instance_count > self.capacity {
            anyhow::bail!(
                "TLAS instance count {instance_count} exceeds capacity {}",
                self.capacity
            );
        }
        let replica = self.replica(id);
        let device = &replica.device;
        let as_fns = device
            .acceleration_fns
            .as_ref()
            .with_context(|| "Acceleration structures are not supported on this device")?;

        // All BLAS builds recorded into this command buffer must land before
        // the TLAS reads them.
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
        unsafe {
            device.raw.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        let update = allow_update && self.built;
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.instance_buffer.device_address(id),
                    }),
            });
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            )
            .mode(if update {
                vk::BuildAccelerationStructureModeKHR::UPDATE
            } else {
                vk::BuildAccelerationStructureModeKHR::BUILD
            })
            .src_acceleration_structure(if update {
                replica.tlas
            } else {
                vk::AccelerationStructureKHR::null()
            })
            .dst_acceleration_structure(replica.tlas)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: replica.scratch_buffer.device_address(),
            })
            .geometries(&geometries);

        let range =
            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instance_count as u32);
        unsafe {
            as_fns.cmd_build_acceleration_structures(cb, &[build_info], &[&[range]]);
        }
        self.built = true;
        Ok(())
    }
}

impl Drop for TopLevelAccelerationStructure {
    fn drop(&mut self) {
        for (_, replica) in &mut self.replicas {
            replica
                .device
                .schedule_destruction(PendingDestruction::AccelerationStructure(replica.tlas));
        }
    }
}
