use std::{
    ffi::CString,
    mem::ManuallyDrop,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::{khr, vk};
use gpu_allocator::{
    vulkan::{Allocation, Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;

use super::{timer::TimingData, Instance, PhysicalDevice, QueueFamily};

pub type DeviceId = u32;

/// Bounds the amount of pipelined work; per-frame GPU resources are
/// replicated this many times.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Set of device ids encoded as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DeviceMask {
    bits: u64,
}

impl DeviceMask {
    pub fn none() -> Self {
        Self { bits: 0 }
    }

    pub fn single(id: DeviceId) -> Self {
        Self { bits: 1 << id }
    }

    pub fn all(device_count: usize) -> Self {
        assert!(device_count <= 64);
        Self {
            bits: if device_count == 64 {
                u64::MAX
            } else {
                (1u64 << device_count) - 1
            },
        }
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.bits & (1 << id) != 0
    }

    pub fn insert(&mut self, id: DeviceId) {
        self.bits |= 1 << id;
    }

    pub fn erase(&mut self, id: DeviceId) {
        self.bits &= !(1 << id);
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn union(&self, other: DeviceMask) -> DeviceMask {
        DeviceMask {
            bits: self.bits | other.bits,
        }
    }

    pub fn difference(&self, other: DeviceMask) -> DeviceMask {
        DeviceMask {
            bits: self.bits & !other.bits,
        }
    }

    pub fn intersection(&self, other: DeviceMask) -> DeviceMask {
        DeviceMask {
            bits: self.bits & other.bits,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceId> + '_ {
        let bits = self.bits;
        (0..64u32).filter(move |i| bits & (1 << i) != 0)
    }
}

/// Map from device id to a replica of `T`, for resources that exist once per
/// participating device. The container owns the replicas exclusively.
pub struct PerDevice<T> {
    mask: DeviceMask,
    entries: Vec<(DeviceId, T)>,
}

impl<T> PerDevice<T> {
    pub fn new<F>(mask: DeviceMask, mut init: F) -> Result<Self>
    where
        F: FnMut(DeviceId) -> Result<T>,
    {
        let mut entries = Vec::with_capacity(mask.len());
        for id in mask.iter() {
            entries.push((id, init(id)?));
        }
        Ok(Self { mask, entries })
    }

    pub fn mask(&self) -> DeviceMask {
        self.mask
    }

    pub fn get(&self, id: DeviceId) -> &T {
        &self
            .entries
            .iter()
            .find(|(i, _)| *i == id)
            .expect("device id not present in container")
            .1
    }

    pub fn get_mut(&mut self, id: DeviceId) -> &mut T {
        &mut self
            .entries
            .iter_mut()
            .find(|(i, _)| *i == id)
            .expect("device id not present in container")
            .1
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &T)> {
        self.entries.iter().map(|(id, t)| (*id, t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut T)> {
        self.entries.iter_mut().map(|(id, t)| (*id, t))
    }
}

#[derive(Clone, Copy)]
pub struct Queue {
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
}

pub(crate) struct SubmitSemaphore {
    pub(crate) semaphore: vk::Semaphore,
    /// Only meaningful for timeline semaphores.
    pub(crate) value: Option<u64>,
    pub(crate) stage_mask: vk::PipelineStageFlags,
}

/// Ray tracing pipeline properties needed for shader binding table layout.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureProperties {
    pub min_scratch_alignment: u32,
}

/// GPU object waiting for its last referencing frame to finish on device.
pub(crate) enum PendingDestruction {
    Buffer {
        raw: vk::Buffer,
        allocation: Option<Allocation>,
    },
    Image {
        raw: vk::Image,
        views: Vec<vk::ImageView>,
        allocation: Option<Allocation>,
    },
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    AccelerationStructure(vk::AccelerationStructureKHR),
    QueryPool(vk::QueryPool),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    CommandBuffer(vk::CommandPool, vk::CommandBuffer),
}

pub(crate) struct ResourceHub {
    pending: Vec<(u64, PendingDestruction)>,
}

/// One logical device replica. Owns the queues, command pool for transient
/// uploads, allocator, pipeline cache and the deferred-destruction queue.
/// Used through `Arc`; members are internally mutable as required.
pub struct Device {
    pub(crate) resource_hub: Mutex<ResourceHub>,
    pub(crate) timing: Mutex<TimingData>,

    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) pipeline_cache: vk::PipelineCache,
    upload_pool: Mutex<vk::CommandPool>,

    pub(crate) graphics_queue: Queue,
    pub(crate) compute_queue: Queue,
    pub(crate) present_queue: Queue,
    pub(crate) transfer_queue: Queue,

    pub(crate) push_descriptor_fns: khr::push_descriptor::Device,
    pub(crate) acceleration_fns: Option<khr::acceleration_structure::Device>,
    pub(crate) ray_tracing_fns: Option<khr::ray_tracing_pipeline::Device>,

    pub(crate) rt_properties: Option<RayTracingProperties>,
    pub(crate) as_properties: Option<AccelerationStructureProperties>,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) multiview_max_views: u32,

    /// Mirror of the context frame counter, used to tag deferred destroys.
    pub(crate) frame_counter: AtomicU64,

    pub(crate) physical: vk::PhysicalDevice,
    pub(crate) raw: ash::Device,
    pub(crate) id: DeviceId,
    pub(crate) name: String,
}

impl Device {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        id: DeviceId,
        enable_ray_tracing: bool,
        multi_device: bool,
        max_timestamps: u32,
    ) -> Result<Arc<Self>> {
        let queue_families = select_queue_families(physical_device)?;
        let raw = create_logical_device(
            instance,
            physical_device,
            &queue_families,
            enable_ray_tracing,
            multi_device,
        )?;

        log::info!("Using physical device: {}", physical_device.name);

        let get_queue = |family: &QueueFamily| Queue {
            raw: unsafe { raw.get_device_queue(family.index, 0) },
            family_index: family.index,
        };
        let graphics_queue = get_queue(&queue_families.graphics);
        let present_queue = get_queue(&queue_families.present);
        let compute_queue = get_queue(&queue_families.compute);
        let transfer_queue = get_queue(&queue_families.transfer);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })?;

        let pipeline_cache = unsafe {
            raw.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
        };

        let upload_pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(graphics_queue.family_index);
        let upload_pool = unsafe { raw.create_command_pool(&upload_pool_info, None)? };

        let push_descriptor_fns = khr::push_descriptor::Device::new(&instance.raw, &raw);

        let ray_tracing_supported = enable_ray_tracing && physical_device.supports_ray_tracing();
        let (acceleration_fns, ray_tracing_fns, rt_properties, as_properties) =
            if ray_tracing_supported {
                let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
                let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
                let mut props2 = vk::PhysicalDeviceProperties2::default()
                    .push_next(&mut rt_props)
                    .push_next(&mut as_props);
                unsafe {
                    instance
                        .raw
                        .get_physical_device_properties2(physical_device.raw, &mut props2);
                }
                (
                    Some(khr::acceleration_structure::Device::new(&instance.raw, &raw)),
                    Some(khr::ray_tracing_pipeline::Device::new(&instance.raw, &raw)),
                    Some(RayTracingProperties {
                        shader_group_handle_size: rt_props.shader_group_handle_size,
                        shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
                        shader_group_base_alignment: rt_props.shader_group_base_alignment,
                        max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
                    }),
                    Some(AccelerationStructureProperties {
                        min_scratch_alignment: as_props
                            .min_acceleration_structure_scratch_offset_alignment,
                    }),
                )
            } else {
                (None, None, None, None)
            };

        let mut mv_props = vk::PhysicalDeviceMultiviewProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut mv_props);
        unsafe {
            instance
                .raw
                .get_physical_device_properties2(physical_device.raw, &mut props2);
        }

        let timing = TimingData::new(&raw, max_timestamps)?;

        Ok(Arc::new(Self {
            resource_hub: Mutex::new(ResourceHub {
                pending: Vec::new(),
            }),
            timing: Mutex::new(timing),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            pipeline_cache,
            upload_pool: Mutex::new(upload_pool),
            graphics_queue,
            compute_queue,
            present_queue,
            transfer_queue,
            push_descriptor_fns,
            acceleration_fns,
            ray_tracing_fns,
            rt_properties,
            as_properties,
            properties: physical_device.properties,
            multiview_max_views: mv_props.max_multiview_view_count,
            frame_counter: AtomicU64::new(0),
            physical: physical_device.raw,
            raw: raw.clone(),
            id,
            name: physical_device.name.clone(),
        }))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ray_tracing_supported(&self) -> bool {
        self.ray_tracing_fns.is_some()
    }

    pub fn rt_properties(&self) -> Option<&RayTracingProperties> {
        self.rt_properties.as_ref()
    }

    pub fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    pub(crate) fn current_frame_counter(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    /// Queues a GPU object for destruction once the current frame has
    /// certainly completed on device.
    pub(crate) fn schedule_destruction(&self, pending: PendingDestruction) {
        self.resource_hub
            .lock()
            .pending
            .push((self.current_frame_counter(), pending));
    }

    /// Destroys every queued object whose tagged frame is at most
    /// `completed_counter`.
    pub(crate) fn flush_deferred_destruction(&self, completed_counter: u64) {
        let mut hub = self.resource_hub.lock();
        let mut i = 0;
        while i < hub.pending.len() {
            if hub.pending[i].0 <= completed_counter {
                let (_, pending) = hub.pending.swap_remove(i);
                self.destroy_pending(pending);
            } else {
                i += 1;
            }
        }
    }

    fn destroy_pending(&self, pending: PendingDestruction) {
        unsafe {
            match pending {
                PendingDestruction::Buffer { raw, allocation } => {
                    self.raw.destroy_buffer(raw, None);
                    if let Some(allocation) = allocation {
                        let _ = self.allocator.lock().free(allocation);
                    }
                }
                PendingDestruction::Image {
                    raw,
                    views,
                    allocation,
                } => {
                    for view in views {
                        self.raw.destroy_image_view(view, None);
                    }
                    self.raw.destroy_image(raw, None);
                    if let Some(allocation) = allocation {
                        let _ = self.allocator.lock().free(allocation);
                    }
                }
                PendingDestruction::Sampler(raw) => self.raw.destroy_sampler(raw, None),
                PendingDestruction::Pipeline(raw) => self.raw.destroy_pipeline(raw, None),
                PendingDestruction::PipelineLayout(raw) => {
                    self.raw.destroy_pipeline_layout(raw, None)
                }
                PendingDestruction::DescriptorPool(raw) => {
                    self.raw.destroy_descriptor_pool(raw, None)
                }
                PendingDestruction::DescriptorSetLayout(raw) => {
                    self.raw.destroy_descriptor_set_layout(raw, None)
                }
                PendingDestruction::AccelerationStructure(raw) => {
                    if let Some(fns) = &self.acceleration_fns {
                        fns.destroy_acceleration_structure(raw, None);
                    }
                }
                PendingDestruction::QueryPool(raw) => self.raw.destroy_query_pool(raw, None),
                PendingDestruction::RenderPass(raw) => self.raw.destroy_render_pass(raw, None),
                PendingDestruction::Framebuffer(raw) => self.raw.destroy_framebuffer(raw, None),
                PendingDestruction::CommandBuffer(pool, cb) => {
                    self.raw.free_command_buffers(pool, &[cb])
                }
            }
        }
    }

    pub(crate) fn queue_submit(
        &self,
        queue: &Queue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[SubmitSemaphore],
        signals: &[SubmitSemaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = waits.iter().map(|w| w.stage_mask).collect();
        let wait_values: Vec<u64> = waits.iter().map(|w| w.value.unwrap_or(0)).collect();
        let signal_semaphores: Vec<vk::Semaphore> = signals.iter().map(|s| s.semaphore).collect();
        let signal_values: Vec<u64> = signals.iter().map(|s| s.value.unwrap_or(0)).collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.raw
                .queue_submit(queue.raw, std::slice::from_ref(&submit_info), fence)
                .with_context(|| "Queue submission failed")?;
        }
        Ok(())
    }

    /// Records commands into a transient command buffer, submits to the
    /// graphics queue and waits for completion. Only meant for setup-time
    /// uploads and builds. Re-entrant: compacted acceleration structure
    /// builds issue a nested submission from inside the record callback.
    pub(crate) fn one_time_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let pool = *self.upload_pool.lock();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cb = unsafe { self.raw.allocate_command_buffers(&allocate_info)?[0] };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.raw.begin_command_buffer(cb, &begin_info)?;
        }
        record(cb)?;
        unsafe {
            self.raw.end_command_buffer(cb)?;
        }

        self.queue_submit(&self.graphics_queue, &[cb], &[], &[], vk::Fence::null())?;
        unsafe {
            self.raw.queue_wait_idle(self.graphics_queue.raw)?;
            self.raw.free_command_buffers(pool, &[cb]);
        }
        Ok(())
    }

    pub(crate) fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.raw.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
        }
        self.flush_deferred_destruction(u64::MAX);
        self.timing.lock().destroy(&self.raw);
        unsafe {
            self.raw
                .destroy_command_pool(*self.upload_pool.lock(), None);
            self.raw.destroy_pipeline_cache(self.pipeline_cache, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
        log::trace!("Logical device {} dropped", self.id);
    }
}

struct SelectedQueueFamilies {
    graphics: QueueFamily,
    present: QueueFamily,
    compute: QueueFamily,
    transfer: QueueFamily,
}

/// Selects queue families for graphics, present, compute and transfer work.
/// Dedicated compute and transfer families are used when available; families
/// may coincide otherwise.
fn select_queue_families(device: &PhysicalDevice) -> Result<SelectedQueueFamilies> {
    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;

    for family in device
        .queue_families
        .iter()
        .filter(|family| family.properties.queue_count > 0)
    {
        if family.supports_graphics() && graphics.is_none() {
            graphics = Some(*family);
        } else if family.supports_compute() && compute.is_none() {
            compute = Some(*family);
        } else if family.supports_transfer() && !family.supports_compute() && transfer.is_none() {
            transfer = Some(*family);
        }
    }

    let graphics =
        graphics.ok_or_else(|| anyhow::anyhow!("No graphics queue family available"))?;
    // Graphics queue doubles as the present queue; fall back for the rest.
    let compute = compute.unwrap_or(graphics);
    let transfer = transfer.unwrap_or(compute);

    Ok(SelectedQueueFamilies {
        graphics,
        present: graphics,
        compute,
        transfer,
    })
}

fn create_logical_device(
    instance: &Instance,
    physical_device: &PhysicalDevice,
    queue_families: &SelectedQueueFamilies,
    enable_ray_tracing: bool,
    multi_device: bool,
) -> Result<ash::Device> {
    let queue_priorities = [1.0f32];

    let mut indices = vec![
        queue_families.graphics.index,
        queue_families.present.index,
        queue_families.compute.index,
        queue_families.transfer.index,
    ];
    indices.sort_unstable();
    indices.dedup();

    let queue_create_infos: Vec<_> = indices
        .iter()
        .map(|&index| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(index)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let mut extensions: Vec<&std::ffi::CStr> = super::REQUIRED_DEVICE_EXTENSIONS.to_vec();
    let ray_tracing = enable_ray_tracing && physical_device.supports_ray_tracing();
    if ray_tracing {
        extensions.extend_from_slice(super::RAY_TRACING_DEVICE_EXTENSIONS);
    }
    if multi_device && physical_device.supports_extensions(super::MULTI_DEVICE_EXTENSIONS) {
        extensions.extend_from_slice(super::MULTI_DEVICE_EXTENSIONS);
    }
    let extension_strings: Vec<CString> = extensions
        .iter()
        .map(|ext| CString::new(ext.to_bytes()))
        .collect::<Result<_, _>>()?;
    let extension_ptrs: Vec<*const i8> = extension_strings.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan11_features = vk::PhysicalDeviceVulkan11Features::default().multiview(true);
    let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .host_query_reset(true);
    let mut rt_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);
    let mut ray_query_features =
        vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

    let mut device_features2 = vk::PhysicalDeviceFeatures2::default();
    unsafe {
        instance
            .raw
            .get_physical_device_features2(physical_device.raw, &mut device_features2);
    }
    let mut device_features2 = device_features2
        .push_next(&mut vulkan11_features)
        .push_next(&mut vulkan12_features);
    if ray_tracing {
        device_features2 = device_features2
            .push_next(&mut rt_pipeline_features)
            .push_next(&mut as_features)
            .push_next(&mut ray_query_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .push_next(&mut device_features2);

    let device = unsafe {
        instance
            .raw
            .create_device(physical_device.raw, &device_create_info, None)
            .with_context(|| {
                format!(
                    "Failed to create logical device for {}",
                    physical_device.name
                )
            })?
    };

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mask_set_algebra() {
        let mut a = DeviceMask::none();
        assert!(a.is_empty());
        a.insert(0);
        a.insert(3);
        assert!(a.contains(0) && a.contains(3) && !a.contains(1));
        assert_eq!(a.len(), 2);

        let b = DeviceMask::single(3).union(DeviceMask::single(5));
        assert_eq!(a.union(b).len(), 3);
        assert_eq!(a.intersection(b), DeviceMask::single(3));
        assert_eq!(a.difference(b), DeviceMask::single(0));

        a.erase(3);
        assert_eq!(a, DeviceMask::single(0));
    }

    #[test]
    fn device_mask_iterates_in_id_order() {
        let mut mask = DeviceMask::none();
        mask.insert(5);
        mask.insert(1);
        mask.insert(2);
        let ids: Vec<DeviceId> = mask.iter().collect();
        assert_eq!(ids, vec![1, 2, 5]);
    }

    #[test]
    fn device_mask_all_covers_range() {
        let mask = DeviceMask::all(4);
        assert_eq!(mask.len(), 4);
        assert!(mask.contains(0) && mask.contains(3) && !mask.contains(4));
    }

    #[test]
    fn per_device_replicates_over_mask() {
        let mut mask = DeviceMask::none();
        mask.insert(0);
        mask.insert(2);
        let container = PerDevice::new(mask, |id| Ok(id * 10)).unwrap();
        assert_eq!(*container.get(0), 0);
        assert_eq!(*container.get(2), 20);
        assert_eq!(container.mask(), mask);
        let ids: Vec<DeviceId> = container.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 2]);
    }
}
