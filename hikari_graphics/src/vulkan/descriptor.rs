use std::{collections::HashMap, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;
use parking_lot::Mutex;

use super::{
    context::Context,
    device::{Device, DeviceId, DeviceMask, PendingDestruction, MAX_FRAMES_IN_FLIGHT},
    reflection::BindingInfo,
    shader::ShaderSource,
};

#[derive(Clone)]
pub struct NamedBinding {
    pub name: String,
    pub info: BindingInfo,
    pub flags: vk::DescriptorBindingFlags,
}

/// Descriptor set layout assembled from reflected shader bindings, keyed by
/// binding name. Mutable until the first per-device handle is created, after
/// which the raw layouts are cached.
pub struct DescriptorSetLayout {
    set_index: u32,
    push_descriptor: bool,
    bindings: Vec<NamedBinding>,
    raw: Mutex<Vec<(DeviceId, Arc<Device>, vk::DescriptorSetLayout)>>,
}

impl DescriptorSetLayout {
    pub fn new(set_index: u32, push_descriptor: bool) -> Self {
        Self {
            set_index,
            push_descriptor,
            bindings: Vec::new(),
            raw: Mutex::new(Vec::new()),
        }
    }

    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub fn is_push_descriptor(&self) -> bool {
        self.push_descriptor
    }

    /// Merges the shader's bindings for this layout's set index.
    pub fn add(&mut self, shader: &ShaderSource) {
        assert!(
            self.raw.lock().is_empty(),
            "descriptor set layout is immutable after first use"
        );
        for (name, info) in &shader.reflection.bindings {
            if info.set != self.set_index {
                continue;
            }
            if let Some(existing) = self.bindings.iter_mut().find(|b| &b.name == name) {
                assert_eq!(
                    existing.info.binding, info.binding,
                    "binding index mismatch for {name}"
                );
                existing.info.stages |= info.stages;
                existing.info.count = existing.info.count.max(info.count);
                existing.info.runtime_array |= info.runtime_array;
            } else {
                self.bindings.push(NamedBinding {
                    name: name.clone(),
                    info: info.clone(),
                    flags: vk::DescriptorBindingFlags::empty(),
                });
            }
        }
    }

    /// Adjusts the descriptor count and binding flag bits of a named
    /// binding, e.g. to size a runtime array or mark it partially bound.
    pub fn set_binding_params(&mut self, name: &str, count: u32, flags: vk::DescriptorBindingFlags) {
        assert!(
            self.raw.lock().is_empty(),
            "descriptor set layout is immutable after first use"
        );
        if let Some(binding) = self.bindings.iter_mut().find(|b| b.name == name) {
            binding.info.count = count;
            binding.flags = flags;
        }
    }

    pub fn find(&self, name: &str) -> Option<&NamedBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn bindings(&self) -> &[NamedBinding] {
        &self.bindings
    }

    pub(crate) fn handle(&self, device: &Arc<Device>) -> Result<vk::DescriptorSetLayout> {
        let mut raw = self.raw.lock();
        if let Some((_, _, layout)) = raw.iter().find(|(id, _, _)| *id == device.id) {
            return Ok(*layout);
        }

        let mut vulkan_bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.info.binding)
                    .descriptor_type(b.info.descriptor_type)
                    .descriptor_count(b.info.count.max(1))
                    .stage_flags(b.info.stages)
            })
            .collect();
        vulkan_bindings.sort_by_key(|b| b.binding);

        let binding_flags: Vec<vk::DescriptorBindingFlags> = {
            let mut sorted = self.bindings.clone();
            sorted.sort_by_key(|b| b.info.binding);
            sorted.iter().map(|b| b.flags).collect()
        };
        let use_binding_flags = binding_flags
            .iter()
            .any(|f| !f.is_empty());

        let mut flags = vk::DescriptorSetLayoutCreateFlags::empty();
        if self.push_descriptor {
            flags |= vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR;
        }

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vulkan_bindings)
            .flags(flags);
        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);
        if use_binding_flags {
            create_info = create_info.push_next(&mut binding_flags_info);
        }

        let layout = unsafe {
            device
                .raw
                .create_descriptor_set_layout(&create_info, None)?
        };
        raw.push((device.id, device.clone(), layout));
        Ok(layout)
    }

    fn pool_sizes(&self, set_count: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for binding in &self.bindings {
            *sizes.entry(binding.info.descriptor_type).or_default() +=
                binding.info.count.max(1) * set_count;
        }
        sizes
            .into_iter()
            .map(|(ty, count)| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(count)
            })
            .collect()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        for (_, device, layout) in self.raw.lock().drain(..) {
            device.schedule_destruction(PendingDestruction::DescriptorSetLayout(layout));
        }
    }
}

struct AllocatedReplica {
    device: Arc<Device>,
    pool: Option<vk::DescriptorPool>,
    sets: Vec<vk::DescriptorSet>,
}

/// Descriptor sets allocated from a private pool, with `count` alternatives
/// per frame in flight so stale frames keep their bindings intact.
pub struct AllocatedDescriptorSets {
    layout: Arc<DescriptorSetLayout>,
    replicas: Vec<(DeviceId, AllocatedReplica)>,
    alternative_count: u32,
}

impl AllocatedDescriptorSets {
    pub fn new(ctx: &Context, mask: DeviceMask, layout: Arc<DescriptorSetLayout>) -> Self {
        let replicas = mask
            .iter()
            .map(|id| {
                (
                    id,
                    AllocatedReplica {
                        device: ctx.device(id).clone(),
                        pool: None,
                        sets: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            layout,
            replicas,
            alternative_count: 0,
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn alternative_count(&self) -> u32 {
        self.alternative_count
    }

    /// Recreates the pool sized for `count` alternatives plus slack for the
    /// frames still in flight. Old pools are released at frame end.
    ///
    /// XXX: could reuse the existing pool when the new count fits it.
    pub fn reset(&mut self, count: u32) -> Result<()> {
        let total = count * (MAX_FRAMES_IN_FLIGHT as u32 + 2);
        self.alternative_count = total;
        for (_, replica) in &mut self.replicas {
            if let Some(pool) = replica.pool.take() {
                replica
                    .device
                    .schedule_destruction(PendingDestruction::DescriptorPool(pool));
            }
            replica.sets.clear();
            if total == 0 {
                continue;
            }

            let pool_sizes = self.layout.pool_sizes(total);
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(total)
                .pool_sizes(&pool_sizes);
            let pool = unsafe { replica.device.raw.create_descriptor_pool(&pool_info, None)? };
            replica.pool = Some(pool);

            let layout_handle = self.layout.handle(&replica.device)?;
            let layouts = vec![layout_handle; total as usize];
            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            replica.sets = unsafe { replica.device.raw.allocate_descriptor_sets(&allocate_info)? };
        }
        Ok(())
    }

    fn replica(&self, id: DeviceId) -> &AllocatedReplica {
        &self
            .replicas
            .iter()
            .find(|(i, _)| *i == id)
            .expect("descriptor sets not replicated on device")
            .1
    }

    pub fn set(&self, id: DeviceId, alternative: u32) -> vk::DescriptorSet {
        self.replica(id).sets[alternative as usize]
    }

    pub fn set_buffer(
        &self,
        id: DeviceId,
        alternative: u32,
        name: &str,
        infos: &[vk::DescriptorBufferInfo],
    ) -> Result<()> {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return Ok(());
        };
        if infos.len() as u32 > binding.info.count.max(1) {
            anyhow::bail!(
                "Descriptor write of {} entries exceeds binding {name} capacity {}",
                infos.len(),
                binding.info.count.max(1)
            );
        }
        let replica = self.replica(id);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(replica.sets[alternative as usize])
            .dst_binding(binding.info.binding)
            .dst_array_element(0)
            .descriptor_type(binding.info.descriptor_type)
            .buffer_info(infos);
        unsafe {
            replica.device.raw.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }

    pub fn set_image(
        &self,
        id: DeviceId,
        alternative: u32,
        name: &str,
        infos: &[vk::DescriptorImageInfo],
    ) -> Result<()> {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return Ok(());
        };
        if infos.len() as u32 > binding.info.count.max(1) {
            anyhow::bail!(
                "Descriptor write of {} entries exceeds binding {name} capacity {}",
                infos.len(),
                binding.info.count.max(1)
            );
        }
        let replica = self.replica(id);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(replica.sets[alternative as usize])
            .dst_binding(binding.info.binding)
            .dst_array_element(0)
            .descriptor_type(binding.info.descriptor_type)
            .image_info(infos);
        unsafe {
            replica.device.raw.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }

    pub fn set_acceleration_structure(
        &self,
        id: DeviceId,
        alternative: u32,
        name: &str,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> Result<()> {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return Ok(());
        };
        let replica = self.replica(id);
        let structures = [acceleration_structure];
        let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(replica.sets[alternative as usize])
            .dst_binding(binding.info.binding)
            .descriptor_type(binding.info.descriptor_type)
            .push_next(&mut as_write);
        write.descriptor_count = 1;
        unsafe {
            replica.device.raw.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }
}

impl Drop for AllocatedDescriptorSets {
    fn drop(&mut self) {
        for (_, replica) in &mut self.replicas {
            if let Some(pool) = replica.pool.take() {
                replica
                    .device
                    .schedule_destruction(PendingDestruction::DescriptorPool(pool));
            }
        }
    }
}

enum StagedWrite {
    Buffers(u32, vk::DescriptorType, Vec<vk::DescriptorBufferInfo>),
    Images(u32, vk::DescriptorType, Vec<vk::DescriptorImageInfo>),
    AccelerationStructure(u32, vk::AccelerationStructureKHR),
}

/// Descriptor writes accumulated per device and flushed straight into the
/// command buffer; no pool or set objects are allocated.
pub struct PushDescriptorSet {
    layout: Arc<DescriptorSetLayout>,
    staged: Mutex<HashMap<DeviceId, Vec<StagedWrite>>>,
}

impl PushDescriptorSet {
    pub fn new(layout: Arc<DescriptorSetLayout>) -> Self {
        assert!(layout.is_push_descriptor());
        Self {
            layout,
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn set_buffer(&self, id: DeviceId, name: &str, infos: Vec<vk::DescriptorBufferInfo>) {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return;
        };
        self.staged.lock().entry(id).or_default().push(StagedWrite::Buffers(
            binding.info.binding,
            binding.info.descriptor_type,
            infos,
        ));
    }

    pub fn set_image(&self, id: DeviceId, name: &str, infos: Vec<vk::DescriptorImageInfo>) {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return;
        };
        self.staged.lock().entry(id).or_default().push(StagedWrite::Images(
            binding.info.binding,
            binding.info.descriptor_type,
            infos,
        ));
    }

    pub fn set_acceleration_structure(
        &self,
        id: DeviceId,
        name: &str,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) {
        let Some(binding) = self.layout.find(name) else {
            log::trace!("Skipping unknown descriptor binding {name}");
            return;
        };
        self.staged
            .lock()
            .entry(id)
            .or_default()
            .push(StagedWrite::AccelerationStructure(
                binding.info.binding,
                acceleration_structure,
            ));
    }

    /// Flushes the accumulated writes for this device into `cb`.
    pub fn push(
        &self,
        device: &Device,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        set_index: u32,
    ) {
        let mut staged = self.staged.lock();
        let Some(writes) = staged.remove(&device.id) else {
            return;
        };

        let mut as_writes: Vec<(usize, [vk::AccelerationStructureKHR; 1])> = Vec::new();
        let mut vulkan_writes: Vec<vk::WriteDescriptorSet> = Vec::new();
        for write in &writes {
            match write {
                StagedWrite::Buffers(binding, ty, infos) => {
                    vulkan_writes.push(
                        vk::WriteDescriptorSet::default()
                            .dst_binding(*binding)
                            .descriptor_type(*ty)
                            .buffer_info(infos),
                    );
                }
                StagedWrite::Images(binding, ty, infos) => {
                    vulkan_writes.push(
                        vk::WriteDescriptorSet::default()
                            .dst_binding(*binding)
                            .descriptor_type(*ty)
                            .image_info(infos),
                    );
                }
                StagedWrite::AccelerationStructure(binding, structure) => {
                    as_writes.push((vulkan_writes.len(), [*structure]));
                    let mut write = vk::WriteDescriptorSet::default()
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
                    write.descriptor_count = 1;
                    vulkan_writes.push(write);
                }
            }
        }

        let mut as_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = as_writes
            .iter()
            .map(|(_, structures)| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(structures)
            })
            .collect();
        for ((write_index, _), as_info) in as_writes.iter().zip(as_infos.iter_mut()) {
            vulkan_writes[*write_index] = vulkan_writes[*write_index].push_next(as_info);
        }

        if vulkan_writes.is_empty() {
            return;
        }
        unsafe {
            device.push_descriptor_fns.cmd_push_descriptor_set(
                cb,
                bind_point,
                pipeline_layout,
                set_index,
                &vulkan_writes,
            );
        }
    }
}
