use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;

use super::{
    context::Context,
    device::{Device, DeviceId, DeviceMask, MAX_FRAMES_IN_FLIGHT},
    resource::{Buffer, BufferDescriptor},
};

/// Rounds a per-entry stride up to the device's uniform buffer offset
/// alignment when the buffer is used as a uniform buffer.
pub(crate) fn entry_alignment(entry_size: u64, min_uniform_alignment: u64, is_uniform: bool) -> u64 {
    if !is_uniform || min_uniform_alignment == 0 {
        return entry_size;
    }
    entry_size.div_ceil(min_uniform_alignment) * min_uniform_alignment
}

struct StagedReplica {
    device: Arc<Device>,
    target: Buffer,
    staging: Vec<Buffer>,
}

/// Buffer for data that the host updates often. Wraps one device-local
/// target buffer per device and one staging buffer per in-flight frame,
/// and records the host-to-device copies into the caller's command buffer.
/// Data is automatically duplicated to all devices in the mask; the shared
/// intermediate copy is skipped when only one device is involved.
pub struct StagedBuffer {
    replicas: Vec<(DeviceId, StagedReplica)>,
    devices: Vec<(DeviceId, Arc<Device>)>,
    shared_data: Vec<u8>,
    capacity: u64,
    size: u64,
    usage: vk::BufferUsageFlags,
    mask: DeviceMask,
}

impl StagedBuffer {
    pub fn new(
        ctx: &Context,
        mask: DeviceMask,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let devices: Vec<(DeviceId, Arc<Device>)> = mask
            .iter()
            .map(|id| (id, ctx.device(id).clone()))
            .collect();
        let mut buffer = Self {
            replicas: Vec::new(),
            devices,
            shared_data: Vec::new(),
            capacity: 0,
            size: 0,
            usage,
            mask,
        };
        buffer.resize(size)?;
        Ok(buffer)
    }

    fn create_replicas(&mut self) -> Result<()> {
        self.replicas.clear();
        for (id, device) in &self.devices {
            let target = Buffer::new(
                device.clone(),
                BufferDescriptor::new(
                    self.capacity,
                    self.usage | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                ),
            )?;
            let staging = (0..MAX_FRAMES_IN_FLIGHT)
                .map(|_| {
                    Buffer::new(
                        device.clone(),
                        BufferDescriptor::new(
                            self.capacity,
                            vk::BufferUsageFlags::TRANSFER_SRC,
                            MemoryLocation::CpuToGpu,
                        ),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            self.replicas.push((
                *id,
                StagedReplica {
                    device: device.clone(),
                    target,
                    staging,
                },
            ));
        }
        Ok(())
    }

    /// May reallocate the buffers. Returns true if the target handles
    /// changed, in which case dependent descriptor sets must be rewritten.
    pub fn resize(&mut self, size: u64) -> Result<bool> {
        self.size = size;
        if size <= self.capacity && !self.replicas.is_empty() {
            return Ok(false);
        }
        if size == 0 {
            return Ok(false);
        }
        self.capacity = size;
        self.create_replicas()?;
        Ok(true)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 || self.replicas.is_empty()
    }

    pub fn mask(&self) -> DeviceMask {
        self.mask
    }

    pub fn raw(&self, id: DeviceId) -> vk::Buffer {
        self.replica(id).target.raw()
    }

    pub fn device_address(&self, id: DeviceId) -> vk::DeviceAddress {
        self.replica(id).target.device_address()
    }

    fn replica(&self, id: DeviceId) -> &StagedReplica {
        &self
            .replicas
            .iter()
            .find(|(i, _)| *i == id)
            .expect("staged buffer not replicated on device")
            .1
    }

    pub fn entry_alignment(&self, id: DeviceId, entry_size: u64) -> u64 {
        let replica = self.replica(id);
        entry_alignment(
            entry_size,
            replica.device.min_uniform_buffer_offset_alignment(),
            self.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER),
        )
    }

    /// Copies into every device's staging buffer for the given frame.
    pub fn update(&self, frame_index: u32, data: &[u8], offset: u64) {
        if self.is_empty() {
            return;
        }
        for (id, _) in &self.replicas {
            self.update_one(*id, frame_index, data, offset);
        }
    }

    pub fn update_one(&self, id: DeviceId, frame_index: u32, data: &[u8], offset: u64) {
        if self.is_empty() {
            return;
        }
        let replica = self.replica(id);
        let staging = &replica.staging[frame_index as usize];
        let bytes = data.len().min((self.size - offset) as usize);
        if let Some(ptr) = staging.mapped_ptr() {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), bytes);
            }
        }
    }

    /// Maps one device's staging buffer for the frame and hands the caller a
    /// typed mutable slice over it.
    pub fn map_one<T: Copy, F>(&self, id: DeviceId, frame_index: u32, f: F)
    where
        F: FnOnce(&mut [T]),
    {
        if self.is_empty() {
            return;
        }
        let replica = self.replica(id);
        let staging = &replica.staging[frame_index as usize];
        if let Some(ptr) = staging.mapped_ptr() {
            let count = self.size as usize / std::mem::size_of::<T>();
            let slice = unsafe { std::slice::from_raw_parts_mut(ptr as *mut T, count) };
            f(slice);
        }
    }

    /// Iterates typed entries, applying each device's uniform-buffer stride.
    /// With a single device the staging memory is written directly; with
    /// several, a shared intermediate is filled once and then copied out per
    /// device since alignment requirements may differ.
    pub fn foreach_entry<T: Copy + Default, F>(&mut self, frame_index: u32, entries: usize, mut f: F)
    where
        F: FnMut(&mut T, usize),
    {
        if self.is_empty() || entries == 0 {
            return;
        }
        let entry_size = std::mem::size_of::<T>() as u64;
        let is_uniform = self.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER);

        if self.replicas.len() == 1 {
            let replica = &self.replicas[0].1;
            let alignment = entry_alignment(
                entry_size,
                replica.device.min_uniform_buffer_offset_alignment(),
                is_uniform,
            );
            let staging = &replica.staging[frame_index as usize];
            if let Some(ptr) = staging.mapped_ptr() {
                for i in 0..entries {
                    let entry = unsafe { &mut *(ptr.add((alignment * i as u64) as usize) as *mut T) };
                    f(entry, i);
                }
            }
            return;
        }

        self.shared_data
            .resize((entry_size as usize) * entries, 0);
        for i in 0..entries {
            let entry = unsafe {
                &mut *(self.shared_data.as_mut_ptr().add(entry_size as usize * i) as *mut T)
            };
            f(entry, i);
        }

        if is_uniform {
            // Devices may have incompatible alignment requirements, so each
            // staging buffer gets its own stride.
            for (_, replica) in &self.replicas {
                let alignment = entry_alignment(
                    entry_size,
                    replica.device.min_uniform_buffer_offset_alignment(),
                    true,
                );
                let staging = &replica.staging[frame_index as usize];
                if let Some(ptr) = staging.mapped_ptr() {
                    for i in 0..entries {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                self.shared_data.as_ptr().add(entry_size as usize * i),
                                ptr.add((alignment * i as u64) as usize),
                                entry_size as usize,
                            );
                        }
                    }
                }
            }
        } else {
            let shared = std::mem::take(&mut self.shared_data);
            self.update(frame_index, &shared, 0);
            self.shared_data = shared;
        }
    }

    /// Records the staging-to-target copy for one device into `cb`.
    pub fn upload(&self, id: DeviceId, frame_index: u32, cb: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let replica = self.replica(id);
        let staging = &replica.staging[frame_index as usize];
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(self.size);
        unsafe {
            replica.device.raw.cmd_copy_buffer(
                cb,
                staging.raw(),
                replica.target.raw(),
                &[region],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_alignment_rounds_uniform_entries() {
        assert_eq!(entry_alignment(48, 64, true), 64);
        assert_eq!(entry_alignment(64, 64, true), 64);
        assert_eq!(entry_alignment(65, 64, true), 128);
        assert_eq!(entry_alignment(200, 256, true), 256);
    }

    #[test]
    fn entry_alignment_is_identity_for_storage() {
        assert_eq!(entry_alignment(48, 64, false), 48);
        assert_eq!(entry_alignment(65, 256, false), 65);
    }

    #[test]
    fn entry_alignment_handles_zero_min_alignment() {
        assert_eq!(entry_alignment(48, 0, true), 48);
    }
}
