use std::{
    collections::HashMap,
    mem::{align_of, size_of_val},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use parking_lot::Mutex;

use super::{
    context::Context,
    device::{Device, DeviceId, DeviceMask, PendingDestruction},
};

pub struct BufferDescriptor {
    pub size: u64,
    pub usage_flags: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
    /// Extra alignment requirement on top of what Vulkan reports, e.g. the
    /// acceleration structure scratch alignment.
    pub alignment: u64,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage_flags: vk::BufferUsageFlags, memory_location: MemoryLocation) -> Self {
        Self {
            size,
            usage_flags,
            memory_location,
            alignment: 1,
        }
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Buffer owned by a single device replica.
pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    size: u64,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Buffer {
    pub fn new(device: Arc<Device>, desc: BufferDescriptor) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(desc.usage_flags);

        let raw;
        let mut requirements;
        unsafe {
            raw = device.raw.create_buffer(&create_info, None)?;
            requirements = device.raw.get_buffer_memory_requirements(raw);
        }
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: desc.memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok(Self {
            raw,
            size: desc.size,
            allocation: Some(allocation),
            device,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Requires `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.raw);
        unsafe { self.device.raw.get_buffer_device_address(&info) }
    }

    /// Writes to a CPU-visible buffer. Errors if the buffer is not mapped.
    pub fn write_data<T: Copy>(&self, data: &[T]) -> Result<()> {
        self.write_data_with_byte_offset(data, 0)
    }

    pub fn write_data_with_byte_offset<T: Copy>(&self, data: &[T], offset: u64) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .with_context(|| "Buffer has no allocation")?;
        let ptr = allocation
            .mapped_ptr()
            .with_context(|| "Buffer is not CPU mappable")?
            .as_ptr();
        unsafe {
            let dst = (ptr as *mut u8).add(offset as usize);
            let mut align =
                ash::util::Align::new(dst as *mut _, align_of::<T>() as u64, size_of_val(data) as u64);
            align.copy_from_slice(data);
        }
        Ok(())
    }

    pub(crate) fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.schedule_destruction(PendingDestruction::Buffer {
            raw: self.raw,
            allocation: self.allocation.take(),
        });
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureViewDescriptor {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_mip: u32,
    pub mip_count: u32,
    pub view_type: vk::ImageViewType,
}

#[derive(Clone, Copy)]
pub struct TextureDescriptor {
    pub size: (u32, u32),
    pub array_layers: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub initial_layout: vk::ImageLayout,
    pub samples: vk::SampleCountFlags,
}

impl TextureDescriptor {
    pub fn new_2d(size: (u32, u32), format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            size,
            array_layers: 1,
            mip_levels: 1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            initial_layout: vk::ImageLayout::GENERAL,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }
}

struct TextureData {
    device: Arc<Device>,
    image: vk::Image,
    allocation: Option<Allocation>,
    views: Mutex<HashMap<TextureViewDescriptor, vk::ImageView>>,
}

/// Image replicated across a device mask, with derived image views cached by
/// their subresource range.
pub struct Texture {
    replicas: Vec<(DeviceId, TextureData)>,
    desc: TextureDescriptor,
    mask: DeviceMask,
}

pub(crate) fn format_aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

impl Texture {
    pub fn new(ctx: &Context, mask: DeviceMask, desc: TextureDescriptor) -> Result<Self> {
        let mut replicas = Vec::new();
        for id in mask.iter() {
            let device = ctx.device(id).clone();
            replicas.push((id, Self::create_replica(device, &desc)?));
        }
        Ok(Self {
            replicas,
            desc,
            mask,
        })
    }

    fn create_replica(device: Arc<Device>, desc: &TextureDescriptor) -> Result<TextureData> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.size.0.max(1),
                height: desc.size.1.max(1),
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.raw.create_image(&create_info, None)? };
        let requirements = unsafe { device.raw.get_image_memory_requirements(image) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            device
                .raw
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        Ok(TextureData {
            device,
            image,
            allocation: Some(allocation),
            views: Mutex::new(HashMap::new()),
        })
    }

    fn replica(&self, id: DeviceId) -> &TextureData {
        &self
            .replicas
            .iter()
            .find(|(i, _)| *i == id)
            .expect("texture not replicated on device")
            .1
    }

    pub fn mask(&self) -> DeviceMask {
        self.mask
    }

    pub fn size(&self) -> (u32, u32) {
        self.desc.size
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }

    pub fn initial_layout(&self) -> vk::ImageLayout {
        self.desc.initial_layout
    }

    pub fn image(&self, id: DeviceId) -> vk::Image {
        self.replica(id).image
    }

    /// Full-resource view with a view type derived from the layer count.
    pub fn view(&self, id: DeviceId) -> vk::ImageView {
        let view_type = if self.desc.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        self.view_with(
            id,
            TextureViewDescriptor {
                base_layer: 0,
                layer_count: self.desc.array_layers,
                base_mip: 0,
                mip_count: self.desc.mip_levels,
                view_type,
            },
        )
    }

    pub fn layer_view(&self, id: DeviceId, base_layer: u32, layer_count: u32) -> vk::ImageView {
        self.view_with(
            id,
            TextureViewDescriptor {
                base_layer,
                layer_count,
                base_mip: 0,
                mip_count: self.desc.mip_levels,
                view_type: if layer_count > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                },
            },
        )
    }

    pub fn view_with(&self, id: DeviceId, view_desc: TextureViewDescriptor) -> vk::ImageView {
        let replica = self.replica(id);
        let mut views = replica.views.lock();
        if let Some(view) = views.get(&view_desc) {
            return *view;
        }

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(format_aspect_flags(self.desc.format))
            .base_mip_level(view_desc.base_mip)
            .level_count(view_desc.mip_count)
            .base_array_layer(view_desc.base_layer)
            .layer_count(view_desc.layer_count);
        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(replica.image)
            .view_type(view_desc.view_type)
            .format(self.desc.format)
            .subresource_range(subresource_range);
        let view = unsafe {
            replica
                .device
                .raw
                .create_image_view(&view_create_info, None)
                .expect("image view creation failed")
        };
        views.insert(view_desc, view);
        view
    }

    /// Reallocates the images with a new size. Old images are destroyed once
    /// the current frame has finished; dependent descriptor writes must be
    /// re-issued.
    pub fn resize(&mut self, size: (u32, u32)) -> Result<()> {
        if size == self.desc.size {
            return Ok(());
        }
        self.desc.size = size;
        for (_, replica) in &mut self.replicas {
            let device = replica.device.clone();
            let new_replica = Self::create_replica(device, &self.desc)?;
            let old = std::mem::replace(replica, new_replica);
            release_texture_data(old);
        }
        Ok(())
    }
}

fn release_texture_data(mut data: TextureData) {
    let views: Vec<vk::ImageView> = data.views.lock().drain().map(|(_, v)| v).collect();
    data.device.schedule_destruction(PendingDestruction::Image {
        raw: data.image,
        views,
        allocation: data.allocation.take(),
    });
}

impl Drop for Texture {
    fn drop(&mut self) {
        for (_, replica) in self.replicas.drain(..) {
            release_texture_data(replica);
        }
    }
}

pub struct SamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub anisotropy: f32,
    pub max_lod: f32,
    pub compare_op: Option<vk::CompareOp>,
}

impl SamplerDescriptor {
    pub fn new() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            anisotropy: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            compare_op: None,
        }
    }

    pub fn nearest_clamp() -> Self {
        Self {
            min_filter: vk::Filter::NEAREST,
            mag_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_v: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            address_mode_w: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            anisotropy: 0.0,
            max_lod: 0.0,
            compare_op: None,
        }
    }

    pub fn min_filter(mut self, min_filter: vk::Filter) -> Self {
        self.min_filter = min_filter;
        self
    }

    pub fn mag_filter(mut self, mag_filter: vk::Filter) -> Self {
        self.mag_filter = mag_filter;
        self
    }

    pub fn address_modes(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sampler replicated across a device mask.
pub struct Sampler {
    replicas: Vec<(DeviceId, Arc<Device>, vk::Sampler)>,
}

impl Sampler {
    pub fn new(ctx: &Context, mask: DeviceMask, desc: SamplerDescriptor) -> Result<Self> {
        let mut replicas = Vec::new();
        for id in mask.iter() {
            let device = ctx.device(id).clone();
            let create_info = vk::SamplerCreateInfo::default()
                .min_filter(desc.min_filter)
                .mag_filter(desc.mag_filter)
                .mipmap_mode(desc.mipmap_mode)
                .address_mode_u(desc.address_mode_u)
                .address_mode_v(desc.address_mode_v)
                .address_mode_w(desc.address_mode_w)
                .anisotropy_enable(desc.anisotropy > 0.0)
                .max_anisotropy(desc.anisotropy)
                .compare_enable(desc.compare_op.is_some())
                .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
                .min_lod(0.0)
                .max_lod(desc.max_lod)
                .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
            let raw = unsafe { device.raw.create_sampler(&create_info, None)? };
            replicas.push((id, device, raw));
        }
        Ok(Self { replicas })
    }

    pub fn raw(&self, id: DeviceId) -> vk::Sampler {
        self.replicas
            .iter()
            .find(|(i, _, _)| *i == id)
            .expect("sampler not replicated on device")
            .2
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        for (_, device, raw) in self.replicas.drain(..) {
            device.schedule_destruction(PendingDestruction::Sampler(raw));
        }
    }
}
