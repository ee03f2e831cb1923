use std::{path::PathBuf, sync::atomic::Ordering, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;
use parking_lot::{Mutex, RwLock};

use super::{
    device::{Device, DeviceId, DeviceMask, SubmitSemaphore, MAX_FRAMES_IN_FLIGHT},
    shader::ShaderCache,
    Instance,
};

pub struct ContextDescriptor {
    pub application_name: String,
    pub enable_validation: bool,
    pub disable_ray_tracing: bool,
    /// `None` uses all compatible devices; otherwise filters by enumeration
    /// index.
    pub physical_device_indices: Option<Vec<usize>>,
    /// If zero, timers are no-ops. Otherwise the number of timer spans that
    /// can be measured during one frame per device.
    pub max_timestamps: u32,
    /// Directory for the on-disk compiled shader cache.
    pub shader_cache_dir: PathBuf,
}

impl Default for ContextDescriptor {
    fn default() -> Self {
        Self {
            application_name: String::from("hikari"),
            enable_validation: false,
            disable_ray_tracing: false,
            physical_device_indices: None,
            max_timestamps: 0,
            shader_cache_dir: PathBuf::from(".shader_cache"),
        }
    }
}

/// One wait entry of the inter-stage dependency graph. `value` is `None`
/// for binary semaphores.
#[derive(Clone, Copy, Debug)]
pub struct Dependency {
    pub semaphore: vk::Semaphore,
    pub value: Option<u64>,
    pub stage_mask: vk::PipelineStageFlags,
}

#[derive(Clone, Default)]
pub struct Dependencies {
    deps: Vec<Dependency>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dep: Dependency) {
        self.deps.push(dep);
    }

    pub fn concat(&mut self, other: Dependencies) {
        self.deps.extend(other.deps);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub(crate) fn to_submit_semaphores(&self) -> Vec<SubmitSemaphore> {
        self.deps
            .iter()
            .map(|dep| SubmitSemaphore {
                semaphore: dep.semaphore,
                value: dep.value,
                stage_mask: dep.stage_mask,
            })
            .collect()
    }
}

impl From<Dependency> for Dependencies {
    fn from(dep: Dependency) -> Self {
        Self { deps: vec![dep] }
    }
}

/// Owner of the presentable images. Window system integration lives outside
/// this crate; the context only drives the hooks at the frame boundaries.
pub trait DisplayTarget: Send {
    /// Acquire the next image, signalling `available` when it is ready.
    /// Returns the image index.
    fn prepare_next_image(&mut self, frame_index: u32, available: vk::Semaphore) -> Result<u32>;

    /// Present the image once `finished` has been signalled.
    fn finish_image(
        &mut self,
        frame_index: u32,
        swapchain_index: u32,
        finished: vk::Semaphore,
    ) -> Result<()>;

    fn image_count(&self) -> usize;
}

/// Handle for one frame between `begin_frame` and `end_frame`.
pub struct Frame {
    pub frame_index: u32,
    pub swapchain_index: u32,
    pub frame_counter: u64,
    /// Dependency on the display image acquisition, when a display target is
    /// attached.
    pub available: Option<Dependency>,
}

struct FrameCounters {
    frame_counter: u64,
    frame_index: u32,
}

type FrameEndAction = Box<dyn FnOnce() + Send>;

/// Multi-device rendering context. Enumerates and filters physical devices,
/// owns one logical device per selected GPU and drives the per-frame
/// lifecycle: fence waits, deferred resource destruction and the terminal
/// frame submission.
pub struct Context {
    devices: Vec<Arc<Device>>,
    display_device_index: usize,

    frame_fences: Vec<vk::Fence>,
    frame_available: Vec<vk::Semaphore>,
    frame_finished: Vec<vk::Semaphore>,
    frame_counters: RwLock<FrameCounters>,
    frame_end_actions: Mutex<Vec<Vec<FrameEndAction>>>,

    display: Mutex<Option<Box<dyn DisplayTarget>>>,
    shader_cache: ShaderCache,

    // Declared last so every device is destroyed before the instance.
    pub(crate) instance: Instance,
}

impl Context {
    pub fn new(desc: ContextDescriptor) -> Result<Self> {
        let instance = Instance::new(&desc.application_name, desc.enable_validation)?;

        let physical_devices = instance.get_physical_devices()?;
        let require_ray_tracing = !desc.disable_ray_tracing;

        let mut selected = Vec::new();
        for (index, physical) in physical_devices.iter().enumerate() {
            if let Some(filter) = &desc.physical_device_indices {
                if !filter.contains(&index) {
                    continue;
                }
            }
            if physical.meets_requirements(require_ray_tracing) {
                selected.push(physical.clone());
            } else {
                log::debug!(
                    "Skipping physical device {} ({}): requirements not met",
                    index,
                    physical.name
                );
            }
        }
        if selected.is_empty() {
            anyhow::bail!("No compatible Vulkan device found");
        }

        // Prefer a discrete GPU as the display device.
        selected.sort_by_key(|physical| {
            if physical.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                0
            } else {
                1
            }
        });

        let multi_device = selected.len() > 1;
        let mut devices = Vec::new();
        for (id, physical) in selected.iter().enumerate() {
            devices.push(Device::new(
                &instance,
                physical,
                id as DeviceId,
                !desc.disable_ray_tracing,
                multi_device,
                desc.max_timestamps,
            )?);
        }
        let display_device_index = 0;

        let display_raw = &devices[display_device_index].raw;
        let mut frame_fences = Vec::new();
        let mut frame_available = Vec::new();
        let mut frame_finished = Vec::new();
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            frame_fences.push(unsafe { display_raw.create_fence(&fence_info, None)? });
            let semaphore_info = vk::SemaphoreCreateInfo::default();
            frame_available.push(unsafe { display_raw.create_semaphore(&semaphore_info, None)? });
            frame_finished.push(unsafe { display_raw.create_semaphore(&semaphore_info, None)? });
        }

        let shader_cache = ShaderCache::new(&desc.shader_cache_dir)?;

        Ok(Self {
            devices,
            display_device_index,
            frame_fences,
            frame_available,
            frame_finished,
            frame_counters: RwLock::new(FrameCounters {
                frame_counter: 0,
                frame_index: 0,
            }),
            frame_end_actions: Mutex::new((0..MAX_FRAMES_IN_FLIGHT).map(|_| Vec::new()).collect()),
            display: Mutex::new(None),
            shader_cache,
            instance,
        })
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> &Arc<Device> {
        &self.devices[id as usize]
    }

    pub fn display_device(&self) -> &Arc<Device> {
        &self.devices[self.display_device_index]
    }

    pub fn device_mask(&self) -> DeviceMask {
        DeviceMask::all(self.devices.len())
    }

    pub fn is_ray_tracing_supported(&self) -> bool {
        self.devices
            .iter()
            .all(|device| device.is_ray_tracing_supported())
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shader_cache
    }

    /// Raw instance handle for external display integrations that create
    /// their own surfaces and swapchains.
    pub fn vulkan_instance(&self) -> &ash::Instance {
        &self.instance.raw
    }

    pub fn vulkan_entry(&self) -> &ash::Entry {
        &self.instance.entry
    }

    pub fn set_display_target(&self, target: Box<dyn DisplayTarget>) {
        *self.display.lock() = Some(target);
    }

    pub fn get_frame_counter(&self) -> u64 {
        self.frame_counters.read().frame_counter
    }

    pub fn get_frame_index(&self) -> u32 {
        self.frame_counters.read().frame_index
    }

    /// Waits until the frame slot can be reused, flushes its deferred
    /// destruction queue and frame-finish callbacks, then prepares a fresh
    /// display image through the display hook.
    pub fn begin_frame(&self) -> Result<Frame> {
        let (frame_counter, frame_index) = {
            let counters = self.frame_counters.read();
            (counters.frame_counter, counters.frame_index)
        };

        let display_raw = &self.display_device().raw;
        let fence = self.frame_fences[frame_index as usize];
        unsafe {
            display_raw
                .wait_for_fences(&[fence], true, u64::MAX)
                .with_context(|| "Frame fence wait failed (device lost?)")?;
            display_raw.reset_fences(&[fence])?;
        }

        // Everything recorded MAX_FRAMES_IN_FLIGHT frames ago has now
        // certainly completed on device.
        let completed = frame_counter.saturating_sub(MAX_FRAMES_IN_FLIGHT as u64);
        for device in &self.devices {
            device.frame_counter.store(frame_counter, Ordering::Relaxed);
            if frame_counter >= MAX_FRAMES_IN_FLIGHT as u64 {
                device.flush_deferred_destruction(completed);
            }
            let period = device.timestamp_period();
            device.timing.lock().collect(&device.raw, frame_index, period);
        }

        let actions = std::mem::take(&mut self.frame_end_actions.lock()[frame_index as usize]);
        for action in actions {
            action();
        }

        let mut display = self.display.lock();
        let (swapchain_index, available) = if let Some(target) = display.as_mut() {
            let semaphore = self.frame_available[frame_index as usize];
            let index = target.prepare_next_image(frame_index, semaphore)?;
            (
                index,
                Some(Dependency {
                    semaphore,
                    value: None,
                    stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                }),
            )
        } else {
            (0, None)
        };

        Ok(Frame {
            frame_index,
            swapchain_index,
            frame_counter,
            available,
        })
    }

    /// Submits the terminal signal with all declared dependencies and lets
    /// the display target present.
    pub fn end_frame(&self, frame: Frame, deps: &Dependencies) -> Result<()> {
        let device = self.display_device();
        let fence = self.frame_fences[frame.frame_index as usize];

        let waits = deps.to_submit_semaphores();
        let mut signals = Vec::new();
        let mut display = self.display.lock();
        if display.is_some() {
            signals.push(SubmitSemaphore {
                semaphore: self.frame_finished[frame.frame_index as usize],
                value: None,
                stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            });
        }
        device.queue_submit(&device.graphics_queue, &[], &waits, &signals, fence)?;

        if let Some(target) = display.as_mut() {
            target.finish_image(
                frame.frame_index,
                frame.swapchain_index,
                self.frame_finished[frame.frame_index as usize],
            )?;
        }

        let mut counters = self.frame_counters.write();
        counters.frame_counter += 1;
        counters.frame_index = (counters.frame_counter % MAX_FRAMES_IN_FLIGHT as u64) as u32;
        Ok(())
    }

    /// Queues a function to be called when the current frame is guaranteed
    /// to be finished on the GPU side.
    pub fn queue_frame_finish_callback<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let frame_index = self.frame_counters.read().frame_index;
        self.frame_end_actions.lock()[frame_index as usize].push(Box::new(action));
    }

    /// Forces all devices to idle, then drains the deferred-destroy queues
    /// and remaining frame-finish callbacks.
    pub fn sync(&self) -> Result<()> {
        for device in &self.devices {
            device.wait_idle()?;
        }
        for device in &self.devices {
            device.flush_deferred_destruction(u64::MAX);
        }
        let mut all_actions = self.frame_end_actions.lock();
        for actions in all_actions.iter_mut() {
            for action in std::mem::take(actions) {
                action();
            }
        }
        Ok(())
    }

    pub fn get_timing(&self, id: DeviceId, name: &str) -> Option<f32> {
        self.devices[id as usize].timing.lock().get_time(name)
    }

    pub fn print_timing(&self) {
        for device in &self.devices {
            device.timing.lock().print(&device.name);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.sync();
        let display_raw = &self.devices[self.display_device_index].raw;
        unsafe {
            for fence in self.frame_fences.drain(..) {
                display_raw.destroy_fence(fence, None);
            }
            for semaphore in self.frame_available.drain(..) {
                display_raw.destroy_semaphore(semaphore, None);
            }
            for semaphore in self.frame_finished.drain(..) {
                display_raw.destroy_semaphore(semaphore, None);
            }
        }
    }
}
