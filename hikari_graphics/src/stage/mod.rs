/*! Stage framework.
 *
 * Stages are steps of the rendering pipeline that can be considered
 * separate, reusable modules. Each stage owns cached pre-recorded command
 * buffers (one per frame slot, optionally one per swapchain image) and a
 * timeline semaphore; `run` submits the cached work with one wait per input
 * dependency and returns a dependency on the stage's own semaphore at the
 * current frame counter.
 *
 * No implicit cross-stage barrier is inserted: each stage's command buffers
 * must carry the pipeline barriers its resource accesses require.
 */

use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;

use crate::vulkan::{
    command::CommandPool,
    context::Frame,
    device::{Device, PendingDestruction, SubmitSemaphore, MAX_FRAMES_IN_FLIGHT},
    Semaphore, SemaphoreType,
};

pub use crate::vulkan::context::{Dependencies, Dependency};

pub mod raster;
pub mod restir;
pub mod scene;
pub mod shadow;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferStrategy {
    PerFrame,
    PerFrameAndSwapchainImage { image_count: u32 },
}

impl CommandBufferStrategy {
    fn buffer_count(&self) -> usize {
        match self {
            CommandBufferStrategy::PerFrame => MAX_FRAMES_IN_FLIGHT,
            CommandBufferStrategy::PerFrameAndSwapchainImage { image_count } => {
                MAX_FRAMES_IN_FLIGHT * (*image_count as usize)
            }
        }
    }

    fn buffer_index(&self, frame_index: u32, swapchain_index: u32) -> usize {
        match self {
            CommandBufferStrategy::PerFrame => frame_index as usize,
            CommandBufferStrategy::PerFrameAndSwapchainImage { image_count } => {
                (frame_index * image_count + swapchain_index) as usize
            }
        }
    }
}

/// Per-device stage machinery: the command pool, the cached command buffers
/// and the timeline semaphore other stages wait on.
pub struct StageCore {
    device: Arc<Device>,
    pool: CommandPool,
    command_buffers: Vec<Option<vk::CommandBuffer>>,
    finished: Semaphore,
    strategy: CommandBufferStrategy,
}

impl StageCore {
    pub fn new(device: Arc<Device>, strategy: CommandBufferStrategy) -> Result<Self> {
        let pool = CommandPool::new(device.clone(), device.graphics_queue.family_index)?;
        let finished = Semaphore::new(device.clone(), SemaphoreType::Timeline)?;
        Ok(Self {
            device,
            pool,
            command_buffers: (0..strategy.buffer_count()).map(|_| None).collect(),
            finished,
            strategy,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// True when the slot has no recorded commands yet.
    pub fn needs_recording(&self, frame_index: u32, swapchain_index: u32) -> bool {
        self.command_buffers[self.strategy.buffer_index(frame_index, swapchain_index)].is_none()
    }

    /// Begins recording the cached command buffer for one slot, replacing
    /// whatever was recorded there. The replaced buffer is released once the
    /// frames referencing it have finished.
    pub fn begin_commands(
        &mut self,
        frame_index: u32,
        swapchain_index: u32,
    ) -> Result<vk::CommandBuffer> {
        let index = self.strategy.buffer_index(frame_index, swapchain_index);
        if let Some(old) = self.command_buffers[index].take() {
            self.device
                .schedule_destruction(PendingDestruction::CommandBuffer(self.pool.raw, old));
        }
        let cb = self.pool.allocate_command_buffers(1)?[0];
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device.raw.begin_command_buffer(cb, &begin_info)?;
        }
        self.command_buffers[index] = Some(cb);
        Ok(cb)
    }

    pub fn end_commands(&mut self, cb: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device.raw.end_command_buffer(cb)?;
        }
        Ok(())
    }

    /// Drops every cached command buffer, forcing re-recording.
    pub fn clear_commands(&mut self) {
        for slot in &mut self.command_buffers {
            if let Some(cb) = slot.take() {
                self.device
                    .schedule_destruction(PendingDestruction::CommandBuffer(self.pool.raw, cb));
            }
        }
    }

    pub fn finished_semaphore(&self) -> vk::Semaphore {
        self.finished.raw()
    }

    /// Submits the cached command buffer of the frame's slot, waiting on the
    /// given dependencies and signalling this stage's timeline semaphore at
    /// the frame counter.
    pub fn submit(&self, frame: &Frame, deps: &Dependencies) -> Result<Dependency> {
        let index = self
            .strategy
            .buffer_index(frame.frame_index, frame.swapchain_index);
        let cb = self.command_buffers[index]
            .with_context(|| "Stage command buffer was not recorded before submission")?;

        let signal_value = frame.frame_counter + 1;
        let waits = deps.to_submit_semaphores();
        let signals = [SubmitSemaphore {
            semaphore: self.finished.raw(),
            value: Some(signal_value),
            stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
        }];
        self.device.queue_submit(
            &self.device.graphics_queue,
            &[cb],
            &waits,
            &signals,
            vk::Fence::null(),
        )?;

        Ok(Dependency {
            semaphore: self.finished.raw(),
            value: Some(signal_value),
            stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
        })
    }
}
