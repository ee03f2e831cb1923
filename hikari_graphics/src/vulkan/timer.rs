use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result;
use ash::vk;

use super::device::{Device, DeviceId, MAX_FRAMES_IN_FLIGHT};

/// Per-device timestamp bookkeeping. Each registered timer reserves two
/// query slots (begin and end); slot ids are not reused while a command
/// buffer referencing them may still be in flight, which holds because
/// unregistration only happens on timer drop and collection happens after
/// the frame fence.
pub(crate) struct TimingData {
    pools: Vec<vk::QueryPool>,
    max_timestamps: u32,
    available: BTreeSet<u32>,
    reserved: HashMap<u32, String>,
    times: HashMap<String, f32>,
}

impl TimingData {
    pub(crate) fn new(raw: &ash::Device, max_timestamps: u32) -> Result<Self> {
        let mut pools = Vec::new();
        if max_timestamps > 0 {
            for _ in 0..MAX_FRAMES_IN_FLIGHT {
                let info = vk::QueryPoolCreateInfo::default()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(max_timestamps * 2);
                pools.push(unsafe { raw.create_query_pool(&info, None)? });
            }
        }
        Ok(Self {
            pools,
            max_timestamps,
            available: (0..max_timestamps).collect(),
            reserved: HashMap::new(),
            times: HashMap::new(),
        })
    }

    pub(crate) fn destroy(&mut self, raw: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { raw.destroy_query_pool(pool, None) };
        }
    }

    pub(crate) fn register(&mut self, name: &str) -> Result<Option<u32>> {
        if self.max_timestamps == 0 {
            return Ok(None);
        }
        let id = *self
            .available
            .iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Timestamp pool exhausted, cannot register {name}"))?;
        self.available.remove(&id);
        self.reserved.insert(id, name.to_owned());
        Ok(Some(id))
    }

    pub(crate) fn unregister(&mut self, id: u32) {
        self.reserved.remove(&id);
        self.available.insert(id);
    }

    pub(crate) fn pool(&self, frame_index: u32) -> vk::QueryPool {
        self.pools[frame_index as usize]
    }

    /// Reads back the timestamps recorded into the given frame slot. Only
    /// valid once the slot's fence has been waited on.
    pub(crate) fn collect(&mut self, raw: &ash::Device, frame_index: u32, timestamp_period: f32) {
        if self.pools.is_empty() || self.reserved.is_empty() {
            return;
        }
        let pool = self.pools[frame_index as usize];
        let mut data = vec![[0u64; 2]; (self.max_timestamps * 2) as usize];
        let result = unsafe {
            raw.get_query_pool_results(
                pool,
                0,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
            )
        };
        if result.is_err() {
            return;
        }
        for (&id, name) in &self.reserved {
            let begin = data[(id * 2) as usize];
            let end = data[(id * 2 + 1) as usize];
            if begin[1] == 0 || end[1] == 0 {
                continue;
            }
            let elapsed_ns = end[0].saturating_sub(begin[0]) as f64 * timestamp_period as f64;
            self.times
                .insert(name.clone(), (elapsed_ns / 1_000_000.0) as f32);
        }
    }

    pub(crate) fn get_time(&self, name: &str) -> Option<f32> {
        self.times.get(name).copied()
    }

    pub(crate) fn print(&self, device_name: &str) {
        let mut entries: Vec<_> = self.times.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (name, ms) in entries {
            log::info!("[{device_name}] {name}: {ms:.3} ms");
        }
    }
}

/// GPU timer measuring one span per frame per device. Registration reserves
/// query slots for the timer's lifetime.
pub struct Timer {
    ids: Vec<(Arc<Device>, Option<u32>)>,
}

impl Timer {
    pub fn new<'a>(
        devices: impl IntoIterator<Item = &'a Arc<Device>>,
        name: &str,
    ) -> Result<Self> {
        let mut ids = Vec::new();
        for device in devices {
            let id = device.timing.lock().register(name)?;
            ids.push((device.clone(), id));
        }
        Ok(Self { ids })
    }

    pub fn begin(&self, cb: vk::CommandBuffer, id: DeviceId, frame_index: u32) {
        self.write(cb, id, frame_index, vk::PipelineStageFlags::TOP_OF_PIPE, 0);
    }

    pub fn end(&self, cb: vk::CommandBuffer, id: DeviceId, frame_index: u32) {
        self.write(
            cb,
            id,
            frame_index,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            1,
        );
    }

    fn write(
        &self,
        cb: vk::CommandBuffer,
        id: DeviceId,
        frame_index: u32,
        stage: vk::PipelineStageFlags,
        offset: u32,
    ) {
        let Some((device, Some(timer_id))) = self
            .ids
            .iter()
            .find(|(d, _)| d.id == id)
            .map(|(d, t)| (d, *t))
        else {
            return;
        };
        let timing = device.timing.lock();
        let pool = timing.pool(frame_index);
        let query_id = timer_id * 2 + offset;
        unsafe {
            if offset == 0 {
                device.raw.cmd_reset_query_pool(cb, pool, query_id, 2);
            }
            device.raw.cmd_write_timestamp(cb, stage, pool, query_id);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        for (device, id) in &self.ids {
            if let Some(id) = *id {
                device.timing.lock().unregister(id);
            }
        }
    }
}
