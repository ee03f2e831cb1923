use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use ash::vk;

use crate::vulkan::{
    context::Context,
    device::{DeviceId, DeviceMask},
    resource::{Sampler, SamplerDescriptor, Texture},
};

use super::{CombinedTexture, Scene};

/// Maps (texture, sampler) pairs to compact integer indices, stable within a
/// frame. Shaders reference material textures only through these indices.
pub struct SamplerTable {
    default_sampler: Arc<Sampler>,
    table: HashMap<(usize, usize), i32>,
    entries: Vec<(Arc<Texture>, Arc<Sampler>)>,
}

impl SamplerTable {
    pub fn new(ctx: &Context, mask: DeviceMask) -> Result<Self> {
        let default_sampler = Arc::new(Sampler::new(ctx, mask, SamplerDescriptor::new())?);
        Ok(Self {
            default_sampler,
            table: HashMap::new(),
            entries: Vec::new(),
        })
    }

    /// Rebuilds the table from every material texture in the scene.
    pub fn update_scene(&mut self, scene: &Scene) {
        self.table.clear();
        self.entries.clear();
        for object in scene.objects() {
            let material = &object.material;
            self.register(&material.albedo_texture);
            self.register(&material.metallic_roughness_texture);
            self.register(&material.normal_texture);
            self.register(&material.emission_texture);
        }
    }

    fn key(&self, combined: &CombinedTexture) -> ((usize, usize), Arc<Sampler>) {
        let sampler = combined
            .1
            .clone()
            .unwrap_or_else(|| self.default_sampler.clone());
        (
            (
                Arc::as_ptr(&combined.0) as usize,
                Arc::as_ptr(&sampler) as usize,
            ),
            sampler,
        )
    }

    fn register(&mut self, combined: &Option<CombinedTexture>) {
        let Some(combined) = combined else {
            return;
        };
        let (key, sampler) = self.key(combined);
        if !self.table.contains_key(&key) {
            self.table.insert(key, self.entries.len() as i32);
            self.entries.push((combined.0.clone(), sampler));
        }
    }

    /// Index of a registered pair; -1 when no texture is assigned.
    pub fn find_texture_index(&self, combined: &Option<CombinedTexture>) -> Result<i32> {
        let Some(combined) = combined else {
            return Ok(-1);
        };
        let (key, _) = self.key(combined);
        self.table
            .get(&key)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Sampler table is out of date"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor infos in index order, for the material texture array
    /// binding.
    pub fn image_infos(&self, id: DeviceId) -> Vec<vk::DescriptorImageInfo> {
        self.entries
            .iter()
            .map(|(texture, sampler)| {
                vk::DescriptorImageInfo::default()
                    .sampler(sampler.raw(id))
                    .image_view(texture.view(id))
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect()
    }
}
