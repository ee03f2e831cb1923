/*! Per-pixel deferred buffers shared between the raster fill, the ReSTIR
 * core and the temporal history.
 *
 * Spatial entries are in world space unless noted otherwise, which keeps
 * temporal and multi-viewport algorithms in one reference frame.
 */

use anyhow::Result;
use ash::vk;

use crate::vulkan::{
    context::Context,
    device::{DeviceId, DeviceMask},
    resource::{Texture, TextureDescriptor},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GBufferEntry {
    /// RGB: total radiance in linear color space.
    Color,
    /// RGB: demodulated diffuse radiance.
    Diffuse,
    /// RGB: demodulated specular/reflection radiance.
    Reflection,
    /// RGB: material albedo in linear color space.
    Albedo,
    /// R: metallic, G: roughness.
    Material,
    /// RG: octahedral-packed world-space shading normal.
    Normal,
    /// RG: octahedral-packed world-space geometric normal.
    FlatNormal,
    /// R: mean curvature estimate around the shade point.
    Curvature,
    /// RGB: emitted radiance of the surface itself.
    Emission,
    /// RGB: world-space position.
    Position,
    /// RG: screen position of the same point in the previous frame, [0, 1].
    ScreenMotion,
    /// R: instance index covering the pixel.
    InstanceId,
    /// R: temporal gradient estimate for gradient-guided denoisers.
    TemporalGradient,
    /// R: per-pixel sample confidence, persists across ReSTIR passes.
    Confidence,
    /// Hyperbolic view-space depth.
    Depth,
}

impl GBufferEntry {
    pub const ALL: [GBufferEntry; 15] = [
        GBufferEntry::Color,
        GBufferEntry::Diffuse,
        GBufferEntry::Reflection,
        GBufferEntry::Albedo,
        GBufferEntry::Material,
        GBufferEntry::Normal,
        GBufferEntry::FlatNormal,
        GBufferEntry::Curvature,
        GBufferEntry::Emission,
        GBufferEntry::Position,
        GBufferEntry::ScreenMotion,
        GBufferEntry::InstanceId,
        GBufferEntry::TemporalGradient,
        GBufferEntry::Confidence,
        GBufferEntry::Depth,
    ];

    pub fn default_format(self) -> vk::Format {
        match self {
            GBufferEntry::Color
            | GBufferEntry::Diffuse
            | GBufferEntry::Reflection
            | GBufferEntry::Albedo
            | GBufferEntry::Emission => vk::Format::R16G16B16A16_SFLOAT,
            GBufferEntry::Material => vk::Format::R16G16_UNORM,
            GBufferEntry::Normal | GBufferEntry::FlatNormal => vk::Format::R16G16_SNORM,
            GBufferEntry::Curvature
            | GBufferEntry::TemporalGradient
            | GBufferEntry::Confidence => vk::Format::R16_SFLOAT,
            GBufferEntry::Position => vk::Format::R32G32B32A32_SFLOAT,
            GBufferEntry::ScreenMotion => vk::Format::R32G32_SFLOAT,
            GBufferEntry::InstanceId => vk::Format::R32_SINT,
            GBufferEntry::Depth => vk::Format::D32_SFLOAT,
        }
    }

    pub fn is_depth(self) -> bool {
        self == GBufferEntry::Depth
    }

    fn index(self) -> usize {
        GBufferEntry::ALL.iter().position(|&e| e == self).unwrap()
    }
}

/// Which entries to create, with per-entry format and usage overrides. Used
/// when several parties take part in deciding the wanted entries.
#[derive(Clone)]
pub struct GBufferSpec {
    entries: [Option<(vk::Format, vk::ImageUsageFlags)>; GBufferEntry::ALL.len()],
}

impl Default for GBufferSpec {
    fn default() -> Self {
        Self {
            entries: [None; GBufferEntry::ALL.len()],
        }
    }
}

impl GBufferSpec {
    pub fn add(&mut self, entry: GBufferEntry) -> &mut Self {
        self.add_with(
            entry,
            entry.default_format(),
            if entry.is_depth() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            } else {
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT
            },
        )
    }

    pub fn add_with(
        &mut self,
        entry: GBufferEntry,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> &mut Self {
        self.entries[entry.index()] = Some((format, usage));
        self
    }

    pub fn set_all_usage(&mut self, usage: vk::ImageUsageFlags) {
        for entry in self.entries.iter_mut().flatten() {
            entry.1 = usage;
        }
    }

    pub fn contains(&self, entry: GBufferEntry) -> bool {
        self.entries[entry.index()].is_some()
    }

    pub fn present_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

/// View over one entry of a G-buffer for one device, with the layout the
/// host currently believes the image to be in.
#[derive(Clone, Copy)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub size: (u32, u32),
    pub layer_count: u32,
    pub format: vk::Format,
    pub layout: vk::ImageLayout,
}

/// Per-entry render targets of one G-buffer. Entries that were not created
/// are `None`; algorithms adapt to what is present.
pub struct GBufferTarget {
    targets: [Option<RenderTarget>; GBufferEntry::ALL.len()],
    size: (u32, u32),
    layer_count: u32,
}

impl GBufferTarget {
    pub fn get(&self, entry: GBufferEntry) -> Option<&RenderTarget> {
        self.targets[entry.index()].as_ref()
    }

    pub fn get_mut(&mut self, entry: GBufferEntry) -> Option<&mut RenderTarget> {
        self.targets[entry.index()].as_mut()
    }

    pub fn contains(&self, entry: GBufferEntry) -> bool {
        self.targets[entry.index()].is_some()
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn entry_count(&self) -> usize {
        self.targets.iter().flatten().count()
    }

    pub fn visit<F: FnMut(GBufferEntry, &RenderTarget)>(&self, mut f: F) {
        for (entry, target) in GBufferEntry::ALL.iter().zip(self.targets.iter()) {
            if let Some(target) = target {
                f(*entry, target);
            }
        }
    }

    pub fn visit_mut<F: FnMut(GBufferEntry, &mut RenderTarget)>(&mut self, mut f: F) {
        for (entry, target) in GBufferEntry::ALL.iter().zip(self.targets.iter_mut()) {
            if let Some(target) = target {
                f(*entry, target);
            }
        }
    }

    pub fn spec(&self) -> GBufferSpec {
        let mut spec = GBufferSpec::default();
        self.visit(|entry, target| {
            spec.add_with(entry, target.format, vk::ImageUsageFlags::STORAGE);
        });
        spec
    }
}

/// Owns the textures behind a G-buffer, replicated over a device mask.
pub struct GBufferTexture {
    textures: Vec<Option<Texture>>,
    size: (u32, u32),
    layer_count: u32,
}

impl GBufferTexture {
    pub fn new(
        ctx: &Context,
        mask: DeviceMask,
        size: (u32, u32),
        layer_count: u32,
        spec: &GBufferSpec,
    ) -> Result<Self> {
        let mut textures = Vec::with_capacity(GBufferEntry::ALL.len());
        for entry in GBufferEntry::ALL {
            match spec.entries[entry.index()] {
                Some((format, usage)) => {
                    let desc = TextureDescriptor::new_2d(size, format, usage)
                        .array_layers(layer_count)
                        .initial_layout(if entry.is_depth() {
                            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                        } else {
                            vk::ImageLayout::GENERAL
                        });
                    textures.push(Some(Texture::new(ctx, mask, desc)?));
                }
                None => textures.push(None),
            }
        }
        Ok(Self {
            textures,
            size,
            layer_count,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn texture(&self, entry: GBufferEntry) -> Option<&Texture> {
        self.textures[entry.index()].as_ref()
    }

    pub fn contains(&self, entry: GBufferEntry) -> bool {
        self.textures[entry.index()].is_some()
    }

    /// Target covering all layers of every entry.
    pub fn array_target(&self, id: DeviceId) -> GBufferTarget {
        self.target_with(id, 0, self.layer_count)
    }

    pub fn layer_target(&self, id: DeviceId, layer: u32) -> GBufferTarget {
        self.target_with(id, layer, 1)
    }

    fn target_with(&self, id: DeviceId, base_layer: u32, layer_count: u32) -> GBufferTarget {
        let mut targets = [None; GBufferEntry::ALL.len()];
        for (entry, texture) in GBufferEntry::ALL.iter().zip(self.textures.iter()) {
            if let Some(texture) = texture {
                targets[entry.index()] = Some(RenderTarget {
                    image: texture.image(id),
                    view: texture.layer_view(id, base_layer, layer_count),
                    size: self.size,
                    layer_count,
                    format: texture.format(),
                    layout: texture.initial_layout(),
                });
            }
        }
        GBufferTarget {
            targets,
            size: self.size,
            layer_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_tracks_present_entries() {
        let mut spec = GBufferSpec::default();
        assert_eq!(spec.present_count(), 0);
        spec.add(GBufferEntry::Color);
        spec.add(GBufferEntry::Depth);
        spec.add(GBufferEntry::Normal);
        assert_eq!(spec.present_count(), 3);
        assert!(spec.contains(GBufferEntry::Depth));
        assert!(!spec.contains(GBufferEntry::Albedo));
    }

    #[test]
    fn entry_indices_are_unique_and_stable() {
        for (i, entry) in GBufferEntry::ALL.iter().enumerate() {
            assert_eq!(entry.index(), i);
        }
    }

    #[test]
    fn depth_entry_uses_depth_format() {
        assert_eq!(
            GBufferEntry::Depth.default_format(),
            vk::Format::D32_SFLOAT
        );
        assert!(GBufferEntry::Depth.is_depth());
        assert!(!GBufferEntry::Position.is_depth());
    }
}
