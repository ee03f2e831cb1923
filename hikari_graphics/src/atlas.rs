use anyhow::Result;
use ash::vk;

use crate::{
    rect_packer::{Rect, RectPacker},
    vulkan::{
        context::Context,
        device::DeviceMask,
        resource::{Texture, TextureDescriptor},
    },
};

/// Texture atlas: a texture plus a rectangle packer. Sub-texture layouts are
/// repacked incrementally and the backing texture doubles in size whenever
/// the rects stop fitting. The atlas never shrinks.
pub struct Atlas {
    texture: Texture,
    rects: Vec<(i32, i32, u32, u32)>,
}

fn sizes_unchanged(rects: &[(i32, i32, u32, u32)], sub_sizes: &[(u32, u32)]) -> bool {
    rects.len() == sub_sizes.len()
        && rects
            .iter()
            .zip(sub_sizes.iter())
            .all(|(&(_, _, w, h), &(sw, sh))| w == sw && h == sh)
}

/// Smallest plausible power-of-two square side for the given padded sizes.
fn initial_atlas_side(sub_sizes: &[(u32, u32)], pad_size: u32) -> u32 {
    let mut min_side = 0u32;
    let mut min_area = 0u32;
    for &(w, h) in sub_sizes {
        let (w, h) = (w + pad_size, h + pad_size);
        min_side = min_side.max(w).max(h);
        min_area += w * h;
    }
    let mut scale = 64u32;
    while scale < min_side || scale * scale < min_area {
        scale *= 2;
    }
    scale
}

impl Atlas {
    pub fn new(
        ctx: &Context,
        mask: DeviceMask,
        sub_sizes: &[(u32, u32)],
        pad_size: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let mut atlas = Self {
            texture: Texture::new(ctx, mask, TextureDescriptor::new_2d((1, 1), format, usage))?,
            rects: Vec::new(),
        };
        atlas.set_sub_textures(sub_sizes, pad_size)?;
        Ok(atlas)
    }

    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn size(&self) -> (u32, u32) {
        self.texture.size()
    }

    pub fn sub_texture_count(&self) -> usize {
        self.rects.len()
    }

    /// Rect of sub-texture `i` in pixels: (x, y, width, height).
    pub fn rect_px(&self, i: usize) -> (i32, i32, u32, u32) {
        self.rects[i]
    }

    /// Rect of sub-texture `i` normalized to the atlas size.
    pub fn rect(&self, i: usize) -> [f32; 4] {
        let (x, y, w, h) = self.rects[i];
        let (aw, ah) = self.texture.size();
        [
            x as f32 / aw as f32,
            y as f32 / ah as f32,
            w as f32 / aw as f32,
            h as f32 / ah as f32,
        ]
    }

    /// Repacks the atlas for the given sub-texture sizes. Returns false if
    /// nothing changed (same sizes as the previous call), true if the layout
    /// was rebuilt, in which case the texture contents are stale and must be
    /// re-rendered.
    pub fn set_sub_textures(&mut self, sub_sizes: &[(u32, u32)], pad_size: u32) -> Result<bool> {
        if sizes_unchanged(&self.rects, sub_sizes) {
            return Ok(false);
        }

        // Figure out the attempted texture size: the smallest plausible
        // power-of-two square unless the atlas is already larger.
        let mut attempt = self.texture.size();
        if attempt.0 <= 1 || attempt.1 <= 1 {
            let side = initial_atlas_side(sub_sizes, pad_size);
            attempt = (side, side);
        }

        // Attempt to fit all rects into continually larger areas.
        self.rects.clear();
        loop {
            let mut packer = RectPacker::new(attempt.0 as i32, attempt.1 as i32, false);
            let mut rects: Vec<Rect> = sub_sizes
                .iter()
                .map(|&(w, h)| Rect::new((w + pad_size) as i32, (h + pad_size) as i32))
                .collect();

            if packer.pack_all(&mut rects, false) != rects.len() {
                attempt = (attempt.0 * 2, attempt.1 * 2);
                continue;
            }

            // Stored rects exclude the padding so repack detection can
            // compare against the caller's sizes directly.
            for r in &rects {
                self.rects
                    .push((r.x, r.y, r.w as u32 - pad_size, r.h as u32 - pad_size));
            }
            break;
        }

        if attempt != self.texture.size() {
            self.texture.resize(attempt)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_sizes_are_detected_as_noop() {
        let rects = vec![(0, 0, 32, 32), (40, 0, 16, 48)];
        assert!(sizes_unchanged(&rects, &[(32, 32), (16, 48)]));
        assert!(!sizes_unchanged(&rects, &[(32, 32), (16, 47)]));
        assert!(!sizes_unchanged(&rects, &[(32, 32)]));
    }

    #[test]
    fn initial_side_covers_largest_rect_and_total_area() {
        // A 100px-wide rect forces at least 128.
        assert_eq!(initial_atlas_side(&[(100, 10)], 0), 128);
        // Total area of 16 64x64 rects needs at least 256x256.
        let sizes = vec![(64, 64); 16];
        assert_eq!(initial_atlas_side(&sizes, 0), 256);
        // Padding counts towards both checks.
        assert_eq!(initial_atlas_side(&[(63, 63)], 2), 128);
    }
}
