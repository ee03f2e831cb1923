use std::sync::Arc;

use nalgebra::Vector3;

use crate::vulkan::resource::Texture;

/// One alias table entry per environment map texel. `probability` is the
/// acceptance threshold in fixed point; on rejection the sample falls
/// through to `alias`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct AliasTableEntry {
    pub probability: u32,
    pub alias: u32,
    pub pdf: f32,
    pub alias_pdf: f32,
}

/// Builds an alias table with the Vose method, so the shaders can draw
/// texels proportionally to their contribution in constant time.
pub fn build_alias_table(weights: &[f32]) -> Vec<AliasTableEntry> {
    let count = weights.len();
    if count == 0 {
        return Vec::new();
    }
    let total: f64 = weights.iter().map(|&w| w.max(0.0) as f64).sum();
    if total <= 0.0 {
        // Degenerate input; sample uniformly.
        return weights
            .iter()
            .enumerate()
            .map(|(i, _)| AliasTableEntry {
                probability: u32::MAX,
                alias: i as u32,
                pdf: 1.0 / count as f32,
                alias_pdf: 1.0 / count as f32,
            })
            .collect();
    }

    let average = total / count as f64;
    let mut entries: Vec<AliasTableEntry> = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| AliasTableEntry {
            probability: u32::MAX,
            alias: i as u32,
            pdf: (w.max(0.0) as f64 / average) as f32,
            alias_pdf: 0.0,
        })
        .collect();

    let mut small: Vec<usize> = Vec::new();
    let mut large: Vec<usize> = Vec::new();
    let mut scaled: Vec<f64> = weights
        .iter()
        .map(|&w| w.max(0.0) as f64 / average)
        .collect();
    for (i, &p) in scaled.iter().enumerate() {
        if p < 1.0 {
            small.push(i);
        } else {
            large.push(i);
        }
    }

    while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
        small.pop();
        entries[s].probability = (scaled[s] * u32::MAX as f64) as u32;
        entries[s].alias = l as u32;
        entries[s].alias_pdf = entries[l].pdf;

        scaled[l] = (scaled[l] + scaled[s]) - 1.0;
        if scaled[l] < 1.0 {
            large.pop();
            small.push(l);
        }
    }

    // Whatever remains is numerically 1.0: always accepted.
    for &i in small.iter().chain(large.iter()) {
        entries[i].probability = u32::MAX;
        entries[i].alias = i as u32;
        entries[i].alias_pdf = entries[i].pdf;
    }

    // The stored pdf is relative to a uniform distribution over the texels;
    // shaders multiply by the texel solid angle.
    for entry in &mut entries {
        entry.pdf /= count as f32;
        entry.alias_pdf /= count as f32;
    }
    entries
}

/// Image-based environment light. The alias table is rebuilt from the texel
/// luminances whenever the texture changes.
pub struct EnvironmentMap {
    texture: Arc<Texture>,
    factor: Vector3<f32>,
    alias_table: Vec<AliasTableEntry>,
}

impl EnvironmentMap {
    /// `luminances` holds one weight per texel of the texture, in scanline
    /// order, used for importance sampling.
    pub fn new(texture: Arc<Texture>, factor: Vector3<f32>, luminances: &[f32]) -> Self {
        let alias_table = build_alias_table(luminances);
        Self {
            texture,
            factor,
            alias_table,
        }
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn factor(&self) -> Vector3<f32> {
        self.factor
    }

    pub fn alias_table(&self) -> &[AliasTableEntry] {
        &self.alias_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_weights_build_empty_table() {
        assert!(build_alias_table(&[]).is_empty());
    }

    #[test]
    fn uniform_weights_always_accept() {
        let table = build_alias_table(&[1.0; 8]);
        assert_eq!(table.len(), 8);
        for (i, entry) in table.iter().enumerate() {
            assert_eq!(entry.probability, u32::MAX);
            assert_eq!(entry.alias, i as u32);
        }
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let table = build_alias_table(&[0.0; 4]);
        for entry in &table {
            assert_eq!(entry.probability, u32::MAX);
            assert!((entry.pdf - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn alias_sampling_reproduces_distribution() {
        let weights = [1.0f32, 3.0, 0.5, 0.0, 2.5];
        let table = build_alias_table(&weights);
        let total: f32 = weights.iter().sum();

        // Emulate the shader-side sampling: pick a slot uniformly, accept
        // with the stored probability, otherwise take the alias.
        let mut counts = [0u64; 5];
        let samples = 200_000u64;
        let mut state = 0x2545f491u32;
        let mut rand = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        for _ in 0..samples {
            let slot = (rand() % 5) as usize;
            let accept = rand();
            if (accept as u64) < (table[slot].probability as u64).max(1) {
                counts[slot] += 1;
            } else {
                counts[table[slot].alias as usize] += 1;
            }
        }

        for (i, &w) in weights.iter().enumerate() {
            let expected = w / total;
            let measured = counts[i] as f32 / samples as f32;
            assert!(
                (measured - expected).abs() < 0.01,
                "texel {i}: expected {expected}, measured {measured}"
            );
        }
    }
}
