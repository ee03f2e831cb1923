use nalgebra::Vector2;

pub fn align_up_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn next_power_of_two(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Low-discrepancy R2 sequence, used for sub-pixel jitter in temporal reuse.
/// Index-based so that the jitter is reproducible for a given sample index.
pub fn r2_noise(index: u64) -> Vector2<f32> {
    const G: f64 = 1.32471795724474602596;
    const A1: f64 = 1.0 / G;
    const A2: f64 = 1.0 / (G * G);
    let i = index as f64;
    Vector2::new(
        ((0.5 + A1 * i).fract()) as f32,
        ((0.5 + A2 * i).fract()) as f32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_to_rounds_to_multiples() {
        assert_eq!(align_up_to(0, 64), 0);
        assert_eq!(align_up_to(1, 64), 64);
        assert_eq!(align_up_to(64, 64), 64);
        assert_eq!(align_up_to(65, 256), 256);
    }

    #[test]
    fn next_power_of_two_handles_zero() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(129), 256);
    }

    #[test]
    fn r2_noise_is_deterministic_and_in_unit_square() {
        for i in 0..256 {
            let a = r2_noise(i);
            let b = r2_noise(i);
            assert_eq!(a, b);
            assert!(a.x >= 0.0 && a.x < 1.0);
            assert!(a.y >= 0.0 && a.y < 1.0);
        }
        assert_ne!(r2_noise(1), r2_noise(2));
    }
}
