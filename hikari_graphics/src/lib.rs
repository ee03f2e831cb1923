/*! Real-time path tracing renderer core.
 *
 * The `vulkan` module wraps the raw API into device/context/resource types,
 * `scene` holds the CPU-side scene model, and `stage` contains the renderer
 * passes that mirror scene state onto the GPU and resolve lighting with
 * reservoir-based spatiotemporal resampling.
 */

pub mod atlas;
pub mod gbuffer;
pub mod mesh;
pub mod rect_packer;
pub mod scene;
pub mod stage;
pub mod util;
pub mod vulkan;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use nalgebra;
