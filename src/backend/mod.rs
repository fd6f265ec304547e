// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: device/surface ownership, the swapchain with
// its frame synchronization, and the pieces render systems build on.

pub mod buffer;
pub mod device;
pub mod model;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
