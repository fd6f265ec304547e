//! Ember - a small forward renderer on raw Vulkan.
//!
//! The core is the frame presentation machinery: [`renderer::Renderer`]
//! drives the acquire/record/submit/present cycle against the swapchain in
//! [`backend::swapchain`], with [`MAX_FRAMES_IN_FLIGHT`] frames overlapping
//! on the GPU. Render systems such as [`render_system::SimpleRenderSystem`]
//! record draws between the renderer's render pass begin/end calls.
//!
//! [`MAX_FRAMES_IN_FLIGHT`]: backend::swapchain::MAX_FRAMES_IN_FLIGHT

pub mod backend;
pub mod config;
pub mod render_system;
pub mod renderer;
pub mod scene;
