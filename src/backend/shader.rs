// Shader module loading
//
// Loads compiled SPIR-V from disk and wraps it in a Vulkan shader module.
// Sources under shaders/ are compiled by the build script when glslc is
// available.

use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv handles alignment and endianness of the 4-byte words
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Invalid SPIR-V bytecode")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read a compiled SPIR-V file and create a shader module from it.
pub fn load_shader_module(
    device: &VulkanDevice,
    path: impl AsRef<Path>,
) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file {:?}", path))?;
    create_shader_module(device, &bytes)
        .with_context(|| format!("Failed to build shader module from {:?}", path))
}
