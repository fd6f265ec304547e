// Buffer utilities for vertex data
//
// Host-visible buffer creation and upload for mesh vertex buffers

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Create a GPU buffer with the given usage and memory properties.
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device
            .device
            .create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let memory_type_index =
        find_memory_type(device, requirements.memory_type_bits, memory_properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe {
        device
            .device
            .allocate_memory(&alloc_info, None)
            .context("Failed to allocate buffer memory")?
    };

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, memory, 0)
            .context("Failed to bind buffer memory")?;
    }

    Ok((buffer, memory))
}

/// Create a host-visible buffer and fill it with `data`.
pub fn create_buffer_with_data<T: Copy>(
    device: &VulkanDevice,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    let (buffer, memory) = create_buffer(
        device,
        size,
        usage,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    unsafe {
        let ptr = device
            .device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            .context("Failed to map buffer memory")? as *mut T;
        ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
        device.device.unmap_memory(memory);
    }

    Ok((buffer, memory))
}

fn find_memory_type(
    device: &VulkanDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mem_properties = &device.memory_properties;

    for i in 0..mem_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = mem_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    anyhow::bail!("Failed to find suitable memory type")
}
