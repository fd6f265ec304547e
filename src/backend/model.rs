// Mesh model - vertex buffer ownership and draw binding
//
// Geometry is supplied by the caller as a vertex list; loading meshes from
// files is a separate concern.

use std::sync::Arc;

use anyhow::{ensure, Result};
use ash::vk;

use super::buffer;
use super::VulkanDevice;

/// Interleaved vertex: position then color, tightly packed.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12)
                .build(),
        ]
    }
}

pub struct Model {
    vertex_buffer: vk::Buffer,
    vertex_memory: vk::DeviceMemory,
    vertex_count: u32,
    device: Arc<VulkanDevice>,
}

impl Model {
    pub fn new(device: Arc<VulkanDevice>, vertices: &[Vertex]) -> Result<Self> {
        ensure!(vertices.len() >= 3, "model needs at least 3 vertices");

        let (vertex_buffer, vertex_memory) = buffer::create_buffer_with_data(
            &device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
        )?;

        Ok(Self {
            vertex_buffer,
            vertex_memory,
            vertex_count: vertices.len() as u32,
            device,
        })
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[self.vertex_buffer],
                &[0],
            );
        }
    }

    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .cmd_draw(command_buffer, self.vertex_count, 1, 0, 0);
        }
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.vertex_buffer, None);
            self.device.device.free_memory(self.vertex_memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);

        let bindings = Vertex::binding_descriptions();
        assert_eq!(bindings[0].stride, 24);

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[1].location, 1);
    }
}
