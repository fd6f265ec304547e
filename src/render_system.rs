// Simple render system
//
// Records draw calls for a list of game objects inside an open render pass.
// Owns its pipeline and layout; the command buffer it records into is
// borrowed from the frame coordinator and only valid between the render
// pass begin/end calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;

use crate::backend::{pipeline, shader, VulkanDevice};
use crate::scene::{Camera, GameObject};

const VERT_SHADER_PATH: &str = "shaders/mesh.vert.spv";
const FRAG_SHADER_PATH: &str = "shaders/mesh.frag.spv";

/// Push constants for the mesh pipeline. Layout must match mesh.vert.
#[derive(Clone, Copy)]
#[repr(C)]
struct MeshPushConstants {
    /// projection * view * model
    transform: Mat4,
    /// Object tint, w unused
    color: [f32; 4],
}

pub struct SimpleRenderSystem {
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl SimpleRenderSystem {
    /// Build the pipeline against the given render pass; the pass object
    /// only establishes attachment compatibility and may outlive any one
    /// swapchain.
    pub fn new(device: Arc<VulkanDevice>, render_pass: vk::RenderPass) -> Result<Self> {
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(std::mem::size_of::<MeshPushConstants>() as u32)
            .build();

        let push_constant_ranges = [push_constant_range];
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_constant_ranges);

        let pipeline_layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let vert_shader = shader::load_shader_module(&device, VERT_SHADER_PATH)?;
        let frag_shader = shader::load_shader_module(&device, FRAG_SHADER_PATH)?;

        let pipeline_result = pipeline::create_graphics_pipeline(
            &device,
            render_pass,
            pipeline_layout,
            vert_shader,
            frag_shader,
        );

        // Modules are owned by the pipeline once linked
        unsafe {
            device.device.destroy_shader_module(vert_shader, None);
            device.device.destroy_shader_module(frag_shader, None);
        }

        let pipeline = match pipeline_result {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    device.device.destroy_pipeline_layout(pipeline_layout, None);
                }
                return Err(e);
            }
        };

        log::info!("Created simple render system pipeline");

        Ok(Self {
            pipeline,
            pipeline_layout,
            device,
        })
    }

    /// Record one draw per object with a model. Must be called with the
    /// open frame's command buffer, inside the render pass.
    pub fn render(
        &self,
        command_buffer: vk::CommandBuffer,
        objects: &[GameObject],
        camera: &Camera,
    ) {
        let projection_view = camera.projection() * camera.view();

        unsafe {
            self.device.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline,
            );
        }

        for object in objects {
            let Some(model) = &object.model else {
                continue;
            };

            let push = MeshPushConstants {
                transform: projection_view * object.transform.mat4(),
                color: [object.color.x, object.color.y, object.color.z, 1.0],
            };

            unsafe {
                self.device.device.cmd_push_constants(
                    command_buffer,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    as_bytes(&push),
                );
            }

            model.bind(command_buffer);
            model.draw(command_buffer);
        }
    }
}

impl Drop for SimpleRenderSystem {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

/// View a repr(C) push-constant struct as raw bytes for cmd_push_constants.
fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_fit_the_guaranteed_128_byte_limit() {
        assert!(std::mem::size_of::<MeshPushConstants>() <= 128);
    }
}
