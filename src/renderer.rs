// Frame coordinator
//
// Drives the per-frame lifecycle: acquire an image, open a command buffer,
// bracket the render pass, submit, present. Owns the swapchain and mediates
// its recreation when the surface goes stale or the window resizes.
//
// Misusing the begin/end pairing is a programming error and panics; GPU
// failures unrelated to resize propagate as errors.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use winit::window::Window;

use crate::backend::swapchain::{AcquireStatus, PresentStatus, Swapchain, MAX_FRAMES_IN_FLIGHT};
use crate::backend::VulkanDevice;

/// Clear color for the swapchain render pass, near-black.
const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.01, 1.0];

pub struct Renderer {
    /// One reusable primary command buffer per frame-in-flight slot,
    /// allocated once for the renderer's lifetime.
    command_buffers: Vec<vk::CommandBuffer>,
    swapchain: Swapchain,
    state: FrameState,
    window_resized: bool,
    present_mode: vk::PresentModeKHR,
    window: Arc<Window>,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        window: Arc<Window>,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            present_mode,
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);

        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate frame command buffers")?;

        Ok(Self {
            command_buffers,
            swapchain,
            state: FrameState::default(),
            window_resized: false,
            present_mode,
            window,
            device,
        })
    }

    /// Open a frame. Returns `None` when no image could be acquired this
    /// tick (surface out of date or window minimized); the caller skips
    /// rendering for that loop iteration.
    ///
    /// Panics if a frame is already in progress.
    pub fn begin_frame(&mut self) -> Result<Option<vk::CommandBuffer>> {
        assert!(
            !self.state.is_recording(),
            "begin_frame called while a frame is already in progress"
        );

        // A rebuild deferred while the window had no area
        if self.state.needs_rebuild() {
            self.recreate_swapchain()?;
            if self.state.needs_rebuild() {
                return Ok(None);
            }
        }

        let acquired = self.swapchain.acquire_next_image()?;
        let Some(slot) = self.state.begin(acquired) else {
            self.recreate_swapchain()?;
            return Ok(None);
        };

        let command_buffer = self.command_buffers[slot];
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            self.device
                .device
                .begin_command_buffer(command_buffer, &begin_info)
                .context("Failed to begin frame command buffer")?;
        }

        Ok(Some(command_buffer))
    }

    /// Close the frame: finish recording, submit, present, advance the
    /// frame-in-flight slot. A stale surface or pending window resize
    /// triggers swapchain recreation and is not an error.
    ///
    /// Panics if no frame is in progress.
    pub fn end_frame(&mut self) -> Result<()> {
        assert!(
            self.state.is_recording(),
            "end_frame called while no frame is in progress"
        );

        let command_buffer = self.command_buffers[self.state.slot()];
        unsafe {
            self.device
                .device
                .end_command_buffer(command_buffer)
                .context("Failed to end frame command buffer")?;
        }

        let status = self
            .swapchain
            .submit_and_present(command_buffer, self.state.image_index())?;

        let resized = std::mem::take(&mut self.window_resized);
        if self.state.end(status, resized) {
            self.recreate_swapchain()?;
        }

        Ok(())
    }

    /// Begin the swapchain render pass on the open frame's command buffer:
    /// clears color and depth, sets a full-extent viewport and scissor.
    pub fn begin_render_pass(&self, command_buffer: vk::CommandBuffer) {
        assert!(
            self.state.is_recording(),
            "begin_render_pass called while no frame is in progress"
        );
        debug_assert_eq!(
            command_buffer,
            self.command_buffers[self.state.slot()],
            "begin_render_pass called with a command buffer from a different frame"
        );

        let extent = self.swapchain.extent();
        let clear_values = clear_values();

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.framebuffer(self.state.image_index()))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            self.device
                .device
                .cmd_set_viewport(command_buffer, 0, &[full_extent_viewport(extent)]);
            self.device
                .device
                .cmd_set_scissor(command_buffer, 0, &[full_extent_scissor(extent)]);
        }
    }

    pub fn end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        assert!(
            self.state.is_recording(),
            "end_render_pass called while no frame is in progress"
        );
        debug_assert_eq!(
            command_buffer,
            self.command_buffers[self.state.slot()],
            "end_render_pass called with a command buffer from a different frame"
        );

        unsafe {
            self.device.device.cmd_end_render_pass(command_buffer);
        }
    }

    /// Mark that the window reported a resize; picked up at the next
    /// `end_frame`.
    pub fn note_resized(&mut self) {
        self.window_resized = true;
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.state.is_recording()
    }

    /// Command buffer of the open frame. Panics when no frame is open.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        assert!(
            self.state.is_recording(),
            "cannot get command buffer when no frame is in progress"
        );
        self.command_buffers[self.state.slot()]
    }

    /// Frame-in-flight slot of the open frame. Panics when no frame is open.
    pub fn frame_index(&self) -> usize {
        assert!(
            self.state.is_recording(),
            "cannot get frame index when no frame is in progress"
        );
        self.state.slot()
    }

    /// Render pass compatible with every swapchain framebuffer, for
    /// pipeline construction by render systems.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    /// Width over height of the current swapchain extent, for projection
    /// setup.
    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.aspect_ratio()
    }

    fn window_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    /// Tear down and rebuild the swapchain against the current window
    /// extent. While the window has no area (minimized) the rebuild stays
    /// pending and frames are skipped; command buffers are untouched.
    fn recreate_swapchain(&mut self) -> Result<()> {
        let extent = self.window_extent();
        if !self.state.take_rebuild(extent) {
            return Ok(());
        }

        self.device.wait_idle()?;
        let rebuilt = Swapchain::recreate(
            self.device.clone(),
            extent,
            self.present_mode,
            &self.swapchain,
        )?;
        self.swapchain = rebuilt;
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &self.command_buffers);
        }
    }
}

fn clear_values() -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

fn full_extent_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn full_extent_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Pure frame-lifecycle state: which slot and image are active, whether a
/// frame is open, and whether a swapchain rebuild is owed. Kept free of
/// Vulkan calls so the sequencing rules can be tested directly.
#[derive(Debug, Default)]
struct FrameState {
    current_frame: usize,
    current_image: u32,
    recording: bool,
    rebuild_pending: bool,
}

impl FrameState {
    /// Feed in an acquisition result. Returns the frame-in-flight slot to
    /// record into, or `None` when the swapchain must be rebuilt and the
    /// frame skipped.
    fn begin(&mut self, acquired: AcquireStatus) -> Option<usize> {
        assert!(
            !self.recording,
            "begin_frame called while a frame is already in progress"
        );

        match acquired {
            AcquireStatus::Ready(image) | AcquireStatus::Suboptimal(image) => {
                self.current_image = image;
                self.recording = true;
                Some(self.current_frame)
            }
            AcquireStatus::OutOfDate => {
                self.rebuild_pending = true;
                None
            }
        }
    }

    /// Feed in the present result and the window's resize flag. Closes the
    /// frame and advances the slot; returns whether a rebuild is owed.
    fn end(&mut self, presented: PresentStatus, window_resized: bool) -> bool {
        assert!(
            self.recording,
            "end_frame called while no frame is in progress"
        );

        self.recording = false;
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;

        if presented != PresentStatus::Presented || window_resized {
            self.rebuild_pending = true;
        }
        self.rebuild_pending
    }

    /// Consume the pending rebuild if the window extent allows one. A
    /// degenerate extent (minimized window) leaves it pending.
    fn take_rebuild(&mut self, extent: vk::Extent2D) -> bool {
        if self.rebuild_pending && extent.width > 0 && extent.height > 0 {
            self.rebuild_pending = false;
            true
        } else {
            false
        }
    }

    fn needs_rebuild(&self) -> bool {
        self.rebuild_pending
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn slot(&self) -> usize {
        self.current_frame
    }

    fn image_index(&self) -> u32 {
        self.current_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn complete_frame(state: &mut FrameState, image: u32) -> usize {
        let slot = state.begin(AcquireStatus::Ready(image)).unwrap();
        assert!(!state.end(PresentStatus::Presented, false));
        slot
    }

    #[test]
    fn slots_cycle_round_robin() {
        let mut state = FrameState::default();
        let slots: Vec<usize> = (0..6).map(|i| complete_frame(&mut state, i % 3)).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn slot_cycling_survives_recreations() {
        let mut state = FrameState::default();
        assert_eq!(complete_frame(&mut state, 0), 0);

        // Acquisition fails, frame skipped, swapchain rebuilt
        assert!(state.begin(AcquireStatus::OutOfDate).is_none());
        assert!(state.take_rebuild(extent(800, 600)));

        // The slot sequence continues where it left off
        assert_eq!(complete_frame(&mut state, 1), 1);
        assert_eq!(complete_frame(&mut state, 2), 0);
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn begin_twice_panics() {
        let mut state = FrameState::default();
        state.begin(AcquireStatus::Ready(0));
        state.begin(AcquireStatus::Ready(1));
    }

    #[test]
    #[should_panic(expected = "no frame is in progress")]
    fn end_without_begin_panics() {
        let mut state = FrameState::default();
        state.end(PresentStatus::Presented, false);
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_requests_one_rebuild() {
        let mut state = FrameState::default();

        assert!(state.begin(AcquireStatus::OutOfDate).is_none());
        assert!(!state.is_recording());

        // Exactly one rebuild before the next successful begin
        assert!(state.take_rebuild(extent(800, 600)));
        assert!(!state.take_rebuild(extent(800, 600)));

        assert_eq!(state.begin(AcquireStatus::Ready(0)), Some(0));
    }

    #[test]
    fn suboptimal_acquire_still_opens_the_frame() {
        let mut state = FrameState::default();
        assert_eq!(state.begin(AcquireStatus::Suboptimal(2)), Some(0));
        assert!(state.is_recording());
        assert_eq!(state.image_index(), 2);
    }

    #[test]
    fn suboptimal_present_requests_rebuild() {
        let mut state = FrameState::default();
        state.begin(AcquireStatus::Ready(0));
        assert!(state.end(PresentStatus::Suboptimal, false));
    }

    #[test]
    fn window_resize_requests_rebuild_even_when_present_succeeded() {
        let mut state = FrameState::default();
        state.begin(AcquireStatus::Ready(0));
        assert!(state.end(PresentStatus::Presented, true));
    }

    #[test]
    fn rebuild_deferred_while_extent_is_degenerate() {
        let mut state = FrameState::default();
        state.begin(AcquireStatus::OutOfDate);

        let mut rebuilds = 0;
        for e in [extent(0, 0), extent(0, 0), extent(800, 600)] {
            if state.take_rebuild(e) {
                rebuilds += 1;
            }
        }
        assert_eq!(rebuilds, 1);
        assert!(!state.needs_rebuild());
    }

    #[test]
    fn clear_and_viewport_depend_only_on_extent() {
        let e = extent(800, 600);

        let viewport = full_extent_viewport(e);
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.height, 600.0);
        assert_eq!(viewport.min_depth, 0.0);
        assert_eq!(viewport.max_depth, 1.0);

        let scissor = full_extent_scissor(e);
        assert_eq!(scissor.extent, e);
        assert_eq!(scissor.offset, vk::Offset2D { x: 0, y: 0 });

        let clears = clear_values();
        let color = unsafe { clears[0].color.float32 };
        assert_eq!(color, CLEAR_COLOR);
        let depth = unsafe { clears[1].depth_stencil };
        assert_eq!(depth.depth, 1.0);
        assert_eq!(depth.stencil, 0);
    }
}
