//! Concrete Vulkan renderer.
//!
//! [`VulkanFrames`] implements [`FrameBackend`] over ash: it owns the
//! swapchain, one command pool/buffer/timeline-semaphore per ring slot,
//! the triangle pipeline, and the vertex buffer. [`Renderer`] is the owned
//! context object the application talks to - there is no module-level
//! state; everything lives here and is destroyed in a fixed order.

use std::mem::ManuallyDrop;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use glam::Vec3;
use tracing::{error, info, warn};

use vkexp_platform::{Surface, Window};
use vkexp_rhi::adapter::select_adapter;
use vkexp_rhi::buffer::Buffer;
use vkexp_rhi::command::{CommandBuffer, CommandPool};
use vkexp_rhi::device::Device;
use vkexp_rhi::instance::Instance;
use vkexp_rhi::pipeline::{GraphicsPipelineBuilder, Pipeline, PipelineLayout};
use vkexp_rhi::shader::{Shader, ShaderStage};
use vkexp_rhi::swapchain::Swapchain;
use vkexp_rhi::sync::{Semaphore, TimelineSemaphore};
use vkexp_rhi::vertex::TriangleVertex;
use vkexp_rhi::RhiError;

use crate::error::{DeviceLostError, FrameError, InitError};
use crate::frame_loop::{FrameBackend, FramePipeline};
use crate::frame_sync::FrameSynchronizer;
use crate::slot_ring::SlotRing;
use crate::{FENCE_WAIT_TIMEOUT, FRAME_COUNT};

/// The hard-coded triangle, in clip space.
const TRIANGLE_VERTICES: [TriangleVertex; 3] = [
    TriangleVertex::new(Vec3::new(0.0, 0.5, 0.5)),
    TriangleVertex::new(Vec3::new(0.5, -0.5, 0.5)),
    TriangleVertex::new(Vec3::new(-0.5, -0.5, 0.5)),
];

/// Clear color behind the triangle.
const CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

/// SPIR-V locations, relative to the working directory.
const VERTEX_SHADER_PATH: &str = "shaders/spirv/triangle.vert.spv";
const FRAGMENT_SHADER_PATH: &str = "shaders/spirv/triangle.frag.spv";

/// Usage state of one backbuffer image, mirrored on the CPU.
///
/// The tag must match the state the next operation expects; the recorder
/// transitions `Presenting -> RenderTarget` before drawing and back after,
/// and refuses to record into an image still tagged as a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackbufferState {
    /// Never rendered to; the image layout is still undefined.
    Undefined,
    /// Handed to the presentation engine.
    Presenting,
    /// Bound as the color attachment of the in-progress recording.
    RenderTarget,
}

/// Image layout a backbuffer in `state` currently holds, or `None` if
/// recording must not start from that state.
fn old_layout_for(state: BackbufferState) -> Option<vk::ImageLayout> {
    match state {
        BackbufferState::Undefined => Some(vk::ImageLayout::UNDEFINED),
        BackbufferState::Presenting => Some(vk::ImageLayout::PRESENT_SRC_KHR),
        BackbufferState::RenderTarget => None,
    }
}

/// Everything one ring slot owns.
struct FrameSlot {
    /// The slot's command allocator.
    command_pool: CommandPool,
    /// The slot's command list.
    command_buffer: CommandBuffer,
    /// The slot's completion fence; shared with the frame synchronizer.
    timeline: Arc<TimelineSemaphore>,
    /// Counter value of the slot's most recent submission.
    counter: u64,
    /// Usage state of the slot's backbuffer image.
    backbuffer_state: BackbufferState,
    /// Signaled by the slot's submission; presentation waits on it.
    render_finished: Semaphore,
}

/// Ash-backed [`FrameBackend`].
pub struct VulkanFrames {
    device: Arc<Device>,
    swapchain: Swapchain,
    pipeline: Pipeline,
    /// Kept alive for the pipeline; nothing is bound through it.
    _pipeline_layout: PipelineLayout,
    vertex_buffer: Buffer,
    slots: SlotRing<FrameSlot>,
    /// Acquire semaphores, cycled independently of the slot index: the
    /// semaphore must be chosen before the presentation engine reveals
    /// which slot comes next.
    acquire_semaphores: Vec<Semaphore>,
    acquire_cursor: usize,
    /// Semaphore the in-progress frame's acquire will signal.
    pending_acquire: vk::Semaphore,
}

impl VulkanFrames {
    fn new(
        device: Arc<Device>,
        swapchain: Swapchain,
        pipeline: Pipeline,
        pipeline_layout: PipelineLayout,
        vertex_buffer: Buffer,
        slots: Vec<FrameSlot>,
        acquire_semaphores: Vec<Semaphore>,
    ) -> Self {
        Self {
            device,
            swapchain,
            pipeline,
            _pipeline_layout: pipeline_layout,
            vertex_buffer,
            slots: SlotRing::new(slots),
            acquire_semaphores,
            acquire_cursor: 0,
            pending_acquire: vk::Semaphore::null(),
        }
    }

    /// Completion signals for the frame synchronizer, in slot order.
    fn completion_signals(&self) -> Vec<Arc<TimelineSemaphore>> {
        self.slots.iter().map(|s| s.timeline.clone()).collect()
    }

    fn slot(&self, slot: usize) -> Result<&FrameSlot, FrameError> {
        self.slots.get(slot).ok_or_else(|| {
            FrameError::Record(RhiError::InvalidHandle(format!(
                "slot index {} out of range",
                slot
            )))
        })
    }

    /// Records the layout transition between presenting and rendering.
    fn transition_backbuffer(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
            (
                vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ) => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            _ => {
                warn!(
                    "Unhandled layout transition: {:?} -> {:?}",
                    old_layout, new_layout
                );
                (
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                )
            }
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Records the clear + triangle pass between the two barriers.
    fn record_pass(&self, cmd: vk::CommandBuffer, slot: usize) -> Result<(), FrameError> {
        let image_view = self.swapchain.image_view(slot).ok_or_else(|| {
            FrameError::Record(RhiError::InvalidHandle(format!(
                "no image view for slot {}",
                slot
            )))
        })?;

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            });

        let extent = self.swapchain.extent();
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        unsafe {
            let device = self.device.handle();

            device.cmd_begin_rendering(cmd, &rendering_info);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.handle(),
            );

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle()], &[0]);

            device.cmd_draw(cmd, TRIANGLE_VERTICES.len() as u32, 1, 0, 0);

            device.cmd_end_rendering(cmd);
        }

        Ok(())
    }
}

impl FrameBackend for VulkanFrames {
    fn acquire_slot(&mut self) -> Result<usize, FrameError> {
        let semaphore = self.acquire_semaphores[self.acquire_cursor].handle();
        self.acquire_cursor = (self.acquire_cursor + 1) % self.acquire_semaphores.len();

        let index = self
            .swapchain
            .acquire_next_image(semaphore)
            .map_err(FrameError::Present)? as usize;

        if index >= self.slots.len() {
            return Err(FrameError::Present(RhiError::Swapchain(format!(
                "presentation engine returned backbuffer {} outside the ring of {}",
                index,
                self.slots.len()
            ))));
        }

        self.pending_acquire = semaphore;
        Ok(index)
    }

    fn record(&mut self, slot: usize) -> Result<(), FrameError> {
        // Reset the allocator (frees the prior recording) and re-open the
        // command list. The synchronizer has confirmed the slot is idle.
        let (cmd, old_state) = {
            let entry = self.slot(slot)?;
            entry.command_pool.reset().map_err(FrameError::Record)?;
            entry.command_buffer.begin().map_err(FrameError::Record)?;
            (entry.command_buffer.handle(), entry.backbuffer_state)
        };

        let old_layout = old_layout_for(old_state).ok_or_else(|| {
            FrameError::Record(RhiError::InvalidHandle(format!(
                "backbuffer {} is still tagged as a render target",
                slot
            )))
        })?;

        let image = self.swapchain.image(slot).ok_or_else(|| {
            FrameError::Record(RhiError::InvalidHandle(format!(
                "no backbuffer image for slot {}",
                slot
            )))
        })?;

        self.transition_backbuffer(
            cmd,
            image,
            old_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        self.record_pass(cmd, slot)?;

        self.transition_backbuffer(
            cmd,
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        // Close the list; failure here aborts the frame before submission
        self.slot(slot)?
            .command_buffer
            .end()
            .map_err(FrameError::Record)?;

        if let Some(entry) = self.slots.get_mut(slot) {
            entry.backbuffer_state = BackbufferState::Presenting;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<u64, FrameError> {
        let entry = self.slot(slot)?;
        let target = entry.counter + 1;

        let command_buffers = [entry.command_buffer.handle()];
        let wait_semaphores = [self.pending_acquire];
        let wait_values = [0u64];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        // Binary first, timeline second; the values array lines up and the
        // binary entry's value is ignored
        let signal_semaphores = [entry.render_finished.handle(), entry.timeline.handle()];
        let signal_values = [0u64, target];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .handle()
                .queue_submit(
                    self.device.graphics_queue(),
                    &[submit_info],
                    vk::Fence::null(),
                )
                .map_err(|e| FrameError::Submit(RhiError::Vulkan(e)))?;
        }

        if let Some(entry) = self.slots.get_mut(slot) {
            entry.counter = target;
        }

        Ok(target)
    }

    fn present(&mut self, slot: usize) -> Result<(), FrameError> {
        let render_finished = self.slot(slot)?.render_finished.handle();

        self.swapchain
            .present(self.device.present_queue(), slot as u32, render_finished)
            .map_err(FrameError::Present)?;

        Ok(())
    }
}

/// The harness renderer: one owned context object holding every graphics
/// resource, with a fixed destruction order.
pub struct Renderer {
    /// Frame ring, pipeline, swapchain (destroyed first).
    frames: ManuallyDrop<FramePipeline<VulkanFrames, Arc<TimelineSemaphore>>>,
    /// Window surface (destroyed after the swapchain).
    surface: ManuallyDrop<Surface>,
    /// Logical device (destroyed after all device children).
    device: ManuallyDrop<Arc<Device>>,
    /// Vulkan instance (destroyed last).
    instance: ManuallyDrop<Instance>,
}

impl Renderer {
    /// Initializes the device, swap chain, and frame ring for a window.
    ///
    /// # Errors
    ///
    /// Any adapter/device/surface/pipeline creation failure aborts startup.
    pub fn new(window: &Window) -> Result<Self, InitError> {
        let width = window.width();
        let height = window.height();

        info!("Initializing Vulkan renderer ({}x{})", width, height);

        let enable_validation = cfg!(debug_assertions);
        let instance = Instance::new(enable_validation)?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| InitError::Surface(e.to_string()))?;

        let adapter = select_adapter(instance.handle(), surface.handle(), surface.loader())?;

        let device = Device::new(&instance, &adapter)?;

        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            width,
            height,
            FRAME_COUNT as u32,
        )?;

        let (pipeline, pipeline_layout) = create_triangle_pipeline(&device, swapchain.format())?;

        let vertex_buffer =
            Buffer::vertex_with_data(device.clone(), bytemuck::cast_slice(&TRIANGLE_VERTICES))?;

        let graphics_family = device.queue_families().graphics_family.unwrap_or(0);

        let ring_size = swapchain.image_count();
        let mut slots = Vec::with_capacity(ring_size);
        let mut acquire_semaphores = Vec::with_capacity(ring_size);

        for _ in 0..ring_size {
            let command_pool = CommandPool::new(device.clone(), graphics_family)?;
            let command_buffer = CommandBuffer::new(device.clone(), &command_pool)?;
            let timeline = Arc::new(TimelineSemaphore::new(device.clone(), 0)?);
            let render_finished = Semaphore::new(device.clone())?;

            slots.push(FrameSlot {
                command_pool,
                command_buffer,
                timeline,
                counter: 0,
                backbuffer_state: BackbufferState::Undefined,
                render_finished,
            });

            acquire_semaphores.push(Semaphore::new(device.clone())?);
        }

        let backend = VulkanFrames::new(
            device.clone(),
            swapchain,
            pipeline,
            pipeline_layout,
            vertex_buffer,
            slots,
            acquire_semaphores,
        );

        let sync = FrameSynchronizer::new(backend.completion_signals(), FENCE_WAIT_TIMEOUT);
        let frames = FramePipeline::new(backend, sync);

        info!("Renderer initialized: {} ring slots", ring_size);

        Ok(Self {
            frames: ManuallyDrop::new(frames),
            surface: ManuallyDrop::new(surface),
            device: ManuallyDrop::new(device),
            instance: ManuallyDrop::new(instance),
        })
    }

    /// Records, submits, and presents one frame.
    ///
    /// # Errors
    ///
    /// Failures are fatal; the caller should terminate the render loop.
    pub fn render_frame(&mut self) -> Result<(), FrameError> {
        self.frames.render_frame()
    }

    /// Drives every ring slot idle and drains the queues.
    ///
    /// Call before dropping the renderer; `Drop` only logs failures.
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceLostError`] if a wait fails or expires.
    pub fn shutdown(&mut self) -> Result<(), DeviceLostError> {
        self.frames.shutdown()?;

        // Presentation work is not fence-tracked; drain it too before
        // resources start going away
        self.device
            .wait_idle()
            .map_err(|e| DeviceLostError::new(format!("device idle wait failed: {}", e)))?;

        info!("Renderer shut down, GPU idle on every slot");
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }

        // Strict teardown order: frame ring and swapchain, then the
        // surface, then the device, and the instance last
        unsafe {
            ManuallyDrop::drop(&mut self.frames);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Renderer destroyed");
    }
}

/// Builds the triangle pipeline for the swapchain's format.
fn create_triangle_pipeline(
    device: &Arc<Device>,
    color_format: vk::Format,
) -> Result<(Pipeline, PipelineLayout), RhiError> {
    let vertex_shader = Shader::from_spirv_file(
        device.clone(),
        Path::new(VERTEX_SHADER_PATH),
        ShaderStage::Vertex,
        "main",
    )?;

    let fragment_shader = Shader::from_spirv_file(
        device.clone(),
        Path::new(FRAGMENT_SHADER_PATH),
        ShaderStage::Fragment,
        "main",
    )?;

    let pipeline_layout = PipelineLayout::new(device.clone())?;

    let pipeline = GraphicsPipelineBuilder::new()
        .vertex_shader(&vertex_shader)
        .fragment_shader(&fragment_shader)
        .vertex_binding(TriangleVertex::binding_description())
        .vertex_attributes(&TriangleVertex::attribute_descriptions())
        .color_attachment_format(color_format)
        .build(device.clone(), &pipeline_layout)?;

    info!("Triangle pipeline created");

    Ok((pipeline, pipeline_layout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_has_three_vertices() {
        assert_eq!(TRIANGLE_VERTICES.len(), 3);
    }

    #[test]
    fn test_old_layout_for_state() {
        assert_eq!(
            old_layout_for(BackbufferState::Undefined),
            Some(vk::ImageLayout::UNDEFINED)
        );
        assert_eq!(
            old_layout_for(BackbufferState::Presenting),
            Some(vk::ImageLayout::PRESENT_SRC_KHR)
        );
        // Recording into an image still bound as a render target violates
        // the state invariant
        assert_eq!(old_layout_for(BackbufferState::RenderTarget), None);
    }

    #[test]
    fn test_renderer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Renderer>();
    }
}
