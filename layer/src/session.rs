//! Screenshot session state
//!
//! Everything the intercepted entry points share: configuration, the frame
//! selection, the shadow table, frame and render-pass counters, and captures
//! recorded into application command buffers that wait for submission.
//!
//! The owner wraps this in one reader/writer lock. Handlers that only resolve a
//! dispatch target take `&self`; everything else takes `&mut self`.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use smallvec::{smallvec, SmallVec};
use tracegrab_shared::FrameSelection;

use crate::config::LayerConfig;
use crate::ppm;
use crate::readback::{self, CaptureError, CaptureHandle, CommandContext, ReadbackDevice};
use crate::shadow::{
    CaptureQueue, DeviceContext, ImageRecord, Lookup, OwnerKey, ShadowTable, SwapchainRecord,
};

/// Image dump requested by a begin-render-pass
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingDump {
    image: vk::Image,
    name: String,
}

/// A render pass being recorded into a command buffer
#[derive(Debug, Default)]
struct ActiveRenderPass {
    dumps: Vec<PendingDump>,
}

/// Readback recorded into an application command buffer
struct QueuedCapture<D> {
    path: PathBuf,
    device: Arc<D>,
    handle: CaptureHandle,
}

impl<D: ReadbackDevice> QueuedCapture<D> {
    fn release(self) {
        self.handle.release(&*self.device);
    }
}

pub struct SessionState<D> {
    config: LayerConfig,
    selection: Option<FrameSelection>,
    shadow: ShadowTable<D>,
    /// Presents seen so far
    frame: u64,
    /// Render passes begun since the last present
    render_pass_in_frame: u32,
    /// Creation index handed to the next render pass
    render_pass_counter: u32,
    render_passes: HashMap<vk::CommandBuffer, SmallVec<[ActiveRenderPass; 2]>>,
    queued: HashMap<vk::CommandBuffer, Vec<QueuedCapture<D>>>,
    /// Primary command buffer to itself and the secondaries it executes
    links: HashMap<vk::CommandBuffer, SmallVec<[vk::CommandBuffer; 4]>>,
    fallback_warned: bool,
}

impl<D: ReadbackDevice> SessionState<D> {
    pub fn new(config: LayerConfig) -> Self {
        Self {
            selection: config.frames.clone(),
            config,
            shadow: ShadowTable::new(),
            frame: 0,
            render_pass_in_frame: 0,
            render_pass_counter: 0,
            render_passes: HashMap::new(),
            queued: HashMap::new(),
            links: HashMap::new(),
            fallback_warned: false,
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn shadow(&self) -> &ShadowTable<D> {
        &self.shadow
    }

    pub fn frame_number(&self) -> u64 {
        self.frame
    }

    /// Whether any frame remains to be captured.
    pub fn is_capture_active(&self) -> bool {
        self.selection.as_ref().is_some_and(FrameSelection::is_active)
    }

    fn is_render_pass_tracking(&self) -> bool {
        self.config.render_pass_dump.is_enabled() && self.is_capture_active()
    }

    fn is_capture_frame(&self) -> bool {
        self.selection
            .as_ref()
            .is_some_and(|selection| selection.is_capture_frame(self.frame))
    }

    // Dispatch resolution

    pub fn resolve_device(&self, device: vk::Device) -> Lookup<Arc<D>> {
        match self.shadow.device(device) {
            Lookup::Found(context) => Lookup::Found(context.backend.clone()),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    pub fn resolve_queue(&self, queue: vk::Queue) -> Lookup<Arc<D>> {
        self.resolve_owner(OwnerKey::Queue(queue))
    }

    pub fn resolve_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Lookup<Arc<D>> {
        self.resolve_owner(OwnerKey::CommandBuffer(command_buffer))
    }

    fn resolve_owner(&self, key: OwnerKey) -> Lookup<Arc<D>> {
        match self.shadow.owner(key) {
            Lookup::Found(context) => Lookup::Found(context.backend.clone()),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    // Instances and devices

    pub fn on_enumerate_physical_devices(&mut self, instance: vk::Instance, physical_devices: &[vk::PhysicalDevice]) {
        for &physical_device in physical_devices {
            self.shadow.register_physical_device(physical_device, instance);
        }
    }

    pub fn physical_device_instance(&self, physical_device: vk::PhysicalDevice) -> Lookup<vk::Instance> {
        self.shadow.physical_device_instance(physical_device)
    }

    pub fn on_create_device(
        &mut self,
        device: vk::Device,
        physical_device: vk::PhysicalDevice,
        backend: Arc<D>,
        wsi_enabled: bool,
    ) {
        tracing::debug!(?device, wsi_enabled, "device created");
        self.shadow.register_device(DeviceContext {
            device,
            physical_device,
            backend,
            capture_queue: None,
            wsi_enabled,
        });
    }

    /// Forget a device, releasing captures still queued against it.
    pub fn on_destroy_device(&mut self, device: vk::Device) -> Option<Arc<D>> {
        for captures in self.queued.values_mut() {
            let (stale, kept): (Vec<_>, Vec<_>) = captures
                .drain(..)
                .partition(|capture| capture.handle.source().device == device);
            *captures = kept;
            stale.into_iter().for_each(QueuedCapture::release);
        }
        self.queued.retain(|_, captures| !captures.is_empty());
        self.shadow.unregister_device(device).map(|context| context.backend)
    }

    /// Index the queue to its device; a graphics-capable queue becomes the
    /// device's capture queue.
    pub fn on_get_device_queue(&mut self, device: vk::Device, queue_family_index: u32, queue: vk::Queue) {
        let Lookup::Found(context) = self.shadow.device_mut(device) else {
            tracing::debug!(?device, "queue requested from an untracked device");
            return;
        };
        if context
            .backend
            .queue_family_flags(queue_family_index)
            .contains(vk::QueueFlags::GRAPHICS)
        {
            context.capture_queue = Some(CaptureQueue {
                queue,
                family_index: queue_family_index,
            });
        }
        self.shadow.register_owner(OwnerKey::Queue(queue), device);
    }

    pub fn on_allocate_command_buffers(&mut self, device: vk::Device, command_buffers: &[vk::CommandBuffer]) {
        for &command_buffer in command_buffers {
            self.shadow
                .register_owner(OwnerKey::CommandBuffer(command_buffer), device);
        }
    }

    // Swapchains

    /// Whether swapchains need `TRANSFER_SRC` usage added at creation.
    pub fn wants_transfer_src(&self) -> bool {
        self.is_capture_active()
    }

    pub fn on_create_swapchain(
        &mut self,
        device: vk::Device,
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
        format: vk::Format,
    ) {
        if !self.is_capture_active() {
            return;
        }
        self.shadow.register_swapchain(
            swapchain,
            SwapchainRecord {
                device,
                extent,
                format,
                images: Vec::new(),
            },
        );
    }

    pub fn on_get_swapchain_images(&mut self, swapchain: vk::SwapchainKHR, images: &[vk::Image]) {
        if !self.is_capture_active() {
            return;
        }
        if !self.shadow.register_swapchain_images(swapchain, images) {
            tracing::debug!(?swapchain, "images of an untracked swapchain");
        }
    }

    // Render-pass scoped tracking

    pub fn on_create_image(&mut self, device: vk::Device, image: vk::Image, extent: vk::Extent2D, format: vk::Format) {
        if !self.is_render_pass_tracking() {
            return;
        }
        self.shadow.register_image(ImageRecord {
            image,
            device,
            extent,
            format,
            is_swapchain_image: false,
            resolved: None,
        });
    }

    pub fn on_destroy_image(&mut self, image: vk::Image) {
        if self.is_render_pass_tracking() {
            self.shadow.unregister_image(image);
        }
    }

    pub fn on_create_image_view(&mut self, view: vk::ImageView, image: vk::Image) {
        if self.is_render_pass_tracking() {
            self.shadow.register_image_view(view, image);
        }
    }

    pub fn on_destroy_image_view(&mut self, view: vk::ImageView) {
        if self.is_render_pass_tracking() {
            self.shadow.unregister_image_view(view);
        }
    }

    pub fn on_create_framebuffer(&mut self, framebuffer: vk::Framebuffer, attachments: &[vk::ImageView]) {
        if self.is_render_pass_tracking() {
            self.shadow.register_framebuffer(framebuffer, attachments);
        }
    }

    pub fn on_destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        if self.is_render_pass_tracking() {
            self.shadow.unregister_framebuffer(framebuffer);
        }
    }

    /// Assign the next creation index; `None` when not tracking.
    pub fn on_create_render_pass(&mut self, render_pass: vk::RenderPass) -> Option<u32> {
        if !self.is_render_pass_tracking() {
            return None;
        }
        let index = self.render_pass_counter;
        self.render_pass_counter += 1;
        self.shadow.register_render_pass(render_pass, index);
        Some(index)
    }

    pub fn on_destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        if self.is_render_pass_tracking() {
            self.shadow.unregister_render_pass(render_pass);
        }
    }

    /// Re-recording drops whatever the command buffer had queued.
    pub fn on_begin_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        if let Some(captures) = self.queued.remove(&command_buffer) {
            tracing::debug!(count = captures.len(), "dropping captures of a re-recorded command buffer");
            captures.into_iter().for_each(QueuedCapture::release);
        }
        self.render_passes.remove(&command_buffer);
        if self.is_render_pass_tracking() {
            self.links.insert(command_buffer, smallvec![command_buffer]);
        } else {
            self.links.remove(&command_buffer);
        }
    }

    pub fn on_cmd_execute_commands(&mut self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if !self.is_render_pass_tracking() {
            return;
        }
        let links = self.links.entry(primary).or_insert_with(|| smallvec![primary]);
        for secondary in secondaries {
            if !links.contains(secondary) {
                links.push(*secondary);
            }
        }
    }

    /// Plan one dump per framebuffer image when this render pass is selected.
    pub fn on_cmd_begin_render_pass(
        &mut self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    ) {
        if !self.is_render_pass_tracking() {
            return;
        }
        let mut active = ActiveRenderPass::default();
        let selected = self
            .shadow
            .render_pass_index(render_pass)
            .found()
            .filter(|index| self.config.render_pass_dump.matches(*index) && self.is_capture_frame());
        if let Some(index) = selected {
            if let Lookup::Found(images) = self.shadow.framebuffer_images(framebuffer) {
                active.dumps = images
                    .iter()
                    .enumerate()
                    .map(|(image_index, image)| PendingDump {
                        image: *image,
                        name: format!(
                            "f{}_rpi_{}_img_{}_rpc_{}_presubmit",
                            self.frame, self.render_pass_in_frame, image_index, index
                        ),
                    })
                    .collect();
            }
        }
        self.render_passes.entry(command_buffer).or_default().push(active);
        self.render_pass_in_frame += 1;
    }

    /// Record readbacks of the planned dumps into the caller's command buffer.
    pub fn on_cmd_end_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        let Some(active) = self
            .render_passes
            .get_mut(&command_buffer)
            .and_then(|stack| stack.pop())
        else {
            return;
        };
        if active.dumps.is_empty() {
            return;
        }
        let Lookup::Found(device) = self.resolve_command_buffer(command_buffer) else {
            tracing::warn!(?command_buffer, "render pass ended on an untracked command buffer");
            return;
        };

        for dump in active.dumps {
            let Lookup::Found(record) = self.shadow.image(dump.image).map_copied() else {
                tracing::warn!(image = ?dump.image, "framebuffer image is not tracked, skipping dump");
                continue;
            };
            match readback::capture(
                &*device,
                &record,
                self.config.color_space,
                CommandContext::Caller(command_buffer),
                &mut self.fallback_warned,
            ) {
                Ok(handle) => {
                    self.shadow.set_resolved_format(dump.image, handle.plan().resolved());
                    let file_name = format!("{}{}.ppm", self.config.prefix, dump.name);
                    self.queued.entry(command_buffer).or_default().push(QueuedCapture {
                        path: self.config.output_path(&file_name),
                        device: device.clone(),
                        handle,
                    });
                }
                Err(err) => tracing::warn!(image = ?dump.image, %err, "render pass capture skipped"),
            }
        }
    }

    /// Write the captures queued on the submitted command buffers and their
    /// secondaries. Returns the files written.
    pub fn on_queue_submit(&mut self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer]) -> Vec<PathBuf> {
        if !self.is_render_pass_tracking() || !self.is_capture_frame() {
            return Vec::new();
        }
        let mut captures = Vec::new();
        for command_buffer in command_buffers {
            let links = self
                .links
                .get(command_buffer)
                .cloned()
                .unwrap_or_else(|| smallvec![*command_buffer]);
            for linked in links {
                if let Some(queued) = self.queued.remove(&linked) {
                    captures.extend(queued);
                }
            }
        }
        if captures.is_empty() {
            return Vec::new();
        }

        if let Lookup::Found(device) = self.resolve_queue(queue) {
            if let Err(result) = device.queue_wait_idle(queue) {
                tracing::error!(%result, "vkQueueWaitIdle failed before writing render pass captures");
                captures.into_iter().for_each(QueuedCapture::release);
                return Vec::new();
            }
        }

        let mut written = Vec::new();
        for capture in captures {
            match ppm::emit(&*capture.device, &capture.path, capture.handle) {
                Ok(path) => {
                    tracing::info!("EndRenderPass Screen capture file is: {}", path.display());
                    written.push(path);
                }
                Err(err) => tracing::warn!(path = %capture.path.display(), %err, "render pass capture failed"),
            }
        }
        written
    }

    // Present

    /// Capture the presented image of a selected frame, then advance the frame
    /// counter. `presented` lists each swapchain with its image index.
    ///
    /// Returns the file written, if any.
    pub fn on_queue_present(
        &mut self,
        queue: vk::Queue,
        presented: &[(vk::SwapchainKHR, u32)],
    ) -> Option<PathBuf> {
        let mut written = None;
        if self.is_capture_active() && self.is_capture_frame() {
            match self.capture_presented(queue, presented) {
                Ok(path) => {
                    tracing::info!("QueuePresent Screen capture file is: {}", path.display());
                    written = Some(path);
                }
                Err(err) => tracing::error!(frame = self.frame, %err, "Failed to save screenshot"),
            }

            if let Some(FrameSelection::List(frames)) = &mut self.selection {
                frames.remove(&self.frame);
            }
            let finished = match &self.selection {
                Some(FrameSelection::List(frames)) => frames.is_empty(),
                Some(FrameSelection::Range(range)) => range.is_end_of_range(self.frame),
                None => true,
            };
            if finished {
                self.finish_capture();
            }
        }

        self.frame += 1;
        self.render_pass_in_frame = 0;
        written
    }

    fn capture_presented(
        &mut self,
        queue: vk::Queue,
        presented: &[(vk::SwapchainKHR, u32)],
    ) -> Result<PathBuf, CaptureError> {
        let &(swapchain, image_index) = presented.first().ok_or(CaptureError::NoSwapchain)?;
        let Lookup::Found(record) = self.shadow.swapchain(swapchain) else {
            return Err(CaptureError::UnknownSwapchain(swapchain));
        };
        let device_handle = record.device;
        let image = record
            .images
            .get(image_index as usize)
            .copied()
            .ok_or(CaptureError::UnknownImage(vk::Image::null()))?;

        let Lookup::Found(context) = self.shadow.device(device_handle) else {
            return Err(CaptureError::UnknownDevice);
        };
        let device = context.backend.clone();
        let capture_queue = context.capture_queue.ok_or(CaptureError::NoCaptureQueue)?;
        if capture_queue.queue != queue {
            // The capture is submitted on another queue than the present
            device
                .queue_wait_idle(queue)
                .map_err(|result| CaptureError::Vulkan {
                    call: "vkQueueWaitIdle",
                    result,
                })?;
        }

        let Lookup::Found(source) = self.shadow.image(image).map_copied() else {
            return Err(CaptureError::UnknownImage(image));
        };
        let handle = readback::capture(
            &*device,
            &source,
            self.config.color_space,
            CommandContext::Private(capture_queue),
            &mut self.fallback_warned,
        )?;
        self.shadow.set_resolved_format(image, handle.plan().resolved());

        let file_name = format!("{}{}.ppm", self.config.prefix, self.frame);
        ppm::emit(&*device, &self.config.output_path(&file_name), handle)
    }

    /// Drop every capture-related record once no selected frame remains.
    fn finish_capture(&mut self) {
        tracing::debug!(frame = self.frame, "last screenshot frame reached, releasing tracking state");
        self.shadow.reset_capture_state();
        for (_, captures) in self.queued.drain() {
            captures.into_iter().for_each(QueuedCapture::release);
        }
        self.render_passes.clear();
        self.links.clear();
        if let Some(FrameSelection::Range(range)) = &mut self.selection {
            range.invalidate();
        }
    }

    /// Release every queued capture; called before the session is dropped.
    pub fn release_all(&mut self) {
        for (_, captures) in self.queued.drain() {
            captures.into_iter().for_each(QueuedCapture::release);
        }
    }
}

#[cfg(test)]
mod tests;
