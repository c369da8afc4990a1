//! Resource shadow table
//!
//! Mirrors the Vulkan objects the layer needs to answer "which device owns
//! this queue" and "which images back this framebuffer". Registering a handle
//! that is still present evicts the stale entry, since drivers reuse handles
//! once an object is destroyed.

use ash::vk;
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// Result of a shadow-table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl<T: Copy> Lookup<&T> {
    pub fn map_copied(self) -> Lookup<T> {
        match self {
            Lookup::Found(value) => Lookup::Found(*value),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

/// Dispatchable child handle indexed back to its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    Queue(vk::Queue),
    CommandBuffer(vk::CommandBuffer),
}

/// Queue used for the layer's own submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureQueue {
    pub queue: vk::Queue,
    pub family_index: u32,
}

/// Per logical device state
pub struct DeviceContext<D> {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    /// Dispatch for calls into the next layer; dropped with the context
    pub backend: Arc<D>,
    pub capture_queue: Option<CaptureQueue>,
    /// `VK_KHR_swapchain` was enabled at creation
    pub wsi_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainRecord {
    pub device: vk::Device,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
}

/// Destination format resolved on the first capture of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFormat {
    pub format: vk::Format,
    /// False when pixels are written raw without rescaling
    pub color_conversion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRecord {
    pub image: vk::Image,
    pub device: vk::Device,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub is_swapchain_image: bool,
    pub resolved: Option<ResolvedFormat>,
}

/// Handle maps shared by every intercepted entry point
pub struct ShadowTable<D> {
    devices: HashMap<vk::Device, DeviceContext<D>>,
    owners: HashMap<OwnerKey, vk::Device>,
    physical_devices: HashMap<vk::PhysicalDevice, vk::Instance>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainRecord>,
    images: HashMap<vk::Image, ImageRecord>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    framebuffers: HashMap<vk::Framebuffer, SmallVec<[vk::Image; 4]>>,
    render_passes: HashMap<vk::RenderPass, u32>,
}

impl<D> Default for ShadowTable<D> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            owners: HashMap::new(),
            physical_devices: HashMap::new(),
            swapchains: HashMap::new(),
            images: HashMap::new(),
            image_views: HashMap::new(),
            framebuffers: HashMap::new(),
            render_passes: HashMap::new(),
        }
    }
}

impl<D> ShadowTable<D> {
    pub fn new() -> Self {
        Self::default()
    }

    // Devices and their dispatchable children

    pub fn register_device(&mut self, context: DeviceContext<D>) {
        if self.devices.insert(context.device, context).is_some() {
            tracing::debug!("replaced stale device context");
        }
    }

    /// Drop a device context along with every queue and command buffer indexed to it.
    pub fn unregister_device(&mut self, device: vk::Device) -> Option<DeviceContext<D>> {
        self.owners.retain(|_, owner| *owner != device);
        self.devices.remove(&device)
    }

    pub fn device(&self, device: vk::Device) -> Lookup<&DeviceContext<D>> {
        self.devices.get(&device).into()
    }

    pub fn device_mut(&mut self, device: vk::Device) -> Lookup<&mut DeviceContext<D>> {
        self.devices.get_mut(&device).into()
    }

    pub fn register_owner(&mut self, key: OwnerKey, device: vk::Device) {
        self.owners.insert(key, device);
    }

    /// Resolve a queue or command buffer to its device context.
    pub fn owner(&self, key: OwnerKey) -> Lookup<&DeviceContext<D>> {
        match self.owners.get(&key) {
            Some(device) => self.device(*device),
            None => Lookup::NotFound,
        }
    }

    pub fn register_physical_device(&mut self, physical_device: vk::PhysicalDevice, instance: vk::Instance) {
        self.physical_devices.insert(physical_device, instance);
    }

    pub fn physical_device_instance(&self, physical_device: vk::PhysicalDevice) -> Lookup<vk::Instance> {
        self.physical_devices.get(&physical_device).copied().into()
    }

    // Swapchains and images

    pub fn register_swapchain(&mut self, swapchain: vk::SwapchainKHR, record: SwapchainRecord) {
        if self.swapchains.insert(swapchain, record).is_some() {
            tracing::debug!(?swapchain, "evicted stale swapchain record");
        }
    }

    pub fn swapchain(&self, swapchain: vk::SwapchainKHR) -> Lookup<&SwapchainRecord> {
        self.swapchains.get(&swapchain).into()
    }

    /// Record the presentable images of a known swapchain; returns false if
    /// the swapchain is not tracked.
    pub fn register_swapchain_images(&mut self, swapchain: vk::SwapchainKHR, images: &[vk::Image]) -> bool {
        let Some(record) = self.swapchains.get_mut(&swapchain) else {
            return false;
        };
        record.images = images.to_vec();
        let (device, extent, format) = (record.device, record.extent, record.format);
        for &image in images {
            self.images.insert(
                image,
                ImageRecord {
                    image,
                    device,
                    extent,
                    format,
                    is_swapchain_image: true,
                    resolved: None,
                },
            );
        }
        true
    }

    pub fn register_image(&mut self, record: ImageRecord) {
        if self.images.insert(record.image, record).is_some() {
            tracing::debug!(image = ?record.image, "evicted stale image record");
        }
    }

    pub fn unregister_image(&mut self, image: vk::Image) {
        self.images.remove(&image);
    }

    pub fn image(&self, image: vk::Image) -> Lookup<&ImageRecord> {
        self.images.get(&image).into()
    }

    pub fn set_resolved_format(&mut self, image: vk::Image, resolved: ResolvedFormat) {
        if let Some(record) = self.images.get_mut(&image) {
            record.resolved = Some(resolved);
        }
    }

    // Render-pass scoped capture

    pub fn register_image_view(&mut self, view: vk::ImageView, image: vk::Image) {
        self.image_views.insert(view, image);
    }

    pub fn unregister_image_view(&mut self, view: vk::ImageView) {
        self.image_views.remove(&view);
    }

    /// Resolve attachment views to images, keeping the first occurrence of each.
    pub fn register_framebuffer(&mut self, framebuffer: vk::Framebuffer, views: &[vk::ImageView]) {
        let mut images: SmallVec<[vk::Image; 4]> = SmallVec::new();
        for view in views {
            match self.image_views.get(view) {
                Some(image) if !images.contains(image) => images.push(*image),
                Some(_) => {}
                None => tracing::debug!(?view, "framebuffer attachment view is not tracked"),
            }
        }
        self.framebuffers.insert(framebuffer, images);
    }

    pub fn unregister_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.framebuffers.remove(&framebuffer);
    }

    pub fn framebuffer_images(&self, framebuffer: vk::Framebuffer) -> Lookup<&[vk::Image]> {
        self.framebuffers.get(&framebuffer).map(|images| images.as_slice()).into()
    }

    pub fn register_render_pass(&mut self, render_pass: vk::RenderPass, index: u32) {
        self.render_passes.insert(render_pass, index);
    }

    pub fn unregister_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.render_passes.remove(&render_pass);
    }

    pub fn render_pass_index(&self, render_pass: vk::RenderPass) -> Lookup<u32> {
        self.render_passes.get(&render_pass).copied().into()
    }

    /// Forget every capture-related record.
    ///
    /// Device contexts and the owner index stay: the application keeps using
    /// those devices and every call still has to reach the next layer.
    pub fn reset_capture_state(&mut self) {
        self.physical_devices.clear();
        self.swapchains.clear();
        self.images.clear();
        self.image_views.clear();
        self.framebuffers.clear();
        self.render_passes.clear();
    }

    /// True when no capture-related record is held.
    pub fn is_capture_state_empty(&self) -> bool {
        self.physical_devices.is_empty()
            && self.swapchains.is_empty()
            && self.images.is_empty()
            && self.image_views.is_empty()
            && self.framebuffers.is_empty()
            && self.render_passes.is_empty()
    }
}
