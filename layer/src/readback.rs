//! Image readback pipeline
//!
//! Copies a source image into host-visible memory in a pixel encoding the file
//! emitter understands. The destination format is derived from the requested
//! color-space family and reconciled with the source's compatibility class;
//! the copy itself is a plain copy, a blit, or a blit to an optimal-tiled
//! intermediate followed by an untiling copy, depending on what the device
//! supports.

use ash::prelude::VkResult;
use ash::vk;
use smallvec::SmallVec;
use tracegrab_shared::{ColorSpace, ColorSpaceOverride};

use crate::format::{family_variant, format_name, FormatInfo};
use crate::shadow::{CaptureQueue, ImageRecord, ResolvedFormat};

/// Errors on the capture path.
///
/// None of these reach the application: callers log them and skip the capture.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("image {0:?} is not tracked")]
    UnknownImage(vk::Image),
    #[error("swapchain {0:?} is not tracked")]
    UnknownSwapchain(vk::SwapchainKHR),
    #[error("present carries no swapchain")]
    NoSwapchain,
    #[error("device owning the capture target is not tracked")]
    UnknownDevice,
    #[error("device has no graphics queue to capture on")]
    NoCaptureQueue,
    #[error("stencil-only format {0:?} cannot be captured")]
    StencilOnly(vk::Format),
    #[error("format {0:?} is not supported for capture")]
    UnsupportedFormat(vk::Format),
    #[error("no memory type with {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
    #[error("Format NOT supported yet! ({0}-byte elements)")]
    UnsupportedElementSize(u32),
    #[error("mapped image is {mapped} bytes, layout needs {needed}")]
    Layout { needed: u64, mapped: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> CaptureError {
    move |result| CaptureError::Vulkan { call, result }
}

/// Parameters of an image the pipeline allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub tiling: vk::ImageTiling,
}

/// One image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// The device calls the readback pipeline needs.
///
/// Implemented over the next layer's dispatch table in production and by a
/// recording mock in tests.
pub trait ReadbackDevice {
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties;
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn queue_family_flags(&self, queue_family_index: u32) -> vk::QueueFlags;

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    fn destroy_image(&self, image: vk::Image);
    fn free_memory(&self, memory: vk::DeviceMemory);

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    /// Allocate a primary command buffer with its loader dispatch initialised.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &ImageBarrier,
    );
    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    );
    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    );

    fn device_wait_idle(&self) -> VkResult<()>;
    fn queue_submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    fn subresource_layout(&self, image: vk::Image, aspect: vk::ImageAspectFlags) -> vk::SubresourceLayout;
    /// Map `size` bytes of `memory`, hand them to `read` and unmap again.
    fn read_memory<R>(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> VkResult<R>;
}

/// How pixels get from the source to host-visible memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadbackPath {
    /// Source and destination share a format
    Copy,
    /// Blit straight into a linear image
    Blit,
    /// Blit into an optimal image, then copy into a linear one
    BlitThenCopy,
    /// No blit support at all; colors may be wrong
    DegradedCopy,
}

impl ReadbackPath {
    pub fn is_two_step(&self) -> bool {
        *self == ReadbackPath::BlitThenCopy
    }

    /// Decide the path from the device's blit support for `destination`.
    pub fn select<D: ReadbackDevice>(device: &D, source: vk::Format, destination: vk::Format) -> Self {
        if source == destination {
            return ReadbackPath::Copy;
        }
        let properties = device.format_properties(destination);
        let blit_linear = properties
            .linear_tiling_features
            .contains(vk::FormatFeatureFlags::BLIT_DST);
        let blit_optimal = properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::BLIT_DST);
        match (blit_linear, blit_optimal) {
            (true, _) => ReadbackPath::Blit,
            (false, true) => ReadbackPath::BlitThenCopy,
            (false, false) => {
                tracing::warn!(
                    format = %format_name(destination),
                    "Cannot blit to either target tiling type, so copy is needed"
                );
                ReadbackPath::DegradedCopy
            }
        }
    }
}

/// Everything decided before any device object is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationPlan {
    pub source: FormatInfo,
    pub destination: FormatInfo,
    /// False when the emitter writes raw texels
    pub color_conversion: bool,
    pub path: ReadbackPath,
}

impl DestinationPlan {
    pub fn resolved(&self) -> ResolvedFormat {
        ResolvedFormat {
            format: self.destination.format,
            color_conversion: self.color_conversion,
        }
    }
}

/// Pick the destination format for `source` and reconcile it with the
/// source's compatibility class.
///
/// `fallback_warned` suppresses repeats of the UNORM fallback warning.
pub fn resolve_destination(
    source: &FormatInfo,
    color_space: ColorSpaceOverride,
    fallback_warned: &mut bool,
) -> Result<ResolvedFormat, CaptureError> {
    if source.is_stencil_only() {
        return Err(CaptureError::StencilOnly(source.format));
    }

    let requested = match color_space {
        ColorSpaceOverride::Family(family) => family_variant(family, source.channels),
        ColorSpaceOverride::Swapchain => source
            .family
            .and_then(|family| family_variant(family, source.channels)),
    };
    let chosen = match requested {
        Some(format) => format,
        None => {
            if !*fallback_warned {
                *fallback_warned = true;
                tracing::warn!(
                    format = %format_name(source.format),
                    "Swapchain format is not in the list, UNORM colorspace will be used instead"
                );
            }
            family_variant(ColorSpace::Unorm, source.channels)
                .ok_or(CaptureError::UnsupportedFormat(source.format))?
        }
    };
    let destination = FormatInfo::of(chosen).ok_or(CaptureError::UnsupportedFormat(chosen))?;

    let four_by_four = source.element_size == 4 && source.channels == 4;
    let forced = if source.is_nonlinear_or_signed() {
        vk::Format::R8G8B8A8_SRGB
    } else {
        vk::Format::R8G8B8A8_UNORM
    };

    let resolved = if destination.compatibility_class() != source.compatibility_class() {
        if four_by_four {
            tracing::warn!(
                "Dest {} format is not compatible with {} format, will save raw data",
                format_name(destination.format),
                format_name(source.format)
            );
            ResolvedFormat {
                format: source.format,
                color_conversion: false,
            }
        } else {
            ResolvedFormat {
                format: forced,
                color_conversion: true,
            }
        }
    } else if !four_by_four {
        ResolvedFormat {
            format: forced,
            color_conversion: true,
        }
    } else {
        ResolvedFormat {
            format: destination.format,
            color_conversion: true,
        }
    };
    Ok(resolved)
}

/// Where the readback commands are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandContext {
    /// A one-shot pool and buffer owned by the capture, submitted and waited on
    Private(CaptureQueue),
    /// Appended to the caller's command buffer without submission
    Caller(vk::CommandBuffer),
}

/// Device objects created for one capture
#[derive(Debug, Default)]
struct ReadbackResources {
    images: SmallVec<[vk::Image; 2]>,
    memory: SmallVec<[vk::DeviceMemory; 2]>,
    command_pool: Option<vk::CommandPool>,
}

impl ReadbackResources {
    fn is_empty(&self) -> bool {
        self.images.is_empty() && self.memory.is_empty() && self.command_pool.is_none()
    }

    fn release<D: ReadbackDevice>(&mut self, device: &D) {
        for image in self.images.drain(..) {
            device.destroy_image(image);
        }
        for memory in self.memory.drain(..) {
            device.free_memory(memory);
        }
        if let Some(pool) = self.command_pool.take() {
            device.destroy_command_pool(pool);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

/// A finished (or, for caller command buffers, recorded) readback.
///
/// [`CaptureHandle::release`] must be called on every path; dropping a handle
/// without it leaks the device objects and logs a warning.
#[derive(Debug)]
pub struct CaptureHandle {
    resources: ReadbackResources,
    plan: DestinationPlan,
    source: ImageRecord,
    output: OutputImage,
}

impl CaptureHandle {
    pub fn plan(&self) -> &DestinationPlan {
        &self.plan
    }

    pub fn source(&self) -> &ImageRecord {
        &self.source
    }

    /// Linear, host-visible image holding the pixels
    pub fn output_image(&self) -> vk::Image {
        self.output.image
    }

    pub fn output_memory(&self) -> vk::DeviceMemory {
        self.output.memory
    }

    pub fn output_size(&self) -> vk::DeviceSize {
        self.output.size
    }

    /// Destroy every device object the capture created.
    pub fn release<D: ReadbackDevice>(mut self, device: &D) {
        self.resources.release(device);
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            tracing::warn!(image = ?self.source.image, "capture dropped without release, readback resources leaked");
        }
    }
}

fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (properties.memory_type_count as usize).min(properties.memory_types.len());
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags))
        .map(|(index, _)| index as u32)
}

fn allocate_image<D: ReadbackDevice>(
    device: &D,
    resources: &mut ReadbackResources,
    desc: &ImageDesc,
    flags: vk::MemoryPropertyFlags,
) -> Result<OutputImage, CaptureError> {
    let image = device.create_image(desc).map_err(vulkan("vkCreateImage"))?;
    resources.images.push(image);

    let requirements = device.image_memory_requirements(image);
    let memory_type = find_memory_type(&device.memory_properties(), requirements.memory_type_bits, flags)
        .ok_or(CaptureError::NoMemoryType(flags))?;
    let memory = device
        .allocate_memory(requirements.size, memory_type)
        .map_err(vulkan("vkAllocateMemory"))?;
    resources.memory.push(memory);

    device
        .bind_image_memory(image, memory)
        .map_err(vulkan("vkBindImageMemory"))?;
    Ok(OutputImage {
        image,
        memory,
        size: requirements.size,
    })
}

/// Read `source` back into host memory.
///
/// With [`CommandContext::Private`] the copy has completed when this returns;
/// with [`CommandContext::Caller`] it completes when the caller's command
/// buffer has executed. Partially created objects are released on failure.
pub fn capture<D: ReadbackDevice>(
    device: &D,
    source: &ImageRecord,
    color_space: ColorSpaceOverride,
    context: CommandContext,
    fallback_warned: &mut bool,
) -> Result<CaptureHandle, CaptureError> {
    let source_info = FormatInfo::of(source.format).ok_or(CaptureError::UnsupportedFormat(source.format))?;
    let resolved = match source.resolved {
        Some(resolved) => resolved,
        None => resolve_destination(&source_info, color_space, fallback_warned)?,
    };
    let destination = FormatInfo::of(resolved.format).ok_or(CaptureError::UnsupportedFormat(resolved.format))?;
    let plan = DestinationPlan {
        source: source_info,
        destination,
        color_conversion: resolved.color_conversion,
        path: ReadbackPath::select(device, source.format, resolved.format),
    };
    tracing::debug!(
        image = ?source.image,
        src = %format_name(source.format),
        dst = %format_name(resolved.format),
        path = ?plan.path,
        "capturing image"
    );

    let mut resources = ReadbackResources::default();
    match record(device, source, &plan, context, &mut resources) {
        Ok(output) => Ok(CaptureHandle {
            resources,
            plan,
            source: *source,
            output,
        }),
        Err(err) => {
            resources.release(device);
            Err(err)
        }
    }
}

fn record<D: ReadbackDevice>(
    device: &D,
    source: &ImageRecord,
    plan: &DestinationPlan,
    context: CommandContext,
    resources: &mut ReadbackResources,
) -> Result<OutputImage, CaptureError> {
    let two_step = plan.path.is_two_step();
    let (tiling, flags) = if two_step {
        (vk::ImageTiling::OPTIMAL, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    } else {
        (vk::ImageTiling::LINEAR, vk::MemoryPropertyFlags::HOST_VISIBLE)
    };
    let desc = ImageDesc {
        format: plan.destination.format,
        extent: source.extent,
        tiling,
    };
    let first = allocate_image(device, resources, &desc, flags)?;
    let output = if two_step {
        let desc = ImageDesc {
            tiling: vk::ImageTiling::LINEAR,
            ..desc
        };
        allocate_image(device, resources, &desc, vk::MemoryPropertyFlags::HOST_VISIBLE)?
    } else {
        first
    };

    let command_buffer = match context {
        CommandContext::Private(queue) => {
            let pool = device
                .create_command_pool(queue.family_index)
                .map_err(vulkan("vkCreateCommandPool"))?;
            resources.command_pool = Some(pool);
            let command_buffer = device
                .allocate_command_buffer(pool)
                .map_err(vulkan("vkAllocateCommandBuffers"))?;
            device
                .begin_command_buffer(command_buffer)
                .map_err(vulkan("vkBeginCommandBuffer"))?;
            command_buffer
        }
        CommandContext::Caller(command_buffer) => command_buffer,
    };

    record_commands(device, command_buffer, source, plan, first.image, output.image);

    if let CommandContext::Private(queue) = context {
        device
            .end_command_buffer(command_buffer)
            .map_err(vulkan("vkEndCommandBuffer"))?;
        device.device_wait_idle().map_err(vulkan("vkDeviceWaitIdle"))?;
        device
            .queue_submit(queue.queue, command_buffer)
            .map_err(vulkan("vkQueueSubmit"))?;
        device
            .queue_wait_idle(queue.queue)
            .map_err(vulkan("vkQueueWaitIdle"))?;
    }
    Ok(output)
}

fn record_commands<D: ReadbackDevice>(
    device: &D,
    command_buffer: vk::CommandBuffer,
    source: &ImageRecord,
    plan: &DestinationPlan,
    first: vk::Image,
    output: vk::Image,
) {
    let aspect = plan.destination.aspect_mask();
    let extent = source.extent;
    let transfer = vk::PipelineStageFlags::TRANSFER;
    let barrier = |image, old_layout, new_layout, src_access, dst_access| ImageBarrier {
        image,
        old_layout,
        new_layout,
        src_access,
        dst_access,
        aspect,
    };
    let (source_layout, restored_layout) = if source.is_swapchain_image {
        (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::PRESENT_SRC_KHR)
    } else {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
    };

    device.cmd_image_barrier(
        command_buffer,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        transfer,
        &barrier(
            source.image,
            source_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::TRANSFER_READ,
        ),
    );
    device.cmd_image_barrier(
        command_buffer,
        transfer,
        transfer,
        &barrier(
            first,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        ),
    );

    match plan.path {
        ReadbackPath::Copy | ReadbackPath::DegradedCopy => {
            device.cmd_copy_image(command_buffer, source.image, first, extent, aspect)
        }
        ReadbackPath::Blit | ReadbackPath::BlitThenCopy => {
            device.cmd_blit_image(command_buffer, source.image, first, extent, aspect)
        }
    }

    if plan.path.is_two_step() {
        device.cmd_image_barrier(
            command_buffer,
            transfer,
            transfer,
            &barrier(
                output,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        );
        device.cmd_image_barrier(
            command_buffer,
            transfer,
            transfer,
            &barrier(
                first,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
        );
        device.cmd_copy_image(command_buffer, first, output, extent, aspect);
    }

    device.cmd_image_barrier(
        command_buffer,
        transfer,
        transfer,
        &barrier(
            output,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::MEMORY_READ,
        ),
    );
    device.cmd_image_barrier(
        command_buffer,
        transfer,
        transfer,
        &barrier(
            source.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            restored_layout,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::empty(),
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Command, MockDevice};
    use ash::vk::Handle;

    fn record(format: vk::Format, is_swapchain_image: bool) -> ImageRecord {
        ImageRecord {
            image: vk::Image::from_raw(0x5000),
            device: vk::Device::from_raw(1),
            extent: vk::Extent2D { width: 4, height: 2 },
            format,
            is_swapchain_image,
            resolved: None,
        }
    }

    fn info(format: vk::Format) -> FormatInfo {
        FormatInfo::of(format).unwrap()
    }

    fn private() -> CommandContext {
        CommandContext::Private(CaptureQueue {
            queue: vk::Queue::from_raw(0x77),
            family_index: 0,
        })
    }

    #[test]
    fn test_mirror_swapchain_family() {
        let mut warned = false;
        let resolved =
            resolve_destination(&info(vk::Format::B8G8R8A8_SRGB), ColorSpaceOverride::Swapchain, &mut warned)
                .unwrap();
        assert_eq!(resolved.format, vk::Format::R8G8B8A8_SRGB);
        assert!(resolved.color_conversion);
        assert!(!warned);
    }

    #[test]
    fn test_requested_family() {
        let mut warned = false;
        let resolved = resolve_destination(
            &info(vk::Format::B8G8R8A8_UNORM),
            ColorSpaceOverride::Family(ColorSpace::Uint),
            &mut warned,
        )
        .unwrap();
        assert_eq!(resolved.format, vk::Format::R8G8B8A8_UINT);
    }

    #[test]
    fn test_incompatible_four_byte_source_saves_raw() {
        let mut warned = false;
        let resolved = resolve_destination(
            &info(vk::Format::R8G8B8A8_UNORM),
            ColorSpaceOverride::Family(ColorSpace::Sfloat),
            &mut warned,
        )
        .unwrap();
        assert_eq!(resolved.format, vk::Format::R8G8B8A8_UNORM);
        assert!(!resolved.color_conversion);
    }

    #[test]
    fn test_wide_sources_are_forced_to_eight_bit() {
        let mut warned = false;
        let hdr = resolve_destination(
            &info(vk::Format::R16G16B16A16_SFLOAT),
            ColorSpaceOverride::Swapchain,
            &mut warned,
        )
        .unwrap();
        assert_eq!(hdr.format, vk::Format::R8G8B8A8_SRGB);

        let rgb = resolve_destination(&info(vk::Format::R8G8B8_UNORM), ColorSpaceOverride::Swapchain, &mut warned)
            .unwrap();
        assert_eq!(rgb.format, vk::Format::R8G8B8A8_UNORM);
        assert!(rgb.color_conversion);
    }

    #[test]
    fn test_unknown_family_falls_back_to_unorm_once() {
        let mut warned = false;
        let source = info(vk::Format::B10G11R11_UFLOAT_PACK32);
        let resolved = resolve_destination(&source, ColorSpaceOverride::Swapchain, &mut warned).unwrap();
        assert!(warned);
        assert_eq!(resolved.format, vk::Format::R8G8B8A8_UNORM);
        assert!(resolve_destination(&source, ColorSpaceOverride::Swapchain, &mut warned).is_ok());
    }

    #[test]
    fn test_stencil_only_is_refused() {
        let mut warned = false;
        let result = resolve_destination(&info(vk::Format::S8_UINT), ColorSpaceOverride::Swapchain, &mut warned);
        assert!(matches!(result, Err(CaptureError::StencilOnly(_))));
    }

    #[test]
    fn test_path_selection() {
        let device = MockDevice::new();
        assert_eq!(
            ReadbackPath::select(&device, vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_UNORM),
            ReadbackPath::Copy
        );
        assert_eq!(
            ReadbackPath::select(&device, vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM),
            ReadbackPath::Blit
        );
        device.set_blit_support(vk::Format::R8G8B8A8_UNORM, false, true);
        assert_eq!(
            ReadbackPath::select(&device, vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM),
            ReadbackPath::BlitThenCopy
        );
        device.set_blit_support(vk::Format::R8G8B8A8_UNORM, false, false);
        assert_eq!(
            ReadbackPath::select(&device, vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM),
            ReadbackPath::DegradedCopy
        );
    }

    #[test]
    fn test_private_blit_capture_sequence() {
        let device = MockDevice::new();
        let source = record(vk::Format::B8G8R8A8_UNORM, true);
        let mut warned = false;
        let handle = capture(&device, &source, ColorSpaceOverride::Swapchain, private(), &mut warned).unwrap();
        assert_eq!(handle.plan().path, ReadbackPath::Blit);

        let commands = device.commands();
        let barriers: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                Command::Barrier(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 4);
        assert_eq!(barriers[0].image, source.image);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barriers[2].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(barriers[3].new_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        assert!(commands.iter().any(|c| matches!(c, Command::Blit { .. })));
        let submit = commands.iter().position(|c| matches!(c, Command::QueueSubmit { .. })).unwrap();
        let idle = commands.iter().position(|c| matches!(c, Command::DeviceWaitIdle)).unwrap();
        assert!(idle < submit);
        assert!(matches!(commands.last(), Some(Command::QueueWaitIdle(_))));

        handle.release(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_two_step_uses_device_local_intermediate() {
        let device = MockDevice::new();
        device.set_blit_support(vk::Format::R8G8B8A8_UNORM, false, true);
        let source = record(vk::Format::B8G8R8A8_UNORM, false);
        let mut warned = false;
        let handle = capture(&device, &source, ColorSpaceOverride::Swapchain, private(), &mut warned).unwrap();
        assert_eq!(handle.plan().path, ReadbackPath::BlitThenCopy);

        let created: Vec<_> = device
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::CreateImage(desc) => Some(desc.tiling),
                _ => None,
            })
            .collect();
        assert_eq!(created, [vk::ImageTiling::OPTIMAL, vk::ImageTiling::LINEAR]);
        assert_eq!(
            device.memory_type_of(handle.output_memory()),
            Some(MockDevice::HOST_VISIBLE_TYPE)
        );
        let copies = device
            .commands()
            .iter()
            .filter(|c| matches!(c, Command::Copy { .. }))
            .count();
        assert_eq!(copies, 1);
        handle.release(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_caller_context_is_not_submitted() {
        let device = MockDevice::new();
        let source = record(vk::Format::R8G8B8A8_UNORM, false);
        let cb = vk::CommandBuffer::from_raw(0x99);
        let mut warned = false;
        let handle = capture(
            &device,
            &source,
            ColorSpaceOverride::Swapchain,
            CommandContext::Caller(cb),
            &mut warned,
        )
        .unwrap();
        let commands = device.commands();
        assert!(!commands.iter().any(|c| matches!(c, Command::QueueSubmit { .. })));
        assert!(!commands.iter().any(|c| matches!(c, Command::CreateCommandPool(_))));
        assert!(commands.iter().any(|c| matches!(c, Command::Copy { command_buffer, .. } if *command_buffer == cb)));
        handle.release(&device);
    }

    #[test]
    fn test_failure_releases_partial_resources() {
        let device = MockDevice::new();
        device.fail_on("allocate_memory");
        let source = record(vk::Format::B8G8R8A8_UNORM, true);
        let mut warned = false;
        let result = capture(&device, &source, ColorSpaceOverride::Swapchain, private(), &mut warned);
        assert!(matches!(
            result,
            Err(CaptureError::Vulkan {
                call: "vkAllocateMemory",
                ..
            })
        ));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_cached_resolution_is_reused() {
        let device = MockDevice::new();
        let mut source = record(vk::Format::R8G8B8A8_UNORM, false);
        source.resolved = Some(ResolvedFormat {
            format: vk::Format::R8G8B8A8_UNORM,
            color_conversion: false,
        });
        let mut warned = false;
        let handle = capture(
            &device,
            &source,
            ColorSpaceOverride::Family(ColorSpace::Sint),
            private(),
            &mut warned,
        )
        .unwrap();
        assert!(!handle.plan().color_conversion);
        assert_eq!(handle.plan().path, ReadbackPath::Copy);
        handle.release(&device);
    }
}
