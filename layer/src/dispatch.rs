//! Next-layer dispatch tables
//!
//! Entry points of the next element in the loader chain, resolved once per
//! instance and per device, and the production [`ReadbackDevice`] built on
//! top of them.

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::readback::{ImageBarrier, ImageDesc, ReadbackDevice};

/// Loader callback that initialises the dispatch pointer of a device child.
pub type PfnSetDeviceLoaderData = unsafe extern "system" fn(vk::Device, *mut c_void) -> vk::Result;

/// A required entry point was not provided by the next layer.
#[derive(Debug, thiserror::Error)]
#[error("next layer does not provide {0:?}")]
pub struct MissingEntryPoint(pub &'static CStr);

/// Resolve `name` through a `vkGet*ProcAddr` style lookup.
///
/// # Safety
///
/// `T` must be the function pointer type of `name`.
unsafe fn lookup<H: Copy, T: Copy>(
    get_proc_addr: unsafe extern "system" fn(H, *const c_char) -> vk::PFN_vkVoidFunction,
    handle: H,
    name: &CStr,
) -> Option<T> {
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<unsafe extern "system" fn()>());
    let function = unsafe { get_proc_addr(handle, name.as_ptr()) }?;
    Some(unsafe { std::mem::transmute_copy::<unsafe extern "system" fn(), T>(&function) })
}

macro_rules! dispatch_table {
    (
        $(#[$meta:meta])*
        pub struct $name:ident for $handle:ty {
            required { $($req:ident: $req_pfn:ident = $req_sym:literal,)* }
            optional { $($opt:ident: $opt_pfn:ident = $opt_sym:literal,)* }
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        pub struct $name {
            $(pub $req: vk::$req_pfn,)*
            $(pub $opt: Option<vk::$opt_pfn>,)*
        }

        impl $name {
            /// Resolve every entry point through `get_proc_addr`.
            ///
            /// # Safety
            ///
            /// `get_proc_addr` must be the next layer's lookup valid for `handle`.
            pub unsafe fn load(
                handle: $handle,
                get_proc_addr: unsafe extern "system" fn($handle, *const c_char) -> vk::PFN_vkVoidFunction,
            ) -> Result<Self, MissingEntryPoint> {
                Ok(Self {
                    $($req: unsafe { lookup(get_proc_addr, handle, $req_sym) }
                        .ok_or(MissingEntryPoint($req_sym))?,)*
                    $($opt: unsafe { lookup(get_proc_addr, handle, $opt_sym) },)*
                })
            }
        }
    };
}

dispatch_table! {
    /// Instance-level entry points of the next layer
    pub struct InstanceTable for vk::Instance {
        required {
            destroy_instance: PFN_vkDestroyInstance = c"vkDestroyInstance",
            enumerate_physical_devices: PFN_vkEnumeratePhysicalDevices = c"vkEnumeratePhysicalDevices",
            get_physical_device_queue_family_properties: PFN_vkGetPhysicalDeviceQueueFamilyProperties =
                c"vkGetPhysicalDeviceQueueFamilyProperties",
            get_physical_device_format_properties: PFN_vkGetPhysicalDeviceFormatProperties =
                c"vkGetPhysicalDeviceFormatProperties",
            get_physical_device_memory_properties: PFN_vkGetPhysicalDeviceMemoryProperties =
                c"vkGetPhysicalDeviceMemoryProperties",
        }
        optional {
            enumerate_physical_device_groups: PFN_vkEnumeratePhysicalDeviceGroups =
                c"vkEnumeratePhysicalDeviceGroups",
            enumerate_physical_device_groups_khr: PFN_vkEnumeratePhysicalDeviceGroups =
                c"vkEnumeratePhysicalDeviceGroupsKHR",
        }
    }
}

dispatch_table! {
    /// Device-level entry points of the next layer
    pub struct DeviceTable for vk::Device {
        required {
            destroy_device: PFN_vkDestroyDevice = c"vkDestroyDevice",
            get_device_queue: PFN_vkGetDeviceQueue = c"vkGetDeviceQueue",
            device_wait_idle: PFN_vkDeviceWaitIdle = c"vkDeviceWaitIdle",
            queue_submit: PFN_vkQueueSubmit = c"vkQueueSubmit",
            queue_wait_idle: PFN_vkQueueWaitIdle = c"vkQueueWaitIdle",
            create_image: PFN_vkCreateImage = c"vkCreateImage",
            destroy_image: PFN_vkDestroyImage = c"vkDestroyImage",
            get_image_memory_requirements: PFN_vkGetImageMemoryRequirements = c"vkGetImageMemoryRequirements",
            get_image_subresource_layout: PFN_vkGetImageSubresourceLayout = c"vkGetImageSubresourceLayout",
            allocate_memory: PFN_vkAllocateMemory = c"vkAllocateMemory",
            free_memory: PFN_vkFreeMemory = c"vkFreeMemory",
            bind_image_memory: PFN_vkBindImageMemory = c"vkBindImageMemory",
            map_memory: PFN_vkMapMemory = c"vkMapMemory",
            unmap_memory: PFN_vkUnmapMemory = c"vkUnmapMemory",
            create_image_view: PFN_vkCreateImageView = c"vkCreateImageView",
            destroy_image_view: PFN_vkDestroyImageView = c"vkDestroyImageView",
            create_framebuffer: PFN_vkCreateFramebuffer = c"vkCreateFramebuffer",
            destroy_framebuffer: PFN_vkDestroyFramebuffer = c"vkDestroyFramebuffer",
            create_render_pass: PFN_vkCreateRenderPass = c"vkCreateRenderPass",
            destroy_render_pass: PFN_vkDestroyRenderPass = c"vkDestroyRenderPass",
            create_command_pool: PFN_vkCreateCommandPool = c"vkCreateCommandPool",
            destroy_command_pool: PFN_vkDestroyCommandPool = c"vkDestroyCommandPool",
            allocate_command_buffers: PFN_vkAllocateCommandBuffers = c"vkAllocateCommandBuffers",
            begin_command_buffer: PFN_vkBeginCommandBuffer = c"vkBeginCommandBuffer",
            end_command_buffer: PFN_vkEndCommandBuffer = c"vkEndCommandBuffer",
            cmd_pipeline_barrier: PFN_vkCmdPipelineBarrier = c"vkCmdPipelineBarrier",
            cmd_copy_image: PFN_vkCmdCopyImage = c"vkCmdCopyImage",
            cmd_blit_image: PFN_vkCmdBlitImage = c"vkCmdBlitImage",
            cmd_begin_render_pass: PFN_vkCmdBeginRenderPass = c"vkCmdBeginRenderPass",
            cmd_end_render_pass: PFN_vkCmdEndRenderPass = c"vkCmdEndRenderPass",
            cmd_execute_commands: PFN_vkCmdExecuteCommands = c"vkCmdExecuteCommands",
        }
        optional {
            get_device_queue2: PFN_vkGetDeviceQueue2 = c"vkGetDeviceQueue2",
            queue_submit2: PFN_vkQueueSubmit2 = c"vkQueueSubmit2",
            queue_submit2_khr: PFN_vkQueueSubmit2 = c"vkQueueSubmit2KHR",
            create_render_pass2: PFN_vkCreateRenderPass2 = c"vkCreateRenderPass2",
            create_render_pass2_khr: PFN_vkCreateRenderPass2 = c"vkCreateRenderPass2KHR",
            cmd_begin_render_pass2: PFN_vkCmdBeginRenderPass2 = c"vkCmdBeginRenderPass2",
            cmd_begin_render_pass2_khr: PFN_vkCmdBeginRenderPass2 = c"vkCmdBeginRenderPass2KHR",
            cmd_end_render_pass2: PFN_vkCmdEndRenderPass2 = c"vkCmdEndRenderPass2",
            cmd_end_render_pass2_khr: PFN_vkCmdEndRenderPass2 = c"vkCmdEndRenderPass2KHR",
            create_swapchain_khr: PFN_vkCreateSwapchainKHR = c"vkCreateSwapchainKHR",
            get_swapchain_images_khr: PFN_vkGetSwapchainImagesKHR = c"vkGetSwapchainImagesKHR",
            queue_present_khr: PFN_vkQueuePresentKHR = c"vkQueuePresentKHR",
        }
    }
}

/// An instance created through this layer
pub struct InstanceDispatch {
    pub instance: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub table: InstanceTable,
}

impl InstanceDispatch {
    /// # Safety
    ///
    /// `instance` must have just been created through `get_instance_proc_addr`.
    pub unsafe fn load(
        instance: vk::Instance,
        get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    ) -> Result<Self, MissingEntryPoint> {
        Ok(Self {
            instance,
            get_instance_proc_addr,
            table: unsafe { InstanceTable::load(instance, get_instance_proc_addr) }?,
        })
    }

    /// Forward an unhooked name to the next layer.
    pub unsafe fn proc_addr(&self, name: *const c_char) -> vk::PFN_vkVoidFunction {
        unsafe { (self.get_instance_proc_addr)(self.instance, name) }
    }
}

/// A device created through this layer
pub struct VulkanDevice {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub instance: Arc<InstanceDispatch>,
    pub table: DeviceTable,
    set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

impl VulkanDevice {
    /// # Safety
    ///
    /// `device` must have just been created on `physical_device` through the
    /// chain `get_device_proc_addr` belongs to.
    pub unsafe fn load(
        device: vk::Device,
        physical_device: vk::PhysicalDevice,
        get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
        instance: Arc<InstanceDispatch>,
        set_device_loader_data: Option<PfnSetDeviceLoaderData>,
    ) -> Result<Self, MissingEntryPoint> {
        Ok(Self {
            device,
            physical_device,
            get_device_proc_addr,
            instance,
            table: unsafe { DeviceTable::load(device, get_device_proc_addr) }?,
            set_device_loader_data,
        })
    }

    /// Forward an unhooked name to the next layer.
    pub unsafe fn proc_addr(&self, name: *const c_char) -> vk::PFN_vkVoidFunction {
        unsafe { (self.get_device_proc_addr)(self.device, name) }
    }

    /// Give a command buffer allocated by the layer the loader dispatch
    /// pointer the application's buffers get from the trampoline.
    fn init_loader_data(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let object = command_buffer.as_raw() as *mut c_void;
        match self.set_device_loader_data {
            Some(set_loader_data) => unsafe { set_loader_data(self.device, object) }.result(),
            None => {
                unsafe {
                    *(object as *mut *const c_void) = *(self.device.as_raw() as *const *const c_void);
                }
                Ok(())
            }
        }
    }
}

fn subresource_layers(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

impl ReadbackDevice for VulkanDevice {
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let mut properties = vk::FormatProperties::default();
        unsafe {
            (self.instance.table.get_physical_device_format_properties)(
                self.physical_device,
                format,
                &mut properties,
            )
        };
        properties
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        unsafe {
            (self.instance.table.get_physical_device_memory_properties)(self.physical_device, &mut properties)
        };
        properties
    }

    fn queue_family_flags(&self, queue_family_index: u32) -> vk::QueueFlags {
        let get = self.instance.table.get_physical_device_queue_family_properties;
        let mut count = 0;
        unsafe { get(self.physical_device, &mut count, ptr::null_mut()) };
        let mut families = vec![vk::QueueFamilyProperties::default(); count as usize];
        unsafe { get(self.physical_device, &mut count, families.as_mut_ptr()) };
        families
            .get(queue_family_index as usize)
            .map(|family| family.queue_flags)
            .unwrap_or_else(vk::QueueFlags::empty)
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let mut image = vk::Image::null();
        unsafe { (self.table.create_image)(self.device, &info, ptr::null(), &mut image) }.result_with_success(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let mut requirements = vk::MemoryRequirements::default();
        unsafe { (self.table.get_image_memory_requirements)(self.device, image, &mut requirements) };
        requirements
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let mut memory = vk::DeviceMemory::null();
        unsafe { (self.table.allocate_memory)(self.device, &info, ptr::null(), &mut memory) }
            .result_with_success(memory)
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { (self.table.bind_image_memory)(self.device, image, memory, 0) }.result()
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { (self.table.destroy_image)(self.device, image, ptr::null()) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { (self.table.free_memory)(self.device, memory, ptr::null()) }
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let mut pool = vk::CommandPool::null();
        unsafe { (self.table.create_command_pool)(self.device, &info, ptr::null(), &mut pool) }
            .result_with_success(pool)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut command_buffer = vk::CommandBuffer::null();
        unsafe { (self.table.allocate_command_buffers)(self.device, &info, &mut command_buffer) }.result()?;
        self.init_loader_data(command_buffer)?;
        Ok(command_buffer)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { (self.table.destroy_command_pool)(self.device, pool, ptr::null()) }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { (self.table.begin_command_buffer)(command_buffer, &info) }.result()
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { (self.table.end_command_buffer)(command_buffer) }.result()
    }

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &ImageBarrier,
    ) {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(barrier.aspect)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(range);
        unsafe {
            (self.table.cmd_pipeline_barrier)(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                1,
                &barrier,
            )
        }
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    ) {
        let region = vk::ImageCopy::default()
            .src_subresource(subresource_layers(aspect))
            .dst_subresource(subresource_layers(aspect))
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            (self.table.cmd_copy_image)(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                1,
                &region,
            )
        }
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    ) {
        let corners = [vk::Offset3D::default(), far_corner(extent)];
        let region = vk::ImageBlit::default()
            .src_subresource(subresource_layers(aspect))
            .src_offsets(corners)
            .dst_subresource(subresource_layers(aspect))
            .dst_offsets(corners);
        unsafe {
            (self.table.cmd_blit_image)(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                1,
                &region,
                vk::Filter::NEAREST,
            )
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { (self.table.device_wait_idle)(self.device) }.result()
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe { (self.table.queue_submit)(queue, 1, &submit, vk::Fence::null()) }.result()
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { (self.table.queue_wait_idle)(queue) }.result()
    }

    fn subresource_layout(&self, image: vk::Image, aspect: vk::ImageAspectFlags) -> vk::SubresourceLayout {
        let subresource = vk::ImageSubresource {
            aspect_mask: aspect,
            mip_level: 0,
            array_layer: 0,
        };
        let mut layout = vk::SubresourceLayout::default();
        unsafe { (self.table.get_image_subresource_layout)(self.device, image, &subresource, &mut layout) };
        layout
    }

    fn read_memory<R>(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> VkResult<R> {
        let mut data: *mut c_void = ptr::null_mut();
        unsafe {
            (self.table.map_memory)(
                self.device,
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
                &mut data,
            )
        }
        .result()?;
        let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) };
        let value = read(bytes);
        unsafe { (self.table.unmap_memory)(self.device, memory) };
        Ok(value)
    }
}
