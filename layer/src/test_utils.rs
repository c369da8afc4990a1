//! Test utilities for the screenshot layer
//!
//! A recording device that stands in for the driver: every call is logged,
//! memory is plain host vectors and copies move bytes between them.

use std::sync::Mutex;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use hashbrown::HashMap;

use crate::format::FormatInfo;
use crate::readback::{ImageBarrier, ImageDesc, ReadbackDevice};

/// A call observed by [`MockDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateImage(ImageDesc),
    AllocateMemory {
        memory: vk::DeviceMemory,
        memory_type_index: u32,
    },
    BindImageMemory(vk::Image, vk::DeviceMemory),
    DestroyImage(vk::Image),
    FreeMemory(vk::DeviceMemory),
    CreateCommandPool(u32),
    AllocateCommandBuffer(vk::CommandBuffer),
    DestroyCommandPool(vk::CommandPool),
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Barrier(ImageBarrier),
    Copy {
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
    },
    Blit {
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
    },
    DeviceWaitIdle,
    QueueSubmit {
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
    },
    QueueWaitIdle(vk::Queue),
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
}

struct MockMemory {
    memory_type_index: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    commands: Vec<Command>,
    images: HashMap<vk::Image, ImageDesc>,
    bindings: HashMap<vk::Image, vk::DeviceMemory>,
    memory: HashMap<vk::DeviceMemory, MockMemory>,
    pools: Vec<vk::CommandPool>,
    contents: HashMap<vk::Image, Vec<u8>>,
    blit_support: HashMap<vk::Format, (bool, bool)>,
    queue_flags: HashMap<u32, vk::QueueFlags>,
    fail_on: Option<&'static str>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }

    fn check(&self, call: &'static str) -> VkResult<()> {
        if self.fail_on == Some(call) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn image_bytes(&self, image: vk::Image) -> Option<Vec<u8>> {
        match self.bindings.get(&image) {
            Some(memory) => self.memory.get(memory).map(|m| m.data.clone()),
            None => self.contents.get(&image).cloned(),
        }
    }

    fn transfer(&mut self, src: vk::Image, dst: vk::Image) {
        let Some(bytes) = self.image_bytes(src) else {
            return;
        };
        let Some(memory) = self.bindings.get(&dst).copied() else {
            return;
        };
        if let Some(target) = self.memory.get_mut(&memory) {
            let len = bytes.len().min(target.data.len());
            target.data[..len].copy_from_slice(&bytes[..len]);
        }
    }
}

/// Driver stand-in for readback and session tests.
///
/// Memory type 0 is device local, type 1 host visible and coherent. Images
/// are tightly packed: row pitch is `width * element size`.
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub const DEVICE_LOCAL_TYPE: u32 = 0;
    pub const HOST_VISIBLE_TYPE: u32 = 1;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Blit-destination support for linear and optimal tiling (default: both).
    pub fn set_blit_support(&self, format: vk::Format, linear: bool, optimal: bool) {
        self.state().blit_support.insert(format, (linear, optimal));
    }

    pub fn set_queue_family_flags(&self, queue_family_index: u32, flags: vk::QueueFlags) {
        self.state().queue_flags.insert(queue_family_index, flags);
    }

    /// Make the named trait method fail from now on.
    pub fn fail_on(&self, call: &'static str) {
        self.state().fail_on = Some(call);
    }

    /// Texels a copy or blit out of `image` produces.
    pub fn set_image_contents(&self, image: vk::Image, bytes: Vec<u8>) {
        self.state().contents.insert(image, bytes);
    }

    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state().memory.get(&memory).map(|m| m.memory_type_index)
    }

    /// Images, allocations and pools not yet destroyed.
    pub fn live_objects(&self) -> usize {
        let state = self.state();
        state.images.len() + state.memory.len() + state.pools.len()
    }
}

impl ReadbackDevice for MockDevice {
    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let (linear, optimal) = self
            .state()
            .blit_support
            .get(&format)
            .copied()
            .unwrap_or((true, true));
        let flags = |supported: bool| {
            if supported {
                vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST
            } else {
                vk::FormatFeatureFlags::empty()
            }
        };
        vk::FormatProperties {
            linear_tiling_features: flags(linear),
            optimal_tiling_features: flags(optimal),
            buffer_features: vk::FormatFeatureFlags::empty(),
        }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 1,
            ..Default::default()
        };
        properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        properties.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        properties
    }

    fn queue_family_flags(&self, queue_family_index: u32) -> vk::QueueFlags {
        self.state()
            .queue_flags
            .get(&queue_family_index)
            .copied()
            .unwrap_or(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let mut state = self.state();
        state.check("create_image")?;
        let image = vk::Image::from_raw(state.handle());
        state.images.insert(image, *desc);
        state.commands.push(Command::CreateImage(*desc));
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state();
        let size = state
            .images
            .get(&image)
            .map(|desc| {
                let element = FormatInfo::of(desc.format).map_or(4, |info| info.element_size);
                u64::from(desc.extent.width) * u64::from(desc.extent.height) * u64::from(element)
            })
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 1,
            memory_type_bits: 0b11,
        }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state();
        state.check("allocate_memory")?;
        let memory = vk::DeviceMemory::from_raw(state.handle());
        state.memory.insert(
            memory,
            MockMemory {
                memory_type_index,
                data: vec![0; size as usize],
            },
        );
        state.commands.push(Command::AllocateMemory {
            memory,
            memory_type_index,
        });
        Ok(memory)
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state();
        state.check("bind_image_memory")?;
        state.bindings.insert(image, memory);
        state.commands.push(Command::BindImageMemory(image, memory));
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state();
        state.images.remove(&image);
        state.bindings.remove(&image);
        state.commands.push(Command::DestroyImage(image));
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        state.memory.remove(&memory);
        state.commands.push(Command::FreeMemory(memory));
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state();
        state.check("create_command_pool")?;
        let pool = vk::CommandPool::from_raw(state.handle());
        state.pools.push(pool);
        state.commands.push(Command::CreateCommandPool(queue_family_index));
        Ok(pool)
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state();
        state.check("allocate_command_buffer")?;
        let command_buffer = vk::CommandBuffer::from_raw(state.handle());
        state.commands.push(Command::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.pools.retain(|p| *p != pool);
        state.commands.push(Command::DestroyCommandPool(pool));
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        state.check("begin_command_buffer")?;
        state.commands.push(Command::Begin(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        state.check("end_command_buffer")?;
        state.commands.push(Command::End(command_buffer));
        Ok(())
    }

    fn cmd_image_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &ImageBarrier,
    ) {
        self.state().commands.push(Command::Barrier(*barrier));
    }

    fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        _extent: vk::Extent2D,
        _aspect: vk::ImageAspectFlags,
    ) {
        let mut state = self.state();
        state.transfer(src, dst);
        state.commands.push(Command::Copy {
            command_buffer,
            src,
            dst,
        });
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        _extent: vk::Extent2D,
        _aspect: vk::ImageAspectFlags,
    ) {
        let mut state = self.state();
        state.transfer(src, dst);
        state.commands.push(Command::Blit {
            command_buffer,
            src,
            dst,
        });
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        state.check("device_wait_idle")?;
        state.commands.push(Command::DeviceWaitIdle);
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        state.check("queue_submit")?;
        state.commands.push(Command::QueueSubmit {
            queue,
            command_buffer,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state();
        state.check("queue_wait_idle")?;
        state.commands.push(Command::QueueWaitIdle(queue));
        Ok(())
    }

    fn subresource_layout(&self, image: vk::Image, _aspect: vk::ImageAspectFlags) -> vk::SubresourceLayout {
        let state = self.state();
        let (row_pitch, height) = state
            .images
            .get(&image)
            .map(|desc| {
                let element = FormatInfo::of(desc.format).map_or(4, |info| info.element_size);
                (
                    u64::from(desc.extent.width) * u64::from(element),
                    u64::from(desc.extent.height),
                )
            })
            .unwrap_or((0, 0));
        vk::SubresourceLayout {
            offset: 0,
            size: row_pitch * height,
            row_pitch,
            array_pitch: 0,
            depth_pitch: 0,
        }
    }

    fn read_memory<R>(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> VkResult<R> {
        let bytes = {
            let mut state = self.state();
            state.check("map_memory")?;
            state.commands.push(Command::MapMemory(memory));
            state
                .memory
                .get(&memory)
                .map(|m| m.data.clone())
                .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?
        };
        let len = (size as usize).min(bytes.len());
        let result = read(&bytes[..len]);
        self.state().commands.push(Command::UnmapMemory(memory));
        Ok(result)
    }
}
