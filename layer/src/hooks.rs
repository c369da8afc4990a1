//! Loader-facing entry points
//!
//! The three exported symbols the loader looks up, and the intercepted Vulkan
//! calls they hand out. Every hook calls down the chain and returns the next
//! layer's result untouched; session bookkeeping and captures happen around
//! that call.
//!
//! Session updates take the write lock. Forwarding only needs a resolved
//! dispatch table, which is looked up under the read lock and then used with
//! no lock held.

use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ash::vk::{self, Handle};
use hashbrown::HashMap;
use tracegrab_shared::ScreenshotEnv;
use tracing_subscriber::EnvFilter;

use crate::config::LayerConfig;
use crate::dispatch::{InstanceDispatch, PfnSetDeviceLoaderData, VulkanDevice};
use crate::session::SessionState;

// ── Loader ABI ──────────────────────────────────────────────────────────────

const VK_STRUCTURE_TYPE_LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
const VK_STRUCTURE_TYPE_LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

const VK_LAYER_LINK_INFO: u32 = 0;
const VK_LOADER_DATA_CALLBACK: u32 = 1;

#[repr(C)]
struct VkLayerInstanceLink {
    p_next: *mut VkLayerInstanceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_phys_dev_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
struct VkLayerInstanceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    u_layer_info: *mut VkLayerInstanceLink,
}

#[repr(C)]
struct VkLayerDeviceLink {
    p_next: *mut VkLayerDeviceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
struct VkLayerDeviceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    u_layer_info: *mut VkLayerDeviceLink,
}

/// `VkLayerDeviceCreateInfo` when `function` is the loader data callback
#[repr(C)]
struct VkLayerDeviceLoaderData {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: u32,
    pfn_set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct VkNegotiateLayerInterface {
    s_type: u32,
    p_next: *mut c_void,
    loader_layer_interface_version: u32,
    pfn_get_instance_proc_addr: *const c_void,
    pfn_get_device_proc_addr: *const c_void,
    pfn_get_physical_device_proc_addr: *const c_void,
}

// ── Global state ────────────────────────────────────────────────────────────

struct Layer {
    session: RwLock<SessionState<VulkanDevice>>,
    instances: Mutex<HashMap<vk::Instance, Arc<InstanceDispatch>>>,
    /// Devices by loader dispatch key, used when a handle missed the shadow table
    devices: Mutex<HashMap<usize, Arc<VulkanDevice>>>,
}

static LAYER: OnceLock<Layer> = OnceLock::new();

fn layer() -> &'static Layer {
    LAYER.get_or_init(|| {
        let config = LayerConfig::from_env(&ScreenshotEnv::from_process());
        tracing::debug!(?config, "screenshot layer configured");
        Layer {
            session: RwLock::new(SessionState::new(config)),
            instances: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
        }
    })
}

impl Layer {
    fn read(&self) -> RwLockReadGuard<'_, SessionState<VulkanDevice>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState<VulkanDevice>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<vk::Instance, Arc<InstanceDispatch>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<usize, Arc<VulkanDevice>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance(&self, instance: vk::Instance) -> Option<Arc<InstanceDispatch>> {
        self.instances().get(&instance).cloned()
    }

    fn by_dispatch_key(&self, handle: u64) -> Option<Arc<VulkanDevice>> {
        let key = unsafe { dispatch_key(handle) }?;
        let device = self.devices().get(&key).cloned();
        if device.is_none() {
            tracing::error!(handle = format_args!("{handle:#x}"), "no device owns this handle");
        }
        device
    }

    fn device(&self, device: vk::Device) -> Option<Arc<VulkanDevice>> {
        let found = self.read().resolve_device(device).found();
        found.or_else(|| self.by_dispatch_key(device.as_raw()))
    }

    fn queue_device(&self, queue: vk::Queue) -> Option<Arc<VulkanDevice>> {
        let found = self.read().resolve_queue(queue).found();
        found.or_else(|| self.by_dispatch_key(queue.as_raw()))
    }

    fn command_buffer_device(&self, command_buffer: vk::CommandBuffer) -> Option<Arc<VulkanDevice>> {
        let found = self.read().resolve_command_buffer(command_buffer).found();
        found.or_else(|| self.by_dispatch_key(command_buffer.as_raw()))
    }
}

/// The loader's dispatch table pointer stored at the start of every
/// dispatchable handle; `None` for a null handle.
unsafe fn dispatch_key(handle: u64) -> Option<usize> {
    if handle == 0 {
        return None;
    }
    Some(unsafe { *(handle as *const usize) })
}

unsafe fn slice<'a, T>(data: *const T, count: u32) -> &'a [T] {
    if data.is_null() || count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(data, count as usize) }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

macro_rules! hook {
    ($function:expr) => {
        Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>($function as *const ()) })
    };
}

// ── Loader negotiate ────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p: *mut VkNegotiateLayerInterface,
) -> vk::Result {
    init_logging();

    if p.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    unsafe {
        (*p).loader_layer_interface_version = 2;
        (*p).pfn_get_instance_proc_addr = tracegrab_GetInstanceProcAddr as *const c_void;
        (*p).pfn_get_device_proc_addr = tracegrab_GetDeviceProcAddr as *const c_void;
        (*p).pfn_get_physical_device_proc_addr = ptr::null();
    }
    vk::Result::SUCCESS
}

// ── Proc-addr routers ───────────────────────────────────────────────────────

fn instance_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    match name {
        b"vkGetInstanceProcAddr" => hook!(tracegrab_GetInstanceProcAddr),
        b"vkCreateInstance" => hook!(tracegrab_CreateInstance),
        b"vkDestroyInstance" => hook!(tracegrab_DestroyInstance),
        b"vkEnumeratePhysicalDevices" => hook!(tracegrab_EnumeratePhysicalDevices),
        b"vkEnumeratePhysicalDeviceGroups" => hook!(tracegrab_EnumeratePhysicalDeviceGroups),
        b"vkEnumeratePhysicalDeviceGroupsKHR" => hook!(tracegrab_EnumeratePhysicalDeviceGroupsKHR),
        b"vkCreateDevice" => hook!(tracegrab_CreateDevice),
        _ => None,
    }
}

fn device_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    match name {
        b"vkGetDeviceProcAddr" => hook!(tracegrab_GetDeviceProcAddr),
        b"vkDestroyDevice" => hook!(tracegrab_DestroyDevice),
        b"vkGetDeviceQueue" => hook!(tracegrab_GetDeviceQueue),
        b"vkGetDeviceQueue2" => hook!(tracegrab_GetDeviceQueue2),
        b"vkCreateSwapchainKHR" => hook!(tracegrab_CreateSwapchainKHR),
        b"vkGetSwapchainImagesKHR" => hook!(tracegrab_GetSwapchainImagesKHR),
        b"vkQueuePresentKHR" => hook!(tracegrab_QueuePresentKHR),
        b"vkAllocateCommandBuffers" => hook!(tracegrab_AllocateCommandBuffers),
        b"vkBeginCommandBuffer" => hook!(tracegrab_BeginCommandBuffer),
        b"vkCreateImage" => hook!(tracegrab_CreateImage),
        b"vkDestroyImage" => hook!(tracegrab_DestroyImage),
        b"vkCreateImageView" => hook!(tracegrab_CreateImageView),
        b"vkDestroyImageView" => hook!(tracegrab_DestroyImageView),
        b"vkCreateFramebuffer" => hook!(tracegrab_CreateFramebuffer),
        b"vkDestroyFramebuffer" => hook!(tracegrab_DestroyFramebuffer),
        b"vkCreateRenderPass" => hook!(tracegrab_CreateRenderPass),
        b"vkCreateRenderPass2" => hook!(tracegrab_CreateRenderPass2),
        b"vkCreateRenderPass2KHR" => hook!(tracegrab_CreateRenderPass2KHR),
        b"vkDestroyRenderPass" => hook!(tracegrab_DestroyRenderPass),
        b"vkCmdBeginRenderPass" => hook!(tracegrab_CmdBeginRenderPass),
        b"vkCmdBeginRenderPass2" => hook!(tracegrab_CmdBeginRenderPass2),
        b"vkCmdBeginRenderPass2KHR" => hook!(tracegrab_CmdBeginRenderPass2KHR),
        b"vkCmdEndRenderPass" => hook!(tracegrab_CmdEndRenderPass),
        b"vkCmdEndRenderPass2" => hook!(tracegrab_CmdEndRenderPass2),
        b"vkCmdEndRenderPass2KHR" => hook!(tracegrab_CmdEndRenderPass2KHR),
        b"vkCmdExecuteCommands" => hook!(tracegrab_CmdExecuteCommands),
        b"vkQueueSubmit" => hook!(tracegrab_QueueSubmit),
        b"vkQueueSubmit2" => hook!(tracegrab_QueueSubmit2),
        b"vkQueueSubmit2KHR" => hook!(tracegrab_QueueSubmit2KHR),
        _ => None,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(p_name).to_bytes() };
    if let Some(function) = instance_hook(name) {
        return Some(function);
    }
    if instance == vk::Instance::null() {
        return None;
    }
    let Some(dispatch) = layer().instance(instance) else {
        return None;
    };
    let next = unsafe { dispatch.proc_addr(p_name) };
    // Device calls fetched at instance level still come through here
    match device_hook(name) {
        Some(function) if next.is_some() => Some(function),
        _ => next,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(p_name).to_bytes() };
    let Some(backend) = layer().device(device) else {
        return None;
    };
    let next = unsafe { backend.proc_addr(p_name) };
    match device_hook(name) {
        Some(function) if next.is_some() => Some(function),
        _ => next,
    }
}

// ── Instances ───────────────────────────────────────────────────────────────

unsafe fn find_instance_link(mut p: *const c_void) -> Option<*mut VkLayerInstanceCreateInfo> {
    while !p.is_null() {
        let base = unsafe { &*(p as *const vk::BaseInStructure) };
        if base.s_type == VK_STRUCTURE_TYPE_LOADER_INSTANCE_CREATE_INFO {
            let info = unsafe { &*(p as *const VkLayerInstanceCreateInfo) };
            if info.function == VK_LAYER_LINK_INFO && !info.u_layer_info.is_null() {
                return Some(p as *mut VkLayerInstanceCreateInfo);
            }
        }
        p = base.p_next as *const c_void;
    }
    None
}

type PfnCreateInstance = unsafe extern "system" fn(
    *const vk::InstanceCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Instance,
) -> vk::Result;

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateInstance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    let Some(chain) = (unsafe { find_instance_link((*p_create_info).p_next) }) else {
        tracing::error!("vkCreateInstance: no layer link in the pNext chain");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let link = unsafe { (*chain).u_layer_info };
    let next_gipa = unsafe { (*link).pfn_next_get_instance_proc_addr };
    unsafe { (*chain).u_layer_info = (*link).p_next };

    let Some(create) = (unsafe { next_gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create: PfnCreateInstance = unsafe { std::mem::transmute(create) };
    let result = unsafe { create(p_create_info, p_allocator, p_instance) };
    if result != vk::Result::SUCCESS {
        return result;
    }

    let instance = unsafe { *p_instance };
    match unsafe { InstanceDispatch::load(instance, next_gipa) } {
        Ok(dispatch) => {
            layer().instances().insert(instance, Arc::new(dispatch));
            tracing::debug!(?instance, "instance created");
        }
        Err(err) => tracing::error!(%err, "instance is not tracked"),
    }
    vk::Result::SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let layer = layer();
    let (dispatch, last) = {
        let mut instances = layer.instances();
        let dispatch = instances.remove(&instance);
        (dispatch, instances.is_empty())
    };
    if last {
        layer.write().release_all();
    }
    if let Some(dispatch) = dispatch {
        unsafe { (dispatch.table.destroy_instance)(instance, p_allocator) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_EnumeratePhysicalDevices(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let layer = layer();
    let Some(dispatch) = layer.instance(instance) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe {
        (dispatch.table.enumerate_physical_devices)(instance, p_physical_device_count, p_physical_devices)
    };
    if matches!(result, vk::Result::SUCCESS | vk::Result::INCOMPLETE) && !p_physical_devices.is_null() {
        let physical_devices = unsafe { slice(p_physical_devices, *p_physical_device_count) };
        layer.write().on_enumerate_physical_devices(instance, physical_devices);
    }
    result
}

unsafe fn enumerate_groups(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
    pick: impl FnOnce(&InstanceDispatch) -> Option<vk::PFN_vkEnumeratePhysicalDeviceGroups>,
) -> vk::Result {
    let layer = layer();
    let Some(dispatch) = layer.instance(instance) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(enumerate) = pick(&dispatch) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let result = unsafe { enumerate(instance, p_count, p_groups) };
    if matches!(result, vk::Result::SUCCESS | vk::Result::INCOMPLETE) && !p_groups.is_null() {
        let groups = unsafe { slice(p_groups, *p_count) };
        let mut session = layer.write();
        for group in groups {
            let count = (group.physical_device_count as usize).min(vk::MAX_DEVICE_GROUP_SIZE);
            session.on_enumerate_physical_devices(instance, &group.physical_devices[..count]);
        }
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_EnumeratePhysicalDeviceGroups(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
) -> vk::Result {
    unsafe { enumerate_groups(instance, p_count, p_groups, |d| d.table.enumerate_physical_device_groups) }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_EnumeratePhysicalDeviceGroupsKHR(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties,
) -> vk::Result {
    unsafe { enumerate_groups(instance, p_count, p_groups, |d| d.table.enumerate_physical_device_groups_khr) }
}

// ── Devices ─────────────────────────────────────────────────────────────────

struct DeviceChain {
    link: *mut VkLayerDeviceCreateInfo,
    set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

unsafe fn find_device_chain(mut p: *const c_void) -> Option<DeviceChain> {
    let mut link = None;
    let mut set_device_loader_data = None;
    while !p.is_null() {
        let base = unsafe { &*(p as *const vk::BaseInStructure) };
        if base.s_type == VK_STRUCTURE_TYPE_LOADER_DEVICE_CREATE_INFO {
            let info = unsafe { &*(p as *const VkLayerDeviceCreateInfo) };
            if info.function == VK_LAYER_LINK_INFO && !info.u_layer_info.is_null() && link.is_none() {
                link = Some(p as *mut VkLayerDeviceCreateInfo);
            } else if info.function == VK_LOADER_DATA_CALLBACK {
                let callback = unsafe { &*(p as *const VkLayerDeviceLoaderData) };
                set_device_loader_data = callback.pfn_set_device_loader_data;
            }
        }
        p = base.p_next as *const c_void;
    }
    link.map(|link| DeviceChain {
        link,
        set_device_loader_data,
    })
}

fn swapchain_enabled(info: &vk::DeviceCreateInfo) -> bool {
    let names = unsafe { slice(info.pp_enabled_extension_names, info.enabled_extension_count) };
    names
        .iter()
        .any(|&name| !name.is_null() && unsafe { CStr::from_ptr(name) } == ash::khr::swapchain::NAME)
}

type PfnCreateDevice = unsafe extern "system" fn(
    vk::PhysicalDevice,
    *const vk::DeviceCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Device,
) -> vk::Result;

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    let layer = layer();
    let Some(chain) = (unsafe { find_device_chain((*p_create_info).p_next) }) else {
        tracing::error!("vkCreateDevice: no layer link in the pNext chain");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let link = unsafe { (*chain.link).u_layer_info };
    let next_gipa = unsafe { (*link).pfn_next_get_instance_proc_addr };
    let next_gdpa = unsafe { (*link).pfn_next_get_device_proc_addr };

    let instance = layer.read().physical_device_instance(physical_device).found();
    let dispatch = {
        let instances = layer.instances();
        match instance {
            Some(instance) => instances.get(&instance).cloned(),
            None => instances.values().next().cloned(),
        }
    };
    let Some(dispatch) = dispatch else {
        tracing::error!(?physical_device, "vkCreateDevice: physical device belongs to no known instance");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let Some(create) = (unsafe { next_gipa(dispatch.instance, c"vkCreateDevice".as_ptr()) }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create: PfnCreateDevice = unsafe { std::mem::transmute(create) };
    unsafe { (*chain.link).u_layer_info = (*link).p_next };
    let result = unsafe { create(physical_device, p_create_info, p_allocator, p_device) };
    if result != vk::Result::SUCCESS {
        return result;
    }

    let device = unsafe { *p_device };
    let backend = match unsafe {
        VulkanDevice::load(device, physical_device, next_gdpa, dispatch, chain.set_device_loader_data)
    } {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            tracing::error!(%err, "vkCreateDevice: cannot forward calls for this device");
            return vk::Result::ERROR_INITIALIZATION_FAILED;
        }
    };
    let wsi_enabled = swapchain_enabled(unsafe { &*p_create_info });
    if let Some(key) = unsafe { dispatch_key(device.as_raw()) } {
        layer.devices().insert(key, backend.clone());
    }
    layer.write().on_create_device(device, physical_device, backend, wsi_enabled);
    vk::Result::SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyDevice(device: vk::Device, p_allocator: *const vk::AllocationCallbacks) {
    let layer = layer();
    let removed = layer.write().on_destroy_device(device);
    let keyed = unsafe { dispatch_key(device.as_raw()) }.and_then(|key| layer.devices().remove(&key));
    if let Some(backend) = removed.or(keyed) {
        unsafe { (backend.table.destroy_device)(device, p_allocator) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_GetDeviceQueue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return;
    };
    unsafe { (backend.table.get_device_queue)(device, queue_family_index, queue_index, p_queue) };
    let queue = unsafe { *p_queue };
    if queue != vk::Queue::null() {
        layer.write().on_get_device_queue(device, queue_family_index, queue);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_GetDeviceQueue2(
    device: vk::Device,
    p_queue_info: *const vk::DeviceQueueInfo2,
    p_queue: *mut vk::Queue,
) {
    let layer = layer();
    let Some(get) = layer.device(device).and_then(|backend| backend.table.get_device_queue2) else {
        return;
    };
    unsafe { get(device, p_queue_info, p_queue) };
    let queue = unsafe { *p_queue };
    if queue != vk::Queue::null() {
        let family = unsafe { (*p_queue_info).queue_family_index };
        layer.write().on_get_device_queue(device, family, queue);
    }
}

// ── Swapchains and present ──────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateSwapchainKHR(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let layer = layer();
    let Some(create) = layer.device(device).and_then(|backend| backend.table.create_swapchain_khr) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let mut info = unsafe { *p_create_info };
    if layer.read().wants_transfer_src() {
        info.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    let result = unsafe { create(device, &info, p_allocator, p_swapchain) };
    if result == vk::Result::SUCCESS {
        let swapchain = unsafe { *p_swapchain };
        layer
            .write()
            .on_create_swapchain(device, swapchain, info.image_extent, info.image_format);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_GetSwapchainImagesKHR(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_count: *mut u32,
    p_images: *mut vk::Image,
) -> vk::Result {
    let layer = layer();
    let Some(get) = layer.device(device).and_then(|backend| backend.table.get_swapchain_images_khr) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let result = unsafe { get(device, swapchain, p_count, p_images) };
    if matches!(result, vk::Result::SUCCESS | vk::Result::INCOMPLETE) && !p_images.is_null() {
        let images = unsafe { slice(p_images, *p_count) };
        layer.write().on_get_swapchain_images(swapchain, images);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_QueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    let layer = layer();
    let Some(present) = layer.queue_device(queue).and_then(|backend| backend.table.queue_present_khr) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let info = unsafe { &*p_present_info };
    let swapchains = unsafe { slice(info.p_swapchains, info.swapchain_count) };
    let indices = unsafe { slice(info.p_image_indices, info.swapchain_count) };
    let presented: Vec<(vk::SwapchainKHR, u32)> = swapchains.iter().copied().zip(indices.iter().copied()).collect();

    // The image is read back before it is handed to the presentation engine
    layer.write().on_queue_present(queue, &presented);
    unsafe { present(queue, p_present_info) }
}

// ── Command buffers and submission ──────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_AllocateCommandBuffers(
    device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { (backend.table.allocate_command_buffers)(device, p_allocate_info, p_command_buffers) };
    if result == vk::Result::SUCCESS {
        let count = unsafe { (*p_allocate_info).command_buffer_count };
        let command_buffers = unsafe { slice(p_command_buffers, count) };
        layer.write().on_allocate_command_buffers(device, command_buffers);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_BeginCommandBuffer(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::CommandBufferBeginInfo,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.command_buffer_device(command_buffer) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    layer.write().on_begin_command_buffer(command_buffer);
    unsafe { (backend.table.begin_command_buffer)(command_buffer, p_begin_info) }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdExecuteCommands(
    command_buffer: vk::CommandBuffer,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    let layer = layer();
    let Some(backend) = layer.command_buffer_device(command_buffer) else {
        return;
    };
    unsafe { (backend.table.cmd_execute_commands)(command_buffer, command_buffer_count, p_command_buffers) };
    let secondaries = unsafe { slice(p_command_buffers, command_buffer_count) };
    layer.write().on_cmd_execute_commands(command_buffer, secondaries);
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_QueueSubmit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo,
    fence: vk::Fence,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.queue_device(queue) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let result = unsafe { (backend.table.queue_submit)(queue, submit_count, p_submits, fence) };
    let command_buffers: Vec<vk::CommandBuffer> = unsafe { slice(p_submits, submit_count) }
        .iter()
        .flat_map(|submit| unsafe { slice(submit.p_command_buffers, submit.command_buffer_count) })
        .copied()
        .collect();
    layer.write().on_queue_submit(queue, &command_buffers);
    result
}

unsafe fn queue_submit2(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
    pick: impl FnOnce(&VulkanDevice) -> Option<vk::PFN_vkQueueSubmit2>,
) -> vk::Result {
    let layer = layer();
    let Some(submit) = layer.queue_device(queue).and_then(|backend| pick(&backend)) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let result = unsafe { submit(queue, submit_count, p_submits, fence) };
    let command_buffers: Vec<vk::CommandBuffer> = unsafe { slice(p_submits, submit_count) }
        .iter()
        .flat_map(|submit| unsafe { slice(submit.p_command_buffer_infos, submit.command_buffer_info_count) })
        .map(|info| info.command_buffer)
        .collect();
    layer.write().on_queue_submit(queue, &command_buffers);
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_QueueSubmit2(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { queue_submit2(queue, submit_count, p_submits, fence, |d| d.table.queue_submit2) }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_QueueSubmit2KHR(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { queue_submit2(queue, submit_count, p_submits, fence, |d| d.table.queue_submit2_khr) }
}

// ── Images, views and framebuffers ──────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateImage(
    device: vk::Device,
    p_create_info: *const vk::ImageCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_image: *mut vk::Image,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { (backend.table.create_image)(device, p_create_info, p_allocator, p_image) };
    if result == vk::Result::SUCCESS {
        let info = unsafe { &*p_create_info };
        let extent = vk::Extent2D {
            width: info.extent.width,
            height: info.extent.height,
        };
        layer
            .write()
            .on_create_image(device, unsafe { *p_image }, extent, info.format);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyImage(
    device: vk::Device,
    image: vk::Image,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let layer = layer();
    layer.write().on_destroy_image(image);
    if let Some(backend) = layer.device(device) {
        unsafe { (backend.table.destroy_image)(device, image, p_allocator) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateImageView(
    device: vk::Device,
    p_create_info: *const vk::ImageViewCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_view: *mut vk::ImageView,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { (backend.table.create_image_view)(device, p_create_info, p_allocator, p_view) };
    if result == vk::Result::SUCCESS {
        let image = unsafe { (*p_create_info).image };
        layer.write().on_create_image_view(unsafe { *p_view }, image);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyImageView(
    device: vk::Device,
    view: vk::ImageView,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let layer = layer();
    layer.write().on_destroy_image_view(view);
    if let Some(backend) = layer.device(device) {
        unsafe { (backend.table.destroy_image_view)(device, view, p_allocator) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateFramebuffer(
    device: vk::Device,
    p_create_info: *const vk::FramebufferCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_framebuffer: *mut vk::Framebuffer,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { (backend.table.create_framebuffer)(device, p_create_info, p_allocator, p_framebuffer) };
    if result == vk::Result::SUCCESS {
        let info = unsafe { &*p_create_info };
        // Imageless framebuffers carry no views
        let attachments: &[vk::ImageView] = if info.flags.contains(vk::FramebufferCreateFlags::IMAGELESS) {
            &[]
        } else {
            unsafe { slice(info.p_attachments, info.attachment_count) }
        };
        layer
            .write()
            .on_create_framebuffer(unsafe { *p_framebuffer }, attachments);
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyFramebuffer(
    device: vk::Device,
    framebuffer: vk::Framebuffer,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let layer = layer();
    layer.write().on_destroy_framebuffer(framebuffer);
    if let Some(backend) = layer.device(device) {
        unsafe { (backend.table.destroy_framebuffer)(device, framebuffer, p_allocator) };
    }
}

// ── Render passes ───────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateRenderPass(
    device: vk::Device,
    p_create_info: *const vk::RenderPassCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_render_pass: *mut vk::RenderPass,
) -> vk::Result {
    let layer = layer();
    let Some(backend) = layer.device(device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let result = unsafe { (backend.table.create_render_pass)(device, p_create_info, p_allocator, p_render_pass) };
    if result == vk::Result::SUCCESS {
        layer.write().on_create_render_pass(unsafe { *p_render_pass });
    }
    result
}

unsafe fn create_render_pass2(
    device: vk::Device,
    p_create_info: *const vk::RenderPassCreateInfo2,
    p_allocator: *const vk::AllocationCallbacks,
    p_render_pass: *mut vk::RenderPass,
    pick: impl FnOnce(&VulkanDevice) -> Option<vk::PFN_vkCreateRenderPass2>,
) -> vk::Result {
    let layer = layer();
    let Some(create) = layer.device(device).and_then(|backend| pick(&backend)) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let result = unsafe { create(device, p_create_info, p_allocator, p_render_pass) };
    if result == vk::Result::SUCCESS {
        layer.write().on_create_render_pass(unsafe { *p_render_pass });
    }
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateRenderPass2(
    device: vk::Device,
    p_create_info: *const vk::RenderPassCreateInfo2,
    p_allocator: *const vk::AllocationCallbacks,
    p_render_pass: *mut vk::RenderPass,
) -> vk::Result {
    unsafe { create_render_pass2(device, p_create_info, p_allocator, p_render_pass, |d| d.table.create_render_pass2) }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CreateRenderPass2KHR(
    device: vk::Device,
    p_create_info: *const vk::RenderPassCreateInfo2,
    p_allocator: *const vk::AllocationCallbacks,
    p_render_pass: *mut vk::RenderPass,
) -> vk::Result {
    unsafe {
        create_render_pass2(device, p_create_info, p_allocator, p_render_pass, |d| {
            d.table.create_render_pass2_khr
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_DestroyRenderPass(
    device: vk::Device,
    render_pass: vk::RenderPass,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let layer = layer();
    layer.write().on_destroy_render_pass(render_pass);
    if let Some(backend) = layer.device(device) {
        unsafe { (backend.table.destroy_render_pass)(device, render_pass, p_allocator) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdBeginRenderPass(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::RenderPassBeginInfo,
    contents: vk::SubpassContents,
) {
    let layer = layer();
    let Some(backend) = layer.command_buffer_device(command_buffer) else {
        return;
    };
    let info = unsafe { &*p_begin_info };
    layer
        .write()
        .on_cmd_begin_render_pass(command_buffer, info.render_pass, info.framebuffer);
    unsafe { (backend.table.cmd_begin_render_pass)(command_buffer, p_begin_info, contents) };
}

unsafe fn cmd_begin_render_pass2(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::RenderPassBeginInfo,
    p_subpass_begin_info: *const vk::SubpassBeginInfo,
    pick: impl FnOnce(&VulkanDevice) -> Option<vk::PFN_vkCmdBeginRenderPass2>,
) {
    let layer = layer();
    let Some(begin) = layer.command_buffer_device(command_buffer).and_then(|backend| pick(&backend)) else {
        return;
    };
    let info = unsafe { &*p_begin_info };
    layer
        .write()
        .on_cmd_begin_render_pass(command_buffer, info.render_pass, info.framebuffer);
    unsafe { begin(command_buffer, p_begin_info, p_subpass_begin_info) };
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdBeginRenderPass2(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::RenderPassBeginInfo,
    p_subpass_begin_info: *const vk::SubpassBeginInfo,
) {
    unsafe {
        cmd_begin_render_pass2(command_buffer, p_begin_info, p_subpass_begin_info, |d| {
            d.table.cmd_begin_render_pass2
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdBeginRenderPass2KHR(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::RenderPassBeginInfo,
    p_subpass_begin_info: *const vk::SubpassBeginInfo,
) {
    unsafe {
        cmd_begin_render_pass2(command_buffer, p_begin_info, p_subpass_begin_info, |d| {
            d.table.cmd_begin_render_pass2_khr
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdEndRenderPass(command_buffer: vk::CommandBuffer) {
    let layer = layer();
    let Some(backend) = layer.command_buffer_device(command_buffer) else {
        return;
    };
    unsafe { (backend.table.cmd_end_render_pass)(command_buffer) };
    layer.write().on_cmd_end_render_pass(command_buffer);
}

unsafe fn cmd_end_render_pass2(
    command_buffer: vk::CommandBuffer,
    p_subpass_end_info: *const vk::SubpassEndInfo,
    pick: impl FnOnce(&VulkanDevice) -> Option<vk::PFN_vkCmdEndRenderPass2>,
) {
    let layer = layer();
    let Some(end) = layer.command_buffer_device(command_buffer).and_then(|backend| pick(&backend)) else {
        return;
    };
    unsafe { end(command_buffer, p_subpass_end_info) };
    layer.write().on_cmd_end_render_pass(command_buffer);
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdEndRenderPass2(
    command_buffer: vk::CommandBuffer,
    p_subpass_end_info: *const vk::SubpassEndInfo,
) {
    unsafe { cmd_end_render_pass2(command_buffer, p_subpass_end_info, |d| d.table.cmd_end_render_pass2) }
}

#[unsafe(no_mangle)]
pub unsafe extern "system" fn tracegrab_CmdEndRenderPass2KHR(
    command_buffer: vk::CommandBuffer,
    p_subpass_end_info: *const vk::SubpassEndInfo,
) {
    unsafe { cmd_end_render_pass2(command_buffer, p_subpass_end_info, |d| d.table.cmd_end_render_pass2_khr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooked_names_resolve() {
        assert!(instance_hook(b"vkCreateInstance").is_some());
        assert!(instance_hook(b"vkCreateDevice").is_some());
        assert!(device_hook(b"vkQueuePresentKHR").is_some());
        assert!(device_hook(b"vkCmdEndRenderPass2KHR").is_some());
        assert!(device_hook(b"vkQueueSubmit2").is_some());
    }

    #[test]
    fn test_unhooked_names_are_forwarded() {
        assert!(instance_hook(b"vkGetPhysicalDeviceProperties").is_none());
        assert!(device_hook(b"vkCmdDraw").is_none());
        assert!(device_hook(b"vkCreateInstance").is_none());
    }

    #[test]
    fn test_negotiate_fills_entry_points() {
        let mut interface = VkNegotiateLayerInterface {
            s_type: 0,
            p_next: ptr::null_mut(),
            loader_layer_interface_version: 0,
            pfn_get_instance_proc_addr: ptr::null(),
            pfn_get_device_proc_addr: ptr::null(),
            pfn_get_physical_device_proc_addr: ptr::null(),
        };
        let result = unsafe { vkNegotiateLoaderLayerInterfaceVersion(&mut interface) };
        assert_eq!(result, vk::Result::SUCCESS);
        assert_eq!(interface.loader_layer_interface_version, 2);
        assert!(!interface.pfn_get_instance_proc_addr.is_null());
        assert!(!interface.pfn_get_device_proc_addr.is_null());
        assert!(interface.pfn_get_physical_device_proc_addr.is_null());
    }

    #[test]
    fn test_negotiate_rejects_null() {
        let result = unsafe { vkNegotiateLoaderLayerInterfaceVersion(ptr::null_mut()) };
        assert_eq!(result, vk::Result::ERROR_INITIALIZATION_FAILED);
    }

    #[test]
    fn test_slice_of_null_is_empty() {
        let empty: &[u32] = unsafe { slice(ptr::null(), 4) };
        assert!(empty.is_empty());
        let values = [1u32, 2, 3];
        assert_eq!(unsafe { slice(values.as_ptr(), 2) }, &[1, 2]);
    }

    #[test]
    fn test_dispatch_key_of_null_handle() {
        assert_eq!(unsafe { dispatch_key(0) }, None);
        let table = 0x5eed_usize;
        let handle = &table as *const usize as u64;
        assert_eq!(unsafe { dispatch_key(handle) }, Some(0x5eed));
    }

    #[test]
    fn test_null_device_resolves_to_no_device() {
        assert!(layer().device(vk::Device::null()).is_none());
        assert!(layer().queue_device(vk::Queue::null()).is_none());
    }
}
