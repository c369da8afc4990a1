use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk::{self, Handle};
use tracegrab_shared::{ColorSpaceOverride, FrameSelection};

use super::SessionState;
use crate::config::{LayerConfig, RenderPassDump};
use crate::shadow::Lookup;
use crate::test_utils::{Command, MockDevice};

const DEVICE: u64 = 0xd0;
const PHYSICAL_DEVICE: u64 = 0xd1;
const QUEUE: u64 = 0x10;
const SWAPCHAIN: u64 = 0x20;
const SWAPCHAIN_IMAGES: [u64; 2] = [0x21, 0x22];

fn device() -> vk::Device {
    vk::Device::from_raw(DEVICE)
}

fn queue() -> vk::Queue {
    vk::Queue::from_raw(QUEUE)
}

fn swapchain() -> vk::SwapchainKHR {
    vk::SwapchainKHR::from_raw(SWAPCHAIN)
}

struct Harness {
    session: SessionState<MockDevice>,
    device: Arc<MockDevice>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(frames: &str, render_pass_dump: RenderPassDump) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = LayerConfig {
            frames: Some(FrameSelection::parse(frames).unwrap()),
            color_space: ColorSpaceOverride::Swapchain,
            output_dir: Some(dir.path().to_path_buf()),
            prefix: "shot_".to_string(),
            render_pass_dump,
        };
        let device = Arc::new(MockDevice::new());
        let mut session = SessionState::new(config);
        session.on_create_device(
            self::device(),
            vk::PhysicalDevice::from_raw(PHYSICAL_DEVICE),
            device.clone(),
            true,
        );
        session.on_get_device_queue(self::device(), 0, queue());
        session.on_create_swapchain(
            self::device(),
            swapchain(),
            vk::Extent2D { width: 2, height: 1 },
            vk::Format::B8G8R8A8_UNORM,
        );
        let images = SWAPCHAIN_IMAGES.map(vk::Image::from_raw);
        session.on_get_swapchain_images(swapchain(), &images);
        device.set_image_contents(images[0], vec![10, 20, 30, 255, 40, 50, 60, 255]);
        Self { session, device, dir }
    }

    fn present(&mut self) -> Option<PathBuf> {
        self.session.on_queue_present(queue(), &[(swapchain(), 0)])
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn pixmap_body(path: &Path) -> Vec<u8> {
    let bytes = std::fs::read(path).unwrap();
    // P6, three comments, width, height, max value
    let mut rest = &bytes[..];
    for _ in 0..7 {
        let end = rest.iter().position(|b| *b == b'\n').unwrap();
        rest = &rest[end + 1..];
    }
    rest.to_vec()
}

#[test]
fn test_single_frame_capture() {
    let mut harness = Harness::new("1", RenderPassDump::Off);
    let written: Vec<_> = (0..3).map(|_| harness.present()).collect();

    assert_eq!(written, [None, Some(harness.path("shot_1.ppm")), None]);
    assert_eq!(harness.files(), ["shot_1.ppm"]);
    assert_eq!(pixmap_body(&harness.path("shot_1.ppm")), [10, 20, 30, 40, 50, 60]);
    assert_eq!(harness.session.frame_number(), 3);
    assert_eq!(harness.device.live_objects(), 0);
}

#[test]
fn test_all_frames_captured() {
    let mut harness = Harness::new("all", RenderPassDump::Off);
    for _ in 0..3 {
        assert!(harness.present().is_some());
    }
    assert_eq!(harness.files(), ["shot_0.ppm", "shot_1.ppm", "shot_2.ppm"]);
    assert!(harness.session.is_capture_active());
}

#[test]
fn test_end_of_range_resets_tracking() {
    let mut harness = Harness::new("0-2", RenderPassDump::Off);
    assert!(harness.present().is_some());
    assert!(harness.session.is_capture_active());
    assert!(harness.present().is_some());

    assert!(!harness.session.is_capture_active());
    assert!(harness.session.shadow().is_capture_state_empty());
    assert!(!harness.session.shadow().swapchain(swapchain()).is_found());
    // Devices stay reachable for dispatch
    assert!(harness.session.resolve_queue(queue()).is_found());

    assert!(harness.present().is_none());
    assert_eq!(harness.files(), ["shot_0.ppm", "shot_1.ppm"]);
}

#[test]
fn test_list_entries_are_consumed() {
    let mut harness = Harness::new("0,2", RenderPassDump::Off);
    assert!(harness.present().is_some());
    assert!(harness.session.is_capture_active());
    assert!(harness.present().is_none());
    assert!(harness.present().is_some());
    assert!(!harness.session.is_capture_active());
    assert!(harness.session.shadow().is_capture_state_empty());
}

#[test]
fn test_present_on_other_queue_waits_for_it() {
    let mut harness = Harness::new("0", RenderPassDump::Off);
    let present_queue = vk::Queue::from_raw(0x11);
    harness.device.set_queue_family_flags(1, vk::QueueFlags::TRANSFER);
    harness.session.on_get_device_queue(device(), 1, present_queue);

    harness.session.on_queue_present(present_queue, &[(swapchain(), 0)]);
    let commands = harness.device.commands();
    let waited = commands
        .iter()
        .position(|c| *c == Command::QueueWaitIdle(present_queue))
        .unwrap();
    let submitted = commands
        .iter()
        .position(|c| matches!(c, Command::QueueSubmit { queue: q, .. } if *q == queue()))
        .unwrap();
    assert!(waited < submitted);
}

#[test]
fn test_missing_capture_queue_skips_capture() {
    let dir = tempfile::tempdir().unwrap();
    let config = LayerConfig {
        frames: Some(FrameSelection::parse("0").unwrap()),
        output_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let device = Arc::new(MockDevice::new());
    device.set_queue_family_flags(0, vk::QueueFlags::COMPUTE);
    let mut session = SessionState::new(config);
    session.on_create_device(self::device(), vk::PhysicalDevice::null(), device.clone(), true);
    session.on_get_device_queue(self::device(), 0, queue());
    session.on_create_swapchain(
        self::device(),
        swapchain(),
        vk::Extent2D { width: 1, height: 1 },
        vk::Format::B8G8R8A8_SRGB,
    );
    session.on_get_swapchain_images(swapchain(), &[vk::Image::from_raw(0x21)]);

    assert!(session.on_queue_present(queue(), &[(swapchain(), 0)]).is_none());
    assert_eq!(session.frame_number(), 1);
    assert!(device.commands().is_empty());
    // Queue is still indexed for dispatch
    assert!(session.resolve_queue(queue()).is_found());
}

#[test]
fn test_unknown_handles_resolve_to_not_found() {
    let harness = Harness::new("0", RenderPassDump::Off);
    assert!(!harness.session.resolve_queue(vk::Queue::from_raw(0x999)).is_found());
    assert!(!harness
        .session
        .resolve_command_buffer(vk::CommandBuffer::from_raw(QUEUE))
        .is_found());
    assert!(matches!(harness.session.resolve_device(device()), Lookup::Found(_)));
}

struct Attachment {
    image: vk::Image,
    framebuffer: vk::Framebuffer,
    render_pass: vk::RenderPass,
}

fn attachment(harness: &mut Harness, base: u64) -> Attachment {
    let image = vk::Image::from_raw(base);
    let view = vk::ImageView::from_raw(base + 1);
    let framebuffer = vk::Framebuffer::from_raw(base + 2);
    let render_pass = vk::RenderPass::from_raw(base + 3);
    let session = &mut harness.session;
    session.on_create_image(device(), image, vk::Extent2D { width: 2, height: 1 }, vk::Format::R8G8B8A8_UNORM);
    session.on_create_image_view(view, image);
    session.on_create_framebuffer(framebuffer, &[view]);
    session.on_create_render_pass(render_pass);
    harness.device.set_image_contents(image, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    Attachment {
        image,
        framebuffer,
        render_pass,
    }
}

fn record_pass(harness: &mut Harness, command_buffer: vk::CommandBuffer, target: &Attachment) {
    harness
        .session
        .on_cmd_begin_render_pass(command_buffer, target.render_pass, target.framebuffer);
    harness.session.on_cmd_end_render_pass(command_buffer);
}

#[test]
fn test_render_pass_dump_written_at_submit() {
    let mut harness = Harness::new("0", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);

    // Recorded into the caller's buffer, nothing submitted yet
    let commands = harness.device.commands();
    assert!(commands
        .iter()
        .any(|c| matches!(c, Command::Copy { command_buffer, src, .. } if *command_buffer == cb && *src == target.image)));
    assert!(!commands.iter().any(|c| matches!(c, Command::QueueSubmit { .. })));

    let written = harness.session.on_queue_submit(queue(), &[cb]);
    let expected = harness.path("shot_f0_rpi_0_img_0_rpc_0_presubmit_37_37_2_1.ppm");
    assert_eq!(written, [expected.clone()]);
    assert_eq!(pixmap_body(&expected), [1, 2, 3, 5, 6, 7]);
    assert!(harness.device.commands().contains(&Command::QueueWaitIdle(queue())));
    assert_eq!(harness.device.live_objects(), 0);

    // Nothing left to write on a second submit
    assert!(harness.session.on_queue_submit(queue(), &[cb]).is_empty());
}

#[test]
fn test_render_pass_counter_resets_per_frame() {
    let mut harness = Harness::new("0,1", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);

    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);
    record_pass(&mut harness, cb, &target);
    let first: Vec<_> = harness
        .session
        .on_queue_submit(queue(), &[cb])
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        first,
        [
            "shot_f0_rpi_0_img_0_rpc_0_presubmit_37_37_2_1.ppm",
            "shot_f0_rpi_1_img_0_rpc_0_presubmit_37_37_2_1.ppm"
        ]
    );

    harness.present();
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);
    let second = harness.session.on_queue_submit(queue(), &[cb]);
    assert_eq!(second, [harness.path("shot_f1_rpi_0_img_0_rpc_0_presubmit_37_37_2_1.ppm")]);
}

#[test]
fn test_secondary_captures_follow_primary_submit() {
    let mut harness = Harness::new("0", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let primary = vk::CommandBuffer::from_raw(0x500);
    let secondary = vk::CommandBuffer::from_raw(0x501);
    harness.session.on_allocate_command_buffers(device(), &[primary, secondary]);

    harness.session.on_begin_command_buffer(secondary);
    record_pass(&mut harness, secondary, &target);
    harness.session.on_begin_command_buffer(primary);
    harness.session.on_cmd_execute_commands(primary, &[secondary]);

    let written = harness.session.on_queue_submit(queue(), &[primary]);
    assert_eq!(written.len(), 1);
    assert!(written[0].exists());
}

#[test]
fn test_rerecording_releases_queued_captures() {
    let mut harness = Harness::new("0", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);
    assert!(harness.device.live_objects() > 0);

    harness.session.on_begin_command_buffer(cb);
    assert_eq!(harness.device.live_objects(), 0);
    assert!(harness.session.on_queue_submit(queue(), &[cb]).is_empty());
}

#[test]
fn test_other_render_pass_index_not_dumped() {
    let mut harness = Harness::new("0", RenderPassDump::Index(1));
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);

    assert!(!harness
        .device
        .commands()
        .iter()
        .any(|c| matches!(c, Command::CreateImage(_))));
    assert!(harness.session.on_queue_submit(queue(), &[cb]).is_empty());
}

#[test]
fn test_unselected_frame_not_dumped() {
    let mut harness = Harness::new("1", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);
    assert!(harness.session.on_queue_submit(queue(), &[cb]).is_empty());
    assert_eq!(harness.device.live_objects(), 0);
}

#[test]
fn test_destroy_device_releases_queued_captures() {
    let mut harness = Harness::new("0", RenderPassDump::All);
    let target = attachment(&mut harness, 0x100);
    let cb = vk::CommandBuffer::from_raw(0x500);
    harness.session.on_allocate_command_buffers(device(), &[cb]);
    harness.session.on_begin_command_buffer(cb);
    record_pass(&mut harness, cb, &target);

    assert!(harness.session.on_destroy_device(device()).is_some());
    assert_eq!(harness.device.live_objects(), 0);
    assert!(!harness.session.resolve_command_buffer(cb).is_found());
}

#[test]
fn test_tracking_disabled_without_dump_mode() {
    let mut harness = Harness::new("0", RenderPassDump::Off);
    assert_eq!(harness.session.on_create_render_pass(vk::RenderPass::from_raw(0x1)), None);
    harness.session.on_create_image(
        device(),
        vk::Image::from_raw(0x100),
        vk::Extent2D { width: 1, height: 1 },
        vk::Format::R8G8B8A8_UNORM,
    );
    assert!(!harness.session.shadow().image(vk::Image::from_raw(0x100)).is_found());
}
