//! Seams between the replay loop and the outside world
//!
//! The loop drives three collaborators: a replayer per traced API, the
//! display that owns the window and its events, and the launcher that runs
//! the trigger script. Each is a trait so the loop can run without a GPU.

use std::path::Path;
use std::process::Command;

use super::settings::FenceSkipMode;
use crate::trace::{Packet, PacketKind, TracerId};

/// A single packet that failed to replay
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PacketFailure(pub String);

/// Per-API replayer contract
pub trait ApiReplayer {
    /// Convert a packet body into the replayer's in-memory form
    fn interpret(&mut self, packet: Packet) -> Packet;

    /// Replay one interpreted packet
    fn replay(&mut self, packet: &Packet) -> Result<(), PacketFailure>;

    /// Number of frames presented so far
    fn frame_number(&self) -> u64;

    fn reset_frame_number(&mut self, frame: u64);

    /// Whether replay is inside the measured range
    fn set_in_frame_range(&mut self, in_range: bool);

    /// Which fence status queries are skipped inside a skip fence range
    fn set_fence_skip_mode(&mut self, mode: FenceSkipMode);

    /// Whether fence status queries should be skipped
    fn set_in_skip_fence_range(&mut self, in_range: bool);

    /// Whether the screenshot layer should be active for the coming loop
    fn set_screenshots_enabled(&mut self, enabled: bool);

    /// Packets listed in the portability table, interpreted
    fn load_portability_table(&mut self, _packets: Vec<Packet>) {}

    fn device_wait_idle(&mut self);

    fn on_terminate(&mut self);
}

/// Replayers keyed by tracer id
#[derive(Default)]
pub struct ReplayerSet {
    replayers: Vec<(TracerId, Box<dyn ApiReplayer>)>,
}

impl ReplayerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `replayer` for `tracer`, replacing any earlier one
    pub fn insert(&mut self, tracer: TracerId, replayer: Box<dyn ApiReplayer>) {
        self.replayers.retain(|(id, _)| *id != tracer);
        self.replayers.push((tracer, replayer));
    }

    /// Replayer for a packet's tracer id, after compressed-id remapping
    pub fn get_mut(&mut self, tracer: TracerId) -> Option<&mut (dyn ApiReplayer + 'static)> {
        let tracer = tracer.replayer_id();
        self.replayers
            .iter_mut()
            .find(|(id, _)| *id == tracer)
            .map(|(_, replayer)| replayer.as_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.replayers.is_empty()
    }

    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut dyn ApiReplayer),
    {
        for (_, replayer) in &mut self.replayers {
            f(replayer.as_mut());
        }
    }

    /// Interpret `packet` with its replayer, if it has one and is an API packet
    pub fn interpret(&mut self, packet: Packet) -> Packet {
        if packet.interpreted || !matches!(packet.kind(), PacketKind::Api | PacketKind::Present) {
            return packet;
        }
        match self.get_mut(packet.tracer_id()) {
            Some(replayer) => replayer.interpret(packet),
            None => packet,
        }
    }
}

/// Replayer that walks the trace without a device.
///
/// Every API packet succeeds; present and frame-boundary packets advance
/// the frame counter.
#[derive(Debug, Default)]
pub struct NullReplayer {
    frame: u64,
    replayed: u64,
    in_frame_range: bool,
    fence_skip_mode: FenceSkipMode,
    in_skip_fence_range: bool,
    screenshots_enabled: bool,
    portability_packets: usize,
}

impl NullReplayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// API packets replayed so far
    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn in_frame_range(&self) -> bool {
        self.in_frame_range
    }

    pub fn fence_skip_mode(&self) -> FenceSkipMode {
        self.fence_skip_mode
    }

    pub fn in_skip_fence_range(&self) -> bool {
        self.in_skip_fence_range
    }

    pub fn screenshots_enabled(&self) -> bool {
        self.screenshots_enabled
    }
}

impl ApiReplayer for NullReplayer {
    fn interpret(&mut self, mut packet: Packet) -> Packet {
        packet.interpreted = true;
        packet
    }

    fn replay(&mut self, packet: &Packet) -> Result<(), PacketFailure> {
        self.replayed += 1;
        if packet.kind() == PacketKind::Present {
            self.frame += 1;
        }
        Ok(())
    }

    fn frame_number(&self) -> u64 {
        self.frame
    }

    fn reset_frame_number(&mut self, frame: u64) {
        self.frame = frame;
    }

    fn set_in_frame_range(&mut self, in_range: bool) {
        self.in_frame_range = in_range;
    }

    fn set_fence_skip_mode(&mut self, mode: FenceSkipMode) {
        self.fence_skip_mode = mode;
    }

    fn set_in_skip_fence_range(&mut self, in_range: bool) {
        self.in_skip_fence_range = in_range;
    }

    fn set_screenshots_enabled(&mut self, enabled: bool) {
        self.screenshots_enabled = enabled;
    }

    fn load_portability_table(&mut self, packets: Vec<Packet>) {
        self.portability_packets = packets.len();
    }

    fn device_wait_idle(&mut self) {}

    fn on_terminate(&mut self) {
        tracing::debug!(
            "Null replayer finished: {} packets, {} portability entries",
            self.replayed,
            self.portability_packets
        );
    }
}

/// Window and input events seen by the replay loop
pub trait ReplayDisplay {
    /// Handle pending window events
    fn process_event(&mut self);

    fn is_paused(&self) -> bool;

    fn quit_requested(&self) -> bool;
}

/// Display for replays without a window: never pauses, never quits
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessDisplay;

impl ReplayDisplay for HeadlessDisplay {
    fn process_event(&mut self) {}

    fn is_paused(&self) -> bool {
        false
    }

    fn quit_requested(&self) -> bool {
        false
    }
}

/// Runs the trigger script
pub trait ScriptLauncher {
    fn launch(&mut self, script: &Path, frame: u64);
}

/// Launcher that runs the script with `/bin/sh` and waits for it
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellLauncher;

impl ScriptLauncher for ShellLauncher {
    fn launch(&mut self, script: &Path, frame: u64) {
        match Command::new("/bin/sh").arg(script).status() {
            Ok(status) => tracing::info!(
                "Script {} run result: {} (frame {})",
                script.display(),
                status.code().unwrap_or(-1),
                frame
            ),
            Err(e) => tracing::error!("Script {} failed to start: {}", script.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{PacketHeader, packet_id};

    fn packet(tracer: TracerId, id: u16) -> Packet {
        Packet::new(
            PacketHeader {
                tracer_id: tracer.0,
                packet_id: id,
                ..Default::default()
            },
            Vec::new(),
        )
    }

    #[test]
    fn test_set_remaps_compressed_tracer() {
        let mut set = ReplayerSet::new();
        set.insert(TracerId::VULKAN, Box::new(NullReplayer::new()));
        assert!(set.get_mut(TracerId::VULKAN_COMPRESSED).is_some());
        assert!(set.get_mut(TracerId::GL_FPS).is_none());
    }

    #[test]
    fn test_set_insert_replaces() {
        let mut set = ReplayerSet::new();
        let mut first = NullReplayer::new();
        first.reset_frame_number(7);
        set.insert(TracerId::VULKAN, Box::new(first));
        set.insert(TracerId::VULKAN, Box::new(NullReplayer::new()));
        let mut count = 0;
        set.for_each(|_| count += 1);
        assert_eq!(count, 1);
        assert_eq!(set.get_mut(TracerId::VULKAN).unwrap().frame_number(), 0);
    }

    #[test]
    fn test_interpret_only_api_packets() {
        let mut set = ReplayerSet::new();
        set.insert(TracerId::VULKAN, Box::new(NullReplayer::new()));
        assert!(set.interpret(packet(TracerId::VULKAN, 40)).interpreted);
        assert!(set.interpret(packet(TracerId::VULKAN_COMPRESSED, packet_id::QUEUE_PRESENT)).interpreted);
        assert!(!set.interpret(packet(TracerId::VULKAN, packet_id::MESSAGE)).interpreted);
        assert!(!set.interpret(packet(TracerId::GL_FPS, 40)).interpreted);
    }

    #[test]
    fn test_null_replayer_counts_presents() {
        let mut replayer = NullReplayer::new();
        replayer.replay(&packet(TracerId::VULKAN, 40)).unwrap();
        replayer.replay(&packet(TracerId::VULKAN, packet_id::QUEUE_PRESENT)).unwrap();
        replayer.replay(&packet(TracerId::VULKAN, packet_id::FRAME_BOUNDARY)).unwrap();
        assert_eq!(replayer.frame_number(), 2);
        assert_eq!(replayer.replayed(), 3);
        replayer.reset_frame_number(0);
        assert_eq!(replayer.frame_number(), 0);
    }

    #[test]
    fn test_shell_launcher_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, format!("touch '{}'\n", marker.display())).unwrap();
        ShellLauncher.launch(&script, 3);
        assert!(marker.exists());
    }
}
