//! Replay loop
//!
//! Pulls packets from the sequencer, dispatches them to the per-API
//! replayers and runs the frame-control logic at every present: delay
//! injection, trigger scripts, fence-skip ranges, the measured-range bookmark
//! and the loop end frame.

use std::io::{Read, Seek};
use std::time::Duration;

use crate::clock::ClockSnapshot;
use crate::sequencer::{Bookmark, Sequencer};
use crate::trace::{MessagePacket, Packet, PacketKind, TraceError, TracerId};

use super::replayer::{ReplayDisplay, ReplayerSet, ScriptLauncher};
use super::report::ReplayResult;
use super::settings::{FenceSkipMode, FrameSpan, ReplaySettings, SettingsError, TriggerFrames};

/// Conditions that abort the whole replay
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("packet {index} has out of range tracer id {tracer}")]
    InvalidTracerId { index: u64, tracer: u8 },

    #[error("packet {index} has invalid packet id {packet_id}")]
    BadPacketId { index: u64, packet_id: u16 },

    #[error("failed to replay packet {index} (id {packet_id}): {reason}")]
    PacketFailed {
        index: u64,
        packet_id: u16,
        reason: String,
    },
}

/// Replay loop life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    /// Between two loops over the measured range
    LoopBoundary,
    Terminated,
}

/// What a finished replay produced
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// `None` if the measured range was never reached
    pub result: Option<ReplayResult>,
    /// Loops completed
    pub loops: u64,
    /// Packets read from the sequencer
    pub packets: u64,
    /// The display asked to quit before the run finished
    pub quit: bool,
}

/// Mutable state of one run
struct Progress {
    preload: bool,
    start_clock: Option<ClockSnapshot>,
    /// Replayer that handled the latest API packet
    current: Option<TracerId>,
    skip_index: usize,
    first_loop: bool,
    trace_running: bool,
    quit: bool,
}

/// Drives a trace through its replayers
pub struct ReplayLoop<'a, R> {
    settings: ReplaySettings,
    trigger: Option<TriggerFrames>,
    skip_ranges: Vec<FrameSpan>,
    skip_mode: FenceSkipMode,
    sequencer: Sequencer<R>,
    replayers: &'a mut ReplayerSet,
    display: &'a mut dyn ReplayDisplay,
    launcher: &'a mut dyn ScriptLauncher,
    bookmark: Option<Bookmark>,
    state: LoopState,
    packets: u64,
}

impl<'a, R: Read + Seek> ReplayLoop<'a, R> {
    pub fn new(
        settings: ReplaySettings,
        sequencer: Sequencer<R>,
        replayers: &'a mut ReplayerSet,
        display: &'a mut dyn ReplayDisplay,
        launcher: &'a mut dyn ScriptLauncher,
    ) -> Result<Self, ReplayError> {
        let trigger = settings.trigger_frames()?;
        let skip_ranges = settings.skip_ranges()?;
        let skip_mode = if skip_ranges.is_empty() {
            FenceSkipMode::Off
        } else {
            settings.fence_skip_mode()
        };
        Ok(Self {
            settings,
            trigger,
            skip_ranges,
            skip_mode,
            sequencer,
            replayers,
            display,
            launcher,
            bookmark: None,
            state: LoopState::Initializing,
            packets: 0,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn sequencer(&self) -> &Sequencer<R> {
        &self.sequencer
    }

    /// Replay every loop and measure the configured frame range
    pub fn run(&mut self) -> Result<ReplayOutcome, ReplayError> {
        let launch = ClockSnapshot::capture();
        let start_frame = self.settings.start_frame();
        let total_loops = self.settings.num_loops;
        let mut loops_remaining = total_loops;
        let mut end_frame: Option<u64> = None;
        let mut total_frames = 0u64;

        self.load_portability_table()?;
        let skip_mode = self.skip_mode;
        self.replayers
            .for_each(|replayer| replayer.set_fence_skip_mode(skip_mode));

        let mut progress = Progress {
            preload: self.settings.preload,
            start_clock: None,
            current: None,
            skip_index: 0,
            first_loop: true,
            trace_running: true,
            quit: false,
        };

        self.state = LoopState::Running;
        if start_frame == 0 {
            self.begin_measurement(&mut progress, 0)?;
        }
        self.trigger_script(0);

        while loops_remaining > 0 {
            self.state = LoopState::Running;
            if self.settings.screenshot_list.is_some() {
                // Screenshots are taken on the last loop only
                let enabled = loops_remaining == 1;
                self.replayers
                    .for_each(|replayer| replayer.set_screenshots_enabled(enabled));
            }

            progress.trace_running = true;
            while progress.trace_running {
                let Some(packet) = self.sequencer.next_packet()? else {
                    break;
                };
                self.packets += 1;
                self.dispatch(packet, &mut progress)?;
            }

            self.state = LoopState::LoopBoundary;
            loops_remaining -= 1;
            progress.skip_index = 0;
            progress.first_loop = false;

            let frame = self.frame_number(progress.current);
            let end = *end_frame.get_or_insert(match self.settings.loop_end_frame {
                Some(loop_end) => frame.min(loop_end),
                None => frame,
            });
            total_frames += end.saturating_sub(start_frame);
            tracing::debug!(
                "Loop number {} completed. Remaining loops: {}",
                total_loops - loops_remaining,
                loops_remaining
            );

            if progress.quit || loops_remaining == 0 {
                break;
            }
            // Without a measured range the bookmark still marks the first packet
            let bookmark = self.bookmark.unwrap_or_else(|| self.sequencer.bookmark());
            self.sequencer.set_bookmark(bookmark);
            self.replayers
                .for_each(|replayer| replayer.reset_frame_number(start_frame));
            if !self.skip_ranges.is_empty() {
                self.replayers
                    .for_each(|replayer| replayer.set_in_skip_fence_range(false));
            }
        }

        let loops_done = total_loops - loops_remaining;
        let frame = self.frame_number(progress.current);
        if let Some(current) = progress.current {
            if let Some(replayer) = self.replayers.get_mut(current) {
                replayer.device_wait_idle();
            }
        }
        let end_clock = ClockSnapshot::capture();
        self.replayers.for_each(|replayer| {
            replayer.set_in_frame_range(false);
            replayer.on_terminate();
        });
        self.state = LoopState::Terminated;

        let result = match progress.start_clock {
            Some(start_clock) => {
                tracing::info!(
                    "================== End timer (Frame: {}) ==================",
                    frame
                );
                let end = end_frame.unwrap_or(frame);
                let result = ReplayResult::measure(
                    &launch,
                    &start_clock,
                    &end_clock,
                    start_frame,
                    end,
                    total_frames,
                    loops_done,
                );
                match &result {
                    Some(result) => tracing::info!(
                        "{:.3} fps, {:.6} seconds, {} frame{}, {} loop{}, framerange {}",
                        result.fps,
                        result.seconds,
                        result.frames,
                        if result.frames == 1 { "" } else { "s" },
                        result.loops,
                        if result.loops == 1 { "" } else { "s" },
                        result.frame_range
                    ),
                    None => tracing::error!("fps error: replay ended before the timer advanced"),
                }
                result
            }
            None => {
                tracing::warn!(
                    "Trace ended at frame {} before the loop start frame {}",
                    frame,
                    start_frame
                );
                None
            }
        };

        Ok(ReplayOutcome {
            result,
            loops: loops_done,
            packets: self.packets,
            quit: progress.quit,
        })
    }

    fn dispatch(&mut self, packet: Packet, progress: &mut Progress) -> Result<(), ReplayError> {
        let index = packet.index();
        let pc = self.settings.print_current_packet_index;
        if pc == 2 || (pc > 10 && index % pc as u64 == 0) {
            tracing::info!("Replaying packet_index: {}", index);
        }

        match packet.kind() {
            PacketKind::Message => match MessagePacket::decode(&packet.body) {
                Ok(message) => tracing::info!(
                    "Packet {}: Traced Message ({}): {}",
                    index,
                    message.level_name(),
                    message.text
                ),
                Err(e) => tracing::warn!("Packet {}: {}", index, e),
            },
            PacketKind::Marker | PacketKind::PortabilityTable | PacketKind::MetaData => {}
            PacketKind::Present => {
                if self.replay_packet(packet, progress)? {
                    self.end_of_frame(progress)?;
                }
            }
            PacketKind::Api => {
                self.replay_packet(packet, progress)?;
            }
            PacketKind::Invalid => {
                check_tracer(&packet)?;
                return Err(ReplayError::BadPacketId {
                    index,
                    packet_id: packet.header.packet_id,
                });
            }
        }
        Ok(())
    }

    /// Hand an API packet to its replayer. Returns false when no replayer
    /// is registered for the packet's tracer.
    fn replay_packet(&mut self, packet: Packet, progress: &mut Progress) -> Result<bool, ReplayError> {
        let tracer = check_tracer(&packet)?;
        let Some(replayer) = self.replayers.get_mut(tracer) else {
            tracing::warn!(
                "Tracer id {} not supported, skipping packet {}",
                tracer,
                packet.index()
            );
            return Ok(false);
        };
        if progress.start_clock.is_some() {
            replayer.set_in_frame_range(true);
        }

        let packet = if packet.interpreted {
            packet
        } else {
            replayer.interpret(packet)
        };
        progress.current = Some(tracer.replayer_id());

        if let Err(failure) = replayer.replay(&packet) {
            let present = packet.kind() == PacketKind::Present;
            if present {
                tracing::error!("Failed to replay QueuePresent(): {}", failure);
            } else {
                tracing::error!(
                    "Failed to replay packet_id {}, packet index {}: {}",
                    packet.header.packet_id,
                    packet.index(),
                    failure
                );
            }
            if self.settings.exit_on_any_error || (!present && packet.is_object_creation()) {
                return Err(ReplayError::PacketFailed {
                    index: packet.index(),
                    packet_id: packet.header.packet_id,
                    reason: failure.0,
                });
            }
        }
        Ok(true)
    }

    /// Frame control after a present or frame boundary
    fn end_of_frame(&mut self, progress: &mut Progress) -> Result<(), ReplayError> {
        let frame = self.frame_number(progress.current);
        let start_frame = self.settings.start_frame();

        let pc = self.settings.print_current_packet_index;
        if pc == 1 || pc == 2 || (pc > 10 && frame % pc as u64 == 0) {
            tracing::info!("Replaying at frame: {}", frame);
        }

        let delay = self.settings.instrumentation_delay;
        if frame > start_frame && delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }

        self.trigger_script(frame);
        self.update_skip_range(frame, progress);

        if progress.first_loop && progress.start_clock.is_none() && frame == start_frame {
            self.begin_measurement(progress, frame)?;
        }

        if self.settings.loop_end_frame == Some(frame) {
            progress.trace_running = false;
        }

        self.display.process_event();
        while self.display.is_paused() && !self.display.quit_requested() {
            self.display.process_event();
        }
        if self.display.quit_requested() {
            tracing::info!("Quit requested at frame {}", frame);
            progress.quit = true;
            progress.trace_running = false;
        }
        Ok(())
    }

    /// Bookmark the measured range, preload it and start the timer
    fn begin_measurement(&mut self, progress: &mut Progress, frame: u64) -> Result<(), ReplayError> {
        self.sequencer.record_bookmark();
        self.bookmark = Some(self.sequencer.bookmark());

        if progress.preload {
            let replayers = &mut *self.replayers;
            match self
                .sequencer
                .start_preload(self.settings.memory_percentage, |packet| {
                    replayers.interpret(packet)
                })? {
                Some(stats) => {
                    tracing::info!(
                        "Preloaded {} packets ({} bytes)",
                        stats.packets,
                        stats.bytes
                    );
                    if stats.complete {
                        tracing::info!("The frame range can be preloaded completely!");
                    }
                }
                None => {
                    tracing::error!("The chunk count is 0, won't use preloading to replay.");
                    progress.preload = false;
                }
            }
        }

        progress.start_clock = Some(ClockSnapshot::capture());
        self.replayers
            .for_each(|replayer| replayer.set_in_frame_range(true));
        tracing::info!(
            "================== Start timer (Frame: {}) ==================",
            frame
        );
        Ok(())
    }

    fn trigger_script(&mut self, frame: u64) {
        let Some(trigger) = &self.trigger else {
            return;
        };
        if !trigger.contains(frame) {
            return;
        }
        if let Some(script) = &self.settings.trigger_script_path {
            self.launcher.launch(script, frame);
        }
    }

    fn update_skip_range(&mut self, frame: u64, progress: &mut Progress) {
        let Some(span) = self.skip_ranges.get(progress.skip_index).copied() else {
            return;
        };
        if frame > span.end {
            progress.skip_index += 1;
            self.replayers
                .for_each(|replayer| replayer.set_in_skip_fence_range(false));
        }
        if let Some(span) = self.skip_ranges.get(progress.skip_index) {
            if frame >= span.start && frame <= span.end {
                self.replayers
                    .for_each(|replayer| replayer.set_in_skip_fence_range(true));
            }
        }
    }

    fn frame_number(&mut self, current: Option<TracerId>) -> u64 {
        current
            .and_then(|tracer| self.replayers.get_mut(tracer))
            .map_or(0, |replayer| replayer.frame_number())
    }

    fn load_portability_table(&mut self) -> Result<(), ReplayError> {
        if !self.settings.enable_portability_table {
            return Ok(());
        }
        let Some(table) = self.sequencer.reader_mut().read_portability_table()? else {
            tracing::warn!("Portability table requested but the trace has none");
            return Ok(());
        };
        tracing::debug!("Portability table lists {} packets", table.packets.len());

        let mut by_tracer: Vec<(TracerId, Vec<Packet>)> = Vec::new();
        for packet in table.packets {
            let tracer = packet.tracer_id().replayer_id();
            let packet = self.replayers.interpret(packet);
            match by_tracer.iter_mut().find(|(id, _)| *id == tracer) {
                Some((_, packets)) => packets.push(packet),
                None => by_tracer.push((tracer, vec![packet])),
            }
        }
        for (tracer, packets) in by_tracer {
            if let Some(replayer) = self.replayers.get_mut(tracer) {
                replayer.load_portability_table(packets);
            }
        }
        Ok(())
    }
}

fn check_tracer(packet: &Packet) -> Result<TracerId, ReplayError> {
    let tracer = packet.tracer_id();
    if !tracer.is_valid() {
        return Err(ReplayError::InvalidTracerId {
            index: packet.index(),
            tracer: tracer.0,
        });
    }
    Ok(tracer)
}
