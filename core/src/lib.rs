//! Tracegrab Core - trace replay engine
//!
//! Reads API traces, sequences their packets and replays them through
//! per-API replayers while measuring a configured frame range.
//!
//! # Architecture
//!
//! - [`trace`] - Trace file header, packet codec and random-access reader
//! - [`Sequencer`] - Ordered packet delivery with bookmarks and preloading
//! - [`ReplayLoop`] - Frame-control state machine over the sequencer
//! - [`ReplaySettings`] - Replay configuration and its validation
//! - [`ResultDocument`] - JSON summary of a finished replay

pub mod clock;
pub mod replay;
pub mod sequencer;
pub mod trace;

// Re-export the replay surface
pub use replay::{
    ApiReplayer, FenceSkipMode, HeadlessDisplay, LoopState, NullReplayer, ReplayDisplay,
    ReplayError, ReplayLoop, ReplayOutcome, ReplayResult, ReplaySettings, ReplayerSet,
    ResultDocument, ScriptLauncher, SettingsError, ShellLauncher, Verbosity,
};
pub use sequencer::{Bookmark, PreloadStats, Sequencer, SequencerState};
pub use trace::{TraceError, TraceHeader, TraceReader};
