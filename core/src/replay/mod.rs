//! Trace replay
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │ TraceReader  │ → │ Sequencer │ → │ ReplayLoop │ → │ ApiReplayer  │
//! └──────────────┘   └───────────┘   └────────────┘   └──────────────┘
//!                                      │        │
//!                            ReplayDisplay    ScriptLauncher
//! ```
//!
//! Settings are assembled before the loop starts (defaults, settings file,
//! trace metadata, command line) and never change while it runs. The loop
//! produces a [`ReplayOutcome`] whose measurement is written as a
//! [`ResultDocument`].

mod replayer;
mod report;
mod runner;
mod settings;


pub use replayer::{
    ApiReplayer, HeadlessDisplay, NullReplayer, PacketFailure, ReplayDisplay, ReplayerSet,
    ScriptLauncher, ShellLauncher,
};
pub use report::{GpuSummary, ReplayResult, ReplayerInfo, ResultDocument, TraceApplicationInfo};
pub use runner::{LoopState, ReplayError, ReplayLoop, ReplayOutcome};
pub use settings::{
    FenceSkipMode, FrameSpan, OPTIONS, OptionSpec, ReplaySettings, SettingsError, TriggerFrames,
    Verbosity, parse_skip_ranges,
};
