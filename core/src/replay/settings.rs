//! Replay settings
//!
//! Settings start from built-in defaults, can be loaded from a TOML file, are
//! then overridden by the trace's metadata and finally by the command line.
//! Every option has a short name (`l`, `lsf`, `pmp`, ...) used on the command
//! line, in trace metadata and in the result summary.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracegrab_shared::{ColorSpaceOverride, FrameRangeError, FrameSelection, ScreenshotEnv};

/// Errors in the replay configuration
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("invalid value '{value}' for option '{option}'")]
    InvalidValue { option: String, value: String },

    #[error("no trace file given")]
    MissingTraceFile,

    #[error("loop start frame {start} must be less than loop end frame {end}")]
    LoopRange { start: u64, end: u64 },

    #[error("memory percentage {0} must be in 1..=100")]
    MemoryPercentage(u8),

    #[error("number of loops must be at least 1")]
    ZeroLoops,

    #[error("invalid trigger script frames '{0}'")]
    TriggerFrames(String),

    #[error("invalid skip fence ranges '{0}'")]
    SkipFenceRanges(String),

    #[error("skip get fence status {0} must be 0, 1 or 2")]
    FenceSkipMode(u8),

    #[error("invalid screenshot frames: {0}")]
    ScreenshotFrames(#[from] FrameRangeError),

    #[error("display server '{0}' cannot be used with headless replay")]
    HeadlessDisplay(String),
}

/// Log level requested for the replayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Errors,
    Warnings,
    Full,
    Debug,
}

impl Verbosity {
    pub const ALL: [Verbosity; 5] = [
        Verbosity::Quiet,
        Verbosity::Errors,
        Verbosity::Warnings,
        Verbosity::Full,
        Verbosity::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Errors => "errors",
            Verbosity::Warnings => "warnings",
            Verbosity::Full => "full",
            Verbosity::Debug => "debug",
        }
    }

    /// `tracing` filter directive for this level
    pub fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "off",
            Verbosity::Errors => "error",
            Verbosity::Warnings => "warn",
            Verbosity::Full => "info",
            Verbosity::Debug => "debug",
        }
    }
}

impl FromStr for Verbosity {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verbosity::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| SettingsError::InvalidValue {
                option: "v".into(),
                value: s.into(),
            })
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and description of one option
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub short: &'static str,
    pub long: &'static str,
    pub help: &'static str,
}

/// Every option, in the order the settings table prints them
pub const OPTIONS: &[OptionSpec] = &[
    OptionSpec { short: "o", long: "Open", help: "Trace file to replay" },
    OptionSpec { short: "pltf", long: "PreloadTraceFile", help: "Preload the measured frames before replaying" },
    OptionSpec { short: "pmp", long: "MemoryPercentage", help: "Percent of the remaining trace to preload (1-100)" },
    OptionSpec { short: "prm", long: "Premapping", help: "Premap resources while preloading" },
    OptionSpec { short: "l", long: "NumLoops", help: "Number of times to replay the measured frames" },
    OptionSpec { short: "lsf", long: "LoopStartFrame", help: "First frame of the measured range" },
    OptionSpec { short: "lef", long: "LoopEndFrame", help: "Frame that ends the measured range" },
    OptionSpec { short: "s", long: "Screenshot", help: "Frames to capture (list, <start>-<count>[-<interval>] or all)" },
    OptionSpec { short: "sf", long: "ScreenshotFormat", help: "Color space of captured frames" },
    OptionSpec { short: "sp", long: "ScreenshotPrefix", help: "Prefix for screenshot file names" },
    OptionSpec { short: "c", long: "CompatibilityMode", help: "Remap memory types and queue families to the replay device" },
    OptionSpec { short: "x", long: "ExitOnAnyError", help: "Abort on the first failed packet" },
    OptionSpec { short: "v", long: "Verbosity", help: "quiet, errors, warnings, full or debug" },
    OptionSpec { short: "pt", long: "EnablePortabilityTable", help: "Interpret the portability table before replay" },
    OptionSpec { short: "tsf", long: "TriggerScriptOnFrame", help: "Frames after which to run the trigger script (*, N, a-b)" },
    OptionSpec { short: "tsp", long: "TriggerScriptPath", help: "Script run by /bin/sh on trigger frames" },
    OptionSpec { short: "pc", long: "PrintCurrentPacketIndex", help: "0 off, 1 frames, 2 packets and frames, >10 every N" },
    OptionSpec { short: "intd", long: "InstrumentationDelay", help: "Microseconds to sleep after each measured present" },
    OptionSpec { short: "sgfs", long: "SkipGetFenceStatus", help: "Skip fence status queries: 0 none, 1 unsuccessful, 2 all" },
    OptionSpec { short: "sfr", long: "SkipFenceRanges", help: "Frame ranges for fence status skipping (a-b,c-d)" },
    OptionSpec { short: "fbw", long: "FinishBeforeSwap", help: "Wait for the device before each present" },
    OptionSpec { short: "headless", long: "Headless", help: "Replay without a window" },
    OptionSpec { short: "vsyncoff", long: "VsyncOff", help: "Present without waiting for vertical sync" },
    OptionSpec { short: "ds", long: "DisplayServer", help: "Window system to present to" },
];

impl OptionSpec {
    /// Look an option up by short or long name
    pub fn find(name: &str) -> Option<&'static OptionSpec> {
        OPTIONS
            .iter()
            .find(|spec| spec.short == name || spec.long.eq_ignore_ascii_case(name))
    }
}

fn default_memory_percentage() -> u8 {
    50
}

fn default_num_loops() -> u64 {
    1
}

fn default_compatibility_mode() -> bool {
    true
}

/// Effective replay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    #[serde(default)]
    pub trace_file: Option<PathBuf>,
    #[serde(default)]
    pub preload: bool,
    #[serde(default = "default_memory_percentage")]
    pub memory_percentage: u8,
    #[serde(default)]
    pub premapping: bool,
    #[serde(default = "default_num_loops")]
    pub num_loops: u64,
    /// Unset means frame 0
    #[serde(default)]
    pub loop_start_frame: Option<u64>,
    /// Unset means the end of the trace
    #[serde(default)]
    pub loop_end_frame: Option<u64>,
    #[serde(default)]
    pub screenshot_list: Option<String>,
    #[serde(default)]
    pub screenshot_format: Option<String>,
    #[serde(default)]
    pub screenshot_prefix: Option<String>,
    #[serde(default = "default_compatibility_mode")]
    pub compatibility_mode: bool,
    #[serde(default)]
    pub exit_on_any_error: bool,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub enable_portability_table: bool,
    #[serde(default)]
    pub trigger_script_frames: Option<String>,
    #[serde(default)]
    pub trigger_script_path: Option<PathBuf>,
    #[serde(default)]
    pub print_current_packet_index: u32,
    /// Microseconds
    #[serde(default)]
    pub instrumentation_delay: u64,
    #[serde(default)]
    pub skip_get_fence_status: u8,
    #[serde(default)]
    pub skip_fence_ranges: Option<String>,
    #[serde(default)]
    pub finish_before_swap: bool,
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub vsync_off: bool,
    #[serde(default)]
    pub display_server: Option<String>,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            trace_file: None,
            preload: false,
            memory_percentage: default_memory_percentage(),
            premapping: false,
            num_loops: default_num_loops(),
            loop_start_frame: None,
            loop_end_frame: None,
            screenshot_list: None,
            screenshot_format: None,
            screenshot_prefix: None,
            compatibility_mode: default_compatibility_mode(),
            exit_on_any_error: false,
            verbosity: Verbosity::default(),
            enable_portability_table: false,
            trigger_script_frames: None,
            trigger_script_path: None,
            print_current_packet_index: 0,
            instrumentation_delay: 0,
            skip_get_fence_status: 0,
            skip_fence_ranges: None,
            finish_before_swap: false,
            headless: false,
            vsync_off: false,
            display_server: None,
        }
    }
}

fn parse_bool(option: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            option: option.into(),
            value: value.into(),
        }),
    }
}

fn parse_num<T: FromStr>(option: &str, value: &str) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue {
            option: option.into(),
            value: value.into(),
        })
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl ReplaySettings {
    /// Load settings from a TOML file; missing keys take their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Set one option from its string form. `name` may be short or long.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), SettingsError> {
        let spec = OptionSpec::find(name).ok_or_else(|| SettingsError::UnknownOption(name.into()))?;
        let short = spec.short;
        match short {
            "o" => self.trace_file = non_empty(value).map(PathBuf::from),
            "pltf" => self.preload = parse_bool(short, value)?,
            "pmp" => self.memory_percentage = parse_num(short, value)?,
            "prm" => self.premapping = parse_bool(short, value)?,
            "l" => self.num_loops = parse_num(short, value)?,
            "lsf" => self.loop_start_frame = Some(parse_num(short, value)?),
            "lef" => self.loop_end_frame = Some(parse_num(short, value)?),
            "s" => self.screenshot_list = non_empty(value),
            "sf" => self.screenshot_format = non_empty(value),
            "sp" => self.screenshot_prefix = non_empty(value),
            "c" => self.compatibility_mode = parse_bool(short, value)?,
            "x" => self.exit_on_any_error = parse_bool(short, value)?,
            "v" => self.verbosity = value.trim().parse()?,
            "pt" => self.enable_portability_table = parse_bool(short, value)?,
            "tsf" => self.trigger_script_frames = non_empty(value),
            "tsp" => self.trigger_script_path = non_empty(value).map(PathBuf::from),
            "pc" => self.print_current_packet_index = parse_num(short, value)?,
            "intd" => self.instrumentation_delay = parse_num(short, value)?,
            "sgfs" => self.skip_get_fence_status = parse_num(short, value)?,
            "sfr" => self.skip_fence_ranges = non_empty(value),
            "fbw" => self.finish_before_swap = parse_bool(short, value)?,
            "headless" => self.headless = parse_bool(short, value)?,
            "vsyncoff" => self.vsync_off = parse_bool(short, value)?,
            "ds" => self.display_server = non_empty(value),
            _ => return Err(SettingsError::UnknownOption(name.into())),
        }
        Ok(())
    }

    /// Current value of an option in its string form, `None` when unset
    pub fn option_value(&self, short: &str) -> Option<String> {
        let flag = |b: bool| Some(b.to_string());
        match short {
            "o" => self.trace_file.as_ref().map(|p| p.display().to_string()),
            "pltf" => flag(self.preload),
            "pmp" => Some(self.memory_percentage.to_string()),
            "prm" => flag(self.premapping),
            "l" => Some(self.num_loops.to_string()),
            "lsf" => self.loop_start_frame.map(|f| f.to_string()),
            "lef" => self.loop_end_frame.map(|f| f.to_string()),
            "s" => self.screenshot_list.clone(),
            "sf" => self.screenshot_format.clone(),
            "sp" => self.screenshot_prefix.clone(),
            "c" => flag(self.compatibility_mode),
            "x" => flag(self.exit_on_any_error),
            "v" => Some(self.verbosity.to_string()),
            "pt" => flag(self.enable_portability_table),
            "tsf" => self.trigger_script_frames.clone(),
            "tsp" => self
                .trigger_script_path
                .as_ref()
                .map(|p| p.display().to_string()),
            "pc" => Some(self.print_current_packet_index.to_string()),
            "intd" => Some(self.instrumentation_delay.to_string()),
            "sgfs" => Some(self.skip_get_fence_status.to_string()),
            "sfr" => self.skip_fence_ranges.clone(),
            "fbw" => flag(self.finish_before_swap),
            "headless" => flag(self.headless),
            "vsyncoff" => flag(self.vsync_off),
            "ds" => self.display_server.clone(),
            _ => None,
        }
    }

    /// Every set option keyed by short name
    pub fn options(&self) -> BTreeMap<String, String> {
        OPTIONS
            .iter()
            .filter_map(|spec| {
                self.option_value(spec.short)
                    .map(|value| (spec.short.to_string(), value))
            })
            .collect()
    }

    /// Apply the trace's `ReplayOptions`, skipping options in `pinned`
    /// (the ones given on the command line). Returns the short names that
    /// were overridden.
    pub fn apply_metadata(
        &mut self,
        options: &BTreeMap<String, String>,
        pinned: &HashSet<String>,
    ) -> Result<Vec<String>, SettingsError> {
        let mut applied = Vec::new();
        for (name, value) in options {
            let Some(spec) = OptionSpec::find(name) else {
                tracing::warn!("Ignoring unknown option \"{}\" in meta data", name);
                continue;
            };
            if pinned.contains(spec.short) {
                tracing::debug!(
                    "Option \"{}\" from meta data ignored, set on the command line",
                    spec.short
                );
                continue;
            }
            if self.option_value(spec.short).as_deref() == Some(value.as_str()) {
                continue;
            }
            self.set_option(spec.short, value)?;
            tracing::info!(
                "Option \"{}\" overridden to \"{}\" by meta data",
                spec.short,
                value
            );
            applied.push(spec.short.to_string());
        }
        Ok(applied)
    }

    /// First frame of the measured range
    pub fn start_frame(&self) -> u64 {
        self.loop_start_frame.unwrap_or(0)
    }

    /// Check option combinations, fixing up the ones that have a safe
    /// correction.
    pub fn validate(&mut self) -> Result<(), SettingsError> {
        if self.trace_file.is_none() {
            return Err(SettingsError::MissingTraceFile);
        }
        let start = self.start_frame();
        if let Some(end) = self.loop_end_frame {
            if start >= end {
                return Err(SettingsError::LoopRange { start, end });
            }
        }
        if self.memory_percentage == 0 || self.memory_percentage > 100 {
            return Err(SettingsError::MemoryPercentage(self.memory_percentage));
        }
        if self.num_loops == 0 {
            return Err(SettingsError::ZeroLoops);
        }
        if self.preload && self.num_loops != 1 {
            tracing::error!(
                "Preloading supports a single loop, NumLoops {} forced to 1",
                self.num_loops
            );
            self.num_loops = 1;
        }
        if let Some(list) = &self.screenshot_list {
            FrameSelection::parse(list)?;
        }
        if let Some(format) = &self.screenshot_format {
            if let (_, Some(unknown)) = ColorSpaceOverride::parse_or_swapchain(format) {
                tracing::warn!(
                    "Unknown screenshot format {}, the swapchain format will be used",
                    unknown.0
                );
            }
        }
        self.trigger_frames()?;
        if self.skip_get_fence_status > 2 {
            return Err(SettingsError::FenceSkipMode(self.skip_get_fence_status));
        }
        self.skip_ranges()?;
        if self.headless {
            if let Some(server) = &self.display_server {
                if server != "none" {
                    return Err(SettingsError::HeadlessDisplay(server.clone()));
                }
            }
        }
        Ok(())
    }

    /// Parsed trigger frames; `None` unless both frames and script are set
    pub fn trigger_frames(&self) -> Result<Option<TriggerFrames>, SettingsError> {
        match (&self.trigger_script_frames, &self.trigger_script_path) {
            (Some(frames), Some(_)) => TriggerFrames::parse(frames).map(Some),
            _ => Ok(None),
        }
    }

    /// Which fence status queries the replayer skips inside the skip ranges
    pub fn fence_skip_mode(&self) -> FenceSkipMode {
        match self.skip_get_fence_status {
            0 => FenceSkipMode::Off,
            1 => FenceSkipMode::Unsuccessful,
            _ => FenceSkipMode::All,
        }
    }

    /// Parsed skip fence ranges; empty when fence skipping is off.
    ///
    /// Skipping without ranges is disabled with an error.
    pub fn skip_ranges(&self) -> Result<Vec<FrameSpan>, SettingsError> {
        if self.skip_get_fence_status == 0 {
            return Ok(Vec::new());
        }
        match &self.skip_fence_ranges {
            Some(ranges) => parse_skip_ranges(ranges),
            None => {
                tracing::error!("No skip fence ranges set, disabling fence skip functionality.");
                Ok(Vec::new())
            }
        }
    }

    /// Variables the screenshot layer reads, `None` without a screenshot list
    pub fn screenshot_env(&self) -> Option<ScreenshotEnv> {
        let frames = self.screenshot_list.clone()?;
        Some(ScreenshotEnv {
            frames: Some(frames),
            format: self.screenshot_format.clone(),
            prefix: self.screenshot_prefix.clone(),
            ..Default::default()
        })
    }
}

impl fmt::Display for ReplaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for spec in OPTIONS {
            let value = self
                .option_value(spec.short)
                .unwrap_or_else(|| "<unset>".into());
            writeln!(
                f,
                "  -{:<9} --{:<24} = {:<16} {}",
                spec.short, spec.long, value, spec.help
            )?;
        }
        Ok(())
    }
}

/// Fence status queries the replayer skips while in a skip fence range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceSkipMode {
    #[default]
    Off,
    /// Only queries that would report the fence as not signaled
    Unsuccessful,
    All,
}

/// Inclusive frame interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameSpan {
    pub start: u64,
    pub end: u64,
}

impl FrameSpan {
    pub fn contains(&self, frame: u64) -> bool {
        (self.start..=self.end).contains(&frame)
    }
}

/// Frames after which the trigger script runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFrames {
    every: bool,
    spans: Vec<FrameSpan>,
}

impl TriggerFrames {
    /// Parse `*`, single frames and `a-b` ranges separated by commas.
    /// Anything from `/frame` onward is ignored.
    pub fn parse(spec: &str) -> Result<Self, SettingsError> {
        let invalid = || SettingsError::TriggerFrames(spec.to_string());
        let body = spec.find("/frame").map_or(spec, |at| &spec[..at]).trim();
        if body.is_empty() {
            return Err(invalid());
        }

        let mut every = false;
        let mut spans = Vec::new();
        for token in body.split(',').map(str::trim) {
            if token == "*" {
                every = true;
            } else if let Some((a, b)) = token.split_once('-') {
                let start: u64 = a.trim().parse().map_err(|_| invalid())?;
                let end: u64 = b.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                spans.push(FrameSpan { start, end });
            } else {
                let frame: u64 = token.parse().map_err(|_| invalid())?;
                spans.push(FrameSpan {
                    start: frame,
                    end: frame,
                });
            }
        }
        Ok(Self { every, spans })
    }

    pub fn contains(&self, frame: u64) -> bool {
        self.every || self.spans.iter().any(|span| span.contains(frame))
    }
}

/// Parse `a-b,c-d` into sorted, merged spans
pub fn parse_skip_ranges(spec: &str) -> Result<Vec<FrameSpan>, SettingsError> {
    let invalid = || SettingsError::SkipFenceRanges(spec.to_string());
    if spec.trim().is_empty() {
        return Err(invalid());
    }

    let mut spans = Vec::new();
    for token in spec.split(',') {
        let bounds: Vec<&str> = token.split('-').map(str::trim).collect();
        let [a, b] = bounds.as_slice() else {
            return Err(invalid());
        };
        let start: u64 = a.parse().map_err(|_| invalid())?;
        let end: u64 = b.parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        spans.push(FrameSpan { start, end });
    }

    spans.sort();
    let mut merged: Vec<FrameSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    Ok(merged)
}
