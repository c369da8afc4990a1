//! Replay command
//!
//! Assembles the settings (defaults, `--settings` file, trace metadata,
//! command line), exports the screenshot variables for the layer, runs the
//! replay loop and writes the result summary.

use anyhow::{Context, Result, bail};
use clap::Args;
use hashbrown::HashSet;
use std::path::PathBuf;

use tracegrab_core::trace::TracerId;
use tracegrab_core::{
    HeadlessDisplay, NullReplayer, ReplayLoop, ReplayOutcome, ReplaySettings, ReplayerSet,
    ResultDocument, Sequencer, ShellLauncher, TraceReader,
};

/// Arguments for the replay command
#[derive(Args, Default)]
pub struct ReplayArgs {
    /// Trace file to replay
    pub trace: PathBuf,

    /// TOML settings file applied before trace metadata and command line
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Where to write the result summary
    #[arg(long, default_value = "replay_result.json")]
    pub result_file: PathBuf,

    /// Number of times to replay the measured frames
    #[arg(short = 'l', long)]
    pub num_loops: Option<u64>,

    /// First frame of the measured range
    #[arg(long)]
    pub loop_start_frame: Option<u64>,

    /// Frame that ends the measured range
    #[arg(long)]
    pub loop_end_frame: Option<u64>,

    /// Preload the measured frames before replaying
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub preload: Option<bool>,

    /// Percent of the remaining trace to preload (1-100)
    #[arg(long)]
    pub memory_percentage: Option<u8>,

    /// Frames to capture: list, <start>-<count>[-<interval>] or all
    #[arg(short = 's', long)]
    pub screenshot: Option<String>,

    /// Color space of captured frames
    #[arg(long)]
    pub screenshot_format: Option<String>,

    /// Prefix for screenshot file names
    #[arg(long)]
    pub screenshot_prefix: Option<String>,

    /// Abort on the first failed packet
    #[arg(short = 'x', long, num_args = 0..=1, default_missing_value = "true")]
    pub exit_on_any_error: Option<bool>,

    /// quiet, errors, warnings, full or debug
    #[arg(short = 'v', long)]
    pub verbosity: Option<String>,

    /// Interpret the portability table before replay
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub portability_table: Option<bool>,

    /// Frames after which to run the trigger script (*, N, a-b)
    #[arg(long)]
    pub trigger_frames: Option<String>,

    /// Script run by /bin/sh on trigger frames
    #[arg(long)]
    pub trigger_script: Option<PathBuf>,

    /// 0 off, 1 frames, 2 packets and frames, >10 every N
    #[arg(long)]
    pub print_packet_index: Option<u32>,

    /// Microseconds to sleep after each measured present
    #[arg(long)]
    pub instrumentation_delay: Option<u64>,

    /// Any option by short or long name, e.g. `-O pmp=80`
    #[arg(short = 'O', long = "option", value_parser = parse_key_val)]
    pub options: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("missing option name in '{s}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Settings from defaults, the settings file and the command line, plus the
/// short names the command line set
fn assemble(args: &ReplayArgs) -> Result<(ReplaySettings, HashSet<String>)> {
    let mut settings = match &args.settings {
        Some(path) => ReplaySettings::from_toml_file(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => ReplaySettings::default(),
    };
    let mut pinned = HashSet::new();

    let mut pin = |name: &str, value: String| -> Result<()> {
        settings
            .set_option(name, &value)
            .with_context(|| format!("Invalid value for option {name}"))?;
        pinned.insert(name.to_string());
        Ok(())
    };

    pin("o", args.trace.display().to_string())?;
    let numbers = [
        ("l", args.num_loops),
        ("lsf", args.loop_start_frame),
        ("lef", args.loop_end_frame),
        ("intd", args.instrumentation_delay),
        ("pmp", args.memory_percentage.map(u64::from)),
        ("pc", args.print_packet_index.map(u64::from)),
    ];
    for (name, value) in numbers {
        if let Some(value) = value {
            pin(name, value.to_string())?;
        }
    }
    let flags = [
        ("pltf", args.preload),
        ("x", args.exit_on_any_error),
        ("pt", args.portability_table),
    ];
    for (name, value) in flags {
        if let Some(value) = value {
            pin(name, value.to_string())?;
        }
    }
    let strings = [
        ("s", args.screenshot.clone()),
        ("sf", args.screenshot_format.clone()),
        ("sp", args.screenshot_prefix.clone()),
        ("v", args.verbosity.clone()),
        ("tsf", args.trigger_frames.clone()),
        ("tsp", args.trigger_script.as_ref().map(|p| p.display().to_string())),
    ];
    for (name, value) in strings {
        if let Some(value) = value {
            pin(name, value)?;
        }
    }
    for (name, value) in &args.options {
        let short = tracegrab_core::replay::OptionSpec::find(name)
            .map(|spec| spec.short)
            .with_context(|| format!("Unknown option '{name}'"))?;
        pin(short, value.clone())?;
    }

    Ok((settings, pinned))
}

/// Export the screenshot variables the layer reads at instance creation
fn export_screenshot_env(settings: &ReplaySettings) {
    let Some(env) = settings.screenshot_env() else {
        return;
    };
    for (name, value) in env.vars() {
        tracing::debug!("Exporting {}={}", name, value);
        // SAFETY: called before the replay starts any threads.
        unsafe { std::env::set_var(name, value) };
    }
}

fn print_summary(outcome: &ReplayOutcome) {
    match &outcome.result {
        Some(result) => println!(
            "{:.3} fps, {:.6} seconds, {} frame{}, {} loop{}, framerange {}",
            result.fps,
            result.seconds,
            result.frames,
            if result.frames == 1 { "" } else { "s" },
            result.loops,
            if result.loops == 1 { "" } else { "s" },
            result.frame_range
        ),
        None => println!("No frames measured ({} packets replayed)", outcome.packets),
    }
}

/// Execute the replay command
pub fn execute(args: ReplayArgs) -> Result<()> {
    let (mut settings, pinned) = assemble(&args)?;
    crate::init_logging(settings.verbosity);

    let trace_path = args.trace.clone();
    let mut reader = TraceReader::open(&trace_path)
        .with_context(|| format!("Failed to open trace: {}", trace_path.display()))?;
    reader
        .validate()
        .with_context(|| format!("Trace cannot be replayed: {}", trace_path.display()))?;

    if let Some(metadata) = reader
        .read_metadata()
        .context("Failed to read trace metadata")?
    {
        settings
            .apply_metadata(&metadata.option_strings(), &pinned)
            .context("Invalid option in trace metadata")?;
    }

    if let Err(e) = settings.validate() {
        eprintln!("Replay settings:\n{settings}");
        bail!("Invalid replay settings: {e}");
    }

    export_screenshot_env(&settings);

    let header = reader.header().clone();
    let mut replayers = ReplayerSet::new();
    replayers.insert(TracerId::VULKAN, Box::new(NullReplayer::new()));
    let mut display = HeadlessDisplay;
    let mut launcher = ShellLauncher;

    let options = settings.options();
    let outcome = ReplayLoop::new(
        settings,
        Sequencer::new(reader),
        &mut replayers,
        &mut display,
        &mut launcher,
    )?
    .run()
    .context("Replay failed")?;

    print_summary(&outcome);
    ResultDocument::new(&header, options, outcome.result)
        .write(&args.result_file)
        .with_context(|| format!("Failed to write results: {}", args.result_file.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracegrab_core::trace::{CompressType, TraceWriter, packet_id};

    fn write_trace(dir: &std::path::Path, frames: u64, options: Option<serde_json::Value>) -> PathBuf {
        let mut writer = TraceWriter::new(CompressType::Lz4);
        writer.packet((TracerId::VULKAN, packet_id::CREATE_INSTANCE, vec![0]));
        for _ in 0..frames {
            writer.packet((TracerId::VULKAN, 40, vec![1, 2, 3]));
            writer.packet((TracerId::VULKAN, packet_id::QUEUE_PRESENT, Vec::new()));
        }
        if let Some(options) = options {
            writer.metadata(&serde_json::json!({ "ReplayOptions": options }));
        }
        let path = dir.join("app.vktrace");
        std::fs::write(&path, writer.finish()).unwrap();
        path
    }

    fn args(trace: PathBuf, result_file: PathBuf) -> ReplayArgs {
        ReplayArgs {
            trace,
            result_file,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("pmp=80").unwrap(),
            ("pmp".to_string(), "80".to_string())
        );
        assert_eq!(
            parse_key_val("sfr=1-2,5-6").unwrap(),
            ("sfr".to_string(), "1-2,5-6".to_string())
        );
        assert!(parse_key_val("pmp").is_err());
        assert!(parse_key_val("=3").is_err());
    }

    #[test]
    fn test_command_line_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("replay.toml");
        std::fs::write(&file, "num_loops = 4\nmemory_percentage = 30\n").unwrap();

        let mut args = args(dir.path().join("t.vktrace"), dir.path().join("r.json"));
        args.settings = Some(file);
        args.num_loops = Some(2);
        args.options = vec![("LoopEndFrame".into(), "9".into())];

        let (settings, pinned) = assemble(&args).unwrap();
        assert_eq!(settings.num_loops, 2);
        assert_eq!(settings.memory_percentage, 30);
        assert_eq!(settings.loop_end_frame, Some(9));
        assert!(pinned.contains("l"));
        assert!(pinned.contains("lef"));
        assert!(pinned.contains("o"));
        assert!(!pinned.contains("pmp"));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let mut args = args(PathBuf::from("t.vktrace"), PathBuf::from("r.json"));
        args.options = vec![("warp".into(), "9".into())];
        assert!(assemble(&args).is_err());
    }

    #[test]
    fn test_replay_writes_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let trace = write_trace(dir.path(), 6, Some(serde_json::json!({ "lsf": "2", "l": "5" })));
        let result_file = dir.path().join("result.json");

        let mut args = args(trace, result_file.clone());
        args.num_loops = Some(2);
        args.loop_end_frame = Some(4);
        execute(args).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&result_file).unwrap()).unwrap();
        // Metadata supplied the start frame, the command line kept its loop count
        assert_eq!(json["replayer"]["replay_options"]["lsf"], "2");
        assert_eq!(json["replayer"]["replay_options"]["l"], "2");
        assert_eq!(json["result"]["frame_range"], "2-4");
        assert_eq!(json["result"]["frames"], 4);
        assert_eq!(json["result"]["loops"], 2);
        assert_eq!(json["application"]["endianess"], "Little");
    }

    #[test]
    fn test_invalid_settings_fail_before_replay() {
        let dir = tempfile::tempdir().unwrap();
        let trace = write_trace(dir.path(), 2, None);
        let result_file = dir.path().join("result.json");

        let mut args = args(trace, result_file.clone());
        args.loop_start_frame = Some(5);
        args.loop_end_frame = Some(3);
        assert!(execute(args).is_err());
        assert!(!result_file.exists());
    }

    #[test]
    fn test_gfxr_capture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path().join("capture.gfxr"), dir.path().join("r.json"));
        let err = execute(args).unwrap_err();
        assert!(format!("{err:#}").contains("gfxreconstruct"));
    }
}
