//! Layer configuration
//!
//! Read once from the environment when the first instance is created.

use std::path::PathBuf;

use tracegrab_shared::{ColorSpaceOverride, FrameSelection, ScreenshotEnv};

/// Render-pass scoped capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPassDump {
    #[default]
    Off,
    /// Every render pass
    All,
    /// Only the render pass created with this index
    Index(u32),
}

impl RenderPassDump {
    /// Parse `<index>`, `all` or `off`; anything else turns the mode off.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return RenderPassDump::All;
        }
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse() {
            Ok(index) => RenderPassDump::Index(index),
            Err(_) => {
                if !value.eq_ignore_ascii_case("off") {
                    tracing::warn!(value, "unrecognized render pass dump mode, disabled");
                }
                RenderPassDump::Off
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self != RenderPassDump::Off
    }

    /// Whether the render pass with creation index `index` is dumped.
    pub fn matches(&self, index: u32) -> bool {
        match self {
            RenderPassDump::Off => false,
            RenderPassDump::All => true,
            RenderPassDump::Index(wanted) => *wanted == index,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayerConfig {
    /// `None` when no selection was given or it failed to parse
    pub frames: Option<FrameSelection>,
    pub color_space: ColorSpaceOverride,
    pub output_dir: Option<PathBuf>,
    pub prefix: String,
    pub render_pass_dump: RenderPassDump,
}

impl LayerConfig {
    pub fn from_env(env: &ScreenshotEnv) -> Self {
        let frames = env.frames.as_deref().and_then(|spec| match FrameSelection::parse(spec) {
            Ok(selection) => Some(selection),
            Err(err) => {
                tracing::error!(spec, %err, "Screenshot range error, capture disabled");
                None
            }
        });

        let color_space = match env.format.as_deref() {
            Some(format) => {
                let (parsed, unknown) = ColorSpaceOverride::parse_or_swapchain(format);
                if let Some(err) = unknown {
                    tracing::warn!("{err}");
                }
                parsed
            }
            None => ColorSpaceOverride::Swapchain,
        };

        let render_pass_dump = env
            .dump_renderpass
            .as_deref()
            .map(RenderPassDump::parse)
            .unwrap_or_default();

        let config = Self {
            frames,
            color_space,
            output_dir: env.dir.as_ref().map(PathBuf::from),
            prefix: env.prefix.clone().unwrap_or_default(),
            render_pass_dump,
        };
        tracing::debug!(?config, "screenshot layer configured");
        config
    }

    /// Place `file_name` in the output directory, if one is configured.
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }
}
