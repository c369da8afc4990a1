//! Environment contract between the replayer and the screenshot layer
//!
//! The replayer exports these variables before replay starts; the layer reads
//! them once when the first instance is created.

use serde::{Deserialize, Serialize};

/// Frames to capture (list or range syntax)
pub const FRAMES: &str = "VK_SCREENSHOT_FRAMES";
/// Older name for [`FRAMES`], consulted when it is unset
pub const FRAMES_LEGACY: &str = "_VK_SCREENSHOT";
/// Destination color-space family
pub const FORMAT: &str = "VK_SCREENSHOT_FORMAT";
/// Output directory
pub const DIR: &str = "VK_SCREENSHOT_DIR";
/// File name prefix
pub const PREFIX: &str = "VK_SCREENSHOT_PREFIX";
/// Render-pass scoped capture: `<index>`, `all` or `off`
pub const DUMP_RENDERPASS: &str = "VK_SCREENSHOT_DUMP_RENDERPASS";

/// Screenshot options as carried through the environment.
///
/// Every field is the raw string; empty strings are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEnv {
    pub frames: Option<String>,
    pub format: Option<String>,
    pub dir: Option<String>,
    pub prefix: Option<String>,
    pub dump_renderpass: Option<String>,
}

impl ScreenshotEnv {
    /// Read the options through `lookup` (normally `std::env::var`).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        Self {
            frames: get(FRAMES).or_else(|| get(FRAMES_LEGACY)),
            format: get(FORMAT),
            dir: get(DIR),
            prefix: get(PREFIX),
            dump_renderpass: get(DUMP_RENDERPASS),
        }
    }

    /// Read the options from the process environment.
    pub fn from_process() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `(name, value)` pairs for every option that is set.
    pub fn vars(&self) -> Vec<(&'static str, &str)> {
        [
            (FRAMES, &self.frames),
            (FORMAT, &self.format),
            (DIR, &self.dir),
            (PREFIX, &self.prefix),
            (DUMP_RENDERPASS, &self.dump_renderpass),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}
