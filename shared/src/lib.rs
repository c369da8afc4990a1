//! Shared types for the tracegrab replayer and screenshot layer.
//!
//! Both sides agree on how screenshot frame selections and color-space
//! overrides are spelled, and on the environment variables the replayer
//! exports for the layer to pick up.

pub mod color_space;
pub mod env;
pub mod frame_range;

pub use color_space::{ColorSpace, ColorSpaceOverride, UnknownColorSpace};
pub use env::ScreenshotEnv;
pub use frame_range::{FrameCount, FrameRange, FrameRangeError, FrameSelection, RangeCheck};
