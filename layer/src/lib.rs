//! Vulkan screenshot layer
//!
//! Sits between an application (usually the trace replayer) and the driver,
//! mirrors the objects needed to find a presented or rendered image, and
//! writes selected frames to PPM files. Capture failures are logged and never
//! change what the application sees from the driver.
//!
//! Configuration comes from the `VK_SCREENSHOT_*` environment variables, read
//! once when the first instance is created.

pub mod config;
pub mod dispatch;
pub mod format;
pub mod hooks;
pub mod ppm;
pub mod readback;
pub mod session;
pub mod shadow;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{LayerConfig, RenderPassDump};
pub use format::{FormatAspect, FormatInfo};
pub use readback::{CaptureError, CaptureHandle, CommandContext, ReadbackDevice, ReadbackPath};
pub use session::SessionState;
pub use shadow::{Lookup, ShadowTable};
