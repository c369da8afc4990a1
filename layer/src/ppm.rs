//! PPM file emitter
//!
//! Writes a captured image as a binary P6 portable pixmap, rescaling every
//! channel to eight bits. Captures whose destination format could not be
//! reconciled are written as raw texels behind a comment-only header.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ash::vk;

use crate::format::{format_name, FormatInfo};
use crate::readback::{CaptureError, CaptureHandle, ReadbackDevice};

/// Largest texel the raw writer accepts
pub const MAX_RAW_ELEMENT_SIZE: u32 = 8;

/// Where the pixels sit in mapped memory and how to interpret them
#[derive(Debug, Clone, Copy)]
pub struct PixelLayout {
    pub width: u32,
    pub height: u32,
    pub offset: u64,
    pub row_pitch: u64,
    pub source: FormatInfo,
    pub destination: FormatInfo,
    /// False selects the raw writer
    pub color_conversion: bool,
}

impl PixelLayout {
    /// Bytes from the start of the mapping to the end of the last texel.
    fn required_len(&self) -> u64 {
        if self.width == 0 || self.height == 0 {
            return 0;
        }
        self.offset
            + (u64::from(self.height) - 1) * self.row_pitch
            + u64::from(self.width) * u64::from(self.destination.element_size)
    }

    fn rows<'a>(&self, pixels: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        let row_len = self.width as usize * self.destination.element_size as usize;
        let (offset, pitch) = (self.offset as usize, self.row_pitch as usize);
        (0..self.height as usize).map(move |y| {
            let start = offset + y * pitch;
            &pixels[start..start + row_len]
        })
    }
}

fn write_format_comments<W: Write>(out: &mut W, layout: &PixelLayout) -> std::io::Result<()> {
    writeln!(out, "# format: {}", describe(layout.destination.format))?;
    writeln!(out, "# srcFormat: {}", describe(layout.source.format))?;
    writeln!(out, "# rowPitch: {}", layout.row_pitch)
}

/// Encode `pixels` (the mapped image) into `out`.
pub fn encode<W: Write>(out: &mut W, layout: &PixelLayout, pixels: &[u8]) -> Result<(), CaptureError> {
    let needed = layout.required_len();
    if needed > pixels.len() as u64 {
        return Err(CaptureError::Layout {
            needed,
            mapped: pixels.len() as u64,
        });
    }
    if layout.color_conversion {
        encode_pixmap(out, layout, pixels)
    } else {
        encode_raw(out, layout, pixels)
    }
}

fn encode_pixmap<W: Write>(out: &mut W, layout: &PixelLayout, pixels: &[u8]) -> Result<(), CaptureError> {
    let destination = &layout.destination;
    let bytes_per_channel = destination.bytes_per_channel() as usize;
    if !(1..=8).contains(&bytes_per_channel) {
        return Err(CaptureError::UnsupportedElementSize(destination.element_size));
    }
    let max_value: u128 = (1u128 << (8 * bytes_per_channel)) - 1;
    // Channels beyond what the source carries are padding added by the blit
    let channels = layout.source.channels.min(destination.channels) as usize;

    writeln!(out, "P6")?;
    write_format_comments(out, layout)?;
    writeln!(out, "{}\n{}\n255", layout.width, layout.height)?;

    let element = destination.element_size as usize;
    let mut line = Vec::with_capacity(layout.width as usize * 3);
    for row in layout.rows(pixels) {
        line.clear();
        for texel in row.chunks_exact(element) {
            for channel in 0..3 {
                if channel >= channels {
                    line.push(0);
                    continue;
                }
                let start = channel * bytes_per_channel;
                let value = texel[start..start + bytes_per_channel]
                    .iter()
                    .rev()
                    .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte));
                line.push((value * 255 / max_value) as u8);
            }
        }
        out.write_all(&line)?;
    }
    Ok(())
}

fn encode_raw<W: Write>(out: &mut W, layout: &PixelLayout, pixels: &[u8]) -> Result<(), CaptureError> {
    let element_size = layout.destination.element_size;
    if element_size > MAX_RAW_ELEMENT_SIZE {
        return Err(CaptureError::UnsupportedElementSize(element_size));
    }
    write_format_comments(out, layout)?;
    writeln!(out, "# width: {}", layout.width)?;
    writeln!(out, "# height: {}", layout.height)?;
    for row in layout.rows(pixels) {
        out.write_all(row)?;
    }
    Ok(())
}

/// Final file name for a capture requested at `path`.
///
/// Images that are not swapchain images get
/// `_<srcFormat>_<dstFormat>_<width>_<height>` before the extension.
pub fn output_path(path: &Path, handle: &CaptureHandle) -> PathBuf {
    let source = handle.source();
    if source.is_swapchain_image {
        return path.to_path_buf();
    }
    let mut name = path.file_stem().map(|stem| stem.to_os_string()).unwrap_or_default();
    name.push(format!(
        "_{}_{}_{}_{}.ppm",
        source.format.as_raw(),
        handle.plan().destination.format.as_raw(),
        source.extent.width,
        source.extent.height
    ));
    path.with_file_name(name)
}

/// Write the capture to disk and release it, on success and failure alike.
///
/// Returns the path actually written.
pub fn emit<D: ReadbackDevice>(device: &D, path: &Path, handle: CaptureHandle) -> Result<PathBuf, CaptureError> {
    let result = write_capture(device, path, &handle);
    handle.release(device);
    result
}

fn write_capture<D: ReadbackDevice>(
    device: &D,
    path: &Path,
    handle: &CaptureHandle,
) -> Result<PathBuf, CaptureError> {
    let plan = handle.plan();
    let source = handle.source();
    let path = output_path(path, handle);

    let subresource = device.subresource_layout(handle.output_image(), plan.destination.aspect_mask());
    let layout = PixelLayout {
        width: source.extent.width,
        height: source.extent.height,
        offset: subresource.offset,
        row_pitch: subresource.row_pitch,
        source: plan.source,
        destination: plan.destination,
        color_conversion: plan.color_conversion,
    };
    if !layout.color_conversion && layout.destination.element_size > MAX_RAW_ELEMENT_SIZE {
        return Err(CaptureError::UnsupportedElementSize(layout.destination.element_size));
    }

    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);
    device
        .read_memory(handle.output_memory(), handle.output_size(), |pixels| {
            encode(&mut writer, &layout, pixels)
        })
        .map_err(|result| CaptureError::Vulkan {
            call: "vkMapMemory",
            result,
        })??;
    writer.flush()?;

    tracing::info!("Screenshot saved: {}", path.display());
    Ok(path)
}

/// Numeric value and name of a format, as written in headers.
pub fn describe(format: vk::Format) -> String {
    format!("{} {}", format.as_raw(), format_name(format))
}
