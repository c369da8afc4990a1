//! Pixel format properties
//!
//! Channel counts, texel sizes, numeric families and compatibility classes for
//! the uncompressed formats the readback pipeline knows how to handle.

use ash::vk;
use tracegrab_shared::ColorSpace;

/// Which aspects a format carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatAspect {
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

/// Formats are copy-compatible when they share a class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityClass {
    /// Color formats with the given texel size in bits
    Bits(u32),
    /// Every depth/stencil format is its own class
    DepthStencil(vk::Format),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub format: vk::Format,
    /// Bytes per texel
    pub element_size: u32,
    pub channels: u32,
    /// `None` for families outside the eight known ones (e.g. UFLOAT)
    pub family: Option<ColorSpace>,
    pub aspect: FormatAspect,
}

impl FormatInfo {
    /// Look up a format; `None` for compressed, planar or unknown formats.
    pub fn of(format: vk::Format) -> Option<FormatInfo> {
        FORMAT_TABLE
            .iter()
            .find(|(f, ..)| *f == format)
            .map(|&(format, element_size, channels, family, aspect)| FormatInfo {
                format,
                element_size,
                channels,
                family,
                aspect,
            })
    }

    pub fn compatibility_class(&self) -> CompatibilityClass {
        match self.aspect {
            FormatAspect::Color => CompatibilityClass::Bits(self.element_size * 8),
            _ => CompatibilityClass::DepthStencil(self.format),
        }
    }

    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        match self.aspect {
            FormatAspect::Color => vk::ImageAspectFlags::COLOR,
            FormatAspect::Depth => vk::ImageAspectFlags::DEPTH,
            FormatAspect::Stencil => vk::ImageAspectFlags::STENCIL,
            FormatAspect::DepthStencil => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        }
    }

    pub fn is_stencil_only(&self) -> bool {
        self.aspect == FormatAspect::Stencil
    }

    /// Families whose values are non-linear, signed or floating point.
    pub fn is_nonlinear_or_signed(&self) -> bool {
        matches!(
            self.family,
            Some(
                ColorSpace::Srgb
                    | ColorSpace::Sfloat
                    | ColorSpace::Sint
                    | ColorSpace::Sscaled
                    | ColorSpace::Snorm
            )
        )
    }

    /// Bytes in each channel of a texel.
    pub fn bytes_per_channel(&self) -> u32 {
        self.element_size / self.channels
    }
}

/// Name used in file headers and log messages.
pub fn format_name(format: vk::Format) -> String {
    format!("VK_FORMAT_{format:?}")
}

/// Format of the given family with `channels` channels.
///
/// Eight-bit variants for the integer and normalized families, sixteen-bit
/// floats for `SFLOAT`.
pub fn family_variant(family: ColorSpace, channels: u32) -> Option<vk::Format> {
    use vk::Format as F;
    let variants: [F; 4] = match family {
        ColorSpace::Unorm => [F::R8_UNORM, F::R8G8_UNORM, F::R8G8B8_UNORM, F::R8G8B8A8_UNORM],
        ColorSpace::Srgb => [F::R8_SRGB, F::R8G8_SRGB, F::R8G8B8_SRGB, F::R8G8B8A8_SRGB],
        ColorSpace::Snorm => [F::R8_SNORM, F::R8G8_SNORM, F::R8G8B8_SNORM, F::R8G8B8A8_SNORM],
        ColorSpace::Uscaled => [
            F::R8_USCALED,
            F::R8G8_USCALED,
            F::R8G8B8_USCALED,
            F::R8G8B8A8_USCALED,
        ],
        ColorSpace::Sscaled => [
            F::R8_SSCALED,
            F::R8G8_SSCALED,
            F::R8G8B8_SSCALED,
            F::R8G8B8A8_SSCALED,
        ],
        ColorSpace::Uint => [F::R8_UINT, F::R8G8_UINT, F::R8G8B8_UINT, F::R8G8B8A8_UINT],
        ColorSpace::Sint => [F::R8_SINT, F::R8G8_SINT, F::R8G8B8_SINT, F::R8G8B8A8_SINT],
        ColorSpace::Sfloat => [
            F::R16_SFLOAT,
            F::R16G16_SFLOAT,
            F::R16G16B16_SFLOAT,
            F::R16G16B16A16_SFLOAT,
        ],
    };
    match channels {
        1..=4 => Some(variants[channels as usize - 1]),
        _ => None,
    }
}

use ColorSpace::{Sfloat, Sint, Snorm, Srgb, Sscaled, Uint, Unorm, Uscaled};
use FormatAspect::{Color, Depth, DepthStencil, Stencil};

type FormatRow = (vk::Format, u32, u32, Option<ColorSpace>, FormatAspect);

#[rustfmt::skip]
const FORMAT_TABLE: &[FormatRow] = &[
    (vk::Format::R4G4_UNORM_PACK8, 1, 2, Some(Unorm), Color),
    (vk::Format::R4G4B4A4_UNORM_PACK16, 2, 4, Some(Unorm), Color),
    (vk::Format::B4G4R4A4_UNORM_PACK16, 2, 4, Some(Unorm), Color),
    (vk::Format::R5G6B5_UNORM_PACK16, 2, 3, Some(Unorm), Color),
    (vk::Format::B5G6R5_UNORM_PACK16, 2, 3, Some(Unorm), Color),
    (vk::Format::R5G5B5A1_UNORM_PACK16, 2, 4, Some(Unorm), Color),
    (vk::Format::B5G5R5A1_UNORM_PACK16, 2, 4, Some(Unorm), Color),
    (vk::Format::A1R5G5B5_UNORM_PACK16, 2, 4, Some(Unorm), Color),

    (vk::Format::R8_UNORM, 1, 1, Some(Unorm), Color),
    (vk::Format::R8_SNORM, 1, 1, Some(Snorm), Color),
    (vk::Format::R8_USCALED, 1, 1, Some(Uscaled), Color),
    (vk::Format::R8_SSCALED, 1, 1, Some(Sscaled), Color),
    (vk::Format::R8_UINT, 1, 1, Some(Uint), Color),
    (vk::Format::R8_SINT, 1, 1, Some(Sint), Color),
    (vk::Format::R8_SRGB, 1, 1, Some(Srgb), Color),

    (vk::Format::R8G8_UNORM, 2, 2, Some(Unorm), Color),
    (vk::Format::R8G8_SNORM, 2, 2, Some(Snorm), Color),
    (vk::Format::R8G8_USCALED, 2, 2, Some(Uscaled), Color),
    (vk::Format::R8G8_SSCALED, 2, 2, Some(Sscaled), Color),
    (vk::Format::R8G8_UINT, 2, 2, Some(Uint), Color),
    (vk::Format::R8G8_SINT, 2, 2, Some(Sint), Color),
    (vk::Format::R8G8_SRGB, 2, 2, Some(Srgb), Color),

    (vk::Format::R8G8B8_UNORM, 3, 3, Some(Unorm), Color),
    (vk::Format::R8G8B8_SNORM, 3, 3, Some(Snorm), Color),
    (vk::Format::R8G8B8_USCALED, 3, 3, Some(Uscaled), Color),
    (vk::Format::R8G8B8_SSCALED, 3, 3, Some(Sscaled), Color),
    (vk::Format::R8G8B8_UINT, 3, 3, Some(Uint), Color),
    (vk::Format::R8G8B8_SINT, 3, 3, Some(Sint), Color),
    (vk::Format::R8G8B8_SRGB, 3, 3, Some(Srgb), Color),
    (vk::Format::B8G8R8_UNORM, 3, 3, Some(Unorm), Color),
    (vk::Format::B8G8R8_SNORM, 3, 3, Some(Snorm), Color),
    (vk::Format::B8G8R8_USCALED, 3, 3, Some(Uscaled), Color),
    (vk::Format::B8G8R8_SSCALED, 3, 3, Some(Sscaled), Color),
    (vk::Format::B8G8R8_UINT, 3, 3, Some(Uint), Color),
    (vk::Format::B8G8R8_SINT, 3, 3, Some(Sint), Color),
    (vk::Format::B8G8R8_SRGB, 3, 3, Some(Srgb), Color),

    (vk::Format::R8G8B8A8_UNORM, 4, 4, Some(Unorm), Color),
    (vk::Format::R8G8B8A8_SNORM, 4, 4, Some(Snorm), Color),
    (vk::Format::R8G8B8A8_USCALED, 4, 4, Some(Uscaled), Color),
    (vk::Format::R8G8B8A8_SSCALED, 4, 4, Some(Sscaled), Color),
    (vk::Format::R8G8B8A8_UINT, 4, 4, Some(Uint), Color),
    (vk::Format::R8G8B8A8_SINT, 4, 4, Some(Sint), Color),
    (vk::Format::R8G8B8A8_SRGB, 4, 4, Some(Srgb), Color),
    (vk::Format::B8G8R8A8_UNORM, 4, 4, Some(Unorm), Color),
    (vk::Format::B8G8R8A8_SNORM, 4, 4, Some(Snorm), Color),
    (vk::Format::B8G8R8A8_USCALED, 4, 4, Some(Uscaled), Color),
    (vk::Format::B8G8R8A8_SSCALED, 4, 4, Some(Sscaled), Color),
    (vk::Format::B8G8R8A8_UINT, 4, 4, Some(Uint), Color),
    (vk::Format::B8G8R8A8_SINT, 4, 4, Some(Sint), Color),
    (vk::Format::B8G8R8A8_SRGB, 4, 4, Some(Srgb), Color),
    (vk::Format::A8B8G8R8_UNORM_PACK32, 4, 4, Some(Unorm), Color),
    (vk::Format::A8B8G8R8_SNORM_PACK32, 4, 4, Some(Snorm), Color),
    (vk::Format::A8B8G8R8_USCALED_PACK32, 4, 4, Some(Uscaled), Color),
    (vk::Format::A8B8G8R8_SSCALED_PACK32, 4, 4, Some(Sscaled), Color),
    (vk::Format::A8B8G8R8_UINT_PACK32, 4, 4, Some(Uint), Color),
    (vk::Format::A8B8G8R8_SINT_PACK32, 4, 4, Some(Sint), Color),
    (vk::Format::A8B8G8R8_SRGB_PACK32, 4, 4, Some(Srgb), Color),

    (vk::Format::A2R10G10B10_UNORM_PACK32, 4, 4, Some(Unorm), Color),
    (vk::Format::A2R10G10B10_SNORM_PACK32, 4, 4, Some(Snorm), Color),
    (vk::Format::A2R10G10B10_USCALED_PACK32, 4, 4, Some(Uscaled), Color),
    (vk::Format::A2R10G10B10_SSCALED_PACK32, 4, 4, Some(Sscaled), Color),
    (vk::Format::A2R10G10B10_UINT_PACK32, 4, 4, Some(Uint), Color),
    (vk::Format::A2R10G10B10_SINT_PACK32, 4, 4, Some(Sint), Color),
    (vk::Format::A2B10G10R10_UNORM_PACK32, 4, 4, Some(Unorm), Color),
    (vk::Format::A2B10G10R10_SNORM_PACK32, 4, 4, Some(Snorm), Color),
    (vk::Format::A2B10G10R10_USCALED_PACK32, 4, 4, Some(Uscaled), Color),
    (vk::Format::A2B10G10R10_SSCALED_PACK32, 4, 4, Some(Sscaled), Color),
    (vk::Format::A2B10G10R10_UINT_PACK32, 4, 4, Some(Uint), Color),
    (vk::Format::A2B10G10R10_SINT_PACK32, 4, 4, Some(Sint), Color),

    (vk::Format::R16_UNORM, 2, 1, Some(Unorm), Color),
    (vk::Format::R16_SNORM, 2, 1, Some(Snorm), Color),
    (vk::Format::R16_USCALED, 2, 1, Some(Uscaled), Color),
    (vk::Format::R16_SSCALED, 2, 1, Some(Sscaled), Color),
    (vk::Format::R16_UINT, 2, 1, Some(Uint), Color),
    (vk::Format::R16_SINT, 2, 1, Some(Sint), Color),
    (vk::Format::R16_SFLOAT, 2, 1, Some(Sfloat), Color),
    (vk::Format::R16G16_UNORM, 4, 2, Some(Unorm), Color),
    (vk::Format::R16G16_SNORM, 4, 2, Some(Snorm), Color),
    (vk::Format::R16G16_USCALED, 4, 2, Some(Uscaled), Color),
    (vk::Format::R16G16_SSCALED, 4, 2, Some(Sscaled), Color),
    (vk::Format::R16G16_UINT, 4, 2, Some(Uint), Color),
    (vk::Format::R16G16_SINT, 4, 2, Some(Sint), Color),
    (vk::Format::R16G16_SFLOAT, 4, 2, Some(Sfloat), Color),
    (vk::Format::R16G16B16_UNORM, 6, 3, Some(Unorm), Color),
    (vk::Format::R16G16B16_SNORM, 6, 3, Some(Snorm), Color),
    (vk::Format::R16G16B16_USCALED, 6, 3, Some(Uscaled), Color),
    (vk::Format::R16G16B16_SSCALED, 6, 3, Some(Sscaled), Color),
    (vk::Format::R16G16B16_UINT, 6, 3, Some(Uint), Color),
    (vk::Format::R16G16B16_SINT, 6, 3, Some(Sint), Color),
    (vk::Format::R16G16B16_SFLOAT, 6, 3, Some(Sfloat), Color),
    (vk::Format::R16G16B16A16_UNORM, 8, 4, Some(Unorm), Color),
    (vk::Format::R16G16B16A16_SNORM, 8, 4, Some(Snorm), Color),
    (vk::Format::R16G16B16A16_USCALED, 8, 4, Some(Uscaled), Color),
    (vk::Format::R16G16B16A16_SSCALED, 8, 4, Some(Sscaled), Color),
    (vk::Format::R16G16B16A16_UINT, 8, 4, Some(Uint), Color),
    (vk::Format::R16G16B16A16_SINT, 8, 4, Some(Sint), Color),
    (vk::Format::R16G16B16A16_SFLOAT, 8, 4, Some(Sfloat), Color),

    (vk::Format::R32_UINT, 4, 1, Some(Uint), Color),
    (vk::Format::R32_SINT, 4, 1, Some(Sint), Color),
    (vk::Format::R32_SFLOAT, 4, 1, Some(Sfloat), Color),
    (vk::Format::R32G32_UINT, 8, 2, Some(Uint), Color),
    (vk::Format::R32G32_SINT, 8, 2, Some(Sint), Color),
    (vk::Format::R32G32_SFLOAT, 8, 2, Some(Sfloat), Color),
    (vk::Format::R32G32B32_UINT, 12, 3, Some(Uint), Color),
    (vk::Format::R32G32B32_SINT, 12, 3, Some(Sint), Color),
    (vk::Format::R32G32B32_SFLOAT, 12, 3, Some(Sfloat), Color),
    (vk::Format::R32G32B32A32_UINT, 16, 4, Some(Uint), Color),
    (vk::Format::R32G32B32A32_SINT, 16, 4, Some(Sint), Color),
    (vk::Format::R32G32B32A32_SFLOAT, 16, 4, Some(Sfloat), Color),

    (vk::Format::R64_UINT, 8, 1, Some(Uint), Color),
    (vk::Format::R64_SINT, 8, 1, Some(Sint), Color),
    (vk::Format::R64_SFLOAT, 8, 1, Some(Sfloat), Color),
    (vk::Format::R64G64_UINT, 16, 2, Some(Uint), Color),
    (vk::Format::R64G64_SINT, 16, 2, Some(Sint), Color),
    (vk::Format::R64G64_SFLOAT, 16, 2, Some(Sfloat), Color),
    (vk::Format::R64G64B64_UINT, 24, 3, Some(Uint), Color),
    (vk::Format::R64G64B64_SINT, 24, 3, Some(Sint), Color),
    (vk::Format::R64G64B64_SFLOAT, 24, 3, Some(Sfloat), Color),
    (vk::Format::R64G64B64A64_UINT, 32, 4, Some(Uint), Color),
    (vk::Format::R64G64B64A64_SINT, 32, 4, Some(Sint), Color),
    (vk::Format::R64G64B64A64_SFLOAT, 32, 4, Some(Sfloat), Color),

    (vk::Format::B10G11R11_UFLOAT_PACK32, 4, 3, None, Color),
    (vk::Format::E5B9G9R9_UFLOAT_PACK32, 4, 3, None, Color),

    (vk::Format::D16_UNORM, 2, 1, Some(Unorm), Depth),
    (vk::Format::X8_D24_UNORM_PACK32, 4, 1, Some(Unorm), Depth),
    (vk::Format::D32_SFLOAT, 4, 1, Some(Sfloat), Depth),
    (vk::Format::S8_UINT, 1, 1, Some(Uint), Stencil),
    (vk::Format::D16_UNORM_S8_UINT, 3, 2, None, DepthStencil),
    (vk::Format::D24_UNORM_S8_UINT, 4, 2, None, DepthStencil),
    (vk::Format::D32_SFLOAT_S8_UINT, 8, 2, None, DepthStencil),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_formats() {
        let bgra = FormatInfo::of(vk::Format::B8G8R8A8_SRGB).unwrap();
        assert_eq!(bgra.element_size, 4);
        assert_eq!(bgra.channels, 4);
        assert_eq!(bgra.family, Some(ColorSpace::Srgb));
        assert_eq!(bgra.compatibility_class(), CompatibilityClass::Bits(32));
        assert!(bgra.is_nonlinear_or_signed());

        let rgba = FormatInfo::of(vk::Format::R8G8B8A8_UNORM).unwrap();
        assert_eq!(rgba.compatibility_class(), bgra.compatibility_class());
        assert!(!rgba.is_nonlinear_or_signed());
    }

    #[test]
    fn test_depth_stencil_classes_are_distinct() {
        let d24s8 = FormatInfo::of(vk::Format::D24_UNORM_S8_UINT).unwrap();
        let rgba = FormatInfo::of(vk::Format::R8G8B8A8_UNORM).unwrap();
        assert_ne!(d24s8.compatibility_class(), rgba.compatibility_class());
        assert_eq!(
            d24s8.aspect_mask(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(FormatInfo::of(vk::Format::S8_UINT).unwrap().is_stencil_only());
    }

    #[test]
    fn test_family_variants() {
        assert_eq!(
            family_variant(ColorSpace::Sfloat, 4),
            Some(vk::Format::R16G16B16A16_SFLOAT)
        );
        assert_eq!(family_variant(ColorSpace::Uint, 2), Some(vk::Format::R8G8_UINT));
        assert_eq!(family_variant(ColorSpace::Unorm, 0), None);
        assert_eq!(family_variant(ColorSpace::Unorm, 5), None);
    }

    #[test]
    fn test_unknown_formats() {
        assert!(FormatInfo::of(vk::Format::BC1_RGB_UNORM_BLOCK).is_none());
        assert!(FormatInfo::of(vk::Format::UNDEFINED).is_none());
    }

    #[test]
    fn test_format_name() {
        assert_eq!(format_name(vk::Format::R8G8B8A8_UNORM), "VK_FORMAT_R8G8B8A8_UNORM");
    }
}
