//! Color-space family override for captured images

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric encoding family of a pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    Unorm,
    Srgb,
    Snorm,
    Uscaled,
    Sscaled,
    Uint,
    Sint,
    Sfloat,
}

impl ColorSpace {
    pub const ALL: [ColorSpace; 8] = [
        ColorSpace::Unorm,
        ColorSpace::Srgb,
        ColorSpace::Snorm,
        ColorSpace::Uscaled,
        ColorSpace::Sscaled,
        ColorSpace::Uint,
        ColorSpace::Sint,
        ColorSpace::Sfloat,
    ];

    /// Upper-case name as accepted in `VK_SCREENSHOT_FORMAT`
    pub fn name(self) -> &'static str {
        match self {
            ColorSpace::Unorm => "UNORM",
            ColorSpace::Srgb => "SRGB",
            ColorSpace::Snorm => "SNORM",
            ColorSpace::Uscaled => "USCALED",
            ColorSpace::Sscaled => "SSCALED",
            ColorSpace::Uint => "UINT",
            ColorSpace::Sint => "SINT",
            ColorSpace::Sfloat => "SFLOAT",
        }
    }
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested destination family for captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpaceOverride {
    /// Mirror the source image's own family
    #[default]
    Swapchain,
    Family(ColorSpace),
}

/// Name that is neither a family nor `USE_SWAPCHAIN_COLORSPACE`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "format '{0}' is not one of UNORM, SNORM, USCALED, SSCALED, UINT, SINT, SRGB, SFLOAT; \
     the swapchain colorspace will be used instead"
)]
pub struct UnknownColorSpace(pub String);

impl ColorSpaceOverride {
    pub const SWAPCHAIN_NAME: &'static str = "USE_SWAPCHAIN_COLORSPACE";

    /// Parse leniently: unknown names yield the swapchain colorspace and the error
    /// so the caller can warn once.
    pub fn parse_or_swapchain(value: &str) -> (Self, Option<UnknownColorSpace>) {
        match value.parse() {
            Ok(parsed) => (parsed, None),
            Err(err) => (ColorSpaceOverride::Swapchain, Some(err)),
        }
    }
}

impl FromStr for ColorSpaceOverride {
    type Err = UnknownColorSpace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == Self::SWAPCHAIN_NAME {
            return Ok(ColorSpaceOverride::Swapchain);
        }
        ColorSpace::ALL
            .into_iter()
            .find(|family| family.name() == s)
            .map(ColorSpaceOverride::Family)
            .ok_or_else(|| UnknownColorSpace(s.to_string()))
    }
}

impl fmt::Display for ColorSpaceOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorSpaceOverride::Swapchain => f.write_str(Self::SWAPCHAIN_NAME),
            ColorSpaceOverride::Family(family) => family.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_families() {
        for family in ColorSpace::ALL {
            assert_eq!(
                family.name().parse::<ColorSpaceOverride>(),
                Ok(ColorSpaceOverride::Family(family))
            );
        }
        assert_eq!(
            "USE_SWAPCHAIN_COLORSPACE".parse::<ColorSpaceOverride>(),
            Ok(ColorSpaceOverride::Swapchain)
        );
    }

    #[test]
    fn test_unknown_falls_back_to_swapchain() {
        let (parsed, err) = ColorSpaceOverride::parse_or_swapchain("BGRA");
        assert_eq!(parsed, ColorSpaceOverride::Swapchain);
        assert_eq!(err, Some(UnknownColorSpace("BGRA".into())));

        let (parsed, err) = ColorSpaceOverride::parse_or_swapchain("SRGB");
        assert_eq!(parsed, ColorSpaceOverride::Family(ColorSpace::Srgb));
        assert!(err.is_none());
    }

    #[test]
    fn test_names_are_case_sensitive() {
        assert!("unorm".parse::<ColorSpaceOverride>().is_err());
    }
}
