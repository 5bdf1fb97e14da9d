use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Length of each 1-D filter the network predicts per output pixel.
pub const FILTER_LENGTH: usize = 51;

/// Colour channels per frame fed to the network.
pub const IMAGE_DEPTH: usize = 3;

/// Square network input size. Each tier ships its own exported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ResolutionTier {
    X128,
    #[default]
    X256,
    X512,
    X1024,
}

impl ResolutionTier {
    pub const ALL: [ResolutionTier; 4] = [
        ResolutionTier::X128,
        ResolutionTier::X256,
        ResolutionTier::X512,
        ResolutionTier::X1024,
    ];

    pub fn side(self) -> usize {
        match self {
            ResolutionTier::X128 => 128,
            ResolutionTier::X256 => 256,
            ResolutionTier::X512 => 512,
            ResolutionTier::X1024 => 1024,
        }
    }

    /// Largest frame side the tier accepts before frames must be downscaled.
    pub fn max_image_side(self) -> usize {
        self.side().saturating_sub(FILTER_LENGTH)
    }

    pub fn label(self) -> String {
        format!("{0}x{0}", self.side())
    }

    pub fn from_side(side: u32) -> Result<Self> {
        match side {
            128 => Ok(ResolutionTier::X128),
            256 => Ok(ResolutionTier::X256),
            512 => Ok(ResolutionTier::X512),
            1024 => Ok(ResolutionTier::X1024),
            other => bail!("unsupported resolution tier {other} (expected 128, 256, 512 or 1024)"),
        }
    }

    /// File name of the exported network for this tier.
    pub fn model_file_name(self) -> String {
        format!("SepConvPartialNetwork{}.onnx", self.side())
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for ResolutionTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let side = trimmed
            .split_once(['x', 'X'])
            .map(|(w, _)| w)
            .unwrap_or(trimmed);
        match side.parse::<u32>() {
            Ok(value) => Self::from_side(value),
            Err(_) => bail!("invalid resolution tier '{s}'"),
        }
    }
}

impl TryFrom<u32> for ResolutionTier {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::from_side(value)
    }
}

impl From<ResolutionTier> for u32 {
    fn from(tier: ResolutionTier) -> u32 {
        tier.side() as u32
    }
}

/// Tensor extents the convolution engine works with for one network side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionGeometry {
    /// Square network input side `S`.
    pub network_side: usize,
    pub filter_length: usize,
    pub depth: usize,
}

impl ConvolutionGeometry {
    pub fn new(network_side: usize, filter_length: usize, depth: usize) -> Result<Self> {
        ensure!(depth > 0, "image depth must be positive");
        ensure!(filter_length > 0, "filter length must be positive");
        ensure!(
            network_side > filter_length,
            "network side {network_side} leaves no usable image area for filter length {filter_length}"
        );
        Ok(Self {
            network_side,
            filter_length,
            depth,
        })
    }

    pub fn for_tier(tier: ResolutionTier) -> Result<Self> {
        Self::new(tier.side(), FILTER_LENGTH, IMAGE_DEPTH)
    }

    pub fn max_image_side(&self) -> usize {
        self.network_side - self.filter_length
    }

    /// Side of the convolution input crop, `S + L - 1`.
    pub fn input_side(&self) -> usize {
        self.network_side + self.filter_length - 1
    }

    pub fn input_shape(&self) -> [usize; 5] {
        let side = self.input_side();
        [1, 1, self.depth, side, side]
    }

    pub fn kernel_shape(&self) -> [usize; 5] {
        [1, 1, self.filter_length, self.network_side, self.network_side]
    }

    pub fn output_shape(&self) -> [usize; 5] {
        [1, 1, self.depth, self.network_side, self.network_side]
    }

    pub fn stacked_shape(&self) -> [usize; 5] {
        [1, 1, 2 * self.depth, self.network_side, self.network_side]
    }

    pub fn input_len(&self) -> usize {
        self.input_shape().iter().product()
    }

    pub fn kernel_len(&self) -> usize {
        self.kernel_shape().iter().product()
    }

    pub fn output_len(&self) -> usize {
        self.output_shape().iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_image_side_per_tier() {
        let sides: Vec<_> = ResolutionTier::ALL
            .iter()
            .map(|t| t.max_image_side())
            .collect();
        assert_eq!(sides, vec![77, 205, 461, 973]);
    }

    #[test]
    fn test_parse_accepts_side_and_label() {
        assert_eq!("512".parse::<ResolutionTier>().unwrap(), ResolutionTier::X512);
        assert_eq!(
            "1024x1024".parse::<ResolutionTier>().unwrap(),
            ResolutionTier::X1024
        );
        assert!("300".parse::<ResolutionTier>().is_err());
        assert!("big".parse::<ResolutionTier>().is_err());
    }

    #[test]
    fn test_geometry_shapes_for_256() {
        let g = ConvolutionGeometry::for_tier(ResolutionTier::X256).unwrap();
        assert_eq!(g.input_shape(), [1, 1, 3, 306, 306]);
        assert_eq!(g.kernel_shape(), [1, 1, 51, 256, 256]);
        assert_eq!(g.output_shape(), [1, 1, 3, 256, 256]);
        assert_eq!(g.stacked_shape(), [1, 1, 6, 256, 256]);
    }

    #[test]
    fn test_geometry_rejects_side_not_above_filter() {
        assert!(ConvolutionGeometry::new(51, 51, 3).is_err());
        assert!(ConvolutionGeometry::new(40, 51, 3).is_err());
        assert!(ConvolutionGeometry::new(52, 51, 3).is_ok());
    }

    #[test]
    fn test_model_file_name() {
        assert_eq!(
            ResolutionTier::X128.model_file_name(),
            "SepConvPartialNetwork128.onnx"
        );
    }
}
