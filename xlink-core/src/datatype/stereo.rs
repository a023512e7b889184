//! Stereo depth runtime configuration.
//!
//! Field names follow the device's JSON keys (camelCase). Every level is
//! `#[serde(default)]`, so partial blobs fill in the defaults below.

use serde::{Deserialize, Serialize};

use super::{DatatypeEnum, RawMessage};
use crate::error::{Result, XLinkError};

pub const DEFAULT_PENALTY_P1: u16 = 250;
pub const DEFAULT_PENALTY_P2: u16 = 500;

int_enum!(
    /// Kernel of the disparity median filter.
    MedianFilter: i32 = Kernel5x5 {
        MedianOff = 0,
        Kernel3x3 = 3,
        Kernel5x5 = 5,
        Kernel7x7 = 7,
    }
);

int_enum!(
    /// Census transform window.
    CensusKernelSize: i32 = Auto {
        Auto = -1,
        Kernel5x5 = 0,
        Kernel7x7 = 1,
        Kernel7x9 = 2,
    }
);

int_enum!(
    /// Disparity search range supported by the matcher.
    DisparityWidth: u32 = Disparity96 {
        Disparity64 = 0,
        Disparity96 = 1,
    }
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlgorithmControl {
    /// Combine L-R and R-L disparities for better occlusion handling.
    pub enable_left_right_check: bool,
    /// Double the disparity range for close objects.
    pub enable_extended: bool,
    pub enable_subpixel: bool,
    /// Maximum confidence difference between the L-R and R-L maps, 0..=128.
    pub left_right_check_threshold: i32,
    /// Fractional disparity bits in subpixel mode: 3, 4 or 5.
    pub subpixel_fractional_bits: i32,
}

impl Default for AlgorithmControl {
    fn default() -> Self {
        Self {
            enable_left_right_check: true,
            enable_extended: false,
            enable_subpixel: false,
            left_right_check_threshold: 10,
            subpixel_fractional_bits: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostProcessing {
    pub median: MedianFilter,
    /// Bilateral filter sigma. Zero disables the filter.
    pub bilateral_sigma_value: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CensusTransform {
    pub kernel_size: CensusKernelSize,
    /// Zero picks a mask from the resolution and kernel size.
    pub kernel_mask: u64,
    /// Compare against the window mean instead of the central pixel.
    pub enable_mean_mode: bool,
    pub threshold: u32,
}

impl Default for CensusTransform {
    fn default() -> Self {
        Self {
            kernel_size: CensusKernelSize::Auto,
            kernel_mask: 0,
            enable_mean_mode: true,
            threshold: 0,
        }
    }
}

/// `COMB_COST = alpha * AD + beta * (CTC << 3)`, clamped to `threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearEquationParameters {
    pub alpha: u8,
    pub beta: u8,
    pub threshold: u8,
}

impl Default for LinearEquationParameters {
    fn default() -> Self {
        Self {
            alpha: 0,
            beta: 2,
            threshold: 127,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostMatching {
    pub disparity_width: DisparityWidth,
    /// Sparse matching of far disparities; affects depth only.
    pub enable_companding: bool,
    pub invalid_disparity_value: u8,
    /// Disparities with a confidence below this value are accepted.
    pub confidence_threshold: u8,
    pub linear_equation_parameters: LinearEquationParameters,
}

impl Default for CostMatching {
    fn default() -> Self {
        Self {
            disparity_width: DisparityWidth::Disparity96,
            enable_companding: false,
            invalid_disparity_value: 0,
            confidence_threshold: 245,
            linear_equation_parameters: LinearEquationParameters::default(),
        }
    }
}

/// Semi-global cost aggregation penalties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostAggregation {
    pub division_factor: u8,
    pub horizontal_penalty_cost_p1: u16,
    pub horizontal_penalty_cost_p2: u16,
    pub vertical_penalty_cost_p1: u16,
    pub vertical_penalty_cost_p2: u16,
}

impl Default for CostAggregation {
    fn default() -> Self {
        Self {
            division_factor: 1,
            horizontal_penalty_cost_p1: DEFAULT_PENALTY_P1,
            horizontal_penalty_cost_p2: DEFAULT_PENALTY_P2,
            vertical_penalty_cost_p1: DEFAULT_PENALTY_P1,
            vertical_penalty_cost_p2: DEFAULT_PENALTY_P2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawStereoDepthConfig {
    pub algorithm_control: AlgorithmControl,
    pub post_processing: PostProcessing,
    pub census_transform: CensusTransform,
    pub cost_matching: CostMatching,
    pub cost_aggregation: CostAggregation,
}

fn invalid(msg: String) -> XLinkError {
    XLinkError::Encoding(msg)
}

impl RawMessage for RawStereoDepthConfig {
    const DATATYPE: DatatypeEnum = DatatypeEnum::StereoDepthConfig;

    /// Check the ranges the device enforces.
    fn validate(&self) -> Result<()> {
        let algo = &self.algorithm_control;
        if !(0..=128).contains(&algo.left_right_check_threshold) {
            return Err(invalid(format!(
                "left-right check threshold {} outside 0..=128",
                algo.left_right_check_threshold
            )));
        }
        if !(3..=5).contains(&algo.subpixel_fractional_bits) {
            return Err(invalid(format!(
                "subpixel fractional bits {} not in 3, 4, 5",
                algo.subpixel_fractional_bits
            )));
        }
        if self.post_processing.bilateral_sigma_value < 0 {
            return Err(invalid(format!(
                "negative bilateral sigma {}",
                self.post_processing.bilateral_sigma_value
            )));
        }
        Ok(())
    }
}

impl RawStereoDepthConfig {
    /// Decode a JSON blob and validate it.
    pub fn from_json(blob: &[u8]) -> Result<Self> {
        let cfg: Self = serde_json::from_slice(blob)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_left_right_check(mut self, enable: bool) -> Self {
        self.algorithm_control.enable_left_right_check = enable;
        self
    }

    pub fn with_left_right_check_threshold(mut self, threshold: i32) -> Result<Self> {
        self.algorithm_control.left_right_check_threshold = threshold;
        self.validate()?;
        Ok(self)
    }

    pub fn with_subpixel(mut self, enable: bool) -> Self {
        self.algorithm_control.enable_subpixel = enable;
        self
    }

    pub fn with_subpixel_fractional_bits(mut self, bits: i32) -> Result<Self> {
        self.algorithm_control.subpixel_fractional_bits = bits;
        self.validate()?;
        Ok(self)
    }

    pub fn with_extended_disparity(mut self, enable: bool) -> Self {
        self.algorithm_control.enable_extended = enable;
        self
    }

    pub fn with_median_filter(mut self, median: MedianFilter) -> Self {
        self.post_processing.median = median;
        self
    }

    pub fn with_bilateral_sigma(mut self, sigma: i16) -> Result<Self> {
        self.post_processing.bilateral_sigma_value = sigma;
        self.validate()?;
        Ok(self)
    }

    pub fn with_confidence_threshold(mut self, threshold: u8) -> Self {
        self.cost_matching.confidence_threshold = threshold;
        self
    }

    /// Maximum disparity the current settings produce.
    pub fn max_disparity(&self) -> f32 {
        let mut max = match self.cost_matching.disparity_width {
            DisparityWidth::Disparity64 => 63.0,
            DisparityWidth::Disparity96 => 95.0,
        };
        if self.algorithm_control.enable_extended {
            max *= 2.0;
        }
        if self.algorithm_control.enable_subpixel {
            max *= (1 << self.algorithm_control.subpixel_fractional_bits) as f32;
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::StreamMessage;
    use bytes::Bytes;

    #[test]
    fn defaults() {
        let cfg = RawStereoDepthConfig::default();
        assert_eq!(cfg.post_processing.median, MedianFilter::Kernel5x5);
        assert_eq!(cfg.cost_matching.confidence_threshold, 245);
        assert_eq!(cfg.algorithm_control.left_right_check_threshold, 10);
        assert_eq!(cfg.algorithm_control.subpixel_fractional_bits, 3);
        assert_eq!(cfg.cost_aggregation.horizontal_penalty_cost_p1, 250);
        assert_eq!(cfg.cost_aggregation.vertical_penalty_cost_p2, 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn setters_validate() {
        let cfg = RawStereoDepthConfig::default();
        assert!(cfg.clone().with_left_right_check_threshold(129).is_err());
        assert!(cfg.clone().with_left_right_check_threshold(-1).is_err());
        assert!(cfg.clone().with_subpixel_fractional_bits(6).is_err());
        assert!(cfg.clone().with_bilateral_sigma(-3).is_err());

        let tuned = cfg
            .with_subpixel(true)
            .with_subpixel_fractional_bits(5)
            .unwrap()
            .with_median_filter(MedianFilter::MedianOff)
            .with_confidence_threshold(200);
        assert_eq!(tuned.algorithm_control.subpixel_fractional_bits, 5);
        assert_eq!(tuned.max_disparity(), 95.0 * 32.0);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = RawStereoDepthConfig::from_json(
            br#"{"postProcessing": {"median": 7}, "costMatching": {"disparityWidth": 0}, "newKey": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.post_processing.median, MedianFilter::Kernel7x7);
        assert_eq!(cfg.cost_matching.disparity_width, DisparityWidth::Disparity64);
        assert_eq!(cfg.cost_matching.confidence_threshold, 245);
        assert!(cfg.census_transform.enable_mean_mode);
    }

    #[test]
    fn out_of_range_blobs_are_rejected() {
        assert!(RawStereoDepthConfig::from_json(br#"{"postProcessing": {"median": 4}}"#).is_err());
        assert!(
            RawStereoDepthConfig::from_json(br#"{"algorithmControl": {"subpixelFractionalBits": 2}}"#)
                .is_err()
        );
    }

    #[test]
    fn travels_as_message() {
        let cfg = RawStereoDepthConfig::default().with_extended_disparity(true);
        let msg = cfg.to_message(Vec::new()).unwrap();
        assert_eq!(msg.datatype, DatatypeEnum::StereoDepthConfig);
        let back: RawStereoDepthConfig = msg.decode().unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn invalid_config_is_rejected_off_the_wire() {
        let msg = StreamMessage {
            datatype: DatatypeEnum::StereoDepthConfig,
            data: Bytes::new(),
            metadata: Bytes::from_static(
                br#"{"algorithmControl":{"subpixelFractionalBits":9,"leftRightCheckThreshold":500}}"#,
            ),
        };
        let parsed = StreamMessage::parse(msg.serialize()).unwrap();
        assert!(matches!(
            parsed.decode::<RawStereoDepthConfig>(),
            Err(XLinkError::Encoding(_))
        ));
    }
}
