//! Filter worker.
//!
//! The blur kernel itself is the `image` crate's Gaussian blur; this module only
//! guarantees the contract the pipeline relies on: output dimensions equal input
//! dimensions, channel depth is unchanged, and empty strips pass straight through.

use crate::error::{StripError, StripResult};
use crate::raster::{Image, Strip};
use serde::{Deserialize, Serialize};

/// Default Gaussian spread.
pub const DEFAULT_SIGMA: f32 = 2.0;

/// Which transform workers apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Gaussian blur with the configured sigma.
    Gaussian,
    /// Return pixels unchanged (verification runs).
    Identity,
}

impl FilterKind {
    /// Name used on the worker command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Gaussian => "gaussian",
            FilterKind::Identity => "identity",
        }
    }
}

/// Fully parameterised filter, cheap to copy into every worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSpec {
    /// Transform to apply.
    pub kind: FilterKind,
    /// Gaussian spread; ignored by the identity filter.
    pub sigma: f32,
}

impl FilterSpec {
    /// Gaussian blur with the given sigma.
    pub fn gaussian(sigma: f32) -> Self {
        Self {
            kind: FilterKind::Gaussian,
            sigma,
        }
    }

    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            kind: FilterKind::Identity,
            sigma: DEFAULT_SIGMA,
        }
    }

    /// Command-line arguments that make a worker process apply this filter.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--filter".to_string(),
            self.kind.as_str().to_string(),
            "--sigma".to_string(),
            self.sigma.to_string(),
        ]
    }

    /// Apply the filter to one image.
    pub fn apply(&self, image: &Image) -> StripResult<Image> {
        if image.shape().is_empty() {
            return Ok(image.clone());
        }
        match self.kind {
            FilterKind::Identity => Ok(image.clone()),
            FilterKind::Gaussian => gaussian_blur(image, self.sigma),
        }
    }
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self::gaussian(DEFAULT_SIGMA)
    }
}

/// Apply `filter` to a strip, keeping its index and offset.
pub fn apply_filter(filter: &FilterSpec, strip: &Strip) -> StripResult<Strip> {
    let image = filter.apply(&strip.image)?;
    if image.shape() != strip.shape() {
        return Err(StripError::ShapeMismatch(format!(
            "filter changed strip {} from {} to {}",
            strip.index,
            strip.shape(),
            image.shape()
        )));
    }
    Ok(strip.with_image(image))
}

fn gaussian_blur(image: &Image, sigma: f32) -> StripResult<Image> {
    let rgb = image::RgbImage::from_raw(image.width(), image.height(), image.as_bytes().to_vec())
        .ok_or_else(|| {
            StripError::ShapeMismatch(format!("cannot view {} as an RGB buffer", image.shape()))
        })?;
    let blurred = image::imageops::blur(&rgb, sigma);
    Image::new(blurred.width(), blurred.height(), blurred.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::gradient;

    #[test]
    fn blur_keeps_dimensions() {
        let strip = Strip::new(1, 10, gradient(12, 9));
        let out = apply_filter(&FilterSpec::default(), &strip).unwrap();
        assert_eq!(out.shape(), strip.shape());
        assert_eq!(out.index, 1);
        assert_eq!(out.offset_x, 10);
        assert_ne!(out.image, strip.image);
    }

    #[test]
    fn blur_is_deterministic() {
        let image = gradient(16, 8);
        let filter = FilterSpec::gaussian(1.5);
        assert_eq!(filter.apply(&image).unwrap(), filter.apply(&image).unwrap());
    }

    #[test]
    fn zero_width_strip_passes_through() {
        let strip = Strip::new(0, 0, Image::blank(0, 5));
        let out = apply_filter(&FilterSpec::default(), &strip).unwrap();
        assert_eq!(out.width(), 0);
        assert_eq!(out.height(), 5);
        assert!(out.image.as_bytes().is_empty());
    }

    #[test]
    fn identity_returns_input() {
        let image = gradient(5, 5);
        assert_eq!(FilterSpec::identity().apply(&image).unwrap(), image);
    }

    #[test]
    fn worker_args_round_trip_through_names() {
        let args = FilterSpec::gaussian(2.5).to_args();
        assert_eq!(args, vec!["--filter", "gaussian", "--sigma", "2.5"]);
    }
}
