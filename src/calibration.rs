//! Calibration state and update payloads
//!
//! The calibration UI posts four corner points in its own coordinate space
//! (presentation space, normally the full camera resolution) together with
//! the segment counts. Accepted points are rescaled to the working resolution
//! and stored as a fresh [`AmbilightConfig`]; nothing is ever patched in place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color::AveragingPolicy;
use crate::config::{Config, Point};
use crate::geometry::{compute_windows, grid_points, DepthPolicy, EdgeWindows, SegmentCounts};

/// Upper bound for either segment count accepted from a request
pub const MAX_SEGMENTS: i64 = 256;

/// Why a calibration payload was rejected
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Need 4 points, got {0}")]
    PointCount(usize),

    #[error("Point {0} has a non-finite coordinate")]
    NonFinite(usize),

    #[error("{axis} segment count {value} out of range 1..={}", MAX_SEGMENTS)]
    SegmentCount { axis: &'static str, value: i64 },

    #[error("Depth must be a positive number of pixels, got {0}")]
    Depth(f64),
}

/// Raw update payload: `{ points: [{x,y} x4], hSeg, vSeg, depth? }`
#[derive(Debug, Deserialize)]
pub struct CalibrationRequest {
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(rename = "hSeg")]
    pub h_seg: i64,
    #[serde(rename = "vSeg")]
    pub v_seg: i64,
    /// Fixed window depth in working pixels; absent keeps the configured policy
    #[serde(default)]
    pub depth: Option<f64>,
}

/// A request that passed validation, still in presentation space
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub corners: [Point; 4],
    pub counts: SegmentCounts,
    pub depth: Option<DepthPolicy>,
}

impl CalibrationRequest {
    pub fn parse(body: &[u8]) -> Result<Self, CalibrationError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn validate(self) -> Result<ValidatedRequest, CalibrationError> {
        let corners = validate_corners(&self.points)?;
        let horizontal = validate_count("horizontal", self.h_seg)?;
        let vertical = validate_count("vertical", self.v_seg)?;

        let depth = match self.depth {
            Some(pixels) if pixels.is_finite() && pixels > 0.0 => Some(DepthPolicy::Fixed { pixels }),
            Some(pixels) => return Err(CalibrationError::Depth(pixels)),
            None => None,
        };

        Ok(ValidatedRequest {
            corners,
            counts: SegmentCounts::new(horizontal, vertical),
            depth,
        })
    }
}

fn validate_corners(points: &[Point]) -> Result<[Point; 4], CalibrationError> {
    let corners: [Point; 4] = points
        .try_into()
        .map_err(|_| CalibrationError::PointCount(points.len()))?;

    if let Some(index) = corners.iter().position(|p| !p.is_finite()) {
        return Err(CalibrationError::NonFinite(index));
    }
    Ok(corners)
}

fn validate_count(axis: &'static str, value: i64) -> Result<u32, CalibrationError> {
    if (1..=MAX_SEGMENTS).contains(&value) {
        Ok(value as u32)
    } else {
        Err(CalibrationError::SegmentCount { axis, value })
    }
}

/// Mapping between presentation space and the working resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkingSpace {
    pub scale_x: f64,
    pub scale_y: f64,
}

impl WorkingSpace {
    pub fn from_config(config: &Config) -> Self {
        let (scale_x, scale_y) = config.working_scale();
        Self { scale_x, scale_y }
    }

    pub fn to_working(&self, corners: &[Point; 4]) -> [Point; 4] {
        corners.map(|p| p.scale(self.scale_x, self.scale_y))
    }

    pub fn to_presentation(&self, corners: &[Point; 4]) -> [Point; 4] {
        corners.map(|p| p.scale(1.0 / self.scale_x, 1.0 / self.scale_y))
    }
}

/// The calibration the sampling loop works from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbilightConfig {
    /// Screen corners at the working resolution, clockwise from top-left
    pub corners: [Point; 4],
    pub counts: SegmentCounts,
    pub depth: DepthPolicy,
    pub averaging: AveragingPolicy,
    pub valid: bool,
}

impl AmbilightConfig {
    /// Startup calibration from the configuration file
    pub fn from_settings(config: &Config) -> Self {
        let sampling = &config.sampling;
        let space = WorkingSpace::from_config(config);

        let valid = validate_corners(&sampling.corners).is_ok()
            && validate_count("horizontal", sampling.h_segments as i64).is_ok()
            && validate_count("vertical", sampling.v_segments as i64).is_ok();
        if !valid {
            tracing::warn!("Calibration in config file is invalid, sampling stays idle until updated");
        }

        Self {
            corners: space.to_working(&sampling.corners),
            counts: SegmentCounts::new(sampling.h_segments, sampling.v_segments),
            depth: sampling.depth,
            averaging: sampling.averaging,
            valid,
        }
    }

    /// Build the replacement for `self` from an accepted request
    pub fn with_request(&self, request: &ValidatedRequest, space: &WorkingSpace, default_depth: DepthPolicy) -> Self {
        Self {
            corners: space.to_working(&request.corners),
            counts: request.counts,
            depth: request.depth.unwrap_or(default_depth),
            averaging: self.averaging,
            valid: true,
        }
    }

    /// Same geometry, marked unusable
    pub fn invalidated(&self) -> Self {
        Self {
            valid: false,
            ..self.clone()
        }
    }

    pub fn windows(&self) -> EdgeWindows {
        compute_windows(&self.corners, self.counts, self.depth)
    }

    /// Store this calibration into the persisted configuration
    pub fn write_back(&self, config: &mut Config, space: &WorkingSpace) {
        config.sampling.corners = space.to_presentation(&self.corners);
        config.sampling.h_segments = self.counts.horizontal;
        config.sampling.v_segments = self.counts.vertical;
        config.sampling.depth = self.depth;
        config.sampling.averaging = self.averaging;
    }
}

/// Interior grid points for a preview payload, in the payload's own space
pub fn preview_grid(body: &[u8]) -> Result<Vec<Point>, CalibrationError> {
    let request = CalibrationRequest::parse(body)?.validate()?;
    Ok(grid_points(&request.corners, request.counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{
        "points": [{"x": 50, "y": 40}, {"x": 590, "y": 40}, {"x": 590, "y": 440}, {"x": 50, "y": 440}],
        "hSeg": 12, "vSeg": 6
    }"#;

    fn space() -> WorkingSpace {
        WorkingSpace::from_config(&Config::default())
    }

    #[test]
    fn test_parse_and_scale() {
        let request = CalibrationRequest::parse(GOOD.as_bytes()).unwrap().validate().unwrap();
        assert_eq!(request.counts, SegmentCounts::new(12, 6));
        assert_eq!(request.depth, None);

        let base = AmbilightConfig::from_settings(&Config::default());
        let cfg = base.with_request(&request, &space(), DepthPolicy::Interpolated);
        assert!(cfg.valid);
        assert_eq!(cfg.corners[0], Point::new(25.0, 20.0));
        assert_eq!(cfg.corners[2], Point::new(295.0, 220.0));
        assert_eq!(cfg.depth, DepthPolicy::Interpolated);
    }

    #[test]
    fn test_depth_override() {
        let body = r#"{"points": [{"x":0,"y":0},{"x":10,"y":0},{"x":10,"y":10},{"x":0,"y":10}],
                       "hSeg": 2, "vSeg": 2, "depth": 7.5}"#;
        let request = CalibrationRequest::parse(body.as_bytes()).unwrap().validate().unwrap();
        assert_eq!(request.depth, Some(DepthPolicy::Fixed { pixels: 7.5 }));

        let body = body.replace("7.5", "-1");
        let err = CalibrationRequest::parse(body.as_bytes()).unwrap().validate().unwrap_err();
        assert!(matches!(err, CalibrationError::Depth(_)));
    }

    #[test]
    fn test_rejects_wrong_point_count() {
        let body = r#"{"points": [{"x":0,"y":0},{"x":10,"y":0},{"x":10,"y":10}], "hSeg": 2, "vSeg": 2}"#;
        let err = CalibrationRequest::parse(body.as_bytes()).unwrap().validate().unwrap_err();
        assert!(matches!(err, CalibrationError::PointCount(3)));
        assert_eq!(err.to_string(), "Need 4 points, got 3");

        let body = r#"{"hSeg": 2, "vSeg": 2}"#;
        let err = CalibrationRequest::parse(body.as_bytes()).unwrap().validate().unwrap_err();
        assert!(matches!(err, CalibrationError::PointCount(0)));
    }

    #[test]
    fn test_rejects_bad_counts() {
        for (h, v) in [(0, 4), (4, 0), (-3, 4), (4, 1000)] {
            let body = format!(
                r#"{{"points": [{{"x":0,"y":0}},{{"x":10,"y":0}},{{"x":10,"y":10}},{{"x":0,"y":10}}], "hSeg": {}, "vSeg": {}}}"#,
                h, v
            );
            let err = CalibrationRequest::parse(body.as_bytes()).unwrap().validate().unwrap_err();
            assert!(matches!(err, CalibrationError::SegmentCount { .. }), "{} {}", h, v);
        }
    }

    #[test]
    fn test_rejects_malformed_json() {
        for body in ["", "{", "[]", r#"{"points": "nope", "hSeg": 1, "vSeg": 1}"#, r#"{"points": []}"#] {
            assert!(
                matches!(CalibrationRequest::parse(body.as_bytes()), Err(CalibrationError::Parse(_))),
                "{:?}",
                body
            );
        }
    }

    #[test]
    fn test_invalid_file_calibration_is_idle() {
        let mut config = Config::default();
        config.sampling.h_segments = 0;
        assert!(!AmbilightConfig::from_settings(&config).valid);

        let mut config = Config::default();
        config.sampling.corners[1].x = f64::NAN;
        assert!(!AmbilightConfig::from_settings(&config).valid);
    }

    #[test]
    fn test_invalidated_keeps_geometry() {
        let cfg = AmbilightConfig::from_settings(&Config::default());
        let invalid = cfg.invalidated();
        assert!(!invalid.valid);
        assert_eq!(invalid.corners, cfg.corners);
        assert_eq!(invalid.counts, cfg.counts);
    }

    #[test]
    fn test_write_back_restores_presentation_space() {
        let mut config = Config::default();
        let request = CalibrationRequest::parse(GOOD.as_bytes()).unwrap().validate().unwrap();
        let cfg = AmbilightConfig::from_settings(&config).with_request(&request, &space(), DepthPolicy::Interpolated);

        cfg.write_back(&mut config, &space());
        assert_eq!(config.sampling.corners, request.corners);
        assert_eq!(config.sampling.h_segments, 12);
        assert_eq!(config.sampling.v_segments, 6);
    }

    #[test]
    fn test_preview_grid_stays_in_request_space() {
        let points = preview_grid(GOOD.as_bytes()).unwrap();
        assert_eq!(points.len(), 11 + 11 + 5 + 5);
        assert_eq!(points[0], Point::new(95.0, 40.0));
        assert!(preview_grid(b"{}").is_err());
    }
}
