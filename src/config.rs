//! Configuration management for AmbiSample

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::color::AveragingPolicy;
use crate::geometry::DepthPolicy;

/// A 2D point in image pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Scale both axes independently (e.g. presentation -> working resolution)
    pub fn scale(&self, sx: f64, sy: f64) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
        }
    }

    /// Linear interpolation towards `other` at fraction `t`
    #[inline]
    pub fn lerp(&self, other: &Point, t: f64) -> Self {
        Self {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Preferred capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower bandwidth, decoded with turbojpeg)
    #[default]
    Mjpeg,
    /// Prefer YUYV (higher bandwidth, but we control color conversion)
    Yuyv,
}

/// Video configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_device: String,
    /// Capture resolution requested from the camera
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Resolution frames are downscaled to before sampling
    #[serde(default = "default_working_width")]
    pub working_width: u32,
    #[serde(default = "default_working_height")]
    pub working_height: u32,
    /// Preferred capture format (MJPEG or YUYV)
    #[serde(default)]
    pub format: CaptureFormat,
}

fn default_working_width() -> u32 { 320 }
fn default_working_height() -> u32 { 240 }

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            working_width: 320,
            working_height: 240,
            format: CaptureFormat::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Sampling and calibration defaults
///
/// Corners are stored in presentation space, i.e. the coordinate space the
/// calibration UI works in (normally the full camera resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_presentation_width")]
    pub presentation_width: u32,
    #[serde(default = "default_presentation_height")]
    pub presentation_height: u32,

    /// The four corners of the TV screen in the camera image
    /// Order: top-left, top-right, bottom-right, bottom-left
    #[serde(default = "default_corners")]
    pub corners: [Point; 4],

    #[serde(default = "default_h_segments")]
    pub h_segments: u32,
    #[serde(default = "default_v_segments")]
    pub v_segments: u32,

    #[serde(default)]
    pub depth: DepthPolicy,

    #[serde(default)]
    pub averaging: AveragingPolicy,

    /// Sampling cadence in milliseconds (100 = 10 Hz)
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
}

fn default_presentation_width() -> u32 { 640 }
fn default_presentation_height() -> u32 { 480 }
fn default_h_segments() -> u32 { 10 }
fn default_v_segments() -> u32 { 8 }
fn default_cadence_ms() -> u64 { 100 }

fn default_corners() -> [Point; 4] {
    [
        Point::new(50.0, 50.0),   // Top-left
        Point::new(590.0, 50.0),  // Top-right
        Point::new(590.0, 430.0), // Bottom-right
        Point::new(50.0, 430.0),  // Bottom-left
    ]
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            presentation_width: default_presentation_width(),
            presentation_height: default_presentation_height(),
            corners: default_corners(),
            h_segments: default_h_segments(),
            v_segments: default_v_segments(),
            depth: DepthPolicy::default(),
            averaging: AveragingPolicy::default(),
            cadence_ms: default_cadence_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Factor mapping presentation-space x/y onto the working resolution
    pub fn working_scale(&self) -> (f64, f64) {
        (
            self.video.working_width as f64 / self.sampling.presentation_width.max(1) as f64,
            self.video.working_height as f64 / self.sampling.presentation_height.max(1) as f64,
        )
    }
}
