//! Window color extraction
//!
//! Computes one representative color per sampling window from an RGB565
//! frame. Two averaging policies are available:
//! - RMS: root-mean-square per channel scaled by the stride area, bright
//!   pixels dominate and the result saturates at 255
//! - Gamma-correct: mean in linear light, then re-encoded as sRGB
//!
//! Pixels are visited on a stride-2 lattice aligned to the frame (even rows
//! and columns only), which quarters the work on small boards.
//!
//! Sentinels instead of errors:
//! - black `(0,0,0)` for an unusable frame or a rectangle that is empty
//!   after clipping
//! - mid-gray `(128,128,128)` when the rectangle contains no lattice pixel

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::frame::PixelBuffer;
use crate::geometry::WindowRect;

/// Sampling stride in both axes
pub const SAMPLE_STRIDE: i32 = 2;

/// Returned when the rectangle is degenerate or the frame unusable
pub const DEGENERATE_COLOR: RgbColor = RgbColor::new(0, 0, 0);

/// Returned when a valid rectangle contains no sampled pixel
pub const NO_SAMPLE_COLOR: RgbColor = RgbColor::new(128, 128, 128);

/// 8-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpack a 16-bit RGB565 pixel, expanding each channel by left shift
    #[inline]
    pub fn from_rgb565(pixel: u16) -> Self {
        Self {
            r: (((pixel >> 11) & 0x1F) << 3) as u8,
            g: (((pixel >> 5) & 0x3F) << 2) as u8,
            b: ((pixel & 0x1F) << 3) as u8,
        }
    }

    /// Pack into RGB565 (truncating the low bits)
    #[inline]
    pub fn to_rgb565(self) -> u16 {
        ((self.r as u16 >> 3) << 11) | ((self.g as u16 >> 2) << 5) | (self.b as u16 >> 3)
    }

    /// Perceived brightness with BT.601 weights
    #[inline]
    pub fn luma(&self) -> u8 {
        ((self.r as u32 * 299 + self.g as u32 * 587 + self.b as u32 * 114) / 1000) as u8
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

// Serialized as a bare `[r, g, b]` triple
impl Serialize for RgbColor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

/// Averaging algorithm used to reduce a window to one color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AveragingPolicy {
    /// Root-mean-square per channel
    Rms,
    /// Arithmetic mean in linear light (sRGB decoded, averaged, re-encoded)
    #[default]
    GammaCorrect,
}

impl AveragingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AveragingPolicy::Rms => "RMS",
            AveragingPolicy::GammaCorrect => "Gamma-correct",
        }
    }
}

/// sRGB (0-255) -> linear light (0-1), precomputed for all 256 codes
fn srgb_to_linear_lut() -> &'static [f32; 256] {
    static LUT: OnceLock<[f32; 256]> = OnceLock::new();
    LUT.get_or_init(|| {
        let mut table = [0f32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = srgb_to_linear(i as f32 / 255.0);
        }
        table
    })
}

/// sRGB transfer, decode direction (normalized input)
#[inline]
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

/// sRGB transfer, encode direction (normalized input)
#[inline]
pub fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn to_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Running per-channel sums for one averaging policy
struct ChannelAccumulator {
    policy: AveragingPolicy,
    sums: [f32; 3],
    visited: u32,
}

impl ChannelAccumulator {
    fn new(policy: AveragingPolicy) -> Self {
        Self {
            policy,
            sums: [0.0; 3],
            visited: 0,
        }
    }

    #[inline]
    fn push(&mut self, color: RgbColor) {
        match self.policy {
            AveragingPolicy::Rms => {
                for (sum, c) in self.sums.iter_mut().zip(color.to_array()) {
                    *sum += (c as u32 * c as u32) as f32;
                }
            }
            AveragingPolicy::GammaCorrect => {
                let lut = srgb_to_linear_lut();
                for (sum, c) in self.sums.iter_mut().zip(color.to_array()) {
                    *sum += lut[c as usize];
                }
            }
        }
        self.visited += 1;
    }

    /// Reduce to a color. `rms_weight` multiplies the mean square before the
    /// root (the stride area for frame windows, 1 for plain color lists).
    fn finish(&self, rms_weight: f32) -> Option<RgbColor> {
        if self.visited == 0 {
            return None;
        }

        let channel = |sum: f32| -> u8 {
            match self.policy {
                AveragingPolicy::Rms => to_channel((rms_weight * sum / self.visited as f32).sqrt()),
                AveragingPolicy::GammaCorrect => {
                    let mean = sum / self.visited as f32;
                    to_channel(linear_to_srgb(mean) * 255.0)
                }
            }
        };

        Some(RgbColor::new(
            channel(self.sums[0]),
            channel(self.sums[1]),
            channel(self.sums[2]),
        ))
    }
}

/// Average the color of one window of an RGB565 frame
///
/// Never fails; see the module docs for the sentinel colors.
pub fn sample_color(frame: &PixelBuffer, rect: WindowRect, policy: AveragingPolicy) -> RgbColor {
    if !frame.is_valid() {
        return DEGENERATE_COLOR;
    }

    let max_x = frame.width() as i32 - 1;
    let max_y = frame.height() as i32 - 1;
    let x1 = rect.x1.clamp(0, max_x);
    let x2 = rect.x2.clamp(0, max_x);
    let y1 = rect.y1.clamp(0, max_y);
    let y2 = rect.y2.clamp(0, max_y);

    if x1 >= x2 || y1 >= y2 {
        return DEGENERATE_COLOR;
    }

    // First lattice coordinate at or after the rectangle start
    let start_x = (x1 + SAMPLE_STRIDE - 1) / SAMPLE_STRIDE * SAMPLE_STRIDE;
    let start_y = (y1 + SAMPLE_STRIDE - 1) / SAMPLE_STRIDE * SAMPLE_STRIDE;

    let mut acc = ChannelAccumulator::new(policy);
    for y in (start_y..y2).step_by(SAMPLE_STRIDE as usize) {
        for x in (start_x..x2).step_by(SAMPLE_STRIDE as usize) {
            acc.push(frame.pixel(x as u32, y as u32));
        }
    }

    acc.finish((SAMPLE_STRIDE * SAMPLE_STRIDE) as f32)
        .unwrap_or(NO_SAMPLE_COLOR)
}

/// Average an explicit list of colors with the given policy
///
/// Returns `None` for an empty list.
pub fn average_colors(policy: AveragingPolicy, colors: &[RgbColor]) -> Option<RgbColor> {
    let mut acc = ChannelAccumulator::new(policy);
    for color in colors {
        acc.push(*color);
    }
    acc.finish(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: RgbColor = RgbColor::new(248, 0, 0);

    #[test]
    fn test_rgb565_unpack() {
        assert_eq!(RgbColor::from_rgb565(0xFFFF), RgbColor::new(248, 252, 248));
        assert_eq!(RgbColor::from_rgb565(0xF800), RgbColor::new(248, 0, 0));
        assert_eq!(RgbColor::from_rgb565(0x07E0), RgbColor::new(0, 252, 0));
        assert_eq!(RgbColor::from_rgb565(0x001F), RgbColor::new(0, 0, 248));
        assert_eq!(RgbColor::from_rgb565(0x0000), RgbColor::new(0, 0, 0));
        // 0b10000_100000_10000
        assert_eq!(RgbColor::from_rgb565(0x8410), RgbColor::new(128, 128, 128));
    }

    #[test]
    fn test_rgb565_pack_roundtrip_on_representable_values() {
        let c = RgbColor::new(200, 100, 40);
        let packed = c.to_rgb565();
        assert_eq!(RgbColor::from_rgb565(packed), RgbColor::new(200, 100, 40));
    }

    #[test]
    fn test_luma() {
        assert_eq!(RgbColor::new(255, 255, 255).luma(), 255);
        assert_eq!(RgbColor::new(0, 0, 0).luma(), 0);
        assert_eq!(RgbColor::new(100, 0, 0).luma(), 29);
    }

    #[test]
    fn test_uniform_window_both_policies() {
        let frame = PixelBuffer::filled(32, 32, RED);
        let rect = WindowRect::new(4, 4, 14, 14);
        // Stride correction doubles a uniform channel, clamped to 255
        assert_eq!(sample_color(&frame, rect, AveragingPolicy::Rms), RgbColor::new(255, 0, 0));
        assert_eq!(sample_color(&frame, rect, AveragingPolicy::GammaCorrect), RED);
    }

    #[test]
    fn test_uniform_rms_independent_of_window_placement() {
        let gray = RgbColor::new(96, 96, 96);
        let frame = PixelBuffer::filled(40, 30, gray);
        let rects = [
            WindowRect::new(0, 0, 16, 16),
            WindowRect::new(0, 0, 3, 3),
            WindowRect::new(0, 0, 27, 3),
            WindowRect::new(1, 1, 28, 4),
            WindowRect::new(0, 0, 5, 1),
            WindowRect::new(3, 3, 10, 7),
        ];
        for rect in rects {
            assert_eq!(sample_color(&frame, rect, AveragingPolicy::Rms), RgbColor::new(192, 192, 192), "{:?}", rect);
            assert_eq!(sample_color(&frame, rect, AveragingPolicy::GammaCorrect), gray, "{:?}", rect);
        }
    }

    #[test]
    fn test_sampling_is_idempotent() {
        let mut frame = PixelBuffer::filled(40, 30, RgbColor::new(16, 64, 200));
        for x in 0..20 {
            frame.set_pixel(x, 10, RgbColor::new(248, 252, 0));
        }
        let rect = WindowRect::new(0, 0, 39, 29);
        for policy in [AveragingPolicy::Rms, AveragingPolicy::GammaCorrect] {
            let first = sample_color(&frame, rect, policy);
            let second = sample_color(&frame, rect, policy);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_degenerate_rectangles_are_black() {
        let frame = PixelBuffer::filled(20, 20, RED);
        for policy in [AveragingPolicy::Rms, AveragingPolicy::GammaCorrect] {
            // Fully outside
            assert_eq!(sample_color(&frame, WindowRect::new(30, 30, 40, 40), policy), DEGENERATE_COLOR);
            assert_eq!(sample_color(&frame, WindowRect::new(-20, -20, -5, -5), policy), DEGENERATE_COLOR);
            // Reversed
            assert_eq!(sample_color(&frame, WindowRect::new(10, 0, 5, 10), policy), DEGENERATE_COLOR);
            // Zero height
            assert_eq!(sample_color(&frame, WindowRect::new(0, 5, 10, 5), policy), DEGENERATE_COLOR);
        }
    }

    #[test]
    fn test_unusable_frame_is_black() {
        let empty = PixelBuffer::default();
        assert_eq!(
            sample_color(&empty, WindowRect::new(0, 0, 10, 10), AveragingPolicy::Rms),
            DEGENERATE_COLOR
        );
    }

    #[test]
    fn test_no_lattice_pixel_is_gray() {
        let frame = PixelBuffer::filled(20, 20, RED);
        // Only column 1 and row 1, both odd
        let rect = WindowRect::new(1, 1, 2, 2);
        assert_eq!(sample_color(&frame, rect, AveragingPolicy::Rms), NO_SAMPLE_COLOR);
        assert_eq!(sample_color(&frame, rect, AveragingPolicy::GammaCorrect), NO_SAMPLE_COLOR);
    }

    #[test]
    fn test_clipping_keeps_inside_part() {
        let frame = PixelBuffer::filled(20, 20, RED);
        let rect = WindowRect::new(-10, -10, 100, 100);
        assert_eq!(sample_color(&frame, rect, AveragingPolicy::GammaCorrect), RED);
    }

    #[test]
    fn test_gamma_average_is_brighter_than_linear_mean() {
        let white = RgbColor::new(255, 255, 255);
        let black = RgbColor::new(0, 0, 0);
        let avg = average_colors(AveragingPolicy::GammaCorrect, &[white, black]).unwrap();
        assert!(avg.r > 127);
        assert_eq!(avg, RgbColor::new(188, 188, 188));
    }

    #[test]
    fn test_rms_average() {
        let avg = average_colors(
            AveragingPolicy::Rms,
            &[RgbColor::new(200, 0, 30), RgbColor::new(0, 0, 40)],
        )
        .unwrap();
        // sqrt(200^2 / 2) = 141.42, sqrt((900 + 1600) / 2) = 35.36
        assert_eq!(avg, RgbColor::new(141, 0, 35));
        assert_eq!(average_colors(AveragingPolicy::Rms, &[]), None);
    }

    #[test]
    fn test_rms_weights_bright_pixels() {
        // Left half at 64, right half dark
        let mut frame = PixelBuffer::filled(18, 18, RgbColor::new(0, 0, 0));
        for y in 0..18 {
            for x in 0..8 {
                frame.set_pixel(x, y, RgbColor::new(64, 64, 64));
            }
        }
        let rect = WindowRect::new(0, 0, 16, 16);
        let rms = sample_color(&frame, rect, AveragingPolicy::Rms);
        let gamma = sample_color(&frame, rect, AveragingPolicy::GammaCorrect);
        // Naive mean is 32; sqrt(4 * 64^2 / 2) = 90.5
        assert!(rms.r > 32 && gamma.r > 32, "rms {:?} gamma {:?}", rms, gamma);
        assert_eq!(rms, RgbColor::new(91, 91, 91));
    }

    #[test]
    fn test_transfer_functions_invert() {
        for code in [0u8, 1, 10, 64, 128, 200, 255] {
            let v = code as f32 / 255.0;
            let back = linear_to_srgb(srgb_to_linear(v));
            assert!((back - v).abs() < 1e-4, "code {}", code);
        }
    }
}
