//! Frame sources: V4L2 cameras and still images
//!
//! Captured frames are decoded to RGB24 at the capture resolution, downscaled
//! to the working resolution and packed into an RGB565 [`PixelBuffer`].
//! Working buffers are recycled: a released frame becomes the target of the
//! next acquisition, so the steady state allocates nothing per frame apart
//! from the resize scratch image.
//!
//! Every source also publishes its latest frame at the presentation resolution
//! to a [`SnapshotSlot`], the picture calibration points are clicked on.
//!
//! Performance notes:
//! - turbojpeg (libjpeg-turbo with SIMD) for MJPEG, jpeg-decoder as fallback
//! - Integer-only YUYV to RGB conversion (no floating point)

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageOutputFormat, Rgb, RgbImage};
use parking_lot::RwLock;
use std::io::{Cursor, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CaptureFormat, Config, VideoConfig};
use crate::frame::{CaptureError, FrameSource, PixelBuffer};

// Thread-local turbojpeg decompressor for hardware-accelerated MJPEG decoding
thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

/// Longest a single acquisition waits for the camera
const FRAME_TIMEOUT: Duration = Duration::from_millis(250);

/// Pixel formats we can convert, in default order of preference
const SUPPORTED_FORMATS: &[&[u8; 4]] = &[
    b"MJPG", // Motion JPEG - low USB bandwidth, fast turbojpeg decode
    b"YUYV", // YUV 4:2:2 - uncompressed, limited to ~30fps at 640x480
    b"RGB3", // RGB24
    b"BGR3", // BGR24
];

/// JPEG quality of served snapshots
const SNAPSHOT_QUALITY: u8 = 80;

/// Latest full-color frame at the presentation resolution
///
/// Written by the frame source on the sampling thread, read by the HTTP API.
#[derive(Default)]
pub struct SnapshotSlot {
    frame: RwLock<Option<Arc<RgbImage>>>,
}

impl SnapshotSlot {
    pub fn store(&self, frame: RgbImage) {
        *self.frame.write() = Some(Arc::new(frame));
    }

    pub fn latest(&self) -> Option<Arc<RgbImage>> {
        self.frame.read().clone()
    }

    /// JPEG of the latest frame, `None` before the first frame
    pub fn encode_jpeg(&self) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.latest() else {
            return Ok(None);
        };

        let mut jpeg = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(SNAPSHOT_QUALITY))
            .context("Failed to encode snapshot")?;
        Ok(Some(jpeg))
    }
}

/// Resize RGB24 to the presentation resolution for a snapshot
fn presentation_frame(rgb: &[u8], from: (u32, u32), to: (u32, u32)) -> Option<RgbImage> {
    let needed = from.0 as usize * from.1 as usize * 3;
    let src: ImageBuffer<Rgb<u8>, &[u8]> = ImageBuffer::from_raw(from.0, from.1, rgb.get(..needed)?)?;
    if from == to {
        return RgbImage::from_raw(to.0, to.1, src.into_raw().to_vec());
    }
    Some(imageops::resize(&src, to.0, to.1, FilterType::Triangle))
}

/// How raw capture buffers are turned into RGB24
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl InputKind {
    fn from_fourcc(fourcc: &FourCC) -> Self {
        match &fourcc.repr {
            b"MJPG" => InputKind::Mjpeg,
            b"YUYV" => InputKind::Yuyv,
            b"BGR3" => InputKind::Bgr,
            _ => InputKind::Rgb,
        }
    }
}

/// Order in which capture formats are tried for a configured preference
fn format_preference(preferred: CaptureFormat) -> Vec<&'static [u8; 4]> {
    let mut order = SUPPORTED_FORMATS.to_vec();
    if preferred == CaptureFormat::Yuyv {
        order.swap(0, 1);
    }
    order
}

/// Live frames from a V4L2 capture device
pub struct CameraSource {
    stream: Stream<'static>,
    kind: InputKind,
    device_path: String,
    card: String,
    capture_width: u32,
    capture_height: u32,
    working_width: u32,
    working_height: u32,
    presentation: (u32, u32),
    snapshot: Arc<SnapshotSlot>,
    /// RGB24 at the capture resolution
    rgb_buffer: Vec<u8>,
    /// Released working buffer, reused by the next acquisition
    spare: Option<PixelBuffer>,
    frame_count: u64,
}

impl CameraSource {
    /// Open and configure the capture device
    pub fn open(video: &VideoConfig, presentation: (u32, u32), snapshot: Arc<SnapshotSlot>) -> Result<Self> {
        info!("Input device: {}", video.input_device);
        info!("Requested resolution: {}x{} @ {} fps", video.width, video.height, video.fps);

        let dev = Device::with_path(&video.input_device)
            .with_context(|| format!("Failed to open input device: {}", video.input_device))?;

        let caps = dev.query_caps().context("Failed to query device capabilities")?;
        info!("Camera: {} (driver: {})", caps.card, caps.driver);

        let format = configure_capture_format(&dev, video.width, video.height, video.format)?;
        info!(
            "Capture format: {}x{} {:?}",
            format.width,
            format.height,
            String::from_utf8_lossy(&format.fourcc.repr)
        );

        if let Err(e) = set_frame_rate(&dev, video.fps) {
            warn!("Could not set frame rate to {} fps: {}", video.fps, e);
        }

        let kind = InputKind::from_fourcc(&format.fourcc);
        if kind == InputKind::Mjpeg {
            JPEG_DECOMPRESSOR.with(|_| {});
            info!("TurboJPEG decompressor initialized");
        }

        let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
            .context("Failed to create capture stream")?;
        stream.set_timeout(FRAME_TIMEOUT);

        let rgb_size = format.width as usize * format.height as usize * 3;

        info!(
            "Sampling at {}x{} (downscaled from {}x{})",
            video.working_width, video.working_height, format.width, format.height
        );

        Ok(Self {
            stream,
            kind,
            device_path: video.input_device.clone(),
            card: caps.card,
            capture_width: format.width,
            capture_height: format.height,
            working_width: video.working_width,
            working_height: video.working_height,
            presentation,
            snapshot,
            rgb_buffer: vec![0u8; rgb_size],
            spare: None,
            frame_count: 0,
        })
    }
}

impl FrameSource for CameraSource {
    fn acquire_frame(&mut self) -> Result<PixelBuffer, CaptureError> {
        let (buf, meta) = self.stream.next().map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
                CaptureError::Unavailable(e.to_string())
            }
            _ => CaptureError::Device(e),
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let width = self.capture_width as usize;
        let height = self.capture_height as usize;

        match self.kind {
            InputKind::Mjpeg => {
                if let Err(e) = decode_mjpeg(data, &mut self.rgb_buffer, width, height) {
                    debug!("MJPEG decode failed after {} good frames: {}", self.frame_count, e);
                    return Err(e);
                }
            }
            InputKind::Yuyv => yuyv_to_rgb(data, &mut self.rgb_buffer, width, height),
            InputKind::Bgr => bgr_to_rgb(data, &mut self.rgb_buffer),
            InputKind::Rgb => {
                let copy_len = data.len().min(self.rgb_buffer.len());
                self.rgb_buffer[..copy_len].copy_from_slice(&data[..copy_len]);
            }
        }

        self.frame_count += 1;

        let capture_size = (self.capture_width, self.capture_height);
        if let Some(full) = presentation_frame(&self.rgb_buffer, capture_size, self.presentation) {
            self.snapshot.store(full);
        }

        let mut frame = match self.spare.take() {
            Some(frame) => frame,
            None => {
                debug!("Allocating working buffer {}x{}", self.working_width, self.working_height);
                PixelBuffer::try_alloc(self.working_width, self.working_height)?
            }
        };

        downscale_into(
            &self.rgb_buffer,
            capture_size,
            (self.working_width, self.working_height),
            &mut frame,
        )?;

        Ok(frame)
    }

    fn release_frame(&mut self, frame: PixelBuffer) {
        self.spare = Some(frame);
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}, {}x{} {:?} -> {}x{})",
            self.device_path,
            self.card,
            self.capture_width,
            self.capture_height,
            self.kind,
            self.working_width,
            self.working_height
        )
    }
}

/// A single image file replayed as every frame
///
/// Handy for calibrating against a screenshot without a camera attached.
/// Only one lease can be outstanding; a second acquisition before the first
/// release reports the source as unavailable.
pub struct StillImageSource {
    path: String,
    frame: Option<PixelBuffer>,
    width: u32,
    height: u32,
}

impl StillImageSource {
    pub fn open(
        path: &Path,
        working: (u32, u32),
        presentation: (u32, u32),
        snapshot: &SnapshotSlot,
    ) -> Result<Self> {
        let (working_width, working_height) = working;
        let img = image::open(path)
            .with_context(|| format!("Failed to load image {:?}", path))?
            .to_rgb8();
        info!("Still image {:?}: {}x{}", path, img.width(), img.height());

        if let Some(full) = presentation_frame(img.as_raw(), img.dimensions(), presentation) {
            snapshot.store(full);
        }

        let mut frame = PixelBuffer::try_alloc(working_width, working_height)?;
        downscale_into(
            img.as_raw(),
            (img.width(), img.height()),
            (working_width, working_height),
            &mut frame,
        )?;

        Ok(Self {
            path: path.display().to_string(),
            frame: Some(frame),
            width: working_width,
            height: working_height,
        })
    }
}

impl FrameSource for StillImageSource {
    fn acquire_frame(&mut self) -> Result<PixelBuffer, CaptureError> {
        self.frame
            .take()
            .ok_or_else(|| CaptureError::Unavailable("still frame is already leased".to_string()))
    }

    fn release_frame(&mut self, frame: PixelBuffer) {
        self.frame = Some(frame);
    }

    fn describe(&self) -> String {
        format!("still image {} ({}x{})", self.path, self.width, self.height)
    }
}

/// Open the configured frame source: a still image if given, else the camera
pub fn open_source(config: &Config, image: Option<&Path>, snapshot: Arc<SnapshotSlot>) -> Result<Box<dyn FrameSource>> {
    let video = &config.video;
    let presentation = (config.sampling.presentation_width, config.sampling.presentation_height);
    match image {
        Some(path) => Ok(Box::new(StillImageSource::open(
            path,
            (video.working_width, video.working_height),
            presentation,
            &snapshot,
        )?)),
        None => Ok(Box::new(CameraSource::open(video, presentation, snapshot)?)),
    }
}

/// Resize RGB24 to the working resolution and pack it into `frame`
fn downscale_into(rgb: &[u8], from: (u32, u32), to: (u32, u32), frame: &mut PixelBuffer) -> Result<(), CaptureError> {
    let (src_w, src_h) = from;
    let (dst_w, dst_h) = to;
    let needed = src_w as usize * src_h as usize * 3;

    let pixels = rgb.get(..needed).ok_or_else(|| {
        CaptureError::Conversion(format!("expected {} RGB bytes, got {}", needed, rgb.len()))
    })?;

    if from == to {
        return frame.pack_rgb888(pixels, dst_w, dst_h);
    }

    let src: ImageBuffer<Rgb<u8>, &[u8]> = ImageBuffer::from_raw(src_w, src_h, pixels)
        .ok_or_else(|| CaptureError::Conversion("failed to wrap RGB buffer".to_string()))?;
    let small = imageops::resize(&src, dst_w, dst_h, FilterType::Triangle);

    frame.pack_rgb888(small.as_raw(), dst_w, dst_h)
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, width: u32, height: u32, preferred: CaptureFormat) -> Result<v4l::Format> {
    let formats = dev.enum_formats().context("Failed to enumerate formats")?;

    info!("Available formats:");
    for fmt in &formats {
        info!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for candidate in format_preference(preferred) {
        let fourcc = FourCC::new(candidate);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format().context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => return Ok(actual),
            Err(e) => warn!(
                "Could not set format {:?} at {}x{}: {}",
                String::from_utf8_lossy(candidate),
                width,
                height,
                e
            ),
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    warn!(
        "No preferred format accepted, using device format {}x{} {:?}",
        current.width,
        current.height,
        String::from_utf8_lossy(&current.fourcc.repr)
    );
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params().context("Failed to get parameters")?;
    params.interval = v4l::Fraction::new(1, fps.max(1));
    dev.set_params(&params).context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    info!(
        "Frame interval: {}/{} ({:.1} fps, requested {})",
        actual.interval.numerator,
        actual.interval.denominator,
        actual.interval.denominator as f64 / actual.interval.numerator.max(1) as f64,
        fps
    );

    Ok(())
}

/// Decode an MJPEG frame to RGB24 with turbojpeg, falling back to jpeg-decoder
fn decode_mjpeg(mjpeg_data: &[u8], rgb_buffer: &mut [u8], width: usize, height: usize) -> Result<(), CaptureError> {
    let expected_size = width * height * 3;
    if rgb_buffer.len() < expected_size {
        return Err(CaptureError::Conversion(format!(
            "RGB buffer holds {} bytes, need {}",
            rgb_buffer.len(),
            expected_size
        )));
    }

    let decoded = JPEG_DECOMPRESSOR.with(|decomp| {
        let mut decomp = decomp.borrow_mut();
        let decompressor = decomp.as_mut()?;
        let header = decompressor.read_header(mjpeg_data).ok()?;
        if header.width != width || header.height != height {
            return None;
        }

        let image = turbojpeg::Image {
            pixels: &mut rgb_buffer[..expected_size],
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(mjpeg_data, image).ok()
    });

    match decoded {
        Some(()) => Ok(()),
        None => decode_mjpeg_software(mjpeg_data, rgb_buffer, width, height),
    }
}

/// Software MJPEG decoder using the jpeg-decoder crate
fn decode_mjpeg_software(mjpeg_data: &[u8], rgb_buffer: &mut [u8], width: usize, height: usize) -> Result<(), CaptureError> {
    let mut decoder = jpeg_decoder::Decoder::new(std::io::Cursor::new(mjpeg_data));
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Conversion(format!("JPEG decode failed: {}", e)))?;
    let info = decoder
        .info()
        .ok_or_else(|| CaptureError::Conversion("JPEG has no frame header".to_string()))?;

    if info.width as usize != width || info.height as usize != height {
        return Err(CaptureError::Conversion(format!(
            "JPEG is {}x{}, expected {}x{}",
            info.width, info.height, width, height
        )));
    }

    let expected_size = width * height * 3;
    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            let copy_len = pixels.len().min(expected_size);
            rgb_buffer[..copy_len].copy_from_slice(&pixels[..copy_len]);
        }
        jpeg_decoder::PixelFormat::L8 => {
            for (rgb, &gray) in rgb_buffer.chunks_exact_mut(3).zip(pixels.iter()) {
                rgb.fill(gray);
            }
        }
        other => {
            return Err(CaptureError::Conversion(format!("unsupported JPEG pixel format {:?}", other)));
        }
    }

    Ok(())
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8], width: usize, height: usize) {
    let pairs = width * height / 2;

    // 2 pixels at a time (4 bytes YUYV -> 6 bytes RGB)
    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)).take(pairs) {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 V, G = Y - 0.344 U - 0.714 V, B = Y + 1.772 U (scaled by 256)
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        dst[0] = (y0 + v_r).clamp(0, 255) as u8;
        dst[1] = (y0 - uv_g).clamp(0, 255) as u8;
        dst[2] = (y0 + u_b).clamp(0, 255) as u8;

        dst[3] = (y1 + v_r).clamp(0, 255) as u8;
        dst[4] = (y1 - uv_g).clamp(0, 255) as u8;
        dst[5] = (y1 + u_b).clamp(0, 255) as u8;
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (bgr_chunk, rgb_chunk) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        rgb_chunk[0] = bgr_chunk[2];
        rgb_chunk[1] = bgr_chunk[1];
        rgb_chunk[2] = bgr_chunk[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::RgbColor;

    #[test]
    fn test_yuyv_to_rgb() {
        // Neutral chroma gives gray at the luma level
        let yuyv = [128u8, 128, 60, 128, 255, 128, 0, 128];
        let mut rgb = [0u8; 12];
        yuyv_to_rgb(&yuyv, &mut rgb, 4, 1);
        assert_eq!(&rgb[..6], &[128, 128, 128, 60, 60, 60]);
        assert_eq!(&rgb[6..], &[255, 255, 255, 0, 0, 0]);

        // Strong V pushes red up and green down
        let yuyv = [100u8, 128, 100, 255];
        let mut rgb = [0u8; 6];
        yuyv_to_rgb(&yuyv, &mut rgb, 2, 1);
        assert!(rgb[0] > 200 && rgb[1] < 100);
    }

    #[test]
    fn test_bgr_to_rgb() {
        let bgr = vec![0u8, 128u8, 255u8];
        let mut rgb = vec![0u8; 3];

        bgr_to_rgb(&bgr, &mut rgb);

        assert_eq!(rgb, vec![255, 128, 0]);
    }

    #[test]
    fn test_format_preference() {
        assert_eq!(format_preference(CaptureFormat::Mjpeg)[0], b"MJPG");
        let yuyv_first = format_preference(CaptureFormat::Yuyv);
        assert_eq!(yuyv_first[0], b"YUYV");
        assert_eq!(yuyv_first[1], b"MJPG");
        assert_eq!(InputKind::from_fourcc(&FourCC::new(b"BGR3")), InputKind::Bgr);
    }

    #[test]
    fn test_downscale_into_working_resolution() {
        let rgb: Vec<u8> = std::iter::repeat([255u8, 0, 0]).take(8 * 6).flatten().collect();
        let mut frame = PixelBuffer::default();
        downscale_into(&rgb, (8, 6), (4, 3), &mut frame).unwrap();

        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.pixel(0, 0), RgbColor::new(248, 0, 0));
        assert_eq!(frame.pixel(3, 2), RgbColor::new(248, 0, 0));

        assert!(matches!(
            downscale_into(&rgb[..10], (8, 6), (4, 3), &mut frame),
            Err(CaptureError::Conversion(_))
        ));
    }

    #[test]
    fn test_garbage_mjpeg_is_a_conversion_error() {
        let mut rgb = vec![0u8; 4 * 4 * 3];
        let err = decode_mjpeg(&[0xFF, 0xD8, 0x00, 0x01], &mut rgb, 4, 4).unwrap_err();
        assert!(matches!(err, CaptureError::Conversion(_)));
    }

    #[test]
    fn test_still_image_source_leases_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        image::RgbImage::from_pixel(8, 6, Rgb([204, 102, 44]))
            .save(&path)
            .unwrap();

        let snapshot = SnapshotSlot::default();
        let mut source = StillImageSource::open(&path, (4, 3), (16, 12), &snapshot).unwrap();
        let full = snapshot.latest().unwrap();
        assert_eq!(full.dimensions(), (16, 12));

        let frame = source.acquire_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.pixel(1, 1), RgbColor::new(200, 100, 40));

        assert!(matches!(source.acquire_frame(), Err(CaptureError::Unavailable(_))));
        source.release_frame(frame);
        assert!(source.acquire_frame().is_ok());
    }

    #[test]
    fn test_missing_image_fails_to_open() {
        let snapshot = SnapshotSlot::default();
        assert!(StillImageSource::open(Path::new("/nonexistent/screen.png"), (4, 3), (8, 6), &snapshot).is_err());
        assert!(snapshot.latest().is_none());
    }

    #[test]
    fn test_snapshot_encodes_jpeg() {
        let snapshot = SnapshotSlot::default();
        assert!(snapshot.encode_jpeg().unwrap().is_none());

        let rgb: Vec<u8> = std::iter::repeat([10u8, 20, 30]).take(8 * 6).flatten().collect();
        snapshot.store(presentation_frame(&rgb, (8, 6), (8, 6)).unwrap());
        let jpeg = snapshot.encode_jpeg().unwrap().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        assert!(presentation_frame(&rgb[..5], (8, 6), (4, 3)).is_none());
    }
}
