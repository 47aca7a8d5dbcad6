//! Frame source contract and RGB565 working buffers
//!
//! A frame source hands out one working buffer at a time. The buffer must go
//! back to the source within the same sampling cycle, so the loop holds it
//! through a [`FrameLease`] that returns it on drop, including early returns.

use thiserror::Error;

use crate::color::RgbColor;

/// Errors from acquiring a working frame
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The source is busy or has no frame ready; expected and frequent
    #[error("frame source unavailable: {0}")]
    Unavailable(String),

    /// The captured frame could not be decoded or converted
    #[error("frame conversion failed: {0}")]
    Conversion(String),

    /// The working buffer could not be allocated
    #[error("out of memory allocating {bytes} byte working buffer")]
    OutOfMemory { bytes: usize },

    /// The capture device itself failed
    #[error("capture device error: {0}")]
    Device(#[from] std::io::Error),
}

/// RGB565 frame at the working resolution, two bytes per pixel, big-endian
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGB565 bytes
    #[cfg(test)]
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, data }
    }

    /// Allocate a buffer of the given size without aborting on failure
    pub fn try_alloc(width: u32, height: u32) -> Result<Self, CaptureError> {
        let bytes = width as usize * height as usize * 2;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| CaptureError::OutOfMemory { bytes })?;
        data.resize(bytes, 0);
        Ok(Self { width, height, data })
    }

    /// Solid color frame
    #[cfg(test)]
    pub fn filled(width: u32, height: u32, color: RgbColor) -> Self {
        let [hi, lo] = color.to_rgb565().to_be_bytes();
        let data = std::iter::repeat([hi, lo])
            .take(width as usize * height as usize)
            .flatten()
            .collect();
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether the buffer has pixels and enough bytes to back them
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.width as usize * self.height as usize * 2
    }

    /// Reshape an existing allocation for reuse, keeping its capacity
    pub fn reshape(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        let bytes = width as usize * height as usize * 2;
        if bytes > self.data.capacity() {
            self.data
                .try_reserve_exact(bytes - self.data.len())
                .map_err(|_| CaptureError::OutOfMemory { bytes })?;
        }
        self.data.resize(bytes, 0);
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Packed RGB565 value at (x, y). Caller guarantees bounds.
    #[inline]
    pub fn raw_pixel(&self, x: u32, y: u32) -> u16 {
        let idx = (y as usize * self.width as usize + x as usize) * 2;
        u16::from_be_bytes([self.data[idx], self.data[idx + 1]])
    }

    /// Unpacked color at (x, y). Caller guarantees bounds.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> RgbColor {
        RgbColor::from_rgb565(self.raw_pixel(x, y))
    }

    #[cfg(test)]
    pub fn set_pixel(&mut self, x: u32, y: u32, color: RgbColor) {
        let idx = (y as usize * self.width as usize + x as usize) * 2;
        let [hi, lo] = color.to_rgb565().to_be_bytes();
        self.data[idx] = hi;
        self.data[idx + 1] = lo;
    }

    /// Pack tightly laid out RGB24 into this buffer, resizing it to match
    pub fn pack_rgb888(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<(), CaptureError> {
        let pixels = width as usize * height as usize;
        if rgb.len() < pixels * 3 {
            return Err(CaptureError::Conversion(format!(
                "expected {} RGB bytes for {}x{}, got {}",
                pixels * 3,
                width,
                height,
                rgb.len()
            )));
        }

        self.reshape(width, height)?;
        for (src, dst) in rgb.chunks_exact(3).zip(self.data.chunks_exact_mut(2)) {
            let packed = RgbColor::new(src[0], src[1], src[2]).to_rgb565();
            dst.copy_from_slice(&packed.to_be_bytes());
        }
        Ok(())
    }
}

/// Producer of working frames
///
/// `acquire_frame` is expected to return promptly; a source with nothing to
/// offer returns [`CaptureError::Unavailable`] rather than blocking.
pub trait FrameSource: Send {
    /// Grab one frame at the working resolution
    fn acquire_frame(&mut self) -> Result<PixelBuffer, CaptureError>;

    /// Hand a buffer back once sampling is done with it
    fn release_frame(&mut self, frame: PixelBuffer);

    /// Short human readable description for logs
    fn describe(&self) -> String;
}

/// An acquired frame that is returned to its source when dropped
pub struct FrameLease<'a> {
    source: &'a mut dyn FrameSource,
    frame: PixelBuffer,
}

impl<'a> FrameLease<'a> {
    pub fn acquire(source: &'a mut dyn FrameSource) -> Result<Self, CaptureError> {
        let frame = source.acquire_frame()?;
        Ok(Self { source, frame })
    }

    pub fn frame(&self) -> &PixelBuffer {
        &self.frame
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        self.source.release_frame(frame);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let frame = PixelBuffer::filled(2, 1, RgbColor::new(248, 0, 0));
        assert_eq!(frame.as_bytes(), &[0xF8, 0x00, 0xF8, 0x00]);
        assert_eq!(frame.raw_pixel(1, 0), 0xF800);
    }

    #[test]
    fn test_validity() {
        assert!(!PixelBuffer::default().is_valid());
        assert!(!PixelBuffer::from_raw(4, 4, vec![0; 31]).is_valid());
        assert!(PixelBuffer::from_raw(4, 4, vec![0; 32]).is_valid());
    }

    #[test]
    fn test_pack_rgb888() {
        let rgb = [255u8, 255, 255, 0, 0, 0, 200, 100, 40, 8, 4, 8];
        let mut frame = PixelBuffer::default();
        frame.pack_rgb888(&rgb, 2, 2).unwrap();
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.pixel(0, 0), RgbColor::new(248, 252, 248));
        assert_eq!(frame.pixel(1, 0), RgbColor::new(0, 0, 0));
        assert_eq!(frame.pixel(0, 1), RgbColor::new(200, 100, 40));
        assert_eq!(frame.pixel(1, 1), RgbColor::new(8, 4, 8));

        assert!(matches!(
            frame.pack_rgb888(&rgb[..6], 2, 2),
            Err(CaptureError::Conversion(_))
        ));
    }

    #[test]
    fn test_set_pixel() {
        let mut frame = PixelBuffer::filled(3, 3, RgbColor::default());
        frame.set_pixel(2, 1, RgbColor::new(0, 252, 0));
        assert_eq!(frame.raw_pixel(2, 1), 0x07E0);
        assert_eq!(frame.pixel(1, 1), RgbColor::default());
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let mut source = ScriptedSource::new();
        source.push_frame(PixelBuffer::filled(2, 2, RgbColor::default()));
        {
            let lease = FrameLease::acquire(&mut source).unwrap();
            assert_eq!(lease.frame().width(), 2);
        }
        assert_eq!(source.acquired, 1);
        assert_eq!(source.released, 1);
    }

    #[test]
    fn test_failed_acquire_releases_nothing() {
        let mut source = ScriptedSource::new();
        source.push_error(CaptureError::OutOfMemory { bytes: 10 });
        assert!(FrameLease::acquire(&mut source).is_err());
        assert_eq!(source.released, 0);
    }
}
