//! Frame producers feeding the streaming engine.

use crate::{FourCc, PixelFormat};
use std::fmt;
use tracing::debug;

/// Pixel format rejected by a video source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidFormat(pub FourCc);

impl fmt::Display for InvalidFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported pixel format {}", self.0)
    }
}

impl std::error::Error for InvalidFormat {}

/// How a source delivers frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Fills a buffer when the streaming engine polls it.
    Static,
    /// Produces frames autonomously and has buffers queued to it.
    Active,
}

/// A producer of video frames.
///
/// `fill` is how static sources hand over frames; `queue` is only meaningful
/// for active sources and defaults to a no-op, as do the lifecycle hooks.
pub trait VideoSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn set_format(&mut self, format: &PixelFormat) -> Result<(), InvalidFormat>;

    fn set_frame_rate(&mut self, _fps: u32) {}

    fn stream_on(&mut self) {}

    fn stream_off(&mut self) {}

    fn free_buffers(&mut self) {}

    /// Produce one frame into `buf`, returning the bytes written.
    fn fill(&mut self, buf: &mut [u8]) -> usize;

    /// Hand an empty buffer to an autonomous source.
    fn queue(&mut self, _buf: &mut [u8]) {}
}

// YUYV pixel pairs (two pixels per 32-bit word).
const WHITE: u32 = 0x80eb80eb;
const GRAY: u32 = 0x807F7F7F;

const SQUARE_SIZE: usize = 32;

/// Built-in YUYV test source: a checkerboard scrolling horizontally by one
/// pixel per frame.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_count: u32,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            frame_count: 0,
        }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for TestPatternSource {
    fn set_format(&mut self, format: &PixelFormat) -> Result<(), InvalidFormat> {
        if format.fourcc != FourCc::new(b"YUYV") {
            return Err(InvalidFormat(format.fourcc));
        }
        self.width = format.width;
        self.height = format.height;
        debug!(width = self.width, height = self.height, "test pattern format");
        Ok(())
    }

    fn fill(&mut self, buf: &mut [u8]) -> usize {
        let width = self.width as usize;
        let height = self.height as usize;
        let bytes_per_line = width * 2;
        let frame_len = bytes_per_line * height;
        if width == 0 || buf.len() < frame_len {
            return 0;
        }

        let offset = self.frame_count as usize % (2 * SQUARE_SIZE);
        for (row, line) in buf[..frame_len].chunks_exact_mut(bytes_per_line).enumerate() {
            for (pair, cell) in line.chunks_exact_mut(4).enumerate() {
                let x = pair * 2;
                let shifted_x = (x + offset) % width;
                let color = if (row / SQUARE_SIZE + shifted_x / SQUARE_SIZE) % 2 == 0 {
                    WHITE
                } else {
                    GRAY
                };
                cell.copy_from_slice(&color.to_le_bytes());
            }
        }

        self.frame_count = self.frame_count.wrapping_add(1);
        frame_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv(width: u32, height: u32) -> PixelFormat {
        PixelFormat {
            width,
            height,
            fourcc: FourCc::new(b"YUYV"),
            sizeimage: width * height * 2,
        }
    }

    fn pixel_pair(frame: &[u8], row: usize, pair: usize, width: usize) -> u32 {
        let at = row * width * 2 + pair * 4;
        u32::from_le_bytes(frame[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn rejects_non_yuyv_formats() {
        let mut source = TestPatternSource::new();
        let mjpeg = PixelFormat {
            fourcc: FourCc::new(b"MJPG"),
            ..yuyv(640, 360)
        };
        assert_eq!(
            source.set_format(&mjpeg),
            Err(InvalidFormat(FourCc::new(b"MJPG")))
        );
        assert!(source.set_format(&yuyv(640, 360)).is_ok());
    }

    #[test]
    fn first_frame_starts_white() {
        let mut source = TestPatternSource::new();
        source.set_format(&yuyv(640, 360)).unwrap();
        let mut frame = vec![0u8; 640 * 360 * 2];
        assert_eq!(source.fill(&mut frame), 640 * 360 * 2);
        assert_eq!(pixel_pair(&frame, 0, 0, 640), WHITE);
        // The square one row-block down is the opposite color.
        assert_eq!(pixel_pair(&frame, SQUARE_SIZE, 0, 640), GRAY);
    }

    #[test]
    fn pattern_scrolls_one_pixel_per_frame() {
        let mut source = TestPatternSource::new();
        source.set_format(&yuyv(640, 360)).unwrap();
        let mut frame = vec![0u8; 640 * 360 * 2];
        for _ in 0..32 {
            source.fill(&mut frame);
        }
        // After 32 frames the offset has crossed a square boundary and the
        // origin flips from white to gray.
        source.fill(&mut frame);
        assert_eq!(pixel_pair(&frame, 0, 0, 640), GRAY);
    }

    #[test]
    fn fill_refuses_undersized_buffers() {
        let mut source = TestPatternSource::new();
        source.set_format(&yuyv(640, 360)).unwrap();
        let mut short = vec![0u8; 64];
        assert_eq!(source.fill(&mut short), 0);
    }
}
