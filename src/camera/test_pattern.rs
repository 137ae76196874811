use std::time::{Duration, Instant};

use image::ExtendedColorType;

use super::convert::{encode, rgb_to_yuv};
use super::{CaptureError, FrameBuffer, PixelFormat, Sensor};

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Synthetic sensor producing scrolling colour bars.
///
/// Stands in for the camera module on machines without one, and in tests.
pub struct TestPattern {
    width: u32,
    height: u32,
    format: PixelFormat,
    jpeg_quality: u8,
    frame_interval: Option<Duration>,
    next_frame: Option<Instant>,
    frame_count: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            jpeg_quality: 90,
            frame_interval: None,
            next_frame: None,
            frame_count: 0,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Paces `fill` to at most `fps` frames per second
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.frame_interval = (fps > 0).then(|| Duration::from_secs(1) / fps);
        self
    }

    fn pixel(&self, x: u32) -> [u8; 3] {
        let shift = (self.frame_count % u64::from(self.width.max(1))) as u32;
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let bar = ((x + shift) % self.width.max(1)) / bar_width;
        BARS[(bar as usize).min(BARS.len() - 1)]
    }

    fn render_rgb(&self, out: &mut Vec<u8>) {
        let row: Vec<u8> = (0..self.width).flat_map(|x| self.pixel(x)).collect();
        for _ in 0..self.height {
            out.extend_from_slice(&row);
        }
    }

    fn render_gray(&self, out: &mut Vec<u8>) {
        let row: Vec<u8> = (0..self.width)
            .map(|x| {
                let [r, g, b] = self.pixel(x);
                rgb_to_yuv(r, g, b).0
            })
            .collect();
        for _ in 0..self.height {
            out.extend_from_slice(&row);
        }
    }

    fn render_yuyv(&self, out: &mut Vec<u8>) {
        let mut row = Vec::with_capacity(self.width as usize * 2);
        for x in (0..self.width).step_by(2) {
            let [r0, g0, b0] = self.pixel(x);
            let [r1, g1, b1] = self.pixel(x + 1);
            let (y0, u, v) = rgb_to_yuv(r0, g0, b0);
            let (y1, _, _) = rgb_to_yuv(r1, g1, b1);
            row.extend_from_slice(&[y0, u, y1, v]);
        }
        for _ in 0..self.height {
            out.extend_from_slice(&row);
        }
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        let now = Instant::now();
        if let Some(next) = self.next_frame {
            if next > now {
                std::thread::sleep(next - now);
            }
        }
        let base = self.next_frame.map_or(now, |next| next.max(now));
        self.next_frame = Some(base + interval);
    }
}

impl Sensor for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn fill(&mut self, frame: &mut FrameBuffer) -> Result<(), CaptureError> {
        if self.format == PixelFormat::Yuyv && self.width % 2 != 0 {
            return Err(CaptureError::Unsupported(format!(
                "YUYV needs an even width, got {}",
                self.width
            )));
        }

        self.pace();

        frame.data.clear();
        frame.width = self.width;
        frame.height = self.height;
        frame.format = self.format;

        match self.format {
            PixelFormat::Rgb888 => self.render_rgb(&mut frame.data),
            PixelFormat::Grayscale => self.render_gray(&mut frame.data),
            PixelFormat::Yuyv => self.render_yuyv(&mut frame.data),
            PixelFormat::Jpeg => {
                let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
                self.render_rgb(&mut rgb);
                let (w, h) = (self.width, self.height);
                let jpeg = encode(&rgb, w, h, ExtendedColorType::Rgb8, self.jpeg_quality)?;
                frame.data.extend_from_slice(&jpeg);
            }
        }

        self.frame_count += 1;
        Ok(())
    }
}
