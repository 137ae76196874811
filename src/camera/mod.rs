//! Frame capture with a fixed pool of frame buffers.
//!
//! A [`Camera`] owns `fb_count` buffers. [`Camera::capture`] lends one out
//! as a [`CameraFrame`]; dropping the frame hands the buffer back. When
//! every buffer is out, capture waits for one to come back and fails with
//! [`CaptureError::NoFreeBuffer`] only after the buffer wait runs out, so
//! memory never grows past the pool.

pub mod convert;
mod test_pattern;
#[cfg(feature = "v4l-camera")]
mod v4l;

pub use convert::{frame_to_jpeg, EncodeError};
pub use test_pattern::TestPattern;
#[cfg(feature = "v4l-camera")]
pub use self::v4l::V4lSensor;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{CameraConfig, SensorKind};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no free frame buffer")]
    NoFreeBuffer,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor error: {0}")]
    Sensor(String),

    #[error("unsupported camera setup: {0}")]
    Unsupported(String),

    #[error("sensor JPEG encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Jpeg,
    Rgb888,
    Grayscale,
    Yuyv,
}

impl PixelFormat {
    /// Bytes per pixel for raw formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Grayscale => Some(1),
            PixelFormat::Yuyv => Some(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSize {
    Qvga,
    Vga,
    Svga,
    Xga,
    Uxga,
}

impl FrameSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::Qvga => (320, 240),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Uxga => (1600, 1200),
        }
    }
}

/// Pixel data plus the metadata needed to interpret it
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let capacity = format.bytes_per_pixel().unwrap_or(1) * width as usize * height as usize;
        Self {
            data: Vec::with_capacity(capacity),
            width,
            height,
            format,
        }
    }

    fn empty() -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            format: PixelFormat::Jpeg,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Something that can fill a frame buffer with the next image.
///
/// Implementations may block until a frame is available; callers run
/// capture on the blocking pool.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    fn fill(&mut self, frame: &mut FrameBuffer) -> Result<(), CaptureError>;
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub frames_released: u64,
    pub capture_errors: u64,
    pub buffers_free: usize,
    pub buffers_total: usize,
}

/// Default time a capture waits for a buffer held by another consumer
pub const DEFAULT_BUFFER_WAIT: Duration = Duration::from_secs(1);

struct FramePool {
    free: Mutex<Vec<FrameBuffer>>,
    returned: Condvar,
    total: usize,
    captured: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
}

impl FramePool {
    fn give_back(&self, frame: FrameBuffer) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.free.lock().push(frame);
        self.returned.notify_one();
    }

    /// Pops a free buffer, waiting up to `wait` for one to be returned
    fn take(&self, wait: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + wait;
        let mut free = self.free.lock();
        loop {
            if let Some(frame) = free.pop() {
                return Some(frame);
            }
            if self.returned.wait_until(&mut free, deadline).timed_out() {
                return free.pop();
            }
        }
    }
}

/// A frame buffer on loan from the camera; returned to the pool on drop
pub struct CameraFrame {
    frame: FrameBuffer,
    pool: Arc<FramePool>,
}

impl Deref for CameraFrame {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.frame
    }
}

impl Drop for CameraFrame {
    fn drop(&mut self) {
        let frame = std::mem::replace(&mut self.frame, FrameBuffer::empty());
        self.pool.give_back(frame);
    }
}

impl std::fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.len())
            .finish()
    }
}

pub struct Camera {
    sensor: Mutex<Box<dyn Sensor>>,
    pool: Arc<FramePool>,
    buffer_wait: Duration,
}

impl Camera {
    pub fn new(
        sensor: Box<dyn Sensor>,
        width: u32,
        height: u32,
        format: PixelFormat,
        fb_count: usize,
    ) -> Self {
        let buffers = (0..fb_count)
            .map(|_| FrameBuffer::new(width, height, format))
            .collect();

        Self {
            sensor: Mutex::new(sensor),
            pool: Arc::new(FramePool {
                free: Mutex::new(buffers),
                returned: Condvar::new(),
                total: fb_count,
                captured: AtomicU64::new(0),
                released: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
            buffer_wait: DEFAULT_BUFFER_WAIT,
        }
    }

    pub fn with_buffer_wait(mut self, wait: Duration) -> Self {
        self.buffer_wait = wait;
        self
    }

    /// Builds the camera described by `config`
    pub fn from_config(config: &CameraConfig) -> Result<Self, CaptureError> {
        let (width, height) = config.frame_size.dimensions();

        let sensor: Box<dyn Sensor> = match config.sensor {
            SensorKind::TestPattern => Box::new(
                TestPattern::new(width, height, config.pixel_format)
                    .with_jpeg_quality(config.jpeg_quality)
                    .with_fps(config.fps),
            ),
            #[cfg(feature = "v4l-camera")]
            SensorKind::V4l => Box::new(V4lSensor::open(config)?),
            #[cfg(not(feature = "v4l-camera"))]
            SensorKind::V4l => {
                return Err(CaptureError::Unsupported(
                    "built without the v4l-camera feature".to_string(),
                ))
            }
        };

        log::info!(
            "Camera initialised: sensor={}, {}x{} {:?}, {} frame buffer(s)",
            sensor.name(),
            width,
            height,
            config.pixel_format,
            config.fb_count
        );

        Ok(
            Self::new(sensor, width, height, config.pixel_format, config.fb_count)
                .with_buffer_wait(Duration::from_millis(config.buffer_wait_ms)),
        )
    }

    /// Takes a free buffer from the pool and fills it with the next frame.
    /// Blocks while every buffer is lent out, up to the buffer wait.
    pub fn capture(&self) -> Result<CameraFrame, CaptureError> {
        let mut frame = match self.pool.take(self.buffer_wait) {
            Some(frame) => frame,
            None => {
                self.pool.errors.fetch_add(1, Ordering::Relaxed);
                return Err(CaptureError::NoFreeBuffer);
            }
        };

        let filled = self.sensor.lock().fill(&mut frame);
        if let Err(e) = filled {
            self.pool.errors.fetch_add(1, Ordering::Relaxed);
            self.pool.free.lock().push(frame);
            self.pool.returned.notify_one();
            return Err(e);
        }

        self.pool.captured.fetch_add(1, Ordering::Relaxed);
        Ok(CameraFrame {
            frame,
            pool: Arc::clone(&self.pool),
        })
    }

    pub fn get_stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.pool.captured.load(Ordering::Relaxed),
            frames_released: self.pool.released.load(Ordering::Relaxed),
            capture_errors: self.pool.errors.load(Ordering::Relaxed),
            buffers_free: self.pool.free.lock().len(),
            buffers_total: self.pool.total,
        }
    }
}
