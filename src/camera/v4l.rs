use v4l::{
    buffer::Type,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, Format, FourCC,
};

use super::{CaptureError, FrameBuffer, PixelFormat, Sensor};
use crate::config::CameraConfig;

/// V4L2 capture device delivering YUYV or MJPG frames
pub struct V4lSensor {
    stream: MmapStream<'static>,
    device: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4lSensor {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let mut device = Device::with_path(&config.device)?;

        let fourcc = match config.pixel_format {
            PixelFormat::Jpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            other => {
                return Err(CaptureError::Unsupported(format!(
                    "v4l sensor cannot deliver {:?}",
                    other
                )))
            }
        };

        let (width, height) = config.frame_size.dimensions();
        let fmt = device.set_format(&Format::new(width, height, fourcc))?;
        if fmt.fourcc != fourcc {
            return Err(CaptureError::Unsupported(format!(
                "{} refused {} and offered {}",
                config.device, fourcc, fmt.fourcc
            )));
        }
        log::info!("Camera format set for {}: {}", config.device, fmt);

        // Leak device to static for MmapStream
        let static_dev: &'static mut Device = Box::leak(Box::new(device));
        let buffers = config.fb_count.max(2) as u32;
        let stream = MmapStream::with_buffers(static_dev, Type::VideoCapture, buffers)?;

        Ok(Self {
            stream,
            device: config.device.clone(),
            width: fmt.width,
            height: fmt.height,
            format: config.pixel_format,
        })
    }
}

impl Sensor for V4lSensor {
    fn name(&self) -> &str {
        &self.device
    }

    fn fill(&mut self, frame: &mut FrameBuffer) -> Result<(), CaptureError> {
        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());

        frame.data.clear();
        frame.data.extend_from_slice(&buf[..used]);
        frame.width = self.width;
        frame.height = self.height;
        frame.format = self.format;
        Ok(())
    }
}
