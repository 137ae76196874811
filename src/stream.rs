//! MJPEG over chunked HTTP.
//!
//! Each part goes out as three body chunks: the part header, the JPEG
//! payload and the boundary that opens the next part. Browsers render the
//! resulting `multipart/x-mixed-replace` body in a plain `<img>` tag.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::camera::{frame_to_jpeg, Camera, CameraFrame, CaptureError, EncodeError, PixelFormat};
use crate::filter::RunningAverage;

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";
pub const STREAM_BOUNDARY: &str = "\r\n--123456789000000000000987654321\r\n";

/// Headers preceding each JPEG part
pub fn part_header(len: usize) -> String {
    format!("Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", len)
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("JPEG compression failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("capture worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// JPEG bytes for one part: either the camera's own buffer or a
/// conversion result. Dropping it releases whichever one it holds.
#[derive(Debug)]
pub enum FrameBytes {
    Borrowed(CameraFrame),
    Owned(Vec<u8>),
}

impl FrameBytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FrameBytes::Borrowed(frame) => &frame.data,
            FrameBytes::Owned(jpeg) => jpeg,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Captures one frame and makes sure it is JPEG. A raw frame goes back to
/// the camera as soon as conversion is done, whether or not it succeeded.
pub fn acquire_jpeg(camera: &Camera, quality: u8) -> Result<FrameBytes, StreamError> {
    let frame = camera.capture()?;
    if frame.format == PixelFormat::Jpeg {
        return Ok(FrameBytes::Borrowed(frame));
    }

    let converted = frame_to_jpeg(&frame, quality);
    drop(frame);
    Ok(FrameBytes::Owned(converted?))
}

/// Timing of one delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub bytes: usize,
    pub frame_ms: u32,
    pub avg_frame_ms: u32,
}

impl FrameReport {
    pub fn fps(&self) -> f64 {
        1000.0 / f64::from(self.frame_ms.max(1))
    }

    pub fn avg_fps(&self) -> f64 {
        1000.0 / f64::from(self.avg_frame_ms.max(1))
    }
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MJPG: {}B {}ms ({:.1}fps), AVG: {}ms ({:.1}fps)",
            self.bytes,
            self.frame_ms,
            self.fps(),
            self.avg_frame_ms,
            self.avg_fps()
        )
    }
}

/// Frame clock shared by all stream sessions
#[derive(Debug)]
pub struct FrameTiming {
    filter: RunningAverage,
    last_frame: Option<Instant>,
}

impl FrameTiming {
    pub fn new(window: usize) -> Self {
        let filter = RunningAverage::new(window);
        if !filter.is_enabled() {
            log::debug!("Frame time averaging disabled, reporting raw frame times");
        }
        Self {
            filter,
            last_frame: None,
        }
    }

    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }

    /// Valid samples in the averaging window
    pub fn samples(&self) -> usize {
        self.filter.count()
    }

    fn start(&mut self, now: Instant) {
        if self.last_frame.is_none() {
            self.last_frame = Some(now);
        }
    }

    fn reset(&mut self) {
        self.last_frame = None;
    }

    /// Records a frame finished at `now`. Frame times below 1ms count as 1ms.
    pub fn record(&mut self, now: Instant, bytes: usize) -> FrameReport {
        let elapsed = self
            .last_frame
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_frame = Some(now);

        let frame_ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX).max(1);
        let avg_frame_ms = self.filter.observe(frame_ms);

        FrameReport {
            bytes,
            frame_ms,
            avg_frame_ms,
        }
    }
}

struct ResetOnExit(Arc<Mutex<FrameTiming>>);

impl Drop for ResetOnExit {
    fn drop(&mut self) {
        self.0.lock().reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Capture,
    Payload,
    Boundary,
    Done,
}

/// One client's walk through header, payload and boundary for every frame.
/// Dropping it, at any step, releases the held frame and resets the clock.
struct Session {
    streamer: Arc<Streamer>,
    frame: Option<FrameBytes>,
    sent_bytes: usize,
    step: Step,
    frames: u64,
    _reset: ResetOnExit,
}

impl Session {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, StreamError>> {
        match self.step {
            Step::Capture => {
                if self.frames > 0 {
                    let now = Instant::now();
                    let report = self.streamer.timing.lock().record(now, self.sent_bytes);
                    log::debug!("{}", report);
                }

                let camera = Arc::clone(&self.streamer.camera);
                let quality = self.streamer.quality;
                let acquired =
                    tokio::task::spawn_blocking(move || acquire_jpeg(&camera, quality)).await;
                let frame = match acquired.map_err(StreamError::from).and_then(|r| r) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Stream session stopped: {}", e);
                        self.step = Step::Done;
                        return Some(Err(e));
                    }
                };

                let header = Bytes::from(part_header(frame.len()));
                self.sent_bytes = frame.len();
                self.frame = Some(frame);
                self.step = Step::Payload;
                Some(Ok(header))
            }
            Step::Payload => {
                // the body owns a copy, so the camera buffer can go back now
                let frame = self.frame.take()?;
                self.step = Step::Boundary;
                Some(Ok(Bytes::copy_from_slice(frame.as_slice())))
            }
            Step::Boundary => {
                self.frames += 1;
                self.step = Step::Capture;
                Some(Ok(Bytes::from_static(STREAM_BOUNDARY.as_bytes())))
            }
            Step::Done => None,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::info!("Stream session ended after {} frame(s)", self.frames);
    }
}

/// Serves MJPEG from one camera to any number of sessions
pub struct Streamer {
    camera: Arc<Camera>,
    timing: Arc<Mutex<FrameTiming>>,
    quality: u8,
}

impl Streamer {
    pub fn new(camera: Arc<Camera>, quality: u8, average_window: usize) -> Self {
        Self {
            camera,
            timing: Arc::new(Mutex::new(FrameTiming::new(average_window))),
            quality,
        }
    }

    pub fn camera(&self) -> &Arc<Camera> {
        &self.camera
    }

    pub fn timing(&self) -> &Arc<Mutex<FrameTiming>> {
        &self.timing
    }

    /// Body chunks for one client, three per frame, until a capture or
    /// encode fails. The failure is the last item.
    ///
    /// The shared frame clock starts with the first session and is reset
    /// whenever a session's stream is dropped, finished or not.
    pub fn stream_handler(
        self: &Arc<Self>,
    ) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        self.timing.lock().start(Instant::now());
        let session = Session {
            streamer: Arc::clone(self),
            frame: None,
            sent_bytes: 0,
            step: Step::Capture,
            frames: 0,
            _reset: ResetOnExit(Arc::clone(&self.timing)),
        };

        stream::unfold(session, |mut session| async move {
            let chunk = session.next_chunk().await?;
            Some((chunk, session))
        })
    }
}
