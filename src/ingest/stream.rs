//! Live stream frame source.
//!
//! `StreamSource` dispatches to a backend chosen from the address scheme:
//! - `stub://` synthetic frames (always available, used by tests and demos)
//! - `rtsp://`, `rtmp://`, `http(s)://`, `file://` through GStreamer
//!   (feature: rtsp-gstreamer)
//!
//! Backends negotiate low-latency delivery when opening: no jitter buffer,
//! TCP interleaving for RTSP, and an appsink that keeps only the newest
//! decoded buffer. Queuing ahead of the application-level `FrameBuffer` is
//! therefore bounded at one frame.

#[cfg(feature = "rtsp-gstreamer")]
use std::time::Instant;
use std::time::Duration;

use url::Url;

use super::{parse_address, FrameSource, SourceFactory, SourceSettings, StreamInfo};
use crate::error::{ReadError, StreamError};
use crate::frame::Frame;

/// Live frame source over any supported transport.
pub struct StreamSource {
    settings: SourceSettings,
    backend: Option<StreamBackend>,
    address: Option<String>,
    sequence: u64,
}

enum StreamBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl StreamBackend {
    fn info(&self) -> StreamInfo {
        match self {
            StreamBackend::Synthetic(source) => source.info(),
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.info(),
        }
    }
}

impl StreamSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            backend: None,
            address: None,
            sequence: 0,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn open_backend(&self, address: &str, url: &Url) -> Result<StreamBackend, StreamError> {
        if url.scheme() == "stub" {
            return SyntheticSource::open(url, &self.settings)
                .map(StreamBackend::Synthetic)
                .map_err(|reason| StreamError::transport(address, reason));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            GstreamerSource::open(address, url, &self.settings)
                .map(StreamBackend::Gstreamer)
                .map_err(|reason| StreamError::transport(address, reason))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(StreamError::transport(
                address,
                format!(
                    "{}:// streams require the rtsp-gstreamer feature",
                    url.scheme()
                ),
            ))
        }
    }
}

impl FrameSource for StreamSource {
    fn open(&mut self, address: &str) -> Result<StreamInfo, StreamError> {
        self.close();
        let url = parse_address(address)?;
        let backend = self.open_backend(address, &url)?;
        let info = backend.info();
        log::info!("StreamSource: connected to {}", address);
        self.backend = Some(backend);
        self.address = Some(address.to_string());
        Ok(info)
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let (pixels, width, height) = match self.backend.as_mut() {
            None => return Err(ReadError::Closed),
            Some(StreamBackend::Synthetic(source)) => source.read()?,
            #[cfg(feature = "rtsp-gstreamer")]
            Some(StreamBackend::Gstreamer(source)) => source.read()?,
        };
        self.sequence += 1;
        Ok(Frame::rgb(pixels, width, height, self.sequence))
    }

    fn close(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        match backend {
            StreamBackend::Synthetic(_) => {}
            #[cfg(feature = "rtsp-gstreamer")]
            StreamBackend::Gstreamer(source) => source.close(),
        }
        if let Some(address) = &self.address {
            log::info!("StreamSource: released {}", address);
        }
    }

    fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    fn stream_info(&self) -> StreamInfo {
        self.backend.as_ref().map_or_else(StreamInfo::default, StreamBackend::info)
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory producing `StreamSource` instances with shared timeouts.
#[derive(Clone, Debug, Default)]
pub struct StreamSourceFactory {
    settings: SourceSettings,
}

impl StreamSourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for StreamSourceFactory {
    fn create(&self, address: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        parse_address(address)?;
        Ok(Box::new(StreamSource::new(self.settings)))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------
//
// Query parameters shape the synthetic stream:
//   fps=<n>         pacing of emitted frames (0 = unpaced), default 30
//   width, height   frame size, default 64x48, at most 8192 per side
//   frames=<n>      stop producing after n frames; later reads time out
//   eos=true        report the stream as closed after `frames` instead
//   fail_open=true  refuse every open attempt

const MAX_SYNTHETIC_DIMENSION: u32 = 8192;

struct SyntheticSource {
    width: u32,
    height: u32,
    fps: u32,
    frame_limit: Option<u64>,
    eos_after_limit: bool,
    read_timeout: Duration,
    frame_count: u64,
    next_due: std::time::Instant,
    /// Simulated scene state so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticSource {
    fn open(url: &Url, settings: &SourceSettings) -> Result<Self, String> {
        let mut source = Self {
            width: 64,
            height: 48,
            fps: 30,
            frame_limit: None,
            eos_after_limit: false,
            read_timeout: settings.read_timeout,
            frame_count: 0,
            next_due: std::time::Instant::now(),
            scene_state: 0,
        };
        let mut fail_open = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => source.fps = parse_param(&key, &value)?,
                "width" => source.width = parse_param(&key, &value)?,
                "height" => source.height = parse_param(&key, &value)?,
                "frames" => source.frame_limit = Some(parse_param(&key, &value)?),
                "eos" => source.eos_after_limit = parse_param(&key, &value)?,
                "fail_open" => fail_open = parse_param(&key, &value)?,
                other => log::debug!("stub source ignores parameter '{}'", other),
            }
        }
        if fail_open {
            return Err("synthetic source configured to refuse connections".to_string());
        }
        if source.width == 0 || source.height == 0 {
            return Err("synthetic frame size must be non-zero".to_string());
        }
        if source.width > MAX_SYNTHETIC_DIMENSION || source.height > MAX_SYNTHETIC_DIMENSION {
            return Err(format!(
                "synthetic frame size {}x{} exceeds {} per side",
                source.width, source.height, MAX_SYNTHETIC_DIMENSION
            ));
        }
        Ok(source)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: Some(self.width),
            height: Some(self.height),
            fps: (self.fps > 0).then_some(self.fps as f64),
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.fps as f64)
        }
    }

    fn read(&mut self) -> Result<(Vec<u8>, u32, u32), ReadError> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                if self.eos_after_limit {
                    return Err(ReadError::Closed);
                }
                let wait = self
                    .frame_interval()
                    .min(self.read_timeout)
                    .max(Duration::from_millis(1));
                std::thread::sleep(wait);
                return Err(ReadError::Timeout(wait));
            }
        }

        let now = std::time::Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > self.read_timeout {
                std::thread::sleep(self.read_timeout);
                return Err(ReadError::Timeout(self.read_timeout));
            }
            std::thread::sleep(wait);
        }
        self.next_due = self.next_due.max(now) + self.frame_interval();

        self.frame_count += 1;
        Ok((self.generate_synthetic_pixels(), self.width, self.height))
    }

    /// Fill a frame with a moving gradient. The scene changes every 50 frames.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.width as usize * self.height as usize * 3;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value '{}' for stub parameter '{}'", value, key))
}

/// GStreamer pipeline for an address, tuned for minimal internal queuing.
#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
pub(crate) fn pipeline_description(url: &Url) -> String {
    const SINK: &str = "videoconvert ! video/x-raw,format=RGB ! \
                        appsink name=appsink sync=false max-buffers=1 drop=true";
    match url.scheme() {
        "rtsp" | "rtsps" => format!(
            "rtspsrc location={} latency=0 protocols=tcp drop-on-latency=true ! decodebin ! {}",
            url, SINK
        ),
        _ => format!("uridecodebin uri={} ! {}", url, SINK),
    }
}

// ----------------------------------------------------------------------------
// Production source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    info: StreamInfo,
    last_frame_at: Option<Instant>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    fn open(address: &str, url: &Url, settings: &SourceSettings) -> Result<Self, String> {
        use gstreamer::prelude::*;

        gstreamer::init().map_err(|e| format!("initialize gstreamer: {e}"))?;

        let description = pipeline_description(url);
        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| format!("build pipeline: {e}"))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| "pipeline is not a Pipeline".to_string())?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| "appsink element missing from pipeline".to_string())?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| "appsink element has unexpected type".to_string())?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| format!("set pipeline to Playing: {e}"))?;

        // Bounded wait for the pipeline to reach Playing.
        let open_timeout = gstreamer::ClockTime::from_mseconds(settings.open_timeout.as_millis() as u64);
        let (result, _, _) = pipeline.state(open_timeout);
        match result {
            Ok(gstreamer::StateChangeSuccess::Success)
            | Ok(gstreamer::StateChangeSuccess::NoPreroll) => {}
            Ok(gstreamer::StateChangeSuccess::Async) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(format!(
                    "{} did not start within {:?}",
                    address, settings.open_timeout
                ));
            }
            Err(e) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(format!("pipeline failed to start: {e}"));
            }
        }

        let info = negotiated_info(&appsink).unwrap_or_default();
        log::debug!("{} negotiated {:?}", address, info);

        Ok(Self {
            pipeline,
            appsink,
            read_timeout: settings.read_timeout,
            info,
            last_frame_at: None,
        })
    }

    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> Result<(Vec<u8>, u32, u32), ReadError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(ReadError::Closed);
            }
            return Err(ReadError::Timeout(self.read_timeout));
        };

        let (pixels, width, height, fps) =
            sample_to_pixels(&sample).map_err(ReadError::Transport)?;
        self.info = StreamInfo {
            width: Some(width),
            height: Some(height),
            fps: fps.or(self.info.fps),
        };
        self.last_frame_at = Some(Instant::now());
        Ok((pixels, width, height))
    }

    fn close(self) {
        use gstreamer::prelude::*;
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }

    fn poll_bus(&mut self) -> Result<(), ReadError> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(ReadError::Transport(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(ReadError::Closed),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Caps already agreed on the appsink pad. Live sources usually have them
/// once the pipeline is Playing; others only after the first sample.
#[cfg(feature = "rtsp-gstreamer")]
fn negotiated_info(appsink: &gstreamer_app::AppSink) -> Option<StreamInfo> {
    use gstreamer::prelude::*;

    let caps = appsink.static_pad("sink")?.current_caps()?;
    let info = gstreamer_video::VideoInfo::from_caps(&caps).ok()?;
    Some(StreamInfo {
        width: Some(info.width()),
        height: Some(info.height()),
        fps: video_fps(&info),
    })
}

#[cfg(feature = "rtsp-gstreamer")]
fn video_fps(info: &gstreamer_video::VideoInfo) -> Option<f64> {
    let fps = info.fps();
    (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64)
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(
    sample: &gstreamer::Sample,
) -> Result<(Vec<u8>, u32, u32, Option<f64>), String> {
    let buffer = sample.buffer().ok_or("sample missing buffer")?;
    let caps = sample.caps().ok_or("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| format!("parse caps as video info: {e}"))?;

    let width = info.width();
    let height = info.height();
    let fps = video_fps(&info);
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().map_err(|e| format!("map buffer: {e}"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height, fps));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).ok_or("buffer row is out of bounds")?);
    }

    Ok((pixels, width, height, fps))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
