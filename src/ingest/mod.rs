//! Frame ingestion sources.
//!
//! A `FrameSource` wraps one live transport connection:
//! - `open` is bounded by the configured open timeout and fails fast
//! - `read_frame` never blocks longer than the read timeout and reports
//!   failures as a `ReadError` value so the caller can apply reconnect policy
//! - `close` is idempotent and releases every transport resource
//!
//! Sources are created per session through a `SourceFactory`, which lets the
//! session manager and the recorder be driven by scripted sources in tests.

pub mod stream;

use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::error::{ReadError, StreamError};
use crate::frame::Frame;

pub use stream::{StreamSource, StreamSourceFactory};

/// Address schemes a source may be opened against.
pub const SUPPORTED_SCHEMES: &[&str] = &["stub", "rtsp", "rtsps", "rtmp", "http", "https", "file"];

/// Properties detected when a source opens. Backends fill in what they know.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StreamInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
}

/// Timeouts applied by every source backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSettings {
    pub read_timeout: Duration,
    pub open_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1000),
            open_timeout: Duration::from_millis(5000),
        }
    }
}

pub trait FrameSource: Send {
    /// Connect to `address`. Must return within the configured open timeout.
    fn open(&mut self, address: &str) -> Result<StreamInfo, StreamError>;

    /// Read the next decoded frame. Must return within the read timeout.
    fn read_frame(&mut self) -> Result<Frame, ReadError>;

    /// Release the transport. Safe to call any number of times.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Current stream properties. Transports that only learn the frame
    /// rate after decoding starts report it here once known.
    fn stream_info(&self) -> StreamInfo {
        StreamInfo::default()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self, address: &str) -> Result<StreamInfo, StreamError> {
        (**self).open(address)
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn stream_info(&self) -> StreamInfo {
        (**self).stream_info()
    }
}

/// Creates a fresh, unopened source for an address.
pub trait SourceFactory: Send + Sync {
    fn create(&self, address: &str) -> Result<Box<dyn FrameSource>, StreamError>;
}

/// Parse an address and reject schemes no backend understands.
pub fn parse_address(address: &str) -> Result<Url, StreamError> {
    let url = Url::parse(address).map_err(|e| StreamError::transport(address, e))?;
    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(StreamError::transport(
            address,
            format!(
                "unsupported scheme '{}'; expected one of {}",
                url.scheme(),
                SUPPORTED_SCHEMES.join(", ")
            ),
        ));
    }
    Ok(url)
}
