//! Newline-delimited JSON frames over a TCP connection.

use std::io::{ErrorKind, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::deliver::{FrameMetadata, LiveConnection};
use crate::detect::Detections;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct ViewerMessage<'a> {
    image: String,
    fps: f64,
    sequence: u64,
    source: &'a str,
    detections: &'a Detections,
}

/// Encode one viewer line (including the trailing newline).
pub fn viewer_line(encoded: &[u8], meta: &FrameMetadata) -> Result<Vec<u8>> {
    let message = ViewerMessage {
        image: STANDARD.encode(encoded),
        fps: meta.fps,
        sequence: meta.sequence,
        source: &meta.source,
        detections: &meta.detections,
    };
    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    Ok(line)
}

pub struct TcpViewerConnection {
    stream: TcpStream,
    failed: bool,
}

impl TcpViewerConnection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("set viewer write timeout")?;
        stream.set_nodelay(true).context("set viewer nodelay")?;
        Ok(Self {
            stream,
            failed: false,
        })
    }

    fn peer_open(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let open = match self.stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        let restored = self.stream.set_nonblocking(false).is_ok();
        open && restored
    }
}

impl LiveConnection for TcpViewerConnection {
    fn send_frame(&mut self, encoded: &[u8], meta: &FrameMetadata) -> Result<()> {
        let line = viewer_line(encoded, meta)?;
        let sent = self
            .stream
            .write_all(&line)
            .and_then(|_| self.stream.flush());
        if let Err(err) = sent {
            self.failed = true;
            return Err(err).context("write viewer frame");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.failed && self.peer_open()
    }
}
