//! `.svr` recording container.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header:  b"SVR1" | width u32 | height u32 | fps f32
//! record:  pts_micros u64 | len u32 | len bytes of JPEG
//! ```
//!
//! The header is written when the first frame arrives, so a recording that
//! never saw a frame is an empty file.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::error::StreamError;

pub const MAGIC: &[u8; 4] = b"SVR1";
pub const EXTENSION: &str = "svr";
const HEADER_LEN: usize = 16;
/// Upper bound on one encoded frame; anything larger is treated as corruption.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RecordingHeader {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

impl RecordingHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.width.to_le_bytes());
        out[8..12].copy_from_slice(&self.height.to_le_bytes());
        out[12..16].copy_from_slice(&self.fps.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if &bytes[..4] != MAGIC {
            bail!("not a recording: bad magic {:02x?}", &bytes[..4]);
        }
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        Ok(Self {
            width: u32::from_le_bytes(word(4)),
            height: u32::from_le_bytes(word(8)),
            fps: f32::from_le_bytes(word(12)),
        })
    }

    pub fn frame_period(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / f64::from(self.fps))
        } else {
            Duration::ZERO
        }
    }
}

pub struct RecordingWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    header: Option<RecordingHeader>,
    frames: u64,
    last_pts: Duration,
}

impl RecordingWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| StreamError::resource(&path, e))?;
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            header: None,
            frames: 0,
            last_pts: Duration::ZERO,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> Option<RecordingHeader> {
        self.header
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Write the header if it has not been written yet.
    pub fn ensure_header(&mut self, header: RecordingHeader) -> io::Result<()> {
        if self.header.is_some() {
            return Ok(());
        }
        self.writer()?.write_all(&header.to_bytes())?;
        self.header = Some(header);
        Ok(())
    }

    pub fn append(&mut self, pts: Duration, jpeg: &[u8]) -> io::Result<()> {
        if self.header.is_none() {
            return Err(io::Error::new(ErrorKind::Other, "frame appended before header"));
        }
        let len = u32::try_from(jpeg.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "encoded frame too large"))?;
        let pts_micros = u64::try_from(pts.as_micros()).unwrap_or(u64::MAX);
        let out = self.writer()?;
        out.write_all(&pts_micros.to_le_bytes())?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(jpeg)?;
        self.frames += 1;
        self.last_pts = pts;
        Ok(())
    }

    /// Flush and close the file. Safe to call more than once.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.out.take() {
            Some(mut out) => {
                out.flush()?;
                out.get_ref().sync_all()
            }
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.out.is_none()
    }

    /// Duration covered so far: last presentation time plus one frame.
    pub fn duration(&self) -> Duration {
        match (self.frames, self.header) {
            (0, _) | (_, None) => Duration::ZERO,
            (_, Some(h)) => self.last_pts + h.frame_period(),
        }
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "recording already finished"))
    }
}

/// One stored frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedFrame {
    pub index: u64,
    pub pts: Duration,
    pub jpeg: Vec<u8>,
}

pub struct RecordingReader {
    reader: BufReader<File>,
    header: Option<RecordingHeader>,
    next_index: u64,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open recording {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut raw = [0u8; HEADER_LEN];
        let header = match read_exact_or_eof(&mut reader, &mut raw)? {
            0 => None,
            HEADER_LEN => Some(RecordingHeader::from_bytes(&raw)?),
            n => bail!("truncated recording header ({} bytes)", n),
        };
        Ok(Self {
            reader,
            header,
            next_index: 0,
        })
    }

    /// `None` for a recording that never received a frame.
    pub fn header(&self) -> Option<RecordingHeader> {
        self.header
    }

    /// Next frame, or `None` at end of file. A truncated trailing record
    /// (from a recording cut short) also ends the stream.
    pub fn next_frame(&mut self) -> Result<Option<RecordedFrame>> {
        if self.header.is_none() {
            return Ok(None);
        }
        let mut prefix = [0u8; 12];
        match read_exact_or_eof(&mut self.reader, &mut prefix)? {
            12 => {}
            0 => return Ok(None),
            n => {
                log::warn!("recording ends with a partial record prefix ({} bytes)", n);
                return Ok(None);
            }
        }
        let mut pts_raw = [0u8; 8];
        pts_raw.copy_from_slice(&prefix[..8]);
        let mut len_raw = [0u8; 4];
        len_raw.copy_from_slice(&prefix[8..]);
        let pts_micros = u64::from_le_bytes(pts_raw);
        let len = u32::from_le_bytes(len_raw);
        if len > MAX_RECORD_LEN {
            bail!("corrupt recording: record {} claims {} bytes", self.next_index, len);
        }
        let mut jpeg = vec![0u8; len as usize];
        if read_exact_or_eof(&mut self.reader, &mut jpeg)? != jpeg.len() {
            log::warn!("recording ends with a partial frame {}", self.next_index);
            return Ok(None);
        }
        let frame = RecordedFrame {
            index: self.next_index,
            pts: Duration::from_micros(pts_micros),
            jpeg,
        };
        self.next_index += 1;
        Ok(Some(frame))
    }
}

impl Iterator for RecordingReader {
    type Item = Result<RecordedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub duration_secs: f64,
    pub bytes: u64,
}

/// Scan a recording and summarise it.
pub fn probe_recording(path: &Path) -> Result<RecordingInfo> {
    let bytes = std::fs::metadata(path)
        .with_context(|| format!("stat recording {}", path.display()))?
        .len();
    let mut reader = RecordingReader::open(path)?;
    let header = reader.header();
    let mut frames = 0u64;
    let mut last_pts = Duration::ZERO;
    while let Some(frame) = reader.next_frame()? {
        frames += 1;
        last_pts = frame.pts;
    }
    let (width, height, fps) = header.map_or((0, 0, 0.0), |h| (h.width, h.height, h.fps));
    let duration = match header {
        Some(h) if frames > 0 => last_pts + h.frame_period(),
        _ => Duration::ZERO,
    };
    Ok(RecordingInfo {
        path: path.to_path_buf(),
        frames,
        width,
        height,
        fps,
        duration_secs: duration.as_secs_f64(),
        bytes,
    })
}
