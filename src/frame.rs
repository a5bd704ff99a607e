//! Decoded frames and the drop-oldest frame buffer.
//!
//! - `Frame`: one decoded RGB8 image plus its arrival sequence number.
//! - `FrameBuffer`: fixed-capacity ring that decouples capture cadence from
//!   delivery cadence. When full, the oldest frame is evicted so the newest
//!   frame always gets in; `put` never waits on a consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default buffer capacity in frames (about one second of 30 fps video).
pub const DEFAULT_BUFFER_FRAMES: usize = 30;

/// Channel count of an RGB8 frame.
pub const RGB_CHANNELS: u8 = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded image.
///
/// Frames are moved, never shared: the source hands ownership to the buffer,
/// the buffer hands it to exactly one consumer, and an evicted frame is dropped.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Arrival order within the source that produced it.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self::new(data, width, height, RGB_CHANNELS, sequence)
    }

    /// Build a frame carrying new pixels but the same identity (sequence and
    /// capture instant). Processors use this to return annotated output.
    pub fn with_pixels(&self, data: Vec<u8>) -> Self {
        Self {
            data,
            width: self.width,
            height: self.height,
            channels: self.channels,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// A frame is usable only if it is three-channel, non-empty, and its pixel
    /// buffer matches its declared dimensions.
    pub fn is_valid(&self) -> bool {
        if self.channels != RGB_CHANNELS || self.width == 0 || self.height == 0 {
            return false;
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        self.data.len() == expected
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: drop-oldest ring
// ----------------------------------------------------------------------------

/// Bounded drop-oldest frame queue.
///
/// Backed by a fixed slot arena indexed with wrap-around arithmetic, so
/// admission never allocates. Safe to share as `Arc<FrameBuffer>` between one
/// producer and one consumer; locking is internal and held only for index
/// updates.
#[derive(Debug)]
pub struct FrameBuffer {
    ring: Mutex<Ring>,
    capacity: usize,
    admitted: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Frame>>,
    head: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, frame: Frame) -> Option<Frame> {
        let cap = self.slots.len();
        let mut evicted = None;
        if self.len == cap {
            evicted = self.slots[self.head].take();
            self.head = (self.head + 1) % cap;
            self.len -= 1;
        }
        let tail = (self.head + self.len) % cap;
        self.slots[tail] = Some(frame);
        self.len += 1;
        evicted
    }

    fn pop(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }
        let frame = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        frame
    }
}

/// Point-in-time buffer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub admitted: u64,
    pub evicted: u64,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            capacity,
            admitted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a frame. If the buffer is full the single oldest frame is evicted
    /// first. Returns true when an eviction happened.
    pub fn put(&self, frame: Frame) -> bool {
        let evicted = self.lock().push(frame);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        match evicted {
            Some(old) => {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                // Dropped outside the lock.
                drop(old);
                true
            }
            None => false,
        }
    }

    /// Take the oldest retained frame without waiting.
    pub fn try_get(&self) -> Option<Frame> {
        self.lock().pop()
    }

    /// Discard everything currently buffered. Returns how many frames were dropped.
    pub fn drain(&self) -> usize {
        let frames: Vec<Frame> = {
            let mut ring = self.lock();
            std::iter::from_fn(|| ring.pop()).collect()
        };
        frames.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.len(),
            capacity: self.capacity,
            admitted: self.admitted.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
