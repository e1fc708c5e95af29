//! Presentation boundary.
//!
//! The capture worker never calls into the UI. It publishes finished display
//! frames into a [`FrameSlot`] and emits [`PresentationEvent`]s on a channel;
//! the presentation context drains them with a [`Presenter`] on its own
//! schedule and forwards them to its [`PresentationSink`].

use crate::remap::format_elapsed;
use crate::types::{DisplayFrame, PixelFormat, Region};
use crate::{DepthError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// UI surface that shows the depth image and status text.
pub trait PresentationSink {
    /// Create the surface. Called once, before any frame is written.
    fn bind_surface(&mut self, width: usize, height: usize, format: PixelFormat);

    /// Copy `pixels` (rows of `stride` bytes) into `region` of the surface.
    fn write_region(&mut self, region: Region, pixels: &[u8], stride: usize);

    fn set_status_text(&mut self, text: &str);
}

/// Message from the capture worker to the presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    /// A display buffer of this size now exists in the frame slot.
    Bind {
        width: usize,
        height: usize,
        format: PixelFormat,
    },
    /// Frame `sequence` was published; `elapsed` is time since capture start.
    FrameReady { sequence: u64, elapsed: Duration },
    Status(String),
    /// The loop stopped on an error after it was already streaming.
    Faulted(String),
    /// The loop was cancelled.
    Stopped,
}

struct Published {
    frame: DisplayFrame,
    sequence: u64,
}

/// Double-buffered display frame shared between the worker and the presenter.
///
/// The worker renders into its own back buffer and publishes by swapping it
/// with the front buffer under the lock, so readers only ever see complete
/// frames and no buffer is allocated after [`install`](FrameSlot::install).
#[derive(Default)]
pub struct FrameSlot {
    front: Mutex<Option<Published>>,
}

impl FrameSlot {
    pub fn new() -> Arc<FrameSlot> {
        Arc::new(FrameSlot::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Published>> {
        self.front.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the front buffer. Must match the size of the worker's back buffer.
    pub fn install(&self, frame: DisplayFrame) {
        *self.lock() = Some(Published { frame, sequence: 0 });
    }

    /// Swap `back` into the front position.
    ///
    /// Afterwards `back` holds the previous front buffer, ready to be
    /// overwritten with the next frame.
    pub fn publish(&self, back: &mut DisplayFrame, sequence: u64) -> Result<()> {
        let mut front = self.lock();
        let published = front.as_mut().ok_or(DepthError::NotStreaming)?;
        let (expected_width, expected_height) = published.frame.source_size();
        let (actual_width, actual_height) = back.source_size();
        if (expected_width, expected_height) != (actual_width, actual_height) {
            return Err(DepthError::DimensionChanged {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            });
        }
        std::mem::swap(&mut published.frame, back);
        published.sequence = sequence;
        Ok(())
    }

    /// Sequence number of the front buffer, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        self.lock().as_ref().map_or(0, |p| p.sequence)
    }

    /// Run `f` on the latest published frame while holding the lock.
    ///
    /// Blocks [`publish`](FrameSlot::publish) until `f` returns; keep `f` short.
    pub fn read<R>(&self, f: impl FnOnce(&DisplayFrame, u64) -> R) -> Option<R> {
        let front = self.lock();
        match front.as_ref() {
            Some(p) if p.sequence > 0 => Some(f(&p.frame, p.sequence)),
            _ => None,
        }
    }

    /// Copy the latest frame into `into` when it is newer than `after`.
    ///
    /// Only the pixel copy runs under the lock. `into` keeps its allocation
    /// between calls. Returns the sequence number copied.
    pub fn copy_newer(&self, after: u64, into: &mut Option<DisplayFrame>) -> Option<u64> {
        let front = self.lock();
        let published = front.as_ref().filter(|p| p.sequence > after)?;
        match into {
            Some(frame) => frame.copy_from(&published.frame),
            None => *into = Some(published.frame.clone()),
        }
        Some(published.sequence)
    }
}

/// Drains capture events into a [`PresentationSink`].
///
/// Owned by the presentation context. Frame notifications are coalesced: each
/// drain writes at most one frame, the newest one published. The sink is
/// called on a private copy, never while the capture worker could be waiting
/// to publish.
pub struct Presenter {
    events: Receiver<PresentationEvent>,
    slot: Arc<FrameSlot>,
    last_written: u64,
    scratch: Option<DisplayFrame>,
}

impl Presenter {
    pub(crate) fn new(events: Receiver<PresentationEvent>, slot: Arc<FrameSlot>) -> Self {
        Self {
            events,
            slot,
            last_written: 0,
            scratch: None,
        }
    }

    /// Sequence number of the last frame written to a sink.
    pub fn last_written(&self) -> u64 {
        self.last_written
    }

    /// Apply every pending event to `sink` without blocking.
    ///
    /// Returns the number of events handled, or
    /// [`DepthError::ChannelDisconnected`] once the worker is gone and nothing
    /// is left to drain.
    pub fn drain(&mut self, sink: &mut dyn PresentationSink) -> Result<usize> {
        let mut pending = Vec::new();
        let disconnected = loop {
            match self.events.try_recv() {
                Ok(event) => pending.push(event),
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        if pending.is_empty() && disconnected {
            return Err(DepthError::ChannelDisconnected);
        }
        Ok(self.apply(pending, sink))
    }

    /// Wait up to `timeout` for an event, then drain everything pending.
    pub fn pump(&mut self, sink: &mut dyn PresentationSink, timeout: Duration) -> Result<usize> {
        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => return Err(DepthError::ChannelDisconnected),
        };
        let mut pending = vec![first];
        pending.extend(self.events.try_iter());
        Ok(self.apply(pending, sink))
    }

    fn apply(&mut self, events: Vec<PresentationEvent>, sink: &mut dyn PresentationSink) -> usize {
        let newest_frame = events
            .iter()
            .rposition(|e| matches!(e, PresentationEvent::FrameReady { .. }));
        let count = events.len();

        for (i, event) in events.into_iter().enumerate() {
            match event {
                PresentationEvent::Bind {
                    width,
                    height,
                    format,
                } => {
                    log::debug!("Binding {}x{} {:?} surface", width, height, format);
                    sink.bind_surface(width, height, format);
                }
                PresentationEvent::FrameReady { elapsed, .. } => {
                    if Some(i) == newest_frame {
                        self.write_latest(sink, elapsed);
                    }
                }
                PresentationEvent::Status(text) => sink.set_status_text(&text),
                PresentationEvent::Faulted(message) => {
                    sink.set_status_text(&format!("Capture stopped: {}", message));
                }
                PresentationEvent::Stopped => sink.set_status_text("Capture stopped"),
            }
        }
        count
    }

    fn write_latest(&mut self, sink: &mut dyn PresentationSink, elapsed: Duration) {
        let Some(sequence) = self.slot.copy_newer(self.last_written, &mut self.scratch) else {
            return;
        };
        if let Some(frame) = &self.scratch {
            sink.write_region(frame.region(), frame.pixels(), frame.stride());
        }
        self.last_written = sequence;
        sink.set_status_text(&format_elapsed(elapsed));
    }
}

/// Sink that records every call. Used by the unit tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub binds: Vec<(usize, usize, PixelFormat)>,
    pub writes: Vec<(Region, Vec<u8>, usize)>,
    pub status: Vec<String>,
}

#[cfg(test)]
impl PresentationSink for RecordingSink {
    fn bind_surface(&mut self, width: usize, height: usize, format: PixelFormat) {
        self.binds.push((width, height, format));
    }

    fn write_region(&mut self, region: Region, pixels: &[u8], stride: usize) {
        self.writes.push((region, pixels.to_vec(), stride));
    }

    fn set_status_text(&mut self, text: &str) {
        self.status.push(text.to_string());
    }
}
