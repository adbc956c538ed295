//! Per-camera frame writer.
//!
//! A [`FrameWriter`] owns one ordered queue and one consumer thread. The
//! producer side (`add_frame`) never blocks, so camera delivery keeps its
//! cadence regardless of encode latency. The consumer drains the queue into
//! a [`VideoEncoder`] until it sees [`WriterMessage::EndOfStream`].

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{Frame, PixelFormat, StreamFormat};
use crate::error::{AppResult, CondError};

/// Encodes frames of one stream into a file.
pub trait VideoEncoder: Send {
    /// Encodes one frame at `pts` seconds from the start of the stream.
    fn write_frame(&mut self, frame: &Frame, pts: f64) -> AppResult<()>;

    /// Flushes and closes the output.
    fn finish(&mut self) -> AppResult<()>;
}

/// Opens encoders for new output files.
pub trait EncoderFactory: Send + Sync {
    fn open(&self, path: &Path, stream: StreamFormat, pixel: PixelFormat) -> AppResult<Box<dyn VideoEncoder>>;
}

#[derive(Debug)]
pub enum WriterMessage {
    Frame(Frame, f64),
    EndOfStream,
}

/// Frame counts reported when a writer's consumer exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub dropped: u64,
}

pub struct FrameWriter {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterMessage>,
    consumer: Option<JoinHandle<WriterStats>>,
    closed: bool,
}

impl FrameWriter {
    /// Starts the consumer thread for `encoder`.
    pub fn spawn(path: PathBuf, encoder: Box<dyn VideoEncoder>) -> AppResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = path.display().to_string();
        let consumer = std::thread::Builder::new()
            .name("frame-writer".to_string())
            .spawn(move || consume(name, encoder, rx))?;
        Ok(Self {
            path,
            tx,
            consumer: Some(consumer),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a frame. Frames after end of stream are ignored.
    pub fn add_frame(&self, frame: Frame, pts: f64) {
        if self.closed {
            return;
        }
        if self.tx.send(WriterMessage::Frame(frame, pts)).is_err() {
            debug!("{}: consumer gone, frame discarded", self.path.display());
        }
    }

    /// Queues the end-of-stream marker. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(WriterMessage::EndOfStream);
        }
    }

    /// Closes the stream and blocks until the consumer has finished.
    pub fn finish_blocking(mut self) -> AppResult<WriterStats> {
        self.close();
        match self.consumer.take() {
            Some(consumer) => consumer
                .join()
                .map_err(|_| CondError::Encode(format!("{}: writer thread panicked", self.path.display()))),
            None => Ok(WriterStats::default()),
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn consume(
    name: String,
    mut encoder: Box<dyn VideoEncoder>,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
) -> WriterStats {
    let mut stats = WriterStats::default();
    while let Some(message) = rx.blocking_recv() {
        match message {
            WriterMessage::Frame(frame, pts) => match encoder.write_frame(&frame, pts) {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    warn!("{}: dropped frame at {:.3}s: {}", name, pts, e);
                    stats.dropped += 1;
                }
            },
            WriterMessage::EndOfStream => break,
        }
    }
    if let Err(e) = encoder.finish() {
        warn!("{}: could not finalize: {}", name, e);
    }
    debug!("{}: {} frames written, {} dropped", name, stats.written, stats.dropped);
    stats
}
