//! Live display sinks.
//!
//! Each camera has one [`FrameDisplay`]. The router pushes every frame into
//! it, recording or not; viewers subscribe and always see the most recent
//! frame only.

use tokio::sync::watch;

use crate::core::Frame;

/// Most recent frame of a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct LatestFrame {
    pub frame: Frame,
    pub pts: f64,
    /// Frames shown on this display so far, including this one.
    pub seq: u64,
}

pub struct FrameDisplay {
    index: usize,
    tx: watch::Sender<Option<LatestFrame>>,
}

impl FrameDisplay {
    pub fn new(index: usize) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn show(&self, frame: Frame, pts: f64) {
        self.tx.send_modify(|latest| {
            let seq = latest.as_ref().map_or(1, |l| l.seq + 1);
            *latest = Some(LatestFrame { frame, pts, seq });
        });
    }

    pub fn latest(&self) -> Option<LatestFrame> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LatestFrame>> {
        self.tx.subscribe()
    }
}
