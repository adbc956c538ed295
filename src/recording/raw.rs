//! Raw video encoder.
//!
//! Frames are appended unmodified to the output file; a `<file>.pts.csv`
//! sidecar records the index and timestamp of every frame so the stream can
//! be muxed later without losing timing.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::{Frame, PixelFormat, StreamFormat};
use crate::error::{AppResult, CondError};
use crate::recording::writer::{EncoderFactory, VideoEncoder};

#[derive(Serialize)]
struct PtsRecord {
    frame: u64,
    pts: f64,
}

pub struct RawVideoEncoder {
    path: PathBuf,
    expected_len: usize,
    video: BufWriter<File>,
    pts: csv::Writer<File>,
    frames: u64,
}

/// Path of the timestamp sidecar for `video`.
pub fn pts_path(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_owned();
    name.push(".pts.csv");
    PathBuf::from(name)
}

impl RawVideoEncoder {
    pub fn create(path: &Path, stream: StreamFormat, pixel: PixelFormat) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let video = BufWriter::new(File::create(path)?);
        let pts = csv::Writer::from_path(pts_path(path))?;
        info!(
            "recording {} ({}x{} {} @ {:.2} fps)",
            path.display(),
            stream.width,
            stream.height,
            pixel,
            stream.rate
        );
        Ok(Self {
            path: path.to_path_buf(),
            expected_len: stream.width as usize * stream.height as usize * pixel.bytes_per_pixel(),
            video,
            pts,
            frames: 0,
        })
    }
}

impl VideoEncoder for RawVideoEncoder {
    fn write_frame(&mut self, frame: &Frame, pts: f64) -> AppResult<()> {
        if frame.data.len() != self.expected_len {
            return Err(CondError::Encode(format!(
                "frame of {} bytes does not match stream size of {} bytes",
                frame.data.len(),
                self.expected_len
            )));
        }
        self.video.write_all(&frame.data)?;
        self.pts.serialize(PtsRecord {
            frame: self.frames,
            pts,
        })?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.video.flush()?;
        self.pts.flush()?;
        info!("closed {} after {} frames", self.path.display(), self.frames);
        Ok(())
    }
}

/// Opens [`RawVideoEncoder`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawVideoFactory;

impl EncoderFactory for RawVideoFactory {
    fn open(&self, path: &Path, stream: StreamFormat, pixel: PixelFormat) -> AppResult<Box<dyn VideoEncoder>> {
        Ok(Box::new(RawVideoEncoder::create(path, stream, pixel)?))
    }
}
