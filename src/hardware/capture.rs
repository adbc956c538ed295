//! Driver-backed camera channel.
//!
//! A [`CaptureDriver`] pulls frames from an analog capture card. The camera
//! runs one dedicated capture thread per channel while the channel is open
//! and forwards frames to its callback only while activated. Size and rate
//! are learnt from the stream itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{info, warn};

use crate::core::{Frame, PixelFormat, StreamFormat};
use crate::hardware::{ChannelStates, Device, DeviceCore, FrameCallback, VideoSource};

/// Vendor capture driver for one input.
pub trait CaptureDriver: Send {
    fn open(&mut self) -> Result<()>;

    /// Waits a bounded time for the next frame; `None` on timeout.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Frame rate the input advertises, if any.
    fn nominal_rate(&self) -> Option<f64> {
        None
    }

    fn close(&mut self) -> Result<()>;
}

type SharedDriver = Arc<Mutex<Box<dyn CaptureDriver>>>;

#[derive(Default)]
struct StreamMeter {
    first_pts: Option<f64>,
    format: Option<StreamFormat>,
}

impl StreamMeter {
    /// Fixes the stream format from the first frame, measuring the rate from
    /// the first two frames when the driver does not advertise one.
    fn observe(&mut self, frame: &Frame, pts: f64, nominal: Option<f64>) {
        if self.format.is_some() {
            return;
        }
        let rate = match (nominal, self.first_pts) {
            (Some(rate), _) => rate,
            (None, Some(first)) if pts > first => 1.0 / (pts - first),
            _ => {
                self.first_pts = Some(pts);
                return;
            }
        };
        self.format = Some(StreamFormat {
            width: frame.width,
            height: frame.height,
            rate,
        });
    }
}

struct CaptureShared {
    running: AtomicBool,
    delivering: AtomicBool,
    meter: Mutex<StreamMeter>,
}

/// Camera channel over a [`CaptureDriver`].
pub struct CaptureCamera {
    core: DeviceCore,
    index: usize,
    format: PixelFormat,
    sink: FrameCallback,
    driver: SharedDriver,
    shared: Arc<CaptureShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureCamera {
    pub fn new(
        name: &str,
        index: usize,
        format: PixelFormat,
        driver: Box<dyn CaptureDriver>,
        sink: FrameCallback,
    ) -> Self {
        Self {
            core: DeviceCore::new(name, ChannelStates::default()),
            index,
            format,
            sink,
            driver: Arc::new(Mutex::new(driver)),
            shared: Arc::new(CaptureShared {
                running: AtomicBool::new(false),
                delivering: AtomicBool::new(false),
                meter: Mutex::new(StreamMeter::default()),
            }),
            thread: Mutex::new(None),
        }
    }

    fn capture_loop(name: String, driver: SharedDriver, shared: Arc<CaptureShared>, sink: FrameCallback) {
        let start = Instant::now();
        while shared.running.load(Ordering::Acquire) {
            let (next, nominal) = {
                let mut driver = driver.lock();
                (driver.read_frame(), driver.nominal_rate())
            };
            match next {
                Ok(Some(frame)) => {
                    let pts = start.elapsed().as_secs_f64();
                    shared.meter.lock().observe(&frame, pts, nominal);
                    if shared.delivering.load(Ordering::Acquire) {
                        sink(frame, pts);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{}: capture failed, stopping stream: {:#}", name, e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Device for CaptureCamera {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.lock().open())
            .await
            .context("capture open task panicked")?
            .with_context(|| format!("{}: could not open capture input", self.core.name()))?;

        self.shared.running.store(true, Ordering::Release);
        let name = self.core.name().to_string();
        let (driver, shared, sink) = (self.driver.clone(), self.shared.clone(), self.sink.clone());
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.index))
            .spawn(move || Self::capture_loop(name, driver, shared, sink))
            .context("could not spawn capture thread")?;
        *self.thread.lock() = Some(handle);
        info!("{}: capture started", self.core.name());
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        let thread = self.thread.lock().take();
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            driver.lock().close()
        })
        .await
        .context("capture close task panicked")??;
        info!("{}: capture closed", self.core.name());
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        self.shared.delivering.store(false, Ordering::Release);
        Ok(())
    }

    fn activate(&self, owner: &str) -> Result<()> {
        if self.core.add_owner(owner) {
            self.shared.delivering.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        if self.core.remove_owner(owner) {
            self.shared.delivering.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        self.core.apply(high, low).map(|_| ())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

impl VideoSource for CaptureCamera {
    fn index(&self) -> usize {
        self.index
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn stream_format(&self) -> Option<StreamFormat> {
        self.shared.meter.lock().format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Ticker {
        opened: bool,
    }

    impl CaptureDriver for Ticker {
        fn open(&mut self) -> Result<()> {
            self.opened = true;
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<Frame>> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Some(Frame::new(4, 2, PixelFormat::Gray, vec![7u8; 8])))
        }

        fn close(&mut self) -> Result<()> {
            self.opened = false;
            Ok(())
        }
    }

    #[test]
    fn test_meter_measures_rate() {
        let frame = Frame::new(2, 2, PixelFormat::Gray, vec![0u8; 4]);
        let mut meter = StreamMeter::default();
        meter.observe(&frame, 1.0, None);
        assert!(meter.format.is_none());
        meter.observe(&frame, 1.04, None);
        let format = meter.format.unwrap();
        assert_eq!((format.width, format.height), (2, 2));
        assert!((format.rate - 25.0).abs() < 1e-6);

        let mut advertised = StreamMeter::default();
        advertised.observe(&frame, 0.0, Some(29.97));
        assert_eq!(advertised.format.unwrap().rate, 29.97);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delivers_only_while_activated() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sink: FrameCallback = Arc::new(move |_f: Frame, _pts: f64| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let camera = CaptureCamera::new("cap0", 0, PixelFormat::Gray, Box::new(Ticker { opened: false }), sink);

        camera.start_channel().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(camera.stream_format().is_some());

        camera.activate("session").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::SeqCst) > 0);

        camera.deactivate("session").unwrap();
        camera.stop_channel().await.unwrap();
        let stopped = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped);
    }
}
