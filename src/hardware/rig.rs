//! Hardware-backed device set.

use std::sync::Arc;

use crate::config::Settings;
use crate::error::{AppResult, CondError};
use crate::hardware::capture::{CaptureCamera, CaptureDriver};
use crate::hardware::ftdi::{share_port, DigitalPort, PinShocker, PortChannel, SerializerOdorBank};
use crate::hardware::{CameraHandle, Device, DeviceFactory, DeviceSet, FrameCallback};

/// Opens a digital port by name (e.g. a serial device path).
pub type PortOpener = Arc<dyn Fn(&str, u32) -> anyhow::Result<Box<dyn DigitalPort>> + Send + Sync>;

/// Opens the capture driver for a camera port number.
pub type DriverOpener = Arc<dyn Fn(u32) -> anyhow::Result<Box<dyn CaptureDriver>> + Send + Sync>;

/// Builds the rig's real devices from injected port and driver openers.
pub struct HardwareDevices {
    ports: PortOpener,
    capture: Option<DriverOpener>,
}

impl HardwareDevices {
    pub fn new(ports: PortOpener) -> Self {
        Self { ports, capture: None }
    }

    pub fn with_capture(mut self, capture: DriverOpener) -> Self {
        self.capture = Some(capture);
        self
    }
}

fn created<T: Device + 'static>(device: Arc<T>) -> AppResult<Arc<T>> {
    device.create().map_err(|e| CondError::device(device.name(), format!("{:#}", e)))?;
    Ok(device)
}

impl DeviceFactory for HardwareDevices {
    fn create_devices(
        &self,
        settings: &Settings,
        frame_sink: &dyn Fn(usize) -> FrameCallback,
    ) -> AppResult<DeviceSet> {
        let hw = &settings.hardware;
        let open = |name: &str| {
            (self.ports)(name, hw.baud_rate)
                .map(share_port)
                .map_err(|e| CondError::device(name, format!("{:#}", e)))
        };
        let odor_port = open(&hw.odor_port)?;
        let pin_port = open(&hw.pin_port)?;

        let odors = created(Arc::new(SerializerOdorBank::new(
            "odors",
            settings.odor.num_lines(),
            odor_port.clone(),
        )))?;
        let shocker = PinShocker::new("pin_dev", hw.shocker_pin, pin_port.clone())
            .map_err(|e| CondError::Configuration(e.to_string()))?;
        let shocker = created(Arc::new(shocker))?;

        let mut cameras = Vec::new();
        let video = &settings.video;
        if video.num_cameras() > 0 {
            let capture = self.capture.as_ref().ok_or_else(|| {
                CondError::FeatureIncomplete(
                    "capture".to_string(),
                    "No capture driver is available for hardware cameras; run simulated or configure no video ports.".to_string(),
                )
            })?;
            for (i, port) in video.ports.iter().enumerate() {
                let name = format!("player{}", port);
                let driver = capture(*port).map_err(|e| CondError::device(&name, format!("{:#}", e)))?;
                let camera = created(Arc::new(CaptureCamera::new(
                    &name,
                    i,
                    video.pixel_format(i)?,
                    driver,
                    frame_sink(i),
                )))?;
                cameras.push(CameraHandle::new(camera));
            }
        }

        Ok(DeviceSet {
            ports: vec![
                Arc::new(PortChannel::new("odor_port", odor_port)) as Arc<dyn Device>,
                Arc::new(PortChannel::new("pin_port", pin_port)),
            ],
            odors,
            shocker,
            cameras,
        })
    }
}
