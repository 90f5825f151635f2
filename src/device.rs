//! V4L2 transport using the v4l crate.
//!
//! Each subdevice is one `/dev/videoN` node. Streaming runs on a dedicated
//! thread per subdevice that dequeues mmap buffers and hands them to the
//! capture callback.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::calibration::Calibration;
use crate::error::{HardwareError, Result};
use crate::traits::{CaptureDevice, FourCC, FrameCallback, SubdeviceSession};

/// Buffers queued per stream.
const BUFFER_COUNT: u32 = 4;

/// How long the capture thread waits for a buffer before rechecking the stop
/// flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// What a V4L2 node reports about itself.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Driver name (e.g., "vivid", "uvcvideo").
    pub driver: String,
    /// Card name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Supports video capture.
    pub can_capture: bool,
    /// Supports streaming I/O.
    pub can_stream: bool,
}

/// A camera whose subdevices are V4L2 capture nodes.
pub struct V4L2Device {
    nodes: Vec<usize>,
    calibration: Calibration,
}

impl V4L2Device {
    /// `nodes[i]` is the `/dev/video` index backing subdevice `i`.
    ///
    /// V4L2 has no calibration channel, so `calibration` (usually the
    /// catalog's) is what [`CaptureDevice::retrieve_calibration`] reports.
    pub fn new(nodes: Vec<usize>, calibration: Option<Calibration>) -> Self {
        Self {
            nodes,
            calibration: calibration.unwrap_or_default(),
        }
    }
}

impl CaptureDevice for V4L2Device {
    type Session = V4L2Session;

    fn claim_subdevice(&self, index: usize) -> Result<Self::Session> {
        let node = *self
            .nodes
            .get(index)
            .ok_or(HardwareError::DeviceNotFound(index))?;
        V4L2Session::open(node)
    }

    fn retrieve_calibration(&self, _first: &Self::Session) -> Result<Calibration> {
        Ok(self.calibration.clone())
    }
}

/// An open V4L2 capture node.
pub struct V4L2Session {
    node: usize,
    device: Arc<Device>,
    capabilities: DeviceCapabilities,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

fn open_failed(err: &io::Error) -> HardwareError {
    HardwareError::DeviceOpenFailed(err.to_string())
}

fn stream_error(err: &io::Error) -> HardwareError {
    HardwareError::StreamError(err.to_string())
}

impl V4L2Session {
    /// Open `/dev/video{node}` and check it can stream video.
    pub fn open(node: usize) -> Result<Self> {
        let device = Device::new(node).map_err(|err| open_failed(&err))?;
        let caps = device.query_caps().map_err(|err| open_failed(&err))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(HardwareError::DeviceOpenFailed(format!(
                "/dev/video{node} ({}) cannot stream video capture",
                capabilities.card
            ))
            .into());
        }
        debug!(node, driver = %capabilities.driver, card = %capabilities.card, "Opened V4L2 node");

        Ok(Self {
            node,
            device: Arc::new(device),
            capabilities,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Capabilities reported when the node was opened.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
}

impl SubdeviceSession for V4L2Session {
    fn set_mode(&mut self, width: u32, height: u32, fourcc: FourCC, fps: u32) -> Result<()> {
        let unsupported = || HardwareError::FormatNotSupported {
            width,
            height,
            fourcc,
            fps,
        };

        let mut fmt = self.device.format().map_err(|err| stream_error(&err))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc.into();
        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| stream_error(&err))?;
        if (fmt.width, fmt.height, FourCC::from(fmt.fourcc)) != (width, height, fourcc) {
            return Err(unsupported().into());
        }

        let params = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|err| stream_error(&err))?;
        let interval = params.interval;
        if interval.numerator == 0 || interval.denominator / interval.numerator != fps {
            return Err(unsupported().into());
        }
        Ok(())
    }

    fn start_streaming(&mut self, mut callback: FrameCallback) -> Result<()> {
        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| stream_error(&err))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let node = self.node;
        let worker = thread::Builder::new()
            .name(format!("video{node}-capture"))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match stream.next() {
                        Ok((buf, meta)) => {
                            let used = (meta.bytesused as usize).min(buf.len());
                            callback(buf.get(..used).unwrap_or(buf));
                        }
                        Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                        Err(err) => {
                            warn!(node, error = %err, "Capture stream failed");
                            break;
                        }
                    }
                }
            })
            .map_err(HardwareError::Io)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(node = self.node, "Capture thread panicked");
            }
        }
    }
}

impl Drop for V4L2Session {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}
