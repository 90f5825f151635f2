//! The camera session: stream requests, subdevice lifecycle and per-stream
//! accessors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::calibration::{Calibration, Extrinsics, Intrinsics};
use crate::catalog::CameraInfo;
use crate::error::{ConfigurationError, Result, StateError};
use crate::negotiator::{self, RequestMap};
use crate::stream_buffer::StreamBuffer;
use crate::subdevice::{CaptureStats, SubdeviceHandle};
use crate::traits::{CaptureDevice, Image, PixelFormat, Preset, Stream, StreamMode, StreamRequest};

type Subdevices<S> = BTreeMap<usize, Option<SubdeviceHandle<S>>>;

/// A multi-unit camera and the streams requested from it.
///
/// Requests may change until the first subdevice is opened, either by
/// [`CameraSession::configure_enabled_streams`] or by
/// [`CameraSession::start_capture`]. Dropping the session stops capture and
/// releases every subdevice.
pub struct CameraSession<D: CaptureDevice> {
    device: D,
    info: CameraInfo,
    requests: RequestMap,
    subdevices: Subdevices<D::Session>,
    streams: BTreeMap<Stream, Arc<StreamBuffer>>,
    calibration: Option<Calibration>,
    first_subdevice: Option<usize>,
    capturing: bool,
}

impl<D: CaptureDevice> CameraSession<D> {
    /// Create a session over `device` described by `info`. Nothing is opened.
    pub fn new(device: D, info: CameraInfo) -> Self {
        let subdevices = (0..info.subdevice_count()).map(|index| (index, None)).collect();
        Self {
            device,
            info,
            requests: RequestMap::new(),
            subdevices,
            streams: BTreeMap::new(),
            calibration: None,
            first_subdevice: None,
            capturing: false,
        }
    }

    /// The static catalog this session negotiates against.
    pub const fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn ensure_unconfigured(&self) -> Result<()> {
        if self.first_subdevice.is_some() {
            return Err(ConfigurationError::AlreadyConfigured.into());
        }
        Ok(())
    }

    /// Request `stream` at the given resolution, format and framerate.
    ///
    /// Whether the combination exists is checked at configuration time.
    pub fn enable_stream(
        &mut self,
        stream: Stream,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
    ) -> Result<()> {
        self.ensure_unconfigured()?;
        if self.info.subdevice_for(stream).is_none() {
            return Err(ConfigurationError::UnsupportedStream(stream).into());
        }
        self.requests
            .insert(stream, StreamRequest::new(width, height, format, fps));
        Ok(())
    }

    /// Request `stream` using one of the catalog's named presets.
    pub fn enable_stream_preset(&mut self, stream: Stream, preset: Preset) -> Result<()> {
        self.ensure_unconfigured()?;
        let request = self
            .info
            .preset(stream, preset)
            .ok_or(ConfigurationError::UnsupportedPreset { stream, preset })?;
        if self.info.subdevice_for(stream).is_none() {
            return Err(ConfigurationError::UnsupportedStream(stream).into());
        }
        self.requests.insert(stream, request);
        Ok(())
    }

    /// Withdraw the request for `stream`, keeping its last parameters.
    pub fn disable_stream(&mut self, stream: Stream) -> Result<()> {
        self.ensure_unconfigured()?;
        if let Some(request) = self.requests.get_mut(&stream) {
            request.enabled = false;
        }
        Ok(())
    }

    /// The current request for `stream`, enabled or not.
    pub fn stream_request(&self, stream: Stream) -> Option<StreamRequest> {
        self.requests.get(&stream).copied()
    }

    /// Whether `stream` is requested and enabled.
    pub fn is_stream_enabled(&self, stream: Stream) -> bool {
        self.requests.get(&stream).is_some_and(|request| request.enabled)
    }

    /// Open and program every subdevice the enabled requests need, then
    /// fetch calibration once.
    ///
    /// No-op once configured. Negotiation runs for all subdevices before any
    /// hardware is touched. If negotiation, any hardware call or the
    /// calibration read fails, subdevices opened by this call are released
    /// and the session is unchanged.
    pub fn configure_enabled_streams(&mut self) -> Result<()> {
        if self.first_subdevice.is_none() {
            self.open_subdevices_for_requests()?;
        }
        Ok(())
    }

    fn open_subdevices_for_requests(&mut self) -> Result<()> {
        let negotiation = negotiator::negotiate(&self.requests, &self.info)?;

        let mut opened = BTreeMap::new();
        let mut streams = BTreeMap::new();
        for mode in negotiation.modes {
            let mut handle = SubdeviceHandle::open(&self.device, mode.subdevice)?;

            let buffers: Vec<Arc<StreamBuffer>> = mode
                .streams
                .iter()
                .map(|stream_mode| {
                    let buffer = Arc::new(StreamBuffer::new());
                    if negotiation
                        .requests
                        .get(&stream_mode.stream)
                        .is_some_and(|request| request.enabled)
                    {
                        streams.insert(stream_mode.stream, Arc::clone(&buffer));
                    }
                    buffer
                })
                .collect();

            handle.set_mode(mode, buffers)?;
            opened.insert(mode.subdevice, handle);
        }

        // read through the local handles so a failure still releases them
        if self.calibration.is_none() {
            if let Some(first) = opened.values().next() {
                let calibration = self.device.retrieve_calibration(first.session())?;
                info!(
                    intrinsics = calibration.intrinsics.len(),
                    poses = calibration.stream_poses.len(),
                    "Retrieved calibration"
                );
                self.calibration = Some(calibration);
            }
        }

        self.first_subdevice = opened.keys().next().copied();
        for (index, handle) in opened {
            self.subdevices.insert(index, Some(handle));
        }
        self.streams = streams;
        self.requests = negotiation.requests;

        info!(
            subdevices = ?self.open_subdevices(),
            streams = ?self.streams.keys().collect::<Vec<_>>(),
            "Configured streams"
        );
        Ok(())
    }

    fn first_handle(&self) -> Option<&SubdeviceHandle<D::Session>> {
        self.subdevices.get(&self.first_subdevice?)?.as_ref()
    }

    fn handles_mut(&mut self) -> impl Iterator<Item = &mut SubdeviceHandle<D::Session>> {
        self.subdevices.values_mut().flatten()
    }

    /// Configure if needed, signal stream intent and start every open
    /// subdevice.
    ///
    /// If a subdevice fails to start, the ones already started are stopped.
    pub fn start_capture(&mut self) -> Result<()> {
        self.configure_enabled_streams()?;
        let first = self
            .first_handle()
            .ok_or(ConfigurationError::NoStreamsEnabled)?;

        let enabled: Vec<Stream> = self.streams.keys().copied().collect();
        self.device.set_stream_intent(first.session(), &enabled)?;

        let started = self
            .handles_mut()
            .try_for_each(SubdeviceHandle::start_streaming);
        if let Err(err) = started {
            self.handles_mut().for_each(SubdeviceHandle::stop_streaming);
            return Err(err);
        }

        self.capturing = true;
        info!(streams = ?enabled, "Capture started");
        Ok(())
    }

    /// Stop every streaming subdevice. Safe to call when not capturing.
    pub fn stop_capture(&mut self) {
        self.handles_mut().for_each(SubdeviceHandle::stop_streaming);
        if self.capturing {
            info!("Capture stopped");
        }
        self.capturing = false;
    }

    fn fastest_fps(&self) -> u32 {
        self.streams
            .values()
            .filter_map(|buffer| buffer.mode())
            .map(|mode| mode.fps)
            .max()
            .unwrap_or(0)
    }

    /// Block until every stream at the highest enabled framerate has a new
    /// frame, and pick up whatever slower streams have ready.
    ///
    /// No-op when not capturing. Slower streams are polled once and may not
    /// advance on a given call. Blocks without a timeout; see
    /// [`CameraSession::wait_all_streams_timeout`].
    pub fn wait_all_streams(&self) {
        if !self.capturing {
            return;
        }
        let fastest = self.fastest_fps();
        for buffer in self.streams.values() {
            if buffer.mode().is_some_and(|mode| mode.fps == fastest) {
                buffer.wait_for_update();
            } else {
                buffer.update_image();
            }
        }
    }

    /// Like [`CameraSession::wait_all_streams`], giving up once `timeout`
    /// has elapsed.
    ///
    /// Returns `true` if every fastest stream advanced. Returns `false`
    /// immediately when not capturing.
    pub fn wait_all_streams_timeout(&self, timeout: Duration) -> bool {
        if !self.capturing {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let fastest = self.fastest_fps();
        let mut advanced = true;
        for buffer in self.streams.values() {
            if buffer.mode().is_some_and(|mode| mode.fps == fastest) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                advanced &= buffer.wait_for_update_timeout(remaining);
            } else {
                buffer.update_image();
            }
        }
        if !advanced {
            debug!(?timeout, "Timed out waiting for frames");
        }
        advanced
    }

    fn buffer(&self, stream: Stream) -> Result<&Arc<StreamBuffer>> {
        Ok(self
            .streams
            .get(&stream)
            .ok_or(StateError::StreamNotEnabled(stream))?)
    }

    fn calibration(&self) -> Result<&Calibration> {
        Ok(self
            .calibration
            .as_ref()
            .ok_or(StateError::CalibrationUnavailable)?)
    }

    /// The negotiated mode of `stream`.
    pub fn stream_mode(&self, stream: Stream) -> Result<StreamMode> {
        Ok(self
            .buffer(stream)?
            .mode()
            .ok_or(StateError::StreamNotEnabled(stream))?)
    }

    /// Borrow the current front image of `stream`.
    ///
    /// The image stays put until the next wait call.
    pub fn with_image<R, F>(&self, stream: Stream, read: F) -> Result<R>
    where
        F: FnOnce(&Image) -> R,
    {
        Ok(read(&self.buffer(stream)?.image()))
    }

    /// Frame number of the current front image of `stream`.
    pub fn frame_number(&self, stream: Stream) -> Result<u32> {
        Ok(self.buffer(stream)?.frame_number())
    }

    /// Intrinsics of `stream`'s negotiated mode.
    pub fn get_stream_intrinsics(&self, stream: Stream) -> Result<Intrinsics> {
        let index = self.stream_mode(stream)?.intrinsics_index;
        Ok(self
            .calibration()?
            .intrinsics
            .get(index)
            .copied()
            .ok_or(StateError::MissingIntrinsics { stream, index })?)
    }

    /// Rigid transform from `from`'s coordinate frame to `to`'s.
    pub fn get_stream_extrinsics(&self, from: Stream, to: Stream) -> Result<Extrinsics> {
        self.buffer(from)?;
        self.buffer(to)?;
        let calibration = self.calibration()?;
        let pose = |stream: Stream| {
            calibration
                .stream_poses
                .get(&stream)
                .ok_or(StateError::MissingPose(stream))
        };
        Ok(calibration.extrinsics(pose(from)?, pose(to)?))
    }

    /// Meters per depth unit.
    pub fn depth_scale(&self) -> Result<f32> {
        Ok(self.calibration()?.depth_scale)
    }

    /// Indices of the open subdevices, ascending.
    pub fn open_subdevices(&self) -> Vec<usize> {
        self.subdevices
            .iter()
            .filter(|(_, handle)| handle.is_some())
            .map(|(index, _)| *index)
            .collect()
    }

    /// Callback counters of subdevice `index`, if it is open.
    pub fn subdevice_stats(&self, index: usize) -> Option<CaptureStats> {
        self.subdevices
            .get(&index)?
            .as_ref()
            .map(SubdeviceHandle::stats)
    }

    /// Whether any subdevice has been opened.
    pub const fn is_configured(&self) -> bool {
        self.first_subdevice.is_some()
    }

    /// Whether capture is running.
    pub const fn is_capturing(&self) -> bool {
        self.capturing
    }
}

impl<D: CaptureDevice> Drop for CameraSession<D> {
    fn drop(&mut self) {
        self.stop_capture();
        self.subdevices.clear();
    }
}
