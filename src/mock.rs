//! Mock transport for testing without hardware.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::calibration::Calibration;
use crate::catalog::SubdeviceMode;
use crate::error::{HardwareError, Result};
use crate::traits::{
    CaptureDevice, FourCC, FrameCallback, PixelFormat, Stream, StreamMode, SubdeviceSession,
};

/// Wire mode a mock subdevice was programmed with.
pub type ProgrammedMode = (u32, u32, FourCC, u32);

#[derive(Default)]
struct SubdeviceState {
    claimed: bool,
    mode: Option<ProgrammedMode>,
    streaming: bool,
    callback: Option<FrameCallback>,
}

#[derive(Default)]
struct MockState {
    count: usize,
    subdevices: BTreeMap<usize, SubdeviceState>,
    failing_claims: BTreeSet<usize>,
    rejected_fourcc: Option<FourCC>,
    retain_callbacks: bool,
    calibration: Calibration,
    calibration_reads: usize,
    calibration_failures: usize,
    intents: Vec<Vec<Stream>>,
}

/// Mock multi-unit device. Clones share state, so a test can keep one to
/// inspect and drive the device after handing another to a session.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// A device with `count` subdevices and default calibration.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                count,
                ..MockState::default()
            })),
        }
    }

    /// Calibration returned by `retrieve_calibration`.
    #[must_use]
    pub fn with_calibration(self, calibration: Calibration) -> Self {
        self.state.lock().calibration = calibration;
        self
    }

    /// Make the next `count` calibration reads fail.
    #[must_use]
    pub fn failing_calibration_reads(self, count: usize) -> Self {
        self.state.lock().calibration_failures = count;
        self
    }

    /// Make claiming `index` fail.
    #[must_use]
    pub fn failing_claim(self, index: usize) -> Self {
        self.state.lock().failing_claims.insert(index);
        self
    }

    /// Make programming any mode with `fourcc` fail.
    #[must_use]
    pub fn rejecting_fourcc(self, fourcc: FourCC) -> Self {
        self.state.lock().rejected_fourcc = Some(fourcc);
        self
    }

    /// Keep callbacks registered after stop and release, like a transport
    /// with callbacks still in flight.
    #[must_use]
    pub fn retaining_callbacks(self) -> Self {
        self.state.lock().retain_callbacks = true;
        self
    }

    /// Deliver a raw frame to subdevice `index`'s callback, if one is
    /// registered. Runs on the calling thread.
    pub fn emit(&self, index: usize, frame: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state
            .subdevices
            .get_mut(&index)
            .and_then(|sub| sub.callback.as_mut())
        {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    /// Whether `index` is currently claimed.
    pub fn is_claimed(&self, index: usize) -> bool {
        self.state
            .lock()
            .subdevices
            .get(&index)
            .is_some_and(|sub| sub.claimed)
    }

    /// Number of subdevices currently claimed.
    pub fn claimed_count(&self) -> usize {
        self.state
            .lock()
            .subdevices
            .values()
            .filter(|sub| sub.claimed)
            .count()
    }

    /// Whether `index` is streaming.
    pub fn is_streaming(&self, index: usize) -> bool {
        self.state
            .lock()
            .subdevices
            .get(&index)
            .is_some_and(|sub| sub.streaming)
    }

    /// Last wire mode programmed on `index`.
    pub fn programmed_mode(&self, index: usize) -> Option<ProgrammedMode> {
        self.state.lock().subdevices.get(&index).and_then(|sub| sub.mode)
    }

    /// How often calibration was read.
    pub fn calibration_reads(&self) -> usize {
        self.state.lock().calibration_reads
    }

    /// Stream sets passed to `set_stream_intent`, in call order.
    pub fn intents(&self) -> Vec<Vec<Stream>> {
        self.state.lock().intents.clone()
    }
}

impl CaptureDevice for MockDevice {
    type Session = MockSession;

    fn claim_subdevice(&self, index: usize) -> Result<Self::Session> {
        let mut state = self.state.lock();
        if index >= state.count {
            return Err(HardwareError::DeviceNotFound(index).into());
        }
        if state.failing_claims.contains(&index) {
            return Err(HardwareError::DeviceOpenFailed(format!("mock subdevice {index}")).into());
        }
        let sub = state.subdevices.entry(index).or_default();
        if sub.claimed {
            return Err(HardwareError::Busy(index).into());
        }
        sub.claimed = true;
        sub.mode = None;

        Ok(MockSession {
            index,
            state: Arc::clone(&self.state),
        })
    }

    fn set_stream_intent(&self, _first: &Self::Session, streams: &[Stream]) -> Result<()> {
        self.state.lock().intents.push(streams.to_vec());
        Ok(())
    }

    fn retrieve_calibration(&self, _first: &Self::Session) -> Result<Calibration> {
        let mut state = self.state.lock();
        state.calibration_reads += 1;
        if state.calibration_failures > 0 {
            state.calibration_failures -= 1;
            return Err(HardwareError::StreamError("mock calibration read".to_owned()).into());
        }
        Ok(state.calibration.clone())
    }
}

/// Claimed mock subdevice. Releases the claim on drop.
pub struct MockSession {
    index: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn with_sub<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut SubdeviceState, bool) -> R,
    {
        let mut state = self.state.lock();
        let retain = state.retain_callbacks;
        f(state.subdevices.entry(self.index).or_default(), retain)
    }
}

impl SubdeviceSession for MockSession {
    fn set_mode(&mut self, width: u32, height: u32, fourcc: FourCC, fps: u32) -> Result<()> {
        if self.state.lock().rejected_fourcc == Some(fourcc) {
            return Err(HardwareError::FormatNotSupported {
                width,
                height,
                fourcc,
                fps,
            }
            .into());
        }
        self.with_sub(|sub, _| sub.mode = Some((width, height, fourcc, fps)));
        Ok(())
    }

    fn start_streaming(&mut self, callback: FrameCallback) -> Result<()> {
        self.with_sub(|sub, _| {
            sub.callback = Some(callback);
            sub.streaming = true;
        });
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.with_sub(|sub, retain| {
            sub.streaming = false;
            if !retain {
                sub.callback = None;
            }
        });
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.with_sub(|sub, retain| {
            sub.claimed = false;
            sub.streaming = false;
            if !retain {
                sub.callback = None;
            }
        });
    }
}

/// Test pattern types for mock image generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars; YUYV streams only, other formats get zeros.
    ColorBars,
    /// Every byte set to the value.
    Solid(u8),
}

/// Build a raw frame for `mode`: each stream's image back to back, followed
/// by `number` as a little-endian `u32` when the mode decodes frame numbers.
pub fn raw_frame(mode: &SubdeviceMode, pattern: TestPattern, number: u32) -> Vec<u8> {
    let mut frame: Vec<u8> = mode
        .streams
        .iter()
        .flat_map(|stream_mode| generate_image(stream_mode, pattern))
        .collect();
    if mode.frame_number.is_some() {
        frame.extend_from_slice(&number.to_le_bytes());
    }
    frame
}

/// Generate one decoded image for `mode`.
pub fn generate_image(mode: &StreamMode, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; mode.image_size()];
    match pattern {
        TestPattern::ColorBars if mode.format == PixelFormat::Yuyv => {
            generate_color_bars(&mut data, mode.width);
        }
        TestPattern::ColorBars => {}
        TestPattern::Solid(value) => data.fill(value),
    }
    data
}

/// Generate YUYV color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
fn generate_color_bars(data: &mut [u8], width: u32) {
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];
    let bar_width = (width / 8).max(1);
    let row_bytes = width as usize * 2;

    for row in data.chunks_exact_mut(row_bytes) {
        for (pair, quad) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = (pair * 2) as u32;
            let (y, u, v) = bars
                .get(((x / bar_width) as usize).min(7))
                .copied()
                .unwrap_or_default();
            quad.copy_from_slice(&[y, u, y, v]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FrameNumberDecoder, Unpacker};
    use crate::error::CameraError;

    fn yuyv_mode() -> SubdeviceMode {
        SubdeviceMode {
            subdevice: 0,
            width: 16,
            height: 2,
            fourcc: FourCC::YUYV,
            fps: 30,
            streams: vec![StreamMode {
                stream: Stream::Color,
                width: 16,
                height: 2,
                format: PixelFormat::Yuyv,
                fps: 30,
                intrinsics_index: 0,
            }],
            unpacker: Unpacker::Passthrough,
            frame_number: Some(FrameNumberDecoder::TrailingU32Le),
        }
    }

    #[test]
    fn test_mock_claims_are_exclusive() {
        let device = MockDevice::new(2);
        let session = device.claim_subdevice(0).expect("first claim");

        assert!(matches!(
            device.claim_subdevice(0),
            Err(CameraError::Hardware(HardwareError::Busy(0)))
        ));
        assert!(matches!(
            device.claim_subdevice(2),
            Err(CameraError::Hardware(HardwareError::DeviceNotFound(2)))
        ));

        drop(session);
        assert!(!device.is_claimed(0));
        assert!(device.claim_subdevice(0).is_ok());
    }

    #[test]
    fn test_raw_frame_layout() {
        let mode = yuyv_mode();
        let frame = raw_frame(&mode, TestPattern::ColorBars, 0x0102_0304);

        assert_eq!(frame.len(), 16 * 2 * 2 + 4);
        // first bar is white
        assert_eq!(&frame[..4], &[235, 128, 235, 128]);
        assert_eq!(&frame[frame.len() - 4..], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_solid_pattern() {
        let image = generate_image(&yuyv_mode().streams[0], TestPattern::Solid(9));
        assert!(image.iter().all(|&b| b == 9));
    }
}
