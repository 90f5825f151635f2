//! Ownership of one physical capture unit's mode and streaming state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::catalog::SubdeviceMode;
use crate::error::{ConfigurationError, Result, StateError};
use crate::stream_buffer::StreamBuffer;
use crate::traits::{CaptureDevice, Image, SubdeviceSession};

/// Counters for one subdevice's capture callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Raw frames decoded and published.
    pub frames_delivered: u64,
    /// Raw frames the unpacker rejected.
    pub frames_dropped: u64,
}

/// What the capture callback owns. Never mutated once built.
#[derive(Debug)]
struct CaptureState {
    subdevice: usize,
    mode: SubdeviceMode,
    streams: Vec<Arc<StreamBuffer>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureState {
    fn deliver(&self, frame: &[u8]) {
        let mut backs: Vec<MutexGuard<'_, Image>> =
            self.streams.iter().map(|stream| stream.back()).collect();

        let unpacked = {
            let mut dest: Vec<&mut [u8]> = backs
                .iter_mut()
                .map(|back| back.pixels.as_mut_slice())
                .collect();
            self.mode.unpacker.unpack(&mut dest, &self.mode, frame)
        };
        if let Err(err) = unpacked {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(subdevice = self.subdevice, error = %err, "Dropping raw frame");
            return;
        }

        // an undecodable number is stamped as 0, never left from a recycled slot
        if let Some(decoder) = self.mode.frame_number {
            let number = decoder.decode(&self.mode, frame).unwrap_or(0);
            for back in &mut backs {
                back.number = number;
            }
        }

        for (stream, back) in self.streams.iter().zip(backs.iter_mut()) {
            stream.publish(back);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// An open subdevice.
///
/// Dropping the handle stops streaming and releases the hardware session. A
/// callback the transport still holds keeps its own reference to the capture
/// state and to the stream buffers, so it stays valid after the handle is
/// gone.
pub struct SubdeviceHandle<S: SubdeviceSession> {
    index: usize,
    session: S,
    state: Option<Arc<CaptureState>>,
    streaming: bool,
}

impl<S: SubdeviceSession> SubdeviceHandle<S> {
    /// Claim subdevice `index` on `device`.
    pub fn open<D>(device: &D, index: usize) -> Result<Self>
    where
        D: CaptureDevice<Session = S>,
    {
        let session = device.claim_subdevice(index)?;
        info!(subdevice = index, "Claimed subdevice");
        Ok(Self {
            index,
            session,
            state: None,
            streaming: false,
        })
    }

    /// Subdevice index this handle owns.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The underlying hardware session.
    pub const fn session(&self) -> &S {
        &self.session
    }

    /// Program `mode` and bind one stream buffer per stream of the mode.
    ///
    /// `streams` is matched positionally with `mode.streams`. Each buffer is
    /// resized for its stream. Streaming is stopped first if active.
    pub fn set_mode(&mut self, mode: &SubdeviceMode, streams: Vec<Arc<StreamBuffer>>) -> Result<()> {
        if mode.streams.len() != streams.len() {
            return Err(ConfigurationError::StreamCountMismatch {
                expected: mode.streams.len(),
                actual: streams.len(),
            }
            .into());
        }
        self.stop_streaming();

        self.session
            .set_mode(mode.width, mode.height, mode.fourcc, mode.fps)?;
        for (buffer, stream_mode) in streams.iter().zip(&mode.streams) {
            buffer.set_mode(*stream_mode);
        }

        debug!(
            subdevice = self.index,
            width = mode.width,
            height = mode.height,
            fourcc = %mode.fourcc,
            fps = mode.fps,
            streams = streams.len(),
            "Programmed subdevice mode"
        );
        self.state = Some(Arc::new(CaptureState {
            subdevice: self.index,
            mode: mode.clone(),
            streams,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }));
        Ok(())
    }

    /// Register the capture callback and begin streaming.
    ///
    /// No-op if already streaming.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        let state = Arc::clone(self.state.as_ref().ok_or(StateError::ModeNotSet(self.index))?);

        self.session
            .start_streaming(Box::new(move |frame: &[u8]| state.deliver(frame)))?;
        self.streaming = true;
        info!(subdevice = self.index, "Subdevice streaming");
        Ok(())
    }

    /// Stop frame delivery. Safe to call repeatedly.
    pub fn stop_streaming(&mut self) {
        if !self.streaming {
            return;
        }
        self.session.stop_streaming();
        self.streaming = false;
        info!(subdevice = self.index, "Subdevice stopped");
    }

    /// Whether the callback is registered.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Callback counters; zero before a mode is set.
    pub fn stats(&self) -> CaptureStats {
        self.state
            .as_ref()
            .map(|state| state.stats())
            .unwrap_or_default()
    }
}

impl<S: SubdeviceSession> Drop for SubdeviceHandle<S> {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FrameNumberDecoder, Unpacker};
    use crate::error::{CameraError, HardwareError};
    use crate::mock::{raw_frame, MockDevice, TestPattern};
    use crate::traits::{FourCC, PixelFormat, Stream, StreamMode};

    fn depth_ir_mode() -> SubdeviceMode {
        SubdeviceMode {
            subdevice: 0,
            width: 4,
            height: 3,
            fourcc: FourCC::Y16,
            fps: 30,
            streams: vec![
                StreamMode {
                    stream: Stream::Depth,
                    width: 2,
                    height: 2,
                    format: PixelFormat::Z16,
                    fps: 30,
                    intrinsics_index: 0,
                },
                StreamMode {
                    stream: Stream::Infrared,
                    width: 2,
                    height: 2,
                    format: PixelFormat::Y8,
                    fps: 30,
                    intrinsics_index: 1,
                },
            ],
            unpacker: Unpacker::Planar,
            frame_number: Some(FrameNumberDecoder::TrailingU32Le),
        }
    }

    fn buffers(count: usize) -> Vec<Arc<StreamBuffer>> {
        (0..count).map(|_| Arc::new(StreamBuffer::new())).collect()
    }

    #[test]
    fn test_set_mode_programs_hardware_and_buffers() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
        let streams = buffers(2);

        handle
            .set_mode(&depth_ir_mode(), streams.clone())
            .expect("set_mode should succeed");

        assert_eq!(device.programmed_mode(0), Some((4, 3, FourCC::Y16, 30)));
        assert_eq!(streams[0].image().pixels.len(), 8);
        assert_eq!(streams[1].image().pixels.len(), 4);
        assert_eq!(streams[1].mode().map(|m| m.stream), Some(Stream::Infrared));
    }

    #[test]
    fn test_set_mode_rejects_wrong_buffer_count() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");

        let result = handle.set_mode(&depth_ir_mode(), buffers(1));
        assert!(matches!(
            result,
            Err(CameraError::Configuration(
                ConfigurationError::StreamCountMismatch {
                    expected: 2,
                    actual: 1
                }
            ))
        ));
        assert_eq!(device.programmed_mode(0), None);
    }

    #[test]
    fn test_start_requires_mode() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");

        assert!(matches!(
            handle.start_streaming(),
            Err(CameraError::State(StateError::ModeNotSet(0)))
        ));
        assert!(!device.is_streaming(0));
    }

    #[test]
    fn test_callback_unpacks_and_stamps_frame_number() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
        let streams = buffers(2);
        let mode = depth_ir_mode();
        handle.set_mode(&mode, streams.clone()).expect("set_mode");
        handle.start_streaming().expect("start");

        assert!(device.emit(0, &raw_frame(&mode, TestPattern::Solid(5), 41)));

        for stream in &streams {
            assert!(stream.update_image());
            assert_eq!(stream.frame_number(), 41);
            assert!(stream.image().pixels.iter().all(|&b| b == 5));
        }
        assert_eq!(
            handle.stats(),
            CaptureStats {
                frames_delivered: 1,
                frames_dropped: 0
            }
        );
    }

    /// Numbers the frame by its first byte, failing from 30 on.
    fn first_byte_number(_: &SubdeviceMode, frame: &[u8]) -> Option<u32> {
        frame.first().filter(|&&byte| byte < 30).map(|&byte| u32::from(byte))
    }

    #[test]
    fn test_undecodable_frame_number_is_zero() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
        let streams = buffers(2);
        let mode = SubdeviceMode {
            frame_number: Some(FrameNumberDecoder::Custom(first_byte_number)),
            ..depth_ir_mode()
        };
        handle.set_mode(&mode, streams.clone()).expect("set_mode");
        handle.start_streaming().expect("start");

        let mut seen = Vec::new();
        for value in [10, 20, 30, 40] {
            assert!(device.emit(0, &raw_frame(&mode, TestPattern::Solid(value), 0)));
            assert!(streams[0].update_image());
            let pixel = streams[0].image().pixels.first().copied();
            seen.push((pixel, streams[0].frame_number()));
        }

        assert_eq!(
            seen,
            vec![(Some(10), 10), (Some(20), 20), (Some(30), 0), (Some(40), 0)]
        );
    }

    #[test]
    fn test_short_frame_is_dropped() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
        let streams = buffers(2);
        handle.set_mode(&depth_ir_mode(), streams.clone()).expect("set_mode");
        handle.start_streaming().expect("start");

        assert!(device.emit(0, &[1, 2, 3]));

        assert!(streams.iter().all(|stream| !stream.update_image()));
        assert_eq!(handle.stats().frames_dropped, 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_halts_delivery() {
        let device = MockDevice::new(1);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
        let mode = depth_ir_mode();
        handle.set_mode(&mode, buffers(2)).expect("set_mode");
        handle.start_streaming().expect("start");
        assert!(device.is_streaming(0));

        handle.stop_streaming();
        handle.stop_streaming();
        assert!(!handle.is_streaming());
        assert!(!device.emit(0, &raw_frame(&mode, TestPattern::Solid(1), 1)));
    }

    #[test]
    fn test_retained_callback_outlives_handle() {
        let device = MockDevice::new(1).retaining_callbacks();
        let streams = buffers(2);
        let mode = depth_ir_mode();
        {
            let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");
            handle.set_mode(&mode, streams.clone()).expect("set_mode");
            handle.start_streaming().expect("start");
        }
        assert!(!device.is_claimed(0));

        // the transport still holds the callback; it must keep working
        assert!(device.emit(0, &raw_frame(&mode, TestPattern::Solid(3), 8)));
        assert!(streams[0].update_image());
        assert_eq!(streams[0].frame_number(), 8);
    }

    #[test]
    fn test_unsupported_mode_surfaces_hardware_error() {
        let device = MockDevice::new(1).rejecting_fourcc(FourCC::Y16);
        let mut handle = SubdeviceHandle::open(&device, 0).expect("claim should succeed");

        assert!(matches!(
            handle.set_mode(&depth_ir_mode(), buffers(2)),
            Err(CameraError::Hardware(HardwareError::FormatNotSupported { .. }))
        ));
    }
}
