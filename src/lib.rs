//! Multicam-Stream: streaming core for multi-sensor cameras
//!
//! A camera exposes several logical streams (depth, color, infrared) over a
//! handful of physical subdevices. This library negotiates per-subdevice
//! modes from a static catalog, owns the subdevices' lifecycle, and hands the
//! newest image of every stream to the consumer through a lock-light triple
//! buffer. Transports sit behind [`traits::CaptureDevice`], so the same
//! session runs against V4L2 hardware or a mock.

pub mod calibration;
pub mod catalog;
pub mod device;
pub mod error;
pub mod negotiator;
pub mod session;
pub mod stream_buffer;
pub mod subdevice;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use catalog::CameraInfo;
pub use device::V4L2Device;
pub use error::{CameraError, ConfigurationError, HardwareError, Result, StateError};
pub use session::CameraSession;
pub use traits::{CaptureDevice, FourCC, Image, PixelFormat, Preset, Stream, StreamMode};
