//! Error taxonomy for camera operations.

use thiserror::Error;

use crate::traits::{FourCC, Preset, Stream};

/// The requested stream configuration cannot be honored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Streams cannot change once a subdevice has been opened.
    #[error("streams cannot be reconfigured after the camera has been configured")]
    AlreadyConfigured,

    /// The camera model has no subdevice serving this stream.
    #[error("unsupported stream: {0}")]
    UnsupportedStream(Stream),

    /// The camera model defines no such preset for this stream.
    #[error("unsupported preset {preset} for stream {stream}")]
    UnsupportedPreset {
        /// Stream the preset was requested for.
        stream: Stream,
        /// Requested preset.
        preset: Preset,
    },

    /// No catalog mode satisfies the enabled requests routed to a subdevice.
    #[error("subdevice {subdevice} cannot provide {requested}")]
    NoMatchingMode {
        /// Subdevice index.
        subdevice: usize,
        /// Human-readable list of the unsatisfied requests.
        requested: String,
    },

    /// An interstream constraint rejected the requested combination.
    #[error("streams {a} and {b} must share the same {property}")]
    ConstraintViolated {
        /// First constrained stream.
        a: Stream,
        /// Second constrained stream.
        b: Stream,
        /// Name of the property that differs.
        property: &'static str,
    },

    /// A subdevice mode was paired with the wrong number of stream buffers.
    #[error("mode delivers {expected} streams but {actual} buffers were supplied")]
    StreamCountMismatch {
        /// Streams in the mode.
        expected: usize,
        /// Buffers supplied.
        actual: usize,
    },

    /// Capture was started with no stream enabled.
    #[error("no streams enabled")]
    NoStreamsEnabled,
}

/// The session is not in a state that can answer the query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The stream was never enabled or never received a buffer.
    #[error("stream not enabled: {0}")]
    StreamNotEnabled(Stream),

    /// Calibration has not been fetched yet.
    #[error("calibration not available")]
    CalibrationUnavailable,

    /// The calibration has no intrinsics at the mode's index.
    #[error("no intrinsics at index {index} for stream {stream}")]
    MissingIntrinsics {
        /// Stream queried.
        stream: Stream,
        /// Index the stream's mode refers to.
        index: usize,
    },

    /// The calibration has no pose for the stream.
    #[error("no pose for stream {0}")]
    MissingPose(Stream),

    /// Streaming was requested before a mode was programmed.
    #[error("subdevice {0} has no mode set")]
    ModeNotSet(usize),
}

/// Failure reported by the transport.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// No device node backs the subdevice index.
    #[error("subdevice {0} not found")]
    DeviceNotFound(usize),

    /// The subdevice is already claimed.
    #[error("subdevice {0} is busy")]
    Busy(usize),

    /// Opening the device failed.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// The unit refused the requested mode.
    #[error("format not supported: {width}x{height} {fourcc} @ {fps}fps")]
    FormatNotSupported {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
        /// Requested wire format.
        fourcc: FourCC,
        /// Requested framerate.
        fps: u32,
    },

    /// Error while setting up or running a stream.
    #[error("stream error: {0}")]
    StreamError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for camera operations.
#[derive(Error, Debug)]
pub enum CameraError {
    /// See [`ConfigurationError`].
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// See [`StateError`].
    #[error(transparent)]
    State(#[from] StateError),

    /// See [`HardwareError`].
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
