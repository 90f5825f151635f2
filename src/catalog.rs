//! Static per-model camera catalog: supported modes, presets and constraints.
//!
//! A catalog is plain data. It is normally loaded from a TOML document:
//!
//! ```toml
//! name = "dual-uvc"
//!
//! [streams]
//! color = 0
//! depth = 1
//!
//! [presets.color.best-quality]
//! width = 640
//! height = 480
//! format = "yuyv"
//! fps = 30
//!
//! [[mode]]
//! subdevice = 0
//! width = 640
//! height = 480
//! fourcc = "YUYV"
//! fps = 30
//! streams = [{ stream = "color", width = 640, height = 480, format = "yuyv", fps = 30, intrinsics = 0 }]
//!
//! [[constraint]]
//! a = "depth"
//! b = "infrared"
//! property = "fps"
//! action = "propagate"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::calibration::Calibration;
use crate::traits::{FourCC, Preset, Stream, StreamMode, StreamRequest};

/// Error loading a catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The file could not be read.
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not a valid catalog.
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    /// Modes, presets and routing disagree.
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Why a raw frame could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    /// The raw frame is smaller than the images it must fill.
    #[error("raw frame holds {actual} bytes, {expected} needed")]
    ShortFrame {
        /// Bytes needed.
        expected: usize,
        /// Bytes delivered.
        actual: usize,
    },

    /// The unpacker cannot fill this many destinations.
    #[error("unpacker fills {expected} streams, {actual} destinations given")]
    DestinationMismatch {
        /// Destinations the unpacker supports.
        expected: usize,
        /// Destinations given.
        actual: usize,
    },
}

/// Decodes one raw frame into one destination image per stream of the mode.
pub type UnpackFn =
    fn(&mut [&mut [u8]], &SubdeviceMode, &[u8]) -> std::result::Result<(), UnpackError>;

/// Decodes the hardware frame sequence number from a raw frame.
pub type FrameNumberFn = fn(&SubdeviceMode, &[u8]) -> Option<u32>;

/// How a raw frame becomes per-stream images.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unpacker {
    /// The raw frame is the single stream's image.
    Passthrough,
    /// The raw frame is every stream's image back to back, in mode order.
    #[default]
    Planar,
    /// Model-specific decoder supplied by code.
    #[serde(skip)]
    Custom(UnpackFn),
}

impl Unpacker {
    /// Decode `frame` into `dest`, one slice per stream of `mode`.
    pub fn unpack(
        self,
        dest: &mut [&mut [u8]],
        mode: &SubdeviceMode,
        frame: &[u8],
    ) -> std::result::Result<(), UnpackError> {
        match self {
            Self::Passthrough => {
                let [image] = dest else {
                    return Err(UnpackError::DestinationMismatch {
                        expected: 1,
                        actual: dest.len(),
                    });
                };
                let source = frame.get(..image.len()).ok_or(UnpackError::ShortFrame {
                    expected: image.len(),
                    actual: frame.len(),
                })?;
                image.copy_from_slice(source);
                Ok(())
            }
            Self::Planar => {
                let expected: usize = dest.iter().map(|image| image.len()).sum();
                if frame.len() < expected {
                    return Err(UnpackError::ShortFrame {
                        expected,
                        actual: frame.len(),
                    });
                }
                let mut rest = frame;
                for image in dest.iter_mut() {
                    let (plane, tail) = rest.split_at(image.len());
                    image.copy_from_slice(plane);
                    rest = tail;
                }
                Ok(())
            }
            Self::Custom(unpack) => unpack(dest, mode, frame),
        }
    }
}

/// How the hardware frame number is recovered from a raw frame.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameNumberDecoder {
    /// Little-endian `u32` in the last four bytes of the raw frame.
    TrailingU32Le,
    /// Model-specific decoder supplied by code.
    #[serde(skip)]
    Custom(FrameNumberFn),
}

impl FrameNumberDecoder {
    /// Decode the frame number, `None` if the frame is too short.
    pub fn decode(self, mode: &SubdeviceMode, frame: &[u8]) -> Option<u32> {
        match self {
            Self::TrailingU32Le => {
                let start = frame.len().checked_sub(4)?;
                let bytes: [u8; 4] = frame.get(start..)?.try_into().ok()?;
                Some(u32::from_le_bytes(bytes))
            }
            Self::Custom(decode) => decode(mode, frame),
        }
    }
}

/// One hardware configuration of a subdevice and the streams it delivers.
#[derive(Debug, Clone, Deserialize)]
pub struct SubdeviceMode {
    /// Index of the subdevice this mode programs.
    pub subdevice: usize,
    /// Wire width.
    pub width: u32,
    /// Wire height.
    pub height: u32,
    /// Wire pixel format.
    pub fourcc: FourCC,
    /// Wire framerate.
    pub fps: u32,
    /// Streams delivered, in unpack order.
    pub streams: Vec<StreamMode>,
    /// Raw frame decoder.
    #[serde(default)]
    pub unpacker: Unpacker,
    /// Optional frame-number decoder.
    #[serde(default)]
    pub frame_number: Option<FrameNumberDecoder>,
}

/// Property two streams must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstrainedProperty {
    /// Frames per second.
    Fps,
    /// Width and height.
    Resolution,
    /// Pixel format.
    Format,
}

impl ConstrainedProperty {
    /// Name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fps => "fps",
            Self::Resolution => "resolution",
            Self::Format => "format",
        }
    }
}

/// What to do when two enabled streams disagree on a constrained property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintAction {
    /// Fail configuration.
    #[default]
    Reject,
    /// Overwrite `b`'s value with `a`'s.
    Propagate,
}

/// Cross-stream rule applied before any mode is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InterstreamConstraint {
    /// Leading stream.
    pub a: Stream,
    /// Constrained stream.
    pub b: Stream,
    /// Property that must match.
    pub property: ConstrainedProperty,
    /// Resolution when it does not.
    #[serde(default)]
    pub action: ConstraintAction,
}

/// Everything the core knows statically about a camera model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraInfo {
    /// Model name.
    pub name: String,
    /// Subdevice serving each supported stream.
    #[serde(default, rename = "streams")]
    pub stream_subdevices: BTreeMap<Stream, usize>,
    /// Named presets per stream.
    #[serde(default)]
    pub presets: BTreeMap<Stream, BTreeMap<Preset, StreamRequest>>,
    /// Candidate modes, in preference order.
    #[serde(default, rename = "mode")]
    pub subdevice_modes: Vec<SubdeviceMode>,
    /// Interstream constraints, applied in order.
    #[serde(default, rename = "constraint")]
    pub constraints: Vec<InterstreamConstraint>,
    /// Factory calibration for transports that cannot read it from hardware.
    #[serde(default)]
    pub calibration: Option<Calibration>,
}

impl CameraInfo {
    /// Loads a catalog from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads a catalog from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let info: Self = toml::from_str(content)?;
        info.validate()?;
        Ok(info)
    }

    /// Checks that modes and presets agree with the stream routing
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (i, mode) in self.subdevice_modes.iter().enumerate() {
            if mode.streams.is_empty() {
                return Err(CatalogError::Invalid(format!("mode {i} delivers no streams")));
            }
            for stream_mode in &mode.streams {
                if self.subdevice_for(stream_mode.stream) != Some(mode.subdevice) {
                    return Err(CatalogError::Invalid(format!(
                        "mode {i} delivers {} on subdevice {}, which does not serve it",
                        stream_mode.stream, mode.subdevice
                    )));
                }
            }
        }

        for stream in self.presets.keys() {
            if self.subdevice_for(*stream).is_none() {
                return Err(CatalogError::Invalid(format!(
                    "presets given for unrouted stream {stream}"
                )));
            }
        }

        Ok(())
    }

    /// Subdevice serving `stream`, if the model supports it.
    pub fn subdevice_for(&self, stream: Stream) -> Option<usize> {
        self.stream_subdevices.get(&stream).copied()
    }

    /// The request a preset resolves to, if the model defines it.
    pub fn preset(&self, stream: Stream, preset: Preset) -> Option<StreamRequest> {
        self.presets
            .get(&stream)?
            .get(&preset)
            .copied()
            .filter(|request| request.enabled)
    }

    /// Number of subdevice slots: one past the highest index any mode uses.
    pub fn subdevice_count(&self) -> usize {
        self.subdevice_modes
            .iter()
            .map(|mode| mode.subdevice + 1)
            .max()
            .unwrap_or(0)
    }

    /// Candidate modes for `subdevice`, in catalog order.
    pub fn modes_for(&self, subdevice: usize) -> impl Iterator<Item = &SubdeviceMode> {
        self.subdevice_modes
            .iter()
            .filter(move |mode| mode.subdevice == subdevice)
    }
}
