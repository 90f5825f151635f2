//! Core types and transport traits shared by the streaming core.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::calibration::Calibration;
use crate::error::Result;

/// A logical data stream the camera can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Per-pixel range data.
    Depth,
    /// Visible-light color image.
    Color,
    /// Infrared image (left imager on stereo models).
    Infrared,
    /// Second infrared image (right imager on stereo models).
    Infrared2,
}

impl Stream {
    /// Every logical stream, in slot order.
    pub const ALL: [Self; 4] = [Self::Depth, Self::Color, Self::Infrared, Self::Infrared2];

    /// Lower-case name used in catalogs and on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::Color => "color",
            Self::Infrared => "infrared",
            Self::Infrared2 => "infrared2",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stream| stream.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stream '{s}'"))
    }
}

/// Named shortcut resolving to a concrete [`StreamRequest`] in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Best overall image quality.
    BestQuality,
    /// Largest resolution the stream supports.
    LargestImage,
    /// Highest framerate the stream supports.
    HighestFramerate,
}

impl Preset {
    const ALL: [Self; 3] = [Self::BestQuality, Self::LargestImage, Self::HighestFramerate];

    /// Kebab-case name used in catalogs and on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::BestQuality => "best-quality",
            Self::LargestImage => "largest-image",
            Self::HighestFramerate => "highest-framerate",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown preset '{s}'"))
    }
}

/// Pixel format of a decoded per-stream image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 16-bit linear depth values.
    Z16,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 24-bit RGB.
    Rgb8,
    /// 24-bit BGR.
    Bgr8,
    /// 32-bit RGBA.
    Rgba8,
    /// 32-bit BGRA.
    Bgra8,
    /// 8-bit luminance.
    Y8,
    /// 16-bit luminance.
    Y16,
}

impl PixelFormat {
    const ALL: [Self; 8] = [
        Self::Z16,
        Self::Yuyv,
        Self::Rgb8,
        Self::Bgr8,
        Self::Rgba8,
        Self::Bgra8,
        Self::Y8,
        Self::Y16,
    ];

    /// Lower-case name used in catalogs and on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Z16 => "z16",
            Self::Yuyv => "yuyv",
            Self::Rgb8 => "rgb8",
            Self::Bgr8 => "bgr8",
            Self::Rgba8 => "rgba8",
            Self::Bgra8 => "bgra8",
            Self::Y8 => "y8",
            Self::Y16 => "y16",
        }
    }

    /// Bytes occupied by one pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Y8 => 1,
            Self::Z16 | Self::Yuyv | Self::Y16 => 2,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::Rgba8 | Self::Bgra8 => 4,
        }
    }

    /// Size in bytes of a `width` x `height` image in this format.
    pub const fn image_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pixel format '{s}'"))
    }
}

/// Hardware (wire) pixel format a subdevice is programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// 16-bit greyscale, used by depth units.
    pub const Y16: Self = Self::new(b"Y16 ");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// Packed 24-bit RGB.
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl TryFrom<String> for FourCC {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let bytes = value.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(format!("fourcc '{value}' must be 1 to 4 characters"));
        }
        let mut code = *b"    ";
        for (slot, byte) in code.iter_mut().zip(bytes) {
            *slot = *byte;
        }
        Ok(Self(code))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

const fn default_enabled() -> bool {
    true
}

/// What the caller wants from one logical stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StreamRequest {
    /// Whether the stream should be delivered at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Decoded pixel format.
    pub format: PixelFormat,
    /// Frames per second.
    pub fps: u32,
}

impl StreamRequest {
    /// An enabled request for the given resolution, format and framerate.
    #[must_use]
    pub const fn new(width: u32, height: u32, format: PixelFormat, fps: u32) -> Self {
        Self {
            enabled: true,
            width,
            height,
            format,
            fps,
        }
    }

    /// Whether `mode` delivers exactly what this request asks for.
    pub fn is_satisfied_by(&self, mode: &StreamMode) -> bool {
        self.enabled
            && self.width == mode.width
            && self.height == mode.height
            && self.format == mode.format
            && self.fps == mode.fps
    }
}

/// One stream as delivered by a particular hardware mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StreamMode {
    /// Logical stream this mode delivers.
    pub stream: Stream,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Decoded pixel format.
    pub format: PixelFormat,
    /// Frames per second.
    pub fps: u32,
    /// Index into [`Calibration::intrinsics`].
    #[serde(rename = "intrinsics")]
    pub intrinsics_index: usize,
}

impl StreamMode {
    /// Size in bytes of one decoded image.
    pub const fn image_size(&self) -> usize {
        self.format.image_size(self.width, self.height)
    }
}

/// A decoded image together with its hardware frame number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    /// Decoded pixel data.
    pub pixels: Vec<u8>,
    /// Frame sequence number stamped by the frame-number decoder, 0 if none.
    pub number: u32,
}

impl Image {
    /// Get RGB values for a pixel of a YUYV image.
    ///
    /// Returns `None` if the coordinates fall outside the pixel data. For odd
    /// `x` the second luma sample of the pair is used with the shared chroma.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
        // YUYV: [Y0 U Y1 V] per pair of pixels
        let pair_x = x & !1;
        let offset = (y as usize * width as usize + pair_x as usize) * 2;

        let quad = self.pixels.get(offset..offset + 4)?;
        let (y_val, u, v) = match quad {
            [y0, u, y1, v] => (if x % 2 == 0 { *y0 } else { *y1 }, *u, *v),
            _ => return None,
        };

        Some(yuv_to_rgb(y_val, u, v))
    }
}

/// Convert YUV values to RGB using the ITU-R BT.601 formula.
#[must_use]
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

/// Callback invoked by the transport for every raw frame a subdevice delivers.
pub type FrameCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Exclusive hardware session on one physical capture unit.
pub trait SubdeviceSession: Send {
    /// Program the unit's capture mode.
    fn set_mode(&mut self, width: u32, height: u32, fourcc: FourCC, fps: u32) -> Result<()>;

    /// Begin delivering raw frames to `callback`.
    ///
    /// The transport may keep the callback alive after the session that
    /// registered it is gone.
    fn start_streaming(&mut self, callback: FrameCallback) -> Result<()>;

    /// Halt frame delivery. Must be safe to call when not streaming.
    fn stop_streaming(&mut self);
}

/// A multi-unit camera device as seen by the streaming core.
pub trait CaptureDevice {
    /// Session type returned by [`CaptureDevice::claim_subdevice`].
    type Session: SubdeviceSession;

    /// Open exclusive access to the unit at `index`.
    fn claim_subdevice(&self, index: usize) -> Result<Self::Session>;

    /// Tell the hardware which streams are about to start.
    ///
    /// Issued once per `start_capture`, through the first opened session.
    fn set_stream_intent(&self, _first: &Self::Session, _streams: &[Stream]) -> Result<()> {
        Ok(())
    }

    /// Read the camera's calibration through the first opened session.
    fn retrieve_calibration(&self, first: &Self::Session) -> Result<Calibration>;
}
