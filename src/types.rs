use std::fmt;

/// Declares a C-like enum mirroring one of the SDK's numeric constant tables,
/// with raw-code conversion and a stable kebab-case name.
macro_rules! native_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr => $text:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// Every value in the table, in native order.
            pub const ALL: &'static [$name] = &[$( $name::$variant, )+];

            /// Decode a raw native code. Unknown codes yield `None`.
            pub fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $( v if v == $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            pub fn as_raw(self) -> i32 {
                self as i32
            }

            /// Human readable name used in logs and decorated events.
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.name())
            }
        }
    };
}

native_enum! {
    /// Logical stream kind. `Any` is the wildcard used in lookups, never the
    /// kind of an actual frame.
    pub enum StreamKind {
        Any = 0 => "any",
        Depth = 1 => "depth",
        Color = 2 => "color",
        Infrared = 3 => "infrared",
        Fisheye = 4 => "fisheye",
        Gyro = 5 => "gyro",
        Accel = 6 => "accel",
        Gpio = 7 => "gpio",
        Pose = 8 => "pose",
        Confidence = 9 => "confidence",
    }
}

native_enum! {
    /// Pixel / sample format of a stream.
    pub enum Format {
        Any = 0 => "any",
        Z16 = 1 => "z16",
        Disparity16 = 2 => "disparity16",
        Xyz32f = 3 => "xyz32f",
        Yuyv = 4 => "yuyv",
        Rgb8 = 5 => "rgb8",
        Bgr8 = 6 => "bgr8",
        Rgba8 = 7 => "rgba8",
        Bgra8 = 8 => "bgra8",
        Y8 = 9 => "y8",
        Y16 = 10 => "y16",
        Raw10 = 11 => "raw10",
        Raw16 = 12 => "raw16",
        Raw8 = 13 => "raw8",
        Uyvy = 14 => "uyvy",
        MotionRaw = 15 => "motion-raw",
        MotionXyz32f = 16 => "motion-xyz32f",
        GpioRaw = 17 => "gpio-raw",
        SixDof = 18 => "6dof",
        Disparity32 = 19 => "disparity32",
        Y10Bpack = 20 => "y10bpack",
        Distance = 21 => "distance",
        Mjpeg = 22 => "mjpeg",
        Y8i = 23 => "y8i",
        Y12i = 24 => "y12i",
        Inzi = 25 => "inzi",
        Invi = 26 => "invi",
        W10 = 27 => "w10",
    }
}

impl Format {
    /// Bits per pixel for video formats, `None` for non-image payloads.
    pub fn bits_per_pixel(self) -> Option<u32> {
        match self {
            Format::Y8 | Format::Raw8 | Format::Y8i | Format::Invi => Some(8),
            Format::Z16
            | Format::Disparity16
            | Format::Yuyv
            | Format::Uyvy
            | Format::Y16
            | Format::Raw16
            | Format::Raw10
            | Format::Y10Bpack
            | Format::W10
            | Format::Inzi => Some(16),
            Format::Rgb8 | Format::Bgr8 | Format::Y12i => Some(24),
            Format::Rgba8 | Format::Bgra8 | Format::Disparity32 | Format::Distance => Some(32),
            Format::Xyz32f => Some(96),
            _ => None,
        }
    }
}

native_enum! {
    /// Camera information fields exposed by devices and sensors.
    pub enum CameraInfo {
        Name = 0 => "name",
        SerialNumber = 1 => "serial-number",
        FirmwareVersion = 2 => "firmware-version",
        RecommendedFirmwareVersion = 3 => "recommended-firmware-version",
        PhysicalPort = 4 => "physical-port",
        DebugOpCode = 5 => "debug-op-code",
        AdvancedMode = 6 => "advanced-mode",
        ProductId = 7 => "product-id",
        CameraLocked = 8 => "camera-locked",
        UsbTypeDescriptor = 9 => "usb-type-descriptor",
        ProductLine = 10 => "product-line",
        AsicSerialNumber = 11 => "asic-serial-number",
        FirmwareUpdateId = 12 => "firmware-update-id",
    }
}

native_enum! {
    /// Sensor options. Named `SensorOption` to stay clear of `std::option::Option`.
    pub enum SensorOption {
        BacklightCompensation = 0 => "backlight-compensation",
        Brightness = 1 => "brightness",
        Contrast = 2 => "contrast",
        Exposure = 3 => "exposure",
        Gain = 4 => "gain",
        Gamma = 5 => "gamma",
        Hue = 6 => "hue",
        Saturation = 7 => "saturation",
        Sharpness = 8 => "sharpness",
        WhiteBalance = 9 => "white-balance",
        EnableAutoExposure = 10 => "enable-auto-exposure",
        EnableAutoWhiteBalance = 11 => "enable-auto-white-balance",
        VisualPreset = 12 => "visual-preset",
        LaserPower = 13 => "laser-power",
        Accuracy = 14 => "accuracy",
        MotionRange = 15 => "motion-range",
        FilterOption = 16 => "filter-option",
        ConfidenceThreshold = 17 => "confidence-threshold",
        EmitterEnabled = 18 => "emitter-enabled",
        FramesQueueSize = 19 => "frames-queue-size",
        TotalFrameDrops = 20 => "total-frame-drops",
        AutoExposureMode = 21 => "auto-exposure-mode",
        PowerLineFrequency = 22 => "power-line-frequency",
        AsicTemperature = 23 => "asic-temperature",
        ErrorPollingEnabled = 24 => "error-polling-enabled",
        ProjectorTemperature = 25 => "projector-temperature",
        OutputTriggerEnabled = 26 => "output-trigger-enabled",
        MotionModuleTemperature = 27 => "motion-module-temperature",
        DepthUnits = 28 => "depth-units",
        EnableMotionCorrection = 29 => "enable-motion-correction",
        AutoExposurePriority = 30 => "auto-exposure-priority",
        ColorScheme = 31 => "color-scheme",
        HistogramEqualizationEnabled = 32 => "histogram-equalization-enabled",
        MinDistance = 33 => "min-distance",
        MaxDistance = 34 => "max-distance",
        TextureSource = 35 => "texture-source",
        FilterMagnitude = 36 => "filter-magnitude",
        FilterSmoothAlpha = 37 => "filter-smooth-alpha",
        FilterSmoothDelta = 38 => "filter-smooth-delta",
        HolesFill = 39 => "holes-fill",
        StereoBaseline = 40 => "stereo-baseline",
        AutoExposureConvergeStep = 41 => "auto-exposure-converge-step",
        InterCamSyncMode = 42 => "inter-cam-sync-mode",
        StreamFilter = 43 => "stream-filter",
        StreamFormatFilter = 44 => "stream-format-filter",
        StreamIndexFilter = 45 => "stream-index-filter",
        EmitterOnOff = 46 => "emitter-on-off",
        ZeroOrderPointX = 47 => "zero-order-point-x",
        ZeroOrderPointY = 48 => "zero-order-point-y",
        LldTemperature = 49 => "lld-temperature",
        McTemperature = 50 => "mc-temperature",
        MaTemperature = 51 => "ma-temperature",
        HardwarePreset = 52 => "hardware-preset",
        GlobalTimeEnabled = 53 => "global-time-enabled",
        ApdTemperature = 54 => "apd-temperature",
        EnableMapping = 55 => "enable-mapping",
        EnableRelocalization = 56 => "enable-relocalization",
        EnablePoseJumping = 57 => "enable-pose-jumping",
        EnableDynamicCalibration = 58 => "enable-dynamic-calibration",
        DepthOffset = 59 => "depth-offset",
        LedPower = 60 => "led-power",
        ZeroOrderEnabled = 61 => "zero-order-enabled",
        EnableMapPreservation = 62 => "enable-map-preservation",
    }
}

native_enum! {
    /// Severity attached to log messages and sensor notifications.
    pub enum LogSeverity {
        Debug = 0 => "debug",
        Info = 1 => "info",
        Warn = 2 => "warn",
        Error = 3 => "error",
        Fatal = 4 => "fatal",
        None = 5 => "none",
    }
}

native_enum! {
    pub enum NotificationCategory {
        FramesTimeout = 0 => "frames-timeout",
        FrameCorrupted = 1 => "frame-corrupted",
        HardwareError = 2 => "hardware-error",
        HardwareEvent = 3 => "hardware-event",
        UnknownError = 4 => "unknown-error",
        FirmwareUpdateRecommended = 5 => "firmware-update-recommended",
        PoseRelocalization = 6 => "pose-relocalization",
    }
}

native_enum! {
    /// Per-frame metadata attributes.
    pub enum FrameMetadata {
        FrameCounter = 0 => "frame-counter",
        FrameTimestamp = 1 => "frame-timestamp",
        SensorTimestamp = 2 => "sensor-timestamp",
        ActualExposure = 3 => "actual-exposure",
        GainLevel = 4 => "gain-level",
        AutoExposure = 5 => "auto-exposure",
        WhiteBalance = 6 => "white-balance",
        TimeOfArrival = 7 => "time-of-arrival",
        Temperature = 8 => "temperature",
        BackendTimestamp = 9 => "backend-timestamp",
        ActualFps = 10 => "actual-fps",
        FrameLaserPower = 11 => "frame-laser-power",
        FrameLaserPowerMode = 12 => "frame-laser-power-mode",
        ExposurePriority = 13 => "exposure-priority",
    }
}

native_enum! {
    /// Clock a frame timestamp was taken from.
    pub enum TimestampDomain {
        HardwareClock = 0 => "hardware-clock",
        SystemTime = 1 => "system-time",
        GlobalTime = 2 => "global-time",
    }
}

/// Identifies one logical stream among those enabled in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub index: i32,
}

impl StreamKey {
    pub const fn new(kind: StreamKind, index: i32) -> Self {
        Self { kind, index }
    }

    pub fn is_wildcard(&self) -> bool {
        self.kind == StreamKind::Any
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// How a requested stream index is compared with a frame's actual index.
///
/// The SDK convention is that index 0 means "no index supplied". That is
/// ambiguous when a device streams the same kind at index 0 and 1, so the
/// strict mode exists; the permissive mode stays the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMatch {
    /// A requested index of 0 accepts any index.
    #[default]
    ZeroMatchesAny,
    /// Indices must be equal.
    Exact,
}

impl IndexMatch {
    pub fn matches(self, requested: i32, actual: i32) -> bool {
        match self {
            IndexMatch::ZeroMatchesAny => requested == 0 || requested == actual,
            IndexMatch::Exact => requested == actual,
        }
    }
}

bitflags::bitflags! {
    /// Extensions a native frame can be viewed as.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameCapabilities: u32 {
        const VIDEO     = 1 << 0;
        const DEPTH     = 1 << 1;
        const DISPARITY = 1 << 2;
        const MOTION    = 1 << 3;
        const POSE      = 1 << 4;
        const COMPOSITE = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Extensions a native sensor supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SensorCapabilities: u32 {
        const DEPTH = 1 << 0;
        const ROI   = 1 << 1;
    }
}

/// Stream profile fields read once from the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfileData {
    pub kind: StreamKind,
    pub format: Format,
    pub index: i32,
    pub unique_id: i32,
    pub fps: u32,
    pub is_default: bool,
    /// `(width, height)` when the profile is a video profile.
    pub video_size: Option<(u32, u32)>,
    pub is_motion: bool,
}

impl StreamProfileData {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.kind, self.index)
    }
}

/// Pinhole camera intrinsics of a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    pub ppx: f32,
    pub ppy: f32,
    pub fx: f32,
    pub fy: f32,
    pub model: i32,
    pub coeffs: [f32; 5],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionIntrinsics {
    /// Scale and bias, row-major 3x4.
    pub data: [[f32; 4]; 3],
    pub noise_variances: [f32; 3],
    pub bias_variances: [f32; 3],
}

/// Rigid transform between two streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    /// Column-major 3x3 rotation.
    pub rotation: [f32; 9],
    /// Translation in meters.
    pub translation: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub default: f32,
}

impl OptionRange {
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionOfInterest {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

/// Common per-frame fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub number: u64,
    /// Milliseconds.
    pub timestamp: f64,
    pub domain: TimestampDomain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bits_per_pixel: u32,
}

/// 6DOF pose sample carried by pose frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseData {
    pub translation: [f32; 3],
    pub velocity: [f32; 3],
    pub acceleration: [f32; 3],
    /// Quaternion `[x, y, z, w]`.
    pub rotation: [f32; 4],
    pub angular_velocity: [f32; 3],
    pub angular_acceleration: [f32; 3],
    pub tracker_confidence: u32,
    pub mapper_confidence: u32,
}

/// Notification payload as the SDK delivers it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub description: String,
    pub timestamp: f64,
    pub severity: i32,
    pub category: i32,
    pub serialized_data: String,
}

/// Sensor notification with severity and category decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub description: String,
    pub timestamp: f64,
    pub severity: Option<LogSeverity>,
    pub category: Option<NotificationCategory>,
    pub serialized_data: String,
}

impl From<RawNotification> for Notification {
    fn from(raw: RawNotification) -> Self {
        Notification {
            severity: LogSeverity::from_raw(raw.severity),
            category: NotificationCategory::from_raw(raw.category),
            description: raw.description,
            timestamp: raw.timestamp,
            serialized_data: raw.serialized_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_round_trip_through_table() {
        for kind in StreamKind::ALL {
            assert_eq!(StreamKind::from_raw(kind.as_raw()), Some(*kind));
        }
        assert_eq!(StreamKind::from_raw(42), None);
        assert_eq!(SensorOption::from_raw(28), Some(SensorOption::DepthUnits));
    }

    #[test]
    fn test_index_match_policies() {
        assert!(IndexMatch::ZeroMatchesAny.matches(0, 2));
        assert!(IndexMatch::ZeroMatchesAny.matches(1, 1));
        assert!(!IndexMatch::ZeroMatchesAny.matches(1, 2));
        assert!(!IndexMatch::Exact.matches(0, 1));
        assert!(IndexMatch::Exact.matches(0, 0));
    }

    #[test]
    fn test_notification_decoration() {
        let n: Notification = RawNotification {
            description: "frames didn't arrive".into(),
            timestamp: 12.5,
            severity: 2,
            category: 0,
            serialized_data: String::new(),
        }
        .into();
        assert_eq!(n.severity, Some(LogSeverity::Warn));
        assert_eq!(n.category, Some(NotificationCategory::FramesTimeout));
        assert_eq!(n.category.map(|c| c.name()), Some("frames-timeout"));

        let n: Notification = RawNotification {
            description: String::new(),
            timestamp: 0.0,
            severity: 99,
            category: -1,
            serialized_data: String::new(),
        }
        .into();
        assert_eq!(n.severity, None);
        assert_eq!(n.category, None);
    }

    #[test]
    fn test_format_bits_per_pixel() {
        assert_eq!(Format::Z16.bits_per_pixel(), Some(16));
        assert_eq!(Format::Rgb8.bits_per_pixel(), Some(24));
        assert_eq!(Format::MotionXyz32f.bits_per_pixel(), None);
    }

    #[test]
    fn test_stream_key_display() {
        assert_eq!(StreamKey::new(StreamKind::Infrared, 2).to_string(), "infrared:2");
        assert!(StreamKey::new(StreamKind::Any, 0).is_wildcard());
    }
}
