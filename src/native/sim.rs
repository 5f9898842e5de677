//! In-process capture SDK.
//!
//! `SimSdk` implements [`Sdk`] over simulated devices so the managed layer can
//! be driven without hardware. Frames are produced on demand with
//! [`SimSdk::deliver_all`]; hot-plug, sensor notifications and asynchronous
//! errors are raised explicitly. Leak and double-release counters make
//! ownership bugs observable from tests.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use super::{
    DevicesChangedCallback, ErrorCallback, HandleKind, NativeResult, NotificationCallback,
    RawBuffer, RawHandle, Sdk,
};
use crate::config::StreamRequest;
use crate::error::{NativeError, NativeErrorKind};
use crate::types::{
    CameraInfo, Extrinsics, Format, FrameCapabilities, FrameInfo, FrameMetadata, Intrinsics,
    MotionIntrinsics, OptionRange, PoseData, RawNotification, RegionOfInterest,
    SensorCapabilities, SensorOption, StreamKind, StreamProfileData, TimestampDomain,
    VideoFrameInfo,
};

/// A settable sensor option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOption {
    pub value: f32,
    pub range: OptionRange,
    pub read_only: bool,
    pub description: &'static str,
}

impl SimOption {
    pub fn new(value: f32, min: f32, max: f32, step: f32, description: &'static str) -> Self {
        Self {
            value,
            range: OptionRange {
                min,
                max,
                step,
                default: value,
            },
            read_only: false,
            description,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimSensor {
    pub name: String,
    pub capabilities: SensorCapabilities,
    /// Meters per depth unit; only meaningful for depth sensors.
    pub depth_scale: f32,
    pub profiles: Vec<StreamProfileData>,
    pub options: Vec<(SensorOption, SimOption)>,
    pub roi: RegionOfInterest,
}

fn find_option(options: &[(SensorOption, SimOption)], option: SensorOption) -> Option<&SimOption> {
    options.iter().find(|(o, _)| *o == option).map(|(_, v)| v)
}

fn find_option_mut(options: &mut [(SensorOption, SimOption)], option: SensorOption) -> Option<&mut SimOption> {
    options
        .iter_mut()
        .find(|(o, _)| *o == option)
        .map(|(_, v)| v)
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub serial: String,
    pub firmware: String,
    pub product_line: String,
    pub sensors: Vec<SimSensor>,
}

#[allow(clippy::too_many_arguments)]
fn video_profile(
    kind: StreamKind,
    format: Format,
    index: i32,
    unique_id: i32,
    width: u32,
    height: u32,
    fps: u32,
    is_default: bool,
) -> StreamProfileData {
    StreamProfileData {
        kind,
        format,
        index,
        unique_id,
        fps,
        is_default,
        video_size: Some((width, height)),
        is_motion: false,
    }
}

fn motion_profile(kind: StreamKind, format: Format, unique_id: i32, fps: u32) -> StreamProfileData {
    StreamProfileData {
        kind,
        format,
        index: 0,
        unique_id,
        fps,
        is_default: true,
        video_size: None,
        is_motion: kind != StreamKind::Pose,
    }
}

impl SimDevice {
    /// Stereo depth camera: a depth sensor with depth and two infrared
    /// streams, and an RGB sensor.
    pub fn d400(serial: &str) -> Self {
        let stereo = SimSensor {
            name: "Stereo Module".into(),
            capabilities: SensorCapabilities::DEPTH | SensorCapabilities::ROI,
            depth_scale: 0.001,
            profiles: vec![
                video_profile(StreamKind::Depth, Format::Z16, 0, 1, 640, 480, 30, true),
                video_profile(StreamKind::Depth, Format::Z16, 0, 2, 1280, 720, 30, false),
                video_profile(StreamKind::Infrared, Format::Y8, 1, 3, 640, 480, 30, true),
                video_profile(StreamKind::Infrared, Format::Y8, 2, 4, 640, 480, 30, true),
            ],
            options: vec![
                (SensorOption::Exposure, SimOption::new(8500.0, 1.0, 165000.0, 1.0, "Depth exposure (usec)")),
                (SensorOption::Gain, SimOption::new(16.0, 16.0, 248.0, 1.0, "UVC image gain")),
                (SensorOption::LaserPower, SimOption::new(150.0, 0.0, 360.0, 30.0, "Manual laser power in mw")),
                (SensorOption::EmitterEnabled, SimOption::new(1.0, 0.0, 2.0, 1.0, "Emitter select")),
                (SensorOption::VisualPreset, SimOption::new(1.0, 0.0, 5.0, 1.0, "Advanced-mode preset")),
                (SensorOption::DepthUnits, SimOption::new(0.001, 0.000001, 0.01, 0.000001, "Number of meters represented by a single depth unit")),
                (SensorOption::AsicTemperature, SimOption::new(35.0, -40.0, 125.0, 0.0, "Current Asic Temperature (degree celsius)").read_only()),
            ],
            roi: RegionOfInterest {
                min_x: 0,
                min_y: 0,
                max_x: 639,
                max_y: 479,
            },
        };
        let rgb = SimSensor {
            name: "RGB Camera".into(),
            capabilities: SensorCapabilities::ROI,
            depth_scale: 0.0,
            profiles: vec![
                video_profile(StreamKind::Color, Format::Rgb8, 0, 5, 640, 480, 30, true),
                video_profile(StreamKind::Color, Format::Rgb8, 0, 6, 1920, 1080, 30, false),
            ],
            options: vec![
                (SensorOption::Brightness, SimOption::new(0.0, -64.0, 64.0, 1.0, "UVC image brightness")),
                (SensorOption::EnableAutoExposure, SimOption::new(1.0, 0.0, 1.0, 1.0, "Enable / disable auto-exposure")),
            ],
            roi: RegionOfInterest::default(),
        };
        Self {
            name: "Intel RealSense D435".into(),
            serial: serial.into(),
            firmware: "5.16.0.1".into(),
            product_line: "D400".into(),
            sensors: vec![stereo, rgb],
        }
    }

    /// Tracking camera with gyro, accelerometer and 6DOF pose streams.
    pub fn tracking(serial: &str) -> Self {
        let tracking = SimSensor {
            name: "Tracking Module".into(),
            capabilities: SensorCapabilities::empty(),
            depth_scale: 0.0,
            profiles: vec![
                motion_profile(StreamKind::Gyro, Format::MotionXyz32f, 10, 200),
                motion_profile(StreamKind::Accel, Format::MotionXyz32f, 11, 62),
                motion_profile(StreamKind::Pose, Format::SixDof, 12, 200),
            ],
            options: vec![
                (SensorOption::EnableMapping, SimOption::new(1.0, 0.0, 1.0, 1.0, "Use an on device map")),
                (SensorOption::EnableRelocalization, SimOption::new(1.0, 0.0, 1.0, 1.0, "Use appearance based relocalization")),
            ],
            roi: RegionOfInterest::default(),
        };
        Self {
            name: "Intel RealSense T265".into(),
            serial: serial.into(),
            firmware: "0.2.0.951".into(),
            product_line: "T200".into(),
            sensors: vec![tracking],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stream {
    sensor: usize,
    data: StreamProfileData,
}

#[derive(Clone)]
struct SimFrame {
    profile: StreamProfileData,
    device: u64,
    sensor: usize,
    number: u64,
    timestamp: f64,
    caps: FrameCapabilities,
    video: Option<VideoFrameInfo>,
    depth_scale: f32,
    payload: Vec<u8>,
    motion: [f32; 3],
    pose: PoseData,
}

type Bundle = Vec<Arc<SimFrame>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Align(StreamKind),
    Colorizer,
    Syncer,
}

enum Output {
    Frame(Arc<SimFrame>),
    Composite(Bundle),
}

impl Output {
    fn into_object(self) -> Object {
        match self {
            Output::Frame(f) => Object::Frame(f),
            Output::Composite(frames) => Object::Composite(frames),
        }
    }
}

struct SimBlock {
    kind: BlockKind,
    options: Vec<(SensorOption, SimOption)>,
    /// Newest frame of each stream seen by a syncer.
    latest: Bundle,
    tx: Sender<Output>,
    rx: Receiver<Output>,
}

impl SimBlock {
    fn new(kind: BlockKind) -> Self {
        let options = match kind {
            BlockKind::Colorizer => vec![
                (SensorOption::ColorScheme, SimOption::new(0.0, 0.0, 9.0, 1.0, "Color scheme for data visualization")),
                (SensorOption::HistogramEqualizationEnabled, SimOption::new(1.0, 0.0, 1.0, 1.0, "Perform histogram equalization")),
                (SensorOption::MinDistance, SimOption::new(0.0, 0.0, 16.0, 0.1, "Minimum distance in meters")),
                (SensorOption::MaxDistance, SimOption::new(6.0, 0.0, 16.0, 0.1, "Maximum distance in meters")),
            ],
            BlockKind::Align(_) | BlockKind::Syncer => Vec::new(),
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            kind,
            options,
            latest: Vec::new(),
            tx,
            rx,
        }
    }

    fn value(&self, option: SensorOption, fallback: f32) -> f32 {
        find_option(&self.options, option).map_or(fallback, |o| o.value)
    }

    /// An unread output is replaced, never queued.
    fn push(&self, output: Output) {
        match self.tx.try_send(output) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(output)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(output);
            }
        }
    }
}

struct Session {
    device: u64,
    streams: Vec<Stream>,
    tx: Sender<Bundle>,
    rx: Receiver<Bundle>,
    delivered: u64,
}

#[derive(Debug, Clone, Default)]
struct SimConfig {
    requests: Vec<StreamRequest>,
    all: bool,
    serial: Option<String>,
}

type SharedDevicesCallback = Arc<dyn Fn(Option<RawHandle>, Option<RawHandle>) + Send + Sync>;
type SharedNotificationCallback = Arc<dyn Fn(RawNotification) + Send + Sync>;
type SharedErrorCallback = Arc<dyn Fn(NativeError) + Send + Sync>;

enum Object {
    Context(Option<SharedDevicesCallback>),
    DeviceList(Vec<u64>),
    Device(u64),
    Sensor(u64, usize),
    Profile(u64, usize, StreamProfileData),
    Config(SimConfig),
    Pipeline(Option<Session>),
    PipelineProfile(u64, Vec<Stream>),
    Frame(Arc<SimFrame>),
    Composite(Bundle),
    Block(SimBlock),
}

impl Object {
    fn kind(&self) -> HandleKind {
        match self {
            Object::Context(_) => HandleKind::Context,
            Object::DeviceList(_) => HandleKind::DeviceList,
            Object::Device(_) => HandleKind::Device,
            Object::Sensor(..) => HandleKind::Sensor,
            Object::Profile(..) => HandleKind::StreamProfile,
            Object::Config(_) => HandleKind::Config,
            Object::Pipeline(_) => HandleKind::Pipeline,
            Object::PipelineProfile(..) => HandleKind::PipelineProfile,
            Object::Frame(_) | Object::Composite(_) => HandleKind::Frame,
            Object::Block(_) => HandleKind::ProcessingBlock,
        }
    }
}

fn invalid(function: &str, message: &str) -> NativeError {
    NativeError::new(function, message, NativeErrorKind::InvalidValue)
}

fn wrong_handle(function: &str, expected: HandleKind) -> NativeError {
    invalid(function, &format!("handle is not a valid {}", expected.name()))
}

fn sequence(function: &str, message: &str) -> NativeError {
    NativeError::new(function, message, NativeErrorKind::WrongApiCallSequence)
}

fn not_implemented(function: &str, message: &str) -> NativeError {
    NativeError::new(function, message, NativeErrorKind::NotImplemented)
}

#[derive(Default)]
struct State {
    issued: usize,
    objects: HashMap<usize, Object>,
    devices: HashMap<u64, SimDevice>,
    attached: Vec<u64>,
    next_device: u64,
    notifications: HashMap<(u64, usize), SharedNotificationCallback>,
    faults: HashMap<String, NativeError>,
    double_releases: usize,
    registrations: usize,
    resets: usize,
}

impl State {
    fn insert(&mut self, object: Object) -> RawHandle {
        self.issued += 1;
        let raw = RawHandle(NonZeroUsize::MIN.saturating_add(self.issued * 0x10));
        self.objects.insert(raw.get(), object);
        raw
    }

    fn fault(&mut self, function: &str) -> NativeResult<()> {
        match self.faults.remove(function) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn object(&self, raw: RawHandle, function: &str) -> NativeResult<&Object> {
        self.objects
            .get(&raw.get())
            .ok_or_else(|| invalid(function, "null or released handle"))
    }

    fn object_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut Object> {
        self.objects
            .get_mut(&raw.get())
            .ok_or_else(|| invalid(function, "null or released handle"))
    }

    fn add_device(&mut self, device: SimDevice) -> u64 {
        self.next_device += 1;
        let id = self.next_device;
        self.devices.insert(id, device);
        self.attached.push(id);
        id
    }

    fn is_attached(&self, id: u64) -> bool {
        self.attached.contains(&id)
    }

    /// Any device ever seen; info stays readable after unplug.
    fn known(&self, id: u64, function: &str) -> NativeResult<&SimDevice> {
        self.devices
            .get(&id)
            .ok_or_else(|| invalid(function, "unknown device"))
    }

    fn attached_device(&self, id: u64, function: &str) -> NativeResult<&SimDevice> {
        if !self.is_attached(id) {
            return Err(NativeError::new(
                function,
                "device disconnected",
                NativeErrorKind::CameraDisconnected,
            ));
        }
        self.known(id, function)
    }

    fn check_context(&self, raw: RawHandle, function: &str) -> NativeResult<()> {
        match self.object(raw, function)? {
            Object::Context(_) => Ok(()),
            _ => Err(wrong_handle(function, HandleKind::Context)),
        }
    }

    fn device_list(&self, raw: RawHandle, function: &str) -> NativeResult<&Vec<u64>> {
        match self.object(raw, function)? {
            Object::DeviceList(ids) => Ok(ids),
            _ => Err(wrong_handle(function, HandleKind::DeviceList)),
        }
    }

    fn device_id(&self, raw: RawHandle, function: &str) -> NativeResult<u64> {
        match self.object(raw, function)? {
            Object::Device(id) => Ok(*id),
            _ => Err(wrong_handle(function, HandleKind::Device)),
        }
    }

    fn sensor_ref(&self, raw: RawHandle, function: &str) -> NativeResult<(u64, usize)> {
        match self.object(raw, function)? {
            Object::Sensor(dev, s) => Ok((*dev, *s)),
            _ => Err(wrong_handle(function, HandleKind::Sensor)),
        }
    }

    fn sensor(&self, raw: RawHandle, function: &str) -> NativeResult<&SimSensor> {
        let (dev, s) = self.sensor_ref(raw, function)?;
        self.attached_device(dev, function)?
            .sensors
            .get(s)
            .ok_or_else(|| invalid(function, "unknown sensor"))
    }

    fn sensor_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut SimSensor> {
        let (dev, s) = self.sensor_ref(raw, function)?;
        self.attached_device(dev, function)?;
        self.devices
            .get_mut(&dev)
            .and_then(|d| d.sensors.get_mut(s))
            .ok_or_else(|| invalid(function, "unknown sensor"))
    }

    fn block_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut SimBlock> {
        match self.object_mut(raw, function)? {
            Object::Block(b) => Ok(b),
            _ => Err(wrong_handle(function, HandleKind::ProcessingBlock)),
        }
    }

    /// Options of a sensor or a processing block.
    fn options(&self, raw: RawHandle, function: &str) -> NativeResult<&[(SensorOption, SimOption)]> {
        match self.object(raw, function)? {
            Object::Block(b) => Ok(b.options.as_slice()),
            _ => Ok(self.sensor(raw, function)?.options.as_slice()),
        }
    }

    fn options_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut [(SensorOption, SimOption)]> {
        if matches!(self.object(raw, function)?, Object::Block(_)) {
            return Ok(self.block_mut(raw, function)?.options.as_mut_slice());
        }
        Ok(self.sensor_mut(raw, function)?.options.as_mut_slice())
    }

    fn sensor_option(&self, raw: RawHandle, option: SensorOption, function: &str) -> NativeResult<&SimOption> {
        find_option(self.options(raw, function)?, option)
            .ok_or_else(|| invalid(function, &format!("object does not support option {}", option)))
    }

    fn profile(&self, raw: RawHandle, function: &str) -> NativeResult<(u64, usize, StreamProfileData)> {
        match self.object(raw, function)? {
            Object::Profile(dev, s, data) => Ok((*dev, *s, *data)),
            _ => Err(wrong_handle(function, HandleKind::StreamProfile)),
        }
    }

    fn config_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut SimConfig> {
        match self.object_mut(raw, function)? {
            Object::Config(c) => Ok(c),
            _ => Err(wrong_handle(function, HandleKind::Config)),
        }
    }

    fn session_mut(&mut self, raw: RawHandle, function: &str) -> NativeResult<&mut Option<Session>> {
        match self.object_mut(raw, function)? {
            Object::Pipeline(s) => Ok(s),
            _ => Err(wrong_handle(function, HandleKind::Pipeline)),
        }
    }

    fn frame(&self, raw: RawHandle, function: &str) -> NativeResult<&Arc<SimFrame>> {
        match self.object(raw, function)? {
            Object::Frame(f) => Ok(f),
            _ => Err(wrong_handle(function, HandleKind::Frame)),
        }
    }

    fn composite(&self, raw: RawHandle, function: &str) -> NativeResult<&Bundle> {
        match self.object(raw, function)? {
            Object::Composite(frames) => Ok(frames),
            _ => Err(invalid(function, "frame is not a composite frame")),
        }
    }

    fn pipeline_profile(&self, raw: RawHandle, function: &str) -> NativeResult<(u64, &Vec<Stream>)> {
        match self.object(raw, function)? {
            Object::PipelineProfile(dev, streams) => Ok((*dev, streams)),
            _ => Err(wrong_handle(function, HandleKind::PipelineProfile)),
        }
    }

    fn devices_changed_callbacks(&self) -> Vec<SharedDevicesCallback> {
        self.objects
            .values()
            .filter_map(|o| match o {
                Object::Context(Some(cb)) => Some(cb.clone()),
                _ => None,
            })
            .collect()
    }

    fn choose_device(&self, serial: Option<&str>, function: &str) -> NativeResult<u64> {
        let found = self.attached.iter().copied().find(|id| match serial {
            Some(serial) => self.devices.get(id).is_some_and(|d| d.serial == serial),
            None => true,
        });
        found.ok_or_else(|| NativeError::new(function, "No device connected", NativeErrorKind::Backend))
    }
}

fn request_matches(request: &StreamRequest, profile: &StreamProfileData) -> bool {
    let (width, height) = profile.video_size.unwrap_or((0, 0));
    request.kind == profile.kind
        && (request.index == StreamRequest::ANY_INDEX || request.index == profile.index)
        && (request.width == 0 || request.width == width)
        && (request.height == 0 || request.height == height)
        && (request.format == Format::Any || request.format == profile.format)
        && (request.fps == 0 || request.fps == profile.fps)
}

fn resolve_streams(device: &SimDevice, config: Option<&SimConfig>, function: &str) -> NativeResult<Vec<Stream>> {
    let all: Vec<Stream> = device
        .sensors
        .iter()
        .enumerate()
        .flat_map(|(sensor, s)| s.profiles.iter().map(move |p| Stream { sensor, data: *p }))
        .collect();
    let defaults = || all.iter().copied().filter(|s| s.data.is_default).collect::<Vec<_>>();

    let Some(config) = config.filter(|c| !c.requests.is_empty() && !c.all) else {
        return Ok(defaults());
    };
    let mut streams = Vec::new();
    for request in &config.requests {
        let pick = all
            .iter()
            .filter(|s| request_matches(request, &s.data))
            .max_by_key(|s| s.data.is_default)
            .copied()
            .ok_or_else(|| invalid(function, "Couldn't resolve requests"))?;
        streams.push(pick);
    }
    Ok(streams)
}

/// A flat scene one meter away at the default depth scale.
fn depth_payload(width: u32, height: u32) -> Vec<u8> {
    std::iter::repeat(1000u16.to_le_bytes())
        .take((width * height) as usize)
        .flatten()
        .collect()
}

/// Resample a video frame onto a `width` x `height` viewport.
fn resized(frame: &SimFrame, width: u32, height: u32) -> SimFrame {
    let mut out = frame.clone();
    let Some(video) = frame.video else {
        return out;
    };
    let stride = width * video.bits_per_pixel / 8;
    out.profile.video_size = Some((width, height));
    out.video = Some(VideoFrameInfo {
        width,
        height,
        stride,
        bits_per_pixel: video.bits_per_pixel,
    });
    out.payload = if frame.caps.contains(FrameCapabilities::DEPTH) {
        depth_payload(width, height)
    } else {
        vec![frame.payload.first().copied().unwrap_or(0); (stride * height) as usize]
    };
    out
}

/// Map every other video stream onto the viewport of `to`. Without a `to`
/// frame in the bundle nothing changes.
fn align_bundle(frames: &Bundle, to: StreamKind) -> Bundle {
    let Some(target) = frames.iter().find(|f| f.profile.kind == to).and_then(|f| f.video) else {
        return frames.clone();
    };
    frames
        .iter()
        .map(|f| {
            if f.profile.kind == to || f.video.is_none() {
                f.clone()
            } else {
                Arc::new(resized(f, target.width, target.height))
            }
        })
        .collect()
}

/// Render depth as RGB, red for far and blue for near.
fn colorize(depth: &SimFrame, min: f32, max: f32) -> SimFrame {
    let mut out = depth.clone();
    let Some(video) = depth.video else {
        return out;
    };
    let span = (max - min).max(f32::EPSILON);
    out.payload = depth
        .payload
        .chunks_exact(2)
        .flat_map(|px| {
            let meters = u16::from_le_bytes([px[0], px[1]]) as f32 * depth.depth_scale;
            let t = ((meters - min) / span).clamp(0.0, 1.0);
            [(255.0 * t) as u8, 0, (255.0 * (1.0 - t)) as u8]
        })
        .collect();
    out.profile.format = Format::Rgb8;
    out.caps = FrameCapabilities::VIDEO;
    out.video = Some(VideoFrameInfo {
        width: video.width,
        height: video.height,
        stride: video.width * 3,
        bits_per_pixel: 24,
    });
    out
}

fn make_frame(device_id: u64, device: &SimDevice, stream: &Stream, number: u64) -> SimFrame {
    let data = stream.data;
    let sensor = &device.sensors[stream.sensor];
    let mut caps = FrameCapabilities::empty();
    let mut video = None;
    let mut payload = Vec::new();
    let mut motion = [0.0f32; 3];
    let mut pose = PoseData::default();

    if let Some((width, height)) = data.video_size {
        caps |= FrameCapabilities::VIDEO;
        let bits_per_pixel = data.format.bits_per_pixel().unwrap_or(8);
        let stride = width * bits_per_pixel / 8;
        video = Some(VideoFrameInfo {
            width,
            height,
            stride,
            bits_per_pixel,
        });
        if data.kind == StreamKind::Depth {
            caps |= FrameCapabilities::DEPTH;
            payload = depth_payload(width, height);
        } else {
            payload = vec![(number % 251) as u8; (stride * height) as usize];
        }
    }
    match data.kind {
        StreamKind::Gyro | StreamKind::Accel => {
            caps |= FrameCapabilities::MOTION;
            motion = if data.kind == StreamKind::Gyro {
                [0.0, 0.0, 0.01]
            } else {
                [0.0, -9.81, 0.0]
            };
            payload = motion.iter().flat_map(|v| v.to_le_bytes()).collect();
        }
        StreamKind::Pose => {
            caps |= FrameCapabilities::POSE;
            pose = PoseData {
                translation: [0.0, 0.0, number as f32 * 0.001],
                rotation: [0.0, 0.0, 0.0, 1.0],
                tracker_confidence: 3,
                mapper_confidence: 3,
                ..PoseData::default()
            };
        }
        _ => {}
    }

    SimFrame {
        profile: data,
        device: device_id,
        sensor: stream.sensor,
        number,
        timestamp: number as f64 * 1000.0 / data.fps.max(1) as f64,
        caps,
        video,
        depth_scale: sensor.depth_scale,
        payload,
        motion,
        pose,
    }
}

/// Simulated capture SDK. See the module docs.
#[derive(Default)]
pub struct SimSdk {
    state: Mutex<State>,
    on_error: Mutex<Option<SharedErrorCallback>>,
}

impl SimSdk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<SimDevice>) -> Self {
        let sdk = Self::new();
        {
            let mut st = sdk.lock();
            for d in devices {
                st.add_device(d);
            }
        }
        sdk
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug in a device and fire devices-changed callbacks with it as added.
    pub fn connect(&self, device: SimDevice) {
        let serial = device.serial.clone();
        let calls: Vec<(SharedDevicesCallback, RawHandle)> = {
            let mut st = self.lock();
            let id = st.add_device(device);
            st.devices_changed_callbacks()
                .into_iter()
                .map(|cb| (cb, st.insert(Object::DeviceList(vec![id]))))
                .collect()
        };
        log::debug!("sim: connected {} ({} listeners)", serial, calls.len());
        for (cb, added) in calls {
            cb(None, Some(added));
        }
    }

    /// Unplug the device with `serial`. Returns false if none is attached.
    pub fn disconnect(&self, serial: &str) -> bool {
        let calls: Vec<(SharedDevicesCallback, RawHandle)> = {
            let mut st = self.lock();
            let Some(pos) = st
                .attached
                .iter()
                .position(|id| st.devices.get(id).is_some_and(|d| d.serial == serial))
            else {
                return false;
            };
            let id = st.attached.remove(pos);
            st.devices_changed_callbacks()
                .into_iter()
                .map(|cb| (cb, st.insert(Object::DeviceList(vec![id]))))
                .collect()
        };
        log::debug!("sim: disconnected {}", serial);
        for (cb, removed) in calls {
            cb(Some(removed), None);
        }
        true
    }

    /// Push one bundle with every enabled stream to each running pipeline.
    /// Returns the number of pipelines that received one.
    pub fn deliver_all(&self) -> usize {
        self.deliver_only(&[])
    }

    /// Like [`SimSdk::deliver_all`] but only streams of the given kinds. An
    /// undelivered previous bundle is replaced, never queued.
    pub fn deliver_only(&self, kinds: &[StreamKind]) -> usize {
        let mut st = self.lock();
        let State {
            objects,
            devices,
            attached,
            ..
        } = &mut *st;
        let mut delivered = 0;
        for object in objects.values_mut() {
            let Object::Pipeline(Some(session)) = object else {
                continue;
            };
            if !attached.contains(&session.device) {
                continue;
            }
            let Some(device) = devices.get(&session.device) else {
                continue;
            };
            session.delivered += 1;
            let number = session.delivered;
            let bundle: Bundle = session
                .streams
                .iter()
                .filter(|s| kinds.is_empty() || kinds.contains(&s.data.kind))
                .map(|s| Arc::new(make_frame(session.device, device, s, number)))
                .collect();
            if bundle.is_empty() {
                continue;
            }
            match session.tx.try_send(bundle) {
                Ok(()) => {}
                Err(TrySendError::Full(bundle)) => {
                    let _ = session.rx.try_recv();
                    let _ = session.tx.try_send(bundle);
                }
                Err(TrySendError::Disconnected(_)) => continue,
            }
            delivered += 1;
        }
        delivered
    }

    /// Fire the notification callback of sensor `sensor` on device `serial`.
    /// Returns false if no callback is registered there.
    pub fn notify(&self, serial: &str, sensor: usize, notification: RawNotification) -> bool {
        let callback = {
            let st = self.lock();
            st.attached
                .iter()
                .find(|id| st.devices.get(*id).is_some_and(|d| d.serial == serial))
                .and_then(|id| st.notifications.get(&(*id, sensor)).cloned())
        };
        match callback {
            Some(cb) => {
                cb(notification);
                true
            }
            None => false,
        }
    }

    /// Raise an error through the process-wide error callback.
    pub fn raise_async_error(&self, err: NativeError) {
        let callback = self
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(cb) => cb(err),
            None => log::warn!("sim: async error with no callback installed: {}", err),
        }
    }

    /// Make the next call of `function` fail with a backend error.
    pub fn fail_next(&self, function: &str, message: &str) {
        self.fail_next_with(function, message, NativeErrorKind::Backend);
    }

    pub fn fail_next_with(&self, function: &str, message: &str, kind: NativeErrorKind) {
        self.lock()
            .faults
            .insert(function.to_string(), NativeError::new(function, message, kind));
    }

    /// Handles currently held by callers.
    pub fn live_handles(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn live_handles_of(&self, kind: HandleKind) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind)
            .count()
    }

    /// Releases of handles that were not live.
    pub fn double_releases(&self) -> usize {
        self.lock().double_releases
    }

    /// Devices-changed and notification callback installs.
    pub fn callback_registrations(&self) -> usize {
        self.lock().registrations
    }

    pub fn hardware_resets(&self) -> usize {
        self.lock().resets
    }
}

impl Sdk for SimSdk {
    fn release(&self, kind: HandleKind, raw: RawHandle) {
        let removed = {
            let mut st = self.lock();
            let removed = st.objects.remove(&raw.get());
            if removed.is_none() {
                st.double_releases += 1;
            }
            removed
        };
        match &removed {
            None => log::warn!("sim: release of dead {} handle {:#x}", kind.name(), raw.get()),
            Some(o) if o.kind() != kind => log::warn!(
                "sim: {} handle {:#x} released as {}",
                o.kind().name(),
                raw.get(),
                kind.name()
            ),
            Some(_) => {}
        }
        // Callbacks and frames are dropped outside the lock.
        drop(removed);
    }

    fn create_context(&self) -> NativeResult<RawHandle> {
        let mut st = self.lock();
        st.fault("rs2_create_context")?;
        Ok(st.insert(Object::Context(None)))
    }

    fn query_devices(&self, ctx: RawHandle) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_query_devices";
        let mut st = self.lock();
        st.fault(F)?;
        st.check_context(ctx, F)?;
        let ids = st.attached.clone();
        Ok(Some(st.insert(Object::DeviceList(ids))))
    }

    fn create_device_from_sensor(&self, sensor: RawHandle) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_create_device_from_sensor";
        let mut st = self.lock();
        st.fault(F)?;
        let (dev, _) = st.sensor_ref(sensor, F)?;
        if !st.is_attached(dev) {
            return Ok(None);
        }
        Ok(Some(st.insert(Object::Device(dev))))
    }

    fn set_devices_changed_callback(&self, ctx: RawHandle, callback: DevicesChangedCallback) -> NativeResult<()> {
        const F: &str = "rs2_set_devices_changed_callback_cpp";
        let mut st = self.lock();
        st.fault(F)?;
        match st.object_mut(ctx, F)? {
            Object::Context(slot) => *slot = Some(Arc::from(callback)),
            _ => return Err(wrong_handle(F, HandleKind::Context)),
        }
        st.registrations += 1;
        Ok(())
    }

    fn device_count(&self, list: RawHandle) -> NativeResult<usize> {
        const F: &str = "rs2_get_device_count";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.device_list(list, F)?.len())
    }

    fn create_device(&self, list: RawHandle, index: usize) -> NativeResult<RawHandle> {
        const F: &str = "rs2_create_device";
        let mut st = self.lock();
        st.fault(F)?;
        let id = *st
            .device_list(list, F)?
            .get(index)
            .ok_or_else(|| invalid(F, "device index out of range"))?;
        Ok(st.insert(Object::Device(id)))
    }

    fn device_list_contains(&self, list: RawHandle, device: RawHandle) -> NativeResult<bool> {
        const F: &str = "rs2_device_list_contains";
        let mut st = self.lock();
        st.fault(F)?;
        let id = st.device_id(device, F)?;
        Ok(st.device_list(list, F)?.contains(&id))
    }

    fn supports_device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<bool> {
        const F: &str = "rs2_supports_device_info";
        let mut st = self.lock();
        st.fault(F)?;
        st.known(st.device_id(device, F)?, F)?;
        Ok(matches!(
            info,
            CameraInfo::Name
                | CameraInfo::SerialNumber
                | CameraInfo::FirmwareVersion
                | CameraInfo::PhysicalPort
                | CameraInfo::ProductLine
                | CameraInfo::UsbTypeDescriptor
                | CameraInfo::CameraLocked
        ))
    }

    fn device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<String> {
        const F: &str = "rs2_get_device_info";
        let mut st = self.lock();
        st.fault(F)?;
        let d = st.known(st.device_id(device, F)?, F)?;
        match info {
            CameraInfo::Name => Ok(d.name.clone()),
            CameraInfo::SerialNumber => Ok(d.serial.clone()),
            CameraInfo::FirmwareVersion => Ok(d.firmware.clone()),
            CameraInfo::PhysicalPort => Ok(format!("/sim/usb/{}", d.serial)),
            CameraInfo::ProductLine => Ok(d.product_line.clone()),
            CameraInfo::UsbTypeDescriptor => Ok("3.2".into()),
            CameraInfo::CameraLocked => Ok("YES".into()),
            other => Err(invalid(F, &format!("info {} not supported by the device", other))),
        }
    }

    fn hardware_reset(&self, device: RawHandle) -> NativeResult<()> {
        const F: &str = "rs2_hardware_reset";
        let mut st = self.lock();
        st.fault(F)?;
        st.attached_device(st.device_id(device, F)?, F)?;
        st.resets += 1;
        Ok(())
    }

    fn query_sensors(&self, device: RawHandle) -> NativeResult<Vec<RawHandle>> {
        const F: &str = "rs2_query_sensors";
        let mut st = self.lock();
        st.fault(F)?;
        let id = st.device_id(device, F)?;
        let count = st.attached_device(id, F)?.sensors.len();
        Ok((0..count).map(|s| st.insert(Object::Sensor(id, s))).collect())
    }

    fn supports_sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<bool> {
        const F: &str = "rs2_supports_sensor_info";
        let mut st = self.lock();
        st.fault(F)?;
        st.sensor(sensor, F)?;
        Ok(info == CameraInfo::Name)
    }

    fn sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<String> {
        const F: &str = "rs2_get_sensor_info";
        let mut st = self.lock();
        st.fault(F)?;
        let s = st.sensor(sensor, F)?;
        match info {
            CameraInfo::Name => Ok(s.name.clone()),
            other => Err(invalid(F, &format!("info {} not supported by the sensor", other))),
        }
    }

    fn sensor_capabilities(&self, sensor: RawHandle) -> NativeResult<SensorCapabilities> {
        const F: &str = "rs2_is_sensor_extendable_to";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.sensor(sensor, F)?.capabilities)
    }

    fn depth_scale(&self, sensor: RawHandle) -> NativeResult<f32> {
        const F: &str = "rs2_get_depth_scale";
        let mut st = self.lock();
        st.fault(F)?;
        let s = st.sensor(sensor, F)?;
        if !s.capabilities.contains(SensorCapabilities::DEPTH) {
            return Err(not_implemented(F, "sensor is not a depth sensor"));
        }
        Ok(s.depth_scale)
    }

    fn stream_profiles(&self, sensor: RawHandle) -> NativeResult<Vec<RawHandle>> {
        const F: &str = "rs2_get_stream_profiles";
        let mut st = self.lock();
        st.fault(F)?;
        let (dev, s) = st.sensor_ref(sensor, F)?;
        let profiles = st.sensor(sensor, F)?.profiles.clone();
        Ok(profiles
            .into_iter()
            .map(|p| st.insert(Object::Profile(dev, s, p)))
            .collect())
    }

    fn supports_option(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool> {
        const F: &str = "rs2_supports_option";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(find_option(st.options(sensor, F)?, option).is_some())
    }

    fn option_value(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<f32> {
        const F: &str = "rs2_get_option";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.sensor_option(sensor, option, F)?.value)
    }

    fn set_option_value(&self, sensor: RawHandle, option: SensorOption, value: f32) -> NativeResult<()> {
        const F: &str = "rs2_set_option";
        let mut st = self.lock();
        st.fault(F)?;
        let opt = find_option_mut(st.options_mut(sensor, F)?, option)
            .ok_or_else(|| invalid(F, &format!("object does not support option {}", option)))?;
        if opt.read_only {
            return Err(invalid(F, &format!("option {} is read-only", option)));
        }
        if value < opt.range.min || value > opt.range.max {
            return Err(invalid(
                F,
                &format!(
                    "value {} out of range [{}, {}] for option {}",
                    value, opt.range.min, opt.range.max, option
                ),
            ));
        }
        opt.value = value;
        Ok(())
    }

    fn option_range(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<OptionRange> {
        const F: &str = "rs2_get_option_range";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.sensor_option(sensor, option, F)?.range)
    }

    fn is_option_read_only(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool> {
        const F: &str = "rs2_is_option_read_only";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.sensor_option(sensor, option, F)?.read_only)
    }

    fn option_description(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<String> {
        const F: &str = "rs2_get_option_description";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.sensor_option(sensor, option, F)?.description.to_string())
    }

    fn option_value_description(
        &self,
        sensor: RawHandle,
        option: SensorOption,
        value: f32,
    ) -> NativeResult<Option<String>> {
        const F: &str = "rs2_get_option_value_description";
        let mut st = self.lock();
        st.fault(F)?;
        st.sensor_option(sensor, option, F)?;
        let text = match (option, value as i32) {
            (SensorOption::EmitterEnabled, 0) => Some("Off"),
            (SensorOption::EmitterEnabled, 1) => Some("On"),
            (SensorOption::EmitterEnabled, 2) => Some("Laser Auto"),
            (SensorOption::VisualPreset, 0) => Some("Custom"),
            (SensorOption::VisualPreset, 1) => Some("Default"),
            (SensorOption::VisualPreset, 2) => Some("Hand"),
            (SensorOption::VisualPreset, 3) => Some("High Accuracy"),
            (SensorOption::VisualPreset, 4) => Some("High Density"),
            (SensorOption::VisualPreset, 5) => Some("Medium Density"),
            (SensorOption::ColorScheme, 0) => Some("Jet"),
            (SensorOption::ColorScheme, 1) => Some("Classic"),
            (SensorOption::ColorScheme, 2) => Some("WhiteToBlack"),
            (SensorOption::ColorScheme, 3) => Some("BlackToWhite"),
            (SensorOption::ColorScheme, 4) => Some("Bio"),
            (SensorOption::ColorScheme, 5) => Some("Cold"),
            (SensorOption::ColorScheme, 6) => Some("Warm"),
            (SensorOption::ColorScheme, 7) => Some("Quantized"),
            (SensorOption::ColorScheme, 8) => Some("Pattern"),
            (SensorOption::ColorScheme, 9) => Some("Hue"),
            _ => None,
        };
        Ok(text.map(str::to_string))
    }

    fn region_of_interest(&self, sensor: RawHandle) -> NativeResult<RegionOfInterest> {
        const F: &str = "rs2_get_region_of_interest";
        let mut st = self.lock();
        st.fault(F)?;
        let s = st.sensor(sensor, F)?;
        if !s.capabilities.contains(SensorCapabilities::ROI) {
            return Err(not_implemented(F, "sensor does not support region of interest"));
        }
        Ok(s.roi)
    }

    fn set_region_of_interest(&self, sensor: RawHandle, roi: RegionOfInterest) -> NativeResult<()> {
        const F: &str = "rs2_set_region_of_interest";
        let mut st = self.lock();
        st.fault(F)?;
        let s = st.sensor_mut(sensor, F)?;
        if !s.capabilities.contains(SensorCapabilities::ROI) {
            return Err(not_implemented(F, "sensor does not support region of interest"));
        }
        if roi.min_x > roi.max_x || roi.min_y > roi.max_y {
            return Err(invalid(F, "invalid region of interest"));
        }
        s.roi = roi;
        Ok(())
    }

    fn set_notifications_callback(&self, sensor: RawHandle, callback: NotificationCallback) -> NativeResult<()> {
        const F: &str = "rs2_set_notifications_callback_cpp";
        let mut st = self.lock();
        st.fault(F)?;
        let key = st.sensor_ref(sensor, F)?;
        st.sensor(sensor, F)?;
        st.notifications.insert(key, Arc::from(callback));
        st.registrations += 1;
        Ok(())
    }

    fn sensor_key(&self, sensor: RawHandle) -> NativeResult<String> {
        let (dev, s) = self.lock().sensor_ref(sensor, "rs2_get_sensor_info")?;
        Ok(format!("sim-{}/{}", dev, s))
    }

    fn stream_profile_data(&self, profile: RawHandle) -> NativeResult<StreamProfileData> {
        const F: &str = "rs2_get_stream_profile_data";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.profile(profile, F)?.2)
    }

    fn video_intrinsics(&self, profile: RawHandle) -> NativeResult<Intrinsics> {
        const F: &str = "rs2_get_video_stream_intrinsics";
        let mut st = self.lock();
        st.fault(F)?;
        let (_, _, data) = st.profile(profile, F)?;
        let (width, height) = data
            .video_size
            .ok_or_else(|| invalid(F, "profile is not a video stream profile"))?;
        let focal = 380.0 * width as f32 / 640.0;
        Ok(Intrinsics {
            width,
            height,
            ppx: width as f32 / 2.0,
            ppy: height as f32 / 2.0,
            fx: focal,
            fy: focal,
            model: 0,
            coeffs: [0.0; 5],
        })
    }

    fn motion_intrinsics(&self, profile: RawHandle) -> NativeResult<MotionIntrinsics> {
        const F: &str = "rs2_get_motion_intrinsics";
        let mut st = self.lock();
        st.fault(F)?;
        let (_, _, data) = st.profile(profile, F)?;
        if !data.is_motion {
            return Err(invalid(F, "profile is not a motion stream profile"));
        }
        Ok(MotionIntrinsics {
            data: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            noise_variances: [1e-6; 3],
            bias_variances: [1e-8; 3],
        })
    }

    fn extrinsics(&self, from: RawHandle, to: RawHandle) -> NativeResult<Extrinsics> {
        const F: &str = "rs2_get_extrinsics";
        let mut st = self.lock();
        st.fault(F)?;
        let (from_dev, from_sensor, _) = st.profile(from, F)?;
        let (to_dev, to_sensor, _) = st.profile(to, F)?;
        if from_dev != to_dev {
            return Err(invalid(F, "profiles belong to different devices"));
        }
        let translation = if from_sensor == to_sensor {
            [0.0; 3]
        } else {
            [-0.015, 0.0, 0.0]
        };
        Ok(Extrinsics {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation,
        })
    }

    fn create_config(&self) -> NativeResult<RawHandle> {
        let mut st = self.lock();
        st.fault("rs2_create_config")?;
        Ok(st.insert(Object::Config(SimConfig::default())))
    }

    fn config_enable_stream(&self, config: RawHandle, request: &StreamRequest) -> NativeResult<()> {
        const F: &str = "rs2_config_enable_stream";
        let mut st = self.lock();
        st.fault(F)?;
        st.config_mut(config, F)?.requests.push(*request);
        Ok(())
    }

    fn config_disable_stream(&self, config: RawHandle, kind: StreamKind, index: Option<i32>) -> NativeResult<()> {
        const F: &str = "rs2_config_disable_indexed_stream";
        let mut st = self.lock();
        st.fault(F)?;
        st.config_mut(config, F)?
            .requests
            .retain(|r| !(r.kind == kind && index.map_or(true, |i| r.index == i)));
        Ok(())
    }

    fn config_enable_all_streams(&self, config: RawHandle) -> NativeResult<()> {
        const F: &str = "rs2_config_enable_all_stream";
        let mut st = self.lock();
        st.fault(F)?;
        st.config_mut(config, F)?.all = true;
        Ok(())
    }

    fn config_disable_all_streams(&self, config: RawHandle) -> NativeResult<()> {
        const F: &str = "rs2_config_disable_all_streams";
        let mut st = self.lock();
        st.fault(F)?;
        let c = st.config_mut(config, F)?;
        c.all = false;
        c.requests.clear();
        Ok(())
    }

    fn config_enable_device(&self, config: RawHandle, serial: &str) -> NativeResult<()> {
        const F: &str = "rs2_config_enable_device";
        let mut st = self.lock();
        st.fault(F)?;
        st.config_mut(config, F)?.serial = Some(serial.to_string());
        Ok(())
    }

    fn create_pipeline(&self, ctx: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_create_pipeline";
        let mut st = self.lock();
        st.fault(F)?;
        st.check_context(ctx, F)?;
        Ok(st.insert(Object::Pipeline(None)))
    }

    fn pipeline_start(&self, pipe: RawHandle, config: Option<RawHandle>) -> NativeResult<RawHandle> {
        const F: &str = "rs2_pipeline_start_with_config";
        let mut st = self.lock();
        st.fault(F)?;
        if st.session_mut(pipe, F)?.is_some() {
            return Err(sequence(F, "start() cannot be called before stop()"));
        }
        let config = match config {
            Some(raw) => Some(st.config_mut(raw, F)?.clone()),
            None => None,
        };
        let device = st.choose_device(config.as_ref().and_then(|c| c.serial.as_deref()), F)?;
        let streams = resolve_streams(st.known(device, F)?, config.as_ref(), F)?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        *st.session_mut(pipe, F)? = Some(Session {
            device,
            streams: streams.clone(),
            tx,
            rx,
            delivered: 0,
        });
        Ok(st.insert(Object::PipelineProfile(device, streams)))
    }

    fn pipeline_stop(&self, pipe: RawHandle) -> NativeResult<()> {
        const F: &str = "rs2_pipeline_stop";
        let session = {
            let mut st = self.lock();
            st.fault(F)?;
            st.session_mut(pipe, F)?.take()
        };
        match session {
            Some(_) => Ok(()),
            None => Err(sequence(F, "stop() cannot be called before start()")),
        }
    }

    fn pipeline_wait_for_frames(&self, pipe: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_pipeline_try_wait_for_frames";
        let rx = {
            let mut st = self.lock();
            st.fault(F)?;
            match st.session_mut(pipe, F)? {
                Some(session) => session.rx.clone(),
                None => return Err(sequence(F, "wait_for_frames cannot be called before start()")),
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(bundle) => Ok(Some(self.lock().insert(Object::Composite(bundle)))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(sequence(F, "pipeline stopped while waiting")),
        }
    }

    fn pipeline_poll_for_frames(&self, pipe: RawHandle) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_pipeline_poll_for_frames";
        let mut st = self.lock();
        st.fault(F)?;
        let polled = match st.session_mut(pipe, F)? {
            Some(session) => session.rx.try_recv(),
            None => return Err(sequence(F, "poll_for_frames cannot be called before start()")),
        };
        match polled {
            Ok(bundle) => Ok(Some(st.insert(Object::Composite(bundle)))),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn pipeline_active_profile(&self, pipe: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_pipeline_get_active_profile";
        let mut st = self.lock();
        st.fault(F)?;
        let (device, streams) = match st.session_mut(pipe, F)? {
            Some(session) => (session.device, session.streams.clone()),
            None => return Err(sequence(F, "get_active_profile() can only be called between a start() and a following stop()")),
        };
        Ok(st.insert(Object::PipelineProfile(device, streams)))
    }

    fn pipeline_profile_device(&self, profile: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_pipeline_profile_get_device";
        let mut st = self.lock();
        st.fault(F)?;
        let (device, _) = st.pipeline_profile(profile, F)?;
        Ok(st.insert(Object::Device(device)))
    }

    fn pipeline_profile_streams(&self, profile: RawHandle) -> NativeResult<Vec<RawHandle>> {
        const F: &str = "rs2_pipeline_profile_get_streams";
        let mut st = self.lock();
        st.fault(F)?;
        let (device, streams) = st.pipeline_profile(profile, F)?;
        let streams = streams.clone();
        Ok(streams
            .into_iter()
            .map(|s| st.insert(Object::Profile(device, s.sensor, s.data)))
            .collect())
    }

    fn embedded_frame_count(&self, composite: RawHandle) -> NativeResult<usize> {
        const F: &str = "rs2_embedded_frames_count";
        let mut st = self.lock();
        st.fault(F)?;
        Ok(st.composite(composite, F)?.len())
    }

    fn extract_frame(&self, composite: RawHandle, index: usize) -> NativeResult<RawHandle> {
        const F: &str = "rs2_extract_frame";
        let mut st = self.lock();
        st.fault(F)?;
        let frame = st
            .composite(composite, F)?
            .get(index)
            .cloned()
            .ok_or_else(|| invalid(F, "frame index out of range"))?;
        Ok(st.insert(Object::Frame(frame)))
    }

    fn clone_frame(&self, frame: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_frame_add_ref";
        let mut st = self.lock();
        st.fault(F)?;
        let copy = match st.object(frame, F)? {
            Object::Frame(f) => Object::Frame(f.clone()),
            Object::Composite(frames) => Object::Composite(frames.clone()),
            _ => return Err(wrong_handle(F, HandleKind::Frame)),
        };
        Ok(st.insert(copy))
    }

    fn frame_stream_profile(&self, frame: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_get_frame_stream_profile";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?.clone();
        Ok(st.insert(Object::Profile(f.device, f.sensor, f.profile)))
    }

    fn frame_capabilities(&self, frame: RawHandle) -> NativeResult<FrameCapabilities> {
        const F: &str = "rs2_is_frame_extendable_to";
        let mut st = self.lock();
        st.fault(F)?;
        match st.object(frame, F)? {
            Object::Frame(f) => Ok(f.caps),
            Object::Composite(_) => Ok(FrameCapabilities::COMPOSITE),
            _ => Err(wrong_handle(F, HandleKind::Frame)),
        }
    }

    fn frame_info(&self, frame: RawHandle) -> NativeResult<FrameInfo> {
        const F: &str = "rs2_get_frame_number";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        Ok(FrameInfo {
            number: f.number,
            timestamp: f.timestamp,
            domain: TimestampDomain::HardwareClock,
        })
    }

    fn video_frame_info(&self, frame: RawHandle) -> NativeResult<VideoFrameInfo> {
        const F: &str = "rs2_get_frame_width";
        let mut st = self.lock();
        st.fault(F)?;
        st.frame(frame, F)?
            .video
            .ok_or_else(|| invalid(F, "frame is not a video frame"))
    }

    fn frame_data(&self, frame: RawHandle) -> NativeResult<RawBuffer> {
        const F: &str = "rs2_get_frame_data";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        if f.payload.is_empty() {
            return Ok(RawBuffer::empty());
        }
        // SAFETY: the payload is never mutated and its `SimFrame` is kept
        // alive by the handle's entry in the object table.
        Ok(unsafe { RawBuffer::new(f.payload.as_ptr(), f.payload.len()) })
    }

    fn depth_distance(&self, frame: RawHandle, x: u32, y: u32) -> NativeResult<f32> {
        const F: &str = "rs2_depth_frame_get_distance";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        let video = match f.video {
            Some(v) if f.caps.contains(FrameCapabilities::DEPTH) => v,
            _ => return Err(invalid(F, "frame is not a depth frame")),
        };
        if x >= video.width || y >= video.height {
            return Err(invalid(F, "pixel out of range"));
        }
        let offset = (y * video.stride + x * 2) as usize;
        let raw = u16::from_le_bytes([f.payload[offset], f.payload[offset + 1]]);
        Ok(raw as f32 * f.depth_scale)
    }

    fn motion_data(&self, frame: RawHandle) -> NativeResult<[f32; 3]> {
        const F: &str = "rs2_get_frame_data";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        if !f.caps.contains(FrameCapabilities::MOTION) {
            return Err(invalid(F, "frame is not a motion frame"));
        }
        Ok(f.motion)
    }

    fn pose_data(&self, frame: RawHandle) -> NativeResult<PoseData> {
        const F: &str = "rs2_pose_frame_get_pose_data";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        if !f.caps.contains(FrameCapabilities::POSE) {
            return Err(invalid(F, "frame is not a pose frame"));
        }
        Ok(f.pose)
    }

    fn supports_frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<bool> {
        const F: &str = "rs2_supports_frame_metadata";
        let mut st = self.lock();
        st.fault(F)?;
        st.frame(frame, F)?;
        Ok(matches!(
            attr,
            FrameMetadata::FrameCounter | FrameMetadata::FrameTimestamp | FrameMetadata::ActualFps
        ))
    }

    fn frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<i64> {
        const F: &str = "rs2_get_frame_metadata";
        let mut st = self.lock();
        st.fault(F)?;
        let f = st.frame(frame, F)?;
        match attr {
            FrameMetadata::FrameCounter => Ok(f.number as i64),
            FrameMetadata::FrameTimestamp => Ok((f.timestamp * 1000.0) as i64),
            FrameMetadata::ActualFps => Ok(f.profile.fps as i64),
            other => Err(invalid(F, &format!("metadata {} not available", other))),
        }
    }

    fn create_align(&self, align_to: StreamKind) -> NativeResult<RawHandle> {
        let mut st = self.lock();
        st.fault("rs2_create_align")?;
        Ok(st.insert(Object::Block(SimBlock::new(BlockKind::Align(align_to)))))
    }

    fn create_colorizer(&self) -> NativeResult<RawHandle> {
        let mut st = self.lock();
        st.fault("rs2_create_colorizer")?;
        Ok(st.insert(Object::Block(SimBlock::new(BlockKind::Colorizer))))
    }

    fn create_syncer(&self) -> NativeResult<RawHandle> {
        let mut st = self.lock();
        st.fault("rs2_create_sync_processing_block")?;
        Ok(st.insert(Object::Block(SimBlock::new(BlockKind::Syncer))))
    }

    fn process_frame(&self, block: RawHandle, frame: RawHandle) -> NativeResult<()> {
        const F: &str = "rs2_process_frame";
        let mut st = self.lock();
        st.fault(F)?;
        let (frames, composite) = match st.object(frame, F)? {
            Object::Frame(f) => (vec![f.clone()], false),
            Object::Composite(frames) => (frames.clone(), true),
            _ => return Err(wrong_handle(F, HandleKind::Frame)),
        };
        let block = st.block_mut(block, F)?;
        let output = match block.kind {
            BlockKind::Align(to) => {
                if !composite {
                    return Err(invalid(F, "align expects a frameset"));
                }
                Output::Composite(align_bundle(&frames, to))
            }
            BlockKind::Colorizer => match frames.first() {
                Some(depth) if !composite && depth.caps.contains(FrameCapabilities::DEPTH) => {
                    let min = block.value(SensorOption::MinDistance, 0.0);
                    let max = block.value(SensorOption::MaxDistance, 6.0);
                    Output::Frame(Arc::new(colorize(depth, min, max)))
                }
                _ => return Err(invalid(F, "colorizer expects a depth frame")),
            },
            BlockKind::Syncer => {
                for f in frames {
                    match block
                        .latest
                        .iter_mut()
                        .find(|l| l.profile.key() == f.profile.key())
                    {
                        Some(slot) => *slot = f,
                        None => block.latest.push(f),
                    }
                }
                Output::Composite(block.latest.clone())
            }
        };
        block.push(output);
        Ok(())
    }

    fn block_wait_for_frame(&self, block: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_try_wait_for_frame";
        let rx = {
            let mut st = self.lock();
            st.fault(F)?;
            st.block_mut(block, F)?.rx.clone()
        };
        match rx.recv_timeout(timeout) {
            Ok(output) => Ok(Some(self.lock().insert(output.into_object()))),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn block_poll_for_frame(&self, block: RawHandle) -> NativeResult<Option<RawHandle>> {
        const F: &str = "rs2_poll_for_frame";
        let mut st = self.lock();
        st.fault(F)?;
        match st.block_mut(block, F)?.rx.try_recv() {
            Ok(output) => Ok(Some(st.insert(output.into_object()))),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn time(&self) -> NativeResult<f64> {
        const F: &str = "rs2_get_time";
        self.lock().fault(F)?;
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .map_err(|_| invalid(F, "system clock is before the epoch"))
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        *self.on_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(sdk: &SimSdk) -> RawHandle {
        let ctx = sdk.create_context().unwrap();
        let pipe = sdk.create_pipeline(ctx).unwrap();
        let profile = sdk.pipeline_start(pipe, None).unwrap();
        sdk.release(HandleKind::PipelineProfile, profile);
        sdk.release(HandleKind::Context, ctx);
        pipe
    }

    #[test]
    fn test_release_is_counted_once() {
        let sdk = SimSdk::new();
        let cfg = sdk.create_config().unwrap();
        assert_eq!(sdk.live_handles_of(HandleKind::Config), 1);
        sdk.release(HandleKind::Config, cfg);
        sdk.release(HandleKind::Config, cfg);
        assert_eq!(sdk.live_handles(), 0);
        assert_eq!(sdk.double_releases(), 1);
    }

    #[test]
    fn test_fault_fires_once() {
        let sdk = SimSdk::new();
        sdk.fail_next("rs2_create_context", "no backend");
        let err = sdk.create_context().unwrap_err();
        assert_eq!(err.function, "rs2_create_context");
        assert_eq!(err.kind, NativeErrorKind::Backend);
        let ctx = sdk.create_context().unwrap();
        sdk.release(HandleKind::Context, ctx);
    }

    #[test]
    fn test_undelivered_bundle_is_replaced() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let pipe = started(&sdk);
        assert_eq!(sdk.deliver_all(), 1);
        assert_eq!(sdk.deliver_only(&[StreamKind::Color]), 1);

        let bundle = sdk.pipeline_poll_for_frames(pipe).unwrap().unwrap();
        assert_eq!(sdk.embedded_frame_count(bundle).unwrap(), 1);
        let frame = sdk.extract_frame(bundle, 0).unwrap();
        assert_eq!(sdk.frame_info(frame).unwrap().number, 2);
        assert!(sdk.pipeline_poll_for_frames(pipe).unwrap().is_none());

        sdk.release(HandleKind::Frame, frame);
        sdk.release(HandleKind::Frame, bundle);
        sdk.pipeline_stop(pipe).unwrap();
        sdk.release(HandleKind::Pipeline, pipe);
        assert_eq!(sdk.live_handles(), 0);
    }

    #[test]
    fn test_start_twice_is_a_sequence_error() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let pipe = started(&sdk);
        let err = sdk.pipeline_start(pipe, None).unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::WrongApiCallSequence);
        sdk.pipeline_stop(pipe).unwrap();
        let err = sdk.pipeline_stop(pipe).unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::WrongApiCallSequence);
    }

    #[test]
    fn test_unplugged_device_stops_delivering() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let _pipe = started(&sdk);
        assert!(sdk.disconnect("S1"));
        assert!(!sdk.disconnect("S1"));
        assert_eq!(sdk.deliver_all(), 0);
    }

    #[test]
    fn test_wait_times_out_without_frames() {
        let sdk = SimSdk::with_devices(vec![SimDevice::tracking("T1")]);
        let pipe = started(&sdk);
        let got = sdk
            .pipeline_wait_for_frames(pipe, Duration::from_millis(5))
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_block_keeps_only_the_newest_output() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let pipe = started(&sdk);
        let syncer = sdk.create_syncer().unwrap();
        for _ in 0..2 {
            sdk.deliver_all();
            let bundle = sdk.pipeline_poll_for_frames(pipe).unwrap().unwrap();
            sdk.process_frame(syncer, bundle).unwrap();
            sdk.release(HandleKind::Frame, bundle);
        }
        let out = sdk.block_poll_for_frame(syncer).unwrap().unwrap();
        let depth = sdk.extract_frame(out, 0).unwrap();
        assert_eq!(sdk.frame_info(depth).unwrap().number, 2);
        assert!(sdk.block_poll_for_frame(syncer).unwrap().is_none());

        sdk.release(HandleKind::Frame, depth);
        sdk.release(HandleKind::Frame, out);
        sdk.release(HandleKind::ProcessingBlock, syncer);
        sdk.pipeline_stop(pipe).unwrap();
        sdk.release(HandleKind::Pipeline, pipe);
        assert_eq!(sdk.live_handles(), 0);
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_colorizer_rejects_non_depth() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let pipe = started(&sdk);
        let colorizer = sdk.create_colorizer().unwrap();
        sdk.deliver_only(&[StreamKind::Color]);
        let bundle = sdk.pipeline_poll_for_frames(pipe).unwrap().unwrap();
        let color = sdk.extract_frame(bundle, 0).unwrap();
        let err = sdk.process_frame(colorizer, color).unwrap_err();
        assert_eq!(err.function, "rs2_process_frame");
        assert_eq!(err.kind, NativeErrorKind::InvalidValue);
        assert!(sdk.supports_option(colorizer, SensorOption::ColorScheme).unwrap());
        assert!(!sdk.supports_option(colorizer, SensorOption::Exposure).unwrap());
    }

    #[test]
    fn test_unresolvable_request() {
        let sdk = SimSdk::with_devices(vec![SimDevice::d400("S1")]);
        let ctx = sdk.create_context().unwrap();
        let pipe = sdk.create_pipeline(ctx).unwrap();
        let cfg = sdk.create_config().unwrap();
        sdk.config_enable_stream(cfg, &StreamRequest::new(StreamKind::Color).fps(90))
            .unwrap();
        let err = sdk.pipeline_start(pipe, Some(cfg)).unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::InvalidValue);
    }
}
