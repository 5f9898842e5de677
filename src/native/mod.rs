//! The narrow capability surface consumed from the capture SDK.
//!
//! Everything behind [`Sdk`] is opaque: the managed layer only ever sees
//! [`RawHandle`]s, plain data and [`NativeError`]s. Every handle an `Sdk`
//! method returns is owned by the caller and must be given back exactly once
//! through [`Sdk::release`] with the matching [`HandleKind`].

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::NativeError;
use crate::types::{
    CameraInfo, Extrinsics, FrameCapabilities, FrameInfo, FrameMetadata, Intrinsics,
    MotionIntrinsics, OptionRange, PoseData, RawNotification, RegionOfInterest,
    SensorCapabilities, SensorOption, StreamKind, StreamProfileData, VideoFrameInfo,
};
use crate::config::StreamRequest;

#[cfg(feature = "realsense")]
pub mod rs2;
pub mod sim;

/// Result of a single native call.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Opaque, non-null reference into SDK-owned memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    pub fn new(value: usize) -> Option<Self> {
        NonZeroUsize::new(value).map(RawHandle)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Which native destructor a handle needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Context,
    DeviceList,
    Device,
    Sensor,
    StreamProfile,
    Config,
    Pipeline,
    PipelineProfile,
    Frame,
    /// A processing block together with its output queue.
    ProcessingBlock,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Context => "context",
            HandleKind::DeviceList => "device list",
            HandleKind::Device => "device",
            HandleKind::Sensor => "sensor",
            HandleKind::StreamProfile => "stream profile",
            HandleKind::Config => "config",
            HandleKind::Pipeline => "pipeline",
            HandleKind::PipelineProfile => "pipeline profile",
            HandleKind::Frame => "frame",
            HandleKind::ProcessingBlock => "processing block",
        }
    }
}

/// Frame payload memory owned by the SDK. Valid while the frame handle it was
/// read from is held.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    ptr: *const u8,
    len: usize,
}

impl RawBuffer {
    /// # Safety
    /// `ptr` must point at `len` readable bytes that stay valid for as long as
    /// the frame handle they were read from is held.
    pub unsafe fn new(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 || self.ptr.is_null()
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

/// Receives `(removed, added)` device lists; the callee owns both handles.
pub type DevicesChangedCallback = Box<dyn Fn(Option<RawHandle>, Option<RawHandle>) + Send + Sync>;
pub type NotificationCallback = Box<dyn Fn(RawNotification) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(NativeError) + Send + Sync>;

/// Native capture SDK.
///
/// Callback registration methods replace whatever callback was installed
/// before. Callbacks may be invoked from an SDK-owned thread.
pub trait Sdk: Send + Sync {
    fn release(&self, kind: HandleKind, raw: RawHandle);

    // context
    fn create_context(&self) -> NativeResult<RawHandle>;
    fn query_devices(&self, ctx: RawHandle) -> NativeResult<Option<RawHandle>>;
    fn create_device_from_sensor(&self, sensor: RawHandle) -> NativeResult<Option<RawHandle>>;
    fn set_devices_changed_callback(
        &self,
        ctx: RawHandle,
        callback: DevicesChangedCallback,
    ) -> NativeResult<()>;

    // device list
    fn device_count(&self, list: RawHandle) -> NativeResult<usize>;
    fn create_device(&self, list: RawHandle, index: usize) -> NativeResult<RawHandle>;
    fn device_list_contains(&self, list: RawHandle, device: RawHandle) -> NativeResult<bool>;

    // device
    fn supports_device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<bool>;
    fn device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<String>;
    fn hardware_reset(&self, device: RawHandle) -> NativeResult<()>;
    fn query_sensors(&self, device: RawHandle) -> NativeResult<Vec<RawHandle>>;

    // sensor
    fn supports_sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<bool>;
    fn sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<String>;
    fn sensor_capabilities(&self, sensor: RawHandle) -> NativeResult<SensorCapabilities>;
    fn depth_scale(&self, sensor: RawHandle) -> NativeResult<f32>;
    fn stream_profiles(&self, sensor: RawHandle) -> NativeResult<Vec<RawHandle>>;
    fn supports_option(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool>;
    fn option_value(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<f32>;
    fn set_option_value(&self, sensor: RawHandle, option: SensorOption, value: f32) -> NativeResult<()>;
    fn option_range(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<OptionRange>;
    fn is_option_read_only(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool>;
    fn option_description(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<String>;
    fn option_value_description(
        &self,
        sensor: RawHandle,
        option: SensorOption,
        value: f32,
    ) -> NativeResult<Option<String>>;
    fn region_of_interest(&self, sensor: RawHandle) -> NativeResult<RegionOfInterest>;
    fn set_region_of_interest(&self, sensor: RawHandle, roi: RegionOfInterest) -> NativeResult<()>;
    fn set_notifications_callback(
        &self,
        sensor: RawHandle,
        callback: NotificationCallback,
    ) -> NativeResult<()>;
    /// Identity of the physical sensor behind `sensor`. Every handle to the
    /// same sensor yields the same key.
    fn sensor_key(&self, sensor: RawHandle) -> NativeResult<String> {
        let name = self.sensor_info(sensor, CameraInfo::Name)?;
        let serial = match self.create_device_from_sensor(sensor)? {
            Some(device) => {
                let serial = self.device_info(device, CameraInfo::SerialNumber);
                self.release(HandleKind::Device, device);
                serial?
            }
            None => String::new(),
        };
        Ok(format!("{}/{}", serial, name))
    }

    // stream profile
    fn stream_profile_data(&self, profile: RawHandle) -> NativeResult<StreamProfileData>;
    fn video_intrinsics(&self, profile: RawHandle) -> NativeResult<Intrinsics>;
    fn motion_intrinsics(&self, profile: RawHandle) -> NativeResult<MotionIntrinsics>;
    fn extrinsics(&self, from: RawHandle, to: RawHandle) -> NativeResult<Extrinsics>;

    // config
    fn create_config(&self) -> NativeResult<RawHandle>;
    fn config_enable_stream(&self, config: RawHandle, request: &StreamRequest) -> NativeResult<()>;
    fn config_disable_stream(
        &self,
        config: RawHandle,
        kind: StreamKind,
        index: Option<i32>,
    ) -> NativeResult<()>;
    fn config_enable_all_streams(&self, config: RawHandle) -> NativeResult<()>;
    fn config_disable_all_streams(&self, config: RawHandle) -> NativeResult<()>;
    fn config_enable_device(&self, config: RawHandle, serial: &str) -> NativeResult<()>;

    // pipeline
    fn create_pipeline(&self, ctx: RawHandle) -> NativeResult<RawHandle>;
    fn pipeline_start(&self, pipe: RawHandle, config: Option<RawHandle>) -> NativeResult<RawHandle>;
    fn pipeline_stop(&self, pipe: RawHandle) -> NativeResult<()>;
    /// Blocks up to `timeout`. `None` means nothing arrived in time.
    fn pipeline_wait_for_frames(&self, pipe: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>>;
    fn pipeline_poll_for_frames(&self, pipe: RawHandle) -> NativeResult<Option<RawHandle>>;
    fn pipeline_active_profile(&self, pipe: RawHandle) -> NativeResult<RawHandle>;
    fn pipeline_profile_device(&self, profile: RawHandle) -> NativeResult<RawHandle>;
    fn pipeline_profile_streams(&self, profile: RawHandle) -> NativeResult<Vec<RawHandle>>;

    // frames
    fn embedded_frame_count(&self, composite: RawHandle) -> NativeResult<usize>;
    fn extract_frame(&self, composite: RawHandle, index: usize) -> NativeResult<RawHandle>;
    /// New reference to the same native frame, released independently.
    fn clone_frame(&self, frame: RawHandle) -> NativeResult<RawHandle>;
    fn frame_stream_profile(&self, frame: RawHandle) -> NativeResult<RawHandle>;
    fn frame_capabilities(&self, frame: RawHandle) -> NativeResult<FrameCapabilities>;
    fn frame_info(&self, frame: RawHandle) -> NativeResult<FrameInfo>;
    fn video_frame_info(&self, frame: RawHandle) -> NativeResult<VideoFrameInfo>;
    fn frame_data(&self, frame: RawHandle) -> NativeResult<RawBuffer>;
    fn depth_distance(&self, frame: RawHandle, x: u32, y: u32) -> NativeResult<f32>;
    fn motion_data(&self, frame: RawHandle) -> NativeResult<[f32; 3]>;
    fn pose_data(&self, frame: RawHandle) -> NativeResult<PoseData>;
    fn supports_frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<bool>;
    fn frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<i64>;

    // processing blocks. Each block owns a one-deep output queue: an unread
    // result is replaced by the next one. Blocks with options accept the
    // option calls above in place of a sensor.
    fn create_align(&self, align_to: StreamKind) -> NativeResult<RawHandle>;
    fn create_colorizer(&self) -> NativeResult<RawHandle>;
    fn create_syncer(&self) -> NativeResult<RawHandle>;
    /// Feed `frame` (single or composite) to `block`. The block takes its
    /// own reference; the caller still owns `frame`.
    fn process_frame(&self, block: RawHandle, frame: RawHandle) -> NativeResult<()>;
    /// Blocks up to `timeout` for the block's next output frame.
    fn block_wait_for_frame(&self, block: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>>;
    fn block_poll_for_frame(&self, block: RawHandle) -> NativeResult<Option<RawHandle>>;

    /// Milliseconds on the SDK's system clock, comparable with
    /// system-time frame timestamps.
    fn time(&self) -> NativeResult<f64>;

    /// Process-wide sink for errors the SDK raises outside of any call.
    fn set_error_callback(&self, callback: ErrorCallback) {
        let _ = callback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_handle_rejects_null() {
        assert!(RawHandle::new(0).is_none());
        assert!(RawHandle::from_ptr::<u8>(std::ptr::null()).is_none());
        let h = RawHandle::new(0x40).unwrap();
        assert_eq!(h.get(), 0x40);
        assert_eq!(h.as_ptr::<u8>() as usize, 0x40);
    }

    #[test]
    fn test_empty_buffer() {
        let b = RawBuffer::empty();
        assert!(b.is_empty());
        assert_eq!(b.len(), 0);
    }
}
