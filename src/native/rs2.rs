//! librealsense2 backend over the C API.
//!
//! Built with the `realsense` feature; links against the system `realsense2`
//! library. Every handle returned here is owned by the caller, matching the
//! [`Sdk`] contract. Stream profiles are the one exception on the native side
//! (they are borrowed from a list or a frame), so each one handed out keeps
//! its parent alive until it is released.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    DevicesChangedCallback, HandleKind, NativeResult, NotificationCallback, RawBuffer, RawHandle,
    Sdk,
};
use crate::config::StreamRequest;
use crate::error::{NativeError, NativeErrorKind};
use crate::types::{
    CameraInfo, Extrinsics, Format, FrameCapabilities, FrameInfo, FrameMetadata, Intrinsics,
    MotionIntrinsics, OptionRange, PoseData, RawNotification, RegionOfInterest,
    SensorCapabilities, SensorOption, StreamKind, StreamProfileData, TimestampDomain,
    VideoFrameInfo,
};

/// API version requested from the runtime library (2.50.0).
const API_VERSION: c_int = 25000;

#[allow(non_camel_case_types)]
mod sys {
    use std::ffi::{c_char, c_int, c_uint, c_void};

    macro_rules! opaque {
        ($($name:ident),+ $(,)?) => {
            $(
                #[repr(C)]
                pub struct $name {
                    _private: [u8; 0],
                }
            )+
        };
    }

    opaque!(
        rs2_error,
        rs2_context,
        rs2_device_list,
        rs2_device,
        rs2_sensor_list,
        rs2_sensor,
        rs2_options,
        rs2_stream_profile_list,
        rs2_stream_profile,
        rs2_config,
        rs2_pipeline,
        rs2_pipeline_profile,
        rs2_frame,
        rs2_notification,
        rs2_processing_block,
        rs2_frame_queue,
    );

    pub const RS2_EXTENSION_ROI: c_int = 6;
    pub const RS2_EXTENSION_DEPTH_SENSOR: c_int = 7;
    pub const RS2_EXTENSION_VIDEO_FRAME: c_int = 8;
    pub const RS2_EXTENSION_MOTION_FRAME: c_int = 9;
    pub const RS2_EXTENSION_COMPOSITE_FRAME: c_int = 10;
    pub const RS2_EXTENSION_DEPTH_FRAME: c_int = 12;
    pub const RS2_EXTENSION_VIDEO_PROFILE: c_int = 15;
    pub const RS2_EXTENSION_DISPARITY_FRAME: c_int = 18;
    pub const RS2_EXTENSION_MOTION_PROFILE: c_int = 19;
    pub const RS2_EXTENSION_POSE_FRAME: c_int = 20;

    #[repr(C)]
    #[derive(Default)]
    pub struct rs2_intrinsics {
        pub width: c_int,
        pub height: c_int,
        pub ppx: f32,
        pub ppy: f32,
        pub fx: f32,
        pub fy: f32,
        pub model: c_int,
        pub coeffs: [f32; 5],
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct rs2_motion_device_intrinsic {
        pub data: [[f32; 4]; 3],
        pub noise_variances: [f32; 3],
        pub bias_variances: [f32; 3],
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct rs2_extrinsics {
        pub rotation: [f32; 9],
        pub translation: [f32; 3],
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct rs2_pose {
        pub translation: [f32; 3],
        pub velocity: [f32; 3],
        pub acceleration: [f32; 3],
        pub rotation: [f32; 4],
        pub angular_velocity: [f32; 3],
        pub angular_acceleration: [f32; 3],
        pub tracker_confidence: c_uint,
        pub mapper_confidence: c_uint,
    }

    pub type rs2_devices_changed_callback_ptr =
        extern "C" fn(*mut rs2_device_list, *mut rs2_device_list, *mut c_void);
    pub type rs2_notification_callback_ptr = extern "C" fn(*mut rs2_notification, *mut c_void);

    #[link(name = "realsense2")]
    extern "C" {
        pub fn rs2_get_error_message(error: *const rs2_error) -> *const c_char;
        pub fn rs2_get_failed_function(error: *const rs2_error) -> *const c_char;
        pub fn rs2_get_librealsense_exception_type(error: *const rs2_error) -> c_int;
        pub fn rs2_free_error(error: *mut rs2_error);

        pub fn rs2_create_context(api_version: c_int, error: *mut *mut rs2_error) -> *mut rs2_context;
        pub fn rs2_delete_context(context: *mut rs2_context);
        pub fn rs2_query_devices(context: *const rs2_context, error: *mut *mut rs2_error) -> *mut rs2_device_list;
        pub fn rs2_set_devices_changed_callback(
            context: *const rs2_context,
            callback: rs2_devices_changed_callback_ptr,
            user: *mut c_void,
            error: *mut *mut rs2_error,
        );

        pub fn rs2_get_device_count(list: *const rs2_device_list, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_create_device(list: *const rs2_device_list, index: c_int, error: *mut *mut rs2_error) -> *mut rs2_device;
        pub fn rs2_device_list_contains(
            list: *const rs2_device_list,
            device: *const rs2_device,
            error: *mut *mut rs2_error,
        ) -> c_int;
        pub fn rs2_delete_device_list(list: *mut rs2_device_list);

        pub fn rs2_supports_device_info(device: *const rs2_device, info: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_device_info(device: *const rs2_device, info: c_int, error: *mut *mut rs2_error) -> *const c_char;
        pub fn rs2_hardware_reset(device: *const rs2_device, error: *mut *mut rs2_error);
        pub fn rs2_query_sensors(device: *const rs2_device, error: *mut *mut rs2_error) -> *mut rs2_sensor_list;
        pub fn rs2_delete_device(device: *mut rs2_device);

        pub fn rs2_get_sensors_count(list: *const rs2_sensor_list, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_create_sensor(list: *const rs2_sensor_list, index: c_int, error: *mut *mut rs2_error) -> *mut rs2_sensor;
        pub fn rs2_delete_sensor_list(list: *mut rs2_sensor_list);
        pub fn rs2_create_device_from_sensor(sensor: *const rs2_sensor, error: *mut *mut rs2_error) -> *mut rs2_device;
        pub fn rs2_supports_sensor_info(sensor: *const rs2_sensor, info: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_sensor_info(sensor: *const rs2_sensor, info: c_int, error: *mut *mut rs2_error) -> *const c_char;
        pub fn rs2_is_sensor_extendable_to(sensor: *const rs2_sensor, extension: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_depth_scale(sensor: *mut rs2_sensor, error: *mut *mut rs2_error) -> f32;
        pub fn rs2_get_stream_profiles(sensor: *mut rs2_sensor, error: *mut *mut rs2_error) -> *mut rs2_stream_profile_list;
        pub fn rs2_set_region_of_interest(
            sensor: *const rs2_sensor,
            min_x: c_int,
            min_y: c_int,
            max_x: c_int,
            max_y: c_int,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_get_region_of_interest(
            sensor: *const rs2_sensor,
            min_x: *mut c_int,
            min_y: *mut c_int,
            max_x: *mut c_int,
            max_y: *mut c_int,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_set_notifications_callback(
            sensor: *const rs2_sensor,
            callback: rs2_notification_callback_ptr,
            user: *mut c_void,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_delete_sensor(sensor: *mut rs2_sensor);

        pub fn rs2_get_notification_description(n: *mut rs2_notification, error: *mut *mut rs2_error) -> *const c_char;
        pub fn rs2_get_notification_timestamp(n: *mut rs2_notification, error: *mut *mut rs2_error) -> f64;
        pub fn rs2_get_notification_severity(n: *mut rs2_notification, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_notification_category(n: *mut rs2_notification, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_notification_serialized_data(n: *mut rs2_notification, error: *mut *mut rs2_error) -> *const c_char;

        pub fn rs2_supports_option(options: *const rs2_options, option: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_option(options: *const rs2_options, option: c_int, error: *mut *mut rs2_error) -> f32;
        pub fn rs2_set_option(options: *const rs2_options, option: c_int, value: f32, error: *mut *mut rs2_error);
        pub fn rs2_get_option_range(
            options: *const rs2_options,
            option: c_int,
            min: *mut f32,
            max: *mut f32,
            step: *mut f32,
            def: *mut f32,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_is_option_read_only(options: *const rs2_options, option: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_option_description(options: *const rs2_options, option: c_int, error: *mut *mut rs2_error) -> *const c_char;
        pub fn rs2_get_option_value_description(
            options: *const rs2_options,
            option: c_int,
            value: f32,
            error: *mut *mut rs2_error,
        ) -> *const c_char;

        pub fn rs2_get_stream_profiles_count(list: *const rs2_stream_profile_list, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_stream_profile(
            list: *const rs2_stream_profile_list,
            index: c_int,
            error: *mut *mut rs2_error,
        ) -> *const rs2_stream_profile;
        pub fn rs2_delete_stream_profiles_list(list: *mut rs2_stream_profile_list);
        pub fn rs2_get_stream_profile_data(
            profile: *const rs2_stream_profile,
            stream: *mut c_int,
            format: *mut c_int,
            index: *mut c_int,
            unique_id: *mut c_int,
            framerate: *mut c_int,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_is_stream_profile_default(profile: *const rs2_stream_profile, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_stream_profile_is(profile: *const rs2_stream_profile, extension: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_video_stream_resolution(
            profile: *const rs2_stream_profile,
            width: *mut c_int,
            height: *mut c_int,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_get_video_stream_intrinsics(
            profile: *const rs2_stream_profile,
            intrinsics: *mut rs2_intrinsics,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_get_motion_intrinsics(
            profile: *const rs2_stream_profile,
            intrinsics: *mut rs2_motion_device_intrinsic,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_get_extrinsics(
            from: *const rs2_stream_profile,
            to: *const rs2_stream_profile,
            extrinsics: *mut rs2_extrinsics,
            error: *mut *mut rs2_error,
        );

        pub fn rs2_create_config(error: *mut *mut rs2_error) -> *mut rs2_config;
        pub fn rs2_delete_config(config: *mut rs2_config);
        pub fn rs2_config_enable_stream(
            config: *mut rs2_config,
            stream: c_int,
            index: c_int,
            width: c_int,
            height: c_int,
            format: c_int,
            framerate: c_int,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_config_enable_all_stream(config: *mut rs2_config, error: *mut *mut rs2_error);
        pub fn rs2_config_enable_device(config: *mut rs2_config, serial: *const c_char, error: *mut *mut rs2_error);
        pub fn rs2_config_disable_stream(config: *mut rs2_config, stream: c_int, error: *mut *mut rs2_error);
        pub fn rs2_config_disable_indexed_stream(config: *mut rs2_config, stream: c_int, index: c_int, error: *mut *mut rs2_error);
        pub fn rs2_config_disable_all_streams(config: *mut rs2_config, error: *mut *mut rs2_error);

        pub fn rs2_create_pipeline(context: *mut rs2_context, error: *mut *mut rs2_error) -> *mut rs2_pipeline;
        pub fn rs2_delete_pipeline(pipe: *mut rs2_pipeline);
        pub fn rs2_pipeline_start(pipe: *mut rs2_pipeline, error: *mut *mut rs2_error) -> *mut rs2_pipeline_profile;
        pub fn rs2_pipeline_start_with_config(
            pipe: *mut rs2_pipeline,
            config: *mut rs2_config,
            error: *mut *mut rs2_error,
        ) -> *mut rs2_pipeline_profile;
        pub fn rs2_pipeline_stop(pipe: *mut rs2_pipeline, error: *mut *mut rs2_error);
        pub fn rs2_pipeline_try_wait_for_frames(
            pipe: *mut rs2_pipeline,
            output: *mut *mut rs2_frame,
            timeout_ms: c_uint,
            error: *mut *mut rs2_error,
        ) -> c_int;
        pub fn rs2_pipeline_poll_for_frames(
            pipe: *mut rs2_pipeline,
            output: *mut *mut rs2_frame,
            error: *mut *mut rs2_error,
        ) -> c_int;
        pub fn rs2_pipeline_get_active_profile(pipe: *mut rs2_pipeline, error: *mut *mut rs2_error) -> *mut rs2_pipeline_profile;
        pub fn rs2_pipeline_profile_get_device(profile: *mut rs2_pipeline_profile, error: *mut *mut rs2_error) -> *mut rs2_device;
        pub fn rs2_pipeline_profile_get_streams(
            profile: *mut rs2_pipeline_profile,
            error: *mut *mut rs2_error,
        ) -> *mut rs2_stream_profile_list;
        pub fn rs2_delete_pipeline_profile(profile: *mut rs2_pipeline_profile);

        pub fn rs2_release_frame(frame: *mut rs2_frame);
        pub fn rs2_frame_add_ref(frame: *mut rs2_frame, error: *mut *mut rs2_error);
        pub fn rs2_embedded_frames_count(composite: *mut rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_extract_frame(composite: *mut rs2_frame, index: c_int, error: *mut *mut rs2_error) -> *mut rs2_frame;
        pub fn rs2_get_frame_stream_profile(frame: *const rs2_frame, error: *mut *mut rs2_error) -> *const rs2_stream_profile;
        pub fn rs2_is_frame_extendable_to(frame: *const rs2_frame, extension: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_number(frame: *const rs2_frame, error: *mut *mut rs2_error) -> u64;
        pub fn rs2_get_frame_timestamp(frame: *const rs2_frame, error: *mut *mut rs2_error) -> f64;
        pub fn rs2_get_frame_timestamp_domain(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_width(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_height(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_stride_in_bytes(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_bits_per_pixel(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_data(frame: *const rs2_frame, error: *mut *mut rs2_error) -> *const c_void;
        pub fn rs2_get_frame_data_size(frame: *const rs2_frame, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_depth_frame_get_distance(frame: *const rs2_frame, x: c_int, y: c_int, error: *mut *mut rs2_error) -> f32;
        pub fn rs2_pose_frame_get_pose_data(frame: *const rs2_frame, pose: *mut rs2_pose, error: *mut *mut rs2_error);
        pub fn rs2_supports_frame_metadata(frame: *const rs2_frame, attr: c_int, error: *mut *mut rs2_error) -> c_int;
        pub fn rs2_get_frame_metadata(frame: *const rs2_frame, attr: c_int, error: *mut *mut rs2_error) -> i64;

        pub fn rs2_create_align(align_to: c_int, error: *mut *mut rs2_error) -> *mut rs2_processing_block;
        pub fn rs2_create_colorizer(error: *mut *mut rs2_error) -> *mut rs2_processing_block;
        pub fn rs2_create_sync_processing_block(error: *mut *mut rs2_error) -> *mut rs2_processing_block;
        pub fn rs2_start_processing_queue(
            block: *mut rs2_processing_block,
            queue: *mut rs2_frame_queue,
            error: *mut *mut rs2_error,
        );
        pub fn rs2_process_frame(block: *mut rs2_processing_block, frame: *mut rs2_frame, error: *mut *mut rs2_error);
        pub fn rs2_delete_processing_block(block: *mut rs2_processing_block);

        pub fn rs2_create_frame_queue(capacity: c_int, error: *mut *mut rs2_error) -> *mut rs2_frame_queue;
        pub fn rs2_try_wait_for_frame(
            queue: *mut rs2_frame_queue,
            timeout_ms: c_uint,
            output: *mut *mut rs2_frame,
            error: *mut *mut rs2_error,
        ) -> c_int;
        pub fn rs2_poll_for_frame(
            queue: *mut rs2_frame_queue,
            output: *mut *mut rs2_frame,
            error: *mut *mut rs2_error,
        ) -> c_int;
        pub fn rs2_delete_frame_queue(queue: *mut rs2_frame_queue);

        pub fn rs2_get_time(error: *mut *mut rs2_error) -> f64;
    }
}

/// Read and free a native error.
///
/// # Safety
/// `err` must be a non-null error produced by the library and not yet freed.
unsafe fn take_error(err: *mut sys::rs2_error) -> NativeError {
    let message = c_string(sys::rs2_get_error_message(err));
    let function = c_string(sys::rs2_get_failed_function(err));
    let kind = NativeErrorKind::from_raw(sys::rs2_get_librealsense_exception_type(err));
    sys::rs2_free_error(err);
    NativeError::new(function, message, kind)
}

/// # Safety
/// `p` must be null or point at a NUL-terminated string.
unsafe fn c_string(p: *const c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        CStr::from_ptr(p).to_string_lossy().into_owned()
    }
}

/// Run one native call with an error out-parameter.
fn call<T>(f: impl FnOnce(*mut *mut sys::rs2_error) -> T) -> NativeResult<T> {
    let mut err: *mut sys::rs2_error = ptr::null_mut();
    let value = f(&mut err);
    if err.is_null() {
        Ok(value)
    } else {
        // SAFETY: a non-null out-parameter is an error the library just allocated.
        Err(unsafe { take_error(err) })
    }
}

fn non_null<T>(p: *mut T, function: &str) -> NativeResult<RawHandle> {
    RawHandle::from_ptr(p as *const T).ok_or_else(|| {
        NativeError::new(function, "returned a null handle", NativeErrorKind::Unknown)
    })
}

fn flag(value: c_int) -> bool {
    value != 0
}

/// A stream profile list kept alive for the profiles borrowed from it.
struct ProfileList(*mut sys::rs2_stream_profile_list);

impl Drop for ProfileList {
    fn drop(&mut self) {
        // SAFETY: the list was returned by the library and is deleted once.
        unsafe { sys::rs2_delete_stream_profiles_list(self.0) }
    }
}

/// One reference to a native frame.
struct FrameRef(*mut sys::rs2_frame);

impl Drop for FrameRef {
    fn drop(&mut self) {
        // SAFETY: the reference was taken with rs2_frame_add_ref.
        unsafe { sys::rs2_release_frame(self.0) }
    }
}

/// Output queue of one processing block.
struct FrameQueue(*mut sys::rs2_frame_queue);

impl Drop for FrameQueue {
    fn drop(&mut self) {
        // SAFETY: the queue was created for one block and is deleted once,
        // after that block.
        unsafe { sys::rs2_delete_frame_queue(self.0) }
    }
}

// SAFETY: librealsense objects are internally synchronised; these wrappers
// only ever delete what they own.
unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}
unsafe impl Send for ProfileList {}
unsafe impl Sync for ProfileList {}
unsafe impl Send for FrameRef {}
unsafe impl Sync for FrameRef {}

#[allow(dead_code)]
enum ProfileOwner {
    List(Arc<ProfileList>),
    Frame(FrameRef),
}

extern "C" fn devices_changed_trampoline(
    removed: *mut sys::rs2_device_list,
    added: *mut sys::rs2_device_list,
    user: *mut c_void,
) {
    // SAFETY: `user` is the boxed callback registered with this trampoline; it
    // lives until its context is released.
    let callback = unsafe { &*(user as *const DevicesChangedCallback) };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        callback(RawHandle::from_ptr(removed as *const _), RawHandle::from_ptr(added as *const _))
    }));
    if outcome.is_err() {
        log::error!("rs2: devices-changed listener panicked");
    }
}

/// # Safety
/// `n` must be a live notification passed to a notification callback.
unsafe fn read_notification(n: *mut sys::rs2_notification) -> NativeResult<RawNotification> {
    Ok(RawNotification {
        description: c_string(call(|e| sys::rs2_get_notification_description(n, e))?),
        timestamp: call(|e| sys::rs2_get_notification_timestamp(n, e))?,
        severity: call(|e| sys::rs2_get_notification_severity(n, e))?,
        category: call(|e| sys::rs2_get_notification_category(n, e))?,
        serialized_data: c_string(call(|e| sys::rs2_get_notification_serialized_data(n, e))?),
    })
}

extern "C" fn notification_trampoline(n: *mut sys::rs2_notification, user: *mut c_void) {
    // SAFETY: `user` is a boxed callback owned by the `Rs2Sdk` that registered it.
    let callback = unsafe { &*(user as *const NotificationCallback) };
    // SAFETY: the library passes a live notification for the duration of the call.
    let raw = match unsafe { read_notification(n) } {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("rs2: dropping unreadable notification: {}", e);
            return;
        }
    };
    if catch_unwind(AssertUnwindSafe(|| callback(raw))).is_err() {
        log::error!("rs2: notification listener panicked");
    }
}

/// [`Sdk`] over the librealsense2 runtime library.
#[derive(Default)]
pub struct Rs2Sdk {
    profile_owners: Mutex<HashMap<usize, Vec<ProfileOwner>>>,
    devices_changed: Mutex<HashMap<usize, Vec<Box<DevicesChangedCallback>>>>,
    // Native sensors keep their callback after the rs2_sensor wrapper is gone.
    notifications: Mutex<Vec<Box<NotificationCallback>>>,
    queues: Mutex<HashMap<usize, FrameQueue>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Rs2Sdk {
    pub fn new() -> Self {
        Self::default()
    }

    fn lend_profile(&self, profile: *const sys::rs2_stream_profile, owner: ProfileOwner, function: &str) -> NativeResult<RawHandle> {
        let raw = non_null(profile as *mut sys::rs2_stream_profile, function)?;
        guard(&self.profile_owners).entry(raw.get()).or_default().push(owner);
        Ok(raw)
    }

    /// Hand out every profile of a freshly returned list.
    fn lend_profile_list(&self, list: *mut sys::rs2_stream_profile_list, function: &str) -> NativeResult<Vec<RawHandle>> {
        if list.is_null() {
            return Ok(Vec::new());
        }
        let owner = Arc::new(ProfileList(list));
        let count = call(|e| unsafe { sys::rs2_get_stream_profiles_count(list, e) })?;
        let mut profiles = Vec::with_capacity(count.max(0) as usize);
        for i in 0..count {
            profiles.push(call(|e| unsafe { sys::rs2_get_stream_profile(list, i, e) })?);
        }
        profiles
            .into_iter()
            .map(|p| self.lend_profile(p, ProfileOwner::List(owner.clone()), function))
            .collect()
    }

    /// Attach a one-deep output queue to a freshly created block.
    fn start_block(&self, block: *mut sys::rs2_processing_block, function: &str) -> NativeResult<RawHandle> {
        let raw = non_null(block, function)?;
        let started = call(|e| unsafe { sys::rs2_create_frame_queue(1, e) })
            .and_then(|q| non_null(q, "rs2_create_frame_queue").map(|_| FrameQueue(q)))
            .and_then(|queue| {
                call(|e| unsafe { sys::rs2_start_processing_queue(block, queue.0, e) })?;
                Ok(queue)
            });
        match started {
            Ok(queue) => {
                guard(&self.queues).insert(raw.get(), queue);
                Ok(raw)
            }
            Err(err) => {
                // SAFETY: the block was just created and nothing else holds it.
                unsafe { sys::rs2_delete_processing_block(block) };
                Err(err)
            }
        }
    }

    fn queue_of(&self, block: RawHandle, function: &str) -> NativeResult<*mut sys::rs2_frame_queue> {
        guard(&self.queues).get(&block.get()).map(|q| q.0).ok_or_else(|| {
            NativeError::new(function, "not a processing block", NativeErrorKind::InvalidValue)
        })
    }

    fn option_call<T>(
        sensor: RawHandle,
        option: SensorOption,
        f: impl FnOnce(*const sys::rs2_options, c_int, *mut *mut sys::rs2_error) -> T,
    ) -> NativeResult<T> {
        call(|e| f(sensor.as_ptr::<sys::rs2_options>(), option.as_raw(), e))
    }
}

impl Sdk for Rs2Sdk {
    fn release(&self, kind: HandleKind, raw: RawHandle) {
        // SAFETY: the managed layer releases each handle once with its kind.
        unsafe {
            match kind {
                HandleKind::Context => {
                    sys::rs2_delete_context(raw.as_ptr());
                    guard(&self.devices_changed).remove(&raw.get());
                }
                HandleKind::DeviceList => sys::rs2_delete_device_list(raw.as_ptr()),
                HandleKind::Device => sys::rs2_delete_device(raw.as_ptr()),
                HandleKind::Sensor => sys::rs2_delete_sensor(raw.as_ptr()),
                HandleKind::StreamProfile => {
                    let owner = {
                        let mut owners = guard(&self.profile_owners);
                        let owner = owners.get_mut(&raw.get()).and_then(Vec::pop);
                        if owners.get(&raw.get()).is_some_and(Vec::is_empty) {
                            owners.remove(&raw.get());
                        }
                        owner
                    };
                    if owner.is_none() {
                        log::warn!("rs2: release of unknown stream profile {:#x}", raw.get());
                    }
                }
                HandleKind::Config => sys::rs2_delete_config(raw.as_ptr()),
                HandleKind::Pipeline => sys::rs2_delete_pipeline(raw.as_ptr()),
                HandleKind::PipelineProfile => sys::rs2_delete_pipeline_profile(raw.as_ptr()),
                HandleKind::Frame => sys::rs2_release_frame(raw.as_ptr()),
                HandleKind::ProcessingBlock => {
                    sys::rs2_delete_processing_block(raw.as_ptr());
                    guard(&self.queues).remove(&raw.get());
                }
            }
        }
    }

    fn create_context(&self) -> NativeResult<RawHandle> {
        let ctx = call(|e| unsafe { sys::rs2_create_context(API_VERSION, e) })?;
        non_null(ctx, "rs2_create_context")
    }

    fn query_devices(&self, ctx: RawHandle) -> NativeResult<Option<RawHandle>> {
        let list = call(|e| unsafe { sys::rs2_query_devices(ctx.as_ptr(), e) })?;
        Ok(RawHandle::from_ptr(list as *const _))
    }

    fn create_device_from_sensor(&self, sensor: RawHandle) -> NativeResult<Option<RawHandle>> {
        match call(|e| unsafe { sys::rs2_create_device_from_sensor(sensor.as_ptr(), e) }) {
            Ok(device) => Ok(RawHandle::from_ptr(device as *const _)),
            Err(e) if e.kind == NativeErrorKind::CameraDisconnected => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_devices_changed_callback(&self, ctx: RawHandle, callback: DevicesChangedCallback) -> NativeResult<()> {
        let boxed = Box::new(callback);
        let user = &*boxed as *const DevicesChangedCallback as *mut c_void;
        call(|e| unsafe {
            sys::rs2_set_devices_changed_callback(ctx.as_ptr(), devices_changed_trampoline, user, e)
        })?;
        guard(&self.devices_changed).entry(ctx.get()).or_default().push(boxed);
        Ok(())
    }

    fn device_count(&self, list: RawHandle) -> NativeResult<usize> {
        let n = call(|e| unsafe { sys::rs2_get_device_count(list.as_ptr(), e) })?;
        Ok(n.max(0) as usize)
    }

    fn create_device(&self, list: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let device = call(|e| unsafe { sys::rs2_create_device(list.as_ptr(), index as c_int, e) })?;
        non_null(device, "rs2_create_device")
    }

    fn device_list_contains(&self, list: RawHandle, device: RawHandle) -> NativeResult<bool> {
        call(|e| unsafe { sys::rs2_device_list_contains(list.as_ptr(), device.as_ptr(), e) }).map(flag)
    }

    fn supports_device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<bool> {
        call(|e| unsafe { sys::rs2_supports_device_info(device.as_ptr(), info.as_raw(), e) }).map(flag)
    }

    fn device_info(&self, device: RawHandle, info: CameraInfo) -> NativeResult<String> {
        let p = call(|e| unsafe { sys::rs2_get_device_info(device.as_ptr(), info.as_raw(), e) })?;
        Ok(unsafe { c_string(p) })
    }

    fn hardware_reset(&self, device: RawHandle) -> NativeResult<()> {
        call(|e| unsafe { sys::rs2_hardware_reset(device.as_ptr(), e) })
    }

    fn query_sensors(&self, device: RawHandle) -> NativeResult<Vec<RawHandle>> {
        let list = call(|e| unsafe { sys::rs2_query_sensors(device.as_ptr(), e) })?;
        if list.is_null() {
            return Ok(Vec::new());
        }
        let collected = (|| {
            let count = call(|e| unsafe { sys::rs2_get_sensors_count(list, e) })?;
            let mut sensors = Vec::new();
            for i in 0..count {
                match call(|e| unsafe { sys::rs2_create_sensor(list, i, e) })
                    .and_then(|s| non_null(s, "rs2_create_sensor"))
                {
                    Ok(s) => sensors.push(s),
                    Err(err) => {
                        for s in sensors {
                            self.release(HandleKind::Sensor, s);
                        }
                        return Err(err);
                    }
                }
            }
            Ok(sensors)
        })();
        // SAFETY: sensors created from the list own their native objects.
        unsafe { sys::rs2_delete_sensor_list(list) };
        collected
    }

    fn supports_sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<bool> {
        call(|e| unsafe { sys::rs2_supports_sensor_info(sensor.as_ptr(), info.as_raw(), e) }).map(flag)
    }

    fn sensor_info(&self, sensor: RawHandle, info: CameraInfo) -> NativeResult<String> {
        let p = call(|e| unsafe { sys::rs2_get_sensor_info(sensor.as_ptr(), info.as_raw(), e) })?;
        Ok(unsafe { c_string(p) })
    }

    fn sensor_capabilities(&self, sensor: RawHandle) -> NativeResult<SensorCapabilities> {
        let is = |ext| call(|e| unsafe { sys::rs2_is_sensor_extendable_to(sensor.as_ptr(), ext, e) }).map(flag);
        let mut caps = SensorCapabilities::empty();
        caps.set(SensorCapabilities::DEPTH, is(sys::RS2_EXTENSION_DEPTH_SENSOR)?);
        caps.set(SensorCapabilities::ROI, is(sys::RS2_EXTENSION_ROI)?);
        Ok(caps)
    }

    fn depth_scale(&self, sensor: RawHandle) -> NativeResult<f32> {
        call(|e| unsafe { sys::rs2_get_depth_scale(sensor.as_ptr(), e) })
    }

    fn stream_profiles(&self, sensor: RawHandle) -> NativeResult<Vec<RawHandle>> {
        let list = call(|e| unsafe { sys::rs2_get_stream_profiles(sensor.as_ptr(), e) })?;
        self.lend_profile_list(list, "rs2_get_stream_profiles")
    }

    fn supports_option(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool> {
        Self::option_call(sensor, option, |o, v, e| unsafe { sys::rs2_supports_option(o, v, e) }).map(flag)
    }

    fn option_value(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<f32> {
        Self::option_call(sensor, option, |o, v, e| unsafe { sys::rs2_get_option(o, v, e) })
    }

    fn set_option_value(&self, sensor: RawHandle, option: SensorOption, value: f32) -> NativeResult<()> {
        Self::option_call(sensor, option, |o, v, e| unsafe { sys::rs2_set_option(o, v, value, e) })
    }

    fn option_range(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<OptionRange> {
        let (mut min, mut max, mut step, mut default) = (0.0, 0.0, 0.0, 0.0);
        Self::option_call(sensor, option, |o, v, e| unsafe {
            sys::rs2_get_option_range(o, v, &mut min, &mut max, &mut step, &mut default, e)
        })?;
        Ok(OptionRange {
            min,
            max,
            step,
            default,
        })
    }

    fn is_option_read_only(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<bool> {
        Self::option_call(sensor, option, |o, v, e| unsafe { sys::rs2_is_option_read_only(o, v, e) }).map(flag)
    }

    fn option_description(&self, sensor: RawHandle, option: SensorOption) -> NativeResult<String> {
        let p = Self::option_call(sensor, option, |o, v, e| unsafe { sys::rs2_get_option_description(o, v, e) })?;
        Ok(unsafe { c_string(p) })
    }

    fn option_value_description(
        &self,
        sensor: RawHandle,
        option: SensorOption,
        value: f32,
    ) -> NativeResult<Option<String>> {
        let p = Self::option_call(sensor, option, |o, v, e| unsafe {
            sys::rs2_get_option_value_description(o, v, value, e)
        })?;
        Ok((!p.is_null()).then(|| unsafe { c_string(p) }))
    }

    fn region_of_interest(&self, sensor: RawHandle) -> NativeResult<RegionOfInterest> {
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (0, 0, 0, 0);
        call(|e| unsafe {
            sys::rs2_get_region_of_interest(sensor.as_ptr(), &mut min_x, &mut min_y, &mut max_x, &mut max_y, e)
        })?;
        Ok(RegionOfInterest {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    fn set_region_of_interest(&self, sensor: RawHandle, roi: RegionOfInterest) -> NativeResult<()> {
        call(|e| unsafe {
            sys::rs2_set_region_of_interest(sensor.as_ptr(), roi.min_x, roi.min_y, roi.max_x, roi.max_y, e)
        })
    }

    fn set_notifications_callback(&self, sensor: RawHandle, callback: NotificationCallback) -> NativeResult<()> {
        let boxed = Box::new(callback);
        let user = &*boxed as *const NotificationCallback as *mut c_void;
        call(|e| unsafe {
            sys::rs2_set_notifications_callback(sensor.as_ptr(), notification_trampoline, user, e)
        })?;
        guard(&self.notifications).push(boxed);
        Ok(())
    }

    fn stream_profile_data(&self, profile: RawHandle) -> NativeResult<StreamProfileData> {
        let p = profile.as_ptr::<sys::rs2_stream_profile>() as *const sys::rs2_stream_profile;
        let (mut stream, mut format, mut index, mut unique_id, mut fps) = (0, 0, 0, 0, 0);
        call(|e| unsafe {
            sys::rs2_get_stream_profile_data(p, &mut stream, &mut format, &mut index, &mut unique_id, &mut fps, e)
        })?;
        let is_default = call(|e| unsafe { sys::rs2_is_stream_profile_default(p, e) }).map(flag)?;
        let is_video = call(|e| unsafe { sys::rs2_stream_profile_is(p, sys::RS2_EXTENSION_VIDEO_PROFILE, e) }).map(flag)?;
        let is_motion = call(|e| unsafe { sys::rs2_stream_profile_is(p, sys::RS2_EXTENSION_MOTION_PROFILE, e) }).map(flag)?;
        let video_size = if is_video {
            let (mut width, mut height) = (0, 0);
            call(|e| unsafe { sys::rs2_get_video_stream_resolution(p, &mut width, &mut height, e) })?;
            Some((width.max(0) as u32, height.max(0) as u32))
        } else {
            None
        };
        Ok(StreamProfileData {
            kind: StreamKind::from_raw(stream).unwrap_or(StreamKind::Any),
            format: Format::from_raw(format).unwrap_or(Format::Any),
            index,
            unique_id,
            fps: fps.max(0) as u32,
            is_default,
            video_size,
            is_motion,
        })
    }

    fn video_intrinsics(&self, profile: RawHandle) -> NativeResult<Intrinsics> {
        let mut out = sys::rs2_intrinsics::default();
        call(|e| unsafe { sys::rs2_get_video_stream_intrinsics(profile.as_ptr(), &mut out, e) })?;
        Ok(Intrinsics {
            width: out.width.max(0) as u32,
            height: out.height.max(0) as u32,
            ppx: out.ppx,
            ppy: out.ppy,
            fx: out.fx,
            fy: out.fy,
            model: out.model,
            coeffs: out.coeffs,
        })
    }

    fn motion_intrinsics(&self, profile: RawHandle) -> NativeResult<MotionIntrinsics> {
        let mut out = sys::rs2_motion_device_intrinsic::default();
        call(|e| unsafe { sys::rs2_get_motion_intrinsics(profile.as_ptr(), &mut out, e) })?;
        Ok(MotionIntrinsics {
            data: out.data,
            noise_variances: out.noise_variances,
            bias_variances: out.bias_variances,
        })
    }

    fn extrinsics(&self, from: RawHandle, to: RawHandle) -> NativeResult<Extrinsics> {
        let mut out = sys::rs2_extrinsics::default();
        call(|e| unsafe { sys::rs2_get_extrinsics(from.as_ptr(), to.as_ptr(), &mut out, e) })?;
        Ok(Extrinsics {
            rotation: out.rotation,
            translation: out.translation,
        })
    }

    fn create_config(&self) -> NativeResult<RawHandle> {
        let config = call(|e| unsafe { sys::rs2_create_config(e) })?;
        non_null(config, "rs2_create_config")
    }

    fn config_enable_stream(&self, config: RawHandle, request: &StreamRequest) -> NativeResult<()> {
        call(|e| unsafe {
            sys::rs2_config_enable_stream(
                config.as_ptr(),
                request.kind.as_raw(),
                request.index,
                request.width as c_int,
                request.height as c_int,
                request.format.as_raw(),
                request.fps as c_int,
                e,
            )
        })
    }

    fn config_disable_stream(&self, config: RawHandle, kind: StreamKind, index: Option<i32>) -> NativeResult<()> {
        call(|e| unsafe {
            match index {
                Some(i) => sys::rs2_config_disable_indexed_stream(config.as_ptr(), kind.as_raw(), i, e),
                None => sys::rs2_config_disable_stream(config.as_ptr(), kind.as_raw(), e),
            }
        })
    }

    fn config_enable_all_streams(&self, config: RawHandle) -> NativeResult<()> {
        call(|e| unsafe { sys::rs2_config_enable_all_stream(config.as_ptr(), e) })
    }

    fn config_disable_all_streams(&self, config: RawHandle) -> NativeResult<()> {
        call(|e| unsafe { sys::rs2_config_disable_all_streams(config.as_ptr(), e) })
    }

    fn config_enable_device(&self, config: RawHandle, serial: &str) -> NativeResult<()> {
        let serial = CString::new(serial).map_err(|_| {
            NativeError::new("rs2_config_enable_device", "serial contains a NUL byte", NativeErrorKind::InvalidValue)
        })?;
        call(|e| unsafe { sys::rs2_config_enable_device(config.as_ptr(), serial.as_ptr(), e) })
    }

    fn create_pipeline(&self, ctx: RawHandle) -> NativeResult<RawHandle> {
        let pipe = call(|e| unsafe { sys::rs2_create_pipeline(ctx.as_ptr(), e) })?;
        non_null(pipe, "rs2_create_pipeline")
    }

    fn pipeline_start(&self, pipe: RawHandle, config: Option<RawHandle>) -> NativeResult<RawHandle> {
        let profile = call(|e| unsafe {
            match config {
                Some(c) => sys::rs2_pipeline_start_with_config(pipe.as_ptr(), c.as_ptr(), e),
                None => sys::rs2_pipeline_start(pipe.as_ptr(), e),
            }
        })?;
        non_null(profile, "rs2_pipeline_start")
    }

    fn pipeline_stop(&self, pipe: RawHandle) -> NativeResult<()> {
        call(|e| unsafe { sys::rs2_pipeline_stop(pipe.as_ptr(), e) })
    }

    fn pipeline_wait_for_frames(&self, pipe: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>> {
        let timeout_ms = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);
        let mut out: *mut sys::rs2_frame = ptr::null_mut();
        let got = call(|e| unsafe { sys::rs2_pipeline_try_wait_for_frames(pipe.as_ptr(), &mut out, timeout_ms, e) })?;
        Ok(if flag(got) { RawHandle::from_ptr(out as *const _) } else { None })
    }

    fn pipeline_poll_for_frames(&self, pipe: RawHandle) -> NativeResult<Option<RawHandle>> {
        let mut out: *mut sys::rs2_frame = ptr::null_mut();
        let got = call(|e| unsafe { sys::rs2_pipeline_poll_for_frames(pipe.as_ptr(), &mut out, e) })?;
        Ok(if flag(got) { RawHandle::from_ptr(out as *const _) } else { None })
    }

    fn pipeline_active_profile(&self, pipe: RawHandle) -> NativeResult<RawHandle> {
        let profile = call(|e| unsafe { sys::rs2_pipeline_get_active_profile(pipe.as_ptr(), e) })?;
        non_null(profile, "rs2_pipeline_get_active_profile")
    }

    fn pipeline_profile_device(&self, profile: RawHandle) -> NativeResult<RawHandle> {
        let device = call(|e| unsafe { sys::rs2_pipeline_profile_get_device(profile.as_ptr(), e) })?;
        non_null(device, "rs2_pipeline_profile_get_device")
    }

    fn pipeline_profile_streams(&self, profile: RawHandle) -> NativeResult<Vec<RawHandle>> {
        let list = call(|e| unsafe { sys::rs2_pipeline_profile_get_streams(profile.as_ptr(), e) })?;
        self.lend_profile_list(list, "rs2_pipeline_profile_get_streams")
    }

    fn embedded_frame_count(&self, composite: RawHandle) -> NativeResult<usize> {
        let n = call(|e| unsafe { sys::rs2_embedded_frames_count(composite.as_ptr(), e) })?;
        Ok(n.max(0) as usize)
    }

    fn extract_frame(&self, composite: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let frame = call(|e| unsafe { sys::rs2_extract_frame(composite.as_ptr(), index as c_int, e) })?;
        non_null(frame, "rs2_extract_frame")
    }

    fn clone_frame(&self, frame: RawHandle) -> NativeResult<RawHandle> {
        call(|e| unsafe { sys::rs2_frame_add_ref(frame.as_ptr(), e) })?;
        Ok(frame)
    }

    fn frame_stream_profile(&self, frame: RawHandle) -> NativeResult<RawHandle> {
        const F: &str = "rs2_get_frame_stream_profile";
        let profile = call(|e| unsafe { sys::rs2_get_frame_stream_profile(frame.as_ptr(), e) })?;
        call(|e| unsafe { sys::rs2_frame_add_ref(frame.as_ptr(), e) })?;
        self.lend_profile(profile, ProfileOwner::Frame(FrameRef(frame.as_ptr())), F)
    }

    fn frame_capabilities(&self, frame: RawHandle) -> NativeResult<FrameCapabilities> {
        let is = |ext| call(|e| unsafe { sys::rs2_is_frame_extendable_to(frame.as_ptr(), ext, e) }).map(flag);
        let mut caps = FrameCapabilities::empty();
        caps.set(FrameCapabilities::VIDEO, is(sys::RS2_EXTENSION_VIDEO_FRAME)?);
        caps.set(FrameCapabilities::DEPTH, is(sys::RS2_EXTENSION_DEPTH_FRAME)?);
        caps.set(FrameCapabilities::DISPARITY, is(sys::RS2_EXTENSION_DISPARITY_FRAME)?);
        caps.set(FrameCapabilities::MOTION, is(sys::RS2_EXTENSION_MOTION_FRAME)?);
        caps.set(FrameCapabilities::POSE, is(sys::RS2_EXTENSION_POSE_FRAME)?);
        caps.set(FrameCapabilities::COMPOSITE, is(sys::RS2_EXTENSION_COMPOSITE_FRAME)?);
        Ok(caps)
    }

    fn frame_info(&self, frame: RawHandle) -> NativeResult<FrameInfo> {
        let f = frame.as_ptr::<sys::rs2_frame>() as *const sys::rs2_frame;
        let domain = call(|e| unsafe { sys::rs2_get_frame_timestamp_domain(f, e) })?;
        Ok(FrameInfo {
            number: call(|e| unsafe { sys::rs2_get_frame_number(f, e) })?,
            timestamp: call(|e| unsafe { sys::rs2_get_frame_timestamp(f, e) })?,
            domain: TimestampDomain::from_raw(domain).unwrap_or(TimestampDomain::HardwareClock),
        })
    }

    fn video_frame_info(&self, frame: RawHandle) -> NativeResult<VideoFrameInfo> {
        let f = frame.as_ptr::<sys::rs2_frame>() as *const sys::rs2_frame;
        let read = |g: unsafe extern "C" fn(*const sys::rs2_frame, *mut *mut sys::rs2_error) -> c_int| {
            call(|e| unsafe { g(f, e) }).map(|v| v.max(0) as u32)
        };
        Ok(VideoFrameInfo {
            width: read(sys::rs2_get_frame_width)?,
            height: read(sys::rs2_get_frame_height)?,
            stride: read(sys::rs2_get_frame_stride_in_bytes)?,
            bits_per_pixel: read(sys::rs2_get_frame_bits_per_pixel)?,
        })
    }

    fn frame_data(&self, frame: RawHandle) -> NativeResult<RawBuffer> {
        let f = frame.as_ptr::<sys::rs2_frame>() as *const sys::rs2_frame;
        let data = call(|e| unsafe { sys::rs2_get_frame_data(f, e) })?;
        let size = call(|e| unsafe { sys::rs2_get_frame_data_size(f, e) })?;
        if data.is_null() || size <= 0 {
            return Ok(RawBuffer::empty());
        }
        // SAFETY: the frame buffer stays valid while this frame reference is held.
        Ok(unsafe { RawBuffer::new(data as *const u8, size as usize) })
    }

    fn depth_distance(&self, frame: RawHandle, x: u32, y: u32) -> NativeResult<f32> {
        call(|e| unsafe { sys::rs2_depth_frame_get_distance(frame.as_ptr(), x as c_int, y as c_int, e) })
    }

    fn motion_data(&self, frame: RawHandle) -> NativeResult<[f32; 3]> {
        let buf = self.frame_data(frame)?;
        if buf.len() < std::mem::size_of::<[f32; 3]>() {
            return Err(NativeError::new(
                "rs2_get_frame_data",
                "motion frame payload too short",
                NativeErrorKind::InvalidValue,
            ));
        }
        // SAFETY: length checked above; the payload may be unaligned.
        Ok(unsafe { ptr::read_unaligned(buf.as_ptr() as *const [f32; 3]) })
    }

    fn pose_data(&self, frame: RawHandle) -> NativeResult<PoseData> {
        let mut out = sys::rs2_pose::default();
        call(|e| unsafe { sys::rs2_pose_frame_get_pose_data(frame.as_ptr(), &mut out, e) })?;
        Ok(PoseData {
            translation: out.translation,
            velocity: out.velocity,
            acceleration: out.acceleration,
            rotation: out.rotation,
            angular_velocity: out.angular_velocity,
            angular_acceleration: out.angular_acceleration,
            tracker_confidence: out.tracker_confidence,
            mapper_confidence: out.mapper_confidence,
        })
    }

    fn supports_frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<bool> {
        call(|e| unsafe { sys::rs2_supports_frame_metadata(frame.as_ptr(), attr.as_raw(), e) }).map(flag)
    }

    fn frame_metadata(&self, frame: RawHandle, attr: FrameMetadata) -> NativeResult<i64> {
        call(|e| unsafe { sys::rs2_get_frame_metadata(frame.as_ptr(), attr.as_raw(), e) })
    }

    fn create_align(&self, align_to: StreamKind) -> NativeResult<RawHandle> {
        let block = call(|e| unsafe { sys::rs2_create_align(align_to.as_raw(), e) })?;
        self.start_block(block, "rs2_create_align")
    }

    fn create_colorizer(&self) -> NativeResult<RawHandle> {
        let block = call(|e| unsafe { sys::rs2_create_colorizer(e) })?;
        self.start_block(block, "rs2_create_colorizer")
    }

    fn create_syncer(&self) -> NativeResult<RawHandle> {
        let block = call(|e| unsafe { sys::rs2_create_sync_processing_block(e) })?;
        self.start_block(block, "rs2_create_sync_processing_block")
    }

    fn process_frame(&self, block: RawHandle, frame: RawHandle) -> NativeResult<()> {
        // rs2_process_frame consumes one reference.
        call(|e| unsafe { sys::rs2_frame_add_ref(frame.as_ptr(), e) })?;
        call(|e| unsafe { sys::rs2_process_frame(block.as_ptr(), frame.as_ptr(), e) })
    }

    fn block_wait_for_frame(&self, block: RawHandle, timeout: Duration) -> NativeResult<Option<RawHandle>> {
        let queue = self.queue_of(block, "rs2_try_wait_for_frame")?;
        let timeout_ms = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);
        let mut out: *mut sys::rs2_frame = ptr::null_mut();
        let got = call(|e| unsafe { sys::rs2_try_wait_for_frame(queue, timeout_ms, &mut out, e) })?;
        Ok(if flag(got) { RawHandle::from_ptr(out as *const _) } else { None })
    }

    fn block_poll_for_frame(&self, block: RawHandle) -> NativeResult<Option<RawHandle>> {
        let queue = self.queue_of(block, "rs2_poll_for_frame")?;
        let mut out: *mut sys::rs2_frame = ptr::null_mut();
        let got = call(|e| unsafe { sys::rs2_poll_for_frame(queue, &mut out, e) })?;
        Ok(if flag(got) { RawHandle::from_ptr(out as *const _) } else { None })
    }

    fn time(&self) -> NativeResult<f64> {
        call(|e| unsafe { sys::rs2_get_time(e) })
    }
}
