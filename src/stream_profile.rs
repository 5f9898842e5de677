use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::types::{Extrinsics, Format, Intrinsics, MotionIntrinsics, StreamKey, StreamKind, StreamProfileData};
use crate::Result;

/// A stream configuration a sensor can produce.
///
/// The descriptive fields are read once when the profile is wrapped. Video
/// and motion profiles are told apart by [`StreamProfile::is_video`] and
/// [`StreamProfile::is_motion`]; the capability-specific accessors return
/// `None` for the other kinds.
pub struct StreamProfile {
    handle: Arc<Handle>,
    data: StreamProfileData,
}

impl StreamProfile {
    /// Take ownership of `raw`. The handle is released if its fields can't be read.
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle) -> Result<Self> {
        let handle = Handle::adopt(shared, HandleKind::StreamProfile, raw);
        let data = handle.call(|sdk, p| sdk.stream_profile_data(p))?;
        Ok(Self { handle, data })
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    pub fn data(&self) -> &StreamProfileData {
        &self.data
    }

    pub fn kind(&self) -> StreamKind {
        self.data.kind
    }

    pub fn format(&self) -> Format {
        self.data.format
    }

    pub fn index(&self) -> i32 {
        self.data.index
    }

    pub fn unique_id(&self) -> i32 {
        self.data.unique_id
    }

    pub fn fps(&self) -> u32 {
        self.data.fps
    }

    pub fn is_default(&self) -> bool {
        self.data.is_default
    }

    pub fn key(&self) -> StreamKey {
        self.data.key()
    }

    pub fn is_video(&self) -> bool {
        self.data.video_size.is_some()
    }

    pub fn is_motion(&self) -> bool {
        self.data.is_motion
    }

    pub fn width(&self) -> Option<u32> {
        self.data.video_size.map(|(w, _)| w)
    }

    pub fn height(&self) -> Option<u32> {
        self.data.video_size.map(|(_, h)| h)
    }

    pub fn intrinsics(&self) -> Result<Option<Intrinsics>> {
        if !self.is_video() {
            return Ok(None);
        }
        self.handle.call(|sdk, p| sdk.video_intrinsics(p)).map(Some)
    }

    pub fn motion_intrinsics(&self) -> Result<Option<MotionIntrinsics>> {
        if !self.is_motion() {
            return Ok(None);
        }
        self.handle.call(|sdk, p| sdk.motion_intrinsics(p)).map(Some)
    }

    /// Transform from this stream's coordinate frame to `to`'s.
    pub fn extrinsics_to(&self, to: &StreamProfile) -> Result<Extrinsics> {
        let to = to.raw()?;
        self.handle.call(|sdk, p| sdk.extrinsics(p, to))
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProfile")
            .field("kind", &self.data.kind)
            .field("index", &self.data.index)
            .field("format", &self.data.format)
            .field("fps", &self.data.fps)
            .field("size", &self.data.video_size)
            .finish()
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key(), self.format())?;
        if let Some((w, h)) = self.data.video_size {
            write!(f, " {}x{}", w, h)?;
        }
        write!(f, " @{}fps", self.fps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::{Runtime, Settings};

    fn profiles(device: SimDevice) -> (Arc<SimSdk>, Runtime, Vec<StreamProfile>) {
        let sdk = Arc::new(SimSdk::with_devices(vec![device]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let mut all = Vec::new();
        for s in rt.context().unwrap().query_sensors().unwrap() {
            all.extend(s.stream_profiles().unwrap());
        }
        (sdk, rt, all)
    }

    #[test]
    fn test_video_profile() {
        let (_sdk, _rt, all) = profiles(SimDevice::d400("1"));
        let depth = all
            .iter()
            .find(|p| p.kind() == StreamKind::Depth && p.is_default())
            .unwrap();
        assert!(depth.is_video());
        assert!(!depth.is_motion());
        assert_eq!((depth.width(), depth.height()), (Some(640), Some(480)));
        assert_eq!(depth.format(), Format::Z16);
        let intr = depth.intrinsics().unwrap().unwrap();
        assert_eq!(intr.width, 640);
        assert_eq!(depth.motion_intrinsics().unwrap(), None);
        assert_eq!(depth.to_string(), "depth:0 z16 640x480 @30fps");
    }

    #[test]
    fn test_motion_profile_and_extrinsics() {
        let (_sdk, _rt, all) = profiles(SimDevice::tracking("T"));
        let gyro = all.iter().find(|p| p.kind() == StreamKind::Gyro).unwrap();
        let accel = all.iter().find(|p| p.kind() == StreamKind::Accel).unwrap();
        assert!(gyro.is_motion());
        assert_eq!(gyro.intrinsics().unwrap(), None);
        assert!(gyro.motion_intrinsics().unwrap().is_some());

        let ext = gyro.extrinsics_to(accel).unwrap();
        assert_eq!(ext.translation, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_failed_adopt_releases_handle() {
        let (sdk, rt, all) = profiles(SimDevice::d400("1"));
        drop(all);
        let sensor = rt.context().unwrap().query_sensors().unwrap().remove(0);
        sdk.fail_next("rs2_get_stream_profile_data", "device busy");
        assert!(sensor.stream_profiles().is_err());
        drop(sensor);
        assert_eq!(sdk.live_handles(), 0);
    }
}
