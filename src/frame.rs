use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::handle::Handle;
use crate::native::{HandleKind, RawBuffer, RawHandle, Sdk};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::stream_profile::StreamProfile;
use crate::types::{
    FrameCapabilities, FrameInfo, FrameMetadata, PoseData, StreamKey, StreamProfileData,
    TimestampDomain, VideoFrameInfo,
};
use crate::Result;

/// What a frame can be viewed as, fixed when its backing is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Basic,
    Video,
    Depth,
    Disparity,
    Motion,
    Pose,
}

impl FrameKind {
    /// Most specific kind first: pose, motion, disparity, depth, video.
    pub fn from_capabilities(caps: FrameCapabilities) -> Self {
        if caps.contains(FrameCapabilities::POSE) {
            FrameKind::Pose
        } else if caps.contains(FrameCapabilities::MOTION) {
            FrameKind::Motion
        } else if caps.contains(FrameCapabilities::DISPARITY) {
            FrameKind::Disparity
        } else if caps.contains(FrameCapabilities::DEPTH) {
            FrameKind::Depth
        } else if caps.contains(FrameCapabilities::VIDEO) {
            FrameKind::Video
        } else {
            FrameKind::Basic
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, FrameKind::Video | FrameKind::Depth | FrameKind::Disparity)
    }

    pub fn is_depth(self) -> bool {
        matches!(self, FrameKind::Depth | FrameKind::Disparity)
    }
}

/// A single frame held in a frame set slot.
///
/// The wrapper is stable across acquisition cycles; its native backing is
/// swapped every cycle. Between cycles the backing is detached and every
/// accessor that reaches the SDK fails with a destroyed error.
pub struct Frame {
    handle: Arc<Handle>,
    profile: StreamProfileData,
    caps: FrameCapabilities,
    kind: FrameKind,
    video: Option<VideoFrameInfo>,
}

impl Frame {
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle, profile: StreamProfileData) -> Result<Self> {
        let handle = Handle::adopt(shared, HandleKind::Frame, raw);
        let (caps, video) = Self::inspect(&handle)?;
        Ok(Self {
            handle,
            profile,
            caps,
            kind: FrameKind::from_capabilities(caps),
            video,
        })
    }

    /// Swap in this cycle's native frame and re-read what it supports.
    /// On failure the slot is left detached.
    pub(crate) fn refresh(&mut self, raw: RawHandle, profile: StreamProfileData) -> Result<()> {
        self.handle.replace(raw);
        match Self::inspect(&self.handle) {
            Ok((caps, video)) => {
                self.profile = profile;
                self.caps = caps;
                self.kind = FrameKind::from_capabilities(caps);
                self.video = video;
                Ok(())
            }
            Err(e) => {
                self.handle.release_backing();
                Err(e)
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    pub(crate) fn detach(&self) -> bool {
        self.handle.release_backing()
    }

    fn inspect(handle: &Handle) -> Result<(FrameCapabilities, Option<VideoFrameInfo>)> {
        let caps = handle.call(|sdk, f| sdk.frame_capabilities(f))?;
        if !caps.contains(FrameCapabilities::VIDEO) {
            return Ok((caps, None));
        }
        let video = handle.call(|sdk, f| sdk.video_frame_info(f))?;
        Ok((caps, Some(video)))
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_live()
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn capabilities(&self) -> FrameCapabilities {
        self.caps
    }

    pub fn stream_key(&self) -> StreamKey {
        self.profile.key()
    }

    pub fn profile_data(&self) -> &StreamProfileData {
        &self.profile
    }

    /// Full stream profile, including intrinsics access.
    pub fn profile(&self) -> Result<StreamProfile> {
        let raw = self.handle.call(|sdk, f| sdk.frame_stream_profile(f))?;
        StreamProfile::adopt(self.handle.shared(), raw)
    }

    pub fn info(&self) -> Result<FrameInfo> {
        self.handle.call(|sdk, f| sdk.frame_info(f))
    }

    pub fn frame_number(&self) -> Result<u64> {
        Ok(self.info()?.number)
    }

    /// Milliseconds in [`Frame::timestamp_domain`].
    pub fn timestamp(&self) -> Result<f64> {
        Ok(self.info()?.timestamp)
    }

    pub fn timestamp_domain(&self) -> Result<TimestampDomain> {
        Ok(self.info()?.domain)
    }

    /// Payload bytes. The returned buffer holds its own reference to the
    /// native frame, so it stays valid after the slot moves to the next cycle.
    pub fn data(&self) -> Result<FrameData> {
        let pinned = self.handle.call(|sdk, f| sdk.clone_frame(f))?;
        let shared = self.handle.shared();
        match shared.sdk.frame_data(pinned) {
            Ok(buf) => Ok(FrameData {
                sdk: shared.sdk.clone(),
                raw: pinned,
                buf,
            }),
            Err(e) => {
                shared.sdk.release(HandleKind::Frame, pinned);
                Err(shared.report(e))
            }
        }
    }

    pub fn supports_metadata(&self, attr: FrameMetadata) -> Result<bool> {
        self.handle.call(|sdk, f| sdk.supports_frame_metadata(f, attr))
    }

    pub fn metadata(&self, attr: FrameMetadata) -> Result<Option<i64>> {
        if !self.supports_metadata(attr)? {
            return Ok(None);
        }
        self.handle.call(|sdk, f| sdk.frame_metadata(f, attr)).map(Some)
    }

    pub fn as_video(&self) -> Option<VideoFrame<'_>> {
        self.video.map(|info| VideoFrame { frame: self, info })
    }

    pub fn as_depth(&self) -> Option<DepthFrame<'_>> {
        if !self.kind.is_depth() {
            return None;
        }
        self.as_video().map(|video| DepthFrame { video })
    }

    /// Gyro or accelerometer sample, `None` for non-motion frames.
    pub fn motion_data(&self) -> Result<Option<[f32; 3]>> {
        if self.kind != FrameKind::Motion {
            return Ok(None);
        }
        self.handle.call(|sdk, f| sdk.motion_data(f)).map(Some)
    }

    pub fn pose_data(&self) -> Result<Option<PoseData>> {
        if self.kind != FrameKind::Pose {
            return Ok(None);
        }
        self.handle.call(|sdk, f| sdk.pose_data(f)).map(Some)
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream", &self.stream_key())
            .field("kind", &self.kind)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Frame payload kept alive by a private native frame reference.
pub struct FrameData {
    sdk: Arc<dyn Sdk>,
    raw: RawHandle,
    buf: RawBuffer,
}

impl Deref for FrameData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if self.buf.is_empty() {
            return &[];
        }
        // SAFETY: `buf` was read from `raw`, which is held until drop.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.buf.len()) }
    }
}

impl Drop for FrameData {
    fn drop(&mut self) {
        self.sdk.release(HandleKind::Frame, self.raw);
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameData").field("len", &self.buf.len()).finish()
    }
}

/// Image view of a frame.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    frame: &'a Frame,
    info: VideoFrameInfo,
}

impl<'a> VideoFrame<'a> {
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Bytes per row.
    pub fn stride(&self) -> u32 {
        self.info.stride
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.info.bits_per_pixel
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.info.bits_per_pixel / 8
    }

    pub fn data(&self) -> Result<FrameData> {
        self.frame.data()
    }
}

/// Depth view of a frame.
#[derive(Debug, Clone, Copy)]
pub struct DepthFrame<'a> {
    video: VideoFrame<'a>,
}

impl<'a> DepthFrame<'a> {
    pub fn video(&self) -> VideoFrame<'a> {
        self.video
    }

    /// Distance in meters at pixel `(x, y)`.
    pub fn distance(&self, x: u32, y: u32) -> Result<f32> {
        self.video
            .frame
            .handle
            .call(|sdk, f| sdk.depth_distance(f, x, y))
    }

    pub fn width(&self) -> u32 {
        self.video.width()
    }

    pub fn height(&self) -> u32 {
        self.video.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_priority() {
        use FrameCapabilities as C;
        assert_eq!(FrameKind::from_capabilities(C::empty()), FrameKind::Basic);
        assert_eq!(FrameKind::from_capabilities(C::VIDEO), FrameKind::Video);
        assert_eq!(FrameKind::from_capabilities(C::VIDEO | C::DEPTH), FrameKind::Depth);
        assert_eq!(
            FrameKind::from_capabilities(C::VIDEO | C::DEPTH | C::DISPARITY),
            FrameKind::Disparity
        );
        assert_eq!(FrameKind::from_capabilities(C::MOTION | C::VIDEO), FrameKind::Motion);
        assert_eq!(FrameKind::from_capabilities(C::POSE | C::MOTION), FrameKind::Pose);
        assert!(FrameKind::Disparity.is_depth());
        assert!(!FrameKind::Motion.is_video());
    }
}
