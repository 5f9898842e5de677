use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::context::Context;
use crate::device::Device;
use crate::frameset::FrameSet;
use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::stream_profile::StreamProfile;
use crate::types::StreamKind;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Started,
}

/// Result of [`Pipeline::start`].
#[derive(Debug)]
pub enum StartOutcome {
    Started(PipelineProfile),
    /// The pipeline was already running; nothing changed.
    AlreadyStarted,
}

impl StartOutcome {
    pub fn profile(self) -> Option<PipelineProfile> {
        match self {
            StartOutcome::Started(p) => Some(p),
            StartOutcome::AlreadyStarted => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Streaming session over one context.
///
/// `Idle --start--> Started --stop--> Idle`. Calls that make no sense in the
/// current state are no-ops reported through the return value, never errors.
pub struct Pipeline {
    // Frames go first so cached slots are released before the session.
    frames: FrameSet,
    handle: Arc<Handle>,
    context: Context,
    state: PipelineState,
}

impl Pipeline {
    pub(crate) fn create(context: Context) -> Result<Self> {
        let shared = context.shared().clone();
        let ctx = context.raw()?;
        let raw = shared
            .sdk
            .create_pipeline(ctx)
            .map_err(|e| shared.report(e))?;
        log::debug!("pipeline created");
        Ok(Self {
            frames: FrameSet::new(&shared),
            handle: Handle::adopt(&shared, HandleKind::Pipeline, raw),
            context,
            state: PipelineState::Idle,
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        self.handle.shared()
    }

    /// A pipeline whose native session was released (by `destroy` or a
    /// runtime cleanup) reads as idle.
    pub fn state(&self) -> PipelineState {
        if self.handle.is_live() {
            self.state
        } else {
            PipelineState::Idle
        }
    }

    pub fn is_started(&self) -> bool {
        self.state() == PipelineState::Started
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Start streaming with the SDK's default stream selection.
    pub fn start(&mut self) -> Result<StartOutcome> {
        self.start_inner(None)
    }

    pub fn start_with_config(&mut self, config: &Config) -> Result<StartOutcome> {
        self.start_inner(Some(config))
    }

    fn start_inner(&mut self, config: Option<&Config>) -> Result<StartOutcome> {
        self.handle.raw()?;
        if self.is_started() {
            log::debug!("pipeline already started; ignoring start");
            return Ok(StartOutcome::AlreadyStarted);
        }
        let config = config.map(Config::raw).transpose()?;
        self.frames.clear();
        let profile = self
            .handle
            .call(|sdk, pipe| sdk.pipeline_start(pipe, config))?;
        self.state = PipelineState::Started;
        log::info!("pipeline started (config={})", config.is_some());
        Ok(StartOutcome::Started(PipelineProfile::adopt(self.shared(), profile)))
    }

    /// Stop streaming and drop every cached frame. No-op when idle.
    ///
    /// The pipeline is idle afterwards even if the native stop fails.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_started() {
            self.handle.raw()?;
            log::debug!("pipeline not started; ignoring stop");
            return Ok(());
        }
        self.state = PipelineState::Idle;
        self.frames.clear();
        let stopped = self.handle.call(|sdk, pipe| sdk.pipeline_stop(pipe));
        log::info!("pipeline stopped");
        stopped
    }

    /// Block for the next frame bundle, up to the runtime's default timeout.
    pub fn wait_for_frames(&mut self) -> Result<Option<&mut FrameSet>> {
        let timeout = self.shared().settings.wait_timeout;
        self.wait_for_frames_timeout(timeout)
    }

    /// Block up to `timeout` for the next bundle. A timeout is `Ok(None)`.
    pub fn wait_for_frames_timeout(&mut self, timeout: Duration) -> Result<Option<&mut FrameSet>> {
        if !self.is_started() {
            self.handle.raw()?;
            log::debug!("wait_for_frames on idle pipeline");
            return Ok(None);
        }
        let bundle = self
            .handle
            .call(|sdk, pipe| sdk.pipeline_wait_for_frames(pipe, timeout))?;
        Ok(self.accept(bundle, "wait"))
    }

    /// Take a bundle if one is ready, without blocking.
    pub fn poll_for_frames(&mut self) -> Result<Option<&mut FrameSet>> {
        if !self.is_started() {
            self.handle.raw()?;
            log::debug!("poll_for_frames on idle pipeline");
            return Ok(None);
        }
        let bundle = self
            .handle
            .call(|sdk, pipe| sdk.pipeline_poll_for_frames(pipe))?;
        Ok(self.accept(bundle, "poll"))
    }

    fn accept(&mut self, bundle: Option<RawHandle>, how: &str) -> Option<&mut FrameSet> {
        match bundle {
            Some(raw) => {
                self.frames.begin_cycle(raw);
                log::trace!("{}: bundle #{}", how, self.frames.generation());
                Some(&mut self.frames)
            }
            None => {
                log::trace!("{}: no frames", how);
                None
            }
        }
    }

    /// The most recent bundle of the running session, if any.
    pub fn latest_frames(&mut self) -> Option<&mut FrameSet> {
        if self.is_started() && self.frames.is_loaded() {
            Some(&mut self.frames)
        } else {
            None
        }
    }

    /// Device and streams of the running session. `None` when idle.
    pub fn active_profile(&self) -> Result<Option<PipelineProfile>> {
        if !self.is_started() {
            self.handle.raw()?;
            log::debug!("active_profile on idle pipeline");
            return Ok(None);
        }
        let raw = self
            .handle
            .call(|sdk, pipe| sdk.pipeline_active_profile(pipe))?;
        Ok(Some(PipelineProfile::adopt(self.shared(), raw)))
    }

    /// Stop if running, then release the frame cache, the session and the
    /// context, in that order. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.is_started() {
            if let Err(e) = self.stop() {
                log::warn!("stop during destroy failed: {}", e);
            }
        }
        self.state = PipelineState::Idle;
        self.frames.clear();
        self.handle.destroy();
        self.context.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("frames", &self.frames)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Device and stream selection of a started pipeline.
pub struct PipelineProfile {
    handle: Arc<Handle>,
}

impl PipelineProfile {
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle) -> Self {
        Self {
            handle: Handle::adopt(shared, HandleKind::PipelineProfile, raw),
        }
    }

    pub fn device(&self) -> Result<Device> {
        let raw = self.handle.call(|sdk, p| sdk.pipeline_profile_device(p))?;
        Ok(Device::adopt(self.handle.shared(), raw))
    }

    pub fn streams(&self) -> Result<Vec<StreamProfile>> {
        let raws = self.handle.call(|sdk, p| sdk.pipeline_profile_streams(p))?;
        let shared = self.handle.shared();
        let mut out = Vec::with_capacity(raws.len());
        let mut failed = None;
        for raw in raws {
            if failed.is_some() {
                shared.sdk.release(HandleKind::StreamProfile, raw);
                continue;
            }
            match StreamProfile::adopt(shared, raw) {
                Ok(p) => out.push(p),
                Err(e) => failed = Some(e),
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// First active stream of `kind`; `index: None` accepts any index.
    pub fn stream(&self, kind: StreamKind, index: Option<i32>) -> Result<Option<StreamProfile>> {
        Ok(self
            .streams()?
            .into_iter()
            .find(|p| p.kind() == kind && index.map_or(true, |i| p.index() == i)))
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for PipelineProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineProfile")
            .field("destroyed", &!self.handle.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamRequest;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::types::{CameraInfo, Format};
    use crate::{Runtime, Settings};
    use std::time::Instant;

    fn setup() -> (Arc<SimSdk>, Runtime, Pipeline) {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("P1")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let pipe = rt.pipeline().unwrap();
        (sdk, rt, pipe)
    }

    fn stream_summary(p: &PipelineProfile) -> Vec<(StreamKind, i32, i32)> {
        p.streams()
            .unwrap()
            .iter()
            .map(|s| (s.kind(), s.index(), s.unique_id()))
            .collect()
    }

    #[test]
    fn test_double_start_is_a_no_op() {
        let (_sdk, _rt, mut pipe) = setup();
        let first = pipe.start().unwrap().profile().unwrap();
        let before = stream_summary(&pipe.active_profile().unwrap().unwrap());

        let second = pipe.start().unwrap();
        assert!(!second.is_started());
        assert!(matches!(second, StartOutcome::AlreadyStarted));
        assert_eq!(pipe.state(), PipelineState::Started);
        assert_eq!(stream_summary(&pipe.active_profile().unwrap().unwrap()), before);
        assert_eq!(stream_summary(&first), before);
    }

    #[test]
    fn test_wait_times_out_quietly() {
        let (_sdk, _rt, mut pipe) = setup();
        pipe.start().unwrap();
        let started = Instant::now();
        assert!(pipe
            .wait_for_frames_timeout(Duration::from_millis(1))
            .unwrap()
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(pipe.poll_for_frames().unwrap().is_none());
    }

    #[test]
    fn test_idle_calls_return_sentinels() {
        let (sdk, _rt, mut pipe) = setup();
        sdk.deliver_all();
        assert!(pipe.wait_for_frames().unwrap().is_none());
        assert!(pipe.poll_for_frames().unwrap().is_none());
        assert!(pipe.active_profile().unwrap().is_none());
        assert!(pipe.latest_frames().is_none());
        pipe.stop().unwrap();
        assert_eq!(pipe.state(), PipelineState::Idle);
    }

    #[test]
    fn test_frames_flow_and_slots_are_reused() {
        let (sdk, _rt, mut pipe) = setup();
        pipe.start().unwrap();
        for _ in 0..3 {
            sdk.deliver_all();
            let set = pipe.wait_for_frames().unwrap().unwrap();
            assert_eq!(set.len().unwrap(), 4);
            assert!(set.depth_frame().unwrap().is_some());
            assert!(set.color_frame().unwrap().is_some());
            assert_eq!(set.slot_count(), 2);
        }
        assert_eq!(pipe.latest_frames().unwrap().generation(), 3);
    }

    #[test]
    fn test_unread_bundles_are_dropped() {
        let (sdk, _rt, mut pipe) = setup();
        pipe.start().unwrap();
        sdk.deliver_all();
        sdk.deliver_all();
        sdk.deliver_all();
        let set = pipe.poll_for_frames().unwrap().unwrap();
        let number = set.depth_frame().unwrap().unwrap().frame_number().unwrap();
        assert_eq!(number, 3);
        assert!(pipe.poll_for_frames().unwrap().is_none());
    }

    #[test]
    fn test_restart_starts_with_empty_cache() {
        let (sdk, _rt, mut pipe) = setup();
        pipe.start().unwrap();
        sdk.deliver_all();
        pipe.wait_for_frames()
            .unwrap()
            .unwrap()
            .for_each(|_| {})
            .unwrap();
        let streaming = sdk.live_handles();

        pipe.stop().unwrap();
        assert!(pipe.latest_frames().is_none());
        pipe.start().unwrap();
        let set_slots = {
            sdk.deliver_all();
            pipe.wait_for_frames().unwrap().unwrap().slot_count()
        };
        assert_eq!(set_slots, 0);
        assert!(sdk.live_handles() < streaming);
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_start_with_config() {
        let (sdk, rt, mut pipe) = setup();
        let config = rt.config().unwrap();
        config
            .enable_stream(
                StreamRequest::new(StreamKind::Color)
                    .resolution(1920, 1080)
                    .format(Format::Rgb8),
            )
            .unwrap();
        config.enable_device("P1").unwrap();
        let profile = pipe.start_with_config(&config).unwrap().profile().unwrap();
        let color = profile.stream(StreamKind::Color, None).unwrap().unwrap();
        assert_eq!(color.width(), Some(1920));
        assert!(profile.stream(StreamKind::Depth, None).unwrap().is_none());
        assert_eq!(
            profile
                .device()
                .unwrap()
                .camera_info(CameraInfo::SerialNumber)
                .unwrap()
                .as_deref(),
            Some("P1")
        );

        sdk.deliver_all();
        let set = pipe.wait_for_frames().unwrap().unwrap();
        assert_eq!(set.len().unwrap(), 1);
        let frame = set.color_frame().unwrap().unwrap();
        assert_eq!(frame.as_video().unwrap().width(), 1920);
    }

    #[test]
    fn test_start_failure_keeps_idle() {
        let (sdk, rt, mut pipe) = setup();
        let config = rt.config().unwrap();
        config.enable_device("no-such-serial").unwrap();
        assert!(pipe.start_with_config(&config).is_err());
        assert_eq!(pipe.state(), PipelineState::Idle);

        sdk.fail_next("rs2_pipeline_stop", "usb reset");
        pipe.start().unwrap();
        assert!(pipe.stop().is_err());
        assert_eq!(pipe.state(), PipelineState::Idle);
    }

    #[test]
    fn test_destroy_order_and_idempotence() {
        let (sdk, rt, mut pipe) = setup();
        pipe.start().unwrap();
        sdk.deliver_all();
        pipe.wait_for_frames().unwrap().unwrap().depth_frame().unwrap();
        pipe.destroy();
        pipe.destroy();
        assert!(pipe.is_destroyed());
        assert!(pipe.context().is_destroyed());
        assert_eq!(sdk.live_handles(), 0);
        assert!(rt.registry().is_empty());
        assert!(pipe.start().unwrap_err().is_destroyed());
        drop(pipe);
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_motion_and_pose_frames() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::tracking("T265")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let mut pipe = rt.pipeline().unwrap();
        pipe.start().unwrap();
        sdk.deliver_all();
        let set = pipe.wait_for_frames().unwrap().unwrap();

        let accel = set.get_frame(StreamKind::Accel, 0).unwrap().unwrap();
        let sample = accel.motion_data().unwrap().unwrap();
        assert!(sample[1] < -9.0);
        assert!(accel.as_video().is_none());
        assert!(accel.pose_data().unwrap().is_none());

        let pose = set.get_frame(StreamKind::Pose, 0).unwrap().unwrap();
        let data = pose.pose_data().unwrap().unwrap();
        assert_eq!(data.rotation[3], 1.0);
    }

    #[test]
    fn test_cleanup_while_started_leaves_a_destroyed_pipeline() {
        let (sdk, rt, mut pipe) = setup();
        pipe.start().unwrap();
        rt.cleanup();

        assert!(pipe.is_destroyed());
        assert!(!pipe.is_started());
        assert_eq!(pipe.state(), PipelineState::Idle);
        assert!(pipe.start().unwrap_err().is_destroyed());
        assert!(pipe.stop().unwrap_err().is_destroyed());
        assert!(pipe.poll_for_frames().unwrap_err().is_destroyed());
        assert!(pipe.active_profile().unwrap_err().is_destroyed());
        drop(pipe);
        assert_eq!(sdk.live_handles(), 0);
        assert_eq!(sdk.double_releases(), 0);
    }
}
