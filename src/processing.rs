//! Processing blocks: depth alignment, depth colorization and stream
//! synchronization.
//!
//! Each block owns its native handle plus the managed output it hands back,
//! so outputs follow the same rules as pipeline frames: references into the
//! block, valid until the next call that produces output.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;
use crate::frameset::{profile_of, FrameSet};
use crate::handle::Handle;
use crate::native::{HandleKind, NativeResult, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::types::{OptionRange, SensorOption, StreamKind};
use crate::Result;

fn create_block(
    shared: &Arc<Shared>,
    what: &str,
    create: impl FnOnce(&Shared) -> NativeResult<RawHandle>,
) -> Result<Arc<Handle>> {
    let raw = create(shared.as_ref()).map_err(|e| shared.report(e))?;
    log::debug!("{} created", what);
    Ok(Handle::adopt(shared, HandleKind::ProcessingBlock, raw))
}

/// Map depth onto the viewport of another stream.
pub struct Align {
    output: FrameSet,
    handle: Arc<Handle>,
    target: StreamKind,
}

impl Align {
    pub(crate) fn create(shared: &Arc<Shared>, target: StreamKind) -> Result<Self> {
        let handle = create_block(shared, "align", |s| s.sdk.create_align(target))?;
        Ok(Self {
            output: FrameSet::new(shared),
            handle,
            target,
        })
    }

    /// Stream whose viewport the other streams are mapped onto.
    pub fn target(&self) -> StreamKind {
        self.target
    }

    /// Align the current bundle of `frames`. `Ok(None)` if the block produced
    /// nothing within the runtime's wait timeout.
    pub fn process(&mut self, frames: &FrameSet) -> Result<Option<&mut FrameSet>> {
        let input = frames.raw()?;
        self.handle.call(|sdk, b| sdk.process_frame(b, input))?;
        let timeout = self.handle.shared().settings.wait_timeout;
        match self.handle.call(|sdk, b| sdk.block_wait_for_frame(b, timeout))? {
            Some(raw) => {
                self.output.begin_cycle(raw);
                log::trace!("align to {}: bundle #{}", self.target, self.output.generation());
                Ok(Some(&mut self.output))
            }
            None => Ok(None),
        }
    }

    pub fn destroy(&mut self) {
        self.output.clear();
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl Drop for Align {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Align {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Align")
            .field("target", &self.target)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Render depth frames as RGB images.
///
/// Scheme and distance range are ordinary options, set with
/// [`Colorizer::set_option`].
pub struct Colorizer {
    output: Option<Frame>,
    handle: Arc<Handle>,
}

impl Colorizer {
    pub(crate) fn create(shared: &Arc<Shared>) -> Result<Self> {
        let handle = create_block(shared, "colorizer", |s| s.sdk.create_colorizer())?;
        Ok(Self {
            output: None,
            handle,
        })
    }

    /// Colorize `frame`, which must be a depth frame. The result replaces the
    /// previous one.
    pub fn colorize(&mut self, frame: &Frame) -> Result<Option<&Frame>> {
        let input = frame.raw()?;
        self.handle.call(|sdk, b| sdk.process_frame(b, input))?;
        let shared = self.handle.shared().clone();
        let timeout = shared.settings.wait_timeout;
        let Some(raw) = self.handle.call(|sdk, b| sdk.block_wait_for_frame(b, timeout))? else {
            return Ok(None);
        };
        let data = match profile_of(&*shared.sdk, raw) {
            Ok(d) => d,
            Err(e) => {
                shared.sdk.release(HandleKind::Frame, raw);
                return Err(shared.report(e));
            }
        };
        if let Some(out) = self.output.as_mut() {
            out.refresh(raw, data)?;
        } else {
            self.output = Some(Frame::adopt(&shared, raw, data)?);
        }
        Ok(self.output.as_ref())
    }

    pub fn supports_option(&self, option: SensorOption) -> Result<bool> {
        self.handle.call(|sdk, b| sdk.supports_option(b, option))
    }

    pub fn option(&self, option: SensorOption) -> Result<Option<f32>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle.call(|sdk, b| sdk.option_value(b, option)).map(Some)
    }

    pub fn set_option(&self, option: SensorOption, value: f32) -> Result<()> {
        log::debug!("colorizer option {} = {}", option, value);
        self.handle.call(|sdk, b| sdk.set_option_value(b, option, value))
    }

    pub fn option_range(&self, option: SensorOption) -> Result<Option<OptionRange>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle.call(|sdk, b| sdk.option_range(b, option)).map(Some)
    }

    pub fn option_description(&self, option: SensorOption) -> Result<Option<String>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle
            .call(|sdk, b| sdk.option_description(b, option))
            .map(Some)
    }

    /// Name of a color scheme value, e.g. "Jet" for 0.
    pub fn option_value_description(&self, option: SensorOption, value: f32) -> Result<Option<String>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle
            .call(|sdk, b| sdk.option_value_description(b, option, value))
    }

    pub fn destroy(&mut self) {
        if let Some(out) = self.output.take() {
            out.destroy();
        }
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl Drop for Colorizer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Colorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Colorizer")
            .field("output", &self.output)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Combine frames from independently running sensors into bundles holding
/// the newest frame of every stream seen so far.
pub struct Syncer {
    output: FrameSet,
    handle: Arc<Handle>,
}

impl Syncer {
    pub(crate) fn create(shared: &Arc<Shared>) -> Result<Self> {
        let handle = create_block(shared, "syncer", |s| s.sdk.create_syncer())?;
        Ok(Self {
            output: FrameSet::new(shared),
            handle,
        })
    }

    pub fn process(&self, frame: &Frame) -> Result<()> {
        let input = frame.raw()?;
        self.handle.call(|sdk, b| sdk.process_frame(b, input))
    }

    /// Feed every frame of the current bundle of `frames`.
    pub fn process_frames(&self, frames: &FrameSet) -> Result<()> {
        let input = frames.raw()?;
        self.handle.call(|sdk, b| sdk.process_frame(b, input))
    }

    pub fn wait_for_frames(&mut self) -> Result<Option<&mut FrameSet>> {
        let timeout = self.handle.shared().settings.wait_timeout;
        self.wait_for_frames_timeout(timeout)
    }

    /// Block up to `timeout` for the next synchronized bundle.
    pub fn wait_for_frames_timeout(&mut self, timeout: Duration) -> Result<Option<&mut FrameSet>> {
        let bundle = self
            .handle
            .call(|sdk, b| sdk.block_wait_for_frame(b, timeout))?;
        Ok(self.accept(bundle))
    }

    pub fn poll_for_frames(&mut self) -> Result<Option<&mut FrameSet>> {
        let bundle = self.handle.call(|sdk, b| sdk.block_poll_for_frame(b))?;
        Ok(self.accept(bundle))
    }

    fn accept(&mut self, bundle: Option<RawHandle>) -> Option<&mut FrameSet> {
        let raw = bundle?;
        self.output.begin_cycle(raw);
        log::trace!("syncer: bundle #{}", self.output.generation());
        Some(&mut self.output)
    }

    pub fn destroy(&mut self) {
        self.output.clear();
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Syncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syncer")
            .field("frames", &self.output)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::types::Format;
    use crate::{FrameKind, Pipeline, Runtime, Settings, StreamRequest};

    fn streaming() -> (Arc<SimSdk>, Runtime, Pipeline) {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("P1")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let mut pipe = rt.pipeline().unwrap();
        pipe.start().unwrap();
        (sdk, rt, pipe)
    }

    #[test]
    fn test_colorize_depth_into_rgb() {
        let (sdk, rt, mut pipe) = streaming();
        let mut colorizer = rt.colorizer().unwrap();
        assert_eq!(colorizer.option(SensorOption::ColorScheme).unwrap(), Some(0.0));
        assert_eq!(
            colorizer
                .option_value_description(SensorOption::ColorScheme, 0.0)
                .unwrap()
                .as_deref(),
            Some("Jet")
        );
        colorizer.set_option(SensorOption::MaxDistance, 2.0).unwrap();
        assert_eq!(colorizer.option(SensorOption::Exposure).unwrap(), None);

        sdk.deliver_all();
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        let depth = frames.depth_frame().unwrap().unwrap();
        let colored = colorizer.colorize(depth).unwrap().unwrap();
        assert_eq!(colored.kind(), FrameKind::Video);
        assert_eq!(colored.profile_data().format, Format::Rgb8);
        let video = colored.as_video().unwrap();
        assert_eq!((video.width(), video.height(), video.stride()), (640, 480, 1920));
        // One meter in a 0..2 m range sits halfway between blue and red.
        let data = colored.data().unwrap();
        assert_eq!(&data[..3], &[127, 0, 127]);
    }

    #[test]
    fn test_colorize_slot_is_reused() {
        let (sdk, rt, mut pipe) = streaming();
        let mut colorizer = rt.colorizer().unwrap();
        let mut numbers = Vec::new();
        for _ in 0..2 {
            sdk.deliver_all();
            let frames = pipe.wait_for_frames().unwrap().unwrap();
            let depth = frames.depth_frame().unwrap().unwrap();
            let colored = colorizer.colorize(depth).unwrap().unwrap();
            numbers.push(colored.frame_number().unwrap());
        }
        assert_eq!(numbers, [1, 2]);
        assert_eq!(sdk.live_handles_of(HandleKind::ProcessingBlock), 1);
    }

    #[test]
    fn test_colorize_color_frame_is_an_error() {
        let (sdk, rt, mut pipe) = streaming();
        let mut colorizer = rt.colorizer().unwrap();
        sdk.deliver_all();
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        let color = frames.color_frame().unwrap().unwrap();
        let err = colorizer.colorize(color).unwrap_err();
        assert_eq!(err.native().unwrap().function, "rs2_process_frame");
    }

    #[test]
    fn test_align_depth_to_color_resolution() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("P1")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let config = rt.config().unwrap();
        config
            .enable_stream(StreamRequest::new(StreamKind::Depth).resolution(1280, 720))
            .unwrap();
        config
            .enable_stream(StreamRequest::new(StreamKind::Color))
            .unwrap();
        let mut pipe = rt.pipeline().unwrap();
        pipe.start_with_config(&config).unwrap();
        let mut align = rt.align(StreamKind::Color).unwrap();
        assert_eq!(align.target(), StreamKind::Color);

        sdk.deliver_all();
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        {
            let depth = frames.depth_frame().unwrap().unwrap();
            assert_eq!(depth.as_video().unwrap().width(), 1280);
        }
        let aligned = align.process(frames).unwrap().unwrap();
        let depth = aligned.depth_frame().unwrap().unwrap();
        let d = depth.as_depth().unwrap();
        assert_eq!((d.width(), d.height()), (640, 480));
        assert!((d.distance(320, 240).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_syncer_merges_separate_deliveries() {
        let (sdk, rt, mut pipe) = streaming();
        let mut syncer = rt.syncer().unwrap();
        assert!(syncer.poll_for_frames().unwrap().is_none());

        sdk.deliver_only(&[StreamKind::Depth]);
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        let depth = frames.depth_frame().unwrap().unwrap();
        syncer.process(depth).unwrap();
        sdk.deliver_only(&[StreamKind::Color]);
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        syncer.process_frames(frames).unwrap();

        let synced = syncer
            .wait_for_frames_timeout(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(synced.len().unwrap(), 2);
        assert!(synced.depth_frame().unwrap().is_some());
        assert_eq!(synced.color_frame().unwrap().unwrap().frame_number().unwrap(), 2);
    }

    #[test]
    fn test_cleanup_releases_blocks_and_outputs() {
        let (sdk, rt, mut pipe) = streaming();
        let mut colorizer = rt.colorizer().unwrap();
        let mut syncer = rt.syncer().unwrap();
        sdk.deliver_all();
        let frames = pipe.wait_for_frames().unwrap().unwrap();
        syncer.process_frames(frames).unwrap();
        assert!(syncer.poll_for_frames().unwrap().is_some());
        let depth = frames.depth_frame().unwrap().unwrap();
        assert!(colorizer.colorize(depth).unwrap().is_some());

        rt.cleanup();
        assert_eq!(sdk.live_handles(), 0);
        assert_eq!(sdk.double_releases(), 0);
        assert!(colorizer.is_destroyed());
        assert!(syncer.poll_for_frames().unwrap_err().is_destroyed());

        drop(colorizer);
        drop(syncer);
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_failed_create_is_reported() {
        let sdk = Arc::new(SimSdk::new());
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        sdk.fail_next("rs2_create_align", "no align");
        let err = rt.align(StreamKind::Depth).unwrap_err();
        assert_eq!(err.native().unwrap().function, "rs2_create_align");
        assert!(rt.registry().is_empty());
    }

    #[test]
    fn test_clock_is_wall_time() {
        let sdk = Arc::new(SimSdk::new());
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let a = rt.time().unwrap();
        let b = rt.time().unwrap();
        assert!(a > 1.6e12);
        assert!(b >= a);
        sdk.fail_next("rs2_get_time", "clock");
        assert!(rt.time().is_err());
    }
}
