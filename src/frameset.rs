//! Synchronized frame bundles and the slot cache that serves them.
//!
//! A pipeline hands out one [`FrameSet`] for its whole session. Each cycle
//! the native bundle is swapped and every cached slot has its native frame
//! detached; slots keep their identity and stream key so the next lookup for
//! the same stream reuses the same [`Frame`] wrapper with a fresh backing.

use std::fmt;
use std::sync::Arc;

use crate::error::DepthlinkError;
use crate::frame::Frame;
use crate::handle::Handle;
use crate::native::{HandleKind, NativeResult, RawHandle, Sdk};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::types::{IndexMatch, StreamKey, StreamKind, StreamProfileData};
use crate::Result;

/// Stable identity of a cached frame slot within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

pub(crate) fn profile_of(sdk: &dyn Sdk, frame: RawHandle) -> NativeResult<StreamProfileData> {
    let profile = sdk.frame_stream_profile(frame)?;
    let data = sdk.stream_profile_data(profile);
    sdk.release(HandleKind::StreamProfile, profile);
    data
}

/// The native composite frame delivered for one cycle.
struct Bundle {
    shared: Arc<Shared>,
    composite: Option<Arc<Handle>>,
}

impl Bundle {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: shared.clone(),
            composite: None,
        }
    }

    fn is_loaded(&self) -> bool {
        self.composite.as_ref().is_some_and(|c| c.is_live())
    }

    fn replace(&mut self, raw: RawHandle) {
        if let Some(c) = self.composite.as_ref().filter(|c| c.is_live()) {
            c.replace(raw);
            return;
        }
        self.composite = Some(Handle::adopt(&self.shared, HandleKind::Frame, raw));
    }

    fn raw(&self) -> Result<RawHandle> {
        match &self.composite {
            Some(c) => c.raw(),
            None => Err(DepthlinkError::Destroyed(HandleKind::Frame.name())),
        }
    }

    fn clear(&mut self) {
        if let Some(c) = self.composite.take() {
            c.destroy();
        }
    }

    fn size(&self) -> Result<usize> {
        match &self.composite {
            Some(c) if c.is_live() => c.call(|sdk, raw| sdk.embedded_frame_count(raw)),
            _ => Ok(0),
        }
    }

    /// Extract the first embedded frame of `kind` whose index satisfies
    /// `policy`. `StreamKind::Any` takes the first frame. The returned native
    /// frame is owned by the caller.
    fn find(
        &self,
        kind: StreamKind,
        index: i32,
        policy: IndexMatch,
    ) -> Result<Option<(RawHandle, StreamProfileData)>> {
        let Some(composite) = self.composite.as_ref().filter(|c| c.is_live()) else {
            return Ok(None);
        };
        let count = composite.call(|sdk, raw| sdk.embedded_frame_count(raw))?;
        let sdk = &*self.shared.sdk;
        for i in 0..count {
            let frame = composite.call(|sdk, raw| sdk.extract_frame(raw, i))?;
            let data = match profile_of(sdk, frame) {
                Ok(d) => d,
                Err(e) => {
                    sdk.release(HandleKind::Frame, frame);
                    return Err(self.shared.report(e));
                }
            };
            if kind == StreamKind::Any || (data.kind == kind && policy.matches(index, data.index)) {
                return Ok(Some((frame, data)));
            }
            sdk.release(HandleKind::Frame, frame);
        }
        Ok(None)
    }

    /// Stream key of the `i`-th embedded frame.
    fn key_at(&self, i: usize) -> Result<Option<StreamKey>> {
        let Some(composite) = self.composite.as_ref().filter(|c| c.is_live()) else {
            return Ok(None);
        };
        if i >= composite.call(|sdk, raw| sdk.embedded_frame_count(raw))? {
            return Ok(None);
        }
        let frame = composite.call(|sdk, raw| sdk.extract_frame(raw, i))?;
        let sdk = &*self.shared.sdk;
        let data = profile_of(sdk, frame);
        sdk.release(HandleKind::Frame, frame);
        data.map(|d| Some(d.key())).map_err(|e| self.shared.report(e))
    }
}

/// Reusable frame slots plus the stream key each one last held. A `None`
/// key marks an invalidated slot: lookups never match it, and the next
/// allocation takes it over.
#[derive(Default)]
struct FrameCache {
    slots: Vec<Frame>,
    keys: Vec<Option<StreamKey>>,
}

impl FrameCache {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn position(&self, kind: StreamKind, index: i32, policy: IndexMatch) -> Option<usize> {
        if kind == StreamKind::Any {
            return self.keys.iter().position(Option::is_some);
        }
        self.keys.iter().position(|key| {
            key.is_some_and(|k| k.kind == kind && policy.matches(index, k.index))
        })
    }

    fn lookup(
        &mut self,
        shared: &Arc<Shared>,
        bundle: &Bundle,
        kind: StreamKind,
        index: i32,
        policy: IndexMatch,
    ) -> Result<Option<SlotId>> {
        if let Some(pos) = self.position(kind, index, policy) {
            let Some(stored) = self.keys[pos] else {
                return Ok(None);
            };
            // A slot only ever holds the stream it was created for.
            return match bundle.find(stored.kind, stored.index, IndexMatch::Exact)? {
                Some((raw, data)) => {
                    if let Err(e) = self.slots[pos].refresh(raw, data) {
                        self.keys[pos] = None;
                        log::trace!("frame slot {} invalidated: refresh failed", pos);
                        return Err(e);
                    }
                    log::trace!("frame slot {} reused for {}", pos, stored);
                    Ok(Some(SlotId(pos)))
                }
                None => {
                    self.slots[pos].detach();
                    self.keys[pos] = None;
                    log::trace!("frame slot {} invalidated: {} not in this bundle", pos, stored);
                    Ok(None)
                }
            };
        }

        if kind == StreamKind::Any {
            return Ok(None);
        }
        let Some((raw, data)) = bundle.find(kind, index, policy)? else {
            return Ok(None);
        };
        if let Some(pos) = self.keys.iter().position(Option::is_none) {
            self.slots[pos].refresh(raw, data)?;
            let key = self.slots[pos].stream_key();
            self.keys[pos] = Some(key);
            log::trace!("frame slot {} reclaimed for {}", pos, key);
            return Ok(Some(SlotId(pos)));
        }
        let frame = Frame::adopt(shared, raw, data)?;
        let key = frame.stream_key();
        self.slots.push(frame);
        self.keys.push(Some(key));
        log::trace!("frame slot {} allocated for {}", self.slots.len() - 1, key);
        Ok(Some(SlotId(self.slots.len() - 1)))
    }

    fn get(&self, id: SlotId) -> Option<&Frame> {
        self.keys.get(id.0).copied().flatten()?;
        self.slots.get(id.0).filter(|f| f.is_attached())
    }

    /// Release every slot's native frame, keeping slot identities and keys.
    fn detach_all(&mut self) {
        for slot in &self.slots {
            slot.detach();
        }
    }

    fn clear(&mut self) {
        for slot in self.slots.drain(..) {
            slot.destroy();
        }
        self.keys.clear();
    }
}

/// The frames of one acquisition cycle.
///
/// Obtained from `Pipeline::wait_for_frames` / `poll_for_frames`. Lookups
/// return references into the set, so no frame can be held across the next
/// acquisition.
pub struct FrameSet {
    shared: Arc<Shared>,
    bundle: Bundle,
    cache: FrameCache,
    policy: IndexMatch,
    generation: u64,
}

impl FrameSet {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: shared.clone(),
            bundle: Bundle::new(shared),
            cache: FrameCache::default(),
            policy: shared.settings.index_match,
            generation: 0,
        }
    }

    /// Start a new cycle around the composite frame `raw`.
    pub(crate) fn begin_cycle(&mut self, raw: RawHandle) {
        self.cache.detach_all();
        self.bundle.replace(raw);
        self.generation += 1;
    }

    /// Destroy every slot and release the bundle.
    pub(crate) fn clear(&mut self) {
        let slots = self.cache.len();
        self.cache.clear();
        self.bundle.clear();
        if slots > 0 {
            log::debug!("frame cache cleared ({} slots)", slots);
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.bundle.is_loaded()
    }

    /// Native composite frame of the current cycle.
    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.bundle.raw()
    }

    /// Number of frames in the current bundle.
    pub fn len(&self) -> Result<usize> {
        self.bundle.size()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Acquisition cycles seen this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of cached slots, including invalidated ones.
    pub fn slot_count(&self) -> usize {
        self.cache.len()
    }

    /// Resolve `(kind, index)` to a cached slot, refreshing or allocating it.
    ///
    /// `index` 0 accepts any stream index unless the runtime was configured
    /// with [`IndexMatch::Exact`]. `StreamKind::Any` returns the first occupied
    /// slot and never allocates.
    pub fn fetch(&mut self, kind: StreamKind, index: i32) -> Result<Option<SlotId>> {
        self.cache
            .lookup(&self.shared, &self.bundle, kind, index, self.policy)
    }

    /// Frame for a slot, or `None` if the slot was invalidated or holds no
    /// frame this cycle.
    pub fn frame(&self, id: SlotId) -> Option<&Frame> {
        self.cache.get(id)
    }

    pub fn get_frame(&mut self, kind: StreamKind, index: i32) -> Result<Option<&Frame>> {
        let id = self.fetch(kind, index)?;
        Ok(id.and_then(|id| self.cache.get(id)))
    }

    pub fn depth_frame(&mut self) -> Result<Option<&Frame>> {
        self.get_frame(StreamKind::Depth, 0)
    }

    pub fn color_frame(&mut self) -> Result<Option<&Frame>> {
        self.get_frame(StreamKind::Color, 0)
    }

    pub fn infrared_frame(&mut self, index: i32) -> Result<Option<&Frame>> {
        self.get_frame(StreamKind::Infrared, index)
    }

    /// Frame at bundle position `i` (not a stream index).
    pub fn at(&mut self, i: usize) -> Result<Option<&Frame>> {
        match self.bundle.key_at(i)? {
            Some(key) => self.get_frame(key.kind, key.index),
            None => Ok(None),
        }
    }

    /// Keys of the frames in the current bundle, in bundle order.
    pub fn stream_keys(&self) -> Result<Vec<StreamKey>> {
        let mut keys = Vec::new();
        for i in 0..self.len()? {
            if let Some(k) = self.bundle.key_at(i)? {
                keys.push(k);
            }
        }
        Ok(keys)
    }

    pub fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&Frame),
    {
        for i in 0..self.len()? {
            if let Some(frame) = self.at(i)? {
                f(frame);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSet")
            .field("generation", &self.generation)
            .field("slots", &self.cache.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Drop for FrameSet {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::{Runtime, Settings};

    struct Rig {
        sdk: Arc<SimSdk>,
        _rt: Runtime,
        set: FrameSet,
        pipe: RawHandle,
    }

    impl Rig {
        fn new(settings: Settings) -> Self {
            let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("F1")]));
            let rt = Runtime::with_settings(sdk.clone(), settings);
            let ctx = sdk.create_context().unwrap();
            let pipe = sdk.create_pipeline(ctx).unwrap();
            let profile = sdk.pipeline_start(pipe, None).unwrap();
            sdk.release(HandleKind::PipelineProfile, profile);
            sdk.release(HandleKind::Context, ctx);
            let set = FrameSet::new(rt.shared());
            Rig {
                sdk,
                _rt: rt,
                set,
                pipe,
            }
        }

        fn cycle(&mut self, kinds: &[StreamKind]) {
            if kinds.is_empty() {
                self.sdk.deliver_all();
            } else {
                self.sdk.deliver_only(kinds);
            }
            let raw = self.sdk.pipeline_poll_for_frames(self.pipe).unwrap().unwrap();
            self.set.begin_cycle(raw);
        }
    }

    #[test]
    fn test_wildcard_on_empty_cache_is_none() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        assert!(rig.set.fetch(StreamKind::Any, 0).unwrap().is_none());
        assert_eq!(rig.set.slot_count(), 0);

        let color = rig.set.fetch(StreamKind::Color, 0).unwrap().unwrap();
        assert_eq!(rig.set.fetch(StreamKind::Any, 0).unwrap(), Some(color));
    }

    #[test]
    fn test_same_key_reuses_slot_across_cycles() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let depth = rig.set.fetch(StreamKind::Depth, 0).unwrap().unwrap();
        let color = rig.set.fetch(StreamKind::Color, 0).unwrap().unwrap();
        assert_ne!(depth, color);
        let first_number = rig.set.frame(color).unwrap().frame_number().unwrap();
        let wrapper = rig.set.frame(color).unwrap() as *const Frame;

        rig.cycle(&[]);
        assert!(rig.set.frame(color).is_none(), "detached until looked up");
        assert_eq!(rig.set.fetch(StreamKind::Color, 0).unwrap(), Some(color));
        assert_eq!(rig.set.slot_count(), 2);
        let frame = rig.set.frame(color).unwrap();
        assert_eq!(frame as *const Frame, wrapper);
        assert!(frame.frame_number().unwrap() > first_number);
    }

    #[test]
    fn test_slot_records_actual_key() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let ir = rig.set.fetch(StreamKind::Infrared, 0).unwrap().unwrap();
        assert_eq!(
            rig.set.frame(ir).unwrap().stream_key(),
            StreamKey::new(StreamKind::Infrared, 1)
        );
        let ir2 = rig.set.fetch(StreamKind::Infrared, 2).unwrap().unwrap();
        assert_ne!(ir, ir2);
        // Index 0 is permissive and hits the first infrared slot.
        assert_eq!(rig.set.fetch(StreamKind::Infrared, 0).unwrap(), Some(ir));
    }

    #[test]
    fn test_exact_index_policy() {
        let mut rig = Rig::new(Settings::default().with_index_match(IndexMatch::Exact));
        rig.cycle(&[]);
        assert!(rig.set.fetch(StreamKind::Infrared, 0).unwrap().is_none());
        assert!(rig.set.fetch(StreamKind::Depth, 0).unwrap().is_some());
        assert!(rig.set.fetch(StreamKind::Infrared, 2).unwrap().is_some());
    }

    #[test]
    fn test_missing_stream_invalidates_slot() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let color = rig.set.fetch(StreamKind::Color, 0).unwrap().unwrap();

        rig.cycle(&[StreamKind::Depth]);
        assert!(rig.set.fetch(StreamKind::Color, 0).unwrap().is_none());
        assert!(rig.set.frame(color).is_none());

        // The stale key is never matched again; the next allocation takes
        // over the dead slot instead of growing the cache.
        let depth = rig.set.fetch(StreamKind::Depth, 0).unwrap().unwrap();
        assert_eq!(depth, color);
        assert_eq!(rig.set.frame(depth).unwrap().stream_key(), StreamKey::new(StreamKind::Depth, 0));
        assert_eq!(rig.set.slot_count(), 1);
    }

    #[test]
    fn test_flapping_stream_does_not_grow_cache() {
        let mut rig = Rig::new(Settings::default());
        for _ in 0..5 {
            rig.cycle(&[]);
            assert!(rig.set.fetch(StreamKind::Color, 0).unwrap().is_some());
            rig.cycle(&[StreamKind::Depth]);
            assert!(rig.set.fetch(StreamKind::Color, 0).unwrap().is_none());
        }
        assert_eq!(rig.set.slot_count(), 1);
        assert_eq!(rig.sdk.double_releases(), 0);
    }

    #[test]
    fn test_failed_refresh_detaches_slot() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let color = rig.set.fetch(StreamKind::Color, 0).unwrap().unwrap();

        rig.cycle(&[]);
        rig.sdk.fail_next("rs2_is_frame_extendable_to", "frame dropped");
        assert!(rig.set.fetch(StreamKind::Color, 0).is_err());
        assert!(rig.set.frame(color).is_none());

        // Only the pipeline and this cycle's bundle stay alive natively.
        assert_eq!(rig.sdk.live_handles(), 2);
        let again = rig.set.fetch(StreamKind::Color, 0).unwrap().unwrap();
        assert_eq!(again, color);
        assert!(rig.set.frame(again).unwrap().is_attached());
        assert_eq!(rig.set.slot_count(), 1);
        assert_eq!(rig.sdk.double_releases(), 0);
    }

    #[test]
    fn test_positional_access_and_keys() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let keys = rig.set.stream_keys().unwrap();
        assert_eq!(keys.len(), rig.set.len().unwrap());
        assert_eq!(keys[0], StreamKey::new(StreamKind::Depth, 0));

        let mut seen = Vec::new();
        rig.set.for_each(|f| seen.push(f.stream_key())).unwrap();
        assert_eq!(seen, keys);
        assert!(rig.set.at(99).unwrap().is_none());
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        rig.set.for_each(|_| {}).unwrap();
        assert_eq!(rig.set.slot_count(), 4);

        rig.set.clear();
        assert_eq!(rig.set.slot_count(), 0);
        assert!(!rig.set.is_loaded());
        assert_eq!(rig.set.len().unwrap(), 0);
        let live = rig.sdk.live_handles();
        // Only the pipeline itself remains.
        assert_eq!(live, 1);
        assert_eq!(rig.sdk.double_releases(), 0);
    }

    #[test]
    fn test_frame_data_outlives_cycle() {
        let mut rig = Rig::new(Settings::default());
        rig.cycle(&[]);
        let data = {
            let depth = rig.set.depth_frame().unwrap().unwrap();
            let video = depth.as_video().unwrap();
            assert_eq!(video.stride(), 640 * 2);
            let depth_view = depth.as_depth().unwrap();
            assert!((depth_view.distance(10, 10).unwrap() - 1.0).abs() < 1e-6);
            depth.data().unwrap()
        };
        rig.cycle(&[]);
        rig.set.clear();
        assert_eq!(data.len(), 640 * 480 * 2);
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 1000);
        drop(data);
        assert_eq!(rig.sdk.double_releases(), 0);
    }
}
