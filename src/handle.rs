use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::DepthlinkError;
use crate::native::{HandleKind, NativeResult, RawHandle, Sdk};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::Result;

/// Sole owner of one native handle.
///
/// A zero value means the handle was destroyed (or, for frame slots, that its
/// backing was detached). Every access goes through [`Handle::raw`], so a
/// wrapper used after `destroy` fails with [`DepthlinkError::Destroyed`]
/// instead of reaching into freed SDK memory.
pub(crate) struct Handle {
    shared: Arc<Shared>,
    kind: HandleKind,
    raw: AtomicUsize,
}

impl Handle {
    /// Take ownership of `raw` and start tracking it in the runtime registry.
    pub(crate) fn adopt(shared: &Arc<Shared>, kind: HandleKind, raw: RawHandle) -> Arc<Handle> {
        let handle = Arc::new(Handle {
            shared: shared.clone(),
            kind,
            raw: AtomicUsize::new(raw.get()),
        });
        shared.registry.track(&handle);
        handle
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        RawHandle::new(self.raw.load(Ordering::Acquire))
            .ok_or(DepthlinkError::Destroyed(self.kind.name()))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.raw.load(Ordering::Acquire) != 0
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn sdk(&self) -> &dyn Sdk {
        &*self.shared.sdk
    }

    /// Run a native call against the live handle. Failures are reported
    /// through the runtime error bridge before being returned.
    pub(crate) fn call<T>(&self, f: impl FnOnce(&dyn Sdk, RawHandle) -> NativeResult<T>) -> Result<T> {
        let raw = self.raw()?;
        f(self.sdk(), raw).map_err(|e| self.shared.report(e))
    }

    /// Swap in a new native handle, releasing whatever was held before.
    pub(crate) fn replace(&self, raw: RawHandle) {
        let old = self.raw.swap(raw.get(), Ordering::AcqRel);
        if let Some(old) = RawHandle::new(old) {
            if old != raw {
                self.sdk().release(self.kind, old);
            }
        }
    }

    /// Release the native handle but stay tracked. Returns false if nothing
    /// was held.
    pub(crate) fn release_backing(&self) -> bool {
        match RawHandle::new(self.raw.swap(0, Ordering::AcqRel)) {
            Some(old) => {
                self.sdk().release(self.kind, old);
                true
            }
            None => false,
        }
    }
}

impl Destroyable for Handle {
    fn destroy(&self) {
        if self.release_backing() {
            log::trace!("destroyed {}", self.kind.name());
        }
        self.shared.registry.untrack(self as *const Handle);
    }

    fn label(&self) -> &'static str {
        self.kind.name()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.release_backing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::SimSdk;
    use crate::{Runtime, Settings};

    fn runtime() -> (Arc<SimSdk>, Runtime) {
        let sdk = Arc::new(SimSdk::new());
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        (sdk, rt)
    }

    #[test]
    fn test_destroy_is_idempotent_and_detected() {
        let (sdk, rt) = runtime();
        let raw = sdk.create_config().unwrap();
        let handle = Handle::adopt(rt.shared(), HandleKind::Config, raw);
        assert_eq!(rt.registry().len(), 1);

        handle.destroy();
        handle.destroy();
        assert_eq!(sdk.double_releases(), 0);
        assert_eq!(sdk.live_handles(), 0);
        assert!(rt.registry().is_empty());

        let err = handle.call(|sdk, raw| sdk.config_enable_all_streams(raw)).unwrap_err();
        assert!(matches!(err, DepthlinkError::Destroyed("config")));
    }

    #[test]
    fn test_drop_releases() {
        let (sdk, rt) = runtime();
        let raw = sdk.create_config().unwrap();
        drop(Handle::adopt(rt.shared(), HandleKind::Config, raw));
        assert_eq!(sdk.live_handles(), 0);
        assert!(rt.registry().is_empty());
    }

    #[test]
    fn test_replace_releases_previous() {
        let (sdk, rt) = runtime();
        let a = sdk.create_config().unwrap();
        let b = sdk.create_config().unwrap();
        let handle = Handle::adopt(rt.shared(), HandleKind::Config, a);
        handle.replace(b);
        assert_eq!(sdk.live_handles(), 1);
        assert_eq!(handle.raw().unwrap(), b);

        assert!(handle.release_backing());
        assert!(!handle.release_backing());
        assert_eq!(sdk.live_handles(), 0);
        // Detached, still tracked.
        assert_eq!(rt.registry().len(), 1);
    }
}
