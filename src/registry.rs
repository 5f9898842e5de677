//! Process-level list of live wrapper objects.

use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Anything that owns native resources and can give them back early.
///
/// `destroy` must be idempotent: the second and later calls are no-ops.
pub trait Destroyable: Send + Sync {
    fn destroy(&self);

    /// Object kind, for logs.
    fn label(&self) -> &'static str;
}

/// Tracks live [`Destroyable`]s so [`Registry::cleanup_all`] can tear them all
/// down. Entries are weak; an object dropped normally just falls out.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<Vec<Weak<dyn Destroyable>>>>,
}

fn data_ptr<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `obj`. Tracking an object twice has no effect.
    pub fn track<D: Destroyable + 'static>(&self, obj: &Arc<D>) {
        let target = data_ptr(Arc::as_ptr(obj));
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|w| w.strong_count() > 0);
        if entries.iter().any(|w| data_ptr(w.as_ptr()) == target) {
            return;
        }
        let obj: Arc<dyn Destroyable> = obj.clone();
        entries.push(Arc::downgrade(&obj));
    }

    /// Stop tracking the object at `target`. Unknown pointers are ignored.
    pub fn untrack<T: ?Sized>(&self, target: *const T) {
        let target = data_ptr(target);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|w| w.strong_count() > 0 && data_ptr(w.as_ptr()) != target);
    }

    pub fn contains<T: ?Sized>(&self, target: *const T) -> bool {
        let target = data_ptr(target);
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .any(|w| w.strong_count() > 0 && data_ptr(w.as_ptr()) == target)
    }

    /// Number of live tracked objects.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every live tracked object, newest first, and empty the registry.
    ///
    /// Destructors run outside the lock and may track or untrack. An object
    /// that an earlier destructor already untracked is skipped, so each one is
    /// destroyed once. Returns how many live objects went down, whether
    /// directly or through their owner.
    pub fn cleanup_all(&self) -> usize {
        let snapshot: Vec<Arc<dyn Destroyable>> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        let count = snapshot.len();
        for obj in snapshot.iter().rev() {
            let target = Arc::as_ptr(obj);
            if !self.contains(target) {
                log::trace!("cleanup: {} already destroyed by its owner", obj.label());
                continue;
            }
            log::trace!("cleanup: destroying {}", obj.label());
            obj.destroy();
            self.untrack(target);
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if count > 0 {
            log::debug!("cleanup destroyed {} tracked objects", count);
        }
        count
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        name: &'static str,
        destroyed: AtomicUsize,
        order: Arc<Mutex<Vec<&'static str>>>,
        registry: Registry,
        victim: Mutex<Option<Arc<Tracked>>>,
    }

    impl Tracked {
        fn new(name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>, registry: &Registry) -> Arc<Self> {
            Arc::new(Self {
                name,
                destroyed: AtomicUsize::new(0),
                order: order.clone(),
                registry: registry.clone(),
                victim: Mutex::new(None),
            })
        }
    }

    impl Destroyable for Tracked {
        fn destroy(&self) {
            if self.destroyed.fetch_add(1, Ordering::SeqCst) > 0 {
                return;
            }
            self.order.lock().unwrap().push(self.name);
            // Owners destroy their children, which untrack themselves.
            if let Some(child) = self.victim.lock().unwrap().take() {
                child.destroy();
                self.registry.untrack(Arc::as_ptr(&child));
            }
            self.registry.untrack(self as *const Tracked);
        }

        fn label(&self) -> &'static str {
            self.name
        }
    }

    #[test]
    fn test_track_is_idempotent() {
        let reg = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Tracked::new("a", &order, &reg);
        reg.track(&a);
        reg.track(&a);
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(Arc::as_ptr(&a)));
    }

    #[test]
    fn test_cleanup_reverse_order_exactly_once() {
        let reg = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = Tracked::new("context", &order, &reg);
        let pipe = Tracked::new("pipeline", &order, &reg);
        let frame = Tracked::new("frame", &order, &reg);
        reg.track(&ctx);
        reg.track(&pipe);
        reg.track(&frame);
        // The pipeline destroys its context itself while cleanup is running.
        *pipe.victim.lock().unwrap() = Some(ctx.clone());

        assert_eq!(reg.cleanup_all(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["frame", "pipeline", "context"]);
        for p in [&ctx, &pipe, &frame] {
            assert_eq!(p.destroyed.load(Ordering::SeqCst), 1, "{}", p.name);
        }
        assert!(reg.is_empty());
        assert_eq!(reg.cleanup_all(), 0);
    }

    #[test]
    fn test_dropped_objects_fall_out() {
        let reg = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Tracked::new("a", &order, &reg);
        reg.track(&a);
        drop(a);
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.cleanup_all(), 0);
        assert!(order.lock().unwrap().is_empty());
    }

    #[test]
    fn test_untrack_removes_entry() {
        let reg = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Tracked::new("a", &order, &reg);
        let b = Tracked::new("b", &order, &reg);
        reg.track(&a);
        reg.track(&b);
        reg.untrack(Arc::as_ptr(&a));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.cleanup_all(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["b"]);
    }
}
