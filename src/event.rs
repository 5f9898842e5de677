//! One native callback slot, many listeners.
//!
//! The SDK lets each object carry a single callback. [`EventBridge`] installs
//! exactly one adapter into that slot on the first subscription and fans every
//! event out to all listeners in subscription order. Later subscriptions only
//! extend the listener list. Listeners cannot be removed; they live as long as
//! the owning wrapper.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::DepthlinkError;
use crate::Result;

/// Where bridged events run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventDelivery {
    /// Listeners run on whichever thread the SDK fires the callback from.
    #[default]
    Immediate,
    /// Events are queued and run by `Runtime::dispatch_events` on the
    /// application's thread.
    Queued,
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Job = Box<dyn FnOnce() + Send>;

/// Hand-off from SDK threads to the application thread.
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    fn push(&self, job: Job) -> Result<()> {
        self.tx.send(job).map_err(|_| DepthlinkError::EventQueueClosed)
    }

    /// Run every queued event. Returns how many ran.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Block up to `timeout` for the first event, then drain the rest.
    pub fn wait(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job();
                1 + self.dispatch_pending()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Drop queued events without running them. Their payloads (and any native
    /// handles inside) are released.
    pub fn discard_pending(&self) -> usize {
        let mut dropped = 0;
        while let Ok(job) = self.rx.try_recv() {
            drop(job);
            dropped += 1;
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

struct BridgeInner<E> {
    name: &'static str,
    listeners: Mutex<Vec<Listener<E>>>,
    installed: Mutex<bool>,
    delivery: EventDelivery,
    queue: EventQueue,
}

impl<E> BridgeInner<E> {
    fn fan_out(&self, event: &E) {
        // Snapshot so listeners may subscribe from inside a callback.
        let listeners: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        log::trace!("{}: delivering to {} listeners", self.name, listeners.len());
        for listener in &listeners {
            listener(event);
        }
    }
}

/// Publish/subscribe surface over a single native callback slot.
pub struct EventBridge<E> {
    inner: Arc<BridgeInner<E>>,
}

impl<E> Clone for EventBridge<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + 'static> EventBridge<E> {
    pub fn new(name: &'static str, delivery: EventDelivery, queue: EventQueue) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                name,
                listeners: Mutex::new(Vec::new()),
                installed: Mutex::new(false),
                delivery,
                queue,
            }),
        }
    }

    /// Add `listener`. On the first call `install` receives the [`Emitter`]
    /// the native adapter should fire; if it fails nothing is registered and
    /// the next subscription tries again.
    pub fn subscribe<F, I>(&self, listener: F, install: I) -> Result<()>
    where
        F: Fn(&E) + Send + Sync + 'static,
        I: FnOnce(Emitter<E>) -> Result<()>,
    {
        let mut installed = self
            .inner
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*installed {
            install(self.emitter())?;
            *installed = true;
            log::debug!("{}: native callback installed", self.inner.name);
        }
        self.add_listener(listener);
        Ok(())
    }

    /// Append a listener without touching the native slot.
    pub(crate) fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub(crate) fn emitter(&self) -> Emitter<E> {
        Emitter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn emit(&self, event: E) {
        self.emitter().emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_installed(&self) -> bool {
        *self
            .inner
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle the native adapter uses to publish. Holds the bridge weakly so the
/// SDK's callback slot never keeps a dropped wrapper alive.
pub struct Emitter<E> {
    inner: Weak<BridgeInner<E>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + 'static> Emitter<E> {
    /// Publish `event`. Returns false if the owning bridge is gone, in which
    /// case the event is dropped.
    pub fn emit(&self, event: E) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            log::warn!("event fired after its owner was dropped; discarding");
            return false;
        };
        match inner.delivery {
            EventDelivery::Immediate => {
                inner.fan_out(&event);
                true
            }
            EventDelivery::Queued => {
                let weak = self.inner.clone();
                let job: Job = Box::new(move || match weak.upgrade() {
                    Some(inner) => inner.fan_out(&event),
                    None => log::warn!("queued event outlived its owner; discarding"),
                });
                match inner.queue.push(job) {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("{}: {}", inner.name, e);
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bridge(delivery: EventDelivery) -> (EventBridge<u32>, EventQueue) {
        let queue = EventQueue::new();
        (EventBridge::new("test", delivery, queue.clone()), queue)
    }

    #[test]
    fn test_single_install_many_listeners_in_order() {
        let (bridge, _queue) = bridge(EventDelivery::Immediate);
        let installs = AtomicUsize::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = None;

        for id in 0..3 {
            let seen = seen.clone();
            bridge
                .subscribe(
                    move |e: &u32| seen.lock().unwrap().push((id, *e)),
                    |em| {
                        installs.fetch_add(1, Ordering::SeqCst);
                        emitter = Some(em);
                        Ok(())
                    },
                )
                .unwrap();
        }
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.listener_count(), 3);

        let emitter = emitter.unwrap();
        assert!(emitter.emit(7));
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_failed_install_registers_nothing() {
        let (bridge, _queue) = bridge(EventDelivery::Immediate);
        let err = bridge
            .subscribe(|_: &u32| {}, |_| Err(DepthlinkError::Destroyed("context")))
            .unwrap_err();
        assert!(err.is_destroyed());
        assert!(!bridge.is_installed());
        assert_eq!(bridge.listener_count(), 0);

        bridge.subscribe(|_: &u32| {}, |_| Ok(())).unwrap();
        assert!(bridge.is_installed());
        assert_eq!(bridge.listener_count(), 1);
    }

    #[test]
    fn test_queued_delivery_runs_on_dispatch() {
        let (bridge, queue) = bridge(EventDelivery::Queued);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bridge.add_listener(move |e: &u32| {
            h.fetch_add(*e as usize, Ordering::SeqCst);
        });

        let emitter = bridge.emitter();
        let worker = std::thread::spawn(move || {
            emitter.emit(2);
            emitter.emit(3);
        });
        worker.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.dispatch_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(queue.wait(Duration::from_millis(1)), 0);
    }

    #[test]
    fn test_discard_drops_payloads() {
        let queue = EventQueue::new();
        let bridge: EventBridge<Arc<()>> = EventBridge::new("test", EventDelivery::Queued, queue.clone());
        bridge.add_listener(|_| panic!("discarded events must not run"));
        let payload = Arc::new(());
        bridge.emit(payload.clone());
        assert_eq!(Arc::strong_count(&payload), 2);
        assert_eq!(queue.discard_pending(), 1);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_emit_after_owner_dropped() {
        let (bridge, _queue) = bridge(EventDelivery::Immediate);
        let emitter = bridge.emitter();
        drop(bridge);
        assert!(!emitter.emit(1));
    }

    #[test]
    fn test_listener_may_subscribe_during_fan_out() {
        let (bridge, _queue) = bridge(EventDelivery::Immediate);
        let b = bridge.clone();
        bridge.add_listener(move |_: &u32| b.add_listener(|_| {}));
        bridge.emit(1);
        assert_eq!(bridge.listener_count(), 2);
    }
}
