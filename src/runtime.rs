use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::Config;
use crate::context::Context;
use crate::error::{DepthlinkError, NativeError};
use crate::event::{EventBridge, EventDelivery, EventQueue};
use crate::native::Sdk;
use crate::pipeline::Pipeline;
use crate::processing::{Align, Colorizer, Syncer};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::types::{Notification, StreamKind};
use crate::Result;

/// State every wrapper reaches through its handle.
pub(crate) struct Shared {
    pub(crate) sdk: Arc<dyn Sdk>,
    pub(crate) registry: Registry,
    pub(crate) settings: Settings,
    pub(crate) errors: EventBridge<NativeError>,
    pub(crate) queue: EventQueue,
    /// Notification bridges keyed by physical sensor, shared by every wrapper
    /// of that sensor.
    notifications: Mutex<HashMap<String, EventBridge<Notification>>>,
}

impl Shared {
    /// Log a native failure, fan it out to error listeners and turn it into
    /// the crate error.
    pub(crate) fn report(&self, err: NativeError) -> DepthlinkError {
        log::error!(
            "{} (kind={:?}, recoverable={})",
            err,
            err.kind,
            err.recoverable()
        );
        self.errors.emit(err.clone());
        DepthlinkError::Native(err)
    }

    pub(crate) fn notification_bridge(&self, sensor_key: String) -> EventBridge<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sensor_key)
            .or_insert_with(|| {
                EventBridge::new("sensor-notification", self.settings.delivery, self.queue.clone())
            })
            .clone()
    }
}

/// Composition root: owns the SDK, the resource registry and event plumbing.
///
/// Every object created from a runtime is tracked, and [`Runtime::cleanup`]
/// destroys whatever is still alive.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Runtime configured from `DEPTHLINK_*` environment variables.
    pub fn new(sdk: Arc<dyn Sdk>) -> Self {
        Self::with_settings(sdk, Settings::from_env())
    }

    pub fn with_settings(sdk: Arc<dyn Sdk>, settings: Settings) -> Self {
        let queue = EventQueue::new();
        let shared = Arc::new(Shared {
            sdk,
            registry: Registry::new(),
            settings,
            // Errors are reported synchronously on the failing thread.
            errors: EventBridge::new("native-error", EventDelivery::Immediate, queue.clone()),
            queue,
            notifications: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&shared);
        shared.sdk.set_error_callback(Box::new(move |err| match weak.upgrade() {
            Some(shared) => {
                shared.report(err);
            }
            None => log::warn!("native error after runtime shutdown: {}", err),
        }));

        log::info!(
            "runtime ready: waitTimeout={}ms delivery={:?} indexMatch={:?}",
            settings.wait_timeout.as_millis(),
            settings.delivery,
            settings.index_match
        );
        Runtime { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn context(&self) -> Result<Context> {
        Context::create(&self.shared)
    }

    /// Pipeline over a fresh context of its own.
    pub fn pipeline(&self) -> Result<Pipeline> {
        Pipeline::create(self.context()?)
    }

    /// Pipeline that takes ownership of `context`.
    pub fn pipeline_with_context(&self, context: Context) -> Result<Pipeline> {
        Pipeline::create(context)
    }

    pub fn config(&self) -> Result<Config> {
        Config::create(&self.shared)
    }

    /// Block that maps the other streams of a bundle onto `target`.
    pub fn align(&self, target: StreamKind) -> Result<Align> {
        Align::create(&self.shared, target)
    }

    pub fn colorizer(&self) -> Result<Colorizer> {
        Colorizer::create(&self.shared)
    }

    pub fn syncer(&self) -> Result<Syncer> {
        Syncer::create(&self.shared)
    }

    /// Milliseconds on the SDK's clock, comparable with system-time frame
    /// timestamps.
    pub fn time(&self) -> Result<f64> {
        self.shared.sdk.time().map_err(|e| self.shared.report(e))
    }

    /// Subscribe to every native failure: errors returned from calls as well
    /// as errors the SDK raises asynchronously.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&NativeError) + Send + Sync + 'static,
    {
        self.shared.errors.add_listener(listener);
    }

    /// Run queued events (see [`EventDelivery::Queued`]).
    pub fn dispatch_events(&self) -> usize {
        self.shared.queue.dispatch_pending()
    }

    /// Block up to `timeout` for queued events and run them.
    pub fn wait_events(&self, timeout: Duration) -> usize {
        self.shared.queue.wait(timeout)
    }

    pub fn pending_events(&self) -> usize {
        self.shared.queue.pending()
    }

    /// Destroy every live object created through this runtime, newest first.
    ///
    /// Undelivered queued events are dropped first so the native resources
    /// they carry are released too. Returns the number of objects destroyed.
    pub fn cleanup(&self) -> usize {
        let discarded = self.shared.queue.discard_pending();
        let destroyed = self.shared.registry.cleanup_all();
        log::info!(
            "cleanup: destroyed {} objects, discarded {} pending events",
            destroyed,
            discarded
        );
        destroyed
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("settings", &self.shared.settings)
            .field("registry", &self.shared.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NativeErrorKind;
    use crate::native::sim::{SimDevice, SimSdk};
    use std::sync::Mutex;

    #[test]
    fn test_cleanup_releases_everything() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("0001")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());

        let ctx = rt.context().unwrap();
        let devices = ctx.query_devices().unwrap().unwrap();
        let device = devices.device(0).unwrap().unwrap();
        let sensors = device.query_sensors().unwrap();
        let mut pipe = rt.pipeline().unwrap();
        pipe.start().unwrap();
        sdk.deliver_all();
        assert!(pipe.wait_for_frames().unwrap().is_some());
        assert!(sdk.live_handles() > 0);

        let destroyed = rt.cleanup();
        assert!(destroyed >= 6, "destroyed {}", destroyed);
        assert_eq!(sdk.live_handles(), 0);
        assert!(rt.registry().is_empty());

        assert!(ctx.query_devices().unwrap_err().is_destroyed());
        assert!(sensors[0].stream_profiles().unwrap_err().is_destroyed());
        assert!(pipe.wait_for_frames().unwrap_err().is_destroyed());

        // Dropping the husks afterwards must not release twice.
        drop((ctx, devices, device, sensors, pipe));
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_errors_reach_on_error_listeners() {
        let sdk = Arc::new(SimSdk::new());
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        rt.on_error(move |e| s.lock().unwrap().push(e.function.clone()));

        sdk.fail_next("rs2_create_config", "out of memory");
        let err = rt.config().unwrap_err();
        assert_eq!(err.native().map(|e| e.function.as_str()), Some("rs2_create_config"));

        sdk.raise_async_error(NativeError::new(
            "rs2_usb_poll",
            "device io failure",
            NativeErrorKind::Io,
        ));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["rs2_create_config".to_string(), "rs2_usb_poll".to_string()]
        );
    }

    #[test]
    fn test_cleanup_discards_queued_events() {
        let sdk = Arc::new(SimSdk::new());
        let settings = Settings::default().with_delivery(EventDelivery::Queued);
        let rt = Runtime::with_settings(sdk.clone(), settings);
        let ctx = rt.context().unwrap();
        ctx.on_devices_changed(|_| panic!("discarded")).unwrap();

        sdk.connect(SimDevice::d400("0002"));
        assert_eq!(rt.pending_events(), 1);
        rt.cleanup();
        assert_eq!(rt.pending_events(), 0);
        assert_eq!(sdk.live_handles(), 0);
    }
}
