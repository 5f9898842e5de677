use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::event::EventBridge;
use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::sensor::Sensor;
use crate::Result;

/// Payload of a hot-plug event. Either side is `None` when the SDK supplied
/// no list for it.
#[derive(Debug)]
pub struct DevicesChanged {
    pub removed: Option<DeviceList>,
    pub added: Option<DeviceList>,
}

/// Owner of the native capture context.
pub struct Context {
    handle: Arc<Handle>,
    devices_changed: EventBridge<DevicesChanged>,
}

impl Context {
    pub(crate) fn create(shared: &Arc<Shared>) -> Result<Self> {
        let raw = shared.sdk.create_context().map_err(|e| shared.report(e))?;
        log::debug!("context created");
        Ok(Self {
            handle: Handle::adopt(shared, HandleKind::Context, raw),
            devices_changed: EventBridge::new(
                "devices-changed",
                shared.settings.delivery,
                shared.queue.clone(),
            ),
        })
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        self.handle.shared()
    }

    /// Devices attached right now. The list is a snapshot and does not follow
    /// later hot-plug changes.
    pub fn query_devices(&self) -> Result<Option<DeviceList>> {
        let list = self.handle.call(|sdk, ctx| sdk.query_devices(ctx))?;
        Ok(list.map(|raw| DeviceList::adopt(self.shared(), raw)))
    }

    /// Every sensor of every device currently attached.
    pub fn query_sensors(&self) -> Result<Vec<Sensor>> {
        let Some(list) = self.query_devices()? else {
            return Ok(Vec::new());
        };
        let mut sensors = Vec::new();
        for device in list.devices()? {
            sensors.extend(device.query_sensors()?);
        }
        Ok(sensors)
    }

    /// The device owning `sensor`, or `None` if it cannot be resolved.
    pub fn sensor_parent(&self, sensor: &Sensor) -> Result<Option<Device>> {
        self.raw()?;
        let device = sensor
            .handle()
            .call(|sdk, raw| sdk.create_device_from_sensor(raw))?;
        Ok(device.map(|raw| Device::adopt(self.shared(), raw)))
    }

    /// Subscribe to hot-plug events. The native callback is installed once,
    /// on the first subscription.
    pub fn on_devices_changed<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&DevicesChanged) + Send + Sync + 'static,
    {
        self.devices_changed.subscribe(listener, |emitter| {
            let weak = Arc::downgrade(self.shared());
            self.handle.call(|sdk, ctx| {
                sdk.set_devices_changed_callback(
                    ctx,
                    Box::new(move |removed, added| {
                        let Some(shared) = weak.upgrade() else {
                            log::warn!("devices-changed fired after runtime shutdown");
                            return;
                        };
                        log::debug!(
                            "devices changed: removed={} added={}",
                            removed.is_some(),
                            added.is_some()
                        );
                        emitter.emit(DevicesChanged {
                            removed: removed.map(|raw| DeviceList::adopt(&shared, raw)),
                            added: added.map(|raw| DeviceList::adopt(&shared, raw)),
                        });
                    }),
                )
            })
        })
    }

    /// Release the native context. Safe to call more than once.
    pub fn destroy(&self) {
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("destroyed", &self.is_destroyed())
            .field("listeners", &self.devices_changed.listener_count())
            .finish()
    }
}

/// Snapshot of attached devices.
pub struct DeviceList {
    handle: Arc<Handle>,
}

impl DeviceList {
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle) -> Self {
        Self {
            handle: Handle::adopt(shared, HandleKind::DeviceList, raw),
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.handle.call(|sdk, list| sdk.device_count(list))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Device at `index`, or `None` past the end.
    pub fn device(&self, index: usize) -> Result<Option<Device>> {
        if index >= self.len()? {
            return Ok(None);
        }
        let raw = self.handle.call(|sdk, list| sdk.create_device(list, index))?;
        Ok(Some(Device::adopt(self.handle.shared(), raw)))
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        let count = self.len()?;
        (0..count)
            .map(|i| {
                let raw = self.handle.call(|sdk, list| sdk.create_device(list, i))?;
                Ok(Device::adopt(self.handle.shared(), raw))
            })
            .collect()
    }

    pub fn contains(&self, device: &Device) -> Result<bool> {
        let device = device.raw()?;
        self.handle
            .call(|sdk, list| sdk.device_list_contains(list, device))
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for DeviceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceList")
            .field("destroyed", &!self.handle.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDelivery;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::types::CameraInfo;
    use crate::{Runtime, Settings};
    use std::sync::Mutex;

    fn setup(devices: Vec<SimDevice>) -> (Arc<SimSdk>, Runtime) {
        let sdk = Arc::new(SimSdk::with_devices(devices));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        (sdk, rt)
    }

    #[test]
    fn test_query_devices_is_a_snapshot() {
        let (sdk, rt) = setup(vec![SimDevice::d400("A1")]);
        let ctx = rt.context().unwrap();
        let list = ctx.query_devices().unwrap().unwrap();
        assert_eq!(list.len().unwrap(), 1);

        sdk.connect(SimDevice::d400("B2"));
        assert_eq!(list.len().unwrap(), 1);
        assert_eq!(ctx.query_devices().unwrap().unwrap().len().unwrap(), 2);
        assert!(list.device(5).unwrap().is_none());
    }

    #[test]
    fn test_devices_changed_fans_out_single_registration() {
        let (sdk, rt) = setup(vec![SimDevice::d400("A1")]);
        let ctx = rt.context().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let log = log.clone();
            ctx.on_devices_changed(move |ev| {
                let added = ev.added.as_ref().map(|l| l.len().unwrap());
                let removed = ev.removed.as_ref().map(|l| l.len().unwrap());
                log.lock().unwrap().push((id, removed, added));
            })
            .unwrap();
        }
        assert_eq!(sdk.callback_registrations(), 1);

        sdk.connect(SimDevice::d400("B2"));
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, None, Some(1)), (1, None, Some(1)), (2, None, Some(1))]
        );

        log.lock().unwrap().clear();
        assert!(sdk.disconnect("A1"));
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(log.lock().unwrap()[0], (0, Some(1), None));
        assert_eq!(sdk.double_releases(), 0);
    }

    #[test]
    fn test_devices_changed_added_list_resolves_device() {
        let (sdk, rt) = setup(Vec::new());
        let ctx = rt.context().unwrap();
        let serials = Arc::new(Mutex::new(Vec::new()));
        let s = serials.clone();
        ctx.on_devices_changed(move |ev| {
            if let Some(added) = &ev.added {
                for d in added.devices().unwrap() {
                    s.lock().unwrap().push(d.camera_info(CameraInfo::SerialNumber).unwrap());
                }
            }
        })
        .unwrap();
        sdk.connect(SimDevice::d400("C3"));
        assert_eq!(*serials.lock().unwrap(), vec![Some("C3".to_string())]);
    }

    #[test]
    fn test_queued_devices_changed() {
        let sdk = Arc::new(SimSdk::new());
        let rt = Runtime::with_settings(
            sdk.clone(),
            Settings::default().with_delivery(EventDelivery::Queued),
        );
        let ctx = rt.context().unwrap();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        ctx.on_devices_changed(move |_| *h.lock().unwrap() += 1).unwrap();

        sdk.connect(SimDevice::d400("Q1"));
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(rt.dispatch_events(), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_sensor_parent_and_contains() {
        let (sdk, rt) = setup(vec![SimDevice::d400("A1")]);
        let ctx = rt.context().unwrap();
        let sensors = ctx.query_sensors().unwrap();
        assert_eq!(sensors.len(), 2);

        let parent = ctx.sensor_parent(&sensors[1]).unwrap().unwrap();
        assert_eq!(
            parent.camera_info(CameraInfo::SerialNumber).unwrap().as_deref(),
            Some("A1")
        );
        let list = ctx.query_devices().unwrap().unwrap();
        assert!(list.contains(&parent).unwrap());

        sdk.disconnect("A1");
        assert!(ctx.sensor_parent(&sensors[0]).unwrap().is_none());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (sdk, rt) = setup(vec![SimDevice::d400("A1")]);
        let ctx = rt.context().unwrap();
        ctx.destroy();
        ctx.destroy();
        assert!(ctx.is_destroyed());
        assert!(ctx.query_devices().unwrap_err().is_destroyed());
        assert!(ctx.on_devices_changed(|_| {}).unwrap_err().is_destroyed());
        assert_eq!(sdk.double_releases(), 0);
        assert_eq!(sdk.live_handles(), 0);
    }
}
