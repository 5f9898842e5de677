use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::sensor::Sensor;
use crate::types::CameraInfo;
use crate::Result;

/// A capture device.
pub struct Device {
    handle: Arc<Handle>,
}

impl Device {
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle) -> Self {
        Self {
            handle: Handle::adopt(shared, HandleKind::Device, raw),
        }
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    pub fn supports_camera_info(&self, info: CameraInfo) -> Result<bool> {
        self.handle.call(|sdk, dev| sdk.supports_device_info(dev, info))
    }

    /// Value of `info`, or `None` if the device doesn't report that field.
    pub fn camera_info(&self, info: CameraInfo) -> Result<Option<String>> {
        if !self.supports_camera_info(info)? {
            return Ok(None);
        }
        self.handle
            .call(|sdk, dev| sdk.device_info(dev, info))
            .map(Some)
    }

    /// Every camera info field the device supports.
    pub fn camera_info_all(&self) -> Result<BTreeMap<CameraInfo, String>> {
        let mut all = BTreeMap::new();
        for &info in CameraInfo::ALL {
            if let Some(value) = self.camera_info(info)? {
                all.insert(info, value);
            }
        }
        Ok(all)
    }

    /// Power-cycle the device. It disconnects and re-enumerates afterwards.
    pub fn hardware_reset(&self) -> Result<()> {
        log::info!("hardware reset requested");
        self.handle.call(|sdk, dev| sdk.hardware_reset(dev))
    }

    pub fn query_sensors(&self) -> Result<Vec<Sensor>> {
        let raws = self.handle.call(|sdk, dev| sdk.query_sensors(dev))?;
        Ok(raws
            .into_iter()
            .map(|raw| Sensor::adopt(self.handle.shared(), raw))
            .collect())
    }

    pub fn first_sensor(&self) -> Result<Option<Sensor>> {
        Ok(self.query_sensors()?.into_iter().next())
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::{Runtime, Settings};

    fn first_device(sdk: &Arc<SimSdk>) -> (Runtime, Device) {
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let dev = rt
            .context()
            .unwrap()
            .query_devices()
            .unwrap()
            .unwrap()
            .device(0)
            .unwrap()
            .unwrap();
        (rt, dev)
    }

    #[test]
    fn test_camera_info() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("823112060")]));
        let (_rt, dev) = first_device(&sdk);
        assert_eq!(
            dev.camera_info(CameraInfo::SerialNumber).unwrap().as_deref(),
            Some("823112060")
        );
        assert_eq!(dev.camera_info(CameraInfo::DebugOpCode).unwrap(), None);

        let all = dev.camera_info_all().unwrap();
        assert!(all.contains_key(&CameraInfo::Name));
        assert!(all.contains_key(&CameraInfo::FirmwareVersion));
        assert!(!all.contains_key(&CameraInfo::DebugOpCode));
    }

    #[test]
    fn test_sensors_and_reset() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("1")]));
        let (_rt, dev) = first_device(&sdk);
        assert_eq!(dev.query_sensors().unwrap().len(), 2);
        assert!(dev.first_sensor().unwrap().is_some());
        dev.hardware_reset().unwrap();
        assert_eq!(sdk.hardware_resets(), 1);
    }

    #[test]
    fn test_use_after_destroy() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("1")]));
        let (_rt, dev) = first_device(&sdk);
        dev.destroy();
        assert!(dev.is_destroyed());
        assert!(dev.query_sensors().unwrap_err().is_destroyed());
        assert!(dev.hardware_reset().unwrap_err().is_destroyed());
    }
}
