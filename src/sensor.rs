use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::stream_profile::StreamProfile;
use crate::types::{CameraInfo, Notification, OptionRange, RegionOfInterest, SensorCapabilities, SensorOption};
use crate::Result;

/// One sensor of a device (stereo module, RGB camera, motion module...).
pub struct Sensor {
    handle: Arc<Handle>,
}

impl Sensor {
    pub(crate) fn adopt(shared: &Arc<Shared>, raw: RawHandle) -> Self {
        Self {
            handle: Handle::adopt(shared, HandleKind::Sensor, raw),
        }
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn supports_camera_info(&self, info: CameraInfo) -> Result<bool> {
        self.handle.call(|sdk, s| sdk.supports_sensor_info(s, info))
    }

    pub fn camera_info(&self, info: CameraInfo) -> Result<Option<String>> {
        if !self.supports_camera_info(info)? {
            return Ok(None);
        }
        self.handle.call(|sdk, s| sdk.sensor_info(s, info)).map(Some)
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.camera_info(CameraInfo::Name)
    }

    pub fn capabilities(&self) -> Result<SensorCapabilities> {
        self.handle.call(|sdk, s| sdk.sensor_capabilities(s))
    }

    pub fn is_depth_sensor(&self) -> Result<bool> {
        Ok(self.capabilities()?.contains(SensorCapabilities::DEPTH))
    }

    pub fn is_roi_sensor(&self) -> Result<bool> {
        Ok(self.capabilities()?.contains(SensorCapabilities::ROI))
    }

    /// Meters per depth unit. `None` for sensors that don't produce depth.
    pub fn depth_scale(&self) -> Result<Option<f32>> {
        if !self.is_depth_sensor()? {
            return Ok(None);
        }
        self.handle.call(|sdk, s| sdk.depth_scale(s)).map(Some)
    }

    pub fn stream_profiles(&self) -> Result<Vec<StreamProfile>> {
        let raws = self.handle.call(|sdk, s| sdk.stream_profiles(s))?;
        let shared = self.handle.shared();
        let mut profiles = Vec::with_capacity(raws.len());
        let mut raws = raws.into_iter();
        while let Some(raw) = raws.next() {
            match StreamProfile::adopt(shared, raw) {
                Ok(p) => profiles.push(p),
                Err(e) => {
                    for rest in raws {
                        shared.sdk.release(HandleKind::StreamProfile, rest);
                    }
                    return Err(e);
                }
            }
        }
        Ok(profiles)
    }

    pub fn supports_option(&self, option: SensorOption) -> Result<bool> {
        self.handle.call(|sdk, s| sdk.supports_option(s, option))
    }

    /// Current value, or `None` if the sensor lacks the option.
    pub fn option(&self, option: SensorOption) -> Result<Option<f32>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle.call(|sdk, s| sdk.option_value(s, option)).map(Some)
    }

    pub fn set_option(&self, option: SensorOption, value: f32) -> Result<()> {
        log::debug!("set option {} = {}", option, value);
        self.handle.call(|sdk, s| sdk.set_option_value(s, option, value))
    }

    pub fn option_range(&self, option: SensorOption) -> Result<Option<OptionRange>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle.call(|sdk, s| sdk.option_range(s, option)).map(Some)
    }

    pub fn is_option_read_only(&self, option: SensorOption) -> Result<bool> {
        self.handle.call(|sdk, s| sdk.is_option_read_only(s, option))
    }

    pub fn option_description(&self, option: SensorOption) -> Result<Option<String>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle
            .call(|sdk, s| sdk.option_description(s, option))
            .map(Some)
    }

    /// Text for a specific value of an enumerated option, e.g. a preset name.
    pub fn option_value_description(&self, option: SensorOption, value: f32) -> Result<Option<String>> {
        if !self.supports_option(option)? {
            return Ok(None);
        }
        self.handle
            .call(|sdk, s| sdk.option_value_description(s, option, value))
    }

    /// Auto-exposure region of interest. `None` if the sensor has no ROI support.
    pub fn region_of_interest(&self) -> Result<Option<RegionOfInterest>> {
        if !self.is_roi_sensor()? {
            return Ok(None);
        }
        self.handle.call(|sdk, s| sdk.region_of_interest(s)).map(Some)
    }

    pub fn set_region_of_interest(&self, roi: RegionOfInterest) -> Result<()> {
        self.handle.call(|sdk, s| sdk.set_region_of_interest(s, roi))
    }

    /// Subscribe to sensor notifications. Severity and category codes are
    /// decoded before listeners see them.
    ///
    /// Listeners attach to the physical sensor: every wrapper of the same
    /// sensor shares one native registration.
    pub fn on_notification<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let key = self.handle.call(|sdk, s| sdk.sensor_key(s))?;
        let bridge = self.handle.shared().notification_bridge(key);
        bridge.subscribe(listener, |emitter| {
            self.handle.call(|sdk, s| {
                sdk.set_notifications_callback(
                    s,
                    Box::new(move |raw| {
                        let notification = Notification::from(raw);
                        log::debug!(
                            "sensor notification [{}] {}",
                            notification.category.map_or("unknown", |c| c.name()),
                            notification.description
                        );
                        emitter.emit(notification);
                    }),
                )
            })
        })
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        !self.handle.is_live()
    }
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimDevice, SimSdk};
    use crate::types::{LogSeverity, NotificationCategory, RawNotification, StreamKind};
    use crate::{Runtime, Settings};
    use std::sync::Mutex;

    fn sensors(sdk: &Arc<SimSdk>) -> (Runtime, Vec<Sensor>) {
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let sensors = rt.context().unwrap().query_sensors().unwrap();
        (rt, sensors)
    }

    #[test]
    fn test_depth_and_color_sensor_capabilities() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("1")]));
        let (_rt, sensors) = sensors(&sdk);
        let (depth, color) = (&sensors[0], &sensors[1]);

        assert!(depth.is_depth_sensor().unwrap());
        assert_eq!(depth.depth_scale().unwrap(), Some(0.001));
        assert!(!color.is_depth_sensor().unwrap());
        assert_eq!(color.depth_scale().unwrap(), None);
        assert_eq!(depth.name().unwrap().as_deref(), Some("Stereo Module"));

        let kinds: Vec<StreamKind> = depth
            .stream_profiles()
            .unwrap()
            .iter()
            .map(|p| p.kind())
            .collect();
        assert!(kinds.contains(&StreamKind::Depth));
        assert!(kinds.contains(&StreamKind::Infrared));
    }

    #[test]
    fn test_options() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("1")]));
        let (_rt, sensors) = sensors(&sdk);
        let depth = &sensors[0];

        let range = depth.option_range(SensorOption::LaserPower).unwrap().unwrap();
        assert!(range.contains(150.0));
        depth.set_option(SensorOption::LaserPower, 60.0).unwrap();
        assert_eq!(depth.option(SensorOption::LaserPower).unwrap(), Some(60.0));

        let err = depth.set_option(SensorOption::LaserPower, 9999.0).unwrap_err();
        assert!(err.native().unwrap().recoverable());

        assert_eq!(depth.option(SensorOption::Hue).unwrap(), None);
        assert!(depth.is_option_read_only(SensorOption::AsicTemperature).unwrap());
        assert_eq!(
            depth
                .option_value_description(SensorOption::EmitterEnabled, 1.0)
                .unwrap()
                .as_deref(),
            Some("On")
        );
        assert!(depth.option_description(SensorOption::Exposure).unwrap().is_some());
    }

    #[test]
    fn test_region_of_interest() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::tracking("T1")]));
        let (_tracking_rt, tracking_sensors) = sensors(&sdk);
        let tracking = &tracking_sensors[0];
        assert_eq!(tracking.region_of_interest().unwrap(), None);
        assert!(tracking
            .set_region_of_interest(RegionOfInterest::default())
            .is_err());

        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("1")]));
        let (_rt, stereo) = sensors(&sdk);
        let roi = RegionOfInterest {
            min_x: 10,
            min_y: 20,
            max_x: 300,
            max_y: 200,
        };
        stereo[0].set_region_of_interest(roi).unwrap();
        assert_eq!(stereo[0].region_of_interest().unwrap(), Some(roi));
    }

    #[test]
    fn test_notifications_are_decorated_and_fanned_out() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("N1")]));
        let (_rt, sensors) = sensors(&sdk);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let seen = seen.clone();
            sensors[0]
                .on_notification(move |n| {
                    seen.lock().unwrap().push((id, n.severity, n.category, n.description.clone()))
                })
                .unwrap();
        }
        assert_eq!(sdk.callback_registrations(), 1);

        assert!(sdk.notify(
            "N1",
            0,
            RawNotification {
                description: "Frames didn't arrived within 5 seconds".into(),
                timestamp: 1.0,
                severity: 2,
                category: 0,
                serialized_data: String::new(),
            }
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[1].0, 1);
        assert_eq!(seen[0].1, Some(LogSeverity::Warn));
        assert_eq!(seen[0].2, Some(NotificationCategory::FramesTimeout));
    }

    #[test]
    fn test_wrappers_of_one_sensor_share_a_registration() {
        let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("N2")]));
        let rt = Runtime::with_settings(sdk.clone(), Settings::default());
        let ctx = rt.context().unwrap();
        let first = ctx.query_sensors().unwrap();
        let second = ctx.query_sensors().unwrap();

        let hits = Arc::new(Mutex::new(Vec::new()));
        for (id, sensors) in [(0, &first), (1, &second)] {
            let hits = hits.clone();
            sensors[0]
                .on_notification(move |_| hits.lock().unwrap().push(id))
                .unwrap();
        }
        assert_eq!(sdk.callback_registrations(), 1);

        // A different physical sensor gets its own registration.
        second[1].on_notification(|_| {}).unwrap();
        assert_eq!(sdk.callback_registrations(), 2);

        assert!(sdk.notify(
            "N2",
            0,
            RawNotification {
                description: "hardware error".into(),
                timestamp: 2.0,
                severity: 3,
                category: 2,
                serialized_data: String::new(),
            }
        ));
        assert_eq!(*hits.lock().unwrap(), vec![0, 1]);
    }
}
