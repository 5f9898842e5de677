//! Watch simulated hot-plug events, delivered on the application thread.

use std::sync::Arc;
use std::time::Duration;

use depthlink::native::sim::{SimDevice, SimSdk};
use depthlink::settings::Settings;
use depthlink::{CameraInfo, EventDelivery, Runtime};

fn main() {
    env_logger::init();

    let sdk = Arc::new(SimSdk::new());
    let settings = Settings::from_env().with_delivery(EventDelivery::Queued);
    let rt = Runtime::with_settings(sdk.clone(), settings);

    let ctx = match rt.context() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let subscribed = ctx.on_devices_changed(|event| {
        if let Some(added) = &event.added {
            for device in added.devices().unwrap_or_default() {
                let name = device.camera_info(CameraInfo::Name).ok().flatten();
                println!("added   {}", name.unwrap_or_default());
            }
        }
        if let Some(removed) = &event.removed {
            println!("removed {} device(s)", removed.len().unwrap_or(0));
        }
    });
    if let Err(e) = subscribed {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let feeder = {
        let sdk = sdk.clone();
        std::thread::spawn(move || {
            sdk.connect(SimDevice::d400("f0000001"));
            std::thread::sleep(Duration::from_millis(50));
            sdk.connect(SimDevice::tracking("t0000001"));
            std::thread::sleep(Duration::from_millis(50));
            sdk.disconnect("f0000001");
        })
    };

    let mut seen = 0;
    while seen < 3 {
        seen += rt.wait_events(Duration::from_secs(1));
    }
    let _ = feeder.join();
    rt.cleanup();
}
